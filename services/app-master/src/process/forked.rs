//! Supervisor for one external role process.
//!
//! Lifecycle: `NOT_STARTED -> STARTED -> TERMINATED`. The supervisor forks
//! the process, captures its recent output into a bounded ring buffer, and
//! arms a timeout watchdog once the process is confirmed started. The
//! watchdog and the natural-exit path race for a single atomic terminated
//! flag: exactly one of them wins, and the winner alone records the exit
//! code and sends the terminal notification.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Lines of process output retained, oldest dropped first.
pub const RECENT_OUTPUT_LINES: usize = 64;

/// How long a stopped process gets to honor SIGTERM before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Illegal-state and spawn errors from the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `build` was called when a process was already attached.
    #[error("process '{0}' already configured")]
    AlreadyBuilt(String),

    /// `start` was called before `build`.
    #[error("process '{0}' not yet configured")]
    NotBuilt(String),

    /// `start` was called twice.
    #[error("process '{0}' already started")]
    AlreadyStarted(String),

    /// The command vector was empty.
    #[error("process '{0}' given an empty command")]
    EmptyCommand(String),

    /// Spawning the child failed.
    #[error("failed to spawn '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Terminal notification for a supervised process.
///
/// Sent exactly once per process lifetime, whichever of natural exit,
/// timeout kill, or intentional stop gets there first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub name: String,
    pub exit_code: i32,

    /// Non-zero exit that was neither an intentional stop nor suppressed;
    /// the owning service is expected to treat this as an instance failure.
    pub failed: bool,

    /// The exit code is the synthetic timeout code, not the process's own.
    pub timed_out: bool,
}

#[derive(Debug)]
struct BuiltProcess {
    command: Vec<String>,
    env: HashMap<String, String>,
}

/// State shared between the supervisor handle, the watchdog, and the
/// output-capture tasks.
#[derive(Debug, Default)]
struct Shared {
    started: AtomicBool,

    /// The single-winner terminated flag. Transitions false->true exactly
    /// once; the path that wins the transition owns failure reporting.
    terminated: AtomicBool,

    /// Set by `stop()` before any kill is issued, so a racing natural exit
    /// is never reported as a failure.
    shutting_down: AtomicBool,

    exit_code: Mutex<Option<i32>>,
    recent_output: Mutex<VecDeque<String>>,
}

/// Manages one external process's lifecycle.
pub struct ForkedProcessSupervisor {
    name: String,
    built: Option<BuiltProcess>,
    command_line: String,
    timeout: Option<Duration>,
    timeout_exit_code: i32,
    shared: Arc<Shared>,
    stop_tx: Option<watch::Sender<bool>>,
    exit_tx: mpsc::Sender<ProcessExit>,
}

impl ForkedProcessSupervisor {
    /// Create a supervisor that reports its terminal event on `exit_tx`.
    pub fn new(name: impl Into<String>, exit_tx: mpsc::Sender<ProcessExit>) -> Self {
        Self {
            name: name.into(),
            built: None,
            command_line: String::new(),
            timeout: None,
            timeout_exit_code: 1,
            shared: Arc::new(Shared::default()),
            stop_tx: None,
            exit_tx,
        }
    }

    /// Arm a deadline. The countdown starts at start confirmation, not at
    /// the spawn request.
    pub fn set_timeout(&mut self, timeout: Duration, exit_code: i32) {
        self.timeout = Some(timeout);
        self.timeout_exit_code = exit_code;
    }

    /// Attach the command and environment to execute.
    pub fn build(
        &mut self,
        env: HashMap<String, String>,
        command: Vec<String>,
    ) -> Result<(), SupervisorError> {
        if self.built.is_some() {
            return Err(SupervisorError::AlreadyBuilt(self.name.clone()));
        }
        if command.is_empty() {
            return Err(SupervisorError::EmptyCommand(self.name.clone()));
        }

        self.command_line = command.join(" ");
        self.built = Some(BuiltProcess { command, env });
        Ok(())
    }

    /// Spawn the process and start supervision.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        let built = self
            .built
            .as_ref()
            .ok_or_else(|| SupervisorError::NotBuilt(self.name.clone()))?;
        if self.shared.started.load(Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyStarted(self.name.clone()));
        }

        let mut cmd = Command::new(&built.command[0]);
        cmd.args(&built.command[1..])
            .envs(&built.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            name: self.name.clone(),
            source,
        })?;

        self.shared.started.store(true, Ordering::SeqCst);
        info!(
            process = %self.name,
            command = %self.command_line,
            pid = ?child.id(),
            "Process started"
        );

        if let Some(stdout) = child.stdout.take() {
            spawn_capture(stdout, Arc::clone(&self.shared));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_capture(stderr, Arc::clone(&self.shared));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        tokio::spawn(monitor(
            self.name.clone(),
            child,
            Arc::clone(&self.shared),
            self.timeout,
            self.timeout_exit_code,
            stop_rx,
            self.exit_tx.clone(),
        ));

        Ok(())
    }

    /// Request the process stop.
    ///
    /// Idempotent: stopping a process that never started or has already
    /// terminated is a no-op. An intentional stop never reports failure,
    /// even if the process happens to exit non-zero while the stop is in
    /// flight.
    pub fn stop(&self) {
        // The flag must be visible before the kill can race a natural exit.
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        if let Some(tx) = &self.stop_tx {
            let _ = tx.send(true);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The joined command line, empty until `build`.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// The recorded exit code, once terminated.
    pub fn exit_code(&self) -> Option<i32> {
        *self.shared.exit_code.lock().unwrap()
    }

    /// Recent output lines, oldest first.
    pub fn recent_output(&self) -> Vec<String> {
        self.shared
            .recent_output
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect()
    }
}

/// Pump one output stream into the shared ring buffer.
fn spawn_capture<R>(stream: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut buffer = shared.recent_output.lock().unwrap();
            if buffer.len() >= RECENT_OUTPUT_LINES {
                buffer.pop_front();
            }
            buffer.push_back(line);
        }
    });
}

/// Watchdog: waits for natural exit, the deadline, or a stop request,
/// whichever comes first.
async fn monitor(
    name: String,
    mut child: Child,
    shared: Arc<Shared>,
    timeout: Option<Duration>,
    timeout_exit_code: i32,
    mut stop_rx: watch::Receiver<bool>,
    exit_tx: mpsc::Sender<ProcessExit>,
) {
    let pid = child.id().map(|p| Pid::from_raw(p as i32));

    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };

    let timed_out = tokio::select! {
        status = child.wait() => {
            let code = status.map(|s| s.code().unwrap_or(128)).unwrap_or(128);
            finish(&name, &shared, &exit_tx, code, false).await;
            return;
        }
        _ = deadline => true,
        _ = stop_rx.changed() => false,
    };

    if timed_out {
        // Claim the terminated flag before killing: the natural exit the
        // kill provokes must find the race already lost.
        warn!(
            process = %name,
            timeout_exit_code,
            "Process deadline exceeded, killing"
        );
        finish(&name, &shared, &exit_tx, timeout_exit_code, true).await;
    } else {
        // Intentional stop: completion with code 0, no failure.
        finish(&name, &shared, &exit_tx, 0, false).await;
    }

    terminate(&name, &mut child, pid).await;
}

/// Transition the terminated flag and, if this call wins, record the exit
/// code and send the single terminal notification.
async fn finish(
    name: &str,
    shared: &Shared,
    exit_tx: &mpsc::Sender<ProcessExit>,
    exit_code: i32,
    timed_out: bool,
) {
    if shared
        .terminated
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!(process = %name, "Termination already recorded");
        return;
    }

    *shared.exit_code.lock().unwrap() = Some(exit_code);
    let failed = exit_code != 0 && !shared.shutting_down.load(Ordering::SeqCst);

    if failed {
        warn!(process = %name, exit_code, timed_out, "Process failed");
    } else {
        info!(process = %name, exit_code, "Process terminated");
    }

    let _ = exit_tx
        .send(ProcessExit {
            name: name.to_string(),
            exit_code,
            failed,
            timed_out,
        })
        .await;
}

/// Terminate and reap the child: SIGTERM, a grace period, then SIGKILL.
async fn terminate(name: &str, child: &mut Child, pid: Option<Pid>) {
    if let Some(pid) = pid {
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!(process = %name, error = %e, "SIGTERM failed (already gone?)");
        }
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(process = %name, code = ?status.code(), "Process reaped");
        }
        Ok(Err(e)) => {
            warn!(process = %name, error = %e, "Failed to reap process");
        }
        Err(_) => {
            warn!(process = %name, "Process ignored SIGTERM, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}
