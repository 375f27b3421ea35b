//! The reconciliation loop.
//!
//! One task owns [`AppState`] and consumes every event source: resource
//! manager callbacks (via the gateway), process-exit notifications from
//! supervisors, operator flex requests, and its own heartbeat ticks. All
//! counter mutation happens here, which is what makes the floor-clamp and
//! idempotency guarantees hold without finer-grained locking.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use roost_model::{ContainerId, InstanceId, Role};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{Completion, Event, EventGateway};
use crate::launcher::RoleLauncher;
use crate::process::{ForkedProcessSupervisor, ProcessExit};
use crate::rm::ResourceManager;
use crate::snapshot::MasterSnapshot;
use crate::state::{Action, AllocationOutcome, AppState};

/// What the loop should do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterFlow {
    Continue,

    /// An AM-fatal role instance failed; the whole master must stop.
    Fatal(String),
}

/// Bookkeeping for one supervised role process.
struct ProcessRecord {
    role: String,
    container: ContainerId,
    supervisor: ForkedProcessSupervisor,
}

/// The application master.
pub struct ApplicationMaster<RM: ResourceManager> {
    state: AppState,
    rm: Arc<RM>,
    launcher: Arc<dyn RoleLauncher>,

    events_rx: mpsc::Receiver<Event>,
    exit_rx: mpsc::Receiver<ProcessExit>,
    exit_tx: mpsc::Sender<ProcessExit>,

    /// Supervised processes by instance ID. Records outlive termination so
    /// exit codes and recent output stay queryable.
    processes: HashMap<InstanceId, ProcessRecord>,

    history_path: Option<PathBuf>,
    heartbeat_interval: Duration,
    snapshot_tx: watch::Sender<MasterSnapshot>,
}

impl<RM: ResourceManager> ApplicationMaster<RM> {
    /// Build the master around an already-validated state.
    ///
    /// Returns the master, the gateway collaborators post events through,
    /// and the snapshot channel for monitoring.
    pub fn new(
        config: &Config,
        state: AppState,
        rm: Arc<RM>,
        launcher: Arc<dyn RoleLauncher>,
    ) -> (Self, EventGateway, watch::Receiver<MasterSnapshot>) {
        let (gateway, events_rx) = EventGateway::new(config.event_queue_depth);
        let (exit_tx, exit_rx) = mpsc::channel(config.event_queue_depth);
        let (snapshot_tx, snapshot_rx) = watch::channel(MasterSnapshot::empty());

        let master = Self {
            state,
            rm,
            launcher,
            events_rx,
            exit_rx,
            exit_tx,
            processes: HashMap::new(),
            history_path: config.history_path.clone(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            snapshot_tx,
        };
        (master, gateway, snapshot_rx)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Recent output lines of one role instance, oldest first.
    pub fn recent_process_output(&self, role: &str, instance: &InstanceId) -> Option<Vec<String>> {
        self.processes
            .get(instance)
            .filter(|r| r.role == role)
            .map(|r| r.supervisor.recent_output())
    }

    /// Exit code of one role instance, once its process terminated.
    pub fn exit_code(&self, role: &str, instance: &InstanceId) -> Option<i32> {
        self.processes
            .get(instance)
            .filter(|r| r.role == role)
            .and_then(|r| r.supervisor.exit_code())
    }

    /// Initial review: issue the first wave of container requests.
    pub async fn bootstrap(&mut self) -> Result<()> {
        let actions = self.state.review_all();
        self.dispatch(actions).await?;
        self.publish_snapshot();
        Ok(())
    }

    /// Run until shutdown is signalled or a fatal failure occurs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            heartbeat_secs = self.heartbeat_interval.as_secs(),
            "Application master entering reconciliation loop"
        );

        self.bootstrap().await?;

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await; // consume the immediate first tick

        let mut fatal: Option<String> = None;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Application master received shutdown signal");
                        break;
                    }
                }

                exit = self.exit_rx.recv() => {
                    // The sender half lives in self, so recv never yields None.
                    if let Some(exit) = exit {
                        let flow = self.handle_process_exit(exit).await?;
                        if let MasterFlow::Fatal(reason) = flow {
                            fatal = Some(reason);
                            break;
                        }
                    }
                }

                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => {
                            let flow = self.handle_event(event).await?;
                            if let MasterFlow::Fatal(reason) = flow {
                                fatal = Some(reason);
                                break;
                            }
                        }
                        None => {
                            info!("Event gateway closed, shutting down");
                            break;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    let actions = self.state.on_tick();
                    self.dispatch(actions).await?;
                    self.save_history();
                    self.publish_snapshot();
                }
            }
        }

        self.shutdown_processes();
        self.save_history();

        match fatal {
            Some(reason) => bail!("fatal role failure: {reason}"),
            None => Ok(()),
        }
    }

    /// Apply one event to the state and perform the resulting actions.
    pub async fn handle_event(&mut self, event: Event) -> Result<MasterFlow> {
        let flow = match event {
            Event::ContainersAllocated(allocations) => {
                let outcomes = self.state.on_containers_allocated(allocations);
                for outcome in outcomes {
                    match outcome {
                        AllocationOutcome::Assigned {
                            role,
                            container,
                            host,
                        } => {
                            debug!(
                                role = %role.name,
                                container = %container,
                                host = %host,
                                "Launching role instance"
                            );
                            self.launch(role, container).await?;
                        }
                        AllocationOutcome::Surplus(container) => {
                            self.rm
                                .release_container(&container)
                                .await
                                .context("releasing surplus container")?;
                        }
                    }
                }
                MasterFlow::Continue
            }

            Event::ContainersCompleted(completions) => {
                // A container that vanished under a live process means the
                // process is gone too; stop its supervisor intentionally so
                // the provoked exit is not reported as a failure.
                for completion in &completions {
                    let instance = InstanceId::for_container(&completion.container);
                    if let Some(record) = self.processes.get(&instance) {
                        if !record.supervisor.is_terminated() {
                            record.supervisor.stop();
                        }
                    }
                }

                let outcome = self.state.on_containers_completed(completions);
                self.dispatch(outcome.actions).await?;
                match outcome.fatal.first() {
                    Some(failure) => MasterFlow::Fatal(format!(
                        "role '{}' container {} exited with status {}",
                        failure.role, failure.container, failure.exit_status
                    )),
                    None => MasterFlow::Continue,
                }
            }

            Event::Flex { role, desired } => {
                match self.state.flex(&role, desired) {
                    Ok(actions) => self.dispatch(actions).await?,
                    Err(e) => warn!(role = %role, error = %e, "Ignoring flex request"),
                }
                MasterFlow::Continue
            }

            Event::ProcessExited {
                instance,
                exit_code,
                failed,
                timed_out,
            } => {
                self.handle_process_exit(ProcessExit {
                    name: instance.to_string(),
                    exit_code,
                    failed,
                    timed_out,
                })
                .await?
            }
        };

        self.publish_snapshot();
        Ok(flow)
    }

    /// A supervised process terminated: fold it into the container
    /// completion path and hand the container back.
    async fn handle_process_exit(&mut self, exit: ProcessExit) -> Result<MasterFlow> {
        let instance = InstanceId::new(exit.name.clone());
        let Some(record) = self.processes.get(&instance) else {
            debug!(instance = %instance, "Exit for unknown process, ignoring");
            return Ok(MasterFlow::Continue);
        };
        let container = record.container.clone();

        if exit.failed {
            warn!(
                role = %record.role,
                instance = %instance,
                exit_code = exit.exit_code,
                timed_out = exit.timed_out,
                "Role process failed"
            );
        }

        // Route through the completion path: the counters come down, the
        // history records the outcome, and a replacement is requested if
        // the role is now under target. A later resource-manager completion
        // for the same container is absorbed as a duplicate.
        let outcome = self.state.on_containers_completed(vec![Completion {
            container: container.clone(),
            exit_status: exit.exit_code,
        }]);
        self.dispatch(outcome.actions).await?;

        self.rm
            .release_container(&container)
            .await
            .context("releasing container after process exit")?;

        self.publish_snapshot();
        match outcome.fatal.first() {
            Some(failure) => Ok(MasterFlow::Fatal(format!(
                "role '{}' process {} exited with status {}",
                failure.role, instance, failure.exit_status
            ))),
            None => Ok(MasterFlow::Continue),
        }
    }

    /// Fork the role's executable inside a freshly assigned container.
    async fn launch(&mut self, role: Role, container: ContainerId) -> Result<()> {
        let Some(spec) = self.launcher.launch_spec(&role) else {
            debug!(role = %role.name, "Role has no forked process");
            return Ok(());
        };

        let instance = InstanceId::for_container(&container);
        let mut supervisor =
            ForkedProcessSupervisor::new(instance.as_str(), self.exit_tx.clone());
        if let Some(timeout) = spec.timeout() {
            supervisor.set_timeout(timeout, spec.timeout_exit_code);
        }

        let started = match supervisor.build(spec.env.clone(), spec.command.clone()) {
            Ok(()) => supervisor.start(),
            Err(e) => Err(e),
        };

        self.processes.insert(
            instance.clone(),
            ProcessRecord {
                role: role.name.clone(),
                container: container.clone(),
                supervisor,
            },
        );

        if let Err(e) = started {
            // The container holds no process; treat it like an immediate
            // failed exit so the instance is replaced.
            error!(
                role = %role.name,
                instance = %instance,
                error = %e,
                "Failed to start role process"
            );
            let outcome = self.state.on_containers_completed(vec![Completion {
                container: container.clone(),
                exit_status: 1,
            }]);
            self.dispatch(outcome.actions).await?;
            self.rm
                .release_container(&container)
                .await
                .context("releasing container after spawn failure")?;
        }

        Ok(())
    }

    /// Perform reconciler actions against the resource manager.
    async fn dispatch(&mut self, actions: Vec<Action>) -> Result<()> {
        for action in actions {
            match action {
                Action::Request(request) => {
                    self.rm
                        .request_container(
                            request.priority,
                            request.profile,
                            &request.hints,
                            request.relax_locality,
                        )
                        .await
                        .context("requesting container")?;
                }
                Action::Release(container) => {
                    self.rm
                        .release_container(&container)
                        .await
                        .context("releasing container")?;
                }
            }
        }
        Ok(())
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx
            .send_replace(MasterSnapshot::new(self.state.role_status_snapshot()));
    }

    fn save_history(&self) {
        if let Some(path) = &self.history_path {
            if let Err(e) = roost_placement::save_history(self.state.history(), path) {
                warn!(error = %e, "Failed to save placement history");
            }
        }
    }

    /// Stop every live supervised process intentionally.
    fn shutdown_processes(&mut self) {
        let live = self
            .processes
            .values()
            .filter(|r| !r.supervisor.is_terminated())
            .count();
        if live > 0 {
            info!(processes = live, "Stopping supervised processes");
        }
        for record in self.processes.values() {
            record.supervisor.stop();
        }
    }
}
