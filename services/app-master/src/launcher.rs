//! Per-role launch specification boundary.
//!
//! How a role's command line is built (provider deployment logic, config
//! templating) is not this crate's business: the launch collaborator hands
//! over a resolved tuple of command vector, environment, and timeout policy
//! per role, and the master forks it inside a granted container.

use std::collections::HashMap;
use std::time::Duration;

use roost_model::Role;
use serde::{Deserialize, Serialize};

/// Resolved launch tuple for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Command vector; first element is the executable.
    pub command: Vec<String>,

    /// Environment variables for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Deadline for the process, measured from start confirmation.
    /// Absent means no deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Exit code reported when the process is killed for exceeding the
    /// deadline, distinguishing a timeout kill from a natural non-zero
    /// exit.
    #[serde(default = "default_timeout_exit_code")]
    pub timeout_exit_code: i32,
}

fn default_timeout_exit_code() -> i32 {
    124
}

impl LaunchSpec {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Launch collaborator: resolves a role to its launch tuple.
///
/// Returning `None` means the role runs no master-forked process (the
/// container's own payload is managed elsewhere).
pub trait RoleLauncher: Send + Sync {
    fn launch_spec(&self, role: &Role) -> Option<LaunchSpec>;
}

/// Launcher backed by a static role-name table, typically loaded from a
/// JSON file alongside the role set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticLauncher {
    specs: HashMap<String, LaunchSpec>,
}

impl StaticLauncher {
    pub fn new(specs: HashMap<String, LaunchSpec>) -> Self {
        Self { specs }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let specs = serde_json::from_str(json)?;
        Ok(Self { specs })
    }
}

impl RoleLauncher for StaticLauncher {
    fn launch_spec(&self, role: &Role) -> Option<LaunchSpec> {
        self.specs.get(&role.name).cloned()
    }
}
