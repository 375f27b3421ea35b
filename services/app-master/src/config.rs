//! Configuration for the application master.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use roost_model::RoleSet;

use crate::launcher::StaticLauncher;

/// Application master configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the role-set JSON file.
    pub role_set_path: PathBuf,

    /// Path to the per-role launch spec JSON file, if any roles fork
    /// processes.
    pub launch_specs_path: Option<PathBuf>,

    /// Where placement history is persisted across restarts.
    pub history_path: Option<PathBuf>,

    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// Heartbeat ticks a container request may stay unanswered before the
    /// role is reported degraded.
    pub unanswered_warn_ticks: u64,

    /// Live co-located instances before an anti-affinity role's hints
    /// exclude a host.
    pub anti_affinity_limit: u32,

    /// Bound on the event channel feeding the reconciliation loop.
    pub event_queue_depth: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let role_set_path = std::env::var("ROOST_ROLES")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("roles.json"));

        let launch_specs_path = std::env::var("ROOST_LAUNCH_SPECS").ok().map(PathBuf::from);

        let history_path = std::env::var("ROOST_HISTORY").ok().map(PathBuf::from);

        let heartbeat_interval_secs = std::env::var("ROOST_HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let unanswered_warn_ticks = std::env::var("ROOST_UNANSWERED_WARN_TICKS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(12);

        let anti_affinity_limit = std::env::var("ROOST_ANTI_AFFINITY_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let event_queue_depth = std::env::var("ROOST_EVENT_QUEUE_DEPTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256);

        let log_level = std::env::var("ROOST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            role_set_path,
            launch_specs_path,
            history_path,
            heartbeat_interval_secs,
            unanswered_warn_ticks,
            anti_affinity_limit,
            event_queue_depth,
            log_level,
        })
    }

    /// Load and validate the role set. Validation failures are fatal here,
    /// before the resource manager is ever contacted.
    pub fn load_role_set(&self) -> Result<RoleSet> {
        let json = std::fs::read_to_string(&self.role_set_path)
            .with_context(|| format!("reading role set {}", self.role_set_path.display()))?;
        let role_set: RoleSet = serde_json::from_str(&json)
            .with_context(|| format!("parsing role set {}", self.role_set_path.display()))?;
        role_set.validate().context("invalid role set")?;
        Ok(role_set)
    }

    /// Load the launch spec table, or an empty one if not configured.
    pub fn load_launcher(&self) -> Result<StaticLauncher> {
        let Some(path) = &self.launch_specs_path else {
            return Ok(StaticLauncher::default());
        };
        let json = load_json(path)?;
        StaticLauncher::from_json(&json)
            .with_context(|| format!("parsing launch specs {}", path.display()))
    }
}

fn load_json(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}
