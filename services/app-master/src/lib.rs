//! roost Application Master Library
//!
//! The application master keeps one distributed application's running
//! footprint in sync with an operator-declared target: a set of roles, each
//! with a desired instance count, resource profile, and placement
//! preferences, running in containers granted by a cluster resource manager.
//!
//! ## Architecture
//!
//! - **AppState**: single-owner reconciliation state - compares role
//!   counters to targets and emits container requests/releases
//! - **Event Gateway**: bounded channel carrying resource-manager and
//!   process-exit callbacks into the one reconciliation loop
//! - **ForkedProcessSupervisor**: per-instance external-process lifecycle
//!   with output capture and a timeout watchdog
//! - **ResourceManager**: trait boundary to the cluster resource manager
//!   (mock in dev and tests)
//!
//! ## Modules
//!
//! - `state`: role counters and the reconciliation engine
//! - `process`: forked-process supervision
//! - `events`: event types and the gateway adapter
//! - `rm`: resource-manager client trait
//! - `launcher`: per-role launch specification boundary

pub mod config;
pub mod events;
pub mod launcher;
pub mod master;
pub mod process;
pub mod rm;
pub mod snapshot;
pub mod state;

// Re-export commonly used types
pub use events::{Allocation, Completion, Event, EventGateway};
pub use master::ApplicationMaster;
pub use rm::{MockResourceManager, ResourceManager};
pub use state::AppState;
