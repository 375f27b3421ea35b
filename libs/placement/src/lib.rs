//! Placement-history engine for the roost application master.
//!
//! Tracks where each role's containers have run and uses that history to
//! bias future container requests toward previously-successful hosts.
//! Key concepts:
//!
//! - **NodeMap**: per-host record of role usage, never deleted once created.
//! - **RoleHistory**: owns the node map, the live container assignments, and
//!   a logical age counter; produces ordered host hints.
//!
//! # Invariants
//!
//! - Suggestions are deterministic given identical history state: ordering
//!   is driven by logical age stamps, never wall-clock time.
//! - A failed completion lowers a host's preference but never excludes it.
//! - Assignment recording is idempotent per container ID.
//! - Live counters are floor-clamped: duplicate completions cannot drive
//!   them negative.

mod history;
mod node_map;
mod persist;

pub use history::RoleHistory;
pub use node_map::{NodeMap, RoleUse};
pub use persist::{load_history, save_history, HistoryError, HistorySnapshot};
