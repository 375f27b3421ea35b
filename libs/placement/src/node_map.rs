//! Per-host record of role usage history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Usage record of one role on one host.
///
/// Stamps are logical times drawn from the owning [`RoleHistory`]'s age
/// counter, so comparisons are reproducible across restarts.
///
/// [`RoleHistory`]: crate::RoleHistory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleUse {
    /// Stamp of the most recent successful activity (assignment or
    /// successful completion). Zero means never active.
    pub last_active: u64,

    /// Stamp of the most recent failed completion. Zero means never failed.
    pub last_failed: u64,

    /// Total successful completions of this role on this host.
    pub success_count: u64,

    /// Containers of this role currently live on this host.
    /// Not persisted: live state does not survive a master restart.
    #[serde(skip)]
    pub live: u32,
}

impl RoleUse {
    /// A failure newer than the last success pushes the host behind every
    /// unpenalized candidate when ranking (soft decay, not exclusion).
    pub fn is_penalized(&self) -> bool {
        self.last_failed > self.last_active
    }
}

/// Map of hostname to per-role-priority usage records.
///
/// Entries are created on the first container ever seen for a host and are
/// never deleted; historical value persists for the life of the master.
#[derive(Debug, Clone, Default)]
pub struct NodeMap {
    nodes: BTreeMap<String, BTreeMap<u32, RoleUse>>,
}

impl NodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the usage record for (host, role priority).
    pub fn entry(&mut self, host: &str, priority: u32) -> &mut RoleUse {
        self.nodes
            .entry(host.to_string())
            .or_default()
            .entry(priority)
            .or_default()
    }

    /// Usage record for (host, role priority), if the host has history.
    pub fn get(&self, host: &str, priority: u32) -> Option<&RoleUse> {
        self.nodes.get(host).and_then(|roles| roles.get(&priority))
    }

    /// All hosts with a record for the given role priority, in hostname
    /// order.
    pub fn hosts_for_role(&self, priority: u32) -> impl Iterator<Item = (&str, &RoleUse)> {
        self.nodes.iter().filter_map(move |(host, roles)| {
            roles.get(&priority).map(|u| (host.as_str(), u))
        })
    }

    /// Number of hosts ever seen.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over every (host, priority, usage) triple, ordered by
    /// hostname then priority.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32, &RoleUse)> {
        self.nodes.iter().flat_map(|(host, roles)| {
            roles.iter().map(move |(p, u)| (host.as_str(), *p, u))
        })
    }
}
