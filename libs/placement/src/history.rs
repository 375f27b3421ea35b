//! Placement-affinity decision engine built on the node map.

use std::collections::HashMap;

use roost_model::{ContainerId, PlacementPolicy, Role};
use tracing::debug;

use crate::node_map::{NodeMap, RoleUse};

/// A live container assignment tracked for idempotency and anti-affinity.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveAssignment {
    priority: u32,
    host: String,
}

/// Persistent placement-affinity engine.
///
/// Owns the [`NodeMap`] plus the set of currently-active container→host
/// assignments and a logical age counter used to prefer most-recently-used
/// hosts. Mutated only by the reconciler; suggestions are advisory and the
/// resource manager is free to ignore them.
#[derive(Debug, Default)]
pub struct RoleHistory {
    node_map: NodeMap,

    /// Live container assignments, keyed by container ID.
    active: HashMap<ContainerId, ActiveAssignment>,

    /// Logical clock; bumped once per recorded event.
    age: u64,

    /// Live co-located instances of an anti-affinity role a host may hold
    /// before it is excluded from that role's hints.
    anti_affinity_limit: u32,
}

impl RoleHistory {
    pub fn new(anti_affinity_limit: u32) -> Self {
        Self {
            anti_affinity_limit: anti_affinity_limit.max(1),
            ..Self::default()
        }
    }

    /// Rebuild a history from persisted state.
    pub(crate) fn from_parts(node_map: NodeMap, age: u64, anti_affinity_limit: u32) -> Self {
        Self {
            node_map,
            active: HashMap::new(),
            age,
            anti_affinity_limit: anti_affinity_limit.max(1),
        }
    }

    pub fn node_map(&self) -> &NodeMap {
        &self.node_map
    }

    pub(crate) fn age(&self) -> u64 {
        self.age
    }

    /// Number of live assignments currently tracked.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn tick(&mut self) -> u64 {
        self.age += 1;
        self.age
    }

    /// Ordered host hints for the next `count` container requests of `role`.
    ///
    /// Most-recently-successful hosts come first; hosts whose latest outcome
    /// was a failure sort behind every unpenalized candidate but are never
    /// excluded outright. Ties break on total successful placements for the
    /// role, then lexicographic hostname, so the ordering is reproducible
    /// from persisted state alone. Returns an empty list when no history
    /// exists; the caller then requests without hints.
    pub fn suggest_nodes(&self, role: &Role, count: usize) -> Vec<String> {
        if count == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(&str, &RoleUse)> = self
            .node_map
            .hosts_for_role(role.priority)
            .filter(|(_, usage)| !self.excluded(role, usage))
            .collect();

        candidates.sort_by(|(host_a, a), (host_b, b)| {
            a.is_penalized()
                .cmp(&b.is_penalized())
                .then(b.last_active.cmp(&a.last_active))
                .then(b.success_count.cmp(&a.success_count))
                .then(host_a.cmp(host_b))
        });

        candidates
            .into_iter()
            .take(count)
            .map(|(host, _)| host.to_string())
            .collect()
    }

    fn excluded(&self, role: &Role, usage: &RoleUse) -> bool {
        match role.placement {
            PlacementPolicy::AntiAffinity => usage.live >= self.anti_affinity_limit,
            PlacementPolicy::Any | PlacementPolicy::StrictAffinity => false,
        }
    }

    /// Record a container assignment. Idempotent per container ID: a second
    /// call for the same container is a no-op.
    pub fn on_container_assigned(&mut self, role: &Role, container: &ContainerId, host: &str) {
        if self.active.contains_key(container) {
            return;
        }

        let stamp = self.tick();
        let usage = self.node_map.entry(host, role.priority);
        usage.last_active = stamp;
        usage.live += 1;

        self.active.insert(
            container.clone(),
            ActiveAssignment {
                priority: role.priority,
                host: host.to_string(),
            },
        );

        debug!(
            role = %role.name,
            container = %container,
            host,
            stamp,
            "Recorded container assignment"
        );
    }

    /// Record a container completion.
    ///
    /// A success refreshes the host's recency and bumps its success count; a
    /// failure lowers the host's preference rank for the role without
    /// blacklisting it. Completions for containers that were never assigned
    /// (or already completed) are absorbed as no-ops.
    pub fn on_container_completed(&mut self, role: &Role, container: &ContainerId, succeeded: bool) {
        let Some(assignment) = self.active.remove(container) else {
            debug!(container = %container, "Ignoring completion for unknown container");
            return;
        };

        let stamp = self.tick();
        let usage = self.node_map.entry(&assignment.host, assignment.priority);
        usage.live = usage.live.saturating_sub(1);
        if succeeded {
            usage.last_active = stamp;
            usage.success_count += 1;
        } else {
            usage.last_failed = stamp;
        }

        debug!(
            role = %role.name,
            container = %container,
            host = %assignment.host,
            succeeded,
            stamp,
            "Recorded container completion"
        );
    }

    /// Host a live container is assigned to, if known.
    pub fn host_of(&self, container: &ContainerId) -> Option<&str> {
        self.active.get(container).map(|a| a.host.as_str())
    }
}
