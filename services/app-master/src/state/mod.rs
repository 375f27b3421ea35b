//! Reconciliation state: role counters, live containers, and the engine
//! that diffs them against the operator target.
//!
//! `AppState` is owned by exactly one loop. Every review pass recomputes
//! decisions from the authoritative counters, so duplicate callbacks and
//! racing events can only ever be absorbed, never double-counted.

mod role_status;

use std::collections::{BTreeMap, HashMap};

use roost_model::{ContainerId, ModelError, PlacementPolicy, ResourceProfile, Role, RoleSet};
use roost_placement::RoleHistory;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{Allocation, Completion};

pub use role_status::{ProvisioningState, RoleStatus};

/// Errors from reconciliation operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// A flex request named a role that does not exist.
    #[error("unknown role: {0}")]
    UnknownRole(String),
}

/// A container request submitted to the resource manager and not yet
/// granted or cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingRequest {
    pub priority: u32,
    pub profile: ResourceProfile,

    /// Ordered host hints from placement history; may be empty.
    pub hints: Vec<String>,

    /// True once the request may be satisfied off-hint. Set from the start
    /// for non-strict roles and for hint-less requests; strict requests
    /// flip to relaxed when retried rather than stalling.
    pub relax_locality: bool,

    /// Heartbeat tick at submission, for degraded-role detection.
    pub submitted_tick: u64,
}

/// One live container and the bookkeeping needed to pick release victims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveContainer {
    pub role_priority: u32,
    pub host: String,

    /// Monotonic start order; release selection takes the newest first.
    pub started_seq: u64,

    /// Set by the launch collaborator while the instance is executing a
    /// non-interruptible operation; such instances are never released.
    pub non_interruptible: bool,

    /// Selected for release; completion not yet acknowledged.
    pub releasing: bool,
}

/// An action the reconciler wants performed against the resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Request(OutstandingRequest),
    Release(ContainerId),
}

/// Outcome of one allocation callback entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// The grant matched an outstanding request; the caller should launch
    /// the role's process in the container.
    Assigned {
        role: Role,
        container: ContainerId,
        host: String,
    },

    /// The grant matched nothing we are still waiting for (request was
    /// cancelled, or the grant is a duplicate); release it straight back.
    Surplus(ContainerId),
}

/// An instance failure of a role marked AM-fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalFailure {
    pub role: String,
    pub container: ContainerId,
    pub exit_status: i32,
}

/// Outcome of a completion callback: follow-up actions plus any failures
/// that must terminate the whole master.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub actions: Vec<Action>,
    pub fatal: Vec<FatalFailure>,
}

/// The reconciliation engine.
pub struct AppState {
    roles: Vec<Role>,
    status: HashMap<u32, RoleStatus>,
    active: HashMap<ContainerId, ActiveContainer>,
    outstanding: Vec<OutstandingRequest>,
    history: RoleHistory,

    /// Monotonic container start counter.
    start_seq: u64,

    /// Heartbeat tick counter.
    tick: u64,

    /// Ticks a request may stay unanswered before the role is flagged
    /// degraded (and strict requests fall back to relaxed placement).
    unanswered_warn_ticks: u64,
}

impl AppState {
    /// Build the engine from a validated role set.
    ///
    /// Validation is repeated here so a caller can never reach the resource
    /// manager with a malformed target.
    pub fn new(
        role_set: &RoleSet,
        history: RoleHistory,
        unanswered_warn_ticks: u64,
    ) -> Result<Self, ModelError> {
        role_set.validate()?;

        let roles: Vec<Role> = role_set.roles.iter().map(|s| s.role.clone()).collect();
        let status = role_set
            .roles
            .iter()
            .map(|s| (s.role.priority, RoleStatus::new(s.desired)))
            .collect();

        Ok(Self {
            roles,
            status,
            active: HashMap::new(),
            outstanding: Vec::new(),
            history,
            start_seq: 0,
            tick: 0,
            unanswered_warn_ticks: unanswered_warn_ticks.max(1),
        })
    }

    pub fn history(&self) -> &RoleHistory {
        &self.history
    }

    /// Role table lookup by priority.
    pub fn role_by_priority(&self, priority: u32) -> Option<&Role> {
        self.roles.iter().find(|r| r.priority == priority)
    }

    /// Role table lookup by name.
    pub fn role_by_name(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Counters for one role.
    pub fn role_status(&self, priority: u32) -> Option<&RoleStatus> {
        self.status.get(&priority)
    }

    /// The live container record, if tracked.
    pub fn container(&self, container: &ContainerId) -> Option<&ActiveContainer> {
        self.active.get(container)
    }

    /// Requests currently awaiting a grant.
    pub fn outstanding_requests(&self) -> &[OutstandingRequest] {
        &self.outstanding
    }

    /// Monitoring snapshot: role name to counters.
    pub fn role_status_snapshot(&self) -> BTreeMap<String, RoleStatus> {
        self.roles
            .iter()
            .filter_map(|r| self.status.get(&r.priority).map(|s| (r.name.clone(), *s)))
            .collect()
    }

    /// Flag or clear a container's non-interruptible marker.
    pub fn set_non_interruptible(&mut self, container: &ContainerId, flag: bool) {
        if let Some(record) = self.active.get_mut(container) {
            record.non_interruptible = flag;
        }
    }

    // -------------------------------------------------------------------------
    // Review
    // -------------------------------------------------------------------------

    /// Review every role against its target.
    pub fn review_all(&mut self) -> Vec<Action> {
        let priorities: Vec<u32> = self.roles.iter().map(|r| r.priority).collect();
        let mut actions = Vec::new();
        for priority in priorities {
            actions.extend(self.review_role(priority));
        }
        actions
    }

    /// Review one role against its target, emitting requests or releases.
    pub fn review_role(&mut self, priority: u32) -> Vec<Action> {
        let Some(role) = self.role_by_priority(priority).cloned() else {
            return Vec::new();
        };

        let mut actions = Vec::new();

        // First cancel requests the target no longer needs. There is no
        // cancel call at the resource-manager boundary; a grant that
        // arrives for a cancelled request is released on receipt.
        let status = *self.status.get(&priority).expect("status exists per role");
        let surplus_requests = (status.actual + status.outstanding)
            .saturating_sub(status.desired)
            .min(status.outstanding);
        for _ in 0..surplus_requests {
            if let Some(pos) = self.outstanding.iter().rposition(|r| r.priority == priority) {
                let cancelled = self.outstanding.remove(pos);
                let status = self.status.get_mut(&priority).expect("status exists");
                status.dec_outstanding();
                debug!(
                    role = %role.name,
                    submitted_tick = cancelled.submitted_tick,
                    "Cancelled outstanding request"
                );
            }
        }

        let status = *self.status.get(&priority).expect("status exists");
        match status.provisioning_state() {
            ProvisioningState::UnderProvisioned => {
                let deficit = status.deficit();
                let hints = self.history.suggest_nodes(&role, deficit as usize);
                let relax =
                    hints.is_empty() || role.placement != PlacementPolicy::StrictAffinity;

                info!(
                    role = %role.name,
                    deficit,
                    hints = hints.len(),
                    relax_locality = relax,
                    "Requesting containers"
                );

                for _ in 0..deficit {
                    let request = OutstandingRequest {
                        priority,
                        profile: role.profile,
                        hints: hints.clone(),
                        relax_locality: relax,
                        submitted_tick: self.tick,
                    };
                    self.outstanding.push(request.clone());
                    self.status
                        .get_mut(&priority)
                        .expect("status exists")
                        .outstanding += 1;
                    actions.push(Action::Request(request));
                }
            }

            ProvisioningState::OverProvisioned => {
                let excess = status.excess() as usize;
                let victims = self.select_for_release(priority, excess);
                info!(
                    role = %role.name,
                    excess,
                    selected = victims.len(),
                    "Releasing containers"
                );
                for container in victims {
                    self.active
                        .get_mut(&container)
                        .expect("victim is active")
                        .releasing = true;
                    self.status
                        .get_mut(&priority)
                        .expect("status exists")
                        .pending_release += 1;
                    actions.push(Action::Release(container));
                }
            }

            ProvisioningState::Satisfied => {}
        }

        actions
    }

    /// Pick up to `count` release victims: newest-started first, skipping
    /// instances already releasing or flagged non-interruptible.
    fn select_for_release(&self, priority: u32, count: usize) -> Vec<ContainerId> {
        let mut candidates: Vec<(&ContainerId, &ActiveContainer)> = self
            .active
            .iter()
            .filter(|(_, c)| {
                c.role_priority == priority && !c.releasing && !c.non_interruptible
            })
            .collect();

        candidates.sort_by(|(_, a), (_, b)| b.started_seq.cmp(&a.started_seq));
        candidates
            .into_iter()
            .take(count)
            .map(|(id, _)| id.clone())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Callbacks
    // -------------------------------------------------------------------------

    /// Apply an allocation callback.
    ///
    /// Grants correlate to outstanding requests purely by role priority;
    /// the oldest matching request is consumed. Grants with no matching
    /// request (cancelled, or duplicated) come back as surplus for
    /// immediate release.
    pub fn on_containers_allocated(&mut self, allocations: Vec<Allocation>) -> Vec<AllocationOutcome> {
        let mut outcomes = Vec::new();

        for allocation in allocations {
            if self.active.contains_key(&allocation.container) {
                debug!(
                    container = %allocation.container,
                    "Ignoring duplicate grant for tracked container"
                );
                continue;
            }

            let matched = self
                .outstanding
                .iter()
                .position(|r| r.priority == allocation.priority)
                .map(|pos| self.outstanding.remove(pos));

            let role = self.role_by_priority(allocation.priority).cloned();
            let (Some(_request), Some(role)) = (matched, role) else {
                info!(
                    container = %allocation.container,
                    priority = allocation.priority,
                    "Grant matched no outstanding request, releasing"
                );
                outcomes.push(AllocationOutcome::Surplus(allocation.container));
                continue;
            };

            let status = self.status.get_mut(&allocation.priority).expect("status exists");
            status.dec_outstanding();
            status.actual += 1;
            status.degraded = false;

            self.start_seq += 1;
            self.active.insert(
                allocation.container.clone(),
                ActiveContainer {
                    role_priority: allocation.priority,
                    host: allocation.host.clone(),
                    started_seq: self.start_seq,
                    non_interruptible: false,
                    releasing: false,
                },
            );
            self.history
                .on_container_assigned(&role, &allocation.container, &allocation.host);

            info!(
                role = %role.name,
                container = %allocation.container,
                host = %allocation.host,
                "Container assigned"
            );

            outcomes.push(AllocationOutcome::Assigned {
                role,
                container: allocation.container,
                host: allocation.host,
            });
        }

        outcomes
    }

    /// Apply a completion callback.
    ///
    /// Completions for containers we selected for release acknowledge the
    /// release; anything else is an unplanned exit that decrements the
    /// role's live count and, if the role is now under target, triggers
    /// replacement requests. Completions for unknown containers (duplicates
    /// or grants released before use) are absorbed.
    pub fn on_containers_completed(&mut self, completions: Vec<Completion>) -> CompletionOutcome {
        let mut outcome = CompletionOutcome::default();
        let mut touched: Vec<u32> = Vec::new();

        for completion in completions {
            let Some(record) = self.active.remove(&completion.container) else {
                debug!(
                    container = %completion.container,
                    "Ignoring completion for unknown container"
                );
                continue;
            };

            let Some(role) = self.role_by_priority(record.role_priority).cloned() else {
                continue;
            };
            let status = self
                .status
                .get_mut(&record.role_priority)
                .expect("status exists");

            if record.releasing {
                status.dec_pending_release();
                status.dec_actual();
                self.history
                    .on_container_completed(&role, &completion.container, true);
                debug!(
                    role = %role.name,
                    container = %completion.container,
                    "Release acknowledged"
                );
            } else {
                status.dec_actual();
                let succeeded = completion.exit_status == 0;
                self.history
                    .on_container_completed(&role, &completion.container, succeeded);

                if succeeded {
                    info!(
                        role = %role.name,
                        container = %completion.container,
                        "Container completed cleanly"
                    );
                } else {
                    warn!(
                        role = %role.name,
                        container = %completion.container,
                        host = %record.host,
                        exit_status = completion.exit_status,
                        "Role instance failed"
                    );
                    if role.am_fatal {
                        outcome.fatal.push(FatalFailure {
                            role: role.name.clone(),
                            container: completion.container.clone(),
                            exit_status: completion.exit_status,
                        });
                    }
                }
            }

            if !touched.contains(&record.role_priority) {
                touched.push(record.role_priority);
            }
        }

        for priority in touched {
            outcome.actions.extend(self.review_role(priority));
        }
        outcome
    }

    /// Operator flex: change a role's desired count and re-review.
    pub fn flex(&mut self, role_name: &str, desired: u32) -> Result<Vec<Action>, StateError> {
        let priority = self
            .role_by_name(role_name)
            .map(|r| r.priority)
            .ok_or_else(|| StateError::UnknownRole(role_name.to_string()))?;

        let status = self.status.get_mut(&priority).expect("status exists");
        let previous = status.desired;
        status.desired = desired;

        info!(role = role_name, previous, desired, "Flexed role target");
        Ok(self.review_role(priority))
    }

    /// Heartbeat tick: surface degraded roles, fall strict requests back to
    /// relaxed placement, and re-review everything.
    pub fn on_tick(&mut self) -> Vec<Action> {
        self.tick += 1;
        let mut actions = Vec::new();

        let mut stale_strict: Vec<usize> = Vec::new();
        for (idx, request) in self.outstanding.iter().enumerate() {
            let waited = self.tick - request.submitted_tick;
            if waited < self.unanswered_warn_ticks {
                continue;
            }

            let role_name = self
                .role_by_priority(request.priority)
                .map(|r| r.name.clone())
                .unwrap_or_default();
            warn!(
                role = %role_name,
                waited_ticks = waited,
                relax_locality = request.relax_locality,
                "Container request unanswered, role degraded"
            );
            if let Some(status) = self.status.get_mut(&request.priority) {
                status.degraded = true;
            }
            if !request.relax_locality {
                stale_strict.push(idx);
            }
        }

        // Relax rather than stall: replace stale strict requests with
        // hint-free relaxed ones. The original request cannot be withdrawn
        // at the boundary; if it is granted anyway the surplus is released
        // by the next review.
        for idx in stale_strict.into_iter().rev() {
            let old = self.outstanding.remove(idx);
            let relaxed = OutstandingRequest {
                hints: Vec::new(),
                relax_locality: true,
                submitted_tick: self.tick,
                ..old
            };
            self.outstanding.push(relaxed.clone());
            actions.push(Action::Request(relaxed));
        }

        actions.extend(self.review_all());
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_model::RoleSpec;

    fn role_set() -> RoleSet {
        RoleSet {
            roles: vec![
                RoleSpec {
                    role: Role {
                        name: "master".to_string(),
                        priority: 1,
                        profile: ResourceProfile::new(2, 2048),
                        placement: PlacementPolicy::Any,
                        am_fatal: true,
                    },
                    desired: 1,
                },
                RoleSpec {
                    role: Role {
                        name: "worker".to_string(),
                        priority: 2,
                        profile: ResourceProfile::new(1, 512),
                        placement: PlacementPolicy::Any,
                        am_fatal: false,
                    },
                    desired: 3,
                },
            ],
        }
    }

    fn state() -> AppState {
        AppState::new(&role_set(), RoleHistory::new(1), 3).unwrap()
    }

    fn grant(state: &mut AppState, n: u32, priority: u32, host: &str) -> ContainerId {
        let container = ContainerId::new(format!("c{n}"));
        state.on_containers_allocated(vec![Allocation {
            container: container.clone(),
            host: host.to_string(),
            priority,
        }]);
        container
    }

    #[test]
    fn test_initial_review_requests_all_desired() {
        let mut state = state();
        let actions = state.review_all();

        let requests: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, Action::Request(_)))
            .collect();
        assert_eq!(requests.len(), 4); // 1 master + 3 workers
        assert_eq!(state.role_status(2).unwrap().outstanding, 3);

        // Re-review must not double-request.
        assert!(state.review_all().is_empty());
    }

    #[test]
    fn test_grant_moves_outstanding_to_actual() {
        let mut state = state();
        state.review_all();
        grant(&mut state, 1, 2, "h1");

        let status = state.role_status(2).unwrap();
        assert_eq!(status.actual, 1);
        assert_eq!(status.outstanding, 2);
    }

    #[test]
    fn test_grant_after_cancel_is_surplus() {
        let mut state = state();
        state.review_all();
        // Flex down: 3 -> 0 cancels all three outstanding worker requests.
        let actions = state.flex("worker", 0).unwrap();
        assert!(actions.is_empty());
        assert_eq!(state.role_status(2).unwrap().outstanding, 0);

        // The grant crosses the cancellation in flight.
        let outcomes = state.on_containers_allocated(vec![Allocation {
            container: ContainerId::new("late"),
            host: "h1".to_string(),
            priority: 2,
        }]);
        assert_eq!(
            outcomes,
            vec![AllocationOutcome::Surplus(ContainerId::new("late"))]
        );
        assert_eq!(state.role_status(2).unwrap().actual, 0);
    }

    #[test]
    fn test_non_interruptible_never_released() {
        let mut state = state();
        state.review_all();
        let c1 = grant(&mut state, 1, 2, "h1");
        let c2 = grant(&mut state, 2, 2, "h2");
        let c3 = grant(&mut state, 3, 2, "h3");

        // Newest (c3) would normally go first; pin it.
        state.set_non_interruptible(&c3, true);
        let actions = state.flex("worker", 1).unwrap();

        let released: Vec<&ContainerId> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Release(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(released, vec![&c2, &c1]);
    }

    #[test]
    fn test_am_fatal_failure_reported() {
        let mut state = state();
        state.review_all();
        let c = grant(&mut state, 1, 1, "h1");

        let outcome = state.on_containers_completed(vec![Completion {
            container: c.clone(),
            exit_status: 7,
        }]);
        assert_eq!(
            outcome.fatal,
            vec![FatalFailure {
                role: "master".to_string(),
                container: c,
                exit_status: 7,
            }]
        );
    }

    #[test]
    fn test_tick_marks_degraded_and_relaxes_strict() {
        let mut roles = role_set();
        roles.roles[1].role.placement = PlacementPolicy::StrictAffinity;
        let mut history = RoleHistory::new(1);
        // Seed history so worker requests carry hints (and stay strict).
        let worker = roles.roles[1].role.clone();
        history.on_container_assigned(&worker, &ContainerId::new("seed"), "h1");
        history.on_container_completed(&worker, &ContainerId::new("seed"), true);

        let mut state = AppState::new(&roles, history, 2).unwrap();
        state.review_all();
        assert!(state
            .outstanding_requests()
            .iter()
            .filter(|r| r.priority == 2)
            .all(|r| !r.relax_locality));

        state.on_tick();
        assert!(!state.role_status(2).unwrap().degraded);
        let actions = state.on_tick();

        assert!(state.role_status(2).unwrap().degraded);
        // Every stale strict request was reissued relaxed.
        assert!(state
            .outstanding_requests()
            .iter()
            .filter(|r| r.priority == 2)
            .all(|r| r.relax_locality));
        assert_eq!(
            actions
                .iter()
                .filter(|a| matches!(a, Action::Request(r) if r.relax_locality))
                .count(),
            3
        );
        // Counters unchanged: a reissue is not an extra request.
        assert_eq!(state.role_status(2).unwrap().outstanding, 3);
    }

    #[test]
    fn test_degraded_cleared_by_grant() {
        let mut state = AppState::new(&role_set(), RoleHistory::new(1), 1).unwrap();
        state.review_all();
        state.on_tick();
        assert!(state.role_status(2).unwrap().degraded);

        grant(&mut state, 1, 2, "h1");
        assert!(!state.role_status(2).unwrap().degraded);
    }

    #[test]
    fn test_snapshot_keyed_by_role_name() {
        let mut state = state();
        state.review_all();
        let snapshot = state.role_status_snapshot();
        assert_eq!(snapshot["worker"].outstanding, 3);
        assert_eq!(snapshot["master"].desired, 1);
    }
}
