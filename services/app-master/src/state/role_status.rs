//! Per-role live counters.

use serde::Serialize;

/// Provisioning state of a role relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Fewer instances (running or requested) than desired.
    UnderProvisioned,

    /// Counters match the target.
    Satisfied,

    /// More instances running than desired.
    OverProvisioned,
}

/// Live counters for one role.
///
/// Owned exclusively by [`AppState`]; every transition is computed from
/// these authoritative values, never from a cached decision. Decrements are
/// floor-clamped so duplicate or racing completion events can never drive a
/// counter negative.
///
/// [`AppState`]: crate::state::AppState
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleStatus {
    /// Operator target instance count.
    pub desired: u32,

    /// Instances currently running (including ones selected for release
    /// whose completion has not yet arrived).
    pub actual: u32,

    /// Container requests submitted but not yet granted or cancelled.
    pub outstanding: u32,

    /// Releases issued but not yet acknowledged by a completion.
    pub pending_release: u32,

    /// Set while the role has a request unanswered beyond the configured
    /// tick threshold; cleared by the next grant.
    pub degraded: bool,
}

impl RoleStatus {
    pub fn new(desired: u32) -> Self {
        Self {
            desired,
            ..Self::default()
        }
    }

    /// Classify the role by comparing `actual + outstanding` to `desired`.
    ///
    /// Instances already selected for release are not counted as excess
    /// again, so a role with releases in flight reads as satisfied until
    /// their completions arrive.
    pub fn provisioning_state(&self) -> ProvisioningState {
        if self.actual + self.outstanding < self.desired {
            ProvisioningState::UnderProvisioned
        } else if self.actual - self.pending_release.min(self.actual) > self.desired {
            ProvisioningState::OverProvisioned
        } else {
            ProvisioningState::Satisfied
        }
    }

    /// Instances still needed: `desired - (actual + outstanding)`.
    pub fn deficit(&self) -> u32 {
        self.desired.saturating_sub(self.actual + self.outstanding)
    }

    /// Instances to release beyond those already releasing.
    pub fn excess(&self) -> u32 {
        (self.actual.saturating_sub(self.pending_release)).saturating_sub(self.desired)
    }

    pub fn dec_actual(&mut self) {
        self.actual = self.actual.saturating_sub(1);
    }

    pub fn dec_outstanding(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    pub fn dec_pending_release(&mut self) {
        self.pending_release = self.pending_release.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(3, 1, 0, ProvisioningState::UnderProvisioned)]
    #[case(3, 1, 2, ProvisioningState::Satisfied)]
    #[case(1, 3, 0, ProvisioningState::OverProvisioned)]
    #[case(0, 0, 0, ProvisioningState::Satisfied)]
    fn test_provisioning_state(
        #[case] desired: u32,
        #[case] actual: u32,
        #[case] outstanding: u32,
        #[case] expected: ProvisioningState,
    ) {
        let status = RoleStatus {
            desired,
            actual,
            outstanding,
            ..Default::default()
        };
        assert_eq!(status.provisioning_state(), expected);
    }

    #[test]
    fn test_deficit_and_excess() {
        let under = RoleStatus {
            desired: 3,
            actual: 1,
            ..Default::default()
        };
        assert_eq!(under.deficit(), 2);
        assert_eq!(under.excess(), 0);

        let over = RoleStatus {
            desired: 1,
            actual: 3,
            ..Default::default()
        };
        assert_eq!(over.deficit(), 0);
        assert_eq!(over.excess(), 2);
    }

    #[test]
    fn test_in_flight_releases_not_excess() {
        let status = RoleStatus {
            desired: 1,
            actual: 3,
            pending_release: 2,
            ..Default::default()
        };
        assert_eq!(status.provisioning_state(), ProvisioningState::Satisfied);
        assert_eq!(status.excess(), 0);
    }

    #[test]
    fn test_decrements_floor_at_zero() {
        let mut status = RoleStatus::new(1);
        status.dec_actual();
        status.dec_outstanding();
        status.dec_pending_release();
        assert_eq!(status.actual, 0);
        assert_eq!(status.outstanding, 0);
        assert_eq!(status.pending_release, 0);
    }
}
