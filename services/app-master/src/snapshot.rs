//! Monitoring snapshot types.
//!
//! Published on a watch channel after every state change so a monitoring
//! collaborator can render role health without touching reconciler state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::RoleStatus;

/// Point-in-time view of every role's counters.
#[derive(Debug, Clone, Serialize)]
pub struct MasterSnapshot {
    pub taken_at: DateTime<Utc>,

    /// Role name to counters.
    pub roles: BTreeMap<String, RoleStatus>,
}

impl MasterSnapshot {
    pub fn new(roles: BTreeMap<String, RoleStatus>) -> Self {
        Self {
            taken_at: Utc::now(),
            roles,
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let mut roles = BTreeMap::new();
        roles.insert(
            "worker".to_string(),
            RoleStatus {
                desired: 3,
                actual: 1,
                outstanding: 2,
                pending_release: 0,
                degraded: false,
            },
        );

        let json = serde_json::to_value(MasterSnapshot::new(roles)).unwrap();
        assert_eq!(json["roles"]["worker"]["desired"], 3);
        assert_eq!(json["roles"]["worker"]["outstanding"], 2);
    }
}
