//! Role definitions and configuration-time validation.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Resources requested for each container of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// Virtual cores per container.
    pub cores: u32,

    /// Memory per container, in MiB.
    pub memory_mb: u64,
}

impl ResourceProfile {
    pub fn new(cores: u32, memory_mb: u64) -> Self {
        Self { cores, memory_mb }
    }
}

/// Placement preference for a role's containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementPolicy {
    /// No preference beyond history hints.
    #[default]
    Any,

    /// Strongly prefer hosts the role ran on before.
    StrictAffinity,

    /// Spread instances: exclude hosts already running this role.
    AntiAffinity,
}

/// Immutable identity of a role.
///
/// The priority is the correlation key the resource manager echoes back on
/// grants, so it must be unique per role and positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role name, e.g. "worker" or "master".
    pub name: String,

    /// Request/grant correlation key. Unique per role, > 0.
    pub priority: u32,

    /// Resources per container.
    pub profile: ResourceProfile,

    /// Placement preference.
    #[serde(default)]
    pub placement: PlacementPolicy,

    /// When true, an instance failure of this role terminates the master.
    #[serde(default)]
    pub am_fatal: bool,
}

/// One operator-declared role plus its initial desired instance count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    #[serde(flatten)]
    pub role: Role,

    /// Initial desired instance count. Changed at runtime by flex requests.
    #[serde(default)]
    pub desired: u32,
}

/// The full operator target: every role the application runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet {
    pub roles: Vec<RoleSpec>,
}

impl RoleSet {
    /// Validate the role set.
    ///
    /// Never silently corrects: the first problem found is returned and the
    /// caller is expected to refuse to start.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut seen_names: Vec<&str> = Vec::new();
        let mut seen_priorities: Vec<(u32, &str)> = Vec::new();

        for spec in &self.roles {
            let role = &spec.role;
            if role.name.is_empty() {
                return Err(ModelError::EmptyRoleName);
            }
            if seen_names.contains(&role.name.as_str()) {
                return Err(ModelError::DuplicateRoleName(role.name.clone()));
            }
            if role.priority == 0 {
                return Err(ModelError::NonPositivePriority {
                    role: role.name.clone(),
                    priority: 0,
                });
            }
            if let Some((priority, first)) = seen_priorities
                .iter()
                .find(|(p, _)| *p == role.priority)
                .copied()
            {
                return Err(ModelError::DuplicatePriority {
                    priority,
                    first: first.to_string(),
                    second: role.name.clone(),
                });
            }
            if role.profile.cores == 0 {
                return Err(ModelError::InvalidProfile {
                    role: role.name.clone(),
                    reason: "cores must be positive".to_string(),
                });
            }
            if role.profile.memory_mb == 0 {
                return Err(ModelError::InvalidProfile {
                    role: role.name.clone(),
                    reason: "memory_mb must be positive".to_string(),
                });
            }

            seen_names.push(&role.name);
            seen_priorities.push((role.priority, &role.name));
        }

        Ok(())
    }

    /// Look up a role by its priority.
    pub fn role_by_priority(&self, priority: u32) -> Option<&Role> {
        self.roles
            .iter()
            .map(|s| &s.role)
            .find(|r| r.priority == priority)
    }

    /// Look up a role by name.
    pub fn role_by_name(&self, name: &str) -> Option<&Role> {
        self.roles.iter().map(|s| &s.role).find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn role(name: &str, priority: u32) -> RoleSpec {
        RoleSpec {
            role: Role {
                name: name.to_string(),
                priority,
                profile: ResourceProfile::new(1, 512),
                placement: PlacementPolicy::Any,
                am_fatal: false,
            },
            desired: 1,
        }
    }

    #[test]
    fn test_valid_role_set() {
        let set = RoleSet {
            roles: vec![role("master", 1), role("worker", 2)],
        };
        assert!(set.validate().is_ok());
        assert_eq!(set.role_by_priority(2).unwrap().name, "worker");
        assert_eq!(set.role_by_name("master").unwrap().priority, 1);
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        let set = RoleSet {
            roles: vec![role("master", 1), role("worker", 1)],
        };
        assert_eq!(
            set.validate(),
            Err(ModelError::DuplicatePriority {
                priority: 1,
                first: "master".to_string(),
                second: "worker".to_string(),
            })
        );
    }

    #[test]
    fn test_zero_priority_rejected() {
        let set = RoleSet {
            roles: vec![role("worker", 0)],
        };
        assert!(matches!(
            set.validate(),
            Err(ModelError::NonPositivePriority { .. })
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let set = RoleSet {
            roles: vec![role("worker", 1), role("worker", 2)],
        };
        assert_eq!(
            set.validate(),
            Err(ModelError::DuplicateRoleName("worker".to_string()))
        );
    }

    #[rstest]
    #[case(0, 512)]
    #[case(1, 0)]
    fn test_invalid_profile_rejected(#[case] cores: u32, #[case] memory_mb: u64) {
        let mut spec = role("worker", 1);
        spec.role.profile = ResourceProfile { cores, memory_mb };
        let set = RoleSet { roles: vec![spec] };
        assert!(matches!(
            set.validate(),
            Err(ModelError::InvalidProfile { .. })
        ));
    }

    #[test]
    fn test_role_set_json_roundtrip() {
        let set = RoleSet {
            roles: vec![role("worker", 2)],
        };
        let json = serde_json::to_string(&set).unwrap();
        let back: RoleSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_placement_policy_from_config() {
        let json = r#"{
            "roles": [{
                "name": "region",
                "priority": 3,
                "profile": { "cores": 2, "memory_mb": 1024 },
                "placement": "anti-affinity",
                "desired": 4
            }]
        }"#;
        let set: RoleSet = serde_json::from_str(json).unwrap();
        assert_eq!(set.roles[0].role.placement, PlacementPolicy::AntiAffinity);
        assert!(!set.roles[0].role.am_fatal);
    }
}
