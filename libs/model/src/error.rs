//! Validation errors for role definitions.

use thiserror::Error;

/// Errors raised when validating a role set.
///
/// All of these are configuration errors: fatal at validation time, reported
/// before the master talks to the resource manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A role was defined without a name.
    #[error("role name cannot be empty")]
    EmptyRoleName,

    /// Two roles share a name.
    #[error("duplicate role name: {0}")]
    DuplicateRoleName(String),

    /// Role priority must be a positive integer.
    #[error("role '{role}' has non-positive priority {priority}")]
    NonPositivePriority { role: String, priority: i64 },

    /// Priorities correlate grants to requests and must be unique per role.
    #[error("roles '{first}' and '{second}' share priority {priority}")]
    DuplicatePriority {
        priority: u32,
        first: String,
        second: String,
    },

    /// A role's resource profile requests nothing.
    #[error("role '{role}' has an invalid resource profile: {reason}")]
    InvalidProfile { role: String, reason: String },
}
