//! Unified error types for the Berth workspace.
//!
//! Construction-time and graph-time failures surface as `Err` values of
//! [`BerthError`]. Failures that happen while a run is in flight are folded
//! into the run report's outcome instead of being returned.

use std::time::Duration;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// A service or job description is malformed.
    #[error("invalid spec: {message}")]
    InvalidSpec {
        /// Description of the violated rule.
        message: String,
    },

    /// A service or job names a dependency that is not part of the run.
    #[error("\"{dependent}\" depends on unknown service \"{dependency}\"")]
    UnresolvedDependency {
        /// Name of the service or job declaring the dependency.
        dependent: String,
        /// Name that could not be resolved.
        dependency: String,
    },

    /// Services depend on each other in a cycle.
    #[error("cyclic dependency detected involving service \"{service}\"")]
    CyclicDependency {
        /// A service that participates in the cycle.
        service: String,
    },

    /// A service did not pass its readiness check in time.
    #[error("service \"{service}\" not ready after {attempts} probe attempt(s)")]
    ServiceUnready {
        /// Service that failed readiness.
        service: String,
        /// Number of probe attempts made.
        attempts: u32,
    },

    /// An operation exceeded its time budget.
    #[error("{subject} timed out after {after:?}")]
    Timeout {
        /// What timed out (job name or "run").
        subject: String,
        /// Budget that was exceeded.
        after: Duration,
    },

    /// The container runtime reported a fault.
    #[error("runtime error during {operation}: {message}")]
    Runtime {
        /// Runtime operation that failed.
        operation: &'static str,
        /// Runtime-specific description.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BerthError {
    /// Shorthand for an [`BerthError::InvalidSpec`] error.
    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            message: message.into(),
        }
    }

    /// Shorthand for a [`BerthError::Runtime`] error.
    pub fn runtime(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Runtime {
            operation,
            message: message.into(),
        }
    }

    /// Process exit code a command-line wrapper should report for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        use crate::constants as c;
        match self {
            Self::InvalidSpec { .. }
            | Self::UnresolvedDependency { .. }
            | Self::CyclicDependency { .. } => c::EXIT_INVALID_SPEC,
            Self::ServiceUnready { .. } => c::EXIT_SERVICE_UNREADY,
            Self::Timeout { .. } => c::EXIT_TIMEOUT,
            Self::Runtime { .. } | Self::Serialization { .. } => c::EXIT_INFRASTRUCTURE_FAILURE,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;
