//! Run classification and the report handed back to callers.

use std::fmt;
use std::time::Duration;

use berth_common::constants;
use berth_common::error::{BerthError, Result};
use berth_common::types::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::container::ContainerSnapshot;
use crate::logs::LogEntry;
use crate::teardown::TeardownRecord;

/// Final classification of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The job exited 0 and teardown was clean.
    Success,
    /// The job ran and exited non-zero.
    TestFailure {
        /// Exit status of the job command.
        exit_code: i32,
    },
    /// A service never passed its readiness check; the job did not run.
    ServiceUnready {
        /// Service that failed readiness.
        service: String,
        /// Probe attempts made.
        attempts: u32,
    },
    /// The job or the whole run exceeded its time budget.
    Timeout {
        /// Job name, or `"run"` for the overall budget.
        subject: String,
        /// Budget that was exceeded.
        after: Duration,
    },
    /// The container runtime failed.
    InfrastructureFailure {
        /// Description of the fault.
        message: String,
    },
    /// The run was cancelled from outside.
    Cancelled,
}

impl Outcome {
    /// Process exit code a command-line wrapper should report.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Success => constants::EXIT_SUCCESS,
            Self::TestFailure { .. } => constants::EXIT_TEST_FAILURE,
            Self::ServiceUnready { .. } => constants::EXIT_SERVICE_UNREADY,
            Self::Timeout { .. } => constants::EXIT_TIMEOUT,
            Self::InfrastructureFailure { .. } => constants::EXIT_INFRASTRUCTURE_FAILURE,
            Self::Cancelled => constants::EXIT_CANCELLED,
        }
    }

    /// Whether the run succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<BerthError> for Outcome {
    fn from(err: BerthError) -> Self {
        match err {
            BerthError::ServiceUnready { service, attempts } => {
                Self::ServiceUnready { service, attempts }
            }
            BerthError::Timeout { subject, after } => Self::Timeout { subject, after },
            other => Self::InfrastructureFailure {
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::TestFailure { exit_code } => write!(f, "test failure (exit code {exit_code})"),
            Self::ServiceUnready { service, attempts } => {
                write!(f, "service {service} not ready after {attempts} attempt(s)")
            }
            Self::Timeout { subject, after } => write!(f, "{subject} timed out after {after:?}"),
            Self::InfrastructureFailure { message } => {
                write!(f, "infrastructure failure: {message}")
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    run_id: RunId,
    outcome: Outcome,
    logs: Vec<LogEntry>,
    services: Vec<ContainerSnapshot>,
    job: Option<ContainerSnapshot>,
    teardown: Vec<TeardownRecord>,
    started_at: DateTime<Utc>,
    duration: Duration,
}

impl RunReport {
    #[allow(clippy::too_many_arguments)]
    pub(crate) const fn new(
        run_id: RunId,
        outcome: Outcome,
        logs: Vec<LogEntry>,
        services: Vec<ContainerSnapshot>,
        job: Option<ContainerSnapshot>,
        teardown: Vec<TeardownRecord>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            run_id,
            outcome,
            logs,
            services,
            job,
            teardown,
            started_at,
            duration,
        }
    }

    /// Run identifier.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Final classification.
    #[must_use]
    pub const fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Job output in the order it was received.
    #[must_use]
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Job output joined into one newline-separated string.
    #[must_use]
    pub fn log_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.logs {
            out.push_str(&entry.line);
            out.push('\n');
        }
        out
    }

    /// Service snapshots in declaration order of the run graph.
    #[must_use]
    pub fn services(&self) -> &[ContainerSnapshot] {
        &self.services
    }

    /// Looks up a service snapshot by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ContainerSnapshot> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Job snapshot.
    #[must_use]
    pub const fn job(&self) -> Option<&ContainerSnapshot> {
        self.job.as_ref()
    }

    /// One record per container teardown touched, in release order.
    #[must_use]
    pub fn teardown(&self) -> &[TeardownRecord] {
        &self.teardown
    }

    /// Teardown records that failed to release their container.
    pub fn teardown_errors(&self) -> impl Iterator<Item = &TeardownRecord> {
        self.teardown.iter().filter(|r| !r.released())
    }

    /// When the run began.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wall-clock duration including teardown.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Process exit code for this run.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    /// Serializes the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
