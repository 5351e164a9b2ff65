//! Workspace-wide constants and defaults.

use std::time::Duration;

/// Name given to a job when none is set explicitly.
pub const DEFAULT_JOB_NAME: &str = "job";

/// Target path prefixes an init payload may be written under.
pub const DEFAULT_INIT_PREFIXES: &[&str] = &["/docker-entrypoint-initdb.d"];

/// File mode for init payloads (executable script).
pub const DEFAULT_INIT_MODE: u32 = 0o755;

/// Capacity of the bounded job output channel.
pub const DEFAULT_LOG_BUFFER: usize = 256;

/// Capacity of the lifecycle event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Grace period granted to a container stop before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// How long the collector keeps draining output after the job finished.
pub const DEFAULT_LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay before the second readiness attempt.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on the delay between readiness attempts.
pub const DEFAULT_PROBE_MAX_INTERVAL: Duration = Duration::from_secs(2);

/// Backoff factor applied after every failed readiness attempt.
pub const DEFAULT_PROBE_MULTIPLIER: u32 = 2;

/// Overall readiness budget for a single service.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Process exit code for a successful run.
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit code for a job that ran and failed.
pub const EXIT_TEST_FAILURE: i32 = 1;
/// Process exit code for an invalid or unresolvable pipeline description.
pub const EXIT_INVALID_SPEC: i32 = 2;
/// Process exit code for a service that never became ready.
pub const EXIT_SERVICE_UNREADY: i32 = 3;
/// Process exit code for a job or run that exceeded its time budget.
pub const EXIT_TIMEOUT: i32 = 4;
/// Process exit code for a container runtime fault.
pub const EXIT_INFRASTRUCTURE_FAILURE: i32 = 5;
/// Process exit code for an externally cancelled run.
pub const EXIT_CANCELLED: i32 = 130;
