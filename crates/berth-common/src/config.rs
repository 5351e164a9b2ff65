//! Configuration model for the orchestrator.
//!
//! Everything a run needs is passed in through [`OrchestratorConfig`];
//! nothing is read from the process environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{BerthError, Result};

/// Backoff schedule for readiness probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePolicy {
    /// Delay before the second attempt.
    pub interval: Duration,
    /// Ceiling for the delay between attempts.
    pub max_interval: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: u32,
    /// Overall budget for the service to become ready.
    pub timeout: Duration,
}

impl ProbePolicy {
    /// Returns a copy of this policy with a different overall timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the delay that follows `current` in the backoff schedule.
    #[must_use]
    pub fn next_interval(&self, current: Duration) -> Duration {
        current
            .checked_mul(self.multiplier)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    /// Checks the schedule is usable.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidSpec`] if the interval or multiplier is
    /// zero, or the initial interval exceeds the ceiling.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(BerthError::invalid_spec("probe interval must be non-zero"));
        }
        if self.multiplier == 0 {
            return Err(BerthError::invalid_spec("probe multiplier must be at least 1"));
        }
        if self.interval > self.max_interval {
            return Err(BerthError::invalid_spec(format!(
                "probe interval {:?} exceeds max interval {:?}",
                self.interval, self.max_interval
            )));
        }
        Ok(())
    }
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            interval: constants::DEFAULT_PROBE_INTERVAL,
            max_interval: constants::DEFAULT_PROBE_MAX_INTERVAL,
            multiplier: constants::DEFAULT_PROBE_MULTIPLIER,
            timeout: constants::DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Root configuration for an orchestrator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Budget for the whole run, from first service start to job exit.
    pub run_timeout: Option<Duration>,
    /// Grace period for stopping a container before it is killed.
    pub stop_grace: Duration,
    /// Capacity of the bounded job output channel.
    pub log_buffer: usize,
    /// How long to keep draining output once the job is done.
    pub log_drain_timeout: Duration,
    /// Whether job output lines are echoed through `tracing`.
    pub echo_output: bool,
    /// Probe schedule for services whose check sets no policy.
    pub default_probe: ProbePolicy,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_capacity: usize,
}

impl OrchestratorConfig {
    /// Checks that buffer sizes and the default probe policy are usable.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidSpec`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.log_buffer == 0 {
            return Err(BerthError::invalid_spec("log buffer capacity must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(BerthError::invalid_spec("event capacity must be non-zero"));
        }
        self.default_probe.validate()
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            run_timeout: None,
            stop_grace: constants::DEFAULT_STOP_GRACE,
            log_buffer: constants::DEFAULT_LOG_BUFFER,
            log_drain_timeout: constants::DEFAULT_LOG_DRAIN_TIMEOUT,
            echo_output: true,
            default_probe: ProbePolicy::default(),
            event_capacity: constants::DEFAULT_EVENT_CAPACITY,
        }
    }
}
