//! Lifecycle events emitted while a run is in flight.

use berth_common::types::RunId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::report::Outcome;

/// A lifecycle transition observed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// A service container is being created and started.
    ServiceStarting {
        /// Service name.
        name: String,
    },
    /// A service passed its readiness check.
    ServiceReady {
        /// Service name.
        name: String,
        /// Probe attempts it took.
        attempts: u32,
    },
    /// A service failed to start or to become ready.
    ServiceFailed {
        /// Service name.
        name: String,
        /// Human-readable cause.
        reason: String,
    },
    /// The job command began executing.
    JobStarted {
        /// Job name.
        name: String,
    },
    /// The job command exited.
    JobExited {
        /// Job name.
        name: String,
        /// Exit status of the command.
        exit_code: i32,
    },
    /// Teardown released a container.
    ContainerStopped {
        /// Container name.
        name: String,
        /// Whether it had to be killed.
        forced: bool,
    },
    /// The run completed and teardown finished.
    RunFinished {
        /// Run identifier.
        run_id: RunId,
        /// Final classification.
        outcome: Outcome,
    },
}

/// Broadcast hub for [`RunEvent`]s.
///
/// Emitting never blocks; slow subscribers observe a lag instead.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// Creates a bus retaining at most `capacity` undelivered events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Registers a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event to current subscribers.
    pub fn emit(&self, event: RunEvent) {
        tracing::trace!(?event, "run event");
        let _ = self.sender.send(event);
    }
}
