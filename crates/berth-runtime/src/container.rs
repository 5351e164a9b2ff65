//! Runtime handles for the containers of one run.
//!
//! Handles are owned by the orchestrator's resource stack and never leave
//! it; reports carry [`ContainerSnapshot`]s instead.

use std::time::Duration;

use berth_common::types::{ContainerId, ServiceStatus};
use serde::{Deserialize, Serialize};

/// Role a container plays in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// A backing service.
    Service,
    /// The job under test.
    Job,
}

/// A service or job container with its lifecycle state.
#[derive(Debug)]
pub struct RunningContainer {
    name: String,
    kind: ResourceKind,
    alias: String,
    id: Option<ContainerId>,
    status: ServiceStatus,
    start_seq: Option<u64>,
    forced: bool,
    unwound: bool,
    released: bool,
    probe_attempts: u32,
    ready_after: Option<Duration>,
    exit_code: Option<i32>,
}

impl RunningContainer {
    /// Creates a handle in the `Pending` state.
    #[must_use]
    pub fn pending(name: impl Into<String>, kind: ResourceKind) -> Self {
        let name = name.into();
        Self {
            alias: name.clone(),
            name,
            kind,
            id: None,
            status: ServiceStatus::Pending,
            start_seq: None,
            forced: false,
            unwound: false,
            released: false,
            probe_attempts: 0,
            ready_after: None,
            exit_code: None,
        }
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role in the run.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Container ID, once created.
    #[must_use]
    pub const fn id(&self) -> Option<&ContainerId> {
        self.id.as_ref()
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ServiceStatus {
        self.status
    }

    /// Position in the start sequence, once started.
    #[must_use]
    pub const fn start_seq(&self) -> Option<u64> {
        self.start_seq
    }

    /// Whether teardown must kill instead of stop.
    #[must_use]
    pub const fn is_forced(&self) -> bool {
        self.forced
    }

    /// Whether the container exists and teardown has not reached it yet.
    #[must_use]
    pub const fn needs_release(&self) -> bool {
        self.id.is_some() && !self.unwound
    }

    pub(crate) fn created(&mut self, id: ContainerId) {
        self.id = Some(id);
        self.status = ServiceStatus::Starting;
    }

    pub(crate) const fn started(&mut self, seq: u64) {
        self.start_seq = Some(seq);
    }

    pub(crate) fn ready(&mut self, attempts: u32, after: Duration) {
        self.status = ServiceStatus::Ready;
        self.probe_attempts = attempts;
        self.ready_after = Some(after);
    }

    pub(crate) fn failed(&mut self, attempts: u32) {
        self.status = ServiceStatus::Failed;
        self.probe_attempts = attempts;
    }

    pub(crate) const fn force(&mut self) {
        self.forced = true;
    }

    pub(crate) const fn exited(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    /// Records a teardown attempt. A `Failed` status survives a clean release.
    pub(crate) fn released(&mut self, ok: bool) {
        self.unwound = true;
        self.released = ok;
        if !ok {
            self.status = ServiceStatus::Failed;
        } else if self.status != ServiceStatus::Failed {
            self.status = ServiceStatus::Stopped;
        }
    }

    /// Captures the handle's state for a report.
    #[must_use]
    pub fn snapshot(&self) -> ContainerSnapshot {
        ContainerSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            alias: self.alias.clone(),
            container_id: self.id.clone(),
            status: self.status,
            released: self.released,
            probe_attempts: self.probe_attempts,
            ready_after: self.ready_after,
            exit_code: self.exit_code,
        }
    }
}

/// Point-in-time view of a container, as stored in a run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    /// Container name.
    pub name: String,
    /// Role in the run.
    pub kind: ResourceKind,
    /// Network alias.
    pub alias: String,
    /// Container ID, if the container was created.
    pub container_id: Option<ContainerId>,
    /// Final status.
    pub status: ServiceStatus,
    /// Whether teardown released the container cleanly.
    pub released: bool,
    /// Readiness probe attempts made.
    pub probe_attempts: u32,
    /// Time from start until readiness was confirmed.
    pub ready_after: Option<Duration>,
    /// Exit code of the job command.
    pub exit_code: Option<i32>,
}
