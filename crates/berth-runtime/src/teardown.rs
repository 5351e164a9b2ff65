//! Ordered release of every container a run created.
//!
//! The [`ResourceStack`] records containers as they are created and started
//! and releases them in strict reverse start order. Containers that were
//! created but never started are released last. If the stack is dropped
//! with unreleased entries, the same teardown is spawned on the current
//! tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use berth_common::types::ContainerId;
use berth_compose::RunGraph;
use serde::{Deserialize, Serialize};

use crate::container::{ContainerSnapshot, ResourceKind, RunningContainer};
use crate::runtime::ContainerRuntime;

/// How a container was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownAction {
    /// Stopped gracefully.
    Stopped,
    /// Killed, either directly or after a failed stop.
    Killed,
}

/// Outcome of releasing one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownRecord {
    /// Container name.
    pub name: String,
    /// Role in the run.
    pub kind: ResourceKind,
    /// Released container.
    pub container_id: ContainerId,
    /// Last action attempted.
    pub action: TeardownAction,
    /// Why the container could not be released, if it could not.
    pub error: Option<String>,
}

impl TeardownRecord {
    /// Whether the container was released.
    #[must_use]
    pub const fn released(&self) -> bool {
        self.error.is_none()
    }
}

/// Containers of one run, in the order they must be released.
pub struct ResourceStack {
    runtime: Arc<dyn ContainerRuntime>,
    grace: Duration,
    entries: Vec<RunningContainer>,
    next_seq: u64,
}

impl ResourceStack {
    /// Creates a stack with a `Pending` entry for every service in `graph`
    /// followed by the job.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, grace: Duration, graph: &RunGraph) -> Self {
        let mut entries: Vec<RunningContainer> = graph
            .start_order()
            .map(|s| RunningContainer::pending(s.name(), ResourceKind::Service))
            .collect();
        entries.push(RunningContainer::pending(graph.job().name(), ResourceKind::Job));
        Self {
            runtime,
            grace,
            entries,
            next_seq: 0,
        }
    }

    /// Looks up an entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RunningContainer> {
        self.entries.iter().find(|e| e.name() == name)
    }

    /// Container ID of a created entry.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<&ContainerId> {
        self.get(name).and_then(RunningContainer::id)
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut RunningContainer> {
        self.entries.iter_mut().find(|e| e.name() == name)
    }

    /// Records that `name` was created as `id`.
    pub fn record_created(&mut self, name: &str, id: ContainerId) {
        if let Some(entry) = self.entry_mut(name) {
            entry.created(id);
        }
    }

    /// Records that `name` was started, fixing its place in the release order.
    pub fn record_started(&mut self, name: &str) {
        let seq = self.next_seq;
        if let Some(entry) = self.entry_mut(name) {
            entry.started(seq);
            self.next_seq += 1;
        }
    }

    /// Records that `name` passed readiness.
    pub fn mark_ready(&mut self, name: &str, attempts: u32, after: Duration) {
        if let Some(entry) = self.entry_mut(name) {
            entry.ready(attempts, after);
        }
    }

    /// Records that `name` failed to start or become ready.
    pub fn mark_failed(&mut self, name: &str, attempts: u32) {
        if let Some(entry) = self.entry_mut(name) {
            entry.failed(attempts);
        }
    }

    /// Records the exit status of `name`'s command.
    pub fn mark_exited(&mut self, name: &str, code: i32) {
        if let Some(entry) = self.entry_mut(name) {
            entry.exited(code);
        }
    }

    /// Marks `name` to be killed instead of stopped.
    pub fn force(&mut self, name: &str) {
        if let Some(entry) = self.entry_mut(name) {
            entry.force();
        }
    }

    /// Snapshots of the service entries.
    #[must_use]
    pub fn service_snapshots(&self) -> Vec<ContainerSnapshot> {
        self.entries
            .iter()
            .filter(|e| e.kind() == ResourceKind::Service)
            .map(RunningContainer::snapshot)
            .collect()
    }

    /// Snapshot of the job entry.
    #[must_use]
    pub fn job_snapshot(&self) -> Option<ContainerSnapshot> {
        self.entries
            .iter()
            .find(|e| e.kind() == ResourceKind::Job)
            .map(RunningContainer::snapshot)
    }

    /// Indices of entries awaiting release, in release order.
    fn release_order(&self) -> Vec<usize> {
        let mut started: Vec<(u64, usize)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.needs_release())
            .filter_map(|(i, e)| e.start_seq().map(|seq| (seq, i)))
            .collect();
        started.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let unstarted = self
            .entries
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, e)| e.needs_release() && e.start_seq().is_none())
            .map(|(i, _)| i);

        started.into_iter().map(|(_, i)| i).chain(unstarted).collect()
    }

    /// Releases every unreleased container.
    ///
    /// Calling it again releases nothing and returns no records.
    pub async fn unwind(&mut self) -> Vec<TeardownRecord> {
        let mut records = Vec::new();
        for index in self.release_order() {
            let entry = &self.entries[index];
            let Some(id) = entry.id().cloned() else {
                continue;
            };
            let (action, error) = release(self.runtime.as_ref(), &id, entry.is_forced(), self.grace).await;
            let entry = &mut self.entries[index];
            entry.released(error.is_none());
            records.push(TeardownRecord {
                name: entry.name().to_string(),
                kind: entry.kind(),
                container_id: id,
                action,
                error,
            });
        }
        records
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        let pending: Vec<(String, ContainerId, bool)> = self
            .release_order()
            .into_iter()
            .filter_map(|i| {
                let e = &self.entries[i];
                e.id().map(|id| (e.name().to_string(), id.clone(), e.is_forced()))
            })
            .collect();
        if pending.is_empty() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                containers = pending.len(),
                "run dropped outside a tokio runtime, containers left running"
            );
            return;
        };
        tracing::warn!(containers = pending.len(), "run dropped before teardown, releasing in background");
        let runtime = Arc::clone(&self.runtime);
        let grace = self.grace;
        drop(handle.spawn(async move {
            for (name, id, forced) in pending {
                let (_, error) = release(runtime.as_ref(), &id, forced, grace).await;
                if let Some(error) = error {
                    tracing::warn!(container = %name, %id, %error, "background teardown failed");
                }
            }
        }));
    }
}

/// Releases one container.
///
/// Unless `forced`, a graceful stop is tried first, bounded by `grace`.
/// A stop that fails or overruns is followed by a kill, also bounded by
/// `grace`. Only a failed kill leaves the container unreleased.
pub(crate) async fn release(
    runtime: &dyn ContainerRuntime,
    id: &ContainerId,
    forced: bool,
    grace: Duration,
) -> (TeardownAction, Option<String>) {
    if !forced {
        match tokio::time::timeout(grace, runtime.stop(id)).await {
            Ok(Ok(())) => {
                tracing::info!(%id, "container stopped");
                return (TeardownAction::Stopped, None);
            }
            Ok(Err(e)) => tracing::warn!(%id, error = %e, "stop failed, killing container"),
            Err(_) => tracing::warn!(%id, ?grace, "stop exceeded grace period, killing container"),
        }
    }
    match tokio::time::timeout(grace, runtime.kill(id)).await {
        Ok(Ok(())) => {
            tracing::warn!(%id, "container killed");
            (TeardownAction::Killed, None)
        }
        Ok(Err(e)) => {
            tracing::warn!(%id, error = %e, "kill failed");
            (TeardownAction::Killed, Some(e.to_string()))
        }
        Err(_) => {
            tracing::warn!(%id, ?grace, "kill did not complete");
            (
                TeardownAction::Killed,
                Some(format!("kill did not complete within {grace:?}")),
            )
        }
    }
}
