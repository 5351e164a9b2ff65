//! Run lifecycle management for Berth.
//!
//! The [`Orchestrator`](orchestrator::Orchestrator) is the only component
//! that performs effects. It drives a [`ContainerRuntime`](runtime::ContainerRuntime)
//! through a resolved run graph, probes services for readiness, runs the job
//! while collecting its output, and unwinds everything it started.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod container;
pub mod event;
pub mod fake;
pub mod logs;
pub mod orchestrator;
pub mod probe;
pub mod report;
pub mod runtime;
pub mod teardown;

pub use orchestrator::Orchestrator;
pub use report::{Outcome, RunReport};
pub use runtime::ContainerRuntime;
