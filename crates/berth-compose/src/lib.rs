//! # berth-compose
//!
//! Declarative description of a CI run and its resolution into a start plan.
//!
//! Handles:
//! - **Spec**: `ServiceSpec` / `JobSpec` descriptors, validated on construction.
//! - **Validator**: run-level checks across all descriptors (unique names).
//! - **Graph**: dependency resolution into ordered start groups.
//! - **Resolver**: network alias bindings and the env vars they generate.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod graph;
pub mod resolver;
pub mod spec;
pub mod validator;

pub use graph::RunGraph;
pub use spec::{InitPayload, JobSpec, ProbeKind, ReadinessCheck, ServiceSpec, SourceMount};
