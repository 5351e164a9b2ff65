//! # berth-sdk
//!
//! Public SDK for using Berth as a Rust library.
//!
//! Provides three main entry points:
//! - [`Pipeline`](builder::Pipeline): Fluent API for declaring services and a job, then running them.
//! - [`RunPlan`](plan::RunPlan): Human-readable view of the resolved start order.
//! - [`EventListener`](event::EventListener): Follows lifecycle events while a run is in flight.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use berth_compose::spec::{JobSpec, ReadinessCheck, ServiceSpec};
//! use berth_runtime::fake::FakeRuntime;
//! use berth_sdk::builder::Pipeline;
//!
//! # async fn demo() -> berth_common::error::Result<()> {
//! let db = ServiceSpec::builder("db")
//!     .image("postgres:15-alpine")
//!     .port(5432)
//!     .readiness(ReadinessCheck::tcp(5432))
//!     .build()?;
//! let job = JobSpec::builder("rust:1.70.0")
//!     .depends_on("db")
//!     .command(["cargo", "test"])
//!     .build()?;
//!
//! let report = Pipeline::new()
//!     .service(db)
//!     .job(job)
//!     .run(Arc::new(FakeRuntime::new()))
//!     .await?;
//! assert!(report.outcome().is_success());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod builder;
pub mod event;
pub mod plan;

pub use builder::{Pipeline, PipelineRun};
pub use event::EventListener;
pub use plan::RunPlan;
