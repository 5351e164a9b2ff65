//! Fluent API for declaring and running a pipeline.

use std::sync::Arc;

use berth_common::config::OrchestratorConfig;
use berth_common::error::{BerthError, Result};
use berth_compose::RunGraph;
use berth_compose::spec::{JobSpec, ServiceSpec};
use berth_runtime::{ContainerRuntime, Orchestrator, RunReport};
use tokio_util::sync::CancellationToken;

use crate::event::EventListener;
use crate::plan::RunPlan;

/// Builder collecting the services, the job, and the orchestrator settings
/// of one pipeline.
#[derive(Debug, Default)]
pub struct Pipeline {
    services: Vec<ServiceSpec>,
    job: Option<JobSpec>,
    config: OrchestratorConfig,
}

impl Pipeline {
    /// Creates an empty pipeline with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a backing service.
    #[must_use]
    pub fn service(mut self, spec: ServiceSpec) -> Self {
        self.services.push(spec);
        self
    }

    /// Adds several backing services.
    #[must_use]
    pub fn services(mut self, specs: impl IntoIterator<Item = ServiceSpec>) -> Self {
        self.services.extend(specs);
        self
    }

    /// Sets the job under test.
    #[must_use]
    pub fn job(mut self, spec: JobSpec) -> Self {
        self.job = Some(spec);
        self
    }

    /// Replaces the orchestrator configuration.
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolves the dependency graph without running anything.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidSpec`] if no job was set, or any graph
    /// error from [`RunGraph::build`].
    pub fn graph(self) -> Result<RunGraph> {
        let job = self
            .job
            .ok_or_else(|| BerthError::invalid_spec("pipeline has no job"))?;
        RunGraph::build(job, self.services)
    }

    /// Resolves the pipeline and binds it to `runtime`.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be resolved or the
    /// configuration is invalid.
    pub fn prepare(self, runtime: Arc<dyn ContainerRuntime>) -> Result<PipelineRun> {
        let config = self.config.clone();
        let graph = self.graph()?;
        let orchestrator = Orchestrator::new(runtime, config)?;
        tracing::debug!(
            job = graph.job().name(),
            services = graph.service_count(),
            "pipeline prepared"
        );
        Ok(PipelineRun {
            orchestrator,
            graph,
        })
    }

    /// Resolves and runs the pipeline on `runtime`.
    ///
    /// # Errors
    ///
    /// Only resolution and configuration errors are returned; failures
    /// during the run are reported through the [`RunReport`]'s outcome.
    pub async fn run(self, runtime: Arc<dyn ContainerRuntime>) -> Result<RunReport> {
        let run = self.prepare(runtime)?;
        Ok(run.execute().await)
    }
}

/// A resolved pipeline bound to an orchestrator.
pub struct PipelineRun {
    orchestrator: Orchestrator,
    graph: RunGraph,
}

impl PipelineRun {
    /// The resolved start order.
    #[must_use]
    pub fn plan(&self) -> RunPlan {
        RunPlan::new(&self.graph)
    }

    /// Subscribes to lifecycle events of the next execution.
    #[must_use]
    pub fn events(&self) -> EventListener {
        EventListener::new(self.orchestrator.subscribe())
    }

    /// Runs the pipeline to completion.
    pub async fn execute(&self) -> RunReport {
        self.orchestrator.run(&self.graph).await
    }

    /// Runs the pipeline until it completes or `cancel` fires.
    pub async fn execute_with_cancel(&self, cancel: CancellationToken) -> RunReport {
        self.orchestrator.run_with_cancel(&self.graph, cancel).await
    }

    /// Retries the release of containers `report` left behind.
    ///
    /// # Errors
    ///
    /// Returns an error naming containers that still could not be released.
    pub async fn teardown(&self, report: &RunReport) -> Result<()> {
        self.orchestrator.teardown(report).await
    }
}
