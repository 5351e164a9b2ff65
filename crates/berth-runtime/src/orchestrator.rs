//! Lifecycle orchestrator that drives one run end to end.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use berth_common::config::OrchestratorConfig;
use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, RunId};
use berth_compose::RunGraph;
use berth_compose::resolver::ServiceBinding;
use berth_compose::spec::{JobSpec, ServiceSpec};
use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::event::{EventBus, RunEvent};
use crate::logs::LogCollector;
use crate::probe::ReadinessProber;
use crate::report::{Outcome, RunReport};
use crate::runtime::{ContainerConfig, ContainerRuntime};
use crate::teardown::{ResourceStack, TeardownAction, TeardownRecord, release};

/// Coordinates services, the job, output collection, and teardown.
///
/// Apart from the containers [`teardown`](Self::teardown) has released,
/// the orchestrator holds no per-run state; one instance can drive any
/// number of runs, sequentially or concurrently.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    config: OrchestratorConfig,
    events: EventBus,
    released: Mutex<HashSet<ContainerId>>,
}

impl Orchestrator {
    /// Creates an orchestrator backed by `runtime`.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidSpec`] if `config` fails validation.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        Ok(Self {
            runtime,
            config,
            events,
            released: Mutex::new(HashSet::new()),
        })
    }

    /// Subscribes to lifecycle events of subsequent runs.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Executes `graph` and tears everything down.
    ///
    /// Failures never surface as `Err`; they are classified into the
    /// report's [`Outcome`].
    pub async fn run(&self, graph: &RunGraph) -> RunReport {
        self.run_with_cancel(graph, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but stops early once `cancel` fires.
    ///
    /// Cancellation interrupts whatever is in flight and proceeds straight
    /// to teardown, which itself is not cancellable.
    pub async fn run_with_cancel(&self, graph: &RunGraph, cancel: CancellationToken) -> RunReport {
        let run_id = RunId::generate();
        let span = tracing::info_span!("run", %run_id, job = graph.job().name());
        self.execute(run_id, graph, cancel).instrument(span).await
    }

    async fn execute(&self, run_id: RunId, graph: &RunGraph, cancel: CancellationToken) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!(services = graph.service_count(), "run started");

        let mut stack = ResourceStack::new(Arc::clone(&self.runtime), self.config.stop_grace, graph);
        let collector = LogCollector::spawn(
            self.config.log_buffer,
            self.config.echo_output,
            self.config.log_drain_timeout,
        );
        let run_timeout = self.config.run_timeout;
        let deadline = async move {
            match run_timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::warn!("run cancelled");
                None
            }
            after = deadline => {
                tracing::warn!(?after, "run exceeded its time budget");
                Some(Err(BerthError::Timeout { subject: "run".to_string(), after }))
            }
            result = self.drive(graph, &mut stack, &collector) => Some(result),
        };

        let records = stack.unwind().await;
        for record in &records {
            self.events.emit(RunEvent::ContainerStopped {
                name: record.name.clone(),
                forced: record.action == TeardownAction::Killed,
            });
        }
        let logs = collector.finish().await;

        let outcome = classify(result, &records);
        match &outcome {
            Outcome::Success | Outcome::TestFailure { .. } => {
                tracing::info!(%outcome, "run finished");
            }
            Outcome::InfrastructureFailure { .. } => tracing::error!(%outcome, "run finished"),
            Outcome::ServiceUnready { .. } | Outcome::Timeout { .. } | Outcome::Cancelled => {
                tracing::warn!(%outcome, "run finished");
            }
        }
        self.events.emit(RunEvent::RunFinished {
            run_id,
            outcome: outcome.clone(),
        });

        RunReport::new(
            run_id,
            outcome,
            logs,
            stack.service_snapshots(),
            stack.job_snapshot(),
            records,
            started_at,
            clock.elapsed(),
        )
    }

    async fn drive(
        &self,
        graph: &RunGraph,
        stack: &mut ResourceStack,
        collector: &LogCollector,
    ) -> Result<i32> {
        for (level, group) in graph.groups().iter().enumerate() {
            tracing::debug!(level, services = group.len(), "starting group");
            self.start_group(graph, group, stack).await?;
        }
        self.run_job(graph, stack, collector).await
    }

    /// Creates, starts and probes one group of independent services.
    ///
    /// Every create and start in flight is awaited before an error is
    /// returned, so the stack knows about each container that exists.
    /// Probing fails fast.
    async fn start_group(
        &self,
        graph: &RunGraph,
        group: &[ServiceSpec],
        stack: &mut ResourceStack,
    ) -> Result<()> {
        let runtime = self.runtime.as_ref();

        let mut configs = Vec::with_capacity(group.len());
        for spec in group {
            let deps = bindings(graph, spec.name(), spec.depends_on(), stack)?;
            configs.push((spec.name(), ContainerConfig::service(spec, &deps)));
            self.events.emit(RunEvent::ServiceStarting {
                name: spec.name().to_string(),
            });
        }

        let mut failure = None;
        let mut creating: FuturesUnordered<_> = configs
            .iter()
            .map(|(name, config)| async move { (*name, runtime.create(config).await) })
            .collect();
        while let Some((name, result)) = creating.next().await {
            match result {
                Ok(id) => {
                    tracing::debug!(service = name, %id, "container created");
                    stack.record_created(name, id);
                }
                Err(e) => {
                    let e = attributed(name, e);
                    self.service_failed(stack, name, 0, &e);
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = failure.take() {
            return Err(e);
        }

        let created: Vec<(&str, ContainerId)> = group
            .iter()
            .filter_map(|s| stack.id_of(s.name()).cloned().map(|id| (s.name(), id)))
            .collect();
        let mut starting: FuturesUnordered<_> = created
            .iter()
            .map(|(name, id)| async move { (*name, runtime.start(id).await) })
            .collect();
        while let Some((name, result)) = starting.next().await {
            match result {
                Ok(()) => {
                    tracing::info!(service = name, "service started");
                    stack.record_started(name);
                }
                Err(e) => {
                    let e = attributed(name, e);
                    self.service_failed(stack, name, 0, &e);
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = failure.take() {
            return Err(e);
        }

        let prober = ReadinessProber::new(runtime);
        let prober = &prober;
        let default = self.config.default_probe;
        let mut probing = FuturesUnordered::new();
        for (spec, (_, id)) in group.iter().zip(&created) {
            match spec.readiness() {
                None => self.service_ready(stack, spec.name(), 0, Duration::ZERO),
                Some(check) => probing.push(async move {
                    let policy = check.effective_policy(&default);
                    (spec.name(), prober.wait_ready(spec.name(), id, check, policy).await)
                }),
            }
        }
        while let Some((name, result)) = probing.next().await {
            match result {
                Ok(probe) => self.service_ready(stack, name, probe.attempts, probe.elapsed),
                Err(e) => {
                    let attempts = match &e {
                        BerthError::ServiceUnready { attempts, .. } => *attempts,
                        _ => 0,
                    };
                    self.service_failed(stack, name, attempts, &e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn run_job(
        &self,
        graph: &RunGraph,
        stack: &mut ResourceStack,
        collector: &LogCollector,
    ) -> Result<i32> {
        let job = graph.job();
        let name = job.name();
        let deps = bindings(graph, name, job.depends_on(), stack)?;
        let config = ContainerConfig::job(job, &deps);

        let exit_code = match job.timeout() {
            Some(limit) => {
                let attempt =
                    tokio::time::timeout(limit, self.launch_job(job, &config, stack, collector)).await;
                if let Ok(result) = attempt {
                    result?
                } else {
                    tracing::warn!(job = name, ?limit, "job exceeded its timeout, killing");
                    stack.force(name);
                    return Err(BerthError::Timeout {
                        subject: name.to_string(),
                        after: limit,
                    });
                }
            }
            None => self.launch_job(job, &config, stack, collector).await?,
        };

        stack.mark_exited(name, exit_code);
        tracing::info!(job = name, exit_code, "job exited");
        self.events.emit(RunEvent::JobExited {
            name: name.to_string(),
            exit_code,
        });
        Ok(exit_code)
    }

    /// Creates and starts the job container, then runs its command.
    async fn launch_job(
        &self,
        job: &JobSpec,
        config: &ContainerConfig,
        stack: &mut ResourceStack,
        collector: &LogCollector,
    ) -> Result<i32> {
        let name = job.name();
        let id = match self.runtime.create(config).await {
            Ok(id) => id,
            Err(e) => return Err(job_failed(stack, name, e)),
        };
        tracing::debug!(job = name, %id, "container created");
        stack.record_created(name, id.clone());
        if let Err(e) = self.runtime.start(&id).await {
            return Err(job_failed(stack, name, e));
        }
        stack.record_started(name);
        stack.mark_ready(name, 0, Duration::ZERO);

        tracing::info!(job = name, command = ?job.command(), "job started");
        self.events.emit(RunEvent::JobStarted {
            name: name.to_string(),
        });

        self.runtime
            .exec(&id, job.command(), collector.sender())
            .await
            .map_err(|e| job_failed(stack, name, e))
    }

    fn service_ready(&self, stack: &mut ResourceStack, name: &str, attempts: u32, after: Duration) {
        stack.mark_ready(name, attempts, after);
        tracing::info!(service = name, attempts, ?after, "service ready");
        self.events.emit(RunEvent::ServiceReady {
            name: name.to_string(),
            attempts,
        });
    }

    fn service_failed(&self, stack: &mut ResourceStack, name: &str, attempts: u32, err: &BerthError) {
        stack.mark_failed(name, attempts);
        tracing::error!(service = name, error = %err, "service failed");
        self.events.emit(RunEvent::ServiceFailed {
            name: name.to_string(),
            reason: err.to_string(),
        });
    }

    /// Retries the release of every container `report` records as not
    /// released.
    ///
    /// Containers already released, during the run or by an earlier call,
    /// are skipped, so calling this on a run that tore down cleanly does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Runtime`] naming the containers that still
    /// could not be released.
    pub async fn teardown(&self, report: &RunReport) -> Result<()> {
        let mut still_running = Vec::new();
        for record in report.teardown_errors() {
            let known = self.released_ids().contains(&record.container_id);
            if known {
                continue;
            }
            let (action, error) = release(
                self.runtime.as_ref(),
                &record.container_id,
                false,
                self.config.stop_grace,
            )
            .await;
            match error {
                None => {
                    let _ = self.released_ids().insert(record.container_id.clone());
                    self.events.emit(RunEvent::ContainerStopped {
                        name: record.name.clone(),
                        forced: action == TeardownAction::Killed,
                    });
                }
                Some(error) => still_running.push(format!("{}: {error}", record.name)),
            }
        }
        if still_running.is_empty() {
            Ok(())
        } else {
            Err(BerthError::runtime("teardown", still_running.join("; ")))
        }
    }

    fn released_ids(&self) -> MutexGuard<'_, HashSet<ContainerId>> {
        self.released.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Prefixes a runtime error with the service it concerns.
fn attributed(service: &str, err: BerthError) -> BerthError {
    match err {
        BerthError::Runtime { operation, message } => BerthError::Runtime {
            operation,
            message: format!("service {service}: {message}"),
        },
        other => other,
    }
}

fn job_failed(stack: &mut ResourceStack, name: &str, err: BerthError) -> BerthError {
    stack.mark_failed(name, 0);
    tracing::error!(job = name, error = %err, "job failed");
    err
}

/// Binds each dependency of `dependent` to its created container.
fn bindings(
    graph: &RunGraph,
    dependent: &str,
    deps: &[String],
    stack: &ResourceStack,
) -> Result<Vec<(ServiceBinding, ContainerId)>> {
    deps.iter()
        .map(|dep| {
            let spec = graph
                .service(dep)
                .ok_or_else(|| BerthError::UnresolvedDependency {
                    dependent: dependent.to_string(),
                    dependency: dep.clone(),
                })?;
            let id = stack.id_of(dep).cloned().ok_or_else(|| {
                BerthError::runtime("create", format!("dependency {dep} has no container"))
            })?;
            Ok((ServiceBinding::for_service(spec), id))
        })
        .collect()
}

/// Folds the run result and teardown into one outcome.
///
/// `None` means the run was cancelled. A teardown failure only changes
/// the outcome of an otherwise successful run.
fn classify(result: Option<Result<i32>>, records: &[TeardownRecord]) -> Outcome {
    let outcome = match result {
        None => Outcome::Cancelled,
        Some(Ok(0)) => Outcome::Success,
        Some(Ok(exit_code)) => Outcome::TestFailure { exit_code },
        Some(Err(e)) => Outcome::from(e),
    };
    if !outcome.is_success() {
        return outcome;
    }
    match records.iter().find(|r| !r.released()) {
        Some(failed) => Outcome::InfrastructureFailure {
            message: format!(
                "teardown of {} failed: {}",
                failed.name,
                failed.error.as_deref().unwrap_or("unknown error")
            ),
        },
        None => outcome,
    }
}
