//! End-to-end runs of the orchestrator against the in-memory runtime.
//!
//! Each test declares a small pipeline (a database service plus a job),
//! scripts the fake runtime, runs it, and checks the report together with
//! the exact sequence of runtime calls.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use berth_common::config::{OrchestratorConfig, ProbePolicy};
use berth_common::error::BerthError;
use berth_common::types::ServiceStatus;
use berth_compose::spec::{JobSpec, ReadinessCheck, ServiceSpec, SourceMount};
use berth_compose::RunGraph;
use berth_runtime::event::RunEvent;
use berth_runtime::fake::{ContainerScript, FakeRuntime, RuntimeCall};
use berth_runtime::teardown::TeardownAction;
use berth_runtime::{ContainerRuntime, Orchestrator, Outcome};
use tokio_util::sync::CancellationToken;

fn probe(timeout: Duration) -> ProbePolicy {
    ProbePolicy {
        interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(20),
        multiplier: 2,
        timeout,
    }
}

fn db(probe_timeout: Duration) -> ServiceSpec {
    ServiceSpec::builder("db")
        .image("postgres:15-alpine")
        .env("POSTGRES_USER", "root")
        .env("POSTGRES_PASSWORD", "root")
        .port(5432)
        .source(SourceMount::new("/repo", "/app").exclude("ci/"))
        .init_file("/docker-entrypoint-initdb.d/init.sh", "#!/bin/sh\ncreatedb template\n")
        .readiness(ReadinessCheck::tcp(5432).with_policy(probe(probe_timeout)))
        .build()
        .unwrap()
}

fn cargo_test() -> berth_compose::spec::JobBuilder {
    JobSpec::builder("rust:1.70.0")
        .source(SourceMount::new("/repo", "/app").exclude("ci/"))
        .env("DATABASE_HOST", "db")
        .env("DATABASE_TEMPLATE", "template")
        .depends_on("db")
        .command(["cargo", "test"])
}

fn graph(job: JobSpec, services: Vec<ServiceSpec>) -> RunGraph {
    RunGraph::build(job, services).unwrap()
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        stop_grace: Duration::from_millis(200),
        log_drain_timeout: Duration::from_millis(200),
        echo_output: false,
        ..OrchestratorConfig::default()
    }
}

fn orchestrator(rt: &Arc<FakeRuntime>, config: OrchestratorConfig) -> Orchestrator {
    let runtime: Arc<dyn ContainerRuntime> = rt.clone();
    Orchestrator::new(runtime, config).unwrap()
}

// ── Outcomes ─────────────────────────────────────────────────────────

#[tokio::test]
async fn db_ready_after_two_failed_probes_and_passing_job_is_success() {
    let rt = Arc::new(
        FakeRuntime::new()
            .script("db", ContainerScript::default().fail_probes(2))
            .script(
                "job",
                ContainerScript::default()
                    .stdout(["running 3 tests", "test result: ok. 3 passed"])
                    .exit_code(0),
            ),
    );
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);

    let report = orchestrator(&rt, config()).run(&g).await;

    assert_eq!(report.outcome(), &Outcome::Success);
    assert_eq!(report.exit_code(), 0);
    assert!(report.log_text().contains("test result: ok"));
    let snap = report.service("db").unwrap();
    assert_eq!(snap.probe_attempts, 3);
    assert_eq!(snap.status, ServiceStatus::Stopped);
    assert_eq!(report.job().unwrap().exit_code, Some(0));
    assert_eq!(rt.start_order(), ["db", "job"]);
    assert_eq!(rt.stop_order(), ["job", "db"]);
    assert!(report.teardown().iter().all(|r| r.action == TeardownAction::Stopped));
}

#[tokio::test]
async fn failing_job_is_test_failure() {
    let rt = Arc::new(
        FakeRuntime::new()
            .script("db", ContainerScript::default().fail_probes(2))
            .script(
                "job",
                ContainerScript::default()
                    .stdout(["test db::migrations ... FAILED"])
                    .exit_code(1),
            ),
    );
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);

    let report = orchestrator(&rt, config()).run(&g).await;

    assert_eq!(report.outcome(), &Outcome::TestFailure { exit_code: 1 });
    assert_eq!(report.exit_code(), 1);
    assert!(report.log_text().contains("FAILED"));
    assert_eq!(rt.stop_order(), ["job", "db"]);
}

#[tokio::test]
async fn db_never_ready_aborts_before_the_job_starts() {
    let rt = Arc::new(FakeRuntime::new().script("db", ContainerScript::default().never_ready()));
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_millis(100))]);

    let report = orchestrator(&rt, config()).run(&g).await;

    match report.outcome() {
        Outcome::ServiceUnready { service, attempts } => {
            assert_eq!(service, "db");
            assert!(*attempts >= 2, "attempts = {attempts}");
        }
        other => panic!("unexpected outcome: {other}"),
    }
    assert_eq!(report.exit_code(), 3);
    assert!(!rt.started("job"));
    assert_eq!(rt.count(&RuntimeCall::Create("job".into())), 0);
    assert_eq!(rt.stop_order(), ["db"]);
    let db = report.service("db").unwrap();
    assert_eq!(db.status, ServiceStatus::Failed);
    assert!(db.released);
}

#[tokio::test]
async fn job_exceeding_its_timeout_is_killed() {
    let rt = Arc::new(
        FakeRuntime::new().script("job", ContainerScript::default().stdout(["compiling"]).hang()),
    );
    let job = cargo_test().timeout(Duration::from_millis(100)).build().unwrap();
    let g = graph(job, vec![db(Duration::from_secs(5))]);

    let report = orchestrator(&rt, config()).run(&g).await;

    assert!(matches!(
        report.outcome(),
        Outcome::Timeout { subject, after } if subject == "job" && *after == Duration::from_millis(100)
    ));
    assert_eq!(rt.count(&RuntimeCall::Kill("job".into())), 1);
    assert_eq!(rt.count(&RuntimeCall::Stop("job".into())), 0);
    assert_eq!(rt.stop_order(), ["job", "db"]);
    assert!(report.log_text().contains("compiling"));
}

#[tokio::test]
async fn job_timeout_also_bounds_container_start() {
    let rt = Arc::new(FakeRuntime::new().script(
        "job",
        ContainerScript::default().start_delay(Duration::from_secs(3600)),
    ));
    let job = JobSpec::builder("rust:1.70.0")
        .command(["cargo", "test"])
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let g = graph(job, Vec::new());

    let report = tokio::time::timeout(Duration::from_secs(10), orchestrator(&rt, config()).run(&g))
        .await
        .expect("job start was not bounded by the job timeout");

    assert!(matches!(
        report.outcome(),
        Outcome::Timeout { subject, .. } if subject == "job"
    ));
    assert_eq!(rt.count(&RuntimeCall::Start("job".into())), 0);
    assert_eq!(rt.count(&RuntimeCall::Exec("job".into())), 0);
    assert_eq!(rt.count(&RuntimeCall::Kill("job".into())), 1);
    assert_eq!(rt.count(&RuntimeCall::Stop("job".into())), 0);
    assert_eq!(report.job().unwrap().exit_code, None);
}

#[tokio::test]
async fn run_timeout_covers_the_whole_run() {
    let rt = Arc::new(FakeRuntime::new().script("job", ContainerScript::default().hang()));
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);
    let config = OrchestratorConfig {
        run_timeout: Some(Duration::from_millis(100)),
        ..config()
    };

    let report = orchestrator(&rt, config).run(&g).await;

    assert!(matches!(report.outcome(), Outcome::Timeout { subject, .. } if subject == "run"));
    assert_eq!(report.exit_code(), 4);
    assert_eq!(rt.stop_order(), ["job", "db"]);
}

#[tokio::test]
async fn start_failure_is_infrastructure_failure_without_retry() {
    let rt = Arc::new(
        FakeRuntime::new().script("db", ContainerScript::default().fail_start("image not found")),
    );
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);

    let report = orchestrator(&rt, config()).run(&g).await;

    assert!(matches!(
        report.outcome(),
        Outcome::InfrastructureFailure { message } if message.contains("image not found")
    ));
    assert_eq!(report.exit_code(), 5);
    assert_eq!(rt.count(&RuntimeCall::Start("db".into())), 1);
    assert_eq!(rt.count(&RuntimeCall::Create("job".into())), 0);
    let db = report.service("db").unwrap();
    assert_eq!(db.status, ServiceStatus::Failed);
    assert!(db.released);
    assert_eq!(rt.count(&RuntimeCall::Stop("db".into())), 1);
}

#[tokio::test]
async fn start_failure_in_a_group_names_the_service_and_keeps_its_status() {
    let rt = Arc::new(
        FakeRuntime::new().script("b", ContainerScript::default().fail_start("image not found")),
    );
    let services: Vec<ServiceSpec> = ["a", "b", "c"]
        .into_iter()
        .map(|name| ServiceSpec::builder(name).image("svc:latest").build().unwrap())
        .collect();
    let job = JobSpec::builder("rust:1.70.0")
        .depends_on("a")
        .depends_on("b")
        .depends_on("c")
        .command(["cargo", "test"])
        .build()
        .unwrap();
    let g = graph(job, services);

    let report = orchestrator(&rt, config()).run(&g).await;

    match report.outcome() {
        Outcome::InfrastructureFailure { message } => {
            assert!(message.contains("service b: image not found"), "message = {message}");
        }
        other => panic!("unexpected outcome: {other}"),
    }
    let b = report.service("b").unwrap();
    assert_eq!(b.status, ServiceStatus::Failed);
    assert!(b.released);
    for name in ["a", "c"] {
        let snap = report.service(name).unwrap();
        assert_eq!(snap.status, ServiceStatus::Stopped, "{name}");
        assert!(snap.released, "{name}");
    }
    assert_eq!(rt.count(&RuntimeCall::Create("job".into())), 0);
    assert_eq!(report.teardown().len(), 3);
}

#[tokio::test]
async fn cancellation_tears_everything_down() {
    let rt = Arc::new(FakeRuntime::new().script("job", ContainerScript::default().hang()));
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let _ = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = orchestrator(&rt, config()).run_with_cancel(&g, cancel).await;

    assert_eq!(report.outcome(), &Outcome::Cancelled);
    assert_eq!(report.exit_code(), 130);
    assert_eq!(rt.stop_order(), ["job", "db"]);
}

// ── Teardown ─────────────────────────────────────────────────────────

#[tokio::test]
async fn teardown_of_a_finished_run_has_no_effect() {
    let rt = Arc::new(FakeRuntime::new());
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);
    let orch = orchestrator(&rt, config());

    let report = orch.run(&g).await;
    let calls = rt.calls();
    orch.teardown(&report).await.unwrap();
    orch.teardown(&report).await.unwrap();

    assert_eq!(rt.calls(), calls);
}

#[tokio::test]
async fn teardown_failure_after_success_is_infrastructure_failure() {
    let rt = Arc::new(FakeRuntime::new().script(
        "db",
        ContainerScript::default()
            .fail_stop("daemon busy")
            .fail_kill("daemon gone"),
    ));
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);
    let orch = orchestrator(&rt, config());

    let report = orch.run(&g).await;

    assert!(matches!(
        report.outcome(),
        Outcome::InfrastructureFailure { message } if message.contains("daemon gone")
    ));
    assert_eq!(report.job().unwrap().exit_code, Some(0));
    let errors: Vec<_> = report.teardown_errors().map(|r| r.name.as_str()).collect();
    assert_eq!(errors, ["db"]);
    let err = orch.teardown(&report).await.unwrap_err();
    assert!(matches!(err, BerthError::Runtime { operation: "teardown", .. }));
}

#[tokio::test]
async fn retried_teardown_releases_once_and_then_skips() {
    let rt = Arc::new(FakeRuntime::new().script("db", ContainerScript::default().fail_releases(1)));
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);
    let orch = orchestrator(&rt, config());

    let report = orch.run(&g).await;
    assert!(matches!(report.outcome(), Outcome::InfrastructureFailure { .. }));
    assert_eq!(report.teardown_errors().count(), 1);

    orch.teardown(&report).await.unwrap();
    assert_eq!(rt.count(&RuntimeCall::Stop("db".into())), 2);
    assert_eq!(rt.count(&RuntimeCall::Kill("db".into())), 1);

    let calls = rt.calls();
    orch.teardown(&report).await.unwrap();
    assert_eq!(rt.calls(), calls);
}

#[tokio::test]
async fn teardown_failure_does_not_mask_test_failure() {
    let rt = Arc::new(
        FakeRuntime::new()
            .script("db", ContainerScript::default().fail_stop("busy").fail_kill("gone"))
            .script("job", ContainerScript::default().exit_code(2)),
    );
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);

    let report = orchestrator(&rt, config()).run(&g).await;

    assert_eq!(report.outcome(), &Outcome::TestFailure { exit_code: 2 });
    assert_eq!(report.teardown_errors().count(), 1);
}

// ── Wiring & ordering ────────────────────────────────────────────────

#[tokio::test]
async fn job_receives_bindings_mount_and_environment() {
    let rt = Arc::new(FakeRuntime::new());
    let job = cargo_test().env("DB_HOST", "override").build().unwrap();
    let g = graph(job, vec![db(Duration::from_secs(5))]);

    let _ = orchestrator(&rt, config()).run(&g).await;

    let job = rt.created("job").unwrap();
    assert_eq!(job.env_var("DATABASE_HOST"), Some("db"));
    assert_eq!(job.env_var("DATABASE_TEMPLATE"), Some("template"));
    assert_eq!(job.env_var("DB_HOST"), Some("override"));
    assert_eq!(job.env_var("DB_PORT"), Some("5432"));
    assert_eq!(job.workdir.as_deref(), Some(std::path::Path::new("/app")));
    assert_eq!(job.mounts[0].exclude, ["ci/"]);
    assert_eq!(job.bindings[0].alias, "db");

    let db = rt.created("db").unwrap();
    assert_eq!(db.files.len(), 1);
    assert_eq!(db.env_var("POSTGRES_USER"), Some("root"));
    assert_eq!(db.mounts.len(), 1);
    assert_eq!(db.mounts[0].target, std::path::Path::new("/app"));
    assert_eq!(db.mounts[0].exclude, ["ci/"]);
    assert_eq!(db.workdir, None);
}

#[tokio::test]
async fn dependent_services_start_after_their_dependencies() {
    let rt = Arc::new(
        FakeRuntime::new()
            .script("db", ContainerScript::default().start_delay(Duration::from_millis(30)))
            .script("cache", ContainerScript::default()),
    );
    let api = ServiceSpec::builder("api")
        .image("api:latest")
        .port(8080)
        .depends_on("db")
        .depends_on("cache")
        .build()
        .unwrap();
    let cache = ServiceSpec::builder("cache").image("redis:7").port(6379).build().unwrap();
    let job = JobSpec::builder("curl")
        .depends_on("api")
        .command(["curl", "http://api:8080/health"])
        .build()
        .unwrap();
    let g = graph(job, vec![db(Duration::from_secs(5)), cache, api]);

    let report = orchestrator(&rt, config()).run(&g).await;

    assert!(report.outcome().is_success(), "{}", report.outcome());
    assert_eq!(rt.start_order(), ["cache", "db", "api", "job"]);
    assert_eq!(rt.stop_order(), ["job", "api", "db", "cache"]);
    let api = rt.created("api").unwrap();
    assert_eq!(api.env_var("DB_PORT"), Some("5432"));
    assert_eq!(api.env_var("CACHE_HOST"), Some("cache"));
}

#[test]
fn cyclic_services_are_rejected_before_anything_runs() {
    let a = ServiceSpec::builder("a").image("x").depends_on("b").build().unwrap();
    let b = ServiceSpec::builder("b").image("x").depends_on("a").build().unwrap();
    let job = JobSpec::builder("x").depends_on("a").command(["true"]).build().unwrap();

    let err = RunGraph::build(job, vec![a, b]).unwrap_err();
    assert!(matches!(err, BerthError::CyclicDependency { .. }));
    assert_eq!(err.exit_code(), 2);
}

// ── Output & events ──────────────────────────────────────────────────

#[tokio::test]
async fn single_slot_log_buffer_loses_nothing() {
    let lines: Vec<String> = (0..1000).map(|i| format!("line {i}")).collect();
    let rt = Arc::new(
        FakeRuntime::new().script("job", ContainerScript::default().stdout(lines.clone())),
    );
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);
    let config = OrchestratorConfig {
        log_buffer: 1,
        ..config()
    };

    let report = orchestrator(&rt, config).run(&g).await;

    let got: Vec<&str> = report.logs().iter().map(|e| e.line.as_str()).collect();
    assert_eq!(got, lines);
}

#[tokio::test]
async fn lifecycle_events_are_published_in_order() {
    let rt = Arc::new(FakeRuntime::new());
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);
    let config = OrchestratorConfig {
        event_capacity: 32,
        ..config()
    };
    let orch = orchestrator(&rt, config);
    let mut events = orch.subscribe();

    let report = orch.run(&g).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let ready = seen
        .iter()
        .position(|e| matches!(e, RunEvent::ServiceReady { name, .. } if name == "db"))
        .unwrap();
    let started = seen
        .iter()
        .position(|e| matches!(e, RunEvent::JobStarted { .. }))
        .unwrap();
    assert!(ready < started);
    assert!(matches!(
        seen.last(),
        Some(RunEvent::RunFinished { run_id, outcome: Outcome::Success }) if *run_id == report.run_id()
    ));
}

#[tokio::test]
async fn report_serializes_to_json() {
    let rt = Arc::new(FakeRuntime::new().script("job", ContainerScript::default().stdout(["ok"])));
    let g = graph(cargo_test().build().unwrap(), vec![db(Duration::from_secs(5))]);

    let report = orchestrator(&rt, config()).run(&g).await;
    let json = report.to_json().unwrap();

    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["outcome"]["kind"], "success");
    assert_eq!(value["logs"][0]["line"], "ok");
    assert_eq!(value["services"][0]["name"], "db");
}
