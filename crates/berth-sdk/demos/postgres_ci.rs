//! Postgres-backed `cargo test` pipeline on the in-memory runtime.
//!
//! Brings up a database with an init script and the source tree mounted,
//! binds it into a Rust build container as `db`, runs `cargo test` over the
//! same mount, and tears everything down. The fake runtime stands in for a container engine.
//!
//! Run with `RUST_LOG=info cargo run -p berth-sdk --example postgres_ci`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use berth_common::config::OrchestratorConfig;
use berth_compose::spec::{JobSpec, ReadinessCheck, ServiceSpec, SourceMount};
use berth_runtime::fake::{ContainerScript, FakeRuntime};
use berth_sdk::Pipeline;

const PG_INIT: &str = "#!/bin/sh\nset -e\npsql -v ON_ERROR_STOP=1 --username \"$POSTGRES_USER\" <<-EOSQL\n    CREATE DATABASE template;\nEOSQL\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let database = ServiceSpec::builder("db")
        .image("postgres:15-alpine")
        .env("POSTGRES_USER", "root")
        .env("POSTGRES_PASSWORD", "root")
        .port(5432)
        .source(SourceMount::new(".", "/app").exclude("ci/"))
        .init_file("/docker-entrypoint-initdb.d/init.sh", PG_INIT)
        .readiness(ReadinessCheck::tcp(5432).with_timeout(Duration::from_secs(30)))
        .build()
        .context("invalid database service")?;

    let tests = JobSpec::builder("rust:1.70.0")
        .source(SourceMount::new(".", "/app").exclude("ci/"))
        .workdir("/app")
        .env("DATABASE_HOST", "db")
        .env("DATABASE_TEMPLATE", "template")
        .depends_on("db")
        .command(["cargo", "test"])
        .timeout(Duration::from_secs(600))
        .build()
        .context("invalid test job")?;

    let runtime = Arc::new(
        FakeRuntime::new()
            .script("db", ContainerScript::default().fail_probes(2))
            .script(
                "job",
                ContainerScript::default()
                    .stdout([
                        "running 3 tests",
                        "test libs::pg::tests::connects ... ok",
                        "test libs::random::tests::alphanumeric ... ok",
                        "test server::tests::health ... ok",
                        "test result: ok. 3 passed; 0 failed",
                    ])
                    .stderr(["   Compiling app v0.1.0 (/app)"])
                    .exit_code(0),
            ),
    );

    let run = Pipeline::new()
        .service(database)
        .job(tests)
        .config(OrchestratorConfig::default())
        .prepare(runtime)
        .context("pipeline did not resolve")?;
    tracing::info!(plan = %run.plan(), "starting pipeline");

    let mut events = run.events();
    let watcher = tokio::spawn(async move { events.until_finished().await.len() });

    let report = run.execute().await;
    let events_seen = watcher.await.context("event watcher panicked")?;

    tracing::info!(
        run_id = %report.run_id(),
        outcome = %report.outcome(),
        lines = report.logs().len(),
        events = events_seen,
        duration = ?report.duration(),
        "pipeline finished"
    );
    tracing::debug!(report = %report.to_json()?, "run report");

    std::process::exit(report.exit_code());
}
