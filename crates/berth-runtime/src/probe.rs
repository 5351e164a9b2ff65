//! Readiness probing with exponential backoff.

use std::time::Duration;

use berth_common::config::ProbePolicy;
use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;
use berth_compose::spec::{ProbeKind, ReadinessCheck};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::runtime::ContainerRuntime;

/// Result of a successful readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Time from the first attempt until success.
    pub elapsed: Duration,
}

/// Repeatedly checks a service until it is ready or its budget runs out.
pub struct ReadinessProber<'a> {
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> ReadinessProber<'a> {
    /// Creates a prober that reaches containers through `runtime`.
    #[must_use]
    pub const fn new(runtime: &'a dyn ContainerRuntime) -> Self {
        Self { runtime }
    }

    /// Probes `id` until `check` passes.
    ///
    /// The first attempt runs immediately. Later attempts follow the
    /// policy's backoff schedule, and no attempt or sleep outlasts the
    /// remaining budget.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::ServiceUnready`] once `policy.timeout` elapses
    /// without a passing attempt.
    pub async fn wait_ready(
        &self,
        service: &str,
        id: &ContainerId,
        check: &ReadinessCheck,
        policy: ProbePolicy,
    ) -> Result<ProbeOutcome> {
        let started = Instant::now();
        let deadline = started + policy.timeout;
        let mut delay = policy.interval;
        let mut attempts = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && attempts > 0 {
                break;
            }
            attempts += 1;
            let passed = tokio::time::timeout(remaining, self.attempt(service, id, check))
                .await
                .unwrap_or(false);
            if passed {
                let elapsed = started.elapsed();
                tracing::debug!(service, attempts, ?elapsed, "readiness check passed");
                return Ok(ProbeOutcome { attempts, elapsed });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(delay.min(remaining)).await;
            delay = policy.next_interval(delay);
        }

        tracing::warn!(service, attempts, timeout = ?policy.timeout, "service never became ready");
        Err(BerthError::ServiceUnready {
            service: service.to_string(),
            attempts,
        })
    }

    async fn attempt(&self, service: &str, id: &ContainerId, check: &ReadinessCheck) -> bool {
        let result = match &check.kind {
            ProbeKind::Tcp { port } => self.tcp(id, *port).await,
            ProbeKind::Command { argv } => self.command(id, argv).await,
        };
        match result {
            Ok(passed) => passed,
            Err(e) => {
                tracing::debug!(service, error = %e, "readiness attempt errored");
                false
            }
        }
    }

    async fn tcp(&self, id: &ContainerId, port: u16) -> Result<bool> {
        let addr = self.runtime.endpoint(id, port).await?;
        Ok(TcpStream::connect(addr).await.is_ok())
    }

    async fn command(&self, id: &ContainerId, argv: &[String]) -> Result<bool> {
        let (sink, _) = mpsc::channel(1);
        Ok(self.runtime.exec(id, argv, sink).await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{ContainerScript, FakeRuntime, RuntimeCall};
    use crate::runtime::ContainerConfig;
    use berth_compose::spec::ServiceSpec;

    fn fast(timeout: Duration) -> ProbePolicy {
        ProbePolicy {
            interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            multiplier: 2,
            timeout,
        }
    }

    async fn started(runtime: &FakeRuntime) -> ContainerId {
        let spec = ServiceSpec::builder("db")
            .image("postgres:15-alpine")
            .port(5432)
            .build()
            .unwrap();
        let id = runtime
            .create(&ContainerConfig::service(&spec, &[]))
            .await
            .unwrap();
        runtime.start(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn tcp_probe_passes_on_first_attempt_when_listening() {
        let runtime = FakeRuntime::new();
        let id = started(&runtime).await;
        let outcome = ReadinessProber::new(&runtime)
            .wait_ready("db", &id, &ReadinessCheck::tcp(5432), fast(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn tcp_probe_retries_until_listener_appears() {
        let runtime = FakeRuntime::new().script("db", ContainerScript::default().fail_probes(2));
        let id = started(&runtime).await;
        let outcome = ReadinessProber::new(&runtime)
            .wait_ready("db", &id, &ReadinessCheck::tcp(5432), fast(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(runtime.count(&RuntimeCall::Endpoint("db".into())), 3);
    }

    #[tokio::test]
    async fn gives_up_when_budget_is_spent() {
        let runtime = FakeRuntime::new().script("db", ContainerScript::default().never_ready());
        let id = started(&runtime).await;
        let begin = std::time::Instant::now();
        let err = ReadinessProber::new(&runtime)
            .wait_ready("db", &id, &ReadinessCheck::tcp(5432), fast(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(begin.elapsed() < Duration::from_secs(2));
        match err {
            BerthError::ServiceUnready { service, attempts } => {
                assert_eq!(service, "db");
                assert!(attempts >= 2, "attempts = {attempts}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn command_probe_uses_exit_status() {
        let runtime =
            FakeRuntime::new().script("db", ContainerScript::default().exit_codes([1, 1, 0]));
        let id = started(&runtime).await;
        let outcome = ReadinessProber::new(&runtime)
            .wait_ready(
                "db",
                &id,
                &ReadinessCheck::command(["pg_isready"]),
                fast(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
    }
}
