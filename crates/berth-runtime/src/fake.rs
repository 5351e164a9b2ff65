//! In-memory container runtime.
//!
//! [`FakeRuntime`] satisfies the [`ContainerRuntime`] contract without a
//! container engine. Each container's behavior is scripted by name through
//! [`ContainerScript`], and every call is recorded so callers can assert on
//! ordering. TCP readiness is backed by real loopback listeners. A released
//! container is forgotten, so later calls on its ID fail.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, OutputStream};

use crate::runtime::{ContainerConfig, ContainerRuntime, OutputChunk, OutputSender};

/// A call the fake received, tagged with the container name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuntimeCall {
    /// `create`
    Create(String),
    /// `start`
    Start(String),
    /// `exec`
    Exec(String),
    /// `endpoint`
    Endpoint(String),
    /// `stop`
    Stop(String),
    /// `kill`
    Kill(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum TcpReadiness {
    #[default]
    Immediate,
    FailFirst(u32),
    Never,
}

/// Scripted behavior for one named container.
#[derive(Debug, Clone, Default)]
pub struct ContainerScript {
    exit_codes: VecDeque<i32>,
    stdout: Vec<String>,
    stderr: Vec<String>,
    hang: bool,
    exec_delay: Option<Duration>,
    start_delay: Option<Duration>,
    create_error: Option<String>,
    start_error: Option<String>,
    stop_error: Option<String>,
    kill_error: Option<String>,
    release_failures: u32,
    stop_hangs: bool,
    tcp: TcpReadiness,
}

impl ContainerScript {
    /// Every `exec` exits with `code`.
    #[must_use]
    pub fn exit_code(self, code: i32) -> Self {
        self.exit_codes([code])
    }

    /// Successive `exec` calls exit with these codes; the last one repeats.
    #[must_use]
    pub fn exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.exit_codes = codes.into_iter().collect();
        self
    }

    /// Lines written to stdout by every `exec`.
    #[must_use]
    pub fn stdout<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stdout = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Lines written to stderr by every `exec`, after stdout.
    #[must_use]
    pub fn stderr<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stderr = lines.into_iter().map(Into::into).collect();
        self
    }

    /// `exec` writes its output and then never returns.
    #[must_use]
    pub const fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    /// `exec` waits this long before producing output.
    #[must_use]
    pub const fn exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    /// `start` waits this long before completing.
    #[must_use]
    pub const fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// `create` fails with `message`.
    #[must_use]
    pub fn fail_create(mut self, message: impl Into<String>) -> Self {
        self.create_error = Some(message.into());
        self
    }

    /// `start` fails with `message`.
    #[must_use]
    pub fn fail_start(mut self, message: impl Into<String>) -> Self {
        self.start_error = Some(message.into());
        self
    }

    /// `stop` fails with `message`.
    #[must_use]
    pub fn fail_stop(mut self, message: impl Into<String>) -> Self {
        self.stop_error = Some(message.into());
        self
    }

    /// `kill` fails with `message`.
    #[must_use]
    pub fn fail_kill(mut self, message: impl Into<String>) -> Self {
        self.kill_error = Some(message.into());
        self
    }

    /// The first `n` calls to `stop` and the first `n` calls to `kill` fail.
    #[must_use]
    pub const fn fail_releases(mut self, n: u32) -> Self {
        self.release_failures = n;
        self
    }

    /// `stop` never returns.
    #[must_use]
    pub const fn stop_hangs(mut self) -> Self {
        self.stop_hangs = true;
        self
    }

    /// The first `n` endpoint lookups hand out a closed port.
    #[must_use]
    pub const fn fail_probes(mut self, n: u32) -> Self {
        self.tcp = TcpReadiness::FailFirst(n);
        self
    }

    /// Endpoint lookups always hand out a closed port.
    #[must_use]
    pub const fn never_ready(mut self) -> Self {
        self.tcp = TcpReadiness::Never;
        self
    }

    fn next_exit_code(&mut self) -> i32 {
        if self.exit_codes.len() > 1 {
            self.exit_codes.pop_front().unwrap_or_default()
        } else {
            self.exit_codes.front().copied().unwrap_or_default()
        }
    }
}

#[derive(Debug)]
struct Container {
    name: String,
    script: ContainerScript,
    running: bool,
    endpoint_lookups: u32,
    stops: u32,
    kills: u32,
    listener: Option<TcpListener>,
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<String, ContainerScript>,
    containers: HashMap<ContainerId, Container>,
    configs: Vec<ContainerConfig>,
    calls: Vec<RuntimeCall>,
    next_id: u64,
}

/// Scripted, call-recording [`ContainerRuntime`].
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    /// Creates a fake where every container succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a script to the container named `name`.
    #[must_use]
    pub fn script(self, name: impl Into<String>, script: ContainerScript) -> Self {
        let _ = self.lock().scripts.insert(name.into(), script);
        self
    }

    /// All calls received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    /// How many times `call` was received.
    #[must_use]
    pub fn count(&self, call: &RuntimeCall) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    /// Whether a container named `name` was started.
    #[must_use]
    pub fn started(&self, name: &str) -> bool {
        self.count(&RuntimeCall::Start(name.to_string())) > 0
    }

    /// Names of started containers, in start order.
    #[must_use]
    pub fn start_order(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                RuntimeCall::Start(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Names of stopped or killed containers, in the order first released.
    #[must_use]
    pub fn stop_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for call in &self.lock().calls {
            if let RuntimeCall::Stop(name) | RuntimeCall::Kill(name) = call {
                if !order.contains(name) {
                    order.push(name.clone());
                }
            }
        }
        order
    }

    /// Configuration the container named `name` was created with.
    #[must_use]
    pub fn created(&self, name: &str) -> Option<ContainerConfig> {
        self.lock().configs.iter().find(|c| c.name == name).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn script_of(&self, id: &ContainerId, operation: &'static str) -> Result<(String, ContainerScript)> {
        let state = self.lock();
        state
            .containers
            .get(id)
            .map(|c| (c.name.clone(), c.script.clone()))
            .ok_or_else(|| BerthError::runtime(operation, format!("no such container {id}")))
    }

    fn record(&self, call: RuntimeCall) {
        self.lock().calls.push(call);
    }
}

fn closed_port() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| BerthError::runtime("endpoint", e.to_string()))?;
    listener
        .local_addr()
        .map_err(|e| BerthError::runtime("endpoint", e.to_string()))
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, config: &ContainerConfig) -> Result<ContainerId> {
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Create(config.name.clone()));
        let script = state.scripts.get(&config.name).cloned().unwrap_or_default();
        if let Some(message) = &script.create_error {
            return Err(BerthError::runtime("create", message.clone()));
        }
        state.next_id += 1;
        let id = ContainerId::new(format!("fake-{}-{}", config.name, state.next_id));
        state.configs.push(config.clone());
        let _ = state.containers.insert(
            id.clone(),
            Container {
                name: config.name.clone(),
                script,
                running: false,
                endpoint_lookups: 0,
                stops: 0,
                kills: 0,
                listener: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        let (name, script) = self.script_of(id, "start")?;
        if let Some(delay) = script.start_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Start(name));
        if let Some(message) = script.start_error {
            return Err(BerthError::runtime("start", message));
        }
        if let Some(container) = state.containers.get_mut(id) {
            container.running = true;
        }
        Ok(())
    }

    async fn exec(&self, id: &ContainerId, _argv: &[String], output: OutputSender) -> Result<i32> {
        let (name, script) = self.script_of(id, "exec")?;
        self.record(RuntimeCall::Exec(name.clone()));
        if let Some(delay) = script.exec_delay {
            tokio::time::sleep(delay).await;
        }
        for line in &script.stdout {
            let _ = output
                .send(OutputChunk::new(&name, OutputStream::Stdout, line))
                .await;
        }
        for line in &script.stderr {
            let _ = output
                .send(OutputChunk::new(&name, OutputStream::Stderr, line))
                .await;
        }
        if script.hang {
            std::future::pending::<()>().await;
        }
        let mut state = self.lock();
        let code = state
            .containers
            .get_mut(id)
            .map_or(0, |c| c.script.next_exit_code());
        Ok(code)
    }

    async fn endpoint(&self, id: &ContainerId, port: u16) -> Result<SocketAddr> {
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| BerthError::runtime("endpoint", format!("no such container {id}")))?;
        let name = container.name.clone();
        if !container.running {
            state.calls.push(RuntimeCall::Endpoint(name));
            return Err(BerthError::runtime(
                "endpoint",
                format!("container {id} is not running"),
            ));
        }
        container.endpoint_lookups += 1;
        let live = match container.script.tcp {
            TcpReadiness::Immediate => true,
            TcpReadiness::FailFirst(n) => container.endpoint_lookups > n,
            TcpReadiness::Never => false,
        };
        let addr = if live {
            if container.listener.is_none() {
                let listener = TcpListener::bind("127.0.0.1:0")
                    .map_err(|e| BerthError::runtime("endpoint", e.to_string()))?;
                container.listener = Some(listener);
            }
            container
                .listener
                .as_ref()
                .map(TcpListener::local_addr)
                .transpose()
                .map_err(|e| BerthError::runtime("endpoint", e.to_string()))?
                .ok_or_else(|| BerthError::runtime("endpoint", format!("port {port} unbound")))?
        } else {
            closed_port()?
        };
        state.calls.push(RuntimeCall::Endpoint(name));
        Ok(addr)
    }

    async fn stop(&self, id: &ContainerId) -> Result<()> {
        let (name, script) = self.script_of(id, "stop")?;
        self.record(RuntimeCall::Stop(name));
        if script.stop_hangs {
            std::future::pending::<()>().await;
        }
        if let Some(message) = script.stop_error {
            return Err(BerthError::runtime("stop", message));
        }
        let mut state = self.lock();
        if let Some(container) = state.containers.get_mut(id) {
            container.stops += 1;
            if container.stops <= script.release_failures {
                return Err(BerthError::runtime("stop", "daemon busy"));
            }
        }
        let _ = state.containers.remove(id);
        Ok(())
    }

    async fn kill(&self, id: &ContainerId) -> Result<()> {
        let (name, script) = self.script_of(id, "kill")?;
        self.record(RuntimeCall::Kill(name));
        if let Some(message) = script.kill_error {
            return Err(BerthError::runtime("kill", message));
        }
        let mut state = self.lock();
        if let Some(container) = state.containers.get_mut(id) {
            container.kills += 1;
            if container.kills <= script.release_failures {
                return Err(BerthError::runtime("kill", "daemon busy"));
            }
        }
        let _ = state.containers.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn config(name: &str) -> ContainerConfig {
        ContainerConfig {
            name: name.into(),
            image: "alpine".into(),
            env: Vec::new(),
            ports: vec![80],
            mounts: Vec::new(),
            files: Vec::new(),
            bindings: Vec::new(),
            workdir: None,
        }
    }

    #[tokio::test]
    async fn records_calls_in_order() {
        let rt = FakeRuntime::new();
        let id = rt.create(&config("web")).await.unwrap();
        rt.start(&id).await.unwrap();
        rt.stop(&id).await.unwrap();
        assert_eq!(
            rt.calls(),
            vec![
                RuntimeCall::Create("web".into()),
                RuntimeCall::Start("web".into()),
                RuntimeCall::Stop("web".into()),
            ]
        );
        assert_eq!(rt.created("web").unwrap().ports, vec![80]);
    }

    #[tokio::test]
    async fn exec_streams_scripted_output_and_exit_codes() {
        let rt = FakeRuntime::new().script(
            "job",
            ContainerScript::default()
                .stdout(["one", "two"])
                .stderr(["oops"])
                .exit_codes([3, 0]),
        );
        let id = rt.create(&config("job")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(rt.exec(&id, &[], tx.clone()).await.unwrap(), 3);
        assert_eq!(rt.exec(&id, &[], tx).await.unwrap(), 0);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.data, "one");
        assert_eq!(first.stream, OutputStream::Stdout);
    }

    #[tokio::test]
    async fn live_endpoint_accepts_connections() {
        let rt = FakeRuntime::new();
        let id = rt.create(&config("web")).await.unwrap();
        rt.start(&id).await.unwrap();
        let addr = rt.endpoint(&id, 80).await.unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());
    }

    #[tokio::test]
    async fn endpoint_of_stopped_container_errors() {
        let rt = FakeRuntime::new();
        let id = rt.create(&config("web")).await.unwrap();
        assert!(rt.endpoint(&id, 80).await.is_err());
    }

    #[tokio::test]
    async fn released_container_is_forgotten() {
        let rt = FakeRuntime::new();
        let id = rt.create(&config("web")).await.unwrap();
        rt.start(&id).await.unwrap();
        rt.kill(&id).await.unwrap();
        let err = rt.stop(&id).await.unwrap_err();
        assert!(err.to_string().contains("no such container"), "got: {err}");
        assert_eq!(rt.count(&RuntimeCall::Stop("web".into())), 0);
    }

    #[tokio::test]
    async fn release_failures_clear_after_the_scripted_count() {
        let rt = FakeRuntime::new().script("db", ContainerScript::default().fail_releases(1));
        let id = rt.create(&config("db")).await.unwrap();
        assert!(rt.stop(&id).await.is_err());
        assert!(rt.kill(&id).await.is_err());
        rt.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn scripted_create_failure_surfaces_as_runtime_error() {
        let rt = FakeRuntime::new().script("web", ContainerScript::default().fail_create("no image"));
        let err = rt.create(&config("web")).await.unwrap_err();
        assert!(matches!(err, BerthError::Runtime { operation: "create", .. }));
    }
}
