//! Container runtime abstraction.
//!
//! The orchestrator never talks to a container engine directly. Everything
//! it needs is expressed through [`ContainerRuntime`], and every failure an
//! implementor reports is treated as an infrastructure fault.

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use berth_common::error::Result;
use berth_common::types::{ContainerId, OutputStream};
use berth_compose::resolver::{ServiceBinding, wire_environment};
use berth_compose::spec::{InitPayload, JobSpec, ServiceSpec, SourceMount};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One line of output produced inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Name of the container that produced the line.
    pub source: String,
    /// Stream the line was read from.
    pub stream: OutputStream,
    /// The line, without its trailing newline.
    pub data: String,
}

impl OutputChunk {
    /// Creates a chunk.
    #[must_use]
    pub fn new(source: impl Into<String>, stream: OutputStream, data: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            stream,
            data: data.into(),
        }
    }
}

/// Bounded sender a runtime pushes command output into.
///
/// Sending suspends while the collector's buffer is full.
pub type OutputSender = mpsc::Sender<OutputChunk>;

/// A host directory mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Directory on the host.
    pub host_path: PathBuf,
    /// Mount point inside the container.
    pub target: PathBuf,
    /// Patterns excluded from the mount.
    pub exclude: Vec<String>,
}

impl From<&SourceMount> for Mount {
    fn from(source: &SourceMount) -> Self {
        Self {
            host_path: source.host_path().to_path_buf(),
            target: source.target().to_path_buf(),
            exclude: source.excludes().to_vec(),
        }
    }
}

/// A file written into a container before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    /// Path inside the container.
    pub path: PathBuf,
    /// File contents.
    pub contents: String,
    /// Unix file mode.
    pub mode: u32,
}

impl From<&InitPayload> for FileWrite {
    fn from(payload: &InitPayload) -> Self {
        Self {
            path: payload.target().to_path_buf(),
            contents: payload.contents().to_string(),
            mode: payload.mode(),
        }
    }
}

/// Another container made reachable under a network alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBinding {
    /// Hostname the bound container answers to.
    pub alias: String,
    /// Container behind the alias.
    pub container: ContainerId,
}

/// Everything a runtime needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Container name, unique within a run.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Exposed ports.
    pub ports: Vec<u16>,
    /// Directory mounts.
    pub mounts: Vec<Mount>,
    /// Files written before start.
    pub files: Vec<FileWrite>,
    /// Other containers bound into this one's network.
    pub bindings: Vec<NetworkBinding>,
    /// Working directory for executed commands.
    pub workdir: Option<PathBuf>,
}

impl ContainerConfig {
    /// Builds the configuration of a service container.
    ///
    /// `deps` pairs each dependency's binding with its created container.
    #[must_use]
    pub fn service(spec: &ServiceSpec, deps: &[(ServiceBinding, ContainerId)]) -> Self {
        Self {
            name: spec.name().to_string(),
            image: spec.image().to_string(),
            env: wire_environment(spec.env(), &bindings_of(deps)),
            ports: spec.ports().iter().copied().collect(),
            mounts: spec.source().map(Mount::from).into_iter().collect(),
            files: spec.init().iter().map(FileWrite::from).collect(),
            bindings: network_bindings(deps),
            workdir: None,
        }
    }

    /// Builds the configuration of the job container.
    #[must_use]
    pub fn job(spec: &JobSpec, deps: &[(ServiceBinding, ContainerId)]) -> Self {
        Self {
            name: spec.name().to_string(),
            image: spec.image().to_string(),
            env: wire_environment(spec.env(), &bindings_of(deps)),
            ports: Vec::new(),
            mounts: spec.source().map(Mount::from).into_iter().collect(),
            files: Vec::new(),
            bindings: network_bindings(deps),
            workdir: Some(spec.workdir().to_path_buf()),
        }
    }

    /// Looks up an environment variable.
    #[must_use]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn bindings_of(deps: &[(ServiceBinding, ContainerId)]) -> Vec<ServiceBinding> {
    deps.iter().map(|(binding, _)| binding.clone()).collect()
}

fn network_bindings(deps: &[(ServiceBinding, ContainerId)]) -> Vec<NetworkBinding> {
    deps.iter()
        .map(|(binding, id)| NetworkBinding {
            alias: binding.alias.clone(),
            container: id.clone(),
        })
        .collect()
}

/// Container engine used by the orchestrator.
///
/// Implementors handle image pulling, networking, and process execution.
/// The handle is shared across concurrent calls, so methods take `&self`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a container from the given configuration without starting it.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be created.
    async fn create(&self, config: &ContainerConfig) -> Result<ContainerId>;

    /// Starts a previously created container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started.
    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Executes `argv` inside a running container and returns its exit code.
    ///
    /// Output lines are sent into `output` as they are produced. A closed
    /// channel must not fail the command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be executed.
    async fn exec(&self, id: &ContainerId, argv: &[String], output: OutputSender) -> Result<i32>;

    /// Returns a host-reachable address for an exposed container port.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is not (yet) published.
    async fn endpoint(&self, id: &ContainerId, port: u16) -> Result<SocketAddr>;

    /// Stops a container gracefully and releases it.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be stopped.
    async fn stop(&self, id: &ContainerId) -> Result<()>;

    /// Terminates a container immediately and releases it.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be killed.
    async fn kill(&self, id: &ContainerId) -> Result<()>;
}
