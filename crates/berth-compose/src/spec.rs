//! Service and job descriptors.
//!
//! Descriptors are immutable once built. Every builder validates its input
//! in `build()` and performs no I/O: host paths are recorded, never touched.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use berth_common::config::ProbePolicy;
use berth_common::constants;
use berth_common::error::{BerthError, Result};
use serde::Serialize;

use crate::validator::check_alias;

/// A file written into a service container before it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitPayload {
    target: PathBuf,
    contents: String,
    mode: u32,
}

impl InitPayload {
    /// Creates a payload with the default executable mode.
    #[must_use]
    pub fn new(target: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            contents: contents.into(),
            mode: constants::DEFAULT_INIT_MODE,
        }
    }

    /// Overrides the file mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Path inside the container.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// File contents.
    #[must_use]
    pub fn contents(&self) -> &str {
        &self.contents
    }

    /// Unix file mode.
    #[must_use]
    pub const fn mode(&self) -> u32 {
        self.mode
    }
}

/// How a service's readiness is observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProbeKind {
    /// A TCP connection to the exposed port succeeds.
    Tcp {
        /// Container port to connect to.
        port: u16,
    },
    /// A command run inside the service container exits with status 0.
    Command {
        /// Command and arguments.
        argv: Vec<String>,
    },
}

/// Readiness check attached to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessCheck {
    /// What to probe.
    pub kind: ProbeKind,
    /// Backoff schedule; `None` uses the orchestrator default.
    pub policy: Option<ProbePolicy>,
}

impl ReadinessCheck {
    /// Ready once a TCP connect to `port` succeeds.
    #[must_use]
    pub const fn tcp(port: u16) -> Self {
        Self {
            kind: ProbeKind::Tcp { port },
            policy: None,
        }
    }

    /// Ready once `argv` exits with status 0 inside the container.
    #[must_use]
    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: ProbeKind::Command {
                argv: argv.into_iter().map(Into::into).collect(),
            },
            policy: None,
        }
    }

    /// Sets an explicit backoff schedule.
    #[must_use]
    pub const fn with_policy(mut self, policy: ProbePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Overrides only the overall timeout, keeping the rest of the schedule.
    ///
    /// If no policy was set yet, the workspace default schedule is used.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.policy = Some(self.policy.unwrap_or_default().with_timeout(timeout));
        self
    }

    /// Resolves the schedule, falling back to `default`.
    #[must_use]
    pub fn effective_policy(&self, default: &ProbePolicy) -> ProbePolicy {
        self.policy.unwrap_or(*default)
    }

    fn validate(&self, service: &str) -> Result<()> {
        match &self.kind {
            ProbeKind::Tcp { port: 0 } => {
                return Err(BerthError::invalid_spec(format!(
                    "service \"{service}\": readiness port must be non-zero"
                )));
            }
            ProbeKind::Command { argv } if argv.is_empty() => {
                return Err(BerthError::invalid_spec(format!(
                    "service \"{service}\": readiness command is empty"
                )));
            }
            _ => {}
        }
        if let Some(policy) = &self.policy {
            policy.validate()?;
        }
        Ok(())
    }
}

/// A backing service started for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    name: String,
    image: String,
    env: BTreeMap<String, String>,
    ports: BTreeSet<u16>,
    init: Vec<InitPayload>,
    readiness: Option<ReadinessCheck>,
    depends_on: Vec<String>,
    source: Option<SourceMount>,
}

impl ServiceSpec {
    /// Starts building a service named `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder::new(name)
    }

    /// Service name, also its network alias.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image reference.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Declared environment variables.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Exposed ports, ascending.
    #[must_use]
    pub const fn ports(&self) -> &BTreeSet<u16> {
        &self.ports
    }

    /// Lowest exposed port, used for the generated `<NAME>_PORT` variable.
    #[must_use]
    pub fn primary_port(&self) -> Option<u16> {
        self.ports.first().copied()
    }

    /// Init payloads in declaration order.
    #[must_use]
    pub fn init(&self) -> &[InitPayload] {
        &self.init
    }

    /// Readiness check, if any.
    #[must_use]
    pub const fn readiness(&self) -> Option<&ReadinessCheck> {
        self.readiness.as_ref()
    }

    /// Names of services this service depends on.
    #[must_use]
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    /// Host directory mounted into the service, if any.
    #[must_use]
    pub const fn source(&self) -> Option<&SourceMount> {
        self.source.as_ref()
    }
}

/// Builder for [`ServiceSpec`].
#[derive(Debug)]
pub struct ServiceBuilder {
    name: String,
    image: Option<String>,
    env: BTreeMap<String, String>,
    ports: BTreeSet<u16>,
    init: Vec<InitPayload>,
    readiness: Option<ReadinessCheck>,
    depends_on: Vec<String>,
    source: Option<SourceMount>,
    init_prefixes: Vec<PathBuf>,
}

impl ServiceBuilder {
    /// Creates a new builder with the given service name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
            env: BTreeMap::new(),
            ports: BTreeSet::new(),
            init: Vec::new(),
            readiness: None,
            depends_on: Vec::new(),
            source: None,
            init_prefixes: constants::DEFAULT_INIT_PREFIXES
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }

    /// Sets the image reference.
    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Adds an environment variable. A repeated key keeps the last value.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.env.insert(key.into(), value.into());
        self
    }

    /// Exposes a container port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        let _ = self.ports.insert(port);
        self
    }

    /// Adds a file to write before start.
    #[must_use]
    pub fn init_file(mut self, target: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.init.push(InitPayload::new(target, contents));
        self
    }

    /// Adds a prepared init payload.
    #[must_use]
    pub fn init_payload(mut self, payload: InitPayload) -> Self {
        self.init.push(payload);
        self
    }

    /// Allows absolute init targets under `prefix` in addition to the defaults.
    #[must_use]
    pub fn allow_init_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.init_prefixes.push(prefix.into());
        self
    }

    /// Sets the readiness check.
    #[must_use]
    pub fn readiness(mut self, check: ReadinessCheck) -> Self {
        self.readiness = Some(check);
        self
    }

    /// Declares a dependency on another service. Duplicates are ignored.
    #[must_use]
    pub fn depends_on(mut self, service: impl Into<String>) -> Self {
        let service = service.into();
        if !self.depends_on.contains(&service) {
            self.depends_on.push(service);
        }
        self
    }

    /// Mounts a host directory into the service.
    #[must_use]
    pub fn source(mut self, mount: SourceMount) -> Self {
        self.source = Some(mount);
        self
    }

    /// Validates and builds the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidSpec`] if the name is not a valid alias,
    /// the image is missing, a port is zero, an init payload escapes the
    /// allowed prefixes, the readiness check is malformed or targets a port
    /// the service does not expose, or the source mount target is relative.
    pub fn build(self) -> Result<ServiceSpec> {
        check_alias("service", &self.name)?;
        let image = require_image(self.image, &self.name)?;
        if self.ports.contains(&0) {
            return Err(BerthError::invalid_spec(format!(
                "service \"{}\": port 0 cannot be exposed",
                self.name
            )));
        }
        for payload in &self.init {
            check_init_target(&self.name, payload.target(), &self.init_prefixes)?;
        }
        if let Some(check) = &self.readiness {
            check.validate(&self.name)?;
            if let ProbeKind::Tcp { port } = &check.kind {
                if !self.ports.contains(port) {
                    return Err(BerthError::invalid_spec(format!(
                        "service \"{}\": readiness port {port} is not exposed",
                        self.name
                    )));
                }
            }
        }
        if let Some(mount) = &self.source {
            mount.check_target("service", &self.name)?;
        }
        if self.depends_on.iter().any(|d| *d == self.name) {
            return Err(BerthError::CyclicDependency { service: self.name });
        }

        Ok(ServiceSpec {
            name: self.name,
            image,
            env: self.env,
            ports: self.ports,
            init: self.init,
            readiness: self.readiness,
            depends_on: self.depends_on,
            source: self.source,
        })
    }
}

/// Host directory mounted into a service or job container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceMount {
    host_path: PathBuf,
    target: PathBuf,
    exclude: Vec<String>,
}

impl SourceMount {
    /// Mounts `host_path` at `target` inside the container.
    #[must_use]
    pub fn new(host_path: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            target: target.into(),
            exclude: Vec::new(),
        }
    }

    /// Excludes paths matching `pattern` (relative to the host path).
    #[must_use]
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Directory on the host.
    #[must_use]
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    /// Mount point inside the container.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Exclusion patterns.
    #[must_use]
    pub fn excludes(&self) -> &[String] {
        &self.exclude
    }

    fn check_target(&self, kind: &str, owner: &str) -> Result<()> {
        if self.target.is_absolute() {
            return Ok(());
        }
        Err(BerthError::invalid_spec(format!(
            "{kind} \"{owner}\": source mount target {} must be absolute",
            self.target.display()
        )))
    }
}

/// The primary unit of work of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    name: String,
    image: String,
    workdir: PathBuf,
    env: BTreeMap<String, String>,
    depends_on: Vec<String>,
    source: Option<SourceMount>,
    command: Vec<String>,
    timeout: Option<Duration>,
}

impl JobSpec {
    /// Starts building a job running in `image`.
    #[must_use]
    pub fn builder(image: impl Into<String>) -> JobBuilder {
        JobBuilder::new(image)
    }

    /// Job name, used as its container name and log source.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image reference.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Working directory inside the container.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Declared environment variables.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Names of the services the job needs.
    #[must_use]
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    /// Mounted source tree, if any.
    #[must_use]
    pub const fn source(&self) -> Option<&SourceMount> {
        self.source.as_ref()
    }

    /// Command and arguments.
    #[must_use]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Time budget for the command.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Builder for [`JobSpec`].
#[derive(Debug)]
pub struct JobBuilder {
    name: String,
    image: String,
    workdir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    depends_on: Vec<String>,
    source: Option<SourceMount>,
    command: Vec<String>,
    timeout: Option<Duration>,
}

impl JobBuilder {
    /// Creates a new builder for a job running in `image`.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            name: constants::DEFAULT_JOB_NAME.to_string(),
            image: image.into(),
            workdir: None,
            env: BTreeMap::new(),
            depends_on: Vec::new(),
            source: None,
            command: Vec::new(),
            timeout: None,
        }
    }

    /// Overrides the job name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the working directory. Defaults to the source mount target, else `/`.
    #[must_use]
    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Adds an environment variable. A repeated key keeps the last value.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.env.insert(key.into(), value.into());
        self
    }

    /// Declares a dependency on a service. Duplicates are ignored.
    #[must_use]
    pub fn depends_on(mut self, service: impl Into<String>) -> Self {
        let service = service.into();
        if !self.depends_on.contains(&service) {
            self.depends_on.push(service);
        }
        self
    }

    /// Mounts a host source tree.
    #[must_use]
    pub fn source(mut self, mount: SourceMount) -> Self {
        self.source = Some(mount);
        self
    }

    /// Sets the command to execute.
    #[must_use]
    pub fn command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = argv.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the time budget for the command.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validates and builds the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidSpec`] on an invalid name, empty image
    /// or command, a relative working directory or mount target, or a
    /// zero timeout.
    pub fn build(self) -> Result<JobSpec> {
        check_alias("job", &self.name)?;
        let image = require_image(Some(self.image), &self.name)?;
        if self.command.is_empty() {
            return Err(BerthError::invalid_spec(format!(
                "job \"{}\": command is empty",
                self.name
            )));
        }
        if let Some(mount) = &self.source {
            mount.check_target("job", &self.name)?;
        }
        let workdir = self
            .workdir
            .or_else(|| self.source.as_ref().map(|m| m.target.clone()))
            .unwrap_or_else(|| PathBuf::from("/"));
        if !workdir.is_absolute() {
            return Err(BerthError::invalid_spec(format!(
                "job \"{}\": working directory {} must be absolute",
                self.name,
                workdir.display()
            )));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(BerthError::invalid_spec(format!(
                "job \"{}\": timeout must be non-zero",
                self.name
            )));
        }

        Ok(JobSpec {
            name: self.name,
            image,
            workdir,
            env: self.env,
            depends_on: self.depends_on,
            source: self.source,
            command: self.command,
            timeout: self.timeout,
        })
    }
}

fn require_image(image: Option<String>, owner: &str) -> Result<String> {
    match image {
        Some(image) if !image.trim().is_empty() => Ok(image),
        _ => Err(BerthError::invalid_spec(format!(
            "\"{owner}\" has no image reference"
        ))),
    }
}

fn check_init_target(service: &str, target: &Path, prefixes: &[PathBuf]) -> Result<()> {
    if target.as_os_str().is_empty() {
        return Err(BerthError::invalid_spec(format!(
            "service \"{service}\": init payload has an empty target path"
        )));
    }
    if target.components().any(|c| c == Component::ParentDir) {
        return Err(BerthError::invalid_spec(format!(
            "service \"{service}\": init target {} must not contain \"..\"",
            target.display()
        )));
    }
    if target.is_absolute() && !prefixes.iter().any(|p| target.starts_with(p)) {
        return Err(BerthError::invalid_spec(format!(
            "service \"{service}\": init target {} is outside the allowed prefixes",
            target.display()
        )));
    }
    Ok(())
}
