//! Sandbox container provisioning and teardown

use std::collections::HashMap;
use std::time::Duration;

use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use pycell_spec::{SandboxSpec, EXECUTOR_PORT, RESOURCE_PORT, WORK_DIR};
use tracing::instrument;

use crate::error::{ContainerError, Result};
use crate::probe::wait_tcp;
use crate::pull::{ensure_image, pull_events, PullProgress};

/// Options controlling container start
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Deadline for both endpoints to accept TCP connections after start
    pub liveness_timeout: Duration,
    /// Attempts when host-allocated ports race with other processes
    pub start_attempts: u32,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(30),
            start_attempts: 3,
        }
    }
}

/// A running sandbox container.
///
/// The handle owns the container between [`start`](SandboxContainer::start)
/// and [`stop`](SandboxContainer::stop). Dropping the handle does not remove
/// the container; call `stop` on every exit path.
pub struct SandboxContainer {
    docker: Docker,
    name: String,
    /// Container id; taken on stop so double-stop is a no-op
    id: Option<String>,
    executor_port: u16,
    resource_port: u16,
}

impl std::fmt::Debug for SandboxContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxContainer")
            .field("name", &self.name)
            .field("executor_port", &self.executor_port)
            .field("resource_port", &self.resource_port)
            .finish_non_exhaustive()
    }
}

/// Connect to the Docker daemon, honoring `DOCKER_HOST` for remote daemons
pub async fn connect_docker() -> Result<Docker> {
    let docker = match std::env::var("DOCKER_HOST") {
        Ok(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
            Docker::connect_with_http(&host, 120, bollard::API_DEFAULT_VERSION)
        }
        Ok(host) if host.starts_with("unix://") => {
            Docker::connect_with_unix(&host, 120, bollard::API_DEFAULT_VERSION)
        }
        _ => Docker::connect_with_local_defaults(),
    }
    .map_err(|e| ContainerError::Daemon {
        reason: e.to_string(),
    })?;

    docker.ping().await.map_err(|e| ContainerError::Daemon {
        reason: format!("ping failed: {e}"),
    })?;

    Ok(docker)
}

/// Allocate an ephemeral host port by binding a listener and closing it.
///
/// The port may be taken by another process before the container binds it;
/// callers tolerate that race by retrying container start.
fn allocate_host_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(|e| {
        ContainerError::PortAllocation {
            reason: e.to_string(),
        }
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| ContainerError::PortAllocation {
            reason: e.to_string(),
        })?
        .port();
    Ok(port)
}

/// Build the bind strings for the container's host config
fn build_binds(spec: &SandboxSpec) -> Vec<String> {
    spec.binds
        .iter()
        .map(|b| format!("{}:{}/{}", b.host.display(), WORK_DIR, b.container))
        .collect()
}

/// Build the host config mapping the two container ports to loopback host
/// ports
fn build_host_config(spec: &SandboxSpec, executor_port: u16, resource_port: u16) -> HostConfig {
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for (container_port, host_port) in [
        (EXECUTOR_PORT, executor_port),
        (RESOURCE_PORT, resource_port),
    ] {
        port_bindings.insert(
            format!("{container_port}/tcp"),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );
    }

    let binds = build_binds(spec);

    HostConfig {
        port_bindings: Some(port_bindings),
        binds: if binds.is_empty() { None } else { Some(binds) },
        ..Default::default()
    }
}

impl SandboxContainer {
    /// Start a sandbox container for the given spec with default options.
    ///
    /// Ensures the image is present (pulling per the spec's pull policy),
    /// allocates host ports where the spec left them unset, creates and
    /// starts the container, and waits until both endpoints accept TCP
    /// connections. Any partially-created container is removed before an
    /// error is returned.
    pub async fn start(spec: &SandboxSpec) -> Result<Self> {
        Self::start_with(spec, StartOptions::default()).await
    }

    /// Start a sandbox container with explicit options
    #[instrument(skip(spec, options), fields(image = %spec.image))]
    pub async fn start_with(spec: &SandboxSpec, options: StartOptions) -> Result<Self> {
        spec.validate()?;

        let docker = connect_docker().await?;
        ensure_image(&docker, &spec.image, spec.pull_policy).await?;

        let auto_ports = spec.executor_port.is_none() || spec.resource_port.is_none();
        let attempts = if auto_ports { options.start_attempts.max(1) } else { 1 };

        let mut last_err = None;
        for attempt in 1..=attempts {
            let executor_port = match spec.executor_port {
                Some(p) => p,
                None => allocate_host_port()?,
            };
            let resource_port = match spec.resource_port {
                Some(p) => p,
                None => allocate_host_port()?,
            };

            match Self::start_once(&docker, spec, executor_port, resource_port, &options).await {
                Ok(container) => return Ok(container),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt,
                        error = %e,
                        "container start attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.expect("at least one start attempt"))
    }

    async fn start_once(
        docker: &Docker,
        spec: &SandboxSpec,
        executor_port: u16,
        resource_port: u16,
        options: &StartOptions,
    ) -> Result<Self> {
        let name = format!("pycell-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let exposed_ports: std::collections::HashMap<String, std::collections::HashMap<(), ()>> = [
            format!("{EXECUTOR_PORT}/tcp"),
            format!("{RESOURCE_PORT}/tcp"),
        ]
        .into_iter()
        .map(|port| (port, std::collections::HashMap::new()))
        .collect();

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            exposed_ports: Some(exposed_ports),
            host_config: Some(build_host_config(spec, executor_port, resource_port)),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: Some(name.clone()),
            platform: String::new(),
        };

        tracing::info!(
            container = %name,
            image = %spec.image,
            executor_port = executor_port,
            resource_port = resource_port,
            "creating container"
        );

        let created = docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| ContainerError::CreateFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        let container = Self {
            docker: docker.clone(),
            name: name.clone(),
            id: Some(created.id),
            executor_port,
            resource_port,
        };

        if let Err(e) = docker
            .start_container(&name, None::<StartContainerOptions>)
            .await
        {
            container.remove_silently().await;
            return Err(ContainerError::StartFailed {
                name,
                reason: e.to_string(),
            });
        }

        for port in [executor_port, resource_port] {
            if !wait_tcp("127.0.0.1", port, options.liveness_timeout).await {
                container.remove_silently().await;
                return Err(ContainerError::LivenessTimeout {
                    name,
                    port,
                    timeout: options.liveness_timeout,
                });
            }
        }

        tracing::info!(container = %name, "container ready");
        Ok(container)
    }

    /// Container name assigned at start
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host port mapped to the kernel gateway
    pub fn executor_port(&self) -> u16 {
        self.executor_port
    }

    /// Host port mapped to the resource service
    pub fn resource_port(&self) -> u16 {
        self.resource_port
    }

    /// Base URL of the kernel gateway on the host
    pub fn executor_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.executor_port)
    }

    /// Base URL of the resource service on the host
    pub fn resource_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.resource_port)
    }

    /// Image pull progress as a lazy stream, for callers that want to render
    /// it instead of relying on the log
    pub fn pull_progress<'a>(
        docker: &'a Docker,
        image: &str,
    ) -> impl Stream<Item = Result<PullProgress>> + 'a {
        pull_events(docker, image)
    }

    /// Force-remove the container. Idempotent: stopping a container that is
    /// already gone succeeds.
    #[instrument(skip(self), fields(container = %self.name))]
    pub async fn stop(&mut self) -> Result<()> {
        if self.id.take().is_none() {
            return Ok(());
        }

        tracing::info!(container = %self.name, "removing container");

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(&self.name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(ContainerError::RemoveFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Remove without surfacing errors, used on failed-start cleanup paths
    async fn remove_silently(&self) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(&self.name, Some(options)).await {
            tracing::warn!(container = %self.name, error = %e, "cleanup removal failed");
        }
    }

    /// Execute a command inside the container, returning exit code, stdout
    /// and stderr
    pub(crate) async fn exec(&self, cmd: &[&str]) -> Result<(i64, String, String)> {
        let exec_options = CreateExecOptions {
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(&self.name, exec_options)
            .await
            .map_err(|e| ContainerError::ExecFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        let started = self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(|e| ContainerError::ExecFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(bollard::container::LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(container = %self.name, error = %e, "error reading exec output");
                    }
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(|e| ContainerError::ExecFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        Ok((inspect.exit_code.unwrap_or(0), stdout, stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pycell_spec::SandboxSpec;

    #[test]
    fn test_allocate_host_port() {
        let a = allocate_host_port().unwrap();
        let b = allocate_host_port().unwrap();
        assert!(a > 0);
        assert!(b > 0);
    }

    #[test]
    fn test_build_binds() {
        let spec = SandboxSpec::new("t").bind("/tmp/work", "workspace");
        assert_eq!(build_binds(&spec), vec!["/tmp/work:/app/workspace"]);
    }

    #[test]
    fn test_build_host_config_ports() {
        let spec = SandboxSpec::new("t");
        let config = build_host_config(&spec, 40001, 40002);
        let bindings = config.port_bindings.unwrap();

        let executor = bindings
            .get(&format!("{EXECUTOR_PORT}/tcp"))
            .unwrap()
            .as_ref()
            .unwrap();
        assert_eq!(executor[0].host_port.as_deref(), Some("40001"));
        assert_eq!(executor[0].host_ip.as_deref(), Some("127.0.0.1"));

        let resource = bindings
            .get(&format!("{RESOURCE_PORT}/tcp"))
            .unwrap()
            .as_ref()
            .unwrap();
        assert_eq!(resource[0].host_port.as_deref(), Some("40002"));
        assert!(config.binds.is_none());
    }
}
