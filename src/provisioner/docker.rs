//! Docker container provisioner implementation.
//!
//! Every kind maps to one deterministically named container. A second test
//! process (or a second run) finds the container by name and reattaches to
//! it instead of starting another one.
//!
//! A container only counts as initialized once the broker has applied its
//! artifacts and [`Provisioner::mark_initialized`] has written a marker file
//! into it. Reattaching waits for that marker; a container that never gets
//! one was abandoned mid-initialization and is recreated.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Instance, InstanceOrigin, Provisioner, ProvisionerError, ProvisionerResult};
use crate::artifact::{fingerprint, InitArtifact};
use crate::config::{Readiness, ResourceSettings, Settings};

/// Label carrying the resource kind key.
pub const LABEL_KIND: &str = "testdeps.kind";
/// Label carrying the id of the process run that created the container.
pub const LABEL_RUN: &str = "testdeps.run";
/// Label carrying the fingerprint of the artifacts applied at creation.
pub const LABEL_ARTIFACTS: &str = "testdeps.artifacts";

/// File created inside a container once its initialization completed.
pub const INIT_MARKER: &str = "/tmp/.testdeps-initialized";

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const LOG_TAIL_LIMIT: usize = 8 * 1024;

/// Identifier of this process run, stamped on every container it creates.
pub fn run_id() -> &'static str {
    static RUN_ID: OnceLock<String> = OnceLock::new();
    RUN_ID.get_or_init(|| uuid::Uuid::new_v4().to_string())
}

/// Observed state of a kind's named container.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub name: String,
    pub id: String,
    pub running: bool,
    pub state: String,
    pub address: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Docker-backed provisioner for one resource kind.
pub struct DockerProvisioner {
    docker: Docker,
    settings: Settings,
    resource: ResourceSettings,
    host: String,
}

impl DockerProvisioner {
    /// Create a new Docker provisioner for the given kind settings.
    pub fn new(settings: Settings, resource: ResourceSettings) -> ProvisionerResult<Self> {
        let docker = if let Some(host) = &settings.docker_host {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| ProvisionerError::Runtime(e.to_string()))?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| ProvisionerError::Runtime(e.to_string()))?
        };
        let host = host_for(settings.docker_host.as_deref());

        Ok(Self {
            docker,
            settings,
            resource,
            host,
        })
    }

    pub fn container_name(&self) -> &str {
        &self.resource.container_name
    }

    /// Inspects the named container, if it exists.
    pub async fn status(&self) -> ProvisionerResult<Option<ContainerStatus>> {
        let Some(info) = self.inspect().await? else {
            return Ok(None);
        };

        let running = is_running(&info);
        let address = if running {
            published_port(&info, self.resource.port)
                .map(|port| self.resource.render_address(&self.host, port))
        } else {
            None
        };
        let state = info
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Some(ContainerStatus {
            name: self.resource.container_name.clone(),
            id: info.id.clone().unwrap_or_default(),
            running,
            state,
            address,
            labels: labels_of(&info),
        }))
    }

    /// Force-removes the named container and its volumes.
    ///
    /// Returns whether a container was removed.
    pub async fn remove(&self) -> ProvisionerResult<bool> {
        let result = self
            .docker
            .remove_container(
                &self.resource.container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(ProvisionerError::Runtime(e.to_string())),
        }
    }

    async fn inspect(&self) -> ProvisionerResult<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(
                &self.resource.container_name,
                None::<InspectContainerOptions>,
            )
            .await
        {
            Ok(info) => Ok(Some(info)),
            Err(e) if status_code(&e) == Some(404) => Ok(None),
            Err(e) => Err(ProvisionerError::Runtime(e.to_string())),
        }
    }

    async fn ensure_image(&self) -> ProvisionerResult<()> {
        let image = &self.resource.image;
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling image {}", image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.as_str(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            let progress =
                progress.map_err(|e| ProvisionerError::Runtime(format!("pull {}: {}", image, e)))?;
            if let Some(status) = progress.status {
                debug!("{}: {}", image, status);
            }
        }
        Ok(())
    }

    /// Creates the named container. Returns `false` if another process
    /// created it first.
    async fn create(&self, digest: &str) -> ProvisionerResult<bool> {
        let port_key = format!("{}/tcp", self.resource.port);

        let env: Vec<String> = self
            .resource
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let labels: HashMap<String, String> = [
            (LABEL_KIND, self.resource.kind.key().to_string()),
            (LABEL_RUN, run_id().to_string()),
            (LABEL_ARTIFACTS, digest.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let host_config = HostConfig {
            port_bindings: Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(String::new()),
                }]),
            )])),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(self.resource.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: self.resource.container_name.as_str(),
            platform: None,
        };

        match self
            .docker
            .create_container(Some(options), container_config)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if status_code(&e) == Some(409) => Ok(false),
            Err(e) => Err(ProvisionerError::Runtime(e.to_string())),
        }
    }

    async fn start_container(&self) -> ProvisionerResult<()> {
        match self
            .docker
            .start_container(
                &self.resource.container_name,
                None::<StartContainerOptions<String>>,
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already started.
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(ProvisionerError::Runtime(e.to_string())),
        }
    }

    /// Starts the container if needed and waits until it is ready.
    ///
    /// Returns the rendered client address.
    async fn bring_up(&self, already_running: bool) -> ProvisionerResult<String> {
        let since = if already_running {
            0
        } else {
            let since = chrono::Utc::now().timestamp() - 1;
            self.start_container().await?;
            since
        };

        let timeout = self.settings.startup_timeout();
        let port = tokio::time::timeout(timeout, self.wait_ready(since))
            .await
            .map_err(|_| {
                ProvisionerError::Timeout(format!(
                    "{} not ready after {}s",
                    self.resource.container_name,
                    timeout.as_secs()
                ))
            })??;

        Ok(self.resource.render_address(&self.host, port))
    }

    async fn wait_ready(&self, since: i64) -> ProvisionerResult<u16> {
        if let Readiness::Log { message } = &self.resource.readiness {
            self.wait_for_log(message, since).await?;
        }
        self.wait_for_port().await
    }

    async fn wait_for_log(&self, marker: &str, since: i64) -> ProvisionerResult<()> {
        let mut logs = self.docker.logs(
            &self.resource.container_name,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                since,
                ..Default::default()
            }),
        );

        let mut tail = String::new();
        while let Some(chunk) = logs.next().await {
            let chunk = chunk.map_err(|e| ProvisionerError::Runtime(e.to_string()))?;
            let text = match chunk {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => message,
                _ => continue,
            };
            tail.push_str(&String::from_utf8_lossy(&text));
            if tail.contains(marker) {
                debug!(
                    "{}: saw readiness marker {:?}",
                    self.resource.container_name, marker
                );
                return Ok(());
            }
            if tail.len() > LOG_TAIL_LIMIT {
                let mut cut = tail.len() - LOG_TAIL_LIMIT / 2;
                while !tail.is_char_boundary(cut) {
                    cut += 1;
                }
                tail.drain(..cut);
            }
        }

        Err(ProvisionerError::Runtime(format!(
            "{} exited before logging {:?}",
            self.resource.container_name, marker
        )))
    }

    async fn wait_for_port(&self) -> ProvisionerResult<u16> {
        loop {
            let info = self.inspect().await?.ok_or_else(|| {
                ProvisionerError::Runtime(format!(
                    "{} disappeared while starting",
                    self.resource.container_name
                ))
            })?;
            if !is_running(&info) {
                return Err(ProvisionerError::Runtime(format!(
                    "{} is not running",
                    self.resource.container_name
                )));
            }
            if let Some(port) = published_port(&info, self.resource.port) {
                if TcpStream::connect((self.host.as_str(), port)).await.is_ok() {
                    return Ok(port);
                }
            }
            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }
    }

    /// Runs a command inside a container and returns its exit code.
    async fn exec(&self, container: &str, cmd: Vec<&str>) -> ProvisionerResult<i64> {
        let exec_options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container, exec_options)
            .await
            .map_err(|e| ProvisionerError::Runtime(e.to_string()))?;

        let output = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProvisionerError::Runtime(e.to_string()))?;
        if let StartExecResults::Attached { mut output, .. } = output {
            while let Some(chunk) = output.next().await {
                chunk.map_err(|e| ProvisionerError::Runtime(e.to_string()))?;
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ProvisionerError::Runtime(e.to_string()))?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }

    async fn is_initialized(&self) -> ProvisionerResult<bool> {
        let code = self
            .exec(&self.resource.container_name, vec!["test", "-f", INIT_MARKER])
            .await?;
        Ok(code == 0)
    }

    /// Waits for the initialization marker of a reattached container.
    ///
    /// A container created by this process run without the marker was
    /// abandoned by an earlier attempt and is reported at once. Containers
    /// from other runs may still be initializing and get until the startup
    /// deadline.
    async fn wait_initialized(&self, labels: &HashMap<String, String>) -> ProvisionerResult<bool> {
        let ours = labels.get(LABEL_RUN).map(String::as_str) == Some(run_id());
        let deadline = Instant::now() + self.settings.startup_timeout();
        loop {
            if self.is_initialized().await? {
                return Ok(true);
            }
            if ours || Instant::now() >= deadline {
                return Ok(false);
            }
            debug!(
                "{}: waiting for another process to finish initialization",
                self.resource.container_name
            );
            tokio::time::sleep(INIT_POLL_INTERVAL).await;
        }
    }

    /// Reattaches to an existing container. Returns `None` if the container
    /// never finished initialization.
    async fn reattach(
        &self,
        info: &ContainerInspectResponse,
        digest: &str,
    ) -> ProvisionerResult<Option<Instance>> {
        let labels = labels_of(info);
        if let Some(applied) = labels.get(LABEL_ARTIFACTS) {
            if applied != digest {
                warn!(
                    "{} was initialized with different artifacts ({} != {}); \
                     they will not be re-applied",
                    self.resource.container_name, applied, digest
                );
            }
        }

        info!(
            "Reattaching to existing container {}",
            self.resource.container_name
        );
        let address = self.bring_up(is_running(info)).await?;
        if !self.wait_initialized(&labels).await? {
            return Ok(None);
        }
        Ok(Some(Instance::new(
            self.resource.container_name.clone(),
            address,
            InstanceOrigin::Reattached,
        )))
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    async fn start(&self, artifacts: &[InitArtifact]) -> ProvisionerResult<Instance> {
        if self.resource.image.is_empty() {
            return Err(ProvisionerError::Config(format!(
                "no image configured for {}",
                self.resource.kind
            )));
        }
        let digest = fingerprint(artifacts);

        if let Some(existing) = self.inspect().await? {
            if !self.settings.reuse_across_runs {
                info!(
                    "Removing leftover container {} (reuse disabled)",
                    self.resource.container_name
                );
            } else if let Some(instance) = self.reattach(&existing, &digest).await? {
                return Ok(instance);
            } else {
                warn!(
                    "{} never finished initialization, recreating it",
                    self.resource.container_name
                );
            }
            self.remove().await?;
        }

        self.ensure_image().await?;

        if !self.create(&digest).await? {
            debug!(
                "{} was created concurrently, reattaching",
                self.resource.container_name
            );
            let existing = self.inspect().await?.ok_or_else(|| {
                ProvisionerError::Runtime(format!(
                    "{} vanished after name conflict",
                    self.resource.container_name
                ))
            })?;
            return self.reattach(&existing, &digest).await?.ok_or_else(|| {
                ProvisionerError::Runtime(format!(
                    "{} was created concurrently but never finished initialization",
                    self.resource.container_name
                ))
            });
        }

        info!(
            "Created container {} from {}",
            self.resource.container_name, self.resource.image
        );
        let address = self.bring_up(false).await?;
        Ok(Instance::new(
            self.resource.container_name.clone(),
            address,
            InstanceOrigin::Created,
        ))
    }

    async fn stop(&self, instance: &Instance) -> ProvisionerResult<()> {
        let grace = self.settings.stop_timeout_secs as i64;
        match self
            .docker
            .stop_container(&instance.id, Some(StopContainerOptions { t: grace }))
            .await
        {
            Ok(()) => {}
            Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => {}
            Err(e) => return Err(ProvisionerError::Runtime(e.to_string())),
        }

        match self
            .docker
            .remove_container(
                &instance.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                info!("Removed container {}", instance.id);
                Ok(())
            }
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(ProvisionerError::Runtime(e.to_string())),
        }
    }

    async fn mark_initialized(&self, instance: &Instance) -> ProvisionerResult<()> {
        match self.exec(&instance.id, vec!["touch", INIT_MARKER]).await? {
            0 => {
                debug!("{}: marked initialized", instance.id);
                Ok(())
            }
            code => Err(ProvisionerError::Runtime(format!(
                "marking {} initialized exited with {}",
                instance.id, code
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn is_running(info: &ContainerInspectResponse) -> bool {
    info.state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false)
}

fn labels_of(info: &ContainerInspectResponse) -> HashMap<String, String> {
    info.config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default()
}

fn published_port(info: &ContainerInspectResponse, container_port: u16) -> Option<u16> {
    let key = format!("{}/tcp", container_port);
    info.network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&key)?
        .as_ref()?
        .iter()
        .filter_map(|binding| binding.host_port.as_deref())
        .find_map(|port| port.parse().ok())
}

/// Host at which published ports are reachable.
fn host_for(docker_host: Option<&str>) -> String {
    docker_host
        .and_then(|h| url::Url::parse(h).ok())
        .filter(|u| matches!(u.scheme(), "tcp" | "http" | "https"))
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::NetworkSettings;

    #[test]
    fn test_host_for() {
        assert_eq!(host_for(None), "127.0.0.1");
        assert_eq!(host_for(Some("unix:///var/run/docker.sock")), "127.0.0.1");
        assert_eq!(host_for(Some("tcp://10.0.0.5:2375")), "10.0.0.5");
    }

    #[test]
    fn test_published_port() {
        let info = ContainerInspectResponse {
            network_settings: Some(NetworkSettings {
                ports: Some(HashMap::from([(
                    "5432/tcp".to_string(),
                    Some(vec![
                        PortBinding {
                            host_ip: Some("0.0.0.0".to_string()),
                            host_port: Some("49153".to_string()),
                        },
                        PortBinding {
                            host_ip: Some("::".to_string()),
                            host_port: Some("49153".to_string()),
                        },
                    ]),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(published_port(&info, 5432), Some(49153));
        assert_eq!(published_port(&info, 9200), None);
    }

    #[test]
    fn test_run_id_is_stable() {
        assert_eq!(run_id(), run_id());
        assert_eq!(run_id().len(), 36);
    }
}
