//! Docker Runtime
//!
//! [`RuntimeAdapter`] backed by the local Docker daemon. Container operations
//! go through the engine API; image builds shell out to `docker build`, which
//! takes care of packaging the build context.

use super::{ImageRef, RuntimeAdapter, UnitRef, service_port_key};
use crate::{Error, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as EngineError;
use bollard::image::RemoveImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::{API_DEFAULT_VERSION, Docker};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// `unix://` socket or `tcp://`/`http://` address; `None` uses the
    /// engine's local defaults (which honour `DOCKER_HOST`).
    pub docker_host: Option<String>,

    pub stop_timeout: Duration,

    /// Host interface published ports bind to; `None` binds all interfaces.
    pub bind_address: Option<String>,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            stop_timeout: Duration::from_secs(10),
            bind_address: None,
        }
    }
}

pub struct DockerRuntime {
    config: DockerRuntimeConfig,

    docker: Option<Docker>,

    /// Why the engine could not be reached at construction time.
    unavailable: Option<String>,
}

impl DockerRuntime {
    /// Connect and ping the engine. Never fails: an unreachable engine yields
    /// a degraded runtime whose every operation returns `EngineUnreachable`.
    pub async fn connect(config: DockerRuntimeConfig) -> Self {
        let connected = match config.docker_host.as_deref() {
            Some(host) if host.starts_with("unix://") => Docker::connect_with_socket(
                host.trim_start_matches("unix://"),
                CONNECT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(host) => {
                warn!(docker_host = %host, "Unrecognised docker host scheme, using local defaults");
                Docker::connect_with_local_defaults()
            }
            None => Docker::connect_with_local_defaults(),
        };

        let outcome = match connected {
            Ok(docker) => match docker.ping().await {
                Ok(_) => Ok(docker),
                Err(err) => Err(err.to_string()),
            },
            Err(err) => Err(err.to_string()),
        };

        match outcome {
            Ok(docker) => {
                info!("Docker client initialized");
                Self {
                    config,
                    docker: Some(docker),
                    unavailable: None,
                }
            }
            Err(reason) => {
                error!(reason = %reason, "Docker unavailable, container operations disabled");
                Self::degraded(config, reason)
            }
        }
    }

    /// A runtime that refuses every operation.
    pub fn degraded(config: DockerRuntimeConfig, reason: impl Into<String>) -> Self {
        Self {
            config,
            docker: None,
            unavailable: Some(reason.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.docker.is_none()
    }

    fn docker(&self) -> Result<&Docker> {
        self.docker.as_ref().ok_or_else(|| {
            Error::unreachable(
                self.unavailable
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            )
        })
    }

    async fn inspect(&self, unit: &UnitRef) -> Result<Option<ContainerInspectResponse>> {
        let docker = self.docker()?;
        match docker
            .inspect_container(unit.as_str(), None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(Some(inspect)),
            Err(EngineError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(err) => Err(engine_error("inspect container", err)),
        }
    }
}

/// Engine responses become operation errors; anything else (socket, timeout,
/// protocol) means the engine itself is unreachable.
fn engine_error(operation: &str, err: EngineError) -> Error {
    match err {
        EngineError::DockerResponseServerError {
            status_code,
            message,
        } => Error::EngineOperation {
            operation: operation.to_string(),
            reason: format!("{} {}", status_code, message),
        },
        other => Error::unreachable(other.to_string()),
    }
}

fn mapped_port(inspect: &ContainerInspectResponse) -> Option<u16> {
    let ports = inspect.network_settings.as_ref()?.ports.as_ref()?;
    let bindings = ports.get(&service_port_key())?.as_ref()?;
    bindings
        .iter()
        .filter_map(|binding| binding.host_port.as_deref())
        .find_map(|port| port.parse::<u16>().ok())
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker()?
            .ping()
            .await
            .map(|_| ())
            .map_err(|err| Error::unreachable(err.to_string()))
    }

    async fn build_image(&self, source: &Path, tag: &str) -> Result<ImageRef> {
        self.docker()?;

        info!(tag = %tag, path = %source.display(), "Building image");

        let mut cmd = Command::new("docker");
        if let Some(host) = &self.config.docker_host {
            cmd.env("DOCKER_HOST", host);
        }
        cmd.arg("build")
            .arg("--rm")
            .arg("--force-rm")
            .arg("-t")
            .arg(tag)
            .arg(source);

        let output = cmd.output().await.map_err(|e| Error::BuildFailed {
            tag: tag.to_string(),
            reason: format!("Failed to run docker: {}", e),
        })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(tag = %tag, "{}", line);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::BuildFailed {
                tag: tag.to_string(),
                reason: stderr.trim().to_string(),
            });
        }

        info!(tag = %tag, "Image built");
        Ok(ImageRef::new(tag))
    }

    async fn create_unit(&self, image: &ImageRef, name: &str) -> Result<UnitRef> {
        let docker = self.docker()?;
        let port_key = service_port_key();

        // No host port: the engine picks a free one at start time.
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: self.config.bind_address.clone(),
                host_port: None,
            }]),
        );

        let config = Config {
            image: Some(image.as_str().to_string()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| engine_error("create container", err))?;

        let unit = UnitRef::new(created.id);
        info!(unit = %unit.short(), name = %name, image = %image, "Created container");
        Ok(unit)
    }

    async fn start(&self, unit: &UnitRef) -> Result<u16> {
        let docker = self.docker()?;

        match docker
            .start_container(unit.as_str(), None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            // Already running.
            Err(EngineError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(EngineError::DockerResponseServerError {
                status_code,
                message,
            }) => {
                return Err(Error::StartFailed {
                    unit: unit.short().to_string(),
                    reason: format!("{} {}", status_code, message),
                });
            }
            Err(other) => return Err(Error::unreachable(other.to_string())),
        }

        debug!(unit = %unit.short(), "Started container");

        self.get_port(unit)
            .await?
            .ok_or_else(|| Error::NoPortAssigned {
                unit: unit.short().to_string(),
            })
    }

    async fn stop(&self, unit: &UnitRef) -> Result<()> {
        let docker = self.docker()?;
        let options = StopContainerOptions {
            t: self.config.stop_timeout.as_secs() as i64,
        };

        match docker.stop_container(unit.as_str(), Some(options)).await {
            Ok(()) => {
                info!(unit = %unit.short(), "Stopped container");
                Ok(())
            }
            Err(EngineError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(EngineError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                warn!(unit = %unit.short(), "Container vanished before stop");
                Ok(())
            }
            Err(err) => Err(engine_error("stop container", err)),
        }
    }

    async fn get_port(&self, unit: &UnitRef) -> Result<Option<u16>> {
        Ok(self.inspect(unit).await?.as_ref().and_then(mapped_port))
    }

    async fn is_running(&self, unit: &UnitRef) -> Result<bool> {
        Ok(self
            .inspect(unit)
            .await?
            .and_then(|inspect| inspect.state)
            .and_then(|state| state.running)
            .unwrap_or(false))
    }

    async fn remove_unit(&self, unit: &UnitRef) -> Result<()> {
        let docker = self.docker()?;
        match docker
            .remove_container(
                unit.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                info!(unit = %unit.short(), "Removed container");
                Ok(())
            }
            Err(EngineError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(engine_error("remove container", err)),
        }
    }

    async fn remove_image(&self, image: &ImageRef) -> Result<()> {
        let docker = self.docker()?;
        match docker
            .remove_image(
                image.as_str(),
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
        {
            Ok(_) => {
                info!(image = %image, "Removed image");
                Ok(())
            }
            Err(EngineError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(engine_error("remove image", err)),
        }
    }
}
