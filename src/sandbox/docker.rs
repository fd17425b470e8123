//! Docker-backed container runtime

use super::{ContainerSpec, ContainerStatus, SandboxRuntime};
use crate::error::SandboxError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, DeviceMapping, HostConfig, Mount, MountTypeEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

/// Runtime talking to the local Docker daemon
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local daemon and check it answers
    pub async fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Runtime(format!("Failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| SandboxError::Runtime(format!("Failed to ping Docker: {}", e)))?;

        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn host_config(spec: &ContainerSpec) -> HostConfig {
    let mounts = spec
        .binds
        .iter()
        .map(|bind| Mount {
            target: Some(bind.target.clone()),
            source: Some(bind.source.to_string_lossy().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        })
        .collect();

    let devices = spec
        .devices
        .iter()
        .map(|device| DeviceMapping {
            path_on_host: Some(device.clone()),
            path_in_container: Some(device.clone()),
            cgroup_permissions: Some("rwm".to_string()),
        })
        .collect::<Vec<_>>();

    HostConfig {
        network_mode: Some(spec.network.clone()),
        mounts: Some(mounts),
        devices: (!devices.is_empty()).then_some(devices),
        auto_remove: Some(false),
        ..Default::default()
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        info!("Pulling image: {}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(SandboxError::Pull {
                        image: image.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!("Image {} pulled successfully", image);
        Ok(())
    }

    async fn is_image_present(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    async fn create_network_if_missing(&self, name: &str) -> Result<bool, SandboxError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!("Network {} already exists", name);
                return Ok(false);
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(SandboxError::Runtime(e.to_string())),
        }

        let options = CreateNetworkOptions {
            name,
            driver: "bridge",
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| SandboxError::Runtime(format!("Failed to create network {}: {}", name, e)))?;

        info!("Created network: {}", name);
        Ok(true)
    }

    async fn find_container(&self, name: &str) -> Result<Option<String>, SandboxError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(inspect.id),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(SandboxError::Runtime(e.to_string())),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            env: Some(spec.env.clone()),
            host_config: Some(host_config(spec)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::Create {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        for warning in &response.warnings {
            warn!("Container {} created with warning: {}", spec.name, warning);
        }
        info!("Created container: {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Start(id.to_string(), e.to_string()))?;

        info!("Started container: {}", id);
        Ok(())
    }

    async fn container_status(&self, id: &str) -> Result<ContainerStatus, SandboxError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| SandboxError::Runtime(e.to_string()))?;

        let Some(state) = inspect.state else {
            return Ok(ContainerStatus::Unknown);
        };
        let status = match state.status {
            Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
            Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
                ContainerStatus::Exited {
                    exit_code: state.exit_code.unwrap_or(-1),
                }
            }
            _ => ContainerStatus::Unknown,
        };
        Ok(status)
    }

    async fn stop_container(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .stop_container(id, None)
            .await
            .map_err(|e| SandboxError::Runtime(format!("Failed to stop container {}: {}", id, e)))?;
        debug!("Stopped container: {}", id);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| SandboxError::Runtime(format!("Failed to remove container {}: {}", id, e)))?;

        debug!("Removed container: {}", id);
        Ok(())
    }

    async fn container_logs(&self, id: &str) -> Result<(String, String), SandboxError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stream = self.docker.logs(id, Some(options));

        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::Console { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Error reading logs of {}: {}", id, e);
                    break;
                }
            }
        }

        Ok((stdout, stderr))
    }
}
