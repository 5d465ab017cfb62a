use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
    RemoveContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::Docker;
use futures::TryStreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::Result;

static DNS_SAFE: Lazy<Regex> = Lazy::new(|| Regex::new("[^a-z0-9-]+").unwrap());

/// Collapse anything outside `[a-z0-9-]` to a dash so the name is valid
/// as both a container name and a DNS alias.
pub fn sanitize_name(raw: &str) -> String {
    DNS_SAFE
        .replace_all(&raw.trim().to_lowercase(), "-")
        .into_owned()
}

/// Name of the slot shared by its containers as a DNS alias.
pub fn slot_name(service: &str, version: &str) -> String {
    sanitize_name(&format!("{service}-{version}"))
}

/// Create, inspect and reclaim the containers of a service slot.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Materialises a slot as `replicas` containers attached to the agent
    /// network under the slot's DNS alias.
    #[allow(clippy::too_many_arguments)]
    async fn create_service(
        &self,
        service: &str,
        version: &str,
        image: &str,
        replicas: u32,
        envs: &[String],
        port: u16,
        pull_always: bool,
    ) -> Result<()>;

    /// Stops and removes every container of the slot. A slot with no
    /// containers left is not an error.
    async fn remove_slot(&self, service: &str, version: &str) -> Result<()>;

    async fn get_replicas(&self, service: &str, version: &str) -> Result<u32>;

    async fn list_by_slot(&self, service: &str, version: &str) -> Result<Vec<String>>;

    async fn get_service_image(&self, service: &str, version: &str) -> Result<String>;
}

pub struct DockerDriver {
    docker: Docker,
    network: String,
}

impl DockerDriver {
    pub fn new(network: String) -> std::result::Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;

        Ok(Self { docker, network })
    }

    async fn image_is_local(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(%image, "pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let progress = self.docker.create_image(Some(options), None, None);
        tokio::pin!(progress);
        while let Some(update) = progress.try_next().await? {
            if let Some(status) = update.status {
                debug!(%image, %status, "pull progress");
            }
        }

        Ok(())
    }

    /// All containers whose name starts with the slot prefix, including
    /// stopped ones.
    async fn containers_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<bollard::models::ContainerSummary>> {
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![prefix.to_string()])]),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        // The docker name filter is a substring match, so re-check the prefix.
        Ok(containers
            .into_iter()
            .filter(|container| {
                container
                    .names
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|name| name.trim_start_matches('/').starts_with(prefix))
            })
            .collect())
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create_service(
        &self,
        service: &str,
        version: &str,
        image: &str,
        replicas: u32,
        envs: &[String],
        port: u16,
        pull_always: bool,
    ) -> Result<()> {
        let slot = slot_name(service, version);
        info!(%slot, %image, replicas, "creating slot containers");

        if pull_always || !self.image_is_local(image).await? {
            self.pull_image(image).await?;
        }

        for i in 1..=replicas {
            let name = format!("{slot}-{i}");

            // A container left over from an earlier delivery of the same job
            // is reused instead of failing the rollout.
            match self.docker.inspect_container(&name, None).await {
                Ok(_) => {
                    debug!(container = %name, "container already exists, reusing");
                }
                Err(DockerError::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    let options = CreateContainerOptions {
                        name: name.clone(),
                        platform: None,
                    };
                    let config = Config {
                        image: Some(image.to_string()),
                        env: Some(envs.to_vec()),
                        exposed_ports: Some(HashMap::from([(
                            format!("{port}/tcp"),
                            HashMap::new(),
                        )])),
                        labels: Some(HashMap::from([
                            ("traefik.enable".to_string(), "true".to_string()),
                            (
                                format!(
                                    "traefik.http.services.{slot}.loadbalancer.server.port"
                                ),
                                port.to_string(),
                            ),
                        ])),
                        host_config: Some(HostConfig {
                            network_mode: Some(self.network.clone()),
                            ..Default::default()
                        }),
                        networking_config: Some(NetworkingConfig {
                            endpoints_config: HashMap::from([(
                                self.network.clone(),
                                EndpointSettings {
                                    aliases: Some(vec![slot.clone()]),
                                    ..Default::default()
                                },
                            )]),
                        }),
                        ..Default::default()
                    };

                    self.docker.create_container(Some(options), config).await?;
                }
                Err(error) => return Err(error.into()),
            }

            self.docker
                .start_container::<String>(&name, None)
                .await
                .or_else(|error| {
                    if matches!(
                        error,
                        DockerError::DockerResponseServerError {
                            status_code: 304,
                            ..
                        }
                    ) {
                        // Already started
                        Ok(())
                    } else {
                        Err(error)
                    }
                })?;

            info!(container = %name, %image, port, "container created and started");
        }

        Ok(())
    }

    async fn remove_slot(&self, service: &str, version: &str) -> Result<()> {
        let prefix = slot_name(service, version);
        let containers = self.containers_by_prefix(&prefix).await?;

        if containers.is_empty() {
            warn!(%prefix, "no containers found to remove");
            return Ok(());
        }

        for container in containers {
            let Some(id) = container.id else { continue };
            let name = container
                .names
                .as_deref()
                .unwrap_or_default()
                .first()
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.clone());

            info!(container = %name, "removing container");

            if container.state.as_deref() == Some("running") {
                if let Err(error) = self.docker.stop_container(&id, None).await {
                    warn!(container = %name, error = %error, "failed to stop container");
                }
            }

            self.docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await?;
        }

        Ok(())
    }

    async fn get_replicas(&self, service: &str, version: &str) -> Result<u32> {
        let prefix = slot_name(service, version);
        let containers = self.containers_by_prefix(&prefix).await?;

        Ok(containers.len() as u32)
    }

    async fn list_by_slot(&self, service: &str, version: &str) -> Result<Vec<String>> {
        let prefix = slot_name(service, version);
        let containers = self.containers_by_prefix(&prefix).await?;

        Ok(containers
            .into_iter()
            .filter_map(|container| {
                container
                    .names
                    .as_deref()
                    .unwrap_or_default()
                    .first()
                    .map(|name| name.trim_start_matches('/').to_string())
            })
            .collect())
    }

    async fn get_service_image(&self, service: &str, version: &str) -> Result<String> {
        let prefix = slot_name(service, version);
        let containers = self.containers_by_prefix(&prefix).await?;

        containers
            .into_iter()
            .find_map(|container| container.image)
            .ok_or_else(|| crate::error::Error::Infra(format!("no container found for {prefix}")))
    }
}
