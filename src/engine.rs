//! Container engine access behind a narrow seam
//!
//! Handlers, runners, and sweepers only ever talk to [`ContainerEngine`];
//! the bollard-backed [`DockerEngine`] is the production implementation.
//! Stop and remove are tolerant of already-gone containers so that
//! compensation sequences can retry them freely.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::ConnectNetworkOptions;
use bollard::Docker;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything the engine needs to create a container for an app
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name, equal to the app id
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// Host directory bind-mounted to /home/app in the guest
    pub mount_dir: String,
    /// KEY=VALUE pairs, in caller order
    pub env: Vec<String>,
}

/// The engine operations this service consumes
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a container from the spec; returns the engine handle
    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    /// Connect a created container to the named network
    async fn connect_network(&self, container_id: &str, network: &str) -> anyhow::Result<()>;

    async fn start_container(&self, container_id: &str) -> anyhow::Result<()>;

    /// Stop with a grace period; succeeds if the container is already stopped or gone
    async fn stop_container(&self, container_id: &str, timeout: Duration) -> anyhow::Result<()>;

    /// Remove; succeeds if the container is already gone
    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()>;

    /// URL at which this process reaches the guest's port 8080
    fn backend_url(&self, container_name: &str) -> String;
}

/// Docker daemon client
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to the Docker daemon via the default socket and verify it responds
    pub async fn new() -> anyhow::Result<Self> {
        let client = Docker::connect_with_socket_defaults()
            .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?;

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    /// Pull the image if it is not present locally
    async fn pull_image_if_missing(&self, image: &str) -> anyhow::Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress =
                result.map_err(|e| anyhow::anyhow!("Failed to pull image '{}': {}", image, e))?;
            if let Some(error) = progress.error {
                anyhow::bail!("Failed to pull image '{}': {}", image, error);
            }
        }

        info!(image, "Image pulled");
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.pull_image_if_missing(&spec.image).await?;

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            entrypoint: Some(vec!["docker-entrypoint.sh".to_string()]),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:/home/app", spec.mount_dir)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                warn!(name = %spec.name, error = %e, "Engine create failed");
                anyhow::anyhow!("Could not create docker container")
            })?;

        info!(name = %spec.name, container_id = %response.id, image = %spec.image, "Created container");
        Ok(response.id)
    }

    async fn connect_network(&self, container_id: &str, network: &str) -> anyhow::Result<()> {
        let options = ConnectNetworkOptions {
            container: container_id,
            endpoint_config: EndpointSettings::default(),
        };

        self.client
            .connect_network(network, options)
            .await
            .map_err(|e| {
                warn!(container_id, network, error = %e, "Network connect failed");
                anyhow::anyhow!("Could not connect container to network")
            })?;

        debug!(container_id, network, "Connected container to network");
        Ok(())
    }

    async fn start_container(&self, container_id: &str) -> anyhow::Result<()> {
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                warn!(container_id, error = %e, "Engine start failed");
                anyhow::anyhow!("Could not start docker container")
            })?;

        info!(container_id, "Started container");
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, timeout: Duration) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => {
                warn!(container_id, error = %e, "Engine stop failed");
                Err(anyhow::anyhow!("Could not stop docker container"))
            }
        }
    }

    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => {
                info!(container_id, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => {
                warn!(container_id, error = %e, "Engine remove failed");
                Err(anyhow::anyhow!("Could not remove container"))
            }
        }
    }

    fn backend_url(&self, container_name: &str) -> String {
        // Guests listen on 8080; names resolve on the shared docker network
        format!("http://{}:8080", container_name)
    }
}
