//! Engine API backend.
//!
//! Holds one client connection for the life of the driver. The connection
//! is released when the backend is dropped, which happens when the driver
//! is closed or goes out of scope on any exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions};
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding};

use crate::provisioner::backend::ContainerBackend;
use crate::provisioner::engine::bridge::{
    BollardBridge, EngineBridge, ROOTFUL_SOCKET, default_endpoint, status_code,
};
use crate::provisioner::error::{ProvisionerError, Violation};
use crate::provisioner::mapper;
use crate::provisioner::normalize::{self, ContainerRequest};
use crate::provisioner::types::*;

const NOT_FOUND: u16 = 404;

pub struct ApiBackend {
    bridge: Arc<dyn EngineBridge>,
    endpoint: String,
    /// Credentials accepted by `authenticate`, reused for image pulls.
    credentials: Mutex<Option<DockerCredentials>>,
}

impl ApiBackend {
    /// Connect to `uri`, or to the default local endpoint, and ping it.
    pub async fn connect(
        uri: Option<&str>,
        container_host: Option<&str>,
    ) -> Result<Self, ProvisionerError> {
        let endpoint = match uri {
            Some(uri) => uri.to_string(),
            None => default_endpoint(container_host)
                .unwrap_or_else(|| format!("unix://{ROOTFUL_SOCKET}")),
        };
        let bridge = BollardBridge::connect(&endpoint)?;
        Self::with_bridge(Arc::new(bridge), endpoint).await
    }

    pub async fn with_bridge(
        bridge: Arc<dyn EngineBridge>,
        endpoint: String,
    ) -> Result<Self, ProvisionerError> {
        bridge.ping().await.map_err(|e| {
            ProvisionerError::BackendUnavailable(format!("engine at {endpoint} did not answer ping: {e}"))
        })?;
        tracing::info!(endpoint = %endpoint, "connected to container engine API");
        Ok(Self {
            bridge,
            endpoint,
            credentials: Mutex::new(None),
        })
    }

    fn stored_credentials(&self) -> Option<DockerCredentials> {
        self.credentials.lock().ok().and_then(|c| c.clone())
    }

    /// Force-remove a container that could not be fully provisioned.
    async fn discard(&self, id: &str) {
        if let Err(e) = self.bridge.remove_container(id, Some(force_remove())).await {
            tracing::warn!(container_id = %id, error = %e, "failed to discard partial container");
        }
    }

    async fn create_with_pull(
        &self,
        request: &ContainerRequest,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<String, ProvisionerError> {
        let created = match self
            .bridge
            .create_container(options.clone(), config.clone())
            .await
        {
            Ok(created) => created,
            Err(e) if status_code(&e) == Some(NOT_FOUND) => {
                tracing::info!(image = %request.image, "image not present locally, pulling");
                self.bridge
                    .pull_image(&request.image, self.stored_credentials())
                    .await
                    .map_err(|e| {
                        ProvisionerError::Provision(format!(
                            "failed to pull image {}: {e}",
                            request.image
                        ))
                    })?;
                self.bridge
                    .create_container(options, config)
                    .await
                    .map_err(|e| ProvisionerError::Provision(format!("create failed: {e}")))?
            }
            Err(e) => return Err(ProvisionerError::Provision(format!("create failed: {e}"))),
        };

        for warning in &created.warnings {
            tracing::warn!(container_id = %created.id, warning = %warning, "engine warning on create");
        }
        Ok(created.id)
    }
}

impl Drop for ApiBackend {
    fn drop(&mut self) {
        tracing::debug!(endpoint = %self.endpoint, "released container engine connection");
    }
}

#[async_trait]
impl ContainerBackend for ApiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Api
    }

    fn container_name(&self, spec: &ProviderSpec, asset: &Asset) -> Option<String> {
        normalize::api_container_name(spec, asset)
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
        image: &str,
    ) -> Result<(), ProvisionerError> {
        let docker_credentials = DockerCredentials {
            username: Some(credentials.username.clone()),
            password: Some(credentials.password.clone()),
            serveraddress: Some(credentials.registry.clone()),
            ..Default::default()
        };

        // The engine API has no standalone login call; a pull of the image
        // from the credential's own registry is how they are checked.
        let image_registry = registry_host(image);
        if !same_registry(&image_registry, &credentials.registry) {
            return Err(ProvisionerError::Authentication(format!(
                "credentials are for {} but {image} is hosted on {image_registry}",
                credentials.registry
            )));
        }
        self.bridge
            .pull_image(image, Some(docker_credentials.clone()))
            .await
            .map_err(|e| {
                ProvisionerError::Authentication(format!(
                    "registry {} rejected credentials for {}: {e}",
                    credentials.registry, credentials.username
                ))
            })?;
        tracing::info!(registry = %credentials.registry, "authenticated against registry");

        if let Ok(mut stored) = self.credentials.lock() {
            *stored = Some(docker_credentials);
        }
        Ok(())
    }

    async fn create(&self, request: &ContainerRequest) -> Result<ContainerResult, ProvisionerError> {
        let config = container_config(request)?;
        let options = request.name.clone().map(|name| CreateContainerOptions {
            name,
            ..Default::default()
        });

        if !request.additional_args.is_empty() {
            tracing::warn!(
                args = ?request.additional_args,
                "additional_args only apply to the exec backend; ignoring"
            );
        }

        let id = self.create_with_pull(request, options, config).await?;

        if let Err(e) = self.bridge.start_container(&id).await {
            self.discard(&id).await;
            return Err(ProvisionerError::Provision(format!(
                "failed to start container {id}: {e}"
            )));
        }

        let inspect = match self.bridge.inspect_container(&id).await {
            Ok(inspect) => inspect,
            Err(e) => {
                self.discard(&id).await;
                return Err(ProvisionerError::Provision(format!(
                    "failed to inspect container {id}: {e}"
                )));
            }
        };

        match mapper::from_inspect(&id, &inspect) {
            Ok(result) => {
                tracing::info!(
                    container_id = %result.asset_id,
                    name = %result.name,
                    "container running"
                );
                Ok(result)
            }
            Err(e) => {
                self.discard(&id).await;
                Err(e)
            }
        }
    }

    async fn delete(&self, asset_id: &str) -> Result<(), ProvisionerError> {
        match self
            .bridge
            .remove_container(asset_id, Some(force_remove()))
            .await
        {
            Ok(()) => {
                tracing::info!(container_id = %asset_id, "container removed");
                Ok(())
            }
            Err(e) if status_code(&e) == Some(NOT_FOUND) => {
                Err(ProvisionerError::AlreadyDeleted(asset_id.to_string()))
            }
            Err(e) => Err(ProvisionerError::Deprovision(format!(
                "failed to remove container {asset_id}: {e}"
            ))),
        }
    }
}

fn force_remove() -> RemoveContainerOptions {
    RemoveContainerOptions {
        force: true,
        ..Default::default()
    }
}

/// Render a request as the engine's create-container body.
pub fn container_config(request: &ContainerRequest) -> Result<Config<String>, ProvisionerError> {
    let mut mounts = Vec::with_capacity(request.mounts.len());
    let mut violations = Vec::new();
    for (i, m) in request.mounts.iter().enumerate() {
        let typ = match m.kind.as_str() {
            "bind" => MountTypeEnum::BIND,
            "volume" => MountTypeEnum::VOLUME,
            "tmpfs" => MountTypeEnum::TMPFS,
            other => {
                violations.push(Violation::new(
                    format!("provider.mounts[{i}]"),
                    format!("unsupported mount type {other:?}"),
                ));
                continue;
            }
        };
        mounts.push(Mount {
            target: Some(m.target.clone()),
            source: (typ != MountTypeEnum::TMPFS).then(|| m.source.clone()),
            typ: Some(typ),
            ..Default::default()
        });
    }
    if !violations.is_empty() {
        return Err(ProvisionerError::Validation(violations));
    }

    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for port in &request.ports {
        let key = port.port_key();
        exposed_ports.insert(key.clone(), HashMap::new());
        if port.host_port.is_some() || port.host_ip.is_some() {
            port_bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: port.host_ip.clone(),
                    host_port: port.host_port.clone(),
                });
        }
    }

    let entrypoint = request.entrypoint.as_ref().map(|e| match e {
        Entrypoint::Command(cmd) => vec![cmd.clone()],
        Entrypoint::Tokens(tokens) => tokens.clone(),
    });

    let host_config = HostConfig {
        binds: (!request.volumes.is_empty()).then(|| request.volumes.clone()),
        mounts: (!mounts.is_empty()).then_some(mounts),
        network_mode: Some(request.network_mode.clone()),
        privileged: Some(request.privileged),
        cap_add: (!request.cap_add.is_empty()).then(|| request.cap_add.clone()),
        cap_drop: (!request.cap_drop.is_empty()).then(|| request.cap_drop.clone()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        ..Default::default()
    };

    Ok(Config {
        image: Some(request.image.clone()),
        env: (!request.env.is_empty()).then(|| request.env.clone()),
        tty: Some(request.tty),
        entrypoint,
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// Registry host of an image reference; Docker Hub for bare names.
fn registry_host(image: &str) -> String {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first.to_string()
        }
        _ => "docker.io".to_string(),
    }
}

fn same_registry(image_registry: &str, credential_registry: &str) -> bool {
    let normalize = |r: &str| {
        let r = r
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        match r {
            "index.docker.io" | "registry-1.docker.io" | "index.docker.io/v1" => "docker.io".to_string(),
            other => other.to_string(),
        }
    };
    normalize(image_registry) == normalize(credential_registry)
}
