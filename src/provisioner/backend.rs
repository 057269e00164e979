use async_trait::async_trait;

use super::error::ProvisionerError;
use super::normalize::ContainerRequest;
use super::types::{Asset, BackendKind, ContainerResult, Credentials, ProviderSpec};

/// One engine integration strategy.
///
/// A driver owns exactly one backend, chosen at construction and never
/// swapped. Each call completes (or fails) before returning; backends keep
/// no background work and perform no retries.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Name to request from the engine for this asset, per the backend's
    /// naming rule. `None` lets the engine pick one.
    fn container_name(&self, spec: &ProviderSpec, asset: &Asset) -> Option<String>;

    /// Log in to `credentials.registry`. `image` is the reference the asset
    /// will run.
    async fn authenticate(
        &self,
        credentials: &Credentials,
        image: &str,
    ) -> Result<(), ProvisionerError>;

    /// Start one detached container and resolve its name and id.
    async fn create(&self, request: &ContainerRequest) -> Result<ContainerResult, ProvisionerError>;

    /// Force-remove a container. An engine that no longer knows the id
    /// yields `AlreadyDeleted`.
    async fn delete(&self, asset_id: &str) -> Result<(), ProvisionerError>;
}
