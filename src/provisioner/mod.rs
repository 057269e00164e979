pub mod backend;
pub mod backends;
pub mod driver;
pub mod engine;
pub mod error;
pub mod mapper;
pub mod normalize;
pub mod schema;
pub mod types;

pub use backend::ContainerBackend;
pub use driver::{ContainerDriver, validate_params};
pub use error::{ProvisionerError, Violation};
pub use normalize::ContainerRequest;
pub use types::*;

use backends::api::ApiBackend;
use backends::exec::ExecBackend;
use engine::bridge::default_endpoint;

/// Process-level fallbacks consulted when the provider parameters leave the
/// engine location open.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    /// `CONTAINER_HOST` value, if set.
    pub container_host: Option<String>,
    /// Executable searched on `PATH` when no `executable_path` is given.
    pub executable_name: String,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            container_host: None,
            executable_name: "podman".to_string(),
        }
    }
}

/// Pick the integration strategy. An explicit `backend` wins; otherwise the
/// shape of the parameters decides, then whether a local API socket exists.
pub fn choose_backend(params: &DriverParams, defaults: &EngineDefaults) -> BackendKind {
    if let Some(kind) = params.backend {
        return kind;
    }
    if params.uri.is_some() {
        return BackendKind::Api;
    }
    if params.executable_path.is_some() || params.remote.is_some() {
        return BackendKind::Exec;
    }
    if default_endpoint(defaults.container_host.as_deref()).is_some() {
        BackendKind::Api
    } else {
        BackendKind::Exec
    }
}

/// Build and connect the backend for `params`.
pub async fn build_backend(
    params: &DriverParams,
    defaults: &EngineDefaults,
) -> Result<Box<dyn ContainerBackend>, ProvisionerError> {
    match choose_backend(params, defaults) {
        BackendKind::Api => {
            tracing::info!(uri = ?params.uri, "initializing engine API backend");
            if params.remote.is_some() {
                tracing::warn!("remote target is ignored by the engine API backend; use uri instead");
            }
            let backend =
                ApiBackend::connect(params.uri.as_deref(), defaults.container_host.as_deref())
                    .await?;
            Ok(Box::new(backend))
        }
        BackendKind::Exec => {
            tracing::info!(
                executable = %defaults.executable_name,
                remote = params.remote.is_some(),
                "initializing executable backend"
            );
            let backend = ExecBackend::locate(
                params.executable_path.as_deref(),
                &defaults.executable_name,
                params.remote.clone(),
            )
            .await?;
            Ok(Box::new(backend))
        }
    }
}
