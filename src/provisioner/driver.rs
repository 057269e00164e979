//! Container lifecycle driver.
//!
//! One driver per asset. The driver owns its backend for its whole life and
//! walks an explicit state machine:
//!
//! ```text
//! Unvalidated -> Validated -> Created -> Deleted
//! ```
//!
//! Calls out of order fail with [`ProvisionerError::InvalidState`]. `delete`
//! is also accepted before `create` when the asset already carries an id, so
//! a fresh driver can tear down a container created by an earlier one.

use serde_yaml::Value;

use super::backend::ContainerBackend;
use super::error::{ProvisionerError, Violation};
use super::normalize::{self, ContainerRequest};
use super::schema::SchemaValidator;
use super::types::*;
use super::{EngineDefaults, build_backend};

/// Path prefix used in validation messages.
const PARAMS_PATH: &str = "provider";

pub struct ContainerDriver {
    params: Value,
    driver_params: DriverParams,
    credentials: Option<Credentials>,
    spec: Option<ProviderSpec>,
    backend: Box<dyn ContainerBackend>,
    state: AssetState,
}

impl ContainerDriver {
    /// Select a backend for `params` and establish connectivity.
    pub async fn connect(
        params: Value,
        credentials: Option<Credentials>,
        defaults: &EngineDefaults,
    ) -> Result<Self, ProvisionerError> {
        let driver_params = driver_params(&params)?;
        let backend = build_backend(&driver_params, defaults).await?;
        Self::with_backend(params, credentials, backend)
    }

    /// Wrap an already-connected backend.
    pub fn with_backend(
        params: Value,
        credentials: Option<Credentials>,
        backend: Box<dyn ContainerBackend>,
    ) -> Result<Self, ProvisionerError> {
        let driver_params = driver_params(&params)?;
        Ok(Self {
            params,
            driver_params,
            credentials,
            spec: None,
            backend,
            state: AssetState::Unvalidated,
        })
    }

    pub fn state(&self) -> AssetState {
        self.state
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Check the raw parameters and keep the typed spec for later calls.
    pub fn validate(&mut self) -> Result<(), ProvisionerError> {
        self.require("validate", &[AssetState::Unvalidated, AssetState::Validated])?;
        let spec = validate_params(&self.params)?;
        tracing::debug!(image = %spec.image, "provider parameters validated");
        self.spec = Some(spec);
        self.state = AssetState::Validated;
        Ok(())
    }

    /// Log in to the credentials' registry. Missing credentials are not an
    /// error: the image may be public.
    pub async fn authenticate(&self) -> Result<(), ProvisionerError> {
        self.require("authenticate", &[AssetState::Validated])?;
        let spec = self.spec()?;

        match &self.credentials {
            Some(credentials) => self.backend.authenticate(credentials, &spec.image).await,
            None => {
                tracing::warn!(
                    image = %spec.image,
                    "no registry credentials supplied; continuing unauthenticated"
                );
                Ok(())
            }
        }
    }

    /// Start one container for `asset` and record its id on the asset.
    pub async fn create(
        &mut self,
        asset: &mut Asset,
    ) -> Result<Vec<ContainerResult>, ProvisionerError> {
        self.require("create", &[AssetState::Validated])?;
        let spec = self.spec()?;

        let name = self.backend.container_name(spec, asset);
        let request = normalize::normalize(spec, name)?;
        tracing::info!(
            asset = %asset.name,
            image = %request.image,
            backend = %self.backend.kind(),
            "creating container"
        );

        let result = self.backend.create(&request).await?;
        asset.asset_id = Some(result.asset_id.clone());
        self.state = AssetState::Created;
        Ok(vec![result])
    }

    /// Force-remove the asset's container. A container the engine no longer
    /// knows, or a second delete through this driver, yields `AlreadyDeleted`.
    pub async fn delete(&mut self, asset: &Asset) -> Result<(), ProvisionerError> {
        let asset_id = match (self.state, asset.asset_id.as_deref()) {
            (AssetState::Deleted, id) => {
                return Err(ProvisionerError::AlreadyDeleted(
                    id.unwrap_or(&asset.name).to_string(),
                ));
            }
            (_, Some(id)) => id,
            (state, None) => {
                return Err(ProvisionerError::InvalidState {
                    operation: "delete",
                    state,
                });
            }
        };

        let remove = self
            .spec
            .as_ref()
            .map_or(self.driver_params.remove, |s| s.remove);
        if !remove {
            tracing::info!(container_id = %asset_id, "remove disabled; leaving container in place");
            self.state = AssetState::Deleted;
            return Ok(());
        }

        match self.backend.delete(asset_id).await {
            Ok(()) => {
                self.state = AssetState::Deleted;
                Ok(())
            }
            Err(e @ ProvisionerError::AlreadyDeleted(_)) => {
                tracing::warn!(container_id = %asset_id, "container was already gone");
                self.state = AssetState::Deleted;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Release the backend. Dropping the driver does the same.
    pub fn close(self) {
        tracing::debug!(backend = %self.backend.kind(), state = ?self.state, "closing driver");
    }

    fn require(&self, operation: &'static str, allowed: &[AssetState]) -> Result<(), ProvisionerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ProvisionerError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn spec(&self) -> Result<&ProviderSpec, ProvisionerError> {
        self.spec.as_ref().ok_or(ProvisionerError::InvalidState {
            operation: "access spec",
            state: self.state,
        })
    }
}

/// Check provider parameters against the schema and the request rules
/// `create` depends on, reporting every violation at once.
pub fn validate_params(params: &Value) -> Result<ProviderSpec, ProvisionerError> {
    let mut violations = match SchemaValidator::provider()?.validate(params, PARAMS_PATH) {
        Ok(()) => Vec::new(),
        Err(ProvisionerError::Validation(found)) => found,
        Err(e) => return Err(e),
    };

    let spec = match ProviderSpec::from_value(params.clone()) {
        Ok(spec) => Some(spec),
        Err(e) => {
            if violations.is_empty() {
                violations.push(Violation::new(PARAMS_PATH, e.to_string()));
            }
            None
        }
    };

    // Mount and port syntax is only checked by the request builder; the
    // directory side effect stays in `create`.
    if let Some(spec) = &spec {
        match ContainerRequest::from_spec(spec, None) {
            Ok(_) => {}
            Err(ProvisionerError::Validation(found)) => {
                for v in found {
                    if !covered(&violations, &v) {
                        violations.push(v);
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }

    match spec {
        Some(spec) if violations.is_empty() => Ok(spec),
        _ => Err(ProvisionerError::Validation(violations)),
    }
}

/// True when `found` repeats a violation already reported for the same
/// field or one of its children.
fn covered(reported: &[Violation], found: &Violation) -> bool {
    reported.iter().any(|v| {
        v.path == found.path
            || v.path.starts_with(&format!("{}.", found.path))
            || v.path.starts_with(&format!("{}[", found.path))
    })
}

fn driver_params(params: &Value) -> Result<DriverParams, ProvisionerError> {
    if params.is_null() {
        return Ok(DriverParams::default());
    }
    serde_yaml::from_value(params.clone())
        .map_err(|e| ProvisionerError::Configuration(format!("provider parameters: {e}")))
}
