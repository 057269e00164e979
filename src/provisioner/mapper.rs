use bollard::models::ContainerInspectResponse;

use super::error::ProvisionerError;
use super::types::ContainerResult;

/// Asset record for a container. The name doubles as `ip` since no
/// network identity lookup is performed.
pub fn container_result(name: String, asset_id: String) -> ContainerResult {
    ContainerResult {
        ip: name.clone(),
        name,
        asset_id,
    }
}

/// Map an engine inspect response for a freshly created container.
pub fn from_inspect(
    id: &str,
    inspect: &ContainerInspectResponse,
) -> Result<ContainerResult, ProvisionerError> {
    let id = single_token(id, "container id")?;
    let name = inspect.name.as_deref().unwrap_or_default();
    let name = single_token(name.trim_start_matches('/'), "container name")?;
    Ok(container_result(name, id))
}

/// Container id printed by a detached `run`.
pub fn parse_container_id(stdout: &str) -> Result<String, ProvisionerError> {
    single_token(stdout, "container id")
}

/// Container name printed by `inspect --format {{.Name}}`.
pub fn parse_container_name(stdout: &str) -> Result<String, ProvisionerError> {
    single_token(stdout.trim().trim_start_matches('/'), "container name")
}

fn single_token(raw: &str, what: &str) -> Result<String, ProvisionerError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ProvisionerError::BackendProtocol(format!("empty {what}")));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(ProvisionerError::BackendProtocol(format!(
            "malformed {what}: {value:?}"
        )));
    }
    Ok(value.to_string())
}
