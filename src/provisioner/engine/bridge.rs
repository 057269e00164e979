//! Engine API binding.
//!
//! `ApiBackend` only sees the engine through [`EngineBridge`]; the
//! production implementation wraps a `bollard` client talking to the
//! engine's Docker-compatible REST endpoint.

use std::path::PathBuf;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerCreateResponse, ContainerInspectResponse};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::StreamExt;

use crate::provisioner::error::ProvisionerError;

/// Rootful engine socket.
pub const ROOTFUL_SOCKET: &str = "/run/podman/podman.sock";

/// Transport timeout handed to the client, in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 120;

#[async_trait]
pub trait EngineBridge: Send + Sync {
    async fn ping(&self) -> Result<(), DockerError>;
    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), DockerError>;
    async fn create_container(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError>;
    async fn start_container(&self, id: &str) -> Result<(), DockerError>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError>;
    async fn remove_container(
        &self,
        id: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError>;
}

pub struct BollardBridge {
    docker: Docker,
}

impl BollardBridge {
    /// Open a client for `uri` (`unix://`, `tcp://` or `http://`).
    pub fn connect(uri: &str) -> Result<Self, ProvisionerError> {
        let connected = if let Some(path) = uri.strip_prefix("unix://") {
            Docker::connect_with_unix(path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else if let Some(addr) = uri.strip_prefix("tcp://") {
            Docker::connect_with_http(
                &format!("http://{addr}"),
                CONNECT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            )
        } else if uri.starts_with("http://") {
            Docker::connect_with_http(uri, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else {
            return Err(ProvisionerError::Configuration(format!(
                "unsupported engine uri {uri:?}; expected unix://, tcp:// or http://"
            )));
        };
        let docker = connected
            .map_err(|e| ProvisionerError::Configuration(format!("failed to connect to {uri}: {e}")))?;

        Ok(Self { docker })
    }
}

#[async_trait]
impl EngineBridge for BollardBridge {
    async fn ping(&self) -> Result<(), DockerError> {
        self.docker.ping().await.map(|_| ())
    }

    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), DockerError> {
        let (from_image, tag) = split_image_ref(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn create_container(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        self.docker.create_container(options, config).await
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
    }

    async fn remove_container(
        &self,
        id: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError> {
        self.docker.remove_container(id, options).await
    }
}

/// Engine endpoint used when the provider parameters name none: `CONTAINER_HOST`, then the
/// rootless socket under the user runtime dir, then the rootful socket.
pub fn default_endpoint(container_host: Option<&str>) -> Option<String> {
    if let Some(host) = container_host.filter(|h| !h.is_empty()) {
        return Some(host.to_string());
    }
    rootless_socket()
        .filter(|p| p.exists())
        .or_else(|| Some(PathBuf::from(ROOTFUL_SOCKET)).filter(|p| p.exists()))
        .map(|p| format!("unix://{}", p.display()))
}

fn rootless_socket() -> Option<PathBuf> {
    dirs::runtime_dir().map(|dir| dir.join("podman").join("podman.sock"))
}

/// Split an image reference into repository and tag. Untagged references
/// pull `latest`; digest references keep the digest in the repository part.
pub fn split_image_ref(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.rsplit_once(':') {
        Some((_, tag)) => {
            let repo = &image[..image.len() - tag.len() - 1];
            (repo.to_string(), tag.to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

/// HTTP status carried by an engine error, if any.
pub fn status_code(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_refs_split_into_repo_and_tag() {
        assert_eq!(
            split_image_ref("nginx"),
            ("nginx".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_image_ref("quay.io/podman/hello:1.2"),
            ("quay.io/podman/hello".to_string(), "1.2".to_string())
        );
        assert_eq!(
            split_image_ref("localhost:5000/app"),
            ("localhost:5000/app".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_image_ref("localhost:5000/app:dev"),
            ("localhost:5000/app".to_string(), "dev".to_string())
        );
        assert_eq!(
            split_image_ref("alpine@sha256:abc"),
            ("alpine@sha256:abc".to_string(), String::new())
        );
    }

    #[test]
    fn container_host_wins_default_endpoint() {
        assert_eq!(
            default_endpoint(Some("tcp://10.0.0.5:8888")).as_deref(),
            Some("tcp://10.0.0.5:8888")
        );
    }

    #[test]
    fn unsupported_scheme_is_configuration_error() {
        let err = BollardBridge::connect("ssh://core@host/run/podman/podman.sock")
            .err()
            .unwrap();
        assert!(matches!(err, ProvisionerError::Configuration(_)));
    }

    #[test]
    fn status_code_reads_server_errors() {
        let err = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        assert_eq!(status_code(&err), Some(404));
    }
}
