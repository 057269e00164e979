//! Executable backend.
//!
//! Every operation is one invocation of the engine executable with a
//! structured argument list; nothing is joined into a shell string.
//! A remote target is checked with `info` when the backend is built and
//! registered as a named connection on the first `create`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::provisioner::backend::ContainerBackend;
use crate::provisioner::engine::command::{
    CommandOutput, CommandRunner, ProcessRunner, resolve_executable,
};
use crate::provisioner::error::ProvisionerError;
use crate::provisioner::mapper;
use crate::provisioner::normalize::{self, ContainerRequest};
use crate::provisioner::types::*;

/// Prefix for connection names this backend registers.
const CONNECTION_PREFIX: &str = "podprov";

pub struct ExecBackend {
    executable: PathBuf,
    runner: Arc<dyn CommandRunner>,
    remote: Option<RemoteTarget>,
    /// Name of the registered remote connection, set once by `create`.
    connection: OnceCell<String>,
}

impl ExecBackend {
    /// Resolve the executable (explicit path or `PATH` lookup) and check
    /// the remote target, if any.
    pub async fn locate(
        explicit: Option<&Path>,
        name: &str,
        remote: Option<RemoteTarget>,
    ) -> Result<Self, ProvisionerError> {
        let executable = resolve_executable(explicit, name)?;
        Self::with_runner(executable, Arc::new(ProcessRunner::default()), remote).await
    }

    pub async fn with_runner(
        executable: PathBuf,
        runner: Arc<dyn CommandRunner>,
        remote: Option<RemoteTarget>,
    ) -> Result<Self, ProvisionerError> {
        let backend = Self {
            executable,
            runner,
            remote,
            connection: OnceCell::new(),
        };

        if let Some(remote) = &backend.remote {
            let out = backend.invoke(vec!["info".into()], None).await?;
            if !out.success() {
                return Err(ProvisionerError::BackendUnavailable(format!(
                    "remote engine {} rejected info: {}",
                    remote.uri,
                    out.stderr_text()
                )));
            }
        }

        tracing::info!(
            executable = %backend.executable.display(),
            remote = ?backend.remote.as_ref().map(|r| r.uri.as_str()),
            "using container engine executable"
        );
        Ok(backend)
    }

    /// Global arguments placed before every subcommand.
    fn prefix(&self) -> Vec<String> {
        if let Some(name) = self.connection.get() {
            return vec!["--connection".into(), name.clone()];
        }
        match &self.remote {
            Some(remote) => {
                let mut args = vec!["--url".into(), remote_destination(remote)];
                if let Some(identity) = &remote.identity {
                    args.push("--identity".into());
                    args.push(identity.display().to_string());
                }
                args
            }
            None => Vec::new(),
        }
    }

    async fn invoke(
        &self,
        args: Vec<String>,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ProvisionerError> {
        let mut full = self.prefix();
        full.extend(args);
        self.runner.run(&self.executable, &full, stdin).await
    }

    /// Register the remote connection once per backend. Registration is
    /// skipped when a connection of the same name already exists.
    async fn ensure_connection(&self) -> Result<(), ProvisionerError> {
        if let Some(remote) = &self.remote {
            self.connection
                .get_or_try_init(|| self.register(remote))
                .await?;
        }
        Ok(())
    }

    async fn register(&self, remote: &RemoteTarget) -> Result<String, ProvisionerError> {
        let name = connection_name(remote);

        let list = self
            .runner
            .run(
                &self.executable,
                &strings(&["system", "connection", "list", "--format", "{{.Name}}"]),
                None,
            )
            .await?;
        if list.success() && list.stdout_text().lines().any(|l| l.trim() == name) {
            tracing::debug!(connection = %name, "remote connection already registered");
            return Ok(name);
        }

        let mut args = strings(&["system", "connection", "add"]);
        args.push(name.clone());
        args.push(remote_destination(remote));
        if let Some(identity) = &remote.identity {
            args.push("--identity".into());
            args.push(identity.display().to_string());
        }
        let out = self.runner.run(&self.executable, &args, None).await?;
        if !out.success() {
            return Err(ProvisionerError::Provision(format!(
                "failed to register remote connection {name}: {}",
                out.stderr_text()
            )));
        }

        tracing::info!(connection = %name, uri = %remote.uri, "registered remote connection");
        Ok(name)
    }

    async fn inspect_name(&self, id: &str) -> Result<String, ProvisionerError> {
        let out = self
            .invoke(strings(&["inspect", "--format", "{{.Name}}", id]), None)
            .await?;
        if !out.success() {
            return Err(ProvisionerError::Provision(format!(
                "inspect of {id} failed: {}",
                out.stderr_text()
            )));
        }
        mapper::parse_container_name(&out.stdout_text())
    }

    async fn discard(&self, id: &str) {
        match self.invoke(strings(&["rm", "--force", id]), None).await {
            Ok(out) if out.success() => {}
            Ok(out) => tracing::warn!(
                container_id = %id,
                stderr = %out.stderr_text(),
                "failed to discard partial container"
            ),
            Err(e) => tracing::warn!(container_id = %id, error = %e, "failed to discard partial container"),
        }
    }
}

#[async_trait]
impl ContainerBackend for ExecBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Exec
    }

    fn container_name(&self, spec: &ProviderSpec, _asset: &Asset) -> Option<String> {
        normalize::exec_container_name(spec)
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
        _image: &str,
    ) -> Result<(), ProvisionerError> {
        let args = vec![
            "login".into(),
            "--username".into(),
            credentials.username.clone(),
            "--password-stdin".into(),
            credentials.registry.clone(),
        ];
        let out = self
            .invoke(args, Some(credentials.password.as_bytes()))
            .await?;
        if !out.success() {
            return Err(ProvisionerError::Authentication(format!(
                "login to {} failed: {}",
                credentials.registry,
                out.stderr_text()
            )));
        }
        tracing::info!(registry = %credentials.registry, "authenticated against registry");
        Ok(())
    }

    async fn create(&self, request: &ContainerRequest) -> Result<ContainerResult, ProvisionerError> {
        self.ensure_connection().await?;

        let out = self.invoke(run_args(request), None).await?;
        if !out.success() {
            return Err(ProvisionerError::Provision(format!(
                "run of {} failed: {}",
                request.image,
                out.stderr_text()
            )));
        }
        let id = mapper::parse_container_id(&out.stdout_text())?;

        let name = match &request.name {
            Some(name) => name.clone(),
            None => match self.inspect_name(&id).await {
                Ok(name) => name,
                Err(e) => {
                    self.discard(&id).await;
                    return Err(e);
                }
            },
        };

        tracing::info!(container_id = %id, name = %name, "container running");
        Ok(mapper::container_result(name, id))
    }

    async fn delete(&self, asset_id: &str) -> Result<(), ProvisionerError> {
        let out = self
            .invoke(strings(&["rm", "--force", asset_id]), None)
            .await?;
        if out.success() {
            tracing::info!(container_id = %asset_id, "container removed");
            return Ok(());
        }
        let stderr = out.stderr_text();
        if is_absent(&stderr) {
            Err(ProvisionerError::AlreadyDeleted(asset_id.to_string()))
        } else {
            Err(ProvisionerError::Deprovision(format!(
                "rm of {asset_id} failed: {stderr}"
            )))
        }
    }
}

/// Argument list for a detached `run`.
pub fn run_args(request: &ContainerRequest) -> Vec<String> {
    let mut args = strings(&["run", "--detach"]);

    if let Some(name) = &request.name {
        args.push("--name".into());
        args.push(name.clone());
    }
    args.push("--network".into());
    args.push(request.network_mode.clone());
    if request.tty {
        args.push("--tty".into());
    }
    if request.privileged {
        args.push("--privileged".into());
    }
    for pair in &request.env {
        args.push("--env".into());
        args.push(pair.clone());
    }
    for mount in &request.mounts {
        args.push("--mount".into());
        args.push(if mount.kind == "tmpfs" {
            format!("type=tmpfs,target={}", mount.target)
        } else {
            format!(
                "type={},source={},target={}",
                mount.kind, mount.source, mount.target
            )
        });
    }
    for volume in &request.volumes {
        args.push("--volume".into());
        args.push(volume.clone());
    }
    for port in &request.ports {
        args.push("--publish".into());
        args.push(port.publish_spec());
    }
    for cap in &request.cap_add {
        args.push("--cap-add".into());
        args.push(cap.clone());
    }
    for cap in &request.cap_drop {
        args.push("--cap-drop".into());
        args.push(cap.clone());
    }
    if let Some(entrypoint) = &request.entrypoint {
        args.push("--entrypoint".into());
        args.push(match entrypoint {
            Entrypoint::Command(cmd) => cmd.clone(),
            // JSON array form keeps multi-token entrypoints intact.
            Entrypoint::Tokens(tokens) => {
                serde_json::to_string(tokens).unwrap_or_else(|_| tokens.join(" "))
            }
        });
    }
    args.extend(request.additional_args.iter().cloned());
    args.push(request.image.clone());
    args
}

/// Connection destination with the remote user folded into an ssh URI.
fn remote_destination(remote: &RemoteTarget) -> String {
    match (&remote.user, remote.uri.strip_prefix("ssh://")) {
        (Some(user), Some(rest)) if !rest.contains('@') => format!("ssh://{user}@{rest}"),
        _ => remote.uri.clone(),
    }
}

/// Deterministic connection name covering the whole destination (user,
/// host, port and socket path) plus the identity file, e.g.
/// `podprov-core-10-0-0-5-22-run-podman-podman-sock`. Two sockets on one
/// host, or one socket reached with two keys, never share a name.
pub fn connection_name(remote: &RemoteTarget) -> String {
    let destination = remote_destination(remote);
    let mut target = destination
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(&destination)
        .to_string();
    if let Some(identity) = &remote.identity {
        target.push('/');
        target.push_str(&identity.display().to_string());
    }

    let mut slug = String::with_capacity(target.len());
    for c in target.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    format!("{CONNECTION_PREFIX}-{}", slug.trim_end_matches('-'))
}

fn is_absent(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no container with name or id")
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
