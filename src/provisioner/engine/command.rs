use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::provisioner::error::ProvisionerError;

/// Captured result of one executable invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs the engine executable. `ExecBackend` talks to the engine only
/// through this trait so tests can script the engine's answers.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ProvisionerError>;
}

/// `CommandRunner` backed by `tokio::process`. Blocks the calling task until
/// the child exits; no timeout is imposed.
pub struct ProcessRunner {
    /// Maximum bytes kept from each of stdout and stderr.
    pub max_output_bytes: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ProvisionerError> {
        tracing::debug!(program = %program.display(), args = ?args, "running engine command");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            ProvisionerError::Configuration(format!("failed to spawn {}: {e}", program.display()))
        })?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                // A child that exits before reading its input is judged by
                // its status and stderr below.
                let written = match pipe.write_all(input).await {
                    Ok(()) => pipe.shutdown().await,
                    Err(e) => Err(e),
                };
                match written {
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        tracing::debug!(program = %program.display(), "child closed stdin early");
                    }
                    other => other?,
                }
            }
        }

        let output = child.wait_with_output().await?;
        let mut stdout = output.stdout;
        let mut stderr = output.stderr;
        stdout.truncate(self.max_output_bytes);
        stderr.truncate(self.max_output_bytes);

        Ok(CommandOutput {
            code: output.status.code(),
            stdout,
            stderr,
        })
    }
}

/// Search `PATH` for `bin`.
pub fn which(bin: &str) -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full = dir.join(bin);
            if full.is_file() { Some(full) } else { None }
        })
    })
}

/// Resolve the engine executable: an explicit path must exist, otherwise
/// `name` is looked up on `PATH`.
pub fn resolve_executable(
    explicit: Option<&Path>,
    name: &str,
) -> Result<PathBuf, ProvisionerError> {
    match explicit {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => Err(ProvisionerError::Configuration(format!(
            "executable_path {} does not exist",
            path.display()
        ))),
        None => which(name).ok_or_else(|| {
            ProvisionerError::Configuration(format!("{name} executable not found on PATH"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn run_captures_stdout() {
        let out = ProcessRunner::default()
            .run(Path::new("echo"), &args(&["hello engine"]), None)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_text(), "hello engine");
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit_and_stderr() {
        let out = ProcessRunner::default()
            .run(Path::new("sh"), &args(&["-c", "echo oops >&2; exit 3"]), None)
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stderr_text(), "oops");
    }

    #[tokio::test]
    async fn run_pipes_stdin() {
        let out = ProcessRunner::default()
            .run(Path::new("cat"), &[], Some(b"s3cret"))
            .await
            .unwrap();
        assert_eq!(out.stdout_text(), "s3cret");
    }

    #[tokio::test]
    async fn unread_stdin_still_reports_child_stderr() {
        let input = vec![b'x'; 4 * 1024 * 1024];
        let out = ProcessRunner::default()
            .run(
                Path::new("sh"),
                &args(&["-c", "echo 'Error: login denied' >&2; exit 125"]),
                Some(&input),
            )
            .await
            .unwrap();
        assert_eq!(out.code, Some(125));
        assert_eq!(out.stderr_text(), "Error: login denied");
    }

    #[tokio::test]
    async fn run_truncates_output() {
        let runner = ProcessRunner {
            max_output_bytes: 4,
        };
        let out = runner
            .run(Path::new("echo"), &args(&["abcdefgh"]), None)
            .await
            .unwrap();
        assert_eq!(out.stdout, b"abcd");
    }

    #[tokio::test]
    async fn spawn_failure_is_configuration_error() {
        let err = ProcessRunner::default()
            .run(Path::new("/nonexistent/podman"), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionerError::Configuration(_)));
    }

    #[test]
    fn resolve_explicit_path_must_exist() {
        let err = resolve_executable(Some(Path::new("/nonexistent/podman")), "podman").unwrap_err();
        assert!(matches!(err, ProvisionerError::Configuration(_)));
    }

    #[test]
    fn resolve_explicit_existing_path() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = resolve_executable(Some(tmp.path()), "podman").unwrap();
        assert_eq!(path, tmp.path());
    }

    #[test]
    fn resolve_searches_path() {
        assert!(resolve_executable(None, "sh").is_ok());
        let err = resolve_executable(None, "definitely-not-an-engine-binary").unwrap_err();
        assert!(err.to_string().contains("not found on PATH"));
    }
}
