use std::fmt;
use std::io;

use super::types::AssetState;

/// A single schema rule that a provider spec failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the offending field, e.g. `provider.volumes`.
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from provisioner operations.
///
/// Backends map engine and subprocess failures into these variants.
/// `AlreadyDeleted` is the single classification for removing a
/// container the engine no longer knows about, on both backends.
#[derive(thiserror::Error, Debug)]
pub enum ProvisionerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("validation failed: {}", join_violations(.0))]
    Validation(Vec<Violation>),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("provision failed: {0}")]
    Provision(String),

    #[error("deprovision failed: {0}")]
    Deprovision(String),

    #[error("container already deleted: {0}")]
    AlreadyDeleted(String),

    #[error("unexpected backend output: {0}")]
    BackendProtocol(String),

    #[error("{operation} not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: AssetState,
    },

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl ProvisionerError {
    /// Violations carried by a `Validation` error, empty for every other variant.
    pub fn violations(&self) -> &[Violation] {
        match self {
            ProvisionerError::Validation(v) => v,
            _ => &[],
        }
    }
}
