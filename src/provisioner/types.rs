use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Structured engine API over a persistent connection.
    Api,
    /// Engine executable invoked once per operation.
    Exec,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Api => f.write_str("api"),
            BackendKind::Exec => f.write_str("exec"),
        }
    }
}

// ── Asset identity / lifecycle ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    Unvalidated,
    Validated,
    Created,
    Deleted,
}

/// Orchestrator-owned asset. The driver reads `name` and writes
/// `asset_id` once a container exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

impl Asset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            asset_id: None,
        }
    }
}

/// Record returned from `create`. `ip` carries the container name since
/// no network identity lookup is performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResult {
    pub name: String,
    pub ip: String,
    pub asset_id: String,
}

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub registry: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("registry", &self.registry)
            .finish()
    }
}

// ── Provider spec (input to validate/create) ────────────────────────

/// Scalar YAML value accepted where the engine ultimately wants a string
/// (`PORT: 8080` in an environment mapping, `8080/tcp: 80` in ports).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Str(s) => f.write_str(s),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    Map(BTreeMap<String, Scalar>),
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::List(Vec::new())
    }
}

impl Environment {
    /// Flatten into `KEY=VALUE` entries. Mapping entries come out in key order.
    pub fn to_pairs(&self) -> Vec<String> {
        match self {
            Environment::Map(map) => map.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            Environment::List(list) => list.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MountEntry {
    Spec {
        source: String,
        target: String,
        #[serde(rename = "type", default)]
        kind: Option<String>,
    },
    Short(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Ports {
    /// `container_port[/proto] -> host_port | "ip:host_port"`
    Map(BTreeMap<String, Scalar>),
    /// Publish specs, `[ip:]host:container[/proto]`.
    List(Vec<String>),
}

impl Default for Ports {
    fn default() -> Self {
        Ports::List(Vec::new())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub drop: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Entrypoint {
    Command(String),
    Tokens(Vec<String>),
}

/// Remote engine reached through the executable's connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteTarget {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identity: Option<PathBuf>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderSpec {
    pub image: String,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub ports: Ports,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default = "default_tty")]
    pub tty: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub entrypoint: Option<Entrypoint>,
    /// Passthrough tokens; each element is one argv entry and is never re-split.
    #[serde(default)]
    pub additional_args: Vec<String>,
    #[serde(default)]
    pub remote: Option<RemoteTarget>,
    #[serde(default)]
    pub executable_path: Option<PathBuf>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(default = "default_remove")]
    pub remove: bool,
}

fn default_network_mode() -> String {
    "bridge".to_string()
}

fn default_tty() -> bool {
    true
}

fn default_remove() -> bool {
    true
}

impl ProviderSpec {
    pub fn from_value(value: serde_yaml::Value) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_value(value)
    }
}

/// The subset of provider parameters needed before validation runs:
/// where the backend lives and whether `delete` removes anything.
/// Unknown keys are ignored here; the schema reports them.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverParams {
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub executable_path: Option<PathBuf>,
    #[serde(default)]
    pub remote: Option<RemoteTarget>,
    #[serde(default = "default_remove")]
    pub remove: bool,
}

impl Default for DriverParams {
    fn default() -> Self {
        Self {
            backend: None,
            uri: None,
            executable_path: None,
            remote: None,
            remove: true,
        }
    }
}
