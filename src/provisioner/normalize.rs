//! Provider spec → backend-neutral container request.
//!
//! Everything here is a pure transform except [`ensure_mount_sources`],
//! which creates missing host directories for path-like mount sources.
//! Backends render a [`ContainerRequest`] into their own call shape.

use std::path::Path;

use super::error::{ProvisionerError, Violation};
use super::types::{Asset, Entrypoint, MountEntry, Ports, ProviderSpec, Scalar};

/// Default mount type for structured mounts without an explicit type.
pub const DEFAULT_MOUNT_TYPE: &str = "volume";

/// Mount types both backends can render.
pub const MOUNT_TYPES: [&str; 3] = ["bind", "volume", "tmpfs"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: String,
    pub protocol: Option<String>,
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

impl PortMapping {
    /// Engine API key form, `port/proto` with `tcp` as the default protocol.
    pub fn port_key(&self) -> String {
        format!(
            "{}/{}",
            self.container_port,
            self.protocol.as_deref().unwrap_or("tcp")
        )
    }

    /// Publish-flag form, `[ip:][host:]container[/proto]`.
    pub fn publish_spec(&self) -> String {
        let mut out = String::new();
        if let Some(ip) = &self.host_ip {
            out.push_str(ip);
            out.push(':');
            out.push_str(self.host_port.as_deref().unwrap_or(""));
            out.push(':');
        } else if let Some(port) = &self.host_port {
            out.push_str(port);
            out.push(':');
        }
        out.push_str(&self.container_port);
        if let Some(proto) = &self.protocol {
            out.push('/');
            out.push_str(proto);
        }
        out
    }
}

/// Normalized container request shared by both backends.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRequest {
    pub image: String,
    pub name: Option<String>,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    /// Raw `src:dest[:opts]` volume strings, passed to the engine verbatim.
    pub volumes: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub network_mode: String,
    pub privileged: bool,
    pub tty: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub entrypoint: Option<Entrypoint>,
    pub additional_args: Vec<String>,
}

impl ContainerRequest {
    pub fn from_spec(spec: &ProviderSpec, name: Option<String>) -> Result<Self, ProvisionerError> {
        let mut violations = Vec::new();

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| match parse_mount(entry) {
                Ok(m) => Some(m),
                Err(message) => {
                    violations.push(Violation::new(format!("provider.mounts[{i}]"), message));
                    None
                }
            })
            .collect();

        let ports = parse_ports(&spec.ports, &mut violations);

        if !violations.is_empty() {
            return Err(ProvisionerError::Validation(violations));
        }

        Ok(Self {
            image: spec.image.clone(),
            name,
            env: spec.environment.to_pairs(),
            mounts,
            volumes: spec.volumes.clone(),
            ports,
            network_mode: spec.network_mode.clone(),
            privileged: spec.privileged,
            tty: spec.tty,
            cap_add: spec.capabilities.add.clone(),
            cap_drop: spec.capabilities.drop.clone(),
            entrypoint: spec.entrypoint.clone(),
            additional_args: spec.additional_args.clone(),
        })
    }

    /// Host-side sources referenced by mounts and raw volumes.
    fn host_sources(&self) -> impl Iterator<Item = &str> {
        let mounts = self
            .mounts
            .iter()
            .filter(|m| m.kind != "tmpfs")
            .map(|m| m.source.as_str());
        let volumes = self
            .volumes
            .iter()
            .filter_map(|v| v.split_once(':').map(|(src, _)| src));
        mounts.chain(volumes)
    }
}

/// Build the request and create any missing path-like mount sources.
pub fn normalize(spec: &ProviderSpec, name: Option<String>) -> Result<ContainerRequest, ProvisionerError> {
    let request = ContainerRequest::from_spec(spec, name)?;
    ensure_mount_sources(&request)?;
    Ok(request)
}

/// Create host directories for path-like sources that do not exist yet.
/// Named volumes (no path separator) are left to the engine.
pub fn ensure_mount_sources(request: &ContainerRequest) -> Result<(), ProvisionerError> {
    for source in request.host_sources() {
        if !is_host_path(source) {
            continue;
        }
        let path = Path::new(source);
        if path.exists() {
            continue;
        }
        std::fs::create_dir_all(path).map_err(|e| {
            ProvisionerError::Provision(format!(
                "failed to create mount source {}: {e}",
                path.display()
            ))
        })?;
        tracing::info!(source = %path.display(), "created missing mount source");
    }
    Ok(())
}

fn is_host_path(source: &str) -> bool {
    Path::new(source).is_absolute() || source.starts_with("./") || source.starts_with("../")
}

/// Name handed to the engine API: spaces become hyphens; falls back to the
/// asset name when `container_name` is unset.
pub fn api_container_name(spec: &ProviderSpec, asset: &Asset) -> Option<String> {
    let requested = spec.container_name.as_deref().unwrap_or(&asset.name).trim();
    if requested.is_empty() {
        None
    } else {
        Some(requested.replace(' ', "-"))
    }
}

/// Name handed to the executable: the explicit `container_name`, verbatim.
pub fn exec_container_name(spec: &ProviderSpec) -> Option<String> {
    spec.container_name.clone().filter(|n| !n.is_empty())
}

fn parse_mount(entry: &MountEntry) -> Result<Mount, String> {
    let mount = match entry {
        MountEntry::Spec {
            source,
            target,
            kind,
        } => Mount {
            source: source.clone(),
            target: target.clone(),
            kind: kind.clone().unwrap_or_else(|| DEFAULT_MOUNT_TYPE.to_string()),
        },
        MountEntry::Short(raw) => {
            let parts: Vec<&str> = raw.split(':').collect();
            let (source, target, kind) = match parts.as_slice() {
                [source, target] => (*source, *target, DEFAULT_MOUNT_TYPE),
                [source, target, kind] => (*source, *target, *kind),
                _ => return Err(format!("expected source:target[:type], got {raw:?}")),
            };
            if source.is_empty() || target.is_empty() {
                return Err(format!("empty source or target in {raw:?}"));
            }
            Mount {
                source: source.to_string(),
                target: target.to_string(),
                kind: kind.to_string(),
            }
        }
    };
    if !MOUNT_TYPES.contains(&mount.kind.as_str()) {
        return Err(format!(
            "unsupported mount type {:?}; expected one of {}",
            mount.kind,
            MOUNT_TYPES.join(", ")
        ));
    }
    Ok(mount)
}

fn parse_ports(ports: &Ports, violations: &mut Vec<Violation>) -> Vec<PortMapping> {
    let mut out = Vec::new();
    match ports {
        Ports::Map(map) => {
            for (container, host) in map {
                let (container_port, protocol) = split_protocol(container);
                if container_port.is_empty() {
                    violations.push(Violation::new(
                        format!("provider.ports.{container}"),
                        "empty container port",
                    ));
                    continue;
                }
                let (host_ip, host_port) = match host {
                    Scalar::Str(s) => match s.rsplit_once(':') {
                        Some((ip, port)) => (Some(ip.to_string()), Some(port.to_string())),
                        None => (None, Some(s.clone())),
                    },
                    other => (None, Some(other.to_string())),
                };
                out.push(PortMapping {
                    container_port,
                    protocol,
                    host_ip,
                    host_port,
                });
            }
        }
        Ports::List(list) => {
            for (i, spec) in list.iter().enumerate() {
                match parse_publish_spec(spec) {
                    Some(port) => out.push(port),
                    None => violations.push(Violation::new(
                        format!("provider.ports[{i}]"),
                        format!("invalid publish spec {spec:?}"),
                    )),
                }
            }
        }
    }
    out
}

fn split_protocol(port: &str) -> (String, Option<String>) {
    match port.split_once('/') {
        Some((p, proto)) => (p.to_string(), Some(proto.to_string())),
        None => (port.to_string(), None),
    }
}

/// Parse `[[ip:]host:]container[/proto]`.
fn parse_publish_spec(spec: &str) -> Option<PortMapping> {
    let (rest, protocol) = split_protocol(spec);
    let parts: Vec<&str> = rest.split(':').collect();
    let (host_ip, host_port, container_port) = match parts.as_slice() {
        [container] => (None, None, *container),
        [host, container] => (None, Some(*host), *container),
        [ip, host, container] => (Some(*ip), Some(*host), *container),
        _ => return None,
    };
    if container_port.is_empty() {
        return None;
    }
    Some(PortMapping {
        container_port: container_port.to_string(),
        protocol,
        host_ip: host_ip.map(str::to_string),
        host_port: host_port.filter(|h| !h.is_empty()).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> ProviderSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn unset_network_mode_normalizes_to_bridge() {
        let req = ContainerRequest::from_spec(&spec("image: nginx"), None).unwrap();
        assert_eq!(req.network_mode, "bridge");
        assert!(req.tty);
        assert!(!req.privileged);
    }

    #[test]
    fn structured_mount_defaults_to_volume_type() {
        let req = ContainerRequest::from_spec(
            &spec("image: nginx\nmounts: [{source: data, target: /data}, \"/a:/b:bind\", \"c:/c\"]\n"),
            None,
        )
        .unwrap();
        assert_eq!(
            req.mounts,
            vec![
                Mount {
                    source: "data".into(),
                    target: "/data".into(),
                    kind: "volume".into()
                },
                Mount {
                    source: "/a".into(),
                    target: "/b".into(),
                    kind: "bind".into()
                },
                Mount {
                    source: "c".into(),
                    target: "/c".into(),
                    kind: "volume".into()
                },
            ]
        );
    }

    #[test]
    fn short_mount_without_target_is_a_validation_error() {
        let err = ContainerRequest::from_spec(&spec("image: nginx\nmounts: [\"/only\"]\n"), None)
            .unwrap_err();
        assert_eq!(err.violations()[0].path, "provider.mounts[0]");
    }

    #[test]
    fn short_mount_with_empty_target_is_rejected() {
        let err = ContainerRequest::from_spec(&spec("image: nginx\nmounts: [\"/a:\"]\n"), None)
            .unwrap_err();
        assert_eq!(err.violations()[0].path, "provider.mounts[0]");
    }

    #[test]
    fn short_mount_type_must_be_known() {
        let err = ContainerRequest::from_spec(&spec("image: nginx\nmounts: [\"/a:/b:nfs\"]\n"), None)
            .unwrap_err();
        assert!(err.violations()[0].message.contains("unsupported mount type"));
    }

    #[test]
    fn short_mount_with_extra_parts_is_rejected() {
        let err = ContainerRequest::from_spec(
            &spec("image: nginx\nmounts: [\"/a:/b:bind:extra\"]\n"),
            None,
        )
        .unwrap_err();
        assert_eq!(err.violations().len(), 1);
        assert_eq!(err.violations()[0].path, "provider.mounts[0]");
    }

    #[test]
    fn every_mount_and_port_violation_is_collected() {
        let err = ContainerRequest::from_spec(
            &spec("image: nginx\nmounts: [\"/a:\", \"/b:/b:nfs\"]\nports: [\"1:2:3:4\", \"80\", \"::\"]\n"),
            None,
        )
        .unwrap_err();
        let paths: Vec<_> = err.violations().iter().map(|v| v.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["provider.mounts[0]", "provider.mounts[1]", "provider.ports[0]", "provider.ports[2]"]
        );
    }

    #[test]
    fn raw_volumes_pass_through_verbatim() {
        let req = ContainerRequest::from_spec(
            &spec("image: nginx\nvolumes: [\"/srv:/srv:ro,Z\"]\n"),
            None,
        )
        .unwrap();
        assert_eq!(req.volumes, vec!["/srv:/srv:ro,Z"]);
    }

    #[test]
    fn capabilities_keep_order() {
        let req = ContainerRequest::from_spec(
            &spec("image: nginx\ncapabilities: {add: [NET_ADMIN, SYS_TIME], drop: [MKNOD, CHOWN]}\n"),
            None,
        )
        .unwrap();
        assert_eq!(req.cap_add, vec!["NET_ADMIN", "SYS_TIME"]);
        assert_eq!(req.cap_drop, vec!["MKNOD", "CHOWN"]);
    }

    #[test]
    fn additional_args_are_never_resplit() {
        let req = ContainerRequest::from_spec(
            &spec("image: nginx\nadditional_args: [\"--label\", \"note=two words\"]\n"),
            None,
        )
        .unwrap();
        assert_eq!(req.additional_args, vec!["--label", "note=two words"]);
    }

    #[test]
    fn port_mapping_form() {
        let req = ContainerRequest::from_spec(
            &spec("image: nginx\nports: {\"80/tcp\": 8080, \"53/udp\": \"127.0.0.1:5353\", \"443\": 8443}\n"),
            None,
        )
        .unwrap();
        assert_eq!(req.ports.len(), 3);
        let udp = req.ports.iter().find(|p| p.container_port == "53").unwrap();
        assert_eq!(udp.port_key(), "53/udp");
        assert_eq!(udp.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(udp.host_port.as_deref(), Some("5353"));
        assert_eq!(udp.publish_spec(), "127.0.0.1:5353:53/udp");
        let https = req.ports.iter().find(|p| p.container_port == "443").unwrap();
        assert_eq!(https.port_key(), "443/tcp");
        assert_eq!(https.publish_spec(), "8443:443");
    }

    #[test]
    fn port_list_form() {
        let req = ContainerRequest::from_spec(
            &spec("image: nginx\nports: [\"8080:80\", \"0.0.0.0:9000:9000/udp\", \"7000\"]\n"),
            None,
        )
        .unwrap();
        let specs: Vec<_> = req.ports.iter().map(PortMapping::publish_spec).collect();
        assert_eq!(specs, vec!["8080:80", "0.0.0.0:9000:9000/udp", "7000"]);
    }

    #[test]
    fn malformed_publish_spec_is_rejected() {
        let err = ContainerRequest::from_spec(&spec("image: nginx\nports: [\"1:2:3:4\"]\n"), None)
            .unwrap_err();
        assert_eq!(err.violations()[0].path, "provider.ports[0]");
    }

    #[test]
    fn api_name_replaces_spaces_and_falls_back_to_asset() {
        let asset = Asset::new("my web server");
        assert_eq!(
            api_container_name(&spec("image: nginx"), &asset).as_deref(),
            Some("my-web-server")
        );
        assert_eq!(
            api_container_name(&spec("image: nginx\ncontainer_name: db one\n"), &asset).as_deref(),
            Some("db-one")
        );
        assert_eq!(api_container_name(&spec("image: nginx"), &Asset::new("  ")), None);
    }

    #[test]
    fn exec_name_is_verbatim_or_absent() {
        assert_eq!(exec_container_name(&spec("image: nginx")), None);
        assert_eq!(
            exec_container_name(&spec("image: nginx\ncontainer_name: db one\n")).as_deref(),
            Some("db one")
        );
    }

    #[test]
    fn missing_mount_source_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("x").join("nested");
        let yaml = format!(
            "image: nginx\nmounts: [{{source: {}, target: /data}}]\n",
            source.display()
        );
        assert!(!source.exists());
        normalize(&spec(&yaml), None).unwrap();
        assert!(source.is_dir());
    }

    #[test]
    fn missing_volume_source_is_created_but_named_volumes_are_not() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("cache");
        let yaml = format!(
            "image: nginx\nvolumes: [\"{}:/cache:Z\", \"named:/named\"]\n",
            source.display()
        );
        normalize(&spec(&yaml), None).unwrap();
        assert!(source.is_dir());
        assert!(!Path::new("named").exists());
    }
}
