//! Schema checking for provider parameters.
//!
//! The schema document is a small kwalify-style rule tree (`schema.yml`).
//! Custom predicates are registered by name and referenced from rules via
//! `func:`; a predicate returning `true` flags the value as invalid.
//! Validation never stops at the first problem: every violation is collected.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_yaml::Value;

use super::error::{ProvisionerError, Violation};

/// Embedded provider schema.
pub const PROVIDER_SCHEMA: &str = include_str!("schema.yml");

/// Custom predicate. Returns `true` when the value violates the rule.
pub type Predicate = fn(&Value) -> bool;

/// Flags a volume list when any string entry, split on `:`, has fewer than
/// two parts. Map entries are left to the schema's own `mapping` rules.
pub fn valid_volume_path(value: &Value) -> bool {
    match value {
        Value::Sequence(entries) => entries
            .iter()
            .filter_map(Value::as_str)
            .any(|entry| entry.split(':').count() < 2),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Kind {
    Str,
    Int,
    Float,
    Bool,
    Scalar,
    Map,
    Seq,
    Any,
}

impl Kind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Kind::Str => value.is_string(),
            Kind::Int => value.is_i64() || value.is_u64(),
            Kind::Float => value.is_number(),
            Kind::Bool => value.is_bool(),
            Kind::Scalar => value.is_string() || value.is_number() || value.is_bool(),
            Kind::Map => value.is_mapping(),
            Kind::Seq => value.is_sequence(),
            Kind::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Kind::Str => "str",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::Bool => "bool",
            Kind::Scalar => "scalar",
            Kind::Map => "map",
            Kind::Seq => "seq",
            Kind::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum KindSpec {
    One(Kind),
    Many(Vec<Kind>),
}

impl Default for KindSpec {
    fn default() -> Self {
        KindSpec::One(Kind::Any)
    }
}

impl KindSpec {
    fn kinds(&self) -> &[Kind] {
        match self {
            KindSpec::One(k) => std::slice::from_ref(k),
            KindSpec::Many(ks) => ks,
        }
    }

    fn describe(&self) -> String {
        self.kinds()
            .iter()
            .map(|k| k.name())
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Rule {
    #[serde(rename = "type", default)]
    kind: KindSpec,
    #[serde(default)]
    required: bool,
    #[serde(rename = "enum", default)]
    allowed: Option<Vec<String>>,
    #[serde(default)]
    func: Option<String>,
    #[serde(default)]
    mapping: Option<BTreeMap<String, Rule>>,
    #[serde(default)]
    sequence: Option<Vec<Rule>>,
}

/// Rule tree plus the predicates it may reference.
pub struct SchemaValidator {
    root: Rule,
    predicates: BTreeMap<String, Predicate>,
}

impl SchemaValidator {
    pub fn from_yaml(document: &str) -> Result<Self, ProvisionerError> {
        let root: Rule = serde_yaml::from_str(document)
            .map_err(|e| ProvisionerError::Configuration(format!("invalid schema document: {e}")))?;
        Ok(Self {
            root,
            predicates: BTreeMap::new(),
        })
    }

    /// The provider schema with its custom predicates registered.
    pub fn provider() -> Result<Self, ProvisionerError> {
        Ok(Self::from_yaml(PROVIDER_SCHEMA)?.with_predicate("valid_volume_path", valid_volume_path))
    }

    pub fn with_predicate(mut self, name: &str, predicate: Predicate) -> Self {
        self.predicates.insert(name.to_string(), predicate);
        self
    }

    /// Check `value` against the schema. `Err(Validation)` lists every violation.
    /// An absent (null) document is checked as an empty mapping so its
    /// required fields are reported individually.
    pub fn validate(&self, value: &Value, root_path: &str) -> Result<(), ProvisionerError> {
        let empty = Value::Mapping(Default::default());
        let value = if value.is_null() { &empty } else { value };

        let mut violations = Vec::new();
        self.check(&self.root, value, root_path, &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ProvisionerError::Validation(violations))
        }
    }

    fn check(&self, rule: &Rule, value: &Value, path: &str, out: &mut Vec<Violation>) {
        if value.is_null() {
            if rule.required {
                out.push(Violation::new(path, "required field missing"));
            }
            return;
        }

        if !rule.kind.kinds().iter().any(|k| k.matches(value)) {
            out.push(Violation::new(
                path,
                format!("expected {}", rule.kind.describe()),
            ));
            return;
        }

        if let Some(allowed) = &rule.allowed {
            let ok = value
                .as_str()
                .is_some_and(|s| allowed.iter().any(|a| a == s));
            if !ok {
                out.push(Violation::new(
                    path,
                    format!("must be one of: {}", allowed.join(", ")),
                ));
            }
        }

        if let Some(name) = &rule.func {
            match self.predicates.get(name) {
                Some(predicate) if predicate(value) => {
                    out.push(Violation::new(path, format!("{name} flagged value")));
                }
                Some(_) => {}
                None => out.push(Violation::new(path, format!("unknown predicate {name}"))),
            }
        }

        match value {
            Value::Mapping(map) => {
                if let Some(fields) = &rule.mapping {
                    self.check_mapping(fields, map, path, out);
                }
            }
            Value::Sequence(items) => {
                if let Some(item_rule) = rule.sequence.as_ref().and_then(|s| s.first()) {
                    for (i, item) in items.iter().enumerate() {
                        self.check(item_rule, item, &format!("{path}[{i}]"), out);
                    }
                }
            }
            _ => {}
        }
    }

    fn check_mapping(
        &self,
        fields: &BTreeMap<String, Rule>,
        map: &serde_yaml::Mapping,
        path: &str,
        out: &mut Vec<Violation>,
    ) {
        for key in map.keys() {
            let Some(key) = key.as_str() else {
                out.push(Violation::new(path, format!("non-string key {key:?}")));
                continue;
            };
            if !fields.contains_key(key) {
                out.push(Violation::new(format!("{path}.{key}"), "unknown field"));
            }
        }

        for (key, field_rule) in fields {
            let child = map.get(key.as_str()).unwrap_or(&Value::Null);
            self.check(field_rule, child, &format!("{path}.{key}"), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    fn violations(params: &str) -> Vec<Violation> {
        match SchemaValidator::provider()
            .unwrap()
            .validate(&yaml(params), "provider")
        {
            Ok(()) => vec![],
            Err(e) => e.violations().to_vec(),
        }
    }

    #[test]
    fn volume_predicate_polarity() {
        assert!(!valid_volume_path(&yaml("[\"a:b\"]")));
        assert!(valid_volume_path(&yaml("[\"a\"]")));
        assert!(valid_volume_path(&yaml("[\"a:b\", \"c\"]")));
        assert!(!valid_volume_path(&yaml("[\"/src:/dst:ro\"]")));
        assert!(!valid_volume_path(&yaml("[]")));
    }

    #[test]
    fn volume_predicate_skips_map_entries() {
        assert!(!valid_volume_path(&yaml("[{source: /a, target: /b}]")));
    }

    #[test]
    fn minimal_spec_is_valid() {
        assert!(violations("image: nginx").is_empty());
    }

    #[test]
    fn full_spec_is_valid() {
        let params = r#"
image: quay.io/podman/hello
container_name: hello world
environment: {PORT: 8080}
mounts:
  - source: /tmp/data
    target: /data
    type: bind
  - /tmp/logs:/logs
volumes: ["/tmp/cache:/cache:Z"]
ports: {"80/tcp": 8080}
network_mode: host
privileged: true
tty: false
capabilities: {add: [NET_ADMIN], drop: [MKNOD]}
entrypoint: ["/bin/sh", "-c"]
additional_args: ["--memory", "512m"]
remote: {user: core, identity: /home/core/.ssh/id_ed25519, uri: "ssh://host/run/podman/podman.sock"}
backend: exec
remove: false
"#;
        assert_eq!(violations(params), vec![]);
    }

    #[test]
    fn absent_document_reports_required_fields() {
        let v = violations("~");
        assert_eq!(v, vec![Violation::new("provider.image", "required field missing")]);
    }

    #[test]
    fn missing_image_is_reported() {
        let v = violations("container_name: web");
        assert_eq!(v, vec![Violation::new("provider.image", "required field missing")]);
    }

    #[test]
    fn short_volume_entry_is_reported() {
        let v = violations("image: nginx\nvolumes: [\"/data\"]\n");
        assert_eq!(
            v,
            vec![Violation::new(
                "provider.volumes",
                "valid_volume_path flagged value"
            )]
        );
    }

    #[test]
    fn every_violation_is_collected() {
        let v = violations(
            "tty: yes-please\nvolumes: [\"x\"]\nbackend: docker\nmounts: [{target: /d}]\nextra: 1\n",
        );
        let paths: Vec<_> = v.iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"provider.image"));
        assert!(paths.contains(&"provider.tty"));
        assert!(paths.contains(&"provider.volumes"));
        assert!(paths.contains(&"provider.backend"));
        assert!(paths.contains(&"provider.mounts[0].source"));
        assert!(paths.contains(&"provider.extra"));
        assert_eq!(v.len(), 6);
    }

    #[test]
    fn mount_type_must_be_known() {
        let v = violations("image: nginx\nmounts: [{source: /a, target: /b, type: nfs}]\n");
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].path, "provider.mounts[0].type");
    }

    #[test]
    fn null_optional_field_is_accepted() {
        assert!(violations("image: nginx\ncontainer_name: ~\n").is_empty());
    }

    #[test]
    fn non_mapping_root_is_rejected() {
        let v = violations("- image");
        assert_eq!(v, vec![Violation::new("provider", "expected map")]);
    }

    #[test]
    fn unknown_predicate_is_reported() {
        let validator = SchemaValidator::from_yaml("type: seq\nfunc: nope\n").unwrap();
        let err = validator.validate(&yaml("[]"), "root").unwrap_err();
        assert_eq!(err.violations()[0].message, "unknown predicate nope");
    }

    #[test]
    fn custom_predicate_can_be_registered() {
        fn non_empty(v: &Value) -> bool {
            v.as_sequence().is_some_and(|s| s.is_empty())
        }
        let validator = SchemaValidator::from_yaml("type: seq\nfunc: non_empty\n")
            .unwrap()
            .with_predicate("non_empty", non_empty);
        assert!(validator.validate(&yaml("[1]"), "root").is_ok());
        assert!(validator.validate(&yaml("[]"), "root").is_err());
    }
}
