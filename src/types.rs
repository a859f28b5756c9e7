//! Core data types used throughout Graphform.
//!
//! This module defines the resource description consumed by the graph
//! builder:
//! - Variables, providers, resources and outputs of one module scope
//! - Nested module calls carrying an inline child description
//! - Output format selectors for reports and graph exports

use crate::error::{Result, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Attribute map of a resource, provider block or instance snapshot.
///
/// Ordered so diffs, plans and exports are deterministic.
pub type Attributes = BTreeMap<String, Value>;

/// Placeholder for a value that is only known once applied.
pub const UNKNOWN: &str = "<computed>";

/// Returns an unknown value.
#[must_use]
pub fn unknown() -> Value {
    Value::String(UNKNOWN.to_string())
}

/// Whether the value is the unknown placeholder.
#[must_use]
pub fn is_unknown(value: &Value) -> bool {
    matches!(value, Value::String(s) if s == UNKNOWN)
}

/// Whether the value or anything nested in it is unknown.
#[must_use]
pub fn contains_unknown(value: &Value) -> bool {
    match value {
        Value::String(s) => s == UNKNOWN,
        Value::Array(items) => items.iter().any(contains_unknown),
        Value::Object(map) => map.values().any(contains_unknown),
        _ => false,
    }
}

/// Declarative description of one module scope.
///
/// # Example YAML
///
/// ```yaml
/// variables:
///   - name: size
///     default: 2
/// resources:
///   - type: null_resource
///     name: web
///     count: ${var.size}
///     config:
///       inputs:
///         index: ${count.index}
/// outputs:
///   - name: ids
///     value: ${null_resource.web.*.id}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Description {
    /// Input variables
    pub variables: Vec<VariableDecl>,
    /// Provider blocks
    pub providers: Vec<ProviderDecl>,
    /// Managed resources
    pub resources: Vec<ResourceDecl>,
    /// Output values
    pub outputs: Vec<OutputDecl>,
    /// Nested module calls
    pub modules: Vec<ModuleDecl>,
}

impl Description {
    /// Parse a description from YAML (JSON is accepted as well).
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| {
            crate::err!(ConfigParse {
                message: format!("invalid resource description: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }

    /// Load a description file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        tracing::debug!(path = %path.display(), "Loaded resource description");
        Self::from_yaml(&content)
    }

    /// Find a variable declaration.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&VariableDecl> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Find a module call.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&ModuleDecl> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Whether the scope declares an output.
    #[must_use]
    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o.name == name)
    }

    /// Every declared `TYPE.NAME`, module-qualified, mapped to whether it
    /// sets `count`.
    #[must_use]
    pub fn resource_addresses(&self) -> BTreeMap<String, bool> {
        let mut addresses = BTreeMap::new();
        self.collect_addresses("", &mut addresses);
        addresses
    }

    fn collect_addresses(&self, prefix: &str, addresses: &mut BTreeMap<String, bool>) {
        for resource in &self.resources {
            addresses.insert(format!("{prefix}{}", resource.key()), resource.count.is_some());
        }
        for module in &self.modules {
            module
                .source
                .collect_addresses(&format!("{prefix}module.{}.", module.name), addresses);
        }
    }
}

/// An input variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    /// Variable name
    pub name: String,
    /// Default value used when none is supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A provider block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDecl {
    /// Provider type name (e.g. "null")
    pub name: String,
    /// Provider configuration
    #[serde(default)]
    pub config: Attributes,
}

/// A managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Resource type (e.g. "null_resource")
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource name, unique per type within the scope
    pub name: String,
    /// Explicit provider name; inferred from the type prefix otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Number of instances: a literal or a `${var.x}` reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<Value>,
    /// Desired configuration
    #[serde(default)]
    pub config: Attributes,
    /// Explicit dependencies (`TYPE.NAME`, `module.M`, `var.X`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ResourceDecl {
    /// The resource's `TYPE.NAME` key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }

    /// The provider name this resource uses.
    #[must_use]
    pub fn provider_name(&self) -> String {
        self.provider
            .clone()
            .unwrap_or_else(|| provider_for_type(&self.resource_type).to_string())
    }
}

/// Provider name implied by a resource type: `aws_instance` -> `aws`.
#[must_use]
pub fn provider_for_type(resource_type: &str) -> &str {
    resource_type
        .split_once('_')
        .map_or(resource_type, |(prefix, _)| prefix)
}

/// An output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDecl {
    /// Output name
    pub name: String,
    /// Output expression
    pub value: Value,
}

/// A nested module call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDecl {
    /// Module name
    pub name: String,
    /// The child scope
    pub source: Description,
    /// Values for the child's variables, evaluated in the calling scope
    #[serde(default)]
    pub inputs: Attributes,
}

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum ReportFormat {
    /// Plain text format
    #[default]
    Text,
    /// JSON format
    Json,
}

/// Graph output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum GraphFormat {
    /// DOT format (Graphviz)
    #[default]
    Dot,
    /// JSON format
    Json,
    /// Mermaid diagram format
    Mermaid,
}

/// Parse `KEY=VALUE` pairs into variable values.
///
/// Values are read as YAML scalars so `count=3` yields a number.
pub fn parse_variable_assignments(pairs: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut variables = BTreeMap::new();
    for pair in pairs {
        let (key, raw) = pair.split_once('=').ok_or_else(|| {
            crate::err!(ConfigValue {
                key: pair.clone(),
                message: "expected KEY=VALUE".to_string(),
            })
        })?;
        let value = match serde_yaml::from_str::<Value>(raw) {
            Ok(Value::Null) | Err(_) => Value::String(raw.to_string()),
            Ok(v) => v,
        };
        variables.insert(key.trim().to_string(), value);
    }
    Ok(variables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_for_type() {
        assert_eq!(provider_for_type("aws_instance"), "aws");
        assert_eq!(provider_for_type("null_resource"), "null");
        assert_eq!(provider_for_type("plain"), "plain");
    }

    #[test]
    fn test_description_from_yaml() {
        let yaml = r#"
variables:
  - name: size
    default: 2
resources:
  - type: null_resource
    name: web
    count: ${var.size}
    config:
      triggers:
        a: "1"
    depends_on: [null_resource.base]
  - type: null_resource
    name: base
outputs:
  - name: ids
    value: ${null_resource.web.*.id}
modules:
  - name: child
    source:
      resources:
        - type: null_resource
          name: inner
    inputs:
      x: ${var.size}
"#;
        let desc = Description::from_yaml(yaml).unwrap();
        assert_eq!(desc.resources.len(), 2);
        assert_eq!(desc.resources[0].key(), "null_resource.web");
        assert_eq!(desc.resources[0].count, Some(json!("${var.size}")));
        assert_eq!(desc.resources[0].provider_name(), "null");
        assert_eq!(desc.variable("size").unwrap().default, Some(json!(2)));
        assert!(desc.has_output("ids"));
        assert_eq!(desc.module("child").unwrap().source.resources.len(), 1);
    }

    #[test]
    fn test_resource_addresses_include_modules() {
        let description = Description::from_yaml(
            r#"
resources:
  - type: null_resource
    name: web
    count: 2
modules:
  - name: net
    source:
      resources:
        - type: null_resource
          name: vpc
"#,
        )
        .unwrap();

        let addresses = description.resource_addresses();
        assert_eq!(addresses.get("null_resource.web"), Some(&true));
        assert_eq!(addresses.get("module.net.null_resource.vpc"), Some(&false));
        assert_eq!(addresses.len(), 2);
    }

    #[test]
    fn test_unknown_detection() {
        assert!(is_unknown(&unknown()));
        assert!(contains_unknown(&json!({"a": [1, UNKNOWN]})));
        assert!(!contains_unknown(&json!({"a": [1, 2]})));
    }

    #[test]
    fn test_parse_variable_assignments() {
        let vars = parse_variable_assignments(&[
            "count=3".to_string(),
            "name=web".to_string(),
            "empty=".to_string(),
        ])
        .unwrap();
        assert_eq!(vars["count"], json!(3));
        assert_eq!(vars["name"], json!("web"));
        assert_eq!(vars["empty"], json!(""));
        assert!(parse_variable_assignments(&["novalue".to_string()]).is_err());
    }
}
