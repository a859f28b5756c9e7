//! Vertex kinds and the capabilities the walk stages dispatch through.
//!
//! Each vertex is a closed [`VertexKind`] variant. The walk callbacks never
//! match on the kind; they ask for a capability (`as_diffable`,
//! `as_value_source`, ...) and act only on what the vertex offers.

use crate::error::Result;
use crate::reference::references_in;
use crate::types::{Attributes, Description};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    /// Unique name within the graph
    pub name: String,
    /// What the vertex stands for
    pub kind: VertexKind,
}

/// The closed set of vertex kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VertexKind {
    /// A counted resource collecting its instances
    Resource(ResourceVertex),
    /// One concrete resource instance
    ResourceInstance(InstanceVertex),
    /// A configured provider
    Provider(ProviderVertex),
    /// An input variable
    Variable(VariableVertex),
    /// An output value
    Output(OutputVertex),
    /// A module call awaiting flattening
    Module(ModuleVertex),
    /// Synthetic vertices added by transforms
    Meta(MetaVertex),
}

/// Aggregate over the instances of a counted resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceVertex {
    pub resource_type: String,
    pub count: usize,
    /// Instance vertex names, by index
    pub instances: Vec<String>,
}

/// A resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceVertex {
    pub resource_type: String,
    /// Provider vertex name
    pub provider: String,
    /// Desired configuration; `None` for orphans
    pub config: Option<Attributes>,
    pub count_index: Option<usize>,
    /// Qualified explicit dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Module prefix used to qualify references
    #[serde(default)]
    pub prefix: String,
}

/// A provider instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderVertex {
    pub provider_type: String,
    pub config: Attributes,
    #[serde(default)]
    pub prefix: String,
}

/// An input variable. `value` is the supplied value, the default, or for
/// module variables the input expression from the calling scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableVertex {
    pub value: Value,
    /// Prefix used to qualify references in `value`
    #[serde(default)]
    pub ref_prefix: String,
}

/// An output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputVertex {
    /// Output name without module prefix
    pub output: String,
    pub value: Value,
    #[serde(default)]
    pub prefix: String,
}

/// Scope information a module call needs from its caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeInfo {
    /// Module prefix of the calling scope
    pub prefix: String,
    /// Provider name to provider vertex name
    pub providers: BTreeMap<String, String>,
    /// Values known at build time, for resolving `count`
    pub static_variables: BTreeMap<String, Value>,
}

/// A module call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleVertex {
    pub module: String,
    pub source: Description,
    pub inputs: Attributes,
    pub caller: ScopeInfo,
}

/// Synthetic vertices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "meta", rename_all = "snake_case")]
pub enum MetaVertex {
    /// Single completion point of a walk
    Root,
    /// Destroy half of an instance
    Destroy(DestroyVertex),
    /// Barrier with no behavior of its own
    Ordering,
}

/// Destroy half of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroyVertex {
    pub address: String,
    pub resource_type: String,
    pub provider: String,
}

// =============================================================================
// Capabilities
// =============================================================================

/// A vertex whose configuration references other vertices.
pub trait Referencer {
    /// Qualified names of the vertices this vertex depends on.
    fn references(&self) -> Result<Vec<String>>;
}

/// What a [`ValueSource`] publishes.
#[derive(Debug)]
pub enum ValueExpr<'a> {
    /// An expression evaluated in the scope named by `prefix`
    Expression { value: &'a Value, prefix: &'a str },
    /// A list of the values published by these vertices
    Collect(&'a [String]),
}

/// A vertex that publishes a value for its dependents.
pub trait ValueSource {
    fn value_expr(&self) -> ValueExpr<'_>;

    /// Name under which the value is recorded in state outputs, if any.
    fn state_output(&self) -> Option<&str> {
        None
    }
}

/// A vertex that configures a provider instance.
pub trait ProviderSetup {
    fn provider_type(&self) -> &str;
    fn config(&self) -> &Attributes;
    fn prefix(&self) -> &str;
}

/// A vertex that produces an instance diff.
pub trait Diffable {
    fn address(&self) -> &str;
    fn resource_type(&self) -> &str;
    /// Provider vertex name
    fn provider(&self) -> &str;
    /// Desired configuration, or `None` for an orphan
    fn config(&self) -> Option<&Attributes>;
    fn count_index(&self) -> Option<usize>;
    fn prefix(&self) -> &str;
}

/// A vertex that performs provider operations during apply.
pub trait Applyable {
    fn address(&self) -> &str;
    fn resource_type(&self) -> &str;
    fn provider(&self) -> &str;
    /// Whether this vertex performs the destroy half of its instance
    fn is_destroy(&self) -> bool;
}

/// A vertex that may be removed when left unused.
pub trait Prunable {
    fn should_prune(&self, dependents: usize, dependencies: usize) -> bool;
}

/// Names an instance plus the capabilities available on it.
struct InstanceView<'a> {
    name: &'a str,
    inner: &'a InstanceVertex,
}

impl Diffable for InstanceView<'_> {
    fn address(&self) -> &str {
        self.name
    }
    fn resource_type(&self) -> &str {
        &self.inner.resource_type
    }
    fn provider(&self) -> &str {
        &self.inner.provider
    }
    fn config(&self) -> Option<&Attributes> {
        self.inner.config.as_ref()
    }
    fn count_index(&self) -> Option<usize> {
        self.inner.count_index
    }
    fn prefix(&self) -> &str {
        &self.inner.prefix
    }
}

impl Applyable for InstanceView<'_> {
    fn address(&self) -> &str {
        self.name
    }
    fn resource_type(&self) -> &str {
        &self.inner.resource_type
    }
    fn provider(&self) -> &str {
        &self.inner.provider
    }
    fn is_destroy(&self) -> bool {
        false
    }
}

impl Referencer for InstanceVertex {
    fn references(&self) -> Result<Vec<String>> {
        let mut names = match &self.config {
            Some(config) => qualified_references(config.values(), &self.prefix)?,
            None => Vec::new(),
        };
        for name in &self.depends_on {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        Ok(names)
    }
}

impl Applyable for DestroyVertex {
    fn address(&self) -> &str {
        &self.address
    }
    fn resource_type(&self) -> &str {
        &self.resource_type
    }
    fn provider(&self) -> &str {
        &self.provider
    }
    fn is_destroy(&self) -> bool {
        true
    }
}

impl ProviderSetup for ProviderVertex {
    fn provider_type(&self) -> &str {
        &self.provider_type
    }
    fn config(&self) -> &Attributes {
        &self.config
    }
    fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Referencer for ProviderVertex {
    fn references(&self) -> Result<Vec<String>> {
        qualified_references(self.config.values(), &self.prefix)
    }
}

impl ValueSource for VariableVertex {
    fn value_expr(&self) -> ValueExpr<'_> {
        ValueExpr::Expression { value: &self.value, prefix: &self.ref_prefix }
    }
}

impl Referencer for VariableVertex {
    fn references(&self) -> Result<Vec<String>> {
        qualified_references(std::iter::once(&self.value), &self.ref_prefix)
    }
}

impl ValueSource for OutputVertex {
    fn value_expr(&self) -> ValueExpr<'_> {
        ValueExpr::Expression { value: &self.value, prefix: &self.prefix }
    }

    fn state_output(&self) -> Option<&str> {
        self.prefix.is_empty().then_some(self.output.as_str())
    }
}

impl Referencer for OutputVertex {
    fn references(&self) -> Result<Vec<String>> {
        qualified_references(std::iter::once(&self.value), &self.prefix)
    }
}

impl ValueSource for ResourceVertex {
    fn value_expr(&self) -> ValueExpr<'_> {
        ValueExpr::Collect(&self.instances)
    }
}

impl Referencer for ResourceVertex {
    fn references(&self) -> Result<Vec<String>> {
        Ok(self.instances.clone())
    }
}

impl Prunable for ResourceVertex {
    fn should_prune(&self, dependents: usize, dependencies: usize) -> bool {
        self.count == 0 && dependents == 0 && dependencies == 0
    }
}

impl Referencer for ModuleVertex {
    fn references(&self) -> Result<Vec<String>> {
        qualified_references(self.inputs.values(), &self.caller.prefix)
    }
}

struct OrderingView;

impl Prunable for OrderingView {
    fn should_prune(&self, dependents: usize, _dependencies: usize) -> bool {
        dependents == 0
    }
}

static ORDERING: OrderingView = OrderingView;

/// Qualified vertex names referenced from a set of values.
///
/// Module outputs are listed by their output vertex name; callers fall back
/// to the module call vertex while the module is not yet flattened.
pub(crate) fn qualified_references<'a>(
    values: impl IntoIterator<Item = &'a Value>,
    prefix: &str,
) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for value in values {
        for reference in references_in(value)? {
            if let Some(name) = reference.vertex_name(prefix) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    Ok(names)
}

impl Vertex {
    /// Create a vertex.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: VertexKind) -> Self {
        Self { name: name.into(), kind }
    }

    /// The `root` meta-vertex.
    #[must_use]
    pub fn root() -> Self {
        Self::new(ROOT_VERTEX, VertexKind::Meta(MetaVertex::Root))
    }

    /// Short label for the kind, used in exports and reports.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match &self.kind {
            VertexKind::Resource(_) => "resource",
            VertexKind::ResourceInstance(_) => "instance",
            VertexKind::Provider(_) => "provider",
            VertexKind::Variable(_) => "variable",
            VertexKind::Output(_) => "output",
            VertexKind::Module(_) => "module",
            VertexKind::Meta(MetaVertex::Root) => "root",
            VertexKind::Meta(MetaVertex::Destroy(_)) => "destroy",
            VertexKind::Meta(MetaVertex::Ordering) => "ordering",
        }
    }

    /// References this vertex makes, if it can make any.
    pub fn references(&self) -> Result<Vec<String>> {
        match self.as_referencer() {
            Some(r) => r.references(),
            None => Ok(Vec::new()),
        }
    }

    /// Referencer capability.
    #[must_use]
    pub fn as_referencer(&self) -> Option<&dyn Referencer> {
        match &self.kind {
            VertexKind::ResourceInstance(v) => Some(v),
            VertexKind::Resource(v) => Some(v),
            VertexKind::Provider(v) => Some(v),
            VertexKind::Variable(v) => Some(v),
            VertexKind::Output(v) => Some(v),
            VertexKind::Module(v) => Some(v),
            VertexKind::Meta(_) => None,
        }
    }

    /// Value source capability.
    #[must_use]
    pub fn as_value_source(&self) -> Option<&dyn ValueSource> {
        match &self.kind {
            VertexKind::Variable(v) => Some(v),
            VertexKind::Output(v) => Some(v),
            VertexKind::Resource(v) => Some(v),
            _ => None,
        }
    }

    /// Provider setup capability.
    #[must_use]
    pub fn as_provider_setup(&self) -> Option<&dyn ProviderSetup> {
        match &self.kind {
            VertexKind::Provider(v) => Some(v),
            _ => None,
        }
    }

    /// Diff capability.
    #[must_use]
    pub fn as_diffable(&self) -> Option<Box<dyn Diffable + '_>> {
        match &self.kind {
            VertexKind::ResourceInstance(inner) => {
                Some(Box::new(InstanceView { name: &self.name, inner }))
            }
            _ => None,
        }
    }

    /// Apply capability.
    #[must_use]
    pub fn as_applyable(&self) -> Option<Box<dyn Applyable + '_>> {
        match &self.kind {
            VertexKind::ResourceInstance(inner) => {
                Some(Box::new(InstanceView { name: &self.name, inner }))
            }
            VertexKind::Meta(MetaVertex::Destroy(d)) => Some(Box::new(d.clone())),
            _ => None,
        }
    }

    /// Prune capability.
    #[must_use]
    pub fn as_prunable(&self) -> Option<&dyn Prunable> {
        match &self.kind {
            VertexKind::Resource(v) => Some(v),
            VertexKind::Meta(MetaVertex::Ordering) => Some(&ORDERING),
            _ => None,
        }
    }

    /// The module call, if this vertex is one.
    #[must_use]
    pub fn as_module(&self) -> Option<&ModuleVertex> {
        match &self.kind {
            VertexKind::Module(m) => Some(m),
            _ => None,
        }
    }
}

/// Name of the root meta-vertex.
pub const ROOT_VERTEX: &str = "root";

/// Name of the destroy vertex for an instance address.
#[must_use]
pub fn destroy_vertex_name(address: &str) -> String {
    format!("destroy:{address}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(name: &str, config: Value, prefix: &str) -> Vertex {
        let config: Attributes = serde_json::from_value(config).unwrap();
        Vertex::new(
            name,
            VertexKind::ResourceInstance(InstanceVertex {
                resource_type: "null_resource".to_string(),
                provider: "provider.null".to_string(),
                config: Some(config),
                count_index: None,
                depends_on: vec!["null_resource.explicit".to_string()],
                prefix: prefix.to_string(),
            }),
        )
    }

    #[test]
    fn test_instance_capabilities() {
        let v = instance("null_resource.a", json!({"x": "${var.y}"}), "");
        assert!(v.as_diffable().is_some());
        assert!(v.as_value_source().is_none());
        let applyable = v.as_applyable().unwrap();
        assert!(!applyable.is_destroy());
        assert_eq!(
            v.references().unwrap(),
            vec!["var.y".to_string(), "null_resource.explicit".to_string()]
        );
    }

    #[test]
    fn test_references_are_qualified() {
        let v = instance(
            "module.net.null_resource.a",
            json!({"x": "${var.y}", "z": "${module.db.port}"}),
            "module.net.",
        );
        let refs = v.references().unwrap();
        assert!(refs.contains(&"module.net.var.y".to_string()));
        assert!(refs.contains(&"module.net.module.db.output.port".to_string()));
    }

    #[test]
    fn test_destroy_capabilities() {
        let v = Vertex::new(
            destroy_vertex_name("null_resource.a"),
            VertexKind::Meta(MetaVertex::Destroy(DestroyVertex {
                address: "null_resource.a".to_string(),
                resource_type: "null_resource".to_string(),
                provider: "provider.null".to_string(),
            })),
        );
        assert_eq!(v.name, "destroy:null_resource.a");
        assert!(v.as_diffable().is_none());
        assert!(v.as_applyable().unwrap().is_destroy());
        assert!(v.references().unwrap().is_empty());
    }

    #[test]
    fn test_prunable() {
        let empty = Vertex::new(
            "null_resource.none",
            VertexKind::Resource(ResourceVertex {
                resource_type: "null_resource".to_string(),
                count: 0,
                instances: vec![],
            }),
        );
        let prunable = empty.as_prunable().unwrap();
        assert!(prunable.should_prune(0, 0));
        assert!(!prunable.should_prune(1, 0));
        assert!(Vertex::root().as_prunable().is_none());
    }

    #[test]
    fn test_root_output_recorded_in_state() {
        let root = OutputVertex { output: "ip".to_string(), value: json!("x"), prefix: String::new() };
        let nested = OutputVertex { prefix: "module.net.".to_string(), ..root.clone() };
        assert_eq!(root.state_output(), Some("ip"));
        assert_eq!(nested.state_output(), None);
    }
}
