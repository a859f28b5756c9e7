//! Graph builder implementation.
//!
//! This module provides the `GraphBuilder` which constructs a `Graph` from a
//! resource description plus the prior state.

use super::transform::{TransformContext, TransformPipeline};
use super::types::Graph;
use super::vertex::{
    InstanceVertex, ModuleVertex, OutputVertex, ProviderVertex, ResourceVertex, ScopeInfo,
    VariableVertex, Vertex, VertexKind,
};
use crate::error::Result;
use crate::provider::ProviderRegistry;
use crate::reference::{interpolate, references_in, select, Reference};
use crate::state::State;
use crate::types::{Description, ResourceDecl};
use serde_json::Value;
use std::collections::BTreeMap;

/// Builder for constructing dependency graphs.
///
/// # Algorithm
///
/// 1. **Vertex Creation Phase**:
///    - One vertex per variable, provider, output and module call
///    - One instance vertex per resource, or per counted instance plus an
///      aggregate vertex when `count` is set
///
/// 2. **Edge Creation Phase**:
///    - Scan every vertex's configuration for `${...}` references
///    - Link the vertex to each referenced vertex; unknown targets fail
///
/// 3. **Transform Phase**: providers, module flattening, destroy vertices,
///    pruning, root (see [`TransformPipeline`])
///
/// 4. **Validation Phase**: reject cycles
///
/// # Example
///
/// ```rust
/// use graphform::graph::GraphBuilder;
/// use graphform::provider::ProviderRegistry;
/// use graphform::state::State;
/// use graphform::types::Description;
///
/// let description = Description::from_yaml(r#"
/// resources:
///   - type: null_resource
///     name: a
/// "#).unwrap();
/// let registry = ProviderRegistry::with_builtins();
/// let state = State::new();
///
/// let graph = GraphBuilder::new(&registry, &state).build(&description).unwrap();
/// assert!(graph.contains("null_resource.a"));
/// assert!(graph.contains("provider.null"));
/// ```
pub struct GraphBuilder<'a> {
    registry: &'a ProviderRegistry,
    state: &'a State,
    variables: BTreeMap<String, Value>,
    pipeline: TransformPipeline,
}

impl<'a> GraphBuilder<'a> {
    /// Create a new graph builder.
    #[must_use]
    pub fn new(registry: &'a ProviderRegistry, state: &'a State) -> Self {
        Self {
            registry,
            state,
            variables: BTreeMap::new(),
            pipeline: TransformPipeline::standard(),
        }
    }

    /// Supply values for root variables.
    #[must_use]
    pub fn with_variables(mut self, variables: BTreeMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Build the graph.
    ///
    /// # Errors
    ///
    /// Fails without returning a partial graph on duplicate names, references
    /// to undeclared entities, unknown providers, invalid counts and cycles.
    pub fn build(&self, description: &Description) -> Result<Graph> {
        tracing::debug!(
            resources = description.resources.len(),
            modules = description.modules.len(),
            prior_resources = self.state.resources.len(),
            "Starting graph construction"
        );
        let mut graph = Graph::new();

        for name in self.variables.keys() {
            if description.variable(name).is_none() {
                tracing::warn!(variable = %name, "Ignoring value for undeclared variable");
            }
        }

        // Phase 1: vertices for the root scope
        tracing::debug!("Phase 1: Adding root scope vertices");
        let added = ScopeBuilder::root(description, &self.variables)?.add_to(&mut graph)?;

        // Phase 2: reference edges
        tracing::debug!(vertices = added.len(), "Phase 2: Connecting references");
        connect_references(&mut graph, &added)?;

        // Phase 3: transforms
        tracing::debug!("Phase 3: Running transform pipeline");
        let ctx = TransformContext { registry: self.registry, state: self.state };
        self.pipeline.run(&mut graph, &ctx)?;

        // Phase 4: acyclicity
        tracing::debug!("Phase 4: Validating graph");
        graph.validate_acyclic()?;

        tracing::info!(
            vertices = graph.vertex_count(),
            edges = graph.edge_count(),
            "Graph construction complete"
        );
        Ok(graph)
    }
}

/// Vertices of one module scope, ready to be added to a graph.
pub(crate) struct ScopeBuilder<'d> {
    description: &'d Description,
    scope: ScopeInfo,
    /// Variable name to (expression, prefix qualifying its references)
    variables: BTreeMap<String, (Value, String)>,
}

impl<'d> ScopeBuilder<'d> {
    /// The root scope, with supplied variable values.
    pub(crate) fn root(
        description: &'d Description,
        supplied: &BTreeMap<String, Value>,
    ) -> Result<Self> {
        let mut scope = ScopeInfo::default();
        let mut variables = BTreeMap::new();

        for decl in &description.variables {
            let value = supplied
                .get(&decl.name)
                .or(decl.default.as_ref())
                .cloned()
                .ok_or_else(|| crate::err!(MissingVariable { name: decl.name.clone() }))?;
            scope.static_variables.insert(decl.name.clone(), value.clone());
            variables.insert(decl.name.clone(), (value, String::new()));
        }
        for provider in &description.providers {
            scope
                .providers
                .insert(provider.name.clone(), format!("provider.{}", provider.name));
        }

        Ok(Self { description, scope, variables })
    }

    /// The scope of a module call.
    pub(crate) fn child(call: &'d ModuleVertex) -> Result<Self> {
        let description = &call.source;
        let caller = &call.caller;
        let prefix = format!("{}module.{}.", caller.prefix, call.module);

        for key in call.inputs.keys() {
            if description.variable(key).is_none() {
                return Err(crate::err!(GraphBuild {
                    message: format!("module '{}' has no variable '{key}'", call.module),
                }));
            }
        }

        let mut scope = ScopeInfo {
            prefix: prefix.clone(),
            providers: caller.providers.clone(),
            static_variables: BTreeMap::new(),
        };
        for provider in &description.providers {
            scope
                .providers
                .insert(provider.name.clone(), format!("{prefix}provider.{}", provider.name));
        }

        let mut variables = BTreeMap::new();
        for decl in &description.variables {
            let (expr, ref_prefix, known) = match (call.inputs.get(&decl.name), &decl.default) {
                (Some(input), _) => {
                    let known = static_value(input, &caller.static_variables)?;
                    (input.clone(), caller.prefix.clone(), known)
                }
                (None, Some(default)) => (default.clone(), prefix.clone(), Some(default.clone())),
                (None, None) => {
                    return Err(crate::err!(MissingVariable {
                        name: format!("{prefix}var.{}", decl.name),
                    }));
                }
            };
            if let Some(value) = known {
                scope.static_variables.insert(decl.name.clone(), value);
            }
            variables.insert(decl.name.clone(), (expr, ref_prefix));
        }

        Ok(Self { description, scope, variables })
    }

    /// Add the scope's vertices and return their names.
    pub(crate) fn add_to(self, graph: &mut Graph) -> Result<Vec<String>> {
        let prefix = self.scope.prefix.clone();
        let mut added = Vec::new();
        let mut add = |graph: &mut Graph, vertex: Vertex| -> Result<()> {
            added.push(vertex.name.clone());
            graph.add_vertex(vertex)
        };

        for (name, (value, ref_prefix)) in &self.variables {
            add(
                graph,
                Vertex::new(
                    format!("{prefix}var.{name}"),
                    VertexKind::Variable(VariableVertex {
                        value: value.clone(),
                        ref_prefix: ref_prefix.clone(),
                    }),
                ),
            )?;
        }

        for provider in &self.description.providers {
            add(
                graph,
                Vertex::new(
                    format!("{prefix}provider.{}", provider.name),
                    VertexKind::Provider(ProviderVertex {
                        provider_type: provider.name.clone(),
                        config: provider.config.clone(),
                        prefix: prefix.clone(),
                    }),
                ),
            )?;
        }

        for resource in &self.description.resources {
            for vertex in self.resource_vertices(resource)? {
                add(graph, vertex)?;
            }
        }

        for output in &self.description.outputs {
            add(
                graph,
                Vertex::new(
                    format!("{prefix}output.{}", output.name),
                    VertexKind::Output(OutputVertex {
                        output: output.name.clone(),
                        value: output.value.clone(),
                        prefix: prefix.clone(),
                    }),
                ),
            )?;
        }

        for module in &self.description.modules {
            add(
                graph,
                Vertex::new(
                    format!("{prefix}module.{}", module.name),
                    VertexKind::Module(ModuleVertex {
                        module: module.name.clone(),
                        source: module.source.clone(),
                        inputs: module.inputs.clone(),
                        caller: self.scope.clone(),
                    }),
                ),
            )?;
        }

        tracing::debug!(scope = %prefix, vertices = added.len(), "Added scope vertices");
        Ok(added)
    }

    fn resource_vertices(&self, resource: &ResourceDecl) -> Result<Vec<Vertex>> {
        let prefix = &self.scope.prefix;
        let key = format!("{prefix}{}", resource.key());
        let provider_name = resource.provider_name();
        let provider = self
            .scope
            .providers
            .get(&provider_name)
            .cloned()
            .unwrap_or_else(|| format!("provider.{provider_name}"));
        let depends_on: Vec<String> =
            resource.depends_on.iter().map(|d| format!("{prefix}{d}")).collect();

        let instance = |name: String, count_index: Option<usize>| {
            Vertex::new(
                name,
                VertexKind::ResourceInstance(InstanceVertex {
                    resource_type: resource.resource_type.clone(),
                    provider: provider.clone(),
                    config: Some(resource.config.clone()),
                    count_index,
                    depends_on: depends_on.clone(),
                    prefix: prefix.clone(),
                }),
            )
        };

        let Some(count) = self.resolve_count(resource, &key)? else {
            return Ok(vec![instance(key, None)]);
        };

        let names: Vec<String> = (0..count).map(|i| format!("{key}[{i}]")).collect();
        let mut vertices: Vec<Vertex> = names
            .iter()
            .enumerate()
            .map(|(i, name)| instance(name.clone(), Some(i)))
            .collect();
        vertices.push(Vertex::new(
            key,
            VertexKind::Resource(ResourceVertex {
                resource_type: resource.resource_type.clone(),
                count,
                instances: names,
            }),
        ));
        Ok(vertices)
    }

    fn resolve_count(&self, resource: &ResourceDecl, key: &str) -> Result<Option<usize>> {
        let Some(raw) = &resource.count else {
            return Ok(None);
        };
        let invalid = |message: String| {
            crate::err!(InvalidCount { resource: key.to_string(), message })
        };
        let value = static_value(raw, &self.scope.static_variables)?
            .ok_or_else(|| invalid("count must be a literal or a variable known before apply".to_string()))?;
        let count = match &value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }
        .ok_or_else(|| invalid(format!("expected a non-negative integer, got {value}")))?;
        usize::try_from(count)
            .map(Some)
            .map_err(|_| invalid(format!("count {count} is too large")))
    }
}

/// Evaluate a value using only variables known at build time.
///
/// Returns `None` when the value references anything else.
fn static_value(value: &Value, known: &BTreeMap<String, Value>) -> Result<Option<Value>> {
    let refs = references_in(value)?;
    if refs.is_empty() {
        return Ok(Some(value.clone()));
    }
    let all_known = refs.iter().all(|r| {
        matches!(r, Reference::Variable { name, path } if known.get(name).and_then(|v| select(v, path)).is_some())
    });
    if !all_known {
        return Ok(None);
    }
    interpolate(value, &mut |r: &Reference| match r {
        Reference::Variable { name, path } => known
            .get(name)
            .and_then(|v| select(v, path))
            .ok_or_else(|| crate::err!(GraphBuild { message: format!("unknown variable '{name}'") })),
        _ => Err(crate::err!(GraphBuild { message: "unexpected reference".to_string() })),
    })
    .map(Some)
}

/// Split a module output vertex name into its module call vertex and output.
///
/// `module.a.module.b.output.x` -> (`module.a.module.b`, `x`)
pub(crate) fn split_module_output(name: &str) -> Option<(&str, &str)> {
    let (module_vertex, output) = name.rsplit_once(".output.")?;
    let mut segments = module_vertex.rsplit('.');
    let _module_name = segments.next()?;
    (segments.next()? == "module").then_some((module_vertex, output))
}

/// Resolve a referenced name to the vertex an edge should point at.
fn resolve_target(graph: &Graph, reference: &str) -> Option<String> {
    if graph.contains(reference) {
        return Some(reference.to_string());
    }
    let (module_vertex, output) = split_module_output(reference)?;
    let call = graph.vertex(module_vertex)?.as_module()?;
    call.source.has_output(output).then(|| module_vertex.to_string())
}

/// Connect each named vertex to every vertex it references.
pub(crate) fn connect_references(graph: &mut Graph, names: &[String]) -> Result<()> {
    for name in names {
        let Some(vertex) = graph.vertex(name) else { continue };
        let references = vertex.references()?;
        for reference in references {
            let target = resolve_target(graph, &reference).ok_or_else(|| {
                crate::err!(UnresolvedReference { vertex: name.clone(), reference: reference.clone() })
            })?;
            if target == *name {
                return Err(crate::err!(SelfEdge { vertex: name.clone() }));
            }
            graph.connect(name, &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use pretty_assertions::assert_eq;

    fn build(yaml: &str) -> Result<Graph> {
        let registry = ProviderRegistry::with_builtins();
        let state = State::new();
        let description = Description::from_yaml(yaml)?;
        GraphBuilder::new(&registry, &state).build(&description)
    }

    #[test]
    fn test_reference_edges() {
        let graph = build(
            r#"
variables:
  - name: tag
    default: x
resources:
  - type: null_resource
    name: a
    config:
      inputs: { tag: "${var.tag}" }
  - type: null_resource
    name: b
    config:
      inputs: { upstream: "${null_resource.a.id}" }
outputs:
  - name: b_id
    value: ${null_resource.b.id}
"#,
        )
        .unwrap();

        assert_eq!(graph.dependencies("null_resource.a"), vec!["provider.null", "var.tag"]);
        assert_eq!(graph.dependencies("null_resource.b"), vec!["null_resource.a", "provider.null"]);
        assert_eq!(graph.dependencies("output.b_id"), vec!["null_resource.b"]);
        assert_eq!(graph.roots(), vec!["root"]);
    }

    #[test]
    fn test_count_expansion() {
        let graph = build(
            r#"
variables:
  - name: n
    default: 3
resources:
  - type: null_resource
    name: web
    count: ${var.n}
outputs:
  - name: ids
    value: ${null_resource.web.*.id}
"#,
        )
        .unwrap();

        for i in 0..3 {
            assert!(graph.contains(&format!("null_resource.web[{i}]")));
        }
        assert_eq!(
            graph.dependencies("null_resource.web"),
            vec!["null_resource.web[0]", "null_resource.web[1]", "null_resource.web[2]"]
        );
        assert_eq!(graph.dependencies("output.ids"), vec!["null_resource.web"]);
    }

    #[test]
    fn test_count_zero_aggregate_is_pruned() {
        let graph = build(
            r#"
resources:
  - type: null_resource
    name: none
    count: 0
"#,
        )
        .unwrap();
        assert!(!graph.contains("null_resource.none"));
    }

    #[test]
    fn test_unresolved_reference_is_fatal() {
        let err = build(
            r#"
resources:
  - type: null_resource
    name: a
    config:
      inputs: { x: "${null_resource.missing.id}" }
"#,
        )
        .unwrap_err();
        match err {
            EngineError::UnresolvedReference { vertex, reference, .. } => {
                assert_eq!(vertex, "null_resource.a");
                assert_eq!(reference, "null_resource.missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_resource_is_fatal() {
        let err = build(
            r#"
resources:
  - type: null_resource
    name: a
  - type: null_resource
    name: a
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateVertex { .. }));
    }

    #[test]
    fn test_cycle_is_fatal() {
        let err = build(
            r#"
resources:
  - type: null_resource
    name: a
    config:
      inputs: { x: "${null_resource.b.id}" }
  - type: null_resource
    name: b
    config:
      inputs: { x: "${null_resource.a.id}" }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Cycle { .. }));
    }

    #[test]
    fn test_missing_variable_and_provider() {
        let err = build("variables:\n  - name: region\n").unwrap_err();
        assert!(matches!(err, EngineError::MissingVariable { .. }));

        let err = build("resources:\n  - type: aws_instance\n    name: web\n").unwrap_err();
        assert!(matches!(err, EngineError::MissingProvider { .. }));
    }

    #[test]
    fn test_invalid_count() {
        let err = build(
            r#"
resources:
  - type: null_resource
    name: a
  - type: null_resource
    name: b
    count: ${null_resource.a.id}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidCount { .. }));
    }

    #[test]
    fn test_split_module_output() {
        assert_eq!(split_module_output("module.a.output.x"), Some(("module.a", "x")));
        assert_eq!(
            split_module_output("module.a.module.b.output.x"),
            Some(("module.a.module.b", "x"))
        );
        assert_eq!(split_module_output("output.x"), None);
        assert_eq!(split_module_output("null_resource.output.x"), None);
    }
}
