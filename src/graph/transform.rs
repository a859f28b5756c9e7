//! Graph transformers.
//!
//! The builder only creates the root scope and its reference edges. The
//! passes below, run in order, turn that into the graph the walker executes:
//!
//! 1. [`ProviderTransformer`]: instances depend on their provider
//! 2. [`ModuleFlattenTransformer`]: module calls expand into their scope
//! 3. [`DestroyTransformer`]: orphans and `destroy:` vertices
//! 4. [`PruneTransformer`]: unused expansion artifacts go away
//! 5. [`RootTransformer`]: a single `root` completion vertex
//!
//! Intermediate graphs may be irregular; acyclicity is checked once the
//! whole pipeline has run.

use super::builder::{connect_references, ScopeBuilder};
use super::types::Graph;
use super::vertex::{
    destroy_vertex_name, DestroyVertex, InstanceVertex, MetaVertex, ProviderVertex, Vertex,
    VertexKind, ROOT_VERTEX,
};
use crate::error::Result;
use crate::provider::ProviderRegistry;
use crate::state::State;
use std::collections::{BTreeMap, BTreeSet};

/// Inputs shared by every transform.
pub struct TransformContext<'a> {
    pub registry: &'a ProviderRegistry,
    pub state: &'a State,
}

/// A graph rewriting pass.
pub trait GraphTransformer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Rewrite the graph in place.
    fn transform(&self, graph: &mut Graph, ctx: &TransformContext<'_>) -> Result<()>;
}

/// Ordered list of transformers.
pub struct TransformPipeline {
    transformers: Vec<Box<dyn GraphTransformer>>,
}

impl TransformPipeline {
    /// The standard pipeline.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            transformers: vec![
                Box::new(ProviderTransformer),
                Box::new(ModuleFlattenTransformer),
                Box::new(DestroyTransformer),
                Box::new(PruneTransformer),
                Box::new(RootTransformer),
            ],
        }
    }

    /// Names of the transformers, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.transformers.iter().map(|t| t.name()).collect()
    }

    /// Run every transformer; the first error aborts.
    pub fn run(&self, graph: &mut Graph, ctx: &TransformContext<'_>) -> Result<()> {
        for transformer in &self.transformers {
            tracing::debug!(
                transform = transformer.name(),
                vertices = graph.vertex_count(),
                edges = graph.edge_count(),
                "Running transform"
            );
            transformer.transform(graph, ctx)?;
        }
        Ok(())
    }
}

// =============================================================================
// Providers
// =============================================================================

/// Makes every instance and destroy vertex depend on its provider.
///
/// Providers that are referenced but not declared are created with an empty
/// configuration. Every provider needs a registered factory.
pub struct ProviderTransformer;

impl ProviderTransformer {
    fn ensure_provider(graph: &mut Graph, ctx: &TransformContext<'_>, name: &str, user: &str) -> Result<()> {
        if !graph.contains(name) {
            let (prefix, provider_type) = name.rsplit_once("provider.").ok_or_else(|| {
                crate::err!(GraphBuild { message: format!("'{name}' is not a provider name") })
            })?;
            tracing::debug!(provider = %name, "Adding implicit provider");
            graph.add_vertex(Vertex::new(
                name,
                VertexKind::Provider(ProviderVertex {
                    provider_type: provider_type.to_string(),
                    config: BTreeMap::new(),
                    prefix: prefix.to_string(),
                }),
            ))?;
        }
        let provider_type = graph
            .vertex(name)
            .and_then(Vertex::as_provider_setup)
            .map(|p| p.provider_type().to_string())
            .ok_or_else(|| crate::err!(GraphBuild { message: format!("'{name}' is not a provider") }))?;
        if !ctx.registry.contains(&provider_type) {
            return Err(crate::err!(MissingProvider {
                provider: provider_type,
                resource: user.to_string(),
            }));
        }
        Ok(())
    }
}

impl GraphTransformer for ProviderTransformer {
    fn name(&self) -> &'static str {
        "providers"
    }

    fn transform(&self, graph: &mut Graph, ctx: &TransformContext<'_>) -> Result<()> {
        let mut users: Vec<(String, String)> = graph
            .vertices()
            .filter_map(|v| {
                v.as_applyable().map(|a| (v.name.clone(), a.provider().to_string()))
            })
            .collect();
        users.sort();

        for (user, provider) in &users {
            Self::ensure_provider(graph, ctx, provider, user)?;
            graph.connect(user, provider)?;
        }

        let declared: Vec<(String, String)> = graph
            .vertices()
            .filter_map(|v| v.as_provider_setup().map(|p| (v.name.clone(), p.provider_type().to_string())))
            .collect();
        for (name, provider_type) in declared {
            if !ctx.registry.contains(&provider_type) {
                return Err(crate::err!(MissingProvider { provider: provider_type, resource: name }));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Modules
// =============================================================================

/// Replaces each module call with the vertices of its scope.
///
/// The call vertex stays behind as an ordering barrier depending on the
/// whole child scope, for dependents that named the module in `depends_on`.
/// Dependents that referenced module outputs are rewired to the output
/// vertices. Nested calls are expanded on later rounds.
pub struct ModuleFlattenTransformer;

impl ModuleFlattenTransformer {
    fn flatten(graph: &mut Graph, name: &str) -> Result<()> {
        let Some(call) = graph.vertex(name).and_then(Vertex::as_module).cloned() else {
            return Ok(());
        };
        let dependents: Vec<String> = graph.dependents(name).into_iter().map(String::from).collect();
        let dependencies: Vec<String> =
            graph.dependencies(name).into_iter().map(String::from).collect();

        tracing::debug!(module = %name, "Flattening module");
        let added = ScopeBuilder::child(&call)?.add_to(graph)?;
        connect_references(graph, &added)?;

        // Input edges now belong to the child's variables.
        for dependency in &dependencies {
            graph.disconnect(name, dependency);
        }
        if let Some(vertex) = graph.vertex_mut(name) {
            vertex.kind = VertexKind::Meta(MetaVertex::Ordering);
        }
        for child in &added {
            graph.connect(name, child)?;
        }

        for dependent in &dependents {
            connect_references(graph, std::slice::from_ref(dependent))?;
            let explicit = graph
                .vertex(dependent)
                .map(|v| v.references())
                .transpose()?
                .is_some_and(|refs| refs.iter().any(|r| r == name));
            if !explicit {
                graph.disconnect(dependent, name);
            }
        }
        Ok(())
    }
}

impl GraphTransformer for ModuleFlattenTransformer {
    fn name(&self) -> &'static str {
        "modules"
    }

    fn transform(&self, graph: &mut Graph, ctx: &TransformContext<'_>) -> Result<()> {
        loop {
            let mut calls: Vec<String> = graph
                .vertices()
                .filter(|v| v.as_module().is_some())
                .map(|v| v.name.clone())
                .collect();
            if calls.is_empty() {
                break;
            }
            calls.sort();
            for call in &calls {
                Self::flatten(graph, call)?;
            }
        }
        ProviderTransformer.transform(graph, ctx)
    }
}

// =============================================================================
// Destroy
// =============================================================================

/// Adds orphan instances and the destroy half of every instance with state.
///
/// Orphans are materialized here because every declared address is known
/// only after flattening. Edges:
/// - `X -> destroy:X`: the create side waits for its own destroy
/// - `destroy:Y -> destroy:X` when X depends on Y: dependents go first
pub struct DestroyTransformer;

impl GraphTransformer for DestroyTransformer {
    fn name(&self) -> &'static str {
        "destroy"
    }

    fn transform(&self, graph: &mut Graph, ctx: &TransformContext<'_>) -> Result<()> {
        for (address, resource) in &ctx.state.resources {
            match graph.vertex(address) {
                Some(v) if v.as_diffable().is_some() => {}
                Some(_) => {
                    return Err(crate::err!(GraphBuild {
                        message: format!(
                            "state entry '{address}' collides with a vertex that is not an instance; \
                             counted resources are addressed as '{address}[N]'"
                        ),
                    }));
                }
                None => {
                    tracing::debug!(address = %address, "Adding orphan instance");
                    graph.add_vertex(Vertex::new(
                        address.clone(),
                        VertexKind::ResourceInstance(InstanceVertex {
                            resource_type: resource.resource_type.clone(),
                            provider: resource.provider.clone(),
                            config: None,
                            count_index: None,
                            depends_on: Vec::new(),
                            prefix: String::new(),
                        }),
                    ))?;
                }
            }
        }

        // Dependencies are collected before any destroy edge exists.
        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (address, resource) in &ctx.state.resources {
            let is_orphan = graph
                .vertex(address)
                .and_then(|v| v.as_diffable().map(|d| d.config().is_none()))
                .unwrap_or(false);
            let deps = if is_orphan {
                resource.dependencies.iter().cloned().collect()
            } else {
                graph.instance_dependencies(address)
            };
            dependencies.insert(address.clone(), deps);
        }

        for (address, resource) in &ctx.state.resources {
            let destroy = destroy_vertex_name(address);
            graph.add_vertex(Vertex::new(
                destroy.clone(),
                VertexKind::Meta(MetaVertex::Destroy(DestroyVertex {
                    address: address.clone(),
                    resource_type: resource.resource_type.clone(),
                    provider: resource.provider.clone(),
                })),
            ))?;
            graph.connect(address, &destroy)?;
        }

        for (address, deps) in &dependencies {
            for dep in deps {
                if ctx.state.resources.contains_key(dep) {
                    graph.connect(&destroy_vertex_name(dep), &destroy_vertex_name(address))?;
                }
            }
        }

        ProviderTransformer.transform(graph, ctx)
    }
}

// =============================================================================
// Prune and root
// =============================================================================

/// Removes prunable vertices left unused, until nothing changes.
pub struct PruneTransformer;

impl GraphTransformer for PruneTransformer {
    fn name(&self) -> &'static str {
        "prune"
    }

    fn transform(&self, graph: &mut Graph, _ctx: &TransformContext<'_>) -> Result<()> {
        loop {
            let doomed: Vec<String> = graph
                .vertices()
                .filter(|v| {
                    v.as_prunable().is_some_and(|p| {
                        p.should_prune(
                            graph.dependents(&v.name).len(),
                            graph.dependencies(&v.name).len(),
                        )
                    })
                })
                .map(|v| v.name.clone())
                .collect();
            if doomed.is_empty() {
                return Ok(());
            }
            for name in doomed {
                tracing::debug!(vertex = %name, "Pruning vertex");
                graph.remove_vertex(&name);
            }
        }
    }
}

/// Adds `root`, depending on every vertex nothing else depends on.
pub struct RootTransformer;

impl GraphTransformer for RootTransformer {
    fn name(&self) -> &'static str {
        "root"
    }

    fn transform(&self, graph: &mut Graph, _ctx: &TransformContext<'_>) -> Result<()> {
        let tops: Vec<String> = graph.roots().into_iter().map(String::from).collect();
        graph.add_vertex(Vertex::root())?;
        for top in tops {
            graph.connect(ROOT_VERTEX, &top)?;
        }
        Ok(())
    }
}
