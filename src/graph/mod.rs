//! Dependency Graph Module
//!
//! This module turns a resource description plus the prior state into the
//! directed acyclic graph every operation walks.
//!
//! # Architecture Overview
//!
//! The graph uses `petgraph` as its foundation. An edge `A -> B` means
//! *A depends on B*: B completes before A starts.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      DEPENDENCY GRAPH                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────┐      ┌──────────────────┐      ┌──────────────┐    │
//! │  │ root │─────▶│ null_resource.b  │─────▶│ provider.null│    │
//! │  └──────┘      └──────────────────┘      └──────────────┘    │
//! │                        │                        ▲            │
//! │                        ▼                        │            │
//! │                ┌──────────────────┐             │            │
//! │                │ null_resource.a  │─────────────┘            │
//! │                └──────────────────┘                          │
//! │                        │                                     │
//! │                        ▼                                     │
//! │                ┌──────────────────┐                          │
//! │                │     var.tag      │                          │
//! │                └──────────────────┘                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Vertex Kinds
//!
//! 1. **Instances**: one per resource, or per counted instance
//! 2. **Resources**: aggregates over counted instances (`a.*.id`)
//! 3. **Providers**: configured once per walk
//! 4. **Variables and outputs**: publish values for their dependents
//! 5. **Module calls**: flattened away by the transform pipeline
//! 6. **Meta vertices**: `root`, `destroy:<address>` and ordering barriers
//!
//! # Construction
//!
//! ```rust
//! use graphform::graph::{export_graph, GraphBuilder};
//! use graphform::provider::ProviderRegistry;
//! use graphform::state::State;
//! use graphform::types::{Description, GraphFormat};
//!
//! let description = Description::from_yaml(r#"
//! variables:
//!   - name: tag
//!     default: blue
//! resources:
//!   - type: null_resource
//!     name: a
//!     config:
//!       inputs: { tag: "${var.tag}" }
//! "#).unwrap();
//!
//! let registry = ProviderRegistry::with_builtins();
//! let state = State::new();
//! let graph = GraphBuilder::new(&registry, &state).build(&description).unwrap();
//!
//! assert_eq!(graph.dependencies("null_resource.a"), vec!["provider.null", "var.tag"]);
//! let dot = export_graph(&graph, GraphFormat::Dot).unwrap();
//! assert!(dot.contains("null_resource.a"));
//! ```
//!
//! # Implementation Details
//!
//! Vertices live in a `petgraph::stable_graph::StableDiGraph` so indices
//! survive removals during pruning. A `HashMap<String, NodeIndex>` provides
//! O(1) lookup by name. Every query that returns several vertices returns
//! them sorted by name, which keeps walks, exports and plans deterministic.

mod builder;
mod export;
mod transform;
mod types;
mod vertex;

pub use builder::GraphBuilder;
pub use export::export_graph;
pub(crate) use export::export_dot;
pub use transform::{
    DestroyTransformer, GraphTransformer, ModuleFlattenTransformer, PruneTransformer,
    ProviderTransformer, RootTransformer, TransformContext, TransformPipeline,
};
pub use types::{Graph, GraphSnapshot};
pub use vertex::{
    destroy_vertex_name, Applyable, DestroyVertex, Diffable, InstanceVertex, MetaVertex,
    ModuleVertex, OutputVertex, Prunable, ProviderSetup, ProviderVertex, Referencer,
    ResourceVertex, ScopeInfo, ValueExpr, ValueSource, VariableVertex, Vertex, VertexKind,
    ROOT_VERTEX,
};
