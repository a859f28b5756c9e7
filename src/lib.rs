//! # Graphform
//!
//! A dependency-graph engine that plans and applies infrastructure changes.
//!
//! Graphform reads a declarative resource description, builds a dependency
//! graph of resources, providers, variables, outputs and modules, diffs it
//! against the last known state, and applies the resulting plan with bounded
//! concurrency.
//!
//! ## Features
//!
//! - **Graph building**: one vertex per declared entity, edges inferred from
//!   `${...}` references, modules flattened into their callers
//! - **Transformer pipeline**: providers, modules, destroy ordering, pruning
//!   and a single root, applied in order before the cycle check
//! - **Bounded walker**: dependencies finish before dependents start; a
//!   failure skips only what depends on it
//! - **Plans as artifacts**: a plan carries its graph and diffs and survives a
//!   JSON round-trip between separate invocations
//! - **Incremental state**: every applied change is merged and persisted
//!   under a single lock, partial creates included
//! - **Hooks**: explicit observers for progress display and debug archives
//!
//! ## Example
//!
//! ```rust,no_run
//! use graphform::{Config, Context, Description, FileStateStore, ProviderRegistry, StateStore};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let description = Description::from_path("infra.yaml".as_ref())?;
//!     let store = Arc::new(FileStateStore::new("graphform.state.json"));
//!     let state = store.load()?;
//!
//!     let context = Context::new(Config::default(), ProviderRegistry::with_builtins())
//!         .with_state_store(store);
//!     let plan = context.plan(&description, &BTreeMap::new(), &state).await?;
//!     let result = context.apply(&plan, &state).await?;
//!
//!     println!("serial {}", result.state.serial);
//!     result.into_result()?;
//!     Ok(())
//! }
//! ```

#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

pub mod cli;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hook;
pub mod provider;
pub mod reference;
pub mod reporter;
pub mod state;
pub mod types;
pub mod walk;

// Re-export commonly used types at crate root
pub use config::Config;
pub use diff::{AttrDiff, DiffAction, InstanceDiff};
pub use engine::{ApplyResult, Context, Plan, PlanSummary, ValidationReport};
pub use error::{EngineError, MultiError, Result};
pub use graph::{Graph, GraphBuilder};
pub use hook::{Hook, HookAction, Hooks};
pub use provider::{ProviderRegistry, ResourceProvider};
pub use state::{FileStateStore, InstanceState, MemoryStateStore, ResourceState, State, StateStore};
pub use types::{Attributes, Description, GraphFormat, ReportFormat};
pub use walk::{CancelToken, Walker};
