//! Operations over a resource description: validate, refresh, plan, apply.
//!
//! Every operation builds (or loads) a graph and runs one walk over it with
//! an operation-specific callback:
//!
//! ```text
//!   Description + State ──build──► Graph ──plan walk──► Plan
//!                                                        │
//!   State ◄──────────── merges ◄──── apply walk ◄────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use graphform::{Config, Context, Description, ProviderRegistry, State};
//! use std::collections::BTreeMap;
//!
//! # tokio_test::block_on(async {
//! let description = Description::from_yaml(r#"
//! resources:
//!   - type: null_resource
//!     name: a
//!     config:
//!       inputs:
//!         greeting: hello
//! "#).unwrap();
//!
//! let context = Context::new(Config::default(), ProviderRegistry::with_builtins());
//! let plan = context.plan(&description, &BTreeMap::new(), &State::new()).await.unwrap();
//! assert_eq!(plan.summary().create, 1);
//!
//! let result = context.apply(&plan, &State::new()).await.unwrap();
//! let state = result.into_result().unwrap();
//! assert!(state.resource("null_resource.a").is_some());
//! # });
//! ```

mod apply;
mod eval;
mod plan;
mod refresh;
mod validate;

pub use apply::ApplyResult;
pub use plan::{Plan, PlanSummary, PLAN_VERSION};
pub use validate::ValidationReport;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::graph::{Graph, GraphBuilder};
use crate::hook::{Hook, Hooks, Operation};
use crate::provider::ProviderRegistry;
use crate::state::{State, StateStore};
use crate::types::Description;
use crate::walk::{CancelToken, WalkOutcome, Walker};
use apply::ApplyOp;
use eval::{EvalContext, InstanceOperation, OperationWalk};
use plan::PlanOp;
use refresh::RefreshOp;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Entry point for running operations.
///
/// A context owns the provider registry, the hooks and an optional state
/// store. Cancelling its token stops every walk started from it; a hook
/// halting one walk leaves later walks unaffected.
pub struct Context {
    config: Config,
    registry: ProviderRegistry,
    hooks: Hooks,
    store: Option<Arc<dyn StateStore>>,
    cancel: CancelToken,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("hooks", &self.hooks)
            .field("store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Create a context.
    #[must_use]
    pub fn new(config: Config, registry: ProviderRegistry) -> Self {
        Self { config, registry, hooks: Hooks::new(), store: None, cancel: CancelToken::new() }
    }

    /// Add a hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Persist every state change during apply and refresh.
    #[must_use]
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Token that cancels walks started from this context.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the graph for a description against a state.
    pub fn build(
        &self,
        description: &Description,
        state: &State,
        variables: &BTreeMap<String, Value>,
    ) -> Result<Graph> {
        let mut state = state.clone();
        state.migrate_count_addresses(&description.resource_addresses());
        GraphBuilder::new(&self.registry, &state)
            .with_variables(variables.clone())
            .build(description)
    }

    /// Check every instance configuration with its provider.
    pub fn validate(
        &self,
        description: &Description,
        variables: &BTreeMap<String, Value>,
    ) -> Result<ValidationReport> {
        let graph = self.build(description, &State::new(), variables)?;
        self.hooks.pre_walk(Operation::Validate, &graph);
        validate::validate_graph(&graph, &self.registry)
    }

    /// Read every managed instance back from its provider. A changed state
    /// gets a new serial and is persisted.
    pub async fn refresh(
        &self,
        description: &Description,
        variables: &BTreeMap<String, Value>,
        state: State,
    ) -> Result<State> {
        let (mut state, changed) = self.refresh_state(description, variables, state).await?;
        if changed {
            state.serial += 1;
            if let Some(store) = &self.store {
                store.persist(&state)?;
            }
            self.hooks.post_state_update(&state);
        }
        tracing::info!(changed, serial = state.serial, "Refresh complete");
        Ok(state)
    }

    async fn refresh_state(
        &self,
        description: &Description,
        variables: &BTreeMap<String, Value>,
        mut state: State,
    ) -> Result<(State, bool)> {
        let moved = state.migrate_count_addresses(&description.resource_addresses());
        let graph = Arc::new(self.build(description, &state, variables)?);
        let (op, outcome) = self.walk(Operation::Refresh, graph, RefreshOp::new(state)).await?;
        outcome.into_result()?;
        let (state, changed) = op.into_state();
        Ok((state, changed || !moved.is_empty()))
    }

    /// Compute the diff of every instance against `state`.
    ///
    /// Fails if any instance cannot be diffed; the walk errors name each
    /// failed and skipped vertex.
    pub async fn plan(
        &self,
        description: &Description,
        variables: &BTreeMap<String, Value>,
        state: &State,
    ) -> Result<Plan> {
        let prior = if self.config.plan.refresh && !state.is_empty() {
            let (refreshed, changed) = self.refresh_state(description, variables, state.clone()).await?;
            if changed {
                tracing::info!("Planning against refreshed state");
            }
            refreshed
        } else {
            let mut prior = state.clone();
            prior.migrate_count_addresses(&description.resource_addresses());
            prior
        };

        tracing::info!("Phase 1: Building graph");
        let graph = Arc::new(self.build(description, &prior, variables)?);
        tracing::info!(vertices = graph.vertex_count(), edges = graph.edge_count(), "Phase 2: Diffing");
        let (op, outcome) = self.walk(Operation::Plan, Arc::clone(&graph), PlanOp::new(prior.clone())).await?;
        outcome.into_result()?;

        let plan = Plan {
            version: PLAN_VERSION,
            graph: Arc::try_unwrap(graph).unwrap_or_else(|shared| (*shared).clone()),
            diffs: op.into_diffs(),
            variables: variables.clone(),
            prior_serial: state.serial,
            prior_state: prior,
        };
        let summary = plan.summary();
        tracing::info!(
            create = summary.create,
            update = summary.update,
            replace = summary.replace,
            destroy = summary.destroy,
            "Plan complete"
        );
        Ok(plan)
    }

    /// Carry out a plan.
    ///
    /// `current` must be the state the plan was computed against. The
    /// returned state reflects every change made, also when the walk failed.
    pub async fn apply(&self, plan: &Plan, current: &State) -> Result<ApplyResult> {
        if current.serial != plan.prior_serial {
            return Err(crate::err!(StalePlan { planned: plan.prior_serial, current: current.serial }));
        }
        let graph = Arc::new(plan.graph.clone());
        graph.validate_acyclic()?;

        let mut start = plan.prior_state.clone();
        if !start.same_contents(current) {
            // Planning refreshed or moved entries; record that first.
            start.serial += 1;
            if let Some(store) = &self.store {
                store.persist(&start)?;
            }
            self.hooks.post_state_update(&start);
            tracing::info!(serial = start.serial, "Recorded state refreshed during planning");
        }

        let op = ApplyOp::new(plan.diffs.clone(), Arc::clone(&graph), start, self.store.clone());
        let (op, outcome) = self.walk(Operation::Apply, graph, op).await?;
        let state = op.into_state();
        tracing::info!(
            succeeded = outcome.succeeded().len(),
            failed = outcome.errors.failed().len(),
            skipped = outcome.errors.skipped().len(),
            serial = state.serial,
            "Apply complete"
        );
        Ok(ApplyResult { state, outcome })
    }

    async fn walk<O: InstanceOperation + 'static>(
        &self,
        operation: Operation,
        graph: Arc<Graph>,
        op: O,
    ) -> Result<(O, WalkOutcome)> {
        // A halting hook stops only this walk; the context token still
        // reaches it.
        let cancel = self.cancel.child();
        let ctx = EvalContext::new(self.registry.clone(), self.hooks.clone(), cancel.clone());
        let callback = Arc::new(OperationWalk::new(ctx, op));
        callback.announce(operation, &graph);

        let walker = Walker::new(self.config.walk.parallelism).with_cancel(cancel);
        tracing::debug!(%operation, "Walking graph");
        let outcome = walker.walk(graph, callback.clone()).await;

        let callback = Arc::try_unwrap(callback).map_err(|_| {
            EngineError::internal(format!("{operation} walk still referenced after completion"), file!(), line!())
        })?;
        Ok((callback.op, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffAction;
    use crate::state::MemoryStateStore;
    use pretty_assertions::assert_eq;

    fn description(yaml: &str) -> Description {
        Description::from_yaml(yaml).unwrap()
    }

    fn context() -> Context {
        Context::new(Config::default(), ProviderRegistry::with_builtins())
    }

    const CHAIN: &str = r#"
variables:
  - name: greeting
    default: hello
resources:
  - type: null_resource
    name: first
    config:
      inputs:
        msg: ${var.greeting}
  - type: null_resource
    name: second
    config:
      inputs:
        upstream: ${null_resource.first.outputs.msg}
outputs:
  - name: first_id
    value: ${null_resource.first.id}
"#;

    #[tokio::test]
    async fn test_plan_then_apply_chain() {
        let ctx = context();
        let desc = description(CHAIN);
        let plan = ctx.plan(&desc, &BTreeMap::new(), &State::new()).await.unwrap();
        assert_eq!(plan.diffs["null_resource.first"].action, DiffAction::Create);
        assert_eq!(plan.diffs["null_resource.second"].action, DiffAction::Create);

        let state = ctx.apply(&plan, &State::new()).await.unwrap().into_result().unwrap();
        let second = state.resource("null_resource.second").unwrap();
        assert_eq!(second.primary.attributes["outputs"]["upstream"], "hello");
        assert_eq!(second.dependencies, vec!["null_resource.first".to_string()]);
        assert_eq!(state.outputs["first_id"], Value::String(state.resources["null_resource.first"].primary.id.clone()));

        // Nothing left to do
        let again = ctx.plan(&desc, &BTreeMap::new(), &state).await.unwrap();
        assert!(!again.summary().has_changes());
    }

    #[tokio::test]
    async fn test_stale_plan_rejected() {
        let ctx = context();
        let plan = ctx.plan(&description(CHAIN), &BTreeMap::new(), &State::new()).await.unwrap();
        let mut moved = State::new();
        moved.serial = 7;
        let err = ctx.apply(&plan, &moved).await.unwrap_err();
        assert!(matches!(err, EngineError::StalePlan { planned: 0, current: 7, .. }));
    }

    #[tokio::test]
    async fn test_orphan_is_destroyed() {
        let ctx = context();
        let plan = ctx.plan(&description(CHAIN), &BTreeMap::new(), &State::new()).await.unwrap();
        let state = ctx.apply(&plan, &State::new()).await.unwrap().into_result().unwrap();

        let reduced = description(
            r#"
resources:
  - type: null_resource
    name: first
    config:
      inputs:
        msg: hello
"#,
        );
        let plan = ctx.plan(&reduced, &BTreeMap::new(), &state).await.unwrap();
        assert_eq!(plan.diffs["null_resource.second"].action, DiffAction::Destroy);
        assert_eq!(plan.diffs["null_resource.first"].action, DiffAction::NoOp);

        let state = ctx.apply(&plan, &state).await.unwrap().into_result().unwrap();
        assert!(state.resource("null_resource.second").is_none());
        assert!(state.resource("null_resource.first").is_some());
    }

    #[tokio::test]
    async fn test_every_merge_is_persisted() {
        let store = Arc::new(MemoryStateStore::new(State::new()));
        let ctx = context().with_state_store(store.clone());
        let plan = ctx.plan(&description(CHAIN), &BTreeMap::new(), &State::new()).await.unwrap();
        let state = ctx.apply(&plan, &State::new()).await.unwrap().into_result().unwrap();

        let snapshots = store.snapshots();
        // initial, two instances, one output
        assert_eq!(snapshots.len(), 4);
        assert_eq!(snapshots.last().unwrap(), &state);
        assert_eq!(state.serial, 3);
    }

    #[tokio::test]
    async fn test_refresh_without_drift_keeps_serial() {
        let ctx = context();
        let plan = ctx.plan(&description(CHAIN), &BTreeMap::new(), &State::new()).await.unwrap();
        let state = ctx.apply(&plan, &State::new()).await.unwrap().into_result().unwrap();
        let refreshed = ctx.refresh(&description(CHAIN), &BTreeMap::new(), state.clone()).await.unwrap();
        assert_eq!(refreshed, state);
    }

    #[test]
    fn test_validate_reports_unknown_attribute() {
        let ctx = context();
        let desc = description(
            r#"
resources:
  - type: null_resource
    name: a
    config:
      colour: blue
"#,
        );
        assert!(matches!(ctx.validate(&desc, &BTreeMap::new()), Err(EngineError::Validation { count: 1, .. })));
    }
}
