//! Apply walk.
//!
//! Every instance re-resolves its configuration against the values applied
//! so far and asks its provider for a fresh diff before applying, so values
//! that were unknown at plan time are known here. Each result is merged into
//! the shared state under one lock and persisted before the lock is released.

use super::eval::{DestroyTarget, EvalContext, InstanceOperation, InstanceTarget};
use crate::diff::{DiffAction, InstanceDiff};
use crate::error::{EngineError, Result};
use crate::graph::Graph;
use crate::hook::Hook;
use crate::provider::ApplyFailure;
use crate::state::{InstanceState, ResourceState, State, StateStore};
use crate::walk::WalkOutcome;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Outcome of an apply: the state as far as the walk got, and what happened
/// to every vertex.
///
/// The state must be kept even when the walk failed; it records instances
/// that were created before the failure.
#[derive(Debug)]
pub struct ApplyResult {
    /// State after the walk, persisted as far as it got
    pub state: State,
    /// Status of every vertex
    pub outcome: WalkOutcome,
}

impl ApplyResult {
    /// Whether every vertex succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// The state, or the walk errors if any vertex did not succeed.
    pub fn into_result(self) -> Result<State> {
        let Self { state, outcome } = self;
        outcome.into_result().map(|()| state)
    }
}

pub(crate) struct ApplyOp {
    diffs: BTreeMap<String, InstanceDiff>,
    graph: Arc<Graph>,
    state: Mutex<State>,
    store: Option<Arc<dyn StateStore>>,
}

impl ApplyOp {
    pub(crate) fn new(
        diffs: BTreeMap<String, InstanceDiff>,
        graph: Arc<Graph>,
        state: State,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        Self { diffs, graph, state: Mutex::new(state), store }
    }

    pub(crate) fn into_state(self) -> State {
        self.state.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn current(&self, address: &str) -> Option<ResourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).resource(address).cloned()
    }

    fn planned(&self, address: &str) -> Result<&InstanceDiff> {
        self.diffs.get(address).ok_or_else(|| {
            EngineError::internal(format!("no planned diff for '{address}'"), file!(), line!())
        })
    }

    /// Apply one change to the shared state, bump its serial and persist it.
    fn merge(&self, ctx: &EvalContext, change: impl FnOnce(&mut State)) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        change(&mut state);
        self.persist(&mut state)?;
        tracing::trace!(serial = state.serial, "Merged state");
        ctx.hook(ctx.hooks.post_state_update(&state));
        Ok(())
    }

    fn persist(&self, state: &mut State) -> Result<()> {
        state.serial += 1;
        match &self.store {
            Some(store) => store
                .persist(state)
                .map_err(|e| crate::err!(StatePersist { message: e.to_string() })),
            None => Ok(()),
        }
    }

    fn record(&self, ctx: &EvalContext, target: &InstanceTarget, instance: InstanceState, tainted: bool) -> Result<()> {
        let dependencies = self.graph.instance_dependencies(&target.address).into_iter().collect();
        let entry = ResourceState {
            resource_type: target.resource_type.clone(),
            provider: target.provider.clone(),
            dependencies,
            primary: instance,
            tainted,
        };
        self.merge(ctx, |state| {
            state.resources.insert(target.address.clone(), entry);
        })
    }

    fn remove(&self, ctx: &EvalContext, address: &str) -> Result<()> {
        self.merge(ctx, |state| {
            state.resources.remove(address);
        })
    }

    /// Re-diff against the applied values and check the plan still holds.
    async fn fresh_diff(
        &self,
        ctx: &EvalContext,
        target: &InstanceTarget,
        config: &crate::types::Attributes,
        planned: DiffAction,
        current: Option<&ResourceState>,
    ) -> Result<InstanceDiff> {
        let resolved = ctx.resolve_attributes(&target.address, config, &target.prefix, target.count_index)?;
        let provider = ctx.provider(&target.provider)?;
        let prior = match planned {
            DiffAction::Replace => None,
            _ => current.map(|c| &c.primary),
        };
        let mut diff = provider
            .diff(&target.info(), &resolved, prior)
            .await
            .map_err(|e| crate::err!(Diff { address: target.address.clone(), message: e.to_string() }))?;
        if planned == DiffAction::Replace {
            diff.action = DiffAction::Replace;
        } else {
            diff.resolve_action(current);
        }

        if planned == DiffAction::Update && diff.action == DiffAction::Replace {
            return Err(crate::err!(Apply {
                address: target.address.clone(),
                message: "planned an in-place update but applied values force replacement".to_string(),
            }));
        }
        Ok(diff)
    }
}

#[async_trait]
impl InstanceOperation for ApplyOp {
    async fn instance(&self, ctx: &EvalContext, target: InstanceTarget) -> Result<()> {
        let planned = self.planned(&target.address)?.action;
        let current = self.current(&target.address);

        let config = match (&target.config, planned) {
            (_, DiffAction::Destroy) | (None, _) => return Ok(()),
            (Some(config), _) => config,
        };
        if planned == DiffAction::NoOp {
            if let Some(c) = &current {
                ctx.publish(&target.address, c.primary.to_value());
            }
            return Ok(());
        }

        let diff = self.fresh_diff(ctx, &target, config, planned, current.as_ref()).await?;
        if diff.action == DiffAction::NoOp {
            if let Some(c) = &current {
                tracing::debug!(address = %target.address, "Nothing left to apply");
                ctx.publish(&target.address, c.primary.to_value());
                return Ok(());
            }
        }

        ctx.hook(ctx.hooks.pre_apply(&target.address, &diff));
        let provider = ctx.provider(&target.provider)?;
        let prior = match diff.action {
            DiffAction::Create | DiffAction::Replace => None,
            _ => current.as_ref().map(|c| &c.primary),
        };
        tracing::info!(address = %target.address, action = %diff.action, "Applying");

        match provider.apply(&target.info(), prior, &diff).await {
            Ok(Some(instance)) => {
                self.record(ctx, &target, instance.clone(), false)?;
                ctx.publish(&target.address, instance.to_value());
                ctx.hook(ctx.hooks.post_apply(&target.address, Some(&instance), None));
                Ok(())
            }
            Ok(None) => {
                self.remove(ctx, &target.address)?;
                ctx.hook(ctx.hooks.post_apply(&target.address, None, None));
                Ok(())
            }
            Err(ApplyFailure { partial, error }) => {
                let error = crate::err!(Apply {
                    address: target.address.clone(),
                    message: error.to_string(),
                });
                if let Some(partial) = &partial {
                    tracing::warn!(address = %target.address, id = %partial.id, "Recording partially created instance");
                    self.record(ctx, &target, partial.clone(), true)?;
                }
                ctx.hook(ctx.hooks.post_apply(&target.address, partial.as_ref(), Some(&error)));
                Err(error)
            }
        }
    }

    async fn destroy(&self, ctx: &EvalContext, target: DestroyTarget) -> Result<()> {
        if !self.planned(&target.address)?.action.destroys() {
            return Ok(());
        }
        let Some(current) = self.current(&target.address) else {
            return Ok(());
        };

        let diff = InstanceDiff::destroy(&current.primary);
        ctx.hook(ctx.hooks.pre_apply(&target.address, &diff));
        let provider = ctx.provider(&target.provider)?;
        tracing::info!(address = %target.address, "Destroying");

        match provider.apply(&target.info(), Some(&current.primary), &diff).await {
            Ok(None) => {
                self.remove(ctx, &target.address)?;
                ctx.hook(ctx.hooks.post_apply(&target.address, None, None));
                Ok(())
            }
            Ok(Some(left)) => {
                let error = crate::err!(Apply {
                    address: target.address.clone(),
                    message: format!("provider reported instance '{}' still present after destroy", left.id),
                });
                ctx.hook(ctx.hooks.post_apply(&target.address, Some(&left), Some(&error)));
                Err(error)
            }
            Err(ApplyFailure { partial, error }) => {
                let error = crate::err!(Apply {
                    address: target.address.clone(),
                    message: error.to_string(),
                });
                if let Some(left) = &partial {
                    let mut entry = current.clone();
                    entry.primary = left.clone();
                    let address = target.address.clone();
                    self.merge(ctx, move |state| {
                        state.resources.insert(address, entry);
                    })?;
                }
                ctx.hook(ctx.hooks.post_apply(&target.address, partial.as_ref(), Some(&error)));
                Err(error)
            }
        }
    }

    fn output(&self, name: &str, value: &Value) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.outputs.get(name) == Some(value) {
            return Ok(());
        }
        state.outputs.insert(name.to_string(), value.clone());
        self.persist(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;

    #[test]
    fn test_output_merge_persists_only_changes() {
        let store = Arc::new(MemoryStateStore::new(State::new()));
        let op = ApplyOp::new(BTreeMap::new(), Arc::new(Graph::new()), State::new(), Some(store.clone()));

        op.output("ip", &serde_json::json!("10.0.0.1")).unwrap();
        op.output("ip", &serde_json::json!("10.0.0.1")).unwrap();
        op.output("ip", &serde_json::json!("10.0.0.2")).unwrap();

        let state = op.into_state();
        assert_eq!(state.serial, 2);
        assert_eq!(state.outputs["ip"], serde_json::json!("10.0.0.2"));
        // initial snapshot plus two changes
        assert_eq!(store.snapshots().len(), 3);
    }

    #[test]
    fn test_into_result_keeps_state_on_success() {
        let result = ApplyResult {
            state: State::new(),
            outcome: WalkOutcome { statuses: BTreeMap::new(), errors: crate::error::MultiError::new(vec![]) },
        };
        assert!(result.is_success());
        assert!(result.into_result().unwrap().is_empty());
    }

    #[test]
    fn test_missing_planned_diff_is_internal() {
        let op = ApplyOp::new(BTreeMap::new(), Arc::new(Graph::new()), State::new(), None);
        assert!(matches!(op.planned("null_resource.a"), Err(EngineError::Internal { .. })));
    }
}
