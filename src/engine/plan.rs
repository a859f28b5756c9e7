//! Diff walk and the plan artifact.

use super::eval::{EvalContext, InstanceOperation, InstanceTarget};
use crate::diff::{DiffAction, InstanceDiff};
use crate::error::{Result, ResultExt};
use crate::graph::Graph;
use crate::hook::Hook;
use crate::state::{InstanceState, State};
use crate::types::unknown;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Plan file format version.
pub const PLAN_VERSION: u32 = 1;

/// The outcome of a diff walk: the graph to apply and one diff per instance.
///
/// A plan is self-contained. It carries the exact graph it was computed on
/// (destroy vertices included) and the state it was computed against, so an
/// apply in another process reproduces the planned ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Format version
    pub version: u32,
    /// Graph walked by apply
    pub graph: Graph,
    /// Instance address to diff
    pub diffs: BTreeMap<String, InstanceDiff>,
    /// Variable values the plan was computed with
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Serial of the state the plan was computed against
    pub prior_serial: u64,
    /// That state, after any refresh
    pub prior_state: State,
}

/// Number of instances per action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub destroy: usize,
    pub no_op: usize,
}

impl PlanSummary {
    /// Whether applying would change anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.create + self.update + self.replace + self.destroy > 0
    }
}

impl Plan {
    /// Count actions.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for diff in self.diffs.values() {
            match diff.action {
                DiffAction::Create => summary.create += 1,
                DiffAction::Update => summary.update += 1,
                DiffAction::Replace => summary.replace += 1,
                DiffAction::Destroy => summary.destroy += 1,
                DiffAction::NoOp => summary.no_op += 1,
            }
        }
        summary
    }

    /// Diffs that change something, by address.
    pub fn changes(&self) -> impl Iterator<Item = (&str, &InstanceDiff)> {
        self.diffs
            .iter()
            .filter(|(_, d)| d.action != DiffAction::NoOp)
            .map(|(a, d)| (a.as_str(), d))
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a plan from JSON.
    pub fn from_json(content: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(content)?;
        if plan.version != PLAN_VERSION {
            return Err(crate::err!(Serialization {
                message: format!("unsupported plan version {} (expected {PLAN_VERSION})", plan.version),
            }));
        }
        Ok(plan)
    }

    /// Write the plan to a file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?).with_path(path)?;
        tracing::info!(path = %path.display(), diffs = self.diffs.len(), "Wrote plan");
        Ok(())
    }

    /// Read a plan from a file.
    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        Self::from_json(&content)
    }
}

/// Diffs every instance against the prior state.
pub(crate) struct PlanOp {
    prior: State,
    diffs: Mutex<BTreeMap<String, InstanceDiff>>,
}

impl PlanOp {
    pub(crate) fn new(prior: State) -> Self {
        Self { prior, diffs: Mutex::new(BTreeMap::new()) }
    }

    pub(crate) fn into_diffs(self) -> BTreeMap<String, InstanceDiff> {
        self.diffs.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, address: &str, diff: InstanceDiff) {
        self.diffs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.to_string(), diff);
    }

    async fn diff(&self, ctx: &EvalContext, target: &InstanceTarget, config: &crate::types::Attributes) -> Result<InstanceDiff> {
        let prior = self.prior.resource(&target.address);
        let resolved = ctx.resolve_attributes(&target.address, config, &target.prefix, target.count_index)?;
        let provider = ctx.provider(&target.provider)?;
        let wrap = |e: crate::error::EngineError| {
            crate::err!(Diff { address: target.address.clone(), message: e.to_string() })
        };

        let mut diff = provider
            .diff(&target.info(), &resolved, prior.map(|p| &p.primary))
            .await
            .map_err(wrap)?;
        diff.resolve_action(prior);

        if diff.action == DiffAction::Replace {
            // Diff against nothing so every attribute of the new instance is
            // planned, keeping the old values for display
            let mut fresh = provider.diff(&target.info(), &resolved, None).await.map_err(wrap)?;
            fresh.action = DiffAction::Replace;
            if let Some(p) = prior {
                for (name, change) in &mut fresh.attributes {
                    change.old = p.primary.attributes.get(name).cloned();
                    change.force_new |= diff.attributes.get(name).is_some_and(|c| c.force_new);
                }
            }
            diff = fresh;
        }
        Ok(diff)
    }
}

/// Value an instance publishes once planned: the planned attributes plus an
/// id that stays known only when the instance is kept.
fn planned_value(diff: &InstanceDiff, prior: Option<&InstanceState>) -> Value {
    let attributes = diff.planned_attributes(prior);
    let mut map: serde_json::Map<String, Value> = attributes.into_iter().collect();
    let id = match (diff.action, prior) {
        (DiffAction::Update | DiffAction::NoOp, Some(p)) => Value::String(p.id.clone()),
        _ => unknown(),
    };
    map.insert("id".to_string(), id);
    Value::Object(map)
}

#[async_trait]
impl InstanceOperation for PlanOp {
    async fn instance(&self, ctx: &EvalContext, target: InstanceTarget) -> Result<()> {
        let prior = self.prior.resource(&target.address).map(|p| &p.primary);

        let Some(config) = &target.config else {
            // Orphan: no longer declared
            let diff = match prior {
                Some(p) => {
                    ctx.publish(&target.address, p.to_value());
                    InstanceDiff::destroy(p)
                }
                None => InstanceDiff::default(),
            };
            tracing::debug!(address = %target.address, action = %diff.action, "Planned orphan");
            self.record(&target.address, diff);
            return Ok(());
        };

        ctx.hook(ctx.hooks.pre_diff(&target.address));
        let result = self.diff(ctx, &target, config).await;
        ctx.hook(ctx.hooks.post_diff(&target.address, result.as_ref()));
        let diff = result?;

        tracing::debug!(
            address = %target.address,
            action = %diff.action,
            changes = diff.attributes.values().filter(|a| a.is_change()).count(),
            "Planned instance"
        );
        ctx.publish(&target.address, planned_value(&diff, prior));
        self.record(&target.address, diff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::AttrDiff;
    use crate::types::{Attributes, UNKNOWN};
    use serde_json::json;

    fn change(old: Option<Value>, new: Option<Value>, computed: bool) -> AttrDiff {
        AttrDiff { old, new, computed, force_new: false }
    }

    #[test]
    fn test_planned_value_keeps_id_on_update() {
        let prior = InstanceState::new("i-1", serde_json::from_value(json!({"size": 1})).unwrap());
        let mut diff = InstanceDiff { action: DiffAction::Update, attributes: BTreeMap::new() };
        diff.attributes.insert("size".to_string(), change(Some(json!(1)), Some(json!(2)), false));
        diff.attributes.insert("ip".to_string(), change(None, Some(json!(UNKNOWN)), true));

        let value = planned_value(&diff, Some(&prior));
        assert_eq!(value, json!({"id": "i-1", "size": 2, "ip": UNKNOWN}));

        diff.action = DiffAction::Replace;
        assert_eq!(planned_value(&diff, Some(&prior))["id"], json!(UNKNOWN));
    }

    #[test]
    fn test_summary_counts_actions() {
        let mut diffs = BTreeMap::new();
        diffs.insert("a".to_string(), InstanceDiff { action: DiffAction::Create, attributes: BTreeMap::new() });
        diffs.insert("b".to_string(), InstanceDiff::default());
        diffs.insert("c".to_string(), InstanceDiff::destroy(&InstanceState::new("c", Attributes::new())));
        let plan = Plan {
            version: PLAN_VERSION,
            graph: Graph::new(),
            diffs,
            variables: BTreeMap::new(),
            prior_serial: 0,
            prior_state: State::new(),
        };

        let summary = plan.summary();
        assert_eq!(summary, PlanSummary { create: 1, update: 0, replace: 0, destroy: 1, no_op: 1 });
        assert!(summary.has_changes());
        assert_eq!(plan.changes().map(|(a, _)| a).collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let plan = Plan {
            version: 99,
            graph: Graph::new(),
            diffs: BTreeMap::new(),
            variables: BTreeMap::new(),
            prior_serial: 0,
            prior_state: State::new(),
        };
        let json = serde_json::to_string(&plan).unwrap();
        assert!(Plan::from_json(&json).is_err());
    }
}
