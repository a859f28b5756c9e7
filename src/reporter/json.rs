//! JSON report generator.

use crate::config::Config;
use crate::diff::{AttrDiff, DiffAction};
use crate::engine::{ApplyResult, Plan, PlanSummary};
use crate::error::{Result, VertexFailure};
use crate::reporter::ReportGenerator;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON report generator.
pub struct JsonReporter {
    /// Whether to pretty-print the output
    pretty: bool,
}

impl JsonReporter {
    /// Create a new JSON reporter.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self { pretty: config.output.pretty }
    }

    fn render<T: Serialize>(&self, report: &T) -> Result<String> {
        let json = if self.pretty {
            serde_json::to_string_pretty(report)
        } else {
            serde_json::to_string(report)
        };

        json.map_err(|e| crate::err!(Serialization {
            message: format!("Failed to serialize JSON report: {e}"),
        }))
    }
}

impl ReportGenerator for JsonReporter {
    fn plan(&self, plan: &Plan) -> Result<String> {
        self.render(&JsonPlanReport::from(plan))
    }

    fn apply(&self, result: &ApplyResult) -> Result<String> {
        self.render(&JsonApplyReport::from(result))
    }
}

/// Report metadata.
#[derive(Debug, Serialize)]
pub struct ReportMetadata {
    /// Graphform version
    pub version: String,
    /// Report generation timestamp
    pub timestamp: String,
}

impl ReportMetadata {
    fn now() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// JSON plan report.
#[derive(Debug, Serialize)]
pub struct JsonPlanReport {
    /// Report metadata
    pub metadata: ReportMetadata,
    /// Instances per action
    pub summary: PlanSummary,
    /// Serial of the state the plan was computed against
    pub prior_serial: u64,
    /// Every instance that changes
    pub changes: Vec<JsonChange>,
}

/// One changing instance.
#[derive(Debug, Serialize)]
pub struct JsonChange {
    /// Instance address
    pub address: String,
    /// What happens to it
    pub action: DiffAction,
    /// Changed attributes
    pub attributes: BTreeMap<String, AttrDiff>,
}

impl From<&Plan> for JsonPlanReport {
    fn from(plan: &Plan) -> Self {
        Self {
            metadata: ReportMetadata::now(),
            summary: plan.summary(),
            prior_serial: plan.prior_serial,
            changes: plan
                .changes()
                .map(|(address, diff)| JsonChange {
                    address: address.to_string(),
                    action: diff.action,
                    attributes: diff
                        .attributes
                        .iter()
                        .filter(|(_, a)| a.is_change())
                        .map(|(k, a)| (k.clone(), a.clone()))
                        .collect(),
                })
                .collect(),
        }
    }
}

/// JSON apply report.
#[derive(Debug, Serialize)]
pub struct JsonApplyReport {
    /// Report metadata
    pub metadata: ReportMetadata,
    /// Whether every vertex succeeded
    pub success: bool,
    /// Serial of the resulting state
    pub serial: u64,
    /// Managed instances after the apply
    pub resources: Vec<JsonResource>,
    /// Output values after the apply
    pub outputs: BTreeMap<String, Value>,
    /// Vertices that did not succeed
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<JsonVertexError>,
}

/// One managed instance.
#[derive(Debug, Serialize)]
pub struct JsonResource {
    /// Instance address
    pub address: String,
    /// Resource type
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Provider-assigned id
    pub id: String,
    /// Whether the instance was only partially created
    pub tainted: bool,
}

/// One failed, skipped or cancelled vertex.
#[derive(Debug, Serialize)]
pub struct JsonVertexError {
    /// Vertex name
    pub vertex: String,
    /// `failed`, `skipped` or `cancelled`
    pub status: &'static str,
    /// Error message, or the failed dependency for a skip
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&ApplyResult> for JsonApplyReport {
    fn from(result: &ApplyResult) -> Self {
        Self {
            metadata: ReportMetadata::now(),
            success: result.is_success(),
            serial: result.state.serial,
            resources: result
                .state
                .resources
                .iter()
                .map(|(address, r)| JsonResource {
                    address: address.clone(),
                    resource_type: r.resource_type.clone(),
                    id: r.primary.id.clone(),
                    tainted: r.tainted,
                })
                .collect(),
            outputs: result.state.outputs.clone(),
            errors: result
                .outcome
                .errors
                .errors()
                .iter()
                .map(|e| {
                    let (status, message) = match &e.failure {
                        VertexFailure::Failed(err) => ("failed", Some(err.to_string())),
                        VertexFailure::Skipped { because } => ("skipped", Some(format!("'{because}' failed"))),
                        VertexFailure::Cancelled => ("cancelled", None),
                    };
                    JsonVertexError { vertex: e.vertex.clone(), status, message }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::InstanceDiff;
    use crate::engine::PLAN_VERSION;
    use crate::error::{MultiError, VertexError};
    use crate::graph::Graph;
    use crate::state::State;
    use crate::walk::WalkOutcome;
    use serde_json::json;

    #[test]
    fn test_plan_report_only_lists_changes() {
        let mut diffs = BTreeMap::new();
        diffs.insert(
            "null_resource.a".to_string(),
            InstanceDiff {
                action: DiffAction::Update,
                attributes: BTreeMap::from([
                    ("inputs".to_string(), AttrDiff { old: Some(json!(1)), new: Some(json!(2)), computed: false, force_new: false }),
                    ("kept".to_string(), AttrDiff { old: Some(json!(1)), new: Some(json!(1)), computed: false, force_new: false }),
                ]),
            },
        );
        diffs.insert("null_resource.b".to_string(), InstanceDiff::default());
        let plan = Plan {
            version: PLAN_VERSION,
            graph: Graph::new(),
            diffs,
            variables: BTreeMap::new(),
            prior_serial: 7,
            prior_state: State::new(),
        };

        let reporter = JsonReporter { pretty: false };
        let report: Value = serde_json::from_str(&reporter.plan(&plan).unwrap()).unwrap();

        assert_eq!(report["prior_serial"], 7);
        assert_eq!(report["summary"]["update"], 1);
        assert_eq!(report["summary"]["no_op"], 1);
        let changes = report["changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["action"], "update");
        assert!(changes[0]["attributes"].get("kept").is_none());
        assert_eq!(changes[0]["attributes"]["inputs"]["new"], 2);
    }

    #[test]
    fn test_apply_report_errors() {
        let errors = MultiError::new(vec![VertexError {
            vertex: "null_resource.b".to_string(),
            failure: VertexFailure::Cancelled,
        }]);
        let result = ApplyResult {
            state: State::new(),
            outcome: WalkOutcome { statuses: BTreeMap::new(), errors },
        };

        let reporter = JsonReporter { pretty: true };
        let report: Value = serde_json::from_str(&reporter.apply(&result).unwrap()).unwrap();

        assert_eq!(report["success"], false);
        assert_eq!(report["errors"][0]["status"], "cancelled");
        assert!(report["errors"][0].get("message").is_none());
    }
}
