//! Plain text report generator.

use crate::config::Config;
use crate::diff::{AttrDiff, DiffAction, InstanceDiff};
use crate::engine::{ApplyResult, Plan};
use crate::error::{Result, VertexFailure};
use crate::reporter::ReportGenerator;
use crate::types::is_unknown;
use colored::Colorize;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use serde_json::Value;

/// Text report generator for CLI output.
pub struct TextReporter {
    /// Whether to use colors
    use_colors: bool,
    /// Whether to show verbose output
    verbose: bool,
}

impl TextReporter {
    /// Create a new text reporter.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self { use_colors: config.output.colored, verbose: config.output.verbose }
    }
}

impl ReportGenerator for TextReporter {
    fn plan(&self, plan: &Plan) -> Result<String> {
        let mut output = String::new();

        output.push_str(&self.format_header("Graphform Plan"));
        output.push('\n');

        let summary = plan.summary();
        if summary.has_changes() {
            output.push_str(&self.format_changes(plan));
            output.push('\n');
        }

        output.push_str(&self.section("Summary"));
        if summary.has_changes() {
            output.push_str(&format!(
                "  Plan: {} to add, {} to change, {} to replace, {} to destroy.\n",
                self.count(summary.create, Color::Green),
                self.count(summary.update, Color::Yellow),
                self.count(summary.replace, Color::Magenta),
                self.count(summary.destroy, Color::Red),
            ));
        } else {
            output.push_str("  No changes. The state matches the description.\n");
        }
        if self.verbose {
            output.push_str(&format!(
                "  {} unchanged | planned against serial {}\n",
                summary.no_op, plan.prior_serial
            ));
        }

        Ok(output)
    }

    fn apply(&self, result: &ApplyResult) -> Result<String> {
        let mut output = String::new();

        output.push_str(&self.format_header("Graphform Apply"));
        output.push('\n');

        output.push_str(&self.section("Summary"));
        let errors = &result.outcome.errors;
        output.push_str(&format!(
            "  {} resources | {} outputs | serial {}\n",
            result.state.resources.len(),
            result.state.outputs.len(),
            result.state.serial
        ));
        output.push_str(&format!(
            "  {} failed | {} skipped | {} cancelled\n",
            self.count(errors.failed().len(), Color::Red),
            self.count(errors.skipped().len(), Color::Yellow),
            self.count(errors.cancelled().len(), Color::Yellow),
        ));

        if !errors.is_empty() {
            output.push('\n');
            output.push_str(&self.format_errors(result));
        }

        if !result.state.resources.is_empty() && (self.verbose || !errors.is_empty()) {
            output.push('\n');
            output.push_str(&self.format_resources(result));
        }

        if !result.state.outputs.is_empty() {
            output.push('\n');
            output.push_str(&self.format_outputs(result));
        }

        output.push_str(&self.format_footer(result));
        Ok(output)
    }
}

impl TextReporter {
    /// Format the report header.
    fn format_header(&self, title: &str) -> String {
        let version = format!("v{}", env!("CARGO_PKG_VERSION"));
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");

        if self.use_colors {
            format!(
                "\n{} {} {}\n{}\n",
                title.bright_white().bold(),
                version.dimmed(),
                format!("({timestamp})").dimmed(),
                "=".repeat(80).bright_blue(),
            )
        } else {
            format!("\n{title} {version} ({timestamp})\n{}\n", "=".repeat(80))
        }
    }

    fn section(&self, title: &str) -> String {
        let title = if self.use_colors { title.bright_cyan().bold().to_string() } else { title.to_string() };
        format!("\n{title}\n{}\n", "-".repeat(80))
    }

    fn count(&self, n: usize, color: Color) -> String {
        if !self.use_colors || n == 0 {
            return n.to_string();
        }
        let text = n.to_string();
        match color {
            Color::Green => text.green().bold().to_string(),
            Color::Yellow => text.yellow().bold().to_string(),
            Color::Magenta => text.magenta().bold().to_string(),
            _ => text.red().bold().to_string(),
        }
    }

    /// Format every instance that changes, with its changed attributes.
    fn format_changes(&self, plan: &Plan) -> String {
        let mut output = self.section("Changes");

        for (address, diff) in plan.changes() {
            let line = format!("{} {address}", diff.action.symbol());
            let line = if self.use_colors {
                match diff.action {
                    DiffAction::Create => line.green().to_string(),
                    DiffAction::Update => line.yellow().to_string(),
                    DiffAction::Replace => line.magenta().to_string(),
                    DiffAction::Destroy => line.red().to_string(),
                    DiffAction::NoOp => line,
                }
            } else {
                line
            };
            output.push_str(&format!("  {line}\n"));
            output.push_str(&self.format_attributes(diff));
        }

        output
    }

    fn format_attributes(&self, diff: &InstanceDiff) -> String {
        let mut output = String::new();
        let width = diff.attributes.keys().map(String::len).max().unwrap_or(0);

        for (name, attr) in diff.attributes.iter().filter(|(_, a)| self.verbose || a.is_change()) {
            let change = describe_change(diff.action, attr);
            let forces = if attr.force_new && attr.is_change() && diff.action == DiffAction::Replace {
                if self.use_colors {
                    format!(" {}", "(forces new resource)".red())
                } else {
                    " (forces new resource)".to_string()
                }
            } else {
                String::new()
            };
            output.push_str(&format!("      {name:<width$}  {change}{forces}\n"));
        }

        output
    }

    /// Format the failed, skipped and cancelled vertices.
    fn format_errors(&self, result: &ApplyResult) -> String {
        let mut output = self.section("Errors");

        let mut table = Table::new();
        table
            .load_preset(comfy_table::presets::UTF8_BORDERS_ONLY)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Vertex", "Status", "Detail"]);

        for entry in result.outcome.errors.errors() {
            let (status, color, detail) = match &entry.failure {
                VertexFailure::Failed(e) => ("FAILED", Color::Red, e.to_string()),
                VertexFailure::Skipped { because } => ("SKIPPED", Color::Yellow, format!("'{because}' failed")),
                VertexFailure::Cancelled => ("CANCELLED", Color::Yellow, String::new()),
            };
            let status = if self.use_colors { Cell::new(status).fg(color) } else { Cell::new(status) };
            table.add_row(vec![Cell::new(&entry.vertex), status, Cell::new(truncate(&detail, 100))]);
        }

        output.push_str(&table.to_string());
        output.push('\n');
        output
    }

    /// Format the resources recorded in the state.
    fn format_resources(&self, result: &ApplyResult) -> String {
        let mut output = self.section("Resources");

        let mut table = Table::new();
        table
            .load_preset(comfy_table::presets::UTF8_BORDERS_ONLY)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Address", "ID", "Status"]);

        for (address, resource) in &result.state.resources {
            let status = match (resource.tainted, self.use_colors) {
                (true, true) => Cell::new("tainted").fg(Color::Red),
                (true, false) => Cell::new("tainted"),
                (false, true) => Cell::new("ok").fg(Color::Green),
                (false, false) => Cell::new("ok"),
            };
            table.add_row(vec![Cell::new(address), Cell::new(truncate(&resource.primary.id, 40)), status]);
        }

        output.push_str(&table.to_string());
        output.push('\n');
        output
    }

    fn format_outputs(&self, result: &ApplyResult) -> String {
        let mut output = self.section("Outputs");
        for (name, value) in &result.state.outputs {
            output.push_str(&format!("  {name} = {}\n", render_value(Some(value))));
        }
        output
    }

    /// Format the report footer.
    fn format_footer(&self, result: &ApplyResult) -> String {
        let status = if result.is_success() {
            if self.use_colors {
                "Apply complete".green().bold().to_string()
            } else {
                "Apply complete".to_string()
            }
        } else if self.use_colors {
            "Apply failed; the state records every change made before the failure".red().bold().to_string()
        } else {
            "Apply failed; the state records every change made before the failure".to_string()
        };

        format!("\n{status}\n\n")
    }
}

fn describe_change(action: DiffAction, attr: &AttrDiff) -> String {
    match action {
        DiffAction::Create => render_new(attr),
        DiffAction::Destroy => format!("{} => (none)", render_value(attr.old.as_ref())),
        _ if attr.is_change() => format!("{} => {}", render_value(attr.old.as_ref()), render_new(attr)),
        _ => render_value(attr.old.as_ref()),
    }
}

fn render_new(attr: &AttrDiff) -> String {
    if attr.computed {
        "(known after apply)".to_string()
    } else {
        render_value(attr.new.as_ref())
    }
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        None => "(none)".to_string(),
        Some(v) if is_unknown(v) => "(known after apply)".to_string(),
        Some(Value::String(s)) => truncate(&format!("{s:?}"), 60),
        Some(other) => truncate(&other.to_string(), 60),
    }
}

/// Truncate a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PLAN_VERSION;
    use crate::error::{MultiError, VertexError};
    use crate::graph::Graph;
    use crate::state::{InstanceState, ResourceState, State};
    use crate::walk::WalkOutcome;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn reporter() -> TextReporter {
        TextReporter { use_colors: false, verbose: false }
    }

    fn plan_with(diffs: BTreeMap<String, InstanceDiff>) -> Plan {
        Plan {
            version: PLAN_VERSION,
            graph: Graph::new(),
            diffs,
            variables: BTreeMap::new(),
            prior_serial: 3,
            prior_state: State::new(),
        }
    }

    fn attr(old: Option<Value>, new: Option<Value>, force_new: bool) -> AttrDiff {
        AttrDiff { old, new, computed: false, force_new }
    }

    #[test]
    fn test_plan_report_lists_changes() {
        let mut diffs = BTreeMap::new();
        diffs.insert(
            "null_resource.a".to_string(),
            InstanceDiff {
                action: DiffAction::Replace,
                attributes: BTreeMap::from([(
                    "triggers".to_string(),
                    attr(Some(json!({"v": "1"})), Some(json!({"v": "2"})), true),
                )]),
            },
        );
        diffs.insert(
            "null_resource.b".to_string(),
            InstanceDiff {
                action: DiffAction::Create,
                attributes: BTreeMap::from([(
                    "outputs".to_string(),
                    AttrDiff { old: None, new: None, computed: true, force_new: false },
                )]),
            },
        );
        diffs.insert("null_resource.c".to_string(), InstanceDiff::default());

        let text = reporter().plan(&plan_with(diffs)).unwrap();

        assert!(text.contains("Graphform Plan"));
        assert!(text.contains("-/+ null_resource.a"));
        assert!(text.contains("(forces new resource)"));
        assert!(text.contains("+ null_resource.b"));
        assert!(text.contains("(known after apply)"));
        assert!(!text.contains("null_resource.c"));
        assert!(text.contains("Plan: 1 to add, 0 to change, 1 to replace, 0 to destroy."));
    }

    #[test]
    fn test_plan_report_without_changes() {
        let text = reporter().plan(&plan_with(BTreeMap::new())).unwrap();
        assert!(text.contains("No changes."));
        assert!(!text.contains("Changes\n"));
    }

    #[test]
    fn test_apply_report_shows_failures() {
        let mut state = State::new();
        state.serial = 2;
        state.resources.insert(
            "null_resource.a".to_string(),
            ResourceState {
                resource_type: "null_resource".to_string(),
                provider: "provider.null".to_string(),
                dependencies: vec![],
                primary: InstanceState::new("abc", BTreeMap::new()),
                tainted: true,
            },
        );
        let errors = MultiError::new(vec![
            VertexError {
                vertex: "null_resource.a".to_string(),
                failure: VertexFailure::Failed(crate::err!(Apply {
                    address: "null_resource.a".to_string(),
                    message: "boom".to_string(),
                })),
            },
            VertexError {
                vertex: "null_resource.b".to_string(),
                failure: VertexFailure::Skipped { because: "null_resource.a".to_string() },
            },
        ]);
        let result = ApplyResult { state, outcome: WalkOutcome { statuses: BTreeMap::new(), errors } };

        let text = reporter().apply(&result).unwrap();
        assert!(text.contains("1 failed | 1 skipped | 0 cancelled"));
        assert!(text.contains("FAILED"));
        assert!(text.contains("SKIPPED"));
        assert!(text.contains("tainted"));
        assert!(text.contains("Apply failed"));
    }

    #[test]
    fn test_render_value() {
        assert_eq!(render_value(None), "(none)");
        assert_eq!(render_value(Some(&crate::types::unknown())), "(known after apply)");
        assert_eq!(render_value(Some(&json!("x"))), "\"x\"");
        assert_eq!(render_value(Some(&json!(3))), "3");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 8), "hello...");
    }
}
