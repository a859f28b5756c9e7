//! Debug archive.
//!
//! Every hook event becomes one JSON file and every walked graph one DOT
//! file, numbered in the order they happened:
//!
//! ```text
//! debug-20260101T120000Z/
//! ├── 0001-plan-hook-PreDiff.json
//! ├── 0002-plan-hook-PostDiff.json
//! └── graphs/
//!     └── 0000-plan-graph.dot
//! ```

use super::{Hook, HookAction, Operation};
use crate::diff::InstanceDiff;
use crate::error::{EngineError, Result, ResultExt};
use crate::graph::{export_dot, Graph};
use crate::state::{InstanceState, State};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Writes hook events and graphs into a timestamped directory.
#[derive(Debug)]
pub struct DebugHook {
    dir: PathBuf,
    step: AtomicU64,
    phase: Mutex<String>,
}

impl DebugHook {
    /// Create `debug-<timestamp>/` under `parent`.
    pub fn new(parent: impl AsRef<Path>) -> Result<Self> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let dir = parent.as_ref().join(format!("debug-{stamp}"));
        let graphs = dir.join("graphs");
        std::fs::create_dir_all(&graphs).with_path(&graphs)?;
        tracing::info!(dir = %dir.display(), "Writing debug archive");
        Ok(Self { dir, step: AtomicU64::new(0), phase: Mutex::new("build".to_string()) })
    }

    /// The archive directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_step(&self) -> u64 {
        self.step.fetch_add(1, Ordering::SeqCst)
    }

    fn phase(&self) -> String {
        self.phase.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write_event(&self, event: &str, body: &Value) {
        let name = format!("{:04}-{}-hook-{event}.json", self.next_step(), self.phase());
        let path = self.dir.join(name);
        let written = serde_json::to_string_pretty(body)
            .map_err(EngineError::from)
            .and_then(|content| std::fs::write(&path, content).with_path(&path));
        if let Err(e) = written {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write debug event");
        }
    }
}

fn error_text(error: Option<&EngineError>) -> Value {
    error.map_or(Value::Null, |e| Value::String(e.to_string()))
}

impl Hook for DebugHook {
    fn pre_walk(&self, operation: Operation, graph: &Graph) -> HookAction {
        let phase = operation.to_string();
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase.clone();
        let path = self
            .dir
            .join("graphs")
            .join(format!("{:04}-{phase}-graph.dot", self.next_step()));
        if let Err(e) = std::fs::write(&path, export_dot(graph, &phase)) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write debug graph");
        }
        HookAction::Continue
    }

    fn pre_diff(&self, address: &str) -> HookAction {
        self.write_event("PreDiff", &json!({ "address": address }));
        HookAction::Continue
    }

    fn post_diff(&self, address: &str, result: std::result::Result<&InstanceDiff, &EngineError>) -> HookAction {
        let body = match result {
            Ok(diff) => json!({ "address": address, "diff": diff }),
            Err(e) => json!({ "address": address, "error": e.to_string() }),
        };
        self.write_event("PostDiff", &body);
        HookAction::Continue
    }

    fn pre_apply(&self, address: &str, diff: &InstanceDiff) -> HookAction {
        self.write_event("PreApply", &json!({ "address": address, "diff": diff }));
        HookAction::Continue
    }

    fn post_apply(
        &self,
        address: &str,
        state: Option<&InstanceState>,
        error: Option<&EngineError>,
    ) -> HookAction {
        self.write_event(
            "PostApply",
            &json!({ "address": address, "state": state, "error": error_text(error) }),
        );
        HookAction::Continue
    }

    fn pre_refresh(&self, address: &str) -> HookAction {
        self.write_event("PreRefresh", &json!({ "address": address }));
        HookAction::Continue
    }

    fn post_refresh(&self, address: &str, state: Option<&InstanceState>) -> HookAction {
        self.write_event("PostRefresh", &json!({ "address": address, "state": state }));
        HookAction::Continue
    }

    fn post_state_update(&self, state: &State) -> HookAction {
        self.write_event("PostStateUpdate", &json!({ "serial": state.serial, "state": state }));
        HookAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Vertex;

    fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_events_are_numbered_by_phase() {
        let temp = tempfile::tempdir().unwrap();
        let hook = DebugHook::new(temp.path()).unwrap();

        let mut graph = Graph::new();
        graph.add_vertex(Vertex::root()).unwrap();
        hook.pre_walk(Operation::Plan, &graph);
        hook.pre_diff("null_resource.a");
        hook.post_diff("null_resource.a", Ok(&InstanceDiff::default()));

        assert_eq!(
            files(hook.dir()),
            vec!["0001-plan-hook-PreDiff.json", "0002-plan-hook-PostDiff.json", "graphs"]
        );
        assert_eq!(files(&hook.dir().join("graphs")), vec!["0000-plan-graph.dot"]);

        let event: Value = serde_json::from_str(
            &std::fs::read_to_string(hook.dir().join("0002-plan-hook-PostDiff.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(event["address"], "null_resource.a");
        assert_eq!(event["diff"]["action"], "no_op");
    }

    #[test]
    fn test_separate_hooks_do_not_share_counters() {
        let temp = tempfile::tempdir().unwrap();
        let first = DebugHook::new(temp.path().join("one")).unwrap();
        let second = DebugHook::new(temp.path().join("two")).unwrap();
        first.pre_refresh("a");
        second.pre_refresh("a");
        assert_eq!(files(first.dir())[0], "0000-build-hook-PreRefresh.json");
        assert_eq!(files(second.dir())[0], "0000-build-hook-PreRefresh.json");
    }
}
