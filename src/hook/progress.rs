//! Terminal progress for apply.

use super::{Hook, HookAction, Operation};
use crate::error::EngineError;
use crate::graph::Graph;
use crate::state::InstanceState;
use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar over the instances an apply walk may touch.
#[derive(Debug)]
pub struct ProgressHook {
    bar: ProgressBar,
}

impl Default for ProgressHook {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHook {
    /// A hidden bar; it is sized and shown when an apply walk starts.
    #[must_use]
    pub fn new() -> Self {
        Self { bar: ProgressBar::hidden() }
    }

    /// Finish the bar with a closing message.
    pub fn finish(&self, message: impl Into<String>) {
        self.bar.finish_with_message(message.into());
    }
}

impl Hook for ProgressHook {
    fn pre_walk(&self, operation: Operation, graph: &Graph) -> HookAction {
        if operation != Operation::Apply {
            return HookAction::Continue;
        }
        let total = graph.vertices().filter(|v| v.as_applyable().is_some()).count();
        self.bar.set_length(total as u64);
        self.bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            self.bar.set_style(style.progress_chars("#>-"));
        }
        HookAction::Continue
    }

    fn pre_apply(&self, address: &str, _diff: &crate::diff::InstanceDiff) -> HookAction {
        self.bar.set_message(format!("Applying {address}"));
        HookAction::Continue
    }

    fn post_apply(
        &self,
        address: &str,
        _state: Option<&InstanceState>,
        error: Option<&EngineError>,
    ) -> HookAction {
        if let Some(e) = error {
            self.bar.println(format!("{address}: {e}"));
        }
        self.bar.inc(1);
        HookAction::Continue
    }
}
