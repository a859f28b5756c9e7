//! Walk observers.
//!
//! Hooks are called inline from the walk callbacks, so they must return
//! quickly. Returning [`HookAction::Halt`] cancels the walk: vertices already
//! running finish, nothing new starts.
//!
//! Hooks are explicit values handed to the engine; there is no process-wide
//! hook.

mod debug;
mod progress;

pub use debug::DebugHook;
pub use progress::ProgressHook;

use crate::diff::InstanceDiff;
use crate::error::EngineError;
use crate::graph::Graph;
use crate::state::{InstanceState, State};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What the walk should do after a hook returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookAction {
    #[default]
    Continue,
    Halt,
}

impl HookAction {
    /// `Halt` if either is `Halt`.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        if self == Self::Halt || other == Self::Halt {
            Self::Halt
        } else {
            Self::Continue
        }
    }
}

/// The operation a walk performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Validate,
    Refresh,
    Plan,
    Apply,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validate => write!(f, "validate"),
            Self::Refresh => write!(f, "refresh"),
            Self::Plan => write!(f, "plan"),
            Self::Apply => write!(f, "apply"),
        }
    }
}

/// Observer of walk events. Every method defaults to `Continue`.
#[allow(unused_variables)]
pub trait Hook: Send + Sync {
    /// A walk is about to start on this graph.
    fn pre_walk(&self, operation: Operation, graph: &Graph) -> HookAction {
        HookAction::Continue
    }

    fn pre_diff(&self, address: &str) -> HookAction {
        HookAction::Continue
    }

    fn post_diff(&self, address: &str, result: Result<&InstanceDiff, &EngineError>) -> HookAction {
        HookAction::Continue
    }

    fn pre_apply(&self, address: &str, diff: &InstanceDiff) -> HookAction {
        HookAction::Continue
    }

    /// `state` is `None` after a destroy; `error` is set when the apply failed.
    fn post_apply(
        &self,
        address: &str,
        state: Option<&InstanceState>,
        error: Option<&EngineError>,
    ) -> HookAction {
        HookAction::Continue
    }

    fn pre_refresh(&self, address: &str) -> HookAction {
        HookAction::Continue
    }

    fn post_refresh(&self, address: &str, state: Option<&InstanceState>) -> HookAction {
        HookAction::Continue
    }

    /// A state snapshot was merged and persisted.
    fn post_state_update(&self, state: &State) -> HookAction {
        HookAction::Continue
    }
}

/// Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl Hook for NoopHook {}

/// Fans events out to several hooks. Halts if any hook halts; every hook
/// still sees the event.
#[derive(Clone, Default)]
pub struct Hooks {
    hooks: Vec<Arc<dyn Hook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").field("count", &self.hooks.len()).finish()
    }
}

impl Hooks {
    /// No hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook.
    pub fn push(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    /// Number of hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether there are no hooks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn fan_out(&self, f: impl Fn(&dyn Hook) -> HookAction) -> HookAction {
        self.hooks
            .iter()
            .fold(HookAction::Continue, |acc, hook| acc.and(f(hook.as_ref())))
    }
}

impl Hook for Hooks {
    fn pre_walk(&self, operation: Operation, graph: &Graph) -> HookAction {
        self.fan_out(|h| h.pre_walk(operation, graph))
    }

    fn pre_diff(&self, address: &str) -> HookAction {
        self.fan_out(|h| h.pre_diff(address))
    }

    fn post_diff(&self, address: &str, result: Result<&InstanceDiff, &EngineError>) -> HookAction {
        self.fan_out(|h| h.post_diff(address, result))
    }

    fn pre_apply(&self, address: &str, diff: &InstanceDiff) -> HookAction {
        self.fan_out(|h| h.pre_apply(address, diff))
    }

    fn post_apply(
        &self,
        address: &str,
        state: Option<&InstanceState>,
        error: Option<&EngineError>,
    ) -> HookAction {
        self.fan_out(|h| h.post_apply(address, state, error))
    }

    fn pre_refresh(&self, address: &str) -> HookAction {
        self.fan_out(|h| h.pre_refresh(address))
    }

    fn post_refresh(&self, address: &str, state: Option<&InstanceState>) -> HookAction {
        self.fan_out(|h| h.post_refresh(address, state))
    }

    fn post_state_update(&self, state: &State) -> HookAction {
        self.fan_out(|h| h.post_state_update(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        halt: bool,
    }

    impl Hook for Counting {
        fn pre_diff(&self, _address: &str) -> HookAction {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.halt {
                HookAction::Halt
            } else {
                HookAction::Continue
            }
        }
    }

    #[test]
    fn test_fan_out_reaches_every_hook() {
        let first = Arc::new(Counting { calls: AtomicUsize::new(0), halt: true });
        let second = Arc::new(Counting { calls: AtomicUsize::new(0), halt: false });
        let mut hooks = Hooks::new();
        hooks.push(first.clone());
        hooks.push(second.clone());

        assert_eq!(hooks.pre_diff("a"), HookAction::Halt);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.post_state_update(&State::new()), HookAction::Continue);
    }

    #[test]
    fn test_noop_hook_continues() {
        assert_eq!(NoopHook.pre_apply("a", &InstanceDiff::default()), HookAction::Continue);
        assert!(Hooks::new().is_empty());
        assert_eq!(Operation::Apply.to_string(), "apply");
    }
}
