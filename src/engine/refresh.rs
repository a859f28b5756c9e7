//! Refresh walk: read every managed instance back from its provider.

use super::eval::{EvalContext, InstanceOperation, InstanceTarget};
use crate::error::Result;
use crate::hook::Hook;
use crate::state::State;
use crate::types::unknown;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub(crate) struct RefreshOp {
    state: Mutex<State>,
    changed: AtomicBool,
}

impl RefreshOp {
    pub(crate) fn new(state: State) -> Self {
        Self { state: Mutex::new(state), changed: AtomicBool::new(false) }
    }

    /// The refreshed state and whether any instance changed.
    pub(crate) fn into_state(self) -> (State, bool) {
        let state = self.state.into_inner().unwrap_or_else(|e| e.into_inner());
        (state, self.changed.into_inner())
    }

    fn mark_changed(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl InstanceOperation for RefreshOp {
    const LENIENT_VALUES: bool = true;

    async fn instance(&self, ctx: &EvalContext, target: InstanceTarget) -> Result<()> {
        let prior = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resource(&target.address)
            .cloned();
        let Some(prior) = prior else {
            ctx.publish(&target.address, unknown());
            return Ok(());
        };

        ctx.hook(ctx.hooks.pre_refresh(&target.address));
        let provider = ctx.provider(&target.provider)?;
        let refreshed = provider.refresh(&target.info(), &prior.primary).await.map_err(|e| {
            crate::err!(Provider { message: format!("refresh of '{}' failed: {e}", target.address) })
        })?;

        match &refreshed {
            Some(instance) => {
                if *instance != prior.primary {
                    tracing::info!(address = %target.address, "Instance changed outside of graphform");
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(entry) = state.resources.get_mut(&target.address) {
                        entry.primary = instance.clone();
                    }
                    self.mark_changed();
                }
                ctx.publish(&target.address, instance.to_value());
            }
            None => {
                tracing::info!(address = %target.address, "Instance no longer exists");
                self.state.lock().unwrap_or_else(|e| e.into_inner()).resources.remove(&target.address);
                self.mark_changed();
                ctx.publish(&target.address, unknown());
            }
        }
        ctx.hook(ctx.hooks.post_refresh(&target.address, refreshed.as_ref()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::Hooks;
    use crate::provider::ProviderRegistry;
    use crate::walk::CancelToken;

    #[tokio::test]
    async fn test_unmanaged_instance_is_unknown() {
        let ctx = EvalContext::new(ProviderRegistry::with_builtins(), Hooks::new(), CancelToken::new());
        let op = RefreshOp::new(State::new());
        let target = InstanceTarget {
            address: "null_resource.a".to_string(),
            resource_type: "null_resource".to_string(),
            provider: "provider.null".to_string(),
            config: None,
            count_index: None,
            prefix: String::new(),
        };
        op.instance(&ctx, target).await.unwrap();
        assert_eq!(ctx.value("null_resource.a"), Some(unknown()));
        let (state, changed) = op.into_state();
        assert!(state.is_empty());
        assert!(!changed);
    }
}
