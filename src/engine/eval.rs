//! Per-walk evaluation scope.
//!
//! Every walk owns one [`EvalContext`]: the values published by settled
//! vertices, the configured provider instances, and the hooks. Dependencies
//! settle before their dependents start, so a lookup either finds its value
//! or the reference names something that failed to publish.

use crate::error::{EngineError, Result};
use crate::graph::{Graph, ProviderSetup, ValueExpr, ValueSource, Vertex};
use crate::hook::{Hook, HookAction, Hooks};
use crate::provider::{ProviderRegistry, ResourceProvider};
use crate::reference::{interpolate, path_to_string, select, Reference};
use crate::types::Attributes;
use crate::walk::{CancelToken, VertexCallback};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Values and providers visible to the vertices of one walk.
pub(crate) struct EvalContext {
    registry: ProviderRegistry,
    pub(crate) hooks: Hooks,
    cancel: CancelToken,
    /// Vertex name to published value
    values: DashMap<String, Value>,
    /// Provider vertex name to configured instance
    providers: DashMap<String, Arc<dyn ResourceProvider>>,
}

impl EvalContext {
    pub(crate) fn new(registry: ProviderRegistry, hooks: Hooks, cancel: CancelToken) -> Self {
        Self {
            registry,
            hooks,
            cancel,
            values: DashMap::new(),
            providers: DashMap::new(),
        }
    }

    /// Make a value visible to dependents.
    pub(crate) fn publish(&self, vertex: &str, value: Value) {
        self.values.insert(vertex.to_string(), value);
    }

    /// A published value.
    pub(crate) fn value(&self, vertex: &str) -> Option<Value> {
        self.values.get(vertex).map(|v| v.value().clone())
    }

    /// Act on a hook's answer; `Halt` cancels the walk.
    pub(crate) fn hook(&self, action: HookAction) {
        if action == HookAction::Halt && !self.cancel.is_cancelled() {
            tracing::warn!("Hook requested halt, no further vertices will start");
            self.cancel.cancel();
        }
    }

    /// Evaluate an expression in the scope named by `prefix`.
    pub(crate) fn resolve(
        &self,
        vertex: &str,
        value: &Value,
        prefix: &str,
        count_index: Option<usize>,
    ) -> Result<Value> {
        interpolate(value, &mut |reference: &Reference| {
            let failure = |message: String| {
                crate::err!(Resolve {
                    vertex: vertex.to_string(),
                    expression: describe(reference, prefix),
                    message,
                })
            };
            if *reference == Reference::CountIndex {
                return count_index
                    .map(Value::from)
                    .ok_or_else(|| failure("count.index used outside a counted resource".to_string()));
            }
            let target = reference
                .vertex_name(prefix)
                .ok_or_else(|| failure("reference names no vertex".to_string()))?;
            let published = self
                .values
                .get(&target)
                .map(|v| v.value().clone())
                .ok_or_else(|| failure(format!("'{target}' has no value")))?;
            select(&published, reference.path())
                .ok_or_else(|| failure(format!("'{target}' has no attribute '{}'", path_to_string(reference.path()))))
        })
    }

    /// Evaluate every attribute of a configuration.
    pub(crate) fn resolve_attributes(
        &self,
        vertex: &str,
        config: &Attributes,
        prefix: &str,
        count_index: Option<usize>,
    ) -> Result<Attributes> {
        config
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve(vertex, v, prefix, count_index)?)))
            .collect()
    }

    /// Evaluate what a value source publishes.
    pub(crate) fn evaluate_source(&self, vertex: &str, source: &dyn ValueSource) -> Result<Value> {
        match source.value_expr() {
            ValueExpr::Expression { value, prefix } => self.resolve(vertex, value, prefix, None),
            ValueExpr::Collect(names) => names
                .iter()
                .map(|name| {
                    self.value(name).ok_or_else(|| {
                        crate::err!(Resolve {
                            vertex: vertex.to_string(),
                            expression: name.clone(),
                            message: "instance has no value".to_string(),
                        })
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
        }
    }

    /// Instantiate and configure the provider of a provider vertex.
    pub(crate) async fn configure_provider(&self, vertex: &str, setup: ProviderTarget) -> Result<()> {
        let config = self.resolve_attributes(vertex, &setup.config, &setup.prefix, None)?;
        let mut provider = self.registry.instantiate(&setup.provider_type).ok_or_else(|| {
            crate::err!(MissingProvider { provider: setup.provider_type.clone(), resource: vertex.to_string() })
        })?;
        provider.configure(&config).await.map_err(|e| {
            crate::err!(ProviderConfig { provider: vertex.to_string(), message: e.to_string() })
        })?;
        tracing::debug!(provider = %vertex, "Configured provider");
        self.providers.insert(vertex.to_string(), Arc::from(provider));
        Ok(())
    }

    /// The configured provider behind a provider vertex.
    pub(crate) fn provider(&self, vertex: &str) -> Result<Arc<dyn ResourceProvider>> {
        self.providers.get(vertex).map(|p| Arc::clone(p.value())).ok_or_else(|| {
            EngineError::internal(format!("provider '{vertex}' is not configured"), file!(), line!())
        })
    }
}

/// Readable form of a reference for error messages.
fn describe(reference: &Reference, prefix: &str) -> String {
    match reference.vertex_name(prefix) {
        Some(name) if reference.path().is_empty() => name,
        Some(name) => format!("{name}.{}", path_to_string(reference.path())),
        None => "count.index".to_string(),
    }
}

// =============================================================================
// Walk targets
// =============================================================================

/// Owned view of a provider vertex.
pub(crate) struct ProviderTarget {
    pub provider_type: String,
    pub config: Attributes,
    pub prefix: String,
}

impl ProviderTarget {
    fn from_setup(setup: &dyn ProviderSetup) -> Self {
        Self {
            provider_type: setup.provider_type().to_string(),
            config: setup.config().clone(),
            prefix: setup.prefix().to_string(),
        }
    }
}

/// Owned view of an instance vertex.
#[derive(Debug, Clone)]
pub(crate) struct InstanceTarget {
    pub address: String,
    pub resource_type: String,
    pub provider: String,
    /// `None` for orphans
    pub config: Option<Attributes>,
    pub count_index: Option<usize>,
    pub prefix: String,
}

impl InstanceTarget {
    pub(crate) fn from_vertex(vertex: &Vertex) -> Option<Self> {
        let d = vertex.as_diffable()?;
        Some(Self {
            address: d.address().to_string(),
            resource_type: d.resource_type().to_string(),
            provider: d.provider().to_string(),
            config: d.config().cloned(),
            count_index: d.count_index(),
            prefix: d.prefix().to_string(),
        })
    }

    pub(crate) fn info(&self) -> crate::provider::InstanceInfo {
        crate::provider::InstanceInfo::new(&self.address, &self.resource_type)
    }
}

/// Owned view of a destroy vertex.
#[derive(Debug, Clone)]
pub(crate) struct DestroyTarget {
    pub address: String,
    pub resource_type: String,
    pub provider: String,
}

impl DestroyTarget {
    fn from_vertex(vertex: &Vertex) -> Option<Self> {
        let a = vertex.as_applyable()?;
        a.is_destroy().then(|| Self {
            address: a.address().to_string(),
            resource_type: a.resource_type().to_string(),
            provider: a.provider().to_string(),
        })
    }

    pub(crate) fn info(&self) -> crate::provider::InstanceInfo {
        crate::provider::InstanceInfo::new(&self.address, &self.resource_type)
    }
}

// =============================================================================
// Operation callback
// =============================================================================

/// What an operation does with instance and destroy vertices. Value sources
/// and providers are handled the same way by every operation.
#[async_trait]
pub(crate) trait InstanceOperation: Send + Sync {
    /// Publish unknown for value sources that cannot be evaluated instead
    /// of failing them.
    const LENIENT_VALUES: bool = false;

    async fn instance(&self, ctx: &EvalContext, target: InstanceTarget) -> Result<()>;

    async fn destroy(&self, _ctx: &EvalContext, _target: DestroyTarget) -> Result<()> {
        Ok(())
    }

    /// A root output was evaluated.
    fn output(&self, _name: &str, _value: &Value) -> Result<()> {
        Ok(())
    }
}

/// Adapts an [`InstanceOperation`] to the walker.
pub(crate) struct OperationWalk<O> {
    pub ctx: EvalContext,
    pub op: O,
}

impl<O: InstanceOperation> OperationWalk<O> {
    pub(crate) fn new(ctx: EvalContext, op: O) -> Self {
        Self { ctx, op }
    }

    /// Announce the walk to the hooks.
    pub(crate) fn announce(&self, operation: crate::hook::Operation, graph: &Graph) {
        self.ctx.hook(self.ctx.hooks.pre_walk(operation, graph));
    }
}

/// The owned work a vertex asks for, extracted before any await.
enum Step {
    Done(Result<()>),
    Provider(ProviderTarget),
    Instance(InstanceTarget),
    Destroy(DestroyTarget),
}

impl<O: InstanceOperation> OperationWalk<O> {
    fn step(&self, vertex: &Vertex) -> Step {
        if let Some(source) = vertex.as_value_source() {
            return Step::Done(self.publish_source(&vertex.name, source));
        }
        if let Some(setup) = vertex.as_provider_setup() {
            return Step::Provider(ProviderTarget::from_setup(setup));
        }
        if let Some(target) = InstanceTarget::from_vertex(vertex) {
            return Step::Instance(target);
        }
        match DestroyTarget::from_vertex(vertex) {
            Some(target) => Step::Destroy(target),
            None => Step::Done(Ok(())),
        }
    }

    fn publish_source(&self, name: &str, source: &dyn ValueSource) -> Result<()> {
        let value = match self.ctx.evaluate_source(name, source) {
            Ok(value) => value,
            Err(e) if O::LENIENT_VALUES => {
                tracing::debug!(vertex = %name, error = %e, "Value not available yet");
                self.ctx.publish(name, crate::types::unknown());
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if let Some(output) = source.state_output() {
            self.op.output(output, &value)?;
        }
        self.ctx.publish(name, value);
        Ok(())
    }
}

#[async_trait]
impl<O: InstanceOperation> VertexCallback for OperationWalk<O> {
    async fn visit(&self, vertex: &Vertex) -> Result<()> {
        match self.step(vertex) {
            Step::Done(result) => result,
            Step::Provider(setup) => self.ctx.configure_provider(&vertex.name, setup).await,
            Step::Instance(target) => self.op.instance(&self.ctx, target).await,
            Step::Destroy(target) => self.op.destroy(&self.ctx, target).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UNKNOWN;
    use serde_json::json;

    fn context() -> EvalContext {
        let ctx = EvalContext::new(ProviderRegistry::with_builtins(), Hooks::new(), CancelToken::new());
        ctx.publish("var.region", json!("eu-west-1"));
        ctx.publish("null_resource.a", json!({"id": "a1", "tags": {"env": "prod"}}));
        ctx.publish("null_resource.b", json!([{"id": "b0"}, {"id": "b1"}]));
        ctx.publish("module.net.var.cidr", json!("10.0.0.0/16"));
        ctx.publish("null_resource.c", json!({"id": UNKNOWN}));
        ctx
    }

    #[test]
    fn test_resolve_references() {
        let ctx = context();
        assert_eq!(ctx.resolve("x", &json!("${var.region}"), "", None).unwrap(), json!("eu-west-1"));
        assert_eq!(
            ctx.resolve("x", &json!("${null_resource.a.tags.env}-${count.index}"), "", Some(2)).unwrap(),
            json!("prod-2")
        );
        assert_eq!(
            ctx.resolve("x", &json!("${null_resource.b.*.id}"), "", None).unwrap(),
            json!(["b0", "b1"])
        );
        assert_eq!(
            ctx.resolve("x", &json!("${var.cidr}"), "module.net.", None).unwrap(),
            json!("10.0.0.0/16")
        );
        assert_eq!(
            ctx.resolve("x", &json!("id=${null_resource.c.id}"), "", None).unwrap(),
            json!(UNKNOWN)
        );
    }

    #[test]
    fn test_resolve_failures() {
        let ctx = context();
        let err = ctx.resolve("x", &json!("${null_resource.a.nope}"), "", None).unwrap_err();
        assert!(err.to_string().contains("null_resource.a.nope"));
        assert!(ctx.resolve("x", &json!("${count.index}"), "", None).is_err());
        assert!(ctx.resolve("x", &json!("${var.unset}"), "", None).is_err());
    }

    #[test]
    fn test_halt_cancels() {
        let cancel = CancelToken::new();
        let ctx = EvalContext::new(ProviderRegistry::new(), Hooks::new(), cancel.clone());
        ctx.hook(HookAction::Continue);
        assert!(!cancel.is_cancelled());
        ctx.hook(HookAction::Halt);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_configure_provider() {
        let ctx = context();
        let target = ProviderTarget {
            provider_type: "null".to_string(),
            config: serde_json::from_value(json!({"region": "${var.region}"})).unwrap(),
            prefix: String::new(),
        };
        ctx.configure_provider("provider.null", target).await.unwrap();
        assert!(ctx.provider("provider.null").is_ok());
        assert!(ctx.provider("provider.other").is_err());
    }
}
