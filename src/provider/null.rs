//! Builtin `null` provider.
//!
//! `null_resource` manages nothing external. It stores `inputs`, echoes them
//! back as the computed `outputs`, and is replaced whenever `triggers`
//! changes. Ids are derived from the address and triggers, so runs are
//! reproducible.

use super::{ApplyFailure, AttributeSchema, InstanceInfo, ResourceProvider, Schema, Validation};
use crate::diff::{DiffAction, InstanceDiff};
use crate::error::{EngineError, Result};
use crate::state::InstanceState;
use crate::types::{contains_unknown, Attributes};
use async_trait::async_trait;
use blake3::Hasher;
use serde_json::Value;

/// Resource type served by the null provider.
pub const NULL_RESOURCE: &str = "null_resource";

/// The `null` provider.
#[derive(Debug, Clone)]
pub struct NullProvider {
    schema: Schema,
}

impl Default for NullProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl NullProvider {
    /// Create the provider.
    #[must_use]
    pub fn new() -> Self {
        let schema = Schema::new()
            .attribute("triggers", AttributeSchema::optional().force_new())
            .attribute("inputs", AttributeSchema::optional())
            .attribute("outputs", AttributeSchema::computed());
        Self { schema }
    }

    fn check_type(info: &InstanceInfo) -> Result<()> {
        if info.resource_type == NULL_RESOURCE {
            Ok(())
        } else {
            Err(EngineError::provider(format!(
                "null provider does not support resource type '{}'",
                info.resource_type
            )))
        }
    }
}

/// `blake3("null_resource:" || address || 0 || triggers)`, as 16 hex digits.
fn instance_id(address: &str, triggers: Option<&Value>) -> String {
    let canonical = triggers.map(Value::to_string).unwrap_or_default();
    let mut hasher = Hasher::new();
    hasher.update(b"null_resource:");
    hasher.update(address.as_bytes());
    hasher.update(&[0]);
    hasher.update(canonical.as_bytes());
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..16].to_string()
}

#[async_trait]
impl ResourceProvider for NullProvider {
    async fn configure(&mut self, config: &Attributes) -> Result<()> {
        if !config.is_empty() {
            tracing::debug!(keys = config.len(), "null provider ignores its configuration");
        }
        Ok(())
    }

    fn validate(&self, info: &InstanceInfo, config: &Attributes) -> Validation {
        if let Err(e) = Self::check_type(info) {
            let mut validation = Validation::default();
            validation.error(e.to_string());
            return validation;
        }
        let mut validation = self.schema.validate(config);
        if let Some(triggers) = config.get("triggers") {
            if !triggers.is_object() && !contains_unknown(triggers) {
                validation.error("'triggers' must be a map");
            }
        }
        validation
    }

    async fn diff(
        &self,
        info: &InstanceInfo,
        config: &Attributes,
        prior: Option<&InstanceState>,
    ) -> Result<InstanceDiff> {
        Self::check_type(info)?;
        Ok(self.schema.diff(config, prior))
    }

    async fn apply(
        &self,
        info: &InstanceInfo,
        prior: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> std::result::Result<Option<InstanceState>, ApplyFailure> {
        Self::check_type(info)?;
        if diff.action == DiffAction::Destroy {
            tracing::debug!(address = %info.address, "Destroying null resource");
            return Ok(None);
        }

        let prior = if diff.action == DiffAction::Update { prior } else { None };
        let mut attributes = diff.planned_attributes(prior);
        let outputs = attributes
            .get("inputs")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        attributes.insert("outputs".to_string(), outputs);

        if attributes.values().any(contains_unknown) {
            return Err(ApplyFailure::new(EngineError::provider(format!(
                "'{}' still has unknown attributes at apply time",
                info.address
            ))));
        }

        let id = match prior {
            Some(p) => p.id.clone(),
            None => instance_id(&info.address, attributes.get("triggers")),
        };
        Ok(Some(InstanceState::new(id, attributes)))
    }

    async fn refresh(&self, info: &InstanceInfo, prior: &InstanceState) -> Result<Option<InstanceState>> {
        Self::check_type(info)?;
        Ok(Some(prior.clone()))
    }
}
