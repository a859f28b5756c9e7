//! Provider contract.
//!
//! The engine never looks inside a provider. Each provider vertex gets its
//! own instance from a [`ProviderRegistry`] factory, configured once per walk,
//! and every resource instance talks to it only through [`ResourceProvider`].
//!
//! # Example
//!
//! ```rust
//! use graphform::provider::ProviderRegistry;
//!
//! let registry = ProviderRegistry::with_builtins();
//! assert!(registry.contains("null"));
//! assert!(registry.instantiate("null").is_some());
//! ```

mod null;
mod schema;

pub use null::NullProvider;
pub use schema::{AttributeSchema, Schema};

use crate::diff::InstanceDiff;
use crate::error::{EngineError, Result};
use crate::state::InstanceState;
use crate::types::Attributes;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identity of the instance an operation concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    /// Instance address (e.g. `null_resource.web[0]`)
    pub address: String,
    /// Resource type
    pub resource_type: String,
}

impl InstanceInfo {
    /// Create instance info.
    #[must_use]
    pub fn new(address: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self { address: address.into(), resource_type: resource_type.into() }
    }
}

/// Outcome of validating one configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Validation {
    /// Whether no errors were reported.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error.
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Add a warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// A failed apply, with whatever the provider created before failing.
#[derive(Debug)]
pub struct ApplyFailure {
    /// Partially created instance (e.g. an id assigned before a later step failed)
    pub partial: Option<InstanceState>,
    pub error: EngineError,
}

impl ApplyFailure {
    /// A failure that left nothing behind.
    #[must_use]
    pub fn new(error: EngineError) -> Self {
        Self { partial: None, error }
    }

    /// A failure that left a partial instance behind.
    #[must_use]
    pub fn partial(partial: InstanceState, error: EngineError) -> Self {
        Self { partial: Some(partial), error }
    }
}

impl From<EngineError> for ApplyFailure {
    fn from(error: EngineError) -> Self {
        Self::new(error)
    }
}

/// The operations the engine needs from a provider.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Configure the provider from its resolved provider block.
    async fn configure(&mut self, _config: &Attributes) -> Result<()> {
        Ok(())
    }

    /// Check a configuration. References not yet resolvable appear as
    /// unknown values.
    fn validate(&self, info: &InstanceInfo, config: &Attributes) -> Validation;

    /// Compare a resolved configuration against the prior instance. The
    /// engine recomputes `action` from the returned attribute changes.
    async fn diff(
        &self,
        info: &InstanceInfo,
        config: &Attributes,
        prior: Option<&InstanceState>,
    ) -> Result<InstanceDiff>;

    /// Carry out a diff. Returns the new instance, or `None` once destroyed.
    async fn apply(
        &self,
        info: &InstanceInfo,
        prior: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> std::result::Result<Option<InstanceState>, ApplyFailure>;

    /// Read the current instance. `None` means it no longer exists.
    async fn refresh(&self, info: &InstanceInfo, prior: &InstanceState) -> Result<Option<InstanceState>>;
}

/// Creates unconfigured provider instances.
pub type ProviderFactory = Arc<dyn Fn() -> Box<dyn ResourceProvider> + Send + Sync>;

/// Provider type name to factory.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the builtin `null` provider.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("null", || Box::new(NullProvider::new()));
        registry
    }

    /// Register a factory, replacing any previous one of the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ResourceProvider> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Whether a factory exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered provider names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Create an unconfigured instance.
    #[must_use]
    pub fn instantiate(&self, name: &str) -> Option<Box<dyn ResourceProvider>> {
        self.factories.get(name).map(|factory| factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        let mut registry = ProviderRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["null"]);
        assert!(registry.instantiate("aws").is_none());

        registry.register("other", || Box::new(NullProvider::new()));
        assert!(registry.contains("other"));
        assert!(format!("{registry:?}").contains("other"));
    }

    #[test]
    fn test_validation_helpers() {
        let mut v = Validation::default();
        assert!(v.is_ok());
        v.warn("deprecated");
        assert!(v.is_ok());
        v.error("missing");
        assert!(!v.is_ok());
    }
}
