//! Attribute schemas.
//!
//! Providers describe their resource attributes once and let [`Schema`]
//! validate configurations and compute diffs.

use super::Validation;
use crate::diff::{AttrDiff, DiffAction, InstanceDiff};
use crate::state::InstanceState;
use crate::types::{contains_unknown, unknown, Attributes};
use serde_json::Value;
use std::collections::BTreeMap;

/// Flags of one attribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSchema {
    pub required: bool,
    pub optional: bool,
    /// Set by the provider when not configured
    pub computed: bool,
    /// A change replaces the instance
    pub force_new: bool,
    pub default: Option<Value>,
}

impl AttributeSchema {
    /// An attribute that must be set.
    #[must_use]
    pub fn required() -> Self {
        Self { required: true, ..Self::default() }
    }

    /// An attribute that may be set.
    #[must_use]
    pub fn optional() -> Self {
        Self { optional: true, ..Self::default() }
    }

    /// An attribute only the provider sets.
    #[must_use]
    pub fn computed() -> Self {
        Self { computed: true, ..Self::default() }
    }

    /// Mark the attribute force-new.
    #[must_use]
    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Let the provider fill the attribute when it is not configured.
    #[must_use]
    pub fn and_computed(mut self) -> Self {
        self.computed = true;
        self
    }

    /// Default value for an unset attribute.
    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn is_computed_only(&self) -> bool {
        self.computed && !self.required && !self.optional
    }
}

/// Attribute schema of one resource type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    attributes: BTreeMap<String, AttributeSchema>,
}

impl Schema {
    /// An empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, schema: AttributeSchema) -> Self {
        self.attributes.insert(name.into(), schema);
        self
    }

    /// Look up an attribute.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// Check a configuration against the schema.
    #[must_use]
    pub fn validate(&self, config: &Attributes) -> Validation {
        let mut validation = Validation::default();
        for name in config.keys() {
            match self.attributes.get(name) {
                None => validation.error(format!("unknown attribute '{name}'")),
                Some(attr) if attr.is_computed_only() => {
                    validation.error(format!("attribute '{name}' is computed and cannot be set"));
                }
                Some(_) => {}
            }
        }
        for (name, attr) in &self.attributes {
            if attr.required && !config.contains_key(name) {
                validation.error(format!("missing required attribute '{name}'"));
            }
        }
        validation
    }

    /// Diff a resolved configuration against the prior instance.
    #[must_use]
    pub fn diff(&self, config: &Attributes, prior: Option<&InstanceState>) -> InstanceDiff {
        let mut diff = InstanceDiff::default();

        for (name, attr) in &self.attributes {
            let old = prior.and_then(|p| p.attributes.get(name)).cloned();
            let new = config.get(name).or(attr.default.as_ref()).cloned();

            if attr.is_computed_only() || (attr.computed && new.is_none()) {
                if prior.is_none() {
                    diff.attributes.insert(
                        name.clone(),
                        AttrDiff { old: None, new: Some(unknown()), computed: true, force_new: false },
                    );
                }
                continue;
            }

            let change = match new {
                Some(value) if contains_unknown(&value) => {
                    Some(AttrDiff { old, new: Some(unknown()), computed: true, force_new: attr.force_new })
                }
                Some(value) if old.as_ref() != Some(&value) => {
                    Some(AttrDiff { old, new: Some(value), computed: false, force_new: attr.force_new })
                }
                None if old.is_some() => {
                    Some(AttrDiff { old, new: None, computed: false, force_new: attr.force_new })
                }
                _ => None,
            };
            if let Some(change) = change {
                diff.attributes.insert(name.clone(), change);
            }
        }

        diff.action = match prior {
            None => DiffAction::Create,
            Some(_) if diff.requires_new() => DiffAction::Replace,
            Some(_) if diff.has_changes() => DiffAction::Update,
            Some(_) => DiffAction::NoOp,
        };
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UNKNOWN;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new()
            .attribute("name", AttributeSchema::required())
            .attribute("image", AttributeSchema::required().force_new())
            .attribute("size", AttributeSchema::optional().with_default(json!(1)))
            .attribute("arn", AttributeSchema::computed())
    }

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_validate() {
        let s = schema();
        assert!(s.validate(&attrs(json!({"name": "a", "image": "x"}))).is_ok());

        let v = s.validate(&attrs(json!({"name": "a", "arn": "y", "bogus": 1})));
        assert_eq!(v.errors.len(), 3);
        assert!(v.errors.iter().any(|e| e.contains("missing required attribute 'image'")));
        assert!(v.errors.iter().any(|e| e.contains("computed")));
        assert!(v.errors.iter().any(|e| e.contains("unknown attribute 'bogus'")));
    }

    #[test]
    fn test_create_diff_has_defaults_and_computed() {
        let diff = schema().diff(&attrs(json!({"name": "a", "image": "x"})), None);
        assert_eq!(diff.action, DiffAction::Create);
        assert_eq!(diff.attributes["size"].new, Some(json!(1)));
        assert!(diff.attributes["arn"].computed);
        assert_eq!(diff.attributes["arn"].new, Some(json!(UNKNOWN)));
    }

    #[test]
    fn test_update_and_replace() {
        let prior = InstanceState::new(
            "i-1",
            attrs(json!({"name": "a", "image": "x", "size": 1, "arn": "arn:1"})),
        );

        let same = schema().diff(&attrs(json!({"name": "a", "image": "x"})), Some(&prior));
        assert_eq!(same.action, DiffAction::NoOp);
        assert!(same.attributes.is_empty());

        let update = schema().diff(&attrs(json!({"name": "b", "image": "x"})), Some(&prior));
        assert_eq!(update.action, DiffAction::Update);
        assert_eq!(update.attributes.len(), 1);

        let replace = schema().diff(&attrs(json!({"name": "b", "image": "y"})), Some(&prior));
        assert_eq!(replace.action, DiffAction::Replace);
        assert!(replace.attributes["image"].force_new);
    }

    #[test]
    fn test_unknown_config_value_is_computed() {
        let prior = InstanceState::new("i-1", attrs(json!({"name": "a", "image": "x", "size": 1})));
        let diff = schema().diff(&attrs(json!({"name": UNKNOWN, "image": "x"})), Some(&prior));
        assert_eq!(diff.action, DiffAction::Update);
        assert!(diff.attributes["name"].computed);
    }
}
