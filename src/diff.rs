//! Instance diffs.
//!
//! A provider reports attribute-level changes; [`InstanceDiff::resolve_action`]
//! then decides the instance action the same way for every provider:
//!
//! | Prior state         | Changes                    | Action  |
//! |---------------------|----------------------------|---------|
//! | none                | any                        | Create  |
//! | tainted             | any                        | Replace |
//! | present             | a force-new attribute      | Replace |
//! | present             | other attributes           | Update  |
//! | present             | none                       | NoOp    |
//! | present, no config  | -                          | Destroy |

use crate::state::{InstanceState, ResourceState};
use crate::types::{is_unknown, Attributes};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// What happens to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffAction {
    NoOp,
    Create,
    Update,
    Replace,
    Destroy,
}

impl DiffAction {
    /// Whether the destroy half runs for this action.
    #[must_use]
    pub const fn destroys(self) -> bool {
        matches!(self, Self::Destroy | Self::Replace)
    }

    /// Whether the create/update half runs for this action.
    #[must_use]
    pub const fn creates_or_updates(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Replace)
    }

    /// Plan symbol, as in `+ null_resource.a`.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::NoOp => " ",
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Destroy => "-",
        }
    }
}

impl fmt::Display for DiffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => write!(f, "no-op"),
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Replace => write!(f, "replace"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// Change of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrDiff {
    /// Value before, if any
    pub old: Option<Value>,
    /// Value after, if any
    pub new: Option<Value>,
    /// The new value is only known after apply
    #[serde(default)]
    pub computed: bool,
    /// Changing this attribute requires replacing the instance
    #[serde(default)]
    pub force_new: bool,
}

impl AttrDiff {
    /// Whether the attribute actually changes.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.computed || self.old != self.new
    }
}

/// Diff of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDiff {
    pub action: DiffAction,
    /// Attribute name to change, ordered
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrDiff>,
}

impl Default for InstanceDiff {
    fn default() -> Self {
        Self { action: DiffAction::NoOp, attributes: BTreeMap::new() }
    }
}

impl InstanceDiff {
    /// A diff removing every attribute of `prior`.
    #[must_use]
    pub fn destroy(prior: &InstanceState) -> Self {
        let attributes = prior
            .attributes
            .iter()
            .map(|(k, v)| {
                (k.clone(), AttrDiff { old: Some(v.clone()), new: None, computed: false, force_new: false })
            })
            .collect();
        Self { action: DiffAction::Destroy, attributes }
    }

    /// Whether any attribute changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.attributes.values().any(AttrDiff::is_change)
    }

    /// Whether a force-new attribute changes.
    #[must_use]
    pub fn requires_new(&self) -> bool {
        self.attributes.values().any(|a| a.force_new && a.is_change())
    }

    /// Set the action from the prior state and the attribute changes.
    ///
    /// Any force-new change escalates the whole instance to `Replace`.
    pub fn resolve_action(&mut self, prior: Option<&ResourceState>) {
        self.action = match prior {
            None => DiffAction::Create,
            Some(p) if p.tainted => DiffAction::Replace,
            Some(_) if self.requires_new() => DiffAction::Replace,
            Some(_) if self.has_changes() => DiffAction::Update,
            Some(_) => DiffAction::NoOp,
        };
    }

    /// Attribute values after this diff, layered over `prior`.
    ///
    /// Removed attributes are dropped; computed ones become unknown.
    #[must_use]
    pub fn planned_attributes(&self, prior: Option<&InstanceState>) -> Attributes {
        let mut attributes = match (self.action, prior) {
            (DiffAction::Replace | DiffAction::Create, _) | (_, None) => Attributes::new(),
            (_, Some(p)) => p.attributes.clone(),
        };
        for (name, change) in &self.attributes {
            match &change.new {
                Some(v) if change.computed || is_unknown(v) => {
                    attributes.insert(name.clone(), crate::types::unknown());
                }
                Some(v) => {
                    attributes.insert(name.clone(), v.clone());
                }
                None => {
                    attributes.remove(name);
                }
            }
        }
        attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UNKNOWN;
    use serde_json::json;

    fn prior(tainted: bool) -> ResourceState {
        ResourceState {
            resource_type: "null_resource".to_string(),
            provider: "provider.null".to_string(),
            dependencies: vec![],
            primary: InstanceState::new("x", Attributes::new()),
            tainted,
        }
    }

    fn change(old: Option<Value>, new: Option<Value>, force_new: bool) -> AttrDiff {
        AttrDiff { old, new, computed: false, force_new }
    }

    #[test]
    fn test_resolve_action() {
        let mut diff = InstanceDiff::default();
        diff.resolve_action(None);
        assert_eq!(diff.action, DiffAction::Create);

        diff.resolve_action(Some(&prior(false)));
        assert_eq!(diff.action, DiffAction::NoOp);

        diff.resolve_action(Some(&prior(true)));
        assert_eq!(diff.action, DiffAction::Replace);

        diff.attributes.insert("a".into(), change(Some(json!(1)), Some(json!(2)), false));
        diff.resolve_action(Some(&prior(false)));
        assert_eq!(diff.action, DiffAction::Update);

        diff.attributes.insert("b".into(), change(Some(json!(1)), Some(json!(2)), true));
        diff.resolve_action(Some(&prior(false)));
        assert_eq!(diff.action, DiffAction::Replace);
    }

    #[test]
    fn test_unchanged_force_new_attribute_does_not_replace() {
        let mut diff = InstanceDiff::default();
        diff.attributes.insert("b".into(), change(Some(json!(1)), Some(json!(1)), true));
        diff.resolve_action(Some(&prior(false)));
        assert_eq!(diff.action, DiffAction::NoOp);
    }

    #[test]
    fn test_planned_attributes() {
        let mut prior_attrs = Attributes::new();
        prior_attrs.insert("keep".into(), json!("k"));
        prior_attrs.insert("drop".into(), json!("d"));
        prior_attrs.insert("change".into(), json!(1));
        let prior_state = InstanceState::new("x", prior_attrs);

        let mut diff = InstanceDiff { action: DiffAction::Update, attributes: BTreeMap::new() };
        diff.attributes.insert("drop".into(), change(Some(json!("d")), None, false));
        diff.attributes.insert("change".into(), change(Some(json!(1)), Some(json!(2)), false));
        diff.attributes.insert(
            "later".into(),
            AttrDiff { old: None, new: Some(json!(UNKNOWN)), computed: true, force_new: false },
        );

        let planned = diff.planned_attributes(Some(&prior_state));
        assert_eq!(planned["keep"], json!("k"));
        assert_eq!(planned["change"], json!(2));
        assert_eq!(planned["later"], json!(UNKNOWN));
        assert!(!planned.contains_key("drop"));
    }

    #[test]
    fn test_destroy_diff() {
        let mut attrs = Attributes::new();
        attrs.insert("a".into(), json!(1));
        let diff = InstanceDiff::destroy(&InstanceState::new("x", attrs));
        assert_eq!(diff.action, DiffAction::Destroy);
        assert_eq!(diff.attributes["a"].new, None);
        assert!(DiffAction::Replace.destroys());
        assert!(!DiffAction::Update.destroys());
    }
}
