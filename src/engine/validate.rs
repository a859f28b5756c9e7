//! Static validation of instance configurations.

use crate::error::{EngineError, Result};
use crate::graph::Graph;
use crate::provider::{InstanceInfo, ProviderRegistry, ResourceProvider};
use crate::reference::mask_references;
use serde::Serialize;
use std::collections::BTreeMap;

/// Warnings reported by a successful validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Number of instances checked
    pub checked: usize,
    /// `address: message` per warning
    pub warnings: Vec<String>,
}

/// Run every provider's validation over the instances of a built graph.
/// References are not evaluated; they reach the provider as unknown values.
pub(crate) fn validate_graph(graph: &Graph, registry: &ProviderRegistry) -> Result<ValidationReport> {
    let mut providers: BTreeMap<String, Box<dyn ResourceProvider>> = BTreeMap::new();
    let mut report = ValidationReport::default();
    let mut errors = Vec::new();

    for vertex in graph.vertices() {
        let Some(instance) = vertex.as_diffable() else { continue };
        let Some(config) = instance.config() else { continue };

        let provider_type = graph
            .vertex(instance.provider())
            .and_then(|v| v.as_provider_setup())
            .map(|p| p.provider_type().to_string())
            .ok_or_else(|| crate::err!(MissingProvider {
                provider: instance.provider().to_string(),
                resource: instance.address().to_string(),
            }))?;
        if !providers.contains_key(&provider_type) {
            let created = registry.instantiate(&provider_type).ok_or_else(|| crate::err!(MissingProvider {
                provider: provider_type.clone(),
                resource: instance.address().to_string(),
            }))?;
            providers.insert(provider_type.clone(), created);
        }
        let Some(provider) = providers.get(&provider_type) else { continue };

        let info = InstanceInfo::new(instance.address(), instance.resource_type());
        let result = provider.validate(&info, &mask_references(config));
        report.checked += 1;
        report.warnings.extend(result.warnings.iter().map(|w| format!("{}: {w}", info.address)));
        errors.extend(result.errors.iter().map(|e| format!("{}: {e}", info.address)));
    }

    tracing::debug!(
        checked = report.checked,
        warnings = report.warnings.len(),
        errors = errors.len(),
        "Validated instance configurations"
    );
    if errors.is_empty() {
        Ok(report)
    } else {
        Err(EngineError::Validation { count: errors.len(), messages: errors, src_path: file!(), src_line: line!() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::state::State;
    use crate::types::Description;

    fn graph(yaml: &str) -> Graph {
        let registry = ProviderRegistry::with_builtins();
        GraphBuilder::new(&registry, &State::new())
            .build(&Description::from_yaml(yaml).unwrap())
            .unwrap()
    }

    #[test]
    fn test_valid_configuration() {
        let g = graph(
            r#"
resources:
  - type: null_resource
    name: a
    config:
      triggers:
        v: "1"
  - type: null_resource
    name: b
    config:
      triggers: ${null_resource.a.outputs}
"#,
        );
        let report = validate_graph(&g, &ProviderRegistry::with_builtins()).unwrap();
        assert_eq!(report.checked, 2);
    }

    #[test]
    fn test_errors_name_the_instance() {
        let g = graph(
            r#"
resources:
  - type: null_resource
    name: bad
    config:
      triggers: "not a map"
"#,
        );
        match validate_graph(&g, &ProviderRegistry::with_builtins()) {
            Err(EngineError::Validation { count, messages, .. }) => {
                assert_eq!(count, 1);
                assert!(messages[0].starts_with("null_resource.bad: "));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
