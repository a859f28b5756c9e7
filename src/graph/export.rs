//! Graph export functionality.
//!
//! This module provides functions to export the dependency graph
//! in various formats for visualization and debugging.

use crate::error::Result;
use crate::graph::types::Graph;
use crate::graph::vertex::Vertex;
use crate::types::GraphFormat;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Export the dependency graph to the specified format.
///
/// # Supported Formats
///
/// - **DOT**: Graphviz DOT format for visualization
/// - **JSON**: Structured JSON for programmatic access
/// - **Mermaid**: Mermaid diagram syntax for documentation
///
/// Vertices and edges are emitted in name order, so the output of one graph
/// is stable across runs.
///
/// # Example
///
/// ```rust
/// use graphform::graph::{export_graph, Graph};
/// use graphform::types::GraphFormat;
///
/// let graph = Graph::new();
/// let dot = export_graph(&graph, GraphFormat::Dot).unwrap();
/// assert!(dot.starts_with("digraph"));
/// ```
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn export_graph(graph: &Graph, format: GraphFormat) -> Result<String> {
    match format {
        GraphFormat::Dot => Ok(export_dot(graph, "graphform")),
        GraphFormat::Json => export_json(graph),
        GraphFormat::Mermaid => Ok(export_mermaid(graph)),
    }
}

fn sorted_vertices(graph: &Graph) -> Vec<&Vertex> {
    let mut vertices: Vec<&Vertex> = graph.vertices().collect();
    vertices.sort_by(|a, b| a.name.cmp(&b.name));
    vertices
}

fn dot_style(kind: &str) -> &'static str {
    match kind {
        "instance" => "fillcolor=lightblue, style=\"rounded,filled\"",
        "resource" => "fillcolor=lightblue, style=\"rounded,dashed\"",
        "provider" => "fillcolor=lightgreen, style=\"rounded,filled\", shape=ellipse",
        "variable" | "output" => "fillcolor=lightyellow, style=\"rounded,filled\", shape=note",
        "destroy" => "fillcolor=mistyrose, style=\"rounded,filled\"",
        "root" => "shape=diamond",
        _ => "style=dotted",
    }
}

/// Export to Graphviz DOT format under the given graph name.
pub(crate) fn export_dot(graph: &Graph, name: &str) -> String {
    let mut dot = String::new();
    let _ = writeln!(dot, "digraph \"{}\" {{", escape_dot_string(name));
    dot.push_str("    rankdir=BT;\n");
    dot.push_str("    node [shape=box, style=rounded];\n");
    dot.push('\n');

    for vertex in sorted_vertices(graph) {
        let kind = vertex.kind_label();
        let _ = writeln!(
            dot,
            "    \"{}\" [label=\"{}\\n({kind})\", {}];",
            escape_dot_string(&vertex.name),
            escape_dot_string(&vertex.name),
            dot_style(kind)
        );
    }
    dot.push('\n');

    for (from, to) in graph.edges() {
        let _ = writeln!(
            dot,
            "    \"{}\" -> \"{}\";",
            escape_dot_string(&from),
            escape_dot_string(&to)
        );
    }

    dot.push_str("}\n");
    dot
}

/// Export to JSON format.
fn export_json(graph: &Graph) -> Result<String> {
    #[derive(Serialize)]
    struct JsonGraph {
        nodes: Vec<JsonNode>,
        edges: Vec<JsonEdge>,
        metadata: JsonMetadata,
    }

    #[derive(Serialize)]
    struct JsonNode {
        id: String,
        #[serde(rename = "type")]
        node_type: &'static str,
        dependencies: Vec<String>,
    }

    #[derive(Serialize)]
    struct JsonEdge {
        from: String,
        to: String,
    }

    #[derive(Serialize)]
    struct JsonMetadata {
        total_nodes: usize,
        total_edges: usize,
        by_type: BTreeMap<&'static str, usize>,
    }

    let mut by_type: BTreeMap<&'static str, usize> = BTreeMap::new();
    let nodes: Vec<JsonNode> = sorted_vertices(graph)
        .into_iter()
        .map(|v| {
            *by_type.entry(v.kind_label()).or_default() += 1;
            JsonNode {
                id: v.name.clone(),
                node_type: v.kind_label(),
                dependencies: graph.dependencies(&v.name).into_iter().map(String::from).collect(),
            }
        })
        .collect();
    let edges: Vec<JsonEdge> =
        graph.edges().into_iter().map(|(from, to)| JsonEdge { from, to }).collect();

    let json_graph = JsonGraph {
        metadata: JsonMetadata { total_nodes: nodes.len(), total_edges: edges.len(), by_type },
        nodes,
        edges,
    };

    serde_json::to_string_pretty(&json_graph).map_err(|e| {
        crate::err!(Serialization { message: format!("Failed to serialize graph to JSON: {e}") })
    })
}

/// Export to Mermaid diagram format.
fn export_mermaid(graph: &Graph) -> String {
    let mut mermaid = String::new();
    mermaid.push_str("graph BT\n");
    mermaid.push_str("    %% graphform dependency graph\n\n");

    let mut classes: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for vertex in sorted_vertices(graph) {
        let id = sanitize_mermaid_id(&vertex.name);
        let label = escape_mermaid_string(&vertex.name);
        let kind = vertex.kind_label();
        let _ = match kind {
            "provider" => writeln!(mermaid, "    {id}((\"{label}\"))"),
            "root" => writeln!(mermaid, "    {id}{{\"{label}\"}}"),
            _ => writeln!(mermaid, "    {id}[\"{label}\"]"),
        };
        classes.entry(kind).or_default().push(id);
    }

    mermaid.push('\n');
    for (from, to) in graph.edges() {
        let _ = writeln!(
            mermaid,
            "    {} --> {}",
            sanitize_mermaid_id(&from),
            sanitize_mermaid_id(&to)
        );
    }

    mermaid.push_str("\n    %% Styling\n");
    mermaid.push_str("    classDef instance fill:#e1f5fe,stroke:#01579b\n");
    mermaid.push_str("    classDef provider fill:#e8f5e9,stroke:#1b5e20\n");
    mermaid.push_str("    classDef destroy fill:#ffebee,stroke:#b71c1c\n");
    for kind in ["instance", "provider", "destroy"] {
        if let Some(ids) = classes.get(kind) {
            let _ = writeln!(mermaid, "    class {} {kind}", ids.join(","));
        }
    }

    mermaid
}

/// Escape a string for use in DOT labels and quoted ids.
fn escape_dot_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Sanitize a string for use as a Mermaid node ID.
fn sanitize_mermaid_id(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Escape a string for use in Mermaid labels.
fn escape_mermaid_string(s: &str) -> String {
    s.replace('"', "'").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::provider::ProviderRegistry;
    use crate::state::State;
    use crate::types::Description;

    fn create_test_graph() -> Graph {
        let description = Description::from_yaml(
            r#"
resources:
  - type: null_resource
    name: a
  - type: null_resource
    name: b
    config:
      inputs: { a: "${null_resource.a.id}" }
"#,
        )
        .unwrap();
        let registry = ProviderRegistry::with_builtins();
        let state = State::new();
        GraphBuilder::new(&registry, &state).build(&description).unwrap()
    }

    #[test]
    fn test_export_dot() {
        let graph = create_test_graph();
        let dot = export_dot(&graph, "plan");

        assert!(dot.starts_with("digraph \"plan\""));
        assert!(dot.contains("\"null_resource.b\" -> \"null_resource.a\";"));
        assert!(dot.contains("(provider)"));
        assert_eq!(dot, export_dot(&graph, "plan"));
    }

    #[test]
    fn test_export_json() {
        let graph = create_test_graph();
        let json = export_json(&graph).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["metadata"]["total_nodes"], 4);
        assert_eq!(parsed["metadata"]["by_type"]["instance"], 2);
        assert_eq!(parsed["nodes"][0]["id"], "null_resource.a");
        assert_eq!(parsed["edges"].as_array().unwrap().len(), graph.edge_count());
    }

    #[test]
    fn test_export_mermaid() {
        let graph = create_test_graph();
        let mermaid = export_mermaid(&graph);

        assert!(mermaid.contains("graph BT"));
        assert!(mermaid.contains("null_resource_b --> null_resource_a"));
        assert!(mermaid.contains("provider_null((\"provider.null\"))"));
        assert!(mermaid.contains("class null_resource_a,null_resource_b instance"));
    }

    #[test]
    fn test_escape_dot_string() {
        assert_eq!(escape_dot_string("hello\nworld"), "hello\\nworld");
        assert_eq!(escape_dot_string("say \"hi\""), "say \\\"hi\\\"");
    }

    #[test]
    fn test_sanitize_mermaid_id() {
        assert_eq!(sanitize_mermaid_id("destroy:null_resource.a[0]"), "destroy_null_resource_a_0_");
    }
}
