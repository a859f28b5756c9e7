//! Reference expressions embedded in attribute values.
//!
//! A string value may contain `${...}` expressions naming other entities:
//!
//! | Expression              | Vertex                  |
//! |-------------------------|-------------------------|
//! | `var.NAME`              | `var.NAME`              |
//! | `module.M.OUT`          | `module.M.output.OUT`   |
//! | `TYPE.NAME[i].attr`     | `TYPE.NAME[i]`          |
//! | `TYPE.NAME.*.attr`      | `TYPE.NAME`             |
//! | `TYPE.NAME.attr`        | `TYPE.NAME`             |
//! | `count.index`           | none                    |
//!
//! Expressions are written module-local; [`Reference::vertex_name`] qualifies
//! them with the owning module prefix.

use crate::error::Result;
use crate::types::{contains_unknown, unknown, Attributes};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::LazyLock;

/// Matches `${expr}` and captures `expr`.
pub(crate) static EXPRESSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("Invalid regex"));

/// One step of an attribute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Map key
    Key(String),
    /// List index
    Index(usize),
    /// Map the rest of the path over every list element
    Splat,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => write!(f, "{k}"),
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Splat => write!(f, "*"),
        }
    }
}

/// A parsed reference expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `var.NAME[.path]`
    Variable { name: String, path: Vec<Segment> },
    /// `module.M.OUT[.path]`
    ModuleOutput { module: String, output: String, path: Vec<Segment> },
    /// `TYPE.NAME[i][.path]` or `TYPE.NAME[.path]`
    Resource {
        resource_type: String,
        name: String,
        index: Option<usize>,
        path: Vec<Segment>,
    },
    /// `count.index`
    CountIndex,
}

impl Reference {
    /// Parse an expression (the text between `${` and `}`).
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |message: &str| {
            crate::err!(InvalidReference {
                expression: expression.to_string(),
                message: message.to_string(),
            })
        };

        let segments = tokenize(expression.trim()).map_err(|m| invalid(&m))?;
        let mut iter = segments.into_iter();
        let head = match iter.next() {
            Some(Segment::Key(k)) => k,
            _ => return Err(invalid("expression must start with a name")),
        };
        let mut next_key = |what: &str| match iter.next() {
            Some(Segment::Key(k)) => Ok(k),
            _ => Err(invalid(&format!("expected {what}"))),
        };

        let reference = match head.as_str() {
            "var" => {
                let name = next_key("a variable name")?;
                Self::Variable { name, path: iter.collect() }
            }
            "count" => {
                let attr = next_key("'index'")?;
                if attr != "index" || iter.next().is_some() {
                    return Err(invalid("only count.index is supported"));
                }
                Self::CountIndex
            }
            "module" => {
                let module = next_key("a module name")?;
                let output = next_key("an output name")?;
                Self::ModuleOutput { module, output, path: iter.collect() }
            }
            _ => {
                let name = next_key("a resource name")?;
                let mut rest: Vec<Segment> = iter.collect();
                let index = match rest.first() {
                    Some(Segment::Index(i)) => {
                        let i = *i;
                        rest.remove(0);
                        Some(i)
                    }
                    _ => None,
                };
                Self::Resource { resource_type: head, name, index, path: rest }
            }
        };
        Ok(reference)
    }

    /// The vertex this reference resolves to, qualified with a module prefix.
    ///
    /// Returns `None` for `count.index`.
    #[must_use]
    pub fn vertex_name(&self, prefix: &str) -> Option<String> {
        match self {
            Self::Variable { name, .. } => Some(format!("{prefix}var.{name}")),
            Self::ModuleOutput { module, output, .. } => {
                Some(format!("{prefix}module.{module}.output.{output}"))
            }
            Self::Resource { resource_type, name, index: Some(i), .. } => {
                Some(format!("{prefix}{resource_type}.{name}[{i}]"))
            }
            Self::Resource { resource_type, name, index: None, .. } => {
                Some(format!("{prefix}{resource_type}.{name}"))
            }
            Self::CountIndex => None,
        }
    }

    /// The module call vertex standing in for a module output until the
    /// module is flattened.
    #[must_use]
    pub fn module_vertex(&self, prefix: &str) -> Option<String> {
        match self {
            Self::ModuleOutput { module, .. } => Some(format!("{prefix}module.{module}")),
            _ => None,
        }
    }

    /// The attribute path following the vertex part.
    #[must_use]
    pub fn path(&self) -> &[Segment] {
        match self {
            Self::Variable { path, .. }
            | Self::ModuleOutput { path, .. }
            | Self::Resource { path, .. } => path,
            Self::CountIndex => &[],
        }
    }
}

fn tokenize(expression: &str) -> std::result::Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut chars = expression.chars().peekable();
    let mut expect_name = true;

    while let Some(&c) = chars.peek() {
        match c {
            '.' if !expect_name => {
                chars.next();
                expect_name = true;
            }
            '[' => {
                chars.next();
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    chars.next();
                    if d == ']' {
                        break;
                    }
                    digits.push(d);
                }
                let index = digits
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("invalid index '[{digits}]'"))?;
                segments.push(Segment::Index(index));
                expect_name = false;
            }
            '*' if expect_name => {
                chars.next();
                segments.push(Segment::Splat);
                expect_name = false;
            }
            _ if expect_name && (c.is_alphanumeric() || c == '_' || c == '-') => {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_alphanumeric() || n == '_' || n == '-' {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                segments.push(Segment::Key(name));
                expect_name = false;
            }
            _ => return Err(format!("unexpected character '{c}'")),
        }
    }
    if expect_name {
        return Err("expression ends with '.'".to_string());
    }
    Ok(segments)
}

/// Every reference appearing in a value, in order of appearance.
pub fn references_in(value: &Value) -> Result<Vec<Reference>> {
    let mut found = Vec::new();
    collect_references(value, &mut found)?;
    Ok(found)
}

fn collect_references(value: &Value, found: &mut Vec<Reference>) -> Result<()> {
    match value {
        Value::String(s) => {
            for caps in EXPRESSION_PATTERN.captures_iter(s) {
                found.push(Reference::parse(&caps[1])?);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Substitute every `${...}` expression in a value.
///
/// A string that is exactly one expression takes the referenced value
/// verbatim (any JSON type). Embedded expressions are spliced in as text;
/// if any of them is unknown the whole string becomes unknown.
pub fn interpolate<F>(value: &Value, lookup: &mut F) -> Result<Value>
where
    F: FnMut(&Reference) -> Result<Value>,
{
    match value {
        Value::String(s) => interpolate_str(s, lookup),
        Value::Array(items) => items
            .iter()
            .map(|item| interpolate(item, lookup))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), interpolate(v, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn interpolate_str<F>(s: &str, lookup: &mut F) -> Result<Value>
where
    F: FnMut(&Reference) -> Result<Value>,
{
    let re = &*EXPRESSION_PATTERN;
    if let Some(caps) = re.captures(s) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
            return lookup(&Reference::parse(&caps[1])?);
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&s[last..whole.start()]);
        let resolved = lookup(&Reference::parse(&caps[1])?)?;
        if contains_unknown(&resolved) {
            return Ok(unknown());
        }
        match resolved {
            Value::String(text) => out.push_str(&text),
            Value::Null => {}
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// Follow an attribute path into a value.
///
/// Indexing into an unknown value yields unknown. Returns `None` when the
/// path does not exist.
#[must_use]
pub fn select(value: &Value, path: &[Segment]) -> Option<Value> {
    let Some((first, rest)) = path.split_first() else {
        return Some(value.clone());
    };
    if crate::types::is_unknown(value) {
        return Some(unknown());
    }
    match (first, value) {
        (Segment::Key(k), Value::Object(map)) => select(map.get(k)?, rest),
        (Segment::Key(k), Value::Array(items)) => {
            let i: usize = k.parse().ok()?;
            select(items.get(i)?, rest)
        }
        (Segment::Index(i), Value::Array(items)) => select(items.get(*i)?, rest),
        (Segment::Splat, Value::Array(items)) => items
            .iter()
            .map(|item| select(item, rest))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        _ => None,
    }
}

/// Attributes with every reference replaced by the unknown placeholder.
///
/// Used where a configuration is inspected before any value exists.
#[must_use]
pub fn mask_references(config: &Attributes) -> Attributes {
    config
        .iter()
        .map(|(k, v)| {
            let masked = interpolate(v, &mut |_: &Reference| Ok(unknown())).unwrap_or_else(|_| unknown());
            (k.clone(), masked)
        })
        .collect()
}

/// Render a path for messages.
#[must_use]
pub fn path_to_string(path: &[Segment]) -> String {
    path.iter().map(ToString::to_string).collect::<Vec<_>>().join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UNKNOWN;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    #[test_case("var.region", "var.region" ; "variable")]
    #[test_case("var.tags.env", "var.tags" ; "variable with path")]
    #[test_case("module.net.vpc_id", "module.net.output.vpc_id" ; "module output")]
    #[test_case("aws_instance.web[2].id", "aws_instance.web[2]" ; "counted instance")]
    #[test_case("aws_instance.web.*.id", "aws_instance.web" ; "splat")]
    #[test_case("aws_instance.web.id", "aws_instance.web" ; "single instance")]
    fn test_vertex_names(expression: &str, vertex: &str) {
        let reference = Reference::parse(expression).unwrap();
        assert_eq!(reference.vertex_name("").as_deref(), Some(vertex));
    }

    #[test]
    fn test_qualified_with_prefix() {
        let reference = Reference::parse("var.x").unwrap();
        assert_eq!(
            reference.vertex_name("module.net.").as_deref(),
            Some("module.net.var.x")
        );
        let out = Reference::parse("module.db.port").unwrap();
        assert_eq!(out.module_vertex("module.app.").as_deref(), Some("module.app.module.db"));
    }

    #[test]
    fn test_count_index() {
        assert_eq!(Reference::parse("count.index").unwrap(), Reference::CountIndex);
        assert_eq!(Reference::CountIndex.vertex_name(""), None);
        assert!(Reference::parse("count.other").is_err());
    }

    #[test_case("" ; "empty")]
    #[test_case("var" ; "missing name")]
    #[test_case("var." ; "trailing dot")]
    #[test_case("aws_instance.web[x]" ; "bad index")]
    #[test_case("module.net" ; "missing output")]
    fn test_invalid(expression: &str) {
        assert!(Reference::parse(expression).is_err());
    }

    #[test]
    fn test_references_in_nested_values() {
        let value = json!({
            "a": "${var.x}",
            "b": ["prefix-${aws_instance.web.id}-${count.index}"],
            "c": 5
        });
        let refs = references_in(&value).unwrap();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0], Reference::Variable { name: "x".to_string(), path: vec![] });
    }

    #[test]
    fn test_interpolate_whole_and_embedded() {
        let mut lookup = |r: &Reference| -> Result<Value> {
            Ok(match r {
                Reference::Variable { name, .. } if name == "n" => json!(3),
                Reference::Variable { name, .. } if name == "list" => json!(["a", "b"]),
                Reference::CountIndex => json!(1),
                _ => json!(UNKNOWN),
            })
        };
        assert_eq!(interpolate(&json!("${var.n}"), &mut lookup).unwrap(), json!(3));
        assert_eq!(
            interpolate(&json!("${var.list}"), &mut lookup).unwrap(),
            json!(["a", "b"])
        );
        assert_eq!(
            interpolate(&json!("node-${count.index}-of-${var.n}"), &mut lookup).unwrap(),
            json!("node-1-of-3")
        );
        assert_eq!(
            interpolate(&json!("id-${aws_instance.web.id}"), &mut lookup).unwrap(),
            json!(UNKNOWN)
        );
        assert_eq!(interpolate(&json!("plain"), &mut lookup).unwrap(), json!("plain"));
    }

    #[test]
    fn test_select_paths() {
        let value = json!({"tags": {"env": "prod"}, "ips": ["10.0.0.1", "10.0.0.2"]});
        assert_eq!(
            select(&value, &[Segment::Key("tags".into()), Segment::Key("env".into())]),
            Some(json!("prod"))
        );
        assert_eq!(
            select(&value, &[Segment::Key("ips".into()), Segment::Index(1)]),
            Some(json!("10.0.0.2"))
        );
        assert_eq!(select(&value, &[Segment::Key("missing".into())]), None);

        let list = json!([{"id": "a"}, {"id": "b"}]);
        assert_eq!(
            select(&list, &[Segment::Splat, Segment::Key("id".into())]),
            Some(json!(["a", "b"]))
        );
        assert_eq!(select(&json!(UNKNOWN), &[Segment::Key("id".into())]), Some(json!(UNKNOWN)));
    }

    #[test]
    fn test_mask_references() {
        let config: Attributes =
            serde_json::from_value(json!({"a": "${var.x}", "b": 1, "c": "n-${var.y}"})).unwrap();
        let masked = mask_references(&config);
        assert_eq!(masked["a"], json!(UNKNOWN));
        assert_eq!(masked["b"], json!(1));
        assert_eq!(masked["c"], json!(UNKNOWN));
    }
}
