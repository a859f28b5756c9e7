//! Error types for Graphform.
//!
//! This module defines the error hierarchy using `thiserror`. Errors fall
//! into the phases of an operation:
//!
//! - **Build errors**: malformed graphs (duplicate names, unresolved
//!   references, cycles, missing providers). Fatal, raised before any walk.
//! - **Diff errors**: a provider rejected a configuration. Recorded per vertex.
//! - **Apply errors**: a provider operation failed. Recorded per vertex and
//!   propagated upward as skips by the walker.
//! - **Walk errors**: the aggregated [`MultiError`] of a single walk.
//! - **State / config / IO errors**: persistence and configuration failures.
//!
//! # Example
//!
//! ```rust
//! use graphform::error::{EngineError, Result};
//!
//! fn lookup(name: &str) -> Result<()> {
//!     Err(graphform::err!(UnresolvedReference {
//!         vertex: "aws_instance.web".to_string(),
//!         reference: name.to_string(),
//!     }))
//! }
//!
//! assert!(lookup("var.missing").is_err());
//! ```

use dashmap::DashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Macro to create errors with automatic source location tracking.
///
/// Usage:
/// ```ignore
/// return Err(err!(MissingVariable { name: "region".to_string() }));
/// return Err(err!(InvalidCount { resource, message }));
/// ```
#[macro_export]
macro_rules! err {
    ($variant:ident { $($field:ident $(: $value:expr)?),* $(,)? }) => {
        $crate::error::EngineError::$variant {
            $($field $(: $value)?,)*
            src_path: file!(),
            src_line: line!(),
        }
    };
}

/// A specialized Result type for Graphform operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The main error type for Graphform.
#[derive(Error, Debug)]
pub enum EngineError {
    // =========================================================================
    // Build Errors
    // =========================================================================
    /// Two vertices share a name.
    #[error("Duplicate vertex '{name}' ({src_path}:{src_line})")]
    DuplicateVertex {
        /// The duplicated name
        name: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// An edge from a vertex to itself.
    #[error("Vertex '{vertex}' cannot depend on itself ({src_path}:{src_line})")]
    SelfEdge {
        /// The offending vertex
        vertex: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// A reference to an entity that is not declared.
    #[error("'{vertex}' references undeclared '{reference}' ({src_path}:{src_line})")]
    UnresolvedReference {
        /// The vertex holding the reference
        vertex: String,
        /// The reference text
        reference: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// A reference expression that does not parse.
    #[error("Invalid reference '{expression}' ({src_path}:{src_line}): {message}")]
    InvalidReference {
        /// The expression text
        expression: String,
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// The graph contains a cycle.
    #[error("Cycle detected ({src_path}:{src_line}): {cycle}")]
    Cycle {
        /// The vertices of the cycle, in order
        cycle: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// No provider factory is registered for a provider.
    #[error("No provider '{provider}' available for '{resource}' ({src_path}:{src_line})")]
    MissingProvider {
        /// The provider name
        provider: String,
        /// The resource needing it
        resource: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// A provider block is malformed.
    #[error("Invalid configuration for provider '{provider}' ({src_path}:{src_line}): {message}")]
    ProviderConfig {
        /// The provider name
        provider: String,
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// A root variable has neither a value nor a default.
    #[error("Missing value for variable '{name}' ({src_path}:{src_line})")]
    MissingVariable {
        /// The variable name
        name: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// A `count` that is not a non-negative integer known at build time.
    #[error("Invalid count for '{resource}' ({src_path}:{src_line}): {message}")]
    InvalidCount {
        /// The resource
        resource: String,
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// Graph building error.
    #[error("Failed to build dependency graph ({src_path}:{src_line}): {message}")]
    GraphBuild {
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    // =========================================================================
    // Evaluation and Diff Errors
    // =========================================================================
    /// A reference could not be evaluated during a walk.
    #[error("Cannot evaluate '{expression}' in '{vertex}' ({src_path}:{src_line}): {message}")]
    Resolve {
        /// The vertex being evaluated
        vertex: String,
        /// The expression text
        expression: String,
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// A provider rejected a configuration while diffing.
    #[error("Diff failed for '{address}' ({src_path}:{src_line}): {message}")]
    Diff {
        /// The instance address
        address: String,
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// Validation reported errors.
    #[error("Validation failed with {count} error(s) ({src_path}:{src_line}): {}", messages.join("; "))]
    Validation {
        /// Number of errors
        count: usize,
        /// The individual messages
        messages: Vec<String>,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    // =========================================================================
    // Apply Errors
    // =========================================================================
    /// A provider operation failed while applying.
    #[error("Apply failed for '{address}' ({src_path}:{src_line}): {message}")]
    Apply {
        /// The instance address
        address: String,
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// Error raised from inside a provider implementation.
    #[error("Provider error ({src_path}:{src_line}): {message}")]
    Provider {
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    // =========================================================================
    // Walk Errors
    // =========================================================================
    /// The aggregated per-vertex errors of one walk.
    #[error("{0}")]
    Walk(MultiError),

    // =========================================================================
    // State Errors
    // =========================================================================
    /// Another writer advanced the persisted state.
    #[error("State at '{path}' was modified by another writer: expected serial {expected}, found {found} ({src_path}:{src_line})")]
    StaleState {
        /// The state file
        path: PathBuf,
        /// The serial this writer last saw
        expected: u64,
        /// The serial found on disk
        found: u64,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// A plan was computed against a different state revision.
    #[error("Plan was created against state serial {planned} but state is at {current} ({src_path}:{src_line})")]
    StalePlan {
        /// The serial recorded in the plan
        planned: u64,
        /// The serial of the state handed to apply
        current: u64,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// Persisting a state snapshot failed.
    #[error("Failed to persist state ({src_path}:{src_line}): {message}")]
    StatePersist {
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration parsing error.
    #[error("Failed to parse configuration ({src_path}:{src_line}): {message}")]
    ConfigParse {
        /// Error message
        message: String,
        /// The underlying error (if any)
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}' ({src_path}:{src_line}): {message}")]
    ConfigValue {
        /// The configuration key
        key: String,
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    // =========================================================================
    // I/O and Serialization Errors
    // =========================================================================
    /// I/O error with path context.
    #[error("I/O error at '{path}' ({src_path}:{src_line}): {source}")]
    Io {
        /// The path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// Serialization or deserialization failure.
    #[error("Serialization error ({src_path}:{src_line}): {message}")]
    Serialization {
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },

    /// Internal error (should not happen in normal operation).
    #[error("Internal error ({src_path}:{src_line}): {message}")]
    Internal {
        /// Error message
        message: String,
        /// Source file path
        src_path: &'static str,
        /// Source line number
        src_line: u32,
    },
}

impl EngineError {
    /// Creates an `Io` error.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error, src_path: &'static str, src_line: u32) -> Self {
        Self::Io { path: path.into(), source, src_path, src_line }
    }

    /// Creates a `Provider` error. Intended for provider implementations.
    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider { message: message.into(), src_path: file!(), src_line: line!() }
    }

    /// Creates an `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>, src_path: &'static str, src_line: u32) -> Self {
        Self::Internal { message: message.into(), src_path, src_line }
    }

    /// Whether this error is scoped to one vertex, letting unrelated subtrees
    /// continue.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Resolve { .. }
                | Self::Diff { .. }
                | Self::Apply { .. }
                | Self::Provider { .. }
                | Self::StatePersist { .. }
        )
    }

    /// Whether this error was raised while building the graph.
    #[must_use]
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateVertex { .. }
                | Self::SelfEdge { .. }
                | Self::UnresolvedReference { .. }
                | Self::InvalidReference { .. }
                | Self::Cycle { .. }
                | Self::MissingProvider { .. }
                | Self::ProviderConfig { .. }
                | Self::MissingVariable { .. }
                | Self::InvalidCount { .. }
                | Self::GraphBuild { .. }
        )
    }

    /// Returns the appropriate exit code for the error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Io { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied => 13,
            e if e.is_build_error() => 10,
            Self::Validation { .. } => 11,
            Self::Walk(_) => 12,
            Self::StaleState { .. } | Self::StalePlan { .. } => 14,
            Self::ConfigParse { .. } => 18,
            Self::ConfigValue { .. } => 19,
            _ => 1,
        }
    }

    /// Consolidates errors: `Ok(())` for none, the error itself for one, a
    /// `Validation` error listing every message otherwise.
    pub fn collect(errors: Vec<Self>) -> Result<()> {
        let mut errors = errors;
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            count => Err(Self::Validation {
                count,
                messages: errors.iter().map(ToString::to_string).collect(),
                src_path: file!(),
                src_line: line!(),
            }),
        }
    }
}

/// Extension trait for `Result` to add context to errors.
pub trait ResultExt<T> {
    /// Adds a file path context to an I/O error.
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| EngineError::io(path, e, file!(), line!()))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization {
            message: format!("JSON serialization/deserialization error: {source}"),
            src_path: file!(),
            src_line: line!(),
        }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(source: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: format!("YAML serialization/deserialization error: {source}"),
            src_path: file!(),
            src_line: line!(),
        }
    }
}

// =============================================================================
// Per-vertex aggregation
// =============================================================================

/// Why a vertex did not complete successfully.
#[derive(Debug)]
pub enum VertexFailure {
    /// The vertex callback returned an error.
    Failed(EngineError),
    /// A dependency failed, so the callback never ran.
    Skipped {
        /// The failed vertex that caused the skip
        because: String,
    },
    /// The walk was cancelled before the vertex started.
    Cancelled,
}

/// One entry of a [`MultiError`].
#[derive(Debug)]
pub struct VertexError {
    /// Name of the vertex
    pub vertex: String,
    /// What happened to it
    pub failure: VertexFailure,
}

impl fmt::Display for VertexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            VertexFailure::Failed(e) => write!(f, "{}: {e}", self.vertex),
            VertexFailure::Skipped { because } => {
                write!(f, "{}: skipped because '{because}' failed", self.vertex)
            }
            VertexFailure::Cancelled => write!(f, "{}: cancelled", self.vertex),
        }
    }
}

/// Every failed, skipped or cancelled vertex from one walk, ordered by
/// vertex name.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<VertexError>,
}

impl MultiError {
    /// Build from entries; they are sorted by vertex name.
    #[must_use]
    pub fn new(mut errors: Vec<VertexError>) -> Self {
        errors.sort_by(|a, b| a.vertex.cmp(&b.vertex));
        Self { errors }
    }

    /// All entries.
    #[must_use]
    pub fn errors(&self) -> &[VertexError] {
        &self.errors
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Names of vertices whose callback failed.
    #[must_use]
    pub fn failed(&self) -> Vec<&str> {
        self.filter(|f| matches!(f, VertexFailure::Failed(_)))
    }

    /// Names of vertices skipped due to a failed dependency.
    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.filter(|f| matches!(f, VertexFailure::Skipped { .. }))
    }

    /// Names of vertices that never ran because of cancellation.
    #[must_use]
    pub fn cancelled(&self) -> Vec<&str> {
        self.filter(|f| matches!(f, VertexFailure::Cancelled))
    }

    /// The error recorded for a failed vertex.
    #[must_use]
    pub fn error_for(&self, vertex: &str) -> Option<&EngineError> {
        self.errors.iter().find_map(|e| match &e.failure {
            VertexFailure::Failed(err) if e.vertex == vertex => Some(err),
            _ => None,
        })
    }

    fn filter(&self, pred: impl Fn(&VertexFailure) -> bool) -> Vec<&str> {
        self.errors
            .iter()
            .filter(|e| pred(&e.failure))
            .map(|e| e.vertex.as_str())
            .collect()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vertex error(s): {} failed, {} skipped, {} cancelled",
            self.errors.len(),
            self.failed().len(),
            self.skipped().len(),
            self.cancelled().len()
        )?;
        for e in &self.errors {
            write!(f, "\n  - {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Thread-safe collector of per-vertex errors, keyed by vertex name.
///
/// Walk tasks record into it concurrently; the walker drains it once every
/// task has settled.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: DashMap<String, VertexFailure>,
}

impl ErrorCollector {
    /// Create a new error collector.
    #[must_use]
    pub fn new() -> Self {
        Self { errors: DashMap::new() }
    }

    /// Record a failure for a vertex. A vertex keeps its first failure.
    pub fn add(&self, vertex: &str, failure: VertexFailure) {
        self.errors.entry(vertex.to_string()).or_insert(failure);
    }

    /// Whether a failure was recorded for a vertex.
    #[must_use]
    pub fn contains(&self, vertex: &str) -> bool {
        self.errors.contains_key(vertex)
    }

    /// Get the number of collected errors.
    #[must_use]
    pub fn count(&self) -> usize {
        self.errors.len()
    }

    /// Check if there are any errors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Drain into a [`MultiError`].
    #[must_use]
    pub fn into_multi_error(self) -> MultiError {
        MultiError::new(
            self.errors
                .into_iter()
                .map(|(vertex, failure)| VertexError { vertex, failure })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_err_macro_records_location() {
        let e = crate::err!(MissingVariable { name: "region".to_string() });
        match e {
            EngineError::MissingVariable { name, src_path, .. } => {
                assert_eq!(name, "region");
                assert!(src_path.ends_with("error.rs"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_err_macro_accepts_shorthand_fields() {
        let resource = "null_resource.web".to_string();
        let message = "count must not be negative".to_string();
        match crate::err!(InvalidCount { resource, message }) {
            EngineError::InvalidCount { resource, message, src_line, .. } => {
                assert_eq!(resource, "null_resource.web");
                assert_eq!(message, "count must not be negative");
                assert!(src_line > 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_collect() {
        assert!(EngineError::collect(Vec::new()).is_ok());

        let single = EngineError::collect(vec![EngineError::provider("boom")]);
        assert!(matches!(single, Err(EngineError::Provider { .. })));

        let many = EngineError::collect(vec![
            EngineError::provider("a"),
            EngineError::provider("b"),
        ]);
        match many {
            Err(EngineError::Validation { count, messages, .. }) => {
                assert_eq!(count, 2);
                assert_eq!(messages.len(), 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_recoverable_and_exit_codes() {
        assert!(EngineError::provider("x").is_recoverable());
        let cycle = crate::err!(Cycle { cycle: "a -> b -> a".to_string() });
        assert!(!cycle.is_recoverable());
        assert!(cycle.is_build_error());
        assert_eq!(cycle.exit_code(), 10);
        assert_eq!(EngineError::Walk(MultiError::default()).exit_code(), 12);
    }

    #[test]
    fn test_collector_keeps_first_failure_and_sorts() {
        let collector = ErrorCollector::new();
        collector.add("b", VertexFailure::Cancelled);
        collector.add("a", VertexFailure::Failed(EngineError::provider("boom")));
        collector.add("a", VertexFailure::Cancelled);
        collector.add("c", VertexFailure::Skipped { because: "a".to_string() });
        assert_eq!(collector.count(), 3);

        let multi = collector.into_multi_error();
        let names: Vec<_> = multi.errors().iter().map(|e| e.vertex.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(multi.failed(), vec!["a"]);
        assert_eq!(multi.skipped(), vec!["c"]);
        assert_eq!(multi.cancelled(), vec!["b"]);
        assert!(multi.error_for("a").is_some());
        assert!(multi.to_string().contains("skipped because 'a' failed"));
    }
}
