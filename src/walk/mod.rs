//! Concurrent graph walker.
//!
//! [`Walker::walk`] runs a [`VertexCallback`] on every vertex of a graph. A
//! vertex starts only after each of its dependencies has settled, and at most
//! `parallelism` callbacks run at once. The same walker drives validate,
//! refresh, plan and apply; only the callback changes.
//!
//! # Failure policy
//!
//! - A callback error marks the vertex `Failed`
//! - Every vertex depending on it, directly or transitively, is `Skipped`
//!   and never invoked
//! - Vertices with no path to the failure run normally
//! - After cancellation no new callback starts; in-flight ones finish and
//!   everything left is `Cancelled`
//!
//! The root vertex carries no work, so its own skip or cancellation is not
//! reported as an error.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use graphform::error::Result;
//! use graphform::graph::{Graph, Vertex};
//! use graphform::walk::{VertexCallback, Walker};
//! use std::sync::Arc;
//!
//! struct Noop;
//!
//! #[async_trait]
//! impl VertexCallback for Noop {
//!     async fn visit(&self, _vertex: &Vertex) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let mut graph = Graph::new();
//! graph.add_vertex(Vertex::root()).unwrap();
//! let outcome = Walker::new(4).walk(Arc::new(graph), Arc::new(Noop)).await;
//! assert!(outcome.into_result().is_ok());
//! # });
//! ```

use crate::error::{EngineError, ErrorCollector, MultiError, Result, VertexFailure};
use crate::graph::{Graph, MetaVertex, Vertex, VertexKind};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Default number of callbacks in flight.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Work performed on each vertex of a walk.
#[async_trait]
pub trait VertexCallback: Send + Sync {
    /// Visit one vertex. Every dependency has settled successfully.
    async fn visit(&self, vertex: &Vertex) -> Result<()>;
}

/// Cooperative cancellation flag shared between a walk and its callbacks.
///
/// A child token sees its parent's cancellation, but cancelling the child
/// leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    /// A token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh token that is also cancelled when `self` is.
    #[must_use]
    pub fn child(&self) -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)), parent: Some(Arc::clone(&self.flag)) }
    }

    /// Stop scheduling new vertices.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.load(Ordering::SeqCst))
    }
}

/// How a vertex ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VertexStatus {
    Succeeded,
    Failed,
    /// Not invoked because `because` failed
    Skipped { because: String },
    /// Not invoked because the walk was cancelled
    Cancelled,
}

/// Result of a walk.
#[derive(Debug)]
pub struct WalkOutcome {
    /// Final status of every vertex
    pub statuses: BTreeMap<String, VertexStatus>,
    /// Failed, skipped and cancelled vertices
    pub errors: MultiError,
}

impl WalkOutcome {
    /// Status of one vertex.
    #[must_use]
    pub fn status(&self, vertex: &str) -> Option<&VertexStatus> {
        self.statuses.get(vertex)
    }

    /// Names of vertices whose callback succeeded.
    #[must_use]
    pub fn succeeded(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, s)| **s == VertexStatus::Succeeded)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Whether every vertex succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Err(EngineError::Walk)` unless every vertex succeeded.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Walk(self.errors))
        }
    }
}

/// Schedules vertex callbacks in dependency order.
#[derive(Debug, Clone)]
pub struct Walker {
    parallelism: usize,
    cancel: CancelToken,
}

impl Default for Walker {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLELISM)
    }
}

impl Walker {
    /// A walker running at most `parallelism` callbacks at once (minimum 1).
    #[must_use]
    pub fn new(parallelism: usize) -> Self {
        Self { parallelism: parallelism.max(1), cancel: CancelToken::new() }
    }

    /// Use a shared cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The cancellation token of this walker.
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// The parallelism bound.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Walk the graph. The graph must be acyclic.
    pub async fn walk(&self, graph: Arc<Graph>, callback: Arc<dyn VertexCallback>) -> WalkOutcome {
        let mut run = WalkState::new(&graph);
        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();

        tracing::debug!(
            vertices = graph.vertex_count(),
            parallelism = self.parallelism,
            "Starting walk"
        );

        loop {
            while let Some(name) = run.ready.pop_front() {
                if let Some(cause) = run.poisoned.get(&name).cloned() {
                    tracing::debug!(vertex = %name, because = %cause, "Skipping vertex");
                    run.finish(&graph, &name, VertexStatus::Skipped { because: cause.clone() }, Some(cause));
                    continue;
                }
                if self.cancel.is_cancelled() {
                    tracing::debug!(vertex = %name, "Walk cancelled, not starting vertex");
                    run.finish(&graph, &name, VertexStatus::Cancelled, None);
                    continue;
                }
                if tasks.len() >= self.parallelism {
                    run.ready.push_front(name);
                    break;
                }

                let graph = Arc::clone(&graph);
                let callback = Arc::clone(&callback);
                tasks.spawn(async move {
                    let result = match graph.vertex(&name) {
                        Some(vertex) => AssertUnwindSafe(callback.visit(vertex))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                Err(EngineError::internal(
                                    format!("vertex callback panicked: {}", panic_message(panic.as_ref())),
                                    file!(),
                                    line!(),
                                ))
                            }),
                        None => Err(EngineError::internal(
                            format!("vertex '{name}' vanished during the walk"),
                            file!(),
                            line!(),
                        )),
                    };
                    (name, result)
                });
            }

            let Some(joined) = tasks.join_next().await else { break };
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::trace!(vertex = %name, "Vertex succeeded");
                    run.finish(&graph, &name, VertexStatus::Succeeded, None);
                }
                Ok((name, Err(error))) => {
                    tracing::debug!(vertex = %name, error = %error, "Vertex failed");
                    run.collector.add(&name, VertexFailure::Failed(error));
                    run.finish(&graph, &name, VertexStatus::Failed, Some(name.clone()));
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Walk task did not complete");
                }
            }
        }

        run.into_outcome(&graph)
    }
}

/// Coordinator bookkeeping of one walk.
struct WalkState {
    /// Dependencies not yet settled, per vertex
    pending: HashMap<String, usize>,
    ready: VecDeque<String>,
    /// Vertex to the failed vertex that dooms it
    poisoned: HashMap<String, String>,
    statuses: BTreeMap<String, VertexStatus>,
    collector: ErrorCollector,
}

impl WalkState {
    fn new(graph: &Graph) -> Self {
        let pending = graph
            .vertices()
            .map(|v| (v.name.clone(), graph.dependencies(&v.name).len()))
            .collect();
        Self {
            pending,
            ready: graph.leaves().into_iter().map(String::from).collect(),
            poisoned: HashMap::new(),
            statuses: BTreeMap::new(),
            collector: ErrorCollector::new(),
        }
    }

    /// Record a settled vertex and release its dependents.
    fn finish(&mut self, graph: &Graph, name: &str, status: VertexStatus, poison: Option<String>) {
        let reportable = !is_root(graph, name);
        match &status {
            VertexStatus::Skipped { because } if reportable => {
                self.collector.add(name, VertexFailure::Skipped { because: because.clone() });
            }
            VertexStatus::Cancelled if reportable => {
                self.collector.add(name, VertexFailure::Cancelled);
            }
            _ => {}
        }
        self.statuses.insert(name.to_string(), status);

        for dependent in graph.dependents(name) {
            if let Some(cause) = &poison {
                self.poisoned.entry(dependent.to_string()).or_insert_with(|| cause.clone());
            }
            if let Some(count) = self.pending.get_mut(dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ready.push_back(dependent.to_string());
                }
            }
        }
    }

    fn into_outcome(mut self, graph: &Graph) -> WalkOutcome {
        for vertex in graph.vertices() {
            if !self.statuses.contains_key(&vertex.name) {
                self.collector.add(
                    &vertex.name,
                    VertexFailure::Failed(EngineError::internal(
                        "vertex was never scheduled",
                        file!(),
                        line!(),
                    )),
                );
                self.statuses.insert(vertex.name.clone(), VertexStatus::Failed);
            }
        }
        let errors = self.collector.into_multi_error();
        tracing::debug!(
            vertices = self.statuses.len(),
            failed = errors.failed().len(),
            skipped = errors.skipped().len(),
            cancelled = errors.cancelled().len(),
            "Walk complete"
        );
        WalkOutcome { statuses: self.statuses, errors }
    }
}

fn is_root(graph: &Graph, name: &str) -> bool {
    graph
        .vertex(name)
        .is_some_and(|v| matches!(v.kind, VertexKind::Meta(MetaVertex::Root)))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn ordering(name: &str) -> Vertex {
        Vertex::new(name, VertexKind::Meta(MetaVertex::Ordering))
    }

    /// Graph from `(vertex, space separated dependencies)` pairs.
    fn graph(layout: &[(&str, &str)]) -> Arc<Graph> {
        let mut g = Graph::new();
        for (name, _) in layout {
            g.add_vertex(ordering(name)).unwrap();
        }
        for (name, deps) in layout {
            for dep in deps.split_whitespace() {
                g.connect(name, dep).unwrap();
            }
        }
        Arc::new(g)
    }

    #[derive(Default)]
    struct Recorder {
        visited: Mutex<Vec<String>>,
        fail: Vec<String>,
        panic_on: Option<String>,
        cancel: Option<(String, CancelToken)>,
    }

    #[async_trait]
    impl VertexCallback for Recorder {
        async fn visit(&self, vertex: &Vertex) -> Result<()> {
            self.visited.lock().unwrap().push(vertex.name.clone());
            if self.panic_on.as_deref() == Some(vertex.name.as_str()) {
                panic!("boom");
            }
            if let Some((name, token)) = &self.cancel {
                if *name == vertex.name {
                    token.cancel();
                }
            }
            if self.fail.contains(&vertex.name) {
                return Err(EngineError::provider(format!("{} failed", vertex.name)));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let g = graph(&[("c", "b"), ("b", "a"), ("a", "")]);
        let recorder = Arc::new(Recorder::default());
        let outcome = Walker::new(8).walk(g, recorder.clone()).await;

        assert!(outcome.is_success());
        assert_eq!(*recorder.visited.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(outcome.succeeded(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let g = graph(&[("a", ""), ("b", "a"), ("c", "b"), ("x", ""), ("y", "x")]);
        let recorder = Arc::new(Recorder { fail: vec!["a".to_string()], ..Default::default() });
        let outcome = Walker::new(2).walk(g, recorder.clone()).await;

        assert_eq!(outcome.status("a"), Some(&VertexStatus::Failed));
        assert_eq!(outcome.status("b"), Some(&VertexStatus::Skipped { because: "a".to_string() }));
        assert_eq!(outcome.status("c"), Some(&VertexStatus::Skipped { because: "a".to_string() }));
        assert_eq!(outcome.status("y"), Some(&VertexStatus::Succeeded));

        let visited = recorder.visited.lock().unwrap().clone();
        assert!(!visited.contains(&"b".to_string()));
        assert!(!visited.contains(&"c".to_string()));

        assert_eq!(outcome.errors.failed(), vec!["a"]);
        assert_eq!(outcome.errors.skipped(), vec!["b", "c"]);
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.exit_code(), 12);
    }

    #[tokio::test]
    async fn test_panic_is_a_failure() {
        let g = graph(&[("a", ""), ("b", "a"), ("z", "")]);
        let recorder = Arc::new(Recorder { panic_on: Some("a".to_string()), ..Default::default() });
        let outcome = Walker::new(1).walk(g, recorder).await;

        assert_eq!(outcome.status("a"), Some(&VertexStatus::Failed));
        assert!(outcome.errors.error_for("a").unwrap().to_string().contains("boom"));
        assert_eq!(outcome.status("b"), Some(&VertexStatus::Skipped { because: "a".to_string() }));
        assert_eq!(outcome.status("z"), Some(&VertexStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_cancellation_stops_scheduling() {
        let g = graph(&[("a", ""), ("b", "a"), ("c", "b")]);
        let token = CancelToken::new();
        let recorder = Arc::new(Recorder {
            cancel: Some(("a".to_string(), token.clone())),
            ..Default::default()
        });
        let outcome = Walker::new(4).with_cancel(token).walk(g, recorder.clone()).await;

        assert_eq!(outcome.status("a"), Some(&VertexStatus::Succeeded));
        assert_eq!(outcome.errors.cancelled(), vec!["b", "c"]);
        assert_eq!(*recorder.visited.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_child_token_follows_parent_only() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let second = parent.child();
        assert!(!second.is_cancelled());
        parent.cancel();
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn test_root_skip_is_not_reported() {
        let mut g = Graph::new();
        g.add_vertex(ordering("a")).unwrap();
        g.add_vertex(Vertex::root()).unwrap();
        g.connect("root", "a").unwrap();

        let recorder = Arc::new(Recorder { fail: vec!["a".to_string()], ..Default::default() });
        let outcome = Walker::new(1).walk(Arc::new(g), recorder).await;
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(outcome.status("root"), Some(VertexStatus::Skipped { .. })));
    }

    #[tokio::test]
    async fn test_empty_graph() {
        let outcome = Walker::default()
            .walk(Arc::new(Graph::new()), Arc::new(Recorder::default()))
            .await;
        assert!(outcome.statuses.is_empty());
        assert!(outcome.into_result().is_ok());
    }

    #[test]
    fn test_parallelism_has_a_floor() {
        assert_eq!(Walker::new(0).parallelism(), 1);
        assert_eq!(Walker::default().parallelism(), DEFAULT_PARALLELISM);
    }
}
