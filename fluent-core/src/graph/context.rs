//! Invocation Context
//!
//! One [`InvocationContext`] is created per top-level invocation of a task
//! group and handed to every task the traversal visits. It carries:
//!
//! - the key of the task the caller invoked (the root)
//! - the termination strategy for this invocation
//! - a property bag tasks can use to pass data around
//! - the shared sink where failures of the invocation are collected
//!
//! The context is cheap to clone; clones share the same state.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::node::{downcast, Indexable, NodeKey, TaskResult};
use crate::error::{Error, Result};

/// What a traversal does with tasks that have not started once a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminationStrategy {
    /// Keep starting every task whose dependencies reached a terminal state.
    /// Failures only affect the tasks that ask for the failed results.
    #[default]
    OnHittingLcaTask,

    /// Stop starting new tasks after the first failure and let the tasks that
    /// are already running finish.
    OnInProgressTasksCompletion,
}

/// Per-invocation state shared by all tasks of one traversal.
#[derive(Clone)]
pub struct InvocationContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    root_key: NodeKey,
    strategy: OnceLock<TerminationStrategy>,
    default_strategy: TerminationStrategy,
    properties: DashMap<String, Arc<dyn Any + Send + Sync>>,
    errors: Mutex<Vec<Error>>,
    cancelled: AtomicBool,
}

impl InvocationContext {
    /// Create a context for an invocation rooted at `root_key`.
    pub fn new(root_key: NodeKey) -> Self {
        Self::with_default_strategy(root_key, TerminationStrategy::default())
    }

    /// Create a context whose strategy falls back to `default_strategy`.
    pub(crate) fn with_default_strategy(
        root_key: NodeKey,
        default_strategy: TerminationStrategy,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                root_key,
                strategy: OnceLock::new(),
                default_strategy,
                properties: DashMap::new(),
                errors: Mutex::new(Vec::new()),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Key of the task the caller invoked.
    pub fn root_key(&self) -> &NodeKey {
        &self.inner.root_key
    }

    /// Set the termination strategy for this invocation.
    ///
    /// The strategy can be set once; a second call is an error.
    pub fn with_termination_strategy(self, strategy: TerminationStrategy) -> Result<Self> {
        self.inner.strategy.set(strategy).map_err(|_| {
            Error::invalid_state("termination strategy is already set for this context")
        })?;
        Ok(self)
    }

    /// The termination strategy in effect.
    pub fn termination_strategy(&self) -> TerminationStrategy {
        self.inner
            .strategy
            .get()
            .copied()
            .unwrap_or(self.inner.default_strategy)
    }

    /// Store a value under `key`, replacing any previous value.
    pub fn put<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.properties.insert(key.into(), Arc::new(value));
    }

    /// Get the value stored under `key` if it has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.properties.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    /// Check whether a value is stored under `key`.
    pub fn has_key(&self, key: &str) -> bool {
        self.inner.properties.contains_key(key)
    }

    /// Failures collected so far in this invocation.
    pub fn errors(&self) -> Vec<Error> {
        self.inner.errors.lock().clone()
    }

    /// Whether the invocation stopped starting new tasks.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Record a failure and apply the termination strategy.
    pub(crate) fn report_error(&self, error: Error) {
        if self.termination_strategy() == TerminationStrategy::OnInProgressTasksCompletion {
            self.inner.cancelled.store(true, Ordering::SeqCst);
        }
        if !error.is_skip_marker() {
            self.inner.errors.lock().push(error);
        }
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("root_key", &self.inner.root_key)
            .field("strategy", &self.termination_strategy())
            .field("properties", &self.inner.properties.len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Outcome of one task within a traversal.
pub type Outcome = std::result::Result<TaskResult, Error>;

/// The outcomes of a task's direct dependencies.
#[derive(Debug, Clone, Default)]
pub struct DependencyResults {
    task: String,
    outcomes: IndexMap<NodeKey, Outcome>,
}

impl DependencyResults {
    /// Create an empty set of results for the task with the given key.
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            outcomes: IndexMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, key: NodeKey, outcome: Outcome) {
        self.outcomes.insert(key, outcome);
    }

    /// The result of the dependency with the given key.
    ///
    /// Fails with [`Error::MissingDependency`] when that dependency failed or
    /// is not a dependency of this task.
    pub fn get(&self, key: &str) -> Result<TaskResult> {
        match self.outcomes.get(key) {
            Some(Ok(result)) => Ok(result.clone()),
            _ => Err(Error::MissingDependency {
                task: self.task.clone(),
                dependency: key.to_string(),
            }),
        }
    }

    /// The result of the dependency with the given key, downcast to `T`.
    pub fn get_as<T: Indexable>(&self, key: &str) -> Result<Arc<T>> {
        downcast::<T>(self.get(key)?).ok_or_else(|| Error::UnexpectedResultType(key.to_string()))
    }

    /// Whether `key` is a direct dependency of this task.
    pub fn contains(&self, key: &str) -> bool {
        self.outcomes.contains_key(key)
    }

    /// Keys of all direct dependencies.
    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.outcomes.keys()
    }

    /// Keys of the dependencies that did not complete successfully.
    pub fn failed(&self) -> impl Iterator<Item = &NodeKey> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_err())
            .map(|(key, _)| key)
    }

    /// Number of direct dependencies.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether the task has no dependencies.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::VoidIndexable;

    #[test]
    fn strategy_can_only_be_set_once() {
        let cx = InvocationContext::new(NodeKey::new("root"));
        assert_eq!(cx.termination_strategy(), TerminationStrategy::OnHittingLcaTask);

        let cx = cx
            .with_termination_strategy(TerminationStrategy::OnInProgressTasksCompletion)
            .unwrap();
        assert_eq!(
            cx.termination_strategy(),
            TerminationStrategy::OnInProgressTasksCompletion
        );

        let again = cx.with_termination_strategy(TerminationStrategy::OnHittingLcaTask);
        assert!(matches!(again, Err(Error::InvalidState(_))));
    }

    #[test]
    fn properties_are_typed() {
        let cx = InvocationContext::new(NodeKey::new("root"));
        cx.put("region", "westus".to_string());

        assert!(cx.has_key("region"));
        assert_eq!(cx.get::<String>("region").unwrap().as_str(), "westus");
        assert!(cx.get::<u32>("region").is_none());
        assert!(!cx.has_key("zone"));
    }

    #[test]
    fn clones_share_errors() {
        let cx = InvocationContext::new(NodeKey::new("root"));
        let clone = cx.clone();

        clone.report_error(Error::action("boom"));
        clone.report_error(Error::ErroredDependency);

        assert_eq!(cx.errors().len(), 1);
        assert!(!cx.is_cancelled());
    }

    #[test]
    fn stop_on_first_failure_cancels() {
        let cx = InvocationContext::new(NodeKey::new("root"))
            .with_termination_strategy(TerminationStrategy::OnInProgressTasksCompletion)
            .unwrap();
        cx.report_error(Error::action("boom"));
        assert!(cx.is_cancelled());
    }

    #[test]
    fn missing_dependency_result() {
        let mut deps = DependencyResults::new("vm");
        deps.insert(NodeKey::new("nic"), Ok(VoidIndexable::result("nic")));
        deps.insert(NodeKey::new("ip"), Err(Error::action("quota")));

        assert_eq!(deps.len(), 2);
        assert!(deps.get("nic").is_ok());
        assert!(deps.get_as::<VoidIndexable>("nic").is_ok());
        assert_eq!(deps.failed().collect::<Vec<_>>(), vec![&NodeKey::new("ip")]);

        match deps.get("ip") {
            Err(Error::MissingDependency { task, dependency }) => {
                assert_eq!(task, "vm");
                assert_eq!(dependency, "ip");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(deps.get("disk"), Err(Error::MissingDependency { .. })));
    }
}
