//! Graph Nodes
//!
//! This module defines what lives in the task graph: the key that identifies
//! a task, the results a task produces, and the [`TaskItem`] capability that
//! every resource builder implements to take part in a traversal.

use std::any::Any;
use std::borrow::Borrow;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use super::context::{DependencyResults, InvocationContext};
use super::group::TaskGroup;
use crate::error::Result;

/// Unique key of a task in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(Arc<str>);

impl NodeKey {
    /// Create a key from a name.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Generate a new unique key.
    ///
    /// Keys are unique across every graph in the process, so groups built
    /// in separate arenas can always be merged.
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self::new(format!("task-{}", COUNTER.fetch_add(1, Ordering::Relaxed)))
    }

    /// Key of the proxy task standing in for `self`.
    pub(crate) fn proxy(&self) -> Self {
        Self::new(format!("proxy-{}", self.0))
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for NodeKey {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for NodeKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for NodeKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

/// Conversion into `Any`, implemented for every sized `Send + Sync` type.
pub trait AsAny: Any + Send + Sync {
    /// Convert a shared result into `Any` so it can be downcast.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Borrow as `Any`.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Anything a task can produce: a resource, a child resource, a void marker.
pub trait Indexable: AsAny + fmt::Debug {
    /// The key of the task that produced this value.
    fn key(&self) -> &str;
}

/// Shared, type erased task result.
pub type TaskResult = Arc<dyn Indexable>;

/// Downcast a task result to a concrete type.
pub fn downcast<T: Indexable>(result: TaskResult) -> Option<Arc<T>> {
    result.into_any().downcast::<T>().ok()
}

/// Result of a task that produces nothing, e.g. a deletion.
///
/// Dependents still observe its completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoidIndexable {
    key: String,
}

impl VoidIndexable {
    /// Create a void result for the task with the given key.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Create a void result already wrapped as a [`TaskResult`].
    pub fn result(key: impl Into<String>) -> TaskResult {
        Arc::new(Self::new(key))
    }
}

impl Indexable for VoidIndexable {
    fn key(&self) -> &str {
        &self.key
    }
}

/// A unit of work that can be scheduled in a [`TaskGroup`].
///
/// The engine depends only on this trait, never on concrete resource types.
#[async_trait]
pub trait TaskItem: Send + Sync + 'static {
    /// Run the task.
    ///
    /// `dependencies` holds the outcome of every direct dependency. Reading
    /// the result of a dependency that failed yields
    /// [`Error::MissingDependency`](crate::Error::MissingDependency).
    async fn invoke(
        &self,
        context: &InvocationContext,
        dependencies: &DependencyResults,
    ) -> Result<TaskResult>;

    /// Called once per traversal before any task runs.
    ///
    /// The task may add dependencies or post-run dependents to `group`.
    fn before_group_invoke(&self, _group: &TaskGroup) -> Result<()> {
        Ok(())
    }

    /// Called after the post-run dependents of this task finished.
    ///
    /// `group_faulted` tells whether anything this stage waited on failed.
    async fn after_post_run(&self, _group_faulted: bool) -> Result<()> {
        Ok(())
    }

    /// Whether the result cached by an earlier traversal may be reused.
    ///
    /// Tasks whose state can change between traversals (e.g. a child
    /// resource with a newly queued operation) return `false` while they
    /// have work pending.
    fn reuse_cached_result(&self) -> bool {
        true
    }
}

type BoxedAction =
    dyn Fn(InvocationContext, DependencyResults) -> BoxFuture<'static, Result<TaskResult>> + Send + Sync;

/// A task backed by a closure.
///
/// # Example
///
/// ```rust,ignore
/// let task = FnTask::new(|_cx, deps| async move {
///     let network = deps.get("network")?;
///     Ok(VoidIndexable::result("vm"))
/// });
/// ```
pub struct FnTask {
    action: Box<BoxedAction>,
}

impl FnTask {
    /// Create a task from an async closure.
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: Fn(InvocationContext, DependencyResults) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskResult>> + Send + 'static,
    {
        let action: Box<BoxedAction> = Box::new(
            move |cx: InvocationContext, deps: DependencyResults| -> BoxFuture<'static, Result<TaskResult>> {
                Box::pin(action(cx, deps))
            },
        );
        Self { action }
    }
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskItem for FnTask {
    async fn invoke(
        &self,
        context: &InvocationContext,
        dependencies: &DependencyResults,
    ) -> Result<TaskResult> {
        (self.action)(context.clone(), dependencies.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Network {
        name: String,
    }

    impl Indexable for Network {
        fn key(&self) -> &str {
            &self.name
        }
    }

    #[test]
    fn generated_keys_are_unique() {
        let key1 = NodeKey::generate();
        let key2 = NodeKey::generate();
        assert_ne!(key1, key2);
    }

    #[test]
    fn proxy_key_is_derived_from_actual() {
        let key = NodeKey::new("vm1");
        assert_eq!(key.proxy().as_str(), "proxy-vm1");
    }

    #[test]
    fn downcast_to_concrete_type() {
        let result: TaskResult = Arc::new(Network {
            name: "net".to_string(),
        });
        assert_eq!(result.key(), "net");

        let network = downcast::<Network>(result.clone()).unwrap();
        assert_eq!(network.name, "net");
        assert!(downcast::<VoidIndexable>(result).is_none());
    }

    #[test]
    fn void_result_keeps_key() {
        let result = VoidIndexable::result("deleted");
        assert_eq!(result.key(), "deleted");
        assert!((*result).as_any().is::<VoidIndexable>());
    }
}
