//! Task Groups
//!
//! A [`TaskGroup`] is a task together with everything it transitively
//! depends on. Groups are composed by adding dependencies and post-run
//! dependents; invoking a group runs every task of the closure once, in
//! dependency order, and streams the results.
//!
//! # Post-run dependents
//!
//! A post-run dependent `F` of task `A` runs after `A`, and anything that
//! depends on `A` must also wait for `F`. This is done by giving `A` a proxy
//! task `P(A)` the first time a post-run dependent is added:
//!
//! ```text
//!   parent ──► P(A) ──► F ──► A ──► deps of A
//!                │              ▲
//!                └──────────────┘
//! ```
//!
//! Existing dependents of `A` are re-pointed at `P(A)`, and invoking the
//! group of `A` invokes the group of `P(A)`.

use std::sync::Arc;

use tracing::debug;

use super::context::InvocationContext;
use super::dag::TaskGraph;
use super::node::{NodeKey, TaskItem, TaskResult};
use super::scheduler::TaskStream;
use crate::error::{Error, Result};

/// A task and its transitive dependencies.
#[derive(Clone, Debug)]
pub struct TaskGroup {
    graph: TaskGraph,
    root: NodeKey,
}

impl TaskGroup {
    pub(crate) fn new(graph: TaskGraph, root: NodeKey) -> Self {
        Self { graph, root }
    }

    /// Create a group with a single task in a new graph.
    pub fn single(key: impl Into<NodeKey>, item: Arc<dyn TaskItem>) -> Self {
        TaskGraph::rooted(key.into(), item)
    }

    /// Key of the root task.
    pub fn key(&self) -> &NodeKey {
        &self.root
    }

    /// The graph this group lives in.
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Key of the proxy standing in for the root, if it has one.
    pub fn proxy_key(&self) -> Option<NodeKey> {
        self.graph
            .read(|dag| dag.get(&self.root).and_then(|entry| entry.proxy.clone()))
    }

    /// Key of the task an invocation of this group starts from.
    pub(crate) fn invocation_root(&self) -> NodeKey {
        self.proxy_key().unwrap_or_else(|| self.root.clone())
    }

    /// Make the root task depend on the root of `dependency`.
    ///
    /// When `dependency` has post-run dependents, the root waits for them
    /// too. Returns the key of the dependency's root.
    pub fn add_dependency(&self, dependency: &TaskGroup) -> Result<NodeKey> {
        self.graph.merge(&dependency.graph)?;
        self.graph.write(|dag| {
            let target = dag
                .entry(&dependency.root)?
                .proxy
                .clone()
                .unwrap_or_else(|| dependency.root.clone());
            dag.add_edge(&self.root, &target)
        })?;
        debug!(task = %self.root, dependency = %dependency.root, "added dependency");
        Ok(dependency.root.clone())
    }

    /// Run `dependent` after the root task, and make everything that
    /// depends on the root also wait for `dependent`.
    pub fn add_post_run_dependent(&self, dependent: &TaskGroup) -> Result<()> {
        self.graph.merge(&dependent.graph)?;
        self.graph.write(|dag| {
            let proxy = dag.ensure_proxy(&self.root)?;
            dag.add_edge(&dependent.root, &self.root)?;

            let target = dag
                .entry(&dependent.root)?
                .proxy
                .clone()
                .unwrap_or_else(|| dependent.root.clone());
            dag.add_edge(&proxy, &target)
        })?;
        debug!(task = %self.root, dependent = %dependent.root, "added post-run dependent");
        Ok(())
    }

    /// Whether the root of `other` is among the tasks this root depends on.
    pub fn depends_on(&self, other: &TaskGroup) -> bool {
        self.graph.same_graph(&other.graph)
            && self.graph.read(|dag| dag.reaches(&self.root, &other.root))
    }

    /// Keys of every task an invocation of this group runs.
    pub fn node_keys(&self) -> Vec<NodeKey> {
        let root = self.invocation_root();
        self.graph.read(|dag| dag.closure(&root))
    }

    /// Keys of every task of this group, dependencies first.
    pub fn execution_order(&self) -> Vec<NodeKey> {
        let root = self.invocation_root();
        self.graph.read(|dag| dag.topological_sort(&root))
    }

    /// Keys of the direct dependencies of a task.
    pub fn dependency_keys(&self, key: &str) -> Result<Vec<NodeKey>> {
        self.graph
            .read(|dag| Ok(dag.entry(key)?.dependencies.iter().cloned().collect()))
    }

    /// Keys of the direct dependents of a task.
    pub fn dependent_keys(&self, key: &str) -> Result<Vec<NodeKey>> {
        self.graph
            .read(|dag| Ok(dag.entry(key)?.dependents.iter().cloned().collect()))
    }

    /// The result a task produced in its last successful invocation.
    pub fn task_result(&self, key: &str) -> Result<Option<TaskResult>> {
        self.graph.read(|dag| Ok(dag.entry(key)?.result.clone()))
    }

    /// Forget the cached result of the root task.
    pub fn clear_result(&self) {
        self.graph.write(|dag| {
            if let Some(entry) = dag.get_mut(&self.root) {
                entry.result = None;
            }
        });
    }

    /// Create a context for invoking this group.
    ///
    /// The termination strategy defaults to the one the graph was
    /// configured with.
    pub fn new_invocation_context(&self) -> InvocationContext {
        let strategy = self.graph.read(|dag| dag.default_strategy());
        InvocationContext::with_default_strategy(self.invocation_root(), strategy)
    }

    /// Invoke the group.
    ///
    /// Nothing runs until the returned stream is polled. Dropping the
    /// stream stops the traversal from starting further tasks.
    pub fn invoke(&self, context: InvocationContext) -> TaskStream {
        TaskStream::new(self.clone(), context)
    }

    /// Invoke the group and return the result of the root task.
    ///
    /// Fails with the aggregate error if any task failed.
    pub async fn invoke_root(&self) -> Result<TaskResult> {
        let mut stream = self.invoke(self.new_invocation_context());
        if let Some(error) = stream.drain().await {
            return Err(error);
        }
        stream
            .root_result()
            .cloned()
            .ok_or_else(|| Error::invalid_state(format!("task '{}' produced no result", self.root)))
    }
}

/// Implemented by everything that owns a task group, such as resource
/// builders and child resources.
pub trait HasTaskGroup {
    /// The group whose root task creates or updates `self`.
    fn task_group(&self) -> &TaskGroup;

    /// Key of the root task.
    fn task_key(&self) -> &NodeKey {
        self.task_group().key()
    }
}

impl HasTaskGroup for TaskGroup {
    fn task_group(&self) -> &TaskGroup {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FnTask, VoidIndexable};

    fn task(graph: &TaskGraph, key: &str) -> TaskGroup {
        let name = key.to_string();
        graph
            .add_task(
                key,
                FnTask::new(move |_, _| {
                    let name = name.clone();
                    async move { Ok(VoidIndexable::result(name)) }
                }),
            )
            .unwrap()
    }

    #[test]
    fn dependencies_merge_graphs() {
        let a = task(&TaskGraph::new(), "a");
        let b = task(&TaskGraph::new(), "b");

        let key = a.add_dependency(&b).unwrap();
        assert_eq!(key.as_str(), "b");
        assert!(a.graph().same_graph(b.graph()));
        assert!(a.depends_on(&b));
        assert!(!b.depends_on(&a));
        assert_eq!(a.node_keys().len(), 2);
    }

    #[test]
    fn post_run_dependent_activates_proxy() {
        let graph = TaskGraph::new();
        let parent = task(&graph, "parent");
        let a = task(&graph, "a");
        let f = task(&graph, "f");

        parent.add_dependency(&a).unwrap();
        a.add_post_run_dependent(&f).unwrap();

        assert_eq!(a.proxy_key().unwrap().as_str(), "proxy-a");
        assert_eq!(parent.dependency_keys("parent").unwrap(), vec![NodeKey::new("proxy-a")]);
        assert!(f.depends_on(&a));

        let proxy_deps = a.dependency_keys("proxy-a").unwrap();
        assert!(proxy_deps.contains(&NodeKey::new("a")));
        assert!(proxy_deps.contains(&NodeKey::new("f")));

        // The proxy is what an invocation of `a` starts from
        assert_eq!(a.new_invocation_context().root_key().as_str(), "proxy-a");
    }

    #[test]
    fn later_dependents_use_the_proxy() {
        let graph = TaskGraph::new();
        let a = task(&graph, "a");
        let f = task(&graph, "f");
        let late = task(&graph, "late");

        a.add_post_run_dependent(&f).unwrap();
        late.add_dependency(&a).unwrap();

        assert_eq!(late.dependency_keys("late").unwrap(), vec![NodeKey::new("proxy-a")]);
    }

    #[test]
    fn cyclic_composition_is_rejected() {
        let graph = TaskGraph::new();
        let a = task(&graph, "a");
        let b = task(&graph, "b");

        a.add_dependency(&b).unwrap();
        assert!(matches!(a.add_dependency(&a), Err(Error::CycleDetected { .. })));
        assert!(matches!(b.add_dependency(&a), Err(Error::CycleDetected { .. })));
    }

    #[test]
    fn execution_order_respects_dependencies() {
        let graph = TaskGraph::new();
        let a = task(&graph, "a");
        let b = task(&graph, "b");
        let c = task(&graph, "c");
        a.add_dependency(&b).unwrap();
        b.add_dependency(&c).unwrap();

        let order: Vec<_> = a.execution_order().iter().map(|k| k.to_string()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }
}
