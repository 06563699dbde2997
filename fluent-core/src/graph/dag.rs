//! Task Graph Arena
//!
//! All tasks that may take part in one traversal live in a single arena,
//! indexed by [`NodeKey`]. Edges are stored by key on both ends, so shared
//! sub-resources and proxy tasks never need direct object references.
//!
//! # Design Decisions
//!
//! 1. Edges are checked for cycles when they are inserted. A cyclic edge is
//!    a programming error and is rejected immediately instead of being
//!    discovered (or looped on) during a traversal.
//!
//! 2. Composing two groups that were built in different arenas merges the
//!    smaller arena into the larger one. The emptied arena keeps a forward
//!    pointer so every handle to it keeps working.
//!
//! 3. Task results are cached on the entry of the task that produced them.
//!    The cache outlives a traversal; the scheduler decides when it may be
//!    used.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::context::TerminationStrategy;
use super::group::TaskGroup;
use super::node::{NodeKey, TaskItem, TaskResult};
use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// What an entry in the arena holds.
#[derive(Clone)]
pub(crate) enum Slot {
    /// A task supplied by the caller.
    Task(Arc<dyn TaskItem>),
    /// The proxy of the task with the given key.
    ///
    /// Depends on the actual task and on its post-run dependents, and
    /// stands in for the actual task as the dependency of everything else.
    Proxy { actual: NodeKey },
}

impl Slot {
    /// Whether both slots stand for the same task instance.
    fn same_instance(&self, other: &Slot) -> bool {
        match (self, other) {
            (Slot::Task(a), Slot::Task(b)) => Arc::ptr_eq(a, b),
            (Slot::Proxy { actual: a }, Slot::Proxy { actual: b }) => a == b,
            _ => false,
        }
    }
}

/// A task in the arena together with its edges.
pub(crate) struct Entry {
    pub(crate) slot: Slot,
    /// Tasks this task waits for.
    pub(crate) dependencies: IndexSet<NodeKey>,
    /// Tasks that wait for this task.
    pub(crate) dependents: IndexSet<NodeKey>,
    /// The proxy of this task, once it has post-run dependents.
    pub(crate) proxy: Option<NodeKey>,
    /// Result of the last successful invocation.
    pub(crate) result: Option<TaskResult>,
}

impl Entry {
    fn new(slot: Slot) -> Self {
        Self {
            slot,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
            proxy: None,
            result: None,
        }
    }
}

/// The arena: entries indexed by key.
#[derive(Default)]
pub(crate) struct Dag {
    entries: IndexMap<NodeKey, Entry>,
    default_strategy: TerminationStrategy,
}

impl Dag {
    pub(crate) fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    pub(crate) fn entry(&self, key: &str) -> Result<&Entry> {
        self.get(key).ok_or_else(|| Error::TaskNotFound(key.to_string()))
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn default_strategy(&self) -> TerminationStrategy {
        self.default_strategy
    }

    /// Add an entry. Keys must be unique within the arena.
    pub(crate) fn insert(&mut self, key: NodeKey, slot: Slot) -> Result<()> {
        if self.entries.contains_key(&key) {
            return Err(Error::DuplicateTask(key.to_string()));
        }
        self.entries.insert(key, Entry::new(slot));
        Ok(())
    }

    /// Add an edge: `dependent` waits for `dependency`.
    ///
    /// Adding an edge that already exists is a no-op.
    pub(crate) fn add_edge(&mut self, dependent: &NodeKey, dependency: &NodeKey) -> Result<()> {
        self.entry(dependent)?;
        self.entry(dependency)?;

        if dependent == dependency || self.reaches(dependency, dependent) {
            warn!(%dependent, %dependency, "rejected cyclic dependency");
            return Err(Error::CycleDetected {
                dependent: dependent.to_string(),
                dependency: dependency.to_string(),
            });
        }

        if let Some(entry) = self.entries.get_mut(dependent) {
            entry.dependencies.insert(dependency.clone());
        }
        if let Some(entry) = self.entries.get_mut(dependency) {
            entry.dependents.insert(dependent.clone());
        }
        debug!(%dependent, %dependency, "added dependency edge");
        Ok(())
    }

    /// Remove an edge if it exists.
    pub(crate) fn remove_edge(&mut self, dependent: &NodeKey, dependency: &NodeKey) {
        if let Some(entry) = self.entries.get_mut(dependent) {
            entry.dependencies.shift_remove(dependency);
        }
        if let Some(entry) = self.entries.get_mut(dependency) {
            entry.dependents.shift_remove(dependent);
        }
    }

    /// Whether `from` transitively depends on `to` (or is `to`).
    pub(crate) fn reaches(&self, from: &NodeKey, to: &NodeKey) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];

        while let Some(key) = stack.pop() {
            if key == to {
                return true;
            }
            if !visited.insert(key) {
                continue;
            }
            if let Some(entry) = self.entries.get(key) {
                stack.extend(entry.dependencies.iter());
            }
        }
        false
    }

    /// Every task `root` transitively depends on, `root` included.
    ///
    /// Keys are returned in discovery order, starting with `root`.
    pub(crate) fn closure(&self, root: &NodeKey) -> Vec<NodeKey> {
        let mut visited = IndexSet::new();
        let mut queue = VecDeque::from([root.clone()]);

        while let Some(key) = queue.pop_front() {
            if !visited.insert(key.clone()) {
                continue;
            }
            if let Some(entry) = self.entries.get(&key) {
                queue.extend(entry.dependencies.iter().cloned());
            }
        }
        visited.into_iter().collect()
    }

    /// The closure of `root` sorted so dependencies come before dependents.
    pub(crate) fn topological_sort(&self, root: &NodeKey) -> Vec<NodeKey> {
        let nodes = self.closure(root);
        let node_set: HashSet<_> = nodes.iter().cloned().collect();
        let mut in_degree: HashMap<NodeKey, usize> = HashMap::new();
        let mut result = Vec::with_capacity(nodes.len());
        let mut queue = VecDeque::new();

        // Closure order is root first; walk it backwards so leaves queue first
        for key in nodes.iter().rev() {
            if let Some(entry) = self.entries.get(key) {
                let degree = entry.dependencies.len();
                in_degree.insert(key.clone(), degree);
                if degree == 0 {
                    queue.push_back(key.clone());
                }
            }
        }

        // Kahn's algorithm
        while let Some(key) = queue.pop_front() {
            if let Some(entry) = self.entries.get(&key) {
                for dependent in entry.dependents.iter().filter(|d| node_set.contains(*d)) {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            result.push(key);
        }

        result
    }

    /// Give `actual` a proxy if it does not have one yet.
    ///
    /// Everything that already depended on `actual` is re-pointed at the
    /// proxy, so it also waits for the post-run dependents added later.
    pub(crate) fn ensure_proxy(&mut self, actual: &NodeKey) -> Result<NodeKey> {
        let entry = self.entry(actual)?;
        if let Some(proxy) = &entry.proxy {
            return Ok(proxy.clone());
        }

        let proxy = actual.proxy();
        let parents: Vec<NodeKey> = entry.dependents.iter().cloned().collect();
        self.insert(
            proxy.clone(),
            Slot::Proxy {
                actual: actual.clone(),
            },
        )?;

        for parent in &parents {
            self.remove_edge(parent, actual);
            self.add_edge(parent, &proxy)?;
        }
        self.add_edge(&proxy, actual)?;
        if let Some(entry) = self.entries.get_mut(actual) {
            entry.proxy = Some(proxy.clone());
        }

        debug!(task = %actual, %proxy, repointed = parents.len(), "activated proxy");
        Ok(proxy)
    }

    /// Move every entry of `other` into `self`.
    ///
    /// A key held by both arenas must denote the same task instance. Its
    /// edges are united, and if either side gave it a proxy, dependents
    /// from the other side are re-pointed at that proxy.
    fn absorb(&mut self, other: &mut Dag) -> Result<()> {
        let shared: Vec<NodeKey> = other
            .entries
            .keys()
            .filter(|key| self.entries.contains_key(*key))
            .cloned()
            .collect();
        for key in &shared {
            if !self.entries[key].slot.same_instance(&other.entries[key].slot) {
                return Err(Error::DuplicateTask(key.to_string()));
            }
        }
        if !shared.is_empty() {
            self.check_acyclic_with(other)?;
        }

        for (key, entry) in other.entries.drain(..) {
            match self.entries.get_mut(&key) {
                Some(existing) => {
                    existing.dependencies.extend(entry.dependencies);
                    existing.dependents.extend(entry.dependents);
                    existing.proxy = existing.proxy.take().or(entry.proxy);
                    existing.result = existing.result.take().or(entry.result);
                }
                None => {
                    self.entries.insert(key, entry);
                }
            }
        }

        for actual in &shared {
            let Some(proxy) = self.entries.get(actual).and_then(|e| e.proxy.clone()) else {
                continue;
            };
            // Post-run dependents wait for the actual task, not the proxy
            let parents: Vec<NodeKey> = self.entries[actual]
                .dependents
                .iter()
                .filter(|parent| **parent != proxy && !self.reaches(&proxy, parent))
                .cloned()
                .collect();
            for parent in &parents {
                self.remove_edge(parent, actual);
                self.add_edge(parent, &proxy)?;
            }
        }
        debug!(shared = shared.len(), "absorbed arena");
        Ok(())
    }

    /// Fail if the edges of `self` and `other` together form a cycle.
    fn check_acyclic_with(&self, other: &Dag) -> Result<()> {
        let mut dependencies: HashMap<&NodeKey, HashSet<&NodeKey>> = HashMap::new();
        for (key, entry) in self.entries.iter().chain(other.entries.iter()) {
            dependencies
                .entry(key)
                .or_default()
                .extend(entry.dependencies.iter());
        }

        let mut dependents: HashMap<&NodeKey, Vec<&NodeKey>> = HashMap::new();
        let mut pending: HashMap<&NodeKey, usize> = HashMap::new();
        for (key, edges) in &dependencies {
            pending.insert(*key, edges.len());
            for dependency in edges {
                dependents.entry(*dependency).or_default().push(*key);
            }
        }

        // Kahn's algorithm; whatever is never released sits on a cycle
        let mut queue: VecDeque<&NodeKey> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(key, _)| *key)
            .collect();
        while let Some(key) = queue.pop_front() {
            for dependent in dependents.get(key).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        let stuck = |key: &&NodeKey| pending.get(*key).is_some_and(|count| *count > 0);
        let cycle = dependencies.iter().find(|(key, _)| stuck(*key)).and_then(|(key, edges)| {
            edges.iter().find(|dependency| stuck(*dependency)).map(|dependency| (*key, *dependency))
        });
        match cycle {
            Some((dependent, dependency)) => {
                warn!(%dependent, %dependency, "rejected merge that would create a cycle");
                Err(Error::CycleDetected {
                    dependent: dependent.to_string(),
                    dependency: dependency.to_string(),
                })
            }
            None => Ok(()),
        }
    }
}

struct GraphCell {
    dag: RwLock<Dag>,
    merged_into: RwLock<Option<Arc<GraphCell>>>,
}

/// Shared handle to an arena of tasks.
///
/// Cloning the handle does not copy the arena.
#[derive(Clone)]
pub struct TaskGraph {
    cell: Arc<GraphCell>,
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::from_dag(Dag::default())
    }

    /// Create an empty graph whose invocations use the configured strategy.
    pub fn with_config(config: &ClientConfig) -> Self {
        Self::from_dag(Dag {
            entries: IndexMap::new(),
            default_strategy: config.termination_strategy,
        })
    }

    /// Create a graph holding a single task and return its group.
    pub(crate) fn rooted(key: NodeKey, item: Arc<dyn TaskItem>) -> TaskGroup {
        let mut dag = Dag::default();
        dag.entries.insert(key.clone(), Entry::new(Slot::Task(item)));
        TaskGroup::new(Self::from_dag(dag), key)
    }

    fn from_dag(dag: Dag) -> Self {
        Self {
            cell: Arc::new(GraphCell {
                dag: RwLock::new(dag),
                merged_into: RwLock::new(None),
            }),
        }
    }

    /// Add a task and get the group that has it as root.
    pub fn add_task<T: TaskItem>(&self, key: impl Into<NodeKey>, item: T) -> Result<TaskGroup> {
        self.add_shared_task(key, Arc::new(item))
    }

    /// Add a task that is shared with the caller.
    pub fn add_shared_task(
        &self,
        key: impl Into<NodeKey>,
        item: Arc<dyn TaskItem>,
    ) -> Result<TaskGroup> {
        let key = key.into();
        self.write(|dag| dag.insert(key.clone(), Slot::Task(item)))?;
        Ok(TaskGroup::new(self.clone(), key))
    }

    /// The group rooted at an existing task.
    pub fn group(&self, key: &str) -> Result<TaskGroup> {
        let key = self.read(|dag| dag.entry(key).map(|_| NodeKey::new(key)))?;
        Ok(TaskGroup::new(self.clone(), key))
    }

    /// Number of entries, proxies included.
    pub fn len(&self) -> usize {
        self.read(Dag::len)
    }

    /// Whether the graph has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry with the given key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.read(|dag| dag.contains(key))
    }

    /// Whether both handles refer to the same arena.
    pub fn same_graph(&self, other: &TaskGraph) -> bool {
        Arc::ptr_eq(&self.live(), &other.live())
    }

    /// Make sure `self` and `other` share one arena.
    pub(crate) fn merge(&self, other: &TaskGraph) -> Result<()> {
        let a = self.live();
        let b = other.live();
        if Arc::ptr_eq(&a, &b) {
            return Ok(());
        }

        // Lock in address order so two concurrent merges cannot deadlock.
        let (first, second) = if Arc::as_ptr(&a) < Arc::as_ptr(&b) {
            (&a, &b)
        } else {
            (&b, &a)
        };
        let mut first_dag = first.dag.write();
        let mut second_dag = second.dag.write();

        let (target, source, source_cell, target_cell) = if first_dag.len() >= second_dag.len() {
            (&mut *first_dag, &mut *second_dag, second, first)
        } else {
            (&mut *second_dag, &mut *first_dag, first, second)
        };

        let moved = source.len();
        target.absorb(source)?;
        *source_cell.merged_into.write() = Some(Arc::clone(target_cell));
        debug!(moved, total = target.len(), "merged task graphs");
        Ok(())
    }

    fn live(&self) -> Arc<GraphCell> {
        let mut cell = Arc::clone(&self.cell);
        loop {
            let next = cell.merged_into.read().clone();
            match next {
                Some(next) => cell = next,
                None => return cell,
            }
        }
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&Dag) -> R) -> R {
        let cell = self.live();
        let dag = cell.dag.read();
        f(&dag)
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut Dag) -> R) -> R {
        let cell = self.live();
        let mut dag = cell.dag.write();
        f(&mut dag)
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph").field("len", &self.len()).finish()
    }
}
