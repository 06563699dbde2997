//! Task Scheduler
//!
//! [`TaskStream`] drives one invocation of a task group. It runs every task
//! of the group's closure exactly once and yields each result as soon as the
//! task that produced it finishes.
//!
//! # Algorithm
//!
//! The traversal is Kahn's algorithm run incrementally:
//!
//! 1. Let every task of the closure prepare itself. A task may add new
//!    dependencies while preparing, so this repeats until no new task shows up
//! 2. Snapshot the closure into a plan with a pending-dependency count per task
//! 3. Start every task whose count is zero
//! 4. When a task finishes, record its outcome, yield its result and
//!    decrement the counts of its dependents, starting those that reach zero
//! 5. Once nothing is running, yield the aggregate of all reported failures
//!
//! A failed task does not stop its dependents from running. They see the
//! failure when they ask for the missing result.
//!
//! # Caching
//!
//! A task that already produced a result in an earlier traversal is not
//! invoked again; its cached result is yielded instead. The task the caller
//! invoked is always run, even when it has a cached result.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::{self, BoxFuture};
use futures_util::stream::{FuturesUnordered, Stream, StreamExt};
use futures_util::FutureExt;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::context::{DependencyResults, InvocationContext, Outcome};
use super::dag::{Dag, Slot};
use super::group::TaskGroup;
use super::node::{NodeKey, TaskItem, TaskResult};
use crate::error::{Error, Result};

enum PlannedKind {
    Task {
        item: Arc<dyn TaskItem>,
        cached: Option<TaskResult>,
        always_run: bool,
    },
    Proxy {
        item: Arc<dyn TaskItem>,
        actual: usize,
    },
}

struct PlannedNode {
    key: NodeKey,
    kind: PlannedKind,
    dependencies: SmallVec<[usize; 4]>,
    dependents: SmallVec<[usize; 4]>,
    pending: usize,
    outcome: Option<Outcome>,
    /// This task or something it depends on failed.
    faulted: bool,
}

/// Snapshot of the closure being traversed. Index 0 is the root.
struct Plan {
    nodes: Vec<PlannedNode>,
    remaining: usize,
}

impl Plan {
    fn build(dag: &Dag, root: &NodeKey) -> Result<Self> {
        let keys = dag.closure(root);
        let index: HashMap<&NodeKey, usize> =
            keys.iter().enumerate().map(|(i, key)| (key, i)).collect();

        let mut nodes = Vec::with_capacity(keys.len());
        for key in &keys {
            let entry = dag.entry(key)?;
            let kind = match &entry.slot {
                Slot::Task(item) => PlannedKind::Task {
                    item: Arc::clone(item),
                    cached: entry.result.clone(),
                    always_run: key == root || entry.proxy.as_ref() == Some(root),
                },
                Slot::Proxy { actual } => {
                    let item = match &dag.entry(actual)?.slot {
                        Slot::Task(item) => Arc::clone(item),
                        Slot::Proxy { .. } => {
                            return Err(Error::invalid_state(format!(
                                "proxy '{key}' stands in for another proxy"
                            )))
                        }
                    };
                    let actual = *index
                        .get(actual)
                        .ok_or_else(|| Error::TaskNotFound(actual.to_string()))?;
                    PlannedKind::Proxy { item, actual }
                }
            };

            let dependencies: SmallVec<[usize; 4]> = entry
                .dependencies
                .iter()
                .filter_map(|dependency| index.get(dependency).copied())
                .collect();

            nodes.push(PlannedNode {
                key: key.clone(),
                kind,
                pending: dependencies.len(),
                dependencies,
                dependents: SmallVec::new(),
                outcome: None,
                faulted: false,
            });
        }

        for i in 0..nodes.len() {
            for dependency in nodes[i].dependencies.clone() {
                nodes[dependency].dependents.push(i);
            }
        }

        Ok(Self {
            remaining: nodes.len(),
            nodes,
        })
    }

    /// Whether the result of `index` is the result of the invoked task.
    fn is_root_result(&self, index: usize) -> bool {
        match self.nodes.first().map(|root| &root.kind) {
            Some(PlannedKind::Proxy { actual, .. }) => index == 0 || index == *actual,
            _ => index == 0,
        }
    }

    /// Outcomes of the direct dependencies of `index`, keyed by the task
    /// that produced them. A proxy reports under the key of its actual task.
    fn dependency_results(&self, index: usize) -> DependencyResults {
        let node = &self.nodes[index];
        let mut results = DependencyResults::new(node.key.as_str());

        for &d in &node.dependencies {
            let dependency = &self.nodes[d];
            let key = match dependency.kind {
                PlannedKind::Proxy { actual, .. } => self.nodes[actual].key.clone(),
                PlannedKind::Task { .. } => dependency.key.clone(),
            };
            let outcome = dependency
                .outcome
                .clone()
                .unwrap_or_else(|| Err(Error::TaskNotFound(dependency.key.to_string())));
            results.insert(key, outcome);
        }

        results
    }
}

/// Stream of the results of one task group invocation.
///
/// Yields `Ok` for every task that produced a result, in completion order.
/// If any task failed, the last item is an `Err` with the aggregate of all
/// failures.
pub struct TaskStream {
    group: TaskGroup,
    context: InvocationContext,
    plan: Option<Plan>,
    running: FuturesUnordered<BoxFuture<'static, (usize, Outcome)>>,
    outbox: VecDeque<Result<TaskResult>>,
    root_result: Option<TaskResult>,
    started: bool,
    finished: bool,
}

impl TaskStream {
    pub(crate) fn new(group: TaskGroup, context: InvocationContext) -> Self {
        Self {
            group,
            context,
            plan: None,
            running: FuturesUnordered::new(),
            outbox: VecDeque::new(),
            root_result: None,
            started: false,
            finished: false,
        }
    }

    /// The context shared by the tasks of this invocation.
    pub fn context(&self) -> &InvocationContext {
        &self.context
    }

    /// Result of the invoked task, once it completed successfully.
    pub fn root_result(&self) -> Option<&TaskResult> {
        self.root_result.as_ref()
    }

    /// Run the stream to completion and return the aggregate failure, if any.
    pub async fn drain(&mut self) -> Option<Error> {
        let mut failure = None;
        while let Some(item) = self.next().await {
            if let Err(error) = item {
                failure = Some(error);
            }
        }
        failure
    }

    fn start(&mut self) {
        debug!(root = %self.group.key(), "invoking task group");

        if let Err(error) = self.prepare() {
            warn!(root = %self.group.key(), %error, "task group preparation failed");
            self.outbox.push_back(Err(error));
            self.finished = true;
            return;
        }

        let root = self.group.invocation_root();
        match self.group.graph().read(|dag| Plan::build(dag, &root)) {
            Ok(plan) => {
                debug!(%root, tasks = plan.nodes.len(), "planned traversal");
                let ready: Vec<usize> = plan
                    .nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, node)| node.pending == 0)
                    .map(|(i, _)| i)
                    .collect();
                self.plan = Some(plan);
                for index in ready {
                    self.launch(index);
                }
            }
            Err(error) => {
                self.outbox.push_back(Err(error));
                self.finished = true;
            }
        }
    }

    /// Call `before_group_invoke` on every task until no new task appears.
    fn prepare(&self) -> Result<()> {
        let graph = self.group.graph();
        let mut prepared: HashSet<NodeKey> = HashSet::new();

        loop {
            let root = self.group.invocation_root();
            let unseen: Vec<(NodeKey, Option<Arc<dyn TaskItem>>)> = graph.read(|dag| {
                dag.closure(&root)
                    .into_iter()
                    .filter(|key| !prepared.contains(key))
                    .map(|key| {
                        let item = match dag.get(&key).map(|entry| &entry.slot) {
                            Some(Slot::Task(item)) => Some(Arc::clone(item)),
                            _ => None,
                        };
                        (key, item)
                    })
                    .collect()
            });

            if unseen.is_empty() {
                return Ok(());
            }

            for (key, item) in unseen {
                prepared.insert(key.clone());
                if let Some(item) = item {
                    trace!(task = %key, "preparing task");
                    item.before_group_invoke(&TaskGroup::new(graph.clone(), key))?;
                }
            }
        }
    }

    fn launch(&mut self, index: usize) {
        let Some(plan) = self.plan.as_mut() else {
            return;
        };

        let upstream_faulted = plan.nodes[index]
            .dependencies
            .iter()
            .any(|&d| plan.nodes[d].faulted);
        plan.nodes[index].faulted = upstream_faulted;

        let node = &plan.nodes[index];
        let key = node.key.clone();
        let context = self.context.clone();

        let future: BoxFuture<'static, (usize, Outcome)> = match &node.kind {
            PlannedKind::Task { .. } if context.is_cancelled() => {
                debug!(task = %key, "task group cancelled, skipping task");
                future::ready((index, Err(Error::TaskCancelled))).boxed()
            }
            PlannedKind::Task {
                item,
                cached: Some(cached),
                always_run: false,
            } if item.reuse_cached_result() => {
                trace!(task = %key, "reusing cached result");
                future::ready((index, Ok(Arc::clone(cached)))).boxed()
            }
            PlannedKind::Task { item, .. } => {
                let item = Arc::clone(item);
                let dependencies = plan.dependency_results(index);
                async move {
                    trace!(task = %key, "invoking task");
                    let outcome = item.invoke(&context, &dependencies).await;
                    (index, outcome)
                }
                .boxed()
            }
            PlannedKind::Proxy { item, actual } => {
                let item = Arc::clone(item);
                let faulted = upstream_faulted || context.is_cancelled();
                let actual_result = match &plan.nodes[*actual].outcome {
                    Some(Ok(result)) => Some(Arc::clone(result)),
                    _ => None,
                };
                async move {
                    trace!(task = %key, faulted, "running post-run stage");
                    let outcome = match item.after_post_run(faulted).await {
                        Err(error) => Err(error),
                        Ok(()) if faulted => Err(Error::ErroredDependency),
                        Ok(()) => actual_result.ok_or(Error::ErroredDependency),
                    };
                    (index, outcome)
                }
                .boxed()
            }
        };

        self.running.push(future);
    }

    fn complete(&mut self, index: usize, outcome: Outcome) {
        let Some(plan) = self.plan.as_mut() else {
            return;
        };

        let is_root = plan.is_root_result(index);
        let node = &mut plan.nodes[index];
        node.faulted |= outcome.is_err();

        match &outcome {
            Ok(result) => {
                debug!(task = %node.key, "task completed");
                if matches!(node.kind, PlannedKind::Task { .. }) {
                    let key = &node.key;
                    self.group.graph().write(|dag| {
                        if let Some(entry) = dag.get_mut(key) {
                            entry.result = Some(Arc::clone(result));
                        }
                    });
                }
                if is_root {
                    self.root_result = Some(Arc::clone(result));
                }
                self.outbox.push_back(Ok(Arc::clone(result)));
            }
            Err(error) if error.is_skip_marker() => {
                debug!(task = %node.key, %error, "task skipped");
            }
            Err(error) => {
                warn!(task = %node.key, %error, "task failed");
                self.context.report_error(error.clone());
            }
        }
        node.outcome = Some(outcome);

        let mut ready = Vec::new();
        for &d in &node.dependents.clone() {
            let dependent = &mut plan.nodes[d];
            dependent.pending = dependent.pending.saturating_sub(1);
            if dependent.pending == 0 {
                ready.push(d);
            }
        }
        plan.remaining = plan.remaining.saturating_sub(1);

        for index in ready {
            self.launch(index);
        }
    }

    fn finish(&mut self) {
        self.finished = true;

        let remaining = self.plan.as_ref().map_or(0, |plan| plan.remaining);
        if remaining > 0 {
            warn!(root = %self.group.key(), remaining, "traversal ended with unfinished tasks");
        }

        let errors = self.context.errors();
        debug!(root = %self.group.key(), failures = errors.len(), "task group invocation finished");
        if let Some(error) = Error::aggregate(errors) {
            self.outbox.push_back(Err(error));
        }
    }
}

impl Stream for TaskStream {
    type Item = Result<TaskResult>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.started {
            this.started = true;
            this.start();
        }

        loop {
            if let Some(item) = this.outbox.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            match this.running.poll_next_unpin(cx) {
                Poll::Ready(Some((index, outcome))) => this.complete(index, outcome),
                Poll::Ready(None) => this.finish(),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for TaskStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStream")
            .field("root", self.group.key())
            .field("running", &self.running.len())
            .field("finished", &self.finished)
            .finish()
    }
}
