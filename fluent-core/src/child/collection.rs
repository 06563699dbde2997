//! Child Resource Collections
//!
//! An [`ExternalChildResourceCollection`] holds the child resources of one
//! parent, queues changes on them and commits the queued changes together.
//!
//! # Modes
//!
//! In commit mode (the default) the owner calls [`commit`] explicitly. In
//! post-run mode every queued child becomes a post-run dependent of the
//! parent's task group, so creating or applying the parent commits the
//! children.
//!
//! # Kinds
//!
//! A cached collection is seeded with the children that exist remotely and
//! checks every change against them. A non-cached collection knows nothing
//! up front, accepts updates and removals of any name, and forgets its
//! children after each commit.
//!
//! [`commit`]: ExternalChildResourceCollection::commit

use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::debug;

use super::resource::{
    ChildMap, ChildModel, ChildOperations, ChildTask, ExternalChildResource, PendingOperation,
};
use crate::error::{Error, Result};
use crate::graph::{downcast, HasTaskGroup, NodeKey, TaskGraph, TaskGroup, TaskStream, VoidIndexable};
use crate::graph::{DependencyResults, InvocationContext, TaskItem, TaskResult};

/// Whether the collection knows the existing children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Cached,
    NonCached,
}

enum Mode {
    Commit,
    PostRun(TaskGroup),
}

/// The child resources of one parent.
pub struct ExternalChildResourceCollection<M: ChildModel> {
    kind: CollectionKind,
    child_resource_name: String,
    operations: Arc<dyn ChildOperations<M>>,
    children: Arc<RwLock<ChildMap<M>>>,
    mode: RwLock<Mode>,
}

impl<M: ChildModel> ExternalChildResourceCollection<M> {
    /// Create a cached collection seeded with the existing children.
    ///
    /// `child_resource_name` is the user facing kind of child (e.g.
    /// "Subnet") and appears in validation errors.
    pub fn cached(
        child_resource_name: impl Into<String>,
        operations: Arc<dyn ChildOperations<M>>,
        existing: impl IntoIterator<Item = (String, M)>,
    ) -> Self {
        let collection = Self::new(CollectionKind::Cached, child_resource_name, operations);
        {
            let mut children = collection.children.write();
            for (name, model) in existing {
                let child = ExternalChildResource::new(
                    name.as_str(),
                    model,
                    PendingOperation::None,
                    Arc::clone(&collection.operations),
                    Arc::downgrade(&collection.children),
                );
                children.insert(name.to_lowercase(), child);
            }
        }
        collection
    }

    /// Create a non-cached collection.
    pub fn non_cached(
        child_resource_name: impl Into<String>,
        operations: Arc<dyn ChildOperations<M>>,
    ) -> Self {
        Self::new(CollectionKind::NonCached, child_resource_name, operations)
    }

    fn new(
        kind: CollectionKind,
        child_resource_name: impl Into<String>,
        operations: Arc<dyn ChildOperations<M>>,
    ) -> Self {
        Self {
            kind,
            child_resource_name: child_resource_name.into(),
            operations,
            children: Arc::new(RwLock::new(IndexMap::new())),
            mode: RwLock::new(Mode::Commit),
        }
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// Start defining a new child.
    ///
    /// Fails if a child with the same name (ignoring case) is already known.
    pub fn define(&self, name: impl Into<String>) -> Result<ChildDefinition<'_, M>> {
        let name = name.into();
        if self.find(&name).is_some() {
            return Err(Error::validation(format!(
                "A {} with name '{}' already exists",
                self.child_resource_name, name
            )));
        }
        Ok(ChildDefinition {
            collection: self,
            name,
            model: M::default(),
        })
    }

    /// Queue an update of a child and return it for modification.
    pub fn update(&self, name: &str) -> Result<Arc<ExternalChildResource<M>>> {
        let child = match (self.kind, self.find(name)) {
            (_, Some(child)) => {
                match child.pending_operation() {
                    PendingOperation::ToBeRemoved => {
                        return Err(Error::validation(format!(
                            "A {} with name '{}' is marked for removal and cannot be updated",
                            self.child_resource_name, name
                        )))
                    }
                    // A child that is not created yet picks up the change on creation
                    PendingOperation::ToBeCreated => {}
                    _ => child.set_pending_operation(PendingOperation::ToBeUpdated),
                }
                child
            }
            (CollectionKind::Cached, None) => return Err(self.not_found(name)),
            (CollectionKind::NonCached, None) => {
                self.insert(name, M::default(), PendingOperation::ToBeUpdated)
            }
        };
        self.schedule(&child)?;
        Ok(child)
    }

    /// Queue the removal of a child.
    pub fn remove(&self, name: &str) -> Result<()> {
        let child = match (self.kind, self.find(name)) {
            (_, Some(child)) if child.pending_operation() == PendingOperation::ToBeCreated => {
                return Err(self.not_found(name))
            }
            (_, Some(child)) => {
                child.set_pending_operation(PendingOperation::ToBeRemoved);
                child
            }
            (CollectionKind::Cached, None) => return Err(self.not_found(name)),
            (CollectionKind::NonCached, None) => {
                self.insert(name, M::default(), PendingOperation::ToBeRemoved)
            }
        };
        self.schedule(&child)
    }

    /// Find a child by name, ignoring case.
    pub fn find(&self, name: &str) -> Option<Arc<ExternalChildResource<M>>> {
        self.children.read().get(&name.to_lowercase()).cloned()
    }

    /// All children that were not deleted, in insertion order.
    pub fn children(&self) -> Vec<Arc<ExternalChildResource<M>>> {
        self.children
            .read()
            .values()
            .filter(|child| !child.is_deleted())
            .cloned()
            .collect()
    }

    /// Forget every child.
    pub fn clear(&self) {
        self.children.write().clear();
    }

    /// Commit queued changes as post-run dependents of `parent`.
    ///
    /// Children that already have a queued change are attached right away.
    pub fn enable_post_run_mode(&self, parent: &TaskGroup) -> Result<()> {
        *self.mode.write() = Mode::PostRun(parent.clone());
        for child in self.queued() {
            self.schedule(&child)?;
        }
        Ok(())
    }

    /// Commit queued changes only through [`Self::commit`].
    pub fn enable_commit_mode(&self) {
        *self.mode.write() = Mode::Commit;
    }

    /// Whether queued changes run as post-run dependents of the parent.
    pub fn is_post_run_mode(&self) -> bool {
        matches!(*self.mode.read(), Mode::PostRun(_))
    }

    /// Commit every queued change.
    ///
    /// Streams each child whose change succeeded. If any change failed, the
    /// last item is the aggregate error. Children that could not be created
    /// are dropped from the collection, as are children that were removed.
    pub fn commit(&self) -> BoxStream<'static, Result<Arc<ExternalChildResource<M>>>> {
        if self.is_post_run_mode() {
            return stream::once(async {
                Err(Error::invalid_state(
                    "commit cannot be invoked when post-run mode is enabled",
                ))
            })
            .boxed();
        }

        let queued = self.queued();
        if queued.is_empty() {
            debug!(kind = %self.child_resource_name, "nothing to commit");
            return stream::empty().boxed();
        }
        debug!(kind = %self.child_resource_name, queued = queued.len(), "committing child resources");

        match self.plan_commit(&queued) {
            Ok(root) => {
                let stream = root.invoke(root.new_invocation_context());
                CommitState {
                    stream,
                    children: Arc::clone(&self.children),
                    clear_after_commit: self.kind == CollectionKind::NonCached,
                }
                .into_stream()
            }
            Err(error) => stream::once(async move { Err(error) }).boxed(),
        }
    }

    /// Commit every queued change and collect the resulting children.
    ///
    /// For a cached collection the children are every child without a
    /// failed change after the commit, changed or not. For a non-cached
    /// collection they are the children whose change succeeded. A failed
    /// change shows up in [`CommitOutcome::error`] and never hides the
    /// successful ones.
    pub async fn commit_and_get_all(&self) -> CommitOutcome<M> {
        let mut committed = Vec::new();
        let mut error = None;
        let mut changes = self.commit();
        while let Some(item) = changes.next().await {
            match item {
                Ok(child) => committed.push(child),
                Err(e) => error = Some(e),
            }
        }

        let children = match self.kind {
            CollectionKind::Cached => self
                .children()
                .into_iter()
                .filter(|child| child.pending_operation() == PendingOperation::None)
                .collect(),
            CollectionKind::NonCached => committed,
        };
        CommitOutcome { children, error }
    }

    /// Build a transient group whose root waits for every queued child.
    fn plan_commit(&self, queued: &[Arc<ExternalChildResource<M>>]) -> Result<TaskGroup> {
        let graph = TaskGraph::new();
        let root = graph.add_task(NodeKey::generate(), CommitRoot)?;
        for child in queued {
            let task = graph.add_task(NodeKey::generate(), ChildTask::new(child))?;
            root.add_dependency(&task)?;
        }
        Ok(root)
    }

    fn queued(&self) -> Vec<Arc<ExternalChildResource<M>>> {
        self.children
            .read()
            .values()
            .filter(|child| child.pending_operation() != PendingOperation::None)
            .cloned()
            .collect()
    }

    fn insert(
        &self,
        name: &str,
        model: M,
        pending: PendingOperation,
    ) -> Arc<ExternalChildResource<M>> {
        let child = ExternalChildResource::new(
            name,
            model,
            pending,
            Arc::clone(&self.operations),
            Arc::downgrade(&self.children),
        );
        self.children
            .write()
            .insert(name.to_lowercase(), Arc::clone(&child));
        child
    }

    /// In post-run mode, make the parent commit `child` after it ran.
    fn schedule(&self, child: &Arc<ExternalChildResource<M>>) -> Result<()> {
        if let Mode::PostRun(parent) = &*self.mode.read() {
            if !child.task_group().depends_on(parent) {
                parent.add_post_run_dependent(child.task_group())?;
            }
        }
        Ok(())
    }

    fn not_found(&self, name: &str) -> Error {
        Error::validation(format!(
            "A {} with name '{}' not found",
            self.child_resource_name, name
        ))
    }
}

impl<M: ChildModel> std::fmt::Debug for ExternalChildResourceCollection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalChildResourceCollection")
            .field("kind", &self.kind)
            .field("child_resource_name", &self.child_resource_name)
            .field("children", &self.children.read().len())
            .field("post_run", &self.is_post_run_mode())
            .finish()
    }
}

/// Builder for a child that is not yet part of the collection.
#[must_use = "a child definition does nothing until attached"]
pub struct ChildDefinition<'a, M: ChildModel> {
    collection: &'a ExternalChildResourceCollection<M>,
    name: String,
    model: M,
}

impl<'a, M: ChildModel> ChildDefinition<'a, M> {
    /// Set properties of the new child.
    pub fn with(mut self, f: impl FnOnce(&mut M)) -> Self {
        f(&mut self.model);
        self
    }

    /// Queue the creation of the child.
    pub fn attach(self) -> Result<Arc<ExternalChildResource<M>>> {
        let child = self
            .collection
            .insert(&self.name, self.model, PendingOperation::ToBeCreated);
        self.collection.schedule(&child)?;
        Ok(child)
    }
}

/// The result of [`ExternalChildResourceCollection::commit_and_get_all`].
#[derive(Debug)]
pub struct CommitOutcome<M: ChildModel> {
    pub children: Vec<Arc<ExternalChildResource<M>>>,
    /// Aggregate of every failed change, if any.
    pub error: Option<Error>,
}

impl<M: ChildModel> CommitOutcome<M> {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The children if every change succeeded, otherwise the error.
    pub fn into_result(self) -> Result<Vec<Arc<ExternalChildResource<M>>>> {
        match self.error {
            None => Ok(self.children),
            Some(error) => Err(error),
        }
    }
}

/// Root of a commit's transient group.
struct CommitRoot;

#[async_trait::async_trait]
impl TaskItem for CommitRoot {
    async fn invoke(
        &self,
        context: &InvocationContext,
        _dependencies: &DependencyResults,
    ) -> Result<TaskResult> {
        Ok(VoidIndexable::result(context.root_key().as_str()))
    }
}

/// Turns a commit's task results into committed children.
struct CommitState<M: ChildModel> {
    stream: TaskStream,
    children: Arc<RwLock<ChildMap<M>>>,
    clear_after_commit: bool,
}

impl<M: ChildModel> CommitState<M> {
    fn into_stream(self) -> BoxStream<'static, Result<Arc<ExternalChildResource<M>>>> {
        stream::unfold(Some(self), |state| async move {
            let mut state = state?;
            loop {
                match state.stream.next().await {
                    Some(Ok(result)) => {
                        // The void root is not a child
                        if let Some(child) = downcast::<ExternalChildResource<M>>(result) {
                            return Some((Ok(child), Some(state)));
                        }
                    }
                    Some(Err(error)) => {
                        state.finish();
                        return Some((Err(error), None));
                    }
                    None => {
                        state.finish();
                        return None;
                    }
                }
            }
        })
        .boxed()
    }

    fn finish(&self) {
        if self.clear_after_commit {
            self.children.write().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Subnet {
        prefix: String,
    }

    struct Subnets;

    #[async_trait]
    impl ChildOperations<Subnet> for Subnets {
        async fn create(&self, _name: &str, model: &Subnet) -> Result<Subnet> {
            Ok(model.clone())
        }

        async fn update(&self, _name: &str, model: &Subnet) -> Result<Subnet> {
            Ok(model.clone())
        }

        async fn delete(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn subnets() -> ExternalChildResourceCollection<Subnet> {
        ExternalChildResourceCollection::cached(
            "Subnet",
            Arc::new(Subnets),
            vec![("frontend".to_string(), Subnet::default())],
        )
    }

    #[test]
    fn lookups_ignore_case() {
        let collection = subnets();
        assert!(collection.find("FrontEnd").is_some());
        assert!(matches!(collection.define("FRONTEND"), Err(Error::Validation(_))));
    }

    #[test]
    fn cached_collection_validates_changes() {
        let collection = subnets();
        assert!(matches!(collection.update("backend"), Err(Error::Validation(_))));
        assert!(matches!(collection.remove("backend"), Err(Error::Validation(_))));

        collection.remove("frontend").unwrap();
        assert!(matches!(collection.update("frontend"), Err(Error::Validation(_))));
    }

    #[test]
    fn non_cached_collection_accepts_any_name() {
        let collection = ExternalChildResourceCollection::<Subnet>::non_cached("Subnet", Arc::new(Subnets));
        let child = collection.update("backend").unwrap();
        assert_eq!(child.pending_operation(), PendingOperation::ToBeUpdated);
        collection.remove("gateway").unwrap();
        assert_eq!(collection.children().len(), 2);
    }

    #[test]
    fn define_attaches_with_model() {
        let collection = subnets();
        let child = collection
            .define("backend")
            .unwrap()
            .with(|subnet| subnet.prefix = "10.0.1.0/24".to_string())
            .attach()
            .unwrap();

        assert_eq!(child.pending_operation(), PendingOperation::ToBeCreated);
        assert_eq!(child.model().prefix, "10.0.1.0/24");
        assert_eq!(collection.children().len(), 2);
    }

    #[tokio::test]
    async fn commit_in_post_run_mode_fails() {
        let collection = subnets();
        let parent = TaskGraph::new().add_task("vnet", CommitRoot).unwrap();
        collection.enable_post_run_mode(&parent).unwrap();

        let results: Vec<_> = collection.commit().collect().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::InvalidState(_))));

        collection.enable_commit_mode();
        assert!(collection.commit().collect::<Vec<_>>().await.is_empty());
    }
}
