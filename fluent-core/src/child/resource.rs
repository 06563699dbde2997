//! External Child Resources
//!
//! An external child resource belongs to a parent but is created, updated
//! and deleted with its own calls. Changes are queued on the child as a
//! [`PendingOperation`] and carried out when the child's task runs.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{
    DependencyResults, HasTaskGroup, Indexable, InvocationContext, NodeKey, TaskGroup, TaskItem,
    TaskResult,
};

/// The change queued on a child resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingOperation {
    #[default]
    None,
    ToBeCreated,
    ToBeUpdated,
    ToBeRemoved,
}

/// Requirements on the model a child resource carries.
pub trait ChildModel: Clone + Default + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + Default + fmt::Debug + Send + Sync + 'static> ChildModel for T {}

/// The remote calls behind a kind of child resource.
#[async_trait]
pub trait ChildOperations<M>: Send + Sync + 'static {
    /// Create the child and return its state as stored by the service.
    async fn create(&self, name: &str, model: &M) -> Result<M>;

    /// Update the child and return its state as stored by the service.
    async fn update(&self, name: &str, model: &M) -> Result<M>;

    /// Delete the child.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Children of a collection keyed by lowercase name.
pub(crate) type ChildMap<M> = IndexMap<String, Arc<ExternalChildResource<M>>>;

/// A named child resource with its queued change.
pub struct ExternalChildResource<M: ChildModel> {
    name: String,
    model: RwLock<M>,
    pending: RwLock<PendingOperation>,
    deleted: AtomicBool,
    operations: Arc<dyn ChildOperations<M>>,
    owner: Weak<RwLock<ChildMap<M>>>,
    group: TaskGroup,
}

impl<M: ChildModel> ExternalChildResource<M> {
    pub(crate) fn new(
        name: impl Into<String>,
        model: M,
        pending: PendingOperation,
        operations: Arc<dyn ChildOperations<M>>,
        owner: Weak<RwLock<ChildMap<M>>>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|child| {
            let task: Arc<dyn TaskItem> = Arc::new(ChildTask {
                child: Weak::clone(child),
            });
            Self {
                group: TaskGroup::single(NodeKey::generate(), task),
                name,
                model: RwLock::new(model),
                pending: RwLock::new(pending),
                deleted: AtomicBool::new(false),
                operations,
                owner,
            }
        })
    }

    /// Name of the child, unique within its collection ignoring case.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A copy of the current model.
    pub fn model(&self) -> M {
        self.model.read().clone()
    }

    /// Change the model in place.
    pub fn modify(&self, f: impl FnOnce(&mut M)) {
        f(&mut self.model.write());
    }

    /// The change that will be carried out on the next commit.
    pub fn pending_operation(&self) -> PendingOperation {
        *self.pending.read()
    }

    pub(crate) fn set_pending_operation(&self, operation: PendingOperation) {
        *self.pending.write() = operation;
    }

    /// Whether the child was deleted by a commit.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Carry out the queued change.
    async fn run_pending(&self) -> Result<()> {
        let operation = self.pending_operation();
        match operation {
            PendingOperation::None => return Ok(()),
            PendingOperation::ToBeCreated => {
                let stored = self.operations.create(&self.name, &self.model()).await?;
                *self.model.write() = stored;
            }
            PendingOperation::ToBeUpdated => {
                let stored = self.operations.update(&self.name, &self.model()).await?;
                *self.model.write() = stored;
            }
            PendingOperation::ToBeRemoved => {
                self.operations.delete(&self.name).await?;
                self.deleted.store(true, Ordering::SeqCst);
            }
        }
        self.set_pending_operation(PendingOperation::None);
        debug!(child = %self.name, ?operation, "committed child resource");
        Ok(())
    }

    /// Carry out the queued change and settle the child in its collection.
    ///
    /// A deleted child leaves the collection. So does a child that could not
    /// be created; its creation is not attempted again.
    async fn commit(self: &Arc<Self>) -> Result<()> {
        match self.run_pending().await {
            Ok(()) => {
                if self.is_deleted() {
                    self.detach();
                }
                Ok(())
            }
            Err(error) => {
                if self.pending_operation() == PendingOperation::ToBeCreated {
                    debug!(child = %self.name, "dropping child that failed to be created");
                    self.set_pending_operation(PendingOperation::None);
                    self.detach();
                }
                Err(error)
            }
        }
    }

    /// Remove this child from the collection that owns it.
    fn detach(self: &Arc<Self>) {
        let Some(children) = self.owner.upgrade() else {
            return;
        };
        let mut children = children.write();
        let key = self.name.to_lowercase();
        // The name may have been taken by a newer child since
        if children.get(&key).is_some_and(|child| Arc::ptr_eq(child, self)) {
            children.shift_remove(&key);
        }
    }
}

impl<M: ChildModel> Indexable for ExternalChildResource<M> {
    fn key(&self) -> &str {
        &self.name
    }
}

impl<M: ChildModel> HasTaskGroup for ExternalChildResource<M> {
    fn task_group(&self) -> &TaskGroup {
        &self.group
    }
}

impl<M: ChildModel> fmt::Debug for ExternalChildResource<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalChildResource")
            .field("name", &self.name)
            .field("model", &*self.model.read())
            .field("pending", &self.pending_operation())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

/// The task that carries out a child's queued change.
///
/// Holds the child weakly; the child owns the group this task lives in.
pub(crate) struct ChildTask<M: ChildModel> {
    child: Weak<ExternalChildResource<M>>,
}

impl<M: ChildModel> ChildTask<M> {
    pub(crate) fn new(child: &Arc<ExternalChildResource<M>>) -> Self {
        Self {
            child: Arc::downgrade(child),
        }
    }
}

#[async_trait]
impl<M: ChildModel> TaskItem for ChildTask<M> {
    async fn invoke(
        &self,
        _context: &InvocationContext,
        _dependencies: &DependencyResults,
    ) -> Result<TaskResult> {
        let child = self
            .child
            .upgrade()
            .ok_or_else(|| Error::invalid_state("child resource was dropped before its commit"))?;
        child.commit().await?;
        Ok(child)
    }

    fn reuse_cached_result(&self) -> bool {
        self.child
            .upgrade()
            .is_some_and(|child| child.pending_operation() == PendingOperation::None)
    }
}
