//! Fronting Traits
//!
//! Resource builders expose their task group through [`HasTaskGroup`] and
//! get `create`/`apply`/`execute` for free by implementing one of the traits
//! below. The streaming variants yield every result of the traversal; the
//! plain variants wait for the traversal and return the root's result as the
//! concrete resource type.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::graph::{downcast, HasTaskGroup, Indexable, TaskGroup, TaskStream};

/// A resource definition that can be created.
#[async_trait]
pub trait Creatable: HasTaskGroup + Send + Sync {
    /// The resource produced by the root task.
    type Output: Indexable;

    /// Create the resource and everything it depends on, streaming each
    /// result as it becomes available.
    fn create_async(&self) -> TaskStream {
        start(self.task_group())
    }

    /// Create the resource and return it.
    async fn create(&self) -> Result<Arc<Self::Output>> {
        finish::<Self::Output>(self.task_group()).await
    }
}

/// A pending update of an existing resource.
#[async_trait]
pub trait Appliable: HasTaskGroup + Send + Sync {
    /// The resource produced by the root task.
    type Output: Indexable;

    /// Apply the update, streaming each result as it becomes available.
    fn apply_async(&self) -> TaskStream {
        start(self.task_group())
    }

    /// Apply the update and return the updated resource.
    async fn apply(&self) -> Result<Arc<Self::Output>> {
        finish::<Self::Output>(self.task_group()).await
    }
}

/// An action on a resource, such as a restart.
#[async_trait]
pub trait Executable: HasTaskGroup + Send + Sync {
    /// The result of the action.
    type Output: Indexable;

    /// Run the action, streaming each result as it becomes available.
    fn execute_async(&self) -> TaskStream {
        start(self.task_group())
    }

    /// Run the action and return its result.
    async fn execute(&self) -> Result<Arc<Self::Output>> {
        finish::<Self::Output>(self.task_group()).await
    }
}

fn start(group: &TaskGroup) -> TaskStream {
    group.invoke(group.new_invocation_context())
}

async fn finish<T: Indexable>(group: &TaskGroup) -> Result<Arc<T>> {
    let result = group.invoke_root().await?;
    downcast::<T>(result).ok_or_else(|| Error::UnexpectedResultType(group.key().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DependencyResults, InvocationContext, TaskGraph, TaskItem, TaskResult};
    use futures_util::StreamExt;

    #[derive(Debug)]
    struct Disk {
        name: String,
        size_gb: u32,
    }

    impl Indexable for Disk {
        fn key(&self) -> &str {
            &self.name
        }
    }

    struct CreateDisk {
        name: String,
        size_gb: u32,
    }

    #[async_trait]
    impl TaskItem for CreateDisk {
        async fn invoke(
            &self,
            _context: &InvocationContext,
            _dependencies: &DependencyResults,
        ) -> Result<TaskResult> {
            Ok(Arc::new(Disk {
                name: self.name.clone(),
                size_gb: self.size_gb,
            }))
        }
    }

    struct DiskDefinition {
        group: TaskGroup,
    }

    impl HasTaskGroup for DiskDefinition {
        fn task_group(&self) -> &TaskGroup {
            &self.group
        }
    }

    impl Creatable for DiskDefinition {
        type Output = Disk;
    }

    fn define(name: &str, size_gb: u32) -> DiskDefinition {
        let group = TaskGraph::new()
            .add_task(
                name,
                CreateDisk {
                    name: name.to_string(),
                    size_gb,
                },
            )
            .unwrap();
        DiskDefinition { group }
    }

    #[tokio::test]
    async fn create_returns_concrete_resource() {
        let disk = define("os-disk", 128).create().await.unwrap();
        assert_eq!(disk.name, "os-disk");
        assert_eq!(disk.size_gb, 128);
    }

    #[tokio::test]
    async fn create_async_streams_dependencies_first() {
        let data = define("data-disk", 512);
        let os = define("os-disk", 128);
        os.task_group().add_dependency(data.task_group()).unwrap();

        let keys: Vec<String> = os
            .create_async()
            .map(|result| result.unwrap().key().to_string())
            .collect()
            .await;
        assert_eq!(keys, vec!["data-disk", "os-disk"]);
    }
}
