//! Task Dependency Graph
//!
//! This module implements the engine that runs dependent cloud operations in
//! the right order.
//!
//! # Overview
//!
//! - A [`TaskItem`] is one unit of work, e.g. "create this network".
//! - A [`TaskGraph`] is the arena every task lives in, keyed by [`NodeKey`].
//! - A [`TaskGroup`] is a task plus everything it transitively depends on.
//!   Invoking it yields a [`TaskStream`] of results.
//! - An [`InvocationContext`] is shared by all tasks of one invocation.
//!
//! Edges point from a dependent to its dependencies: if A depends on B, A
//! runs after B and can read B's result.
//!
//! # Design Decisions
//!
//! 1. Tasks are stored in one arena indexed by key rather than linked by
//!    references, so a task shared by several groups exists once and
//!    rewiring edges for post-run dependents is a local operation.
//!
//! 2. The engine knows tasks only through the [`TaskItem`] trait and results
//!    only through [`Indexable`]. Concrete resources are recovered with
//!    [`downcast`].
//!
//! 3. Traversals are lazy streams. Nothing runs before the first poll, and
//!    dropping the stream stops new tasks from starting.

mod context;
mod dag;
mod group;
mod node;
mod scheduler;

pub use context::{DependencyResults, InvocationContext, Outcome, TerminationStrategy};
pub use dag::TaskGraph;
pub use group::{HasTaskGroup, TaskGroup};
pub use node::{downcast, AsAny, FnTask, Indexable, NodeKey, TaskItem, TaskResult, VoidIndexable};
pub use scheduler::TaskStream;
