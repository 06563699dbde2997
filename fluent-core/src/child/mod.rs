//! External Child Resources
//!
//! Child resources that live under a parent but have their own lifecycle
//! (subnets of a network, rules of a security group, ...). Changes to them are
//! queued on a collection and committed in one batch, either explicitly or
//! as part of creating or updating the parent.

mod collection;
mod resource;

pub use collection::{
    ChildDefinition, CollectionKind, CommitOutcome, ExternalChildResourceCollection,
};
pub use resource::{ChildModel, ChildOperations, ExternalChildResource, PendingOperation};
