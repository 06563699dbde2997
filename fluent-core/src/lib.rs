//! Fluent Core
//!
//! This crate provides the runtime underneath fluent resource management
//! clients. It implements:
//!
//! - A dependency-graph task engine that creates resources in dependency
//!   order, runs independent branches concurrently, and streams results
//! - Post-run dependents and proxy roots for work that must follow a
//!   resource and everything it depends on
//! - External child resource collections committed as one batch
//! - Polling of long-running operations
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: task arena, task groups, invocation context and the scheduler
//! - `model`: `Creatable`, `Appliable` and `Executable` fronting traits
//! - `child`: external child resources and their collections
//! - `lro`: the transport seam and the long-running operation poller
//! - `config`: explicit client configuration
//! - `error`: the crate-wide error type
//!
//! # Example
//!
//! ```rust,ignore
//! use fluent_core::graph::{FnTask, TaskGraph, VoidIndexable};
//!
//! let graph = TaskGraph::new();
//! let ip = graph.add_task("ip", FnTask::new(|_, _| async {
//!     Ok(VoidIndexable::result("ip"))
//! }))?;
//! let nic = graph.add_task("nic", FnTask::new(|_, deps| async move {
//!     let ip = deps.get("ip")?;
//!     Ok(VoidIndexable::result(format!("nic-for-{}", ip.key())))
//! }))?;
//! nic.add_dependency(&ip)?;
//!
//! // Runs "ip" first, then "nic"
//! let result = nic.invoke_root().await?;
//! ```

pub mod child;
pub mod config;
pub mod error;
pub mod graph;
pub mod lro;
pub mod model;

pub use config::ClientConfig;
pub use error::{Error, Result};
