//! Error Types
//!
//! Every fallible operation in the crate returns [`Result`]. The variants
//! follow the failure classes a caller has to tell apart:
//!
//! - builder input that was rejected before anything ran (`Validation`)
//! - the service said no (`Service`, `OperationFailed`)
//! - the transport or polling machinery broke (`Transport`, `Polling`)
//! - a task could not run because of its dependencies (`MissingDependency`)
//! - the graph was wired incorrectly (`CycleDetected`, `DuplicateTask`, ...)
//! - several of the above happened in one traversal (`Composite`)
//!
//! Errors are `Clone` because a single failure is recorded on the traversal
//! outcome of its task and also reported in the aggregate.

use crate::lro::{CloudError, Method, OperationStatus};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by task groups, child collections and the poller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed input to a builder or configuration value.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The service rejected a request.
    #[error("Service error (HTTP {status}): {error}")]
    Service {
        /// HTTP status code of the rejecting response.
        status: u16,
        /// Structured error payload returned by the service.
        error: CloudError,
    },

    /// The transport could not deliver a request or its response.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
        /// Whether retrying the same request may succeed.
        transient: bool,
    },

    /// A task needed a result that one of its dependencies did not produce.
    #[error("Task '{task}' requires the result of '{dependency}', which did not complete successfully")]
    MissingDependency {
        /// The task whose action asked for the result.
        task: String,
        /// The dependency that has no result.
        dependency: String,
    },

    /// A long-running operation reached a terminal failure status.
    #[error("Long running {verb} operation finished with status {status}{}", describe_cloud_error(.error))]
    OperationFailed {
        /// The verb of the request that started the operation.
        verb: Method,
        /// The terminal status reported by the service.
        status: OperationStatus,
        /// Error payload attached to the terminal status, if any.
        error: Option<CloudError>,
    },

    /// The polling state could not be established or advanced.
    #[error("Long running operation polling failed: {0}")]
    Polling(String),

    /// A response body did not have the expected shape.
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Adding the edge would make the dependency graph cyclic.
    #[error("Adding dependency '{dependency}' to '{dependent}' would create a cycle")]
    CycleDetected {
        /// The task that was going to depend on `dependency`.
        dependent: String,
        /// The task that already (transitively) depends on `dependent`.
        dependency: String,
    },

    /// Two different tasks were registered under the same key.
    #[error("A different task with key '{0}' is already part of the graph")]
    DuplicateTask(String),

    /// No task with the given key is reachable from the group.
    #[error("Task '{0}' not found in the task group")]
    TaskNotFound(String),

    /// A task produced a result of a different type than the caller expected.
    #[error("Task '{0}' produced a result of an unexpected type")]
    UnexpectedResultType(String),

    /// An operation was called in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The task was skipped because the group stopped starting new tasks.
    #[error("Task was not invoked because the task group was cancelled")]
    TaskCancelled,

    /// The post-run stage of a task was skipped because something it waits on failed.
    #[error("Task was not completed because one or more of its dependencies failed")]
    ErroredDependency,

    /// Failure raised by a user supplied action.
    #[error("{0}")]
    Action(String),

    /// Several independent failures collected during one traversal.
    #[error("{} operations failed: {}", .0.len(), join_messages(.0))]
    Composite(Vec<Error>),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an error raised by a task action.
    pub fn action(message: impl Into<String>) -> Self {
        Self::Action(message.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Create a polling error.
    pub fn polling(message: impl Into<String>) -> Self {
        Self::Polling(message.into())
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>, transient: bool) -> Self {
        Self::Transport {
            message: message.into(),
            transient,
        }
    }

    /// Build the error reported for a set of failures.
    ///
    /// A single failure is reported as itself, more than one as `Composite`.
    /// Returns `None` when the list is empty.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Composite(errors)),
        }
    }

    /// The individual failures this error stands for.
    ///
    /// Nested composites are flattened.
    pub fn causes(&self) -> Vec<&Error> {
        match self {
            Self::Composite(errors) => errors.iter().flat_map(Error::causes).collect(),
            other => vec![other],
        }
    }

    /// Whether this error only marks a task that was skipped.
    ///
    /// Such errors are recorded on the task's outcome but never reported.
    pub fn is_skip_marker(&self) -> bool {
        matches!(self, Self::TaskCancelled | Self::ErroredDependency)
    }

    /// Whether retrying the failed request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { transient, .. } => *transient,
            Self::Service { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_cloud_error(error: &Option<CloudError>) -> String {
    match error {
        Some(error) => format!(": {error}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_one_is_the_error_itself() {
        let error = Error::aggregate(vec![Error::action("boom")]).unwrap();
        assert!(matches!(error, Error::Action(ref m) if m == "boom"));
        assert!(Error::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn composite_flattens_causes() {
        let inner = Error::Composite(vec![Error::action("a"), Error::action("b")]);
        let outer = Error::Composite(vec![inner, Error::validation("c")]);

        let causes = outer.causes();
        assert_eq!(causes.len(), 3);
        assert_eq!(causes[0].to_string(), "a");
        assert_eq!(causes[2].to_string(), "Validation failed: c");
    }

    #[test]
    fn composite_message_lists_every_cause() {
        let error = Error::aggregate(vec![Error::action("first"), Error::action("second")]).unwrap();
        assert_eq!(error.to_string(), "2 operations failed: first; second");
    }

    #[test]
    fn skip_markers() {
        assert!(Error::TaskCancelled.is_skip_marker());
        assert!(Error::ErroredDependency.is_skip_marker());
        assert!(!Error::action("x").is_skip_marker());
    }

    #[test]
    fn transient_classification() {
        assert!(Error::transport("reset", true).is_transient());
        assert!(!Error::transport("bad url", false).is_transient());

        let throttled = Error::Service {
            status: 429,
            error: CloudError::new("TooManyRequests", "slow down"),
        };
        assert!(throttled.is_transient());

        let conflict = Error::Service {
            status: 409,
            error: CloudError::new("Conflict", "exists"),
        };
        assert!(!conflict.is_transient());
    }
}
