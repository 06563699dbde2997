//! Long-Running Operations
//!
//! Cloud operations that are accepted before they finish are tracked by
//! polling. This module holds the HTTP seam the poller talks through, the
//! polling state machine and the poller itself.

mod http;
mod poller;
mod state;

pub use http::{CloudError, HttpRequest, HttpResponse, Method, Transport};
pub use poller::{begin_operation, LroPoller, PollInterval, PollResponse};
pub use state::{OperationStatus, PollingState};
