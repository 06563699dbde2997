//! Polling State
//!
//! [`PollingState`] is derived from the response that accepted a
//! long-running operation and is advanced by every poll response. It knows
//! where to poll next and when the operation is finished.
//!
//! # Protocol
//!
//! - `Azure-AsyncOperation` is preferred over `Location` as the poll URL.
//!   Its responses carry the status in a `status` field.
//! - A `Location` poll answers 202 while the operation runs and 200/201/204
//!   once it finished.
//! - Without either header, a PUT or PATCH is polled on the resource URL
//!   and its `properties.provisioningState` is the status.
//! - After success, PUT and PATCH read the final resource with a GET on the
//!   resource URL. POST and DELETE take it from the `Location` URL, if any.

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use super::http::{CloudError, HttpRequest, HttpResponse, Method};
use crate::error::{Error, Result};

/// Status of a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationStatus {
    /// Parse a status string, ignoring case.
    ///
    /// Anything that is not a known terminal status counts as in progress;
    /// services report many of those (`Accepted`, `Running`, `Creating`, ...).
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "notstarted" => Self::NotStarted,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::InProgress,
        }
    }

    /// Whether the operation is finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Whether the operation finished without success.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::NotStarted => "NotStarted",
            Self::InProgress => "InProgress",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        };
        f.write_str(status)
    }
}

/// Where a long-running operation stands and how to observe it next.
#[derive(Debug, Clone)]
pub struct PollingState {
    method: Method,
    resource_url: String,
    async_operation_url: Option<String>,
    location_url: Option<String>,
    status: OperationStatus,
    retry_after: Option<Duration>,
    resource: Option<Value>,
    error: Option<CloudError>,
    final_get_url: Option<String>,
}

impl PollingState {
    /// Derive the polling state from the response that accepted the operation.
    ///
    /// A non-2xx response is the service rejecting the request and fails
    /// with [`Error::Service`].
    pub fn from_initial_response(
        method: Method,
        resource_url: impl Into<String>,
        response: &HttpResponse,
    ) -> Result<Self> {
        if !response.is_success() {
            return Err(Error::Service {
                status: response.status,
                error: response.cloud_error(),
            });
        }

        let body = response.json()?;
        let mut state = Self {
            method,
            resource_url: resource_url.into(),
            async_operation_url: response.header("azure-asyncoperation").map(str::to_string),
            location_url: response.header("location").map(str::to_string),
            status: OperationStatus::InProgress,
            retry_after: retry_after(response),
            resource: None,
            error: None,
            final_get_url: None,
        };

        state.status = match response.status {
            202 => OperationStatus::InProgress,
            200 | 201 | 204 => match provisioning_state(body.as_ref()) {
                Some(status) => status,
                None if state.async_operation_url.is_some() => OperationStatus::InProgress,
                None if response.status == 201 && state.location_url.is_some() => {
                    OperationStatus::InProgress
                }
                None => OperationStatus::Succeeded,
            },
            other => {
                return Err(Error::polling(format!(
                    "unexpected status {other} for the initial response of a {method} operation"
                )))
            }
        };

        match state.status {
            OperationStatus::Succeeded => state.resource = body,
            OperationStatus::Failed | OperationStatus::Canceled => {
                state.error = body.as_ref().and_then(CloudError::from_value);
            }
            _ => {}
        }

        Ok(state)
    }

    /// The verb of the request that started the operation.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Current status.
    pub fn status(&self) -> OperationStatus {
        self.status
    }

    /// The final resource body, once the operation succeeded.
    pub fn resource(&self) -> Option<&Value> {
        self.resource.as_ref()
    }

    /// The error reported with a terminal failure status.
    pub fn error(&self) -> Option<&CloudError> {
        self.error.as_ref()
    }

    /// The delay the service asked for with `Retry-After`.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// URL the next status poll goes to.
    pub fn poll_url(&self) -> Option<&str> {
        self.async_operation_url
            .as_deref()
            .or(self.location_url.as_deref())
            .or_else(|| {
                self.method
                    .is_put_or_patch()
                    .then_some(self.resource_url.as_str())
            })
    }

    /// Whether nothing is left to fetch.
    pub fn is_done(&self) -> bool {
        self.status.is_terminal() && self.final_get_url.is_none()
    }

    /// Whether the operation succeeded but the final resource is still to be read.
    pub(crate) fn awaiting_final_get(&self) -> bool {
        self.final_get_url.is_some()
    }

    /// The request that advances the state, or `None` when done.
    pub(crate) fn next_request(&self) -> Result<Option<HttpRequest>> {
        if let Some(url) = &self.final_get_url {
            return Ok(Some(HttpRequest::get(url.as_str())));
        }
        if self.status.is_terminal() {
            return Ok(None);
        }
        match self.poll_url() {
            Some(url) => Ok(Some(HttpRequest::get(url))),
            None => Err(Error::polling(format!(
                "no polling URL for the {} operation on {}",
                self.method, self.resource_url
            ))),
        }
    }

    /// Advance the state with a successful response to [`Self::next_request`].
    pub(crate) fn apply(&mut self, response: &HttpResponse) -> Result<()> {
        if !response.is_success() {
            return Err(Error::Service {
                status: response.status,
                error: response.cloud_error(),
            });
        }
        if let Some(retry_after) = retry_after(response) {
            self.retry_after = Some(retry_after);
        }

        let body = response.json()?;
        if self.final_get_url.take().is_some() {
            self.resource = body;
            return Ok(());
        }

        self.status = if self.async_operation_url.is_some() {
            body.as_ref()
                .and_then(|body| body.get("status"))
                .and_then(Value::as_str)
                .map(OperationStatus::parse)
                .ok_or_else(|| Error::polling("async operation response has no status"))?
        } else if self.location_url.is_some() && response.status == 202 {
            OperationStatus::InProgress
        } else {
            provisioning_state(body.as_ref()).unwrap_or(OperationStatus::Succeeded)
        };

        match self.status {
            OperationStatus::Succeeded => self.on_success(body),
            OperationStatus::Failed | OperationStatus::Canceled => {
                self.error = body.as_ref().and_then(CloudError::from_value);
            }
            _ => {}
        }
        Ok(())
    }

    fn on_success(&mut self, body: Option<Value>) {
        let polled_elsewhere = self.async_operation_url.is_some() || self.location_url.is_some();
        if self.method.is_put_or_patch() {
            if polled_elsewhere {
                self.final_get_url = Some(self.resource_url.clone());
            } else {
                self.resource = body;
            }
        } else if self.async_operation_url.is_some() {
            self.final_get_url = self.location_url.clone();
        } else {
            self.resource = body;
        }
    }
}

fn provisioning_state(body: Option<&Value>) -> Option<OperationStatus> {
    body?
        .get("properties")?
        .get("provisioningState")?
        .as_str()
        .map(OperationStatus::parse)
}

fn retry_after(response: &HttpResponse) -> Option<Duration> {
    response
        .header("retry-after")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
