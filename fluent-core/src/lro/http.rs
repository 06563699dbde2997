//! HTTP Seam
//!
//! The poller does not own an HTTP stack. It talks to whatever implements
//! [`Transport`], using the plain request and response values defined here.

use std::fmt;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// HTTP verbs that can start a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Put,
    Patch,
    Post,
    Delete,
}

impl Method {
    /// Whether the final resource is read back from the request URL.
    pub fn is_put_or_patch(self) -> bool {
        matches!(self, Self::Put | Self::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        };
        f.write_str(verb)
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<String>,
}

impl HttpRequest {
    /// Create a request without headers or body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: IndexMap::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set a JSON body.
    pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        let json = serde_json::to_string(body)
            .map_err(|e| crate::Error::validation(format!("request body is not serializable: {e}")))?;
        self.body = Some(json);
        Ok(self.with_header("content-type", "application/json"))
    }
}

/// A response as seen by the poller. Header names are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    headers: IndexMap<String, String>,
    pub body: Option<String>,
}

impl HttpResponse {
    /// Create a response without headers or body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: IndexMap::new(),
            body: None,
        }
    }

    /// Add a header. The name is matched case-insensitively later.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Look up a header by name, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON. An absent or blank body is `None`.
    pub fn json(&self) -> Result<Option<serde_json::Value>> {
        match self.body.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(body) => serde_json::from_str(body)
                .map(Some)
                .map_err(|e| crate::Error::Deserialization(format!("invalid JSON body: {e}"))),
        }
    }

    /// The service error carried by a failed response.
    pub fn cloud_error(&self) -> CloudError {
        self.body
            .as_deref()
            .and_then(CloudError::from_body)
            .unwrap_or_else(|| {
                CloudError::new(
                    format!("Http{}", self.status),
                    format!("request failed with status {}", self.status),
                )
            })
    }
}

/// Sends requests on behalf of the poller.
///
/// Implementations report connection level failures as
/// [`Error::Transport`](crate::Error::Transport) and return every response,
/// successful or not, as an [`HttpResponse`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Structured error payload returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<CloudError>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: CloudError,
}

impl CloudError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            target: None,
            details: Vec::new(),
        }
    }

    /// Parse `{ "error": { ... } }` or a bare error object.
    pub fn from_body(body: &str) -> Option<Self> {
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
            return Some(envelope.error);
        }
        serde_json::from_str::<Self>(body)
            .ok()
            .filter(|error| !error.code.is_empty() || !error.message.is_empty())
    }

    /// Extract the error object from a parsed JSON value, if it has one.
    pub(crate) fn from_value(value: &serde_json::Value) -> Option<Self> {
        value
            .get("error")
            .and_then(|error| serde_json::from_value(error.clone()).ok())
    }
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(target) = &self.target {
            write!(f, " (target: {target})")?;
        }
        Ok(())
    }
}
