//! Long-Running Operation Poller
//!
//! [`LroPoller`] turns an accepted operation into a lazy stream of status
//! observations. Each item is one observation; the stream ends after the
//! terminal one. A terminal failure ends the stream with
//! [`Error::OperationFailed`].
//!
//! Nothing is polled until the stream is polled, and dropping the stream
//! stops polling.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::http::{HttpRequest, HttpResponse, Transport};
use super::state::{OperationStatus, PollingState};
use crate::config::{ClientConfig, DEFAULT_RETRY_TIMEOUT_SECS};
use crate::error::{Error, Result};

/// How long to wait between status polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollInterval {
    /// Always wait this long.
    Fixed(Duration),
    /// Wait as long as the service asks for, 30 seconds when it does not say.
    ServerHint,
}

impl PollInterval {
    pub fn from_config(config: &ClientConfig) -> Self {
        match config.retry_timeout_override() {
            Some(delay) => Self::Fixed(delay),
            None => Self::ServerHint,
        }
    }

    /// The delay before the next poll.
    pub fn delay(self, retry_after: Option<Duration>) -> Duration {
        match self {
            Self::Fixed(delay) => delay,
            Self::ServerHint => {
                retry_after.unwrap_or(Duration::from_secs(DEFAULT_RETRY_TIMEOUT_SECS as u64))
            }
        }
    }
}

/// One observation of a long-running operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResponse {
    pub status: OperationStatus,
    /// The final resource, present on the last observation of a successful
    /// operation that has one.
    pub resource: Option<Value>,
}

/// Polls one long-running operation.
pub struct LroPoller {
    transport: Arc<dyn Transport>,
    state: PollingState,
    interval: PollInterval,
    config: ClientConfig,
}

impl LroPoller {
    pub fn new(transport: Arc<dyn Transport>, state: PollingState, config: ClientConfig) -> Self {
        Self {
            transport,
            state,
            interval: PollInterval::from_config(&config),
            config,
        }
    }

    /// The current polling state.
    pub fn state(&self) -> &PollingState {
        &self.state
    }

    /// Turn the poller into a stream of observations.
    ///
    /// The first item reflects the response that accepted the operation.
    pub fn into_stream(self) -> BoxStream<'static, Result<PollResponse>> {
        stream::unfold(Some((self, true)), |state| async move {
            let (mut poller, first) = state?;
            if !first {
                if let Err(error) = poller.advance().await {
                    return Some((Err(error), None));
                }
            }

            let status = poller.state.status();
            if status.is_failure() {
                warn!(verb = %poller.state.method(), %status, "long running operation failed");
                return Some((Err(poller.failure()), None));
            }

            let observation = PollResponse {
                status,
                resource: poller.state.resource().cloned(),
            };
            if poller.state.is_done() {
                debug!(verb = %poller.state.method(), "long running operation succeeded");
                Some((Ok(observation), None))
            } else {
                Some((Ok(observation), Some((poller, false))))
            }
        })
        .boxed()
    }

    /// Poll until the operation finishes and return the final resource body.
    pub async fn wait(self) -> Result<Option<Value>> {
        let mut observations = self.into_stream();
        let mut last = None;
        while let Some(observation) = observations.next().await {
            last = Some(observation?);
        }
        Ok(last.and_then(|observation| observation.resource))
    }

    /// Poll until the operation finishes and deserialize the final resource.
    pub async fn wait_for<T: DeserializeOwned>(self) -> Result<T> {
        let body = self.wait().await?.ok_or_else(|| {
            Error::Deserialization("operation finished without a resource body".to_string())
        })?;
        serde_json::from_value(body).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Wait for the poll interval, then poll once. A final GET needed after
    /// success is issued right away.
    async fn advance(&mut self) -> Result<()> {
        let delay = self.interval.delay(self.state.retry_after());
        debug!(
            status = %self.state.status(),
            delay_ms = delay.as_millis() as u64,
            "waiting before next poll"
        );
        tokio::time::sleep(delay).await;

        while let Some(request) = self.state.next_request()? {
            let response = self.send_with_retry(request).await?;
            self.state.apply(&response)?;
            debug!(status = %self.state.status(), code = response.status, "polled operation");
            if !self.state.awaiting_final_get() {
                break;
            }
        }
        Ok(())
    }

    async fn send_with_retry(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            let error = match self.transport.send(request.clone()).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => Error::Service {
                    status: response.status,
                    error: response.cloud_error(),
                },
                Err(error) => error,
            };

            if !error.is_transient() || attempt >= self.config.max_poll_retries {
                return Err(error);
            }

            let delay = self.config.poll_retry_delay(attempt);
            warn!(url = %request.url, attempt, %error, "transient poll failure, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn failure(&self) -> Error {
        Error::OperationFailed {
            verb: self.state.method(),
            status: self.state.status(),
            error: self.state.error().cloned(),
        }
    }
}

impl std::fmt::Debug for LroPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LroPoller")
            .field("state", &self.state)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Send the request that starts a long-running operation and return the
/// poller for it.
pub async fn begin_operation(
    transport: Arc<dyn Transport>,
    request: HttpRequest,
    config: ClientConfig,
) -> Result<LroPoller> {
    config.validate()?;
    let method = request.method;
    let url = request.url.clone();

    let response = transport.send(request).await?;
    let state = PollingState::from_initial_response(method, url.as_str(), &response)?;
    info!(%method, %url, status = %state.status(), "long running operation accepted");
    Ok(LroPoller::new(transport, state, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IGNORE_RETRY_TIMEOUT;

    #[test]
    fn interval_follows_config() {
        let config = ClientConfig::default();
        assert_eq!(
            PollInterval::from_config(&config).delay(Some(Duration::from_secs(2))),
            Duration::from_secs(30)
        );

        let config = config
            .with_long_running_operation_retry_timeout(IGNORE_RETRY_TIMEOUT)
            .unwrap();
        let interval = PollInterval::from_config(&config);
        assert_eq!(interval, PollInterval::ServerHint);
        assert_eq!(interval.delay(Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(interval.delay(None), Duration::from_secs(30));
    }

    #[test]
    fn zero_timeout_polls_immediately() {
        let config = ClientConfig::default()
            .with_long_running_operation_retry_timeout(0)
            .unwrap();
        assert_eq!(
            PollInterval::from_config(&config),
            PollInterval::Fixed(Duration::ZERO)
        );
    }
}
