//! Long-running operation polling
//!
//! A mutating ARM call answers `201`/`202` and points at its progress through
//! either `Azure-AsyncOperation` (a status document) or `Location` (a URL that
//! answers `202` until the operation is done). `Retry-After` overrides the
//! delay between polls.

use std::time::Duration;

use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use url::Url;

use super::{ArmClient, ArmError, ArmResponse, ErrorBody};

const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";

/// Poll timing
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between polls when the service sends no `Retry-After`
    pub default_delay: Duration,
    /// Upper bound on a `Retry-After` delay
    pub max_delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            default_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl PollConfig {
    /// Poll without waiting; used by tests against a mock endpoint
    pub fn immediate() -> Self {
        Self {
            default_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn delay(&self, headers: &HeaderMap) -> Duration {
        retry_after(headers)
            .unwrap_or(self.default_delay)
            .min(self.max_delay)
    }
}

/// Where the progress of an operation is reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PollTarget {
    AsyncOperation(Url),
    Location(Url),
}

impl PollTarget {
    pub(crate) fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| Url::parse(v).ok())
        };
        if let Some(url) = header(ASYNC_OPERATION_HEADER) {
            return Some(PollTarget::AsyncOperation(url));
        }
        header(LOCATION.as_str()).map(PollTarget::Location)
    }
}

/// `Retry-After` in seconds
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Status document returned by an `Azure-AsyncOperation` URL
#[derive(Debug, Deserialize)]
struct OperationStatus {
    status: String,
    #[serde(default)]
    error: Option<ErrorBody>,
}

enum Progress {
    Running,
    Done,
}

impl ArmClient {
    /// Block until the operation started by `response` has finished
    pub(crate) async fn wait_for_completion(&self, response: &ArmResponse) -> Result<(), ArmError> {
        let Some(target) = PollTarget::from_headers(&response.headers) else {
            return Ok(());
        };
        // A Location header on a finished (200) response is not an operation
        if matches!(target, PollTarget::Location(_))
            && !matches!(response.status, StatusCode::CREATED | StatusCode::ACCEPTED)
        {
            return Ok(());
        }

        let mut delay = self.poll.delay(&response.headers);
        loop {
            log::debug!("waiting {:?} for operation {:?}", delay, target);
            tokio::time::sleep(delay).await;

            let (progress, headers) = self.poll_once(&target).await?;
            match progress {
                Progress::Done => return Ok(()),
                Progress::Running => delay = self.poll.delay(&headers),
            }
        }
    }

    async fn poll_once(&self, target: &PollTarget) -> Result<(Progress, HeaderMap), ArmError> {
        match target {
            PollTarget::AsyncOperation(url) => {
                let response = self.send(Method::GET, url.clone(), None).await?;
                let status: OperationStatus = serde_json::from_str(&response.body)?;
                log::debug!("operation status: {}", status.status);
                let progress = match status.status.to_ascii_lowercase().as_str() {
                    "succeeded" => Progress::Done,
                    "failed" | "canceled" | "cancelled" => {
                        let error = status.error.unwrap_or_default();
                        return Err(ArmError::OperationFailed {
                            status: status.status,
                            code: error.code,
                            message: error.message,
                        });
                    }
                    _ => Progress::Running,
                };
                Ok((progress, response.headers))
            }
            PollTarget::Location(url) => {
                let response = self.send(Method::GET, url.clone(), None).await?;
                let progress = if response.status == StatusCode::ACCEPTED {
                    Progress::Running
                } else {
                    Progress::Done
                };
                Ok((progress, response.headers))
            }
        }
    }
}
