//! ARM REST client
//!
//! A thin wrapper over `reqwest` for the Azure Resource Manager API of an
//! Azure Stack stamp. Every call carries an `api-version`, a bearer token and
//! (unless disabled) a correlation request id. `GET` maps 404 to `None`;
//! mutating calls block on the long-running operation they start.

pub mod auth;
pub mod poller;

use azstack_core::provider::{ErrorKind, ProviderError, ProviderResult};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

pub use auth::{Credentials, TokenProvider};
pub use poller::PollConfig;

/// Header carrying the per-run correlation id
const CORRELATION_HEADER: &str = "x-ms-correlation-request-id";

/// Maximum length of a response body included in debug logs
const MAX_LOG_BODY_LENGTH: usize = 200;

/// API versions of the Compute resource provider available on Azure Stack
pub mod api_version {
    pub const AVAILABILITY_SETS: &str = "2020-06-01";
    pub const DISKS: &str = "2019-07-01";
    pub const IMAGES: &str = "2020-06-01";
    pub const VIRTUAL_MACHINES: &str = "2020-06-01";
    pub const VIRTUAL_MACHINE_SCALE_SETS: &str = "2020-06-01";
    pub const NETWORK_INTERFACES: &str = "2018-11-01";
}

/// Error returned by the ARM API or the transport underneath it
#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    #[error("{method} {url} returned {status}: {code}: {message}")]
    Api {
        method: String,
        url: String,
        status: u16,
        code: String,
        message: String,
    },

    #[error("long running operation {status}: {code}: {message}")]
    OperationFailed {
        status: String,
        code: String,
        message: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ArmError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ArmError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    fn kind(&self) -> ErrorKind {
        if self.is_not_found() {
            ErrorKind::NotFound
        } else {
            ErrorKind::Api
        }
    }
}

impl From<ArmError> for ProviderError {
    fn from(err: ArmError) -> Self {
        ProviderError::new(err.to_string())
            .with_kind(err.kind())
            .with_cause(err)
    }
}

/// Attach a description of the failed step to an ARM error
pub trait ArmResultExt<T> {
    fn with_context<F>(self, f: F) -> ProviderResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ArmResultExt<T> for Result<T, ArmError> {
    fn with_context<F>(self, f: F) -> ProviderResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| {
            ProviderError::new(format!("{}: {}", f(), err))
                .with_kind(err.kind())
                .with_cause(err)
        })
    }
}

/// ARM error envelope: `{"error": {"code": "...", "message": "..."}}`
#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Default, Clone, serde::Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// One page of an ARM collection
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct Page<T> {
    #[serde(default)]
    value: Vec<T>,
    #[serde(default)]
    next_link: Option<String>,
}

/// Truncate a response body before it reaches the logs
fn sanitize_for_log(body: &str) -> String {
    if body.len() > MAX_LOG_BODY_LENGTH {
        let mut end = MAX_LOG_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, {} bytes total]", &body[..end], body.len())
    } else {
        body.to_string()
    }
}

/// Raw response of a single ARM call
pub(crate) struct ArmResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl ArmResponse {
    fn json<T: DeserializeOwned>(&self) -> Result<T, ArmError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Client for the Azure Resource Manager endpoint of one subscription
pub struct ArmClient {
    http: reqwest::Client,
    endpoint: Url,
    subscription_id: String,
    tokens: TokenProvider,
    correlation_id: Option<String>,
    poll: PollConfig,
}

impl ArmClient {
    pub fn new(
        endpoint: &str,
        subscription_id: impl Into<String>,
        credentials: Credentials,
    ) -> Result<Self, ArmError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("azstack/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let endpoint = Url::parse(endpoint)?;
        let tokens = TokenProvider::new(http.clone(), endpoint.clone(), credentials);

        Ok(Self {
            http,
            endpoint,
            subscription_id: subscription_id.into(),
            tokens,
            correlation_id: Some(uuid::Uuid::new_v4().to_string()),
            poll: PollConfig::default(),
        })
    }

    /// Stop sending the `x-ms-correlation-request-id` header
    pub fn without_correlation_id(mut self) -> Self {
        self.correlation_id = None;
        self
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn resource_url(&self, path: &str, api_version: &str) -> Result<Url, ArmError> {
        let mut url = self.endpoint.join(path)?;
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }

    /// Send one request and return the raw response, mapping non-success statuses to errors
    pub(crate) async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<ArmResponse, ArmError> {
        log::debug!("{} {}", method, url);

        let token = self.tokens.token().await?;
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(token);
        if let Some(id) = &self.correlation_id {
            request = request.header(CORRELATION_HEADER, id);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        if !status.is_success() {
            log::debug!("API error: {} - {}", status, sanitize_for_log(&body));
            let error = serde_json::from_str::<ErrorEnvelope>(&body)
                .ok()
                .and_then(|e| e.error)
                .unwrap_or_else(|| ErrorBody {
                    code: status.canonical_reason().unwrap_or("Unknown").to_string(),
                    message: body.clone(),
                });
            return Err(ArmError::Api {
                method: method.to_string(),
                url: url.to_string(),
                status: status.as_u16(),
                code: error.code,
                message: error.message,
            });
        }

        Ok(ArmResponse {
            status,
            headers,
            body,
        })
    }

    /// GET a resource; `None` when it does not exist
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
    ) -> Result<Option<T>, ArmError> {
        self.get_with_query(path, api_version, &[]).await
    }

    /// GET a resource with extra query parameters (e.g. `$expand`)
    pub async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, ArmError> {
        let mut url = self.resource_url(path, api_version)?;
        url.query_pairs_mut().extend_pairs(query);
        match self.send(Method::GET, url, None).await {
            Ok(response) => Ok(Some(response.json()?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// GET every item of a collection, following `nextLink`
    pub async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
    ) -> Result<Vec<T>, ArmError> {
        let mut items = Vec::new();
        let mut url = self.resource_url(path, api_version)?;
        loop {
            let page: Page<T> = self.send(Method::GET, url, None).await?.json()?;
            items.extend(page.value);
            match page.next_link {
                Some(next) => url = Url::parse(&next)?,
                None => return Ok(items),
            }
        }
    }

    /// Create or update a resource and wait for the operation to finish
    pub async fn put<B: Serialize>(
        &self,
        path: &str,
        api_version: &str,
        body: &B,
    ) -> Result<(), ArmError> {
        let url = self.resource_url(path, api_version)?;
        let response = self
            .send(Method::PUT, url, Some(serde_json::to_value(body)?))
            .await?;
        self.wait_for_completion(&response).await
    }

    /// Partially update a resource and wait for the operation to finish
    pub async fn patch<B: Serialize>(
        &self,
        path: &str,
        api_version: &str,
        body: &B,
    ) -> Result<(), ArmError> {
        let url = self.resource_url(path, api_version)?;
        let response = self
            .send(Method::PATCH, url, Some(serde_json::to_value(body)?))
            .await?;
        self.wait_for_completion(&response).await
    }

    /// Invoke an action (e.g. `/powerOff`) and wait for it to finish
    pub async fn post(
        &self,
        path: &str,
        api_version: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> Result<(), ArmError> {
        let mut url = self.resource_url(path, api_version)?;
        url.query_pairs_mut().extend_pairs(query);
        let response = self.send(Method::POST, url, body).await?;
        self.wait_for_completion(&response).await
    }

    /// Delete a resource and wait for it to be gone
    ///
    /// Returns `false` when the resource did not exist.
    pub async fn delete(
        &self,
        path: &str,
        api_version: &str,
        query: &[(&str, &str)],
    ) -> Result<bool, ArmError> {
        let mut url = self.resource_url(path, api_version)?;
        url.query_pairs_mut().extend_pairs(query);
        match self.send(Method::DELETE, url, None).await {
            Ok(response) if response.status == StatusCode::NO_CONTENT => Ok(false),
            Ok(response) => {
                self.wait_for_completion(&response).await?;
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_truncates_long_bodies() {
        let body = "x".repeat(500);
        let sanitized = sanitize_for_log(&body);
        assert!(sanitized.starts_with(&"x".repeat(200)));
        assert!(sanitized.ends_with("[truncated, 500 bytes total]"));
        assert_eq!(sanitize_for_log("short"), "short");
    }

    #[test]
    fn not_found_maps_to_provider_kind() {
        let err = ArmError::Api {
            method: "GET".to_string(),
            url: "https://example/disks/d".to_string(),
            status: 404,
            code: "ResourceNotFound".to_string(),
            message: "gone".to_string(),
        };
        assert!(err.is_not_found());
        let err: ProviderError = err.into();
        assert!(err.is_not_found());
        assert!(err.message.contains("ResourceNotFound"));
    }

    #[test]
    fn context_keeps_the_error_kind() {
        let result: Result<(), ArmError> = Err(ArmError::Auth("no token".to_string()));
        let err = result
            .with_context(|| "retrieving Managed Disk \"d\"".to_string())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Api);
        assert_eq!(
            err.message,
            "retrieving Managed Disk \"d\": authentication failed: no token"
        );
    }

    #[test]
    fn page_of_items_without_default() {
        #[derive(Debug, serde::Deserialize)]
        struct Item {
            name: String,
        }

        let page: Page<Item> = serde_json::from_str(
            r#"{"value":[{"name":"a"},{"name":"b"}],"nextLink":"https://example/next"}"#,
        )
        .unwrap();
        let names: Vec<_> = page.value.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(page.next_link.as_deref(), Some("https://example/next"));

        let empty: Page<Item> = serde_json::from_str("{}").unwrap();
        assert!(empty.value.is_empty());
        assert!(empty.next_link.is_none());
    }

    #[test]
    fn resource_url_appends_api_version() {
        let client = ArmClient::new(
            "https://management.local.azurestack.external",
            "sub",
            Credentials::Static("token".to_string()),
        )
        .unwrap();
        let url = client
            .resource_url(
                "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/d",
                api_version::DISKS,
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://management.local.azurestack.external/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/d?api-version=2019-07-01"
        );
    }
}
