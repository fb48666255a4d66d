//! Bearer tokens for the ARM endpoint
//!
//! Azure Stack publishes its login endpoint and token audience through the
//! ARM metadata endpoint. A client-credentials token is requested from that
//! login endpoint and cached until shortly before it expires.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;

use super::ArmError;

const METADATA_API_VERSION: &str = "2015-01-01";

/// Tokens are refreshed this long before they expire
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Lifetime assumed when the token response carries no `expires_in`
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// How the client authenticates
#[derive(Clone)]
pub enum Credentials {
    /// A bearer token acquired elsewhere
    Static(String),
    /// A service principal with a client secret
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Static(_) => f.write_str("Static(***)"),
            Credentials::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MetadataEndpoints {
    authentication: MetadataAuthentication,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataAuthentication {
    login_endpoint: String,
    #[serde(default)]
    audiences: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Seconds, sent as a string by AD FS and as a number by Azure AD
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    fn lifetime(&self) -> Duration {
        let seconds = match &self.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME)
    }
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now() + REFRESH_MARGIN
    }
}

/// Hands out bearer tokens, refreshing them when needed
pub struct TokenProvider {
    http: reqwest::Client,
    arm_endpoint: Url,
    credentials: Credentials,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(http: reqwest::Client, arm_endpoint: Url, credentials: Credentials) -> Self {
        Self {
            http,
            arm_endpoint,
            credentials,
            cached: RwLock::new(None),
        }
    }

    /// Current bearer token
    pub async fn token(&self) -> Result<String, ArmError> {
        let (tenant_id, client_id, client_secret) = match &self.credentials {
            Credentials::Static(token) => return Ok(token.clone()),
            Credentials::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => (tenant_id, client_id, client_secret),
        };

        if let Some(token) = self.cached.read().await.as_ref()
            && token.is_fresh()
        {
            return Ok(token.access_token.clone());
        }

        let mut cached = self.cached.write().await;
        if let Some(token) = cached.as_ref()
            && token.is_fresh()
        {
            return Ok(token.access_token.clone());
        }

        let token = self.acquire(tenant_id, client_id, client_secret).await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    async fn metadata(&self) -> Result<MetadataAuthentication, ArmError> {
        let mut url = self.arm_endpoint.join("/metadata/endpoints")?;
        url.query_pairs_mut()
            .append_pair("api-version", METADATA_API_VERSION);
        log::debug!("GET {}", url);

        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArmError::Auth(format!(
                "retrieving the metadata endpoints of {} returned {}",
                self.arm_endpoint, status
            )));
        }
        let metadata: MetadataEndpoints = response.json().await?;
        Ok(metadata.authentication)
    }

    async fn acquire(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<CachedToken, ArmError> {
        let metadata = self.metadata().await?;
        let resource = metadata
            .audiences
            .first()
            .cloned()
            .ok_or_else(|| ArmError::Auth("metadata endpoint listed no audiences".to_string()))?;
        let url = token_url(&metadata.login_endpoint, tenant_id)?;
        log::debug!("requesting a token from {}", url);

        let response = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("resource", resource.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArmError::Auth(format!(
                "token request returned {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response.json().await?;
        Ok(CachedToken {
            expires_at: Instant::now() + token.lifetime(),
            access_token: token.access_token,
        })
    }
}

/// OAuth token URL for a tenant
///
/// AD FS stamps publish `https://adfs.<domain>/adfs/` as login endpoint and
/// use the tenant `adfs`; both map to `https://adfs.<domain>/adfs/oauth2/token`.
pub(crate) fn token_url(login_endpoint: &str, tenant_id: &str) -> Result<Url, ArmError> {
    let base = login_endpoint.trim_end_matches('/');
    let base = base.strip_suffix("/adfs").unwrap_or(base);
    Ok(Url::parse(&format!("{}/{}/oauth2/token", base, tenant_id))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_url_for_azure_ad() {
        let url = token_url("https://login.microsoftonline.com/", "tenant-1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://login.microsoftonline.com/tenant-1/oauth2/token"
        );
    }

    #[test]
    fn token_url_for_adfs() {
        let url = token_url("https://adfs.local.azurestack.external/adfs/", "adfs").unwrap();
        assert_eq!(
            url.as_str(),
            "https://adfs.local.azurestack.external/adfs/oauth2/token"
        );
    }

    #[test]
    fn token_lifetime_accepts_strings_and_numbers() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token": "t", "expires_in": "120"}"#).unwrap();
        assert_eq!(token.lifetime(), Duration::from_secs(120));

        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token": "t", "expires_in": 90}"#).unwrap();
        assert_eq!(token.lifetime(), Duration::from_secs(90));

        let token: TokenResponse = serde_json::from_str(r#"{"access_token": "t"}"#).unwrap();
        assert_eq!(token.lifetime(), DEFAULT_TOKEN_LIFETIME);
    }

    #[test]
    fn debug_hides_secrets() {
        let credentials = Credentials::ClientSecret {
            tenant_id: "t".to_string(),
            client_id: "c".to_string(),
            client_secret: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", credentials).contains("hunter2"));
        assert!(!format!("{:?}", Credentials::Static("tok".to_string())).contains("tok"));
    }

    #[tokio::test]
    async fn static_token_is_returned_as_is() {
        let provider = TokenProvider::new(
            reqwest::Client::new(),
            Url::parse("https://management.local").unwrap(),
            Credentials::Static("abc".to_string()),
        );
        assert_eq!(provider.token().await.unwrap(), "abc");
    }
}
