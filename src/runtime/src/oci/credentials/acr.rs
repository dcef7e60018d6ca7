//! Azure Container Registry: two-step OAuth exchange.
//!
//! 1. An Azure AD access token is traded for an ACR refresh token
//!    (`grant_type=access_token` against `/oauth2/exchange`).
//! 2. The refresh token is traded for a repository-scoped access token
//!    (`grant_type=refresh_token` against `/oauth2/token`).
//!
//! Every HTTP call is bounded by [`EXCHANGE_TIMEOUT`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scantask_core::error::{Result, TaskError};
use scantask_core::job::RegistryParams;
use serde::Deserialize;

use super::{CredentialMap, RegistryCredential, ResolveCredentials};

const PROVIDER: &str = "ACR";

/// Username ACR expects alongside an exchanged access token.
pub const ACR_PLACEHOLDER_USERNAME: &str = "00000000-0000-0000-0000-000000000000";

/// Wall-clock bound for each token exchange request.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Scope requested for the registry access token.
const ACR_PULL_SCOPE: &str = "repository:*:pull";

/// Scope requested for the Azure AD token.
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Resource requested from the instance metadata endpoint.
const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";

const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254";

const IMDS_API_VERSION: &str = "2018-02-01";

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Source of Azure AD access tokens.
#[async_trait]
pub trait AadTokenSource: Send + Sync {
    async fn access_token(&self, tenant_id: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Azure AD credential chain configured from the standard `AZURE_*` variables.
///
/// Tried in order: client secret (`AZURE_CLIENT_ID` + `AZURE_CLIENT_SECRET`),
/// workload identity (`AZURE_CLIENT_ID` + `AZURE_FEDERATED_TOKEN_FILE`), then
/// the instance metadata endpoint for a managed identity. A lone
/// `AZURE_CLIENT_ID` selects a user-assigned managed identity.
#[derive(Debug, Clone)]
pub struct AzureTokenSource {
    http: reqwest::Client,
    authority_host: String,
    imds_endpoint: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    federated_token_file: Option<PathBuf>,
}

impl AzureTokenSource {
    pub fn from_env() -> Result<Self> {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Ok(Self {
            http: exchange_client()?,
            authority_host: var("AZURE_AUTHORITY_HOST")
                .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string()),
            imds_endpoint: var("AZURE_POD_IDENTITY_AUTHORITY_HOST")
                .unwrap_or_else(|| DEFAULT_IMDS_ENDPOINT.to_string()),
            client_id: var("AZURE_CLIENT_ID"),
            client_secret: var("AZURE_CLIENT_SECRET"),
            federated_token_file: var("AZURE_FEDERATED_TOKEN_FILE").map(PathBuf::from),
        })
    }

    async fn client_credentials(
        &self,
        tenant_id: &str,
        client_id: &str,
        secret: ClientSecret<'_>,
    ) -> Result<String> {
        let assertion;
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("scope", MANAGEMENT_SCOPE),
        ];
        match secret {
            ClientSecret::Secret(secret) => form.push(("client_secret", secret)),
            ClientSecret::FederatedTokenFile(path) => {
                assertion = tokio::fs::read_to_string(path).await.map_err(|e| {
                    provider_error(&format!(
                        "failed to read federated token {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE));
                form.push(("client_assertion", assertion.trim()));
            }
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            tenant_id
        );
        let response: TokenResponse = post_form(&self.http, &url, &form).await?;
        response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| provider_error("no access_token in Azure AD response"))
    }

    async fn managed_identity(&self) -> Result<String> {
        let url = format!(
            "{}/metadata/identity/oauth2/token",
            self.imds_endpoint.trim_end_matches('/')
        );
        let mut query = vec![
            ("api-version", IMDS_API_VERSION),
            ("resource", MANAGEMENT_RESOURCE),
        ];
        if let Some(client_id) = self.client_id.as_deref() {
            query.push(("client_id", client_id));
        }

        let response = self
            .http
            .get(&url)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await
            .map_err(|e| provider_error(&format!("managed identity unavailable: {}", e)))?;
        let response: TokenResponse = read_json(&url, response).await?;
        response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| provider_error("no access_token in managed identity response"))
    }
}

enum ClientSecret<'a> {
    Secret(&'a str),
    FederatedTokenFile(&'a Path),
}

#[async_trait]
impl AadTokenSource for AzureTokenSource {
    async fn access_token(&self, tenant_id: &str) -> Result<String> {
        let client_id = self.client_id.as_deref();
        let secret = match (&self.client_secret, &self.federated_token_file) {
            (Some(secret), _) => Some(ClientSecret::Secret(secret)),
            (None, Some(path)) => Some(ClientSecret::FederatedTokenFile(path)),
            (None, None) => None,
        };

        match (client_id, secret) {
            (Some(client_id), Some(secret)) => {
                self.client_credentials(tenant_id, client_id, secret).await
            }
            _ => {
                tracing::debug!(
                    user_assigned = client_id.is_some(),
                    "Requesting Azure AD token from managed identity"
                );
                self.managed_identity().await
            }
        }
    }
}

/// Resolver for `acr`.
#[derive(Clone)]
pub struct AcrResolver {
    aad: Arc<dyn AadTokenSource>,
    http: reqwest::Client,
    scheme: String,
}

impl AcrResolver {
    pub fn new(aad: Arc<dyn AadTokenSource>) -> Result<Self> {
        Ok(Self {
            aad,
            http: exchange_client()?,
            scheme: "https".to_string(),
        })
    }

    /// Talk to the login server over `scheme` instead of https.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    async fn refresh_token(
        &self,
        login_server: &str,
        tenant_id: &str,
        aad_token: &str,
    ) -> Result<String> {
        let url = format!("{}://{}/oauth2/exchange", self.scheme, login_server);
        let response: TokenResponse = post_form(
            &self.http,
            &url,
            &[
                ("grant_type", "access_token"),
                ("service", login_server),
                ("tenant", tenant_id),
                ("access_token", aad_token),
            ],
        )
        .await?;
        response
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| provider_error("no refresh_token in ACR exchange response"))
    }

    async fn access_token(&self, login_server: &str, refresh_token: &str) -> Result<String> {
        let url = format!("{}://{}/oauth2/token", self.scheme, login_server);
        let response: TokenResponse = post_form(
            &self.http,
            &url,
            &[
                ("grant_type", "refresh_token"),
                ("service", login_server),
                ("refresh_token", refresh_token),
                ("scope", ACR_PULL_SCOPE),
            ],
        )
        .await?;
        response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| provider_error("no access_token in ACR token response"))
    }
}

#[async_trait]
impl ResolveCredentials for AcrResolver {
    async fn resolve(&self, params: &RegistryParams) -> Result<CredentialMap> {
        let login_server = params.acr_login_server.as_str();
        let tenant_id = params.acr_tenant_id.as_str();
        if login_server.is_empty() || tenant_id.is_empty() {
            return Err(TaskError::MissingCredential {
                registry: PROVIDER.to_string(),
                fields: "acr_login_server and acr_tenant_id".to_string(),
            });
        }

        let aad_token = self.aad.access_token(tenant_id).await?;
        let refresh_token = self.refresh_token(login_server, tenant_id, &aad_token).await?;
        let access_token = self.access_token(login_server, &refresh_token).await?;

        tracing::debug!(registry = %login_server, "Exchanged ACR access token");

        let mut map = CredentialMap::new();
        map.insert(
            login_server,
            RegistryCredential::new(ACR_PLACEHOLDER_USERNAME, access_token),
        );
        Ok(map)
    }
}

fn exchange_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(EXCHANGE_TIMEOUT)
        .build()
        .map_err(|e| provider_error(&format!("failed to build HTTP client: {}", e)))
}

fn provider_error(message: &str) -> TaskError {
    TaskError::AuthProviderError {
        provider: PROVIDER.to_string(),
        message: message.to_string(),
    }
}

async fn post_form<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    form: &[(&str, &str)],
) -> Result<T> {
    let response = http
        .post(url)
        .form(form)
        .send()
        .await
        .map_err(|e| provider_error(&format!("POST {} failed: {}", url, e)))?;
    read_json(url, response).await
}

async fn read_json<T: serde::de::DeserializeOwned>(
    url: &str,
    response: reqwest::Response,
) -> Result<T> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| provider_error(&format!("{} failed reading body: {}", url, e)))?;
    if !status.is_success() {
        return Err(provider_error(&format!(
            "{} returned {} body: {}",
            url,
            status.as_u16(),
            String::from_utf8_lossy(&body)
        )));
    }

    serde_json::from_slice(&body)
        .map_err(|e| provider_error(&format!("invalid response from {}: {}", url, e)))
}
