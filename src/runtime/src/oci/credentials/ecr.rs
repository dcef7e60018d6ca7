//! AWS Elastic Container Registry: exchanges ambient AWS credentials for a
//! registry-scoped authorization token.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use scantask_core::error::{Result, TaskError};
use scantask_core::job::RegistryParams;

use super::{CredentialMap, RegistryCredential, ResolveCredentials};

const PROVIDER: &str = "ECR";

/// Authorization data returned by ECR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcrAuthorization {
    /// Base64 of `AWS:<password>`
    pub token: String,
    /// Registry endpoint, usually `https://<account>.dkr.ecr.<region>.amazonaws.com`
    pub proxy_endpoint: Option<String>,
}

/// Token issuance API.
#[async_trait]
pub trait EcrTokenApi: Send + Sync {
    /// Returns `None` when the service answered without authorization data.
    async fn authorization_token(
        &self,
        account_id: &str,
        region: &str,
    ) -> Result<Option<EcrAuthorization>>;
}

/// [`EcrTokenApi`] backed by the AWS SDK default credential chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct AwsEcrTokenApi;

#[async_trait]
impl EcrTokenApi for AwsEcrTokenApi {
    async fn authorization_token(
        &self,
        account_id: &str,
        region: &str,
    ) -> Result<Option<EcrAuthorization>> {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        let client = aws_sdk_ecr::Client::new(&config);

        tracing::debug!(account_id, region, "Requesting ECR authorization token");
        let response = client
            .get_authorization_token()
            .send()
            .await
            .map_err(|e| TaskError::AuthProviderError {
                provider: PROVIDER.to_string(),
                message: format!("failed to get ECR auth token: {}", e),
            })?;

        Ok(response.authorization_data().first().and_then(|data| {
            data.authorization_token().map(|token| EcrAuthorization {
                token: token.to_string(),
                proxy_endpoint: data.proxy_endpoint().map(str::to_string),
            })
        }))
    }
}

/// Resolver for `ecr`.
#[derive(Clone)]
pub struct EcrResolver {
    api: Arc<dyn EcrTokenApi>,
}

impl EcrResolver {
    pub fn new(api: Arc<dyn EcrTokenApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ResolveCredentials for EcrResolver {
    async fn resolve(&self, params: &RegistryParams) -> Result<CredentialMap> {
        if params.ecr_account_id.is_empty() || params.ecr_region.is_empty() {
            return Err(TaskError::MissingCredential {
                registry: PROVIDER.to_string(),
                fields: "ecr_account_id and ecr_region".to_string(),
            });
        }

        let authorization = self
            .api
            .authorization_token(&params.ecr_account_id, &params.ecr_region)
            .await?
            .filter(|a| !a.token.is_empty())
            .ok_or_else(|| TaskError::AuthProviderError {
                provider: PROVIDER.to_string(),
                message: "no authorization token received from ECR".to_string(),
            })?;

        let decoded = STANDARD
            .decode(&authorization.token)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| TaskError::AuthProviderError {
                provider: PROVIDER.to_string(),
                message: "failed to decode auth token".to_string(),
            })?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| TaskError::AuthProviderError {
                provider: PROVIDER.to_string(),
                message: "auth token is not of the form user:password".to_string(),
            })?;
        let credential = RegistryCredential::new(username, password);

        // The proxy endpoint names the caller's registry, which may differ
        // from the account the job pulls from.
        let account_host = format!(
            "{}.dkr.ecr.{}.amazonaws.com",
            params.ecr_account_id, params.ecr_region
        );
        let mut map = CredentialMap::new();
        if let Some(endpoint) = &authorization.proxy_endpoint {
            map.insert(strip_scheme(endpoint), credential.clone());
        }
        map.insert(&account_host, credential);

        tracing::debug!(hosts = ?map.hosts(), "Obtained ECR authorization token");
        Ok(map)
    }
}

fn strip_scheme(endpoint: &str) -> &str {
    let endpoint = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint);
    endpoint.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeEcr {
        response: Result<Option<EcrAuthorization>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeEcr {
        fn new(response: Result<Option<EcrAuthorization>>) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EcrTokenApi for FakeEcr {
        async fn authorization_token(
            &self,
            account_id: &str,
            region: &str,
        ) -> Result<Option<EcrAuthorization>> {
            self.calls
                .lock()
                .unwrap()
                .push((account_id.to_string(), region.to_string()));
            match &self.response {
                Ok(v) => Ok(v.clone()),
                Err(e) => Err(TaskError::AuthProviderError {
                    provider: PROVIDER.to_string(),
                    message: e.to_string(),
                }),
            }
        }
    }

    fn params() -> RegistryParams {
        RegistryParams {
            ecr_account_id: "123456789012".to_string(),
            ecr_region: "us-east-1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_keys_by_proxy_endpoint() {
        let api = FakeEcr::new(Ok(Some(EcrAuthorization {
            token: STANDARD.encode("AWS:secret"),
            proxy_endpoint: Some(
                "https://123456789012.dkr.ecr.us-east-1.amazonaws.com".to_string(),
            ),
        })));
        let creds = EcrResolver::new(api.clone()).resolve(&params()).await.unwrap();

        assert_eq!(creds.hosts(), vec!["123456789012.dkr.ecr.us-east-1.amazonaws.com"]);
        let cred = creds.get("123456789012.dkr.ecr.us-east-1.amazonaws.com").unwrap();
        assert_eq!(cred.username, "AWS");
        assert_eq!(cred.secret, "secret");
        assert_eq!(cred.encoded_auth(), "QVdTOnNlY3JldA==");
        assert_eq!(
            api.calls.lock().unwrap().as_slice(),
            &[("123456789012".to_string(), "us-east-1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_missing_fields_do_not_call_api() {
        let api = FakeEcr::new(Ok(None));
        let mut p = params();
        p.ecr_region.clear();
        let err = EcrResolver::new(api.clone()).resolve(&p).await.unwrap_err();
        assert!(matches!(err, TaskError::MissingCredential { .. }));
        assert!(api.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_token_is_provider_error() {
        let api = FakeEcr::new(Ok(None));
        let err = EcrResolver::new(api).resolve(&params()).await.unwrap_err();
        assert!(matches!(err, TaskError::AuthProviderError { .. }));
        assert!(err.to_string().contains("no authorization token"));
    }

    #[tokio::test]
    async fn test_api_error_propagates() {
        let api = FakeEcr::new(Err(TaskError::Other("AccessDenied".to_string())));
        let err = EcrResolver::new(api).resolve(&params()).await.unwrap_err();
        assert!(matches!(err, TaskError::AuthProviderError { .. }));
        assert!(err.to_string().contains("AccessDenied"));
    }

    #[tokio::test]
    async fn test_missing_endpoint_falls_back_to_account_host() {
        let api = FakeEcr::new(Ok(Some(EcrAuthorization {
            token: STANDARD.encode("AWS:pw"),
            proxy_endpoint: None,
        })));
        let creds = EcrResolver::new(api).resolve(&params()).await.unwrap();
        assert!(creds.get("123456789012.dkr.ecr.us-east-1.amazonaws.com").is_some());
    }

    #[tokio::test]
    async fn test_cross_account_registry_is_keyed() {
        let api = FakeEcr::new(Ok(Some(EcrAuthorization {
            token: STANDARD.encode("AWS:pw"),
            proxy_endpoint: Some(
                "https://999999999999.dkr.ecr.us-east-1.amazonaws.com".to_string(),
            ),
        })));
        let creds = EcrResolver::new(api).resolve(&params()).await.unwrap();

        assert_eq!(creds.len(), 2);
        let job_host = creds.get("123456789012.dkr.ecr.us-east-1.amazonaws.com").unwrap();
        assert_eq!(job_host.secret, "pw");
        assert!(creds.get("999999999999.dkr.ecr.us-east-1.amazonaws.com").is_some());
    }

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("https://a.example.com"), "a.example.com");
        assert_eq!(strip_scheme("http://a.example.com/"), "a.example.com");
        assert_eq!(strip_scheme("a.example.com"), "a.example.com");
    }
}
