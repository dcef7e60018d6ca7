//! GitHub Container Registry: username plus personal access token.

use async_trait::async_trait;
use scantask_core::error::{Result, TaskError};
use scantask_core::job::RegistryParams;

use super::{CredentialMap, RegistryCredential, ResolveCredentials};

/// Registry host for GHCR.
pub const GHCR_HOST: &str = "ghcr.io";

/// Resolver for `ghcr`. Pure: no network calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct GhcrResolver;

#[async_trait]
impl ResolveCredentials for GhcrResolver {
    async fn resolve(&self, params: &RegistryParams) -> Result<CredentialMap> {
        if params.github_username.is_empty() || params.github_token.is_empty() {
            return Err(TaskError::MissingCredential {
                registry: "GHCR".to_string(),
                fields: "github_username and github_token".to_string(),
            });
        }

        let mut map = CredentialMap::new();
        map.insert(
            GHCR_HOST,
            RegistryCredential::new(&params.github_username, &params.github_token),
        );
        Ok(map)
    }
}
