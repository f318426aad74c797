//! Reading secrets from Azure Key Vault with an ambient managed identity
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
    auth::{AccessToken, NumberOrString, TokenProvider},
    client::{url_join, GLOBAL_CLIENT},
    error::{BlobUploadError, Result},
};

/// Azure Instance Metadata Service token endpoint
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
pub const KEY_VAULT_RESOURCE: &str = "https://vault.azure.net";
const KEY_VAULT_API_VERSION: &str = "7.4";

/// A read-only store of named secrets
#[async_trait]
pub trait SecretStore: fmt::Debug + Send + Sync {
    async fn get_secret(&self, vault_uri: &str, name: &str) -> Result<String>;
}

/// Tokens for the managed identity of the machine the process runs on.
///
/// No credentials are configured; the identity is assigned to the VM / service
/// and queried from the instance metadata endpoint.
#[derive(Debug, Clone)]
pub struct ManagedIdentityCredential {
    endpoint: String,
    /// Selects a user-assigned identity
    client_id: Option<String>,
}

impl Default for ManagedIdentityCredential {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedIdentityCredential {
    pub fn new() -> Self {
        Self {
            endpoint: IMDS_ENDPOINT.to_string(),
            client_id: None,
        }
    }

    /// Overrides the metadata endpoint.  This is not normally needed but can be
    /// used for testing purposes.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
    /// Unix timestamp
    expires_on: NumberOrString,
}

#[async_trait]
impl TokenProvider for ManagedIdentityCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken> {
        let mut request = GLOBAL_CLIENT
            .get(&self.endpoint)
            .query(&[("api-version", IMDS_API_VERSION), ("resource", resource)])
            .header("Metadata", "true");
        if let Some(client_id) = &self.client_id {
            request = request.query(&[("client_id", client_id)]);
        }

        let response = request.send().await.map_err(|e| {
            BlobUploadError::AuthFailure(format!(
                "managed identity endpoint is not reachable: {}",
                e
            ))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BlobUploadError::AuthFailure(format!(
                "managed identity token request failed with status {}: {}",
                status, body
            )));
        }

        let token = response.json::<ImdsTokenResponse>().await.map_err(|e| {
            BlobUploadError::AuthFailure(format!("invalid managed identity token response: {}", e))
        })?;
        let expires_on = token
            .expires_on
            .as_i64()
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .ok_or_else(|| {
                BlobUploadError::AuthFailure("invalid expires_on in token response".to_string())
            })?;
        Ok(AccessToken::new(token.access_token, expires_on))
    }
}

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

#[derive(Deserialize)]
struct KeyVaultErrorDetail {
    code: String,
    message: Option<String>,
}

#[derive(Deserialize)]
struct KeyVaultError {
    error: KeyVaultErrorDetail,
}

/// Azure Key Vault secrets, read with a token for [`KEY_VAULT_RESOURCE`]
#[derive(Debug, Clone)]
pub struct KeyVaultSecretStore {
    credential: Arc<dyn TokenProvider>,
}

impl KeyVaultSecretStore {
    pub fn new(credential: Arc<dyn TokenProvider>) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl SecretStore for KeyVaultSecretStore {
    async fn get_secret(&self, vault_uri: &str, name: &str) -> Result<String> {
        if name.is_empty() {
            return Err(BlobUploadError::required("secret name"));
        }
        log::info!("Key vault uri: {} Secret name: {}", vault_uri, name);

        let token = self
            .credential
            .get_token(KEY_VAULT_RESOURCE)
            .await
            .map_err(|e| {
                BlobUploadError::SecretStore(format!("could not authenticate to key vault: {}", e))
            })?;

        let url = url_join(vault_uri.to_string(), format!("secrets/{name}"));
        let response = GLOBAL_CLIENT
            .get(&url)
            .query(&[("api-version", KEY_VAULT_API_VERSION)])
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(|e| {
                BlobUploadError::SecretStore(format!("request to {} failed: {}", url, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<KeyVaultError>().await {
                Ok(error) => format!(
                    "{}: {}",
                    error.error.code,
                    error.error.message.unwrap_or_default()
                ),
                Err(_) => status
                    .canonical_reason()
                    .unwrap_or("Unknown Error")
                    .to_string(),
            };
            return Err(BlobUploadError::SecretStore(format!(
                "key vault returned {} ({})",
                status.as_u16(),
                detail
            )));
        }

        let bundle = response.json::<SecretBundle>().await.map_err(|e| {
            BlobUploadError::SecretStore(format!("invalid key vault response: {}", e))
        })?;
        Ok(bundle.value)
    }
}
