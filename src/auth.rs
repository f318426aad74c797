//! Authentication utilities for working with the API
//!
//! Storage requests are authorized with OAuth2 bearer tokens.  The tokens are
//! obtained through the client-credentials grant, proving the application's
//! identity with a client assertion signed by an X.509 certificate.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    certificate::{Certificate, CertificateResolver},
    client::{url_join, GLOBAL_CLIENT},
    config::{keys, Configuration},
    error::{BlobUploadError, Result},
};

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
/// AADSTS70011: the scope is not of the form `<resource>/.default`
const INVALID_SCOPE_CODE: u32 = 70011;
const ASSERTION_LIFETIME_SECONDS: i64 = 600;
const EXPIRY_MARGIN_SECONDS: i64 = 30;

/// A bearer token and the time it stops being valid
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: String,
    expires_on: DateTime<Utc>,
}

// Custom implementation of Debug to avoid printing the token
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"**********")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    pub fn secret(&self) -> &str {
        &self.token
    }

    pub fn expires_on(&self) -> DateTime<Utc> {
        self.expires_on
    }

    /// True if the token expires within the refresh margin of `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on - Duration::seconds(EXPIRY_MARGIN_SECONDS) <= now
    }
}

/// A trait for providing a bearer token for a resource (e.g. `https://storage.azure.com`).
///
/// [`CertificateTokenProvider`] is the implementation used for storage requests.
/// [`ManagedIdentityCredential`](crate::secret::ManagedIdentityCredential) supplies
/// the ambient identity used to read the certificate from Key Vault.  Tests can
/// swap in their own implementation.
#[async_trait]
pub trait TokenProvider: fmt::Debug + Send + Sync {
    async fn get_token(&self, resource: &str) -> Result<AccessToken>;
}

/// The scope requested for `resource` in a client-credentials flow.
///
/// Application permissions are granted statically, so the scope is always
/// `<resource>/.default`.
pub fn scope_for(resource: &str) -> String {
    format!("{resource}/.default")
}

fn validate_resource(resource: &str) -> Result<()> {
    match Url::parse(resource) {
        Ok(url) if url.scheme() == "https" && url.has_host() => Ok(()),
        _ => Err(BlobUploadError::InvalidScope(format!(
            "resource '{}' is not an absolute https URI",
            resource
        ))),
    }
}

/// Tokens keyed by resource and certificate thumbprint.
///
/// Not used unless injected with [`CertificateTokenProvider::with_cache`]; by
/// default every call performs a fresh exchange.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<(String, String), AccessToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: &str, thumbprint: &str, now: DateTime<Utc>) -> Option<AccessToken> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (resource.to_string(), thumbprint.to_string());
        match entries.get(&key) {
            Some(token) if !token.is_expired_at(now) => Some(token.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, resource: &str, thumbprint: &str, token: AccessToken) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((resource.to_string(), thumbprint.to_string()), token);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Some token endpoints encode numbers as strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum NumberOrString {
    Number(i64),
    Text(String),
}

impl NumberOrString {
    pub(crate) fn as_i64(&self) -> Option<i64> {
        match self {
            NumberOrString::Number(n) => Some(*n),
            NumberOrString::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ClientAssertionClaims {
    aud: String,
    exp: i64,
    iat: i64,
    iss: String,
    jti: String,
    nbf: i64,
    sub: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: NumberOrString,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
    #[serde(default)]
    error_codes: Vec<u32>,
}

impl TokenErrorResponse {
    fn is_invalid_scope(&self) -> bool {
        self.error_codes.contains(&INVALID_SCOPE_CODE)
            || self
                .error_description
                .as_deref()
                .is_some_and(|d| d.contains("AADSTS70011"))
    }

    fn description(&self) -> &str {
        self.error_description.as_deref().unwrap_or(&self.error)
    }
}

/// Signs a client assertion JWT (RS256, `x5t` thumbprint header) for `audience`.
///
/// `EncodingKey` keeps its own DER copy of the private key, which is not
/// zeroized.  The key is only built for the signing call and is freed (not
/// wiped) before this returns.
fn client_assertion(certificate: &Certificate, client_id: &str, audience: &str) -> Result<String> {
    let mut header = Header::new(Algorithm::RS256);
    header.x5t = Some(certificate.thumbprint().to_string());

    let now = Utc::now().timestamp();
    let claims = ClientAssertionClaims {
        aud: audience.to_string(),
        exp: now + ASSERTION_LIFETIME_SECONDS,
        iat: now,
        iss: client_id.to_string(),
        jti: uuid::Uuid::new_v4().to_string(),
        nbf: now,
        sub: client_id.to_string(),
    };

    let key = EncodingKey::from_rsa_pem(certificate.private_key_pem()).map_err(|e| {
        BlobUploadError::InvalidCertificateEncoding(format!("unusable private key: {}", e))
    })?;
    let assertion = jsonwebtoken::encode(&header, &claims, &key).map_err(|e| {
        BlobUploadError::AuthFailure(format!("could not sign client assertion: {}", e))
    });
    drop(key);
    assertion
}

fn classify_token_error(status: reqwest::StatusCode, body: &str) -> BlobUploadError {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(error) if error.is_invalid_scope() => {
            // The scope has to be of the form "https://resourceurl/.default"
            log::error!("Scope provided is not supported");
            BlobUploadError::InvalidScope(error.description().to_string())
        }
        Ok(error) => {
            BlobUploadError::AuthFailure(format!("{}: {}", error.error, error.description()))
        }
        Err(_) => BlobUploadError::AuthFailure(format!(
            "token request failed with status {}: {}",
            status, body
        )),
    }
}

/// Acquires tokens with the client-credentials grant, authenticating with a
/// certificate (a confidential client).
#[derive(Debug)]
pub struct CertificateTokenProvider {
    resolver: CertificateResolver,
    client_id: String,
    /// e.g. `https://login.microsoftonline.com/<tenant>`
    authority: String,
    cache: Option<Arc<TokenCache>>,
}

impl CertificateTokenProvider {
    pub fn new(
        resolver: CertificateResolver,
        client_id: impl Into<String>,
        authority: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            client_id: client_id.into(),
            authority: authority.into(),
            cache: None,
        }
    }

    pub fn from_config(config: &Configuration) -> Result<Self> {
        Ok(Self::new(
            CertificateResolver::from_config(config)?,
            config.require(keys::CLIENT_ID)?,
            config.require(keys::AUTHORITY)?,
        ))
    }

    /// Reuses tokens from `cache` while they are valid
    pub fn with_cache(mut self, cache: Arc<TokenCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn token_endpoint(&self) -> String {
        url_join(self.authority.clone(), "oauth2/v2.0/token".to_string())
    }

    async fn exchange(&self, endpoint: &str, assertion: &str, scope: &str) -> Result<AccessToken> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", assertion),
            ("scope", scope),
        ];

        let response = GLOBAL_CLIENT
            .post(endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| BlobUploadError::AuthFailure(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_token_error(status, &body));
        }

        let token = response.json::<TokenResponse>().await.map_err(|e| {
            BlobUploadError::AuthFailure(format!("invalid token response: {}", e))
        })?;
        let expires_in = token.expires_in.as_i64().ok_or_else(|| {
            BlobUploadError::AuthFailure("invalid expires_in in token response".to_string())
        })?;
        Ok(AccessToken::new(
            token.access_token,
            Utc::now() + Duration::seconds(expires_in),
        ))
    }
}

#[async_trait]
impl TokenProvider for CertificateTokenProvider {
    async fn get_token(&self, resource: &str) -> Result<AccessToken> {
        validate_resource(resource)?;
        let scope = scope_for(resource);

        let certificate = self.resolver.resolve().await?;
        let thumbprint = certificate.thumbprint().to_string();

        if let Some(cache) = &self.cache {
            if let Some(token) = cache.get(resource, &thumbprint, Utc::now()) {
                log::debug!("Using cached token for {}", resource);
                return Ok(token);
            }
        }

        let endpoint = self.token_endpoint();
        let assertion = client_assertion(&certificate, &self.client_id, &endpoint)?;
        // Wipes the certificate's key buffer before going to the network
        drop(certificate);

        let token = self.exchange(&endpoint, &assertion, &scope).await?;
        log::info!("Token acquired for {}", resource);

        if let Some(cache) = &self.cache {
            cache.insert(resource, &thumbprint, token.clone());
        }
        Ok(token)
    }
}
