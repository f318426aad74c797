//! Authorized requests against the Azure Blob Storage REST API
use std::{env, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::{header::CONTENT_LENGTH, Body, Client, Method, RequestBuilder};
use url::Url;

use crate::{
    auth::{AccessToken, TokenProvider},
    config::{keys, Configuration},
    error::{BlobUploadError, Result},
};

/// The resource that storage tokens are requested for
pub const STORAGE_RESOURCE: &str = "https://storage.azure.com";
const STORAGE_API_VERSION: &str = "2019-02-02";
pub(crate) static GLOBAL_CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// The kind of blob a request targets.
///
/// Block blobs are written in a single put and may be overwritten.  Append blobs
/// are created empty and then grown with append-block operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobType {
    BlockBlob,
    AppendBlob,
}

impl BlobType {
    /// Value of the `x-ms-blob-type` header
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobType::BlockBlob => "BlockBlob",
            BlobType::AppendBlob => "AppendBlob",
        }
    }
}

pub struct BlobClient {
    /// A token provider to use to obtain a token to authenticate with the API
    token_provider: Arc<dyn TokenProvider>,
    /// The storage account URL, e.g. `https://acct.blob.core.windows.net`
    base_url: String,
    container: String,
    /// The `x-ms-version` sent with every request
    api_version: String,
}

/// A client for a single container of a storage account.
///
/// Every request acquires a fresh token from the token provider (unless the
/// provider caches) and is sent over a process-wide HTTP client.
impl BlobClient {
    pub fn new(
        token_provider: Arc<dyn TokenProvider>,
        base_url: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            token_provider,
            base_url: base_url.into(),
            container: container.into(),
            api_version: Self::get_api_version(),
        }
    }

    pub fn from_config(
        config: &Configuration,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let base_url = config.require(keys::STORAGE_URL)?;
        parse_base_url(base_url)?;
        Ok(Self::new(
            token_provider,
            base_url,
            config.require(keys::STORAGE_CONTAINER)?,
        ))
    }

    fn get_api_version() -> String {
        env::var("AZURE_STORAGE_API_VERSION_OVERRIDE")
            .unwrap_or_else(|_| STORAGE_API_VERSION.to_string())
    }

    /// `<base>/<container>/<blob_name>`
    ///
    /// Each `/`-separated segment of the blob name is percent-encoded, so `#`, `?`
    /// and `%` stay part of the name.
    pub fn blob_url(&self, blob_name: &str) -> Result<Url> {
        let mut url = parse_base_url(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| {
                BlobUploadError::Config(format!(
                    "storage account url '{}' cannot have a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .push(&self.container)
            .extend(blob_name.split('/'));
        Ok(url)
    }

    /// The append-block URL of `blob_name`
    pub fn append_block_url(&self, blob_name: &str) -> Result<Url> {
        let mut url = self.blob_url(blob_name)?;
        url.query_pairs_mut().append_pair("comp", "appendblock");
        Ok(url)
    }

    /// Builds a request carrying the bearer token and the storage protocol headers
    pub fn build_request(
        &self,
        method: Method,
        url: &str,
        blob_type: BlobType,
        body: Option<Body>,
        token: &AccessToken,
    ) -> RequestBuilder {
        let request = GLOBAL_CLIENT
            .request(method, url)
            .bearer_auth(token.secret())
            .header("x-ms-version", self.api_version.clone())
            .header("x-ms-blob-type", blob_type.as_str());
        match body {
            Some(body) => request.body(body),
            None => request.header(CONTENT_LENGTH, 0),
        }
    }

    /// Sends a request with an already acquired token and returns the response text
    pub async fn send_with_token(
        &self,
        method: Method,
        url: &str,
        blob_type: BlobType,
        body: Option<Body>,
        token: &AccessToken,
    ) -> Result<String> {
        let request = self.build_request(method, url, blob_type, body, token);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                log::error!("Error sending request to {}: {}", url, e);
                return Err(e.into());
            }
        };

        let status = response.status();
        log::info!("Status code: {}", status);

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                log::error!("Error reading response from {}: {}", url, e);
                return Err(e.into());
            }
        };
        log::info!("Request response: {}", text);

        if !status.is_success() {
            return Err(BlobUploadError::unexpected_status(status, text));
        }
        Ok(text)
    }

    /// Acquires a storage token and sends the request
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        blob_type: BlobType,
        body: Option<Body>,
    ) -> Result<String> {
        let token = self.token_provider.get_token(STORAGE_RESOURCE).await?;
        log::info!("Storage account token acquired");
        self.send_with_token(method, url, blob_type, body, &token)
            .await
    }
}

/// Blob operations supported by the client
#[async_trait]
pub trait BlobStorageApi {
    /// Uploads a block blob, replacing any existing blob with the same name
    ///
    /// # Arguments
    ///
    /// * `blob_name` - The name of the blob inside the container
    /// * `content` - The contents of the blob
    ///
    /// # Returns
    ///
    /// The body of the storage service response
    async fn put_blob(&self, blob_name: &str, content: impl Into<Body> + Send) -> Result<String>;

    /// Creates an empty append blob
    ///
    /// This must be called before [`append_blob`](Self::append_blob).
    async fn create_append_blob(&self, blob_name: &str) -> Result<String>;

    /// Appends a block to an existing append blob
    async fn append_blob(&self, blob_name: &str, content: impl Into<Body> + Send) -> Result<String>;
}

pub(crate) fn url_join(left: String, right: String) -> String {
    if left.ends_with('/') {
        if let Some(stripped) = right.strip_prefix('/') {
            left + stripped
        } else {
            left + &right
        }
    } else if right.starts_with('/') {
        left + &right
    } else {
        left + "/" + &right
    }
}

fn parse_base_url(base_url: &str) -> Result<Url> {
    Url::parse(base_url).map_err(|e| {
        BlobUploadError::Config(format!("invalid storage account url '{}': {}", base_url, e))
    })
}

fn check_blob_name(blob_name: &str) -> Result<()> {
    if blob_name.trim().is_empty() {
        return Err(BlobUploadError::required("blob_name"));
    }
    Ok(())
}

#[async_trait]
impl BlobStorageApi for BlobClient {
    async fn put_blob(&self, blob_name: &str, content: impl Into<Body> + Send) -> Result<String> {
        check_blob_name(blob_name)?;
        let url = self.blob_url(blob_name)?;
        self.send(
            Method::PUT,
            url.as_str(),
            BlobType::BlockBlob,
            Some(content.into()),
        )
        .await
    }

    async fn create_append_blob(&self, blob_name: &str) -> Result<String> {
        check_blob_name(blob_name)?;
        let url = self.blob_url(blob_name)?;
        self.send(Method::PUT, url.as_str(), BlobType::AppendBlob, None)
            .await
    }

    async fn append_blob(
        &self,
        blob_name: &str,
        content: impl Into<Body> + Send,
    ) -> Result<String> {
        check_blob_name(blob_name)?;
        let url = self.append_block_url(blob_name)?;
        self.send(
            Method::PUT,
            url.as_str(),
            BlobType::AppendBlob,
            Some(content.into()),
        )
        .await
    }
}
