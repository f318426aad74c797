//! Upload files to [Azure Blob Storage](https://learn.microsoft.com/azure/storage/blobs/)
//! using a certificate to authenticate.
//!
//! Tokens are acquired with the OAuth2 client-credentials grant.  Instead of a
//! shared secret the application proves its identity with a JWT client assertion
//! signed by an X.509 certificate.  The certificate is either looked up by subject
//! name in a local certificate store or downloaded from Azure Key Vault with the
//! machine's managed identity.
//!
//! The simplest way to build a client is from an `appsettings.json` file:
//!
//! ```ignore
//! let config = Configuration::from_json_file("appsettings.json")?.with_env_overrides();
//! let provider = Arc::new(CertificateTokenProvider::from_config(&config)?);
//! let client = BlobClient::from_config(&config, provider)?;
//!
//! client.put_blob("a.txt", "hello").await?;
//! ```
//!
//! Append blobs must be created before they are appended to:
//!
//! ```ignore
//! client.create_append_blob("log.txt").await?;
//! client.append_blob("log.txt", "line1\n").await?;
//! ```
//!
//! Token acquisition is pluggable.  Any [`TokenProvider`] can be handed to the
//! [`BlobClient`], and a [`TokenCache`] can be shared between providers to avoid a
//! token exchange on every request:
//!
//! [`TokenProvider`]: crate::auth::TokenProvider
//! [`TokenCache`]: crate::auth::TokenCache
//! [`BlobClient`]: crate::client::BlobClient
//!
//! ```ignore
//! let cache = Arc::new(TokenCache::new());
//! let provider = CertificateTokenProvider::from_config(&config)?.with_cache(cache);
//! ```

pub mod auth;
pub mod certificate;
pub mod client;
pub mod config;
pub mod error;
pub mod secret;
pub mod upload;
