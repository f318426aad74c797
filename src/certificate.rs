//! Locating the X.509 certificate used to sign client assertions
//!
//! A certificate is either looked up by subject name in a local certificate store
//! or downloaded from a secret store as a base64 encoded PKCS#12 / PEM blob.
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use openssl::{
    asn1::{Asn1Time, Asn1TimeRef},
    hash::MessageDigest,
    pkcs12::Pkcs12,
    pkey::{Id, PKey, PKeyRef, Private},
    x509::{X509NameRef, X509Ref, X509},
};
use zeroize::Zeroizing;

use crate::{
    config::{keys, Configuration},
    error::{BlobUploadError, Result},
    secret::{KeyVaultSecretStore, ManagedIdentityCredential, SecretStore},
};

/// Directory searched for certificates when the configuration does not name one
pub const DEFAULT_STORE_PATH: &str = "/etc/blob-upload/certs";

/// An X.509 certificate together with its RSA private key.
///
/// The private key is kept as a PKCS#8 PEM document in a buffer that is wiped
/// when the certificate is dropped.
pub struct Certificate {
    subject: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    thumbprint: String,
    private_key_pem: Zeroizing<Vec<u8>>,
}

// Custom implementation of Debug to avoid printing the private key
impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("thumbprint", &self.thumbprint)
            .field("private_key_pem", &"**********")
            .finish()
    }
}

impl Certificate {
    /// Parses a PEM document containing a certificate and its private key
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let cert = X509::from_pem(pem).map_err(invalid_encoding)?;
        let key = PKey::private_key_from_pem(pem).map_err(invalid_encoding)?;
        Self::from_openssl(&cert, &key)
    }

    /// Parses a PKCS#12 archive
    pub fn from_pkcs12(der: &[u8], password: &str) -> Result<Self> {
        let parsed = Pkcs12::from_der(der)
            .and_then(|archive| archive.parse2(password))
            .map_err(invalid_encoding)?;
        match (parsed.cert, parsed.pkey) {
            (Some(cert), Some(key)) => Self::from_openssl(&cert, &key),
            (None, _) => Err(BlobUploadError::InvalidCertificateEncoding(
                "PKCS#12 archive does not contain a certificate".to_string(),
            )),
            (_, None) => Err(BlobUploadError::InvalidCertificateEncoding(
                "PKCS#12 archive does not contain a private key".to_string(),
            )),
        }
    }

    /// Parses a password-less PKCS#12 archive, falling back to PEM
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_pkcs12(bytes, "")
            .or_else(|pkcs12_err| Self::from_pem(bytes).map_err(|_| pkcs12_err))
    }

    /// Decodes a base64 string (as stored in a secret store) into a certificate
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let raw = Zeroizing::new(STANDARD.decode(compact).map_err(|e| {
            BlobUploadError::InvalidCertificateEncoding(format!("not valid base64: {}", e))
        })?);
        Self::from_bytes(&raw)
    }

    fn from_openssl(cert: &X509Ref, key: &PKeyRef<Private>) -> Result<Self> {
        if key.id() != Id::RSA {
            return Err(BlobUploadError::InvalidCertificateEncoding(
                "only RSA private keys are supported".to_string(),
            ));
        }
        let public_matches = cert
            .public_key()
            .map(|public| key.public_eq(&*public))
            .map_err(invalid_encoding)?;
        if !public_matches {
            return Err(BlobUploadError::InvalidCertificateEncoding(
                "private key does not belong to the certificate".to_string(),
            ));
        }
        let digest = cert.digest(MessageDigest::sha1()).map_err(invalid_encoding)?;
        Ok(Self {
            subject: distinguished_name(cert.subject_name())?,
            not_before: to_utc(cert.not_before())?,
            not_after: to_utc(cert.not_after())?,
            thumbprint: URL_SAFE_NO_PAD.encode(&*digest),
            private_key_pem: Zeroizing::new(
                key.private_key_to_pem_pkcs8().map_err(invalid_encoding)?,
            ),
        })
    }

    /// Subject distinguished name, most specific component first (`CN=..., O=...`)
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Base64url encoded SHA-1 hash of the DER certificate (the JWT `x5t` header)
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub(crate) fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }

    pub fn is_time_valid(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

fn invalid_encoding(err: openssl::error::ErrorStack) -> BlobUploadError {
    BlobUploadError::InvalidCertificateEncoding(err.to_string())
}

fn to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0).map_err(invalid_encoding)?;
    let diff = epoch.diff(time).map_err(invalid_encoding)?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
        BlobUploadError::InvalidCertificateEncoding(format!("timestamp out of range: {}", time))
    })
}

/// Renders a name most specific component first, escaping values as in RFC 4514
fn distinguished_name(name: &X509NameRef) -> Result<String> {
    let mut parts = name
        .entries()
        .map(|entry| -> Result<String> {
            let attribute = entry.object().nid().short_name().unwrap_or("UNDEF");
            let value = std::str::from_utf8(entry.data().as_slice()).map_err(|_| {
                BlobUploadError::InvalidCertificateEncoding(format!(
                    "subject attribute {} is not UTF-8",
                    attribute
                ))
            })?;
            Ok(format!("{attribute}={}", escape_dn_value(value)))
        })
        .collect::<Result<Vec<_>>>()?;
    parts.reverse();
    Ok(parts.join(", "))
}

fn escape_dn_value(value: &str) -> String {
    let last = value.chars().count().saturating_sub(1);
    let mut escaped = String::with_capacity(value.len());
    for (idx, c) in value.chars().enumerate() {
        match c {
            '\0' => escaped.push_str("\\00"),
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' => {
                escaped.push('\\');
                escaped.push(c);
            }
            ' ' | '#' if idx == 0 => {
                escaped.push('\\');
                escaped.push(c);
            }
            ' ' if idx == last => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Splits a distinguished name into lowercased `attr=value` components.
///
/// `,`, `;` and `+` all separate components unless escaped with `\`, so the
/// attributes of a multi-valued RDN compare as consecutive components.
fn normalize_dn(name: &str) -> Vec<String> {
    let mut components = Vec::new();
    let mut current = String::new();
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' | ';' | '+' => components.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    components.push(current);
    components
        .into_iter()
        .map(|part| part.trim().to_lowercase())
        .collect()
}

/// Picks the signing certificate among `candidates`.
///
/// Only certificates that are valid at `now` and whose subject matches
/// `subject_name` are considered.  When several remain, the one with the most
/// recent not-before date wins (the first one on equal dates).
pub fn select_certificate(
    candidates: Vec<Certificate>,
    subject_name: &str,
    now: DateTime<Utc>,
) -> Result<Certificate> {
    if subject_name.trim().is_empty() {
        return Err(BlobUploadError::CertificateNotFound(subject_name.to_string()));
    }
    let wanted = normalize_dn(subject_name);
    candidates
        .into_iter()
        .filter(|cert| cert.is_time_valid(now))
        .filter(|cert| normalize_dn(cert.subject()) == wanted)
        .reduce(|best, cert| {
            if cert.not_before > best.not_before {
                cert
            } else {
                best
            }
        })
        .ok_or_else(|| BlobUploadError::CertificateNotFound(subject_name.to_string()))
}

/// A local, read-only collection of certificates with private keys
pub trait CertificateStore: fmt::Debug + Send + Sync {
    fn certificates(&self) -> Result<Vec<Certificate>>;
}

/// A certificate store backed by a directory.
///
/// `.pem`, `.crt` and `.cer` files must contain the certificate followed by its
/// private key.  `.pfx` and `.p12` files must be PKCS#12 archives without a
/// password.  Files that cannot be loaded are skipped.
#[derive(Debug, Clone)]
pub struct DirectoryCertificateStore {
    path: PathBuf,
}

impl DirectoryCertificateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(path: &Path) -> Option<Result<Certificate>> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        let parse: fn(&[u8]) -> Result<Certificate> = match extension.as_str() {
            "pem" | "crt" | "cer" => Certificate::from_pem,
            "pfx" | "p12" => |bytes| Certificate::from_pkcs12(bytes, ""),
            _ => return None,
        };
        Some(
            fs::read(path)
                .map(Zeroizing::new)
                .map_err(BlobUploadError::from)
                .and_then(|bytes| parse(&bytes)),
        )
    }
}

impl CertificateStore for DirectoryCertificateStore {
    fn certificates(&self) -> Result<Vec<Certificate>> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!(
                    "Certificate store {} is not readable: {}",
                    self.path.display(),
                    e
                );
                return Ok(Vec::new());
            }
        };

        let mut certificates = Vec::new();
        for entry in entries {
            let path = entry?.path();
            match Self::load(&path) {
                Some(Ok(cert)) => {
                    log::debug!("Loaded certificate {} from {}", cert.subject(), path.display());
                    certificates.push(cert);
                }
                Some(Err(e)) => log::warn!("Skipping {}: {}", path.display(), e),
                None => {}
            }
        }
        Ok(certificates)
    }
}

/// Where the signing certificate comes from
#[derive(Debug, Clone)]
pub enum CertificateSource {
    /// Look up a certificate by subject distinguished name in a local store
    Store {
        subject_name: String,
        store: Arc<dyn CertificateStore>,
    },
    /// Download a base64 encoded certificate from a secret store
    SecretStore {
        vault_uri: String,
        secret_name: String,
        store: Arc<dyn SecretStore>,
    },
}

#[derive(Debug, Clone)]
pub struct CertificateResolver {
    source: CertificateSource,
}

impl CertificateResolver {
    pub fn new(source: CertificateSource) -> Self {
        Self { source }
    }

    /// Chooses the certificate source from configuration.
    ///
    /// A non-empty `AppId.certificate.name` selects the local store; otherwise
    /// the Key Vault URI and secret name are required.
    pub fn from_config(config: &Configuration) -> Result<Self> {
        let source = match config.get_non_empty(keys::CERTIFICATE_NAME) {
            Some(subject_name) => CertificateSource::Store {
                subject_name: subject_name.to_string(),
                store: Arc::new(DirectoryCertificateStore::new(
                    config
                        .get_non_empty(keys::CERTIFICATE_STORE_PATH)
                        .unwrap_or(DEFAULT_STORE_PATH),
                )),
            },
            None => CertificateSource::SecretStore {
                vault_uri: config.require(keys::KEY_VAULT_URI)?.to_string(),
                secret_name: config.require(keys::KEY_VAULT_SECRET)?.to_string(),
                store: Arc::new(KeyVaultSecretStore::new(Arc::new(
                    ManagedIdentityCredential::new(),
                ))),
            },
        };
        Ok(Self::new(source))
    }

    pub fn source(&self) -> &CertificateSource {
        &self.source
    }

    pub async fn resolve(&self) -> Result<Certificate> {
        match &self.source {
            CertificateSource::Store {
                subject_name,
                store,
            } => {
                log::info!("Using machine store certificate {}", subject_name);
                select_certificate(store.certificates()?, subject_name, Utc::now())
            }
            CertificateSource::SecretStore {
                vault_uri,
                secret_name,
                store,
            } => {
                log::info!("Using key vault {} secret {}", vault_uri, secret_name);
                let secret = Zeroizing::new(store.get_secret(vault_uri, secret_name).await?);
                Certificate::from_base64(&secret)
            }
        }
    }
}
