//! Flat, read-only configuration
//!
//! Settings are stored as a mapping from dotted keys (e.g. `AppId.certificate.name`)
//! to strings.  They are normally loaded from an `appsettings.json` file whose nested
//! objects are flattened, and may be overridden by environment variables.
use std::{collections::HashMap, env, fs, path::Path, time::Duration};

use serde_json::Value;

use crate::error::{BlobUploadError, Result};

/// Well-known configuration keys
pub mod keys {
    pub const CERTIFICATE_NAME: &str = "AppId.certificate.name";
    pub const CERTIFICATE_STORE_PATH: &str = "AppId.certificate.storePath";
    pub const KEY_VAULT_URI: &str = "AppId.certificate.keyVaultUri";
    pub const KEY_VAULT_SECRET: &str = "AppId.certificate.secret";
    pub const CLIENT_ID: &str = "AppId.id";
    pub const AUTHORITY: &str = "AppId.authority";
    pub const STORAGE_URL: &str = "storageAccount.url";
    pub const STORAGE_CONTAINER: &str = "storageAccount.container";
    pub const UPLOAD_TIMEOUT_SECONDS: &str = "upload.timeoutSeconds";
    pub const LOG_LEVEL: &str = "Logging.LogLevel.Default";
}

/// Prefix of environment variables that override file settings.
///
/// `BLOB_UPLOAD__AppId__id=abc` overrides the key `AppId.id`.
pub const ENV_PREFIX: &str = "BLOB_UPLOAD__";

pub const DEFAULT_UPLOAD_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Clone, Default)]
pub struct Configuration {
    values: HashMap<String, String>,
}

impl Configuration {
    /// Loads settings from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            BlobUploadError::Config(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Parses settings from a JSON document, flattening nested objects
    pub fn from_json_str(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| BlobUploadError::Config(format!("invalid JSON: {}", e)))?;
        if !root.is_object() {
            return Err(BlobUploadError::Config(
                "top level of the settings file must be an object".to_string(),
            ));
        }
        let mut values = HashMap::new();
        flatten("", &root, &mut values);
        Ok(Self { values })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Applies overrides from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(env::vars())
    }

    /// Applies overrides from `(name, value)` pairs.  Only names starting with
    /// [`ENV_PREFIX`] are considered.
    pub fn with_overrides_from<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            if let Some(key) = name.strip_prefix(ENV_PREFIX) {
                if !key.is_empty() {
                    self.values.insert(key.replace("__", "."), value);
                }
            }
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns the value for `key`, treating empty strings as missing
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get_non_empty(key)
            .ok_or_else(|| BlobUploadError::missing_config(key))
    }

    /// The deadline for a whole upload, including token acquisition
    pub fn upload_timeout(&self) -> Result<Duration> {
        let seconds = match self.get_non_empty(keys::UPLOAD_TIMEOUT_SECONDS) {
            Some(value) => value.trim().parse::<u64>().map_err(|_| {
                BlobUploadError::Config(format!(
                    "'{}' must be a whole number of seconds, got '{}'",
                    keys::UPLOAD_TIMEOUT_SECONDS,
                    value
                ))
            })?,
            None => DEFAULT_UPLOAD_TIMEOUT_SECONDS,
        };
        if seconds == 0 {
            return Err(BlobUploadError::Config(format!(
                "'{}' must be positive",
                keys::UPLOAD_TIMEOUT_SECONDS
            )));
        }
        Ok(Duration::from_secs(seconds))
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut HashMap<String, String>) {
    let join = |segment: &str| {
        if prefix.is_empty() {
            segment.to_string()
        } else {
            format!("{prefix}.{segment}")
        }
    };
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten(&join(k), v, out);
            }
        }
        Value::Array(items) => {
            for (idx, v) in items.iter().enumerate() {
                flatten(&join(&idx.to_string()), v, out);
            }
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        Value::Null => {}
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}
