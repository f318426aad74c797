//! Error handling utilities for the crate
use thiserror::Error;

use reqwest::Error as ReqwestError;

/// All errors raised by this crate will be instances of BlobUploadError
#[derive(Error, Debug)]
pub enum BlobUploadError {
    #[error("No valid certificate found with subject name '{0}'")]
    CertificateNotFound(String),
    #[error("Secret store request failed: {0}")]
    SecretStore(String),
    #[error("Invalid certificate encoding: {0}")]
    InvalidCertificateEncoding(String),
    #[error("Scope provided is not supported: {0}")]
    InvalidScope(String),
    #[error("Token acquisition failed: {0}")]
    AuthFailure(String),
    #[error("Internal HTTP error: {0}")]
    Transport(#[from] ReqwestError),
    #[error("Storage request failed ({0}): {1}")]
    UnexpectedStatus(u16, String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Upload did not complete within {0} seconds")]
    Timeout(u64),
}

impl BlobUploadError {
    pub fn unexpected_status(status_code: reqwest::StatusCode, body: String) -> Self {
        let body = if body.is_empty() {
            status_code
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string()
        } else {
            body
        };
        BlobUploadError::UnexpectedStatus(status_code.as_u16(), body)
    }

    pub fn required(field_name: &str) -> Self {
        BlobUploadError::InvalidInput(format!("{} is required", field_name))
    }

    pub fn missing_config(key: &str) -> Self {
        BlobUploadError::Config(format!("missing value for '{}'", key))
    }
}

pub type Result<T> = std::result::Result<T, BlobUploadError>;
