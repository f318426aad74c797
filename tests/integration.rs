//! These tests run the whole pipeline (managed identity, key vault, token exchange and
//! storage) against a single mock server.  The tests at the bottom of the file run
//! against a real storage account and are ignored by default.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use all_asserts::assert_true;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mockito::{Matcher, Mock, ServerGuard};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use serde_json::json;
use serial_test::serial;

use blob_upload::auth::{CertificateTokenProvider, TokenCache};
use blob_upload::certificate::{
    CertificateResolver, CertificateSource, DirectoryCertificateStore,
};
use blob_upload::client::{BlobClient, BlobStorageApi};
use blob_upload::config::Configuration;
use blob_upload::error::BlobUploadError;
use blob_upload::secret::{KeyVaultSecretStore, ManagedIdentityCredential, KEY_VAULT_RESOURCE};
use blob_upload::upload::{upload_file, UploadMode};

const CLIENT_ID: &str = "00000000-1111-2222-3333-444444444444";
const SECRET_NAME: &str = "blob-upload-cert";
const CONTAINER: &str = "testmpb";

fn self_signed(key: &PKeyRef<Private>) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("O", "Contoso").unwrap();
    name.append_entry_by_text("CN", "blob-upload").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

fn new_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

/// A password-less PKCS#12 archive, base64 encoded the way it is stored in key vault
fn certificate_secret() -> String {
    let key = new_key();
    let cert = self_signed(&key);
    let der = Pkcs12::builder()
        .name("blob-upload")
        .pkey(&*key)
        .cert(&cert)
        .build2("")
        .unwrap()
        .to_der()
        .unwrap();
    STANDARD.encode(der)
}

fn certificate_pem() -> Vec<u8> {
    let key = new_key();
    let mut pem = self_signed(&key).to_pem().unwrap();
    pem.extend(key.private_key_to_pem_pkcs8().unwrap());
    pem
}

async fn mock_managed_identity(server: &mut ServerGuard) -> Mock {
    server
        .mock("GET", "/metadata/identity/oauth2/token")
        .match_query(Matcher::UrlEncoded(
            "resource".to_string(),
            KEY_VAULT_RESOURCE.to_string(),
        ))
        .match_header("metadata", "true")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "access_token": "kv-token", "expires_on": "1900000000" }).to_string())
        .create_async()
        .await
}

async fn mock_key_vault(server: &mut ServerGuard, secret: &str) -> Mock {
    server
        .mock("GET", format!("/secrets/{SECRET_NAME}").as_str())
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer kv-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "value": secret }).to_string())
        .create_async()
        .await
}

fn token_endpoint(server: &mut ServerGuard) -> Mock {
    server
        .mock("POST", "/contoso/oauth2/v2.0/token")
        .match_body(Matcher::UrlEncoded(
            "scope".to_string(),
            "https://storage.azure.com/.default".to_string(),
        ))
        .with_header("content-type", "application/json")
}

async fn mock_token_success(server: &mut ServerGuard) -> Mock {
    token_endpoint(server)
        .with_status(200)
        .with_body(
            json!({ "token_type": "Bearer", "expires_in": 3599, "access_token": "storage-token" })
                .to_string(),
        )
        .create_async()
        .await
}

fn key_vault_provider(server: &ServerGuard) -> CertificateTokenProvider {
    let credential = ManagedIdentityCredential::new()
        .with_endpoint(format!("{}/metadata/identity/oauth2/token", server.url()));
    let resolver = CertificateResolver::new(CertificateSource::SecretStore {
        vault_uri: server.url(),
        secret_name: SECRET_NAME.to_string(),
        store: Arc::new(KeyVaultSecretStore::new(Arc::new(credential))),
    });
    CertificateTokenProvider::new(resolver, CLIENT_ID, format!("{}/contoso", server.url()))
}

fn write_temp_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn uploads_with_key_vault_certificate() {
    let mut server = mockito::Server::new_async().await;
    let identity = mock_managed_identity(&mut server).await;
    let vault = mock_key_vault(&mut server, &certificate_secret()).await;
    let token = mock_token_success(&mut server).await;
    let storage = server
        .mock("PUT", "/testmpb/a.txt")
        .match_header("authorization", "Bearer storage-token")
        .match_header("x-ms-blob-type", "BlockBlob")
        .match_header("x-ms-version", Matcher::Any)
        .match_body("hello")
        .with_status(201)
        .create_async()
        .await;

    let client = BlobClient::new(Arc::new(key_vault_provider(&server)), server.url(), CONTAINER);
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_file(&dir, "a.txt", b"hello");

    upload_file(&client, &path, None, UploadMode::Put)
        .await
        .unwrap();

    identity.assert_async().await;
    vault.assert_async().await;
    token.assert_async().await;
    storage.assert_async().await;
}

#[tokio::test]
async fn appends_with_directory_certificate_and_cache() {
    let mut server = mockito::Server::new_async().await;
    let token = mock_token_success(&mut server).await;
    let create = server
        .mock("PUT", "/testmpb/log.txt")
        .match_query(Matcher::Missing)
        .match_header("authorization", "Bearer storage-token")
        .match_header("x-ms-blob-type", "AppendBlob")
        .with_status(201)
        .create_async()
        .await;
    let append = server
        .mock("PUT", "/testmpb/log.txt")
        .match_query(Matcher::UrlEncoded(
            "comp".to_string(),
            "appendblock".to_string(),
        ))
        .match_header("authorization", "Bearer storage-token")
        .match_header("x-ms-blob-type", "AppendBlob")
        .match_body("line1")
        .with_status(201)
        .create_async()
        .await;

    let certs = tempfile::tempdir().unwrap();
    write_temp_file(&certs, "blob-upload.pem", &certificate_pem());
    write_temp_file(&certs, "README.txt", b"not a certificate");
    let resolver = CertificateResolver::new(CertificateSource::Store {
        subject_name: "cn=blob-upload,o=contoso".to_string(),
        store: Arc::new(DirectoryCertificateStore::new(certs.path())),
    });
    let provider = CertificateTokenProvider::new(
        resolver,
        CLIENT_ID,
        format!("{}/contoso", server.url()),
    )
    .with_cache(Arc::new(TokenCache::new()));
    let client = BlobClient::new(Arc::new(provider), server.url(), CONTAINER);

    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_file(&dir, "today.log", b"line1");
    upload_file(&client, &path, Some("log.txt"), UploadMode::Append)
        .await
        .unwrap();

    // Both storage calls share a single token exchange
    token.assert_async().await;
    create.assert_async().await;
    append.assert_async().await;
}

#[tokio::test]
async fn file_names_with_reserved_characters_are_appended_in_place() {
    let mut server = mockito::Server::new_async().await;
    let _identity = mock_managed_identity(&mut server).await;
    let _vault = mock_key_vault(&mut server, &certificate_secret()).await;
    let _token = mock_token_success(&mut server).await;
    let create = server
        .mock("PUT", "/testmpb/report%231.txt")
        .match_query(Matcher::Missing)
        .match_header("x-ms-blob-type", "AppendBlob")
        .with_status(201)
        .create_async()
        .await;
    let append = server
        .mock("PUT", "/testmpb/report%231.txt")
        .match_query(Matcher::UrlEncoded(
            "comp".to_string(),
            "appendblock".to_string(),
        ))
        .match_body("line1")
        .with_status(201)
        .create_async()
        .await;
    let elsewhere = server
        .mock("PUT", "/testmpb/report")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let client = BlobClient::new(Arc::new(key_vault_provider(&server)), server.url(), CONTAINER);
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_file(&dir, "report#1.txt", b"line1");

    upload_file(&client, &path, None, UploadMode::Append)
        .await
        .unwrap();

    create.assert_async().await;
    append.assert_async().await;
    elsewhere.assert_async().await;
}

#[tokio::test]
async fn invalid_secret_never_requests_a_token() {
    let mut server = mockito::Server::new_async().await;
    let _identity = mock_managed_identity(&mut server).await;
    let vault = mock_key_vault(&mut server, "this is not base64!").await;
    let token = token_endpoint(&mut server).expect(0).create_async().await;
    let storage = server
        .mock("PUT", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let client = BlobClient::new(Arc::new(key_vault_provider(&server)), server.url(), CONTAINER);
    let result = client.put_blob("a.txt", "hello").await;

    assert_true!(matches!(
        result,
        Err(BlobUploadError::InvalidCertificateEncoding(_))
    ));
    vault.assert_async().await;
    token.assert_async().await;
    storage.assert_async().await;
}

#[tokio::test]
async fn invalid_scope_is_reported() {
    let mut server = mockito::Server::new_async().await;
    let _identity = mock_managed_identity(&mut server).await;
    let _vault = mock_key_vault(&mut server, &certificate_secret()).await;
    let token = token_endpoint(&mut server)
        .with_status(400)
        .with_body(
            json!({
                "error": "invalid_scope",
                "error_description": "AADSTS70011: The provided request must include a 'scope' input parameter.",
                "error_codes": [70011]
            })
            .to_string(),
        )
        .create_async()
        .await;
    let storage = server
        .mock("PUT", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let client = BlobClient::new(Arc::new(key_vault_provider(&server)), server.url(), CONTAINER);
    let result = client.put_blob("a.txt", "hello").await;

    assert_true!(matches!(result, Err(BlobUploadError::InvalidScope(_))));
    token.assert_async().await;
    storage.assert_async().await;
}

#[tokio::test]
async fn storage_network_error_is_returned() {
    let mut server = mockito::Server::new_async().await;
    let _identity = mock_managed_identity(&mut server).await;
    let _vault = mock_key_vault(&mut server, &certificate_secret()).await;
    let token = mock_token_success(&mut server).await;

    let client = BlobClient::new(
        Arc::new(key_vault_provider(&server)),
        "http://127.0.0.1:1",
        CONTAINER,
    );
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_file(&dir, "a.txt", b"hello");
    let result = upload_file(&client, &path, None, UploadMode::Put).await;

    assert_true!(matches!(result, Err(BlobUploadError::Transport(_))));
    token.assert_async().await;
}

/// Settings for the live tests come from the file named by BLOB_UPLOAD_TEST_SETTINGS, in
/// the same format as the CLI's appsettings.json.  The machine must be able to reach the
/// configured certificate (local store or key vault via managed identity).
fn live_client() -> BlobClient {
    let settings = env::var("BLOB_UPLOAD_TEST_SETTINGS").unwrap();
    let config = Configuration::from_json_file(settings)
        .unwrap()
        .with_env_overrides();
    let provider = CertificateTokenProvider::from_config(&config)
        .unwrap()
        .with_cache(Arc::new(TokenCache::new()));
    BlobClient::from_config(&config, Arc::new(provider)).unwrap()
}

#[tokio::test]
#[ignore]
#[serial]
async fn live_put_blob() {
    let client = live_client();
    client
        .put_blob("blob_upload_unittest/a.txt", "hello")
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
#[serial]
async fn live_append_blob() {
    let client = live_client();
    let name = "blob_upload_unittest/log.txt";
    client.create_append_blob(name).await.unwrap();
    client.append_blob(name, "line1\n").await.unwrap();
    client.append_blob(name, "line2\n").await.unwrap();
}
