//! Uploading a local file as a blob
use std::path::Path;

use bytes::Bytes;

use crate::{
    client::BlobStorageApi,
    error::{BlobUploadError, Result},
};

/// How a file is written to the container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UploadMode {
    /// A single block blob put
    #[default]
    Put,
    /// Create an append blob, then append the file as one block
    Append,
}

/// The blob name for `path`: its final component
pub fn blob_name_for(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            BlobUploadError::InvalidInput(format!("{} has no usable file name", path.display()))
        })
}

/// Reads `path` and writes it to the container.
///
/// The blob is named after the file unless `blob_name` is given.  Returns the
/// body of the last storage response.
pub async fn upload_file<C>(
    client: &C,
    path: &Path,
    blob_name: Option<&str>,
    mode: UploadMode,
) -> Result<String>
where
    C: BlobStorageApi + Sync,
{
    let blob_name = match blob_name {
        Some(name) => name.to_string(),
        None => blob_name_for(path)?,
    };
    let content = Bytes::from(tokio::fs::read(path).await?);
    log::info!(
        "Uploading {} ({} bytes) as {}",
        path.display(),
        content.len(),
        blob_name
    );

    match mode {
        UploadMode::Put => client.put_blob(&blob_name, content).await,
        UploadMode::Append => {
            client.create_append_blob(&blob_name).await?;
            let response = client.append_blob(&blob_name, content).await?;
            log::info!("End append");
            Ok(response)
        }
    }
}
