use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;

use blob_upload::{
    auth::CertificateTokenProvider,
    client::BlobClient,
    config::{keys, Configuration},
    error::{BlobUploadError, Result},
    upload::{upload_file, UploadMode},
};

/// Uploads a file to an Azure Blob Storage container, authenticating with a
/// certificate
#[derive(Debug, Parser)]
#[command(name = "blob-upload", version)]
struct Cli {
    /// The file to upload
    file: PathBuf,
    /// Settings file
    #[arg(short, long, default_value = "appsettings.json")]
    config: PathBuf,
    /// Write an append blob instead of a block blob
    #[arg(long)]
    append: bool,
    /// Blob name, defaults to the file name
    #[arg(long)]
    name: Option<String>,
}

/// Maps `Logging.LogLevel.Default` values to `env_logger` filters
fn log_filter(level: Option<&str>) -> &'static str {
    match level.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warning") | Some("warn") => "warn",
        Some("error") | Some("critical") => "error",
        Some("none") | Some("off") => "off",
        _ => "info",
    }
}

async fn run(cli: Cli, config: Configuration) -> Result<String> {
    let timeout = config.upload_timeout()?;
    let token_provider = Arc::new(CertificateTokenProvider::from_config(&config)?);
    let client = BlobClient::from_config(&config, token_provider)?;
    let mode = if cli.append {
        UploadMode::Append
    } else {
        UploadMode::Put
    };

    log::info!("Sending blob...");
    tokio::time::timeout(
        timeout,
        upload_file(&client, &cli.file, cli.name.as_deref(), mode),
    )
    .await
    .map_err(|_| BlobUploadError::Timeout(timeout.as_secs()))?
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Configuration::from_json_file(&cli.config) {
        Ok(config) => config.with_env_overrides(),
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_filter(config.get(keys::LOG_LEVEL))),
    )
    .init();

    match run(cli, config).await {
        Ok(_) => {
            log::info!("Put blob operation completed.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Upload failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
