//! Feedwire command-line client.
//!
//! A thin wrapper around the feedwire-protocol library that:
//! 1. Parses command-line arguments
//! 2. Initializes logging
//! 3. Performs one cached GET against a feed
//! 4. Writes the body to stdout or a file
//!
//! For library usage, see the feedwire-protocol crate documentation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use feedwire_protocol::{
    CacheContext, CachedRequest, CredentialContext, CredentialError, CredentialRequestType,
    CredentialService, HttpSource, HttpSourceConfig, HttpSourceResultStatus, NetworkCredential,
    PackageSource, ProcessEnv,
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "feedwire", about = "Cached HTTP client for package feeds", version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "FEEDWIRE_LOG_JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a URL through the disk cache
    Get(GetArgs),
}

#[derive(Debug, clap::Args)]
struct GetArgs {
    /// URL to fetch
    url: Url,

    /// Cache entry name; derived from the URL path when omitted
    #[arg(long)]
    cache_key: Option<String>,

    /// Serve cached entries younger than this; 0 bypasses the shared cache
    #[arg(long, default_value_t = 1800)]
    max_age_secs: u64,

    /// Stream the body without caching it
    #[arg(long)]
    direct_download: bool,

    /// Feed user name
    #[arg(long, env = "FEEDWIRE_USERNAME")]
    username: Option<String>,

    /// Feed password or personal access token
    #[arg(long, env = "FEEDWIRE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Proxy URL
    #[arg(long, env = "FEEDWIRE_PROXY")]
    proxy: Option<Url>,

    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// Answers every prompt with the credentials given on the command line
struct StaticCredentialService {
    credentials: NetworkCredential,
}

#[async_trait]
impl CredentialService for StaticCredentialService {
    async fn get_credentials(
        &self,
        uri: &Url,
        _proxy: Option<&Url>,
        request_type: CredentialRequestType,
        _message: &str,
        _token: &CancellationToken,
    ) -> Result<Option<NetworkCredential>, CredentialError> {
        tracing::debug!("Supplying {request_type:?} credentials for {uri}");
        Ok(Some(self.credentials.clone()))
    }
}

fn cache_key_for(url: &Url) -> String {
    let path = url.path().trim_matches('/');
    if path.is_empty() {
        url.host_str().unwrap_or("root").to_string()
    } else {
        path.replace('/', "_")
    }
}

async fn get(args: GetArgs) -> Result<()> {
    let mut config = HttpSourceConfig::from_env(&ProcessEnv);
    if args.proxy.is_some() {
        config.proxy = args.proxy.clone();
    }

    let mut source = PackageSource::new(args.url.clone());
    let mut credentials = CredentialContext::new();
    if let (Some(username), Some(password)) = (args.username, args.password) {
        let credential = NetworkCredential::new(username, password);
        source = source.with_credentials(credential.clone());
        credentials = credentials.with_service(Arc::new(StaticCredentialService {
            credentials: credential,
        }));
    }

    let http = HttpSource::new(source, config).with_credential_context(credentials);

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling request");
            cancel.cancel();
        }
    });

    let context = CacheContext::new()
        .with_max_age(Duration::from_secs(args.max_age_secs))
        .with_direct_download(args.direct_download);
    let cache_key = args.cache_key.unwrap_or_else(|| cache_key_for(&args.url));
    let request = CachedRequest::new(args.url.clone(), cache_key, context);

    let (status, body) = http
        .get(
            request,
            |result| async move {
                let status = result.status;
                result.read_to_end().await.map(|body| (status, body))
            },
            &token,
        )
        .await
        .with_context(|| format!("Failed to fetch {}", args.url))?;

    tracing::info!("{:?}, {} bytes", status, body.len());
    if matches!(
        status,
        HttpSourceResultStatus::NotFound | HttpSourceResultStatus::NoContent
    ) {
        return Ok(());
    }

    match args.output {
        Some(path) => tokio::fs::write(&path, &body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&body).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only the body
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Command::Get(args) => get(args).await,
    }
}
