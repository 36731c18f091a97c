//! Parlor server binary.
//!
//! # Usage
//!
//! ```bash
//! # Development: self-signed TLS, in-memory storage
//! parlor-server --bind 127.0.0.1:4433 --tokens tokens.txt
//!
//! # Production: real TLS and durable storage
//! parlor-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem \
//!     --db parlor.redb --tokens tokens.txt
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parlor_server::{
    MemoryDirectory, MemoryStorage, RedbStorage, Server, ServerConfig, StaticTokens, Storage,
    parse_credentials,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Parlor realtime messaging server
#[derive(Parser, Debug)]
#[command(name = "parlor-server")]
#[command(about = "Parlor room messaging and presence server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Redb database path; omit for in-memory storage
    #[arg(long)]
    db: Option<PathBuf>,

    /// Credential file, one `token:user_id:username` per line
    #[arg(long)]
    tokens: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Parlor server starting");
    tracing::info!("Binding to {}", args.bind);

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("No TLS certificate provided - using self-signed certificate");
        tracing::warn!("This is NOT suitable for production use!");
    }

    let directory = Arc::new(MemoryDirectory::new());
    let mut tokens = StaticTokens::new();
    if let Some(path) = &args.tokens {
        let text = std::fs::read_to_string(path)?;
        let credentials = parse_credentials(&text)
            .map_err(|err| format!("credential file {}: {err}", path.display()))?;
        for credential in &credentials {
            directory.insert(credential.user_id, credential.username.clone());
        }
        tokens = StaticTokens::from_credentials(&credentials);
        tracing::info!(credentials = credentials.len(), "credential table loaded");
    }
    if tokens.is_empty() {
        tracing::warn!("No credential table loaded - every connection will be rejected");
    }

    let config = ServerConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        max_connections: args.max_connections,
        ..ServerConfig::default()
    };

    match &args.db {
        Some(path) => {
            tracing::info!(path = %path.display(), "using redb storage");
            let storage = RedbStorage::open(path)?;
            serve(config, tokens, storage, directory).await
        }
        None => {
            tracing::info!("using in-memory storage");
            serve(config, tokens, MemoryStorage::new(), directory).await
        }
    }
}

async fn serve<S: Storage>(
    config: ServerConfig,
    tokens: StaticTokens,
    storage: S,
    directory: Arc<MemoryDirectory>,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(config, tokens, storage, directory)?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
