//! regcache: inspect and maintain a regcache durable store.
//!
//! Build: `cargo build --bin regcache --features cli`

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use regcache::{CacheService, Settings};

/// regcache maintenance CLI
#[derive(Parser)]
#[command(name = "regcache")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and maintain a registry result cache")]
struct Args {
    /// Path to a TOML settings file.
    #[arg(short, long, env = "REGCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache directory (overrides the settings file).
    #[arg(long, env = "REGCACHE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a URL through the cache and print the body
    Get {
        url: String,
        /// Credential scoping the entry (sent as a bearer token unless "ambient")
        #[arg(long, env = "REGCACHE_CREDENTIAL")]
        credential: Option<String>,
        /// Wait for any background refresh this request triggered
        #[arg(long)]
        wait: bool,
    },
    /// List cached keys
    Keys,
    /// Remove one URL from the cache
    Invalidate {
        url: String,
        #[arg(long, env = "REGCACHE_CREDENTIAL")]
        credential: Option<String>,
    },
    /// Remove every cached record
    Clear,
    /// Remove records older than the configured max age
    Prune,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let storage_dir = args.storage_dir.unwrap_or_else(|| settings.storage_dir());

    let cache = CacheService::builder()
        .http_origin()?
        .config(settings.to_config())
        .build()?;
    cache.initialize(Some(storage_dir)).await;

    match args.command {
        Command::Get {
            url,
            credential,
            wait,
        } => {
            let body = cache.request(&url, credential.as_deref()).await?;
            eprintln!("status: {}", body.status_code);
            println!("{}", body.body);
            if wait {
                while cache.pending_refreshes() > 0 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        Command::Keys => {
            let keys = cache.keys().await;
            if keys.is_empty() {
                println!("cache is empty");
            }
            for key in keys {
                println!("{key}");
            }
        }

        Command::Invalidate { url, credential } => {
            cache.invalidate(&url, credential.as_deref()).await;
            println!("invalidated {url}");
        }

        Command::Clear => {
            cache.clear().await;
            println!("cache cleared");
        }

        Command::Prune => {
            let removed = cache.prune().await;
            println!("removed {removed} expired records");
        }
    }

    Ok(())
}
