//! graphsync-server - serve a triple store over WebSocket
//!
//! Usage:
//!   graphsync-server [--bind 127.0.0.1:8765] [--data-dir ./data]
//!                    [--files-dir DIR] [--no-unique-file-ids]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use graphsync::{FileStoreFactory, FilesConfig, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "graphsync-server", version, about = "Remote session server for a triple store")]
struct Opts {
    /// Address to listen on
    #[arg(long, env = "GRAPHSYNC_BIND", default_value = "127.0.0.1:8765")]
    bind: SocketAddr,

    /// Directory for graph snapshots
    #[arg(long, env = "GRAPHSYNC_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Directory for files persisted by FILES_UPDATE (default: <data-dir>/files)
    #[arg(long, env = "GRAPHSYNC_FILES_DIR")]
    files_dir: Option<PathBuf>,

    /// Store files under their base name instead of prefixing the owner id
    #[arg(long, env = "GRAPHSYNC_NO_UNIQUE_FILE_IDS")]
    no_unique_file_ids: bool,
}

impl Opts {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::with_data_dir(&self.data_dir);
        config.bind_addr = self.bind;
        config.files = FilesConfig::new(
            self.files_dir.unwrap_or_else(|| self.data_dir.join("files")),
            !self.no_unique_file_ids,
        );
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "graphsync=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Opts::parse().into_config();
    info!(version = env!("CARGO_PKG_VERSION"), data_dir = %config.data_dir.display(), "Starting graphsync-server");

    let factory = FileStoreFactory::new(&config.data_dir)
        .with_context(|| format!("cannot open data directory {}", config.data_dir.display()))?;
    let server = Server::bind(config, Arc::new(factory))
        .await
        .context("cannot start listener")?;

    tokio::select! {
        result = server.run() => result.context("server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
