//! Minimal server for browsing saved sessions.
//!
//! No engine is configured, so creating or loading interactive sessions
//! answers 501; embed [`SessionServer`] with a factory for that.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use conclave::config::default_save_dir;
use conclave::server::http;
use conclave::SessionServer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "conclave-server", about = "Browse saved conclave sessions")]
struct Args {
    /// A directory to search recursively for saves. Repeatable.
    #[arg(long = "save-dir")]
    save_dirs: Vec<PathBuf>,

    /// Do not add $CONCLAVE_HOME/instances to the save directories
    #[arg(long)]
    no_default_save_dir: bool,

    #[arg(long, env = "CONCLAVE_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "CONCLAVE_PORT", default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut save_dirs = Vec::new();
    if !args.no_default_save_dir {
        save_dirs.push(default_save_dir());
    }
    save_dirs.extend(args.save_dirs);
    info!(save_dirs = ?save_dirs, "Loading saves");

    let server = Arc::new(SessionServer::new(save_dirs));
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.reindex_saves().await {
                error!(error = %e, "Indexing saves failed");
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, http::router(Arc::clone(&server)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    server.close().await;
    Ok(())
}
