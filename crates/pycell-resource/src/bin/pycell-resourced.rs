//! Resource service daemon, run inside the sandbox container

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use pycell_resource::server::{app, ServerState};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pycell-resourced", about = "pycell in-container resource service")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long, default_value_t = pycell_spec::RESOURCE_PORT)]
    port: u16,

    /// Server root directory; all request paths resolve under it
    #[arg(long, default_value = pycell_spec::WORK_DIR)]
    root: PathBuf,

    /// Python interpreter used for module source lookup
    #[arg(long, default_value = "python3")]
    python: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    tokio::fs::create_dir_all(&args.root)
        .await
        .with_context(|| format!("failed to create server root {}", args.root.display()))?;

    let state = ServerState::new(args.root, args.python);
    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;

    tracing::info!(addr = %listener.local_addr()?, "resource service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}
