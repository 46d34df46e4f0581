mod config;
mod connection;
mod control;
mod remote;
mod server;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "testhub coordination daemon")]
struct Args {
    /// Path of the runner socket.
    #[arg(long = "socket")]
    socket_path: Option<PathBuf>,

    /// Path of the operator control socket.
    #[arg(long = "control-socket")]
    control_socket_path: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long = "config")]
    config_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "testhub=info,libtesthub=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = config::load_runtime_config(&args)?;
    server::run(cfg).await
}
