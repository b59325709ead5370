use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use aura_server::{serve, AppState};
use aura_store::Store;

#[derive(Parser, Debug)]
#[command(name = "aura-engine")]
#[command(about = "Headless Aura assistant backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API service.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
        /// Data directory (database, artifacts). Overrides AURA_DATA_DIR.
        #[arg(long, env = "AURA_DATA_DIR")]
        data_dir: Option<String>,
    },
    /// Open the database and apply pending schema migrations, then exit.
    Migrate {
        #[arg(long, env = "AURA_DATA_DIR")]
        data_dir: Option<String>,
    },
}

fn resolve_data_dir(data_dir: Option<String>) -> PathBuf {
    data_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".aura"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            data_dir,
        } => {
            let data_dir = resolve_data_dir(data_dir);
            let store = Arc::new(Store::open(&data_dir).context("открытие базы данных")?);
            let state = AppState::from_env(store);
            state.scheduler.start();

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("неверный адрес сервера")?;
            info!(%addr, data_dir = %data_dir.display(), "aura engine starting");
            serve(addr, state).await
        }
        Command::Migrate { data_dir } => {
            let data_dir = resolve_data_dir(data_dir);
            let _store = Store::open(&data_dir).context("открытие базы данных")?;
            info!(data_dir = %data_dir.display(), "migrations applied");
            Ok(())
        }
    }
}
