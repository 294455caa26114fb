//! `radiodb` - records what Internet radio stations play and republishes
//! per-station top-played playlists to Spotify.

mod monitor;
mod pending;
mod playlists;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use radiodb_core::{Config, Database};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "radiodb", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yml", env = "RDB_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the station monitors and the pending worker until killed.
    Monitor,
    /// Recompute and push the top-played playlists, once.
    UpdatePlaylists {
        /// Reconcile a single station instead of all of them.
        #[arg(value_name = "STATION_KEY")]
        station_key: Option<String>,
    },
    /// Run the interactive OAuth flow and print a base64 seed for
    /// `spotify.auth_seed`.
    Authorise,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).context("Failed to load configuration")?;

    match cli.command {
        Command::Monitor => {
            let db = connect(&config).await?;
            monitor::run(db, config).await
        }
        Command::UpdatePlaylists { station_key } => {
            let db = connect(&config).await?;
            playlists::run(&db, &config, station_key.as_deref()).await
        }
        Command::Authorise => {
            let seed = radiodb_spotify::authorise::run(&config.spotify).await?;
            println!("{seed}");
            Ok(())
        }
    }
}

async fn connect(config: &Config) -> Result<Arc<Database>> {
    let path = config.database.connection_path()?;
    let db = Database::connect(&path)
        .await
        .with_context(|| format!("Failed to open database at {path}"))?;
    Ok(Arc::new(db))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rspotify_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
