//! Manager binary

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tabletloc::coordinator::LocationMode;
use tabletloc::{Config, Manager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tabletloc-manager")]
#[command(about = "tabletloc manager: tablet locations, assignment and watches")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a single-node instance
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Bind address for the coordination monitor (four-letter words)
        #[arg(long)]
        monitor: Option<SocketAddr>,

        /// Metadata directory (in-memory when omitted)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Last location persistence mode (assignment | compaction)
        #[arg(long)]
        mode: Option<LocationMode>,

        /// Number of tablet servers
        #[arg(long)]
        tservers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            monitor,
            db,
            mode,
            tservers,
        } => {
            // File and environment first, CLI arguments win
            let mut config = Config::load()?;
            if let Some(bind) = bind {
                config.manager.bind_addr = bind;
            }
            if let Some(monitor) = monitor {
                config.manager.monitor_addr = monitor;
            }
            if db.is_some() {
                config.manager.db_path = db;
            }
            if let Some(mode) = mode {
                config.last_location_mode = mode;
            }
            if let Some(tservers) = tservers {
                config.manager.tablet_servers = tservers;
            }
            config.validate()?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            Manager::new(config).serve().await?;
        }
    }

    Ok(())
}
