//! CLI for table and location operations

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tabletloc::client::ManagerClient;
use tabletloc::common::{parse_duration, LAST_LOCATION_MODE_KEY};
use tabletloc::coordination::fetch_watch_count;
use tabletloc::coordinator::LocationMode;

#[derive(Parser)]
#[command(name = "tabletloc")]
#[command(about = "tabletloc table and location CLI")]
#[command(version)]
struct Cli {
    /// Manager URL
    #[arg(long, default_value = "http://127.0.0.1:9995")]
    manager: String,

    /// Request timeout (e.g. "90s", "2m"); waits run server side
    #[arg(long, default_value = "120s")]
    timeout: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tables
    Tables,

    /// Create a table
    Create {
        table: String,

        /// Split point (repeatable)
        #[arg(long = "split")]
        splits: Vec<String>,
    },

    /// Take a table offline and delete it
    Delete { table: String },

    /// Show every tablet of a table
    Locations { table: String },

    /// Show current/future/last of the tablet covering exactly a row range
    Location {
        table: String,

        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,
    },

    /// Write one row
    Write {
        table: String,
        row: String,
        value: String,
    },

    /// Persist buffered writes for a row range
    Flush {
        table: String,

        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,

        /// Block until every tablet in range persisted
        #[arg(long)]
        wait: bool,
    },

    /// Bring a table online
    Online {
        table: String,

        #[arg(long)]
        wait: bool,
    },

    /// Take a table offline
    Offline {
        table: String,

        #[arg(long)]
        wait: bool,
    },

    /// Watch footprint per process role
    Watches {
        /// List every watched path
        #[arg(long)]
        verbose: bool,
    },

    /// Ask the coordination monitor for its watch total (`wchs`)
    Wchs {
        #[arg(long, default_value = "127.0.0.1:2181")]
        addr: SocketAddr,
    },

    /// Change the last location persistence mode
    SetMode { mode: LocationMode },

    /// Show a system property, or change it when a value is given
    Property { key: String, value: Option<String> },
}

fn format_millis(millis: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis as i64)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = ManagerClient::new(&cli.manager, parse_duration(&cli.timeout)?)?;

    match cli.command {
        Commands::Tables => {
            for table in client.tables().await? {
                println!(
                    "{}\t{:?}\tflush_id={}\tcreated={}",
                    table.table,
                    table.goal,
                    table.flush_id,
                    format_millis(table.created_at)
                );
            }
        }

        Commands::Create { table, splits } => {
            let tablets = client.create_table(&table, &splits).await?;
            println!("Created {} with {} tablet(s)", table, tablets);
        }

        Commands::Delete { table } => {
            client.delete_table(&table).await?;
            println!("Deleted {}", table);
        }

        Commands::Locations { table } => {
            println!("Tablets of {}:", table);
            for tablet in client.locations(&table).await? {
                println!(
                    "  {:<24} {:<10} current={} future={} last={} flush_id={}",
                    tablet.extent,
                    tablet.state,
                    or_dash(tablet.current),
                    or_dash(tablet.future),
                    or_dash(tablet.last),
                    tablet.flush_id
                );
            }
        }

        Commands::Location { table, start, end } => {
            let snapshot = client
                .location(&table, start.as_deref(), end.as_deref())
                .await?;
            println!("current: {}", or_dash(snapshot.current));
            println!("future:  {}", or_dash(snapshot.future));
            println!("last:    {}", or_dash(snapshot.last));
        }

        Commands::Write { table, row, value } => {
            let server = client.write(&table, &row, &value).await?;
            println!("Written to {}", server);
        }

        Commands::Flush {
            table,
            start,
            end,
            wait,
        } => {
            let outcome = client
                .flush(&table, start.as_deref(), end.as_deref(), wait)
                .await?;
            println!("Flush report:");
            println!("  Flush id: {}", outcome.flush_id);
            println!("  Tablets: {}", outcome.tablets);
            println!("  Waited: {}", outcome.waited);
        }

        Commands::Online { table, wait } => {
            client.set_online(&table, wait).await?;
            println!("{} online{}", table, if wait { "" } else { " (requested)" });
        }

        Commands::Offline { table, wait } => {
            client.set_offline(&table, wait).await?;
            println!("{} offline{}", table, if wait { "" } else { " (requested)" });
        }

        Commands::Watches { verbose } => {
            let summary = client.watches().await?;
            println!("Watch report:");
            println!("  Total watches: {}", summary.total);
            println!("  Tables: {}", summary.tables);
            println!(
                "  Envelope: {}..={} ({})",
                summary.envelope_min,
                summary.envelope_max,
                if summary.within_budget { "ok" } else { "VIOLATED" }
            );
            for process in summary.processes {
                println!(
                    "  {} (session {}): {} watches{}",
                    process.role,
                    process.session,
                    process.watches.len(),
                    if process.degraded { " [degraded]" } else { "" }
                );
                if verbose {
                    for watch in process.watches {
                        println!("    {} x{}", watch.path, watch.references);
                    }
                }
            }
        }

        Commands::Wchs { addr } => {
            let total = fetch_watch_count(addr).await?;
            println!("Total watches: {}", total);
        }

        Commands::SetMode { mode } => {
            client
                .set_property(LAST_LOCATION_MODE_KEY, &mode.to_string())
                .await?;
            println!("{} = {}", LAST_LOCATION_MODE_KEY, mode);
        }

        Commands::Property { key, value } => {
            if let Some(value) = value {
                client.set_property(&key, &value).await?;
            }
            println!("{} = {}", key, client.property(&key).await?);
        }
    }

    Ok(())
}
