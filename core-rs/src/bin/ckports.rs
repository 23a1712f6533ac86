//! CKPORTS - ConceptKernel port reservation CLI
//!
//! Inspect the reservable port space and the OS port table, and hold
//! reservations from the shell.

use anyhow::{bail, Context};
use ckp_ports::{BusyPort, PortConfig, PortManager};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::mpsc;
use tracing::Level;

#[derive(Parser)]
#[command(name = "ckports")]
#[command(version)]
#[command(about = "ConceptKernel port reservations", long_about = None)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the ephemeral range and the reservable port space
    Range,
    /// List busy TCP ports from the OS port table
    Netstat {
        /// Only sockets whose local port is this one
        #[arg(long)]
        port: Option<u16>,
        /// Output format (table, json, yaml)
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Check whether a port may be reserved
    Check {
        /// Port number
        #[arg(allow_negative_numbers = true)]
        port: i64,
    },
    /// Reserve free ports and print them
    Reserve {
        /// Number of ports
        #[arg(long, short = 'n', default_value_t = 1)]
        count: i64,
        /// Keep the reservations until Ctrl+C, then release with verification
        #[arg(long)]
        hold: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => PortConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PortConfig::from_env(),
    };
    let manager = PortManager::with_config(config);

    match cli.command {
        Commands::Range => {
            let range = manager.ephemeral_range();
            println!("Ephemeral range:  {} ({} ports)", range, range.len());
            println!("Reservable ports: {}", manager.reservable_capacity());
            println!(
                "Release check:    {}",
                if manager.config().release_check_disabled() {
                    "disabled".yellow()
                } else {
                    "enabled".green()
                }
            );
        }

        Commands::Netstat { port, format } => {
            let records = match port {
                Some(port) => manager.netstat().list_busy_ports_on(port),
                None => manager.netstat().list_busy_ports(),
            }
            .context("Port table query failed")?;

            if !manager.netstat().is_conclusive() {
                eprintln!("Port table queries are not supported on this platform");
            }
            print_busy_ports(&records, &format)?;
        }

        Commands::Check { port } => {
            if manager.is_reservable_port(port) {
                println!("{} Port {} is reservable", "✓".green(), port);
            } else {
                println!("{} Port {} is not reservable", "✗".red(), port);
                std::process::exit(1);
            }
        }

        Commands::Reserve { count, hold } => {
            let handles = manager.reserve_ports(count)?;
            for handle in &handles {
                println!("{}", handle.port());
            }

            if hold {
                let (tx, rx) = mpsc::channel();
                ctrlc::set_handler(move || {
                    let _ = tx.send(());
                })
                .context("Failed to install Ctrl+C handler")?;

                eprintln!("Holding {} port(s), press Ctrl+C to release", handles.len());
                rx.recv().context("Signal channel closed")?;
            }

            let mut failed = 0;
            for handle in handles {
                if let Err(e) = handle.close() {
                    eprintln!("Error releasing port {}: {}", handle.port(), e);
                    failed += 1;
                }
            }
            if failed > 0 {
                bail!("{} port(s) released with errors", failed);
            }
        }
    }

    Ok(())
}

fn print_busy_ports(records: &[BusyPort], format: &str) -> anyhow::Result<()> {
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(records)?);
        }
        "yaml" => {
            println!("{}", serde_yaml::to_string(records)?);
        }
        "table" => {
            if records.is_empty() {
                println!("No busy ports found.");
                return Ok(());
            }

            println!(
                "\n{:<8} {:<16} {:<6} {:<24} {:<8} {:<12}",
                "PID", "COMMAND", "PROTO", "LOCAL", "PORT", "STATE"
            );
            println!("{}", "-".repeat(80));

            for record in records {
                let state = record
                    .state
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let state = if record.is_listening() {
                    state.green().to_string()
                } else {
                    state
                };
                println!(
                    "{:<8} {:<16} {:<6} {:<24} {:<8} {:<12}",
                    record.pid,
                    record.command.as_deref().unwrap_or("-"),
                    record.protocol,
                    record.local_address,
                    record.local_port,
                    state
                );
            }
        }
        other => bail!("Unknown format: {} (expected table, json or yaml)", other),
    }
    Ok(())
}
