//! # Ticketline CLI
//!
//! Command-line front end for BLE receipt printers.
//!
//! ## Usage
//!
//! ```bash
//! # List printers advertising the configured services
//! ticketline scan --seconds 10
//!
//! # Print text on one printer
//! ticketline print --device 3f2a...-... --text "Hello"
//!
//! # Print a picture on every auto-connect printer
//! ticketline print --image logo.png
//!
//! # Manage the auto-connect list
//! ticketline auto-connect set 3f2a...-... 9c01...-...
//! ticketline auto-connect list
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use ticketline::{
    AutoConnectStore, DeviceChange, DeviceId, ErrorReport, JsonFileStore, ManagerConfig,
    ManagerEvent, PrintTarget, PrinterManager, TicketlineError,
    autoconnect::AutoConnectList,
    encoder::{BitmapImage, PayloadEncoder, TextBlock, Ticket, image::default_max_width},
    transport::ble::BleTransport,
};

/// Auto-connect list location when the config does not name one
const DEFAULT_AUTO_CONNECT_FILE: &str = "ticketline-auto-connect.json";

/// Time left for queued writes to drain before exiting
const FLUSH_DELAY: Duration = Duration::from_secs(2);

/// Ticketline - BLE receipt printer utility
#[derive(Parser, Debug)]
#[command(name = "ticketline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "ticketline.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List nearby printers
    Scan {
        /// How long to scan
        #[arg(long, default_value = "10")]
        seconds: u64,
    },

    /// Print text or an image
    Print {
        /// Target printer; the auto-connect list when omitted
        #[arg(long)]
        device: Option<DeviceId>,

        /// Text to print, one chunk per line
        #[arg(long, conflicts_with = "image")]
        text: Option<String>,

        /// Image file to print
        #[arg(long, value_name = "FILE")]
        image: Option<PathBuf>,

        /// Give up if no printer is ready after this many seconds
        #[arg(long, default_value = "30")]
        wait: u64,
    },

    /// Manage the printers connected automatically on sight
    #[command(subcommand)]
    AutoConnect(AutoConnectCommand),
}

#[derive(Subcommand, Debug)]
enum AutoConnectCommand {
    /// Replace the list
    Set { ids: Vec<DeviceId> },
    /// Show the list
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ticketline={}", log_level))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), TicketlineError> {
    let config = ManagerConfig::load(&cli.config)?;
    let store = auto_connect_store(&config);

    match cli.command {
        Commands::AutoConnect(AutoConnectCommand::Set { ids }) => {
            let list = AutoConnectList::load(store)?;
            list.set(ids)?;
            println!("Auto-connect list saved ({} devices)", list.ids().len());
            Ok(())
        }
        Commands::AutoConnect(AutoConnectCommand::List) => {
            for id in store.load()? {
                println!("{}", id);
            }
            Ok(())
        }
        Commands::Scan { seconds } => scan(config, store, Duration::from_secs(seconds)).await,
        Commands::Print {
            device,
            text,
            image,
            wait,
        } => {
            let payload: Box<dyn PayloadEncoder + Send + Sync> = match (text, image) {
                (Some(text), _) => Box::new(Ticket::new().block(TextBlock::new(text)).feed(3)),
                (None, Some(path)) => Box::new(
                    Ticket::new()
                        .block(BitmapImage::open(&path, default_max_width())?)
                        .feed(3),
                ),
                (None, None) => {
                    return Err(TicketlineError::Config(
                        "nothing to print, pass --text or --image".to_string(),
                    ));
                }
            };
            print(config, store, device, payload.as_ref(), Duration::from_secs(wait)).await
        }
    }
}

fn auto_connect_store(config: &ManagerConfig) -> Box<dyn AutoConnectStore> {
    let path = config
        .auto_connect_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_AUTO_CONNECT_FILE));
    Box::new(JsonFileStore::new(path))
}

async fn scan(
    config: ManagerConfig,
    store: Box<dyn AutoConnectStore>,
    duration: Duration,
) -> Result<(), TicketlineError> {
    let (transport, transport_events) = BleTransport::open().await?;
    let (manager, mut events) =
        PrinterManager::new(config, Arc::new(transport), transport_events, store)?;

    info!(seconds = duration.as_secs(), "scanning");
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(ManagerEvent::Change(DeviceChange::Added(record))) => {
                    println!(
                        "{}  {:<24} rssi {}",
                        record.id(),
                        record.name().unwrap_or("(unnamed)"),
                        record.rssi().map_or("?".to_string(), |r| r.to_string()),
                    );
                }
                Some(ManagerEvent::Error(ErrorReport::DeviceNotReady)) => {
                    return Err(TicketlineError::DeviceNotReady);
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    manager.stop_scan()?;
    println!("{} printers found", manager.nearby_devices().len());
    Ok(())
}

async fn print(
    config: ManagerConfig,
    store: Box<dyn AutoConnectStore>,
    device: Option<DeviceId>,
    payload: &(dyn PayloadEncoder + Send + Sync),
    wait: Duration,
) -> Result<(), TicketlineError> {
    let (transport, transport_events) = BleTransport::open().await?;
    let (manager, mut events) =
        PrinterManager::new(config, Arc::new(transport), transport_events, store)?;

    let target = match device {
        Some(id) => PrintTarget::Device(id),
        None if manager.auto_connect_targets().is_empty() => {
            return Err(TicketlineError::Config(
                "no --device given and the auto-connect list is empty".to_string(),
            ));
        }
        None => PrintTarget::AutoConnect,
    };

    let ready = tokio::time::timeout(wait, async {
        while let Some(event) = events.recv().await {
            match event {
                ManagerEvent::Change(DeviceChange::Added(record)) if Some(record.id()) == device => {
                    if let Err(e) = manager.connect(record.id()) {
                        tracing::warn!(id = %record.id(), error = %e, "connect failed");
                    }
                }
                ManagerEvent::Change(DeviceChange::Updated(record)) if record.is_writable() => {
                    let ready = match device {
                        Some(id) => record.id() == id,
                        None => manager.can_print(),
                    };
                    if ready {
                        return true;
                    }
                }
                ManagerEvent::Error(report) => tracing::warn!(?report, "printer error"),
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if !ready {
        return Err(TicketlineError::Transport(format!(
            "no printer ready after {}s",
            wait.as_secs()
        )));
    }

    let summary = manager.print(payload, target);
    info!(devices = summary.devices, writes = summary.writes, "payload sent");
    tokio::time::sleep(FLUSH_DELAY).await;
    println!("Printed on {} printer(s)", summary.devices);
    Ok(())
}
