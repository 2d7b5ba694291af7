//! rust-usbip server
//!
//! Exports one locally attached USB device to a remote host over TCP using
//! the USB/IP v1.11 protocol. The remote side attaches it with the stock
//! Linux tooling:
//!
//! ```text
//! usbip attach -r <server> -b 1-1
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::{create_usb_bridge, setup_logging};
use server::config;
use server::engine::{self, router::run_completion_router, Engine};
use server::network::TcpServer;
use server::usb;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "rust-usbip-server")]
#[command(
    author,
    version,
    about = "USB/IP server - export a local USB device over TCP"
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// List candidate USB devices and exit
    #[arg(long)]
    list_device: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = config::ServerConfig::default();
        let path = config::ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        config::ServerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("rust-usbip server v{}", env!("CARGO_PKG_VERSION"));

    if args.list_device {
        return list_device_mode();
    }

    let filter = config.usb.parsed_filter()?;

    // Attach before serving: the device record is immutable once exported.
    let attached = usb::attach_device(filter).context("Failed to attach a USB device")?;

    let (bridge, worker) = create_usb_bridge();
    let host = Arc::new(usb::BridgeHost::new(bridge.clone()));
    let engine = Arc::new(Engine::new(host, config.usb.max_inflight_urbs));
    engine.registry().publish(attached.record);

    let worker_handle = usb::spawn_host_worker(attached.handle, worker);
    let router_handle = tokio::spawn(run_completion_router(engine.clone(), bridge.clone()));

    let server = TcpServer::bind(engine.clone(), &config.server.bind_addr).await?;

    info!("Press Ctrl+C to shutdown");
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("server error: {:#}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    if let Err(e) = engine::shutdown_host(&bridge).await {
        error!("Error shutting down USB worker: {}", e);
    }
    router_handle.abort();
    if worker_handle.join().is_err() {
        error!("USB worker thread panicked");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// List candidate devices and exit
fn list_device_mode() -> Result<()> {
    let devices = usb::list_devices().context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:04x}:{:04x}  Bus {:03} Device {:03}  Speed: {:?}",
            device.vendor_id, device.product_id, device.bus_number, device.address, device.speed
        );
    }
    Ok(())
}
