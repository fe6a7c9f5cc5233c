//! wgbridge CLI - Userspace WireGuard Tunnel Adapter
//!
//! Brings a WireGuard tunnel up from a standard `.conf` file: creates the TUN
//! device, starts the adapter against the linked protocol engine, installs
//! routes, and tears everything down on Ctrl+C/SIGTERM. `--block` installs
//! the routing settings without starting an engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ipnet::IpNet;
use tracing_subscriber::{fmt, EnvFilter};

use wgbridge::adapter::Adapter;
use wgbridge::config::TunnelConfig;
use wgbridge::engine::EngineApi;
use wgbridge::error::{ConfigError, WgBridgeError};
use wgbridge::platform::routes::SystemSettingsHost;
use wgbridge::platform::tun::TunInterface;
use wgbridge::platform::udp::UdpTransport;
use wgbridge::settings::DeviceProfile;

/// Fallback TUN MTU when the config does not set one
const DEFAULT_MTU: u16 = 1420;

/// How often the running tunnel logs its byte counters
const STATS_LOG_PERIOD: Duration = Duration::from_secs(30);

/// wgbridge - Userspace WireGuard tunnel adapter
#[derive(Parser, Debug)]
#[command(name = "wgbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to WireGuard configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Install blocking routing settings without starting a tunnel
    #[arg(long)]
    block: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn engine_api() -> Result<EngineApi, WgBridgeError> {
    #[cfg(feature = "system-engine")]
    {
        Ok(wgbridge::engine::ffi::system_engine())
    }
    #[cfg(not(feature = "system-engine"))]
    {
        Err(WgBridgeError::System(std::io::Error::other(
            "this build carries no protocol engine; rebuild with the system-engine feature",
        )))
    }
}

async fn run(args: Args) -> Result<(), WgBridgeError> {
    tracing::info!("Loading configuration from: {}", args.config.display());
    let config = TunnelConfig::from_file(&args.config)?;

    // The TUN device is configured from the first v4 interface address
    let v4_address = config
        .interface
        .addresses
        .iter()
        .find_map(|addr| match addr {
            IpNet::V4(net) => Some(*net),
            IpNet::V6(_) => None,
        })
        .ok_or(ConfigError::MissingField {
            field: "Address (v4)".to_string(),
        })?;

    let mtu = config.interface.mtu.filter(|mtu| *mtu != 0).unwrap_or(DEFAULT_MTU);
    let tun = Arc::new(TunInterface::create(v4_address.addr(), v4_address.prefix_len(), mtu).await?);

    let device_name = match wgbridge::platform::VirtualInterface::name(tun.as_ref()) {
        Some(name) => name,
        None => "wgbridge0".to_string(),
    };
    let settings_host = Arc::new(SystemSettingsHost::new(device_name));

    let tun_iface: Arc<dyn wgbridge::platform::VirtualInterface> = tun.clone();
    let host: Arc<dyn wgbridge::platform::SettingsHost> = settings_host.clone();
    let adapter = Adapter::new(
        engine_api()?,
        tun_iface,
        Arc::new(UdpTransport),
        host,
        DeviceProfile::native(),
    );

    if args.block {
        tracing::info!("Installing blocking settings...");
        adapter.block(config).await?;
    } else {
        tracing::info!("Starting tunnel...");
        adapter.start(config).await?;
        if let Some(name) = adapter.interface_name() {
            tracing::info!("Tunnel up on {}", name);
        }
    }

    run_until_shutdown(&adapter).await;

    adapter.stop().await;
    settings_host.cleanup().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, logging counters along the way
async fn run_until_shutdown(adapter: &Adapter) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();

    let mut stats_timer = tokio::time::interval(STATS_LOG_PERIOD);
    stats_timer.tick().await; // immediate first tick

    loop {
        #[cfg(unix)]
        let terminated = async {
            match terminate.as_mut() {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending().await,
            }
        };
        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("\nReceived Ctrl+C, shutting down...");
                return;
            }
            _ = terminated => {
                tracing::info!("\nReceived SIGTERM, shutting down...");
                return;
            }
            _ = stats_timer.tick() => {
                let (rx, tx) = adapter.stats();
                tracing::info!("Traffic: {} bytes received, {} bytes sent", rx, tx);
            }
        }
    }
}
