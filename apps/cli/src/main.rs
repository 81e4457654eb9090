use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use vendorlink_core::netif::SYSFS_NET;
use vendorlink_core::{
    AccessoryBackend, ChannelSink, DeviceBackend, DeviceRef, EventRecord, LinkConfig,
    NusbBackend, PlatformEvent, TransferRequest, VendorLink, watch_network_interfaces,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Vendor USB / accessory link tool", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "vendorlink.toml")]
    config: PathBuf,

    /// Where devices come from
    #[arg(long, value_enum, default_value_t = Backend::Usb)]
    backend: Backend,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    /// Host-mode USB
    Usb,
    /// Accessories listed in the configuration
    Accessory,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List visible devices
    Scan,
    /// Connect and print events until Ctrl+C
    Monitor {
        /// Device id, `vvvv:pppp` or device key
        device: DeviceRef,
    },
    /// Send one framed protocol message
    Send {
        device: DeviceRef,
        #[arg(long, value_parser = parse_byte)]
        message_id: u8,
        /// Payload text, or hex with --hex
        #[arg(long, default_value = "")]
        payload: String,
        #[arg(long)]
        hex: bool,
        /// Keep listening this long for a reply
        #[arg(long, default_value_t = 0)]
        wait_ms: u64,
    },
    /// Raw bulk or interrupt transfer
    Raw {
        device: DeviceRef,
        /// Bytes to write, or the read size for an IN endpoint
        #[arg(long, default_value = "")]
        data: HexBytes,
        #[arg(long, value_parser = parse_byte)]
        endpoint: Option<u8>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Use an interrupt endpoint instead of bulk
        #[arg(long)]
        interrupt: bool,
    },
    /// Configuration file helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        #[arg(long)]
        force: bool,
    },
}

/// Hex bytes as `ff 02 0a`, `ff020a` or `0xff 0x02`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct HexBytes(Vec<u8>);

impl FromStr for HexBytes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .split_whitespace()
            .map(|t| t.trim_start_matches("0x").trim_start_matches("0X"))
            .collect();
        if !digits.is_ascii() || digits.len() % 2 != 0 {
            return Err(format!("'{}' is not a sequence of hex bytes", s));
        }
        (0..digits.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&digits[i..i + 2], 16)
                    .map_err(|e| format!("invalid hex byte '{}': {}", &digits[i..i + 2], e))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(HexBytes)
    }
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid byte '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    if let Command::Config {
        action: ConfigAction::Init { force },
    } = &args.command
    {
        return init_config(&args.config, *force);
    }

    let config = load_config(&args.config)?;
    info!("Starting vendorlink ({:?} backend)...", args.backend);

    let (platform_tx, platform_rx) = async_channel::unbounded();
    let network = config.network_poll_interval().map(|interval| {
        tokio::spawn(watch_network_interfaces(
            SYSFS_NET.into(),
            interval,
            platform_tx.clone(),
        ))
    });

    let result = match args.backend {
        Backend::Usb => {
            let mut backend = NusbBackend::new(platform_tx);
            if let Some(filter) = config.device_filter {
                backend = backend.with_filter(filter.vendor_id, filter.product_id);
            }
            let backend = Arc::new(backend);

            let watcher = backend.clone();
            let hotplug = tokio::spawn(async move {
                if let Err(e) = watcher.watch_hotplug().await {
                    warn!(error = %e, "Hotplug watch unavailable");
                }
            });
            let result = run(backend, config, platform_rx, args.command).await;
            hotplug.abort();
            result
        }
        Backend::Accessory => {
            let backend = Arc::new(AccessoryBackend::new(
                config.accessories.clone(),
                config.accessory_protocol.clone(),
                platform_tx,
            ));
            run(backend, config, platform_rx, args.command).await
        }
    };
    if let Some(network) = network {
        network.abort();
    }
    result
}

fn load_config(path: &Path) -> Result<LinkConfig> {
    if !path.exists() {
        info!(path = %path.display(), "No configuration file, using defaults");
        return Ok(LinkConfig::default());
    }
    LinkConfig::load_from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    LinkConfig::default().save_to_file(path)?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Blocking task failed")
}

async fn run<B: DeviceBackend>(
    backend: Arc<B>,
    config: LinkConfig,
    platform: async_channel::Receiver<PlatformEvent>,
    command: Command,
) -> Result<()> {
    let (sink, events) = ChannelSink::unbounded();
    let link = Arc::new(VendorLink::new(backend, config, Arc::new(sink)));
    link.initialize()?;

    let printer = tokio::spawn(print_events(events.clone()));
    let pump = link.clone();
    std::thread::Builder::new()
        .name("platform-events".into())
        .spawn(move || pump.pump_platform_events(&platform))
        .context("Failed to start platform event thread")?;
    link.mark_ready();

    let result = match command {
        Command::Scan => {
            let scanner = link.clone();
            let devices = blocking(move || scanner.scan_devices()).await??;
            for device in &devices {
                println!("{}", serde_json::to_string(device)?);
            }
            Ok(())
        }
        Command::Monitor { device } => monitor(&link, device).await,
        Command::Send {
            device,
            message_id,
            payload,
            hex,
            wait_ms,
        } => {
            let payload = if hex {
                payload.parse::<HexBytes>().map_err(anyhow::Error::msg)?.0
            } else {
                payload.into_bytes()
            };
            send(&link, device, message_id, payload, Duration::from_millis(wait_ms)).await
        }
        Command::Raw {
            device,
            data,
            endpoint,
            timeout_ms,
            interrupt,
        } => {
            let request = TransferRequest {
                endpoint,
                data: Some(data.0),
                timeout_ms,
            };
            raw(&link, device, request, interrupt).await
        }
        Command::Config { .. } => Ok(()),
    };

    let closer = link.clone();
    blocking(move || closer.shutdown()).await?;
    printer.abort();
    while let Ok(record) = events.try_recv() {
        print_record(&record);
    }
    info!("Shutdown complete");
    result
}

async fn print_events(events: async_channel::Receiver<EventRecord>) {
    while let Ok(record) = events.recv().await {
        print_record(&record);
    }
}

fn print_record(record: &EventRecord) {
    match record.to_json() {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Could not serialize event"),
    }
}

async fn connect<B: DeviceBackend>(link: &Arc<VendorLink<B>>, device: DeviceRef) -> Result<()> {
    let connector = link.clone();
    let ticket = blocking(move || connector.connect_to_device(&device)).await??;
    let connected = ticket.wait().await?;
    info!(device = %connected.display_name(), "Connected");
    Ok(())
}

async fn monitor<B: DeviceBackend>(link: &Arc<VendorLink<B>>, device: DeviceRef) -> Result<()> {
    tokio::select! {
        res = connect(link, device) => res?,
        _ = signal::ctrl_c() => {
            info!("Interrupted before the connection was up");
            return Ok(());
        }
    }

    info!("Monitoring. Press Ctrl+C to disconnect.");
    signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;
    info!("Received Ctrl+C, disconnecting...");
    Ok(())
}

async fn send<B: DeviceBackend>(
    link: &Arc<VendorLink<B>>,
    device: DeviceRef,
    message_id: u8,
    payload: Vec<u8>,
    wait: Duration,
) -> Result<()> {
    connect(link, device).await?;
    let sender = link.clone();
    blocking(move || sender.send_protocol_data(message_id, &payload)).await??;
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }
    Ok(())
}

async fn raw<B: DeviceBackend>(
    link: &Arc<VendorLink<B>>,
    device: DeviceRef,
    request: TransferRequest,
    interrupt: bool,
) -> Result<()> {
    connect(link, device).await?;
    let transfer = link.clone();
    blocking(move || {
        if interrupt {
            transfer.interrupt_transfer(request)
        } else {
            transfer.bulk_transfer(request)
        }
    })
    .await??;
    Ok(())
}
