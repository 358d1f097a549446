//! usb-tree
//!
//! Lists the USB topology, dumps one device's descriptors, or follows
//! hotplug events until interrupted.

mod tree;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{UsbConfig, setup_logging};
use tokio::signal;
use tracing::{error, info};
use usb_host::{Device, Host, HostBuilder, UsbEvent};

#[derive(Parser, Debug)]
#[command(name = "usb-tree")]
#[command(author, version, about = "Show USB buses, hubs and devices")]
#[command(long_about = "
Walks the USB topology through libusb and prints it as a tree of
topological port identifiers (usb-<bus>-<port>.<port>...).

EXAMPLES:
    # Print the device tree
    usb-tree list

    # Same, as JSON
    usb-tree list --json

    # Descriptors of one device, by port id or /dev/bus/usb path
    usb-tree show usb-1-2.3
    usb-tree show /dev/bus/usb/001/007

    # Follow plug and unplug events
    usb-tree watch

CONFIGURATION:
    The configuration file is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/usb-host/usb.toml
    3. /etc/usb-host/usb.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every bus and the devices below its root hub
    List {
        /// Emit JSON instead of a text tree
        #[arg(long)]
        json: bool,
    },
    /// Dump the descriptors of one device
    Show {
        /// Port identifier or backend-native device path
        #[arg(value_name = "PORT_ID")]
        port_id: String,
    },
    /// Print hotplug events until Ctrl+C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = UsbConfig::default_path();
        UsbConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        UsbConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        UsbConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;
    info!("usb-tree v{}", env!("CARGO_PKG_VERSION"));

    let command = args.command.unwrap_or(Command::List { json: false });
    let watch = matches!(command, Command::Watch);
    let host = HostBuilder::from_config(&config)?
        .spawn_watcher(watch)
        .build()
        .context("Failed to start USB host")?;

    let result = match command {
        Command::List { json } => list(&host, json),
        Command::Show { port_id } => show(&host, &port_id),
        Command::Watch => watch_events(&host).await,
    };

    host.shutdown();
    result
}

fn list(host: &Host, json: bool) -> Result<()> {
    let buses = tree::collect(host);
    if json {
        println!("{}", serde_json::to_string_pretty(&buses)?);
    } else if buses.is_empty() {
        println!("No USB buses found.");
    } else {
        print!("{}", tree::render(&buses));
    }
    Ok(())
}

fn show(host: &Host, port_id: &str) -> Result<()> {
    let device = host
        .device(port_id)
        .with_context(|| format!("No device at {}", port_id))?;
    let desc = device.device_descriptor();

    println!("{}", device);
    if let Ok(id) = device.port_identifier() {
        println!("  Port:          {}", id);
    }
    println!("  Bus/Address:   {} / {}", device.bus().name(), device.address());
    println!("  Speed:         {:?}", device.speed());
    println!(
        "  USB version:   {:x}.{:02x}",
        desc.usb_version() >> 8,
        desc.usb_version() & 0xff
    );
    println!(
        "  ID:            {:04x}:{:04x} rev {:04x}",
        desc.vendor_id(),
        desc.product_id(),
        desc.device_version()
    );
    println!(
        "  Class:         {:02x}/{:02x}/{:02x}",
        desc.class(),
        desc.subclass(),
        desc.protocol()
    );
    print_string("Manufacturer", device.manufacturer());
    print_string("Product", device.product());
    print_string("Serial", device.serial_number());
    if device.is_hub() {
        match device.num_ports() {
            Ok(ports) => println!("  Ports:         {}", ports),
            Err(e) => println!("  Ports:         ? ({})", e),
        }
    }

    for index in 0..desc.num_configurations() {
        match device.configuration_at(index) {
            Ok(config) => print_configuration(&device, &config),
            Err(e) => println!("  Configuration {}: {}", index, e),
        }
    }
    Ok(())
}

fn print_string(label: &str, value: usb_host::Result<Option<String>>) {
    match value {
        Ok(Some(s)) => println!("  {:<14} {}", format!("{}:", label), s),
        Ok(None) => {}
        Err(e) => println!("  {:<14} ? ({})", format!("{}:", label), e),
    }
}

fn print_configuration(device: &Device, config: &usb_host::Configuration) {
    println!(
        "  Configuration {} (value {}): {} mA{}{}",
        config.index(),
        config.value(),
        config.max_power_ma(),
        if config.is_self_powered() { ", self powered" } else { "" },
        if config.supports_remote_wakeup() { ", remote wakeup" } else { "" }
    );
    for iface in config.interfaces() {
        let name = device.string(iface.string_index()).ok().flatten();
        println!(
            "    Interface {} alt {}: class {:02x}/{:02x}/{:02x}{}",
            iface.number(),
            iface.alternate_setting(),
            iface.class(),
            iface.subclass(),
            iface.protocol(),
            name.map(|n| format!(" \"{}\"", n)).unwrap_or_default()
        );
        for ep in iface.endpoints() {
            println!(
                "      Endpoint {:#04x} {:<3} {:?}, {} bytes, {} us",
                ep.endpoint(),
                if ep.is_input() { "IN" } else { "OUT" },
                ep.transfer_type(),
                ep.max_packet_size(),
                ep.interval_micros()
            );
        }
    }
}

async fn watch_events(host: &Host) -> Result<()> {
    let events = host.subscribe();
    info!("Watching for USB changes, press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(_) => break,
            },
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Error waiting for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, stopping");
                break;
            }
        }
    }
    Ok(())
}

fn print_event(event: &UsbEvent) {
    match event {
        UsbEvent::DeviceAdded(device) => {
            let desc = device.device_descriptor();
            let port = device
                .port_identifier()
                .map(|p| p.to_string())
                .unwrap_or_else(|_| device.native_id().to_string());
            println!(
                "+ {} {:04x}:{:04x} {}",
                port,
                desc.vendor_id(),
                desc.product_id(),
                device
            );
        }
        UsbEvent::DeviceRemoved(device) => println!("- {}", device.native_id()),
        UsbEvent::BusAdded(bus) => println!("+ bus {} ({})", bus.name(), bus.bus_id()),
        UsbEvent::BusRemoved(bus) => println!("- bus {} ({})", bus.name(), bus.bus_id()),
    }
}
