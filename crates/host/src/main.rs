//! usbctl
//!
//! Command-line front end for the host control plane: list the device tree,
//! read string descriptors, and run raw control transfers through a device's
//! submission queue.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{EventSubscriber, UsbEvent, create_event_bus, setup_logging};
use host::HostConfig;
use host::testing::{MockDevice, MockTransport};
use host::usb::{HostServices, Request, RusbTransport, Transport, UsbDevice};
use protocol::{DeviceId, DeviceRef, DeviceSpeed, RequestDirection, RequestType};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbctl")]
#[command(author, version, about = "Host-side USB control plane")]
#[command(long_about = "
Inspect USB devices and drive their control pipe from the command line.

EXAMPLES:
    # Show the device tree
    usbctl list

    # Read manufacturer, product and serial strings of device 3
    usbctl strings 3

    # GET_DESCRIPTOR(Device) on device 3
    usbctl control 3 --request-type 0x80 --request 0x06 --value 0x0100 --length 18

    # Vendor OUT request with a data stage
    usbctl control 3 --request-type 0x40 --request 0x01 --data 01ff

CONFIGURATION:
    usbctl looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbctl/host.toml
    3. /etc/usbctl/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Use a simulated bus instead of libusb
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Scan the bus and print the device tree
    List,

    /// Print the manufacturer, product and serial number strings
    Strings {
        /// Device ID as printed by `list`
        id: u32,
    },

    /// Run a raw control transfer
    Control {
        /// Device ID as printed by `list`
        id: u32,

        /// bmRequestType
        #[arg(long, value_parser = parse_u8)]
        request_type: u8,

        /// bRequest
        #[arg(long, value_parser = parse_u8)]
        request: u8,

        /// wValue
        #[arg(long, default_value = "0", value_parser = parse_u16)]
        value: u16,

        /// wIndex
        #[arg(long, default_value = "0", value_parser = parse_u16)]
        index: u16,

        /// wLength for IN transfers
        #[arg(long, default_value = "0", value_parser = parse_u16)]
        length: u16,

        /// Data stage for OUT transfers, as hex
        #[arg(long, value_parser = parse_hex_bytes)]
        data: Option<Vec<u8>>,

        /// Claim this interface around the transfer
        #[arg(long, value_parser = parse_u8)]
        interface: Option<u8>,

        /// Detach a kernel driver bound to --interface
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Error)]
enum ArgError {
    #[error("invalid number '{0}'")]
    Number(String),

    #[error("'{0}' does not fit in {1} bits")]
    Range(String, u32),

    #[error("invalid hex data '{0}'")]
    Hex(String),
}

fn parse_number(s: &str, bits: u32) -> Result<u64, ArgError> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|_| ArgError::Number(s.to_string()))?;
    if value >> bits != 0 {
        return Err(ArgError::Range(s.to_string(), bits));
    }
    Ok(value)
}

fn parse_u8(s: &str) -> Result<u8, ArgError> {
    parse_number(s, 8).map(|v| v as u8)
}

fn parse_u16(s: &str) -> Result<u16, ArgError> {
    parse_number(s, 16).map(|v| v as u16)
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, ArgError> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if digits.len() % 2 != 0 {
        return Err(ArgError::Hex(s.to_string()));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| ArgError::Hex(s.to_string())))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;
    debug!("usbctl v{}, log level {}", env!("CARGO_PKG_VERSION"), log_level);

    let transport: Arc<dyn Transport> = if args.mock {
        Arc::new(demo_bus())
    } else {
        Arc::new(RusbTransport::new().context("Failed to initialize libusb")?)
    };

    let (bus, subscriber) = create_event_bus(common::DEFAULT_EVENT_CAPACITY);
    let event_task = tokio::spawn(log_events(subscriber));

    let services = Arc::new(HostServices::new(
        transport,
        bus,
        config.session_settings(),
    ));
    let command = args.command.unwrap_or(Command::List);

    let worker_services = services.clone();
    let result = tokio::task::spawn_blocking(move || run(&worker_services, &config, command))
        .await
        .context("Command task failed")?;

    let shutdown_services = services.clone();
    tokio::task::spawn_blocking(move || shutdown_services.shutdown())
        .await
        .context("Shutdown task failed")?;
    if let Err(e) = event_task.await {
        warn!("Event logger task failed: {}", e);
    }

    result
}

/// Drain the event bus into the log until it is closed
async fn log_events(subscriber: EventSubscriber) {
    while let Ok(event) = subscriber.recv_event().await {
        match event {
            UsbEvent::Device(event) => info!("{:?}", event),
            UsbEvent::Data(event) => debug!(
                "{} request {} completed with {} bytes",
                event.device_id,
                event.request_id.0,
                event.data.len()
            ),
            UsbEvent::Error(event) => warn!(
                "{} request {:?} failed: {}",
                event.device_id,
                event.request_id.map(|id| id.0),
                event.error
            ),
        }
    }
}

fn run(services: &HostServices, config: &HostConfig, command: Command) -> Result<()> {
    services.scan().context("Failed to scan the bus")?;

    match command {
        Command::List => {
            for root in services.roots() {
                print_tree(services, root, 0);
            }
            Ok(())
        }
        Command::Strings { id } => {
            let device = lookup(services, id)?;
            device.open().context("Failed to open device")?;
            for (label, value) in [
                ("Manufacturer:", device.manufacturer()),
                ("Product:", device.product()),
                ("Serial:", device.serial_number()),
            ] {
                match value {
                    Ok(Some(s)) => println!("{:<13} {}", label, s),
                    Ok(None) => println!("{:<13} -", label),
                    Err(e) => println!("{:<13} <error: {}>", label, e),
                }
            }
            device.close();
            Ok(())
        }
        Command::Control {
            id,
            request_type,
            request,
            value,
            index,
            length,
            data,
            interface,
            force,
        } => {
            let device = lookup(services, id)?;
            let request_type = RequestType::from_byte(request_type)
                .map_err(|e| anyhow!("Invalid bmRequestType {:#04x}: {}", request_type, e))?;

            let transfer = Request::new(request_type, request, value, index);
            match request_type.direction {
                RequestDirection::DeviceToHost => transfer.set_data(vec![0; length as usize])?,
                RequestDirection::HostToDevice => transfer.set_data(data.unwrap_or_default())?,
            }
            transfer.set_accept_short_packet(config.transfer.accept_short_packet)?;

            device.open().context("Failed to open device")?;
            if let Some(interface) = interface {
                device
                    .claim_interface(interface, force || config.session.detach_kernel_driver)
                    .with_context(|| format!("Failed to claim interface {}", interface))?;
            }

            let result = device.submit(&transfer);

            if let Some(interface) = interface
                && let Err(e) = device.release_interface(interface)
            {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            device.close();

            let actual = result.context("Control transfer failed")?;
            match request_type.direction {
                RequestDirection::DeviceToHost => {
                    let bytes = transfer.actual_data().unwrap_or_default();
                    println!("{} bytes: {}", actual, hex(&bytes));
                }
                RequestDirection::HostToDevice => println!("{} bytes sent", actual),
            }
            Ok(())
        }
    }
}

fn lookup(services: &HostServices, id: u32) -> Result<Arc<UsbDevice>> {
    services
        .device(DeviceId(id))
        .ok_or_else(|| anyhow!("No device with ID {}", id))
}

fn print_tree(services: &HostServices, id: DeviceId, depth: usize) {
    let Some(device) = services.device(id) else {
        return;
    };
    let descriptor = device.descriptor();
    println!(
        "{:indent$}{:<6} {} {:04x}:{:04x} USB {} {}{}",
        "",
        id.to_string(),
        device.device_ref(),
        descriptor.vendor_id,
        descriptor.product_id,
        descriptor.usb_version,
        device.speed(),
        if device.is_hub() { " [hub]" } else { "" },
        indent = depth * 2
    );
    for child in services.children(id) {
        print_tree(services, child, depth + 1);
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A root hub with a keyboard-like device and a vendor device behind it
fn demo_bus() -> MockTransport {
    let transport = MockTransport::new();
    let root = DeviceRef::new(1, 1);
    transport.add_device(MockDevice::hub(root).with_speed(DeviceSpeed::High));
    transport.add_device(
        MockDevice::new(DeviceRef::new(1, 2))
            .with_parent(root, 1)
            .with_interfaces(1)
            .with_kernel_driver(0)
            .with_string(1, "Acme")
            .with_string(2, "Keyboard"),
    );
    transport.add_device(
        MockDevice::new(DeviceRef::new(1, 3))
            .with_parent(root, 2)
            .with_interfaces(2)
            .with_string(1, "Acme")
            .with_string(2, "Widget")
            .with_string(3, "0001"),
    );
    transport
}
