// Single instrument example
//
// This example connects to one instrument, reads its identity and component
// list and optionally lists the instruments behind a ZigBee coordinator.

use clap::Parser;
use sarad_rs::{Family, Route, Rs485Address, SaradInstrument, SaradSession, SystemConnector};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "identify")]
#[command(version = "1.0")]
#[command(about = "Read the identity of one SARAD instrument")]
struct Args {
    /// Serial port the instrument is connected to
    port: String,

    /// Family id: 1 DOSEman, 2 Radon Scout, 4 Network, 5 DACM
    #[arg(short, long, default_value_t = 2, help = "Assumed instrument family id")]
    family: u8,

    /// RS-485 bus address
    #[arg(short, long, help = "Address of the instrument on an RS-485 bus")]
    address: Option<u8>,

    /// ZigBee channel behind a coordinator
    #[arg(short, long, help = "ZigBee short address to tunnel to")]
    zigbee: Option<u16>,

    /// List instruments known to a coordinator
    #[arg(short, long, help = "Enumerate the channels of a ZigBee coordinator")]
    channels: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let Some(family) = Family::from_id(args.family) else {
        eprintln!("Unknown family id: {}. Use 1, 2, 4 or 5", args.family);
        std::process::exit(1);
    };

    let mut route = match args.address {
        Some(address) => Route::rs485(&args.port, Rs485Address::try_from(address)?),
        None => Route::direct(&args.port),
    };
    if let Some(channel) = args.zigbee {
        route = route.with_zigbee(channel);
    }

    println!("SARAD Instrument Identification");
    println!("===============================");
    println!("Route: {}", route);
    println!("Assumed family: {}\n", family);

    let session = SaradSession::new(Arc::new(SystemConnector), route, family);
    let mut instrument = SaradInstrument::new(session).with_reply_timeout(Duration::from_millis(500));

    let identity = instrument.initialize()?;
    println!("✓ {}", identity);
    println!("Device id: {}", identity.device_id());

    if let Some(description) = instrument.dacm_description() {
        println!("Manufactured: {}", description.date_of_manufacture);
        println!("Last update: {}", description.date_of_update);
    }
    if let Some(module) = instrument.module_information() {
        println!("Module: {} ({})", module.module_name, module.config_name);
    }
    for component in instrument.components() {
        println!("  component {}: {}", component.id, component.name);
    }

    if args.channels && identity.family == Family::Network {
        println!("\nChannels:");
        for (device_id, short_address) in instrument.scan_channels()? {
            println!("  {} at {:#06x}", device_id, short_address);
        }
    }

    if args.zigbee.is_some() {
        instrument.close_zigbee_channel()?;
    }
    instrument.release();

    Ok(())
}
