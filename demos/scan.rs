// Instrument discovery example
//
// This example scans the serial ports of this machine for SARAD instruments
// and lists what was found, optionally including RS-485 buses.

use clap::Parser;
use sarad_rs::{Cluster, ClusterConfig};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "scan")]
#[command(version = "1.0")]
#[command(about = "Find SARAD instruments on the serial ports of this machine")]
#[command(long_about = "Probe USB serial adapters, native serial ports and RS-485 buses for SARAD instruments and print the device id and route of every instrument found.")]
struct Args {
    /// Ports to probe instead of the detected ones
    ports: Vec<String>,

    /// Native RS-232 ports to include in the scan
    #[arg(short, long, help = "Native serial port to probe, may be repeated")]
    native: Vec<String>,

    /// Ports to leave alone
    #[arg(short, long, help = "Serial port to skip, may be repeated")]
    ignore: Vec<String>,

    /// RS-485 buses as PORT:ADDR,ADDR,...
    #[arg(short, long, value_parser = parse_bus, help = "RS-485 bus, e.g. /dev/ttyS1:1,2,3")]
    rs485: Vec<(String, Vec<u8>)>,

    /// Reply timeout in milliseconds
    #[arg(short, long, default_value_t = 500, help = "Reply timeout of each probe in milliseconds")]
    timeout: u64,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn parse_bus(s: &str) -> Result<(String, Vec<u8>), String> {
    let (port, addresses) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected PORT:ADDR,..., got '{s}'"))?;
    let addresses = addresses
        .split(',')
        .map(|a| a.trim().parse::<u8>().map_err(|e| format!("bad address '{a}': {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((port.to_string(), addresses))
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

    println!("SARAD Instrument Scan");
    println!("=====================\n");

    let mut config = ClusterConfig::default()
        .with_native_ports(args.native)
        .with_ignore_ports(args.ignore)
        .with_probe_timeout(Duration::from_millis(args.timeout));
    for (port, addresses) in args.rs485 {
        config = config.with_rs485_port(&port, addresses);
    }
    let mut cluster = Cluster::new(config);

    let ports_to_test = if args.ports.is_empty() {
        let ports = cluster.active_ports()?;
        println!("Detected ports: {:?}", ports);
        None
    } else {
        Some(args.ports)
    };

    let found = cluster.update_connected_instruments(ports_to_test.as_deref(), None)?;
    if found.is_empty() {
        println!("No SARAD instruments found.");
        return Ok(());
    }

    println!("Found {} instrument(s):", found.len());
    for (i, device_id) in found.iter().enumerate() {
        if let Some(instrument) = cluster.instrument(device_id) {
            let identity = instrument
                .identity()
                .map_or_else(|| instrument.family().to_string(), ToString::to_string);
            println!("  {}. {} at {}: {}", i + 1, device_id, instrument.route(), identity);
        }
    }

    Ok(())
}
