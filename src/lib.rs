//! # SARAD RS
//!
//! A Rust driver for the binary serial protocol of SARAD radon and radiation
//! instruments (DOSEman, Radon Scout, DACM and ZigBee network coordinators).
//!
//! The crate frames commands, talks to instruments over RS-232, USB serial
//! adapters, RS-485 buses and ZigBee tunnels, identifies what is connected and
//! keeps a cluster of instruments in sync.
//!
//! ## Features
//!
//! - **Frame codec**: `B-E` and addressed `b-E` frames with checksum validation
//! - **Serial parameter rotation**: baud rate and parity are learned per port
//! - **Identity resolution**: family, type and serial number from the get-id reply
//! - **Cluster scanning**: USB, native and RS-485 ports, merged by device id
//! - **Type safety**: Strong typing and error handling throughout
//!
//! ## Examples
//!
//! ### Encoding and Decoding Frames
//!
//! ```rust
//! use sarad_rs::frame::{decode, Frame};
//!
//! let request = Frame::command(0x0C, &[]).unwrap();
//! assert_eq!(request.to_bytes(), b"B\x80\x7F\x0C\x0C\x00E");
//!
//! let reply = decode(&request.to_bytes(), None, false);
//! assert!(reply.is_valid);
//! assert_eq!(reply.payload, vec![0x0C]);
//! ```
//!
//! ### Scanning for Instruments
//!
//! ```rust,no_run
//! use sarad_rs::{Cluster, ClusterConfig};
//!
//! let config = ClusterConfig::default()
//!     .with_native_ports(["/dev/ttyS0"])
//!     .with_rs485_port("/dev/ttyS1", [1, 2, 3]);
//! let mut cluster = Cluster::new(config);
//!
//! for device_id in cluster.update_connected_instruments(None, None)? {
//!     let instrument = cluster.instrument(&device_id).unwrap();
//!     println!("{} at {}", device_id, instrument.route());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Talking to a Known Instrument
//!
//! ```rust,no_run
//! use sarad_rs::{Family, Route, SaradInstrument, SaradSession, SystemConnector};
//! use std::sync::Arc;
//!
//! let session = SaradSession::new(Arc::new(SystemConnector), Route::direct("/dev/ttyUSB0"), Family::Dacm);
//! let mut instrument = SaradInstrument::new(session);
//! let identity = instrument.initialize()?;
//! println!("{} with {} components", identity, instrument.components().len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cluster;
pub mod family;
pub mod frame;
pub mod identity;
pub mod instrument;
pub mod route;
pub mod serial_session;

#[cfg(test)]
mod mock;

// Re-export the main types for convenience
pub use frame::{CheckedReply, Frame, FrameError};

pub use route::{AddressOutOfRange, Route, Rs485Address};

pub use family::{ByteOrder, Family, Parity, SerialParameterSet, SerialParams};

pub use serial_session::{Connector, PortInfo, SaradSession, SerialLink, SessionError, SystemConnector};

pub use identity::{DeviceId, IdentityError, InstrumentIdentity};

pub use instrument::{InstrumentError, SaradInstrument};

pub use cluster::{Cluster, ClusterConfig, ClusterError, PortScanState};
