//! Scripted serial ports for unit tests.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::family::{Parity, SerialParams};
use crate::frame::{self, Frame};
use crate::serial_session::{Connector, PortInfo, SerialLink, SessionError};

type Responder = Box<dyn FnMut(&[u8], SerialParams) -> Vec<u8> + Send>;

struct Device {
    responder: Responder,
    connected: bool,
    rx: VecDeque<u8>,
    /// Handles opened before the last [`MockConnector::close_handles`] are dead.
    generation: u32,
    fault: Option<io::ErrorKind>,
    read_fault: Option<io::ErrorKind>,
}

impl Device {
    fn link_error(&self, generation: u32) -> Option<io::Error> {
        if let Some(kind) = self.fault {
            return Some(kind.into());
        }
        (generation != self.generation).then(|| io::ErrorKind::BrokenPipe.into())
    }
}

#[derive(Default)]
struct Bench {
    devices: HashMap<String, Device>,
    ports: Vec<PortInfo>,
    opens: Vec<(String, SerialParams)>,
    writes: Vec<(String, Vec<u8>)>,
}

/// Connector whose ports answer through closures.
#[derive(Clone, Default)]
pub struct MockConnector {
    bench: Arc<Mutex<Bench>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(
        &self,
        port: &str,
        description: &str,
        vid: Option<u16>,
        responder: impl FnMut(&[u8], SerialParams) -> Vec<u8> + Send + 'static,
    ) {
        let mut bench = self.bench.lock().unwrap();
        bench.devices.insert(
            port.to_string(),
            Device {
                responder: Box::new(responder),
                connected: true,
                rx: VecDeque::new(),
                generation: 0,
                fault: None,
                read_fault: None,
            },
        );
        bench.ports.retain(|info| info.name != port);
        bench.ports.push(PortInfo {
            name: port.to_string(),
            description: description.to_string(),
            vid,
            pid: vid.map(|_| 0x6001),
        });
    }

    /// Unplug: the port vanishes from enumeration and goes silent.
    pub fn disconnect(&self, port: &str) {
        let mut bench = self.bench.lock().unwrap();
        if let Some(device) = bench.devices.get_mut(port) {
            device.connected = false;
            device.rx.clear();
        }
        bench.ports.retain(|info| info.name != port);
    }

    /// Close every handle currently open on `port` behind the session's back.
    /// The port itself stays available.
    pub fn close_handles(&self, port: &str) {
        if let Some(device) = self.bench.lock().unwrap().devices.get_mut(port) {
            device.generation += 1;
            device.rx.clear();
        }
    }

    /// Make every operation on open handles of `port` fail with `kind`.
    pub fn fail_io(&self, port: &str, kind: Option<io::ErrorKind>) {
        if let Some(device) = self.bench.lock().unwrap().devices.get_mut(port) {
            device.fault = kind;
        }
    }

    /// Let writes pass but make reads on `port` fail with `kind`.
    pub fn fail_reads(&self, port: &str, kind: Option<io::ErrorKind>) {
        if let Some(device) = self.bench.lock().unwrap().devices.get_mut(port) {
            device.read_fault = kind;
        }
    }

    pub fn opens(&self) -> Vec<(String, SerialParams)> {
        self.bench.lock().unwrap().opens.clone()
    }

    pub fn writes(&self, port: &str) -> Vec<Vec<u8>> {
        self.bench
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(name, _)| name == port)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn clear_log(&self) {
        let mut bench = self.bench.lock().unwrap();
        bench.opens.clear();
        bench.writes.clear();
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        port: &str,
        params: SerialParams,
        _timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, SessionError> {
        let mut bench = self.bench.lock().unwrap();
        let generation = match bench.devices.get(port) {
            Some(device) if device.connected => device.generation,
            _ => {
                return Err(SessionError::PortUnavailable {
                    port: port.to_string(),
                    source: serialport::Error::new(serialport::ErrorKind::NoDevice, "no such device"),
                })
            }
        };
        bench.opens.push((port.to_string(), params));
        Ok(Box::new(MockLink {
            port: port.to_string(),
            params,
            generation,
            bench: Arc::clone(&self.bench),
            tx: Vec::new(),
        }))
    }

    fn available_ports(&self) -> Result<Vec<PortInfo>, SessionError> {
        Ok(self.bench.lock().unwrap().ports.clone())
    }
}

struct MockLink {
    port: String,
    params: SerialParams,
    generation: u32,
    bench: Arc<Mutex<Bench>>,
    tx: Vec<u8>,
}

impl MockLink {
    fn check(&self) -> io::Result<()> {
        let bench = self.bench.lock().unwrap();
        match bench.devices.get(&self.port).and_then(|d| d.link_error(self.generation)) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut bench = self.bench.lock().unwrap();
        if let Some(error) = bench.devices.get(&self.port).and_then(|d| d.link_error(self.generation)) {
            return Err(error);
        }
        let written = std::mem::take(&mut self.tx);
        if !written.is_empty() {
            bench.writes.push((self.port.clone(), written.clone()));
        }
        let Some(device) = bench.devices.get_mut(&self.port) else {
            return Err(io::ErrorKind::TimedOut.into());
        };
        if let Some(kind) = device.read_fault {
            return Err(kind.into());
        }
        if !device.connected {
            return Err(io::ErrorKind::TimedOut.into());
        }
        if !written.is_empty() {
            let reply = (device.responder)(&written, self.params);
            device.rx.extend(reply);
        }
        if device.rx.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(device.rx.len());
        for (slot, byte) in buf.iter_mut().zip(device.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl SerialLink for MockLink {
    fn set_read_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.check()?;
        if let Some(device) = self.bench.lock().unwrap().devices.get_mut(&self.port) {
            device.rx.clear();
        }
        Ok(())
    }

    fn discard_output(&mut self) -> io::Result<()> {
        self.tx.clear();
        Ok(())
    }
}

/// Encode a reply frame the way an instrument sends it.
pub fn reply_frame(payload: &[u8], bus_address: Option<u8>) -> Vec<u8> {
    let frame = Frame::encode(Some(payload[0]), &payload[1..]).unwrap();
    match bus_address {
        Some(address) => frame.with_rs485_address(address).to_bytes(),
        None => frame.to_bytes(),
    }
}

/// The command payload and bus address of a frame written to a mock port.
pub fn parse_request(written: &[u8]) -> Option<(Vec<u8>, Option<u8>)> {
    let request = frame::decode(written, None, false);
    request
        .is_valid
        .then(|| (request.payload, request.bus_address))
}

/// Build an instrument description reply: ok byte, device type, software
/// version, serial number (big endian), then family specific bytes.
pub fn description(type_id: u8, serial: u16, length: usize) -> Vec<u8> {
    let mut payload = vec![0u8; length];
    payload[0] = 0x0A;
    payload[1] = type_id;
    payload[2] = 7;
    payload[3..5].copy_from_slice(&serial.to_be_bytes());
    payload
}

/// Reply payload of an instrument described by `description`: get-id returns
/// the description, DACM module (`0x01`) and component (`0x03`) queries get
/// plausible answers, everything else is acknowledged.
fn answer(request: &[u8], description: &[u8], bus_address: u8) -> Vec<u8> {
    match request {
        [0x0C] => description.to_vec(),
        [0x01] => {
            let mut module = vec![0x0A, bus_address, 1, 6];
            module.extend_from_slice(&2022u16.to_be_bytes());
            module.extend_from_slice(b"Mock\0");
            module
        }
        [0x03, index] => {
            let mut info = vec![0x0A, 1, 2, 1, 0, 8, 0, 16];
            let mut name = format!("comp{index}").into_bytes();
            name.resize(8, 0);
            info.extend_from_slice(&name);
            info.extend_from_slice(&[0, 0, 0, 1]);
            info
        }
        _ => vec![0x0A],
    }
}

/// A directly connected instrument that only understands `parity`.
pub fn instrument(
    description: Vec<u8>,
    parity: Parity,
) -> impl FnMut(&[u8], SerialParams) -> Vec<u8> + Send + 'static {
    move |written: &[u8], params: SerialParams| {
        if params.parity != parity {
            return Vec::new();
        }
        match parse_request(written) {
            Some((payload, None)) => reply_frame(&answer(&payload, &description, 0), None),
            _ => Vec::new(),
        }
    }
}

/// SARAD instruments sharing one RS-485 bus, keyed by bus address.
pub fn rs485_bus(devices: Vec<(u8, Vec<u8>)>) -> impl FnMut(&[u8], SerialParams) -> Vec<u8> + Send + 'static {
    move |written: &[u8], params: SerialParams| {
        if params.parity != Parity::None {
            return Vec::new();
        }
        let Some((payload, Some(address))) = parse_request(written) else {
            return Vec::new();
        };
        match devices.iter().find(|(bus_address, _)| *bus_address == address) {
            Some((_, description)) => reply_frame(&answer(&payload, description, address), Some(address)),
            None => Vec::new(),
        }
    }
}
