use serialport::{DataBits, FlowControl, SerialPort, SerialPortType, StopBits};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::family::{AddressHint, Family, SerialParameterSet, SerialParams};
use crate::frame::{self, CheckedReply, Frame, END_MARKER, MAX_PAYLOAD, START_DIRECT, START_RS485};
use crate::route::Route;

/// Pause after closing the port before the next parameter set is tried,
/// giving the instrument time to reset its input buffer.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

const MAX_FRAME_LEN: usize = MAX_PAYLOAD + 7;

/// Byte channel to one serial device.
pub trait SerialLink: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    fn discard_input(&mut self) -> io::Result<()>;
    fn discard_output(&mut self) -> io::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.as_mut().set_timeout(timeout).map_err(io::Error::from)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn discard_output(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Output)
            .map_err(io::Error::from)
    }
}

/// A serial port as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let description = [usb.manufacturer, usb.product]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                Self {
                    name: info.port_name,
                    description,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                }
            }
            _ => Self {
                name: info.port_name,
                description: String::new(),
                vid: None,
                pid: None,
            },
        }
    }
}

/// Opens serial links and lists ports. Implemented by [`SystemConnector`]
/// for real hardware.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        port: &str,
        params: SerialParams,
        timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, SessionError>;

    fn available_ports(&self) -> Result<Vec<PortInfo>, SessionError>;
}

/// Connector backed by the `serialport` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemConnector;

impl Connector for SystemConnector {
    fn open(
        &self,
        port: &str,
        params: SerialParams,
        timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, SessionError> {
        let data_bits = match params.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = if params.stop_bits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        };
        let serial = serialport::new(port, params.baud_rate)
            .data_bits(data_bits)
            .parity(params.parity.into())
            .stop_bits(stop_bits)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|source| SessionError::PortUnavailable {
                port: port.to_string(),
                source,
            })?;
        log::debug!("Serial {} ready @ {}", port, params);
        Ok(Box::new(serial))
    }

    fn available_ports(&self) -> Result<Vec<PortInfo>, SessionError> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Serial port {port} is unavailable: {source}")]
    PortUnavailable {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("I/O error on serial port {port}: {source}")]
    Transport {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("No reply from {port} with any of the serial parameter sets")]
    NoResponse { port: String },

    #[error("The route to the instrument has no serial port")]
    NoPort,

    #[error("Cannot enumerate serial ports: {0}")]
    Enumeration(#[from] serialport::Error),
}

impl SessionError {
    /// `true` for failures of the port itself as opposed to a silent line.
    pub fn is_port_failure(&self) -> bool {
        matches!(self, Self::PortUnavailable { .. } | Self::Transport { .. })
    }
}

struct OpenLink {
    link: Box<dyn SerialLink>,
    params: SerialParams,
}

/// Half-duplex conversation with the instrument(s) behind one route.
///
/// Owns at most one open serial handle. Exactly one exchange may be in flight
/// at a time, which `&mut self` enforces.
pub struct SaradSession {
    connector: Arc<dyn Connector>,
    route: Route,
    family: Family,
    type_id: u8,
    parameters: SerialParameterSet,
    open: Option<OpenLink>,
    tx_msg_delay: Duration,
    tx_byte_delay: Duration,
    settle_delay: Duration,
}

impl SaradSession {
    pub fn new(connector: Arc<dyn Connector>, route: Route, family: Family) -> Self {
        Self {
            connector,
            route,
            family,
            type_id: 0,
            parameters: SerialParameterSet::new(family.serial_candidates().iter().copied()),
            open: None,
            tx_msg_delay: family.tx_msg_delay(),
            tx_byte_delay: family.tx_byte_delay(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: SerialParameterSet) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn with_pacing(mut self, tx_msg_delay: Duration, tx_byte_delay: Duration) -> Self {
        self.tx_msg_delay = tx_msg_delay;
        self.tx_byte_delay = tx_byte_delay;
        self
    }

    #[must_use]
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn route_mut(&mut self) -> &mut Route {
        &mut self.route
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Update what is known about the instrument behind the route.
    pub fn set_instrument(&mut self, family: Family, type_id: u8) {
        self.family = family;
        self.type_id = type_id;
    }

    pub fn parameters(&self) -> &SerialParameterSet {
        &self.parameters
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    fn port(&self) -> Result<String, SessionError> {
        self.route.port.clone().ok_or(SessionError::NoPort)
    }

    /// Close the serial handle, if any.
    pub fn release(&mut self) {
        if let Some(mut open) = self.open.take() {
            if open.link.discard_input().is_err() || open.link.discard_output().is_err() {
                log::warn!("Serial interface {:?} not available.", self.route.port);
            }
            log::debug!("Serial interface {:?} closed.", self.route.port);
        }
    }

    fn transport_error(&mut self, source: io::Error) -> SessionError {
        let port = self.route.port.clone().unwrap_or_default();
        log::error!("I/O error on {}: {}", port, source);
        // the handle may be in any state now
        self.open = None;
        SessionError::Transport { port, source }
    }

    /// Make sure a handle with `params` is open. Returns `true` when a stored
    /// handle was reused rather than freshly opened.
    fn ensure_open(&mut self, params: SerialParams, timeout: Duration) -> Result<bool, SessionError> {
        if self.open.as_ref().is_some_and(|open| open.params != params) {
            self.release();
        }
        if let Some(open) = self.open.as_mut() {
            if open.link.set_read_timeout(timeout).is_ok() {
                log::debug!("Reuse stored serial interface");
                return Ok(true);
            }
            log::info!("Stored serial interface {:?} is gone. Reopening.", self.route.port);
            self.open = None;
        }
        let port = self.port()?;
        let mut link = self.connector.open(&port, params, timeout)?;
        if let Err(e) = link.set_read_timeout(timeout) {
            return Err(self.transport_error(e));
        }
        self.open = Some(OpenLink { link, params });
        Ok(false)
    }

    fn link(&mut self) -> Result<&mut Box<dyn SerialLink>, SessionError> {
        match self.open.as_mut() {
            Some(open) => Ok(&mut open.link),
            None => Err(SessionError::NoPort),
        }
    }

    /// Write a command byte by byte, honouring the pre-write and inter-byte delays.
    fn write_paced(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let (msg_delay, byte_delay) = (self.tx_msg_delay, self.tx_byte_delay);
        let link = self.link()?;
        let result = pace(link.as_mut(), bytes, msg_delay, byte_delay);
        result.map_err(|e| self.transport_error(e))
    }

    /// Read until `wanted` bytes arrived or the deadline passed.
    fn read_bytes(&mut self, wanted: usize, deadline: Instant) -> Result<Vec<u8>, SessionError> {
        let mut buffer = Vec::with_capacity(wanted);
        let mut chunk = [0u8; MAX_FRAME_LEN];
        while buffer.len() < wanted {
            let limit = (wanted - buffer.len()).min(chunk.len());
            let result = self.link()?.read(&mut chunk[..limit]);
            match result {
                Ok(0) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                    break;
                }
                Err(e) => return Err(self.transport_error(e)),
            }
        }
        Ok(buffer)
    }

    /// Read exactly one `B-E` (or `b-E`) frame.
    ///
    /// Silence yields an empty vector. A reply that does not start with the
    /// expected marker is discarded, it does not come from a SARAD instrument.
    pub fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, SessionError> {
        let (header_len, start) = if self.route.is_addressed() {
            (4, START_RS485)
        } else {
            (3, START_DIRECT)
        };
        let mut frame = self.read_bytes(header_len, Instant::now() + timeout)?;
        if frame.is_empty() {
            log::debug!("No reply on {:?}", self.route.port);
            return Ok(frame);
        }
        if frame[0] != start {
            log::warn!(
                "Message {:02X?} should start with {:?}. No SARAD instrument.",
                frame,
                char::from(start)
            );
            return Ok(Vec::new());
        }
        if frame.len() < header_len {
            return Ok(frame);
        }
        let control_byte = frame[header_len - 2];
        if control_byte ^ 0xFF != frame[header_len - 1] {
            log::error!("Message corrupted.");
            return Ok(frame);
        }

        let remaining = frame::payload_length(control_byte) + 3;
        log::debug!("Expecting {} bytes at timeout of {:?}", remaining, timeout);
        let rest = self.read_bytes(remaining, Instant::now() + timeout)?;
        let complete = rest.len() == remaining;
        frame.extend_from_slice(&rest);
        if !complete {
            log::error!("Incomplete B-E frame. Trying to complete.");
            let tail = self.read_until_end_marker(Instant::now() + timeout)?;
            frame.extend_from_slice(&tail);
        }
        Ok(frame)
    }

    fn read_until_end_marker(&mut self, deadline: Instant) -> Result<Vec<u8>, SessionError> {
        let mut tail = Vec::new();
        while tail.len() < MAX_FRAME_LEN {
            let byte = self.read_bytes(1, deadline)?;
            match byte.first() {
                Some(&b) => {
                    tail.push(b);
                    if b == END_MARKER {
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(tail)
    }

    fn try_parameters(
        &mut self,
        params: SerialParams,
        raw: &[u8],
        timeout: Duration,
        keep: bool,
    ) -> Result<Vec<u8>, SessionError> {
        let reused = self.ensure_open(params, timeout)?;
        if !raw.is_empty() {
            log::debug!("Tx to {:?}: {:02X?}", self.route.port, raw);
            match self.write_paced(raw) {
                Ok(()) => {}
                // a stored handle may have been closed externally
                Err(SessionError::Transport { .. }) if reused => {
                    log::info!("Reopening serial interface {:?}", self.route.port);
                    self.ensure_open(params, timeout)?;
                    self.write_paced(raw)?;
                }
                Err(e) => return Err(e),
            }
            self.track_rs485_address(raw);
        }
        let reply = self.read_frame(timeout)?;
        if !keep {
            self.release();
        }
        log::debug!("Rx from {:?}: {:02X?}", self.route.port, reply);
        Ok(reply)
    }

    /// Send raw bytes and return the raw reply frame, rotating through the
    /// serial parameter sets until one of them gets an answer.
    ///
    /// Every parameter set gets one immediate retry before the port is closed,
    /// the set rotated, and the next one tried after the settle delay. An empty
    /// `raw` reads without writing.
    pub fn transparent_reply(
        &mut self,
        raw: &[u8],
        timeout: Duration,
        keep: bool,
    ) -> Result<Vec<u8>, SessionError> {
        let port = self.port()?;
        log::debug!("Possible serial parameters: {:?}", self.parameters);
        for _ in 0..self.parameters.len() {
            let Some(params) = self.parameters.head() else {
                break;
            };
            log::debug!("Try to send {:02X?} with {}", raw, params);
            let mut reply = self.try_parameters(params, raw, timeout, keep)?;
            if !frame::looks_like_frame(&reply) {
                // firmware occasionally swallows the first request
                log::debug!("Play it again, Sam!");
                reply = self.try_parameters(params, raw, timeout, keep)?;
            }
            if frame::looks_like_frame(&reply) {
                log::debug!("Working with {}", params);
                return Ok(reply);
            }
            self.release();
            self.parameters.rotate();
            thread::sleep(self.settle_delay);
        }
        Err(SessionError::NoResponse { port })
    }

    /// Send one frame and return the checked reply.
    ///
    /// The frame is addressed according to the route. If the instrument echoes
    /// the command verbatim, the next frame is read without sending anything
    /// and that frame is the reply.
    pub fn exchange(
        &mut self,
        message: &Frame,
        timeout: Duration,
        keep: bool,
    ) -> Result<CheckedReply, SessionError> {
        let multiframe = message
            .command_byte()
            .is_some_and(|command| message.is_control() && self.family.is_multiframe_command(command));
        let outgoing = self.addressed(message).to_bytes();
        let result = self.exchange_raw(&outgoing, timeout, multiframe);
        if !keep {
            self.release();
        }
        result
    }

    /// Read the next frame of a multi-frame reply.
    pub fn read_next(&mut self, timeout: Duration, keep: bool) -> Result<CheckedReply, SessionError> {
        let result = self.exchange_raw(&[], timeout, true);
        if !keep {
            self.release();
        }
        result
    }

    fn exchange_raw(
        &mut self,
        outgoing: &[u8],
        timeout: Duration,
        multiframe: bool,
    ) -> Result<CheckedReply, SessionError> {
        let answer = self.transparent_reply(outgoing, timeout, true)?;
        if !outgoing.is_empty() && answer == outgoing {
            log::debug!("Echo. Get next frame!");
            let answer = self.transparent_reply(&[], timeout, true)?;
            return Ok(frame::decode(&answer, self.route.bus_address(), multiframe));
        }
        Ok(frame::decode(&answer, self.route.bus_address(), multiframe))
    }

    fn addressed(&self, message: &Frame) -> Frame {
        match self.route.bus_address() {
            Some(address) => message.clone().with_rs485_address(address),
            None => message.clone().into_direct(),
        }
    }

    /// Follow bus renumbering commands sent through this session.
    fn track_rs485_address(&mut self, raw: &[u8]) {
        let command = frame::decode(raw, self.route.bus_address(), false);
        match self.family.announced_rs485_address(self.type_id, &command) {
            Some(AddressHint::Authoritative(address)) => self.route.set_rs485_address(address),
            Some(AddressHint::Provisional(address)) => log::info!(
                "Command may move {} to RS-485 address {}; keeping {:?}",
                self.route,
                address,
                self.route.rs485_address
            ),
            None => {}
        }
    }
}

fn pace(
    link: &mut dyn SerialLink,
    bytes: &[u8],
    msg_delay: Duration,
    byte_delay: Duration,
) -> io::Result<()> {
    link.discard_input()?;
    thread::sleep(msg_delay);
    for byte in bytes {
        link.write_all(&[*byte])?;
        thread::sleep(byte_delay);
    }
    link.flush()
}

impl Drop for SaradSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SaradSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaradSession")
            .field("route", &self.route)
            .field("family", &self.family)
            .field("parameters", &self.parameters)
            .field("open", &self.open.as_ref().map(|open| open.params))
            .finish_non_exhaustive()
    }
}
