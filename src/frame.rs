//! Binary framing of the SARAD protocol.
//!
//! A direct frame looks like
//!
//! ```text
//! 'B' | control | !control | payload[1..=128] | checksum_lo | checksum_hi | 'E'
//! ```
//!
//! and the RS-485 variant inserts the bus address after a lower-case start marker:
//!
//! ```text
//! 'b' | address | control | !control | payload | checksum_lo | checksum_hi | 'E'
//! ```
//!
//! Bit 7 of the control byte flags a control message, bits 0..=6 hold the
//! payload length minus one. The checksum is the 16 bit sum of the payload bytes.

pub const START_DIRECT: u8 = b'B';
pub const START_RS485: u8 = b'b';
pub const END_MARKER: u8 = b'E';
pub const MAX_PAYLOAD: usize = 128;
/// Control payload terminating a multi-frame reply.
pub const END_OF_SEQUENCE: u8 = 0x04;

const CONTROL_FLAG: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload of {0} bytes exceeds the maximum of {MAX_PAYLOAD} bytes")]
    PayloadTooLong(usize),
}

/// Sum of all payload bytes, modulo 2^16.
pub fn checksum(payload: &[u8]) -> u16 {
    payload
        .iter()
        .fold(0u16, |sum, &byte| sum.wrapping_add(u16::from(byte)))
}

/// Number of payload bytes announced by a control byte.
pub fn payload_length(control_byte: u8) -> usize {
    usize::from(control_byte & LENGTH_MASK) + 1
}

/// An outgoing frame.
///
/// A frame without payload is the continuation marker: it is never written to
/// the line, it tells the session to read the next frame of a reply without
/// sending anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bus_address: Option<u8>,
    control_byte: u8,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame from a command byte and its data.
    ///
    /// Passing `None` as command produces a data frame (control flag cleared).
    /// `None` together with empty data yields [`Frame::continuation`].
    pub fn encode(command: Option<u8>, data: &[u8]) -> Result<Self, FrameError> {
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.extend(command);
        payload.extend_from_slice(data);
        if payload.is_empty() {
            return Ok(Self::continuation());
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }
        let mut control_byte = (payload.len() - 1) as u8 & LENGTH_MASK;
        if command.is_some() {
            control_byte |= CONTROL_FLAG;
        }
        Ok(Self {
            bus_address: None,
            control_byte,
            payload,
        })
    }

    /// Shorthand for a control message.
    pub fn command(command: u8, data: &[u8]) -> Result<Self, FrameError> {
        Self::encode(Some(command), data)
    }

    pub fn continuation() -> Self {
        Self {
            bus_address: None,
            control_byte: 0,
            payload: Vec::new(),
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.payload.is_empty()
    }

    /// Turn a direct frame into an addressed RS-485 frame.
    ///
    /// Address 0 means direct addressing and leaves the frame untouched.
    #[must_use]
    pub fn with_rs485_address(mut self, address: u8) -> Self {
        if address != 0 && !self.is_continuation() {
            self.bus_address = Some(address);
        }
        self
    }

    /// Drop the bus address again.
    #[must_use]
    pub fn into_direct(mut self) -> Self {
        self.bus_address = None;
        self
    }

    pub fn bus_address(&self) -> Option<u8> {
        self.bus_address
    }

    pub fn control_byte(&self) -> u8 {
        self.control_byte
    }

    pub fn is_control(&self) -> bool {
        self.control_byte & CONTROL_FLAG != 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn command_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    pub fn data(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or_default()
    }

    pub fn checksum(&self) -> u16 {
        checksum(&self.payload)
    }

    /// Wire representation. Empty for the continuation marker.
    pub fn to_bytes(&self) -> Vec<u8> {
        if self.is_continuation() {
            return Vec::new();
        }
        let mut bytes = Vec::with_capacity(self.payload.len() + 7);
        match self.bus_address {
            Some(address) => bytes.extend_from_slice(&[START_RS485, address]),
            None => bytes.push(START_DIRECT),
        }
        bytes.push(self.control_byte);
        bytes.push(self.control_byte ^ 0xFF);
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&self.checksum().to_le_bytes());
        bytes.push(END_MARKER);
        bytes
    }
}

/// A received frame after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedReply {
    pub is_valid: bool,
    pub is_control: bool,
    /// `false` only while a multi-frame reply still has frames to come.
    pub is_last_frame: bool,
    /// Empty whenever `is_valid` is false.
    pub payload: Vec<u8>,
    /// Bus address echoed by an RS-485 frame.
    pub bus_address: Option<u8>,
    pub raw: Vec<u8>,
}

impl CheckedReply {
    fn invalid(raw: &[u8]) -> Self {
        Self {
            is_valid: false,
            is_control: false,
            is_last_frame: true,
            payload: Vec::new(),
            bus_address: None,
            raw: raw.to_vec(),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn command_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    pub fn data(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or_default()
    }

    /// The reply re-encoded as a direct `B-E` frame, the shape collaborators forward.
    pub fn standard_frame(&self) -> Vec<u8> {
        if !self.is_valid {
            return Vec::new();
        }
        match self.raw.first() {
            Some(&START_RS485) => {
                let mut frame = Vec::with_capacity(self.raw.len() - 1);
                frame.push(START_DIRECT);
                frame.extend_from_slice(&self.raw[2..]);
                frame
            }
            _ => self.raw.clone(),
        }
    }
}

/// Validate a raw frame and extract its payload.
///
/// `rs485_address` of `None` or `Some(0)` accepts direct frames and addressed
/// frames of any bus address; a non-zero address only accepts `b-E` frames
/// echoing exactly that address. Malformed input is reported through
/// `is_valid`, never as an error.
pub fn decode(raw: &[u8], rs485_address: Option<u8>, multiframe: bool) -> CheckedReply {
    let expected = rs485_address.filter(|&address| address != 0);
    let (header_len, bus_address) = match (raw.first(), expected) {
        (Some(&START_DIRECT), None) => (3, None),
        (Some(&START_RS485), _) => match raw.get(1) {
            Some(&address) if expected.map_or(true, |wanted| wanted == address) => {
                (4, Some(address))
            }
            Some(&address) => {
                log::debug!(
                    "b-E frame for bus address {} while expecting {:?}",
                    address,
                    expected
                );
                return CheckedReply::invalid(raw);
            }
            None => return CheckedReply::invalid(raw),
        },
        _ => {
            log::debug!("Invalid B-E frame");
            return CheckedReply::invalid(raw);
        }
    };

    if raw.len() < header_len + 3 || raw.last() != Some(&END_MARKER) {
        return CheckedReply::invalid(raw);
    }
    let control_byte = raw[header_len - 2];
    if control_byte ^ 0xFF != raw[header_len - 1] {
        log::debug!("Control byte {:#04x} and its complement disagree", control_byte);
        return CheckedReply::invalid(raw);
    }
    let length = payload_length(control_byte);
    if raw.len() != header_len + length + 3 {
        return CheckedReply::invalid(raw);
    }
    let payload = &raw[header_len..header_len + length];
    let received = u16::from_le_bytes([raw[header_len + length], raw[header_len + length + 1]]);
    if received != checksum(payload) {
        log::debug!(
            "Checksum mismatch: received {:#06x}, calculated {:#06x}",
            received,
            checksum(payload)
        );
        return CheckedReply::invalid(raw);
    }

    let is_control = control_byte & CONTROL_FLAG != 0;
    let end_of_sequence = is_control && payload == [END_OF_SEQUENCE];
    CheckedReply {
        is_valid: true,
        is_control,
        is_last_frame: !multiframe || end_of_sequence,
        payload: payload.to_vec(),
        bus_address,
        raw: raw.to_vec(),
    }
}

/// Cheap shape test used while reading from the line: start marker and end marker present.
pub fn looks_like_frame(raw: &[u8]) -> bool {
    matches!(raw.first(), Some(&START_DIRECT | &START_RS485)) && raw.last() == Some(&END_MARKER)
}
