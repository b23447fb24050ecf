//! Instrument families and their static protocol parameters.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::frame::CheckedReply;

/// Serial line parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Unknown parity '{0}', expected one of N, E, O")]
pub struct ParseParityError(pub String);

impl FromStr for Parity {
    type Err = ParseParityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "even" | "e" => Ok(Self::Even),
            "odd" | "o" => Ok(Self::Odd),
            _ => Err(ParseParityError(s.to_string())),
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Even => Self::Even,
            Parity::Odd => Self::Odd,
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "N",
            Self::Even => "E",
            Self::Odd => "O",
        })
    }
}

/// Line settings for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialParams {
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl SerialParams {
    pub const fn new(baud_rate: u32, parity: Parity) -> Self {
        Self {
            baud_rate,
            parity,
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

impl fmt::Display for SerialParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}

/// Candidate line settings tried in rotation.
///
/// The head is tried first. A failing head is rotated to the back, so the
/// combination that last worked stays at the head for the next exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParameterSet {
    candidates: VecDeque<SerialParams>,
}

impl SerialParameterSet {
    pub fn new(candidates: impl IntoIterator<Item = SerialParams>) -> Self {
        let mut set = Self {
            candidates: VecDeque::new(),
        };
        for params in candidates {
            if !set.candidates.contains(&params) {
                set.candidates.push_back(params);
            }
        }
        set
    }

    /// Union of the candidates of several families, in order, without duplicates.
    pub fn for_families(families: &[Family]) -> Self {
        Self::new(
            families
                .iter()
                .flat_map(|family| family.serial_candidates().iter().copied()),
        )
    }

    pub fn head(&self) -> Option<SerialParams> {
        self.candidates.front().copied()
    }

    pub fn rotate(&mut self) {
        self.candidates.rotate_left(1usize.min(self.candidates.len()));
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SerialParams> {
        self.candidates.iter()
    }
}

/// Closed set of instrument families speaking the SARAD protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Family {
    Doseman,
    RadonScout,
    Network,
    Dacm,
}

/// Byte order of multi-byte fields in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Self::Little => u16::from_le_bytes(bytes),
            Self::Big => u16::from_be_bytes(bytes),
        }
    }

    pub fn write_u16(self, value: u16) -> [u8; 2] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }
}

/// Bus address announced by an outgoing command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressHint {
    /// The command certainly renumbers the instrument.
    Authoritative(u8),
    /// Inferred from empirically known offsets; logged, not applied.
    Provisional(u8),
}

const GET_ID_COMMAND: u8 = 0x0C;
const OK_BYTE: u8 = 0x0A;

const DOSEMAN_SERIAL: [SerialParams; 1] = [SerialParams::new(9600, Parity::Even)];
const RADON_SCOUT_SERIAL: [SerialParams; 2] = [
    SerialParams::new(9600, Parity::None),
    SerialParams::new(115_200, Parity::None),
];
const NETWORK_SERIAL: [SerialParams; 1] = [SerialParams::new(115_200, Parity::None)];
const DACM_SERIAL: [SerialParams; 2] = [
    SerialParams::new(9600, Parity::None),
    SerialParams::new(115_200, Parity::None),
];

impl Family {
    pub const ALL: [Self; 4] = [Self::Doseman, Self::RadonScout, Self::Network, Self::Dacm];

    /// Families answering the same get-id command with wire-compatible replies.
    /// They are probed together and told apart by the reply.
    pub const SARAD_GENERIC: [Self; 3] = [Self::RadonScout, Self::Dacm, Self::Network];

    pub fn from_id(family_id: u8) -> Option<Self> {
        match family_id {
            1 => Some(Self::Doseman),
            2 => Some(Self::RadonScout),
            4 => Some(Self::Network),
            5 => Some(Self::Dacm),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Self::Doseman => 1,
            Self::RadonScout => 2,
            Self::Network => 4,
            Self::Dacm => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Doseman => "DOSEman",
            Self::RadonScout => "Radon Scout",
            Self::Network => "Network",
            Self::Dacm => "DACM",
        }
    }

    pub fn serial_candidates(self) -> &'static [SerialParams] {
        match self {
            Self::Doseman => &DOSEMAN_SERIAL,
            Self::RadonScout => &RADON_SCOUT_SERIAL,
            Self::Network => &NETWORK_SERIAL,
            Self::Dacm => &DACM_SERIAL,
        }
    }

    pub fn get_id_command(self) -> u8 {
        GET_ID_COMMAND
    }

    pub fn ok_byte(self) -> u8 {
        OK_BYTE
    }

    /// Command that stops a running measuring cycle.
    pub fn stop_command(self) -> Option<u8> {
        match self {
            Self::Doseman => Some(0x33),
            Self::RadonScout => Some(0x15),
            Self::Dacm => Some(0x16),
            Self::Network => None,
        }
    }

    /// Payload length of the reply to the get-id command.
    pub fn description_length(self) -> usize {
        match self {
            Self::Doseman => 5,
            Self::RadonScout | Self::Network => 39,
            Self::Dacm => 60,
        }
    }

    /// Byte order used by the family unless the reply itself says otherwise.
    pub fn byte_order(self) -> ByteOrder {
        match self {
            Self::Doseman | Self::Network => ByteOrder::Little,
            Self::RadonScout | Self::Dacm => ByteOrder::Big,
        }
    }

    /// Pause before the first byte of a command.
    pub fn tx_msg_delay(self) -> Duration {
        match self {
            Self::Doseman => Duration::from_millis(20),
            _ => Duration::ZERO,
        }
    }

    /// Pause between two bytes of a command.
    pub fn tx_byte_delay(self) -> Duration {
        match self {
            Self::Doseman => Duration::from_millis(2),
            Self::RadonScout | Self::Dacm => Duration::from_micros(500),
            Self::Network => Duration::ZERO,
        }
    }

    /// Replies to these commands span several frames.
    pub fn is_multiframe_command(self, command: u8) -> bool {
        matches!((self, command), (Self::Doseman, 0x60 | 0x61))
    }

    /// Guess the family from the OS description of a serial port.
    pub fn guess_from_port_description(description: &str) -> Option<Self> {
        const HINTS: [(&[&str], Family); 4] = [
            (&["irda"], Family::Doseman),
            (&["monitor"], Family::Dacm),
            (&["scout", "smart"], Family::RadonScout),
            (&["ft232"], Family::Network),
        ];
        let description = description.to_lowercase();
        HINTS
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| description.contains(k)))
            .map(|&(_, family)| family)
    }

    /// Inspect an outgoing command for a bus renumbering.
    pub fn announced_rs485_address(self, type_id: u8, command: &CheckedReply) -> Option<AddressHint> {
        if !command.is_valid || !command.is_control {
            return None;
        }
        let data = command.data();
        match (self, command.command_byte()?) {
            // set module information
            (Self::Dacm | Self::Network, 0x02) => data.first().copied().map(AddressHint::Authoritative),
            // set parameter
            (Self::RadonScout, 0x09) => {
                let offset = match type_id {
                    14..=16 => 10,
                    4 | 10 => 1,
                    _ => return None,
                };
                data.get(offset).copied().map(AddressHint::Provisional)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
