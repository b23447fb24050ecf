use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::family::{ByteOrder, Family};
use crate::frame::{CheckedReply, Frame, FrameError};
use crate::serial_session::{SaradSession, SessionError};

/// Device type reported by ZigBee coordinators, whatever family was assumed.
pub const COORDINATOR_TYPE_ID: u8 = 200;

/// Status byte of a DOSEman that is busy with a measuring cycle.
pub const RET_INVALID: u8 = 0x01;

pub const DESCRIPTION_TIMEOUT: Duration = Duration::from_millis(500);

const BYTE_ORDER_FLAG: usize = 29;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Reply to get-id is not a valid frame")]
    InvalidReply,

    #[error("Instrument answered with status {status:#04x}")]
    NotOk { status: u8 },

    #[error("Description of {family} too short: {len} bytes")]
    Truncated { family: Family, len: usize },

    #[error("Type {type_id} is no {family} instrument")]
    WrongFamily { family: Family, type_id: u8 },

    #[error("{0} year corrupted")]
    CorruptedYear(&'static str),
}

/// What an instrument tells about itself in reply to get-id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstrumentIdentity {
    pub family: Family,
    pub type_id: u8,
    pub software_version: u8,
    pub serial_number: u16,
    pub byte_order: ByteOrder,
}

impl InstrumentIdentity {
    pub fn family_id(&self) -> u8 {
        self.family.id()
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.family_id(), self.type_id, self.serial_number)
    }

    /// Both type and serial number are set. Scans reject anything less.
    pub fn is_complete(&self) -> bool {
        self.type_id != 0 && self.serial_number != 0
    }
}

impl fmt::Display for InstrumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} type {} sw {} sn {} ({})",
            self.family,
            self.type_id,
            self.software_version,
            self.serial_number,
            self.device_id()
        )
    }
}

/// Derive the identity from a checked reply to get-id.
///
/// `guess` only matters when the reply does not speak for itself: the reply
/// length separates Radon Scout from DACM, and type 200 is always a ZigBee
/// coordinator.
pub fn resolve_identity(guess: Family, reply: &CheckedReply) -> Result<InstrumentIdentity, IdentityError> {
    if !reply.is_valid {
        return Err(IdentityError::InvalidReply);
    }
    let payload = &reply.payload;

    let scout_length = Family::RadonScout.description_length();
    let mut family = match guess {
        Family::Doseman => Family::Doseman,
        _ if payload.len() == scout_length => Family::RadonScout,
        _ if payload.len() > scout_length => Family::Dacm,
        other => other,
    };

    let status = payload.first().copied().ok_or(IdentityError::Truncated { family, len: 0 })?;
    if status != family.ok_byte() {
        return Err(IdentityError::NotOk { status });
    }
    if payload.len() < 5 {
        return Err(IdentityError::Truncated { family, len: payload.len() });
    }
    let type_id = payload[1];
    let software_version = payload[2];

    if type_id == COORDINATOR_TYPE_ID {
        log::info!("ZigBee Coordinator detected.");
        family = Family::Network;
    } else if family == Family::Network {
        log::info!("This seemed like a Network device, but isn't.");
        return Err(IdentityError::WrongFamily { family, type_id });
    }

    let byte_order = match family {
        Family::Dacm => {
            let flag = payload
                .get(BYTE_ORDER_FLAG)
                .ok_or(IdentityError::Truncated { family, len: payload.len() })?;
            if *flag == 0 {
                log::debug!("DACM-8 with Big-Endian");
                ByteOrder::Big
            } else {
                log::debug!("DACM-32 with Little-Endian");
                ByteOrder::Little
            }
        }
        _ => family.byte_order(),
    };
    let serial_number = byte_order.read_u16([payload[3], payload[4]]);

    Ok(InstrumentIdentity {
        family,
        type_id,
        software_version,
        serial_number,
        byte_order,
    })
}

/// Send get-id and return the checked reply.
///
/// A DOSEman busy with a measurement answers [`RET_INVALID`]; its cycle is
/// stopped and the request repeated once.
pub fn request_description(
    session: &mut SaradSession,
    guess: Family,
    timeout: Duration,
) -> Result<CheckedReply, IdentityError> {
    let request = Frame::command(guess.get_id_command(), &[])?;
    let reply = session.exchange(&request, timeout, true)?;

    if guess == Family::Doseman && reply.is_valid && reply.command_byte() == Some(RET_INVALID) {
        log::info!("DOSEman family with running measurement. Trying to stop.");
        if let Some(stop) = guess.stop_command() {
            session.exchange(&Frame::command(stop, &[])?, timeout, true)?;
        }
        return Ok(session.exchange(&request, timeout, true)?);
    }
    Ok(reply)
}

/// Ask the instrument behind `session` who it is.
pub fn get_identity(
    session: &mut SaradSession,
    guess: Family,
    timeout: Duration,
) -> Result<InstrumentIdentity, IdentityError> {
    let reply = request_description(session, guess, timeout)?;
    identify(session, guess, &reply)
}

pub(crate) fn identify(
    session: &mut SaradSession,
    guess: Family,
    reply: &CheckedReply,
) -> Result<InstrumentIdentity, IdentityError> {
    match resolve_identity(guess, reply) {
        Ok(identity) => {
            session.set_instrument(identity.family, identity.type_id);
            log::debug!("Get description successful: {}", identity);
            Ok(identity)
        }
        Err(e) => {
            log::debug!("Get description failed. Instrument replied {:02X?}: {}", reply.payload, e);
            Err(e)
        }
    }
}

/// Stable textual instrument identifier.
///
/// Packs family, type and serial number into 32 bits and writes them as
/// seven base-32 digits, so the parts can always be recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub family_id: u8,
    pub type_id: u8,
    pub serial_number: u16,
}

const ALPHABET: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";
const DIGITS: usize = 7;

impl DeviceId {
    pub const fn new(family_id: u8, type_id: u8, serial_number: u16) -> Self {
        Self {
            family_id,
            type_id,
            serial_number,
        }
    }

    pub fn family(&self) -> Option<Family> {
        Family::from_id(self.family_id)
    }

    /// Recover the numeric parts from the textual form.
    pub fn decode(text: &str) -> Result<Self, ParseDeviceIdError> {
        text.parse()
    }

    fn packed(self) -> u32 {
        (u32::from(self.family_id) << 24) | (u32::from(self.type_id) << 16) | u32::from(self.serial_number)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = u64::from(self.packed());
        let mut digits = [b'0'; DIGITS];
        for digit in digits.iter_mut().rev() {
            *digit = ALPHABET[(value % 32) as usize];
            value /= 32;
        }
        f.write_str(&String::from_utf8_lossy(&digits))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("'{0}' is not a device id")]
pub struct ParseDeviceIdError(pub String);

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = || ParseDeviceIdError(s.to_string());
        if s.len() != DIGITS {
            return Err(error());
        }
        let mut value: u64 = 0;
        for c in s.bytes() {
            let digit = ALPHABET
                .iter()
                .position(|&a| a == c.to_ascii_lowercase())
                .ok_or_else(error)?;
            value = value * 32 + digit as u64;
        }
        let packed = u32::try_from(value).map_err(|_| error())?;
        Ok(Self {
            family_id: (packed >> 24) as u8,
            type_id: (packed >> 16) as u8,
            serial_number: packed as u16,
        })
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Extra fields of the DACM description reply.
///
/// Offsets into the get-id payload (`b` = family byte order):
///
/// | offset | field                    |
/// |--------|--------------------------|
/// | 5, 6   | manufacture day, month   |
/// | 7..9   | manufacture year (b)     |
/// | 9, 10  | last update day, month   |
/// | 11..13 | last update year (b)     |
/// | 13     | module block size        |
/// | 14     | component block size     |
/// | 15     | component count          |
/// | 16..20 | bit control vector       |
/// | 20..24 | value control vector     |
/// | 24     | cycle block size         |
/// | 25     | cycle count limit        |
/// | 26     | step count limit         |
/// | 27     | language                 |
/// | 29     | byte order flag          |
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DacmDescription {
    pub date_of_manufacture: NaiveDate,
    pub date_of_update: NaiveDate,
    pub module_block_size: u8,
    pub component_block_size: u8,
    pub component_count: u8,
    pub bit_control: [u8; 4],
    pub value_control: [u8; 4],
    pub cycle_block_size: u8,
    pub cycle_count_limit: u8,
    pub step_count_limit: u8,
    pub language: u8,
}

impl DacmDescription {
    pub fn parse(payload: &[u8], byte_order: ByteOrder) -> Result<Self, IdentityError> {
        if payload.len() <= BYTE_ORDER_FLAG {
            return Err(IdentityError::Truncated {
                family: Family::Dacm,
                len: payload.len(),
            });
        }
        let manufacture_year = byte_order.read_u16([payload[7], payload[8]]);
        if manufacture_year == u16::MAX {
            return Err(IdentityError::CorruptedYear("Manufacturing"));
        }
        let update_year = byte_order.read_u16([payload[11], payload[12]]);
        if update_year == u16::MAX {
            return Err(IdentityError::CorruptedYear("Last update"));
        }
        let vector = |from: usize| [payload[from], payload[from + 1], payload[from + 2], payload[from + 3]];
        Ok(Self {
            date_of_manufacture: sanitize_date(manufacture_year, payload[6], payload[5]),
            date_of_update: sanitize_date(update_year, payload[10], payload[9]),
            module_block_size: payload[13],
            component_block_size: payload[14],
            component_count: payload[15],
            bit_control: vector(16),
            value_control: vector(20),
            cycle_block_size: payload[24],
            cycle_count_limit: payload[25],
            step_count_limit: payload[26],
            language: payload[27],
        })
    }
}

/// Reply to the DACM module information command.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModuleInformation {
    pub rs485_address: u8,
    pub date_of_config: NaiveDate,
    pub module_name: String,
    pub config_name: String,
}

impl ModuleInformation {
    pub fn parse(payload: &[u8], byte_order: ByteOrder) -> Result<Self, IdentityError> {
        if payload.len() < 6 {
            return Err(IdentityError::Truncated {
                family: Family::Dacm,
                len: payload.len(),
            });
        }
        let year = byte_order.read_u16([payload[4], payload[5]]);
        let module_end = payload.len().min(39);
        Ok(Self {
            rs485_address: payload[1],
            date_of_config: sanitize_date(year, payload[3], payload[2]),
            module_name: c_string(&payload[6..module_end]),
            config_name: c_string(payload.get(39..).unwrap_or_default()),
        })
    }
}

/// Zero terminated Latin-1 text.
pub(crate) fn c_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect()
}

/// Turn the date fields of a description into a real date.
///
/// Out of range years become 1971, a month that only makes sense as a day
/// swaps place with the day, and impossible days fall back to the first.
pub fn sanitize_date(year: u16, month: u8, day: u8) -> NaiveDate {
    let valid = NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day));
    match valid {
        Some(date) if (1..=9999).contains(&year) => return date,
        _ => log::warn!("Invalid date {}-{}-{} in description", year, month, day),
    }
    let year = if (1..=9999).contains(&year) { year } else { 1971 };
    let (month, day) = match month {
        1..=12 => (month, day),
        _ if (1..=12).contains(&day) => (day, month),
        _ => (1, day),
    };
    NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
        .or_else(|| NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), 1))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;
    use crate::mock::{description, reply_frame, MockConnector};
    use crate::route::Route;
    use std::sync::Arc;

    fn checked(payload: &[u8]) -> CheckedReply {
        decode(&reply_frame(payload, None), None, false)
    }

    #[test]
    fn test_coordinator_forced_to_network() {
        let reply = checked(&description(COORDINATOR_TYPE_ID, 0x0102, 39));
        for guess in Family::ALL {
            let identity = resolve_identity(guess, &reply).unwrap();
            assert_eq!(identity.family, Family::Network);
            assert_eq!(identity.type_id, 200);
        }
    }

    #[test]
    fn test_reply_length_selects_family() {
        let scout = resolve_identity(Family::Dacm, &checked(&description(10, 0x0102, 39))).unwrap();
        assert_eq!(scout.family, Family::RadonScout);
        assert_eq!(scout.serial_number, 0x0102);
        assert_eq!(scout.byte_order, ByteOrder::Big);

        let dacm = resolve_identity(Family::RadonScout, &checked(&description(2, 0x0102, 60))).unwrap();
        assert_eq!(dacm.family, Family::Dacm);
    }

    #[test]
    fn test_dacm_byte_order_flag() {
        let mut payload = description(2, 0x0102, 60);
        let big = resolve_identity(Family::Dacm, &checked(&payload)).unwrap();
        assert_eq!(big.byte_order, ByteOrder::Big);
        assert_eq!(big.serial_number, 0x0102);

        payload[29] = 1;
        let little = resolve_identity(Family::Dacm, &checked(&payload)).unwrap();
        assert_eq!(little.byte_order, ByteOrder::Little);
        assert_eq!(little.serial_number, 0x0201);
    }

    #[test]
    fn test_doseman_reads_little_endian() {
        let identity = resolve_identity(Family::Doseman, &checked(&description(1, 0x0102, 5))).unwrap();
        assert_eq!(identity.family, Family::Doseman);
        assert_eq!(identity.serial_number, 0x0201);
    }

    #[test]
    fn test_network_guess_rejects_other_types() {
        let result = resolve_identity(Family::Network, &checked(&description(7, 1, 20)));
        assert!(matches!(result, Err(IdentityError::WrongFamily { type_id: 7, .. })));
    }

    #[test]
    fn test_rejects_bad_status_and_short_replies() {
        let mut payload = description(10, 1, 39);
        payload[0] = 0x0B;
        assert!(matches!(
            resolve_identity(Family::RadonScout, &checked(&payload)),
            Err(IdentityError::NotOk { status: 0x0B })
        ));
        assert!(matches!(
            resolve_identity(Family::RadonScout, &checked(&[0x0A, 10])),
            Err(IdentityError::Truncated { len: 2, .. })
        ));
        let invalid = decode(b"B\x80\x7F\x0C\x0D\x00E", None, false);
        assert!(matches!(
            resolve_identity(Family::RadonScout, &invalid),
            Err(IdentityError::InvalidReply)
        ));
    }

    #[test]
    fn test_busy_doseman_is_stopped_once() {
        let connector = MockConnector::new();
        let mut busy = true;
        connector.add_device("/dev/ttyUSB0", "", None, move |written, _| {
            match decode(written, None, false).command_byte() {
                Some(0x33) => {
                    busy = false;
                    reply_frame(&[0x0A], None)
                }
                Some(0x0C) if busy => reply_frame(&[RET_INVALID], None),
                Some(0x0C) => reply_frame(&description(1, 0x0304, 5), None),
                _ => Vec::new(),
            }
        });
        let mut session = SaradSession::new(Arc::new(connector.clone()), Route::direct("/dev/ttyUSB0"), Family::Doseman)
            .with_pacing(Duration::ZERO, Duration::ZERO)
            .with_settle_delay(Duration::ZERO);

        let identity = get_identity(&mut session, Family::Doseman, Duration::from_millis(20)).unwrap();
        assert_eq!(identity.serial_number, 0x0403);
        let commands: Vec<Option<u8>> = connector
            .writes("/dev/ttyUSB0")
            .iter()
            .map(|w| decode(w, None, false).command_byte())
            .collect();
        assert_eq!(commands, vec![Some(0x0C), Some(0x33), Some(0x0C)]);
    }

    #[test]
    fn test_device_id_is_reversible() {
        let id = DeviceId::new(5, 2, 0xBEEF);
        let text = id.to_string();
        assert_eq!(text.len(), 7);
        assert_eq!(text.parse::<DeviceId>(), Ok(id));
        assert_eq!(id.family(), Some(Family::Dacm));
        assert_ne!(DeviceId::new(5, 2, 0xBEEE).to_string(), text);
        assert_eq!(DeviceId::new(255, 255, 65535).to_string().parse::<DeviceId>().unwrap().serial_number, 65535);
    }

    #[test]
    fn test_device_id_rejects_garbage() {
        assert!("".parse::<DeviceId>().is_err());
        assert!("0000000u".parse::<DeviceId>().is_err());
        assert!("000000u".parse::<DeviceId>().is_err());
        // more than 32 bits
        assert!("zzzzzzz".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_dacm_description_offsets() {
        let mut payload = description(2, 0x0102, 60);
        payload[5] = 24;
        payload[6] = 12;
        payload[7..9].copy_from_slice(&2019u16.to_be_bytes());
        payload[9] = 1;
        payload[10] = 3;
        payload[11..13].copy_from_slice(&2021u16.to_be_bytes());
        payload[15] = 4;
        payload[16..20].copy_from_slice(&[1, 2, 3, 4]);
        payload[27] = 1;
        let parsed = DacmDescription::parse(&payload, ByteOrder::Big).unwrap();
        assert_eq!(parsed.date_of_manufacture, NaiveDate::from_ymd_opt(2019, 12, 24).unwrap());
        assert_eq!(parsed.date_of_update, NaiveDate::from_ymd_opt(2021, 3, 1).unwrap());
        assert_eq!(parsed.component_count, 4);
        assert_eq!(parsed.bit_control, [1, 2, 3, 4]);
        assert_eq!(parsed.language, 1);

        payload[7..9].copy_from_slice(&[0xFF, 0xFF]);
        assert!(matches!(
            DacmDescription::parse(&payload, ByteOrder::Big),
            Err(IdentityError::CorruptedYear(_))
        ));
    }

    #[test]
    fn test_sanitize_date() {
        let date = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();
        assert_eq!(sanitize_date(2020, 13, 5), date(2020, 5, 13));
        assert_eq!(sanitize_date(2020, 31, 31), date(2020, 1, 31));
        assert_eq!(sanitize_date(2021, 2, 30), date(2021, 2, 1));
        assert_eq!(sanitize_date(0, 6, 15), date(1971, 6, 15));
    }

    #[test]
    fn test_module_information() {
        let mut payload = vec![0x0A, 7, 15, 6];
        payload.extend_from_slice(&2022u16.to_le_bytes());
        payload.extend_from_slice(b"DACM-32\0");
        payload.resize(39, 0);
        payload.extend_from_slice(b"Standard\0");
        let info = ModuleInformation::parse(&payload, ByteOrder::Little).unwrap();
        assert_eq!(info.rs485_address, 7);
        assert_eq!(info.date_of_config, NaiveDate::from_ymd_opt(2022, 6, 15).unwrap());
        assert_eq!(info.module_name, "DACM-32");
        assert_eq!(info.config_name, "Standard");
    }
}
