use chrono::{Datelike, NaiveDateTime, Timelike};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::family::{ByteOrder, Family};
use crate::frame::{self, CheckedReply, Frame, FrameError, END_OF_SEQUENCE};
use crate::identity::{
    self, c_string, DacmDescription, DeviceId, IdentityError, InstrumentIdentity, ModuleInformation,
};
use crate::route::Route;
use crate::serial_session::{SaradSession, SessionError};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(500);
pub const ZIGBEE_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound for the frames of one multi-frame reply.
pub const MAX_FRAMES: usize = 4096;

const CHANNEL_INFO: u8 = 0xD0;
const END_OF_CHANNEL_LIST: u8 = 0xD1;
const CHANNEL_SELECTED: u8 = 0xD2;
const SELECT_CHANNEL: u8 = 0xC2;
const FIRST_CHANNEL: u8 = 0xC0;
const NEXT_CHANNEL: u8 = 0xC1;
const COORDINATOR_RESET: u8 = 0xFE;

const PUSH_BUTTON: u8 = 0x12;
const SCOUT_SET_CLOCK: u8 = 0x05;
const DACM_MODULE_INFORMATION: u8 = 0x01;
const DACM_COMPONENT_INFORMATION: u8 = 0x03;
const DACM_START_CYCLE: u8 = 0x15;
const DACM_SET_CLOCK: u8 = 0x10;
const DACM_ERROR: u8 = 0x0B;

#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Refusing to forward invalid command frame {0:02X?}")]
    FrameInvalid(Vec<u8>),

    #[error("Unexpected reply to {command}: {reply:02X?}")]
    UnexpectedReply { command: &'static str, reply: Vec<u8> },

    #[error("Multi-frame reply exceeds {0} frames")]
    TooManyFrames(usize),

    #[error("Year {0} cannot be set on this instrument")]
    ClockOutOfRange(i32),
}

/// DACM component description, reply to command `0x03`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    pub revision: u8,
    pub component_type: u8,
    pub availability: u8,
    pub ctrl_format: u8,
    pub conf_block_size: u8,
    pub data_record_size: u16,
    pub name: String,
    pub hw_capability: [u8; 4],
}

impl ComponentInfo {
    fn parse(payload: &[u8], byte_order: ByteOrder) -> Option<Self> {
        if payload.len() < 20 {
            return None;
        }
        Some(Self {
            revision: payload[1],
            component_type: payload[2],
            availability: payload[3],
            ctrl_format: payload[4],
            conf_block_size: payload[5],
            data_record_size: byte_order.read_u16([payload[6], payload[7]]),
            name: c_string(&payload[8..16]),
            hw_capability: [payload[16], payload[17], payload[18], payload[19]],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub id: u8,
    pub name: String,
    pub info: Option<ComponentInfo>,
}

/// One instrument behind a ZigBee coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub short_address: u16,
    pub device_type: u8,
    pub firmware_version: u8,
    pub serial_number: u16,
    pub family_id: u8,
}

impl ChannelInfo {
    fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        Some(Self {
            short_address: u16::from_le_bytes([payload[1], payload[2]]),
            device_type: payload[3],
            firmware_version: payload[4],
            serial_number: u16::from_be_bytes([payload[5], payload[6]]),
            family_id: payload[7],
        })
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.family_id, self.device_type, self.serial_number)
    }
}

/// Handle to one SARAD instrument.
///
/// Wraps the transport session with the family specific command set. All
/// per-family behaviour is dispatched on [`Family`].
pub struct SaradInstrument {
    session: SaradSession,
    identity: Option<InstrumentIdentity>,
    known_id: Option<DeviceId>,
    dacm_description: Option<DacmDescription>,
    module_information: Option<ModuleInformation>,
    components: Vec<Component>,
    allowed_commands: Option<Vec<u8>>,
    reply_timeout: Duration,
    keep_open: bool,
}

impl SaradInstrument {
    pub fn new(session: SaradSession) -> Self {
        Self {
            session,
            identity: None,
            known_id: None,
            dacm_description: None,
            module_information: None,
            components: Vec::new(),
            allowed_commands: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            keep_open: true,
        }
    }

    /// An instrument that was identified earlier by a scan.
    pub fn identified(session: SaradSession, identity: InstrumentIdentity) -> Self {
        let mut instrument = Self::new(session);
        instrument.identity = Some(identity);
        instrument
    }

    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Restrict the control commands [`Self::send_message`] forwards.
    #[must_use]
    pub fn with_allowed_commands(mut self, commands: impl IntoIterator<Item = u8>) -> Self {
        self.allowed_commands = Some(commands.into_iter().collect());
        self
    }

    #[must_use]
    pub fn with_keep_open(mut self, keep_open: bool) -> Self {
        self.keep_open = keep_open;
        self
    }

    #[must_use]
    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.known_id = Some(device_id);
        self
    }

    pub fn route(&self) -> &Route {
        self.session.route()
    }

    pub fn family(&self) -> Family {
        self.session.family()
    }

    pub fn identity(&self) -> Option<&InstrumentIdentity> {
        self.identity.as_ref()
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.identity.map(|identity| identity.device_id()).or(self.known_id)
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.identity
            .map_or_else(|| self.family().byte_order(), |identity| identity.byte_order)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn dacm_description(&self) -> Option<&DacmDescription> {
        self.dacm_description.as_ref()
    }

    pub fn module_information(&self) -> Option<&ModuleInformation> {
        self.module_information.as_ref()
    }

    pub fn session(&self) -> &SaradSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SaradSession {
        &mut self.session
    }

    /// Close the serial handle.
    pub fn release(&mut self) {
        self.session.release();
    }

    /// Select the ZigBee channel if the route needs one, identify the
    /// instrument and build its component list.
    pub fn initialize(&mut self) -> Result<InstrumentIdentity, InstrumentError> {
        if let Some(channel) = self.route().zigbee_address {
            self.select_zigbee_channel(channel)?;
        }
        let identity = self.get_identity()?;
        self.build_component_list()?;
        Ok(identity)
    }

    /// Query the description and resolve the identity.
    ///
    /// DACM instruments additionally report their description extras and
    /// module information; the call fails if the module information cannot
    /// be read.
    pub fn get_identity(&mut self) -> Result<InstrumentIdentity, InstrumentError> {
        let guess = self.family();
        let reply = identity::request_description(&mut self.session, guess, self.reply_timeout)?;
        let resolved = identity::identify(&mut self.session, guess, &reply)?;

        if let Some(known) = self.known_id {
            if known != resolved.device_id() {
                log::warn!(
                    "Instrument at {} is {}, expected {}",
                    self.route(),
                    resolved.device_id(),
                    known
                );
            }
        }

        if resolved.family == Family::Dacm {
            self.dacm_description = Some(DacmDescription::parse(&reply.payload, resolved.byte_order)?);
            let module = self.get_reply(DACM_MODULE_INFORMATION, &[])?;
            match module {
                Some(payload) if payload.first() == Some(&resolved.family.ok_byte()) => {
                    self.module_information = Some(ModuleInformation::parse(&payload, resolved.byte_order)?);
                    log::debug!("Get module information successful.");
                }
                other => {
                    log::debug!("Get module information failed.");
                    return Err(InstrumentError::UnexpectedReply {
                        command: "module_information",
                        reply: other.unwrap_or_default(),
                    });
                }
            }
        }
        self.identity = Some(resolved);
        Ok(resolved)
    }

    /// Fills the component list. A DACM whose description was not read yet
    /// is asked for it first.
    pub fn build_component_list(&mut self) -> Result<usize, InstrumentError> {
        self.components.clear();
        if self.family() == Family::Dacm && self.dacm_description.is_none() {
            self.get_identity()?;
        }
        match self.family() {
            Family::Dacm => {
                let count = self.dacm_description.as_ref().map_or(0, |d| d.component_count);
                let byte_order = self.byte_order();
                for index in 0..count {
                    let reply = self.get_reply(DACM_COMPONENT_INFORMATION, &[index])?;
                    let info = reply
                        .filter(|payload| payload.first() == Some(&Family::Dacm.ok_byte()))
                        .and_then(|payload| ComponentInfo::parse(&payload, byte_order));
                    let name = info
                        .as_ref()
                        .map_or_else(|| format!("component {index}"), |info| info.name.clone());
                    self.components.push(Component { id: index, name, info });
                }
            }
            Family::Doseman | Family::RadonScout => self.components.push(Component {
                id: 0,
                name: self.family().name().to_string(),
                info: None,
            }),
            Family::Network => {}
        }
        log::debug!("{} components at {}", self.components.len(), self.route());
        Ok(self.components.len())
    }

    /// Send a command and return the payload of a valid reply.
    pub fn get_reply(&mut self, command: u8, data: &[u8]) -> Result<Option<Vec<u8>>, InstrumentError> {
        self.get_reply_within(command, data, self.reply_timeout)
    }

    fn get_reply_within(
        &mut self,
        command: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, InstrumentError> {
        let message = Frame::command(command, data)?;
        let reply = self.session.exchange(&message, timeout, self.keep_open)?;
        Ok(reply.is_valid.then_some(reply.payload))
    }

    fn acknowledged(&mut self, command: u8, data: &[u8], timeout: Duration) -> Result<bool, InstrumentError> {
        let ok_byte = self.family().ok_byte();
        let reply = self.get_reply_within(command, data, timeout)?;
        Ok(reply.is_some_and(|payload| payload.first() == Some(&ok_byte)))
    }

    /// An outgoing raw frame must decode as a valid frame with a non-empty
    /// payload, and a control command must be on the allow list if one is set.
    pub fn check_cmd(&self, raw: &[u8]) -> bool {
        let checked = frame::decode(raw, self.route().bus_address(), false);
        if !checked.is_valid || checked.payload.is_empty() {
            return false;
        }
        if !checked.is_control {
            return true;
        }
        match (&self.allowed_commands, checked.command_byte()) {
            (None, _) => true,
            (Some(allowed), Some(command)) => allowed.contains(&command),
            (Some(_), None) => false,
        }
    }

    /// Forward a raw frame from a collaborator and return the checked reply.
    ///
    /// An empty message reads the next frame of a multi-frame reply.
    pub fn send_message(&mut self, raw: &[u8]) -> Result<CheckedReply, InstrumentError> {
        if raw.is_empty() {
            return Ok(self.session.read_next(self.reply_timeout, self.keep_open)?);
        }
        if !self.check_cmd(raw) {
            log::error!("Received invalid command {:02X?}", raw);
            return Err(InstrumentError::FrameInvalid(raw.to_vec()));
        }
        let checked = frame::decode(raw, self.route().bus_address(), false);
        let message = if checked.is_control {
            Frame::command(checked.payload[0], &checked.payload[1..])?
        } else {
            Frame::encode(None, &checked.payload)?
        };
        Ok(self.session.exchange(&message, self.reply_timeout, self.keep_open)?)
    }

    /// Send a command whose reply spans several frames and collect the payloads.
    ///
    /// Frames are read until the instrument signals the end of the sequence;
    /// the terminator itself is not part of the result.
    pub fn download(&mut self, command: u8, data: &[u8]) -> Result<Vec<Vec<u8>>, InstrumentError> {
        let message = Frame::command(command, data)?;
        let mut reply = self.session.exchange(&message, self.reply_timeout, true)?;
        let mut payloads = Vec::new();
        let result = loop {
            if !reply.is_valid {
                break Err(InstrumentError::UnexpectedReply {
                    command: "download",
                    reply: reply.raw,
                });
            }
            let terminator = reply.is_control && reply.payload == [END_OF_SEQUENCE];
            if !terminator {
                payloads.push(reply.payload);
            }
            if reply.is_last_frame {
                break Ok(payloads);
            }
            if payloads.len() >= MAX_FRAMES {
                break Err(InstrumentError::TooManyFrames(MAX_FRAMES));
            }
            reply = match self.session.read_next(self.reply_timeout, true) {
                Ok(next) => next,
                Err(e) => break Err(e.into()),
            };
        };
        if !self.keep_open {
            self.session.release();
        }
        result
    }

    pub fn stop_cycle(&mut self) -> Result<bool, InstrumentError> {
        let family = self.family();
        let Some(command) = family.stop_command() else {
            log::warn!("{} instruments have no measuring cycle", family);
            return Ok(false);
        };
        // DOSEman needs longer to settle
        let timeout = match family {
            Family::Doseman => self.reply_timeout + Duration::from_secs(1),
            _ => self.reply_timeout,
        };
        let stopped = self.acknowledged(command, &[], timeout)?;
        if stopped {
            log::debug!("Cycle stopped at {}", self.route());
        } else {
            log::error!("stop_cycle() failed at {}", self.route());
        }
        Ok(stopped)
    }

    pub fn start_cycle(&mut self, cycle_index: u8) -> Result<bool, InstrumentError> {
        match self.family() {
            Family::RadonScout => {
                let started = self.stop_cycle()? && self.acknowledged(PUSH_BUTTON, &[], self.reply_timeout)?;
                if started {
                    log::debug!("Push button simulated at {}", self.route());
                } else {
                    log::error!("Push button failed at {}", self.route());
                }
                Ok(started)
            }
            Family::Dacm => {
                log::debug!("Trying to start measuring cycle {}", cycle_index);
                self.stop_cycle()?;
                let reply = self.get_reply_within(DACM_START_CYCLE, &[cycle_index], self.reply_timeout * 2)?;
                match reply.as_deref() {
                    Some([status, ..]) if *status == Family::Dacm.ok_byte() => {
                        log::debug!("Cycle {} started at {}", cycle_index, self.route());
                        Ok(true)
                    }
                    Some([DACM_ERROR, code, ..]) => {
                        log::error!("DACM instrument replied with error code {}", code);
                        Ok(false)
                    }
                    _ => {
                        log::error!("start_cycle() failed at {}", self.route());
                        Ok(false)
                    }
                }
            }
            family => {
                log::warn!("start_cycle() is not supported by {} instruments", family);
                Ok(false)
            }
        }
    }

    pub fn set_clock(&mut self, time: NaiveDateTime) -> Result<bool, InstrumentError> {
        let fields = [
            time.second() as u8,
            time.minute() as u8,
            time.hour() as u8,
            time.day() as u8,
            time.month() as u8,
        ];
        let set = match self.family() {
            Family::RadonScout => {
                let year = u8::try_from(time.year() - 2000)
                    .map_err(|_| InstrumentError::ClockOutOfRange(time.year()))?;
                let mut data = fields.to_vec();
                data.push(year);
                self.acknowledged(SCOUT_SET_CLOCK, &data, self.reply_timeout)?
            }
            Family::Dacm => {
                let year = u16::try_from(time.year()).map_err(|_| InstrumentError::ClockOutOfRange(time.year()))?;
                let mut data = fields.to_vec();
                data.extend_from_slice(&self.byte_order().write_u16(year));
                self.acknowledged(DACM_SET_CLOCK, &data, self.reply_timeout)?
            }
            family => {
                log::warn!("set_clock() is not supported by {} instruments", family);
                return Ok(false);
            }
        };
        if set {
            log::debug!("Time at {} set to {}", self.route(), time);
        } else {
            log::error!("Setting the time at {} failed", self.route());
        }
        Ok(set)
    }

    /// Open the transparent channel to the instrument with ZigBee address `channel`.
    pub fn select_zigbee_channel(&mut self, channel: u16) -> Result<Vec<u8>, InstrumentError> {
        let reply = self.get_reply_within(SELECT_CHANNEL, &channel.to_le_bytes(), ZIGBEE_TIMEOUT)?;
        match reply {
            Some(payload) if payload.first() == Some(&CHANNEL_SELECTED) => {
                log::info!("Channel {} selected: {:02X?}", channel, payload);
                Ok(payload)
            }
            other => {
                log::error!("Unexpected reply to select_channel: {:02X?}", other);
                Err(InstrumentError::UnexpectedReply {
                    command: "select_zigbee_channel",
                    reply: other.unwrap_or_default(),
                })
            }
        }
    }

    /// Leave the transparent mode.
    pub fn close_zigbee_channel(&mut self) -> Result<Vec<u8>, InstrumentError> {
        let reply = self.get_reply_within(SELECT_CHANNEL, &[0, 0], ZIGBEE_TIMEOUT)?;
        match reply {
            Some(payload) if payload.first() == Some(&CHANNEL_SELECTED) => Ok(payload),
            other => {
                log::error!("Unexpected reply to close_channel: {:02X?}", other);
                Err(InstrumentError::UnexpectedReply {
                    command: "close_zigbee_channel",
                    reply: other.unwrap_or_default(),
                })
            }
        }
    }

    fn channel_query(&mut self, command: u8, name: &'static str) -> Result<Option<ChannelInfo>, InstrumentError> {
        let reply = self.get_reply_within(command, &[], ZIGBEE_TIMEOUT)?;
        let status = reply.as_ref().and_then(|payload| payload.first().copied());
        let info = match status {
            Some(CHANNEL_INFO) => reply.as_deref().and_then(ChannelInfo::parse),
            Some(END_OF_CHANNEL_LIST) => return Ok(None),
            _ => None,
        };
        log::debug!("{}() returns with {:?}", name, info);
        match info {
            Some(info) => Ok(Some(info)),
            None => {
                log::error!("Unexpected reply to {}: {:02X?}", name, reply);
                Err(InstrumentError::UnexpectedReply {
                    command: name,
                    reply: reply.unwrap_or_default(),
                })
            }
        }
    }

    /// First instrument known to a ZigBee coordinator, `None` for an empty list.
    pub fn get_first_channel(&mut self) -> Result<Option<ChannelInfo>, InstrumentError> {
        self.channel_query(FIRST_CHANNEL, "get_first_channel")
    }

    pub fn get_next_channel(&mut self) -> Result<Option<ChannelInfo>, InstrumentError> {
        self.channel_query(NEXT_CHANNEL, "get_next_channel")
    }

    /// Map every instrument behind a ZigBee coordinator to its short address.
    pub fn scan_channels(&mut self) -> Result<BTreeMap<DeviceId, u16>, InstrumentError> {
        let mut channels = BTreeMap::new();
        let mut next = self.get_first_channel()?;
        let mut polled = 0;
        while let Some(info) = next {
            channels.insert(info.device_id(), info.short_address);
            polled += 1;
            if polled >= MAX_FRAMES {
                return Err(InstrumentError::TooManyFrames(polled));
            }
            next = self.get_next_channel()?;
        }
        Ok(channels)
    }

    /// Restart the coordinator, same as power off and on.
    pub fn coordinator_reset(&mut self) -> Result<bool, InstrumentError> {
        let reset = self.acknowledged(COORDINATOR_RESET, &[], ZIGBEE_TIMEOUT)?;
        if !reset {
            log::error!("Unexpected reply to coordinator_reset at {}", self.route());
        }
        Ok(reset)
    }
}

impl std::fmt::Debug for SaradInstrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaradInstrument")
            .field("route", self.route())
            .field("identity", &self.identity)
            .field("components", &self.components.len())
            .finish_non_exhaustive()
    }
}
