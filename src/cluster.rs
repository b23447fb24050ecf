use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::family::{Family, SerialParameterSet};
use crate::identity::{DeviceId, IdentityError, DESCRIPTION_TIMEOUT};
use crate::instrument::{InstrumentError, SaradInstrument};
use crate::route::{Route, Rs485Address};
use crate::serial_session::{
    Connector, PortInfo, SaradSession, SessionError, SystemConnector, DEFAULT_SETTLE_DELAY,
};

/// USB vendor ids of the serial converters SARAD instruments ship with.
pub const FTDI_VID: u16 = 0x0403;
pub const PROLIFIC_VID: u16 = 0x067B;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterConfig {
    /// RS-232 ports of the controller itself. Only used while present.
    pub native_ports: BTreeSet<String>,
    pub ignore_ports: BTreeSet<String>,
    /// Ports carrying an addressable RS-485 bus and the addresses to probe there.
    pub rs485_ports: BTreeMap<String, Vec<u8>>,
    /// Read timeout for probes and for the replies of identified instruments.
    pub probe_timeout: Duration,
    pub settle_delay: Duration,
    /// Override the per-family write pacing, `(tx_msg_delay, tx_byte_delay)`.
    pub pacing: Option<(Duration, Duration)>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            native_ports: BTreeSet::new(),
            ignore_ports: BTreeSet::new(),
            rs485_ports: BTreeMap::new(),
            probe_timeout: DESCRIPTION_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            pacing: None,
        }
    }
}

impl ClusterConfig {
    #[must_use]
    pub fn with_native_ports<S: Into<String>>(mut self, ports: impl IntoIterator<Item = S>) -> Self {
        self.native_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_ignore_ports<S: Into<String>>(mut self, ports: impl IntoIterator<Item = S>) -> Self {
        self.ignore_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_rs485_port(mut self, port: &str, addresses: impl IntoIterator<Item = u8>) -> Self {
        self.rs485_ports
            .insert(port.to_string(), addresses.into_iter().collect());
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    #[must_use]
    pub fn with_pacing(mut self, tx_msg_delay: Duration, tx_byte_delay: Duration) -> Self {
        self.pacing = Some((tx_msg_delay, tx_byte_delay));
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Cannot list serial ports: {0}")]
    Enumeration(#[source] SessionError),

    #[error("Device id {0} names no known instrument family")]
    UnknownFamily(DeviceId),

    #[error(transparent)]
    Instrument(#[from] InstrumentError),
}

/// Progress of the search for an instrument at one bus location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortScanState {
    Untested,
    Probing(Family),
    Identified(DeviceId),
    Exhausted,
}

/// The instruments reachable from this controller.
///
/// Operations take `&mut self`; share a cluster between threads behind a mutex.
pub struct Cluster {
    connector: Arc<dyn Connector>,
    config: ClusterConfig,
    instruments: BTreeMap<DeviceId, SaradInstrument>,
    port_states: BTreeMap<(String, Option<u8>), PortScanState>,
    start_time: Option<DateTime<Utc>>,
}

/// What a probe sends: the DOSEman command set or the one shared by the
/// other families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Doseman,
    Generic,
}

impl Probe {
    fn family(self) -> Family {
        match self {
            Self::Doseman => Family::Doseman,
            Self::Generic => Family::RadonScout,
        }
    }

    fn parameters(self) -> SerialParameterSet {
        match self {
            Self::Doseman => SerialParameterSet::for_families(&[Family::Doseman]),
            Self::Generic => SerialParameterSet::for_families(&Family::SARAD_GENERIC),
        }
    }

    /// Most likely command set first.
    fn order(guess: Option<Family>) -> [Self; 2] {
        match guess {
            Some(Family::RadonScout | Family::Network | Family::Dacm) => [Self::Generic, Self::Doseman],
            Some(Family::Doseman) | None => [Self::Doseman, Self::Generic],
        }
    }
}

enum ProbeOutcome {
    Found(SaradInstrument),
    NotFound,
    PortFailure,
}

fn is_port_failure(error: &InstrumentError) -> bool {
    match error {
        InstrumentError::Session(e) | InstrumentError::Identity(IdentityError::Session(e)) => e.is_port_failure(),
        _ => false,
    }
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        Self::with_connector(config, Arc::new(SystemConnector))
    }

    pub fn with_connector(config: ClusterConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            config,
            instruments: BTreeMap::new(),
            port_states: BTreeMap::new(),
            start_time: None,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ClusterConfig {
        &mut self.config
    }

    pub fn connected_instruments(&self) -> impl Iterator<Item = &SaradInstrument> {
        self.instruments.values()
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.instruments.keys()
    }

    pub fn instrument(&self, device_id: &DeviceId) -> Option<&SaradInstrument> {
        self.instruments.get(device_id)
    }

    pub fn instrument_mut(&mut self, device_id: &DeviceId) -> Option<&mut SaradInstrument> {
        self.instruments.get_mut(device_id)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn port_state(&self, port: &str, rs485_address: Option<u8>) -> PortScanState {
        self.port_states
            .get(&(port.to_string(), rs485_address))
            .copied()
            .unwrap_or(PortScanState::Untested)
    }

    /// Time of the last [`Self::synchronize`].
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// Pick the ports worth probing from an OS port listing: configured native
    /// ports that exist plus FTDI and Prolific USB converters, minus ignored ones.
    pub fn candidate_ports_from(&self, ports: &[PortInfo]) -> Vec<String> {
        let candidates: BTreeSet<&str> = ports
            .iter()
            .filter(|info| {
                self.config.native_ports.contains(&info.name)
                    || matches!(info.vid, Some(FTDI_VID | PROLIFIC_VID))
            })
            .map(|info| info.name.as_str())
            .filter(|name| !self.config.ignore_ports.contains(*name))
            .collect();
        log::debug!("Native ports: {:?}", self.config.native_ports);
        log::debug!("Ignored ports: {:?}", self.config.ignore_ports);
        log::debug!("Active ports: {:?}", candidates);
        candidates.into_iter().map(str::to_string).collect()
    }

    pub fn active_ports(&self) -> Result<Vec<String>, ClusterError> {
        let ports = self
            .connector
            .available_ports()
            .map_err(ClusterError::Enumeration)?;
        Ok(self.candidate_ports_from(&ports))
    }

    /// Handle for an instrument known by id, reachable over `route`.
    pub fn get_instrument(&self, device_id: DeviceId, route: Route) -> Result<SaradInstrument, ClusterError> {
        let family = device_id
            .family()
            .ok_or(ClusterError::UnknownFamily(device_id))?;
        let session = self.session(route, family);
        Ok(SaradInstrument::new(session)
            .with_reply_timeout(self.config.probe_timeout)
            .with_device_id(device_id))
    }

    fn session(&self, route: Route, family: Family) -> SaradSession {
        let session = SaradSession::new(Arc::clone(&self.connector), route, family)
            .with_settle_delay(self.config.settle_delay);
        match self.config.pacing {
            Some((msg_delay, byte_delay)) => session.with_pacing(msg_delay, byte_delay),
            None => session,
        }
    }

    fn probe_session(&self, route: Route, probe: Probe) -> SaradSession {
        self.session(route, probe.family())
            .with_parameters(probe.parameters())
    }

    fn set_state(&mut self, route: &Route, state: PortScanState) {
        if let Some((port, address)) = route.location() {
            self.port_states.insert((port.to_string(), address), state);
        }
    }

    /// Drop instruments bound to exactly this port and bus address.
    fn evict(&mut self, port: &str, rs485_address: Option<u8>) {
        self.instruments.retain(|device_id, instrument| {
            let bound = instrument.route().location() == Some((port, rs485_address));
            if bound {
                log::debug!("Remove {} on {} from instrument list", device_id, instrument.route());
            }
            !bound
        });
    }

    /// Try the probes in order until one identifies an instrument.
    fn probe(&mut self, route: &Route, order: [Probe; 2]) -> Option<SaradInstrument> {
        let span = tracing::debug_span!("probe", route = %route);
        let _enter = span.enter();

        for probe in order {
            self.set_state(route, PortScanState::Probing(probe.family()));
            let session = self.probe_session(route.clone(), probe);
            match self.probe_with(session, probe) {
                ProbeOutcome::Found(instrument) => {
                    if let Some(device_id) = instrument.device_id() {
                        log::debug!("{} found on route {}.", instrument.family(), route);
                        self.set_state(route, PortScanState::Identified(device_id));
                    }
                    return Some(instrument);
                }
                ProbeOutcome::NotFound => {}
                ProbeOutcome::PortFailure => break,
            }
        }
        self.set_state(route, PortScanState::Exhausted);
        None
    }

    /// Identify the instrument behind `session` and read what it tells
    /// about itself, components included.
    fn probe_with(&self, session: SaradSession, probe: Probe) -> ProbeOutcome {
        let mut instrument = SaradInstrument::new(session).with_reply_timeout(self.config.probe_timeout);
        match instrument.get_identity() {
            Ok(identity) if identity.is_complete() => {
                log::debug!(
                    "type_id = {}, serial_number = {}",
                    identity.type_id,
                    identity.serial_number
                );
                if let Err(e) = instrument.build_component_list() {
                    log::warn!("Component list of {} incomplete: {}", identity.device_id(), e);
                }
                instrument.release();
                ProbeOutcome::Found(instrument)
            }
            Ok(identity) => {
                log::debug!("Incomplete identity {} at {}", identity, instrument.route());
                ProbeOutcome::NotFound
            }
            Err(e) if is_port_failure(&e) => {
                log::error!("{} not accessible: {}", instrument.route(), e);
                ProbeOutcome::PortFailure
            }
            Err(e) => {
                log::debug!("{:?} probe not valid on {}: {}", probe, instrument.route(), e);
                ProbeOutcome::NotFound
            }
        }
    }

    fn test_ports(&mut self, ports: &[String]) -> Vec<SaradInstrument> {
        log::debug!("{} port(s) to test: {:?}", ports.len(), ports);
        let descriptions: HashMap<String, String> = match self.connector.available_ports() {
            Ok(infos) => infos.into_iter().map(|info| (info.name, info.description)).collect(),
            Err(e) => {
                log::warn!("Cannot read port descriptions: {}", e);
                HashMap::new()
            }
        };

        let mut found = Vec::new();
        for port in ports {
            self.evict(port, None);
            let description = descriptions.get(port).map_or("", String::as_str);
            let guess = Family::guess_from_port_description(description);
            log::info!("{}, {:?}, guessed {:?}", port, description, guess);
            if let Some(instrument) = self.probe(&Route::direct(port), Probe::order(guess)) {
                found.push(instrument);
            }
        }
        found
    }

    fn test_rs485(&mut self) -> Vec<SaradInstrument> {
        let buses: Vec<(String, Vec<u8>)> = self
            .config
            .rs485_ports
            .iter()
            .filter(|(port, _)| !self.config.ignore_ports.contains(*port))
            .map(|(port, addresses)| (port.clone(), addresses.clone()))
            .collect();
        log::debug!("{} port(s) to test for RS-485: {:?}", buses.len(), buses);

        let mut found = Vec::new();
        for (port, addresses) in buses {
            for address in addresses {
                let address = match Rs485Address::try_from(address) {
                    Ok(address) => address,
                    Err(e) => {
                        log::warn!("Skipping {}: {}", port, e);
                        continue;
                    }
                };
                self.evict(&port, Some(*address));
                let span = tracing::debug_span!("rs485", port = %port, address = *address);
                let _enter = span.enter();
                if let Some(instrument) = self.probe(&Route::rs485(&port, address), Probe::order(None)) {
                    found.push(instrument);
                }
            }
        }
        found
    }

    /// Union new instruments into the cluster, keyed by device id.
    fn merge(&mut self, found: Vec<SaradInstrument>) -> Vec<DeviceId> {
        let mut added = Vec::new();
        for instrument in found {
            let Some(device_id) = instrument.device_id() else {
                continue;
            };
            if let Some((port, address)) = instrument.route().location() {
                let (port, address) = (port.to_string(), address);
                self.evict(&port, address);
            }
            if let Some(previous) = self.instruments.insert(device_id, instrument) {
                log::info!("{} moved away from {}", device_id, previous.route());
            }
            added.push(device_id);
        }
        added
    }

    /// Probe `ports` directly and merge what was found.
    pub fn scan(&mut self, ports: &[String]) -> Vec<DeviceId> {
        let found = self.test_ports(ports);
        self.merge(found)
    }

    /// Probe every configured RS-485 address and merge what was found.
    pub fn scan_rs485(&mut self) -> Vec<DeviceId> {
        let found = self.test_rs485();
        self.merge(found)
    }

    /// Rescan and return the ids of the instruments found.
    ///
    /// `ports_to_test` defaults to [`Self::active_ports`]. Ports that yield
    /// nothing are probed a second time to catch instruments that were slow
    /// to wake up, then the RS-485 buses are scanned.
    pub fn update_connected_instruments(
        &mut self,
        ports_to_test: Option<&[String]>,
        ports_to_skip: Option<&[String]>,
    ) -> Result<Vec<DeviceId>, ClusterError> {
        let mut ports: Vec<String> = match ports_to_test {
            Some(ports) => ports.to_vec(),
            None => self.active_ports()?,
        };
        if let Some(skip) = ports_to_skip {
            log::debug!("Test: {:?}, Skip: {:?}", ports, skip);
            ports.retain(|port| !skip.contains(port));
            if ports.is_empty() {
                log::warn!("Nothing to do. Set of serial ports to skip is equal to set of active ports.");
                return Ok(Vec::new());
            }
        }

        let mut found = self.test_ports(&ports);
        let lagged: Vec<String> = ports
            .into_iter()
            .filter(|port| !found.iter().any(|i| i.route().port.as_deref() == Some(port.as_str())))
            .collect();
        if !lagged.is_empty() {
            found.extend(self.test_ports(&lagged));
        }
        found.extend(self.test_rs485());

        let added = self.merge(found);
        log::debug!("Connected instruments: {:?}", self.instruments.keys().collect::<Vec<_>>());
        self.release_all();
        Ok(added)
    }

    /// Stop all instruments, set every clock to one UTC instant and restart
    /// each with its cycle from `cycles` (cycle 0 if absent).
    pub fn synchronize(&mut self, cycles: &HashMap<DeviceId, u8>) -> Result<DateTime<Utc>, ClusterError> {
        for instrument in self.instruments.values_mut() {
            instrument.stop_cycle()?;
        }
        let start_time = Utc::now();
        self.start_time = Some(start_time);
        for (device_id, instrument) in &mut self.instruments {
            instrument.set_clock(start_time.naive_utc())?;
            log::debug!("Clock set to UTC on device {}", device_id);
            let cycle = cycles.get(device_id).copied().unwrap_or(0);
            instrument.start_cycle(cycle)?;
            log::debug!("Device {} started with cycle_index {}", device_id, cycle);
        }
        Ok(start_time)
    }

    /// Close the serial handles of all instruments.
    pub fn release_all(&mut self) {
        for instrument in self.instruments.values_mut() {
            instrument.release();
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("config", &self.config)
            .field("instruments", &self.instruments)
            .field("port_states", &self.port_states)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::Parity;
    use crate::mock::{description, instrument, parse_request, rs485_bus, MockConnector};

    fn cluster(connector: &MockConnector, config: ClusterConfig) -> Cluster {
        let config = config
            .with_probe_timeout(Duration::from_millis(20))
            .with_settle_delay(Duration::ZERO)
            .with_pacing(Duration::ZERO, Duration::ZERO);
        Cluster::with_connector(config, Arc::new(connector.clone()))
    }

    fn ports(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn info(name: &str, vid: Option<u16>) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            description: String::new(),
            vid,
            pid: None,
        }
    }

    #[test]
    fn test_candidate_ports() {
        let connector = MockConnector::new();
        let config = ClusterConfig::default()
            .with_native_ports(["/dev/ttyS0", "/dev/ttyS9"])
            .with_ignore_ports(["/dev/ttyUSB1"]);
        let cluster = cluster(&connector, config);
        let listing = [
            info("/dev/ttyS0", None),
            info("/dev/ttyS1", None),
            info("/dev/ttyUSB0", Some(FTDI_VID)),
            info("/dev/ttyUSB1", Some(FTDI_VID)),
            info("/dev/ttyUSB2", Some(PROLIFIC_VID)),
            info("/dev/ttyACM0", Some(0x2341)),
        ];
        assert_eq!(
            cluster.candidate_ports_from(&listing),
            ports(&["/dev/ttyS0", "/dev/ttyUSB0", "/dev/ttyUSB2"])
        );
    }

    #[test]
    fn test_active_ports_from_connector() {
        let connector = MockConnector::new();
        connector.add_device("/dev/ttyUSB0", "FT232R USB UART", Some(FTDI_VID), |_, _| Vec::new());
        connector.add_device("/dev/ttyACM0", "Arduino", Some(0x2341), |_, _| Vec::new());
        let cluster = cluster(&connector, ClusterConfig::default());
        assert_eq!(cluster.active_ports().unwrap(), ports(&["/dev/ttyUSB0"]));
    }

    #[test]
    fn test_scan_identifies_radon_scout() {
        let connector = MockConnector::new();
        connector.add_device(
            "/dev/ttyUSB0",
            "SARAD Radon Scout",
            Some(FTDI_VID),
            instrument(description(10, 0x0102, 39), Parity::None),
        );
        let mut cluster = cluster(&connector, ClusterConfig::default());

        let added = cluster.scan(&ports(&["/dev/ttyUSB0"]));
        assert_eq!(added, vec![DeviceId::new(2, 10, 0x0102)]);
        let found = cluster.instrument(&added[0]).unwrap();
        assert_eq!(found.family(), Family::RadonScout);
        assert_eq!(found.route(), &Route::direct("/dev/ttyUSB0"));
        assert!(!found.session().is_open());
        assert_eq!(
            cluster.port_state("/dev/ttyUSB0", None),
            PortScanState::Identified(added[0])
        );
        // the generic probe goes first for a Radon Scout port
        assert_eq!(connector.writes("/dev/ttyUSB0").len(), 1);
    }

    #[test]
    fn test_scan_is_idempotent() {
        let connector = MockConnector::new();
        connector.add_device(
            "/dev/ttyUSB0",
            "DACM monitor",
            Some(FTDI_VID),
            instrument(description(2, 0x0304, 60), Parity::None),
        );
        let mut cluster = cluster(&connector, ClusterConfig::default());
        let first = cluster.scan(&ports(&["/dev/ttyUSB0"]));
        let second = cluster.scan(&ports(&["/dev/ttyUSB0"]));
        assert_eq!(first, second);
        assert_eq!(cluster.len(), 1);
    }

    #[test]
    fn test_scanned_dacm_is_initialized() {
        let connector = MockConnector::new();
        let mut dacm = description(2, 0x0304, 60);
        dacm[15] = 3;
        connector.add_device(
            "/dev/ttyUSB0",
            "DACM monitor",
            Some(FTDI_VID),
            instrument(dacm, Parity::None),
        );
        let mut cluster = cluster(&connector, ClusterConfig::default());
        let id = cluster.scan(&ports(&["/dev/ttyUSB0"]))[0];

        let found = cluster.instrument_mut(&id).unwrap();
        assert_eq!(found.dacm_description().unwrap().component_count, 3);
        assert_eq!(found.module_information().unwrap().module_name, "Mock");
        let names: Vec<&str> = found.components().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["comp0", "comp1", "comp2"]);
        assert!(!found.session().is_open());

        assert_eq!(found.build_component_list().unwrap(), 3);
    }

    #[test]
    fn test_dacm_without_module_information_is_rejected() {
        let connector = MockConnector::new();
        let dacm = description(2, 0x0304, 60);
        connector.add_device("/dev/ttyUSB0", "DACM monitor", Some(FTDI_VID), move |written, params| {
            match parse_request(written) {
                Some((payload, _)) if payload == [0x0C] && params.parity == Parity::None => {
                    crate::mock::reply_frame(&dacm, None)
                }
                _ => Vec::new(),
            }
        });
        let mut cluster = cluster(&connector, ClusterConfig::default());
        assert!(cluster.scan(&ports(&["/dev/ttyUSB0"])).is_empty());
        assert_eq!(cluster.port_state("/dev/ttyUSB0", None), PortScanState::Exhausted);
    }

    #[test]
    fn test_doseman_tried_first_on_irda_port() {
        let connector = MockConnector::new();
        connector.add_device(
            "/dev/ttyUSB0",
            "IrDA adapter",
            Some(PROLIFIC_VID),
            instrument(description(1, 0x0102, 5), Parity::Even),
        );
        let mut cluster = cluster(&connector, ClusterConfig::default());
        let added = cluster.scan(&ports(&["/dev/ttyUSB0"]));
        assert_eq!(added, vec![DeviceId::new(1, 1, 0x0201)]);
        assert_eq!(connector.opens()[0].1, crate::family::SerialParams::new(9600, Parity::Even));
    }

    #[test]
    fn test_falls_back_to_second_family() {
        let connector = MockConnector::new();
        // description suggests a DOSEman, but a DACM answers
        connector.add_device(
            "/dev/ttyS0",
            "",
            None,
            instrument(description(2, 0x0304, 60), Parity::None),
        );
        let mut cluster = cluster(&connector, ClusterConfig::default());
        let added = cluster.scan(&ports(&["/dev/ttyS0"]));
        assert_eq!(added.len(), 1);
        assert_eq!(cluster.instrument(&added[0]).unwrap().family(), Family::Dacm);
    }

    #[test]
    fn test_coordinator_is_network() {
        let connector = MockConnector::new();
        connector.add_device(
            "/dev/ttyUSB0",
            "FT232R USB UART",
            Some(FTDI_VID),
            instrument(description(200, 0x0102, 39), Parity::None),
        );
        let mut cluster = cluster(&connector, ClusterConfig::default());
        let added = cluster.scan(&ports(&["/dev/ttyUSB0"]));
        assert_eq!(added, vec![DeviceId::new(4, 200, 0x0201)]);
    }

    #[test]
    fn test_incomplete_identity_rejected() {
        let connector = MockConnector::new();
        connector.add_device(
            "/dev/ttyUSB0",
            "SARAD Radon Scout",
            Some(FTDI_VID),
            instrument(description(10, 0, 39), Parity::None),
        );
        let mut cluster = cluster(&connector, ClusterConfig::default());
        assert!(cluster.scan(&ports(&["/dev/ttyUSB0"])).is_empty());
        assert!(cluster.is_empty());
        assert_eq!(cluster.port_state("/dev/ttyUSB0", None), PortScanState::Exhausted);
    }

    #[test]
    fn test_disconnected_instrument_is_removed() {
        let connector = MockConnector::new();
        connector.add_device(
            "/dev/ttyUSB0",
            "SARAD Radon Scout",
            Some(FTDI_VID),
            instrument(description(10, 0x0102, 39), Parity::None),
        );
        let mut cluster = cluster(&connector, ClusterConfig::default());
        let scanned = ports(&["/dev/ttyUSB0"]);

        let added = cluster.update_connected_instruments(Some(&scanned), None).unwrap();
        assert_eq!(added.len(), 1);

        connector.disconnect("/dev/ttyUSB0");
        let added = cluster.update_connected_instruments(Some(&scanned), None).unwrap();
        assert!(added.is_empty());
        assert!(cluster.is_empty());
        assert_eq!(cluster.port_state("/dev/ttyUSB0", None), PortScanState::Exhausted);
    }

    #[test]
    fn test_silent_port_gets_lagged_pass() {
        let connector = MockConnector::new();
        connector.add_device("/dev/ttyUSB0", "", Some(FTDI_VID), |_, _| Vec::new());
        let mut cluster = cluster(&connector, ClusterConfig::default());

        let added = cluster.update_connected_instruments(None, None).unwrap();
        assert!(added.is_empty());
        // DOSEman: one parameter set, generic: two; each tried twice, in two passes
        assert_eq!(connector.writes("/dev/ttyUSB0").len(), 2 * (2 + 4));
    }

    #[test]
    fn test_skip_all_ports() {
        let connector = MockConnector::new();
        let mut cluster = cluster(&connector, ClusterConfig::default());
        let scanned = ports(&["/dev/ttyUSB0"]);
        let added = cluster
            .update_connected_instruments(Some(&scanned), Some(&scanned))
            .unwrap();
        assert!(added.is_empty());
        assert!(connector.opens().is_empty());
    }

    #[test]
    fn test_instrument_moved_to_other_port() {
        let connector = MockConnector::new();
        connector.add_device(
            "/dev/ttyUSB0",
            "SARAD Radon Scout",
            Some(FTDI_VID),
            instrument(description(10, 0x0102, 39), Parity::None),
        );
        let mut cluster = cluster(&connector, ClusterConfig::default());
        let id = cluster.scan(&ports(&["/dev/ttyUSB0"]))[0];

        connector.disconnect("/dev/ttyUSB0");
        connector.add_device(
            "/dev/ttyUSB1",
            "SARAD Radon Scout",
            Some(FTDI_VID),
            instrument(description(10, 0x0102, 39), Parity::None),
        );
        assert_eq!(cluster.scan(&ports(&["/dev/ttyUSB1"])), vec![id]);
        assert_eq!(cluster.len(), 1);
        assert_eq!(cluster.instrument(&id).unwrap().route(), &Route::direct("/dev/ttyUSB1"));
    }

    #[test]
    fn test_rs485_scan() {
        let connector = MockConnector::new();
        connector.add_device(
            "/dev/ttyS1",
            "",
            None,
            rs485_bus(vec![(3, description(2, 0x0101, 60)), (7, description(2, 0x0202, 60))]),
        );
        let config = ClusterConfig::default().with_rs485_port("/dev/ttyS1", [3, 5, 7]);
        let mut cluster = cluster(&connector, config);

        let added = cluster.scan_rs485();
        assert_eq!(added.len(), 2);
        let addresses: BTreeSet<Option<u8>> = cluster
            .connected_instruments()
            .map(|i| i.route().bus_address())
            .collect();
        assert_eq!(addresses, BTreeSet::from([Some(3), Some(7)]));
        assert_eq!(cluster.port_state("/dev/ttyS1", Some(5)), PortScanState::Exhausted);
        assert!(connector
            .writes("/dev/ttyS1")
            .iter()
            .all(|w| parse_request(w).is_some_and(|(_, address)| address.is_some())));

        // rescanning one address keeps the other instrument
        cluster.config_mut().rs485_ports.insert("/dev/ttyS1".to_string(), vec![3]);
        cluster.scan_rs485();
        assert_eq!(cluster.len(), 2);
    }

    #[test]
    fn test_rs485_ignored_port_and_bad_address() {
        let connector = MockConnector::new();
        connector.add_device("/dev/ttyS1", "", None, rs485_bus(vec![(3, description(2, 1, 60))]));
        let config = ClusterConfig::default()
            .with_rs485_port("/dev/ttyS1", [0, 250])
            .with_rs485_port("/dev/ttyS2", [3])
            .with_ignore_ports(["/dev/ttyS2"]);
        let mut cluster = cluster(&connector, config);
        assert!(cluster.scan_rs485().is_empty());
        assert!(connector.opens().is_empty());
    }

    #[test]
    fn test_get_instrument() {
        let connector = MockConnector::new();
        let cluster = cluster(&connector, ClusterConfig::default());
        let id = DeviceId::new(5, 2, 77);
        let instrument = cluster.get_instrument(id, Route::direct("/dev/ttyUSB3")).unwrap();
        assert_eq!(instrument.family(), Family::Dacm);
        assert_eq!(instrument.device_id(), Some(id));
        assert!(matches!(
            cluster.get_instrument(DeviceId::new(9, 1, 1), Route::direct("/dev/ttyUSB3")),
            Err(ClusterError::UnknownFamily(_))
        ));
    }

    #[test]
    fn test_synchronize() {
        let connector = MockConnector::new();
        connector.add_device(
            "/dev/ttyUSB0",
            "SARAD Radon Scout",
            Some(FTDI_VID),
            instrument(description(10, 0x0102, 39), Parity::None),
        );
        connector.add_device(
            "/dev/ttyUSB1",
            "DACM monitor",
            Some(FTDI_VID),
            instrument(description(2, 0x0304, 60), Parity::None),
        );
        let mut cluster = cluster(&connector, ClusterConfig::default());
        cluster.update_connected_instruments(None, None).unwrap();
        assert_eq!(cluster.len(), 2);
        connector.clear_log();

        let dacm = DeviceId::new(5, 2, 0x0304);
        let start = cluster.synchronize(&HashMap::from([(dacm, 3)])).unwrap();
        assert_eq!(cluster.start_time(), Some(start));

        let commands = |port: &str| -> Vec<u8> {
            connector
                .writes(port)
                .iter()
                .filter_map(|w| parse_request(w).map(|(payload, _)| payload[0]))
                .collect()
        };
        assert_eq!(commands("/dev/ttyUSB0"), vec![0x15, 0x05, 0x15, 0x12]);
        assert_eq!(commands("/dev/ttyUSB1"), vec![0x16, 0x10, 0x16, 0x15]);
        let dacm_start = connector.writes("/dev/ttyUSB1").last().and_then(|w| parse_request(w)).unwrap();
        assert_eq!(dacm_start.0, vec![0x15, 3]);
    }
}
