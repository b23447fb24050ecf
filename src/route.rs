use std::fmt;

/// How an instrument is reached.
///
/// `rs485_address` and `zigbee_address` are `None` for the simple case of an
/// instrument directly and exclusively connected to a serial port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Route {
    pub port: Option<String>,
    pub rs485_address: Option<u8>,
    pub zigbee_address: Option<u16>,
}

impl Route {
    pub fn direct(port: &str) -> Self {
        Self {
            port: Some(port.to_string()),
            rs485_address: None,
            zigbee_address: None,
        }
    }

    pub fn rs485(port: &str, address: Rs485Address) -> Self {
        Self {
            port: Some(port.to_string()),
            rs485_address: Some(*address),
            zigbee_address: None,
        }
    }

    #[must_use]
    pub fn with_zigbee(mut self, channel: u16) -> Self {
        self.zigbee_address = Some(channel);
        self
    }

    /// Bus address to use for framing, `None` meaning direct `B-E` frames.
    pub fn bus_address(&self) -> Option<u8> {
        self.rs485_address.filter(|&address| address != 0)
    }

    pub fn is_addressed(&self) -> bool {
        self.bus_address().is_some()
    }

    /// Record a bus renumbering observed on the wire.
    pub fn set_rs485_address(&mut self, address: u8) {
        let old = self.rs485_address;
        self.rs485_address = Some(address);
        log::info!(
            "Change RS-485 bus address on {:?} from {:?} into {}",
            self.port,
            old,
            address
        );
    }

    /// Key under which the cluster tracks a probed bus location.
    pub fn location(&self) -> Option<(&str, Option<u8>)> {
        self.port.as_deref().map(|port| (port, self.bus_address()))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port.as_deref().unwrap_or("<unreachable>"))?;
        if let Some(address) = self.bus_address() {
            write!(f, "@rs485:{address}")?;
        }
        if let Some(channel) = self.zigbee_address {
            write!(f, "@zigbee:{channel}")?;
        }
        Ok(())
    }
}

/// RS-485 bus address. Valid addresses range from 1 to 247.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rs485Address(u8);

impl Rs485Address {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 247;
}

impl std::ops::Deref for Rs485Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error(
    "The RS-485 address {0} is outside the valid range of {min} to {max}",
    min = Rs485Address::MIN,
    max = Rs485Address::MAX
)]
pub struct AddressOutOfRange(pub u8);

impl TryFrom<u8> for Rs485Address {
    type Error = AddressOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(AddressOutOfRange(value))
        }
    }
}

impl fmt::Display for Rs485Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_range() {
        assert!(Rs485Address::try_from(0).is_err());
        assert_eq!(*Rs485Address::try_from(1).unwrap(), 1);
        assert_eq!(*Rs485Address::try_from(247).unwrap(), 247);
        assert_eq!(Rs485Address::try_from(248), Err(AddressOutOfRange(248)));
    }

    #[test]
    fn test_zero_address_means_direct() {
        let mut route = Route::direct("/dev/ttyUSB0");
        assert_eq!(route.bus_address(), None);
        route.rs485_address = Some(0);
        assert!(!route.is_addressed());
        assert_eq!(route.location(), Some(("/dev/ttyUSB0", None)));
    }

    #[test]
    fn test_set_rs485_address() {
        let mut route = Route::rs485("/dev/ttyS0", Rs485Address::try_from(3).unwrap());
        route.set_rs485_address(9);
        assert_eq!(route.bus_address(), Some(9));
        assert_eq!(route.to_string(), "/dev/ttyS0@rs485:9");
    }

    #[test]
    fn test_display_unreachable_route() {
        let route = Route::default().with_zigbee(2);
        assert_eq!(route.to_string(), "<unreachable>@zigbee:2");
        assert_eq!(route.location(), None);
    }
}
