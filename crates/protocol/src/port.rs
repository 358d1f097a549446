//! Topological port identifiers
//!
//! A USB address changes every time a device is re-enumerated, but the
//! physical path from the bus root hub does not. `usb-3-1.4` names the
//! device plugged into port 4 of the hub on port 1 of bus 3's root hub;
//! `usb-3` names the root hub itself.

use crate::error::UsbError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str};

const PREFIX: &str = "usb-";

/// USB 2.0 allows five hubs between the root hub and a function, and the
/// path includes the root hub port; seven tiers is the hard ceiling.
pub const MAX_TIERS: usize = 7;

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PortIdentifier {
    bus: u8,
    ports: Vec<u8>,
}

impl PortIdentifier {
    /// The root hub of `bus`
    pub fn root(bus: u8) -> Result<Self, UsbError> {
        if bus == 0 {
            return Err(UsbError::invalid_argument("bus number 0 in port identifier"));
        }
        Ok(Self {
            bus,
            ports: Vec::new(),
        })
    }

    pub fn new(bus: u8, ports: &[u8]) -> Result<Self, UsbError> {
        let mut id = Self::root(bus)?;
        for &port in ports {
            id = id.child(port)?;
        }
        Ok(id)
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// Hub port numbers from the root hub downward
    pub fn ports(&self) -> &[u8] {
        &self.ports
    }

    /// Number of hub hops below the root hub
    pub fn depth(&self) -> usize {
        self.ports.len()
    }

    pub fn is_root(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn child(&self, port: u8) -> Result<Self, UsbError> {
        if port == 0 {
            return Err(UsbError::invalid_argument("port 0 in port identifier"));
        }
        if self.ports.len() >= MAX_TIERS {
            return Err(UsbError::invalid_argument(format!(
                "port identifier deeper than {} tiers",
                MAX_TIERS
            )));
        }
        let mut ports = self.ports.clone();
        ports.push(port);
        Ok(Self {
            bus: self.bus,
            ports,
        })
    }

    /// The hub this port hangs off, and the port number on that hub
    pub fn parent(&self) -> Option<(Self, u8)> {
        let (&last, rest) = self.ports.split_last()?;
        Some((
            Self {
                bus: self.bus,
                ports: rest.to_vec(),
            },
            last,
        ))
    }
}

impl fmt::Display for PortIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX, self.bus)?;
        for (i, port) in self.ports.iter().enumerate() {
            let sep = if i == 0 { '-' } else { '.' };
            write!(f, "{}{}", sep, port)?;
        }
        Ok(())
    }
}

impl str::FromStr for PortIdentifier {
    type Err = UsbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad =
            |why: &str| UsbError::invalid_argument(format!("port identifier {:?}: {}", s, why));
        let rest = s.strip_prefix(PREFIX).ok_or_else(|| bad("missing usb- prefix"))?;
        let (bus, path) = match rest.split_once('-') {
            Some((bus, path)) => (bus, Some(path)),
            None => (rest, None),
        };
        let bus: u8 = bus.parse().map_err(|_| bad("bad bus number"))?;
        let mut id = Self::root(bus).map_err(|_| bad("bus number 0"))?;
        if let Some(path) = path {
            for part in path.split('.') {
                let port: u8 = part.parse().map_err(|_| bad("bad port number"))?;
                id = id.child(port).map_err(|e| bad(e.context()))?;
            }
        }
        Ok(id)
    }
}

impl Serialize for PortIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(PortIdentifier::root(3).unwrap().to_string(), "usb-3");
        assert_eq!(PortIdentifier::new(3, &[1]).unwrap().to_string(), "usb-3-1");
        assert_eq!(
            PortIdentifier::new(3, &[1, 4, 2]).unwrap().to_string(),
            "usb-3-1.4.2"
        );
    }

    #[test]
    fn test_parse() {
        let id: PortIdentifier = "usb-12-2.3".parse().unwrap();
        assert_eq!(id.bus(), 12);
        assert_eq!(id.ports(), &[2, 3]);
        let root: PortIdentifier = "usb-1".parse().unwrap();
        assert!(root.is_root());
    }

    #[test]
    fn test_parse_rejects_junk() {
        for bad in [
            "", "usb", "usb-", "usb-0", "usb-1-0", "usb-1-", "usb-1-2..3", "hub-1-2", "usb-x",
            "usb-1-2.300", "usb-1-1.1.1.1.1.1.1.1",
        ] {
            assert!(bad.parse::<PortIdentifier>().is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn test_max_depth() {
        let id = PortIdentifier::new(1, &[1; MAX_TIERS]).unwrap();
        assert!(id.child(1).is_err());
    }

    #[test]
    fn test_parent_child() {
        let id = PortIdentifier::new(2, &[1, 4]).unwrap();
        let (parent, port) = id.parent().unwrap();
        assert_eq!(parent.to_string(), "usb-2-1");
        assert_eq!(port, 4);
        assert_eq!(parent.child(4).unwrap(), id);
        assert!(PortIdentifier::root(2).unwrap().parent().is_none());
    }

    #[test]
    fn test_serde_as_string() {
        let id = PortIdentifier::new(1, &[3]).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"usb-1-3\"");
        let back: PortIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
