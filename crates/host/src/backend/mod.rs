//! Platform backend contract
//!
//! A [`Backend`] knows how to list the buses and devices the OS currently
//! sees and how to open one of them. Each opened device is a
//! [`DeviceBackend`] that performs the actual transfers. Everything above
//! this module (descriptor caching, hotplug diffing, listener dispatch,
//! endpoint streams) is platform independent.
//!
//! All calls are synchronous and may block on the device. Errors are
//! already mapped into [`UsbError`] by the backend.

pub mod libusb;

use std::time::{Duration, SystemTime};
use usb_protocol::{ControlMessage, ErrorKind, Result, Speed, UsbError};

pub use libusb::RusbBackend;

/// Point-in-time view of the USB topology
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub buses: Vec<BusNode>,
}

/// One bus as the OS reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusNode {
    /// Platform name, stable for the lifetime of the bus (e.g. `"001"`)
    pub name: String,
    /// Bus number if the platform assigns one
    pub number: Option<u8>,
    pub devices: Vec<DeviceNode>,
}

/// One addressed device on a bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// USB address, 1..=127
    pub address: u8,
    /// Platform path or id the device can be reopened by
    pub native_id: String,
    /// Parent hub address and the port on it, when the platform knows
    pub hub: Option<(u8, u8)>,
    pub speed: Speed,
}

/// Bus name and address decoded from a native id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeAddress {
    pub bus: String,
    pub address: u8,
}

/// Host-wide half of a platform backend
pub trait Backend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Current buses and devices
    fn snapshot(&self) -> Result<Topology>;

    /// When the topology last changed, if the platform can tell cheaply
    ///
    /// The watcher skips a full scan when this has not moved past the
    /// start of the previous scan.
    fn last_changed(&self) -> Option<SystemTime> {
        None
    }

    /// Sleep between quiet scan cycles
    fn default_poll_period(&self) -> Duration {
        Duration::from_millis(750)
    }

    /// Recognise a platform-native device id
    fn parse_native_id(&self, id: &str) -> Option<NativeAddress>;

    /// Open `device` on `bus`
    fn open(&self, bus: &BusNode, device: &DeviceNode) -> Result<Box<dyn DeviceBackend>>;
}

/// One opened device
///
/// Endpoint arguments are raw `bEndpointAddress` values, direction bit
/// included.
pub trait DeviceBackend: Send + Sync {
    fn speed(&self) -> Speed;

    /// Release the OS handle; later calls may fail
    fn close(&self);

    /// Run a control transfer
    ///
    /// For reads the reply is written into [`ControlMessage::buffer_mut`];
    /// the return value is the byte count transferred.
    fn control(&self, msg: &mut ControlMessage) -> Result<usize>;

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize>;

    fn write_bulk(&self, endpoint: u8, data: &[u8]) -> Result<usize>;

    /// `Ok(None)` when no report arrived before the interrupt timeout
    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8]) -> Result<Option<usize>>;

    fn write_interrupt(&self, endpoint: u8, data: &[u8]) -> Result<usize>;

    /// Clear a stall and reset the data toggle
    fn clear_halt(&self, endpoint: u8) -> Result<()>;

    fn claim_interface(&self, interface: u8) -> Result<()>;

    fn release_interface(&self, interface: u8) -> Result<()>;

    fn set_alternate(&self, interface: u8, alternate: u8) -> Result<()>;

    /// Ask the OS to simulate an unplug and replug
    fn cycle_port(&self) -> Result<()>;

    /// `(port, address)` for each device attached to this hub
    fn enumerate_children(&self) -> Result<Vec<(u8, u8)>> {
        Err(UsbError::new(ErrorKind::Io, "enumerate children: not supported"))
    }

    /// True when an OS driver has claimed `interface`
    fn kernel_driver_active(&self, _interface: u8) -> Result<bool> {
        Ok(false)
    }
}

impl Topology {
    pub fn bus(&self, name: &str) -> Option<&BusNode> {
        self.buses.iter().find(|b| b.name == name)
    }
}

impl BusNode {
    pub fn device(&self, address: u8) -> Option<&DeviceNode> {
        self.devices.iter().find(|d| d.address == address)
    }

    /// Number of hub hops between `address` and the root hub
    ///
    /// Cycles and dangling parents stop the walk.
    pub fn depth_of(&self, address: u8) -> usize {
        let mut depth = 0;
        let mut current = self.device(address);
        while let Some((parent, _)) = current.and_then(|d| d.hub) {
            depth += 1;
            if depth > self.devices.len() {
                break;
            }
            current = self.device(parent);
        }
        depth
    }
}
