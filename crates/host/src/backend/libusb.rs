//! libusb backend via rusb
//!
//! Topology comes from `libusb_get_device_list`, so the watcher polls it.
//! Devices are named the way usbfs names them, `/dev/bus/usb/BBB/DDD`.

use super::{Backend, BusNode, DeviceBackend, DeviceNode, NativeAddress, Topology};
use common::UsbConfig;
use rusb::{Context, DeviceHandle, UsbContext};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};
use usb_protocol::control::SET_CONFIGURATION;
use usb_protocol::{ControlMessage, ErrorKind, Result, Speed, UsbError};

const NATIVE_PREFIX: &str = "/dev/bus/usb/";

/// Per-call deadlines handed to libusb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Control and bulk transfers
    pub transfer: Duration,
    /// Interrupt reads; expiry reads as "no report"
    pub interrupt: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            transfer: Duration::from_secs(10),
            interrupt: Duration::from_millis(1000),
        }
    }
}

pub struct RusbBackend {
    context: Context,
    timeouts: Timeouts,
}

impl RusbBackend {
    pub fn new(timeouts: Timeouts) -> Result<Self> {
        let context = Context::new().map_err(|e| map_rusb_error(e, "libusb init"))?;
        Ok(Self { context, timeouts })
    }

    pub fn from_config(config: &UsbConfig) -> Result<Self> {
        Self::new(Timeouts {
            transfer: config.host.transfer_timeout(),
            interrupt: config.host.interrupt_timeout(),
        })
    }

    fn find(&self, bus: u8, address: u8) -> Result<rusb::Device<Context>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| map_rusb_error(e, "list devices"))?;
        devices
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
            .ok_or_else(|| {
                UsbError::new(
                    ErrorKind::NoDevice,
                    format!("open {}", native_id(bus, address)),
                )
            })
    }
}

fn native_id(bus: u8, address: u8) -> String {
    format!("{}{:03}/{:03}", NATIVE_PREFIX, bus, address)
}

impl Backend for RusbBackend {
    fn name(&self) -> &str {
        "libusb"
    }

    fn snapshot(&self) -> Result<Topology> {
        let devices = self
            .context
            .devices()
            .map_err(|e| map_rusb_error(e, "list devices"))?;

        let mut buses: BTreeMap<u8, Vec<DeviceNode>> = BTreeMap::new();
        for device in devices.iter() {
            let address = device.address();
            if address == 0 {
                continue;
            }
            let hub = device
                .get_parent()
                .map(|parent| (parent.address(), device.port_number()));
            buses
                .entry(device.bus_number())
                .or_default()
                .push(DeviceNode {
                    address,
                    native_id: native_id(device.bus_number(), address),
                    hub,
                    speed: map_speed(device.speed()),
                });
        }

        Ok(Topology {
            buses: buses
                .into_iter()
                .map(|(number, devices)| BusNode {
                    name: format!("{:03}", number),
                    number: Some(number),
                    devices,
                })
                .collect(),
        })
    }

    fn parse_native_id(&self, id: &str) -> Option<NativeAddress> {
        let rest = id.strip_prefix(NATIVE_PREFIX)?;
        let (bus, address) = rest.split_once('/')?;
        let bus: u8 = bus.parse().ok()?;
        let address: u8 = address.parse().ok()?;
        Some(NativeAddress {
            bus: format!("{:03}", bus),
            address,
        })
    }

    fn open(&self, bus: &BusNode, node: &DeviceNode) -> Result<Box<dyn DeviceBackend>> {
        let number = match bus.number {
            Some(n) => n,
            None => bus
                .name
                .parse()
                .map_err(|_| UsbError::invalid_argument(format!("bus name {:?}", bus.name)))?,
        };
        let device = self.find(number, node.address)?;
        let handle = device
            .open()
            .map_err(|e| map_rusb_error(e, format!("open {}", node.native_id)))?;

        debug!("Opened {}", node.native_id);
        Ok(Box::new(RusbDevice {
            native_id: node.native_id.clone(),
            speed: map_speed(device.speed()),
            handle: RwLock::new(Some(handle)),
            timeouts: self.timeouts,
        }))
    }
}

/// An opened libusb device
///
/// rusb wants `&mut` for claim/release/reset, so those take the write lock
/// while transfers share the read lock.
struct RusbDevice {
    native_id: String,
    speed: Speed,
    handle: RwLock<Option<DeviceHandle<Context>>>,
    timeouts: Timeouts,
}

impl RusbDevice {
    fn with_handle<T>(
        &self,
        op: &str,
        f: impl FnOnce(&DeviceHandle<Context>) -> rusb::Result<T>,
    ) -> Result<T> {
        let guard = self.handle.read().unwrap_or_else(|e| e.into_inner());
        let handle = guard.as_ref().ok_or_else(|| UsbError::not_open(op))?;
        f(handle).map_err(|e| map_rusb_error(e, op))
    }

    fn with_handle_mut<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut DeviceHandle<Context>) -> rusb::Result<T>,
    ) -> Result<T> {
        let mut guard = self.handle.write().unwrap_or_else(|e| e.into_inner());
        let handle = guard.as_mut().ok_or_else(|| UsbError::not_open(op))?;
        f(handle).map_err(|e| map_rusb_error(e, op))
    }
}

impl DeviceBackend for RusbDevice {
    fn speed(&self) -> Speed {
        self.speed
    }

    fn close(&self) {
        let mut guard = self.handle.write().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            debug!("Closed {}", self.native_id);
        }
    }

    fn control(&self, msg: &mut ControlMessage) -> Result<usize> {
        let timeout = self.timeouts.transfer;
        let (request_type, request, value, index) =
            (msg.request_type(), msg.request(), msg.value(), msg.index());

        // libusb keeps its own idea of the active configuration
        if !msg.is_read() && msg.is_standard_device() && request == SET_CONFIGURATION {
            let config = u8::try_from(value)
                .map_err(|_| UsbError::invalid_argument("set configuration: value > 255"))?;
            return self
                .with_handle_mut("set configuration", |h| h.set_active_configuration(config))
                .map(|()| 0);
        }

        if msg.is_read() {
            let buf = msg.buffer_mut();
            self.with_handle("control read", |h| {
                h.read_control(request_type, request, value, index, buf, timeout)
            })
        } else {
            let data = msg.data();
            self.with_handle("control write", |h| {
                h.write_control(request_type, request, value, index, data, timeout)
            })
        }
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.timeouts.transfer;
        self.with_handle("bulk read", |h| h.read_bulk(endpoint, buf, timeout))
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        let timeout = self.timeouts.transfer;
        self.with_handle("bulk write", |h| h.write_bulk(endpoint, data, timeout))
    }

    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8]) -> Result<Option<usize>> {
        let timeout = self.timeouts.interrupt;
        let guard = self.handle.read().unwrap_or_else(|e| e.into_inner());
        let handle = guard
            .as_ref()
            .ok_or_else(|| UsbError::not_open("interrupt read"))?;
        match handle.read_interrupt(endpoint, buf, timeout) {
            Ok(n) => Ok(Some(n)),
            Err(rusb::Error::Timeout) => Ok(None),
            Err(e) => Err(map_rusb_error(e, "interrupt read")),
        }
    }

    fn write_interrupt(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        let timeout = self.timeouts.transfer;
        self.with_handle("interrupt write", |h| {
            h.write_interrupt(endpoint, data, timeout)
        })
    }

    fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.with_handle_mut("clear halt", |h| h.clear_halt(endpoint))
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        self.with_handle_mut("claim interface", |h| match h.claim_interface(interface) {
            Err(rusb::Error::Busy) => {
                debug!(
                    "Interface {} on {} busy, detaching kernel driver",
                    interface, self.native_id
                );
                if let Err(e) = h.detach_kernel_driver(interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                }
                h.claim_interface(interface)
            }
            other => other,
        })
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        self.with_handle_mut("release interface", |h| h.release_interface(interface))
    }

    fn set_alternate(&self, interface: u8, alternate: u8) -> Result<()> {
        self.with_handle_mut("set alternate setting", |h| {
            h.set_alternate_setting(interface, alternate)
        })
    }

    fn cycle_port(&self) -> Result<()> {
        self.with_handle_mut("cycle port", |h| h.reset())
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        self.with_handle("kernel driver query", |h| {
            h.kernel_driver_active(interface)
        })
    }
}

/// Map a rusb error to the portable taxonomy, keeping the libusb code
pub fn map_rusb_error(err: rusb::Error, context: impl Into<String>) -> UsbError {
    let (kind, code) = match err {
        rusb::Error::Io => (ErrorKind::Io, -1),
        rusb::Error::InvalidParam => (ErrorKind::InvalidArgument, -2),
        rusb::Error::Access => (ErrorKind::AccessDenied, -3),
        rusb::Error::NoDevice => (ErrorKind::NotAttached, -4),
        rusb::Error::NotFound => (ErrorKind::NoDevice, -5),
        rusb::Error::Busy => (ErrorKind::AccessDenied, -6),
        rusb::Error::Timeout => (ErrorKind::Timeout, -7),
        rusb::Error::Overflow => (ErrorKind::Overrun, -8),
        rusb::Error::Pipe => (ErrorKind::Stalled, -9),
        rusb::Error::Interrupted => (ErrorKind::Canceled, -10),
        rusb::Error::NoMem => (ErrorKind::Io, -11),
        rusb::Error::NotSupported => (ErrorKind::Io, -12),
        _ => (ErrorKind::Io, -99),
    };
    UsbError::with_code(kind, code, context)
}

fn map_speed(speed: rusb::Speed) -> Speed {
    match speed {
        rusb::Speed::Low => Speed::Low,
        rusb::Speed::Full => Speed::Full,
        rusb::Speed::High => Speed::High,
        rusb::Speed::Super => Speed::Super,
        rusb::Speed::SuperPlus => Speed::SuperPlus,
        _ => Speed::Unknown,
    }
}
