//! Device handles
//!
//! A [`Device`] is a cheap, clonable handle to one addressed device on a
//! bus. Handles compare equal when they refer to the same enumeration of
//! the same device. Once the device is unplugged or closed every I/O
//! operation fails, with `NotAttached` or `NotOpen` respectively.
//!
//! Descriptor, string and configuration caches sit behind one per-device
//! mutex. Transfers do not take it.

use crate::backend::{BusNode, DeviceBackend, DeviceNode};
use crate::bus::{Bus, ScanContext};
use crate::configuration::{ConfigData, Configuration};
use crate::control;
use crate::sync::{lock, read, write};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;
use usb_protocol::control::set_configuration;
use usb_protocol::langid;
use usb_protocol::{
    ControlMessage, DeviceDescriptor, ErrorKind, PortIdentifier, Result, Speed, UsbError,
};

/// Largest chunk handed to the backend per bulk call
pub const MAX_BULK_CHUNK: usize = 4096;

#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    bus: Bus,
    address: u8,
    native_id: String,
    speed: Speed,
    descriptor: DeviceDescriptor,
    locale: Option<String>,
    handle: RwLock<Handle>,
    /// Parent hub address and port
    hub_link: RwLock<Option<(u8, u8)>>,
    state: Mutex<DeviceState>,
}

enum Handle {
    Open(Arc<dyn DeviceBackend>),
    /// `NotOpen` after `close`, `NotAttached` after unplug
    Closed(ErrorKind),
}

#[derive(Default)]
struct DeviceState {
    /// Index of the active configuration, once known
    selected: Option<u8>,
    current: Option<Arc<ConfigData>>,
    languages: Option<Vec<u16>>,
    default_language: Option<Option<u16>>,
    /// Per language; `None` marks a string the device does not have
    strings: HashMap<u16, HashMap<u8, Option<String>>>,
    num_ports: Option<u8>,
}

/// Failures that mean the device itself is gone, as opposed to a missing
/// string or an unsupported request
fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::NotOpen | ErrorKind::NotAttached | ErrorKind::NoDevice
    )
}

impl Device {
    /// Open `node` and read its device descriptor
    pub(crate) fn open(
        bus: &Bus,
        bus_node: &BusNode,
        node: &DeviceNode,
        ctx: &ScanContext<'_>,
    ) -> Result<Device> {
        let backend: Arc<dyn DeviceBackend> = Arc::from(ctx.backend.open(bus_node, node)?);
        let descriptor =
            match control::fetch_device_descriptor(&*backend, ctx.settings.descriptor_retries) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    backend.close();
                    return Err(e.context_with(format!("get device descriptor {}", node.native_id)));
                }
            };

        let speed = match backend.speed() {
            Speed::Unknown => node.speed,
            speed => speed,
        };

        Ok(Device {
            inner: Arc::new(DeviceInner {
                bus: bus.clone(),
                address: node.address,
                native_id: node.native_id.clone(),
                speed,
                descriptor,
                locale: ctx.settings.locale.clone(),
                handle: RwLock::new(Handle::Open(backend)),
                hub_link: RwLock::new(node.hub),
                state: Mutex::new(DeviceState::default()),
            }),
        })
    }

    fn backend(&self, op: &str) -> Result<Arc<dyn DeviceBackend>> {
        match &*read(&self.inner.handle) {
            Handle::Open(backend) => Ok(backend.clone()),
            Handle::Closed(ErrorKind::NotAttached) => Err(UsbError::new(
                ErrorKind::NotAttached,
                format!("{}: {} unplugged", op, self.inner.native_id),
            )),
            Handle::Closed(kind) => Err(UsbError::new(
                *kind,
                format!("{}: {} closed", op, self.inner.native_id),
            )),
        }
    }

    fn shut(&self, kind: ErrorKind) {
        let previous = std::mem::replace(&mut *write(&self.inner.handle), Handle::Closed(kind));
        if let Handle::Open(backend) = previous {
            backend.close();
        }
    }

    /// Mark the device unplugged and drop the OS handle
    pub(crate) fn detach(&self) {
        self.shut(ErrorKind::NotAttached);
        debug!("Detached {}", self.inner.native_id);
    }

    /// Close the device; closing twice is a no-op
    ///
    /// A closed device disappears from [`Bus::devices`]. Its removal is
    /// still reported when it is unplugged.
    pub fn close(&self) {
        if self.is_open() {
            self.shut(ErrorKind::NotOpen);
            debug!("Closed {}", self.inner.native_id);
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*read(&self.inner.handle), Handle::Open(_))
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    /// USB address, 1..=127
    pub fn address(&self) -> u8 {
        self.inner.address
    }

    /// Platform id the device can be found again by
    pub fn native_id(&self) -> &str {
        &self.inner.native_id
    }

    pub fn speed(&self) -> Speed {
        self.inner.speed
    }

    pub fn device_descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    pub fn is_hub(&self) -> bool {
        self.inner.descriptor.is_hub()
    }

    pub(crate) fn hub_link(&self) -> Option<(u8, u8)> {
        *read(&self.inner.hub_link)
    }

    pub(crate) fn set_hub_link(&self, link: Option<(u8, u8)>) {
        *write(&self.inner.hub_link) = link;
    }

    /// The hub this device is plugged into; `None` for a root hub
    pub fn hub(&self) -> Option<Device> {
        let (parent, _) = self.hub_link()?;
        self.bus().lookup(parent)
    }

    /// Port number on the parent hub
    pub fn hub_port(&self) -> Option<u8> {
        self.hub_link().map(|(_, port)| port)
    }

    /// The device plugged into `port` of this hub
    pub fn child(&self, port: u8) -> Option<Device> {
        self.bus()
            .devices()
            .into_iter()
            .find(|d| d.hub_link() == Some((self.address(), port)))
    }

    /// Downstream port count from the hub descriptor; 0 for non-hubs
    pub fn num_ports(&self) -> Result<u8> {
        if !self.is_hub() {
            return Ok(0);
        }
        let backend = self.backend("get hub descriptor")?;
        let mut state = lock(&self.inner.state);
        if let Some(ports) = state.num_ports {
            return Ok(ports);
        }
        let ports = control::fetch_hub_ports(&*backend, self.speed())?;
        state.num_ports = Some(ports);
        Ok(ports)
    }

    /// Topological path from the root hub to this device
    pub fn port_identifier(&self) -> Result<PortIdentifier> {
        let mut ports = Vec::new();
        let mut current = self.clone();
        while let Some((parent, port)) = current.hub_link() {
            ports.push(port);
            if ports.len() > usb_protocol::port::MAX_TIERS {
                return Err(UsbError::new(
                    ErrorKind::Io,
                    format!("port identifier {}: hub chain too deep", self.native_id()),
                ));
            }
            current = self.bus().lookup(parent).ok_or_else(|| {
                UsbError::new(
                    ErrorKind::NoDevice,
                    format!("port identifier {}: hub {} gone", self.native_id(), parent),
                )
            })?;
        }
        if !current.is_hub() {
            return Err(UsbError::new(
                ErrorKind::Io,
                format!("port identifier {}: no path to a root hub", self.native_id()),
            ));
        }
        ports.reverse();
        PortIdentifier::new(self.bus().number(), &ports)
    }

    /// Run a control request against endpoint zero
    pub fn control(&self, msg: &mut ControlMessage) -> Result<usize> {
        let backend = self.backend("control")?;
        control::execute(&*backend, msg)
    }

    /// The active configuration
    ///
    /// Single-configuration devices use index 0 without asking. Otherwise
    /// GET_CONFIGURATION is issued once and its reply byte is used as the
    /// descriptor index.
    pub fn configuration(&self) -> Result<Configuration> {
        let backend = self.backend("get configuration")?;
        let mut state = lock(&self.inner.state);
        if let Some(data) = &state.current {
            return Ok(Configuration::new(data.clone(), self.clone()));
        }

        let index = match state.selected {
            Some(index) => index,
            None => {
                let index = if self.inner.descriptor.num_configurations() <= 1 {
                    0
                } else {
                    control::fetch_configuration_index(&*backend)?
                };
                state.selected = Some(index);
                index
            }
        };
        self.check_index(index)?;

        let data = Arc::new(ConfigData::fetch(&*backend, index)?);
        state.current = Some(data.clone());
        Ok(Configuration::new(data, self.clone()))
    }

    /// Configuration `index`, whether or not it is active
    pub fn configuration_at(&self, index: u8) -> Result<Configuration> {
        self.check_index(index)?;
        let backend = self.backend("get configuration")?;
        {
            let state = lock(&self.inner.state);
            if let Some(data) = state.current.as_ref().filter(|d| d.index() == index) {
                return Ok(Configuration::new(data.clone(), self.clone()));
            }
        }
        let data = Arc::new(ConfigData::fetch(&*backend, index)?);
        let mut state = lock(&self.inner.state);
        if state.selected == Some(index) && state.current.is_none() {
            state.current = Some(data.clone());
        }
        Ok(Configuration::new(data, self.clone()))
    }

    fn check_index(&self, index: u8) -> Result<()> {
        let count = self.inner.descriptor.num_configurations();
        if index >= count.max(1) {
            return Err(UsbError::new(
                ErrorKind::ConfigNotFound,
                format!(
                    "{}: configuration {} of {}",
                    self.native_id(),
                    index,
                    count
                ),
            ));
        }
        Ok(())
    }

    /// Issue SET_CONFIGURATION
    ///
    /// Dangerous: every interface claim on the device, by any process, is
    /// invalidated.
    pub fn set_configuration(&self, index: u8) -> Result<()> {
        let backend = self.backend("set configuration")?;
        let mut state = lock(&self.inner.state);
        state.current = None;
        control::execute(&*backend, &mut set_configuration(index))?;
        state.selected = Some(index);
        debug!("{}: configuration set to {}", self.native_id(), index);
        Ok(())
    }

    /// LANGIDs from string descriptor zero
    ///
    /// Fetched once; a device without a string table yields an empty list.
    pub fn languages(&self) -> Result<Vec<u16>> {
        let backend = self.backend("get languages")?;
        let mut state = lock(&self.inner.state);
        self.languages_locked(&*backend, &mut state)
    }

    fn languages_locked(
        &self,
        backend: &dyn DeviceBackend,
        state: &mut DeviceState,
    ) -> Result<Vec<u16>> {
        if let Some(languages) = &state.languages {
            return Ok(languages.clone());
        }
        let languages = match control::fetch_languages(backend) {
            Ok(languages) => languages,
            Err(e) if is_disconnect(e.kind()) => return Err(e),
            Err(e) => {
                debug!("{}: no string table ({})", self.native_id(), e);
                Vec::new()
            }
        };
        state.languages = Some(languages.clone());
        Ok(languages)
    }

    /// String `id` in the default language
    ///
    /// The default language is picked once: an exact match on the host
    /// locale, else a primary-language match, else the first listed.
    /// `Ok(None)` for index 0, for devices without strings, and for
    /// strings the device does not have.
    pub fn string(&self, id: u8) -> Result<Option<String>> {
        if id == 0 {
            return Ok(None);
        }
        let backend = self.backend("get string")?;
        let mut state = lock(&self.inner.state);
        let lang = match state.default_language {
            Some(lang) => lang,
            None => {
                let languages = self.languages_locked(&*backend, &mut state)?;
                let locale = self
                    .inner
                    .locale
                    .clone()
                    .or_else(langid::locale_from_env);
                let lang = langid::choose_language(&languages, locale.as_deref());
                state.default_language = Some(lang);
                lang
            }
        };
        match lang {
            Some(lang) => self.string_locked(&*backend, &mut state, id, lang),
            None => Ok(None),
        }
    }

    /// String `id` in language `lang_id`, bypassing the default language
    pub fn string_in(&self, id: u8, lang_id: u16) -> Result<Option<String>> {
        if id == 0 {
            return Ok(None);
        }
        let backend = self.backend("get string")?;
        let mut state = lock(&self.inner.state);
        self.string_locked(&*backend, &mut state, id, lang_id)
    }

    fn string_locked(
        &self,
        backend: &dyn DeviceBackend,
        state: &mut DeviceState,
        id: u8,
        lang_id: u16,
    ) -> Result<Option<String>> {
        if let Some(cached) = state.strings.get(&lang_id).and_then(|s| s.get(&id)) {
            return Ok(cached.clone());
        }
        let value = match control::fetch_string(backend, id, lang_id) {
            Ok(s) => Some(s),
            Err(e) if is_disconnect(e.kind()) => return Err(e),
            Err(e) => {
                debug!(
                    "{}: string {} lang {:#06x} unavailable ({})",
                    self.native_id(),
                    id,
                    lang_id,
                    e
                );
                None
            }
        };
        state
            .strings
            .entry(lang_id)
            .or_default()
            .insert(id, value.clone());
        Ok(value)
    }

    pub fn manufacturer(&self) -> Result<Option<String>> {
        self.string(self.inner.descriptor.manufacturer_index())
    }

    pub fn product(&self) -> Result<Option<String>> {
        self.string(self.inner.descriptor.product_index())
    }

    pub fn serial_number(&self) -> Result<Option<String>> {
        self.string(self.inner.descriptor.serial_index())
    }

    /// Bulk IN, split into transfers of at most [`MAX_BULK_CHUNK`]
    ///
    /// A short transfer ends the loop; the total read is returned.
    pub fn read_bulk(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        let backend = self.backend("bulk read")?;
        let mut total = 0;
        for chunk in buf.chunks_mut(MAX_BULK_CHUNK) {
            let want = chunk.len();
            let n = backend.read_bulk(endpoint, chunk)?;
            total += n;
            if n < want {
                break;
            }
        }
        Ok(total)
    }

    /// Bulk OUT, split into transfers of at most [`MAX_BULK_CHUNK`]
    pub fn write_bulk(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        let backend = self.backend("bulk write")?;
        for chunk in data.chunks(MAX_BULK_CHUNK) {
            let mut offset = 0;
            while offset < chunk.len() {
                let n = backend.write_bulk(endpoint, &chunk[offset..])?;
                if n == 0 {
                    return Err(UsbError::new(
                        ErrorKind::Underrun,
                        format!("bulk write {:#04x}: device accepted nothing", endpoint),
                    ));
                }
                offset += n;
            }
        }
        Ok(data.len())
    }

    /// One interrupt IN transfer; `Ok(None)` on timeout
    pub fn read_interrupt(&self, endpoint: u8, buf: &mut [u8]) -> Result<Option<usize>> {
        self.backend("interrupt read")?.read_interrupt(endpoint, buf)
    }

    pub fn write_interrupt(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        self.backend("interrupt write")?.write_interrupt(endpoint, data)
    }

    pub fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.backend("clear halt")?.clear_halt(endpoint)
    }

    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        self.backend("claim interface")?.claim_interface(interface)
    }

    pub fn release_interface(&self, interface: u8) -> Result<()> {
        self.backend("release interface")?.release_interface(interface)
    }

    pub fn set_alternate(&self, interface: u8, alternate: u8) -> Result<()> {
        self.backend("set alternate setting")?.set_alternate(interface, alternate)
    }

    /// True when an OS driver holds `interface`
    pub fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        self.backend("kernel driver query")?
            .kernel_driver_active(interface)
    }

    /// Ask the OS to simulate an unplug and replug
    ///
    /// Firmware loaders use this to make a device renumerate. The device
    /// comes back as a new [`Device`].
    pub fn cycle_port(&self) -> Result<()> {
        self.backend("cycle port")?.cycle_port()
    }

    /// `(port, address)` pairs reported by a hub's backend
    pub(crate) fn enumerate_children(&self) -> Result<Vec<(u8, u8)>> {
        self.backend("enumerate children")?.enumerate_children()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("bus", &self.bus().name())
            .field("address", &self.address())
            .field("native_id", &self.native_id())
            .finish()
    }
}

/// `{<native id> <product>}`; reads the product string if not cached
impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.product() {
            Ok(Some(product)) => write!(f, "{{{} {}}}", self.native_id(), product),
            Ok(None) => write!(f, "{{{}}}", self.native_id()),
            Err(e) => {
                debug!("{}: product string: {}", self.native_id(), e);
                write!(f, "{{{}}}", self.native_id())
            }
        }
    }
}
