//! Bus handles and per-bus device diffing

use crate::backend::{Backend, BusNode};
use crate::device::Device;
use crate::host::{Host, HostInner};
use crate::listener::{self, UsbEvent, UsbListener};
use crate::sync::{read, write};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, info, warn};
use usb_protocol::descriptor::CLASS_HUB;

/// Settings a scan needs when it opens new devices
#[derive(Debug, Clone, Default)]
pub(crate) struct ScanSettings {
    pub(crate) vendor_id: Option<u16>,
    pub(crate) product_id: Option<u16>,
    pub(crate) descriptor_retries: u32,
    pub(crate) locale: Option<String>,
}

impl ScanSettings {
    /// Hubs always pass so the topology below them stays walkable
    fn accepts(&self, device: &Device) -> bool {
        let desc = device.device_descriptor();
        if desc.class() == CLASS_HUB {
            return true;
        }
        self.vendor_id.is_none_or(|v| v == desc.vendor_id())
            && self.product_id.is_none_or(|p| p == desc.product_id())
    }
}

/// Everything one scan cycle shares across buses
pub(crate) struct ScanContext<'a> {
    pub(crate) backend: &'a dyn Backend,
    pub(crate) settings: &'a ScanSettings,
    /// Snapshot taken at the start of the cycle
    pub(crate) listeners: &'a [Arc<dyn UsbListener>],
}

/// One USB bus
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    host: Weak<HostInner>,
    number: u8,
    name: String,
    state: RwLock<BusState>,
}

#[derive(Default)]
struct BusState {
    /// Addressed devices, 1..=127
    devices: BTreeMap<u8, Device>,
    /// Addresses that failed to open or were filtered out
    ignored: BTreeSet<u8>,
    root_hub: Option<u8>,
}

impl Bus {
    pub(crate) fn new(host: Weak<HostInner>, number: u8, name: String) -> Self {
        Self {
            inner: Arc::new(BusInner {
                host,
                number,
                name,
                state: RwLock::new(BusState::default()),
            }),
        }
    }

    /// Bus number, 1 or more
    pub fn number(&self) -> u8 {
        self.inner.number
    }

    /// Platform name, e.g. `"001"`
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Topological id of the bus root, `usb-<number>`
    pub fn bus_id(&self) -> String {
        format!("usb-{}", self.inner.number)
    }

    /// The owning host, unless it has been dropped
    pub fn host(&self) -> Option<Host> {
        self.inner.host.upgrade().map(Host::from_inner)
    }

    pub fn root_hub(&self) -> Option<Device> {
        let address = read(&self.inner.state).root_hub?;
        self.device(address)
    }

    /// The open device at `address`
    pub fn device(&self, address: u8) -> Option<Device> {
        self.lookup(address).filter(Device::is_open)
    }

    /// Open devices in address order
    pub fn devices(&self) -> Vec<Device> {
        read(&self.inner.state)
            .devices
            .values()
            .filter(|d| d.is_open())
            .cloned()
            .collect()
    }

    /// Table entry at `address`, closed or not
    pub(crate) fn lookup(&self, address: u8) -> Option<Device> {
        read(&self.inner.state).devices.get(&address).cloned()
    }

    /// Diff the device table against `node`; true if anything changed
    pub(crate) fn scan(&self, node: &BusNode, ctx: &ScanContext<'_>) -> bool {
        let removed = {
            let mut state = write(&self.inner.state);
            let gone: Vec<u8> = state
                .devices
                .keys()
                .copied()
                .filter(|address| node.device(*address).is_none())
                .collect();
            state.ignored.retain(|address| node.device(*address).is_some());
            let removed: Vec<Device> = gone
                .iter()
                .filter_map(|address| state.devices.remove(address))
                .collect();
            if state.root_hub.is_some_and(|a| gone.contains(&a)) {
                state.root_hub = None;
            }
            removed
        };

        for device in &removed {
            device.detach();
            debug!("Device {} removed from bus {}", device.native_id(), self.name());
            listener::dispatch(ctx.listeners, &UsbEvent::DeviceRemoved(device.clone()));
        }

        let mut fresh: Vec<_> = {
            let state = read(&self.inner.state);
            node.devices
                .iter()
                .filter(|d| d.address != 0)
                .filter(|d| !state.devices.contains_key(&d.address))
                .filter(|d| !state.ignored.contains(&d.address))
                .collect()
        };
        // Hubs before whatever hangs off them
        fresh.sort_by_key(|d| (node.depth_of(d.address), d.address));

        let mut added = Vec::new();
        let mut ignored = Vec::new();
        for dev_node in fresh {
            match Device::open(self, node, dev_node, ctx) {
                Ok(device) if ctx.settings.accepts(&device) => added.push(device),
                Ok(device) => {
                    debug!("Filtered out {}", device.native_id());
                    device.close();
                    ignored.push(dev_node.address);
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", dev_node.native_id, e);
                    ignored.push(dev_node.address);
                }
            }
        }

        {
            let mut state = write(&self.inner.state);
            state.ignored.extend(ignored);
            for device in &added {
                state.devices.insert(device.address(), device.clone());
            }
        }

        for hub in added.iter().filter(|d| d.is_hub()) {
            self.link_children(hub);
        }
        self.update_root_hub();

        for device in &added {
            debug!("Device {} added to bus {}", device.native_id(), self.name());
            listener::dispatch(ctx.listeners, &UsbEvent::DeviceAdded(device.clone()));
        }

        !removed.is_empty() || !added.is_empty()
    }

    /// Fill in parent links the snapshot did not carry
    fn link_children(&self, hub: &Device) {
        let linked = read(&self.inner.state)
            .devices
            .values()
            .any(|d| d.hub_link().is_some_and(|(parent, _)| parent == hub.address()));
        if linked {
            return;
        }
        match hub.enumerate_children() {
            Ok(children) => {
                for (port, address) in children {
                    if let Some(child) = self.lookup(address).filter(|c| c.hub_link().is_none()) {
                        child.set_hub_link(Some((hub.address(), port)));
                    }
                }
            }
            Err(e) => debug!("Hub {} children unknown: {}", hub.native_id(), e),
        }
    }

    fn update_root_hub(&self) {
        let mut state = write(&self.inner.state);
        let root = state
            .devices
            .values()
            .find(|d| d.hub_link().is_none() && d.is_hub())
            .map(Device::address);
        if root != state.root_hub {
            debug!("Bus {} root hub: {:?}", self.name(), root);
            state.root_hub = root;
        }
    }

    /// Detach every device, announcing each removal
    pub(crate) fn teardown(&self, listeners: &[Arc<dyn UsbListener>]) {
        let devices = {
            let mut state = write(&self.inner.state);
            state.root_hub = None;
            state.ignored.clear();
            std::mem::take(&mut state.devices)
        };
        for device in devices.into_values().rev() {
            device.detach();
            listener::dispatch(listeners, &UsbEvent::DeviceRemoved(device));
        }
        info!("Bus {} torn down", self.name());
    }

    /// Detach every device without notifying anyone
    pub(crate) fn clear(&self) {
        let devices = std::mem::take(&mut write(&self.inner.state).devices);
        for device in devices.into_values() {
            device.detach();
        }
    }
}

impl PartialEq for Bus {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Bus {}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("number", &self.number())
            .field("name", &self.name())
            .finish()
    }
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.bus_id(), self.name())
    }
}
