//! The host: bus table, listener registry and watcher
//!
//! A [`Host`] owns every [`Bus`] the backend reports. Topology changes are
//! found by [`Host::scan_now`], normally driven by the watcher thread. Scans
//! are serialized; listeners run on the scanning thread with no bus lock
//! held, and a scan requested from inside a listener is a no-op.

use crate::backend::{Backend, RusbBackend, libusb::Timeouts};
use crate::bus::{Bus, ScanContext, ScanSettings};
use crate::device::Device;
use crate::listener::{self, ChannelListener, UsbEvent, UsbListener};
use crate::sync::{lock, read, write};
use crate::watcher::{Watcher, WatcherState};
use common::UsbConfig;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use usb_protocol::{ErrorKind, PortIdentifier, Result, UsbError};

thread_local! {
    static SCANNING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as scanning until dropped
struct ScanGuard;

impl ScanGuard {
    fn enter() -> Self {
        SCANNING.with(|s| s.set(true));
        ScanGuard
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        SCANNING.with(|s| s.set(false));
    }
}

fn in_scan() -> bool {
    SCANNING.with(Cell::get)
}

static GLOBAL: Mutex<Option<Host>> = Mutex::new(None);

/// Entry point to the USB object model
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

pub(crate) struct HostInner {
    backend: Arc<dyn Backend>,
    settings: ScanSettings,
    poll_period: Duration,
    /// Start of the last full scan; the mutex also serializes scans
    last_scan: Mutex<Option<SystemTime>>,
    buses: RwLock<BTreeMap<String, Bus>>,
    listeners: Mutex<Vec<Arc<dyn UsbListener>>>,
    next_bus: AtomicU8,
    watcher: Mutex<Option<Watcher>>,
    shut_down: AtomicBool,
}

impl Host {
    pub(crate) fn from_inner(inner: Arc<HostInner>) -> Self {
        Self { inner }
    }

    /// The process-wide host over libusb
    ///
    /// Built on first use from [`UsbConfig::load_or_default`]. After
    /// [`Host::shutdown`] the same, shut down, host keeps being returned.
    pub fn global() -> Result<Host> {
        let mut global = lock(&GLOBAL);
        if let Some(host) = global.as_ref() {
            return Ok(host.clone());
        }
        let config = UsbConfig::load_or_default();
        let host = HostBuilder::from_config(&config)?.build()?;
        *global = Some(host.clone());
        Ok(host)
    }

    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    /// Name of the backend, for logs
    pub fn backend_name(&self) -> &str {
        self.inner.backend.name()
    }

    /// Snapshot of the bus table, ordered by platform name
    pub fn busses(&self) -> Vec<Bus> {
        read(&self.inner.buses).values().cloned().collect()
    }

    pub fn bus(&self, number: u8) -> Option<Bus> {
        read(&self.inner.buses)
            .values()
            .find(|b| b.number() == number)
            .cloned()
    }

    pub fn bus_named(&self, name: &str) -> Option<Bus> {
        read(&self.inner.buses).get(name).cloned()
    }

    /// Resolve a port identifier to a device
    ///
    /// Backend-native ids (`/dev/bus/usb/001/007`) are looked up directly.
    /// Anything else must parse as a [`PortIdentifier`] and is walked from
    /// the bus root hub through the hub ports it names.
    pub fn device(&self, port_id: &str) -> Result<Device> {
        let not_found = || UsbError::new(ErrorKind::NoDevice, format!("no device at {}", port_id));

        if let Some(native) = self.inner.backend.parse_native_id(port_id) {
            return self
                .bus_named(&native.bus)
                .and_then(|bus| bus.device(native.address))
                .ok_or_else(not_found);
        }

        let id: PortIdentifier = port_id.parse()?;
        let bus = self.bus(id.bus()).ok_or_else(not_found)?;
        let mut device = bus.root_hub().ok_or_else(not_found)?;
        for &port in id.ports() {
            device = device.child(port).ok_or_else(not_found)?;
        }
        Ok(device)
    }

    /// Register a listener; it sees changes from the next scan cycle on
    pub fn add_listener(&self, listener: Arc<dyn UsbListener>) {
        lock(&self.inner.listeners).push(listener);
    }

    /// Unregister a listener; false if it was not registered
    pub fn remove_listener(&self, listener: &Arc<dyn UsbListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        listeners.len() != before
    }

    /// Hotplug events as an async stream
    pub fn subscribe(&self) -> async_channel::Receiver<UsbEvent> {
        let (listener, rx) = ChannelListener::channel();
        self.add_listener(Arc::new(listener));
        rx
    }

    /// Run one scan cycle on this thread; true if the topology changed
    ///
    /// Fails with `Canceled` after shutdown. Returns `Ok(false)` without
    /// scanning when called from a listener.
    pub fn scan_now(&self) -> Result<bool> {
        self.inner.scan()
    }

    pub fn watcher_state(&self) -> Option<WatcherState> {
        lock(&self.inner.watcher).as_ref().map(Watcher::state)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Stop the watcher and tear down every bus
    ///
    /// Listeners see `device_removed` and `bus_removed` for everything
    /// still attached. Called from a listener, the teardown happens when
    /// the current scan finishes.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down USB host");

        let watcher = lock(&self.inner.watcher).take();
        if let Some(watcher) = watcher {
            watcher.stop(!in_scan());
        }
        if in_scan() {
            return;
        }

        let _scan = lock(&self.inner.last_scan);
        let _guard = ScanGuard::enter();
        let listeners = lock(&self.inner.listeners).clone();
        self.inner.teardown(&listeners);
    }
}

impl HostInner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Number for a newly seen bus
    ///
    /// A platform number is kept unless another bus already holds it.
    /// Otherwise the counter hands out the next free number in 1..=255,
    /// skipping `reserved` (platform numbers of buses not added yet).
    fn bus_number(&self, name: &str, platform: Option<u8>, reserved: &BTreeSet<u8>) -> Option<u8> {
        let taken: BTreeSet<u8> = read(&self.buses).values().map(|b| b.number()).collect();
        match platform {
            Some(n) if n > 0 && !taken.contains(&n) => return Some(n),
            Some(n) if n > 0 => warn!("Bus {} reports number {} already in use", name, n),
            _ => {}
        }
        for _ in 0..=u8::MAX {
            let n = self.next_bus.fetch_add(1, Ordering::SeqCst);
            if n != 0 && !taken.contains(&n) && !reserved.contains(&n) {
                return Some(n);
            }
        }
        None
    }

    /// One scan cycle: add new buses, rescan known ones, drop vanished ones
    pub(crate) fn scan(self: &Arc<Self>) -> Result<bool> {
        if in_scan() {
            return Ok(false);
        }
        let _guard = ScanGuard::enter();
        let mut last_scan = lock(&self.last_scan);
        if self.is_shut_down() {
            return Err(UsbError::new(ErrorKind::Canceled, "scan: host shut down"));
        }

        let started = SystemTime::now();
        if let (Some(last), Some(changed)) = (*last_scan, self.backend.last_changed()) {
            if changed < last {
                return Ok(false);
            }
        }
        let topology = self
            .backend
            .snapshot()
            .map_err(|e| e.context_with(format!("{} snapshot", self.backend.name())))?;
        *last_scan = Some(started);

        let listeners = lock(&self.listeners).clone();
        let ctx = ScanContext {
            backend: &*self.backend,
            settings: &self.settings,
            listeners: &listeners,
        };

        let mut reserved: BTreeSet<u8> = {
            let buses = read(&self.buses);
            topology
                .buses
                .iter()
                .filter(|node| !buses.contains_key(&node.name))
                .filter_map(|node| node.number.filter(|&n| n > 0))
                .collect()
        };

        let mut changed = false;
        for node in &topology.buses {
            let known = read(&self.buses).get(&node.name).cloned();
            let bus = match known {
                Some(bus) => bus,
                None => {
                    let Some(number) = self.bus_number(&node.name, node.number, &reserved) else {
                        error!("No bus number left for bus {}", node.name);
                        continue;
                    };
                    if node.number == Some(number) {
                        reserved.remove(&number);
                    }
                    let bus = Bus::new(Arc::downgrade(self), number, node.name.clone());
                    write(&self.buses).insert(node.name.clone(), bus.clone());
                    info!("Bus {} added", bus);
                    listener::dispatch(&listeners, &UsbEvent::BusAdded(bus.clone()));
                    changed = true;
                    bus
                }
            };
            changed |= bus.scan(node, &ctx);
        }

        let vanished: Vec<Bus> = read(&self.buses)
            .iter()
            .filter(|(name, _)| topology.bus(name).is_none())
            .map(|(_, bus)| bus.clone())
            .collect();
        for bus in vanished {
            self.remove_bus(&bus, &listeners);
            changed = true;
        }

        if self.is_shut_down() {
            // shutdown() was called from a listener during this scan
            self.teardown(&listeners);
        }

        debug!("Scan finished, changed: {}", changed);
        Ok(changed)
    }

    fn remove_bus(&self, bus: &Bus, listeners: &[Arc<dyn UsbListener>]) {
        bus.teardown(listeners);
        listener::dispatch(listeners, &UsbEvent::BusRemoved(bus.clone()));
        write(&self.buses).remove(bus.name());
        info!("Bus {} removed", bus);
    }

    fn teardown(&self, listeners: &[Arc<dyn UsbListener>]) {
        let buses: Vec<Bus> = read(&self.buses).values().cloned().collect();
        for bus in buses {
            self.remove_bus(&bus, listeners);
        }
    }
}

impl Drop for HostInner {
    fn drop(&mut self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let watcher = self
            .watcher
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(watcher) = watcher {
            watcher.stop(true);
        }
        // Devices hold their bus; break the cycle
        let buses = self.buses.get_mut().unwrap_or_else(|e| e.into_inner());
        for bus in buses.values() {
            bus.clear();
        }
        buses.clear();
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Host {}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("backend", &self.backend_name())
            .field("busses", &read(&self.inner.buses).len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Configures and starts a [`Host`]
pub struct HostBuilder {
    backend: Option<Arc<dyn Backend>>,
    timeouts: Timeouts,
    settings: ScanSettings,
    poll_period: Option<Duration>,
    listeners: Vec<Arc<dyn UsbListener>>,
    spawn_watcher: bool,
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBuilder {
    pub fn new() -> Self {
        Self {
            backend: None,
            timeouts: Timeouts::default(),
            settings: ScanSettings {
                descriptor_retries: 4,
                ..ScanSettings::default()
            },
            poll_period: None,
            listeners: Vec::new(),
            spawn_watcher: true,
        }
    }

    pub fn from_config(config: &UsbConfig) -> Result<Self> {
        Self::new().config(config)
    }

    /// Apply timeouts, poll period, retries, locale and filters from `config`
    pub fn config(mut self, config: &UsbConfig) -> Result<Self> {
        let invalid = |e: common::Error| UsbError::invalid_argument(e.to_string());
        self.settings.vendor_id = config.filters.vendor_id().map_err(invalid)?;
        self.settings.product_id = config.filters.product_id().map_err(invalid)?;
        self.settings.descriptor_retries = config.host.descriptor_retries;
        self.settings.locale = config.host.locale.clone();
        self.poll_period = Some(config.host.poll_period());
        self.timeouts = Timeouts {
            transfer: config.host.transfer_timeout(),
            interrupt: config.host.interrupt_timeout(),
        };
        Ok(self)
    }

    /// Use `backend` instead of libusb
    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Only open devices with this vendor id; hubs always pass
    pub fn vendor_filter(mut self, vendor_id: u16) -> Self {
        self.settings.vendor_id = Some(vendor_id);
        self
    }

    pub fn product_filter(mut self, product_id: u16) -> Self {
        self.settings.product_id = Some(product_id);
        self
    }

    /// Sleep between quiet scan cycles; defaults to the backend's
    pub fn poll_period(mut self, period: Duration) -> Self {
        self.poll_period = Some(period);
        self
    }

    /// Extra attempts at the device descriptor when a device is opened
    pub fn descriptor_retries(mut self, retries: u32) -> Self {
        self.settings.descriptor_retries = retries;
        self
    }

    /// Locale used to pick the default string language
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.settings.locale = Some(locale.into());
        self
    }

    /// Register a listener before the initial scan so it sees every bus
    /// and device already present
    pub fn startup_listener(mut self, listener: Arc<dyn UsbListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Whether to start the watcher thread (default true)
    pub fn spawn_watcher(mut self, spawn: bool) -> Self {
        self.spawn_watcher = spawn;
        self
    }

    /// Populate the bus table, then start the watcher
    ///
    /// Scans until the topology is quiet. A backend that reports no buses
    /// is fine; one whose snapshot fails is not.
    pub fn build(self) -> Result<Host> {
        let backend = match self.backend {
            Some(backend) => backend,
            None => Arc::new(RusbBackend::new(self.timeouts)?),
        };
        let poll_period = self
            .poll_period
            .unwrap_or_else(|| backend.default_poll_period());

        let inner = Arc::new(HostInner {
            backend,
            settings: self.settings,
            poll_period,
            last_scan: Mutex::new(None),
            buses: RwLock::new(BTreeMap::new()),
            listeners: Mutex::new(self.listeners),
            next_bus: AtomicU8::new(1),
            watcher: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        while inner.scan()? {}

        if self.spawn_watcher {
            let watcher = Watcher::spawn(Arc::downgrade(&inner), inner.poll_period)?;
            *lock(&inner.watcher) = Some(watcher);
        }

        info!(
            "USB host started on {} backend with {} bus(es)",
            inner.backend.name(),
            read(&inner.buses).len()
        );
        Ok(Host { inner })
    }
}
