//! Test helpers: a scriptable in-memory backend and descriptor builders
//!
//! [`MockBackend`] answers the standard requests from canned descriptors,
//! queues bulk and interrupt data, injects failures and logs every call,
//! so the object model can be exercised without hardware.

use crate::backend::{Backend, BusNode, DeviceBackend, DeviceNode, NativeAddress, Topology};
use crate::bus::Bus;
use crate::device::Device;
use crate::listener::UsbListener;
use crate::sync::lock;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use usb_protocol::control::{GET_CONFIGURATION, GET_DESCRIPTOR, SET_CONFIGURATION};
use usb_protocol::descriptor::{
    CLASS_HUB, DESCRIPTOR_TYPE_CONFIGURATION, DESCRIPTOR_TYPE_DEVICE, DESCRIPTOR_TYPE_HUB,
    DESCRIPTOR_TYPE_STRING, DESCRIPTOR_TYPE_SUPERSPEED_HUB,
};
use usb_protocol::{ControlMessage, ErrorKind, Result, Speed, UsbError};

const NATIVE_PREFIX: &str = "mock:";

// ============================================================================
// Descriptor builders
// ============================================================================

/// Builds a configuration blob, filling in the counts and `wTotalLength`
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    value: u8,
    attributes: u8,
    max_power: u8,
    string_index: u8,
    /// Descriptors after the header, in order
    body: Vec<Vec<u8>>,
}

impl ConfigBuilder {
    pub fn new(value: u8) -> Self {
        Self {
            value,
            attributes: 0x80,
            max_power: 50,
            string_index: 0,
            body: Vec::new(),
        }
    }

    pub fn attributes(mut self, attributes: u8) -> Self {
        self.attributes = attributes;
        self
    }

    /// `bMaxPower` in 2 mA units
    pub fn max_power(mut self, raw: u8) -> Self {
        self.max_power = raw;
        self
    }

    pub fn string_index(mut self, index: u8) -> Self {
        self.string_index = index;
        self
    }

    /// Start an interface; following endpoints belong to it
    pub fn interface(mut self, number: u8, alternate: u8, class: u8) -> Self {
        self.body
            .push(vec![9, 4, number, alternate, 0, class, 0, 0, 0]);
        self
    }

    pub fn endpoint(mut self, address: u8, attributes: u8, max_packet: u16, interval: u8) -> Self {
        let [lo, hi] = max_packet.to_le_bytes();
        self.body
            .push(vec![7, 5, address, attributes, lo, hi, interval]);
        self
    }

    /// A class-specific descriptor; `bytes` must start with its own length
    pub fn extra(mut self, bytes: &[u8]) -> Self {
        self.body.push(bytes.to_vec());
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut body = self.body;
        let mut interfaces = BTreeSet::new();
        let mut current: Option<usize> = None;
        for i in 0..body.len() {
            match body[i][1] {
                4 => {
                    interfaces.insert(body[i][2]);
                    current = Some(i);
                }
                5 => {
                    if let Some(iface) = current {
                        body[iface][4] += 1;
                    }
                }
                _ => {}
            }
        }

        let total = 9 + body.iter().map(Vec::len).sum::<usize>();
        let [lo, hi] = (total as u16).to_le_bytes();
        let mut blob = vec![
            9,
            DESCRIPTOR_TYPE_CONFIGURATION,
            lo,
            hi,
            interfaces.len() as u8,
            self.value,
            self.string_index,
            self.attributes,
            self.max_power,
        ];
        for desc in body {
            blob.extend_from_slice(&desc);
        }
        blob
    }
}

/// A canned device: descriptors, strings and per-device behaviour
#[derive(Debug, Clone)]
pub struct MockDevice {
    vendor_id: u16,
    product_id: u16,
    class: u8,
    usb_version: u16,
    num_configurations: Option<u8>,
    manufacturer: u8,
    product: u8,
    serial: u8,
    configurations: Vec<Vec<u8>>,
    active_configuration: u8,
    languages: Vec<u16>,
    strings: HashMap<(u16, u8), String>,
    speed: Speed,
    hub_ports: Option<u8>,
    vendor_replies: HashMap<u8, Vec<u8>>,
    kernel_drivers: BTreeSet<u8>,
}

impl MockDevice {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            class: 0,
            usb_version: 0x0200,
            num_configurations: None,
            manufacturer: 0,
            product: 0,
            serial: 0,
            configurations: Vec::new(),
            active_configuration: 1,
            languages: Vec::new(),
            strings: HashMap::new(),
            speed: Speed::High,
            hub_ports: None,
            vendor_replies: HashMap::new(),
            kernel_drivers: BTreeSet::new(),
        }
    }

    /// A hub with `ports` downstream ports and a single interrupt endpoint
    pub fn hub(ports: u8) -> Self {
        let mut hub = Self::new(0x1d6b, 0x0002);
        hub.class = CLASS_HUB;
        hub.hub_ports = Some(ports);
        hub.configuration(
            ConfigBuilder::new(1)
                .attributes(0xe0)
                .max_power(0)
                .interface(0, 0, CLASS_HUB)
                .endpoint(0x81, 3, 4, 12)
                .build(),
        )
    }

    pub fn class(mut self, class: u8) -> Self {
        self.class = class;
        self
    }

    /// Override `bNumConfigurations` (defaults to the number added)
    pub fn num_configurations(mut self, count: u8) -> Self {
        self.num_configurations = Some(count);
        self
    }

    pub fn configuration(mut self, blob: Vec<u8>) -> Self {
        self.configurations.push(blob);
        self
    }

    /// Reply to GET_CONFIGURATION
    pub fn active_configuration(mut self, value: u8) -> Self {
        self.active_configuration = value;
        self
    }

    /// Strings in language `lang`, as `(index, text)` pairs
    pub fn strings(mut self, lang: u16, strings: &[(u8, &str)]) -> Self {
        if !self.languages.contains(&lang) {
            self.languages.push(lang);
        }
        for (index, text) in strings {
            self.strings.insert((lang, *index), text.to_string());
        }
        self
    }

    pub fn manufacturer(mut self, index: u8) -> Self {
        self.manufacturer = index;
        self
    }

    pub fn product(mut self, index: u8) -> Self {
        self.product = index;
        self
    }

    pub fn serial(mut self, index: u8) -> Self {
        self.serial = index;
        self
    }

    pub fn speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    /// Reply to a vendor or class read with request code `request`
    pub fn vendor_reply(mut self, request: u8, reply: &[u8]) -> Self {
        self.vendor_replies.insert(request, reply.to_vec());
        self
    }

    /// Pretend an OS driver holds `interface`
    pub fn kernel_driver(mut self, interface: u8) -> Self {
        self.kernel_drivers.insert(interface);
        self
    }

    /// The 18-byte device descriptor
    pub fn descriptor(&self) -> Vec<u8> {
        let [vid_lo, vid_hi] = self.vendor_id.to_le_bytes();
        let [pid_lo, pid_hi] = self.product_id.to_le_bytes();
        let [usb_lo, usb_hi] = self.usb_version.to_le_bytes();
        let count = self
            .num_configurations
            .unwrap_or(self.configurations.len() as u8);
        vec![
            18,
            DESCRIPTOR_TYPE_DEVICE,
            usb_lo,
            usb_hi,
            self.class,
            0,
            0,
            64,
            vid_lo,
            vid_hi,
            pid_lo,
            pid_hi,
            0x00,
            0x01,
            self.manufacturer,
            self.product,
            self.serial,
            count,
        ]
    }
}

fn string_descriptor(text: &str) -> Vec<u8> {
    let mut desc = vec![0, DESCRIPTOR_TYPE_STRING];
    for unit in text.encode_utf16() {
        desc.extend_from_slice(&unit.to_le_bytes());
    }
    desc[0] = desc.len().min(255) as u8;
    desc
}

fn language_descriptor(languages: &[u16]) -> Vec<u8> {
    let mut desc = vec![(2 + 2 * languages.len()) as u8, DESCRIPTOR_TYPE_STRING];
    for lang in languages {
        desc.extend_from_slice(&lang.to_le_bytes());
    }
    desc
}

// ============================================================================
// Call log
// ============================================================================

/// One operation a device backend was asked to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Open,
    Close,
    Control {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    },
    ReadBulk { endpoint: u8, len: usize },
    WriteBulk { endpoint: u8, len: usize },
    ReadInterrupt { endpoint: u8, len: usize },
    WriteInterrupt { endpoint: u8, len: usize },
    ClearHalt(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    SetAlternate(u8, u8),
    CyclePort,
    EnumerateChildren,
    KernelDriverActive(u8),
}

impl MockOp {
    pub fn is_control(&self) -> bool {
        matches!(self, MockOp::Control { .. })
    }

    /// True for a standard GET_DESCRIPTOR of `descriptor_type`
    pub fn is_get_descriptor(&self, descriptor_type: u8) -> bool {
        matches!(
            self,
            MockOp::Control { request_type: 0x80, request: GET_DESCRIPTOR, value, .. }
                if (*value >> 8) as u8 == descriptor_type
        )
    }

    pub fn is_get_configuration(&self) -> bool {
        matches!(
            self,
            MockOp::Control {
                request_type: 0x80,
                request: GET_CONFIGURATION,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub native_id: String,
    pub op: MockOp,
}

// ============================================================================
// Backend
// ============================================================================

struct MockSlot {
    device: MockDevice,
    native_id: String,
    hub: Option<(u8, u8)>,
    /// Reported by `enumerate_children` when set
    children: Option<Vec<(u8, u8)>>,
    open_failure: Option<ErrorKind>,
    descriptor_failures: u32,
    stalled: BTreeSet<u8>,
    bulk_in: HashMap<u8, VecDeque<Vec<u8>>>,
    interrupt_in: HashMap<u8, VecDeque<Vec<u8>>>,
    written: HashMap<u8, Vec<Vec<u8>>>,
    claimed: BTreeSet<u8>,
}

struct MockBus {
    name: String,
    number: Option<u8>,
    devices: BTreeMap<u8, MockSlot>,
}

#[derive(Default)]
struct MockState {
    buses: Vec<MockBus>,
    last_changed: Option<SystemTime>,
    snapshot_failure: Option<ErrorKind>,
    calls: Vec<MockCall>,
}

impl MockState {
    fn slot(&mut self, native_id: &str) -> Option<&mut MockSlot> {
        self.buses
            .iter_mut()
            .flat_map(|b| b.devices.values_mut())
            .find(|s| s.native_id == native_id)
    }

    fn bus_mut(&mut self, name: &str) -> Option<&mut MockBus> {
        self.buses.iter_mut().find(|b| b.name == name)
    }
}

/// Scriptable in-memory [`Backend`]
///
/// Clones share state, so a test keeps one clone to script the topology
/// after handing another to the host.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

pub fn mock_native_id(bus: &str, address: u8) -> String {
    format!("{}{}:{}", NATIVE_PREFIX, bus, address)
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bus(&self, name: &str, number: Option<u8>) {
        lock(&self.state).buses.push(MockBus {
            name: name.to_string(),
            number,
            devices: BTreeMap::new(),
        });
        self.touch();
    }

    pub fn remove_bus(&self, name: &str) {
        lock(&self.state).buses.retain(|b| b.name != name);
        self.touch();
    }

    /// Attach `device` at `address`, optionally below `(hub address, port)`
    ///
    /// Returns the native id the device will be reported under.
    pub fn plug(
        &self,
        bus: &str,
        address: u8,
        device: MockDevice,
        hub: Option<(u8, u8)>,
    ) -> String {
        let native_id = mock_native_id(bus, address);
        {
            let mut state = lock(&self.state);
            if let Some(bus) = state.bus_mut(bus) {
                bus.devices.insert(
                    address,
                    MockSlot {
                        device,
                        native_id: native_id.clone(),
                        hub,
                        children: None,
                        open_failure: None,
                        descriptor_failures: 0,
                        stalled: BTreeSet::new(),
                        bulk_in: HashMap::new(),
                        interrupt_in: HashMap::new(),
                        written: HashMap::new(),
                        claimed: BTreeSet::new(),
                    },
                );
            }
        }
        self.touch();
        native_id
    }

    pub fn unplug(&self, bus: &str, address: u8) {
        if let Some(bus) = lock(&self.state).bus_mut(bus) {
            bus.devices.remove(&address);
        }
        self.touch();
    }

    /// Record a topology change now
    pub fn touch(&self) {
        self.set_last_changed(Some(SystemTime::now()));
    }

    pub fn set_last_changed(&self, when: Option<SystemTime>) {
        lock(&self.state).last_changed = when;
    }

    /// Make every snapshot fail with `kind` (or stop failing)
    pub fn fail_snapshot(&self, kind: Option<ErrorKind>) {
        lock(&self.state).snapshot_failure = kind;
    }

    fn with_slot(&self, native_id: &str, f: impl FnOnce(&mut MockSlot)) {
        if let Some(slot) = lock(&self.state).slot(native_id) {
            f(slot);
        }
    }

    /// Make opening `native_id` fail with `kind`
    pub fn fail_open(&self, native_id: &str, kind: ErrorKind) {
        self.with_slot(native_id, |s| s.open_failure = Some(kind));
    }

    /// Fail the next `times` device descriptor reads with `Timeout`
    pub fn fail_descriptor(&self, native_id: &str, times: u32) {
        self.with_slot(native_id, |s| s.descriptor_failures = times);
    }

    /// Stall `endpoint` until its halt is cleared
    pub fn stall(&self, native_id: &str, endpoint: u8) {
        self.with_slot(native_id, |s| {
            s.stalled.insert(endpoint);
        });
    }

    pub fn queue_bulk_in(&self, native_id: &str, endpoint: u8, data: &[u8]) {
        self.with_slot(native_id, |s| {
            s.bulk_in.entry(endpoint).or_default().push_back(data.to_vec())
        });
    }

    pub fn queue_interrupt_in(&self, native_id: &str, endpoint: u8, data: &[u8]) {
        self.with_slot(native_id, |s| {
            s.interrupt_in
                .entry(endpoint)
                .or_default()
                .push_back(data.to_vec())
        });
    }

    /// What `enumerate_children` reports for this hub
    pub fn set_children(&self, native_id: &str, children: Vec<(u8, u8)>) {
        self.with_slot(native_id, |s| s.children = Some(children));
    }

    /// Chunks written to `endpoint`, one per backend call
    pub fn written(&self, native_id: &str, endpoint: u8) -> Vec<Vec<u8>> {
        lock(&self.state)
            .slot(native_id)
            .and_then(|s| s.written.get(&endpoint).cloned())
            .unwrap_or_default()
    }

    pub fn claimed(&self, native_id: &str) -> Vec<u8> {
        lock(&self.state)
            .slot(native_id)
            .map(|s| s.claimed.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    /// Operations issued against one device
    pub fn ops(&self, native_id: &str) -> Vec<MockOp> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.native_id == native_id)
            .map(|c| c.op.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn snapshot(&self) -> Result<Topology> {
        let state = lock(&self.state);
        if let Some(kind) = state.snapshot_failure {
            return Err(UsbError::new(kind, "mock snapshot"));
        }
        Ok(Topology {
            buses: state
                .buses
                .iter()
                .map(|bus| BusNode {
                    name: bus.name.clone(),
                    number: bus.number,
                    devices: bus
                        .devices
                        .iter()
                        .map(|(&address, slot)| DeviceNode {
                            address,
                            native_id: slot.native_id.clone(),
                            hub: slot.hub,
                            speed: slot.device.speed,
                        })
                        .collect(),
                })
                .collect(),
        })
    }

    fn last_changed(&self) -> Option<SystemTime> {
        lock(&self.state).last_changed
    }

    fn default_poll_period(&self) -> Duration {
        Duration::from_millis(20)
    }

    fn parse_native_id(&self, id: &str) -> Option<NativeAddress> {
        let (bus, address) = id.strip_prefix(NATIVE_PREFIX)?.rsplit_once(':')?;
        Some(NativeAddress {
            bus: bus.to_string(),
            address: address.parse().ok()?,
        })
    }

    fn open(&self, _bus: &BusNode, node: &DeviceNode) -> Result<Box<dyn DeviceBackend>> {
        let mut state = lock(&self.state);
        state.calls.push(MockCall {
            native_id: node.native_id.clone(),
            op: MockOp::Open,
        });
        let slot = state.slot(&node.native_id).ok_or_else(|| {
            UsbError::new(ErrorKind::NoDevice, format!("open {}", node.native_id))
        })?;
        if let Some(kind) = slot.open_failure {
            return Err(UsbError::new(kind, format!("open {}", node.native_id)));
        }
        Ok(Box::new(MockHandle {
            native_id: node.native_id.clone(),
            speed: slot.device.speed,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockHandle {
    native_id: String,
    speed: Speed,
    state: Arc<Mutex<MockState>>,
    closed: AtomicBool,
}

impl MockHandle {
    /// Log `op`, then run `f` against the device if it is still there
    fn call<T>(&self, op: MockOp, f: impl FnOnce(&mut MockSlot) -> Result<T>) -> Result<T> {
        let mut state = lock(&self.state);
        let context = format!("{:?} {}", op, self.native_id);
        state.calls.push(MockCall {
            native_id: self.native_id.clone(),
            op,
        });
        if self.closed.load(Ordering::SeqCst) {
            return Err(UsbError::not_open(context));
        }
        match state.slot(&self.native_id) {
            Some(slot) => f(slot),
            None => Err(UsbError::new(ErrorKind::NotAttached, context)),
        }
    }
}

fn stalled(endpoint: u8) -> UsbError {
    UsbError::new(ErrorKind::Stalled, format!("endpoint {:#04x}", endpoint))
}

fn reply(buf: &mut [u8], data: &[u8]) -> usize {
    let n = data.len().min(buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    n
}

fn handle_control(slot: &mut MockSlot, msg: &mut ControlMessage) -> Result<usize> {
    let (request_type, request, value) = (msg.request_type(), msg.request(), msg.value());
    let pipe = || UsbError::new(ErrorKind::Stalled, format!("control {:#04x}", request));
    let device = &slot.device;

    match (request_type, request) {
        (0x80, GET_DESCRIPTOR) => {
            let index = (value & 0xff) as u8;
            let data = match (value >> 8) as u8 {
                DESCRIPTOR_TYPE_DEVICE => {
                    if slot.descriptor_failures > 0 {
                        slot.descriptor_failures -= 1;
                        return Err(UsbError::new(ErrorKind::Timeout, "device descriptor"));
                    }
                    device.descriptor()
                }
                DESCRIPTOR_TYPE_CONFIGURATION => device
                    .configurations
                    .get(usize::from(index))
                    .cloned()
                    .ok_or_else(pipe)?,
                DESCRIPTOR_TYPE_STRING if index == 0 => {
                    if device.languages.is_empty() {
                        return Err(pipe());
                    }
                    language_descriptor(&device.languages)
                }
                DESCRIPTOR_TYPE_STRING => device
                    .strings
                    .get(&(msg.index(), index))
                    .map(|s| string_descriptor(s))
                    .ok_or_else(pipe)?,
                _ => return Err(pipe()),
            };
            Ok(reply(msg.buffer_mut(), &data))
        }
        (0x80, GET_CONFIGURATION) => Ok(reply(msg.buffer_mut(), &[device.active_configuration])),
        (0x00, SET_CONFIGURATION) => {
            slot.device.active_configuration = value as u8;
            Ok(0)
        }
        (0xa0, GET_DESCRIPTOR)
            if matches!(
                (value >> 8) as u8,
                DESCRIPTOR_TYPE_HUB | DESCRIPTOR_TYPE_SUPERSPEED_HUB
            ) =>
        {
            let ports = device.hub_ports.ok_or_else(pipe)?;
            let data = [9, (value >> 8) as u8, ports, 0, 0, 0, 0, 0, 0];
            Ok(reply(msg.buffer_mut(), &data))
        }
        _ if msg.is_read() => {
            let data = device.vendor_replies.get(&request).cloned().ok_or_else(pipe)?;
            Ok(reply(msg.buffer_mut(), &data))
        }
        _ => Ok(msg.data().len()),
    }
}

impl DeviceBackend for MockHandle {
    fn speed(&self) -> Speed {
        self.speed
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.calls.push(MockCall {
            native_id: self.native_id.clone(),
            op: MockOp::Close,
        });
        self.closed.store(true, Ordering::SeqCst);
    }

    fn control(&self, msg: &mut ControlMessage) -> Result<usize> {
        let op = MockOp::Control {
            request_type: msg.request_type(),
            request: msg.request(),
            value: msg.value(),
            index: msg.index(),
            length: msg.length(),
        };
        self.call(op, |slot| handle_control(slot, msg))
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        let op = MockOp::ReadBulk {
            endpoint,
            len: buf.len(),
        };
        self.call(op, |slot| {
            if slot.stalled.contains(&endpoint) {
                return Err(stalled(endpoint));
            }
            let queue = slot.bulk_in.entry(endpoint).or_default();
            let mut packet = queue.pop_front().ok_or_else(|| {
                UsbError::new(ErrorKind::Timeout, format!("bulk read {:#04x}", endpoint))
            })?;
            let n = reply(buf, &packet);
            if n < packet.len() {
                queue.push_front(packet.split_off(n));
            }
            Ok(n)
        })
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        let op = MockOp::WriteBulk {
            endpoint,
            len: data.len(),
        };
        self.call(op, |slot| {
            if slot.stalled.contains(&endpoint) {
                return Err(stalled(endpoint));
            }
            slot.written.entry(endpoint).or_default().push(data.to_vec());
            Ok(data.len())
        })
    }

    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8]) -> Result<Option<usize>> {
        let op = MockOp::ReadInterrupt {
            endpoint,
            len: buf.len(),
        };
        self.call(op, |slot| {
            if slot.stalled.contains(&endpoint) {
                return Err(stalled(endpoint));
            }
            Ok(slot
                .interrupt_in
                .get_mut(&endpoint)
                .and_then(VecDeque::pop_front)
                .map(|report| reply(buf, &report)))
        })
    }

    fn write_interrupt(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        let op = MockOp::WriteInterrupt {
            endpoint,
            len: data.len(),
        };
        self.call(op, |slot| {
            if slot.stalled.contains(&endpoint) {
                return Err(stalled(endpoint));
            }
            slot.written.entry(endpoint).or_default().push(data.to_vec());
            Ok(data.len())
        })
    }

    fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.call(MockOp::ClearHalt(endpoint), |slot| {
            slot.stalled.remove(&endpoint);
            Ok(())
        })
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        self.call(MockOp::ClaimInterface(interface), |slot| {
            slot.device.kernel_drivers.remove(&interface);
            slot.claimed.insert(interface);
            Ok(())
        })
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        self.call(MockOp::ReleaseInterface(interface), |slot| {
            if slot.claimed.remove(&interface) {
                Ok(())
            } else {
                Err(UsbError::new(
                    ErrorKind::InterfaceNotFound,
                    format!("interface {} not claimed", interface),
                ))
            }
        })
    }

    fn set_alternate(&self, interface: u8, alternate: u8) -> Result<()> {
        self.call(MockOp::SetAlternate(interface, alternate), |_| Ok(()))
    }

    fn cycle_port(&self) -> Result<()> {
        self.call(MockOp::CyclePort, |_| Ok(()))
    }

    fn enumerate_children(&self) -> Result<Vec<(u8, u8)>> {
        self.call(MockOp::EnumerateChildren, |slot| {
            slot.children
                .clone()
                .ok_or_else(|| UsbError::new(ErrorKind::Io, "enumerate children: not supported"))
        })
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        self.call(MockOp::KernelDriverActive(interface), |slot| {
            Ok(slot.device.kernel_drivers.contains(&interface))
        })
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Records every notification as `"<event> <bus>[:<address>]"`
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    fn push(&self, event: String) {
        lock(&self.events).push(event);
    }
}

fn device_key(device: &Device) -> String {
    format!("{}:{}", device.bus().name(), device.address())
}

impl UsbListener for RecordingListener {
    fn bus_added(&self, bus: &Bus) {
        self.push(format!("bus_added {}", bus.name()));
    }

    fn bus_removed(&self, bus: &Bus) {
        self.push(format!("bus_removed {}", bus.name()));
    }

    fn device_added(&self, device: &Device) {
        self.push(format!("device_added {}", device_key(device)));
    }

    fn device_removed(&self, device: &Device) {
        self.push(format!("device_removed {}", device_key(device)));
    }
}

/// Panics on every `device_added`
pub struct PanickingListener;

impl UsbListener for PanickingListener {
    fn device_added(&self, device: &Device) {
        panic!("listener failure on {}", device.native_id());
    }
}
