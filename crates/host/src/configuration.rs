//! Configuration and interface views
//!
//! A configuration blob is fetched once and parsed once. The resulting
//! [`ConfigData`] is shared by every [`Configuration`], [`Interface`] and
//! [`Endpoint`] handed out for it, so views are cheap to clone and never
//! touch the device again.

use crate::backend::DeviceBackend;
use crate::control;
use crate::device::Device;
use crate::endpoint::Endpoint;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use usb_protocol::{
    ConfigHeader, ConfigLayout, EndpointDescriptor, ErrorKind, InterfaceDescriptor, Result,
    UsbError,
};

/// A parsed configuration blob
#[derive(Debug)]
pub(crate) struct ConfigData {
    index: u8,
    blob: Vec<u8>,
    value: u8,
    string_index: u8,
    attributes: u8,
    max_power_ma: u16,
    num_interfaces: u8,
    total_length: usize,
    interfaces: Vec<InterfaceInfo>,
}

#[derive(Debug)]
pub(crate) struct InterfaceInfo {
    pub(crate) number: u8,
    pub(crate) alternate: u8,
    pub(crate) class: u8,
    pub(crate) subclass: u8,
    pub(crate) protocol: u8,
    pub(crate) string_index: u8,
    pub(crate) num_endpoints: u8,
    pub(crate) range: Range<usize>,
    pub(crate) endpoints: Vec<EndpointInfo>,
}

#[derive(Debug)]
pub(crate) struct EndpointInfo {
    /// `bEndpointAddress`
    pub(crate) endpoint: u8,
    pub(crate) attributes: u8,
    pub(crate) max_packet_field: u16,
    pub(crate) raw_interval: u8,
    pub(crate) range: Range<usize>,
}

impl ConfigData {
    /// Fetch and parse configuration `index` from the device
    pub(crate) fn fetch(backend: &dyn DeviceBackend, index: u8) -> Result<Self> {
        let blob = control::fetch_config_blob(backend, index)
            .map_err(|e| e.context_with(format!("get configuration {}", index)))?;
        Self::parse(index, blob)
    }

    pub(crate) fn parse(index: u8, mut blob: Vec<u8>) -> Result<Self> {
        let layout = ConfigLayout::parse(&blob)?;
        blob.truncate(layout.total_length);

        let header = ConfigHeader::parse(&blob)?;
        let (value, string_index, attributes, max_power_ma, num_interfaces) = (
            header.value(),
            header.string_index(),
            header.attributes(),
            header.max_power_ma(),
            header.num_interfaces(),
        );

        let mut interfaces = Vec::with_capacity(layout.interfaces.len());
        for iface in &layout.interfaces {
            let desc = InterfaceDescriptor::new(&blob, iface.offset())?;
            let mut endpoints = Vec::with_capacity(iface.endpoints.len());
            for range in &iface.endpoints {
                let ep = EndpointDescriptor::new(&blob, range.start)?;
                endpoints.push(EndpointInfo {
                    endpoint: ep.endpoint(),
                    attributes: ep.attributes(),
                    max_packet_field: ep.max_packet_field(),
                    raw_interval: ep.raw_interval(),
                    range: range.clone(),
                });
            }
            interfaces.push(InterfaceInfo {
                number: desc.number(),
                alternate: desc.alternate_setting(),
                class: desc.class(),
                subclass: desc.subclass(),
                protocol: desc.protocol(),
                string_index: desc.string_index(),
                num_endpoints: desc.num_endpoints(),
                range: iface.range.clone(),
                endpoints,
            });
        }

        Ok(Self {
            index,
            total_length: layout.total_length,
            blob,
            value,
            string_index,
            attributes,
            max_power_ma,
            num_interfaces,
            interfaces,
        })
    }

    pub(crate) fn index(&self) -> u8 {
        self.index
    }
}

/// One configuration of a device
#[derive(Clone)]
pub struct Configuration {
    data: Arc<ConfigData>,
    device: Device,
}

impl Configuration {
    pub(crate) fn new(data: Arc<ConfigData>, device: Device) -> Self {
        Self { data, device }
    }

    pub(crate) fn data(&self) -> &ConfigData {
        &self.data
    }

    /// The device this configuration was read from
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Descriptor index this configuration was fetched with
    pub fn index(&self) -> u8 {
        self.data.index
    }

    /// `bConfigurationValue`
    pub fn value(&self) -> u8 {
        self.data.value
    }

    pub fn string_index(&self) -> u8 {
        self.data.string_index
    }

    /// `bmAttributes`
    pub fn attributes(&self) -> u8 {
        self.data.attributes
    }

    pub fn is_self_powered(&self) -> bool {
        self.data.attributes & 0x40 != 0
    }

    pub fn supports_remote_wakeup(&self) -> bool {
        self.data.attributes & 0x20 != 0
    }

    pub fn max_power_ma(&self) -> u16 {
        self.data.max_power_ma
    }

    /// `bNumInterfaces` as the header reports it
    pub fn num_interfaces(&self) -> u8 {
        self.data.num_interfaces
    }

    /// `wTotalLength`
    pub fn total_length(&self) -> usize {
        self.data.total_length
    }

    /// The whole blob, header included
    pub fn as_bytes(&self) -> &[u8] {
        &self.data.blob
    }

    /// Every interface descriptor, alternate settings included, in blob order
    pub fn interfaces(&self) -> Vec<Interface> {
        (0..self.data.interfaces.len())
            .map(|index| Interface {
                config: self.clone(),
                index,
            })
            .collect()
    }

    /// Interface `number` in alternate setting `alternate`
    pub fn interface(&self, number: u8, alternate: u8) -> Result<Interface> {
        self.data
            .interfaces
            .iter()
            .position(|i| i.number == number && i.alternate == alternate)
            .map(|index| Interface {
                config: self.clone(),
                index,
            })
            .ok_or_else(|| {
                UsbError::new(
                    ErrorKind::InterfaceNotFound,
                    format!(
                        "configuration {}: interface {} alt {}",
                        self.value(),
                        number,
                        alternate
                    ),
                )
            })
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("device", &self.device.native_id())
            .field("value", &self.value())
            .field("total_length", &self.total_length())
            .finish()
    }
}

/// One interface (in one alternate setting) of a configuration
#[derive(Clone)]
pub struct Interface {
    config: Configuration,
    index: usize,
}

impl Interface {
    pub(crate) fn info(&self) -> &InterfaceInfo {
        &self.config.data().interfaces[self.index]
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn device(&self) -> &Device {
        self.config.device()
    }

    /// `bInterfaceNumber`
    pub fn number(&self) -> u8 {
        self.info().number
    }

    pub fn alternate_setting(&self) -> u8 {
        self.info().alternate
    }

    pub fn class(&self) -> u8 {
        self.info().class
    }

    pub fn subclass(&self) -> u8 {
        self.info().subclass
    }

    pub fn protocol(&self) -> u8 {
        self.info().protocol
    }

    pub fn string_index(&self) -> u8 {
        self.info().string_index
    }

    /// `bNumEndpoints` as the descriptor reports it
    pub fn num_endpoints(&self) -> u8 {
        self.info().num_endpoints
    }

    /// The interface descriptor plus any class-specific descriptors after it
    pub fn as_bytes(&self) -> &[u8] {
        &self.config.data().blob[self.info().range.clone()]
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        (0..self.info().endpoints.len())
            .map(|index| Endpoint::new(self.clone(), index))
            .collect()
    }

    /// Endpoint by its `bEndpointAddress`, direction bit included
    pub fn endpoint(&self, address: u8) -> Result<Endpoint> {
        self.info()
            .endpoints
            .iter()
            .position(|e| e.endpoint == address)
            .map(|index| Endpoint::new(self.clone(), index))
            .ok_or_else(|| {
                UsbError::new(
                    ErrorKind::EndpointNotFound,
                    format!("interface {}: endpoint {:#04x}", self.number(), address),
                )
            })
    }

    pub fn claim(&self) -> Result<()> {
        self.device().claim_interface(self.number())
    }

    pub fn release(&self) -> Result<()> {
        self.device().release_interface(self.number())
    }

    /// Select this interface's alternate setting on the device
    pub fn select(&self) -> Result<()> {
        self.device().set_alternate(self.number(), self.alternate_setting())
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("number", &self.number())
            .field("alternate", &self.alternate_setting())
            .field("class", &self.class())
            .finish()
    }
}
