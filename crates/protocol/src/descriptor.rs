//! USB descriptor codec
//!
//! Descriptors are read-only windows over the byte blobs returned by
//! GET_DESCRIPTOR. Byte 0 of every descriptor is its length and byte 1 its
//! type; multi-byte fields are little endian. Nothing here allocates except
//! [`DeviceDescriptor`], which keeps its own 18-byte copy, and
//! [`ConfigLayout`], which records where each interface and endpoint lives
//! inside a configuration blob.

use crate::error::{Result, UsbError};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::ops::Range;

pub const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
/// Hub class descriptor (USB 2.0 §11.23.2.1)
pub const DESCRIPTOR_TYPE_HUB: u8 = 0x29;
/// SuperSpeed hub class descriptor (USB 3.0 §10.13.2.1)
pub const DESCRIPTOR_TYPE_SUPERSPEED_HUB: u8 = 0x2a;

pub const DESCRIPTOR_LEN_DEVICE: usize = 18;
pub const DESCRIPTOR_LEN_CONFIGURATION: usize = 9;
pub const DESCRIPTOR_LEN_INTERFACE: usize = 9;
pub const DESCRIPTOR_LEN_ENDPOINT: usize = 7;

/// Device class code for hubs
pub const CLASS_HUB: u8 = 0x09;

/// Bus speed a device was enumerated at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Speed {
    /// 1.5 Mbps (USB 1.0)
    Low,
    /// 12 Mbps (USB 1.1)
    Full,
    /// 480 Mbps (USB 2.0)
    High,
    /// 5 Gbps (USB 3.0)
    Super,
    /// 10 Gbps (USB 3.1)
    SuperPlus,
    /// Backend could not tell
    Unknown,
}

impl Speed {
    /// True for speeds scheduled in 125 µs microframes
    pub fn uses_microframes(self) -> bool {
        matches!(self, Speed::High | Speed::Super | Speed::SuperPlus)
    }
}

/// Endpoint transfer type (low two bits of `bmAttributes`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// A raw descriptor: a buffer plus the offset its header starts at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Descriptor<'a> {
    /// Wrap the descriptor starting at `offset`
    ///
    /// Fails when the two header bytes are missing, when `bLength` is
    /// shorter than the header, or when it runs past the end of `buf`.
    pub fn new(buf: &'a [u8], offset: usize) -> Result<Self> {
        let header = buf
            .get(offset..offset.saturating_add(2))
            .filter(|h| h.len() == 2)
            .ok_or_else(|| UsbError::malformed(format!("no descriptor header at {}", offset)))?;
        let len = usize::from(header[0]);
        if len < 2 {
            return Err(UsbError::malformed(format!(
                "descriptor at {} has length {}",
                offset, len
            )));
        }
        if offset + len > buf.len() {
            return Err(UsbError::malformed(format!(
                "descriptor at {} claims {} bytes, {} available",
                offset,
                len,
                buf.len() - offset
            )));
        }
        Ok(Self { buf, offset })
    }

    /// Wrap a descriptor that must be of type `expected`
    pub fn expecting(buf: &'a [u8], offset: usize, expected: u8) -> Result<Self> {
        let desc = Self::new(buf, offset)?;
        if desc.descriptor_type() != expected {
            return Err(UsbError::malformed(format!(
                "expected descriptor type {}, found {}",
                expected,
                desc.descriptor_type()
            )));
        }
        Ok(desc)
    }

    /// `bLength`
    pub fn length(&self) -> usize {
        usize::from(self.buf[self.offset])
    }

    /// `bDescriptorType`
    pub fn descriptor_type(&self) -> u8 {
        self.buf[self.offset + 1]
    }

    /// Offset of this descriptor within its buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The bytes covered by `bLength`
    pub fn bytes(&self) -> &'a [u8] {
        &self.buf[self.offset..self.offset + self.length()]
    }

    /// Raw byte at `index` within the descriptor
    pub fn byte(&self, index: usize) -> Result<u8> {
        self.bytes().get(index).copied().ok_or_else(|| {
            UsbError::malformed(format!(
                "field at {} past end of {}-byte descriptor",
                index,
                self.length()
            ))
        })
    }

    /// Unsigned 8-bit field at `index`
    pub fn u8_at(&self, index: usize) -> Result<u8> {
        self.byte(index)
    }

    /// Little-endian unsigned 16-bit field at `index`
    pub fn u16_at(&self, index: usize) -> Result<u16> {
        let bytes = self.bytes();
        bytes
            .get(index..index + 2)
            .map(LittleEndian::read_u16)
            .ok_or_else(|| {
                UsbError::malformed(format!(
                    "16-bit field at {} past end of {}-byte descriptor",
                    index,
                    self.length()
                ))
            })
    }
}

/// Standard device descriptor (USB 2.0 §9.6.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    raw: [u8; DESCRIPTOR_LEN_DEVICE],
}

impl DeviceDescriptor {
    /// Parse from the reply to GET_DESCRIPTOR(DEVICE)
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let desc = Descriptor::expecting(buf, 0, DESCRIPTOR_TYPE_DEVICE)?;
        let bytes = desc.bytes();
        if bytes.len() < DESCRIPTOR_LEN_DEVICE {
            return Err(UsbError::malformed(format!(
                "device descriptor is {} bytes, need {}",
                bytes.len(),
                DESCRIPTOR_LEN_DEVICE
            )));
        }
        let mut raw = [0u8; DESCRIPTOR_LEN_DEVICE];
        raw.copy_from_slice(&bytes[..DESCRIPTOR_LEN_DEVICE]);
        Ok(Self { raw })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn u16_at(&self, index: usize) -> u16 {
        LittleEndian::read_u16(&self.raw[index..index + 2])
    }

    /// `bcdUSB`
    pub fn usb_version(&self) -> u16 {
        self.u16_at(2)
    }

    pub fn class(&self) -> u8 {
        self.raw[4]
    }

    pub fn subclass(&self) -> u8 {
        self.raw[5]
    }

    pub fn protocol(&self) -> u8 {
        self.raw[6]
    }

    /// `bMaxPacketSize0`
    pub fn max_packet_size0(&self) -> u8 {
        self.raw[7]
    }

    pub fn vendor_id(&self) -> u16 {
        self.u16_at(8)
    }

    pub fn product_id(&self) -> u16 {
        self.u16_at(10)
    }

    /// `bcdDevice`
    pub fn device_version(&self) -> u16 {
        self.u16_at(12)
    }

    pub fn manufacturer_index(&self) -> u8 {
        self.raw[14]
    }

    pub fn product_index(&self) -> u8 {
        self.raw[15]
    }

    pub fn serial_index(&self) -> u8 {
        self.raw[16]
    }

    pub fn num_configurations(&self) -> u8 {
        self.raw[17]
    }

    pub fn is_hub(&self) -> bool {
        self.class() == CLASS_HUB
    }
}

/// The 9-byte header at the start of a configuration blob
#[derive(Debug, Clone, Copy)]
pub struct ConfigHeader<'a>(Descriptor<'a>);

impl<'a> ConfigHeader<'a> {
    pub fn parse(blob: &'a [u8]) -> Result<Self> {
        let desc = Descriptor::expecting(blob, 0, DESCRIPTOR_TYPE_CONFIGURATION)?;
        if desc.length() < DESCRIPTOR_LEN_CONFIGURATION {
            return Err(UsbError::malformed(format!(
                "configuration descriptor is {} bytes",
                desc.length()
            )));
        }
        Ok(Self(desc))
    }

    /// `wTotalLength`: header plus every interface, endpoint and class descriptor
    pub fn total_length(&self) -> u16 {
        self.0.u16_at(2).unwrap_or(0)
    }

    pub fn num_interfaces(&self) -> u8 {
        self.0.u8_at(4).unwrap_or(0)
    }

    /// `bConfigurationValue`
    pub fn value(&self) -> u8 {
        self.0.u8_at(5).unwrap_or(0)
    }

    pub fn string_index(&self) -> u8 {
        self.0.u8_at(6).unwrap_or(0)
    }

    /// `bmAttributes`
    pub fn attributes(&self) -> u8 {
        self.0.u8_at(7).unwrap_or(0)
    }

    pub fn is_self_powered(&self) -> bool {
        self.attributes() & 0x40 != 0
    }

    pub fn supports_remote_wakeup(&self) -> bool {
        self.attributes() & 0x20 != 0
    }

    /// `bMaxPower` converted from 2 mA units
    pub fn max_power_ma(&self) -> u16 {
        u16::from(self.0.u8_at(8).unwrap_or(0)) * 2
    }
}

/// Interface descriptor view (USB 2.0 §9.6.5)
#[derive(Debug, Clone, Copy)]
pub struct InterfaceDescriptor<'a>(Descriptor<'a>);

impl<'a> InterfaceDescriptor<'a> {
    pub fn new(blob: &'a [u8], offset: usize) -> Result<Self> {
        let desc = Descriptor::expecting(blob, offset, DESCRIPTOR_TYPE_INTERFACE)?;
        if desc.length() < DESCRIPTOR_LEN_INTERFACE {
            return Err(UsbError::malformed(format!(
                "interface descriptor at {} is {} bytes",
                offset,
                desc.length()
            )));
        }
        Ok(Self(desc))
    }

    pub fn number(&self) -> u8 {
        self.0.bytes()[2]
    }

    pub fn alternate_setting(&self) -> u8 {
        self.0.bytes()[3]
    }

    pub fn num_endpoints(&self) -> u8 {
        self.0.bytes()[4]
    }

    pub fn class(&self) -> u8 {
        self.0.bytes()[5]
    }

    pub fn subclass(&self) -> u8 {
        self.0.bytes()[6]
    }

    pub fn protocol(&self) -> u8 {
        self.0.bytes()[7]
    }

    pub fn string_index(&self) -> u8 {
        self.0.bytes()[8]
    }
}

/// Endpoint descriptor view (USB 2.0 §9.6.6)
///
/// Audio class endpoints carry two extra bytes; only `bLength` is trusted.
#[derive(Debug, Clone, Copy)]
pub struct EndpointDescriptor<'a>(Descriptor<'a>);

impl<'a> EndpointDescriptor<'a> {
    pub fn new(blob: &'a [u8], offset: usize) -> Result<Self> {
        let desc = Descriptor::expecting(blob, offset, DESCRIPTOR_TYPE_ENDPOINT)?;
        if desc.length() < DESCRIPTOR_LEN_ENDPOINT {
            return Err(UsbError::malformed(format!(
                "endpoint descriptor at {} is {} bytes",
                offset,
                desc.length()
            )));
        }
        Ok(Self(desc))
    }

    /// `bEndpointAddress`, direction bit included
    pub fn endpoint(&self) -> u8 {
        self.0.bytes()[2]
    }

    /// Endpoint number, 0 through 15
    pub fn address(&self) -> u8 {
        self.endpoint() & 0x0f
    }

    /// True for IN (device to host) endpoints
    pub fn is_input(&self) -> bool {
        self.endpoint() & 0x80 != 0
    }

    pub fn attributes(&self) -> u8 {
        self.0.bytes()[3]
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes())
    }

    /// Raw `wMaxPacketSize` word
    pub fn max_packet_field(&self) -> u16 {
        LittleEndian::read_u16(&self.0.bytes()[4..6])
    }

    /// Raw `bInterval`
    pub fn raw_interval(&self) -> u8 {
        self.0.bytes()[6]
    }

    /// Bytes this endpoint moves per (micro)frame
    pub fn max_packet_size(&self, speed: Speed) -> usize {
        max_packet_size(self.max_packet_field(), self.transfer_type(), speed)
    }

    /// Polling interval in microseconds
    pub fn interval_micros(&self, speed: Speed) -> u32 {
        interval_micros(self.raw_interval(), self.transfer_type(), speed)
    }
}

/// Decode a `wMaxPacketSize` word
///
/// High-bandwidth high-speed periodic endpoints encode extra transactions
/// per microframe in bits 11..12.
pub fn max_packet_size(field: u16, transfer_type: TransferType, speed: Speed) -> usize {
    let size = usize::from(field & 0x07ff);
    let periodic = matches!(transfer_type, TransferType::Isochronous | TransferType::Interrupt);
    if speed == Speed::High && periodic {
        size * (1 + usize::from((field >> 11) & 0x03))
    } else {
        size
    }
}

/// Decode `bInterval` into microseconds
///
/// Full/low-speed interrupt intervals count 1 ms frames. Isochronous
/// endpoints, and every endpoint on a microframe bus, use the exponent
/// form `2^(n-1)`. High-speed bulk and control OUT endpoints use the raw
/// byte as a NAK rate where 0 means "never NAKs".
pub fn interval_micros(raw: u8, transfer_type: TransferType, speed: Speed) -> u32 {
    let microframes = speed.uses_microframes();
    let mut interval = u32::from(raw);
    if transfer_type == TransferType::Isochronous || microframes {
        let nak_rate = matches!(transfer_type, TransferType::Bulk | TransferType::Control);
        if !(nak_rate && raw == 0) {
            let exponent = u32::from(raw.clamp(1, 16)) - 1;
            interval = 1 << exponent;
        }
    }
    interval * if microframes { 125 } else { 1000 }
}

/// Location of one interface (and its endpoints) inside a configuration blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceLayout {
    /// Interface descriptor plus trailing class-specific descriptors
    pub range: Range<usize>,
    pub endpoints: Vec<Range<usize>>,
}

impl InterfaceLayout {
    pub fn offset(&self) -> usize {
        self.range.start
    }
}

/// Where each descriptor of a configuration blob lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLayout {
    /// Configuration header plus any descriptors before the first interface
    pub header: Range<usize>,
    pub interfaces: Vec<InterfaceLayout>,
    /// `wTotalLength`
    pub total_length: usize,
}

impl ConfigLayout {
    /// Walk a full configuration blob
    ///
    /// Splits at every INTERFACE and ENDPOINT descriptor. Any other
    /// descriptor (class specific, interface association, ...) is folded
    /// into the view that precedes it.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let header = ConfigHeader::parse(blob)?;
        let total = usize::from(header.total_length());
        if total < DESCRIPTOR_LEN_CONFIGURATION {
            return Err(UsbError::malformed(format!(
                "wTotalLength {} shorter than header",
                total
            )));
        }
        if blob.len() < total {
            return Err(UsbError::malformed(format!(
                "configuration blob is {} bytes, wTotalLength says {}",
                blob.len(),
                total
            )));
        }
        let blob = &blob[..total];

        let mut layout = ConfigLayout {
            header: 0..header.0.length(),
            interfaces: Vec::new(),
            total_length: total,
        };
        let mut offset = header.0.length();
        while offset < total {
            let desc = Descriptor::new(blob, offset)?;
            let end = offset + desc.length();
            match desc.descriptor_type() {
                DESCRIPTOR_TYPE_INTERFACE => {
                    InterfaceDescriptor::new(blob, offset)?;
                    layout.interfaces.push(InterfaceLayout {
                        range: offset..end,
                        endpoints: Vec::new(),
                    });
                }
                DESCRIPTOR_TYPE_ENDPOINT => {
                    EndpointDescriptor::new(blob, offset)?;
                    let iface = layout.interfaces.last_mut().ok_or_else(|| {
                        UsbError::malformed(format!("endpoint at {} before any interface", offset))
                    })?;
                    iface.endpoints.push(offset..end);
                }
                _ => layout.extend_last(end),
            }
            offset = end;
        }
        Ok(layout)
    }

    fn extend_last(&mut self, end: usize) {
        match self.interfaces.last_mut() {
            Some(iface) => match iface.endpoints.last_mut() {
                Some(ep) => ep.end = end,
                None => iface.range.end = end,
            },
            None => self.header.end = end,
        }
    }

    /// Sum of every view's length; always equals `total_length`
    pub fn covered_length(&self) -> usize {
        self.header.len()
            + self
                .interfaces
                .iter()
                .map(|i| i.range.len() + i.endpoints.iter().map(Range::len).sum::<usize>())
                .sum::<usize>()
    }
}
