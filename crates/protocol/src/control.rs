//! Control transfer setup packets and standard requests

use crate::descriptor::{DESCRIPTOR_TYPE_CONFIGURATION, DESCRIPTOR_TYPE_STRING};
use crate::error::{Result, UsbError};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Largest payload (exclusive) a single control transfer may carry
pub const MAX_CONTROL_LENGTH: usize = 4096;

pub const GET_STATUS: u8 = 0x00;
pub const CLEAR_FEATURE: u8 = 0x01;
pub const SET_FEATURE: u8 = 0x03;
pub const SET_ADDRESS: u8 = 0x05;
pub const GET_DESCRIPTOR: u8 = 0x06;
pub const SET_DESCRIPTOR: u8 = 0x07;
pub const GET_CONFIGURATION: u8 = 0x08;
pub const SET_CONFIGURATION: u8 = 0x09;
pub const GET_INTERFACE: u8 = 0x0a;
pub const SET_INTERFACE: u8 = 0x0b;
pub const SYNCH_FRAME: u8 = 0x0c;

/// Feature selector for CLEAR_FEATURE on an endpoint
pub const ENDPOINT_HALT: u16 = 0;

/// Data stage direction (bit 7 of `bmRequestType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    ToHost,
    ToDevice,
}

/// Request type (bits 5..6 of `bmRequestType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
}

/// Request recipient (bits 0..4 of `bmRequestType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Compose a `bmRequestType` byte
pub fn request_type(direction: Direction, kind: RequestKind, recipient: Recipient) -> u8 {
    let dir = match direction {
        Direction::ToHost => 0x80,
        Direction::ToDevice => 0x00,
    };
    let kind = match kind {
        RequestKind::Standard => 0x00,
        RequestKind::Class => 0x20,
        RequestKind::Vendor => 0x40,
    };
    let recipient = match recipient {
        Recipient::Device => 0x00,
        Recipient::Interface => 0x01,
        Recipient::Endpoint => 0x02,
        Recipient::Other => 0x03,
    };
    dir | kind | recipient
}

/// One control request and its data stage
///
/// For reads the buffer is allocated to `wLength` up front and trimmed to
/// the byte count the device actually returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    read: bool,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    buffer: Vec<u8>,
}

impl ControlMessage {
    /// Device-to-host request expecting up to `length` bytes
    pub fn read(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            read: true,
            request_type,
            request,
            value,
            index,
            length,
            buffer: vec![0; usize::from(length)],
        }
    }

    /// Host-to-device request carrying `data`
    pub fn write(request_type: u8, request: u8, value: u16, index: u16, data: Vec<u8>) -> Self {
        Self {
            read: false,
            request_type,
            request,
            value,
            index,
            length: u16::try_from(data.len()).unwrap_or(u16::MAX),
            buffer: data,
        }
    }

    pub fn request_type(&self) -> u8 {
        self.request_type
    }

    pub fn request(&self) -> u8 {
        self.request
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    /// `wLength`
    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::ToHost
        } else {
            Direction::ToDevice
        }
    }

    /// True when built with [`ControlMessage::read`]
    pub fn is_read(&self) -> bool {
        self.read
    }

    /// True for a standard, device-recipient request
    pub fn is_standard_device(&self) -> bool {
        self.request_type & 0x7f == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable data stage; for reads this is where the device's reply lands
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn into_data(self) -> Vec<u8> {
        self.buffer
    }

    /// Trim the data stage to the byte count actually transferred
    pub fn set_actual_length(&mut self, actual: usize) {
        self.buffer.truncate(actual);
    }

    /// The 8-byte SETUP packet
    pub fn setup_packet(&self) -> [u8; 8] {
        let mut packet = [0u8; 8];
        packet[0] = self.request_type;
        packet[1] = self.request;
        LittleEndian::write_u16(&mut packet[2..4], self.value);
        LittleEndian::write_u16(&mut packet[4..6], self.index);
        LittleEndian::write_u16(&mut packet[6..8], self.length);
        packet
    }

    /// Check the message before it reaches a backend
    ///
    /// A read must carry the device-to-host direction bit and a write the
    /// host-to-device one; the payload must stay below
    /// [`MAX_CONTROL_LENGTH`].
    pub fn validate(&self) -> Result<()> {
        match (self.read, self.direction()) {
            (true, Direction::ToDevice) => {
                return Err(UsbError::invalid_argument(format!(
                    "control read 0x{:02x} with host-to-device direction",
                    self.request
                )));
            }
            (false, Direction::ToHost) => {
                return Err(UsbError::invalid_argument(format!(
                    "control write 0x{:02x} with device-to-host direction",
                    self.request
                )));
            }
            _ => {}
        }
        let len = self.buffer.len().max(usize::from(self.length));
        if len >= MAX_CONTROL_LENGTH {
            return Err(UsbError::invalid_argument(format!(
                "control request 0x{:02x}: payload of {} bytes",
                self.request, len
            )));
        }
        Ok(())
    }
}

fn standard(direction: Direction, recipient: Recipient) -> u8 {
    request_type(direction, RequestKind::Standard, recipient)
}

/// GET_DESCRIPTOR(type, index) with `wIndex = lang_id`
pub fn get_descriptor(descriptor_type: u8, index: u8, lang_id: u16, length: u16) -> ControlMessage {
    ControlMessage::read(
        standard(Direction::ToHost, Recipient::Device),
        GET_DESCRIPTOR,
        u16::from(descriptor_type) << 8 | u16::from(index),
        lang_id,
        length,
    )
}

/// GET_DESCRIPTOR(CONFIGURATION, index)
pub fn get_config_descriptor(index: u8, length: u16) -> ControlMessage {
    get_descriptor(DESCRIPTOR_TYPE_CONFIGURATION, index, 0, length)
}

/// GET_CONFIGURATION, one byte back
pub fn get_configuration() -> ControlMessage {
    ControlMessage::read(
        standard(Direction::ToHost, Recipient::Device),
        GET_CONFIGURATION,
        0,
        0,
        1,
    )
}

pub fn set_configuration(index: u8) -> ControlMessage {
    ControlMessage::write(
        standard(Direction::ToDevice, Recipient::Device),
        SET_CONFIGURATION,
        u16::from(index),
        0,
        Vec::new(),
    )
}

/// GET_DESCRIPTOR(STRING, index) in language `lang_id`
pub fn get_string(index: u8, lang_id: u16) -> ControlMessage {
    get_descriptor(DESCRIPTOR_TYPE_STRING, index, lang_id, 255)
}

/// String descriptor zero: the supported LANGIDs
pub fn get_languages() -> ControlMessage {
    get_string(0, 0)
}

/// CLEAR_FEATURE(ENDPOINT_HALT) addressed to `endpoint`
pub fn clear_endpoint_halt(endpoint: u8) -> ControlMessage {
    ControlMessage::write(
        standard(Direction::ToDevice, Recipient::Endpoint),
        CLEAR_FEATURE,
        ENDPOINT_HALT,
        u16::from(endpoint),
        Vec::new(),
    )
}

pub fn get_status(recipient: Recipient, index: u16) -> ControlMessage {
    ControlMessage::read(
        standard(Direction::ToHost, recipient),
        GET_STATUS,
        0,
        index,
        2,
    )
}

/// Class GET_DESCRIPTOR for a hub's own descriptor
pub fn get_hub_descriptor(descriptor_type: u8) -> ControlMessage {
    ControlMessage::read(
        request_type(Direction::ToHost, RequestKind::Class, Recipient::Device),
        GET_DESCRIPTOR,
        u16::from(descriptor_type) << 8,
        0,
        12,
    )
}

pub fn set_interface(interface: u8, alternate: u8) -> ControlMessage {
    ControlMessage::write(
        standard(Direction::ToDevice, Recipient::Interface),
        SET_INTERFACE,
        u16::from(alternate),
        u16::from(interface),
        Vec::new(),
    )
}

/// Decode a string descriptor reply
///
/// UTF-16LE from byte 2, bounded by both `bLength` and the reply size.
pub fn decode_string(reply: &[u8]) -> Result<String> {
    if reply.len() < 2 || reply[1] != DESCRIPTOR_TYPE_STRING {
        return Err(UsbError::malformed("string descriptor header"));
    }
    let end = usize::from(reply[0]).min(reply.len());
    let units: Vec<u16> = reply
        .get(2..end)
        .unwrap_or_default()
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Decode string descriptor zero into its LANGIDs
pub fn decode_languages(reply: &[u8]) -> Result<Vec<u16>> {
    if reply.len() < 2 || reply[1] != DESCRIPTOR_TYPE_STRING {
        return Err(UsbError::malformed("language table header"));
    }
    let end = usize::from(reply[0]).min(reply.len());
    Ok(reply
        .get(2..end)
        .unwrap_or_default()
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect())
}
