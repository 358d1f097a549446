//! Endpoint views and I/O streams
//!
//! Endpoint I/O is not serialized here. At most one thread should drive a
//! given endpoint at a time.

use crate::configuration::{EndpointInfo, Interface};
use crate::device::Device;
use std::fmt;
use std::io;
use usb_protocol::descriptor;
use usb_protocol::{Direction, ErrorKind, Result, TransferType, UsbError};

/// One endpoint of an interface
#[derive(Clone)]
pub struct Endpoint {
    interface: Interface,
    index: usize,
}

impl Endpoint {
    pub(crate) fn new(interface: Interface, index: usize) -> Self {
        Self { interface, index }
    }

    fn info(&self) -> &EndpointInfo {
        &self.interface.info().endpoints[self.index]
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn device(&self) -> &Device {
        self.interface.device()
    }

    /// Raw `bEndpointAddress`, direction bit included
    pub fn endpoint(&self) -> u8 {
        self.info().endpoint
    }

    /// Endpoint number (low four bits)
    pub fn address(&self) -> u8 {
        self.endpoint() & 0x0f
    }

    pub fn is_input(&self) -> bool {
        self.endpoint() & 0x80 != 0
    }

    pub fn direction(&self) -> Direction {
        if self.is_input() {
            Direction::ToHost
        } else {
            Direction::ToDevice
        }
    }

    pub fn attributes(&self) -> u8 {
        self.info().attributes
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes())
    }

    /// Bytes per (micro)frame at the device's current speed
    pub fn max_packet_size(&self) -> usize {
        descriptor::max_packet_size(
            self.info().max_packet_field,
            self.transfer_type(),
            self.device().speed(),
        )
    }

    /// Polling interval in microseconds at the device's current speed
    pub fn interval_micros(&self) -> u32 {
        descriptor::interval_micros(
            self.info().raw_interval,
            self.transfer_type(),
            self.device().speed(),
        )
    }

    /// The endpoint descriptor plus any class-specific bytes after it
    pub fn as_bytes(&self) -> &[u8] {
        &self.interface.configuration().as_bytes()[self.info().range.clone()]
    }

    fn require(&self, op: &str, wanted: &[TransferType], input: bool) -> Result<()> {
        if !wanted.contains(&self.transfer_type()) || self.is_input() != input {
            return Err(UsbError::invalid_argument(format!(
                "{} on {:?} {} endpoint {:#04x}",
                op,
                self.transfer_type(),
                if self.is_input() { "IN" } else { "OUT" },
                self.endpoint()
            )));
        }
        Ok(())
    }

    /// Byte stream over a bulk IN endpoint
    pub fn reader(&self) -> Result<BulkReader> {
        self.require("bulk read", &[TransferType::Bulk], true)?;
        Ok(BulkReader {
            device: self.device().clone(),
            endpoint: self.endpoint(),
        })
    }

    /// Byte sink over a bulk OUT endpoint
    pub fn writer(&self) -> Result<BulkWriter> {
        self.require("bulk write", &[TransferType::Bulk], false)?;
        Ok(BulkWriter {
            device: self.device().clone(),
            endpoint: self.endpoint(),
        })
    }

    /// Read one interrupt report
    ///
    /// `Ok(None)` means nothing arrived before the interrupt timeout. The
    /// caller polls at [`Endpoint::interval_micros`].
    pub fn recv_interrupt(&self) -> Result<Option<Vec<u8>>> {
        self.require("interrupt read", &[TransferType::Interrupt], true)?;
        let mut buf = vec![0u8; self.max_packet_size()];
        Ok(self
            .device()
            .read_interrupt(self.endpoint(), &mut buf)?
            .map(|n| {
                buf.truncate(n);
                buf
            }))
    }

    /// Send one interrupt report of at most one max-size packet
    pub fn send_interrupt(&self, data: &[u8]) -> Result<usize> {
        self.require("interrupt write", &[TransferType::Interrupt], false)?;
        if data.len() > self.max_packet_size() {
            return Err(UsbError::invalid_argument(format!(
                "interrupt write of {} bytes, max packet is {}",
                data.len(),
                self.max_packet_size()
            )));
        }
        self.device().write_interrupt(self.endpoint(), data)
    }

    /// Clear a stall through the backend, resetting the data toggle too
    pub fn clear_halt(&self) -> Result<()> {
        if !matches!(self.transfer_type(), TransferType::Bulk | TransferType::Interrupt) {
            return Err(UsbError::invalid_argument(format!(
                "clear halt on {:?} endpoint {:#04x}",
                self.transfer_type(),
                self.endpoint()
            )));
        }
        self.device().clear_halt(self.endpoint() & 0x8f)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("endpoint", &format_args!("{:#04x}", self.endpoint()))
            .field("transfer_type", &self.transfer_type())
            .finish()
    }
}

/// `io::Read` over a bulk IN endpoint
///
/// Each `read` is split into transfers of at most 4096 bytes; a short
/// transfer ends the read early.
#[derive(Debug, Clone)]
pub struct BulkReader {
    device: Device,
    endpoint: u8,
}

impl BulkReader {
    /// Read exactly one byte
    ///
    /// Errors propagate; a zero-length transfer is an `Underrun`.
    pub fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        match self.device.read_bulk(self.endpoint, &mut byte)? {
            0 => Err(UsbError::new(
                ErrorKind::Underrun,
                format!("bulk read {:#04x}: zero-length packet", self.endpoint),
            )),
            _ => Ok(byte[0]),
        }
    }
}

impl io::Read for BulkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.device.read_bulk(self.endpoint, buf)?)
    }
}

/// `io::Write` over a bulk OUT endpoint
#[derive(Debug, Clone)]
pub struct BulkWriter {
    device: Device,
    endpoint: u8,
}

impl io::Write for BulkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.device.write_bulk(self.endpoint, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
