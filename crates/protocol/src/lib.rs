//! USB wire layer for usb-host
//!
//! This crate holds everything about USB that does not need a device: the
//! descriptor codec, control setup packets and standard requests, the error
//! taxonomy with its native code tables, topological port identifiers and
//! LANGID handling. It performs no I/O.
//!
//! # Example
//!
//! ```
//! use usb_protocol::{ConfigLayout, DeviceDescriptor, EndpointDescriptor, Speed};
//!
//! let device = [
//!     18, 1, 0x00, 0x02, 0, 0, 0, 64, 0xb4, 0x04, 0x13, 0x86, 0x01, 0x00, 1, 2, 0, 1,
//! ];
//! let desc = DeviceDescriptor::parse(&device).unwrap();
//! assert_eq!(desc.vendor_id(), 0x04b4);
//!
//! let config = [
//!     9, 2, 25, 0, 1, 1, 0, 0x80, 50,
//!     9, 4, 0, 0, 1, 0xff, 0, 0, 0,
//!     7, 5, 0x81, 3, 0x40, 0x00, 4,
//! ];
//! let layout = ConfigLayout::parse(&config).unwrap();
//! let ep = EndpointDescriptor::new(&config, layout.interfaces[0].endpoints[0].start).unwrap();
//! assert!(ep.is_input());
//! assert_eq!(ep.interval_micros(Speed::High), 1000);
//! ```
//!
//! # Port identifiers
//!
//! ```
//! use usb_protocol::PortIdentifier;
//!
//! let id: PortIdentifier = "usb-1-2.3".parse().unwrap();
//! assert_eq!(id.ports(), &[2, 3]);
//! assert_eq!(id.to_string(), "usb-1-2.3");
//! ```

pub mod control;
pub mod descriptor;
pub mod error;
pub mod langid;
pub mod port;

pub use control::{ControlMessage, Direction, Recipient, RequestKind, request_type};
pub use descriptor::{
    ConfigHeader, ConfigLayout, Descriptor, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor, InterfaceLayout, Speed, TransferType,
};
pub use error::{ErrorKind, Result, UsbError};
pub use port::PortIdentifier;
