//! Portable USB host library
//!
//! The object model is a tree: a [`Host`] owns [`Bus`]es, a bus owns
//! addressed [`Device`]s, and a device describes its [`Configuration`]s,
//! [`Interface`]s and [`Endpoint`]s. A background watcher keeps the tree in
//! step with the operating system and reports changes to [`UsbListener`]s.
//!
//! Platform access goes through the [`backend`] traits. The stock backend
//! is libusb via `rusb`; [`test_utils::MockBackend`] stands in for hardware
//! in tests.
//!
//! ```no_run
//! use usb_host::Host;
//!
//! # fn main() -> usb_host::Result<()> {
//! let host = Host::global()?;
//! for bus in host.busses() {
//!     for device in bus.devices() {
//!         let desc = device.device_descriptor();
//!         println!("{} {:04x}:{:04x}", device, desc.vendor_id(), desc.product_id());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bus;
pub mod configuration;
mod control;
pub mod device;
pub mod endpoint;
pub mod host;
pub mod listener;
mod sync;
pub mod test_utils;
pub mod watcher;

pub use backend::{Backend, DeviceBackend, RusbBackend};
pub use bus::Bus;
pub use configuration::{Configuration, Interface};
pub use device::Device;
pub use endpoint::{BulkReader, BulkWriter, Endpoint};
pub use host::{Host, HostBuilder};
pub use listener::{ChannelListener, UsbEvent, UsbListener};
pub use watcher::WatcherState;

pub use usb_protocol::{ErrorKind, PortIdentifier, Result, UsbError};
