//! Common utilities for usb-host
//!
//! Ambient services shared by the library and the `usb-tree` tool: the
//! configuration file, logging setup and their error type.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{FilterSettings, HostSettings, UsbConfig};
pub use error::{Error, Result};
pub use logging::setup_logging;
