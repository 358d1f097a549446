//! USB error taxonomy
//!
//! Every failure surfaced by the library is a [`UsbError`]: a portable
//! [`ErrorKind`], the raw platform code it was derived from (diagnostics
//! only), and a caller-supplied context phrase.
//!
//! The native code tables live here so that every backend maps codes the
//! same way. Portable code should branch on [`UsbError::kind`] or
//! [`UsbError::is_stalled`], never on [`UsbError::raw_code`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Portable classification of a USB failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Operation attempted on a closed or never-opened device
    NotOpen,
    /// Privilege or exclusive-ownership failure
    AccessDenied,
    /// Device absent; enumerated but gone before open
    NoDevice,
    /// Device was open and has been unplugged
    NotAttached,
    /// Malformed request (payload too long, direction mismatch, wrong endpoint type)
    InvalidArgument,
    /// Endpoint returned a STALL handshake
    Stalled,
    /// Backend-imposed deadline elapsed
    Timeout,
    /// Request aborted by caller or shutdown
    Canceled,
    /// More data arrived than the buffer could hold
    Overrun,
    /// Less data than expected, or host buffer underrun
    Underrun,
    /// CRC, data toggle, bit stuffing or PID failure on the wire
    ProtocolError,
    /// Bus cannot admit the periodic reservation
    BandwidthExceeded,
    /// Pipe reference not recognised
    UnknownPipe,
    /// Endpoint not present in the current setting
    EndpointNotFound,
    /// Configuration not present on the device
    ConfigNotFound,
    /// Interface not present in the current configuration
    InterfaceNotFound,
    /// Descriptor bytes do not parse
    MalformedDescriptor,
    /// Generic backend failure
    Io,
}

impl ErrorKind {
    /// Human readable diagnostic for this kind
    pub fn diagnostic(self) -> &'static str {
        match self {
            ErrorKind::NotOpen => "USB device not open",
            ErrorKind::AccessDenied => "Access denied",
            ErrorKind::NoDevice => "Device not found",
            ErrorKind::NotAttached => "USB device has been removed",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::Stalled => "USB endpoint stall",
            ErrorKind::Timeout => "USB operation timed out",
            ErrorKind::Canceled => "USB operation canceled",
            ErrorKind::Overrun => "USB data overrun",
            ErrorKind::Underrun => "USB data underrun or short packet",
            ErrorKind::ProtocolError => "USB CRC or data toggle error",
            ErrorKind::BandwidthExceeded => "USB bandwidth reservation would be exceeded",
            ErrorKind::UnknownPipe => "USB pipe not recognised",
            ErrorKind::EndpointNotFound => "USB bad endpoint",
            ErrorKind::ConfigNotFound => "USB configuration not found",
            ErrorKind::InterfaceNotFound => "USB interface not found",
            ErrorKind::MalformedDescriptor => "Malformed USB descriptor",
            ErrorKind::Io => "USB I/O error",
        }
    }

    /// Map a Linux usbfs errno (positive value) to a kind
    pub fn from_errno(errno: i32) -> Self {
        use errno::*;
        match errno {
            EPERM | EACCES | EBUSY => ErrorKind::AccessDenied,
            ENOENT | ECONNRESET => ErrorKind::Canceled,
            ENXIO => ErrorKind::EndpointNotFound,
            EBADF => ErrorKind::NotOpen,
            ENODEV => ErrorKind::NotAttached,
            EINVAL => ErrorKind::InvalidArgument,
            ENOSPC => ErrorKind::BandwidthExceeded,
            EPIPE => ErrorKind::Stalled,
            ETIME | ETIMEDOUT => ErrorKind::Timeout,
            ENOSR | EREMOTEIO => ErrorKind::Underrun,
            ECOMM | EOVERFLOW => ErrorKind::Overrun,
            EPROTO | EILSEQ => ErrorKind::ProtocolError,
            ESHUTDOWN => ErrorKind::UnknownPipe,
            _ => ErrorKind::Io,
        }
    }

    /// Map a macOS IOReturn (or IOUSBFamily) code to a kind
    ///
    /// The system and subsystem fields are masked off first.
    pub fn from_io_return(code: u32) -> Self {
        use io_return::*;
        match code & 0x3ff {
            NOT_PRIVILEGED | EXCLUSIVE_ACCESS | NOT_PERMITTED | BUSY => ErrorKind::AccessDenied,
            NO_DEVICE => ErrorKind::NoDevice,
            NOT_ATTACHED | NOT_RESPONDING => ErrorKind::NotAttached,
            NOT_OPEN => ErrorKind::NotOpen,
            BAD_ARGUMENT | USB_TOO_MANY_PIPES | USB_NOT_ENOUGH_PIPES => {
                ErrorKind::InvalidArgument
            }
            NOT_READY | ABORTED | USB_TRANSACTION_RETURNED => ErrorKind::Canceled,
            TIMEOUT | USB_TRANSACTION_TIMEOUT => ErrorKind::Timeout,
            USB_PIPE_STALLED => ErrorKind::Stalled,
            UNDERRUN | USB_BUFFER_UNDERRUN => ErrorKind::Underrun,
            OVERRUN | USB_BUFFER_OVERRUN => ErrorKind::Overrun,
            USB_CRC | USB_BITSTUFF | USB_DATA_TOGGLE | USB_PID_CHECK | USB_WRONG_PID => {
                ErrorKind::ProtocolError
            }
            NO_BANDWIDTH => ErrorKind::BandwidthExceeded,
            USB_UNKNOWN_PIPE => ErrorKind::UnknownPipe,
            USB_ENDPOINT_NOT_FOUND => ErrorKind::EndpointNotFound,
            USB_CONFIG_NOT_FOUND => ErrorKind::ConfigNotFound,
            USB_INTERFACE_NOT_FOUND => ErrorKind::InterfaceNotFound,
            _ => ErrorKind::Io,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.diagnostic())
    }
}

/// A USB failure with portable kind, raw platform code and context
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{context} -- {kind}{}", code_suffix(.code))]
pub struct UsbError {
    kind: ErrorKind,
    code: i64,
    context: String,
}

fn code_suffix(code: &i64) -> String {
    if *code == 0 {
        String::new()
    } else {
        format!(" [{:#x}]", code)
    }
}

impl UsbError {
    /// Create an error with no underlying platform code
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            code: 0,
            context: context.into(),
        }
    }

    /// Create an error carrying the raw platform code it was mapped from
    pub fn with_code(kind: ErrorKind, code: i64, context: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            context: context.into(),
        }
    }

    /// Wrap a Linux errno; accepts either sign, as backends return `-errno`
    pub fn from_errno(context: impl Into<String>, errno: i32) -> Self {
        let errno = errno.checked_abs().unwrap_or(i32::MAX);
        Self::with_code(ErrorKind::from_errno(errno), errno.into(), context)
    }

    /// Wrap a macOS IOReturn code
    pub fn from_io_return(context: impl Into<String>, code: u32) -> Self {
        Self::with_code(ErrorKind::from_io_return(code), code.into(), context)
    }

    pub fn not_open(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotOpen, context)
    }

    pub fn invalid_argument(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, context)
    }

    pub fn malformed(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedDescriptor, context)
    }

    /// Portable kind of this error
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Platform code this error was mapped from (0 if none)
    ///
    /// For diagnostics only; portable code must not branch on it.
    pub fn raw_code(&self) -> i64 {
        self.code
    }

    /// Caller-supplied context phrase
    pub fn context(&self) -> &str {
        &self.context
    }

    /// True exactly when an endpoint stalled
    ///
    /// Stalls are used as protocol-level error indicators by many device
    /// classes and must be cleared before the endpoint is used again.
    pub fn is_stalled(&self) -> bool {
        self.kind == ErrorKind::Stalled
    }

    /// Replace the context phrase, keeping kind and code
    pub fn context_with(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

impl From<UsbError> for std::io::Error {
    fn from(err: UsbError) -> Self {
        let kind = match err.kind {
            ErrorKind::Timeout => std::io::ErrorKind::TimedOut,
            ErrorKind::AccessDenied => std::io::ErrorKind::PermissionDenied,
            ErrorKind::InvalidArgument => std::io::ErrorKind::InvalidInput,
            ErrorKind::NoDevice | ErrorKind::NotAttached => std::io::ErrorKind::NotConnected,
            ErrorKind::MalformedDescriptor => std::io::ErrorKind::InvalidData,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Type alias for USB results
pub type Result<T> = std::result::Result<T, UsbError>;

/// Linux errno values used by usbfs
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const ENXIO: i32 = 6;
    pub const EBADF: i32 = 9;
    pub const EACCES: i32 = 13;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const EPIPE: i32 = 32;
    pub const ETIME: i32 = 62;
    pub const ENOSR: i32 = 63;
    pub const ECOMM: i32 = 70;
    pub const EPROTO: i32 = 71;
    pub const EOVERFLOW: i32 = 75;
    pub const EILSEQ: i32 = 84;
    pub const ECONNRESET: i32 = 104;
    pub const ESHUTDOWN: i32 = 108;
    pub const ETIMEDOUT: i32 = 110;
    pub const EREMOTEIO: i32 = 121;
}

/// macOS IOReturn codes (low 10 bits) and IOUSBFamily completion codes
pub mod io_return {
    pub const USB_CRC: u32 = 0x01;
    pub const USB_BITSTUFF: u32 = 0x02;
    pub const USB_DATA_TOGGLE: u32 = 0x03;
    pub const USB_PID_CHECK: u32 = 0x06;
    pub const USB_WRONG_PID: u32 = 0x07;
    pub const USB_BUFFER_OVERRUN: u32 = 0x0c;
    pub const USB_BUFFER_UNDERRUN: u32 = 0x0d;
    pub const USB_INTERFACE_NOT_FOUND: u32 = 0x4e;
    pub const USB_PIPE_STALLED: u32 = 0x4f;
    pub const USB_TRANSACTION_RETURNED: u32 = 0x50;
    pub const USB_TRANSACTION_TIMEOUT: u32 = 0x51;
    pub const USB_CONFIG_NOT_FOUND: u32 = 0x56;
    pub const USB_ENDPOINT_NOT_FOUND: u32 = 0x57;
    pub const USB_NOT_ENOUGH_PIPES: u32 = 0x5e;
    pub const USB_TOO_MANY_PIPES: u32 = 0x60;
    pub const USB_UNKNOWN_PIPE: u32 = 0x61;
    pub const ERROR: u32 = 0x2bc;
    pub const NO_DEVICE: u32 = 0x2c0;
    pub const NOT_PRIVILEGED: u32 = 0x2c1;
    pub const BAD_ARGUMENT: u32 = 0x2c2;
    pub const EXCLUSIVE_ACCESS: u32 = 0x2c5;
    pub const INTERNAL_ERROR: u32 = 0x2c9;
    pub const IO_ERROR: u32 = 0x2ca;
    pub const NOT_OPEN: u32 = 0x2cd;
    pub const BUSY: u32 = 0x2d5;
    pub const TIMEOUT: u32 = 0x2d6;
    pub const NOT_READY: u32 = 0x2d8;
    pub const NOT_ATTACHED: u32 = 0x2d9;
    pub const NOT_PERMITTED: u32 = 0x2e2;
    pub const UNDERRUN: u32 = 0x2e7;
    pub const OVERRUN: u32 = 0x2e8;
    pub const ABORTED: u32 = 0x2eb;
    pub const NO_BANDWIDTH: u32 = 0x2ec;
    pub const NOT_RESPONDING: u32 = 0x2ed;
}
