//! Control-message engine
//!
//! Runs [`ControlMessage`]s against a [`DeviceBackend`] and implements the
//! standard descriptor fetches on top of it.

use crate::backend::DeviceBackend;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use usb_protocol::control;
use usb_protocol::descriptor::{
    DESCRIPTOR_LEN_CONFIGURATION, DESCRIPTOR_LEN_DEVICE, DESCRIPTOR_TYPE_DEVICE,
    DESCRIPTOR_TYPE_HUB, DESCRIPTOR_TYPE_SUPERSPEED_HUB,
};
use usb_protocol::{
    ConfigHeader, ControlMessage, DeviceDescriptor, ErrorKind, Result, Speed, UsbError,
};

/// Validate and run `msg`, trimming a read's buffer to the reply length
pub(crate) fn execute(backend: &dyn DeviceBackend, msg: &mut ControlMessage) -> Result<usize> {
    msg.validate()?;
    let actual = backend.control(msg)?;
    if msg.is_read() {
        msg.set_actual_length(actual);
    }
    debug!(
        "Control transfer: request_type={:#04x}, request={:#04x}, value={:#06x}, index={:#06x}, {} bytes",
        msg.request_type(),
        msg.request(),
        msg.value(),
        msg.index(),
        actual
    );
    Ok(actual)
}

/// Run a read and return the reply bytes
pub(crate) fn read(backend: &dyn DeviceBackend, mut msg: ControlMessage) -> Result<Vec<u8>> {
    execute(backend, &mut msg)?;
    Ok(msg.into_data())
}

/// Kinds worth retrying while a freshly reset device settles
fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Stalled
            | ErrorKind::Timeout
            | ErrorKind::ProtocolError
            | ErrorKind::Overrun
            | ErrorKind::Underrun
            | ErrorKind::Canceled
            | ErrorKind::Io
    )
}

/// GET_DESCRIPTOR(DEVICE), with up to `retries` extra attempts on USB errors
pub(crate) fn fetch_device_descriptor(
    backend: &dyn DeviceBackend,
    retries: u32,
) -> Result<DeviceDescriptor> {
    let mut attempt = 0;
    loop {
        let msg =
            control::get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, 0, DESCRIPTOR_LEN_DEVICE as u16);
        match read(backend, msg) {
            Ok(reply) => return DeviceDescriptor::parse(&reply),
            Err(e) if attempt < retries && is_transient(e.kind()) => {
                attempt += 1;
                debug!("Device descriptor fetch failed ({}), retry {}", e, attempt);
                thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
            }
            Err(e) => return Err(e.context_with("get device descriptor")),
        }
    }
}

/// GET_CONFIGURATION; the reply byte is used as a descriptor index
pub(crate) fn fetch_configuration_index(backend: &dyn DeviceBackend) -> Result<u8> {
    let reply = read(backend, control::get_configuration())?;
    reply
        .first()
        .copied()
        .ok_or_else(|| UsbError::new(ErrorKind::Underrun, "get configuration: empty reply"))
}

/// Read configuration `index`: header first, then the full `wTotalLength` blob
pub(crate) fn fetch_config_blob(backend: &dyn DeviceBackend, index: u8) -> Result<Vec<u8>> {
    let header = read(
        backend,
        control::get_config_descriptor(index, DESCRIPTOR_LEN_CONFIGURATION as u16),
    )?;
    let total = ConfigHeader::parse(&header)?.total_length();
    if usize::from(total) <= header.len() {
        return Ok(header);
    }
    let blob = read(backend, control::get_config_descriptor(index, total))?;
    if blob.len() < usize::from(total) {
        return Err(UsbError::malformed(format!(
            "configuration {}: got {} of {} bytes",
            index,
            blob.len(),
            total
        )));
    }
    Ok(blob)
}

/// String descriptor zero
pub(crate) fn fetch_languages(backend: &dyn DeviceBackend) -> Result<Vec<u16>> {
    let reply = read(backend, control::get_languages())?;
    control::decode_languages(&reply)
}

pub(crate) fn fetch_string(backend: &dyn DeviceBackend, index: u8, lang_id: u16) -> Result<String> {
    let reply = read(backend, control::get_string(index, lang_id))?;
    control::decode_string(&reply)
}

/// `bNbrPorts` from the hub class descriptor
pub(crate) fn fetch_hub_ports(backend: &dyn DeviceBackend, speed: Speed) -> Result<u8> {
    let descriptor_type = if matches!(speed, Speed::Super | Speed::SuperPlus) {
        DESCRIPTOR_TYPE_SUPERSPEED_HUB
    } else {
        DESCRIPTOR_TYPE_HUB
    };
    let reply = read(backend, control::get_hub_descriptor(descriptor_type))?;
    match reply.get(2) {
        Some(&ports) => Ok(ports),
        None => {
            warn!("Short hub descriptor ({} bytes)", reply.len());
            Err(UsbError::malformed("hub descriptor too short"))
        }
    }
}
