//! Hotplug notifications
//!
//! Listeners are called on the thread that runs the scan, normally the
//! watcher thread. They must not block for long. A panic inside a callback
//! is caught and logged and the next listener still runs.

use crate::bus::Bus;
use crate::device::Device;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Receiver of topology changes
///
/// For a given bus, `bus_added` comes before any `device_added` on it and
/// every `device_removed` comes before `bus_removed`.
pub trait UsbListener: Send + Sync {
    fn bus_added(&self, _bus: &Bus) {}

    fn bus_removed(&self, _bus: &Bus) {}

    fn device_added(&self, _device: &Device) {}

    /// The device is already detached; its I/O fails with `NotAttached`
    fn device_removed(&self, _device: &Device) {}
}

/// A topology change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    BusAdded(Bus),
    BusRemoved(Bus),
    DeviceAdded(Device),
    DeviceRemoved(Device),
}

impl fmt::Display for UsbEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbEvent::BusAdded(bus) => write!(f, "bus added: {}", bus.name()),
            UsbEvent::BusRemoved(bus) => write!(f, "bus removed: {}", bus.name()),
            UsbEvent::DeviceAdded(device) => write!(f, "device added: {}", device.native_id()),
            UsbEvent::DeviceRemoved(device) => {
                write!(f, "device removed: {}", device.native_id())
            }
        }
    }
}

/// Forwards notifications into an unbounded channel
///
/// Events sent after the receiver is dropped are discarded.
pub struct ChannelListener {
    tx: async_channel::Sender<UsbEvent>,
}

impl ChannelListener {
    pub fn new(tx: async_channel::Sender<UsbEvent>) -> Self {
        Self { tx }
    }

    /// A listener and the receiving end of its channel
    pub fn channel() -> (Self, async_channel::Receiver<UsbEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (Self::new(tx), rx)
    }

    fn send(&self, event: UsbEvent) {
        // Closed only when the subscriber went away
        let _ = self.tx.try_send(event);
    }
}

impl UsbListener for ChannelListener {
    fn bus_added(&self, bus: &Bus) {
        self.send(UsbEvent::BusAdded(bus.clone()));
    }

    fn bus_removed(&self, bus: &Bus) {
        self.send(UsbEvent::BusRemoved(bus.clone()));
    }

    fn device_added(&self, device: &Device) {
        self.send(UsbEvent::DeviceAdded(device.clone()));
    }

    fn device_removed(&self, device: &Device) {
        self.send(UsbEvent::DeviceRemoved(device.clone()));
    }
}

/// Deliver `event` to each listener in registration order
pub(crate) fn dispatch(listeners: &[Arc<dyn UsbListener>], event: &UsbEvent) {
    for listener in listeners {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match event {
            UsbEvent::BusAdded(bus) => listener.bus_added(bus),
            UsbEvent::BusRemoved(bus) => listener.bus_removed(bus),
            UsbEvent::DeviceAdded(device) => listener.device_added(device),
            UsbEvent::DeviceRemoved(device) => listener.device_removed(device),
        }));

        if let Err(payload) = result {
            warn!("Listener panicked on {}: {}", event, panic_message(&*payload));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(&*payload), "owned boom");

        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }
}
