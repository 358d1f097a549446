//! Device tree model and rendering

use serde::Serialize;
use usb_host::{Bus, Device, Host};
use usb_protocol::Speed;

#[derive(Debug, Serialize)]
pub struct BusInfo {
    pub number: u8,
    pub name: String,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    pub address: u8,
    pub port_id: Option<String>,
    pub native_id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub speed: Speed,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DeviceInfo>,
}

impl DeviceInfo {
    fn collect(device: &Device, all: &[Device]) -> Self {
        let desc = device.device_descriptor();
        let mut children: Vec<&Device> = all
            .iter()
            .filter(|d| d.hub().as_ref() == Some(device))
            .collect();
        children.sort_by_key(|d| d.hub_port());

        Self {
            address: device.address(),
            port_id: device.port_identifier().ok().map(|p| p.to_string()),
            native_id: device.native_id().to_string(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            class: desc.class(),
            speed: device.speed(),
            // Strings are best effort: a device may refuse them
            manufacturer: device.manufacturer().ok().flatten(),
            product: device.product().ok().flatten(),
            serial: device.serial_number().ok().flatten(),
            children: children
                .into_iter()
                .map(|child| Self::collect(child, all))
                .collect(),
        }
    }
}

impl BusInfo {
    pub fn collect(bus: &Bus) -> Self {
        let all = bus.devices();
        // Roots are devices whose parent hub is not in the table
        let devices = all
            .iter()
            .filter(|d| d.hub().is_none_or(|hub| !hub.is_open()))
            .map(|d| DeviceInfo::collect(d, &all))
            .collect();
        Self {
            number: bus.number(),
            name: bus.name().to_string(),
            devices,
        }
    }
}

pub fn collect(host: &Host) -> Vec<BusInfo> {
    host.busses().iter().map(BusInfo::collect).collect()
}

/// One line per device, indented by hub depth
pub fn render(buses: &[BusInfo]) -> String {
    let mut out = String::new();
    for bus in buses {
        out.push_str(&format!("Bus {} (usb-{})\n", bus.name, bus.number));
        for device in &bus.devices {
            render_device(&mut out, device, 1);
        }
    }
    out
}

fn render_device(out: &mut String, device: &DeviceInfo, depth: usize) {
    let label = match (&device.manufacturer, &device.product) {
        (Some(m), Some(p)) => format!("{} {}", m, p),
        (None, Some(p)) => p.clone(),
        (Some(m), None) => m.clone(),
        (None, None) => String::from("-"),
    };
    out.push_str(&format!(
        "{}{} {:04x}:{:04x} [{:?}] {}  {}\n",
        "  ".repeat(depth),
        device.port_id.as_deref().unwrap_or("?"),
        device.vendor_id,
        device.product_id,
        device.speed,
        label,
        device.native_id
    ));
    for child in &device.children {
        render_device(out, child, depth + 1);
    }
}
