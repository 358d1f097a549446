//! Device object tests
//!
//! Every test runs against `MockBackend` with the watcher disabled, so
//! scans happen only when a test asks for one and the call log is exact.

use std::sync::Arc;
use usb_host::test_utils::{ConfigBuilder, MockBackend, MockDevice, MockOp, RecordingListener};
use usb_host::{Device, ErrorKind, Host, UsbListener};
use usb_protocol::descriptor::{
    DESCRIPTOR_TYPE_CONFIGURATION, DESCRIPTOR_TYPE_DEVICE, DESCRIPTOR_TYPE_STRING,
};
use usb_protocol::{ControlMessage, Direction, Recipient, RequestKind, request_type};

// ============================================================================
// Test Utilities
// ============================================================================

const ENGLISH: u16 = 0x0409;
const GERMAN: u16 = 0x0407;

fn fx2_config() -> Vec<u8> {
    ConfigBuilder::new(1)
        .interface(0, 0, 0xff)
        .endpoint(0x82, 2, 512, 0)
        .endpoint(0x02, 2, 512, 0)
        .endpoint(0x81, 3, 64, 4)
        .endpoint(0x01, 3, 64, 4)
        .interface(0, 1, 0xff)
        .endpoint(0x86, 2, 512, 0)
        .build()
}

fn fx2() -> MockDevice {
    MockDevice::new(0x04b4, 0x8613)
        .manufacturer(1)
        .product(2)
        .serial(3)
        .strings(ENGLISH, &[(1, "Cypress"), (2, "FX2"), (3, "0001")])
        .configuration(fx2_config())
}

/// Bus 001 with a root hub at address 1 and `device` on its port 1
fn setup(device: MockDevice) -> (MockBackend, Host, String) {
    let backend = MockBackend::new();
    backend.add_bus("001", Some(1));
    backend.plug("001", 1, MockDevice::hub(4), None);
    let id = backend.plug("001", 2, device, Some((1, 1)));
    let host = Host::builder()
        .backend(backend.clone())
        .spawn_watcher(false)
        .locale("en_US")
        .build()
        .unwrap();
    (backend, host, id)
}

fn device(host: &Host, address: u8) -> Device {
    host.bus(1).unwrap().device(address).unwrap()
}

fn string_requests(backend: &MockBackend, id: &str, index: u8) -> usize {
    backend
        .ops(id)
        .iter()
        .filter(|op| {
            op.is_get_descriptor(DESCRIPTOR_TYPE_STRING)
                && matches!(op, MockOp::Control { value, .. } if (*value & 0xff) as u8 == index)
        })
        .count()
}

// ============================================================================
// Descriptors and configurations
// ============================================================================

mod descriptors {
    use super::*;

    #[test]
    fn test_single_configuration_skips_get_configuration() {
        let (backend, host, id) = setup(fx2());
        let dev = device(&host, 2);

        let desc = dev.device_descriptor();
        assert_eq!(desc.vendor_id(), 0x04b4);
        assert_eq!(desc.product_id(), 0x8613);
        assert_eq!(desc.num_configurations(), 1);
        assert_eq!(desc.as_bytes().len(), 18);

        let config = dev.configuration().unwrap();
        let blob = fx2_config();
        let header_total = usize::from(u16::from_le_bytes([blob[2], blob[3]]));
        assert_eq!(config.total_length(), header_total);
        assert_eq!(config.as_bytes(), &blob[..]);
        assert_eq!(config.device(), &dev);

        assert!(!backend.ops(&id).iter().any(MockOp::is_get_configuration));
    }

    #[test]
    fn test_multiple_configurations_issue_one_get_configuration() {
        let second = ConfigBuilder::new(2)
            .interface(0, 0, 3)
            .endpoint(0x81, 3, 8, 10)
            .build();
        let (backend, host, id) = setup(
            MockDevice::new(0x1234, 0x5678)
                .configuration(fx2_config())
                .configuration(second)
                .active_configuration(1),
        );
        let dev = device(&host, 2);
        assert_eq!(dev.device_descriptor().num_configurations(), 2);

        let config = dev.configuration().unwrap();
        assert_eq!(config.index(), 1);
        assert_eq!(config.value(), 2);
        dev.configuration().unwrap();

        let get_config: Vec<MockOp> = backend
            .ops(&id)
            .into_iter()
            .filter(MockOp::is_get_configuration)
            .collect();
        assert_eq!(get_config.len(), 1);
        assert!(matches!(
            get_config[0],
            MockOp::Control {
                request_type: 0x80,
                request: 0x08,
                length: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_descriptor_read_once_per_open() {
        let (backend, _host, id) = setup(fx2());
        let reads = backend
            .ops(&id)
            .iter()
            .filter(|op| op.is_get_descriptor(DESCRIPTOR_TYPE_DEVICE))
            .count();
        assert_eq!(reads, 1);
    }

    #[test]
    fn test_configuration_at_and_bounds() {
        let (_backend, host, _id) = setup(fx2());
        let dev = device(&host, 2);

        let config = dev.configuration_at(0).unwrap();
        assert_eq!(config.value(), 1);
        assert_eq!(config.max_power_ma(), 100);
        assert!(!config.is_self_powered());

        let err = dev.configuration_at(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigNotFound);
    }

    #[test]
    fn test_set_configuration_invalidates_cache() {
        let second = ConfigBuilder::new(2).interface(0, 0, 3).build();
        let (backend, host, id) = setup(
            MockDevice::new(0x1234, 0x5678)
                .configuration(fx2_config())
                .configuration(second)
                .active_configuration(0),
        );
        let dev = device(&host, 2);
        assert_eq!(dev.configuration().unwrap().value(), 1);

        dev.set_configuration(1).unwrap();
        let config = dev.configuration().unwrap();
        assert_eq!(config.value(), 2);
        assert!(backend.ops(&id).iter().any(|op| matches!(
            op,
            MockOp::Control {
                request_type: 0x00,
                request: 0x09,
                value: 1,
                ..
            }
        )));
        let get_config = backend
            .ops(&id)
            .iter()
            .filter(|op| op.is_get_configuration())
            .count();
        assert_eq!(get_config, 1);
    }

    #[test]
    fn test_configuration_at_caches_selected_configuration() {
        let second = ConfigBuilder::new(2).interface(0, 0, 3).build();
        let (backend, host, id) = setup(
            MockDevice::new(0x1234, 0x5678)
                .configuration(fx2_config())
                .configuration(second),
        );
        let dev = device(&host, 2);
        let config_reads = || {
            backend
                .ops(&id)
                .iter()
                .filter(|op| op.is_get_descriptor(DESCRIPTOR_TYPE_CONFIGURATION))
                .count()
        };

        dev.set_configuration(1).unwrap();
        assert_eq!(dev.configuration_at(0).unwrap().value(), 1);
        let after_other = config_reads();
        assert_eq!(dev.configuration_at(1).unwrap().value(), 2);
        let after_selected = config_reads();
        assert!(after_selected > after_other);

        let config = dev.configuration().unwrap();
        assert_eq!(config.value(), 2);
        assert_eq!(config_reads(), after_selected);
        assert!(!backend.ops(&id).iter().any(MockOp::is_get_configuration));
    }

    #[test]
    fn test_interface_and_endpoint_navigation() {
        let (_backend, host, _id) = setup(fx2());
        let dev = device(&host, 2);
        let config = dev.configuration().unwrap();

        let interfaces = config.interfaces();
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0].num_endpoints(), 4);
        assert_eq!(interfaces[1].alternate_setting(), 1);

        let iface = config.interface(0, 0).unwrap();
        let endpoint = iface.endpoint(0x82).unwrap();
        assert_eq!(endpoint.interface().device(), endpoint.device());
        assert_eq!(endpoint.device(), &dev);
        assert_eq!(endpoint.address(), 2);
        assert!(endpoint.is_input());
        assert_eq!(endpoint.direction(), Direction::ToHost);

        let total: usize = interfaces
            .iter()
            .map(|i| {
                i.as_bytes().len() + i.endpoints().iter().map(|e| e.as_bytes().len()).sum::<usize>()
            })
            .sum();
        assert_eq!(total + 9, config.total_length());

        assert_eq!(
            config.interface(3, 0).unwrap_err().kind(),
            ErrorKind::InterfaceNotFound
        );
        assert_eq!(
            iface.endpoint(0x99).unwrap_err().kind(),
            ErrorKind::EndpointNotFound
        );
    }

    #[test]
    fn test_descriptor_retries() {
        let backend = MockBackend::new();
        backend.add_bus("001", None);
        let id = backend.plug("001", 2, fx2(), None);
        backend.fail_descriptor(&id, 2);

        let host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .build()
            .unwrap();
        assert!(host.bus(1).unwrap().device(2).is_some());
        let reads = backend
            .ops(&id)
            .iter()
            .filter(|op| op.is_get_descriptor(DESCRIPTOR_TYPE_DEVICE))
            .count();
        assert_eq!(reads, 3);
    }

    #[test]
    fn test_descriptor_retries_exhausted() {
        let backend = MockBackend::new();
        backend.add_bus("001", None);
        let id = backend.plug("001", 2, fx2(), None);
        backend.fail_descriptor(&id, 10);

        let host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .descriptor_retries(1)
            .build()
            .unwrap();
        assert!(host.bus(1).unwrap().device(2).is_none());
        let ops = backend.ops(&id);
        assert_eq!(
            ops.iter()
                .filter(|op| op.is_get_descriptor(DESCRIPTOR_TYPE_DEVICE))
                .count(),
            2
        );
        assert!(ops.contains(&MockOp::Close));
    }
}

// ============================================================================
// Strings
// ============================================================================

mod strings {
    use super::*;

    #[test]
    fn test_string_cached_after_first_read() {
        let (backend, host, id) = setup(fx2());
        let dev = device(&host, 2);

        assert_eq!(dev.string(3).unwrap().as_deref(), Some("0001"));
        assert_eq!(dev.string(3).unwrap().as_deref(), Some("0001"));
        assert_eq!(string_requests(&backend, &id, 3), 1);
    }

    #[test]
    fn test_missing_string_negatively_cached() {
        let (backend, host, id) = setup(fx2());
        let dev = device(&host, 2);

        assert_eq!(dev.string(99).unwrap(), None);
        assert_eq!(string_requests(&backend, &id, 99), 1);
        assert_eq!(dev.string(99).unwrap(), None);
        assert_eq!(string_requests(&backend, &id, 99), 1);
    }

    #[test]
    fn test_string_zero_is_none() {
        let (backend, host, id) = setup(fx2());
        let dev = device(&host, 2);
        backend.clear_calls();

        assert_eq!(dev.string(0).unwrap(), None);
        assert_eq!(dev.string_in(0, ENGLISH).unwrap(), None);
        assert!(backend.ops(&id).is_empty());
    }

    #[test]
    fn test_languages_cached() {
        let (backend, host, id) = setup(fx2());
        let dev = device(&host, 2);

        assert_eq!(dev.languages().unwrap(), vec![ENGLISH]);
        assert_eq!(dev.languages().unwrap(), vec![ENGLISH]);
        assert_eq!(string_requests(&backend, &id, 0), 1);
    }

    #[test]
    fn test_no_string_table() {
        let (backend, host, id) = setup(MockDevice::new(0x1234, 0x0001).product(2));
        let dev = device(&host, 2);

        assert!(dev.languages().unwrap().is_empty());
        assert_eq!(dev.product().unwrap(), None);
        assert_eq!(dev.languages().unwrap(), Vec::<u16>::new());
        assert_eq!(string_requests(&backend, &id, 0), 1);
    }

    #[test]
    fn test_default_language_follows_locale() {
        let (_backend, host, _id) = setup(
            MockDevice::new(0x1234, 0x0001)
                .product(1)
                .strings(GERMAN, &[(1, "Geraet")])
                .strings(ENGLISH, &[(1, "Gadget")]),
        );
        let dev = device(&host, 2);

        assert_eq!(dev.product().unwrap().as_deref(), Some("Gadget"));
        assert_eq!(dev.string_in(1, GERMAN).unwrap().as_deref(), Some("Geraet"));
    }

    #[test]
    fn test_display_includes_product() {
        let (_backend, host, id) = setup(fx2());
        let dev = device(&host, 2);
        assert_eq!(dev.to_string(), format!("{{{} FX2}}", id));
        assert_eq!(dev.manufacturer().unwrap().as_deref(), Some("Cypress"));
    }
}

// ============================================================================
// Control transfers
// ============================================================================

mod control {
    use super::*;

    #[test]
    fn test_read_with_host_to_device_direction_rejected() {
        let (backend, host, id) = setup(fx2());
        let dev = device(&host, 2);
        backend.clear_calls();

        let mut msg = ControlMessage::read(
            request_type(Direction::ToDevice, RequestKind::Vendor, Recipient::Device),
            0xa0,
            0,
            0,
            4,
        );
        let err = dev.control(&mut msg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(backend.ops(&id).is_empty());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (_backend, host, _id) = setup(fx2());
        let dev = device(&host, 2);

        let mut msg = ControlMessage::write(
            request_type(Direction::ToDevice, RequestKind::Vendor, Recipient::Device),
            0xa0,
            0,
            0,
            vec![0; 4096],
        );
        assert_eq!(
            dev.control(&mut msg).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_vendor_read_trimmed_to_reply() {
        let (_backend, host, _id) = setup(fx2().vendor_reply(0xa3, &[1, 2, 3]));
        let dev = device(&host, 2);

        let mut msg = ControlMessage::read(
            request_type(Direction::ToHost, RequestKind::Vendor, Recipient::Device),
            0xa3,
            0,
            0,
            8,
        );
        assert_eq!(dev.control(&mut msg).unwrap(), 3);
        assert_eq!(msg.data(), &[1, 2, 3]);
    }

    #[test]
    fn test_unknown_request_stalls() {
        let (_backend, host, _id) = setup(fx2());
        let dev = device(&host, 2);

        let mut msg = ControlMessage::read(
            request_type(Direction::ToHost, RequestKind::Vendor, Recipient::Device),
            0x55,
            0,
            0,
            8,
        );
        assert!(dev.control(&mut msg).unwrap_err().is_stalled());
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_close_is_idempotent() {
        let (backend, host, id) = setup(fx2());
        let dev = device(&host, 2);

        dev.close();
        dev.close();
        assert!(!dev.is_open());
        assert_eq!(
            backend.ops(&id).iter().filter(|op| **op == MockOp::Close).count(),
            1
        );
        assert_eq!(dev.configuration().unwrap_err().kind(), ErrorKind::NotOpen);
        assert_eq!(dev.string(2).unwrap_err().kind(), ErrorKind::NotOpen);
        assert!(host.bus(1).unwrap().device(2).is_none());
    }

    #[test]
    fn test_closed_device_still_reported_on_unplug() {
        let (backend, host, _id) = setup(fx2());
        let recorder = RecordingListener::new();
        host.add_listener(recorder.clone() as Arc<dyn UsbListener>);

        device(&host, 2).close();
        backend.unplug("001", 2);
        assert!(host.scan_now().unwrap());
        assert_eq!(recorder.events(), vec!["device_removed 001:2"]);
    }

    #[test]
    fn test_interface_claim_and_kernel_driver() {
        let (backend, host, id) = setup(fx2().kernel_driver(0));
        let dev = device(&host, 2);
        let iface = dev.configuration().unwrap().interface(0, 0).unwrap();

        assert!(dev.kernel_driver_active(0).unwrap());
        iface.claim().unwrap();
        assert!(!dev.kernel_driver_active(0).unwrap());
        assert_eq!(backend.claimed(&id), vec![0]);

        iface.release().unwrap();
        assert!(backend.claimed(&id).is_empty());

        let alt = dev.configuration().unwrap().interface(0, 1).unwrap();
        alt.select().unwrap();
        assert!(backend.ops(&id).contains(&MockOp::SetAlternate(0, 1)));
    }

    #[test]
    fn test_cycle_port_forwarded() {
        let (backend, host, id) = setup(fx2());
        device(&host, 2).cycle_port().unwrap();
        assert!(backend.ops(&id).contains(&MockOp::CyclePort));
    }
}

// ============================================================================
// Topology and port identifiers
// ============================================================================

mod topology {
    use super::*;

    fn tree() -> (MockBackend, Host) {
        let backend = MockBackend::new();
        backend.add_bus("001", Some(1));
        backend.plug("001", 1, MockDevice::hub(4), None);
        backend.plug("001", 3, MockDevice::hub(7), Some((1, 2)));
        backend.plug("001", 4, fx2(), Some((3, 3)));
        let host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .build()
            .unwrap();
        (backend, host)
    }

    #[test]
    fn test_port_identifier_walks_hubs() {
        let (_backend, host) = tree();
        let bus = host.bus(1).unwrap();

        let root = bus.root_hub().unwrap();
        assert_eq!(root.address(), 1);
        assert_eq!(root.port_identifier().unwrap().to_string(), "usb-1");

        let dev = bus.device(4).unwrap();
        assert_eq!(dev.port_identifier().unwrap().to_string(), "usb-1-2.3");
        assert_eq!(dev.hub().unwrap().address(), 3);
        assert_eq!(dev.hub_port(), Some(3));
        assert_eq!(root.child(2).unwrap().address(), 3);
        assert_eq!(bus.bus_id(), "usb-1");
    }

    #[test]
    fn test_host_resolves_port_ids() {
        let (_backend, host) = tree();
        let dev = host.bus(1).unwrap().device(4).unwrap();

        assert_eq!(host.device("usb-1-2.3").unwrap(), dev);
        assert_eq!(host.device(dev.native_id()).unwrap(), dev);
        assert_eq!(host.device("usb-1").unwrap().address(), 1);
        assert_eq!(host.device("usb-1-9").unwrap_err().kind(), ErrorKind::NoDevice);
        assert_eq!(host.device("usb-2").unwrap_err().kind(), ErrorKind::NoDevice);
        assert_eq!(
            host.device("not-a-port").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_num_ports() {
        let (_backend, host) = tree();
        let bus = host.bus(1).unwrap();
        assert_eq!(bus.device(1).unwrap().num_ports().unwrap(), 4);
        assert_eq!(bus.device(3).unwrap().num_ports().unwrap(), 7);
        assert_eq!(bus.device(4).unwrap().num_ports().unwrap(), 0);
    }

    #[test]
    fn test_children_from_hub_enumeration() {
        let backend = MockBackend::new();
        backend.add_bus("001", Some(1));
        let root = backend.plug("001", 1, MockDevice::hub(4), None);
        backend.plug("001", 5, fx2(), None);
        backend.set_children(&root, vec![(4, 5)]);

        let host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .build()
            .unwrap();
        let dev = host.bus(1).unwrap().device(5).unwrap();
        assert_eq!(dev.hub_port(), Some(4));
        assert_eq!(dev.port_identifier().unwrap().to_string(), "usb-1-4");
        assert!(backend.ops(&root).contains(&MockOp::EnumerateChildren));
    }
}

// ============================================================================
// Filters and failed opens
// ============================================================================

mod filters {
    use super::*;

    #[test]
    fn test_vendor_filter_keeps_hubs() {
        let backend = MockBackend::new();
        backend.add_bus("001", Some(1));
        backend.plug("001", 1, MockDevice::hub(4), None);
        backend.plug("001", 2, fx2(), Some((1, 1)));
        let other = backend.plug("001", 3, MockDevice::new(0x1234, 0x0001), Some((1, 2)));

        let host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .vendor_filter(0x04b4)
            .build()
            .unwrap();
        let addresses: Vec<u8> = host
            .bus(1)
            .unwrap()
            .devices()
            .iter()
            .map(Device::address)
            .collect();
        assert_eq!(addresses, vec![1, 2]);

        backend.touch();
        host.scan_now().unwrap();
        let opens = backend
            .ops(&other)
            .iter()
            .filter(|op| **op == MockOp::Open)
            .count();
        assert_eq!(opens, 1);
    }

    #[test]
    fn test_failed_open_retried_after_replug() {
        let backend = MockBackend::new();
        backend.add_bus("001", Some(1));
        let id = backend.plug("001", 2, fx2(), None);
        backend.fail_open(&id, ErrorKind::AccessDenied);

        let host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .build()
            .unwrap();
        assert!(host.bus(1).unwrap().device(2).is_none());

        backend.touch();
        host.scan_now().unwrap();
        assert_eq!(backend.ops(&id), vec![MockOp::Open]);

        backend.unplug("001", 2);
        host.scan_now().unwrap();
        backend.plug("001", 2, fx2(), None);
        host.scan_now().unwrap();
        assert!(host.bus(1).unwrap().device(2).is_some());
    }
}
