//! Hotplug and listener tests
//!
//! Topology changes are scripted on `MockBackend` and picked up either by
//! an explicit `scan_now` or by the watcher thread.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};
use usb_host::test_utils::{MockBackend, MockDevice, PanickingListener, RecordingListener};
use usb_host::{Bus, Device, ErrorKind, Host, UsbEvent, UsbListener, WatcherState};

// ============================================================================
// Test Utilities
// ============================================================================

fn gadget() -> MockDevice {
    MockDevice::new(0x04b4, 0x8613)
}

/// Bus 001 with a root hub at 1 and a gadget at 2, no watcher
fn setup() -> (MockBackend, Host) {
    let backend = MockBackend::new();
    backend.add_bus("001", Some(1));
    backend.plug("001", 1, MockDevice::hub(4), None);
    backend.plug("001", 2, gadget(), Some((1, 1)));
    let host = Host::builder()
        .backend(backend.clone())
        .spawn_watcher(false)
        .build()
        .unwrap();
    (backend, host)
}

fn recorder(host: &Host) -> Arc<RecordingListener> {
    let recorder = RecordingListener::new();
    host.add_listener(recorder.clone());
    recorder
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Appends `<tag> <event>` to a shared log
struct Tagged {
    tag: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl UsbListener for Tagged {
    fn device_added(&self, device: &Device) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} added {}", self.tag, device.address()));
    }
}

/// Calls back into the host from inside a notification
struct Reentrant {
    results: Mutex<Vec<usb_host::Result<bool>>>,
}

impl UsbListener for Reentrant {
    fn device_added(&self, device: &Device) {
        if let Some(host) = device.bus().host() {
            self.results.lock().unwrap().push(host.scan_now());
        }
    }
}

struct ShutdownOnAdd;

impl UsbListener for ShutdownOnAdd {
    fn device_added(&self, device: &Device) {
        if let Some(host) = device.bus().host() {
            host.shutdown();
        }
    }
}

// ============================================================================
// Attach and detach
// ============================================================================

mod attach_detach {
    use super::*;

    #[test]
    fn test_bus_appears_and_vanishes() {
        let backend = MockBackend::new();
        let host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .build()
            .unwrap();
        let events = recorder(&host);

        backend.add_bus("001", Some(1));
        backend.plug("001", 2, gadget(), None);
        assert!(host.scan_now().unwrap());
        assert_eq!(events.events(), vec!["bus_added 001", "device_added 001:2"]);
        let device = host.bus(1).unwrap().device(2).unwrap();

        events.clear();
        backend.remove_bus("001");
        assert!(host.scan_now().unwrap());
        assert_eq!(events.events(), vec!["device_removed 001:2", "bus_removed 001"]);
        assert_eq!(
            device.configuration().unwrap_err().kind(),
            ErrorKind::NotAttached
        );
    }

    #[test]
    fn test_plug_reported_once() {
        let (backend, host) = setup();
        let events = recorder(&host);

        backend.plug("001", 3, gadget(), Some((1, 2)));
        assert!(host.scan_now().unwrap());
        assert!(!host.scan_now().unwrap());

        assert_eq!(events.events(), vec!["device_added 001:3"]);
        assert_eq!(host.device("usb-1-2").unwrap().address(), 3);
    }

    #[test]
    fn test_unplug_detaches_device() {
        let (backend, host) = setup();
        let events = recorder(&host);
        let device = host.bus(1).unwrap().device(2).unwrap();

        backend.unplug("001", 2);
        assert!(host.scan_now().unwrap());

        assert_eq!(events.events(), vec!["device_removed 001:2"]);
        assert!(!device.is_open());
        assert_eq!(
            device.configuration().unwrap_err().kind(),
            ErrorKind::NotAttached
        );
        assert_eq!(device.product().unwrap_err().kind(), ErrorKind::NotAttached);
        assert!(host.bus(1).unwrap().device(2).is_none());
    }

    #[test]
    fn test_replug_is_a_new_device() {
        let (backend, host) = setup();
        let before = host.bus(1).unwrap().device(2).unwrap();

        backend.unplug("001", 2);
        host.scan_now().unwrap();
        backend.plug("001", 2, gadget(), Some((1, 1)));
        host.scan_now().unwrap();

        let after = host.bus(1).unwrap().device(2).unwrap();
        assert_ne!(before, after);
        assert!(after.is_open());
    }

    #[test]
    fn test_bus_removal_order() {
        let (backend, host) = setup();
        let events = recorder(&host);
        let bus = host.bus(1).unwrap();

        backend.remove_bus("001");
        assert!(host.scan_now().unwrap());

        assert_eq!(
            events.events(),
            vec!["device_removed 001:2", "device_removed 001:1", "bus_removed 001"]
        );
        assert!(host.busses().is_empty());
        assert!(bus.devices().is_empty());
        assert!(bus.root_hub().is_none());
    }

    #[test]
    fn test_bus_added_before_its_devices() {
        let (backend, host) = setup();
        let events = recorder(&host);

        backend.add_bus("002", Some(2));
        backend.plug("002", 1, MockDevice::hub(2), None);
        host.scan_now().unwrap();

        assert_eq!(events.events(), vec!["bus_added 002", "device_added 002:1"]);
        assert_eq!(host.bus(2).unwrap().bus_id(), "usb-2");
    }

    #[test]
    fn test_bus_numbering() {
        let backend = MockBackend::new();
        backend.add_bus("a", None);
        backend.add_bus("b", None);
        backend.add_bus("c", Some(5));
        let host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .build()
            .unwrap();

        assert_eq!(host.bus_named("a").unwrap().number(), 1);
        assert_eq!(host.bus_named("b").unwrap().number(), 2);
        assert_eq!(host.bus_named("c").unwrap().number(), 5);
        assert_eq!(host.bus(5).unwrap().name(), "c");
        assert_eq!(host.bus_named("a").unwrap().host(), Some(host.clone()));
    }

    #[test]
    fn test_bus_numbers_skip_zero_on_wrap() {
        let (backend, host) = setup();
        let mut numbers = Vec::new();
        for _ in 0..300 {
            backend.add_bus("x", None);
            host.scan_now().unwrap();
            numbers.push(host.bus_named("x").unwrap().number());
            backend.remove_bus("x");
            host.scan_now().unwrap();
        }

        assert!(numbers.iter().all(|&n| n >= 2));
        assert_eq!(numbers[0], 2);
        assert_eq!(numbers[253], 255);
        // Wrapped past 0 and past 1, which bus 001 holds
        assert_eq!(numbers[254], 2);
        assert_eq!(host.bus(1).unwrap().name(), "001");
    }

    #[test]
    fn test_bus_numbers_exhausted() {
        let backend = MockBackend::new();
        for i in 0..256 {
            backend.add_bus(&format!("x{:03}", i), None);
        }
        let host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .build()
            .unwrap();

        let mut numbers: Vec<u8> = host.busses().iter().map(|b| b.number()).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=255).collect::<Vec<u8>>());
        assert!(host.bus_named("x255").is_none());

        backend.remove_bus("x000");
        host.scan_now().unwrap();
        assert_eq!(host.bus_named("x255").unwrap().number(), 1);
    }

    #[test]
    fn test_counter_avoids_platform_numbers() {
        let backend = MockBackend::new();
        backend.add_bus("a", None);
        backend.add_bus("b", Some(1));
        backend.plug("a", 1, MockDevice::hub(2), None);
        backend.plug("b", 1, MockDevice::hub(4), None);
        let host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .build()
            .unwrap();

        assert_eq!(host.bus_named("b").unwrap().number(), 1);
        assert_eq!(host.bus_named("a").unwrap().number(), 2);
        let b_hub = host.device("usb-1").unwrap();
        assert_eq!(b_hub.bus().name(), "b");
        assert_eq!(b_hub.num_ports().unwrap(), 4);
        let a_hub = host.device("usb-2").unwrap();
        assert_eq!(a_hub.bus().name(), "a");
        assert_eq!(a_hub.num_ports().unwrap(), 2);
    }

    #[test]
    fn test_late_platform_number_collision() {
        let backend = MockBackend::new();
        backend.add_bus("a", None);
        backend.plug("a", 1, MockDevice::hub(2), None);
        let host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .build()
            .unwrap();
        assert_eq!(host.bus_named("a").unwrap().number(), 1);

        backend.add_bus("b", Some(1));
        backend.plug("b", 1, MockDevice::hub(4), None);
        host.scan_now().unwrap();

        assert_eq!(host.bus_named("a").unwrap().number(), 1);
        assert_eq!(host.bus_named("b").unwrap().number(), 2);
        assert_eq!(host.device("usb-1").unwrap().bus().name(), "a");
        assert_eq!(host.device("usb-2").unwrap().bus().name(), "b");
    }
}

// ============================================================================
// Listener protocol
// ============================================================================

mod listeners {
    use super::*;

    #[test]
    fn test_panicking_listener_isolated() {
        let (backend, host) = setup();
        host.add_listener(Arc::new(PanickingListener));
        let events = recorder(&host);

        backend.plug("001", 3, gadget(), Some((1, 2)));
        assert!(host.scan_now().unwrap());

        assert_eq!(events.events(), vec!["device_added 001:3"]);
        assert!(host.bus(1).unwrap().device(3).is_some());
    }

    #[test]
    fn test_registration_order() {
        let (backend, host) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            host.add_listener(Arc::new(Tagged {
                tag,
                log: log.clone(),
            }));
        }

        backend.plug("001", 3, gadget(), Some((1, 2)));
        host.scan_now().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first added 3", "second added 3", "third added 3"]
        );
    }

    #[test]
    fn test_remove_listener() {
        let (backend, host) = setup();
        let events = RecordingListener::new();
        let listener: Arc<dyn UsbListener> = events.clone();
        host.add_listener(listener.clone());

        assert!(host.remove_listener(&listener));
        assert!(!host.remove_listener(&listener));

        backend.plug("001", 3, gadget(), Some((1, 2)));
        host.scan_now().unwrap();
        assert!(events.events().is_empty());
    }

    #[test]
    fn test_startup_listener_sees_initial_topology() {
        let backend = MockBackend::new();
        backend.add_bus("001", Some(1));
        backend.plug("001", 2, gadget(), Some((1, 1)));
        backend.plug("001", 1, MockDevice::hub(4), None);
        let events = RecordingListener::new();

        let _host = Host::builder()
            .backend(backend.clone())
            .spawn_watcher(false)
            .startup_listener(events.clone())
            .build()
            .unwrap();

        assert_eq!(
            events.events(),
            vec!["bus_added 001", "device_added 001:1", "device_added 001:2"]
        );
    }

    #[test]
    fn test_scan_from_listener_is_noop() {
        let (backend, host) = setup();
        let reentrant = Arc::new(Reentrant {
            results: Mutex::new(Vec::new()),
        });
        host.add_listener(reentrant.clone());

        backend.plug("001", 3, gadget(), Some((1, 2)));
        assert!(host.scan_now().unwrap());

        let results = reentrant.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Ok(false)));
    }

    #[test]
    fn test_event_display() {
        let (_backend, host) = setup();
        let bus = host.bus(1).unwrap();
        let device = bus.device(2).unwrap();
        assert_eq!(UsbEvent::BusAdded(bus).to_string(), "bus added: 001");
        assert_eq!(
            UsbEvent::DeviceRemoved(device).to_string(),
            "device removed: mock:001:2"
        );
    }

    #[tokio::test]
    async fn test_subscribe_stream() {
        let (backend, host) = setup();
        let events = host.subscribe();

        backend.plug("001", 3, gadget(), Some((1, 2)));
        host.scan_now().unwrap();
        backend.unplug("001", 3);
        host.scan_now().unwrap();

        match events.recv().await.unwrap() {
            UsbEvent::DeviceAdded(device) => assert_eq!(device.address(), 3),
            other => panic!("unexpected {:?}", other),
        }
        match events.recv().await.unwrap() {
            UsbEvent::DeviceRemoved(device) => assert!(!device.is_open()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(events.is_empty());
    }
}

// ============================================================================
// Change detection
// ============================================================================

mod change_detection {
    use super::*;

    #[test]
    fn test_unchanged_backend_skips_snapshot() {
        let (backend, host) = setup();
        let events = recorder(&host);

        backend.plug("001", 3, gadget(), Some((1, 2)));
        backend.set_last_changed(Some(UNIX_EPOCH));
        assert!(!host.scan_now().unwrap());
        assert!(events.events().is_empty());

        backend.touch();
        assert!(host.scan_now().unwrap());
        assert_eq!(events.events(), vec!["device_added 001:3"]);
    }

    #[test]
    fn test_unknown_change_time_always_scans() {
        let (backend, host) = setup();
        backend.plug("001", 3, gadget(), Some((1, 2)));
        backend.set_last_changed(None);
        assert!(host.scan_now().unwrap());
        assert!(!host.scan_now().unwrap());
    }

    #[test]
    fn test_snapshot_failure_at_build() {
        let backend = MockBackend::new();
        backend.add_bus("001", Some(1));
        backend.fail_snapshot(Some(ErrorKind::AccessDenied));

        let err = Host::builder()
            .backend(backend)
            .spawn_watcher(false)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[test]
    fn test_snapshot_failure_keeps_tree() {
        let (backend, host) = setup();
        backend.fail_snapshot(Some(ErrorKind::Io));
        backend.touch();
        assert_eq!(host.scan_now().unwrap_err().kind(), ErrorKind::Io);
        assert_eq!(host.bus(1).unwrap().devices().len(), 2);

        backend.fail_snapshot(None);
        backend.touch();
        assert!(!host.scan_now().unwrap());
    }

    #[test]
    fn test_empty_backend() {
        let host = Host::builder()
            .backend(MockBackend::new())
            .spawn_watcher(false)
            .build()
            .unwrap();
        assert!(host.busses().is_empty());
        assert_eq!(host.backend_name(), "mock");
    }
}

// ============================================================================
// Shutdown and watcher
// ============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_shutdown_tears_down() {
        let (_backend, host) = setup();
        let events = recorder(&host);
        let device = host.bus(1).unwrap().device(2).unwrap();

        host.shutdown();

        assert_eq!(
            events.events(),
            vec!["device_removed 001:2", "device_removed 001:1", "bus_removed 001"]
        );
        assert!(host.is_shut_down());
        assert!(host.busses().is_empty());
        assert_eq!(device.speed(), usb_protocol::Speed::High);
        assert_eq!(
            device.configuration().unwrap_err().kind(),
            ErrorKind::NotAttached
        );
        assert_eq!(host.scan_now().unwrap_err().kind(), ErrorKind::Canceled);

        host.shutdown();
        assert_eq!(events.events().len(), 3);
    }

    #[test]
    fn test_shutdown_from_listener() {
        let (backend, host) = setup();
        host.add_listener(Arc::new(ShutdownOnAdd));
        let events = recorder(&host);

        backend.plug("001", 3, gadget(), Some((1, 2)));
        assert!(host.scan_now().unwrap());

        assert!(host.is_shut_down());
        assert!(host.busses().is_empty());
        assert_eq!(events.count("device_added"), 1);
        assert_eq!(events.count("device_removed"), 3);
        assert_eq!(events.count("bus_removed"), 1);
    }

    #[test]
    fn test_watcher_picks_up_changes() {
        let backend = MockBackend::new();
        backend.add_bus("001", Some(1));
        backend.plug("001", 1, MockDevice::hub(4), None);
        let host = Host::builder()
            .backend(backend.clone())
            .poll_period(Duration::from_millis(10))
            .build()
            .unwrap();
        let events = recorder(&host);
        assert!(host.watcher_state().is_some());

        backend.plug("001", 2, gadget(), Some((1, 1)));
        wait_for("device_added", || events.count("device_added") == 1);
        assert!(host.bus(1).unwrap().device(2).is_some());

        backend.unplug("001", 2);
        wait_for("device_removed", || events.count("device_removed") == 1);

        host.shutdown();
        assert_eq!(host.watcher_state(), None);
        assert_eq!(events.count("bus_removed"), 1);
    }

    #[test]
    fn test_watcher_state_reported() {
        let backend = MockBackend::new();
        let host = Host::builder()
            .backend(backend)
            .poll_period(Duration::from_millis(10))
            .build()
            .unwrap();
        wait_for("watcher sleep", || {
            host.watcher_state() == Some(WatcherState::Sleeping)
        });
        host.shutdown();
    }

    #[test]
    fn test_bus_handles_outlive_host() {
        let (_backend, host) = setup();
        let bus: Bus = host.bus(1).unwrap();
        drop(host);
        assert!(bus.host().is_none());
        assert!(bus.devices().is_empty());
    }
}
