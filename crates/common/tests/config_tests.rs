//! Configuration file tests
//!
//! Round-trips through real files in a temporary directory.

use common::{Error, UsbConfig};
use std::fs;
use tempfile::TempDir;

// ============================================================================
// Loading
// ============================================================================

mod loading {
    use super::*;

    #[test]
    fn test_load_full_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usb.toml");
        fs::write(
            &path,
            r#"
[host]
log_level = "debug"
poll_period_ms = 2000
transfer_timeout_ms = 5000
interrupt_timeout_ms = 250
descriptor_retries = 2
locale = "de_DE"

[filters]
vendor_id = "0x04b4"
product_id = "0x8613"
"#,
        )
        .unwrap();

        let config = UsbConfig::load(Some(path)).unwrap();
        assert_eq!(config.host.log_level, "debug");
        assert_eq!(config.host.poll_period_ms, 2000);
        assert_eq!(config.host.interrupt_timeout_ms, 250);
        assert_eq!(config.host.descriptor_retries, 2);
        assert_eq!(config.host.locale.as_deref(), Some("de_DE"));
        assert_eq!(config.filters.vendor_id().unwrap(), Some(0x04b4));
        assert_eq!(config.filters.product_id().unwrap(), Some(0x8613));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let result = UsbConfig::load(Some(dir.path().join("absent.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usb.toml");
        fs::write(&path, "[host\nlog_level = ").unwrap();
        assert!(matches!(UsbConfig::load(Some(path)), Err(Error::Parse(_))));
    }

    #[test]
    fn test_invalid_filter_rejected_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usb.toml");
        fs::write(&path, "[filters]\nvendor_id = \"1234\"\n").unwrap();
        assert!(matches!(UsbConfig::load(Some(path)), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_file_is_defaults() {
        let config = UsbConfig::load_from_str("").unwrap();
        assert_eq!(config, UsbConfig::default());
    }
}

// ============================================================================
// Saving
// ============================================================================

mod saving {
    use super::*;

    #[test]
    fn test_save_creates_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("usb.toml");

        let mut config = UsbConfig::default();
        config.host.poll_period_ms = 1500;
        config.filters.vendor_id = Some("0x1d50".to_string());
        config.save(&path).unwrap();

        assert!(path.exists());
        let loaded = UsbConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_saved_file_omits_unset_filters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usb.toml");
        UsbConfig::default().save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("poll_period_ms = 750"));
        assert!(!text.contains("vendor_id"));
        assert!(!text.contains("locale"));
    }
}
