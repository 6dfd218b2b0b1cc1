//! Operator Shell Integration Tests
//!
//! Drives the shell state machine with scripted console input against the
//! in-memory USB bus.
//!
//! # Test Scenarios
//! - Full enumerate → select → echo → retry cycles
//! - Faulty devices and error reporting
//! - Presets, end of input and cancellation
//! - One-shot device listing
//!
//! Run with: `cargo test -p tester --test shell_tests`

use bulk::test_utils::{EchoBehavior, FakeBackend, FakeDevice};
use bulk::{AllowedDeviceId, CancelToken, ChannelError, DeviceIndex, Registry};
use std::io::Cursor;
use std::time::Duration;
use tester::build_registry;
use tester::config::TesterConfig;
use tester::shell::{Shell, ShellExit, ShellOptions, ShellSummary, list_devices};

fn quick_config() -> TesterConfig {
    let mut config = TesterConfig::default();
    config.usb.read_timeout = Duration::from_millis(100);
    config.usb.write_timeout = Duration::from_millis(100);
    config.discovery.poll_interval = Duration::from_millis(10);
    config.discovery.poll_timeout = Duration::from_millis(200);
    config
}

fn registry_with(devices: Vec<FakeDevice>) -> (FakeBackend, Registry<FakeBackend>) {
    let backend = FakeBackend::new();
    for device in devices {
        backend.plug(device);
    }
    let registry = build_registry(backend.clone(), &quick_config(), &[]).unwrap();
    (backend, registry)
}

fn unattended(device: u32, repeats: u32) -> ShellOptions {
    ShellOptions {
        device: Some(DeviceIndex(device)),
        repeats: Some(repeats),
        once: true,
        sweep: false,
    }
}

fn run_shell(
    registry: &Registry<FakeBackend>,
    options: ShellOptions,
    input: &str,
) -> (ShellSummary, String) {
    let config = quick_config();
    let mut output = Vec::new();
    let summary = Shell::new(
        registry,
        &config,
        options,
        CancelToken::new(),
        Cursor::new(input.as_bytes().to_vec()),
        &mut output,
    )
    .run()
    .unwrap();
    (summary, String::from_utf8(output).unwrap())
}

// ============================================================================
// Interactive Cycle Tests
// ============================================================================

mod interactive {
    use super::*;

    #[test]
    fn test_select_and_pass() {
        let (_backend, registry) = registry_with(vec![
            FakeDevice::echo(0x8765, 0x1234).with_strings("SEGGER", "Bulk test", "13245678"),
        ]);

        let (summary, out) = run_shell(&registry, ShellOptions::default(), "0\n5\nn\n");

        assert!(out.contains("Looking for devices..."));
        assert!(out.contains("Found 1 device\n"));
        assert!(out.contains("Found the following device 0:"));
        assert!(out.contains("  Serial no.  : 13245678"));
        assert!(out.contains("  Vendor name : SEGGER"));
        assert!(out.contains("  Vendor ID   : 0x8765"));
        assert!(out.contains("  Product ID  : 0x1234"));
        assert!(out.contains("  Interface   : 0x00"));
        assert!(out.contains("Vendor: SEGGER, Product: Bulk test"));
        assert!(out.contains(".....\n"));
        assert!(out.contains("Echo test passed: 5 packet(s) of 1 byte(s) echoed."));
        assert!(!out.contains("WARNING"));

        assert_eq!(summary.exit, ShellExit::Finished);
        assert_eq!(summary.runs, 1);
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_failed_run_sets_exit_code() {
        let backend = FakeBackend::new();
        let key =
            backend.plug(FakeDevice::echo(0x8765, 0x1234).with_behavior(EchoBehavior::SilentAfter(3)));
        let registry = build_registry(backend.clone(), &quick_config(), &[]).unwrap();

        let (summary, out) = run_shell(&registry, ShellOptions::default(), "0\n5\nn\n");

        assert!(out.contains("...\n"));
        assert!(out.contains("Echo test FAILED after 3 of 5 packet(s)"));
        assert!(out.contains("expected 1, got 0"));
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(backend.transfer_counts(key).writes, 4);
        assert!(!backend.is_claimed(key));
    }

    #[test]
    fn test_retry_runs_again() {
        let (_backend, registry) = registry_with(vec![FakeDevice::echo(0x8765, 0x1234)]);

        let (summary, out) = run_shell(&registry, ShellOptions::default(), "0\n2\ny\n0\n3\nn\n");

        assert_eq!(summary.runs, 2);
        assert_eq!(out.matches("Looking for devices...").count(), 2);
        assert_eq!(summary.last_report.unwrap().completed, 3);
    }

    #[test]
    fn test_quit_at_selection() {
        let (_backend, registry) = registry_with(vec![FakeDevice::echo(0x8765, 0x1234)]);

        let (summary, _out) = run_shell(&registry, ShellOptions::default(), "q\n");

        assert_eq!(summary.exit, ShellExit::Quit);
        assert_eq!(summary.runs, 0);
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_invalid_selection_offers_retry() {
        let (_backend, registry) = registry_with(vec![FakeDevice::echo(0x8765, 0x1234)]);

        let (summary, out) = run_shell(&registry, ShellOptions::default(), "abc\nn\n");
        assert!(out.contains("Invalid device number 'abc'."));
        assert!(out.contains("Do you want to retry? [y/N]: "));
        assert_eq!(summary.exit, ShellExit::Quit);

        let (summary, out) = run_shell(&registry, ShellOptions::default(), "5\nn\n");
        assert!(out.contains("Device 5 is not in the list."));
        assert_eq!(summary.exit, ShellExit::Quit);
    }

    #[test]
    fn test_end_of_input() {
        let (_backend, registry) = registry_with(vec![FakeDevice::echo(0x8765, 0x1234)]);

        let (summary, _out) = run_shell(&registry, ShellOptions::default(), "");
        assert_eq!(summary.exit, ShellExit::EndOfInput);
    }
}

// ============================================================================
// Device Condition Tests
// ============================================================================

mod device_conditions {
    use super::*;

    #[test]
    fn test_unexpected_product_name_warns() {
        let (_backend, registry) = registry_with(vec![
            FakeDevice::echo(0x8765, 0x1234).with_strings("Acme", "Widget", "1"),
        ]);

        let (_summary, out) = run_shell(&registry, ShellOptions::default(), "q\n");
        assert!(out.contains("WARNING: Expected product name is \"Bulk test\""));
    }

    #[test]
    fn test_busy_device_reports_open_failure() {
        let (_backend, registry) = registry_with(vec![
            FakeDevice::echo(0x8765, 0x1234).with_claim_error(ChannelError::Busy),
        ]);

        let (summary, out) = run_shell(&registry, ShellOptions::default(), "0\nn\n");
        assert!(out.contains("Could not open the device"));
        assert!(out.contains("device busy"));
        assert_eq!(summary.runs, 0);
    }

    #[test]
    fn test_no_device_times_out() {
        let (_backend, registry) = registry_with(Vec::new());

        let (summary, out) = run_shell(&registry, ShellOptions::default(), "");
        assert!(out.contains("No device found within 200ms."));
        assert_eq!(summary.exit, ShellExit::TimedOut);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_enumeration_unavailable_is_fatal() {
        let (backend, registry) = registry_with(vec![FakeDevice::echo(0x8765, 0x1234)]);
        backend.set_enumeration_available(false);
        let config = quick_config();
        let mut output = Vec::new();

        let result = Shell::new(
            &registry,
            &config,
            ShellOptions::default(),
            CancelToken::new(),
            Cursor::new(Vec::new()),
            &mut output,
        )
        .run();

        assert!(result.is_err());
        let out = String::from_utf8(output).unwrap();
        assert!(out.contains("Check that the USB stack is accessible"));
    }

    #[test]
    fn test_unlisted_device_never_shown() {
        let (_backend, registry) = registry_with(vec![
            FakeDevice::echo(0x1111, 0x2222),
            FakeDevice::echo(0x8765, 0x1241),
        ]);

        let (_summary, out) = run_shell(&registry, ShellOptions::default(), "q\n");
        assert!(out.contains("Found 1 device\n"));
        assert!(out.contains("Product ID  : 0x1241"));
        assert!(!out.contains("0x1111"));
    }
}

// ============================================================================
// Preset and Cancellation Tests
// ============================================================================

mod presets {
    use super::*;

    #[test]
    fn test_unattended_run() {
        let (_backend, registry) = registry_with(vec![FakeDevice::echo(0x8765, 0x1234)]);
        let (summary, out) = run_shell(&registry, unattended(0, 3), "");

        assert_eq!(summary.exit, ShellExit::Finished);
        assert_eq!(summary.runs, 1);
        assert_eq!(summary.exit_code(), 0);
        assert!(out.contains("...\n"));
        assert!(out.contains("3 byte(s) echoed in "));
        assert!(out.contains(" KB/s)"));
        assert!(!out.contains("Do you want to retry"));
    }

    #[test]
    fn test_unattended_busy_device_fails() {
        let (_backend, registry) = registry_with(vec![
            FakeDevice::echo(0x8765, 0x1234).with_claim_error(ChannelError::Busy),
        ]);

        let (summary, out) = run_shell(&registry, unattended(0, 3), "");

        assert!(out.contains("Could not open the device"));
        assert!(!out.contains("Do you want to retry"));
        assert_eq!(summary.exit, ShellExit::Failed);
        assert_eq!(summary.runs, 0);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_unattended_missing_device_fails() {
        let (_backend, registry) = registry_with(vec![FakeDevice::echo(0x8765, 0x1234)]);

        let (summary, out) = run_shell(&registry, unattended(4, 3), "");

        assert!(out.contains("Device 4 is not in the list."));
        assert!(!out.contains("Do you want to retry"));
        assert_eq!(summary.exit, ShellExit::Failed);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_input_closed_after_open_failure_fails() {
        let (_backend, registry) = registry_with(vec![
            FakeDevice::echo(0x8765, 0x1234).with_claim_error(ChannelError::Busy),
        ]);

        let (summary, out) = run_shell(&registry, ShellOptions::default(), "0\n");

        assert!(out.contains("Do you want to retry? [y/N]: "));
        assert_eq!(summary.exit, ShellExit::Failed);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_unattended_size_sweep() {
        let backend = FakeBackend::new();
        let key = backend.plug(FakeDevice::echo(0x8765, 0x1234));
        let registry = build_registry(backend.clone(), &quick_config(), &[]).unwrap();
        let options = ShellOptions {
            sweep: true,
            ..unattended(0, 2)
        };

        let (summary, out) = run_shell(&registry, options, "");

        assert!(out.contains("Size sweep passed: 128 packet(s) of 1-64 byte(s) echoed and verified."));
        assert!(out.contains("4160 byte(s) echoed in "));
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(backend.transfer_counts(key).writes, 128);
    }

    #[test]
    fn test_short_write_is_reported_as_such() {
        let backend = FakeBackend::new();
        backend.plug(FakeDevice::echo(0x8765, 0x1234).with_behavior(EchoBehavior::ShortWrite(4)));
        let registry = build_registry(backend, &quick_config(), &[]).unwrap();
        let options = ShellOptions {
            sweep: true,
            ..unattended(0, 1)
        };

        let (summary, out) = run_shell(&registry, options, "");

        assert!(out.contains("device accepted 4 of 5 byte(s) in iteration 5"));
        assert!(!out.contains("wrong data"));
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let (_backend, registry) = registry_with(vec![FakeDevice::echo(0x8765, 0x1234)]);
        let config = quick_config();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut output = Vec::new();

        let summary = Shell::new(
            &registry,
            &config,
            ShellOptions::default(),
            cancel,
            Cursor::new(Vec::new()),
            &mut output,
        )
        .run()
        .unwrap();

        assert_eq!(summary.exit, ShellExit::Cancelled);
        assert_eq!(summary.runs, 0);
    }

    #[test]
    fn test_extra_allowed_device() {
        let backend = FakeBackend::new();
        backend.plug(FakeDevice::echo(0x1234, 0x5678));
        let extra = [AllowedDeviceId::new(0x1234, 0x5678)];
        let registry = build_registry(backend, &quick_config(), &extra).unwrap();

        assert_eq!(registry.allowed_devices().len(), 4);
        assert_eq!(registry.device_count().unwrap(), 1);
    }
}

// ============================================================================
// Device Listing Tests
// ============================================================================

mod listing {
    use super::*;

    #[test]
    fn test_list_devices_text() {
        let (_backend, registry) = registry_with(vec![
            FakeDevice::echo(0x8765, 0x1234).with_strings("SEGGER", "Bulk test", "42"),
        ]);
        let mut out = Vec::new();

        let count = list_devices(&registry, false, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(count, 1);
        assert!(text.contains("0: 0x8765:0x1234 interface 0x00 \"SEGGER\" \"Bulk test\" serial 42"));
    }

    #[test]
    fn test_list_devices_json() {
        let (_backend, registry) = registry_with(vec![FakeDevice::echo(0x8765, 0x1240)]);
        let mut out = Vec::new();

        list_devices(&registry, true, &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(value["allowed_devices"].as_array().unwrap().len(), 3);
        assert_eq!(value["devices"][0]["product_id"], 0x1240);
        assert_eq!(value["devices"][0]["product_name"], "Bulk test");
    }

    #[test]
    fn test_list_devices_empty() {
        let (_backend, registry) = registry_with(Vec::new());
        let mut out = Vec::new();

        assert_eq!(list_devices(&registry, false, &mut out).unwrap(), 0);
        assert!(String::from_utf8(out).unwrap().contains("No allowed devices attached."));
    }
}
