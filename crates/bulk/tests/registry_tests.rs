//! Device Registry Integration Tests
//!
//! Exercises the public registry API against the in-memory backend.
//!
//! # Test Scenarios
//! - Allow-list filtering (property based)
//! - Count and listing agreement
//! - Hot-plug behaviour across scans
//!
//! Run with: `cargo test -p bulk --test registry_tests`

use bulk::test_utils::{FakeBackend, FakeDevice};
use bulk::{AllowedDeviceId, DeviceIndex, ErrorKind, Registry};
use proptest::prelude::*;
use std::collections::BTreeSet;

// ============================================================================
// Allow-list Filtering
// ============================================================================

/// Small ID space so generated devices and allow-list entries overlap often
fn identity_strategy() -> impl Strategy<Value = (u16, u16)> {
    (0x8765u16..=0x8767u16, 0x1234u16..=0x1236u16)
}

proptest! {
    /// Property: a device is listed iff its identity is allow-listed
    #[test]
    fn prop_listed_iff_allowed(
        attached in proptest::collection::vec(identity_strategy(), 0..8),
        allowed in proptest::collection::vec(identity_strategy(), 0..5),
    ) {
        let backend = FakeBackend::new();
        for (vid, pid) in &attached {
            backend.plug(FakeDevice::echo(*vid, *pid));
        }
        let registry = Registry::new(backend);
        for (vid, pid) in &allowed {
            registry.add_allowed_device(*vid, *pid);
        }

        let allowed_set: BTreeSet<(u16, u16)> = allowed.iter().copied().collect();
        let expected = attached.iter().filter(|id| allowed_set.contains(id)).count();

        let listed = registry.list_available_devices().unwrap();
        prop_assert_eq!(listed.len(), expected);
        prop_assert_eq!(registry.device_count().unwrap(), expected);

        for index in listed {
            let desc = registry.describe_device(index).unwrap();
            prop_assert!(registry.is_allowed(AllowedDeviceId::new(desc.vendor_id, desc.product_id)));
        }
    }

    /// Property: adding the same pair repeatedly never changes the listing
    #[test]
    fn prop_add_allowed_device_idempotent(repeats in 1usize..5) {
        let backend = FakeBackend::new();
        backend.plug(FakeDevice::echo(0x8765, 0x1234));
        backend.plug(FakeDevice::echo(0x8765, 0x1240));
        let registry = Registry::new(backend);

        registry.add_allowed_device(0x8765, 0x1234);
        let first = registry.list_available_devices().unwrap();
        for _ in 0..repeats {
            registry.add_allowed_device(0x8765, 0x1234);
        }
        prop_assert_eq!(registry.list_available_devices().unwrap(), first);
        prop_assert_eq!(registry.allowed_devices().len(), 1);
    }
}

// ============================================================================
// Enumeration Snapshot Tests
// ============================================================================

#[test]
fn test_enumeration_count_matches_indices() {
    let backend = FakeBackend::new();
    backend.plug(FakeDevice::echo(0x8765, 0x1234));
    backend.plug(FakeDevice::echo(0x8765, 0x1241));
    backend.plug(FakeDevice::echo(0x1234, 0x5678));
    let registry = Registry::new(backend);
    for pid in [0x1234, 0x1240, 0x1241] {
        registry.add_allowed_device(0x8765, pid);
    }

    let snapshot = registry.enumerate().unwrap();
    assert_eq!(snapshot.count(), 2);
    assert_eq!(snapshot.indices(), &[DeviceIndex(0), DeviceIndex(1)]);
    assert!(snapshot.contains(DeviceIndex(1)));
    assert!(!snapshot.contains(DeviceIndex(2)));
}

#[test]
fn test_allowed_devices_sorted() {
    let registry = Registry::new(FakeBackend::new());
    registry.add_allowed_device(0x8765, 0x1241);
    registry.add_allowed_device(0x8765, 0x1234);
    registry.add_allowed_device(0x0001, 0xffff);

    assert_eq!(
        registry.allowed_devices(),
        vec![
            AllowedDeviceId::new(0x0001, 0xffff),
            AllowedDeviceId::new(0x8765, 0x1234),
            AllowedDeviceId::new(0x8765, 0x1241),
        ]
    );
}

// ============================================================================
// Hot-plug Tests
// ============================================================================

#[test]
fn test_hot_plug_between_scans() {
    let backend = FakeBackend::new();
    let registry = Registry::new(backend.clone());
    registry.add_allowed_device(0x8765, 0x1234);
    assert_eq!(registry.device_count().unwrap(), 0);

    let key = backend.plug(FakeDevice::echo(0x8765, 0x1234));
    assert_eq!(registry.device_count().unwrap(), 1);

    backend.unplug(key);
    assert_eq!(registry.device_count().unwrap(), 0);
    assert_eq!(
        registry.describe_device(DeviceIndex(0)).unwrap_err().kind(),
        ErrorKind::DeviceNotFound
    );
}

#[test]
fn test_enumeration_recovers_after_outage() {
    let backend = FakeBackend::new();
    backend.plug(FakeDevice::echo(0x8765, 0x1234));
    let registry = Registry::new(backend.clone());
    registry.add_allowed_device(0x8765, 0x1234);

    backend.set_enumeration_available(false);
    assert_eq!(
        registry.device_count().unwrap_err().kind(),
        ErrorKind::EnumerationUnavailable
    );

    backend.set_enumeration_available(true);
    assert_eq!(registry.device_count().unwrap(), 1);
}
