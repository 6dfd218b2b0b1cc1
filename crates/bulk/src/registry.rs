//! Device registry
//!
//! Holds the allow-list and answers enumeration queries. Every query rescans
//! the backend, so counts and listings are live snapshots.
//!
//! Device indices come from a fixed-capacity slot table: a device that stays
//! attached keeps its slot across scans, slots of removed devices are freed
//! and handed to newcomers lowest-first.

use crate::backend::UsbBackend;
use crate::error::{BulkError, ChannelError, Result};
use crate::types::{AllowedDeviceId, AttachedDevice, DeviceDescriptor, DeviceIndex, DeviceKey};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Default slot table capacity
pub const DEFAULT_MAX_DEVICES: usize = 10;

/// Atomic result of one scan
///
/// Count and indices always agree because both come from the same scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Enumeration {
    indices: Vec<DeviceIndex>,
}

impl Enumeration {
    /// Number of attached allow-listed devices
    pub fn count(&self) -> usize {
        self.indices.len()
    }

    /// Indices in ascending order
    pub fn indices(&self) -> &[DeviceIndex] {
        &self.indices
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn contains(&self, index: DeviceIndex) -> bool {
        self.indices.contains(&index)
    }
}

/// Slot table mapping indices to physical devices
#[derive(Debug)]
struct SlotTable {
    slots: Vec<Option<AttachedDevice>>,
}

impl SlotTable {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Replace the table contents with the devices of a new scan
    fn update(&mut self, devices: Vec<AttachedDevice>) {
        let present: HashSet<DeviceKey> = devices.iter().map(|d| d.key).collect();

        for slot in &mut self.slots {
            if let Some(device) = slot
                && !present.contains(&device.key)
            {
                debug!(
                    "Device {:04x}:{:04x} (bus={}, addr={}, intf={}) removed",
                    device.vendor_id,
                    device.product_id,
                    device.key.bus,
                    device.key.address,
                    device.key.interface
                );
                *slot = None;
            }
        }

        for device in devices {
            if let Some(existing) = self
                .slots
                .iter_mut()
                .flatten()
                .find(|d| d.key == device.key)
            {
                *existing = device;
                continue;
            }

            match self.slots.iter_mut().position(|s| s.is_none()) {
                Some(idx) => {
                    debug!(
                        "Device {:04x}:{:04x} (bus={}, addr={}, intf={}) added as index {}",
                        device.vendor_id,
                        device.product_id,
                        device.key.bus,
                        device.key.address,
                        device.key.interface,
                        idx
                    );
                    self.slots[idx] = Some(device);
                }
                None => {
                    warn!(
                        "Device table full ({} slots), ignoring {:04x}:{:04x} on bus {} addr {}",
                        self.slots.len(),
                        device.vendor_id,
                        device.product_id,
                        device.key.bus,
                        device.key.address
                    );
                }
            }
        }
    }

    fn indices(&self) -> Vec<DeviceIndex> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(idx, _)| DeviceIndex(idx as u32))
            .collect()
    }

    fn get(&self, index: DeviceIndex) -> Option<&AttachedDevice> {
        self.slots.get(index.0 as usize)?.as_ref()
    }
}

/// Marks a physical device as held by an open session
///
/// Dropping the guard releases the claim.
#[derive(Debug)]
pub(crate) struct ClaimGuard {
    key: DeviceKey,
    claims: Arc<Mutex<HashSet<DeviceKey>>>,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        lock(&self.claims).remove(&self.key);
    }
}

/// Device registry
///
/// Owned by the shell and passed to [`crate::Session::open`]. The allow-list
/// is read-mostly and safe for concurrent readers.
pub struct Registry<B: UsbBackend> {
    backend: B,
    allowed: RwLock<BTreeSet<AllowedDeviceId>>,
    slots: Mutex<SlotTable>,
    claims: Arc<Mutex<HashSet<DeviceKey>>>,
}

impl<B: UsbBackend> Registry<B> {
    /// Create a registry with the default slot table capacity
    pub fn new(backend: B) -> Self {
        Self::with_capacity(backend, DEFAULT_MAX_DEVICES)
    }

    /// Create a registry tracking at most `max_devices` devices
    pub fn with_capacity(backend: B, max_devices: usize) -> Self {
        Self {
            backend,
            allowed: RwLock::new(BTreeSet::new()),
            slots: Mutex::new(SlotTable::new(max_devices)),
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Get the backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Add a (vendor ID, product ID) pair to the allow-list
    ///
    /// Adding a pair that is already present is a no-op. Returns whether the
    /// pair was newly added.
    pub fn add_allowed_device(&self, vendor_id: u16, product_id: u16) -> bool {
        let id = AllowedDeviceId::new(vendor_id, product_id);
        let added = self
            .allowed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        if added {
            info!("Allowed device {}", id);
        }
        added
    }

    /// Remove a pair from the allow-list; returns whether it was present
    pub fn remove_allowed_device(&self, vendor_id: u16, product_id: u16) -> bool {
        let id = AllowedDeviceId::new(vendor_id, product_id);
        let removed = self
            .allowed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed {
            info!("Removed device {} from allow-list", id);
        }
        removed
    }

    /// Sorted allow-list
    pub fn allowed_devices(&self) -> Vec<AllowedDeviceId> {
        self.allowed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Check whether an identity is allow-listed
    pub fn is_allowed(&self, id: AllowedDeviceId) -> bool {
        self.allowed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    /// Scan once and return count and indices together
    pub fn enumerate(&self) -> Result<Enumeration> {
        let indices = self.rescan()?;
        Ok(Enumeration { indices })
    }

    /// Number of attached allow-listed devices
    pub fn device_count(&self) -> Result<usize> {
        Ok(self.enumerate()?.count())
    }

    /// Indices of attached allow-listed devices, ascending
    pub fn list_available_devices(&self) -> Result<Vec<DeviceIndex>> {
        Ok(self.enumerate()?.indices)
    }

    /// Describe the device at `index`
    ///
    /// Fails with `DeviceNotFound` if nothing allow-listed is attached there.
    /// Unreadable string descriptors come back as empty strings.
    pub fn describe_device(&self, index: DeviceIndex) -> Result<DeviceDescriptor> {
        let device = self
            .resolve(index)?
            .ok_or(BulkError::DeviceNotFound { index })?;

        let strings = match self.backend.strings(&device) {
            Ok(strings) => strings,
            Err(ChannelError::NoDevice | ChannelError::NotFound) => {
                debug!("Device {} disappeared while reading strings", index);
                return Err(BulkError::DeviceNotFound { index });
            }
            Err(e) => {
                warn!("Failed to read string descriptors of device {}: {}", index, e);
                Default::default()
            }
        };

        Ok(DeviceDescriptor::new(index, &device, strings))
    }

    /// Rescan and look up the device currently at `index`
    pub(crate) fn resolve(&self, index: DeviceIndex) -> Result<Option<AttachedDevice>> {
        self.rescan()?;
        Ok(lock(&self.slots).get(index).cloned())
    }

    /// Mark a device as held by a session
    ///
    /// Returns `None` if another session already holds it.
    pub(crate) fn try_claim(&self, key: DeviceKey) -> Option<ClaimGuard> {
        let mut claims = lock(&self.claims);
        if !claims.insert(key) {
            return None;
        }
        Some(ClaimGuard {
            key,
            claims: Arc::clone(&self.claims),
        })
    }

    fn rescan(&self) -> Result<Vec<DeviceIndex>> {
        let allowed = self.allowed_devices();
        let scanned = self.backend.scan(&allowed).map_err(|e| {
            warn!("USB enumeration failed: {}", e);
            BulkError::EnumerationUnavailable {
                reason: e.to_string(),
            }
        })?;

        let matching: Vec<AttachedDevice> = scanned
            .into_iter()
            .filter(|device| allowed.binary_search(&device.identity()).is_ok())
            .collect();

        let mut slots = lock(&self.slots);
        slots.update(matching);
        let indices = slots.indices();
        debug!("Enumerated {} allowed device(s)", indices.len());
        Ok(indices)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
