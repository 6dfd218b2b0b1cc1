//! In-memory USB backend for tests
//!
//! Provides a fake bus that tests plug devices into, with configurable echo
//! behaviour, so the registry, sessions and the operator shell can be
//! exercised without hardware.
//!
//! # Example
//!
//! ```
//! use bulk::test_utils::{FakeBackend, FakeDevice};
//! use bulk::Registry;
//!
//! let backend = FakeBackend::new();
//! backend.plug(FakeDevice::echo(0x8765, 0x1234));
//!
//! let registry = Registry::new(backend);
//! registry.add_allowed_device(0x8765, 0x1234);
//! assert_eq!(registry.device_count().unwrap(), 1);
//! ```

use crate::backend::{BulkChannel, UsbBackend};
use crate::error::ChannelError;
use crate::types::{
    AllowedDeviceId, AttachedDevice, BulkEndpoints, DeviceKey, DeviceStrings, MAX_PACKET_SIZE,
};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Upper bound on how long a fake read waits before reporting a timeout
const MAX_FAKE_WAIT: Duration = Duration::from_millis(20);

/// How a fake device answers bulk writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoBehavior {
    /// Echo every packet unchanged
    Echo,
    /// Echo the first `n` packets, then stop answering
    SilentAfter(usize),
    /// Accept at most `n` bytes per write and echo those
    ShortWrite(usize),
    /// Echo every packet with all bits flipped
    Corrupt,
}

/// Device to plug into a [`FakeBackend`]
#[derive(Debug, Clone)]
pub struct FakeDevice {
    vendor_id: u16,
    product_id: u16,
    interface: u8,
    strings: Option<DeviceStrings>,
    behavior: EchoBehavior,
    claim_error: Option<ChannelError>,
}

impl FakeDevice {
    /// Conformant echo device
    pub fn echo(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            interface: 0,
            strings: Some(DeviceStrings {
                manufacturer: "Test Vendor".to_string(),
                product: "Bulk test".to_string(),
                serial_number: format!("SN{:04x}{:04x}", vendor_id, product_id),
            }),
            behavior: EchoBehavior::Echo,
            claim_error: None,
        }
    }

    pub fn with_behavior(mut self, behavior: EchoBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_strings(mut self, manufacturer: &str, product: &str, serial_number: &str) -> Self {
        self.strings = Some(DeviceStrings {
            manufacturer: manufacturer.to_string(),
            product: product.to_string(),
            serial_number: serial_number.to_string(),
        });
        self
    }

    pub fn with_serial(mut self, serial_number: &str) -> Self {
        let strings = self.strings.get_or_insert_with(DeviceStrings::default);
        strings.serial_number = serial_number.to_string();
        self
    }

    pub fn with_interface(mut self, interface: u8) -> Self {
        self.interface = interface;
        self
    }

    /// String descriptor reads fail with an I/O error
    pub fn with_unreadable_strings(mut self) -> Self {
        self.strings = None;
        self
    }

    /// Claiming the interface fails, e.g. `Busy` when another process holds it
    pub fn with_claim_error(mut self, error: ChannelError) -> Self {
        self.claim_error = Some(error);
        self
    }
}

/// Per-device transfer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounts {
    /// Write calls that reached the device
    pub writes: usize,
    /// Read calls that returned data
    pub reads: usize,
}

#[derive(Debug)]
struct PluggedDevice {
    key: DeviceKey,
    device: FakeDevice,
    pending: VecDeque<u8>,
    answered: usize,
    counts: TransferCounts,
}

#[derive(Debug)]
struct FakeBus {
    devices: Vec<PluggedDevice>,
    next_address: u8,
    enumeration_available: bool,
    claimed: HashSet<DeviceKey>,
}

impl Default for FakeBus {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            next_address: 1,
            enumeration_available: true,
            claimed: HashSet::new(),
        }
    }
}

impl FakeBus {
    fn device_mut(&mut self, key: DeviceKey) -> Option<&mut PluggedDevice> {
        self.devices.iter_mut().find(|d| d.key == key)
    }
}

/// In-memory USB bus
///
/// Clones share the same bus, so a test can keep one handle while the
/// registry owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    bus: Arc<Mutex<FakeBus>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device; returns its physical key
    pub fn plug(&self, device: FakeDevice) -> DeviceKey {
        let mut bus = self.lock();
        let key = DeviceKey {
            bus: 1,
            address: bus.next_address,
            interface: device.interface,
        };
        bus.next_address = bus.next_address.wrapping_add(1);
        bus.devices.push(PluggedDevice {
            key,
            device,
            pending: VecDeque::new(),
            answered: 0,
            counts: TransferCounts::default(),
        });
        key
    }

    /// Detach a device
    pub fn unplug(&self, key: DeviceKey) {
        let mut bus = self.lock();
        bus.devices.retain(|d| d.key != key);
        bus.claimed.remove(&key);
    }

    /// Make scans fail as if the host USB stack were inaccessible
    pub fn set_enumeration_available(&self, available: bool) {
        self.lock().enumeration_available = available;
    }

    /// Transfer counters of a device (zero if unplugged)
    pub fn transfer_counts(&self, key: DeviceKey) -> TransferCounts {
        self.lock()
            .devices
            .iter()
            .find(|d| d.key == key)
            .map(|d| d.counts)
            .unwrap_or_default()
    }

    /// Whether a channel to the device is currently claimed
    pub fn is_claimed(&self, key: DeviceKey) -> bool {
        self.lock().claimed.contains(&key)
    }

    fn lock(&self) -> MutexGuard<'_, FakeBus> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UsbBackend for FakeBackend {
    type Channel = FakeChannel;

    fn scan(&self, _allowed: &[AllowedDeviceId]) -> Result<Vec<AttachedDevice>, ChannelError> {
        let bus = self.lock();
        if !bus.enumeration_available {
            return Err(ChannelError::Other {
                message: "USB stack not accessible".to_string(),
            });
        }

        Ok(bus
            .devices
            .iter()
            .map(|d| AttachedDevice {
                key: d.key,
                vendor_id: d.device.vendor_id,
                product_id: d.device.product_id,
                endpoints: BulkEndpoints {
                    in_address: 0x81,
                    out_address: 0x01,
                    max_packet_in: MAX_PACKET_SIZE as u16,
                    max_packet_out: MAX_PACKET_SIZE as u16,
                },
            })
            .collect())
    }

    fn strings(&self, device: &AttachedDevice) -> Result<DeviceStrings, ChannelError> {
        let bus = self.lock();
        let plugged = bus
            .devices
            .iter()
            .find(|d| d.key == device.key)
            .ok_or(ChannelError::NoDevice)?;
        plugged.device.strings.clone().ok_or(ChannelError::Io)
    }

    fn claim(&self, device: &AttachedDevice) -> Result<FakeChannel, ChannelError> {
        let mut bus = self.lock();
        let plugged = bus
            .devices
            .iter()
            .find(|d| d.key == device.key)
            .ok_or(ChannelError::NoDevice)?;
        if let Some(err) = &plugged.device.claim_error {
            return Err(err.clone());
        }
        if !bus.claimed.insert(device.key) {
            return Err(ChannelError::Busy);
        }

        Ok(FakeChannel {
            bus: Arc::clone(&self.bus),
            key: device.key,
            released: false,
        })
    }
}

/// Channel to a fake device
#[derive(Debug)]
pub struct FakeChannel {
    bus: Arc<Mutex<FakeBus>>,
    key: DeviceKey,
    released: bool,
}

impl FakeChannel {
    fn lock(&self) -> MutexGuard<'_, FakeBus> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BulkChannel for FakeChannel {
    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, ChannelError> {
        if self.released {
            return Err(ChannelError::InvalidParam);
        }
        let mut bus = self.lock();
        let device = bus.device_mut(self.key).ok_or(ChannelError::NoDevice)?;
        device.counts.writes += 1;

        let accepted = match device.device.behavior {
            EchoBehavior::ShortWrite(max) => data.len().min(max),
            _ => data.len(),
        };
        let payload = &data[..accepted];

        match device.device.behavior {
            EchoBehavior::Echo | EchoBehavior::ShortWrite(_) => {
                device.pending.extend(payload);
            }
            EchoBehavior::SilentAfter(n) => {
                if device.answered < n {
                    device.pending.extend(payload);
                }
            }
            EchoBehavior::Corrupt => {
                device.pending.extend(payload.iter().map(|b| !b));
            }
        }
        device.answered += 1;

        Ok(accepted)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        if self.released {
            return Err(ChannelError::InvalidParam);
        }
        {
            let mut bus = self.lock();
            let device = bus.device_mut(self.key).ok_or(ChannelError::NoDevice)?;
            if !device.pending.is_empty() {
                let n = buf.len().min(device.pending.len());
                for (slot, byte) in buf.iter_mut().zip(device.pending.drain(..n)) {
                    *slot = byte;
                }
                device.counts.reads += 1;
                return Ok(n);
            }
        }

        std::thread::sleep(timeout.min(MAX_FAKE_WAIT));
        Err(ChannelError::Timeout)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.lock().claimed.remove(&self.key);
        }
    }
}
