//! Device identity and transfer buffer types
//!
//! This module defines the identity types the registry filters on, the
//! descriptor handed to the operator shell, and the fixed-capacity packet
//! buffer used by the echo protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum packet size of the echo protocol (one full-speed bulk packet)
pub const MAX_PACKET_SIZE: usize = 64;

/// Allow-listed device identity
///
/// A (vendor ID, product ID) pair. Parses from and displays as
/// `"0xVVVV:0xPPPP"`, the format used in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllowedDeviceId {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
}

impl AllowedDeviceId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for AllowedDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}:{:#06x}", self.vendor_id, self.product_id)
    }
}

/// Error returned when a `VID:PID` string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid device id '{input}': {reason}")]
pub struct ParseDeviceIdError {
    pub input: String,
    pub reason: &'static str,
}

impl FromStr for AllowedDeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseDeviceIdError {
            input: s.to_string(),
            reason,
        };

        let (vid, pid) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| err("expected VID:PID"))?;

        let vendor_id = parse_hex_u16(vid).ok_or_else(|| err("vendor id is not a 16-bit hex number"))?;
        let product_id =
            parse_hex_u16(pid).ok_or_else(|| err("product id is not a 16-bit hex number"))?;

        Ok(Self::new(vendor_id, product_id))
    }
}

/// Parse `0x1234`, `0X1234` or bare `1234` as hexadecimal
fn parse_hex_u16(s: &str) -> Option<u16> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() || digits.len() > 4 {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

/// Enumeration-local device handle
///
/// Only meaningful within the enumeration snapshot it came from. A device that
/// stays attached keeps its index across scans, but a re-enumeration may hand a
/// freed index to a different device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIndex(pub u32);

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical identity of one bulk interface on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
    /// Interface number carrying the bulk endpoints
    pub interface: u8,
}

/// Bulk endpoint pair of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    /// Bulk IN endpoint address (direction bit set)
    pub in_address: u8,
    /// Bulk OUT endpoint address
    pub out_address: u8,
    /// Max packet size of the IN endpoint
    pub max_packet_in: u16,
    /// Max packet size of the OUT endpoint
    pub max_packet_out: u16,
}

/// A bulk-capable interface reported by a backend scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    pub key: DeviceKey,
    pub vendor_id: u16,
    pub product_id: u16,
    pub endpoints: BulkEndpoints,
}

impl AttachedDevice {
    pub fn identity(&self) -> AllowedDeviceId {
        AllowedDeviceId::new(self.vendor_id, self.product_id)
    }
}

/// String descriptors of a device
///
/// Missing descriptors are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStrings {
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}

/// Discovered-device identity
///
/// Read-only snapshot; goes stale if the physical device is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Index within the enumeration this descriptor came from
    pub device_index: DeviceIndex,
    /// Serial number string
    pub serial_number: String,
    /// Manufacturer string
    pub vendor_name: String,
    /// Product string
    pub product_name: String,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Interface number of the bulk interface
    pub interface_number: u8,
}

impl DeviceDescriptor {
    pub(crate) fn new(index: DeviceIndex, device: &AttachedDevice, strings: DeviceStrings) -> Self {
        Self {
            device_index: index,
            serial_number: strings.serial_number,
            vendor_name: strings.manufacturer,
            product_name: strings.product,
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            interface_number: device.key.interface,
        }
    }
}

/// Fixed-capacity transfer buffer
///
/// The transfer length is always passed separately and must not exceed
/// [`MAX_PACKET_SIZE`].
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    data: [u8; MAX_PACKET_SIZE],
}

impl Packet {
    /// Zero-filled packet
    pub const fn zeroed() -> Self {
        Self {
            data: [0; MAX_PACKET_SIZE],
        }
    }

    /// Reference echo payload: byte `i` holds `i`
    pub fn pattern() -> Self {
        let mut data = [0u8; MAX_PACKET_SIZE];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Self { data }
    }

    pub const fn capacity(&self) -> usize {
        MAX_PACKET_SIZE
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("capacity", &MAX_PACKET_SIZE)
            .finish()
    }
}
