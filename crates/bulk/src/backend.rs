//! Enumeration/open boundary
//!
//! The registry and sessions reach the native USB stack only through these
//! two traits. `tester` implements them on rusb; [`crate::test_utils`]
//! implements them in memory.

use crate::error::ChannelError;
use crate::types::{AllowedDeviceId, AttachedDevice, DeviceStrings};
use std::time::Duration;

/// Host USB stack: discovery and claiming
pub trait UsbBackend: Send + Sync {
    /// Transfer channel handed out by [`UsbBackend::claim`]
    type Channel: BulkChannel;

    /// List attached bulk-capable interfaces
    ///
    /// `allowed` is a hint so a backend can skip reading descriptors of
    /// devices that will be filtered out anyway; the registry filters again.
    /// Fails only when the enumeration mechanism itself is unavailable.
    fn scan(&self, allowed: &[AllowedDeviceId]) -> Result<Vec<AttachedDevice>, ChannelError>;

    /// Read the manufacturer, product and serial number strings
    fn strings(&self, device: &AttachedDevice) -> Result<DeviceStrings, ChannelError>;

    /// Claim the bulk interface and return its transfer channel
    fn claim(&self, device: &AttachedDevice) -> Result<Self::Channel, ChannelError>;
}

/// Claimed bulk IN/OUT endpoint pair
pub trait BulkChannel: Send {
    /// Write `data` to the bulk OUT endpoint, returning bytes accepted
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ChannelError>;

    /// Read into `buf` from the bulk IN endpoint, returning bytes received
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError>;

    /// Release the interface; best effort, never fails
    fn release(&mut self);
}
