//! Claimed bulk interface
//!
//! Wraps an open rusb device handle whose bulk interface has been claimed.
//! Releasing gives the interface back and reattaches the kernel driver if
//! one was detached on claim.

use super::transfers::{bulk_read, bulk_write};
use bulk::{BulkChannel, BulkEndpoints, ChannelError};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, warn};

pub struct RusbChannel {
    /// Open device handle, None once released
    handle: Option<DeviceHandle<Context>>,
    /// Claimed interface number
    interface: u8,
    endpoints: BulkEndpoints,
    /// Kernel driver detached by us on claim
    kernel_driver_detached: bool,
}

impl RusbChannel {
    /// Detach any kernel driver and claim `interface`
    pub fn claim(
        handle: DeviceHandle<Context>,
        interface: u8,
        endpoints: BulkEndpoints,
    ) -> Result<Self, rusb::Error> {
        let kernel_driver_detached = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            interface, e
                        );
                        false
                    }
                }
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {}: {}", interface, e);
            if kernel_driver_detached {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(e);
        }
        debug!("Claimed interface {}", interface);

        Ok(Self {
            handle: Some(handle),
            interface,
            endpoints,
            kernel_driver_detached,
        })
    }
}

impl BulkChannel for RusbChannel {
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ChannelError> {
        let handle = self.handle.as_ref().ok_or(ChannelError::InvalidParam)?;
        bulk_write(handle, self.endpoints.out_address, data, timeout)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        let handle = self.handle.as_ref().ok_or(ChannelError::InvalidParam)?;
        bulk_read(handle, self.endpoints.in_address, buf, timeout)
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(self.interface) {
                debug!("Failed to release interface {}: {}", self.interface, e);
            }

            if self.kernel_driver_detached {
                if let Err(e) = handle.attach_kernel_driver(self.interface) {
                    debug!(
                        "Could not reattach kernel driver to interface {}: {}",
                        self.interface, e
                    );
                } else {
                    debug!("Reattached kernel driver to interface {}", self.interface);
                }
            }
            debug!("Released interface {}", self.interface);
        }
    }
}

impl Drop for RusbChannel {
    fn drop(&mut self) {
        self.release();
    }
}
