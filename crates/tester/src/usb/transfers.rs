//! USB transfer execution
//!
//! Synchronous bulk transfers on a claimed interface, with rusb errors mapped
//! to channel errors.

use bulk::ChannelError;
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::debug;

/// Write `data` to a bulk OUT endpoint
pub fn bulk_write(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, ChannelError> {
    debug!(
        "Bulk OUT: endpoint={:#x}, data_len={}, timeout={}ms",
        endpoint,
        data.len(),
        timeout.as_millis()
    );

    handle
        .write_bulk(endpoint, data, timeout)
        .map_err(map_rusb_error)
}

/// Read from a bulk IN endpoint into `buf`
pub fn bulk_read(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, ChannelError> {
    debug!(
        "Bulk IN: endpoint={:#x}, buffer_len={}, timeout={}ms",
        endpoint,
        buf.len(),
        timeout.as_millis()
    );

    handle
        .read_bulk(endpoint, buf, timeout)
        .map_err(map_rusb_error)
}

/// Map rusb::Error to ChannelError
pub fn map_rusb_error(err: rusb::Error) -> ChannelError {
    match err {
        rusb::Error::Timeout => ChannelError::Timeout,
        rusb::Error::Pipe => ChannelError::Pipe,
        rusb::Error::NoDevice => ChannelError::NoDevice,
        rusb::Error::NotFound => ChannelError::NotFound,
        rusb::Error::Busy => ChannelError::Busy,
        rusb::Error::Overflow => ChannelError::Overflow,
        rusb::Error::Io => ChannelError::Io,
        rusb::Error::InvalidParam => ChannelError::InvalidParam,
        rusb::Error::Access => ChannelError::Access,
        _ => ChannelError::Other {
            message: err.to_string(),
        },
    }
}

/// Whether an endpoint address is device-to-host
pub fn is_in_endpoint(address: u8) -> bool {
    (address & 0x80) != 0
}
