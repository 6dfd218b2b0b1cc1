//! Device session
//!
//! A session owns the claimed bulk channel of one device and performs
//! blocking writes and reads on it.
//!
//! State machine: a session is `Open` from a successful [`Session::open`]
//! until [`Session::close`] or a channel-level failure (timeout, I/O error,
//! disconnect, cancellation), after which it is `Closed` for good. Misuse such
//! as reading from a closed session or passing a length larger than the buffer
//! fails without changing the state.

use crate::backend::{BulkChannel, UsbBackend};
use crate::cancel::CancelToken;
use crate::error::{BulkError, ChannelError, Direction, OpenFailure, Result, TransferFailure};
use crate::registry::{ClaimGuard, Registry};
use crate::types::{BulkEndpoints, DeviceDescriptor, DeviceIndex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default read timeout (5 seconds)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default write timeout (5 seconds)
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest single wait of a cancellable read
const READ_SLICE: Duration = Duration::from_millis(100);

/// Session settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Timeout of [`Session::read`]
    pub read_timeout: Duration,
    /// Timeout of [`Session::write`]
    pub write_timeout: Duration,
    /// Token that aborts blocking transfers
    pub cancel: Option<CancelToken>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            cancel: None,
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

struct OpenChannel<C> {
    channel: C,
    _claim: ClaimGuard,
}

/// Open connection to one device
pub struct Session<C: BulkChannel> {
    descriptor: DeviceDescriptor,
    endpoints: BulkEndpoints,
    options: SessionOptions,
    open: Option<OpenChannel<C>>,
}

impl<C: BulkChannel> Session<C> {
    /// Open the device at `index`
    ///
    /// Fails with `OpenFailed` if no allow-listed device is attached at the
    /// index, the identity is not allow-listed, another session holds the
    /// device, or the backend cannot claim the interface. Nothing stays
    /// claimed on failure.
    pub fn open<B>(registry: &Registry<B>, index: DeviceIndex, options: SessionOptions) -> Result<Self>
    where
        B: UsbBackend<Channel = C>,
    {
        let device = registry
            .resolve(index)?
            .ok_or(BulkError::open(index, OpenFailure::NotAttached))?;

        let identity = device.identity();
        if !registry.is_allowed(identity) {
            warn!("Refusing to open device {}: {} not allowed", index, identity);
            return Err(BulkError::open(index, OpenFailure::NotAllowed(identity)));
        }

        let claim = registry
            .try_claim(device.key)
            .ok_or(BulkError::open(index, OpenFailure::AlreadyOpen))?;

        let strings = registry.backend().strings(&device).unwrap_or_else(|e| {
            debug!("Could not read string descriptors of device {}: {}", index, e);
            Default::default()
        });

        let channel = registry.backend().claim(&device).map_err(|e| {
            warn!("Failed to claim device {}: {}", index, e);
            BulkError::open(index, OpenFailure::ChannelUnavailable(e))
        })?;

        let descriptor = DeviceDescriptor::new(index, &device, strings);
        info!(
            "Opened device {} ({:04x}:{:04x} \"{}\", interface {})",
            index,
            descriptor.vendor_id,
            descriptor.product_id,
            descriptor.product_name,
            descriptor.interface_number
        );

        Ok(Self {
            descriptor,
            endpoints: device.endpoints,
            options,
            open: Some(OpenChannel {
                channel,
                _claim: claim,
            }),
        })
    }

    pub fn state(&self) -> SessionState {
        if self.open.is_some() {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn index(&self) -> DeviceIndex {
        self.descriptor.device_index
    }

    /// Identity snapshot taken at open time
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn vendor_name(&self) -> &str {
        &self.descriptor.vendor_name
    }

    pub fn product_name(&self) -> &str {
        &self.descriptor.product_name
    }

    pub fn serial_number(&self) -> &str {
        &self.descriptor.serial_number
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }

    pub fn interface_number(&self) -> u8 {
        self.descriptor.interface_number
    }

    /// Bulk endpoint pair of the claimed interface
    pub fn endpoints(&self) -> BulkEndpoints {
        self.endpoints
    }

    /// Write `length` bytes of `buffer` with the session's write timeout
    pub fn write(&mut self, buffer: &[u8], length: usize) -> Result<usize> {
        self.write_timed(buffer, length, self.options.write_timeout)
    }

    /// Read up to `max_length` bytes into `buffer` with the session's read timeout
    pub fn read(&mut self, buffer: &mut [u8], max_length: usize) -> Result<usize> {
        self.read_timed(buffer, max_length, self.options.read_timeout)
    }

    /// Write `length` bytes of `buffer` to the bulk OUT endpoint
    ///
    /// Returns the number of bytes the device accepted; a short write is
    /// returned as a count, not an error. The cancellation token is checked
    /// before the transfer is issued.
    pub fn write_timed(&mut self, buffer: &[u8], length: usize, timeout: Duration) -> Result<usize> {
        self.check(Direction::Out, buffer.len(), length)?;

        if is_cancelled(&self.options.cancel) {
            return Err(self.fail(Direction::Out, TransferFailure::Cancelled));
        }

        let Some(open) = self.open.as_mut() else {
            return Err(BulkError::transfer(Direction::Out, TransferFailure::NotOpen));
        };
        match open.channel.write(&buffer[..length], timeout) {
            Ok(written) => {
                if written < length {
                    warn!("Short write: {} of {} bytes accepted", written, length);
                } else {
                    debug!("Wrote {} bytes", written);
                }
                Ok(written)
            }
            Err(ChannelError::Timeout) => Err(self.fail(Direction::Out, TransferFailure::Timeout)),
            Err(e) => Err(self.fail(Direction::Out, TransferFailure::Channel(e))),
        }
    }

    /// Read up to `max_length` bytes from the bulk IN endpoint
    ///
    /// Returns as soon as any data arrives. With a cancellation token the
    /// wait is split into short slices so cancellation is noticed promptly.
    pub fn read_timed(
        &mut self,
        buffer: &mut [u8],
        max_length: usize,
        timeout: Duration,
    ) -> Result<usize> {
        self.check(Direction::In, buffer.len(), max_length)?;

        let deadline = Instant::now() + timeout;
        loop {
            if is_cancelled(&self.options.cancel) {
                return Err(self.fail(Direction::In, TransferFailure::Cancelled));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.fail(Direction::In, TransferFailure::Timeout));
            }
            let wait = if self.options.cancel.is_some() {
                remaining.min(READ_SLICE)
            } else {
                remaining
            };

            let Some(open) = self.open.as_mut() else {
                return Err(BulkError::transfer(Direction::In, TransferFailure::NotOpen));
            };
            match open.channel.read(&mut buffer[..max_length], wait) {
                Ok(received) => {
                    debug!("Read {} bytes", received);
                    return Ok(received);
                }
                Err(ChannelError::Timeout) => continue,
                Err(e) => return Err(self.fail(Direction::In, TransferFailure::Channel(e))),
            }
        }
    }

    /// Release the channel
    ///
    /// Idempotent and infallible; safe after earlier failures.
    pub fn close(&mut self) {
        if let Some(mut open) = self.open.take() {
            open.channel.release();
            info!("Closed device {}", self.descriptor.device_index);
        }
    }

    /// Preconditions whose failure leaves the session state unchanged
    fn check(&self, direction: Direction, capacity: usize, length: usize) -> Result<()> {
        if self.open.is_none() {
            return Err(BulkError::transfer(direction, TransferFailure::NotOpen));
        }
        if length > capacity {
            return Err(BulkError::transfer(
                direction,
                TransferFailure::LengthExceedsBuffer { length, capacity },
            ));
        }
        Ok(())
    }

    /// Close after a channel-level failure and build the error
    fn fail(&mut self, direction: Direction, reason: TransferFailure) -> BulkError {
        warn!(
            "Device {} {} failed: {}; closing session",
            self.descriptor.device_index, direction, reason
        );
        self.close();
        BulkError::transfer(direction, reason)
    }
}

impl<C: BulkChannel> Drop for Session<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: BulkChannel> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state())
            .finish()
    }
}

fn is_cancelled(cancel: &Option<CancelToken>) -> bool {
    cancel.as_ref().is_some_and(CancelToken::is_cancelled)
}
