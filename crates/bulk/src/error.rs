//! Error types for discovery, session and transfer failures
//!
//! Every failure surfaces as one of four kinds (see [`ErrorKind`]) because the
//! operator's next step differs for each: re-enumerate, reselect, rerun, or
//! give up.

use crate::types::{AllowedDeviceId, DeviceIndex};
use thiserror::Error;

/// Channel-level USB error
///
/// Maps to libusb error codes. See rusb::Error for details.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("device disconnected")]
    NoDevice,
    /// Device or endpoint not found
    #[error("device or endpoint not found")]
    NotFound,
    /// Device or interface is busy
    #[error("device busy")]
    Busy,
    /// Device sent more data than requested
    #[error("buffer overflow")]
    Overflow,
    /// I/O error
    #[error("I/O error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied")]
    Access,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

/// Why a session could not be opened
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OpenFailure {
    /// No allow-listed device is attached at this index
    #[error("no device attached at this index")]
    NotAttached,
    /// The device identity is not in the allow-list
    #[error("device {0} is not in the allow-list")]
    NotAllowed(AllowedDeviceId),
    /// Another session of this process already holds the device
    #[error("device is already open in another session")]
    AlreadyOpen,
    /// The backend could not claim the transfer channel
    #[error("cannot claim transfer channel: {0}")]
    ChannelUnavailable(ChannelError),
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device (bulk OUT)
    Out,
    /// Device to host (bulk IN)
    In,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Out => f.write_str("write"),
            Direction::In => f.write_str("read"),
        }
    }
}

/// Why a transfer failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferFailure {
    /// Session is not open
    #[error("session is not open")]
    NotOpen,
    /// Requested length exceeds the buffer
    #[error("length {length} exceeds buffer of {capacity} bytes")]
    LengthExceedsBuffer { length: usize, capacity: usize },
    /// No data within the transfer timeout
    #[error("timed out")]
    Timeout,
    /// Cancelled by the caller
    #[error("cancelled")]
    Cancelled,
    /// Channel error other than timeout
    #[error("{0}")]
    Channel(ChannelError),
}

/// Errors returned by the registry and sessions
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BulkError {
    /// The host USB stack cannot be enumerated
    #[error("USB enumeration unavailable: {reason}")]
    EnumerationUnavailable { reason: String },

    /// Stale or invalid device index
    #[error("device {index} not found")]
    DeviceNotFound { index: DeviceIndex },

    /// Session could not be opened
    #[error("cannot open device {index}: {reason}")]
    OpenFailed {
        index: DeviceIndex,
        reason: OpenFailure,
    },

    /// Bulk transfer failed
    #[error("{direction} failed: {reason}")]
    TransferFailed {
        direction: Direction,
        reason: TransferFailure,
    },
}

/// The four error kinds an operator has to tell apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    EnumerationUnavailable,
    DeviceNotFound,
    OpenFailed,
    TransferFailed,
}

impl BulkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BulkError::EnumerationUnavailable { .. } => ErrorKind::EnumerationUnavailable,
            BulkError::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            BulkError::OpenFailed { .. } => ErrorKind::OpenFailed,
            BulkError::TransferFailed { .. } => ErrorKind::TransferFailed,
        }
    }

    /// True for transfer failures caused by a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BulkError::TransferFailed {
                reason: TransferFailure::Timeout,
                ..
            }
        )
    }

    pub(crate) fn transfer(direction: Direction, reason: TransferFailure) -> Self {
        BulkError::TransferFailed { direction, reason }
    }

    pub(crate) fn open(index: DeviceIndex, reason: OpenFailure) -> Self {
        BulkError::OpenFailed { index, reason }
    }
}

/// Type alias for registry and session results
pub type Result<T> = std::result::Result<T, BulkError>;
