//! USB bulk echo core
//!
//! Device discovery filtered by a (vendor ID, product ID) allow-list, device
//! sessions with blocking bulk transfers, and the loop-back echo test built on
//! top of them.
//!
//! The host USB stack is reached only through [`UsbBackend`] and
//! [`BulkChannel`]; the `tester` crate implements them on rusb and
//! [`test_utils`] implements them in memory.

pub mod backend;
pub mod cancel;
pub mod echo;
pub mod error;
pub mod poll;
pub mod registry;
pub mod session;
pub mod test_utils;
pub mod types;

pub use backend::{BulkChannel, UsbBackend};
pub use cancel::CancelToken;
pub use echo::{EchoFailure, EchoMode, EchoOutcome, EchoReport, EchoTest};
pub use error::{
    BulkError, ChannelError, Direction, ErrorKind, OpenFailure, Result, TransferFailure,
};
pub use poll::{PollOptions, PollOutcome, wait_for_devices};
pub use registry::{DEFAULT_MAX_DEVICES, Enumeration, Registry};
pub use session::{Session, SessionOptions, SessionState};
pub use types::{
    AllowedDeviceId, AttachedDevice, BulkEndpoints, DeviceDescriptor, DeviceIndex, DeviceKey,
    DeviceStrings, MAX_PACKET_SIZE, Packet, ParseDeviceIdError,
};
