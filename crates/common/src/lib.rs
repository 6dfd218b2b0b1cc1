//! Common utilities for usb-bulk-echo
//!
//! Shared ambient pieces used by the tester binary: logging setup and the
//! common error type.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
