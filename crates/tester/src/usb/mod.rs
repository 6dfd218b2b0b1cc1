//! USB subsystem
//!
//! rusb implementation of the bulk backend:
//! - Enumeration of vendor-specific interfaces with a bulk IN/OUT pair
//! - String descriptor reads
//! - Interface claiming and blocking bulk transfers

pub mod backend;
pub mod channel;
pub mod transfers;

pub use backend::RusbBackend;
pub use channel::RusbChannel;
pub use transfers::map_rusb_error;
