//! Shared types and codecs for stimlink
//!
//! This crate holds everything that does not touch I/O: the packet framing,
//! the stimulation protocol codec, the execution walker, well numbering and
//! the typed messages exchanged with the controller.

pub mod protocol;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use protocol::{PacketError, PacketType, ProtocolError};
pub use types::{messages::*, metadata::InstrumentMetadata, stimulation::*};
