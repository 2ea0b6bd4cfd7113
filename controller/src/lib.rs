//! stimlink controller: talks to the stimulation instrument over serial or TCP.
//!
//! [`connect`] opens a transport, [`Engine`] drives it. The engine reports
//! through an [`Event`](stimlink_shared::Event) channel and takes
//! [`Command`](stimlink_shared::Command)s through a mailbox.

pub mod config;
pub mod engine;
pub mod error;
pub mod firmware;
pub mod impedance;
pub mod link;
pub mod retry;
pub mod tracker;

pub use config::ControllerConfig;
pub use engine::{Engine, EngineState};
pub use error::InstrumentError;
pub use link::{connect, Connection, InstrumentLink};
pub use retry::ReconnectPolicy;
