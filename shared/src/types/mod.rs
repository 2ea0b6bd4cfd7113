//! Domain types shared by the codecs and the controller.

pub mod messages;
pub mod metadata;
pub mod stimulation;
pub mod wells;
