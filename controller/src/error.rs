//! Errors raised by the communication engine.
//!
//! Every error returned from [`crate::Engine::run`] has already torn down the
//! engine's task set; the owner decides whether to reconnect.

use crate::firmware::FirmwareError;
use std::time::Duration;
use stimlink_shared::protocol::packet::StatusCodes;
use stimlink_shared::protocol::{PacketError, PacketType, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("no instrument found on a serial port or at the virtual address")]
    NoInstrumentDetected,

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("connection to the instrument was lost")]
    ConnectionLost,

    #[error("no magic word received within {0:?}")]
    MagicWordTimeout(Duration),

    #[error("discarded {0} bytes without finding a magic word")]
    MagicWordSearchExhausted(usize),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    #[error("no response to {packet_type} within {timeout:?}")]
    CommandResponseTimeout {
        packet_type: PacketType,
        timeout: Duration,
    },

    #[error("received a {0} response with no command in flight")]
    UntrackedResponse(PacketType),

    #[error("instrument reported failure for {0}")]
    CommandFailed(PacketType),

    #[error("instrument firmware is going dormant (reason {0})")]
    FirmwareGoingDormant(u8),

    #[error("instrument reported an error status: {0}")]
    InstrumentFirmwareError(StatusCodes),

    #[error("no status beacon within {0:?}")]
    StatusBeaconTimeout(Duration),

    #[error("instrument rejected a packet checksum")]
    ChecksumRejectedByInstrument,

    #[error("invalid sampling period {0}us: must be a non-zero multiple of 1000 no larger than 65535")]
    InvalidSamplingPeriod(u32),

    #[error("well {well} reported subprotocol {subprotocol_idx}, which protocol {protocol_id} cannot reach from its current position")]
    StimStatusOutOfSequence {
        well: usize,
        protocol_id: String,
        subprotocol_idx: u8,
    },

    #[error("event receiver was dropped")]
    EventChannelClosed,

    #[error("failed handling {packet_type} packet (timestamp {timestamp}, payload {payload}): {source}")]
    PacketDispatch {
        timestamp: u64,
        packet_type: u8,
        /// Hex encoded payload.
        payload: String,
        #[source]
        source: Box<InstrumentError>,
    },
}

impl InstrumentError {
    /// The underlying error with any packet dispatch context removed.
    pub fn root_cause(&self) -> &InstrumentError {
        match self {
            Self::PacketDispatch { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T, E = InstrumentError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_dispatch_context() {
        let err = InstrumentError::PacketDispatch {
            timestamp: 7,
            packet_type: 10,
            payload: "03".to_string(),
            source: Box::new(InstrumentError::FirmwareGoingDormant(3)),
        };
        assert!(matches!(
            err.root_cause(),
            InstrumentError::FirmwareGoingDormant(3)
        ));
        assert!(err.to_string().contains("payload 03"));
    }
}
