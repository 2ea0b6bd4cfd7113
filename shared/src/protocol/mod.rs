//! Serial wire protocol spoken with the instrument.
//!
//! ## Packet Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ Magic Word (8) │ Remainder Length (2) │ Timestamp (8) │ Type (1) │ ... │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                  Payload (0..=19996)  │  CRC32 (4)                   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All multi-byte integers are little-endian. The remainder length counts
//! every byte from the timestamp through the checksum. The checksum covers
//! every preceding byte, magic word included.

pub mod packet;
pub mod stim;
pub mod walker;

pub use packet::{
    checksum, encode_packet, parse_status_codes, sort_packets, validate_checksum, DataPacket,
    SortedPackets, StimStreamInfo,
};
pub use stim::{
    chunk_protocol, chunk_subprotocol, decode_protocols, decode_pulse, decode_subprotocol,
    encode_protocols, encode_pulse, encode_subprotocol, ChunkedProtocol, ChunkedSubprotocol,
};
pub use walker::{Advance, ProtocolWalker};

use thiserror::Error;

/// Fixed marker prefixing every packet.
pub const MAGIC_WORD: &[u8; 8] = b"CURI BIO";

pub const MAGIC_WORD_LENGTH: usize = MAGIC_WORD.len();
pub const REMAINDER_LENGTH_BYTES: usize = 2;
pub const TIMESTAMP_LENGTH: usize = 8;
pub const PACKET_TYPE_LENGTH: usize = 1;
pub const CHECKSUM_LENGTH: usize = 4;

/// Magic word plus remainder length.
pub const PACKET_HEADER_LENGTH: usize = MAGIC_WORD_LENGTH + REMAINDER_LENGTH_BYTES;

/// Timestamp plus packet type.
pub const PACKET_BASE_LENGTH: usize = TIMESTAMP_LENGTH + PACKET_TYPE_LENGTH;

/// Smallest possible packet: header, base and checksum with an empty payload.
pub const MIN_PACKET_LENGTH: usize = PACKET_HEADER_LENGTH + PACKET_BASE_LENGTH + CHECKSUM_LENGTH;

/// Smallest legal remainder length value.
pub const MIN_REMAINDER_LENGTH: usize = PACKET_BASE_LENGTH + CHECKSUM_LENGTH;

pub const MAX_PAYLOAD_LENGTH: usize = 20_000 - CHECKSUM_LENGTH;

pub const MAX_FULL_PACKET_LENGTH: usize =
    PACKET_HEADER_LENGTH + PACKET_BASE_LENGTH + MAX_PAYLOAD_LENGTH + CHECKSUM_LENGTH;

/// Number of bytes in a beacon / handshake response status payload.
pub const STATUS_CODES_LENGTH: usize = 2 + crate::types::wells::NUM_WELLS;

/// Subprotocol index the device reports once a well's protocol has finished.
pub const STIM_COMPLETE_SUBPROTOCOL_IDX: u8 = 255;

/// Packet type identifiers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketType {
    StatusBeacon = 0,
    MagnetometerData = 1,
    Reboot = 2,
    Handshake = 4,
    GoingDormant = 10,
    SetStimProtocol = 20,
    StartStim = 21,
    StopStim = 22,
    StimStatus = 23,
    StimImpedanceCheck = 27,
    SetSamplingPeriod = 50,
    StartDataStreaming = 52,
    StopDataStreaming = 53,
    GetMetadata = 60,
    SetNickname = 62,
    BeginFirmwareUpdate = 70,
    FirmwareUpdate = 71,
    EndFirmwareUpdate = 72,
    CfUpdateComplete = 73,
    MfUpdateComplete = 74,
    BarcodeFound = 90,
    ErrorAck = 254,
    ChecksumFailure = 255,
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the device answers this packet type with a response of the same type.
    pub fn expects_response(self) -> bool {
        matches!(
            self,
            Self::Reboot
                | Self::Handshake
                | Self::SetStimProtocol
                | Self::StartStim
                | Self::StopStim
                | Self::StimImpedanceCheck
                | Self::SetSamplingPeriod
                | Self::StartDataStreaming
                | Self::StopDataStreaming
                | Self::GetMetadata
                | Self::SetNickname
                | Self::BeginFirmwareUpdate
                | Self::FirmwareUpdate
                | Self::EndFirmwareUpdate
        )
    }

    /// Whether the first response payload byte is the device's failure flag.
    pub fn response_has_failure_flag(self) -> bool {
        matches!(
            self,
            Self::SetStimProtocol
                | Self::StartStim
                | Self::StopStim
                | Self::SetSamplingPeriod
                | Self::StartDataStreaming
                | Self::StopDataStreaming
                | Self::BeginFirmwareUpdate
                | Self::FirmwareUpdate
                | Self::EndFirmwareUpdate
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::StatusBeacon,
            1 => Self::MagnetometerData,
            2 => Self::Reboot,
            4 => Self::Handshake,
            10 => Self::GoingDormant,
            20 => Self::SetStimProtocol,
            21 => Self::StartStim,
            22 => Self::StopStim,
            23 => Self::StimStatus,
            27 => Self::StimImpedanceCheck,
            50 => Self::SetSamplingPeriod,
            52 => Self::StartDataStreaming,
            53 => Self::StopDataStreaming,
            60 => Self::GetMetadata,
            62 => Self::SetNickname,
            70 => Self::BeginFirmwareUpdate,
            71 => Self::FirmwareUpdate,
            72 => Self::EndFirmwareUpdate,
            73 => Self::CfUpdateComplete,
            74 => Self::MfUpdateComplete,
            90 => Self::BarcodeFound,
            254 => Self::ErrorAck,
            255 => Self::ChecksumFailure,
            other => return Err(PacketError::UnrecognizedPacketType(other)),
        })
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.as_u8())
    }
}

/// Framing-level failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("incorrect magic word: {0:02x?}")]
    IncorrectMagicWord(Vec<u8>),

    #[error("invalid remainder length {0}")]
    InvalidPacketLength(usize),

    #[error("payload of {0} bytes exceeds the maximum of {}", MAX_PAYLOAD_LENGTH)]
    PayloadTooLarge(usize),

    #[error("packet truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unrecognized packet type {0}")]
    UnrecognizedPacketType(u8),

    #[error("unknown module id {0}")]
    UnknownModuleId(u8),

    #[error("unknown stimulation status {0}")]
    UnknownStimStatus(u8),
}

/// Stimulation protocol codec and validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("protocol bytes ended early at offset {0}")]
    UnexpectedEnd(usize),

    #[error("protocol top level must be a loop")]
    RootNotLoop,

    #[error("expected a pulse or delay, found a loop")]
    LoopNotPulse,

    #[error("loop has no subprotocols")]
    EmptyLoop,

    #[error("loop has {0} children, more than fit in one byte")]
    TooManyChildren(usize),

    #[error("loop iteration count must be at least 1")]
    ZeroIterations,

    #[error("protocol has {0} subprotocols (max {})", crate::types::stimulation::MAX_SUBPROTOCOLS_PER_PROTOCOL)]
    TooManySubprotocols(usize),

    #[error("protocol has {0} leaves, more than fit in a subprotocol index")]
    TooManyLeaves(usize),

    #[error("subprotocol duration {0}us is below the minimum")]
    SubprotocolTooShort(u64),

    #[error("subprotocol duration {0}us exceeds the maximum")]
    SubprotocolTooLong(u64),

    #[error("delay of {0}us is not a whole number of milliseconds")]
    DelayNotWholeMillis(u64),

    #[error("pulse active time {active_us}us violates the duty cycle limit for a {cycle_us}us cycle")]
    DutyCycleExceeded { active_us: u64, cycle_us: u64 },

    #[error("charge {0} cannot be represented on the wire")]
    ChargeOutOfRange(i32),

    #[error("invalid well index {0}")]
    InvalidWell(usize),

    #[error("unknown protocol id {0:?}")]
    UnknownProtocolId(String),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_constants() {
        assert_eq!(MIN_PACKET_LENGTH, 23);
        assert_eq!(MAX_FULL_PACKET_LENGTH, 20_019);
        assert_eq!(STATUS_CODES_LENGTH, 26);
    }

    #[test]
    fn test_packet_type_round_trip_through_u8() {
        for raw in 0..=u8::MAX {
            if let Ok(packet_type) = PacketType::try_from(raw) {
                assert_eq!(packet_type.as_u8(), raw);
            }
        }
        assert_eq!(
            PacketType::try_from(3),
            Err(PacketError::UnrecognizedPacketType(3))
        );
    }

    #[test]
    fn test_update_complete_types_are_not_responses() {
        assert!(!PacketType::CfUpdateComplete.expects_response());
        assert!(!PacketType::StatusBeacon.expects_response());
        assert!(PacketType::Handshake.expects_response());
        assert!(!PacketType::Handshake.response_has_failure_flag());
    }
}
