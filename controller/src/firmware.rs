//! Firmware update session.
//!
//! A session walks a firmware image through the device's update handshake:
//!
//! ```text
//! Begin ──ack──► Data ──ack──► Data ... ──ack──► End ──ack──►
//!     update complete packet ──► reboot beacon ──► Done
//! ```
//!
//! Each step is only emitted after the previous one was acknowledged
//! without the failure flag.

use stimlink_shared::protocol::{PacketType, MAX_PAYLOAD_LENGTH};
use stimlink_shared::{FirmwareKind, Semver};
use thiserror::Error;
use tracing::{debug, info};

/// Firmware bytes carried by one data packet; the first payload byte is the packet index.
pub const FIRMWARE_CHUNK_LENGTH: usize = MAX_PAYLOAD_LENGTH - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("firmware file is empty")]
    EmptyFile,

    #[error("firmware file of {0} bytes is too large")]
    FileTooLarge(usize),

    #[error("{packet_type} failed{}", .packet_index.map(|i| format!(" at packet {}", i)).unwrap_or_default())]
    FirmwareUpdateCommandFailed {
        packet_type: PacketType,
        packet_index: Option<u8>,
    },

    #[error("unexpected {packet_type} while {step:?}")]
    UnexpectedPacket {
        packet_type: PacketType,
        step: FirmwareStep,
    },

    #[error("no firmware update in progress")]
    NotActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareStep {
    NotStarted,
    Begin,
    SendingData,
    End,
    AwaitingUpdateComplete,
    AwaitingReboot,
    Done,
}

/// Packet the engine should send next.
pub type OutboundPacket = (PacketType, Vec<u8>);

#[derive(Debug)]
pub struct FirmwareSession {
    kind: FirmwareKind,
    version: Semver,
    file: Vec<u8>,
    crc: u32,
    /// Bytes handed out in data packets so far.
    offset: usize,
    /// Bytes the device has acknowledged.
    bytes_acked: usize,
    /// Length of the data packet awaiting acknowledgement.
    in_flight: usize,
    packet_index: u8,
    step: FirmwareStep,
}

impl FirmwareSession {
    pub fn new(kind: FirmwareKind, version: Semver, file: Vec<u8>) -> Result<Self, FirmwareError> {
        if file.is_empty() {
            return Err(FirmwareError::EmptyFile);
        }
        if u32::try_from(file.len()).is_err() {
            return Err(FirmwareError::FileTooLarge(file.len()));
        }
        Ok(Self {
            kind,
            version,
            crc: crc32fast::hash(&file),
            file,
            offset: 0,
            bytes_acked: 0,
            in_flight: 0,
            packet_index: 0,
            step: FirmwareStep::NotStarted,
        })
    }

    pub fn kind(&self) -> FirmwareKind {
        self.kind
    }

    pub fn version(&self) -> Semver {
        self.version
    }

    pub fn step(&self) -> FirmwareStep {
        self.step
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_acked
    }

    pub fn total_bytes(&self) -> usize {
        self.file.len()
    }

    pub fn is_done(&self) -> bool {
        self.step == FirmwareStep::Done
    }

    /// Packet type the device sends once it has applied the image.
    pub fn update_complete_type(&self) -> PacketType {
        match self.kind {
            FirmwareKind::Main => PacketType::MfUpdateComplete,
            FirmwareKind::Channel => PacketType::CfUpdateComplete,
        }
    }

    /// Begin packet: kind flag, target version, image length.
    pub fn begin(&mut self) -> Result<OutboundPacket, FirmwareError> {
        if self.step != FirmwareStep::NotStarted {
            return Err(FirmwareError::UnexpectedPacket {
                packet_type: PacketType::BeginFirmwareUpdate,
                step: self.step,
            });
        }
        let mut payload = Vec::with_capacity(8);
        payload.push(self.kind.flag());
        payload.extend_from_slice(&self.version.to_bytes());
        payload.extend_from_slice(&(self.file.len() as u32).to_le_bytes());
        self.step = FirmwareStep::Begin;
        info!(kind = %self.kind, version = %self.version, bytes = self.file.len(), "beginning firmware update");
        Ok((PacketType::BeginFirmwareUpdate, payload))
    }

    /// Handle the device's response to the last packet sent and produce the next one, if any.
    pub fn handle_response(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<Option<OutboundPacket>, FirmwareError> {
        let expected = match self.step {
            FirmwareStep::Begin => PacketType::BeginFirmwareUpdate,
            FirmwareStep::SendingData => PacketType::FirmwareUpdate,
            FirmwareStep::End => PacketType::EndFirmwareUpdate,
            step => {
                return Err(FirmwareError::UnexpectedPacket { packet_type, step });
            }
        };
        if packet_type != expected {
            return Err(FirmwareError::UnexpectedPacket {
                packet_type,
                step: self.step,
            });
        }
        if payload.first().copied().unwrap_or(1) != 0 {
            let packet_index = (packet_type == PacketType::FirmwareUpdate)
                .then(|| self.packet_index.wrapping_sub(1));
            return Err(FirmwareError::FirmwareUpdateCommandFailed {
                packet_type,
                packet_index,
            });
        }

        match self.step {
            FirmwareStep::Begin => {
                self.step = FirmwareStep::SendingData;
                Ok(Some(self.next_data_packet()))
            }
            FirmwareStep::SendingData => {
                self.bytes_acked += self.in_flight;
                self.in_flight = 0;
                if self.offset < self.file.len() {
                    Ok(Some(self.next_data_packet()))
                } else {
                    self.step = FirmwareStep::End;
                    debug!("all firmware data acknowledged, crc {:#010x}", self.crc);
                    Ok(Some((PacketType::EndFirmwareUpdate, self.crc.to_le_bytes().to_vec())))
                }
            }
            _ => {
                self.step = FirmwareStep::AwaitingUpdateComplete;
                info!(kind = %self.kind, "firmware transfer finished, waiting for the device to apply it");
                Ok(None)
            }
        }
    }

    /// The device reported that it applied the image.
    pub fn handle_update_complete(&mut self, packet_type: PacketType) -> Result<(), FirmwareError> {
        if self.step != FirmwareStep::AwaitingUpdateComplete || packet_type != self.update_complete_type() {
            return Err(FirmwareError::UnexpectedPacket {
                packet_type,
                step: self.step,
            });
        }
        self.step = FirmwareStep::AwaitingReboot;
        Ok(())
    }

    /// A liveness beacon arrived. Returns true when it finishes the session.
    pub fn handle_beacon(&mut self) -> bool {
        if self.step == FirmwareStep::AwaitingReboot {
            self.step = FirmwareStep::Done;
            info!(kind = %self.kind, version = %self.version, "firmware update complete");
            return true;
        }
        false
    }

    fn next_data_packet(&mut self) -> OutboundPacket {
        let end = (self.offset + FIRMWARE_CHUNK_LENGTH).min(self.file.len());
        let mut payload = Vec::with_capacity(1 + end - self.offset);
        payload.push(self.packet_index);
        payload.extend_from_slice(&self.file[self.offset..end]);
        debug!(packet_index = self.packet_index, bytes = end - self.offset, "sending firmware data");

        self.in_flight = end - self.offset;
        self.offset = end;
        self.packet_index = self.packet_index.wrapping_add(1);
        (PacketType::FirmwareUpdate, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK: &[u8] = &[0];

    fn session(len: usize) -> FirmwareSession {
        let file = (0..len).map(|i| (i % 251) as u8).collect();
        FirmwareSession::new(FirmwareKind::Main, Semver::new(1, 2, 3), file).unwrap()
    }

    #[test]
    fn test_full_sequence() {
        let len = FIRMWARE_CHUNK_LENGTH * 2 + 10;
        let mut session = session(len);
        let file_crc = crc32fast::hash(&session.file);

        let (packet_type, payload) = session.begin().unwrap();
        assert_eq!(packet_type, PacketType::BeginFirmwareUpdate);
        assert_eq!(payload[0], 0);
        assert_eq!(&payload[1..4], &[1, 2, 3]);
        assert_eq!(&payload[4..8], &(len as u32).to_le_bytes());

        let mut reassembled = Vec::new();
        let mut response = PacketType::BeginFirmwareUpdate;
        for expected_index in 0..3u8 {
            let (packet_type, payload) = session.handle_response(response, OK).unwrap().unwrap();
            assert_eq!(packet_type, PacketType::FirmwareUpdate);
            assert_eq!(payload[0], expected_index);
            assert!(payload.len() <= MAX_PAYLOAD_LENGTH);
            reassembled.extend_from_slice(&payload[1..]);
            response = PacketType::FirmwareUpdate;
        }
        assert_eq!(reassembled, session.file);
        assert_eq!(session.bytes_sent(), FIRMWARE_CHUNK_LENGTH * 2);

        let (packet_type, payload) = session
            .handle_response(PacketType::FirmwareUpdate, OK)
            .unwrap()
            .unwrap();
        assert_eq!(packet_type, PacketType::EndFirmwareUpdate);
        assert_eq!(payload, file_crc.to_le_bytes().to_vec());
        assert_eq!(session.bytes_sent(), len);

        assert_eq!(session.handle_response(PacketType::EndFirmwareUpdate, OK), Ok(None));
        assert_eq!(session.step(), FirmwareStep::AwaitingUpdateComplete);

        // beacons before the update completes do not finish the session
        assert!(!session.handle_beacon());
        assert!(session.handle_update_complete(PacketType::CfUpdateComplete).is_err());
        session.handle_update_complete(PacketType::MfUpdateComplete).unwrap();
        assert!(session.handle_beacon());
        assert!(session.is_done());
    }

    #[test]
    fn test_data_failure_reports_packet_index() {
        let mut session = session(FIRMWARE_CHUNK_LENGTH * 3);
        session.begin().unwrap();
        session.handle_response(PacketType::BeginFirmwareUpdate, OK).unwrap();
        session.handle_response(PacketType::FirmwareUpdate, OK).unwrap();

        let err = session
            .handle_response(PacketType::FirmwareUpdate, &[1])
            .unwrap_err();
        assert_eq!(
            err,
            FirmwareError::FirmwareUpdateCommandFailed {
                packet_type: PacketType::FirmwareUpdate,
                packet_index: Some(1),
            }
        );
        assert_eq!(err.to_string(), "FirmwareUpdate(71) failed at packet 1");
    }

    #[test]
    fn test_begin_failure() {
        let mut session = session(10);
        session.begin().unwrap();
        assert_eq!(
            session.handle_response(PacketType::BeginFirmwareUpdate, &[1]),
            Err(FirmwareError::FirmwareUpdateCommandFailed {
                packet_type: PacketType::BeginFirmwareUpdate,
                packet_index: None,
            })
        );
    }

    #[test]
    fn test_out_of_order_response() {
        let mut session = session(10);
        session.begin().unwrap();
        assert!(matches!(
            session.handle_response(PacketType::EndFirmwareUpdate, OK),
            Err(FirmwareError::UnexpectedPacket { .. })
        ));
    }

    #[test]
    fn test_packet_index_wraps() {
        let mut session = session(FIRMWARE_CHUNK_LENGTH * 257 + 1);
        session.begin().unwrap();
        let mut response = PacketType::BeginFirmwareUpdate;
        let mut indices = Vec::new();
        while let Some((packet_type, payload)) = session.handle_response(response, OK).unwrap() {
            if packet_type != PacketType::FirmwareUpdate {
                break;
            }
            indices.push(payload[0]);
            response = packet_type;
        }
        assert_eq!(indices.len(), 258);
        assert_eq!(indices[255], 255);
        assert_eq!(indices[256], 0);
        assert_eq!(indices[257], 1);
    }

    #[test]
    fn test_empty_file_rejected() {
        assert_eq!(
            FirmwareSession::new(FirmwareKind::Channel, Semver::default(), Vec::new()).unwrap_err(),
            FirmwareError::EmptyFile
        );
    }
}
