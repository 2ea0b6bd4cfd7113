//! Packet framing: encode, checksum, and split a byte stream into packets.

use super::{
    PacketError, PacketType, CHECKSUM_LENGTH, MAGIC_WORD, MAGIC_WORD_LENGTH, MAX_PAYLOAD_LENGTH,
    MIN_PACKET_LENGTH, MIN_REMAINDER_LENGTH, PACKET_BASE_LENGTH, PACKET_HEADER_LENGTH,
    STATUS_CODES_LENGTH,
};
use crate::types::wells::{status_module_id_to_well_idx, NUM_WELLS};
use std::collections::BTreeMap;

/// A single decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Microseconds since the protocol epoch.
    pub timestamp: u64,
    pub packet_type: u8,
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn new(timestamp: u64, packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            timestamp,
            packet_type: packet_type.as_u8(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        encode_packet(self.timestamp, self.packet_type, &self.payload)
    }

    /// Decode exactly one complete packet.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < MIN_PACKET_LENGTH {
            return Err(PacketError::Truncated {
                needed: MIN_PACKET_LENGTH,
                available: bytes.len(),
            });
        }
        if &bytes[..MAGIC_WORD_LENGTH] != MAGIC_WORD {
            return Err(PacketError::IncorrectMagicWord(
                bytes[..MAGIC_WORD_LENGTH].to_vec(),
            ));
        }
        let remainder = remainder_length(bytes)?;
        let total = PACKET_HEADER_LENGTH + remainder;
        if bytes.len() != total {
            return Err(PacketError::Truncated {
                needed: total,
                available: bytes.len(),
            });
        }
        verify_checksum(bytes)?;

        let base = &bytes[PACKET_HEADER_LENGTH..];
        let timestamp = u64::from_le_bytes(read_array(base, 0));
        Ok(Self {
            timestamp,
            packet_type: base[8],
            payload: bytes[PACKET_HEADER_LENGTH + PACKET_BASE_LENGTH..total - CHECKSUM_LENGTH]
                .to_vec(),
        })
    }
}

/// CRC32 (IEEE) of `data`.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Serialize one packet.
pub fn encode_packet(timestamp: u64, packet_type: u8, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    if payload.len() > MAX_PAYLOAD_LENGTH {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }
    let remainder = PACKET_BASE_LENGTH + payload.len() + CHECKSUM_LENGTH;
    let mut packet = Vec::with_capacity(PACKET_HEADER_LENGTH + remainder);
    packet.extend_from_slice(MAGIC_WORD);
    packet.extend_from_slice(&(remainder as u16).to_le_bytes());
    packet.extend_from_slice(&timestamp.to_le_bytes());
    packet.push(packet_type);
    packet.extend_from_slice(payload);
    let crc = checksum(&packet);
    packet.extend_from_slice(&crc.to_le_bytes());
    Ok(packet)
}

/// Whether the trailing CRC32 matches the bytes before it.
pub fn validate_checksum(bytes: &[u8]) -> bool {
    verify_checksum(bytes).is_ok()
}

fn verify_checksum(bytes: &[u8]) -> Result<(), PacketError> {
    if bytes.len() < CHECKSUM_LENGTH {
        return Err(PacketError::Truncated {
            needed: CHECKSUM_LENGTH,
            available: bytes.len(),
        });
    }
    let split = bytes.len() - CHECKSUM_LENGTH;
    let expected = u32::from_le_bytes(read_array(bytes, split));
    let computed = checksum(&bytes[..split]);
    if expected != computed {
        return Err(PacketError::ChecksumMismatch { expected, computed });
    }
    Ok(())
}

fn remainder_length(bytes: &[u8]) -> Result<usize, PacketError> {
    let remainder = u16::from_le_bytes(read_array(bytes, MAGIC_WORD_LENGTH)) as usize;
    let max_remainder = PACKET_BASE_LENGTH + MAX_PAYLOAD_LENGTH + CHECKSUM_LENGTH;
    if !(MIN_REMAINDER_LENGTH..=max_remainder).contains(&remainder) {
        return Err(PacketError::InvalidPacketLength(remainder));
    }
    Ok(remainder)
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

/// Concatenated stimulation status payloads from one read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StimStreamInfo {
    pub raw_bytes: Vec<u8>,
    pub num_packets: usize,
}

/// Result of splitting a read buffer into packets.
#[derive(Debug, Default)]
pub struct SortedPackets {
    /// Packets that are neither magnetometer data nor stim status, in receive order.
    pub other: Vec<DataPacket>,
    pub stim_stream_info: StimStreamInfo,
    /// Magnetometer packets seen (their contents are discarded).
    pub magnetometer_packets: usize,
    /// Packets dropped because their checksum did not match.
    pub checksum_failures: Vec<PacketError>,
    /// Trailing bytes that do not yet form a complete packet.
    pub unread_bytes: Vec<u8>,
}

/// Split `buffer` into complete packets.
///
/// The buffer must start on a magic word. Packets with a bad checksum are
/// reported in `checksum_failures` and skipped; a missing magic word or an
/// impossible length means the stream has lost alignment and is an error.
pub fn sort_packets(buffer: &[u8]) -> Result<SortedPackets, PacketError> {
    let mut sorted = SortedPackets::default();
    let mut offset = 0;

    while buffer.len() - offset >= MIN_PACKET_LENGTH {
        let rest = &buffer[offset..];
        if &rest[..MAGIC_WORD_LENGTH] != MAGIC_WORD {
            return Err(PacketError::IncorrectMagicWord(
                rest[..MAGIC_WORD_LENGTH].to_vec(),
            ));
        }
        let total = PACKET_HEADER_LENGTH + remainder_length(rest)?;
        if rest.len() < total {
            break;
        }
        let packet_bytes = &rest[..total];
        offset += total;

        if let Err(e) = verify_checksum(packet_bytes) {
            sorted.checksum_failures.push(e);
            continue;
        }

        let packet_type = packet_bytes[PACKET_HEADER_LENGTH + 8];
        let payload = &packet_bytes[PACKET_HEADER_LENGTH + PACKET_BASE_LENGTH..total - CHECKSUM_LENGTH];
        if packet_type == PacketType::MagnetometerData.as_u8() {
            sorted.magnetometer_packets += 1;
        } else if packet_type == PacketType::StimStatus.as_u8() {
            sorted.stim_stream_info.raw_bytes.extend_from_slice(payload);
            sorted.stim_stream_info.num_packets += 1;
        } else {
            sorted.other.push(DataPacket {
                timestamp: u64::from_le_bytes(read_array(packet_bytes, PACKET_HEADER_LENGTH)),
                packet_type,
                payload: payload.to_vec(),
            });
        }
    }

    sorted.unread_bytes = buffer[offset..].to_vec();
    Ok(sorted)
}

/// Status codes carried by beacons and handshake responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCodes {
    pub main_status: u8,
    pub thread_index: u8,
    /// Indexed by 0-based status module id.
    pub module_statuses: [u8; NUM_WELLS],
}

impl StatusCodes {
    pub fn has_error(&self) -> bool {
        self.main_status != 0 || self.module_statuses.iter().any(|&code| code != 0)
    }

    /// Non-zero module codes keyed by well index.
    pub fn well_errors(&self) -> BTreeMap<usize, u8> {
        self.module_statuses
            .iter()
            .enumerate()
            .filter(|(_, code)| **code != 0)
            .filter_map(|(module_id, &code)| {
                status_module_id_to_well_idx(module_id as u8)
                    .ok()
                    .map(|well| (well, code))
            })
            .collect()
    }
}

impl std::fmt::Display for StatusCodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "main={} thread={} wells={:?}",
            self.main_status,
            self.thread_index,
            self.well_errors()
        )
    }
}

pub fn parse_status_codes(payload: &[u8]) -> Result<StatusCodes, PacketError> {
    if payload.len() < STATUS_CODES_LENGTH {
        return Err(PacketError::Truncated {
            needed: STATUS_CODES_LENGTH,
            available: payload.len(),
        });
    }
    Ok(StatusCodes {
        main_status: payload[0],
        thread_index: payload[1],
        module_statuses: read_array(payload, 2),
    })
}
