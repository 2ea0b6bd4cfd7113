//! Instrument metadata returned by a get-metadata request.

use crate::protocol::PacketError;
use crate::types::messages::Semver;
use serde::{Deserialize, Serialize};

pub const NICKNAME_LENGTH: usize = 13;
pub const SERIAL_NUMBER_LENGTH: usize = 12;
pub const METADATA_LENGTH: usize = 1 + NICKNAME_LENGTH + SERIAL_NUMBER_LENGTH + 3 + 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentMetadata {
    pub boot_flags: u8,
    pub nickname: String,
    pub serial_number: String,
    pub main_firmware_version: Semver,
    pub channel_firmware_version: Semver,
}

impl InstrumentMetadata {
    pub fn parse(payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() < METADATA_LENGTH {
            return Err(PacketError::Truncated {
                needed: METADATA_LENGTH,
                available: payload.len(),
            });
        }
        let nickname_end = 1 + NICKNAME_LENGTH;
        let serial_end = nickname_end + SERIAL_NUMBER_LENGTH;
        Ok(Self {
            boot_flags: payload[0],
            nickname: padded_string(&payload[1..nickname_end]),
            serial_number: padded_string(&payload[nickname_end..serial_end]),
            main_firmware_version: Semver::from_bytes([
                payload[serial_end],
                payload[serial_end + 1],
                payload[serial_end + 2],
            ]),
            channel_firmware_version: Semver::from_bytes([
                payload[serial_end + 3],
                payload[serial_end + 4],
                payload[serial_end + 5],
            ]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_LENGTH);
        out.push(self.boot_flags);
        out.extend_from_slice(&pad_string(&self.nickname, NICKNAME_LENGTH));
        out.extend_from_slice(&pad_string(&self.serial_number, SERIAL_NUMBER_LENGTH));
        out.extend_from_slice(&self.main_firmware_version.to_bytes());
        out.extend_from_slice(&self.channel_firmware_version.to_bytes());
        out
    }
}

/// NUL-padded field contents, truncated at the first NUL.
fn padded_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// `s` truncated to `len` bytes (on a char boundary) and NUL padded.
pub fn pad_string(s: &str, len: usize) -> Vec<u8> {
    let mut end = s.len().min(len);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s.as_bytes()[..end].to_vec();
    out.resize(len, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata() {
        let metadata = InstrumentMetadata {
            boot_flags: 0b101,
            nickname: "Bench 3".to_string(),
            serial_number: "M02001900".to_string(),
            main_firmware_version: Semver::new(1, 4, 2),
            channel_firmware_version: Semver::new(0, 9, 0),
        };
        let bytes = metadata.to_bytes();
        assert_eq!(bytes.len(), METADATA_LENGTH);
        assert_eq!(&bytes[1..8], b"Bench 3");
        assert_eq!(bytes[8], 0);
        assert_eq!(InstrumentMetadata::parse(&bytes).unwrap(), metadata);
    }

    #[test]
    fn test_truncated_metadata() {
        assert_eq!(
            InstrumentMetadata::parse(&[0; 10]),
            Err(PacketError::Truncated {
                needed: METADATA_LENGTH,
                available: 10
            })
        );
    }

    #[test]
    fn test_pad_string_truncates_on_char_boundary() {
        assert_eq!(pad_string("abc", 5), b"abc\0\0".to_vec());
        // 'é' is two bytes and would straddle the limit
        assert_eq!(pad_string("abcé", 4), b"abc\0".to_vec());
    }
}
