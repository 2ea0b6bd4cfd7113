//! Messages exchanged between the controller and whoever owns it.
//!
//! Commands flow into the engine's mailbox, events flow out. Both are
//! internally tagged so they serialize as `{"command": "start_stimulation"}`
//! style records.

use crate::protocol::PacketError;
use crate::types::metadata::InstrumentMetadata;
use crate::types::stimulation::StimInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Firmware image target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareKind {
    Main,
    Channel,
}

impl FirmwareKind {
    /// Value of the kind flag in a begin-firmware-update payload.
    pub fn flag(self) -> u8 {
        match self {
            Self::Main => 0,
            Self::Channel => 1,
        }
    }
}

impl fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Channel => write!(f, "channel"),
        }
    }
}

impl FromStr for FirmwareKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" => Ok(Self::Main),
            "channel" => Ok(Self::Channel),
            other => Err(format!("unknown firmware kind '{}'", other)),
        }
    }
}

/// Three-part firmware version, one byte per part on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Semver {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Semver {
    pub fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.major, self.minor, self.patch]
    }

    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2])
    }
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Semver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("version '{}' is not of the form x.y.z", s));
        }
        let mut out = [0u8; 3];
        for (slot, part) in out.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| format!("version part '{}' is not a number from 0 to 255", part))?;
        }
        Ok(Self::from_bytes(out))
    }
}

/// Status byte of a stimulation status entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StimStatus {
    Active,
    Null,
    Restarting,
    Finished,
    Error,
}

impl TryFrom<u8> for StimStatus {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, PacketError> {
        Ok(match value {
            0 => Self::Active,
            1 => Self::Null,
            2 => Self::Restarting,
            3 => Self::Finished,
            4 => Self::Error,
            other => return Err(PacketError::UnknownStimStatus(other)),
        })
    }
}

/// One well's entry in a stimulation status packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimStatusEntry {
    pub status: StimStatus,
    /// Device timestamp, microseconds since the protocol epoch.
    pub timestamp: u64,
    /// Leaf index in the device's (chunked) numbering, or 255 once finished.
    pub subprotocol_idx: u8,
}

/// Classification of a well's stimulator circuit from an impedance reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StimulatorCircuitStatus {
    Media,
    Open,
    Short,
    Error,
    Calculating,
}

impl fmt::Display for StimulatorCircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Media => "media",
            Self::Open => "open",
            Self::Short => "short",
            Self::Error => "error",
            Self::Calculating => "calculating",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarcodeKind {
    Plate,
    Stim,
    Unknown,
}

impl BarcodeKind {
    pub fn from_barcode(barcode: &str) -> Self {
        if barcode.starts_with("ML") {
            Self::Plate
        } else if barcode.starts_with("MS") {
            Self::Stim
        } else {
            Self::Unknown
        }
    }
}

/// Requests accepted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    SetStimProtocols {
        stim_info: StimInfo,
    },
    StartStimulation,
    StopStimulation,
    StartStimChecks {
        well_indices: Vec<usize>,
    },
    StartFirmwareUpdate {
        kind: FirmwareKind,
        version: Semver,
        #[serde(with = "hex_bytes")]
        file_contents: Vec<u8>,
    },
    GetMetadata,
    SetSamplingPeriod {
        period_us: u32,
    },
    StartDataStreaming,
    StopDataStreaming,
    SetNickname {
        nickname: String,
    },
    Reboot,
}

impl Command {
    /// Tag used on the wire to the coordinator.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetStimProtocols { .. } => "set_stim_protocols",
            Self::StartStimulation => "start_stimulation",
            Self::StopStimulation => "stop_stimulation",
            Self::StartStimChecks { .. } => "start_stim_checks",
            Self::StartFirmwareUpdate { .. } => "start_firmware_update",
            Self::GetMetadata => "get_metadata",
            Self::SetSamplingPeriod { .. } => "set_sampling_period",
            Self::StartDataStreaming => "start_data_streaming",
            Self::StopDataStreaming => "stop_data_streaming",
            Self::SetNickname { .. } => "set_nickname",
            Self::Reboot => "reboot",
        }
    }
}

/// Everything the engine reports upward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    GetBoardConnectionStatus {
        connected: bool,
        is_virtual: bool,
        port: String,
    },
    GetMetadata {
        metadata: InstrumentMetadata,
    },
    SetStimProtocols,
    StartStimulation {
        wells: Vec<usize>,
    },
    StopStimulation,
    StartStimChecks {
        results: BTreeMap<usize, StimulatorCircuitStatus>,
    },
    StimStatusUpdate {
        /// Entries per well, with subprotocol indices in the protocol's own numbering.
        well_statuses: BTreeMap<usize, Vec<StimStatusEntry>>,
    },
    StimProtocolComplete {
        well: usize,
        protocol_id: String,
    },
    /// Every stimulating well has finished.
    StimulationComplete,
    SetSamplingPeriod {
        period_us: u32,
    },
    StartDataStreaming,
    StopDataStreaming,
    SetNickname {
        nickname: String,
    },
    Reboot,
    RebootComplete,
    GetBarcode {
        barcode: String,
        kind: BarcodeKind,
    },
    FirmwareUpdateProgress {
        kind: FirmwareKind,
        bytes_sent: usize,
        total_bytes: usize,
    },
    FirmwareUpdateComplete {
        kind: FirmwareKind,
        version: Semver,
    },
    CommandRejected {
        command: String,
        reason: String,
    },
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::utils::bytes_to_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        crate::utils::hex_to_bytes(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tags() {
        let json = serde_json::to_value(&Command::StartStimulation).unwrap();
        assert_eq!(json, serde_json::json!({"command": "start_stimulation"}));

        let cmd: Command =
            serde_json::from_str(r#"{"command":"start_stim_checks","well_indices":[0,5]}"#).unwrap();
        assert_eq!(
            cmd,
            Command::StartStimChecks {
                well_indices: vec![0, 5]
            }
        );
        assert_eq!(cmd.name(), "start_stim_checks");
    }

    #[test]
    fn test_firmware_command_carries_hex_file() {
        let cmd = Command::StartFirmwareUpdate {
            kind: FirmwareKind::Channel,
            version: Semver::new(1, 2, 3),
            file_contents: vec![0xde, 0xad],
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""file_contents":"dead""#));
        assert!(json.contains(r#""kind":"channel""#));
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_event_tags() {
        let event = Event::GetBarcode {
            barcode: "ML2022001000".to_string(),
            kind: BarcodeKind::Plate,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "get_barcode");
        assert_eq!(json["kind"], "plate");
    }

    #[test]
    fn test_semver_parse() {
        assert_eq!("1.10.255".parse::<Semver>().unwrap(), Semver::new(1, 10, 255));
        assert!("1.2".parse::<Semver>().is_err());
        assert!("1.2.256".parse::<Semver>().is_err());
        assert_eq!(Semver::new(0, 4, 1).to_string(), "0.4.1");
    }

    #[test]
    fn test_barcode_kind() {
        assert_eq!(BarcodeKind::from_barcode("MS2022001000"), BarcodeKind::Stim);
        assert_eq!(BarcodeKind::from_barcode("XX"), BarcodeKind::Unknown);
    }

    #[test]
    fn test_stim_status_values() {
        assert_eq!(StimStatus::try_from(3).unwrap(), StimStatus::Finished);
        assert_eq!(StimStatus::try_from(9), Err(PacketError::UnknownStimStatus(9)));
    }
}
