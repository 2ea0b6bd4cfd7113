//! Commands from the owning coordinator.

use super::{EngineState, PendingCommand, RebootPhase, Session};
use crate::error::{InstrumentError, Result};
use crate::firmware::FirmwareSession;
use std::collections::BTreeMap;
use stimlink_shared::protocol::{chunk_protocol, encode_protocols, PacketType, MAX_PAYLOAD_LENGTH};
use stimlink_shared::types::metadata::{pad_string, NICKNAME_LENGTH};
use stimlink_shared::types::wells::{well_idx_to_stim_module_id, NUM_WELLS};
use stimlink_shared::{Command, Event, FirmwareKind, Semver, StimInfo};
use tracing::{debug, info, warn};

/// Sampling period as sent to the device.
///
/// Must be a non-zero whole number of milliseconds that fits in a u16.
pub fn validate_sampling_period(period_us: u32) -> Result<u16> {
    if period_us == 0 || period_us % 1000 != 0 {
        return Err(InstrumentError::InvalidSamplingPeriod(period_us));
    }
    u16::try_from(period_us).map_err(|_| InstrumentError::InvalidSamplingPeriod(period_us))
}

impl Session {
    pub(super) async fn handle_command(&mut self, command: Command) -> Result<()> {
        let name = command.name();
        debug!(command = name, state = ?self.state(), "Received command");

        match self.state() {
            EngineState::UpdatingFirmware => {
                return self.reject(name, "firmware update in progress").await
            }
            EngineState::Rebooting => return self.reject(name, "instrument is rebooting").await,
            _ => {}
        }

        match command {
            Command::SetStimProtocols { stim_info } => self.set_stim_protocols(name, stim_info).await,
            Command::StartStimulation => self.start_stimulation(name).await,
            Command::StopStimulation => {
                if !self.is_stimulating() {
                    return self.reject(name, "stimulation is not running").await;
                }
                self.send_tracked(PacketType::StopStim, &[], PendingCommand::StopStimulation)
                    .await
            }
            Command::StartStimChecks { well_indices } => {
                self.start_stim_checks(name, well_indices).await
            }
            Command::StartFirmwareUpdate {
                kind,
                version,
                file_contents,
            } => {
                self.start_firmware_update(name, kind, version, file_contents)
                    .await
            }
            Command::GetMetadata => {
                self.send_tracked(PacketType::GetMetadata, &[], PendingCommand::GetMetadata)
                    .await
            }
            Command::SetSamplingPeriod { period_us } => {
                if self.streaming {
                    return self.reject(name, "data streaming is running").await;
                }
                let period = match validate_sampling_period(period_us) {
                    Ok(period) => period,
                    Err(e) => return self.reject(name, e.to_string()).await,
                };
                self.send_tracked(
                    PacketType::SetSamplingPeriod,
                    &period.to_le_bytes(),
                    PendingCommand::SetSamplingPeriod { period_us },
                )
                .await
            }
            Command::StartDataStreaming => {
                if self.streaming {
                    return self.reject(name, "data streaming is already running").await;
                }
                self.send_tracked(
                    PacketType::StartDataStreaming,
                    &[],
                    PendingCommand::StartDataStreaming,
                )
                .await
            }
            Command::StopDataStreaming => {
                if !self.streaming {
                    return self.reject(name, "data streaming is not running").await;
                }
                self.send_tracked(
                    PacketType::StopDataStreaming,
                    &[],
                    PendingCommand::StopDataStreaming,
                )
                .await
            }
            Command::SetNickname { nickname } => {
                if nickname.len() > NICKNAME_LENGTH {
                    return self
                        .reject(name, format!("nickname longer than {} bytes", NICKNAME_LENGTH))
                        .await;
                }
                let payload = pad_string(&nickname, NICKNAME_LENGTH);
                self.send_tracked(
                    PacketType::SetNickname,
                    &payload,
                    PendingCommand::SetNickname { nickname },
                )
                .await
            }
            Command::Reboot => {
                if self.is_stimulating() {
                    return self.reject(name, "stimulation is running").await;
                }
                self.send_tracked(PacketType::Reboot, &[], PendingCommand::Reboot)
                    .await?;
                // the instrument stops answering handshakes from here on
                self.reboot = Some(RebootPhase::Requested);
                Ok(())
            }
        }
    }

    fn is_stimulating(&self) -> bool {
        !self.active_wells.is_empty()
    }

    async fn reject(&mut self, command: &str, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        warn!(command, %reason, "Rejecting command");
        self.emit(Event::CommandRejected {
            command: command.to_string(),
            reason,
        })
        .await
    }

    async fn set_stim_protocols(&mut self, name: &str, stim_info: StimInfo) -> Result<()> {
        if self.is_stimulating() {
            return self.reject(name, "stimulation is running").await;
        }
        if let Err(e) = stim_info.validate() {
            return self.reject(name, e.to_string()).await;
        }

        // the device gets the chunked trees, the walkers keep the originals
        let mut chunked = BTreeMap::new();
        let mut device_info = StimInfo {
            protocols: BTreeMap::new(),
            protocol_assignments: stim_info.protocol_assignments.clone(),
        };
        for (id, protocol) in &stim_info.protocols {
            let chunked_protocol = chunk_protocol(protocol)?;
            device_info
                .protocols
                .insert(id.clone(), chunked_protocol.protocol.clone());
            chunked.insert(id.clone(), chunked_protocol);
        }
        let payload = encode_protocols(&device_info)?;
        if payload.len() > MAX_PAYLOAD_LENGTH {
            return self
                .reject(
                    name,
                    format!("encoded protocols take {} bytes", payload.len()),
                )
                .await;
        }

        info!(
            protocols = stim_info.protocols.len(),
            wells = stim_info.protocol_assignments.len(),
            bytes = payload.len(),
            "Setting stimulation protocols"
        );
        self.send_tracked(
            PacketType::SetStimProtocol,
            &payload,
            PendingCommand::SetStimProtocols { stim_info, chunked },
        )
        .await
    }

    async fn start_stimulation(&mut self, name: &str) -> Result<()> {
        if self.is_stimulating() {
            return self.reject(name, "stimulation is already running").await;
        }
        let assigned = self
            .stim_info
            .as_ref()
            .map(|stim_info| stim_info.assigned_wells().len());
        match assigned {
            None => return self.reject(name, "no stimulation protocols set").await,
            Some(0) => return self.reject(name, "no wells assigned a protocol").await,
            Some(_) => {}
        }
        self.send_tracked(PacketType::StartStim, &[], PendingCommand::StartStimulation)
            .await
    }

    async fn start_stim_checks(&mut self, name: &str, well_indices: Vec<usize>) -> Result<()> {
        if self.is_stimulating() {
            return self.reject(name, "stimulation is running").await;
        }
        let wells: Vec<usize> = if well_indices.is_empty() {
            (0..NUM_WELLS).collect()
        } else {
            well_indices
        };
        let mut module_ids = Vec::with_capacity(wells.len());
        for &well in &wells {
            match well_idx_to_stim_module_id(well) {
                Some(id) => module_ids.push(id),
                None => return self.reject(name, format!("invalid well index {}", well)).await,
            }
        }
        module_ids.sort_unstable();
        module_ids.dedup();

        self.send_tracked(
            PacketType::StimImpedanceCheck,
            &module_ids,
            PendingCommand::StimChecks { wells },
        )
        .await
    }

    async fn start_firmware_update(
        &mut self,
        name: &str,
        kind: FirmwareKind,
        version: Semver,
        file_contents: Vec<u8>,
    ) -> Result<()> {
        if self.is_stimulating() {
            return self.reject(name, "stimulation is running").await;
        }
        let mut session = match FirmwareSession::new(kind, version, file_contents) {
            Ok(session) => session,
            Err(e) => return self.reject(name, e.to_string()).await,
        };
        let (packet_type, payload) = session.begin()?;
        self.firmware = Some(session);
        self.send_tracked(packet_type, &payload, PendingCommand::Firmware)
            .await
    }
}
