//! Inbound packet handling.

use super::{PendingCommand, RebootPhase, Session};
use crate::error::{InstrumentError, Result};
use crate::firmware::FirmwareError;
use crate::impedance::parse_impedance_response;
use stimlink_shared::protocol::stim::parse_stim_statuses;
use stimlink_shared::protocol::{
    parse_status_codes, sort_packets, DataPacket, PacketError, PacketType, ProtocolError,
    ProtocolWalker, StimStreamInfo, STIM_COMPLETE_SUBPROTOCOL_IDX,
};
use stimlink_shared::utils::bytes_to_hex;
use stimlink_shared::{BarcodeKind, Event, InstrumentMetadata};
use tracing::{debug, error, info, trace, warn};

impl Session {
    pub(super) async fn handle_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.residual.extend_from_slice(bytes);
        self.process_residual().await
    }

    /// Dispatch every complete packet in the residual buffer.
    pub(super) async fn process_residual(&mut self) -> Result<()> {
        let sorted = sort_packets(&self.residual)?;
        self.residual.clear();
        self.residual.extend_from_slice(&sorted.unread_bytes);

        for failure in &sorted.checksum_failures {
            warn!("Dropping inbound packet: {}", failure);
            self.send_packet(PacketType::ChecksumFailure, &[]).await?;
        }
        if sorted.magnetometer_packets > 0 {
            trace!(count = sorted.magnetometer_packets, "discarding magnetometer data");
        }

        for packet in &sorted.other {
            if let Err(source) = self.dispatch(packet).await {
                return Err(InstrumentError::PacketDispatch {
                    timestamp: packet.timestamp,
                    packet_type: packet.packet_type,
                    payload: bytes_to_hex(&packet.payload),
                    source: Box::new(source),
                });
            }
        }

        if sorted.stim_stream_info.num_packets > 0 {
            self.handle_stim_statuses(&sorted.stim_stream_info).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, packet: &DataPacket) -> Result<()> {
        let packet_type = PacketType::try_from(packet.packet_type)?;
        let payload = packet.payload.as_slice();
        match packet_type {
            PacketType::StatusBeacon => self.handle_status_codes(payload).await,
            PacketType::GoingDormant => Err(InstrumentError::FirmwareGoingDormant(
                payload.first().copied().unwrap_or_default(),
            )),
            PacketType::BarcodeFound => self.handle_barcode(payload).await,
            PacketType::CfUpdateComplete | PacketType::MfUpdateComplete => {
                let session = self.firmware.as_mut().ok_or(FirmwareError::NotActive)?;
                session.handle_update_complete(packet_type)?;
                info!("Instrument applied firmware, waiting for it to reboot");
                Ok(())
            }
            PacketType::ChecksumFailure => Err(InstrumentError::ChecksumRejectedByInstrument),
            t if t.expects_response() => self.handle_response(t, payload).await,
            other => Err(PacketError::UnrecognizedPacketType(other.as_u8()).into()),
        }
    }

    /// Beacon or handshake response.
    async fn handle_status_codes(&mut self, payload: &[u8]) -> Result<()> {
        let codes = parse_status_codes(payload)?;
        if codes.has_error() {
            error!(status = %codes, "Instrument reported an error");
            self.send_packet(PacketType::ErrorAck, &[]).await?;
            return Err(InstrumentError::InstrumentFirmwareError(codes));
        }
        self.mark_alive();

        if self.reboot == Some(RebootPhase::Underway) {
            self.reboot = None;
            info!("Instrument back online after reboot");
            self.emit(Event::RebootComplete).await?;
        }
        let finished = self
            .firmware
            .as_mut()
            .map_or(false, |session| session.handle_beacon());
        if finished {
            if let Some(session) = self.firmware.take() {
                self.emit(Event::FirmwareUpdateComplete {
                    kind: session.kind(),
                    version: session.version(),
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn handle_barcode(&mut self, payload: &[u8]) -> Result<()> {
        let barcode = String::from_utf8_lossy(payload)
            .trim_end_matches('\0')
            .trim()
            .to_string();
        let kind = BarcodeKind::from_barcode(&barcode);
        info!(%barcode, ?kind, "Barcode scanned");
        self.emit(Event::GetBarcode { barcode, kind }).await
    }

    async fn handle_response(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let command = self
            .tracker
            .pop(packet_type)
            .map_err(|_| InstrumentError::UntrackedResponse(packet_type))?;
        debug!(
            packet_type = %packet_type,
            elapsed_ms = command.created_at.elapsed().as_millis() as u64,
            "Response received"
        );

        // firmware acks carry their own failure semantics
        let is_firmware = matches!(command.info, PendingCommand::Firmware);
        if !is_firmware
            && packet_type.response_has_failure_flag()
            && payload.first().copied().unwrap_or(1) != 0
        {
            return Err(InstrumentError::CommandFailed(packet_type));
        }

        match command.info {
            PendingCommand::Handshake => self.handle_status_codes(payload).await,
            PendingCommand::GetMetadata => {
                let metadata = InstrumentMetadata::parse(payload)?;
                info!(
                    serial_number = %metadata.serial_number,
                    nickname = %metadata.nickname,
                    main_firmware = %metadata.main_firmware_version,
                    channel_firmware = %metadata.channel_firmware_version,
                    "Instrument metadata"
                );
                self.emit(Event::GetMetadata { metadata }).await
            }
            PendingCommand::SetStimProtocols { stim_info, chunked } => {
                info!(protocols = stim_info.protocols.len(), "Stimulation protocols set");
                self.walkers.clear();
                self.stim_info = Some(stim_info);
                self.chunked = chunked;
                self.emit(Event::SetStimProtocols).await
            }
            PendingCommand::StartStimulation => {
                self.start_walkers()?;
                let wells: Vec<usize> = self.active_wells.iter().copied().collect();
                info!(wells = wells.len(), "Stimulation started");
                self.emit(Event::StartStimulation { wells }).await
            }
            PendingCommand::StopStimulation => {
                self.active_wells.clear();
                self.walkers.clear();
                info!("Stimulation stopped");
                self.emit(Event::StopStimulation).await
            }
            PendingCommand::StimChecks { wells } => {
                let results = parse_impedance_response(payload, &wells)?;
                self.emit(Event::StartStimChecks { results }).await
            }
            PendingCommand::SetSamplingPeriod { period_us } => {
                self.emit(Event::SetSamplingPeriod { period_us }).await
            }
            PendingCommand::StartDataStreaming => {
                self.streaming = true;
                self.emit(Event::StartDataStreaming).await
            }
            PendingCommand::StopDataStreaming => {
                self.streaming = false;
                self.emit(Event::StopDataStreaming).await
            }
            PendingCommand::SetNickname { nickname } => {
                self.emit(Event::SetNickname { nickname }).await
            }
            PendingCommand::Reboot => {
                self.reboot = Some(RebootPhase::Underway);
                let dropped = self.tracker.discard(PacketType::Handshake);
                info!(dropped_handshakes = dropped, "Instrument rebooting");
                self.emit(Event::Reboot).await
            }
            PendingCommand::Firmware => self.advance_firmware(packet_type, payload).await,
        }
    }

    async fn advance_firmware(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let session = self.firmware.as_mut().ok_or(FirmwareError::NotActive)?;
        let next = session.handle_response(packet_type, payload)?;
        let progress = (packet_type == PacketType::FirmwareUpdate)
            .then(|| (session.kind(), session.bytes_sent(), session.total_bytes()));

        if let Some((kind, bytes_sent, total_bytes)) = progress {
            self.emit(Event::FirmwareUpdateProgress {
                kind,
                bytes_sent,
                total_bytes,
            })
            .await?;
        }
        if let Some((next_type, next_payload)) = next {
            self.send_tracked(next_type, &next_payload, PendingCommand::Firmware)
                .await?;
        }
        Ok(())
    }

    /// One walker per assigned well.
    fn start_walkers(&mut self) -> Result<()> {
        let Some(stim_info) = &self.stim_info else {
            return Ok(());
        };
        self.active_wells = stim_info.assigned_wells().into_iter().collect();
        self.walkers = stim_info
            .protocol_assignments
            .keys()
            .filter_map(|&well| Some((well, stim_info.protocol_for_well(well)?.1)))
            .map(|(well, protocol)| {
                ProtocolWalker::for_protocol(protocol).map(|walker| (well, walker))
            })
            .collect::<std::result::Result<_, ProtocolError>>()?;
        Ok(())
    }

    async fn handle_stim_statuses(&mut self, info: &StimStreamInfo) -> Result<()> {
        let mut statuses = parse_stim_statuses(info)?;
        let mut finished: Vec<(usize, String)> = Vec::new();

        for (well, entries) in statuses.iter_mut() {
            let protocol_id = self
                .stim_info
                .as_ref()
                .and_then(|info| info.protocol_assignments.get(well))
                .cloned();
            for entry in entries.iter_mut() {
                if entry.subprotocol_idx == STIM_COMPLETE_SUBPROTOCOL_IDX {
                    if let Some(walker) = self.walkers.remove(well) {
                        if !walker.complete() {
                            warn!(
                                well,
                                position = ?walker.current_leaf_idx(),
                                "Well finished before reaching its final subprotocol"
                            );
                        }
                    }
                    finished.push((*well, protocol_id.clone().unwrap_or_default()));
                    continue;
                }
                let Some(id) = &protocol_id else {
                    continue;
                };
                if let Some(original) = self
                    .chunked
                    .get(id)
                    .and_then(|chunked| chunked.original_idx(entry.subprotocol_idx))
                {
                    entry.subprotocol_idx = original;
                }
                let Some(walker) = self.walkers.get_mut(well) else {
                    continue;
                };
                let max_steps = 2 * walker.leaf_count() + 1;
                if !walker.sync_to(entry.subprotocol_idx as usize, max_steps) {
                    return Err(InstrumentError::StimStatusOutOfSequence {
                        well: *well,
                        protocol_id: id.clone(),
                        subprotocol_idx: entry.subprotocol_idx,
                    });
                }
                trace!(
                    well,
                    protocol_id = %id,
                    position = entry.subprotocol_idx,
                    complete = walker.complete()
                );
            }
        }

        self.emit(Event::StimStatusUpdate {
            well_statuses: statuses,
        })
        .await?;

        let mut any_finished = false;
        for (well, protocol_id) in finished {
            if self.active_wells.remove(&well) {
                any_finished = true;
                debug!(well, %protocol_id, "Well finished its protocol");
                self.emit(Event::StimProtocolComplete { well, protocol_id })
                    .await?;
            }
        }
        if any_finished && self.active_wells.is_empty() {
            self.walkers.clear();
            info!("All wells finished stimulating");
            self.emit(Event::StimulationComplete).await?;
        }
        Ok(())
    }
}

