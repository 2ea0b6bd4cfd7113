//! Instrument communication engine.
//!
//! One engine owns one connection. After connecting it sends a handshake,
//! aligns on the byte stream, requests metadata and then multiplexes:
//!
//! - inbound bytes from the reader task, sorted into packets and dispatched
//! - commands from the owner's mailbox
//! - the periodic handshake
//! - the liveness watchdog (suppressed while rebooting or updating firmware)
//! - the command response watchdog
//!
//! All mutable state lives in [`Session`] and is only touched by the select
//! loop. Any error tears the whole task set down and is returned to the owner.

mod commands;
mod dispatch;

pub use commands::validate_sampling_period;

use crate::config::ControllerConfig;
use crate::error::{InstrumentError, Result};
use crate::firmware::FirmwareSession;
use crate::link::{resynchronize, Connection, InstrumentLink};
use crate::tracker::CommandTracker;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};
use stimlink_shared::protocol::{encode_packet, ChunkedProtocol, PacketType, ProtocolWalker};
use stimlink_shared::utils::time::protocol_timestamp;
use stimlink_shared::{Command, Event, StimInfo};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, Instrument};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Connecting,
    Resynchronizing,
    Ready,
    Streaming,
    Stimulating,
    UpdatingFirmware,
    Rebooting,
    Closed,
    Lost,
}

/// What a tracked command was sent for, used when its response arrives.
#[derive(Debug, Clone)]
pub(crate) enum PendingCommand {
    Handshake,
    GetMetadata,
    SetStimProtocols {
        stim_info: StimInfo,
        chunked: BTreeMap<String, ChunkedProtocol>,
    },
    StartStimulation,
    StopStimulation,
    StimChecks {
        wells: Vec<usize>,
    },
    SetSamplingPeriod {
        period_us: u32,
    },
    StartDataStreaming,
    StopDataStreaming,
    SetNickname {
        nickname: String,
    },
    Reboot,
    Firmware,
}

/// Where a requested reboot stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RebootPhase {
    /// Reboot sent, not yet acknowledged.
    Requested,
    /// Acknowledged; the next beacon means the instrument is back.
    Underway,
}

type LinkReader = ReadHalf<Box<dyn InstrumentLink>>;
type LinkWriter = WriteHalf<Box<dyn InstrumentLink>>;

pub struct Engine {
    connection: Connection,
    config: ControllerConfig,
    events: mpsc::Sender<Event>,
}

impl Engine {
    pub fn new(connection: Connection, config: ControllerConfig, events: mpsc::Sender<Event>) -> Self {
        Self {
            connection,
            config,
            events,
        }
    }

    /// Drive the connection until `cancel` fires, the command mailbox closes,
    /// or an unrecoverable error occurs.
    pub async fn run(
        self,
        commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let span = info_span!(
            "engine",
            port = %self.connection.port,
            is_virtual = self.connection.is_virtual
        );
        self.run_inner(commands, cancel).instrument(span).await
    }

    async fn run_inner(
        self,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let Engine {
            connection,
            config,
            events,
        } = self;
        let Connection {
            link,
            port,
            is_virtual,
        } = connection;
        debug!(state = ?EngineState::Connecting);

        let (mut reader, writer) = tokio::io::split(link);
        let mut session = Session::new(writer, events.clone(), config.clone());
        let tasks_cancel = cancel.child_token();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let result = async {
            session
                .emit(Event::GetBoardConnectionStatus {
                    connected: true,
                    is_virtual,
                    port: port.clone(),
                })
                .await?;

            // provoke a prompt reply before aligning on the stream
            session
                .send_tracked(PacketType::Handshake, &[], PendingCommand::Handshake)
                .await?;
            debug!(state = ?EngineState::Resynchronizing);
            let aligned = resynchronize(&mut reader, config.registration_timeout()).await?;
            session.residual.extend_from_slice(&aligned);
            info!("Synchronized with instrument");

            let (inbound_tx, mut inbound) = mpsc::channel(config.mailbox_capacity);
            tasks.spawn(
                read_loop(reader, inbound_tx, config.read_chunk_size, tasks_cancel.clone())
                    .in_current_span(),
            );

            session.process_residual().await?;
            session
                .send_tracked(PacketType::GetMetadata, &[], PendingCommand::GetMetadata)
                .await?;
            debug!(state = ?session.state());
            session
                .run_loop(&mut inbound, &mut commands, &cancel, &mut tasks)
                .await
        }
        .await;

        tasks_cancel.cancel();
        tasks.shutdown().await;
        let _ = events.try_send(Event::GetBoardConnectionStatus {
            connected: false,
            is_virtual,
            port,
        });

        match &result {
            Ok(()) => info!(state = ?EngineState::Closed, "Engine stopped"),
            Err(e) => error!(state = ?EngineState::Lost, "Engine failed: {}", e),
        }
        result
    }
}

/// Forward raw reads to the select loop. EOF means the device went away.
async fn read_loop(
    mut reader: LinkReader,
    tx: mpsc::Sender<Bytes>,
    chunk_size: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            debug!("Transport closed by instrument");
            return Err(InstrumentError::ConnectionLost);
        }
        trace!(bytes = n, "read from transport");
        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            return Ok(());
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Outcome once the reader's channel has closed. A reader that stopped
/// because the engine was cancelled is a clean close.
async fn reader_error(tasks: &mut JoinSet<Result<()>>, cancel: &CancellationToken) -> Result<()> {
    match tasks.join_next().await {
        Some(Ok(Err(e))) => Err(e),
        Some(Ok(Ok(()))) if cancel.is_cancelled() => {
            info!("Engine cancelled");
            Ok(())
        }
        _ => Err(InstrumentError::ConnectionLost),
    }
}

/// State owned by the select loop.
pub(crate) struct Session {
    writer: LinkWriter,
    events: mpsc::Sender<Event>,
    config: ControllerConfig,
    tracker: CommandTracker<PendingCommand>,
    /// Bytes read but not yet forming a whole packet.
    residual: BytesMut,
    liveness_deadline: Instant,
    firmware: Option<FirmwareSession>,
    reboot: Option<RebootPhase>,
    streaming: bool,
    /// Protocols as the owner sent them.
    stim_info: Option<StimInfo>,
    /// Protocols as the device received them, by protocol id.
    chunked: BTreeMap<String, ChunkedProtocol>,
    active_wells: BTreeSet<usize>,
    /// Position of each stimulating well in its protocol.
    walkers: BTreeMap<usize, ProtocolWalker>,
}

impl Session {
    fn new(writer: LinkWriter, events: mpsc::Sender<Event>, config: ControllerConfig) -> Self {
        Self {
            writer,
            events,
            tracker: CommandTracker::new(config.command_response_timeout()),
            liveness_deadline: Instant::now() + config.status_beacon_timeout(),
            config,
            residual: BytesMut::with_capacity(8 * 1024),
            firmware: None,
            reboot: None,
            streaming: false,
            stim_info: None,
            chunked: BTreeMap::new(),
            active_wells: BTreeSet::new(),
            walkers: BTreeMap::new(),
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        if self.firmware.is_some() {
            EngineState::UpdatingFirmware
        } else if self.reboot.is_some() {
            EngineState::Rebooting
        } else if !self.active_wells.is_empty() {
            EngineState::Stimulating
        } else if self.streaming {
            EngineState::Streaming
        } else {
            EngineState::Ready
        }
    }

    fn liveness_suppressed(&self) -> bool {
        matches!(
            self.state(),
            EngineState::UpdatingFirmware | EngineState::Rebooting
        )
    }

    fn mark_alive(&mut self) {
        self.liveness_deadline = Instant::now() + self.config.status_beacon_timeout();
    }

    async fn run_loop(
        &mut self,
        inbound: &mut mpsc::Receiver<Bytes>,
        commands: &mut mpsc::Receiver<Command>,
        cancel: &CancellationToken,
        tasks: &mut JoinSet<Result<()>>,
    ) -> Result<()> {
        let period = self.config.handshake_period();
        let mut handshake = tokio::time::interval_at(Instant::now() + period, period);
        handshake.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.mark_alive();

        loop {
            let liveness = (!self.liveness_suppressed()).then_some(self.liveness_deadline);
            let expiry = self.tracker.next_deadline();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Engine cancelled");
                    return Ok(());
                }
                chunk = inbound.recv() => match chunk {
                    Some(bytes) => self.handle_bytes(&bytes).await?,
                    None => return reader_error(tasks, cancel).await,
                },
                _ = handshake.tick() => {
                    if !self.liveness_suppressed() {
                        self.send_tracked(PacketType::Handshake, &[], PendingCommand::Handshake)
                            .await?;
                    }
                }
                _ = sleep_until_opt(liveness) => {
                    return Err(InstrumentError::StatusBeaconTimeout(
                        self.config.status_beacon_timeout(),
                    ));
                }
                _ = sleep_until_opt(expiry) => {
                    if let Some(expired) = self.tracker.poll_expired(Instant::now()) {
                        return Err(InstrumentError::CommandResponseTimeout {
                            packet_type: expired.packet_type,
                            timeout: expired.timeout(),
                        });
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await?,
                    None => {
                        info!("Command mailbox closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    pub(crate) async fn emit(&self, event: Event) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| InstrumentError::EventChannelClosed)
    }

    pub(crate) async fn send_packet(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let bytes = encode_packet(protocol_timestamp(), packet_type.as_u8(), payload)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        trace!(packet_type = %packet_type, bytes = bytes.len(), "sent packet");
        Ok(())
    }

    /// Send a packet and wait for the device's response of the same type.
    pub(crate) async fn send_tracked(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
        pending: PendingCommand,
    ) -> Result<()> {
        self.send_packet(packet_type, payload).await?;
        self.tracker.add(packet_type, pending);
        Ok(())
    }
}
