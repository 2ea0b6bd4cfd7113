//! Stimulation protocol codec.
//!
//! ## Leaf (31 bytes)
//!
//! ```text
//! is_loop=0 (1) │ leaf index (1) │ pulse (29)
//! ```
//!
//! ## Pulse (29 bytes)
//!
//! ```text
//! phase1 dur (4) │ phase1 charge (2) │ interphase (4) │ 0 (2) │ phase2 dur (4) │
//! phase2 charge (2) │ postphase (4) │ 0 (2) │ cycles or delay ms (4) │ is_delay (1)
//! ```
//!
//! ## Loop
//!
//! ```text
//! is_loop=1 (1) │ child count (1) │ iterations (4) │ children ...
//! ```
//!
//! Leaf indices are assigned depth-first and are unique within a protocol.

use super::{PacketError, ProtocolError, StimStreamInfo};
use crate::types::messages::{StimStatus, StimStatusEntry};
use crate::types::stimulation::{
    StimInfo, StimProtocol, StimulationType, SubprotocolNode, MAX_SUBPROTOCOL_CHUNK_DURATION_US,
    MICROS_PER_MILLI, MIN_SUBPROTOCOL_DURATION_US,
};
use crate::types::wells::{stim_module_id_to_well_idx, well_idx_to_stim_module_id};
use std::collections::BTreeMap;

pub const PULSE_LENGTH: usize = 29;
pub const LOOP_HEADER_LENGTH: usize = 6;

/// Bytes per entry in a stimulation status packet.
pub const STIM_STATUS_ENTRY_LENGTH: usize = 11;

/// Encode one pulse or delay into its fixed 29-byte layout.
pub fn encode_pulse(
    node: &SubprotocolNode,
    stimulation_type: StimulationType,
) -> Result<[u8; PULSE_LENGTH], ProtocolError> {
    let divisor = stimulation_type.charge_divisor();
    let charge = |value: i32| -> Result<[u8; 2], ProtocolError> {
        i16::try_from(value / divisor)
            .map(i16::to_le_bytes)
            .map_err(|_| ProtocolError::ChargeOutOfRange(value))
    };

    let mut out = [0u8; PULSE_LENGTH];
    match *node {
        SubprotocolNode::Delay { duration_us } => {
            let duration_ms = u32::try_from(duration_us / MICROS_PER_MILLI)
                .map_err(|_| ProtocolError::SubprotocolTooLong(duration_us))?;
            out[24..28].copy_from_slice(&duration_ms.to_le_bytes());
            out[28] = 1;
        }
        SubprotocolNode::Monophasic {
            phase1_duration_us,
            phase1_charge,
            postphase_interval_us,
            num_cycles,
        } => {
            out[0..4].copy_from_slice(&phase1_duration_us.to_le_bytes());
            out[4..6].copy_from_slice(&charge(phase1_charge)?);
            out[20..24].copy_from_slice(&postphase_interval_us.to_le_bytes());
            out[24..28].copy_from_slice(&num_cycles.to_le_bytes());
        }
        SubprotocolNode::Biphasic {
            phase1_duration_us,
            phase1_charge,
            interphase_interval_us,
            phase2_duration_us,
            phase2_charge,
            postphase_interval_us,
            num_cycles,
        } => {
            out[0..4].copy_from_slice(&phase1_duration_us.to_le_bytes());
            out[4..6].copy_from_slice(&charge(phase1_charge)?);
            out[6..10].copy_from_slice(&interphase_interval_us.to_le_bytes());
            out[12..16].copy_from_slice(&phase2_duration_us.to_le_bytes());
            out[16..18].copy_from_slice(&charge(phase2_charge)?);
            out[20..24].copy_from_slice(&postphase_interval_us.to_le_bytes());
            out[24..28].copy_from_slice(&num_cycles.to_le_bytes());
        }
        SubprotocolNode::Loop { .. } => return Err(ProtocolError::LoopNotPulse),
    }
    Ok(out)
}

/// Decode a 29-byte pulse. A pulse with no second phase decodes as monophasic.
pub fn decode_pulse(
    bytes: &[u8],
    stimulation_type: StimulationType,
) -> Result<SubprotocolNode, ProtocolError> {
    if bytes.len() < PULSE_LENGTH {
        return Err(ProtocolError::UnexpectedEnd(bytes.len()));
    }
    let divisor = stimulation_type.charge_divisor();
    let u32_at = |offset: usize| u32::from_le_bytes(array_at(bytes, offset));
    let charge_at = |offset: usize| i16::from_le_bytes(array_at(bytes, offset)) as i32 * divisor;

    if bytes[28] != 0 {
        return Ok(SubprotocolNode::Delay {
            duration_us: u32_at(24) as u64 * MICROS_PER_MILLI,
        });
    }

    let interphase_interval_us = u32_at(6);
    let phase2_duration_us = u32_at(12);
    let phase2_charge = charge_at(16);
    if interphase_interval_us == 0 && phase2_duration_us == 0 && phase2_charge == 0 {
        Ok(SubprotocolNode::Monophasic {
            phase1_duration_us: u32_at(0),
            phase1_charge: charge_at(4),
            postphase_interval_us: u32_at(20),
            num_cycles: u32_at(24),
        })
    } else {
        Ok(SubprotocolNode::Biphasic {
            phase1_duration_us: u32_at(0),
            phase1_charge: charge_at(4),
            interphase_interval_us,
            phase2_duration_us,
            phase2_charge,
            postphase_interval_us: u32_at(20),
            num_cycles: u32_at(24),
        })
    }
}

/// Encode `node` and its subtree, numbering leaves from `leaf_idx`.
///
/// Returns the index the next leaf after this subtree should receive.
pub fn encode_subprotocol(
    node: &SubprotocolNode,
    stimulation_type: StimulationType,
    leaf_idx: usize,
    out: &mut Vec<u8>,
) -> Result<usize, ProtocolError> {
    match node {
        SubprotocolNode::Loop {
            num_iterations,
            children,
        } => {
            let child_count =
                u8::try_from(children.len()).map_err(|_| ProtocolError::TooManyChildren(children.len()))?;
            out.push(1);
            out.push(child_count);
            out.extend_from_slice(&num_iterations.to_le_bytes());
            children.iter().try_fold(leaf_idx, |next, child| {
                encode_subprotocol(child, stimulation_type, next, out)
            })
        }
        leaf => {
            let idx = u8::try_from(leaf_idx)
                .ok()
                .filter(|&idx| idx != super::STIM_COMPLETE_SUBPROTOCOL_IDX)
                .ok_or(ProtocolError::TooManyLeaves(leaf_idx + 1))?;
            out.push(0);
            out.push(idx);
            out.extend_from_slice(&encode_pulse(leaf, stimulation_type)?);
            Ok(leaf_idx + 1)
        }
    }
}

/// Decode one node starting at `offset`. Returns the node and the offset after it.
pub fn decode_subprotocol(
    bytes: &[u8],
    offset: usize,
    stimulation_type: StimulationType,
) -> Result<(SubprotocolNode, usize), ProtocolError> {
    let is_loop = *bytes.get(offset).ok_or(ProtocolError::UnexpectedEnd(offset))?;
    if is_loop == 0 {
        let start = offset + 2;
        let end = start + PULSE_LENGTH;
        let pulse = bytes
            .get(start..end)
            .ok_or(ProtocolError::UnexpectedEnd(bytes.len()))?;
        return Ok((decode_pulse(pulse, stimulation_type)?, end));
    }

    let header = bytes
        .get(offset..offset + LOOP_HEADER_LENGTH)
        .ok_or(ProtocolError::UnexpectedEnd(bytes.len()))?;
    let child_count = header[1] as usize;
    let num_iterations = u32::from_le_bytes(array_at(header, 2));

    let mut cursor = offset + LOOP_HEADER_LENGTH;
    let mut children = Vec::with_capacity(child_count);
    for _ in 0..child_count {
        let (child, next) = decode_subprotocol(bytes, cursor, stimulation_type)?;
        children.push(child);
        cursor = next;
    }
    Ok((
        SubprotocolNode::Loop {
            num_iterations,
            children,
        },
        cursor,
    ))
}

/// Encode every protocol in `stim_info` along with the module ids assigned to it.
///
/// Protocols are written in id order; protocols are encoded exactly as
/// given, so callers chunk beforehand.
pub fn encode_protocols(stim_info: &StimInfo) -> Result<Vec<u8>, ProtocolError> {
    let count = u8::try_from(stim_info.protocols.len())
        .map_err(|_| ProtocolError::TooManyChildren(stim_info.protocols.len()))?;
    let mut out = vec![count];

    for (protocol_id, protocol) in &stim_info.protocols {
        protocol.root_loop()?;
        out.push(protocol.stimulation_type.is_voltage() as u8);
        out.push(protocol.run_until_stopped as u8);
        out.push(0);
        encode_subprotocol(&protocol.root, protocol.stimulation_type, 0, &mut out)?;

        let mut module_ids = stim_info
            .wells_for(protocol_id)
            .into_iter()
            .map(|well| well_idx_to_stim_module_id(well).ok_or(ProtocolError::InvalidWell(well)))
            .collect::<Result<Vec<u8>, _>>()?;
        module_ids.sort_unstable();
        out.push(module_ids.len() as u8);
        out.extend_from_slice(&module_ids);
    }
    Ok(out)
}

/// Decode a protocol list. Protocol ids are not on the wire, so each
/// protocol is returned with the wells assigned to it.
pub fn decode_protocols(bytes: &[u8]) -> Result<Vec<(StimProtocol, Vec<usize>)>, ProtocolError> {
    let count = *bytes.first().ok_or(ProtocolError::UnexpectedEnd(0))?;
    let mut cursor = 1;
    let mut protocols = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let flags = bytes
            .get(cursor..cursor + 3)
            .ok_or(ProtocolError::UnexpectedEnd(bytes.len()))?;
        let stimulation_type = if flags[0] != 0 {
            StimulationType::Voltage
        } else {
            StimulationType::Current
        };
        let run_until_stopped = flags[1] != 0;
        let (root, next) = decode_subprotocol(bytes, cursor + 3, stimulation_type)?;
        if !root.is_loop() {
            return Err(ProtocolError::RootNotLoop);
        }

        let well_count = *bytes.get(next).ok_or(ProtocolError::UnexpectedEnd(next))? as usize;
        let module_ids = bytes
            .get(next + 1..next + 1 + well_count)
            .ok_or(ProtocolError::UnexpectedEnd(bytes.len()))?;
        let wells = module_ids
            .iter()
            .map(|&id| stim_module_id_to_well_idx(id))
            .collect::<Result<Vec<_>, _>>()?;
        cursor = next + 1 + well_count;

        protocols.push((
            StimProtocol {
                stimulation_type,
                run_until_stopped,
                root,
            },
            wells,
        ));
    }
    Ok(protocols)
}

/// Result of splitting a long pulse into device-sized chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkedSubprotocol {
    Unchanged(SubprotocolNode),
    Chunked {
        /// Loop over a single pulse of at most one chunk's duration.
        chunk_loop: SubprotocolNode,
        /// Cycles that did not fill a whole chunk.
        leftover: Option<SubprotocolNode>,
    },
}

impl ChunkedSubprotocol {
    pub fn into_nodes(self) -> Vec<SubprotocolNode> {
        match self {
            Self::Unchanged(node) => vec![node],
            Self::Chunked {
                chunk_loop,
                leftover,
            } => std::iter::once(chunk_loop).chain(leftover).collect(),
        }
    }
}

/// Split a pulse longer than one chunk into a loop of whole-chunk pulses
/// plus a leftover pulse.
///
/// Delays, loops, and pulses that already fit are returned unchanged. A
/// leftover shorter than the minimum subprotocol duration is merged with the
/// loop's final iteration.
pub fn chunk_subprotocol(node: &SubprotocolNode) -> ChunkedSubprotocol {
    // TODO: loops longer than one chunk are passed through; the device has no
    // defined behaviour for them yet.
    let (Some(cycle_us), Some(total_cycles)) = (node.cycle_duration_us(), node.num_cycles()) else {
        return ChunkedSubprotocol::Unchanged(node.clone());
    };
    if node.duration_us() <= MAX_SUBPROTOCOL_CHUNK_DURATION_US || cycle_us == 0 {
        return ChunkedSubprotocol::Unchanged(node.clone());
    }
    let max_cycles = (MAX_SUBPROTOCOL_CHUNK_DURATION_US / cycle_us) as u32;
    if max_cycles == 0 {
        return ChunkedSubprotocol::Unchanged(node.clone());
    }

    let mut num_iterations = total_cycles / max_cycles;
    let mut leftover_cycles = total_cycles % max_cycles;
    if leftover_cycles > 0 && (leftover_cycles as u64 * cycle_us) < MIN_SUBPROTOCOL_DURATION_US {
        num_iterations -= 1;
        leftover_cycles += max_cycles;
        if num_iterations == 0 {
            return ChunkedSubprotocol::Unchanged(node.clone());
        }
    }

    ChunkedSubprotocol::Chunked {
        chunk_loop: SubprotocolNode::Loop {
            num_iterations,
            children: vec![node.with_num_cycles(max_cycles)],
        },
        leftover: (leftover_cycles > 0).then(|| node.with_num_cycles(leftover_cycles)),
    }
}

/// A protocol after chunking, with the mapping back to the caller's leaf numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedProtocol {
    pub protocol: StimProtocol,
    /// Entry `i` is the original leaf index of chunked leaf `i`.
    pub original_leaf_idx: Vec<u8>,
}

impl ChunkedProtocol {
    pub fn original_idx(&self, chunked_idx: u8) -> Option<u8> {
        self.original_leaf_idx.get(chunked_idx as usize).copied()
    }
}

/// Chunk every long pulse in `protocol`.
pub fn chunk_protocol(protocol: &StimProtocol) -> Result<ChunkedProtocol, ProtocolError> {
    let (children, num_iterations) = protocol.root_loop()?;
    let mut original_leaf_idx = Vec::new();
    let (children, _) = chunk_children(children, 0, &mut original_leaf_idx)?;
    Ok(ChunkedProtocol {
        protocol: StimProtocol {
            stimulation_type: protocol.stimulation_type,
            run_until_stopped: protocol.run_until_stopped,
            root: SubprotocolNode::Loop {
                num_iterations,
                children,
            },
        },
        original_leaf_idx,
    })
}

fn chunk_children(
    children: &[SubprotocolNode],
    mut original_idx: usize,
    original_leaf_idx: &mut Vec<u8>,
) -> Result<(Vec<SubprotocolNode>, usize), ProtocolError> {
    let mut out = Vec::with_capacity(children.len());
    for child in children {
        match child {
            SubprotocolNode::Loop {
                num_iterations,
                children,
            } => {
                let (children, next) = chunk_children(children, original_idx, original_leaf_idx)?;
                original_idx = next;
                out.push(SubprotocolNode::Loop {
                    num_iterations: *num_iterations,
                    children,
                });
            }
            leaf => {
                let idx = u8::try_from(original_idx)
                    .map_err(|_| ProtocolError::TooManyLeaves(original_idx + 1))?;
                for node in chunk_subprotocol(leaf).into_nodes() {
                    original_leaf_idx.extend(std::iter::repeat(idx).take(node.leaf_count()));
                    out.push(node);
                }
                original_idx += 1;
            }
        }
    }
    Ok((out, original_idx))
}

/// Parse concatenated stimulation status payloads into per-well entries.
pub fn parse_stim_statuses(
    info: &StimStreamInfo,
) -> Result<BTreeMap<usize, Vec<StimStatusEntry>>, PacketError> {
    let bytes = &info.raw_bytes;
    let mut statuses: BTreeMap<usize, Vec<StimStatusEntry>> = BTreeMap::new();
    let mut cursor = 0;

    for _ in 0..info.num_packets {
        let count = *bytes.get(cursor).ok_or(PacketError::Truncated {
            needed: cursor + 1,
            available: bytes.len(),
        })? as usize;
        cursor += 1;
        let end = cursor + count * STIM_STATUS_ENTRY_LENGTH;
        if bytes.len() < end {
            return Err(PacketError::Truncated {
                needed: end,
                available: bytes.len(),
            });
        }
        for entry in bytes[cursor..end].chunks_exact(STIM_STATUS_ENTRY_LENGTH) {
            let well = stim_module_id_to_well_idx(entry[0])?;
            statuses.entry(well).or_default().push(StimStatusEntry {
                status: StimStatus::try_from(entry[1])?,
                timestamp: u64::from_le_bytes(array_at(entry, 2)),
                subprotocol_idx: entry[10],
            });
        }
        cursor = end;
    }
    Ok(statuses)
}

fn array_at<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}
