//! Stimulation protocol model
//!
//! A protocol is a tree of subprotocols rooted at a single loop. Leaves are
//! pulses (monophasic or biphasic) or delays; inner nodes are loops.

use crate::protocol::{ProtocolError, ProtocolWalker};
use crate::types::wells::NUM_WELLS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MICROS_PER_MILLI: u64 = 1_000;

/// Shortest allowed subprotocol (100 ms).
pub const MIN_SUBPROTOCOL_DURATION_US: u64 = 100 * MICROS_PER_MILLI;

/// Longest allowed subprotocol (24 h).
pub const MAX_SUBPROTOCOL_DURATION_US: u64 = 24 * 60 * 60 * 1_000_000;

/// Longest pulse the device accepts as a single chunk (1 min).
pub const MAX_SUBPROTOCOL_CHUNK_DURATION_US: u64 = 60 * 1_000_000;

pub const MAX_DUTY_CYCLE_FRACTION: f64 = 0.8;
pub const MAX_DUTY_CYCLE_DURATION_US: u64 = 50 * MICROS_PER_MILLI;
pub const MAX_SUBPROTOCOLS_PER_PROTOCOL: usize = 50;

/// How the stimulator drives the electrodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StimulationType {
    /// Charges are in µA and travel on the wire divided by 10.
    Current,
    /// Charges are in mV and travel on the wire unscaled.
    Voltage,
}

impl StimulationType {
    pub fn charge_divisor(self) -> i32 {
        match self {
            Self::Current => 10,
            Self::Voltage => 1,
        }
    }

    pub fn is_voltage(self) -> bool {
        matches!(self, Self::Voltage)
    }
}

/// One node of a protocol tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubprotocolNode {
    Delay {
        duration_us: u64,
    },
    Monophasic {
        phase1_duration_us: u32,
        phase1_charge: i32,
        postphase_interval_us: u32,
        num_cycles: u32,
    },
    Biphasic {
        phase1_duration_us: u32,
        phase1_charge: i32,
        interphase_interval_us: u32,
        phase2_duration_us: u32,
        phase2_charge: i32,
        postphase_interval_us: u32,
        num_cycles: u32,
    },
    Loop {
        num_iterations: u32,
        children: Vec<SubprotocolNode>,
    },
}

impl SubprotocolNode {
    pub fn is_loop(&self) -> bool {
        matches!(self, Self::Loop { .. })
    }

    pub fn is_delay(&self) -> bool {
        matches!(self, Self::Delay { .. })
    }

    /// Duration of a single pulse cycle, or `None` for delays and loops.
    pub fn cycle_duration_us(&self) -> Option<u64> {
        match *self {
            Self::Monophasic {
                phase1_duration_us,
                postphase_interval_us,
                ..
            } => Some(phase1_duration_us as u64 + postphase_interval_us as u64),
            Self::Biphasic {
                phase1_duration_us,
                interphase_interval_us,
                phase2_duration_us,
                postphase_interval_us,
                ..
            } => Some(
                phase1_duration_us as u64
                    + interphase_interval_us as u64
                    + phase2_duration_us as u64
                    + postphase_interval_us as u64,
            ),
            Self::Delay { .. } | Self::Loop { .. } => None,
        }
    }

    /// Time per cycle during which charge is being delivered.
    pub fn active_duration_us(&self) -> Option<u64> {
        match *self {
            Self::Monophasic {
                phase1_duration_us, ..
            } => Some(phase1_duration_us as u64),
            Self::Biphasic {
                phase1_duration_us,
                interphase_interval_us,
                phase2_duration_us,
                ..
            } => Some(
                phase1_duration_us as u64 + interphase_interval_us as u64 + phase2_duration_us as u64,
            ),
            Self::Delay { .. } | Self::Loop { .. } => None,
        }
    }

    pub fn num_cycles(&self) -> Option<u32> {
        match *self {
            Self::Monophasic { num_cycles, .. } | Self::Biphasic { num_cycles, .. } => {
                Some(num_cycles)
            }
            Self::Delay { .. } | Self::Loop { .. } => None,
        }
    }

    /// Copy of this pulse with a different cycle count. Delays and loops are
    /// returned unchanged.
    pub fn with_num_cycles(&self, cycles: u32) -> Self {
        let mut node = self.clone();
        match &mut node {
            Self::Monophasic { num_cycles, .. } | Self::Biphasic { num_cycles, .. } => {
                *num_cycles = cycles;
            }
            Self::Delay { .. } | Self::Loop { .. } => {}
        }
        node
    }

    /// Total run time of this node, loops included. Saturates at `u64::MAX`.
    pub fn duration_us(&self) -> u64 {
        match self {
            Self::Delay { duration_us } => *duration_us,
            Self::Loop {
                num_iterations,
                children,
            } => children
                .iter()
                .map(Self::duration_us)
                .fold(0u64, u64::saturating_add)
                .saturating_mul(*num_iterations as u64),
            pulse => pulse
                .cycle_duration_us()
                .unwrap_or(0)
                .saturating_mul(pulse.num_cycles().unwrap_or(0) as u64),
        }
    }

    /// Number of leaves (pulses and delays) in this subtree.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Loop { children, .. } => children.iter().map(Self::leaf_count).sum(),
            _ => 1,
        }
    }

    /// Check the limits that apply to this node and everything below it.
    pub fn validate(&self, stimulation_type: StimulationType) -> Result<(), ProtocolError> {
        match self {
            Self::Loop {
                num_iterations,
                children,
            } => {
                if children.is_empty() {
                    return Err(ProtocolError::EmptyLoop);
                }
                if children.len() > u8::MAX as usize {
                    return Err(ProtocolError::TooManyChildren(children.len()));
                }
                if *num_iterations == 0 {
                    return Err(ProtocolError::ZeroIterations);
                }
                children
                    .iter()
                    .try_for_each(|child| child.validate(stimulation_type))
            }
            Self::Delay { duration_us } => {
                check_duration(*duration_us)?;
                // delays travel in whole milliseconds
                if duration_us % MICROS_PER_MILLI != 0 {
                    return Err(ProtocolError::DelayNotWholeMillis(*duration_us));
                }
                Ok(())
            }
            pulse => {
                check_duration(pulse.duration_us())?;
                let cycle_us = pulse.cycle_duration_us().unwrap_or(0);
                let active_us = pulse.active_duration_us().unwrap_or(0);
                let duty_limit = ((cycle_us as f64 * MAX_DUTY_CYCLE_FRACTION) as u64)
                    .min(MAX_DUTY_CYCLE_DURATION_US);
                if active_us > duty_limit {
                    return Err(ProtocolError::DutyCycleExceeded {
                        active_us,
                        cycle_us,
                    });
                }
                let divisor = stimulation_type.charge_divisor();
                for charge in pulse_charges(pulse) {
                    let wire = charge / divisor;
                    if wire < i16::MIN as i32 || wire > i16::MAX as i32 {
                        return Err(ProtocolError::ChargeOutOfRange(charge));
                    }
                }
                Ok(())
            }
        }
    }
}

fn check_duration(duration_us: u64) -> Result<(), ProtocolError> {
    if duration_us < MIN_SUBPROTOCOL_DURATION_US {
        return Err(ProtocolError::SubprotocolTooShort(duration_us));
    }
    if duration_us > MAX_SUBPROTOCOL_DURATION_US {
        return Err(ProtocolError::SubprotocolTooLong(duration_us));
    }
    Ok(())
}

fn pulse_charges(node: &SubprotocolNode) -> Vec<i32> {
    match *node {
        SubprotocolNode::Monophasic { phase1_charge, .. } => vec![phase1_charge],
        SubprotocolNode::Biphasic {
            phase1_charge,
            phase2_charge,
            ..
        } => vec![phase1_charge, phase2_charge],
        _ => Vec::new(),
    }
}

/// A complete stimulation protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimProtocol {
    pub stimulation_type: StimulationType,
    pub run_until_stopped: bool,
    /// Always a `SubprotocolNode::Loop`.
    pub root: SubprotocolNode,
}

impl StimProtocol {
    /// Wrap `subprotocols` in a single-iteration root loop.
    pub fn new(
        stimulation_type: StimulationType,
        run_until_stopped: bool,
        subprotocols: Vec<SubprotocolNode>,
    ) -> Self {
        Self {
            stimulation_type,
            run_until_stopped,
            root: SubprotocolNode::Loop {
                num_iterations: 1,
                children: subprotocols,
            },
        }
    }

    /// The root loop's direct children and iteration count.
    pub fn root_loop(&self) -> Result<(&[SubprotocolNode], u32), ProtocolError> {
        match &self.root {
            SubprotocolNode::Loop {
                num_iterations,
                children,
            } => Ok((children, *num_iterations)),
            _ => Err(ProtocolError::RootNotLoop),
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.root.leaf_count()
    }

    /// Check every node, then the subprotocol limit against the chunked
    /// tree, which is what the device stores.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.root_loop()?;
        self.root.validate(self.stimulation_type)?;
        if self.leaf_count() > MAX_SUBPROTOCOLS_PER_PROTOCOL {
            return Err(ProtocolError::TooManySubprotocols(self.leaf_count()));
        }
        let chunked = crate::protocol::stim::chunk_protocol(self)?;
        let leaves = ProtocolWalker::leaf_table(&chunked.protocol)?;
        if leaves.len() > MAX_SUBPROTOCOLS_PER_PROTOCOL {
            return Err(ProtocolError::TooManySubprotocols(leaves.len()));
        }
        Ok(())
    }
}

/// Protocols available to the plate and which well runs which.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimInfo {
    pub protocols: BTreeMap<String, StimProtocol>,
    /// Well index to protocol id. Wells without an entry are unassigned.
    pub protocol_assignments: BTreeMap<usize, String>,
}

impl StimInfo {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        for (well, protocol_id) in &self.protocol_assignments {
            if *well >= NUM_WELLS {
                return Err(ProtocolError::InvalidWell(*well));
            }
            if !self.protocols.contains_key(protocol_id) {
                return Err(ProtocolError::UnknownProtocolId(protocol_id.clone()));
            }
        }
        self.protocols.values().try_for_each(StimProtocol::validate)
    }

    /// Wells assigned to `protocol_id`, ascending.
    pub fn wells_for(&self, protocol_id: &str) -> Vec<usize> {
        self.protocol_assignments
            .iter()
            .filter(|(_, id)| id.as_str() == protocol_id)
            .map(|(well, _)| *well)
            .collect()
    }

    pub fn assigned_wells(&self) -> Vec<usize> {
        self.protocol_assignments.keys().copied().collect()
    }

    pub fn protocol_for_well(&self, well: usize) -> Option<(&str, &StimProtocol)> {
        let id = self.protocol_assignments.get(&well)?;
        self.protocols.get(id).map(|p| (id.as_str(), p))
    }
}
