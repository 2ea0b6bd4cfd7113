//! Stimulator circuit classification from impedance-check readings.

use std::collections::BTreeMap;
use stimlink_shared::protocol::PacketError;
use stimlink_shared::types::wells::{stim_module_id_to_well_idx, NUM_WELLS};
use stimlink_shared::StimulatorCircuitStatus;

/// Sense resistor in series with each electrode.
pub const SENSE_RESISTOR_OHMS: f64 = 1_000.0;
pub const SHORT_THRESHOLD_OHMS: f64 = 10.0;
pub const OPEN_THRESHOLD_OHMS: f64 = 20_000.0;

/// Bytes per module in an impedance-check response: adc8 and adc9, u16 each.
const READING_LENGTH: usize = 4;

/// Electrode impedance, or `None` when the reading cannot be converted.
pub fn impedance_ohms(adc8: u16, adc9: u16) -> Option<f64> {
    if adc8 == 0 {
        return None;
    }
    Some((adc9 as f64 / adc8 as f64 - 1.0) * SENSE_RESISTOR_OHMS)
}

pub fn classify(adc8: u16, adc9: u16) -> StimulatorCircuitStatus {
    match impedance_ohms(adc8, adc9) {
        None => StimulatorCircuitStatus::Error,
        Some(ohms) if ohms < 0.0 => StimulatorCircuitStatus::Error,
        Some(ohms) if ohms < SHORT_THRESHOLD_OHMS => StimulatorCircuitStatus::Short,
        Some(ohms) if ohms > OPEN_THRESHOLD_OHMS => StimulatorCircuitStatus::Open,
        Some(_) => StimulatorCircuitStatus::Media,
    }
}

/// Classify every requested well from an impedance-check response.
///
/// The response holds one reading per stimulation module id, in id order.
/// An empty `wells` slice means every well.
pub fn parse_impedance_response(
    payload: &[u8],
    wells: &[usize],
) -> Result<BTreeMap<usize, StimulatorCircuitStatus>, PacketError> {
    let needed = NUM_WELLS * READING_LENGTH;
    if payload.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            available: payload.len(),
        });
    }

    let mut results = BTreeMap::new();
    for (pos, reading) in payload[..needed].chunks_exact(READING_LENGTH).enumerate() {
        let well = stim_module_id_to_well_idx(pos as u8 + 1)?;
        if !wells.is_empty() && !wells.contains(&well) {
            continue;
        }
        let adc8 = u16::from_le_bytes([reading[0], reading[1]]);
        let adc9 = u16::from_le_bytes([reading[2], reading[3]]);
        results.insert(well, classify(adc8, adc9));
    }
    Ok(results)
}
