//! Well numbering.
//!
//! Wells are numbered 0..24 column-major across a 4 row by 6 column plate
//! (A1 = 0, B1 = 1, ..., D6 = 23). The device addresses the same wells by
//! module id, using two independent schemes:
//!
//! - status codes and magnetometer data use 0-based ids, row-major;
//! - stimulation uses 1-based ids with each column's rows reversed.

use crate::protocol::PacketError;

pub const NUM_WELLS: usize = 24;
pub const NUM_ROWS: usize = 4;
pub const NUM_COLUMNS: usize = 6;

/// Well index for stimulation module ids 1..=24 (index 0 holds module 1).
const STIM_MODULE_ID_TO_WELL_IDX: [u8; NUM_WELLS] = [
    3, 2, 1, 0, 7, 6, 5, 4, 11, 10, 9, 8, 15, 14, 13, 12, 19, 18, 17, 16, 23, 22, 21, 20,
];

/// Well index for a 0-based status/magnetometer module id.
pub fn status_module_id_to_well_idx(module_id: u8) -> Result<usize, PacketError> {
    let module_id = module_id as usize;
    if module_id >= NUM_WELLS {
        return Err(PacketError::UnknownModuleId(module_id as u8));
    }
    Ok((module_id % NUM_COLUMNS) * NUM_ROWS + module_id / NUM_COLUMNS)
}

/// 0-based status/magnetometer module id for a well index.
pub fn well_idx_to_status_module_id(well_idx: usize) -> Option<u8> {
    if well_idx >= NUM_WELLS {
        return None;
    }
    let row = well_idx % NUM_ROWS;
    let column = well_idx / NUM_ROWS;
    Some((row * NUM_COLUMNS + column) as u8)
}

/// Well index for a 1-based stimulation module id.
pub fn stim_module_id_to_well_idx(module_id: u8) -> Result<usize, PacketError> {
    match module_id {
        1..=24 => Ok(STIM_MODULE_ID_TO_WELL_IDX[module_id as usize - 1] as usize),
        other => Err(PacketError::UnknownModuleId(other)),
    }
}

/// 1-based stimulation module id for a well index.
pub fn well_idx_to_stim_module_id(well_idx: usize) -> Option<u8> {
    STIM_MODULE_ID_TO_WELL_IDX
        .iter()
        .position(|&w| w as usize == well_idx)
        .map(|pos| pos as u8 + 1)
}

/// Human readable well name, e.g. `A1` for well 0 and `D6` for well 23.
pub fn well_name(well_idx: usize) -> String {
    let row = (b'A' + (well_idx % NUM_ROWS) as u8) as char;
    format!("{}{}", row, well_idx / NUM_ROWS + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_scheme_is_a_permutation() {
        let mut seen = [false; NUM_WELLS];
        for module_id in 0..NUM_WELLS as u8 {
            let well = status_module_id_to_well_idx(module_id).unwrap();
            assert!(!seen[well]);
            seen[well] = true;
            assert_eq!(well_idx_to_status_module_id(well), Some(module_id));
        }
    }

    #[test]
    fn test_stim_scheme_is_a_permutation() {
        let mut seen = [false; NUM_WELLS];
        for module_id in 1..=NUM_WELLS as u8 {
            let well = stim_module_id_to_well_idx(module_id).unwrap();
            assert!(!seen[well]);
            seen[well] = true;
            assert_eq!(well_idx_to_stim_module_id(well), Some(module_id));
        }
    }

    #[test]
    fn test_schemes_differ() {
        // A1 is module 0 for status codes but module 4 for stimulation
        assert_eq!(well_idx_to_status_module_id(0), Some(0));
        assert_eq!(well_idx_to_stim_module_id(0), Some(4));
        // row-major status ids: module 1 is A2
        assert_eq!(status_module_id_to_well_idx(1).unwrap(), 4);
        assert_eq!(status_module_id_to_well_idx(6).unwrap(), 1);
    }

    #[test]
    fn test_out_of_range_module_ids() {
        assert!(stim_module_id_to_well_idx(0).is_err());
        assert!(stim_module_id_to_well_idx(25).is_err());
        assert!(status_module_id_to_well_idx(24).is_err());
        assert_eq!(well_idx_to_stim_module_id(24), None);
    }

    #[test]
    fn test_well_name() {
        assert_eq!(well_name(0), "A1");
        assert_eq!(well_name(5), "B2");
        assert_eq!(well_name(23), "D6");
    }
}
