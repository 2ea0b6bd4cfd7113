//! Output formatting utilities for CLI commands

use colored::{ColoredString, Colorize};
use stimlink_shared::types::wells::well_name;
use stimlink_shared::StimulatorCircuitStatus;

/// Print success message
pub fn success(msg: &str) {
    eprintln!("{} {}", "✓".green(), msg);
}

/// Print error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print info message
pub fn info(msg: &str) {
    eprintln!("{} {}", "ℹ".blue(), msg);
}

/// Print warning message
pub fn warning(msg: &str) {
    eprintln!("{} {}", "⚠".yellow(), msg);
}

pub fn circuit_status(status: StimulatorCircuitStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        StimulatorCircuitStatus::Media => label.green(),
        StimulatorCircuitStatus::Open => label.yellow(),
        StimulatorCircuitStatus::Short => label.red(),
        StimulatorCircuitStatus::Error => label.red().bold(),
        StimulatorCircuitStatus::Calculating => label.dimmed(),
    }
}

/// One line of a stim check report, e.g. `A1   media`.
pub fn circuit_line(well: usize, status: StimulatorCircuitStatus) -> String {
    format!("{:<4} {}", well_name(well), circuit_status(status))
}
