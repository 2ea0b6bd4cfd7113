//! Stimulator circuit check command implementation

use super::{connect_policy, start_engine};
use crate::output;
use anyhow::{anyhow, bail, Result};
use clap::Args;
use std::collections::BTreeMap;
use stimlink_controller::ControllerConfig;
use stimlink_shared::types::wells::{NUM_COLUMNS, NUM_ROWS, NUM_WELLS};
use stimlink_shared::{Command, Event, StimulatorCircuitStatus};

#[derive(Args, Debug)]
pub struct CheckStimArgs {
    /// Wells to check by name or index (e.g. A1,B3 or 0,5); all wells when omitted
    #[arg(short, long, value_delimiter = ',')]
    pub wells: Vec<String>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    /// Connection attempts before giving up
    #[arg(long, default_value = "3")]
    pub connect_attempts: u32,
}

pub async fn run(args: CheckStimArgs, config: ControllerConfig) -> Result<()> {
    let well_indices = args
        .wells
        .iter()
        .map(|well| parse_well(well))
        .collect::<Result<Vec<_>>>()?;

    let mut engine = start_engine(&config, connect_policy(args.connect_attempts)).await?;
    engine
        .send(Command::StartStimChecks { well_indices })
        .await?;

    let results = loop {
        match engine.next_event().await? {
            Event::StartStimChecks { results } => break results,
            Event::CommandRejected { reason, .. } => bail!("Stim check rejected: {}", reason),
            _ => {}
        }
    };
    engine.shutdown().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results(&results);
    }
    Ok(())
}

fn print_results(results: &BTreeMap<usize, StimulatorCircuitStatus>) {
    for (&well, &status) in results {
        println!("{}", output::circuit_line(well, status));
    }
    let faulty = results
        .values()
        .filter(|status| **status != StimulatorCircuitStatus::Media)
        .count();
    if faulty == 0 {
        output::success(&format!("All {} wells connected to media", results.len()));
    } else {
        output::warning(&format!("{} of {} wells need attention", faulty, results.len()));
    }
}

/// Accepts a well name such as `B3` or a 0-based well index.
fn parse_well(s: &str) -> Result<usize> {
    let s = s.trim();
    if let Ok(idx) = s.parse::<usize>() {
        if idx < NUM_WELLS {
            return Ok(idx);
        }
        bail!("Well index {} out of range (0-{})", idx, NUM_WELLS - 1);
    }

    let mut chars = s.chars();
    let row = chars
        .next()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| ('A'..='D').contains(c))
        .ok_or_else(|| anyhow!("Invalid well {:?}", s))?;
    let column: usize = chars
        .as_str()
        .parse()
        .map_err(|_| anyhow!("Invalid well {:?}", s))?;
    if !(1..=NUM_COLUMNS).contains(&column) {
        bail!("Invalid well {:?}", s);
    }
    let row = row as usize - 'A' as usize;
    Ok((column - 1) * NUM_ROWS + row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stimlink_shared::types::wells::well_name;

    #[test]
    fn test_parse_well_names_and_indices() {
        assert_eq!(parse_well("A1").unwrap(), 0);
        assert_eq!(parse_well("b1").unwrap(), 1);
        assert_eq!(parse_well("D6").unwrap(), 23);
        assert_eq!(parse_well(" 7 ").unwrap(), 7);
        for well in 0..NUM_WELLS {
            assert_eq!(parse_well(&well_name(well)).unwrap(), well);
        }
    }

    #[test]
    fn test_parse_well_rejects_garbage() {
        for bad in ["", "E1", "A0", "A7", "24", "A", "1A"] {
            assert!(parse_well(bad).is_err(), "{} should be rejected", bad);
        }
    }
}
