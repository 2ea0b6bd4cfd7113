//! Run command implementation

use super::{connect_policy, start_engine};
use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stimlink_controller::ControllerConfig;
use stimlink_shared::utils::parse_duration;
use stimlink_shared::{Command, Event, StimInfo};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Stimulation protocols to upload and start (JSON)
    #[arg(short, long)]
    pub protocols: Option<PathBuf>,

    /// Stop after this long (e.g. "30s", "5m")
    #[arg(short, long)]
    pub duration: Option<String>,

    /// Pretty-print events
    #[arg(long)]
    pub pretty: bool,

    /// Connection attempts before giving up
    #[arg(long, default_value = "3")]
    pub connect_attempts: u32,
}

pub async fn run(args: RunArgs, config: ControllerConfig) -> Result<()> {
    let duration = args
        .duration
        .as_deref()
        .map(parse_duration)
        .transpose()
        .context("Failed to parse duration")?;
    let stim_info = args
        .protocols
        .as_ref()
        .map(|path| load_stim_info(path))
        .transpose()?;

    let mut engine = start_engine(&config, connect_policy(args.connect_attempts)).await?;
    let mut start_when_set = false;
    if let Some(stim_info) = stim_info {
        engine.send(Command::SetStimProtocols { stim_info }).await?;
        start_when_set = true;
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let stop = sleep_for(duration);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                output::info("Interrupted, disconnecting");
                break;
            }
            _ = &mut stop => {
                info!("Run duration elapsed");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<Command>(&line) {
                    Ok(command) => {
                        debug!(command = command.name(), "Forwarding command");
                        engine.send(command).await?;
                    }
                    Err(e) => output::warning(&format!("Ignoring invalid command: {}", e)),
                },
                None => stdin_open = false,
            },
            event = engine.next_event() => {
                let event = event?;
                print_event(&event, args.pretty)?;
                match &event {
                    Event::SetStimProtocols if start_when_set => {
                        start_when_set = false;
                        engine.send(Command::StartStimulation).await?;
                    }
                    Event::CommandRejected { command, reason } => {
                        output::error(&format!("{} rejected: {}", command, reason));
                    }
                    _ => {}
                }
            }
        }
    }

    engine.shutdown().await?;
    output::success("Disconnected");
    Ok(())
}

fn load_stim_info(path: &Path) -> Result<StimInfo> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read protocols from {}", path.display()))?;
    let stim_info: StimInfo = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse protocols in {}", path.display()))?;
    stim_info
        .validate()
        .with_context(|| format!("Invalid protocols in {}", path.display()))?;
    Ok(stim_info)
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn print_event(event: &Event, pretty: bool) -> Result<()> {
    let line = if pretty {
        serde_json::to_string_pretty(event)?
    } else {
        serde_json::to_string(event)?
    };
    println!("{}", line);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_stim_info_rejects_unknown_protocol() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"protocols": {{}}, "protocol_assignments": {{"0": "missing"}}}}"#
        )
        .unwrap();
        let err = load_stim_info(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("missing"));
    }

    #[test]
    fn test_load_stim_info_accepts_empty() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"protocols": {{}}, "protocol_assignments": {{}}}}"#).unwrap();
        assert_eq!(load_stim_info(file.path()).unwrap(), StimInfo::default());
    }
}
