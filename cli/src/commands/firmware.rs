//! Firmware update command implementation

use super::{connect_policy, start_engine, EngineHandle};
use crate::output;
use anyhow::{bail, Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use stimlink_controller::ControllerConfig;
use stimlink_shared::utils::parse_duration;
use stimlink_shared::{Command, Event, FirmwareKind, Semver};

#[derive(Args, Debug)]
pub struct UpdateFirmwareArgs {
    /// Firmware image to install
    pub file: PathBuf,

    /// Which firmware to replace: main or channel
    #[arg(short, long)]
    pub kind: FirmwareKind,

    /// Version of the image, e.g. 1.2.3
    #[arg(long = "version", value_name = "VERSION")]
    pub firmware_version: Semver,

    /// Give up if the update has not finished after this long
    #[arg(short, long, default_value = "10m")]
    pub timeout: String,

    /// Connection attempts before giving up
    #[arg(long, default_value = "3")]
    pub connect_attempts: u32,
}

pub async fn run(args: UpdateFirmwareArgs, config: ControllerConfig) -> Result<()> {
    let timeout = parse_duration(&args.timeout).context("Failed to parse timeout")?;
    let file_contents = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read firmware image {}", args.file.display()))?;
    if file_contents.is_empty() {
        bail!("Firmware image {} is empty", args.file.display());
    }
    let total = file_contents.len() as u64;

    let mut engine = start_engine(&config, connect_policy(args.connect_attempts)).await?;
    output::info(&format!(
        "Updating {} firmware to {} ({} bytes)",
        args.kind, args.firmware_version, total
    ));
    engine
        .send(Command::StartFirmwareUpdate {
            kind: args.kind,
            version: args.firmware_version,
            file_contents,
        })
        .await?;

    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )?
        .progress_chars("=> "),
    );

    let outcome = tokio::time::timeout(timeout, follow_update(&mut engine, &bar)).await;
    match outcome {
        Ok(Ok((kind, version))) => {
            bar.finish_and_clear();
            engine.shutdown().await?;
            output::success(&format!("{} firmware updated to {}", kind, version));
            Ok(())
        }
        Ok(Err(e)) => {
            bar.abandon();
            Err(e)
        }
        Err(_) => {
            bar.abandon();
            engine.shutdown().await?;
            bail!("Firmware update did not finish within {}", args.timeout)
        }
    }
}

async fn follow_update(engine: &mut EngineHandle, bar: &ProgressBar) -> Result<(FirmwareKind, Semver)> {
    loop {
        match engine.next_event().await? {
            Event::GetMetadata { metadata } => {
                bar.println(format!(
                    "Instrument {} running main {} / channel {}",
                    metadata.serial_number,
                    metadata.main_firmware_version,
                    metadata.channel_firmware_version
                ));
            }
            Event::FirmwareUpdateProgress {
                bytes_sent,
                total_bytes,
                ..
            } => {
                bar.set_position(bytes_sent as u64);
                if bytes_sent == total_bytes {
                    bar.set_message("waiting for the instrument to apply the image");
                }
            }
            Event::FirmwareUpdateComplete { kind, version } => return Ok((kind, version)),
            Event::CommandRejected { reason, .. } => bail!("Firmware update rejected: {}", reason),
            _ => {}
        }
    }
}
