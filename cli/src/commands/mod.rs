//! Subcommands and the engine plumbing they share.

pub mod check_stim;
pub mod firmware;
pub mod run;

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use stimlink_controller::{
    connect, ControllerConfig, Engine, InstrumentError, ReconnectPolicy,
};
use stimlink_shared::{Command, Event};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running engine and the channels to talk to it.
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), InstrumentError>>,
}

pub fn connect_policy(attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: attempts,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(10),
    }
}

/// Connect to the instrument and spawn an engine on the connection.
pub async fn start_engine(config: &ControllerConfig, policy: ReconnectPolicy) -> Result<EngineHandle> {
    let connection = policy
        .retry("connect", |_| connect(config))
        .await
        .context("Failed to connect to instrument")?;

    let (events_tx, events) = mpsc::channel(config.mailbox_capacity);
    let (commands, commands_rx) = mpsc::channel(config.mailbox_capacity);
    let cancel = CancellationToken::new();
    let engine = Engine::new(connection, config.clone(), events_tx);
    let task = tokio::spawn(engine.run(commands_rx, cancel.clone()));

    Ok(EngineHandle {
        commands,
        events,
        cancel,
        task,
    })
}

impl EngineHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("Engine is no longer running"))
    }

    /// Next event, or the engine's failure once it has stopped.
    pub async fn next_event(&mut self) -> Result<Event> {
        match self.events.recv().await {
            Some(event) => Ok(event),
            None => match (&mut self.task).await? {
                Ok(()) => Err(anyhow!("Engine stopped")),
                Err(e) => Err(e).context("Instrument connection failed"),
            },
        }
    }

    /// Stop the engine and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        // the engine may be blocked on a full event channel
        while self.events.recv().await.is_some() {}
        self.task.await?.context("Instrument connection failed")
    }
}
