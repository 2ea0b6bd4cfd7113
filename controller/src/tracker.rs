//! In-flight command bookkeeping.
//!
//! The wire protocol has no correlation id: the device answers each command
//! with a packet of the same type, in send order. Commands are therefore
//! queued FIFO per packet type, and each carries its own deadline. The first
//! command to pass its deadline is latched as expired and stays latched until
//! [`CommandTracker::reset`].

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use stimlink_shared::protocol::PacketType;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("no {0} command in flight")]
    NotFound(PacketType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightCommand<T> {
    pub packet_type: PacketType,
    pub info: T,
    pub created_at: Instant,
    pub deadline: Instant,
    seq: u64,
}

impl<T> InFlightCommand<T> {
    pub fn timeout(&self) -> Duration {
        self.deadline - self.created_at
    }
}

#[derive(Debug)]
pub struct CommandTracker<T> {
    queues: HashMap<PacketType, VecDeque<InFlightCommand<T>>>,
    timeout: Duration,
    next_seq: u64,
    expired: Option<InFlightCommand<T>>,
}

impl<T: Clone> CommandTracker<T> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            queues: HashMap::new(),
            timeout,
            next_seq: 0,
            expired: None,
        }
    }

    /// Track a command with the default timeout.
    pub fn add(&mut self, packet_type: PacketType, info: T) {
        self.add_with_timeout(packet_type, info, self.timeout);
    }

    pub fn add_with_timeout(&mut self, packet_type: PacketType, info: T, timeout: Duration) {
        let created_at = Instant::now();
        let command = InFlightCommand {
            packet_type,
            info,
            created_at,
            deadline: created_at + timeout,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.queues.entry(packet_type).or_default().push_back(command);
    }

    /// Remove the oldest command of `packet_type`.
    pub fn pop(&mut self, packet_type: PacketType) -> Result<InFlightCommand<T>, TrackerError> {
        self.queues
            .get_mut(&packet_type)
            .and_then(VecDeque::pop_front)
            .ok_or(TrackerError::NotFound(packet_type))
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest deadline among pending commands, or the latch time once a
    /// command has expired.
    pub fn next_deadline(&self) -> Option<Instant> {
        if let Some(expired) = &self.expired {
            return Some(expired.deadline);
        }
        self.queues
            .values()
            .flatten()
            .map(|command| command.deadline)
            .min()
    }

    /// Latch and return the first command whose deadline is at or before `now`.
    ///
    /// Ties go to the command added first.
    pub fn poll_expired(&mut self, now: Instant) -> Option<&InFlightCommand<T>> {
        if self.expired.is_none() {
            let earliest = self
                .queues
                .iter()
                .flat_map(|(packet_type, queue)| {
                    queue
                        .iter()
                        .enumerate()
                        .map(move |(pos, command)| (command.deadline, command.seq, *packet_type, pos))
                })
                .filter(|(deadline, ..)| *deadline <= now)
                .min();
            if let Some((_, _, packet_type, pos)) = earliest {
                self.expired = self
                    .queues
                    .get_mut(&packet_type)
                    .and_then(|queue| queue.remove(pos));
            }
        }
        self.expired.as_ref()
    }

    /// Wait until some command expires and return it.
    ///
    /// Never resolves while nothing is in flight.
    pub async fn expired(&mut self) -> InFlightCommand<T> {
        loop {
            if let Some(command) = self.poll_expired(Instant::now()) {
                return command.clone();
            }
            match self.next_deadline() {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        }
    }

    /// Drop every pending command of `packet_type`, returning how many there were.
    pub fn discard(&mut self, packet_type: PacketType) -> usize {
        self.queues
            .remove(&packet_type)
            .map_or(0, |queue| queue.len())
    }

    /// Drop every pending command and clear the expiry latch.
    pub fn reset(&mut self) {
        self.queues.clear();
        self.expired = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CommandTracker<&'static str> {
        CommandTracker::new(Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_per_type() {
        let mut tracker = tracker();
        tracker.add(PacketType::StartStim, "a");
        tracker.add(PacketType::GetMetadata, "other");
        tracker.add(PacketType::StartStim, "b");

        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.pop(PacketType::StartStim).unwrap().info, "a");
        assert_eq!(tracker.pop(PacketType::StartStim).unwrap().info, "b");
        assert_eq!(
            tracker.pop(PacketType::StartStim),
            Err(TrackerError::NotFound(PacketType::StartStim))
        );
        assert_eq!(tracker.pop(PacketType::GetMetadata).unwrap().info, "other");
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_expires() {
        let mut tracker = tracker();
        tracker.add_with_timeout(PacketType::Reboot, "reboot", Duration::ZERO);
        let expired = tracker.expired().await;
        assert_eq!(expired.info, "reboot");
        assert_eq!(expired.packet_type, PacketType::Reboot);
    }

    #[tokio::test(start_paused = true)]
    async fn test_popped_command_never_expires() {
        let mut tracker = tracker();
        tracker.add(PacketType::GetMetadata, "metadata");
        tracker.pop(PacketType::GetMetadata).unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(60), tracker.expired()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_earliest_deadline_wins_and_latches() {
        let mut tracker = tracker();
        tracker.add_with_timeout(PacketType::StartStim, "slow", Duration::from_secs(5));
        tracker.add_with_timeout(PacketType::StopStim, "fast", Duration::from_secs(1));

        let start = Instant::now();
        assert_eq!(tracker.expired().await.info, "fast");
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        // the latch holds even after later deadlines pass
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(tracker.poll_expired(Instant::now()).unwrap().info, "fast");

        tracker.reset();
        assert!(tracker.poll_expired(Instant::now()).is_none());
        assert!(tracker.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discarded_commands_never_expire() {
        let mut tracker = tracker();
        tracker.add(PacketType::Handshake, "hs1");
        tracker.add(PacketType::Reboot, "reboot");
        tracker.add(PacketType::Handshake, "hs2");

        assert_eq!(tracker.discard(PacketType::Handshake), 2);
        assert_eq!(tracker.discard(PacketType::Handshake), 0);
        assert_eq!(tracker.pop(PacketType::Reboot).unwrap().info, "reboot");
        assert!(tracker.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_deadline_tracks_pending() {
        let mut tracker = tracker();
        assert!(tracker.next_deadline().is_none());
        tracker.add(PacketType::Handshake, "hs");
        let deadline = tracker.next_deadline().unwrap();
        assert_eq!(deadline - Instant::now(), Duration::from_secs(10));
        assert!(tracker.poll_expired(Instant::now()).is_none());
    }
}
