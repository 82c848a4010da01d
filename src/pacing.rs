//! Periodic trigger sources driving jitter buffer playout.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// A steady source of playout instants.
///
/// The instants it yields must come from the same monotonic clock used to
/// stamp packet arrivals.
#[async_trait]
pub trait Pacer: Send {
    /// Wait for the next tick. `None` means the source has stopped.
    async fn tick(&mut self) -> Option<Instant>;
}

/// Real-time pacer on top of `tokio::time::interval`.
///
/// Missed ticks are delivered in a burst so the schedule stays anchored to
/// the start instant instead of drifting after a stall.
pub struct IntervalPacer {
    interval: Interval,
}

impl IntervalPacer {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        Self { interval }
    }
}

#[async_trait]
impl Pacer for IntervalPacer {
    async fn tick(&mut self) -> Option<Instant> {
        Some(self.interval.tick().await.into_std())
    }
}

/// Pacer driven by explicit instants, for simulated time
pub struct ManualPacer {
    ticks: mpsc::UnboundedReceiver<Instant>,
}

#[derive(Clone)]
pub struct ManualPacerHandle {
    ticks: mpsc::UnboundedSender<Instant>,
}

impl ManualPacerHandle {
    /// Queue a tick; returns false once the pacer has been dropped
    pub fn tick_at(&self, now: Instant) -> bool {
        self.ticks.send(now).is_ok()
    }
}

pub fn manual_pacer() -> (ManualPacerHandle, ManualPacer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ManualPacerHandle { ticks: tx }, ManualPacer { ticks: rx })
}

#[async_trait]
impl Pacer for ManualPacer {
    async fn tick(&mut self) -> Option<Instant> {
        self.ticks.recv().await
    }
}
