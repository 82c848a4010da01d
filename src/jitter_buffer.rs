use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use bytes::Bytes;
use log::{debug, info, warn};
use thiserror::Error;

use crate::packet::{AudioPacket, seq_distance, seq_is_before};

/// Sequence numbers are unwrapped into a 64-bit space starting here so that
/// startup reordering can rewind without underflow.
const EXTENDED_BASE: u64 = 1 << 32;

/// Adaptive jitter buffer configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterBufferConfig {
    /// Timestamp units per second (samples per channel)
    pub clock_rate: u32,
    /// Delay held before any jitter has been measured
    pub base_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied to the jitter estimate when sizing the delay
    pub jitter_multiplier: f64,
    /// RFC 3550 uses 16
    pub smoothing_divisor: f64,
    /// Fraction of the distance to the desired delay covered per packet when jitter rises
    pub rise_factor: f64,
    /// Fraction of the distance to the desired delay covered per packet when jitter falls
    pub decay_factor: f64,
    /// How far behind the playout point a packet may be and still count as merely late
    pub late_window: u32,
    /// Maximum number of queued packets
    pub capacity: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            clock_rate: 48_000,
            base_delay: Duration::from_millis(40),
            min_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(400),
            jitter_multiplier: 4.0,
            smoothing_divisor: 16.0,
            rise_factor: 0.5,
            decay_factor: 0.02,
            late_window: 64,
            capacity: 256,
        }
    }
}

impl JitterBufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.clock_rate == 0 {
            bail!("clock rate must be positive");
        }
        if self.min_delay > self.max_delay {
            bail!("min delay {:?} exceeds max delay {:?}", self.min_delay, self.max_delay);
        }
        if !(self.jitter_multiplier >= 0.0 && self.jitter_multiplier.is_finite()) {
            bail!("jitter multiplier must be a non-negative number");
        }
        if !(self.smoothing_divisor >= 1.0 && self.smoothing_divisor.is_finite()) {
            bail!("smoothing divisor must be at least 1");
        }
        for (name, factor) in [("rise", self.rise_factor), ("decay", self.decay_factor)] {
            if !(factor > 0.0 && factor <= 1.0) {
                bail!("{} factor must be in (0, 1], got {}", name, factor);
            }
        }
        if self.capacity == 0 {
            bail!("capacity must be positive");
        }
        Ok(())
    }
}

/// A packet held by the buffer until its playout time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterBufferEntry {
    pub sequence_number: u32,
    pub timestamp: u32,
    pub arrival_time: Instant,
    pub payload: Bytes,
}

/// Result of a paced dequeue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playout {
    Frame(JitterBufferEntry),
    /// `count` sequence numbers starting at `sequence_number` were skipped.
    /// The caller conceals one frame for the whole run.
    Gap { sequence_number: u32, count: u32 },
}

impl Playout {
    pub fn sequence_number(&self) -> u32 {
        match self {
            Playout::Frame(entry) => entry.sequence_number,
            Playout::Gap { sequence_number, .. } => *sequence_number,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, Playout::Gap { .. })
    }
}

/// Why a packet was not accepted
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("duplicate packet")]
    Duplicate,
    #[error("late packet, {behind} behind playout point")]
    Late { behind: u64 },
    #[error("stale packet, {behind} behind playout point")]
    TooOld { behind: u64 },
    #[error("buffer full")]
    Overflow,
}

/// Adaptive reordering and delay buffer for one incoming audio stream
pub struct JitterBuffer {
    config: JitterBufferConfig,
    entries: BTreeMap<u64, JitterBufferEntry>,
    next_expected: Option<u64>,
    playout_started: bool,
    last_played_timestamp: Option<u32>,
    last_transit: Option<(Instant, u32)>,

    // Estimator state, seconds
    jitter: f64,
    target_delay: Duration,

    // Statistics
    packets_received: u64,
    packets_played: u64,
    packets_lost: u64,
    late_packets: u64,
    duplicate_packets: u64,
    overflow_drops: u64,
    underruns: u64,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Result<Self> {
        config.validate()?;
        let target_delay = config.base_delay.clamp(config.min_delay, config.max_delay);
        info!("Creating jitter buffer: target {:?}, bounds {:?}..{:?}",
              target_delay, config.min_delay, config.max_delay);

        Ok(Self {
            config,
            entries: BTreeMap::new(),
            next_expected: None,
            playout_started: false,
            last_played_timestamp: None,
            last_transit: None,
            jitter: 0.0,
            target_delay,
            packets_received: 0,
            packets_played: 0,
            packets_lost: 0,
            late_packets: 0,
            duplicate_packets: 0,
            overflow_drops: 0,
            underruns: 0,
        })
    }

    /// Map a wire sequence number into the unwrapped space around the playout point
    fn extend(reference: u64, sequence_number: u32) -> u64 {
        let offset = seq_distance(sequence_number, reference as u32) as i64;
        (reference as i64 + offset) as u64
    }

    /// Accept a packet that arrived at `arrival_time`
    pub fn enqueue(&mut self, packet: AudioPacket, arrival_time: Instant) -> Result<(), Rejection> {
        let seq = packet.sequence_number;
        let next = *self.next_expected
            .get_or_insert(EXTENDED_BASE + seq as u64);
        let extended = Self::extend(next, seq);

        let mut rewind = false;
        if extended < next {
            let behind = next - extended;
            if !self.playout_started && behind <= self.config.late_window as u64 {
                rewind = true;
            } else if behind <= self.config.late_window as u64 {
                self.late_packets += 1;
                debug!("Dropping late packet: seq={}, behind={}", seq, behind);
                return Err(Rejection::Late { behind });
            } else {
                self.late_packets += 1;
                debug!("Dropping stale packet: seq={}, behind={}", seq, behind);
                return Err(Rejection::TooOld { behind });
            }
        }

        if self.entries.contains_key(&extended) {
            self.duplicate_packets += 1;
            debug!("Dropping duplicate packet: seq={}", seq);
            return Err(Rejection::Duplicate);
        }

        if self.entries.len() >= self.config.capacity {
            self.overflow_drops += 1;
            warn!("Jitter buffer full ({} packets), dropping seq={}", self.entries.len(), seq);
            return Err(Rejection::Overflow);
        }

        self.update_jitter(packet.timestamp, arrival_time);
        self.adapt_target_delay();

        self.entries.insert(extended, JitterBufferEntry {
            sequence_number: seq,
            timestamp: packet.timestamp,
            arrival_time,
            payload: packet.payload,
        });
        self.packets_received += 1;

        if rewind {
            debug!("Rewinding playout start to seq={}", seq);
            self.next_expected = Some(extended);
        }

        Ok(())
    }

    /// Interarrival jitter, RFC 3550 section 6.4.1
    fn update_jitter(&mut self, timestamp: u32, arrival_time: Instant) {
        if let Some((prev_arrival, prev_timestamp)) = self.last_transit {
            let arrival_delta = if arrival_time >= prev_arrival {
                (arrival_time - prev_arrival).as_secs_f64()
            } else {
                -(prev_arrival - arrival_time).as_secs_f64()
            };
            let media_delta = seq_distance(timestamp, prev_timestamp) as f64
                / self.config.clock_rate as f64;
            let d = arrival_delta - media_delta;
            self.jitter += (d.abs() - self.jitter) / self.config.smoothing_divisor;
        }
        self.last_transit = Some((arrival_time, timestamp));
    }

    fn adapt_target_delay(&mut self) {
        let min = self.config.min_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();
        let desired = (self.config.base_delay.as_secs_f64()
            + self.config.jitter_multiplier * self.jitter)
            .clamp(min, max);

        let current = self.target_delay.as_secs_f64();
        if (desired - current).abs() < 1e-9 {
            return;
        }
        let factor = if desired > current {
            self.config.rise_factor
        } else {
            self.config.decay_factor
        };
        let adapted = (current + (desired - current) * factor).clamp(min, max);
        self.target_delay = Duration::from_secs_f64(adapted);
    }

    /// Next playout decision at time `now`, or `None` when nothing is due yet
    pub fn dequeue(&mut self, now: Instant) -> Option<Playout> {
        let next = self.next_expected?;

        if let Some(gap) = self.fast_forward(next, now) {
            return Some(gap);
        }

        if let Some(entry) = self.entries.get(&next) {
            if now.saturating_duration_since(entry.arrival_time) < self.target_delay {
                return None;
            }
            let entry = self.entries.remove(&next)?;
            self.next_expected = Some(next + 1);
            self.playout_started = true;

            if let Some(last) = self.last_played_timestamp {
                if seq_is_before(entry.timestamp, last) {
                    self.packets_lost += 1;
                    warn!("Discarding seq={} with timestamp {} behind played {}",
                          entry.sequence_number, entry.timestamp, last);
                    return Some(Playout::Gap { sequence_number: entry.sequence_number, count: 1 });
                }
            }

            self.last_played_timestamp = Some(entry.timestamp);
            self.packets_played += 1;
            return Some(Playout::Frame(entry));
        }

        let Some((&earliest_key, earliest)) = self.entries.iter().next() else {
            if self.playout_started {
                self.underruns += 1;
            }
            return None;
        };

        // Everything missing was sent before `earliest`; once that one has
        // waited the full target delay the whole run is given up on.
        if now.saturating_duration_since(earliest.arrival_time) < self.target_delay {
            return None;
        }

        let count = (earliest_key - next) as u32;
        self.next_expected = Some(earliest_key);
        self.playout_started = true;
        self.packets_lost += count as u64;
        debug!("Skipping {} lost packet(s) from seq={}", count, next as u32);
        Some(Playout::Gap { sequence_number: next as u32, count })
    }

    /// Drop queued audio held beyond `max_delay` when fresher audio is waiting behind it
    fn fast_forward(&mut self, next: u64, now: Instant) -> Option<Playout> {
        let max_delay = self.config.max_delay;
        let held_too_long = |entry: &JitterBufferEntry| now.saturating_duration_since(entry.arrival_time) > max_delay;

        let (_, oldest) = self.entries.iter().next()?;
        if !held_too_long(oldest) {
            return None;
        }
        let resume = self.entries.iter()
            .find(|(_, entry)| !held_too_long(entry))
            .map(|(&key, _)| key)?;

        let stale = self.entries.range(..resume).count();
        self.entries = self.entries.split_off(&resume);

        let count = (resume - next) as u32;
        self.next_expected = Some(resume);
        self.playout_started = true;
        self.packets_lost += count as u64;
        warn!("Playout {:?} behind, dropped {} stale packet(s) and skipped to seq={}",
              max_delay, stale, resume as u32);
        Some(Playout::Gap { sequence_number: next as u32, count })
    }

    pub fn target_delay(&self) -> Duration {
        self.target_delay
    }

    pub fn jitter_estimate(&self) -> Duration {
        Duration::from_secs_f64(self.jitter)
    }

    pub fn next_expected_sequence(&self) -> Option<u32> {
        self.next_expected.map(|n| n as u32)
    }

    pub fn last_played_timestamp(&self) -> Option<u32> {
        self.last_played_timestamp
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn config(&self) -> &JitterBufferConfig {
        &self.config
    }

    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            buffered: self.entries.len(),
            target_delay: self.target_delay,
            jitter: self.jitter_estimate(),
            packets_received: self.packets_received,
            packets_played: self.packets_played,
            packets_lost: self.packets_lost,
            late_packets: self.late_packets,
            duplicate_packets: self.duplicate_packets,
            overflow_drops: self.overflow_drops,
            underruns: self.underruns,
        }
    }

    /// Discard all buffered state
    pub fn reset(&mut self) {
        info!("Resetting jitter buffer ({} packets discarded)", self.entries.len());
        self.entries.clear();
        self.next_expected = None;
        self.playout_started = false;
        self.last_played_timestamp = None;
        self.last_transit = None;
        self.jitter = 0.0;
        self.target_delay = self.config.base_delay.clamp(self.config.min_delay, self.config.max_delay);
        self.packets_received = 0;
        self.packets_played = 0;
        self.packets_lost = 0;
        self.late_packets = 0;
        self.duplicate_packets = 0;
        self.overflow_drops = 0;
        self.underruns = 0;
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, PartialEq)]
pub struct JitterBufferStats {
    pub buffered: usize,
    pub target_delay: Duration,
    pub jitter: Duration,
    pub packets_received: u64,
    pub packets_played: u64,
    pub packets_lost: u64,
    pub late_packets: u64,
    pub duplicate_packets: u64,
    pub overflow_drops: u64,
    pub underruns: u64,
}

impl JitterBufferStats {
    /// Fraction of playout slots that had to be concealed
    pub fn loss_rate(&self) -> f64 {
        let total = self.packets_lost + self.packets_played;
        if total > 0 {
            self.packets_lost as f64 / total as f64
        } else {
            0.0
        }
    }
}
