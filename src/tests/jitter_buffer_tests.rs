#[cfg(test)]
mod jitter_buffer_tests {
    use crate::jitter_buffer::*;
    use crate::packet::AudioPacket;
    use std::time::{Duration, Instant};

    const FRAME_SAMPLES: u32 = 960;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Fixed 20 ms target so playout timing is exact
    fn fixed_config() -> JitterBufferConfig {
        JitterBufferConfig {
            base_delay: ms(20),
            min_delay: ms(20),
            max_delay: ms(400),
            jitter_multiplier: 0.0,
            ..JitterBufferConfig::default()
        }
    }

    fn packet(seq: u32) -> AudioPacket {
        AudioPacket::new(seq, seq.wrapping_mul(FRAME_SAMPLES), vec![seq as u8; 4])
    }

    /// Dequeue everything due at `now`
    fn drain(buffer: &mut JitterBuffer, now: Instant) -> Vec<Playout> {
        std::iter::from_fn(|| buffer.dequeue(now)).collect()
    }

    #[test]
    fn test_jitter_buffer_config_default() {
        let config = JitterBufferConfig::default();

        assert_eq!(config.clock_rate, 48_000);
        assert_eq!(config.smoothing_divisor, 16.0);
        assert!(config.min_delay <= config.base_delay);
        assert!(config.base_delay <= config.max_delay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = JitterBufferConfig {
            min_delay: ms(500),
            max_delay: ms(100),
            ..JitterBufferConfig::default()
        };
        assert!(JitterBuffer::new(config).is_err());

        let config = JitterBufferConfig { capacity: 0, ..JitterBufferConfig::default() };
        assert!(config.validate().is_err());

        let config = JitterBufferConfig { decay_factor: 0.0, ..JitterBufferConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_buffer_creation() {
        let buffer = JitterBuffer::new(JitterBufferConfig::default()).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(buffer.target_delay(), ms(40));
        assert_eq!(buffer.next_expected_sequence(), None);
        assert_eq!(buffer.last_played_timestamp(), None);
        assert_eq!(buffer.jitter_estimate(), Duration::ZERO);
    }

    #[test]
    fn test_reordered_startup_plays_in_sequence() {
        // Sequence 2 arrives at 10 ms, 1 at 12 ms, 3 at 30 ms; target 20 ms
        let mut buffer = JitterBuffer::new(fixed_config()).unwrap();
        let t0 = Instant::now();

        buffer.enqueue(packet(2), t0 + ms(10)).unwrap();
        buffer.enqueue(packet(1), t0 + ms(12)).unwrap();
        buffer.enqueue(packet(3), t0 + ms(30)).unwrap();
        assert_eq!(buffer.next_expected_sequence(), Some(1));

        assert_eq!(buffer.dequeue(t0 + ms(31)), None);

        let mut played = Vec::new();
        for at in [32, 40, 50, 60] {
            played.extend(drain(&mut buffer, t0 + ms(at)));
        }
        let order: Vec<u32> = played.iter().map(|p| p.sequence_number()).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(played.iter().all(|p| !p.is_gap()));
    }

    #[test]
    fn test_missing_packet_becomes_gap() {
        let mut buffer = JitterBuffer::new(fixed_config()).unwrap();
        let t0 = Instant::now();

        buffer.enqueue(packet(1), t0).unwrap();
        buffer.enqueue(packet(3), t0 + ms(40)).unwrap();

        assert_eq!(drain(&mut buffer, t0 + ms(20)).len(), 1);
        // Sequence 3 has not yet waited the target delay
        assert_eq!(buffer.dequeue(t0 + ms(45)), None);

        let played = drain(&mut buffer, t0 + ms(60));
        assert_eq!(played, vec![
            Playout::Gap { sequence_number: 2, count: 1 },
            Playout::Frame(JitterBufferEntry {
                sequence_number: 3,
                timestamp: 3 * FRAME_SAMPLES,
                arrival_time: t0 + ms(40),
                payload: vec![3u8; 4].into(),
            }),
        ]);
        assert_eq!(buffer.stats().packets_lost, 1);
        assert_eq!(buffer.stats().packets_played, 2);
    }

    #[test]
    fn test_latency_recovers_after_long_outage() {
        let config = fixed_config();
        let mut buffer = JitterBuffer::new(config).unwrap();
        let t0 = Instant::now();
        let mut gaps = Vec::new();
        let mut latency = None;

        // One packet and one playout per 20 ms tick; 100 packets vanish mid-stream
        for tick in 0..=300u32 {
            let now = t0 + ms(20 * tick as u64);
            if !(50..150).contains(&tick) {
                buffer.enqueue(packet(tick), now).unwrap();
            }
            match buffer.dequeue(now) {
                Some(Playout::Frame(entry)) => latency = Some(now - entry.arrival_time),
                Some(gap) => gaps.push(gap),
                None => {}
            }
        }

        assert_eq!(gaps, vec![Playout::Gap { sequence_number: 50, count: 100 }]);
        assert_eq!(buffer.stats().packets_lost, 100);
        let latency = latency.unwrap();
        assert!(latency <= config.max_delay, "playout lags {:?}", latency);
        assert!(buffer.len() <= 2);
    }

    #[test]
    fn test_stale_backlog_skipped_past_max_delay() {
        let mut buffer = JitterBuffer::new(fixed_config()).unwrap();
        let t0 = Instant::now();

        // The consumer stalls while 30 packets pile up
        for seq in 0..30u32 {
            buffer.enqueue(packet(seq), t0 + ms(20 * seq as u64)).unwrap();
        }

        let now = t0 + ms(600);
        assert_eq!(buffer.dequeue(now), Some(Playout::Gap { sequence_number: 0, count: 10 }));
        assert_eq!(buffer.len(), 20);
        assert_eq!(buffer.next_expected_sequence(), Some(10));
        assert!(matches!(buffer.dequeue(now), Some(Playout::Frame(entry)) if entry.sequence_number == 10));
        assert_eq!(buffer.stats().packets_lost, 10);
    }

    #[test]
    fn test_packet_behind_playout_point_rejected() {
        let mut buffer = JitterBuffer::new(fixed_config()).unwrap();
        let t0 = Instant::now();

        for seq in 10..13 {
            buffer.enqueue(packet(seq), t0).unwrap();
        }
        assert_eq!(drain(&mut buffer, t0 + ms(20)).len(), 3);
        assert_eq!(buffer.next_expected_sequence(), Some(13));

        assert_eq!(buffer.enqueue(packet(11), t0 + ms(21)), Err(Rejection::Late { behind: 2 }));
        let stale = 13u32.wrapping_sub(fixed_config().late_window + 1);
        assert!(matches!(
            buffer.enqueue(packet(stale), t0 + ms(21)),
            Err(Rejection::TooOld { .. })
        ));
        assert_eq!(buffer.stats().late_packets, 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_startup_rewind_limited_to_window() {
        let config = fixed_config();
        let mut buffer = JitterBuffer::new(config).unwrap();
        let t0 = Instant::now();

        buffer.enqueue(packet(1000), t0).unwrap();
        let far = 1000 - config.late_window - 10;
        assert!(matches!(buffer.enqueue(packet(far), t0), Err(Rejection::TooOld { .. })));
        assert_eq!(buffer.next_expected_sequence(), Some(1000));
    }

    #[test]
    fn test_duplicates_delivered_once() {
        let mut buffer = JitterBuffer::new(fixed_config()).unwrap();
        let t0 = Instant::now();

        buffer.enqueue(packet(5), t0).unwrap();
        assert_eq!(buffer.enqueue(packet(5), t0 + ms(1)), Err(Rejection::Duplicate));
        buffer.enqueue(packet(6), t0 + ms(2)).unwrap();
        assert_eq!(buffer.enqueue(packet(6), t0 + ms(3)), Err(Rejection::Duplicate));

        let played = drain(&mut buffer, t0 + ms(100));
        assert_eq!(played.iter().map(|p| p.sequence_number()).collect::<Vec<_>>(), vec![5, 6]);

        // A copy arriving after playout is behind the playout point
        assert!(buffer.enqueue(packet(5), t0 + ms(101)).is_err());
        assert_eq!(buffer.stats().duplicate_packets, 2);
    }

    #[test]
    fn test_overflow_rejects_newest() {
        let config = JitterBufferConfig { capacity: 4, ..fixed_config() };
        let mut buffer = JitterBuffer::new(config).unwrap();
        let t0 = Instant::now();

        for seq in 0..4 {
            buffer.enqueue(packet(seq), t0).unwrap();
        }
        assert_eq!(buffer.enqueue(packet(4), t0), Err(Rejection::Overflow));
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.stats().overflow_drops, 1);
    }

    #[test]
    fn test_timestamps_never_decrease_under_reordering() {
        let mut buffer = JitterBuffer::new(fixed_config()).unwrap();
        let t0 = Instant::now();

        // Deterministic shuffle within blocks of five
        let order = [3u32, 0, 4, 1, 2, 8, 5, 9, 7, 6, 13, 10, 12, 14, 11];
        let mut played = Vec::new();
        for (i, &seq) in order.iter().enumerate() {
            let now = t0 + ms(5 * i as u64);
            let _ = buffer.enqueue(packet(seq + 100), now);
            played.extend(drain(&mut buffer, now));
        }
        played.extend(drain(&mut buffer, t0 + ms(1000)));

        let timestamps: Vec<u32> = played.iter()
            .filter_map(|p| match p {
                Playout::Frame(entry) => Some(entry.timestamp),
                Playout::Gap { .. } => None,
            })
            .collect();
        assert!(!timestamps.is_empty());
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));

        let sequences: Vec<u32> = played.iter().map(|p| p.sequence_number()).collect();
        let mut unique = sequences.clone();
        unique.dedup();
        assert_eq!(unique, sequences);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut buffer = JitterBuffer::new(fixed_config()).unwrap();
        let t0 = Instant::now();

        for (i, seq) in [u32::MAX - 1, u32::MAX, 0, 1].into_iter().enumerate() {
            buffer.enqueue(packet(seq), t0 + ms(i as u64)).unwrap();
        }
        let order: Vec<u32> = drain(&mut buffer, t0 + ms(100)).iter().map(|p| p.sequence_number()).collect();
        assert_eq!(order, vec![u32::MAX - 1, u32::MAX, 0, 1]);
        assert_eq!(buffer.next_expected_sequence(), Some(2));
    }

    #[test]
    fn test_older_timestamp_is_discarded_as_gap() {
        let mut buffer = JitterBuffer::new(fixed_config()).unwrap();
        let t0 = Instant::now();

        buffer.enqueue(AudioPacket::new(1, 10_000, vec![1]), t0).unwrap();
        buffer.enqueue(AudioPacket::new(2, 5_000, vec![2]), t0).unwrap();

        let played = drain(&mut buffer, t0 + ms(20));
        assert!(matches!(played[0], Playout::Frame(_)));
        assert_eq!(played[1], Playout::Gap { sequence_number: 2, count: 1 });
        assert_eq!(buffer.last_played_timestamp(), Some(10_000));
    }

    #[test]
    fn test_target_delay_stays_within_bounds() {
        let config = JitterBufferConfig {
            min_delay: ms(20),
            max_delay: ms(120),
            ..JitterBufferConfig::default()
        };
        let mut buffer = JitterBuffer::new(config).unwrap();
        let t0 = Instant::now();

        // Wildly varying arrival times
        let mut arrival = t0;
        for seq in 0..200u32 {
            let wobble = if seq % 3 == 0 { 250 } else { (seq as u64 * 37) % 90 };
            arrival += ms(wobble);
            let _ = buffer.enqueue(packet(seq), arrival);
            let target = buffer.target_delay();
            assert!(target >= config.min_delay && target <= config.max_delay, "{:?}", target);
            drain(&mut buffer, arrival);
        }
        assert!(buffer.jitter_estimate() > Duration::ZERO);
    }

    #[test]
    fn test_target_delay_grows_with_jitter_and_decays_slowly() {
        let config = JitterBufferConfig::default();
        let mut buffer = JitterBuffer::new(config).unwrap();
        let t0 = Instant::now();

        // Steady 20 ms spacing: no jitter
        for seq in 0..10u32 {
            buffer.enqueue(packet(seq), t0 + ms(20 * seq as u64)).unwrap();
        }
        let steady = buffer.target_delay();
        assert_eq!(steady, config.base_delay);

        // Bursty arrivals raise the estimate and the target
        let mut at = 200;
        for seq in 10..30u32 {
            at += if seq % 2 == 0 { 60 } else { 0 };
            let _ = buffer.enqueue(packet(seq), t0 + ms(at));
        }
        let raised = buffer.target_delay();
        assert!(raised > steady);

        // Smooth arrivals again; the target comes down, but not all at once
        for seq in 30..35u32 {
            at += 20;
            let _ = buffer.enqueue(packet(seq), t0 + ms(at));
        }
        let lowered = buffer.target_delay();
        assert!(lowered < raised);
        assert!(lowered > steady);
    }

    #[test]
    fn test_underrun_counted_after_playout_starts() {
        let mut buffer = JitterBuffer::new(fixed_config()).unwrap();
        let t0 = Instant::now();

        assert_eq!(buffer.dequeue(t0), None);
        assert_eq!(buffer.stats().underruns, 0);

        buffer.enqueue(packet(1), t0).unwrap();
        assert!(buffer.dequeue(t0 + ms(20)).is_some());
        assert_eq!(buffer.dequeue(t0 + ms(40)), None);
        assert_eq!(buffer.stats().underruns, 1);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut buffer = JitterBuffer::new(fixed_config()).unwrap();
        let t0 = Instant::now();
        buffer.enqueue(packet(1), t0).unwrap();
        buffer.enqueue(packet(2), t0 + ms(7)).unwrap();

        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.next_expected_sequence(), None);
        assert_eq!(buffer.stats().packets_received, 0);

        // A fresh stream may start anywhere
        buffer.enqueue(packet(500), t0).unwrap();
        assert_eq!(buffer.next_expected_sequence(), Some(500));
    }

    #[test]
    fn test_loss_rate() {
        let stats = JitterBufferStats {
            buffered: 0,
            target_delay: ms(20),
            jitter: Duration::ZERO,
            packets_received: 9,
            packets_played: 9,
            packets_lost: 1,
            late_packets: 3,
            duplicate_packets: 0,
            overflow_drops: 0,
            underruns: 0,
        };
        assert!((stats.loss_rate() - 0.1).abs() < 1e-9);
    }
}
