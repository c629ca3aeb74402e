//! Bounded, time-ordered sample ring with timestamp-indexed lookup.
//!
//! One buffer per source. Oldest entries are evicted first once either the
//! count capacity or the time window is exceeded; evictions are observable
//! through `overflow_count`.

use std::collections::VecDeque;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{now_us, Sample};

/// Bounds for one stream buffer.
#[derive(Debug, Clone, Copy)]
pub struct StreamBufferConfig {
    /// Maximum sample count.
    pub capacity: usize,
    /// Maximum age spread between oldest and newest, microseconds.
    pub window_us: u64,
    /// Permitted capture-timestamp regression, microseconds. 0 = strict.
    pub reorder_slack_us: u64,
}

impl Default for StreamBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            window_us: 10_000_000, // 10 s
            reorder_slack_us: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BufferStats {
    pub count: usize,
    pub overflow_count: u64,
    pub oldest_ts_us: Option<u64>,
    pub newest_ts_us: Option<u64>,
}

/// Time-ordered ring of samples for a single source.
#[derive(Debug)]
pub struct StreamBuffer {
    config: StreamBufferConfig,
    samples: VecDeque<Sample>,
    overflow_count: u64,
    last_seq: Option<u64>,
}

impl StreamBuffer {
    pub fn new(config: StreamBufferConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.capacity.min(4096)),
            config,
            overflow_count: 0,
            last_seq: None,
        }
    }

    /// Insert a sample, stamping `ingest_ts_us` if the producer left it unset.
    ///
    /// Rejects capture timestamps that regress beyond the configured slack and
    /// sequence numbers that fail to advance. Evicts from the front until both
    /// the count and window bounds hold again.
    pub fn add(&mut self, mut sample: Sample) -> Result<Sample> {
        if let Some(last_seq) = self.last_seq {
            if sample.seq <= last_seq {
                return Err(Error::validation(format!(
                    "sequence number {} does not advance past {} for source {}",
                    sample.seq, last_seq, sample.source_id
                )));
            }
        }

        if let Some(newest) = self.samples.back() {
            let floor = newest.capture_ts_us.saturating_sub(self.config.reorder_slack_us);
            if sample.capture_ts_us < floor {
                return Err(Error::OutOfOrder {
                    capture_ts_us: sample.capture_ts_us,
                    newest_ts_us: newest.capture_ts_us,
                });
            }
        }

        if sample.ingest_ts_us == 0 {
            sample.ingest_ts_us = now_us();
        }
        self.last_seq = Some(sample.seq);

        // Slack can admit a sample slightly behind the newest; keep the ring
        // ordered by capture timestamp regardless.
        let insert_at = self
            .samples
            .partition_point(|s| s.capture_ts_us <= sample.capture_ts_us);
        let stored = sample.clone();
        self.samples.insert(insert_at, sample);

        self.evict();
        Ok(stored)
    }

    fn evict(&mut self) {
        while self.samples.len() > self.config.capacity {
            self.samples.pop_front();
            self.overflow_count += 1;
        }
        if let Some(newest_ts) = self.samples.back().map(|s| s.capture_ts_us) {
            let horizon = newest_ts.saturating_sub(self.config.window_us);
            while self
                .samples
                .front()
                .is_some_and(|s| s.capture_ts_us < horizon)
            {
                self.samples.pop_front();
                self.overflow_count += 1;
            }
        }
    }

    /// Sample with minimum |capture_ts − target| within `tolerance_us`, ties
    /// broken by lower sequence number.
    pub fn get_closest(&self, target_ts_us: u64, tolerance_us: u64) -> Option<&Sample> {
        if self.samples.is_empty() {
            return None;
        }

        let split = self
            .samples
            .partition_point(|s| s.capture_ts_us < target_ts_us);

        // Only the nearest sample on each side of the target can win, but
        // equal timestamps share a distance, so walk back to the lowest seq
        // among them.
        let mut best: Option<&Sample> = None;
        let mut best_dist = u64::MAX;
        let candidates = split
            .checked_sub(1)
            .into_iter()
            .chain(std::iter::once(split))
            .filter(|&i| i < self.samples.len());
        for i in candidates {
            let s = &self.samples[i];
            let dist = s.capture_ts_us.abs_diff(target_ts_us);
            let better = dist < best_dist
                || (dist == best_dist && best.is_some_and(|b| s.seq < b.seq));
            if better {
                best = Some(s);
                best_dist = dist;
            }
        }

        let best = best?;
        if best_dist > tolerance_us {
            return None;
        }
        // Equal-distance duplicates earlier in the ring keep the lower seq.
        let winner = self
            .samples
            .iter()
            .filter(|s| s.capture_ts_us.abs_diff(target_ts_us) == best_dist)
            .min_by_key(|s| s.seq)
            .unwrap_or(best);
        Some(winner)
    }

    /// Ordered samples with capture timestamp in [start, end] inclusive.
    pub fn get_range(&self, start_ts_us: u64, end_ts_us: u64) -> Vec<&Sample> {
        self.samples
            .iter()
            .filter(|s| s.capture_ts_us >= start_ts_us && s.capture_ts_us <= end_ts_us)
            .collect()
    }

    /// Most recent `n` samples, newest last.
    pub fn get_latest(&self, n: usize) -> Vec<&Sample> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).collect()
    }

    pub fn newest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            count: self.samples.len(),
            overflow_count: self.overflow_count,
            oldest_ts_us: self.samples.front().map(|s| s.capture_ts_us),
            newest_ts_us: self.samples.back().map(|s| s.capture_ts_us),
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SamplePayload;

    fn gaze(ts: u64, seq: u64) -> Sample {
        Sample::new("gaze-0", ts, seq, SamplePayload::Gaze { x: 0.5, y: 0.5, pupil_diameter: None })
    }

    #[test]
    fn add_preserves_insertion_order_for_increasing_timestamps() {
        let mut buf = StreamBuffer::new(StreamBufferConfig::default());
        for (i, ts) in [1000u64, 2000, 3000, 4000].iter().enumerate() {
            buf.add(gaze(*ts, i as u64 + 1)).unwrap();
        }
        let all = buf.get_latest(10);
        let ts: Vec<u64> = all.iter().map(|s| s.capture_ts_us).collect();
        assert_eq!(ts, vec![1000, 2000, 3000, 4000]);
    }

    #[test]
    fn add_stamps_ingest_timestamp() {
        let mut buf = StreamBuffer::new(StreamBufferConfig::default());
        let stored = buf.add(gaze(1000, 1)).unwrap();
        assert!(stored.ingest_ts_us > 0);
    }

    #[test]
    fn rejects_regressing_capture_timestamp() {
        let mut buf = StreamBuffer::new(StreamBufferConfig::default());
        buf.add(gaze(2000, 1)).unwrap();
        let err = buf.add(gaze(1000, 2)).unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { .. }));
    }

    #[test]
    fn slack_admits_small_reordering() {
        let mut buf = StreamBuffer::new(StreamBufferConfig {
            reorder_slack_us: 500,
            ..Default::default()
        });
        buf.add(gaze(2000, 1)).unwrap();
        buf.add(gaze(1800, 2)).unwrap();
        // Ring stays time-ordered despite the late arrival.
        let ts: Vec<u64> = buf.get_latest(10).iter().map(|s| s.capture_ts_us).collect();
        assert_eq!(ts, vec![1800, 2000]);
    }

    #[test]
    fn rejects_non_advancing_sequence() {
        let mut buf = StreamBuffer::new(StreamBufferConfig::default());
        buf.add(gaze(1000, 5)).unwrap();
        assert!(buf.add(gaze(2000, 5)).is_err());
    }

    #[test]
    fn capacity_eviction_drops_oldest_and_counts() {
        let mut buf = StreamBuffer::new(StreamBufferConfig {
            capacity: 3,
            ..Default::default()
        });
        for i in 1..=5u64 {
            buf.add(gaze(i * 1000, i)).unwrap();
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.overflow_count(), 2);
        assert_eq!(buf.stats().oldest_ts_us, Some(3000));
    }

    #[test]
    fn window_eviction_bounds_age_spread() {
        let mut buf = StreamBuffer::new(StreamBufferConfig {
            window_us: 2000,
            ..Default::default()
        });
        buf.add(gaze(1000, 1)).unwrap();
        buf.add(gaze(2000, 2)).unwrap();
        buf.add(gaze(5000, 3)).unwrap();
        let stats = buf.stats();
        let spread = stats.newest_ts_us.unwrap() - stats.oldest_ts_us.unwrap();
        assert!(spread <= 2000);
        assert!(stats.overflow_count >= 1);
    }

    #[test]
    fn closest_returns_argmin_within_tolerance() {
        let mut buf = StreamBuffer::new(StreamBufferConfig::default());
        buf.add(gaze(1000, 1)).unwrap();
        buf.add(gaze(2000, 2)).unwrap();
        buf.add(gaze(3000, 3)).unwrap();

        assert_eq!(buf.get_closest(2100, 1000).unwrap().capture_ts_us, 2000);
        assert_eq!(buf.get_closest(2600, 1000).unwrap().capture_ts_us, 3000);
        assert!(buf.get_closest(10_000, 100).is_none());
    }

    #[test]
    fn closest_tie_breaks_on_lower_seq() {
        let mut buf = StreamBuffer::new(StreamBufferConfig::default());
        buf.add(gaze(1000, 1)).unwrap();
        buf.add(gaze(1000, 2)).unwrap();
        assert_eq!(buf.get_closest(1000, 100).unwrap().seq, 1);

        // Equidistant neighbours: 1900 and 2100 around 2000.
        let mut buf = StreamBuffer::new(StreamBufferConfig::default());
        buf.add(gaze(1900, 1)).unwrap();
        buf.add(gaze(2100, 2)).unwrap();
        assert_eq!(buf.get_closest(2000, 1000).unwrap().seq, 1);
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let mut buf = StreamBuffer::new(StreamBufferConfig::default());
        for i in 1..=5u64 {
            buf.add(gaze(i * 1000, i)).unwrap();
        }
        let range = buf.get_range(2000, 4000);
        let ts: Vec<u64> = range.iter().map(|s| s.capture_ts_us).collect();
        assert_eq!(ts, vec![2000, 3000, 4000]);
    }

    #[test]
    fn latest_returns_newest_last() {
        let mut buf = StreamBuffer::new(StreamBufferConfig::default());
        for i in 1..=5u64 {
            buf.add(gaze(i * 1000, i)).unwrap();
        }
        let latest = buf.get_latest(2);
        let ts: Vec<u64> = latest.iter().map(|s| s.capture_ts_us).collect();
        assert_eq!(ts, vec![4000, 5000]);
    }
}
