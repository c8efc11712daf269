//! Pipeline statistics.
//!
//! Timeouts, late frames and skipped playout cycles are steady-state
//! conditions in a lossy real-time pipeline; they are counted here, never
//! raised as errors. Counters are lock-free atomics shared between the
//! pipeline workers and whoever polls [`crate::channel::ConsumerChannel::
//! statistics`]; snapshots are serde-serializable for export.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Sliding-window event-rate meter.
///
/// Records event instants and reports the average rate over the trailing
/// window. Used for the interest queue's request-rate statistic.
#[derive(Debug)]
pub struct FrequencyMeter {
    window: Duration,
    ticks: VecDeque<Instant>,
}

impl FrequencyMeter {
    /// Meter averaging over the trailing `window`.
    pub fn new(window: Duration) -> Self {
        Self { window, ticks: VecDeque::new() }
    }

    /// Meter with the stack's conventional 10-second window.
    pub fn with_default_window() -> Self {
        Self::new(Duration::from_secs(10))
    }

    /// Record one event now.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub(crate) fn tick_at(&mut self, now: Instant) {
        self.ticks.push_back(now);
        self.expire(now);
    }

    /// Average event rate over the window, Hz.
    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    pub(crate) fn rate_at(&mut self, now: Instant) -> f64 {
        self.expire(now);
        self.ticks.len() as f64 / self.window.as_secs_f64()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&front) = self.ticks.front() {
            if now.duration_since(front) > self.window {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Live counters for one media fetch pipeline.
///
/// Mutated by the assembly and playout workers, snapshot by the channel.
#[derive(Debug, Default)]
pub struct FetchCounters {
    /// Playout requested a frame that was not buffered yet.
    pub playback_skipped: AtomicU64,
    /// Segments arrived for frames already behind the playback pointer.
    pub late_frames: AtomicU64,
    /// Frames handed to the media consumer.
    pub frames_played: AtomicU64,
    /// Frames played with assembled level below 1.0.
    pub frames_incomplete: AtomicU64,
    /// Slots reclaimed from under an unfinished assembly.
    pub slots_evicted: AtomicU64,
}

impl FetchCounters {
    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FetchStatistics {
        FetchStatistics {
            playback_skipped: self.playback_skipped.load(Ordering::Relaxed),
            late_frames: self.late_frames.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            frames_incomplete: self.frames_incomplete.load(Ordering::Relaxed),
            slots_evicted: self.slots_evicted.load(Ordering::Relaxed),
            buffer: BufferStateCounts::default(),
        }
    }
}

/// Occupancy of the frame buffer pool by slot state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStateCounts {
    pub free: usize,
    pub assembling: usize,
    pub ready: usize,
    pub locked: usize,
}

/// Point-in-time statistics for one media fetch pipeline.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FetchStatistics {
    pub playback_skipped: u64,
    pub late_frames: u64,
    pub frames_played: u64,
    pub frames_incomplete: u64,
    pub slots_evicted: u64,
    pub buffer: BufferStateCounts,
}

/// Point-in-time statistics for the interest queue.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStatistics {
    /// Recent-window request rate, Hz.
    pub request_rate_hz: f64,
    /// Entries awaiting dispatch.
    pub pending: usize,
    /// Entries dispatched since startup.
    pub dispatched: u64,
}

/// Aggregated statistics for a consumer channel.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChannelStatistics {
    pub video: Option<FetchStatistics>,
    pub audio: Option<FetchStatistics>,
    pub queue: QueueStatistics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_meter_averages_over_window() {
        let mut meter = FrequencyMeter::new(Duration::from_secs(10));
        let start = Instant::now();
        for i in 0..50 {
            meter.tick_at(start + Duration::from_millis(i * 100));
        }
        // 50 events within a 10s window.
        let rate = meter.rate_at(start + Duration::from_secs(5));
        assert!((rate - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn frequency_meter_expires_old_ticks() {
        let mut meter = FrequencyMeter::new(Duration::from_secs(1));
        let start = Instant::now();
        for i in 0..10 {
            meter.tick_at(start + Duration::from_millis(i * 10));
        }
        assert!(meter.rate_at(start + Duration::from_secs(5)) == 0.0);
    }

    #[test]
    fn counters_snapshot_reflects_increments() {
        let counters = FetchCounters::default();
        FetchCounters::increment(&counters.playback_skipped);
        FetchCounters::increment(&counters.playback_skipped);
        FetchCounters::increment(&counters.late_frames);

        let snap = counters.snapshot();
        assert_eq!(snap.playback_skipped, 2);
        assert_eq!(snap.late_frames, 1);
        assert_eq!(snap.frames_played, 0);
    }
}
