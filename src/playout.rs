//! Playout scheduling.
//!
//! One cooperative task per media stream pulls reassembled frames from the
//! buffer, hands them to the media sink, and computes how long to wait
//! before the next presentation. The wait combines three terms:
//!
//! 1. the raw delay the buffer reports at release (measured from the
//!    producer's schedule, or inferred from the nominal rate),
//! 2. a carried playback adjustment that settles the debt left behind by
//!    earlier inferred delays once a measured frame arrives,
//! 3. an AV-sync drift adjustment, applied only to measured frames.
//!
//! Every term is clamped so the armed timer is never negative: the carried
//! adjustment is capped at `-raw_delay` (remainder carried forward), and a
//! negative sync adjustment is capped at `-(raw_delay + adjustment)` with
//! the excess folded back into the carried adjustment. Positive sync
//! corrections are bounded per frame by
//! [`MAX_AV_SYNC_ADJUSTMENT_MS`](crate::sync::MAX_AV_SYNC_ADJUSTMENT_MS)
//! so a large drift is spread over several frames.
//!
//! The long-run correction works like a ledger: each inferred frame books
//! its estimated delay; the next measured frame compares the producer's
//! actual interval against the booked total and folds the difference into
//! the carried adjustment. Short-run estimation error cannot accumulate
//! into rate drift.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{AcquireResult, AcquiredFrame, FrameBuffer};
use crate::stats::FetchCounters;
use crate::sync::{AvSynchronizer, SyncStream, MAX_AV_SYNC_ADJUSTMENT_MS};

/// Per-media presentation hook invoked once per played frame.
///
/// Returns `false` when the payload turned out to be unusable (malformed
/// wire data); the scheduler then skips timing bookkeeping for the frame.
pub trait PlaybackSink: Send + 'static {
    fn playback(&mut self, frame: &AcquiredFrame) -> bool;
}

impl<F> PlaybackSink for F
where
    F: FnMut(&AcquiredFrame) -> bool + Send + 'static,
{
    fn playback(&mut self, frame: &AcquiredFrame) -> bool {
        self(frame)
    }
}

/// Delay-computation state for one stream. Pure bookkeeping, no clocks.
#[derive(Debug, Default)]
pub struct PlayoutTiming {
    /// Media timestamp of the last frame played on measured timing.
    last_packet_ts: i64,
    /// Carried signed correction, consumed (or capped) each frame.
    playback_adjustment: i64,
    /// Estimated delay booked by inferred frames since the last measured
    /// frame.
    inferred_delay: i64,
}

impl PlayoutTiming {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_packet_ts(&self) -> i64 {
        self.last_packet_ts
    }

    pub fn playback_adjustment(&self) -> i64 {
        self.playback_adjustment
    }

    pub fn inferred_delay(&self) -> i64 {
        self.inferred_delay
    }

    /// Book the frame's delay decision. Inferred delays accumulate; a
    /// measured frame settles the accumulated estimate against the
    /// producer's actual interval and re-anchors the timestamp.
    pub fn settle(&mut self, raw_delay: i64, inferred: bool, media_ts: i64) {
        if inferred {
            self.inferred_delay += raw_delay;
            return;
        }
        if self.last_packet_ts > 0 && self.inferred_delay != 0 {
            let measured_interval = media_ts - self.last_packet_ts;
            self.playback_adjustment += measured_interval - self.inferred_delay;
            debug!(
                measured_interval,
                inferred_delay = self.inferred_delay,
                playback_adjustment = self.playback_adjustment,
                "settled inferred delay"
            );
        }
        self.inferred_delay = 0;
        self.last_packet_ts = media_ts;
    }

    /// Consume the carried adjustment against this frame's raw delay.
    ///
    /// A negative adjustment larger than the delay is capped at
    /// `-raw_delay` and the remainder stays carried; otherwise the whole
    /// adjustment is applied and the accumulator resets.
    pub fn take_adjustment(&mut self, raw_delay: i64) -> i64 {
        if self.playback_adjustment < 0 && -self.playback_adjustment > raw_delay {
            self.playback_adjustment += raw_delay;
            -raw_delay
        } else {
            std::mem::take(&mut self.playback_adjustment)
        }
    }

    /// Clamp a raw drift adjustment against the delay available this
    /// frame. Excess negative correction folds back into the carried
    /// adjustment; positive correction is bounded per frame.
    pub fn clamp_av_sync(&mut self, drift: i64, delay_with_adjustment: i64) -> i64 {
        let mut sync = drift;
        if sync < 0 && -sync > delay_with_adjustment {
            self.playback_adjustment += sync + delay_with_adjustment;
            sync = -delay_with_adjustment;
        }
        sync.min(MAX_AV_SYNC_ADJUSTMENT_MS)
    }
}

/// Playout loop for one media stream.
pub struct Playout {
    buffer: Arc<FrameBuffer>,
    counters: Arc<FetchCounters>,
    synchronizer: Option<Arc<dyn AvSynchronizer>>,
    stream: SyncStream,
    sink: Box<dyn PlaybackSink>,
    timing: PlayoutTiming,
    acquire_timeout: Duration,
    cancel: CancellationToken,
}

impl Playout {
    pub fn new(
        buffer: Arc<FrameBuffer>,
        counters: Arc<FetchCounters>,
        synchronizer: Option<Arc<dyn AvSynchronizer>>,
        stream: SyncStream,
        sink: Box<dyn PlaybackSink>,
        acquire_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            buffer,
            counters,
            synchronizer,
            stream,
            sink,
            timing: PlayoutTiming::new(),
            acquire_timeout,
            cancel,
        }
    }

    /// Run until cancelled or the buffer protocol is violated.
    pub async fn run(mut self) {
        info!(stream = ?self.stream, "playout started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.buffer.acquire_slot(self.acquire_timeout) => {
                    match result {
                        Ok(AcquireResult::NoData) => {
                            FetchCounters::increment(&self.counters.playback_skipped);
                        }
                        Ok(AcquireResult::Acquired(frame)) => {
                            if let Err(err) = self.play_frame(frame).await {
                                error!(stream = ?self.stream, %err, "playout stopping");
                                break;
                            }
                        }
                        Err(err) => {
                            error!(stream = ?self.stream, %err, "acquire failed, playout stopping");
                            break;
                        }
                    }
                }
            }
        }
        info!(stream = ?self.stream, "playout stopped");
    }

    async fn play_frame(&mut self, frame: AcquiredFrame) -> crate::Result<()> {
        let now_ms = unix_millis();
        let packet_valid = self.sink.playback(&frame);
        if packet_valid {
            FetchCounters::increment(&self.counters.frames_played);
            if frame.assembled_level < 1.0 {
                FetchCounters::increment(&self.counters.frames_incomplete);
            }
        }

        let released = self.buffer.release_acquired_slot()?;
        let mut raw_delay = released.delay_ms;
        if raw_delay < 0 {
            // Playout fell behind the producer's schedule; present
            // immediately rather than trying to rewind.
            warn!(stream = ?self.stream, raw_delay, "playback delay below zero");
            raw_delay = 0;
        }

        if packet_valid {
            self.timing.settle(raw_delay, released.inferred, frame.media_timestamp_ms);
        }
        let adjustment = self.timing.take_adjustment(raw_delay);

        let av_sync = match (&self.synchronizer, packet_valid) {
            (Some(synchronizer), true) => {
                let drift = synchronizer.synchronize_packet(
                    self.timing.last_packet_ts(),
                    now_ms,
                    self.stream,
                );
                self.timing.clamp_av_sync(drift, raw_delay + adjustment)
            }
            _ => 0,
        };

        let mut total = raw_delay + adjustment;
        if !released.inferred {
            total += av_sync;
        }

        debug!(
            stream = ?self.stream,
            frame_no = frame.frame_no,
            level = frame.assembled_level,
            valid = packet_valid,
            ts = frame.media_timestamp_ms,
            last_ts = self.timing.last_packet_ts(),
            total,
            delay = raw_delay,
            adjustment,
            av_sync,
            inferred_delay = self.timing.inferred_delay(),
            inferred = released.inferred,
            "frame played"
        );

        // One-shot timer, rearmed every cycle. A late fire just means
        // late presentation. Cancellation interrupts the wait so shutdown
        // never blocks on a long delay.
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(total.max(0) as u64)) => {}
        }
        Ok(())
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{EvictionPolicy, SegmentData};

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The armed timer is never negative, whatever the buffer and
            /// synchronizer feed in.
            #[test]
            fn final_delay_is_never_negative(
                frames in prop::collection::vec(
                    (0i64..500, any::<bool>(), 1i64..1_000_000, -2000i64..2000),
                    1..60
                )
            ) {
                let mut timing = PlayoutTiming::new();
                for (raw_delay, inferred, media_ts, drift) in frames {
                    timing.settle(raw_delay, inferred, media_ts);
                    let adjustment = timing.take_adjustment(raw_delay);
                    prop_assert!(raw_delay + adjustment >= 0);

                    let av_sync = timing.clamp_av_sync(drift, raw_delay + adjustment);
                    prop_assert!(av_sync <= MAX_AV_SYNC_ADJUSTMENT_MS);

                    let mut total = raw_delay + adjustment;
                    if !inferred {
                        total += av_sync;
                    }
                    prop_assert!(total >= 0, "negative timer: {total}");
                }
            }

            /// A run of inferred frames followed by one measured frame
            /// leaves the carried adjustment equal to the producer's
            /// actual interval minus the booked estimates.
            #[test]
            fn inferred_debt_settles_against_measured_interval(
                inferred_delays in prop::collection::vec(1i64..100, 1..20),
                first_ts in 1i64..1_000_000,
                measured_interval in 1i64..5000
            ) {
                let mut timing = PlayoutTiming::new();
                // Anchor with a measured frame.
                timing.settle(33, false, first_ts);
                timing.take_adjustment(33);

                for &delay in &inferred_delays {
                    timing.settle(delay, true, 0);
                    timing.take_adjustment(delay);
                }

                timing.settle(33, false, first_ts + measured_interval);
                let booked: i64 = inferred_delays.iter().sum();
                prop_assert_eq!(
                    timing.playback_adjustment(),
                    measured_interval - booked
                );
                prop_assert_eq!(timing.inferred_delay(), 0);
            }
        }
    }

    #[test]
    fn negative_adjustment_is_capped_and_carried() {
        let mut timing = PlayoutTiming::new();
        // Inferred frames booked 100ms; producer's real interval was 40ms.
        timing.settle(50, true, 0);
        timing.take_adjustment(50);
        timing.settle(50, true, 0);
        timing.take_adjustment(50);
        timing.settle(33, false, 1040);
        // No anchor timestamp yet, so nothing settles on the first
        // measured frame.
        assert_eq!(timing.playback_adjustment(), 0);

        timing.take_adjustment(33);
        timing.settle(50, true, 0);
        timing.take_adjustment(50);
        timing.settle(33, false, 1060);
        // Real interval 20ms against 50ms booked: 30ms debt.
        assert_eq!(timing.playback_adjustment(), -30);

        // Only 10ms of delay available: cap at -10, carry -20.
        assert_eq!(timing.take_adjustment(10), -10);
        assert_eq!(timing.playback_adjustment(), -20);
        // Plenty of delay: the rest applies and the accumulator resets.
        assert_eq!(timing.take_adjustment(100), -20);
        assert_eq!(timing.playback_adjustment(), 0);
    }

    #[test]
    fn positive_adjustment_applies_in_full() {
        let mut timing = PlayoutTiming::new();
        timing.settle(33, false, 1000);
        timing.take_adjustment(33);
        timing.settle(20, true, 0);
        timing.take_adjustment(20);
        // Real interval 50ms against 20ms booked.
        timing.settle(33, false, 1050);
        assert_eq!(timing.take_adjustment(33), 30);
        assert_eq!(timing.playback_adjustment(), 0);
    }

    #[test]
    fn negative_av_sync_folds_excess_back() {
        let mut timing = PlayoutTiming::new();
        // Drift wants -100ms but only 30ms of delay exists this frame.
        let sync = timing.clamp_av_sync(-100, 30);
        assert_eq!(sync, -30);
        assert_eq!(timing.playback_adjustment(), -70);
    }

    #[test]
    fn positive_av_sync_is_bounded_per_frame() {
        let mut timing = PlayoutTiming::new();
        let sync = timing.clamp_av_sync(1000, 30);
        assert_eq!(sync, MAX_AV_SYNC_ADJUSTMENT_MS);
        assert_eq!(timing.playback_adjustment(), 0);
    }

    fn segment(frame_no: u32, ts: i64) -> SegmentData {
        SegmentData {
            frame_no,
            segment_no: 0,
            total_segments: 1,
            is_key: false,
            media_timestamp_ms: ts,
            paired_packet_no: None,
            payload: vec![0u8; 8],
        }
    }

    #[tokio::test]
    async fn playout_plays_buffered_frames_and_counts_skips() {
        let counters = Arc::new(FetchCounters::default());
        let buffer = Arc::new(FrameBuffer::new(
            8,
            1000,
            5,
            EvictionPolicy::OldestFrame,
            counters.clone(),
        ));
        for i in 0..3u32 {
            buffer.push_segment(segment(i, i as i64 * 5));
        }

        let cancel = CancellationToken::new();
        let played = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_played = Arc::clone(&played);
        let playout = Playout::new(
            Arc::clone(&buffer),
            counters.clone(),
            None,
            SyncStream::Video,
            Box::new(move |frame: &AcquiredFrame| {
                sink_played.lock().unwrap().push(frame.frame_no);
                true
            }),
            Duration::from_millis(30),
            cancel.clone(),
        );
        let handle = tokio::spawn(playout.run());

        // Three frames at ~5ms cadence plus at least one empty acquire
        // window.
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*played.lock().unwrap(), vec![0, 1, 2]);
        let snap = counters.snapshot();
        assert_eq!(snap.frames_played, 3);
        assert!(snap.playback_skipped >= 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_armed_delay_timer() {
        let counters = Arc::new(FetchCounters::default());
        // A nominal interval of a minute: without the cancellation race
        // the armed timer would hold shutdown for the full delay.
        let buffer = Arc::new(FrameBuffer::new(
            4,
            1000,
            60_000,
            EvictionPolicy::OldestFrame,
            counters.clone(),
        ));
        buffer.push_segment(segment(0, 0));

        let cancel = CancellationToken::new();
        let playout = Playout::new(
            Arc::clone(&buffer),
            counters.clone(),
            None,
            SyncStream::Video,
            Box::new(|_: &AcquiredFrame| true),
            Duration::from_millis(20),
            cancel.clone(),
        );
        let handle = tokio::spawn(playout.run());

        while counters.snapshot().frames_played == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("playout did not stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_frames_are_released_but_not_counted_played() {
        let counters = Arc::new(FetchCounters::default());
        let buffer = Arc::new(FrameBuffer::new(
            4,
            1000,
            5,
            EvictionPolicy::OldestFrame,
            counters.clone(),
        ));
        buffer.push_segment(segment(0, 0));

        let cancel = CancellationToken::new();
        let playout = Playout::new(
            Arc::clone(&buffer),
            counters.clone(),
            None,
            SyncStream::Audio,
            Box::new(|_: &AcquiredFrame| false),
            Duration::from_millis(20),
            cancel.clone(),
        );
        let handle = tokio::spawn(playout.run());
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(counters.snapshot().frames_played, 0);
        // The slot still went back to the pool.
        assert_eq!(buffer.state_counts().free, 4);
    }
}
