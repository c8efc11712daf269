//! Audio/video drift synchronization.
//!
//! Each media stream's playout loop reports the timestamp of the packet it
//! just presented together with the local wall-clock time. The
//! synchronizer compares the two streams' progress and hands the slave
//! stream (video) a signed millisecond adjustment that nudges it back
//! onto the master's (audio's) schedule. Audio is never adjusted.
//!
//! The adjustment returned here is *raw* drift; the playout scheduler owns
//! clamping (never below the frame's available delay, never above
//! [`MAX_AV_SYNC_ADJUSTMENT_MS`] per frame).

use std::sync::Mutex;

use tracing::trace;

/// Upper bound on the positive AV-sync adjustment applied to a single
/// frame, milliseconds. Larger corrections are spread across frames.
pub const MAX_AV_SYNC_ADJUSTMENT_MS: i64 = 200;

/// Drift below this magnitude is treated as jitter noise, not corrected.
pub const TOLERABLE_AV_SYNC_DRIFT_MS: i64 = 20;

/// Which media stream a playout loop drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStream {
    Audio,
    Video,
}

/// Drift oracle consulted by the playout scheduler.
///
/// Implementations must be callable concurrently from both streams'
/// playout tasks.
pub trait AvSynchronizer: Send + Sync {
    /// Report that `stream` just presented a packet stamped
    /// `last_packet_ts` (producer media clock, ms) at local time `now_ms`,
    /// and return the signed delay adjustment for that stream.
    fn synchronize_packet(&self, last_packet_ts: i64, now_ms: i64, stream: SyncStream) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
struct StreamClock {
    remote_ts: i64,
    local_ts: i64,
    initialized: bool,
}

#[derive(Debug, Default)]
struct SyncState {
    audio: StreamClock,
    video: StreamClock,
}

/// Two-stream synchronizer with audio as the master clock.
///
/// Video's adjustment is how far it has run ahead of audio: positive when
/// video's remote-clock progress exceeds audio's relative to local time,
/// meaning video should be delayed.
#[derive(Debug, Default)]
pub struct AudioVideoSynchronizer {
    state: Mutex<SyncState>,
}

impl AudioVideoSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AvSynchronizer for AudioVideoSynchronizer {
    fn synchronize_packet(&self, last_packet_ts: i64, now_ms: i64, stream: SyncStream) -> i64 {
        let mut state = self.state.lock().expect("sync lock poisoned");

        let clock = match stream {
            SyncStream::Audio => &mut state.audio,
            SyncStream::Video => &mut state.video,
        };
        clock.remote_ts = last_packet_ts;
        clock.local_ts = now_ms;
        clock.initialized = true;

        // Audio is the master; only video gets corrected, and only once
        // both streams have reported.
        if stream == SyncStream::Audio || !state.audio.initialized || !state.video.initialized {
            return 0;
        }

        let local_lead = state.video.local_ts - state.audio.local_ts;
        let remote_lead = state.video.remote_ts - state.audio.remote_ts;
        let drift = remote_lead - local_lead;

        if drift.abs() < TOLERABLE_AV_SYNC_DRIFT_MS {
            return 0;
        }
        trace!(drift, "av drift correction");
        drift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_master_is_never_adjusted() {
        let sync = AudioVideoSynchronizer::new();
        assert_eq!(sync.synchronize_packet(1000, 50_000, SyncStream::Audio), 0);
        assert_eq!(sync.synchronize_packet(1000, 50_000, SyncStream::Video), 0);
        assert_eq!(sync.synchronize_packet(2000, 51_000, SyncStream::Audio), 0);
    }

    #[test]
    fn video_unadjusted_until_both_streams_report() {
        let sync = AudioVideoSynchronizer::new();
        // Video alone has no reference clock.
        assert_eq!(sync.synchronize_packet(5000, 50_000, SyncStream::Video), 0);
    }

    #[test]
    fn video_running_ahead_gets_positive_adjustment() {
        let sync = AudioVideoSynchronizer::new();
        sync.synchronize_packet(1000, 50_000, SyncStream::Audio);
        // At the same local instant video has consumed 50ms more of the
        // producer's media clock than audio.
        let adjustment = sync.synchronize_packet(1050, 50_000, SyncStream::Video);
        assert_eq!(adjustment, 50);
    }

    #[test]
    fn video_running_behind_gets_negative_adjustment() {
        let sync = AudioVideoSynchronizer::new();
        sync.synchronize_packet(1000, 50_000, SyncStream::Audio);
        let adjustment = sync.synchronize_packet(920, 50_000, SyncStream::Video);
        assert_eq!(adjustment, -80);
    }

    #[test]
    fn small_drift_is_tolerated() {
        let sync = AudioVideoSynchronizer::new();
        sync.synchronize_packet(1000, 50_000, SyncStream::Audio);
        let adjustment =
            sync.synchronize_packet(1000 + TOLERABLE_AV_SYNC_DRIFT_MS - 1, 50_000, SyncStream::Video);
        assert_eq!(adjustment, 0);
    }

    #[test]
    fn in_sync_streams_need_no_correction() {
        let sync = AudioVideoSynchronizer::new();
        // Both streams advance 100ms of media per 100ms of wall clock.
        sync.synchronize_packet(1000, 50_000, SyncStream::Audio);
        assert_eq!(sync.synchronize_packet(1000, 50_000, SyncStream::Video), 0);
        sync.synchronize_packet(1100, 50_100, SyncStream::Audio);
        assert_eq!(sync.synchronize_packet(1100, 50_100, SyncStream::Video), 0);
    }
}
