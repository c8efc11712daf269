//! Frame reassembly buffer.
//!
//! Incoming network segments are assembled into whole frames inside a
//! fixed-capacity pool of reusable slots, indexed by frame number. One
//! writer role (the segment-arrival handler, called from transport
//! callback threads) and one reader role (the playout loop) share the
//! pool; all slot transitions happen under one short-lived lock, and the
//! reader parks on a [`Notify`] while no slot is ready.
//!
//! Slot lifecycle:
//!
//! ```text
//! Free ──first segment──▶ Assembling ──all segments──▶ Ready
//!   ▲                        │                           │
//!   │◀──────eviction─────────┘          acquire ─────────▼
//!   └──────────────────release────────────────────── Locked
//! ```
//!
//! Segment writes are only accepted while a slot is Assembling; a frame
//! whose assembly is complete is closed to further writes. When the pool
//! is exhausted and a new frame number must be admitted, the slot holding
//! the oldest unlocked frame is reclaimed ([`EvictionPolicy::OldestFrame`]).
//!
//! Completion order is not frame order: frames may become Ready out of
//! order, and segments for frame numbers already behind the playback
//! pointer are counted late and dropped rather than treated as errors.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::packet::video::PacketNumber;
use crate::stats::{BufferStateCounts, FetchCounters};
use crate::{Result, RtcError};

/// Monotonic frame sequence number within a media thread.
pub type FrameNumber = u32;

/// Reassembly state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Assembling,
    Ready,
    Locked,
}

/// Which slot to reclaim when the pool is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Reclaim the slot holding the oldest (lowest) unlocked frame number.
    #[default]
    OldestFrame,
}

/// One network segment routed to the buffer by the segment-arrival
/// handler, already validated and stripped to assembly-relevant fields.
#[derive(Debug, Clone)]
pub struct SegmentData {
    pub frame_no: FrameNumber,
    pub segment_no: usize,
    pub total_segments: usize,
    pub is_key: bool,
    /// Producer media timestamp of the frame, milliseconds.
    pub media_timestamp_ms: i64,
    /// Sibling-stream packet number for AV-sync cross-referencing.
    pub paired_packet_no: Option<PacketNumber>,
    pub payload: Vec<u8>,
}

/// Outcome of a segment write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentWrite {
    /// Stored; the frame is still assembling.
    Admitted,
    /// Stored, and the frame just became Ready.
    Completed,
    /// Duplicate segment, ignored.
    Duplicate,
    /// The slot is Ready or Locked; assembly is closed.
    RejectedClosed,
    /// The frame number is behind the playback pointer.
    Late,
    /// The segment would overflow the slot's configured size.
    RejectedOversize,
}

/// A frame claimed for playout, together with its slot metadata.
#[derive(Debug, Clone)]
pub struct AcquiredFrame {
    pub frame_no: FrameNumber,
    pub is_key: bool,
    /// Fraction of expected segments present, 1.0 for a Ready slot.
    pub assembled_level: f64,
    pub media_timestamp_ms: i64,
    pub paired_packet_no: Option<PacketNumber>,
    /// Reassembled frame wire bytes.
    pub payload: Vec<u8>,
}

/// Result of [`FrameBuffer::acquire_slot`]: no Ready slot within the wait
/// bound is an expected steady-state condition, distinct from an error.
#[derive(Debug, Clone)]
pub enum AcquireResult {
    Acquired(AcquiredFrame),
    NoData,
}

/// Raw playout delay computed when a slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasedSlot {
    /// Elapsed-time-based delay until the next frame is due, milliseconds.
    /// May be negative when playout is running behind.
    pub delay_ms: i64,
    /// True when the delay was estimated from the nominal producer rate
    /// rather than measured from the producer's actual schedule.
    pub inferred: bool,
}

#[derive(Debug)]
struct Slot {
    frame_no: FrameNumber,
    state: SlotState,
    segments: Vec<Option<Vec<u8>>>,
    assembled: usize,
    total: usize,
    is_key: bool,
    media_timestamp_ms: i64,
    paired_packet_no: Option<PacketNumber>,
    assembling_started: Instant,
    bytes_assembled: usize,
}

impl Slot {
    fn free() -> Self {
        Self {
            frame_no: 0,
            state: SlotState::Free,
            segments: Vec::new(),
            assembled: 0,
            total: 0,
            is_key: false,
            media_timestamp_ms: 0,
            paired_packet_no: None,
            assembling_started: Instant::now(),
            bytes_assembled: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::free();
    }

    fn begin_assembly(&mut self, segment: &SegmentData) {
        self.frame_no = segment.frame_no;
        self.state = SlotState::Assembling;
        self.segments = vec![None; segment.total_segments.max(1)];
        self.assembled = 0;
        self.total = segment.total_segments.max(1);
        self.is_key = segment.is_key;
        self.media_timestamp_ms = segment.media_timestamp_ms;
        self.paired_packet_no = segment.paired_packet_no;
        self.assembling_started = Instant::now();
        self.bytes_assembled = 0;
    }

    fn assembled_level(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.assembled as f64 / self.total as f64
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes_assembled);
        for segment in self.segments.iter().flatten() {
            out.extend_from_slice(segment);
        }
        out
    }
}

struct BufferInner {
    slots: Vec<Slot>,
    /// Next frame number expected by playout; lower frames are late.
    playback_pointer: FrameNumber,
    /// Index of the slot currently held Locked by the reader.
    locked: Option<usize>,
    locked_at: Instant,
}

/// Fixed-capacity pool of frame reassembly slots.
pub struct FrameBuffer {
    inner: Mutex<BufferInner>,
    ready_notify: Notify,
    slot_size: usize,
    frame_interval_ms: i64,
    eviction: EvictionPolicy,
    counters: Arc<FetchCounters>,
}

impl FrameBuffer {
    /// Pool of `capacity` slots of at most `slot_size` bytes each.
    ///
    /// `frame_interval_ms` is the nominal producer inter-frame interval,
    /// used when a release delay must be inferred rather than measured.
    pub fn new(
        capacity: usize,
        slot_size: usize,
        frame_interval_ms: i64,
        eviction: EvictionPolicy,
        counters: Arc<FetchCounters>,
    ) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                slots: (0..capacity).map(|_| Slot::free()).collect(),
                playback_pointer: 0,
                locked: None,
                locked_at: Instant::now(),
            }),
            ready_notify: Notify::new(),
            slot_size,
            frame_interval_ms,
            eviction,
            counters,
        }
    }

    /// Route one arriving segment into its frame's slot.
    ///
    /// Serialized with all other buffer operations by the pool lock, so
    /// concurrent arrivals for the same frame cannot lose updates to the
    /// assembled-segment counter.
    pub fn push_segment(&self, segment: SegmentData) -> SegmentWrite {
        let result = {
            let mut inner = self.inner.lock().expect("buffer lock poisoned");

            if segment.frame_no < inner.playback_pointer {
                FetchCounters::increment(&self.counters.late_frames);
                trace!(
                    frame_no = segment.frame_no,
                    pointer = inner.playback_pointer,
                    "late segment dropped"
                );
                return SegmentWrite::Late;
            }

            let index = match inner.slots.iter().position(|s| {
                s.state != SlotState::Free && s.frame_no == segment.frame_no
            }) {
                Some(index) => index,
                None => match self.admit_frame(&mut inner, &segment) {
                    Some(index) => index,
                    None => return SegmentWrite::RejectedClosed,
                },
            };

            self.write_segment(&mut inner, index, segment)
        };

        if result == SegmentWrite::Completed {
            self.ready_notify.notify_waiters();
        }
        result
    }

    /// Claim the next in-order Ready slot, waiting up to `timeout`.
    ///
    /// Returns [`AcquireResult::NoData`] when nothing becomes Ready in
    /// time, an expected condition the caller treats as a skipped cycle.
    /// Acquiring while another slot is still held is a programming error.
    pub async fn acquire_slot(&self, timeout: Duration) -> Result<AcquireResult> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for readiness before checking the pool, so a frame
            // completing between the check and the wait still wakes us.
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire()? {
                Some(frame) => return Ok(AcquireResult::Acquired(frame)),
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(AcquireResult::NoData);
                    }
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep(deadline - now) => return Ok(AcquireResult::NoData),
                    }
                }
            }
        }
    }

    /// Non-blocking variant of [`Self::acquire_slot`].
    pub fn try_acquire(&self) -> Result<Option<AcquiredFrame>> {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        if inner.locked.is_some() {
            return Err(RtcError::buffer("acquire while a slot is already locked", inner.locked));
        }

        let candidate = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Ready)
            .min_by_key(|(_, s)| s.frame_no)
            .map(|(i, _)| i);

        let Some(index) = candidate else {
            return Ok(None);
        };

        let now = Instant::now();
        inner.locked = Some(index);
        inner.locked_at = now;
        let slot = &mut inner.slots[index];
        slot.state = SlotState::Locked;
        trace!(frame_no = slot.frame_no, "slot locked for playout");

        Ok(Some(AcquiredFrame {
            frame_no: slot.frame_no,
            is_key: slot.is_key,
            assembled_level: slot.assembled_level(),
            media_timestamp_ms: slot.media_timestamp_ms,
            paired_packet_no: slot.paired_packet_no,
            payload: slot.payload(),
        }))
    }

    /// Release the Locked slot back to Free and compute the raw playout
    /// delay for the frame it held.
    ///
    /// The delay is the producer's inter-frame interval toward the next
    /// known frame (measured) or the nominal interval (inferred), less
    /// the time the reader already spent holding the slot. It may come
    /// out negative when playout runs behind; clamping is the playout
    /// scheduler's job.
    pub fn release_acquired_slot(&self) -> Result<ReleasedSlot> {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        let Some(index) = inner.locked.take() else {
            return Err(RtcError::buffer("release without an acquired slot", None));
        };

        let held_ms = inner.locked_at.elapsed().as_millis() as i64;
        let frame_no = inner.slots[index].frame_no;
        let frame_ts = inner.slots[index].media_timestamp_ms;

        // Measured cadence needs the successor frame's timestamp; any
        // buffered later frame gives one (frames may complete out of
        // order, the nearest successor bounds the interval).
        let next_ts = inner
            .slots
            .iter()
            .filter(|s| {
                matches!(s.state, SlotState::Assembling | SlotState::Ready)
                    && s.frame_no > frame_no
            })
            .min_by_key(|s| s.frame_no)
            .map(|s| s.media_timestamp_ms);

        let (interval, inferred) = match next_ts {
            Some(next) if next > frame_ts => (next - frame_ts, false),
            _ => (self.frame_interval_ms, true),
        };

        inner.slots[index].reset();
        inner.playback_pointer = inner.playback_pointer.max(frame_no + 1);

        let delay_ms = interval - held_ms;
        debug!(frame_no, delay_ms, inferred, held_ms, "slot released");
        Ok(ReleasedSlot { delay_ms, inferred })
    }

    /// Pool occupancy by slot state.
    pub fn state_counts(&self) -> BufferStateCounts {
        let inner = self.inner.lock().expect("buffer lock poisoned");
        let mut counts = BufferStateCounts::default();
        for slot in &inner.slots {
            match slot.state {
                SlotState::Free => counts.free += 1,
                SlotState::Assembling => counts.assembling += 1,
                SlotState::Ready => counts.ready += 1,
                SlotState::Locked => counts.locked += 1,
            }
        }
        counts
    }

    /// Next frame number playout expects; arrivals below it are late.
    pub fn playback_pointer(&self) -> FrameNumber {
        self.inner.lock().expect("buffer lock poisoned").playback_pointer
    }

    fn admit_frame(&self, inner: &mut BufferInner, segment: &SegmentData) -> Option<usize> {
        if let Some(index) = inner.slots.iter().position(|s| s.state == SlotState::Free) {
            inner.slots[index].begin_assembly(segment);
            return Some(index);
        }

        // Pool exhausted: reclaim per policy. Locked and Ready frames are
        // never stolen from under the reader.
        let victim = match self.eviction {
            EvictionPolicy::OldestFrame => inner
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.state == SlotState::Assembling)
                .min_by_key(|(_, s)| s.frame_no)
                .map(|(i, _)| i),
        };

        let index = victim?;
        let evicted = inner.slots[index].frame_no;
        if evicted >= segment.frame_no {
            // The newcomer is older than everything assembling; admitting
            // it would evict fresher data.
            return None;
        }
        FetchCounters::increment(&self.counters.slots_evicted);
        warn!(evicted, admitted = segment.frame_no, "slot pool exhausted, evicting oldest");
        inner.slots[index].begin_assembly(segment);
        Some(index)
    }

    fn write_segment(
        &self,
        inner: &mut BufferInner,
        index: usize,
        segment: SegmentData,
    ) -> SegmentWrite {
        let slot = &mut inner.slots[index];
        match slot.state {
            SlotState::Ready | SlotState::Locked => return SegmentWrite::RejectedClosed,
            SlotState::Free => unreachable!("write routed to a free slot"),
            SlotState::Assembling => {}
        }

        if segment.segment_no >= slot.total {
            warn!(
                frame_no = slot.frame_no,
                segment_no = segment.segment_no,
                total = slot.total,
                "segment index out of declared range"
            );
            return SegmentWrite::RejectedOversize;
        }
        if slot.segments[segment.segment_no].is_some() {
            return SegmentWrite::Duplicate;
        }
        if slot.bytes_assembled + segment.payload.len() > self.slot_size {
            warn!(
                frame_no = slot.frame_no,
                bytes = slot.bytes_assembled + segment.payload.len(),
                slot_size = self.slot_size,
                "frame exceeds slot size"
            );
            return SegmentWrite::RejectedOversize;
        }

        slot.bytes_assembled += segment.payload.len();
        slot.segments[segment.segment_no] = Some(segment.payload);
        slot.assembled += 1;

        if slot.assembled == slot.total {
            slot.state = SlotState::Ready;
            trace!(
                frame_no = slot.frame_no,
                assembling_ms = slot.assembling_started.elapsed().as_millis() as u64,
                "frame ready"
            );
            SegmentWrite::Completed
        } else {
            SegmentWrite::Admitted
        }
    }
}
