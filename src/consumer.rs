//! Media consumer hookup.
//!
//! The playout loop hands reassembled wire packets to per-media sinks
//! defined here, which decode them and feed the application's consumer
//! trait objects: whole encoded frames for video, individual RTP/RTCP
//! packets for audio. Decoding failures are reported to the scheduler as
//! an invalid playback (the frame is skipped), never as a pipeline error.
//!
//! This module also owns the segment envelope: the small fixed prelude the
//! producer prepends to every published network segment so the consumer
//! can route it into the reassembly buffer (frame number, segment index,
//! totals, key flag, media timestamp, paired packet number) without
//! decoding the frame first.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::buffer::{AcquiredFrame, FrameBuffer, SegmentData};
use crate::packet::audio::AudioBundlePacket;
use crate::packet::video::{FrameType, PacketNumber, VideoFrameHeader, VideoFramePacket};
use crate::packet::{NetworkData, SampleHeader};
use crate::playout::PlaybackSink;
use crate::{Result, RtcError};

/// A decoded video frame delivered to the application.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub header: VideoFrameHeader,
    pub payload: Vec<u8>,
    /// Common sample header, when the producer finalized the packet.
    pub sample_header: Option<SampleHeader>,
}

/// Application-side video sink (decoder / renderer front end).
pub trait EncodedFrameConsumer: Send + 'static {
    fn on_encoded_frame(&mut self, frame: EncodedFrame);
}

/// Application-side audio sink (RTP playback path).
pub trait AudioPacketConsumer: Send + 'static {
    fn on_rtp_packet(&mut self, timestamp: i64, payload: &[u8]);
    fn on_rtcp_packet(&mut self, timestamp: i64, payload: &[u8]);
}

/// Playback sink decoding video frame packets.
pub struct VideoPlaybackSink {
    consumer: Box<dyn EncodedFrameConsumer>,
}

impl VideoPlaybackSink {
    pub fn new(consumer: Box<dyn EncodedFrameConsumer>) -> Self {
        Self { consumer }
    }
}

impl PlaybackSink for VideoPlaybackSink {
    fn playback(&mut self, frame: &AcquiredFrame) -> bool {
        let packet = VideoFramePacket::from_network_data(NetworkData::from_raw(&frame.payload));
        if !packet.is_valid() {
            warn!(frame_no = frame.frame_no, "reassembled video packet invalid, skipping");
            return false;
        }
        let header = match packet.frame_header() {
            Ok(header) => header,
            Err(err) => {
                warn!(frame_no = frame.frame_no, %err, "video frame header rejected");
                return false;
            }
        };
        self.consumer.on_encoded_frame(EncodedFrame {
            header,
            payload: packet.payload().to_vec(),
            sample_header: packet.sample_header(),
        });
        true
    }
}

/// Playback sink unpacking audio bundles into RTP/RTCP packets.
pub struct AudioPlaybackSink {
    consumer: Box<dyn AudioPacketConsumer>,
}

impl AudioPlaybackSink {
    pub fn new(consumer: Box<dyn AudioPacketConsumer>) -> Self {
        Self { consumer }
    }
}

impl PlaybackSink for AudioPlaybackSink {
    fn playback(&mut self, frame: &AcquiredFrame) -> bool {
        let bundle = AudioBundlePacket::from_network_data(NetworkData::from_raw(&frame.payload));
        if !bundle.is_valid() {
            warn!(frame_no = frame.frame_no, "reassembled audio bundle invalid, skipping");
            return false;
        }
        for sample in bundle.samples() {
            if sample.header.is_rtcp {
                self.consumer.on_rtcp_packet(sample.header.timestamp, &sample.payload);
            } else {
                self.consumer.on_rtp_packet(sample.header.timestamp, &sample.payload);
            }
        }
        true
    }
}

/// Wire size of the per-segment prelude.
pub const SEGMENT_ENVELOPE_LENGTH: usize = 21;

/// Fixed prelude on every published network segment.
///
/// ```text
/// [frame_no:u32][segment_no:u16][total_segments:u16][flags:u8]
/// [media_timestamp_ms:i64][paired_packet_no:u32]
/// ```
///
/// All little-endian. Flag bit 0 marks a key frame, bit 1 marks the
/// paired packet number as present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentEnvelope {
    pub frame_no: u32,
    pub segment_no: u16,
    pub total_segments: u16,
    pub is_key: bool,
    pub media_timestamp_ms: i64,
    pub paired_packet_no: Option<PacketNumber>,
}

impl SegmentEnvelope {
    /// Wrap one slice of frame wire data for publishing.
    pub fn wrap(&self, slice: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(SEGMENT_ENVELOPE_LENGTH + slice.len());
        out.extend_from_slice(&self.frame_no.to_le_bytes());
        out.extend_from_slice(&self.segment_no.to_le_bytes());
        out.extend_from_slice(&self.total_segments.to_le_bytes());
        let mut flags = u8::from(self.is_key);
        if self.paired_packet_no.is_some() {
            flags |= 0x2;
        }
        out.push(flags);
        out.extend_from_slice(&self.media_timestamp_ms.to_le_bytes());
        out.extend_from_slice(&self.paired_packet_no.unwrap_or(0).to_le_bytes());
        out.extend_from_slice(slice);
        out
    }

    /// Split a received segment into its prelude and the frame slice.
    pub fn unwrap(bytes: &[u8]) -> Result<(Self, &[u8])> {
        if bytes.len() < SEGMENT_ENVELOPE_LENGTH {
            return Err(RtcError::codec(
                "segment envelope",
                format!("expected at least {SEGMENT_ENVELOPE_LENGTH} bytes, got {}", bytes.len()),
            ));
        }
        let flags = bytes[8];
        let paired = PacketNumber::from_le_bytes(bytes[17..21].try_into().unwrap());
        let envelope = Self {
            frame_no: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            segment_no: u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
            total_segments: u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
            is_key: flags & 0x1 != 0,
            media_timestamp_ms: i64::from_le_bytes(bytes[9..17].try_into().unwrap()),
            paired_packet_no: (flags & 0x2 != 0).then_some(paired),
        };
        if envelope.total_segments == 0 || envelope.segment_no >= envelope.total_segments {
            return Err(RtcError::codec(
                "segment envelope",
                format!(
                    "segment {} out of range for {} total",
                    envelope.segment_no, envelope.total_segments
                ),
            ));
        }
        Ok((envelope, &bytes[SEGMENT_ENVELOPE_LENGTH..]))
    }

    /// Envelope for a frame's slice, from the frame-level facts.
    pub fn for_frame(
        frame_no: u32,
        segment_no: u16,
        total_segments: u16,
        frame_type: FrameType,
        media_timestamp_ms: i64,
        paired_packet_no: Option<PacketNumber>,
    ) -> Self {
        Self {
            frame_no,
            segment_no,
            total_segments,
            is_key: frame_type == FrameType::Key,
            media_timestamp_ms,
            paired_packet_no,
        }
    }
}

/// Routes fetched segments into the reassembly buffer.
///
/// Runs inside transport data callbacks, on whatever thread the network
/// layer delivers them; everything here is synchronous and lock-bounded by
/// the buffer.
pub struct SegmentIntake {
    buffer: Arc<FrameBuffer>,
}

impl SegmentIntake {
    pub fn new(buffer: Arc<FrameBuffer>) -> Self {
        Self { buffer }
    }

    /// Parse and buffer one fetched segment. Malformed segments are
    /// dropped with a warning; rejection outcomes are the buffer's normal
    /// steady-state signals.
    pub fn on_segment(&self, data: NetworkData) {
        if !data.is_valid() {
            warn!("invalid network data dropped at intake");
            return;
        }
        let (envelope, slice) = match SegmentEnvelope::unwrap(data.bytes()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%err, "segment envelope rejected");
                return;
            }
        };
        let outcome = self.buffer.push_segment(SegmentData {
            frame_no: envelope.frame_no,
            segment_no: envelope.segment_no as usize,
            total_segments: envelope.total_segments as usize,
            is_key: envelope.is_key,
            media_timestamp_ms: envelope.media_timestamp_ms,
            paired_packet_no: envelope.paired_packet_no,
            payload: slice.to_vec(),
        });
        trace!(
            frame_no = envelope.frame_no,
            segment_no = envelope.segment_no,
            ?outcome,
            "segment buffered"
        );
    }
}
