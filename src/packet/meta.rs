//! Thread and stream metadata packets.
//!
//! Small fixed-schema packets a producer publishes alongside its media
//! threads so consumers can bootstrap fetching: per-thread rate/codec
//! descriptions and the stream-level thread roster. All are plain
//! [`DataPacket`]s; schemas are enforced at decode time via the validity
//! flag, in keeping with the codec's "check validity before use" rule.

use tracing::trace;

use super::{DataPacket, NetworkData};
use crate::config::VideoCoderParams;
use crate::{Result, RtcError};

/// Marker prefixing a sync-stream entry in a [`MediaStreamMeta`] roster.
const SYNC_MARKER: &str = "sync:";

/// Wire size of the video thread meta blob.
pub const VIDEO_THREAD_META_LENGTH: usize = 56;

/// Average segment counts per frame class, advertised by the producer so
/// consumers can size their first interest pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameSegmentsInfo {
    pub delta_avg_segments: f64,
    pub delta_avg_parity_segments: f64,
    pub key_avg_segments: f64,
    pub key_avg_parity_segments: f64,
}

/// Audio thread description: sample rate plus codec name.
#[derive(Debug, Clone)]
pub struct AudioThreadMeta {
    packet: DataPacket,
    is_valid: bool,
}

impl AudioThreadMeta {
    pub fn new(rate: f64, codec: &str) -> Self {
        let mut packet = DataPacket::new();
        let mut is_valid = true;
        packet.add_blob(&rate.to_le_bytes()).expect("8-byte blob");
        if codec.is_empty() {
            is_valid = false;
        } else if packet.add_blob(codec.as_bytes()).is_err() {
            is_valid = false;
        }
        Self { packet, is_valid }
    }

    pub fn from_network_data(network_data: NetworkData) -> Self {
        let packet = DataPacket::from_network_data(network_data);
        let is_valid = packet.is_valid()
            && packet.blob_count() == 2
            && packet.blob(0).map(|b| b.len() == 8).unwrap_or(false);
        if !is_valid {
            trace!("audio thread meta failed schema check");
        }
        Self { packet, is_valid }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn rate(&self) -> Result<f64> {
        let blob = self
            .checked_blob(0)?
            .try_into()
            .map_err(|_| RtcError::codec("audio thread meta", "rate blob width"))?;
        Ok(f64::from_le_bytes(blob))
    }

    pub fn codec(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.checked_blob(1)?).into_owned())
    }

    pub fn bytes(&self) -> &[u8] {
        self.packet.bytes()
    }

    fn checked_blob(&self, index: usize) -> Result<&[u8]> {
        if !self.is_valid {
            return Err(RtcError::codec("audio thread meta", "invalid packet"));
        }
        self.packet
            .blob(index)
            .ok_or_else(|| RtcError::codec("audio thread meta", "missing blob"))
    }
}

/// Video thread description: rate, coder parameters and per-class segment
/// statistics in a single 56-byte blob.
///
/// ```text
/// [rate:f64][gop:u32][bitrate:u32][width:u32][height:u32]
/// [delta_avg_seg:f64][delta_avg_parity:f64][key_avg_seg:f64][key_avg_parity:f64]
/// ```
#[derive(Debug, Clone)]
pub struct VideoThreadMeta {
    packet: DataPacket,
    is_valid: bool,
}

impl VideoThreadMeta {
    pub fn new(rate: f64, segments: FrameSegmentsInfo, coder: &VideoCoderParams) -> Self {
        let mut blob = [0u8; VIDEO_THREAD_META_LENGTH];
        blob[0..8].copy_from_slice(&rate.to_le_bytes());
        blob[8..12].copy_from_slice(&coder.gop.to_le_bytes());
        blob[12..16].copy_from_slice(&coder.start_bitrate_kbps.to_le_bytes());
        blob[16..20].copy_from_slice(&coder.encode_width.to_le_bytes());
        blob[20..24].copy_from_slice(&coder.encode_height.to_le_bytes());
        blob[24..32].copy_from_slice(&segments.delta_avg_segments.to_le_bytes());
        blob[32..40].copy_from_slice(&segments.delta_avg_parity_segments.to_le_bytes());
        blob[40..48].copy_from_slice(&segments.key_avg_segments.to_le_bytes());
        blob[48..56].copy_from_slice(&segments.key_avg_parity_segments.to_le_bytes());

        let mut packet = DataPacket::new();
        packet.add_blob(&blob).expect("56-byte blob");
        Self { packet, is_valid: true }
    }

    pub fn from_network_data(network_data: NetworkData) -> Self {
        let packet = DataPacket::from_network_data(network_data);
        let is_valid = packet.is_valid()
            && packet.blob_count() == 1
            && packet.blob(0).map(|b| b.len() == VIDEO_THREAD_META_LENGTH).unwrap_or(false);
        Self { packet, is_valid }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn rate(&self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.meta_blob()?[0..8].try_into().unwrap()))
    }

    pub fn coder_params(&self) -> Result<VideoCoderParams> {
        let blob = self.meta_blob()?;
        Ok(VideoCoderParams {
            gop: u32::from_le_bytes(blob[8..12].try_into().unwrap()),
            start_bitrate_kbps: u32::from_le_bytes(blob[12..16].try_into().unwrap()),
            encode_width: u32::from_le_bytes(blob[16..20].try_into().unwrap()),
            encode_height: u32::from_le_bytes(blob[20..24].try_into().unwrap()),
        })
    }

    pub fn segments_info(&self) -> Result<FrameSegmentsInfo> {
        let blob = self.meta_blob()?;
        Ok(FrameSegmentsInfo {
            delta_avg_segments: f64::from_le_bytes(blob[24..32].try_into().unwrap()),
            delta_avg_parity_segments: f64::from_le_bytes(blob[32..40].try_into().unwrap()),
            key_avg_segments: f64::from_le_bytes(blob[40..48].try_into().unwrap()),
            key_avg_parity_segments: f64::from_le_bytes(blob[48..56].try_into().unwrap()),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        self.packet.bytes()
    }

    fn meta_blob(&self) -> Result<&[u8]> {
        if !self.is_valid {
            return Err(RtcError::codec("video thread meta", "invalid packet"));
        }
        self.packet
            .blob(0)
            .ok_or_else(|| RtcError::codec("video thread meta", "missing blob"))
    }
}

/// Stream-level roster: media thread names plus `sync:`-tagged names of
/// streams this one should synchronize against.
#[derive(Debug, Clone, Default)]
pub struct MediaStreamMeta {
    packet: DataPacket,
}

impl MediaStreamMeta {
    pub fn new() -> Self {
        Self { packet: DataPacket::new() }
    }

    pub fn with_threads<I, S>(threads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut meta = Self::new();
        for t in threads {
            meta.add_thread(t.as_ref());
        }
        meta
    }

    pub fn from_network_data(network_data: NetworkData) -> Self {
        Self { packet: DataPacket::from_network_data(network_data) }
    }

    pub fn is_valid(&self) -> bool {
        self.packet.is_valid()
    }

    pub fn add_thread(&mut self, thread: &str) {
        if self.packet.add_blob(thread.as_bytes()).is_err() {
            trace!(thread, "thread name exceeds framing limit, dropped");
        }
    }

    pub fn add_sync_stream(&mut self, stream: &str) {
        self.add_thread(&format!("{SYNC_MARKER}{stream}"));
    }

    pub fn threads(&self) -> Vec<String> {
        self.entries().filter(|e| !e.starts_with(SYNC_MARKER)).collect()
    }

    pub fn sync_streams(&self) -> Vec<String> {
        self.entries()
            .filter_map(|e| e.strip_prefix(SYNC_MARKER).map(str::to_owned))
            .collect()
    }

    pub fn bytes(&self) -> &[u8] {
        self.packet.bytes()
    }

    fn entries(&self) -> impl Iterator<Item = String> + '_ {
        self.packet.blobs().map(|b| String::from_utf8_lossy(b).into_owned())
    }
}
