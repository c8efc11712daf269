//! Audio sample bundles.
//!
//! Audio samples are small; fetching one network object per sample would
//! drown the pipeline in per-packet overhead. An [`AudioBundlePacket`]
//! therefore packs a run of samples into one wire packet, bounded by a
//! target wire length chosen to fit a network segment:
//!
//! ```text
//! [count:u8][sample blob]...[sample blob][sample header:16]
//! sample blob = [len:u16 LE][AudioSampleHeader:9][raw sample bytes]
//! ```
//!
//! Capacity is enforced at insert time: the bundle reserves framed space
//! for the final common [`SampleHeader`] up front, [`AudioBundlePacket::
//! has_space`] predicts admission exactly, and an insert without space is
//! a no-op, so total wire length never exceeds the configured capacity.

use tracing::trace;

use super::{DataPacket, NetworkData, SampleHeader, SAMPLE_HEADER_LENGTH};
use crate::{Result, RtcError};

/// Wire size of the per-sample header prefixed to each sample's bytes.
pub const AUDIO_SAMPLE_HEADER_LENGTH: usize = 9;

/// Per-sample header (9 bytes, little-endian): `[flags:u8][timestamp:i64]`.
///
/// Bit 0 of `flags` marks an RTCP packet; everything else is RTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSampleHeader {
    pub is_rtcp: bool,
    /// Producer-side capture timestamp, milliseconds.
    pub timestamp: i64,
}

impl AudioSampleHeader {
    pub fn to_bytes(&self) -> [u8; AUDIO_SAMPLE_HEADER_LENGTH] {
        let mut out = [0u8; AUDIO_SAMPLE_HEADER_LENGTH];
        out[0] = u8::from(self.is_rtcp);
        out[1..9].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < AUDIO_SAMPLE_HEADER_LENGTH {
            return Err(RtcError::codec(
                "audio sample header",
                format!("expected {AUDIO_SAMPLE_HEADER_LENGTH} bytes, got {}", bytes.len()),
            ));
        }
        Ok(Self {
            is_rtcp: bytes[0] & 0x1 != 0,
            timestamp: i64::from_le_bytes(bytes[1..9].try_into().unwrap()),
        })
    }
}

/// One audio sample: per-sample header plus raw sample bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSampleBlob {
    pub header: AudioSampleHeader,
    pub payload: Vec<u8>,
}

impl AudioSampleBlob {
    pub fn new(header: AudioSampleHeader, payload: &[u8]) -> Self {
        Self { header, payload: payload.to_vec() }
    }

    /// Size of the sample on the wire, header included, framing excluded.
    pub fn size(&self) -> usize {
        AUDIO_SAMPLE_HEADER_LENGTH + self.payload.len()
    }

    /// Wire size of a sample with the given raw payload length.
    pub fn wire_length(payload_length: usize) -> usize {
        payload_length + AUDIO_SAMPLE_HEADER_LENGTH
    }

    fn from_blob(blob: &[u8]) -> Result<Self> {
        let header = AudioSampleHeader::from_bytes(blob)?;
        Ok(Self { header, payload: blob[AUDIO_SAMPLE_HEADER_LENGTH..].to_vec() })
    }
}

/// A fixed-capacity bundle of audio samples.
#[derive(Debug, Clone)]
pub struct AudioBundlePacket {
    packet: DataPacket,
    wire_capacity: usize,
    remaining_space: usize,
    header_set: bool,
}

impl AudioBundlePacket {
    /// Create an empty bundle bounded by `wire_capacity` total bytes.
    pub fn new(wire_capacity: usize) -> Self {
        let mut bundle = Self {
            packet: DataPacket::new(),
            wire_capacity,
            remaining_space: 0,
            header_set: false,
        };
        bundle.clear();
        bundle
    }

    /// Decode a bundle from received network data.
    ///
    /// Published bundles are always finalized, so the trailing 16-byte
    /// blob is the common sample header.
    pub fn from_network_data(network_data: NetworkData) -> Self {
        let packet = DataPacket::from_network_data(network_data);
        let header_set = packet.is_valid()
            && packet.blob_count() > 0
            && packet
                .blob(packet.blob_count() - 1)
                .map(|b| b.len() == SAMPLE_HEADER_LENGTH)
                .unwrap_or(false);
        let wire_capacity = packet.len();
        Self { packet, wire_capacity, remaining_space: 0, header_set }
    }

    pub fn is_valid(&self) -> bool {
        self.packet.is_valid()
    }

    /// Sample bytes admissible within a bundle of `wire_length` bytes,
    /// after the count byte and the framed common header are reserved.
    pub fn payload_capacity(wire_length: usize) -> usize {
        wire_length.saturating_sub(1 + DataPacket::blob_wire_length(SAMPLE_HEADER_LENGTH))
    }

    /// Whether `sample` can be admitted without exceeding capacity.
    pub fn has_space(&self, sample: &AudioSampleBlob) -> bool {
        !self.header_set && self.remaining_space >= 2 + sample.size()
    }

    /// Append a sample. Rejected (no-op, `false`) once remaining space is
    /// insufficient or the bundle has been finalized.
    pub fn push(&mut self, sample: &AudioSampleBlob) -> bool {
        if !self.has_space(sample) {
            trace!(
                sample_size = sample.size(),
                remaining = self.remaining_space,
                "bundle full, sample rejected"
            );
            return false;
        }

        let mut blob = Vec::with_capacity(sample.size());
        blob.extend_from_slice(&sample.header.to_bytes());
        blob.extend_from_slice(&sample.payload);
        // sample fits the bundle so it fits u16 framing
        self.packet.add_blob(&blob).expect("admitted sample within framing limit");
        self.remaining_space -= 2 + sample.size();
        true
    }

    /// Drop all samples and reset capacity accounting.
    pub fn clear(&mut self) {
        self.packet = DataPacket::new();
        self.remaining_space = Self::payload_capacity(self.wire_capacity);
        self.header_set = false;
    }

    /// Number of samples currently bundled.
    pub fn sample_count(&self) -> usize {
        self.packet.blob_count() - usize::from(self.header_set)
    }

    /// Decode sample at `index`.
    pub fn sample(&self, index: usize) -> Option<AudioSampleBlob> {
        if index >= self.sample_count() {
            return None;
        }
        self.packet.blob(index).and_then(|b| AudioSampleBlob::from_blob(b).ok())
    }

    /// Iterate decoded samples in bundle order.
    pub fn samples(&self) -> impl Iterator<Item = AudioSampleBlob> + '_ {
        (0..self.sample_count()).filter_map(|i| self.sample(i))
    }

    /// Finalize the bundle for publishing by appending the common sample
    /// header. Allowed at most once; space for it was reserved up front.
    pub fn set_header(&mut self, header: SampleHeader) -> Result<()> {
        if self.header_set {
            return Err(RtcError::codec("sample header", "header already set"));
        }
        self.packet.add_blob(&header.to_bytes())?;
        self.header_set = true;
        Ok(())
    }

    pub fn is_header_set(&self) -> bool {
        self.header_set
    }

    /// Common sample header, when the bundle has been finalized.
    pub fn sample_header(&self) -> Option<SampleHeader> {
        if !self.header_set {
            return None;
        }
        let last = self.packet.blob(self.packet.blob_count() - 1)?;
        SampleHeader::from_bytes(last).ok()
    }

    /// Exact wire length of a full bundle of `wire_length` capacity packed
    /// with samples of `sample_payload_length` raw bytes each.
    ///
    /// Used by the producer to pick bundle capacities that fill network
    /// segments; bit-exact with the encoder output.
    pub fn wire_length(wire_length: usize, sample_payload_length: usize) -> usize {
        let sample_wire_length = AudioSampleBlob::wire_length(sample_payload_length);
        let n_samples = Self::payload_capacity(wire_length) / (2 + sample_wire_length);
        let mut blob_lengths = vec![sample_wire_length; n_samples];
        blob_lengths.push(SAMPLE_HEADER_LENGTH);
        DataPacket::wire_length_with_blobs(0, &blob_lengths)
    }

    /// Total wire length in bytes.
    pub fn len(&self) -> usize {
        self.packet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }

    /// Full wire bytes.
    pub fn bytes(&self) -> &[u8] {
        self.packet.bytes()
    }

    pub fn into_network_data(self) -> NetworkData {
        self.packet.into_network_data()
    }
}
