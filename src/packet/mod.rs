//! Wire packet codec for named-data media packets.
//!
//! Every object published to the network is a self-describing binary blob
//! sequence with the following layout:
//!
//! ```text
//! packet  = [blob_count:u8][blob 0]...[blob N-1][trailing payload]
//! blob    = [len_low:u8][len_high:u8][bytes:len]     (u16 little-endian)
//! ```
//!
//! Bytes remaining after the last framed blob are the packet's *payload*
//! (unframed trailing data). The format is shared by video frames, audio
//! sample bundles and stream metadata; see [`video`], [`audio`] and
//! [`meta`] for the typed packets built on top of it.
//!
//! # Ownership and blob views
//!
//! A [`DataPacket`] exclusively owns its byte buffer. Blob views are
//! explicit `(offset, len)` index pairs into that buffer, never raw
//! references: the whole index is recomputed by [`DataPacket::reindex`]
//! after every mutation, so a view can never dangle across an insert.
//!
//! # Validity
//!
//! Decoding a buffer whose declared blob framing runs past the buffer end
//! marks the packet invalid and clears the blob index entirely; there is
//! no partial blob list. Invalid packets must never be interpreted as
//! typed packets; typed constructors check validity first.

pub mod audio;
pub mod meta;
pub mod video;

use tracing::trace;

use crate::{Result, RtcError};

/// Maximum byte length of a single framed blob (u16 length prefix).
pub const MAX_BLOB_LENGTH: usize = u16::MAX as usize;

/// Maximum number of framed blobs in one packet (u8 count byte).
pub const MAX_BLOB_COUNT: usize = u8::MAX as usize;

/// Wire size of the common sample header blob, see [`SampleHeader`].
pub const SAMPLE_HEADER_LENGTH: usize = 16;

/// Immutable-once-built owner of a contiguous wire byte sequence.
///
/// `NetworkData` is the raw currency of the pipeline: segment payloads
/// arriving from the network, parity data produced by the FEC encoder,
/// reassembled frames handed to the codec. The validity flag travels with
/// the bytes; data flagged invalid must never be parsed as a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkData {
    data: Vec<u8>,
    is_valid: bool,
}

impl NetworkData {
    /// Take ownership of a byte buffer as valid network data.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, is_valid: true }
    }

    /// Copy raw bytes into owned network data.
    pub fn from_raw(raw: &[u8]) -> Self {
        Self { data: raw.to_vec(), is_valid: true }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub(crate) fn mark_invalid(&mut self) {
        self.is_valid = false;
    }
}

/// Non-owning view into a packet's buffer: an `(offset, len)` index pair.
///
/// Valid only against the packet that produced it; every mutation of the
/// packet rebuilds the index, so views are not held across inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobIndex {
    offset: usize,
    len: usize,
}

impl BlobIndex {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A blob-framed wire packet over an owned byte buffer.
///
/// Blob insertion is append-only and re-parses the whole buffer after each
/// insert to rebuild the blob index. That trades incremental-update
/// performance for simplicity; packets are constructed once before
/// transmission, so the re-parse cost is paid off the hot path.
#[derive(Debug, Clone)]
pub struct DataPacket {
    data: Vec<u8>,
    is_valid: bool,
    blobs: Vec<BlobIndex>,
    payload_offset: usize,
}

impl DataPacket {
    /// Create an empty packet (zero blobs, empty payload).
    pub fn new() -> Self {
        Self { data: vec![0], is_valid: true, blobs: Vec::new(), payload_offset: 1 }
    }

    /// Create a packet with a trailing payload and no blobs.
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(1 + payload.len());
        data.push(0);
        data.extend_from_slice(payload);
        Self { data, is_valid: true, blobs: Vec::new(), payload_offset: 1 }
    }

    /// Decode a packet from received network data.
    ///
    /// Framing is validated by a full parse; on overrun the packet comes
    /// back flagged invalid with an empty blob index.
    pub fn from_network_data(network_data: NetworkData) -> Self {
        let is_valid = network_data.is_valid();
        let mut packet = Self {
            data: network_data.into_bytes(),
            is_valid,
            blobs: Vec::new(),
            payload_offset: 0,
        };
        packet.reindex();
        packet
    }

    /// Consume the packet back into raw network data.
    pub fn into_network_data(self) -> NetworkData {
        NetworkData { data: self.data, is_valid: self.is_valid }
    }

    /// Total wire length of the packet in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// Full wire bytes, exactly as transmitted.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of framed blobs.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Bounds-validated access to blob `index`.
    pub fn blob(&self, index: usize) -> Option<&[u8]> {
        let b = self.blobs.get(index)?;
        self.data.get(b.offset..b.offset + b.len)
    }

    /// Iterate over all blob byte slices in wire order.
    pub fn blobs(&self) -> impl Iterator<Item = &[u8]> {
        self.blobs.iter().filter_map(|b| self.data.get(b.offset..b.offset + b.len))
    }

    /// Unframed trailing payload bytes.
    pub fn payload(&self) -> &[u8] {
        self.data.get(self.payload_offset..).unwrap_or(&[])
    }

    /// Append a blob ahead of the payload.
    ///
    /// Zero-length blobs are a no-op, mirroring the wire rule that a blob
    /// always carries at least one byte. Fails if the blob exceeds the
    /// u16 framing limit or the packet already holds [`MAX_BLOB_COUNT`]
    /// blobs.
    pub fn add_blob(&mut self, blob: &[u8]) -> Result<()> {
        if blob.is_empty() {
            return Ok(());
        }
        if blob.len() > MAX_BLOB_LENGTH {
            return Err(RtcError::codec(
                "add_blob",
                format!("blob of {} bytes exceeds framing limit {MAX_BLOB_LENGTH}", blob.len()),
            ));
        }
        if self.data[0] as usize == MAX_BLOB_COUNT {
            return Err(RtcError::codec(
                "add_blob",
                format!("packet already holds the framing limit of {MAX_BLOB_COUNT} blobs"),
            ));
        }

        self.data[0] += 1;
        let len = blob.len() as u16;
        let mut framed = Vec::with_capacity(2 + blob.len());
        framed.extend_from_slice(&len.to_le_bytes());
        framed.extend_from_slice(blob);
        self.data.splice(self.payload_offset..self.payload_offset, framed);
        self.reindex();
        Ok(())
    }

    /// Re-parse the whole buffer and rebuild the blob index.
    ///
    /// Called after every mutation. A framing overrun invalidates the
    /// packet and clears the index; no partial blob list survives.
    pub(crate) fn reindex(&mut self) {
        self.blobs.clear();
        if self.data.is_empty() {
            self.is_valid = false;
            return;
        }

        let blob_count = self.data[0] as usize;
        let mut pos = 1usize;

        for _ in 0..blob_count {
            if pos + 2 > self.data.len() {
                trace!(pos, len = self.data.len(), "blob length prefix past buffer end");
                self.is_valid = false;
                self.blobs.clear();
                return;
            }
            let blob_len = u16::from_le_bytes([self.data[pos], self.data[pos + 1]]) as usize;
            pos += 2;
            if pos + blob_len > self.data.len() {
                trace!(pos, blob_len, len = self.data.len(), "blob framing past buffer end");
                self.is_valid = false;
                self.blobs.clear();
                return;
            }
            self.blobs.push(BlobIndex { offset: pos, len: blob_len });
            pos += blob_len;
        }

        self.payload_offset = pos;
    }

    /// Exact wire cost of a payload plus one optional blob.
    ///
    /// Bit-exact with the encoder output; upstream segmenters rely on it
    /// to decide segment boundaries before serialization.
    pub fn wire_length_with_blob(payload_length: usize, blob_length: usize) -> usize {
        let mut wire_length = 1 + payload_length;
        if blob_length > 0 {
            wire_length += 2 + blob_length;
        }
        wire_length
    }

    /// Exact wire cost of a payload plus a set of blobs.
    pub fn wire_length_with_blobs(payload_length: usize, blob_lengths: &[usize]) -> usize {
        let mut wire_length = 1 + payload_length;
        for &b in blob_lengths {
            if b > 0 {
                wire_length += 2 + b;
            }
        }
        wire_length
    }

    /// Framed cost of a single blob (zero for an empty blob).
    pub fn blob_wire_length(blob_length: usize) -> usize {
        if blob_length > 0 { blob_length + 2 } else { 0 }
    }
}

impl Default for DataPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// Common sample header carried as the final blob of every published
/// media sample packet (16 bytes, little-endian).
///
/// ```text
/// [sample_rate:f64][publish_timestamp_ms:i64]
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleHeader {
    /// Producer's nominal sample/frame rate in Hz.
    pub sample_rate: f64,
    /// Producer-side publish timestamp, milliseconds.
    pub publish_timestamp_ms: i64,
}

impl SampleHeader {
    pub fn to_bytes(&self) -> [u8; SAMPLE_HEADER_LENGTH] {
        let mut out = [0u8; SAMPLE_HEADER_LENGTH];
        out[0..8].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[8..16].copy_from_slice(&self.publish_timestamp_ms.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SAMPLE_HEADER_LENGTH {
            return Err(RtcError::codec(
                "sample header",
                format!("expected {SAMPLE_HEADER_LENGTH} bytes, got {}", bytes.len()),
            ));
        }
        Ok(Self {
            sample_rate: f64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            publish_timestamp_ms: i64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn blob_round_trip_preserves_count_sizes_and_contents(
                blobs in prop::collection::vec(
                    prop::collection::vec(any::<u8>(), 1..200), 0..8),
                payload in prop::collection::vec(any::<u8>(), 0..200)
            ) {
                let mut packet = DataPacket::from_payload(&payload);
                for blob in &blobs {
                    packet.add_blob(blob).unwrap();
                }

                let decoded =
                    DataPacket::from_network_data(NetworkData::from_raw(packet.bytes()));
                prop_assert!(decoded.is_valid());
                prop_assert_eq!(decoded.blob_count(), blobs.len());
                for (i, blob) in blobs.iter().enumerate() {
                    prop_assert_eq!(decoded.blob(i).unwrap(), &blob[..]);
                }
                prop_assert_eq!(decoded.payload(), &payload[..]);
            }

            #[test]
            fn wire_length_matches_encoder_output(
                blob_lengths in prop::collection::vec(0usize..300, 0..6),
                payload_length in 0usize..300
            ) {
                let payload = vec![0xABu8; payload_length];
                let mut packet = DataPacket::from_payload(&payload);
                for &len in &blob_lengths {
                    packet.add_blob(&vec![0xCD; len]).unwrap();
                }
                prop_assert_eq!(
                    DataPacket::wire_length_with_blobs(payload_length, &blob_lengths),
                    packet.len()
                );
            }

            #[test]
            fn truncated_framing_invalidates_and_clears_blobs(
                blob in prop::collection::vec(any::<u8>(), 4..100),
                cut in 1usize..3
            ) {
                let mut packet = DataPacket::new();
                packet.add_blob(&blob).unwrap();

                // Chop the tail so the declared blob length overruns.
                let mut bytes = packet.bytes().to_vec();
                bytes.truncate(bytes.len() - cut);

                let decoded = DataPacket::from_network_data(NetworkData::new(bytes));
                prop_assert!(!decoded.is_valid());
                prop_assert_eq!(decoded.blob_count(), 0);
            }
        }
    }

    #[test]
    fn empty_packet_is_one_zero_byte() {
        let packet = DataPacket::new();
        assert!(packet.is_valid());
        assert_eq!(packet.bytes(), &[0]);
        assert_eq!(packet.blob_count(), 0);
        assert!(packet.payload().is_empty());
    }

    #[test]
    fn zero_length_blob_insert_is_noop() {
        let mut packet = DataPacket::from_payload(b"data");
        packet.add_blob(&[]).unwrap();
        assert_eq!(packet.blob_count(), 0);
        assert_eq!(packet.payload(), b"data");
    }

    #[test]
    fn blob_count_stops_at_the_count_byte_limit() {
        let mut packet = DataPacket::from_payload(b"tail");
        for i in 0..MAX_BLOB_COUNT {
            packet.add_blob(&[i as u8]).unwrap();
        }
        // One more would wrap the u8 count byte on the wire.
        assert!(packet.add_blob(&[0xFF]).is_err());
        assert_eq!(packet.blob_count(), MAX_BLOB_COUNT);

        let decoded = DataPacket::from_network_data(NetworkData::from_raw(packet.bytes()));
        assert!(decoded.is_valid());
        assert_eq!(decoded.blob_count(), MAX_BLOB_COUNT);
        assert_eq!(decoded.blob(MAX_BLOB_COUNT - 1).unwrap(), &[(MAX_BLOB_COUNT - 1) as u8]);
        assert_eq!(decoded.payload(), b"tail");
    }

    #[test]
    fn oversized_blob_is_rejected() {
        let mut packet = DataPacket::new();
        let huge = vec![0u8; MAX_BLOB_LENGTH + 1];
        assert!(packet.add_blob(&huge).is_err());
        // Packet untouched by the failed insert.
        assert_eq!(packet.bytes(), &[0]);
    }

    #[test]
    fn declared_count_exceeding_data_invalidates() {
        // Claims 3 blobs but carries none.
        let decoded = DataPacket::from_network_data(NetworkData::new(vec![3]));
        assert!(!decoded.is_valid());
        assert_eq!(decoded.blob_count(), 0);
    }

    #[test]
    fn wire_length_helpers_agree_with_each_other() {
        assert_eq!(DataPacket::wire_length_with_blob(10, 0), 11);
        assert_eq!(DataPacket::wire_length_with_blob(10, 5), 18);
        assert_eq!(DataPacket::wire_length_with_blobs(10, &[5, 0, 3]), 11 + 7 + 5);
        assert_eq!(DataPacket::blob_wire_length(0), 0);
        assert_eq!(DataPacket::blob_wire_length(7), 9);
    }

    #[test]
    fn invalid_network_data_stays_invalid_through_decode() {
        let mut nd = NetworkData::from_raw(&[1, 2, 0, 0xAA, 0xBB]);
        nd.mark_invalid();
        let decoded = DataPacket::from_network_data(nd);
        assert!(!decoded.is_valid());
    }

    #[test]
    fn sample_header_round_trip() {
        let hdr = SampleHeader { sample_rate: 48000.0, publish_timestamp_ms: 1_234_567 };
        let decoded = SampleHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(decoded, hdr);
        assert!(SampleHeader::from_bytes(&[0u8; 5]).is_err());
    }
}
