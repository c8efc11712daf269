//! Video frame packets.
//!
//! A [`VideoFramePacket`] is a [`DataPacket`] whose first blob is the
//! fixed-layout frame header and whose trailing payload is the encoded
//! frame bytes. Two optional blob groups follow the frame header on the
//! wire:
//!
//! ```text
//! [frame header:22][sync name][sync packet no]...[sample header:16][payload]
//! ```
//!
//! - the *sync list*: alternating (sibling stream name, packet number)
//!   blob pairs used for AV-sync cross-referencing;
//! - the common [`SampleHeader`], appended last when the packet is
//!   finalized for publishing. Its presence is recoverable on decode from
//!   blob-count parity: `1 + 2k` blobs without it, `1 + 2k + 1` with it.
//!
//! The sync list can be set at most once, and only before the sample
//! header is finalized; after that the packet is sealed.

use std::collections::BTreeMap;

use super::{DataPacket, NetworkData, SampleHeader, SAMPLE_HEADER_LENGTH};
use crate::{fec, Result, RtcError};

/// Wire size of the video frame header blob.
pub const VIDEO_FRAME_HEADER_LENGTH: usize = 22;

/// Sequence number of a packet within a media thread.
pub type PacketNumber = u32;

/// Encoded frame kind, one wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Delta = 0,
    Key = 1,
}

impl FrameType {
    fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(FrameType::Delta),
            1 => Ok(FrameType::Key),
            other => Err(RtcError::codec("frame header", format!("unknown frame type {other}"))),
        }
    }
}

/// Fixed-layout video frame header (22 bytes, all little-endian).
///
/// ```text
/// [encoded_width:u32][encoded_height:u32][timestamp:u32]
/// [capture_time_ms:i64][frame_type:u8][complete_frame:u8]
/// ```
///
/// Field widths are part of the wire contract and must match across
/// producer and consumer builds exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrameHeader {
    pub encoded_width: u32,
    pub encoded_height: u32,
    /// RTP-style media timestamp.
    pub timestamp: u32,
    /// Capture wall-clock time, milliseconds.
    pub capture_time_ms: i64,
    pub frame_type: FrameType,
    pub complete_frame: bool,
}

impl VideoFrameHeader {
    pub fn to_bytes(&self) -> [u8; VIDEO_FRAME_HEADER_LENGTH] {
        let mut out = [0u8; VIDEO_FRAME_HEADER_LENGTH];
        out[0..4].copy_from_slice(&self.encoded_width.to_le_bytes());
        out[4..8].copy_from_slice(&self.encoded_height.to_le_bytes());
        out[8..12].copy_from_slice(&self.timestamp.to_le_bytes());
        out[12..20].copy_from_slice(&self.capture_time_ms.to_le_bytes());
        out[20] = self.frame_type as u8;
        out[21] = u8::from(self.complete_frame);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != VIDEO_FRAME_HEADER_LENGTH {
            return Err(RtcError::codec(
                "frame header",
                format!("expected {VIDEO_FRAME_HEADER_LENGTH} bytes, got {}", bytes.len()),
            ));
        }
        Ok(Self {
            encoded_width: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            encoded_height: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            timestamp: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            capture_time_ms: i64::from_le_bytes(bytes[12..20].try_into().unwrap()),
            frame_type: FrameType::from_wire(bytes[20])?,
            complete_frame: bytes[21] != 0,
        })
    }
}

/// An encoded video frame as a wire packet.
#[derive(Debug, Clone)]
pub struct VideoFramePacket {
    packet: DataPacket,
    sync_list_set: bool,
    header_set: bool,
}

impl VideoFramePacket {
    /// Build a packet from an encoded frame: header blob plus payload.
    pub fn new(header: VideoFrameHeader, payload: &[u8]) -> Self {
        let mut packet = DataPacket::from_payload(payload);
        // 22-byte blob, cannot hit the framing limit
        packet.add_blob(&header.to_bytes()).expect("frame header blob within framing limit");
        Self { packet, sync_list_set: false, header_set: false }
    }

    /// Decode a packet from received network data.
    ///
    /// The result may be invalid; callers must check [`Self::is_valid`]
    /// before reading typed fields.
    pub fn from_network_data(network_data: NetworkData) -> Self {
        let packet = DataPacket::from_network_data(network_data);
        let structurally_valid = packet.is_valid()
            && packet.blob(0).map(|b| b.len() == VIDEO_FRAME_HEADER_LENGTH).unwrap_or(false);
        let header_set = structurally_valid && packet.blob_count() >= 2 && packet.blob_count() % 2 == 0;
        let sync_blobs = packet.blob_count().saturating_sub(1 + usize::from(header_set));
        Self {
            sync_list_set: structurally_valid && sync_blobs > 0,
            header_set,
            packet,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.packet.is_valid()
            && self
                .packet
                .blob(0)
                .map(|b| b.len() == VIDEO_FRAME_HEADER_LENGTH)
                .unwrap_or(false)
    }

    /// Decoded frame header fields.
    pub fn frame_header(&self) -> Result<VideoFrameHeader> {
        if !self.is_valid() {
            return Err(RtcError::codec("video packet", "invalid packet"));
        }
        VideoFrameHeader::from_bytes(self.packet.blob(0).expect("validity checked"))
    }

    /// Encoded frame bytes.
    pub fn payload(&self) -> &[u8] {
        self.packet.payload()
    }

    /// Attach the AV-sync list: sibling stream name → packet number.
    ///
    /// Allowed at most once, and only before the sample header is
    /// finalized.
    pub fn set_sync_list(&mut self, sync_list: &BTreeMap<String, PacketNumber>) -> Result<()> {
        if self.header_set {
            return Err(RtcError::codec("sync list", "sample header already finalized"));
        }
        if self.sync_list_set {
            return Err(RtcError::codec("sync list", "sync list already set"));
        }
        for (name, packet_no) in sync_list {
            self.packet.add_blob(name.as_bytes())?;
            self.packet.add_blob(&packet_no.to_le_bytes())?;
        }
        self.sync_list_set = true;
        Ok(())
    }

    /// Decoded sync list; empty when none was attached.
    pub fn sync_list(&self) -> BTreeMap<String, PacketNumber> {
        let mut list = BTreeMap::new();
        if !self.is_valid() {
            return list;
        }
        // Pairs occupy blobs [1, end); the finalized sample header, when
        // present, is the last blob and excluded here.
        let end = self.packet.blob_count() - usize::from(self.header_set);
        let mut i = 1;
        while i + 1 < end {
            let (name, number) = match (self.packet.blob(i), self.packet.blob(i + 1)) {
                (Some(n), Some(p)) if p.len() == 4 => (n, p),
                _ => break,
            };
            let name = String::from_utf8_lossy(name).into_owned();
            let number = PacketNumber::from_le_bytes(number.try_into().expect("length checked"));
            list.insert(name, number);
            i += 2;
        }
        list
    }

    /// Finalize the packet for publishing by appending the common sample
    /// header. Allowed at most once.
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

    /// Common sample header, when the packet has been finalized.
    pub fn sample_header(&self) -> Option<SampleHeader> {
        if !self.header_set {
            return None;
        }
        let last = self.packet.blob(self.packet.blob_count() - 1)?;
        if last.len() != SAMPLE_HEADER_LENGTH {
            return None;
        }
        SampleHeader::from_bytes(last).ok()
    }

    /// Compute Reed-Solomon parity segments over this packet's wire bytes.
    ///
    /// The packet's own length is unchanged by this call. Requesting
    /// parity on an invalid packet is a hard error: it indicates an
    /// upstream sequencing bug, not a recoverable condition.
    pub fn parity_data(&self, segment_length: usize, ratio: f64) -> Result<NetworkData> {
        if !self.is_valid() {
            return Err(RtcError::FecPrecondition);
        }
        fec::parity_data(self.packet.bytes(), segment_length, ratio)
    }

    /// Total wire length in bytes.
    pub fn len(&self) -> usize {
        self.packet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    /// Full wire bytes.
    pub fn bytes(&self) -> &[u8] {
        self.packet.bytes()
    }

    pub fn into_network_data(self) -> NetworkData {
        self.packet.into_network_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::NetworkData;

    fn test_header() -> VideoFrameHeader {
        VideoFrameHeader {
            encoded_width: 640,
            encoded_height: 480,
            timestamp: 1000,
            capture_time_ms: 1_700_000_000_000,
            frame_type: FrameType::Key,
            complete_frame: true,
        }
    }

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        prop_compose! {
            fn arb_header()(
                encoded_width in 16u32..8192,
                encoded_height in 16u32..8192,
                timestamp in any::<u32>(),
                capture_time_ms in 0i64..2_000_000_000_000,
                is_key in any::<bool>(),
                complete_frame in any::<bool>()
            ) -> VideoFrameHeader {
                VideoFrameHeader {
                    encoded_width,
                    encoded_height,
                    timestamp,
                    capture_time_ms,
                    frame_type: if is_key { FrameType::Key } else { FrameType::Delta },
                    complete_frame,
                }
            }
        }

        proptest! {
            #[test]
            fn header_payload_and_sync_list_round_trip(
                header in arb_header(),
                payload in prop::collection::vec(any::<u8>(), 0..1000),
                sync in prop::collection::btree_map("[a-z]{1,12}", any::<u32>(), 0..4)
            ) {
                let mut packet = VideoFramePacket::new(header, &payload);
                packet.set_sync_list(&sync).unwrap();
                packet
                    .set_header(SampleHeader { sample_rate: 30.0, publish_timestamp_ms: 7 })
                    .unwrap();

                let decoded =
                    VideoFramePacket::from_network_data(NetworkData::from_raw(packet.bytes()));
                prop_assert!(decoded.is_valid());
                prop_assert_eq!(decoded.frame_header().unwrap(), header);
                prop_assert_eq!(decoded.payload(), &payload[..]);
                prop_assert_eq!(decoded.sync_list(), sync);
                prop_assert!(decoded.is_header_set());
                prop_assert_eq!(
                    decoded.sample_header().unwrap().publish_timestamp_ms,
                    7
                );
            }

            #[test]
            fn parity_leaves_packet_length_unchanged(
                header in arb_header(),
                payload in prop::collection::vec(any::<u8>(), 1..2000),
                segment_length in 64usize..512,
                ratio in 0.05f64..1.0
            ) {
                let packet = VideoFramePacket::new(header, &payload);
                let len_before = packet.len();
                let parity = packet.parity_data(segment_length, ratio).unwrap();
                prop_assert_eq!(packet.len(), len_before);
                prop_assert!(!parity.is_empty());
            }
        }
    }

    #[test]
    fn spec_scenario_640x480_round_trip() {
        let packet = VideoFramePacket::new(test_header(), b"ABCD");
        let decoded = VideoFramePacket::from_network_data(NetworkData::from_raw(packet.bytes()));

        assert!(decoded.is_valid());
        let header = decoded.frame_header().unwrap();
        assert_eq!(header.encoded_width, 640);
        assert_eq!(header.encoded_height, 480);
        assert_eq!(header.timestamp, 1000);
        assert_eq!(decoded.payload(), b"ABCD");
        assert!(decoded.sync_list().is_empty());
        assert!(!decoded.is_header_set());
    }

    #[test]
    fn sync_list_is_set_at_most_once() {
        let mut packet = VideoFramePacket::new(test_header(), b"frame");
        let sync: BTreeMap<String, PacketNumber> =
            [("mic".to_string(), 417u32)].into_iter().collect();
        packet.set_sync_list(&sync).unwrap();
        assert!(packet.set_sync_list(&sync).is_err());
    }

    #[test]
    fn sync_list_rejected_after_header_finalized() {
        let mut packet = VideoFramePacket::new(test_header(), b"frame");
        packet
            .set_header(SampleHeader { sample_rate: 30.0, publish_timestamp_ms: 1 })
            .unwrap();
        let sync: BTreeMap<String, PacketNumber> =
            [("mic".to_string(), 1u32)].into_iter().collect();
        assert!(packet.set_sync_list(&sync).is_err());
        assert!(packet
            .set_header(SampleHeader { sample_rate: 30.0, publish_timestamp_ms: 2 })
            .is_err());
    }

    #[test]
    fn parity_on_invalid_packet_is_hard_error() {
        // Truncate mid-blob so the decode invalidates.
        let good = VideoFramePacket::new(test_header(), b"payload");
        let mut bytes = good.bytes().to_vec();
        bytes.truncate(10);
        let invalid = VideoFramePacket::from_network_data(NetworkData::new(bytes));

        assert!(!invalid.is_valid());
        assert!(matches!(
            invalid.parity_data(128, 0.2),
            Err(crate::RtcError::FecPrecondition)
        ));
    }

    #[test]
    fn malformed_frame_type_rejected() {
        let mut bytes = test_header().to_bytes();
        bytes[20] = 9;
        assert!(VideoFrameHeader::from_bytes(&bytes).is_err());
    }
}
