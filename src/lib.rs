//! Real-time audio/video delivery over named data networking.
//!
//! ndncast moves encoded media between a producer and consumers over an
//! NDN substrate: producers publish frames and audio bundles as immutable,
//! segmented, content-addressed packets; consumers fetch, reassemble and
//! play them back with jitter absorption and audio/video synchronization.
//!
//! # Architecture
//!
//! - **Packet codec** ([`packet`]): blob-structured wire packets for video
//!   frames, audio sample bundles and stream metadata, plus Reed-Solomon
//!   parity ([`fec`]).
//! - **Interest queue** ([`queue`]): priority-ordered outbound fetch
//!   requests drained by a dedicated dispatcher task.
//! - **Reassembly buffer** ([`buffer`]): fixed pool of frame slots with an
//!   acquire/release protocol between network intake and playout.
//! - **Playout scheduler** ([`playout`]): per-frame delay computation
//!   combining jitter timing, inferred-delay correction and AV-sync drift
//!   control ([`sync`]).
//! - **Channels** ([`channel`]): consumer/producer orchestrators tying the
//!   stages to a [`transport::NetworkTransport`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ndncast::{ConsumerChannel, ConsumerConfig, EncodedFrame, EncodedFrameConsumer};
//!
//! struct Renderer;
//!
//! impl EncodedFrameConsumer for Renderer {
//!     fn on_encoded_frame(&mut self, frame: EncodedFrame) {
//!         println!("frame {}x{}", frame.header.encoded_width, frame.header.encoded_height);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> ndncast::Result<()> {
//!     let transport = my_transport(); // your NDN face adapter
//!     let config = ConsumerConfig { use_audio: false, ..Default::default() };
//!     let mut channel = ConsumerChannel::new("/tv/stream", config, transport)?;
//!     channel.start(Some(Box::new(Renderer)), None)?;
//!     // ... request frames as the stream advances ...
//!     channel.stop().await;
//!     Ok(())
//! }
//! # fn my_transport() -> Arc<dyn ndncast::NetworkTransport> { unimplemented!() }
//! ```

pub mod buffer;
pub mod channel;
pub mod config;
pub mod consumer;
mod error;
pub mod fec;
pub mod packet;
pub mod playout;
pub mod queue;
pub mod stats;
pub mod sync;
pub mod transport;

pub use error::{Result, RtcError};

// Wire format exports
pub use packet::audio::{AudioBundlePacket, AudioSampleBlob, AudioSampleHeader};
pub use packet::meta::{AudioThreadMeta, FrameSegmentsInfo, MediaStreamMeta, VideoThreadMeta};
pub use packet::video::{FrameType, PacketNumber, VideoFrameHeader, VideoFramePacket};
pub use packet::{DataPacket, NetworkData, SampleHeader};

// Pipeline exports
pub use buffer::{AcquireResult, AcquiredFrame, FrameBuffer, ReleasedSlot, SegmentData};
pub use playout::{PlaybackSink, Playout, PlayoutTiming};
pub use queue::InterestQueue;
pub use sync::{AudioVideoSynchronizer, AvSynchronizer, SyncStream, MAX_AV_SYNC_ADJUSTMENT_MS};

// Channel API exports
pub use channel::{ConsumerChannel, ProducerChannel, PublishedFrame, StatisticsStream};
pub use config::{ConsumerConfig, MediaFetchConfig, ProducerConfig, VideoCoderParams};
pub use consumer::{
    AudioPacketConsumer, EncodedFrame, EncodedFrameConsumer, SegmentEnvelope, SegmentIntake,
};
pub use stats::{ChannelStatistics, FetchStatistics, QueueStatistics};
pub use transport::{Interest, NetworkTransport, OnData, OnTimeout};
