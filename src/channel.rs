//! Channel orchestration.
//!
//! A channel owns the full lifecycle of one media session over one
//! transport. [`ConsumerChannel`] wires the shared interest queue, one
//! fetch pipeline per enabled media kind (reassembly buffer + playout
//! task + application sink), and the AV synchronizer between them.
//! [`ProducerChannel`] is the publish-side glue: it packetizes encoded
//! frames and audio bundles, computes FEC parity, slices wire data into
//! enveloped segments, and hands them to the transport.
//!
//! Start/stop is two-phase: `stop` cancels the channel token (every
//! worker checks it right after each wake-up) and then awaits the playout
//! tasks, so no worker outlives the channel.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::Stream;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{EvictionPolicy, FrameBuffer};
use crate::config::{ConsumerConfig, MediaFetchConfig, ProducerConfig};
use crate::consumer::{
    AudioPacketConsumer, AudioPlaybackSink, EncodedFrameConsumer, SegmentEnvelope, SegmentIntake,
    VideoPlaybackSink,
};
use crate::fec;
use crate::packet::audio::{AudioBundlePacket, AudioSampleBlob};
use crate::packet::meta::MediaStreamMeta;
use crate::packet::video::{FrameType, PacketNumber, VideoFrameHeader, VideoFramePacket};
use crate::packet::SampleHeader;
use crate::playout::{PlaybackSink, Playout};
use crate::queue::InterestQueue;
use crate::stats::{ChannelStatistics, FetchCounters, FetchStatistics};
use crate::sync::{AudioVideoSynchronizer, AvSynchronizer, SyncStream};
use crate::transport::{Interest, NetworkTransport};
use crate::{Result, RtcError};

/// Name of one media stream under the channel prefix.
fn segment_name(prefix: &str, stream: &str, frame_no: u32, segment_no: u16) -> String {
    format!("{prefix}/{stream}/{frame_no}/{segment_no}")
}

fn meta_name(prefix: &str) -> String {
    format!("{prefix}/_meta")
}

fn parity_name(prefix: &str, stream: &str, frame_no: u32, segment_no: usize) -> String {
    format!("{prefix}/{stream}/{frame_no}/parity/{segment_no}")
}

fn stream_label(stream: SyncStream) -> &'static str {
    match stream {
        SyncStream::Video => "video",
        SyncStream::Audio => "audio",
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// One media kind's fetch pipeline inside a consumer channel.
struct FetchPipeline {
    stream: SyncStream,
    config: MediaFetchConfig,
    buffer: Arc<FrameBuffer>,
    counters: Arc<FetchCounters>,
    intake: Arc<SegmentIntake>,
    playout: Option<JoinHandle<()>>,
}

impl FetchPipeline {
    fn new(stream: SyncStream, config: MediaFetchConfig) -> Self {
        let counters = Arc::new(FetchCounters::default());
        let buffer = Arc::new(FrameBuffer::new(
            config.frame_buffer_size,
            config.frame_slot_size,
            config.frame_interval_ms(),
            EvictionPolicy::OldestFrame,
            Arc::clone(&counters),
        ));
        let intake = Arc::new(SegmentIntake::new(Arc::clone(&buffer)));
        Self { stream, config, buffer, counters, intake, playout: None }
    }

    fn start(
        &mut self,
        sink: Box<dyn PlaybackSink>,
        synchronizer: Option<Arc<dyn AvSynchronizer>>,
        cancel: CancellationToken,
    ) {
        let playout = Playout::new(
            Arc::clone(&self.buffer),
            Arc::clone(&self.counters),
            synchronizer,
            self.stream,
            sink,
            self.config.acquire_timeout(),
            cancel,
        );
        self.playout = Some(tokio::spawn(playout.run()));
    }

    fn statistics(&self) -> FetchStatistics {
        let mut stats = self.counters.snapshot();
        stats.buffer = self.buffer.state_counts();
        stats
    }
}

/// Fetch-side session: interest queue, per-media pipelines, playout.
pub struct ConsumerChannel {
    prefix: String,
    config: ConsumerConfig,
    transport: Arc<dyn NetworkTransport>,
    cancel: CancellationToken,
    queue: Option<Arc<InterestQueue>>,
    video: Option<FetchPipeline>,
    audio: Option<FetchPipeline>,
}

impl ConsumerChannel {
    /// Validate the configuration and lay out the enabled pipelines.
    /// Nothing runs until [`Self::start`].
    pub fn new(
        prefix: impl Into<String>,
        config: ConsumerConfig,
        transport: Arc<dyn NetworkTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let video = config.use_video.then(|| FetchPipeline::new(SyncStream::Video, config.video));
        let audio = config.use_audio.then(|| FetchPipeline::new(SyncStream::Audio, config.audio));
        Ok(Self {
            prefix: prefix.into(),
            config,
            transport,
            cancel: CancellationToken::new(),
            queue: None,
            video,
            audio,
        })
    }

    /// Spawn the dispatcher and playout workers.
    ///
    /// Each enabled media kind needs its application consumer; a missing
    /// consumer fails that kind's startup. With `allow_degraded` the
    /// channel keeps running as long as at least one kind started,
    /// otherwise any failure tears the channel down.
    pub fn start(
        &mut self,
        video_consumer: Option<Box<dyn EncodedFrameConsumer>>,
        audio_consumer: Option<Box<dyn AudioPacketConsumer>>,
    ) -> Result<()> {
        if self.queue.is_some() {
            return Err(RtcError::channel_start("channel", "already started"));
        }
        if self.cancel.is_cancelled() {
            return Err(RtcError::Shutdown);
        }

        self.queue =
            Some(InterestQueue::spawn(Arc::clone(&self.transport), self.cancel.child_token()));

        let synchronizer: Option<Arc<dyn AvSynchronizer>> =
            (self.video.is_some() && self.audio.is_some())
                .then(|| Arc::new(AudioVideoSynchronizer::new()) as Arc<dyn AvSynchronizer>);

        let mut failures = Vec::new();
        let mut started = 0usize;

        if let Some(pipeline) = self.video.as_mut() {
            match video_consumer {
                Some(consumer) => {
                    pipeline.start(
                        Box::new(VideoPlaybackSink::new(consumer)),
                        synchronizer.clone(),
                        self.cancel.child_token(),
                    );
                    started += 1;
                }
                None => failures.push(RtcError::channel_start("video", "no frame consumer")),
            }
        }
        if let Some(pipeline) = self.audio.as_mut() {
            match audio_consumer {
                Some(consumer) => {
                    pipeline.start(
                        Box::new(AudioPlaybackSink::new(consumer)),
                        synchronizer.clone(),
                        self.cancel.child_token(),
                    );
                    started += 1;
                }
                None => failures.push(RtcError::channel_start("audio", "no packet consumer")),
            }
        }

        match failures.into_iter().next() {
            None => {
                info!(prefix = %self.prefix, started, "consumer channel started");
                Ok(())
            }
            Some(first) if started > 0 && self.config.allow_degraded => {
                warn!(prefix = %self.prefix, %first, "running degraded single-media");
                Ok(())
            }
            Some(first) => {
                self.cancel.cancel();
                self.queue = None;
                Err(first)
            }
        }
    }

    /// Enqueue fetch requests for every segment of one frame.
    ///
    /// Arriving segments flow through the pipeline's intake into the
    /// reassembly buffer; timeouts are logged and left to the caller's
    /// re-request policy.
    pub fn request_frame(
        &self,
        stream: SyncStream,
        frame_no: u32,
        total_segments: u16,
        priority: u32,
    ) -> Result<()> {
        let queue = self.queue.as_ref().ok_or(RtcError::Shutdown)?;
        let pipeline = self
            .pipeline(stream)
            .ok_or_else(|| RtcError::channel_start(stream_label(stream), "media kind disabled"))?;

        for segment_no in 0..total_segments {
            let name = segment_name(&self.prefix, stream_label(stream), frame_no, segment_no);
            let intake = Arc::clone(&pipeline.intake);
            queue.enqueue(
                Interest::new(name, pipeline.config.interest_lifetime()),
                priority,
                Box::new(move |data| intake.on_segment(data)),
                Box::new(move |interest| {
                    debug!(name = %interest.name, "fetch timed out");
                }),
            )?;
        }
        Ok(())
    }

    /// Fetch and decode the producer's stream metadata roster.
    ///
    /// Bootstrap call, made before frame fetching starts: the roster
    /// names the producer's media threads and its sync-stream pairings.
    /// A fetch timeout here is an error: without the roster the
    /// channel has nothing to request.
    pub async fn fetch_stream_meta(&self, priority: u32) -> Result<MediaStreamMeta> {
        let queue = self.queue.as_ref().ok_or(RtcError::Shutdown)?;
        let lifetime = self
            .video
            .as_ref()
            .or(self.audio.as_ref())
            .map(|p| p.config.interest_lifetime())
            .unwrap_or(Duration::from_secs(4));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        let tx_timeout = Arc::clone(&tx);
        queue.enqueue(
            Interest::new(meta_name(&self.prefix), lifetime),
            priority,
            Box::new(move |data| {
                if let Some(tx) = tx.lock().expect("meta sender lock").take() {
                    let _ = tx.send(Some(data));
                }
            }),
            Box::new(move |_interest| {
                if let Some(tx) = tx_timeout.lock().expect("meta sender lock").take() {
                    let _ = tx.send(None);
                }
            }),
        )?;

        let data = rx
            .await
            .ok()
            .flatten()
            .ok_or_else(|| RtcError::channel_start("meta", "stream metadata fetch timed out"))?;
        let meta = MediaStreamMeta::from_network_data(data);
        if !meta.is_valid() {
            return Err(RtcError::codec("stream meta", "malformed roster packet"));
        }
        Ok(meta)
    }

    /// Periodic statistics sampler as a stream.
    pub fn statistics_stream(&self, period: Duration) -> StatisticsStream<'_> {
        StatisticsStream {
            channel: self,
            interval: IntervalStream::new(tokio::time::interval(period)),
        }
    }

    /// Per-media and queue statistics snapshot.
    pub fn statistics(&self) -> ChannelStatistics {
        ChannelStatistics {
            video: self.video.as_ref().map(FetchPipeline::statistics),
            audio: self.audio.as_ref().map(FetchPipeline::statistics),
            queue: self.queue.as_ref().map(|q| q.statistics()).unwrap_or_default(),
        }
    }

    /// Cancel every worker and wait for the playout tasks to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for pipeline in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            if let Some(handle) = pipeline.playout.take() {
                if let Err(err) = handle.await {
                    warn!(stream = ?pipeline.stream, %err, "playout task panicked");
                }
            }
        }
        self.queue = None;
        info!(prefix = %self.prefix, "consumer channel stopped");
    }

    fn pipeline(&self, stream: SyncStream) -> Option<&FetchPipeline> {
        match stream {
            SyncStream::Video => self.video.as_ref(),
            SyncStream::Audio => self.audio.as_ref(),
        }
    }
}

pin_project_lite::pin_project! {
    /// Yields a [`ChannelStatistics`] snapshot on a fixed period.
    #[must_use = "streams do nothing unless polled"]
    pub struct StatisticsStream<'a> {
        channel: &'a ConsumerChannel,
        #[pin]
        interval: IntervalStream,
    }
}

impl Stream for StatisticsStream<'_> {
    type Item = ChannelStatistics;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.interval.poll_next(cx) {
            Poll::Ready(Some(_)) => Poll::Ready(Some(this.channel.statistics())),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Outcome of publishing one frame or bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedFrame {
    pub frame_no: u32,
    pub data_segments: usize,
    pub parity_segments: usize,
}

/// Publish-side session: packetization, FEC, segmenting.
pub struct ProducerChannel {
    prefix: String,
    config: ProducerConfig,
    transport: Arc<dyn NetworkTransport>,
    video_frame_no: u32,
    audio_bundle_no: u32,
    bundle: AudioBundlePacket,
    bundle_first_ts: Option<i64>,
}

impl ProducerChannel {
    pub fn new(
        prefix: impl Into<String>,
        config: ProducerConfig,
        transport: Arc<dyn NetworkTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let bundle = AudioBundlePacket::new(config.bundle_wire_length);
        Ok(Self {
            prefix: prefix.into(),
            config,
            transport,
            video_frame_no: 0,
            audio_bundle_no: 0,
            bundle,
            bundle_first_ts: None,
        })
    }

    /// Publish the stream metadata roster under the channel prefix.
    pub fn publish_stream_meta(&self, meta: &MediaStreamMeta) -> Result<()> {
        self.transport.publish_segment(
            &meta_name(&self.prefix),
            crate::packet::NetworkData::from_raw(meta.bytes()),
        )
    }

    /// Packetize and publish one encoded video frame: finalize the wire
    /// packet, derive parity, slice into enveloped segments, publish all.
    pub fn publish_frame(
        &mut self,
        header: VideoFrameHeader,
        payload: &[u8],
        sync_list: Option<&BTreeMap<String, PacketNumber>>,
    ) -> Result<PublishedFrame> {
        let mut packet = VideoFramePacket::new(header, payload);
        if let Some(sync_list) = sync_list {
            packet.set_sync_list(sync_list)?;
        }
        packet.set_header(SampleHeader {
            sample_rate: self.config.frame_rate,
            publish_timestamp_ms: unix_millis(),
        })?;

        let parity = if self.config.parity_ratio > 0.0 {
            Some(packet.parity_data(self.config.segment_size, self.config.parity_ratio)?)
        } else {
            None
        };

        let frame_no = self.video_frame_no;
        let paired = sync_list.and_then(|list| list.values().next().copied());
        let data_segments = self.publish_segments(
            "video",
            frame_no,
            packet.bytes(),
            header.frame_type,
            header.capture_time_ms,
            paired,
        )?;
        let parity_segments = match parity {
            Some(parity) => self.publish_parity("video", frame_no, parity.bytes())?,
            None => 0,
        };

        self.video_frame_no += 1;
        debug!(frame_no, data_segments, parity_segments, "video frame published");
        Ok(PublishedFrame { frame_no, data_segments, parity_segments })
    }

    /// Add one audio sample to the pending bundle. When the bundle is
    /// full it is finalized and published first; returns the published
    /// bundle when that happened.
    pub fn publish_sample(&mut self, sample: &AudioSampleBlob) -> Result<Option<PublishedFrame>> {
        let published = if !self.bundle.has_space(sample) && !self.bundle.is_empty() {
            Some(self.flush_bundle()?)
        } else {
            None
        };

        if !self.bundle.push(sample) {
            // A sample that cannot fit an empty bundle can never be
            // published.
            return Err(RtcError::config(format!(
                "sample of {} bytes exceeds bundle capacity {}",
                sample.size(),
                self.config.bundle_wire_length
            )));
        }
        if self.bundle_first_ts.is_none() {
            self.bundle_first_ts = Some(sample.header.timestamp);
        }
        Ok(published)
    }

    /// Finalize and publish the pending bundle, if it holds any samples.
    pub fn flush(&mut self) -> Result<Option<PublishedFrame>> {
        if self.bundle.is_empty() {
            return Ok(None);
        }
        self.flush_bundle().map(Some)
    }

    fn flush_bundle(&mut self) -> Result<PublishedFrame> {
        self.bundle.set_header(SampleHeader {
            sample_rate: self.config.sample_rate,
            publish_timestamp_ms: unix_millis(),
        })?;

        let bundle_no = self.audio_bundle_no;
        let media_ts = self.bundle_first_ts.take().unwrap_or_default();
        let wire = self.bundle.bytes().to_vec();
        let data_segments =
            self.publish_segments("audio", bundle_no, &wire, FrameType::Delta, media_ts, None)?;

        self.bundle.clear();
        self.audio_bundle_no += 1;
        debug!(bundle_no, data_segments, "audio bundle published");
        Ok(PublishedFrame { frame_no: bundle_no, data_segments, parity_segments: 0 })
    }

    fn publish_segments(
        &self,
        stream: &str,
        frame_no: u32,
        wire: &[u8],
        frame_type: FrameType,
        media_timestamp_ms: i64,
        paired: Option<PacketNumber>,
    ) -> Result<usize> {
        let total = fec::data_segment_count(wire.len(), self.config.segment_size);
        if total > u16::MAX as usize {
            return Err(RtcError::codec(
                "segmenter",
                format!("{total} segments exceed the envelope's u16 range"),
            ));
        }
        for (segment_no, slice) in wire.chunks(self.config.segment_size).enumerate() {
            let envelope = SegmentEnvelope::for_frame(
                frame_no,
                segment_no as u16,
                total as u16,
                frame_type,
                media_timestamp_ms,
                paired,
            );
            let name = segment_name(&self.prefix, stream, frame_no, segment_no as u16);
            self.transport
                .publish_segment(&name, crate::packet::NetworkData::new(envelope.wrap(slice)))?;
        }
        Ok(total)
    }

    fn publish_parity(&self, stream: &str, frame_no: u32, parity: &[u8]) -> Result<usize> {
        let mut published = 0;
        for (segment_no, slice) in parity.chunks(self.config.segment_size).enumerate() {
            let name = parity_name(&self.prefix, stream, frame_no, segment_no);
            self.transport
                .publish_segment(&name, crate::packet::NetworkData::new(slice.to_vec()))?;
            published += 1;
        }
        Ok(published)
    }
}
