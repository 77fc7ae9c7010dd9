//! # Pipeline Controller
//!
//! The façade a playback host talks to. Owns the stream reader, at most one
//! audio and one video sample provider, and the lifecycle:
//!
//! ```text
//!  Idle ──open──► Ready ──seek──► Seeking ──► Ready ──close──► Closed
//! ```
//!
//! Pulls for the two streams may come from different host threads. Each
//! provider sits behind its own lock; the reader serializes access to the
//! packet source. A seek takes both provider locks (audio, then video) so no
//! pull is in flight while the providers are flushed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::decode::{DecoderFactory, SoftwareDecoders};
use crate::descriptor::{audio_plan, video_plan, PresentationDescriptor};
use crate::error::{InteropError, InteropResult};
use crate::packet::{NextSample, StreamKind};
use crate::provider::{create_provider, ProviderVariant, SampleProvider};
use crate::reader::StreamReader;
use crate::source::{self, find_best_stream, IoCallbacks, MediaType, PacketSource, StreamInfo};
use crate::time::from_hns;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Ready,
    Seeking,
    Closed,
}

/// The provider pulling one active stream, `None` once dropped or closed.
type Slot = Mutex<Option<Box<dyn SampleProvider>>>;

pub struct MediaPipeline {
    // Providers are declared before the reader so they drop first.
    audio: Slot,
    video: Slot,
    audio_stream: Option<StreamInfo>,
    video_stream: Option<StreamInfo>,
    reader: StreamReader,
    descriptor: PresentationDescriptor,
    state: Mutex<PipelineState>,
    /// The packet source failed beyond recovery.
    faulted: AtomicBool,
    last_seek: Mutex<Option<i64>>,
}

impl MediaPipeline {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Open a path or `file://` URL with the built-in decoders.
    pub fn open_uri(uri: &str, config: &PipelineConfig) -> InteropResult<Self> {
        let options = config.source_options()?;
        let source = source::open_uri(uri, &options)?;
        Self::from_source(source, config, Arc::new(SoftwareDecoders))
    }

    /// Open a host byte stream with the built-in decoders.
    pub fn open_stream(io: Box<dyn IoCallbacks>, config: &PipelineConfig) -> InteropResult<Self> {
        let options = config.source_options()?;
        let source = source::open_stream(io, &options)?;
        Self::from_source(source, config, Arc::new(SoftwareDecoders))
    }

    /// Build the pipeline over an opened source. Fails when neither an audio
    /// nor a video stream survives provider setup; the source is released
    /// in that case.
    pub fn from_source(
        source: Box<dyn PacketSource>,
        config: &PipelineConfig,
        decoders: Arc<dyn DecoderFactory>,
    ) -> InteropResult<Self> {
        let reader = StreamReader::new(source);
        let streams = reader.streams();

        let mut audio = None;
        let mut audio_desc = None;
        let mut audio_stream = None;
        if let Some(stream) = find_best_stream(&streams, MediaType::Audio) {
            let (descriptor, variant) = audio_plan(stream, config.force_audio_decode);
            if let Some(provider) = start_provider(StreamKind::Audio, stream, variant, &decoders) {
                reader.set_audio_stream(Some(stream.index));
                audio = Some(provider);
                audio_desc = Some(descriptor);
                audio_stream = Some(stream.clone());
            }
        }

        let mut video = None;
        let mut video_desc = None;
        let mut video_stream = None;
        if let Some(stream) = find_best_stream(&streams, MediaType::Video) {
            let (descriptor, variant) = video_plan(stream, config.force_video_decode);
            if let Some(provider) = start_provider(StreamKind::Video, stream, variant, &decoders) {
                reader.set_video_stream(Some(stream.index));
                video = Some(provider);
                video_desc = Some(descriptor);
                video_stream = Some(stream.clone());
            }
        }

        if audio.is_none() && video.is_none() {
            reader.close();
            return Err(InteropError::UnsupportedInput(
                "no playable audio or video stream".into(),
            ));
        }

        let descriptor = PresentationDescriptor::new(reader.duration_us(), audio_desc, video_desc);
        tracing::info!(
            "Pipeline ready ({}): audio {:?}, video {:?}, duration {:?} hns",
            reader.format_name().unwrap_or("unknown"),
            audio.as_ref().map(|p| p.variant()),
            video.as_ref().map(|p| p.variant()),
            descriptor.duration_hns
        );

        Ok(Self {
            audio: Mutex::new(audio),
            video: Mutex::new(video),
            audio_stream,
            video_stream,
            reader,
            descriptor,
            state: Mutex::new(PipelineState::Ready),
            faulted: AtomicBool::new(false),
            last_seek: Mutex::new(None),
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn descriptor(&self) -> &PresentationDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Last seek target acknowledged to the host, in 100 ns units.
    pub fn last_seek(&self) -> Option<i64> {
        *self.last_seek.lock()
    }

    pub fn variant(&self, kind: StreamKind) -> Option<ProviderVariant> {
        self.slot(kind).lock().as_ref().map(|p| p.variant())
    }

    fn slot(&self, kind: StreamKind) -> &Slot {
        match kind {
            StreamKind::Audio => &self.audio,
            StreamKind::Video => &self.video,
        }
    }

    fn is_available(&self) -> bool {
        self.state() != PipelineState::Closed && !self.is_faulted()
    }

    // ========================================================================
    // Sample delivery
    // ========================================================================

    /// Next sample for `kind`. Failures are absorbed into
    /// [`NextSample::Unavailable`]; a source failure also faults the
    /// pipeline so later calls return immediately.
    pub fn get_next_sample(&self, kind: StreamKind) -> NextSample {
        if !self.is_available() {
            return NextSample::Unavailable;
        }

        let mut slot = self.slot(kind).lock();
        let Some(provider) = slot.as_mut() else {
            return NextSample::Unavailable;
        };

        match provider.get_next_sample(&self.reader) {
            Ok(Some(sample)) => NextSample::Ready(sample),
            Ok(None) => NextSample::EndOfStream,
            Err(InteropError::Closed) => NextSample::Unavailable,
            Err(e) if e.is_pipeline_fatal() => {
                tracing::error!("Packet source failed on {} stream: {}", kind, e);
                self.faulted.store(true, Ordering::Release);
                NextSample::Unavailable
            }
            Err(e) => {
                tracing::warn!("No {} sample available: {}", kind, e);
                NextSample::Unavailable
            }
        }
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    /// Seek to `hns` (100 ns units). Returns the position acknowledged to the
    /// host, always the requested one, or `None` when seeking is not
    /// offered: live source, target outside `[0, duration)`, closed or
    /// faulted pipeline.
    pub fn seek(&self, hns: i64) -> Option<i64> {
        if !self.is_available() {
            return None;
        }
        let Some(duration) = self.descriptor.duration_hns else {
            tracing::debug!("Seek to {} ignored: source has no duration", hns);
            return None;
        };
        if !(0..duration).contains(&hns) {
            tracing::warn!("Seek to {} outside [0, {})", hns, duration);
            return None;
        }

        {
            let mut state = self.state.lock();
            if *state == PipelineState::Closed {
                return None;
            }
            *state = PipelineState::Seeking;
        }

        let mut audio = self.audio.lock();
        let mut video = self.video.lock();

        // Video when present, else audio. The source aligns the other track
        // from wherever the reference lands.
        let reference = self.video_stream.as_ref().or(self.audio_stream.as_ref());
        if let Some(reference) = reference {
            let target = stream_target(reference, hns);
            tracing::debug!("Seek {} hns -> stream {} tick {}", hns, reference.index, target);
            match self.reader.seek(reference.index, target) {
                Ok(()) => {
                    if let Some(provider) = audio.as_mut() {
                        provider.flush(&self.reader);
                    }
                    if let Some(provider) = video.as_mut() {
                        provider.flush(&self.reader);
                    }
                }
                Err(e) => {
                    tracing::warn!("Seek to {} failed, playback continues: {}", hns, e);
                }
            }
        }
        drop(video);
        drop(audio);

        *self.last_seek.lock() = Some(hns);
        let mut state = self.state.lock();
        if *state == PipelineState::Seeking {
            *state = PipelineState::Ready;
        }
        Some(hns)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Release decoders, then the packet source. Idempotent; later calls on
    /// the pipeline return `Unavailable` / `None`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == PipelineState::Closed {
                return;
            }
            *state = PipelineState::Closed;
        }
        tracing::info!("Closing pipeline");

        // A pull blocked in the read loop bails out on its next packet.
        self.reader.interrupt();
        self.reader.set_audio_stream(None);
        self.reader.set_video_stream(None);

        drop(self.audio.lock().take());
        drop(self.video.lock().take());
        self.reader.close();
    }
}

impl Drop for MediaPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

/// Host time to the stream's own ticks, including its start offset.
fn stream_target(stream: &StreamInfo, hns: i64) -> i64 {
    from_hns(hns, stream.time_base) + stream.start_time.unwrap_or(0)
}

/// Create a provider and reserve its resources. `None` drops the stream.
fn start_provider(
    kind: StreamKind,
    stream: &StreamInfo,
    variant: ProviderVariant,
    decoders: &Arc<dyn DecoderFactory>,
) -> Option<Box<dyn SampleProvider>> {
    let mut provider = create_provider(kind, stream, variant, Arc::clone(decoders));
    match provider.allocate_resources() {
        Ok(()) => Some(provider),
        Err(e) => {
            tracing::warn!(
                "Dropping {} stream {} ({:?}): {}",
                kind,
                stream.index,
                stream.codec,
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, Sample};
    use crate::source::CodecId;
    use crate::testing::{ScriptedDecoders, ScriptedSource, ScriptedSourceBuilder};
    use crate::time::Rational;

    /// Video every 33 ms (keyframe every 5th), audio every 40 ms, ten each,
    /// 400 ms long.
    fn interleaved() -> ScriptedSourceBuilder {
        ScriptedSource::builder()
            .video(0, 1000)
            .audio(1, 1000)
            .interleaved((33, 10), 5, (40, 10))
            .duration_us(400_000)
    }

    fn open(builder: ScriptedSourceBuilder) -> MediaPipeline {
        open_with(builder, PipelineConfig::default(), ScriptedDecoders::default()).unwrap()
    }

    fn open_with(
        builder: ScriptedSourceBuilder,
        config: PipelineConfig,
        decoders: ScriptedDecoders,
    ) -> InteropResult<MediaPipeline> {
        MediaPipeline::from_source(Box::new(builder.build()), &config, Arc::new(decoders))
    }

    fn next(pipeline: &MediaPipeline, kind: StreamKind) -> Sample {
        match pipeline.get_next_sample(kind) {
            NextSample::Ready(sample) => sample,
            other => panic!("expected a {} sample, got {:?}", kind, other),
        }
    }

    fn pull_ms(pipeline: &MediaPipeline, kind: StreamKind, count: usize) -> Vec<i64> {
        (0..count).map(|_| next(pipeline, kind).timestamp_ms()).collect()
    }

    #[test]
    fn test_interleaved_streams_pull_independently() {
        let pipeline = open(interleaved());
        let video = pull_ms(&pipeline, StreamKind::Video, 10);
        let audio = pull_ms(&pipeline, StreamKind::Audio, 10);

        assert_eq!(video, (0..10).map(|i| i * 33).collect::<Vec<_>>());
        assert_eq!(audio, (0..10).map(|i| i * 40).collect::<Vec<_>>());
        assert!(pipeline.get_next_sample(StreamKind::Video).is_end_of_stream());
        assert!(pipeline.get_next_sample(StreamKind::Audio).is_end_of_stream());
    }

    #[test]
    fn test_concurrent_pulls_from_two_threads() {
        let pipeline = Arc::new(open(interleaved()));
        let handles: Vec<_> = [StreamKind::Video, StreamKind::Audio]
            .into_iter()
            .map(|kind| {
                let pipeline = Arc::clone(&pipeline);
                std::thread::spawn(move || pull_ms(&pipeline, kind, 10))
            })
            .collect();
        let results: Vec<Vec<i64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results[0], (0..10).map(|i| i * 33).collect::<Vec<_>>());
        assert_eq!(results[1], (0..10).map(|i| i * 40).collect::<Vec<_>>());
    }

    #[test]
    fn test_descriptor_and_variants() {
        let pipeline = open(interleaved());
        let descriptor = pipeline.descriptor();
        assert!(descriptor.can_seek);
        assert_eq!(descriptor.duration_hns, Some(4_000_000));
        assert_eq!(descriptor.buffer_time_hns, None);
        assert_eq!(descriptor.video.as_ref().unwrap().width, 640);
        assert_eq!(descriptor.audio.as_ref().unwrap().sample_rate, 48000);
        assert_eq!(pipeline.variant(StreamKind::Video), Some(ProviderVariant::H264AnnexB));
        assert_eq!(pipeline.variant(StreamKind::Audio), Some(ProviderVariant::Passthrough));
        assert_eq!(pipeline.state(), PipelineState::Ready);
    }

    #[test]
    fn test_seek_flushes_both_streams() {
        let pipeline = open(interleaved());
        pull_ms(&pipeline, StreamKind::Video, 3);
        assert_eq!(pipeline.reader.pending_len(1), 2);

        assert_eq!(pipeline.seek(2_000_000), Some(2_000_000));
        assert_eq!(pipeline.last_seek(), Some(2_000_000));
        assert_eq!(pipeline.reader.pending_len(1), 0);

        // Lands on the keyframe at 165 ms, before the 200 ms target.
        let video = next(&pipeline, StreamKind::Video);
        assert_eq!(video.timestamp_ms(), 165);
        assert!(video.discontinuous);
        assert!(video.keyframe);
        assert!(!next(&pipeline, StreamKind::Video).discontinuous);

        let audio = next(&pipeline, StreamKind::Audio);
        assert_eq!(audio.timestamp_ms(), 200);
        assert!(audio.discontinuous);
        assert_eq!(pull_ms(&pipeline, StreamKind::Audio, 4), vec![240, 280, 320, 360]);
    }

    #[test]
    fn test_seek_resumes_after_end_of_stream() {
        let pipeline = open(interleaved());
        pull_ms(&pipeline, StreamKind::Video, 10);
        assert!(pipeline.get_next_sample(StreamKind::Video).is_end_of_stream());
        assert!(pipeline.get_next_sample(StreamKind::Video).is_end_of_stream());

        assert_eq!(pipeline.seek(0), Some(0));
        assert_eq!(pull_ms(&pipeline, StreamKind::Video, 2), vec![0, 33]);
    }

    #[test]
    fn test_seek_outside_duration_is_refused() {
        let pipeline = open(interleaved());
        assert_eq!(pipeline.seek(4_000_000), None);
        assert_eq!(pipeline.seek(-1), None);
        assert_eq!(pipeline.last_seek(), None);
    }

    #[test]
    fn test_failed_seek_is_acknowledged_and_playback_continues() {
        let pipeline = open(interleaved().fail_seeks());
        pull_ms(&pipeline, StreamKind::Video, 2);

        assert_eq!(pipeline.seek(3_000_000), Some(3_000_000));
        let sample = next(&pipeline, StreamKind::Video);
        assert_eq!(sample.timestamp_ms(), 66);
        assert!(!sample.discontinuous);
        assert_eq!(pipeline.state(), PipelineState::Ready);
    }

    #[test]
    fn test_live_source_never_seeks() {
        let builder = ScriptedSource::builder()
            .video(0, 1000)
            .audio(1, 1000)
            .interleaved((33, 3), 1, (40, 3));
        let pipeline = open(builder);
        assert!(!pipeline.descriptor().can_seek);
        assert_eq!(pipeline.descriptor().buffer_time_hns, Some(0));
        assert_eq!(pipeline.seek(0), None);
        assert_eq!(pull_ms(&pipeline, StreamKind::Video, 3), vec![0, 33, 66]);
    }

    #[test]
    fn test_start_time_offsets_timestamps_and_seeks() {
        let mut video = StreamInfo::new(0, MediaType::Video, CodecId::H264, Rational::new(1, 1000));
        video.start_time = Some(1000);
        let builder = ScriptedSource::builder()
            .stream(video)
            .packet(0, 1000, true)
            .packet(0, 1040, false)
            .packet(0, 1080, true)
            .duration_us(120_000);
        let pipeline = open(builder);
        assert_eq!(pull_ms(&pipeline, StreamKind::Video, 2), vec![0, 40]);

        // 90 ms is tick 1090; the keyframe at or before it is 1080.
        pipeline.seek(900_000);
        assert_eq!(next(&pipeline, StreamKind::Video).timestamp_ms(), 80);
    }

    #[test]
    fn test_seek_target_uses_reference_time_base() {
        let mut video = StreamInfo::new(0, MediaType::Video, CodecId::H264, Rational::new(1, 90_000));
        video.start_time = Some(900);
        let audio = StreamInfo::new(1, MediaType::Audio, CodecId::Aac, Rational::new(1, 48_000));
        assert_eq!(stream_target(&video, 10_000_000), 90_900);
        assert_eq!(stream_target(&audio, 10_000_000), 48_000);

        // Audio is the reference when there is no video.
        let builder = ScriptedSource::builder()
            .audio(0, 48_000)
            .packet(0, 0, true)
            .packet(0, 1920, true)
            .packet(0, 3840, true)
            .packet(0, 5760, true)
            .duration_us(160_000);
        let pipeline = open(builder);
        // 100 ms is tick 4800; the last packet at or before it is 3840.
        assert_eq!(pipeline.seek(1_000_000), Some(1_000_000));
        assert_eq!(pull_ms(&pipeline, StreamKind::Audio, 2), vec![80, 120]);
    }

    #[test]
    fn test_avc_stream_rewritten_consistently() {
        let mut video = StreamInfo::new(0, MediaType::Video, CodecId::H264, Rational::new(1, 1000));
        video.extradata = vec![1, 0x42, 0, 0x1E, 0xFF, 0xE1, 0, 2, 0x67, 0x42, 1, 0, 1, 0x68];
        let idr = Packet::new(0, vec![0, 0, 0, 1, 0x65], Some(0)).with_keyframe(true);
        let slice = Packet::new(0, vec![0, 0, 0, 1, 0x41], Some(33));
        let builder = ScriptedSource::builder()
            .stream(video)
            .raw_packet(idr)
            .raw_packet(slice);
        let pipeline = open(builder);
        assert_eq!(pipeline.variant(StreamKind::Video), Some(ProviderVariant::H264Avc));

        let first = next(&pipeline, StreamKind::Video);
        assert_eq!(
            &first.data[..],
            &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0, 0, 0, 1, 0x65]
        );
        let second = next(&pipeline, StreamKind::Video);
        assert_eq!(&second.data[..], &[0, 0, 0, 1, 0x41]);
    }

    #[test]
    fn test_cover_art_and_data_streams_ignored() {
        let mut cover = StreamInfo::new(0, MediaType::Video, CodecId::H264, Rational::new(1, 1000));
        cover.attached_pic = true;
        cover.default = true;
        let builder = ScriptedSource::builder()
            .stream(cover)
            .audio(1, 1000)
            .data(2, 1000)
            .packet(0, 0, true)
            .packet(2, 0, true)
            .packet(1, 0, true)
            .packet(1, 40, true);
        let pipeline = open(builder);
        assert!(pipeline.descriptor().video.is_none());
        assert_eq!(pipeline.variant(StreamKind::Video), None);
        assert!(matches!(
            pipeline.get_next_sample(StreamKind::Video),
            NextSample::Unavailable
        ));
        assert_eq!(pull_ms(&pipeline, StreamKind::Audio, 2), vec![0, 40]);
    }

    #[test]
    fn test_no_playable_stream_is_unsupported() {
        let builder = ScriptedSource::builder().data(0, 1000).packet(0, 0, true);
        let err = open_with(builder, PipelineConfig::default(), ScriptedDecoders::default())
            .err()
            .unwrap();
        assert!(matches!(err, InteropError::UnsupportedInput(_)));
    }

    #[test]
    fn test_unavailable_decoder_drops_only_that_stream() {
        let config = PipelineConfig {
            force_video_decode: true,
            ..Default::default()
        };
        let decoders = ScriptedDecoders {
            unavailable: true,
            ..Default::default()
        };
        let pipeline = open_with(interleaved(), config, decoders).unwrap();
        assert!(pipeline.descriptor().video.is_none());
        assert_eq!(pull_ms(&pipeline, StreamKind::Audio, 3), vec![0, 40, 80]);

        let config = PipelineConfig {
            force_video_decode: true,
            force_audio_decode: true,
            ..Default::default()
        };
        let err = open_with(interleaved(), config, decoders).err().unwrap();
        assert!(matches!(err, InteropError::UnsupportedInput(_)));
    }

    #[test]
    fn test_forced_decode_with_reordering_decoder() {
        let config = PipelineConfig {
            force_video_decode: true,
            force_audio_decode: true,
            ..Default::default()
        };
        let decoders = ScriptedDecoders {
            delay: 2,
            ..Default::default()
        };
        let pipeline = open_with(interleaved(), config, decoders).unwrap();
        assert_eq!(pipeline.variant(StreamKind::Video), Some(ProviderVariant::Uncompressed));
        assert_eq!(
            pipeline.descriptor().video.as_ref().unwrap().encoding,
            crate::descriptor::VideoEncoding::Nv12
        );

        assert_eq!(
            pull_ms(&pipeline, StreamKind::Video, 10),
            (0..10).map(|i| i * 33).collect::<Vec<_>>()
        );
        assert_eq!(
            pull_ms(&pipeline, StreamKind::Audio, 10),
            (0..10).map(|i| i * 40).collect::<Vec<_>>()
        );
        assert!(pipeline.get_next_sample(StreamKind::Video).is_end_of_stream());

        // Seek drops whatever the decoder was holding.
        pipeline.seek(0);
        let first = next(&pipeline, StreamKind::Video);
        assert_eq!(first.timestamp_ms(), 0);
        assert!(first.discontinuous);
    }

    #[test]
    fn test_source_failure_faults_pipeline() {
        let pipeline = open(interleaved().fail_read_at(2));
        assert_eq!(next(&pipeline, StreamKind::Video).timestamp_ms(), 0);
        assert!(matches!(
            pipeline.get_next_sample(StreamKind::Video),
            NextSample::Unavailable
        ));
        assert!(pipeline.is_faulted());
        // Parked audio is not served once the source has failed.
        assert!(matches!(
            pipeline.get_next_sample(StreamKind::Audio),
            NextSample::Unavailable
        ));
        assert_eq!(pipeline.seek(0), None);
    }

    #[test]
    fn test_close_is_final_and_idempotent() {
        let pipeline = open(interleaved());
        next(&pipeline, StreamKind::Video);
        pipeline.close();
        pipeline.close();

        assert_eq!(pipeline.state(), PipelineState::Closed);
        assert!(matches!(
            pipeline.get_next_sample(StreamKind::Audio),
            NextSample::Unavailable
        ));
        assert_eq!(pipeline.seek(0), None);
        assert_eq!(pipeline.variant(StreamKind::Video), None);
        assert!(pipeline.reader.streams().is_empty());
    }
}
