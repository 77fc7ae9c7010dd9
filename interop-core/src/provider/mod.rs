//! # Sample Providers
//!
//! One provider per active stream turns that stream's packets into host
//! samples. All variants share [`ProviderBase`] for timestamp conversion,
//! end-of-stream and discontinuity bookkeeping; they differ only in what
//! happens to the payload:
//!
//! - [`PassthroughSampleProvider`]: payload forwarded as-is (MP3, WMA, AAC)
//! - [`H264SampleProvider`]: NAL framing rewritten to Annex B, parameter sets
//!   prepended to the first keyframe
//! - [`UncompressedSampleProvider`]: decoded to NV12 or PCM
//!
//! Providers never lock anything themselves. The pipeline holds the
//! provider's lock while it pulls, and the stream reader serializes access to
//! the shared packet source.

mod h264;
mod passthrough;
mod uncompressed;

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::decode::DecoderFactory;
use crate::error::InteropResult;
use crate::packet::{Packet, Sample, SideData, StreamKind};
use crate::reader::StreamReader;
use crate::source::StreamInfo;
use crate::time::{to_hns, Rational};

pub use self::h264::H264SampleProvider;
pub use self::passthrough::PassthroughSampleProvider;
pub use self::uncompressed::UncompressedSampleProvider;

/// How a stream's packets become samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProviderVariant {
    Passthrough,
    /// Length-prefixed NAL units rewritten to Annex B.
    H264Avc,
    /// Already Annex B; parameter sets still prepended.
    H264AnnexB,
    Uncompressed,
}

pub trait SampleProvider: Send {
    fn kind(&self) -> StreamKind;

    fn stream_index(&self) -> usize;

    fn variant(&self) -> ProviderVariant;

    /// Reserve decoder and buffer resources. Called once before the first
    /// sample; an error drops this stream only.
    fn allocate_resources(&mut self) -> InteropResult<()>;

    /// Next sample in presentation order, `Ok(None)` at end of stream.
    /// Per-packet decode failures are skipped internally; an error here
    /// comes from the packet source.
    fn get_next_sample(&mut self, reader: &StreamReader) -> InteropResult<Option<Sample>>;

    /// Drop parked packets and decoder state. The next sample is marked
    /// discontinuous.
    fn flush(&mut self, reader: &StreamReader);
}

/// Build the provider for `stream`.
pub fn create_provider(
    kind: StreamKind,
    stream: &StreamInfo,
    variant: ProviderVariant,
    decoders: Arc<dyn DecoderFactory>,
) -> Box<dyn SampleProvider> {
    let base = ProviderBase::new(kind, stream);
    match variant {
        ProviderVariant::Passthrough => Box::new(PassthroughSampleProvider::new(base)),
        ProviderVariant::H264Avc | ProviderVariant::H264AnnexB => {
            Box::new(H264SampleProvider::new(base, variant, &stream.extradata))
        }
        ProviderVariant::Uncompressed => {
            Box::new(UncompressedSampleProvider::new(base, stream.clone(), decoders))
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProviderBase {
    kind: StreamKind,
    stream_index: usize,
    time_base: Rational,
    /// Stream start time, subtracted from every timestamp.
    start_time: i64,
    /// Set by flush, cleared by the next sample.
    discontinuous: bool,
    end_of_stream: bool,
    /// Last delivered timestamp (hns), for packets without one.
    last_timestamp: Option<i64>,
    last_duration: i64,
}

impl ProviderBase {
    pub fn new(kind: StreamKind, stream: &StreamInfo) -> Self {
        Self {
            kind,
            stream_index: stream.index,
            time_base: stream.time_base,
            start_time: stream.start_time.unwrap_or(0),
            discontinuous: false,
            end_of_stream: false,
            last_timestamp: None,
            last_duration: 0,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn set_end_of_stream(&mut self) {
        if !self.end_of_stream {
            tracing::debug!("{} stream {} reached end of stream", self.kind, self.stream_index);
        }
        self.end_of_stream = true;
    }

    /// Next packet of this stream from the reader.
    pub fn read_packet(&self, reader: &StreamReader) -> InteropResult<Option<Packet>> {
        reader.read_packet_for(self.stream_index)
    }

    /// Stream ticks to host units relative to the stream start. A missing
    /// timestamp continues from the previous sample.
    pub fn timestamp(&self, pts: Option<i64>) -> i64 {
        match pts {
            Some(pts) => to_hns(pts - self.start_time, self.time_base),
            None => self
                .last_timestamp
                .map_or(0, |last| last + self.last_duration),
        }
    }

    pub fn duration(&self, ticks: i64) -> i64 {
        to_hns(ticks.max(0), self.time_base)
    }

    /// Wrap a payload, consuming the pending discontinuity flag.
    pub fn make_sample(
        &mut self,
        data: Bytes,
        timestamp: i64,
        duration: i64,
        keyframe: bool,
        side_data: Option<SideData>,
    ) -> Sample {
        self.last_timestamp = Some(timestamp);
        self.last_duration = duration;
        Sample {
            data,
            timestamp,
            duration,
            keyframe,
            discontinuous: std::mem::take(&mut self.discontinuous),
            side_data,
        }
    }

    /// Discard this stream's parked packets and reset end of stream.
    pub fn flush(&mut self, reader: &StreamReader) {
        reader.discard_pending(self.stream_index);
        self.discontinuous = true;
        self.end_of_stream = false;
        self.last_timestamp = None;
        self.last_duration = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CodecId, MediaType};

    fn base(start_time: Option<i64>) -> ProviderBase {
        let mut info = StreamInfo::new(3, MediaType::Audio, CodecId::Mp3, Rational::new(1, 1000));
        info.start_time = start_time;
        ProviderBase::new(StreamKind::Audio, &info)
    }

    #[test]
    fn test_timestamps_relative_to_start() {
        let base = base(Some(100));
        assert_eq!(base.timestamp(Some(140)), 400_000);
        assert_eq!(base.duration(40), 400_000);
        assert_eq!(base.duration(-5), 0);
    }

    #[test]
    fn test_missing_timestamp_continues() {
        let mut base = base(None);
        base.make_sample(Bytes::new(), 400_000, 400_000, true, None);
        assert_eq!(base.timestamp(None), 800_000);
    }

    #[test]
    fn test_discontinuity_flag_consumed_once() {
        let source = crate::testing::ScriptedSource::builder().audio(3, 1000).build();
        let reader = StreamReader::new(Box::new(source));
        let mut base = base(None);

        assert!(!base.make_sample(Bytes::new(), 0, 0, true, None).discontinuous);
        base.set_end_of_stream();
        base.flush(&reader);
        assert!(!base.is_end_of_stream());
        assert!(base.make_sample(Bytes::new(), 0, 0, true, None).discontinuous);
        assert!(!base.make_sample(Bytes::new(), 0, 0, true, None).discontinuous);
    }
}
