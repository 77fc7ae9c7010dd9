//! Stream descriptors surfaced to the host once at open time, and the
//! choice of sample provider that goes with each.

use serde::Serialize;

use crate::convert::output_bits;
use crate::provider::ProviderVariant;
use crate::source::{CodecId, StreamInfo};
use crate::time::{container_to_hns, Rational};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AudioEncoding {
    /// Raw AAC with an AudioSpecificConfig.
    Aac,
    /// AAC framed with ADTS headers (no out-of-band config).
    AacAdts,
    Mp3,
    Wma,
    Pcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VideoEncoding {
    H264,
    Nv12,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioDescriptor {
    pub stream_index: usize,
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u32,
    /// PCM only.
    pub bits_per_sample: Option<u32>,
    pub bit_rate: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoDescriptor {
    pub stream_index: usize,
    pub encoding: VideoEncoding,
    pub width: u32,
    pub height: u32,
    /// H.264 only.
    pub profile: Option<i32>,
    pub frame_rate: Option<Rational>,
    /// NV12 only.
    pub pixel_aspect_ratio: Option<Rational>,
    pub bit_rate: u64,
}

/// What the host learns about the media before the first sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentationDescriptor {
    /// 100 ns units, `None` for live sources.
    pub duration_hns: Option<i64>,
    pub can_seek: bool,
    /// `Some(0)` asks the host not to pre-buffer.
    pub buffer_time_hns: Option<i64>,
    pub audio: Option<AudioDescriptor>,
    pub video: Option<VideoDescriptor>,
}

impl PresentationDescriptor {
    pub fn new(
        duration_us: Option<i64>,
        audio: Option<AudioDescriptor>,
        video: Option<VideoDescriptor>,
    ) -> Self {
        let duration_hns = duration_us.filter(|&us| us > 0).map(container_to_hns);
        let live = duration_hns.is_none();
        Self {
            duration_hns,
            can_seek: !live,
            buffer_time_hns: live.then_some(0),
            audio,
            video,
        }
    }
}

/// Passthrough for codecs the host decodes itself, PCM decode otherwise.
pub fn audio_plan(stream: &StreamInfo, force_decode: bool) -> (AudioDescriptor, ProviderVariant) {
    let passthrough = if force_decode {
        None
    } else {
        match stream.codec {
            CodecId::Aac if stream.extradata.is_empty() => Some(AudioEncoding::AacAdts),
            CodecId::Aac => Some(AudioEncoding::Aac),
            CodecId::Mp3 => Some(AudioEncoding::Mp3),
            ref codec if codec.is_wma() => Some(AudioEncoding::Wma),
            _ => None,
        }
    };

    let (encoding, bits_per_sample, variant) = match passthrough {
        Some(encoding) => (encoding, None, ProviderVariant::Passthrough),
        None => (
            AudioEncoding::Pcm,
            Some(output_bits(stream.bits_per_coded_sample)),
            ProviderVariant::Uncompressed,
        ),
    };

    let descriptor = AudioDescriptor {
        stream_index: stream.index,
        encoding,
        sample_rate: stream.sample_rate,
        channels: stream.channels,
        bits_per_sample,
        bit_rate: stream.bit_rate,
    };
    (descriptor, variant)
}

/// H.264 is reformatted for the host decoder; anything else is decoded to
/// NV12.
pub fn video_plan(stream: &StreamInfo, force_decode: bool) -> (VideoDescriptor, ProviderVariant) {
    let h264 = stream.codec == CodecId::H264 && !force_decode;

    let (encoding, variant, profile, pixel_aspect_ratio) = if h264 {
        // avcC records start with configuration version 1.
        let variant = if stream.extradata.first() == Some(&1) {
            ProviderVariant::H264Avc
        } else {
            ProviderVariant::H264AnnexB
        };
        (VideoEncoding::H264, variant, stream.profile, None)
    } else {
        let par = stream
            .sample_aspect_ratio
            .filter(|sar| sar.num > 0 && sar.den != 0);
        (VideoEncoding::Nv12, ProviderVariant::Uncompressed, None, par)
    };

    let descriptor = VideoDescriptor {
        stream_index: stream.index,
        encoding,
        width: stream.width,
        height: stream.height,
        profile,
        frame_rate: frame_rate(stream),
        pixel_aspect_ratio,
        bit_rate: stream.bit_rate,
    };
    (descriptor, variant)
}

/// Codec-reported rate, else the container average, else unset.
fn frame_rate(stream: &StreamInfo) -> Option<Rational> {
    let usable = |rate: &Rational| rate.num != 0 && rate.den != 0;
    stream
        .codec_frame_rate
        .filter(usable)
        .or_else(|| stream.avg_frame_rate.filter(usable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MediaType;

    fn audio(codec: CodecId) -> StreamInfo {
        let mut s = StreamInfo::new(1, MediaType::Audio, codec, Rational::new(1, 44100));
        s.sample_rate = 44100;
        s.channels = 2;
        s.bit_rate = 128_000;
        s
    }

    fn video(codec: CodecId, extradata: Vec<u8>) -> StreamInfo {
        let mut s = StreamInfo::new(0, MediaType::Video, codec, Rational::new(1, 90000));
        s.width = 1920;
        s.height = 1080;
        s.profile = Some(100);
        s.extradata = extradata;
        s
    }

    #[test]
    fn test_aac_flavour_follows_extradata() {
        let (desc, variant) = audio_plan(&audio(CodecId::Aac), false);
        assert_eq!(desc.encoding, AudioEncoding::AacAdts);
        assert_eq!(variant, ProviderVariant::Passthrough);

        let mut with_config = audio(CodecId::Aac);
        with_config.extradata = vec![0x12, 0x10];
        assert_eq!(audio_plan(&with_config, false).0.encoding, AudioEncoding::Aac);
    }

    #[test]
    fn test_wma_and_mp3_pass_through() {
        assert_eq!(audio_plan(&audio(CodecId::WmaPro), false).0.encoding, AudioEncoding::Wma);
        let (desc, variant) = audio_plan(&audio(CodecId::Mp3), false);
        assert_eq!(desc.encoding, AudioEncoding::Mp3);
        assert_eq!(desc.bit_rate, 128_000);
        assert_eq!(variant, ProviderVariant::Passthrough);
    }

    #[test]
    fn test_other_audio_decodes_to_pcm() {
        let (desc, variant) = audio_plan(&audio(CodecId::Flac), false);
        assert_eq!(desc.encoding, AudioEncoding::Pcm);
        assert_eq!(desc.bits_per_sample, Some(16));
        assert_eq!(variant, ProviderVariant::Uncompressed);

        let mut pcm24 = audio(CodecId::PcmS24Le);
        pcm24.bits_per_coded_sample = 24;
        assert_eq!(audio_plan(&pcm24, false).0.bits_per_sample, Some(24));
    }

    #[test]
    fn test_forced_audio_decode() {
        let (desc, variant) = audio_plan(&audio(CodecId::Mp3), true);
        assert_eq!(desc.encoding, AudioEncoding::Pcm);
        assert_eq!(variant, ProviderVariant::Uncompressed);
    }

    #[test]
    fn test_h264_framing_from_first_extradata_byte() {
        let (desc, variant) = video_plan(&video(CodecId::H264, vec![1, 0x64, 0, 0x28]), false);
        assert_eq!(desc.encoding, VideoEncoding::H264);
        assert_eq!(desc.profile, Some(100));
        assert_eq!(variant, ProviderVariant::H264Avc);

        let (_, variant) = video_plan(&video(CodecId::H264, vec![0, 0, 0, 1, 0x67]), false);
        assert_eq!(variant, ProviderVariant::H264AnnexB);
        let (_, variant) = video_plan(&video(CodecId::H264, Vec::new()), false);
        assert_eq!(variant, ProviderVariant::H264AnnexB);
    }

    #[test]
    fn test_nv12_pixel_aspect_ratio() {
        let mut stream = video(CodecId::Vp9, Vec::new());
        stream.sample_aspect_ratio = Some(Rational::new(4, 3));
        let (desc, variant) = video_plan(&stream, false);
        assert_eq!(desc.encoding, VideoEncoding::Nv12);
        assert_eq!(desc.pixel_aspect_ratio, Some(Rational::new(4, 3)));
        assert_eq!(desc.profile, None);
        assert_eq!(variant, ProviderVariant::Uncompressed);

        stream.sample_aspect_ratio = Some(Rational::new(0, 1));
        assert_eq!(video_plan(&stream, false).0.pixel_aspect_ratio, None);
    }

    #[test]
    fn test_frame_rate_fallback() {
        let mut stream = video(CodecId::H264, Vec::new());
        assert_eq!(video_plan(&stream, false).0.frame_rate, None);

        stream.avg_frame_rate = Some(Rational::new(25, 1));
        assert_eq!(video_plan(&stream, false).0.frame_rate, Some(Rational::new(25, 1)));

        stream.codec_frame_rate = Some(Rational::new(30000, 1001));
        assert_eq!(
            video_plan(&stream, false).0.frame_rate,
            Some(Rational::new(30000, 1001))
        );
    }

    #[test]
    fn test_live_source_has_no_duration() {
        let live = PresentationDescriptor::new(None, None, None);
        assert!(!live.can_seek);
        assert_eq!(live.buffer_time_hns, Some(0));

        let zero = PresentationDescriptor::new(Some(0), None, None);
        assert!(!zero.can_seek);

        let file = PresentationDescriptor::new(Some(2_500_000), None, None);
        assert!(file.can_seek);
        assert_eq!(file.duration_hns, Some(25_000_000));
        assert_eq!(file.buffer_time_hns, None);
    }
}
