//! # Decode Module
//!
//! Uniform send/receive interface over the software decoder backends.
//!
//! ## Backends:
//! - OpenH264 (H.264 video), behind the `software-decode` feature
//! - Symphonia (AAC, MP3, FLAC, Vorbis, ALAC), behind the `audio` feature
//! - raw PCM, always available
//!
//! A decoder accepts packets and hands back zero or more frames per packet.
//! Callers drain with `receive_frame` until it returns `Ok(None)` before
//! sending more input.

mod pcm;

#[cfg(feature = "software-decode")]
mod openh264;

#[cfg(feature = "audio")]
mod symphonia;

use crate::error::{InteropError, InteropResult};
use crate::packet::Packet;
use crate::source::{CodecId, MediaType, StreamInfo};

pub use self::pcm::PcmDecoder;

#[cfg(feature = "software-decode")]
pub use self::openh264::OpenH264Decoder;

#[cfg(feature = "audio")]
pub use self::symphonia::SymphoniaDecoder;

/// A decoded picture, packed NV12.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    /// Presentation time in the stream time base.
    pub pts: Option<i64>,
    /// Zero when unknown.
    pub duration: i64,
    pub keyframe: bool,
}

/// Decoded audio, interleaved full-scale i32.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i32>,
    pub channels: u32,
    pub sample_rate: u32,
    pub pts: Option<i64>,
    pub duration: i64,
}

impl AudioFrame {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

#[derive(Debug, Clone)]
pub enum DecodedFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl DecodedFrame {
    pub fn pts(&self) -> Option<i64> {
        match self {
            Self::Video(f) => f.pts,
            Self::Audio(f) => f.pts,
        }
    }

    pub fn duration(&self) -> i64 {
        match self {
            Self::Video(f) => f.duration,
            Self::Audio(f) => f.duration,
        }
    }
}

/// Decoder trait - implemented by all decoder backends
pub trait FrameDecoder: Send {
    /// Get decoder name for debugging
    fn name(&self) -> &str;

    /// Submit one packet. A `Decode` error means this packet is lost but the
    /// decoder is still usable.
    fn send_packet(&mut self, packet: &Packet) -> InteropResult<()>;

    /// No more input; buffered frames become receivable.
    fn send_eof(&mut self) -> InteropResult<()>;

    /// Next decoded frame, `Ok(None)` when more input is needed (or, after
    /// `send_eof`, when fully drained).
    fn receive_frame(&mut self) -> InteropResult<Option<DecodedFrame>>;

    /// Drop all buffered input, output and reference state.
    fn flush(&mut self);
}

/// Builds decoders for streams. The pipeline takes one so hosts and tests can
/// substitute their own backends.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, stream: &StreamInfo) -> InteropResult<Box<dyn FrameDecoder>>;
}

/// The built-in software backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareDecoders;

impl DecoderFactory for SoftwareDecoders {
    fn create(&self, stream: &StreamInfo) -> InteropResult<Box<dyn FrameDecoder>> {
        if stream.codec.is_pcm() {
            return Ok(Box::new(PcmDecoder::new(stream)));
        }

        match stream.media_type {
            MediaType::Video => create_video(stream),
            MediaType::Audio => create_audio(stream),
            _ => Err(no_decoder(stream)),
        }
    }
}

fn no_decoder(stream: &StreamInfo) -> InteropError {
    InteropError::NoDecoder(format!("{:?} (stream {})", stream.codec, stream.index))
}

#[cfg(feature = "software-decode")]
fn create_video(stream: &StreamInfo) -> InteropResult<Box<dyn FrameDecoder>> {
    match stream.codec {
        CodecId::H264 => Ok(Box::new(OpenH264Decoder::new(stream)?)),
        _ => Err(no_decoder(stream)),
    }
}

#[cfg(not(feature = "software-decode"))]
fn create_video(stream: &StreamInfo) -> InteropResult<Box<dyn FrameDecoder>> {
    Err(no_decoder(stream))
}

#[cfg(feature = "audio")]
fn create_audio(stream: &StreamInfo) -> InteropResult<Box<dyn FrameDecoder>> {
    Ok(Box::new(SymphoniaDecoder::new(stream)?))
}

#[cfg(not(feature = "audio"))]
fn create_audio(stream: &StreamInfo) -> InteropResult<Box<dyn FrameDecoder>> {
    Err(no_decoder(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Rational;

    #[test]
    fn test_pcm_always_available() {
        let mut stream = StreamInfo::new(0, MediaType::Audio, CodecId::PcmS16Le, Rational::new(1, 48000));
        stream.channels = 2;
        stream.sample_rate = 48000;
        let decoder = SoftwareDecoders.create(&stream).unwrap();
        assert_eq!(decoder.name(), "pcm");
    }

    #[test]
    fn test_unknown_codec_has_no_decoder() {
        let stream = StreamInfo::new(
            0,
            MediaType::Video,
            CodecId::Unknown("V_THEORA".into()),
            Rational::new(1, 1000),
        );
        let err = SoftwareDecoders.create(&stream).err().unwrap();
        assert!(matches!(err, InteropError::NoDecoder(_)));
    }

    #[test]
    fn test_audio_frame_count() {
        let frame = AudioFrame {
            samples: vec![0; 8],
            channels: 2,
            sample_rate: 48000,
            pts: Some(0),
            duration: 4,
        };
        assert_eq!(frame.frames(), 4);
    }
}
