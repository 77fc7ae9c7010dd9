//! Symphonia audio decoding.

use std::collections::VecDeque;

use ::symphonia::core::audio::{AudioBufferRef, Channels, SampleBuffer};
use ::symphonia::core::codecs::{
    CodecParameters, CodecType, Decoder, DecoderOptions, CODEC_TYPE_AAC, CODEC_TYPE_ALAC,
    CODEC_TYPE_FLAC, CODEC_TYPE_MP3, CODEC_TYPE_VORBIS,
};
use ::symphonia::core::errors::Error as SymphoniaError;
use ::symphonia::core::formats::Packet as SymphoniaPacket;

use super::{AudioFrame, DecodedFrame, FrameDecoder};
use crate::error::{InteropError, InteropResult};
use crate::packet::Packet;
use crate::source::{CodecId, StreamInfo};
use crate::time::{rescale, Rational, Rounding};

pub struct SymphoniaDecoder {
    decoder: Box<dyn Decoder>,
    /// AAC without an AudioSpecificConfig arrives with ADTS headers.
    strip_adts: bool,
    time_base: Rational,
    ready: VecDeque<AudioFrame>,
}

fn codec_type(codec: &CodecId) -> Option<CodecType> {
    match codec {
        CodecId::Aac => Some(CODEC_TYPE_AAC),
        CodecId::Mp3 => Some(CODEC_TYPE_MP3),
        CodecId::Flac => Some(CODEC_TYPE_FLAC),
        CodecId::Vorbis => Some(CODEC_TYPE_VORBIS),
        CodecId::Alac => Some(CODEC_TYPE_ALAC),
        _ => None,
    }
}

/// Channel mask with the first `count` positions set.
fn channel_mask(count: u32) -> Channels {
    let count = count.clamp(1, 26);
    Channels::from_bits_truncate(((1u64 << count) - 1) as u32)
}

/// Length of the ADTS header at the start of `data`, if any.
fn adts_header_len(data: &[u8]) -> Option<usize> {
    if data.len() < 7 || data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
        return None;
    }
    let protection_absent = data[1] & 0x01 != 0;
    Some(if protection_absent { 7 } else { 9 })
}

fn to_audio_frame(
    audio_buf: AudioBufferRef<'_>,
    pts: Option<i64>,
    time_base: Rational,
) -> Option<AudioFrame> {
    let spec = *audio_buf.spec();
    let frames = audio_buf.frames();
    if frames == 0 {
        return None;
    }

    let mut sample_buf = SampleBuffer::<i32>::new(audio_buf.capacity() as u64, spec);
    sample_buf.copy_interleaved_ref(audio_buf);

    let duration = rescale(
        frames as i64,
        Rational::new(1, spec.rate.max(1) as i64),
        time_base,
        Rounding::Nearest,
    );

    Some(AudioFrame {
        samples: sample_buf.samples().to_vec(),
        channels: spec.channels.count() as u32,
        sample_rate: spec.rate,
        pts,
        duration,
    })
}

impl SymphoniaDecoder {
    pub fn new(stream: &StreamInfo) -> InteropResult<Self> {
        let codec = codec_type(&stream.codec).ok_or_else(|| {
            InteropError::NoDecoder(format!("Symphonia: {:?}", stream.codec))
        })?;

        let mut params = CodecParameters::new();
        params.for_codec(codec);
        if stream.sample_rate > 0 {
            params.with_sample_rate(stream.sample_rate);
        }
        if stream.channels > 0 {
            params.with_channels(channel_mask(stream.channels));
        }
        if !stream.extradata.is_empty() {
            params.with_extra_data(stream.extradata.clone().into_boxed_slice());
        }

        let decoder = ::symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| InteropError::NoDecoder(format!("Symphonia: {}", e)))?;

        Ok(Self {
            decoder,
            strip_adts: stream.codec == CodecId::Aac && stream.extradata.is_empty(),
            time_base: stream.time_base,
            ready: VecDeque::new(),
        })
    }
}

impl FrameDecoder for SymphoniaDecoder {
    fn name(&self) -> &str {
        "Symphonia"
    }

    fn send_packet(&mut self, packet: &Packet) -> InteropResult<()> {
        let mut data: &[u8] = &packet.data;
        if self.strip_adts {
            if let Some(len) = adts_header_len(data) {
                data = &data[len..];
            }
        }

        let pts = packet.best_timestamp();
        let ts = pts.unwrap_or(0).max(0) as u64;
        let sym_packet = SymphoniaPacket::new_from_slice(0, ts, packet.duration.max(0) as u64, data);

        let decoded = match self.decoder.decode(&sym_packet) {
            Ok(audio_buf) => Ok(to_audio_frame(audio_buf, pts, self.time_base)),
            Err(e) => Err(e),
        };

        match decoded {
            Ok(Some(frame)) => {
                self.ready.push_back(frame);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(SymphoniaError::ResetRequired) => {
                self.decoder.reset();
                Err(InteropError::Decode("Symphonia decoder reset".into()))
            }
            Err(e) => Err(InteropError::Decode(format!("Symphonia decode error: {}", e))),
        }
    }

    fn send_eof(&mut self) -> InteropResult<()> {
        Ok(())
    }

    fn receive_frame(&mut self) -> InteropResult<Option<DecodedFrame>> {
        Ok(self.ready.pop_front().map(DecodedFrame::Audio))
    }

    fn flush(&mut self) {
        self.ready.clear();
        self.decoder.reset();
    }
}
