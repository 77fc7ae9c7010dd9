//! Decode to NV12 pictures or interleaved PCM.
//!
//! Decoders buffer: one packet may yield nothing, one frame, or several.
//! Each pull drains ready frames first and only reads more packets when the
//! decoder asks for input. At end of stream the decoder is drained before
//! end of stream is reported.

use std::sync::Arc;

use bytes::Bytes;

use super::{ProviderBase, ProviderVariant, SampleProvider};
use crate::convert::{nv12_size, output_bits, pack_pcm};
use crate::decode::{DecodedFrame, DecoderFactory, FrameDecoder};
use crate::error::{InteropError, InteropResult};
use crate::packet::{Sample, StreamKind};
use crate::reader::StreamReader;
use crate::source::StreamInfo;

pub struct UncompressedSampleProvider {
    base: ProviderBase,
    stream: StreamInfo,
    decoders: Arc<dyn DecoderFactory>,
    decoder: Option<Box<dyn FrameDecoder>>,
    /// PCM output depth.
    bits: u32,
    /// End of input was sent; remaining frames are drained.
    draining: bool,
    last_timestamp: Option<i64>,
}

impl UncompressedSampleProvider {
    pub fn new(base: ProviderBase, stream: StreamInfo, decoders: Arc<dyn DecoderFactory>) -> Self {
        Self {
            bits: output_bits(stream.bits_per_coded_sample),
            base,
            stream,
            decoders,
            decoder: None,
            draining: false,
            last_timestamp: None,
        }
    }

    fn next_frame(&mut self) -> Option<DecodedFrame> {
        let decoder = self.decoder.as_mut()?;
        match decoder.receive_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("{} dropped a frame: {}", decoder.name(), e);
                None
            }
        }
    }

    fn frame_sample(&mut self, frame: DecodedFrame) -> InteropResult<Sample> {
        let mut timestamp = self.base.timestamp(frame.pts());
        // Decoders with broken reordering can step backwards.
        if let Some(last) = self.last_timestamp.filter(|&last| timestamp < last) {
            tracing::trace!("Clamping timestamp {} to {}", timestamp, last);
            timestamp = last;
        }
        self.last_timestamp = Some(timestamp);
        let duration = self.base.duration(frame.duration());

        let sample = match frame {
            DecodedFrame::Video(video) => self.base.make_sample(
                Bytes::from(video.data),
                timestamp,
                duration,
                video.keyframe,
                None,
            ),
            DecodedFrame::Audio(audio) => {
                let pcm = pack_pcm(&audio.samples, self.bits)?;
                self.base
                    .make_sample(Bytes::from(pcm), timestamp, duration, true, None)
            }
        };
        Ok(sample)
    }
}

impl SampleProvider for UncompressedSampleProvider {
    fn kind(&self) -> StreamKind {
        self.base.kind()
    }

    fn stream_index(&self) -> usize {
        self.base.stream_index()
    }

    fn variant(&self) -> ProviderVariant {
        ProviderVariant::Uncompressed
    }

    fn allocate_resources(&mut self) -> InteropResult<()> {
        let decoder = self.decoders.create(&self.stream)?;

        // One output frame must fit before the stream is accepted.
        let frame_bytes = match self.base.kind() {
            StreamKind::Video => {
                nv12_size(self.stream.width as usize, self.stream.height as usize)
            }
            StreamKind::Audio => {
                self.stream.sample_rate.max(1) as usize
                    * self.stream.channels.max(1) as usize
                    * (self.bits / 8) as usize
            }
        };
        let mut probe: Vec<u8> = Vec::new();
        probe.try_reserve_exact(frame_bytes)?;

        tracing::debug!(
            "{} stream {} decoding with {}",
            self.base.kind(),
            self.base.stream_index(),
            decoder.name()
        );
        self.decoder = Some(decoder);
        Ok(())
    }

    fn get_next_sample(&mut self, reader: &StreamReader) -> InteropResult<Option<Sample>> {
        if self.base.is_end_of_stream() {
            return Ok(None);
        }
        if self.decoder.is_none() {
            return Err(InteropError::NoDecoder(format!(
                "stream {} has no decoder allocated",
                self.base.stream_index()
            )));
        }

        loop {
            if let Some(frame) = self.next_frame() {
                return self.frame_sample(frame).map(Some);
            }
            if self.draining {
                self.base.set_end_of_stream();
                return Ok(None);
            }

            let packet = self.base.read_packet(reader)?;
            let Some(decoder) = self.decoder.as_mut() else {
                return Ok(None);
            };
            match packet {
                Some(packet) => {
                    if let Err(e) = decoder.send_packet(&packet) {
                        tracing::warn!(
                            "{} skipped packet (pts {:?}) on stream {}: {}",
                            decoder.name(),
                            packet.pts,
                            packet.stream_index,
                            e
                        );
                    }
                }
                None => {
                    if let Err(e) = decoder.send_eof() {
                        tracing::warn!("{} failed to drain: {}", decoder.name(), e);
                    }
                    self.draining = true;
                }
            }
        }
    }

    fn flush(&mut self, reader: &StreamReader) {
        self.base.flush(reader);
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
        self.draining = false;
        self.last_timestamp = None;
    }
}
