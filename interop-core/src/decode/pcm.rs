//! Raw PCM "decoder": reinterprets packet bytes as samples.

use std::collections::VecDeque;

use super::{AudioFrame, DecodedFrame, FrameDecoder};
use crate::convert::unpack_pcm;
use crate::error::{InteropError, InteropResult};
use crate::packet::Packet;
use crate::source::{CodecId, StreamInfo};
use crate::time::{rescale, Rational, Rounding};

pub struct PcmDecoder {
    codec: CodecId,
    channels: u32,
    sample_rate: u32,
    time_base: Rational,
    ready: VecDeque<AudioFrame>,
}

impl PcmDecoder {
    pub fn new(stream: &StreamInfo) -> Self {
        Self {
            codec: stream.codec.clone(),
            channels: stream.channels.max(1),
            sample_rate: stream.sample_rate,
            time_base: stream.time_base,
            ready: VecDeque::new(),
        }
    }
}

impl FrameDecoder for PcmDecoder {
    fn name(&self) -> &str {
        "pcm"
    }

    fn send_packet(&mut self, packet: &Packet) -> InteropResult<()> {
        let samples = unpack_pcm(&packet.data, &self.codec)
            .ok_or_else(|| InteropError::Decode(format!("{:?} is not PCM", self.codec)))?;

        let frames = samples.len() as i64 / self.channels as i64;
        let duration = if self.sample_rate > 0 {
            rescale(
                frames,
                Rational::new(1, self.sample_rate as i64),
                self.time_base,
                Rounding::Nearest,
            )
        } else {
            packet.duration
        };

        self.ready.push_back(AudioFrame {
            samples,
            channels: self.channels,
            sample_rate: self.sample_rate,
            pts: packet.best_timestamp(),
            duration,
        });
        Ok(())
    }

    fn send_eof(&mut self) -> InteropResult<()> {
        Ok(())
    }

    fn receive_frame(&mut self) -> InteropResult<Option<DecodedFrame>> {
        Ok(self.ready.pop_front().map(DecodedFrame::Audio))
    }

    fn flush(&mut self) {
        self.ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MediaType;

    #[test]
    fn test_pcm_frame_duration_in_stream_units() {
        let mut stream = StreamInfo::new(1, MediaType::Audio, CodecId::PcmS16Le, Rational::new(1, 1000));
        stream.channels = 2;
        stream.sample_rate = 8000;
        let mut decoder = PcmDecoder::new(&stream);

        // 80 frames of stereo s16 = 10 ms
        let packet = Packet::new(1, vec![0u8; 80 * 2 * 2], Some(40));
        decoder.send_packet(&packet).unwrap();

        let Some(DecodedFrame::Audio(frame)) = decoder.receive_frame().unwrap() else {
            panic!("expected an audio frame");
        };
        assert_eq!(frame.pts, Some(40));
        assert_eq!(frame.duration, 10);
        assert_eq!(frame.frames(), 80);
        assert!(decoder.receive_frame().unwrap().is_none());
    }

    #[test]
    fn test_flush_discards_ready_frames() {
        let stream = StreamInfo::new(0, MediaType::Audio, CodecId::PcmU8, Rational::new(1, 8000));
        let mut decoder = PcmDecoder::new(&stream);
        decoder.send_packet(&Packet::new(0, vec![128u8; 16], Some(0))).unwrap();
        decoder.flush();
        assert!(decoder.receive_frame().unwrap().is_none());
    }
}
