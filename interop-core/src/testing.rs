//! In-memory stand-ins for a demuxer and a decoder.

use std::collections::VecDeque;

use crate::decode::{AudioFrame, DecodedFrame, DecoderFactory, FrameDecoder, VideoFrame};
use crate::error::{InteropError, InteropResult};
use crate::packet::Packet;
use crate::source::{CodecId, MediaType, PacketSource, StreamInfo};
use crate::time::Rational;

// ============================================================================
// Scripted packet source
// ============================================================================

/// Plays back a fixed packet list. Seeking moves the cursor to the last
/// keyframe of the reference stream at or before the target, like a
/// container index would.
pub struct ScriptedSource {
    streams: Vec<StreamInfo>,
    packets: Vec<Packet>,
    cursor: usize,
    duration_us: Option<i64>,
    fail_read_at: Option<usize>,
    fail_seeks: bool,
    reads: usize,
}

impl ScriptedSource {
    pub fn builder() -> ScriptedSourceBuilder {
        ScriptedSourceBuilder::default()
    }
}

#[derive(Default)]
pub struct ScriptedSourceBuilder {
    streams: Vec<StreamInfo>,
    packets: Vec<Packet>,
    duration_us: Option<i64>,
    fail_read_at: Option<usize>,
    fail_seeks: bool,
}

impl ScriptedSourceBuilder {
    pub fn stream(mut self, info: StreamInfo) -> Self {
        self.streams.push(info);
        self
    }

    /// H.264 video, Annex B, time base 1/`den`.
    pub fn video(self, index: usize, den: i64) -> Self {
        let mut info = StreamInfo::new(index, MediaType::Video, CodecId::H264, Rational::new(1, den));
        info.width = 640;
        info.height = 360;
        self.stream(info)
    }

    /// MP3 audio, time base 1/`den`.
    pub fn audio(self, index: usize, den: i64) -> Self {
        let mut info = StreamInfo::new(index, MediaType::Audio, CodecId::Mp3, Rational::new(1, den));
        info.sample_rate = 48000;
        info.channels = 2;
        self.stream(info)
    }

    pub fn data(self, index: usize, den: i64) -> Self {
        self.stream(StreamInfo::new(
            index,
            MediaType::Data,
            CodecId::Unknown("data".into()),
            Rational::new(1, den),
        ))
    }

    pub fn packet(mut self, stream: usize, pts: i64, keyframe: bool) -> Self {
        let payload = vec![stream as u8, (pts & 0xFF) as u8, 0xAB];
        self.packets
            .push(Packet::new(stream, payload, Some(pts)).with_keyframe(keyframe));
        self
    }

    pub fn raw_packet(mut self, packet: Packet) -> Self {
        self.packets.push(packet);
        self
    }

    /// Video (stream 0) every `video_ms` and audio (stream 1) every
    /// `audio_ms`, interleaved by timestamp with audio first on ties. Every
    /// `gop`-th video packet is a keyframe.
    pub fn interleaved(
        mut self,
        (video_ms, video_count): (i64, i64),
        gop: i64,
        (audio_ms, audio_count): (i64, i64),
    ) -> Self {
        let (video, audio) = (0usize, 1usize);
        let mut entries: Vec<(i64, usize, bool)> = Vec::new();
        for i in 0..video_count {
            entries.push((i * video_ms, video, i % gop == 0));
        }
        for i in 0..audio_count {
            entries.push((i * audio_ms, audio, true));
        }
        entries.sort_by_key(|&(pts, stream, _)| (pts, stream != audio));
        for (pts, stream, keyframe) in entries {
            let duration = if stream == video { video_ms } else { audio_ms };
            self.packets.push(
                Packet::new(stream, vec![stream as u8, (pts & 0xFF) as u8], Some(pts))
                    .with_keyframe(keyframe)
                    .with_duration(duration),
            );
        }
        self
    }

    pub fn duration_us(mut self, duration_us: i64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    /// The read with this zero-based number fails as a source error.
    pub fn fail_read_at(mut self, read: usize) -> Self {
        self.fail_read_at = Some(read);
        self
    }

    pub fn fail_seeks(mut self) -> Self {
        self.fail_seeks = true;
        self
    }

    pub fn build(self) -> ScriptedSource {
        ScriptedSource {
            streams: self.streams,
            packets: self.packets,
            cursor: 0,
            duration_us: self.duration_us,
            fail_read_at: self.fail_read_at,
            fail_seeks: self.fail_seeks,
            reads: 0,
        }
    }
}

impl PacketSource for ScriptedSource {
    fn format_name(&self) -> &'static str {
        "scripted"
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    fn read_packet(&mut self) -> InteropResult<Option<Packet>> {
        let read = self.reads;
        self.reads += 1;
        if self.fail_read_at == Some(read) {
            return Err(InteropError::Source("scripted read failure".into()));
        }
        let packet = self.packets.get(self.cursor).cloned();
        if packet.is_some() {
            self.cursor += 1;
        }
        Ok(packet)
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> InteropResult<()> {
        if self.fail_seeks {
            return Err(InteropError::Seek("scripted seek failure".into()));
        }
        if !self.streams.iter().any(|s| s.index == stream_index) {
            return Err(InteropError::Seek(format!("no stream {}", stream_index)));
        }
        let position = self
            .packets
            .iter()
            .rposition(|p| {
                p.stream_index == stream_index
                    && p.keyframe
                    && p.pts.map_or(false, |pts| pts <= timestamp)
            })
            .ok_or_else(|| InteropError::Seek(format!("no keyframe before {}", timestamp)))?;
        self.cursor = position;
        Ok(())
    }
}

// ============================================================================
// Scripted decoder
// ============================================================================

/// Emits `frames_per_packet` frames per packet once `delay` further packets
/// have been submitted, mimicking a decoder with a reorder buffer.
#[derive(Debug, Clone, Copy)]
pub struct ScriptedDecoders {
    pub delay: usize,
    /// Release held packets lowest pts first instead of in submission order.
    pub reorder: bool,
    pub frames_per_packet: usize,
    /// Packets whose first payload byte equals this fail to decode.
    pub corrupt_marker: Option<u8>,
    pub unavailable: bool,
}

impl Default for ScriptedDecoders {
    fn default() -> Self {
        Self {
            delay: 0,
            reorder: false,
            frames_per_packet: 1,
            corrupt_marker: None,
            unavailable: false,
        }
    }
}

impl DecoderFactory for ScriptedDecoders {
    fn create(&self, stream: &StreamInfo) -> InteropResult<Box<dyn FrameDecoder>> {
        if self.unavailable {
            return Err(InteropError::NoDecoder(format!("{:?}", stream.codec)));
        }
        Ok(Box::new(ScriptedDecoder {
            config: *self,
            media_type: stream.media_type,
            channels: stream.channels.max(1),
            held: VecDeque::new(),
            ready: VecDeque::new(),
        }))
    }
}

pub struct ScriptedDecoder {
    config: ScriptedDecoders,
    media_type: MediaType,
    channels: u32,
    held: VecDeque<Packet>,
    ready: VecDeque<DecodedFrame>,
}

impl ScriptedDecoder {
    fn take_held(&mut self) -> Option<Packet> {
        if !self.config.reorder {
            return self.held.pop_front();
        }
        let (index, _) = self
            .held
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.pts.unwrap_or(i64::MIN))?;
        self.held.remove(index)
    }

    fn release(&mut self, packet: Packet) {
        let count = self.config.frames_per_packet.max(1) as i64;
        let step = packet.duration / count;
        for i in 0..count {
            let pts = packet.pts.map(|pts| pts + i * step);
            let frame = match self.media_type {
                MediaType::Video => DecodedFrame::Video(VideoFrame {
                    width: 2,
                    height: 2,
                    data: vec![packet.data[0]; 6],
                    pts,
                    duration: step,
                    keyframe: packet.keyframe && i == 0,
                }),
                _ => DecodedFrame::Audio(AudioFrame {
                    samples: vec![i32::MAX; 4 * self.channels as usize],
                    channels: self.channels,
                    sample_rate: 48000,
                    pts,
                    duration: step,
                }),
            };
            self.ready.push_back(frame);
        }
    }
}

impl FrameDecoder for ScriptedDecoder {
    fn name(&self) -> &str {
        "scripted"
    }

    fn send_packet(&mut self, packet: &Packet) -> InteropResult<()> {
        if self.config.corrupt_marker.is_some()
            && packet.data.first() == self.config.corrupt_marker.as_ref()
        {
            return Err(InteropError::Decode("scripted corrupt packet".into()));
        }
        self.held.push_back(packet.clone());
        while self.held.len() > self.config.delay {
            if let Some(packet) = self.take_held() {
                self.release(packet);
            }
        }
        Ok(())
    }

    fn send_eof(&mut self) -> InteropResult<()> {
        while let Some(packet) = self.take_held() {
            self.release(packet);
        }
        Ok(())
    }

    fn receive_frame(&mut self) -> InteropResult<Option<DecodedFrame>> {
        Ok(self.ready.pop_front())
    }

    fn flush(&mut self) {
        self.held.clear();
        self.ready.clear();
    }
}
