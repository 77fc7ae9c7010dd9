//! OpenH264 software H.264 decoder.
//!
//! OpenH264 returns pictures without any timing. Presentation timestamps of
//! submitted packets are kept in a min-heap and the smallest one is assigned
//! to each picture as it comes out, which restores presentation order for
//! streams with B-frames.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use ::openh264::decoder::{DecodedYUV, Decoder};
use ::openh264::formats::YUVSource;

use super::{DecodedFrame, FrameDecoder, VideoFrame};
use crate::convert::{i420_to_nv12, YuvPlanes};
use crate::error::{InteropError, InteropResult};
use crate::h264::{avcc_to_annexb, AvcConfig, NalFraming};
use crate::packet::Packet;
use crate::source::StreamInfo;

pub struct OpenH264Decoder {
    decoder: Decoder,
    framing: NalFraming,
    /// Annex B SPS/PPS from the stream configuration.
    parameter_sets: Vec<u8>,
    /// Feed `parameter_sets` ahead of the next packet.
    needs_parameter_sets: bool,
    /// (pts, duration) of packets whose pictures have not come out yet.
    pending_timing: TimingHeap,
    ready: VecDeque<VideoFrame>,
}

fn create_decoder() -> InteropResult<Decoder> {
    Decoder::new().map_err(|e| InteropError::NoDecoder(format!("OpenH264: {:?}", e)))
}

type TimingHeap = BinaryHeap<Reverse<(i64, i64)>>;

/// Repack one picture as NV12 and give it the earliest outstanding timing.
fn picture_frame(
    yuv: &DecodedYUV<'_>,
    timing: &mut TimingHeap,
    keyframe: bool,
) -> InteropResult<VideoFrame> {
    let (width, height) = yuv.dimensions();
    let strides = yuv.strides();
    let planes = YuvPlanes {
        width,
        height,
        y: yuv.y(),
        u: yuv.u(),
        v: yuv.v(),
        y_stride: strides.0,
        uv_stride: strides.1,
    };
    let data = i420_to_nv12(&planes)?;
    let (pts, duration) = match timing.pop() {
        Some(Reverse((pts, duration))) => (Some(pts), duration),
        None => (None, 0),
    };
    Ok(VideoFrame {
        width: width as u32,
        height: height as u32,
        data,
        pts,
        duration,
        keyframe,
    })
}

impl OpenH264Decoder {
    pub fn new(stream: &StreamInfo) -> InteropResult<Self> {
        let parameter_sets = AvcConfig::parse(&stream.extradata)
            .map(|config| config.parameter_sets)
            .unwrap_or_else(|| stream.extradata.clone());

        Ok(Self {
            decoder: create_decoder()?,
            framing: NalFraming::detect(&stream.extradata),
            needs_parameter_sets: !parameter_sets.is_empty(),
            parameter_sets,
            pending_timing: BinaryHeap::new(),
            ready: VecDeque::new(),
        })
    }
}

impl FrameDecoder for OpenH264Decoder {
    fn name(&self) -> &str {
        "OpenH264"
    }

    fn send_packet(&mut self, packet: &Packet) -> InteropResult<()> {
        let payload = match self.framing {
            NalFraming::Avc { nal_length_size } => avcc_to_annexb(&packet.data, nal_length_size)?,
            NalFraming::AnnexB => packet.data.to_vec(),
        };

        let data = if self.needs_parameter_sets {
            self.needs_parameter_sets = false;
            let mut data = Vec::with_capacity(self.parameter_sets.len() + payload.len());
            data.extend_from_slice(&self.parameter_sets);
            data.extend_from_slice(&payload);
            data
        } else {
            payload
        };

        if let Some(pts) = packet.best_timestamp() {
            self.pending_timing.push(Reverse((pts, packet.duration)));
        }

        match self.decoder.decode(&data) {
            Ok(Some(yuv)) => {
                let frame = picture_frame(&yuv, &mut self.pending_timing, packet.keyframe)?;
                self.ready.push_back(frame);
                Ok(())
            }
            // Decoder needs more data
            Ok(None) => Ok(()),
            Err(e) => Err(InteropError::Decode(format!("OpenH264 decode error: {:?}", e))),
        }
    }

    fn send_eof(&mut self) -> InteropResult<()> {
        // The reorder buffer still holds pictures after the last NAL unit.
        let drained = self
            .decoder
            .flush_remaining()
            .map_err(|e| InteropError::Decode(format!("OpenH264 drain error: {:?}", e)));
        let result = drained.and_then(|pictures| {
            for yuv in &pictures {
                let frame = picture_frame(yuv, &mut self.pending_timing, false)?;
                self.ready.push_back(frame);
            }
            tracing::trace!("OpenH264 drained {} picture(s)", pictures.len());
            Ok(())
        });
        // Leftover timing belongs to packets that produced nothing.
        self.pending_timing.clear();
        result
    }

    fn receive_frame(&mut self) -> InteropResult<Option<DecodedFrame>> {
        Ok(self.ready.pop_front().map(DecodedFrame::Video))
    }

    fn flush(&mut self) {
        self.ready.clear();
        self.pending_timing.clear();
        self.needs_parameter_sets = !self.parameter_sets.is_empty();
        // Recreate decoder
        match create_decoder() {
            Ok(decoder) => self.decoder = decoder,
            Err(e) => tracing::warn!("Keeping old H.264 decoder after flush: {}", e),
        }
    }
}
