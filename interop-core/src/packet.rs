//! Coded packets in, host samples out.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Which elementary stream a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Audio,
    Video,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// One unit of still-encoded data from the packet source.
///
/// Timestamps are in the owning stream's time base. A packet is consumed
/// exactly once: by the provider registered for `stream_index`, or dropped by
/// the stream reader when nothing is registered.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    pub data: Bytes,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Zero when the container does not say.
    pub duration: i64,
    pub keyframe: bool,
    /// Byte offset in the container, when known.
    pub position: Option<u64>,
}

impl Packet {
    pub fn new(stream_index: usize, data: impl Into<Bytes>, pts: Option<i64>) -> Self {
        Self {
            stream_index,
            data: data.into(),
            pts,
            dts: pts,
            duration: 0,
            keyframe: false,
            position: None,
        }
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    pub fn with_dts(mut self, dts: Option<i64>) -> Self {
        self.dts = dts;
        self
    }

    /// Presentation time, falling back to decode time.
    pub fn best_timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }
}

/// Decoder-specific metadata carried next to a sample payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideData {
    /// Annex-B SPS/PPS that were prepended to this keyframe's payload.
    ParameterSets(Bytes),
}

/// One host-consumable unit, timestamped in 100 ns units.
///
/// Ownership moves to the host on delivery; providers never reuse the buffer.
#[derive(Debug, Clone)]
pub struct Sample {
    pub data: Bytes,
    pub timestamp: i64,
    pub duration: i64,
    pub keyframe: bool,
    /// First sample after a flush.
    pub discontinuous: bool,
    pub side_data: Option<SideData>,
}

impl Sample {
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp / 10_000
    }
}

/// Result of a host pull.
#[derive(Debug, Clone)]
pub enum NextSample {
    Ready(Sample),
    /// Terminal for this stream until the next seek.
    EndOfStream,
    /// Nothing to give right now: closed pipeline, unknown stream, or an
    /// absorbed failure.
    Unavailable,
}

impl NextSample {
    pub fn into_sample(self) -> Option<Sample> {
        match self {
            Self::Ready(sample) => Some(sample),
            _ => None,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}
