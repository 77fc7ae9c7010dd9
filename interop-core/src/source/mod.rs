//! # Packet Sources
//!
//! Demultiplexers that turn a byte stream into coded packets tagged with a
//! stream index and a timestamp in that stream's time base.
//!
//! ```text
//! ┌─────────────┐     ┌───────────┐     ┌──────────────┐
//! │ path / URI  │────►│ File      │──┐  │ Mp4Source    │
//! └─────────────┘     └───────────┘  ├─►│ MatroskaSrc  │──► Packet
//! ┌─────────────┐     ┌───────────┐  │  └──────────────┘
//! │ host stream │────►│ IoAdapter │──┘
//! └─────────────┘     └───────────┘
//! ```

pub mod io;
pub mod matroska;
pub mod mp4;
pub mod options;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{InteropError, InteropResult};
use crate::packet::Packet;
use crate::time::Rational;

pub use self::io::{CallbackIo, IoAdapter, IoCallbacks, Whence, IO_BUFFER_SIZE};
pub use self::options::{FormatHint, SourceOptions};

/// Readable, seekable and sendable byte stream.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum CodecId {
    // Video
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    Mpeg4,
    // Audio
    Aac,
    Mp3,
    WmaV1,
    WmaV2,
    WmaPro,
    Flac,
    Vorbis,
    Opus,
    Alac,
    Ac3,
    Eac3,
    PcmU8,
    PcmS16Le,
    PcmS16Be,
    PcmS24Le,
    PcmS32Le,
    PcmF32Le,
    Unknown(String),
}

impl CodecId {
    pub fn is_pcm(&self) -> bool {
        matches!(
            self,
            Self::PcmU8
                | Self::PcmS16Le
                | Self::PcmS16Be
                | Self::PcmS24Le
                | Self::PcmS32Le
                | Self::PcmF32Le
        )
    }

    pub fn is_wma(&self) -> bool {
        matches!(self, Self::WmaV1 | Self::WmaV2 | Self::WmaPro)
    }
}

/// Codec parameters of one elementary stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub index: usize,
    pub media_type: MediaType,
    pub codec: CodecId,
    pub time_base: Rational,
    /// First presentation time, in `time_base`.
    pub start_time: Option<i64>,
    #[serde(skip)]
    pub extradata: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sample_aspect_ratio: Option<Rational>,
    /// Rate reported by the codec configuration.
    pub codec_frame_rate: Option<Rational>,
    /// Container-level average rate.
    pub avg_frame_rate: Option<Rational>,
    pub sample_rate: u32,
    pub channels: u32,
    pub bits_per_coded_sample: u32,
    pub bit_rate: u64,
    pub profile: Option<i32>,
    pub default: bool,
    /// Cover art stored as a one-frame video stream.
    pub attached_pic: bool,
}

impl StreamInfo {
    pub fn new(index: usize, media_type: MediaType, codec: CodecId, time_base: Rational) -> Self {
        Self {
            index,
            media_type,
            codec,
            time_base,
            start_time: None,
            extradata: Vec::new(),
            width: 0,
            height: 0,
            sample_aspect_ratio: None,
            codec_frame_rate: None,
            avg_frame_rate: None,
            sample_rate: 0,
            channels: 0,
            bits_per_coded_sample: 0,
            bit_rate: 0,
            profile: None,
            default: false,
            attached_pic: false,
        }
    }
}

/// A demultiplexer context.
///
/// Not reentrant: callers serialize access (the stream reader holds it behind
/// one lock).
pub trait PacketSource: Send {
    fn format_name(&self) -> &'static str;

    fn streams(&self) -> &[StreamInfo];

    /// Container duration in microseconds, `None` when unknown (live).
    fn duration_us(&self) -> Option<i64>;

    /// Next packet in container order, `Ok(None)` at end of stream.
    fn read_packet(&mut self) -> InteropResult<Option<Packet>>;

    /// Reposition so the next packet of `stream_index` is the nearest sync
    /// point at or before `timestamp` (in that stream's time base).
    fn seek(&mut self, stream_index: usize, timestamp: i64) -> InteropResult<()>;
}

/// Best stream of a media type: the default-flagged one, else the first.
/// Cover art and streams with an unrecognised codec never qualify.
pub fn find_best_stream(streams: &[StreamInfo], media_type: MediaType) -> Option<&StreamInfo> {
    let mut candidates = streams.iter().filter(|s| {
        s.media_type == media_type && !s.attached_pic && !matches!(s.codec, CodecId::Unknown(_))
    });
    let first = candidates.clone().next();
    candidates.find(|s| s.default).or(first)
}

/// Open a named resource: a plain path or a `file://` URL.
pub fn open_uri(uri: &str, options: &SourceOptions) -> InteropResult<Box<dyn PacketSource>> {
    let path = resolve_uri(uri)?;
    let file = File::open(&path).map_err(|e| {
        InteropError::InvalidInput(format!("Failed to open {}: {}", path.display(), e))
    })?;
    tracing::info!("Opening {}", path.display());
    open_reader(Box::new(file), options)
}

/// Open a host-supplied byte stream through a buffered adapter.
pub fn open_stream(
    io: Box<dyn IoCallbacks>,
    options: &SourceOptions,
) -> InteropResult<Box<dyn PacketSource>> {
    open_reader(Box::new(IoAdapter::new(io)), options)
}

fn resolve_uri(uri: &str) -> InteropResult<PathBuf> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(InteropError::InvalidInput("empty URI".into()));
    }

    match url::Url::parse(uri) {
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map_err(|_| InteropError::InvalidInput(format!("Bad file URL: {}", uri))),
        // Single letters are Windows drive prefixes, not schemes.
        Ok(url) if url.scheme().len() > 1 => Err(InteropError::UnsupportedInput(format!(
            "Protocol '{}' is not supported",
            url.scheme()
        ))),
        _ => Ok(PathBuf::from(uri)),
    }
}

fn open_reader(
    mut reader: Box<dyn ReadSeek>,
    options: &SourceOptions,
) -> InteropResult<Box<dyn PacketSource>> {
    let format = match options.format {
        FormatHint::Auto => sniff(&mut reader, options.probe_size)?,
        forced => forced,
    };

    let source: Box<dyn PacketSource> = match format {
        FormatHint::Mp4 => Box::new(mp4::Mp4Source::open(reader)?),
        FormatHint::Matroska => Box::new(matroska::MatroskaSource::open(reader)?),
        FormatHint::Auto => {
            return Err(InteropError::UnsupportedInput(
                "Unrecognised container".into(),
            ))
        }
    };

    tracing::debug!(
        "Opened {} source with {} stream(s)",
        source.format_name(),
        source.streams().len()
    );

    if options.generate_pts {
        Ok(Box::new(FillPts { inner: source }))
    } else {
        Ok(source)
    }
}

/// Inspect the head of the stream. Leaves the reader at offset 0.
fn sniff(reader: &mut Box<dyn ReadSeek>, probe_size: usize) -> InteropResult<FormatHint> {
    let limit = probe_size.min(options::MAX_PROBE_SIZE);
    let mut head = Vec::new();
    reader.by_ref().take(limit as u64).read_to_end(&mut head)?;
    reader.seek(SeekFrom::Start(0))?;
    Ok(detect_format(&head))
}

pub fn detect_format(head: &[u8]) -> FormatHint {
    if head.len() >= 4 && head[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        return FormatHint::Matroska;
    }
    if head.len() >= 8 {
        match &head[4..8] {
            b"ftyp" | b"moov" | b"mdat" | b"free" | b"wide" | b"skip" => return FormatHint::Mp4,
            _ => {}
        }
    }
    FormatHint::Auto
}

/// Copies dts into a missing pts.
struct FillPts {
    inner: Box<dyn PacketSource>,
}

impl PacketSource for FillPts {
    fn format_name(&self) -> &'static str {
        self.inner.format_name()
    }

    fn streams(&self) -> &[StreamInfo] {
        self.inner.streams()
    }

    fn duration_us(&self) -> Option<i64> {
        self.inner.duration_us()
    }

    fn read_packet(&mut self) -> InteropResult<Option<Packet>> {
        Ok(self.inner.read_packet()?.map(|mut packet| {
            if packet.pts.is_none() {
                packet.pts = packet.dts;
            }
            packet
        }))
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> InteropResult<()> {
        self.inner.seek(stream_index, timestamp)
    }
}
