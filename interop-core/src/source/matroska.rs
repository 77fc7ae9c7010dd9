// Matroska/WebM packet source on top of the matroska-demuxer crate.
// The crate reads forward only, so seeking re-opens the segment and replays
// packets from the closest reference keyframe.

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::Bytes;
use matroska_demuxer::{Frame, MatroskaFile, TrackEntry, TrackType};
use parking_lot::Mutex;

use super::{CodecId, MediaType, PacketSource, ReadSeek, StreamInfo};
use crate::error::{InteropError, InteropResult};
use crate::packet::Packet;
use crate::time::{rescale, Rational, Rounding};

/// Frame timestamps come out of the demuxer in nanoseconds.
const NANOSECOND_TIME_BASE: Rational = Rational::new(1, 1_000_000_000);

// ============================================================================
// Shared reader
// ============================================================================

/// Independent cursor over a shared byte stream.
///
/// Every handle keeps its own position, so a scan through a freshly opened
/// segment never disturbs the handle the live demuxer is reading from.
struct SharedReader {
    inner: Arc<Mutex<Box<dyn ReadSeek>>>,
    pos: u64,
}

impl SharedReader {
    fn new(inner: Box<dyn ReadSeek>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
            pos: 0,
        }
    }

    fn rewound(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            pos: 0,
        }
    }
}

impl Read for SharedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        inner.seek(SeekFrom::Start(self.pos))?;
        let n = inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SharedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(_) => Some(self.inner.lock().seek(pos)?),
        };
        self.pos = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;
        Ok(self.pos)
    }
}

type Segment = MatroskaFile<BufReader<SharedReader>>;

fn open_segment(reader: SharedReader) -> InteropResult<Segment> {
    MatroskaFile::open(BufReader::new(reader))
        .map_err(|e| InteropError::InvalidInput(format!("Failed to open Matroska: {:?}", e)))
}

// ============================================================================
// Source
// ============================================================================

pub struct MatroskaSource {
    reader: SharedReader,
    segment: Segment,
    frame: Frame,
    streams: Vec<StreamInfo>,
    /// Track number to stream index.
    track_map: HashMap<u64, usize>,
    duration_us: Option<i64>,
    /// Packets already read by a seek scan, served before the segment.
    replay: VecDeque<Packet>,
}

impl MatroskaSource {
    pub fn open(reader: Box<dyn ReadSeek>) -> InteropResult<Self> {
        let reader = SharedReader::new(reader);
        let segment = open_segment(reader.rewound())?;

        let scale = segment.info().timestamp_scale().get();
        let duration_us = segment
            .info()
            .duration()
            .map(|ticks| (ticks * scale as f64 / 1000.0).round() as i64)
            .filter(|&us| us > 0);

        let mut streams = Vec::new();
        let mut track_map = HashMap::new();
        for track in segment.tracks() {
            let index = streams.len();
            track_map.insert(track.track_number().get(), index);
            streams.push(convert_track(track, index));
        }
        if streams.is_empty() {
            return Err(InteropError::UnsupportedInput("Matroska file has no tracks".into()));
        }

        tracing::debug!(
            "Matroska: {} track(s), timestamp scale {} ns, duration {:?} us",
            streams.len(),
            scale,
            duration_us
        );

        Ok(Self {
            reader,
            segment,
            frame: Frame::default(),
            streams,
            track_map,
            duration_us,
            replay: VecDeque::new(),
        })
    }

    fn media_type_of(&self, index: usize) -> MediaType {
        self.streams[index].media_type
    }
}

fn read_frame(
    segment: &mut Segment,
    frame: &mut Frame,
    track_map: &HashMap<u64, usize>,
    streams: &[StreamInfo],
) -> InteropResult<Option<Packet>> {
    loop {
        match segment.next_frame(frame) {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => {
                return Err(InteropError::Source(format!("Matroska read error: {:?}", e)));
            }
        }

        let Some(&index) = track_map.get(&frame.track) else {
            tracing::warn!("Matroska: frame for unknown track {}", frame.track);
            continue;
        };
        // BlockGroups carry no keyframe flag; audio frames are all sync points.
        let keyframe = frame
            .is_keyframe
            .unwrap_or(streams[index].media_type == MediaType::Audio);

        let data = Bytes::from(std::mem::take(&mut frame.data));
        return Ok(Some(
            Packet::new(index, data, Some(frame.timestamp as i64)).with_keyframe(keyframe),
        ));
    }
}

impl PacketSource for MatroskaSource {
    fn format_name(&self) -> &'static str {
        "matroska"
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    fn read_packet(&mut self) -> InteropResult<Option<Packet>> {
        if let Some(packet) = self.replay.pop_front() {
            return Ok(Some(packet));
        }
        read_frame(&mut self.segment, &mut self.frame, &self.track_map, &self.streams)
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> InteropResult<()> {
        if stream_index >= self.streams.len() {
            return Err(InteropError::Seek(format!("no stream {}", stream_index)));
        }
        let reference_tb = self.streams[stream_index].time_base;
        let target = rescale(timestamp, reference_tb, NANOSECOND_TIME_BASE, Rounding::Down);
        let require_keyframe = self.media_type_of(stream_index) == MediaType::Video;

        let mut segment = open_segment(self.reader.rewound())
            .map_err(|e| InteropError::Seek(e.to_string()))?;
        let mut frame = Frame::default();
        let track_map = &self.track_map;
        let streams = &self.streams;
        let packets =
            std::iter::from_fn(|| read_frame(&mut segment, &mut frame, track_map, streams).transpose());

        let replay = select_gop(packets, stream_index, target, require_keyframe)?;
        tracing::debug!(
            "Matroska seek to {} ns on stream {}: replaying {} packet(s)",
            target,
            stream_index,
            replay.len()
        );

        self.segment = segment;
        self.frame = frame;
        self.replay = replay;
        Ok(())
    }
}

/// Packets from the last sync point of `reference` at or before `target`,
/// up to and including the first reference packet past `target`.
fn select_gop<I>(
    packets: I,
    reference: usize,
    target: i64,
    require_keyframe: bool,
) -> InteropResult<VecDeque<Packet>>
where
    I: Iterator<Item = InteropResult<Packet>>,
{
    let mut gop: VecDeque<Packet> = VecDeque::new();
    let mut started = false;

    for packet in packets {
        let packet = packet.map_err(|e| InteropError::Seek(e.to_string()))?;
        if packet.stream_index == reference {
            let pts = packet.pts.unwrap_or(i64::MIN);
            if pts > target && started {
                gop.push_back(packet);
                return Ok(gop);
            }
            if pts <= target && (packet.keyframe || !require_keyframe) {
                gop.clear();
                started = true;
            }
        }
        if started {
            gop.push_back(packet);
        }
    }

    if started {
        Ok(gop)
    } else {
        Err(InteropError::Seek(format!(
            "no sync point at or before {} on stream {}",
            target, reference
        )))
    }
}

// ============================================================================
// Track conversion
// ============================================================================

fn convert_track(track: &TrackEntry, index: usize) -> StreamInfo {
    let codec_id = track.codec_id();
    let private = track.codec_private().unwrap_or(&[]);

    let media_type = match track.track_type() {
        TrackType::Video => MediaType::Video,
        TrackType::Audio => MediaType::Audio,
        TrackType::Subtitle => MediaType::Subtitle,
        _ => MediaType::Data,
    };

    let bit_depth = track
        .audio()
        .and_then(|a| a.bit_depth())
        .map(|d| d.get() as u32)
        .unwrap_or(0);

    let (codec, extradata, bits) = if codec_id == "A_MS/ACM" {
        match parse_wave_format(private) {
            Some(wave) => (wave.codec, wave.extradata, wave.bits),
            None => (CodecId::Unknown(codec_id.to_string()), Vec::new(), bit_depth),
        }
    } else {
        (map_codec_id(codec_id, bit_depth), private.to_vec(), bit_depth)
    };

    let mut info = StreamInfo::new(index, media_type, codec, NANOSECOND_TIME_BASE);
    info.extradata = extradata;
    info.bits_per_coded_sample = bits;
    info.default = track.flag_default();
    info.codec_frame_rate = track
        .default_duration()
        .map(|d| Rational::new(1_000_000_000, d.get() as i64).reduced());

    if let Some(video) = track.video() {
        info.width = video.pixel_width().get() as u32;
        info.height = video.pixel_height().get() as u32;
        info.sample_aspect_ratio = aspect_from_display(
            (info.width as u64, info.height as u64),
            video.display_width().map(|w| w.get()),
            video.display_height().map(|h| h.get()),
        );
    }
    if let Some(audio) = track.audio() {
        info.sample_rate = audio.sampling_frequency().round() as u32;
        info.channels = audio.channels().get() as u32;
    }
    if info.codec == CodecId::H264 && info.extradata.len() > 1 {
        info.profile = Some(info.extradata[1] as i32);
    }

    info
}

fn map_codec_id(codec_id: &str, bit_depth: u32) -> CodecId {
    match codec_id {
        "V_MPEG4/ISO/AVC" => CodecId::H264,
        "V_MPEGH/ISO/HEVC" => CodecId::Hevc,
        "V_VP8" => CodecId::Vp8,
        "V_VP9" => CodecId::Vp9,
        "V_AV1" => CodecId::Av1,
        "V_MPEG4/ISO/ASP" | "V_MPEG4/ISO/SP" | "V_MPEG4/ISO/AP" => CodecId::Mpeg4,
        "A_MPEG/L3" => CodecId::Mp3,
        "A_FLAC" => CodecId::Flac,
        "A_VORBIS" => CodecId::Vorbis,
        "A_OPUS" => CodecId::Opus,
        "A_AC3" => CodecId::Ac3,
        "A_EAC3" => CodecId::Eac3,
        "A_ALAC" => CodecId::Alac,
        "A_PCM/INT/LIT" => match bit_depth {
            8 => CodecId::PcmU8,
            24 => CodecId::PcmS24Le,
            32 => CodecId::PcmS32Le,
            _ => CodecId::PcmS16Le,
        },
        "A_PCM/INT/BIG" => CodecId::PcmS16Be,
        "A_PCM/FLOAT/IEEE" => CodecId::PcmF32Le,
        id if id.starts_with("A_AAC") => CodecId::Aac,
        other => CodecId::Unknown(other.to_string()),
    }
}

/// Codec description carried in a `WAVEFORMATEX` (`A_MS/ACM` tracks).
struct WaveFormat {
    codec: CodecId,
    bits: u32,
    extradata: Vec<u8>,
}

fn parse_wave_format(private: &[u8]) -> Option<WaveFormat> {
    if private.len() < 16 {
        return None;
    }
    let le16 = |at: usize| u16::from_le_bytes([private[at], private[at + 1]]);
    let tag = le16(0);
    let bits = le16(14) as u32;

    let codec = match tag {
        0x0160 => CodecId::WmaV1,
        0x0161 => CodecId::WmaV2,
        0x0162 => CodecId::WmaPro,
        0x0055 => CodecId::Mp3,
        0x00FF | 0x1610 => CodecId::Aac,
        0x0001 => match bits {
            8 => CodecId::PcmU8,
            24 => CodecId::PcmS24Le,
            32 => CodecId::PcmS32Le,
            _ => CodecId::PcmS16Le,
        },
        0x0003 => CodecId::PcmF32Le,
        other => CodecId::Unknown(format!("A_MS/ACM:{:#06x}", other)),
    };

    let extradata = if private.len() >= 18 {
        let size = le16(16) as usize;
        private.get(18..18 + size).unwrap_or(&private[18..]).to_vec()
    } else {
        Vec::new()
    };

    Some(WaveFormat {
        codec,
        bits,
        extradata,
    })
}

/// Pixel aspect ratio implied by a display size that differs from the coded
/// size.
fn aspect_from_display(
    (width, height): (u64, u64),
    display_width: Option<u64>,
    display_height: Option<u64>,
) -> Option<Rational> {
    let (dw, dh) = (display_width?, display_height?);
    if width == 0 || height == 0 || dw == 0 || dh == 0 {
        return None;
    }
    let num = i64::try_from(dw.checked_mul(height)?).ok()?;
    let den = i64::try_from(dh.checked_mul(width)?).ok()?;
    Some(Rational::new(num, den).reduced())
}
