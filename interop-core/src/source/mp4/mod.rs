//! MP4/MOV demuxing.
//!
//! The `moov` box is read into memory and parsed into a flattened sample
//! index per track; packets are then served in decode-time order across
//! tracks, reading each sample straight from its file offset.

mod parser;
mod sample_table;

use std::io::{Read, Seek, SeekFrom};

use bytes::{Buf, Bytes};

use self::parser::{children, descriptor_length, ensure, find_child, fourcc, full_box_header, invalid};
use self::sample_table::{SampleEntry, SampleTable};
use super::{CodecId, MediaType, PacketSource, ReadSeek, StreamInfo};
use crate::error::{InteropError, InteropResult};
use crate::packet::Packet;
use crate::time::{rescale, Rational, Rounding, CONTAINER_TIME_BASE};

const VISUAL_SAMPLE_ENTRY_SIZE: usize = 78;
const AUDIO_SAMPLE_ENTRY_SIZE: usize = 28;

#[derive(Debug)]
struct Track {
    info: StreamInfo,
    samples: Vec<SampleEntry>,
    next: usize,
}

impl Track {
    fn timescale(&self) -> i64 {
        self.info.time_base.den
    }

    /// Index of the last sync sample presented at or before `pts`.
    ///
    /// Sync samples never reorder among themselves, so the latest one in
    /// decode order that qualifies is also the latest in presentation order.
    fn sync_sample_at_pts(&self, pts: i64) -> usize {
        self.samples
            .iter()
            .rposition(|s| s.keyframe && s.pts() <= pts)
            .unwrap_or(0)
    }

    /// Index of the last sync sample decoded at or before `dts`.
    fn sync_sample_at_dts(&self, dts: i64) -> usize {
        let upto = self.samples.partition_point(|s| s.dts <= dts);
        self.samples[..upto]
            .iter()
            .rposition(|s| s.keyframe)
            .unwrap_or(0)
    }
}

/// Per-track data collected while walking a `trak` box.
#[derive(Default)]
struct TrakBuilder {
    handler: Option<[u8; 4]>,
    timescale: u32,
    media_duration: u64,
    enabled: bool,
    edit_start: Option<i64>,
    entry: Option<SampleDescription>,
    table: SampleTable,
}

struct SampleDescription {
    codec: CodecId,
    width: u32,
    height: u32,
    sample_rate: u32,
    channels: u32,
    bits: u32,
    extradata: Vec<u8>,
    profile: Option<i32>,
    aspect: Option<Rational>,
    bit_rate: u64,
}

impl SampleDescription {
    fn new(codec: CodecId) -> Self {
        Self {
            codec,
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
            bits: 0,
            extradata: Vec::new(),
            profile: None,
            aspect: None,
            bit_rate: 0,
        }
    }
}

pub struct Mp4Source {
    tracks: Vec<Track>,
    streams: Vec<StreamInfo>,
    duration_us: Option<i64>,
    reader: Box<dyn ReadSeek>,
}

impl Mp4Source {
    pub fn open(mut reader: Box<dyn ReadSeek>) -> InteropResult<Self> {
        reader.seek(SeekFrom::Start(0))?;

        let mut moov: Option<Vec<u8>> = None;
        while let Some(header) = parser::read_box_header(&mut reader)? {
            let Some(payload_size) = header.payload_size() else {
                // Size 0: the box runs to end of file.
                if &header.box_type == b"moov" {
                    let mut data = Vec::new();
                    reader.read_to_end(&mut data)?;
                    moov = Some(data);
                }
                break;
            };

            if &header.box_type == b"moov" {
                let mut data = Vec::new();
                data.try_reserve_exact(payload_size as usize)?;
                reader
                    .by_ref()
                    .take(payload_size)
                    .read_to_end(&mut data)?;
                if (data.len() as u64) < payload_size {
                    return Err(invalid("moov truncated"));
                }
                moov = Some(data);
                // Samples are read by absolute offset, nothing else is needed.
                break;
            }
            reader.seek(SeekFrom::Current(payload_size as i64))?;
        }

        let moov = moov.ok_or_else(|| invalid("no moov box"))?;
        let (movie_timescale, movie_duration, builders) = parse_moov(&moov)?;

        let mut tracks = Vec::new();
        for builder in builders {
            if let Some(track) = build_track(builder, tracks.len()) {
                tracks.push(track);
            }
        }
        if tracks.is_empty() {
            return Err(InteropError::UnsupportedInput(
                "MP4 has no audio or video tracks".into(),
            ));
        }

        let movie_us = (movie_timescale > 0 && movie_duration > 0).then(|| {
            rescale(
                movie_duration as i64,
                Rational::new(1, movie_timescale as i64),
                CONTAINER_TIME_BASE,
                Rounding::Nearest,
            )
        });
        let duration_us = movie_us.or_else(|| {
            tracks
                .iter()
                .filter_map(|t| {
                    let last = t.samples.last()?;
                    Some(rescale(
                        last.dts + last.duration,
                        t.info.time_base,
                        CONTAINER_TIME_BASE,
                        Rounding::Nearest,
                    ))
                })
                .max()
                .filter(|&d| d > 0)
        });

        let streams = tracks.iter().map(|t| t.info.clone()).collect();
        Ok(Self {
            tracks,
            streams,
            duration_us,
            reader,
        })
    }

    /// Track with the earliest pending decode time. Ties go to the lower
    /// file offset.
    fn next_track(&self) -> Option<usize> {
        let mut best: Option<(usize, &SampleEntry)> = None;
        for (idx, track) in self.tracks.iter().enumerate() {
            let Some(sample) = track.samples.get(track.next) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((best_idx, best_sample)) => {
                    let lhs = sample.dts as i128 * self.tracks[best_idx].timescale() as i128;
                    let rhs = best_sample.dts as i128 * track.timescale() as i128;
                    lhs < rhs || (lhs == rhs && sample.offset < best_sample.offset)
                }
            };
            if better {
                best = Some((idx, sample));
            }
        }
        best.map(|(idx, _)| idx)
    }
}

impl PacketSource for Mp4Source {
    fn format_name(&self) -> &'static str {
        "mp4"
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    fn read_packet(&mut self) -> InteropResult<Option<Packet>> {
        let Some(idx) = self.next_track() else {
            return Ok(None);
        };
        let track = &mut self.tracks[idx];
        let sample = track.samples[track.next];
        track.next += 1;

        let mut data = Vec::new();
        data.try_reserve_exact(sample.size as usize)
            .map_err(|e| InteropError::Source(format!("sample buffer: {}", e)))?;
        data.resize(sample.size as usize, 0);
        self.reader
            .seek(SeekFrom::Start(sample.offset))
            .and_then(|_| self.reader.read_exact(&mut data))
            .map_err(|e| {
                InteropError::Source(format!(
                    "reading sample at offset {}: {}",
                    sample.offset, e
                ))
            })?;

        Ok(Some(Packet {
            stream_index: idx,
            data: Bytes::from(data),
            pts: Some(sample.pts()),
            dts: Some(sample.dts),
            duration: sample.duration,
            keyframe: sample.keyframe,
            position: Some(sample.offset),
        }))
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> InteropResult<()> {
        let reference = self
            .tracks
            .get(stream_index)
            .ok_or_else(|| InteropError::Seek(format!("no stream {}", stream_index)))?;
        if reference.samples.is_empty() {
            return Err(InteropError::Seek(format!("stream {} has no samples", stream_index)));
        }

        let sync = reference.sync_sample_at_pts(timestamp);
        let sync_dts = reference.samples[sync].dts;
        let reference_tb = reference.info.time_base;

        for (idx, track) in self.tracks.iter_mut().enumerate() {
            if idx == stream_index {
                track.next = sync;
                continue;
            }
            if track.samples.is_empty() {
                continue;
            }
            let target = rescale(sync_dts, reference_tb, track.info.time_base, Rounding::Down);
            track.next = track.sync_sample_at_dts(target);
        }

        tracing::debug!(
            "MP4 seek: stream {} -> sample {} (dts {})",
            stream_index,
            sync,
            sync_dts
        );
        Ok(())
    }
}

// ============================================================================
// moov parsing
// ============================================================================

fn parse_moov(moov: &[u8]) -> InteropResult<(u32, u64, Vec<TrakBuilder>)> {
    let mut timescale = 0u32;
    let mut duration = 0u64;
    let mut traks = Vec::new();

    for child in children(moov) {
        let (kind, payload) = child?;
        match &kind {
            b"mvhd" => {
                let mut buf = payload;
                let (version, _) = full_box_header(&mut buf, "mvhd")?;
                if version == 1 {
                    ensure(buf, 28, "mvhd")?;
                    buf.advance(16);
                    timescale = buf.get_u32();
                    duration = buf.get_u64();
                } else {
                    ensure(buf, 16, "mvhd")?;
                    buf.advance(8);
                    timescale = buf.get_u32();
                    duration = buf.get_u32() as u64;
                }
            }
            b"trak" => traks.push(parse_trak(payload)?),
            _ => {}
        }
    }

    Ok((timescale, duration, traks))
}

fn parse_trak(trak: &[u8]) -> InteropResult<TrakBuilder> {
    let mut builder = TrakBuilder::default();

    for child in children(trak) {
        let (kind, payload) = child?;
        match &kind {
            b"tkhd" => {
                let mut buf = payload;
                let (_, flags) = full_box_header(&mut buf, "tkhd")?;
                builder.enabled = flags & 0x1 != 0;
            }
            b"edts" => {
                if let Some(elst) = find_child(payload, b"elst")? {
                    builder.edit_start = parse_elst(elst)?;
                }
            }
            b"mdia" => parse_mdia(payload, &mut builder)?,
            _ => {}
        }
    }

    Ok(builder)
}

/// Media time of the first non-empty edit.
fn parse_elst(mut buf: &[u8]) -> InteropResult<Option<i64>> {
    let (version, _) = full_box_header(&mut buf, "elst")?;
    ensure(buf, 4, "elst")?;
    let count = buf.get_u32();
    for _ in 0..count {
        let media_time = if version == 1 {
            ensure(buf, 20, "elst")?;
            buf.advance(8);
            buf.get_i64()
        } else {
            ensure(buf, 12, "elst")?;
            buf.advance(4);
            buf.get_i32() as i64
        };
        buf.advance(4); // media rate
        if media_time >= 0 {
            return Ok(Some(media_time));
        }
    }
    Ok(None)
}

fn parse_mdia(mdia: &[u8], builder: &mut TrakBuilder) -> InteropResult<()> {
    for child in children(mdia) {
        let (kind, payload) = child?;
        match &kind {
            b"mdhd" => {
                let mut buf = payload;
                let (version, _) = full_box_header(&mut buf, "mdhd")?;
                if version == 1 {
                    ensure(buf, 28, "mdhd")?;
                    buf.advance(16);
                    builder.timescale = buf.get_u32();
                    builder.media_duration = buf.get_u64();
                } else {
                    ensure(buf, 16, "mdhd")?;
                    buf.advance(8);
                    builder.timescale = buf.get_u32();
                    builder.media_duration = buf.get_u32() as u64;
                }
            }
            b"hdlr" => {
                let mut buf = payload;
                full_box_header(&mut buf, "hdlr")?;
                ensure(buf, 8, "hdlr")?;
                buf.advance(4); // pre_defined
                let mut handler = [0u8; 4];
                buf.copy_to_slice(&mut handler);
                builder.handler = Some(handler);
            }
            b"minf" => {
                if let Some(stbl) = find_child(payload, b"stbl")? {
                    parse_stbl(stbl, builder)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_stbl(stbl: &[u8], builder: &mut TrakBuilder) -> InteropResult<()> {
    for child in children(stbl) {
        let (kind, payload) = child?;
        match &kind {
            b"stsd" => builder.entry = parse_stsd(payload)?,
            b"stts" => builder.table.parse_stts(payload)?,
            b"ctts" => builder.table.parse_ctts(payload)?,
            b"stsc" => builder.table.parse_stsc(payload)?,
            b"stsz" => builder.table.parse_stsz(payload)?,
            b"stco" => builder.table.parse_stco(payload)?,
            b"co64" => builder.table.parse_co64(payload)?,
            b"stss" => builder.table.parse_stss(payload)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_stsd(mut buf: &[u8]) -> InteropResult<Option<SampleDescription>> {
    full_box_header(&mut buf, "stsd")?;
    ensure(buf, 4, "stsd")?;
    let count = buf.get_u32();
    if count == 0 {
        return Ok(None);
    }

    // Only the first description is used; tracks switching descriptions
    // mid-stream are rare.
    let Some(first) = children(buf).next() else {
        return Ok(None);
    };
    let (kind, payload) = first?;

    let description = match &kind {
        b"avc1" | b"avc3" => parse_visual_entry(CodecId::H264, payload)?,
        b"hvc1" | b"hev1" => parse_visual_entry(CodecId::Hevc, payload)?,
        b"vp08" => parse_visual_entry(CodecId::Vp8, payload)?,
        b"vp09" => parse_visual_entry(CodecId::Vp9, payload)?,
        b"av01" => parse_visual_entry(CodecId::Av1, payload)?,
        b"mp4v" => parse_visual_entry(CodecId::Mpeg4, payload)?,
        b"mp4a" => parse_audio_entry(CodecId::Aac, payload)?,
        b".mp3" => parse_audio_entry(CodecId::Mp3, payload)?,
        b"alac" => parse_audio_entry(CodecId::Alac, payload)?,
        b"fLaC" => parse_audio_entry(CodecId::Flac, payload)?,
        b"Opus" => parse_audio_entry(CodecId::Opus, payload)?,
        b"ac-3" => parse_audio_entry(CodecId::Ac3, payload)?,
        b"ec-3" => parse_audio_entry(CodecId::Eac3, payload)?,
        b"sowt" | b"twos" | b"lpcm" => {
            let mut entry = parse_audio_entry(CodecId::PcmS16Le, payload)?;
            entry.codec = pcm_codec(&kind, entry.bits);
            entry
        }
        other => {
            tracing::debug!("MP4: unsupported sample entry '{}'", fourcc(other));
            SampleDescription::new(CodecId::Unknown(fourcc(other)))
        }
    };

    Ok(Some(description))
}

fn pcm_codec(kind: &[u8; 4], bits: u32) -> CodecId {
    match (kind, bits) {
        (_, 8) => CodecId::PcmU8,
        (b"twos", 16) => CodecId::PcmS16Be,
        (_, 24) => CodecId::PcmS24Le,
        (_, 32) => CodecId::PcmS32Le,
        _ => CodecId::PcmS16Le,
    }
}

fn parse_visual_entry(codec: CodecId, payload: &[u8]) -> InteropResult<SampleDescription> {
    ensure(payload, VISUAL_SAMPLE_ENTRY_SIZE, "visual sample entry")?;
    let mut entry = SampleDescription::new(codec);
    let mut dims = &payload[24..28];
    entry.width = dims.get_u16() as u32;
    entry.height = dims.get_u16() as u32;

    for child in children(&payload[VISUAL_SAMPLE_ENTRY_SIZE..]) {
        let (kind, data) = child?;
        match &kind {
            b"avcC" => {
                entry.extradata = data.to_vec();
                if data.len() > 1 {
                    entry.profile = Some(data[1] as i32);
                }
            }
            b"hvcC" | b"vpcC" | b"av1C" => entry.extradata = data.to_vec(),
            b"pasp" => {
                let mut buf = data;
                ensure(buf, 8, "pasp")?;
                let h = buf.get_u32() as i64;
                let v = buf.get_u32() as i64;
                entry.aspect = Some(Rational::new(h, v));
            }
            b"btrt" => {
                let mut buf = data;
                ensure(buf, 12, "btrt")?;
                buf.advance(8);
                entry.bit_rate = buf.get_u32() as u64;
            }
            _ => {}
        }
    }

    Ok(entry)
}

fn parse_audio_entry(codec: CodecId, payload: &[u8]) -> InteropResult<SampleDescription> {
    ensure(payload, AUDIO_SAMPLE_ENTRY_SIZE, "audio sample entry")?;
    let mut entry = SampleDescription::new(codec);

    let mut buf = &payload[8..];
    let version = buf.get_u16();
    buf.advance(6); // revision, vendor
    entry.channels = buf.get_u16() as u32;
    entry.bits = buf.get_u16() as u32;
    buf.advance(4); // compression id, packet size
    entry.sample_rate = buf.get_u32() >> 16;

    // QuickTime sound description versions carry extra fields.
    let children_start = match version {
        1 => AUDIO_SAMPLE_ENTRY_SIZE + 16,
        2 => {
            let mut v2 = &payload[AUDIO_SAMPLE_ENTRY_SIZE..];
            ensure(v2, 36, "sound description v2")?;
            v2.advance(4);
            entry.sample_rate = v2.get_f64().round() as u32;
            entry.channels = v2.get_u32();
            v2.advance(4);
            entry.bits = v2.get_u32();
            AUDIO_SAMPLE_ENTRY_SIZE + 36
        }
        _ => AUDIO_SAMPLE_ENTRY_SIZE,
    };
    let rest = payload.get(children_start..).unwrap_or(&[]);

    let esds = match find_child(rest, b"esds")? {
        Some(esds) => Some(esds),
        None => match find_child(rest, b"wave")? {
            Some(wave) => find_child(wave, b"esds")?,
            None => None,
        },
    };
    if let Some(esds) = esds {
        parse_esds(esds, &mut entry)?;
    }
    if let Some(alac) = find_child(rest, b"alac")? {
        entry.extradata = alac.to_vec();
    }
    if let Some(dfla) = find_child(rest, b"dfLa")? {
        entry.extradata = dfla.get(4..).unwrap_or(&[]).to_vec();
    }

    Ok(entry)
}

/// Elementary stream descriptor: object type, bitrate and the decoder
/// specific info (AudioSpecificConfig for AAC).
fn parse_esds(mut buf: &[u8], entry: &mut SampleDescription) -> InteropResult<()> {
    full_box_header(&mut buf, "esds")?;

    ensure(buf, 1, "esds")?;
    if buf.get_u8() != 0x03 {
        return Ok(());
    }
    descriptor_length(&mut buf)?;
    ensure(buf, 3, "ES descriptor")?;
    buf.advance(2); // ES_ID
    let flags = buf.get_u8();
    if flags & 0x80 != 0 {
        ensure(buf, 2, "ES descriptor")?;
        buf.advance(2);
    }
    if flags & 0x40 != 0 {
        ensure(buf, 1, "ES descriptor")?;
        let url_len = buf.get_u8() as usize;
        ensure(buf, url_len, "ES descriptor")?;
        buf.advance(url_len);
    }
    if flags & 0x20 != 0 {
        ensure(buf, 2, "ES descriptor")?;
        buf.advance(2);
    }

    ensure(buf, 1, "esds")?;
    if buf.get_u8() != 0x04 {
        return Ok(());
    }
    descriptor_length(&mut buf)?;
    ensure(buf, 13, "decoder config descriptor")?;
    let object_type = buf.get_u8();
    buf.advance(4); // stream type, buffer size
    buf.advance(4); // max bitrate
    entry.bit_rate = buf.get_u32() as u64;

    entry.codec = match object_type {
        0x40 | 0x66 | 0x67 | 0x68 => CodecId::Aac,
        0x69 | 0x6B => CodecId::Mp3,
        0xA5 => CodecId::Ac3,
        0xA6 => CodecId::Eac3,
        _ => entry.codec.clone(),
    };

    if buf.remaining() > 0 && buf.get_u8() == 0x05 {
        let len = descriptor_length(&mut buf)?;
        ensure(buf, len, "decoder specific info")?;
        entry.extradata = buf[..len].to_vec();
    }

    Ok(())
}

fn build_track(builder: TrakBuilder, index: usize) -> Option<Track> {
    let media_type = match &builder.handler? {
        b"vide" => MediaType::Video,
        b"soun" => MediaType::Audio,
        _ => return None,
    };
    let entry = builder.entry?;
    if builder.timescale == 0 {
        return None;
    }

    let samples = builder.table.build_index();
    let time_base = Rational::new(1, builder.timescale as i64);

    let mut info = StreamInfo::new(index, media_type, entry.codec, time_base);
    info.start_time = Some(builder.edit_start.unwrap_or(0));
    info.extradata = entry.extradata;
    info.width = entry.width;
    info.height = entry.height;
    info.sample_aspect_ratio = entry.aspect;
    info.sample_rate = entry.sample_rate;
    info.channels = entry.channels;
    info.bits_per_coded_sample = entry.bits;
    info.bit_rate = entry.bit_rate;
    info.profile = entry.profile;
    info.default = builder.enabled;

    if media_type == MediaType::Video && !samples.is_empty() {
        let span: i64 = samples.iter().map(|s| s.duration).sum();
        if span > 0 {
            info.avg_frame_rate =
                Some(Rational::new(samples.len() as i64 * builder.timescale as i64, span).reduced());
        }
    }

    tracing::debug!(
        "MP4 track {}: {:?} {:?}, {} samples, timescale {}",
        index,
        media_type,
        info.codec,
        samples.len(),
        builder.timescale
    );

    Some(Track {
        info,
        samples,
        next: 0,
    })
}
