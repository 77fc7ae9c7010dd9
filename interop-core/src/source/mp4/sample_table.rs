//! MP4 sample table data structures.

use bytes::Buf;

use super::parser::{ensure, full_box_header, invalid};
use crate::error::InteropResult;

#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    pub sample_sizes: Vec<u32>,
    pub chunk_offsets: Vec<u64>,
    pub sample_to_chunk: Vec<(u32, u32, u32)>, // first_chunk, samples_per_chunk, sample_desc_index
    pub time_to_sample: Vec<(u32, u32)>,       // sample_count, sample_delta
    pub keyframes: Vec<u32>,                   // 1-based sample numbers
    pub composition_offsets: Vec<(u32, i32)>,  // sample_count, offset
}

/// One sample, resolved to a file position and decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleEntry {
    pub offset: u64,
    pub size: u32,
    pub dts: i64,
    pub duration: i64,
    pub cts_offset: i64,
    pub keyframe: bool,
}

impl SampleEntry {
    pub fn pts(&self) -> i64 {
        self.dts + self.cts_offset
    }
}

fn entry_count(buf: &mut &[u8], what: &str, entry_size: usize) -> InteropResult<usize> {
    full_box_header(buf, what)?;
    ensure(buf, 4, what)?;
    let count = buf.get_u32() as usize;
    ensure(buf, count.saturating_mul(entry_size), what)?;
    Ok(count)
}

impl SampleTable {
    pub fn parse_stts(&mut self, mut buf: &[u8]) -> InteropResult<()> {
        for _ in 0..entry_count(&mut buf, "stts", 8)? {
            let count = buf.get_u32();
            let delta = buf.get_u32();
            self.time_to_sample.push((count, delta));
        }
        Ok(())
    }

    pub fn parse_ctts(&mut self, mut buf: &[u8]) -> InteropResult<()> {
        for _ in 0..entry_count(&mut buf, "ctts", 8)? {
            let count = buf.get_u32();
            // Version 0 offsets are unsigned but writers put negatives there too.
            let offset = buf.get_i32();
            self.composition_offsets.push((count, offset));
        }
        Ok(())
    }

    pub fn parse_stsc(&mut self, mut buf: &[u8]) -> InteropResult<()> {
        for _ in 0..entry_count(&mut buf, "stsc", 12)? {
            let first_chunk = buf.get_u32();
            let samples_per_chunk = buf.get_u32();
            let desc = buf.get_u32();
            if first_chunk == 0 {
                return Err(invalid("stsc chunk numbers are 1-based"));
            }
            self.sample_to_chunk.push((first_chunk, samples_per_chunk, desc));
        }
        Ok(())
    }

    pub fn parse_stsz(&mut self, mut buf: &[u8]) -> InteropResult<()> {
        full_box_header(&mut buf, "stsz")?;
        ensure(buf, 8, "stsz")?;
        let sample_size = buf.get_u32();
        let count = buf.get_u32() as usize;
        if sample_size == 0 {
            ensure(buf, count.saturating_mul(4), "stsz")?;
            self.sample_sizes = (0..count).map(|_| buf.get_u32()).collect();
        } else {
            self.sample_sizes = vec![sample_size; count];
        }
        Ok(())
    }

    pub fn parse_stco(&mut self, mut buf: &[u8]) -> InteropResult<()> {
        for _ in 0..entry_count(&mut buf, "stco", 4)? {
            self.chunk_offsets.push(buf.get_u32() as u64);
        }
        Ok(())
    }

    pub fn parse_co64(&mut self, mut buf: &[u8]) -> InteropResult<()> {
        for _ in 0..entry_count(&mut buf, "co64", 8)? {
            self.chunk_offsets.push(buf.get_u64());
        }
        Ok(())
    }

    pub fn parse_stss(&mut self, mut buf: &[u8]) -> InteropResult<()> {
        for _ in 0..entry_count(&mut buf, "stss", 4)? {
            self.keyframes.push(buf.get_u32());
        }
        Ok(())
    }

    /// Flatten the run-length tables into one entry per sample.
    pub fn build_index(&self) -> Vec<SampleEntry> {
        let total_timed: usize = self
            .time_to_sample
            .iter()
            .map(|&(count, _)| count as usize)
            .sum();
        let count = self.sample_sizes.len().min(total_timed);
        let mut entries = Vec::with_capacity(count);

        // Decode times
        let mut dts = 0i64;
        'stts: for &(run, delta) in &self.time_to_sample {
            for _ in 0..run {
                if entries.len() == count {
                    break 'stts;
                }
                let i = entries.len();
                entries.push(SampleEntry {
                    offset: 0,
                    size: self.sample_sizes[i],
                    dts,
                    duration: delta as i64,
                    cts_offset: 0,
                    keyframe: self.keyframes.is_empty(),
                });
                dts += delta as i64;
            }
        }

        // Composition offsets
        let mut i = 0usize;
        for &(run, offset) in &self.composition_offsets {
            for _ in 0..run {
                if let Some(entry) = entries.get_mut(i) {
                    entry.cts_offset = offset as i64;
                }
                i += 1;
            }
        }

        for &number in &self.keyframes {
            if let Some(entry) = number.checked_sub(1).and_then(|i| entries.get_mut(i as usize)) {
                entry.keyframe = true;
            }
        }

        // File offsets
        let mut sample = 0usize;
        for (i, &(first_chunk, per_chunk, _)) in self.sample_to_chunk.iter().enumerate() {
            let first = first_chunk as usize - 1;
            let end = self
                .sample_to_chunk
                .get(i + 1)
                .map(|next| next.0 as usize - 1)
                .unwrap_or(self.chunk_offsets.len())
                .min(self.chunk_offsets.len());

            for chunk in first..end {
                let mut offset = self.chunk_offsets[chunk];
                for _ in 0..per_chunk {
                    let Some(entry) = entries.get_mut(sample) else {
                        return entries;
                    };
                    // A sample ending past u64::MAX cannot exist in any file.
                    let Some(next) = offset.checked_add(entry.size as u64) else {
                        tracing::warn!("MP4 sample {} overruns the offset range", sample);
                        entries.truncate(sample);
                        return entries;
                    };
                    entry.offset = offset;
                    offset = next;
                    sample += 1;
                }
            }
        }

        // Samples not covered by any chunk cannot be read.
        entries.truncate(sample);
        entries
    }
}
