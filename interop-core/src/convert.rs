// CONVERT - decoded frames to host layouts
//
// Video leaves the pipeline as tightly packed NV12 (Y plane, then one
// interleaved UV plane). Audio leaves as little-endian interleaved PCM at the
// stream's coded bit depth. Decoders hand over planar YUV with padded strides
// and full-scale i32 samples.

use crate::error::InteropResult;
use crate::source::CodecId;

// ============================================================================
// Video
// ============================================================================

/// Borrowed planar 4:2:0 picture with per-plane strides.
#[derive(Debug, Clone, Copy)]
pub struct YuvPlanes<'a> {
    pub width: usize,
    pub height: usize,
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub y_stride: usize,
    pub uv_stride: usize,
}

/// Bytes in a packed NV12 picture.
pub fn nv12_size(width: usize, height: usize) -> usize {
    let chroma = width.div_ceil(2) * height.div_ceil(2);
    width * height + chroma * 2
}

/// Planar I420 to packed NV12, dropping stride padding.
pub fn i420_to_nv12(planes: &YuvPlanes<'_>) -> InteropResult<Vec<u8>> {
    let (width, height) = (planes.width, planes.height);
    let (chroma_width, chroma_height) = (width.div_ceil(2), height.div_ceil(2));

    let mut out = Vec::new();
    out.try_reserve_exact(nv12_size(width, height))?;

    // Copy Y plane (remove stride padding)
    for row in 0..height {
        let start = row * planes.y_stride;
        match planes.y.get(start..start + width) {
            Some(line) => out.extend_from_slice(line),
            None => out.resize(out.len() + width, 16),
        }
    }

    // Interleave U and V
    for row in 0..chroma_height {
        let start = row * planes.uv_stride;
        for col in 0..chroma_width {
            out.push(planes.u.get(start + col).copied().unwrap_or(128));
            out.push(planes.v.get(start + col).copied().unwrap_or(128));
        }
    }

    Ok(out)
}

// ============================================================================
// Audio
// ============================================================================

/// Output bit depth for a stream: its coded depth when that is a whole
/// number of bytes, else 16.
pub fn output_bits(bits_per_coded_sample: u32) -> u32 {
    match bits_per_coded_sample {
        8 | 16 | 24 | 32 => bits_per_coded_sample,
        _ => 16,
    }
}

/// Pack full-scale i32 samples as little-endian PCM. 8-bit output is
/// unsigned.
pub fn pack_pcm(samples: &[i32], bits: u32) -> InteropResult<Vec<u8>> {
    let bytes_per_sample = (output_bits(bits) / 8) as usize;
    let mut out = Vec::new();
    out.try_reserve_exact(samples.len() * bytes_per_sample)?;

    match bytes_per_sample {
        1 => out.extend(samples.iter().map(|&s| ((s >> 24) + 128) as u8)),
        2 => {
            for &s in samples {
                out.extend_from_slice(&((s >> 16) as i16).to_le_bytes());
            }
        }
        3 => {
            for &s in samples {
                out.extend_from_slice(&(s >> 8).to_le_bytes()[..3]);
            }
        }
        _ => {
            for &s in samples {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
    }

    Ok(out)
}

/// Raw PCM packet payload to full-scale i32 samples. `None` for codecs that
/// are not PCM.
pub fn unpack_pcm(data: &[u8], codec: &CodecId) -> Option<Vec<i32>> {
    let samples = match codec {
        // 8-bit unsigned
        CodecId::PcmU8 => data.iter().map(|&b| (b as i32 - 128) << 24).collect(),
        CodecId::PcmS16Le => data
            .chunks_exact(2)
            .map(|c| (i16::from_le_bytes([c[0], c[1]]) as i32) << 16)
            .collect(),
        CodecId::PcmS16Be => data
            .chunks_exact(2)
            .map(|c| (i16::from_be_bytes([c[0], c[1]]) as i32) << 16)
            .collect(),
        // 24-bit signed little-endian, sign comes along with the top byte
        CodecId::PcmS24Le => data
            .chunks_exact(3)
            .map(|c| i32::from_le_bytes([0, c[0], c[1], c[2]]))
            .collect(),
        CodecId::PcmS32Le => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        CodecId::PcmF32Le => data
            .chunks_exact(4)
            .map(|c| {
                let s = f32::from_le_bytes([c[0], c[1], c[2], c[3]]).clamp(-1.0, 1.0);
                (s as f64 * i32::MAX as f64) as i32
            })
            .collect(),
        _ => return None,
    };
    Some(samples)
}
