//! H.264 bitstream framing.
//!
//! MP4 and Matroska carry length-prefixed NAL units plus an `avcC` record.
//! The host decoder wants start codes with SPS/PPS in-band.

use crate::error::{InteropError, InteropResult};

/// Four-byte start code written before every rewritten NAL unit.
pub const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// How the NAL units of a stream are delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalFraming {
    /// Length-prefixed NAL units, configured by an `avcC` record.
    Avc { nal_length_size: usize },
    /// Start-code delimited, passed through untouched.
    AnnexB,
}

impl NalFraming {
    /// Decided once from the stream extradata: an `avcC` record starts with
    /// configuration version 1, anything else is Annex B.
    pub fn detect(extradata: &[u8]) -> Self {
        match AvcConfig::parse(extradata) {
            Some(config) => Self::Avc {
                nal_length_size: config.nal_length_size,
            },
            None => Self::AnnexB,
        }
    }
}

/// Decoded `avcC` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub profile: u8,
    pub level: u8,
    pub nal_length_size: usize,
    /// SPS then PPS NAL units, each behind a start code.
    pub parameter_sets: Vec<u8>,
}

impl AvcConfig {
    /// `None` unless the record is version 1 and long enough to hold the
    /// length-size and SPS-count bytes.
    pub fn parse(extradata: &[u8]) -> Option<Self> {
        // version, profile, compat, level, length size (low 2 bits),
        // SPS count (low 5 bits), SPS list, PPS count, PPS list
        if extradata.len() < 7 || extradata[0] != 1 {
            return None;
        }

        let nal_length_size = ((extradata[4] & 0x03) + 1) as usize;
        let num_sps = (extradata[5] & 0x1F) as usize;

        let mut parameter_sets = Vec::with_capacity(extradata.len() + 32);
        let mut cursor = 6;
        for _ in 0..num_sps {
            cursor = copy_parameter_set(extradata, cursor, &mut parameter_sets)?;
        }

        if let Some(&pps_count) = extradata.get(cursor) {
            cursor += 1;
            for _ in 0..pps_count {
                let Some(next) = copy_parameter_set(extradata, cursor, &mut parameter_sets) else {
                    break;
                };
                cursor = next;
            }
        }

        Some(Self {
            profile: extradata[1],
            level: extradata[3],
            nal_length_size,
            parameter_sets,
        })
    }
}

/// Copy one u16-length-prefixed parameter set behind a start code. Returns the
/// offset just past it.
fn copy_parameter_set(extradata: &[u8], offset: usize, out: &mut Vec<u8>) -> Option<usize> {
    let len_bytes = extradata.get(offset..offset + 2)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let start = offset + 2;
    let nal = extradata.get(start..start + len)?;
    out.extend_from_slice(&ANNEX_B_START_CODE);
    out.extend_from_slice(nal);
    Some(start + len)
}

/// Replace each `nal_length_size`-byte length prefix with a start code.
/// Empty NAL units are dropped. A length that runs past the end of the packet is an error; the packet is
/// unusable.
pub fn avcc_to_annexb(data: &[u8], nal_length_size: usize) -> InteropResult<Vec<u8>> {
    if !(1..=4).contains(&nal_length_size) {
        return Err(InteropError::Decode(format!(
            "invalid NAL length size {}",
            nal_length_size
        )));
    }

    let mut out = Vec::with_capacity(data.len() + 16);
    let mut rest = data;

    while !rest.is_empty() {
        let Some((prefix, tail)) = rest.split_at_checked(nal_length_size) else {
            return Err(InteropError::Decode("truncated NAL length prefix".into()));
        };
        let len = be_length(prefix);
        let Some((nal, tail)) = tail.split_at_checked(len) else {
            return Err(InteropError::Decode(format!(
                "NAL unit of {} bytes overruns packet ({} left)",
                len,
                tail.len()
            )));
        };
        if !nal.is_empty() {
            out.extend_from_slice(&ANNEX_B_START_CODE);
            out.extend_from_slice(nal);
        }
        rest = tail;
    }

    Ok(out)
}

/// True when the payload opens with a three- or four-byte start code.
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 0, 1]) || data.starts_with(&[0, 0, 1])
}

fn be_length(data: &[u8]) -> usize {
    data.iter().fold(0usize, |val, &b| (val << 8) | b as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AVCC: [u8; 17] = [
        1, 0x42, 0xC0, 0x1E, 0xFF, 0xE1, 0, 4, 0x67, 0x42, 0xC0, 0x1E, 1, 0, 2, 0x68, 0xCE,
    ];

    #[test]
    fn test_avcc_to_annexb() {
        // 4-byte length prefix: length=5, NAL data = [0x67, 0x42, 0x00, 0x1e, 0x9a]
        let avcc = vec![0x00, 0x00, 0x00, 0x05, 0x67, 0x42, 0x00, 0x1e, 0x9a];
        let annexb = avcc_to_annexb(&avcc, 4).unwrap();

        assert_eq!(&annexb[0..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&annexb[4..], &[0x67, 0x42, 0x00, 0x1e, 0x9a]);
    }

    #[test]
    fn test_avcc_two_byte_lengths() {
        let avcc = [0, 2, 0x65, 0x88, 0, 1, 0x06];
        let annexb = avcc_to_annexb(&avcc, 2).unwrap();
        assert_eq!(annexb, vec![0, 0, 0, 1, 0x65, 0x88, 0, 0, 0, 1, 0x06]);
    }

    #[test]
    fn test_avcc_truncated_is_decode_error() {
        let avcc = [0, 0, 0, 9, 0x65, 0x88];
        assert!(matches!(avcc_to_annexb(&avcc, 4), Err(InteropError::Decode(_))));

        let avcc = [0, 0, 0, 1, 0x65, 0];
        assert!(avcc_to_annexb(&avcc, 4).is_err());
    }

    #[test]
    fn test_parse_avcc_extradata() {
        let config = AvcConfig::parse(&AVCC).unwrap();
        assert_eq!(config.profile, 0x42);
        assert_eq!(config.level, 0x1E);
        assert_eq!(config.nal_length_size, 4);
        assert_eq!(
            config.parameter_sets,
            vec![0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1E, 0, 0, 0, 1, 0x68, 0xCE]
        );
    }

    #[test]
    fn test_framing_detection() {
        assert_eq!(NalFraming::detect(&AVCC), NalFraming::Avc { nal_length_size: 4 });
        assert_eq!(NalFraming::detect(&[0, 0, 0, 1, 0x67]), NalFraming::AnnexB);
        assert_eq!(NalFraming::detect(&[]), NalFraming::AnnexB);
    }

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb(&[0x00, 0x00, 0x00, 0x05, 0x67])); // AVCC
    }
}
