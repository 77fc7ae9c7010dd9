//! MP4 box parsing helpers.

use std::io::{self, Read};

use bytes::Buf;

use crate::error::{InteropError, InteropResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    /// Total box size including the header, 0 = extends to end of file.
    pub size: u64,
    pub box_type: [u8; 4],
    pub header_size: u64,
}

impl BoxHeader {
    pub fn payload_size(&self) -> Option<u64> {
        (self.size != 0).then(|| self.size - self.header_size)
    }
}

pub fn invalid(msg: impl Into<String>) -> InteropError {
    InteropError::InvalidInput(format!("MP4: {}", msg.into()))
}

/// Read a box header from a file, `Ok(None)` on a clean end of file.
pub fn read_box_header<R: Read>(reader: &mut R) -> InteropResult<Option<BoxHeader>> {
    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(invalid("truncated box header")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mut cursor = &header[..];
    let size = cursor.get_u32() as u64;
    let mut box_type = [0u8; 4];
    cursor.copy_to_slice(&mut box_type);

    let (size, header_size) = if size == 1 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext)?;
        let ext_size = (&ext[..]).get_u64();
        if ext_size < 16 {
            return Err(invalid("invalid extended box size"));
        }
        (ext_size, 16)
    } else if size == 0 {
        (0, 8)
    } else {
        if size < 8 {
            return Err(invalid("invalid box size"));
        }
        (size, 8)
    };

    Ok(Some(BoxHeader {
        size,
        box_type,
        header_size,
    }))
}

/// Iterator over the child boxes of an in-memory payload.
pub struct Children<'a> {
    data: &'a [u8],
}

pub fn children(data: &[u8]) -> Children<'_> {
    Children { data }
}

impl<'a> Iterator for Children<'a> {
    type Item = InteropResult<([u8; 4], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        // Trailing padding shorter than a header is tolerated.
        if self.data.len() < 8 {
            return None;
        }
        let mut cursor = self.data;
        let size = cursor.get_u32() as u64;
        let mut box_type = [0u8; 4];
        cursor.copy_to_slice(&mut box_type);

        let (size, header) = match size {
            0 => (self.data.len() as u64, 8u64),
            1 => {
                if cursor.remaining() < 8 {
                    self.data = &[];
                    return Some(Err(invalid("truncated extended size")));
                }
                (cursor.get_u64(), 16)
            }
            n => (n, 8),
        };

        if size < header || size > self.data.len() as u64 {
            self.data = &[];
            return Some(Err(invalid(format!(
                "box '{}' overruns its parent",
                fourcc(&box_type)
            ))));
        }

        let payload = &self.data[header as usize..size as usize];
        self.data = &self.data[size as usize..];
        Some(Ok((box_type, payload)))
    }
}

/// Find the first child of a given type.
pub fn find_child<'a>(data: &'a [u8], kind: &[u8; 4]) -> InteropResult<Option<&'a [u8]>> {
    for child in children(data) {
        let (box_type, payload) = child?;
        if &box_type == kind {
            return Ok(Some(payload));
        }
    }
    Ok(None)
}

pub fn fourcc(kind: &[u8; 4]) -> String {
    kind.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

pub fn ensure(buf: &[u8], needed: usize, what: &str) -> InteropResult<()> {
    if buf.remaining() < needed {
        return Err(invalid(format!("{} truncated", what)));
    }
    Ok(())
}

/// Version byte and 24-bit flags of a full box.
pub fn full_box_header(buf: &mut &[u8], what: &str) -> InteropResult<(u8, u32)> {
    ensure(buf, 4, what)?;
    let version = buf.get_u8();
    let flags = (buf.get_u16() as u32) << 8 | buf.get_u8() as u32;
    Ok((version, flags))
}

/// Expandable descriptor length used by `esds` (7 bits per byte).
pub fn descriptor_length(buf: &mut &[u8]) -> InteropResult<usize> {
    let mut len = 0usize;
    for _ in 0..4 {
        ensure(buf, 1, "descriptor length")?;
        let b = buf.get_u8();
        len = (len << 7) | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_walk_and_overrun() {
        let mut data = Vec::new();
        data.extend_from_slice(&12u32.to_be_bytes());
        data.extend_from_slice(b"abcd");
        data.extend_from_slice(&[1, 2, 3, 4]);
        data.extend_from_slice(&8u32.to_be_bytes());
        data.extend_from_slice(b"efgh");

        let boxes: Vec<_> = children(&data).collect::<InteropResult<_>>().unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(&boxes[0].0, b"abcd");
        assert_eq!(boxes[0].1, &[1, 2, 3, 4]);
        assert!(boxes[1].1.is_empty());

        let mut bad = Vec::new();
        bad.extend_from_slice(&64u32.to_be_bytes());
        bad.extend_from_slice(b"moov");
        assert!(children(&bad).next().unwrap().is_err());
    }

    #[test]
    fn test_descriptor_length_multibyte() {
        let mut buf: &[u8] = &[0x80, 0x80, 0x80, 0x19, 0xAA];
        assert_eq!(descriptor_length(&mut buf).unwrap(), 0x19);
        assert_eq!(buf, &[0xAA]);

        let mut buf: &[u8] = &[0x81, 0x01];
        assert_eq!(descriptor_length(&mut buf).unwrap(), 129);
    }

    #[test]
    fn test_read_box_header_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_box_header(&mut empty).unwrap().is_none());

        let mut short: &[u8] = &[0, 0, 0];
        assert!(read_box_header(&mut short).is_err());
    }
}
