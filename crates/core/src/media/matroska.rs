//! Matroska/WebM: just enough EBML to confirm the header and the Segment extent.

use std::io::{self, Read};

use super::{read_array, skip_bytes};

pub const EBML_MAGIC: [u8; 4] = [0x1a, 0x45, 0xdf, 0xa3];
const SEGMENT_ID: u32 = 0x1853_8067;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentCheck {
    Complete,
    /// Live recordings may leave the Segment size as "unknown".
    UnknownSize,
    Overruns { declared_end: u64, file_len: u64 },
    Truncated(&'static str),
    MissingSegment,
    NotMatroska,
}

struct Vint {
    value: u64,
    len: u64,
    unknown: bool,
}

/// Reads an EBML variable-length integer. Element IDs keep their marker bit.
fn read_vint<R: Read + ?Sized>(reader: &mut R, keep_marker: bool) -> io::Result<Option<Vint>> {
    let Some([first]) = read_array::<1, _>(reader)? else {
        return Ok(None);
    };
    let len = first.leading_zeros() + 1;
    if len > 8 {
        return Ok(None);
    }

    let mask = 0xff_u64 >> len;
    let mut value = if keep_marker {
        first as u64
    } else {
        first as u64 & mask
    };
    let mut all_ones = first as u64 & mask == mask;
    for _ in 1..len {
        let Some([byte]) = read_array::<1, _>(reader)? else {
            return Ok(None);
        };
        all_ones &= byte == 0xff;
        value = (value << 8) | byte as u64;
    }

    Ok(Some(Vint {
        value,
        len: len as u64,
        unknown: !keep_marker && all_ones,
    }))
}

pub fn check_segment<R: Read + ?Sized>(reader: &mut R, file_len: u64) -> io::Result<SegmentCheck> {
    let Some(magic) = read_array::<4, _>(reader)? else {
        return Ok(SegmentCheck::NotMatroska);
    };
    if magic != EBML_MAGIC {
        return Ok(SegmentCheck::NotMatroska);
    }

    let Some(header_size) = read_vint(reader, false)? else {
        return Ok(SegmentCheck::Truncated("EBML header"));
    };
    if skip_bytes(reader, header_size.value)? < header_size.value {
        return Ok(SegmentCheck::Truncated("EBML header"));
    }
    let mut consumed = 4 + header_size.len + header_size.value;

    let Some(id) = read_vint(reader, true)? else {
        return Ok(SegmentCheck::Truncated("Segment"));
    };
    if id.value != SEGMENT_ID as u64 {
        return Ok(SegmentCheck::MissingSegment);
    }
    let Some(size) = read_vint(reader, false)? else {
        return Ok(SegmentCheck::Truncated("Segment"));
    };
    consumed += id.len + size.len;

    if size.unknown {
        return Ok(SegmentCheck::UnknownSize);
    }
    let declared_end = consumed.saturating_add(size.value);
    if declared_end > file_len {
        return Ok(SegmentCheck::Overruns {
            declared_end,
            file_len,
        });
    }
    Ok(SegmentCheck::Complete)
}
