//! H.264 elementary stream recovery from length-prefixed sample data.
//!
//! Cameras write video samples as 4-byte length-prefixed NAL units. When the index
//! is gone the units can still be walked one by one, grouped into access units and
//! described again from the in-band parameter sets.

use std::io::{self, Read, Seek, SeekFrom};

use tracing::debug;

use super::{be_u32, read_up_to};

pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

const LENGTH_SIZE: u64 = 4;
const MAX_PARAMETER_SET: u32 = 64 * 1024;
const RESYNC_WINDOW: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit {
    /// Offset of the length prefix.
    pub offset: u64,
    pub len: u32,
    pub nal_type: u8,
    /// `first_mb_in_slice == 0`; only meaningful for slices.
    pub first_slice: bool,
}

impl NalUnit {
    pub fn end(&self) -> u64 {
        self.offset + LENGTH_SIZE + self.len as u64
    }

    pub fn is_slice(&self) -> bool {
        (1..=5).contains(&self.nal_type)
    }

    fn opens_frame(&self) -> bool {
        opens_frame(self.nal_type, self.first_slice)
    }
}

fn opens_frame(nal_type: u8, first_slice: bool) -> bool {
    matches!(nal_type, NAL_SEI | NAL_SPS | NAL_PPS | NAL_AUD | 14..=18)
        || ((1..=5).contains(&nal_type) && first_slice)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamScan {
    pub units: Vec<NalUnit>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
    /// The final range ended on a unit boundary, or the unit cut off by the end
    /// would have opened a new access unit.
    pub clean_end: bool,
    pub skipped_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Byte ranges `(offset, len)` making up the sample, in file order.
    pub segments: Vec<(u64, u64)>,
    pub sync: bool,
}

impl AccessUnit {
    pub fn size(&self) -> u64 {
        self.segments.iter().map(|(_, len)| len).sum()
    }
}

fn plausible(len: u32, header: u8, max_nal: u64) -> bool {
    len > 0 && len as u64 <= max_nal && header & 0x80 == 0 && matches!(header & 0x1f, 1..=23)
}

fn is_anchor(header: u8) -> bool {
    matches!(header & 0x1f, 1 | 5 | 6 | 7 | 8 | 9)
}

enum Step {
    Unit(NalUnit),
    /// Carries whether the cut-off unit would have opened a new access unit.
    Truncated(bool),
    Invalid,
}

/// Walks length-prefixed NAL units across `ranges`, skipping interleaved
/// non-video runs where a following chain of units can be found.
pub fn scan_length_prefixed<R: Read + Seek + ?Sized>(
    reader: &mut R,
    ranges: &[(u64, u64)],
    max_nal: u64,
) -> io::Result<StreamScan> {
    let mut scan = StreamScan::default();

    for (index, &(start, end)) in ranges.iter().enumerate() {
        let last_range = index + 1 == ranges.len();
        let mut pos = start;
        let clean = loop {
            if pos == end {
                break true;
            }
            match read_unit(reader, pos, end, max_nal)? {
                Step::Unit(unit) => {
                    capture_parameter_set(reader, &unit, &mut scan)?;
                    pos = unit.end();
                    scan.units.push(unit);
                }
                Step::Truncated(opens_frame) => break opens_frame,
                Step::Invalid => match resync(reader, pos, end, max_nal)? {
                    Some(next) => {
                        debug!("skipped {} non-video bytes at {pos}", next - pos);
                        scan.skipped_bytes += next - pos;
                        pos = next;
                    }
                    None => {
                        debug!("no further units after offset {pos}");
                        break false;
                    }
                },
            }
        };
        if last_range {
            scan.clean_end = clean;
        }
    }

    Ok(scan)
}

fn read_unit<R: Read + Seek + ?Sized>(
    reader: &mut R,
    pos: u64,
    end: u64,
    max_nal: u64,
) -> io::Result<Step> {
    if end - pos < LENGTH_SIZE + 1 {
        return Ok(Step::Truncated(false));
    }
    reader.seek(SeekFrom::Start(pos))?;
    let mut head = [0_u8; 6];
    let read = read_up_to(reader, &mut head)?;
    if read < 5 {
        return Ok(Step::Truncated(false));
    }

    let len = be_u32(&head[0..4]);
    let header = head[4];
    if !plausible(len, header, max_nal) {
        return Ok(Step::Invalid);
    }

    let nal_type = header & 0x1f;
    let first_slice = read == 6 && len > 1 && head[5] & 0x80 != 0;
    if pos + LENGTH_SIZE + len as u64 > end {
        return Ok(Step::Truncated(opens_frame(nal_type, first_slice)));
    }
    Ok(Step::Unit(NalUnit {
        offset: pos,
        len,
        nal_type,
        first_slice,
    }))
}

fn resync<R: Read + Seek + ?Sized>(
    reader: &mut R,
    pos: u64,
    end: u64,
    max_nal: u64,
) -> io::Result<Option<u64>> {
    let base = pos + 1;
    if base >= end {
        return Ok(None);
    }
    let window_len = (end - base).min(RESYNC_WINDOW) as usize;
    reader.seek(SeekFrom::Start(base))?;
    let mut window = vec![0_u8; window_len];
    let filled = read_up_to(reader, &mut window)?;
    window.truncate(filled);

    for offset in 0..window.len().saturating_sub(4) {
        let len = be_u32(&window[offset..offset + 4]);
        let header = window[offset + 4];
        if !plausible(len, header, max_nal) || !is_anchor(header) {
            continue;
        }
        let candidate = base + offset as u64;
        let next = candidate + LENGTH_SIZE + len as u64;
        if next > end {
            continue;
        }
        if next == end {
            return Ok(Some(candidate));
        }
        if let Step::Unit(_) = read_unit(reader, next, end, max_nal)? {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn capture_parameter_set<R: Read + Seek + ?Sized>(
    reader: &mut R,
    unit: &NalUnit,
    scan: &mut StreamScan,
) -> io::Result<()> {
    let slot = match unit.nal_type {
        NAL_SPS => &mut scan.sps,
        NAL_PPS => &mut scan.pps,
        _ => return Ok(()),
    };
    if slot.is_some() || unit.len > MAX_PARAMETER_SET {
        return Ok(());
    }
    reader.seek(SeekFrom::Start(unit.offset + LENGTH_SIZE))?;
    let mut payload = vec![0_u8; unit.len as usize];
    reader.read_exact(&mut payload)?;
    *slot = Some(payload);
    Ok(())
}

/// Groups units into access units. An incomplete trailing unit is dropped unless
/// the stream ended cleanly.
pub fn access_units(scan: &StreamScan) -> Vec<AccessUnit> {
    let mut units = Vec::new();
    let mut current = AccessUnit {
        segments: Vec::new(),
        sync: false,
    };
    let mut has_slice = false;

    for unit in &scan.units {
        if has_slice && unit.opens_frame() {
            units.push(std::mem::replace(
                &mut current,
                AccessUnit {
                    segments: Vec::new(),
                    sync: false,
                },
            ));
            has_slice = false;
        }

        let len = unit.end() - unit.offset;
        match current.segments.last_mut() {
            Some((offset, size)) if *offset + *size == unit.offset => *size += len,
            _ => current.segments.push((unit.offset, len)),
        }
        if unit.is_slice() {
            has_slice = true;
        }
        if unit.nal_type == NAL_IDR {
            current.sync = true;
        }
    }

    if has_slice && scan.clean_end {
        units.push(current);
    }
    units
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u32,
    pub bit_depth_luma_minus8: u32,
    pub bit_depth_chroma_minus8: u32,
    pub width: u32,
    pub height: u32,
}

/// Removes emulation prevention bytes (`00 00 03`).
pub fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    fn bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.bit / 8)?;
        let value = (byte >> (7 - self.bit % 8)) & 1;
        self.bit += 1;
        Some(value as u32)
    }

    fn bits(&mut self, count: u32) -> Option<u32> {
        let mut value = 0;
        for _ in 0..count {
            value = (value << 1) | self.bit()?;
        }
        Some(value)
    }

    fn ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let suffix = self.bits(zeros)? as u64;
        Some(((1_u64 << zeros) - 1 + suffix) as u32)
    }

    fn se(&mut self) -> Option<i32> {
        let code = self.ue()? as i64;
        Some(if code % 2 == 1 {
            ((code + 1) / 2) as i32
        } else {
            (-(code / 2)) as i32
        })
    }
}

fn has_chroma_info(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

fn skip_scaling_list(bits: &mut BitReader<'_>, size: usize) -> Option<()> {
    let mut last = 8_i32;
    let mut next = 8_i32;
    for _ in 0..size {
        if next != 0 {
            let delta = bits.se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

/// Parses the fields of a sequence parameter set needed to describe the stream.
/// `nal` includes the one-byte NAL header.
pub fn parse_sps(nal: &[u8]) -> Option<SpsInfo> {
    if nal.len() < 4 || nal[0] & 0x1f != NAL_SPS {
        return None;
    }
    let rbsp = unescape_rbsp(&nal[1..]);
    let mut bits = BitReader::new(&rbsp);

    let profile_idc = bits.bits(8)? as u8;
    let constraint_flags = bits.bits(8)? as u8;
    let level_idc = bits.bits(8)? as u8;
    bits.ue()?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    let mut bit_depth_luma_minus8 = 0;
    let mut bit_depth_chroma_minus8 = 0;
    if has_chroma_info(profile_idc) {
        chroma_format_idc = bits.ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = bits.bit()? == 1;
        }
        bit_depth_luma_minus8 = bits.ue()?;
        bit_depth_chroma_minus8 = bits.ue()?;
        bits.bit()?;
        if bits.bit()? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for index in 0..lists {
                if bits.bit()? == 1 {
                    skip_scaling_list(&mut bits, if index < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    bits.ue()?;
    match bits.ue()? {
        0 => {
            bits.ue()?;
        }
        1 => {
            bits.bit()?;
            bits.se()?;
            bits.se()?;
            for _ in 0..bits.ue()? {
                bits.se()?;
            }
        }
        _ => {}
    }

    bits.ue()?;
    bits.bit()?;
    let width_mbs = bits.ue()?.checked_add(1)?;
    let height_units = bits.ue()?.checked_add(1)?;
    let frame_mbs_only = bits.bit()?;
    if frame_mbs_only == 0 {
        bits.bit()?;
    }
    bits.bit()?;

    let (mut crop_x, mut crop_y) = (0, 0);
    if bits.bit()? == 1 {
        let left = bits.ue()?;
        let right = bits.ue()?;
        let top = bits.ue()?;
        let bottom = bits.ue()?;

        let chroma_array_type = if separate_colour_plane {
            0
        } else {
            chroma_format_idc
        };
        let (unit_x, unit_y) = match chroma_array_type {
            0 => (1, 2 - frame_mbs_only),
            1 => (2, 2 * (2 - frame_mbs_only)),
            2 => (2, 2 - frame_mbs_only),
            _ => (1, 2 - frame_mbs_only),
        };
        crop_x = left.checked_add(right)?.checked_mul(unit_x)?;
        crop_y = top.checked_add(bottom)?.checked_mul(unit_y)?;
    }

    let width = width_mbs.checked_mul(16)?.checked_sub(crop_x)?;
    let height = height_units
        .checked_mul(16 * (2 - frame_mbs_only))?
        .checked_sub(crop_y)?;

    Some(SpsInfo {
        profile_idc,
        constraint_flags,
        level_idc,
        chroma_format_idc,
        bit_depth_luma_minus8,
        bit_depth_chroma_minus8,
        width,
        height,
    })
}

/// Builds an `AVCDecoderConfigurationRecord` for one SPS and one PPS.
pub fn decoder_config(sps: &[u8], pps: &[u8], info: &SpsInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(sps.len() + pps.len() + 16);
    out.push(1);
    out.push(info.profile_idc);
    out.push(info.constraint_flags);
    out.push(info.level_idc);
    out.push(0xfc | (LENGTH_SIZE as u8 - 1));
    out.push(0xe0 | 1);
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(sps);
    out.push(1);
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(pps);
    if matches!(info.profile_idc, 100 | 110 | 122 | 144) {
        out.push(0xfc | (info.chroma_format_idc as u8 & 0x03));
        out.push(0xf8 | (info.bit_depth_luma_minus8 as u8 & 0x07));
        out.push(0xf8 | (info.bit_depth_chroma_minus8 as u8 & 0x07));
        out.push(0);
    }
    out
}
