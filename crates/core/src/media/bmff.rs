//! ISO base media (MP4) and QuickTime box parsing.
//!
//! Top-level boxes are walked header-by-header with seeks so that large `mdat`
//! payloads are never read. Only the `moov` index is buffered, and only when it is
//! below the configured ceiling.

use std::io::{self, Read, Seek, SeekFrom};

use thiserror::Error;
use tracing::debug;

use super::{be_u16, be_u32, be_u64, read_up_to};

pub type FourCc = [u8; 4];

pub const FTYP: FourCc = *b"ftyp";
pub const MOOV: FourCc = *b"moov";
pub const MDAT: FourCc = *b"mdat";
pub const MOOF: FourCc = *b"moof";

const KNOWN_TOP_LEVEL: &[FourCc] = &[
    *b"ftyp", *b"styp", *b"moov", *b"mdat", *b"free", *b"skip", *b"wide", *b"pnot", *b"uuid",
    *b"moof", *b"mfra", *b"sidx", *b"meta", *b"pdin", *b"prft", *b"emsg",
];

const MAX_UNIFORM_SAMPLES: u32 = 16 * 1024 * 1024;

pub fn is_known_top_level(kind: &FourCc) -> bool {
    KNOWN_TOP_LEVEL.contains(kind)
}

pub fn fourcc_str(kind: &FourCc) -> String {
    String::from_utf8_lossy(kind).to_string()
}

fn is_printable(kind: &FourCc) -> bool {
    kind.iter().all(|b| (0x20..=0x7e).contains(b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub kind: FourCc,
    pub offset: u64,
    pub header_len: u64,
    pub size: u64,
}

impl BoxHeader {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    pub fn payload_offset(&self) -> u64 {
        self.offset + self.header_len
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopLevelLayout {
    pub file_len: u64,
    /// Boxes that lie entirely within the file, in file order.
    pub boxes: Vec<BoxHeader>,
    /// A final box whose declared size runs past the end of the file.
    pub truncated: Option<BoxHeader>,
    /// Offset at which bytes stop parsing as boxes.
    pub garbage_at: Option<u64>,
}

impl TopLevelLayout {
    pub fn first(&self) -> Option<&BoxHeader> {
        self.boxes.first().or(self.truncated.as_ref())
    }

    pub fn is_recognizable(&self) -> bool {
        self.first()
            .is_some_and(|header| is_known_top_level(&header.kind))
    }

    pub fn is_clean(&self) -> bool {
        self.truncated.is_none() && self.garbage_at.is_none()
    }

    pub fn find(&self, kind: FourCc) -> Option<&BoxHeader> {
        self.boxes.iter().find(|header| header.kind == kind)
    }

    pub fn has(&self, kind: FourCc) -> bool {
        self.find(kind).is_some()
    }

    /// End of the bytes that still parse as part of the box sequence.
    pub fn data_limit(&self) -> u64 {
        self.garbage_at.unwrap_or(self.file_len)
    }

    /// `mdat` payload ranges actually present in the file, including a truncated tail.
    pub fn media_ranges(&self) -> Vec<(u64, u64)> {
        self.boxes
            .iter()
            .chain(self.truncated.iter())
            .filter(|header| header.kind == MDAT)
            .map(|header| {
                let start = header.payload_offset().min(self.file_len);
                let end = header.end().min(self.file_len);
                (start, end)
            })
            .filter(|(start, end)| end > start)
            .collect()
    }
}

pub fn scan_top_level<R: Read + Seek + ?Sized>(
    reader: &mut R,
    file_len: u64,
) -> io::Result<TopLevelLayout> {
    let mut layout = TopLevelLayout {
        file_len,
        ..TopLevelLayout::default()
    };
    let mut pos = 0_u64;

    while pos < file_len {
        if file_len - pos < 8 {
            layout.garbage_at = Some(pos);
            break;
        }
        reader.seek(SeekFrom::Start(pos))?;
        let mut head = [0_u8; 16];
        let available = read_up_to(reader, &mut head)?;
        if available < 8 {
            layout.garbage_at = Some(pos);
            break;
        }

        let declared = be_u32(&head[0..4]) as u64;
        let kind: FourCc = [head[4], head[5], head[6], head[7]];
        if !is_printable(&kind) {
            debug!("non-printable box type at offset {pos}");
            layout.garbage_at = Some(pos);
            break;
        }

        let (size, header_len) = match declared {
            0 => (file_len - pos, 8),
            1 => {
                if available < 16 {
                    layout.garbage_at = Some(pos);
                    break;
                }
                (be_u64(&head[8..16]), 16)
            }
            size => (size, 8),
        };
        if size < header_len {
            debug!("box {} at {pos} declares impossible size {size}", fourcc_str(&kind));
            layout.garbage_at = Some(pos);
            break;
        }

        let header = BoxHeader {
            kind,
            offset: pos,
            header_len,
            size,
        };
        if header.end() > file_len {
            layout.truncated = Some(header);
            break;
        }
        layout.boxes.push(header);
        pos = header.end();
    }

    Ok(layout)
}

pub fn read_box<R: Read + Seek + ?Sized>(reader: &mut R, header: &BoxHeader) -> io::Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(header.offset))?;
    let mut data = vec![0_u8; header.size as usize];
    reader.read_exact(&mut data)?;
    Ok(data)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("box '{0}' is truncated")]
    Truncated(String),

    #[error("required box '{0}' is missing")]
    Missing(&'static str),

    #[error("{0}")]
    Inconsistent(String),

    #[error("unsupported layout: {0}")]
    Unsupported(&'static str),

    #[error("sample of {size} bytes at offset {offset} ends past the addressable range")]
    OffsetOverflow { offset: u64, size: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct RawBox<'a> {
    pub kind: FourCc,
    pub payload: &'a [u8],
    pub whole: &'a [u8],
}

/// Splits a buffer into its child boxes.
pub fn child_boxes(data: &[u8]) -> Result<Vec<RawBox<'_>>, IndexError> {
    let mut boxes = Vec::new();
    let mut pos = 0_usize;
    while pos < data.len() {
        if data.len() - pos < 8 {
            return Err(IndexError::Truncated("box header".to_string()));
        }
        let declared = be_u32(&data[pos..]) as u64;
        let kind: FourCc = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];
        let (size, header_len) = match declared {
            0 => ((data.len() - pos) as u64, 8_usize),
            1 => {
                if data.len() - pos < 16 {
                    return Err(IndexError::Truncated(fourcc_str(&kind)));
                }
                (be_u64(&data[pos + 8..]), 16_usize)
            }
            size => (size, 8_usize),
        };
        if size < header_len as u64 || size > (data.len() - pos) as u64 {
            return Err(IndexError::Truncated(fourcc_str(&kind)));
        }
        let end = pos + size as usize;
        boxes.push(RawBox {
            kind,
            payload: &data[pos + header_len..end],
            whole: &data[pos..end],
        });
        pos = end;
    }
    Ok(boxes)
}

fn find_child<'a>(children: &[RawBox<'a>], kind: &FourCc) -> Option<RawBox<'a>> {
    children.iter().find(|child| &child.kind == kind).copied()
}

fn require_child<'a>(
    children: &[RawBox<'a>],
    kind: &'static [u8; 4],
    name: &'static str,
) -> Result<RawBox<'a>, IndexError> {
    find_child(children, kind).ok_or(IndexError::Missing(name))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], context: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            context,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], IndexError> {
        if self.data.len() - self.pos < len {
            return Err(IndexError::Truncated(self.context.to_string()));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, IndexError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, IndexError> {
        Ok(be_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, IndexError> {
        Ok(be_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, IndexError> {
        Ok(be_u64(self.take(8)?))
    }

    fn skip(&mut self, len: usize) -> Result<(), IndexError> {
        self.take(len).map(|_| ())
    }

    /// Reads the version byte and skips the flags of a full box.
    fn version(&mut self) -> Result<u8, IndexError> {
        let version = self.u8()?;
        self.skip(3)?;
        Ok(version)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

const CONTAINER_BOXES: &[FourCc] = &[
    *b"moov", *b"trak", *b"mdia", *b"minf", *b"stbl", *b"edts", *b"dinf", *b"mvex", *b"udta",
];

/// Rejects container nesting deeper than `max_depth` before the index is interpreted.
pub fn check_nesting(data: &[u8], max_depth: usize) -> Result<(), IndexError> {
    fn descend(data: &[u8], depth: usize, max_depth: usize) -> Result<(), IndexError> {
        if depth > max_depth {
            return Err(IndexError::Inconsistent(format!(
                "box nesting deeper than {max_depth}"
            )));
        }
        for child in child_boxes(data)? {
            if CONTAINER_BOXES.contains(&child.kind) {
                descend(child.payload, depth + 1, max_depth)?;
            }
        }
        Ok(())
    }
    descend(data, 0, max_depth)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexState {
    Parsed(Movie),
    Missing,
    Truncated,
    TooLarge(u64),
    Unreadable(IndexError),
}

/// Locates, buffers and parses the `moov` box described by `layout`.
pub fn load_index<R: Read + Seek + ?Sized>(
    reader: &mut R,
    layout: &TopLevelLayout,
    max_index_bytes: u64,
    max_depth: usize,
) -> io::Result<IndexState> {
    let Some(header) = layout.find(MOOV) else {
        let truncated = layout
            .truncated
            .is_some_and(|header| header.kind == MOOV);
        return Ok(if truncated {
            IndexState::Truncated
        } else {
            IndexState::Missing
        });
    };
    if header.size > max_index_bytes {
        return Ok(IndexState::TooLarge(header.size));
    }

    let data = read_box(reader, header)?;
    if let Err(err) = check_nesting(&data, max_depth) {
        return Ok(IndexState::Unreadable(err));
    }
    Ok(match parse_movie(&data) {
        Ok(movie) => IndexState::Parsed(movie),
        Err(err) => IndexState::Unreadable(err),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleTable {
    pub sizes: Vec<u32>,
    pub chunk_offsets: Vec<u64>,
    pub sample_to_chunk: Vec<StscEntry>,
    pub time_to_sample: Vec<(u32, u32)>,
    pub composition_offsets: Option<Vec<(u32, i32)>>,
    pub sync_samples: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub offset: u64,
    pub size: u32,
    pub duration: u32,
    pub composition_offset: i32,
    pub sync: bool,
}

impl Sample {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size as u64)
    }
}

impl SampleTable {
    /// Resolves every sample to its byte range and timing, in decode order.
    pub fn samples(&self) -> Result<Vec<Sample>, IndexError> {
        let count = self.sizes.len();
        let mut samples = Vec::with_capacity(count);

        let mut durations = self
            .time_to_sample
            .iter()
            .flat_map(|(run, delta)| std::iter::repeat(*delta).take(*run as usize));
        let mut offsets = self
            .composition_offsets
            .iter()
            .flatten()
            .flat_map(|(run, offset)| std::iter::repeat(*offset).take(*run as usize));
        let sync = self.sync_samples.as_ref().map(|numbers| {
            numbers
                .iter()
                .copied()
                .collect::<std::collections::HashSet<u32>>()
        });

        let chunk_count = self.chunk_offsets.len() as u32;
        for (index, entry) in self.sample_to_chunk.iter().enumerate() {
            if entry.first_chunk == 0 || entry.first_chunk > chunk_count {
                return Err(IndexError::Inconsistent(format!(
                    "sample-to-chunk entry references chunk {} of {}",
                    entry.first_chunk, chunk_count
                )));
            }
            let last_chunk = match self.sample_to_chunk.get(index + 1) {
                Some(next) if next.first_chunk > entry.first_chunk => next.first_chunk - 1,
                Some(_) => {
                    return Err(IndexError::Inconsistent(
                        "sample-to-chunk entries are not increasing".to_string(),
                    ))
                }
                None => chunk_count,
            };

            for chunk in entry.first_chunk..=last_chunk {
                let mut offset = self.chunk_offsets[(chunk - 1) as usize];
                for _ in 0..entry.samples_per_chunk {
                    let sample_index = samples.len();
                    if sample_index >= count {
                        break;
                    }
                    let size = self.sizes[sample_index];
                    let end = offset
                        .checked_add(size as u64)
                        .ok_or(IndexError::OffsetOverflow { offset, size })?;
                    let number = sample_index as u32 + 1;
                    samples.push(Sample {
                        offset,
                        size,
                        duration: durations.next().unwrap_or(0),
                        composition_offset: offsets.next().unwrap_or(0),
                        sync: sync.as_ref().map_or(true, |set| set.contains(&number)),
                    });
                    offset = end;
                }
            }
        }

        if samples.len() != count {
            return Err(IndexError::Inconsistent(format!(
                "chunk map covers {} of {} samples",
                samples.len(),
                count
            )));
        }
        Ok(samples)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub track_id: u32,
    pub handler: FourCc,
    pub media_timescale: u32,
    pub language: u16,
    pub width: u32,
    pub height: u32,
    pub volume: u16,
    /// The complete `stsd` box, reused verbatim when rebuilding.
    pub sample_description: Vec<u8>,
    pub table: SampleTable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Movie {
    pub timescale: u32,
    pub duration: u64,
    pub fragmented: bool,
    pub tracks: Vec<Track>,
}

impl Movie {
    /// Largest byte offset referenced by any sample, or `None` for an empty index.
    pub fn referenced_end(&self) -> Result<Option<u64>, IndexError> {
        let mut end = None;
        for track in &self.tracks {
            for sample in track.table.samples()? {
                end = Some(end.map_or(sample.end(), |current: u64| current.max(sample.end())));
            }
        }
        Ok(end)
    }
}

pub fn parse_movie(moov: &[u8]) -> Result<Movie, IndexError> {
    let top = child_boxes(moov)?;
    let moov_box = require_child(&top, b"moov", "moov")?;
    let children = child_boxes(moov_box.payload)?;

    let mvhd = require_child(&children, b"mvhd", "mvhd")?;
    let mut cursor = Cursor::new(mvhd.payload, "mvhd");
    let (timescale, duration) = if cursor.version()? == 1 {
        cursor.skip(16)?;
        (cursor.u32()?, cursor.u64()?)
    } else {
        cursor.skip(8)?;
        (cursor.u32()?, cursor.u32()? as u64)
    };

    let mut tracks = Vec::new();
    for trak in children.iter().filter(|child| &child.kind == b"trak") {
        tracks.push(parse_track(trak.payload)?);
    }
    if tracks.is_empty() {
        return Err(IndexError::Missing("trak"));
    }

    Ok(Movie {
        timescale,
        duration,
        fragmented: find_child(&children, b"mvex").is_some(),
        tracks,
    })
}

fn parse_track(trak: &[u8]) -> Result<Track, IndexError> {
    let children = child_boxes(trak)?;

    let tkhd = require_child(&children, b"tkhd", "tkhd")?;
    let mut cursor = Cursor::new(tkhd.payload, "tkhd");
    let track_id = if cursor.version()? == 1 {
        cursor.skip(16)?;
        let id = cursor.u32()?;
        cursor.skip(12)?;
        id
    } else {
        cursor.skip(8)?;
        let id = cursor.u32()?;
        cursor.skip(8)?;
        id
    };
    cursor.skip(8 + 2 + 2)?;
    let volume = cursor.u16()?;
    cursor.skip(2 + 36)?;
    let width = cursor.u32()?;
    let height = cursor.u32()?;

    let mdia = require_child(&children, b"mdia", "mdia")?;
    let mdia_children = child_boxes(mdia.payload)?;

    let mdhd = require_child(&mdia_children, b"mdhd", "mdhd")?;
    let mut cursor = Cursor::new(mdhd.payload, "mdhd");
    let (media_timescale, language) = if cursor.version()? == 1 {
        cursor.skip(16)?;
        let timescale = cursor.u32()?;
        cursor.skip(8)?;
        (timescale, cursor.u16()?)
    } else {
        cursor.skip(8)?;
        let timescale = cursor.u32()?;
        cursor.skip(4)?;
        (timescale, cursor.u16()?)
    };

    let hdlr = require_child(&mdia_children, b"hdlr", "hdlr")?;
    let mut cursor = Cursor::new(hdlr.payload, "hdlr");
    cursor.version()?;
    cursor.skip(4)?;
    let handler_bytes = cursor.take(4)?;
    let handler = [
        handler_bytes[0],
        handler_bytes[1],
        handler_bytes[2],
        handler_bytes[3],
    ];

    let minf = require_child(&mdia_children, b"minf", "minf")?;
    let minf_children = child_boxes(minf.payload)?;
    let stbl = require_child(&minf_children, b"stbl", "stbl")?;
    let stbl_children = child_boxes(stbl.payload)?;

    let stsd = require_child(&stbl_children, b"stsd", "stsd")?;
    let table = parse_sample_table(&stbl_children)?;

    Ok(Track {
        track_id,
        handler,
        media_timescale,
        language,
        width,
        height,
        volume,
        sample_description: stsd.whole.to_vec(),
        table,
    })
}

fn parse_sample_table(stbl: &[RawBox<'_>]) -> Result<SampleTable, IndexError> {
    let mut table = SampleTable::default();

    if find_child(stbl, b"stz2").is_some() {
        return Err(IndexError::Unsupported("compact sample sizes (stz2)"));
    }
    let stsz = require_child(stbl, b"stsz", "stsz")?;
    let mut cursor = Cursor::new(stsz.payload, "stsz");
    cursor.version()?;
    let uniform = cursor.u32()?;
    let count = cursor.u32()?;
    if uniform != 0 {
        if count > MAX_UNIFORM_SAMPLES {
            return Err(IndexError::Inconsistent(format!(
                "implausible sample count {count}"
            )));
        }
        table.sizes = vec![uniform; count as usize];
    } else {
        if cursor.remaining() / 4 < count as usize {
            return Err(IndexError::Truncated("stsz".to_string()));
        }
        table.sizes = (0..count)
            .map(|_| cursor.u32())
            .collect::<Result<Vec<_>, _>>()?;
    }

    if let Some(stco) = find_child(stbl, b"stco") {
        let mut cursor = Cursor::new(stco.payload, "stco");
        cursor.version()?;
        let entries = cursor.u32()?;
        if cursor.remaining() / 4 < entries as usize {
            return Err(IndexError::Truncated("stco".to_string()));
        }
        table.chunk_offsets = (0..entries)
            .map(|_| cursor.u32().map(u64::from))
            .collect::<Result<Vec<_>, _>>()?;
    } else if let Some(co64) = find_child(stbl, b"co64") {
        let mut cursor = Cursor::new(co64.payload, "co64");
        cursor.version()?;
        let entries = cursor.u32()?;
        if cursor.remaining() / 8 < entries as usize {
            return Err(IndexError::Truncated("co64".to_string()));
        }
        table.chunk_offsets = (0..entries)
            .map(|_| cursor.u64())
            .collect::<Result<Vec<_>, _>>()?;
    } else {
        return Err(IndexError::Missing("stco"));
    }

    let stsc = require_child(stbl, b"stsc", "stsc")?;
    let mut cursor = Cursor::new(stsc.payload, "stsc");
    cursor.version()?;
    let entries = cursor.u32()?;
    if cursor.remaining() / 12 < entries as usize {
        return Err(IndexError::Truncated("stsc".to_string()));
    }
    for _ in 0..entries {
        let first_chunk = cursor.u32()?;
        let samples_per_chunk = cursor.u32()?;
        cursor.skip(4)?;
        table.sample_to_chunk.push(StscEntry {
            first_chunk,
            samples_per_chunk,
        });
    }

    if let Some(stts) = find_child(stbl, b"stts") {
        let mut cursor = Cursor::new(stts.payload, "stts");
        cursor.version()?;
        let entries = cursor.u32()?;
        if cursor.remaining() / 8 < entries as usize {
            return Err(IndexError::Truncated("stts".to_string()));
        }
        for _ in 0..entries {
            table.time_to_sample.push((cursor.u32()?, cursor.u32()?));
        }
    }

    if let Some(ctts) = find_child(stbl, b"ctts") {
        let mut cursor = Cursor::new(ctts.payload, "ctts");
        cursor.version()?;
        let entries = cursor.u32()?;
        if cursor.remaining() / 8 < entries as usize {
            return Err(IndexError::Truncated("ctts".to_string()));
        }
        let mut offsets = Vec::with_capacity(entries as usize);
        for _ in 0..entries {
            offsets.push((cursor.u32()?, cursor.u32()? as i32));
        }
        table.composition_offsets = Some(offsets);
    }

    if let Some(stss) = find_child(stbl, b"stss") {
        let mut cursor = Cursor::new(stss.payload, "stss");
        cursor.version()?;
        let entries = cursor.u32()?;
        if cursor.remaining() / 4 < entries as usize {
            return Err(IndexError::Truncated("stss".to_string()));
        }
        table.sync_samples = Some(
            (0..entries)
                .map(|_| cursor.u32())
                .collect::<Result<Vec<_>, _>>()?,
        );
    }

    Ok(table)
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Minimal MP4 builders for tests.

    use crate::media::mux::{build_moov, mdat_header, TrackPlan};

    pub fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    pub fn ftyp() -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"isom");
        payload.extend_from_slice(&512_u32.to_be_bytes());
        payload.extend_from_slice(b"isomiso2avc1mp41");
        boxed(b"ftyp", &payload)
    }

    pub fn opaque_stsd() -> Vec<u8> {
        let mut entry = Vec::new();
        entry.extend_from_slice(&[0; 6]);
        entry.extend_from_slice(&1_u16.to_be_bytes());
        let mut payload = vec![0, 0, 0, 0];
        payload.extend_from_slice(&1_u32.to_be_bytes());
        payload.extend_from_slice(&boxed(b"mp4v", &entry));
        boxed(b"stsd", &payload)
    }

    fn plan_at(base: u64, sizes: &[u32]) -> TrackPlan {
        let mut plan = TrackPlan::video(1, 1000, 320, 240, opaque_stsd());
        let mut offset = base;
        for (index, size) in sizes.iter().enumerate() {
            plan.push_sample(offset, *size, 40, 0, index == 0);
            offset += *size as u64;
        }
        plan
    }

    /// `ftyp + moov + mdat`, the layout written by cameras that reserve index space.
    pub fn faststart_mp4(sizes: &[u32]) -> Vec<u8> {
        let ftyp = ftyp();
        let moov_len = build_moov(1000, &[plan_at(0, sizes)]).len();
        let payload_len: u64 = sizes.iter().map(|s| *s as u64).sum();
        let header = mdat_header(payload_len);
        let base = (ftyp.len() + moov_len + header.len()) as u64;

        let mut file = ftyp;
        file.extend_from_slice(&build_moov(1000, &[plan_at(base, sizes)]));
        file.extend_from_slice(&header);
        for (index, size) in sizes.iter().enumerate() {
            file.extend(std::iter::repeat((index % 251) as u8).take(*size as usize));
        }
        file
    }

    /// `ftyp + mdat + moov` with one video track whose samples have `sizes`.
    pub fn simple_mp4(sizes: &[u32]) -> Vec<u8> {
        let ftyp = ftyp();
        let payload_len: u64 = sizes.iter().map(|s| *s as u64).sum();
        let header = mdat_header(payload_len);
        let plan = plan_at((ftyp.len() + header.len()) as u64, sizes);

        let mut file = ftyp;
        file.extend_from_slice(&header);
        for (index, size) in sizes.iter().enumerate() {
            file.extend(std::iter::repeat((index % 251) as u8).take(*size as usize));
        }
        file.extend_from_slice(&build_moov(1000, &[plan]));
        file
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::fixtures::{boxed, ftyp, simple_mp4};
    use super::{
        check_nesting, load_index, parse_movie, read_box, scan_top_level, IndexError, IndexState,
        SampleTable, StscEntry, MDAT, MOOV,
    };

    #[test]
    fn walks_top_level_boxes_without_reading_payloads() {
        let file = simple_mp4(&[100, 200, 300]);
        let layout = scan_top_level(&mut Cursor::new(&file), file.len() as u64).expect("scan");

        let kinds = layout.boxes.iter().map(|b| b.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![*b"ftyp", MDAT, MOOV]);
        assert!(layout.is_clean());
        assert!(layout.is_recognizable());
        assert_eq!(layout.media_ranges().len(), 1);
    }

    #[test]
    fn truncated_last_box_is_reported() {
        let mut file = ftyp();
        file.extend_from_slice(&boxed(b"mdat", &[7; 64]));
        file.truncate(file.len() - 10);
        let layout = scan_top_level(&mut Cursor::new(&file), file.len() as u64).expect("scan");

        assert_eq!(layout.boxes.len(), 1);
        let truncated = layout.truncated.expect("truncated mdat");
        assert_eq!(truncated.kind, MDAT);
        assert_eq!(layout.media_ranges(), vec![(truncated.offset + 8, file.len() as u64)]);
    }

    #[test]
    fn garbage_stops_the_walk() {
        let mut file = ftyp();
        file.extend_from_slice(&[0xff, 0x00, 0x10, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let layout = scan_top_level(&mut Cursor::new(&file), file.len() as u64).expect("scan");
        assert_eq!(layout.garbage_at, Some(ftyp().len() as u64));
    }

    #[test]
    fn parses_sample_table_from_built_index() {
        let file = simple_mp4(&[10, 20, 30]);
        let mut cursor = Cursor::new(&file);
        let layout = scan_top_level(&mut cursor, file.len() as u64).expect("scan");
        let moov = read_box(&mut cursor, layout.find(MOOV).expect("moov")).expect("read");
        let movie = parse_movie(&moov).expect("parse");

        assert_eq!(movie.tracks.len(), 1);
        let samples = movie.tracks[0].table.samples().expect("samples");
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1].offset, samples[0].end());
        assert!(samples[0].sync);
        assert!(!samples[1].sync);
        assert_eq!(
            movie.referenced_end().expect("end"),
            Some(layout.find(MDAT).expect("mdat").end())
        );
    }

    #[test]
    fn index_state_distinguishes_missing_and_truncated() {
        let mut file = ftyp();
        file.extend_from_slice(&boxed(b"mdat", &[1; 32]));
        let layout = scan_top_level(&mut Cursor::new(&file), file.len() as u64).expect("scan");
        let state = load_index(&mut Cursor::new(&file), &layout, 1 << 20, 16).expect("load");
        assert_eq!(state, IndexState::Missing);

        let mut file = simple_mp4(&[10, 10]);
        file.truncate(file.len() - 4);
        let layout = scan_top_level(&mut Cursor::new(&file), file.len() as u64).expect("scan");
        let state = load_index(&mut Cursor::new(&file), &layout, 1 << 20, 16).expect("load");
        assert_eq!(state, IndexState::Truncated);
    }

    #[test]
    fn oversized_index_is_not_buffered() {
        let file = simple_mp4(&[10, 10]);
        let layout = scan_top_level(&mut Cursor::new(&file), file.len() as u64).expect("scan");
        let state = load_index(&mut Cursor::new(&file), &layout, 16, 16).expect("load");
        assert!(matches!(state, IndexState::TooLarge(_)));
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let mut data = boxed(b"stbl", &[]);
        for kind in [b"minf", b"mdia", b"trak", b"moov"] {
            data = boxed(kind, &data);
        }
        assert!(check_nesting(&data, 5).is_ok());
        assert!(check_nesting(&data, 4).is_err());
    }

    #[test]
    fn chunk_offset_near_the_address_limit_is_rejected() {
        let table = SampleTable {
            sizes: vec![100],
            chunk_offsets: vec![u64::MAX - 10],
            sample_to_chunk: vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 1,
            }],
            ..SampleTable::default()
        };
        assert_eq!(
            table.samples(),
            Err(IndexError::OffsetOverflow {
                offset: u64::MAX - 10,
                size: 100
            })
        );
    }

    #[test]
    fn composition_runs_beyond_the_sample_count_are_not_expanded() {
        let table = SampleTable {
            sizes: vec![10, 10],
            chunk_offsets: vec![64],
            sample_to_chunk: vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 2,
            }],
            time_to_sample: vec![(u32::MAX, 40)],
            composition_offsets: Some(vec![(u32::MAX, 80), (1, 0)]),
            sync_samples: None,
        };
        let samples = table.samples().expect("samples");
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|sample| sample.composition_offset == 80));
        assert!(samples.iter().all(|sample| sample.duration == 40));
    }

    #[test]
    fn missing_track_is_an_index_error() {
        let moov = boxed(b"moov", &boxed(b"mvhd", &[0; 100]));
        assert_eq!(parse_movie(&moov), Err(IndexError::Missing("trak")));
    }
}
