//! Writes a fresh, self-consistent `ftyp`/`mdat`/`moov` layout.
//!
//! Samples are described one per chunk, so every sample carries its own offset and
//! no `stsc` run-length bookkeeping is needed when a track is trimmed.

use super::bmff::FourCc;

const IDENTITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedSample {
    pub offset: u64,
    pub size: u32,
    pub duration: u32,
    pub composition_offset: i32,
    pub sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackPlan {
    pub track_id: u32,
    pub handler: FourCc,
    pub media_timescale: u32,
    pub language: u16,
    /// 16.16 fixed point, as stored in `tkhd`.
    pub width: u32,
    pub height: u32,
    pub volume: u16,
    pub sample_description: Vec<u8>,
    pub samples: Vec<PlannedSample>,
}

impl TrackPlan {
    pub fn video(
        track_id: u32,
        media_timescale: u32,
        width: u16,
        height: u16,
        sample_description: Vec<u8>,
    ) -> Self {
        Self {
            track_id,
            handler: *b"vide",
            media_timescale,
            language: undetermined_language(),
            width: (width as u32) << 16,
            height: (height as u32) << 16,
            volume: 0,
            sample_description,
            samples: Vec::new(),
        }
    }

    pub fn push_sample(
        &mut self,
        offset: u64,
        size: u32,
        duration: u32,
        composition_offset: i32,
        sync: bool,
    ) {
        self.samples.push(PlannedSample {
            offset,
            size,
            duration,
            composition_offset,
            sync,
        });
    }

    pub fn media_duration(&self) -> u64 {
        self.samples.iter().map(|s| s.duration as u64).sum()
    }

    fn movie_duration(&self, movie_timescale: u32) -> u64 {
        if self.media_timescale == 0 {
            return 0;
        }
        (self.media_duration() as u128 * movie_timescale as u128 / self.media_timescale as u128)
            as u64
    }
}

/// ISO 639-2 "und" packed as three 5-bit letters.
pub fn undetermined_language() -> u16 {
    let pack = |c: u8| (c - 0x60) as u16;
    (pack(b'u') << 10) | (pack(b'n') << 5) | pack(b'd')
}

#[derive(Default)]
struct BoxWriter {
    buf: Vec<u8>,
    open: Vec<usize>,
}

impl BoxWriter {
    fn start(&mut self, kind: &[u8; 4]) {
        self.open.push(self.buf.len());
        self.buf.extend_from_slice(&[0; 4]);
        self.buf.extend_from_slice(kind);
    }

    fn start_full(&mut self, kind: &[u8; 4], version: u8, flags: u32) {
        self.start(kind);
        self.u32(((version as u32) << 24) | (flags & 0x00ff_ffff));
    }

    fn end(&mut self) {
        if let Some(start) = self.open.pop() {
            let size = (self.buf.len() - start) as u32;
            self.buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
        }
    }

    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn zeros(&mut self, count: usize) {
        self.buf.extend(std::iter::repeat(0).take(count));
    }

    fn bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn matrix(&mut self) {
        for value in IDENTITY_MATRIX {
            self.u32(value);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub fn build_ftyp(major: &FourCc, minor: u32, compatible: &[FourCc]) -> Vec<u8> {
    let mut writer = BoxWriter::default();
    writer.start(b"ftyp");
    writer.bytes(major);
    writer.u32(minor);
    for brand in compatible {
        writer.bytes(brand);
    }
    writer.end();
    writer.finish()
}

pub fn default_ftyp() -> Vec<u8> {
    build_ftyp(b"isom", 512, &[*b"isom", *b"iso2", *b"avc1", *b"mp41"])
}

/// Header for an `mdat` carrying `payload_len` bytes; switches to a 64-bit size when needed.
pub fn mdat_header(payload_len: u64) -> Vec<u8> {
    let mut header = Vec::with_capacity(16);
    if payload_len + 8 <= u32::MAX as u64 {
        header.extend_from_slice(&((payload_len + 8) as u32).to_be_bytes());
        header.extend_from_slice(b"mdat");
    } else {
        header.extend_from_slice(&1_u32.to_be_bytes());
        header.extend_from_slice(b"mdat");
        header.extend_from_slice(&(payload_len + 16).to_be_bytes());
    }
    header
}

pub fn build_moov(movie_timescale: u32, tracks: &[TrackPlan]) -> Vec<u8> {
    let duration = tracks
        .iter()
        .map(|track| track.movie_duration(movie_timescale))
        .max()
        .unwrap_or(0);
    let next_track_id = tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1;

    let mut w = BoxWriter::default();
    w.start(b"moov");

    if duration > u32::MAX as u64 {
        w.start_full(b"mvhd", 1, 0);
        w.u64(0);
        w.u64(0);
        w.u32(movie_timescale);
        w.u64(duration);
    } else {
        w.start_full(b"mvhd", 0, 0);
        w.u32(0);
        w.u32(0);
        w.u32(movie_timescale);
        w.u32(duration as u32);
    }
    w.u32(0x0001_0000);
    w.u16(0x0100);
    w.zeros(2 + 8);
    w.matrix();
    w.zeros(24);
    w.u32(next_track_id);
    w.end();

    for track in tracks {
        write_track(&mut w, movie_timescale, track);
    }

    w.end();
    w.finish()
}

fn write_track(w: &mut BoxWriter, movie_timescale: u32, track: &TrackPlan) {
    let movie_duration = track.movie_duration(movie_timescale);
    let media_duration = track.media_duration();

    w.start(b"trak");

    if movie_duration > u32::MAX as u64 {
        w.start_full(b"tkhd", 1, 0x3);
        w.u64(0);
        w.u64(0);
        w.u32(track.track_id);
        w.u32(0);
        w.u64(movie_duration);
    } else {
        w.start_full(b"tkhd", 0, 0x3);
        w.u32(0);
        w.u32(0);
        w.u32(track.track_id);
        w.u32(0);
        w.u32(movie_duration as u32);
    }
    w.zeros(8);
    w.u16(0);
    w.u16(0);
    w.u16(track.volume);
    w.u16(0);
    w.matrix();
    w.u32(track.width);
    w.u32(track.height);
    w.end();

    w.start(b"mdia");

    if media_duration > u32::MAX as u64 {
        w.start_full(b"mdhd", 1, 0);
        w.u64(0);
        w.u64(0);
        w.u32(track.media_timescale);
        w.u64(media_duration);
    } else {
        w.start_full(b"mdhd", 0, 0);
        w.u32(0);
        w.u32(0);
        w.u32(track.media_timescale);
        w.u32(media_duration as u32);
    }
    w.u16(track.language);
    w.u16(0);
    w.end();

    w.start_full(b"hdlr", 0, 0);
    w.u32(0);
    w.bytes(&track.handler);
    w.zeros(12);
    w.bytes(handler_name(&track.handler));
    w.u8(0);
    w.end();

    w.start(b"minf");
    match &track.handler {
        b"vide" => {
            w.start_full(b"vmhd", 0, 1);
            w.zeros(8);
            w.end();
        }
        b"soun" => {
            w.start_full(b"smhd", 0, 0);
            w.zeros(4);
            w.end();
        }
        _ => {
            w.start_full(b"nmhd", 0, 0);
            w.end();
        }
    }

    w.start(b"dinf");
    w.start_full(b"dref", 0, 0);
    w.u32(1);
    w.start_full(b"url ", 0, 1);
    w.end();
    w.end();
    w.end();

    w.start(b"stbl");
    w.bytes(&track.sample_description);
    write_sample_tables(w, &track.samples);
    w.end();

    w.end();
    w.end();
    w.end();
}

fn handler_name(handler: &FourCc) -> &'static [u8] {
    match handler {
        b"vide" => b"VideoHandler",
        b"soun" => b"SoundHandler",
        _ => b"DataHandler",
    }
}

fn write_sample_tables(w: &mut BoxWriter, samples: &[PlannedSample]) {
    let durations = run_lengths(samples.iter().map(|s| s.duration));
    w.start_full(b"stts", 0, 0);
    w.u32(durations.len() as u32);
    for (count, delta) in durations {
        w.u32(count);
        w.u32(delta);
    }
    w.end();

    if samples.iter().any(|s| s.composition_offset != 0) {
        let signed = samples.iter().any(|s| s.composition_offset < 0);
        let offsets = run_lengths(samples.iter().map(|s| s.composition_offset));
        w.start_full(b"ctts", u8::from(signed), 0);
        w.u32(offsets.len() as u32);
        for (count, offset) in offsets {
            w.u32(count);
            w.u32(offset as u32);
        }
        w.end();
    }

    if samples.iter().any(|s| !s.sync) {
        let sync = samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sync)
            .map(|(index, _)| index as u32 + 1)
            .collect::<Vec<_>>();
        w.start_full(b"stss", 0, 0);
        w.u32(sync.len() as u32);
        for number in sync {
            w.u32(number);
        }
        w.end();
    }

    w.start_full(b"stsz", 0, 0);
    w.u32(0);
    w.u32(samples.len() as u32);
    for sample in samples {
        w.u32(sample.size);
    }
    w.end();

    w.start_full(b"stsc", 0, 0);
    if samples.is_empty() {
        w.u32(0);
    } else {
        w.u32(1);
        w.u32(1);
        w.u32(1);
        w.u32(1);
    }
    w.end();

    if samples.iter().any(|s| s.offset > u32::MAX as u64) {
        w.start_full(b"co64", 0, 0);
        w.u32(samples.len() as u32);
        for sample in samples {
            w.u64(sample.offset);
        }
    } else {
        w.start_full(b"stco", 0, 0);
        w.u32(samples.len() as u32);
        for sample in samples {
            w.u32(sample.offset as u32);
        }
    }
    w.end();
}

fn run_lengths<T: PartialEq + Copy>(values: impl Iterator<Item = T>) -> Vec<(u32, T)> {
    let mut runs: Vec<(u32, T)> = Vec::new();
    for value in values {
        match runs.last_mut() {
            Some((count, last)) if *last == value => *count += 1,
            _ => runs.push((1, value)),
        }
    }
    runs
}

/// `stsd` with a single `avc1` entry wrapping the given `avcC` payload.
pub fn avc_sample_description(width: u16, height: u16, avc_config: &[u8]) -> Vec<u8> {
    let mut w = BoxWriter::default();
    w.start_full(b"stsd", 0, 0);
    w.u32(1);

    w.start(b"avc1");
    w.zeros(6);
    w.u16(1);
    w.u16(0);
    w.u16(0);
    w.zeros(12);
    w.u16(width);
    w.u16(height);
    w.u32(0x0048_0000);
    w.u32(0x0048_0000);
    w.u32(0);
    w.u16(1);
    w.zeros(32);
    w.u16(0x0018);
    w.u16(0xffff);

    w.start(b"avcC");
    w.bytes(avc_config);
    w.end();

    w.end();
    w.end();
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::{
        avc_sample_description, build_moov, mdat_header, run_lengths, undetermined_language,
        TrackPlan,
    };
    use crate::media::bmff::{child_boxes, parse_movie};

    #[test]
    fn language_packs_und() {
        assert_eq!(undetermined_language(), 0x55c4);
    }

    #[test]
    fn large_mdat_uses_extended_size() {
        assert_eq!(mdat_header(100).len(), 8);
        let header = mdat_header(u32::MAX as u64);
        assert_eq!(header.len(), 16);
        assert_eq!(&header[0..4], &1_u32.to_be_bytes());
    }

    #[test]
    fn run_lengths_collapse_repeats() {
        let runs = run_lengths([40, 40, 40, 33, 40].into_iter());
        assert_eq!(runs, vec![(3, 40), (1, 33), (1, 40)]);
    }

    #[test]
    fn built_index_round_trips_through_the_parser() {
        let stsd = avc_sample_description(640, 480, &[1, 0x42, 0, 0x1e, 0xff, 0xe0, 0]);
        let mut plan = TrackPlan::video(1, 30_000, 640, 480, stsd.clone());
        plan.push_sample(48, 1000, 1000, 0, true);
        plan.push_sample(1048, 500, 1000, 2000, false);
        plan.push_sample(5_000_000_000, 700, 1000, -1000, false);

        let moov = build_moov(1000, &[plan]);
        let movie = parse_movie(&moov).expect("parse");
        let track = &movie.tracks[0];
        assert_eq!(track.media_timescale, 30_000);
        assert_eq!(track.width >> 16, 640);
        assert_eq!(track.sample_description, stsd);
        assert_eq!(movie.duration, 100);

        let samples = track.table.samples().expect("samples");
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[2].offset, 5_000_000_000);
        assert_eq!(samples[1].composition_offset, 2000);
        assert_eq!(samples[2].composition_offset, -1000);
        assert!(samples[0].sync && !samples[1].sync);
    }

    #[test]
    fn avc_description_nests_avcc() {
        let stsd = avc_sample_description(1920, 1080, &[1, 2, 3]);
        let top = child_boxes(&stsd).expect("stsd");
        assert_eq!(&top[0].kind, b"stsd");
        let entries = child_boxes(&top[0].payload[8..]).expect("entries");
        assert_eq!(&entries[0].kind, b"avc1");
        let inner = child_boxes(&entries[0].payload[78..]).expect("avcC");
        assert_eq!(&inner[0].kind, b"avcC");
        assert_eq!(inner[0].payload, &[1, 2, 3]);
    }
}
