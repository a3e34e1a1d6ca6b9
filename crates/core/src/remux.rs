//! Salvage of damaged video files into a new, playable container.
//!
//! The source is only ever read. Depending on what survives, the output is a verbatim
//! copy, a prefix ending at the last complete fragment, or a fresh `ftyp + mdat + moov`
//! rebuilt from the original index or from the raw H.264 stream.

use std::io::{self, Seek, SeekFrom, Write};

use tracing::{debug, info, warn};

use crate::config::{CopyOptions, HealthPolicy};
use crate::copy::{copy_as, copy_range, discard, TransferError};
use crate::health::{self, MediaFormat};
use crate::media::avc::{access_units, decoder_config, parse_sps, scan_length_prefixed};
use crate::media::bmff::{self, IndexState, Movie, TopLevelLayout, FTYP, MDAT, MOOF};
use crate::media::mux::{
    avc_sample_description, build_moov, default_ftyp, mdat_header, TrackPlan,
};
use crate::media::read_up_to;
use crate::model::{
    Entry, EntryResult, FailureReason, Handle, HealthStatus, MediaKind, RemuxResult, RepairMethod,
};
use crate::provider::{split_name, unique_child_name, SourceStream, StorageProvider};

const REBUILT_MOVIE_TIMESCALE: u32 = 1000;
const COPY_BUFFER: usize = 256 * 1024;

pub fn repaired_name(name: &str) -> String {
    match split_name(name) {
        (stem, Some(extension)) => format!("{stem}_repaired.{extension}"),
        (stem, None) => format!("{stem}_repaired"),
    }
}

#[derive(Debug)]
enum RepairPlan {
    Verbatim,
    Prefix { end: u64 },
    Rebuild(Rebuild),
}

#[derive(Debug)]
struct Rebuild {
    method: RepairMethod,
    ftyp: Vec<u8>,
    movie_timescale: u32,
    tracks: Vec<TrackPlan>,
    /// Source byte ranges of every sample, parallel to each track's samples.
    sources: Vec<Vec<Vec<(u64, u64)>>>,
    note: String,
}

/// Writes a repaired copy of a video entry into `destination` as `<stem>_repaired.<ext>`.
pub fn remux_entry(
    provider: &dyn StorageProvider,
    entry: &Entry,
    destination: &Handle,
    policy: &HealthPolicy,
    options: &CopyOptions,
) -> RemuxResult {
    if entry.kind != MediaKind::Video {
        return EntryResult::failure(
            entry,
            FailureReason::Unrecoverable,
            "only video entries can be repaired",
        );
    }
    let name = unique_child_name(provider, destination, &repaired_name(&entry.name));

    let mut source = match provider.open_read(&entry.identifier) {
        Ok(stream) => stream,
        Err(err) => {
            return EntryResult::failure(entry, FailureReason::EntryUnreadable, err.to_string())
        }
    };

    let plan = match plan_repair(&mut *source, entry, policy) {
        Ok(Ok(plan)) => plan,
        Ok(Err(reason)) => {
            info!("{} cannot be repaired: {reason}", entry.identifier);
            return EntryResult::failure(entry, FailureReason::Unrecoverable, reason);
        }
        Err(err) => {
            warn!("reading {} for repair failed: {err}", entry.identifier);
            return EntryResult::failure(entry, FailureReason::EntryUnreadable, err.to_string());
        }
    };
    debug!("repair plan for {}: {:?}", entry.identifier, plan);

    let (method, note) = match &plan {
        RepairPlan::Verbatim => {
            drop(source);
            let mut result = copy_as(provider, entry, destination, &name, options);
            if result.succeeded {
                result.repair = Some(RepairMethod::Verbatim);
            }
            return result;
        }
        RepairPlan::Prefix { end } => (
            RepairMethod::FragmentTrim,
            format!("kept the first {end} bytes up to the last complete fragment"),
        ),
        RepairPlan::Rebuild(rebuild) => (rebuild.method, rebuild.note.clone()),
    };

    let mut pending = match provider.open_write(destination, &name) {
        Ok(pending) => pending,
        Err(err) => {
            return EntryResult::failure(entry, FailureReason::DestinationWrite, err.to_string())
        }
    };
    let written = match plan {
        RepairPlan::Prefix { end } => {
            let mut buffer = vec![0_u8; COPY_BUFFER];
            copy_range(&mut *source, 0, end, &mut *pending, &mut buffer).map(|_| end)
        }
        RepairPlan::Rebuild(rebuild) => write_rebuild(&mut *source, &mut *pending, rebuild),
        RepairPlan::Verbatim => Ok(0),
    }
    .and_then(|written| {
        pending
            .flush()
            .map(|_| written)
            .map_err(TransferError::Destination)
    });

    let written = match written {
        Ok(written) => written,
        Err(err) => {
            discard(pending, entry);
            return err.into_result(entry);
        }
    };
    let committed = match pending.commit() {
        Ok(handle) => handle,
        Err(err) => {
            return EntryResult::failure(entry, FailureReason::DestinationWrite, err.to_string())
        }
    };

    info!(
        "repaired {} -> {} via {:?} ({written} bytes)",
        entry.identifier, committed, method
    );
    let mut result = EntryResult::success(entry, committed, written);
    result.repair = Some(method);
    result.detail = Some(note);
    result
}

/// Decides how to salvage the stream. The inner error is a human-readable reason
/// the file cannot be repaired; the outer one is an I/O failure on the source.
fn plan_repair(
    source: &mut dyn SourceStream,
    entry: &Entry,
    policy: &HealthPolicy,
) -> io::Result<Result<RepairPlan, String>> {
    let file_len = source.seek(SeekFrom::End(0))?;
    source.seek(SeekFrom::Start(0))?;
    let mut head = [0_u8; 12];
    let read = read_up_to(source, &mut head)?;

    if health::sniff(&head[..read]) == Some(MediaFormat::Matroska) {
        let diagnosis = health::diagnose(MediaKind::Video, &entry.content_type, source, policy)?;
        return Ok(if diagnosis.status == HealthStatus::Ok {
            Ok(RepairPlan::Verbatim)
        } else {
            Err("repairing damaged Matroska files is not supported".to_string())
        });
    }

    let layout = bmff::scan_top_level(source, file_len)?;
    if !layout.is_recognizable() {
        return Ok(Err(
            "no recognizable container structure at the start of the file".to_string(),
        ));
    }

    let index = bmff::load_index(source, &layout, policy.max_index_bytes, policy.max_box_depth)?;
    if let IndexState::Parsed(movie) = &index {
        if movie.fragmented || layout.has(MOOF) {
            if layout.is_clean() {
                return Ok(Ok(RepairPlan::Verbatim));
            }
            return Ok(match last_fragment_end(&layout) {
                Some(end) => Ok(RepairPlan::Prefix { end }),
                None => Err("no complete movie fragment survives".to_string()),
            });
        }

        match trim_index(source, movie, &layout)? {
            Some(plan) => return Ok(Ok(plan)),
            None => debug!("index of {} yields no samples; trying the raw stream", entry.identifier),
        }
    } else {
        debug!("index of {} unusable: {:?}", entry.identifier, index);
    }

    rebuild_from_stream(source, &layout, policy)
}

fn last_fragment_end(layout: &TopLevelLayout) -> Option<u64> {
    let mut in_fragment = false;
    let mut end = None;
    for header in &layout.boxes {
        if header.kind == MOOF {
            in_fragment = true;
        } else if header.kind == MDAT && in_fragment {
            end = Some(header.end());
            in_fragment = false;
        }
    }
    end
}

fn original_ftyp(source: &mut dyn SourceStream, layout: &TopLevelLayout) -> io::Result<Vec<u8>> {
    match layout.boxes.first() {
        Some(header) if header.kind == FTYP && header.size <= 1024 => bmff::read_box(source, header),
        _ => Ok(default_ftyp()),
    }
}

/// Keeps the prefix of each track's samples that lies within the data actually present.
/// Returns `None` when the index is unusable or nothing would be kept.
fn trim_index(
    source: &mut dyn SourceStream,
    movie: &Movie,
    layout: &TopLevelLayout,
) -> io::Result<Option<RepairPlan>> {
    let limit = layout.data_limit();
    let mut tracks = Vec::new();
    let mut sources = Vec::new();
    let mut total = 0_usize;
    let mut kept_total = 0_usize;
    let mut all_within = true;

    for track in &movie.tracks {
        let samples = match track.table.samples() {
            Ok(samples) => samples,
            Err(err) => {
                debug!("track {} has an unusable sample table: {err}", track.track_id);
                return Ok(None);
            }
        };
        total += samples.len();
        all_within &= samples.iter().all(|sample| sample.end() <= layout.file_len);

        let kept = samples
            .iter()
            .take_while(|sample| sample.end() <= limit)
            .collect::<Vec<_>>();
        if kept.is_empty() {
            continue;
        }
        kept_total += kept.len();

        let mut plan = TrackPlan {
            track_id: track.track_id,
            handler: track.handler,
            media_timescale: track.media_timescale,
            language: track.language,
            width: track.width,
            height: track.height,
            volume: track.volume,
            sample_description: track.sample_description.clone(),
            samples: Vec::with_capacity(kept.len()),
        };
        let mut ranges = Vec::with_capacity(kept.len());
        for sample in kept {
            plan.push_sample(
                sample.offset,
                sample.size,
                sample.duration,
                sample.composition_offset,
                sample.sync,
            );
            ranges.push(vec![(sample.offset, sample.size as u64)]);
        }
        tracks.push(plan);
        sources.push(ranges);
    }

    if all_within && layout.is_clean() {
        return Ok(Some(RepairPlan::Verbatim));
    }
    if kept_total == 0 {
        return Ok(None);
    }

    Ok(Some(RepairPlan::Rebuild(Rebuild {
        method: RepairMethod::IndexTrim,
        ftyp: original_ftyp(source, layout)?,
        movie_timescale: if movie.timescale == 0 {
            REBUILT_MOVIE_TIMESCALE
        } else {
            movie.timescale
        },
        tracks,
        sources,
        note: format!("kept {kept_total} of {total} indexed samples"),
    })))
}

fn rebuild_from_stream(
    source: &mut dyn SourceStream,
    layout: &TopLevelLayout,
    policy: &HealthPolicy,
) -> io::Result<Result<RepairPlan, String>> {
    let ranges = layout.media_ranges();
    if ranges.is_empty() {
        return Ok(Err("no media data box survives".to_string()));
    }

    let scan = scan_length_prefixed(source, &ranges, policy.max_nal_unit_bytes)?;
    let (Some(sps), Some(pps)) = (scan.sps.as_deref(), scan.pps.as_deref()) else {
        return Ok(Err(
            "no in-band H.264 parameter sets found in the media data".to_string(),
        ));
    };
    let Some(info) = parse_sps(sps) else {
        return Ok(Err("the H.264 sequence parameter set is unreadable".to_string()));
    };
    let (Ok(width), Ok(height)) = (u16::try_from(info.width), u16::try_from(info.height)) else {
        return Ok(Err(format!(
            "implausible picture size {}x{}",
            info.width, info.height
        )));
    };

    let frames = access_units(&scan);
    if frames.is_empty() {
        return Ok(Err("no complete video frames found".to_string()));
    }

    let timescale = policy.assumed_frame_rate.saturating_mul(1000);
    let description = avc_sample_description(width, height, &decoder_config(sps, pps, &info));
    let mut plan = TrackPlan::video(1, timescale, width, height, description);
    let mut ranges = Vec::with_capacity(frames.len());
    for frame in &frames {
        let Ok(size) = u32::try_from(frame.size()) else {
            return Ok(Err("a video frame exceeds the sample size limit".to_string()));
        };
        plan.push_sample(frame.segments[0].0, size, 1000, 0, frame.sync);
        ranges.push(frame.segments.clone());
    }

    Ok(Ok(RepairPlan::Rebuild(Rebuild {
        method: RepairMethod::StreamRebuild,
        ftyp: original_ftyp(source, layout)?,
        movie_timescale: REBUILT_MOVIE_TIMESCALE,
        tracks: vec![plan],
        sources: vec![ranges],
        note: format!(
            "rebuilt {} frames of {}x{} video at {} fps{}",
            frames.len(),
            width,
            height,
            policy.assumed_frame_rate,
            if scan.skipped_bytes > 0 {
                format!(", skipped {} bytes of other data", scan.skipped_bytes)
            } else {
                String::new()
            }
        ),
    })))
}

/// Lays samples out in their original file order and writes `ftyp + mdat + moov`.
fn write_rebuild<W: Write + ?Sized>(
    source: &mut dyn SourceStream,
    writer: &mut W,
    mut rebuild: Rebuild,
) -> Result<u64, TransferError> {
    let mut order = Vec::new();
    for (track, ranges) in rebuild.sources.iter().enumerate() {
        for (sample, segments) in ranges.iter().enumerate() {
            let first = segments.first().map_or(0, |(offset, _)| *offset);
            order.push((first, track, sample));
        }
    }
    order.sort_unstable();

    let payload_len: u64 = rebuild
        .tracks
        .iter()
        .flat_map(|track| track.samples.iter())
        .map(|sample| sample.size as u64)
        .sum();
    let header = mdat_header(payload_len);

    let mut offset = (rebuild.ftyp.len() + header.len()) as u64;
    for &(_, track, sample) in &order {
        let planned = &mut rebuild.tracks[track].samples[sample];
        planned.offset = offset;
        offset += planned.size as u64;
    }
    let moov = build_moov(rebuild.movie_timescale, &rebuild.tracks);

    writer
        .write_all(&rebuild.ftyp)
        .and_then(|_| writer.write_all(&header))
        .map_err(TransferError::Destination)?;
    let mut buffer = vec![0_u8; COPY_BUFFER];
    for &(_, track, sample) in &order {
        for &(start, len) in &rebuild.sources[track][sample] {
            copy_range(source, start, len, writer, &mut buffer)?;
        }
    }
    writer.write_all(&moov).map_err(TransferError::Destination)?;

    Ok(rebuild.ftyp.len() as u64 + header.len() as u64 + payload_len + moov.len() as u64)
}
