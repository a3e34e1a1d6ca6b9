use std::io::{self, SeekFrom};

use tracing::debug;

use super::{Diagnosis, MediaFormat};
use crate::config::HealthPolicy;
use crate::media::bmff::{self, IndexError, IndexState, MOOF};
use crate::media::matroska::{self, SegmentCheck};
use crate::provider::SourceStream;

pub(super) fn check_iso_bmff(
    stream: &mut dyn SourceStream,
    file_len: u64,
    policy: &HealthPolicy,
) -> io::Result<Diagnosis> {
    let layout = bmff::scan_top_level(stream, file_len)?;
    if !layout.is_recognizable() {
        return Ok(Diagnosis::corrupt(
            None,
            "no recognizable container structure at the start of the file",
        ));
    }
    let suspect = |note: String| Diagnosis::suspect(MediaFormat::IsoBmff, note);

    let movie = match bmff::load_index(
        stream,
        &layout,
        policy.max_index_bytes,
        policy.max_box_depth,
    )? {
        IndexState::Parsed(movie) => movie,
        IndexState::Missing => return Ok(suspect("movie index (moov) is missing".to_string())),
        IndexState::Truncated => {
            return Ok(suspect("movie index (moov) is truncated".to_string()))
        }
        IndexState::TooLarge(size) => {
            return Ok(suspect(format!(
                "movie index of {size} bytes exceeds the inspection limit"
            )))
        }
        IndexState::Unreadable(err) => {
            return Ok(suspect(format!("movie index is unreadable: {err}")))
        }
    };

    if movie.fragmented || layout.has(MOOF) {
        if let Some(header) = layout.truncated {
            return Ok(suspect(format!(
                "fragment box '{}' at offset {} is truncated",
                bmff::fourcc_str(&header.kind),
                header.offset
            )));
        }
        if let Some(offset) = layout.garbage_at {
            return Ok(suspect(format!("unparseable data at offset {offset}")));
        }
        return Ok(Diagnosis::ok(Some(MediaFormat::IsoBmff)));
    }

    match movie.referenced_end() {
        Ok(Some(end)) if end > file_len => {
            return Ok(Diagnosis::corrupt(
                Some(MediaFormat::IsoBmff),
                format!("samples reference bytes up to {end} but the file ends at {file_len}"),
            ))
        }
        Ok(_) => {}
        Err(err @ IndexError::OffsetOverflow { .. }) => {
            return Ok(Diagnosis::corrupt(Some(MediaFormat::IsoBmff), err.to_string()))
        }
        Err(err) => return Ok(suspect(format!("sample table is inconsistent: {err}"))),
    }

    if !layout.is_clean() {
        debug!("layout has trailing damage: {:?}", layout.truncated);
        return Ok(suspect(
            "boxes after the referenced media are truncated or unparseable".to_string(),
        ));
    }
    Ok(Diagnosis::ok(Some(MediaFormat::IsoBmff)))
}

pub(super) fn check_matroska(stream: &mut dyn SourceStream, file_len: u64) -> io::Result<Diagnosis> {
    stream.seek(SeekFrom::Start(0))?;
    let suspect = |note: String| Diagnosis::suspect(MediaFormat::Matroska, note);
    Ok(match matroska::check_segment(stream, file_len)? {
        SegmentCheck::Complete | SegmentCheck::UnknownSize => {
            Diagnosis::ok(Some(MediaFormat::Matroska))
        }
        SegmentCheck::Overruns {
            declared_end,
            file_len,
        } => suspect(format!(
            "segment declares {declared_end} bytes but the file ends at {file_len}"
        )),
        SegmentCheck::Truncated(element) => suspect(format!("{element} element is truncated")),
        SegmentCheck::MissingSegment => suspect("segment element is missing".to_string()),
        SegmentCheck::NotMatroska => {
            Diagnosis::corrupt(None, "missing EBML signature".to_string())
        }
    })
}
