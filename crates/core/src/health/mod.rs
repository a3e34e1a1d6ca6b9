//! Structural integrity checks.
//!
//! Each checker walks a container's framing (markers, chunks, blocks, boxes) through
//! buffered reads and seeks without decoding pixels or samples. A file is `Ok` when its
//! framing is complete, `Suspect` when it is truncated or partially inconsistent, and
//! `Corrupt` when the root structure cannot be recognized at all.

mod gif;
mod jpeg;
mod png;
mod video;

use std::io::{self, BufReader, Seek, SeekFrom};

use serde::{Deserialize, Serialize};

use crate::config::HealthPolicy;
use crate::media::{bmff, matroska, read_up_to};
use crate::model::{HealthStatus, MediaKind};
use crate::provider::SourceStream;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

const CHECKED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/gif"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaFormat {
    Jpeg,
    Png,
    Gif,
    IsoBmff,
    Matroska,
}

impl MediaFormat {
    pub fn label(&self) -> &'static str {
        match self {
            MediaFormat::Jpeg => "jpeg",
            MediaFormat::Png => "png",
            MediaFormat::Gif => "gif",
            MediaFormat::IsoBmff => "iso-bmff",
            MediaFormat::Matroska => "matroska",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnosis {
    pub status: HealthStatus,
    pub format: Option<MediaFormat>,
    pub note: Option<String>,
}

impl Diagnosis {
    pub(crate) fn ok(format: Option<MediaFormat>) -> Self {
        Self {
            status: HealthStatus::Ok,
            format,
            note: None,
        }
    }

    pub(crate) fn suspect(format: MediaFormat, note: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Suspect,
            format: Some(format),
            note: Some(note.into()),
        }
    }

    pub(crate) fn corrupt(format: Option<MediaFormat>, note: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Corrupt,
            format,
            note: Some(note.into()),
        }
    }
}

/// Identifies a container from its leading bytes.
pub fn sniff(head: &[u8]) -> Option<MediaFormat> {
    if head.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some(MediaFormat::Jpeg);
    }
    if head.starts_with(&PNG_SIGNATURE) {
        return Some(MediaFormat::Png);
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return Some(MediaFormat::Gif);
    }
    if head.starts_with(&matroska::EBML_MAGIC) {
        return Some(MediaFormat::Matroska);
    }
    if head.len() >= 8 {
        let kind = [head[4], head[5], head[6], head[7]];
        if bmff::is_known_top_level(&kind) {
            return Some(MediaFormat::IsoBmff);
        }
    }
    None
}

pub fn check(
    kind: MediaKind,
    content_type: &str,
    stream: &mut dyn SourceStream,
    policy: &HealthPolicy,
) -> io::Result<HealthStatus> {
    diagnose(kind, content_type, stream, policy).map(|diagnosis| diagnosis.status)
}

/// Checks `stream` according to its media kind. I/O failures are returned to the
/// caller rather than folded into a status.
pub fn diagnose(
    kind: MediaKind,
    content_type: &str,
    stream: &mut dyn SourceStream,
    policy: &HealthPolicy,
) -> io::Result<Diagnosis> {
    if kind == MediaKind::Other {
        return Ok(Diagnosis::ok(None));
    }

    let file_len = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(0))?;
    let mut head = [0_u8; 12];
    let read = read_up_to(stream, &mut head)?;
    stream.seek(SeekFrom::Start(0))?;
    let format = sniff(&head[..read]);

    match kind {
        MediaKind::Image => diagnose_image(content_type, format, stream, policy),
        MediaKind::Video => match format {
            Some(MediaFormat::Matroska) => video::check_matroska(stream, file_len),
            _ => video::check_iso_bmff(stream, file_len, policy),
        },
        MediaKind::Other => Ok(Diagnosis::ok(None)),
    }
}

fn diagnose_image(
    content_type: &str,
    format: Option<MediaFormat>,
    stream: &mut dyn SourceStream,
    policy: &HealthPolicy,
) -> io::Result<Diagnosis> {
    let mut reader = BufReader::new(stream);
    match format {
        Some(MediaFormat::Jpeg) => jpeg::check(&mut reader),
        Some(MediaFormat::Png) => png::check(&mut reader, policy.verify_png_crc),
        Some(MediaFormat::Gif) => gif::check(&mut reader),
        _ if CHECKED_IMAGE_TYPES.contains(&content_type) => Ok(Diagnosis::corrupt(
            format,
            format!("no {content_type} signature found"),
        )),
        _ => Ok(Diagnosis::ok(format)),
    }
}
