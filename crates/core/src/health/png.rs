use std::io::{self, BufRead};

use super::{Diagnosis, MediaFormat, PNG_SIGNATURE};
use crate::media::{be_u32, read_array, read_up_to, skip_bytes};

const IHDR_LEN: u32 = 13;
const MAX_CHUNK_LEN: u32 = 0x7fff_ffff;

fn suspect(note: impl Into<String>) -> Diagnosis {
    Diagnosis::suspect(MediaFormat::Png, note)
}

fn corrupt(note: impl Into<String>) -> Diagnosis {
    Diagnosis::corrupt(Some(MediaFormat::Png), note)
}

enum Chunk {
    Complete { kind: [u8; 4], data: Option<Vec<u8>> },
    Problem(Diagnosis),
}

/// Walks chunks from the signature to IEND. `verify_crc` recomputes every chunk CRC.
pub(super) fn check<R: BufRead + ?Sized>(reader: &mut R, verify_crc: bool) -> io::Result<Diagnosis> {
    match read_array::<8, _>(reader)? {
        Some(signature) if signature == PNG_SIGNATURE => {}
        _ => return Ok(corrupt("missing PNG signature")),
    }

    let ihdr = match read_chunk(reader, verify_crc, true)? {
        Chunk::Complete { data, .. } => data,
        Chunk::Problem(diagnosis) => return Ok(diagnosis),
    };
    if let Some(note) = ihdr.as_deref().and_then(validate_header) {
        return Ok(corrupt(note));
    }

    loop {
        match read_chunk(reader, verify_crc, false)? {
            Chunk::Complete { kind, .. } if &kind == b"IEND" => {
                return Ok(Diagnosis::ok(Some(MediaFormat::Png)))
            }
            Chunk::Complete { .. } => continue,
            Chunk::Problem(diagnosis) => return Ok(diagnosis),
        }
    }
}

fn read_chunk<R: BufRead + ?Sized>(
    reader: &mut R,
    verify_crc: bool,
    is_header: bool,
) -> io::Result<Chunk> {
    let Some(head) = read_array::<8, _>(reader)? else {
        return Ok(Chunk::Problem(suspect("file ends before IEND")));
    };
    let len = be_u32(&head[0..4]);
    let kind = [head[4], head[5], head[6], head[7]];

    if !kind.iter().all(u8::is_ascii_alphabetic) {
        return Ok(Chunk::Problem(if is_header {
            corrupt("first chunk type is not valid")
        } else {
            suspect(format!("invalid chunk type {:02X?}", kind))
        }));
    }
    if is_header && (&kind != b"IHDR" || len != IHDR_LEN) {
        return Ok(Chunk::Problem(corrupt(format!(
            "first chunk must be a {IHDR_LEN}-byte IHDR"
        ))));
    }
    if len > MAX_CHUNK_LEN {
        return Ok(Chunk::Problem(suspect(format!(
            "chunk {} declares impossible length {len}",
            String::from_utf8_lossy(&kind)
        ))));
    }

    let name = String::from_utf8_lossy(&kind).to_string();
    if !verify_crc && !is_header {
        if skip_bytes(reader, len as u64 + 4)? < len as u64 + 4 {
            return Ok(Chunk::Problem(suspect(format!("chunk {name} is truncated"))));
        }
        return Ok(Chunk::Complete { kind, data: None });
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&kind);
    let mut kept = is_header.then(Vec::new);
    let mut remaining = len as usize;
    let mut buf = [0_u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len());
        let read = read_up_to(reader, &mut buf[..want])?;
        hasher.update(&buf[..read]);
        if let Some(kept) = kept.as_mut() {
            kept.extend_from_slice(&buf[..read]);
        }
        if read < want {
            return Ok(Chunk::Problem(suspect(format!("chunk {name} is truncated"))));
        }
        remaining -= read;
    }

    let Some(stored) = read_array::<4, _>(reader)? else {
        return Ok(Chunk::Problem(suspect(format!("chunk {name} is missing its CRC"))));
    };
    if verify_crc && be_u32(&stored) != hasher.finalize() {
        return Ok(Chunk::Problem(suspect(format!("chunk {name} fails its CRC"))));
    }
    Ok(Chunk::Complete { kind, data: kept })
}

fn validate_header(ihdr: &[u8]) -> Option<String> {
    let width = be_u32(&ihdr[0..4]);
    let height = be_u32(&ihdr[4..8]);
    let bit_depth = ihdr[8];
    let colour_type = ihdr[9];

    if width == 0 || height == 0 {
        return Some(format!("IHDR declares empty image {width}x{height}"));
    }
    let depth_ok = match colour_type {
        0 => matches!(bit_depth, 1 | 2 | 4 | 8 | 16),
        3 => matches!(bit_depth, 1 | 2 | 4 | 8),
        2 | 4 | 6 => matches!(bit_depth, 8 | 16),
        _ => return Some(format!("IHDR declares unknown colour type {colour_type}")),
    };
    if !depth_ok {
        return Some(format!(
            "bit depth {bit_depth} is invalid for colour type {colour_type}"
        ));
    }
    if ihdr[10] != 0 || ihdr[11] != 0 || ihdr[12] > 1 {
        return Some("IHDR declares unknown compression, filter or interlace method".to_string());
    }
    None
}


#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor};

    use super::check;
    use super::fixtures::{chunk, ihdr, png};
    use crate::health::PNG_SIGNATURE;
    use crate::model::HealthStatus;

    fn status(bytes: &[u8], verify_crc: bool) -> HealthStatus {
        check(&mut BufReader::new(Cursor::new(bytes)), verify_crc)
            .expect("check")
            .status
    }

    #[test]
    fn complete_file_is_ok() {
        assert_eq!(status(&png(), true), HealthStatus::Ok);
        assert_eq!(status(&png(), false), HealthStatus::Ok);
    }

    #[test]
    fn truncated_file_is_suspect() {
        let file = png();
        assert_eq!(status(&file[..file.len() - 6], true), HealthStatus::Suspect);
        assert_eq!(status(&file[..40], false), HealthStatus::Suspect);
    }

    #[test]
    fn crc_mismatch_is_suspect_only_when_verified() {
        let mut file = png();
        let idat_data = PNG_SIGNATURE.len() + 25 + 8;
        file[idat_data] ^= 0x01;
        assert_eq!(status(&file, true), HealthStatus::Suspect);
        assert_eq!(status(&file, false), HealthStatus::Ok);
    }

    #[test]
    fn bad_header_is_corrupt() {
        let mut file = PNG_SIGNATURE.to_vec();
        file.extend(ihdr(0, 10, 8, 6));
        file.extend(chunk(b"IEND", &[]));
        assert_eq!(status(&file, true), HealthStatus::Corrupt);

        let mut file = PNG_SIGNATURE.to_vec();
        file.extend(ihdr(4, 4, 16, 3));
        assert_eq!(status(&file, false), HealthStatus::Corrupt);

        let mut file = PNG_SIGNATURE.to_vec();
        file.extend(chunk(b"IDAT", &[1, 2, 3]));
        assert_eq!(status(&file, true), HealthStatus::Corrupt);
    }
}
