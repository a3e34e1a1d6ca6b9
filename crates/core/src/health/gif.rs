use std::io::{self, BufRead};

use super::{Diagnosis, MediaFormat};
use crate::media::{next_byte, read_array, skip_bytes};

const EXTENSION: u8 = 0x21;
const IMAGE: u8 = 0x2c;
const TRAILER: u8 = 0x3b;

fn suspect(note: impl Into<String>) -> Diagnosis {
    Diagnosis::suspect(MediaFormat::Gif, note)
}

fn colour_table_len(packed: u8) -> u64 {
    if packed & 0x80 == 0 {
        0
    } else {
        3 * (1 << ((packed & 0x07) + 1))
    }
}

/// Walks header, screen descriptor, blocks and sub-block chains up to the trailer.
pub(super) fn check<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Diagnosis> {
    match read_array::<6, _>(reader)? {
        Some(header) if &header == b"GIF87a" || &header == b"GIF89a" => {}
        _ => return Ok(Diagnosis::corrupt(Some(MediaFormat::Gif), "missing GIF header")),
    }

    let Some(screen) = read_array::<7, _>(reader)? else {
        return Ok(suspect("logical screen descriptor truncated"));
    };
    let global_table = colour_table_len(screen[4]);
    if skip_bytes(reader, global_table)? < global_table {
        return Ok(suspect("global colour table truncated"));
    }

    let mut frames = 0_u64;
    loop {
        match next_byte(reader)? {
            None => return Ok(suspect(format!("file ends after {frames} frame(s) without a trailer"))),
            Some(TRAILER) => return Ok(Diagnosis::ok(Some(MediaFormat::Gif))),
            Some(EXTENSION) => {
                if next_byte(reader)?.is_none() {
                    return Ok(suspect("extension label truncated"));
                }
                if !skip_sub_blocks(reader)? {
                    return Ok(suspect("extension data truncated"));
                }
            }
            Some(IMAGE) => {
                let Some(descriptor) = read_array::<9, _>(reader)? else {
                    return Ok(suspect("image descriptor truncated"));
                };
                let local_table = colour_table_len(descriptor[8]);
                if skip_bytes(reader, local_table)? < local_table {
                    return Ok(suspect("local colour table truncated"));
                }
                if next_byte(reader)?.is_none() {
                    return Ok(suspect("image data truncated"));
                }
                if !skip_sub_blocks(reader)? {
                    return Ok(suspect("image data truncated"));
                }
                frames += 1;
            }
            Some(other) => {
                return Ok(suspect(format!("unknown block introducer 0x{other:02X}")))
            }
        }
    }
}

/// Skips a chain of length-prefixed sub-blocks; `false` when the chain is cut short.
fn skip_sub_blocks<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<bool> {
    loop {
        match next_byte(reader)? {
            None => return Ok(false),
            Some(0) => return Ok(true),
            Some(len) => {
                if skip_bytes(reader, len as u64)? < len as u64 {
                    return Ok(false);
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor};

    use super::check;
    use super::fixtures::gif;
    use crate::model::HealthStatus;

    fn status(bytes: &[u8]) -> HealthStatus {
        check(&mut BufReader::new(Cursor::new(bytes)))
            .expect("check")
            .status
    }

    #[test]
    fn complete_file_is_ok() {
        assert_eq!(status(&gif()), HealthStatus::Ok);
    }

    #[test]
    fn missing_trailer_is_suspect() {
        let file = gif();
        for cut in 6..file.len() {
            assert_eq!(status(&file[..cut]), HealthStatus::Suspect, "cut at {cut}");
        }
    }

    #[test]
    fn unknown_block_is_suspect() {
        let mut file = gif();
        let trailer = file.len() - 1;
        file[trailer] = 0x99;
        let diagnosis = check(&mut BufReader::new(Cursor::new(&file))).expect("check");
        assert_eq!(diagnosis.status, HealthStatus::Suspect);
        assert!(diagnosis.note.expect("note").contains("0x99"));
    }
}
