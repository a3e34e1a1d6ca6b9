use std::io::{self, BufRead};

use super::{Diagnosis, MediaFormat};
use crate::media::{be_u16, next_byte, read_array, skip_bytes};

const SOI: u8 = 0xd8;
const EOI: u8 = 0xd9;
const SOS: u8 = 0xda;

fn is_standalone(marker: u8) -> bool {
    matches!(marker, 0x01 | 0xd0..=0xd7)
}

fn suspect(note: impl Into<String>) -> Diagnosis {
    Diagnosis::suspect(MediaFormat::Jpeg, note)
}

/// Walks marker segments from SOI to EOI, skipping entropy-coded scan data.
pub(super) fn check<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Diagnosis> {
    match read_array::<2, _>(reader)? {
        Some([0xff, SOI]) => {}
        _ => return Ok(Diagnosis::corrupt(Some(MediaFormat::Jpeg), "missing SOI marker")),
    }

    let mut pending = None;
    loop {
        let marker = match pending.take() {
            Some(marker) => marker,
            None => match read_marker(reader)? {
                Ok(marker) => marker,
                Err(note) => return Ok(suspect(note)),
            },
        };

        if marker == EOI {
            return Ok(Diagnosis::ok(Some(MediaFormat::Jpeg)));
        }
        if is_standalone(marker) {
            continue;
        }

        let Some(length) = read_array::<2, _>(reader)? else {
            return Ok(suspect(format!("segment 0x{marker:02X} header truncated")));
        };
        let length = be_u16(&length) as u64;
        if length < 2 {
            return Ok(suspect(format!(
                "segment 0x{marker:02X} declares invalid length {length}"
            )));
        }
        if skip_bytes(reader, length - 2)? < length - 2 {
            return Ok(suspect(format!(
                "segment 0x{marker:02X} overruns the end of the file"
            )));
        }

        if marker == SOS {
            match scan_entropy(reader)? {
                Some(next) => pending = Some(next),
                None => return Ok(suspect("scan data ends before EOI")),
            }
        }
    }
}

/// Reads `FF xx`, tolerating fill bytes. The error carries a note for a malformed stream.
fn read_marker<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Result<u8, String>> {
    match next_byte(reader)? {
        None => return Ok(Err("file ends before EOI".to_string())),
        Some(0xff) => {}
        Some(other) => {
            return Ok(Err(format!(
                "expected a marker, found byte 0x{other:02X}"
            )))
        }
    }
    loop {
        match next_byte(reader)? {
            None => return Ok(Err("file ends inside a marker".to_string())),
            Some(0xff) => continue,
            Some(marker) => return Ok(Ok(marker)),
        }
    }
}

/// Consumes entropy-coded data and returns the next real marker, if any.
fn scan_entropy<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Option<u8>> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }
        let Some(index) = buf.iter().position(|byte| *byte == 0xff) else {
            let len = buf.len();
            reader.consume(len);
            continue;
        };
        reader.consume(index + 1);

        let mut next = next_byte(reader)?;
        while next == Some(0xff) {
            next = next_byte(reader)?;
        }
        match next {
            None => return Ok(None),
            Some(0x00) | Some(0xd0..=0xd7) => continue,
            Some(marker) => return Ok(Some(marker)),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// SOI, an APP0 segment, a tiny scan with stuffed bytes and restart markers, EOI.
    pub fn jpeg() -> Vec<u8> {
        let mut file = vec![0xff, 0xd8];
        file.extend_from_slice(&[0xff, 0xe0, 0x00, 0x10]);
        file.extend_from_slice(b"JFIF\0\x01\x01\0\0\x01\0\x01\0\0");
        file.extend_from_slice(&[0xff, 0xdb, 0x00, 0x04, 0x00, 0x01]);
        file.extend_from_slice(&[0xff, 0xda, 0x00, 0x08, 1, 1, 0, 0, 0x3f, 0]);
        file.extend_from_slice(&[0x12, 0xff, 0x00, 0x34, 0xff, 0xd0, 0x56, 0x78]);
        file.extend_from_slice(&[0xff, 0xd9]);
        file
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor};

    use super::check;
    use super::fixtures::jpeg;
    use crate::model::HealthStatus;

    fn status(bytes: &[u8]) -> HealthStatus {
        check(&mut BufReader::new(Cursor::new(bytes)))
            .expect("check")
            .status
    }

    #[test]
    fn complete_file_is_ok() {
        assert_eq!(status(&jpeg()), HealthStatus::Ok);
    }

    #[test]
    fn trailing_bytes_after_eoi_are_ignored() {
        let mut file = jpeg();
        file.extend_from_slice(&[0; 32]);
        assert_eq!(status(&file), HealthStatus::Ok);
    }

    #[test]
    fn truncation_anywhere_is_suspect() {
        let file = jpeg();
        for cut in 3..file.len() - 1 {
            assert_eq!(status(&file[..cut]), HealthStatus::Suspect, "cut at {cut}");
        }
    }

    #[test]
    fn overrunning_segment_is_suspect() {
        let file = [0xff, 0xd8, 0xff, 0xe1, 0x40, 0x00, 1, 2, 3];
        let diagnosis = check(&mut BufReader::new(Cursor::new(&file[..]))).expect("check");
        assert_eq!(diagnosis.status, HealthStatus::Suspect);
        assert!(diagnosis.note.expect("note").contains("overruns"));
    }

    #[test]
    fn zero_length_segment_is_suspect() {
        let file = [0xff, 0xd8, 0xff, 0xe0, 0x00, 0x01, 0xff, 0xd9];
        assert_eq!(status(&file), HealthStatus::Suspect);
    }
}
