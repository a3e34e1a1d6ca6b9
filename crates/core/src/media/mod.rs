//! Container and bitstream plumbing shared by the health checker and the remuxer.

pub mod avc;
pub mod bmff;
pub mod matroska;
pub mod mux;

use std::io::{self, BufRead, ErrorKind, Read};

/// Reads until `buf` is full or the stream ends, returning the number of bytes read.
pub(crate) fn read_up_to<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Reads exactly `N` bytes, or `None` when the stream ends first.
pub(crate) fn read_array<const N: usize, R: Read + ?Sized>(
    reader: &mut R,
) -> io::Result<Option<[u8; N]>> {
    let mut buf = [0_u8; N];
    let read = read_up_to(reader, &mut buf)?;
    Ok((read == N).then_some(buf))
}

/// Discards `count` bytes, returning how many were actually available.
pub(crate) fn skip_bytes<R: Read + ?Sized>(reader: &mut R, count: u64) -> io::Result<u64> {
    io::copy(&mut reader.take(count), &mut io::sink())
}

pub(crate) fn next_byte<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Option<u8>> {
    let byte = match reader.fill_buf()? {
        [] => return Ok(None),
        [first, ..] => *first,
    };
    reader.consume(1);
    Ok(Some(byte))
}

pub(crate) fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

pub(crate) fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub(crate) fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor};

    use super::{next_byte, read_array, read_up_to, skip_bytes};

    #[test]
    fn short_reads_are_reported_not_errors() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buf = [0_u8; 8];
        assert_eq!(read_up_to(&mut cursor, &mut buf).expect("read"), 3);

        let mut cursor = Cursor::new(vec![1, 2, 3]);
        assert_eq!(read_array::<2, _>(&mut cursor).expect("read"), Some([1, 2]));
        assert_eq!(read_array::<2, _>(&mut cursor).expect("read"), None);
    }

    #[test]
    fn skip_reports_available_bytes() {
        let mut cursor = Cursor::new(vec![0_u8; 10]);
        assert_eq!(skip_bytes(&mut cursor, 4).expect("skip"), 4);
        assert_eq!(skip_bytes(&mut cursor, 100).expect("skip"), 6);
    }

    #[test]
    fn next_byte_walks_a_buffered_stream() {
        let mut reader = BufReader::new(Cursor::new(vec![9, 8]));
        assert_eq!(next_byte(&mut reader).expect("byte"), Some(9));
        assert_eq!(next_byte(&mut reader).expect("byte"), Some(8));
        assert_eq!(next_byte(&mut reader).expect("byte"), None);
    }
}
