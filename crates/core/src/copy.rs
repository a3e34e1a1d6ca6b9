use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::{debug, info, warn};

use crate::config::CopyOptions;
use crate::model::{CopyResult, Entry, EntryResult, FailureReason, Handle};
use crate::provider::{unique_child_name, PendingWrite, SourceStream, StorageProvider};

/// Where a transfer broke. Source and destination failures map to different outcomes.
#[derive(Debug)]
pub(crate) enum TransferError {
    Source(io::Error),
    Destination(io::Error),
}

impl TransferError {
    pub(crate) fn into_result(self, entry: &Entry) -> EntryResult {
        match self {
            TransferError::Source(err) => EntryResult::failure(
                entry,
                FailureReason::EntryUnreadable,
                format!("read failed: {err}"),
            ),
            TransferError::Destination(err) => EntryResult::failure(
                entry,
                FailureReason::DestinationWrite,
                format!("write failed: {err}"),
            ),
        }
    }
}

/// Streams `reader` to `writer` in `chunk_size` pieces, feeding the digest.
pub(crate) fn stream_copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    hasher: &mut blake3::Hasher,
) -> Result<u64, TransferError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0_u8; chunk_size.max(1)];
    let mut copied = 0_u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransferError::Source(err)),
        };
        hasher.update(&buffer[..read]);
        writer
            .write_all(&buffer[..read])
            .map_err(TransferError::Destination)?;
        copied += read as u64;
    }
    Ok(copied)
}

/// Copies exactly `len` bytes starting at `offset`; a short source is a read failure.
pub(crate) fn copy_range<W: Write + ?Sized>(
    reader: &mut dyn SourceStream,
    offset: u64,
    len: u64,
    writer: &mut W,
    buffer: &mut [u8],
) -> Result<(), TransferError> {
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(TransferError::Source)?;
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let read = match reader.read(&mut buffer[..want]) {
            Ok(0) => {
                return Err(TransferError::Source(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended {remaining} bytes early at offset {}", offset + len - remaining),
                )))
            }
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransferError::Source(err)),
        };
        writer
            .write_all(&buffer[..read])
            .map_err(TransferError::Destination)?;
        remaining -= read as u64;
    }
    Ok(())
}

pub(crate) fn discard(pending: Box<dyn PendingWrite>, entry: &Entry) {
    if let Err(err) = pending.abort() {
        warn!("failed to discard staged output for {}: {}", entry.identifier, err);
    }
}

fn digest_of(provider: &dyn StorageProvider, handle: &Handle, chunk_size: usize) -> io::Result<blake3::Hash> {
    let mut stream = provider
        .open_read(handle)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
    let mut hasher = blake3::Hasher::new();
    stream_copy(&mut stream, &mut io::sink(), chunk_size, &mut hasher).map_err(|err| match err {
        TransferError::Source(err) | TransferError::Destination(err) => err,
    })?;
    Ok(hasher.finalize())
}

/// Copies one entry into `destination` under a collision-free name.
///
/// The output is staged and only committed once the byte count matches the
/// source length; a failed copy leaves nothing behind in the destination.
pub fn copy_entry(
    provider: &dyn StorageProvider,
    entry: &Entry,
    destination: &Handle,
    options: &CopyOptions,
) -> CopyResult {
    let name = unique_child_name(provider, destination, &entry.name);
    copy_as(provider, entry, destination, &name, options)
}

pub(crate) fn copy_as(
    provider: &dyn StorageProvider,
    entry: &Entry,
    destination: &Handle,
    name: &str,
    options: &CopyOptions,
) -> CopyResult {
    let mut source = match provider.open_read(&entry.identifier) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("cannot open {}: {}", entry.identifier, err);
            return EntryResult::failure(entry, FailureReason::EntryUnreadable, err.to_string());
        }
    };
    let mut pending = match provider.open_write(destination, name) {
        Ok(pending) => pending,
        Err(err) => {
            warn!("cannot stage {name} in {destination}: {err}");
            return EntryResult::failure(entry, FailureReason::DestinationWrite, err.to_string());
        }
    };

    let mut hasher = blake3::Hasher::new();
    let written = match stream_copy(&mut source, &mut pending, options.chunk_size, &mut hasher) {
        Ok(written) => written,
        Err(err) => {
            warn!("copy of {} failed: {:?}", entry.identifier, err);
            discard(pending, entry);
            return err.into_result(entry);
        }
    };
    if let Err(err) = pending.flush() {
        discard(pending, entry);
        return TransferError::Destination(err).into_result(entry);
    }

    let expected = provider.length(&entry.identifier).or(entry.size);
    if let Some(expected) = expected {
        if expected != written {
            warn!(
                "size mismatch for {}: expected {expected}, copied {written}",
                entry.identifier
            );
            discard(pending, entry);
            return EntryResult::failure(
                entry,
                FailureReason::SizeMismatch,
                format!("expected {expected} bytes, copied {written}"),
            );
        }
    }

    let committed = match pending.commit() {
        Ok(handle) => handle,
        Err(err) => {
            warn!("commit of {name} failed: {err}");
            return EntryResult::failure(entry, FailureReason::DestinationWrite, err.to_string());
        }
    };

    let digest = hasher.finalize();
    if options.verify_digest {
        let verified = digest_of(provider, &committed, options.chunk_size);
        if !matches!(&verified, Ok(copy) if *copy == digest) {
            warn!("verification of {committed} failed: {:?}", verified.err());
            if let Err(err) = provider.delete(&committed) {
                warn!("failed to remove unverified copy {committed}: {err}");
            }
            return EntryResult::failure(
                entry,
                FailureReason::ChecksumMismatch,
                format!("{committed} does not match the source digest"),
            );
        }
        debug!("verified {committed} ({})", digest.to_hex());
    }

    info!("copied {} -> {} ({written} bytes)", entry.identifier, committed);
    EntryResult::success(entry, committed, written)
}

#[cfg(test)]
mod tests {
    use super::copy_entry;
    use crate::config::CopyOptions;
    use crate::model::{Entry, FailureReason, Handle, HealthStatus, MediaKind};
    use crate::provider::MemoryProvider;

    fn entry(path: &str, size: u64) -> Entry {
        Entry {
            identifier: Handle::new(path),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            size: Some(size),
            declared_type: String::new(),
            content_type: "image/jpeg".to_string(),
            kind: MediaKind::Image,
            status: HealthStatus::Ok,
            health_note: None,
        }
    }

    fn setup(bytes: Vec<u8>) -> MemoryProvider {
        let provider = MemoryProvider::new();
        provider.add_dir("/out");
        provider.add_file("/card/IMG_0001.JPG", bytes);
        provider
    }

    #[test]
    fn copies_bytes_exactly_in_small_chunks() {
        let data = (0..10_000).map(|i| (i % 253) as u8).collect::<Vec<_>>();
        let provider = setup(data.clone());
        let options = CopyOptions {
            chunk_size: 7,
            verify_digest: true,
        };
        let result = copy_entry(
            &provider,
            &entry("/card/IMG_0001.JPG", 10_000),
            &Handle::new("/out"),
            &options,
        );

        assert!(result.succeeded, "{:?}", result.detail);
        assert_eq!(result.bytes_written, 10_000);
        assert_eq!(provider.read("/out/IMG_0001.JPG"), Some(data));
    }

    #[test]
    fn collisions_get_numbered_names() {
        let provider = setup(vec![1; 10]);
        provider.add_file("/out/IMG_0001.JPG", vec![9; 3]);
        let result = copy_entry(
            &provider,
            &entry("/card/IMG_0001.JPG", 10),
            &Handle::new("/out"),
            &CopyOptions::default(),
        );

        assert_eq!(
            result.destination,
            Some(Handle::new("/out/IMG_0001 (1).JPG"))
        );
        assert_eq!(provider.read("/out/IMG_0001.JPG"), Some(vec![9; 3]));
    }

    #[test]
    fn mid_stream_read_failure_leaves_nothing_behind() {
        let provider = setup(vec![5; 4096]);
        provider.fail_reads_after("/card/IMG_0001.JPG", 1000);
        let options = CopyOptions {
            chunk_size: 256,
            verify_digest: false,
        };
        let result = copy_entry(
            &provider,
            &entry("/card/IMG_0001.JPG", 4096),
            &Handle::new("/out"),
            &options,
        );

        assert!(!result.succeeded);
        assert_eq!(result.failure, Some(FailureReason::EntryUnreadable));
        assert!(provider.child_names("/out").is_empty());
    }

    #[test]
    fn short_source_is_a_size_mismatch() {
        let provider = setup(vec![5; 100]);
        provider.set_reported_length("/card/IMG_0001.JPG", Some(150));
        let result = copy_entry(
            &provider,
            &entry("/card/IMG_0001.JPG", 150),
            &Handle::new("/out"),
            &CopyOptions::default(),
        );

        assert_eq!(result.failure, Some(FailureReason::SizeMismatch));
        assert!(provider.child_names("/out").is_empty());
    }

    #[test]
    fn unknown_length_falls_back_to_scan_size() {
        let provider = setup(vec![5; 100]);
        provider.set_reported_length("/card/IMG_0001.JPG", None);
        let result = copy_entry(
            &provider,
            &entry("/card/IMG_0001.JPG", 100),
            &Handle::new("/out"),
            &CopyOptions::default(),
        );
        assert!(result.succeeded);
    }

    #[test]
    fn missing_source_is_unreadable() {
        let provider = setup(vec![]);
        let result = copy_entry(
            &provider,
            &entry("/card/gone.jpg", 1),
            &Handle::new("/out"),
            &CopyOptions::default(),
        );
        assert_eq!(result.failure, Some(FailureReason::EntryUnreadable));
    }
}
