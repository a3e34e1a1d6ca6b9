use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::{handle_from_path, ChildEntry, NodeId, PendingWrite, SourceStream, StorageProvider};
use crate::error::ProviderError;
use crate::model::Handle;

pub const STAGING_SUFFIX: &str = ".partial";

#[derive(Debug, Default, Clone)]
pub struct LocalFsProvider;

impl LocalFsProvider {
    pub fn new() -> Self {
        Self
    }
}

fn path_of(handle: &Handle) -> &Path {
    Path::new(handle.as_str())
}

impl StorageProvider for LocalFsProvider {
    fn list_children(&self, dir: &Handle) -> Result<Vec<ChildEntry>, ProviderError> {
        let root = path_of(dir);
        let metadata = fs::metadata(root).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ProviderError::NotFound(dir.clone()),
            _ => ProviderError::io(dir, err),
        })?;
        if !metadata.is_dir() {
            return Err(ProviderError::NotADirectory(dir.clone()));
        }

        let mut children = Vec::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name();
        for item in walker {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    if err.depth() == 0 {
                        let source = err
                            .into_io_error()
                            .unwrap_or_else(|| io::Error::new(ErrorKind::Other, "walk failed"));
                        return Err(ProviderError::io(dir, source));
                    }
                    warn!("skipping unreadable child of {}: {}", root.display(), err);
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_symlink() {
                debug!("not following symlink {}", entry.path().display());
                continue;
            }
            if !file_type.is_dir() && !file_type.is_file() {
                continue;
            }

            children.push(ChildEntry {
                handle: handle_from_path(entry.path()),
                name: entry.file_name().to_string_lossy().to_string(),
                is_directory: file_type.is_dir(),
            });
        }
        Ok(children)
    }

    fn open_read(&self, handle: &Handle) -> Result<Box<dyn SourceStream>, ProviderError> {
        let file = File::open(path_of(handle)).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ProviderError::NotFound(handle.clone()),
            _ => ProviderError::io(handle, err),
        })?;
        Ok(Box::new(file))
    }

    fn open_write(
        &self,
        container: &Handle,
        name: &str,
    ) -> Result<Box<dyn PendingWrite>, ProviderError> {
        let dir = path_of(container);
        if !dir.is_dir() {
            return Err(ProviderError::NotADirectory(container.clone()));
        }

        let staging = dir.join(format!(".{name}.{}{STAGING_SUFFIX}", Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .map_err(|err| match err.kind() {
                ErrorKind::PermissionDenied => ProviderError::ReadOnly(container.clone()),
                _ => ProviderError::io(container, err),
            })?;

        Ok(Box::new(LocalPendingWrite {
            writer: Some(BufWriter::new(file)),
            staging,
            target: dir.join(name),
            finished: false,
        }))
    }

    fn length(&self, handle: &Handle) -> Option<u64> {
        fs::metadata(path_of(handle))
            .ok()
            .filter(|metadata| metadata.is_file())
            .map(|metadata| metadata.len())
    }

    fn delete(&self, handle: &Handle) -> Result<(), ProviderError> {
        fs::remove_file(path_of(handle)).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ProviderError::NotFound(handle.clone()),
            _ => ProviderError::io(handle, err),
        })
    }

    fn child_exists(&self, container: &Handle, name: &str) -> bool {
        fs::symlink_metadata(path_of(container).join(name)).is_ok()
    }

    fn is_writable_container(&self, handle: &Handle) -> bool {
        let dir = path_of(handle);
        if !dir.is_dir() {
            return false;
        }
        let probe = dir.join(format!(".recovereasy-probe-{}", Uuid::new_v4().simple()));
        match OpenOptions::new().write(true).create_new(true).open(&probe) {
            Ok(file) => {
                drop(file);
                let _ = fs::remove_file(&probe);
                true
            }
            Err(err) => {
                debug!("destination {} rejected probe write: {}", dir.display(), err);
                false
            }
        }
    }

    #[cfg(unix)]
    fn node_id(&self, handle: &Handle) -> Option<NodeId> {
        use std::os::unix::fs::MetadataExt;

        fs::metadata(path_of(handle)).ok().map(|metadata| NodeId {
            device: metadata.dev(),
            inode: metadata.ino(),
        })
    }
}

struct LocalPendingWrite {
    writer: Option<BufWriter<File>>,
    staging: PathBuf,
    target: PathBuf,
    finished: bool,
}

impl LocalPendingWrite {
    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "write after commit"))
    }

    fn discard(&mut self) -> io::Result<()> {
        self.finished = true;
        self.writer.take();
        match fs::remove_file(&self.staging) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn publish(&mut self) -> io::Result<()> {
        match fs::hard_link(&self.staging, &self.target) {
            Ok(()) => {
                let _ = fs::remove_file(&self.staging);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(err),
            Err(err) => {
                // FAT/exFAT media have no hard links.
                debug!("hard link unavailable ({}), falling back to rename", err);
                if fs::symlink_metadata(&self.target).is_ok() {
                    return Err(io::Error::new(ErrorKind::AlreadyExists, "target exists"));
                }
                fs::rename(&self.staging, &self.target)
            }
        }
    }
}

impl Write for LocalPendingWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl PendingWrite for LocalPendingWrite {
    fn commit(mut self: Box<Self>) -> Result<Handle, ProviderError> {
        let target = handle_from_path(&self.target);
        let synced = self.writer.take().map(|writer| {
            writer
                .into_inner()
                .map_err(|err| err.into_error())
                .and_then(|file| file.sync_all())
        });
        if let Some(Err(err)) = synced {
            let _ = self.discard();
            return Err(ProviderError::io(&target, err));
        }

        let published = self.publish();
        self.finished = true;
        match published {
            Ok(()) => Ok(target),
            Err(err) => {
                let _ = self.discard();
                if err.kind() == ErrorKind::AlreadyExists {
                    Err(ProviderError::AlreadyExists(
                        self.target.to_string_lossy().to_string(),
                    ))
                } else {
                    Err(ProviderError::io(&target, err))
                }
            }
        }
    }

    fn abort(mut self: Box<Self>) -> Result<(), ProviderError> {
        let staging = handle_from_path(&self.staging);
        self.discard()
            .map_err(|err| ProviderError::io(&staging, err))
    }
}

impl Drop for LocalPendingWrite {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.discard();
        }
    }
}
