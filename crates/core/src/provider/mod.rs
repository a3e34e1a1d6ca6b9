//! Capability-set abstraction over the medium being recovered from and written to.
//!
//! Anything that can list, open, write and delete objects by opaque handle can back
//! the engine; `LocalFsProvider` and `MemoryProvider` are the two shipped here.

mod local;
mod memory;

use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::error::ProviderError;
use crate::model::Handle;

pub use local::{LocalFsProvider, STAGING_SUFFIX};
pub use memory::MemoryProvider;

pub trait SourceStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> SourceStream for T {}

/// A destination object that only becomes visible once committed.
pub trait PendingWrite: Write + Send {
    fn commit(self: Box<Self>) -> Result<Handle, ProviderError>;
    fn abort(self: Box<Self>) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub device: u64,
    pub inode: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub handle: Handle,
    pub name: String,
    pub is_directory: bool,
}

pub trait StorageProvider: Send + Sync {
    fn list_children(&self, dir: &Handle) -> Result<Vec<ChildEntry>, ProviderError>;

    fn open_read(&self, handle: &Handle) -> Result<Box<dyn SourceStream>, ProviderError>;

    fn open_write(
        &self,
        container: &Handle,
        name: &str,
    ) -> Result<Box<dyn PendingWrite>, ProviderError>;

    fn length(&self, handle: &Handle) -> Option<u64>;

    fn delete(&self, handle: &Handle) -> Result<(), ProviderError>;

    fn child_exists(&self, container: &Handle, name: &str) -> bool;

    fn is_writable_container(&self, handle: &Handle) -> bool;

    fn declared_type(&self, _handle: &Handle) -> Option<String> {
        None
    }

    fn node_id(&self, _handle: &Handle) -> Option<NodeId> {
        None
    }
}

/// Picks `name`, or `stem (n).ext` for the first free `n`, inside `container`.
pub fn unique_child_name(
    provider: &dyn StorageProvider,
    container: &Handle,
    name: &str,
) -> String {
    if !provider.child_exists(container, name) {
        return name.to_string();
    }

    let (stem, extension) = split_name(name);
    let mut counter = 1_u32;
    loop {
        let candidate = match extension {
            Some(ext) => format!("{stem} ({counter}).{ext}"),
            None => format!("{stem} ({counter})"),
        };
        if !provider.child_exists(container, &candidate) {
            return candidate;
        }
        counter = counter.saturating_add(1);
    }
}

pub(crate) fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(index) => (&name[..index], Some(&name[index + 1..])),
    }
}

pub(crate) fn handle_from_path(path: &Path) -> Handle {
    Handle::new(path.to_string_lossy().to_string())
}
