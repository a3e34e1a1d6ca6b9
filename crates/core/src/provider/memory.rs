use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ChildEntry, NodeId, PendingWrite, SourceStream, StorageProvider};
use crate::error::ProviderError;
use crate::model::Handle;

#[derive(Debug, Clone)]
enum Node {
    Dir { id: u64 },
    File(Arc<Vec<u8>>),
    Link { target: String },
}

#[derive(Debug, Default)]
struct MemoryState {
    nodes: BTreeMap<String, Node>,
    next_dir_id: u64,
    read_faults: HashMap<String, u64>,
    unopenable: HashSet<String>,
    read_only: HashSet<String>,
    reported_lengths: HashMap<String, Option<u64>>,
    content_types: HashMap<String, String>,
}

impl MemoryState {
    fn resolve(&self, path: &str) -> Option<(String, Node)> {
        let mut current = path.to_string();
        for _ in 0..32 {
            match self.nodes.get(&current)? {
                Node::Link { target } => current = target.clone(),
                node => return Some((current, node.clone())),
            }
        }
        None
    }

    fn ensure_dir(&mut self, path: &str) {
        let path = normalize(path);
        if self.nodes.contains_key(&path) {
            return;
        }
        if let Some(parent) = parent_of(&path) {
            self.ensure_dir(&parent);
        }
        self.next_dir_id += 1;
        let id = self.next_dir_id;
        self.nodes.insert(path, Node::Dir { id });
    }
}

/// In-memory provider with fault injection, used to exercise failure paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        let provider = Self::default();
        provider.add_dir("/");
        provider
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_dir(&self, path: &str) {
        self.lock().ensure_dir(path);
    }

    pub fn add_file(&self, path: &str, bytes: Vec<u8>) {
        let path = normalize(path);
        let mut state = self.lock();
        if let Some(parent) = parent_of(&path) {
            state.ensure_dir(&parent);
        }
        state.nodes.insert(path, Node::File(Arc::new(bytes)));
    }

    /// Adds a directory entry that resolves to `target`, the way a bind mount or
    /// directory junction would.
    pub fn add_dir_link(&self, path: &str, target: &str) {
        let path = normalize(path);
        let mut state = self.lock();
        if let Some(parent) = parent_of(&path) {
            state.ensure_dir(&parent);
        }
        state.nodes.insert(
            path,
            Node::Link {
                target: normalize(target),
            },
        );
    }

    pub fn set_content_type(&self, path: &str, content_type: &str) {
        self.lock()
            .content_types
            .insert(normalize(path), content_type.to_string());
    }

    /// Reads of `path` fail with an I/O error once `after` bytes have been served.
    pub fn fail_reads_after(&self, path: &str, after: u64) {
        self.lock().read_faults.insert(normalize(path), after);
    }

    /// Opening `path` for reading fails, as for a file without read permission.
    pub fn deny_reads(&self, path: &str) {
        self.lock().unopenable.insert(normalize(path));
    }

    pub fn set_read_only(&self, path: &str) {
        self.lock().read_only.insert(normalize(path));
    }

    pub fn set_reported_length(&self, path: &str, length: Option<u64>) {
        self.lock()
            .reported_lengths
            .insert(normalize(path), length);
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().resolve(&normalize(path)) {
            Some((_, Node::File(bytes))) => Some(bytes.as_ref().clone()),
            _ => None,
        }
    }

    pub fn child_names(&self, dir: &str) -> Vec<String> {
        let dir = normalize(dir);
        self.lock()
            .nodes
            .keys()
            .filter(|path| parent_of(path).as_deref() == Some(dir.as_str()))
            .filter_map(|path| path.rsplit('/').next().map(str::to_string))
            .collect()
    }

    fn list(&self, dir: &Handle) -> Result<Vec<ChildEntry>, ProviderError> {
        let state = self.lock();
        let requested = normalize(dir.as_str());
        let (resolved, node) = state
            .resolve(&requested)
            .ok_or_else(|| ProviderError::NotFound(dir.clone()))?;
        if !matches!(node, Node::Dir { .. }) {
            return Err(ProviderError::NotADirectory(dir.clone()));
        }

        let children = state
            .nodes
            .iter()
            .filter(|(path, _)| parent_of(path).as_deref() == Some(resolved.as_str()))
            .filter_map(|(path, child)| {
                let name = path.rsplit('/').next()?.to_string();
                let is_directory = match child {
                    Node::Dir { .. } => true,
                    Node::File(_) => false,
                    Node::Link { .. } => matches!(
                        state.resolve(path),
                        Some((_, Node::Dir { .. }))
                    ),
                };
                Some(ChildEntry {
                    handle: Handle::new(join(&requested, &name)),
                    name,
                    is_directory,
                })
            })
            .collect();
        Ok(children)
    }

    /// Maps a handle that may pass through linked directories to its stored path.
    fn canonical(&self, handle: &Handle) -> String {
        let state = self.lock();
        let path = normalize(handle.as_str());
        let mut resolved = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let candidate = join(if resolved.is_empty() { "/" } else { &resolved }, segment);
            resolved = match state.nodes.get(&candidate) {
                Some(Node::Link { target }) => target.clone(),
                _ => candidate,
            };
        }
        if resolved.is_empty() {
            "/".to_string()
        } else {
            resolved
        }
    }
}

impl StorageProvider for MemoryProvider {
    fn list_children(&self, dir: &Handle) -> Result<Vec<ChildEntry>, ProviderError> {
        let canonical = Handle::new(self.canonical(dir));
        let mut children = self.list(&canonical)?;
        let base = normalize(dir.as_str());
        for child in &mut children {
            child.handle = Handle::new(join(&base, &child.name));
        }
        Ok(children)
    }

    fn open_read(&self, handle: &Handle) -> Result<Box<dyn SourceStream>, ProviderError> {
        let path = self.canonical(handle);
        let state = self.lock();
        if state.unopenable.contains(&path) {
            return Err(ProviderError::io(
                handle,
                io::Error::new(ErrorKind::PermissionDenied, "read permission denied"),
            ));
        }
        match state.resolve(&path) {
            Some((_, Node::File(bytes))) => Ok(Box::new(FaultyReader {
                inner: Cursor::new(SharedBytes(bytes)),
                fail_after: state.read_faults.get(&path).copied(),
            })),
            Some(_) => Err(ProviderError::io(
                handle,
                io::Error::new(ErrorKind::Other, "not a file"),
            )),
            None => Err(ProviderError::NotFound(handle.clone())),
        }
    }

    fn open_write(
        &self,
        container: &Handle,
        name: &str,
    ) -> Result<Box<dyn PendingWrite>, ProviderError> {
        let path = self.canonical(container);
        let state = self.lock();
        match state.resolve(&path) {
            Some((_, Node::Dir { .. })) => {}
            Some(_) => return Err(ProviderError::NotADirectory(container.clone())),
            None => return Err(ProviderError::NotFound(container.clone())),
        }
        if state.read_only.contains(&path) {
            return Err(ProviderError::ReadOnly(container.clone()));
        }
        Ok(Box::new(MemoryPendingWrite {
            state: Arc::clone(&self.state),
            target: join(&path, name),
            buffer: Vec::new(),
        }))
    }

    fn length(&self, handle: &Handle) -> Option<u64> {
        let path = self.canonical(handle);
        let state = self.lock();
        if let Some(reported) = state.reported_lengths.get(&path) {
            return *reported;
        }
        match state.resolve(&path) {
            Some((_, Node::File(bytes))) => Some(bytes.len() as u64),
            _ => None,
        }
    }

    fn delete(&self, handle: &Handle) -> Result<(), ProviderError> {
        let path = self.canonical(handle);
        let mut state = self.lock();
        match state.nodes.get(&path) {
            Some(Node::File(_)) => {
                state.nodes.remove(&path);
                Ok(())
            }
            Some(_) => Err(ProviderError::io(
                handle,
                io::Error::new(ErrorKind::Other, "not a file"),
            )),
            None => Err(ProviderError::NotFound(handle.clone())),
        }
    }

    fn child_exists(&self, container: &Handle, name: &str) -> bool {
        let path = join(&self.canonical(container), name);
        self.lock().nodes.contains_key(&path)
    }

    fn is_writable_container(&self, handle: &Handle) -> bool {
        let path = self.canonical(handle);
        let state = self.lock();
        matches!(state.resolve(&path), Some((_, Node::Dir { .. })))
            && !state.read_only.contains(&path)
    }

    fn declared_type(&self, handle: &Handle) -> Option<String> {
        let path = self.canonical(handle);
        self.lock().content_types.get(&path).cloned()
    }

    fn node_id(&self, handle: &Handle) -> Option<NodeId> {
        let path = self.canonical(handle);
        match self.lock().resolve(&path) {
            Some((_, Node::Dir { id })) => Some(NodeId {
                device: 0,
                inode: id,
            }),
            _ => None,
        }
    }
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

struct FaultyReader {
    inner: Cursor<SharedBytes>,
    fail_after: Option<u64>,
}

impl Read for FaultyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(limit) = self.fail_after else {
            return self.inner.read(buf);
        };
        let position = self.inner.position();
        if position >= limit {
            return Err(io::Error::new(ErrorKind::Other, "injected read failure"));
        }
        let allowed = (limit - position).min(buf.len() as u64) as usize;
        self.inner.read(&mut buf[..allowed])
    }
}

impl Seek for FaultyReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

struct MemoryPendingWrite {
    state: Arc<Mutex<MemoryState>>,
    target: String,
    buffer: Vec<u8>,
}

impl Write for MemoryPendingWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PendingWrite for MemoryPendingWrite {
    fn commit(self: Box<Self>) -> Result<Handle, ProviderError> {
        let MemoryPendingWrite {
            state,
            target,
            buffer,
        } = *self;
        let mut state = match state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.nodes.contains_key(&target) {
            return Err(ProviderError::AlreadyExists(target));
        }
        state.nodes.insert(target.clone(), Node::File(Arc::new(buffer)));
        Ok(Handle::new(target))
    }

    fn abort(self: Box<Self>) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    let index = path.rfind('/')?;
    if index == 0 {
        Some("/".to_string())
    } else {
        Some(path[..index].to_string())
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}
