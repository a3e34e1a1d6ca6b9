use std::fmt;

use serde::{Deserialize, Serialize};

pub const CATALOG_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Handle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Handle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Suspect,
    Corrupt,
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Suspect => "suspect",
            HealthStatus::Corrupt => "corrupt",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub identifier: Handle,
    pub name: String,
    pub size: Option<u64>,
    #[serde(default)]
    pub declared_type: String,
    pub content_type: String,
    pub kind: MediaKind,
    pub status: HealthStatus,
    #[serde(default)]
    pub health_note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    pub catalog_version: String,
    pub scan_id: String,
    pub generation: u64,
    pub root: Handle,
    pub created_at: String,
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl Catalog {
    pub fn find(&self, identifier: &Handle) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|entry| &entry.identifier == identifier)
    }

    pub fn summary(&self) -> CatalogSummary {
        let mut summary = CatalogSummary {
            total: self.entries.len() as u64,
            ..CatalogSummary::default()
        };
        for entry in &self.entries {
            match entry.kind {
                MediaKind::Image => summary.images += 1,
                MediaKind::Video => summary.videos += 1,
                MediaKind::Other => summary.others += 1,
            }
            match entry.status {
                HealthStatus::Ok => summary.ok += 1,
                HealthStatus::Suspect => summary.suspect += 1,
                HealthStatus::Corrupt => summary.corrupt += 1,
            }
            summary.total_bytes = summary
                .total_bytes
                .saturating_add(entry.size.unwrap_or(0));
        }
        summary
    }
}

pub(crate) fn sort_entries(entries: &mut [Entry]) {
    entries.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CatalogSummary {
    pub total: u64,
    pub total_bytes: u64,
    pub images: u64,
    pub videos: u64,
    pub others: u64,
    pub ok: u64,
    pub suspect: u64,
    pub corrupt: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    EntryUnreadable,
    SizeMismatch,
    ChecksumMismatch,
    Unrecoverable,
    DestinationWrite,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureReason::EntryUnreadable => "entry_unreadable",
            FailureReason::SizeMismatch => "size_mismatch",
            FailureReason::ChecksumMismatch => "checksum_mismatch",
            FailureReason::Unrecoverable => "unrecoverable",
            FailureReason::DestinationWrite => "destination_write",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepairMethod {
    Verbatim,
    FragmentTrim,
    IndexTrim,
    StreamRebuild,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryResult {
    pub identifier: Handle,
    pub name: String,
    pub succeeded: bool,
    pub bytes_written: u64,
    #[serde(default)]
    pub destination: Option<Handle>,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub repair: Option<RepairMethod>,
}

pub type CopyResult = EntryResult;
pub type RemuxResult = EntryResult;

impl EntryResult {
    pub(crate) fn success(entry: &Entry, destination: Handle, bytes_written: u64) -> Self {
        Self {
            identifier: entry.identifier.clone(),
            name: entry.name.clone(),
            succeeded: true,
            bytes_written,
            destination: Some(destination),
            failure: None,
            detail: None,
            repair: None,
        }
    }

    pub(crate) fn failure(entry: &Entry, reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            identifier: entry.identifier.clone(),
            name: entry.name.clone(),
            succeeded: false,
            bytes_written: 0,
            destination: None,
            failure: Some(reason),
            detail: Some(detail.into()),
            repair: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    Copy,
    Remux,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub batch_id: String,
    pub kind: BatchKind,
    pub generation: Option<u64>,
    pub destination: Handle,
    pub results: Vec<EntryResult>,
    #[serde(default)]
    pub not_attempted: Vec<Handle>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub stale: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|result| result.succeeded).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Counting,
    Scanning,
    Copying,
    Remuxing,
    Cancelled,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub seq: u64,
    pub session_id: String,
    pub phase: ProgressPhase,
    pub current: Option<String>,
    pub completed: u64,
    pub total: u64,
    pub percent: u8,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::{sort_entries, Entry, Handle, HealthStatus, MediaKind};

    fn entry(id: &str, name: &str) -> Entry {
        Entry {
            identifier: Handle::new(id),
            name: name.to_string(),
            size: Some(1),
            declared_type: String::new(),
            content_type: "application/octet-stream".to_string(),
            kind: MediaKind::Other,
            status: HealthStatus::Ok,
            health_note: None,
        }
    }

    #[test]
    fn entries_sort_case_insensitively_with_stable_ties() {
        let mut entries = vec![
            entry("3", "beta.jpg"),
            entry("2", "Alpha.jpg"),
            entry("1", "alpha.JPG"),
        ];
        sort_entries(&mut entries);
        let ids = entries
            .iter()
            .map(|e| e.identifier.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn handle_serializes_as_plain_string() {
        let json = serde_json::to_string(&Handle::new("/card/DCIM/a.jpg")).expect("json");
        assert_eq!(json, "\"/card/DCIM/a.jpg\"");
    }
}
