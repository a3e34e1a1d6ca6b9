use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::batch::{BatchControl, ProgressTracker};
use crate::classify::{classify, Classification};
use crate::config::{EngineConfig, HealthPolicy};
use crate::error::Result;
use crate::health::diagnose;
use crate::model::{
    sort_entries, Catalog, Entry, Handle, HealthStatus, MediaKind, ProgressEvent, ProgressPhase,
    CATALOG_VERSION,
};
use crate::provider::StorageProvider;
use crate::walk::{TreeWalker, WalkedFile};

const PROGRESS_LOG_INTERVAL: u64 = 250;

pub struct ScanRunOutput {
    pub catalog: Catalog,
    pub events: Vec<ProgressEvent>,
}

pub fn run_scan(
    provider: &dyn StorageProvider,
    root: &Handle,
    config: &EngineConfig,
) -> Result<Catalog> {
    run_scan_with_callback(provider, root, config, &BatchControl::default(), |_| {})
}

pub fn run_scan_with_events(
    provider: &dyn StorageProvider,
    root: &Handle,
    config: &EngineConfig,
    control: &BatchControl,
) -> Result<ScanRunOutput> {
    let mut events = Vec::new();
    let catalog = run_scan_with_callback(provider, root, config, control, |event| {
        events.push(event)
    })?;
    Ok(ScanRunOutput { catalog, events })
}

/// Walks `root`, classifies and health-checks every leaf file and returns the catalog.
///
/// Only a root that cannot be listed is an error. Files that cannot be opened are
/// left out with a warning, files whose reads fail part way become `Corrupt` entries
/// with a note, and a cancelled scan returns the entries gathered so far with
/// `cancelled` set.
pub fn run_scan_with_callback<F>(
    provider: &dyn StorageProvider,
    root: &Handle,
    config: &EngineConfig,
    control: &BatchControl,
    mut on_event: F,
) -> Result<Catalog>
where
    F: FnMut(ProgressEvent),
{
    let scan_id = control.session_id();
    let mut warnings = Vec::new();
    let walker = TreeWalker::new(provider, &config.walk, &mut warnings)
        .with_cancel_flag(control.cancel_flag.clone());

    let mut tracker = ProgressTracker::new(scan_id.clone(), 0, &mut on_event).estimated();
    tracker.emit(ProgressPhase::Counting, Some(root.to_string()));
    let total = walker.count(root, &mut warnings)?;
    tracker.set_total(total);
    info!("scan progress: {total} files to inspect under {root}");

    let mut entries = Vec::with_capacity(total as usize);
    let mut read_warnings = Vec::new();
    let summary = walker.walk(root, &mut warnings, |file| {
        let name = file.name.clone();
        if let Some(entry) = inspect(provider, file, &config.health, &mut read_warnings) {
            entries.push(entry);
        }
        tracker.advance(ProgressPhase::Scanning, Some(name));
        if tracker.completed() % PROGRESS_LOG_INTERVAL == 0 {
            info!(
                "scan progress: {}/{} files inspected",
                tracker.completed(),
                total
            );
        }
    })?;
    warnings.extend(read_warnings);
    sort_entries(&mut entries);

    let catalog = Catalog {
        catalog_version: CATALOG_VERSION.to_string(),
        scan_id,
        generation: control.expected_generation().unwrap_or(0),
        root: root.clone(),
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        entries,
        warnings,
        cancelled: summary.cancelled,
    };

    if catalog.cancelled {
        tracker.emit(ProgressPhase::Cancelled, None);
    } else {
        tracker.emit(ProgressPhase::Done, None);
    }

    let counts = catalog.summary();
    info!(
        "scan {} finished: {} entries ({} ok, {} suspect, {} corrupt), {} skipped, {} warnings{}",
        catalog.scan_id,
        counts.total,
        counts.ok,
        counts.suspect,
        counts.corrupt,
        summary.skipped,
        catalog.warnings.len(),
        if catalog.cancelled { ", cancelled" } else { "" }
    );
    Ok(catalog)
}

/// Builds the entry for one file, or `None` when it cannot be opened at all.
/// The status is decided before the entry exists.
fn inspect(
    provider: &dyn StorageProvider,
    file: WalkedFile,
    policy: &HealthPolicy,
    warnings: &mut Vec<String>,
) -> Option<Entry> {
    let mut stream = match provider.open_read(&file.handle) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("skipping {}: {err}", file.handle);
            warnings.push(format!("skipped unreadable file {}: {err}", file.handle));
            return None;
        }
    };
    let size = provider.length(&file.handle);
    let declared_type = provider.declared_type(&file.handle).unwrap_or_default();
    let Classification { kind, content_type } = classify(&file.name, &declared_type);

    let (status, health_note) = if kind == MediaKind::Other {
        (HealthStatus::Ok, None)
    } else {
        match diagnose(kind, &content_type, &mut *stream, policy) {
            Ok(diagnosis) => {
                debug!("{} -> {}", file.handle, diagnosis.status.label());
                (diagnosis.status, diagnosis.note)
            }
            Err(err) => {
                warn!("could not read {}: {err}", file.handle);
                warnings.push(format!("could not read {}: {err}", file.handle));
                (HealthStatus::Corrupt, Some(format!("read failed: {err}")))
            }
        }
    };

    Some(Entry {
        identifier: file.handle,
        name: file.name,
        size,
        declared_type,
        content_type,
        kind,
        status,
        health_note,
    })
}
