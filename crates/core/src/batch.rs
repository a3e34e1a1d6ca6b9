use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use chrono::{SecondsFormat, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::{CopyOptions, HealthPolicy};
use crate::copy::copy_entry;
use crate::error::{RecoveryError, Result};
use crate::model::{BatchKind, BatchReport, Entry, EntryResult, Handle, ProgressEvent, ProgressPhase};
use crate::provider::StorageProvider;
use crate::remux::remux_entry;

/// Shared signals a running job checks between entries.
#[derive(Debug, Clone, Default)]
pub struct BatchControl {
    pub cancel_flag: Option<Arc<AtomicBool>>,
    /// The shared scan generation counter and the value the job was started against.
    pub generation: Option<(Arc<AtomicU64>, u64)>,
    pub session_id: Option<String>,
}

impl BatchControl {
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    pub fn with_generation(mut self, counter: Arc<AtomicU64>, expected: u64) -> Self {
        self.generation = Some((counter, expected));
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    pub fn expected_generation(&self) -> Option<u64> {
        self.generation.as_ref().map(|(_, expected)| *expected)
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.generation
            .as_ref()
            .map(|(counter, _)| counter.load(Ordering::SeqCst))
    }

    pub fn is_stale(&self) -> bool {
        self.generation
            .as_ref()
            .is_some_and(|(counter, expected)| counter.load(Ordering::SeqCst) != *expected)
    }

    pub(crate) fn session_id(&self) -> String {
        self.session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

pub fn percent(completed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (completed.min(total).saturating_mul(100) / total) as u8
}

/// Emits monotonically sequenced progress events for one job.
pub(crate) struct ProgressTracker<'a, F>
where
    F: FnMut(ProgressEvent),
{
    session_id: String,
    seq: u64,
    total: u64,
    completed: u64,
    last_percent: u8,
    /// Scan totals come from a separate count pass and are only an estimate.
    estimated_total: bool,
    on_event: &'a mut F,
}

impl<'a, F> ProgressTracker<'a, F>
where
    F: FnMut(ProgressEvent),
{
    pub(crate) fn new(session_id: String, total: u64, on_event: &'a mut F) -> Self {
        Self {
            session_id,
            seq: 0,
            total,
            completed: 0,
            last_percent: 0,
            estimated_total: false,
            on_event,
        }
    }

    pub(crate) fn estimated(mut self) -> Self {
        self.estimated_total = true;
        self
    }

    pub(crate) fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed
    }

    pub(crate) fn advance(&mut self, phase: ProgressPhase, current: Option<String>) {
        self.completed = self.completed.saturating_add(1);
        self.emit(phase, current);
    }

    pub(crate) fn emit(&mut self, phase: ProgressPhase, current: Option<String>) {
        let mut value = match phase {
            ProgressPhase::Done => 100,
            ProgressPhase::Counting => 0,
            _ => percent(self.completed, self.total),
        };
        if self.estimated_total && phase != ProgressPhase::Done {
            value = value.min(99);
        }
        self.last_percent = self.last_percent.max(value);
        self.seq += 1;

        (self.on_event)(ProgressEvent {
            seq: self.seq,
            session_id: self.session_id.clone(),
            phase,
            current,
            completed: self.completed,
            total: self.total,
            percent: self.last_percent,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
    }
}

pub fn run_copy_batch<F>(
    provider: &dyn StorageProvider,
    entries: &[Entry],
    destination: &Handle,
    options: &CopyOptions,
    control: &BatchControl,
    on_event: F,
) -> Result<BatchReport>
where
    F: FnMut(ProgressEvent),
{
    run_batch(
        BatchKind::Copy,
        provider,
        entries,
        destination,
        control,
        on_event,
        |entry| copy_entry(provider, entry, destination, options),
    )
}

pub fn run_remux_batch<F>(
    provider: &dyn StorageProvider,
    entries: &[Entry],
    destination: &Handle,
    policy: &HealthPolicy,
    options: &CopyOptions,
    control: &BatchControl,
    on_event: F,
) -> Result<BatchReport>
where
    F: FnMut(ProgressEvent),
{
    run_batch(
        BatchKind::Remux,
        provider,
        entries,
        destination,
        control,
        on_event,
        |entry| remux_entry(provider, entry, destination, policy, options),
    )
}

fn run_batch<F, P>(
    kind: BatchKind,
    provider: &dyn StorageProvider,
    entries: &[Entry],
    destination: &Handle,
    control: &BatchControl,
    mut on_event: F,
    mut process: P,
) -> Result<BatchReport>
where
    F: FnMut(ProgressEvent),
    P: FnMut(&Entry) -> EntryResult,
{
    if let (Some(requested), Some(current)) =
        (control.expected_generation(), control.current_generation())
    {
        if requested != current {
            return Err(RecoveryError::StaleGeneration { requested, current });
        }
    }
    if !provider.is_writable_container(destination) {
        return Err(RecoveryError::DestinationInvalid(destination.clone()));
    }

    let phase = match kind {
        BatchKind::Copy => ProgressPhase::Copying,
        BatchKind::Remux => ProgressPhase::Remuxing,
    };
    let session_id = control.session_id();
    let mut tracker = ProgressTracker::new(session_id.clone(), entries.len() as u64, &mut on_event);
    let mut report = BatchReport {
        batch_id: session_id,
        kind,
        generation: control.expected_generation(),
        destination: destination.clone(),
        results: Vec::with_capacity(entries.len()),
        not_attempted: Vec::new(),
        cancelled: false,
        stale: false,
    };

    tracker.emit(phase.clone(), None);
    for (index, entry) in entries.iter().enumerate() {
        if control.is_stale() {
            report.stale = true;
        } else if control.is_cancelled() {
            report.cancelled = true;
        }
        if report.stale || report.cancelled {
            report.not_attempted = entries[index..]
                .iter()
                .map(|entry| entry.identifier.clone())
                .collect();
            break;
        }

        let result = process(entry);
        report.results.push(result);
        tracker.advance(phase.clone(), Some(entry.name.clone()));
    }

    let final_phase = if report.stale || report.cancelled {
        ProgressPhase::Cancelled
    } else {
        ProgressPhase::Done
    };
    tracker.emit(final_phase, None);

    info!(
        "{:?} batch {}: {} succeeded, {} failed, {} not attempted",
        kind,
        report.batch_id,
        report.succeeded(),
        report.failed(),
        report.not_attempted.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    };

    use super::{percent, run_copy_batch, BatchControl, ProgressTracker};
    use crate::classify::classify;
    use crate::config::CopyOptions;
    use crate::error::RecoveryError;
    use crate::model::{Entry, Handle, HealthStatus, ProgressEvent, ProgressPhase};
    use crate::provider::MemoryProvider;

    fn entry(path: &str, size: u64) -> Entry {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let class = classify(&name, "");
        Entry {
            identifier: Handle::new(path),
            name,
            size: Some(size),
            declared_type: String::new(),
            content_type: class.content_type,
            kind: class.kind,
            status: HealthStatus::Ok,
            health_note: None,
        }
    }

    fn card() -> (MemoryProvider, Vec<Entry>) {
        let provider = MemoryProvider::new();
        provider.add_dir("/out");
        let mut entries = Vec::new();
        for index in 0..4 {
            let path = format!("/card/file{index}.bin");
            provider.add_file(&path, vec![index as u8; 100]);
            entries.push(entry(&path, 100));
        }
        (provider, entries)
    }

    #[test]
    fn percent_handles_empty_totals() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(5, 3), 100);
    }

    #[test]
    fn estimated_progress_stays_below_done() {
        let mut events = Vec::new();
        let mut sink = |event: ProgressEvent| events.push(event);
        let mut tracker = ProgressTracker::new("s".to_string(), 1, &mut sink).estimated();
        tracker.advance(ProgressPhase::Scanning, None);
        tracker.advance(ProgressPhase::Scanning, None);
        tracker.emit(ProgressPhase::Done, None);

        let percents = events.iter().map(|e| e.percent).collect::<Vec<_>>();
        assert_eq!(percents, vec![99, 99, 100]);
        let seqs = events.iter().map(|e| e.seq).collect::<Vec<_>>();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn copies_every_entry_with_monotonic_progress() {
        let (provider, entries) = card();
        let mut events = Vec::new();
        let report = run_copy_batch(
            &provider,
            &entries,
            &Handle::new("/out"),
            &CopyOptions::default(),
            &BatchControl::default(),
            |event| events.push(event),
        )
        .expect("batch");

        assert_eq!(report.succeeded(), 4);
        assert!(report.not_attempted.is_empty());
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(events.last().map(|e| e.percent), Some(100));
        assert_eq!(events.last().map(|e| e.phase.clone()), Some(ProgressPhase::Done));
    }

    #[test]
    fn cancellation_between_entries_keeps_prior_results() {
        let (provider, entries) = card();
        let flag = Arc::new(AtomicBool::new(false));
        let control = BatchControl::default().with_cancel_flag(flag.clone());
        let mut seen = 0;
        let report = run_copy_batch(
            &provider,
            &entries,
            &Handle::new("/out"),
            &CopyOptions::default(),
            &control,
            |event| {
                if event.phase == ProgressPhase::Copying && event.completed == 2 {
                    flag.store(true, Ordering::Relaxed);
                }
                seen += 1;
            },
        )
        .expect("batch");

        assert!(report.cancelled);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.not_attempted.len(), 2);
        assert_eq!(provider.child_names("/out").len(), 2);
        assert!(seen > 0);
    }

    #[test]
    fn generation_bump_marks_the_batch_stale() {
        let (provider, entries) = card();
        let counter = Arc::new(AtomicU64::new(3));
        let control = BatchControl::default().with_generation(counter.clone(), 3);
        let report = run_copy_batch(
            &provider,
            &entries,
            &Handle::new("/out"),
            &CopyOptions::default(),
            &control,
            |event| {
                if event.completed == 1 {
                    counter.store(4, Ordering::SeqCst);
                }
            },
        )
        .expect("batch");
        assert!(report.stale);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.not_attempted.len(), 3);
        assert_eq!(report.generation, Some(3));

        let err = run_copy_batch(
            &provider,
            &entries,
            &Handle::new("/out"),
            &CopyOptions::default(),
            &control,
            |_| {},
        )
        .expect_err("stale submission");
        assert!(matches!(
            err,
            RecoveryError::StaleGeneration {
                requested: 3,
                current: 4
            }
        ));
    }

    #[test]
    fn invalid_destination_fails_before_any_entry() {
        let (provider, entries) = card();
        provider.set_read_only("/out");
        let mut events = 0;
        let err = run_copy_batch(
            &provider,
            &entries,
            &Handle::new("/out"),
            &CopyOptions::default(),
            &BatchControl::default(),
            |_| events += 1,
        )
        .expect_err("read-only destination");
        assert!(matches!(err, RecoveryError::DestinationInvalid(_)));
        assert_eq!(events, 0);
        assert!(provider.child_names("/out").is_empty());
    }
}
