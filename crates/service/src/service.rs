use std::collections::{HashMap, HashSet};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc, Arc, Mutex, MutexGuard,
};
use std::thread;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use recovereasy_core::{
    collect_doctor_info, run_copy_batch, run_remux_batch, run_scan_with_callback, BatchControl,
    BatchReport, Catalog, DoctorInfo, EngineConfig, Entry, Handle, LocalFsProvider,
    ProgressEvent, RecoveryError, StorageProvider,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub root: Handle,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyRequest {
    pub identifiers: Vec<Handle>,
    pub destination: Handle,
    /// Generation of the catalog the identifiers were selected from.
    pub generation: u64,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub verify_digest: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemuxRequest {
    pub identifiers: Vec<Handle>,
    pub destination: Handle,
    pub generation: u64,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Scan,
    Copy,
    Remux,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    /// A newer scan started before this job finished.
    Stale,
    Failed,
}

impl SessionStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, SessionStatus::Queued | SessionStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub generation: u64,
    pub percent: u8,
    pub total_events: u64,
    pub catalog: Option<Catalog>,
    pub report: Option<BatchReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Debug)]
struct Session {
    kind: SessionKind,
    status: SessionStatus,
    generation: u64,
    catalog: Option<Catalog>,
    report: Option<BatchReport>,
    error: Option<String>,
    events: Vec<ProgressEvent>,
    cancel_flag: Arc<AtomicBool>,
}

enum Job {
    Scan {
        session_id: String,
        request: ScanRequest,
    },
    Batch {
        session_id: String,
        kind: SessionKind,
        entries: Vec<Entry>,
        destination: Handle,
        verify_digest: Option<bool>,
    },
}

struct Shared {
    provider: Arc<dyn StorageProvider>,
    config: EngineConfig,
    generation: Arc<AtomicU64>,
    sessions: Mutex<HashMap<String, Session>>,
    catalog: Mutex<Option<Catalog>>,
}

/// Session API over the core engine. Every job runs on one background worker, in
/// submission order.
pub struct RecoveryService {
    shared: Arc<Shared>,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
}

static DEFAULT_SERVICE: Lazy<RecoveryService> = Lazy::new(|| {
    RecoveryService::new(Arc::new(LocalFsProvider::new()), EngineConfig::default())
});

impl RecoveryService {
    pub fn new(provider: Arc<dyn StorageProvider>, config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                config,
                generation: Arc::new(AtomicU64::new(0)),
                sessions: Mutex::new(HashMap::new()),
                catalog: Mutex::new(None),
            }),
            jobs: Mutex::new(None),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Starts a scan. The generation is bumped immediately, so batches selected from
    /// older catalogs are rejected from this point on.
    pub fn start_scan(&self, request: ScanRequest) -> Result<String> {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = self.register(request.session_id.clone(), SessionKind::Scan, generation)?;
        info!("scan {session_id} queued for {} (generation {generation})", request.root);
        self.submit(Job::Scan {
            session_id: session_id.clone(),
            request,
        })?;
        Ok(session_id)
    }

    pub fn start_copy(&self, request: CopyRequest) -> Result<String> {
        let entries = self.select(&request.identifiers, request.generation)?;
        self.start_batch(
            SessionKind::Copy,
            request.session_id,
            request.generation,
            entries,
            request.destination,
            request.verify_digest,
        )
    }

    pub fn start_remux(&self, request: RemuxRequest) -> Result<String> {
        let entries = self.select(&request.identifiers, request.generation)?;
        self.start_batch(
            SessionKind::Remux,
            request.session_id,
            request.generation,
            entries,
            request.destination,
            None,
        )
    }

    pub fn poll_events(&self, session_id: &str, from_seq: u64) -> Result<Vec<ProgressEvent>> {
        let sessions = self.shared.lock_sessions()?;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| anyhow!("session not found: {session_id}"))?;

        Ok(session
            .events
            .iter()
            .filter(|event| event.seq > from_seq)
            .cloned()
            .collect())
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let sessions = self.shared.lock_sessions()?;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| anyhow!("session not found: {session_id}"))?;

        Ok(SessionSnapshot {
            session_id: session_id.to_string(),
            kind: session.kind,
            status: session.status,
            generation: session.generation,
            percent: session.events.last().map_or(0, |event| event.percent),
            total_events: session.events.len() as u64,
            catalog: session.catalog.clone(),
            report: session.report.clone(),
            error: session.error.clone(),
        })
    }

    /// Requests cancellation. A queued job is dropped before it starts; a running one
    /// stops at its next entry boundary.
    pub fn cancel(&self, session_id: &str) -> Result<CancelResponse> {
        let mut sessions = self.shared.lock_sessions()?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("session not found: {session_id}"))?;

        session.cancel_flag.store(true, Ordering::Relaxed);
        if session.status == SessionStatus::Queued {
            session.status = SessionStatus::Cancelled;
        }

        Ok(CancelResponse {
            session_id: session_id.to_string(),
            status: session.status,
        })
    }

    /// The catalog of the newest scan that ran to completion.
    pub fn current_catalog(&self) -> Option<Catalog> {
        self.shared
            .catalog
            .lock()
            .ok()
            .and_then(|catalog| catalog.clone())
    }

    fn select(&self, identifiers: &[Handle], generation: u64) -> Result<Vec<Entry>> {
        let current = self.current_generation();
        if generation != current {
            return Err(RecoveryError::StaleGeneration {
                requested: generation,
                current,
            }
            .into());
        }
        let catalog = self
            .current_catalog()
            .filter(|catalog| catalog.generation == generation)
            .ok_or_else(|| anyhow!("no completed catalog for generation {generation}"))?;

        let wanted = identifiers.iter().collect::<HashSet<_>>();
        let known = catalog
            .entries
            .iter()
            .map(|entry| &entry.identifier)
            .collect::<HashSet<_>>();
        if let Some(missing) = identifiers.iter().find(|id| !known.contains(id)) {
            return Err(anyhow!("{missing} is not in catalog {}", catalog.scan_id));
        }

        Ok(catalog
            .entries
            .iter()
            .filter(|entry| wanted.contains(&entry.identifier))
            .cloned()
            .collect())
    }

    fn start_batch(
        &self,
        kind: SessionKind,
        session_id: Option<String>,
        generation: u64,
        entries: Vec<Entry>,
        destination: Handle,
        verify_digest: Option<bool>,
    ) -> Result<String> {
        let session_id = self.register(session_id, kind, generation)?;
        info!(
            "{kind:?} batch {session_id} queued: {} entries to {destination}",
            entries.len()
        );
        self.submit(Job::Batch {
            session_id: session_id.clone(),
            kind,
            entries,
            destination,
            verify_digest,
        })?;
        Ok(session_id)
    }

    fn register(
        &self,
        session_id: Option<String>,
        kind: SessionKind,
        generation: u64,
    ) -> Result<String> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut sessions = self.shared.lock_sessions()?;
        if sessions.contains_key(&session_id) {
            return Err(anyhow!("session id already in use: {session_id}"));
        }
        sessions.insert(
            session_id.clone(),
            Session {
                kind,
                status: SessionStatus::Queued,
                generation,
                catalog: None,
                report: None,
                error: None,
                events: Vec::new(),
                cancel_flag: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(session_id)
    }

    fn submit(&self, job: Job) -> Result<()> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| anyhow!("job queue lock poisoned"))?;
        if jobs.is_none() {
            let (sender, receiver) = mpsc::channel::<Job>();
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("recovereasy-worker".to_string())
                .spawn(move || {
                    for job in receiver {
                        shared.run(job);
                    }
                })
                .context("failed to spawn the worker thread")?;
            *jobs = Some(sender);
        }

        jobs.as_ref()
            .ok_or_else(|| anyhow!("worker unavailable"))?
            .send(job)
            .map_err(|_| anyhow!("worker thread has stopped"))
    }
}

impl Shared {
    fn lock_sessions(&self) -> Result<MutexGuard<'_, HashMap<String, Session>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("session registry lock poisoned"))
    }

    fn update(&self, session_id: &str, apply: impl FnOnce(&mut Session)) {
        match self.lock_sessions() {
            Ok(mut sessions) => {
                if let Some(session) = sessions.get_mut(session_id) {
                    apply(session);
                }
            }
            Err(err) => warn!("dropping update for {session_id}: {err}"),
        }
    }

    /// Marks the session running and returns its control, or `None` if it was cancelled
    /// while queued.
    fn begin(&self, session_id: &str) -> Option<BatchControl> {
        let mut sessions = self.lock_sessions().ok()?;
        let session = sessions.get_mut(session_id)?;
        if session.status != SessionStatus::Queued {
            return None;
        }
        session.status = SessionStatus::Running;
        Some(
            BatchControl::default()
                .with_session_id(session_id)
                .with_cancel_flag(Arc::clone(&session.cancel_flag))
                .with_generation(Arc::clone(&self.generation), session.generation),
        )
    }

    fn run(&self, job: Job) {
        match job {
            Job::Scan {
                session_id,
                request,
            } => self.run_scan(&session_id, request),
            Job::Batch {
                session_id,
                kind,
                entries,
                destination,
                verify_digest,
            } => self.run_batch(&session_id, kind, &entries, &destination, verify_digest),
        }
    }

    fn run_scan(&self, session_id: &str, request: ScanRequest) {
        let Some(control) = self.begin(session_id) else {
            info!("scan {session_id} was cancelled before it started");
            return;
        };
        let mut config = self.config.clone();
        if let Some(max_depth) = request.max_depth {
            config.walk.max_depth = max_depth;
        }
        config.walk.excludes.extend(request.excludes);

        let result = run_scan_with_callback(
            self.provider.as_ref(),
            &request.root,
            &config,
            &control,
            |event| self.update(session_id, |session| session.events.push(event)),
        );

        match result {
            Ok(catalog) => {
                let status = if control.is_stale() {
                    SessionStatus::Stale
                } else if catalog.cancelled {
                    SessionStatus::Cancelled
                } else {
                    SessionStatus::Completed
                };
                if status == SessionStatus::Completed {
                    match self.catalog.lock() {
                        Ok(mut current) => *current = Some(catalog.clone()),
                        Err(_) => warn!("catalog lock poisoned; scan {session_id} not installed"),
                    }
                } else {
                    info!("scan {session_id} finished as {status:?}; catalog not installed");
                }
                self.update(session_id, |session| {
                    session.status = status;
                    session.catalog = Some(catalog);
                });
            }
            Err(err) => {
                warn!("scan {session_id} failed: {err}");
                self.update(session_id, |session| {
                    session.status = SessionStatus::Failed;
                    session.error = Some(err.to_string());
                });
            }
        }
    }

    fn run_batch(
        &self,
        session_id: &str,
        kind: SessionKind,
        entries: &[Entry],
        destination: &Handle,
        verify_digest: Option<bool>,
    ) {
        let Some(control) = self.begin(session_id) else {
            info!("batch {session_id} was cancelled before it started");
            return;
        };
        let mut copy_options = self.config.copy.clone();
        if let Some(verify) = verify_digest {
            copy_options.verify_digest = verify;
        }
        let on_event = |event| self.update(session_id, |session| session.events.push(event));

        let result = match kind {
            SessionKind::Remux => run_remux_batch(
                self.provider.as_ref(),
                entries,
                destination,
                &self.config.health,
                &copy_options,
                &control,
                on_event,
            ),
            _ => run_copy_batch(
                self.provider.as_ref(),
                entries,
                destination,
                &copy_options,
                &control,
                on_event,
            ),
        };

        match result {
            Ok(report) => {
                let status = if report.stale {
                    SessionStatus::Stale
                } else if report.cancelled {
                    SessionStatus::Cancelled
                } else {
                    SessionStatus::Completed
                };
                self.update(session_id, |session| {
                    session.status = status;
                    session.report = Some(report);
                });
            }
            Err(err) => {
                warn!("batch {session_id} failed: {err}");
                let status = match err {
                    RecoveryError::StaleGeneration { .. } => SessionStatus::Stale,
                    _ => SessionStatus::Failed,
                };
                self.update(session_id, |session| {
                    session.status = status;
                    session.error = Some(err.to_string());
                });
            }
        }
    }
}

pub fn start_scan(request: ScanRequest) -> Result<String> {
    DEFAULT_SERVICE.start_scan(request)
}

pub fn start_copy(request: CopyRequest) -> Result<String> {
    DEFAULT_SERVICE.start_copy(request)
}

pub fn start_remux(request: RemuxRequest) -> Result<String> {
    DEFAULT_SERVICE.start_remux(request)
}

pub fn poll_events(session_id: &str, from_seq: u64) -> Result<Vec<ProgressEvent>> {
    DEFAULT_SERVICE.poll_events(session_id, from_seq)
}

pub fn get_session(session_id: &str) -> Result<SessionSnapshot> {
    DEFAULT_SERVICE.get_session(session_id)
}

pub fn cancel(session_id: &str) -> Result<CancelResponse> {
    DEFAULT_SERVICE.cancel(session_id)
}

pub fn current_catalog() -> Option<Catalog> {
    DEFAULT_SERVICE.current_catalog()
}

pub fn doctor() -> DoctorInfo {
    collect_doctor_info()
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::{Duration, Instant};

    use recovereasy_core::{
        ChildEntry, EngineConfig, Handle, HealthStatus, MemoryProvider, NodeId, PendingWrite,
        ProgressPhase, ProviderError, RecoveryError, SourceStream, StorageProvider,
    };

    use super::{
        doctor, CopyRequest, RecoveryService, RemuxRequest, ScanRequest, SessionSnapshot,
        SessionStatus,
    };

    fn card() -> MemoryProvider {
        let provider = MemoryProvider::new();
        provider.add_dir("/out");
        provider.add_file("/card/DCIM/a.jpg", vec![0xff, 0xd8, 0xff, 0xd9]);
        provider.add_file("/card/DCIM/b.jpg", vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10]);
        provider.add_file("/card/DCIM/c.mp4", vec![0x42; 64]);
        provider
    }

    fn wait(service: &RecoveryService, session_id: &str) -> SessionSnapshot {
        let started = Instant::now();
        loop {
            let snapshot = service.get_session(session_id).expect("session exists");
            if snapshot.status.is_finished() {
                return snapshot;
            }
            assert!(started.elapsed() < Duration::from_secs(30), "session timed out");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn scan(service: &RecoveryService) -> SessionSnapshot {
        let session_id = service
            .start_scan(ScanRequest {
                root: Handle::new("/card"),
                session_id: None,
                max_depth: None,
                excludes: Vec::new(),
            })
            .expect("scan queued");
        wait(service, &session_id)
    }

    #[test]
    fn scan_then_copy_selected_entries() {
        let service = RecoveryService::new(Arc::new(card()), EngineConfig::default());
        let snapshot = scan(&service);
        assert_eq!(snapshot.status, SessionStatus::Completed);
        assert_eq!(snapshot.percent, 100);

        let catalog = service.current_catalog().expect("catalog installed");
        assert_eq!(catalog.generation, 1);
        assert_eq!(catalog.entries.len(), 3);
        assert_eq!(catalog.entries[1].status, HealthStatus::Suspect);

        let session_id = service
            .start_copy(CopyRequest {
                identifiers: vec![Handle::new("/card/DCIM/b.jpg"), Handle::new("/card/DCIM/a.jpg")],
                destination: Handle::new("/out"),
                generation: catalog.generation,
                session_id: Some("copy-1".to_string()),
                verify_digest: Some(true),
            })
            .expect("copy queued");
        assert_eq!(session_id, "copy-1");

        let snapshot = wait(&service, &session_id);
        assert_eq!(snapshot.status, SessionStatus::Completed);
        let report = snapshot.report.expect("report");
        let names = report
            .results
            .iter()
            .map(|result| result.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.jpg", "b.jpg"]);
        assert_eq!(report.succeeded(), 2);

        let events = service.poll_events(&session_id, 0).expect("events");
        assert_eq!(events.last().map(|e| e.phase.clone()), Some(ProgressPhase::Done));
        let later = service.poll_events(&session_id, 2).expect("events");
        assert!(later.iter().all(|event| event.seq > 2));
    }

    #[test]
    fn batches_against_an_old_catalog_are_rejected() {
        let service = RecoveryService::new(Arc::new(card()), EngineConfig::default());
        scan(&service);
        scan(&service);
        assert_eq!(service.current_generation(), 2);

        let err = service
            .start_remux(RemuxRequest {
                identifiers: vec![Handle::new("/card/DCIM/c.mp4")],
                destination: Handle::new("/out"),
                generation: 1,
                session_id: None,
            })
            .expect_err("stale");
        assert!(matches!(
            err.downcast_ref::<RecoveryError>(),
            Some(RecoveryError::StaleGeneration {
                requested: 1,
                current: 2
            })
        ));
    }

    #[test]
    fn unknown_identifiers_are_rejected() {
        let service = RecoveryService::new(Arc::new(card()), EngineConfig::default());
        scan(&service);
        let err = service
            .start_copy(CopyRequest {
                identifiers: vec![Handle::new("/card/DCIM/zzz.jpg")],
                destination: Handle::new("/out"),
                generation: 1,
                session_id: None,
                verify_digest: None,
            })
            .expect_err("unknown");
        assert!(err.to_string().contains("zzz.jpg"));
    }

    #[test]
    fn remux_failure_is_reported_per_entry() {
        let service = RecoveryService::new(Arc::new(card()), EngineConfig::default());
        scan(&service);
        let session_id = service
            .start_remux(RemuxRequest {
                identifiers: vec![Handle::new("/card/DCIM/c.mp4")],
                destination: Handle::new("/out"),
                generation: 1,
                session_id: None,
            })
            .expect("remux queued");
        let snapshot = wait(&service, &session_id);
        assert_eq!(snapshot.status, SessionStatus::Completed);
        let report = snapshot.report.expect("report");
        assert_eq!(report.failed(), 1);
    }

    /// Blocks the first listing until the test releases it.
    struct GatedProvider {
        inner: MemoryProvider,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl StorageProvider for GatedProvider {
        fn list_children(&self, dir: &Handle) -> Result<Vec<ChildEntry>, ProviderError> {
            let gate = self.gate.lock().ok().and_then(|mut gate| gate.take());
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
            self.inner.list_children(dir)
        }

        fn open_read(&self, handle: &Handle) -> Result<Box<dyn SourceStream>, ProviderError> {
            self.inner.open_read(handle)
        }

        fn open_write(
            &self,
            container: &Handle,
            name: &str,
        ) -> Result<Box<dyn PendingWrite>, ProviderError> {
            self.inner.open_write(container, name)
        }

        fn length(&self, handle: &Handle) -> Option<u64> {
            self.inner.length(handle)
        }

        fn delete(&self, handle: &Handle) -> Result<(), ProviderError> {
            self.inner.delete(handle)
        }

        fn child_exists(&self, container: &Handle, name: &str) -> bool {
            self.inner.child_exists(container, name)
        }

        fn is_writable_container(&self, handle: &Handle) -> bool {
            self.inner.is_writable_container(handle)
        }

        fn node_id(&self, handle: &Handle) -> Option<NodeId> {
            self.inner.node_id(handle)
        }
    }

    #[test]
    fn superseded_scan_does_not_install_its_catalog() {
        let (release, gate) = mpsc::channel();
        let provider = GatedProvider {
            inner: card(),
            gate: Mutex::new(Some(gate)),
        };
        let service = RecoveryService::new(Arc::new(provider), EngineConfig::default());
        let request = |id: &str| ScanRequest {
            root: Handle::new("/card"),
            session_id: Some(id.to_string()),
            max_depth: None,
            excludes: Vec::new(),
        };

        let first = service.start_scan(request("first")).expect("first");
        let second = service.start_scan(request("second")).expect("second");
        release.send(()).expect("release gate");

        assert_eq!(wait(&service, &first).status, SessionStatus::Stale);
        assert_eq!(wait(&service, &second).status, SessionStatus::Completed);
        let catalog = service.current_catalog().expect("catalog");
        assert_eq!(catalog.scan_id, "second");
        assert_eq!(catalog.generation, 2);
    }

    #[test]
    fn snapshot_serializes_with_snake_case_status() {
        let service = RecoveryService::new(Arc::new(card()), EngineConfig::default());
        let snapshot = scan(&service);
        let json = serde_json::to_value(&snapshot).expect("json");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["kind"], "scan");
        assert_eq!(json["catalog"]["generation"], 1);
    }

    #[test]
    fn cancel_unknown_session_fails() {
        let service = RecoveryService::new(Arc::new(card()), EngineConfig::default());
        assert!(service.cancel("missing").is_err());
    }

    #[test]
    fn doctor_returns_runtime_snapshot() {
        let info = doctor();
        assert!(!info.os.is_empty());
    }
}
