pub mod batch;
pub mod classify;
pub mod config;
pub mod copy;
pub mod doctor;
pub mod error;
pub mod health;
pub mod media;
pub mod model;
pub mod provider;
pub mod remux;
pub mod scan;
pub mod walk;

pub use batch::{percent, run_copy_batch, run_remux_batch, BatchControl};
pub use classify::{classify, guess_content_type, Classification};
pub use config::{CopyOptions, EngineConfig, HealthPolicy, WalkOptions};
pub use copy::copy_entry;
pub use doctor::{collect_doctor_info, DoctorInfo, VolumeInfo};
pub use error::{ProviderError, RecoveryError};
pub use health::{check, diagnose, Diagnosis, MediaFormat};
pub use model::{
    BatchKind, BatchReport, Catalog, CatalogSummary, CopyResult, Entry, EntryResult,
    FailureReason, Handle, HealthStatus, MediaKind, ProgressEvent, ProgressPhase, RemuxResult,
    RepairMethod, CATALOG_VERSION,
};
pub use provider::{
    ChildEntry, LocalFsProvider, MemoryProvider, NodeId, PendingWrite, SourceStream,
    StorageProvider,
};
pub use remux::{remux_entry, repaired_name};
pub use scan::{run_scan, run_scan_with_callback, run_scan_with_events, ScanRunOutput};
pub use walk::{TreeWalker, WalkSummary, WalkedFile};
