pub mod service;

pub use service::{
    cancel, current_catalog, doctor, get_session, poll_events, start_copy, start_remux,
    start_scan, CancelResponse, CopyRequest, RecoveryService, RemuxRequest, ScanRequest,
    SessionKind, SessionSnapshot, SessionStatus,
};
