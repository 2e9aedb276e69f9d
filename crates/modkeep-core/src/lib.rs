#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

mod core;

pub use crate::core::audit::{AuditEntry, AuditLog, OperationKind};
pub use crate::core::cancel::{CancelToken, Cancelled};
pub use crate::core::config::Config;
pub use crate::core::pool::ManifestPool;
pub use crate::core::reconcile::{
    ContentChangeOutcome, FanoutSink, LocalUpdateOutcome, ManifestRemover, NotificationSink,
    NullSink, OperationReport, ProfileStore, Reconciler, ReconciliationEvent,
    ReconciliationService, ReplacementRequest, ServiceReport, StoreLifecycle,
};
pub use crate::core::store::cas::{
    ContentStore, GcObjectError, GcOutcome, GcStats, ObjectInfo, OwnerId, OwnerKind, StoreError,
    StoredBlob, UntrackError, UntrackReport,
};
