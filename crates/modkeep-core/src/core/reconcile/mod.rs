//! Keeping profiles, manifests, and the content store consistent when
//! content is replaced, removed, or updated.

pub mod events;
mod orchestrator;
mod service;

#[cfg(test)]
mod tests;

pub use events::{FanoutSink, NotificationSink, NullSink, ReconciliationEvent};
pub use orchestrator::{
    ContentChangeOutcome, LocalUpdateOutcome, ManifestRemover, OperationReport, Reconciler,
    ReplacementRequest, StoreLifecycle,
};
pub use service::{ProfileStore, ReconciliationService, ServiceReport};
