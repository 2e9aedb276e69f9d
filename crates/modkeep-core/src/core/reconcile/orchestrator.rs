// Sequencing of composite content operations. The ordering is the
// correctness mechanism: consumers are updated before references are
// untracked, references before descriptors are removed, and the sweep runs
// last. An object must never look unreferenced while something still needs
// it.
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Instant,
};

use anyhow::Result;
use indexmap::IndexMap;
use rand::Rng;
use time::OffsetDateTime;
use tracing::warn;

use modkeep_domain::{ContentManifest, ManifestId};

use crate::core::audit::{AuditEntry, AuditLog, OperationKind};
use crate::core::cancel::{CancelToken, Cancelled};
use crate::core::pool::ManifestPool;
use crate::core::store::cas::{ContentStore, GcOutcome, UntrackReport};

use super::events::{NotificationSink, ReconciliationEvent};
use super::service::{ReconciliationService, ServiceReport};

/// Port for the store-side lifecycle operations the orchestrator drives.
pub trait StoreLifecycle: Send + Sync {
    fn untrack_manifests(&self, ids: &[ManifestId]) -> Result<UntrackReport>;
    fn collect_garbage(&self, force: bool) -> Result<GcOutcome>;
}

impl StoreLifecycle for ContentStore {
    fn untrack_manifests(&self, ids: &[ManifestId]) -> Result<UntrackReport> {
        Self::untrack_manifests(self, ids)
    }

    fn collect_garbage(&self, force: bool) -> Result<GcOutcome> {
        Self::collect_garbage(self, force)
    }
}

/// Port for the manifest pool's removal path.
pub trait ManifestRemover: Send + Sync {
    fn remove_manifest(
        &self,
        id: &ManifestId,
        skip_untrack: bool,
        token: &CancelToken,
    ) -> Result<()>;
}

impl ManifestRemover for ManifestPool {
    fn remove_manifest(
        &self,
        id: &ManifestId,
        skip_untrack: bool,
        token: &CancelToken,
    ) -> Result<()> {
        self.remove(id, skip_untrack, token)
    }
}

/// Result of one composite operation. Failures still carry the partial
/// counts so callers can render what did happen.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationReport<T> {
    pub success: bool,
    pub data: T,
    pub errors: Vec<String>,
}

impl<T> OperationReport<T> {
    #[must_use]
    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }
}

/// Counts accumulated by the replacement and removal pipelines.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentChangeOutcome {
    pub profiles_updated: usize,
    pub workspaces_invalidated: usize,
    pub references_untracked: usize,
    pub manifests_removed: usize,
    pub cas_objects_collected: usize,
    pub cas_bytes_freed: u64,
}

/// Counts for a single local manifest update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalUpdateOutcome {
    pub profiles_updated: usize,
    pub workspaces_invalidated: usize,
}

/// Parameters for a bulk content replacement.
#[derive(Clone, Debug)]
pub struct ReplacementRequest {
    /// Old manifest id → replacement manifest id, in request order.
    pub mapping: IndexMap<ManifestId, ManifestId>,
    pub remove_old_manifests: bool,
    pub run_garbage_collection: bool,
    /// Free-form origin tag recorded in the audit metrics.
    pub source: String,
}

#[derive(Default)]
struct PipelineState {
    outcome: ContentChangeOutcome,
    profiles: Vec<String>,
    errors: Vec<String>,
    critical: bool,
}

impl PipelineState {
    /// Record an error that gates the remaining pipeline steps.
    fn flag(&mut self, error: String) {
        self.errors.push(error);
        self.critical = true;
    }
}

/// Coordinates profile reconciliation, reference untracking, manifest
/// removal, and garbage collection for the three composite operations.
pub struct Reconciler {
    service: Arc<dyn ReconciliationService>,
    pool: Arc<dyn ManifestRemover>,
    lifecycle: Arc<dyn StoreLifecycle>,
    audit: AuditLog,
    events: Arc<dyn NotificationSink>,
}

impl Reconciler {
    pub fn new(
        service: Arc<dyn ReconciliationService>,
        pool: Arc<dyn ManifestRemover>,
        lifecycle: Arc<dyn StoreLifecycle>,
        audit: AuditLog,
        events: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            service,
            pool,
            lifecycle,
            audit,
            events,
        }
    }

    /// Replace old manifests with their successors: repoint profiles, then
    /// (optionally) untrack and remove the old manifests, then (optionally)
    /// collect garbage. Cancellation propagates; every other outcome ends
    /// with an audit entry and a completion event.
    pub fn execute_content_replacement(
        &self,
        request: &ReplacementRequest,
        token: &CancelToken,
    ) -> Result<OperationReport<ContentChangeOutcome>> {
        let operation_id = operation_id();
        let started = Instant::now();
        let timestamp = OffsetDateTime::now_utc();
        let old_ids: Vec<ManifestId> = request.mapping.keys().cloned().collect();
        self.events.publish(&ReconciliationEvent::Started {
            operation: OperationKind::ManifestReplacement,
            manifests: old_ids.clone(),
        });

        let mut state = PipelineState::default();
        if let Err(err) = self.replacement_pipeline(request, token, &mut state) {
            if err.is::<Cancelled>() {
                return Err(err);
            }
            state.flag(format!("{err:#}"));
        }

        let success = !state.critical;
        let mut remapping = BTreeMap::new();
        for (old, new) in &request.mapping {
            remapping.insert(old.to_string(), new.to_string());
        }
        let mut metrics = change_metrics(&state.outcome);
        metrics.insert(
            "source".to_string(),
            serde_json::Value::from(request.source.as_str()),
        );
        if !state.errors.is_empty() {
            metrics.insert(
                "warnings".to_string(),
                serde_json::Value::from(state.errors.clone()),
            );
        }
        let entry = AuditEntry {
            operation_id: operation_id.clone(),
            operation: OperationKind::ManifestReplacement,
            timestamp,
            success,
            error: (!success).then(|| state.errors.first().cloned()).flatten(),
            affected_manifests: old_ids.iter().map(ToString::to_string).collect(),
            remapping,
            profiles: dedup_preserving(state.profiles),
            duration_ms: duration_ms(started),
            metrics,
        };
        self.finish(OperationKind::ManifestReplacement, operation_id, success, &entry);
        Ok(OperationReport {
            success,
            data: state.outcome,
            errors: state.errors,
        })
    }

    /// Remove manifests outright: per-id profile reconciliation, bulk
    /// untrack, per-id descriptor removal, then garbage collection.
    pub fn execute_content_removal(
        &self,
        ids: &[ManifestId],
        token: &CancelToken,
    ) -> Result<OperationReport<ContentChangeOutcome>> {
        let operation_id = operation_id();
        let started = Instant::now();
        let timestamp = OffsetDateTime::now_utc();
        self.events.publish(&ReconciliationEvent::Started {
            operation: OperationKind::ManifestRemoval,
            manifests: ids.to_vec(),
        });

        let mut state = PipelineState::default();
        if let Err(err) = self.removal_pipeline(ids, token, &mut state) {
            if err.is::<Cancelled>() {
                return Err(err);
            }
            state.flag(format!("{err:#}"));
        }

        let success = !state.critical;
        let mut metrics = change_metrics(&state.outcome);
        if !state.errors.is_empty() {
            metrics.insert(
                "warnings".to_string(),
                serde_json::Value::from(state.errors.clone()),
            );
        }
        let entry = AuditEntry {
            operation_id: operation_id.clone(),
            operation: OperationKind::ManifestRemoval,
            timestamp,
            success,
            error: (!success).then(|| state.errors.first().cloned()).flatten(),
            affected_manifests: ids.iter().map(ToString::to_string).collect(),
            remapping: BTreeMap::new(),
            profiles: dedup_preserving(state.profiles),
            duration_ms: duration_ms(started),
            metrics,
        };
        self.finish(OperationKind::ManifestRemoval, operation_id, success, &entry);
        Ok(OperationReport {
            success,
            data: state.outcome,
            errors: state.errors,
        })
    }

    /// Swap one manifest for another in place: a single combined service
    /// call, wrapped with the same audit and notification envelope.
    pub fn execute_content_update(
        &self,
        old_id: &ManifestId,
        new_manifest: &ContentManifest,
        token: &CancelToken,
    ) -> Result<OperationReport<LocalUpdateOutcome>> {
        let operation_id = operation_id();
        let started = Instant::now();
        let timestamp = OffsetDateTime::now_utc();
        let new_id = new_manifest.id.clone();
        self.events.publish(&ReconciliationEvent::Started {
            operation: OperationKind::LocalContentUpdate,
            manifests: vec![old_id.clone(), new_id.clone()],
        });

        let mut outcome = LocalUpdateOutcome::default();
        let mut profiles = Vec::new();
        let mut errors = Vec::new();
        let mut success = true;
        token.checkpoint()?;
        match self.service.orchestrate_local_update(old_id, &new_id) {
            Ok(report) => {
                outcome.profiles_updated = report.profiles_updated;
                outcome.workspaces_invalidated = report.workspaces_invalidated;
                profiles = report.profiles;
                if !report.success {
                    success = false;
                    errors.push(report.first_error.unwrap_or_else(|| {
                        "profile reconciliation reported failure".to_string()
                    }));
                }
            }
            Err(err) if err.is::<Cancelled>() => return Err(err),
            Err(err) => {
                success = false;
                errors.push(format!("local update failed: {err:#}"));
            }
        }

        let mut remapping = BTreeMap::new();
        remapping.insert(old_id.to_string(), new_id.to_string());
        let metrics = BTreeMap::from([
            (
                "profilesUpdated".to_string(),
                serde_json::Value::from(outcome.profiles_updated as u64),
            ),
            (
                "workspacesInvalidated".to_string(),
                serde_json::Value::from(outcome.workspaces_invalidated as u64),
            ),
        ]);
        let entry = AuditEntry {
            operation_id: operation_id.clone(),
            operation: OperationKind::LocalContentUpdate,
            timestamp,
            success,
            error: (!success).then(|| errors.first().cloned()).flatten(),
            affected_manifests: vec![old_id.to_string(), new_id.to_string()],
            remapping,
            profiles: dedup_preserving(profiles),
            duration_ms: duration_ms(started),
            metrics,
        };
        self.finish(OperationKind::LocalContentUpdate, operation_id, success, &entry);
        Ok(OperationReport {
            success,
            data: outcome,
            errors,
        })
    }

    fn replacement_pipeline(
        &self,
        request: &ReplacementRequest,
        token: &CancelToken,
        state: &mut PipelineState,
    ) -> Result<()> {
        // Step 1: repoint every profile from old ids to new ones.
        token.checkpoint()?;
        match self.service.reconcile_bulk_replacement(&request.mapping) {
            Ok(report) => absorb_service_report(report, state),
            Err(err) => state.flag(format!("bulk profile reconciliation failed: {err:#}")),
        }

        if request.remove_old_manifests {
            // Step 2: untrack runs even after a profile failure; partial
            // cleanup beats none. Later steps stay gated on the flag.
            token.checkpoint()?;
            let old_ids: Vec<ManifestId> = request.mapping.keys().cloned().collect();
            let untrack_clean = self.untrack_step(&old_ids, state);
            // Step 3: descriptor removal requires a clean pipeline so far.
            if !state.critical {
                self.removal_step(request.mapping.keys(), untrack_clean, token, state)?;
            }
        }

        // Step 4: sweeping after a failed removal could destroy objects whose
        // references were never untracked.
        if request.run_garbage_collection && !state.critical {
            token.checkpoint()?;
            self.gc_step(state);
        }
        Ok(())
    }

    fn removal_pipeline(
        &self,
        ids: &[ManifestId],
        token: &CancelToken,
        state: &mut PipelineState,
    ) -> Result<()> {
        for id in ids {
            token.checkpoint()?;
            match self.service.reconcile_removal(id) {
                Ok(report) => absorb_service_report(report, state),
                Err(err) => {
                    state.flag(format!("profile reconciliation for {id} failed: {err:#}"));
                }
            }
        }

        token.checkpoint()?;
        let untrack_clean = self.untrack_step(ids, state);
        if !state.critical {
            self.removal_step(ids.iter(), untrack_clean, token, state)?;
        }
        if !state.critical {
            token.checkpoint()?;
            self.gc_step(state);
        }
        Ok(())
    }

    /// Bulk-untrack, folding the structured report into the pipeline state.
    /// Returns whether every requested manifest was untracked, which is the
    /// only condition under which removal may skip its own untracking.
    fn untrack_step(&self, ids: &[ManifestId], state: &mut PipelineState) -> bool {
        match self.lifecycle.untrack_manifests(ids) {
            Ok(report) => {
                state.outcome.references_untracked += report.untracked;
                let clean = report.errors.is_empty() && report.untracked == ids.len();
                if !clean {
                    for item in &report.errors {
                        state
                            .errors
                            .push(format!("untrack {}: {}", item.manifest_id, item.error));
                    }
                    if report.errors.is_empty() {
                        state.errors.push(format!(
                            "untracked {} of {} manifests",
                            report.untracked,
                            ids.len()
                        ));
                    }
                    state.critical = true;
                }
                clean
            }
            Err(err) => {
                state.flag(format!("bulk untracking failed: {err:#}"));
                false
            }
        }
    }

    fn removal_step<'a>(
        &self,
        ids: impl Iterator<Item = &'a ManifestId>,
        untrack_clean: bool,
        token: &CancelToken,
        state: &mut PipelineState,
    ) -> Result<()> {
        for id in ids {
            token.checkpoint()?;
            self.events.publish(&ReconciliationEvent::ContentRemoving {
                manifest: id.clone(),
            });
            match self.pool.remove_manifest(id, untrack_clean, token) {
                Ok(()) => state.outcome.manifests_removed += 1,
                Err(err) if err.is::<Cancelled>() => return Err(err),
                // Keep attempting the remaining ids; cleanup is best effort.
                Err(err) => state.flag(format!("failed to remove manifest {id}: {err:#}")),
            }
        }
        Ok(())
    }

    fn gc_step(&self, state: &mut PipelineState) {
        match self.lifecycle.collect_garbage(false) {
            Ok(GcOutcome::Completed(stats)) => {
                state.outcome.cas_objects_collected = stats.deleted;
                state.outcome.cas_bytes_freed = stats.bytes_freed;
                // Per-object sweep errors are warnings; the pass completed.
                for item in &stats.errors {
                    state.errors.push(format!("gc {}: {}", item.oid, item.error));
                }
            }
            Ok(GcOutcome::Throttled) => state
                .errors
                .push("garbage collection throttled by cooldown".to_string()),
            Ok(GcOutcome::Busy) => state
                .errors
                .push("garbage collection already running".to_string()),
            Err(err) => state.flag(format!("garbage collection failed: {err:#}")),
        }
    }

    fn finish(
        &self,
        operation: OperationKind,
        operation_id: String,
        success: bool,
        entry: &AuditEntry,
    ) {
        if let Err(err) = self.audit.append(entry) {
            warn!(%err, "failed to append audit entry");
        }
        self.events.publish(&ReconciliationEvent::Completed {
            operation,
            operation_id,
            success,
        });
    }
}

fn absorb_service_report(report: ServiceReport, state: &mut PipelineState) {
    state.outcome.profiles_updated += report.profiles_updated;
    state.outcome.workspaces_invalidated += report.workspaces_invalidated;
    state.profiles.extend(report.profiles);
    if !report.success {
        state.flag(
            report
                .first_error
                .unwrap_or_else(|| "profile reconciliation reported failure".to_string()),
        );
    }
}

fn change_metrics(outcome: &ContentChangeOutcome) -> BTreeMap<String, serde_json::Value> {
    BTreeMap::from([
        (
            "profilesUpdated".to_string(),
            serde_json::Value::from(outcome.profiles_updated as u64),
        ),
        (
            "workspacesInvalidated".to_string(),
            serde_json::Value::from(outcome.workspaces_invalidated as u64),
        ),
        (
            "referencesUntracked".to_string(),
            serde_json::Value::from(outcome.references_untracked as u64),
        ),
        (
            "manifestsRemoved".to_string(),
            serde_json::Value::from(outcome.manifests_removed as u64),
        ),
        (
            "casObjectsCollected".to_string(),
            serde_json::Value::from(outcome.cas_objects_collected as u64),
        ),
        (
            "casBytesFreed".to_string(),
            serde_json::Value::from(outcome.cas_bytes_freed),
        ),
    ])
}

fn dedup_preserving(profiles: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    profiles
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

fn operation_id() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 8]>())
}

fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
