use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use tempfile::{tempdir, TempDir};

use modkeep_domain::{ContentManifest, GameProfile, ManifestId, WorkspaceState};

use crate::core::audit::{AuditLog, OperationKind};
use crate::core::cancel::{CancelToken, Cancelled};
use crate::core::pool::ManifestPool;
use crate::core::store::cas::{ContentStore, GcOutcome, GcStats, UntrackError, UntrackReport};

use super::events::{NotificationSink, NullSink, ReconciliationEvent};
use super::orchestrator::{ManifestRemover, Reconciler, ReplacementRequest, StoreLifecycle};
use super::service::{ProfileStore, ReconciliationService, ServiceReport};

fn manifest_id(raw: &str) -> ManifestId {
    ManifestId::from_str(raw).expect("valid manifest id")
}

fn manifest_with_oids(id: &str, oids: &[&str]) -> ContentManifest {
    let files = oids
        .iter()
        .enumerate()
        .map(|(index, oid)| {
            serde_json::json!({
                "path": format!("files/{index}.pak"),
                "size": 4,
                "source": "content-addressable",
                "oid": oid,
            })
        })
        .collect::<Vec<_>>();
    serde_json::from_value(serde_json::json!({
        "id": id,
        "title": "fixture",
        "publisher": "moddb",
        "game": "quake2",
        "version": "1.0",
        "files": files,
    }))
    .expect("fixture manifest parses")
}

#[derive(Default)]
struct CallLog(Mutex<Vec<String>>);

impl CallLog {
    fn push(&self, call: impl Into<String>) {
        self.0.lock().expect("call log lock").push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.0.lock().expect("call log lock").clone()
    }

    fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

struct MockService {
    log: Arc<CallLog>,
    report: ServiceReport,
}

impl ReconciliationService for MockService {
    fn reconcile_bulk_replacement(
        &self,
        _mapping: &IndexMap<ManifestId, ManifestId>,
    ) -> Result<ServiceReport> {
        self.log.push("service.bulk");
        Ok(self.report.clone())
    }

    fn reconcile_removal(&self, id: &ManifestId) -> Result<ServiceReport> {
        self.log.push(format!("service.remove {id}"));
        Ok(self.report.clone())
    }

    fn orchestrate_local_update(
        &self,
        old_id: &ManifestId,
        new_id: &ManifestId,
    ) -> Result<ServiceReport> {
        self.log.push(format!("service.update {old_id} -> {new_id}"));
        Ok(self.report.clone())
    }
}

struct MockLifecycle {
    log: Arc<CallLog>,
    untrack_errors: Vec<UntrackError>,
    untrack_shortfall: usize,
    fail_untrack_hard: bool,
    gc_stats: GcStats,
}

impl MockLifecycle {
    fn healthy(log: Arc<CallLog>) -> Self {
        Self {
            log,
            untrack_errors: Vec::new(),
            untrack_shortfall: 0,
            fail_untrack_hard: false,
            gc_stats: GcStats {
                scanned: 2,
                deleted: 1,
                bytes_freed: 64,
                errors: Vec::new(),
            },
        }
    }
}

impl StoreLifecycle for MockLifecycle {
    fn untrack_manifests(&self, ids: &[ManifestId]) -> Result<UntrackReport> {
        self.log.push("lifecycle.untrack");
        if self.fail_untrack_hard {
            return Err(anyhow!("store unavailable"));
        }
        let failed = self.untrack_errors.len() + self.untrack_shortfall;
        Ok(UntrackReport {
            untracked: ids.len().saturating_sub(failed),
            errors: self.untrack_errors.clone(),
        })
    }

    fn collect_garbage(&self, force: bool) -> Result<GcOutcome> {
        self.log.push(format!("lifecycle.gc force={force}"));
        Ok(GcOutcome::Completed(self.gc_stats.clone()))
    }
}

struct MockPool {
    log: Arc<CallLog>,
    cancel_on_first: Option<CancelToken>,
    removals: AtomicUsize,
}

impl MockPool {
    fn healthy(log: Arc<CallLog>) -> Self {
        Self {
            log,
            cancel_on_first: None,
            removals: AtomicUsize::new(0),
        }
    }
}

impl ManifestRemover for MockPool {
    fn remove_manifest(
        &self,
        id: &ManifestId,
        skip_untrack: bool,
        _token: &CancelToken,
    ) -> Result<()> {
        self.log
            .push(format!("pool.remove {id} skip_untrack={skip_untrack}"));
        if self.removals.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(token) = &self.cancel_on_first {
                token.cancel();
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ReconciliationEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<ReconciliationEvent> {
        self.events.lock().expect("event lock").clone()
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, event: &ReconciliationEvent) {
        self.events.lock().expect("event lock").push(event.clone());
    }
}

fn three_profiles_report() -> ServiceReport {
    ServiceReport {
        success: true,
        profiles_updated: 3,
        workspaces_invalidated: 2,
        profiles: vec!["alpha".into(), "beta".into(), "gamma".into()],
        first_error: None,
    }
}

fn mock_reconciler(
    service: MockService,
    lifecycle: MockLifecycle,
    pool: MockPool,
) -> Result<(TempDir, Reconciler, Arc<RecordingSink>)> {
    let temp = tempdir()?;
    let audit = AuditLog::new(temp.path().join("audit"))?;
    let sink = Arc::new(RecordingSink::default());
    let reconciler = Reconciler::new(
        Arc::new(service),
        Arc::new(pool),
        Arc::new(lifecycle),
        audit,
        sink.clone(),
    );
    Ok((temp, reconciler, sink))
}

fn replacement_request(old: &str, new: &str) -> ReplacementRequest {
    let mut mapping = IndexMap::new();
    mapping.insert(manifest_id(old), manifest_id(new));
    ReplacementRequest {
        mapping,
        remove_old_manifests: true,
        run_garbage_collection: true,
        source: "test".to_string(),
    }
}

#[test]
fn replacement_orders_untrack_before_removal_and_gc() -> Result<()> {
    let log = Arc::new(CallLog::default());
    let (temp, reconciler, sink) = mock_reconciler(
        MockService {
            log: log.clone(),
            report: three_profiles_report(),
        },
        MockLifecycle::healthy(log.clone()),
        MockPool::healthy(log.clone()),
    )?;

    let request = replacement_request("1.1.moddb.map.foo", "1.2.moddb.map.foo");
    let report = reconciler.execute_content_replacement(&request, &CancelToken::new())?;

    assert!(report.success);
    assert_eq!(report.data.profiles_updated, 3);
    assert_eq!(report.data.workspaces_invalidated, 2);
    assert_eq!(report.data.references_untracked, 1);
    assert_eq!(report.data.manifests_removed, 1);
    assert_eq!(report.data.cas_objects_collected, 1);

    let bulk = log.position("service.bulk").expect("profiles updated");
    let untrack = log.position("lifecycle.untrack").expect("refs untracked");
    let remove = log.position("pool.remove").expect("manifest removed");
    let gc = log.position("lifecycle.gc").expect("gc ran");
    assert!(bulk < untrack, "profiles must be repointed before untracking");
    assert!(untrack < remove, "untracking must precede manifest removal");
    assert!(remove < gc, "gc must run last");
    assert!(
        log.calls()[remove].ends_with("skip_untrack=true"),
        "removal must not repeat the bulk untrack"
    );

    let audit = AuditLog::new(temp.path().join("audit"))?;
    let entries = audit.recent(10)?;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].success);
    assert_eq!(entries[0].operation, OperationKind::ManifestReplacement);
    assert_eq!(
        entries[0].remapping.get("1.1.moddb.map.foo").map(String::as_str),
        Some("1.2.moddb.map.foo")
    );

    let events = sink.events();
    assert!(matches!(events.first(), Some(ReconciliationEvent::Started { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ReconciliationEvent::ContentRemoving { .. })));
    assert!(matches!(
        events.last(),
        Some(ReconciliationEvent::Completed { success: true, .. })
    ));
    Ok(())
}

#[test]
fn partial_untrack_failure_gates_removal_and_gc() -> Result<()> {
    let log = Arc::new(CallLog::default());
    let mut lifecycle = MockLifecycle::healthy(log.clone());
    lifecycle.untrack_errors = vec![UntrackError {
        manifest_id: "1.1.moddb.map.foo".to_string(),
        error: "simulated io fault".to_string(),
    }];
    let (temp, reconciler, _sink) = mock_reconciler(
        MockService {
            log: log.clone(),
            report: three_profiles_report(),
        },
        lifecycle,
        MockPool::healthy(log.clone()),
    )?;

    let request = replacement_request("1.1.moddb.map.foo", "1.2.moddb.map.foo");
    let report = reconciler.execute_content_replacement(&request, &CancelToken::new())?;

    assert!(!report.success);
    assert_eq!(report.data.manifests_removed, 0);
    assert_eq!(report.data.cas_objects_collected, 0);
    assert_eq!(
        report.data.profiles_updated, 3,
        "failure results still carry the partial progress"
    );
    assert_eq!(log.count("pool.remove"), 0, "removal must be skipped");
    assert_eq!(log.count("lifecycle.gc"), 0, "gc must be skipped");

    let audit = AuditLog::new(temp.path().join("audit"))?;
    let entries = audit.recent(10)?;
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].success);
    assert!(entries[0].error.as_deref().is_some_and(|e| e.contains("simulated io fault")));
    Ok(())
}

#[test]
fn untrack_shortfall_without_errors_still_gates() -> Result<()> {
    let log = Arc::new(CallLog::default());
    let mut lifecycle = MockLifecycle::healthy(log.clone());
    lifecycle.untrack_shortfall = 1;
    let (_temp, reconciler, _sink) = mock_reconciler(
        MockService {
            log: log.clone(),
            report: three_profiles_report(),
        },
        lifecycle,
        MockPool::healthy(log.clone()),
    )?;

    let request = replacement_request("1.1.moddb.map.foo", "1.2.moddb.map.foo");
    let report = reconciler.execute_content_replacement(&request, &CancelToken::new())?;

    assert!(!report.success);
    assert_eq!(log.count("pool.remove"), 0);
    assert_eq!(log.count("lifecycle.gc"), 0);
    assert!(report
        .first_error()
        .is_some_and(|e| e.contains("untracked 0 of 1")));
    Ok(())
}

#[test]
fn hard_untrack_failure_is_systemic() -> Result<()> {
    let log = Arc::new(CallLog::default());
    let mut lifecycle = MockLifecycle::healthy(log.clone());
    lifecycle.fail_untrack_hard = true;
    let (_temp, reconciler, _sink) = mock_reconciler(
        MockService {
            log: log.clone(),
            report: three_profiles_report(),
        },
        lifecycle,
        MockPool::healthy(log.clone()),
    )?;

    let request = replacement_request("1.1.moddb.map.foo", "1.2.moddb.map.foo");
    let report = reconciler.execute_content_replacement(&request, &CancelToken::new())?;

    assert!(!report.success);
    assert!(report
        .first_error()
        .is_some_and(|e| e.contains("store unavailable")));
    assert_eq!(log.count("pool.remove"), 0);
    assert_eq!(log.count("lifecycle.gc"), 0);
    Ok(())
}

#[test]
fn cancellation_mid_removal_propagates_without_an_audit_entry() -> Result<()> {
    let log = Arc::new(CallLog::default());
    let token = CancelToken::new();
    let pool = MockPool {
        log: log.clone(),
        cancel_on_first: Some(token.clone()),
        removals: AtomicUsize::new(0),
    };
    let (temp, reconciler, _sink) = mock_reconciler(
        MockService {
            log: log.clone(),
            report: three_profiles_report(),
        },
        MockLifecycle::healthy(log.clone()),
        pool,
    )?;

    let ids = vec![
        manifest_id("1.1.moddb.map.foo"),
        manifest_id("1.0.nexus.mod.bar"),
        manifest_id("1.3.moddb.patch.baz"),
    ];
    let err = reconciler
        .execute_content_removal(&ids, &token)
        .unwrap_err();
    assert!(err.is::<Cancelled>(), "cancellation must propagate as-is");

    assert_eq!(
        log.count("pool.remove"),
        1,
        "no further ids may be processed after cancellation"
    );
    assert_eq!(log.count("lifecycle.gc"), 0);

    let audit = AuditLog::new(temp.path().join("audit"))?;
    assert!(
        audit.recent(10)?.is_empty(),
        "cancellation is not a failure outcome and must not be audited"
    );
    Ok(())
}

#[test]
fn update_wraps_the_combined_service_call() -> Result<()> {
    let log = Arc::new(CallLog::default());
    let (temp, reconciler, sink) = mock_reconciler(
        MockService {
            log: log.clone(),
            report: three_profiles_report(),
        },
        MockLifecycle::healthy(log.clone()),
        MockPool::healthy(log.clone()),
    )?;

    let old_id = manifest_id("1.1.moddb.map.foo");
    let new_manifest = manifest_with_oids("1.2.moddb.map.foo", &[]);
    let report =
        reconciler.execute_content_update(&old_id, &new_manifest, &CancelToken::new())?;

    assert!(report.success);
    assert_eq!(report.data.profiles_updated, 3);
    assert_eq!(log.count("service.update"), 1);
    assert_eq!(log.count("lifecycle.untrack"), 0, "update decomposes nothing");

    let audit = AuditLog::new(temp.path().join("audit"))?;
    let entries = audit.recent(10)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, OperationKind::LocalContentUpdate);
    assert_eq!(
        entries[0].remapping.get("1.1.moddb.map.foo").map(String::as_str),
        Some("1.2.moddb.map.foo")
    );
    assert!(matches!(
        sink.events().last(),
        Some(ReconciliationEvent::Completed { success: true, .. })
    ));
    Ok(())
}

// End-to-end against real components in a temporary home.
fn real_home() -> Result<(TempDir, ContentStore, ManifestPool, ProfileStore)> {
    let temp = tempdir()?;
    let store = ContentStore::with_policy(
        Some(temp.path().join("store")),
        Duration::ZERO,
        Duration::ZERO,
    )?;
    let pool = ManifestPool::new(temp.path().join("manifests"), store.clone())?;
    let profiles = ProfileStore::new(temp.path().join("profiles"), store.clone())?;
    Ok((temp, store, pool, profiles))
}

fn seed_profiles(profiles: &ProfileStore, names: &[&str], id: &ManifestId) -> Result<()> {
    for name in names {
        let mut profile = GameProfile::new(*name, "quake2");
        profile.manifests.push(id.clone());
        profile.workspace = Some(WorkspaceState {
            id: format!("ws-{name}"),
            synced_at: 0,
        });
        profiles.save(&profile)?;
    }
    Ok(())
}

#[test]
fn replacement_scenario_collects_the_orphaned_object() -> Result<()> {
    let (temp, store, pool, profiles) = real_home()?;
    let old_blob = store.put(b"old map bytes")?;
    let new_blob = store.put(b"new map bytes")?;
    let old_manifest = manifest_with_oids("1.1.moddb.map.foo", &[&old_blob.oid]);
    let new_manifest = manifest_with_oids("1.2.moddb.map.foo", &[&new_blob.oid]);
    pool.add(&old_manifest)?;
    pool.add(&new_manifest)?;
    seed_profiles(&profiles, &["alpha", "beta", "gamma"], &old_manifest.id)?;

    let audit = AuditLog::new(temp.path().join("audit"))?;
    let reconciler = Reconciler::new(
        Arc::new(profiles.clone()),
        Arc::new(pool.clone()),
        Arc::new(store.clone()),
        audit,
        Arc::new(NullSink),
    );
    let request = replacement_request("1.1.moddb.map.foo", "1.2.moddb.map.foo");
    let report = reconciler.execute_content_replacement(&request, &CancelToken::new())?;

    assert!(report.success, "errors: {:?}", report.errors);
    assert_eq!(report.data.profiles_updated, 3);
    assert_eq!(report.data.manifests_removed, 1);
    assert!(report.data.cas_objects_collected >= 1);
    assert!(!store.contains(&old_blob.oid), "orphaned object is collected");
    assert!(store.contains(&new_blob.oid), "live object survives");
    assert!(!pool.contains(&old_manifest.id));
    assert!(pool.contains(&new_manifest.id));

    for name in ["alpha", "beta", "gamma"] {
        let profile = profiles.load(name)?.expect("profile exists");
        assert!(profile.references(&new_manifest.id));
        assert!(!profile.references(&old_manifest.id));
        assert!(profile.workspace.is_none(), "workspace is invalidated");
    }

    let audit = AuditLog::new(temp.path().join("audit"))?;
    let entries = audit.recent(10)?;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].success);
    Ok(())
}

struct FailingUntrack {
    store: ContentStore,
}

impl StoreLifecycle for FailingUntrack {
    fn untrack_manifests(&self, _ids: &[ManifestId]) -> Result<UntrackReport> {
        Err(anyhow!("simulated untrack fault"))
    }

    fn collect_garbage(&self, force: bool) -> Result<GcOutcome> {
        self.store.collect_garbage(force)
    }
}

#[test]
fn replacement_scenario_with_untrack_fault_deletes_nothing() -> Result<()> {
    let (temp, store, pool, profiles) = real_home()?;
    let old_blob = store.put(b"old map bytes")?;
    let old_manifest = manifest_with_oids("1.1.moddb.map.foo", &[&old_blob.oid]);
    pool.add(&old_manifest)?;
    seed_profiles(&profiles, &["alpha", "beta", "gamma"], &old_manifest.id)?;

    let audit = AuditLog::new(temp.path().join("audit"))?;
    let reconciler = Reconciler::new(
        Arc::new(profiles),
        Arc::new(pool.clone()),
        Arc::new(FailingUntrack {
            store: store.clone(),
        }),
        audit,
        Arc::new(NullSink),
    );
    let request = replacement_request("1.1.moddb.map.foo", "1.2.moddb.map.foo");
    let report = reconciler.execute_content_replacement(&request, &CancelToken::new())?;

    assert!(!report.success);
    assert_eq!(report.data.manifests_removed, 0);
    assert_eq!(report.data.cas_objects_collected, 0);
    assert_eq!(report.data.profiles_updated, 3);
    assert!(store.contains(&old_blob.oid), "no CAS object may be deleted");
    assert!(pool.contains(&old_manifest.id), "descriptor remains in place");

    let audit = AuditLog::new(temp.path().join("audit"))?;
    let entries = audit.recent(10)?;
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].success);
    assert!(entries[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("simulated untrack fault")));
    Ok(())
}
