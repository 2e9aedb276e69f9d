// Reference tracking: which owners still need a given CAS object.
use std::collections::HashSet;

use rusqlite::params;
use tracing::debug;

use modkeep_domain::ContentManifest;

use super::*;

impl ContentStore {
    /// Record a reference from `manifest` to every content-addressable file
    /// it carries. Re-tracking the same manifest is a no-op.
    pub fn track_manifest(&self, manifest: &ContentManifest) -> Result<usize> {
        let owner = OwnerId::manifest(&manifest.id);
        let oids: Vec<String> = manifest
            .cas_oids()
            .into_iter()
            .map(ToString::to_string)
            .collect();
        self.track_owner(&owner, &oids)
    }

    /// Record a reference from a materialized workspace to each oid.
    pub fn track_workspace(&self, workspace_id: &str, oids: &[String]) -> Result<usize> {
        self.track_owner(&OwnerId::workspace(workspace_id), oids)
    }

    fn track_owner(&self, owner: &OwnerId, oids: &[String]) -> Result<usize> {
        self.ensure_layout()?;
        let tracked = self.with_immediate_tx(|tx| {
            for oid in oids {
                self.assert_object_known(tx, oid)?;
                tx.execute(
                    "INSERT OR IGNORE INTO refs(owner_kind, owner_id, oid) VALUES (?1, ?2, ?3)",
                    params![owner.kind.as_str(), owner.id, oid],
                )?;
            }
            Ok(oids.len())
        })?;
        debug!(owner = %owner.id, kind = %owner.kind.as_str(), refs = tracked, "refs tracked");
        Ok(tracked)
    }

    /// Remove every reference owned by `id`. Deleting zero rows is success:
    /// the records may already be gone.
    pub fn untrack_manifest(&self, id: &ManifestId) -> Result<u64> {
        self.untrack_owner(&OwnerId::manifest(id))
    }

    /// Remove every reference owned by a workspace.
    pub fn untrack_workspace(&self, workspace_id: &str) -> Result<u64> {
        self.untrack_owner(&OwnerId::workspace(workspace_id))
    }

    fn untrack_owner(&self, owner: &OwnerId) -> Result<u64> {
        self.ensure_layout()?;
        let removed = self.with_immediate_tx(|tx| {
            let removed = tx.execute(
                "DELETE FROM refs WHERE owner_kind=?1 AND owner_id=?2",
                params![owner.kind.as_str(), owner.id],
            )?;
            Ok(removed as u64)
        })?;
        debug!(owner = %owner.id, kind = %owner.kind.as_str(), removed, "refs untracked");
        Ok(removed)
    }

    /// Bulk-untrack a set of manifests. Completing the loop is success even
    /// when individual manifests fail; only a store-level fault is an `Err`.
    pub fn untrack_manifests(&self, ids: &[ManifestId]) -> Result<UntrackReport> {
        self.ensure_layout()?;
        let mut report = UntrackReport::default();
        for id in ids {
            match self.untrack_manifest(id) {
                Ok(_) => report.untracked += 1,
                Err(err) => report.errors.push(UntrackError {
                    manifest_id: id.to_string(),
                    error: format!("{err:#}"),
                }),
            }
        }
        debug!(
            requested = ids.len(),
            untracked = report.untracked,
            failed = report.errors.len(),
            "bulk untrack complete"
        );
        Ok(report)
    }

    /// The full live set: every oid with at least one reference record.
    pub fn referenced_oids(&self) -> Result<HashSet<String>> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        self.referenced_oids_with_conn(&conn)
    }

    pub(super) fn referenced_oids_with_conn(
        &self,
        conn: &rusqlite::Connection,
    ) -> Result<HashSet<String>> {
        let mut stmt = conn.prepare("SELECT DISTINCT oid FROM refs")?;
        let mut rows = stmt.query([])?;
        let mut live = HashSet::new();
        while let Some(row) = rows.next()? {
            live.insert(row.get::<_, String>(0)?);
        }
        Ok(live)
    }

    /// List all owners referencing a given oid.
    pub fn refs_for(&self, oid: &str) -> Result<Vec<OwnerId>> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT owner_kind, owner_id FROM refs WHERE oid = ?1")?;
        let mut rows = stmt.query(params![oid])?;
        let mut owners = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let id: String = row.get(1)?;
            owners.push(OwnerId {
                kind: OwnerKind::try_from(kind.as_str())?,
                id,
            });
        }
        Ok(owners)
    }
}
