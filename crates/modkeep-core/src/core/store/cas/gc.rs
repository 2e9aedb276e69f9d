// Mark-and-sweep lifecycle pass over the object store.
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use super::*;

impl ContentStore {
    /// Run one garbage-collection pass. Passes are mutually exclusive per
    /// store; a request while one is running returns [`GcOutcome::Busy`], and
    /// a non-forced request within the cooldown window returns
    /// [`GcOutcome::Throttled`].
    pub fn collect_garbage(&self, force: bool) -> Result<GcOutcome> {
        {
            let mut state = self.gc_state();
            if state.phase != GcPhase::Idle {
                debug!("gc pass already running, skipping");
                return Ok(GcOutcome::Busy);
            }
            if !force {
                if let Some(completed) = state.last_completed {
                    if completed.elapsed() < self.gc_cooldown {
                        debug!("gc pass inside cooldown window, skipping");
                        return Ok(GcOutcome::Throttled);
                    }
                }
            }
            state.phase = GcPhase::Scanning;
        }

        let result = self.run_pass();
        let mut state = self.gc_state();
        state.phase = GcPhase::Idle;
        if result.is_ok() {
            state.last_completed = Some(Instant::now());
        }
        result.map(GcOutcome::Completed)
    }

    fn run_pass(&self) -> Result<GcStats> {
        self.ensure_layout()?;
        let mut conn = self.connection()?;

        // Scanning: a failure to enumerate the store aborts the whole pass.
        let rows = self
            .scan_objects(&conn)
            .context("failed to enumerate CAS objects")?;

        self.set_phase(GcPhase::Marking);
        let live = self.referenced_oids_with_conn(&conn)?;
        let cutoff = timestamp_secs().saturating_sub(self.gc_grace.as_secs());

        self.set_phase(GcPhase::Sweeping);
        let mut stats = GcStats::default();
        for (oid, size, created_at) in rows {
            stats.scanned += 1;
            if live.contains(&oid) || created_at > cutoff {
                continue;
            }
            let Some(_lock) = self.try_lock_for_gc(&oid)? else {
                // Another process is using the object; leave it for later.
                continue;
            };
            match self.delete_if_unreferenced(&mut conn, &oid) {
                Ok(true) => {
                    stats.deleted += 1;
                    stats.bytes_freed += size;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(%oid, %err, "failed to delete unreferenced CAS object");
                    stats.errors.push(GcObjectError {
                        oid,
                        error: format!("{err:#}"),
                    });
                }
            }
        }

        let (orphans, orphan_bytes) = self.sweep_orphaned_objects(&conn, cutoff)?;
        stats.scanned += orphans;
        stats.deleted += orphans;
        stats.bytes_freed += orphan_bytes;

        debug!(
            scanned = stats.scanned,
            deleted = stats.deleted,
            bytes_freed = stats.bytes_freed,
            errors = stats.errors.len(),
            "gc sweep complete"
        );
        Ok(stats)
    }

    fn set_phase(&self, phase: GcPhase) {
        self.gc_state().phase = phase;
    }

    fn scan_objects(&self, conn: &Connection) -> Result<Vec<(String, u64, u64)>> {
        let mut stmt = conn.prepare("SELECT oid, size, created_at FROM objects")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn delete_if_unreferenced(&self, conn: &mut Connection, oid: &str) -> Result<bool> {
        // Remove the index row only if no refs exist at deletion time to avoid
        // racing with concurrent ref creation.
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM objects
             WHERE oid = ?1
             AND NOT EXISTS (SELECT 1 FROM refs WHERE refs.oid = ?1)",
            params![oid],
        )?;
        tx.commit()?;

        if deleted == 0 {
            return Ok(false);
        }

        let path = self.object_path(oid);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete CAS object {}", path.display()))?;
            if let Some(parent) = path.parent() {
                fsync_dir(parent).ok();
            }
        }

        // Clean up stale partials to avoid future collisions.
        let tmp = self.root.join(TMP_DIR).join(format!("{oid}.partial"));
        if tmp.exists() {
            let _ = fs::remove_file(tmp);
        }
        Ok(true)
    }

    /// Sweep on-disk objects that have no index row at all (e.g. leftovers
    /// from an interrupted ingest followed by an index rebuild).
    fn sweep_orphaned_objects(&self, conn: &Connection, cutoff: u64) -> Result<(usize, u64)> {
        let objects_root = self.root.join(OBJECTS_DIR);
        if !objects_root.exists() {
            return Ok((0, 0));
        }
        let mut reclaimed = 0usize;
        let mut reclaimed_bytes = 0u64;
        for entry in walkdir::WalkDir::new(&objects_root)
            .min_depth(2)
            .max_depth(2)
        {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_path_buf();
            let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if self.object_info_with_conn(conn, file_name)?.is_some() {
                continue;
            }
            if file_modified_secs(&path).unwrap_or(0) > cutoff {
                continue;
            }
            let Some(_lock) = self.try_lock_for_gc(file_name)? else {
                continue;
            };
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let _ = fs::remove_file(&path);
            if let Some(parent) = path.parent() {
                fsync_dir(parent).ok();
            }
            let _ = conn.execute("DELETE FROM refs WHERE oid = ?1", params![file_name]);
            reclaimed += 1;
            reclaimed_bytes = reclaimed_bytes.saturating_add(size);
        }
        Ok((reclaimed, reclaimed_bytes))
    }
}
