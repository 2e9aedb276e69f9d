// Core store operations: layout, index schema, blob ingest and retrieval.
use std::{
    fs::{self, OpenOptions},
    io::Write,
};

use anyhow::anyhow;
use fs4::FileExt;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::*;

impl ContentStore {
    /// Store raw content bytes, returning the blob metadata. If the object
    /// already exists its integrity is checked before returning.
    pub fn put(&self, bytes: &[u8]) -> Result<StoredBlob> {
        self.ensure_layout()?;
        let oid = hex::encode(Sha256::digest(bytes));
        let _lock = self.acquire_lock(&oid)?;
        let tmp = self.tmp_path(&oid);
        if tmp.exists() {
            let _ = fs::remove_file(&tmp);
        }
        let path = self.object_path(&oid);
        let size = bytes.len() as u64;

        if path.exists() {
            self.verify_existing(&oid, &path)?;
            self.ensure_index_row(&oid, size)?;
            debug!(%oid, "cas hit");
            return Ok(StoredBlob { oid, path, size });
        }

        self.write_new_object(&oid, bytes, &path)
            .map_err(store_write_error)?;
        self.ensure_index_row(&oid, size)
            .map_err(store_write_error)?;
        debug!(%oid, size, "cas store");
        Ok(StoredBlob { oid, path, size })
    }

    /// Read a blob back, verifying its digest.
    pub fn read(&self, oid: &str) -> Result<Vec<u8>> {
        self.ensure_layout()?;
        let path = self.object_path(oid);
        if !path.exists() {
            return Err(StoreError::MissingObject {
                oid: oid.to_string(),
            }
            .into());
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read CAS object at {}", path.display()))?;
        self.verify_bytes(oid, &bytes)?;
        let conn = self.connection()?;
        self.touch_object(&conn, oid)?;
        Ok(bytes)
    }

    #[must_use]
    pub fn contains(&self, oid: &str) -> bool {
        self.object_path(oid).exists()
    }

    /// Return index metadata for an object, repairing a missing index row
    /// from disk when the object file itself is present.
    pub fn object_info(&self, oid: &str) -> Result<Option<ObjectInfo>> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        if let Some(info) = self.object_info_with_conn(&conn, oid)? {
            return Ok(Some(info));
        }
        let path = self.object_path(oid);
        if !path.exists() {
            return Ok(None);
        }
        self.verify_existing(oid, &path)?;
        let size = fs::metadata(&path)
            .with_context(|| format!("failed to stat CAS object at {}", path.display()))?
            .len();
        self.ensure_index_row(oid, size)?;
        self.object_info_with_conn(&conn, oid)
    }

    /// List all object identifiers known to the index.
    pub fn list(&self) -> Result<Vec<String>> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT oid FROM objects ORDER BY oid ASC")?;
        let mut rows = stmt.query([])?;
        let mut oids = Vec::new();
        while let Some(row) = rows.next()? {
            oids.push(row.get::<_, String>(0)?);
        }
        Ok(oids)
    }

    /// Total size of all indexed objects, for status reporting.
    pub fn total_bytes(&self) -> Result<u64> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        let total: i64 =
            conn.query_row("SELECT COALESCE(SUM(size), 0) FROM objects", [], |row| {
                row.get(0)
            })?;
        Ok(total as u64)
    }

    #[must_use]
    pub(super) fn object_path(&self, oid: &str) -> PathBuf {
        let shard = if oid.len() >= 2 { &oid[..2] } else { oid };
        self.root.join(OBJECTS_DIR).join(shard).join(oid)
    }

    fn tmp_path(&self, oid: &str) -> PathBuf {
        self.root.join(TMP_DIR).join(format!("{oid}.partial"))
    }

    fn lock_path(&self, oid: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{oid}.lock"))
    }

    fn acquire_lock(&self, oid: &str) -> Result<File> {
        let path = self.lock_path(oid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    pub(super) fn try_lock_for_gc(&self, oid: &str) -> Result<Option<File>> {
        let path = self.lock_path(oid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_new_object(&self, oid: &str, bytes: &[u8], path: &Path) -> Result<()> {
        let tmp = self.tmp_path(oid);
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent)?;
        }
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create partial file {}", tmp.display()))?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to commit CAS object {}", path.display()))?;
        if let Some(parent) = path.parent() {
            fsync_dir(parent).ok();
        }
        Ok(())
    }

    pub(super) fn verify_existing(&self, oid: &str, path: &Path) -> Result<()> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read CAS object at {}", path.display()))?;
        self.verify_bytes(oid, &bytes)
    }

    fn verify_bytes(&self, oid: &str, bytes: &[u8]) -> Result<()> {
        let actual = hex::encode(Sha256::digest(bytes));
        if actual != oid {
            return Err(StoreError::DigestMismatch {
                oid: oid.to_string(),
                actual,
            }
            .into());
        }
        Ok(())
    }

    pub(super) fn ensure_layout(&self) -> Result<()> {
        for dir in [OBJECTS_DIR, LOCKS_DIR, TMP_DIR] {
            fs::create_dir_all(self.root.join(dir)).with_context(|| {
                format!(
                    "failed to ensure CAS directory {}",
                    self.root.join(dir).display()
                )
            })?;
        }
        let mut conn = self.connection()?;
        self.init_schema(&conn)?;
        self.ensure_meta(&mut conn)?;
        Ok(())
    }

    pub(super) fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(self.root.join(INDEX_FILENAME))
            .map_err(|err| StoreError::IndexCorrupt(err.to_string()))?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for the CAS index")?;
        Ok(conn)
    }

    fn init_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta(
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS objects(
                 oid TEXT PRIMARY KEY,
                 size INTEGER NOT NULL,
                 created_at INTEGER NOT NULL,
                 last_accessed INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS refs(
                 owner_kind TEXT NOT NULL,
                 owner_id TEXT NOT NULL,
                 oid TEXT NOT NULL,
                 PRIMARY KEY(owner_kind, owner_id, oid)
             );
             CREATE INDEX IF NOT EXISTS refs_oid ON refs(oid);",
        )
        .map_err(|err| StoreError::IndexCorrupt(err.to_string()))?;
        Ok(())
    }

    fn ensure_meta(&self, conn: &mut Connection) -> Result<()> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start CAS meta transaction")?;
        for (key, expected) in [
            (META_KEY_STORE_FORMAT_VERSION, STORE_FORMAT_VERSION),
            (META_KEY_SCHEMA_VERSION, SCHEMA_VERSION),
        ] {
            let found: Option<String> = tx
                .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| {
                    r.get(0)
                })
                .optional()?;
            match found {
                Some(value) if value == expected.to_string() => {}
                Some(value) => {
                    return Err(StoreError::IncompatibleFormat {
                        key: key.to_string(),
                        expected: expected.to_string(),
                        found: value,
                    }
                    .into());
                }
                None => {
                    tx.execute(
                        "INSERT INTO meta(key, value) VALUES (?1, ?2)",
                        params![key, expected.to_string()],
                    )?;
                }
            }
        }
        tx.execute(
            "INSERT INTO meta(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO NOTHING",
            params![META_KEY_CREATED_BY, MODKEEP_VERSION],
        )?;
        tx.execute(
            "INSERT INTO meta(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![META_KEY_LAST_USED, MODKEEP_VERSION],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub(super) fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start CAS index transaction")?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn ensure_index_row(&self, oid: &str, size: u64) -> Result<()> {
        let now = timestamp_secs();
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO objects(oid, size, created_at, last_accessed)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(oid) DO NOTHING",
            params![oid, size as i64, now as i64],
        )?;
        Ok(())
    }

    fn touch_object(&self, conn: &Connection, oid: &str) -> Result<()> {
        conn.execute(
            "UPDATE objects SET last_accessed=?1 WHERE oid=?2",
            params![timestamp_secs() as i64, oid],
        )?;
        Ok(())
    }

    pub(super) fn object_info_with_conn(
        &self,
        conn: &Connection,
        oid: &str,
    ) -> Result<Option<ObjectInfo>> {
        let info = conn
            .query_row(
                "SELECT size, created_at, last_accessed FROM objects WHERE oid = ?1",
                params![oid],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?
            .map(|(size, created_at, last_accessed)| ObjectInfo {
                oid: oid.to_string(),
                size: size as u64,
                created_at: created_at as u64,
                last_accessed: last_accessed as u64,
            });
        Ok(info)
    }

    pub(super) fn assert_object_known(
        &self,
        tx: &rusqlite::Transaction<'_>,
        oid: &str,
    ) -> Result<()> {
        let known: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM objects WHERE oid = ?1",
                params![oid],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(StoreError::MissingObject {
                oid: oid.to_string(),
            }
            .into());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(super) fn set_created_at(&self, oid: &str, ts: i64) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE objects SET created_at=?1 WHERE oid=?2",
            params![ts, oid],
        )?;
        Ok(())
    }
}

fn store_write_error(err: anyhow::Error) -> anyhow::Error {
    if err.is::<StoreError>() {
        err
    } else {
        anyhow!(StoreError::StoreWriteFailure(err.to_string()))
    }
}
