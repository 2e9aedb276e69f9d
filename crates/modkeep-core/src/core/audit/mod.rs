//! Durable record of every orchestrated operation, one JSON array per UTC
//! day, pruned wholesale by retention policy.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};
use tracing::{debug, warn};

use modkeep_domain::ManifestId;

/// Kinds of orchestrated operations the log records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    ManifestReplacement,
    ManifestRemoval,
    LocalContentUpdate,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManifestReplacement => "manifest-replacement",
            Self::ManifestRemoval => "manifest-removal",
            Self::LocalContentUpdate => "local-content-update",
        }
    }
}

/// Immutable record of one orchestrated operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub operation_id: String,
    pub operation: OperationKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub affected_manifests: Vec<String>,
    /// Old manifest id → new manifest id, for replacement/update operations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remapping: BTreeMap<String, String>,
    #[serde(default)]
    pub profiles: Vec<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

/// Append-style operation log. Writes to a given day's file are serialized
/// behind a lock; reads reflect whatever is on disk at open time.
#[derive(Debug)]
pub struct AuditLog {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to ensure audit directory {}", root.display()))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append an entry to its UTC day's file.
    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let path = self.day_path(entry.timestamp.date());
        let mut entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<Vec<AuditEntry>>(&raw)
                .with_context(|| format!("failed to decode audit file {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read audit file {}", path.display()))
            }
        };
        entries.push(entry.clone());
        let json = serde_json::to_string_pretty(&entries)
            .context("failed to encode audit entries")?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write audit file {}", path.display()))?;
        debug!(operation_id = %entry.operation_id, operation = %entry.operation.as_str(), "audit entry recorded");
        Ok(())
    }

    /// The `limit` most recent entries across all day files, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut entries = self.load_all()?;
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }

    /// All entries touching the given manifest id, newest first.
    pub fn for_manifest(&self, id: &ManifestId) -> Result<Vec<AuditEntry>> {
        let needle = id.to_string();
        let mut entries: Vec<AuditEntry> = self
            .load_all()?
            .into_iter()
            .filter(|entry| {
                entry.affected_manifests.contains(&needle)
                    || entry.remapping.contains_key(&needle)
                    || entry.remapping.values().any(|target| *target == needle)
            })
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    /// All entries touching the given profile, newest first.
    pub fn for_profile(&self, name: &str) -> Result<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self
            .load_all()?
            .into_iter()
            .filter(|entry| entry.profiles.iter().any(|p| p == name))
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    /// Delete day files older than the retention cutoff, comparing by file
    /// name rather than per entry. Returns the number of files removed.
    pub fn prune(&self, retention_days: u32) -> Result<usize> {
        let cutoff = OffsetDateTime::now_utc()
            .date()
            .checked_sub(Duration::days(i64::from(retention_days)))
            .unwrap_or(Date::MIN);
        let cutoff_name = day_file_name(cutoff);
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.root).with_context(|| {
            format!("failed to list audit directory {}", self.root.display())
        })? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_day_file_name(name) {
                continue;
            }
            if name < cutoff_name.as_str() {
                fs::remove_file(entry.path()).with_context(|| {
                    format!("failed to prune audit file {}", entry.path().display())
                })?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "audit retention prune complete");
        }
        Ok(removed)
    }

    fn load_all(&self) -> Result<Vec<AuditEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root).with_context(|| {
            format!("failed to list audit directory {}", self.root.display())
        })? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_day_file_name(name) {
                continue;
            }
            let raw = fs::read_to_string(entry.path()).with_context(|| {
                format!("failed to read audit file {}", entry.path().display())
            })?;
            match serde_json::from_str::<Vec<AuditEntry>>(&raw) {
                Ok(mut day) => entries.append(&mut day),
                Err(err) => warn!(file = name, %err, "skipping unreadable audit file"),
            }
        }
        Ok(entries)
    }

    fn day_path(&self, date: Date) -> PathBuf {
        self.root.join(day_file_name(date))
    }
}

fn day_file_name(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}.json",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

fn is_day_file_name(name: &str) -> bool {
    name.len() == "0000-00-00.json".len() && name.ends_with(".json")
}
