use std::{
    env,
    fs::{self, File},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use modkeep_domain::ManifestId;

mod gc;
mod refs;
mod store_impl;


const OBJECTS_DIR: &str = "objects";
const LOCKS_DIR: &str = "locks";
const TMP_DIR: &str = "tmp";
const INDEX_FILENAME: &str = "index.sqlite";
const STORE_FORMAT_VERSION: u32 = 1;
const SCHEMA_VERSION: u32 = 1;
const META_KEY_STORE_FORMAT_VERSION: &str = "store_format_version";
const META_KEY_SCHEMA_VERSION: &str = "schema_version";
const META_KEY_CREATED_BY: &str = "created_by_modkeep_version";
const META_KEY_LAST_USED: &str = "last_used_modkeep_version";
const MODKEEP_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_GC_COOLDOWN: Duration = Duration::from_secs(30);
const DEFAULT_GC_GRACE: Duration = Duration::from_secs(300);

/// Diagnostic codes attached to store errors.
pub mod codes {
    pub const MISSING_OR_CORRUPT: &str = "MK800";
    pub const STORE_WRITE_FAILURE: &str = "MK810";
    pub const INDEX_CORRUPT: &str = "MK811";
    pub const FORMAT_INCOMPATIBLE: &str = "MK812";
}

/// Errors surfaced by the content store.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("[MK800] CAS object {oid} is missing")]
    MissingObject { oid: String },
    #[error("[MK800] CAS object {oid} digest mismatch (found {actual})")]
    DigestMismatch { oid: String, actual: String },
    #[error("[MK800] Unknown owner kind '{0}'")]
    UnknownOwnerKind(String),
    #[error("[MK810] CAS store write failed: {0}")]
    StoreWriteFailure(String),
    #[error("[MK811] CAS index is corrupt: {0}")]
    IndexCorrupt(String),
    #[error("[MK812] CAS metadata is missing required key '{0}'")]
    MissingMeta(String),
    #[error(
        "[MK812] CAS format/schema incompatible for {key}: expected {expected}, found {found}"
    )]
    IncompatibleFormat {
        key: String,
        expected: String,
        found: String,
    },
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingObject { .. }
            | Self::DigestMismatch { .. }
            | Self::UnknownOwnerKind(_) => codes::MISSING_OR_CORRUPT,
            Self::StoreWriteFailure(_) => codes::STORE_WRITE_FAILURE,
            Self::IndexCorrupt(_) => codes::INDEX_CORRUPT,
            Self::MissingMeta(_) | Self::IncompatibleFormat { .. } => codes::FORMAT_INCOMPATIBLE,
        }
    }
}

/// Owner categories that keep objects live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnerKind {
    Manifest,
    Workspace,
}

impl OwnerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manifest => "manifest",
            Self::Workspace => "workspace",
        }
    }
}

impl TryFrom<&str> for OwnerKind {
    type Error = StoreError;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "manifest" => Ok(Self::Manifest),
            "workspace" => Ok(Self::Workspace),
            other => Err(StoreError::UnknownOwnerKind(other.to_string())),
        }
    }
}

/// Concrete owner of a reference record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerId {
    pub kind: OwnerKind,
    pub id: String,
}

impl OwnerId {
    #[must_use]
    pub fn manifest(id: &ManifestId) -> Self {
        Self {
            kind: OwnerKind::Manifest,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn workspace(id: impl Into<String>) -> Self {
        Self {
            kind: OwnerKind::Workspace,
            id: id.into(),
        }
    }
}

/// A blob persisted in the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlob {
    pub oid: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Index metadata for one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub oid: String,
    pub size: u64,
    pub created_at: u64,
    pub last_accessed: u64,
}

/// Phases of one garbage-collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GcPhase {
    #[default]
    Idle,
    Scanning,
    Marking,
    Sweeping,
}

#[derive(Debug, Default)]
struct GcState {
    phase: GcPhase,
    last_completed: Option<Instant>,
}

/// One object the sweep failed to delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcObjectError {
    pub oid: String,
    pub error: String,
}

/// Result of one completed garbage-collection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub scanned: usize,
    pub deleted: usize,
    pub bytes_freed: u64,
    pub errors: Vec<GcObjectError>,
}

/// Disposition of a garbage-collection request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GcOutcome {
    Completed(GcStats),
    /// A non-forced request landed inside the cooldown window.
    Throttled,
    /// Another pass is already sweeping this store.
    Busy,
}

impl GcOutcome {
    #[must_use]
    pub fn stats(&self) -> Option<&GcStats> {
        match self {
            Self::Completed(stats) => Some(stats),
            Self::Throttled | Self::Busy => None,
        }
    }
}

/// One manifest the bulk untrack could not process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UntrackError {
    pub manifest_id: String,
    pub error: String,
}

/// Structured result of a bulk untrack. The call succeeding means the loop
/// completed; per-item failures live in `errors`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UntrackReport {
    /// Manifests whose references were fully removed.
    pub untracked: usize,
    pub errors: Vec<UntrackError>,
}

/// Content-addressable store for game content blobs, including the reference
/// records that keep them alive and the mark-and-sweep lifecycle pass.
#[derive(Clone, Debug)]
pub struct ContentStore {
    root: PathBuf,
    gc_cooldown: Duration,
    gc_grace: Duration,
    gc: Arc<Mutex<GcState>>,
}

impl ContentStore {
    /// Open (or initialize) a store at `root`, falling back to the default
    /// `~/.modkeep/store` when `None` is supplied.
    pub fn new(root: Option<PathBuf>) -> Result<Self> {
        Self::with_policy(root, DEFAULT_GC_COOLDOWN, DEFAULT_GC_GRACE)
    }

    /// Open a store with explicit garbage-collection policy knobs.
    pub fn with_policy(
        root: Option<PathBuf>,
        gc_cooldown: Duration,
        gc_grace: Duration,
    ) -> Result<Self> {
        let root = match root {
            Some(path) => path,
            None => default_root()?,
        };
        let store = Self {
            root,
            gc_cooldown,
            gc_grace,
            gc: Arc::default(),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn gc_state(&self) -> std::sync::MutexGuard<'_, GcState> {
        self.gc.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn default_root() -> Result<PathBuf> {
    if let Some(path) = env::var_os("MODKEEP_STORE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs_next::home_dir().context("failed to resolve HOME for the content store")?;
    Ok(home.join(".modkeep").join("store"))
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let file = File::open(dir)?;
    file.sync_all()?;
    Ok(())
}

fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn file_modified_secs(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()?
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}
