//! Pool of installed manifest descriptors, persisted as one JSON document
//! per manifest beside the content store.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use modkeep_domain::{ContentManifest, ManifestId};

use crate::core::cancel::CancelToken;
use crate::core::store::cas::ContentStore;

#[derive(Clone, Debug)]
pub struct ManifestPool {
    root: PathBuf,
    store: ContentStore,
}

impl ManifestPool {
    pub fn new(root: PathBuf, store: ContentStore) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to ensure manifest pool at {}", root.display()))?;
        Ok(Self { root, store })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a manifest descriptor and track its content-addressable
    /// references. Every oid the manifest names must already be ingested.
    pub fn add(&self, manifest: &ContentManifest) -> Result<()> {
        let path = self.manifest_path(&manifest.id);
        let json = serde_json::to_string_pretty(manifest)
            .with_context(|| format!("failed to encode manifest {}", manifest.id))?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write manifest {}", path.display()))?;
        self.store.track_manifest(manifest)?;
        debug!(id = %manifest.id, "manifest added to pool");
        Ok(())
    }

    pub fn get(&self, id: &ManifestId) -> Result<Option<ContentManifest>> {
        let path = self.manifest_path(id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read manifest {}", path.display()))
            }
        };
        let manifest = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode manifest {}", path.display()))?;
        Ok(Some(manifest))
    }

    #[must_use]
    pub fn contains(&self, id: &ManifestId) -> bool {
        self.manifest_path(id).exists()
    }

    /// List the ids of all installed manifests, skipping files that do not
    /// parse as manifest ids.
    pub fn list(&self) -> Result<Vec<ManifestId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to list manifest pool at {}", self.root.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match ManifestId::from_str(stem) {
                Ok(id) => ids.push(id),
                Err(err) => warn!(file = %name.to_string_lossy(), %err, "ignoring stray pool file"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a manifest's persisted descriptor. With `skip_untrack` the
    /// caller asserts it already untracked this exact id; passing `true`
    /// without a successful prior untrack orphans reference records.
    pub fn remove(&self, id: &ManifestId, skip_untrack: bool, token: &CancelToken) -> Result<()> {
        token.checkpoint()?;
        if !skip_untrack {
            self.store.untrack_manifest(id)?;
        }
        let path = self.manifest_path(id);
        match fs::remove_file(&path) {
            Ok(()) => debug!(%id, "manifest removed from pool"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(%id, "manifest already absent from pool");
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove manifest {}", path.display()))
            }
        }
        Ok(())
    }

    fn manifest_path(&self, id: &ManifestId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::{tempdir, TempDir};

    use crate::core::cancel::Cancelled;

    use super::*;

    fn new_pool() -> Result<(TempDir, ManifestPool, ContentStore)> {
        let temp = tempdir()?;
        let store = ContentStore::with_policy(
            Some(temp.path().join("store")),
            Duration::ZERO,
            Duration::ZERO,
        )?;
        let pool = ManifestPool::new(temp.path().join("manifests"), store.clone())?;
        Ok((temp, pool, store))
    }

    fn manifest_for(store: &ContentStore, id: &str, payload: &[u8]) -> Result<ContentManifest> {
        let blob = store.put(payload)?;
        let manifest = serde_json::from_value(serde_json::json!({
            "id": id,
            "title": "fixture",
            "publisher": "moddb",
            "game": "quake2",
            "version": "1.0",
            "files": [
                {"path": "files/0.pak", "size": payload.len(), "source": "content-addressable", "oid": blob.oid},
            ],
        }))?;
        Ok(manifest)
    }

    #[test]
    fn add_persists_descriptor_and_tracks_refs() -> Result<()> {
        let (_temp, pool, store) = new_pool()?;
        let manifest = manifest_for(&store, "1.1.moddb.map.foo", b"pak")?;
        pool.add(&manifest)?;
        assert_eq!(pool.get(&manifest.id)?, Some(manifest.clone()));
        assert_eq!(pool.list()?, vec![manifest.id.clone()]);
        assert_eq!(store.referenced_oids()?.len(), 1);
        Ok(())
    }

    #[test]
    fn remove_untracks_by_default() -> Result<()> {
        let (_temp, pool, store) = new_pool()?;
        let manifest = manifest_for(&store, "1.1.moddb.map.foo", b"pak")?;
        pool.add(&manifest)?;
        pool.remove(&manifest.id, false, &CancelToken::new())?;
        assert!(!pool.contains(&manifest.id));
        assert!(store.referenced_oids()?.is_empty());
        Ok(())
    }

    #[test]
    fn remove_with_skip_untrack_leaves_refs_alone() -> Result<()> {
        let (_temp, pool, store) = new_pool()?;
        let manifest = manifest_for(&store, "1.1.moddb.map.foo", b"pak")?;
        pool.add(&manifest)?;
        pool.remove(&manifest.id, true, &CancelToken::new())?;
        assert!(!pool.contains(&manifest.id));
        assert_eq!(
            store.referenced_oids()?.len(),
            1,
            "skip_untrack must not touch reference records"
        );
        Ok(())
    }

    #[test]
    fn removing_an_absent_manifest_is_success() -> Result<()> {
        let (_temp, pool, _store) = new_pool()?;
        let id: ManifestId = "1.1.moddb.map.ghost".parse().expect("valid id");
        pool.remove(&id, false, &CancelToken::new())?;
        Ok(())
    }

    #[test]
    fn remove_honors_cancellation() -> Result<()> {
        let (_temp, pool, store) = new_pool()?;
        let manifest = manifest_for(&store, "1.1.moddb.map.foo", b"pak")?;
        pool.add(&manifest)?;
        let token = CancelToken::new();
        token.cancel();
        let err = pool.remove(&manifest.id, false, &token).unwrap_err();
        assert!(err.is::<Cancelled>());
        assert!(pool.contains(&manifest.id), "cancelled remove must not act");
        Ok(())
    }
}
