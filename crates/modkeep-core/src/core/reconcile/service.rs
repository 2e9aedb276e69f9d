// Profile reconciliation: repointing and pruning manifest references held by
// game profiles, invalidating materialized workspaces along the way.
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use tracing::{debug, warn};

use modkeep_domain::{GameProfile, ManifestId};

use crate::core::store::cas::ContentStore;

/// Result of one reconciliation call: a success flag, the affected counts,
/// and the first error encountered when something went wrong part-way.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceReport {
    pub success: bool,
    pub profiles_updated: usize,
    pub workspaces_invalidated: usize,
    /// Names of the profiles that changed.
    pub profiles: Vec<String>,
    pub first_error: Option<String>,
}

impl ServiceReport {
    fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    fn record_error(&mut self, error: String) {
        self.success = false;
        self.first_error.get_or_insert(error);
    }
}

/// Port through which the orchestrator updates the consumers of manifests.
pub trait ReconciliationService: Send + Sync {
    /// Repoint every profile referencing an old manifest id to its new id.
    fn reconcile_bulk_replacement(
        &self,
        mapping: &IndexMap<ManifestId, ManifestId>,
    ) -> Result<ServiceReport>;

    /// Drop one manifest id from every profile referencing it.
    fn reconcile_removal(&self, id: &ManifestId) -> Result<ServiceReport>;

    /// Combined repoint-and-invalidate for one manifest swap, where old and
    /// new ids may differ.
    fn orchestrate_local_update(
        &self,
        old_id: &ManifestId,
        new_id: &ManifestId,
    ) -> Result<ServiceReport>;
}

/// Filesystem-backed profile owner: one JSON document per profile. The sole
/// mutator of profiles; the store is only touched to untrack invalidated
/// workspaces.
#[derive(Clone, Debug)]
pub struct ProfileStore {
    root: PathBuf,
    store: ContentStore,
}

impl ProfileStore {
    pub fn new(root: PathBuf, store: ContentStore) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to ensure profile directory {}", root.display()))?;
        Ok(Self { root, store })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save(&self, profile: &GameProfile) -> Result<()> {
        let path = self.profile_path(&profile.name);
        let json = serde_json::to_string_pretty(profile)
            .with_context(|| format!("failed to encode profile {}", profile.name))?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write profile {}", path.display()))?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Option<GameProfile>> {
        let path = self.profile_path(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read profile {}", path.display()))
            }
        };
        let profile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode profile {}", path.display()))?;
        Ok(Some(profile))
    }

    /// All readable profiles; unreadable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<GameProfile>> {
        let mut profiles = Vec::new();
        for entry in fs::read_dir(&self.root).with_context(|| {
            format!("failed to list profile directory {}", self.root.display())
        })? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match self.load(stem) {
                Ok(Some(profile)) => profiles.push(profile),
                Ok(None) => {}
                Err(err) => warn!(profile = stem, %err, "skipping unreadable profile"),
            }
        }
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }

    /// Apply a manifest mapping to every profile. `None` targets mean the
    /// manifest is being removed rather than replaced. A profile that fails
    /// to persist marks the report failed but does not stop the others.
    fn apply_mapping(
        &self,
        mapping: &IndexMap<ManifestId, Option<ManifestId>>,
    ) -> Result<ServiceReport> {
        let mut report = ServiceReport::ok();
        for mut profile in self.list()? {
            let mut changed = false;
            for (old, target) in mapping {
                changed |= match target {
                    Some(new) => profile.repoint(old, new),
                    None => profile.remove_manifest(old),
                };
            }
            if !changed {
                continue;
            }
            report.profiles_updated += 1;
            report.profiles.push(profile.name.clone());
            if let Some(workspace) = profile.workspace.take() {
                report.workspaces_invalidated += 1;
                if let Err(err) = self.store.untrack_workspace(&workspace.id) {
                    report.record_error(format!(
                        "failed to untrack workspace {}: {err:#}",
                        workspace.id
                    ));
                }
            }
            if let Err(err) = self.save(&profile) {
                report.record_error(format!("failed to persist profile {}: {err:#}", profile.name));
            }
        }
        debug!(
            profiles_updated = report.profiles_updated,
            workspaces_invalidated = report.workspaces_invalidated,
            success = report.success,
            "profile reconciliation complete"
        );
        Ok(report)
    }

    fn profile_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }
}

impl ReconciliationService for ProfileStore {
    fn reconcile_bulk_replacement(
        &self,
        mapping: &IndexMap<ManifestId, ManifestId>,
    ) -> Result<ServiceReport> {
        let mapping: IndexMap<ManifestId, Option<ManifestId>> = mapping
            .iter()
            .map(|(old, new)| (old.clone(), Some(new.clone())))
            .collect();
        self.apply_mapping(&mapping)
    }

    fn reconcile_removal(&self, id: &ManifestId) -> Result<ServiceReport> {
        let mut mapping = IndexMap::new();
        mapping.insert(id.clone(), None);
        self.apply_mapping(&mapping)
    }

    fn orchestrate_local_update(
        &self,
        old_id: &ManifestId,
        new_id: &ManifestId,
    ) -> Result<ServiceReport> {
        let mut mapping = IndexMap::new();
        mapping.insert(old_id.clone(), Some(new_id.clone()));
        self.apply_mapping(&mapping)
    }
}
