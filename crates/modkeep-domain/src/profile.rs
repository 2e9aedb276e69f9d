use serde::{Deserialize, Serialize};

use crate::manifest::ManifestId;

/// Materialized on-disk workspace built from a profile's manifests. Cleared
/// whenever the manifest set changes so the next sync rebuilds it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceState {
    pub id: String,
    /// Unix seconds of the last successful materialization.
    pub synced_at: u64,
}

/// A named game configuration referencing zero or more manifests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameProfile {
    pub name: String,
    pub game: String,
    #[serde(default)]
    pub manifests: Vec<ManifestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceState>,
}

impl GameProfile {
    #[must_use]
    pub fn new(name: impl Into<String>, game: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            game: game.into(),
            manifests: Vec::new(),
            workspace: None,
        }
    }

    #[must_use]
    pub fn references(&self, id: &ManifestId) -> bool {
        self.manifests.iter().any(|m| m == id)
    }

    /// Replace every occurrence of `old` with `new`. When `new` is already
    /// present the old entry is dropped instead of duplicated. Returns whether
    /// the profile changed.
    pub fn repoint(&mut self, old: &ManifestId, new: &ManifestId) -> bool {
        if !self.references(old) {
            return false;
        }
        if self.references(new) {
            self.manifests.retain(|m| m != old);
        } else {
            for entry in &mut self.manifests {
                if entry == old {
                    *entry = new.clone();
                }
            }
        }
        true
    }

    /// Drop `id` from the manifest list. Returns whether the profile changed.
    pub fn remove_manifest(&mut self, id: &ManifestId) -> bool {
        let before = self.manifests.len();
        self.manifests.retain(|m| m != id);
        self.manifests.len() != before
    }
}
