#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod manifest;
pub mod profile;

pub use manifest::{
    ContentManifest, ContentType, FileSource, InstallBehavior, ManifestDependency, ManifestFile,
    ManifestId, ManifestIdError,
};
pub use profile::{GameProfile, WorkspaceState};
