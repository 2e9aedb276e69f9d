use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Errors surfaced while parsing manifest identifiers.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestIdError {
    #[error("manifest id '{0}' must have five dot-separated segments")]
    SegmentCount(String),
    #[error("manifest id '{0}' contains an empty segment")]
    EmptySegment(String),
    #[error("manifest id '{id}' has a non-numeric schema version '{found}'")]
    SchemaVersion { id: String, found: String },
    #[error("unknown content type '{0}'")]
    UnknownContentType(String),
}

/// Content categories a manifest can describe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Mod,
    Map,
    Patch,
    Client,
}

impl ContentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mod => "mod",
            Self::Map => "map",
            Self::Patch => "patch",
            Self::Client => "client",
        }
    }
}

impl TryFrom<&str> for ContentType {
    type Error = ManifestIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "mod" => Ok(Self::Mod),
            "map" => Ok(Self::Map),
            "patch" => Ok(Self::Patch),
            "client" => Ok(Self::Client),
            other => Err(ManifestIdError::UnknownContentType(other.to_string())),
        }
    }
}

/// Globally unique manifest identifier with the fixed schema
/// `{schemaVersion}.{contentVersion}.{publisher}.{contentType}.{name}`.
///
/// The name segment is the remainder of the string and may itself contain
/// dots; all other segments are single tokens.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManifestId {
    schema_version: u32,
    content_version: String,
    publisher: String,
    content_type: ContentType,
    name: String,
}

impl ManifestId {
    pub fn new(
        schema_version: u32,
        content_version: impl Into<String>,
        publisher: impl Into<String>,
        content_type: ContentType,
        name: impl Into<String>,
    ) -> Result<Self, ManifestIdError> {
        let id = Self {
            schema_version,
            content_version: content_version.into(),
            publisher: publisher.into(),
            content_type,
            name: name.into(),
        };
        for segment in [&id.content_version, &id.publisher, &id.name] {
            if segment.is_empty() {
                return Err(ManifestIdError::EmptySegment(id.to_string()));
            }
        }
        Ok(id)
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    #[must_use]
    pub fn content_version(&self) -> &str {
        &self.content_version
    }

    #[must_use]
    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    #[must_use]
    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.schema_version,
            self.content_version,
            self.publisher,
            self.content_type.as_str(),
            self.name
        )
    }
}

impl FromStr for ManifestId {
    type Err = ManifestIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = value.splitn(5, '.').collect();
        if segments.len() != 5 {
            return Err(ManifestIdError::SegmentCount(value.to_string()));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ManifestIdError::EmptySegment(value.to_string()));
        }
        let schema_version =
            segments[0]
                .parse::<u32>()
                .map_err(|_| ManifestIdError::SchemaVersion {
                    id: value.to_string(),
                    found: segments[0].to_string(),
                })?;
        Ok(Self {
            schema_version,
            content_version: segments[1].to_string(),
            publisher: segments[2].to_string(),
            content_type: ContentType::try_from(segments[3])?,
            name: segments[4].to_string(),
        })
    }
}

impl Serialize for ManifestId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ManifestId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Where the bytes for one manifest file come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "kebab-case")]
pub enum FileSource {
    RemoteDownload { url: String, sha256: String },
    ContentAddressable { oid: String },
}

/// One installable file described by a manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Install path relative to the target game root.
    pub path: String,
    pub size: u64,
    #[serde(flatten)]
    pub source: FileSource,
}

/// Install policy for a declared dependency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallBehavior {
    Required,
    Optional,
    Recommended,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDependency {
    pub id: ManifestId,
    pub behavior: InstallBehavior,
}

/// Immutable descriptor of one content package.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentManifest {
    pub id: ManifestId,
    pub title: String,
    pub publisher: String,
    /// Target game identifier (e.g. `quake2`).
    pub game: String,
    pub version: String,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    #[serde(default)]
    pub dependencies: Vec<ManifestDependency>,
}

impl ContentManifest {
    /// Hashes of the content-addressable subset of this manifest's files.
    #[must_use]
    pub fn cas_oids(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter_map(|file| match &file.source {
                FileSource::ContentAddressable { oid } => Some(oid.as_str()),
                FileSource::RemoteDownload { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_id_round_trips_through_display() {
        let id: ManifestId = "1.2.moddb.map.foo".parse().expect("valid id");
        assert_eq!(id.schema_version(), 1);
        assert_eq!(id.content_version(), "2");
        assert_eq!(id.publisher(), "moddb");
        assert_eq!(id.content_type(), ContentType::Map);
        assert_eq!(id.name(), "foo");
        assert_eq!(id.to_string(), "1.2.moddb.map.foo");
    }

    #[test]
    fn manifest_id_name_may_contain_dots() {
        let id: ManifestId = "1.0.nexus.mod.weapons.extended".parse().expect("valid id");
        assert_eq!(id.name(), "weapons.extended");
        assert_eq!(id.to_string(), "1.0.nexus.mod.weapons.extended");
    }

    #[test]
    fn manifest_id_rejects_short_ids() {
        let err = "1.2.moddb.map".parse::<ManifestId>().unwrap_err();
        assert_eq!(err, ManifestIdError::SegmentCount("1.2.moddb.map".into()));
    }

    #[test]
    fn manifest_id_rejects_unknown_content_type() {
        let err = "1.2.moddb.skin.foo".parse::<ManifestId>().unwrap_err();
        assert_eq!(err, ManifestIdError::UnknownContentType("skin".into()));
    }

    #[test]
    fn manifest_id_rejects_non_numeric_schema() {
        let err = "v1.2.moddb.map.foo".parse::<ManifestId>().unwrap_err();
        assert!(matches!(err, ManifestIdError::SchemaVersion { .. }));
    }

    #[test]
    fn cas_oids_skips_remote_files() {
        let manifest: ContentManifest = serde_json::from_value(serde_json::json!({
            "id": "1.1.moddb.map.foo",
            "title": "Foo",
            "publisher": "moddb",
            "game": "quake2",
            "version": "1.1",
            "files": [
                {"path": "maps/foo.bsp", "size": 4, "source": "content-addressable", "oid": "aa"},
                {"path": "maps/foo.txt", "size": 2, "source": "remote-download", "url": "https://example.invalid/f", "sha256": "bb"}
            ]
        }))
        .expect("manifest parses");
        assert_eq!(manifest.cas_oids(), vec!["aa"]);
    }
}
