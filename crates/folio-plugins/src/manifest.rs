//! Manifest extraction
//!
//! Locates and parses a package's `manifest.json` into a typed
//! [`PluginMetadata`] record. Extraction is a pure parse: it never touches
//! the repository or any other shared state.

use crate::error::{ManifestError, PluginResult};
use crate::package::{self, MANIFEST_ENTRY};
use chrono::Utc;
use folio_core::domain::plugin::{
    DependencySpec, Plugin, PluginCategory, PluginKind, PluginPermission, Version,
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Manifests larger than this are rejected outright
const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

/// Typed result of manifest extraction: a plugin record minus the
/// installed/enabled flags, plus the package path it came from.
#[derive(Debug, Clone)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub author: String,
    pub description: String,
    pub category: PluginCategory,
    pub kind: PluginKind,
    pub permissions: Vec<PluginPermission>,
    pub dependencies: Vec<DependencySpec>,
    pub configurable: bool,
    pub icon_url: Option<String>,
    pub source_url: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Package the manifest was extracted from
    pub package_path: PathBuf,
}

impl PluginMetadata {
    /// Build the persisted record for a fresh install:
    /// installed but not yet enabled.
    pub fn into_plugin(self, installed_path: Option<PathBuf>) -> Plugin {
        let now = Utc::now();
        Plugin {
            id: self.id,
            name: self.name,
            version: self.version,
            author: self.author,
            description: self.description,
            category: self.category,
            kind: self.kind,
            permissions: self.permissions,
            dependencies: self.dependencies,
            is_enabled: false,
            is_installed: true,
            configurable: self.configurable,
            icon_url: self.icon_url,
            source_url: self.source_url,
            package_path: installed_path,
            metadata: self.metadata,
            installed_at: now,
            updated_at: now,
        }
    }
}

/// Raw manifest as written by plugin authors
#[derive(Debug, Deserialize)]
struct RawManifest {
    id: String,
    name: String,
    version: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    description: String,
    category: PluginCategory,
    #[serde(rename = "type", alias = "kind")]
    kind: PluginKind,
    #[serde(default)]
    permissions: Vec<PluginPermission>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    configurable: bool,
    #[serde(default)]
    icon_url: Option<String>,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Locate and parse the package manifest
pub fn extract_metadata(path: &Path) -> PluginResult<PluginMetadata> {
    let bytes = package::read_entry(path, MANIFEST_ENTRY, MAX_MANIFEST_BYTES)?
        .ok_or(ManifestError::Missing)?;

    let raw: RawManifest = serde_json::from_slice(&bytes)
        .map_err(|e| ManifestError::Malformed(e.to_string()))?;

    if raw.id.trim().is_empty() {
        return Err(ManifestError::Malformed("empty plugin id".to_string()).into());
    }
    if raw.name.trim().is_empty() {
        return Err(ManifestError::Malformed("empty plugin name".to_string()).into());
    }

    let version: Version = raw
        .version
        .parse()
        .map_err(|_| ManifestError::Malformed(format!("invalid version: {}", raw.version)))?;

    let mut seen = HashSet::new();
    for permission in &raw.permissions {
        if !seen.insert(*permission) {
            return Err(ManifestError::Malformed(format!(
                "duplicate permission: {}",
                permission.as_str()
            ))
            .into());
        }
    }

    let dependencies = raw
        .dependencies
        .iter()
        .map(|s| {
            DependencySpec::parse(s)
                .map_err(|_| ManifestError::Malformed(format!("invalid dependency: {s}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    for dep in &dependencies {
        if dep.plugin_id == raw.id {
            return Err(ManifestError::Malformed(format!(
                "plugin '{}' depends on itself",
                raw.id
            ))
            .into());
        }
    }

    Ok(PluginMetadata {
        id: raw.id,
        name: raw.name,
        version,
        author: raw.author,
        description: raw.description,
        category: raw.category,
        kind: raw.kind,
        permissions: raw.permissions,
        dependencies,
        configurable: raw.configurable,
        icon_url: raw.icon_url,
        source_url: raw.source_url,
        metadata: raw.metadata,
        package_path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use crate::package::test_fixtures::write_package;
    use folio_core::domain::plugin::VersionConstraint;
    use tempfile::TempDir;

    fn package_with_manifest(dir: &TempDir, manifest: &str) -> PathBuf {
        let pkg = dir.path().join("p.fpkg");
        write_package(&pkg, &[(MANIFEST_ENTRY, manifest.as_bytes())]);
        pkg
    }

    #[test]
    fn extracts_complete_manifest() {
        let dir = TempDir::new().unwrap();
        let pkg = package_with_manifest(
            &dir,
            r#"{
                "id": "panel-translate",
                "name": "Panel Translate",
                "version": "1.2.0",
                "author": "folio",
                "description": "Translates speech bubbles",
                "category": "translation",
                "type": "hybrid",
                "permissions": ["network_access", "reader_control"],
                "dependencies": ["ocr-engine@>=2.0.0", "fonts@=1.0.0"],
                "configurable": true,
                "metadata": {"source_lang": "ja"}
            }"#,
        );

        let meta = extract_metadata(&pkg).unwrap();
        assert_eq!(meta.id, "panel-translate");
        assert_eq!(meta.version, Version::new(1, 2, 0));
        assert_eq!(meta.category, PluginCategory::Translation);
        assert_eq!(meta.kind, PluginKind::Hybrid);
        assert_eq!(meta.permissions.len(), 2);
        assert_eq!(meta.dependencies.len(), 2);
        assert_eq!(
            meta.dependencies[1].constraint,
            VersionConstraint::Exact(Version::new(1, 0, 0))
        );
        assert!(meta.configurable);
        assert_eq!(meta.package_path, pkg);
    }

    #[test]
    fn missing_manifest_entry() {
        let dir = TempDir::new().unwrap();
        let pkg = dir.path().join("p.fpkg");
        write_package(&pkg, &[("code/main.lua", b"return 1".as_slice())]);

        let err = extract_metadata(&pkg).unwrap_err();
        assert!(matches!(err, PluginError::Manifest(ManifestError::Missing)));
    }

    #[test]
    fn missing_id_is_malformed() {
        let dir = TempDir::new().unwrap();
        let pkg = package_with_manifest(
            &dir,
            r#"{"name": "x", "version": "1.0.0", "category": "utility", "type": "script"}"#,
        );

        let err = extract_metadata(&pkg).unwrap_err();
        assert!(matches!(err, PluginError::Manifest(ManifestError::Malformed(_))));
    }

    #[test]
    fn blank_id_is_malformed() {
        let dir = TempDir::new().unwrap();
        let pkg = package_with_manifest(
            &dir,
            r#"{"id": "  ", "name": "x", "version": "1.0.0", "category": "utility", "type": "script"}"#,
        );

        let err = extract_metadata(&pkg).unwrap_err();
        assert!(matches!(err, PluginError::Manifest(ManifestError::Malformed(_))));
    }

    #[test]
    fn bad_version_is_malformed() {
        let dir = TempDir::new().unwrap();
        let pkg = package_with_manifest(
            &dir,
            r#"{"id": "x", "name": "x", "version": "one", "category": "utility", "type": "script"}"#,
        );

        let err = extract_metadata(&pkg).unwrap_err();
        assert!(matches!(err, PluginError::Manifest(ManifestError::Malformed(_))));
    }

    #[test]
    fn duplicate_permission_is_malformed() {
        let dir = TempDir::new().unwrap();
        let pkg = package_with_manifest(
            &dir,
            r#"{"id": "x", "name": "x", "version": "1.0.0", "category": "utility",
                "type": "script", "permissions": ["read_files", "read_files"]}"#,
        );

        let err = extract_metadata(&pkg).unwrap_err();
        assert!(matches!(err, PluginError::Manifest(ManifestError::Malformed(_))));
    }

    #[test]
    fn self_dependency_is_malformed() {
        let dir = TempDir::new().unwrap();
        let pkg = package_with_manifest(
            &dir,
            r#"{"id": "x", "name": "x", "version": "1.0.0", "category": "utility",
                "type": "script", "dependencies": ["x@>=1.0.0"]}"#,
        );

        let err = extract_metadata(&pkg).unwrap_err();
        assert!(matches!(err, PluginError::Manifest(ManifestError::Malformed(_))));
    }

    #[test]
    fn unknown_category_is_malformed() {
        let dir = TempDir::new().unwrap();
        let pkg = package_with_manifest(
            &dir,
            r#"{"id": "x", "name": "x", "version": "1.0.0", "category": "games", "type": "script"}"#,
        );

        let err = extract_metadata(&pkg).unwrap_err();
        assert!(matches!(err, PluginError::Manifest(ManifestError::Malformed(_))));
    }
}
