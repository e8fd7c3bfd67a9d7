//! Plugin entity and value types

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Capabilities a plugin may request and be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginPermission {
    ReadFiles,
    WriteFiles,
    NetworkAccess,
    CameraAccess,
    StorageAccess,
    SystemSettings,
    ReaderControl,
    UiModification,
}

impl PluginPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadFiles => "read_files",
            Self::WriteFiles => "write_files",
            Self::NetworkAccess => "network_access",
            Self::CameraAccess => "camera_access",
            Self::StorageAccess => "storage_access",
            Self::SystemSettings => "system_settings",
            Self::ReaderControl => "reader_control",
            Self::UiModification => "ui_modification",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "read_files" => Ok(Self::ReadFiles),
            "write_files" => Ok(Self::WriteFiles),
            "network_access" => Ok(Self::NetworkAccess),
            "camera_access" => Ok(Self::CameraAccess),
            "storage_access" => Ok(Self::StorageAccess),
            "system_settings" => Ok(Self::SystemSettings),
            "reader_control" => Ok(Self::ReaderControl),
            "ui_modification" => Ok(Self::UiModification),
            other => Err(Error::InvalidInput(format!("unknown permission: {other}"))),
        }
    }
}

/// Marketplace category of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCategory {
    ReaderEnhancement,
    ImageProcessing,
    Translation,
    Export,
    Utility,
    Theme,
    FormatSupport,
    Integration,
}

impl PluginCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReaderEnhancement => "reader_enhancement",
            Self::ImageProcessing => "image_processing",
            Self::Translation => "translation",
            Self::Export => "export",
            Self::Utility => "utility",
            Self::Theme => "theme",
            Self::FormatSupport => "format_support",
            Self::Integration => "integration",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "reader_enhancement" => Ok(Self::ReaderEnhancement),
            "image_processing" => Ok(Self::ImageProcessing),
            "translation" => Ok(Self::Translation),
            "export" => Ok(Self::Export),
            "utility" => Ok(Self::Utility),
            "theme" => Ok(Self::Theme),
            "format_support" => Ok(Self::FormatSupport),
            "integration" => Ok(Self::Integration),
            other => Err(Error::InvalidInput(format!("unknown category: {other}"))),
        }
    }
}

/// How a plugin's code is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Interpreted script, run by a host-provided runtime
    Script,
    /// Compiled wasm module
    Native,
    /// Wasm module plus script glue
    Hybrid,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Native => "native",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "script" => Ok(Self::Script),
            "native" => Ok(Self::Native),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(Error::InvalidInput(format!("unknown plugin kind: {other}"))),
        }
    }
}

/// Runtime lifecycle state of an active plugin instance. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Inactive,
    Loading,
    Active,
    Error,
    Updating,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Loading => "loading",
            Self::Active => "active",
            Self::Error => "error",
            Self::Updating => "updating",
        };
        write!(f, "{s}")
    }
}

/// A plugin version: `major.minor.patch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidInput(format!("invalid version: {s}"));
        let mut parts = s.split('.');
        let major = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let minor = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let patch = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A version requirement on another plugin
///
/// Grammar: `=x.y.z` (exact), `>=x.y.z` (minimum), `>=a.b.c,<x.y.z`
/// (bounded range, upper bound exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionConstraint {
    Exact(Version),
    AtLeast(Version),
    Range { min: Version, max: Version },
}

impl VersionConstraint {
    pub fn satisfies(&self, version: Version) -> bool {
        match self {
            Self::Exact(v) => version == *v,
            Self::AtLeast(v) => version >= *v,
            Self::Range { min, max } => version >= *min && version < *max,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        if let Some((lower, upper)) = s.split_once(',') {
            let min = lower
                .strip_prefix(">=")
                .ok_or_else(|| Error::InvalidInput(format!("invalid constraint: {s}")))?
                .parse()?;
            let max = upper
                .strip_prefix('<')
                .ok_or_else(|| Error::InvalidInput(format!("invalid constraint: {s}")))?
                .parse()?;
            if max <= min {
                return Err(Error::InvalidInput(format!("empty version range: {s}")));
            }
            return Ok(Self::Range { min, max });
        }
        if let Some(v) = s.strip_prefix(">=") {
            return Ok(Self::AtLeast(v.parse()?));
        }
        if let Some(v) = s.strip_prefix('=') {
            return Ok(Self::Exact(v.parse()?));
        }
        Err(Error::InvalidInput(format!("invalid constraint: {s}")))
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "={v}"),
            Self::AtLeast(v) => write!(f, ">={v}"),
            Self::Range { min, max } => write!(f, ">={min},<{max}"),
        }
    }
}

/// A declared dependency on another plugin: `<id>@<constraint>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub plugin_id: String,
    pub constraint: VersionConstraint,
}

impl DependencySpec {
    pub fn parse(s: &str) -> Result<Self> {
        let (id, constraint) = s
            .split_once('@')
            .ok_or_else(|| Error::InvalidInput(format!("invalid dependency: {s}")))?;
        if id.trim().is_empty() {
            return Err(Error::InvalidInput(format!("invalid dependency: {s}")));
        }
        Ok(Self {
            plugin_id: id.to_string(),
            constraint: VersionConstraint::parse(constraint)?,
        })
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.plugin_id, self.constraint)
    }
}

impl Serialize for DependencySpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DependencySpec {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// An installed plugin record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plugin {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub author: String,
    pub description: String,
    pub category: PluginCategory,
    pub kind: PluginKind,
    /// Permissions the manifest requested. The granted set lives with the
    /// permission manager and is always a subset of this.
    pub permissions: Vec<PluginPermission>,
    pub dependencies: Vec<DependencySpec>,
    pub is_enabled: bool,
    pub is_installed: bool,
    pub configurable: bool,
    pub icon_url: Option<String>,
    pub source_url: Option<String>,
    pub package_path: Option<PathBuf>,
    pub metadata: HashMap<String, String>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plugin {
    /// Mark the plugin enabled. Fails unless it is installed.
    pub fn enable(&mut self) -> Result<()> {
        if !self.is_installed {
            return Err(Error::InvalidInput(format!(
                "plugin '{}' is not installed",
                self.id
            )));
        }
        self.is_enabled = true;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn disable(&mut self) {
        self.is_enabled = false;
        self.updated_at = Utc::now();
    }

    /// Whether the manifest requested the given permission
    pub fn requests(&self, permission: PluginPermission) -> bool {
        self.permissions.contains(&permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_and_orders() {
        let v: Version = "1.2.3".parse().unwrap();
        assert_eq!(v, Version::new(1, 2, 3));
        assert!(Version::new(1, 2, 3) < Version::new(1, 10, 0));
        assert!(Version::new(2, 0, 0) > Version::new(1, 99, 99));
        assert_eq!(v.to_string(), "1.2.3");
    }

    #[test]
    fn version_rejects_garbage() {
        assert!("1.2".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
        assert!("a.b.c".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
    }

    #[test]
    fn constraint_exact() {
        let c = VersionConstraint::parse("=1.0.0").unwrap();
        assert!(c.satisfies(Version::new(1, 0, 0)));
        assert!(!c.satisfies(Version::new(1, 0, 1)));
    }

    #[test]
    fn constraint_at_least() {
        let c = VersionConstraint::parse(">=2.0.0").unwrap();
        assert!(c.satisfies(Version::new(2, 0, 0)));
        assert!(c.satisfies(Version::new(3, 1, 4)));
        assert!(!c.satisfies(Version::new(1, 9, 9)));
    }

    #[test]
    fn constraint_range_upper_bound_exclusive() {
        let c = VersionConstraint::parse(">=1.0.0,<2.0.0").unwrap();
        assert!(c.satisfies(Version::new(1, 5, 0)));
        assert!(!c.satisfies(Version::new(2, 0, 0)));
        assert!(!c.satisfies(Version::new(0, 9, 0)));
    }

    #[test]
    fn constraint_rejects_empty_range_and_bad_ops() {
        assert!(VersionConstraint::parse(">=2.0.0,<1.0.0").is_err());
        assert!(VersionConstraint::parse("^1.0.0").is_err());
        assert!(VersionConstraint::parse("1.0.0").is_err());
    }

    #[test]
    fn dependency_spec_round_trips() {
        let dep = DependencySpec::parse("ocr-engine@>=2.0.0").unwrap();
        assert_eq!(dep.plugin_id, "ocr-engine");
        assert_eq!(dep.to_string(), "ocr-engine@>=2.0.0");

        assert!(DependencySpec::parse("no-constraint").is_err());
        assert!(DependencySpec::parse("@>=1.0.0").is_err());
    }

    #[test]
    fn permission_round_trips_through_str() {
        for p in [
            PluginPermission::ReadFiles,
            PluginPermission::WriteFiles,
            PluginPermission::NetworkAccess,
            PluginPermission::CameraAccess,
            PluginPermission::StorageAccess,
            PluginPermission::SystemSettings,
            PluginPermission::ReaderControl,
            PluginPermission::UiModification,
        ] {
            assert_eq!(PluginPermission::parse(p.as_str()).unwrap(), p);
        }
        assert!(PluginPermission::parse("root_access").is_err());
    }

    #[test]
    fn permission_serde_uses_snake_case() {
        let json = serde_json::to_string(&PluginPermission::NetworkAccess).unwrap();
        assert_eq!(json, "\"network_access\"");
    }

    #[test]
    fn category_and_kind_round_trip() {
        assert_eq!(
            PluginCategory::parse("format_support").unwrap(),
            PluginCategory::FormatSupport
        );
        assert_eq!(PluginKind::parse("hybrid").unwrap(), PluginKind::Hybrid);
        assert!(PluginCategory::parse("games").is_err());
    }

    fn sample_plugin() -> Plugin {
        Plugin {
            id: "night-mode".to_string(),
            name: "Night Mode".to_string(),
            version: Version::new(1, 0, 0),
            author: "folio".to_string(),
            description: "Inverts page colors".to_string(),
            category: PluginCategory::Theme,
            kind: PluginKind::Script,
            permissions: vec![PluginPermission::UiModification],
            dependencies: vec![],
            is_enabled: false,
            is_installed: true,
            configurable: false,
            icon_url: None,
            source_url: None,
            package_path: None,
            metadata: HashMap::new(),
            installed_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn enable_requires_installed() {
        let mut plugin = sample_plugin();
        plugin.is_installed = false;
        assert!(plugin.enable().is_err());
        assert!(!plugin.is_enabled);

        plugin.is_installed = true;
        plugin.enable().unwrap();
        assert!(plugin.is_enabled);

        plugin.disable();
        assert!(!plugin.is_enabled);
    }
}
