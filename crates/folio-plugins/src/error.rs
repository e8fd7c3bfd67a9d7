//! Error taxonomy for the plugin subsystem
//!
//! Every fallible operation returns [`PluginResult`]. Component errors stay
//! typed until they reach the manager, which surfaces them unchanged under
//! [`PluginError`] so callers can both match on the class and display a
//! category-prefixed message.

use thiserror::Error;

/// Result type used throughout the plugin subsystem
pub type PluginResult<T> = Result<T, PluginError>;

/// Package-level validation failures
#[derive(Error, Debug)]
pub enum PackageError {
    #[error("corrupt package: {0}")]
    Corrupt(String),

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("disallowed API pattern '{pattern}' in {entry}")]
    MaliciousPattern { pattern: String, entry: String },

    #[error("package too large: {actual} bytes (limit {limit})")]
    TooLarge { actual: u64, limit: u64 },
}

/// Manifest extraction failures
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("package contains no manifest")]
    Missing,

    #[error("malformed manifest: {0}")]
    Malformed(String),
}

/// Dependency resolution failures
#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("required plugin '{0}' is not installed and enabled")]
    Missing(String),

    #[error("installed plugin '{id}' v{installed} does not satisfy '{required}'")]
    VersionConflict {
        id: String,
        installed: String,
        required: String,
    },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Permission check failures
#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("plugin '{plugin_id}' was denied '{permission}'")]
    Denied {
        plugin_id: String,
        permission: String,
    },
}

/// Sandbox lifecycle and execution failures
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("sandbox initialization failed: {0}")]
    InitFailed(String),

    #[error("sandbox call timed out after {0}ms")]
    Timeout(u64),

    #[error("plugin fault: {0}")]
    RuntimeFault(String),
}

/// Manager-level failures
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("plugins depend on '{id}': {}", .dependents.join(", "))]
    DependentPluginsExist { id: String, dependents: Vec<String> },

    #[error("version {version} of '{id}' is not retained locally")]
    VersionNotAvailable { id: String, version: String },

    #[error("plugin '{0}' is not installed")]
    NotInstalled(String),

    #[error("invalid state transition: {0}")]
    InvalidState(String),
}

/// Umbrella error for the plugin subsystem
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("validation error: {0}")]
    Package(#[from] PackageError),

    #[error("validation error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("permission error: {0}")]
    Permission(#[from] PermissionError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("persistence error: {0}")]
    Persistence(#[from] folio_core::Error),

    #[error("{0}")]
    Manager(#[from] ManagerError),

    #[error("plugin IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Whether the failure came from package or manifest validation
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Package(_) | Self::Manifest(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_prefixed() {
        let err = PluginError::from(PackageError::Corrupt("truncated archive".into()));
        assert!(err.to_string().starts_with("validation error:"));
        assert!(err.is_validation());

        let err = PluginError::from(ManifestError::Missing);
        assert!(err.to_string().starts_with("validation error:"));
        assert!(err.is_validation());
    }

    #[test]
    fn dependency_errors_are_distinct_from_validation() {
        let err = PluginError::from(DependencyError::Missing("ocr".into()));
        assert!(err.to_string().starts_with("dependency error:"));
        assert!(!err.is_validation());
    }

    #[test]
    fn cycle_error_names_members() {
        let err = DependencyError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }

    #[test]
    fn dependent_plugins_error_names_dependents() {
        let err = ManagerError::DependentPluginsExist {
            id: "base".into(),
            dependents: vec!["reader-plus".into(), "ocr".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("base"));
        assert!(msg.contains("reader-plus, ocr"));
    }

    #[test]
    fn timeout_reports_budget() {
        let err = PluginError::from(SandboxError::Timeout(5000));
        assert!(err.to_string().contains("5000ms"));
    }
}
