//! Folio Plugin System
//!
//! Trust-and-execution subsystem for third-party reader extensions:
//! - Package validation (archive integrity, ed25519 signatures, static
//!   scanning, size ceilings)
//! - Manifest extraction into typed metadata
//! - Dependency resolution with cycle detection
//! - Per-plugin permission grants with synchronous checks
//! - Sandboxed execution over wasmtime with a permission-gated capability
//!   table
//! - Lifecycle orchestration (install/uninstall/enable/disable/rollback)

pub mod error;
pub mod manager;
pub mod manifest;
pub mod marketplace;
pub mod package;
pub mod permissions;
pub mod resolver;
pub mod sandbox;
pub mod service;
pub mod validator;

pub use error::{
    DependencyError, ManagerError, ManifestError, PackageError, PermissionError, PluginError,
    PluginResult, SandboxError,
};
pub use manager::{ApproveRequested, PermissionApproval, PluginManager};
pub use manifest::{PluginMetadata, extract_metadata};
pub use permissions::PermissionManager;
pub use sandbox::{PluginExecutionContext, Sandbox, SandboxBudget};
pub use service::PluginService;
pub use validator::PackageValidator;
