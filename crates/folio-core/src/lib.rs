//! Folio Core Library
//!
//! This crate provides the host-side foundations for Folio's plugin
//! subsystem:
//! - Storage (SQLite connection pool + versioned migrations)
//! - Plugin domain model (records, permissions, dependency constraints)
//! - Plugin repository with reactive queries
//! - Configuration with file persistence

pub mod config;
pub mod domain;
pub mod error;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::plugin::{
        DependencySpec, Plugin, PluginCategory, PluginKind, PluginPermission, PluginState,
        Version, VersionConstraint,
    };
    pub use crate::error::{Error, Result};
}
