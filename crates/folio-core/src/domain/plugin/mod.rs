//! Plugin domain model and persistence
//!
//! The `Plugin` record describes an installed extension: identity, category,
//! requested permissions, and declared dependency constraints. Granted
//! permissions are owned by the permission manager and persisted separately
//! from the requested set.

pub mod entity;
pub mod repository;

pub use entity::{
    DependencySpec, Plugin, PluginCategory, PluginKind, PluginPermission, PluginState, Version,
    VersionConstraint,
};
pub use repository::PluginRepository;
