//! Marketplace collaborator contract
//!
//! The marketplace client (HTTP, catalog format, mirrors) lives outside this
//! subsystem; only the downloaded local artifact feeds into
//! `PluginManager::install`. This module pins down the contract the host
//! wires in.

use crate::error::PluginResult;
use async_trait::async_trait;
use folio_core::domain::plugin::{PluginCategory, Version};
use std::path::PathBuf;

/// A plugin as listed by the remote marketplace
#[derive(Debug, Clone)]
pub struct RemotePluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub description: String,
    pub category: PluginCategory,
    pub download_size_bytes: u64,
}

/// Remote catalog the host can search and download from
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Search the catalog; an empty query lists everything
    async fn search(&self, query: &str) -> PluginResult<Vec<RemotePluginDescriptor>>;

    /// Download a package and return the local archive path to install from
    async fn download(&self, id: &str) -> PluginResult<PathBuf>;
}
