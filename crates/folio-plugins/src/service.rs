//! UI-facing plugin service
//!
//! Thin bridge consumed by the host's plugin screens: wraps the
//! validate→extract→resolve→persist pipeline behind single calls and
//! delegates the reactive list queries. Results come back as
//! [`PluginResult`] values whose error messages are category-prefixed
//! ("validation error: …", "dependency error: …", "persistence error: …"),
//! so the UI can show them without knowing the taxonomy.

use crate::error::PluginResult;
use crate::manager::PluginManager;
use folio_core::Result as CoreResult;
use folio_core::domain::plugin::{Plugin, PluginCategory};
use futures_core::Stream;
use std::path::Path;
use std::sync::Arc;

/// Facade over the manager and repository for host UI code
#[derive(Clone)]
pub struct PluginService {
    manager: Arc<PluginManager>,
}

impl PluginService {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    /// Run the full install pipeline and return the final result for
    /// display
    pub async fn install_plugin(&self, package_path: &Path) -> PluginResult<Plugin> {
        self.manager.install(package_path).await
    }

    pub async fn uninstall_plugin(&self, id: &str, force: bool) -> PluginResult<()> {
        self.manager.uninstall(id, force).await
    }

    pub async fn enable_plugin(&self, id: &str) -> PluginResult<Plugin> {
        self.manager.enable(id).await
    }

    pub async fn disable_plugin(&self, id: &str) -> PluginResult<Plugin> {
        self.manager.disable(id).await
    }

    pub async fn rollback_plugin(&self, id: &str, version: &str) -> PluginResult<Plugin> {
        self.manager.rollback(id, version).await
    }

    // ========== Queries for list screens ==========

    pub async fn all_plugins(&self) -> PluginResult<Vec<Plugin>> {
        Ok(self.manager.repository().get_all().await?)
    }

    pub async fn plugins_by_category(&self, category: PluginCategory) -> PluginResult<Vec<Plugin>> {
        Ok(self.manager.repository().get_by_category(category).await?)
    }

    pub async fn plugin_by_id(&self, id: &str) -> PluginResult<Option<Plugin>> {
        Ok(self.manager.repository().get(id).await?)
    }

    pub async fn counts(&self) -> PluginResult<(i64, i64)> {
        let total = self.manager.repository().count().await?;
        let enabled = self.manager.repository().count_enabled().await?;
        Ok((total, enabled))
    }

    /// Reactive stream of all plugins ordered by name
    pub fn watch_all(&self) -> impl Stream<Item = CoreResult<Vec<Plugin>>> + Send {
        self.manager.repository().watch_all()
    }

    /// Reactive stream of enabled plugins
    pub fn watch_enabled(&self) -> impl Stream<Item = CoreResult<Vec<Plugin>>> + Send {
        self.manager.repository().watch_enabled()
    }
}
