//! Permission management
//!
//! Holds the per-plugin granted capability sets. Checks are synchronous
//! in-memory set lookups so sandbox call mediation never waits on I/O;
//! grant/revoke mutations write through to the repository. The granted set
//! is always a subset of what the plugin's manifest requested.

use crate::error::{PermissionError, PluginResult};
use folio_core::domain::plugin::{PluginPermission, PluginRepository};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::debug;

/// Answers permission checks and owns the granted-permission sets
#[derive(Debug)]
pub struct PermissionManager {
    repository: PluginRepository,
    grants: RwLock<HashMap<String, HashSet<PluginPermission>>>,
}

impl PermissionManager {
    pub fn new(repository: PluginRepository) -> Self {
        Self {
            repository,
            grants: RwLock::new(HashMap::new()),
        }
    }

    /// Hydrate the in-memory grant sets from the repository
    pub async fn load(&self) -> PluginResult<()> {
        let persisted = self.repository.get_all_grants().await?;
        let mut grants = self.grants.write().expect("grants lock poisoned");
        *grants = persisted;
        Ok(())
    }

    /// Whether `permission` is currently granted to `plugin_id`.
    ///
    /// Synchronous and side-effect-free; called before every mediated
    /// capability invocation. Revocation takes effect for the next call,
    /// never retroactively on in-flight ones.
    pub fn check_permission(&self, plugin_id: &str, permission: PluginPermission) -> bool {
        self.grants
            .read()
            .expect("grants lock poisoned")
            .get(plugin_id)
            .map(|set| set.contains(&permission))
            .unwrap_or(false)
    }

    /// Snapshot of the currently granted set for a plugin
    pub fn granted(&self, plugin_id: &str) -> HashSet<PluginPermission> {
        self.grants
            .read()
            .expect("grants lock poisoned")
            .get(plugin_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Grant a permission the plugin's manifest requested.
    ///
    /// Granting anything outside the requested set is refused, keeping
    /// granted ⊆ requested.
    pub async fn grant(&self, plugin_id: &str, permission: PluginPermission) -> PluginResult<()> {
        let plugin = self
            .repository
            .get(plugin_id)
            .await?
            .ok_or_else(|| folio_core::Error::PluginNotFound(plugin_id.to_string()))?;

        if !plugin.requests(permission) {
            return Err(PermissionError::Denied {
                plugin_id: plugin_id.to_string(),
                permission: permission.as_str().to_string(),
            }
            .into());
        }

        self.repository.insert_grant(plugin_id, permission).await?;
        self.grants
            .write()
            .expect("grants lock poisoned")
            .entry(plugin_id.to_string())
            .or_default()
            .insert(permission);

        debug!(plugin_id = %plugin_id, permission = permission.as_str(), "permission granted");
        Ok(())
    }

    /// Grant a batch of requested permissions (install-time approval result)
    pub async fn grant_all(
        &self,
        plugin_id: &str,
        permissions: &[PluginPermission],
    ) -> PluginResult<()> {
        for permission in permissions {
            self.grant(plugin_id, *permission).await?;
        }
        Ok(())
    }

    /// Revoke a granted permission. Affects the next capability call.
    pub async fn revoke(&self, plugin_id: &str, permission: PluginPermission) -> PluginResult<()> {
        self.repository.delete_grant(plugin_id, permission).await?;
        if let Some(set) = self
            .grants
            .write()
            .expect("grants lock poisoned")
            .get_mut(plugin_id)
        {
            set.remove(&permission);
        }

        debug!(plugin_id = %plugin_id, permission = permission.as_str(), "permission revoked");
        Ok(())
    }

    /// Drop all in-memory grants for a plugin (the repository rows cascade
    /// with the plugin record on uninstall)
    pub fn forget(&self, plugin_id: &str) {
        self.grants
            .write()
            .expect("grants lock poisoned")
            .remove(plugin_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use chrono::Utc;
    use folio_core::domain::plugin::{Plugin, PluginCategory, PluginKind, Version};
    use folio_core::storage::Database;
    use std::collections::HashMap as Map;

    async fn setup() -> (PluginRepository, PermissionManager) {
        let db = Database::in_memory().await.unwrap();
        let repo = PluginRepository::new(db.pool().clone());
        let manager = PermissionManager::new(repo.clone());
        (repo, manager)
    }

    fn plugin_requesting(id: &str, permissions: Vec<PluginPermission>) -> Plugin {
        Plugin {
            id: id.to_string(),
            name: id.to_string(),
            version: Version::new(1, 0, 0),
            author: String::new(),
            description: String::new(),
            category: PluginCategory::Utility,
            kind: PluginKind::Script,
            permissions,
            dependencies: vec![],
            is_enabled: false,
            is_installed: true,
            configurable: false,
            icon_url: None,
            source_url: None,
            package_path: None,
            metadata: Map::new(),
            installed_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ungranted_permission_checks_false_even_if_requested() {
        let (repo, manager) = setup().await;
        repo.upsert(&plugin_requesting(
            "t1",
            vec![PluginPermission::NetworkAccess],
        ))
        .await
        .unwrap();

        assert!(!manager.check_permission("t1", PluginPermission::NetworkAccess));
    }

    #[tokio::test]
    async fn grant_then_check_then_revoke() {
        let (repo, manager) = setup().await;
        repo.upsert(&plugin_requesting(
            "t1",
            vec![PluginPermission::NetworkAccess, PluginPermission::ReadFiles],
        ))
        .await
        .unwrap();

        manager
            .grant("t1", PluginPermission::NetworkAccess)
            .await
            .unwrap();
        assert!(manager.check_permission("t1", PluginPermission::NetworkAccess));
        assert!(!manager.check_permission("t1", PluginPermission::ReadFiles));

        manager
            .revoke("t1", PluginPermission::NetworkAccess)
            .await
            .unwrap();
        assert!(!manager.check_permission("t1", PluginPermission::NetworkAccess));
    }

    #[tokio::test]
    async fn grant_beyond_requested_is_refused() {
        let (repo, manager) = setup().await;
        repo.upsert(&plugin_requesting("t1", vec![PluginPermission::ReadFiles]))
            .await
            .unwrap();

        let err = manager
            .grant("t1", PluginPermission::CameraAccess)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PluginError::Permission(PermissionError::Denied { .. })
        ));
        assert!(!manager.check_permission("t1", PluginPermission::CameraAccess));
    }

    #[tokio::test]
    async fn grants_survive_reload() {
        let (repo, manager) = setup().await;
        repo.upsert(&plugin_requesting("t1", vec![PluginPermission::ReadFiles]))
            .await
            .unwrap();
        manager
            .grant("t1", PluginPermission::ReadFiles)
            .await
            .unwrap();

        let fresh = PermissionManager::new(repo.clone());
        assert!(!fresh.check_permission("t1", PluginPermission::ReadFiles));
        fresh.load().await.unwrap();
        assert!(fresh.check_permission("t1", PluginPermission::ReadFiles));
    }

    #[tokio::test]
    async fn forget_clears_memory() {
        let (repo, manager) = setup().await;
        repo.upsert(&plugin_requesting("t1", vec![PluginPermission::ReadFiles]))
            .await
            .unwrap();
        manager
            .grant("t1", PluginPermission::ReadFiles)
            .await
            .unwrap();

        manager.forget("t1");
        assert!(!manager.check_permission("t1", PluginPermission::ReadFiles));
    }
}
