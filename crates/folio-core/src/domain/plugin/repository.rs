//! Plugin repository for database operations
//!
//! Bridges `Plugin` records to the SQLite store. A single plugin record spans
//! the `plugins` row and its typed child tables (requested permissions,
//! grants, dependency constraints, metadata); every write that touches more
//! than one of them runs in one transaction so readers never observe a torn
//! record.

use super::entity::{
    DependencySpec, Plugin, PluginCategory, PluginKind, PluginPermission, Version,
    VersionConstraint,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use futures_core::Stream;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::watch;

/// Repository for plugin database operations
///
/// Clones share the same pool and change-notification channel, so a stream
/// obtained from one clone wakes up on writes made through another.
#[derive(Debug, Clone)]
pub struct PluginRepository {
    pool: SqlitePool,
    revision: watch::Sender<u64>,
}

impl PluginRepository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        let (revision, _) = watch::channel(0);
        Self { pool, revision }
    }

    /// Get a reference to the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn notify_changed(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    // ========== Queries ==========

    /// Get a plugin by id
    pub async fn get(&self, id: &str) -> Result<Option<Plugin>> {
        let row: Option<PluginRow> = sqlx::query_as(&format!(
            "{SELECT_PLUGIN} WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    /// Get all plugins ordered by name
    pub async fn get_all(&self) -> Result<Vec<Plugin>> {
        let rows: Vec<PluginRow> = sqlx::query_as(&format!(
            "{SELECT_PLUGIN} ORDER BY name COLLATE NOCASE"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        self.hydrate_all(rows).await
    }

    /// Get all enabled plugins ordered by name
    pub async fn get_enabled(&self) -> Result<Vec<Plugin>> {
        let rows: Vec<PluginRow> = sqlx::query_as(&format!(
            "{SELECT_PLUGIN} WHERE is_enabled = 1 ORDER BY name COLLATE NOCASE"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        self.hydrate_all(rows).await
    }

    /// Get all plugins in a category ordered by name
    pub async fn get_by_category(&self, category: PluginCategory) -> Result<Vec<Plugin>> {
        let rows: Vec<PluginRow> = sqlx::query_as(&format!(
            "{SELECT_PLUGIN} WHERE category = ? ORDER BY name COLLATE NOCASE"
        ))
        .bind(category.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        self.hydrate_all(rows).await
    }

    /// Count installed plugins
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM plugins")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(count)
    }

    /// Count enabled plugins
    pub async fn count_enabled(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM plugins WHERE is_enabled = 1")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::DatabaseError)?;
        Ok(count)
    }

    // ========== Reactive queries ==========

    /// Stream the full plugin list, re-emitting after every repository write
    pub fn watch_all(&self) -> impl Stream<Item = Result<Vec<Plugin>>> + Send + use<> {
        let repo = self.clone();
        let mut rx = self.revision.subscribe();
        async_stream::try_stream! {
            loop {
                let plugins = repo.get_all().await?;
                yield plugins;
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Stream the enabled plugin list, re-emitting after every repository write
    pub fn watch_enabled(&self) -> impl Stream<Item = Result<Vec<Plugin>>> + Send + use<> {
        let repo = self.clone();
        let mut rx = self.revision.subscribe();
        async_stream::try_stream! {
            loop {
                let plugins = repo.get_enabled().await?;
                yield plugins;
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    // ========== Mutations ==========

    /// Insert or replace a plugin record and its child tables
    ///
    /// Grants not present in the new requested set are pruned in the same
    /// transaction, preserving granted ⊆ requested across updates.
    pub async fn upsert(&self, plugin: &Plugin) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;

        let package_path = plugin
            .package_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        sqlx::query(
            r#"
            INSERT INTO plugins (
                id, name, version, author, description, category, kind,
                is_enabled, is_installed, configurable,
                icon_url, source_url, package_path,
                installed_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                author = excluded.author,
                description = excluded.description,
                category = excluded.category,
                kind = excluded.kind,
                is_enabled = excluded.is_enabled,
                is_installed = excluded.is_installed,
                configurable = excluded.configurable,
                icon_url = excluded.icon_url,
                source_url = excluded.source_url,
                package_path = excluded.package_path,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&plugin.id)
        .bind(&plugin.name)
        .bind(plugin.version.to_string())
        .bind(&plugin.author)
        .bind(&plugin.description)
        .bind(plugin.category.as_str())
        .bind(plugin.kind.as_str())
        .bind(plugin.is_enabled)
        .bind(plugin.is_installed)
        .bind(plugin.configurable)
        .bind(&plugin.icon_url)
        .bind(&plugin.source_url)
        .bind(&package_path)
        .bind(plugin.installed_at)
        .bind(plugin.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::DatabaseError)?;

        sqlx::query("DELETE FROM plugin_permissions WHERE plugin_id = ?")
            .bind(&plugin.id)
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;

        for permission in &plugin.permissions {
            sqlx::query(
                "INSERT OR IGNORE INTO plugin_permissions (plugin_id, permission) VALUES (?, ?)",
            )
            .bind(&plugin.id)
            .bind(permission.as_str())
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;
        }

        // Prune grants that the new requested set no longer covers
        if plugin.permissions.is_empty() {
            sqlx::query("DELETE FROM plugin_grants WHERE plugin_id = ?")
                .bind(&plugin.id)
                .execute(&mut *tx)
                .await
                .map_err(Error::DatabaseError)?;
        } else {
            sqlx::query(
                "DELETE FROM plugin_grants
                 WHERE plugin_id = ?
                   AND permission NOT IN (
                       SELECT permission FROM plugin_permissions WHERE plugin_id = ?)",
            )
            .bind(&plugin.id)
            .bind(&plugin.id)
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;
        }

        sqlx::query("DELETE FROM plugin_dependencies WHERE plugin_id = ?")
            .bind(&plugin.id)
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;

        for (position, dep) in plugin.dependencies.iter().enumerate() {
            let (op, min, max) = match dep.constraint {
                VersionConstraint::Exact(v) => ("exact", v.to_string(), None),
                VersionConstraint::AtLeast(v) => ("at_least", v.to_string(), None),
                VersionConstraint::Range { min, max } => {
                    ("range", min.to_string(), Some(max.to_string()))
                }
            };
            sqlx::query(
                "INSERT INTO plugin_dependencies
                     (plugin_id, position, dep_id, op, min_version, max_version)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&plugin.id)
            .bind(position as i64)
            .bind(&dep.plugin_id)
            .bind(op)
            .bind(min)
            .bind(max)
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;
        }

        sqlx::query("DELETE FROM plugin_metadata WHERE plugin_id = ?")
            .bind(&plugin.id)
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;

        for (key, value) in &plugin.metadata {
            sqlx::query("INSERT INTO plugin_metadata (plugin_id, key, value) VALUES (?, ?, ?)")
                .bind(&plugin.id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(Error::DatabaseError)?;
        }

        tx.commit().await.map_err(Error::DatabaseError)?;
        self.notify_changed();
        Ok(())
    }

    /// Delete a plugin record (child tables cascade)
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM plugins WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        self.notify_changed();
        Ok(())
    }

    // ========== Grants ==========

    /// Get the granted permission set for a plugin
    pub async fn get_grants(&self, id: &str) -> Result<HashSet<PluginPermission>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT permission FROM plugin_grants WHERE plugin_id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::DatabaseError)?;

        rows.iter()
            .map(|(s,)| PluginPermission::parse(s))
            .collect()
    }

    /// Get the granted permission sets for all plugins
    pub async fn get_all_grants(&self) -> Result<HashMap<String, HashSet<PluginPermission>>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT plugin_id, permission FROM plugin_grants")
                .fetch_all(&self.pool)
                .await
                .map_err(Error::DatabaseError)?;

        let mut grants: HashMap<String, HashSet<PluginPermission>> = HashMap::new();
        for (plugin_id, permission) in rows {
            grants
                .entry(plugin_id)
                .or_default()
                .insert(PluginPermission::parse(&permission)?);
        }
        Ok(grants)
    }

    /// Record a granted permission
    pub async fn insert_grant(&self, id: &str, permission: PluginPermission) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO plugin_grants (plugin_id, permission) VALUES (?, ?)")
            .bind(id)
            .bind(permission.as_str())
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(())
    }

    /// Remove a granted permission
    pub async fn delete_grant(&self, id: &str, permission: PluginPermission) -> Result<()> {
        sqlx::query("DELETE FROM plugin_grants WHERE plugin_id = ? AND permission = ?")
            .bind(id)
            .bind(permission.as_str())
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(())
    }

    // ========== Hydration ==========

    async fn hydrate_all(&self, rows: Vec<PluginRow>) -> Result<Vec<Plugin>> {
        let mut plugins = Vec::with_capacity(rows.len());
        for row in rows {
            plugins.push(self.hydrate(row).await?);
        }
        Ok(plugins)
    }

    async fn hydrate(&self, row: PluginRow) -> Result<Plugin> {
        let permissions: Vec<(String,)> = sqlx::query_as(
            "SELECT permission FROM plugin_permissions WHERE plugin_id = ? ORDER BY permission",
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let dependencies: Vec<DependencyRow> = sqlx::query_as(
            "SELECT dep_id, op, min_version, max_version
             FROM plugin_dependencies WHERE plugin_id = ? ORDER BY position",
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let metadata: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM plugin_metadata WHERE plugin_id = ?")
                .bind(&row.id)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::DatabaseError)?;

        let permissions = permissions
            .iter()
            .map(|(s,)| PluginPermission::parse(s))
            .collect::<Result<Vec<_>>>()?;

        let dependencies = dependencies
            .into_iter()
            .map(DependencyRow::into_spec)
            .collect::<Result<Vec<_>>>()?;

        row.into_plugin(permissions, dependencies, metadata.into_iter().collect())
    }
}

const SELECT_PLUGIN: &str = r#"
    SELECT id, name, version, author, description, category, kind,
           is_enabled, is_installed, configurable,
           icon_url, source_url, package_path,
           installed_at, updated_at
    FROM plugins
"#;

#[derive(sqlx::FromRow)]
struct PluginRow {
    id: String,
    name: String,
    version: String,
    author: String,
    description: String,
    category: String,
    kind: String,
    is_enabled: bool,
    is_installed: bool,
    configurable: bool,
    icon_url: Option<String>,
    source_url: Option<String>,
    package_path: Option<String>,
    installed_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PluginRow {
    fn into_plugin(
        self,
        permissions: Vec<PluginPermission>,
        dependencies: Vec<DependencySpec>,
        metadata: HashMap<String, String>,
    ) -> Result<Plugin> {
        Ok(Plugin {
            version: self.version.parse()?,
            category: PluginCategory::parse(&self.category)?,
            kind: PluginKind::parse(&self.kind)?,
            id: self.id,
            name: self.name,
            author: self.author,
            description: self.description,
            permissions,
            dependencies,
            is_enabled: self.is_enabled,
            is_installed: self.is_installed,
            configurable: self.configurable,
            icon_url: self.icon_url,
            source_url: self.source_url,
            package_path: self.package_path.map(PathBuf::from),
            metadata,
            installed_at: self.installed_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DependencyRow {
    dep_id: String,
    op: String,
    min_version: String,
    max_version: Option<String>,
}

impl DependencyRow {
    fn into_spec(self) -> Result<DependencySpec> {
        let min: Version = self.min_version.parse()?;
        let constraint = match self.op.as_str() {
            "exact" => VersionConstraint::Exact(min),
            "at_least" => VersionConstraint::AtLeast(min),
            "range" => {
                let max = self
                    .max_version
                    .ok_or_else(|| Error::InvalidInput("range constraint without upper bound".into()))?
                    .parse()?;
                VersionConstraint::Range { min, max }
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "unknown dependency op: {other}"
                )));
            }
        };
        Ok(DependencySpec {
            plugin_id: self.dep_id,
            constraint,
        })
    }
}
