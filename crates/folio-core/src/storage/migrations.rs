//! Database migrations
//!
//! This module manages SQLite schema migrations for folio.
//! Migrations are versioned and applied automatically on database connection.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 1;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Plugin registry schema
///
/// Requested permissions, granted permissions, dependency constraints, and
/// the free-form metadata map are stored as typed child tables rather than
/// encoded JSON columns.
const MIGRATION_V1: &str = r#"
    -- Installed plugins
    CREATE TABLE IF NOT EXISTS plugins (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        author TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        category TEXT NOT NULL CHECK (category IN (
            'reader_enhancement', 'image_processing', 'translation', 'export',
            'utility', 'theme', 'format_support', 'integration')),
        kind TEXT NOT NULL CHECK (kind IN ('script', 'native', 'hybrid')),
        is_enabled INTEGER NOT NULL DEFAULT 0 CHECK (is_enabled IN (0, 1)),
        is_installed INTEGER NOT NULL DEFAULT 1 CHECK (is_installed IN (0, 1)),
        configurable INTEGER NOT NULL DEFAULT 0 CHECK (configurable IN (0, 1)),
        icon_url TEXT,
        source_url TEXT,
        package_path TEXT,
        installed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        CHECK (is_enabled = 0 OR is_installed = 1)
    );

    CREATE INDEX IF NOT EXISTS idx_plugins_name ON plugins(name);
    CREATE INDEX IF NOT EXISTS idx_plugins_category ON plugins(category);
    CREATE INDEX IF NOT EXISTS idx_plugins_enabled ON plugins(is_enabled);

    -- Permissions a plugin's manifest requested
    CREATE TABLE IF NOT EXISTS plugin_permissions (
        plugin_id TEXT NOT NULL REFERENCES plugins(id) ON DELETE CASCADE,
        permission TEXT NOT NULL,
        PRIMARY KEY (plugin_id, permission)
    );

    -- Permissions actually granted (always a subset of requested)
    CREATE TABLE IF NOT EXISTS plugin_grants (
        plugin_id TEXT NOT NULL REFERENCES plugins(id) ON DELETE CASCADE,
        permission TEXT NOT NULL,
        granted_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (plugin_id, permission)
    );

    -- Declared dependency constraints, in manifest order
    CREATE TABLE IF NOT EXISTS plugin_dependencies (
        plugin_id TEXT NOT NULL REFERENCES plugins(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        dep_id TEXT NOT NULL,
        op TEXT NOT NULL CHECK (op IN ('exact', 'at_least', 'range')),
        min_version TEXT NOT NULL,
        max_version TEXT,
        PRIMARY KEY (plugin_id, position)
    );

    CREATE INDEX IF NOT EXISTS idx_plugin_dependencies_dep_id
        ON plugin_dependencies(dep_id);

    -- Free-form manifest metadata
    CREATE TABLE IF NOT EXISTS plugin_metadata (
        plugin_id TEXT NOT NULL REFERENCES plugins(id) ON DELETE CASCADE,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (plugin_id, key)
    );
"#;

/// Get the current schema version recorded in the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let version: Option<(i32,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(version.map(|(v,)| v).unwrap_or(0))
}

async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Plugin registry schema");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}
