//! Folio CLI - plugin management for the Folio reader

use clap::{Parser, Subcommand};
use folio_core::config::Config;
use folio_core::domain::plugin::{PluginCategory, PluginPermission, PluginRepository};
use folio_core::storage::{Database, DatabaseConfig};
use folio_plugins::{PermissionManager, PluginManager, PluginService};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "folio")]
#[command(author, version, about = "Folio reader - plugin management", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage plugins
    Plugins {
        #[command(subcommand)]
        action: PluginAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum PluginAction {
    /// List installed plugins
    List {
        /// Filter by category
        #[arg(short, long)]
        category: Option<String>,
        /// Only enabled plugins
        #[arg(short, long)]
        enabled: bool,
    },
    /// Install a plugin package
    Install {
        /// Path to the package archive
        package: PathBuf,
    },
    /// Uninstall a plugin
    Uninstall {
        id: String,
        /// Remove even if other enabled plugins depend on it
        #[arg(short, long)]
        force: bool,
    },
    /// Enable a plugin
    Enable { id: String },
    /// Disable a plugin
    Disable { id: String },
    /// Reinstall a retained package version
    Rollback { id: String, version: String },
    /// Show plugin details
    Info { id: String },
    /// Grant a requested permission
    Grant { id: String, permission: String },
    /// Revoke a granted permission
    Revoke { id: String, permission: String },
}

fn validate_signer_key_on_startup(config: &Config) -> anyhow::Result<()> {
    let Some(key_b64) = config.plugins.resolved_signer_key() else {
        eprintln!("Warning: no plugin signer key configured");
        eprintln!("Warning: package signatures will NOT be verified");
        return Ok(());
    };

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;

    let key_bytes = BASE64_STANDARD
        .decode(&key_b64)
        .map_err(|e| anyhow::anyhow!("Invalid plugin signer key encoding: {}", e))?;

    if key_bytes.len() != 32 {
        return Err(anyhow::anyhow!(
            "Plugin signer key must be exactly 32 bytes (Ed25519 public key). Got {} bytes.",
            key_bytes.len()
        ));
    }

    ed25519_dalek::VerifyingKey::from_bytes(&key_bytes.try_into().map_err(|_| {
        anyhow::anyhow!("Plugin signer key could not be converted to 32-byte array")
    })?)
    .map_err(|e| anyhow::anyhow!("Invalid Ed25519 public key: {}", e))?;

    tracing::debug!("Plugin signer key validated successfully");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("folio=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    validate_signer_key_on_startup(&config)?;

    let db_config = match &config.storage.database_path {
        Some(path) => DatabaseConfig::with_path(path).max_connections(config.storage.max_connections),
        None => DatabaseConfig::default().max_connections(config.storage.max_connections),
    };
    let db = Database::new(db_config).await?;

    let repository = PluginRepository::new(db.pool().clone());
    let permissions = Arc::new(PermissionManager::new(repository.clone()));
    permissions.load().await?;

    let manager = PluginManager::from_config(&config, repository, permissions.clone())?;
    let service = PluginService::new(Arc::new(manager));

    match cli.command {
        Commands::Plugins { action } => cmd_plugins(&service, &permissions, action, cli.quiet).await,
        Commands::Doctor => cmd_doctor(&db, &service, cli.quiet).await,
    }
}

async fn cmd_plugins(
    service: &PluginService,
    permissions: &Arc<PermissionManager>,
    action: PluginAction,
    quiet: bool,
) -> anyhow::Result<()> {
    match action {
        PluginAction::List { category, enabled } => {
            let plugins = match category.as_deref() {
                Some(raw) => {
                    let category = PluginCategory::parse(raw)?;
                    service.plugins_by_category(category).await?
                }
                None => service.all_plugins().await?,
            };
            let plugins: Vec<_> = plugins
                .into_iter()
                .filter(|p| !enabled || p.is_enabled)
                .collect();

            if plugins.is_empty() {
                if !quiet {
                    println!("No plugins installed.");
                }
                return Ok(());
            }
            for plugin in plugins {
                let marker = if plugin.is_enabled { "*" } else { " " };
                println!(
                    "{} {}  v{}  [{}]  {}",
                    marker,
                    plugin.id,
                    plugin.version,
                    plugin.category.as_str(),
                    plugin.name
                );
            }
            Ok(())
        }

        PluginAction::Install { package } => {
            match service.install_plugin(&package).await {
                Ok(plugin) => {
                    if !quiet {
                        println!("Installed {} v{}", plugin.id, plugin.version);
                        println!("Enable it with `folio plugins enable {}`", plugin.id);
                    }
                    Ok(())
                }
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }

        PluginAction::Uninstall { id, force } => {
            service.uninstall_plugin(&id, force).await?;
            if !quiet {
                println!("Uninstalled {}", id);
            }
            Ok(())
        }

        PluginAction::Enable { id } => {
            let plugin = service.enable_plugin(&id).await?;
            if !quiet {
                println!("Enabled {} v{}", plugin.id, plugin.version);
            }
            Ok(())
        }

        PluginAction::Disable { id } => {
            let plugin = service.disable_plugin(&id).await?;
            if !quiet {
                println!("Disabled {}", plugin.id);
            }
            Ok(())
        }

        PluginAction::Rollback { id, version } => {
            let plugin = service.rollback_plugin(&id, &version).await?;
            if !quiet {
                println!("Rolled back {} to v{}", plugin.id, plugin.version);
            }
            Ok(())
        }

        PluginAction::Info { id } => {
            let Some(plugin) = service.plugin_by_id(&id).await? else {
                return Err(folio_core::Error::PluginNotFound(id).into());
            };
            println!("{}", serde_json::to_string_pretty(&plugin)?);

            let granted = permissions.granted(&plugin.id);
            let granted: Vec<_> = granted.iter().map(|p| p.as_str()).collect();
            println!("granted permissions: [{}]", granted.join(", "));
            Ok(())
        }

        PluginAction::Grant { id, permission } => {
            let permission = PluginPermission::parse(&permission)?;
            permissions.grant(&id, permission).await?;
            if !quiet {
                println!("Granted {} to {}", permission.as_str(), id);
            }
            Ok(())
        }

        PluginAction::Revoke { id, permission } => {
            let permission = PluginPermission::parse(&permission)?;
            permissions.revoke(&id, permission).await?;
            if !quiet {
                println!("Revoked {} from {}", permission.as_str(), id);
            }
            Ok(())
        }
    }
}

async fn cmd_doctor(db: &Database, service: &PluginService, quiet: bool) -> anyhow::Result<()> {
    db.health_check().await?;
    let status = db.migration_status().await?;
    let (total, enabled) = service.counts().await?;

    if !quiet {
        println!("Database: ok ({})", db.path().display());
        println!(
            "Schema: v{} (target v{})",
            status.current_version, status.target_version
        );
        println!("Plugins: {} installed, {} enabled", total, enabled);
    }

    if status.needs_migration {
        return Err(anyhow::anyhow!("database schema needs migration"));
    }
    Ok(())
}
