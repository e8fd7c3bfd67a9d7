//! Plugin lifecycle orchestration
//!
//! The manager owns every install/uninstall/enable/disable/rollback
//! transition and the sandboxes of active plugins. Operations are serialized
//! per plugin id: two operations on the same id queue behind a keyed lock,
//! while operations on distinct ids run concurrently.
//!
//! Lifecycle per active instance:
//! INACTIVE --enable--> LOADING --ok--> ACTIVE, --fail--> ERROR;
//! ACTIVE --disable--> INACTIVE; ACTIVE --reinstall--> UPDATING --ok-->
//! ACTIVE, --fail--> ERROR; ERROR --enable--> LOADING.

use crate::error::{ManagerError, PluginResult, SandboxError};
use crate::manifest::{self, PluginMetadata};
use crate::permissions::PermissionManager;
use crate::resolver::DependencyResolver;
use crate::sandbox::capability::{CapabilityBroker, CapabilityTable, HostCapabilities, NullHost};
use crate::sandbox::{
    PluginExecutionContext, RuntimeFactory, Sandbox, SandboxBudget, WasmRuntimeFactory,
};
use crate::validator::PackageValidator;
use crate::{package, PluginError};
use async_trait::async_trait;
use folio_core::domain::plugin::{Plugin, PluginPermission, PluginRepository, PluginState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// External approval step deciding which requested permissions are granted
/// at install time. The decision itself (user prompt, org policy) is out of
/// scope; the manager only consumes its result.
#[async_trait]
pub trait PermissionApproval: Send + Sync {
    async fn approve(&self, metadata: &PluginMetadata) -> PluginResult<Vec<PluginPermission>>;
}

/// Default policy: grant exactly what the manifest requested
#[derive(Debug, Default)]
pub struct ApproveRequested;

#[async_trait]
impl PermissionApproval for ApproveRequested {
    async fn approve(&self, metadata: &PluginMetadata) -> PluginResult<Vec<PluginPermission>> {
        Ok(metadata.permissions.clone())
    }
}

struct ActiveEntry {
    state: PluginState,
    sandbox: Option<Arc<Sandbox>>,
}

/// Orchestrates plugin installation, lifecycle, and sandboxes
pub struct PluginManager {
    repository: PluginRepository,
    permissions: Arc<PermissionManager>,
    validator: Arc<PackageValidator>,
    resolver: DependencyResolver,
    approval: Arc<dyn PermissionApproval>,
    host: Arc<dyn HostCapabilities>,
    runtime_factory: Arc<dyn RuntimeFactory>,
    budget: SandboxBudget,
    install_dir: PathBuf,
    cache_dir: PathBuf,
    shutdown_grace: Duration,
    /// Single-flight locks keyed by plugin id
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Runtime state of known plugin instances
    active: RwLock<HashMap<String, ActiveEntry>>,
}

impl PluginManager {
    pub fn new(
        repository: PluginRepository,
        permissions: Arc<PermissionManager>,
        validator: PackageValidator,
        install_dir: PathBuf,
        cache_dir: PathBuf,
        budget: SandboxBudget,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            repository,
            permissions,
            validator: Arc::new(validator),
            resolver: DependencyResolver::new(),
            approval: Arc::new(ApproveRequested),
            host: Arc::new(NullHost),
            runtime_factory: Arc::new(WasmRuntimeFactory),
            budget,
            install_dir,
            cache_dir,
            shutdown_grace,
            locks: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Build a manager from the application configuration
    pub fn from_config(
        config: &folio_core::config::Config,
        repository: PluginRepository,
        permissions: Arc<PermissionManager>,
    ) -> anyhow::Result<Self> {
        let validator = PackageValidator::new(
            config.plugins.max_package_bytes,
            config.plugins.resolved_signer_key().as_deref(),
        )?;
        Ok(Self::new(
            repository,
            permissions,
            validator,
            config.plugins.resolved_install_dir()?,
            config.plugins.resolved_cache_dir()?,
            SandboxBudget::from_config(&config.sandbox),
            Duration::from_secs(config.sandbox.shutdown_grace_secs),
        ))
    }

    /// Replace the permission approval policy
    pub fn with_approval(mut self, approval: Arc<dyn PermissionApproval>) -> Self {
        self.approval = approval;
        self
    }

    /// Replace the host capability implementations
    pub fn with_host(mut self, host: Arc<dyn HostCapabilities>) -> Self {
        self.host = host;
        self
    }

    /// Replace the runtime factory (e.g. to register a script interpreter)
    pub fn with_runtime_factory(mut self, factory: Arc<dyn RuntimeFactory>) -> Self {
        self.runtime_factory = factory;
        self
    }

    pub fn repository(&self) -> &PluginRepository {
        &self.repository
    }

    pub fn permissions(&self) -> &Arc<PermissionManager> {
        &self.permissions
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Current lifecycle state of a plugin instance
    pub async fn state(&self, id: &str) -> PluginState {
        self.active
            .read()
            .await
            .get(id)
            .map(|entry| entry.state)
            .unwrap_or(PluginState::Inactive)
    }

    /// Number of live sandbox handles (one per ACTIVE plugin)
    pub async fn active_count(&self) -> usize {
        self.active
            .read()
            .await
            .values()
            .filter(|entry| entry.sandbox.is_some())
            .count()
    }

    async fn set_state(&self, id: &str, state: PluginState) {
        let mut active = self.active.write().await;
        let entry = active.entry(id.to_string()).or_insert(ActiveEntry {
            state,
            sandbox: None,
        });
        entry.state = state;
    }

    // ========== Install ==========

    /// Install a package: validate, extract metadata, resolve dependencies,
    /// obtain the permission grant decision, persist, unpack.
    ///
    /// Any failing step aborts the whole sequence; staged files are cleaned
    /// up and no repository row survives a failure. Installing over an
    /// already-active plugin re-activates it with the new version
    /// (UPDATING), otherwise the plugin lands installed-but-disabled.
    pub async fn install(&self, package_path: &Path) -> PluginResult<Plugin> {
        // Read-only stages run before taking the id lock (the id is not
        // known until the manifest is out).
        let validator = self.validator.clone();
        let path = package_path.to_path_buf();
        run_blocking(move || validator.validate_package(&path)).await?;

        let path = package_path.to_path_buf();
        let metadata = run_blocking(move || manifest::extract_metadata(&path)).await?;

        let lock = self.lock_for(&metadata.id).await;
        let _guard = lock.lock().await;

        let was_active = {
            let active = self.active.read().await;
            active
                .get(&metadata.id)
                .map(|e| e.sandbox.is_some())
                .unwrap_or(false)
        };
        if was_active {
            self.set_state(&metadata.id, PluginState::Updating).await;
            self.teardown_sandbox(&metadata.id).await;
        }

        match self.install_locked(package_path, &metadata).await {
            Ok(mut plugin) => {
                if was_active {
                    match self.activate(&mut plugin).await {
                        Ok(()) => {}
                        Err(e) => {
                            self.set_state(&plugin.id, PluginState::Error).await;
                            return Err(e);
                        }
                    }
                }
                info!(plugin_id = %plugin.id, version = %plugin.version, "plugin installed");
                Ok(plugin)
            }
            Err(e) => {
                if was_active {
                    self.set_state(&metadata.id, PluginState::Error).await;
                }
                Err(e)
            }
        }
    }

    async fn install_locked(
        &self,
        package_path: &Path,
        metadata: &PluginMetadata,
    ) -> PluginResult<Plugin> {
        // Dependencies against the installed-and-enabled set, plus cycle
        // detection over the candidate graph, before any mutation.
        let installed = self.repository.get_all().await?;
        self.resolver.check_dependencies(metadata, &installed)?;
        self.resolver.check_install_set(&[metadata], &installed)?;

        // External grant decision
        let granted = self.approval.approve(metadata).await?;

        // Stage the unpack next to the final location so the rename below
        // stays on one filesystem
        tokio::fs::create_dir_all(&self.install_dir).await?;
        let install_dir = self.install_dir.clone();
        let archive = package_path.to_path_buf();
        let staging = run_blocking(move || -> PluginResult<tempfile::TempDir> {
            let staging = tempfile::Builder::new()
                .prefix(".staging-")
                .tempdir_in(&install_dir)?;
            package::unpack(&archive, staging.path())?;
            Ok(staging)
        })
        .await?;

        let final_dir = self.install_dir.join(&metadata.id);
        let previous = self.repository.get(&metadata.id).await?;

        let mut plugin = metadata.clone().into_plugin(Some(final_dir.clone()));
        // Reinstall preserves the enabled flag; activation is the caller's
        // concern
        if let Some(previous) = &previous {
            plugin.is_enabled = previous.is_enabled;
            plugin.installed_at = previous.installed_at;
        }

        self.repository.upsert(&plugin).await?;

        if let Err(e) = self.permissions.grant_all(&plugin.id, &granted).await {
            // Roll the row back; nothing partial survives
            let _ = self.repository.delete(&plugin.id).await;
            return Err(e);
        }

        // Swap the staged tree into place
        let staged_path = staging.into_path();
        let swap = {
            let final_dir = final_dir.clone();
            let staged = staged_path.clone();
            run_blocking(move || -> PluginResult<()> {
                if final_dir.exists() {
                    std::fs::remove_dir_all(&final_dir)?;
                }
                std::fs::rename(&staged, &final_dir)?;
                Ok(())
            })
            .await
        };
        if let Err(e) = swap {
            let _ = std::fs::remove_dir_all(&staged_path);
            let _ = self.repository.delete(&plugin.id).await;
            self.permissions.forget(&plugin.id);
            return Err(e);
        }

        // Retain the archive for rollback; failure here only limits
        // rollback, it does not undo the install
        if let Err(e) = self.retain_archive(package_path, &plugin).await {
            warn!(
                plugin_id = %plugin.id,
                error = %e,
                "failed to retain package archive; rollback to this version will be unavailable"
            );
        }

        Ok(plugin)
    }

    async fn retain_archive(&self, package_path: &Path, plugin: &Plugin) -> PluginResult<()> {
        let versions_dir = self.cache_dir.join(&plugin.id);
        tokio::fs::create_dir_all(&versions_dir).await?;
        let retained = versions_dir.join(format!("{}.fpkg", plugin.version));
        tokio::fs::copy(package_path, &retained).await?;
        debug!(plugin_id = %plugin.id, retained = %retained.display(), "package archive retained");
        Ok(())
    }

    // ========== Uninstall ==========

    /// Remove a plugin: repository row, unpacked files, retained archives.
    ///
    /// Refused while another installed-and-enabled plugin depends on it,
    /// unless `force` is set.
    pub async fn uninstall(&self, id: &str, force: bool) -> PluginResult<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let plugin = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::NotInstalled(id.to_string()))?;

        let dependents: Vec<String> = self
            .repository
            .get_enabled()
            .await?
            .into_iter()
            .filter(|p| p.id != id && p.dependencies.iter().any(|d| d.plugin_id == id))
            .map(|p| p.id)
            .collect();

        if !dependents.is_empty() && !force {
            return Err(ManagerError::DependentPluginsExist {
                id: id.to_string(),
                dependents,
            }
            .into());
        }

        self.teardown_sandbox(id).await;
        self.active.write().await.remove(id);

        self.repository.delete(id).await?;
        self.permissions.forget(id);

        // Cascading file deletion: unpacked tree and retained archives
        if let Some(package_dir) = &plugin.package_path {
            if package_dir.exists() {
                tokio::fs::remove_dir_all(package_dir).await?;
            }
        }
        let versions_dir = self.cache_dir.join(id);
        if versions_dir.exists() {
            tokio::fs::remove_dir_all(&versions_dir).await?;
        }

        info!(plugin_id = %id, forced = force, "plugin uninstalled");
        Ok(())
    }

    // ========== Enable / disable ==========

    /// Enable a plugin: INACTIVE/ERROR → LOADING → ACTIVE, or → ERROR when
    /// the sandbox fails to come up.
    pub async fn enable(&self, id: &str) -> PluginResult<Plugin> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut plugin = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::NotInstalled(id.to_string()))?;

        if self.state(id).await == PluginState::Active {
            return Ok(plugin);
        }

        match self.activate(&mut plugin).await {
            Ok(()) => Ok(plugin),
            Err(e) => {
                self.set_state(id, PluginState::Error).await;
                Err(e)
            }
        }
    }

    /// Start the sandbox for a plugin and persist the enabled flag.
    /// Caller must hold the plugin's id lock.
    async fn activate(&self, plugin: &mut Plugin) -> PluginResult<()> {
        self.set_state(&plugin.id, PluginState::Loading).await;

        let granted = self.permissions.granted(&plugin.id);
        let context = PluginExecutionContext {
            plugin_id: plugin.id.clone(),
            granted: granted.clone(),
            config: plugin.metadata.clone(),
        };
        let broker = CapabilityBroker::new(
            plugin.id.clone(),
            CapabilityTable::for_grants(&granted),
            self.permissions.clone(),
            self.host.clone(),
        );
        let install_dir = plugin
            .package_path
            .clone()
            .unwrap_or_else(|| self.install_dir.join(&plugin.id));

        let sandbox = Sandbox::start(
            context,
            plugin.kind,
            install_dir,
            self.runtime_factory.clone(),
            broker,
            self.budget.clone(),
        )
        .await
        .map_err(PluginError::Sandbox)?;

        plugin.enable().map_err(PluginError::Persistence)?;
        if let Err(e) = self.repository.upsert(plugin).await {
            let _ = sandbox.shutdown(self.shutdown_grace).await;
            return Err(e.into());
        }

        let mut active = self.active.write().await;
        active.insert(
            plugin.id.clone(),
            ActiveEntry {
                state: PluginState::Active,
                sandbox: Some(Arc::new(sandbox)),
            },
        );

        info!(plugin_id = %plugin.id, "plugin enabled");
        Ok(())
    }

    /// Disable a plugin: tear down its sandbox (cancelling in-flight work
    /// within the grace period) and persist the disabled flag.
    pub async fn disable(&self, id: &str) -> PluginResult<Plugin> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut plugin = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::NotInstalled(id.to_string()))?;

        self.teardown_sandbox(id).await;
        self.active.write().await.remove(id);

        if plugin.is_enabled {
            plugin.disable();
            self.repository.upsert(&plugin).await?;
        }

        info!(plugin_id = %id, "plugin disabled");
        Ok(plugin)
    }

    /// Stop and drop a plugin's sandbox, if one is live. A worker that
    /// fails to stop within the grace period is logged by the sandbox as a
    /// fatal resource leak; the handle is dropped either way.
    async fn teardown_sandbox(&self, id: &str) {
        let sandbox = {
            let mut active = self.active.write().await;
            active.get_mut(id).and_then(|entry| entry.sandbox.take())
        };
        if let Some(sandbox) = sandbox {
            if let Err(e) = sandbox.shutdown(self.shutdown_grace).await {
                warn!(plugin_id = %id, error = %e, "sandbox teardown reported a leak");
            }
        }
    }

    // ========== Rollback ==========

    /// Reinstall a previously retained package version
    pub async fn rollback(&self, id: &str, version: &str) -> PluginResult<Plugin> {
        let retained = self.cache_dir.join(id).join(format!("{version}.fpkg"));
        if !retained.is_file() {
            return Err(ManagerError::VersionNotAvailable {
                id: id.to_string(),
                version: version.to_string(),
            }
            .into());
        }

        info!(plugin_id = %id, version = %version, "rolling back");
        let plugin = self.install(&retained).await?;
        if plugin.id != id {
            // A retained archive that names a different plugin is a cache
            // corruption; refuse it
            return Err(ManagerError::InvalidState(format!(
                "retained archive for '{id}' contains plugin '{}'",
                plugin.id
            ))
            .into());
        }
        Ok(plugin)
    }

    // ========== Runtime calls ==========

    /// Invoke an entry point on an active plugin's sandbox
    pub async fn invoke(&self, id: &str, entry: &str, payload: serde_json::Value) -> PluginResult<serde_json::Value> {
        let sandbox = {
            let active = self.active.read().await;
            active
                .get(id)
                .and_then(|e| e.sandbox.clone())
                .ok_or_else(|| {
                    PluginError::Sandbox(SandboxError::RuntimeFault(format!(
                        "plugin '{id}' is not active"
                    )))
                })?
        };
        sandbox.invoke(entry, payload).await
    }

    /// Tear down every active sandbox (host shutdown path)
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        for id in ids {
            self.teardown_sandbox(&id).await;
        }
        self.active.write().await.clear();
    }
}

async fn run_blocking<T, F>(f: F) -> PluginResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> PluginResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PluginError::Io(std::io::Error::other(e)))?
}
