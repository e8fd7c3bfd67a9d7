//! Capability table and host-call mediation
//!
//! Plugin-to-host calls arrive as named [`CapabilityCall`] messages. The
//! broker resolves the name against an enumerable table built from the
//! plugin's *granted* permission set: operations whose guarding permission
//! was never granted are simply absent, so a probe cannot distinguish a
//! withheld capability from one the host does not have.

use crate::error::{PermissionError, PluginResult, SandboxError};
use crate::permissions::PermissionManager;
use folio_core::domain::plugin::PluginPermission;
use serde_json::Value;
use std::collections::{HashSet, HashMap};
use std::sync::Arc;
use tracing::trace;

/// Host operations a sandboxed plugin may invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ReadFile,
    WriteFile,
    HttpFetch,
    CaptureImage,
    StorageGet,
    StoragePut,
    ApplySetting,
    ReaderCommand,
    UiHook,
}

impl Capability {
    pub const ALL: &'static [Capability] = &[
        Capability::ReadFile,
        Capability::WriteFile,
        Capability::HttpFetch,
        Capability::CaptureImage,
        Capability::StorageGet,
        Capability::StoragePut,
        Capability::ApplySetting,
        Capability::ReaderCommand,
        Capability::UiHook,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadFile => "fs.read",
            Self::WriteFile => "fs.write",
            Self::HttpFetch => "net.fetch",
            Self::CaptureImage => "camera.capture",
            Self::StorageGet => "storage.get",
            Self::StoragePut => "storage.put",
            Self::ApplySetting => "settings.apply",
            Self::ReaderCommand => "reader.command",
            Self::UiHook => "ui.hook",
        }
    }

    /// The permission gating this operation
    pub fn required_permission(&self) -> PluginPermission {
        match self {
            Self::ReadFile => PluginPermission::ReadFiles,
            Self::WriteFile => PluginPermission::WriteFiles,
            Self::HttpFetch => PluginPermission::NetworkAccess,
            Self::CaptureImage => PluginPermission::CameraAccess,
            Self::StorageGet | Self::StoragePut => PluginPermission::StorageAccess,
            Self::ApplySetting => PluginPermission::SystemSettings,
            Self::ReaderCommand => PluginPermission::ReaderControl,
            Self::UiHook => PluginPermission::UiModification,
        }
    }
}

/// An inbound call from plugin code
#[derive(Debug, Clone)]
pub struct CapabilityCall {
    pub capability: String,
    pub args: Value,
}

/// The set of operations exposed to one sandbox
///
/// Built once per activation from the granted permission set; ungated
/// operations are not listed at all.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    entries: HashMap<&'static str, Capability>,
}

impl CapabilityTable {
    pub fn for_grants(granted: &HashSet<PluginPermission>) -> Self {
        let entries = Capability::ALL
            .iter()
            .filter(|cap| granted.contains(&cap.required_permission()))
            .map(|cap| (cap.name(), *cap))
            .collect();
        Self { entries }
    }

    /// Resolve a call name. Returns `None` for ungranted and unknown names
    /// alike.
    pub fn lookup(&self, name: &str) -> Option<Capability> {
        self.entries.get(name).copied()
    }

    /// Enumerate the exposed operation names
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Host-side implementations of the mediated operations
pub trait HostCapabilities: Send + Sync {
    fn invoke(&self, capability: Capability, args: &Value) -> PluginResult<Value>;
}

/// Host that implements nothing; every call is a fault. Useful as a default
/// and in tests.
#[derive(Debug, Default)]
pub struct NullHost;

impl HostCapabilities for NullHost {
    fn invoke(&self, capability: Capability, _args: &Value) -> PluginResult<Value> {
        Err(SandboxError::RuntimeFault(format!(
            "capability '{}' is not implemented by this host",
            capability.name()
        ))
        .into())
    }
}

/// Mediates one sandbox's calls into the host
#[derive(Clone)]
pub struct CapabilityBroker {
    plugin_id: String,
    table: CapabilityTable,
    permissions: Arc<PermissionManager>,
    host: Arc<dyn HostCapabilities>,
}

impl CapabilityBroker {
    pub fn new(
        plugin_id: impl Into<String>,
        table: CapabilityTable,
        permissions: Arc<PermissionManager>,
        host: Arc<dyn HostCapabilities>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            table,
            permissions,
            host,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Names of the operations this sandbox can see
    pub fn exposed(&self) -> Vec<&'static str> {
        self.table.names()
    }

    /// Dispatch a call: table lookup, synchronous permission re-check, host
    /// invocation. The permission is re-checked on every call so a
    /// revocation applies from the next call onward.
    pub fn call(&self, call: &CapabilityCall) -> PluginResult<Value> {
        let capability = self.table.lookup(&call.capability).ok_or_else(|| {
            SandboxError::RuntimeFault(format!("unknown capability: {}", call.capability))
        })?;

        let permission = capability.required_permission();
        if !self.permissions.check_permission(&self.plugin_id, permission) {
            return Err(PermissionError::Denied {
                plugin_id: self.plugin_id.clone(),
                permission: permission.as_str().to_string(),
            }
            .into());
        }

        trace!(
            plugin_id = %self.plugin_id,
            capability = capability.name(),
            "capability dispatch"
        );
        self.host.invoke(capability, &call.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use folio_core::domain::plugin::PluginRepository;
    use folio_core::storage::Database;
    use serde_json::json;

    struct EchoHost;

    impl HostCapabilities for EchoHost {
        fn invoke(&self, capability: Capability, args: &Value) -> PluginResult<Value> {
            Ok(json!({ "capability": capability.name(), "args": args }))
        }
    }

    #[test]
    fn table_contains_only_granted_operations() {
        let granted = [PluginPermission::ReadFiles, PluginPermission::StorageAccess]
            .into_iter()
            .collect();
        let table = CapabilityTable::for_grants(&granted);

        assert_eq!(table.names(), vec!["fs.read", "storage.get", "storage.put"]);
        assert!(table.lookup("fs.read").is_some());
        // Ungranted and nonexistent look identical
        assert!(table.lookup("net.fetch").is_none());
        assert!(table.lookup("host.secret_op").is_none());
    }

    #[test]
    fn empty_grants_empty_table() {
        let table = CapabilityTable::for_grants(&HashSet::new());
        assert!(table.is_empty());
        assert!(table.names().is_empty());
    }

    #[test]
    fn every_capability_is_gated() {
        // The table over all permissions must expose every operation
        let all: HashSet<_> = [
            PluginPermission::ReadFiles,
            PluginPermission::WriteFiles,
            PluginPermission::NetworkAccess,
            PluginPermission::CameraAccess,
            PluginPermission::StorageAccess,
            PluginPermission::SystemSettings,
            PluginPermission::ReaderControl,
            PluginPermission::UiModification,
        ]
        .into_iter()
        .collect();
        let table = CapabilityTable::for_grants(&all);
        assert_eq!(table.names().len(), Capability::ALL.len());
    }

    async fn broker_with_grants(
        granted: &[PluginPermission],
        requested: &[PluginPermission],
    ) -> (CapabilityBroker, Arc<PermissionManager>) {
        use chrono::Utc;
        use folio_core::domain::plugin::{Plugin, PluginCategory, PluginKind, Version};

        let db = Database::in_memory().await.unwrap();
        let repo = PluginRepository::new(db.pool().clone());
        repo.upsert(&Plugin {
            id: "t1".to_string(),
            name: "t1".to_string(),
            version: Version::new(1, 0, 0),
            author: String::new(),
            description: String::new(),
            category: PluginCategory::Utility,
            kind: PluginKind::Script,
            permissions: requested.to_vec(),
            dependencies: vec![],
            is_enabled: true,
            is_installed: true,
            configurable: false,
            icon_url: None,
            source_url: None,
            package_path: None,
            metadata: Default::default(),
            installed_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

        let permissions = Arc::new(PermissionManager::new(repo));
        for p in granted {
            permissions.grant("t1", *p).await.unwrap();
        }

        let table = CapabilityTable::for_grants(&permissions.granted("t1"));
        let broker =
            CapabilityBroker::new("t1", table, permissions.clone(), Arc::new(EchoHost));
        (broker, permissions)
    }

    #[tokio::test]
    async fn granted_call_reaches_host() {
        let (broker, _permissions) = broker_with_grants(
            &[PluginPermission::ReaderControl],
            &[PluginPermission::ReaderControl],
        )
        .await;

        let result = broker
            .call(&CapabilityCall {
                capability: "reader.command".to_string(),
                args: json!({"page": 12}),
            })
            .unwrap();
        assert_eq!(result["capability"], "reader.command");
    }

    #[tokio::test]
    async fn ungranted_call_is_unknown() {
        let (broker, _permissions) =
            broker_with_grants(&[], &[PluginPermission::NetworkAccess]).await;

        let err = broker
            .call(&CapabilityCall {
                capability: "net.fetch".to_string(),
                args: Value::Null,
            })
            .unwrap_err();
        // Absent from the table, not a permission denial
        assert!(matches!(
            err,
            PluginError::Sandbox(SandboxError::RuntimeFault(_))
        ));
    }

    #[tokio::test]
    async fn revocation_applies_to_next_call() {
        let (broker, permissions) = broker_with_grants(
            &[PluginPermission::ReaderControl],
            &[PluginPermission::ReaderControl],
        )
        .await;
        let call = CapabilityCall {
            capability: "reader.command".to_string(),
            args: Value::Null,
        };
        broker.call(&call).unwrap();

        // Table still lists the operation, but the live permission check
        // now fails
        permissions
            .revoke("t1", PluginPermission::ReaderControl)
            .await
            .unwrap();
        let err = broker.call(&call).unwrap_err();
        assert!(matches!(
            err,
            PluginError::Permission(PermissionError::Denied { .. })
        ));
    }
}
