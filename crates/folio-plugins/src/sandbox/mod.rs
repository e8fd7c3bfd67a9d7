//! Sandboxed plugin execution
//!
//! One sandbox exists per ACTIVE plugin. Each owns a dedicated worker thread
//! holding the plugin's runtime; the host talks to it exclusively over a
//! message channel, so calls into the sandbox never block the caller. Host
//! operations flow back out through the [`capability::CapabilityBroker`],
//! which consults the permission manager on every call. No state is shared
//! between the sandboxes of different plugins.

pub mod capability;
pub mod wasm;

use crate::error::{PluginResult, SandboxError};
use capability::CapabilityBroker;
use folio_core::config::SandboxConfig;
use folio_core::domain::plugin::{PluginKind, PluginPermission};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Resource budget applied to a sandbox
#[derive(Debug, Clone)]
pub struct SandboxBudget {
    pub fuel_limit: u64,
    pub memory_limit_bytes: usize,
    pub table_elements_limit: usize,
    pub instance_limit: usize,
    pub call_timeout: Duration,
}

impl Default for SandboxBudget {
    fn default() -> Self {
        Self {
            fuel_limit: 10_000_000,
            memory_limit_bytes: 16 * 1024 * 1024,
            table_elements_limit: 1_024,
            instance_limit: 16,
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl SandboxBudget {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            fuel_limit: config.fuel_limit,
            memory_limit_bytes: config.memory_limit_bytes,
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            ..Default::default()
        }
    }
}

/// Per-activation execution context: the plugin's identity, the permissions
/// actually granted at activation time, and its configuration map. Built
/// fresh for every sandbox start, never persisted.
#[derive(Debug, Clone)]
pub struct PluginExecutionContext {
    pub plugin_id: String,
    pub granted: HashSet<PluginPermission>,
    pub config: HashMap<String, String>,
}

/// A loaded plugin runtime living on the sandbox worker
pub trait SandboxRuntime: Send {
    /// Invoke a plugin entry point with a JSON payload
    fn invoke(&mut self, entry: &str, payload: &Value) -> Result<Value, SandboxError>;
}

/// Creates runtimes for plugin kinds. The wasm factory ships with the host;
/// script interpreters are embedded by the application and registered
/// through their own factory.
pub trait RuntimeFactory: Send + Sync {
    fn create(
        &self,
        context: &PluginExecutionContext,
        kind: PluginKind,
        install_dir: &Path,
        broker: CapabilityBroker,
        budget: &SandboxBudget,
    ) -> Result<Box<dyn SandboxRuntime>, SandboxError>;
}

/// Default factory: wasm modules for native/hybrid plugins
#[derive(Debug, Default)]
pub struct WasmRuntimeFactory;

/// Module file expected inside an installed native/hybrid plugin
pub const WASM_MODULE_FILE: &str = "plugin.wasm";

struct WasmSandboxRuntime {
    inner: wasm::WasmRuntime,
}

impl SandboxRuntime for WasmSandboxRuntime {
    fn invoke(&mut self, entry: &str, _payload: &Value) -> Result<Value, SandboxError> {
        // Wasm entry points are nullary status-code exports; payload-carrying
        // calls are a script-runtime concern.
        self.inner.invoke(entry)
    }
}

impl RuntimeFactory for WasmRuntimeFactory {
    fn create(
        &self,
        _context: &PluginExecutionContext,
        kind: PluginKind,
        install_dir: &Path,
        _broker: CapabilityBroker,
        budget: &SandboxBudget,
    ) -> Result<Box<dyn SandboxRuntime>, SandboxError> {
        match kind {
            PluginKind::Script => Err(SandboxError::InitFailed(
                "no script runtime is registered with this host".to_string(),
            )),
            PluginKind::Native | PluginKind::Hybrid => {
                let module_path = install_dir.join(WASM_MODULE_FILE);
                let bytes = std::fs::read(&module_path).map_err(|e| {
                    SandboxError::InitFailed(format!(
                        "cannot read {}: {e}",
                        module_path.display()
                    ))
                })?;
                Ok(Box::new(WasmSandboxRuntime {
                    inner: wasm::WasmRuntime::load(&bytes, budget)?,
                }))
            }
        }
    }
}

enum WorkerMessage {
    Invoke {
        entry: String,
        payload: Value,
        reply: oneshot::Sender<Result<Value, SandboxError>>,
    },
}

/// Handle to one plugin's isolated execution context
///
/// The sender and join handle live behind mutexes so a shared handle can be
/// shut down while calls are still in flight: closing the channel cancels
/// queued work, and the in-flight call is bounded by its own timeout.
#[derive(Debug)]
pub struct Sandbox {
    plugin_id: String,
    tx: StdMutex<Option<mpsc::Sender<WorkerMessage>>>,
    worker: StdMutex<Option<thread::JoinHandle<()>>>,
    call_timeout: Duration,
}

impl Sandbox {
    /// Spawn the worker and initialize the plugin runtime on it.
    ///
    /// Returns only after initialization finished; a runtime that fails to
    /// come up surfaces as [`SandboxError::InitFailed`] and leaves nothing
    /// behind.
    pub async fn start(
        context: PluginExecutionContext,
        kind: PluginKind,
        install_dir: PathBuf,
        factory: Arc<dyn RuntimeFactory>,
        broker: CapabilityBroker,
        budget: SandboxBudget,
    ) -> Result<Self, SandboxError> {
        let (tx, mut rx) = mpsc::channel::<WorkerMessage>(16);
        let (init_tx, init_rx) = oneshot::channel();

        let plugin_id = context.plugin_id.clone();
        let call_timeout = budget.call_timeout;
        let worker_id = plugin_id.clone();

        let worker = thread::Builder::new()
            .name(format!("sandbox-{plugin_id}"))
            .spawn(move || {
                let mut runtime =
                    match factory.create(&context, kind, &install_dir, broker, &budget) {
                        Ok(runtime) => {
                            let _ = init_tx.send(Ok(()));
                            runtime
                        }
                        Err(e) => {
                            let _ = init_tx.send(Err(e));
                            return;
                        }
                    };

                while let Some(message) = rx.blocking_recv() {
                    match message {
                        WorkerMessage::Invoke {
                            entry,
                            payload,
                            reply,
                        } => {
                            let result = runtime.invoke(&entry, &payload);
                            // The caller may have timed out and gone away
                            let _ = reply.send(result);
                        }
                    }
                }

                debug!(plugin_id = %worker_id, "sandbox worker stopped");
            })
            .map_err(|e| SandboxError::InitFailed(format!("failed to spawn worker: {e}")))?;

        match init_rx.await {
            Ok(Ok(())) => {
                debug!(plugin_id = %plugin_id, "sandbox started");
                Ok(Self {
                    plugin_id,
                    tx: StdMutex::new(Some(tx)),
                    worker: StdMutex::new(Some(worker)),
                    call_timeout,
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(SandboxError::InitFailed(
                    "sandbox worker died during initialization".to_string(),
                ))
            }
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Invoke a plugin entry point.
    ///
    /// Asynchronous with respect to the caller; a call that overruns the
    /// budget returns [`SandboxError::Timeout`] while the worker's own
    /// watchdog interrupts the runtime, so the sandbox stays usable for the
    /// next call.
    pub async fn invoke(&self, entry: &str, payload: Value) -> PluginResult<Value> {
        let tx = self
            .tx
            .lock()
            .expect("sandbox tx lock poisoned")
            .clone()
            .ok_or_else(|| {
                SandboxError::RuntimeFault("sandbox worker is not running".to_string())
            })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(WorkerMessage::Invoke {
            entry: entry.to_string(),
            payload,
            reply: reply_tx,
        })
        .await
        .map_err(|_| SandboxError::RuntimeFault("sandbox worker is not running".to_string()))?;

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Err(_) => Err(SandboxError::Timeout(self.call_timeout.as_millis() as u64).into()),
            Ok(Err(_)) => Err(SandboxError::RuntimeFault(
                "sandbox worker dropped the call".to_string(),
            )
            .into()),
            Ok(Ok(result)) => Ok(result?),
        }
    }

    /// Tear the sandbox down, waiting up to `grace` for the worker to stop.
    ///
    /// A worker that does not stop within the grace period is a resource
    /// leak; it is logged at error level and reported to the caller.
    pub async fn shutdown(&self, grace: Duration) -> PluginResult<()> {
        // Closing the channel makes the worker loop exit after the call it
        // is currently executing, if any. Queued calls are dropped and their
        // callers see a cancelled reply.
        let tx = self.tx.lock().expect("sandbox tx lock poisoned").take();
        drop(tx);

        let worker = self
            .worker
            .lock()
            .expect("sandbox worker lock poisoned")
            .take();
        let Some(handle) = worker else {
            return Ok(());
        };

        let plugin_id = self.plugin_id.clone();
        let join = tokio::task::spawn_blocking(move || {
            let _ = handle.join();
        });

        match tokio::time::timeout(grace, join).await {
            Ok(_) => {
                debug!(plugin_id = %plugin_id, "sandbox released");
                Ok(())
            }
            Err(_) => {
                error!(
                    plugin_id = %plugin_id,
                    grace_ms = grace.as_millis() as u64,
                    "fatal resource leak: sandbox worker did not stop within the grace period"
                );
                Err(SandboxError::RuntimeFault(format!(
                    "sandbox worker for '{plugin_id}' leaked"
                ))
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::capability::{CapabilityCall, CapabilityTable, NullHost};
    use super::*;
    use crate::error::PluginError;
    use crate::permissions::PermissionManager;
    use folio_core::domain::plugin::PluginRepository;
    use folio_core::storage::Database;
    use serde_json::json;

    /// Scripted runtime: "echo" returns the payload, "slow" sleeps, "fault"
    /// errors, "call_host" round-trips through the broker.
    struct FakeRuntime {
        broker: CapabilityBroker,
        slow_for: Duration,
    }

    impl SandboxRuntime for FakeRuntime {
        fn invoke(&mut self, entry: &str, payload: &Value) -> Result<Value, SandboxError> {
            match entry {
                "echo" => Ok(payload.clone()),
                "slow" => {
                    thread::sleep(self.slow_for);
                    Ok(json!("late"))
                }
                "fault" => Err(SandboxError::RuntimeFault("scripted fault".to_string())),
                "call_host" => self
                    .broker
                    .call(&CapabilityCall {
                        capability: payload["capability"].as_str().unwrap_or("").to_string(),
                        args: payload["args"].clone(),
                    })
                    .map_err(|e| SandboxError::RuntimeFault(e.to_string())),
                other => Err(SandboxError::RuntimeFault(format!("no entry '{other}'"))),
            }
        }
    }

    struct FakeFactory {
        slow_for: Duration,
        fail_init: bool,
    }

    impl RuntimeFactory for FakeFactory {
        fn create(
            &self,
            _context: &PluginExecutionContext,
            _kind: PluginKind,
            _install_dir: &Path,
            broker: CapabilityBroker,
            _budget: &SandboxBudget,
        ) -> Result<Box<dyn SandboxRuntime>, SandboxError> {
            if self.fail_init {
                return Err(SandboxError::InitFailed("scripted init failure".to_string()));
            }
            Ok(Box::new(FakeRuntime {
                broker,
                slow_for: self.slow_for,
            }))
        }
    }

    fn context(id: &str) -> PluginExecutionContext {
        PluginExecutionContext {
            plugin_id: id.to_string(),
            granted: HashSet::new(),
            config: HashMap::new(),
        }
    }

    async fn null_broker(id: &str) -> CapabilityBroker {
        // Broker over an empty table; only the "call_host" entry dispatches
        let db = Database::in_memory().await.expect("in-memory database");
        CapabilityBroker::new(
            id,
            CapabilityTable::for_grants(&HashSet::new()),
            Arc::new(PermissionManager::new(PluginRepository::new(
                db.pool().clone(),
            ))),
            Arc::new(NullHost),
        )
    }

    async fn start_sandbox(id: &str, factory: FakeFactory, timeout: Duration) -> Result<Sandbox, SandboxError> {
        let budget = SandboxBudget {
            call_timeout: timeout,
            ..Default::default()
        };
        Sandbox::start(
            context(id),
            PluginKind::Script,
            PathBuf::from("/nonexistent"),
            Arc::new(factory),
            null_broker(id).await,
            budget,
        )
        .await
    }

    #[tokio::test]
    async fn invoke_round_trips_payload() {
        let sandbox = start_sandbox(
            "t1",
            FakeFactory {
                slow_for: Duration::ZERO,
                fail_init: false,
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let result = sandbox.invoke("echo", json!({"page": 3})).await.unwrap();
        assert_eq!(result, json!({"page": 3}));

        sandbox.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn init_failure_surfaces_and_leaves_no_worker() {
        let err = start_sandbox(
            "t1",
            FakeFactory {
                slow_for: Duration::ZERO,
                fail_init: true,
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SandboxError::InitFailed(_)));
    }

    #[tokio::test]
    async fn runtime_fault_is_contained() {
        let sandbox = start_sandbox(
            "t1",
            FakeFactory {
                slow_for: Duration::ZERO,
                fail_init: false,
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let err = sandbox.invoke("fault", Value::Null).await.unwrap_err();
        assert!(matches!(
            err,
            PluginError::Sandbox(SandboxError::RuntimeFault(_))
        ));

        // The fault did not poison the sandbox
        let ok = sandbox.invoke("echo", json!(1)).await.unwrap();
        assert_eq!(ok, json!(1));

        sandbox.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn timeout_then_subsequent_call_succeeds() {
        let sandbox = start_sandbox(
            "t1",
            FakeFactory {
                slow_for: Duration::from_millis(150),
                fail_init: false,
            },
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        let err = sandbox.invoke("slow", Value::Null).await.unwrap_err();
        assert!(matches!(err, PluginError::Sandbox(SandboxError::Timeout(_))));

        // Let the worker finish the abandoned call, then reuse the sandbox
        tokio::time::sleep(Duration::from_millis(300)).await;
        let ok = sandbox.invoke("echo", json!("after")).await.unwrap();
        assert_eq!(ok, json!("after"));

        sandbox.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_reports_leak_when_worker_hangs() {
        let sandbox = start_sandbox(
            "t1",
            FakeFactory {
                slow_for: Duration::from_millis(500),
                fail_init: false,
            },
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        // Park the worker in a long call, then tear down with a tiny grace
        let _ = sandbox.invoke("slow", Value::Null).await;
        let err = sandbox.shutdown(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(
            err,
            PluginError::Sandbox(SandboxError::RuntimeFault(_))
        ));
    }

    #[tokio::test]
    async fn sandboxes_are_isolated_per_plugin() {
        let a = start_sandbox(
            "a",
            FakeFactory {
                slow_for: Duration::from_millis(200),
                fail_init: false,
            },
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        let b = start_sandbox(
            "b",
            FakeFactory {
                slow_for: Duration::ZERO,
                fail_init: false,
            },
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        // Plugin a is stuck in a slow call; plugin b is unaffected
        let slow = a.invoke("slow", Value::Null);
        let fast = b.invoke("echo", json!("b"));
        let (slow_result, fast_result) = tokio::join!(slow, fast);
        assert!(slow_result.is_err());
        assert_eq!(fast_result.unwrap(), json!("b"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        a.shutdown(Duration::from_secs(1)).await.unwrap();
        b.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
