//! Wasm execution via wasmtime
//!
//! Runs a plugin's wasm module inside a constrained store: fuel metering,
//! memory/table/instance limits, epoch-based wall-clock interruption, and no
//! imports — host operations are only reachable through the capability
//! broker, never through linked functions.

use crate::error::SandboxError;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use wasmtime::{
    Config, Engine, Instance, Module, Store, StoreLimits, StoreLimitsBuilder, WasmBacktraceDetails,
};

use super::SandboxBudget;

struct StoreState {
    limits: StoreLimits,
}

/// A loaded wasm module ready for repeated entry-point invocation
pub struct WasmRuntime {
    engine: Engine,
    store: Store<StoreState>,
    instance: Instance,
    fuel_limit: u64,
    call_timeout: Duration,
}

impl std::fmt::Debug for WasmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmRuntime")
            .field("fuel_limit", &self.fuel_limit)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl WasmRuntime {
    /// Compile, validate, and instantiate a module under the given budget
    pub fn load(wasm: &[u8], budget: &SandboxBudget) -> Result<Self, SandboxError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.wasm_threads(false);
        config.wasm_simd(false);
        config.wasm_reference_types(false);
        config.async_support(false);
        config.epoch_interruption(true);
        config.wasm_backtrace_details(WasmBacktraceDetails::Disable);

        let engine = Engine::new(&config)
            .map_err(|e| SandboxError::InitFailed(format!("wasmtime engine: {e}")))?;

        Module::validate(&engine, wasm)
            .map_err(|e| SandboxError::InitFailed(format!("module validation failed: {e}")))?;

        let module = Module::new(&engine, wasm)
            .map_err(|e| SandboxError::InitFailed(format!("invalid module: {e}")))?;

        if module.imports().next().is_some() {
            return Err(SandboxError::InitFailed(
                "module imports are not allowed; host access goes through the capability table"
                    .to_string(),
            ));
        }

        let mut store = Store::new(
            &engine,
            StoreState {
                limits: StoreLimitsBuilder::new()
                    .memory_size(budget.memory_limit_bytes)
                    .table_elements(budget.table_elements_limit)
                    .instances(budget.instance_limit)
                    .trap_on_grow_failure(true)
                    .build(),
            },
        );
        store.limiter(|state| &mut state.limits);

        store
            .set_fuel(budget.fuel_limit)
            .map_err(|e| SandboxError::InitFailed(format!("failed to add fuel: {e}")))?;
        store.set_epoch_deadline(1);

        let instance = Self::with_watchdog(&engine, budget.call_timeout, || {
            Instance::new(&mut store, &module, &[])
                .map_err(|e| SandboxError::InitFailed(format!("instantiation failed: {e}")))
        })?;

        Ok(Self {
            engine,
            store,
            instance,
            fuel_limit: budget.fuel_limit,
            call_timeout: budget.call_timeout,
        })
    }

    /// Invoke a nullary exported entry point, returning its status code.
    ///
    /// Fuel and the epoch deadline are reset per call, so a call that traps
    /// or runs out of budget does not poison the next one.
    pub fn invoke(&mut self, entry: &str) -> Result<Value, SandboxError> {
        self.store
            .set_fuel(self.fuel_limit)
            .map_err(|e| SandboxError::RuntimeFault(format!("failed to refuel: {e}")))?;
        self.store.set_epoch_deadline(1);

        let func = self
            .instance
            .get_typed_func::<(), i32>(&mut self.store, entry)
            .map_err(|e| SandboxError::RuntimeFault(format!("entry '{entry}': {e}")))?;

        let engine = self.engine.clone();
        let timeout = self.call_timeout;
        let store = &mut self.store;
        let code = Self::with_watchdog(&engine, timeout, || {
            func.call(store, ())
                .map_err(|e| SandboxError::RuntimeFault(format!("entry '{entry}' trapped: {e}")))
        })?;

        Ok(Value::from(code))
    }

    /// Run `body` with a wall-clock watchdog that interrupts execution via
    /// the engine epoch if it overruns.
    fn with_watchdog<T>(
        engine: &Engine,
        timeout: Duration,
        body: impl FnOnce() -> Result<T, SandboxError>,
    ) -> Result<T, SandboxError> {
        let finished = Arc::new(AtomicBool::new(false));
        let finished_flag = finished.clone();
        let engine = engine.clone();

        let watchdog = thread::spawn(move || {
            thread::sleep(timeout);
            if !finished_flag.load(Ordering::Relaxed) {
                engine.increment_epoch();
            }
        });

        let result = body();

        finished.store(true, Ordering::Relaxed);
        let _ = watchdog.join();

        result
    }
}
