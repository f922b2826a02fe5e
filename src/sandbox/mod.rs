//! Transform Sandbox
//!
//! Runs binding transform scripts as WebAssembly modules inside wasmtime.
//! A script sees nothing of the host except three capabilities:
//!
//! - its own linear memory (the byte buffer the host writes topic and
//!   payload into, via the script's exported `alloc`)
//! - `relay.log(level, ptr, len)`, a logging sink
//! - `relay.publish(topic_ptr, topic_len, payload_ptr, payload_len)`, which
//!   appends to the context's outbound queue
//!
//! There is no WASI, so no file system, network, clock or process access.
//! Execution time is bounded by epoch interruption and memory by store
//! limits.
//!
//! # Script contract
//!
//! ```wat
//! (module
//!   (import "relay" "publish" (func $publish (param i32 i32 i32 i32) (result i32)))
//!   (memory (export "memory") 1)
//!   (func (export "alloc") (param i32) (result i32) ...)
//!   (func (export "init") ...)                            ;; optional, runs once at load
//!   (func (export "handler") (param i32 i32 i32 i32) (result i32) ...))
//! ```
//!
//! A module without `handler` fails to load. A negative `handler` result
//! is treated as an abnormal return.

mod context;
mod error;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context as _;
use tracing::debug;
use wasmtime::{Config, Engine, Linker, Module};

pub use context::SandboxContext;
pub use error::{ScriptLoadError, ScriptRuntimeError};

use crate::binding::ScriptSource;
use crate::config::SandboxConfig;
use crate::message::{InboundMessage, OutboundMessage};
use context::HostState;

/// Epoch tick period; timeouts are rounded up to whole ticks
pub const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Number of epoch ticks covering `timeout`, plus one for the partial
/// tick already in progress when the deadline is set.
pub(crate) fn deadline_ticks(timeout: Duration) -> u64 {
    let tick_ms = EPOCH_TICK.as_millis() as u64;
    (timeout.as_millis() as u64).div_ceil(tick_ms).max(1) + 1
}

/// A binding's transform: the identity, or a loaded script
pub enum Transform {
    /// Forward the inbound message unchanged
    Identity,
    /// Run the message through a sandboxed script
    Script(Box<SandboxContext>),
}

impl Transform {
    /// Run one inbound message and drain the outbound queue.
    pub fn run(&mut self, message: &InboundMessage) -> Result<Vec<OutboundMessage>, ScriptRuntimeError> {
        match self {
            Transform::Identity => Ok(vec![OutboundMessage::new(
                message.topic.clone(),
                message.payload.clone(),
            )]),
            Transform::Script(context) => context.run(&message.topic, &message.payload),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Transform::Identity)
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transform::Identity => write!(f, "Transform::Identity"),
            Transform::Script(_) => write!(f, "Transform::Script"),
        }
    }
}

/// Shared wasmtime engine plus the epoch ticker that enforces timeouts.
///
/// Every binding gets its own `Store`, so no state is shared between
/// scripts; only compiled code and the capability linker are shared.
pub struct SandboxEngine {
    engine: Engine,
    linker: Linker<HostState>,
    config: SandboxConfig,
    /// Held for its `Drop`, which stops the tick thread
    _ticker: EpochTicker,
}

impl SandboxEngine {
    pub fn new(config: SandboxConfig) -> anyhow::Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);

        let engine = Engine::new(&wasm_config).context("Failed to initialize Wasmtime engine")?;
        let linker = context::capability_linker(&engine)
            .context("Failed to register sandbox capabilities")?;
        let ticker = EpochTicker::start(engine.clone())?;

        Ok(Self {
            engine,
            linker,
            config,
            _ticker: ticker,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Load a transform, blocking the current thread.
    ///
    /// Reads and compiles the script, instantiates it in a fresh store and
    /// runs its top level under the load timeout.
    pub fn load_blocking(
        &self,
        binding: &str,
        source: &ScriptSource,
    ) -> Result<Transform, ScriptLoadError> {
        let module = match source {
            ScriptSource::Identity => return Ok(Transform::Identity),
            ScriptSource::File(path) => self.compile_file(path)?,
            ScriptSource::Inline(text) => Module::new(&self.engine, text.as_bytes())
                .map_err(|e| ScriptLoadError::Compile(format!("{:#}", e)))?,
        };

        let context = SandboxContext::instantiate(
            &self.engine,
            &self.linker,
            &module,
            binding,
            &self.config,
        )?;
        debug!("Binding '{}': script loaded", binding);
        Ok(Transform::Script(Box::new(context)))
    }

    /// Load a transform on the blocking pool.
    pub async fn load(
        self: &Arc<Self>,
        binding: &str,
        source: &ScriptSource,
    ) -> Result<Transform, ScriptLoadError> {
        let engine = self.clone();
        let binding = binding.to_string();
        let source = source.clone();
        tokio::task::spawn_blocking(move || engine.load_blocking(&binding, &source))
            .await
            .map_err(|e| ScriptLoadError::Worker(e.to_string()))?
    }

    /// Run a transform on the blocking pool.
    ///
    /// Ownership of the transform moves into the worker and back, so a
    /// context can never be used by two invocations at once. The transform
    /// is lost only if the worker panics.
    pub async fn run(
        transform: Transform,
        message: InboundMessage,
    ) -> (
        Option<Transform>,
        Result<Vec<OutboundMessage>, ScriptRuntimeError>,
    ) {
        let mut transform = transform;
        if transform.is_identity() {
            let result = transform.run(&message);
            return (Some(transform), result);
        }

        match tokio::task::spawn_blocking(move || {
            let result = transform.run(&message);
            (transform, result)
        })
        .await
        {
            Ok((transform, result)) => (Some(transform), result),
            Err(e) => (None, Err(ScriptRuntimeError::Worker(e.to_string()))),
        }
    }

    fn compile_file(&self, path: &Path) -> Result<Module, ScriptLoadError> {
        let bytes = std::fs::read(path).map_err(|e| ScriptLoadError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Module::new(&self.engine, &bytes).map_err(|e| ScriptLoadError::Compile(format!("{:#}", e)))
    }

    #[cfg(test)]
    pub(crate) fn ticker_running(&self) -> bool {
        self._ticker.is_running()
    }
}

/// Background thread advancing the engine epoch every [`EPOCH_TICK`]
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("sandbox-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .context("Failed to spawn sandbox epoch thread")?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
