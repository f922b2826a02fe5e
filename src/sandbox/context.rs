//! Per-binding sandbox context and the host capabilities it links against

use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};
use wasmtime::{
    Caller, Engine, Extern, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
    TypedFunc,
};

use super::{deadline_ticks, ScriptLoadError, ScriptRuntimeError};
use crate::config::SandboxConfig;
use crate::message::OutboundMessage;

/// Import module name for host capabilities
pub(crate) const CAPABILITY_MODULE: &str = "relay";

/// Data owned by a binding's store
pub(crate) struct HostState {
    binding: Arc<str>,
    outbound: Vec<OutboundMessage>,
    max_outbound: usize,
    overflowed: bool,
    limits: StoreLimits,
}

/// Loaded script instance owned by exactly one binding.
///
/// Globals and linear memory persist across invocations, so a script can
/// keep state between messages.
pub struct SandboxContext {
    store: Store<HostState>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    handler: TypedFunc<(i32, i32, i32, i32), i32>,
    run_ticks: u64,
}

impl SandboxContext {
    pub(crate) fn instantiate(
        engine: &Engine,
        linker: &Linker<HostState>,
        module: &Module,
        binding: &str,
        config: &SandboxConfig,
    ) -> Result<Self, ScriptLoadError> {
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory)
            .instances(1)
            .trap_on_grow_failure(true)
            .build();

        let mut store = Store::new(
            engine,
            HostState {
                binding: Arc::from(binding),
                outbound: Vec::new(),
                max_outbound: config.max_outbound,
                overflowed: false,
                limits,
            },
        );
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(deadline_ticks(config.load_timeout));

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| load_error(&store, e))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(ScriptLoadError::MissingExport("memory"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|_| ScriptLoadError::MissingExport("alloc"))?;
        let handler = instance
            .get_typed_func::<(i32, i32, i32, i32), i32>(&mut store, "handler")
            .map_err(|_| ScriptLoadError::MissingExport("handler"))?;

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "init") {
            init.call(&mut store, ())
                .map_err(|e| load_error(&store, e))?;
        }

        if !store.data().outbound.is_empty() {
            debug!(
                "Binding '{}': {} message(s) queued during load",
                binding,
                store.data().outbound.len()
            );
        }

        Ok(Self {
            store,
            memory,
            alloc,
            handler,
            run_ticks: deadline_ticks(config.run_timeout),
        })
    }

    /// Invoke the handler with one message and drain the outbound queue.
    ///
    /// Messages queued during load are delivered with the first call. On
    /// error the queue is discarded.
    pub fn run(
        &mut self,
        topic: &str,
        payload: &[u8],
    ) -> Result<Vec<OutboundMessage>, ScriptRuntimeError> {
        self.store.set_epoch_deadline(self.run_ticks);
        self.store.data_mut().overflowed = false;

        let result = self.invoke(topic, payload);
        let outbound = std::mem::take(&mut self.store.data_mut().outbound);

        match result {
            Ok(status) if status < 0 => Err(ScriptRuntimeError::AbnormalStatus(status)),
            Ok(_) => Ok(outbound),
            Err(e) => Err(e),
        }
    }

    /// Messages currently waiting in the outbound queue
    pub fn pending_outbound(&self) -> usize {
        self.store.data().outbound.len()
    }

    fn invoke(&mut self, topic: &str, payload: &[u8]) -> Result<i32, ScriptRuntimeError> {
        let (topic_ptr, topic_len) = self.write_input(topic.as_bytes())?;
        let (payload_ptr, payload_len) = self.write_input(payload)?;

        self.handler
            .call(&mut self.store, (topic_ptr, topic_len, payload_ptr, payload_len))
            .map_err(|e| runtime_error(&self.store, e))
    }

    fn write_input(&mut self, bytes: &[u8]) -> Result<(i32, i32), ScriptRuntimeError> {
        let len = i32::try_from(bytes.len())
            .map_err(|_| ScriptRuntimeError::Guest("input exceeds guest address space".into()))?;
        let ptr = self
            .alloc
            .call(&mut self.store, len)
            .map_err(|e| runtime_error(&self.store, e))?;
        let offset = usize::try_from(ptr)
            .map_err(|_| ScriptRuntimeError::Guest(format!("alloc returned {}", ptr)))?;
        self.memory
            .write(&mut self.store, offset, bytes)
            .map_err(|_| ScriptRuntimeError::Guest("alloc returned an out-of-bounds buffer".into()))?;
        Ok((ptr, len))
    }
}

fn is_interrupt(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Trap>(), Some(Trap::Interrupt))
}

fn load_error(store: &Store<HostState>, err: anyhow::Error) -> ScriptLoadError {
    if is_interrupt(&err) {
        ScriptLoadError::Timeout
    } else if store.data().overflowed {
        ScriptLoadError::Instantiate(format!(
            "outbound queue overflow (max {})",
            store.data().max_outbound
        ))
    } else if err.downcast_ref::<Trap>().is_some() {
        ScriptLoadError::Trap(format!("{:#}", err))
    } else {
        ScriptLoadError::Instantiate(format!("{:#}", err))
    }
}

fn runtime_error(store: &Store<HostState>, err: anyhow::Error) -> ScriptRuntimeError {
    if is_interrupt(&err) {
        ScriptRuntimeError::Timeout
    } else if store.data().overflowed {
        ScriptRuntimeError::QueueOverflow(store.data().max_outbound)
    } else {
        ScriptRuntimeError::Trap(format!("{:#}", err))
    }
}

/// Build the linker holding every capability a script may import.
///
/// Anything a module imports beyond these fails instantiation.
pub(crate) fn capability_linker(engine: &Engine) -> anyhow::Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);

    linker.func_wrap(
        CAPABILITY_MODULE,
        "publish",
        |mut caller: Caller<'_, HostState>,
         topic_ptr: i32,
         topic_len: i32,
         payload_ptr: i32,
         payload_len: i32|
         -> anyhow::Result<i32> {
            let topic = read_guest(&mut caller, topic_ptr, topic_len)?;
            let topic = String::from_utf8(topic).map_err(|_| anyhow!("topic is not valid UTF-8"))?;
            let payload = read_guest(&mut caller, payload_ptr, payload_len)?;

            let state = caller.data_mut();
            if state.outbound.len() >= state.max_outbound {
                state.overflowed = true;
                bail!("outbound queue overflow");
            }
            state
                .outbound
                .push(OutboundMessage::new(topic, Bytes::from(payload)));
            Ok(state.outbound.len() as i32)
        },
    )?;

    linker.func_wrap(
        CAPABILITY_MODULE,
        "log",
        |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| -> anyhow::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let text = String::from_utf8_lossy(&bytes);
            let binding = &caller.data().binding;
            match level {
                0 => error!("Binding '{}': {}", binding, text),
                1 => warn!("Binding '{}': {}", binding, text),
                2 => info!("Binding '{}': {}", binding, text),
                3 => debug!("Binding '{}': {}", binding, text),
                _ => trace!("Binding '{}': {}", binding, text),
            }
            Ok(())
        },
    )?;

    Ok(linker)
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => memory,
        _ => bail!("guest does not export memory"),
    };
    let start = usize::try_from(ptr).map_err(|_| anyhow!("negative guest pointer"))?;
    let len = usize::try_from(len).map_err(|_| anyhow!("negative guest length"))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| anyhow!("guest buffer overflows address space"))?;

    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow!("guest buffer out of bounds"))
}
