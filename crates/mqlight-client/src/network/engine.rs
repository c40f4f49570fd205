//! Reference counted I/O engine shared by every channel.
//!
//! The first connect builds a tokio runtime, each open channel holds an
//! [`EngineLease`] on it, and the runtime is shut down when the last lease
//! is released. A later connect builds a fresh one.

use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::Result;

static SHARED: LazyLock<Arc<IoEngine>> = LazyLock::new(|| Arc::new(IoEngine::new()));

struct Slot {
    runtime: Option<Runtime>,
    leases: usize,
}

/// Lazily created, reference counted tokio runtime.
pub struct IoEngine {
    slot: Mutex<Slot>,
}

impl IoEngine {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                runtime: None,
                leases: 0,
            }),
        }
    }

    /// The process-wide engine.
    pub fn shared() -> Arc<IoEngine> {
        Arc::clone(&SHARED)
    }

    /// Take a lease, starting the runtime with `io_threads` workers if no
    /// lease is currently held.
    pub fn acquire(self: &Arc<Self>, io_threads: usize) -> Result<EngineLease> {
        let mut slot = self.slot.lock();
        let handle = match &slot.runtime {
            Some(runtime) => runtime.handle().clone(),
            None => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(io_threads.max(1))
                    .thread_name("mqlight-io")
                    .enable_io()
                    .enable_time()
                    .build()?;
                log::debug!("Started I/O engine with {} threads", io_threads.max(1));
                let handle = runtime.handle().clone();
                slot.runtime = Some(runtime);
                handle
            }
        };
        slot.leases += 1;
        Ok(EngineLease {
            engine: Arc::clone(self),
            handle,
        })
    }

    fn release(&self) {
        let retired = {
            let mut slot = self.slot.lock();
            slot.leases = slot.leases.saturating_sub(1);
            if slot.leases == 0 {
                slot.runtime.take()
            } else {
                None
            }
        };
        if let Some(runtime) = retired {
            log::debug!("Shutting down idle I/O engine");
            // Safe to call from inside one of the runtime's own tasks.
            runtime.shutdown_background();
        }
    }

    /// Number of outstanding leases.
    pub fn leases(&self) -> usize {
        self.slot.lock().leases
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().runtime.is_some()
    }
}

impl Default for IoEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the engine alive. Dropping the last lease shuts the engine down.
pub struct EngineLease {
    engine: Arc<IoEngine>,
    handle: Handle,
}

impl EngineLease {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.engine.release();
    }
}
