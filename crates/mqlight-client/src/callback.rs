//! Running application callbacks off the client's internal threads.
//!
//! Listener callbacks are handed to a [`CallbackService`] together with an
//! ordering key. Tasks sharing a key run one at a time, in submission order,
//! so every listener of a given client observes events in the order the
//! client produced them.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel as channel;

use crate::component::panic_message;

/// A callback ready to run.
pub type CallbackTask = Box<dyn FnOnce() + Send + 'static>;

/// Executes listener callbacks.
pub trait CallbackService: Send + Sync {
    /// Run `task`. Tasks with equal `ordering` must run sequentially in
    /// submission order.
    fn run(&self, task: CallbackTask, ordering: u64);
}

/// Fixed pool of callback threads. Each ordering key is pinned to one thread.
pub struct ThreadPoolCallbackService {
    workers: Vec<channel::Sender<CallbackTask>>,
}

impl ThreadPoolCallbackService {
    pub const DEFAULT_THREADS: usize = 5;

    pub fn new(threads: usize) -> Self {
        let workers = (0..threads.max(1))
            .filter_map(|n| {
                let (tx, rx) = channel::unbounded::<CallbackTask>();
                let spawned = thread::Builder::new()
                    .name(format!("mqlight-callback-{}", n))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
                                log::error!("Listener callback panicked: {}", panic_message(&panic));
                            }
                        }
                    });
                match spawned {
                    Ok(_) => Some(tx),
                    Err(e) => {
                        log::error!("Failed to spawn callback thread: {}", e);
                        None
                    }
                }
            })
            .collect();
        Self { workers }
    }
}

impl Default for ThreadPoolCallbackService {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THREADS)
    }
}

impl CallbackService for ThreadPoolCallbackService {
    fn run(&self, task: CallbackTask, ordering: u64) {
        if self.workers.is_empty() {
            log::error!("No callback threads available, callback dropped");
            return;
        }
        let index = (ordering % self.workers.len() as u64) as usize;
        if self.workers[index].send(task).is_err() {
            log::error!("Callback thread {} has exited, callback dropped", index);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_same_key_runs_in_order() {
        let service = ThreadPoolCallbackService::new(3);
        let (tx, rx) = channel::unbounded();
        let busy = Arc::new(AtomicBool::new(false));

        for i in 0..200u32 {
            let tx = tx.clone();
            let busy = Arc::clone(&busy);
            service.run(
                Box::new(move || {
                    assert!(!busy.swap(true, Ordering::SeqCst));
                    let _ = tx.send(i);
                    busy.store(false, Ordering::SeqCst);
                }),
                7,
            );
        }

        for expected in 0..200u32 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        }
    }

    #[test]
    fn test_panicking_callback_does_not_kill_worker() {
        let service = ThreadPoolCallbackService::new(1);
        let (tx, rx) = channel::unbounded();

        service.run(Box::new(|| panic!("listener blew up")), 0);
        service.run(Box::new(move || tx.send("still alive").unwrap()), 0);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "still alive");
    }
}
