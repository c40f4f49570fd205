//! Delayed completion of promises.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;

use crate::promise::Promise;

/// Identifies a scheduled timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Completes promises after a delay.
pub trait TimerService: Send + Sync {
    /// Resolve `promise` successfully once `delay` has elapsed.
    fn schedule(&self, delay: Duration, promise: Box<dyn Promise<()>>) -> TimerHandle;

    /// Cancel a pending timer. Its promise is dropped unresolved.
    fn cancel(&self, handle: TimerHandle);
}

enum Command {
    Schedule {
        id: u64,
        deadline: Instant,
        promise: Box<dyn Promise<()>>,
    },
    Cancel(u64),
}

/// Timer service backed by a single thread.
///
/// The thread exits when the service is dropped.
pub struct ThreadTimerService {
    commands: channel::Sender<Command>,
    next_id: AtomicU64,
}

impl ThreadTimerService {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        if let Err(e) = thread::Builder::new()
            .name("mqlight-timer".into())
            .spawn(move || run_timers(rx))
        {
            log::error!("Failed to spawn timer thread: {}", e);
        }
        Self {
            commands: tx,
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for ThreadTimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService for ThreadTimerService {
    fn schedule(&self, delay: Duration, promise: Box<dyn Promise<()>>) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let command = Command::Schedule {
            id,
            deadline: Instant::now() + delay,
            promise,
        };
        if self.commands.send(command).is_err() {
            log::error!("Timer thread has exited, timer {} will never fire", id);
        }
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        let _ = self.commands.send(Command::Cancel(handle.0));
    }
}

fn run_timers(commands: channel::Receiver<Command>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut pending: HashMap<u64, Box<dyn Promise<()>>> = HashMap::new();

    loop {
        let received = match deadlines.peek() {
            Some(Reverse((deadline, _))) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                commands.recv_timeout(wait).map_err(|e| e.is_disconnected())
            }
            None => commands.recv().map_err(|_| true),
        };

        match received {
            Ok(Command::Schedule {
                id,
                deadline,
                promise,
            }) => {
                deadlines.push(Reverse((deadline, id)));
                pending.insert(id, promise);
            }
            Ok(Command::Cancel(id)) => {
                pending.remove(&id);
            }
            Err(true) => return,
            Err(false) => {}
        }

        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if let Some(promise) = pending.remove(&id) {
                if let Err(e) = promise.set_success(()) {
                    log::debug!("Timer {} promise already resolved: {}", id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::OncePromise;

    fn sending(tx: &channel::Sender<&'static str>, label: &'static str) -> Box<dyn Promise<()>> {
        let tx = tx.clone();
        OncePromise::new(move |_| {
            let _ = tx.send(label);
        })
        .boxed()
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let timers = ThreadTimerService::new();
        let (tx, rx) = channel::unbounded();

        let started = Instant::now();
        timers.schedule(Duration::from_millis(60), sending(&tx, "late"));
        timers.schedule(Duration::from_millis(20), sending(&tx, "early"));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let timers = ThreadTimerService::new();
        let (tx, rx) = channel::unbounded();

        let handle = timers.schedule(Duration::from_millis(30), sending(&tx, "cancelled"));
        timers.cancel(handle);
        timers.schedule(Duration::from_millis(60), sending(&tx, "kept"));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "kept");
        assert!(rx.try_recv().is_err());
    }
}
