//! Message driven components.
//!
//! A component owns its state and is only ever touched by one thread at a
//! time. Other parts of the client interact with it by `tell`ing it
//! messages, which are queued in a lock-free inbox and processed in arrival
//! order by a shared pool of worker threads.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::thread;

use crossbeam_channel as channel;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::error::Result;

/// Messages handled per scheduling turn before the worker moves on.
const BATCH_SIZE: usize = 64;

static NEXT_COMPONENT_ID: AtomicU64 = AtomicU64::new(1);

static SHARED_POOL: LazyLock<ComponentPool> = LazyLock::new(|| {
    let threads = thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2);
    ComponentPool::new(threads)
});

/// Unique identity of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(u64);

impl ComponentId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "component-{}", self.0)
    }
}

/// Who sent a message. `Sender::NOBODY` for messages from outside any component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sender(Option<ComponentId>);

impl Sender {
    pub const NOBODY: Sender = Sender(None);

    pub fn id(&self) -> Option<ComponentId> {
        self.0
    }
}

impl From<ComponentId> for Sender {
    fn from(id: ComponentId) -> Self {
        Sender(Some(id))
    }
}

/// A unit of state driven by messages.
pub trait Component: Send + 'static {
    type Message: Send + 'static;

    /// Handle one message. `me` is a reference to this component, for
    /// handing out to collaborators that need to reply.
    ///
    /// Errors are logged and do not stop the component.
    fn on_receive(
        &mut self,
        me: &ComponentRef<Self::Message>,
        message: Self::Message,
        sender: Sender,
    ) -> Result<()>;
}

struct Envelope<M> {
    message: M,
    sender: Sender,
}

trait Mailbox<M>: Send + Sync {
    fn enqueue(self: Arc<Self>, envelope: Envelope<M>);
}

/// Handle used to send messages to a component.
pub struct ComponentRef<M> {
    id: ComponentId,
    mailbox: Arc<dyn Mailbox<M>>,
}

impl<M> Clone for ComponentRef<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            mailbox: Arc::clone(&self.mailbox),
        }
    }
}

impl<M> fmt::Debug for ComponentRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComponentRef").field(&self.id).finish()
    }
}

impl<M: Send + 'static> ComponentRef<M> {
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// Queue `message` for the component. Never blocks.
    pub fn tell(&self, message: M, sender: Sender) {
        Arc::clone(&self.mailbox).enqueue(Envelope { message, sender });
    }

    /// A reference that does not keep the component alive.
    pub fn downgrade(&self) -> WeakComponentRef<M> {
        WeakComponentRef {
            id: self.id,
            mailbox: Arc::downgrade(&self.mailbox),
        }
    }
}

/// Non-owning [`ComponentRef`]. A component is dropped once no
/// `ComponentRef` to it remains and its inbox is idle.
pub struct WeakComponentRef<M> {
    id: ComponentId,
    mailbox: Weak<dyn Mailbox<M>>,
}

impl<M> Clone for WeakComponentRef<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            mailbox: Weak::clone(&self.mailbox),
        }
    }
}

impl<M> fmt::Debug for WeakComponentRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakComponentRef").field(&self.id).finish()
    }
}

impl<M: Send + 'static> WeakComponentRef<M> {
    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn upgrade(&self) -> Option<ComponentRef<M>> {
        self.mailbox.upgrade().map(|mailbox| ComponentRef { id: self.id, mailbox })
    }
}

struct Cell<C: Component> {
    id: ComponentId,
    inbox: SegQueue<Envelope<C::Message>>,
    scheduled: AtomicBool,
    component: Mutex<C>,
    pool: ComponentPool,
}

impl<C: Component> Cell<C> {
    fn schedule(self: &Arc<Self>) {
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let cell = Arc::clone(self);
            self.pool.execute(Box::new(move || cell.run()));
        }
    }

    fn run(self: Arc<Self>) {
        let me = ComponentRef {
            id: self.id,
            mailbox: Arc::clone(&self) as Arc<dyn Mailbox<C::Message>>,
        };

        {
            let mut component = self.component.lock();
            for _ in 0..BATCH_SIZE {
                let Some(envelope) = self.inbox.pop() else {
                    break;
                };
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    component.on_receive(&me, envelope.message, envelope.sender)
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!("{} failed to handle message: {}", self.id, e),
                    Err(panic) => log::error!(
                        "{} panicked handling message: {}",
                        self.id,
                        panic_message(&panic)
                    ),
                }
            }
        }

        self.scheduled.store(false, Ordering::Release);
        if !self.inbox.is_empty() {
            self.schedule();
        }
    }
}

impl<C: Component> Mailbox<C::Message> for Cell<C> {
    fn enqueue(self: Arc<Self>, envelope: Envelope<C::Message>) {
        self.inbox.push(envelope);
        self.schedule();
    }
}

type Job = Box<dyn FnOnce() + Send>;

struct PoolInner {
    jobs: channel::Sender<Job>,
}

/// Worker threads that run components.
///
/// Worker threads exit once the pool and every component spawned on it are
/// dropped.
#[derive(Clone)]
pub struct ComponentPool {
    inner: Arc<PoolInner>,
}

impl ComponentPool {
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = channel::unbounded::<Job>();
        for n in 0..threads.max(1) {
            let rx = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("mqlight-component-{}", n))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                });
            if let Err(e) = spawned {
                log::error!("Failed to spawn component worker: {}", e);
            }
        }
        Self {
            inner: Arc::new(PoolInner { jobs: tx }),
        }
    }

    /// Process-wide pool used by clients that do not bring their own.
    pub fn shared() -> ComponentPool {
        SHARED_POOL.clone()
    }

    /// Start `component` on this pool.
    pub fn spawn<C: Component>(&self, component: C) -> ComponentRef<C::Message> {
        self.spawn_cyclic(|_| component)
    }

    /// Start the component returned by `build`, which is handed a weak
    /// reference to the component itself.
    pub fn spawn_cyclic<C, F>(&self, build: F) -> ComponentRef<C::Message>
    where
        C: Component,
        F: FnOnce(WeakComponentRef<C::Message>) -> C,
    {
        let id = ComponentId(NEXT_COMPONENT_ID.fetch_add(1, Ordering::Relaxed));
        let cell = Arc::new_cyclic(|cell: &Weak<Cell<C>>| {
            let mailbox: Weak<dyn Mailbox<C::Message>> = cell.clone();
            Cell {
                id,
                inbox: SegQueue::new(),
                scheduled: AtomicBool::new(false),
                component: Mutex::new(build(WeakComponentRef { id, mailbox })),
                pool: self.clone(),
            }
        });
        ComponentRef { id, mailbox: cell }
    }

    fn execute(&self, job: Job) {
        if self.inner.jobs.send(job).is_err() {
            log::error!("Component pool has no workers, message dropped");
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ClientError;

    enum Probe {
        Record(usize, u32),
        Fail,
        Panic,
        Ping(channel::Sender<Option<ComponentId>>),
    }

    struct Recorder {
        busy: Arc<AtomicBool>,
        seen: channel::Sender<(usize, u32)>,
    }

    impl Component for Recorder {
        type Message = Probe;

        fn on_receive(&mut self, _me: &ComponentRef<Probe>, message: Probe, sender: Sender) -> Result<()> {
            assert!(!self.busy.swap(true, Ordering::SeqCst), "concurrent delivery");
            let outcome = match message {
                Probe::Record(thread, seq) => {
                    let _ = self.seen.send((thread, seq));
                    Ok(())
                }
                Probe::Fail => Err(ClientError::State("refused".into())),
                Probe::Panic => {
                    self.busy.store(false, Ordering::SeqCst);
                    panic!("probe panic");
                }
                Probe::Ping(reply) => {
                    let _ = reply.send(sender.id());
                    Ok(())
                }
            };
            self.busy.store(false, Ordering::SeqCst);
            outcome
        }
    }

    fn spawn_recorder(pool: &ComponentPool) -> (ComponentRef<Probe>, channel::Receiver<(usize, u32)>) {
        let (tx, rx) = channel::unbounded();
        let component = Recorder {
            busy: Arc::new(AtomicBool::new(false)),
            seen: tx,
        };
        (pool.spawn(component), rx)
    }

    #[test]
    fn test_per_sender_order_and_exclusive_access() {
        let pool = ComponentPool::new(4);
        let (target, rx) = spawn_recorder(&pool);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let target = target.clone();
                thread::spawn(move || {
                    for seq in 0..500 {
                        target.tell(Probe::Record(t, seq), Sender::NOBODY);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut next = [0u32; 4];
        for _ in 0..2000 {
            let (t, seq) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(seq, next[t]);
            next[t] += 1;
        }
    }

    #[test]
    fn test_errors_and_panics_do_not_stop_inbox() {
        let pool = ComponentPool::new(1);
        let (target, rx) = spawn_recorder(&pool);

        target.tell(Probe::Fail, Sender::NOBODY);
        target.tell(Probe::Panic, Sender::NOBODY);
        target.tell(Probe::Record(0, 1), Sender::NOBODY);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (0, 1));
    }

    #[test]
    fn test_sender_identity_is_passed_through() {
        let pool = ComponentPool::new(1);
        let (target, _rx) = spawn_recorder(&pool);
        let (other, _) = spawn_recorder(&pool);
        let (tx, rx) = channel::unbounded();

        target.tell(Probe::Ping(tx.clone()), Sender::from(other.id()));
        target.tell(Probe::Ping(tx), Sender::NOBODY);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(other.id()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), None);
        assert_ne!(target.id(), other.id());
    }

    struct Echo {
        me: WeakComponentRef<Probe>,
        seen: channel::Sender<(usize, u32)>,
    }

    impl Component for Echo {
        type Message = Probe;

        fn on_receive(&mut self, me: &ComponentRef<Probe>, message: Probe, _sender: Sender) -> Result<()> {
            if let Probe::Record(t, seq) = message {
                assert_eq!(self.me.id(), me.id());
                let _ = self.seen.send((t, seq));
                if seq == 0 {
                    if let Some(me) = self.me.upgrade() {
                        me.tell(Probe::Record(t, 1), Sender::NOBODY);
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_weak_reference_does_not_keep_component_alive() {
        let pool = ComponentPool::new(1);
        let (tx, rx) = channel::unbounded();
        let target = pool.spawn_cyclic(|me| Echo { me, seen: tx });
        let weak = target.downgrade();

        target.tell(Probe::Record(3, 0), Sender::NOBODY);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (3, 0));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (3, 1));
        assert!(weak.upgrade().is_some());

        drop(target);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while weak.upgrade().is_some() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(weak.upgrade().is_none());
        // The component owned the only sender.
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());
    }
}
