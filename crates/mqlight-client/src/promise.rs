//! Single-assignment completion handles.
//!
//! Asynchronous services (endpoint lookup, network, timers) report back
//! through a [`Promise`]. A promise may be resolved exactly once; a second
//! attempt is a usage error and has no effect.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::component::{ComponentRef, Sender};
use crate::error::{ClientError, Result};

/// A completion handle that is resolved once with a value or an error.
pub trait Promise<T>: Send + Sync {
    /// Resolve with `value`. Fails with [`ClientError::Usage`] if already complete.
    fn set_success(&self, value: T) -> Result<()>;

    /// Resolve with `error`. Fails with [`ClientError::Usage`] if already complete.
    fn set_failure(&self, error: ClientError) -> Result<()>;

    fn is_complete(&self) -> bool;
}

type Action<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Promise that runs an action with its outcome, once.
pub struct OncePromise<T> {
    complete: AtomicBool,
    action: Mutex<Option<Action<T>>>,
}

impl<T: Send + 'static> OncePromise<T> {
    pub fn new(action: impl FnOnce(Result<T>) + Send + 'static) -> Self {
        Self {
            complete: AtomicBool::new(false),
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// Promise whose outcome is mapped to a message for `target`.
    pub fn telling<M: Send + 'static>(
        target: ComponentRef<M>,
        map: impl FnOnce(Result<T>) -> M + Send + 'static,
    ) -> Self {
        Self::new(move |outcome| target.tell(map(outcome), Sender::NOBODY))
    }

    pub fn boxed(self) -> Box<dyn Promise<T>> {
        Box::new(self)
    }

    fn complete(&self, outcome: Result<T>) -> Result<()> {
        if self
            .complete
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ClientError::Usage("promise already completed".into()));
        }
        if let Some(action) = self.action.lock().take() {
            action(outcome);
        }
        Ok(())
    }
}

impl<T: Send + 'static> Promise<T> for OncePromise<T> {
    fn set_success(&self, value: T) -> Result<()> {
        self.complete(Ok(value))
    }

    fn set_failure(&self, error: ClientError) -> Result<()> {
        self.complete(Err(error))
    }

    fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

/// Resolve `promise`. Resolving it a second time is a bug in the client:
/// logged as an error, and a panic in debug builds.
pub(crate) fn resolve<T>(promise: &dyn Promise<T>, outcome: Result<T>) {
    let result = match outcome {
        Ok(value) => promise.set_success(value),
        Err(e) => promise.set_failure(e),
    };
    if let Err(e) = result {
        log::error!("Promise resolved twice: {}", e);
        if cfg!(debug_assertions) {
            panic!("promise resolved twice: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel as channel;

    use super::*;
    use crate::component::{Component, ComponentPool};

    #[test]
    fn test_second_resolution_is_usage_error() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let promise = OncePromise::new(move |outcome: Result<u32>| {
            assert_eq!(outcome.unwrap(), 5);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!promise.is_complete());
        promise.set_success(5).unwrap();
        assert!(promise.is_complete());

        assert!(matches!(promise.set_success(6), Err(ClientError::Usage(_))));
        assert!(matches!(
            promise.set_failure(ClientError::Network("late".into())),
            Err(ClientError::Usage(_))
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "promise resolved twice"))]
    fn test_internal_double_resolution_is_loud() {
        let promise = OncePromise::new(|_: Result<u32>| {});
        resolve(&promise, Ok(1));
        resolve(&promise, Ok(2));
    }

    #[test]
    fn test_racing_resolvers_exactly_one_wins() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let promise = Arc::new(OncePromise::new(move |_: Result<usize>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let winners: usize = (0..8)
            .map(|n| {
                let promise = Arc::clone(&promise);
                thread::spawn(move || promise.set_success(n).is_ok() as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    struct Mirror(channel::Sender<std::result::Result<String, String>>);

    impl Component for Mirror {
        type Message = std::result::Result<String, String>;

        fn on_receive(&mut self, _me: &ComponentRef<Self::Message>, message: Self::Message, _sender: Sender) -> Result<()> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    #[test]
    fn test_telling_delivers_mapped_outcome() {
        let pool = ComponentPool::new(1);
        let (tx, rx) = channel::unbounded();
        let target = pool.spawn(Mirror(tx));

        let promise = OncePromise::telling(target.clone(), |outcome: Result<u8>| {
            outcome.map(|v| v.to_string()).map_err(|e| e.to_string())
        });
        promise.set_failure(ClientError::Security("denied".into())).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, Err("Security error: denied".to_string()));
    }
}
