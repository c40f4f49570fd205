//! Application listeners.
//!
//! Every listener method has a no-op default, so implementations only
//! override the events they care about. Listeners are invoked on the
//! client's callback threads, never on the thread that issued the call, and
//! always receive the context value supplied alongside them.

use std::sync::Arc;

use crate::client::NonBlockingClient;
use crate::delivery::Delivery;
use crate::error::{ClientError, Result};

/// Told the outcome of a single operation.
pub trait CompletionListener<T>: Send + Sync + 'static {
    #[allow(unused_variables)]
    fn on_success(&self, client: &NonBlockingClient, context: &T) {}

    #[allow(unused_variables)]
    fn on_error(&self, client: &NonBlockingClient, context: &T, error: ClientError) {}
}

impl<T, F> CompletionListener<T> for F
where
    F: Fn(&NonBlockingClient, &T, Result<()>) + Send + Sync + 'static,
{
    fn on_success(&self, client: &NonBlockingClient, context: &T) {
        self(client, context, Ok(()))
    }

    fn on_error(&self, client: &NonBlockingClient, context: &T, error: ClientError) {
        self(client, context, Err(error))
    }
}

/// Told about lifecycle changes of a client.
pub trait NonBlockingClientListener<T>: Send + Sync + 'static {
    #[allow(unused_variables)]
    fn on_started(&self, client: &NonBlockingClient, context: &T) {}

    /// The client reached `Stopped`. `error` is set when it stopped because
    /// of a failure, such as being replaced or refused by the server.
    #[allow(unused_variables)]
    fn on_stopped(&self, client: &NonBlockingClient, context: &T, error: Option<ClientError>) {}

    /// Reconnected after `on_retrying`, with subscriptions re-established.
    #[allow(unused_variables)]
    fn on_restarted(&self, client: &NonBlockingClient, context: &T) {}

    #[allow(unused_variables)]
    fn on_retrying(&self, client: &NonBlockingClient, context: &T, error: ClientError) {}

    /// A send reported a full buffer earlier and the buffer has since drained.
    #[allow(unused_variables)]
    fn on_drain(&self, client: &NonBlockingClient, context: &T) {}
}

/// Receives messages for one subscription.
pub trait DestinationListener<T>: Send + Sync + 'static {
    #[allow(unused_variables)]
    fn on_message(&self, client: &NonBlockingClient, context: &T, delivery: Delivery) {}

    /// A text payload was not valid UTF-8. The raw bytes are in the delivery.
    #[allow(unused_variables)]
    fn on_malformed(&self, client: &NonBlockingClient, context: &T, delivery: Delivery) {}

    #[allow(unused_variables)]
    fn on_unsubscribed(&self, client: &NonBlockingClient, context: &T, topic_pattern: &str, share: Option<&str>) {}
}

/// Listener that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl<T> CompletionListener<T> for NoopListener {}

impl<T> NonBlockingClientListener<T> for NoopListener {}

impl<T> DestinationListener<T> for NoopListener {}

/// Deferred call of a completion listener.
pub(crate) type Completion = Box<dyn FnOnce(&NonBlockingClient, Result<()>) + Send>;

pub(crate) fn completion<T, L>(listener: L, context: Arc<T>) -> Completion
where
    T: Send + Sync + 'static,
    L: CompletionListener<T>,
{
    Box::new(move |client, outcome| match outcome {
        Ok(()) => listener.on_success(client, &context),
        Err(e) => listener.on_error(client, &context, e),
    })
}

pub(crate) enum LifecycleEvent {
    Started,
    Stopped(Option<ClientError>),
    Restarted,
    Retrying(ClientError),
    Drain,
}

/// A lifecycle listener bound to its context.
pub(crate) trait LifecycleSink: Send + Sync {
    fn notify(&self, client: &NonBlockingClient, event: LifecycleEvent);
}

/// A destination listener bound to its context.
pub(crate) trait DestinationSink: Send + Sync {
    fn deliver(&self, client: &NonBlockingClient, delivery: Delivery);

    fn unsubscribed(&self, client: &NonBlockingClient, topic_pattern: &str, share: Option<&str>);
}

pub(crate) struct Bound<L, T> {
    listener: L,
    context: Arc<T>,
}

impl<L, T> Bound<L, T> {
    pub fn new(listener: L, context: Arc<T>) -> Self {
        Self { listener, context }
    }
}

impl<L, T> LifecycleSink for Bound<L, T>
where
    L: NonBlockingClientListener<T>,
    T: Send + Sync + 'static,
{
    fn notify(&self, client: &NonBlockingClient, event: LifecycleEvent) {
        let context = &*self.context;
        match event {
            LifecycleEvent::Started => self.listener.on_started(client, context),
            LifecycleEvent::Stopped(error) => self.listener.on_stopped(client, context, error),
            LifecycleEvent::Restarted => self.listener.on_restarted(client, context),
            LifecycleEvent::Retrying(error) => self.listener.on_retrying(client, context, error),
            LifecycleEvent::Drain => self.listener.on_drain(client, context),
        }
    }
}

impl<L, T> DestinationSink for Bound<L, T>
where
    L: DestinationListener<T>,
    T: Send + Sync + 'static,
{
    fn deliver(&self, client: &NonBlockingClient, delivery: Delivery) {
        if delivery.is_malformed() {
            self.listener.on_malformed(client, &self.context, delivery);
        } else {
            self.listener.on_message(client, &self.context, delivery);
        }
    }

    fn unsubscribed(&self, client: &NonBlockingClient, topic_pattern: &str, share: Option<&str>) {
        self.listener
            .on_unsubscribed(client, &self.context, topic_pattern, share);
    }
}
