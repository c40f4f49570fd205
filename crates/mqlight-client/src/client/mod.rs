//! The non-blocking client.
//!
//! [`NonBlockingClient`] is a cheap handle. Calls validate their arguments
//! on the caller's thread, report argument and state errors immediately,
//! and hand everything else to the client's component. Outcomes arrive
//! later through listeners, on the client's callback threads.

mod actor;
#[cfg(test)]
mod test_broker;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mqlight_core::{frame_to_bytes, Frame, OutboundMessage, Payload, Properties};
use parking_lot::Mutex;

pub(crate) use self::actor::ClientMessage;
use self::actor::ClientCore;
use crate::callback::{CallbackService, ThreadPoolCallbackService};
use crate::component::{ComponentPool, ComponentRef, Sender, WeakComponentRef};
use crate::config::{validate_share, validate_topic, ClientOptions, SendOptions, StopOptions, SubscribeOptions};
use crate::endpoint::{EndpointService, SingleEndpointService};
use crate::error::{ClientError, Result};
use crate::events::{ClientState, StateCell};
use crate::listener::{
    completion, Bound, CompletionListener, DestinationListener, LifecycleSink, NonBlockingClientListener,
};
use crate::network::{NetworkService, TcpNetworkService};
use crate::session::{PendingSend, SendBuffer, Subscription, SubscriptionKey, SubscriptionRegistry, SubscriptionState};
use crate::settings::Settings;
use crate::timer::{ThreadTimerService, TimerService};

/// Keys callbacks of one client onto one callback thread.
static NEXT_ORDERING: AtomicU64 = AtomicU64::new(1);

/// Pluggable services a client runs on.
pub struct ClientServices {
    pub endpoint: Arc<dyn EndpointService>,
    pub network: Arc<dyn NetworkService>,
    pub callbacks: Arc<dyn CallbackService>,
    pub timer: Arc<dyn TimerService>,
    pub pool: ComponentPool,
}

impl ClientServices {
    /// Default services around `endpoint`: TCP transport on the shared
    /// engine, a callback pool sized from `options` and a timer thread.
    pub fn new(endpoint: Arc<dyn EndpointService>, options: &ClientOptions) -> Self {
        Self {
            endpoint,
            network: Arc::new(TcpNetworkService::default()),
            callbacks: Arc::new(ThreadPoolCallbackService::new(options.callback_threads)),
            timer: Arc::new(ThreadTimerService::new()),
            pool: ComponentPool::shared(),
        }
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkService>) -> Self {
        self.network = network;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn CallbackService>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_timer(mut self, timer: Arc<dyn TimerService>) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_pool(mut self, pool: ComponentPool) -> Self {
        self.pool = pool;
        self
    }
}

/// State shared by the handles and the component.
pub(crate) struct Shared {
    pub id: String,
    pub ordering: u64,
    pub state: StateCell,
    /// Endpoint of the open connection.
    pub service: Mutex<Option<String>>,
    pub registry: SubscriptionRegistry,
    pub sends: SendBuffer,
    /// Ids for sends, subscribes and unsubscribes.
    pub correlation: AtomicU64,
    /// Id of the open connection, zero when none.
    pub live_connection: Arc<AtomicU64>,
    pub callbacks: Arc<dyn CallbackService>,
}

/// Held by application handles. Stops the client when the last one goes.
struct Owner {
    core: ComponentRef<ClientMessage>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.core.tell(
            ClientMessage::Stop {
                drain: false,
                completion: None,
            },
            Sender::NOBODY,
        );
    }
}

/// A publish/subscribe client.
///
/// Created clients start straight away. Clones share the same client, which
/// is stopped when the last clone is dropped. The handle passed to listeners
/// does not keep the client running; clone the handle returned by
/// [`create`](Self::create) to do that.
#[derive(Clone)]
pub struct NonBlockingClient {
    shared: Arc<Shared>,
    core: WeakComponentRef<ClientMessage>,
    owner: Option<Arc<Owner>>,
}

impl fmt::Debug for NonBlockingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingClient")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl NonBlockingClient {
    /// Create a client for `service`, a URI such as `amqp://host:5672`.
    ///
    /// Credentials in `options` override any in the URI.
    pub fn create<T, L>(service: &str, options: ClientOptions, listener: L, context: T) -> Result<Self>
    where
        T: Send + Sync + 'static,
        L: NonBlockingClientListener<T>,
    {
        options.validate()?;
        let endpoint = SingleEndpointService::from_uri(
            service,
            options.username.as_deref(),
            options.password.as_deref(),
        )?;
        let services = ClientServices::new(Arc::new(endpoint), &options);
        Self::create_with(services, options, listener, context)
    }

    /// Create a client from loaded [`Settings`].
    pub fn from_settings<T, L>(settings: &Settings, listener: L, context: T) -> Result<Self>
    where
        T: Send + Sync + 'static,
        L: NonBlockingClientListener<T>,
    {
        settings.validate()?;
        let options = settings.client_options();
        let services = ClientServices::new(settings.endpoint_service()?, &options)
            .with_network(Arc::new(TcpNetworkService::new(settings.transport.clone())));
        Self::create_with(services, options, listener, context)
    }

    /// Create a client on the given services.
    pub fn create_with<T, L>(services: ClientServices, options: ClientOptions, listener: L, context: T) -> Result<Self>
    where
        T: Send + Sync + 'static,
        L: NonBlockingClientListener<T>,
    {
        options.validate()?;
        let id = options.resolve_id()?;
        let shared = Arc::new(Shared {
            id: id.clone(),
            ordering: NEXT_ORDERING.fetch_add(1, Ordering::Relaxed),
            state: StateCell::new(ClientState::Starting),
            service: Mutex::new(None),
            registry: SubscriptionRegistry::default(),
            sends: SendBuffer::new(options.max_buffered_sends),
            correlation: AtomicU64::new(1),
            live_connection: Arc::new(AtomicU64::new(0)),
            callbacks: Arc::clone(&services.callbacks),
        });
        let lifecycle: Arc<dyn LifecycleSink> = Arc::new(Bound::new(listener, Arc::new(context)));

        let core = services
            .pool
            .spawn_cyclic(|me| ClientCore::new(me, Arc::clone(&shared), &services, lifecycle));
        core.tell(ClientMessage::Start { completion: None }, Sender::NOBODY);

        log::info!("Created client {}", id);
        Ok(Self {
            shared,
            core: core.downgrade(),
            owner: Some(Arc::new(Owner { core })),
        })
    }

    /// Handle given to listeners.
    pub(crate) fn listener_view(shared: Arc<Shared>, core: WeakComponentRef<ClientMessage>) -> Self {
        Self {
            shared,
            core,
            owner: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> ClientState {
        self.shared.state.get()
    }

    /// Endpoint of the open connection, if any.
    pub fn service(&self) -> Option<String> {
        self.shared.service.lock().clone()
    }

    fn tell(&self, message: ClientMessage) {
        let core = match &self.owner {
            Some(owner) => Some(owner.core.clone()),
            None => self.core.upgrade(),
        };
        match core {
            Some(core) => core.tell(message, Sender::NOBODY),
            None => self.abandon(message),
        }
    }

    /// Complete a request made through a listener's handle after every
    /// application handle has been dropped and the client has stopped.
    fn abandon(&self, message: ClientMessage) {
        let outcome = match &message {
            ClientMessage::Stop { .. } => Ok(()),
            _ => Err(ClientError::State(format!("client {} has been dropped", self.id()))),
        };
        let Some(completion) = message.into_completion() else {
            return;
        };
        log::debug!("Client {} is gone, completing request locally", self.id());
        let client = self.clone();
        self.shared
            .callbacks
            .run(Box::new(move || completion(&client, outcome)), self.shared.ordering);
    }

    fn accepting(&self) -> Result<()> {
        let state = self.state();
        if state.is_stopping_or_stopped() {
            return Err(ClientError::State(format!("client {} is {}", self.id(), state)));
        }
        Ok(())
    }

    /// Start a stopped client. Succeeds at once if already started.
    pub fn start<T, L>(&self, listener: L, context: T)
    where
        T: Send + Sync + 'static,
        L: CompletionListener<T>,
    {
        self.tell(ClientMessage::Start {
            completion: Some(completion(listener, Arc::new(context))),
        });
    }

    /// Stop the client, closing its connection.
    ///
    /// With [`StopOptions::drain`] set, sends already handed to the client
    /// are completed first. Otherwise they fail with [`ClientError::State`].
    pub fn stop<T, L>(&self, options: StopOptions, listener: L, context: T)
    where
        T: Send + Sync + 'static,
        L: CompletionListener<T>,
    {
        self.tell(ClientMessage::Stop {
            drain: options.drain,
            completion: Some(completion(listener, Arc::new(context))),
        });
    }

    /// Send a message to `topic`.
    ///
    /// Returns `true` when the send buffer is full. The message is still
    /// accepted; `on_drain` follows once the buffer empties.
    pub fn send<T, L>(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        properties: Properties,
        options: &SendOptions,
        listener: L,
        context: T,
    ) -> Result<bool>
    where
        T: Send + Sync + 'static,
        L: CompletionListener<T>,
    {
        self.accepting()?;
        validate_topic(topic, "topic")?;
        let ttl_ms = options.ttl_ms()?;

        let shared = &self.shared;
        let id = shared.correlation.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Send(OutboundMessage {
            id,
            topic: topic.to_string(),
            qos: options.qos,
            ttl_ms,
            properties,
            payload: payload.into(),
        });
        let data = frame_to_bytes(&frame)
            .map_err(|e| ClientError::Argument(format!("message cannot be sent: {}", e)))?;

        let full = shared.sends.reserve();
        self.tell(ClientMessage::Send(PendingSend {
            id,
            qos: options.qos,
            data,
            completion: completion(listener, Arc::new(context)),
        }));
        Ok(full)
    }

    /// Subscribe to `topic_pattern`, delivering messages to `destination`.
    pub fn subscribe<T, D, L>(
        &self,
        topic_pattern: &str,
        options: &SubscribeOptions,
        destination: D,
        listener: L,
        context: T,
    ) -> Result<()>
    where
        T: Send + Sync + 'static,
        D: DestinationListener<T>,
        L: CompletionListener<T>,
    {
        self.subscribe_optional(topic_pattern, options, Some(destination), listener, context)
    }

    /// As [`subscribe`](Self::subscribe), failing with
    /// [`ClientError::Argument`] when `destination` is `None`.
    pub fn subscribe_optional<T, D, L>(
        &self,
        topic_pattern: &str,
        options: &SubscribeOptions,
        destination: Option<D>,
        listener: L,
        context: T,
    ) -> Result<()>
    where
        T: Send + Sync + 'static,
        D: DestinationListener<T>,
        L: CompletionListener<T>,
    {
        self.accepting()?;
        validate_topic(topic_pattern, "topic pattern")?;
        let ttl_ms = options.validate()?;
        let destination =
            destination.ok_or_else(|| ClientError::Argument("a destination listener is required".into()))?;

        let key = SubscriptionKey::new(topic_pattern, options.share.as_deref());
        self.shared.registry.register(&key)?;

        let context = Arc::new(context);
        let subscription = Subscription {
            options: options.clone(),
            ttl_ms,
            destination: Arc::new(Bound::new(destination, Arc::clone(&context))),
            state: SubscriptionState::Pending,
            subscribed: Some(completion(listener, context)),
            unsubscribed: None,
        };
        self.tell(ClientMessage::Subscribe { key, subscription });
        Ok(())
    }

    /// Remove a subscription. Only a `ttl` of zero is supported, which
    /// discards the subscription's queued messages.
    ///
    /// The completion listener runs after every delivery for the
    /// subscription; nothing is delivered for it afterwards.
    pub fn unsubscribe<T, L>(
        &self,
        topic_pattern: &str,
        share: Option<&str>,
        ttl: Duration,
        listener: L,
        context: T,
    ) -> Result<()>
    where
        T: Send + Sync + 'static,
        L: CompletionListener<T>,
    {
        self.accepting()?;
        validate_topic(topic_pattern, "topic pattern")?;
        if let Some(share) = share {
            validate_share(share)?;
        }
        if !ttl.is_zero() {
            return Err(ClientError::Argument(
                "only a ttl of zero is supported when unsubscribing".into(),
            ));
        }

        let key = SubscriptionKey::new(topic_pattern, share);
        self.shared.registry.begin_unsubscribe(&key)?;
        self.tell(ClientMessage::Unsubscribe {
            key,
            completion: completion(listener, Arc::new(context)),
        });
        Ok(())
    }

    /// A handle whose component ignores every message.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        use crate::component::Component;

        struct Inert;

        impl Component for Inert {
            type Message = ClientMessage;

            fn on_receive(&mut self, _me: &ComponentRef<ClientMessage>, _message: ClientMessage, _sender: Sender) -> Result<()> {
                Ok(())
            }
        }

        let shared = Arc::new(Shared {
            id: "detached".into(),
            ordering: NEXT_ORDERING.fetch_add(1, Ordering::Relaxed),
            state: StateCell::new(ClientState::Stopped),
            service: Mutex::new(None),
            registry: SubscriptionRegistry::default(),
            sends: SendBuffer::new(1),
            correlation: AtomicU64::new(1),
            live_connection: Arc::new(AtomicU64::new(0)),
            callbacks: Arc::new(ThreadPoolCallbackService::new(1)),
        });
        let core = ComponentPool::shared().spawn(Inert);
        Self {
            shared,
            core: core.downgrade(),
            owner: Some(Arc::new(Owner { core })),
        }
    }
}
