//! The client component.
//!
//! Every input, whether an application call, a network event, a timer or an
//! endpoint lookup, arrives here as a [`ClientMessage`] and is handled one at
//! a time. Asynchronous results carry the connection attempt they belong
//! to, so results of an abandoned attempt are recognised and dropped.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use mqlight_core::{
    decode_frame, frame_to_bytes, CloseReason, Frame, InboundMessage, Open, QoS, RejectReason,
    SubscribeRequest, UnsubscribeRequest,
};

use super::{ClientServices, NonBlockingClient, Shared};
use crate::component::{Component, ComponentRef, Sender, WeakComponentRef};
use crate::delivery::{Confirmation, Delivery, DeliveryQos};
use crate::endpoint::{Endpoint, EndpointOutcome, EndpointService};
use crate::error::{ClientError, Result};
use crate::events::ClientState;
use crate::listener::{Completion, LifecycleEvent, LifecycleSink};
use crate::network::{NetworkChannel, NetworkListener, NetworkService};
use crate::promise::OncePromise;
use crate::session::{PendingSend, Session, Subscription, SubscriptionKey, SubscriptionState};
use crate::timer::{TimerHandle, TimerService};

pub(crate) enum ClientMessage {
    Start {
        completion: Option<Completion>,
    },
    Stop {
        drain: bool,
        completion: Option<Completion>,
    },
    Send(PendingSend),
    Subscribe {
        key: SubscriptionKey,
        subscription: Subscription,
    },
    Unsubscribe {
        key: SubscriptionKey,
        completion: Completion,
    },
    Confirm {
        delivery_id: u64,
        connection: u64,
    },
    EndpointResolved {
        attempt: u64,
        outcome: Result<EndpointOutcome>,
    },
    RetryTimer {
        attempt: u64,
    },
    Connected {
        attempt: u64,
        endpoint: Endpoint,
        outcome: Result<Arc<dyn NetworkChannel>>,
    },
    Read {
        connection: u64,
        data: Bytes,
    },
    ChannelError {
        connection: u64,
        error: ClientError,
    },
    ChannelClosed {
        connection: u64,
    },
    WriteComplete {
        connection: u64,
        send_id: u64,
        outcome: Result<bool>,
    },
    CloseComplete {
        connection: u64,
    },
}

impl ClientMessage {
    /// The listener waiting on an application request.
    pub(crate) fn into_completion(self) -> Option<Completion> {
        match self {
            ClientMessage::Start { completion } | ClientMessage::Stop { completion, .. } => completion,
            ClientMessage::Send(send) => Some(send.completion),
            ClientMessage::Subscribe { subscription, .. } => subscription.subscribed,
            ClientMessage::Unsubscribe { completion, .. } => Some(completion),
            _ => None,
        }
    }
}

/// Forwards channel events to the client, tagged with the connection.
struct ConnectionListener {
    client: ComponentRef<ClientMessage>,
    connection: u64,
}

impl NetworkListener for ConnectionListener {
    fn on_read(&self, _channel: &Arc<dyn NetworkChannel>, data: Bytes) {
        self.client.tell(
            ClientMessage::Read {
                connection: self.connection,
                data,
            },
            Sender::NOBODY,
        );
    }

    fn on_error(&self, _channel: &Arc<dyn NetworkChannel>, error: ClientError) {
        self.client.tell(
            ClientMessage::ChannelError {
                connection: self.connection,
                error,
            },
            Sender::NOBODY,
        );
    }

    fn on_close(&self, _channel: &Arc<dyn NetworkChannel>) {
        self.client.tell(
            ClientMessage::ChannelClosed {
                connection: self.connection,
            },
            Sender::NOBODY,
        );
    }
}

struct Connection {
    /// The attempt that opened it.
    id: u64,
    endpoint: Endpoint,
    channel: Arc<dyn NetworkChannel>,
    inbound: BytesMut,
    /// The server accepted the session.
    opened: bool,
    closing: bool,
}

pub(crate) struct ClientCore {
    me: WeakComponentRef<ClientMessage>,
    shared: Arc<Shared>,
    lifecycle: Arc<dyn LifecycleSink>,
    endpoints: Arc<dyn EndpointService>,
    network: Arc<dyn NetworkService>,
    timer: Arc<dyn TimerService>,

    attempt: u64,
    retry_timer: Option<TimerHandle>,
    connection: Option<Connection>,
    session: Session,
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    /// Subscribe and unsubscribe requests awaiting an answer.
    in_flight: HashMap<u64, SubscriptionKey>,
    /// Reached `Started` since the last stop.
    has_started: bool,
    draining: bool,
    start_completions: Vec<Completion>,
    /// Starts requested while stopping.
    restart: Option<Vec<Completion>>,
    stop_completions: Vec<Completion>,
}

impl ClientCore {
    pub fn new(
        me: WeakComponentRef<ClientMessage>,
        shared: Arc<Shared>,
        services: &ClientServices,
        lifecycle: Arc<dyn LifecycleSink>,
    ) -> Self {
        Self {
            me,
            shared,
            lifecycle,
            endpoints: Arc::clone(&services.endpoint),
            network: Arc::clone(&services.network),
            timer: Arc::clone(&services.timer),
            attempt: 0,
            retry_timer: None,
            connection: None,
            session: Session::new(),
            subscriptions: HashMap::new(),
            in_flight: HashMap::new(),
            has_started: false,
            draining: false,
            start_completions: Vec::new(),
            restart: None,
            stop_completions: Vec::new(),
        }
    }

    fn state(&self) -> ClientState {
        self.shared.state.get()
    }

    fn set_state(&self, state: ClientState) {
        log::debug!("Client {} is {}", self.shared.id, state);
        self.shared.state.set(state);
    }

    fn next_id(&self) -> u64 {
        self.shared.correlation.fetch_add(1, Ordering::Relaxed)
    }

    fn is_current(&self, connection: u64) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id == connection)
    }

    fn is_open(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.opened && !c.closing)
    }

    /// Run `task` on the callback service, in order with the client's other
    /// callbacks. Runs whether or not the application still holds a handle.
    fn dispatch(&self, task: impl FnOnce(&NonBlockingClient) + Send + 'static) {
        let client = NonBlockingClient::listener_view(Arc::clone(&self.shared), self.me.clone());
        self.shared
            .callbacks
            .run(Box::new(move || task(&client)), self.shared.ordering);
    }

    fn complete(&self, completion: Completion, outcome: Result<()>) {
        self.dispatch(move |client| completion(client, outcome));
    }

    fn notify(&self, event: LifecycleEvent) {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.dispatch(move |client| lifecycle.notify(client, event));
    }

    fn write_frame(&self, frame: &Frame) -> Result<()> {
        let Some(connection) = &self.connection else {
            return Ok(());
        };
        let data = frame_to_bytes(frame)?;
        // Failures surface as a channel error.
        connection
            .channel
            .write(data, OncePromise::new(|_: Result<bool>| {}).boxed());
        Ok(())
    }

    fn start(&mut self, me: &ComponentRef<ClientMessage>, completion: Option<Completion>) {
        match self.state() {
            ClientState::Started => {
                if let Some(completion) = completion {
                    self.complete(completion, Ok(()));
                }
            }
            ClientState::Starting | ClientState::Retrying => {
                self.start_completions.extend(completion);
                if self.attempt == 0 {
                    self.begin_connect(me);
                }
            }
            ClientState::Stopping => {
                self.restart.get_or_insert_with(Vec::new).extend(completion);
            }
            ClientState::Stopped => {
                self.start_completions.extend(completion);
                self.set_state(ClientState::Starting);
                self.begin_connect(me);
            }
        }
    }

    fn begin_connect(&mut self, me: &ComponentRef<ClientMessage>) {
        self.attempt += 1;
        let attempt = self.attempt;
        self.endpoints.lookup(
            OncePromise::telling(me.clone(), move |outcome| ClientMessage::EndpointResolved {
                attempt,
                outcome,
            })
            .boxed(),
        );
    }

    fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry_timer.take() {
            self.timer.cancel(handle);
        }
    }

    fn endpoint_resolved(
        &mut self,
        me: &ComponentRef<ClientMessage>,
        attempt: u64,
        outcome: Result<EndpointOutcome>,
    ) {
        if attempt != self.attempt {
            return;
        }
        match outcome {
            Ok(EndpointOutcome::Endpoint(endpoint)) => {
                log::debug!("Client {} connecting to {}", self.shared.id, endpoint);
                let listener = Arc::new(ConnectionListener {
                    client: me.clone(),
                    connection: attempt,
                });
                let target = endpoint.clone();
                let promise = OncePromise::telling(me.clone(), move |outcome| ClientMessage::Connected {
                    attempt,
                    endpoint: target,
                    outcome,
                });
                self.network.connect(&endpoint, listener, promise.boxed());
            }
            Ok(EndpointOutcome::RetryAfter(delay)) => {
                log::debug!("Client {} retrying in {:?}", self.shared.id, delay);
                let promise = OncePromise::telling(me.clone(), move |_| ClientMessage::RetryTimer { attempt });
                self.retry_timer = Some(self.timer.schedule(delay, promise.boxed()));
            }
            Err(e) => {
                log::error!("Client {} endpoint lookup failed: {}", self.shared.id, e);
                self.fail_and_stop(me, e);
            }
        }
    }

    fn connected(
        &mut self,
        me: &ComponentRef<ClientMessage>,
        attempt: u64,
        endpoint: Endpoint,
        outcome: Result<Arc<dyn NetworkChannel>>,
    ) -> Result<()> {
        match outcome {
            Ok(channel) if attempt != self.attempt => {
                channel.close(None);
                Ok(())
            }
            Ok(channel) => {
                let open = Frame::Open(Open {
                    client_id: self.shared.id.clone(),
                    username: endpoint.user().map(str::to_string),
                    password: endpoint.password().map(str::to_string),
                });
                self.connection = Some(Connection {
                    id: attempt,
                    endpoint,
                    channel,
                    inbound: BytesMut::new(),
                    opened: false,
                    closing: false,
                });
                self.write_frame(&open)
            }
            Err(_) if attempt != self.attempt => Ok(()),
            Err(e) => {
                log::warn!("Client {} failed to connect to {}: {}", self.shared.id, endpoint, e);
                self.endpoints.on_failure(&endpoint, &e);
                if e.is_retryable() {
                    self.enter_retrying(e);
                    self.begin_connect(me);
                } else {
                    self.fail_and_stop(me, e);
                }
                Ok(())
            }
        }
    }

    fn read(&mut self, me: &ComponentRef<ClientMessage>, connection: u64, data: Bytes) -> Result<()> {
        match self.connection.as_mut() {
            Some(c) if c.id == connection => c.inbound.extend_from_slice(&data),
            _ => return Ok(()),
        }

        loop {
            let decoded = match self.connection.as_mut() {
                Some(c) if c.id == connection => match decode_frame(&c.inbound) {
                    Ok(Some((frame, used))) => {
                        let _ = c.inbound.split_to(used);
                        Ok(frame)
                    }
                    Ok(None) => return Ok(()),
                    Err(e) => Err(e),
                },
                _ => return Ok(()),
            };
            match decoded {
                Ok(frame) => self.handle_frame(me, frame)?,
                Err(e) => {
                    log::warn!("Client {} received a malformed frame: {}", self.shared.id, e);
                    self.connection_lost(me, e.into());
                    return Ok(());
                }
            }
        }
    }

    fn handle_frame(&mut self, me: &ComponentRef<ClientMessage>, frame: Frame) -> Result<()> {
        match frame {
            Frame::Opened => self.opened(me)?,
            Frame::OpenRejected { reason, message } => {
                let error = match reason {
                    RejectReason::Unauthorized => ClientError::Security(message),
                    RejectReason::InvalidClientId => ClientError::Argument(message),
                    RejectReason::Other => ClientError::Network(message),
                };
                if let Some(connection) = &self.connection {
                    self.endpoints.on_failure(&connection.endpoint, &error);
                }
                if error.is_retryable() {
                    self.connection_lost(me, error);
                } else {
                    self.fail_and_stop(me, error);
                }
            }
            Frame::SendAck { id } => self.send_answered(me, id, Ok(())),
            Frame::SubscribeAck { id } => self.subscribe_acked(me, id)?,
            Frame::UnsubscribeAck { id } => self.unsubscribe_acked(id),
            Frame::Rejected { id, message } => self.rejected(me, id, message)?,
            Frame::Deliver(message) => self.deliver(me, message),
            Frame::Close(CloseReason::Replaced) => {
                let error = ClientError::Replaced(format!(
                    "another client connected with id {}",
                    self.shared.id
                ));
                self.fail_and_stop(me, error);
            }
            Frame::Close(CloseReason::Normal) => {
                self.connection_lost(me, ClientError::Network("server closed the session".into()))
            }
            Frame::Close(CloseReason::Error(message)) => self.connection_lost(me, ClientError::Network(message)),
            other => log::warn!(
                "Client {} ignoring unexpected {:?} frame",
                self.shared.id,
                other.tag()
            ),
        }
        Ok(())
    }

    fn opened(&mut self, me: &ComponentRef<ClientMessage>) -> Result<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };
        if connection.opened {
            return Ok(());
        }
        connection.opened = true;
        let (id, endpoint) = (connection.id, connection.endpoint.clone());

        self.endpoints.on_success(&endpoint);
        self.shared.live_connection.store(id, Ordering::Release);
        *self.shared.service.lock() = Some(endpoint.to_string());
        log::info!("Client {} connected to {}", self.shared.id, endpoint);

        match self.state() {
            ClientState::Starting => {
                self.request_subscriptions()?;
                self.now_started(me)
            }
            ClientState::Retrying => {
                if self.request_subscriptions()? == 0 {
                    self.now_started(me)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Report `Started`, or `Restarted` after a reconnect, and release queued work.
    fn now_started(&mut self, me: &ComponentRef<ClientMessage>) -> Result<()> {
        self.set_state(ClientState::Started);
        if self.has_started {
            self.notify(LifecycleEvent::Restarted);
        } else {
            self.has_started = true;
            self.notify(LifecycleEvent::Started);
        }
        for completion in std::mem::take(&mut self.start_completions) {
            self.complete(completion, Ok(()));
        }
        self.flush_sends(me);
        Ok(())
    }

    /// Request every pending subscription on the open connection. Returns
    /// the number requested.
    fn request_subscriptions(&mut self) -> Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        let pending: Vec<SubscriptionKey> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.state == SubscriptionState::Pending)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &pending {
            let id = self.next_id();
            let Some(subscription) = self.subscriptions.get_mut(key) else {
                continue;
            };
            subscription.state = SubscriptionState::Subscribing(id);
            let frame = Frame::Subscribe(SubscribeRequest {
                id,
                topic_pattern: key.topic_pattern.clone(),
                share: key.share.clone(),
                qos: subscription.options.qos,
                auto_confirm: subscription.options.auto_confirm,
                ttl_ms: subscription.ttl_ms,
                credit: subscription.options.credit,
            });
            self.in_flight.insert(id, key.clone());
            self.write_frame(&frame)?;
        }
        Ok(pending.len())
    }

    fn resubscribed(&self) -> bool {
        !self
            .subscriptions
            .values()
            .any(|s| matches!(s.state, SubscriptionState::Subscribing(_)))
    }

    fn send(&mut self, me: &ComponentRef<ClientMessage>, send: PendingSend) {
        if self.state().is_stopping_or_stopped() {
            let error = ClientError::State(format!("client {} is {}", self.shared.id, self.state()));
            self.finish_send(send.completion, Err(error));
            return;
        }
        self.session.queue(send);
        if self.state() == ClientState::Started {
            self.flush_sends(me);
        }
    }

    fn flush_sends(&mut self, me: &ComponentRef<ClientMessage>) {
        if !self.is_open() {
            return;
        }
        let Some(connection) = &self.connection else {
            return;
        };
        let (id, channel) = (connection.id, Arc::clone(&connection.channel));

        for send in self.session.take_queued() {
            let send_id = send.id;
            let promise = OncePromise::telling(me.clone(), move |outcome| ClientMessage::WriteComplete {
                connection: id,
                send_id,
                outcome,
            });
            channel.write(send.data, promise.boxed());
            self.session.written(send.id, send.qos, send.completion);
        }
    }

    fn finish_send(&self, completion: Completion, outcome: Result<()>) {
        self.complete(completion, outcome);
        if self.shared.sends.release() {
            self.notify(LifecycleEvent::Drain);
        }
    }

    fn write_complete(
        &mut self,
        me: &ComponentRef<ClientMessage>,
        connection: u64,
        send_id: u64,
        outcome: Result<bool>,
    ) {
        if !self.is_current(connection) {
            return;
        }
        if let Some(completion) = self.session.flushed(send_id) {
            self.finish_send(completion, outcome.map(|_| ()));
            self.drained(me);
        }
    }

    fn send_answered(&mut self, me: &ComponentRef<ClientMessage>, id: u64, outcome: Result<()>) {
        match self.session.acknowledged(id, outcome) {
            Some(released) => {
                for (completion, outcome) in released {
                    self.finish_send(completion, outcome);
                }
                self.drained(me);
            }
            None => log::debug!("Client {} got an answer for unknown send {}", self.shared.id, id),
        }
    }

    /// Close the connection if a draining stop has nothing left to wait for.
    fn drained(&mut self, me: &ComponentRef<ClientMessage>) {
        if self.draining && self.session.is_idle() {
            self.draining = false;
            self.close_connection(me);
        }
    }

    fn subscribe(&mut self, key: SubscriptionKey, mut subscription: Subscription) -> Result<()> {
        if self.state().is_stopping_or_stopped() {
            self.shared.registry.remove(&key);
            if let Some(completion) = subscription.subscribed.take() {
                let error = ClientError::State(format!("client {} is {}", self.shared.id, self.state()));
                self.complete(completion, Err(error));
            }
            return Ok(());
        }
        self.subscriptions.insert(key, subscription);
        self.request_subscriptions()?;
        Ok(())
    }

    fn subscribe_acked(&mut self, me: &ComponentRef<ClientMessage>, id: u64) -> Result<()> {
        let Some(key) = self.in_flight.remove(&id) else {
            log::debug!("Client {} got an answer for unknown subscribe {}", self.shared.id, id);
            return Ok(());
        };
        if let Some(subscription) = self.subscriptions.get_mut(&key) {
            if subscription.state == SubscriptionState::Subscribing(id) {
                subscription.state = SubscriptionState::Active;
            }
            if let Some(completion) = subscription.subscribed.take() {
                self.complete(completion, Ok(()));
            }
        }
        self.resume_if_resubscribed(me)
    }

    fn resume_if_resubscribed(&mut self, me: &ComponentRef<ClientMessage>) -> Result<()> {
        if self.state() == ClientState::Retrying && self.is_open() && self.resubscribed() {
            self.now_started(me)?;
        }
        Ok(())
    }

    fn unsubscribe(&mut self, key: SubscriptionKey, completion: Completion) -> Result<()> {
        let open = self.is_open();
        let Some(subscription) = self.subscriptions.get_mut(&key) else {
            self.shared.registry.remove(&key);
            self.complete(completion, Err(ClientError::State(format!("not subscribed to {}", key))));
            return Ok(());
        };
        match subscription.state {
            SubscriptionState::Unsubscribing(_) => {
                let error = ClientError::State(format!("unsubscribe from {} is already in progress", key));
                self.complete(completion, Err(error));
            }
            SubscriptionState::Subscribing(_) | SubscriptionState::Active if open => {
                let id = self.shared.correlation.fetch_add(1, Ordering::Relaxed);
                subscription.state = SubscriptionState::Unsubscribing(id);
                subscription.unsubscribed = Some(completion);
                let frame = Frame::Unsubscribe(UnsubscribeRequest {
                    id,
                    topic_pattern: key.topic_pattern.clone(),
                    share: key.share.clone(),
                    ttl_ms: Some(0),
                });
                self.in_flight.insert(id, key);
                self.write_frame(&frame)?;
            }
            _ => {
                // Nothing exists on the server yet.
                subscription.unsubscribed = Some(completion);
                if let Some(subscription) = self.subscriptions.remove(&key) {
                    self.finish_unsubscribe(key, subscription);
                }
            }
        }
        Ok(())
    }

    fn unsubscribe_acked(&mut self, id: u64) {
        let Some(key) = self.in_flight.remove(&id) else {
            log::debug!("Client {} got an answer for unknown unsubscribe {}", self.shared.id, id);
            return;
        };
        let matches = self
            .subscriptions
            .get(&key)
            .is_some_and(|s| s.state == SubscriptionState::Unsubscribing(id));
        if matches {
            if let Some(subscription) = self.subscriptions.remove(&key) {
                self.finish_unsubscribe(key, subscription);
            }
        }
    }

    /// Report a removed subscription. Runs after every delivery already
    /// dispatched for it.
    fn finish_unsubscribe(&self, key: SubscriptionKey, mut subscription: Subscription) {
        self.shared.registry.remove(&key);
        if let Some(completion) = subscription.subscribed.take() {
            let error = ClientError::State(format!(
                "unsubscribed from {} before the subscription completed",
                key
            ));
            self.complete(completion, Err(error));
        }
        let destination = Arc::clone(&subscription.destination);
        let completion = subscription.unsubscribed.take();
        self.dispatch(move |client| {
            destination.unsubscribed(client, &key.topic_pattern, key.share.as_deref());
            if let Some(completion) = completion {
                completion(client, Ok(()));
            }
        });
    }

    fn rejected(&mut self, me: &ComponentRef<ClientMessage>, id: u64, message: String) -> Result<()> {
        let error = ClientError::Network(format!("rejected by server: {}", message));

        let Some(key) = self.in_flight.remove(&id) else {
            self.send_answered(me, id, Err(error));
            return Ok(());
        };
        let Some(subscription) = self.subscriptions.get_mut(&key) else {
            return Ok(());
        };
        match subscription.state {
            SubscriptionState::Subscribing(s) if s == id => {
                if let Some(mut subscription) = self.subscriptions.remove(&key) {
                    self.shared.registry.remove(&key);
                    match subscription.subscribed.take() {
                        Some(completion) => self.complete(completion, Err(error)),
                        None => log::warn!("Client {} lost subscription {}: {}", self.shared.id, key, error),
                    }
                }
            }
            SubscriptionState::Unsubscribing(u) if u == id => {
                subscription.state = SubscriptionState::Active;
                self.shared.registry.restore(&key);
                if let Some(completion) = subscription.unsubscribed.take() {
                    self.complete(completion, Err(error));
                }
            }
            _ => {}
        }
        self.resume_if_resubscribed(me)
    }

    fn deliver(&mut self, me: &ComponentRef<ClientMessage>, message: InboundMessage) {
        let key = SubscriptionKey {
            topic_pattern: message.topic_pattern.clone(),
            share: message.share.clone(),
        };
        let (Some(subscription), Some(connection)) = (self.subscriptions.get(&key), self.connection.as_ref()) else {
            log::debug!("Client {} dropping delivery for {}", self.shared.id, key);
            return;
        };

        let connection = connection.id;
        let delivery_id = message.delivery_id;
        let auto_confirm = subscription.options.auto_confirm;
        let qos = match message.qos {
            QoS::AtMostOnce => DeliveryQos::AtMostOnce,
            QoS::AtLeastOnce if auto_confirm => DeliveryQos::AtLeastOnce(None),
            QoS::AtLeastOnce => DeliveryQos::AtLeastOnce(Some(Confirmation::new(
                delivery_id,
                connection,
                Arc::clone(&self.shared.live_connection),
                me.clone(),
            ))),
        };
        let confirm_after = (message.qos == QoS::AtLeastOnce && auto_confirm).then(|| me.clone());
        let delivery = Delivery::new(message, qos);
        let destination = Arc::clone(&subscription.destination);

        self.dispatch(move |client| {
            destination.deliver(client, delivery);
            if let Some(core) = confirm_after {
                core.tell(
                    ClientMessage::Confirm {
                        delivery_id,
                        connection,
                    },
                    Sender::NOBODY,
                );
            }
        });
    }

    fn confirm(&self, delivery_id: u64, connection: u64) -> Result<()> {
        if self.is_current(connection) && self.is_open() {
            self.write_frame(&Frame::Confirm { delivery_id })
        } else {
            log::debug!(
                "Client {} dropping confirmation of {} for a closed connection",
                self.shared.id,
                delivery_id
            );
            Ok(())
        }
    }

    fn enter_retrying(&mut self, error: ClientError) {
        if matches!(self.state(), ClientState::Starting | ClientState::Started) {
            self.set_state(ClientState::Retrying);
            self.notify(LifecycleEvent::Retrying(error));
        }
    }

    fn connection_lost(&mut self, me: &ComponentRef<ClientMessage>, error: ClientError) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        connection.channel.close(None);
        self.shared.live_connection.store(0, Ordering::Release);
        *self.shared.service.lock() = None;

        if self.state() == ClientState::Stopping {
            self.finish_stop(me, None);
            return;
        }

        log::warn!(
            "Client {} lost connection to {}: {}",
            self.shared.id,
            connection.endpoint,
            error
        );
        self.endpoints.on_failure(&connection.endpoint, &error);
        for completion in self.session.abandon_written() {
            self.finish_send(completion, Err(error.clone()));
        }

        self.in_flight.clear();
        let mut unsubscribed = Vec::new();
        for (key, subscription) in self.subscriptions.iter_mut() {
            match subscription.state {
                SubscriptionState::Unsubscribing(_) => unsubscribed.push(key.clone()),
                _ => subscription.state = SubscriptionState::Pending,
            }
        }
        for key in unsubscribed {
            if let Some(subscription) = self.subscriptions.remove(&key) {
                self.finish_unsubscribe(key, subscription);
            }
        }

        self.enter_retrying(error);
        self.begin_connect(me);
    }

    fn stop(&mut self, me: &ComponentRef<ClientMessage>, drain: bool, completion: Option<Completion>) {
        match self.state() {
            ClientState::Stopped => {
                if let Some(completion) = completion {
                    self.complete(completion, Ok(()));
                }
                return;
            }
            ClientState::Stopping => {
                self.stop_completions.extend(completion);
                if let Some(restart) = self.restart.take() {
                    for completion in restart {
                        let error = ClientError::State("client stopped before it started".into());
                        self.complete(completion, Err(error));
                    }
                }
                // Latest request wins.
                if self.draining && !drain {
                    self.draining = false;
                    self.discard_sends();
                    self.close_connection(me);
                }
                return;
            }
            _ => {}
        }

        self.stop_completions.extend(completion);
        self.set_state(ClientState::Stopping);
        self.attempt += 1;
        self.cancel_retry();
        for completion in std::mem::take(&mut self.start_completions) {
            let error = ClientError::State("client stopped before it started".into());
            self.complete(completion, Err(error));
        }

        self.draining = drain && self.is_open() && !self.session.is_idle();
        if self.draining {
            self.flush_sends(me);
        } else {
            self.discard_sends();
            self.close_connection(me);
        }
    }

    fn discard_sends(&mut self) {
        for completion in self.session.abandon_all() {
            self.finish_send(completion, Err(ClientError::State("client stopped".into())));
        }
    }

    fn close_connection(&mut self, me: &ComponentRef<ClientMessage>) {
        let (id, opened) = match self.connection.as_mut() {
            Some(connection) if connection.closing => return,
            Some(connection) => {
                connection.closing = true;
                (connection.id, connection.opened)
            }
            None => {
                self.finish_stop(me, None);
                return;
            }
        };
        if opened {
            if let Err(e) = self.write_frame(&Frame::Close(CloseReason::Normal)) {
                log::warn!("Client {} failed to encode close: {}", self.shared.id, e);
            }
        }
        if let Some(connection) = &self.connection {
            let promise = OncePromise::telling(me.clone(), move |_| ClientMessage::CloseComplete { connection: id });
            connection.channel.close(Some(promise.boxed()));
        }
    }

    /// Stop because of an error retrying cannot fix.
    fn fail_and_stop(&mut self, me: &ComponentRef<ClientMessage>, error: ClientError) {
        log::error!("Client {} stopping: {}", self.shared.id, error);
        for completion in std::mem::take(&mut self.start_completions) {
            self.complete(completion, Err(error.clone()));
        }
        self.finish_stop(me, Some(error));
    }

    fn finish_stop(&mut self, me: &ComponentRef<ClientMessage>, error: Option<ClientError>) {
        if self.state() == ClientState::Stopped {
            return;
        }
        self.attempt += 1;
        self.cancel_retry();
        if let Some(connection) = self.connection.take() {
            connection.channel.close(None);
        }
        self.shared.live_connection.store(0, Ordering::Release);
        *self.shared.service.lock() = None;

        self.draining = false;
        self.discard_sends();
        self.in_flight.clear();
        let subscriptions: Vec<_> = self.subscriptions.drain().collect();
        for (_, mut subscription) in subscriptions {
            if let Some(completion) = subscription.subscribed.take() {
                self.complete(completion, Err(ClientError::State("client stopped".into())));
            }
            if let Some(completion) = subscription.unsubscribed.take() {
                self.complete(completion, Ok(()));
            }
        }
        self.shared.registry.clear();

        self.has_started = false;
        self.set_state(ClientState::Stopped);
        log::info!("Client {} stopped", self.shared.id);
        self.notify(LifecycleEvent::Stopped(error));
        for completion in std::mem::take(&mut self.stop_completions) {
            self.complete(completion, Ok(()));
        }

        if let Some(restart) = self.restart.take() {
            self.start_completions = restart;
            self.set_state(ClientState::Starting);
            self.begin_connect(me);
        }
    }
}

impl Component for ClientCore {
    type Message = ClientMessage;

    fn on_receive(&mut self, me: &ComponentRef<ClientMessage>, message: ClientMessage, _sender: Sender) -> Result<()> {
        match message {
            ClientMessage::Start { completion } => self.start(me, completion),
            ClientMessage::Stop { drain, completion } => self.stop(me, drain, completion),
            ClientMessage::Send(send) => self.send(me, send),
            ClientMessage::Subscribe { key, subscription } => self.subscribe(key, subscription)?,
            ClientMessage::Unsubscribe { key, completion } => self.unsubscribe(key, completion)?,
            ClientMessage::Confirm {
                delivery_id,
                connection,
            } => self.confirm(delivery_id, connection)?,
            ClientMessage::EndpointResolved { attempt, outcome } => self.endpoint_resolved(me, attempt, outcome),
            ClientMessage::RetryTimer { attempt } => {
                if attempt == self.attempt {
                    self.retry_timer = None;
                    self.begin_connect(me);
                }
            }
            ClientMessage::Connected {
                attempt,
                endpoint,
                outcome,
            } => self.connected(me, attempt, endpoint, outcome)?,
            ClientMessage::Read { connection, data } => self.read(me, connection, data)?,
            ClientMessage::ChannelError { connection, error } => {
                if self.is_current(connection) {
                    self.connection_lost(me, error);
                }
            }
            ClientMessage::ChannelClosed { connection } => {
                if self.is_current(connection) {
                    self.connection_lost(me, ClientError::Network("connection closed".into()));
                }
            }
            ClientMessage::WriteComplete {
                connection,
                send_id,
                outcome,
            } => self.write_complete(me, connection, send_id, outcome),
            ClientMessage::CloseComplete { connection } => {
                if self.is_current(connection) && self.state() == ClientState::Stopping {
                    self.finish_stop(me, None);
                }
            }
        }
        Ok(())
    }
}
