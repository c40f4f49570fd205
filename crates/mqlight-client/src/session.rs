//! Outstanding operations of one client.
//!
//! Owned by the client component, apart from [`SendBuffer`] and
//! [`SubscriptionRegistry`] which application threads consult to answer
//! `send` and `subscribe` synchronously.
//!
//! At-least-once sends complete in the order they were issued even when the
//! server acknowledges them out of order: an acknowledgement only marks its
//! entry, and entries are released from the front of the queue.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use mqlight_core::QoS;
use parking_lot::Mutex;

use crate::config::SubscribeOptions;
use crate::error::{ClientError, Result};
use crate::listener::{Completion, DestinationSink};

/// An encoded send waiting for a connection.
pub(crate) struct PendingSend {
    pub id: u64,
    pub qos: QoS,
    pub data: Bytes,
    pub completion: Completion,
}

struct AwaitingAck {
    id: u64,
    outcome: Option<Result<()>>,
    completion: Completion,
}

#[derive(Default)]
pub(crate) struct Session {
    /// Not yet written, in call order.
    queued: VecDeque<PendingSend>,
    /// At-most-once sends written to the channel but not yet flushed.
    awaiting_flush: HashMap<u64, Completion>,
    /// At-least-once sends in issue order.
    awaiting_ack: VecDeque<AwaitingAck>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, send: PendingSend) {
        self.queued.push_back(send);
    }

    /// Take every queued send, oldest first.
    pub fn take_queued(&mut self) -> Vec<PendingSend> {
        self.queued.drain(..).collect()
    }

    /// Track a send that has been handed to the channel.
    pub fn written(&mut self, id: u64, qos: QoS, completion: Completion) {
        match qos {
            QoS::AtMostOnce => {
                self.awaiting_flush.insert(id, completion);
            }
            QoS::AtLeastOnce => self.awaiting_ack.push_back(AwaitingAck {
                id,
                outcome: None,
                completion,
            }),
        }
    }

    /// An at-most-once send reached the socket.
    pub fn flushed(&mut self, id: u64) -> Option<Completion> {
        self.awaiting_flush.remove(&id)
    }

    /// Record the server's answer to at-least-once send `id`.
    ///
    /// Returns the completions now releasable in issue order, or `None` if
    /// `id` is not an awaited send.
    pub fn acknowledged(&mut self, id: u64, outcome: Result<()>) -> Option<Vec<(Completion, Result<()>)>> {
        let entry = self.awaiting_ack.iter_mut().find(|a| a.id == id)?;
        entry.outcome = Some(outcome);

        let mut released = Vec::new();
        while self
            .awaiting_ack
            .front()
            .is_some_and(|a| a.outcome.is_some())
        {
            if let Some(AwaitingAck {
                outcome: Some(outcome),
                completion,
                ..
            }) = self.awaiting_ack.pop_front()
            {
                released.push((completion, outcome));
            }
        }
        Some(released)
    }

    /// Remove every send already handed to a channel, in issue order.
    pub fn abandon_written(&mut self) -> Vec<Completion> {
        let mut written: Vec<(u64, Completion)> = self.awaiting_flush.drain().collect();
        written.extend(self.awaiting_ack.drain(..).map(|a| (a.id, a.completion)));
        written.sort_by_key(|(id, _)| *id);
        written.into_iter().map(|(_, completion)| completion).collect()
    }

    /// Remove every outstanding send, in issue order.
    pub fn abandon_all(&mut self) -> Vec<Completion> {
        let mut all = self.abandon_written();
        all.extend(self.queued.drain(..).map(|s| s.completion));
        all
    }

    pub fn outstanding(&self) -> usize {
        self.queued.len() + self.awaiting_flush.len() + self.awaiting_ack.len()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }
}

/// Identifies a destination: a topic pattern, optionally shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SubscriptionKey {
    pub topic_pattern: String,
    pub share: Option<String>,
}

impl SubscriptionKey {
    pub fn new(topic_pattern: &str, share: Option<&str>) -> Self {
        Self {
            topic_pattern: topic_pattern.to_string(),
            share: share.map(str::to_string),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.share {
            Some(share) => write!(f, "share:{}:{}", share, self.topic_pattern),
            None => write!(f, "private:{}", self.topic_pattern),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionState {
    /// Not yet requested on the current connection.
    Pending,
    Subscribing(u64),
    Active,
    Unsubscribing(u64),
}

pub(crate) struct Subscription {
    pub options: SubscribeOptions,
    pub ttl_ms: u64,
    pub destination: Arc<dyn DestinationSink>,
    pub state: SubscriptionState,
    /// Completion of the subscribe call, until first acknowledged.
    pub subscribed: Option<Completion>,
    pub unsubscribed: Option<Completion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Active,
    Unsubscribing,
}

/// Destinations the application is subscribed to, checked synchronously by
/// `subscribe` and `unsubscribe`.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<SubscriptionKey, Registration>>,
}

impl SubscriptionRegistry {
    pub fn register(&self, key: &SubscriptionKey) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(Registration::Active) => Err(ClientError::State(format!(
                "already subscribed to {}",
                key
            ))),
            Some(Registration::Unsubscribing) => Err(ClientError::State(format!(
                "unsubscribe from {} is still in progress",
                key
            ))),
            None => {
                entries.insert(key.clone(), Registration::Active);
                Ok(())
            }
        }
    }

    pub fn begin_unsubscribe(&self, key: &SubscriptionKey) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if *entry == Registration::Active => {
                *entry = Registration::Unsubscribing;
                Ok(())
            }
            Some(_) => Err(ClientError::State(format!(
                "unsubscribe from {} is already in progress",
                key
            ))),
            None => Err(ClientError::State(format!("not subscribed to {}", key))),
        }
    }

    /// Undo `begin_unsubscribe` after the server refused it.
    pub fn restore(&self, key: &SubscriptionKey) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            *entry = Registration::Active;
        }
    }

    pub fn remove(&self, key: &SubscriptionKey) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.lock().contains_key(key)
    }
}

/// Count of sends accepted but not yet completed.
#[derive(Debug)]
pub(crate) struct SendBuffer {
    buffered: AtomicUsize,
    capacity: usize,
    reported_full: AtomicBool,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffered: AtomicUsize::new(0),
            capacity: capacity.max(1),
            reported_full: AtomicBool::new(false),
        }
    }

    /// Account for a new send. Returns `true` if the buffer is now full.
    pub fn reserve(&self) -> bool {
        let buffered = self.buffered.fetch_add(1, Ordering::AcqRel) + 1;
        if buffered >= self.capacity {
            self.reported_full.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Account for a completed send. Returns `true` if the buffer just
    /// emptied after having been reported full.
    pub fn release(&self) -> bool {
        let previous = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous <= 1 && self.reported_full.swap(false, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::NonBlockingClient;

    type Log = Arc<Mutex<Vec<u64>>>;

    fn recording(log: &Log, id: u64) -> Completion {
        let log = Arc::clone(log);
        Box::new(move |_: &NonBlockingClient, _| log.lock().push(id))
    }

    fn send(log: &Log, id: u64, qos: QoS) -> PendingSend {
        PendingSend {
            id,
            qos,
            data: Bytes::from_static(b"frame"),
            completion: recording(log, id),
        }
    }

    fn outcomes(released: Vec<(Completion, Result<()>)>) -> Vec<bool> {
        released.iter().map(|(_, outcome)| outcome.is_ok()).collect()
    }

    #[test]
    fn test_acks_release_in_issue_order() {
        let log = Log::default();
        let mut session = Session::new();
        for id in 1..=3 {
            session.written(id, QoS::AtLeastOnce, recording(&log, id));
        }

        assert_eq!(session.acknowledged(3, Ok(())).map(outcomes), Some(vec![]));
        assert_eq!(session.acknowledged(2, Ok(())).map(outcomes), Some(vec![]));
        let released = session.acknowledged(1, Ok(())).unwrap();
        assert_eq!(released.len(), 3);
        assert!(session.is_idle());
        assert!(session.acknowledged(1, Ok(())).is_none());
    }

    #[test]
    fn test_rejection_keeps_its_place() {
        let log = Log::default();
        let mut session = Session::new();
        session.written(1, QoS::AtLeastOnce, recording(&log, 1));
        session.written(2, QoS::AtLeastOnce, recording(&log, 2));

        assert_eq!(
            session.acknowledged(2, Err(ClientError::Network("rejected".into()))).map(outcomes),
            Some(vec![])
        );
        assert_eq!(session.acknowledged(1, Ok(())).map(outcomes), Some(vec![true, false]));
    }

    #[test]
    fn test_abandon_all_in_issue_order() {
        let log = Log::default();
        let mut session = Session::new();
        session.written(2, QoS::AtLeastOnce, recording(&log, 2));
        session.written(1, QoS::AtMostOnce, recording(&log, 1));
        session.written(3, QoS::AtMostOnce, recording(&log, 3));
        session.queue(send(&log, 4, QoS::AtMostOnce));
        assert_eq!(session.outstanding(), 4);

        assert!(session.flushed(3).is_some());
        let client = NonBlockingClient::detached();
        for completion in session.abandon_all() {
            completion(&client, Err(ClientError::State("stopped".into())));
        }
        assert_eq!(*log.lock(), vec![1, 2, 4]);
        assert!(session.is_idle());
    }

    #[test]
    fn test_registry_tracks_unsubscribe() {
        let registry = SubscriptionRegistry::default();
        let key = SubscriptionKey::new("news/#", Some("team"));

        registry.register(&key).unwrap();
        assert!(matches!(registry.register(&key), Err(ClientError::State(_))));
        registry.begin_unsubscribe(&key).unwrap();
        assert!(matches!(registry.begin_unsubscribe(&key), Err(ClientError::State(_))));
        assert!(matches!(registry.register(&key), Err(ClientError::State(_))));

        registry.restore(&key);
        registry.begin_unsubscribe(&key).unwrap();
        registry.remove(&key);
        assert!(!registry.contains(&key));
        assert!(matches!(
            registry.begin_unsubscribe(&key),
            Err(ClientError::State(_))
        ));
        assert_eq!(key.to_string(), "share:team:news/#");
    }

    #[test]
    fn test_send_buffer_reports_drain_once() {
        let buffer = SendBuffer::new(2);
        assert!(!buffer.reserve());
        assert!(buffer.reserve());
        assert!(!buffer.release());
        assert!(buffer.release());
        assert_eq!(buffer.buffered(), 0);

        assert!(!buffer.reserve());
        assert!(!buffer.release());
    }
}
