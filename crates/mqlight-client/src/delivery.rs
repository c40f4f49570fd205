//! Inbound messages handed to destination listeners.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mqlight_core::{InboundMessage, Payload, Properties, QoS};

use crate::client::ClientMessage;
use crate::component::{ComponentRef, Sender};
use crate::error::{ClientError, Result};

/// Quality of service of a delivery.
///
/// Only at-least-once deliveries that were not auto-confirmed carry a
/// [`Confirmation`].
#[derive(Debug, Clone)]
pub enum DeliveryQos {
    AtMostOnce,
    AtLeastOnce(Option<Confirmation>),
}

/// A message received for a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    topic: String,
    topic_pattern: String,
    share: Option<String>,
    ttl: Option<Duration>,
    properties: Properties,
    payload: Payload,
    qos: DeliveryQos,
    malformed: bool,
}

impl Delivery {
    pub(crate) fn new(message: InboundMessage, qos: DeliveryQos) -> Self {
        Self {
            topic: message.topic,
            topic_pattern: message.topic_pattern,
            share: message.share,
            ttl: message.ttl_ms.map(Duration::from_millis),
            properties: message.properties,
            payload: message.payload,
            qos,
            malformed: message.malformed,
        }
    }

    /// Topic the message was sent to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Pattern of the subscription that matched.
    pub fn topic_pattern(&self) -> &str {
        &self.topic_pattern
    }

    /// Share name, `None` for a private subscription.
    pub fn share(&self) -> Option<&str> {
        self.share.as_deref()
    }

    /// Remaining time to live.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn qos(&self) -> QoS {
        match self.qos {
            DeliveryQos::AtMostOnce => QoS::AtMostOnce,
            DeliveryQos::AtLeastOnce(_) => QoS::AtLeastOnce,
        }
    }

    pub fn delivery_qos(&self) -> &DeliveryQos {
        &self.qos
    }

    pub fn confirmation(&self) -> Option<&Confirmation> {
        match &self.qos {
            DeliveryQos::AtLeastOnce(confirmation) => confirmation.as_ref(),
            DeliveryQos::AtMostOnce => None,
        }
    }

    /// The payload was sent as text but was not valid UTF-8.
    pub fn is_malformed(&self) -> bool {
        self.malformed
    }

    /// Confirm receipt.
    ///
    /// Fails with [`ClientError::Usage`] if the delivery has nothing to
    /// confirm, see [`Confirmation::confirm`] otherwise.
    pub fn confirm(&self) -> Result<()> {
        match &self.qos {
            DeliveryQos::AtMostOnce => Err(ClientError::Usage(
                "at-most-once deliveries cannot be confirmed".into(),
            )),
            DeliveryQos::AtLeastOnce(None) => Err(ClientError::Usage(
                "delivery was confirmed automatically".into(),
            )),
            DeliveryQos::AtLeastOnce(Some(confirmation)) => confirmation.confirm(),
        }
    }
}

#[derive(Debug)]
struct ConfirmationInner {
    delivery_id: u64,
    connection: u64,
    /// Connection the client currently has open, zero when none.
    live_connection: Arc<AtomicU64>,
    confirmed: AtomicBool,
    client: ComponentRef<ClientMessage>,
}

/// Handle for acknowledging one at-least-once delivery.
#[derive(Debug, Clone)]
pub struct Confirmation {
    inner: Arc<ConfirmationInner>,
}

impl Confirmation {
    pub(crate) fn new(
        delivery_id: u64,
        connection: u64,
        live_connection: Arc<AtomicU64>,
        client: ComponentRef<ClientMessage>,
    ) -> Self {
        Self {
            inner: Arc::new(ConfirmationInner {
                delivery_id,
                connection,
                live_connection,
                confirmed: AtomicBool::new(false),
                client,
            }),
        }
    }

    /// Acknowledge the delivery to the server.
    ///
    /// Fails with [`ClientError::State`] if already confirmed, or if the
    /// connection the message arrived on has gone. In that case the server
    /// redelivers the message.
    pub fn confirm(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.live_connection.load(Ordering::Acquire) != inner.connection {
            return Err(ClientError::State(
                "connection closed before confirmation, message may be redelivered".into(),
            ));
        }
        if inner.confirmed.swap(true, Ordering::AcqRel) {
            return Err(ClientError::State("delivery already confirmed".into()));
        }
        inner.client.tell(
            ClientMessage::Confirm {
                delivery_id: inner.delivery_id,
                connection: inner.connection,
            },
            Sender::NOBODY,
        );
        Ok(())
    }

    pub fn is_confirmed(&self) -> bool {
        self.inner.confirmed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use crossbeam_channel as channel;

    use super::*;
    use crate::component::{Component, ComponentPool};

    struct Collector(channel::Sender<(u64, u64)>);

    impl Component for Collector {
        type Message = ClientMessage;

        fn on_receive(&mut self, _me: &ComponentRef<ClientMessage>, message: ClientMessage, _sender: Sender) -> Result<()> {
            if let ClientMessage::Confirm {
                delivery_id,
                connection,
            } = message
            {
                let _ = self.0.send((delivery_id, connection));
            }
            Ok(())
        }
    }

    fn inbound(qos: QoS) -> InboundMessage {
        InboundMessage {
            delivery_id: 9,
            topic: "sports/football".into(),
            topic_pattern: "sports/#".into(),
            share: None,
            qos,
            ttl_ms: Some(1500),
            properties: Properties::new(),
            payload: Payload::Bytes(Bytes::from_static(b"\x00\x01")),
            malformed: false,
        }
    }

    #[test]
    fn test_at_most_once_cannot_be_confirmed() {
        let delivery = Delivery::new(inbound(QoS::AtMostOnce), DeliveryQos::AtMostOnce);
        assert_eq!(delivery.qos(), QoS::AtMostOnce);
        assert_eq!(delivery.ttl(), Some(Duration::from_millis(1500)));
        assert!(delivery.confirmation().is_none());
        assert!(matches!(delivery.confirm(), Err(ClientError::Usage(_))));

        let auto = Delivery::new(inbound(QoS::AtLeastOnce), DeliveryQos::AtLeastOnce(None));
        assert!(matches!(auto.confirm(), Err(ClientError::Usage(_))));
    }

    #[test]
    fn test_confirm_once_on_live_connection() {
        let pool = ComponentPool::new(1);
        let (tx, rx) = channel::unbounded();
        let client = pool.spawn(Collector(tx));
        let live = Arc::new(AtomicU64::new(3));

        let confirmation = Confirmation::new(9, 3, Arc::clone(&live), client);
        let delivery = Delivery::new(
            inbound(QoS::AtLeastOnce),
            DeliveryQos::AtLeastOnce(Some(confirmation.clone())),
        );

        delivery.confirm().unwrap();
        assert!(confirmation.is_confirmed());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (9, 3));
        assert!(matches!(delivery.confirm(), Err(ClientError::State(_))));
    }

    #[test]
    fn test_confirm_after_connection_loss_is_state_error() {
        let pool = ComponentPool::new(1);
        let (tx, rx) = channel::unbounded();
        let client = pool.spawn(Collector(tx));
        let live = Arc::new(AtomicU64::new(3));
        let confirmation = Confirmation::new(9, 3, Arc::clone(&live), client);

        live.store(0, Ordering::Release);
        assert!(matches!(confirmation.confirm(), Err(ClientError::State(_))));
        assert!(!confirmation.is_confirmed());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
