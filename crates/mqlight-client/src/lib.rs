//! mqlight-client - Non-blocking publish/subscribe client for MQ Light brokers.
//!
//! Every operation returns immediately. Argument and state errors are
//! reported synchronously; outcomes arrive later through listeners, run on
//! the client's callback threads in the order the client produced them.
//! Lost connections are retried in the background and subscriptions are
//! re-established before the client reports itself restarted.
//!
//! # Example
//!
//! ```ignore
//! use mqlight_client::{
//!     ClientOptions, Delivery, DestinationListener, NonBlockingClient, NoopListener,
//!     Properties, SendOptions, SubscribeOptions,
//! };
//!
//! struct Printer;
//!
//! impl DestinationListener<()> for Printer {
//!     fn on_message(&self, _client: &NonBlockingClient, _context: &(), delivery: Delivery) {
//!         println!("{}: {:?}", delivery.topic(), delivery.payload().as_text());
//!     }
//! }
//!
//! let client = NonBlockingClient::create("amqp://localhost", ClientOptions::new(), NoopListener, ())?;
//! client.subscribe("news/#", &SubscribeOptions::new(), Printer, NoopListener, ())?;
//! client.send("news/tech", "hello", Properties::new(), &SendOptions::new(), NoopListener, ())?;
//! ```
//!
//! # Configuration
//!
//! [`Settings`] loads client, transport, retry and TLS options from a TOML
//! file with `MQLIGHT__*` environment overrides:
//!
//! ```ignore
//! let settings = mqlight_client::Settings::load("mqlight.toml")?;
//! let client = NonBlockingClient::from_settings(&settings, NoopListener, ())?;
//! ```

mod callback;
mod catalog;
mod client;
mod component;
mod config;
mod delivery;
mod endpoint;
mod error;
mod events;
mod listener;
pub mod network;
mod promise;
mod session;
mod settings;
mod timer;

pub use callback::{CallbackService, CallbackTask, ThreadPoolCallbackService};
pub use catalog::{CatalogEndpointService, CatalogEntry, ServiceCatalog, VcapServicesCatalog, DEFAULT_LABEL_PATTERN};
pub use client::{ClientServices, NonBlockingClient};
pub use component::{Component, ComponentId, ComponentPool, ComponentRef, Sender, WeakComponentRef};
pub use config::{
    generate_client_id, validate_client_id, ClientOptions, SendOptions, StopOptions, SubscribeOptions,
    DEFAULT_CREDIT, MAX_CLIENT_ID_LENGTH,
};
pub use delivery::{Confirmation, Delivery, DeliveryQos};
pub use endpoint::{Backoff, Endpoint, EndpointOutcome, EndpointService, SingleEndpointService, DEFAULT_PORT, DEFAULT_TLS_PORT};
pub use error::{ClientError, Result};
pub use events::ClientState;
pub use listener::{CompletionListener, DestinationListener, NonBlockingClientListener, NoopListener};
pub use promise::{OncePromise, Promise};
pub use settings::{ClientSection, LogSettings, RetrySettings, Settings, TlsSettings, TransportSettings};
pub use timer::{ThreadTimerService, TimerHandle, TimerService};

// Re-export message types from core
pub use mqlight_core::{Payload, Properties, PropertyValue, QoS};
