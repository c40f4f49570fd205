//! Byte stream transport.
//!
//! A [`NetworkService`] opens [`NetworkChannel`]s to endpoints. Every
//! operation reports back through a [`Promise`], and incoming data and
//! terminal events are pushed to the channel's [`NetworkListener`].

mod engine;
mod tcp;
mod tls;
mod write_queue;

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;

use crate::endpoint::Endpoint;
use crate::error::ClientError;
use crate::promise::Promise;

pub use engine::{EngineLease, IoEngine};
pub use tcp::TcpNetworkService;

/// Receives events for one channel.
///
/// Each channel delivers exactly one terminal event, either `on_error` or
/// `on_close`, after which it delivers nothing more.
pub trait NetworkListener: Send + Sync {
    fn on_read(&self, channel: &Arc<dyn NetworkChannel>, data: Bytes);

    fn on_error(&self, channel: &Arc<dyn NetworkChannel>, error: ClientError);

    fn on_close(&self, channel: &Arc<dyn NetworkChannel>);
}

/// An open connection.
pub trait NetworkChannel: Send + Sync {
    /// Queue `data` for writing. The promise resolves `true` once written if
    /// no backlog remains, `false` if the caller should pause.
    fn write(&self, data: Bytes, promise: Box<dyn Promise<bool>>);

    /// Close the channel. Resolves once closed; immediately if it already is.
    fn close(&self, promise: Option<Box<dyn Promise<()>>>);

    /// Attach owner data to the channel.
    fn set_context(&self, context: Arc<dyn Any + Send + Sync>);

    fn context(&self) -> Option<Arc<dyn Any + Send + Sync>>;

    fn is_open(&self) -> bool;
}

/// Opens channels.
pub trait NetworkService: Send + Sync {
    /// Connect to `endpoint`. The promise resolves exactly once, with the
    /// open channel or the error that prevented it.
    fn connect(
        &self,
        endpoint: &Endpoint,
        listener: Arc<dyn NetworkListener>,
        promise: Box<dyn Promise<Arc<dyn NetworkChannel>>>,
    );
}
