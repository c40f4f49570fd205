//! mqlight-core - Frame codec and message types for the MQ Light client.
//!
//! This crate holds the wire format shared by the client and the loopback
//! brokers used in its tests.

pub mod error;
pub mod frame;
pub mod message;
pub mod varint;

pub use error::{ProtocolError, Result};
pub use frame::*;
pub use message::*;
