//! Client, send, subscribe and stop options.

use std::time::Duration;

use rand::Rng;

use crate::callback::ThreadPoolCallbackService;
use crate::error::{ClientError, Result};
use mqlight_core::QoS;

/// Longest permitted client identifier.
pub const MAX_CLIENT_ID_LENGTH: usize = 256;

/// Default number of messages a subscription may have outstanding.
pub const DEFAULT_CREDIT: u32 = 1024;

/// Check that `id` is a usable client identifier: 1 to 256 characters drawn
/// from `A-Z a-z 0-9 % / . _`.
pub fn validate_client_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ClientError::Argument("Client identifier must not be empty.".into()));
    }
    if id.chars().count() > MAX_CLIENT_ID_LENGTH {
        return Err(ClientError::Argument(format!(
            "Client identifier '{}' is longer than the maximum ID length of {}.",
            id, MAX_CLIENT_ID_LENGTH
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '%' | '/' | '.' | '_')))
    {
        return Err(ClientError::Argument(format!(
            "Client identifier '{}' contains invalid character: '{}'",
            id, bad
        )));
    }
    Ok(())
}

/// Generate an identifier of the form `AUTO_` followed by 7 hex digits.
pub fn generate_client_id() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x1000_0000);
    format!("AUTO_{:07x}", suffix)
}

fn ttl_millis(ttl: Duration, what: &str) -> Result<u64> {
    let ms = ttl.as_millis();
    if ms > u64::MAX as u128 {
        return Err(ClientError::Argument(format!("{} ttl is too large", what)));
    }
    Ok(ms as u64)
}

/// Options fixed for the lifetime of a client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Client identifier. Generated when `None`.
    pub id: Option<String>,
    /// Username. Overrides credentials in the service URI.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Threads used to run listener callbacks.
    pub callback_threads: usize,
    /// Sends that may be buffered before `send` reports the buffer as full.
    pub max_buffered_sends: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            id: None,
            username: None,
            password: None,
            callback_threads: ThreadPoolCallbackService::DEFAULT_THREADS,
            max_buffered_sends: 1024,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client identifier.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn callback_threads(mut self, threads: usize) -> Self {
        self.callback_threads = threads;
        self
    }

    pub fn max_buffered_sends(mut self, sends: usize) -> Self {
        self.max_buffered_sends = sends;
        self
    }

    /// Validate and return the identifier to use, generating one if unset.
    pub(crate) fn resolve_id(&self) -> Result<String> {
        match &self.id {
            Some(id) => {
                validate_client_id(id)?;
                Ok(id.clone())
            }
            None => Ok(generate_client_id()),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.username.is_some() != self.password.is_some() {
            return Err(ClientError::Argument(
                "username and password must be supplied together".into(),
            ));
        }
        if self.callback_threads == 0 {
            return Err(ClientError::Argument("callback_threads must be > 0".into()));
        }
        if self.max_buffered_sends == 0 {
            return Err(ClientError::Argument("max_buffered_sends must be > 0".into()));
        }
        Ok(())
    }
}

/// Options for a single send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub qos: QoS,
    /// How long the broker keeps the message if nobody receives it.
    pub ttl: Option<Duration>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// TTL in whole milliseconds, validated.
    pub(crate) fn ttl_ms(&self) -> Result<Option<u64>> {
        match self.ttl {
            None => Ok(None),
            Some(ttl) => match ttl_millis(ttl, "send")? {
                0 => Err(ClientError::Argument("send ttl must be at least 1ms".into())),
                ms => Ok(Some(ms)),
            },
        }
    }
}

/// Options for a subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub qos: QoS,
    /// Join a shared destination with this name.
    pub share: Option<String>,
    /// Confirm at-least-once deliveries once the listener returns.
    pub auto_confirm: bool,
    /// How long the destination outlives the subscription.
    pub ttl: Duration,
    /// Maximum unconfirmed deliveries.
    pub credit: u32,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            share: None,
            auto_confirm: true,
            ttl: Duration::ZERO,
            credit: DEFAULT_CREDIT,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn share(mut self, share: impl Into<String>) -> Self {
        self.share = Some(share.into());
        self
    }

    pub fn auto_confirm(mut self, auto_confirm: bool) -> Self {
        self.auto_confirm = auto_confirm;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn credit(mut self, credit: u32) -> Self {
        self.credit = credit;
        self
    }

    pub(crate) fn validate(&self) -> Result<u64> {
        if let Some(share) = &self.share {
            validate_share(share)?;
        }
        ttl_millis(self.ttl, "subscription")
    }
}

/// Options for stopping a client.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// Let in-flight sends complete before closing the connection.
    pub drain: bool,
}

impl StopOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(mut self, drain: bool) -> Self {
        self.drain = drain;
        self
    }
}

pub(crate) fn validate_share(share: &str) -> Result<()> {
    if share.is_empty() {
        return Err(ClientError::Argument("share name must not be empty".into()));
    }
    if share.contains(':') {
        return Err(ClientError::Argument(format!(
            "share name '{}' must not contain a colon (:)",
            share
        )));
    }
    Ok(())
}

pub(crate) fn validate_topic(topic: &str, what: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(ClientError::Argument(format!("{} must not be empty", what)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_client_ids() {
        let longest = "x".repeat(MAX_CLIENT_ID_LENGTH);
        for id in ["a", "client_1", "dept/app.2%", longest.as_str()] {
            assert!(validate_client_id(id).is_ok(), "{} should be valid", id);
        }
    }

    #[test]
    fn test_invalid_client_ids() {
        let long = "x".repeat(MAX_CLIENT_ID_LENGTH + 1);
        let err = validate_client_id(&long).unwrap_err().to_string();
        assert!(err.contains("longer than the maximum ID length of 256"));

        let err = validate_client_id("bad id").unwrap_err().to_string();
        assert!(err.ends_with("contains invalid character: ' '"), "{}", err);

        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("caf\u{e9}").is_err());
        assert!(validate_client_id("a:b").is_err());
    }

    #[test]
    fn test_generated_ids_are_valid() {
        for _ in 0..100 {
            let id = generate_client_id();
            assert_eq!(id.len(), 12);
            assert!(id.starts_with("AUTO_"));
            assert!(id[5..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            validate_client_id(&id).unwrap();
        }
    }

    #[test]
    fn test_client_options_validation() {
        assert!(ClientOptions::new().validate().is_ok());
        let mut half = ClientOptions::new();
        half.username = Some("user".into());
        assert!(matches!(half.validate(), Err(ClientError::Argument(_))));
        assert!(ClientOptions::new().callback_threads(0).validate().is_err());
        assert_eq!(ClientOptions::new().id("given").resolve_id().unwrap(), "given");
        assert!(ClientOptions::new().id("no spaces").resolve_id().is_err());
    }

    #[test]
    fn test_send_ttl() {
        assert_eq!(SendOptions::new().ttl_ms().unwrap(), None);
        assert_eq!(
            SendOptions::new().ttl(Duration::from_secs(2)).ttl_ms().unwrap(),
            Some(2000)
        );
        assert!(SendOptions::new().ttl(Duration::ZERO).ttl_ms().is_err());
        assert!(SendOptions::new().ttl(Duration::from_micros(10)).ttl_ms().is_err());
    }

    #[test]
    fn test_subscribe_defaults_and_share() {
        let opts = SubscribeOptions::default();
        assert!(opts.auto_confirm);
        assert_eq!(opts.credit, DEFAULT_CREDIT);
        assert_eq!(opts.validate().unwrap(), 0);

        assert!(SubscribeOptions::new().share("group").validate().is_ok());
        assert!(SubscribeOptions::new().share("a:b").validate().is_err());
        assert!(SubscribeOptions::new().share("").validate().is_err());
    }
}
