//! Broker endpoints and the services that choose between them.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{ClientError, Result};
use crate::promise::{resolve, Promise};

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_TLS_PORT: u16 = 5671;

/// A broker address plus the credentials and TLS settings used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    use_tls: bool,
    user: Option<String>,
    password: Option<String>,
    certificate: Option<PathBuf>,
    verify_host_name: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, use_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls,
            user: None,
            password: None,
            certificate: None,
            verify_host_name: true,
        }
    }

    /// Parse an `amqp://` or `amqps://` URI, optionally carrying
    /// `user:password@` credentials.
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| ClientError::Argument(format!("invalid service URI '{}': {}", uri, reason));

        let (scheme, rest) = uri.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let use_tls = match scheme.to_ascii_lowercase().as_str() {
            "amqp" => false,
            "amqps" => true,
            _ => return Err(invalid("scheme must be amqp or amqps")),
        };

        let authority = match rest.find('/') {
            Some(slash) if rest[slash..].len() > 1 => return Err(invalid("paths are not supported")),
            Some(slash) => &rest[..slash],
            None => rest,
        };

        let (credentials, host_port) = match authority.rsplit_once('@') {
            Some((credentials, host_port)) => (Some(credentials), host_port),
            None => (None, authority),
        };

        let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => return Err(invalid("unexpected characters after host")),
            }
        } else {
            match host_port.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (host_port, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None if use_tls => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        };

        let mut endpoint = Endpoint::new(host, port, use_tls);
        if let Some(credentials) = credentials {
            let (user, password) = credentials
                .split_once(':')
                .ok_or_else(|| invalid("credentials must be user:password"))?;
            endpoint = endpoint.with_credentials(user, password);
        }
        Ok(endpoint)
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Trust the PEM encoded CA certificate(s) in `path` for TLS connections.
    pub fn with_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate = Some(path.into());
        self
    }

    pub fn with_verify_host_name(mut self, verify: bool) -> Self {
        self.verify_host_name = verify;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn use_tls(&self) -> bool {
        self.use_tls
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn certificate(&self) -> Option<&PathBuf> {
        self.certificate.as_ref()
    }

    pub fn verify_host_name(&self) -> bool {
        self.verify_host_name
    }
}

/// Formats as a URI without credentials.
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_tls { "amqps" } else { "amqp" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Result of an endpoint lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointOutcome {
    /// Try this endpoint next.
    Endpoint(Endpoint),
    /// Nothing to try right now. Ask again after the delay.
    RetryAfter(Duration),
}

/// Chooses which endpoint the client connects to next.
///
/// A lookup that fails resolves its promise with an error, which the client
/// treats as unrecoverable.
pub trait EndpointService: Send + Sync {
    fn lookup(&self, promise: Box<dyn Promise<EndpointOutcome>>);

    /// The client connected to `endpoint` successfully.
    fn on_success(&self, endpoint: &Endpoint);

    /// Connecting to `endpoint` failed with `error`.
    fn on_failure(&self, endpoint: &Endpoint, error: &ClientError);
}

/// Exponential retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    next_delay: Duration,
}

impl Backoff {
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
            next_delay: initial_delay,
        }
    }

    /// Return the current delay and grow the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_delay;
        let grown = Duration::from_secs_f64(delay.as_secs_f64() * self.multiplier);
        self.next_delay = grown.min(self.max_delay);
        delay
    }

    pub fn reset(&mut self) {
        self.next_delay = self.initial_delay;
    }
}

impl Default for Backoff {
    /// 1 s doubling up to 60 s.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(60))
    }
}

struct SingleState {
    backoff: Backoff,
    failed: bool,
}

/// Always hands out the same endpoint, backing off between failed attempts.
pub struct SingleEndpointService {
    endpoint: Endpoint,
    state: Mutex<SingleState>,
}

impl SingleEndpointService {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_backoff(endpoint, Backoff::default())
    }

    pub fn with_backoff(endpoint: Endpoint, backoff: Backoff) -> Self {
        Self {
            endpoint,
            state: Mutex::new(SingleState {
                backoff,
                failed: false,
            }),
        }
    }

    /// Parse `uri` and apply explicit credentials, which take precedence
    /// over any embedded in the URI.
    pub fn from_uri(uri: &str, user: Option<&str>, password: Option<&str>) -> Result<Self> {
        let mut endpoint = Endpoint::parse(uri)?;
        match (user, password) {
            (Some(user), Some(password)) => endpoint = endpoint.with_credentials(user, password),
            (None, None) => {}
            _ => {
                return Err(ClientError::Argument(
                    "user and password must be supplied together".into(),
                ))
            }
        }
        Ok(Self::new(endpoint))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl EndpointService for SingleEndpointService {
    fn lookup(&self, promise: Box<dyn Promise<EndpointOutcome>>) {
        let outcome = {
            let mut state = self.state.lock();
            if state.failed {
                state.failed = false;
                EndpointOutcome::RetryAfter(state.backoff.next_delay())
            } else {
                EndpointOutcome::Endpoint(self.endpoint.clone())
            }
        };
        resolve(promise.as_ref(), Ok(outcome));
    }

    fn on_success(&self, _endpoint: &Endpoint) {
        let mut state = self.state.lock();
        state.failed = false;
        state.backoff.reset();
    }

    fn on_failure(&self, endpoint: &Endpoint, error: &ClientError) {
        log::debug!("Connection to {} failed: {}", endpoint, error);
        self.state.lock().failed = true;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::promise::OncePromise;

    fn lookup_now(service: &dyn EndpointService) -> Result<EndpointOutcome> {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        service.lookup(OncePromise::new(move |outcome| *out.lock() = Some(outcome)).boxed());
        let outcome = slot.lock().take();
        outcome.expect("lookup resolves synchronously")
    }

    #[test]
    fn test_parse_defaults_ports() {
        let plain = Endpoint::parse("amqp://broker.example.com").unwrap();
        assert_eq!(plain.host(), "broker.example.com");
        assert_eq!(plain.port(), DEFAULT_PORT);
        assert!(!plain.use_tls());

        let tls = Endpoint::parse("AMQPS://broker:1234/").unwrap();
        assert_eq!(tls.port(), 1234);
        assert!(tls.use_tls());
        assert!(tls.verify_host_name());
    }

    #[test]
    fn test_parse_credentials_and_ipv6() {
        let endpoint = Endpoint::parse("amqp://bob:p@ss@[::1]:5673").unwrap();
        assert_eq!(endpoint.user(), Some("bob"));
        assert_eq!(endpoint.password(), Some("p@ss"));
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.port(), 5673);
        assert_eq!(endpoint.to_string(), "amqp://[::1]:5673");
    }

    #[test]
    fn test_parse_rejects_bad_uris() {
        for uri in [
            "localhost:5672",
            "http://localhost",
            "amqp://",
            "amqp://host:notaport",
            "amqp://host/queue",
            "amqp://justuser@host",
        ] {
            assert!(
                matches!(Endpoint::parse(uri), Err(ClientError::Argument(_))),
                "{} should be rejected",
                uri
            );
        }
    }

    #[test]
    fn test_explicit_credentials_override_uri() {
        let service = SingleEndpointService::from_uri("amqp://a:b@host", Some("c"), Some("d")).unwrap();
        assert_eq!(service.endpoint().user(), Some("c"));
        assert_eq!(service.endpoint().password(), Some("d"));
        assert!(SingleEndpointService::from_uri("amqp://host", Some("c"), None).is_err());
    }

    #[test]
    fn test_single_service_backs_off_after_failure() {
        let endpoint = Endpoint::new("localhost", 5672, false);
        let service = SingleEndpointService::with_backoff(
            endpoint.clone(),
            Backoff::new(Duration::from_millis(100), 2.0, Duration::from_millis(300)),
        );
        let err = ClientError::Network("refused".into());

        assert_eq!(lookup_now(&service).unwrap(), EndpointOutcome::Endpoint(endpoint.clone()));

        let mut delays = Vec::new();
        for _ in 0..4 {
            service.on_failure(&endpoint, &err);
            match lookup_now(&service).unwrap() {
                EndpointOutcome::RetryAfter(delay) => delays.push(delay.as_millis()),
                other => panic!("expected retry, got {:?}", other),
            }
            assert_eq!(lookup_now(&service).unwrap(), EndpointOutcome::Endpoint(endpoint.clone()));
        }
        assert_eq!(delays, vec![100, 200, 300, 300]);

        service.on_success(&endpoint);
        service.on_failure(&endpoint, &err);
        assert_eq!(
            lookup_now(&service).unwrap(),
            EndpointOutcome::RetryAfter(Duration::from_millis(100))
        );
    }
}
