//! File based client settings.
//!
//! Supports configuration from:
//! - TOML file
//! - Environment variables with `MQLIGHT__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `MQLIGHT__CLIENT__SERVICE=amqp://broker:5672`
//! - `MQLIGHT__RETRY__MAX_DELAY_MS=30000`
//!
//! In-file substitution examples:
//! ```toml
//! [client]
//! service = "amqp://${BROKER_HOST:-localhost}:5672"
//! password = "${BROKER_PASSWORD}"
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::catalog::{CatalogEndpointService, ServiceCatalog, VcapServicesCatalog};
use crate::config::{validate_client_id, ClientOptions};
use crate::endpoint::{Backoff, EndpointService, SingleEndpointService};
use crate::error::{ClientError, Result};

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("valid pattern"));

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    ENV_VAR
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string()
}

/// Root settings structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log: LogSettings,
    pub client: ClientSection,
    pub transport: TransportSettings,
    pub retry: RetrySettings,
    pub tls: TlsSettings,
}

/// Logging settings, applied by binaries that install a logger.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log level: error, warn, info, debug, trace.
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// `amqp://` or `amqps://` URI. When unset the `VCAP_SERVICES` catalog is used.
    pub service: Option<String>,
    /// Regex selecting catalog services by name.
    pub service_name: Option<String>,
    pub id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub callback_threads: usize,
    pub max_buffered_sends: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        let options = ClientOptions::default();
        Self {
            service: None,
            service_name: None,
            id: None,
            username: None,
            password: None,
            callback_threads: options.callback_threads,
            max_buffered_sends: options.max_buffered_sends,
        }
    }
}

/// Network transport tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    /// Bytes in flight at which a channel stops accepting direct writes.
    pub write_high_water_mark: usize,
    /// Bytes in flight at which a paused channel becomes writable again.
    pub write_low_water_mark: usize,
    /// Worker threads of the shared I/O engine.
    pub io_threads: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            write_high_water_mark: 64 * 1024,
            write_low_water_mark: 32 * 1024,
            io_threads: 2,
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.connect_timeout_ms == 0 {
            return Err("transport.connect_timeout_ms must be > 0".into());
        }
        if self.write_low_water_mark > self.write_high_water_mark {
            return Err("transport.write_low_water_mark must not exceed write_high_water_mark".into());
        }
        if self.io_threads == 0 {
            return Err("transport.io_threads must be > 0".into());
        }
        Ok(())
    }
}

/// Reconnect backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err("retry.multiplier must be a finite number >= 1".into());
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err("retry.initial_delay_ms must not exceed retry.max_delay_ms".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM file of CA certificates to trust instead of the bundled roots.
    pub ca_cert: Option<PathBuf>,
    pub verify_host_name: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            ca_cert: None,
            verify_host_name: true,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQLIGHT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let substituted = substitute_env_vars(content);
        let settings: Settings = toml::from_str(&substituted)
            .map_err(|e| ClientError::Config(format!("TOML parse error: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let check = |r: std::result::Result<(), String>| r.map_err(ClientError::Config);
        check(self.transport.validate())?;
        check(self.retry.validate())?;
        if let Some(id) = &self.client.id {
            validate_client_id(id)?;
        }
        if self.client.username.is_some() != self.client.password.is_some() {
            return Err(ClientError::Config(
                "client.username and client.password must be set together".into(),
            ));
        }
        Ok(())
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            id: self.client.id.clone(),
            username: self.client.username.clone(),
            password: self.client.password.clone(),
            callback_threads: self.client.callback_threads,
            max_buffered_sends: self.client.max_buffered_sends,
        }
    }

    /// Build the endpoint service described by the `client`, `retry` and
    /// `tls` sections.
    pub fn endpoint_service(&self) -> Result<Arc<dyn EndpointService>> {
        match &self.client.service {
            Some(uri) => {
                let mut endpoint = SingleEndpointService::from_uri(
                    uri,
                    self.client.username.as_deref(),
                    self.client.password.as_deref(),
                )?
                .endpoint()
                .clone()
                .with_verify_host_name(self.tls.verify_host_name);
                if let Some(ca) = &self.tls.ca_cert {
                    endpoint = endpoint.with_certificate(ca.clone());
                }
                Ok(Arc::new(SingleEndpointService::with_backoff(
                    endpoint,
                    self.retry.backoff(),
                )))
            }
            None => Ok(Arc::new(self.catalog_service(VcapServicesCatalog::from_env())?)),
        }
    }

    fn catalog_service<C: ServiceCatalog>(&self, catalog: C) -> Result<CatalogEndpointService<C>> {
        let mut service = CatalogEndpointService::new(catalog)
            .with_backoff(self.retry.backoff())
            .with_tls(self.tls.ca_cert.clone(), self.tls.verify_host_name);
        if let Some(name) = &self.client.service_name {
            service = service.with_name_pattern(name)?;
        }
        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.log.level, "info");
        assert_eq!(settings.retry.backoff().next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[log]
level = "debug"

[client]
service = "amqp://broker:5673"
id = "orders_1"
username = "app"
password = "secret"
callback_threads = 2

[transport]
connect_timeout_ms = 2500
io_threads = 1

[retry]
initial_delay_ms = 100
max_delay_ms = 400
"#;
        let settings = Settings::parse(toml).unwrap();
        assert_eq!(settings.log.level, "debug");
        assert_eq!(settings.transport.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(settings.transport.write_high_water_mark, 64 * 1024);

        let options = settings.client_options();
        assert_eq!(options.id.as_deref(), Some("orders_1"));
        assert_eq!(options.callback_threads, 2);

        let mut backoff = settings.retry.backoff();
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 400]);
        assert!(settings.endpoint_service().is_ok());
    }

    #[test]
    fn test_catalog_endpoints_use_tls_section() {
        let settings = Settings::parse(
            "[client]\nservice_name = \"events\"\n\n[tls]\nca_cert = \"/etc/mqlight/ca.pem\"\nverify_host_name = false\n",
        )
        .unwrap();
        let catalog = VcapServicesCatalog::from_json(
            r#"{"mqlight": [{"name": "events", "label": "mqlight", "credentials": {"url": "amqps://broker"}}]}"#,
        );
        let service = settings.catalog_service(catalog).unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        service.lookup(
            crate::promise::OncePromise::new(move |outcome| {
                let _ = tx.send(outcome);
            })
            .boxed(),
        );
        let Ok(crate::endpoint::EndpointOutcome::Endpoint(endpoint)) = rx.try_recv().unwrap() else {
            panic!("expected an endpoint")
        };
        assert_eq!(endpoint.host(), "broker");
        assert_eq!(endpoint.certificate(), Some(&PathBuf::from("/etc/mqlight/ca.pem")));
        assert!(!endpoint.verify_host_name());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Settings::parse("[client]\nid = \"bad id\"\n").is_err());
        assert!(Settings::parse("[retry]\nmultiplier = 0.5\n").is_err());
        assert!(Settings::parse("[transport]\nwrite_low_water_mark = 10\nwrite_high_water_mark = 5\n").is_err());
        assert!(Settings::parse("[client]\nusername = \"only\"\n").is_err());
        assert!(Settings::parse("not = [valid").is_err());
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("MQLIGHT_TEST_BROKER_PORT", "5699");
        let substituted = substitute_env_vars(r#"service = "amqp://h:${MQLIGHT_TEST_BROKER_PORT}""#);
        assert_eq!(substituted, r#"service = "amqp://h:5699""#);
        std::env::remove_var("MQLIGHT_TEST_BROKER_PORT");
    }

    #[test]
    fn test_env_var_substitution_with_default() {
        std::env::remove_var("MQLIGHT_TEST_NONEXISTENT");
        let substituted = substitute_env_vars(r#"${MQLIGHT_TEST_NONEXISTENT:-amqp://localhost}"#);
        assert_eq!(substituted, "amqp://localhost");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\nservice = \"amqps://secure.example.com\"\n\n[tls]\nverify_host_name = false").unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.client.service.as_deref(), Some("amqps://secure.example.com"));
        assert!(!settings.tls.verify_host_name);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.transport.io_threads, 2);
    }
}
