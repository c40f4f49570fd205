//! Endpoint lookup from a catalog of bound services.
//!
//! Platforms such as Cloud Foundry describe the services bound to an
//! application in the `VCAP_SERVICES` environment variable:
//!
//! ```json
//! {
//!   "mqlight": [{
//!     "name": "orders",
//!     "label": "mqlight",
//!     "credentials": { "url": "amqp://broker:5672", "username": "u", "password": "p" }
//!   }]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;

use crate::endpoint::{Backoff, Endpoint, EndpointOutcome, EndpointService};
use crate::error::{ClientError, Result};
use crate::promise::{resolve, Promise};

pub const DEFAULT_LABEL_PATTERN: &str = "^(mqlight|messagehub|user-provided)$";

/// One service instance from a catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub label: String,
    pub endpoint: Endpoint,
}

/// Source of bound service descriptions.
pub trait ServiceCatalog: Send + Sync {
    fn entries(&self) -> Result<Vec<CatalogEntry>>;
}

#[derive(Debug, Deserialize)]
struct VcapService {
    name: String,
    label: String,
    credentials: VcapCredentials,
}

#[derive(Debug, Deserialize)]
struct VcapCredentials {
    #[serde(alias = "uri", alias = "connectionLookupURI", alias = "nonTLSConnectionLookupURI")]
    url: Option<String>,
    #[serde(alias = "user")]
    username: Option<String>,
    password: Option<String>,
}

enum VcapSource {
    Environment(String),
    Document(String),
}

/// Catalog read from a `VCAP_SERVICES` style JSON document.
pub struct VcapServicesCatalog {
    source: VcapSource,
}

impl VcapServicesCatalog {
    /// Read the document from the `VCAP_SERVICES` environment variable on
    /// every lookup.
    pub fn from_env() -> Self {
        Self::from_env_var("VCAP_SERVICES")
    }

    pub fn from_env_var(name: impl Into<String>) -> Self {
        Self {
            source: VcapSource::Environment(name.into()),
        }
    }

    pub fn from_json(document: impl Into<String>) -> Self {
        Self {
            source: VcapSource::Document(document.into()),
        }
    }

    fn document(&self) -> Result<String> {
        match &self.source {
            VcapSource::Document(doc) => Ok(doc.clone()),
            VcapSource::Environment(var) => std::env::var(var)
                .map_err(|_| ClientError::Config(format!("environment variable {} is not set", var))),
        }
    }
}

impl ServiceCatalog for VcapServicesCatalog {
    fn entries(&self) -> Result<Vec<CatalogEntry>> {
        let document = self.document()?;
        let services: BTreeMap<String, Vec<VcapService>> = serde_json::from_str(&document)
            .map_err(|e| ClientError::Config(format!("invalid service catalog: {}", e)))?;

        let mut entries = Vec::new();
        for service in services.into_values().flatten() {
            let Some(url) = service.credentials.url else {
                log::debug!("Skipping service '{}': no connection URI", service.name);
                continue;
            };
            let mut endpoint = match Endpoint::parse(&url) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    log::debug!("Skipping service '{}': {}", service.name, e);
                    continue;
                }
            };
            if let (Some(user), Some(password)) = (service.credentials.username, service.credentials.password) {
                endpoint = endpoint.with_credentials(user, password);
            }
            entries.push(CatalogEntry {
                name: service.name,
                label: service.label,
                endpoint,
            });
        }
        Ok(entries)
    }
}

struct Rotation {
    next: usize,
    failures_in_pass: usize,
    backoff: Backoff,
}

/// Endpoint service that rotates through matching catalog entries.
///
/// Entries are offered round-robin. Once every entry has failed in the
/// current pass the service asks the client to wait before starting the
/// next pass.
pub struct CatalogEndpointService<C> {
    catalog: C,
    name_pattern: Regex,
    label_pattern: Regex,
    certificate: Option<PathBuf>,
    verify_host_name: bool,
    rotation: Mutex<Rotation>,
}

impl<C: ServiceCatalog> CatalogEndpointService<C> {
    pub fn new(catalog: C) -> Self {
        Self {
            catalog,
            name_pattern: Regex::new(".*").expect("static pattern"),
            label_pattern: Regex::new(DEFAULT_LABEL_PATTERN).expect("static pattern"),
            certificate: None,
            verify_host_name: true,
            rotation: Mutex::new(Rotation {
                next: 0,
                failures_in_pass: 0,
                backoff: Backoff::default(),
            }),
        }
    }

    /// Only use services whose name matches `pattern`.
    pub fn with_name_pattern(mut self, pattern: &str) -> Result<Self> {
        self.name_pattern = compile(pattern)?;
        Ok(self)
    }

    /// Only use the service with exactly this name.
    pub fn with_name(self, name: &str) -> Result<Self> {
        self.with_name_pattern(&format!("^{}$", regex::escape(name)))
    }

    pub fn with_label_pattern(mut self, pattern: &str) -> Result<Self> {
        self.label_pattern = compile(pattern)?;
        Ok(self)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.rotation.get_mut().backoff = backoff;
        self
    }

    /// TLS options applied to every endpoint taken from the catalog.
    pub fn with_tls(mut self, certificate: Option<PathBuf>, verify_host_name: bool) -> Self {
        self.certificate = certificate;
        self.verify_host_name = verify_host_name;
        self
    }

    fn matching(&self) -> Result<Vec<Endpoint>> {
        Ok(self
            .catalog
            .entries()?
            .into_iter()
            .filter(|e| self.name_pattern.is_match(&e.name) && self.label_pattern.is_match(&e.label))
            .map(|e| {
                let endpoint = e.endpoint.with_verify_host_name(self.verify_host_name);
                match &self.certificate {
                    Some(path) => endpoint.with_certificate(path.clone()),
                    None => endpoint,
                }
            })
            .collect())
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ClientError::Argument(format!("invalid pattern '{}': {}", pattern, e)))
}

impl<C: ServiceCatalog> EndpointService for CatalogEndpointService<C> {
    fn lookup(&self, promise: Box<dyn Promise<EndpointOutcome>>) {
        let endpoints = match self.matching() {
            Ok(endpoints) => endpoints,
            Err(e) => {
                resolve(promise.as_ref(), Err(e));
                return;
            }
        };

        let outcome = {
            let mut rotation = self.rotation.lock();
            if endpoints.is_empty() {
                log::debug!("No matching services in catalog");
                EndpointOutcome::RetryAfter(rotation.backoff.next_delay())
            } else if rotation.failures_in_pass >= endpoints.len() {
                rotation.failures_in_pass = 0;
                EndpointOutcome::RetryAfter(rotation.backoff.next_delay())
            } else {
                let index = rotation.next % endpoints.len();
                rotation.next = index + 1;
                EndpointOutcome::Endpoint(endpoints[index].clone())
            }
        };
        resolve(promise.as_ref(), Ok(outcome));
    }

    fn on_success(&self, _endpoint: &Endpoint) {
        let mut rotation = self.rotation.lock();
        rotation.failures_in_pass = 0;
        rotation.backoff.reset();
    }

    fn on_failure(&self, endpoint: &Endpoint, error: &ClientError) {
        log::debug!("Connection to {} failed: {}", endpoint, error);
        self.rotation.lock().failures_in_pass += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::promise::OncePromise;

    const VCAP: &str = r#"{
        "mqlight": [
            {"name": "orders", "label": "mqlight",
             "credentials": {"url": "amqp://one:5672", "username": "u", "password": "p"}},
            {"name": "billing", "label": "mqlight",
             "credentials": {"connectionLookupURI": "amqps://two"}}
        ],
        "cleardb": [
            {"name": "db", "label": "cleardb", "credentials": {"uri": "amqp://db:1"}}
        ],
        "user-provided": [
            {"name": "orders-backup", "label": "user-provided", "credentials": {}}
        ]
    }"#;

    fn lookup_now(service: &dyn EndpointService) -> Result<EndpointOutcome> {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        service.lookup(OncePromise::new(move |outcome| *out.lock() = Some(outcome)).boxed());
        let outcome = slot.lock().take();
        outcome.expect("lookup resolves synchronously")
    }

    fn host_of(outcome: EndpointOutcome) -> String {
        match outcome {
            EndpointOutcome::Endpoint(e) => e.host().to_string(),
            other => panic!("expected endpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_vcap_parsing() {
        let entries = VcapServicesCatalog::from_json(VCAP).entries().unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["db", "orders", "billing"]);

        let orders = &entries[1];
        assert_eq!(orders.endpoint.user(), Some("u"));
        assert!(entries[2].endpoint.use_tls());
    }

    #[test]
    fn test_round_robin_then_backoff() {
        let service = CatalogEndpointService::new(VcapServicesCatalog::from_json(VCAP))
            .with_backoff(Backoff::new(Duration::from_millis(50), 2.0, Duration::from_secs(1)));

        let first = host_of(lookup_now(&service).unwrap());
        let second = host_of(lookup_now(&service).unwrap());
        assert_eq!((first.as_str(), second.as_str()), ("one", "two"));

        let err = ClientError::Network("refused".into());
        service.on_failure(&Endpoint::new("one", 5672, false), &err);
        service.on_failure(&Endpoint::new("two", 5671, true), &err);
        assert_eq!(
            lookup_now(&service).unwrap(),
            EndpointOutcome::RetryAfter(Duration::from_millis(50))
        );
        assert_eq!(host_of(lookup_now(&service).unwrap()), "one");
    }

    #[test]
    fn test_name_filter() {
        let service = CatalogEndpointService::new(VcapServicesCatalog::from_json(VCAP))
            .with_name("billing")
            .unwrap();
        assert_eq!(host_of(lookup_now(&service).unwrap()), "two");
        assert_eq!(host_of(lookup_now(&service).unwrap()), "two");
    }

    #[test]
    fn test_no_match_waits() {
        let service = CatalogEndpointService::new(VcapServicesCatalog::from_json(VCAP))
            .with_label_pattern("^nothing$")
            .unwrap();
        assert!(matches!(lookup_now(&service).unwrap(), EndpointOutcome::RetryAfter(_)));
    }

    #[test]
    fn test_bad_catalog_is_an_error() {
        let service = CatalogEndpointService::new(VcapServicesCatalog::from_json("not json"));
        assert!(matches!(lookup_now(&service), Err(ClientError::Config(_))));

        let missing = CatalogEndpointService::new(VcapServicesCatalog::from_env_var("MQLIGHT_TEST_UNSET_VCAP"));
        assert!(matches!(lookup_now(&missing), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_unrelated_services_with_other_schemes_are_skipped() {
        let mixed = r#"{
            "elephantsql": [
                {"name": "pg", "label": "elephantsql",
                 "credentials": {"uri": "postgres://user:pw@db.example.com:5432/app"}}
            ],
            "mqlight": [
                {"name": "events", "label": "mqlight", "credentials": {"url": "amqp://broker:5672"}}
            ]
        }"#;
        let entries = VcapServicesCatalog::from_json(mixed).entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "events");

        let service = CatalogEndpointService::new(VcapServicesCatalog::from_json(mixed));
        assert_eq!(host_of(lookup_now(&service).unwrap()), "broker");
    }

    #[test]
    fn test_tls_options_apply_to_catalog_endpoints() {
        let service = CatalogEndpointService::new(VcapServicesCatalog::from_json(VCAP))
            .with_name("billing")
            .unwrap()
            .with_tls(Some(PathBuf::from("/etc/mqlight/ca.pem")), false);
        let EndpointOutcome::Endpoint(endpoint) = lookup_now(&service).unwrap() else {
            panic!("expected an endpoint")
        };
        assert_eq!(endpoint.certificate(), Some(&PathBuf::from("/etc/mqlight/ca.pem")));
        assert!(!endpoint.verify_host_name());
    }

    #[test]
    fn test_invalid_pattern() {
        let result = CatalogEndpointService::new(VcapServicesCatalog::from_json(VCAP)).with_name_pattern("(");
        assert!(matches!(result, Err(ClientError::Argument(_))));
    }
}
