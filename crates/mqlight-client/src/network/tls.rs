//! TLS client configuration for `amqps://` endpoints.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::endpoint::Endpoint;
use crate::error::{ClientError, Result};

/// Build a connector for `endpoint`: trust its CA file if one is set,
/// otherwise the bundled web PKI roots.
pub(crate) fn connector(endpoint: &Endpoint) -> Result<TlsConnector> {
    Ok(TlsConnector::from(Arc::new(build_tls_config(endpoint)?)))
}

fn build_tls_config(endpoint: &Endpoint) -> Result<rustls::ClientConfig> {
    let mut root_store = RootCertStore::empty();

    if let Some(ca_path) = endpoint.certificate() {
        let file = File::open(ca_path)
            .map_err(|e| ClientError::Security(format!("Failed to open CA cert {}: {}", ca_path.display(), e)))?;
        let mut reader = BufReader::new(file);

        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ClientError::Security(format!("Failed to parse CA cert: {}", e)))?;
        if certs.is_empty() {
            return Err(ClientError::Security(format!(
                "No certificates found in {}",
                ca_path.display()
            )));
        }

        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| ClientError::Security(format!("Failed to add CA cert: {}", e)))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    if endpoint.verify_host_name() {
        return Ok(rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth());
    }

    let inner = WebPkiServerVerifier::builder(Arc::new(root_store))
        .build()
        .map_err(|e| ClientError::Security(format!("Failed to build certificate verifier: {}", e)))?;
    Ok(rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(IgnoreHostName { inner }))
        .with_no_client_auth())
}

/// Server name used for SNI and, when enabled, host name verification.
pub(crate) fn server_name(endpoint: &Endpoint) -> Result<ServerName<'static>> {
    ServerName::try_from(endpoint.host().to_string())
        .map_err(|_| ClientError::Security(format!("Invalid server name: {}", endpoint.host())))
}

/// Verifies the certificate chain but accepts a certificate issued for a
/// different host name.
#[derive(Debug)]
struct IgnoreHostName {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostName {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(reason))
                // Matched by name: newer rustls adds a variant carrying context.
                if format!("{:?}", reason).starts_with("NotValidForName") =>
            {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
