//! Per-host TLS termination for intercepted tunnels, and the client side
//! used to reach origins

use rustls::{ClientConfig, ServerConfig};
use std::sync::Arc;
use std::time::Duration;

use super::ca::Authority;
use crate::error::{Error, Result};

/// Limit on the client-side handshake of an intercepted tunnel
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds server configs for decrypted tunnels
pub struct MitmConfig {
    authority: Arc<Authority>,
}

impl std::fmt::Debug for MitmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmConfig")
            .field("organization", &self.authority.organization())
            .field("validity", &self.authority.validity())
            .finish()
    }
}

impl MitmConfig {
    pub fn new(authority: Arc<Authority>) -> Self {
        Self { authority }
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    /// Server config presenting a freshly issued leaf for `hostname`
    pub fn server_config_for_host(&self, hostname: &str) -> Result<ServerConfig> {
        let issued = self.authority.issue(hostname)?;
        tracing::debug!(
            hostname = %issued.hostname,
            not_after = %issued.not_after,
            "Issued MITM certificate"
        );

        let cert_chain = vec![issued.cert_der, self.authority.cert_der().clone()];
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, issued.key_der)
            .map_err(|e| Error::tls(format!("Failed to build server config: {}", e)))?;

        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}

/// Client config for origin connections: webpki roots, HTTP/1.1 only.
/// With `skip_tls_verify` any server certificate is accepted.
pub fn upstream_client_config(skip_tls_verify: bool) -> Arc<ClientConfig> {
    let mut config = if skip_tls_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Accepts every server certificate
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_report;
    use crate::tls::ca::DEFAULT_AUTHORITY_VALIDITY;

    fn mitm() -> MitmConfig {
        crate::tls::install_crypto_provider();
        let authority = Authority::generate("tapline", DEFAULT_AUTHORITY_VALIDITY).unwrap();
        MitmConfig::new(Arc::new(authority))
    }

    #[test]
    fn test_server_config() {
        let t = test_report!("Server config has h2+h1 ALPN");
        let config = mitm().server_config_for_host("example.com").unwrap();
        t.assert_eq(
            "ALPN protocols",
            &config.alpn_protocols,
            &vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        );
    }

    #[test]
    fn test_server_config_rejects_bad_host() {
        let t = test_report!("An unusable host name fails instead of downgrading");
        t.assert_true("error", mitm().server_config_for_host("bad host").is_err());
    }

    #[test]
    fn test_upstream_client_is_http1_only() {
        let t = test_report!("Upstream TLS offers HTTP/1.1 only");
        crate::tls::install_crypto_provider();
        t.assert_eq(
            "alpn",
            &upstream_client_config(false).alpn_protocols,
            &vec![b"http/1.1".to_vec()],
        );
        t.assert_eq(
            "alpn insecure",
            &upstream_client_config(true).alpn_protocols,
            &vec![b"http/1.1".to_vec()],
        );
    }
}
