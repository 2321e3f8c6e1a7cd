//! TLS and certificate management

mod ca;
mod mitm;

pub use ca::{Authority, IssuedCertificate, DEFAULT_AUTHORITY_VALIDITY};
pub use mitm::{upstream_client_config, MitmConfig, HANDSHAKE_TIMEOUT};

/// Make aws-lc-rs the process-wide rustls provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
