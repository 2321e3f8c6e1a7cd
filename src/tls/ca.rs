//! Root certificate authority and leaf issuance for MITM

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default lifetime of a generated root
pub const DEFAULT_AUTHORITY_VALIDITY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// A leaf certificate and its freshly generated key
pub struct IssuedCertificate {
    pub hostname: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub not_before: time::OffsetDateTime,
    pub not_after: time::OffsetDateTime,
}

/// The root key and certificate used to sign per-host leaves.
///
/// Immutable once built; share it behind an `Arc`.
pub struct Authority {
    key_pair: KeyPair,
    /// Issuer view of the root, carrying its distinguished name and key id
    issuer: rcgen::Certificate,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    organization: String,
    validity: Duration,
    not_before: time::OffsetDateTime,
    not_after: time::OffsetDateTime,
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority")
            .field("organization", &self.organization)
            .field("validity", &self.validity)
            .finish()
    }
}

fn to_time(d: Duration) -> time::Duration {
    time::Duration::seconds(d.as_secs().min(i64::MAX as u64) as i64)
}

/// `[at - half, at + half]`, or an error when either end leaves the
/// representable date range
fn window(at: time::OffsetDateTime, half: Duration) -> Result<(time::OffsetDateTime, time::OffsetDateTime)> {
    let half = to_time(half);
    let out_of_range = || Error::certificate(format!("validity of {} is out of range", half));
    let not_before = at.checked_sub(half).ok_or_else(out_of_range)?;
    let not_after = at.checked_add(half).ok_or_else(out_of_range)?;
    Ok((not_before, not_after))
}

impl Authority {
    /// Generate a self-signed root valid until `authority_validity` from now.
    ///
    /// The root is backdated by the same amount so leaves issued right away,
    /// whose windows start before their issuance time, still fall inside it.
    pub fn generate(organization: &str, authority_validity: Duration) -> Result<Self> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, organization);
        params
            .distinguished_name
            .push(DnType::OrganizationName, organization);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = time::OffsetDateTime::now_utc()
            .replace_nanosecond(0)
            .map_err(|e| Error::certificate(e.to_string()))?;
        let (not_before, not_after) = window(now, authority_validity)?;
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(e.to_string()))?;

        Ok(Self {
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            issuer: cert,
            key_pair,
            organization: organization.to_string(),
            validity: Duration::from_secs(3600),
            not_before,
            not_after,
        })
    }

    /// Load an existing root from PEM-encoded certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str, organization: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::certificate(format!("Failed to parse CA private key: {}", e)))?;

        let mut cert_reader = BufReader::new(cert_pem.as_bytes());
        let cert_der = rustls_pemfile::certs(&mut cert_reader)
            .filter_map(|r| r.ok())
            .next()
            .ok_or_else(|| Error::certificate("No certificate found in PEM"))?;

        // Re-signing the parsed params yields an issuer with the same subject
        // and key identifier, so leaves chain to the original root
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| Error::certificate(format!("Failed to parse CA certificate: {}", e)))?;
        let (not_before, not_after) = (params.not_before, params.not_after);
        let issuer = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(format!("CA key does not fit certificate: {}", e)))?;

        Ok(Self {
            key_pair,
            issuer,
            cert_der,
            cert_pem: cert_pem.to_string(),
            organization: organization.to_string(),
            validity: Duration::from_secs(3600),
            not_before,
            not_after,
        })
    }

    /// Load an existing root from files
    pub fn from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        organization: &str,
    ) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path.as_ref()).map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA certificate '{}': {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;

        let key_pem = std::fs::read_to_string(key_path.as_ref()).map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA key '{}': {}",
                key_path.as_ref().display(),
                e
            ))
        })?;

        Self::from_pem(&cert_pem, &key_pem, organization)
    }

    /// Half-width of the leaf validity window
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Validity window of the root certificate
    pub fn root_window(&self) -> (time::OffsetDateTime, time::OffsetDateTime) {
        (self.not_before, self.not_after)
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// Write the root certificate and key as PEM; the key file gets mode 0600
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(cert_path.as_ref(), &self.cert_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write certificate to '{}': {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;

        std::fs::write(key_path.as_ref(), self.key_pem()).map_err(|e| {
            Error::certificate(format!(
                "Failed to write key to '{}': {}",
                key_path.as_ref().display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(key_path.as_ref())?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(key_path.as_ref(), perms)?;
        }

        Ok(())
    }

    /// Issue a leaf for `hostname`, valid around the current time
    pub fn issue(&self, hostname: &str) -> Result<IssuedCertificate> {
        self.issue_at(hostname, time::OffsetDateTime::now_utc())
    }

    /// Issue a leaf valid exactly `[now - validity, now + validity]`, with
    /// `now` truncated to whole seconds. Every call generates a new key.
    ///
    /// Fails when that window does not lie inside the root's own window.
    pub fn issue_at(&self, hostname: &str, now: time::OffsetDateTime) -> Result<IssuedCertificate> {
        let host = hostname.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty()
            || !host.is_ascii()
            || host.chars().any(|c| c.is_ascii_whitespace() || c == '/' || c == '@')
        {
            return Err(Error::certificate(format!("Invalid hostname '{}'", hostname)));
        }

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.try_into().map_err(|e| {
                Error::certificate(format!("Invalid hostname '{}': {}", hostname, e))
            })?),
        };

        let now = now
            .replace_nanosecond(0)
            .map_err(|e| Error::certificate(e.to_string()))?;
        let (not_before, not_after) = window(now, self.validity)?;
        if not_before < self.not_before || not_after > self.not_after {
            return Err(Error::certificate(format!(
                "leaf window [{}, {}] for '{}' is outside the authority's [{}, {}]",
                not_before, not_after, host, self.not_before, self.not_after
            )));
        }

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, host);
        params
            .distinguished_name
            .push(DnType::OrganizationName, self.organization.as_str());
        params.subject_alt_names = vec![san];
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.not_before = not_before;
        params.not_after = not_after;

        let leaf_key = KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
        let cert = params
            .signed_by(&leaf_key, &self.issuer, &self.key_pair)
            .map_err(|e| Error::certificate(format!("Failed to sign certificate: {}", e)))?;

        Ok(IssuedCertificate {
            hostname: host.to_string(),
            cert_der: cert.der().clone(),
            key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
            not_before,
            not_after,
        })
    }
}
