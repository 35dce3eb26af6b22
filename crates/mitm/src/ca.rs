//! Persistent certificate authority and short-lived leaf certificates.
//!
//! The CA is generated once and reused across sessions: the container
//! trusts the on-disk certificate at build time, so regenerating it would
//! invalidate every running sandbox. Only the certificate is ever shipped
//! into a container; the private key stays on the trusted side under 0600.

use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result},
    rcgen::{
        BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, SanType,
    },
    time::OffsetDateTime,
    tracing::{debug, info},
};

/// CA validity: 10 years.
const CA_VALIDITY_DAYS: i64 = 365 * 10;
/// Leaf validity: 24 hours.
const LEAF_VALIDITY_HOURS: i64 = 24;

/// A freshly issued leaf certificate for one hostname.
#[derive(Debug, Clone)]
pub struct LeafCert {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
    /// The exact PEM bytes persisted on disk — what containers trust.
    cert_pem: String,
}

impl CertificateAuthority {
    /// Load the CA from `ca_dir`, generating it on first use.
    pub fn load_or_generate(ca_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(ca_dir)
            .with_context(|| format!("failed to create CA directory {}", ca_dir.display()))?;
        let cert_path = ca_dir.join("ca.pem");
        let key_path = ca_dir.join("ca-key.pem");

        if cert_path.exists() && key_path.exists() {
            return Self::load(&cert_path, &key_path);
        }

        info!(dir = %ca_dir.display(), "generating MITM certificate authority");
        let generated = Self::generate()?;
        std::fs::write(&cert_path, &generated.cert_pem)?;
        std::fs::write(&key_path, generated.key.serialize_pem())?;
        restrict_permissions(&key_path)?;
        Ok(generated)
    }

    fn generate() -> Result<Self> {
        let now = OffsetDateTime::now_utc();
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(DnType::CommonName, "IronCurtain MITM CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "IronCurtain");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = now;
        params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);
        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();
        Ok(Self {
            cert,
            key,
            cert_pem,
        })
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)
            .with_context(|| format!("failed to read {}", cert_path.display()))?;
        let key_pem = std::fs::read_to_string(key_path)
            .with_context(|| format!("failed to read {}", key_path.display()))?;
        let key = KeyPair::from_pem(&key_pem).context("failed to parse CA key")?;

        // Rebuild a signing certificate from the persisted parameters. The
        // re-signed copy shares the subject DN and key with the on-disk
        // cert, so leaves it signs chain up to the certificate containers
        // already trust.
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .context("failed to parse CA certificate")?;
        let cert = params.self_signed(&key)?;

        debug!(path = %cert_path.display(), "loaded persistent CA");
        Ok(Self {
            cert,
            key,
            cert_pem,
        })
    }

    /// PEM of the trusted certificate (public material only).
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Issue a ≤24 h leaf with SAN matching `hostname` (DNS name or IP).
    pub fn issue_leaf(&self, hostname: &str) -> Result<LeafCert> {
        let now = OffsetDateTime::now_utc();
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(DnType::CommonName, hostname);
        params.subject_alt_names = vec![match hostname.parse::<std::net::IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(hostname.try_into()?),
        }];
        params.not_before = now;
        params.not_after = now + time::Duration::hours(LEAF_VALIDITY_HOURS);
        let cert = params.signed_by(&key, &self.cert, &self.key)?;

        debug!(hostname, "issued leaf certificate");
        Ok(LeafCert {
            cert_der: cert.der().to_vec(),
            key_der: key.serialize_der(),
        })
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to chmod 600 {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Paths of the persisted CA material.
pub fn ca_paths(ca_dir: &Path) -> (PathBuf, PathBuf) {
    (ca_dir.join("ca.pem"), ca_dir.join("ca-key.pem"))
}
