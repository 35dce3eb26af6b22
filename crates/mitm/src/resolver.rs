//! SNI-driven server certificate resolution backed by the CA.
//!
//! Leaves are generated on demand, cached for the session, and warmed at
//! startup for all configured provider hosts so the first request does not
//! pay the generation cost.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use {
    anyhow::{Context, Result},
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
        server::{ClientHello, ResolvesServerCert},
        sign::CertifiedKey,
    },
    tracing::{debug, warn},
};

use crate::ca::CertificateAuthority;

pub struct SniCertResolver {
    ca: Arc<CertificateAuthority>,
    cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl SniCertResolver {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            ca,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Pre-generate leaves for the given hosts.
    pub fn warm(&self, hosts: &[&str]) {
        for host in hosts {
            if let Err(e) = self.certified_key_for(host) {
                warn!(host, error = %e, "failed to warm leaf certificate");
            }
        }
    }

    fn certified_key_for(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(cached) = self
            .cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(host).cloned())
        {
            return Ok(cached);
        }

        let leaf = self.ca.issue_leaf(host)?;
        let key = rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
            PrivatePkcs8KeyDer::from(leaf.key_der),
        ))
        .context("unsupported leaf key type")?;
        let certified = Arc::new(CertifiedKey::new(
            vec![CertificateDer::from(leaf.cert_der)],
            key,
        ));

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(host.to_string(), Arc::clone(&certified));
        }
        debug!(host, "leaf certificate cached");
        Ok(certified)
    }
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name()?;
        match self.certified_key_for(host) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(host, error = %e, "failed to issue leaf for SNI");
                None
            },
        }
    }
}
