//! Dynamic per-domain certificate resolution for the client-facing TLS
//! acceptor.
//!
//! `rustls::ServerConfig` asks a `ResolvesServerCert` for a certified key at
//! the moment it has parsed the ClientHello's SNI extension, before the
//! handshake continues. This resolver answers from the registry: any domain
//! with a backend that carries `cert`/`key` material gets that material
//! certified; everything else (including domains with no registered backend
//! at all) gets `None`, which `rustls` turns into a handshake failure.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::registry::BackendRegistry;

/// Resolves a `CertifiedKey` from the backend registry by SNI hostname.
pub struct RegistryCertResolver {
    registry: Arc<dyn BackendRegistry>,
    provider: Arc<CryptoProvider>,
}

impl RegistryCertResolver {
    pub fn new(registry: Arc<dyn BackendRegistry>) -> Self {
        Self {
            registry,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    fn certified_key_for(&self, domain: &str) -> Option<CertifiedKey> {
        let backend = self.registry.lookup(domain)?;
        let cert_pem = backend.cert?;
        let key_pem = backend.key?;

        let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .filter_map(Result::ok)
            .collect();
        if certs.is_empty() {
            tracing::warn!(domain, "registered cert material contains no certificates");
            return None;
        }

        let key_der = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .ok()
            .flatten()?;

        let signing_key = self
            .provider
            .key_provider
            .load_private_key(key_der)
            .map_err(|e| tracing::warn!(domain, error = %e, "failed to load private key"))
            .ok()?;

        Some(CertifiedKey::new(certs, signing_key))
    }
}

impl std::fmt::Debug for RegistryCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for RegistryCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let domain = client_hello.server_name()?;
        self.certified_key_for(domain).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Backend, Protocol, Registry};

    fn issue_cert(domain: &str) -> (Vec<u8>, Vec<u8>) {
        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        (
            cert.cert.pem().into_bytes(),
            cert.signing_key.serialize_pem().into_bytes(),
        )
    }

    #[test]
    fn resolves_known_domain_to_certified_key() {
        let registry = Registry::open_temp();
        let (cert_pem, key_pem) = issue_cert("a.example");
        registry
            .upsert(Backend {
                domain: "a.example".to_string(),
                addresses: vec!["127.0.0.1:1".to_string()],
                protocol: Protocol::Http2,
                cert: Some(cert_pem),
                key: Some(key_pem),
                match_headers: Default::default(),
            })
            .unwrap();

        let resolver = RegistryCertResolver::new(registry);
        assert!(resolver.certified_key_for("a.example").is_some());
    }

    #[test]
    fn unregistered_domain_resolves_to_none() {
        let registry = Registry::open_temp();
        let resolver = RegistryCertResolver::new(registry);
        assert!(resolver.certified_key_for("unknown.example").is_none());
    }

    #[test]
    fn domain_without_cert_material_resolves_to_none() {
        let registry = Registry::open_temp();
        registry
            .upsert(Backend {
                domain: "plain.example".to_string(),
                addresses: vec!["127.0.0.1:1".to_string()],
                protocol: Protocol::Http1,
                cert: None,
                key: None,
                match_headers: Default::default(),
            })
            .unwrap();

        let resolver = RegistryCertResolver::new(registry);
        assert!(resolver.certified_key_for("plain.example").is_none());
    }
}
