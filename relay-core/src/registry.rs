//! The backend registry: an in-memory read cache (`DashMap`) backed by a
//! persistent embedded store (`sled`), mirroring the original
//! implementation's storm-over-boltdb layout — one namespace keyed by
//! backend domain, one keyed by keypair name.
//!
//! Lookups never touch the store; they're served from the cache, which is
//! populated at `open()` and kept in sync on every write. This gives the
//! O(1)-ish lookup the spec asks for without a caching layer sitting in
//! front of a "real" backend (there is no second source of truth to go
//! stale against).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::RegistryError;

const BACKENDS_TREE: &[u8] = b"backends";
const KEYPAIRS_TREE: &[u8] = b"keypairs";
const SERVER_KEYPAIR_NAME: &str = "server";

/// The application protocol a backend expects to speak.
///
/// `Grpc` is a specialization of `Http2` for selection purposes: a client
/// sniffed as HTTP/2 may be routed to either an `Http2` or a `Grpc` backend,
/// but never to an `Http1` one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    Http1 = 0,
    Http2 = 1,
    Grpc = 2,
}

// `spec.md` §6 requires the wire/storage form to carry `protocol` as its
// integer discriminant, not its variant name, so this is hand-written
// rather than `#[derive(Serialize, Deserialize)]` (which would emit the
// bare enum as a JSON string).
impl Serialize for Protocol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = u8::deserialize(deserializer)?;
        match tag {
            0 => Ok(Protocol::Http1),
            1 => Ok(Protocol::Http2),
            2 => Ok(Protocol::Grpc),
            other => Err(serde::de::Error::custom(format!(
                "unknown protocol tag {other}"
            ))),
        }
    }
}

impl Protocol {
    /// Protocols sniffing an HTTP/1 request may be routed to.
    pub fn http1_set() -> &'static [Protocol] {
        &[Protocol::Http1]
    }

    /// Protocols sniffing an HTTP/2 connection (including gRPC) may be
    /// routed to.
    pub fn http2_set() -> &'static [Protocol] {
        &[Protocol::Http2, Protocol::Grpc]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http1",
            Protocol::Http2 => "http2",
            Protocol::Grpc => "grpc",
        }
    }
}

/// A registered upstream backend, keyed uniquely by `domain`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub domain: String,
    /// Ordered `host:port` addresses. Only `addresses[0]` is dialed today
    /// (no load balancing); ordering is otherwise significant for a future
    /// selection layer.
    pub addresses: Vec<String>,
    pub protocol: Protocol,
    /// PEM-encoded X.509 leaf certificate, required if `protocol` is
    /// `Http2` or `Grpc`.
    pub cert: Option<Vec<u8>>,
    /// PEM-encoded private key paired with `cert`.
    pub key: Option<Vec<u8>>,
    /// Reserved for future header-based matching; selection ignores this
    /// today (see spec Open Question).
    #[serde(default)]
    pub match_headers: std::collections::HashMap<String, String>,
}

impl Backend {
    /// A backend is selectable only if it has at least one address.
    pub fn is_selectable(&self) -> bool {
        !self.addresses.is_empty()
    }

    /// `protocol in {Http2, Grpc}` requires both cert and key to be
    /// present; this does not validate that they form a parseable keypair
    /// (that's the `CertResolver`'s job, at handshake time).
    pub fn has_required_tls_material(&self) -> bool {
        match self.protocol {
            Protocol::Http1 => true,
            Protocol::Http2 | Protocol::Grpc => self.cert.is_some() && self.key.is_some(),
        }
    }
}

/// Merges two address lists per the registry's only normalization policy:
/// union, trim whitespace, dedupe, sort lexicographically.
fn merge_addresses(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut combined: Vec<String> = existing
        .iter()
        .chain(incoming.iter())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    combined.sort();
    combined.dedup();
    combined
}

/// A process-wide asymmetric keypair, generated once and persisted.
///
/// This is the identity the (out-of-scope) administrative RPC channel would
/// authenticate with; the registry's only responsibility toward it is to
/// guarantee the `"server"` entry exists before anything else runs, and to
/// never mutate it afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerKeypair {
    pub name: String,
    /// DER-encoded public key.
    pub public_key: Vec<u8>,
    /// PEM-encoded private key.
    pub private_key_pem: String,
}

impl ServerKeypair {
    fn generate(name: &str) -> Result<Self, RegistryError> {
        let keypair = rcgen::KeyPair::generate()
            .map_err(|e| RegistryError::Store(format!("keypair generation failed: {e}")))?;
        Ok(ServerKeypair {
            name: name.to_string(),
            public_key: keypair.public_key_der(),
            private_key_pem: keypair.serialize_pem(),
        })
    }
}

/// The registry's read/write contract.
///
/// All lookups are safe to call concurrently with each other and with
/// writes; an `upsert`/`delete` observed-after by a `lookup` always returns
/// the new state (there is no caching layer to go stale between a write and
/// a subsequent read of the *same* registry instance).
pub trait BackendRegistry: Send + Sync {
    fn lookup(&self, domain: &str) -> Option<Backend>;
    fn lookup_by(&self, domain: &str, protocols: &[Protocol]) -> Option<Backend>;
    fn upsert(&self, backend: Backend) -> Result<(), RegistryError>;
    fn delete(&self, domain: &str) -> Result<(), RegistryError>;
    fn iter(&self) -> Vec<Backend>;
}

/// `sled`-backed implementation of `BackendRegistry`.
pub struct Registry {
    db: sled::Db,
    backends: sled::Tree,
    keypairs: sled::Tree,
    cache: DashMap<String, Backend>,
}

impl Registry {
    /// Opens (creating if absent) the embedded store at `path`, loads the
    /// backend cache, and ensures the named `ServerKeypair` exists —
    /// generating and persisting one if it does not, per the persisted
    /// state layout contract.
    pub fn open(path: &str, keypair_name: &str) -> Result<Arc<Self>, RegistryError> {
        let db = sled::open(path)?;
        let backends = db.open_tree(BACKENDS_TREE)?;
        let keypairs = db.open_tree(KEYPAIRS_TREE)?;

        let cache = DashMap::new();
        for entry in backends.iter() {
            let (key, value) = entry?;
            let domain = String::from_utf8_lossy(&key).to_string();
            match serde_json::from_slice::<Backend>(&value) {
                Ok(backend) => {
                    cache.insert(domain, backend);
                }
                Err(e) => {
                    tracing::error!(domain, error = %e, "dropping malformed persisted backend record");
                }
            }
        }

        let registry = Arc::new(Self {
            db,
            backends,
            keypairs,
            cache,
        });
        registry.ensure_server_keypair(keypair_name)?;
        Ok(registry)
    }

    /// Opens a registry backed by a temporary, process-local store.
    /// Used by integration tests that don't need persistence across runs.
    #[cfg(test)]
    pub fn open_temp() -> Arc<Self> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.sled");
        // Leak the tempdir so it outlives the returned registry; tests are
        // short-lived processes, this is not a long-running leak.
        std::mem::forget(dir);
        Self::open(path.to_str().unwrap(), SERVER_KEYPAIR_NAME).expect("open temp registry")
    }

    fn ensure_server_keypair(&self, name: &str) -> Result<(), RegistryError> {
        if self.keypairs.contains_key(name)? {
            return Ok(());
        }
        tracing::info!(name, "generating process keypair, none persisted yet");
        let keypair = ServerKeypair::generate(name)?;
        let encoded = serde_json::to_vec(&keypair)
            .map_err(|e| RegistryError::Store(format!("keypair encode failed: {e}")))?;
        self.keypairs.insert(name, encoded)?;
        self.keypairs.flush()?;
        Ok(())
    }

    /// Returns the named keypair, if persisted. Exposed for completeness —
    /// the core never reads this itself past startup.
    pub fn keypair(&self, name: &str) -> Result<Option<ServerKeypair>, RegistryError> {
        match self.keypairs.get(name)? {
            Some(bytes) => {
                let kp = serde_json::from_slice(&bytes)
                    .map_err(|e| RegistryError::Store(format!("keypair decode failed: {e}")))?;
                Ok(Some(kp))
            }
            None => Ok(None),
        }
    }
}

impl BackendRegistry for Registry {
    fn lookup(&self, domain: &str) -> Option<Backend> {
        self.cache.get(domain).map(|entry| entry.value().clone())
    }

    fn lookup_by(&self, domain: &str, protocols: &[Protocol]) -> Option<Backend> {
        self.cache.get(domain).and_then(|entry| {
            let backend = entry.value();
            if protocols.contains(&backend.protocol) {
                Some(backend.clone())
            } else {
                None
            }
        })
    }

    fn upsert(&self, mut backend: Backend) -> Result<(), RegistryError> {
        if let Some(existing) = self.cache.get(&backend.domain) {
            backend.addresses = merge_addresses(&existing.addresses, &backend.addresses);
        } else {
            backend.addresses = merge_addresses(&[], &backend.addresses);
        }

        let encoded = serde_json::to_vec(&backend)
            .map_err(|e| RegistryError::Store(format!("backend encode failed: {e}")))?;
        self.backends.insert(backend.domain.as_bytes(), encoded)?;
        self.backends.flush()?;
        self.cache.insert(backend.domain.clone(), backend);
        Ok(())
    }

    fn delete(&self, domain: &str) -> Result<(), RegistryError> {
        self.backends.remove(domain.as_bytes())?;
        self.backends.flush()?;
        self.cache.remove(domain);
        Ok(())
    }

    fn iter(&self) -> Vec<Backend> {
        self.cache.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_backend(domain: &str) -> Backend {
        Backend {
            domain: domain.to_string(),
            addresses: vec!["127.0.0.1:9001".to_string()],
            protocol: Protocol::Http1,
            cert: None,
            key: None,
            match_headers: Default::default(),
        }
    }

    #[test]
    fn merge_addresses_dedupes_trims_and_sorts() {
        let existing = vec!["b:1".to_string(), " a:1 ".to_string()];
        let incoming = vec!["a:1".to_string(), "c:1".to_string(), "  ".to_string()];
        let merged = merge_addresses(&existing, &incoming);
        assert_eq!(merged, vec!["a:1".to_string(), "b:1".to_string(), "c:1".to_string()]);
    }

    #[test]
    fn read_your_writes() {
        let registry = Registry::open_temp();
        let backend = sample_backend("a.example");
        registry.upsert(backend.clone()).unwrap();
        let found = registry.lookup("a.example").unwrap();
        assert_eq!(found.domain, "a.example");
        assert_eq!(found.addresses, vec!["127.0.0.1:9001".to_string()]);
    }

    #[test]
    fn delete_then_lookup_is_not_found() {
        let registry = Registry::open_temp();
        registry.upsert(sample_backend("a.example")).unwrap();
        registry.delete("a.example").unwrap();
        assert!(registry.lookup("a.example").is_none());
    }

    #[test]
    fn idempotent_upsert() {
        let registry = Registry::open_temp();
        let backend = sample_backend("a.example");
        registry.upsert(backend.clone()).unwrap();
        registry.upsert(backend.clone()).unwrap();
        let found = registry.lookup("a.example").unwrap();
        assert_eq!(found.addresses, vec!["127.0.0.1:9001".to_string()]);
    }

    #[test]
    fn upsert_unions_and_sorts_addresses() {
        let registry = Registry::open_temp();
        let mut first = sample_backend("a.example");
        first.addresses = vec!["10.0.0.2:80".to_string()];
        registry.upsert(first).unwrap();

        let mut second = sample_backend("a.example");
        second.addresses = vec!["10.0.0.1:80".to_string(), "10.0.0.2:80".to_string()];
        registry.upsert(second).unwrap();

        let found = registry.lookup("a.example").unwrap();
        assert_eq!(
            found.addresses,
            vec!["10.0.0.1:80".to_string(), "10.0.0.2:80".to_string()]
        );
    }

    #[test]
    fn lookup_by_restricts_protocol_set() {
        let registry = Registry::open_temp();
        let mut backend = sample_backend("a.example");
        backend.protocol = Protocol::Grpc;
        backend.cert = Some(b"cert".to_vec());
        backend.key = Some(b"key".to_vec());
        registry.upsert(backend).unwrap();

        assert!(registry.lookup_by("a.example", Protocol::http2_set()).is_some());
        assert!(registry.lookup_by("a.example", Protocol::http1_set()).is_none());
    }

    #[test]
    fn unconfigured_backend_has_no_addresses() {
        let mut backend = sample_backend("a.example");
        backend.addresses.clear();
        assert!(!backend.is_selectable());
    }

    #[test]
    fn http2_backend_requires_tls_material() {
        let mut backend = sample_backend("a.example");
        backend.protocol = Protocol::Http2;
        assert!(!backend.has_required_tls_material());
        backend.cert = Some(b"cert".to_vec());
        backend.key = Some(b"key".to_vec());
        assert!(backend.has_required_tls_material());
    }

    #[test]
    fn server_keypair_is_provisioned_on_open() {
        let registry = Registry::open_temp();
        let kp = registry.keypair(SERVER_KEYPAIR_NAME).unwrap();
        assert!(kp.is_some());
    }

    #[test]
    fn backend_roundtrips_through_json_with_integer_protocol_tag() {
        let mut backend = sample_backend("a.example");
        backend.protocol = Protocol::Grpc;
        let encoded = serde_json::to_value(&backend).unwrap();
        assert_eq!(encoded["protocol"], 2);
        let decoded: Backend = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, backend);
    }
}
