//! Error taxonomy for the proxy core.
//!
//! Five categories, matching the connection lifecycle: configuration
//! problems discovered at startup or during steady-state registry access,
//! client misbehavior, upstream failures, registry I/O failures, and
//! internal invariant violations. None of these cause a connection task to
//! panic; `handle_connection` always converts them into a log line at the
//! prescribed level and closes the connection.

use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    MissingKeypair(String),
    InvalidCertificate(String),
    MalformedRecord(String),
    StoreOpenFailed(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingKeypair(name) => write!(f, "missing keypair: {name}"),
            ConfigError::InvalidCertificate(detail) => {
                write!(f, "invalid TLS material: {detail}")
            }
            ConfigError::MalformedRecord(detail) => write!(f, "malformed persisted record: {detail}"),
            ConfigError::StoreOpenFailed(detail) => write!(f, "store open failed: {detail}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug)]
pub enum ClientError {
    HandshakeFailed(String),
    SniffTimeout,
    Malformed(String),
    ClientClosed,
    UnknownHost(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::HandshakeFailed(detail) => write!(f, "TLS handshake failed: {detail}"),
            ClientError::SniffTimeout => write!(f, "sniff timeout"),
            ClientError::Malformed(detail) => write!(f, "malformed client preamble: {detail}"),
            ClientError::ClientClosed => write!(f, "client closed before sniffing completed"),
            ClientError::UnknownHost(host) => write!(f, "no backend for host: {host}"),
        }
    }
}

impl std::error::Error for ClientError {}

#[derive(Debug)]
pub enum UpstreamError {
    DialFailed(String),
    Io(std::io::Error),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::DialFailed(detail) => write!(f, "upstream dial failed: {detail}"),
            UpstreamError::Io(e) => write!(f, "upstream I/O error: {e}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<std::io::Error> for UpstreamError {
    fn from(e: std::io::Error) -> Self {
        UpstreamError::Io(e)
    }
}

#[derive(Debug)]
pub enum RegistryError {
    Store(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Store(detail) => write!(f, "registry store error: {detail}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<sled::Error> for RegistryError {
    fn from(e: sled::Error) -> Self {
        RegistryError::Store(e.to_string())
    }
}

/// The unified error type threaded through a single connection's handling.
#[derive(Debug)]
pub enum ProxyError {
    Config(ConfigError),
    Client(ClientError),
    Upstream(UpstreamError),
    Registry(RegistryError),
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Config(e) => write!(f, "{e}"),
            ProxyError::Client(e) => write!(f, "{e}"),
            ProxyError::Upstream(e) => write!(f, "{e}"),
            ProxyError::Registry(e) => write!(f, "{e}"),
            ProxyError::Internal(detail) => write!(f, "internal error: {detail}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<ConfigError> for ProxyError {
    fn from(e: ConfigError) -> Self {
        ProxyError::Config(e)
    }
}

impl From<ClientError> for ProxyError {
    fn from(e: ClientError) -> Self {
        ProxyError::Client(e)
    }
}

impl From<UpstreamError> for ProxyError {
    fn from(e: UpstreamError) -> Self {
        ProxyError::Upstream(e)
    }
}

impl From<RegistryError> for ProxyError {
    fn from(e: RegistryError) -> Self {
        ProxyError::Registry(e)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Upstream(UpstreamError::Io(e))
    }
}

/// Which taxonomy bucket an error falls in, used only to pick a log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Client,
    Upstream,
    Registry,
    Internal,
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Config(_) => ErrorKind::Config,
            ProxyError::Client(_) => ErrorKind::Client,
            ProxyError::Upstream(_) => ErrorKind::Upstream,
            ProxyError::Registry(_) => ErrorKind::Registry,
            ProxyError::Internal(_) => ErrorKind::Internal,
        }
    }
}
