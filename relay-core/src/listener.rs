//! The accept loop: binds every configured listen address, accepts
//! connections with `FuturesUnordered` across them (same shape as the
//! original single-listener accept loop, generalized to N addresses), and
//! spawns one task per connection that drives it through the
//! ACCEPTED -> HANDSHAKEN -> SELECTED -> TUNNELING -> CLOSED state machine
//! under a single outer deadline.
//!
//! Shutdown is cooperative: a `broadcast` signal tells the loop to stop
//! accepting, then each in-flight connection gets `shutdown_grace_secs` to
//! finish on its own before the process proceeds to exit regardless.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rustls::ServerConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::cert_resolver::RegistryCertResolver;
use crate::error::{ClientError, ProxyError};
use crate::metrics::ProxyMetrics;
use crate::registry::BackendRegistry;
use crate::selector::{select, SelectionOutcome};
use crate::sniffer::{sniff, FIRST_READ_TIMEOUT, SUBSEQUENT_READ_TIMEOUT};
use crate::tunnel::{run_tunnel, UpstreamTlsConnector};
use relay_config::Config;

/// A connection's position in its lifecycle, tracked only for logging and
/// for attributing the outer deadline to a phase when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionStage {
    Accepted,
    Handshaken,
    Selected,
    Tunneling,
}

/// Written verbatim to an HTTP/1 client whose sniffed host matched no
/// backend (or matched one with no usable addresses), per the Select
/// failure row in the connection failure table.
const NOT_FOUND_RESPONSE: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

impl ConnectionStage {
    fn as_str(&self) -> &'static str {
        match self {
            ConnectionStage::Accepted => "accepted",
            ConnectionStage::Handshaken => "handshaken",
            ConnectionStage::Selected => "selected",
            ConnectionStage::Tunneling => "tunneling",
        }
    }
}

/// Runs the proxy's accept loop until `shutdown_rx` fires, then drains
/// in-flight connections for `config.shutdown_grace_secs` before returning.
pub async fn run_proxy(
    config: Arc<Config>,
    registry: Arc<dyn BackendRegistry>,
    upstream_connector: Arc<dyn UpstreamTlsConnector>,
    metrics: Option<Arc<ProxyMetrics>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let tls_config = build_server_config(registry.clone())?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let mut listeners = Vec::new();
    for addr_str in &config.listen_addrs {
        let addr: SocketAddr = addr_str.parse()?;
        info!(%addr, "starting listener");
        listeners.push(TcpListener::bind(addr).await?);
    }

    info!("proxy accept loop running");

    let mut in_flight = FuturesUnordered::new();

    loop {
        let mut accepts = FuturesUnordered::new();
        for listener in &listeners {
            accepts.push(listener.accept());
        }

        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received, draining connections");
                break;
            }
            Some(result) = accepts.next() => {
                match result {
                    Ok((socket, peer_addr)) => {
                        let acceptor = acceptor.clone();
                        let config = config.clone();
                        let registry = registry.clone();
                        let upstream_connector = upstream_connector.clone();
                        let metrics = metrics.clone();
                        in_flight.push(tokio::spawn(async move {
                            handle_connection(socket, peer_addr, acceptor, config, registry, upstream_connector, metrics).await;
                        }));
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!(error = %e, "transient accept error, continuing");
                    }
                    Err(e) => {
                        error!(error = %e, "permanent accept error, stopping accept loop");
                        return Err(Box::new(e));
                    }
                }
            }
            Some(_) = in_flight.next(), if !in_flight.is_empty() => {}
        }
    }

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let drain = async {
        while in_flight.next().await.is_some() {}
    };
    if timeout(grace, drain).await.is_err() {
        warn!(grace_secs = config.shutdown_grace_secs, "shutdown grace period elapsed with connections still open");
    }

    info!("proxy shut down");
    Ok(())
}

/// Distinguishes a transient accept error (worth logging and continuing
/// the accept loop) from a permanent one (the listener's fd is no longer
/// usable; the loop must stop and report upward), per the failure table's
/// "transient vs permanent" accept-error row.
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
    )
}

fn build_server_config(
    registry: Arc<dyn BackendRegistry>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    // `ServerConfig::builder()` uses the process-wide default crypto
    // provider, which must be installed once before first use; harmless to
    // call again if something upstream (e.g. `relay-bin`) already did.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let resolver = Arc::new(RegistryCertResolver::new(registry));
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    config: Arc<Config>,
    registry: Arc<dyn BackendRegistry>,
    upstream_connector: Arc<dyn UpstreamTlsConnector>,
    metrics: Option<Arc<ProxyMetrics>>,
) {
    let start = Instant::now();
    let deadline = Duration::from_secs(config.timeouts.accept_to_tunnel);

    if let Some(m) = &metrics {
        m.connections_active.inc();
    }

    let outcome = timeout(
        deadline,
        drive_connection(socket, &acceptor, &config, &registry, &upstream_connector, metrics.as_deref()),
    )
    .await;

    if let Some(m) = &metrics {
        m.connections_active.dec();
    }

    let elapsed = start.elapsed().as_secs_f64();
    match outcome {
        Ok(Ok(())) => {
            debug!(%peer_addr, duration_secs = elapsed, "connection completed");
            if let Some(m) = &metrics {
                m.connections_total.with_label_values(&["unknown", "success"]).inc();
            }
        }
        Ok(Err((stage, err))) => {
            log_connection_error(&peer_addr, stage, &err, elapsed);
            if let Some(m) = &metrics {
                m.record_error(err.kind());
                m.connections_total
                    .with_label_values(&["unknown", "failure"])
                    .inc();
            }
        }
        Err(_) => {
            warn!(%peer_addr, duration_secs = elapsed, "connection exceeded accept-to-tunnel deadline");
            if let Some(m) = &metrics {
                m.connections_total.with_label_values(&["unknown", "timeout"]).inc();
            }
        }
    }
}

fn log_connection_error(peer_addr: &SocketAddr, stage: ConnectionStage, err: &ProxyError, elapsed: f64) {
    let stage = stage.as_str();
    match err.kind() {
        crate::error::ErrorKind::Client => {
            debug!(%peer_addr, stage, error = %err, duration_secs = elapsed, "client rejected");
        }
        _ => {
            error!(%peer_addr, stage, error = %err, duration_secs = elapsed, "connection error");
        }
    }
}

async fn drive_connection(
    socket: TcpStream,
    acceptor: &TlsAcceptor,
    config: &Arc<Config>,
    registry: &Arc<dyn BackendRegistry>,
    upstream_connector: &Arc<dyn UpstreamTlsConnector>,
    metrics: Option<&ProxyMetrics>,
) -> Result<(), (ConnectionStage, ProxyError)> {
    let handshake_timeout = Duration::from_secs(config.timeouts.client_hello);
    let mut tls_stream = timeout(handshake_timeout, acceptor.accept(socket))
        .await
        .map_err(|_| (ConnectionStage::Accepted, ClientError::SniffTimeout.into()))?
        .map_err(|e| (ConnectionStage::Accepted, ClientError::HandshakeFailed(e.to_string()).into()))?;

    // Sniffing carries its own two-stage deadline (spec.md §4.3), refreshed
    // per read rather than bounded by one flat timeout over the whole
    // multi-read sniff — independent of the TLS handshake deadline above.
    let mut replay = BytesMut::new();
    let sniff_result = sniff(&mut tls_stream, &mut replay, FIRST_READ_TIMEOUT, SUBSEQUENT_READ_TIMEOUT)
        .await
        .map_err(|e| (ConnectionStage::Handshaken, ProxyError::from(e)))?;

    let outcome = select(registry, &sniff_result.authority, sniff_result.protocol_family);
    let backend = match outcome {
        SelectionOutcome::Selected(backend) => backend,
        SelectionOutcome::NotFound | SelectionOutcome::Unconfigured => {
            // Per the Select/NotFound row of the failure table: an HTTP/1
            // client gets a minimal 404-shaped close; an HTTP/2 client just
            // gets the connection closed (writing an unencapsulated body
            // would not be a valid HTTP/2 response without its own stream).
            if sniff_result.protocol_family == crate::sniffer::ProtocolFamily::Http1 {
                let _ = tls_stream.write_all(NOT_FOUND_RESPONSE).await;
                let _ = tls_stream.shutdown().await;
            }
            return Err((
                ConnectionStage::Selected,
                ClientError::UnknownHost(sniff_result.authority).into(),
            ));
        }
    };

    let address = backend
        .addresses
        .first()
        .ok_or_else(|| (ConnectionStage::Selected, ProxyError::Internal("selected backend has no addresses".into())))?;

    let connect_timeout = Duration::from_secs(config.timeouts.connect);
    let upstream = timeout(connect_timeout, upstream_connector.connect(address, &backend.domain))
        .await
        .map_err(|_| (ConnectionStage::Selected, ProxyError::Internal("upstream connect timed out".into())))?
        .map_err(|e| (ConnectionStage::Selected, ProxyError::from(e)))?;

    let idle_timeout = Duration::from_secs(config.timeouts.idle);
    run_tunnel(tls_stream, upstream, replay, idle_timeout, &backend.domain, metrics)
        .await
        .map_err(|e| (ConnectionStage::Tunneling, ProxyError::from(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::tunnel::InsecureUpstreamConnector;
    use rcgen::generate_simple_self_signed;
    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;

    #[test]
    fn accept_error_classification_matches_failure_table() {
        use std::io::{Error, ErrorKind};
        assert!(is_transient_accept_error(&Error::from(ErrorKind::ConnectionAborted)));
        assert!(is_transient_accept_error(&Error::from(ErrorKind::ConnectionReset)));
        assert!(!is_transient_accept_error(&Error::from(ErrorKind::PermissionDenied)));
        assert!(!is_transient_accept_error(&Error::from(ErrorKind::InvalidInput)));
    }

    /// Scenario 5 from the spec's testable properties: a valid SNI match
    /// but a `Host:` header naming a domain nothing is registered for gets
    /// the connection closed, with a 404-shaped response on the HTTP/1
    /// wire (no tunnel, no task left running).
    #[tokio::test]
    async fn host_miss_closes_with_404_on_http1() {
        let sni_domain = "registered.example";
        let cert = generate_simple_self_signed(vec![sni_domain.to_string()]).unwrap();
        let cert_pem = cert.cert.pem().into_bytes();
        let key_pem = cert.signing_key.serialize_pem().into_bytes();

        let registry = Registry::open_temp();
        registry
            .upsert(crate::registry::Backend {
                domain: sni_domain.to_string(),
                addresses: vec!["127.0.0.1:1".to_string()],
                protocol: crate::registry::Protocol::Http1,
                cert: Some(cert_pem.clone()),
                key: Some(key_pem),
                match_headers: Default::default(),
            })
            .unwrap();
        let registry: Arc<dyn BackendRegistry> = registry;

        let server_config = build_server_config(registry.clone()).unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let upstream_connector: Arc<dyn UpstreamTlsConnector> =
            Arc::new(InsecureUpstreamConnector::new());
        let config = Arc::new(relay_config::Config::parse(
            "listen_addrs: []\ntimeouts: {}\nmetrics:\n  enabled: false\n  address: \"127.0.0.1:0\"\nregistry:\n  db_path: \"unused\"\n",
        ).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drive_connection(socket, &acceptor, &config, &registry, &upstream_connector, None).await
        });

        let mut roots = RootCertStore::empty();
        roots
            .add(rustls_pemfile::certs(&mut cert_pem.as_slice()).next().unwrap().unwrap())
            .unwrap();
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));
        let tcp = TcpStream::connect(addr).await.unwrap();
        let server_name = ServerName::try_from(sni_domain.to_string()).unwrap();
        let mut client_tls = connector.connect(server_name, tcp).await.unwrap();

        client_tls
            .write_all(b"GET / HTTP/1.1\r\nHost: unregistered.example\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client_tls.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));

        let outcome = server.await.unwrap();
        assert!(matches!(
            outcome,
            Err((ConnectionStage::Selected, ProxyError::Client(ClientError::UnknownHost(_))))
        ));
    }
}
