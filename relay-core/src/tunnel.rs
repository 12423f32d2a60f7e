//! The tunnel: once a backend is selected, the proxy dials it over its own
//! TLS connection (re-encrypting, not passing through the client's TLS
//! record layer) and copies bytes in both directions until either side
//! closes or goes idle too long.
//!
//! The replay buffer collected during sniffing is written to the upstream
//! connection first, verbatim, before the steady-state copy loop begins —
//! the upstream must see exactly what the client sent the sniffer, byte
//! for byte.

use std::sync::Arc;

use bytes::BytesMut;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::UpstreamError;
use crate::metrics::ProxyMetrics;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Dials an upstream `host:port` and returns a TLS-wrapped stream.
///
/// Implementations are free to verify the upstream's certificate or not;
/// the default ([`InsecureUpstreamConnector`]) does not, matching the
/// legacy behavior this proxy's upstream leg preserves (see the Design
/// Notes on certificate verification toward backends).
#[async_trait::async_trait]
pub trait UpstreamTlsConnector: Send + Sync {
    async fn connect(
        &self,
        addr: &str,
        sni: &str,
    ) -> Result<TlsStream<TcpStream>, UpstreamError>;
}

/// Accepts any certificate chain the upstream presents, performing no
/// hostname or trust-chain validation whatsoever.
pub struct InsecureUpstreamConnector {
    config: Arc<ClientConfig>,
}

impl InsecureUpstreamConnector {
    pub fn new() -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("default protocol versions are always valid")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for InsecureUpstreamConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl UpstreamTlsConnector for InsecureUpstreamConnector {
    async fn connect(&self, addr: &str, sni: &str) -> Result<TlsStream<TcpStream>, UpstreamError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| UpstreamError::DialFailed(format!("{addr}: {e}")))?;
        let server_name = ServerName::try_from(sni.to_string())
            .map_err(|e| UpstreamError::DialFailed(format!("invalid upstream SNI {sni}: {e}")))?;
        let connector = TlsConnector::from(self.config.clone());
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| UpstreamError::DialFailed(format!("{addr}: {e}")))
    }
}

#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

/// Writes `replay` to `upstream` then copies bytes bidirectionally between
/// `client` and `upstream`, refreshing the idle deadline on every successful
/// read. A half-close (EOF) or error on either direction ends the whole
/// tunnel immediately — the proxy does not propagate TCP half-close, it
/// tears down both directions together (spec §4.5).
pub async fn run_tunnel<C, U>(
    mut client: C,
    mut upstream: U,
    replay: BytesMut,
    idle_timeout: Duration,
    domain: &str,
    metrics: Option<&ProxyMetrics>,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    if !replay.is_empty() {
        upstream.write_all(&replay).await?;
    }

    let (mut client_read, mut client_write) = io::split(&mut client);
    let (mut upstream_read, mut upstream_write) = io::split(&mut upstream);

    let client_to_upstream = async {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = timeout(idle_timeout, client_read.read(&mut buf)).await??;
            if n == 0 {
                return Ok::<_, io::Error>(());
            }
            upstream_write.write_all(&buf[..n]).await?;
            if let Some(metrics) = metrics {
                metrics
                    .bytes_transferred
                    .with_label_values(&[domain, "upstream"])
                    .inc_by(n as u64);
            }
        }
    };

    let upstream_to_client = async {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = timeout(idle_timeout, upstream_read.read(&mut buf)).await??;
            if n == 0 {
                return Ok::<_, io::Error>(());
            }
            client_write.write_all(&buf[..n]).await?;
            if let Some(metrics) = metrics {
                metrics
                    .bytes_transferred
                    .with_label_values(&[domain, "client"])
                    .inc_by(n as u64);
            }
        }
    };

    // `select!` rather than `try_join!`: the first direction to finish
    // (EOF or error) ends the tunnel right away. The loser is simply
    // dropped, which closes its half of each split stream — there is no
    // TCP half-close propagation here, both legs go down together.
    let result = tokio::select! {
        r = client_to_upstream => r,
        r = upstream_to_client => r,
    };
    let _ = upstream_write.shutdown().await;
    let _ = client_write.shutdown().await;
    result
}
