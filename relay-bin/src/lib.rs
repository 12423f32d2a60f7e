//! Process entry point: logging setup, config loading, registry opening,
//! metrics server, graceful shutdown coordination, and handing off to
//! `relay_core::run_proxy`.

use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry as PrometheusRegistry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use relay_config::Config;
use relay_core::{run_proxy, InsecureUpstreamConnector, ProxyMetrics, Registry};

/// Loads configuration from `config_path`, opens the registry, and runs the
/// proxy until it receives Ctrl-C, draining in-flight connections for
/// `shutdown_grace_secs` afterward.
pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error>> {
    // Required because both ring and aws-lc-rs crypto provider features are
    // reachable through rustls' default features; without an explicit
    // install, the first `ServerConfig`/`ClientConfig` builder call panics.
    let _ = rustls::crypto::ring::default_provider().install_default();

    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("relay=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    let config = Arc::new(Config::from_file(config_path)?);
    let registry = Registry::open(&config.registry.db_path, &config.registry.keypair_name)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    let (_prom_registry, metrics, metrics_handle) = if config.metrics.enabled {
        let prom_registry = PrometheusRegistry::new();
        let metrics = Arc::new(ProxyMetrics::new(&prom_registry));
        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        let metrics_listener = TcpListener::bind(metrics_addr).await?;
        info!(%metrics_addr, "metrics server listening");

        let mut shutdown_rx_clone = shutdown_tx.subscribe();
        let prom_registry_clone = prom_registry.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx_clone.recv() => {
                        info!("metrics server shutting down");
                        break;
                    }
                    result = metrics_listener.accept() => {
                        if let Ok((stream, _)) = result {
                            let registry = prom_registry_clone.clone();
                            let io = TokioIo::new(stream);
                            tokio::spawn(async move {
                                let service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                                    let registry = registry.clone();
                                    async move { Ok::<_, String>(serve_metrics_request(req, &registry)) }
                                });
                                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                                    warn!(error = %err, "metrics connection error");
                                }
                            });
                        }
                    }
                }
            }
        });

        (Some(prom_registry), Some(metrics), Some(handle))
    } else {
        (None, None, None)
    };

    let upstream_connector = Arc::new(InsecureUpstreamConnector::new());

    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    let proxy_result = run_proxy(config.clone(), registry, upstream_connector, metrics, shutdown_rx).await;

    if let Some(handle) = metrics_handle {
        info!("waiting for metrics server to shut down");
        let _ = handle.await;
    }

    proxy_result
}

fn serve_metrics_request(
    req: Request<hyper::body::Incoming>,
    registry: &PrometheusRegistry,
) -> Response<Full<bytes::Bytes>> {
    match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();
            if encoder.encode(&metric_families, &mut buffer).is_err() {
                return Response::new(Full::new(bytes::Bytes::from_static(b"encoding error")));
            }
            Response::new(Full::new(bytes::Bytes::from(buffer)))
        }
        "/health" => Response::new(Full::new(bytes::Bytes::from_static(
            br#"{"status":"healthy","service":"relay"}"#,
        ))),
        _ => Response::new(Full::new(bytes::Bytes::from_static(br#"{"error":"not_found"}"#))),
    }
}
