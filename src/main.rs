mod annotations;
mod config;
mod decider;
mod handlers;
mod health;
mod metrics;
mod patch;
mod sidecar;
mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use prometheus_client::registry::Registry;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::decider::MutationDecider;
use crate::sidecar::FsConfigSource;

#[derive(Parser)]
#[command(name = "sidecar-injector", about = "Kubernetes sidecar injection webhook")]
struct Cli {
    /// Path to the settings file
    #[arg(long, default_value = "/etc/sidecar-injector/injector.yaml", env = "INJECTOR_CONFIG")]
    config: String,
}

async fn wait_for_termination() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl_c");
        "CTRL+C"
    }
}

async fn serve_tls_connection(
    acceptor: TlsAcceptor,
    router: Router,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, "TLS handshake failed: {e}");
            return;
        }
    };

    let service = TowerToHyperService::new(router.into_service());
    if let Err(e) = HttpBuilder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        error!(%peer, "webhook connection failed: {e}");
    }
}

async fn serve_webhook(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_tls_connection(
                        acceptor.clone(),
                        router.clone(),
                        stream,
                        peer,
                    ));
                }
                Err(e) => error!("failed to accept webhook connection: {e}"),
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    info!("webhook listener stopped");
}

async fn serve_health(listener: TcpListener, router: Router, mut shutdown_rx: watch::Receiver<()>) {
    let stopped = async move {
        let _ = shutdown_rx.changed().await;
    };
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(stopped)
        .await
    {
        error!("health and metrics server failed: {e}");
    }
    info!("health and metrics server stopped");
}

async fn bind(name: &str, addr: SocketAddr) -> TcpListener {
    TcpListener::bind(addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {name} on {addr}: {e}");
        std::process::exit(1);
    })
}

fn parse_addr(name: &str, value: &str) -> SocketAddr {
    value.parse().unwrap_or_else(|e| {
        eprintln!("Invalid {name} '{value}': {e}");
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    let cli = Cli::parse();

    let config = config::InjectorConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load settings from {}: {e}", cli.config);
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        config_dir = %config.config_dir,
        injection.marker = %config.injection.annotation_marker,
        injection.file_annotation = %config.injection.file_annotation,
        injection.ignored_namespaces = ?config.injection.ignored_namespaces,
        "sidecar-injector starting"
    );

    let listen_addr = parse_addr("listen_addr", &config.listen_addr);
    let metrics_addr = parse_addr("metrics_addr", &config.metrics_addr);

    let tls_config = tls::server_config(&config.tls_cert_path, &config.tls_key_path)
        .unwrap_or_else(|e| {
            eprintln!("Failed to load TLS config: {e}");
            std::process::exit(1);
        });
    let tls_acceptor = TlsAcceptor::from(tls_config);

    let mut registry = Registry::default();
    let injector_metrics = metrics::InjectorMetrics::new(&mut registry);

    let decider = MutationDecider::new(
        config.injection.settings(),
        Arc::new(FsConfigSource::new(&config.config_dir)),
    );

    let app_state = Arc::new(handlers::AppState {
        decider,
        metrics: injector_metrics,
    });

    let webhook_router = Router::new()
        .route("/mutate", post(handlers::handle_mutate))
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .with_state(app_state);

    let listening = Arc::new(AtomicBool::new(false));
    let health_router = health::router(Arc::new(health::HealthState {
        registry: Arc::new(registry),
        webhook_listening: listening.clone(),
    }));

    let webhook_listener = bind("listen_addr", listen_addr).await;
    let health_listener = bind("metrics_addr", metrics_addr).await;
    info!(%listen_addr, %metrics_addr, "listeners bound");
    listening.store(true, Ordering::Relaxed);

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        let signal = wait_for_termination().await;
        info!(signal, "starting graceful shutdown");
        let _ = shutdown_tx.send(());
    });

    tokio::join!(
        serve_webhook(
            webhook_listener,
            tls_acceptor,
            webhook_router,
            shutdown_rx.clone()
        ),
        serve_health(health_listener, health_router, shutdown_rx),
    );

    info!("sidecar-injector shut down gracefully");
}
