//! Resource lock server binary.
//!
//! Serves an in-process lock table over HTTP: callers acquire a named
//! resource for a bounded TTL, receive an ownership token, and release it
//! with that token. Expired locks are treated as absent on every read and
//! are reclaimed by a periodic background sweep.

mod background;
mod config;
mod error;
mod http;
mod locks;
mod logging;
mod manager;
mod status;
mod tls;

use axum::extract::Extension;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};

use crate::background::spawn_lock_sweeper;
use crate::config::{Args, SHUTDOWN_GRACE_SECS};
use crate::http::{build_cors_layer, make_request_span};
use crate::manager::LockManager;

shadow!(build);

/// Starts the lock server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    args.validate()?;
    let manager = Arc::new(LockManager::new(args.ttl_policy()));
    info!(
        default_ttl_ms = args.default_ttl_ms,
        max_ttl_ms = args.max_ttl_ms,
        sweep_interval_secs = args.sweep_interval_secs,
        "lock manager ready"
    );

    let app = build_router(manager.clone(), args.cors_origins.as_deref());

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let https = match args.https_port {
        Some(port) => Some((
            SocketAddr::new(host, port),
            tls::build_rustls_config(&args, host).await?,
        )),
        None => None,
    };
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(
            app.clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        );
    let https_server = async {
        match https {
            Some((https_addr, tls_config)) => {
                info!("Starting HTTPS server at {}", https_addr);
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
            }
            None => std::future::pending().await,
        }
    };

    let sweeper = spawn_lock_sweeper(
        manager,
        Duration::from_secs(args.sweep_interval_secs),
    );
    let result = tokio::select! {
        result = http_server => result,
        result = https_server => result,
        _ = shutdown_signal(handle.clone()) => Ok(()),
    };
    sweeper.abort();
    info!("lock sweeper stopped");

    result
}

/// 组装锁服务路由与中间件。
fn build_router(manager: Arc<LockManager>, cors_origins: Option<&str>) -> Router {
    let app = Router::new()
        .route("/api/locks", get(locks::list_locks))
        .route("/api/locks/acquire", post(locks::acquire_lock))
        .route("/api/locks/release", post(locks::release_lock))
        .route("/api/locks/extend", post(locks::extend_lock))
        .route("/api/locks/info/{resource}", get(locks::get_lock_info))
        .route(
            "/api/locks/client/{client_id}",
            delete(locks::release_client_locks),
        )
        .route("/api/locks/stats", get(locks::get_lock_stats))
        .route("/api/status", get(status::get_status))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(make_request_span)
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(manager));

    match build_cors_layer(cors_origins) {
        Some(cors_layer) => app.layer(cors_layer),
        None => app,
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
