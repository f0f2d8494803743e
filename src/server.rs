use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Local;
use futures::FutureExt;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::access_log::AccessLogger;
use crate::cache::{CacheOptions, FileCache};
use crate::config::Config;
use crate::metrics;
use crate::origin::OriginClient;
use crate::ratelimit::{self, RateLimiter};
use crate::serve;

pub struct AppState {
    cfg: Arc<Config>,
    cache: Arc<FileCache>,
    ratelimiter: RateLimiter,
    access_logger: Option<AccessLogger>,
}

/// Bind the configured address, install signal handlers, and serve until
/// shutdown. This is the production entry; tests drive `run_with` on an
/// ephemeral listener instead.
pub async fn run(cfg: Arc<Config>) -> Result<()> {
    let listener = bind(&cfg.listen).await?;
    log::info!("server: listen on {}", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);

    run_with(listener, cfg, shutdown_rx).await
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    let socket_addr: SocketAddr = bind_addr.parse().context("parse Listen address")?;
    TcpListener::bind(socket_addr).await.context("bind tcp")
}

/// Accept loop plus teardown: once the shutdown channel fires, stop
/// accepting and close the cache (bounded invalidator join; a timeout is
/// logged and shutdown proceeds).
pub async fn run_with(
    listener: TcpListener,
    cfg: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let state = Arc::new(build_state(cfg)?);
    log::info!(
        "cache: origin {} (max {} items / {} MiB, revalidate every {:?})",
        state.cfg.origin,
        state.cfg.cache.max_items,
        state.cfg.cache.max_size / (1024 * 1024),
        state.cfg.cache.revalidate_period,
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept tcp")?;
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "-".to_string());
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        handle(req, Arc::clone(&state), peer.clone())
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("http connection error: {err}");
                    }
                });
            }
        }
    }

    log::info!("server: shutting down");
    if let Err(err) = state.cache.close().await {
        log::error!("{err}");
    }
    Ok(())
}

fn build_state(cfg: Arc<Config>) -> Result<AppState> {
    let origin = OriginClient::new(&cfg.origin);
    let cache = FileCache::new(
        origin,
        CacheOptions {
            max_items: cfg.cache.max_items,
            max_size: cfg.cache.max_size,
            revalidate_period: cfg.cache.revalidate_period,
        },
    );
    let access_logger = if cfg.access_log.enabled {
        let path = Some(cfg.access_log.path.as_str()).filter(|p| !p.is_empty());
        Some(AccessLogger::new(path).context("init access log")?)
    } else {
        None
    };
    Ok(AppState {
        cfg,
        cache,
        ratelimiter: RateLimiter::new(),
        access_logger,
    })
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                if let Some(sig) = sigterm.as_mut() {
                    let _ = sig.recv().await;
                }
            } => {}
        }
        let _ = shutdown.send(true);
    });
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
    peer: String,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().to_string();
    let client = ratelimit::client_key(req.headers(), &peer);

    let resp = match AssertUnwindSafe(dispatch(req, &state, &client))
        .catch_unwind()
        .await
    {
        Ok(resp) => resp,
        Err(_) => {
            log::error!("server: panic while handling {method} {uri}");
            serve::text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    };

    metrics::record(resp.status());
    log_access(&state, &client, &method, &uri, &resp, start);
    Ok(resp)
}

async fn dispatch(
    req: Request<Incoming>,
    state: &AppState,
    client: &str,
) -> Response<Full<Bytes>> {
    // internal endpoints resolve before the cache and shadow same-named
    // origin paths
    match req.uri().path() {
        "/metrics" => return serve::text_response(StatusCode::OK, &metrics::render()),
        "/version" => return json_response(&build_info()),
        _ => {}
    }

    if !state.ratelimiter.take(client) {
        log::debug!("server: rate-limited {client}");
        metrics::record_ratelimited();
        return serve::text_response(StatusCode::TOO_MANY_REQUESTS, "too many requests");
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    serve::handle(&state.cache, &method, &path, req.headers()).await
}

fn log_access(
    state: &AppState,
    client: &str,
    method: &http::Method,
    uri: &str,
    resp: &Response<Full<Bytes>>,
    start: Instant,
) {
    let logger = match &state.access_logger {
        Some(logger) => logger,
        None => return,
    };
    let status = resp.status().as_u16();
    let cache_status = resp
        .headers()
        .get(serve::CACHE_STATUS_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    let bytes_sent = resp
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("0");
    let line = format!(
        "{} {} \"{} {}\" {} {} {}ms {}\n",
        client,
        Local::now().format("[%d/%b/%Y:%H:%M:%S %z]"),
        method,
        uri,
        status,
        bytes_sent,
        start.elapsed().as_millis(),
        cache_status,
    );
    logger.log_line(&line);
}

#[derive(Debug, Serialize)]
struct BuildInfo {
    name: &'static str,
    version: &'static str,
    commit: &'static str,
}

fn build_info() -> BuildInfo {
    BuildInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_REV").unwrap_or("unknown"),
    }
}

fn json_response<T: Serialize>(payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json; charset=utf-8")
            .body(Full::new(Bytes::from(bytes)))
            .unwrap(),
        Err(_) => serve::text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode"),
    }
}
