//! Accept loop and request dispatch: plugins first, then the local API
//! surface, then the caching pipeline.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use http::{Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;

use crate::access_log::AccessLogger;
use crate::caching::{CacheHandler, CachingConfig, CachingOptions, ClientRequest};
use crate::config::Bootstrap;
use crate::constants;
use crate::iobuf::ProxyBody;
use crate::metrics;
use crate::plugin::{self, Plugin, Router};
use crate::proxy::{nodes_from_config, BalancePolicy, UpstreamPool};
use crate::storage::{self, native::NativeStorage, Storage};

const DEFAULT_LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

struct AppState {
    handler: Arc<CacheHandler>,
    plugins: Vec<Arc<dyn Plugin>>,
    router: Arc<Router>,
    local_hosts: HashSet<String>,
    access_logger: Option<AccessLogger>,
}

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let store = NativeStorage::new(&cfg.storage)?;
    storage::set_default(Arc::clone(&store) as Arc<dyn Storage>);

    plugin::register_builtin();
    let plugins = load_plugins(&cfg);
    for plugin in &plugins {
        if let Err(err) = plugin.start() {
            log::warn!("plugin {} start failed: {err}", plugin.name());
        }
    }
    let mut router = Router::new();
    for plugin in &plugins {
        plugin.add_router(&mut router);
    }

    let hostname = cfg
        .hostname
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string());
    let caching_opts = find_caching_options(&cfg);
    let caching_cfg = CachingConfig::from_options(&caching_opts, cfg.storage.slice_size, &hostname);

    let pool = UpstreamPool::new(
        nodes_from_config(&cfg.upstream.address),
        BalancePolicy::parse(&cfg.upstream.balancing),
        cfg.upstream.connect_timeout,
        cfg.upstream.response_header_timeout,
        cfg.upstream.idle_timeout,
        cfg.upstream.decode_content_encoding,
    );
    let handler = CacheHandler::new(
        Arc::clone(&store) as Arc<dyn Storage>,
        pool,
        caching_cfg,
    );

    let mut local_hosts: HashSet<String> =
        DEFAULT_LOCAL_HOSTS.iter().map(|h| h.to_string()).collect();
    local_hosts.extend(cfg.server.local_api_allow_hosts.iter().cloned());

    let access_logger = cfg.server.access_log.as_ref().and_then(|access| {
        if !access.enabled {
            return None;
        }
        match AccessLogger::open(&access.path) {
            Ok(logger) => Some(logger),
            Err(err) => {
                log::warn!("access log init failed: {err}");
                None
            }
        }
    });

    let state = Arc::new(AppState {
        handler,
        plugins,
        router: Arc::new(router),
        local_hosts,
        access_logger,
    });

    let listener = TcpListener::bind(cfg.server.addr.as_str())
        .await
        .with_context(|| format!("bind {}", cfg.server.addr))?;
    log::info!("listening on {}", cfg.server.addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move {
                            Ok::<_, std::convert::Infallible>(dispatch(state, req, remote).await)
                        }
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("connection from {remote} ended: {err}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutdown requested");
                break;
            }
        }
    }

    for plugin in &state.plugins {
        if let Err(err) = plugin.stop() {
            log::warn!("plugin {} stop failed: {err}", plugin.name());
        }
    }
    store.flush();
    Ok(())
}

async fn dispatch(
    state: Arc<AppState>,
    req: http::Request<Incoming>,
    remote: SocketAddr,
) -> Response<ProxyBody> {
    let started = Instant::now();
    let (parts, _body) = req.into_parts();
    let creq = ClientRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
    };
    let method = creq.method.clone();
    let uri = creq.uri.to_string();

    let resp = handle(&state, &creq, remote).await;

    if let Some(logger) = &state.access_logger {
        let cache_status = resp
            .headers()
            .get(constants::PROTOCOL_CACHE_STATUS_KEY)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split_whitespace().next())
            .unwrap_or("-")
            .to_string();
        logger.record(
            &remote.ip().to_string(),
            &method,
            &uri,
            resp.status(),
            &cache_status,
            started.elapsed(),
        );
    }
    resp
}

async fn handle(
    state: &Arc<AppState>,
    creq: &ClientRequest,
    remote: SocketAddr,
) -> Response<ProxyBody> {
    if creq.uri.path() == "/metrics" {
        if state.local_hosts.contains(&remote.ip().to_string()) {
            let body = metrics::render();
            return Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4")
                .header("Content-Length", body.len().to_string())
                .body(ProxyBody::text(&body))
                .expect("response build");
        }
        return Response::builder()
            .status(StatusCode::FORBIDDEN)
            .header("Content-Length", "0")
            .body(ProxyBody::empty())
            .expect("response build");
    }

    if let Some(resp) = state.router.dispatch(creq) {
        return resp;
    }

    let remote_ip = remote.ip().to_string();
    for plugin in &state.plugins {
        if let Some(resp) = plugin.handle_request(creq, Some(&remote_ip)) {
            return resp;
        }
    }

    state.handler.handle(creq.clone()).await
}

fn load_plugins(cfg: &Bootstrap) -> Vec<Arc<dyn Plugin>> {
    let mut plugins = Vec::new();
    let mut has_purge = false;
    for plugin_cfg in &cfg.plugin {
        match plugin::create(plugin_cfg) {
            Ok(instance) => {
                has_purge = has_purge || instance.name() == "purge";
                plugins.push(instance);
            }
            Err(err) => log::warn!("plugin {} load failed: {err}", plugin_cfg.name),
        }
    }
    if !has_purge {
        // PURGE is part of the protocol surface even when unconfigured
        let default_cfg = crate::config::Plugin {
            name: "purge".to_string(),
            options: Default::default(),
        };
        if let Ok(instance) = plugin::create(&default_cfg) {
            plugins.push(instance);
        }
    }
    plugins
}

fn find_caching_options(cfg: &Bootstrap) -> CachingOptions {
    for middleware in &cfg.server.middleware {
        if middleware.name != "caching" {
            continue;
        }
        if middleware.options.is_empty() {
            return CachingOptions::default();
        }
        match serde_yaml::to_value(&middleware.options)
            .and_then(serde_yaml::from_value::<CachingOptions>)
        {
            Ok(opts) => return opts,
            Err(err) => {
                log::warn!("caching middleware options invalid: {err}");
                return CachingOptions::default();
            }
        }
    }
    CachingOptions::default()
}
