//! The PURGE surface: single-object removal by store URL, prefix removal
//! via the inverted index when the request carries `Purge-Type: dir`.
//! Sources are allow-listed; outcomes are 200 / 403 / 404 / 500.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use http::{Response, StatusCode};
use serde::Deserialize;

use crate::caching::processor::ClientRequest;
use crate::config;
use crate::constants;
use crate::iobuf::ProxyBody;
use crate::storage::{self, PurgeControl};

const METHOD_PURGE: &str = "PURGE";

#[derive(Debug, Deserialize)]
struct PurgeOptions {
    #[serde(default)]
    threshold: Option<i64>,
    #[serde(default)]
    allow_hosts: Vec<String>,
    #[serde(default = "default_header_name")]
    header_name: String,
    #[serde(default)]
    log_path: Option<String>,
}

fn default_header_name() -> String {
    "Purge-Type".to_string()
}

pub struct PurgePlugin {
    header_name: String,
    allow_hosts: HashSet<String>,
    log_writer: Option<Mutex<std::fs::File>>,
    window: Mutex<ThresholdWindow>,
}

struct ThresholdWindow {
    start: Instant,
    count: u64,
    threshold: Option<u64>,
}

impl crate::plugin::Plugin for PurgePlugin {
    fn name(&self) -> &str {
        "purge"
    }

    fn add_router(&self, router: &mut crate::plugin::Router) {
        router.add("/plugin/purge/tasks", |_req| {
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .header("Content-Length", "0")
                .header("X-Device-Plugin", "purger")
                .body(ProxyBody::empty())
                .expect("response build")
        });
    }

    fn handle_request(
        &self,
        req: &ClientRequest,
        remote: Option<&str>,
    ) -> Option<Response<ProxyBody>> {
        if req.method.as_str() != METHOD_PURGE {
            return None;
        }

        let source = req
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
            .or_else(|| remote.map(|v| v.to_string()));

        if !self.allow_hosts.is_empty() {
            match source {
                Some(addr) if self.allow_hosts.contains(&addr) => {}
                _ => return Some(empty_response(StatusCode::FORBIDDEN)),
            }
        }

        let store_url = req
            .headers
            .get(constants::STORE_URL_KEY)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .unwrap_or_else(|| req.uri.to_string());

        let is_dir = req
            .headers
            .get(self.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("dir"))
            .unwrap_or(false);

        let result = storage::current().purge(
            &store_url,
            PurgeControl {
                dir: is_dir,
                mark_expired: false,
            },
        );

        let exceeded = self.bump_threshold();
        let resp = match result {
            Ok(()) => json_response(StatusCode::OK, r#"{"message":"success"}"#),
            Err(err) if err.to_string().contains("key not found") => {
                empty_response(StatusCode::NOT_FOUND)
            }
            Err(err) => {
                log::warn!("purge {store_url} failed: {err}");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };
        self.log_purge(resp.status(), &store_url, is_dir, exceeded);
        Some(resp)
    }
}

impl PurgePlugin {
    fn bump_threshold(&self) -> bool {
        let mut window = match self.window.lock() {
            Ok(window) => window,
            Err(_) => return false,
        };
        let Some(threshold) = window.threshold else {
            return false;
        };
        if window.start.elapsed() > Duration::from_secs(60) {
            window.start = Instant::now();
            window.count = 0;
        }
        window.count += 1;
        window.count > threshold
    }

    fn log_purge(&self, status: StatusCode, url: &str, dir: bool, exceeded: bool) {
        let Some(writer) = &self.log_writer else { return };
        let line = format!(
            "{} status={} dir={dir} exceeded={exceeded} url={url}\n",
            storage::unix_now(),
            status.as_u16(),
        );
        if let Ok(mut writer) = writer.lock() {
            let _ = writer.write_all(line.as_bytes());
        }
    }
}

pub fn register() {
    crate::plugin::register("purge", build);
}

fn build(cfg: &config::Plugin) -> Result<Arc<dyn crate::plugin::Plugin>> {
    let options = decode_options(cfg)?;
    let allow_hosts = options.allow_hosts.iter().cloned().collect();
    let log_writer = options
        .log_path
        .as_ref()
        .filter(|path| !path.trim().is_empty())
        .and_then(|path| {
            let path = Path::new(path);
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            OpenOptions::new().create(true).append(true).open(path).ok()
        })
        .map(Mutex::new);
    Ok(Arc::new(PurgePlugin {
        header_name: options.header_name.clone(),
        allow_hosts,
        log_writer,
        window: Mutex::new(ThresholdWindow {
            start: Instant::now(),
            count: 0,
            threshold: options.threshold.filter(|t| *t > 0).map(|t| t as u64),
        }),
    }))
}

fn decode_options(cfg: &config::Plugin) -> Result<PurgeOptions> {
    if cfg.options.is_empty() {
        return Ok(PurgeOptions {
            threshold: None,
            allow_hosts: Vec::new(),
            header_name: default_header_name(),
            log_path: None,
        });
    }
    let value = serde_yaml::to_value(&cfg.options)?;
    Ok(serde_yaml::from_value(value)?)
}

fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Length", "0")
        .body(ProxyBody::empty())
        .expect("response build")
}

fn json_response(status: StatusCode, payload: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json; charset=utf-8")
        .header("Content-Length", payload.len().to_string())
        .body(ProxyBody::text(payload))
        .expect("response build")
}
