//! Newline-delimited access log, one line per completed exchange.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use http::{Method, StatusCode};

pub struct AccessLogger {
    writer: Mutex<File>,
}

impl AccessLogger {
    pub fn open(path: &str) -> Result<Self> {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create access log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open access log {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(file),
        })
    }

    pub fn record(
        &self,
        remote: &str,
        method: &Method,
        uri: &str,
        status: StatusCode,
        cache_status: &str,
        elapsed: Duration,
    ) {
        let line = format!(
            "{} {} {} {} {} {} {:.3}ms\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            remote,
            method,
            uri,
            status.as_u16(),
            cache_status,
            elapsed.as_secs_f64() * 1000.0,
        );
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.write_all(line.as_bytes());
        }
    }
}
