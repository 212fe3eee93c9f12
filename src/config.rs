use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub plugin: Vec<Plugin>,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub storage: Storage,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.upstream.address.is_empty() {
            return Err(anyhow!("upstream.address must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub caller: bool,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct Server {
    #[serde(default)]
    pub addr: String,
    #[serde(default, with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(default)]
    pub middleware: Vec<MiddlewareConfig>,
    #[serde(default)]
    pub access_log: Option<AccessLog>,
    #[serde(default)]
    pub local_api_allow_hosts: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct AccessLog {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct MiddlewareConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub options: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct Upstream {
    #[serde(default)]
    pub balancing: String,
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub response_header_timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(default)]
    pub decode_content_encoding: bool,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Storage {
    #[serde(default)]
    pub db_type: String,
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub async_load: bool,
    #[serde(default)]
    pub selection_policy: String,
    #[serde(default)]
    pub slice_size: u64,
    #[serde(default)]
    pub buckets: Vec<BucketConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct BucketConfig {
    #[serde(default)]
    pub path: String,
    #[serde(default, rename = "type")]
    pub bucket_type: String,
    #[serde(default)]
    pub db_type: String,
    #[serde(default)]
    pub async_load: bool,
    #[serde(default)]
    pub max_object_limit: i64,
}

#[derive(Debug, Deserialize, Default)]
pub struct Plugin {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub options: HashMap<String, serde_yaml::Value>,
}

/// Load the bootstrap config, collecting unknown field paths so strict
/// mode can refuse them and normal mode can warn.
pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;
    Ok((cfg, ignored))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_collected_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
server:
  addr: "127.0.0.1:8080"
  mystery_field: true
upstream:
  address: ["127.0.0.1:9000"]
"#,
        )
        .unwrap();
        let (cfg, ignored) = load(&path).unwrap();
        assert_eq!(cfg.server.addr, "127.0.0.1:8080");
        assert_eq!(ignored, vec!["server.mystery_field".to_string()]);
        cfg.validate().unwrap();
    }

    #[test]
    fn validation_requires_addr_and_upstream() {
        let cfg = Bootstrap::default();
        assert!(cfg.validate().is_err());
    }
}
