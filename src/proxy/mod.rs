//! Upstream client: node selection plus one pooled hyper client. The
//! driver always talks to exactly one node per round trip; selection is
//! round-robin by default or consistent-hash over the object hash.

pub mod singleflight;

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::{CacheError, CacheResult};

#[derive(Clone, Debug)]
pub struct Node {
    pub scheme: String,
    pub address: String,
}

impl Node {
    pub fn new(scheme: &str, address: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            address: address.to_string(),
        }
    }

    pub fn base(&self) -> String {
        format!("{}://{}", self.scheme, self.address)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalancePolicy {
    RoundRobin,
    ConsistentHash,
}

impl BalancePolicy {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hash" | "consistent" | "consistent-hash" => BalancePolicy::ConsistentHash,
            _ => BalancePolicy::RoundRobin,
        }
    }
}

pub struct UpstreamPool {
    nodes: Vec<Node>,
    cursor: AtomicUsize,
    policy: BalancePolicy,
    client: Client<HttpConnector, Full<Bytes>>,
    response_header_timeout: Duration,
    decode_content: bool,
}

impl UpstreamPool {
    pub fn new(
        nodes: Vec<Node>,
        policy: BalancePolicy,
        connect_timeout: Duration,
        response_header_timeout: Duration,
        idle_timeout: Duration,
        decode_content: bool,
    ) -> Arc<Self> {
        let mut connector = HttpConnector::new();
        if connect_timeout > Duration::ZERO {
            connector.set_connect_timeout(Some(connect_timeout));
        }
        let mut builder = Client::builder(TokioExecutor::new());
        if idle_timeout > Duration::ZERO {
            builder.pool_idle_timeout(idle_timeout);
        }
        let client = builder.build(connector);
        Arc::new(Self {
            nodes,
            cursor: AtomicUsize::new(0),
            policy,
            client,
            response_header_timeout,
            decode_content,
        })
    }

    pub fn select_base(&self, override_addr: Option<&str>, hash_key: Option<&[u8]>) -> CacheResult<String> {
        if let Some(addr) = override_addr {
            if addr.starts_with("http://") || addr.starts_with("https://") {
                return Ok(addr.to_string());
            }
            return Ok(format!("http://{addr}"));
        }
        if self.nodes.is_empty() {
            return Err(CacheError::transport(anyhow!("upstream.address is empty")));
        }
        let idx = match (self.policy, hash_key) {
            (BalancePolicy::ConsistentHash, Some(key)) => {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(key);
                hasher.finalize() as usize % self.nodes.len()
            }
            _ => self.cursor.fetch_add(1, Ordering::Relaxed) % self.nodes.len(),
        };
        Ok(self.nodes[idx].base())
    }

    /// One round trip; the body is handed back untouched for streaming.
    pub async fn fetch_stream(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
    ) -> CacheResult<(StatusCode, HeaderMap, Incoming)> {
        let mut builder = http::Request::builder().method(method).uri(uri);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let req = builder
            .body(Full::new(Bytes::new()))
            .map_err(CacheError::transport)?;

        let fut = self.client.request(req);
        let resp = if self.response_header_timeout > Duration::ZERO {
            tokio::time::timeout(self.response_header_timeout, fut)
                .await
                .map_err(|_| CacheError::transport(anyhow!("upstream response header timeout")))?
        } else {
            fut.await
        }
        .map_err(CacheError::transport)?;

        let status = resp.status();
        let headers = resp.headers().clone();
        Ok((status, headers, resp.into_body()))
    }

    /// Round trip with a fully collected body. Decodes gzip/br when the
    /// pool is configured to store decoded bytes.
    pub async fn fetch_buffered(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
    ) -> CacheResult<(StatusCode, HeaderMap, Bytes)> {
        let (status, mut headers, body) = self.fetch_stream(method, uri, headers).await?;
        let collected = body
            .collect()
            .await
            .map_err(|err| CacheError::transport(anyhow!("read upstream body: {err}")))?;
        let mut bytes = collected.to_bytes();
        if self.decode_content {
            let encoding = headers
                .get("Content-Encoding")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_ascii_lowercase();
            if matches!(encoding.as_str(), "gzip" | "br") {
                bytes = decode_body(&encoding, bytes)?;
                headers.remove("Content-Encoding");
                if let Ok(len) = bytes.len().to_string().parse() {
                    headers.insert("Content-Length", len);
                }
            }
        }
        Ok((status, headers, bytes))
    }
}

fn decode_body(encoding: &str, body: Bytes) -> CacheResult<Bytes> {
    let mut out = Vec::with_capacity(body.len() * 2);
    match encoding {
        "gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(&body[..]);
            decoder
                .read_to_end(&mut out)
                .context("decode gzip body")
                .map_err(CacheError::transport)?;
        }
        "br" => {
            let mut decoder = brotli::Decompressor::new(&body[..], 4096);
            decoder
                .read_to_end(&mut out)
                .context("decode brotli body")
                .map_err(CacheError::transport)?;
        }
        _ => return Ok(body),
    }
    Ok(Bytes::from(out))
}

/// Join an upstream base with the request's path and query.
pub fn join_uri(base: &str, path_and_query: &str) -> CacheResult<Uri> {
    format!("{base}{path_and_query}")
        .parse::<Uri>()
        .map_err(|err| CacheError::transport(anyhow!("parse upstream uri: {err}")))
}

pub fn nodes_from_config(addresses: &[String]) -> Vec<Node> {
    let mut nodes = Vec::new();
    for addr in addresses {
        let addr = addr.trim();
        if addr.is_empty() {
            continue;
        }
        if addr.contains("://") {
            if let Ok(uri) = addr.parse::<Uri>() {
                if let Some(authority) = uri.authority() {
                    nodes.push(Node::new(uri.scheme_str().unwrap_or("http"), authority.as_str()));
                    continue;
                }
            }
        }
        nodes.push(Node::new("http", addr));
    }
    nodes
}
