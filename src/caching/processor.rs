//! The caching processor chain: a fixed enumeration of processors run in
//! order, each with lookup / pre-request / post-request hooks. Per-request
//! mutable state lives in one `Exchange` value passed by exclusive
//! reference; the chain itself is built once and shared.

use std::sync::Arc;

use anyhow::Result;
use http::{HeaderMap, Method, StatusCode};

use crate::caching::filechanged::FileChanged;
use crate::caching::revalidate::Revalidate;
use crate::caching::vary::Vary;
use crate::caching::CachingConfig;
use crate::constants;
use crate::http_range::ContentRange;
use crate::storage::object::{Id, Metadata};
use crate::storage::{Bucket, CacheStatus};

/// Snapshot of the inbound client request.
#[derive(Clone)]
pub struct ClientRequest {
    pub method: Method,
    pub uri: http::Uri,
    pub headers: HeaderMap,
}

/// The request about to be sent upstream; processors may rewrite it.
pub struct OutboundRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
}

/// Upstream response head handed through the post-request hooks.
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_range: Option<ContentRange>,
}

/// What the driver should do after the post-request phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// Forward the upstream response (storing it if cacheable).
    Forward,
    /// Discard the upstream response and serve the stored object.
    ServeStored,
}

/// Per-request mutable state shared by the driver and every hook.
pub struct Exchange {
    pub id: Id,
    pub bucket: Arc<dyn Bucket>,
    pub md: Option<Metadata>,
    /// The vary index when the request was redirected to a variant.
    pub root_md: Option<Metadata>,
    pub status: CacheStatus,
    pub hit: bool,
    pub cacheable: bool,
    pub prefetch: bool,
    pub revalidate: bool,
    pub file_changed: bool,
    pub chunked: bool,
    pub hot: bool,
    pub stashed_range: Option<String>,
}

impl Exchange {
    pub fn new(id: Id, bucket: Arc<dyn Bucket>, md: Option<Metadata>) -> Self {
        let hot = bucket.store_type() == "hot";
        Self {
            id,
            bucket,
            md,
            root_md: None,
            status: CacheStatus::Miss,
            hit: false,
            cacheable: false,
            prefetch: false,
            revalidate: false,
            file_changed: false,
            chunked: false,
            hot,
            stashed_range: None,
        }
    }
}

pub enum Processor {
    State,
    Prefetch,
    Revalidate(Revalidate),
    FileChanged(FileChanged),
    Vary(Vary),
}

impl Processor {
    fn name(&self) -> &'static str {
        match self {
            Processor::State => "state",
            Processor::Prefetch => "prefetch",
            Processor::Revalidate(_) => "revalidate",
            Processor::FileChanged(_) => "file-changed",
            Processor::Vary(_) => "vary",
        }
    }

    fn lookup(&self, ex: &mut Exchange, req: &ClientRequest) -> Result<bool> {
        match self {
            Processor::State => Ok(ex.md.is_some()),
            Processor::Prefetch => {
                if req.headers.contains_key(constants::PREFETCH_CACHE_KEY) {
                    ex.prefetch = true;
                }
                Ok(true)
            }
            Processor::Revalidate(p) => p.lookup(ex),
            Processor::FileChanged(_) => Ok(true),
            Processor::Vary(p) => p.lookup(ex, req),
        }
    }

    fn pre_request(&self, ex: &mut Exchange, out: &mut OutboundRequest) -> Result<()> {
        match self {
            Processor::Prefetch => {
                out.headers.remove(constants::PREFETCH_CACHE_KEY);
                if ex.prefetch {
                    out.headers.remove(http::header::RANGE);
                }
                Ok(())
            }
            Processor::Revalidate(p) => p.pre_request(ex, out),
            _ => Ok(()),
        }
    }

    fn post_request(
        &self,
        ex: &mut Exchange,
        req: &ClientRequest,
        head: &mut ResponseHead,
    ) -> Result<PostOutcome> {
        match self {
            Processor::Revalidate(p) => p.post_request(ex, head),
            Processor::FileChanged(p) => p.post_request(ex, head),
            Processor::Vary(p) => p.post_request(ex, req, head),
            _ => Ok(PostOutcome::Forward),
        }
    }
}

pub struct Chain {
    processors: Vec<Processor>,
}

impl Chain {
    /// The standard order: state, prefetch, revalidate, file-changed, vary.
    pub fn standard(cfg: &CachingConfig) -> Arc<Self> {
        Arc::new(Self {
            processors: vec![
                Processor::State,
                Processor::Prefetch,
                Processor::Revalidate(Revalidate),
                Processor::FileChanged(FileChanged),
                Processor::Vary(Vary::new(cfg.vary_limit, cfg.vary_ignore.clone())),
            ],
        })
    }

    /// Short-circuits: the first processor answering "no" yields a miss.
    pub fn lookup(&self, ex: &mut Exchange, req: &ClientRequest) -> bool {
        for processor in &self.processors {
            match processor.lookup(ex, req) {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("{}.lookup() -> miss for {}", processor.name(), ex.id);
                    ex.hit = false;
                    return false;
                }
                Err(err) => {
                    log::warn!("{}.lookup() failed: {err}", processor.name());
                    ex.hit = false;
                    return false;
                }
            }
        }
        ex.hit = true;
        true
    }

    pub fn pre_request(&self, ex: &mut Exchange, out: &mut OutboundRequest) -> Result<()> {
        for processor in &self.processors {
            processor.pre_request(ex, out)?;
        }
        Ok(())
    }

    pub fn post_request(
        &self,
        ex: &mut Exchange,
        req: &ClientRequest,
        head: &mut ResponseHead,
    ) -> Result<PostOutcome> {
        for processor in &self.processors {
            match processor.post_request(ex, req, head)? {
                PostOutcome::Forward => {}
                PostOutcome::ServeStored => return Ok(PostOutcome::ServeStored),
            }
        }
        Ok(PostOutcome::Forward)
    }
}
