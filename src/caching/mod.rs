//! The caching driver: binds one request to a bucket, a metadata record
//! and the processor chain, then decides whether bytes come from local
//! slices, from the origin, or from a mixture of both.

pub mod filechanged;
pub mod locker;
pub mod processor;
pub mod revalidate;
pub mod vary;

use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use bytes::Bytes;
use futures::StreamExt;
use http::header;
use http::{HeaderMap, Method, Response, StatusCode};
use http_body::Frame;
use http_body_util::Full;
use hyper::body::Incoming;
use rand::Rng;

use crate::constants;
use crate::error::CacheError;
use crate::http_range::{
    build_content_range, fill_range, is_open_ended, parse_content_range, parse_range,
    unsatisfied_content_range, RangeSpec,
};
use crate::iobuf::block_sink::{
    save_block_stream, AsyncBlockWriter, BlockFn, BlockSink, CloseFn, ErrorFn,
};
use crate::iobuf::compose::{clip, compose, ByteStream, FetchFn, Segment};
use crate::iobuf::{BoxError, ProxyBody, DEFAULT_SLICE_SIZE};
use crate::metrics;
use crate::proxy::singleflight::Group;
use crate::proxy::UpstreamPool;
use crate::storage;
use crate::storage::bitmap::{block_groups, block_span, full_hit, part_hit, Bitmap};
use crate::storage::object::{CacheFlag, Id, Metadata};
use crate::storage::{Bucket, CacheStatus, Storage};

pub use locker::KeyedLocks;
pub use processor::{Chain, ClientRequest, Exchange, OutboundRequest, PostOutcome, ResponseHead};

#[derive(Clone)]
pub struct CachingConfig {
    pub include_query: bool,
    pub slice_size: u64,
    pub fuzzy_refresh: bool,
    pub fuzzy_refresh_rate: f64,
    pub collapsed_request: bool,
    pub collapsed_wait: Duration,
    pub fill_range_percent: u64,
    pub async_flush_chunk: bool,
    pub vary_limit: usize,
    pub vary_ignore: HashSet<String>,
    pub hostname: String,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            include_query: false,
            slice_size: DEFAULT_SLICE_SIZE,
            fuzzy_refresh: false,
            fuzzy_refresh_rate: 0.0,
            collapsed_request: false,
            collapsed_wait: Duration::ZERO,
            fill_range_percent: 0,
            async_flush_chunk: false,
            vary_limit: 100,
            vary_ignore: HashSet::new(),
            hostname: String::new(),
        }
    }
}

/// Options block of the `caching` middleware entry, decoded from YAML.
#[derive(Debug, Default, serde::Deserialize)]
pub struct CachingOptions {
    #[serde(default)]
    pub include_query_in_cache_key: Option<bool>,
    #[serde(default)]
    pub fuzzy_refresh: bool,
    #[serde(default)]
    pub fuzzy_refresh_rate: f64,
    #[serde(default)]
    pub collapsed_request: bool,
    #[serde(default, with = "humantime_serde")]
    pub collapsed_request_wait_timeout: Duration,
    #[serde(default)]
    pub slice_size: Option<u64>,
    #[serde(default)]
    pub fill_range_percent: Option<u64>,
    #[serde(default)]
    pub async_flush_chunk: bool,
    #[serde(default)]
    pub vary_limit: Option<usize>,
    #[serde(default)]
    pub vary_ignore_key: Vec<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl CachingConfig {
    pub fn from_options(opts: &CachingOptions, storage_slice: u64, hostname: &str) -> Self {
        let mut slice_size = opts.slice_size.unwrap_or(storage_slice);
        if slice_size == 0 {
            slice_size = DEFAULT_SLICE_SIZE;
        }
        Self {
            include_query: opts.include_query_in_cache_key.unwrap_or(false),
            slice_size,
            fuzzy_refresh: opts.fuzzy_refresh,
            fuzzy_refresh_rate: opts.fuzzy_refresh_rate,
            collapsed_request: opts.collapsed_request,
            collapsed_wait: opts.collapsed_request_wait_timeout,
            fill_range_percent: opts.fill_range_percent.unwrap_or(0).min(100),
            async_flush_chunk: opts.async_flush_chunk,
            vary_limit: opts.vary_limit.unwrap_or(100),
            vary_ignore: opts
                .vary_ignore_key
                .iter()
                .map(|v| v.to_ascii_lowercase())
                .collect(),
            hostname: opts
                .hostname
                .clone()
                .unwrap_or_else(|| hostname.to_string()),
        }
    }
}

#[derive(Clone)]
struct CollapsedOutcome {
    ok: bool,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Upstream body in either streaming or collapsed-buffered form.
enum UpstreamBody {
    Incoming(Incoming),
    Buffered(Full<Bytes>),
}

impl http_body::Body for UpstreamBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        match self.get_mut() {
            UpstreamBody::Incoming(body) => Pin::new(body)
                .poll_frame(cx)
                .map(|opt| opt.map(|res| res.map_err(Into::into))),
            UpstreamBody::Buffered(body) => Pin::new(body)
                .poll_frame(cx)
                .map(|opt| opt.map(|res| res.map_err(Into::into))),
        }
    }
}

pub struct CacheHandler {
    storage: Arc<dyn Storage>,
    pool: Arc<UpstreamPool>,
    chain: Arc<Chain>,
    cfg: CachingConfig,
    collapse: Group<CollapsedOutcome>,
    locks: Arc<KeyedLocks>,
}

impl CacheHandler {
    pub fn new(storage: Arc<dyn Storage>, pool: Arc<UpstreamPool>, cfg: CachingConfig) -> Arc<Self> {
        let chain = Chain::standard(&cfg);
        Arc::new(Self {
            storage,
            pool,
            chain,
            cfg,
            collapse: Group::new(),
            locks: KeyedLocks::new(),
        })
    }

    pub async fn handle(&self, req: ClientRequest) -> Response<ProxyBody> {
        if req.method != Method::GET && req.method != Method::HEAD {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let Some(store_key) = build_store_key(&req, self.cfg.include_query) else {
            return self.bypass(&req).await;
        };

        let id = Id::new(&store_key);
        let Some(bucket) = self.storage.selector().select(&id) else {
            return self.bypass(&req).await;
        };
        let md = match bucket.lookup(&id) {
            Ok(md) => md,
            Err(err) => {
                log::warn!("lookup {store_key} failed: {err}");
                None
            }
        };

        let mut ex = Exchange::new(id, bucket, md);
        let hit = self.chain.lookup(&mut ex, &req);

        if hit {
            ex.status = CacheStatus::Hit;
            let range_raw = header_str(&req.headers, header::RANGE);
            self.maybe_fuzzy_refresh(&req, &ex, &store_key);
            return self.serve_from_metadata(&req, &mut ex, &store_key, range_raw, true);
        }

        self.fetch_and_respond(&req, &mut ex, &store_key).await
    }

    /// Key derivation failed: proxy straight through and say so.
    async fn bypass(&self, req: &ClientRequest) -> Response<ProxyBody> {
        let out = outbound_from(req);
        let base = match self
            .pool
            .select_base(header_str(&req.headers, constants::INTERNAL_UPSTREAM_ADDR), None)
        {
            Ok(base) => base,
            Err(err) => {
                log::warn!("bypass upstream select failed: {err}");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "upstream error");
            }
        };
        let uri = match crate::proxy::join_uri(&base, &out.path_and_query) {
            Ok(uri) => uri,
            Err(_) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, "upstream error"),
        };
        match self
            .pool
            .fetch_stream(out.method.clone(), uri, out.headers)
            .await
        {
            Ok((status, headers, body)) => {
                let mut resp_headers = strip_hop_headers(&headers);
                resp_headers.insert(
                    constants::PROTOCOL_CACHE_STATUS_KEY,
                    x_cache_value(CacheStatus::Bypass, &self.cfg.hostname),
                );
                metrics::record_status(status);
                metrics::record_cache_status(CacheStatus::Bypass);
                let stream = body_stream(UpstreamBody::Incoming(body));
                response(status, resp_headers, ProxyBody::stream(stream))
            }
            Err(err) => {
                log::warn!("bypass upstream failed: {err}");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "upstream error")
            }
        }
    }

    /// Serve a request backed by a stored record: split the range into hit
    /// and miss runs, read hit runs from slice files, fetch miss runs with
    /// one aligned sub-request each, and stream the ordered result.
    fn serve_from_metadata(
        &self,
        req: &ClientRequest,
        ex: &mut Exchange,
        store_key: &str,
        range_raw: Option<&str>,
        allow_fill: bool,
    ) -> Response<ProxyBody> {
        let md = ex.md.clone().expect("metadata present on hit path");
        let size = md.size;
        let block_size = if md.block_size > 0 {
            md.block_size
        } else {
            self.cfg.slice_size
        };

        let ranged = range_raw.is_some();
        let range = if let Some(raw) = range_raw {
            match parse_range(raw, size) {
                Ok(range) => range,
                Err(_) => return self.range_not_satisfiable(ex, &md, size),
            }
        } else {
            RangeSpec {
                start: 0,
                end: size.saturating_sub(1),
            }
        };

        let fill = if allow_fill { self.cfg.fill_range_percent } else { 0 };
        let expanded = if size > 0 {
            fill_range(range, size, block_size, fill)
        } else {
            range
        };
        // bitmap bits are trusted only as far as the files behind them
        let have = if size > 0 {
            let (first, last) = block_span(expanded.start, expanded.end, block_size);
            effective_have(&md, &ex.bucket, first, last)
        } else {
            Bitmap::new()
        };

        let unbounded =
            req.method == Method::HEAD || !ranged || range_raw.map(is_open_ended).unwrap_or(false);
        self.mark_status(ex, &md, unbounded, range, block_size, &have);

        let mut headers = metadata_headers(&md);
        let resp_status = if ranged && size > 0 {
            headers.insert(
                header::CONTENT_RANGE,
                build_content_range(range.start, range.end, size)
                    .parse()
                    .expect("content range"),
            );
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::from_u16(md.code).unwrap_or(StatusCode::OK)
        };
        let body_len = if size == 0 { 0 } else { range.len() };
        headers.insert(
            header::CONTENT_LENGTH,
            body_len.to_string().parse().expect("content length"),
        );
        self.stamp(req, ex, Some(&md), &mut headers);
        metrics::record_status(resp_status);
        metrics::record_cache_status(ex.status);

        if req.method == Method::HEAD || ex.prefetch || size == 0 {
            return response(resp_status, headers, ProxyBody::empty());
        }

        let segments =
            self.build_segments(req, ex, &md, range, expanded, block_size, &have, store_key);
        response(resp_status, headers, ProxyBody::stream(compose(segments)))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_segments(
        &self,
        req: &ClientRequest,
        ex: &Exchange,
        md: &Metadata,
        range: RangeSpec,
        expanded: RangeSpec,
        block_size: u64,
        have: &Bitmap,
        store_key: &str,
    ) -> Vec<Segment> {
        let size = md.size;
        let (first, last) = block_span(expanded.start, expanded.end, block_size);
        let want: Bitmap = (first..=last).collect();
        let shared_md = Arc::new(Mutex::new(md.clone()));

        let mut segments = Vec::new();
        for group in block_groups(have, &want) {
            if group.hit {
                for index in group.first..=group.last {
                    let block_start = index as u64 * block_size;
                    let block_end = (block_start + block_size - 1).min(size - 1);
                    let window_start = block_start.max(range.start);
                    let window_end = block_end.min(range.end);
                    if window_start > window_end {
                        continue;
                    }
                    let slice_path = md.id.wpath_slice(ex.bucket.path(), index);
                    let (path, offset) = if md.chunks.contains(index) && slice_path.exists() {
                        (slice_path, window_start - block_start)
                    } else {
                        // legacy single-file layout, absolute offset
                        (md.id.wpath(ex.bucket.path()), window_start)
                    };
                    segments.push(Segment::File {
                        path,
                        offset,
                        len: window_end - window_start + 1,
                    });
                }
            } else {
                let run_start = group.first as u64 * block_size;
                let run_end = ((group.last as u64 + 1) * block_size - 1).min(size - 1);
                let window_start = run_start.max(range.start);
                let window_end = run_end.min(range.end);
                let (skip, len) = if window_start > window_end {
                    (0, 0)
                } else {
                    (window_start - run_start, window_end - window_start + 1)
                };
                let fetch = self.sub_request(
                    req,
                    ex,
                    Arc::clone(&shared_md),
                    run_start,
                    run_end,
                    block_size,
                    store_key,
                );
                segments.push(Segment::Upstream {
                    fetch,
                    skip,
                    len,
                    drain: true,
                });
            }
        }
        segments
    }

    /// One block-aligned upstream sub-request; its body is written through
    /// to slice files as the client consumes it.
    #[allow(clippy::too_many_arguments)]
    fn sub_request(
        &self,
        req: &ClientRequest,
        ex: &Exchange,
        shared_md: Arc<Mutex<Metadata>>,
        from: u64,
        to: u64,
        block_size: u64,
        store_key: &str,
    ) -> FetchFn {
        let pool = Arc::clone(&self.pool);
        let bucket = Arc::clone(&ex.bucket);
        let mut out = outbound_from(req);
        let override_addr =
            header_str(&req.headers, constants::INTERNAL_UPSTREAM_ADDR).map(|s| s.to_string());
        let hash = ex.id.hash().0;
        let store_key = store_key.to_string();

        Box::new(move || {
            Box::pin(async move {
                for name in [
                    "If-None-Match",
                    "If-Modified-Since",
                    "If-Match",
                    "If-Unmodified-Since",
                    "If-Range",
                ] {
                    out.headers.remove(name);
                }
                out.headers.insert(
                    header::RANGE,
                    format!("bytes={from}-{to}")
                        .parse()
                        .expect("range header"),
                );
                let base = pool
                    .select_base(override_addr.as_deref(), Some(&hash))
                    .map_err(BoxError::from)?;
                let uri = crate::proxy::join_uri(&base, &out.path_and_query)
                    .map_err(BoxError::from)?;
                log::debug!("sub-request {store_key} bytes={from}-{to}");
                let (status, resp_headers, body) = pool
                    .fetch_stream(Method::GET, uri, out.headers.clone())
                    .await
                    .map_err(BoxError::from)?;
                if status != StatusCode::PARTIAL_CONTENT {
                    return Err(BoxError::from(CacheError::UpstreamStatus {
                        status,
                        headers: resp_headers,
                    }));
                }
                // stale-entity guard: a changed origin object must not be
                // interleaved with bytes already on disk
                if let Some(reason) = entity_mismatch(&shared_md, &resp_headers) {
                    let md = shared_md.lock().expect("in-flight metadata").clone();
                    let _ = bucket.discard_with_metadata(&md);
                    return Err(BoxError::from(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("origin entity changed during range fetch: {reason}"),
                    )));
                }
                let start = resp_headers
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .map(|cr| cr.start)
                    .unwrap_or(from);
                let sink = BlockSink::new(
                    block_size,
                    start,
                    block_writer(Arc::clone(&bucket), Arc::clone(&shared_md), false),
                );
                let stream = save_block_stream(
                    body,
                    sink,
                    discard_on_error(Arc::clone(&bucket), Arc::clone(&shared_md)),
                    store_on_close(bucket, shared_md),
                );
                let stream: ByteStream = stream.boxed();
                Ok(stream)
            })
        })
    }

    /// Miss and revalidation path: one upstream round trip through the
    /// processor chain, then streaming write-through.
    async fn fetch_and_respond(
        &self,
        req: &ClientRequest,
        ex: &mut Exchange,
        store_key: &str,
    ) -> Response<ProxyBody> {
        let mut out = outbound_from(req);
        if let Err(err) = self.chain.pre_request(ex, &mut out) {
            log::warn!("pre-request failed: {err}, bypassing cache");
            return self.bypass(req).await;
        }

        let override_addr = header_str(&req.headers, constants::INTERNAL_UPSTREAM_ADDR);
        let base = match self.pool.select_base(override_addr, Some(&ex.id.hash().0)) {
            Ok(base) => base,
            Err(err) => {
                log::warn!("upstream select failed: {err}");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "upstream error");
            }
        };
        let uri = match crate::proxy::join_uri(&base, &out.path_and_query) {
            Ok(uri) => uri,
            Err(_) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, "upstream error"),
        };

        let range_raw = header_str(&req.headers, header::RANGE).map(|s| s.to_string());
        let fetched = self
            .fetch_upstream(req, &out, uri, range_raw.as_deref(), store_key)
            .await;
        let (status, resp_headers, body) = match fetched {
            Ok(parts) => parts,
            Err(err) => {
                log::warn!("upstream fetch {store_key} failed: {err}");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "upstream error");
            }
        };

        let content_range = resp_headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let content_length = header_str(&resp_headers, header::CONTENT_LENGTH)
            .and_then(|v| v.parse::<u64>().ok());
        let chunked = status == StatusCode::OK && content_length.is_none();
        let entry_size = content_range
            .map(|cr| cr.size)
            .or(content_length)
            .unwrap_or(0);
        ex.chunked = chunked;

        let ttl = parse_cache_ttl(&resp_headers);
        ex.cacheable = ttl.is_some()
            && matches!(
                status,
                StatusCode::OK | StatusCode::PARTIAL_CONTENT | StatusCode::NOT_MODIFIED
            );

        // refresh the in-flight record's freshness; size and code are
        // staged only after the post hooks so file-changed detection still
        // sees the stored values
        let now = storage::unix_now();
        if status != StatusCode::NOT_MODIFIED {
            let mut md = ex
                .md
                .take()
                .unwrap_or_else(|| Metadata::new(ex.id.clone(), self.cfg.slice_size, now));
            if md.block_size == 0 {
                md.block_size = self.cfg.slice_size;
            }
            md.resp_unix = now;
            md.last_ref_unix = now;
            md.expires_at = ttl.map(|d| now + d.as_secs() as i64).unwrap_or(0);
            if chunked {
                md.flags.insert(CacheFlag::CHUNKED);
            }
            ex.md = Some(md);
        } else if let Some(md) = ex.md.as_mut() {
            md.last_ref_unix = now;
        }

        let mut head = ResponseHead {
            status,
            headers: strip_hop_headers(&resp_headers),
            content_range,
        };
        let outcome = match self.chain.post_request(ex, req, &mut head) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!("post-request failed: {err}");
                PostOutcome::Forward
            }
        };

        if outcome == PostOutcome::ServeStored {
            // 304 path: replay the stored body against the stashed range
            let stashed = ex.stashed_range.clone();
            return self.serve_from_metadata(req, ex, store_key, stashed.as_deref(), false);
        }

        // record the response headers on the record that will be stored
        let storable = ex.cacheable
            && matches!(status, StatusCode::OK | StatusCode::PARTIAL_CONTENT)
            && req.method == Method::GET;
        if storable && ex.md.is_none() {
            // a processor dropped the record mid-flight; store fresh
            let mut fresh = Metadata::new(ex.id.clone(), self.cfg.slice_size, now);
            fresh.code = if status == StatusCode::PARTIAL_CONTENT {
                200
            } else {
                status.as_u16()
            };
            fresh.size = entry_size;
            fresh.expires_at = ttl.map(|d| now + d.as_secs() as i64).unwrap_or(0);
            ex.md = Some(fresh);
        }
        if let Some(md) = ex.md.as_mut() {
            if status != StatusCode::NOT_MODIFIED {
                md.code = if status == StatusCode::PARTIAL_CONTENT {
                    200
                } else {
                    status.as_u16()
                };
                md.size = entry_size;
            }
            md.headers = vary::header_pairs(&persistable_headers(&head.headers));
            if entry_size > 0 {
                md.set_header("Content-Length", &entry_size.to_string());
            }
        }

        self.respond_with_upstream(
            req,
            ex,
            head,
            body,
            storable,
            range_raw.as_deref(),
            entry_size,
        )
    }

    async fn fetch_upstream(
        &self,
        req: &ClientRequest,
        out: &OutboundRequest,
        uri: http::Uri,
        range_raw: Option<&str>,
        store_key: &str,
    ) -> Result<(StatusCode, HeaderMap, UpstreamBody), CacheError> {
        if self.cfg.collapsed_request && req.method == Method::GET {
            let key = format!("{}|{}|{}", req.method, store_key, range_raw.unwrap_or(""));
            let pool = Arc::clone(&self.pool);
            let method = out.method.clone();
            let headers = out.headers.clone();
            let call_uri = uri.clone();
            let call = self.collapse.do_call(key, move || async move {
                match pool.fetch_buffered(method, call_uri, headers).await {
                    Ok((status, headers, body)) => CollapsedOutcome {
                        ok: true,
                        status,
                        headers,
                        body,
                    },
                    Err(err) => {
                        log::warn!("collapsed fetch failed: {err}");
                        CollapsedOutcome {
                            ok: false,
                            status: StatusCode::INTERNAL_SERVER_ERROR,
                            headers: HeaderMap::new(),
                            body: Bytes::new(),
                        }
                    }
                }
            });
            let outcome = if self.cfg.collapsed_wait > Duration::ZERO {
                match tokio::time::timeout(self.cfg.collapsed_wait, call).await {
                    Ok(outcome) => Some(outcome),
                    Err(_) => None,
                }
            } else {
                Some(call.await)
            };
            match outcome {
                Some(outcome) if outcome.ok => {
                    return Ok((
                        outcome.status,
                        outcome.headers,
                        UpstreamBody::Buffered(Full::new(outcome.body)),
                    ));
                }
                // a failed or timed-out collapse: every waiter retries on
                // its own
                _ => {
                    let (status, headers, body) = self
                        .pool
                        .fetch_buffered(out.method.clone(), uri, out.headers.clone())
                        .await?;
                    return Ok((status, headers, UpstreamBody::Buffered(Full::new(body))));
                }
            }
        }

        let (status, headers, body) = self
            .pool
            .fetch_stream(out.method.clone(), uri, out.headers.clone())
            .await?;
        Ok((status, headers, UpstreamBody::Incoming(body)))
    }

    /// Build the client response around a (possibly stored) upstream body.
    #[allow(clippy::too_many_arguments)]
    fn respond_with_upstream(
        &self,
        req: &ClientRequest,
        ex: &mut Exchange,
        head: ResponseHead,
        body: UpstreamBody,
        storable: bool,
        range_raw: Option<&str>,
        entry_size: u64,
    ) -> Response<ProxyBody> {
        let mut resp_headers = head.headers.clone();
        self.stamp(req, ex, ex.md.as_ref(), &mut resp_headers);
        metrics::record_cache_status(ex.status);

        if req.method == Method::HEAD {
            metrics::record_status(head.status);
            return response(head.status, resp_headers, ProxyBody::empty());
        }
        // other statuses are forwarded untouched, never stored
        if !matches!(head.status, StatusCode::OK | StatusCode::PARTIAL_CONTENT) {
            metrics::record_status(head.status);
            return response(
                head.status,
                resp_headers,
                ProxyBody::stream(body_stream(body)),
            );
        }

        let stream: ByteStream = if storable {
            let md = ex.md.clone().expect("storable implies metadata");
            let shared = Arc::new(Mutex::new(md));
            let bucket = Arc::clone(&ex.bucket);
            let start = head.content_range.map(|cr| cr.start).unwrap_or(0);
            let writer: BlockFn = if self.cfg.async_flush_chunk {
                let async_writer = AsyncBlockWriter::spawn(
                    8,
                    block_writer(Arc::clone(&bucket), Arc::clone(&shared), ex.chunked),
                );
                let f = async_writer.block_fn();
                // finishing the queue happens in the close callback below
                let close_bucket = Arc::clone(&bucket);
                let close_shared = Arc::clone(&shared);
                let close: CloseFn = Box::new(move |_eof| {
                    if let Err(err) = async_writer.finish() {
                        log::warn!("async block writer failed: {err}");
                        let md = close_shared.lock().expect("in-flight metadata");
                        let _ = close_bucket.discard_with_metadata(&md);
                        return;
                    }
                    let md = close_shared.lock().expect("in-flight metadata");
                    if let Err(err) = close_bucket.store(&md) {
                        log::warn!("store of {} failed: {err}", md.id);
                    }
                });
                let sink = BlockSink::new(self.block_size_of(ex), start, f);
                return self.finish_streaming(
                    req, ex, head, resp_headers,
                    save_block_stream(
                        body,
                        sink,
                        discard_on_error(Arc::clone(&bucket), shared),
                        close,
                    )
                    .boxed(),
                    range_raw,
                    entry_size,
                );
            } else {
                block_writer(Arc::clone(&bucket), Arc::clone(&shared), ex.chunked)
            };
            let sink = BlockSink::new(self.block_size_of(ex), start, writer);
            save_block_stream(
                body,
                sink,
                discard_on_error(Arc::clone(&bucket), Arc::clone(&shared)),
                store_on_close(bucket, shared),
            )
            .boxed()
        } else {
            body_stream(body).boxed()
        };

        self.finish_streaming(req, ex, head, resp_headers, stream, range_raw, entry_size)
    }

    /// Apply range windowing, the prefetch drain, and final headers.
    #[allow(clippy::too_many_arguments)]
    fn finish_streaming(
        &self,
        req: &ClientRequest,
        ex: &Exchange,
        head: ResponseHead,
        mut resp_headers: HeaderMap,
        stream: ByteStream,
        range_raw: Option<&str>,
        entry_size: u64,
    ) -> Response<ProxyBody> {
        let _ = req;
        if ex.prefetch {
            // drain to storage in the background, answer with headers only
            tokio::spawn(async move {
                let mut stream = stream;
                while let Some(item) = stream.next().await {
                    if item.is_err() {
                        break;
                    }
                }
            });
            resp_headers.insert(header::CONTENT_LENGTH, "0".parse().expect("length"));
            metrics::record_status(head.status);
            return response(head.status, resp_headers, ProxyBody::empty());
        }

        // honour the client range when the upstream reply is broader
        if let Some(raw) = range_raw {
            let total = head.content_range.map(|cr| cr.size).unwrap_or(entry_size);
            if total > 0 {
                if let Ok(range) = parse_range(raw, total) {
                    let resp_start = head.content_range.map(|cr| cr.start).unwrap_or(0);
                    if range.start >= resp_start {
                        let skip = range.start - resp_start;
                        let len = range.len();
                        resp_headers.insert(
                            header::CONTENT_RANGE,
                            build_content_range(range.start, range.end, total)
                                .parse()
                                .expect("content range"),
                        );
                        resp_headers.insert(
                            header::CONTENT_LENGTH,
                            len.to_string().parse().expect("length"),
                        );
                        metrics::record_status(StatusCode::PARTIAL_CONTENT);
                        let storing = ex.cacheable;
                        return response(
                            StatusCode::PARTIAL_CONTENT,
                            resp_headers,
                            ProxyBody::stream(clip(stream, skip, len, storing)),
                        );
                    }
                }
            }
        }

        metrics::record_status(head.status);
        response(head.status, resp_headers, ProxyBody::stream(stream))
    }

    fn range_not_satisfiable(
        &self,
        ex: &mut Exchange,
        md: &Metadata,
        size: u64,
    ) -> Response<ProxyBody> {
        let mut headers = metadata_headers(md);
        headers.remove(header::CONTENT_LENGTH);
        headers.insert(
            header::CONTENT_RANGE,
            unsatisfied_content_range(size).parse().expect("content range"),
        );
        headers.insert(
            constants::PROTOCOL_CACHE_STATUS_KEY,
            x_cache_value(ex.status, &self.cfg.hostname),
        );
        metrics::record_status(StatusCode::RANGE_NOT_SATISFIABLE);
        response(StatusCode::RANGE_NOT_SATISFIABLE, headers, ProxyBody::empty())
    }

    #[allow(clippy::too_many_arguments)]
    fn mark_status(
        &self,
        ex: &mut Exchange,
        md: &Metadata,
        unbounded: bool,
        range: RangeSpec,
        block_size: u64,
        have: &Bitmap,
    ) {
        let hit_status = if ex.hot {
            CacheStatus::HotHit
        } else {
            CacheStatus::Hit
        };
        if ex.status == CacheStatus::RevalidateHit {
            return;
        }
        if unbounded || md.size == 0 {
            ex.status = hit_status;
            return;
        }
        let (first, last) = block_span(range.start, range.end, block_size);
        ex.status = if full_hit(first, last, have) {
            hit_status
        } else if part_hit(first, last, have) {
            CacheStatus::PartHit
        } else {
            CacheStatus::PartMiss
        };
    }

    fn block_size_of(&self, ex: &Exchange) -> u64 {
        ex.md
            .as_ref()
            .map(|md| md.block_size)
            .filter(|b| *b > 0)
            .unwrap_or(self.cfg.slice_size)
    }

    /// Probabilistic early refresh inside the soft-TTL window.
    fn maybe_fuzzy_refresh(&self, req: &ClientRequest, ex: &Exchange, store_key: &str) {
        if !self.cfg.fuzzy_refresh || self.cfg.fuzzy_refresh_rate <= 0.0 {
            return;
        }
        let Some(md) = &ex.md else { return };
        if !md.has_complete() || !revalidate::has_validators(md) || md.expires_at <= md.resp_unix {
            return;
        }
        let rate = if self.cfg.fuzzy_refresh_rate > 1.0 {
            0.8
        } else {
            self.cfg.fuzzy_refresh_rate
        };
        let now = storage::unix_now();
        let ttl = (md.expires_at - md.resp_unix) as f64;
        let soft = md.resp_unix + (ttl * rate) as i64;
        if now < soft || now >= md.expires_at {
            return;
        }
        let window = (md.expires_at - soft) as f64;
        let probability = (now - soft) as f64 / window.max(1.0);
        if rand::thread_rng().gen::<f64>() >= probability {
            return;
        }

        let pool = Arc::clone(&self.pool);
        let locks = Arc::clone(&self.locks);
        let req = req.clone();
        let md = md.clone();
        let store_key = store_key.to_string();
        let bucket = Arc::clone(&ex.bucket);
        tokio::spawn(async move {
            if let Err(err) = refresh_record(pool, locks, &req, &bucket, md, &store_key).await {
                log::debug!("fuzzy refresh of {store_key} failed: {err}");
            }
        });
    }

    /// X-Cache, freshness stamps, and the debug swap-file trace.
    fn stamp(
        &self,
        req: &ClientRequest,
        ex: &Exchange,
        md: Option<&Metadata>,
        headers: &mut HeaderMap,
    ) {
        headers.insert(
            constants::PROTOCOL_CACHE_STATUS_KEY,
            x_cache_value(ex.status, &self.cfg.hostname),
        );
        if let Some(md) = md {
            let now = storage::unix_now();
            let age = (now - md.resp_unix).max(0);
            if let Ok(value) = age.to_string().parse() {
                headers.insert(header::AGE, value);
            }
            if let Some(date) = http_date(md.resp_unix) {
                if let Ok(value) = date.parse() {
                    headers.insert(header::DATE, value);
                }
            }
            if md.expires_at > 0 {
                if let Some(expires) = http_date(md.expires_at) {
                    if let Ok(value) = expires.parse() {
                        headers.insert(header::EXPIRES, value);
                    }
                }
            }
        }
        if req.headers.contains_key(constants::INTERNAL_TRACE_KEY) {
            let path = ex.id.wpath(ex.bucket.path());
            if let Ok(value) = path.to_string_lossy().parse() {
                headers.insert(constants::INTERNAL_SWAPFILE, value);
            }
        }
    }
}

/// Compare a sub-request response head against the record being served.
/// Returns a human-readable reason when the origin object is no longer
/// the entity the record describes.
fn entity_mismatch(shared_md: &Arc<Mutex<Metadata>>, headers: &HeaderMap) -> Option<String> {
    let md = shared_md.lock().expect("in-flight metadata");
    if let Some(cr) = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
    {
        if cr.size != md.size {
            return Some(format!("length {} -> {}", md.size, cr.size));
        }
    }
    let new_etag = headers.get("ETag").and_then(|v| v.to_str().ok());
    if let (Some(old), Some(new)) = (md.header("ETag"), new_etag) {
        if !old.eq_ignore_ascii_case(new) {
            return Some(format!("etag {old:?} -> {new:?}"));
        }
    }
    let new_lm = headers
        .get("Last-Modified")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok());
    if let Some(new) = new_lm {
        if let Some(old) = md
            .header("Last-Modified")
            .and_then(|v| httpdate::parse_http_date(v).ok())
        {
            if old != new {
                return Some("last-modified moved".to_string());
            }
        }
    }
    None
}

/// Background conditional refresh driven by the fuzzy-refresh window.
/// Takes the per-object write lock so it never races a revalidation.
async fn refresh_record(
    pool: Arc<UpstreamPool>,
    locks: Arc<KeyedLocks>,
    req: &ClientRequest,
    bucket: &Arc<dyn Bucket>,
    mut md: Metadata,
    store_key: &str,
) -> anyhow::Result<()> {
    let lock = locks.lock_for(store_key);
    let _guard = lock.write().await;

    let mut out = outbound_from(req);
    out.headers.remove(header::RANGE);
    if let Some(etag) = md.header("ETag") {
        out.headers.insert("If-None-Match", etag.parse()?);
    }
    if let Some(modified) = md.header("Last-Modified") {
        out.headers.insert("If-Modified-Since", modified.parse()?);
    }
    let override_addr = header_str(&req.headers, constants::INTERNAL_UPSTREAM_ADDR);
    let base = pool
        .select_base(override_addr, Some(&md.id.hash().0))
        .map_err(|e| anyhow!("{e}"))?;
    let uri = crate::proxy::join_uri(&base, &out.path_and_query).map_err(|e| anyhow!("{e}"))?;
    let (status, headers, _body) = pool
        .fetch_buffered(Method::HEAD, uri, out.headers)
        .await
        .map_err(|e| anyhow!("{e}"))?;

    if status == StatusCode::NOT_MODIFIED || status.is_success() {
        if let Some(ttl) = parse_cache_ttl(&headers) {
            let now = storage::unix_now();
            md.resp_unix = now;
            md.expires_at = now + ttl.as_secs() as i64;
            bucket.store(&md)?;
        }
    } else {
        let _ = bucket.discard_with_metadata(&md);
    }
    Ok(())
}

/// Blocks a record claims to have, restricted to those whose bytes are
/// actually on disk: the slice file for `chunks` bits, the legacy single
/// file for `parts` bits whose slice is absent.
fn effective_have(
    md: &Metadata,
    bucket: &Arc<dyn Bucket>,
    first: u32,
    last: u32,
) -> Bitmap {
    let mut have = Bitmap::new();
    let mut legacy_present: Option<bool> = None;
    for index in first..=last {
        if md.chunks.contains(index) && md.id.wpath_slice(bucket.path(), index).exists() {
            have.set(index);
            continue;
        }
        if md.parts.contains(index) {
            let present = *legacy_present
                .get_or_insert_with(|| md.id.wpath(bucket.path()).exists());
            if present {
                have.set(index);
            }
        }
    }
    have
}

/// Writes one completed block to its slice file and flips the bitmap
/// bits. Boundary blocks that are neither full nor final are skipped; for
/// chunked objects the size grows with every block.
fn block_writer(bucket: Arc<dyn Bucket>, shared: Arc<Mutex<Metadata>>, chunked: bool) -> BlockFn {
    Box::new(move |buf, index, end_pos, eof| {
        let mut md = shared.lock().expect("in-flight metadata");
        if chunked {
            md.size = end_pos;
            let length = end_pos.to_string();
            md.set_header("Content-Length", &length);
        } else if buf.len() as u64 != md.block_size && end_pos != md.size {
            log::debug!("skipping ragged block {index} ({} bytes)", buf.len());
            return Ok(());
        }
        let _ = eof;
        bucket
            .write_block(&md.id, index, buf)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        md.chunks.set(index);
        md.parts.set(index);
        Ok(())
    })
}

fn store_on_close(bucket: Arc<dyn Bucket>, shared: Arc<Mutex<Metadata>>) -> CloseFn {
    Box::new(move |eof| {
        let md = shared.lock().expect("in-flight metadata");
        if !eof && !md.is_chunked() && md.present_blocks().count() == 0 {
            // nothing was persisted, don't create an empty record
            return;
        }
        if let Err(err) = bucket.store(&md) {
            log::warn!("store of {} failed: {err}", md.id);
        }
    })
}

fn discard_on_error(bucket: Arc<dyn Bucket>, shared: Arc<Mutex<Metadata>>) -> ErrorFn {
    Box::new(move |err| {
        log::warn!("write-through failed: {err}");
        let md = shared.lock().expect("in-flight metadata");
        let _ = bucket.discard_with_metadata(&md);
    })
}

/// Adapt any upstream body into the composer's byte-stream shape.
fn body_stream<B>(body: B) -> impl futures::Stream<Item = Result<Bytes, BoxError>> + Send
where
    B: http_body::Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    futures::stream::try_unfold(body, |mut body| async move {
        use http_body_util::BodyExt;
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        if data.is_empty() {
                            continue;
                        }
                        return Ok(Some((data, body)));
                    }
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(None),
            }
        }
    })
}

pub fn build_store_key(req: &ClientRequest, include_query: bool) -> Option<String> {
    if let Some(raw) = header_str(&req.headers, constants::STORE_URL_KEY) {
        if let Ok(uri) = raw.parse::<http::Uri>() {
            if let Some(authority) = uri.authority() {
                let scheme = uri.scheme_str().unwrap_or("http");
                let path = if include_query {
                    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
                } else {
                    uri.path()
                };
                return Some(format!("{scheme}://{authority}{path}"));
            }
        }
    }
    let scheme = req.uri.scheme_str().unwrap_or("http");
    let host = req
        .uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| header_str(&req.headers, header::HOST).map(|h| h.to_string()))?;
    let path = if include_query {
        req.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    } else {
        req.uri.path()
    };
    Some(format!("{scheme}://{host}{path}"))
}

fn outbound_from(req: &ClientRequest) -> OutboundRequest {
    let mut headers = strip_hop_headers(&req.headers);
    for name in [
        constants::INTERNAL_UPSTREAM_ADDR,
        constants::STORE_URL_KEY,
        constants::PROTOCOL_CACHE_STATUS_KEY,
    ] {
        headers.remove(name);
    }
    OutboundRequest {
        method: req.method.clone(),
        path_and_query: req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers,
    }
}

pub fn parse_cache_ttl(headers: &HeaderMap) -> Option<Duration> {
    if let Some(raw) = header_str(headers, constants::CACHE_TIME) {
        if let Ok(secs) = raw.parse::<u64>() {
            if secs > 0 {
                return Some(Duration::from_secs(secs));
            }
        }
    }
    if let Some(raw) = header_str(headers, header::CACHE_CONTROL) {
        for directive in raw.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if directive == "no-store" || directive == "no-cache" || directive == "private" {
                return None;
            }
        }
        for directive in raw.split(',') {
            let directive = directive.trim();
            for prefix in ["max-age=", "s-maxage="] {
                if let Some(value) = directive.strip_prefix(prefix) {
                    if let Ok(secs) = value.trim().parse::<u64>() {
                        return Some(Duration::from_secs(secs));
                    }
                }
            }
        }
    }
    if let Some(raw) = header_str(headers, header::EXPIRES) {
        if let Ok(when) = httpdate::parse_http_date(raw) {
            if let Ok(left) = when.duration_since(SystemTime::now()) {
                return Some(left);
            }
        }
    }
    None
}

fn header_str<'h>(headers: &'h HeaderMap, name: impl header::AsHeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

pub fn strip_hop_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_header(name.as_str()) {
            continue;
        }
        out.append(name, value.clone());
    }
    out
}

/// Headers worth persisting on a record: hop-by-hop and per-request
/// internals are dropped.
fn persistable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_header(&lower)
            || lower == "x-cache"
            || lower == "age"
            || lower == "content-range"
            || lower.starts_with("i-x-")
        {
            continue;
        }
        out.append(name, value.clone());
    }
    out
}

fn metadata_headers(md: &Metadata) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &md.headers {
        if is_hop_header(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(name.as_bytes()),
            header::HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

fn x_cache_value(status: CacheStatus, hostname: &str) -> header::HeaderValue {
    format!("{} from {} ({})", status.as_str(), hostname, constants::SERVER_TOKEN)
        .parse()
        .unwrap_or_else(|_| header::HeaderValue::from_static("MISS"))
}

fn http_date(unix: i64) -> Option<String> {
    if unix < 0 {
        return None;
    }
    Some(httpdate::fmt_http_date(
        UNIX_EPOCH + Duration::from_secs(unix as u64),
    ))
}

fn response(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Response<ProxyBody> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(body).expect("response build")
}

fn text_response(status: StatusCode, text: &str) -> Response<ProxyBody> {
    metrics::record_status(status);
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CONTENT_LENGTH, text.len().to_string())
        .body(ProxyBody::text(text))
        .expect("response build")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, headers: &[(&str, &str)]) -> ClientRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        ClientRequest {
            method: Method::GET,
            uri: uri.parse().unwrap(),
            headers: map,
        }
    }

    #[test]
    fn store_key_prefers_the_override_header() {
        let req = request("/ignored/path", &[("X-Store-Url", "http://h/a/x?q=1")]);
        assert_eq!(build_store_key(&req, false).unwrap(), "http://h/a/x");
        assert_eq!(build_store_key(&req, true).unwrap(), "http://h/a/x?q=1");
    }

    #[test]
    fn store_key_falls_back_to_host_header() {
        let req = request("/a/b?x=2", &[("host", "origin:8080")]);
        assert_eq!(build_store_key(&req, false).unwrap(), "http://origin:8080/a/b");
        assert_eq!(
            build_store_key(&req, true).unwrap(),
            "http://origin:8080/a/b?x=2"
        );
        let no_host = request("/a", &[]);
        assert!(build_store_key(&no_host, false).is_none());
    }

    #[test]
    fn ttl_prefers_cachetime_then_max_age() {
        let mut headers = HeaderMap::new();
        headers.insert("Cache-Control", "max-age=60".parse().unwrap());
        assert_eq!(parse_cache_ttl(&headers), Some(Duration::from_secs(60)));
        headers.insert(constants::CACHE_TIME, "120".parse().unwrap());
        assert_eq!(parse_cache_ttl(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn no_store_defeats_caching() {
        let mut headers = HeaderMap::new();
        headers.insert("Cache-Control", "no-store, max-age=60".parse().unwrap());
        assert_eq!(parse_cache_ttl(&headers), None);
    }

    #[test]
    fn effective_have_checks_files_not_just_bits() {
        use crate::storage::bucket::disk::DiskBucket;
        use crate::storage::indexdb::SledIndexDB;
        use crate::storage::sharedkv::MemSharedKV;

        let dir = tempfile::tempdir().unwrap();
        let bucket: Arc<dyn Bucket> = DiskBucket::new(
            dir.path().to_path_buf(),
            "disk-t",
            SledIndexDB::temporary().unwrap(),
            MemSharedKV::new(),
            false,
            None,
            "normal".to_string(),
        )
        .unwrap();

        let id = Id::new("http://h/legacy");
        let mut md = Metadata::new(id.clone(), 8, 0);
        md.size = 24;
        // block 0: slice bit with its file present
        bucket.write_block(&id, 0, b"01234567").unwrap();
        md.chunks.set(0);
        // block 1: slice bit but the file was lost
        md.chunks.set(1);
        // block 2: legacy single-file bit, with the file present
        let legacy = id.wpath(bucket.path());
        std::fs::create_dir_all(legacy.parent().unwrap()).unwrap();
        std::fs::write(&legacy, vec![0u8; 24]).unwrap();
        md.parts.set(2);

        let have = effective_have(&md, &bucket, 0, 2);
        assert!(have.contains(0));
        assert!(!have.contains(1));
        assert!(have.contains(2));
    }

    #[test]
    fn hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", "keep-alive".parse().unwrap());
        headers.insert("Content-Type", "text/plain".parse().unwrap());
        let out = strip_hop_headers(&headers);
        assert!(out.get("Connection").is_none());
        assert!(out.get("Content-Type").is_some());
    }
}
