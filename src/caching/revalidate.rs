//! Expiry handling: fresh records hit directly; expired records with
//! validators trigger a conditional upstream round trip, expired records
//! without validators are discarded and refetched.

use anyhow::Result;
use http::StatusCode;

use crate::caching::processor::{Exchange, OutboundRequest, PostOutcome, ResponseHead};
use crate::http_range::ContentRange;
use crate::storage::object::Metadata;
use crate::storage::{unix_now, CacheStatus};

pub struct Revalidate;

impl Revalidate {
    pub fn lookup(&self, ex: &mut Exchange) -> Result<bool> {
        let Some(md) = &ex.md else {
            return Ok(false);
        };
        if !md.expired(unix_now()) {
            return Ok(true);
        }

        ex.revalidate = true;
        if md.has_complete() && has_validators(md) {
            ex.status = CacheStatus::RevalidateHit;
            return Ok(false);
        }

        // Nothing to validate against: the stale record is useless.
        ex.status = CacheStatus::RevalidateMiss;
        if let Err(err) = ex.bucket.discard_with_metadata(md) {
            log::warn!("discard of stale {} failed: {err}", ex.id);
        }
        ex.md = None;
        ex.revalidate = false;
        Ok(false)
    }

    pub fn pre_request(&self, ex: &mut Exchange, out: &mut OutboundRequest) -> Result<()> {
        if !ex.revalidate {
            return Ok(());
        }
        let Some(md) = &ex.md else {
            return Ok(());
        };
        if let Some(etag) = md.header("ETag") {
            if let Ok(value) = etag.parse() {
                out.headers.insert("If-None-Match", value);
            }
        }
        if let Some(modified) = md.header("Last-Modified") {
            if let Ok(value) = modified.parse() {
                out.headers.insert("If-Modified-Since", value);
            }
        }
        // The conditional request validates the whole object; the client's
        // range is replayed from storage on a 304.
        if let Some(range) = out.headers.remove(http::header::RANGE) {
            if let Ok(raw) = range.to_str() {
                ex.stashed_range = Some(raw.to_string());
            }
        }
        Ok(())
    }

    pub fn post_request(&self, ex: &mut Exchange, head: &mut ResponseHead) -> Result<PostOutcome> {
        if !ex.revalidate {
            return Ok(PostOutcome::Forward);
        }
        if head.status != StatusCode::NOT_MODIFIED {
            ex.status = CacheStatus::RevalidateMiss;
            if let Some(md) = &ex.md {
                if let Err(err) = ex.bucket.discard_with_metadata(md) {
                    log::warn!("discard of changed {} failed: {err}", ex.id);
                }
            }
            // the fresh body is re-stored under a record with clean bitmaps
            ex.md = ex.md.take().map(|old| {
                let mut fresh = Metadata::new(old.id.clone(), old.block_size, unix_now());
                fresh.code = old.code;
                fresh.size = old.size;
                fresh.resp_unix = old.resp_unix;
                fresh.expires_at = old.expires_at;
                fresh
            });
            return Ok(PostOutcome::Forward);
        }

        self.freshen(ex, head);
        ex.status = CacheStatus::RevalidateHit;
        Ok(PostOutcome::ServeStored)
    }

    /// Refresh expiry and the validator headers from a 304; body bytes and
    /// block bitmaps are untouched.
    fn freshen(&self, ex: &mut Exchange, head: &ResponseHead) {
        let Some(md) = ex.md.as_mut() else { return };
        let now = unix_now();
        let ttl = crate::caching::parse_cache_ttl(&head.headers)
            .or_else(|| pairs_ttl(md))
            .unwrap_or_default();
        md.resp_unix = now;
        md.last_ref_unix = now;
        md.expires_at = now + ttl.as_secs() as i64;
        for name in ["Last-Modified", "ETag", "Cache-Control"] {
            if let Some(value) = head.headers.get(name).and_then(|v| v.to_str().ok()) {
                md.set_header(name, value);
            }
        }
        ex.cacheable = true;
        if let Err(err) = ex.bucket.store(md) {
            log::warn!("store of freshened {} failed: {err}", ex.id);
        }
    }
}

fn pairs_ttl(md: &Metadata) -> Option<std::time::Duration> {
    let mut headers = http::HeaderMap::new();
    if let Some(value) = md.header("Cache-Control") {
        if let Ok(parsed) = value.parse() {
            headers.insert("Cache-Control", parsed);
        }
    }
    crate::caching::parse_cache_ttl(&headers)
}

pub fn has_validators(md: &Metadata) -> bool {
    md.header("ETag").is_some() || md.header("Last-Modified").is_some()
}

/// Total object size claimed by a response head, from `Content-Range`
/// first, then `Content-Length`.
pub fn claimed_total(head: &ResponseHead) -> Option<u64> {
    if let Some(ContentRange { size, .. }) = head.content_range {
        return Some(size);
    }
    head.headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
