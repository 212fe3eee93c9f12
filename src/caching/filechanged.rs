//! Detects an origin object that silently changed underneath a stored
//! record by comparing length, ETag and Last-Modified on every plain
//! upstream response. A mismatch discards the record so the fresh body is
//! re-stored from scratch.

use anyhow::Result;

use crate::caching::processor::{Exchange, PostOutcome, ResponseHead};
use crate::caching::revalidate::claimed_total;

pub struct FileChanged;

impl FileChanged {
    pub fn post_request(&self, ex: &mut Exchange, head: &mut ResponseHead) -> Result<PostOutcome> {
        let Some(md) = &ex.md else {
            return Ok(PostOutcome::Forward);
        };
        if ex.revalidate || ex.chunked || md.is_vary_index() || md.size == 0 {
            return Ok(PostOutcome::Forward);
        }

        let mut changed = false;

        if let Some(total) = claimed_total(head) {
            if total != md.size {
                changed = true;
                log::warn!(
                    "file changed: length {} -> {} for {}",
                    md.size,
                    total,
                    ex.id
                );
            }
        }

        if !changed {
            let old_etag = md.header("ETag");
            let new_etag = head.headers.get("ETag").and_then(|v| v.to_str().ok());
            if let (Some(old), Some(new)) = (old_etag, new_etag) {
                if !old.eq_ignore_ascii_case(new) {
                    changed = true;
                    log::warn!("file changed: etag {old:?} -> {new:?} for {}", ex.id);
                }
            }
        }

        if !changed {
            let old_lm = md.header("Last-Modified").and_then(parse_http_date);
            let new_lm = head
                .headers
                .get("Last-Modified")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_http_date);
            if let (Some(old), Some(new)) = (old_lm, new_lm) {
                if old != new {
                    changed = true;
                    log::warn!("file changed: last-modified moved for {}", ex.id);
                }
            }
        }

        if changed {
            ex.file_changed = true;
            if let Err(err) = ex.bucket.discard_with_metadata(md) {
                log::warn!("discard of changed {} failed: {err}", ex.id);
            }
            // keep a fresh record in the exchange so the new body can be
            // stored with clean bitmaps
            let mut fresh = crate::storage::object::Metadata::new(
                md.id.clone(),
                md.block_size,
                crate::storage::unix_now(),
            );
            fresh.size = claimed_total(head).unwrap_or(0);
            ex.md = Some(fresh);
        }
        Ok(PostOutcome::Forward)
    }
}

fn parse_http_date(raw: &str) -> Option<std::time::SystemTime> {
    httpdate::parse_http_date(raw).ok()
}
