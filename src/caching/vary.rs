//! Multi-variant objects. A URL whose responses carry `Vary` is stored as
//! a root *vary index* (no body, a list of variant discriminators) plus
//! one *vary cache* record per variant. Lookups against the index use
//! Accept-Encoding compatibility matching when that axis is present and
//! exact discriminator equality otherwise.

use std::collections::HashSet;

use anyhow::Result;

use crate::caching::processor::{ClientRequest, Exchange, PostOutcome, ResponseHead};
use crate::http_vary::{
    build_vary_key, clean_vary, encoding_from_vary_key, normalize_content_encoding,
    parse_accept_encoding, supports_encoding,
};
use crate::storage::object::{CacheFlag, Id, Metadata};
use crate::storage::unix_now;

pub struct Vary {
    max_limit: usize,
    ignore: HashSet<String>,
}

impl Vary {
    pub fn new(max_limit: usize, ignore: HashSet<String>) -> Self {
        Self { max_limit, ignore }
    }

    pub fn lookup(&self, ex: &mut Exchange, req: &ClientRequest) -> Result<bool> {
        let Some(md) = &ex.md else {
            return Ok(false);
        };
        if md.is_vary_index() {
            return self.lookup_variant(ex, req);
        }
        // normal records and vary caches hit directly
        Ok(true)
    }

    fn lookup_variant(&self, ex: &mut Exchange, req: &ClientRequest) -> Result<bool> {
        let md = ex.md.as_ref().expect("vary index present");
        if md.virtual_key.is_empty() {
            return Ok(false);
        }
        let vary_set = self.vary_set_of(md);
        if vary_set.is_empty() {
            return Ok(false);
        }

        let has_accept_encoding = vary_set.iter().any(|k| k == "accept-encoding");
        let accept = req
            .headers
            .get(http::header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(parse_accept_encoding)
            .unwrap_or_default();

        if has_accept_encoding && !accept.is_empty() {
            return Ok(self.match_compatible(ex, req, &accept));
        }
        Ok(self.match_exact(ex, req, &vary_set))
    }

    /// First variant whose stored Content-Encoding the client accepts, in
    /// variant-list order.
    fn match_compatible(
        &self,
        ex: &mut Exchange,
        _req: &ClientRequest,
        accept: &[crate::http_vary::AcceptEncoding],
    ) -> bool {
        let index = ex.md.as_ref().expect("vary index present").clone();
        for vkey in &index.virtual_key {
            let Some(vmd) = self.resolve_variant(ex, &index, vkey) else {
                continue;
            };
            let encoding = vmd
                .header("Content-Encoding")
                .map(normalize_content_encoding)
                .or_else(|| encoding_from_vary_key(vkey).map(normalize_content_encoding))
                .unwrap_or_default();
            if supports_encoding(accept, &encoding) {
                self.redirect(ex, index, vmd);
                return true;
            }
        }
        false
    }

    /// Exact equality between the request-derived discriminator and a
    /// known variant key.
    fn match_exact(&self, ex: &mut Exchange, req: &ClientRequest, vary_set: &[String]) -> bool {
        let index = ex.md.as_ref().expect("vary index present").clone();
        // the request side stands in for the response here: for the
        // accept-encoding axis an absent header selects the identity
        // variant, which has no accept-encoding pair in its key
        let expected = build_vary_key(vary_set, &req.headers, &http::HeaderMap::new());
        for vkey in &index.virtual_key {
            if *vkey != expected {
                continue;
            }
            if let Some(vmd) = self.resolve_variant(ex, &index, vkey) {
                self.redirect(ex, index, vmd);
                return true;
            }
        }
        false
    }

    fn resolve_variant(&self, ex: &Exchange, index: &Metadata, vkey: &str) -> Option<Metadata> {
        let vid = Id::new_virtual(index.id.path(), vkey);
        match ex.bucket.lookup(&vid) {
            Ok(Some(vmd)) if vmd.is_vary_cache() => Some(vmd),
            Ok(_) => None, // stale pointer
            Err(err) => {
                log::warn!("variant lookup {vid} failed: {err}");
                None
            }
        }
    }

    fn redirect(&self, ex: &mut Exchange, index: Metadata, variant: Metadata) {
        ex.id = variant.id.clone();
        ex.root_md = Some(index);
        ex.md = Some(variant);
    }

    pub fn post_request(
        &self,
        ex: &mut Exchange,
        req: &ClientRequest,
        head: &mut ResponseHead,
    ) -> Result<PostOutcome> {
        let Some(md) = &ex.md else {
            return Ok(PostOutcome::Forward);
        };

        let raw_vary: Vec<&str> = head
            .headers
            .get_all("Vary")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let vary_set: Vec<String> = clean_vary(&raw_vary)
            .into_iter()
            .filter(|k| !self.ignore.contains(k))
            .collect();

        if vary_set.iter().any(|k| k == "*") {
            // Vary: * responses are uncacheable
            ex.cacheable = false;
            return Ok(PostOutcome::Forward);
        }

        if vary_set.is_empty() {
            if md.is_vary_index() {
                let mut demoted = md.clone();
                demoted.flags = CacheFlag::CACHE;
                demoted.virtual_key.clear();
                if let Err(err) = ex.bucket.store(&demoted) {
                    log::warn!("demote of {} failed: {err}", ex.id);
                }
                ex.md = Some(demoted);
            }
            return Ok(PostOutcome::Forward);
        }

        let vkey = build_vary_key(&vary_set, &req.headers, &head.headers);
        if vkey.is_empty() {
            return Ok(PostOutcome::Forward);
        }

        if md.is_vary_index() {
            let mut index = md.clone();
            // the index never carries body state, whatever the driver
            // staged on it for this response
            index.size = 0;
            index.parts = Default::default();
            index.chunks = Default::default();
            index.headers = header_pairs(&head.headers);
            self.admit_variant(&mut index, &vkey);
            self.store_index(ex, &index);
            self.point_at_variant(ex, index, &vkey, head);
        } else if md.is_vary_cache() {
            if let Some(root) = ex.root_md.clone() {
                let mut index = root;
                self.admit_variant(&mut index, &vkey);
                self.store_index(ex, &index);
                ex.root_md = Some(index);
            }
        } else {
            // normal record upgrades to an index plus its first variant
            let mut index = md.clone();
            index.flags = CacheFlag::VARY_INDEX;
            index.size = 0;
            index.parts = Default::default();
            index.chunks = Default::default();
            index.headers = header_pairs(&head.headers);
            index.virtual_key = vec![vkey.clone()];
            self.store_index(ex, &index);
            self.point_at_variant(ex, index, &vkey, head);
        }
        Ok(PostOutcome::Forward)
    }

    /// Dedup, cap at the configured limit, oldest first out.
    fn admit_variant(&self, index: &mut Metadata, vkey: &str) {
        if !index.virtual_key.iter().any(|k| k == vkey) {
            index.virtual_key.push(vkey.to_string());
            while index.virtual_key.len() > self.max_limit {
                index.virtual_key.remove(0);
            }
        }
    }

    fn store_index(&self, ex: &Exchange, index: &Metadata) {
        if let Err(err) = ex.bucket.store(index) {
            log::warn!("store of vary index {} failed: {err}", index.id);
        }
    }

    /// Redirect the exchange's write target to the variant record so the
    /// driver persists the body under the discriminated id.
    fn point_at_variant(&self, ex: &mut Exchange, index: Metadata, vkey: &str, head: &ResponseHead) {
        let vid = Id::new_virtual(index.id.path(), vkey);
        let now = unix_now();
        let mut variant = match ex.bucket.lookup(&vid) {
            Ok(Some(existing)) if existing.is_vary_cache() => existing,
            _ => Metadata::new(vid.clone(), index.block_size, now),
        };
        variant.flags = CacheFlag::VARY_CACHE;
        if ex.chunked {
            variant.flags.insert(CacheFlag::CHUNKED);
        }
        if variant.block_size == 0 {
            variant.block_size = index.block_size;
        }
        variant.size = crate::caching::revalidate::claimed_total(head).unwrap_or(0);
        variant.resp_unix = now;
        variant.last_ref_unix = now;
        variant.expires_at = index.expires_at;
        variant.code = if head.status == http::StatusCode::PARTIAL_CONTENT {
            200
        } else {
            head.status.as_u16()
        };
        ex.id = vid;
        ex.root_md = Some(index);
        ex.md = Some(variant);
    }

    fn vary_set_of(&self, md: &Metadata) -> Vec<String> {
        let raw: Vec<&str> = md
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("Vary"))
            .map(|(_, v)| v.as_str())
            .collect();
        clean_vary(&raw)
            .into_iter()
            .filter(|k| !self.ignore.contains(k))
            .collect()
    }
}

pub fn header_pairs(headers: &http::HeaderMap) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            pairs.push((name.as_str().to_string(), value.to_string()));
        }
    }
    pairs
}
