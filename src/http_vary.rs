//! Vary discriminator construction and Accept-Encoding content negotiation.
//!
//! A variant of a cached URL is identified by a key of the form
//! `name=value&name2=value2` built from the response's `Vary` set. For the
//! `Accept-Encoding` axis the value is the response `Content-Encoding`
//! (what was actually stored), not the client's wish list, and matching on
//! later lookups is a compatibility check rather than string equality.

use http::HeaderMap;

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptEncoding {
    pub value: String,
    pub q: f64,
}

/// Parse a client `Accept-Encoding` header into entries ordered by
/// descending q-value. Entries without a `q` parameter default to 1.0.
pub fn parse_accept_encoding(header: &str) -> Vec<AcceptEncoding> {
    let mut out = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut value = part;
        let mut q = 1.0f64;
        if let Some((enc, params)) = part.split_once(';') {
            value = enc.trim();
            for param in params.split(';') {
                if let Some(raw) = param.trim().strip_prefix("q=") {
                    if let Ok(parsed) = raw.trim().parse::<f64>() {
                        q = parsed;
                    }
                }
            }
        }
        out.push(AcceptEncoding {
            value: value.to_string(),
            q,
        });
    }
    out.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Whether a stored variant with the given `Content-Encoding` is acceptable
/// to a client that sent the parsed entries. `*` accepts anything,
/// `identity` accepts only unencoded variants, and `q=0` rejects.
pub fn supports_encoding(list: &[AcceptEncoding], encoding: &str) -> bool {
    if list.is_empty() {
        return encoding.is_empty() || encoding.eq_ignore_ascii_case("identity");
    }
    for item in list {
        if item.q <= 0.0 {
            continue;
        }
        if item.value == "*" {
            return true;
        }
        if item.value.eq_ignore_ascii_case("identity") {
            if encoding.is_empty() || encoding.eq_ignore_ascii_case("identity") {
                return true;
            }
            continue;
        }
        if item.value.eq_ignore_ascii_case(encoding) {
            return true;
        }
    }
    false
}

/// Split, trim and lower-case a `Vary` header set; duplicates removed,
/// result sorted for stable discriminators.
pub fn clean_vary(values: &[&str]) -> Vec<String> {
    let mut keys: Vec<String> = values
        .iter()
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// First token of the response `Content-Encoding`, empty for identity.
pub fn response_content_encoding(headers: &HeaderMap) -> String {
    headers
        .get("Content-Encoding")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| normalize_content_encoding(v))
        .unwrap_or_default()
}

pub fn normalize_content_encoding(encoding: &str) -> String {
    let encoding = encoding.trim().to_ascii_lowercase();
    if encoding == "identity" {
        String::new()
    } else {
        encoding
    }
}

/// Build the variant discriminator for a response carrying `Vary`.
/// Returns an empty string when no usable axis remains (e.g. every header
/// in the Vary set is absent), in which case the object stays unvaried.
pub fn build_vary_key(
    vary_headers: &[String],
    req_headers: &HeaderMap,
    resp_headers: &HeaderMap,
) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for name in vary_headers {
        let key = name.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        if key == "accept-encoding" {
            let encoding = response_content_encoding(resp_headers);
            if !encoding.is_empty() {
                pairs.push((key, encoding));
            }
            continue;
        }
        let mut values: Vec<String> = req_headers
            .get_all(name.as_str())
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            continue;
        }
        values.sort();
        pairs.push((key, values.join(",")));
    }
    if pairs.is_empty() {
        return String::new();
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Content-Encoding recorded inside a variant discriminator, if any.
pub fn encoding_from_vary_key(key: &str) -> Option<&str> {
    for pair in key.split('&') {
        if let Some(value) = pair.strip_prefix("accept-encoding=") {
            return Some(value);
        }
    }
    None
}
