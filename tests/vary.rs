mod support;

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use hyper::body::Incoming;
use support::*;
use tavern::iobuf::ProxyBody;
use tavern::storage::object::Id;

const PORT: u16 = 18084;
const SLICE: u64 = 1 << 20;
const URL: &str = "http://origin.test/cases/vary/encoding";

fn br_body() -> Bytes {
    Bytes::from(vec![b'B'; 200_000])
}

fn gzip_body() -> Bytes {
    Bytes::from(vec![b'G'; 150_000])
}

/// Origin that negotiates Content-Encoding from Accept-Encoding and always
/// varies on it. The payloads are stand-ins, not real compressed streams.
fn negotiating_origin(req: Request<Incoming>) -> Response<ProxyBody> {
    let accept = req
        .headers()
        .get("accept-encoding")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let wants_br = accept.contains("br") && !accept.replace(' ', "").contains("br;q=0");
    let (encoding, body) = if wants_br {
        ("br", br_body())
    } else {
        ("gzip", gzip_body())
    };
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", "max-age=60".parse().unwrap());
    headers.insert("Vary", "Accept-Encoding".parse().unwrap());
    headers.insert("Content-Encoding", encoding.parse().unwrap());
    headers.insert("Content-Length", body.len().to_string().parse().unwrap());
    build_response(StatusCode::OK, headers, ProxyBody::full(body))
}

#[tokio::test]
async fn test_variants_accumulate_and_negotiate() {
    // first request: brotli variant created behind a vary index
    let case = E2E::new(PORT, SLICE, URL, negotiating_origin).await;
    let resp = case
        .do_request(|_, headers| {
            headers.insert("Accept-Encoding", "br".parse().unwrap());
        })
        .await;
    assert_eq!(resp.cache_status(), "MISS");
    assert_eq!(resp.body(), &br_body());
    tokio::time::sleep(Duration::from_millis(500)).await;

    let storage = tavern::storage::current();
    let root_id = Id::new(URL);
    let bucket = storage.selector().select(&root_id).expect("bucket");
    let index = bucket.lookup(&root_id).unwrap().expect("vary index");
    assert!(index.is_vary_index());
    assert_eq!(index.virtual_key, vec!["accept-encoding=br".to_string()]);

    let br_id = Id::new_virtual(URL, "accept-encoding=br");
    let variant = bucket.lookup(&br_id).unwrap().expect("br variant");
    assert!(variant.is_vary_cache());
    assert_eq!(variant.header("Content-Encoding"), Some("br"));
    assert!(variant.has_complete());

    // second request with a different encoding misses and adds a variant
    let case2 = E2E::new(PORT, SLICE, URL, negotiating_origin).await;
    let resp = case2
        .do_request(|_, headers| {
            headers.insert("Accept-Encoding", "gzip".parse().unwrap());
        })
        .await;
    assert_eq!(resp.cache_status(), "MISS");
    assert_eq!(resp.body(), &gzip_body());
    tokio::time::sleep(Duration::from_millis(500)).await;

    let index = bucket.lookup(&root_id).unwrap().expect("vary index");
    assert_eq!(
        index.virtual_key,
        vec![
            "accept-encoding=br".to_string(),
            "accept-encoding=gzip".to_string()
        ]
    );

    // compatibility matching picks the first acceptable variant in list
    // order: br is listed first and the client accepts both
    let case3 = E2E::new(PORT, SLICE, URL, wrong_hit()).await;
    let resp = case3
        .do_request(|_, headers| {
            headers.insert("Accept-Encoding", "gzip, br".parse().unwrap());
        })
        .await;
    assert_eq!(resp.cache_status(), "HIT");
    assert_eq!(
        resp.headers()
            .get("Content-Encoding")
            .unwrap()
            .to_str()
            .unwrap(),
        "br"
    );
    assert_eq!(resp.body(), &br_body());
}

#[tokio::test]
async fn test_q_values_steer_selection() {
    // uses the records created by the other test's URL only if it ran
    // first; to stay order-independent this test gets its own object
    let url = "http://origin.test/cases/vary/qvalues";
    let case = E2E::new(PORT, SLICE, url, negotiating_origin).await;

    let resp = case
        .do_request(|_, headers| {
            headers.insert("Accept-Encoding", "br".parse().unwrap());
        })
        .await;
    assert_eq!(resp.cache_status(), "MISS");
    tokio::time::sleep(Duration::from_millis(500)).await;

    // gzip is rejected outright, br accepted with q=0.9
    let case2 = E2E::new(PORT, SLICE, url, wrong_hit()).await;
    let resp = case2
        .do_request(|_, headers| {
            headers.insert("Accept-Encoding", "gzip;q=0, br;q=0.9".parse().unwrap());
        })
        .await;
    assert_eq!(resp.cache_status(), "HIT");
    assert_eq!(resp.body(), &br_body());

    // rejecting the only stored encoding forces a fetch
    let case3 = E2E::new(PORT, SLICE, url, negotiating_origin).await;
    let resp = case3
        .do_request(|_, headers| {
            headers.insert("Accept-Encoding", "br;q=0, gzip".parse().unwrap());
        })
        .await;
    assert_eq!(resp.cache_status(), "MISS");
    assert_eq!(resp.body(), &gzip_body());
}
