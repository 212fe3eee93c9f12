mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use support::*;
use tavern::storage::object::Id;

const PORT: u16 = 18083;
const SLICE: u64 = 1 << 20;

#[tokio::test]
async fn test_not_modified_refreshes_and_serves_cached() {
    let file = gen_file(2 << 20);
    let etag = file.md5.clone();
    let url = "http://origin.test/cases/revalidate/304";

    // store with a short lifetime
    let short_lived = resp_file_with_ranges_edit(&file, |_, headers| {
        headers.insert("Cache-Control", "max-age=1".parse().unwrap());
    });
    let case = E2E::new(PORT, SLICE, url, short_lived).await;
    let resp = case.do_request(|_, _| {}).await;
    assert_eq!(resp.cache_status(), "MISS");
    tokio::time::sleep(Duration::from_secs(2)).await;

    // origin answers the conditional request with 304 + a longer lifetime
    let seen_inm: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen_inm);
    let reval_etag = etag.clone();
    let case2 = E2E::new(PORT, SLICE, url, move |req| {
        *record.lock().unwrap() = req
            .headers()
            .get("If-None-Match")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let mut headers = HeaderMap::new();
        headers.insert("Cache-Control", "max-age=120".parse().unwrap());
        headers.insert("ETag", reval_etag.parse().unwrap());
        build_response(
            StatusCode::NOT_MODIFIED,
            headers,
            tavern::iobuf::ProxyBody::empty(),
        )
    })
    .await;

    let resp = case2.do_request(|_, _| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.cache_status(), "REVALIDATE_HIT");
    assert_eq!(hash_bytes(resp.body()), file.md5);
    assert_eq!(seen_inm.lock().unwrap().as_deref(), Some(etag.as_str()));

    // expiry extended, validators untouched, no extra block bits
    tokio::time::sleep(Duration::from_millis(300)).await;
    let id = Id::new(url);
    let storage = tavern::storage::current();
    let bucket = storage.selector().select(&id).expect("bucket");
    let md = bucket.lookup(&id).unwrap().expect("metadata");
    let left = md.expires_at - tavern::storage::unix_now();
    assert!(left > 100 && left <= 120, "expiry left {left}");
    assert_eq!(md.header("ETag"), Some(etag.as_str()));
    assert_eq!(md.present_blocks().count(), 2);
}

#[tokio::test]
async fn test_changed_body_is_a_revalidate_miss() {
    let old = gen_file(1 << 20);
    let url = "http://origin.test/cases/revalidate/changed";

    let short_lived = resp_file_with_ranges_edit(&old, |_, headers| {
        headers.insert("Cache-Control", "max-age=1".parse().unwrap());
    });
    let case = E2E::new(PORT, SLICE, url, short_lived).await;
    let resp = case.do_request(|_, _| {}).await;
    assert_eq!(resp.cache_status(), "MISS");
    tokio::time::sleep(Duration::from_secs(2)).await;

    // the object changed upstream: full 200 with a new entity
    let fresh = gen_file(1 << 20);
    let fresh_body = std::fs::read(&fresh.path).unwrap();
    let fresh_md5 = fresh.md5.clone();
    let case2 = E2E::new(PORT, SLICE, url, move |_req| {
        let mut headers = HeaderMap::new();
        headers.insert("Cache-Control", "max-age=60".parse().unwrap());
        headers.insert("ETag", fresh_md5.parse().unwrap());
        headers.insert(
            "Content-Length",
            fresh_body.len().to_string().parse().unwrap(),
        );
        build_response(
            StatusCode::OK,
            headers,
            tavern::iobuf::ProxyBody::full(Bytes::from(fresh_body.clone())),
        )
    })
    .await;

    let resp = case2.do_request(|_, _| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.cache_status(), "REVALIDATE_MISS");
    assert_eq!(hash_bytes(resp.body()), fresh.md5);

    // the fresh entity replaced the stale one
    tokio::time::sleep(Duration::from_millis(400)).await;
    let case3 = E2E::new(PORT, SLICE, url, wrong_hit()).await;
    let resp = case3.do_request(|_, _| {}).await;
    assert_eq!(resp.cache_status(), "HIT");
    assert_eq!(hash_bytes(resp.body()), fresh.md5);
}
