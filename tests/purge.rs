mod support;

use std::time::Duration;

use http::StatusCode;
use support::*;
use tavern::storage::native::domain_count;
use tavern::storage::object::Id;

const PORT: u16 = 18085;
const SLICE: u64 = 1 << 20;

async fn store_object(url: &str, size: usize) -> MockFile {
    let file = gen_file(size);
    let case = E2E::new(PORT, SLICE, url, resp_file_with_ranges(&file)).await;
    let resp = case.do_request(|_, _| {}).await;
    assert_eq!(resp.cache_status(), "MISS");
    file
}

#[tokio::test]
async fn test_prefix_purge_removes_only_the_subtree() {
    store_object("http://purgea.test/cases/purge/a/x", 64 << 10).await;
    store_object("http://purgea.test/cases/purge/a/y", 64 << 10).await;
    store_object("http://purgea.test/cases/purge/b/z", 64 << 10).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let storage = tavern::storage::current();
    let before = domain_count(storage.shared_kv().as_ref(), "purgea.test");
    assert!(before >= 3, "counter before purge: {before}");

    let file = gen_file(1024);
    let case = E2E::new(
        PORT,
        SLICE,
        "http://purgea.test/cases/purge/a/x",
        resp_file_with_ranges(&file),
    )
    .await;
    let resp = case
        .purge_url("http://purgea.test/cases/purge/a/", true)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    // both /a objects and their slices are gone, /b is untouched
    for gone in [
        "http://purgea.test/cases/purge/a/x",
        "http://purgea.test/cases/purge/a/y",
    ] {
        let id = Id::new(gone);
        let bucket = storage.selector().select(&id).expect("bucket");
        assert!(bucket.lookup(&id).unwrap().is_none(), "{gone} still present");
        assert!(!id.wpath_slice(&bucket_root(), 0).exists());
    }
    let kept = Id::new("http://purgea.test/cases/purge/b/z");
    let bucket = storage.selector().select(&kept).expect("bucket");
    assert!(bucket.lookup(&kept).unwrap().is_some());

    let after = domain_count(storage.shared_kv().as_ref(), "purgea.test");
    assert_eq!(before - after, 2, "counter {before} -> {after}");

    // purging the same prefix again finds nothing
    let resp = case
        .purge_url("http://purgea.test/cases/purge/a/", true)
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_single_purge_and_missing_key() {
    let url = "http://purgeb.test/cases/purge/single";
    store_object(url, 32 << 10).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let file = gen_file(1024);
    let case = E2E::new(PORT, SLICE, url, resp_file_with_ranges(&file)).await;

    let resp = case.purge().await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = case.purge().await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = case
        .purge_url("http://purgeb.test/cases/purge/never-stored", false)
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
