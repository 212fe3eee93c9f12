//! Prometheus counters on the default registry plus the text exposition
//! handler. Everything here is fire-and-forget; metric errors never reach
//! the request path.

use std::sync::OnceLock;

use http::StatusCode;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

use crate::storage::CacheStatus;

struct Registry {
    responses: IntCounterVec,
    cache_status: IntCounterVec,
    disk_writes: IntCounterVec,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        responses: register_int_counter_vec!(
            "tavern_responses_total",
            "Responses by HTTP status code",
            &["code"]
        )
        .expect("register responses counter"),
        cache_status: register_int_counter_vec!(
            "tavern_cache_status_total",
            "Responses by cache status",
            &["status"]
        )
        .expect("register cache status counter"),
        disk_writes: register_int_counter_vec!(
            "tavern_disk_write_bytes_total",
            "Bytes written to cache buckets",
            &["bucket"]
        )
        .expect("register disk write counter"),
    })
}

pub fn record_status(status: StatusCode) {
    registry()
        .responses
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_cache_status(status: CacheStatus) {
    registry()
        .cache_status
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_disk_write(bucket: &str, bytes: usize) {
    registry()
        .disk_writes
        .with_label_values(&[bucket])
        .inc_by(bytes as u64);
}

/// Text exposition of every metric on the default registry.
pub fn render() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buf) {
        log::warn!("metrics encode failed: {err}");
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_exposition() {
        record_status(StatusCode::OK);
        record_cache_status(CacheStatus::Hit);
        record_disk_write("disk-0", 1024);
        let text = render();
        assert!(text.contains("tavern_responses_total"));
        assert!(text.contains("tavern_cache_status_total"));
        assert!(text.contains("tavern_disk_write_bytes_total"));
    }
}
