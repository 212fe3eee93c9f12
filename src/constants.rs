pub const PROTOCOL_CACHE_STATUS_KEY: &str = "X-Cache";
pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";
pub const PREFETCH_CACHE_KEY: &str = "X-Prefetch";
pub const STORE_URL_KEY: &str = "X-Store-Url";
pub const CACHE_TIME: &str = "X-CacheTime";

pub const INTERNAL_TRACE_KEY: &str = "i-xtrace";
pub const INTERNAL_SWAPFILE: &str = "i-x-swapfile";
pub const INTERNAL_UPSTREAM_ADDR: &str = "i-x-ups-addr";

pub const SERVER_TOKEN: &str = "tavern/4.0";
