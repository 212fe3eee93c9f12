pub mod access_log;
pub mod caching;
pub mod config;
pub mod constants;
pub mod error;
pub mod http_range;
pub mod http_vary;
pub mod iobuf;
pub mod logging;
pub mod metrics;
pub mod plugin;
pub mod proxy;
pub mod server;
pub mod storage;
