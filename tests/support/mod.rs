#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;

use tavern::config::{
    Bootstrap, BucketConfig, Logger, MiddlewareConfig, Server, Storage, Upstream,
};
use tavern::constants;
use tavern::iobuf::ProxyBody;

static START: OnceCell<()> = OnceCell::const_new();
static ROOT: std::sync::OnceLock<PathBuf> = std::sync::OnceLock::new();

pub fn storage_root() -> PathBuf {
    ROOT.get_or_init(|| {
        std::env::temp_dir().join(format!("tavern-e2e-{}", std::process::id()))
    })
    .clone()
}

pub fn bucket_root() -> PathBuf {
    storage_root().join("bucket-0")
}

/// Start one proxy instance for this test binary. Every test shares it;
/// tests isolate themselves by URL.
pub async fn ensure_server(port: u16, slice_size: u64) {
    START
        .get_or_init(|| async move {
            let cfg = test_config(port, slice_size);
            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");
                runtime.block_on(async move {
                    if let Err(err) = tavern::server::run(Arc::new(cfg)).await {
                        eprintln!("test server exited: {err}");
                    }
                });
            });
            tokio::time::sleep(Duration::from_millis(300)).await;
        })
        .await;
}

fn test_config(port: u16, slice_size: u64) -> Bootstrap {
    let mut options = HashMap::new();
    options.insert(
        "slice_size".to_string(),
        serde_yaml::Value::Number(slice_size.into()),
    );
    let caching = MiddlewareConfig {
        name: "caching".to_string(),
        options,
    };

    Bootstrap {
        strict: false,
        hostname: Some("e2e-test".to_string()),
        pidfile: None,
        logger: Logger::default(),
        server: Server {
            addr: format!("127.0.0.1:{port}"),
            middleware: vec![caching],
            ..Default::default()
        },
        plugin: Vec::new(),
        upstream: Upstream {
            balancing: "rr".to_string(),
            address: vec!["http://127.0.0.1:1".to_string()],
            ..Default::default()
        },
        storage: Storage {
            db_type: "memory".to_string(),
            slice_size,
            buckets: vec![BucketConfig {
                path: bucket_root().to_string_lossy().to_string(),
                ..Default::default()
            }],
            ..Default::default()
        },
    }
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// First token of the X-Cache header, e.g. `PART_HIT`.
    pub fn cache_status(&self) -> String {
        self.headers
            .get("X-Cache")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split_whitespace().next())
            .unwrap_or("")
            .to_string()
    }
}

#[derive(Clone)]
pub struct TestClient {
    proxy_addr: SocketAddr,
}

impl TestClient {
    pub fn new(port: u16) -> Self {
        Self {
            proxy_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    pub async fn send(&self, method: Method, url: &str, headers: HeaderMap) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.proxy_addr)
            .await
            .expect("connect proxy");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let uri: http::Uri = url.parse().expect("uri");
        let mut builder = Request::builder().method(method).uri(uri.clone());
        if !headers.contains_key(http::header::HOST) {
            if let Some(authority) = uri.authority() {
                builder = builder.header(http::header::HOST, authority.as_str());
            }
        }
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let req = builder.body(Full::new(Bytes::new())).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }
}

pub struct MockServer {
    addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<ProxyBody> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    accepted = listener.accept() => {
                        let (stream, _) = match accepted { Ok(conn) => conn, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let resp = handler(req);
                                async move { Ok::<_, std::convert::Infallible>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[derive(Clone)]
pub struct MockFile {
    pub path: PathBuf,
    pub md5: String,
    pub size: usize,
    _temp_dir: Arc<tempfile::TempDir>,
}

pub fn gen_file(size: usize) -> MockFile {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    let dir = Arc::new(tempfile::tempdir().expect("tempdir"));
    let path = dir.path().join(format!("file-{size}.bin"));
    std::fs::write(&path, &buf).expect("write file");
    let digest = format!("{:x}", md5::compute(&buf));
    MockFile {
        path,
        md5: digest,
        size,
        _temp_dir: dir,
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn read_range(path: &PathBuf, start: usize, length: usize) -> Vec<u8> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path).expect("open file");
    file.seek(SeekFrom::Start(start as u64)).expect("seek");
    let mut buf = vec![0u8; length];
    file.read_exact(&mut buf).expect("read range");
    buf
}

pub struct E2E {
    pub case_url: String,
    pub upstream: MockServer,
    pub client: TestClient,
}

impl E2E {
    pub async fn new<F>(port: u16, slice_size: u64, case_url: &str, handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<ProxyBody> + Send + Sync + 'static,
    {
        ensure_server(port, slice_size).await;
        let upstream = MockServer::start(handler).await;
        let client = TestClient::new(port);
        Self {
            case_url: case_url.to_string(),
            upstream,
            client,
        }
    }

    pub async fn do_request<F>(&self, edit: F) -> TestResponse
    where
        F: FnOnce(&mut Method, &mut HeaderMap),
    {
        let mut method = Method::GET;
        let mut headers = HeaderMap::new();
        headers.insert(
            constants::INTERNAL_UPSTREAM_ADDR,
            self.upstream.addr().to_string().parse().unwrap(),
        );
        headers.insert(
            constants::STORE_URL_KEY,
            http::HeaderValue::from_str(&self.case_url).unwrap(),
        );
        edit(&mut method, &mut headers);
        self.client.send(method, &self.case_url, headers).await
    }

    pub async fn purge(&self) -> TestResponse {
        self.purge_url(&self.case_url, false).await
    }

    pub async fn purge_url(&self, url: &str, dir: bool) -> TestResponse {
        let mut headers = HeaderMap::new();
        headers.insert(
            constants::STORE_URL_KEY,
            http::HeaderValue::from_str(url).unwrap(),
        );
        if dir {
            headers.insert("Purge-Type", "dir".parse().unwrap());
        }
        self.client
            .send(Method::from_bytes(b"PURGE").unwrap(), url, headers)
            .await
    }
}

/// Serves the file with full RFC 7233 single-range support, the way a
/// well-behaved origin would.
pub fn resp_file_with_ranges(
    file: &MockFile,
) -> impl Fn(Request<Incoming>) -> Response<ProxyBody> + Send + Sync {
    resp_file_with_ranges_edit(file, |_, _| {})
}

pub fn resp_file_with_ranges_edit<F>(
    file: &MockFile,
    edit: F,
) -> impl Fn(Request<Incoming>) -> Response<ProxyBody> + Send + Sync
where
    F: Fn(&Request<Incoming>, &mut HeaderMap) + Send + Sync + 'static,
{
    let file = file.clone();
    move |req: Request<Incoming>| {
        let bytes = std::fs::read(&file.path).expect("read file");
        let total = bytes.len() as u64;

        let mut headers = HeaderMap::new();
        headers.insert("Cache-Control", "max-age=60".parse().unwrap());
        headers.insert("ETag", file.md5.parse().unwrap());
        headers.insert(
            "Last-Modified",
            httpdate::fmt_http_date(std::time::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
                .parse()
                .unwrap(),
        );
        headers.insert("X-Server", "tavern-e2e/1.0.0".parse().unwrap());
        edit(&req, &mut headers);

        let range = req
            .headers()
            .get("Range")
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| parse_test_range(raw, total));

        match range {
            Some((start, end)) => {
                let body = Bytes::copy_from_slice(&bytes[start as usize..=end as usize]);
                headers.insert(
                    "Content-Range",
                    format!("bytes {start}-{end}/{total}").parse().unwrap(),
                );
                headers.insert("Content-Length", body.len().to_string().parse().unwrap());
                build_response(StatusCode::PARTIAL_CONTENT, headers, ProxyBody::full(body))
            }
            None => {
                headers.insert("Content-Length", total.to_string().parse().unwrap());
                build_response(StatusCode::OK, headers, ProxyBody::full(Bytes::from(bytes)))
            }
        }
    }
}

pub fn resp_callback<F>(cb: F) -> impl Fn(Request<Incoming>) -> Response<ProxyBody> + Send + Sync
where
    F: Fn(&Request<Incoming>) -> (StatusCode, HeaderMap, Bytes) + Send + Sync + 'static,
{
    move |req: Request<Incoming>| {
        let (status, headers, body) = cb(&req);
        build_response(status, headers, ProxyBody::full(body))
    }
}

/// An upstream that must not be reached; a cache hit is expected instead.
pub fn wrong_hit() -> impl Fn(Request<Incoming>) -> Response<ProxyBody> + Send + Sync {
    move |_req: Request<Incoming>| {
        build_response(StatusCode::BAD_GATEWAY, HeaderMap::new(), ProxyBody::empty())
    }
}

pub fn build_response(
    status: StatusCode,
    headers: HeaderMap,
    body: ProxyBody,
) -> Response<ProxyBody> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(body).expect("mock response")
}

fn parse_test_range(raw: &str, total: u64) -> Option<(u64, u64)> {
    let spec = raw.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 || total == 0 {
            return None;
        }
        return Some((total.saturating_sub(suffix), total - 1));
    }
    let start: u64 = start.parse().ok()?;
    if start >= total {
        return None;
    }
    let end: u64 = if end.is_empty() {
        total - 1
    } else {
        end.parse::<u64>().ok()?.min(total - 1)
    };
    (start <= end).then_some((start, end))
}
