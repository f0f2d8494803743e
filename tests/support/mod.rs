use std::collections::HashMap;
use std::net::SocketAddr;
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
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;

use filegate::config::{AccessLog, Cache, Config, Logger};

/// One file the mock origin can serve, with optional validator headers.
#[derive(Clone, Default)]
pub struct FileSpec {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Default)]
struct OriginState {
    files: Mutex<HashMap<String, FileSpec>>,
    gets: Mutex<HashMap<String, usize>>,
    heads: Mutex<HashMap<String, usize>>,
    head_status: Mutex<Option<StatusCode>>,
}

/// In-process origin server on an ephemeral port. Counts GET and HEAD
/// requests per path; HEAD replies 304 unless a status is forced.
pub struct MockOrigin {
    addr: SocketAddr,
    state: Arc<OriginState>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockOrigin {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(OriginState::default());
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();

        let handler_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let state = Arc::clone(&handler_state);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let resp = origin_handler(&req, &state);
                                async move { Ok::<_, hyper::Error>(resp) }
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
            state,
            shutdown: Some(shutdown),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn add_file(&self, path: &str, body: &str) {
        self.add_file_with(
            path,
            FileSpec {
                body: Bytes::from(body.to_string()),
                ..FileSpec::default()
            },
        );
    }

    pub fn add_file_with(&self, path: &str, spec: FileSpec) {
        self.state.files.lock().insert(path.to_string(), spec);
    }

    pub fn set_head_status(&self, status: Option<StatusCode>) {
        *self.state.head_status.lock() = status;
    }

    pub fn get_count(&self, path: &str) -> usize {
        self.state.gets.lock().get(path).copied().unwrap_or(0)
    }

    pub fn head_count(&self, path: &str) -> usize {
        self.state.heads.lock().get(path).copied().unwrap_or(0)
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn origin_handler(req: &Request<Incoming>, state: &OriginState) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();

    if req.method() == Method::HEAD {
        *state.heads.lock().entry(path).or_insert(0) += 1;
        let forced = *state.head_status.lock();
        let status = forced.unwrap_or(StatusCode::NOT_MODIFIED);
        return Response::builder()
            .status(status)
            .body(Full::new(Bytes::new()))
            .unwrap();
    }

    *state.gets.lock().entry(path.clone()).or_insert(0) += 1;
    let spec = match state.files.lock().get(&path).cloned() {
        Some(spec) => spec,
        None => {
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap();
        }
    };

    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(content_type) = &spec.content_type {
        builder = builder.header("Content-Type", content_type);
    }
    if let Some(etag) = &spec.etag {
        builder = builder.header("ETag", etag);
    }
    if let Some(last_modified) = &spec.last_modified {
        builder = builder.header("Last-Modified", last_modified);
    }
    builder = builder.header("Content-Length", spec.body.len().to_string());
    builder.body(Full::new(spec.body)).unwrap()
}

/// The real gateway running against a mock origin, bound to an ephemeral
/// port and shut down when dropped.
pub struct Gateway {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    pub async fn start(origin_url: &str, max_items: usize, period: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
        let addr = listener.local_addr().expect("local addr");
        let cfg = Config {
            listen: addr.to_string(),
            origin: origin_url.to_string(),
            tmp_dir: String::new(),
            allow_origin: Vec::new(),
            http_rate_limit: 1000,
            logger: Logger::default(),
            access_log: AccessLog::default(),
            cache: Cache {
                max_items,
                max_size: 64 * 1024 * 1024,
                revalidate_period: period,
            },
        };
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = filegate::server::run_with(listener, Arc::new(cfg), rx).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self { addr, shutdown }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.request(Method::GET, path, HeaderMap::new()).await
    }

    pub async fn request(&self, method: Method, path: &str, headers: HeaderMap) -> TestResponse {
        send_request(self.addr, method, path, headers).await
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub async fn send_request(
    addr: SocketAddr,
    method: Method,
    path: &str,
    headers: HeaderMap,
) -> TestResponse {
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect gateway");
    let io = TokioIo::new(stream);
    let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(http::header::HOST, addr.to_string());
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
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
