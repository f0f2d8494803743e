use std::fmt;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use http::{Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::blob::Blob;

const SNIFF_LEN: usize = 512;
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// What the origin reported for a fetch. Callers branch on the two kinds:
/// a missing representation is served as 404, a transport failure is logged
/// and served as 404 without being cached.
#[derive(Debug)]
pub enum FetchError {
    NotFound,
    Transport(anyhow::Error),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::NotFound => write!(f, "origin reported not found"),
            FetchError::Transport(err) => write!(f, "origin transport error: {err:#}"),
        }
    }
}

impl std::error::Error for FetchError {}

#[derive(Clone)]
pub struct OriginClient {
    client: Client<HttpConnector, Full<Bytes>>,
    root: String,
}

impl OriginClient {
    pub fn new(root: &str) -> Self {
        let connector = HttpConnector::new();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            client,
            root: root.trim_end_matches('/').to_string(),
        }
    }

    /// GET `root + path` and materialize the response into a Blob. The
    /// whole body is read into memory; a 200 with an empty body counts as
    /// not found, a chunked 200 with a non-empty body counts as success.
    pub async fn fetch(&self, path: &str) -> Result<Blob, FetchError> {
        let url = format!("{}{}", self.root, path);
        log::debug!("origin: GET {url}");

        let uri: Uri = url
            .parse()
            .with_context(|| format!("parse origin url {url}"))
            .map_err(FetchError::Transport)?;
        let req = http::Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .context("build origin request")
            .map_err(FetchError::Transport)?;

        let resp = self
            .client
            .request(req)
            .await
            .context("origin request")
            .map_err(FetchError::Transport)?;
        let status = resp.status();
        let headers = resp.headers().clone();

        if status != StatusCode::OK {
            return Err(FetchError::NotFound);
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .context("read origin body")
            .map_err(FetchError::Transport)?
            .to_bytes();
        if body.is_empty() {
            return Err(FetchError::NotFound);
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .unwrap_or_else(|| guess_content_type(path, &body));

        let mtime = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .unwrap_or_else(SystemTime::now);

        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("{:x}", md5::compute(&body)));

        Ok(Blob::new(body, content_type, etag, mtime, url))
    }

    /// Conditional HEAD against an absolute URL, used by the invalidator to
    /// ask whether a cached representation is still current.
    pub async fn check(&self, url: &str, mtime: SystemTime, etag: &str) -> Result<StatusCode> {
        let uri: Uri = url.parse().with_context(|| format!("parse url {url}"))?;
        let req = http::Request::builder()
            .method(Method::HEAD)
            .uri(uri)
            .header(IF_MODIFIED_SINCE, httpdate::fmt_http_date(mtime))
            .header(IF_NONE_MATCH, etag)
            .body(Full::new(Bytes::new()))
            .context("build revalidation request")?;

        let resp = tokio::time::timeout(CHECK_TIMEOUT, self.client.request(req))
            .await
            .map_err(|_| anyhow!("revalidation request timed out"))?
            .context("revalidation request")?;
        Ok(resp.status())
    }
}

/// Content type when the origin did not declare one: extension first, then
/// a sniff of the body prefix.
fn guess_content_type(path: &str, body: &Bytes) -> String {
    if let Some(mime) = mime_guess::from_path(path).first_raw() {
        return mime.to_string();
    }
    sniff_content_type(&body[..body.len().min(SNIFF_LEN)]).to_string()
}

fn sniff_content_type(prefix: &[u8]) -> &'static str {
    const MAGIC: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
    ];
    for &(magic, mime) in MAGIC {
        if prefix.starts_with(magic) {
            return mime;
        }
    }
    let is_text = match std::str::from_utf8(prefix) {
        Ok(text) => !text.contains('\0'),
        // allow a multi-byte sequence cut off at the sniff boundary
        Err(err) => err.error_len().is_none() && err.valid_up_to() > 0,
    };
    if is_text {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}
