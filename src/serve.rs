use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED, RANGE,
};
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::Full;

use crate::blob::BlobReader;
use crate::cache::{CacheStatus, FileCache};
use crate::http_range::{self, parse_range};
use crate::origin::FetchError;

pub const CACHE_STATUS_HEADER: &str = "X-Cache";

/// Normalize a request path into a cache key: a single leading slash and a
/// lexical clean of `.`, `..` and duplicate separators. The query string is
/// deliberately not part of the key.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    out.push_str(&segments.join("/"));
    out
}

/// Resolve a request against the cache and serve the result. NotFound and
/// transport errors alike surface as 404; transient origin trouble is never
/// cached.
pub async fn handle(
    cache: &Arc<FileCache>,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
) -> Response<Full<Bytes>> {
    if method != Method::GET && method != Method::HEAD {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let key = normalize_path(path);
    match cache.open(&key).await {
        Ok((reader, status)) => serve_content(method, headers, reader, status),
        Err(FetchError::NotFound) => not_found(),
        Err(FetchError::Transport(err)) => {
            log::warn!("serve: {key}: {err:#}");
            not_found()
        }
    }
}

/// Write a blob out through its cursor: conditional-request handling first,
/// then a single byte range or the whole body.
fn serve_content(
    method: &Method,
    req_headers: &HeaderMap,
    mut reader: BlobReader,
    cache_status: CacheStatus,
) -> Response<Full<Bytes>> {
    let blob = Arc::clone(reader.blob());
    let size = blob.size();
    log::debug!("serve: {} ({} bytes)", blob.basename(), size);

    let mut builder = Response::builder()
        .header(CONTENT_TYPE, blob.content_type())
        .header(ETAG, blob.etag())
        .header(LAST_MODIFIED, httpdate::fmt_http_date(blob.mtime()))
        .header(ACCEPT_RANGES, "bytes")
        .header(CACHE_STATUS_HEADER, cache_status.as_str());

    if not_modified(req_headers, blob.etag(), blob.mtime()) {
        builder = builder.status(StatusCode::NOT_MODIFIED);
        return builder.body(Full::new(Bytes::new())).unwrap();
    }

    let range = req_headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, size));

    let (status, start, length) = match range {
        None => (StatusCode::OK, 0, size),
        Some(Ok(spec)) => {
            builder = builder.header(
                CONTENT_RANGE,
                http_range::content_range(spec.start, spec.end, size),
            );
            (StatusCode::PARTIAL_CONTENT, spec.start, spec.end - spec.start + 1)
        }
        Some(Err(_)) => {
            return builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(CONTENT_RANGE, http_range::unsatisfied_range(size))
                .body(Full::new(Bytes::new()))
                .unwrap();
        }
    };

    builder = builder
        .status(status)
        .header(CONTENT_LENGTH, length.to_string());

    if method == Method::HEAD {
        return builder.body(Full::new(Bytes::new())).unwrap();
    }

    let body = match read_section(&mut reader, start, length) {
        Ok(body) => body,
        Err(err) => {
            log::error!("serve: read {}: {err}", blob.basename());
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
        }
    };
    builder.body(Full::new(body)).unwrap()
}

fn read_section(reader: &mut BlobReader, start: u64, length: u64) -> std::io::Result<Bytes> {
    reader.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; length as usize];
    reader.read_exact(&mut buf)?;
    Ok(Bytes::from(buf))
}

/// Whether the client's conditional headers match the cached validators.
/// `If-None-Match` wins over `If-Modified-Since` when both are present.
fn not_modified(req_headers: &HeaderMap, etag: &str, mtime: SystemTime) -> bool {
    if let Some(candidates) = req_headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        return candidates.split(',').any(|candidate| {
            let candidate = candidate
                .trim()
                .trim_start_matches("W/")
                .trim_matches('"');
            candidate == "*" || candidate == etag
        });
    }
    if let Some(since) = req_headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    {
        // HTTP dates have second resolution
        let mtime_secs = mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| Duration::from_secs(d.as_secs()))
            .unwrap_or_default();
        let since_secs = since
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| Duration::from_secs(d.as_secs()))
            .unwrap_or_default();
        return mtime_secs <= since_secs;
    }
    false
}

pub fn not_found() -> Response<Full<Bytes>> {
    text_response(StatusCode::NOT_FOUND, "not found")
}

pub fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
