//! HTTP/1.1 origin client over `tokio::net::TcpStream`.
//!
//! One connection per fetch, always `Connection: close`. Response heads are
//! parsed with [`httparse`]; bodies are delimited by `Content-Length`,
//! chunked transfer coding, or connection close.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{Backend, BackendError, BackendRequest, BoxFuture};
use crate::http::{Headers, Method, Response, StatusCode};

/// Maximum number of response headers accepted from the origin.
const MAX_HEADERS: usize = 96;

/// Initial read buffer capacity per fetch.
const INITIAL_BUF_SIZE: usize = 8192;

/// Request headers managed by the client itself.
const CONNECTION_HEADERS: [&str; 4] = ["connection", "keep-alive", "content-length", "transfer-encoding"];

/// An origin reachable over plain TCP.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use edgecache::backend::HttpBackend;
///
/// let origin = HttpBackend::new("127.0.0.1:8080").with_connect_timeout(Duration::from_secs(1));
/// assert_eq!(origin.address(), "127.0.0.1:8080");
/// ```
#[derive(Debug, Clone)]
pub struct HttpBackend {
    address: String,
    connect_timeout: Duration,
}

impl HttpBackend {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(3),
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<TcpStream, BackendError> {
        let attempt = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address));
        match attempt.await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(BackendError::Connect {
                addr: self.address.clone(),
                source,
            }),
            Err(_) => Err(BackendError::Connect {
                addr: self.address.clone(),
                source: std::io::ErrorKind::TimedOut.into(),
            }),
        }
    }

    async fn send(&self, request: BackendRequest) -> Result<Response, BackendError> {
        let mut stream = self.connect().await?;
        stream.write_all(&encode_request(&request, &self.address)).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        let head = loop {
            if let Some(head) = parse_head(&buf)? {
                break head;
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(BackendError::Malformed(
                    "connection closed before the response head was complete".into(),
                ));
            }
        };
        let mut rest = buf.split_off(head.length);

        let bodiless = *request.method() == Method::Head
            || head.status.as_u16() / 100 == 1
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED;

        let body = if bodiless {
            Bytes::new()
        } else if is_chunked(&head.headers) {
            loop {
                if let Some(body) = decode_chunked(&rest)? {
                    break body;
                }
                if stream.read_buf(&mut rest).await? == 0 {
                    return Err(BackendError::Malformed("truncated chunked body".into()));
                }
            }
        } else if let Some(length) = content_length(&head.headers)? {
            while rest.len() < length {
                if stream.read_buf(&mut rest).await? == 0 {
                    return Err(BackendError::Malformed(format!(
                        "body ended after {} of {length} bytes",
                        rest.len()
                    )));
                }
            }
            rest.truncate(length);
            rest.freeze()
        } else {
            while stream.read_buf(&mut rest).await? != 0 {}
            rest.freeze()
        };

        debug!(
            backend = %self.address,
            status = head.status.as_u16(),
            bytes = body.len(),
            "backend response received"
        );
        Ok(Response::from_parts(head.status, head.headers, body))
    }
}

impl Backend for HttpBackend {
    fn fetch(&self, request: BackendRequest) -> BoxFuture<'_, Result<Response, BackendError>> {
        Box::pin(async move {
            let target = request.target().to_owned();
            self.send(request).await.inspect_err(|e| {
                warn!(backend = %self.address, target = %target, error = %e, "backend fetch failed");
            })
        })
    }
}

struct Head {
    status: StatusCode,
    headers: Headers,
    length: usize,
}

fn encode_request(request: &BackendRequest, address: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256 + request.body().len());
    buf.put(format!("{} {} HTTP/1.1\r\n", request.method(), request.target()).as_bytes());
    if !request.headers().contains("host") {
        buf.put(format!("Host: {address}\r\n").as_bytes());
    }
    for (name, value) in request.headers().iter() {
        if CONNECTION_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        buf.put(format!("{name}: {value}\r\n").as_bytes());
    }
    if !request.body().is_empty() {
        buf.put(format!("Content-Length: {}\r\n", request.body().len()).as_bytes());
    }
    buf.put(&b"Connection: close\r\n\r\n"[..]);
    buf.put(request.body().clone());
    buf
}

fn parse_head(buf: &[u8]) -> Result<Option<Head>, BackendError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Response::new(&mut headers);
    let length = match raw
        .parse(buf)
        .map_err(|e| BackendError::Malformed(e.to_string()))?
    {
        httparse::Status::Complete(length) => length,
        httparse::Status::Partial => return Ok(None),
    };

    let status = raw
        .code
        .and_then(StatusCode::from_u16)
        .ok_or_else(|| BackendError::Malformed("missing or invalid status code".into()))?;

    let mut map = Headers::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| BackendError::Malformed(format!("non UTF-8 value for {}", header.name)))?;
        map.insert(header.name, value);
    }

    Ok(Some(Head {
        status,
        headers: map,
        length,
    }))
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .tokens("transfer-encoding")
        .last()
        .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &Headers) -> Result<Option<usize>, BackendError> {
    headers
        .get("content-length")
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| BackendError::Malformed(format!("invalid Content-Length: {v}")))
        })
        .transpose()
}

/// Decodes a chunked body. `Ok(None)` means more input is needed.
fn decode_chunked(buf: &[u8]) -> Result<Option<Bytes>, BackendError> {
    let mut body = BytesMut::new();
    let mut pos = 0;
    loop {
        let (offset, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(BackendError::Malformed("invalid chunk size".into())),
        };
        pos += offset;
        let size = usize::try_from(size)
            .map_err(|_| BackendError::Malformed("chunk too large".into()))?;

        if size == 0 {
            // Skip trailer fields up to the terminating empty line.
            let rest = &buf[pos..];
            if rest.starts_with(b"\r\n") {
                return Ok(Some(body.freeze()));
            }
            return Ok(rest
                .windows(4)
                .any(|w| w == b"\r\n\r\n")
                .then(|| body.freeze()));
        }

        let end = pos
            .checked_add(size)
            .filter(|end| end.checked_add(2).is_some())
            .ok_or_else(|| BackendError::Malformed("chunk too large".into()))?;
        if buf.len() < end + 2 {
            return Ok(None);
        }
        body.put(&buf[pos..end]);
        if &buf[end..end + 2] != b"\r\n" {
            return Err(BackendError::Malformed("chunk not terminated by CRLF".into()));
        }
        pos = end + 2;
    }
}
