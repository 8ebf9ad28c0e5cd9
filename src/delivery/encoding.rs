//! gzip content coding.
//!
//! Bodies are compressed once, when a policy asks for it before the object
//! is stored, and decompressed per delivery for clients that cannot take
//! gzip.

use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::http::{Headers, Response};

/// Whether `Accept-Encoding` admits gzip, honouring `q=0` exclusions and `*`.
///
/// # Examples
///
/// ```
/// use edgecache::delivery::encoding::accepts_gzip;
/// use edgecache::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Accept-Encoding", "br, gzip;q=0.5");
/// assert!(accepts_gzip(&headers));
///
/// let mut headers = Headers::new();
/// headers.insert("Accept-Encoding", "*, gzip;q=0");
/// assert!(!accepts_gzip(&headers));
/// ```
pub fn accepts_gzip(headers: &Headers) -> bool {
    let mut wildcard = None;
    for token in headers.tokens("accept-encoding") {
        let mut parts = token.split(';');
        let coding = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let quality = parts
            .filter_map(|param| param.trim().split_once('='))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("q"))
            .map_or(1.0, |(_, value)| value.trim().parse::<f32>().unwrap_or(0.0));
        match coding.as_str() {
            "gzip" | "x-gzip" => return quality > 0.0,
            "*" => wildcard = Some(quality > 0.0),
            _ => {}
        }
    }
    wildcard.unwrap_or(false)
}

/// Whether the response body is gzip-encoded.
pub fn is_gzip(headers: &Headers) -> bool {
    headers
        .tokens("content-encoding")
        .any(|coding| coding.eq_ignore_ascii_case("gzip") || coding.eq_ignore_ascii_case("x-gzip"))
}

pub fn gzip(body: &[u8]) -> io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body)?;
    Ok(Bytes::from(encoder.finish()?))
}

pub fn gunzip(body: &[u8]) -> io::Result<Bytes> {
    let mut decoded = Vec::with_capacity(body.len().saturating_mul(2));
    GzDecoder::new(body).read_to_end(&mut decoded)?;
    Ok(Bytes::from(decoded))
}

/// Compresses an uncompressed response in place. Returns `false` when the
/// body already carries a content coding.
pub fn compress(response: &mut Response) -> io::Result<bool> {
    if response.headers().contains("content-encoding") {
        return Ok(false);
    }
    let compressed = gzip(response.content())?;
    response.set_content(compressed);
    let headers = response.headers_mut();
    headers.remove("content-length");
    headers.set("Content-Encoding", "gzip");
    Ok(true)
}

/// Decompresses a gzip response in place. Returns `false` when the body is
/// not gzip-encoded.
pub fn decompress(response: &mut Response) -> io::Result<bool> {
    if !is_gzip(response.headers()) {
        return Ok(false);
    }
    let decoded = gunzip(response.content())?;
    response.set_content(decoded);
    let headers = response.headers_mut();
    headers.remove("content-length");
    headers.remove("content-encoding");
    Ok(true)
}
