//! Single byte-range delivery from stored bodies.

use crate::http::{Response, StatusCode};

/// What a `Range` header selects from a body of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// Absent, malformed or multi-range: send everything.
    Full,
    /// Inclusive byte offsets.
    Partial { start: usize, end: usize },
    Unsatisfiable,
}

impl ByteRange {
    /// Resolves `header` against a body of `len` bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use edgecache::delivery::range::ByteRange;
    ///
    /// assert_eq!(ByteRange::parse("bytes=0-3", 10), ByteRange::Partial { start: 0, end: 3 });
    /// assert_eq!(ByteRange::parse("bytes=-4", 10), ByteRange::Partial { start: 6, end: 9 });
    /// assert_eq!(ByteRange::parse("bytes=0-1,4-5", 10), ByteRange::Full);
    /// assert_eq!(ByteRange::parse("bytes=10-", 10), ByteRange::Unsatisfiable);
    /// ```
    pub fn parse(header: &str, len: usize) -> Self {
        let header = header.trim();
        let Some(spec) = header
            .get(..6)
            .filter(|unit| unit.eq_ignore_ascii_case("bytes="))
            .map(|_| header[6..].trim())
        else {
            return Self::Full;
        };
        if spec.contains(',') {
            return Self::Full;
        }
        let Some((first, last)) = spec.split_once('-') else {
            return Self::Full;
        };
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            // Suffix: the last N bytes.
            let Ok(suffix) = last.parse::<usize>() else {
                return Self::Full;
            };
            if suffix == 0 || len == 0 {
                return Self::Unsatisfiable;
            }
            return Self::Partial {
                start: len.saturating_sub(suffix),
                end: len - 1,
            };
        }

        let Ok(start) = first.parse::<usize>() else {
            return Self::Full;
        };
        let end = if last.is_empty() {
            None
        } else {
            match last.parse::<usize>() {
                Ok(end) if end >= start => Some(end),
                _ => return Self::Full,
            }
        };
        if start >= len {
            return Self::Unsatisfiable;
        }
        let end = end.map_or(len - 1, |end| end.min(len - 1));
        Self::Partial { start, end }
    }
}

/// Applies `range` to a `200` response; any other status passes through.
pub fn apply(mut response: Response, range: Option<&str>) -> Response {
    let Some(range) = range else {
        return response;
    };
    if response.status() != StatusCode::OK {
        return response;
    }
    let len = response.content().len();
    match ByteRange::parse(range, len) {
        ByteRange::Full => response,
        ByteRange::Partial { start, end } => {
            let slice = response.content().slice(start..=end);
            response.set_status(StatusCode::PARTIAL_CONTENT);
            response.set_content(slice);
            let headers = response.headers_mut();
            headers.remove("content-length");
            headers.set("Content-Range", format!("bytes {start}-{end}/{len}"));
            response
        }
        ByteRange::Unsatisfiable => {
            response.set_status(StatusCode::RANGE_NOT_SATISFIABLE);
            response.set_content(bytes::Bytes::new());
            let headers = response.headers_mut();
            headers.remove("content-length");
            headers.set("Content-Range", format!("bytes */{len}"));
            response
        }
    }
}
