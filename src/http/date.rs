//! HTTP-date parsing (RFC 9110 §5.6.7).

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parses an HTTP-date in any of the three formats a recipient must accept:
/// IMF-fixdate, the obsolete RFC 850 form, and ANSI C `asctime()`.
///
/// # Examples
///
/// ```
/// use edgecache::http::date::parse_http_date;
///
/// let a = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
/// let b = parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT").unwrap();
/// let c = parse_http_date("Sun Nov  6 08:49:37 1994").unwrap();
/// assert_eq!(a, b);
/// assert_eq!(b, c);
/// assert!(parse_http_date("yesterday").is_none());
/// ```
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%A, %d-%b-%y %H:%M:%S GMT")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%a %b %e %H:%M:%S %Y"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Formats `at` as an IMF-fixdate.
pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
