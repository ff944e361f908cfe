//! User metadata and the header conventions of the RPC mapping.
//!
//! Metadata rides on HTTP/2 headers: ASCII values directly, binary values
//! under `-bin` keys as unpadded base64-url. Reserved names (pseudo headers,
//! `grpc-*`, transport-owned fields) never come from user metadata.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::header::{HeaderMap, HeaderName, HeaderValue};

use std::fmt;
use std::time::Duration;

/// Multimap of user-supplied request/response metadata.
#[derive(Debug, Default, Clone)]
pub struct Metadata {
    inner: HeaderMap,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    /// Appends an ASCII-valued entry. Keys are lower-cased; returns false if
    /// the key or value is not a legal header.
    pub fn append(&mut self, key: &str, value: &str) -> bool {
        let name = match HeaderName::from_bytes(key.to_ascii_lowercase().as_bytes()) {
            Ok(name) => name,
            Err(_) => return false,
        };
        let value = match HeaderValue::from_str(value) {
            Ok(value) => value,
            Err(_) => return false,
        };
        self.inner.append(name, value);
        true
    }

    /// Appends a binary-valued entry. The key must end in `-bin`; the value
    /// is stored in its wire encoding.
    pub fn append_bin(&mut self, key: &str, value: &[u8]) -> bool {
        if !key.ends_with("-bin") {
            return false;
        }
        self.append(key, &URL_SAFE_NO_PAD.encode(value))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).and_then(|v| v.to_str().ok())
    }

    pub fn get_all(&self, key: &str) -> impl Iterator<Item = &str> {
        self.inner.get_all(key).iter().filter_map(|v| v.to_str().ok())
    }

    /// Decodes a `-bin` entry back to raw bytes.
    pub fn get_bin(&self, key: &str) -> Option<Vec<u8>> {
        self.get(key).and_then(|v| URL_SAFE_NO_PAD.decode(v).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_bytes()))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub(crate) fn append_raw(&mut self, name: HeaderName, value: HeaderValue) {
        self.inner.append(name, value);
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_map()
            .entries(self.inner.iter().map(|(k, v)| (k.as_str(), v)))
            .finish()
    }
}

/// Returns true for header names the transport owns. User metadata entries
/// with reserved names are silently dropped from outgoing headers.
pub(crate) fn is_reserved_header(name: &str) -> bool {
    if name.starts_with(':') || name.starts_with("grpc-") {
        return true;
    }
    matches!(
        name,
        "content-type" | "content-encoding" | "te" | "connection" | "user-agent"
    )
}

// Largest value representable in a grpc-timeout header: 8 ASCII digits.
const MAX_TIMEOUT_VALUE: u128 = 100_000_000 - 1;

const TIMEOUT_UNITS: &[(char, u128)] = &[
    ('n', 1),
    ('u', 1_000),
    ('m', 1_000_000),
    ('S', 1_000_000_000),
    ('M', 60 * 1_000_000_000),
    ('H', 3_600 * 1_000_000_000),
];

fn div_round_up(d: u128, r: u128) -> u128 {
    if d % r > 0 {
        d / r + 1
    } else {
        d / r
    }
}

/// Encodes a deadline as a `grpc-timeout` header value.
///
/// Picks the smallest unit whose value fits in 8 digits, keeping maximum
/// precision. Values beyond ~11.4 millennia saturate.
pub(crate) fn encode_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();
    for &(unit, scale) in TIMEOUT_UNITS {
        let v = div_round_up(nanos, scale);
        if v <= MAX_TIMEOUT_VALUE {
            return format!("{}{}", v, unit);
        }
    }
    format!("{}H", MAX_TIMEOUT_VALUE)
}

/// Decodes a `grpc-timeout` header value. Only the server side of the
/// protocol consumes the header; the client keeps the decoder to check its
/// encoder against.
#[cfg(test)]
pub(crate) fn decode_timeout(value: &str) -> Option<Duration> {
    if value.is_empty() || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let scale = TIMEOUT_UNITS
        .iter()
        .find(|&&(u, _)| u.to_string() == unit)?
        .1;
    let v: u128 = digits.parse().ok()?;
    let nanos = v.checked_mul(scale)?;
    Some(Duration::new(
        (nanos / 1_000_000_000) as u64,
        (nanos % 1_000_000_000) as u32,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn reserved_headers() {
        assert!(is_reserved_header(":path"));
        assert!(is_reserved_header("grpc-timeout"));
        assert!(is_reserved_header("grpc-anything-else"));
        assert!(is_reserved_header("content-type"));
        assert!(is_reserved_header("te"));
        assert!(!is_reserved_header("x-request-id"));
        assert!(!is_reserved_header("authorization"));
    }

    #[test]
    fn binary_metadata_round_trip() {
        let mut md = Metadata::new();
        assert!(md.append_bin("trace-bin", &[0xde, 0xad, 0xbe, 0xef]));
        // The stored value is the wire form, without padding.
        assert!(!md.get("trace-bin").unwrap().contains('='));
        assert_eq!(md.get_bin("trace-bin").unwrap(), &[0xde, 0xad, 0xbe, 0xef]);
        // Keys without the -bin suffix are refused.
        assert!(!md.append_bin("trace", b"nope"));
    }

    #[test]
    fn metadata_keys_are_lowercased() {
        let mut md = Metadata::new();
        assert!(md.append("X-Request-Id", "abc"));
        assert_eq!(md.get("x-request-id"), Some("abc"));
    }

    #[test]
    fn timeout_picks_smallest_fitting_unit() {
        assert_eq!(encode_timeout(Duration::from_nanos(1)), "1n");
        assert_eq!(encode_timeout(Duration::from_millis(1)), "1000000n");
        // 1s in nanoseconds exceeds 8 digits, so microseconds are used.
        assert_eq!(encode_timeout(Duration::from_secs(1)), "1000000u");
        assert_eq!(encode_timeout(Duration::from_secs(100_000)), "100000S");
        assert_eq!(encode_timeout(Duration::ZERO), "0n");
    }

    #[test]
    fn timeout_decode() {
        assert_eq!(decode_timeout("1000m"), Some(Duration::from_secs(1)));
        assert_eq!(decode_timeout("7S"), Some(Duration::from_secs(7)));
        assert_eq!(decode_timeout("2H"), Some(Duration::from_secs(7200)));
        assert_eq!(decode_timeout(""), None);
        assert_eq!(decode_timeout("12x"), None);
        assert_eq!(decode_timeout("123456789S"), None);
    }

    quickcheck! {
        // Encoding never loses more than one unit of precision, and the
        // encoded value never understates the deadline by more than that
        // rounding (the peer must not time out early).
        fn timeout_round_trip_is_tight(millis: u32) -> bool {
            let d = Duration::from_millis(u64::from(millis));
            let decoded = decode_timeout(&encode_timeout(d)).unwrap();
            decoded >= d && decoded - d < Duration::from_secs(1)
        }
    }
}
