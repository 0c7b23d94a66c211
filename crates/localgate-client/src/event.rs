//! Lifecycle events republished to the caller.

use crate::error::TunnelError;
use std::net::SocketAddr;

/// Events surfaced by a running tunnel session, in order of occurrence.
///
/// `Dead` is deliberately undifferentiated: clean broker close, fatal local
/// failure, session expiry and the embedded timeout signal all surface as the
/// same event. The cause is recorded in logs only.
#[derive(Debug)]
pub enum TunnelEvent {
    /// The control connection to the broker is up.
    Open { remote_addr: SocketAddr },

    /// Best-effort observation of an inbound request's first line.
    Request { method: String, path: String },

    /// The session is over; no further events follow.
    Dead,

    /// The tunnel could not be established at all.
    Error(TunnelError),
}

/// Match a `<TOKEN> <PATH>` pattern at the start of a chunk: a word-character
/// method-like token, a single space, then a non-whitespace path token.
///
/// Observability only, not parsing: a chunk shaped any other way yields
/// nothing and is forwarded untouched either way.
pub(crate) fn sniff_request(chunk: &[u8]) -> Option<(String, String)> {
    let space = chunk.iter().position(|&b| b == b' ')?;
    let method = &chunk[..space];
    if method.is_empty() || !method.iter().all(|&b| b.is_ascii_alphanumeric() || b == b'_') {
        return None;
    }

    let rest = &chunk[space + 1..];
    let path_end = rest
        .iter()
        .position(|&b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .unwrap_or(rest.len());
    let path = &rest[..path_end];
    if path.is_empty() {
        return None;
    }

    Some((
        String::from_utf8_lossy(method).into_owned(),
        String::from_utf8_lossy(path).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniffs_request_line() {
        let chunk = b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n";
        let (method, path) = sniff_request(chunk).unwrap();
        assert_eq!(method, "GET");
        assert_eq!(path, "/foo");
    }

    #[test]
    fn test_sniffs_path_at_end_of_chunk() {
        let (method, path) = sniff_request(b"POST /api/v1").unwrap();
        assert_eq!(method, "POST");
        assert_eq!(path, "/api/v1");
    }

    #[test]
    fn test_binary_payload_yields_nothing() {
        assert!(sniff_request(&[0x16, 0x03, 0x01, 0x20, 0x41]).is_none());
        assert!(sniff_request(b"\x00\x01 binary").is_none());
    }

    #[test]
    fn test_requires_both_tokens() {
        assert!(sniff_request(b"GET").is_none());
        assert!(sniff_request(b"GET ").is_none());
        assert!(sniff_request(b" /foo").is_none());
    }

    #[test]
    fn test_not_anchored_mid_chunk() {
        // The pattern is anchored at the chunk start; a leading non-word byte
        // disqualifies the whole chunk.
        assert!(sniff_request(b"\r\nGET /foo HTTP/1.1").is_none());
    }

    #[test]
    fn test_empty_chunk() {
        assert!(sniff_request(b"").is_none());
    }
}
