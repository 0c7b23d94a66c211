//! Host-header substitution for tunneled HTTP requests.
//!
//! Local services that virtual-host on the `Host` header would otherwise see
//! the public tunnel hostname. The filter buffers the first request's header
//! block, swaps the `Host` value for the configured local host, and from then
//! on passes every byte through verbatim.

use tracing::debug;

/// Upper bound on how many bytes are buffered while waiting for the header
/// terminator. Streams that exceed it are flushed through unmodified.
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Maximum number of headers handed to httparse.
const MAX_HEADERS: usize = 100;

/// Rewrites the `Host` header value in the first HTTP request of a stream.
///
/// One filter instance serves one pairing; the rewrite happens at most once.
/// Input that is not HTTP-shaped, or whose header block never completes
/// within [`MAX_HEADER_BYTES`], is passed through bit-identical.
#[derive(Debug)]
pub struct HostRewriteFilter {
    host: String,
    buffer: Vec<u8>,
    done: bool,
}

impl HostRewriteFilter {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            buffer: Vec::new(),
            done: false,
        }
    }

    /// Feed one chunk and get the bytes to forward downstream.
    ///
    /// While the first header block is still incomplete this returns an empty
    /// vector (the bytes are buffered); afterwards every call returns its
    /// input unchanged.
    pub fn transform(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.done {
            return chunk.to_vec();
        }

        self.buffer.extend_from_slice(chunk);

        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut headers);
            req.parse(&self.buffer)
        };
        match parsed {
            Ok(httparse::Status::Complete(header_len)) => {
                let mut out = rewrite_host(&self.buffer[..header_len], &self.host);
                out.extend_from_slice(&self.buffer[header_len..]);
                self.done = true;
                self.buffer = Vec::new();
                out
            }
            Ok(httparse::Status::Partial) => {
                if self.buffer.len() > MAX_HEADER_BYTES {
                    debug!(
                        buffered = self.buffer.len(),
                        "header block never completed, passing stream through"
                    );
                    self.flush()
                } else {
                    Vec::new()
                }
            }
            Err(e) => {
                // Not HTTP. Stop looking and forward everything as-is.
                debug!("stream is not an HTTP request ({e:?}), passing through");
                self.flush()
            }
        }
    }

    fn flush(&mut self) -> Vec<u8> {
        self.done = true;
        std::mem::take(&mut self.buffer)
    }
}

/// Replace the value of the first `Host` header in a complete header block,
/// preserving the original header-name casing. A block without a `Host`
/// header is returned unchanged.
fn rewrite_host(block: &[u8], host: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.len() + host.len());
    let mut replaced = false;

    let mut rest = block;
    while let Some(pos) = rest.windows(2).position(|w| w == b"\r\n") {
        let line = &rest[..pos];
        if !replaced {
            if let Some(colon) = line.iter().position(|&b| b == b':') {
                if line[..colon].eq_ignore_ascii_case(b"host") {
                    out.extend_from_slice(&line[..colon]);
                    out.extend_from_slice(b": ");
                    out.extend_from_slice(host.as_bytes());
                    out.extend_from_slice(b"\r\n");
                    replaced = true;
                    rest = &rest[pos + 2..];
                    continue;
                }
            }
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
        rest = &rest[pos + 2..];
    }
    out.extend_from_slice(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrites_host_value() {
        let mut filter = HostRewriteFilter::new("localhost");
        let input = b"GET / HTTP/1.1\r\nHost: abc.tunnel.example\r\nAccept: */*\r\n\r\n";
        let out = filter.transform(input);
        assert_eq!(
            out,
            b"GET / HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn test_preserves_header_name_casing() {
        let mut filter = HostRewriteFilter::new("svc.internal");
        let out = filter.transform(b"GET / HTTP/1.1\r\nhost: pub.example\r\n\r\n");
        assert_eq!(out, b"GET / HTTP/1.1\r\nhost: svc.internal\r\n\r\n");
    }

    #[test]
    fn test_body_and_later_chunks_untouched() {
        let mut filter = HostRewriteFilter::new("localhost");
        let input =
            b"POST /api HTTP/1.1\r\nHost: pub.example\r\nContent-Length: 4\r\n\r\nbody".to_vec();
        let out = filter.transform(&input);
        assert!(out.ends_with(b"\r\n\r\nbody"));

        // Keep-alive traffic after the first request passes through verbatim,
        // including a second Host header.
        let second = b"GET /next HTTP/1.1\r\nHost: pub.example\r\n\r\n";
        assert_eq!(filter.transform(second), second.to_vec());
    }

    #[test]
    fn test_buffers_until_headers_complete() {
        let mut filter = HostRewriteFilter::new("localhost");
        assert!(filter.transform(b"GET / HTTP/1.1\r\nHos").is_empty());
        let out = filter.transform(b"t: pub.example\r\n\r\n");
        assert_eq!(out, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
    }

    #[test]
    fn test_non_http_passes_through() {
        let mut filter = HostRewriteFilter::new("localhost");
        let input: Vec<u8> = vec![0x16, 0x03, 0x01, 0x00, 0xc8, 0xff, 0x00];
        let out = filter.transform(&input);
        assert_eq!(out, input);
        // And stays transparent afterwards.
        assert_eq!(filter.transform(b"more"), b"more".to_vec());
    }

    #[test]
    fn test_request_without_host_header_unchanged() {
        let mut filter = HostRewriteFilter::new("localhost");
        let input = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert_eq!(filter.transform(input), input.to_vec());
    }

    #[test]
    fn test_oversized_header_block_flushed() {
        let mut filter = HostRewriteFilter::new("localhost");
        let mut input = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        input.extend(std::iter::repeat(b'a').take(MAX_HEADER_BYTES + 1));
        let out = filter.transform(&input);
        assert_eq!(out, input);
    }
}
