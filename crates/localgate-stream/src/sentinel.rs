//! Detection of an embedded timeout response in a byte stream.
//!
//! Some brokers signal an expired pairing by injecting an HTTP
//! "408 Request Timeout" response into the stream coming back from the local
//! service. The sentinel watches for that marker and raises a one-shot signal
//! so the session can retire the pairing; the bytes themselves are never
//! touched.

use tracing::debug;

/// Marker payload the sentinel looks for.
pub const TIMEOUT_MARKER: &[u8] = b"408 Request Timeout";

/// Observes a byte stream for [`TIMEOUT_MARKER`], signaling at most once.
///
/// The signal is the `true` return from [`observe`](Self::observe); once it
/// has fired the sentinel stays silent for the rest of its life. A small
/// carry-over window is kept between chunks so a marker split across two
/// reads is still caught.
#[derive(Debug)]
pub struct TimeoutSentinel {
    /// Tail of the previous chunk, at most `TIMEOUT_MARKER.len() - 1` bytes.
    carry: Vec<u8>,
    fired: bool,
}

impl TimeoutSentinel {
    pub fn new() -> Self {
        Self {
            carry: Vec::new(),
            fired: false,
        }
    }

    /// Feed one chunk. Returns `true` exactly once, on the first chunk that
    /// completes the marker. The chunk is not modified; callers forward the
    /// same bytes downstream regardless of the result.
    pub fn observe(&mut self, chunk: &[u8]) -> bool {
        if self.fired {
            return false;
        }

        let hit = if self.carry.is_empty() {
            contains(chunk, TIMEOUT_MARKER)
        } else {
            // Join the carried tail with the new chunk so boundary-spanning
            // markers are seen. The joined window is bounded: carry is under
            // one marker length.
            let mut window = Vec::with_capacity(self.carry.len() + chunk.len());
            window.extend_from_slice(&self.carry);
            window.extend_from_slice(chunk);
            contains(&window, TIMEOUT_MARKER)
        };

        if hit {
            debug!("timeout marker observed in local response stream");
            self.fired = true;
            self.carry.clear();
            return true;
        }

        // Keep the last marker-length-minus-one bytes for the next call.
        let keep = TIMEOUT_MARKER.len() - 1;
        if chunk.len() >= keep {
            self.carry.clear();
            self.carry.extend_from_slice(&chunk[chunk.len() - keep..]);
        } else {
            self.carry.extend_from_slice(chunk);
            if self.carry.len() > keep {
                let drop = self.carry.len() - keep;
                self.carry.drain(..drop);
            }
        }

        false
    }

    /// Whether the signal has already fired.
    pub fn fired(&self) -> bool {
        self.fired
    }
}

impl Default for TimeoutSentinel {
    fn default() -> Self {
        Self::new()
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_on_marker_in_single_chunk() {
        let mut sentinel = TimeoutSentinel::new();
        let chunk = b"HTTP/1.1 408 Request Timeout\r\nConnection: close\r\n\r\n";
        assert!(sentinel.observe(chunk));
        assert!(sentinel.fired());
    }

    #[test]
    fn test_fires_anywhere_in_chunk() {
        let mut sentinel = TimeoutSentinel::new();
        let chunk = b"some leading junk then 408 Request Timeout trailing";
        assert!(sentinel.observe(chunk));
    }

    #[test]
    fn test_fires_only_once() {
        let mut sentinel = TimeoutSentinel::new();
        let chunk = b"408 Request Timeout";
        assert!(sentinel.observe(chunk));
        assert!(!sentinel.observe(chunk));
        assert!(!sentinel.observe(chunk));
    }

    #[test]
    fn test_silent_without_marker() {
        let mut sentinel = TimeoutSentinel::new();
        assert!(!sentinel.observe(b"HTTP/1.1 200 OK\r\n\r\nhello"));
        assert!(!sentinel.observe(b"408 Request Time"));
        assert!(!sentinel.observe(&[0u8, 159, 146, 150]));
        assert!(!sentinel.fired());
    }

    #[test]
    fn test_fires_across_chunk_boundary() {
        let mut sentinel = TimeoutSentinel::new();
        assert!(!sentinel.observe(b"HTTP/1.1 408 Requ"));
        assert!(sentinel.observe(b"est Timeout\r\n"));
    }

    #[test]
    fn test_boundary_with_tiny_chunks() {
        let mut sentinel = TimeoutSentinel::new();
        for chunk in [&b"408"[..], b" Req", b"uest", b" Tim"] {
            assert!(!sentinel.observe(chunk));
        }
        assert!(sentinel.observe(b"eout"));
    }
}
