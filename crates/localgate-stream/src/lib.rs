//! Byte-stream transforms used by the tunnel client.
//!
//! Both transforms operate on raw chunks and never reframe the stream: what
//! goes in comes out, in order, with at most the Host header value rewritten.

pub mod rewrite;
pub mod sentinel;

pub use rewrite::HostRewriteFilter;
pub use sentinel::TimeoutSentinel;
