//! Per-protocol implementations of the socket contract.
//!
//! Each concrete socket shape composes these free functions; shapes a
//! delegate does not apply to never call into it (the facade asserts the
//! protocol invariant with an unreachable arm instead).

pub(crate) mod bidirectional;
pub(crate) mod client;
pub(crate) mod server;
