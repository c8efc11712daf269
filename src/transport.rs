//! Network layer boundary.
//!
//! The stack does not speak to the wire itself: the NDN face, signing and
//! forwarding live behind [`NetworkTransport`]. The contract is
//! deliberately narrow: express a request with completion callbacks, or
//! publish a named segment. Result callbacks are delivered on an
//! unspecified thread, concurrently with application-thread activity;
//! implementations on our side treat them accordingly (short critical
//! sections, no callback invocation under a lock).

use std::time::Duration;

use crate::packet::NetworkData;
use crate::Result;

/// A pending fetch request: content name plus how long the network layer
/// should keep it alive before reporting a timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub name: String,
    pub lifetime: Duration,
}

impl Interest {
    pub fn new(name: impl Into<String>, lifetime: Duration) -> Self {
        Self { name: name.into(), lifetime }
    }
}

/// Completion callback: the requested data arrived.
pub type OnData = Box<dyn FnOnce(NetworkData) + Send>;

/// Timeout callback: the request expired unanswered. Per-request timeout
/// is owned by the network layer; the queue only carries this reference.
pub type OnTimeout = Box<dyn FnOnce(Interest) + Send>;

/// The underlying NDN transport/face abstraction.
pub trait NetworkTransport: Send + Sync + 'static {
    /// Express a fetch request. Asynchronous: exactly one of `on_data` /
    /// `on_timeout` fires later, on an unspecified thread. Ownership of
    /// the callbacks transfers to the network layer's pending-request
    /// table.
    fn express_request(&self, interest: Interest, on_data: OnData, on_timeout: OnTimeout);

    /// Publish one named, immutable segment.
    fn publish_segment(&self, name: &str, segment: NetworkData) -> Result<()>;
}
