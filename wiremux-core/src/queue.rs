//! The seam between the dispatcher and the upstream request channel.

use std::{future::Future, io};

use bytes::Bytes;

/// Handle to the multiplexed upstream request channel.
///
/// `enqueue` either refuses synchronously (the upstream is gone) or promises
/// exactly one completion: `Some(body)` carrying the response payload, or
/// `None` when the upstream failed the request. After any `None` the queue
/// refuses every later enqueue.
pub trait RequestQueue {
    type Pending: Future<Output = Option<Bytes>> + 'static;

    fn enqueue(&self, body: Bytes) -> io::Result<Self::Pending>;
}
