//! The request multiplexer.
//!
//! One [`Dispatcher`] owns a set of listeners and a handle to the upstream
//! request queue. Clients connect, their framed requests are forwarded to
//! the upstream channel as they arrive (pipelined, without waiting for
//! earlier responses), and each response is written back to the connection
//! that originated it. Admission is bounded: accepts are armed on every
//! listener exactly while the number of active connections is below the
//! configured limit and the upstream has not failed.
//!
//! When the upstream fails a request the dispatcher enters drain: accepts
//! stop, armed reads are cancelled, and only in-flight response writes are
//! completed. Once the last connection vacates, [`Dispatcher::serve`]
//! returns and [`Status::is_alive`] reports false.
mod connection;
mod dispatcher;

pub use connection::MuxCoreService;
pub use dispatcher::{Dispatcher, Status};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Upper bound on concurrently admitted client connections.
    pub max_connections: usize,
    /// Upper bound on a single framed packet, either direction.
    pub max_frame_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_frame_size: 1024 * 1024,
        }
    }
}
