//! # Wiremux services
//!
//! The moving parts of the wiremux request multiplexer:
//!
//! - [`mux::Dispatcher`]: admission-controlled accept loop over a set of
//!   listeners, spawning one [`mux::MuxCoreService`] call per admitted
//!   client connection.
//! - [`mux::MuxCoreService`]: the per-connection relay. Reads framed
//!   requests, forwards each to the upstream request queue without waiting
//!   for the previous response (pipelining), and writes responses back in
//!   the order the upstream completes them.
//! - [`upstream::WireRequestQueue`]: owns the single connection to the
//!   upstream target, multiplexes requests onto it under internally
//!   assigned ids and routes the (possibly reordered) responses back to
//!   their waiters. Any upstream failure fans out to every in-flight
//!   request and puts the dispatcher into drain.
//! - [`common`]: the small single-threaded wake primitives the above are
//!   built from.
//!
//! Everything here is single-threaded cooperative on the monoio runtime:
//! state is shared with `Rc`/`Cell` and callbacks are plain spawned tasks.
pub mod common;
pub mod mux;
pub mod upstream;
