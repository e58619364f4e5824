//! Single-threaded wake primitives used by the dispatcher.
pub mod flag;
pub mod gauge;

pub use flag::Flag;
pub use gauge::{Gauge, GaugeGuard};
