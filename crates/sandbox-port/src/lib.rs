//! Platform shims consumed by the sandbox runtime.
//!
//! The core crates only assume three capabilities from the host:
//! - scoped mutual exclusion ([`lock`]), swappable per environment
//! - cooperative yield and sleep ([`time`])
//! - leveled log emission ([`log`], backed by `tracing`)

pub mod lock;
pub mod log;
pub mod time;

pub use lock::{Blocking, LockKind, PortMutex, PortRwLock, Uncontended};
pub use time::Deadline;
