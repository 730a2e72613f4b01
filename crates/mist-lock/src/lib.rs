//! Distributed mutual exclusion over the mist KV service, built from
//! version-conditional writes alone.

pub mod lock;

pub use lock::{DistLock, FREE_MARKER};
