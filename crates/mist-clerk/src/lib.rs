//! Fault-tolerant client for the mist KV service.

pub mod clerk;

pub use clerk::{Clerk, RetryConfig};
