//! Slidegate - Distributed Sliding-Window Throttling
//!
//! This crate decides, for a caller identity and a quota such as `60/m`,
//! whether a request should be admitted. Each identity keeps a newest-first
//! list of request timestamps in a shared cache, so every process talking to
//! the same store enforces the same sliding window.

pub mod config;
pub mod error;
pub mod store;
pub mod throttle;
