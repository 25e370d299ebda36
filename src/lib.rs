//! Tollgate - token-bucket admission control
//!
//! This crate provides request admission control in three deployment modes:
//! a single in-memory [`TokenBucket`](ratelimit::TokenBucket), a per-key
//! [`KeyedLimiter`](ratelimit::KeyedLimiter), and a
//! [`SharedStoreLimiter`](ratelimit::SharedStoreLimiter) whose state lives in
//! an external atomic store, guarded by a circuit breaker and a configurable
//! failure mode.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
