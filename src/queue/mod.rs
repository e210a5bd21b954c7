//! Request arbitration for scarce local resources
//!
//! Each resource key (a model id) has a FIFO of pending requests and a
//! single active slot. A per-client sliding window rate limiter guards
//! admission, and every execution runs under a deadline.

mod manager;
mod rate_limit;

pub use manager::*;
pub use rate_limit::RateLimiter;
