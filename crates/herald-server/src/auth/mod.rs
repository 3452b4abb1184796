//! Connection-level protections around identity claims.

pub mod rate_limit;

pub use rate_limit::{AuthRateLimiter, RateLimiter};
