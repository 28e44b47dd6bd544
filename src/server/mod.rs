//! HTTP server

pub mod http;
pub mod rate_limit;

pub use http::{handle_request, run, AppState};
pub use rate_limit::RateLimiter;
