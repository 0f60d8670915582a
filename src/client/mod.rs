//! HTTP access for remote sources.

mod http;
mod pacer;

pub use http::*;
pub use pacer::*;
