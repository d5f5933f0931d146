//! Management API client.
//!
//! Every management endpoint is a POST that answers with a
//! `{"code": 0, "data": ...}` envelope; playback URLs are plain GETs.

pub mod client;
pub mod restore;
pub mod types;

pub use client::ApiClient;
pub use restore::{poll_until, Restore};
