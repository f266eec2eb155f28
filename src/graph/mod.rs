//! Gateway client for the remote mail API.
//!
//! Wraps authentication (OAuth2 client credentials with a cached bearer
//! token), request execution with retry/backoff, and opaque-continuation
//! pagination. All remote access in the crawl pipelines goes through
//! [`GraphClient`].

mod client;

pub use client::{GraphClient, GraphError, Pager};

use serde_json::Value;

/// Items of a listing page (`value` array), empty when absent.
pub fn page_values(page: &Value) -> &[Value] {
    page.get("value")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
