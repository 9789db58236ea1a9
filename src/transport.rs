//! The router's view of peer nodes.

use crate::error::{Error, Result};
use crate::query::{FindQuery, FindResult, IndexQuery, IndexResult, SearchQuery, SearchResult};
use crate::utils::Endpoint;
use std::time::Duration;

/// Delivers a typed query to a peer's router and returns its typed result.
///
/// `Err` is reserved for failures to deliver (connection, framing, time
/// budget); errors the peer reports travel inside the result payload.
pub trait Transport: Send + Sync {
    fn index(&self, endpoint: &Endpoint, query: &IndexQuery, budget: Duration)
    -> Result<IndexResult>;

    fn search(
        &self,
        endpoint: &Endpoint,
        query: &SearchQuery,
        budget: Duration,
    ) -> Result<SearchResult>;

    fn find(&self, endpoint: &Endpoint, query: &FindQuery, budget: Duration) -> Result<FindResult>;
}

/// Transport for a node with no peers; every relay fails
pub struct NoTransport;

impl NoTransport {
    fn unreachable(endpoint: &Endpoint) -> Error {
        Error::Transport(format!("no transport configured to reach {}", endpoint))
    }
}

impl Transport for NoTransport {
    fn index(&self, endpoint: &Endpoint, _: &IndexQuery, _: Duration) -> Result<IndexResult> {
        Err(Self::unreachable(endpoint))
    }

    fn search(&self, endpoint: &Endpoint, _: &SearchQuery, _: Duration) -> Result<SearchResult> {
        Err(Self::unreachable(endpoint))
    }

    fn find(&self, endpoint: &Endpoint, _: &FindQuery, _: Duration) -> Result<FindResult> {
        Err(Self::unreachable(endpoint))
    }
}
