//! Query and result payloads for the three query kinds.
//!
//! Results are accumulators: [`Update::update`] folds another result into
//! this one. Sub-results arrive in no particular order, so every merge here
//! is commutative and associative.

mod find;
mod index;
mod search;

pub use find::{FindQuery, FindResult};
pub use index::{IndexQuery, IndexResult};
pub use search::{LineMatches, SearchQuery, SearchResult};

use crate::error::ErrorPayload;
use crate::repo::Meta;
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-repo or per-host errors
pub type ErrorMap = BTreeMap<String, ErrorPayload>;

pub trait Update {
    fn update(&mut self, other: Self);
}

/// Union of two error maps; on a shared key the smaller payload wins
pub fn merge_errors(into: &mut ErrorMap, other: ErrorMap) {
    for (key, err) in other {
        match into.get_mut(&key) {
            Some(existing) if *existing <= err => {}
            Some(existing) => *existing = err,
            None => {
                into.insert(key, err);
            }
        }
    }
}

/// Keep the smaller of two optional global errors
pub fn merge_error(into: &mut Option<ErrorPayload>, other: Option<ErrorPayload>) {
    if let Some(other) = other {
        match into {
            Some(existing) if *existing <= other => {}
            _ => *into = Some(other),
        }
    }
}

/// Accumulated result of any query kind
pub trait RoutedResult: Update + Default + Send + 'static {
    fn errors_mut(&mut self) -> &mut ErrorMap;
    fn error_mut(&mut self) -> &mut Option<ErrorPayload>;

    fn num_matches(&self) -> u64 {
        0
    }

    fn set_elapsed(&mut self, elapsed: Duration);

    fn failed(err: impl Into<ErrorPayload>) -> Self {
        let mut result = Self::default();
        *result.error_mut() = Some(err.into());
        result
    }

    /// Record `err` against `key`, keeping the smaller payload on collision
    fn add_error(&mut self, key: &str, err: impl Into<ErrorPayload>) {
        let err: ErrorPayload = err.into();
        merge_errors(self.errors_mut(), ErrorMap::from([(key.to_string(), err)]));
    }

    /// Move a peer's global error under `key`; it concerns only that peer
    fn demote_error(&mut self, key: &str) {
        if let Some(err) = self.error_mut().take() {
            self.add_error(key, err);
        }
    }
}

macro_rules! routed_result {
    ($ty:ty, $matches:expr) => {
        impl $crate::query::RoutedResult for $ty {
            fn errors_mut(&mut self) -> &mut $crate::query::ErrorMap {
                &mut self.errors
            }

            fn error_mut(&mut self) -> &mut Option<$crate::error::ErrorPayload> {
                &mut self.error
            }

            fn num_matches(&self) -> u64 {
                let count: fn(&Self) -> u64 = $matches;
                count(self)
            }

            fn set_elapsed(&mut self, elapsed: std::time::Duration) {
                self.elapsed = elapsed;
            }
        }
    };
}

pub(crate) use routed_result;

/// Fields the router needs from any query kind
pub trait RoutedQuery: Clone + Send + 'static {
    /// Whether this node may relay the query one hop to a peer
    fn recurse(&self) -> bool;
    fn set_recurse(&mut self, recurse: bool);
    fn timeout(&self) -> Option<Duration>;
    fn set_timeout(&mut self, timeout: Duration);
    fn repo_keys(&self) -> &[String];
    fn set_repo_keys(&mut self, keys: Vec<String>);
    fn meta(&self) -> &Meta;
    fn meta_regexp_match(&self) -> bool;
}

macro_rules! routed_query {
    ($ty:ty) => {
        impl $crate::query::RoutedQuery for $ty {
            fn recurse(&self) -> bool {
                self.recurse
            }

            fn set_recurse(&mut self, recurse: bool) {
                self.recurse = recurse;
            }

            fn timeout(&self) -> Option<std::time::Duration> {
                self.timeout_ms.map(std::time::Duration::from_millis)
            }

            fn set_timeout(&mut self, timeout: std::time::Duration) {
                let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                self.timeout_ms = Some(ms.max(1));
            }

            fn repo_keys(&self) -> &[String] {
                &self.repo_keys
            }

            fn set_repo_keys(&mut self, keys: Vec<String>) {
                self.repo_keys = keys;
            }

            fn meta(&self) -> &$crate::repo::Meta {
                &self.meta
            }

            fn meta_regexp_match(&self) -> bool {
                self.meta_regexp_match
            }
        }
    };
}

pub(crate) use routed_query;
