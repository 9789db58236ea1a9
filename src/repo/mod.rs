//! Repo records and the store that holds them.
//!
//! - [`Repo`] - one indexed source tree and its shard layout
//! - [`Meta`] / [`MetaFilter`] - node identity metadata and query-side matching
//! - [`RepoStore`] - concurrent, optionally file-backed map of repos by key

mod meta;
mod store;

pub use meta::{HOST_KEY, Meta, MetaFilter, RPC_PORT_KEY};
pub use store::RepoStore;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lifecycle of a repo: `Null -> Indexing -> {Ok, Error}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepoState {
    #[default]
    Null,
    /// Placeholder stored while a build is in flight
    Indexing,
    Ok,
    Error,
}

impl std::fmt::Display for RepoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RepoState::Null => "NULL",
            RepoState::Indexing => "INDEXING",
            RepoState::Ok => "OK",
            RepoState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Repo {
    pub key: String,
    /// Absolute source root; shard file names are relative to it
    pub root: PathBuf,
    /// Directory holding `<key>-<n>.<ext>` shard files
    pub index_path: PathBuf,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub state: RepoState,
    #[serde(default)]
    pub num_shards: u32,
    #[serde(default)]
    pub num_dirs: u64,
    #[serde(default)]
    pub num_files: u64,
    #[serde(default)]
    pub size_index: u64,
    #[serde(default)]
    pub size_data: u64,
    #[serde(default)]
    pub elapsed_indexing: Duration,
    /// Unix seconds
    #[serde(default)]
    pub time_created: u64,
    /// Unix seconds
    #[serde(default)]
    pub time_updated: u64,
}

impl Repo {
    pub fn new(key: impl Into<String>, root: impl Into<PathBuf>, meta: Meta) -> Self {
        let now = unix_now();
        Self {
            key: key.into(),
            root: root.into(),
            meta,
            time_created: now,
            time_updated: now,
            ..Default::default()
        }
    }

    /// Path of shard `n`: `<index_path>/<key>-<n>.<ext>`
    pub fn shard_path(&self, n: u32, ext: &str) -> PathBuf {
        shard_path(&self.index_path, &self.key, n, ext)
    }

    pub fn shard_paths(&self, ext: &str) -> Vec<PathBuf> {
        (0..self.num_shards).map(|n| self.shard_path(n, ext)).collect()
    }

    /// Owning node as recorded in metadata (empty means this node)
    pub fn host(&self) -> &str {
        self.meta.host()
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        unix_now().saturating_sub(self.time_updated) > threshold.as_secs()
    }
}

pub fn shard_path(dir: &Path, key: &str, n: u32, ext: &str) -> PathBuf {
    dir.join(format!("{}-{}.{}", key, n, ext))
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
