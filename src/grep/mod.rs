//! GrepEngine: content search over one repo's shards.

pub mod matcher;

pub use matcher::{ContextLines, FileMatches, LineMatcher};

use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::index::{ShardReader, plan};
use crate::query::{SearchQuery, SearchResult};
use crate::repo::{RepoState, RepoStore};
use rayon::prelude::*;
use regex::Regex;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub struct GrepEngine {
    config: Arc<Config>,
    store: Arc<RepoStore>,
}

enum Scan {
    Hit(String, FileMatches),
    /// File disappeared or became unreadable since indexing
    Vanished(String),
    Failed(String, io::Error),
    Skipped,
}

impl GrepEngine {
    pub fn new(config: Arc<Config>, store: Arc<RepoStore>) -> Self {
        Self { config, store }
    }

    /// Search exactly one repo. Callers split multi-repo queries.
    pub fn search(&self, ctx: &Context, query: &SearchQuery) -> Result<SearchResult> {
        let started = Instant::now();
        let key = match query.repo_keys.as_slice() {
            [key] => key.as_str(),
            keys => {
                return Err(Error::Internal(format!(
                    "grep takes exactly one repo key, got {}",
                    keys.len()
                )));
            }
        };
        let repo = self
            .store
            .get(key)
            .ok_or_else(|| Error::NoRepoFound(key.to_string()))?;

        let matcher = LineMatcher::new(&query.re, query.ignore_case)?;
        let trigrams = plan(&query.re, query.ignore_case)?;
        let path_re = match &query.path_re {
            Some(p) if !p.is_empty() => {
                Some(Regex::new(p).map_err(|e| Error::validation("path_re", e))?)
            }
            _ => None,
        };
        let context = ContextLines {
            before: query.lines_before(),
            after: query.lines_after(),
        };

        let mut result = SearchResult::default();
        let mut vanished = 0usize;

        for shard_path in repo.shard_paths(&self.config.index_extension) {
            if let Err(e) = ctx.check() {
                result.errors.insert(key.to_string(), e.payload());
                break;
            }

            let reader = match ShardReader::open(&shard_path) {
                Ok(reader) => reader,
                Err(e) => {
                    warn!(key, shard = %shard_path.display(), error = %e, "cannot open shard");
                    result.errors.insert(key.to_string(), e.payload());
                    continue;
                }
            };

            let posting_started = Instant::now();
            let ids = reader.posting_query(&trigrams);
            result.elapsed_posting += posting_started.elapsed();

            let candidates: Vec<&str> = ids
                .into_iter()
                .filter(|&id| !reader.is_binary(id))
                .filter_map(|id| reader.name(id))
                .filter(|name| path_re.as_ref().is_none_or(|re| re.is_match(name)))
                .collect();
            debug!(key, shard = %shard_path.display(), candidates = candidates.len(), "posting query");

            let scans: Vec<Scan> = candidates
                .par_iter()
                .map(|&name| {
                    if ctx.is_done() {
                        return Scan::Skipped;
                    }
                    match matcher.grep_file(&repo.root.join(name), context) {
                        Ok(found) if found.num_matches > 0 => Scan::Hit(name.to_string(), found),
                        Ok(_) => Scan::Skipped,
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                            ) =>
                        {
                            Scan::Vanished(name.to_string())
                        }
                        Err(e) => Scan::Failed(name.to_string(), e),
                    }
                })
                .collect();

            for scan in scans {
                match scan {
                    Scan::Hit(name, found) => {
                        result.num_matches += found.num_matches;
                        result.add_lines(&name, key, found.lines);
                    }
                    Scan::Vanished(name) => {
                        debug!(key, file = %name, "indexed file no longer readable");
                        vanished += 1;
                    }
                    Scan::Failed(name, e) => {
                        let err = Error::Internal(format!("{}: {}", name, e));
                        result.errors.insert(key.to_string(), err.payload());
                    }
                    Scan::Skipped => {}
                }
            }
        }

        if vanished > 0 && repo.state != RepoState::Error {
            warn!(key, vanished, "repo out of date with its source, marking ERROR");
            if let Err(e) = self.store.set_state(key, RepoState::Error) {
                warn!(key, error = %e, "failed to update repo state");
            }
        }
        if ctx.is_done()
            && !result.errors.contains_key(key)
            && let Err(e) = ctx.check()
        {
            result.errors.insert(key.to_string(), e.payload());
        }

        result.elapsed = started.elapsed();
        Ok(result)
    }
}
