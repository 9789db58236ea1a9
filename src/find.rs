//! FindEngine: file-name matching over the names recorded in shards.
//!
//! No content is read. Each shard is one work item, handed to a fixed-size
//! pool of worker threads.

use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::index::{ShardReader, TrigramQuery};
use crate::query::{FindQuery, FindResult, Update};
use crate::repo::RepoStore;
use crossbeam_channel::bounded;
use regex::{Regex, RegexBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::debug;

pub struct FindEngine {
    config: Arc<Config>,
    store: Arc<RepoStore>,
}

struct WorkItem {
    key: String,
    shard: PathBuf,
}

impl FindEngine {
    pub fn new(config: Arc<Config>, store: Arc<RepoStore>) -> Self {
        Self { config, store }
    }

    /// Match `query.path_re` against every file name in the query's repos
    pub fn find(&self, ctx: &Context, query: &FindQuery) -> Result<FindResult> {
        let started = Instant::now();
        let re = RegexBuilder::new(&query.path_re)
            .case_insensitive(query.ignore_case)
            .build()
            .map_err(|e| Error::validation("path_re", e))?;

        let mut result = FindResult::default();
        let mut items = Vec::new();
        for key in &query.repo_keys {
            match self.store.get(key) {
                Some(repo) => items.extend(
                    repo.shard_paths(&self.config.index_extension)
                        .into_iter()
                        .map(|shard| WorkItem {
                            key: key.clone(),
                            shard,
                        }),
                ),
                None => {
                    result
                        .errors
                        .insert(key.clone(), Error::NoRepoFound(key.clone()).payload());
                }
            }
        }
        if items.is_empty() {
            result.elapsed = started.elapsed();
            return Ok(result);
        }

        let workers = self.config.find_concurrency.max(1).min(items.len());
        let (work_tx, work_rx) = bounded::<WorkItem>(items.len());
        let (result_tx, result_rx) = bounded::<FindResult>(items.len());

        thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let re = &re;
                scope.spawn(move || {
                    for item in work_rx.iter() {
                        if ctx.is_done() {
                            break;
                        }
                        let partial = scan_shard(ctx, &item, re);
                        if ctx.is_done() || result_tx.send(partial).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for item in items {
                if ctx.is_done() {
                    break;
                }
                // sized to the item count, never blocks
                if work_tx.send(item).is_err() {
                    break;
                }
            }
            drop(work_tx);

            for partial in result_rx.iter() {
                result.update(partial);
            }
        });

        if let Err(e) = ctx.check() {
            debug!(error = %e, "find stopped early");
        }
        result.elapsed = started.elapsed();
        Ok(result)
    }
}

/// Names matched between cancellation checks
const CHECK_EVERY: usize = 1024;

fn scan_shard(ctx: &Context, item: &WorkItem, re: &Regex) -> FindResult {
    let mut partial = FindResult::default();
    let reader = match ShardReader::open(&item.shard) {
        Ok(reader) => reader,
        Err(e) => {
            partial.errors.insert(item.key.clone(), e.payload());
            return partial;
        }
    };
    for (n, id) in reader.posting_query(&TrigramQuery::All).into_iter().enumerate() {
        if n % CHECK_EVERY == 0 && ctx.is_done() {
            break;
        }
        if let Some(name) = reader.name(id)
            && re.is_match(name)
        {
            partial.add(name, &item.key);
        }
    }
    partial
}
