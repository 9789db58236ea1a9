//! IndexEngine: builds a repo's sharded trigram index from a source tree.

use super::shard::ShardWriter;
use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::query::{IndexQuery, IndexResult, RoutedResult};
use crate::repo::{Repo, RepoState, RepoStore, shard_path};
use crate::transport::Transport;
use crate::utils::{Endpoint, LocalHosts};
use globset::GlobSet;
use ignore::WalkBuilder;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct IndexEngine {
    config: Arc<Config>,
    store: Arc<RepoStore>,
    hosts: Arc<LocalHosts>,
    transport: Arc<dyn Transport>,
    exclude: GlobSet,
}

/// Counters and outcome of one local build
struct Build {
    repo: Repo,
    error: Option<Error>,
    /// The build stopped early and wrote nothing
    interrupted: bool,
}

impl IndexEngine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<RepoStore>,
        hosts: Arc<LocalHosts>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let exclude = config.exclude_set()?;
        Ok(Self {
            config,
            store,
            hosts,
            transport,
            exclude,
        })
    }

    /// Build (or relay, or reuse) the index for `query.key`.
    ///
    /// Validation failures set the result's global error and touch nothing.
    /// Build and relay failures are reported under the repo key.
    pub fn index(&self, ctx: &Context, query: &IndexQuery) -> IndexResult {
        let started = Instant::now();
        let mut result = self.index_inner(ctx, query);
        result.elapsed = started.elapsed();
        result
    }

    fn index_inner(&self, ctx: &Context, query: &IndexQuery) -> IndexResult {
        if let Err(e) = query.validate() {
            return IndexResult::failed(e);
        }

        let key = query.key.as_str();
        let local = self.hosts.is_local(query.meta.host());
        let existing = self.store.get(key);

        if let Some(existing) = &existing {
            let rebuild = local
                && (existing.state == RepoState::Error
                    || existing.is_stale(self.config.repo_stale_after()));
            if !rebuild {
                if existing.state == RepoState::Indexing && !local {
                    return keyed_failure(
                        key,
                        Error::RepoUnavailable(format!("{} is being indexed, cannot backfill", key)),
                    );
                }
                debug!(key, state = %existing.state, "index request served from store");
                return IndexResult {
                    repo: Some(existing.clone()),
                    ..Default::default()
                };
            }
        }

        let mut placeholder = Repo::new(key, &query.root, self.repo_meta(query, local));
        placeholder.state = RepoState::Indexing;
        if let Some(existing) = &existing {
            placeholder.time_created = existing.time_created;
        }
        if let Err(e) = self.store.set(key, Some(placeholder.clone())) {
            return keyed_failure(key, e);
        }

        if local {
            self.build_local(ctx, query, placeholder)
        } else if query.recurse {
            self.relay(ctx, query)
        } else {
            self.forget(key);
            keyed_failure(
                key,
                Error::UnresolvableBackend(format!(
                    "{} is owned by {:?} and the query may not be relayed",
                    key,
                    query.meta.host()
                )),
            )
        }
    }

    fn repo_meta(&self, query: &IndexQuery, local: bool) -> crate::repo::Meta {
        if local {
            query.meta.with_defaults(&self.config.repo_meta)
        } else {
            query.meta.clone()
        }
    }

    fn build_local(&self, ctx: &Context, query: &IndexQuery, placeholder: Repo) -> IndexResult {
        let key = query.key.as_str();
        info!(key, root = %query.root.display(), dirs = query.dirs.len(), "index build started");

        let build = match self.build(ctx, query, placeholder) {
            Ok(build) => build,
            Err(e) => {
                self.forget(key);
                return keyed_failure(key, e);
            }
        };

        let repo = build.repo;
        let stored = if build.interrupted {
            self.forget(key);
            Ok(())
        } else {
            self.store.set(key, Some(repo.clone()))
        };

        info!(
            key,
            state = %repo.state,
            dirs = repo.num_dirs,
            files = repo.num_files,
            elapsed_ms = repo.elapsed_indexing.as_millis() as u64,
            "index build finished"
        );

        let mut result = IndexResult {
            repo: Some(repo),
            ..Default::default()
        };
        if let Some(e) = build.error.or(stored.err()) {
            result.add_error(key, e);
        }
        result
    }

    fn build(&self, ctx: &Context, query: &IndexQuery, mut repo: Repo) -> Result<Build> {
        let started = Instant::now();
        let n = self.config.shard_count();
        let ext = self.config.index_extension.as_str();

        repo.index_path = self.config.index_path_for(&repo.key, &query.root)?;
        repo.num_shards = n as u32;

        let mut writers = (0..n)
            .map(|i| ShardWriter::create(shard_path(&repo.index_path, &repo.key, i as u32, ext)))
            .collect::<std::io::Result<Vec<_>>>()?;

        let mut error: Option<Error> = None;
        let mut interrupted = false;

        for dir in &query.dirs {
            if let Err(e) = ctx.check() {
                warn!(key = %repo.key, dir = %dir.display(), "index build interrupted");
                error = Some(e);
                interrupted = true;
                break;
            }
            if let Err(e) = self.walk(&query.root, dir, &mut repo, &mut writers) {
                error = Some(e);
            }
        }
        if !interrupted && let Err(e) = ctx.check() {
            error = Some(e);
            interrupted = true;
        }

        if !interrupted {
            for writer in &mut writers {
                if let Err(e) = writer.flush() {
                    error = Some(e.into());
                }
                repo.size_index += writer.index_bytes();
                repo.size_data += writer.data_bytes();
            }
        }

        repo.state = if error.is_none() {
            RepoState::Ok
        } else {
            RepoState::Error
        };
        repo.elapsed_indexing = started.elapsed();
        repo.time_updated = crate::repo::unix_now();

        Ok(Build {
            repo,
            error,
            interrupted,
        })
    }

    /// Walk one requested sub-directory; the last error seen is returned
    /// after the whole subtree has been visited
    fn walk(
        &self,
        root: &Path,
        dir: &Path,
        repo: &mut Repo,
        writers: &mut [ShardWriter],
    ) -> Result<()> {
        let exclude = self.exclude.clone();
        let walker = WalkBuilder::new(root.join(dir))
            .standard_filters(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| !exclude.is_match(entry.file_name()))
            .build();

        let mut last_err: Option<Error> = None;
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "walk error");
                    last_err = Some(Error::Internal(e.to_string()));
                    continue;
                }
            };
            let Some(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                repo.num_dirs += 1;
            } else if file_type.is_file() {
                let Ok(rel) = entry.path().strip_prefix(root) else {
                    continue;
                };
                let shard = (repo.num_files % writers.len() as u64) as usize;
                match writers[shard].add_file_in_root(root, rel) {
                    Ok(()) => repo.num_files += 1,
                    Err(e) => {
                        debug!(path = %rel.display(), error = %e, "skipping unreadable file");
                        last_err = Some(e.into());
                    }
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn relay(&self, ctx: &Context, query: &IndexQuery) -> IndexResult {
        let key = query.key.as_str();
        let endpoint = Endpoint::from_meta(&query.meta, self.config.default_rpc_port);
        let budget = ctx.remaining().unwrap_or_else(|| self.config.timeout_index());

        let mut relayed = query.clone();
        relayed.recurse = false;
        info!(key, %endpoint, "relaying index request");

        match self.transport.index(&endpoint, &relayed, budget) {
            Ok(mut result) => {
                let stored = match &result.repo {
                    Some(repo) => self.store.set(key, Some(repo.clone())),
                    None => {
                        self.forget(key);
                        Ok(())
                    }
                };
                if let Err(e) = stored {
                    result.add_error(key, e);
                }
                result.demote_error(key);
                result
            }
            Err(e) => {
                self.forget(key);
                keyed_failure(key, e)
            }
        }
    }

    /// Drop the placeholder so a later request can retry
    fn forget(&self, key: &str) {
        if let Err(e) = self.store.delete(key) {
            warn!(key, error = %e, "failed to remove index placeholder");
        }
    }
}

fn keyed_failure(key: &str, err: Error) -> IndexResult {
    let mut result = IndexResult::default();
    result.add_error(key, err);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::index::shard::ShardReader;
    use crate::repo::Meta;
    use crate::transport::NoTransport;
    use std::fs;
    use std::path::PathBuf;

    fn engine(index_root: &Path, num_shards: usize) -> (IndexEngine, Arc<RepoStore>) {
        let config = Arc::new(Config {
            index_root: Some(index_root.to_path_buf()),
            num_shards,
            ..Config::default()
        });
        let store = Arc::new(RepoStore::in_memory());
        let engine = IndexEngine::new(
            config,
            Arc::clone(&store),
            Arc::new(LocalHosts::with_names(["node-a"])),
            Arc::new(NoTransport),
        )
        .unwrap();
        (engine, store)
    }

    fn tree(root: &Path) {
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::create_dir_all(root.join("src/.git")).unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("src/a.rs"), "fn main() {}\n").unwrap();
        fs::write(root.join("src/b.rs"), "fn helper() {}\n").unwrap();
        fs::write(root.join("src/nested/c.rs"), "struct C;\n").unwrap();
        fs::write(root.join("src/.git/HEAD"), "ref: refs/heads/main\n").unwrap();
        fs::write(root.join("src/old.mgi"), "not an index").unwrap();
        fs::write(root.join("docs/readme.md"), "# docs\n").unwrap();
    }

    #[test]
    fn test_build_counts_and_shards() {
        let src = tempfile::tempdir().unwrap();
        let idx = tempfile::tempdir().unwrap();
        tree(src.path());
        let (engine, store) = engine(idx.path(), 2);

        let query = IndexQuery::new(
            "r1",
            src.path(),
            vec![PathBuf::from("src"), PathBuf::from("docs")],
        );
        let result = engine.index(&Context::background(), &query);
        assert!(result.errors.is_empty(), "{:?}", result.errors);

        let repo = result.repo.unwrap();
        assert_eq!(repo.state, RepoState::Ok);
        assert_eq!(repo.num_files, 4);
        // src, src/nested, docs
        assert_eq!(repo.num_dirs, 3);
        assert_eq!(repo.num_shards, 2);
        assert!(repo.size_index > 0);
        assert_eq!(store.get("r1").unwrap().state, RepoState::Ok);

        let total: usize = repo
            .shard_paths("mgi")
            .iter()
            .map(|p| ShardReader::open(p).unwrap().len())
            .sum();
        assert_eq!(total as u64, repo.num_files);
    }

    #[test]
    fn test_empty_dirs_rejected_without_placeholder() {
        let idx = tempfile::tempdir().unwrap();
        let (engine, store) = engine(idx.path(), 2);

        let query = IndexQuery::new("r1", "/src", vec![]);
        let result = engine.index(&Context::background(), &query);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Validation);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_existing_repo_is_reused() {
        let src = tempfile::tempdir().unwrap();
        let idx = tempfile::tempdir().unwrap();
        tree(src.path());
        let (engine, _store) = engine(idx.path(), 1);

        let query = IndexQuery::new("r1", src.path(), vec![PathBuf::from("src")]);
        let first = engine.index(&Context::background(), &query).repo.unwrap();
        fs::write(src.path().join("src/new.rs"), "fn new() {}").unwrap();
        let second = engine.index(&Context::background(), &query).repo.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_stale_local_repo_is_rebuilt_keeping_creation_time() {
        let src = tempfile::tempdir().unwrap();
        let idx = tempfile::tempdir().unwrap();
        tree(src.path());
        let (engine, store) = engine(idx.path(), 1);

        let mut old = Repo::new("r1", src.path(), Meta::default());
        old.state = RepoState::Ok;
        old.time_created = 1000;
        old.time_updated = 1000;
        store.set("r1", Some(old)).unwrap();

        let query = IndexQuery::new("r1", src.path(), vec![PathBuf::from("src")]);
        let repo = engine.index(&Context::background(), &query).repo.unwrap();
        assert_eq!(repo.num_files, 3);
        assert_eq!(repo.time_created, 1000);
        assert!(repo.time_updated > 1000);
    }

    #[test]
    fn test_remote_indexing_placeholder_cannot_backfill() {
        let idx = tempfile::tempdir().unwrap();
        let (engine, store) = engine(idx.path(), 1);

        let meta = Meta::new().with("host", "node-b");
        let mut placeholder = Repo::new("r1", "/src", meta.clone());
        placeholder.state = RepoState::Indexing;
        store.set("r1", Some(placeholder)).unwrap();

        let mut query = IndexQuery::new("r1", "/src", vec![PathBuf::from("a")]);
        query.meta = meta;
        query.recurse = true;
        let result = engine.index(&Context::background(), &query);
        assert_eq!(result.errors["r1"].kind, ErrorKind::RepoUnavailable);
        assert_eq!(store.get("r1").unwrap().state, RepoState::Indexing);
    }

    #[test]
    fn test_non_local_without_recurse_is_unresolvable() {
        let idx = tempfile::tempdir().unwrap();
        let (engine, store) = engine(idx.path(), 1);

        let mut query = IndexQuery::new("r1", "/src", vec![PathBuf::from("a")]);
        query.meta = Meta::new().with("host", "node-b");
        let result = engine.index(&Context::background(), &query);
        assert_eq!(result.errors["r1"].kind, ErrorKind::UnresolvableBackend);
        assert!(store.get("r1").is_none());
    }

    #[test]
    fn test_failed_relay_removes_placeholder() {
        let idx = tempfile::tempdir().unwrap();
        let (engine, store) = engine(idx.path(), 1);

        let mut query = IndexQuery::new("r1", "/src", vec![PathBuf::from("a")]);
        query.meta = Meta::new().with("host", "node-b");
        query.recurse = true;
        let result = engine.index(&Context::background(), &query);
        assert_eq!(result.errors["r1"].kind, ErrorKind::Transport);
        assert!(store.get("r1").is_none());
    }

    #[test]
    fn test_cancelled_context_stops_before_first_dir() {
        let src = tempfile::tempdir().unwrap();
        let idx = tempfile::tempdir().unwrap();
        tree(src.path());
        let (engine, store) = engine(idx.path(), 1);

        let ctx = Context::background();
        ctx.cancel();
        let query = IndexQuery::new("r1", src.path(), vec![PathBuf::from("src")]);
        let result = engine.index(&ctx, &query);

        assert_eq!(result.errors["r1"].kind, ErrorKind::Timeout);
        assert_eq!(result.repo.unwrap().num_files, 0);
        assert!(store.get("r1").is_none());
    }
}
