//! QueryRouter: resolves the repos a query targets, fans the work out to
//! local engines and (one hop) to peer routers, and merges what comes back.
//!
//! Every query kind follows the same shape:
//!
//! 1. resolve repos from explicit keys or a metadata filter,
//! 2. partition them into local repos and remote hosts,
//! 3. run one task per local repo and one relay per remote host under a
//!    shared deadline, at most `max_search_c` at a time,
//! 4. merge results as they arrive.
//!
//! A query may leave the node it was submitted to at most once: relays are
//! sent with `recurse` cleared, and a router holding a non-local target with
//! `recurse` already cleared fails it as an unresolvable backend.

mod fanout;

pub use fanout::{Flow, Outcome, Task, fan_out};

use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, ErrorPayload, Result};
use crate::find::FindEngine;
use crate::grep::{GrepEngine, LineMatcher};
use crate::index::IndexEngine;
use crate::query::{
    FindQuery, FindResult, IndexQuery, IndexResult, RoutedQuery, RoutedResult, SearchQuery,
    SearchResult, merge_error,
};
use crate::repo::{MetaFilter, Repo, RepoState, RepoStore};
use crate::transport::Transport;
use crate::utils::{Endpoint, LocalHosts};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Local engines, shared with tasks running on pool threads
struct Engines {
    indexer: IndexEngine,
    grep: GrepEngine,
    finder: FindEngine,
}

type LocalFn<Q, R> = fn(&Engines, &Context, &Q) -> Result<R>;
type RemoteFn<Q, R> = fn(&dyn Transport, &Endpoint, &Q, Duration) -> Result<R>;

/// Snapshot reported by `Node.Status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub host: String,
    pub uptime: Duration,
    pub num_repos: usize,
    pub queries_served: u64,
}

pub struct Router {
    config: Arc<Config>,
    store: Arc<RepoStore>,
    hosts: Arc<LocalHosts>,
    transport: Arc<dyn Transport>,
    engines: Arc<Engines>,
    started: Instant,
    queries: AtomicU64,
}

impl Router {
    /// Router recognising this machine's hostname, `local_host` and the
    /// `host` in `repo_meta` as local
    pub fn new(
        config: Arc<Config>,
        store: Arc<RepoStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let aliases = [config.local_host.as_deref(), Some(config.repo_meta.host())];
        let hosts = LocalHosts::detect(aliases.into_iter().flatten());
        Self::with_hosts(config, store, hosts, transport)
    }

    pub fn with_hosts(
        config: Arc<Config>,
        store: Arc<RepoStore>,
        hosts: LocalHosts,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let hosts = Arc::new(hosts);
        let engines = Engines {
            indexer: IndexEngine::new(
                Arc::clone(&config),
                Arc::clone(&store),
                Arc::clone(&hosts),
                Arc::clone(&transport),
            )?,
            grep: GrepEngine::new(Arc::clone(&config), Arc::clone(&store)),
            finder: FindEngine::new(Arc::clone(&config), Arc::clone(&store)),
        };
        Ok(Self {
            config,
            store,
            hosts,
            transport,
            engines: Arc::new(engines),
            started: Instant::now(),
            queries: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &RepoStore {
        &self.store
    }

    /// Index (or relay, or reuse) one repo.
    ///
    /// A build is a single unit of work, so it runs on the caller's thread
    /// under the index timeout; partial counters survive a timeout.
    pub fn index(&self, ctx: &Context, query: &IndexQuery) -> IndexResult {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let timeout = query.timeout().unwrap_or(self.config.timeout_index());
        let ctx = ctx.with_timeout(timeout);
        self.engines.indexer.index(&ctx, query)
    }

    /// Content search across every resolved repo
    pub fn search(&self, ctx: &Context, query: &SearchQuery) -> SearchResult {
        let started = Instant::now();
        self.queries.fetch_add(1, Ordering::Relaxed);
        let mut result = match check_search(query) {
            Ok(()) => self.route(
                ctx,
                query,
                self.config.timeout_search(),
                0,
                |engines, ctx, q| engines.grep.search(ctx, q),
                |transport, endpoint, q, budget| transport.search(endpoint, q, budget),
            ),
            Err(e) => SearchResult::failed(e),
        };
        result.set_elapsed(started.elapsed());
        result
    }

    /// File-name search across every resolved repo, stopping early once
    /// `max_matches` is reached
    pub fn find(&self, ctx: &Context, query: &FindQuery) -> FindResult {
        let started = Instant::now();
        self.queries.fetch_add(1, Ordering::Relaxed);
        let mut result = match check_find(query) {
            Ok(()) => self.route(
                ctx,
                query,
                self.config.timeout_search(),
                query.max_matches,
                |engines, ctx, q| engines.finder.find(ctx, q),
                |transport, endpoint, q, budget| transport.find(endpoint, q, budget),
            ),
            Err(e) => FindResult::failed(e),
        };
        result.set_elapsed(started.elapsed());
        result
    }

    pub fn get_repo(&self, key: &str) -> Option<Repo> {
        self.store.get(key)
    }

    pub fn list_repos(&self) -> Vec<Repo> {
        self.store.all()
    }

    /// Drop a repo from the store; shard files of a local repo are removed too
    pub fn delete_repo(&self, key: &str) -> Result<Repo> {
        let repo = self
            .store
            .get(key)
            .ok_or_else(|| Error::NoRepoFound(key.to_string()))?;
        self.store.delete(key)?;
        if self.hosts.is_local(repo.host()) {
            for path in repo.shard_paths(&self.config.index_extension) {
                if let Err(e) = fs::remove_file(&path)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(key, path = %path.display(), error = %e, "failed to remove shard");
                }
            }
        }
        info!(key, "repo deleted");
        Ok(repo)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            host: self.config.repo_meta.host().to_string(),
            uptime: self.started.elapsed(),
            num_repos: self.store.size(),
            queries_served: self.queries.load(Ordering::Relaxed),
        }
    }

    /// Repos a search or find targets; only repos in state OK qualify
    fn resolve<Q: RoutedQuery>(&self, query: &Q) -> Result<Vec<Repo>> {
        let mut repos = Vec::new();
        if !query.repo_keys().is_empty() {
            let mut keys: Vec<&String> = query.repo_keys().iter().collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                match self.store.get(key) {
                    Some(repo) if repo.state == RepoState::Ok => repos.push(repo),
                    Some(repo) => debug!(key = %key, state = %repo.state, "repo skipped"),
                    None => debug!(key = %key, "unknown repo skipped"),
                }
            }
            return Ok(repos);
        }

        let filter = MetaFilter::new(query.meta(), query.meta_regexp_match())?;
        self.store.for_each(|_, repo| {
            if repo.state == RepoState::Ok && filter.matches(&repo.meta) {
                repos.push(repo.clone());
            }
            true
        });
        repos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(repos)
    }

    fn route<Q, R>(
        &self,
        ctx: &Context,
        query: &Q,
        default_timeout: Duration,
        max_matches: u64,
        local: LocalFn<Q, R>,
        remote: RemoteFn<Q, R>,
    ) -> R
    where
        Q: RoutedQuery,
        R: RoutedResult,
    {
        let repos = match self.resolve(query) {
            Ok(repos) if repos.is_empty() => {
                return R::failed(Error::NoRepoFound("no repo matches the query".to_string()));
            }
            Ok(repos) => repos,
            Err(e) => return R::failed(e),
        };

        let ctx = ctx.with_timeout(query.timeout().unwrap_or(default_timeout));
        let mut result = R::default();
        let mut tasks: Vec<Task<R>> = Vec::new();
        let mut remote_hosts: BTreeMap<String, Vec<Repo>> = BTreeMap::new();

        for repo in repos {
            if !self.hosts.is_local(repo.host()) {
                remote_hosts
                    .entry(repo.host().to_string())
                    .or_default()
                    .push(repo);
                continue;
            }
            let engines = Arc::clone(&self.engines);
            let mut sub = query.clone();
            sub.set_repo_keys(vec![repo.key.clone()]);
            tasks.push(Box::new(move |ctx: &Context| {
                local(&engines, ctx, &sub).unwrap_or_else(|e| keyed(&repo.key, e))
            }));
        }

        let mut relayed = 0;
        for (host, repos) in remote_hosts {
            if !query.recurse() {
                result.add_error(
                    &host,
                    Error::UnresolvableBackend(format!(
                        "{} is not local and the query may not be relayed",
                        host
                    )),
                );
                continue;
            }
            let cap = self.config.max_remote_hosts;
            if cap > 0 && relayed >= cap {
                debug!(host, cap, "remote host cap reached, host skipped");
                continue;
            }
            relayed += 1;

            let endpoint = Endpoint::from_meta(&repos[0].meta, self.config.default_rpc_port);
            let mut sub = query.clone();
            sub.set_repo_keys(repos.into_iter().map(|r| r.key).collect());
            sub.set_recurse(false);
            let transport = Arc::clone(&self.transport);
            debug!(host, %endpoint, repos = sub.repo_keys().len(), "relaying query");
            tasks.push(Box::new(move |ctx: &Context| {
                let budget = ctx.remaining().unwrap_or(default_timeout);
                sub.set_timeout(budget);
                match remote(transport.as_ref(), &endpoint, &sub, budget) {
                    Ok(mut r) => {
                        r.demote_error(&host);
                        r
                    }
                    Err(e) => {
                        warn!(host, %endpoint, error = %e, "relay failed");
                        keyed(&host, e)
                    }
                }
            }));
        }

        let outcome = fan_out(&ctx, tasks, self.config.max_search_c, |partial| {
            result.update(partial);
            if max_matches > 0 && result.num_matches() >= max_matches {
                Flow::Stop
            } else {
                Flow::Continue
            }
        });
        if let Some(err) = outcome.interrupted {
            debug!(received = outcome.received, error = %err, "merge loop interrupted");
            merge_error(result.error_mut(), Some(ErrorPayload::from(err)));
        }
        result
    }
}

fn keyed<R: RoutedResult>(key: &str, err: Error) -> R {
    let mut result = R::default();
    result.add_error(key, err);
    result
}

/// Patterns are compiled up front so a bad one fails the whole request
fn check_search(query: &SearchQuery) -> Result<()> {
    query.validate()?;
    LineMatcher::new(&query.re, query.ignore_case)?;
    if let Some(p) = query.path_re.as_deref().filter(|p| !p.is_empty()) {
        Regex::new(p).map_err(|e| Error::validation("path_re", e))?;
    }
    Ok(())
}

fn check_find(query: &FindQuery) -> Result<()> {
    query.validate()?;
    Regex::new(&query.path_re).map_err(|e| Error::validation("path_re", e))?;
    Ok(())
}
