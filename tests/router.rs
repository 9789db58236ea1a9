//! Multi-node routing scenarios over an in-process transport

use meshgrep::config::Config;
use meshgrep::context::Context;
use meshgrep::error::{Error, ErrorKind, Result};
use meshgrep::query::{
    FindQuery, FindResult, IndexQuery, IndexResult, SearchQuery, SearchResult,
};
use meshgrep::repo::{Meta, RepoState, RepoStore};
use meshgrep::router::Router;
use meshgrep::transport::Transport;
use meshgrep::utils::{Endpoint, LocalHosts};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tempfile::TempDir;

/// Routes relays to routers registered by host name and counts them
#[derive(Default)]
struct Mesh {
    nodes: RwLock<HashMap<String, Weak<Router>>>,
    hops: AtomicUsize,
}

impl Mesh {
    fn register(&self, host: &str, router: &Arc<Router>) {
        self.nodes
            .write()
            .unwrap()
            .insert(host.to_string(), Arc::downgrade(router));
    }

    fn hops(&self) -> usize {
        self.hops.load(Ordering::SeqCst)
    }

    fn peer(&self, endpoint: &Endpoint) -> Result<Arc<Router>> {
        self.hops.fetch_add(1, Ordering::SeqCst);
        self.nodes
            .read()
            .unwrap()
            .get(&endpoint.host)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Transport(format!("connection refused: {}", endpoint)))
    }
}

impl Transport for Mesh {
    fn index(&self, endpoint: &Endpoint, query: &IndexQuery, budget: Duration) -> Result<IndexResult> {
        let peer = self.peer(endpoint)?;
        Ok(peer.index(&Context::background().with_timeout(budget), query))
    }

    fn search(
        &self,
        endpoint: &Endpoint,
        query: &SearchQuery,
        budget: Duration,
    ) -> Result<SearchResult> {
        let peer = self.peer(endpoint)?;
        Ok(peer.search(&Context::background().with_timeout(budget), query))
    }

    fn find(&self, endpoint: &Endpoint, query: &FindQuery, budget: Duration) -> Result<FindResult> {
        let peer = self.peer(endpoint)?;
        Ok(peer.find(&Context::background().with_timeout(budget), query))
    }
}

struct Node {
    _idx: TempDir,
    router: Arc<Router>,
}

fn node(mesh: &Arc<Mesh>, host: &str, max_remote_hosts: usize) -> Node {
    node_with(mesh, host, |config| config.max_remote_hosts = max_remote_hosts)
}

fn node_with(mesh: &Arc<Mesh>, host: &str, tweak: impl FnOnce(&mut Config)) -> Node {
    let idx = tempfile::tempdir().unwrap();
    let mut config = Config {
        index_root: Some(idx.path().to_path_buf()),
        repo_meta: Meta::new().with("host", host),
        ..Config::default()
    };
    tweak(&mut config);
    let transport: Arc<dyn Transport> = mesh.clone();
    let router = Arc::new(
        Router::with_hosts(
            Arc::new(config),
            Arc::new(RepoStore::in_memory()),
            LocalHosts::with_names([host]),
            transport,
        )
        .unwrap(),
    );
    mesh.register(host, &router);
    Node { _idx: idx, router }
}

fn source_tree() -> TempDir {
    let src = tempfile::tempdir().unwrap();
    let write = |rel: &str, body: &str| {
        let path = src.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    };
    write("alpha/a.txt", "hello world\nnothing here\n");
    write("alpha/lib.rs", "pub fn hello() {}\n");
    write("beta/b.txt", "Hello from beta\n");
    write("beta/main.rs", "fn main() { hello(); }\n");
    src
}

fn index_query(key: &str, root: &Path, dir: &str, host: &str) -> IndexQuery {
    IndexQuery {
        meta: Meta::new().with("host", host),
        recurse: true,
        ..IndexQuery::new(key, root, vec![PathBuf::from(dir)])
    }
}

/// node-a owns r1, node-b owns r2; both were indexed through node-a
fn two_nodes(max_remote_hosts: usize) -> (Arc<Mesh>, Node, Node, TempDir) {
    let mesh = Arc::new(Mesh::default());
    let a = node(&mesh, "node-a", max_remote_hosts);
    let b = node(&mesh, "node-b", max_remote_hosts);
    let src = source_tree();
    let ctx = Context::background();

    let r1 = a.router.index(&ctx, &index_query("r1", src.path(), "alpha", "node-a"));
    assert!(r1.errors.is_empty(), "{:?}", r1.errors);
    let r2 = a.router.index(&ctx, &index_query("r2", src.path(), "beta", "node-b"));
    assert!(r2.errors.is_empty(), "{:?}", r2.errors);
    (mesh, a, b, src)
}

#[test]
fn test_index_is_relayed_to_owner() {
    let (mesh, a, b, _src) = two_nodes(0);
    assert_eq!(mesh.hops(), 1);

    let on_b = b.router.get_repo("r2").unwrap();
    assert_eq!(on_b.state, RepoState::Ok);
    assert_eq!(on_b.num_files, 2);
    assert!(on_b.shard_path(0, "mgi").exists());

    let on_a = a.router.get_repo("r2").unwrap();
    assert_eq!(on_a.host(), "node-b");
    assert_eq!(on_a.num_files, 2);
    assert!(b.router.get_repo("r1").is_none());
}

#[test]
fn test_search_spans_local_and_remote_repos() {
    let (mesh, a, _b, _src) = two_nodes(0);
    let before = mesh.hops();

    let query = SearchQuery {
        ignore_case: true,
        recurse: true,
        ..SearchQuery::new("hello")
    };
    let result = a.router.search(&Context::background(), &query);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert!(result.error.is_none());
    assert_eq!(result.num_matches, 4);
    assert_eq!(result.matches["alpha/a.txt"]["r1"][&1], "hello world");
    assert_eq!(result.matches["beta/b.txt"]["r2"][&1], "Hello from beta");
    assert_eq!(mesh.hops() - before, 1);
}

#[test]
fn test_without_recurse_remote_hosts_are_unresolvable() {
    let (mesh, a, _b, _src) = two_nodes(0);
    let before = mesh.hops();

    let query = SearchQuery::new("hello").with_repos(["r1", "r2"]);
    let result = a.router.search(&Context::background(), &query);
    assert_eq!(result.num_matches, 2);
    assert_eq!(result.errors["node-b"].kind, ErrorKind::UnresolvableBackend);
    assert_eq!(mesh.hops(), before);
}

#[test]
fn test_relay_never_takes_a_second_hop() {
    let (mesh, a, b, _src) = two_nodes(0);

    // node-b believes r2 lives on node-a, so the relayed query cannot be served
    let mut misplaced = b.router.get_repo("r2").unwrap();
    misplaced.meta.insert("host", "node-a");
    b.router.store().set("r2", Some(misplaced)).unwrap();

    let before = mesh.hops();
    let query = SearchQuery {
        recurse: true,
        ..SearchQuery::new("hello").with_repos(["r2"])
    };
    let result = a.router.search(&Context::background(), &query);
    assert_eq!(mesh.hops() - before, 1);
    assert_eq!(result.num_matches, 0);
    assert_eq!(result.errors["node-a"].kind, ErrorKind::UnresolvableBackend);
}

#[test]
fn test_unreachable_host_is_a_keyed_error() {
    let (_mesh, a, _b, src) = two_nodes(0);
    let mut orphan = a.router.get_repo("r1").unwrap();
    orphan.key = "r3".to_string();
    orphan.root = src.path().to_path_buf();
    orphan.meta.insert("host", "node-c");
    a.router.store().set("r3", Some(orphan)).unwrap();

    let query = SearchQuery {
        recurse: true,
        ..SearchQuery::new("hello").with_repos(["r1", "r3"])
    };
    let result = a.router.search(&Context::background(), &query);
    assert_eq!(result.num_matches, 2);
    assert_eq!(result.errors["node-c"].kind, ErrorKind::Transport);
    assert!(result.error.is_none());
}

#[test]
fn test_remote_host_cap_skips_silently() {
    let (mesh, a, _b, src) = two_nodes(1);
    let mut orphan = a.router.get_repo("r2").unwrap();
    orphan.key = "r3".to_string();
    orphan.root = src.path().to_path_buf();
    orphan.meta.insert("host", "node-c");
    a.router.store().set("r3", Some(orphan)).unwrap();

    let before = mesh.hops();
    let query = SearchQuery {
        recurse: true,
        ..SearchQuery::new("hello").with_repos(["r2", "r3"])
    };
    let result = a.router.search(&Context::background(), &query);
    assert_eq!(mesh.hops() - before, 1);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert!(result.matches.contains_key("beta/main.rs"));
}

#[test]
fn test_find_across_nodes_with_limit() {
    let (_mesh, a, _b, _src) = two_nodes(0);
    let query = FindQuery {
        recurse: true,
        ..FindQuery::new(r"\.rs$")
    };
    let result = a.router.find(&Context::background(), &query);
    assert_eq!(result.num_matches, 2);
    assert_eq!(result.matches["alpha/lib.rs"]["r1"], 1);
    assert_eq!(result.matches["beta/main.rs"]["r2"], 1);

    let limited = FindQuery {
        max_matches: 1,
        ..query
    };
    let result = a.router.find(&Context::background(), &limited);
    assert!(result.num_matches >= 1);
    assert!(result.error.is_none());
}

#[test]
fn test_find_limit_stops_relaying() {
    const PEERS: usize = 8;
    let mesh = Arc::new(Mesh::default());
    let entry = node_with(&mesh, "node-a", |config| config.max_search_c = 1);
    let peers: Vec<Node> = (0..PEERS)
        .map(|i| node(&mesh, &format!("peer-{i}"), 0))
        .collect();
    let src = source_tree();
    for i in 0..PEERS {
        let query = index_query(&format!("p{i}"), src.path(), "alpha", &format!("peer-{i}"));
        let result = entry.router.index(&Context::background(), &query);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
    }
    let before = mesh.hops();
    assert_eq!(before, PEERS);

    let query = FindQuery {
        recurse: true,
        max_matches: 1,
        ..FindQuery::new(r"\.rs$")
    };
    let result = entry.router.find(&Context::background(), &query);
    assert!(result.num_matches >= 1);
    assert!(result.error.is_none());
    let relayed = mesh.hops() - before;
    assert!(relayed >= 1);
    assert!(relayed < PEERS, "{relayed} of {PEERS} peers were queried");
    drop(peers);
}

#[test]
fn test_meta_filter_selects_repos() {
    let (_mesh, a, _b, src) = two_nodes(0);
    let mut tagged = index_query("r4", src.path(), "alpha", "node-a");
    tagged.meta.insert("team", "search");
    let result = a.router.index(&Context::background(), &tagged);
    assert!(result.errors.is_empty());

    let query = SearchQuery {
        meta: Meta::new().with("team", "search"),
        ..SearchQuery::new("hello")
    };
    let result = a.router.search(&Context::background(), &query);
    assert_eq!(result.num_matches, 2);
    assert!(result.matches["alpha/a.txt"].contains_key("r4"));
    assert!(!result.matches["alpha/a.txt"].contains_key("r1"));
}

#[test]
fn test_index_to_unknown_host_leaves_no_placeholder() {
    let (_mesh, a, _b, src) = two_nodes(0);
    let query = index_query("r5", src.path(), "alpha", "node-z");
    let result = a.router.index(&Context::background(), &query);
    assert_eq!(result.errors["r5"].kind, ErrorKind::Transport);
    assert!(a.router.get_repo("r5").is_none());
}

#[test]
fn test_invalid_index_query_stores_nothing() {
    let (_mesh, a, _b, src) = two_nodes(0);
    let before = a.router.list_repos().len();
    let query = IndexQuery {
        dirs: vec![],
        ..index_query("r6", src.path(), "alpha", "node-a")
    };
    let result = a.router.index(&Context::background(), &query);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Validation);
    assert_eq!(a.router.list_repos().len(), before);
}
