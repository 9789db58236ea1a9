//! # meshgrep - distributed trigram code search
//!
//! Every node indexes the source trees it owns into sharded trigram
//! indexes and answers content (`search`) and file-name (`find`) queries
//! over them. Any node accepts any query: repos owned by other hosts are
//! reached by relaying the query, at most one hop, to the owning node.
//!
//! ## Architecture
//!
//! - [`router`] - resolves target repos, fans out locally and to peers, merges
//! - [`index`] - shard format, trigram query planner, index builder
//! - [`grep`] - content search over one repo with a streaming line matcher
//! - [`find`] - file-name search over shard file tables
//! - [`repo`] - repo records, metadata filters and the repo store
//! - [`query`] - query and result payloads and their merge rules
//! - [`server`] - TCP RPC server, client and peer transport
//! - [`output`] - terminal rendering (ripgrep-like)
//!
//! ## Quick Start
//!
//! ```ignore
//! use meshgrep::config::Config;
//! use meshgrep::context::Context;
//! use meshgrep::query::{IndexQuery, SearchQuery};
//! use meshgrep::repo::RepoStore;
//! use meshgrep::router::Router;
//! use meshgrep::transport::NoTransport;
//! use std::sync::Arc;
//!
//! let router = Router::new(
//!     Arc::new(Config::default()),
//!     Arc::new(RepoStore::in_memory()),
//!     Arc::new(NoTransport),
//! )?;
//! let ctx = Context::background();
//! router.index(&ctx, &IndexQuery::new("app", "/src/app", vec![".".into()]));
//!
//! let result = router.search(&ctx, &SearchQuery::new("fn main").with_repos(["app"]));
//! for (file, repos) in &result.matches {
//!     println!("{file}: {repos:?}");
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod find;
pub mod grep;
pub mod index;
pub mod output;
pub mod query;
pub mod repo;
pub mod router;
pub mod server;
pub mod transport;
pub mod utils;

pub use error::{Error, ErrorKind, ErrorPayload, Result};
