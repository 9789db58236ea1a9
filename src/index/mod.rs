//! Sharded trigram posting index.
//!
//! - [`format`] - binary layout of a shard file
//! - [`shard`] - [`ShardWriter`] and the memory-mapped [`ShardReader`]
//! - [`planner`] - regex to [`TrigramQuery`] pre-filter
//! - [`build`] - [`IndexEngine`], which walks a tree into shards

pub mod build;
pub mod format;
pub mod planner;
pub mod shard;

pub use build::IndexEngine;
pub use planner::{TrigramQuery, plan};
pub use shard::{FileId, ShardReader, ShardWriter};
