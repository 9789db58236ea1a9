//! Wire messages exchanged between nodes and with the CLI
//!
//! Uses a simple length-prefixed JSON protocol:
//! - 4 bytes (little-endian u32): message length
//! - N bytes: JSON-encoded message
//!
//! RPC methods carry whatever `recurse` the caller set; peers relaying a
//! query clear it. `Public.Submit` is the entry point for queries coming
//! from outside the mesh and always sets it.

use crate::error::{Error, ErrorPayload, Result};
use crate::query::{FindQuery, FindResult, IndexQuery, IndexResult, SearchQuery, SearchResult};
use crate::repo::Repo;
use crate::router::NodeStatus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Frames larger than this are rejected before allocating
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    #[serde(rename = "Indexer.Index")]
    Index(IndexQuery),

    #[serde(rename = "Searcher.Search")]
    Search(SearchQuery),

    #[serde(rename = "Finder.Find")]
    Find(FindQuery),

    #[serde(rename = "Repos.Get")]
    GetRepo { key: String },

    #[serde(rename = "Repos.GetAll")]
    GetAllRepos,

    #[serde(rename = "Repos.Delete")]
    DeleteRepo { key: String },

    #[serde(rename = "Node.Status")]
    Status,

    #[serde(rename = "Node.Ping")]
    Ping,

    #[serde(rename = "Node.Shutdown")]
    Shutdown,

    /// A query submitted from outside the mesh
    #[serde(rename = "Public.Submit")]
    Submit(PublicQuery),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "query", rename_all = "snake_case")]
pub enum PublicQuery {
    Index(IndexQuery),
    Search(SearchQuery),
    Find(FindQuery),
}

impl PublicQuery {
    /// The RPC request this submission becomes, allowed one relay hop
    pub fn into_request(self) -> Request {
        match self {
            PublicQuery::Index(mut q) => {
                q.recurse = true;
                Request::Index(q)
            }
            PublicQuery::Search(mut q) => {
                q.recurse = true;
                Request::Search(q)
            }
            PublicQuery::Find(mut q) => {
                q.recurse = true;
                Request::Find(q)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Response {
    Index(IndexResult),
    Search(SearchResult),
    Find(FindResult),
    Repo(Repo),
    Repos(Vec<Repo>),
    Deleted(Repo),
    Status(NodeStatus),
    Pong,
    ShuttingDown,
    /// The request could not be served at all
    Error(ErrorPayload),
}

impl Response {
    /// Short name used in log lines and client errors
    pub fn name(&self) -> &'static str {
        match self {
            Response::Index(_) => "Index",
            Response::Search(_) => "Search",
            Response::Find(_) => "Find",
            Response::Repo(_) => "Repo",
            Response::Repos(_) => "Repos",
            Response::Deleted(_) => "Deleted",
            Response::Status(_) => "Status",
            Response::Pong => "Pong",
            Response::ShuttingDown => "ShuttingDown",
            Response::Error(_) => "Error",
        }
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::validation("body", e))
}

/// Decode an externally submitted index query; `recurse` is always set
pub fn decode_public_index(body: &[u8]) -> Result<IndexQuery> {
    let mut query: IndexQuery = decode(body)?;
    query.recurse = true;
    Ok(query)
}

/// Decode an externally submitted search query; `recurse` is always set
pub fn decode_public_search(body: &[u8]) -> Result<SearchQuery> {
    let mut query: SearchQuery = decode(body)?;
    query.recurse = true;
    Ok(query)
}

/// Decode an externally submitted find query; `recurse` is always set
pub fn decode_public_find(body: &[u8]) -> Result<FindQuery> {
    let mut query: FindQuery = decode(body)?;
    query.recurse = true;
    Ok(query)
}

/// Write a message to a stream with length prefix
pub fn write_message<W: Write>(writer: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let json = serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|&len| len as usize <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "message too large"))?;

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&json)?;
    writer.flush()
}

/// Read one length-prefixed frame.
///
/// An oversized frame fails with `FileTooLarge` and leaves its body unread,
/// so the stream is no longer aligned on a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(io::ErrorKind::FileTooLarge, "message too large"));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn decode_message<T: DeserializeOwned>(frame: &[u8]) -> io::Result<T> {
    serde_json::from_slice(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read a message from a stream with length prefix
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<T> {
    decode_message(&read_frame(reader)?)
}
