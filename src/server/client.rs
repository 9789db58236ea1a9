//! Blocking client for a node's RPC server, and the TCP transport routers
//! use to relay queries to their peers.

use crate::error::{Error, Result};
use crate::query::{FindQuery, FindResult, IndexQuery, IndexResult, SearchQuery, SearchResult};
use crate::repo::Repo;
use crate::router::NodeStatus;
use crate::server::protocol::{PublicQuery, Request, Response, read_message, write_message};
use crate::transport::Transport;
use crate::utils::Endpoint;
use std::io::{self, BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Connect timeout used when the caller gives none
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NodeClient {
    addr: String,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl NodeClient {
    /// Connect to `addr`; `io_timeout` bounds every read and write
    pub fn connect(addr: &str, io_timeout: Option<Duration>) -> Result<Self> {
        let sock_addrs = addr
            .to_socket_addrs()
            .map_err(|e| io_error(addr, e))?
            .collect::<Vec<_>>();
        let connect_timeout = io_timeout
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
            .min(DEFAULT_CONNECT_TIMEOUT)
            .max(Duration::from_millis(1));

        let mut last_err = None;
        for sock_addr in sock_addrs {
            match TcpStream::connect_timeout(&sock_addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(io_timeout).map_err(|e| io_error(addr, e))?;
                    stream.set_write_timeout(io_timeout).map_err(|e| io_error(addr, e))?;
                    let _ = stream.set_nodelay(true);
                    let reader = BufReader::new(stream.try_clone().map_err(|e| io_error(addr, e))?);
                    return Ok(Self {
                        addr: addr.to_string(),
                        reader,
                        writer: BufWriter::new(stream),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => io_error(addr, e),
            None => Error::Transport(format!("{} did not resolve to any address", addr)),
        })
    }

    /// Send one request and wait for its response
    pub fn call(&mut self, request: &Request) -> Result<Response> {
        write_message(&mut self.writer, request).map_err(|e| io_error(&self.addr, e))?;
        match read_message(&mut self.reader).map_err(|e| io_error(&self.addr, e))? {
            Response::Error(payload) => Err(Error::Remote(payload)),
            response => Ok(response),
        }
    }

    pub fn index(&mut self, query: IndexQuery) -> Result<IndexResult> {
        match self.call(&Request::Index(query))? {
            Response::Index(result) => Ok(result),
            other => Err(unexpected("Index", &other)),
        }
    }

    pub fn search(&mut self, query: SearchQuery) -> Result<SearchResult> {
        match self.call(&Request::Search(query))? {
            Response::Search(result) => Ok(result),
            other => Err(unexpected("Search", &other)),
        }
    }

    pub fn find(&mut self, query: FindQuery) -> Result<FindResult> {
        match self.call(&Request::Find(query))? {
            Response::Find(result) => Ok(result),
            other => Err(unexpected("Find", &other)),
        }
    }

    /// Submit a query as an outside caller; the node may relay it one hop
    pub fn submit(&mut self, query: PublicQuery) -> Result<Response> {
        self.call(&Request::Submit(query))
    }

    pub fn get_repo(&mut self, key: &str) -> Result<Repo> {
        match self.call(&Request::GetRepo { key: key.to_string() })? {
            Response::Repo(repo) => Ok(repo),
            other => Err(unexpected("Repo", &other)),
        }
    }

    pub fn list_repos(&mut self) -> Result<Vec<Repo>> {
        match self.call(&Request::GetAllRepos)? {
            Response::Repos(repos) => Ok(repos),
            other => Err(unexpected("Repos", &other)),
        }
    }

    pub fn delete_repo(&mut self, key: &str) -> Result<Repo> {
        match self.call(&Request::DeleteRepo { key: key.to_string() })? {
            Response::Deleted(repo) => Ok(repo),
            other => Err(unexpected("Deleted", &other)),
        }
    }

    pub fn status(&mut self) -> Result<NodeStatus> {
        match self.call(&Request::Status)? {
            Response::Status(status) => Ok(status),
            other => Err(unexpected("Status", &other)),
        }
    }

    pub fn ping(&mut self) -> Result<()> {
        match self.call(&Request::Ping)? {
            Response::Pong => Ok(()),
            other => Err(unexpected("Pong", &other)),
        }
    }

    pub fn shutdown(&mut self) -> Result<()> {
        match self.call(&Request::Shutdown)? {
            Response::ShuttingDown => Ok(()),
            other => Err(unexpected("ShuttingDown", &other)),
        }
    }
}

fn io_error(addr: &str, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            Error::Timeout(format!("{}: {}", addr, e))
        }
        _ => Error::Transport(format!("{}: {}", addr, e)),
    }
}

fn unexpected(wanted: &str, got: &Response) -> Error {
    Error::Transport(format!("expected a {} response, got {}", wanted, got.name()))
}

/// Relays queries to peers over a fresh TCP connection per query
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    fn connect(endpoint: &Endpoint, budget: Duration) -> Result<NodeClient> {
        NodeClient::connect(&endpoint.to_string(), Some(budget.max(Duration::from_millis(1))))
    }
}

impl Transport for TcpTransport {
    fn index(&self, endpoint: &Endpoint, query: &IndexQuery, budget: Duration) -> Result<IndexResult> {
        Self::connect(endpoint, budget)?.index(query.clone())
    }

    fn search(
        &self,
        endpoint: &Endpoint,
        query: &SearchQuery,
        budget: Duration,
    ) -> Result<SearchResult> {
        Self::connect(endpoint, budget)?.search(query.clone())
    }

    fn find(&self, endpoint: &Endpoint, query: &FindQuery, budget: Duration) -> Result<FindResult> {
        Self::connect(endpoint, budget)?.find(query.clone())
    }
}
