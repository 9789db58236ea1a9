//! Node RPC server
//!
//! Serves one router over TCP, one thread per connection. Every query runs
//! under the server's root context, so shutting down cancels queries still
//! in flight.

use crate::context::Context;
use crate::error::Error;
use crate::router::Router;
use crate::server::protocol::{Request, Response, decode_message, read_frame, write_message};
use anyhow::{Context as _, Result};
use std::io::{self, BufReader, BufWriter};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Idle time after which a connection is dropped
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct NodeServer {
    router: Arc<Router>,
    listener: TcpListener,
    addr: SocketAddr,
    ctx: Context,
    shutdown: AtomicBool,
}

impl NodeServer {
    pub fn bind(router: Arc<Router>, addr: &str) -> Result<Arc<Self>> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind to {}", addr))?;
        let addr = listener.local_addr()?;
        Ok(Arc::new(Self {
            router,
            listener,
            addr,
            ctx: Context::background(),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept connections until shut down (blocking)
    pub fn run(self: &Arc<Self>) -> Result<()> {
        info!(addr = %self.addr, "listening");

        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            match stream {
                Ok(stream) => {
                    let _ = stream.set_read_timeout(Some(IDLE_TIMEOUT));
                    let _ = stream.set_nodelay(true);
                    let server = Arc::clone(self);
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            warn!(error = %e, "connection error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }

        info!(addr = %self.addr, "stopped");
        Ok(())
    }

    /// Stop accepting, cancel running queries and wake the accept loop
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        self.ctx.cancel();
        let mut wake = self.addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(match wake {
                SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            });
        }
        if let Err(e) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            debug!(error = %e, "failed to wake accept loop");
        }
    }

    fn handle_connection(&self, stream: TcpStream) -> io::Result<()> {
        let peer = stream.peer_addr().ok();
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        loop {
            let frame = match read_frame(&mut reader) {
                Ok(frame) => frame,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::UnexpectedEof
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                    ) =>
                {
                    break;
                }
                // the body is left unread, so the stream cannot be resynced
                Err(e) if e.kind() == io::ErrorKind::FileTooLarge => {
                    let err = Error::validation("request", e);
                    write_message(&mut writer, &Response::Error(err.payload()))?;
                    break;
                }
                Err(e) => return Err(e),
            };
            let request: Request = match decode_message(&frame) {
                Ok(req) => req,
                Err(e) => {
                    let err = Error::validation("request", e);
                    write_message(&mut writer, &Response::Error(err.payload()))?;
                    continue;
                }
            };

            debug!(?peer, ?request, "request");
            let response = self.handle_request(request);
            write_message(&mut writer, &response)?;

            if matches!(response, Response::ShuttingDown) {
                self.shutdown();
                break;
            }
        }

        Ok(())
    }

    pub fn handle_request(&self, request: Request) -> Response {
        let router = &self.router;
        match request {
            Request::Index(q) => Response::Index(router.index(&self.ctx, &q)),
            Request::Search(q) => Response::Search(router.search(&self.ctx, &q)),
            Request::Find(q) => Response::Find(router.find(&self.ctx, &q)),
            Request::Submit(public) => self.handle_request(public.into_request()),

            Request::GetRepo { key } => match router.get_repo(&key) {
                Some(repo) => Response::Repo(repo),
                None => Response::Error(Error::NoRepoFound(key).payload()),
            },
            Request::GetAllRepos => Response::Repos(router.list_repos()),
            Request::DeleteRepo { key } => match router.delete_repo(&key) {
                Ok(repo) => Response::Deleted(repo),
                Err(e) => Response::Error(e.payload()),
            },

            Request::Status => Response::Status(router.status()),
            Request::Ping => Response::Pong,
            Request::Shutdown => Response::ShuttingDown,
        }
    }
}
