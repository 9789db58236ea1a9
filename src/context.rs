//! Cancellable, deadline-bound context threaded through every query.
//!
//! A context is cheap to clone; clones share cancellation. Child contexts
//! created with [`Context::with_timeout`] or [`Context::with_cancel`] are
//! cancelled when their parent is, never the other way round.
//!
//! Work checks the context at cooperative checkpoints only (per top-level
//! directory while indexing, per candidate file while grepping, per shard
//! and per thousand names while finding). Blocked I/O is never interrupted.

use crate::error::Error;
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Why a context finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    Cancelled,
    DeadlineExceeded,
}

impl Done {
    pub fn into_error(self) -> Error {
        match self {
            Done::Cancelled => Error::Timeout("query cancelled".to_string()),
            Done::DeadlineExceeded => Error::Timeout("deadline exceeded".to_string()),
        }
    }
}

struct State {
    reason: Option<Done>,
    /// Dropped on cancel, which disconnects every `done()` receiver
    done_tx: Option<Sender<()>>,
    children: Vec<Weak<Inner>>,
}

struct Inner {
    deadline: Option<Instant>,
    done_rx: Receiver<()>,
    state: Mutex<State>,
}

impl Inner {
    fn new(deadline: Option<Instant>) -> Arc<Self> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(0);
        Arc::new(Self {
            deadline,
            done_rx,
            state: Mutex::new(State {
                reason: None,
                done_tx: Some(done_tx),
                children: Vec::new(),
            }),
        })
    }

    fn cancel(&self, reason: Done) {
        let children = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason);
            state.done_tx.take();
            std::mem::take(&mut state.children)
        };

        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel(reason);
            }
        }
    }
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// A root context that never expires on its own
    pub fn background() -> Self {
        Self {
            inner: Inner::new(None),
        }
    }

    /// Child context whose deadline is the earlier of the parent's and `now + timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now().checked_add(timeout);
        let deadline = match (self.inner.deadline, candidate) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        self.child(deadline)
    }

    /// Child context sharing the parent's deadline but cancellable on its own
    pub fn with_cancel(&self) -> Self {
        self.child(self.inner.deadline)
    }

    fn child(&self, deadline: Option<Instant>) -> Self {
        let inner = Inner::new(deadline);
        let inherited = {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.children.retain(|c| c.strong_count() > 0);
            match state.reason {
                Some(reason) => Some(reason),
                None => {
                    state.children.push(Arc::downgrade(&inner));
                    None
                }
            }
        };
        if let Some(reason) = inherited {
            inner.cancel(reason);
        }
        Self { inner }
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.inner.cancel(Done::Cancelled);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline, `None` if there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Receiver that disconnects once the context is explicitly cancelled.
    ///
    /// Deadline expiry does not close it; select on [`Context::deadline`]
    /// as well.
    pub fn done(&self) -> Receiver<()> {
        self.inner.done_rx.clone()
    }

    /// Why the context finished, if it has
    pub fn reason(&self) -> Option<Done> {
        let reason = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reason;
        if reason.is_some() {
            return reason;
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Done::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.reason().is_some()
    }

    /// `Err` if the context finished, for use with `?` at checkpoints
    pub fn check(&self) -> Result<(), Error> {
        match self.reason() {
            Some(done) => Err(done.into_error()),
            None => Ok(()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("reason", &self.reason())
            .finish()
    }
}
