//! Lazy answers: deferred completion of an outbound call.
//!
//! With `lazy_answers` enabled, `call` returns as soon as the call frame is
//! on the wire; the returned [`LazyAnswer`] is a single-assignment cell
//! whose first observation runs the wait loop (taking read-duty exactly as
//! a blocking call would). Forcing is idempotent and thread-safe:
//! concurrent observers rendezvous on the one result, and a handler that
//! forces the answer of the very call it is serving diverges with
//! [`Error::RecursiveForce`] instead of deadlocking.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::connection::dispatch::Shared;
use crate::error::{Error, Result};
use crate::params::ParamBag;

/// Completion of an outbound call: already-delivered or deferred
#[derive(Debug)]
#[must_use = "an unobserved answer discards the call's completion"]
pub enum Answer {
    /// The wait loop already ran; `None` means the loop ended without a
    /// return frame (handler exit or the peer closed the transport)
    Ready(Option<ParamBag>),
    /// Lazy mode: force via [`Answer::wait`] (or clone the inner cell)
    Lazy(LazyAnswer),
}

impl Answer {
    /// Obtain the completion, forcing the wait loop if it has not run yet
    pub fn wait(self) -> Result<Option<ParamBag>> {
        match self {
            Answer::Ready(result) => Ok(result),
            Answer::Lazy(lazy) => lazy.wait(),
        }
    }

    /// The deferred cell, when lazy mode produced one
    pub fn lazy(self) -> Option<LazyAnswer> {
        match self {
            Answer::Ready(_) => None,
            Answer::Lazy(lazy) => Some(lazy),
        }
    }
}

enum ForceState {
    Unforced,
    Forcing(ThreadId),
    Done(std::result::Result<Option<ParamBag>, Arc<Error>>),
}

struct LazyCell {
    conn: Arc<Shared>,
    id: u32,
    state: Mutex<ForceState>,
    forced: Condvar,
}

/// Single-assignment deferred result of a lazy call
#[derive(Clone)]
pub struct LazyAnswer {
    cell: Arc<LazyCell>,
}

impl LazyAnswer {
    pub(crate) fn new(conn: Arc<Shared>, id: u32) -> Self {
        Self {
            cell: Arc::new(LazyCell {
                conn,
                id,
                state: Mutex::new(ForceState::Unforced),
                forced: Condvar::new(),
            }),
        }
    }

    /// Force the cell and return the call's completion.
    ///
    /// The first observer runs the wait loop; concurrent observers block
    /// until it finishes and then share the same outcome. If the thread
    /// currently forcing re-enters (a handler observing the answer of the
    /// call it is serving), the re-entry fails with
    /// [`Error::RecursiveForce`].
    pub fn wait(&self) -> Result<Option<ParamBag>> {
        let mut state = self.cell.state.lock().unwrap();
        loop {
            match &*state {
                ForceState::Done(result) => return share(result),
                ForceState::Forcing(owner) if *owner == thread::current().id() => {
                    return Err(Error::RecursiveForce);
                }
                ForceState::Forcing(_) => {
                    state = self.cell.forced.wait(state).unwrap();
                }
                ForceState::Unforced => {
                    *state = ForceState::Forcing(thread::current().id());
                    break;
                }
            }
        }
        drop(state);

        let outcome = match self.cell.conn.wait_for(Some(self.cell.id)) {
            Ok(result) => Ok(result),
            Err(e) => Err(Arc::new(e)),
        };
        let delivered = share(&outcome);

        let mut state = self.cell.state.lock().unwrap();
        *state = ForceState::Done(outcome);
        self.cell.forced.notify_all();
        drop(state);

        delivered
    }
}

fn share(result: &std::result::Result<Option<ParamBag>, Arc<Error>>) -> Result<Option<ParamBag>> {
    match result {
        Ok(bag) => Ok(bag.clone()),
        Err(e) => Err(e.replicate()),
    }
}

impl std::fmt::Debug for LazyAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.cell.state.lock().unwrap() {
            ForceState::Unforced => "unforced",
            ForceState::Forcing(_) => "forcing",
            ForceState::Done(_) => "done",
        };
        f.debug_struct("LazyAnswer")
            .field("id", &self.cell.id)
            .field("state", &state)
            .finish()
    }
}
