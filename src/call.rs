//! Inbound call context.
//!
//! A [`Call`] is created when an inbound call frame is parsed and handed to
//! whichever handler it is addressed to. It carries the decoded function
//! name, the parameter bag that preceded the frame, and the caller's id,
//! and it exposes the two operations a handler may perform: set the answer
//! (at most once) and issue further call-backs while still unanswered.

use std::panic::Location;
use std::sync::{Arc, Weak};

use crate::connection::dispatch::{Shared, SlotHandler};
use crate::connection::HandlerAction;
use crate::error::{Error, Result};
use crate::lazy::Answer;
use crate::params::ParamBag;

/// One inbound call, as seen by the handler processing it
pub struct Call {
    conn: Weak<Shared>,
    func: String,
    params: ParamBag,
    id: Option<u32>,
    answered: bool,
}

impl Call {
    pub(crate) fn new(conn: Weak<Shared>, func: String, params: ParamBag, id: Option<u32>) -> Self {
        Self {
            conn,
            func,
            params,
            id,
            answered: false,
        }
    }

    /// The function name the peer invoked
    pub fn func(&self) -> &str {
        &self.func
    }

    /// Parameters carried by the call
    pub fn params(&self) -> &ParamBag {
        &self.params
    }

    /// Move the parameters out of the call (they are replaced by an empty
    /// bag). Convenient for echo-style handlers.
    pub fn take_params(&mut self) -> ParamBag {
        std::mem::take(&mut self.params)
    }

    /// Id the peer assigned to this call, if any
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// True once the answer has been sent
    pub fn answered(&self) -> bool {
        self.answered
    }

    /// Transmit the return frame for this call.
    ///
    /// May be invoked at most once; a second attempt fails with
    /// [`Error::DoubleAnswer`]. A call received without an id is answered
    /// with an anonymous return frame.
    pub fn answer(&mut self, params: ParamBag) -> Result<()> {
        if self.answered {
            return Err(Error::DoubleAnswer);
        }
        let conn = self.connection()?;
        conn.transmit_return(self.id, &params)?;
        self.answered = true;
        Ok(())
    }

    /// Issue a call addressed back to this call's originator, so the
    /// peer's handler for it runs in the thread that is waiting on this
    /// call. Forbidden once the answer has been sent.
    #[track_caller]
    pub fn call_back(&mut self, func: &str, params: ParamBag) -> Result<Answer> {
        let issued_at = Location::caller().to_string();
        self.initiate_back(func, params, SlotHandler::Absent { issued_at })
    }

    /// Like [`Call::call_back`], with a handler for call-backs that target
    /// the new call in turn
    pub fn call_back_with_handler<F>(
        &mut self,
        func: &str,
        params: ParamBag,
        handler: F,
    ) -> Result<Answer>
    where
        F: Fn(&mut Call) -> HandlerAction + Send + Sync + 'static,
    {
        self.initiate_back(func, params, SlotHandler::Fn(Arc::new(handler)))
    }

    fn initiate_back(
        &mut self,
        func: &str,
        params: ParamBag,
        handler: SlotHandler,
    ) -> Result<Answer> {
        if self.answered {
            return Err(Error::CallAlreadyReturned);
        }
        let conn = self.connection()?;
        conn.initiate(func.as_bytes(), &params, handler, self.id)
    }

    fn connection(&self) -> Result<Arc<Shared>> {
        self.conn.upgrade().ok_or(Error::Detached)
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("func", &self.func)
            .field("id", &self.id)
            .field("params", &self.params)
            .field("answered", &self.answered)
            .finish()
    }
}
