//! Error taxonomy for the connection engine.
//!
//! One enum covers the whole engine: wire-level parse failures, dispatch
//! failures (a call arrived that nobody can take), call-context misuse
//! (double answer, call-back after answering), and transport I/O. Errors
//! observed while a thread holds read-duty are re-raised to whichever
//! caller the dispatcher was working for, so `replicate` produces an
//! equivalent error for every waiter that has to see the same failure.

use std::io;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An inbound byte sequence matched no frame shape
    #[error("invalid frame on the wire: {0}")]
    InvalidResponse(String),

    /// A call arrived and no anonymous receiver is registered
    #[error("no callback defined for `{func}`")]
    NoCallbackDefined { func: String },

    /// A call-back targeted an outbound call that has already completed
    #[error("callback `{func}` targets call {recv_id}, which already returned")]
    CallReturned { func: String, recv_id: u32 },

    /// A call-back targeted an outbound call that was issued without a handler
    #[error("callback `{func}` arrived for the call issued at {issued_at}, which supplied no handler")]
    NoHandler { func: String, issued_at: String },

    /// A call's answer was set more than once
    #[error("answer already sent for this call")]
    DoubleAnswer,

    /// A call-back was issued on a call whose answer is already sent
    #[error("cannot call back: this call already returned its answer")]
    CallAlreadyReturned,

    /// A read was attempted after `detach`, or the connection is gone
    #[error("connection detached")]
    Detached,

    /// A lazy answer was forced from inside its own wait loop
    #[error("lazy answer forced from inside its own wait loop")]
    RecursiveForce,

    /// Transport failure
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build an equivalent error for delivery to an additional waiter.
    ///
    /// `io::Error` is not `Clone`, so a fanned-out copy carries the same
    /// kind and message rather than the original value.
    pub(crate) fn replicate(&self) -> Error {
        match self {
            Error::InvalidResponse(what) => Error::InvalidResponse(what.clone()),
            Error::NoCallbackDefined { func } => Error::NoCallbackDefined { func: func.clone() },
            Error::CallReturned { func, recv_id } => Error::CallReturned {
                func: func.clone(),
                recv_id: *recv_id,
            },
            Error::NoHandler { func, issued_at } => Error::NoHandler {
                func: func.clone(),
                issued_at: issued_at.clone(),
            },
            Error::DoubleAnswer => Error::DoubleAnswer,
            Error::CallAlreadyReturned => Error::CallAlreadyReturned,
            Error::Detached => Error::Detached,
            Error::RecursiveForce => Error::RecursiveForce,
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }

    /// True when the error means the peer went away rather than that the
    /// stream carried garbage. Waiters observe these as a clean shutdown.
    pub(crate) fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        )
    }
}
