//! Connection: the public surface of the RPC engine.
//!
//! A connection owns one reader stream and one writer stream of any
//! ordered, reliable duplex transport and multiplexes calls, returns, and
//! nested call-backs over them. The engine is fully symmetric: there is no
//! client or server role, either peer may initiate calls at any time, and
//! any handler may issue further calls while suspended waiting for its own
//! answer. All work happens on caller threads; see `dispatch` for the
//! cooperative reader discipline.

pub(crate) mod dispatch;
pub(crate) mod negotiate;

use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use rand::Rng;

use crate::call::Call;
use crate::error::Result;
use crate::lazy::Answer;
use crate::params::ParamBag;
use crate::protocol::frame::{FrameReader, FrameWriter, WireMode};

use dispatch::{ReadHalf, Shared, SlotHandler};

/// Outbound framing selection and handshake behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolMode {
    /// Write text frames; send no handshake
    #[default]
    Text,
    /// Write binary frames immediately; announce with the unacknowledged
    /// upgrade request (the peer is known to be binary-capable)
    Binary,
    /// Probe with the acknowledged upgrade request on the first call and
    /// fall back to text unless the peer answers `{O: K}`
    PreferBinary,
    /// Write text frames and ignore inbound handshake literals (models a
    /// legacy peer)
    OnlyText,
}

/// Options recognized at connection construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionConfig {
    /// When set, `call` returns a deferred [`Answer::Lazy`] instead of
    /// blocking for the completion
    pub lazy_answers: bool,
    /// Outbound framing per [`ProtocolMode`]
    pub protocol: ProtocolMode,
}

/// What a handler decided about the call it was given
#[derive(Debug)]
pub enum HandlerAction {
    /// Answer the call with this bag and keep serving
    Reply(ParamBag),
    /// Answer the call, then leave the enclosing wait loop
    ReplyAndExit(ParamBag),
    /// The handler answered (or deliberately declined to); keep serving
    Continue,
    /// Leave the enclosing wait loop without answering
    Exit,
}

/// One end of a symmetric RPC connection.
///
/// Cheap to clone; clones share the underlying streams and dispatch state,
/// so a connection can be handed to any number of calling threads.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection over a reader/writer pair with default options
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Result<Self> {
        Self::with_config(reader, writer, ConnectionConfig::default())
    }

    /// Create a connection over a reader/writer pair.
    ///
    /// With [`ProtocolMode::Binary`] the upgrade announcement is emitted
    /// here, before the constructor returns.
    pub fn with_config(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let write_mode = match config.protocol {
            ProtocolMode::Binary => WireMode::Binary,
            _ => WireMode::Text,
        };
        let initial_id = rand::thread_rng().gen_range(1..=1000);
        let shared = Arc::new(Shared {
            config,
            read: Mutex::new(ReadHalf {
                frames: FrameReader::new(
                    BufReader::new(Box::new(reader) as Box<dyn Read + Send>),
                    WireMode::Text,
                ),
                partial: ParamBag::new(),
            }),
            write: Mutex::new(FrameWriter::new(
                Box::new(writer) as Box<dyn Write + Send>,
                write_mode,
            )),
            state: Mutex::new(dispatch::DispatchState::default()),
            completed: Condvar::new(),
            ids: Mutex::new(initial_id),
            negotiation: Mutex::new(match config.protocol {
                ProtocolMode::PreferBinary => negotiate::Negotiation::Pending,
                _ => negotiate::Negotiation::NotRequested,
            }),
            negotiated: Condvar::new(),
            read_is_binary: AtomicBool::new(false),
            write_is_binary: AtomicBool::new(write_mode == WireMode::Binary),
        });
        if shared.config.protocol == ProtocolMode::Binary {
            shared.transmit_literal(negotiate::UPGRADE)?;
        }
        Ok(Connection { shared })
    }

    /// Create a connection over a TCP stream, splitting it with
    /// `try_clone` and disabling Nagle's algorithm to keep small RPCs
    /// prompt
    pub fn over_tcp(stream: TcpStream, config: ConnectionConfig) -> Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        Self::with_config(reader, stream, config)
    }

    /// Invoke `func` on the peer and wait for its answer.
    ///
    /// Call-backs the peer addresses to this call cannot be taken (no
    /// handler was supplied); if one arrives, the engine reports this call
    /// site in the resulting error. With `lazy_answers` the returned
    /// [`Answer`] is deferred and this method does not block.
    #[track_caller]
    pub fn call(&self, func: &str, params: ParamBag) -> Result<Answer> {
        let issued_at = Location::caller().to_string();
        self.shared
            .initiate(func.as_bytes(), &params, SlotHandler::Absent { issued_at }, None)
    }

    /// Invoke `func` on the peer; `handler` takes any call-backs the peer
    /// addresses to this call, running in the calling thread
    pub fn call_with_handler<F>(&self, func: &str, params: ParamBag, handler: F) -> Result<Answer>
    where
        F: Fn(&mut Call) -> HandlerAction + Send + Sync + 'static,
    {
        self.shared
            .initiate(func.as_bytes(), &params, SlotHandler::Fn(Arc::new(handler)), None)
    }

    /// Register the anonymous receiver and serve inbound calls until the
    /// handler signals exit or the peer closes the transport.
    ///
    /// Registering a new anonymous receiver replaces any previous one.
    pub fn serve<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&mut Call) -> HandlerAction + Send + Sync + 'static,
    {
        self.shared
            .register_receiver(None, SlotHandler::Fn(Arc::new(handler)));
        self.shared.wait_for(None).map(|_| ())
    }

    /// Stop accepting reads: the next read attempt on any caller fails
    /// with [`crate::Error::Detached`]. The underlying streams are not
    /// touched, and a read already blocking is not interrupted; close the
    /// transport to abort it.
    pub fn detach(&self) {
        self.shared.detach();
    }

    /// Framing mode of the inbound direction
    pub fn read_mode(&self) -> WireMode {
        if self.shared.read_is_binary.load(Ordering::Acquire) {
            WireMode::Binary
        } else {
            WireMode::Text
        }
    }

    /// Framing mode of the outbound direction
    pub fn write_mode(&self) -> WireMode {
        if self.shared.write_is_binary.load(Ordering::Acquire) {
            WireMode::Binary
        } else {
            WireMode::Text
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("read_mode", &self.read_mode())
            .field("write_mode", &self.write_mode())
            .finish_non_exhaustive()
    }
}
