//! Crosswire - symmetric bidirectional RPC over a pair of byte streams
//!
//! This crate implements a minimalistic RPC connection engine that
//! multiplexes calls, returns, and nested call-backs over any ordered,
//! reliable duplex transport: a pipe pair, a TCP or TLS socket, subprocess
//! handles. A call carries a function name and a string-to-string
//! parameter bag; a response carries a parameter bag. Either peer may
//! initiate calls at any time, and a handler may issue further calls or
//! call-backs while suspended waiting for its own answer.
//!
//! The engine owns no threads. Reading from the transport is done
//! cooperatively by whichever caller currently holds the read lock, so
//! there is never a hidden thread to join on shutdown. Frames travel in a
//! line-oriented text framing by default; a runtime handshake can upgrade
//! either direction to a length-prefixed binary framing.
//!
//! ## Example
//!
//! ```no_run
//! use crosswire::{Connection, ConnectionConfig, HandlerAction, ParamBag};
//! use std::net::TcpStream;
//!
//! # fn main() -> crosswire::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:9000")?;
//! let conn = Connection::over_tcp(stream, ConnectionConfig::default())?;
//!
//! // One thread serves inbound calls...
//! let server = conn.clone();
//! std::thread::spawn(move || {
//!     server.serve(|call| HandlerAction::Reply(call.take_params()))
//! });
//!
//! // ...while this one issues its own.
//! let mut params = ParamBag::new();
//! params.insert("payload", "hello");
//! let reply = conn.call("echo", params)?.wait()?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod connection;
pub mod error;
pub mod lazy;
pub mod params;
pub mod protocol;

pub use call::Call;
pub use connection::{Connection, ConnectionConfig, HandlerAction, ProtocolMode};
pub use error::{Error, Result};
pub use lazy::{Answer, LazyAnswer};
pub use params::ParamBag;
pub use protocol::frame::WireMode;
