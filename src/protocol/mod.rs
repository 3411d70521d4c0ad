//! Wire protocol: escape codec and frame codec.
//!
//! A connection reads in one framing mode and writes in one framing mode;
//! the two directions are independent. Text framing is line-oriented and
//! human readable; binary framing uses a type octet followed by fixed-width
//! big-endian fields. The protocol negotiator (see
//! `connection::negotiate`) upgrades a direction from text to binary at
//! runtime by exchanging literal text frames reserved for that purpose.

pub mod escape;
pub mod frame;

pub use escape::{escape, unescape};
pub use frame::{Frame, FrameReader, FrameWriter, WireMode, FLUSH_THRESHOLD};
