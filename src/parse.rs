//! The parser contract consumed by the response receiver (spec.md §6
//! "Consumed from parser"). The wire parsers themselves (memcached,
//! redis) are external collaborators per spec.md §1; this module only
//! names the shape the receiver (`src/proto/receiver.rs`) depends on,
//! plus the one concrete memcached parser (`src/memcached.rs`) needed
//! to exercise the response core end to end in tests.

use bytes::BytesMut;

use crate::error::Error;
use crate::message::{ErrKind, Span, Verb};

/// Outcome of feeding more bytes to a streaming parse (spec.md §6).
pub enum ParseOutcome {
    /// Not enough bytes yet; the receiver should wait for the next
    /// readable edge.
    Incomplete,
    /// A full message was assembled. `consumed` is how many bytes of
    /// the input were part of this message; any remainder is the start
    /// of the next pipelined message and is left for the next call.
    Complete(ParsedMessage),
    /// The bytes could not be interpreted as this protocol.
    Error(ErrKind),
}

/// The handful of fields a completed parse needs to stamp onto a
/// `Message` (spec.md §3): verb, key positions, and body length. The
/// receiver owns turning this into buffer contents on the `Message`
/// itself; the parser only describes what it found.
pub struct ParsedMessage {
    pub verb: Verb,
    pub keys: Vec<Span>,
    pub mlen: usize,
    pub buf: BytesMut,
}

/// A streaming, resumable parser for one wire protocol. One instance is
/// bound to a connection's `rmsg` life; `feed` may be called repeatedly
/// as more bytes arrive on the socket.
pub trait Parser {
    /// Feed newly read bytes (already appended to the running buffer)
    /// and report what was found.
    fn feed(&mut self, buf: &mut BytesMut) -> Result<ParseOutcome, Error>;
}
