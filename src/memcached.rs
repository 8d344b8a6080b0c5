//! A minimal memcached reply parser, just complete enough to drive the
//! response core (`src/proto/receiver.rs`) end to end in tests. Full
//! wire coverage (every command verb, binary protocol, multi-get
//! pipelining edge cases) is out of scope per spec.md §1 "request
//! parsing" / "parse reply bodies beyond what filtering requires" —
//! this only recognizes the handful of reply shapes the response path
//! needs to see: `VALUE ... END`, single-line status replies, and the
//! error replies a stray or malformed server can emit.

use bytes::{Buf, BytesMut};

use crate::error::Error;
use crate::message::{ErrKind, Span, Verb};
use crate::parse::{ParseOutcome, ParsedMessage, Parser};

const CRLF: &[u8] = b"\r\n";

/// Reply parser state for one in-progress memcached response.
#[derive(Default)]
pub struct MemcachedReplyParser;

impl MemcachedReplyParser {
    pub fn new() -> MemcachedReplyParser {
        MemcachedReplyParser
    }

    fn find_crlf(buf: &[u8]) -> Option<usize> {
        buf.windows(2).position(|w| w == CRLF)
    }
}

impl Parser for MemcachedReplyParser {
    fn feed(&mut self, buf: &mut BytesMut) -> Result<ParseOutcome, Error> {
        let Some(line_end) = Self::find_crlf(buf) else {
            return Ok(ParseOutcome::Incomplete);
        };
        let line = buf[..line_end].to_vec();

        if line.starts_with(b"VALUE ") {
            // "VALUE <key> <flags> <bytes>\r\n<data>\r\nEND\r\n"
            let parts: Vec<&[u8]> = line[b"VALUE ".len()..].split(|&b| b == b' ').collect();
            let Some(key) = parts.first() else {
                return Ok(ParseOutcome::Error(ErrKind::ParseError));
            };
            let Some(len_bytes) = parts.get(2) else {
                return Ok(ParseOutcome::Error(ErrKind::ParseError));
            };
            let Ok(len_str) = std::str::from_utf8(len_bytes) else {
                return Ok(ParseOutcome::Error(ErrKind::ParseError));
            };
            let Ok(data_len) = len_str.parse::<usize>() else {
                return Ok(ParseOutcome::Error(ErrKind::ParseError));
            };

            let data_start = line_end + CRLF.len();
            let data_end = data_start + data_len;
            let footer_end = data_end + CRLF.len();
            let end_line_end = footer_end + b"END\r\n".len();
            if buf.len() < end_line_end {
                return Ok(ParseOutcome::Incomplete);
            }
            if &buf[data_end..footer_end] != CRLF || &buf[footer_end..end_line_end] != b"END\r\n" {
                return Ok(ParseOutcome::Error(ErrKind::ParseError));
            }

            let key_start = b"VALUE ".len();
            let key_span = Span {
                start: key_start,
                end: key_start + key.len(),
            };
            let mut out = BytesMut::new();
            out.extend_from_slice(&buf[..end_line_end]);
            buf.advance(end_line_end);

            Ok(ParseOutcome::Complete(ParsedMessage {
                verb: Verb::Get,
                keys: vec![key_span],
                mlen: end_line_end,
                buf: out,
            }))
        } else if line == b"END" {
            // A GET with no matching value: empty reply, still a
            // complete message (spec.md §4.4.1 "Empty reply").
            let total = line_end + CRLF.len();
            let mut out = BytesMut::new();
            out.extend_from_slice(&buf[..total]);
            buf.advance(total);
            Ok(ParseOutcome::Complete(ParsedMessage {
                verb: Verb::Get,
                keys: vec![],
                mlen: 0,
                buf: out,
            }))
        } else if line.starts_with(b"SERVER_ERROR") || line.starts_with(b"CLIENT_ERROR") {
            let total = line_end + CRLF.len();
            let mut out = BytesMut::new();
            out.extend_from_slice(&buf[..total]);
            buf.advance(total);
            Ok(ParseOutcome::Complete(ParsedMessage {
                verb: Verb::Other,
                keys: vec![],
                mlen: total,
                buf: out,
            }))
        } else if line == b"STORED"
            || line == b"NOT_STORED"
            || line == b"DELETED"
            || line == b"NOT_FOUND"
        {
            let total = line_end + CRLF.len();
            let mut out = BytesMut::new();
            out.extend_from_slice(&buf[..total]);
            buf.advance(total);
            let verb = if line == b"DELETED" || line == b"NOT_FOUND" {
                Verb::Delete
            } else {
                Verb::Set
            };
            Ok(ParseOutcome::Complete(ParsedMessage {
                verb,
                keys: vec![],
                mlen: total,
                buf: out,
            }))
        } else {
            Ok(ParseOutcome::Error(ErrKind::ParseError))
        }
    }
}
