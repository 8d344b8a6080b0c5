//! Response Receiver (spec component C3, spec.md §4.3).
//!
//! Allocates or resumes a server connection's `rmsg`, feeds it newly
//! read bytes, and hands completed replies off to the caller (which
//! runs the filter/forwarder, §4.4) one at a time, in the order the
//! parser assembled them — a single readable edge can carry several
//! pipelined replies.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;
use tracing::warn;

use crate::connection::Connection;
use crate::error::{Error, Kind};
use crate::message::{MessagePool, MessageRef};
use crate::parse::{ParseOutcome, Parser};

/// Step 1 of spec.md §4.3: a server connection's read half reported
/// EOF. If a reply was mid-flight, the server cut us off — log and
/// release it; the connection is fatal either way (spec.md §7
/// `server_eof`), but releasing the partial message is this module's
/// job, not the caller's.
pub fn on_eof(conn: &Rc<RefCell<Connection>>, pool: &mut MessagePool) {
    conn.borrow_mut().eof = true;
    let rmsg = conn.borrow_mut().rmsg.take();
    if let Some(msg) = rmsg {
        warn!(
            server_id = conn.borrow().id,
            msg_id = msg.borrow().id,
            "server closed connection mid-reply"
        );
        pool.release(&msg);
    }
    let mut c = conn.borrow_mut();
    c.err = Some(crate::message::ErrKind::ServerError);
    c.done = true;
}

/// Steps 2-4 of spec.md §4.3: consume `data` (already read off the
/// socket) against the connection's current or freshly allocated
/// `rmsg`, invoking `on_complete` for every fully parsed reply,
/// including pipelined ones found within the same call. Installs
/// whatever's left as the new `rmsg` so the next readable edge resumes
/// parsing where this one left off.
///
/// Allocation failure (spec.md §7 `alloc_fail`) is non-fatal: the
/// connection is left exactly as it was and the caller should retry
/// on the next readable edge.
pub fn on_readable(
    conn: &Rc<RefCell<Connection>>,
    pool: &mut MessagePool,
    parser: &mut dyn Parser,
    data: &[u8],
    mut on_complete: impl FnMut(MessageRef),
) -> Result<(), Error> {
    let mut pending = BytesMut::from(data);

    loop {
        let rmsg = match conn.borrow().rmsg.clone() {
            Some(m) => m,
            None => {
                if pending.is_empty() {
                    break;
                }
                let m = pool.new_response(conn)?;
                conn.borrow_mut().rmsg = Some(m.clone());
                m
            }
        };

        {
            let mut m = rmsg.borrow_mut();
            m.buf.extend_from_slice(&pending);
        }
        pending.clear();

        let outcome = {
            let mut m = rmsg.borrow_mut();
            parser.feed(&mut m.buf)?
        };

        match outcome {
            ParseOutcome::Incomplete => break,
            ParseOutcome::Error(err_kind) => {
                let mut c = conn.borrow_mut();
                c.err = Some(err_kind);
                c.done = true;
                c.rmsg = None;
                drop(c);
                pool.release(&rmsg);
                return Err(Error::new(Kind::ParseError));
            }
            ParseOutcome::Complete(parsed) => {
                // The parser already advanced the consumed bytes out
                // of `rmsg.buf`, leaving only a pipelined tail (if
                // any) behind — that tail becomes the next `rmsg`'s
                // opening bytes.
                let leftover = std::mem::take(&mut rmsg.borrow_mut().buf);
                {
                    let mut m = rmsg.borrow_mut();
                    m.verb = parsed.verb;
                    m.keys = parsed.keys;
                    m.mlen = parsed.mlen;
                    m.buf = parsed.buf;
                }
                conn.borrow_mut().rmsg = None;
                on_complete(rmsg);
                pending = leftover;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Protocol, Role};
    use crate::memcached::MemcachedReplyParser;
    use std::net::SocketAddr;

    fn server_conn() -> Rc<RefCell<Connection>> {
        let addr: SocketAddr = "127.0.0.1:11211".parse().unwrap();
        Rc::new(RefCell::new(Connection::new(1, Role::Server, Protocol::Memcached, addr)))
    }

    #[test]
    fn assembles_one_reply_from_one_chunk() {
        let conn = server_conn();
        let mut pool = MessagePool::new(16);
        let mut parser = MemcachedReplyParser::new();
        let mut completed = Vec::new();
        on_readable(
            &conn,
            &mut pool,
            &mut parser,
            b"VALUE foo 0 3\r\nbar\r\nEND\r\n",
            |m| completed.push(m),
        )
        .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].borrow().mlen, "VALUE foo 0 3\r\nbar\r\nEND\r\n".len());
        assert!(conn.borrow().rmsg.is_none());
    }

    #[test]
    fn resumes_across_two_chunks() {
        let conn = server_conn();
        let mut pool = MessagePool::new(16);
        let mut parser = MemcachedReplyParser::new();
        let mut completed = Vec::new();
        on_readable(&conn, &mut pool, &mut parser, b"VALUE foo 0 3\r\nba", |m| {
            completed.push(m)
        })
        .unwrap();
        assert!(completed.is_empty());
        assert!(conn.borrow().rmsg.is_some());

        on_readable(&conn, &mut pool, &mut parser, b"r\r\nEND\r\n", |m| completed.push(m)).unwrap();
        assert_eq!(completed.len(), 1);
        assert!(conn.borrow().rmsg.is_none());
    }

    #[test]
    fn splits_pipelined_replies_in_one_chunk() {
        let conn = server_conn();
        let mut pool = MessagePool::new(16);
        let mut parser = MemcachedReplyParser::new();
        let mut completed = Vec::new();
        on_readable(
            &conn,
            &mut pool,
            &mut parser,
            b"STORED\r\nDELETED\r\n",
            |m| completed.push(m),
        )
        .unwrap();
        assert_eq!(completed.len(), 2);
    }

    #[test]
    fn eof_mid_reply_releases_partial_message() {
        let conn = server_conn();
        let mut pool = MessagePool::new(16);
        let mut parser = MemcachedReplyParser::new();
        on_readable(&conn, &mut pool, &mut parser, b"VALUE foo 0 3\r\nba", |_| {}).unwrap();
        assert_eq!(pool.live_count(), 1);

        on_eof(&conn, &mut pool);
        assert!(conn.borrow().done);
        assert!(conn.borrow().rmsg.is_none());
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn alloc_failure_is_non_fatal() {
        let conn = server_conn();
        let mut pool = MessagePool::new(0);
        let mut parser = MemcachedReplyParser::new();
        let err = on_readable(&conn, &mut pool, &mut parser, b"STORED\r\n", |_| {}).unwrap_err();
        assert!(err.is_alloc_fail());
        assert!(!conn.borrow().done);
    }
}
