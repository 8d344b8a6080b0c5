//! Response Sender (spec component C5, spec.md §4.5).
//!
//! Walks a client connection's out-queue in arrival order, producing
//! either the reply already paired with the head request or a
//! synthesized error for a request that failed upstream, and runs the
//! release bookkeeping once the bytes have actually gone out.

use std::cell::RefCell;
use std::rc::Rc;

use crate::connection::{Connection, Protocol};
use crate::message::{link_peers, unlink_peer, ErrKind, MessagePool, MessageRef};
use crate::topology::ServerPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing ready; write interest has been dropped.
    Nothing,
    /// `msg` is now `conn.smsg` and should be written to the socket.
    Message(MessageRef),
}

/// spec.md §4.5 steps 1-7. The "resume mid-send" branch (step 3)
/// collapses into simply re-peeking the out-queue head: `send_done`
/// already dequeues the just-sent request FIFO-style before the next
/// call, so the head is always the correct next candidate without a
/// separate "successor of `smsg.peer`" pointer.
pub fn next_to_send(
    conn: &Rc<RefCell<Connection>>,
    pool: &mut MessagePool,
    protocol: Protocol,
    error_pool: Option<&Rc<RefCell<ServerPool>>>,
) -> SendOutcome {
    let head = conn.borrow().peek_front_outq();

    let Some(head) = head else {
        let mut c = conn.borrow_mut();
        if c.eof {
            c.done = true;
        }
        c.drop_write_interest();
        c.smsg = None;
        return SendOutcome::Nothing;
    };

    if !head.borrow().done {
        let mut c = conn.borrow_mut();
        c.drop_write_interest();
        c.smsg = None;
        return SendOutcome::Nothing;
    }

    let has_reply = head.borrow().reply.is_some();
    let msg = if has_reply {
        head.borrow().reply.clone().expect("checked above")
    } else {
        let synthesized = coalesce_error(&head, pool, protocol);
        if let Some(sp) = error_pool {
            sp.borrow_mut().stats.forward_error += 1;
        }
        synthesized
    };

    conn.borrow_mut().smsg = Some(msg.clone());
    SendOutcome::Message(msg)
}

/// Runs after `conn.smsg`'s bytes have been fully written to the
/// socket (spec.md §4.5 "After the bytes are written, `send_done`
/// runs"). Releases both the request and the reply that was just
/// written — `msg`'s only remaining owners at this point are `smsg`
/// (cleared below) and the request's `reply` field (cleared by
/// `unlink_peer`), so both messages must be explicitly handed back to
/// the pool or they are never reclaimed.
pub fn send_done(conn: &Rc<RefCell<Connection>>, pool: &mut MessagePool, msg: &MessageRef) {
    let pmsg = msg
        .borrow()
        .peer
        .as_ref()
        .and_then(|weak| weak.upgrade())
        .expect("send_done called on a reply with no paired request");
    debug_assert!(pmsg.borrow().done);
    debug_assert!(!pmsg.borrow().swallow);
    Connection::dequeue_outq(conn, &pmsg);
    let reply = unlink_peer(&pmsg);
    debug_assert!(reply.as_ref().map(|r| Rc::ptr_eq(r, msg)).unwrap_or(false));
    pool.release(&pmsg);
    pool.release(msg);
    conn.borrow_mut().smsg = None;
}

/// Error coalescing (spec.md §4.5.1): synthesizes the one error reply
/// a client sees for a failed request, sweeping up every fragment
/// sibling (tracked only on their own server connections' out-queues,
/// never the client's — see `DESIGN.md`) in one pass and propagating
/// the first non-zero error among them.
fn coalesce_error(parent: &MessageRef, pool: &mut MessagePool, protocol: Protocol) -> MessageRef {
    let mut first_err = parent.borrow().err;

    if let Some(group) = parent.borrow().frag_group.clone() {
        let members = group.borrow().members.clone();
        for member_weak in members {
            let Some(member) = member_weak.upgrade() else {
                continue;
            };
            let member_err = member.borrow().err;
            if first_err == ErrKind::None && member_err != ErrKind::None {
                first_err = member_err;
            }
            let queued_on = member.borrow().queued_on.clone();
            if let Some(server_conn_weak) = queued_on {
                if let Some(server_conn) = server_conn_weak.upgrade() {
                    Connection::dequeue_outq(&server_conn, &member);
                }
            }
            if let Some(peer) = unlink_peer(&member) {
                pool.release(&peer);
            }
            pool.release(&member);
        }
    }

    // If the parent already had a provisional paired reply (a success
    // raced the failure), drop it before attaching the error.
    if let Some(old_reply) = unlink_peer(parent) {
        pool.release(&old_reply);
    }

    let owner = parent
        .borrow()
        .owner
        .upgrade()
        .expect("request outlives its client connection");
    let synthesized = pool.new_error_response(&owner, protocol, first_err);
    link_peers(parent, &synthesized);
    synthesized
}

/// Tears down every outstanding request on a server connection that's
/// being closed (spec.md §7 `parse_error`/`stray_reply`/`server_eof`:
/// "Close the server connection; generate `SERVER_ERROR` to all
/// owners"). Named per `SPEC_FULL.md` §F.3.
///
/// For an unfragmented request this just marks it failed in place —
/// it is still the entry sitting on the client's out-queue, and the
/// client's own `next_to_send` will coalesce the error normally. For a
/// fragment, the request itself never sat on the client's out-queue
/// (only the parent does), so this propagates the failure onto the
/// parent directly and force-completes the group so a later surviving
/// sibling's reply can't try to re-link the parent's peer.
pub fn drain_with_error(server_conn: &Rc<RefCell<Connection>>, pool: &mut MessagePool) {
    let server_err = server_conn.borrow().err.unwrap_or(ErrKind::ServerError);

    loop {
        let Some(pmsg) = Connection::pop_front_outq(server_conn) else {
            break;
        };

        let frag_group = pmsg.borrow().frag_group.clone();
        if let Some(group) = frag_group {
            let own_err = pmsg.borrow().err;
            let propagate_err = if own_err != ErrKind::None { own_err } else { server_err };
            group.borrow_mut().force_error(propagate_err);

            if let Some(parent) = group.borrow().parent.upgrade() {
                if parent.borrow().reply.is_none() {
                    parent.borrow_mut().err = propagate_err;
                    parent.borrow_mut().done = true;
                    if let Some(client_conn) = parent.borrow().owner.upgrade() {
                        client_conn.borrow_mut().request_write_interest();
                    }
                }
            }
            pool.release(&pmsg);
        } else {
            pmsg.borrow_mut().err = server_err;
            pmsg.borrow_mut().done = true;
            if let Some(old_reply) = unlink_peer(&pmsg) {
                pool.release(&old_reply);
            }
            if let Some(client_conn) = pmsg.borrow().owner.upgrade() {
                client_conn.borrow_mut().request_write_interest();
            }
            // `pmsg` itself is still enqueued on the client connection;
            // it is released by `send_done` once its synthesized error
            // has been written.
        }
    }
}
