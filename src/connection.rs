//! Per-socket connection state (spec component C2).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use tokio::sync::Notify;

use crate::message::MessageRef;
use crate::topology::ServerRecord;

/// `conn.role` from spec.md §3. `ProxyListener` never handles messages;
/// it exists only so the type enumerates every role the topology layer
/// can hand this crate, the same way hyper's `Http1Transaction` is
/// implemented once per role rather than branching on a bool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
    ProxyListener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Memcached,
    Redis,
}

/// Per-connection out-queue bookkeeping. The socket itself is *not*
/// stored here: the read half and write half of a connection are each
/// driven by their own task (spec.md §4.3's receiver, §4.5's sender),
/// and holding a `RefCell` borrow across the `.await` of a socket read
/// or write would let those two tasks deadlock-by-panic on each other.
/// `Connection` only holds the state both tasks need to agree on, and
/// every access to it is a short, non-blocking borrow. Nothing here is
/// `Send`, which is intentional — it documents that a `Connection`
/// must stay on the single thread that runs the proxy's event loop
/// (spec.md §5 "single-threaded... no shared-state contention").
pub struct Connection {
    pub id: u64,
    pub role: Role,
    pub protocol: Protocol,
    pub peer_addr: SocketAddr,
    pub rmsg: Option<MessageRef>,
    pub smsg: Option<MessageRef>,
    pub omsg_q: VecDeque<MessageRef>,
    pub eof: bool,
    pub done: bool,
    pub err: Option<crate::message::ErrKind>,
    /// Backend server record, for a server connection only.
    pub server: Option<Rc<RefCell<ServerRecord>>>,
    write_interest: bool,
    write_notify: Rc<Notify>,
    /// Bound at creation by role (spec.md §4.2): a swallowed request's
    /// reply is handed here instead of the client, so that e.g. an
    /// internal auth probe's reply never escapes to a socket.
    pub swallow_msg: Option<Box<dyn FnMut(&MessageRef, &MessageRef)>>,
}

impl Connection {
    pub fn new(id: u64, role: Role, protocol: Protocol, peer_addr: SocketAddr) -> Connection {
        Connection {
            id,
            role,
            protocol,
            peer_addr,
            rmsg: None,
            smsg: None,
            omsg_q: VecDeque::new(),
            eof: false,
            done: false,
            err: None,
            server: None,
            write_interest: false,
            write_notify: Rc::new(Notify::new()),
            swallow_msg: None,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client)
    }

    pub fn is_server(&self) -> bool {
        matches!(self.role, Role::Server)
    }

    /// `enqueue_outq` (spec.md §4.2). Arrival order for a client,
    /// send order for a server.
    pub fn enqueue_outq(conn: &Rc<RefCell<Connection>>, msg: &MessageRef) {
        msg.borrow_mut().queued_on = Some(Rc::downgrade(conn));
        conn.borrow_mut().omsg_q.push_back(msg.clone());
    }

    /// `dequeue_outq(msg)` (spec.md §4.2). Replies are always matched
    /// from the head (spec.md §3 invariant (out-queue ordering)), but
    /// error cascades (spec.md §7) need to remove an arbitrary
    /// fragment sibling, so this removes by identity rather than
    /// always popping the front.
    pub fn dequeue_outq(conn: &Rc<RefCell<Connection>>, msg: &MessageRef) -> bool {
        let mut c = conn.borrow_mut();
        if let Some(pos) = c.omsg_q.iter().position(|m| Rc::ptr_eq(m, msg)) {
            c.omsg_q.remove(pos);
            drop(c);
            msg.borrow_mut().queued_on = None;
            true
        } else {
            false
        }
    }

    pub fn pop_front_outq(conn: &Rc<RefCell<Connection>>) -> Option<MessageRef> {
        let popped = conn.borrow_mut().omsg_q.pop_front();
        if let Some(ref m) = popped {
            m.borrow_mut().queued_on = None;
        }
        popped
    }

    pub fn peek_front_outq(&self) -> Option<MessageRef> {
        self.omsg_q.front().cloned()
    }

    /// `mark_server_healthy()` (spec.md §4.2): a reply is implicit
    /// liveness proof, so every forwarded reply resets backoff state.
    pub fn mark_server_healthy(&self) {
        if let Some(ref server) = self.server {
            server.borrow_mut().mark_healthy();
        }
    }

    /// `request_write_interest()` (spec.md §4.2, §3 invariant (client
    /// readiness)).
    pub fn request_write_interest(&mut self) {
        self.write_interest = true;
        self.write_notify.notify_waiters();
    }

    /// `drop_write_interest()` (spec.md §4.2).
    pub fn drop_write_interest(&mut self) {
        self.write_interest = false;
    }

    pub fn has_write_interest(&self) -> bool {
        self.write_interest
    }

    pub fn write_notify(&self) -> Rc<Notify> {
        self.write_notify.clone()
    }
}
