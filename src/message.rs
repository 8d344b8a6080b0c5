//! The message handle (spec component C1).
//!
//! A `Message` is a reference-counted carrier for a parsed request or
//! reply. Two messages are related two ways: the `peer` link, which
//! this module keeps deliberately non-owning (`Weak`) on both sides so
//! that releasing one never has to reason about the other's refcount,
//! and a request's `reply` field, the one strong pointer that actually
//! keeps a paired reply alive between forwarding and sending.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use bytes::BytesMut;
use tokio::time::Instant;

use crate::connection::Connection;
use crate::error::{Error, Kind, Result};

/// Shared handle to a `Message`. Messages are always reached through
/// this type; nothing outside this module constructs a bare `Message`.
pub type MessageRef = Rc<RefCell<Message>>;

/// Monotone id assigned at allocation, unique for the life of the proxy
/// process (wraps only after `u64::MAX` allocations).
pub type MessageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Request,
    Response,
}

/// `msg.err` from spec.md §3. `None` is the "0 if none" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrKind {
    #[default]
    None,
    Timeout,
    ShardUnavailable,
    ParseError,
    ServerError,
    InvalidArgument,
}

/// A span of bytes inside a message's buffer, used for key positions
/// (spec.md §3 `keys`) and for the first-key slow-log excerpt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Protocol-specific verb, kept as a small fixed set rather than an
/// open string so slow-log/stats formatting stays allocation-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Set,
    Delete,
    MGet,
    Other,
}

/// Coordination state shared by all fragments of one client request.
/// Owned jointly (by strong `Rc`) by the parent request and every
/// fragment request it spawned; holds only weak references back to
/// messages so it never keeps a message alive on its own.
pub struct FragmentGroup {
    pub id: u64,
    pub total: usize,
    pub done: usize,
    pub first_err: ErrKind,
    pub parent: Weak<RefCell<Message>>,
    pub members: Vec<Weak<RefCell<Message>>>,
    /// Accumulated response payload, one slot per fragment index so
    /// that replies spliced in arrival order (fragment 2 may answer
    /// before fragment 1) are still assembled back into request order
    /// for the client.
    pub slots: Vec<Option<BytesMut>>,
}

impl FragmentGroup {
    pub fn new(id: u64, total: usize, parent: Weak<RefCell<Message>>) -> FragmentGroup {
        FragmentGroup {
            id,
            total,
            done: 0,
            first_err: ErrKind::None,
            parent,
            members: Vec::with_capacity(total),
            slots: (0..total).map(|_| None).collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done >= self.total
    }

    /// Forces the group permanently complete after one member's server
    /// connection died (spec.md §7 `server_eof`/`stray_reply`/
    /// `parse_error` cascades): no further sibling reply should ever
    /// try to coalesce a success into a parent that's already been
    /// given a synthesized error.
    pub fn force_error(&mut self, err: ErrKind) {
        if self.first_err == ErrKind::None {
            self.first_err = err;
        }
        self.done = self.total;
    }

    /// Concatenates the per-fragment payloads back into the client's
    /// original key order. Only meaningful once `is_complete()`.
    pub fn assemble(&self) -> BytesMut {
        let mut out = BytesMut::new();
        for slot in &self.slots {
            if let Some(ref chunk) = slot {
                out.extend_from_slice(chunk);
            }
        }
        out
    }
}

/// Outcome of `pre_rsp_forward`: whether the filter/forwarder may
/// continue delivering this reply to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Ok,
    Veto,
}

pub type PreRspForwardHook = Box<dyn FnMut(&MessageRef, &MessageRef) -> HookOutcome>;
pub type PreCoalesceHook = Box<dyn FnMut(&MessageRef)>;

pub struct Message {
    pub id: MessageId,
    pub kind: MsgKind,
    pub owner: Weak<RefCell<Connection>>,
    /// Non-owning, symmetric peer link (spec.md §3 "peer: a weak
    /// cross-link"; §9 "model this as a bidirectional non-owning
    /// reference... not as an ownership pointer on either side"). Set
    /// and cleared together on both sides by `link_peers`/`unlink_peer`;
    /// holding only a `Weak` here means a paired request and reply
    /// never keep each other alive through this field.
    pub peer: Option<Weak<RefCell<Message>>>,
    /// The strong, independent owner of a request's paired reply for
    /// the forward→send window (spec.md §9): something has to keep the
    /// reply alive between `link_peers` and the sender picking it up,
    /// now that `peer` no longer can. Meaningful only on request-kind
    /// messages; cleared by `unlink_peer`/`send_done` alongside `peer`.
    pub reply: Option<MessageRef>,
    pub frag_group: Option<Rc<RefCell<FragmentGroup>>>,
    /// This message's position within its `frag_group`'s `slots`
    /// (spec.md §4.4.2 step 8). `0` and meaningless when unfragmented.
    pub frag_index: usize,
    pub done: bool,
    pub swallow: bool,
    pub err: ErrKind,
    pub mlen: usize,
    pub verb: Verb,
    pub keys: Vec<Span>,
    pub buf: BytesMut,
    pub slowlog_stime: Option<Instant>,
    pub slowlog_etime: Option<Instant>,
    pub pre_rsp_forward: Option<PreRspForwardHook>,
    pub pre_coalesce: Option<PreCoalesceHook>,
    /// The connection this message is currently enqueued on, if any.
    /// Kept so connection-level cascades (stray reply, EOF, fragment
    /// error coalescing) can find and dequeue a message without every
    /// caller threading the owning connection through by hand.
    pub queued_on: Option<Weak<RefCell<Connection>>>,
}

impl Message {
    pub fn frag_id(&self) -> u64 {
        self.frag_group
            .as_ref()
            .map(|g| g.borrow().id)
            .unwrap_or(0)
    }

    pub fn is_fragmented(&self) -> bool {
        self.frag_group.is_some()
    }

    /// `empty(msg)` from spec.md §4.1: true on zero body length, even
    /// if the underlying buffer chain is non-empty (trimmed framing).
    pub fn is_empty_reply(&self) -> bool {
        self.mlen == 0
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.keys.first().map(|k| &self.buf[k.start..k.end])
    }
}

/// Allocator for `Message`s (spec.md §4.1's `new_response`,
/// `new_error_response`), standing in for the out-of-scope message
/// pool (spec.md §6 `msg_alloc`/`msg_release`). Pools are tracked per
/// process, never per connection, matching the "process-wide" resource
/// model in spec.md §5.
pub struct MessagePool {
    next_id: MessageId,
    /// Hard cap standing in for the external allocator's real backing
    /// store; lets tests exercise `alloc_fail` (spec.md §7) without a
    /// real memory-pressure harness.
    capacity: usize,
    live: HashSet<MessageId>,
}

impl MessagePool {
    pub fn new(capacity: usize) -> MessagePool {
        MessagePool {
            next_id: 1,
            capacity,
            live: HashSet::new(),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn alloc(&mut self, kind: MsgKind, owner: &Rc<RefCell<Connection>>) -> Result<MessageRef> {
        if self.live.len() >= self.capacity {
            return Err(Error::new(Kind::AllocFail));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id);
        Ok(Rc::new(RefCell::new(Message {
            id,
            kind,
            owner: Rc::downgrade(owner),
            peer: None,
            reply: None,
            frag_group: None,
            frag_index: 0,
            done: false,
            swallow: false,
            err: ErrKind::None,
            mlen: 0,
            verb: Verb::Other,
            keys: Vec::new(),
            buf: BytesMut::new(),
            slowlog_stime: None,
            slowlog_etime: None,
            pre_rsp_forward: None,
            pre_coalesce: None,
            queued_on: None,
        })))
    }

    /// `new_response(conn) -> msg | alloc_error` (spec.md §4.1).
    pub fn new_response(&mut self, conn: &Rc<RefCell<Connection>>) -> Result<MessageRef> {
        self.alloc(MsgKind::Response, conn)
    }

    pub fn new_request(&mut self, conn: &Rc<RefCell<Connection>>) -> Result<MessageRef> {
        self.alloc(MsgKind::Request, conn)
    }

    /// `new_error_response(protocol, err_kind) -> msg` (spec.md §4.1).
    /// Never fails for recoverable conditions: synthesized error
    /// replies bypass the capacity cap, since refusing to report an
    /// error back to a client would be worse than a transient bit of
    /// extra memory.
    pub fn new_error_response(
        &mut self,
        conn: &Rc<RefCell<Connection>>,
        protocol: crate::connection::Protocol,
        err: ErrKind,
    ) -> MessageRef {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(error_body(protocol, err));
        let mlen = buf.len();
        Rc::new(RefCell::new(Message {
            id,
            kind: MsgKind::Response,
            owner: Rc::downgrade(conn),
            peer: None,
            reply: None,
            frag_group: None,
            frag_index: 0,
            done: true,
            swallow: false,
            err,
            mlen,
            verb: Verb::Other,
            keys: Vec::new(),
            buf,
            slowlog_stime: None,
            slowlog_etime: None,
            pre_rsp_forward: None,
            pre_coalesce: None,
            queued_on: None,
        }))
    }

    /// `release(msg)` (spec.md §4.1). Precondition: `msg.peer` and
    /// `msg.reply` are already `None` and the message is not enqueued
    /// anywhere.
    pub fn release(&mut self, msg: &MessageRef) {
        let m = msg.borrow();
        debug_assert!(m.peer.is_none(), "release called with a live peer link");
        debug_assert!(m.reply.is_none(), "release called with a live reply link");
        debug_assert!(m.queued_on.is_none(), "release called while still enqueued");
        self.live.remove(&m.id);
    }

    /// Allocates the single reply a client ultimately sees for a
    /// fragmented request, once `pre_coalesce` has assembled every
    /// sibling's payload (spec.md §4.4.2 step 8). Not part of
    /// spec.md's C1 operation list verbatim, but required to give
    /// `FragmentGroup::assemble`'s output somewhere to live as a real
    /// `Message` the sender can transmit.
    pub fn new_coalesced_response(
        &mut self,
        conn: &Rc<RefCell<Connection>>,
        verb: Verb,
        payload: BytesMut,
    ) -> MessageRef {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id);
        let mlen = payload.len();
        Rc::new(RefCell::new(Message {
            id,
            kind: MsgKind::Response,
            owner: Rc::downgrade(conn),
            peer: None,
            reply: None,
            frag_group: None,
            frag_index: 0,
            done: true,
            swallow: false,
            err: ErrKind::None,
            mlen,
            verb,
            keys: Vec::new(),
            buf: payload,
            slowlog_stime: None,
            slowlog_etime: None,
            pre_rsp_forward: None,
            pre_coalesce: None,
            queued_on: None,
        }))
    }
}

fn error_body(protocol: crate::connection::Protocol, err: ErrKind) -> &'static [u8] {
    use crate::connection::Protocol;
    match (protocol, err) {
        (Protocol::Memcached, ErrKind::InvalidArgument) => b"CLIENT_ERROR bad command line format\r\n",
        (Protocol::Memcached, _) => b"SERVER_ERROR proxy error\r\n",
        (Protocol::Redis, ErrKind::InvalidArgument) => b"-ERR bad request\r\n",
        (Protocol::Redis, _) => b"-ERR proxy error\r\n",
    }
}

/// Unlink a request from its reply, returning the reply (the request's
/// strong `reply` field) so the caller can release it. `msg` is always
/// the request side of the pair — the only side that owns anything.
/// Always call this before `MessagePool::release` on either message.
pub fn unlink_peer(msg: &MessageRef) -> Option<MessageRef> {
    let reply = msg.borrow_mut().reply.take();
    if let Some(weak_peer) = msg.borrow_mut().peer.take() {
        if let Some(other) = weak_peer.upgrade() {
            other.borrow_mut().peer = None;
        }
    }
    reply
}

/// Establish a symmetric, exclusive, non-owning peer link between a
/// request and its reply (spec.md §3 invariant (pairing), case (ii)),
/// and give the reply a strong, independent owner — the request's
/// `reply` field — for the window between forwarding and sending
/// (spec.md §9).
pub fn link_peers(request: &MessageRef, reply: &MessageRef) {
    debug_assert!(request.borrow().peer.is_none());
    debug_assert!(reply.borrow().peer.is_none());
    request.borrow_mut().peer = Some(Rc::downgrade(reply));
    reply.borrow_mut().peer = Some(Rc::downgrade(request));
    request.borrow_mut().reply = Some(reply.clone());
}

/// Builds the `pre_coalesce` hook a fragment's reply carries (spec.md
/// §3 `pre_coalesce`, §4.4.2 step 8): dropping the reply's payload into
/// this fragment's slot of its group, leaving completion bookkeeping
/// and parent peering to the filter/forwarder, which has pool access.
pub fn make_pre_coalesce(group: Rc<RefCell<FragmentGroup>>, index: usize) -> PreCoalesceHook {
    Box::new(move |rmsg: &MessageRef| {
        let payload = rmsg.borrow().buf.clone();
        group.borrow_mut().slots[index] = Some(payload);
    })
}
