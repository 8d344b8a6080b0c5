//! Response Filter & Forwarder (spec component C4, spec.md §4.4).
//!
//! The most delicate piece of the response core: filtering decides
//! whether a completed server reply ever reaches a client at all;
//! forwarding pairs it with the request that's been waiting for it,
//! accounts stats and slow-log, and arms the owning client connection
//! for write readiness.

use std::cell::RefCell;
use std::rc::Rc;

use tokio::time::Instant;

use crate::connection::Connection;
use crate::message::{link_peers, ErrKind, MessagePool, MessageRef};
use crate::slowlog::{AddrCache, SlowLogRecord, SlowLogSink};

/// What became of a completed reply after filtering/forwarding
/// (spec.md §4.4.1 "drop or keep", §4.4.2 step 5's veto).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Empty, stray, or swallowed — spec.md §8 "never produce any
    /// bytes on a client socket".
    Dropped,
    /// `pre_rsp_forward` vetoed delivery; the reply stays paired with
    /// its request but is not written to the client (spec.md §4.4.2
    /// step 5, §9 open question (a)).
    Vetoed,
    /// Forwarded normally; the owning client connection may now have
    /// write interest armed.
    Forwarded,
}

/// Filters and forwards one completed reply on a server connection
/// (spec.md §4.4). Returns the `Outcome`; callers that see the server
/// connection left with `err` and `done` set afterward (the stray-reply
/// case, spec.md §4.4.1) should run the drain cascade from
/// `proto::sender::drain_with_error`.
pub fn filter_and_forward(
    server_conn: &Rc<RefCell<Connection>>,
    rmsg: MessageRef,
    pool: &mut MessagePool,
    slowlog_sink: &dyn SlowLogSink,
    addr_cache: &mut AddrCache,
    now: Instant,
) -> Outcome {
    // 4.4.1 Filtering.
    if rmsg.borrow().is_empty_reply() {
        pool.release(&rmsg);
        return Outcome::Dropped;
    }

    let head = server_conn.borrow().peek_front_outq();
    let Some(pmsg_candidate) = head else {
        // Stray reply: spec.md §4.4.1. Tearing the connection down is
        // the caller's job (it owns the event-loop-level close); this
        // only sets the flags that tell it to.
        pool.release(&rmsg);
        let mut c = server_conn.borrow_mut();
        c.err = Some(ErrKind::InvalidArgument);
        c.done = true;
        return Outcome::Dropped;
    };

    if pmsg_candidate.borrow().swallow {
        let pmsg = Connection::pop_front_outq(server_conn).expect("head was just peeked");
        debug_assert!(Rc::ptr_eq(&pmsg, &pmsg_candidate));
        let mut hook = server_conn.borrow_mut().swallow_msg.take();
        if let Some(ref mut h) = hook {
            h(&pmsg, &rmsg);
        }
        server_conn.borrow_mut().swallow_msg = hook;
        pmsg.borrow_mut().done = true;
        pool.release(&pmsg);
        pool.release(&rmsg);
        return Outcome::Dropped;
    }

    // 4.4.2 Forwarding.
    let msgsize = rmsg.borrow().mlen as u64;
    server_conn.borrow().mark_server_healthy();

    let pmsg = Connection::pop_front_outq(server_conn).expect("head was just peeked");
    link_peers(&pmsg, &rmsg);

    let taken_hook = pmsg.borrow_mut().pre_rsp_forward.take();
    if let Some(mut hook) = taken_hook {
        let outcome = hook(&pmsg, &rmsg);
        pmsg.borrow_mut().pre_rsp_forward = Some(hook);
        if outcome == crate::message::HookOutcome::Veto {
            return Outcome::Vetoed;
        }
    }

    pmsg.borrow_mut().done = true;

    // 4.4.3 Slow-log and latency accounting.
    let stime = pmsg.borrow().slowlog_stime;
    if let Some(stime) = stime {
        let cost_ms = now.saturating_duration_since(stime).as_millis() as u64;
        pmsg.borrow_mut().slowlog_etime = Some(now);

        if let Some(server) = server_conn.borrow().server.clone() {
            let local_idc = server.borrow().local_idc;
            server.borrow().pool.borrow_mut().record_latency(local_idc, cost_ms);

            let is_slow = server.borrow().pool.borrow().is_slow(cost_ms);
            if is_slow {
                let client_addr = pmsg
                    .borrow()
                    .owner
                    .upgrade()
                    .map(|c| addr_cache.resolve(c.borrow().peer_addr))
                    .unwrap_or_else(|| Rc::from("unknown"));
                let server_addr = addr_cache.resolve(server_conn.borrow().peer_addr);
                let record = SlowLogRecord {
                    request_msg_id: pmsg.borrow().id,
                    client_address: client_addr,
                    server_address: server_addr,
                    cost_time_ms: cost_ms,
                    fragment_id: pmsg.borrow().frag_id(),
                    request_type: pmsg.borrow().verb,
                    request_len: pmsg.borrow().mlen as u32,
                    response_len: msgsize as u32,
                    key: pmsg.borrow().first_key().map(|k| k.to_vec()).unwrap_or_default(),
                };
                slowlog_sink.emit(record.format());
            }
        }
    }

    // Fragment payload coalescing (spec.md §4.4.2 step 8, §3
    // `pre_coalesce`): only fragments carry this hook.
    let taken_coalesce = rmsg.borrow_mut().pre_coalesce.take();
    if let Some(mut hook) = taken_coalesce {
        hook(&rmsg);
    }
    let frag_group = pmsg.borrow().frag_group.clone();
    if let Some(group) = frag_group {
        let complete = {
            let mut g = group.borrow_mut();
            g.done += 1;
            if g.first_err == ErrKind::None && pmsg.borrow().err != ErrKind::None {
                g.first_err = pmsg.borrow().err;
            }
            g.is_complete()
        };
        // The fragment request and its own reply have now been fully
        // absorbed into the group's slots; nothing references them
        // beyond this point.
        if let Some(peer) = crate::message::unlink_peer(&pmsg) {
            pool.release(&peer);
        }
        pool.release(&pmsg);

        if complete {
            let parent = group.borrow().parent.upgrade();
            if let Some(parent) = parent {
                // A sibling's earlier failure may already have given
                // the parent a synthesized error reply (spec.md §7
                // cascade); don't clobber it with a late success.
                if parent.borrow().reply.is_none() {
                    let payload = group.borrow().assemble();
                    let owner = parent.borrow().owner.upgrade();
                    if let Some(client_conn) = owner {
                        let verb = parent.borrow().verb;
                        let coalesced = pool.new_coalesced_response(&client_conn, verb, payload);
                        link_peers(&parent, &coalesced);
                    }
                }
                parent.borrow_mut().done = true;
            }
        }
    }

    // Step 9: arm the owning client connection's write interest if its
    // out-queue head (the parent, for a fragmented request, or `pmsg`
    // itself otherwise) is now ready.
    let c_conn = if pmsg.borrow().is_fragmented() {
        pmsg.borrow()
            .frag_group
            .as_ref()
            .and_then(|g| g.borrow().parent.upgrade())
            .and_then(|parent| parent.borrow().owner.upgrade())
    } else {
        pmsg.borrow().owner.upgrade()
    };
    if let Some(c_conn) = c_conn {
        let head_done = c_conn.borrow().peek_front_outq().map(|h| h.borrow().done).unwrap_or(false);
        if head_done {
            c_conn.borrow_mut().request_write_interest();
        }
    }

    if let Some(server) = server_conn.borrow().server.clone() {
        server.borrow_mut().record_response(msgsize);
    }

    Outcome::Forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Protocol, Role};
    use crate::message::{MessagePool, Span, Verb};
    use crate::slowlog::RecordingSlowLogSink;
    use crate::topology::{ServerPool, ServerRecord};
    use std::net::SocketAddr;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "10.0.0.1:4000".parse().unwrap(),
            "10.0.0.2:11211".parse().unwrap(),
        )
    }

    fn make_pair() -> (Rc<RefCell<Connection>>, Rc<RefCell<Connection>>) {
        let (caddr, saddr) = addrs();
        let client = Rc::new(RefCell::new(Connection::new(1, Role::Client, Protocol::Memcached, caddr)));
        let server = Rc::new(RefCell::new(Connection::new(2, Role::Server, Protocol::Memcached, saddr)));
        let pool = Rc::new(RefCell::new(ServerPool::new(1, "pool0", 100)));
        let record = Rc::new(RefCell::new(ServerRecord::new(1, saddr, false, pool)));
        server.borrow_mut().server = Some(record);
        (client, server)
    }

    #[test]
    fn empty_reply_is_dropped_and_released() {
        let (_client, server) = make_pair();
        let mut pool = MessagePool::new(16);
        let rmsg = pool.new_response(&server).unwrap();
        rmsg.borrow_mut().mlen = 0;
        let sink = RecordingSlowLogSink::default();
        let mut addr_cache = AddrCache::new();
        let outcome = filter_and_forward(&server, rmsg, &mut pool, &sink, &mut addr_cache, Instant::now());
        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn stray_reply_marks_connection_err_and_done() {
        let (_client, server) = make_pair();
        let mut pool = MessagePool::new(16);
        let rmsg = pool.new_response(&server).unwrap();
        rmsg.borrow_mut().mlen = 10;
        let sink = RecordingSlowLogSink::default();
        let mut addr_cache = AddrCache::new();
        let outcome = filter_and_forward(&server, rmsg, &mut pool, &sink, &mut addr_cache, Instant::now());
        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(server.borrow().err, Some(ErrKind::InvalidArgument));
        assert!(server.borrow().done);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn forwarded_reply_pairs_and_arms_client_write_interest() {
        let (client, server) = make_pair();
        let mut pool = MessagePool::new(16);

        let req = pool.new_request(&client).unwrap();
        req.borrow_mut().verb = Verb::Get;
        req.borrow_mut().keys = vec![Span { start: 0, end: 3 }];
        Connection::enqueue_outq(&client, &req);
        Connection::enqueue_outq(&server, &req);

        let rmsg = pool.new_response(&server).unwrap();
        rmsg.borrow_mut().mlen = 23;

        let sink = RecordingSlowLogSink::default();
        let mut addr_cache = AddrCache::new();
        let outcome = filter_and_forward(&server, rmsg.clone(), &mut pool, &sink, &mut addr_cache, Instant::now());

        assert_eq!(outcome, Outcome::Forwarded);
        assert!(req.borrow().done);
        assert!(Rc::ptr_eq(req.borrow().reply.as_ref().unwrap(), &rmsg));
        assert!(client.borrow().has_write_interest());
        assert_eq!(server.borrow().server.as_ref().unwrap().borrow().stats.responses, 1);
        assert_eq!(
            server.borrow().server.as_ref().unwrap().borrow().stats.response_bytes,
            23
        );
    }

    #[test]
    fn swallowed_reply_never_reaches_client_and_releases_both() {
        let (client, server) = make_pair();
        let mut pool = MessagePool::new(16);

        let req = pool.new_request(&client).unwrap();
        req.borrow_mut().swallow = true;
        Connection::enqueue_outq(&server, &req);

        let rmsg = pool.new_response(&server).unwrap();
        rmsg.borrow_mut().mlen = 5;

        let sink = RecordingSlowLogSink::default();
        let mut addr_cache = AddrCache::new();
        let outcome = filter_and_forward(&server, rmsg, &mut pool, &sink, &mut addr_cache, Instant::now());

        assert_eq!(outcome, Outcome::Dropped);
        assert!(!client.borrow().has_write_interest());
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn slow_reply_emits_slowlog_line_and_cumulative_buckets() {
        let (client, server) = make_pair();
        let mut pool = MessagePool::new(16);

        let req = pool.new_request(&client).unwrap();
        req.borrow_mut().verb = Verb::Get;
        let t0 = Instant::now();
        req.borrow_mut().slowlog_stime = Some(t0);
        Connection::enqueue_outq(&client, &req);
        Connection::enqueue_outq(&server, &req);

        let rmsg = pool.new_response(&server).unwrap();
        rmsg.borrow_mut().mlen = 23;

        let sink = RecordingSlowLogSink::default();
        let mut addr_cache = AddrCache::new();
        let later = t0 + std::time::Duration::from_millis(250);
        filter_and_forward(&server, rmsg, &mut pool, &sink, &mut addr_cache, later);

        assert_eq!(sink.lines.borrow().len(), 1);
        assert!(sink.lines.borrow()[0].contains("cost_time=250ms"));
        let pool_ref = server.borrow().server.as_ref().unwrap().borrow().pool.clone();
        assert_eq!(pool_ref.borrow().stats.cross.counts, [1, 1, 1, 1, 1, 0]);
    }
}
