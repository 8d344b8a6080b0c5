//! End-to-end coverage of the response core: receiver -> filter/
//! forwarder -> sender, wired together the way `src/bin/proxyd.rs`
//! wires them to real sockets, but driven directly against in-memory
//! `Connection`/`Message` state so the test doesn't need a socket pair.
//!
//! Scenarios mirror `spec.md` §8's table (S1, S2, S5).

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use shard_cache_proxy::connection::{Connection, Protocol, Role};
use shard_cache_proxy::memcached::MemcachedReplyParser;
use shard_cache_proxy::message::{make_pre_coalesce, ErrKind, FragmentGroup, MessagePool, Verb};
use shard_cache_proxy::proto::{filter, receiver, sender};
use shard_cache_proxy::slowlog::AddrCache;
use shard_cache_proxy::slowlog::RecordingSlowLogSink;
use shard_cache_proxy::topology::{ServerPool, ServerRecord};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn client_conn(id: u64) -> Rc<RefCell<Connection>> {
    Rc::new(RefCell::new(Connection::new(id, Role::Client, Protocol::Memcached, addr(4000 + id as u16))))
}

fn server_conn(id: u64, record: &Rc<RefCell<ServerRecord>>) -> Rc<RefCell<Connection>> {
    let conn = Rc::new(RefCell::new(Connection::new(id, Role::Server, Protocol::Memcached, record.borrow().addr)));
    conn.borrow_mut().server = Some(record.clone());
    conn
}

/// S1: one client, one server, one `GET foo` — the reply reaches the
/// client byte-identical and the server's response stats update.
#[test]
fn s1_single_request_round_trip() {
    let mut pool = MessagePool::new(16);
    let server_pool = Rc::new(RefCell::new(ServerPool::new(1, "cache0", 100)));
    let record = Rc::new(RefCell::new(ServerRecord::new(1, addr(11211), true, server_pool.clone())));

    let client = client_conn(1);
    let server = server_conn(2, &record);

    let req = pool.new_request(&client).unwrap();
    Connection::enqueue_outq(&client, &req);
    Connection::enqueue_outq(&server, &req);
    req.borrow_mut().verb = Verb::Get;

    let sink = RecordingSlowLogSink::default();
    let mut addr_cache = AddrCache::new();
    let mut parser = MemcachedReplyParser::new();

    let mut completed = Vec::new();
    receiver::on_readable(&server, &mut pool, &mut parser, b"VALUE foo 0 3\r\nbar\r\nEND\r\n", |m| {
        completed.push(m)
    })
    .unwrap();
    assert_eq!(completed.len(), 1);

    let now = tokio::time::Instant::now();
    let outcome = filter::filter_and_forward(&server, completed.remove(0), &mut pool, &sink, &mut addr_cache, now);
    assert_eq!(outcome, filter::Outcome::Forwarded);
    assert!(client.borrow().has_write_interest());
    assert_eq!(record.borrow().stats.responses, 1);
    assert_eq!(record.borrow().stats.response_bytes, "VALUE foo 0 3\r\nbar\r\nEND\r\n".len() as u64);

    let send_outcome = sender::next_to_send(&client, &mut pool, Protocol::Memcached, Some(&server_pool));
    let msg = match send_outcome {
        sender::SendOutcome::Message(m) => m,
        sender::SendOutcome::Nothing => panic!("expected the reply to be ready"),
    };
    assert_eq!(&msg.borrow().buf[..], b"VALUE foo 0 3\r\nbar\r\nEND\r\n");
    sender::send_done(&client, &mut pool, &msg);
    assert!(client.borrow().omsg_q.is_empty());
}

/// S2: a two-way fragmented `MGET` — both shard replies coalesce into
/// one reply on the client's out-queue, in fragment order regardless
/// of which shard answers first.
#[test]
fn s2_fragmented_request_coalesces_in_order() {
    let mut pool = MessagePool::new(32);
    let server_pool = Rc::new(RefCell::new(ServerPool::new(1, "cache0", 100)));
    let record_a = Rc::new(RefCell::new(ServerRecord::new(1, addr(11211), true, server_pool.clone())));
    let record_b = Rc::new(RefCell::new(ServerRecord::new(2, addr(11212), true, server_pool.clone())));

    let client = client_conn(1);
    let server_a = server_conn(2, &record_a);
    let server_b = server_conn(3, &record_b);

    let parent = pool.new_request(&client).unwrap();
    parent.borrow_mut().verb = Verb::MGet;
    Connection::enqueue_outq(&client, &parent);

    let group = Rc::new(RefCell::new(FragmentGroup::new(99, 2, Rc::downgrade(&parent))));
    parent.borrow_mut().frag_group = Some(group.clone());

    let frag_a = pool.new_request(&client).unwrap();
    frag_a.borrow_mut().frag_group = Some(group.clone());
    frag_a.borrow_mut().frag_index = 0;
    frag_a.borrow_mut().pre_coalesce = Some(make_pre_coalesce(group.clone(), 0));
    Connection::enqueue_outq(&server_a, &frag_a);
    group.borrow_mut().members.push(Rc::downgrade(&frag_a));

    let frag_b = pool.new_request(&client).unwrap();
    frag_b.borrow_mut().frag_group = Some(group.clone());
    frag_b.borrow_mut().frag_index = 1;
    frag_b.borrow_mut().pre_coalesce = Some(make_pre_coalesce(group.clone(), 1));
    Connection::enqueue_outq(&server_b, &frag_b);
    group.borrow_mut().members.push(Rc::downgrade(&frag_b));

    let sink = RecordingSlowLogSink::default();
    let mut addr_cache = AddrCache::new();
    let now = tokio::time::Instant::now();

    // Shard B answers first.
    let mut parser_b = MemcachedReplyParser::new();
    let mut completed_b = Vec::new();
    receiver::on_readable(&server_b, &mut pool, &mut parser_b, b"VALUE k2 0 2\r\nv2\r\nEND\r\n", |m| {
        completed_b.push(m)
    })
    .unwrap();
    filter::filter_and_forward(&server_b, completed_b.remove(0), &mut pool, &sink, &mut addr_cache, now);
    assert!(!parent.borrow().done, "parent must wait for both fragments");

    // Shard A answers second.
    let mut parser_a = MemcachedReplyParser::new();
    let mut completed_a = Vec::new();
    receiver::on_readable(&server_a, &mut pool, &mut parser_a, b"VALUE k1 0 2\r\nv1\r\nEND\r\n", |m| {
        completed_a.push(m)
    })
    .unwrap();
    filter::filter_and_forward(&server_a, completed_a.remove(0), &mut pool, &sink, &mut addr_cache, now);

    assert!(parent.borrow().done);
    assert!(client.borrow().has_write_interest());

    let outcome = sender::next_to_send(&client, &mut pool, Protocol::Memcached, Some(&server_pool));
    let coalesced = match outcome {
        sender::SendOutcome::Message(m) => m,
        sender::SendOutcome::Nothing => panic!("expected the coalesced reply"),
    };
    // Fragment order preserved (k1 before k2) even though B answered first.
    let body = coalesced.borrow().buf.to_vec();
    let body = String::from_utf8(body).unwrap();
    assert!(body.starts_with("VALUE k1"));
    assert!(body.contains("VALUE k2"));
    assert!(body.find("k1").unwrap() < body.find("k2").unwrap());

    sender::send_done(&client, &mut pool, &coalesced);
    assert!(client.borrow().omsg_q.is_empty());
}

/// S5: the server closes mid-reply; the partial reply is released and
/// every request still outstanding on that connection is torn down
/// with a synthesized error once the client's sender runs.
#[test]
fn s5_server_eof_mid_reply_synthesizes_errors() {
    let mut pool = MessagePool::new(16);
    let server_pool = Rc::new(RefCell::new(ServerPool::new(1, "cache0", 100)));
    let record = Rc::new(RefCell::new(ServerRecord::new(1, addr(11213), true, server_pool.clone())));

    let client = client_conn(1);
    let server = server_conn(2, &record);

    let req1 = pool.new_request(&client).unwrap();
    Connection::enqueue_outq(&client, &req1);
    Connection::enqueue_outq(&server, &req1);

    let req2 = pool.new_request(&client).unwrap();
    Connection::enqueue_outq(&client, &req2);
    Connection::enqueue_outq(&server, &req2);

    let mut parser = MemcachedReplyParser::new();
    receiver::on_readable(&server, &mut pool, &mut parser, b"VALUE foo 0 5\r\nba", |_| {}).unwrap();
    assert_eq!(pool.live_count(), 3); // two requests + one partial reply

    receiver::on_eof(&server, &mut pool);
    assert!(server.borrow().done);
    assert_eq!(pool.live_count(), 2); // partial reply released

    sender::drain_with_error(&server, &mut pool);
    assert!(server.borrow().omsg_q.is_empty());
    assert!(req1.borrow().done);
    assert!(req2.borrow().done);
    assert!(client.borrow().has_write_interest());

    let first = sender::next_to_send(&client, &mut pool, Protocol::Memcached, Some(&server_pool));
    let msg1 = match first {
        sender::SendOutcome::Message(m) => m,
        sender::SendOutcome::Nothing => panic!("expected a synthesized error"),
    };
    assert_ne!(msg1.borrow().err, ErrKind::None);
    sender::send_done(&client, &mut pool, &msg1);

    let second = sender::next_to_send(&client, &mut pool, Protocol::Memcached, Some(&server_pool));
    let msg2 = match second {
        sender::SendOutcome::Message(m) => m,
        sender::SendOutcome::Nothing => panic!("expected a synthesized error for the second request"),
    };
    sender::send_done(&client, &mut pool, &msg2);

    assert!(client.borrow().omsg_q.is_empty());
}
