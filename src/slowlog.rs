//! Slow-log record formatting and delivery (spec.md §4.4.3, §6, §9).
//!
//! Formatting must never block the response-forwarding path and must
//! never corrupt a key that's still live in a message's buffer, so
//! this always formats into an owned, scratch `String` rather than
//! writing a terminator into the shared buffer (spec.md §9).

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::sync::mpsc;

use crate::message::Verb;

fn verb_name(verb: Verb) -> &'static str {
    match verb {
        Verb::Get => "GET",
        Verb::Set => "SET",
        Verb::Delete => "DELETE",
        Verb::MGet => "MGET",
        Verb::Other => "OTHER",
    }
}

/// One slow-log line's worth of data, gathered by the filter/forwarder
/// at the point a request is known to be slow.
pub struct SlowLogRecord {
    pub request_msg_id: u64,
    pub client_address: Rc<str>,
    pub server_address: Rc<str>,
    pub cost_time_ms: u64,
    pub fragment_id: u64,
    pub request_type: Verb,
    pub request_len: u32,
    pub response_len: u32,
    pub key: Vec<u8>,
}

impl SlowLogRecord {
    /// Renders the exact wire format from spec.md §6, one
    /// newline-terminated line.
    pub fn format(&self) -> String {
        format!(
            "request_msg_id={}, client_address={}, server_address={}, \
             cost_time={}ms, fragment_id={}, request_type={}, \
             request_len {}, response_len {}, key='{}'\n",
            self.request_msg_id,
            self.client_address,
            self.server_address,
            self.cost_time_ms,
            self.fragment_id,
            verb_name(self.request_type),
            self.request_len,
            self.response_len,
            String::from_utf8_lossy(&self.key),
        )
    }
}

/// Caches the formatted `host:port` string per peer address so repeat
/// slow-log lines on a long-lived connection don't re-format it every
/// time (spec.md §4.4.3 "Address resolution is cached in static
/// buffers").
#[derive(Default)]
pub struct AddrCache {
    entries: HashMap<SocketAddr, Rc<str>>,
}

impl AddrCache {
    pub fn new() -> AddrCache {
        AddrCache::default()
    }

    pub fn resolve(&mut self, addr: SocketAddr) -> Rc<str> {
        self.entries
            .entry(addr)
            .or_insert_with(|| Rc::from(addr.to_string()))
            .clone()
    }
}

/// The non-blocking sink slow-log lines are handed to. Formatting runs
/// synchronously with response forwarding (spec.md §4.4.3); delivery
/// does not.
pub trait SlowLogSink {
    fn emit(&self, line: String);
}

/// Default sink: an unbounded channel drained by a background task,
/// the same shape hyper's `common::drain` uses to decouple a
/// synchronous call site from async delivery.
pub struct ChannelSlowLogSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSlowLogSink {
    pub fn new() -> (ChannelSlowLogSink, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSlowLogSink { tx }, rx)
    }
}

impl SlowLogSink for ChannelSlowLogSink {
    fn emit(&self, line: String) {
        // An unbounded send only fails if every receiver was dropped,
        // i.e. the drain task is gone; there is nothing left to do
        // with the line in that case.
        let _ = self.tx.send(line);
    }
}

/// A sink that just appends to a shared buffer, for tests that want to
/// assert on emitted lines without running a drain task.
#[derive(Clone, Default)]
pub struct RecordingSlowLogSink {
    pub lines: Rc<RefCell<Vec<String>>>,
}

impl SlowLogSink for RecordingSlowLogSink {
    fn emit(&self, line: String) {
        self.lines.borrow_mut().push(line);
    }
}
