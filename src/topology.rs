//! Topology layer: the mapping from `conn -> server -> server_pool`
//! that spec.md §6 lists as consumed, not designed, here. This module
//! carries just enough of it — server health bookkeeping, per-server
//! and per-pool stats, and slow-log configuration — for the response
//! core to have something real to mutate. Shard selection and the Lua
//! topology refresh that would populate a full fleet of these records
//! are out of scope (spec.md §1).

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use tracing::trace;

use crate::metrics::{LatencyBuckets, PoolStats, ServerStats};

/// A pool groups servers that shard one logical keyspace and carries
/// the slow-log policy spec.md §4.4.3 and §6 attribute to "the pool's
/// configuration".
pub struct ServerPool {
    pub id: u64,
    pub name: String,
    pub slowlog_enabled: bool,
    pub slowlog_slower_than_ms: u64,
    pub stats: PoolStats,
}

impl ServerPool {
    pub fn new(id: u64, name: impl Into<String>, slowlog_slower_than_ms: u64) -> ServerPool {
        ServerPool {
            id,
            name: name.into(),
            slowlog_enabled: true,
            slowlog_slower_than_ms,
            stats: PoolStats::default(),
        }
    }

    pub fn is_slow(&self, cost_ms: u64) -> bool {
        self.slowlog_enabled && cost_ms >= self.slowlog_slower_than_ms
    }

    /// Records `cost_ms` into the right IDC histogram and emits the
    /// named `stats_pool_incr` metric (spec.md §6 "Latency bucket
    /// metric names") for every bucket that fired.
    pub fn record_latency(&mut self, local_idc: bool, cost_ms: u64) {
        let incremented = {
            let buckets: &mut LatencyBuckets = if local_idc {
                &mut self.stats.local
            } else {
                &mut self.stats.cross
            };
            buckets.record(cost_ms)
        };
        for bucket_index in incremented {
            trace!(
                metric = %LatencyBuckets::metric_name(local_idc, bucket_index),
                pool = %self.name,
                "stats_pool_incr"
            );
        }
    }
}

/// One backend server connections are forwarded to.
pub struct ServerRecord {
    pub id: u64,
    pub addr: SocketAddr,
    /// Whether this server is in the same inter-data-center zone as
    /// the proxy (spec.md glossary "Local IDC / Cross-IDC").
    pub local_idc: bool,
    pub pool: Rc<RefCell<ServerPool>>,
    pub stats: ServerStats,
    healthy: bool,
    consecutive_failures: u32,
}

impl ServerRecord {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        local_idc: bool,
        pool: Rc<RefCell<ServerPool>>,
    ) -> ServerRecord {
        ServerRecord {
            id,
            addr,
            local_idc,
            pool,
            stats: ServerStats::default(),
            healthy: true,
            consecutive_failures: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Reset on every successful reply (spec.md §4.2): a reply is
    /// implicit proof of liveness, independent of whatever heartbeat
    /// or backoff mechanism the (external) timer wheel runs.
    pub fn mark_healthy(&mut self) {
        self.healthy = true;
        self.consecutive_failures = 0;
    }

    pub fn mark_failed(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= 3 {
            self.healthy = false;
        }
    }

    /// `server.responses` / `server.response_bytes` (spec.md §4.4.2
    /// step 10).
    pub fn record_response(&mut self, msgsize: u64) {
        self.stats.responses += 1;
        self.stats.response_bytes += msgsize;
    }
}
