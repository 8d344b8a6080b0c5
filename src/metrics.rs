//! Stats accounting (spec.md §4.4.3, §6 "Consumed from metrics sink").
//!
//! The sink itself (an aggregation pipeline that ships counters off to
//! whatever observability backend the proxy reports to) is an external
//! collaborator; what lives here is the part the response core owns:
//! the cumulative latency-bucket histogram and the plain counters
//! `stats_server_incr`/`stats_pool_incr` would bump.

/// Ascending bucket floors, milliseconds (spec.md §4.4.3, §6).
pub const BUCKET_MS: [u64; 6] = [10, 20, 50, 100, 200, 500];

/// Costs above this are ignored entirely (spec.md §4.4.3).
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// One histogram, either `l` (local) or `x` (cross-IDC) per spec.md §6.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyBuckets {
    pub counts: [u64; BUCKET_MS.len()],
}

impl LatencyBuckets {
    /// Increment every bucket whose floor is `<= cost_ms`, ascending,
    /// stopping at the first bucket whose floor exceeds `cost_ms`
    /// (spec.md §9 "cumulative buckets", §8 boundary behaviors: a cost
    /// of exactly a floor value falls into that bucket, not the one
    /// below; anything over `MAX_TIMEOUT_MS` increments nothing).
    /// Returns the indices that were incremented, in ascending order,
    /// so a caller can emit each one's named metric (spec.md §6) to the
    /// sink without re-deriving which buckets fired.
    pub fn record(&mut self, cost_ms: u64) -> Vec<usize> {
        let mut incremented = Vec::new();
        if cost_ms > MAX_TIMEOUT_MS {
            return incremented;
        }
        for (i, &floor) in BUCKET_MS.iter().enumerate() {
            if floor <= cost_ms {
                self.counts[i] += 1;
                incremented.push(i);
            } else {
                break;
            }
        }
        incremented
    }

    /// Metric name for one bucket, e.g. `lrequest_gt_100ms` or
    /// `xrequest_gt_10ms` (spec.md §6).
    pub fn metric_name(local_idc: bool, bucket_index: usize) -> String {
        format!(
            "{}request_gt_{}ms",
            if local_idc { "l" } else { "x" },
            BUCKET_MS[bucket_index]
        )
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub responses: u64,
    pub response_bytes: u64,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub forward_error: u64,
    pub local: LatencyBuckets,
    pub cross: LatencyBuckets,
}
