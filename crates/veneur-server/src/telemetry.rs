// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide instrumentation counters.
///
/// These are the only mutable state shared across tasks besides the worker
/// channels themselves. All updates are relaxed atomic adds; the admin
/// endpoint reads a snapshot with no synchronization beyond the atomics.
#[derive(Debug, Default)]
pub struct Counters {
    pub packets: AtomicU64,
    pub samples: AtomicU64,
    pub parse_errors: AtomicU64,
    pub ingest_overflow: AtomicU64,
    pub oversize_packets: AtomicU64,
    pub late_samples: AtomicU64,
    pub import_errors: AtomicU64,
    pub forward_errors: AtomicU64,
    pub sink_errors: AtomicU64,
    pub sink_drops: AtomicU64,
    pub spans_received: AtomicU64,
    pub spans_dropped: AtomicU64,
    pub span_flush_errors: AtomicU64,
}

/// Point-in-time view of [`Counters`], served as JSON by the admin endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub packets: u64,
    pub samples: u64,
    pub parse_errors: u64,
    pub ingest_overflow: u64,
    pub oversize_packets: u64,
    pub late_samples: u64,
    pub import_errors: u64,
    pub forward_errors: u64,
    pub sink_errors: u64,
    pub sink_drops: u64,
    pub spans_received: u64,
    pub spans_dropped: u64,
    pub span_flush_errors: u64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            ingest_overflow: self.ingest_overflow.load(Ordering::Relaxed),
            oversize_packets: self.oversize_packets.load(Ordering::Relaxed),
            late_samples: self.late_samples.load(Ordering::Relaxed),
            import_errors: self.import_errors.load(Ordering::Relaxed),
            forward_errors: self.forward_errors.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            sink_drops: self.sink_drops.load(Ordering::Relaxed),
            spans_received: self.spans_received.load(Ordering::Relaxed),
            spans_dropped: self.spans_dropped.load(Ordering::Relaxed),
            span_flush_errors: self.span_flush_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let counters = Counters::default();
        Counters::incr(&counters.parse_errors);
        Counters::add(&counters.samples, 5);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.parse_errors, 1);
        assert_eq!(snapshot.samples, 5);
        assert_eq!(snapshot.packets, 0);
    }
}
