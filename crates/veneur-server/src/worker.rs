// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation workers.
//!
//! Each worker exclusively owns one shard of accumulators, so the hot path
//! takes no locks: samples, forwarded merges, and snapshot requests all
//! arrive over the same channel, which makes the snapshot swap a
//! linearization point — no sample sent before the snapshot request can
//! land in the post-swap map, and none sent after can land in the prior one.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use veneur_statsd::{Metric, MetricKey, Scope};

use crate::accumulator::{Accumulator, AccumulatorState, WindowEntry};
use crate::telemetry::Counters;

/// Bound on each worker's ingress channel. Overflow drops the newest sample
/// and increments the ingest-overflow counter: liveness over durability.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8192;

/// How many drained maps a worker keeps around for reuse.
const MAX_SPARE_MAPS: usize = 2;

pub type SnapshotMap = HashMap<MetricKey, WindowEntry>;

#[derive(Debug)]
pub enum WorkerMessage {
    Sample(Metric),
    /// Forwarded accumulator state from a peer, merged into the current
    /// window.
    Merge {
        key: MetricKey,
        state: AccumulatorState,
    },
    /// Swap the accumulator map and reply with the prior window.
    Snapshot(oneshot::Sender<SnapshotMap>),
    /// A drained map coming back from the coordinator for reuse.
    Reclaim(SnapshotMap),
    Shutdown,
}

/// Cheap-to-clone ingress handle for one worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerMessage>,
    counters: Arc<Counters>,
}

impl WorkerHandle {
    /// Non-blocking submit. A full channel drops the sample.
    pub fn submit(&self, metric: Metric) {
        if self.tx.try_send(WorkerMessage::Sample(metric)).is_err() {
            Counters::incr(&self.counters.ingest_overflow);
        }
    }

    /// Non-blocking merge of forwarded state. A full channel drops it.
    pub fn merge(&self, key: MetricKey, state: AccumulatorState) {
        if self
            .tx
            .try_send(WorkerMessage::Merge { key, state })
            .is_err()
        {
            Counters::incr(&self.counters.import_errors);
        }
    }

    /// Rotates the worker's accumulator map and returns the prior window.
    /// Returns an empty map if the worker is gone.
    pub async fn snapshot(&self) -> SnapshotMap {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(WorkerMessage::Snapshot(reply_tx))
            .await
            .is_err()
        {
            return SnapshotMap::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Hands a drained map back for reuse. Best-effort.
    pub fn reclaim(&self, map: SnapshotMap) {
        let _ = self.tx.try_send(WorkerMessage::Reclaim(map));
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(WorkerMessage::Shutdown).await;
    }
}

/// One accumulator shard plus its ingress. Run with `tokio::spawn(w.run())`.
pub struct Worker {
    rx: mpsc::Receiver<WorkerMessage>,
    accumulators: SnapshotMap,
    spare: Vec<SnapshotMap>,
    percentile_tolerance: f64,
    flush_interval: Duration,
    counters: Arc<Counters>,
}

impl Worker {
    pub fn new(
        percentile_tolerance: f64,
        flush_interval: Duration,
        counters: Arc<Counters>,
    ) -> (Worker, WorkerHandle) {
        Self::with_capacity(
            percentile_tolerance,
            flush_interval,
            counters,
            DEFAULT_CHANNEL_CAPACITY,
        )
    }

    pub fn with_capacity(
        percentile_tolerance: f64,
        flush_interval: Duration,
        counters: Arc<Counters>,
        capacity: usize,
    ) -> (Worker, WorkerHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        let worker = Worker {
            rx,
            accumulators: SnapshotMap::new(),
            spare: Vec::new(),
            percentile_tolerance,
            flush_interval,
            counters: Arc::clone(&counters),
        };
        let handle = WorkerHandle { tx, counters };
        (worker, handle)
    }

    pub async fn run(mut self) {
        debug!("worker started");
        while let Some(message) = self.rx.recv().await {
            if matches!(message, WorkerMessage::Shutdown) {
                break;
            }
            // A panic while folding one sample loses this shard's current
            // window, not the process: the shard is cleared and the worker
            // keeps consuming.
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| self.handle_message(message)));
            if result.is_err() {
                error!("worker panicked while handling a message; dropping current shard");
                self.accumulators.clear();
            }
        }
        debug!("worker stopped");
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Sample(metric) => self.fold(metric),
            WorkerMessage::Merge { key, state } => self.merge(key, state),
            WorkerMessage::Snapshot(reply) => {
                let fresh = self.spare.pop().unwrap_or_default();
                let prior = std::mem::replace(&mut self.accumulators, fresh);
                if reply.send(prior).is_err() {
                    warn!("snapshot receiver dropped; discarding window");
                }
            }
            WorkerMessage::Reclaim(mut map) => {
                if self.spare.len() < MAX_SPARE_MAPS {
                    map.clear();
                    self.spare.push(map);
                }
            }
            // Handled in run().
            WorkerMessage::Shutdown => {}
        }
    }

    fn fold(&mut self, metric: Metric) {
        if let Some(ts) = metric.timestamp {
            // Client timestamps outside the current window are clipped into
            // it; we only record that it happened.
            let now = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let interval = self.flush_interval.as_secs() as i64;
            let window_start = now / interval * interval;
            if ts < window_start || ts >= window_start + interval {
                Counters::incr(&self.counters.late_samples);
            }
        }

        let entry = match self.accumulators.entry(metric.key()) {
            std::collections::hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
            std::collections::hash_map::Entry::Vacant(vacant) => {
                let accumulator = match Accumulator::new(metric.kind, self.percentile_tolerance) {
                    Ok(accumulator) => accumulator,
                    Err(e) => {
                        error!("cannot create accumulator: {e}");
                        return;
                    }
                };
                vacant.insert(WindowEntry {
                    scope: metric.scope,
                    accumulator,
                })
            }
        };
        entry.scope = metric.scope;
        entry.accumulator.update(&metric.value, metric.sample_rate);
    }

    fn merge(&mut self, key: MetricKey, state: AccumulatorState) {
        match self.accumulators.get_mut(&key) {
            Some(entry) => {
                if let Err(e) = entry.accumulator.merge_state(state) {
                    Counters::incr(&self.counters.import_errors);
                    warn!("dropping forwarded state for {}: {e}", key.name);
                }
            }
            None => {
                // Merged results are exported as Local on our next flush.
                self.accumulators.insert(
                    key,
                    WindowEntry {
                        scope: Scope::Local,
                        accumulator: Accumulator::from_state(state),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{PointValue, SeriesPoint};
    use veneur_statsd::parse;

    const TOLERANCE: f64 = 0.01;
    const INTERVAL: Duration = Duration::from_secs(10);

    fn spawn_worker() -> (WorkerHandle, tokio::task::JoinHandle<()>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let (worker, handle) = Worker::new(TOLERANCE, INTERVAL, Arc::clone(&counters));
        let task = tokio::spawn(worker.run());
        (handle, task, counters)
    }

    fn export(entry: &WindowEntry, name: &str) -> Vec<SeriesPoint> {
        let mut out = Vec::new();
        entry.accumulator.export(
            name,
            &veneur_statsd::SortedTags::default(),
            0,
            INTERVAL,
            &[0.5],
            &mut out,
        );
        out
    }

    #[tokio::test]
    async fn test_fold_matches_sequential_fold() {
        let (handle, task, _) = spawn_worker();

        for line in ["a:1|c", "b:5|g", "a:2|c", "b:7|g", "a:3|c"] {
            handle.submit(parse(line).unwrap());
        }
        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.len(), 2);

        let a = snapshot
            .get(&parse("a:0|c").unwrap().key())
            .expect("counter accumulator");
        assert_eq!(export(a, "a")[0].value, PointValue::Float(0.6));

        let b = snapshot
            .get(&parse("b:0|g").unwrap().key())
            .expect("gauge accumulator");
        assert_eq!(export(b, "b")[0].value, PointValue::Float(7.0));

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_is_a_linearization_point() {
        let (handle, task, _) = spawn_worker();

        for _ in 0..3 {
            handle.submit(parse("n:1|c").unwrap());
        }
        let first = handle.snapshot().await;

        for _ in 0..2 {
            handle.submit(parse("n:1|c").unwrap());
        }
        let second = handle.snapshot().await;

        let key = parse("n:0|c").unwrap().key();
        let sum_of = |snapshot: &SnapshotMap| match snapshot.get(&key) {
            Some(WindowEntry {
                accumulator: Accumulator::Counter { sum },
                ..
            }) => *sum,
            _ => 0.0,
        };
        // Exactly 3 before the swap, exactly 2 after: nothing crossed.
        assert_eq!(sum_of(&first), 3.0);
        assert_eq!(sum_of(&second), 2.0);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_overflow_drops_newest_and_counts() {
        let counters = Arc::new(Counters::default());
        // Worker never runs, so the 2-slot channel fills immediately.
        let (_worker, handle) =
            Worker::with_capacity(TOLERANCE, INTERVAL, Arc::clone(&counters), 2);

        for _ in 0..5 {
            handle.submit(parse("x:1|c").unwrap());
        }
        assert_eq!(counters.snapshot().ingest_overflow, 3);
    }

    #[tokio::test]
    async fn test_merge_into_current_window() {
        let (handle, task, _) = spawn_worker();

        handle.submit(parse("req:4|c").unwrap());
        // Same channel as the sample, so the merge is applied after it.
        let key = parse("req:0|c").unwrap().key();
        handle.merge(key.clone(), AccumulatorState::Counter { sum: 6.0 });

        let snapshot = handle.snapshot().await;
        match snapshot.get(&key) {
            Some(WindowEntry {
                accumulator: Accumulator::Counter { sum },
                scope,
            }) => {
                assert_eq!(*sum, 10.0);
                assert_eq!(*scope, Scope::Local);
            }
            other => panic!("unexpected entry: {other:?}"),
        }

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_without_existing_entry_rehydrates() {
        let (handle, task, _) = spawn_worker();

        let key = parse("remote:0|g").unwrap().key();
        handle.merge(key.clone(), AccumulatorState::Gauge { value: 42.0 });

        let snapshot = handle.snapshot().await;
        match snapshot.get(&key) {
            Some(WindowEntry {
                accumulator: Accumulator::Gauge { value },
                scope,
            }) => {
                assert_eq!(*value, 42.0);
                assert_eq!(*scope, Scope::Local);
            }
            other => panic!("unexpected entry: {other:?}"),
        }

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_kind_mismatch_counts_import_error() {
        let (handle, task, counters) = spawn_worker();

        handle.submit(parse("req:1|c").unwrap());
        let key = parse("req:0|c").unwrap().key();
        handle.merge(key, AccumulatorState::Gauge { value: 1.0 });

        let _ = handle.snapshot().await;
        assert_eq!(counters.snapshot().import_errors, 1);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_sample_is_counted() {
        let (handle, task, counters) = spawn_worker();

        handle.submit(parse("old:1|c|T1000000").unwrap());
        let _ = handle.snapshot().await;
        assert_eq!(counters.snapshot().late_samples, 1);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reclaimed_map_is_reused_empty() {
        let (handle, task, _) = spawn_worker();

        handle.submit(parse("a:1|c").unwrap());
        let map = handle.snapshot().await;
        assert_eq!(map.len(), 1);
        handle.reclaim(map);

        handle.submit(parse("b:1|c").unwrap());
        let map = handle.snapshot().await;
        // Only the new window's contents, nothing recycled leaks through.
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&parse("b:0|c").unwrap().key()));

        handle.shutdown().await;
        task.await.unwrap();
    }
}
