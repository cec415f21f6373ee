// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The flush coordinator: drives the wall-clock tick, harvests worker
//! snapshots, derives the exported batch, forwards Global accumulators,
//! and hands the batch to the sink dispatcher.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use veneur_statsd::{Scope, SortedTags};

use crate::accumulator::SeriesPoint;
use crate::forward::{ForwardClient, ForwardEntry};
use crate::sinks::SinkDispatcher;
use crate::spans::{SpanAggregator, SpanFlusher};
use crate::telemetry::Counters;
use crate::worker::WorkerHandle;

pub struct FlushCoordinator {
    workers: Vec<WorkerHandle>,
    interval: Duration,
    quantiles: Vec<f64>,
    /// `host:` plus the configured global tags, merged into every Local
    /// series. Sample tags win on collision.
    base_tags: SortedTags,
    forward: Option<ForwardClient>,
    dispatcher: SinkDispatcher,
    span_flusher: Option<SpanFlusher>,
    counters: Arc<Counters>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl FlushCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workers: Vec<WorkerHandle>,
        interval: Duration,
        quantiles: Vec<f64>,
        base_tags: SortedTags,
        forward: Option<ForwardClient>,
        dispatcher: SinkDispatcher,
        span_flusher: Option<SpanFlusher>,
        counters: Arc<Counters>,
    ) -> FlushCoordinator {
        FlushCoordinator {
            workers,
            interval,
            quantiles,
            base_tags,
            forward,
            dispatcher,
            span_flusher,
            counters,
        }
    }

    /// Runs ticks aligned to wall-clock multiples of the flush interval
    /// until cancelled, then performs one final flush and drains the sinks.
    pub async fn run(mut self, cancel: CancellationToken) {
        let interval_secs = self.interval.as_secs() as i64;
        let until_boundary = interval_secs - (unix_now() % interval_secs);
        let first_tick = Instant::now() + Duration::from_secs(until_boundary as u64);
        let mut ticker = interval_at(first_tick, self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("shutdown: running final flush");
                    self.flush_once().await;
                    self.dispatcher.drain().await;
                    break;
                }
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
            }
        }
        debug!("flush coordinator stopped");
    }

    /// One complete flush pass. The per-worker snapshot swap itself is a
    /// map rotation inside the worker; everything here runs on the already
    /// detached window while workers keep ingesting into the new one.
    pub async fn flush_once(&mut self) {
        let now = unix_now();
        let interval_secs = self.interval.as_secs() as i64;
        let window_end = now - now.rem_euclid(interval_secs);

        let snapshots = join_all(self.workers.iter().map(|w| w.snapshot())).await;

        let mut points: Vec<SeriesPoint> = Vec::new();
        let mut forward_entries: Vec<ForwardEntry> = Vec::new();
        let forwarding = self.forward.is_some();

        for (index, mut snapshot) in snapshots.into_iter().enumerate() {
            for (key, entry) in snapshot.drain() {
                match entry.scope {
                    // Without a forward peer, Global metrics degrade to
                    // host-local aggregation rather than vanishing.
                    Scope::Global if forwarding => {
                        forward_entries
                            .push(ForwardEntry::new(&key, entry.accumulator.into_state()));
                    }
                    _ => {
                        entry.accumulator.export(
                            key.name.as_str(),
                            &key.tags.merged_with(&self.base_tags),
                            window_end,
                            self.interval,
                            &self.quantiles,
                            &mut points,
                        );
                    }
                }
            }
            self.workers[index].reclaim(snapshot);
        }

        if !forward_entries.is_empty() {
            if let Some(client) = &self.forward {
                if let Err(e) = client.forward(&forward_entries).await {
                    Counters::incr(&self.counters.forward_errors);
                    error!(
                        "forward failed, dropping {} global accumulators for this tick: {e}",
                        forward_entries.len()
                    );
                }
            }
        }

        if let Some(span_flusher) = &self.span_flusher {
            span_flusher.flush().await;
        }

        if !points.is_empty() {
            debug!("dispatching {} derived points", points.len());
            self.dispatcher.dispatch(Arc::new(points));
        }
    }

    /// Waits for the in-flight sink flushes started by the last tick.
    pub async fn drain_sinks(&mut self) {
        self.dispatcher.drain().await;
    }
}

/// Convenience constructor for the optional span leg of the coordinator.
pub fn span_flusher_from_config(
    aggregator: Option<Arc<Mutex<SpanAggregator>>>,
    trace_address: &str,
    deadline: Duration,
    counters: Arc<Counters>,
) -> Option<SpanFlusher> {
    let aggregator = aggregator?;
    if trace_address.is_empty() {
        return None;
    }
    match SpanFlusher::new(aggregator, trace_address, deadline, counters) {
        Ok(flusher) => Some(flusher),
        Err(e) => {
            error!("cannot construct span flusher: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::PointValue;
    use crate::sinks::{Batch, ChannelSink, SinkDispatcher};
    use crate::worker::Worker;
    use veneur_statsd::parse;

    const TOLERANCE: f64 = 0.01;
    const INTERVAL: Duration = Duration::from_secs(10);

    struct Fixture {
        coordinator: FlushCoordinator,
        handles: Vec<WorkerHandle>,
        rx: tokio::sync::mpsc::UnboundedReceiver<Batch>,
        counters: Arc<Counters>,
    }

    fn fixture(forward: Option<ForwardClient>) -> Fixture {
        let counters = Arc::new(Counters::default());
        let mut handles = Vec::new();
        for _ in 0..2 {
            let (worker, handle) = Worker::new(TOLERANCE, INTERVAL, Arc::clone(&counters));
            tokio::spawn(worker.run());
            handles.push(handle);
        }
        let (sink, rx) = ChannelSink::new("capture");
        let dispatcher = SinkDispatcher::new(
            vec![Arc::new(sink)],
            Duration::from_secs(5),
            Arc::clone(&counters),
        );
        let base_tags = SortedTags::from_strings(&["host:test-host".to_string()]).unwrap();
        let coordinator = FlushCoordinator::new(
            handles.clone(),
            INTERVAL,
            vec![0.5, 0.99],
            base_tags,
            forward,
            dispatcher,
            None,
            Arc::clone(&counters),
        );
        Fixture {
            coordinator,
            handles,
            rx,
            counters,
        }
    }

    fn submit(handles: &[WorkerHandle], line: &str) {
        let metric = parse(line).unwrap();
        let index = (metric.key().digest() % handles.len() as u64) as usize;
        handles[index].submit(metric);
    }

    async fn next_batch(fx: &mut Fixture) -> Batch {
        fx.coordinator.flush_once().await;
        fx.coordinator.dispatcher.drain().await;
        fx.rx.recv().await.expect("a batch should arrive")
    }

    #[tokio::test]
    async fn test_flush_exports_local_series_with_host_tag() {
        let mut fx = fixture(None);
        submit(&fx.handles, "foo:1|c");
        submit(&fx.handles, "foo:2|c");
        submit(&fx.handles, "foo:3|c");

        let batch = next_batch(&mut fx).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, "foo");
        assert_eq!(batch[0].value, PointValue::Float(0.6));
        assert_eq!(batch[0].tags.get("host").unwrap().as_str(), "test-host");
        assert_eq!(batch[0].timestamp % 10, 0);
    }

    #[tokio::test]
    async fn test_flush_clears_window() {
        let mut fx = fixture(None);
        submit(&fx.handles, "foo:1|c");
        let batch = next_batch(&mut fx).await;
        assert_eq!(batch.len(), 1);

        // Nothing new arrived; the next flush must dispatch nothing.
        fx.coordinator.flush_once().await;
        fx.coordinator.dispatcher.drain().await;
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_global_without_forward_exports_locally() {
        let mut fx = fixture(None);
        submit(&fx.handles, "req:1|c|#scope:global");

        let batch = next_batch(&mut fx).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, "req");
    }

    #[tokio::test]
    async fn test_forward_failure_counts_and_drops() {
        // Nothing listens on this port; the POST fails fast.
        let client = ForwardClient::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        let mut fx = fixture(Some(client));
        submit(&fx.handles, "req:1|c|#scope:global");
        submit(&fx.handles, "ok:1|c");

        let batch = next_batch(&mut fx).await;
        // The local counter still exports; the global one was dropped.
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, "ok");
        assert_eq!(fx.counters.snapshot().forward_errors, 1);
    }

    #[tokio::test]
    async fn test_multiple_kinds_in_one_flush() {
        let mut fx = fixture(None);
        submit(&fx.handles, "c:1|c");
        submit(&fx.handles, "g:5|g");
        submit(&fx.handles, "g:2|g");
        submit(&fx.handles, "users:alice|s");
        submit(&fx.handles, "users:bob|s");

        let batch = next_batch(&mut fx).await;
        let mut names: Vec<&str> = batch.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["c", "g", "users.count"]);

        let gauge = batch.iter().find(|p| p.name == "g").unwrap();
        assert_eq!(gauge.value, PointValue::Float(2.0));
    }
}
