// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sink interface and the parallel dispatcher.
//!
//! Sinks are open polymorphism — the set is configuration-driven — behind a
//! uniform `flush(batch, deadline)`. The dispatcher fans a tick's batch out
//! to every sink concurrently, bounded by a per-sink deadline. A sink that
//! is still flushing the previous batch when the next tick arrives has the
//! new batch dropped: liveness over durability.

mod debug;
mod http;

pub use debug::DebugSink;
pub use http::HttpSink;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::accumulator::SeriesPoint;
use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::telemetry::Counters;

/// A derived batch, shared by all sinks for one tick.
pub type Batch = Arc<Vec<SeriesPoint>>;

#[async_trait]
pub trait MetricSink: Send + Sync {
    fn name(&self) -> &str;

    /// Ships one batch. Implementations own their batching/retry policy but
    /// must return within `deadline`; the dispatcher also enforces it from
    /// the outside.
    async fn flush(&self, batch: Batch, deadline: Duration) -> Result<(), SinkError>;
}

/// Builds the configured sink list.
pub fn from_config(
    configs: &[SinkConfig],
    deadline: Duration,
) -> Result<Vec<Arc<dyn MetricSink>>, SinkError> {
    let mut sinks: Vec<Arc<dyn MetricSink>> = Vec::with_capacity(configs.len());
    for config in configs {
        match config {
            SinkConfig::Debug => sinks.push(Arc::new(DebugSink::new())),
            SinkConfig::Http { endpoint } => {
                sinks.push(Arc::new(HttpSink::new(endpoint.clone(), deadline)?));
            }
        }
    }
    Ok(sinks)
}

struct SinkSlot {
    sink: Arc<dyn MetricSink>,
    inflight: Option<JoinHandle<()>>,
}

/// Fans batches out to all sinks, tracking one in-flight flush per sink.
pub struct SinkDispatcher {
    slots: Vec<SinkSlot>,
    deadline: Duration,
    counters: Arc<Counters>,
}

impl SinkDispatcher {
    pub fn new(
        sinks: Vec<Arc<dyn MetricSink>>,
        deadline: Duration,
        counters: Arc<Counters>,
    ) -> SinkDispatcher {
        SinkDispatcher {
            slots: sinks
                .into_iter()
                .map(|sink| SinkSlot {
                    sink,
                    inflight: None,
                })
                .collect(),
            deadline,
            counters,
        }
    }

    /// Starts one flush per idle sink. Busy sinks drop this batch.
    pub fn dispatch(&mut self, batch: Batch) {
        for slot in &mut self.slots {
            if let Some(handle) = &slot.inflight {
                if !handle.is_finished() {
                    Counters::incr(&self.counters.sink_drops);
                    warn!(
                        "sink {} still flushing previous batch; dropping {} points",
                        slot.sink.name(),
                        batch.len()
                    );
                    continue;
                }
            }

            let sink = Arc::clone(&slot.sink);
            let counters = Arc::clone(&self.counters);
            let deadline = self.deadline;
            let batch = Arc::clone(&batch);
            slot.inflight = Some(tokio::spawn(async move {
                let result = tokio::time::timeout(deadline, sink.flush(batch, deadline)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        Counters::incr(&counters.sink_errors);
                        error!("sink {} failed: {e}", sink.name());
                    }
                    Err(_) => {
                        Counters::incr(&counters.sink_errors);
                        error!("sink {} exceeded its {deadline:?} deadline", sink.name());
                    }
                }
            }));
        }
    }

    /// Waits for all in-flight flushes, used by the final shutdown flush.
    /// Each flush is already deadline-bounded, so this cannot hang.
    pub async fn drain(&mut self) {
        for slot in &mut self.slots {
            if let Some(handle) = slot.inflight.take() {
                let _ = handle.await;
            }
        }
    }

    pub fn sink_count(&self) -> usize {
        self.slots.len()
    }
}

/// A sink that hands batches to a channel; test plumbing, mirroring the
/// in-tree test-support modules the service crates use.
pub struct ChannelSink {
    name: String,
    tx: tokio::sync::mpsc::UnboundedSender<Batch>,
}

impl ChannelSink {
    pub fn new(name: &str) -> (ChannelSink, tokio::sync::mpsc::UnboundedReceiver<Batch>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            ChannelSink {
                name: name.to_string(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl MetricSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn flush(&self, batch: Batch, _deadline: Duration) -> Result<(), SinkError> {
        self.tx
            .send(batch)
            .map_err(|_| SinkError::Status(0))
    }
}
