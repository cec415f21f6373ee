// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The trace span data path.
//!
//! Spans arrive as single-datagram protobuf frames on a dedicated socket,
//! never touching the metric workers. Each decoded span is owned by the
//! listener task until it lands in the FIFO span buffer; the buffer evicts
//! oldest-first when full and is drained once per tick toward the
//! configured trace endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::telemetry::Counters;

/// Maximum spans buffered between ticks before oldest-first eviction.
pub const MAX_BUFFERED_SPANS: usize = 10_000;

/// One trace span as it appears on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct Span {
    #[prost(int64, tag = "1")]
    pub trace_id: i64,
    #[prost(int64, tag = "2")]
    pub parent_id: i64,
    #[prost(int64, tag = "3")]
    pub span_id: i64,
    /// Start of the span, unix nanoseconds.
    #[prost(int64, tag = "4")]
    pub start_ns: i64,
    /// End of the span, unix nanoseconds.
    #[prost(int64, tag = "5")]
    pub end_ns: i64,
    #[prost(string, tag = "6")]
    pub resource: String,
    #[prost(map = "string, string", tag = "7")]
    pub tags: HashMap<String, String>,
}

/// The frame shipped to the trace endpoint each tick.
#[derive(Clone, PartialEq, Message)]
pub struct SpanBatch {
    #[prost(message, repeated, tag = "1")]
    pub spans: Vec<Span>,
}

/// FIFO buffer of spans awaiting the next tick.
pub struct SpanAggregator {
    queue: VecDeque<Span>,
    max_items: usize,
    counters: Arc<Counters>,
}

impl SpanAggregator {
    pub fn new(counters: Arc<Counters>) -> SpanAggregator {
        Self::with_capacity(MAX_BUFFERED_SPANS, counters)
    }

    pub fn with_capacity(max_items: usize, counters: Arc<Counters>) -> SpanAggregator {
        SpanAggregator {
            queue: VecDeque::new(),
            max_items,
            counters,
        }
    }

    /// Buffers a span, evicting the oldest one if the queue is full.
    pub fn add(&mut self, span: Span) {
        if self.queue.len() >= self.max_items {
            if self.queue.pop_front().is_some() {
                Counters::incr(&self.counters.spans_dropped);
                warn!(
                    "span buffer full ({} items), dropping oldest span",
                    self.max_items
                );
            }
        }
        self.queue.push_back(span);
    }

    /// Takes everything buffered so far.
    pub fn drain(&mut self) -> Vec<Span> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The UDP span listener. One datagram is one encoded span.
pub struct SpanIngest {
    socket: UdpSocket,
    aggregator: Arc<Mutex<SpanAggregator>>,
    counters: Arc<Counters>,
    max_packet_size: usize,
    cancel: CancellationToken,
}

impl SpanIngest {
    pub fn new(
        socket: UdpSocket,
        aggregator: Arc<Mutex<SpanAggregator>>,
        counters: Arc<Counters>,
        max_packet_size: usize,
        cancel: CancellationToken,
    ) -> SpanIngest {
        SpanIngest {
            socket,
            aggregator,
            counters,
            max_packet_size,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut buf = vec![0u8; self.max_packet_size + 1];
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, src) = match received {
                Ok(received) => received,
                Err(e) => {
                    error!("span receive error: {e}");
                    continue;
                }
            };
            if len > self.max_packet_size {
                Counters::incr(&self.counters.oversize_packets);
                warn!("dropping oversize span frame from {src}");
                continue;
            }
            match Span::decode(&buf[..len]) {
                Ok(span) => {
                    Counters::incr(&self.counters.spans_received);
                    self.aggregator.lock().await.add(span);
                }
                Err(e) => {
                    Counters::incr(&self.counters.parse_errors);
                    warn!("undecodable span frame from {src}: {e}");
                }
            }
        }
        debug!("span ingest stopped");
    }
}

/// Ships the buffered spans to the trace endpoint once per tick. No retry;
/// a failed tick's spans are counted and gone.
pub struct SpanFlusher {
    aggregator: Arc<Mutex<SpanAggregator>>,
    client: reqwest::Client,
    endpoint: String,
    counters: Arc<Counters>,
}

impl SpanFlusher {
    pub fn new(
        aggregator: Arc<Mutex<SpanAggregator>>,
        endpoint: &str,
        deadline: Duration,
        counters: Arc<Counters>,
    ) -> Result<SpanFlusher, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(deadline).build()?;
        Ok(SpanFlusher {
            aggregator,
            client,
            endpoint: endpoint.to_string(),
            counters,
        })
    }

    pub async fn flush(&self) {
        let spans = self.aggregator.lock().await.drain();
        if spans.is_empty() {
            return;
        }
        let count = spans.len();
        let batch = SpanBatch { spans };
        let body = batch.encode_to_vec();
        debug!("shipping {count} spans to {}", self.endpoint);
        let result = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/x-protobuf")
            .body(body)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                Counters::incr(&self.counters.span_flush_errors);
                Counters::add(&self.counters.spans_dropped, count as u64);
                error!("trace endpoint returned {}", response.status());
            }
            Err(e) => {
                Counters::incr(&self.counters.span_flush_errors);
                Counters::add(&self.counters.spans_dropped, count as u64);
                error!("failed to ship spans: {e}");
            }
        }
    }
}
