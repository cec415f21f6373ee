// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::accumulator::PointValue;
use crate::error::SinkError;
use crate::sinks::{Batch, MetricSink};

/// Logs every point in the batch. Useful while wiring a deployment up.
#[derive(Debug, Default)]
pub struct DebugSink;

impl DebugSink {
    pub fn new() -> DebugSink {
        DebugSink
    }
}

#[async_trait]
impl MetricSink for DebugSink {
    fn name(&self) -> &str {
        "debug"
    }

    async fn flush(&self, batch: Batch, _deadline: Duration) -> Result<(), SinkError> {
        for point in batch.iter() {
            match &point.value {
                PointValue::Float(value) => info!(
                    "flush {} [{}] @{} = {value}",
                    point.name, point.tags, point.timestamp
                ),
                PointValue::Status { level, message } => info!(
                    "flush {} [{}] @{} = level {level} ({})",
                    point.name,
                    point.tags,
                    point.timestamp,
                    message.as_deref().unwrap_or("")
                ),
            }
        }
        info!("debug sink flushed {} points", batch.len());
        Ok(())
    }
}
