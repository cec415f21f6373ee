// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::SinkError;
use crate::sinks::{Batch, MetricSink};

/// POSTs each batch as a JSON array to a configured endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: String, deadline: Duration) -> Result<HttpSink, SinkError> {
        let client = reqwest::Client::builder().timeout(deadline).build()?;
        Ok(HttpSink { client, endpoint })
    }
}

#[async_trait]
impl MetricSink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn flush(&self, batch: Batch, _deadline: Duration) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        debug!("http sink shipping {} points to {}", batch.len(), self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .json(batch.as_ref())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status(status.as_u16()));
        }
        Ok(())
    }
}
