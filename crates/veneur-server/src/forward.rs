// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The inter-host forward protocol for Global metrics.
//!
//! A tick's Global accumulators are serialized as a JSON list of
//! `{name, kind, tags, state}` and POSTed to the peer's `/import` endpoint.
//! The sender never retries: sketch merges would tolerate duplication, but
//! counter addition would not, so a timed-out tick's Global data is counted
//! and dropped instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use ustr::Ustr;

use veneur_statsd::{MetricKey, MetricKind, ParseError, SortedTags};

use crate::accumulator::AccumulatorState;
use crate::error::ForwardError;

/// One forwarded accumulator: canonical identity plus serialized state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardEntry {
    pub name: String,
    pub kind: MetricKind,
    pub tags: Vec<String>,
    pub state: AccumulatorState,
}

impl ForwardEntry {
    pub fn new(key: &MetricKey, state: AccumulatorState) -> ForwardEntry {
        ForwardEntry {
            name: key.name.to_string(),
            kind: key.kind,
            tags: key.tags.to_strings(),
            state,
        }
    }

    /// Rebuilds the canonical key on the receiving side. Tags go through
    /// the same canonicalization as the wire, so the digest — and therefore
    /// the owning worker — matches the sender's routing.
    pub fn key(&self) -> Result<MetricKey, ParseError> {
        Ok(MetricKey {
            name: Ustr::from(&self.name),
            kind: self.kind,
            tags: SortedTags::from_strings(&self.tags)?,
        })
    }
}

/// HTTP client for the forward path. One client, one deadline, no retries.
pub struct ForwardClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ForwardClient {
    /// `address` is the peer base URL; the import path is appended here so
    /// configuration holds one value.
    pub fn new(address: &str, deadline: Duration) -> Result<ForwardClient, ForwardError> {
        let client = reqwest::Client::builder().timeout(deadline).build()?;
        Ok(ForwardClient {
            client,
            endpoint: format!("{}/import", address.trim_end_matches('/')),
        })
    }

    pub async fn forward(&self, entries: &[ForwardEntry]) -> Result<(), ForwardError> {
        if entries.is_empty() {
            return Ok(());
        }
        debug!("forwarding {} global accumulators", entries.len());
        let response = self.client.post(&self.endpoint).json(entries).send().await?;
        let status = response.status();
        if !status.is_success() {
            error!("forward endpoint returned {status}");
            return Err(ForwardError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veneur_statsd::parse;

    #[test]
    fn test_entry_round_trips_key() {
        let metric = parse("req:1|h|#env:prod,az:1a").unwrap();
        let key = metric.key();
        let entry = ForwardEntry::new(&key, AccumulatorState::Counter { sum: 1.0 });

        let json = serde_json::to_string(&entry).unwrap();
        let back: ForwardEntry = serde_json::from_str(&json).unwrap();
        let rebuilt = back.key().unwrap();

        assert_eq!(rebuilt, key);
        assert_eq!(rebuilt.digest(), key.digest());
    }

    #[test]
    fn test_entry_rejects_malformed_tags() {
        let entry = ForwardEntry {
            name: "x".to_string(),
            kind: MetricKind::Counter,
            tags: vec![":broken".to_string()],
            state: AccumulatorState::Counter { sum: 1.0 },
        };
        assert!(entry.key().is_err());
    }

    #[test]
    fn test_payload_shape() {
        let metric = parse("req:1|c|#env:prod").unwrap();
        let entry = ForwardEntry::new(&metric.key(), AccumulatorState::Counter { sum: 3.0 });
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["name"], "req");
        assert_eq!(json["kind"], "counter");
        assert_eq!(json["tags"][0], "env:prod");
        assert_eq!(json["state"]["kind"], "counter");
        assert_eq!(json["state"]["sum"], 3.0);
    }
}
