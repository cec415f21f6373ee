// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;

use crate::error::ConfigError;

const fn default_flush_interval() -> u64 {
    10
}

const fn default_max_packet_size() -> usize {
    8192
}

fn default_quantiles() -> Vec<f64> {
    vec![0.5, 0.75, 0.9, 0.95, 0.99]
}

const fn default_percentile_tolerance() -> f64 {
    0.01
}

const fn default_sink_deadline() -> u64 {
    5
}

/// One entry in the configured sink list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Logs every point in the batch; useful in development.
    Debug,
    /// POSTs the batch as JSON to an arbitrary endpoint.
    Http { endpoint: String },
}

/// Startup-time configuration snapshot. Loaded once, validated once, never
/// reconfigured at runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Flush interval Δ, in seconds.
    pub flush_interval: u64,
    /// Number of aggregation workers; 0 means one per available core.
    pub num_workers: usize,
    /// UDP ingest address; empty disables.
    pub listen_udp: String,
    /// TCP (line-framed) ingest address; empty disables.
    pub listen_tcp: String,
    /// HTTP address for the import and admin endpoints; empty disables.
    pub listen_http: String,
    /// UDP span ingest address; empty disables.
    pub listen_trace_udp: String,
    /// Peer endpoint Global metrics are forwarded to; empty disables.
    pub forward_address: String,
    /// Span intake endpoint; empty disables span flushing.
    pub trace_address: String,
    /// Quantiles exported for histograms and timers.
    pub quantiles: Vec<f64>,
    /// Relative error target for distribution sketches.
    pub percentile_tolerance: f64,
    /// Sinks receiving the derived batch each tick, in order.
    pub sinks: Vec<SinkConfig>,
    /// Per-sink flush deadline, in seconds.
    pub sink_deadline: u64,
    /// Error-reporting endpoint; empty disables.
    pub sentry_dsn: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Host label applied to all Local series; empty means autodetect.
    pub hostname: String,
    /// Global tags applied to every exported series.
    pub tags: Vec<String>,
    /// Largest accepted ingest packet, in bytes.
    pub max_packet_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            flush_interval: default_flush_interval(),
            num_workers: 0,
            listen_udp: "127.0.0.1:8125".to_string(),
            listen_tcp: String::new(),
            listen_http: "127.0.0.1:8127".to_string(),
            listen_trace_udp: String::new(),
            forward_address: String::new(),
            trace_address: String::new(),
            quantiles: default_quantiles(),
            percentile_tolerance: default_percentile_tolerance(),
            sinks: vec![SinkConfig::Debug],
            sink_deadline: default_sink_deadline(),
            sentry_dsn: String::new(),
            log_level: "info".to_string(),
            hostname: String::new(),
            tags: Vec::new(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

fn parse_addr(field: &str, value: &str) -> Result<Option<SocketAddr>, ConfigError> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid(format!("{field} is not a socket address: {value}")))
}

fn check_endpoint(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{field} must be an http(s) URL: {value}"
        )))
    }
}

impl Config {
    /// Reads the YAML file at `path`, layers `VENEUR_`-prefixed environment
    /// variables on top, and validates the result.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Yaml::file_exact(path))
            .merge(Env::prefixed("VENEUR_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval == 0 {
            return Err(ConfigError::Invalid(
                "flush_interval must be at least 1 second".to_string(),
            ));
        }
        parse_addr("listen_udp", &self.listen_udp)?;
        parse_addr("listen_tcp", &self.listen_tcp)?;
        parse_addr("listen_http", &self.listen_http)?;
        parse_addr("listen_trace_udp", &self.listen_trace_udp)?;
        check_endpoint("forward_address", &self.forward_address)?;
        check_endpoint("trace_address", &self.trace_address)?;
        for sink in &self.sinks {
            if let SinkConfig::Http { endpoint } = sink {
                if endpoint.is_empty() {
                    return Err(ConfigError::Invalid(
                        "http sink requires an endpoint".to_string(),
                    ));
                }
                check_endpoint("sinks.endpoint", endpoint)?;
            }
        }
        if self.quantiles.is_empty() {
            return Err(ConfigError::Invalid(
                "quantiles must not be empty".to_string(),
            ));
        }
        for &q in &self.quantiles {
            if !(0.0..1.0).contains(&q) || q == 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "quantile out of range (0, 1): {q}"
                )));
            }
        }
        if !(self.percentile_tolerance > 0.0 && self.percentile_tolerance < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "percentile_tolerance out of range (0, 1): {}",
                self.percentile_tolerance
            )));
        }
        if self.max_packet_size == 0 {
            return Err(ConfigError::Invalid(
                "max_packet_size must be positive".to_string(),
            ));
        }
        if self.sink_deadline == 0 {
            return Err(ConfigError::Invalid(
                "sink_deadline must be at least 1 second".to_string(),
            ));
        }
        check_endpoint("sentry_dsn", &self.sentry_dsn)?;
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log level '{}'; must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }

    pub fn sink_deadline(&self) -> Duration {
        Duration::from_secs(self.sink_deadline)
    }

    /// Worker count with the 0 = "one per core" default applied.
    pub fn effective_workers(&self) -> usize {
        if self.num_workers > 0 {
            self.num_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Host label for Local series, falling back to the OS hostname.
    pub fn effective_hostname(&self) -> String {
        if !self.hostname.is_empty() {
            return self.hostname.clone();
        }
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        parse_addr("listen_udp", &self.listen_udp).ok().flatten()
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        parse_addr("listen_tcp", &self.listen_tcp).ok().flatten()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        parse_addr("listen_http", &self.listen_http).ok().flatten()
    }

    pub fn trace_udp_addr(&self) -> Option<SocketAddr> {
        parse_addr("listen_trace_udp", &self.listen_trace_udp)
            .ok()
            .flatten()
    }
}
