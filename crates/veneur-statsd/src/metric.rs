// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use ustr::Ustr;

use crate::errors::ParseError;
use crate::tags::SortedTags;

/// Maximum accepted metric name length, in bytes.
pub const MAX_NAME_LEN: usize = 200;

/// The six supported metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Set,
    Histogram,
    Timer,
    Status,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Set => "set",
            MetricKind::Histogram => "histogram",
            MetricKind::Timer => "timer",
            MetricKind::Status => "status",
        }
    }

    fn discriminant(self) -> u8 {
        match self {
            MetricKind::Counter => 0,
            MetricKind::Gauge => 1,
            MetricKind::Set => 2,
            MetricKind::Histogram => 3,
            MetricKind::Timer => 4,
            MetricKind::Status => 5,
        }
    }
}

/// Whether a metric is aggregated on this host alone or forwarded to an
/// aggregator peer for fleet-wide combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    Local,
    Global,
}

/// The parsed payload of a sample. Which variant applies is fixed by the
/// metric kind.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Counter, gauge, histogram, and timer values.
    Numeric(f64),
    /// A set member.
    Member(Ustr),
    /// A status level with an optional message.
    Status { level: i64, message: Option<Ustr> },
}

/// Canonical metric identity: `(name, kind, sorted tags)`. Two samples fold
/// into the same accumulator iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub name: Ustr,
    pub kind: MetricKind,
    pub tags: SortedTags,
}

impl MetricKey {
    /// Stable 64-bit digest of the canonical key serialization.
    ///
    /// FNV with its fixed offset basis: no per-process seed, so forwarded
    /// metrics from peer hosts route to the same worker index and tests are
    /// deterministic. The worker is selected as `digest % num_workers`.
    pub fn digest(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(self.name.as_bytes());
        hasher.write_u8(0x1f);
        hasher.write_u8(self.kind.discriminant());
        hasher.write_u8(0x1f);
        self.tags.write_to_hasher(&mut hasher);
        hasher.finish()
    }
}

/// One parsed telemetry datum, immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: Ustr,
    pub kind: MetricKind,
    pub value: MetricValue,
    pub tags: SortedTags,
    pub sample_rate: f64,
    pub scope: Scope,
    /// Client-supplied unix timestamp, if the line carried a `|T` section.
    pub timestamp: Option<i64>,
}

impl Metric {
    pub fn key(&self) -> MetricKey {
        MetricKey {
            name: self.name,
            kind: self.kind,
            tags: self.tags.clone(),
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.bytes().all(|b| (0x21..=0x7e).contains(&b))
}

/// Parses one statsd line:
///
/// ```text
/// name ":" value ("|" type)("|@" rate)?("|#" tag ("," tag)*)?
/// ```
///
/// A `scope:global` or `scope:local` tag selects the sample's scope and is
/// stripped from the canonical tag set; a `message:` tag on a status sample
/// carries its message. Any structural error drops the whole line.
pub fn parse(line: &str) -> Result<Metric, ParseError> {
    if line.is_empty() {
        return Err(ParseError::EmptyPacket);
    }

    let (name, rest) = line.split_once(':').ok_or(ParseError::MissingName)?;
    if name.is_empty() {
        return Err(ParseError::MissingName);
    }
    if !valid_name(name) {
        return Err(ParseError::InvalidName(name.to_string()));
    }

    let mut sections = rest.split('|');
    // `split` always yields at least one element.
    let value_str = sections.next().unwrap_or("");
    let type_str = sections
        .next()
        .ok_or_else(|| ParseError::UnknownType(String::new()))?;

    let kind = match type_str {
        "c" => MetricKind::Counter,
        "g" => MetricKind::Gauge,
        "s" => MetricKind::Set,
        "h" => MetricKind::Histogram,
        "ms" => MetricKind::Timer,
        "st" => MetricKind::Status,
        other => return Err(ParseError::UnknownType(other.to_string())),
    };

    let mut sample_rate = 1.0;
    let mut tags = SortedTags::default();
    let mut timestamp = None;

    for section in sections {
        if let Some(rate_str) = section.strip_prefix('@') {
            let rate: f64 = rate_str
                .parse()
                .map_err(|_| ParseError::RateOutOfRange(rate_str.to_string()))?;
            if !rate.is_finite() || rate <= 0.0 || rate > 1.0 {
                return Err(ParseError::RateOutOfRange(rate_str.to_string()));
            }
            sample_rate = rate;
        } else if let Some(tag_section) = section.strip_prefix('#') {
            tags = SortedTags::parse(tag_section)?;
        } else if let Some(ts_str) = section.strip_prefix('T') {
            let ts: i64 = ts_str
                .parse()
                .map_err(|_| ParseError::InvalidValue(ts_str.to_string()))?;
            timestamp = Some(ts);
        } else {
            return Err(ParseError::MalformedTag(section.to_string()));
        }
    }

    let scope = match tags.take("scope") {
        Some(v) if v.as_str() == "global" => Scope::Global,
        Some(v) if v.as_str() == "local" => Scope::Local,
        Some(other) => return Err(ParseError::MalformedTag(format!("scope:{other}"))),
        None => Scope::Local,
    };

    let value = match kind {
        MetricKind::Set => {
            if value_str.is_empty() {
                return Err(ParseError::InvalidValue(value_str.to_string()));
            }
            MetricValue::Member(Ustr::from(value_str))
        }
        MetricKind::Status => {
            let level: i64 = value_str
                .parse()
                .map_err(|_| ParseError::InvalidValue(value_str.to_string()))?;
            MetricValue::Status {
                level,
                message: tags.take("message"),
            }
        }
        _ => {
            let number: f64 = value_str
                .parse()
                .map_err(|_| ParseError::InvalidValue(value_str.to_string()))?;
            if !number.is_finite() {
                return Err(ParseError::InvalidValue(value_str.to_string()));
            }
            MetricValue::Numeric(number)
        }
    };

    Ok(Metric {
        name: Ustr::from(name),
        kind,
        value,
        tags,
        sample_rate,
        scope,
        timestamp,
    })
}
