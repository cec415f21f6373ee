// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-metric window state and its derivation into exported series.
//!
//! Accumulators are a closed enum over the six metric kinds, so update and
//! derivation dispatch are exhaustive matches. Sinks stay open polymorphism
//! (the set is configuration-driven); accumulators are not.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use ustr::Ustr;

use veneur_sketch::{CardSketch, DistSketch, SketchError};
use veneur_statsd::{MetricKind, MetricValue, Scope, SortedTags};

/// In-memory state for one `MetricKey` within one window.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Counter { sum: f64 },
    Gauge { value: f64 },
    Set { sketch: CardSketch },
    Histogram { sketch: DistSketch },
    Timer { sketch: DistSketch },
    Status { level: i64, message: Option<Ustr> },
}

/// A worker map entry: the accumulator plus the scope that routes it at
/// flush time. Scope is last-writer-wins, like the value of a gauge.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEntry {
    pub scope: Scope,
    pub accumulator: Accumulator,
}

/// Serialized accumulator state as it travels in a forward payload.
/// Sketch-backed kinds ship their sketch, never per-sample values: the
/// receiver merges sketches so fleet-wide quantiles stay quantiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccumulatorState {
    Counter {
        sum: f64,
    },
    Gauge {
        value: f64,
    },
    Set {
        sketch: CardSketch,
    },
    Histogram {
        sketch: DistSketch,
    },
    Timer {
        sketch: DistSketch,
    },
    Status {
        level: i64,
        message: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("cannot merge {incoming} state into a {existing} accumulator")]
    KindMismatch {
        existing: &'static str,
        incoming: &'static str,
    },

    #[error(transparent)]
    Sketch(#[from] SketchError),
}

/// The value slot of an exported point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PointValue {
    Float(f64),
    Status { level: i64, message: Option<String> },
}

/// One exported series point, as handed to sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub name: String,
    pub tags: SortedTags,
    pub timestamp: i64,
    pub kind: MetricKind,
    pub value: PointValue,
}

/// `0.5 -> "p50"`, `0.99 -> "p99"`, `0.999 -> "p999"`.
fn quantile_suffix(q: f64) -> String {
    let printed = format!("{q}");
    let mut digits = printed
        .strip_prefix("0.")
        .unwrap_or(&printed)
        .replace('.', "");
    if digits.len() == 1 {
        digits.push('0');
    }
    format!("p{digits}")
}

impl Accumulator {
    /// Creates the accumulator for a sample's kind, empty.
    pub fn new(kind: MetricKind, percentile_tolerance: f64) -> Result<Self, SketchError> {
        Ok(match kind {
            MetricKind::Counter => Accumulator::Counter { sum: 0.0 },
            MetricKind::Gauge => Accumulator::Gauge { value: 0.0 },
            MetricKind::Set => Accumulator::Set {
                sketch: CardSketch::new(),
            },
            MetricKind::Histogram => Accumulator::Histogram {
                sketch: DistSketch::new(percentile_tolerance)?,
            },
            MetricKind::Timer => Accumulator::Timer {
                sketch: DistSketch::new(percentile_tolerance)?,
            },
            MetricKind::Status => Accumulator::Status {
                level: 0,
                message: None,
            },
        })
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Accumulator::Counter { .. } => "counter",
            Accumulator::Gauge { .. } => "gauge",
            Accumulator::Set { .. } => "set",
            Accumulator::Histogram { .. } => "histogram",
            Accumulator::Timer { .. } => "timer",
            Accumulator::Status { .. } => "status",
        }
    }

    /// Folds one sample value in. The parser guarantees the value variant
    /// matches the kind, so mismatches are ignored rather than panicking.
    pub fn update(&mut self, value: &MetricValue, sample_rate: f64) {
        match (self, value) {
            (Accumulator::Counter { sum }, MetricValue::Numeric(v)) => {
                *sum += v / sample_rate;
            }
            (Accumulator::Gauge { value }, MetricValue::Numeric(v)) => {
                *value = *v;
            }
            (Accumulator::Set { sketch }, MetricValue::Member(member)) => {
                sketch.add(member.as_bytes());
            }
            (Accumulator::Histogram { sketch }, MetricValue::Numeric(v))
            | (Accumulator::Timer { sketch }, MetricValue::Numeric(v)) => {
                sketch.insert(*v);
            }
            (
                Accumulator::Status { level, message },
                MetricValue::Status {
                    level: new_level,
                    message: new_message,
                },
            ) => {
                *level = *new_level;
                *message = *new_message;
            }
            _ => {}
        }
    }

    /// Converts to the wire form for forwarding, consuming the accumulator.
    pub fn into_state(self) -> AccumulatorState {
        match self {
            Accumulator::Counter { sum } => AccumulatorState::Counter { sum },
            Accumulator::Gauge { value } => AccumulatorState::Gauge { value },
            Accumulator::Set { sketch } => AccumulatorState::Set { sketch },
            Accumulator::Histogram { sketch } => AccumulatorState::Histogram { sketch },
            Accumulator::Timer { sketch } => AccumulatorState::Timer { sketch },
            Accumulator::Status { level, message } => AccumulatorState::Status {
                level,
                message: message.map(|m| m.to_string()),
            },
        }
    }

    /// Rehydrates a forwarded state into a fresh accumulator.
    pub fn from_state(state: AccumulatorState) -> Self {
        match state {
            AccumulatorState::Counter { sum } => Accumulator::Counter { sum },
            AccumulatorState::Gauge { value } => Accumulator::Gauge { value },
            AccumulatorState::Set { sketch } => Accumulator::Set { sketch },
            AccumulatorState::Histogram { sketch } => Accumulator::Histogram { sketch },
            AccumulatorState::Timer { sketch } => Accumulator::Timer { sketch },
            AccumulatorState::Status { level, message } => Accumulator::Status {
                level,
                message: message.map(|m| Ustr::from(&m)),
            },
        }
    }

    /// Merges forwarded state into this accumulator: addition for counters,
    /// last-write for gauges and statuses, sketch merge for the rest.
    pub fn merge_state(&mut self, state: AccumulatorState) -> Result<(), MergeError> {
        match (self, state) {
            (Accumulator::Counter { sum }, AccumulatorState::Counter { sum: other }) => {
                *sum += other;
            }
            (Accumulator::Gauge { value }, AccumulatorState::Gauge { value: other }) => {
                *value = other;
            }
            (Accumulator::Set { sketch }, AccumulatorState::Set { sketch: other }) => {
                sketch.merge(&other);
            }
            (Accumulator::Histogram { sketch }, AccumulatorState::Histogram { sketch: other })
            | (Accumulator::Timer { sketch }, AccumulatorState::Timer { sketch: other }) => {
                sketch.merge(&other)?;
            }
            (
                Accumulator::Status { level, message },
                AccumulatorState::Status {
                    level: other_level,
                    message: other_message,
                },
            ) => {
                *level = other_level;
                *message = other_message.map(|m| Ustr::from(&m));
            }
            (existing, incoming) => {
                return Err(MergeError::KindMismatch {
                    existing: existing.kind_name(),
                    incoming: Accumulator::from_state(incoming).kind_name(),
                });
            }
        }
        Ok(())
    }

    /// Derives the exported series for this accumulator at window end.
    ///
    /// | kind      | exports                                             |
    /// |-----------|------------------------------------------------------|
    /// | counter   | `<name>` = sum / Δ                                   |
    /// | gauge     | `<name>` = last value                                |
    /// | set       | `<name>.count` = cardinality estimate                |
    /// | histogram | `<name>.{min,max,count,sum}` + `<name>.<pNN>` per q  |
    /// | timer     | same as histogram, values are milliseconds           |
    /// | status    | `<name>` = level + message                           |
    pub fn export(
        &self,
        name: &str,
        tags: &SortedTags,
        timestamp: i64,
        interval: Duration,
        quantiles: &[f64],
        out: &mut Vec<SeriesPoint>,
    ) {
        let point = |name: String, kind: MetricKind, value: PointValue| SeriesPoint {
            name,
            tags: tags.clone(),
            timestamp,
            kind,
            value,
        };

        match self {
            Accumulator::Counter { sum } => {
                let rate = sum / interval.as_secs_f64();
                out.push(point(
                    name.to_string(),
                    MetricKind::Counter,
                    PointValue::Float(rate),
                ));
            }
            Accumulator::Gauge { value } => {
                out.push(point(
                    name.to_string(),
                    MetricKind::Gauge,
                    PointValue::Float(*value),
                ));
            }
            Accumulator::Set { sketch } => {
                out.push(point(
                    format!("{name}.count"),
                    MetricKind::Set,
                    PointValue::Float(sketch.estimate()),
                ));
            }
            Accumulator::Histogram { sketch } | Accumulator::Timer { sketch } => {
                let kind = match self {
                    Accumulator::Timer { .. } => MetricKind::Timer,
                    _ => MetricKind::Histogram,
                };
                if sketch.is_empty() {
                    return;
                }
                // min()/max() are Some: the sketch is non-empty.
                if let (Some(min), Some(max)) = (sketch.min(), sketch.max()) {
                    out.push(point(
                        format!("{name}.min"),
                        kind,
                        PointValue::Float(min),
                    ));
                    out.push(point(
                        format!("{name}.max"),
                        kind,
                        PointValue::Float(max),
                    ));
                }
                out.push(point(
                    format!("{name}.count"),
                    kind,
                    PointValue::Float(sketch.count() as f64),
                ));
                out.push(point(
                    format!("{name}.sum"),
                    kind,
                    PointValue::Float(sketch.sum()),
                ));
                for &q in quantiles {
                    if let Ok(value) = sketch.quantile(q) {
                        out.push(point(
                            format!("{name}.{}", quantile_suffix(q)),
                            kind,
                            PointValue::Float(value),
                        ));
                    }
                }
            }
            Accumulator::Status { level, message } => {
                out.push(point(
                    name.to_string(),
                    MetricKind::Status,
                    PointValue::Status {
                        level: *level,
                        message: message.map(|m| m.to_string()),
                    },
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veneur_statsd::parse;

    const TOLERANCE: f64 = 0.01;
    const WINDOW: Duration = Duration::from_secs(10);

    fn fold(lines: &[&str]) -> Accumulator {
        let first = parse(lines[0]).unwrap();
        let mut acc = Accumulator::new(first.kind, TOLERANCE).unwrap();
        for line in lines {
            let metric = parse(line).unwrap();
            acc.update(&metric.value, metric.sample_rate);
        }
        acc
    }

    fn export_all(acc: &Accumulator, name: &str) -> Vec<SeriesPoint> {
        let mut out = Vec::new();
        acc.export(
            name,
            &SortedTags::default(),
            100,
            WINDOW,
            &[0.5, 0.99],
            &mut out,
        );
        out
    }

    #[test]
    fn test_counter_exports_rate() {
        // foo:1|c + foo:2|c + foo:3|c over a 10s window is 0.6/s.
        let acc = fold(&["foo:1|c", "foo:2|c", "foo:3|c"]);
        let points = export_all(&acc, "foo");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].name, "foo");
        assert_eq!(points[0].value, PointValue::Float(0.6));
    }

    #[test]
    fn test_counter_scales_by_sample_rate() {
        let acc = fold(&["foo:1|c|@0.1"]);
        let points = export_all(&acc, "foo");
        assert_eq!(points[0].value, PointValue::Float(1.0));
    }

    #[test]
    fn test_gauge_last_writer_wins() {
        let acc = fold(&["g:5|g", "g:2|g"]);
        let points = export_all(&acc, "g");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, PointValue::Float(2.0));
    }

    #[test]
    fn test_set_exports_estimate() {
        let acc = fold(&["users:alice|s", "users:bob|s", "users:alice|s"]);
        let points = export_all(&acc, "users");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].name, "users.count");
        match points[0].value {
            PointValue::Float(estimate) => assert!((estimate - 2.0).abs() < 0.1),
            _ => panic!("set must export a float"),
        }
    }

    #[test]
    fn test_timer_exports_summary_and_quantiles() {
        let lines: Vec<String> = (1..=100).map(|i| format!("lat:{i}|ms")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let acc = fold(&refs);
        let points = export_all(&acc, "lat");

        let names: Vec<&str> = points.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["lat.min", "lat.max", "lat.count", "lat.sum", "lat.p50", "lat.p99"]
        );
        assert_eq!(points[0].value, PointValue::Float(1.0));
        assert_eq!(points[1].value, PointValue::Float(100.0));
        assert_eq!(points[2].value, PointValue::Float(100.0));
        assert_eq!(points[3].value, PointValue::Float(5050.0));
        for point in &points {
            assert_eq!(point.kind, MetricKind::Timer);
        }
    }

    #[test]
    fn test_empty_histogram_exports_nothing() {
        let acc = Accumulator::new(MetricKind::Histogram, TOLERANCE).unwrap();
        assert!(export_all(&acc, "h").is_empty());
    }

    #[test]
    fn test_status_exports_level_and_message() {
        let acc = fold(&["db.up:0|st", "db.up:2|st|#message:down"]);
        let points = export_all(&acc, "db.up");
        assert_eq!(points.len(), 1);
        assert_eq!(
            points[0].value,
            PointValue::Status {
                level: 2,
                message: Some("down".to_string()),
            }
        );
    }

    #[test]
    fn test_merge_state_counter_adds() {
        let mut acc = fold(&["foo:4|c"]);
        acc.merge_state(AccumulatorState::Counter { sum: 6.0 }).unwrap();
        let points = export_all(&acc, "foo");
        assert_eq!(points[0].value, PointValue::Float(1.0));
    }

    #[test]
    fn test_merge_state_kind_mismatch() {
        let mut acc = fold(&["foo:4|c"]);
        let err = acc
            .merge_state(AccumulatorState::Gauge { value: 1.0 })
            .unwrap_err();
        assert!(matches!(err, MergeError::KindMismatch { .. }));
    }

    #[test]
    fn test_merge_state_histogram_merges_sketch() {
        let mut local = fold(&["lat:10|h", "lat:20|h"]);

        let mut remote = DistSketch::new(TOLERANCE).unwrap();
        remote.insert(30.0);
        remote.insert(40.0);
        local
            .merge_state(AccumulatorState::Histogram { sketch: remote })
            .unwrap();

        let points = export_all(&local, "lat");
        let count = points.iter().find(|p| p.name == "lat.count").unwrap();
        assert_eq!(count.value, PointValue::Float(4.0));
        let max = points.iter().find(|p| p.name == "lat.max").unwrap();
        assert_eq!(max.value, PointValue::Float(40.0));
    }

    #[test]
    fn test_state_round_trip() {
        let acc = fold(&["lat:10|h", "lat:20|h"]);
        let state = acc.clone().into_state();
        let json = serde_json::to_string(&state).unwrap();
        let back: AccumulatorState = serde_json::from_str(&json).unwrap();
        assert_eq!(Accumulator::from_state(back), acc);
    }

    #[test]
    fn test_quantile_suffix_formatting() {
        assert_eq!(quantile_suffix(0.5), "p50");
        assert_eq!(quantile_suffix(0.75), "p75");
        assert_eq!(quantile_suffix(0.9), "p90");
        assert_eq!(quantile_suffix(0.95), "p95");
        assert_eq!(quantile_suffix(0.99), "p99");
        assert_eq!(quantile_suffix(0.999), "p999");
    }
}
