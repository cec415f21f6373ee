// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded-memory approximate data structures for per-window aggregation.
//!
//! Two sketches back the aggregation engine:
//!
//! - [`DistSketch`]: quantile estimation over a positive numeric range with
//!   a fixed relative-error guarantee (log-bucketed).
//! - [`CardSketch`]: cardinality estimation over byte strings (HyperLogLog).
//!
//! Both have memory bounds independent of how many samples were inserted,
//! both merge associatively and commutatively, and both serialize to a
//! stable form so they can ship inside forwarded accumulator state.

pub mod cardinality;
pub mod distribution;

pub use cardinality::CardSketch;
pub use distribution::DistSketch;

/// Errors from sketch construction and queries.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SketchError {
    #[error("relative accuracy must be in (0, 1), got {0}")]
    InvalidAccuracy(f64),

    #[error("quantile must be in [0, 1], got {0}")]
    InvalidQuantile(f64),

    #[error("sketch is empty")]
    Empty,

    #[error("cannot merge sketches with different precision ({0} vs {1})")]
    PrecisionMismatch(f64, f64),
}
