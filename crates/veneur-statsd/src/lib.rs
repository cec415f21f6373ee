// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire grammar for the statsd-compatible ingest path: sample types, the
//! line parser, tag canonicalization, and the stable 64-bit digest used for
//! worker routing.

pub mod errors;
pub mod metric;
pub mod tags;

pub use errors::ParseError;
pub use metric::{parse, Metric, MetricKey, MetricKind, MetricValue, Scope};
pub use tags::{SortedTags, EMPTY_TAGS};
