// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors produced while parsing a single statsd line.
///
/// Any of these drops the whole line; the listener counts the drop and moves
/// on to the next line in the packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty packet")]
    EmptyPacket,

    #[error("metric name is missing")]
    MissingName,

    #[error("metric name is not a printable ASCII string of at most 200 bytes: {0}")]
    InvalidName(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("unknown metric type: {0}")]
    UnknownType(String),

    #[error("malformed tag section: {0}")]
    MalformedTag(String),

    #[error("sample rate out of range (0, 1]: {0}")]
    RateOutOfRange(String),
}
