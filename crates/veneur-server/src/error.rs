// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

/// Errors raised while loading or validating the configuration. All of
/// these are fatal at startup; the process exits with code 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while bringing the server up or running it.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ServerError {
    /// Process exit code for this error: 1 for configuration problems,
    /// 2 for an unrecoverable ingest bind failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Config(_) => 1,
            ServerError::Bind { .. } => 2,
            ServerError::Runtime(_) => 1,
        }
    }
}

/// A failed sink flush. Counted and logged, never fatal to the tick.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink returned status {0}")]
    Status(u16),

    #[error("sink flush exceeded its deadline")]
    DeadlineExceeded,
}

/// A failed forward POST. The tick's Global data is dropped; there is no
/// retry because counter merges are not idempotent under duplication.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("forward request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("forward endpoint returned status {0}")]
    Status(u16),

    #[error("failed to serialize forward payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config = ServerError::Config(ConfigError::Invalid("x".into()));
        assert_eq!(config.exit_code(), 1);

        let bind = ServerError::Bind {
            addr: "127.0.0.1:8126".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_eq!(bind.exit_code(), 2);
    }
}
