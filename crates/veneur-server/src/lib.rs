// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The aggregation service: ingest listeners, worker shards, the flush
//! coordinator, the inter-host forward protocol, and sink dispatch.

pub mod accumulator;
pub mod config;
pub mod error;
pub mod flush;
pub mod forward;
pub mod http;
pub mod listener;
pub mod server;
pub mod sinks;
pub mod spans;
pub mod telemetry;
pub mod worker;

pub use config::Config;
pub use error::ServerError;
pub use server::Server;
