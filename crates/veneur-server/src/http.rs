// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The embedded HTTP surface: the peer `/import` endpoint plus the small
//! admin set (`/healthcheck`, `/version`, `/counters`).

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::forward::ForwardEntry;
use crate::telemetry::Counters;
use crate::worker::WorkerHandle;

const IMPORT_PATH: &str = "/import";
const HEALTHCHECK_PATH: &str = "/healthcheck";
const VERSION_PATH: &str = "/version";
const COUNTERS_PATH: &str = "/counters";

/// Largest accepted import body. Forward batches are one tick's worth of
/// global accumulators; anything near this size is misbehaving.
const MAX_IMPORT_BODY: usize = 16 * 1024 * 1024;

pub struct HttpState {
    pub workers: Vec<WorkerHandle>,
    pub counters: Arc<Counters>,
}

/// Accept loop for the import/admin server. One task per connection.
pub async fn serve(listener: TcpListener, state: Arc<HttpState>, cancel: CancellationToken) {
    let server = hyper::server::conn::http1::Builder::new();
    let mut connections = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
            Some(_) = connections.join_next() => continue,
        };
        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                ) =>
            {
                continue;
            }
            Err(e) => {
                error!("http accept error: {e}");
                continue;
            }
        };

        let state = Arc::clone(&state);
        let service = service_fn(move |req| handle(req, Arc::clone(&state)));
        let server = server.clone();
        connections.spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(e) = server.serve_connection(io, service).await {
                debug!("http connection error: {e}");
            }
        });
    }
    connections.shutdown().await;
    debug!("http server stopped");
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<HttpState>,
) -> http::Result<Response<Full<Bytes>>> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, IMPORT_PATH) => import(req, &state).await,
        (&Method::GET, HEALTHCHECK_PATH) => text_response(StatusCode::OK, "ok\n"),
        (&Method::GET, VERSION_PATH) => {
            text_response(StatusCode::OK, concat!(env!("CARGO_PKG_VERSION"), "\n"))
        }
        (&Method::GET, COUNTERS_PATH) => {
            let snapshot = state.counters.snapshot();
            match serde_json::to_vec(&snapshot) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("cannot serialize counters: {e}\n"),
                ),
            }
        }
        _ => {
            let mut not_found = Response::default();
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

/// Merges a forwarded batch into the current window. Each entry routes by
/// the same digest the sender used, so it lands on the worker that owns the
/// key's shard here too.
async fn import(
    req: Request<Incoming>,
    state: &HttpState,
) -> http::Result<Response<Full<Bytes>>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return text_response(
                StatusCode::BAD_REQUEST,
                &format!("cannot read import body: {e}\n"),
            );
        }
    };
    if body.len() > MAX_IMPORT_BODY {
        return text_response(StatusCode::PAYLOAD_TOO_LARGE, "import body too large\n");
    }

    let entries: Vec<ForwardEntry> = match serde_json::from_slice(&body) {
        Ok(entries) => entries,
        Err(e) => {
            Counters::incr(&state.counters.import_errors);
            return text_response(
                StatusCode::BAD_REQUEST,
                &format!("malformed import payload: {e}\n"),
            );
        }
    };

    let mut imported = 0usize;
    for entry in entries {
        match entry.key() {
            Ok(key) => {
                let index = (key.digest() % state.workers.len() as u64) as usize;
                state.workers[index].merge(key, entry.state);
                imported += 1;
            }
            Err(e) => {
                Counters::incr(&state.counters.import_errors);
                debug!("skipping forwarded entry {}: {e}", entry.name);
            }
        }
    }

    debug!("imported {imported} forwarded accumulators");
    json_response(
        StatusCode::OK,
        format!("{{\"imported\":{imported}}}").into_bytes(),
    )
}

fn text_response(status: StatusCode, body: &str) -> http::Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(body.to_string())))
}

fn json_response(status: StatusCode, body: Vec<u8>) -> http::Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::AccumulatorState;
    use crate::worker::Worker;
    use std::time::Duration;
    use veneur_statsd::parse;

    async fn start_server(workers: usize) -> (std::net::SocketAddr, Vec<WorkerHandle>, CancellationToken) {
        let counters = Arc::new(Counters::default());
        let mut handles = Vec::new();
        for _ in 0..workers {
            let (worker, handle) =
                Worker::new(0.01, Duration::from_secs(10), Arc::clone(&counters));
            tokio::spawn(worker.run());
            handles.push(handle);
        }
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(HttpState {
            workers: handles.clone(),
            counters,
        });
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, state, cancel.clone()));
        (addr, handles, cancel)
    }

    #[tokio::test]
    async fn test_healthcheck_and_version() {
        let (addr, _, cancel) = start_server(1).await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("http://{addr}{HEALTHCHECK_PATH}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "ok\n");

        let response = client
            .get(format!("http://{addr}{VERSION_PATH}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_counters_endpoint_serves_json() {
        let (addr, _, cancel) = start_server(1).await;
        let response = reqwest::get(format!("http://{addr}{COUNTERS_PATH}"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["parse_errors"], 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_import_merges_into_workers() {
        let (addr, handles, cancel) = start_server(4).await;

        let key = parse("fleet.req:0|c").unwrap().key();
        let entries = vec![ForwardEntry::new(
            &key,
            AccumulatorState::Counter { sum: 12.0 },
        )];
        let response = reqwest::Client::new()
            .post(format!("http://{addr}{IMPORT_PATH}"))
            .json(&entries)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "{\"imported\":1}");

        // The entry routed to exactly the worker the digest names.
        let index = (key.digest() % handles.len() as u64) as usize;
        let snapshot = handles[index].snapshot().await;
        assert!(snapshot.contains_key(&key));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_import_rejects_malformed_payload() {
        let (addr, _, cancel) = start_server(1).await;
        let response = reqwest::Client::new()
            .post(format!("http://{addr}{IMPORT_PATH}"))
            .body("this is not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let (addr, _, cancel) = start_server(1).await;
        let response = reqwest::get(format!("http://{addr}/nope")).await.unwrap();
        assert_eq!(response.status(), 404);

        cancel.cancel();
    }
}
