// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Service wiring: binds the configured sockets, spawns workers, listeners,
//! the HTTP surface, and the flush coordinator, and owns shutdown ordering.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use veneur_statsd::SortedTags;

use crate::config::Config;
use crate::error::{ConfigError, ServerError};
use crate::flush::{span_flusher_from_config, FlushCoordinator};
use crate::forward::ForwardClient;
use crate::http::{self, HttpState};
use crate::listener::{IngestRouter, TcpIngest, UdpIngest};
use crate::sinks::{self, SinkDispatcher};
use crate::spans::{SpanAggregator, SpanIngest};
use crate::telemetry::Counters;
use crate::worker::{Worker, WorkerHandle};

pub struct Server {
    cancel: CancellationToken,
    counters: Arc<Counters>,
    worker_handles: Vec<WorkerHandle>,
    worker_tasks: Vec<JoinHandle<()>>,
    aux_tasks: Vec<JoinHandle<()>>,
    coordinator_task: JoinHandle<()>,
    udp_addr: Option<SocketAddr>,
    tcp_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
    trace_udp_addr: Option<SocketAddr>,
}

async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, ServerError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

impl Server {
    /// Validates the configuration, binds every configured socket, and
    /// spawns the whole task tree. Returns once the service is live.
    pub async fn start(config: Config) -> Result<Server, ServerError> {
        config.validate()?;

        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();
        let deadline = config.sink_deadline();

        // Workers: one task per shard, single-owner accumulators.
        let num_workers = config.effective_workers();
        let mut worker_handles = Vec::with_capacity(num_workers);
        let mut worker_tasks = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (worker, handle) = Worker::new(
                config.percentile_tolerance,
                config.flush_interval(),
                Arc::clone(&counters),
            );
            worker_tasks.push(tokio::spawn(worker.run()));
            worker_handles.push(handle);
        }

        let mut tag_strings = vec![format!("host:{}", config.effective_hostname())];
        tag_strings.extend(config.tags.iter().cloned());
        let base_tags = SortedTags::from_strings(&tag_strings)
            .map_err(|e| ConfigError::Invalid(format!("bad global tag: {e}")))?;

        let sinks = sinks::from_config(&config.sinks, deadline)
            .map_err(|e| ConfigError::Invalid(format!("cannot construct sink: {e}")))?;
        let dispatcher = SinkDispatcher::new(sinks, deadline, Arc::clone(&counters));

        let forward = if config.forward_address.is_empty() {
            None
        } else {
            Some(
                ForwardClient::new(&config.forward_address, deadline)
                    .map_err(|e| ConfigError::Invalid(format!("bad forward_address: {e}")))?,
            )
        };

        let mut aux_tasks = Vec::new();
        let router = IngestRouter::new(worker_handles.clone(), Arc::clone(&counters));

        let mut udp_addr = None;
        if let Some(addr) = config.udp_addr() {
            let socket = bind_udp(addr).await?;
            let local = socket
                .local_addr()
                .map_err(|source| ServerError::Bind { addr, source })?;
            let ingest = UdpIngest::new(
                socket,
                router.clone(),
                Arc::clone(&counters),
                config.max_packet_size,
                cancel.clone(),
            );
            aux_tasks.push(tokio::spawn(ingest.run()));
            info!("statsd-udp: listening on {local}");
            udp_addr = Some(local);
        }

        let mut tcp_addr = None;
        if let Some(addr) = config.tcp_addr() {
            let listener = bind_tcp(addr).await?;
            let local = listener
                .local_addr()
                .map_err(|source| ServerError::Bind { addr, source })?;
            let ingest = TcpIngest::new(
                listener,
                router.clone(),
                Arc::clone(&counters),
                config.max_packet_size,
                cancel.clone(),
            );
            aux_tasks.push(tokio::spawn(ingest.run()));
            info!("statsd-tcp: listening on {local}");
            tcp_addr = Some(local);
        }

        // The span buffer exists whenever spans can arrive; the flusher
        // only when there is somewhere to send them.
        let mut trace_udp_addr = None;
        let mut span_aggregator = None;
        if let Some(addr) = config.trace_udp_addr() {
            let socket = bind_udp(addr).await?;
            let local = socket
                .local_addr()
                .map_err(|source| ServerError::Bind { addr, source })?;
            let aggregator = Arc::new(Mutex::new(SpanAggregator::new(Arc::clone(&counters))));
            span_aggregator = Some(Arc::clone(&aggregator));
            let ingest = SpanIngest::new(
                socket,
                aggregator,
                Arc::clone(&counters),
                config.max_packet_size,
                cancel.clone(),
            );
            aux_tasks.push(tokio::spawn(ingest.run()));
            info!("trace-udp: listening on {local}");
            trace_udp_addr = Some(local);
        }
        let span_flusher = span_flusher_from_config(
            span_aggregator,
            &config.trace_address,
            deadline,
            Arc::clone(&counters),
        );

        let mut http_addr = None;
        if let Some(addr) = config.http_addr() {
            let listener = bind_tcp(addr).await?;
            let local = listener
                .local_addr()
                .map_err(|source| ServerError::Bind { addr, source })?;
            let state = Arc::new(HttpState {
                workers: worker_handles.clone(),
                counters: Arc::clone(&counters),
            });
            aux_tasks.push(tokio::spawn(http::serve(listener, state, cancel.clone())));
            info!("http: listening on {local}");
            http_addr = Some(local);
        }

        let coordinator = FlushCoordinator::new(
            worker_handles.clone(),
            config.flush_interval(),
            config.quantiles.clone(),
            base_tags,
            forward,
            dispatcher,
            span_flusher,
            Arc::clone(&counters),
        );
        let coordinator_task = tokio::spawn(coordinator.run(cancel.clone()));

        Ok(Server {
            cancel,
            counters,
            worker_handles,
            worker_tasks,
            aux_tasks,
            coordinator_task,
            udp_addr,
            tcp_addr,
            http_addr,
            trace_udp_addr,
        })
    }

    /// Blocks until a shutdown signal, then drains and exits. A flush
    /// coordinator that dies on its own is fatal.
    pub async fn run(mut self) -> Result<(), ServerError> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
            }
            _ = &mut self.coordinator_task => {
                error!("flush coordinator terminated unexpectedly");
                return Err(ServerError::Runtime(
                    "flush coordinator terminated unexpectedly".to_string(),
                ));
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Ordered shutdown: stop listeners, let the coordinator run its final
    /// deadline-bounded flush, then stop the workers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.coordinator_task.await {
            error!("flush coordinator task failed during shutdown: {e}");
        }
        for handle in &self.worker_handles {
            handle.shutdown().await;
        }
        for task in self.worker_tasks {
            let _ = task.await;
        }
        for task in self.aux_tasks {
            let _ = task.await;
        }
        info!("server stopped");
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn trace_udp_addr(&self) -> Option<SocketAddr> {
        self.trace_udp_addr
    }
}
