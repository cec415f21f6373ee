// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingest listeners: a UDP datagram loop and a TCP line-framed accept loop.
//!
//! Both split packets into `\n`-separated lines, parse each line, and hand
//! the sample to the worker selected by `digest mod N`. Parse errors drop
//! the line, count, and never stop the listener.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use veneur_statsd::{parse, ParseError};

use crate::telemetry::Counters;
use crate::worker::WorkerHandle;

/// Routes parsed samples to their owning worker.
#[derive(Clone)]
pub struct IngestRouter {
    workers: Vec<WorkerHandle>,
    counters: Arc<Counters>,
}

impl IngestRouter {
    pub fn new(workers: Vec<WorkerHandle>, counters: Arc<Counters>) -> IngestRouter {
        IngestRouter { workers, counters }
    }

    /// Parses and routes one line. Malformed lines are dropped and counted.
    pub fn route_line(&self, line: &str) {
        match parse(line) {
            Ok(metric) => {
                Counters::incr(&self.counters.samples);
                let index = (metric.key().digest() % self.workers.len() as u64) as usize;
                self.workers[index].submit(metric);
            }
            Err(e) => {
                Counters::incr(&self.counters.parse_errors);
                // Unknown types are common from stray emitters; keep those
                // out of the error log.
                match e {
                    ParseError::UnknownType(_) => debug!("unsupported metric line {line:?}: {e}"),
                    _ => error!("failed to parse metric line {line:?}: {e}"),
                }
            }
        }
    }

    /// Splits a packet into lines and routes each one independently; a bad
    /// line does not take its packet siblings down with it.
    pub fn route_packet(&self, packet: &str) {
        for line in packet.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            self.route_line(line);
        }
    }
}

/// The UDP ingest loop. One datagram is one packet.
pub struct UdpIngest {
    socket: UdpSocket,
    router: IngestRouter,
    counters: Arc<Counters>,
    max_packet_size: usize,
    cancel: CancellationToken,
}

impl UdpIngest {
    pub fn new(
        socket: UdpSocket,
        router: IngestRouter,
        counters: Arc<Counters>,
        max_packet_size: usize,
        cancel: CancellationToken,
    ) -> UdpIngest {
        UdpIngest {
            socket,
            router,
            counters,
            max_packet_size,
            cancel,
        }
    }

    pub async fn run(self) {
        // One extra byte so an oversize datagram is detectable instead of
        // silently truncated at exactly the limit.
        let mut buf = vec![0u8; self.max_packet_size + 1];
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, src) = match received {
                Ok(received) => received,
                Err(e) => {
                    error!("udp receive error: {e}");
                    continue;
                }
            };
            Counters::incr(&self.counters.packets);
            if len > self.max_packet_size {
                Counters::incr(&self.counters.oversize_packets);
                warn!("dropping oversize packet ({len}+ bytes) from {src}");
                continue;
            }
            match std::str::from_utf8(&buf[..len]) {
                Ok(packet) => {
                    trace!("received packet from {src}: {packet:?}");
                    self.router.route_packet(packet);
                }
                Err(_) => {
                    Counters::incr(&self.counters.parse_errors);
                    warn!("dropping non-utf8 packet from {src}");
                }
            }
        }
        debug!("udp ingest stopped");
    }
}

/// The TCP ingest loop. Each connection streams `\n`-framed packets.
pub struct TcpIngest {
    listener: TcpListener,
    router: IngestRouter,
    counters: Arc<Counters>,
    max_packet_size: usize,
    cancel: CancellationToken,
}

impl TcpIngest {
    pub fn new(
        listener: TcpListener,
        router: IngestRouter,
        counters: Arc<Counters>,
        max_packet_size: usize,
        cancel: CancellationToken,
    ) -> TcpIngest {
        TcpIngest {
            listener,
            router,
            counters,
            max_packet_size,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut connections = JoinSet::new();
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
                Some(_) = connections.join_next() => continue,
            };
            match accepted {
                Ok((stream, src)) => {
                    debug!("tcp ingest connection from {src}");
                    let router = self.router.clone();
                    let counters = Arc::clone(&self.counters);
                    let max_packet_size = self.max_packet_size;
                    let cancel = self.cancel.clone();
                    connections.spawn(async move {
                        if let Err(e) =
                            read_lines(stream, router, counters, max_packet_size, cancel).await
                        {
                            debug!("tcp connection from {src} closed: {e}");
                        }
                    });
                }
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
                    error!("tcp accept error: {e}");
                    continue;
                }
            }
        }
        connections.shutdown().await;
        debug!("tcp ingest stopped");
    }
}

async fn read_lines(
    stream: TcpStream,
    router: IngestRouter,
    counters: Arc<Counters>,
    max_packet_size: usize,
    cancel: CancellationToken,
) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read_until(b'\n', &mut line) => read?,
        };
        if read == 0 {
            return Ok(());
        }
        Counters::incr(&counters.packets);
        if line.ends_with(b"\n") {
            line.pop();
        }
        if line.len() > max_packet_size {
            Counters::incr(&counters.oversize_packets);
            continue;
        }
        match std::str::from_utf8(&line) {
            Ok(packet) => router.route_packet(packet),
            Err(_) => Counters::incr(&counters.parse_errors),
        }
    }
}
