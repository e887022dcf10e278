// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Accepts event streams from other nodes.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use tally_core::Event;
use tally_queue::rate_limited;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::JoinHandle,
};
use tokio_util::{
    codec::{FramedRead, LengthDelimitedCodec},
    sync::CancellationToken,
    task::TaskTracker,
};

use crate::{MAX_FRAME_LENGTH, codec::EventCodec};

/// Where decoded events go. Returns whether the event was accepted.
///
/// Called from the receiver's async tasks, so it must not block.
pub trait EventSink: Send + Sync + 'static {
    fn accept(&self, event: Event) -> bool;
}

impl<F> EventSink for F
where
    F: Fn(Event) -> bool + Send + Sync + 'static,
{
    fn accept(&self, event: Event) -> bool {
        self(event)
    }
}

/// Counters of a [`RemoteReceiver`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteReceiverStats {
    pub connections: u64,
    /// Events the sink accepted.
    pub received: u64,
    /// Events the sink refused.
    pub rejected: u64,
    /// Frames that failed to decode and were skipped.
    pub decode_errors: u64,
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    received: AtomicU64,
    rejected: AtomicU64,
    decode_errors: AtomicU64,
}

/// TCP listener decoding length-prefixed event frames into an [`EventSink`].
///
/// A frame that fails to decode is logged and skipped, the connection stays open.
pub struct RemoteReceiver {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    counters: Arc<Counters>,
    accept_task: JoinHandle<()>,
}

impl RemoteReceiver {
    /// Bind `addr` and start accepting connections on the current runtime.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        codec: EventCodec,
        sink: Arc<dyn EventSink>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let counters = Arc::new(Counters::default());
        let acceptor = Acceptor {
            listener,
            codec,
            sink,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            counters: Arc::clone(&counters),
        };
        let accept_task = tokio::spawn(acceptor.run());
        tracing::info!(%local_addr, "remote receiver listening");
        Ok(Self {
            local_addr,
            cancel,
            tracker,
            counters,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> RemoteReceiverStats {
        RemoteReceiverStats {
            connections: self.counters.connections.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting and close every open connection.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.accept_task.await {
            tracing::error!(%err, "remote accept task failed");
        }
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(local_addr = %self.local_addr, "remote receiver shut down");
    }
}

struct Acceptor {
    listener: TcpListener,
    codec: EventCodec,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    counters: Arc<Counters>,
}

impl Acceptor {
    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.counters.connections.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(%peer, "accepted remote connection");
                        let connection = Connection {
                            peer,
                            codec: self.codec.clone(),
                            sink: Arc::clone(&self.sink),
                            counters: Arc::clone(&self.counters),
                        };
                        self.tracker.spawn(connection.run(stream, self.cancel.clone()));
                    }
                    Err(err) => {
                        rate_limited!(
                            Duration::from_secs(1),
                            tracing::warn!(%err, "failed to accept remote connection")
                        );
                    }
                },
            }
        }
    }
}

struct Connection {
    peer: SocketAddr,
    codec: EventCodec,
    sink: Arc<dyn EventSink>,
    counters: Arc<Counters>,
}

impl Connection {
    async fn run(self, stream: TcpStream, cancel: CancellationToken) {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        let mut frames = FramedRead::new(stream, codec);
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.next() => frame,
            };
            match frame {
                None => break,
                Some(Err(err)) => {
                    rate_limited!(
                        Duration::from_secs(1),
                        tracing::warn!(peer = %self.peer, %err, "remote connection failed")
                    );
                    break;
                }
                Some(Ok(frame)) => match self.codec.decode_event(&frame) {
                    Ok(event) => {
                        let counter = if self.sink.accept(event) {
                            &self.counters.received
                        } else {
                            &self.counters.rejected
                        };
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                        rate_limited!(
                            Duration::from_secs(1),
                            tracing::warn!(peer = %self.peer, %err, "skipping undecodable remote frame")
                        );
                    }
                },
            }
        }
        tracing::debug!(peer = %self.peer, "remote connection closed");
    }
}
