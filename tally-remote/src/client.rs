// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fire-and-forget streaming client towards one remote node.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::SinkExt;
use tally_core::Event;
use tally_queue::rate_limited;
use tokio::{
    net::TcpStream,
    runtime::Handle,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

use crate::{MAX_FRAME_LENGTH, codec::EventCodec};

#[derive(Clone, Debug)]
pub struct RemoteClientConfig {
    /// Frames waiting to be written. Sends beyond this are dropped.
    pub queue_capacity: usize,
    pub connect_timeout: Duration,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Counters of a [`RemoteClient`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteClientStats {
    /// Events written and flushed to the socket.
    pub sent: u64,
    /// Events dropped, because they failed to encode, the queue was full or the
    /// connection failed.
    pub dropped: u64,
    /// Connect and write failures.
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// Streams events to one remote node.
///
/// [`RemoteClient::send`] never blocks and never fails the caller: the event is encoded,
/// queued and written by a background task that connects lazily and reconnects after any
/// error. Whatever cannot be delivered is logged and dropped.
pub struct RemoteClient {
    addr: SocketAddr,
    codec: EventCodec,
    tx: mpsc::Sender<Bytes>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl RemoteClient {
    /// Spawn the writer task for `addr` on `runtime`.
    pub fn start(
        runtime: &Handle,
        addr: SocketAddr,
        codec: EventCodec,
        config: RemoteClientConfig,
    ) -> Self {
        assert!(config.queue_capacity > 0, "queue_capacity must not be zero");
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let counters = Arc::new(Counters::default());
        let task = runtime.spawn(
            Writer {
                addr,
                connect_timeout: config.connect_timeout,
                counters: Arc::clone(&counters),
                connection: None,
            }
            .run(rx),
        );
        Self {
            addr,
            codec,
            tx,
            counters,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue `event` for the remote node. Returns whether it was queued.
    pub fn send(&self, event: &Event) -> bool {
        let frame = match self.codec.encode_event(event) {
            Ok(frame) => frame,
            Err(err) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                rate_limited!(
                    Duration::from_secs(1),
                    tracing::warn!(addr = %self.addr, identity = %event.identity(), %err, "dropping event that failed to encode")
                );
                return false;
            }
        };
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                rate_limited!(
                    Duration::from_secs(1),
                    tracing::warn!(addr = %self.addr, "remote send queue full, dropping event")
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> RemoteClientStats {
        RemoteClientStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting events and wait until the queued ones were written or dropped.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(err) = self.task.await {
            tracing::error!(addr = %self.addr, %err, "remote writer task failed");
        }
    }
}

struct Writer {
    addr: SocketAddr,
    connect_timeout: Duration,
    counters: Arc<Counters>,
    connection: Option<FramedWrite<TcpStream, LengthDelimitedCodec>>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<Bytes>) {
        while let Some(frame) = rx.recv().await {
            if self.connection.is_none() {
                match self.connect().await {
                    Ok(connection) => self.connection = Some(connection),
                    Err(err) => {
                        self.fail(1, &err);
                        continue;
                    }
                }
            }
            let Some(connection) = self.connection.as_mut() else {
                continue;
            };

            // write whatever is already queued, then flush once
            let mut pending = 1u64;
            let mut result = connection.feed(frame).await;
            while result.is_ok() {
                match rx.try_recv() {
                    Ok(frame) => {
                        pending += 1;
                        result = connection.feed(frame).await;
                    }
                    Err(_) => break,
                }
            }
            if result.is_ok() {
                result = SinkExt::<Bytes>::flush(connection).await;
            }
            match result {
                Ok(()) => {
                    self.counters.sent.fetch_add(pending, Ordering::Relaxed);
                }
                Err(err) => {
                    self.connection = None;
                    self.fail(pending, &err);
                }
            }
        }
        if let Some(mut connection) = self.connection.take() {
            // best effort, everything fed was already flushed
            let _ = SinkExt::<Bytes>::close(&mut connection).await;
        }
        tracing::debug!(addr = %self.addr, "remote writer exiting");
    }

    async fn connect(&self) -> io::Result<FramedWrite<TcpStream, LengthDelimitedCodec>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        tracing::debug!(addr = %self.addr, "connected to remote node");
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        Ok(FramedWrite::new(stream, codec))
    }

    fn fail(&self, dropped: u64, err: &io::Error) {
        self.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        rate_limited!(
            Duration::from_secs(1),
            tracing::warn!(addr = %self.addr, dropped, %err, "remote send failed, dropping events")
        );
    }
}
