//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Line-oriented connections
//!
//! An accepted stream is split in two. The read half becomes a [`LineReceiver`]
//! owned by the connection's supervisor. The write half is moved into a writer
//! task that drains a bounded queue, so any number of tasks may call
//! [`LineConnection::send_line`] without their lines interleaving on the wire
//! and without waiting on a slow peer.
//!
//! A failed write only ends the sending side. The receiver keeps reading until
//! the peer's own stream ends, so nothing the peer already sent is lost.

use crate::{
    ConnectionConfig, ConnectionId, ConnectionInfo, ReceiveError, ReceiveResult, SendError,
};
use futures_util::{FutureExt, SinkExt, StreamExt};
use metrics::counter;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// State shared by the sending handle, the receiver and the writer task
struct Shared {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    created_at: Instant,
    closed: AtomicBool,
    send_closed: AtomicBool,
    cancel: CancellationToken,
    lines_sent: AtomicU64,
    lines_received: AtomicU64,
}

impl Shared {
    /// Returns `true` only for the call that performed the close
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True after close or once the writer task has stopped
    fn is_send_closed(&self) -> bool {
        self.is_closed() || self.send_closed.load(Ordering::Acquire)
    }
}

/// Sending handle for one connected participant
///
/// Cloning is cheap; the registry, the router and the supervisor all hold
/// clones of the same connection.
#[derive(Clone)]
pub struct LineConnection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Arc<str>>,
}

/// Receiving half of a connection, owned by exactly one supervisor
pub struct LineReceiver {
    shared: Arc<Shared>,
    lines: FramedRead<BoxedReader, LinesCodec>,
    max_line_length: usize,
}

impl LineConnection {
    /// Wrap an accepted TCP stream
    #[instrument(skip(socket, config), fields(connection_id = %id))]
    pub fn from_tcp(
        socket: TcpStream,
        id: ConnectionId,
        config: &ConnectionConfig,
    ) -> std::io::Result<(Self, LineReceiver)> {
        let peer_addr = socket.peer_addr()?;
        socket.set_nodelay(true)?;
        info!(peer_addr = %peer_addr, "Creating new line connection");
        Ok(Self::from_stream(socket, id, Some(peer_addr), config))
    }

    /// Wrap any bidirectional byte stream
    ///
    /// Spawns the connection's writer task, so this must be called from within
    /// a Tokio runtime.
    pub fn from_stream<S>(
        stream: S,
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        config: &ConnectionConfig,
    ) -> (Self, LineReceiver)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::channel(config.outbound_queue_capacity.max(1));

        let shared = Arc::new(Shared {
            id,
            peer_addr,
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
            send_closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            lines_sent: AtomicU64::new(0),
            lines_received: AtomicU64::new(0),
        });

        let reader: BoxedReader = Box::pin(read_half);
        let writer: BoxedWriter = Box::pin(write_half);

        tokio::spawn(write_loop(
            shared.clone(),
            FramedWrite::new(writer, LinesCodec::new()),
            queue,
            config.write_timeout,
        ));

        let receiver = LineReceiver {
            shared: shared.clone(),
            lines: FramedRead::new(
                reader,
                LinesCodec::new_with_max_length(config.max_line_length),
            ),
            max_line_length: config.max_line_length,
        };

        (Self { shared, outbound }, receiver)
    }

    /// Get the connection ID
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Get the peer address, if the transport has one
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Get when the connection was created
    pub fn created_at(&self) -> Instant {
        self.shared.created_at
    }

    /// Get lines written to the peer
    pub fn lines_sent(&self) -> u64 {
        self.shared.lines_sent.load(Ordering::Relaxed)
    }

    /// Get lines read from the peer
    pub fn lines_received(&self) -> u64 {
        self.shared.lines_received.load(Ordering::Relaxed)
    }

    /// Check whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Check whether lines can still be queued for the peer
    ///
    /// Becomes `false` on close and when a write to the peer fails.
    pub fn is_writable(&self) -> bool {
        !self.shared.is_send_closed()
    }

    /// Get connection info snapshot
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id(),
            peer_addr: self.peer_addr(),
            created_at: self.created_at(),
            lines_sent: self.lines_sent(),
            lines_received: self.lines_received(),
            closed: self.is_closed(),
        }
    }

    /// Queue one line for the peer
    ///
    /// `line` must not contain a newline; the terminator is appended when the
    /// line is written. This never waits on the peer. Lines queued by one
    /// caller are written in the order they were queued.
    pub fn send_line(&self, line: impl Into<Arc<str>>) -> Result<(), SendError> {
        if self.shared.is_send_closed() {
            return Err(SendError::Closed);
        }
        match self.outbound.try_send(line.into()) {
            // The writer may have stopped after the first check
            Ok(()) if self.shared.is_send_closed() => Err(SendError::Closed),
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                counter!("chatrelay.errors.queue_full").increment(1);
                Err(SendError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Close the connection
    ///
    /// Safe to call any number of times from any task. Only the first call has
    /// an effect, and only that call returns `true`. Future sends fail with
    /// `Closed`, receives fail once lines already arrived are consumed, and the
    /// writer task shuts the transport down.
    pub fn close(&self) -> bool {
        let closed = self.shared.close();
        if closed {
            debug!(connection_id = %self.shared.id, "Connection closed");
        }
        closed
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }
}

impl LineReceiver {
    /// Get the connection ID
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Receive the next line
    ///
    /// Returns `Ok(None)` when the peer has closed the stream. The line
    /// terminator (`\n` or `\r\n`) is stripped. An unterminated final line is
    /// returned before end of stream.
    ///
    /// After a local close, lines that have already arrived are still returned
    /// one per call; once none is ready this fails with `Closed`.
    #[instrument(level = "trace", skip(self), fields(connection_id = %self.shared.id))]
    pub async fn receive_line(&mut self) -> ReceiveResult<Option<String>> {
        let next = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => None,
            next = self.lines.next() => Some(next),
        };
        let next = match next {
            Some(next) => next,
            None => match self.lines.next().now_or_never() {
                Some(next) => next,
                None => return Err(ReceiveError::Closed),
            },
        };

        match next {
            Some(Ok(line)) => {
                self.shared.lines_received.fetch_add(1, Ordering::Relaxed);
                trace!(line = %line, "Line received");
                Ok(Some(line))
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                Err(ReceiveError::LineTooLong(self.max_line_length))
            }
            Some(Err(LinesCodecError::Io(e))) => Err(ReceiveError::Io(e)),
            None => {
                debug!("Connection stream ended");
                Ok(None)
            }
        }
    }
}

/// Drain the outbound queue into the write half until closed or a write fails
///
/// A failed write stops only this task. A write that times out closes the whole
/// connection, since the peer has stopped reading.
async fn write_loop(
    shared: Arc<Shared>,
    mut sink: FramedWrite<BoxedWriter, LinesCodec>,
    mut queue: mpsc::Receiver<Arc<str>>,
    write_timeout: Duration,
) {
    loop {
        let line = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            line = queue.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            written = tokio::time::timeout(write_timeout, sink.send(line)) => written,
        };

        match written {
            Ok(Ok(())) => {
                shared.lines_sent.fetch_add(1, Ordering::Relaxed);
                counter!("chatrelay.lines.sent").increment(1);
            }
            Ok(Err(e)) => {
                counter!("chatrelay.errors.send").increment(1);
                debug!(connection_id = %shared.id, error = %e, "Write failed, stopping writer");
                break;
            }
            Err(_) => {
                counter!("chatrelay.errors.write_timeout").increment(1);
                warn!(
                    connection_id = %shared.id,
                    timeout = ?write_timeout,
                    "Write timed out, closing connection"
                );
                shared.close();
                break;
            }
        }
    }

    shared.send_closed.store(true, Ordering::Release);
    queue.close();

    // Shut the write half down; bounded so a stalled peer cannot hold the task.
    let shutdown = SinkExt::<Arc<str>>::close(&mut sink);
    if let Ok(Err(e)) = tokio::time::timeout(write_timeout, shutdown).await {
        trace!(connection_id = %shared.id, error = %e, "Shutdown of write half failed");
    }
    trace!(connection_id = %shared.id, "Writer task finished");
}

impl std::fmt::Debug for LineConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineConnection")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("closed", &self.is_closed())
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl std::fmt::Debug for LineReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineReceiver")
            .field("id", &self.shared.id)
            .field("max_line_length", &self.max_line_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};
    use tokio::time::timeout;

    fn pair(
        config: &ConnectionConfig,
        buffer: usize,
    ) -> (LineConnection, LineReceiver, DuplexStream) {
        let (local, remote) = duplex(buffer);
        let (conn, rx) = LineConnection::from_stream(local, ConnectionId::new(1), None, config);
        (conn, rx, remote)
    }

    #[tokio::test]
    async fn test_send_line_appends_terminator() {
        let (conn, _rx, remote) = pair(&ConnectionConfig::default(), 1024);

        conn.send_line("alice: hello").unwrap();
        conn.send_line("alice: again").unwrap();

        let mut lines = BufReader::new(remote).lines();
        let first = timeout(Duration::from_secs(1), lines.next_line()).await.unwrap();
        let second = timeout(Duration::from_secs(1), lines.next_line()).await.unwrap();
        assert_eq!(first.unwrap().as_deref(), Some("alice: hello"));
        assert_eq!(second.unwrap().as_deref(), Some("alice: again"));
    }

    #[tokio::test]
    async fn test_receive_line_strips_terminators() {
        let (_conn, mut rx, mut remote) = pair(&ConnectionConfig::default(), 1024);

        remote.write_all(b"one\ntwo\r\nthree").await.unwrap();
        remote.shutdown().await.unwrap();

        assert_eq!(rx.receive_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(rx.receive_line().await.unwrap().as_deref(), Some("two"));
        // Unterminated final line is still delivered
        assert_eq!(rx.receive_line().await.unwrap().as_deref(), Some("three"));
        assert_eq!(rx.receive_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, mut rx, _remote) = pair(&ConnectionConfig::default(), 1024);

        assert!(conn.close());
        assert!(!conn.close());
        assert!(!conn.clone().close());
        assert!(conn.is_closed());

        assert_eq!(conn.send_line("late"), Err(SendError::Closed));
        assert!(matches!(rx.receive_line().await, Err(ReceiveError::Closed)));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let (conn, mut rx, _remote) = pair(&ConnectionConfig::default(), 1024);

        let reader = tokio::spawn(async move { rx.receive_line().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();

        let result = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(ReceiveError::Closed)));
    }

    #[tokio::test]
    async fn test_close_shuts_down_transport() {
        let (conn, _rx, mut remote) = pair(&ConnectionConfig::default(), 1024);

        conn.close();

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(1), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let config = ConnectionConfig {
            outbound_queue_capacity: 1,
            ..ConnectionConfig::default()
        };
        let (conn, _rx, _remote) = pair(&config, 16);

        // No await between the sends, so the writer task cannot drain the queue
        assert_eq!(conn.send_line("first"), Ok(()));
        assert_eq!(conn.send_line("second"), Err(SendError::QueueFull));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_stalled_peer_is_closed_after_write_timeout() {
        let config = ConnectionConfig {
            write_timeout: Duration::from_millis(50),
            ..ConnectionConfig::default()
        };
        let (conn, _rx, _remote) = pair(&config, 16);

        conn.send_line("x".repeat(1024)).unwrap();

        timeout(Duration::from_secs(2), conn.closed())
            .await
            .expect("stalled connection should be closed");
        assert_eq!(conn.send_line("after"), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_reading() {
        let (conn, mut rx, mut remote) = pair(&ConnectionConfig::default(), 1024);

        remote.write_all(b"bob: last words\n").await.unwrap();
        drop(remote);

        // Writes to a dropped duplex peer fail with a broken pipe
        timeout(Duration::from_secs(1), async {
            while conn.send_line("ping") != Err(SendError::Closed) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("writer should stop after a failed write");
        assert!(!conn.is_writable());
        assert!(!conn.is_closed());

        assert_eq!(
            rx.receive_line().await.unwrap().as_deref(),
            Some("bob: last words")
        );
        assert_eq!(rx.receive_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_returns_lines_already_buffered() {
        let (conn, mut rx, mut remote) = pair(&ConnectionConfig::default(), 1024);

        remote.write_all(b"one\ntwo\n").await.unwrap();
        assert_eq!(rx.receive_line().await.unwrap().as_deref(), Some("one"));

        conn.close();

        assert_eq!(rx.receive_line().await.unwrap().as_deref(), Some("two"));
        assert!(matches!(rx.receive_line().await, Err(ReceiveError::Closed)));
    }

    #[tokio::test]
    async fn test_zero_queue_capacity_is_clamped() {
        let config = ConnectionConfig {
            outbound_queue_capacity: 0,
            ..ConnectionConfig::default()
        };
        let (conn, _rx, _remote) = pair(&config, 1024);

        assert_eq!(conn.send_line("only"), Ok(()));
    }

    #[tokio::test]
    async fn test_send_after_writer_stopped_is_rejected() {
        let (conn, _rx, remote) = pair(&ConnectionConfig::default(), 1024);

        conn.close();
        drop(remote);
        for _ in 0..10 {
            assert_eq!(conn.send_line("late"), Err(SendError::Closed));
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let config = ConnectionConfig {
            max_line_length: 8,
            ..ConnectionConfig::default()
        };
        let (_conn, mut rx, mut remote) = pair(&config, 1024);

        remote.write_all(b"0123456789abcdef\n").await.unwrap();

        assert!(matches!(rx.receive_line().await, Err(ReceiveError::LineTooLong(8))));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_receive_error() {
        let (_conn, mut rx, mut remote) = pair(&ConnectionConfig::default(), 1024);

        remote.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();

        assert!(matches!(rx.receive_line().await, Err(ReceiveError::Io(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_do_not_interleave() {
        let config = ConnectionConfig {
            outbound_queue_capacity: 1024,
            ..ConnectionConfig::default()
        };
        let (conn, _rx, remote) = pair(&config, 64 * 1024);

        let mut expected = HashSet::new();
        let mut senders = Vec::new();
        for task in 0..8 {
            let line = format!("task-{task}: {}", "z".repeat(200));
            expected.insert(line.clone());
            let conn = conn.clone();
            senders.push(tokio::spawn(async move {
                for _ in 0..25 {
                    conn.send_line(line.as_str()).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }

        let mut lines = BufReader::new(remote).lines();
        for _ in 0..200 {
            let line = timeout(Duration::from_secs(2), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert!(expected.contains(&line), "interleaved line: {line}");
        }
    }
}
