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

//! Connection supervisor
//!
//! One supervisor runs per accepted connection. It owns the connection's
//! receiving half and walks a single-use state machine:
//!
//! ```text
//! Registered → Reading → Terminated
//! ```
//!
//! Every line read in `Reading` is handed to the broadcast router. End of
//! stream, a read error, an idle timeout or a local close moves the supervisor
//! to `Terminated`, where it deregisters and closes the connection. A
//! supervisor dropped before it terminates, including one whose task was
//! aborted, performs the same cleanup.

use crate::{
    BroadcastRouter, ConnectionId, LineConnection, LineReceiver, ReceiveError, ServerConfig,
    ServerMetrics, SupervisorState,
};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace};

/// Supervisor configuration
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// Terminate if no line arrives within this duration (None for no limit)
    pub idle_timeout: Option<Duration>,
    /// Also deliver each line back to its sender
    pub echo_to_sender: bool,
}

impl From<&ServerConfig> for SupervisorConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            echo_to_sender: config.echo_to_sender,
        }
    }
}

/// Why a supervisor stopped reading
#[derive(Debug)]
pub enum TerminationReason {
    /// The peer closed the stream
    EndOfStream,
    /// Reading failed
    ReceiveError(ReceiveError),
    /// No line arrived within the idle timeout
    IdleTimeout,
    /// The connection was closed locally (shutdown or a stalled write)
    Closed,
    /// The supervisor was dropped before its connection terminated
    Aborted,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "end of stream"),
            Self::ReceiveError(e) => write!(f, "receive error: {e}"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Closed => write!(f, "closed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Supervisor that reads from one connection and relays its lines
pub struct ConnectionSupervisor {
    connection: LineConnection,
    receiver: LineReceiver,
    router: BroadcastRouter,
    metrics: Arc<ServerMetrics>,
    config: SupervisorConfig,
    state: Arc<AtomicU8>,
}

impl ConnectionSupervisor {
    /// Add `connection` to the router's registry and create its supervisor
    ///
    /// The returned supervisor is in the `Registered` state; call [`run`] to
    /// start reading. Dropping it without running deregisters the connection.
    ///
    /// [`run`]: ConnectionSupervisor::run
    pub fn register(
        connection: LineConnection,
        receiver: LineReceiver,
        router: BroadcastRouter,
        metrics: Arc<ServerMetrics>,
        config: SupervisorConfig,
    ) -> Self {
        router.registry().add(connection.clone());
        metrics.connection_opened();
        debug!(connection_id = %connection.id(), "Connection registered");

        Self {
            connection,
            receiver,
            router,
            metrics,
            config,
            state: Arc::new(AtomicU8::new(SupervisorState::Registered.as_u8())),
        }
    }

    /// Get the supervised connection's id
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Get the current state
    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Shared handle to the state, readable after `run` has consumed the supervisor
    pub fn state_handle(&self) -> Arc<AtomicU8> {
        self.state.clone()
    }

    fn set_state(&self, new_state: SupervisorState) {
        self.state.store(new_state.as_u8(), Ordering::Release);
    }

    /// Run until the connection terminates, then clean up
    pub async fn run(mut self) -> TerminationReason {
        self.set_state(SupervisorState::Reading);

        let reason = self.read_loop().await;

        self.terminate(&reason);
        reason
    }

    async fn read_loop(&mut self) -> TerminationReason {
        let id = self.connection.id();
        loop {
            let received = match self.config.idle_timeout {
                Some(limit) => match timeout(limit, self.receiver.receive_line()).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.metrics.idle_timeout();
                        return TerminationReason::IdleTimeout;
                    }
                },
                None => self.receiver.receive_line().await,
            };

            match received {
                Ok(Some(line)) => {
                    self.metrics.line_received();
                    trace!(connection_id = %id, line = %line, "Relaying line");
                    let message: Arc<str> = line.into();

                    if self.config.echo_to_sender {
                        if let Err(e) = self.router.send_to(id, message.clone()) {
                            debug!(connection_id = %id, error = %e, "Echo failed");
                        }
                    }
                    self.router.broadcast(message, id);
                }
                Ok(None) => return TerminationReason::EndOfStream,
                Err(ReceiveError::Closed) => return TerminationReason::Closed,
                Err(e) => {
                    self.metrics.receive_error();
                    return TerminationReason::ReceiveError(e);
                }
            }
        }
    }

    /// Deregister and close; both steps run regardless of each other's outcome
    fn terminate(&self, reason: &TerminationReason) {
        let id = self.connection.id();
        let was_member = self.router.registry().remove(id).is_some();
        let closed_here = self.connection.close();

        self.metrics
            .connection_closed(self.connection.created_at().elapsed());
        self.set_state(SupervisorState::Terminated);

        info!(
            connection_id = %id,
            reason = %reason,
            was_member,
            closed_here,
            "Connection terminated"
        );
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            self.terminate(&TerminationReason::Aborted);
        }
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("id", &self.connection.id())
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectionConfig, MembershipRegistry, SendError};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};
    use tracing_test::traced_test;

    struct Room {
        router: BroadcastRouter,
        metrics: Arc<ServerMetrics>,
    }

    impl Room {
        fn new() -> Self {
            let metrics = Arc::new(ServerMetrics::new());
            let registry = Arc::new(MembershipRegistry::new());
            Self {
                router: BroadcastRouter::new(registry, metrics.clone()),
                metrics,
            }
        }

        fn join(&self, id: u64, config: SupervisorConfig) -> (ConnectionSupervisor, DuplexStream) {
            let (local, remote) = duplex(4096);
            let (conn, rx) = LineConnection::from_stream(
                local,
                ConnectionId::new(id),
                None,
                &ConnectionConfig::default(),
            );
            let supervisor = ConnectionSupervisor::register(
                conn,
                rx,
                self.router.clone(),
                self.metrics.clone(),
                config,
            );
            (supervisor, remote)
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_supervisor_relays_and_cleans_up() {
        let room = Room::new();
        let (alice, mut alice_remote) = room.join(1, SupervisorConfig::default());
        let (bob, bob_remote) = room.join(2, SupervisorConfig::default());
        assert_eq!(alice.state(), SupervisorState::Registered);
        assert_eq!(room.router.registry().len(), 2);

        let state = alice.state_handle();
        let alice_task = tokio::spawn(alice.run());
        let _bob_task = tokio::spawn(bob.run());

        alice_remote.write_all(b"alice: hi\n").await.unwrap();
        let mut bob_lines = BufReader::new(bob_remote).lines();
        let line = tokio::time::timeout(Duration::from_secs(1), bob_lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("alice: hi"));

        alice_remote.shutdown().await.unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(1), alice_task)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(reason, TerminationReason::EndOfStream));
        assert_eq!(
            SupervisorState::from_u8(state.load(Ordering::Acquire)),
            SupervisorState::Terminated
        );
        assert!(!room.router.registry().contains(ConnectionId::new(1)));
        assert_eq!(room.router.registry().len(), 1);
        assert!(logs_contain("Connection terminated"));
    }

    #[tokio::test]
    async fn test_echo_to_sender() {
        let room = Room::new();
        let config = SupervisorConfig {
            echo_to_sender: true,
            ..SupervisorConfig::default()
        };
        let (alice, alice_remote) = room.join(1, config);
        let _task = tokio::spawn(alice.run());

        let (read_half, mut write_half) = tokio::io::split(alice_remote);
        write_half.write_all(b"alice: echo\n").await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("alice: echo"));
    }

    #[tokio::test]
    async fn test_receive_error_terminates() {
        let room = Room::new();
        let (alice, mut alice_remote) = room.join(1, SupervisorConfig::default());
        let task = tokio::spawn(alice.run());

        alice_remote.write_all(&[0xc3, 0x28, b'\n']).await.unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, TerminationReason::ReceiveError(_)));
        assert!(room.router.registry().is_empty());
        assert_eq!(room.metrics.snapshot().receive_errors, 1);
    }

    #[tokio::test]
    async fn test_local_close_terminates() {
        let room = Room::new();
        let (alice, _alice_remote) = room.join(1, SupervisorConfig::default());
        let task = tokio::spawn(alice.run());

        tokio::task::yield_now().await;
        assert_eq!(room.router.registry().close_all(), 1);

        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, TerminationReason::Closed));
        assert!(room.router.registry().is_empty());
        assert_eq!(room.metrics.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_terminates() {
        let room = Room::new();
        let config = SupervisorConfig {
            idle_timeout: Some(Duration::from_secs(30)),
            ..SupervisorConfig::default()
        };
        let (alice, _alice_remote) = room.join(1, config);

        let reason = alice.run().await;
        assert!(matches!(reason, TerminationReason::IdleTimeout));
        assert!(room.router.registry().is_empty());
        assert_eq!(room.metrics.snapshot().idle_timeouts, 1);
    }

    #[tokio::test]
    async fn test_line_from_peer_with_failed_write_is_relayed() {
        let room = Room::new();
        let (alice, mut alice_remote) = room.join(1, SupervisorConfig::default());
        let (bob, bob_remote) = room.join(2, SupervisorConfig::default());

        // Alice says goodbye and hangs up before anything is read
        alice_remote.write_all(b"alice: bye\n").await.unwrap();
        drop(alice_remote);

        // A delivery to alice now fails on the wire
        tokio::time::timeout(Duration::from_secs(1), async {
            let alice_id = ConnectionId::new(1);
            while room.router.send_to(alice_id, "bob: hello?") != Err(SendError::Closed) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("write to alice should fail");
        assert!(room.router.registry().contains(ConnectionId::new(1)));

        let alice_task = tokio::spawn(alice.run());
        let _bob_task = tokio::spawn(bob.run());

        let mut bob_lines = BufReader::new(bob_remote).lines();
        let line = tokio::time::timeout(Duration::from_secs(1), bob_lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("alice: bye"));

        let reason = tokio::time::timeout(Duration::from_secs(1), alice_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, TerminationReason::EndOfStream));
        assert!(!room.router.registry().contains(ConnectionId::new(1)));
    }

    #[tokio::test]
    async fn test_dropped_supervisor_deregisters() {
        let room = Room::new();
        let (alice, _alice_remote) = room.join(1, SupervisorConfig::default());
        let state = alice.state_handle();
        assert_eq!(room.metrics.active_connections(), 1);

        drop(alice);

        assert!(room.router.registry().is_empty());
        assert_eq!(room.metrics.active_connections(), 0);
        assert_eq!(
            SupervisorState::from_u8(state.load(Ordering::Acquire)),
            SupervisorState::Terminated
        );
    }

    #[tokio::test]
    async fn test_aborted_supervisor_deregisters() {
        let room = Room::new();
        let (alice, _alice_remote) = room.join(1, SupervisorConfig::default());
        let (bob, _bob_remote) = room.join(2, SupervisorConfig::default());
        let bob_conn = room.router.registry().get(ConnectionId::new(2)).unwrap();

        let alice_task = tokio::spawn(alice.run());
        let bob_task = tokio::spawn(bob.run());
        tokio::task::yield_now().await;

        alice_task.abort();
        assert!(alice_task.await.unwrap_err().is_cancelled());

        assert_eq!(room.router.registry().ids(), vec![ConnectionId::new(2)]);
        assert_eq!(room.metrics.active_connections(), 1);

        bob_conn.close();
        let reason = tokio::time::timeout(Duration::from_secs(1), bob_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, TerminationReason::Closed));
        // Normal termination is not repeated when the finished supervisor drops
        assert_eq!(room.metrics.active_connections(), 0);
        assert_eq!(room.metrics.total_connections(), 2);
    }
}
