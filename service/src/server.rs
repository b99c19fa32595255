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

//! Chat relay server implementation
//!
//! The ChatServer owns the listening socket, the membership registry and the
//! accept loop. Each accepted socket is wrapped, registered and handed to its
//! own supervisor task, and the loop goes straight back to accepting.

use crate::{
    BroadcastRouter, ConnectionId, ConnectionInfo, ConnectionSupervisor, LineConnection,
    MembershipRegistry, Result, ServerConfig, ServerError, ServerMetrics, ServerSnapshot,
    SupervisorConfig,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay after a failed accept so a persistent error cannot spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Chat relay server
///
/// # Example
///
/// ```no_run
/// use chatrelay_service::{ChatServer, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = ChatServer::bind(ServerConfig::with_port(5000)).await?;
///     server.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await?;
///     Ok(())
/// }
/// ```
pub struct ChatServer {
    /// Server configuration
    config: ServerConfig,
    /// Live members
    registry: Arc<MembershipRegistry>,
    /// Fan-out over the registry
    router: BroadcastRouter,
    /// Server metrics
    metrics: Arc<ServerMetrics>,
    /// Listener, taken by the accept loop when the server starts
    listener: Mutex<Option<TcpListener>>,
    /// Actual bind address
    bind_address: SocketAddr,
    /// Server start time
    started_at: Instant,
    /// Running flag
    running: AtomicBool,
    /// Stops the accept loop
    shutdown: CancellationToken,
    /// Accept loop task handle
    accept_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChatServer {
    /// Bind the listening endpoint
    ///
    /// This validates the configuration and binds, but does not start
    /// accepting connections. Call `start()` to begin accepting.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate().map_err(ServerError::InvalidConfig)?;

        let listener = TcpListener::bind(config.bind_address)
            .await
            .map_err(|source| ServerError::Bind {
                address: config.bind_address,
                source,
            })?;
        let bind_address = listener.local_addr()?;

        let metrics = Arc::new(ServerMetrics::new());
        let registry = Arc::new(MembershipRegistry::new());
        let router = BroadcastRouter::new(registry.clone(), metrics.clone());

        info!("Chat server bound to {}", bind_address);

        Ok(Self {
            config,
            registry,
            router,
            metrics,
            listener: Mutex::new(Some(listener)),
            bind_address,
            started_at: Instant::now(),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            accept_handle: tokio::sync::Mutex::new(None),
        })
    }

    /// Start accepting connections
    ///
    /// Spawns the accept loop and returns immediately. A server can be started
    /// once.
    pub async fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .map_err(|_| ServerError::AlreadyRunning)?
            .take()
            .ok_or(ServerError::AlreadyRunning)?;
        self.running.store(true, Ordering::SeqCst);

        info!("Starting chat server on {}", self.bind_address);

        let accept_loop = AcceptLoop {
            listener,
            router: self.router.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            next_id: AtomicU64::new(1),
        };
        *self.accept_handle.lock().await = Some(tokio::spawn(accept_loop.run()));

        Ok(())
    }

    /// Start, wait for `signal`, then shut down
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.shutdown().await
    }

    /// Shutdown the server
    ///
    /// Stops accepting, closes every member's connection and waits up to the
    /// configured shutdown timeout for their supervisors to finish.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ServerError::NotRunning);
        }

        info!("Shutting down chat server");
        self.shutdown.cancel();

        if let Some(handle) = self.accept_handle.lock().await.take() {
            // The loop itself waits up to shutdown_timeout for supervisors
            let grace = self.config.shutdown_timeout + Duration::from_secs(1);
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("Accept loop did not finish within {:?}", grace);
            }
        }

        info!("Chat server shutdown complete");
        Ok(())
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the server's bind address
    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// Get the number of registered connections
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Get a snapshot of the server state
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            active_connections: self.registry.len(),
            total_connections: self.metrics.total_connections(),
            bind_address: self.bind_address,
            uptime: self.started_at.elapsed(),
            started_at: self.started_at,
        }
    }

    /// Get info for every registered connection
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.infos()
    }

    /// Get the membership registry
    pub fn registry(&self) -> Arc<MembershipRegistry> {
        self.registry.clone()
    }

    /// Get the broadcast router
    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    /// Get the server metrics
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl std::fmt::Debug for ChatServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatServer")
            .field("bind_address", &self.bind_address)
            .field("running", &self.is_running())
            .field("connection_count", &self.connection_count())
            .field("uptime", &self.started_at.elapsed())
            .finish()
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("ChatServer dropped while still running");
            self.running.store(false, Ordering::SeqCst);
        }
        self.shutdown.cancel();
    }
}

/// State moved into the accept loop task
struct AcceptLoop {
    listener: TcpListener,
    router: BroadcastRouter,
    metrics: Arc<ServerMetrics>,
    config: ServerConfig,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl AcceptLoop {
    async fn run(self) {
        let mut supervisors = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            // Reap supervisors that have already finished
            while supervisors.try_join_next().is_some() {}

            match accepted {
                Ok((socket, peer_addr)) => self.admit(socket, peer_addr, &mut supervisors),
                Err(e) => {
                    let e = ServerError::Accept(e);
                    error!("{}", e);
                    self.metrics.accept_error();
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        info!("Accept loop terminated");
        self.drain(supervisors).await;
    }

    fn admit(&self, socket: TcpStream, peer_addr: SocketAddr, supervisors: &mut JoinSet<()>) {
        debug!("Accepted connection from {}", peer_addr);

        if let Some(max) = self.config.max_connections {
            if self.router.registry().len() >= max {
                warn!(
                    "Connection limit reached ({}), rejecting connection from {}",
                    max, peer_addr
                );
                self.metrics.connection_rejected();
                drop(socket);
                return;
            }
        }

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (connection, receiver) =
            match LineConnection::from_tcp(socket, id, &self.config.connection_config()) {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Failed to wrap connection from {}: {}", peer_addr, e);
                    self.metrics.accept_error();
                    return;
                }
            };

        let supervisor = ConnectionSupervisor::register(
            connection,
            receiver,
            self.router.clone(),
            self.metrics.clone(),
            SupervisorConfig::from(&self.config),
        );
        info!("Connection {} established from {}", id, peer_addr);

        supervisors.spawn(async move {
            supervisor.run().await;
        });
    }

    /// Close every member and wait for the supervisors to deregister
    async fn drain(&self, mut supervisors: JoinSet<()>) {
        let closed = self.router.registry().close_all();
        debug!("Closed {} connections for shutdown", closed);

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while supervisors.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} supervisors still running after {:?}, aborting",
                supervisors.len(),
                self.config.shutdown_timeout
            );
            supervisors.abort_all();
        }
    }
}
