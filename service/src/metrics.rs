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

//! Lock-free metrics for the chat relay
//!
//! Every recording method updates an atomic counter on [`ServerMetrics`] and
//! mirrors the event to the global `metrics` recorder, if one is installed.

use metrics::{counter, gauge, histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free server metrics
///
/// All metrics are stored as atomics and can be accessed concurrently
/// without locks. Use the `snapshot()` method to get a consistent view
/// of all metrics at a point in time.
#[derive(Debug)]
pub struct ServerMetrics {
    // Connection counts
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,

    // Traffic
    lines_received: AtomicU64,
    broadcasts: AtomicU64,
    deliveries: AtomicU64,

    // Errors
    accept_errors: AtomicU64,
    receive_errors: AtomicU64,
    delivery_failures: AtomicU64,
    idle_timeouts: AtomicU64,

    // Timing (stored as nanoseconds)
    total_connection_duration_ns: AtomicU64,
    closed_connections: AtomicU64,

    // Server start time
    started_at: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            lines_received: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            idle_timeouts: AtomicU64::new(0),
            total_connection_duration_ns: AtomicU64::new(0),
            closed_connections: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    // Connection tracking

    /// Record a new connection being registered
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.connections.total").increment(1);
        gauge!("chatrelay.connections.active").increment(1.0);
    }

    /// Record a connection being cleaned up
    pub fn connection_closed(&self, duration: Duration) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.closed_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connection_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        gauge!("chatrelay.connections.active").decrement(1.0);
        histogram!("chatrelay.connection.duration").record(duration.as_secs_f64());
    }

    /// Record a connection turned away by the connection limit
    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.connections.rejected").increment(1);
    }

    /// Get the current number of active connections
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get the total number of connections since server start
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    // Traffic tracking

    /// Record a line read from a peer
    pub fn line_received(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.lines.received").increment(1);
    }

    /// Record the outcome of one broadcast
    pub fn broadcast(&self, delivered: usize, failed: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.delivery_failures.fetch_add(failed as u64, Ordering::Relaxed);
        counter!("chatrelay.lines.broadcast").increment(1);
        counter!("chatrelay.deliveries.succeeded").increment(delivered as u64);
        counter!("chatrelay.deliveries.failed").increment(failed as u64);
    }

    // Error tracking

    /// Record a failed accept attempt
    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.errors.accept").increment(1);
    }

    /// Record a read loop ending in an error
    pub fn receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.errors.receive").increment(1);
    }

    /// Record a connection closed for inactivity
    pub fn idle_timeout(&self) {
        self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.errors.idle_timeout").increment(1);
    }

    // Snapshot

    /// Get a consistent snapshot of all metrics
    ///
    /// Counters are read individually, so a snapshot taken while connections
    /// are active may be off by in-flight updates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            idle_timeouts: self.idle_timeouts.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            avg_connection_duration: self.average_connection_duration(),
        }
    }

    fn average_connection_duration(&self) -> Duration {
        let closed = self.closed_connections.load(Ordering::Relaxed);
        if closed == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_connection_duration_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / closed)
    }
}

/// A snapshot of server metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total connections since server start
    pub total_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    /// Connections turned away by the connection limit
    pub rejected_connections: u64,
    /// Lines read from all peers
    pub lines_received: u64,
    /// Broadcasts performed
    pub broadcasts: u64,
    /// Lines queued to recipients
    pub deliveries: u64,
    /// Failed accept attempts
    pub accept_errors: u64,
    /// Read loops that ended in an error
    pub receive_errors: u64,
    /// Per-recipient delivery failures
    pub delivery_failures: u64,
    /// Connections closed for inactivity
    pub idle_timeouts: u64,
    /// Server uptime
    pub uptime: Duration,
    /// Average duration of closed connections
    pub avg_connection_duration: Duration,
}

impl MetricsSnapshot {
    /// Calculate lines received per second
    pub fn lines_received_per_sec(&self) -> f64 {
        if self.uptime.is_zero() {
            return 0.0;
        }
        self.lines_received as f64 / self.uptime.as_secs_f64()
    }

    /// Calculate total error count
    pub fn total_errors(&self) -> u64 {
        self.accept_errors + self.receive_errors + self.delivery_failures + self.idle_timeouts
    }
}
