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

//! Server and connection configuration
//!
//! # Examples
//!
//! ```
//! use chatrelay_service::ServerConfig;
//! use std::time::Duration;
//!
//! let config = ServerConfig::with_port(5000)
//!     .with_max_connections(Some(500))
//!     .with_write_timeout(Duration::from_secs(5))
//!     .with_outbound_queue_capacity(128);
//! assert!(config.validate().is_ok());
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Port the relay listens on when none is configured
pub const DEFAULT_PORT: u16 = 5000;

/// Server configuration
///
/// This structure contains all configuration options for the chat relay.
/// Use the builder pattern methods to customize the configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent connections (None for no limit)
    pub max_connections: Option<usize>,

    /// Number of lines that may be queued for one peer before further lines
    /// to that peer are dropped
    pub outbound_queue_capacity: usize,

    /// Timeout for a single line write
    ///
    /// A peer that cannot accept a line within this duration is disconnected.
    pub write_timeout: Duration,

    /// Close connections that send nothing for this long (None for no limit)
    pub idle_timeout: Option<Duration>,

    /// Maximum accepted line length in bytes, excluding the terminator
    pub max_line_length: usize,

    /// Time to wait for supervisors to finish during shutdown
    pub shutdown_timeout: Duration,

    /// Also deliver each line back to the connection that sent it
    pub echo_to_sender: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_connections: None,
            outbound_queue_capacity: 256,
            write_timeout: Duration::from_secs(10),
            idle_timeout: None,
            max_line_length: 64 * 1024,
            shutdown_timeout: Duration::from_secs(5),
            echo_to_sender: false,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the given bind address
    ///
    /// All other settings will use their default values.
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Default::default()
        }
    }

    /// Create a configuration listening on all interfaces at `port`
    pub fn with_port(port: u16) -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    /// Set the maximum number of concurrent connections
    pub fn with_max_connections(mut self, max: Option<usize>) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-peer outbound queue capacity
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    /// Set the write timeout duration
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the idle timeout duration
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maximum line length
    pub fn with_max_line_length(mut self, length: usize) -> Self {
        self.max_line_length = length;
        self
    }

    /// Set the shutdown timeout duration
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable or disable echoing lines back to their sender
    pub fn with_echo_to_sender(mut self, enabled: bool) -> Self {
        self.echo_to_sender = enabled;
        self
    }

    /// Per-connection settings derived from this configuration
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            outbound_queue_capacity: self.outbound_queue_capacity,
            write_timeout: self.write_timeout,
            max_line_length: self.max_line_length,
        }
    }

    /// Validate the configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == Some(0) {
            return Err("max_connections must be greater than 0".to_string());
        }

        if self.outbound_queue_capacity == 0 {
            return Err("outbound_queue_capacity must be greater than 0".to_string());
        }

        if self.write_timeout.is_zero() {
            return Err("write_timeout must be greater than 0".to_string());
        }

        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err("idle_timeout must be greater than 0".to_string());
        }

        if self.max_line_length == 0 {
            return Err("max_line_length must be greater than 0".to_string());
        }

        if self.shutdown_timeout.is_zero() {
            return Err("shutdown_timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Settings for a single line connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Outbound queue capacity in lines
    pub outbound_queue_capacity: usize,
    /// Timeout for a single line write
    pub write_timeout: Duration,
    /// Maximum accepted line length in bytes
    pub max_line_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ServerConfig::default().connection_config()
    }
}
