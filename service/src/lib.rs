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

//! Chat Relay Service
//!
//! Accepts concurrent TCP connections and relays every newline-delimited line a
//! client sends to all other connected clients.
//!
//! - Membership tracked in a sharded concurrent map with snapshot iteration
//! - One supervisor task per connection, with guaranteed deregistration
//! - Per-connection bounded outbound queues, so a slow peer only stalls itself
//! - Serialized writes per connection; concurrent sends never interleave
//! - Lock-free metrics and structured logging
//!
//! # Architecture
//!
//! ```text
//! ChatServer (accept loop)
//!     ↓
//! ConnectionSupervisor → BroadcastRouter → MembershipRegistry
//!     ↓                                         ↓
//! LineReceiver                             LineConnection (writer task)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use chatrelay_service::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ChatServer::bind(ServerConfig::default()).await?;
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;
mod metrics;
mod registry;
mod result;
mod router;
mod server;
mod supervisor;
mod types;

pub use config::{ConnectionConfig, DEFAULT_PORT, ServerConfig};
pub use connection::{LineConnection, LineReceiver};
pub use error::{Result, ServerError};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use registry::MembershipRegistry;
pub use result::{ReceiveError, ReceiveResult, SendError};
pub use router::{BroadcastResult, BroadcastRouter};
pub use server::ChatServer;
pub use supervisor::{ConnectionSupervisor, SupervisorConfig, TerminationReason};
pub use types::{ConnectionId, ConnectionInfo, ServerSnapshot, SupervisorState};
