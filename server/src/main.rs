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

//! Chat relay server binary
//!
//! ```bash
//! chatrelay-server --port 5000
//! RUST_LOG=chatrelay_service=debug chatrelay-server
//! ```

use anyhow::{Context, Result};
use chatrelay_service::{ChatServer, DEFAULT_PORT, ServerConfig};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Line-oriented TCP chat relay", long_about = None)]
struct Args {
    /// Interface to listen on
    #[arg(long, env = "CHATRELAY_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "CHATRELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum number of concurrent participants
    #[arg(long, env = "CHATRELAY_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Lines queued per participant before further lines to it are dropped
    #[arg(long, env = "CHATRELAY_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Seconds a single line write may take before the participant is dropped
    #[arg(long, env = "CHATRELAY_WRITE_TIMEOUT")]
    write_timeout: Option<u64>,

    /// Disconnect participants that send nothing for this many seconds
    #[arg(long, env = "CHATRELAY_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Maximum line length in bytes
    #[arg(long, env = "CHATRELAY_MAX_LINE_LENGTH")]
    max_line_length: Option<usize>,

    /// Echo each line back to its sender
    #[arg(long, env = "CHATRELAY_ECHO")]
    echo: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(SocketAddr::new(self.host, self.port))
            .with_max_connections(self.max_connections)
            .with_echo_to_sender(self.echo);

        if let Some(capacity) = self.queue_capacity {
            config = config.with_outbound_queue_capacity(capacity);
        }
        if let Some(secs) = self.write_timeout {
            config = config.with_write_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.idle_timeout {
            config = config.with_idle_timeout(Some(Duration::from_secs(secs)));
        }
        if let Some(length) = self.max_line_length {
            config = config.with_max_line_length(length);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let config = args.server_config();
    let server = ChatServer::bind(config.clone())
        .await
        .with_context(|| format!("Could not start server on {}", config.bind_address))?;

    info!("Server started on port {}", server.bind_address().port());

    server.run_until(shutdown_signal()).await?;

    let snapshot = server.metrics().snapshot();
    info!(
        total_connections = snapshot.total_connections,
        lines_received = snapshot.lines_received,
        lines_per_sec = snapshot.lines_received_per_sec(),
        errors = snapshot.total_errors(),
        uptime = ?snapshot.uptime,
        "Server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            // Without a signal handler the server runs until killed
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
