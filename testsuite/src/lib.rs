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

//! Harness for end-to-end relay tests
//!
//! Starts a relay on an ephemeral loopback port and connects line clients to it.

use chatrelay_client::{ClientConfig, LineClient};
use chatrelay_service::{ChatServer, ServerConfig};
use std::time::Duration;

/// How long a test waits for a line that should arrive
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a test waits before concluding a line will not arrive
pub const SILENCE_TIMEOUT: Duration = Duration::from_millis(200);

/// A running relay plus helpers to join it
pub struct TestRoom {
    server: ChatServer,
}

impl TestRoom {
    /// Start a relay with default settings on `127.0.0.1:0`
    pub async fn start() -> Self {
        Self::start_with(|config| config).await
    }

    /// Start a relay after adjusting the loopback configuration
    pub async fn start_with<F>(configure: F) -> Self
    where
        F: FnOnce(ServerConfig) -> ServerConfig,
    {
        let config = configure(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        let server = ChatServer::bind(config).await.expect("bind relay");
        server.start().await.expect("start relay");
        Self { server }
    }

    /// Get the running server
    pub fn server(&self) -> &ChatServer {
        &self.server
    }

    /// Connect a new participant and wait until the relay has registered it
    pub async fn join(&self) -> LineClient {
        let expected = self.server.connection_count() + 1;
        let client = self.connect().await;
        self.wait_for_members(expected).await;
        client
    }

    /// Connect a new participant without waiting for registration
    pub async fn connect(&self) -> LineClient {
        let port = self.server.bind_address().port();
        LineClient::connect(&ClientConfig::new("127.0.0.1", port))
            .await
            .expect("connect to relay")
    }

    /// Wait until the relay has exactly `count` members
    pub async fn wait_for_members(&self, count: usize) {
        for _ in 0..300 {
            if self.server.connection_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} members, found {}",
            count,
            self.server.connection_count()
        );
    }

    /// Stop the relay
    pub async fn shutdown(self) {
        self.server.shutdown().await.expect("shutdown relay");
    }
}

/// Receive the next line, failing the test if none arrives in time
pub async fn expect_line(client: &mut LineClient) -> String {
    match tokio::time::timeout(RECV_TIMEOUT, client.recv_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => panic!("connection closed while waiting for a line"),
        Ok(Err(e)) => panic!("receive failed: {}", e),
        Err(_) => panic!("no line within {:?}", RECV_TIMEOUT),
    }
}

/// Check that no line arrives within the silence window
pub async fn expect_silence(client: &mut LineClient) -> bool {
    tokio::time::timeout(SILENCE_TIMEOUT, client.recv_line())
        .await
        .is_err()
}

/// Wait for the server to close the connection
pub async fn expect_closed(client: &mut LineClient) {
    match tokio::time::timeout(RECV_TIMEOUT, client.recv_line()).await {
        Ok(Ok(None)) | Ok(Err(_)) => {}
        Ok(Ok(Some(line))) => panic!("expected close, got line {:?}", line),
        Err(_) => panic!("connection still open after {:?}", RECV_TIMEOUT),
    }
}
