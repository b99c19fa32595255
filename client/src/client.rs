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

//! Line client implementation

use crate::{ClientConfig, ClientError, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, trace};

/// Format a chat line the way participants prefix their messages
///
/// The relay treats the whole line as opaque payload.
pub fn format_chat_line(display_name: &str, text: &str) -> String {
    format!("{}: {}", display_name, text)
}

/// Client for a line relay
///
/// Sending goes straight to the socket. Receiving is done by a background task
/// that forwards each line into a channel, so lines keep arriving while the
/// caller is busy sending.
pub struct LineClient {
    writer: Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    incoming: mpsc::Receiver<Result<String>>,
    reader: JoinHandle<()>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl LineClient {
    /// Connect to the server named by `config`
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let address = config.address();
        let stream = timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ClientError::ConnectionTimeout)??;
        info!("Connected to {}", address);
        Self::from_stream(stream, config)
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream, config: &ClientConfig) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let (tx, incoming) = mpsc::channel(config.incoming_buffer.max(1));
        let lines = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(config.max_line_length),
        );
        let reader = tokio::spawn(read_loop(lines, tx));

        Ok(Self {
            writer: Mutex::new(FramedWrite::new(write_half, LinesCodec::new())),
            incoming,
            reader,
            local_addr,
            peer_addr,
        })
    }

    /// Get the local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the server address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send one line
    pub async fn send_line(&self, text: &str) -> Result<()> {
        if text.contains(['\n', '\r']) {
            return Err(ClientError::InvalidLine);
        }
        self.writer.lock().await.send(text).await?;
        trace!(line = %text, "Line sent");
        Ok(())
    }

    /// Send `text` prefixed with `display_name`
    pub async fn send_chat(&self, display_name: &str, text: &str) -> Result<()> {
        self.send_line(&format_chat_line(display_name, text)).await
    }

    /// Receive the next line from the server
    ///
    /// Returns `Ok(None)` once the server has closed the connection.
    pub async fn recv_line(&mut self) -> Result<Option<String>> {
        match self.incoming.recv().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Close the sending side; lines already in flight can still be received
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        SinkExt::<&str>::close(&mut *writer).await?;
        debug!("Client write half closed");
        Ok(())
    }
}

impl Drop for LineClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for LineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineClient")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

async fn read_loop(
    mut lines: FramedRead<OwnedReadHalf, LinesCodec>,
    tx: mpsc::Sender<Result<String>>,
) {
    while let Some(next) = lines.next().await {
        let failed = next.is_err();
        if tx.send(next.map_err(ClientError::from)).await.is_err() || failed {
            break;
        }
    }
    debug!("Reader task finished");
}
