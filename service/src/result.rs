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

//! Error types and result aliases for per-connection line operations

/// Result type for receive operations
///
/// `Ok(None)` is end of stream: the peer closed its side cleanly.
pub type ReceiveResult<T> = Result<T, ReceiveError>;

/// Errors returned when queueing a line for a peer
///
/// A send error is local to one recipient. It never aborts a broadcast and never
/// removes the recipient from membership by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection has been closed
    #[error("Connection closed")]
    Closed,

    /// The peer's outbound queue is full; the line was dropped for this peer
    #[error("Outbound queue full")]
    QueueFull,
}

/// Errors that end a supervisor's read loop
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    /// An I/O error occurred, including invalid UTF-8 on the wire
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a line longer than the configured maximum
    #[error("Line exceeds maximum length of {0} bytes")]
    LineTooLong(usize),

    /// The connection was closed locally while waiting for a line
    #[error("Connection closed")]
    Closed,
}
