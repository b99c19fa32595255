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

//! Error types for the chat relay server

use std::net::SocketAddr;
use thiserror::Error;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Chat relay server error types
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening endpoint could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        /// Address that was requested
        address: SocketAddr,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A single accept attempt failed
    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// I/O error from the underlying TCP stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Server is already accepting connections
    #[error("Server already running")]
    AlreadyRunning,

    /// Server is not running
    #[error("Server not running")]
    NotRunning,
}

impl ServerError {
    /// Check if the error prevents the server from running at all
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServerError::Bind { .. } | ServerError::InvalidConfig(_))
    }

    /// Check if the error is recoverable
    ///
    /// Recoverable errors are transient; the accept loop logs them and keeps going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ServerError::Accept(_) | ServerError::Io(_))
    }
}
