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

//! Client error types

use std::fmt;
use std::io;
use tokio_util::codec::LinesCodecError;

/// Client error type
#[derive(Debug, Clone)]
pub enum ClientError {
    /// I/O error
    Io(String),

    /// Connection timeout
    ConnectionTimeout,

    /// Connection refused
    ConnectionRefused,

    /// Connection closed by server
    ConnectionClosed,

    /// A line longer than the configured maximum was received
    LineTooLong,

    /// The text to send contains a line terminator
    InvalidLine,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::ConnectionTimeout => write!(f, "Connection timeout"),
            Self::ConnectionRefused => write!(f, "Connection refused"),
            Self::ConnectionClosed => write!(f, "Connection closed by server"),
            Self::LineTooLong => write!(f, "Received line exceeds maximum length"),
            Self::InvalidLine => write!(f, "Line must not contain a line terminator"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::TimedOut => Self::ConnectionTimeout,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Self::ConnectionClosed,
            _ => Self::Io(error.to_string()),
        }
    }
}

impl From<LinesCodecError> for ClientError {
    fn from(error: LinesCodecError) -> Self {
        match error {
            LinesCodecError::MaxLineLengthExceeded => Self::LineTooLong,
            LinesCodecError::Io(e) => e.into(),
        }
    }
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
