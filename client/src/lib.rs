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

//! # Chat Relay Client
//!
//! Minimal line client for the chat relay: one TCP connection, one line per
//! message, and a background reader so incoming lines are never blocked by
//! outgoing ones.
//!
//! ## Quick Start
//!
//! ```no_run
//! use chatrelay_client::{ClientConfig, LineClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = LineClient::connect(&ClientConfig::new("localhost", 5000)).await?;
//!     client.send_chat("Alice", "hello everyone").await?;
//!
//!     while let Some(line) = client.recv_line().await? {
//!         println!("{}", line);
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;

pub use client::{LineClient, format_chat_line};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
