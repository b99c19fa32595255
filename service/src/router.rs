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

//! Broadcast router
//!
//! Fans one line out to every member except its sender. Deliveries only queue
//! the line on each recipient's connection, so a slow recipient degrades its
//! own stream and nobody else's.

use crate::{ConnectionId, MembershipRegistry, SendError, ServerMetrics};
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of a broadcast operation
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Total number of recipients attempted
    pub total: usize,
    /// Number of successful sends
    pub succeeded: usize,
    /// Number of failed sends
    pub failed: usize,
    /// Errors that occurred per recipient
    pub errors: Vec<(ConnectionId, SendError)>,
}

impl BroadcastResult {
    /// Check if all deliveries succeeded
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Get the success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.succeeded as f64 / self.total as f64) * 100.0
        }
    }
}

/// Delivers lines to the members of a registry
#[derive(Clone)]
pub struct BroadcastRouter {
    registry: Arc<MembershipRegistry>,
    metrics: Arc<ServerMetrics>,
}

impl BroadcastRouter {
    /// Create a router over `registry`
    pub fn new(registry: Arc<MembershipRegistry>, metrics: Arc<ServerMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Get the registry this router delivers to
    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        &self.registry
    }

    /// Deliver `message` to every current member except `sender`
    ///
    /// A failed delivery is recorded in the result and the fan-out continues.
    /// Failures are never propagated to the sender; a broken recipient is
    /// cleaned up by its own supervisor.
    pub fn broadcast(&self, message: impl Into<Arc<str>>, sender: ConnectionId) -> BroadcastResult {
        let message = message.into();
        let mut result = BroadcastResult::default();

        let total = self.registry.for_each_except(sender, |recipient| {
            match recipient.send_line(message.clone()) {
                Ok(()) => result.succeeded += 1,
                Err(e) => {
                    debug!(
                        sender = %sender,
                        recipient = %recipient.id(),
                        error = %e,
                        "Delivery failed"
                    );
                    result.failed += 1;
                    result.errors.push((recipient.id(), e));
                }
            }
        });
        result.total = total;

        trace!(
            sender = %sender,
            total = result.total,
            failed = result.failed,
            "Broadcast complete"
        );
        self.metrics.broadcast(result.succeeded, result.failed);
        result
    }

    /// Deliver `message` to a single member
    pub fn send_to(
        &self,
        recipient: ConnectionId,
        message: impl Into<Arc<str>>,
    ) -> Result<(), SendError> {
        match self.registry.get(recipient) {
            Some(connection) => connection.send_line(message),
            None => Err(SendError::Closed),
        }
    }
}

impl std::fmt::Debug for BroadcastRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastRouter")
            .field("members", &self.registry.len())
            .finish()
    }
}
