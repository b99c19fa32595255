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

//! Membership registry
//!
//! The registry is the one structure mutated by every supervisor. It is a
//! sharded concurrent map keyed by connection id, and iteration always runs
//! over a cloned snapshot so no shard lock is held while a callback delivers.

use crate::{ConnectionId, ConnectionInfo, LineConnection};
use dashmap::DashMap;
use tracing::trace;

/// Concurrency-safe set of live connections
#[derive(Default)]
pub struct MembershipRegistry {
    members: DashMap<ConnectionId, LineConnection>,
}

impl MembershipRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection
    ///
    /// Returns `false` if a member with the same id was already present, in
    /// which case it is replaced and the registry still holds one entry.
    pub fn add(&self, connection: LineConnection) -> bool {
        let id = connection.id();
        let added = self.members.insert(id, connection).is_none();
        trace!(connection_id = %id, added, "Member added");
        added
    }

    /// Remove a connection by id
    ///
    /// Removing an id that is not a member is a no-op and returns `None`.
    pub fn remove(&self, id: ConnectionId) -> Option<LineConnection> {
        let removed = self.members.remove(&id).map(|(_, connection)| connection);
        trace!(connection_id = %id, removed = removed.is_some(), "Member removed");
        removed
    }

    /// Check whether `id` is a member
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.contains_key(&id)
    }

    /// Get a member by id
    pub fn get(&self, id: ConnectionId) -> Option<LineConnection> {
        self.members.get(&id).map(|entry| entry.value().clone())
    }

    /// Get the number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Get all member ids in ascending order
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.members.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Point-in-time copy of all members
    pub fn snapshot(&self) -> Vec<LineConnection> {
        self.members
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Point-in-time copy of all members other than `excluded`
    pub fn snapshot_except(&self, excluded: ConnectionId) -> Vec<LineConnection> {
        self.members
            .iter()
            .filter(|entry| *entry.key() != excluded)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Invoke `f` once for every member other than `excluded`
    ///
    /// Members added or removed while `f` runs do not affect this iteration,
    /// and `f` may itself add or remove members. Returns the number of members
    /// visited.
    pub fn for_each_except<F>(&self, excluded: ConnectionId, mut f: F) -> usize
    where
        F: FnMut(&LineConnection),
    {
        let snapshot = self.snapshot_except(excluded);
        for connection in &snapshot {
            f(connection);
        }
        snapshot.len()
    }

    /// Get info for every member, ordered by id
    pub fn infos(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self
            .members
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_unstable_by_key(|info| info.id);
        infos
    }

    /// Close every member's connection
    ///
    /// Members stay registered until their supervisors observe the close and
    /// deregister. Returns the number of connections this call closed.
    pub fn close_all(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|connection| connection.close())
            .count()
    }
}

impl std::fmt::Debug for MembershipRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipRegistry")
            .field("members", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectionConfig;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tokio::io::{DuplexStream, duplex};

    fn connection(id: u64) -> (LineConnection, DuplexStream) {
        let (local, remote) = duplex(1024);
        let (conn, _rx) = LineConnection::from_stream(
            local,
            ConnectionId::new(id),
            None,
            &ConnectionConfig::default(),
        );
        (conn, remote)
    }

    #[tokio::test]
    async fn test_add_remove() {
        let registry = MembershipRegistry::new();
        let (a, _ra) = connection(1);
        let (b, _rb) = connection(2);

        assert!(registry.add(a.clone()));
        assert!(registry.add(b));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(a.id()));

        assert!(registry.remove(a.id()).is_some());
        assert!(!registry.contains(a.id()));
        assert_eq!(registry.ids(), vec![ConnectionId::new(2)]);
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let registry = MembershipRegistry::new();
        let (a, _ra) = connection(1);
        registry.add(a);

        assert!(registry.remove(ConnectionId::new(99)).is_none());
        assert!(registry.remove(ConnectionId::new(1)).is_some());
        assert!(registry.remove(ConnectionId::new(1)).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_re_adding_does_not_duplicate() {
        let registry = MembershipRegistry::new();
        let (a, _ra) = connection(7);

        assert!(registry.add(a.clone()));
        assert!(!registry.add(a));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_for_each_except_skips_excluded() {
        let registry = MembershipRegistry::new();
        let mut remotes = Vec::new();
        for id in 1..=4 {
            let (conn, remote) = connection(id);
            registry.add(conn);
            remotes.push(remote);
        }

        let mut visited = BTreeSet::new();
        let count = registry.for_each_except(ConnectionId::new(2), |c| {
            visited.insert(c.id().as_u64());
        });

        assert_eq!(count, 3);
        assert_eq!(visited, BTreeSet::from([1, 3, 4]));
    }

    #[tokio::test]
    async fn test_callback_may_mutate_registry() {
        let registry = MembershipRegistry::new();
        let (a, _ra) = connection(1);
        let (b, _rb) = connection(2);
        let (c, _rc) = connection(3);
        registry.add(a);
        registry.add(b);

        // Removing and adding inside the callback must not deadlock or
        // change what this iteration visits.
        let mut visited = Vec::new();
        let count = registry.for_each_except(ConnectionId::new(0), |member| {
            visited.push(member.id());
            registry.remove(ConnectionId::new(2));
            registry.add(c.clone());
        });

        assert_eq!(count, 2);
        assert_eq!(visited.len(), 2);
        assert_eq!(registry.ids(), vec![ConnectionId::new(1), ConnectionId::new(3)]);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = MembershipRegistry::new();
        let (a, _ra) = connection(1);
        let (b, _rb) = connection(2);
        registry.add(a.clone());
        registry.add(b.clone());

        a.close();
        assert_eq!(registry.close_all(), 1);
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(registry.close_all(), 0);
    }

    #[tokio::test]
    async fn test_infos_reflect_members() {
        let registry = MembershipRegistry::new();
        let (a, _ra) = connection(5);
        let (b, _rb) = connection(2);
        registry.add(a.clone());
        registry.add(b);
        a.close();

        let infos = registry.infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, ConnectionId::new(2));
        assert!(!infos[0].closed);
        assert_eq!(infos[1].id, ConnectionId::new(5));
        assert!(infos[1].closed);
        assert_eq!(infos[1].peer_addr, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_remove_during_iteration() {
        let registry = Arc::new(MembershipRegistry::new());
        let mut tasks = Vec::new();

        for worker in 0..8u64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut remotes = Vec::new();
                for n in 0..50u64 {
                    let id = worker * 1000 + n;
                    let (conn, remote) = connection(id);
                    remotes.push(remote);
                    registry.add(conn);
                    registry.for_each_except(ConnectionId::new(id), |_| {});
                    if n % 2 == 0 {
                        registry.remove(ConnectionId::new(id));
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len(), 8 * 25);
        let ids = registry.ids();
        let unique: BTreeSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.iter().all(|id| id.as_u64() % 2 == 1));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u64),
        Remove(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0..16u64).prop_map(Op::Add), (0..16u64).prop_map(Op::Remove)]
    }

    proptest! {
        #[test]
        fn prop_registry_matches_set_model(ops in proptest::collection::vec(op(), 0..64)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let registry = MembershipRegistry::new();
                let mut model = BTreeSet::new();
                let mut remotes = Vec::new();

                for op in ops {
                    match op {
                        Op::Add(id) => {
                            let (conn, remote) = connection(id);
                            remotes.push(remote);
                            prop_assert_eq!(registry.add(conn), model.insert(id));
                        }
                        Op::Remove(id) => {
                            prop_assert_eq!(
                                registry.remove(ConnectionId::new(id)).is_some(),
                                model.remove(&id)
                            );
                        }
                    }
                    let ids: Vec<u64> = registry.ids().iter().map(|id| id.as_u64()).collect();
                    prop_assert_eq!(ids, model.iter().copied().collect::<Vec<_>>());
                }
                Ok(())
            })?;
        }
    }
}
