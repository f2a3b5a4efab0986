//! Registry of in-flight proxied connections.
//!
//! Every orchestration that obtains a backend stream registers exactly one
//! [`ConnectionRecord`] and removes it again on the way out. Ids come from a
//! counter that only grows, so an id is never handed out twice for the
//! lifetime of the tracker.
//!
//! The counter and the map live behind one `std::sync::Mutex`. Critical
//! sections never await or do I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;

/// Identifier of a tracked connection.
pub type ConnId = u64;

/// Metadata for one active client-to-backend relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    /// Gateway side of the client socket.
    pub local_local_addr: String,
    /// Client side of the client socket.
    pub local_remote_addr: String,
    /// Gateway side of the backend socket.
    pub remote_local_addr: String,
    /// Backend side of the backend socket.
    pub remote_remote_addr: String,
    /// Destination the client asked for.
    pub target: String,
    /// Backend selection plus connect time.
    pub latency_ms: u64,
    /// Name of the backend carrying the connection.
    pub backend: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
struct TrackerState {
    next_id: ConnId,
    records: HashMap<ConnId, Arc<ConnectionRecord>>,
}

/// Process-wide table of active connections.
#[derive(Default)]
pub struct ConnectionTracker {
    state: Mutex<TrackerState>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // The state is always left consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a record and return its freshly assigned id.
    pub fn register(&self, record: ConnectionRecord) -> ConnId {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.records.insert(id, Arc::new(record));
        trace!(conn_id = id, live = state.records.len(), "Connection registered");
        id
    }

    /// Remove a record. Unknown or already-removed ids are ignored.
    pub fn unregister(&self, id: ConnId) {
        let mut state = self.lock();
        if state.records.remove(&id).is_some() {
            trace!(conn_id = id, live = state.records.len(), "Connection unregistered");
        }
    }

    /// Number of connections currently tracked.
    pub fn live_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Number of ids ever handed out.
    pub fn total_created(&self) -> u64 {
        self.lock().next_id
    }

    /// Copy out all live records, ordered by id.
    pub fn snapshot(&self) -> Vec<(ConnId, Arc<ConnectionRecord>)> {
        let mut records: Vec<_> = {
            let state = self.lock();
            state
                .records
                .iter()
                .map(|(id, record)| (*id, Arc::clone(record)))
                .collect()
        };
        records.sort_unstable_by_key(|(id, _)| *id);
        records
    }

    /// Register a record and tie its removal to the returned guard.
    pub fn track(self: &Arc<Self>, record: ConnectionRecord) -> TrackedConnection {
        let id = self.register(record);
        TrackedConnection {
            tracker: Arc::clone(self),
            id,
        }
    }
}

/// Scoped registration: the record is removed when this is dropped.
pub struct TrackedConnection {
    tracker: Arc<ConnectionTracker>,
    id: ConnId,
}

impl TrackedConnection {
    pub fn id(&self) -> ConnId {
        self.id
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.tracker.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn record(target: &str) -> ConnectionRecord {
        ConnectionRecord {
            local_local_addr: "127.0.0.1:1080".to_string(),
            local_remote_addr: "127.0.0.1:50000".to_string(),
            remote_local_addr: "10.0.0.1:40000".to_string(),
            remote_remote_addr: "10.0.0.2:1080".to_string(),
            target: target.to_string(),
            latency_ms: 5,
            backend: "b1".to_string(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_ids_are_sequential_and_never_reused() {
        let tracker = ConnectionTracker::new();
        let a = tracker.register(record("a:1"));
        let b = tracker.register(record("b:1"));
        assert_eq!((a, b), (0, 1));

        tracker.unregister(a);
        let c = tracker.register(record("c:1"));
        assert_eq!(c, 2);
        assert_eq!(tracker.total_created(), 3);
        assert_eq!(tracker.live_count(), 2);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let tracker = ConnectionTracker::new();
        let a = tracker.register(record("a:1"));
        let b = tracker.register(record("b:1"));

        tracker.unregister(a);
        tracker.unregister(a);
        tracker.unregister(999);

        assert_eq!(tracker.live_count(), 1);
        let live = tracker.snapshot();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, b);
        assert_eq!(live[0].1.target, "b:1");
        assert_eq!(tracker.total_created(), 2);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let tracker = ConnectionTracker::new();
        for i in 0..5 {
            tracker.register(record(&format!("host{}:80", i)));
        }
        tracker.unregister(2);

        let ids: Vec<_> = tracker.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_guard_unregisters_on_drop() {
        let tracker = Arc::new(ConnectionTracker::new());
        {
            let guard = tracker.track(record("example.com:80"));
            assert_eq!(guard.id(), 0);
            assert_eq!(tracker.live_count(), 1);
        }
        assert_eq!(tracker.live_count(), 0);
        assert_eq!(tracker.total_created(), 1);
    }

    #[test]
    fn test_concurrent_register_unregister() {
        let tracker = Arc::new(ConnectionTracker::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..500 {
                        let id = tracker.register(record(&format!("t{}-{}:80", t, i)));
                        if i % 2 == 0 {
                            tracker.unregister(id);
                        } else {
                            kept.push(id);
                        }
                    }
                    kept
                })
            })
            .collect();

        let kept: Vec<ConnId> = threads
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let unique: HashSet<_> = kept.iter().copied().collect();
        assert_eq!(unique.len(), kept.len());
        assert_eq!(tracker.live_count(), 8 * 250);
        assert_eq!(tracker.total_created(), 8 * 500);

        for id in kept {
            tracker.unregister(id);
        }
        assert_eq!(tracker.live_count(), 0);
    }
}
