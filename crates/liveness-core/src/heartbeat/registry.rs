//! Per-sender heartbeat bookkeeping.

use crate::identity::NodeIdentity;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Last contact with one sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub identity: NodeIdentity,
    /// Receiver clock at the last heartbeat (ms since epoch)
    pub last_heartbeat: u64,
    /// Consecutive sweeps that found the record past its timeout
    pub missed_count: u32,
}

/// What a heartbeat did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    FirstContact,
    Refreshed,
}

/// Map of sender identity to liveness record, keyed on the full
/// `(node_id, session_id)` pair.
///
/// One lock covers both the update path and the sweep, so a heartbeat that
/// races a sweep lands either before or after it, never in the middle.
#[derive(Debug)]
pub struct NodeRegistry {
    timeout_ms: u64,
    max_missed: u32,
    records: Mutex<HashMap<NodeIdentity, HeartbeatRecord>>,
}

impl NodeRegistry {
    pub fn new(timeout_ms: u64, max_missed: u32) -> Self {
        Self {
            timeout_ms,
            max_missed,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<NodeIdentity, HeartbeatRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a heartbeat from `identity` received at `now_ms`.
    pub fn handle_heartbeat(&self, identity: NodeIdentity, now_ms: u64) -> HeartbeatOutcome {
        let mut records = self.records();
        match records.get_mut(&identity) {
            Some(record) => {
                record.last_heartbeat = now_ms;
                record.missed_count = 0;
                tracing::trace!("Heartbeat from {}", identity);
                HeartbeatOutcome::Refreshed
            }
            None => {
                tracing::info!(
                    node_id = %identity.node_id,
                    session_id = %identity.session_id,
                    "Node connected for the first time"
                );
                records.insert(
                    identity.clone(),
                    HeartbeatRecord {
                        identity,
                        last_heartbeat: now_ms,
                        missed_count: 0,
                    },
                );
                HeartbeatOutcome::FirstContact
            }
        }
    }

    /// Count a miss for every record silent for longer than the timeout and
    /// remove those past `max_missed`. Returns the evicted records.
    pub fn check_missed_heartbeats(&self, now_ms: u64) -> Vec<HeartbeatRecord> {
        let mut records = self.records();
        let mut evict = Vec::new();

        for (key, record) in records.iter_mut() {
            if now_ms.saturating_sub(record.last_heartbeat) > self.timeout_ms {
                record.missed_count += 1;
                if record.missed_count > self.max_missed {
                    evict.push(key.clone());
                } else {
                    tracing::debug!(
                        "Node {} missed a heartbeat ({}/{})",
                        key,
                        record.missed_count,
                        self.max_missed
                    );
                }
            }
        }

        let evicted: Vec<HeartbeatRecord> = evict
            .iter()
            .filter_map(|key| records.remove(key))
            .collect();
        for record in &evicted {
            tracing::warn!(
                node_id = %record.identity.node_id,
                session_id = %record.identity.session_id,
                missed = record.missed_count,
                "Node evicted after missing too many heartbeats"
            );
        }
        evicted
    }

    /// Copy of every record, ordered by node id then session id.
    pub fn snapshot(&self) -> Vec<HeartbeatRecord> {
        let mut snapshot: Vec<HeartbeatRecord> = self.records().values().cloned().collect();
        snapshot.sort_by(|a, b| {
            (&a.identity.node_id, &a.identity.session_id)
                .cmp(&(&b.identity.node_id, &b.identity.session_id))
        });
        snapshot
    }

    pub fn get(&self, identity: &NodeIdentity) -> Option<HeartbeatRecord> {
        self.records().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(node: &str, session: &str) -> NodeIdentity {
        NodeIdentity::new(node, session).unwrap()
    }

    // ==================== Updates ====================

    #[test]
    fn test_first_contact_then_refresh() {
        let registry = NodeRegistry::new(1000, 2);
        assert_eq!(
            registry.handle_heartbeat(id("a", "1"), 100),
            HeartbeatOutcome::FirstContact
        );
        assert_eq!(
            registry.handle_heartbeat(id("a", "1"), 200),
            HeartbeatOutcome::Refreshed
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id("a", "1")).unwrap().last_heartbeat, 200);
    }

    #[test]
    fn test_sessions_are_distinct_records() {
        let registry = NodeRegistry::new(1000, 2);
        registry.handle_heartbeat(id("a", "1"), 100);
        registry.handle_heartbeat(id("a", "2"), 100);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_underscores_do_not_collide() {
        let registry = NodeRegistry::new(1000, 2);
        assert_eq!(
            registry.handle_heartbeat(id("a_b", "c"), 100),
            HeartbeatOutcome::FirstContact
        );
        assert_eq!(
            registry.handle_heartbeat(id("a", "b_c"), 100),
            HeartbeatOutcome::FirstContact
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&id("a", "b_c")).unwrap().identity.node_id, "a");
    }

    #[test]
    fn test_heartbeat_resets_missed_count() {
        let registry = NodeRegistry::new(1000, 5);
        registry.handle_heartbeat(id("a", "1"), 0);
        registry.check_missed_heartbeats(1500);
        registry.check_missed_heartbeats(2500);
        assert_eq!(registry.get(&id("a", "1")).unwrap().missed_count, 2);

        registry.handle_heartbeat(id("a", "1"), 2600);
        assert_eq!(registry.get(&id("a", "1")).unwrap().missed_count, 0);
    }

    // ==================== Sweeps ====================

    #[test]
    fn test_no_miss_at_exact_timeout() {
        let registry = NodeRegistry::new(1000, 1);
        registry.handle_heartbeat(id("a", "1"), 0);
        assert!(registry.check_missed_heartbeats(1000).is_empty());
        assert_eq!(registry.get(&id("a", "1")).unwrap().missed_count, 0);
    }

    #[test]
    fn test_each_sweep_counts_one_miss() {
        let registry = NodeRegistry::new(1000, 10);
        registry.handle_heartbeat(id("a", "1"), 0);
        for expected in 1..=5 {
            registry.check_missed_heartbeats(5000);
            assert_eq!(registry.get(&id("a", "1")).unwrap().missed_count, expected);
        }
    }

    #[test]
    fn test_eviction_boundary() {
        // max_missed = 1, timeout = 1s; silent for 2.5 intervals.
        let registry = NodeRegistry::new(1000, 1);
        registry.handle_heartbeat(id("a", "1"), 0);

        assert!(registry.check_missed_heartbeats(1500).is_empty());
        assert_eq!(registry.get(&id("a", "1")).unwrap().missed_count, 1);

        let evicted = registry.check_missed_heartbeats(2500);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].identity, id("a", "1"));
        assert_eq!(evicted[0].missed_count, 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_eviction_is_per_record() {
        let registry = NodeRegistry::new(1000, 1);
        registry.handle_heartbeat(id("quiet", "1"), 0);
        registry.handle_heartbeat(id("chatty", "1"), 0);

        for now in [1500, 2500] {
            registry.handle_heartbeat(id("chatty", "1"), now - 100);
            registry.check_missed_heartbeats(now);
        }

        let remaining = registry.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].identity.node_id, "chatty");
        assert_eq!(remaining[0].missed_count, 0);
    }

    #[test]
    fn test_clock_going_backwards_is_not_a_miss() {
        let registry = NodeRegistry::new(1000, 1);
        registry.handle_heartbeat(id("a", "1"), 10_000);
        assert!(registry.check_missed_heartbeats(5_000).is_empty());
        assert_eq!(registry.get(&id("a", "1")).unwrap().missed_count, 0);
    }
}
