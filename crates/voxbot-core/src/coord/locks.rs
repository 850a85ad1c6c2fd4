use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LockLease {
    pub resource_key: String,
    pub owner_bot_id: String,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockAction {
    Acquire,
    Release,
    Expire,
}

impl LockAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockAction::Acquire => "ACQUIRE",
            LockAction::Release => "RELEASE",
            LockAction::Expire => "EXPIRE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockEvent {
    pub resource_key: String,
    pub owner_bot_id: String,
    pub action: LockAction,
    pub at_ms: u64,
    pub details: serde_json::Value,
}

/// Leased named locks. At any instant each key has at most one active
/// lease; a lease is active iff `now < expires_at_ms`. Expiry is lazy:
/// every operation first sweeps stale leases.
#[derive(Debug)]
pub struct LockManager {
    lease_ms: u64,
    leases: BTreeMap<String, LockLease>,
    events: Option<mpsc::UnboundedSender<LockEvent>>,
}

impl LockManager {
    pub fn new(lease_ms: u64, events: Option<mpsc::UnboundedSender<LockEvent>>) -> Self {
        Self {
            lease_ms,
            leases: BTreeMap::new(),
            events,
        }
    }

    /// Succeeds if the key is unowned or already owned by this bot (the
    /// lease is extended in that case).
    pub fn acquire(&mut self, key: &str, owner: &str, now_ms: u64) -> bool {
        self.expire_stale(now_ms);
        match self.leases.get(key) {
            Some(lease) if lease.owner_bot_id != owner => false,
            existing => {
                let extension = existing.is_some();
                self.leases.insert(
                    key.to_string(),
                    LockLease {
                        resource_key: key.to_string(),
                        owner_bot_id: owner.to_string(),
                        expires_at_ms: now_ms + self.lease_ms,
                    },
                );
                self.emit(
                    key,
                    owner,
                    LockAction::Acquire,
                    now_ms,
                    serde_json::json!({ "extension": extension, "lease_ms": self.lease_ms }),
                );
                true
            }
        }
    }

    /// Extends the lease; a no-op returning false for non-owners.
    pub fn heartbeat(&mut self, key: &str, owner: &str, now_ms: u64) -> bool {
        self.expire_stale(now_ms);
        match self.leases.get_mut(key) {
            Some(lease) if lease.owner_bot_id == owner => {
                lease.expires_at_ms = now_ms + self.lease_ms;
                true
            }
            _ => false,
        }
    }

    /// Removes the lease; a no-op unless the caller is the owner.
    pub fn release(&mut self, key: &str, owner: &str, now_ms: u64) -> bool {
        self.expire_stale(now_ms);
        match self.leases.get(key) {
            Some(lease) if lease.owner_bot_id == owner => {
                self.leases.remove(key);
                self.emit(key, owner, LockAction::Release, now_ms, serde_json::Value::Null);
                true
            }
            _ => false,
        }
    }

    pub fn owner_of(&mut self, key: &str, now_ms: u64) -> Option<String> {
        self.expire_stale(now_ms);
        self.leases.get(key).map(|l| l.owner_bot_id.clone())
    }

    pub fn active_lease_count(&mut self, now_ms: u64) -> usize {
        self.expire_stale(now_ms);
        self.leases.len()
    }

    fn expire_stale(&mut self, now_ms: u64) {
        let stale: Vec<LockLease> = self
            .leases
            .values()
            .filter(|l| l.expires_at_ms <= now_ms)
            .cloned()
            .collect();
        for lease in stale {
            self.leases.remove(&lease.resource_key);
            tracing::debug!(
                key = %lease.resource_key,
                owner = %lease.owner_bot_id,
                "locks.expire"
            );
            self.emit(
                &lease.resource_key,
                &lease.owner_bot_id,
                LockAction::Expire,
                now_ms,
                serde_json::json!({ "expired_at": lease.expires_at_ms }),
            );
        }
    }

    fn emit(
        &self,
        key: &str,
        owner: &str,
        action: LockAction,
        at_ms: u64,
        details: serde_json::Value,
    ) {
        if let Some(tx) = &self.events {
            let _ = tx.send(LockEvent {
                resource_key: key.to_string(),
                owner_bot_id: owner.to_string(),
                action,
                at_ms,
                details,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(lease_ms: u64) -> (LockManager, mpsc::UnboundedReceiver<LockEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LockManager::new(lease_ms, Some(tx)), rx)
    }

    #[test]
    fn contention_resolves_after_release() {
        let (mut lm, _rx) = manager(30_000);
        assert!(lm.acquire("resource:oak_log", "A", 1_000));
        assert!(!lm.acquire("resource:oak_log", "B", 1_500));
        assert!(lm.release("resource:oak_log", "A", 2_000));
        assert!(lm.acquire("resource:oak_log", "B", 2_500));
    }

    #[test]
    fn acquire_is_idempotent_for_owner() {
        let (mut lm, _rx) = manager(30_000);
        assert!(lm.acquire("storage:base", "A", 1_000));
        assert!(lm.acquire("storage:base", "A", 5_000));
        assert_eq!(lm.owner_of("storage:base", 5_000).as_deref(), Some("A"));
    }

    #[test]
    fn non_owner_heartbeat_and_release_are_noops() {
        let (mut lm, _rx) = manager(30_000);
        assert!(lm.acquire("resource:stone", "A", 1_000));
        assert!(!lm.heartbeat("resource:stone", "B", 2_000));
        assert!(!lm.release("resource:stone", "B", 2_000));
        assert_eq!(lm.owner_of("resource:stone", 2_000).as_deref(), Some("A"));
    }

    #[test]
    fn lease_expires_lazily() {
        let (mut lm, mut rx) = manager(10_000);
        assert!(lm.acquire("resource:stone", "A", 1_000));
        // The lease expires at 11_000; B's acquire at 11_000 sweeps it first.
        assert!(lm.acquire("resource:stone", "B", 11_000));

        let actions: Vec<LockAction> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![LockAction::Acquire, LockAction::Expire, LockAction::Acquire]
        );
    }

    #[test]
    fn heartbeat_extends_expiry() {
        let (mut lm, _rx) = manager(10_000);
        assert!(lm.acquire("resource:stone", "A", 1_000));
        assert!(lm.heartbeat("resource:stone", "A", 9_000));
        // Without the heartbeat this would have expired at 11_000.
        assert_eq!(lm.owner_of("resource:stone", 15_000).as_deref(), Some("A"));
    }

    #[test]
    fn single_owner_invariant() {
        let (mut lm, _rx) = manager(30_000);
        assert!(lm.acquire("k", "A", 0));
        for now in [100, 200, 300] {
            assert!(!lm.acquire("k", "B", now));
            assert_eq!(lm.owner_of("k", now).as_deref(), Some("A"));
        }
        assert_eq!(lm.active_lease_count(300), 1);
    }
}
