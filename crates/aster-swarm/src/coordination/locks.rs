//! Leased Lock Table
//!
//! Tracks EXCLUSIVE and SHARED holders per resource. A lease past its
//! expiry is logically free whether or not anyone released it: every check
//! prunes expired holders before deciding.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use super::error::{CoordinationError, CoordinationResult};

/// Lock mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    /// Sole holder
    Exclusive,
    /// Coexists with other shared holders
    Shared,
}

/// A granted lease on a resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lock {
    pub id: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub lock_type: LockType,
    pub holder: String,
    /// Capability proof required to renew or release
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    fn new(resource: &str, lock_type: LockType, holder: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            resource: resource.to_string(),
            lock_type,
            holder: holder.to_string(),
            token: Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: now + lease(ttl),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left on the lease
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

fn lease(ttl: Duration) -> chrono::Duration {
    // Clamp so adding the lease to "now" can never overflow
    chrono::Duration::from_std(ttl)
        .unwrap_or_else(|_| chrono::Duration::days(MAX_LEASE_DAYS))
        .min(chrono::Duration::days(MAX_LEASE_DAYS))
}

const MAX_LEASE_DAYS: i64 = 365 * 100;

/// Why an acquisition could not be granted right now
#[derive(Debug, Clone)]
pub struct Contention {
    pub holders: Vec<String>,
    /// Earliest expiry among conflicting holders
    pub frees_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ResourceLocks {
    holders: HashMap<String, Lock>,
    released: Arc<Notify>,
}

impl ResourceLocks {
    fn prune_expired(&mut self, now: DateTime<Utc>) -> Vec<Lock> {
        let expired: Vec<String> = self
            .holders
            .iter()
            .filter(|(_, lock)| lock.is_expired_at(now))
            .map(|(token, _)| token.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|token| self.holders.remove(&token))
            .collect()
    }

    fn conflicting(&self, lock_type: LockType) -> Vec<&Lock> {
        self.holders
            .values()
            .filter(|held| lock_type == LockType::Exclusive || held.lock_type == LockType::Exclusive)
            .collect()
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && Arc::strong_count(&self.released) == 1
    }
}

#[derive(Default)]
struct TableInner {
    resources: HashMap<String, ResourceLocks>,
    tokens: HashMap<String, String>,
}

impl TableInner {
    fn forget(&mut self, locks: &[Lock]) {
        for lock in locks {
            self.tokens.remove(&lock.token);
        }
    }

    fn drop_if_idle(&mut self, resource: &str) {
        if self.resources.get(resource).is_some_and(ResourceLocks::is_idle) {
            self.resources.remove(resource);
        }
    }
}

/// Lock counters
#[derive(Debug, Default)]
pub struct LockCounters {
    pub acquired: AtomicU64,
    pub conflicts: AtomicU64,
    pub reclaimed: AtomicU64,
}

/// Internally synchronized lock table
#[derive(Default)]
pub struct LockTable {
    inner: Mutex<TableInner>,
    counters: LockCounters,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release notifier for `resource`
    ///
    /// Waiters create their `notified()` future from this before calling
    /// [`try_acquire`](Self::try_acquire) so no release is missed.
    pub fn notifier(&self, resource: &str) -> Arc<Notify> {
        self.inner
            .lock()
            .resources
            .entry(resource.to_string())
            .or_default()
            .released
            .clone()
    }

    /// Grant a lease if no conflicting holder is live
    pub fn try_acquire(
        &self,
        resource: &str,
        lock_type: LockType,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lock, Contention> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let entry = inner.resources.entry(resource.to_string()).or_default();

        let expired = entry.prune_expired(now);
        let conflicting = entry.conflicting(lock_type);
        if !conflicting.is_empty() {
            let contention = Contention {
                holders: conflicting.iter().map(|l| l.holder.clone()).collect(),
                frees_at: conflicting.iter().map(|l| l.expires_at).min(),
            };
            inner.forget(&expired);
            self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(contention);
        }

        let lock = Lock::new(resource, lock_type, holder, ttl);
        entry.holders.insert(lock.token.clone(), lock.clone());
        inner.forget(&expired);
        inner
            .tokens
            .insert(lock.token.clone(), resource.to_string());
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        if !expired.is_empty() {
            self.counters
                .reclaimed
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }
        Ok(lock)
    }

    /// Extend a live lease
    pub fn renew(&self, token: &str, ttl: Duration) -> CoordinationResult<Lock> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let resource = inner
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CoordinationError::InvalidToken(token.to_string()))?;

        let lock = inner
            .resources
            .get_mut(&resource)
            .and_then(|entry| entry.holders.get_mut(token))
            .ok_or_else(|| CoordinationError::InvalidToken(token.to_string()))?;

        if lock.is_expired_at(now) {
            return Err(CoordinationError::LockExpired(resource));
        }
        lock.expires_at = now + lease(ttl);
        Ok(lock.clone())
    }

    /// Release a lease; unknown and expired tokens are a no-op
    pub fn release(&self, token: &str) -> Option<Lock> {
        let mut inner = self.inner.lock();
        let resource = inner.tokens.remove(token)?;
        let entry = inner.resources.get_mut(&resource)?;
        let lock = entry.holders.remove(token);
        entry.released.notify_waiters();
        inner.drop_if_idle(&resource);
        lock.filter(|l| !l.is_expired())
    }

    /// Remove every expired lease and wake the affected waiters
    pub fn sweep(&self) -> Vec<Lock> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let mut reclaimed = Vec::new();
        let mut idle = Vec::new();
        for (resource, entry) in inner.resources.iter_mut() {
            let expired = entry.prune_expired(now);
            if !expired.is_empty() {
                entry.released.notify_waiters();
                reclaimed.extend(expired);
            }
            if entry.is_idle() {
                idle.push(resource.clone());
            }
        }
        for resource in idle {
            inner.resources.remove(&resource);
        }
        inner.forget(&reclaimed);
        self.counters
            .reclaimed
            .fetch_add(reclaimed.len() as u64, Ordering::Relaxed);
        reclaimed
    }

    /// Live leases on `resource`
    pub fn locks_for(&self, resource: &str) -> Vec<Lock> {
        let now = Utc::now();
        self.inner
            .lock()
            .resources
            .get(resource)
            .map(|entry| {
                entry
                    .holders
                    .values()
                    .filter(|l| !l.is_expired_at(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live leases held by `holder`
    pub fn held_by(&self, holder: &str) -> Vec<Lock> {
        let now = Utc::now();
        self.inner
            .lock()
            .resources
            .values()
            .flat_map(|entry| entry.holders.values())
            .filter(|l| l.holder == holder && !l.is_expired_at(now))
            .cloned()
            .collect()
    }

    /// Number of live leases
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.inner
            .lock()
            .resources
            .values()
            .flat_map(|entry| entry.holders.values())
            .filter(|l| !l.is_expired_at(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> &LockCounters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_exclusive_excludes_everyone() {
        let table = LockTable::new();
        let lock = table.try_acquire("r", LockType::Exclusive, "a", TTL).unwrap();
        assert_eq!(lock.holder, "a");

        let contention = table.try_acquire("r", LockType::Exclusive, "b", TTL).unwrap_err();
        assert_eq!(contention.holders, vec!["a".to_string()]);
        assert!(table.try_acquire("r", LockType::Shared, "b", TTL).is_err());
    }

    #[test]
    fn test_shared_holders_coexist() {
        let table = LockTable::new();
        table.try_acquire("r", LockType::Shared, "a", TTL).unwrap();
        table.try_acquire("r", LockType::Shared, "b", TTL).unwrap();
        assert_eq!(table.locks_for("r").len(), 2);

        let contention = table.try_acquire("r", LockType::Exclusive, "c", TTL).unwrap_err();
        assert_eq!(contention.holders.len(), 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let table = LockTable::new();
        let lock = table.try_acquire("r", LockType::Exclusive, "a", TTL).unwrap();

        assert!(table.release(&lock.token).is_some());
        assert!(table.release(&lock.token).is_none());
        assert!(table.release("never-issued").is_none());
        assert!(table.try_acquire("r", LockType::Exclusive, "b", TTL).is_ok());
    }

    #[test]
    fn test_expired_lease_is_free() {
        let table = LockTable::new();
        let lock = table
            .try_acquire("r", LockType::Exclusive, "a", Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(lock.is_expired());
        assert!(table.try_acquire("r", LockType::Exclusive, "b", TTL).is_ok());
        assert!(table.release(&lock.token).is_none());
        assert_eq!(table.counters().reclaimed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_renew_extends_live_lease() {
        let table = LockTable::new();
        let lock = table
            .try_acquire("r", LockType::Exclusive, "a", Duration::from_secs(1))
            .unwrap();
        let renewed = table.renew(&lock.token, Duration::from_secs(60)).unwrap();
        assert!(renewed.expires_at > lock.expires_at);
    }

    #[test]
    fn test_renew_rejects_expired_and_unknown() {
        let table = LockTable::new();
        let lock = table
            .try_acquire("r", LockType::Exclusive, "a", Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(matches!(
            table.renew(&lock.token, TTL),
            Err(CoordinationError::LockExpired(_))
        ));
        assert!(matches!(
            table.renew("bogus", TTL),
            Err(CoordinationError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_sweep_reclaims_expired() {
        let table = LockTable::new();
        table
            .try_acquire("r1", LockType::Shared, "a", Duration::from_millis(1))
            .unwrap();
        table.try_acquire("r2", LockType::Shared, "a", TTL).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let reclaimed = table.sweep();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].resource, "r1");
        assert_eq!(table.len(), 1);
        assert_eq!(table.held_by("a").len(), 1);
    }
}
