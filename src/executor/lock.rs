use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Cooperative, TTL-bounded mutual exclusion across executor instances. The
/// lock is advisory: it coordinates workers, it is not enforced by the store.
/// At most one live holder exists cluster-wide per lock name; a crashed
/// holder blocks others for at most one TTL period.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Attempts a fresh acquisition. Returns false when another holder owns
    /// an unexpired lock.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;
    /// Extends a lock this holder already owns. Returns false when the lock
    /// expired or was taken over in the meantime.
    async fn refresh(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;
    /// Releases the lock if this holder owns it.
    async fn release(&self, name: &str, holder: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct LockEntry {
    holder: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct InMemoryLockService {
    locks: DashMap<String, LockEntry>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current unexpired holder, if any.
    pub fn holder(&self, name: &str) -> Option<String> {
        self.locks.get(name).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.holder.clone())
            } else {
                None
            }
        })
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut acquired = false;
        let entry = self
            .locks
            .entry(name.to_string())
            .and_modify(|entry| {
                if entry.expires_at <= now || entry.holder == holder {
                    entry.holder = holder.to_string();
                    entry.expires_at = now + ttl;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LockEntry {
                    holder: holder.to_string(),
                    expires_at: now + ttl,
                }
            });
        drop(entry);
        Ok(acquired)
    }

    async fn refresh(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.locks.get_mut(name) {
            Some(mut entry) if entry.holder == holder && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        self.locks
            .remove_if(name, |_, entry| entry.holder == holder);
        Ok(())
    }
}
