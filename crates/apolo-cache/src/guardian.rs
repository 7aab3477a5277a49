//! Named lock service
//!
//! Both engines serialize access to accounts, resources, and resource profiles
//! through keyed locks. A lock is either held for the duration of a closure
//! ([`Guardian::guard`]) or acquired by hand and released later through the
//! reference ID returned by [`Guardian::guard_ids`].
//!
//! Acquisition is bounded by a timeout. When it expires every key already
//! taken by that call is released again and [`AppError::LockTimeout`] is
//! returned, so callers never proceed unlocked.

use apolo_core::error::AppError;
use apolo_core::AppResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

type KeyLock = Arc<AsyncMutex<()>>;

struct HeldLocks {
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

/// Keyed lock service shared by every engine in the process
#[derive(Default)]
pub struct Guardian {
    locks: Mutex<HashMap<String, KeyLock>>,
    held: Mutex<HashMap<String, HeldLocks>>,
}

impl std::fmt::Debug for Guardian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guardian")
            .field("keys", &self.locks.lock().len())
            .field("held", &self.held.lock().len())
            .finish()
    }
}

impl Guardian {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_lock(&self, key: &str) -> KeyLock {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn acquire(&self, keys: &[String], timeout: Duration) -> AppResult<HeldLocks> {
        let mut unique: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            if !unique.contains(key) {
                unique.push(key.clone());
            }
        }

        let mut guards = Vec::with_capacity(unique.len());
        for key in &unique {
            let lock = self.key_lock(key);
            let guard = if timeout.is_zero() {
                lock.lock_owned().await
            } else {
                match tokio::time::timeout(timeout, lock.lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        drop(guards);
                        self.prune(&unique);
                        warn!("Lock timeout after {:?} for key {}", timeout, key);
                        return Err(AppError::LockTimeout(unique.join(",")));
                    }
                }
            };
            guards.push(guard);
        }

        Ok(HeldLocks {
            keys: unique,
            guards,
        })
    }

    /// Forgets lock entries nobody holds or waits on
    fn prune(&self, keys: &[String]) {
        let mut locks = self.locks.lock();
        for key in keys {
            if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(key);
            }
        }
    }

    /// Acquires every key and returns the reference needed to release them
    ///
    /// A zero `timeout` waits indefinitely.
    pub async fn guard_ids(&self, keys: &[String], timeout: Duration) -> AppResult<String> {
        let held = self.acquire(keys, timeout).await?;
        let ref_id = Uuid::new_v4().to_string();
        debug!("Locked {:?} as {}", held.keys, ref_id);
        self.held.lock().insert(ref_id.clone(), held);
        Ok(ref_id)
    }

    /// Releases the keys acquired under `ref_id`
    ///
    /// Returns the released keys; an unknown reference releases nothing.
    pub fn unguard_ids(&self, ref_id: &str) -> Vec<String> {
        let Some(held) = self.held.lock().remove(ref_id) else {
            debug!("Unlock of unknown reference {}", ref_id);
            return Vec::new();
        };
        let HeldLocks { keys, guards } = held;
        drop(guards);
        self.prune(&keys);
        debug!("Unlocked {:?} from {}", keys, ref_id);
        keys
    }

    /// Runs `f` while holding every key
    pub async fn guard<F, Fut, T>(&self, keys: &[String], timeout: Duration, f: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let held = self.acquire(keys, timeout).await?;
        let result = f().await;
        let HeldLocks { keys, guards } = held;
        drop(guards);
        self.prune(&keys);
        result
    }

    /// Number of references currently held through [`Guardian::guard_ids`]
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}
