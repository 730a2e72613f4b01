use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::debug;
use uuid::Uuid;

use mist_clerk::Clerk;
use mist_server::KvService;
use mist_types::KvError;

/// Conventional value stored in a lock key to mean "not held".
pub const FREE_MARKER: &str = "";

/// Distributed mutual-exclusion lock over the KV service.
///
/// The lock is nothing but a key: absent or holding the free marker means
/// free, anything else is the holder's owner id. Exclusion rests entirely
/// on version-conditional writes plus the server's dedup cache; there is
/// no server-side lock primitive to reach for.
///
/// Each instance is a distinct actor with a fresh owner id, even when two
/// instances target the same key through the same clerk.
pub struct DistLock<S> {
    clerk: Arc<Clerk<S>>,
    key: String,
    owner_id: String,
    free_marker: String,
    held: AtomicBool,
    retry_delay: Duration,
}

impl<S: KvService> DistLock<S> {
    pub fn new(clerk: Arc<Clerk<S>>, key: impl Into<String>) -> Self {
        Self::with_free_marker(clerk, key, FREE_MARKER)
    }

    pub fn with_free_marker(
        clerk: Arc<Clerk<S>>,
        key: impl Into<String>,
        free_marker: impl Into<String>,
    ) -> Self {
        DistLock {
            clerk,
            key: key.into(),
            owner_id: Uuid::new_v4().to_string(),
            free_marker: free_marker.into(),
            held: AtomicBool::new(false),
            retry_delay: Duration::from_millis(10),
        }
    }

    /// Pause between acquire rounds while someone else holds the lock.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Identity this instance writes into the lock key.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Local view: did our last acquire/release leave us holding the lock?
    pub fn held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Current holder of the lock key; `None` when absent or free.
    pub async fn holder(&self) -> Result<Option<String>, KvError> {
        match self.clerk.get(&self.key).await {
            Ok(entry) if entry.value == self.free_marker => Ok(None),
            Ok(entry) => Ok(Some(entry.value)),
            Err(KvError::NoKey) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Try to become the holder, waiting at most `timeout`.
    ///
    /// The deadline cancels backoff sleeps and in-flight attempts. A write
    /// the server applied before the cancellation is indistinguishable
    /// from a dropped reply; the owner-id re-read on the next acquire
    /// recovers it. Under no contention this takes two round trips: one
    /// read, one create or take-over.
    pub async fn acquire(&self, timeout: Duration) -> bool {
        if self.held() {
            return true;
        }
        match time::timeout(timeout, self.acquire_loop()).await {
            Ok(()) => {
                self.held.store(true, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    async fn acquire_loop(&self) {
        loop {
            match self.try_acquire_once().await {
                Ok(true) => return,
                Ok(false) | Err(_) => time::sleep(self.retry_delay).await,
            }
        }
    }

    /// One pass of the acquire state machine: read, then create or take
    /// over, resolving any ambiguous write by re-reading.
    async fn try_acquire_once(&self) -> Result<bool, KvError> {
        let entry = match self.clerk.get(&self.key).await {
            Ok(entry) => Some(entry),
            Err(KvError::NoKey) => None,
            Err(err) => return Err(err),
        };

        match entry {
            // Absent: race to create it with our owner id.
            None => match self.clerk.put(&self.key, &self.owner_id, 0).await {
                Ok(()) => {
                    debug!(key = %self.key, "lock created");
                    Ok(true)
                }
                Err(KvError::VersionMismatch { .. }) | Err(KvError::NoKey) => Ok(false),
                Err(KvError::Maybe) | Err(KvError::Timeout { .. }) => self.owns_key().await,
                Err(err) => Err(err),
            },
            // Ours already, e.g. recovered after an ambiguous create.
            Some(e) if e.value == self.owner_id => Ok(true),
            // Free: take over at the observed version.
            Some(e) if e.value == self.free_marker => {
                match self.clerk.put(&self.key, &self.owner_id, e.version).await {
                    Ok(()) => {
                        debug!(key = %self.key, version = e.version + 1, "lock taken over");
                        Ok(true)
                    }
                    Err(KvError::VersionMismatch { .. }) | Err(KvError::NoKey) => Ok(false),
                    Err(KvError::Maybe) | Err(KvError::Timeout { .. }) => self.owns_key().await,
                    Err(err) => Err(err),
                }
            }
            // Held by someone else.
            Some(_) => Ok(false),
        }
    }

    /// Resolve an ambiguous write: do we currently appear as the holder?
    async fn owns_key(&self) -> Result<bool, KvError> {
        match self.clerk.get(&self.key).await {
            Ok(entry) => Ok(entry.value == self.owner_id),
            Err(KvError::NoKey) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Give up the lock.
    ///
    /// Releasing a lock this instance does not hold is a silent no-op. An
    /// ambiguous write counts as released once a re-read shows the value
    /// is no longer our owner id; otherwise the write is retried once.
    pub async fn release(&self) {
        if !self.held.swap(false, Ordering::SeqCst) {
            return;
        }
        for _ in 0..2 {
            let entry = match self.clerk.get(&self.key).await {
                Ok(entry) => entry,
                // Absent or unreadable: nothing we can safely undo.
                Err(_) => return,
            };
            if entry.value != self.owner_id {
                // Already free, or someone took over after an earlier
                // ambiguous release of ours.
                return;
            }
            match self.clerk.put(&self.key, &self.free_marker, entry.version).await {
                Ok(()) => {
                    debug!(key = %self.key, "lock released");
                    return;
                }
                Err(KvError::VersionMismatch { .. }) | Err(KvError::NoKey) => continue,
                Err(KvError::Maybe) | Err(KvError::Timeout { .. }) => {
                    match self.owns_key().await {
                        Ok(false) => return,
                        Ok(true) | Err(_) => continue,
                    }
                }
                Err(_) => return,
            }
        }
    }

    /// Run `section` while holding the lock, releasing on the way out.
    ///
    /// Returns `None` when the lock cannot be acquired within `timeout`.
    /// The release runs after the section's future completes, whatever
    /// value it produces; it does not run if that future is cancelled or
    /// panics.
    pub async fn with_lock<T, Fut>(
        &self,
        timeout: Duration,
        section: impl FnOnce() -> Fut,
    ) -> Option<T>
    where
        Fut: Future<Output = T>,
    {
        if !self.acquire(timeout).await {
            return None;
        }
        let out = section().await;
        self.release().await;
        Some(out)
    }
}
