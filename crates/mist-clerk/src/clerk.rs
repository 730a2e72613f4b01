use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use mist_server::KvService;
use mist_types::{ClientId, GetRequest, KvEntry, KvError, PutRequest, Seq, Version};

// ---------------------------------------------------------------------------
// Retry configuration
// ---------------------------------------------------------------------------

/// Retry schedule for clerk operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Budget of transport attempts per logical operation.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Exponential growth factor between attempts.
    pub backoff_factor: u32,
    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt, with `attempt` counted from 1.
    fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter {
            delay + delay.mul_f64(0.1 * rand::thread_rng().gen::<f64>())
        } else {
            delay
        }
    }
}

// ---------------------------------------------------------------------------
// Clerk
// ---------------------------------------------------------------------------

/// Fault-tolerant client for the KV service.
///
/// A clerk owns a stable client id and a monotonic sequence counter. Every
/// logical write captures a fresh seq and reuses it across retries, which
/// is what makes the server's dedup cache correct. The counter is atomic,
/// so a clerk shared between tasks never reuses a seq, but the intended
/// usage is one clerk per logical actor.
pub struct Clerk<S> {
    service: Arc<S>,
    client_id: ClientId,
    seq: AtomicU64,
    retry: RetryConfig,
}

impl<S: KvService> Clerk<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self::with_config(service, RetryConfig::default())
    }

    pub fn with_config(service: Arc<S>, retry: RetryConfig) -> Self {
        Clerk {
            service,
            client_id: Uuid::new_v4().to_string(),
            seq: AtomicU64::new(0),
            retry,
        }
    }

    /// Stable identity this clerk stamps on its writes.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn next_seq(&self) -> Seq {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Read a key, retrying dropped calls.
    ///
    /// Reads are idempotent at the server, so retries need no identity.
    /// `Timeout` means the budget elapsed without a single reply; the
    /// store is untouched either way.
    pub async fn get(&self, key: &str) -> Result<KvEntry, KvError> {
        for attempt in 1..=self.retry.max_attempts {
            match self.service.get(GetRequest { key: key.to_string() }).await {
                Err(KvError::Dropped) => {
                    debug!(key, attempt, "get dropped, retrying");
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
                other => return other,
            }
        }
        Err(KvError::Timeout { attempts: self.retry.max_attempts })
    }

    /// Version-conditional write with the three-outcome contract.
    ///
    /// `Ok` and the definitive errors (`NoKey`, `VersionMismatch`) mean
    /// exactly what they say. `Maybe` means an earlier attempt of this
    /// same operation may have been applied; the caller disambiguates by
    /// re-reading.
    pub async fn put(
        &self,
        key: &str,
        value: &str,
        expected_version: Version,
    ) -> Result<(), KvError> {
        let seq = self.next_seq();
        let req = PutRequest {
            key: key.to_string(),
            value: value.to_string(),
            expected_version,
            client_id: self.client_id.clone(),
            seq,
        };

        // Has any prior attempt plausibly reached the server? Once true, a
        // definitive error may be evidence of our own earlier success, so
        // it degrades to Maybe.
        let mut ever_sent = false;

        for attempt in 1..=self.retry.max_attempts {
            match self.service.put(req.clone()).await {
                Ok(()) => return Ok(()),
                Err(KvError::Dropped) => {
                    ever_sent = true;
                    debug!(key, seq, attempt, "put dropped, retrying");
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
                Err(err @ (KvError::NoKey | KvError::VersionMismatch { .. })) => {
                    return if ever_sent { Err(KvError::Maybe) } else { Err(err) };
                }
                Err(err) => return Err(err),
            }
        }

        if ever_sent {
            Err(KvError::Maybe)
        } else {
            Err(KvError::Timeout { attempts: self.retry.max_attempts })
        }
    }

    /// Write `value` if the key is currently at `expected_version`.
    ///
    /// `Ok(false)` reports a definitive version mismatch. Ambiguous
    /// outcomes still propagate as errors.
    pub async fn put_if_version(
        &self,
        key: &str,
        value: &str,
        expected_version: Version,
    ) -> Result<bool, KvError> {
        match self.put(key, value, expected_version).await {
            Ok(()) => Ok(true),
            Err(KvError::VersionMismatch { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Create a key if it is absent. `Ok(false)` means it already exists.
    pub async fn create_if_missing(&self, key: &str, value: &str) -> Result<bool, KvError> {
        match self.put(key, value, 0).await {
            Ok(()) => Ok(true),
            Err(KvError::VersionMismatch { .. }) | Err(KvError::NoKey) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
