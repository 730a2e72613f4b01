use std::collections::VecDeque;
use std::sync::Mutex;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use mist_types::{GetRequest, KvEntry, KvError, PutRequest};

use crate::service::KvService;

// ---------------------------------------------------------------------------
// Fault configuration
// ---------------------------------------------------------------------------

/// Drop behavior of the simulated transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultConfig {
    pub unreliable: bool,
    /// Probability that each direction of a call is dropped, in `[0, 1]`.
    pub drop_rate: f64,
}

impl Default for FaultConfig {
    /// Reliable: nothing is ever dropped.
    fn default() -> Self {
        FaultConfig { unreliable: false, drop_rate: 0.0 }
    }
}

impl FaultConfig {
    /// Unreliable transport dropping each direction with `drop_rate`.
    pub fn lossy(drop_rate: f64) -> Self {
        FaultConfig { unreliable: true, drop_rate: drop_rate.clamp(0.0, 1.0) }
    }
}

/// Outcome of the two per-call Bernoulli draws: one for the request
/// direction, one for the reply direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallFate {
    pub drop_request: bool,
    pub drop_reply: bool,
}

impl CallFate {
    pub const DELIVER: CallFate = CallFate { drop_request: false, drop_reply: false };
    pub const DROP_REQUEST: CallFate = CallFate { drop_request: true, drop_reply: false };
    pub const DROP_REPLY: CallFate = CallFate { drop_request: false, drop_reply: true };
}

/// Where call fates come from.
enum DropPlan {
    /// Independent draws at the configured rate from a seedable RNG.
    Bernoulli { config: FaultConfig, rng: SmallRng },
    /// Explicit fates, one per call, for deterministic tests. A dry
    /// script delivers everything.
    Script(VecDeque<CallFate>),
}

impl DropPlan {
    fn next_fate(&mut self) -> CallFate {
        match self {
            DropPlan::Bernoulli { config, rng } => {
                if !config.unreliable {
                    return CallFate::DELIVER;
                }
                CallFate {
                    drop_request: rng.gen_bool(config.drop_rate),
                    drop_reply: rng.gen_bool(config.drop_rate),
                }
            }
            DropPlan::Script(fates) => fates.pop_front().unwrap_or(CallFate::DELIVER),
        }
    }
}

// ---------------------------------------------------------------------------
// LossyNet
// ---------------------------------------------------------------------------

/// Unreliable transport wrapper around any `KvService`.
///
/// When the request direction is dropped the inner service never runs.
/// When the reply direction is dropped the inner service ran (the store
/// may have mutated) but the caller still observes `KvError::Dropped`.
/// The caller cannot tell the two apart.
pub struct LossyNet<S> {
    inner: S,
    plan: Mutex<DropPlan>,
}

impl<S> LossyNet<S> {
    /// Wrap `inner` with Bernoulli drops per `config`, entropy-seeded.
    pub fn new(inner: S, config: FaultConfig) -> Self {
        Self::seeded(inner, config, rand::random())
    }

    /// Like [`LossyNet::new`] with a fixed RNG seed, for reproducible runs.
    pub fn seeded(inner: S, config: FaultConfig, seed: u64) -> Self {
        LossyNet {
            inner,
            plan: Mutex::new(DropPlan::Bernoulli {
                config,
                rng: SmallRng::seed_from_u64(seed),
            }),
        }
    }

    /// Wrap `inner` with an explicit per-call fate script.
    pub fn scripted(inner: S, fates: impl IntoIterator<Item = CallFate>) -> Self {
        LossyNet {
            inner,
            plan: Mutex::new(DropPlan::Script(fates.into_iter().collect())),
        }
    }

    /// Swap the fault behavior at runtime.
    pub fn set_fault(&self, config: FaultConfig) {
        *self.plan.lock().unwrap() = DropPlan::Bernoulli {
            config,
            rng: SmallRng::seed_from_u64(rand::random()),
        };
    }

    /// The wrapped service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn next_fate(&self) -> CallFate {
        self.plan.lock().unwrap().next_fate()
    }
}

impl<S: KvService> KvService for LossyNet<S> {
    async fn get(&self, req: GetRequest) -> Result<KvEntry, KvError> {
        let fate = self.next_fate();
        if fate.drop_request {
            trace!(key = %req.key, "get request dropped");
            return Err(KvError::Dropped);
        }
        let reply = self.inner.get(req).await;
        if fate.drop_reply {
            trace!("get reply dropped");
            return Err(KvError::Dropped);
        }
        reply
    }

    async fn put(&self, req: PutRequest) -> Result<(), KvError> {
        let fate = self.next_fate();
        if fate.drop_request {
            trace!(key = %req.key, seq = req.seq, "put request dropped");
            return Err(KvError::Dropped);
        }
        let reply = self.inner.put(req).await;
        if fate.drop_reply {
            trace!("put reply dropped");
            return Err(KvError::Dropped);
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::KvServer;

    fn put_req(key: &str, value: &str, expected: u64, seq: u64) -> PutRequest {
        PutRequest {
            key: key.into(),
            value: value.into(),
            expected_version: expected,
            client_id: "c".into(),
            seq,
        }
    }

    #[tokio::test]
    async fn reliable_by_default() {
        let net = LossyNet::new(KvServer::new(), FaultConfig::default());
        for seq in 1..=20 {
            let key = format!("k{seq}");
            net.put(put_req(&key, "v", 0, seq)).await.unwrap();
            net.get(GetRequest { key }).await.unwrap();
        }
    }

    #[tokio::test]
    async fn full_drop_rate_never_reaches_server() {
        let net = LossyNet::seeded(KvServer::new(), FaultConfig::lossy(1.0), 7);
        for seq in 1..=10 {
            let err = net.put(put_req("k", "v", 0, seq)).await.unwrap_err();
            assert_eq!(err, KvError::Dropped);
        }
        assert_eq!(net.inner().stats().await.keys, 0);
    }

    #[tokio::test]
    async fn dropped_reply_still_mutates_store() {
        let net = LossyNet::scripted(KvServer::new(), [CallFate::DROP_REPLY]);

        let err = net.put(put_req("k", "v", 0, 1)).await.unwrap_err();
        assert_eq!(err, KvError::Dropped);
        // The server executed before the reply was lost.
        assert_eq!(net.inner().stats().await.keys, 1);
    }

    #[tokio::test]
    async fn dry_script_delivers() {
        let net = LossyNet::scripted(KvServer::new(), [CallFate::DROP_REQUEST]);

        assert_eq!(net.put(put_req("k", "v", 0, 1)).await, Err(KvError::Dropped));
        net.put(put_req("k", "v", 0, 2)).await.unwrap();
        assert_eq!(net.inner().stats().await.keys, 1);
    }

    #[tokio::test]
    async fn same_seed_same_fates() {
        let a = LossyNet::seeded(KvServer::new(), FaultConfig::lossy(0.5), 42);
        let b = LossyNet::seeded(KvServer::new(), FaultConfig::lossy(0.5), 42);

        let mut outcomes_a = Vec::new();
        let mut outcomes_b = Vec::new();
        for seq in 1..=32 {
            let key = format!("k{seq}");
            outcomes_a.push(a.put(put_req(&key, "v", 0, seq)).await.is_err());
            outcomes_b.push(b.put(put_req(&key, "v", 0, seq)).await.is_err());
        }
        assert_eq!(outcomes_a, outcomes_b);
    }

    #[tokio::test]
    async fn set_fault_flips_behavior() {
        let net = LossyNet::new(KvServer::new(), FaultConfig::lossy(1.0));
        assert_eq!(net.put(put_req("k", "v", 0, 1)).await, Err(KvError::Dropped));

        net.set_fault(FaultConfig::default());
        net.put(put_req("k", "v", 0, 2)).await.unwrap();
    }
}
