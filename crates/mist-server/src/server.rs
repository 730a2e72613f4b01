use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use mist_types::{ClientId, GetRequest, KvEntry, KvError, PutRequest, PutReply, Seq};

use crate::service::KvService;

// ---------------------------------------------------------------------------
// KvServer
// ---------------------------------------------------------------------------

struct ServerState {
    data: HashMap<String, KvEntry>,
    /// Latest `(seq, reply)` per client. One slot suffices because clients
    /// issue requests sequentially; an incoming seq equal to the cached one
    /// replays the recorded reply without re-executing.
    replies: HashMap<ClientId, (Seq, PutReply)>,
}

/// In-memory versioned KV server with an at-most-once dedup cache.
///
/// Every operation runs under a single mutex covering both the store and
/// the dedup cache. The critical section never suspends, so the observable
/// history of gets and puts is a total order consistent with real time.
pub struct KvServer {
    state: Mutex<ServerState>,
}

/// Point-in-time counters, for tests and inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub keys: usize,
    pub cached_replies: usize,
}

impl KvServer {
    pub fn new() -> Self {
        KvServer {
            state: Mutex::new(ServerState {
                data: HashMap::new(),
                replies: HashMap::new(),
            }),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let g = self.state.lock().await;
        ServerStats {
            keys: g.data.len(),
            cached_replies: g.replies.len(),
        }
    }

    /// The conditional-write decision table, with the dedup check already
    /// done by the caller.
    fn apply(data: &mut HashMap<String, KvEntry>, req: &PutRequest) -> PutReply {
        let current = data.get(&req.key).map(|e| e.version).unwrap_or(0);
        if req.expected_version != current {
            return if current == 0 {
                Err(KvError::NoKey)
            } else {
                Err(KvError::VersionMismatch {
                    expected: req.expected_version,
                    current,
                })
            };
        }
        data.insert(
            req.key.clone(),
            KvEntry {
                value: req.value.clone(),
                version: current + 1,
            },
        );
        debug!(key = %req.key, version = current + 1, "put applied");
        Ok(())
    }
}

impl Default for KvServer {
    fn default() -> Self {
        Self::new()
    }
}

impl KvService for KvServer {
    async fn get(&self, req: GetRequest) -> Result<KvEntry, KvError> {
        let g = self.state.lock().await;
        match g.data.get(&req.key) {
            Some(entry) => Ok(entry.clone()),
            None => Err(KvError::NoKey),
        }
    }

    async fn put(&self, req: PutRequest) -> Result<(), KvError> {
        let mut g = self.state.lock().await;
        let state = &mut *g;

        if let Some((cached_seq, cached_reply)) = state.replies.get(&req.client_id) {
            if *cached_seq == req.seq {
                trace!(client = %req.client_id, seq = req.seq, "dedup hit, replaying reply");
                return cached_reply.clone();
            }
            if *cached_seq > req.seq {
                // Correct clients never send a seq below the cached one.
                // Execute it as if uncached, but keep the newer slot so
                // retries of the newer request still replay.
                warn!(client = %req.client_id, seq = req.seq, cached = *cached_seq, "stale seq");
                return Self::apply(&mut state.data, &req);
            }
        }

        let reply = Self::apply(&mut state.data, &req);
        state
            .replies
            .insert(req.client_id.clone(), (req.seq, reply.clone()));
        reply
    }
}
