//! Clerk behavior over the lossy transport: retries, dedup replay, and the
//! classification of ambiguous outcomes.

use std::sync::Arc;
use std::time::Duration;

use mist_clerk::{Clerk, RetryConfig};
use mist_server::{CallFate, FaultConfig, KvServer, KvService, LossyNet};
use mist_types::{GetRequest, KvEntry, KvError};

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 10,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        backoff_factor: 2,
        jitter: false,
    }
}

#[tokio::test]
async fn basic_versioning() {
    let net = Arc::new(LossyNet::new(KvServer::new(), FaultConfig::default()));
    let clerk = Clerk::new(net);

    clerk.put("x", "a", 0).await.unwrap();
    assert_eq!(clerk.get("x").await.unwrap(), KvEntry { value: "a".into(), version: 1 });

    clerk.put("x", "b", 1).await.unwrap();
    assert_eq!(clerk.get("x").await.unwrap(), KvEntry { value: "b".into(), version: 2 });

    assert_eq!(
        clerk.put("x", "c", 1).await,
        Err(KvError::VersionMismatch { expected: 1, current: 2 })
    );
    assert_eq!(clerk.get("x").await.unwrap(), KvEntry { value: "b".into(), version: 2 });
}

#[tokio::test(start_paused = true)]
async fn dropped_reply_replays_cached_ok() {
    // First attempt executes but its reply is lost; the retry carries the
    // same seq, so the server replays the recorded OK instead of applying
    // a second create.
    let net = Arc::new(LossyNet::scripted(KvServer::new(), [CallFate::DROP_REPLY]));
    let clerk = Clerk::with_config(net.clone(), fast_retry());

    clerk.put("y", "1", 0).await.unwrap();

    let e = net.inner().get(GetRequest { key: "y".into() }).await.unwrap();
    assert_eq!(e, KvEntry { value: "1".into(), version: 1 });
    assert_eq!(net.inner().stats().await.keys, 1);
}

#[tokio::test(start_paused = true)]
async fn interleaved_writer_turns_retry_into_maybe() {
    // Clerk A's first attempt is dropped en route, so the server never saw
    // it. Clerk B creates the key in the gap. A's retry then hits a
    // definitive VersionMismatch, but a prior attempt of A's own write
    // might have been the one that created the key, so A must say Maybe.
    let net = Arc::new(LossyNet::scripted(
        KvServer::new(),
        [CallFate::DROP_REQUEST, CallFate::DELIVER, CallFate::DELIVER],
    ));
    let clerk_a = Arc::new(Clerk::with_config(net.clone(), fast_retry()));
    let clerk_b = Clerk::with_config(net.clone(), fast_retry());

    let a = {
        let clerk_a = clerk_a.clone();
        tokio::spawn(async move { clerk_a.put("k", "a", 0).await })
    };

    // Land B's create while A is backing off.
    tokio::time::sleep(Duration::from_millis(10)).await;
    clerk_b.put("k", "b", 0).await.unwrap();

    assert_eq!(a.await.unwrap(), Err(KvError::Maybe));

    // The follow-up read disambiguates.
    let e = clerk_a.get("k").await.unwrap();
    assert_eq!(e, KvEntry { value: "b".into(), version: 1 });
}

#[tokio::test(start_paused = true)]
async fn first_attempt_mismatch_is_definitive() {
    let net = Arc::new(LossyNet::new(KvServer::new(), FaultConfig::default()));
    let clerk = Clerk::with_config(net, fast_retry());

    clerk.put("x", "a", 0).await.unwrap();
    // No drop preceded this attempt, so the mismatch is trustworthy.
    assert_eq!(
        clerk.put("x", "b", 7).await,
        Err(KvError::VersionMismatch { expected: 7, current: 1 })
    );
}

#[tokio::test(start_paused = true)]
async fn everything_dropped_put_is_maybe_get_is_timeout() {
    let net = Arc::new(LossyNet::seeded(KvServer::new(), FaultConfig::lossy(1.0), 1));
    let clerk = Clerk::with_config(net.clone(), fast_retry());

    // Every put attempt plausibly reached the server, so exhaustion is
    // ambiguous, not a timeout.
    assert_eq!(clerk.put("k", "v", 0).await, Err(KvError::Maybe));
    // A read leaves the store untouched, so exhaustion is a plain timeout.
    assert_eq!(clerk.get("k").await, Err(KvError::Timeout { attempts: 10 }));

    assert_eq!(net.inner().stats().await.keys, 0);
}

#[tokio::test]
async fn zero_drop_rate_is_never_ambiguous() {
    // Unreliability flagged on, but the rate is 0: every outcome stays
    // definitive.
    let net = Arc::new(LossyNet::new(KvServer::new(), FaultConfig::lossy(0.0)));
    let clerk = Clerk::new(net);

    for i in 0..20 {
        let key = format!("k{i}");
        clerk.put(&key, "v", 0).await.unwrap();
        clerk.get(&key).await.unwrap();
    }
    assert_eq!(clerk.get("missing").await, Err(KvError::NoKey));
    let err = clerk.put("k0", "w", 9).await.unwrap_err();
    assert!(err.is_definitive(), "reliable transport must stay definitive: {err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn lossy_transport_converges_with_reread_recovery() {
    let net = Arc::new(LossyNet::seeded(KvServer::new(), FaultConfig::lossy(0.3), 99));
    let clerk = Clerk::with_config(
        net.clone(),
        RetryConfig {
            max_attempts: 20,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            backoff_factor: 2,
            jitter: true,
        },
    );

    for i in 0..30 {
        let key = format!("key{i}");
        loop {
            match clerk.create_if_missing(&key, "v").await {
                // Created now, or created by an earlier ambiguous attempt
                // of ours (there are no other writers).
                Ok(_) => break,
                Err(KvError::Maybe) | Err(KvError::Timeout { .. }) => {
                    match clerk.get(&key).await {
                        Ok(_) => break,
                        Err(_) => continue,
                    }
                }
                Err(err) => panic!("unexpected outcome: {err}"),
            }
        }
    }

    // Replays never double-created: every key settled at version 1.
    for i in 0..30 {
        let e = clerk.get(&format!("key{i}")).await.unwrap();
        assert_eq!(e.version, 1);
    }
    assert_eq!(net.inner().stats().await.keys, 30);
}
