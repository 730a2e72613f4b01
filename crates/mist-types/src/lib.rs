/// Unique per-client token, allocated once per clerk (UUID v4 string).
pub type ClientId = String;
/// Strictly monotonic per-client request counter; the first request is 1.
pub type Seq = u64;
/// Per-key version counter. 0 is reserved to mean "no entry".
pub type Version = u64;

/// Stored per key: the current value and its version.
///
/// The first successful create produces version 1; every successful update
/// increments by exactly 1. Versions are contiguous for the lifetime of a
/// key, and no operation deletes a key.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KvEntry {
    pub value: String,
    pub version: Version,
}

/// Arguments for a read.
///
/// Reads carry no request identity: they are idempotent at the server and
/// never touch the dedup cache.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GetRequest {
    pub key: String,
}

/// Arguments for a version-conditional write.
///
/// `expected_version == 0` means "expect absence": the write creates the
/// key at version 1. All retries of one logical write reuse the same
/// `(client_id, seq)` identity, which is what lets the server replay the
/// recorded reply instead of applying the write twice.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    pub expected_version: Version,
    pub client_id: ClientId,
    pub seq: Seq,
}

/// Reply to a read.
pub type GetReply = Result<KvEntry, KvError>;
/// Reply to a write. The server caches the latest one per client.
pub type PutReply = Result<(), KvError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KvError {
    /// The key does not exist. From a read of a missing key, or a write
    /// whose expected version is non-zero while the key is absent.
    #[error("key not found")]
    NoKey,
    /// The key exists but the caller's expected version is wrong.
    #[error("version mismatch: expected {expected}, current {current}")]
    VersionMismatch { expected: Version, current: Version },
    /// The transport lost the request or the reply. Produced only by the
    /// lossy transport layer; the clerk absorbs it into retries.
    #[error("request or reply dropped in transit")]
    Dropped,
    /// The write may or may not have been applied; re-read to resolve.
    /// Produced only by the clerk, never by the server.
    #[error("write may or may not have been applied")]
    Maybe,
    /// The retry budget elapsed without a single reply from the server.
    #[error("no reply from server after {attempts} attempts")]
    Timeout { attempts: u32 },
}

impl KvError {
    /// Definitive outcomes guarantee the store is unchanged by the call;
    /// `Maybe` and `Timeout` make no such promise.
    pub fn is_definitive(&self) -> bool {
        matches!(self, KvError::NoKey | KvError::VersionMismatch { .. })
    }
}
