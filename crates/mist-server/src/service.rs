use std::future::Future;

use mist_types::{GetRequest, KvEntry, KvError, PutRequest};

/// The function-call-shaped request path into the KV service.
///
/// Methods use RPITIT (`-> impl Future + Send`); the explicit `+ Send`
/// bound lets generic callers `.await` across task boundaries without an
/// `async-trait` dependency. Implemented by `KvServer` and by the lossy
/// transport wrapper, so the clerk never knows whether its calls can be
/// dropped.
pub trait KvService: Send + Sync + 'static {
    /// Read the current entry for a key. Pure: no store, version, or
    /// dedup-cache state changes, even under retry.
    fn get(&self, req: GetRequest) -> impl Future<Output = Result<KvEntry, KvError>> + Send;

    /// Apply a version-conditional write stamped with a request identity.
    fn put(&self, req: PutRequest) -> impl Future<Output = Result<(), KvError>> + Send;
}
