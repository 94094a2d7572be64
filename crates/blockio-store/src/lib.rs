//! blockio-store
//!
//! The narrow interface the image layer assumes from the underlying object
//! store: per-object data ops with snapshot-context tagging, omap key/value
//! entries with compare-and-swap, a legacy directory map, self-managed
//! snapshot ids scoped to a pool, advisory object locks, watch/notify, and
//! pool enumeration with cache-tier awareness.
//!
//! The wire client that talks to real storage nodes lives elsewhere; this
//! crate also ships [`mem`], a process-local implementation with the same
//! semantics that backs the test suites of the higher layers.

pub mod mem;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use blockio_common::{LockMode, Locker, PoolId, Result, SnapContext, SnapId};

/// Callback target for watch notifications. Implementations must tolerate
/// delivery on arbitrary threads.
pub trait WatchCallback: Send + Sync {
    /// Handle one notification. The returned bytes, if any, are delivered
    /// back to the notifier as this watcher's acknowledgement.
    fn notify(&self, payload: &[u8]) -> Option<Bytes>;
}

/// Registration token returned by [`Pool::watch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub u64);

/// One registered watcher, as visible to other clients
#[derive(Debug, Clone)]
pub struct WatcherInfo {
    pub client: String,
    pub cookie: u64,
    pub address: String,
}

/// Acknowledgement from a single watcher after a notify round
#[derive(Debug, Clone)]
pub struct NotifyAck {
    pub client: String,
    pub payload: Option<Bytes>,
}

/// Advisory lock state of one object
#[derive(Debug, Clone, Default)]
pub struct LockInfo {
    pub mode: Option<LockMode>,
    pub tag: String,
    pub lockers: Vec<Locker>,
}

/// Handle to a single pool.
///
/// All data-plane writes carry the caller's [`SnapContext`] so the store can
/// perform object-level copy-on-write; reads address either the head
/// (`SNAP_HEAD`) or a specific snapshot id.
pub trait Pool: Send + Sync {
    fn id(&self) -> PoolId;
    fn name(&self) -> String;

    // ── object data ───────────────────────────────────────────────────────

    /// Read up to `len` bytes at `off`. Short reads indicate the object
    /// ends early; holes inside the object read as zeroes. `NotFound` when
    /// the object does not exist at the addressed snapshot.
    fn read(&self, oid: &str, off: u64, len: u64, snap_id: SnapId) -> Result<Bytes>;
    fn write(&self, oid: &str, off: u64, data: &[u8], snapc: &SnapContext) -> Result<()>;
    fn write_full(&self, oid: &str, data: &[u8], snapc: &SnapContext) -> Result<()>;
    /// Create an empty object, failing with `AlreadyExists` if present.
    fn create_exclusive(&self, oid: &str) -> Result<()>;
    fn remove(&self, oid: &str, snapc: &SnapContext) -> Result<()>;
    fn truncate(&self, oid: &str, size: u64, snapc: &SnapContext) -> Result<()>;
    fn zero(&self, oid: &str, off: u64, len: u64, snapc: &SnapContext) -> Result<()>;
    /// Size of the head object in bytes
    fn stat(&self, oid: &str) -> Result<u64>;
    fn exists(&self, oid: &str, snap_id: SnapId) -> Result<bool>;
    /// Barrier: all writes issued by this client are durable when it returns
    fn flush(&self) -> Result<()>;

    // ── omap key/value entries ────────────────────────────────────────────

    fn omap_get(&self, oid: &str, key: &str) -> Result<Option<Bytes>>;
    fn omap_set(&self, oid: &str, entries: &[(String, Bytes)]) -> Result<()>;
    fn omap_remove(&self, oid: &str, key: &str) -> Result<()>;
    /// List entries with keys strictly greater than `start_after`,
    /// lexicographically, up to `max` (0 = unbounded).
    fn omap_list(&self, oid: &str, start_after: &str, max: usize) -> Result<Vec<(String, Bytes)>>;
    /// Compare-and-swap one entry: succeeds only while `key` currently maps
    /// to `expect` (`None` = absent). `value` of `None` removes the key.
    /// Fails with `Stale` when the comparison loses.
    fn omap_compare_and_swap(
        &self,
        oid: &str,
        key: &str,
        expect: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<()>;

    // ── legacy directory map ──────────────────────────────────────────────

    fn tmap_set(&self, oid: &str, key: &str) -> Result<()>;
    fn tmap_remove(&self, oid: &str, key: &str) -> Result<()>;
    fn tmap_list(&self, oid: &str) -> Result<Vec<String>>;

    // ── self-managed snapshots ────────────────────────────────────────────

    /// Allocate the next snapshot id for this pool
    fn snap_create(&self) -> Result<SnapId>;
    /// Release a snapshot id
    fn snap_remove(&self, snap_id: SnapId) -> Result<()>;
    /// Roll one object back to its state at `snap_id`
    fn snap_rollback_object(&self, oid: &str, snap_id: SnapId) -> Result<()>;

    // ── advisory object locks ─────────────────────────────────────────────

    fn lock(
        &self,
        oid: &str,
        name: &str,
        mode: LockMode,
        cookie: &str,
        tag: &str,
    ) -> Result<()>;
    fn unlock(&self, oid: &str, name: &str, cookie: &str) -> Result<()>;
    fn break_lock(&self, oid: &str, name: &str, client: &str, cookie: &str) -> Result<()>;
    fn lock_info(&self, oid: &str, name: &str) -> Result<LockInfo>;
    /// Verify this client still holds the named lock with `cookie`; fails
    /// with `Stale` otherwise. Metadata updates that must be linearized
    /// under the cooperative lock call this in the same round-trip.
    fn assert_locked(&self, oid: &str, name: &str, cookie: &str) -> Result<()>;

    // ── watch / notify ────────────────────────────────────────────────────

    fn watch(&self, oid: &str, callback: Arc<dyn WatchCallback>) -> Result<WatchHandle>;
    fn unwatch(&self, oid: &str, handle: WatchHandle) -> Result<()>;
    /// Deliver `payload` to every watcher of `oid` and gather their
    /// acknowledgements, waiting at most `timeout`.
    fn notify(&self, oid: &str, payload: &[u8], timeout: Duration) -> Result<Vec<NotifyAck>>;
    fn list_watchers(&self, oid: &str) -> Result<Vec<WatcherInfo>>;
}

/// Handle to the cluster as a whole: pool discovery plus this client's
/// identity as other lockers/watchers see it.
pub trait Cluster: Send + Sync {
    /// Stable identity of this client instance (lock holder id)
    fn client_id(&self) -> String;
    /// Address advertised in locker/watcher listings
    fn client_address(&self) -> String;
    /// Numeric instance id, used to seed generated image ids
    fn instance_id(&self) -> u64;

    fn pool(&self, id: PoolId) -> Result<Arc<dyn Pool>>;
    fn pool_lookup(&self, name: &str) -> Result<PoolId>;
    fn pool_reverse_lookup(&self, id: PoolId) -> Result<String>;
    fn pool_list(&self) -> Result<Vec<(PoolId, String)>>;
    /// Base tier of a pool; a pool whose base tier differs from itself is a
    /// cache tier and is skipped by cross-pool scans.
    fn pool_base_tier(&self, id: PoolId) -> Result<PoolId>;
    /// Block until this client has observed the latest cluster map
    fn wait_for_latest_map(&self) -> Result<()>;
}

/// Seam for an optional write-back object cache sitting between the image
/// layer and the pool. The core never instantiates one; when present it is
/// consulted before reads and receives writes/discards instead of the pool.
pub trait ObjectCache: Send + Sync {
    /// Cached read; `None` means miss and the caller goes to the pool.
    fn read(&self, oid: &str, off: u64, len: u64) -> Option<Bytes>;
    fn write(&self, oid: &str, off: u64, data: &[u8], snapc: &SnapContext) -> Result<()>;
    fn discard(&self, oid: &str, off: u64, len: u64, snapc: &SnapContext) -> Result<()>;
    /// Write back all dirty data
    fn flush(&self) -> Result<()>;
    /// Drop all cached state without writing it back
    fn invalidate(&self) -> Result<()>;
}
