//! Process-local object store with the full collaborator semantics:
//! object-level copy-on-write snapshots, omap CAS, advisory locks and
//! watch/notify with asynchronous delivery.
//!
//! Multiple [`MemCluster`] clients can connect to one [`MemBackend`],
//! which is how the tests model several nodes racing on one image.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use blockio_common::{
    Error, LockMode, Locker, PoolId, Result, SnapContext, SnapId, SNAP_HEAD,
};

use crate::{
    Cluster, LockInfo, NotifyAck, Pool, WatchCallback, WatchHandle, WatcherInfo,
};

/// Object state preserved per snapshot sequence point. `None` records that
/// the object did not exist at that point.
type CloneData = Option<Vec<u8>>;

#[derive(Default)]
struct MemObject {
    /// Current head data; `None` once the head has been removed
    head: Option<Vec<u8>>,
    /// Snap sequence observed at the last head mutation
    head_seq: SnapId,
    /// State captured before the first head mutation at each newer seq.
    /// A clone keyed `s` holds the data every snapshot id in
    /// `(previous key, s]` observed.
    clones: BTreeMap<SnapId, CloneData>,
    omap: BTreeMap<String, Bytes>,
    tmap: BTreeMap<String, ()>,
    locks: HashMap<String, LockRecord>,
}

#[derive(Default, Clone)]
struct LockRecord {
    mode: Option<LockMode>,
    tag: String,
    /// (client, cookie, address)
    holders: Vec<Locker>,
}

impl MemObject {
    /// Preserve the pre-write state when this mutation is the first one
    /// tagged with a newer snap sequence.
    fn preserve(&mut self, snapc: &SnapContext) {
        if snapc.seq != SNAP_HEAD && snapc.seq > self.head_seq {
            self.clones.insert(snapc.seq, self.head.clone());
            self.head_seq = snapc.seq;
        }
    }

    /// Data visible at `snap_id`; `Err` when the object did not exist then.
    fn at_snap(&self, snap_id: SnapId) -> Option<&[u8]> {
        if snap_id == SNAP_HEAD {
            return self.head.as_deref();
        }
        // first clone at or after the requested snapshot holds its state
        if let Some((_, data)) = self.clones.range(snap_id..).next() {
            return data.as_deref();
        }
        // head not mutated since the snapshot was taken
        if self.head_seq < snap_id {
            return self.head.as_deref();
        }
        None
    }

    fn live(&self) -> bool {
        self.head.is_some() || self.clones.values().any(Option::is_some)
    }
}

struct WatchEntry {
    client: String,
    address: String,
    callback: Arc<dyn WatchCallback>,
}

struct PoolState {
    id: PoolId,
    name: String,
    base_tier: PoolId,
    objects: Mutex<HashMap<String, MemObject>>,
    watches: Mutex<HashMap<String, HashMap<u64, WatchEntry>>>,
    snap_seq: AtomicU64,
}

impl PoolState {
    fn with_object<T>(&self, oid: &str, f: impl FnOnce(&MemObject) -> Result<T>) -> Result<T> {
        let objects = self.objects.lock();
        match objects.get(oid) {
            Some(obj) => f(obj),
            None => Err(Error::not_found(oid)),
        }
    }
}

/// Shared state behind every connected client
pub struct MemBackend {
    pools: RwLock<BTreeMap<PoolId, Arc<PoolState>>>,
    next_pool_id: AtomicU64,
    next_client_id: AtomicU64,
    next_watch_handle: AtomicU64,
}

impl MemBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: RwLock::new(BTreeMap::new()),
            next_pool_id: AtomicU64::new(1),
            next_client_id: AtomicU64::new(1),
            next_watch_handle: AtomicU64::new(1),
        })
    }

    /// Create a regular pool and return its id
    pub fn create_pool(self: &Arc<Self>, name: &str) -> PoolId {
        let id = self.next_pool_id.fetch_add(1, Ordering::SeqCst) as PoolId;
        self.pools.write().insert(
            id,
            Arc::new(PoolState {
                id,
                name: name.to_string(),
                base_tier: id,
                objects: Mutex::new(HashMap::new()),
                watches: Mutex::new(HashMap::new()),
                snap_seq: AtomicU64::new(0),
            }),
        );
        id
    }

    /// Create a cache-tier pool fronting `base`; cross-pool scans skip it
    pub fn create_cache_tier(self: &Arc<Self>, name: &str, base: PoolId) -> PoolId {
        let id = self.next_pool_id.fetch_add(1, Ordering::SeqCst) as PoolId;
        self.pools.write().insert(
            id,
            Arc::new(PoolState {
                id,
                name: name.to_string(),
                base_tier: base,
                objects: Mutex::new(HashMap::new()),
                watches: Mutex::new(HashMap::new()),
                snap_seq: AtomicU64::new(0),
            }),
        );
        id
    }

    fn pool_state(&self, id: PoolId) -> Result<Arc<PoolState>> {
        self.pools
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pool {id}")))
    }
}

/// One connected client
pub struct MemCluster {
    backend: Arc<MemBackend>,
    client_id: String,
    address: String,
    instance: u64,
}

impl MemCluster {
    pub fn connect(backend: &Arc<MemBackend>) -> Arc<Self> {
        let n = backend.next_client_id.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            backend: Arc::clone(backend),
            client_id: format!("client.{n}"),
            address: format!("127.0.0.1:0/{n}"),
            instance: n,
        })
    }
}

impl Cluster for MemCluster {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    fn client_address(&self) -> String {
        self.address.clone()
    }

    fn instance_id(&self) -> u64 {
        self.instance
    }

    fn pool(&self, id: PoolId) -> Result<Arc<dyn Pool>> {
        let state = self.backend.pool_state(id)?;
        Ok(Arc::new(MemPool {
            backend: Arc::clone(&self.backend),
            state,
            client_id: self.client_id.clone(),
            address: self.address.clone(),
        }))
    }

    fn pool_lookup(&self, name: &str) -> Result<PoolId> {
        self.backend
            .pools
            .read()
            .values()
            .find(|p| p.name == name)
            .map(|p| p.id)
            .ok_or_else(|| Error::not_found(format!("pool {name}")))
    }

    fn pool_reverse_lookup(&self, id: PoolId) -> Result<String> {
        Ok(self.backend.pool_state(id)?.name.clone())
    }

    fn pool_list(&self) -> Result<Vec<(PoolId, String)>> {
        Ok(self
            .backend
            .pools
            .read()
            .values()
            .map(|p| (p.id, p.name.clone()))
            .collect())
    }

    fn pool_base_tier(&self, id: PoolId) -> Result<PoolId> {
        Ok(self.backend.pool_state(id)?.base_tier)
    }

    fn wait_for_latest_map(&self) -> Result<()> {
        Ok(())
    }
}

struct MemPool {
    backend: Arc<MemBackend>,
    state: Arc<PoolState>,
    client_id: String,
    address: String,
}

impl Pool for MemPool {
    fn id(&self) -> PoolId {
        self.state.id
    }

    fn name(&self) -> String {
        self.state.name.clone()
    }

    fn read(&self, oid: &str, off: u64, len: u64, snap_id: SnapId) -> Result<Bytes> {
        self.state.with_object(oid, |obj| {
            let data = obj
                .at_snap(snap_id)
                .ok_or_else(|| Error::not_found(oid))?;
            let off = off as usize;
            if off >= data.len() {
                return Ok(Bytes::new());
            }
            let end = data.len().min(off + len as usize);
            Ok(Bytes::copy_from_slice(&data[off..end]))
        })
    }

    fn write(&self, oid: &str, off: u64, data: &[u8], snapc: &SnapContext) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let obj = objects.entry(oid.to_string()).or_default();
        obj.preserve(snapc);
        let head = obj.head.get_or_insert_with(Vec::new);
        let off = off as usize;
        if head.len() < off + data.len() {
            head.resize(off + data.len(), 0);
        }
        head[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn write_full(&self, oid: &str, data: &[u8], snapc: &SnapContext) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let obj = objects.entry(oid.to_string()).or_default();
        obj.preserve(snapc);
        obj.head = Some(data.to_vec());
        Ok(())
    }

    fn create_exclusive(&self, oid: &str) -> Result<()> {
        let mut objects = self.state.objects.lock();
        if objects.get(oid).is_some_and(|o| o.head.is_some()) {
            return Err(Error::AlreadyExists(oid.to_string()));
        }
        objects.entry(oid.to_string()).or_default().head = Some(Vec::new());
        Ok(())
    }

    fn remove(&self, oid: &str, snapc: &SnapContext) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let Some(obj) = objects.get_mut(oid) else {
            return Err(Error::not_found(oid));
        };
        if obj.head.is_none() {
            return Err(Error::not_found(oid));
        }
        obj.preserve(snapc);
        obj.head = None;
        if !obj.live() {
            objects.remove(oid);
        }
        Ok(())
    }

    fn truncate(&self, oid: &str, size: u64, snapc: &SnapContext) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let obj = objects.entry(oid.to_string()).or_default();
        obj.preserve(snapc);
        let head = obj.head.get_or_insert_with(Vec::new);
        head.resize(size as usize, 0);
        Ok(())
    }

    fn zero(&self, oid: &str, off: u64, len: u64, snapc: &SnapContext) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let Some(obj) = objects.get_mut(oid) else {
            // zeroing a hole is a no-op
            return Ok(());
        };
        obj.preserve(snapc);
        if let Some(head) = obj.head.as_mut() {
            let off = off as usize;
            let end = head.len().min(off + len as usize);
            if off < end {
                head[off..end].fill(0);
            }
        }
        Ok(())
    }

    fn stat(&self, oid: &str) -> Result<u64> {
        self.state.with_object(oid, |obj| {
            obj.head
                .as_ref()
                .map(|d| d.len() as u64)
                .ok_or_else(|| Error::not_found(oid))
        })
    }

    fn exists(&self, oid: &str, snap_id: SnapId) -> Result<bool> {
        let objects = self.state.objects.lock();
        Ok(objects
            .get(oid)
            .is_some_and(|obj| obj.at_snap(snap_id).is_some()))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn omap_get(&self, oid: &str, key: &str) -> Result<Option<Bytes>> {
        self.state
            .with_object(oid, |obj| Ok(obj.omap.get(key).cloned()))
    }

    fn omap_set(&self, oid: &str, entries: &[(String, Bytes)]) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let obj = objects.entry(oid.to_string()).or_default();
        if obj.head.is_none() {
            obj.head = Some(Vec::new());
        }
        for (k, v) in entries {
            obj.omap.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn omap_remove(&self, oid: &str, key: &str) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let Some(obj) = objects.get_mut(oid) else {
            return Err(Error::not_found(oid));
        };
        obj.omap.remove(key);
        Ok(())
    }

    fn omap_list(&self, oid: &str, start_after: &str, max: usize) -> Result<Vec<(String, Bytes)>> {
        self.state.with_object(oid, |obj| {
            let iter = obj
                .omap
                .iter()
                .filter(|(k, _)| k.as_str() > start_after)
                .map(|(k, v)| (k.clone(), v.clone()));
            Ok(if max == 0 {
                iter.collect()
            } else {
                iter.take(max).collect()
            })
        })
    }

    fn omap_compare_and_swap(
        &self,
        oid: &str,
        key: &str,
        expect: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let obj = objects.entry(oid.to_string()).or_default();
        if obj.head.is_none() {
            obj.head = Some(Vec::new());
        }
        let current = obj.omap.get(key).map(|b| b.as_ref());
        if current != expect {
            return Err(Error::Stale);
        }
        match value {
            Some(v) => {
                obj.omap.insert(key.to_string(), Bytes::copy_from_slice(v));
            }
            None => {
                obj.omap.remove(key);
            }
        }
        Ok(())
    }

    fn tmap_set(&self, oid: &str, key: &str) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let obj = objects.entry(oid.to_string()).or_default();
        if obj.head.is_none() {
            obj.head = Some(Vec::new());
        }
        obj.tmap.insert(key.to_string(), ());
        Ok(())
    }

    fn tmap_remove(&self, oid: &str, key: &str) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let Some(obj) = objects.get_mut(oid) else {
            return Err(Error::not_found(oid));
        };
        if obj.tmap.remove(key).is_none() {
            return Err(Error::not_found(key));
        }
        Ok(())
    }

    fn tmap_list(&self, oid: &str) -> Result<Vec<String>> {
        let objects = self.state.objects.lock();
        Ok(objects
            .get(oid)
            .map(|obj| obj.tmap.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn snap_create(&self) -> Result<SnapId> {
        Ok(self.state.snap_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn snap_remove(&self, _snap_id: SnapId) -> Result<()> {
        // ids are never reused; clone garbage collection is a backend
        // concern the clients do not observe
        Ok(())
    }

    fn snap_rollback_object(&self, oid: &str, snap_id: SnapId) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let Some(obj) = objects.get_mut(oid) else {
            return Ok(());
        };
        obj.head = obj.at_snap(snap_id).map(<[u8]>::to_vec);
        Ok(())
    }

    fn lock(
        &self,
        oid: &str,
        name: &str,
        mode: LockMode,
        cookie: &str,
        tag: &str,
    ) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let obj = objects.entry(oid.to_string()).or_default();
        if obj.head.is_none() {
            obj.head = Some(Vec::new());
        }
        let rec = obj.locks.entry(name.to_string()).or_default();
        let already_held = rec
            .holders
            .iter()
            .any(|l| l.client == self.client_id && l.cookie == cookie);
        if already_held {
            return Err(Error::AlreadyExists(format!("lock {name}")));
        }
        match rec.mode {
            None => {
                rec.mode = Some(mode);
                rec.tag = tag.to_string();
            }
            Some(LockMode::Shared) if mode == LockMode::Shared && rec.tag == tag => {}
            Some(_) => return Err(Error::Busy(format!("lock {name} is held"))),
        }
        rec.holders.push(Locker {
            client: self.client_id.clone(),
            cookie: cookie.to_string(),
            address: self.address.clone(),
        });
        Ok(())
    }

    fn unlock(&self, oid: &str, name: &str, cookie: &str) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let Some(obj) = objects.get_mut(oid) else {
            return Err(Error::not_found(oid));
        };
        let Some(rec) = obj.locks.get_mut(name) else {
            return Err(Error::not_found(format!("lock {name}")));
        };
        let before = rec.holders.len();
        rec.holders
            .retain(|l| !(l.client == self.client_id && l.cookie == cookie));
        if rec.holders.len() == before {
            return Err(Error::not_found(format!("lock {name}")));
        }
        if rec.holders.is_empty() {
            obj.locks.remove(name);
        }
        Ok(())
    }

    fn break_lock(&self, oid: &str, name: &str, client: &str, cookie: &str) -> Result<()> {
        let mut objects = self.state.objects.lock();
        let Some(obj) = objects.get_mut(oid) else {
            return Err(Error::not_found(oid));
        };
        let Some(rec) = obj.locks.get_mut(name) else {
            return Err(Error::not_found(format!("lock {name}")));
        };
        let before = rec.holders.len();
        rec.holders
            .retain(|l| !(l.client == client && l.cookie == cookie));
        if rec.holders.len() == before {
            return Err(Error::not_found(format!("locker {client}")));
        }
        if rec.holders.is_empty() {
            obj.locks.remove(name);
        }
        Ok(())
    }

    fn lock_info(&self, oid: &str, name: &str) -> Result<LockInfo> {
        let objects = self.state.objects.lock();
        let Some(obj) = objects.get(oid) else {
            return Ok(LockInfo::default());
        };
        Ok(obj
            .locks
            .get(name)
            .map(|rec| LockInfo {
                mode: rec.mode,
                tag: rec.tag.clone(),
                lockers: rec.holders.clone(),
            })
            .unwrap_or_default())
    }

    fn assert_locked(&self, oid: &str, name: &str, cookie: &str) -> Result<()> {
        let info = self.lock_info(oid, name)?;
        let held = info
            .lockers
            .iter()
            .any(|l| l.client == self.client_id && l.cookie == cookie);
        if held { Ok(()) } else { Err(Error::Stale) }
    }

    fn watch(&self, oid: &str, callback: Arc<dyn WatchCallback>) -> Result<WatchHandle> {
        let handle = self.backend.next_watch_handle.fetch_add(1, Ordering::SeqCst);
        self.state.watches.lock().entry(oid.to_string()).or_default().insert(
            handle,
            WatchEntry {
                client: self.client_id.clone(),
                address: self.address.clone(),
                callback,
            },
        );
        Ok(WatchHandle(handle))
    }

    fn unwatch(&self, oid: &str, handle: WatchHandle) -> Result<()> {
        let mut watches = self.state.watches.lock();
        if let Some(entries) = watches.get_mut(oid) {
            entries.remove(&handle.0);
            if entries.is_empty() {
                watches.remove(oid);
            }
        }
        Ok(())
    }

    fn notify(&self, oid: &str, payload: &[u8], timeout: Duration) -> Result<Vec<NotifyAck>> {
        // snapshot the watcher list, then deliver from a detached thread so
        // callbacks observe the same "arbitrary thread" environment a real
        // cluster produces
        let targets: Vec<(String, Arc<dyn WatchCallback>)> = {
            let watches = self.state.watches.lock();
            watches
                .get(oid)
                .map(|entries| {
                    entries
                        .values()
                        .map(|e| (e.client.clone(), Arc::clone(&e.callback)))
                        .collect()
                })
                .unwrap_or_default()
        };
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        debug!(oid, watchers = targets.len(), "delivering notification");
        let payload = payload.to_vec();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut acks = Vec::with_capacity(targets.len());
            for (client, callback) in targets {
                let ack = callback.notify(&payload);
                acks.push(NotifyAck {
                    client,
                    payload: ack,
                });
            }
            let _ = tx.send(acks);
        });

        rx.recv_timeout(timeout).map_err(|_| Error::Timeout)
    }

    fn list_watchers(&self, oid: &str) -> Result<Vec<WatcherInfo>> {
        let watches = self.state.watches.lock();
        Ok(watches
            .get(oid)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(handle, e)| WatcherInfo {
                        client: e.client.clone(),
                        cookie: *handle,
                        address: e.address.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<dyn Pool> {
        let backend = MemBackend::new();
        let id = backend.create_pool("test");
        MemCluster::connect(&backend).pool(id).unwrap()
    }

    fn head_snapc() -> SnapContext {
        SnapContext::default()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let p = pool();
        p.write("obj", 0, b"hello", &head_snapc()).unwrap();
        let data = p.read("obj", 0, 5, SNAP_HEAD).unwrap();
        assert_eq!(&data[..], b"hello");

        // short read past the end
        let tail = p.read("obj", 3, 16, SNAP_HEAD).unwrap();
        assert_eq!(&tail[..], b"lo");
    }

    #[test]
    fn test_read_missing_object() {
        let p = pool();
        assert!(p.read("nope", 0, 16, SNAP_HEAD).unwrap_err().is_not_found());
    }

    #[test]
    fn test_snapshot_preserves_old_data() {
        let p = pool();
        p.write("obj", 0, b"AAAA", &head_snapc()).unwrap();

        let snap = p.snap_create().unwrap();
        let snapc = SnapContext {
            seq: snap,
            snaps: vec![snap],
        };
        p.write("obj", 0, b"BBBB", &snapc).unwrap();

        assert_eq!(&p.read("obj", 0, 4, SNAP_HEAD).unwrap()[..], b"BBBB");
        assert_eq!(&p.read("obj", 0, 4, snap).unwrap()[..], b"AAAA");
    }

    #[test]
    fn test_object_absent_at_old_snapshot() {
        let p = pool();
        let snap = p.snap_create().unwrap();
        let snapc = SnapContext {
            seq: snap,
            snaps: vec![snap],
        };
        p.write("obj", 0, b"new", &snapc).unwrap();

        assert!(p.read("obj", 0, 3, snap).unwrap_err().is_not_found());
        assert!(!p.exists("obj", snap).unwrap());
        assert!(p.exists("obj", SNAP_HEAD).unwrap());
    }

    #[test]
    fn test_rollback_object() {
        let p = pool();
        p.write("obj", 0, b"AAAA", &head_snapc()).unwrap();
        let snap = p.snap_create().unwrap();
        let snapc = SnapContext {
            seq: snap,
            snaps: vec![snap],
        };
        p.write("obj", 0, b"BBBB", &snapc).unwrap();

        p.snap_rollback_object("obj", snap).unwrap();
        assert_eq!(&p.read("obj", 0, 4, SNAP_HEAD).unwrap()[..], b"AAAA");
    }

    #[test]
    fn test_omap_compare_and_swap() {
        let p = pool();
        p.omap_set("hdr", &[("k".into(), Bytes::from_static(b"v1"))])
            .unwrap();

        // losing comparison
        let err = p
            .omap_compare_and_swap("hdr", "k", Some(b"v0"), Some(b"v2"))
            .unwrap_err();
        assert!(matches!(err, Error::Stale));

        p.omap_compare_and_swap("hdr", "k", Some(b"v1"), Some(b"v2"))
            .unwrap();
        assert_eq!(&p.omap_get("hdr", "k").unwrap().unwrap()[..], b"v2");

        // CAS-remove
        p.omap_compare_and_swap("hdr", "k", Some(b"v2"), None).unwrap();
        assert!(p.omap_get("hdr", "k").unwrap().is_none());
    }

    #[test]
    fn test_exclusive_lock_conflicts() {
        let backend = MemBackend::new();
        let id = backend.create_pool("test");
        let a = MemCluster::connect(&backend).pool(id).unwrap();
        let b = MemCluster::connect(&backend).pool(id).unwrap();

        a.lock("hdr", "guard", LockMode::Exclusive, "c1", "").unwrap();
        let err = b
            .lock("hdr", "guard", LockMode::Exclusive, "c2", "")
            .unwrap_err();
        assert!(matches!(err, Error::Busy(_)));

        a.unlock("hdr", "guard", "c1").unwrap();
        b.lock("hdr", "guard", LockMode::Exclusive, "c2", "").unwrap();
    }

    #[test]
    fn test_assert_locked() {
        let p = pool();
        p.lock("hdr", "guard", LockMode::Exclusive, "c1", "").unwrap();
        p.assert_locked("hdr", "guard", "c1").unwrap();
        assert!(matches!(
            p.assert_locked("hdr", "guard", "other"),
            Err(Error::Stale)
        ));
    }

    struct Echo;

    impl WatchCallback for Echo {
        fn notify(&self, payload: &[u8]) -> Option<Bytes> {
            Some(Bytes::copy_from_slice(payload))
        }
    }

    #[test]
    fn test_notify_collects_acks() {
        let p = pool();
        p.write("hdr", 0, b"", &head_snapc()).unwrap();
        let handle = p.watch("hdr", Arc::new(Echo)).unwrap();

        let acks = p
            .notify("hdr", b"ping", Duration::from_secs(1))
            .unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(&acks[0].payload.as_ref().unwrap()[..], b"ping");

        p.unwatch("hdr", handle).unwrap();
        assert!(p.notify("hdr", b"ping", Duration::from_secs(1)).unwrap().is_empty());
    }

    #[test]
    fn test_cache_tier_lookup() {
        let backend = MemBackend::new();
        let base = backend.create_pool("base");
        let cache = backend.create_cache_tier("hot", base);
        let cluster = MemCluster::connect(&backend);
        assert_eq!(cluster.pool_base_tier(base).unwrap(), base);
        assert_eq!(cluster.pool_base_tier(cache).unwrap(), base);
    }
}
