//! Per-image context: the in-memory mirror of one open image and the lock
//! hierarchy everything else nests under.
//!
//! Lock order (outermost first): `owner_lock` → `md_lock` → `cache_lock`
//! → `snap_lock` → `parent_lock` → `refresh_lock`. Helpers that need proof
//! of a held lock take the guarded state struct by reference instead of
//! re-locking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use blockio_common::{
    ClientConfig, Error, Features, ImageFlags, ImageFormat, ParentInfo, Result, SnapContext,
    SnapId, SNAP_HEAD,
};
use blockio_store::{Cluster, ObjectCache, Pool, WatchHandle};

use crate::async_op::{AsyncRequestTracker, TaskQueue};
use crate::exclusive_lock;
use crate::metadata::MetaClient;
use crate::object_map::ObjectMapCache;
use crate::refresh;
use crate::striper::{self, Layout};
use crate::watcher::ImageWatcher;
use crate::{header_name, id_obj_name, legacy_header_name, DATA_PREFIX};

// ── exclusive-lock owner state (guarded by owner_lock) ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockState {
    Unlocked,
    Locked,
    Releasing,
}

pub struct OwnerState {
    pub(crate) state: LockState,
    /// Cookie identifying this client's acquisitions of the header lock
    pub(crate) cookie: String,
    /// Set while hand-off is being prepared; remote requests are refused
    pub(crate) unlock_prepared: bool,
}

impl OwnerState {
    fn new() -> Self {
        Self {
            state: LockState::Unlocked,
            cookie: format!("auto {}", uuid::Uuid::new_v4()),
            unlock_prepared: false,
        }
    }

    #[must_use]
    pub(crate) fn is_lock_owner(&self) -> bool {
        self.state == LockState::Locked
    }
}

// ── snapshot-table state (guarded by snap_lock) ───────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct SnapInfo {
    pub name: String,
    pub size: u64,
    pub parent: Option<ParentInfo>,
    pub protection: blockio_common::ProtectionStatus,
    pub flags: ImageFlags,
}

pub(crate) struct SnapState {
    pub size: u64,
    pub order: u8,
    pub features: Features,
    pub flags: ImageFlags,
    pub object_prefix: String,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub snapc: SnapContext,
    pub snap_info: BTreeMap<SnapId, SnapInfo>,
    pub snap_ids: HashMap<String, SnapId>,
    /// Current selection: SNAP_HEAD or a snapshot id
    pub snap_id: SnapId,
    pub snap_name: String,
    /// False once the selected snapshot was deleted underneath us
    pub snap_exists: bool,
    pub lockers: Vec<blockio_common::Locker>,
    pub exclusive_locked: bool,
    pub lock_tag: String,
    pub object_map: ObjectMapCache,
}

impl SnapState {
    fn new() -> Self {
        Self {
            size: 0,
            order: 0,
            features: Features::empty(),
            flags: ImageFlags::empty(),
            object_prefix: String::new(),
            stripe_unit: 0,
            stripe_count: 0,
            snapc: SnapContext::default(),
            snap_info: BTreeMap::new(),
            snap_ids: HashMap::new(),
            snap_id: SNAP_HEAD,
            snap_name: String::new(),
            snap_exists: true,
            lockers: Vec::new(),
            exclusive_locked: false,
            lock_tag: String::new(),
            object_map: ObjectMapCache::disabled(),
        }
    }

    #[must_use]
    pub fn at_head(&self) -> bool {
        self.snap_id == SNAP_HEAD
    }

    pub fn snap_id_by_name(&self, name: &str) -> Option<SnapId> {
        self.snap_ids.get(name).copied()
    }

    /// Image size at the given view
    pub fn size_at(&self, snap_id: SnapId) -> Result<u64> {
        if snap_id == SNAP_HEAD {
            Ok(self.size)
        } else {
            self.snap_info
                .get(&snap_id)
                .map(|info| info.size)
                .ok_or_else(|| Error::not_found(format!("snapshot {snap_id}")))
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.order, self.stripe_unit, self.stripe_count)
    }

    pub fn add_snap(&mut self, id: SnapId, info: SnapInfo) {
        self.snap_ids.insert(info.name.clone(), id);
        self.snap_info.insert(id, info);
    }

    pub fn rm_snap(&mut self, name: &str, id: SnapId) {
        self.snap_ids.remove(name);
        self.snap_info.remove(&id);
        self.snapc.snaps.retain(|&s| s != id);
    }
}

// ── parent edge (guarded by parent_lock) ──────────────────────────────────

#[derive(Default)]
pub(crate) struct ParentState {
    /// Parent edge of the writable head
    pub parent_md: Option<ParentInfo>,
    /// Open parent context; exclusively owned by this (child) context
    pub parent: Option<Arc<ImageCtx>>,
}

/// Effective parent edge for a view of the image
pub(crate) fn parent_info_at(
    snap: &SnapState,
    parent: &ParentState,
    snap_id: SnapId,
) -> Option<ParentInfo> {
    if snap_id == SNAP_HEAD {
        parent.parent_md.clone()
    } else {
        snap.snap_info.get(&snap_id)?.parent.clone()
    }
}

// ── refresh counters (guarded by refresh_lock) ────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct RefreshCounters {
    pub refresh_seq: u64,
    pub last_refresh: u64,
}

// ── the image context ─────────────────────────────────────────────────────

/// One open image. Shared by reference between the user-facing API, the
/// watch callback and the worker queues; closing tears all of that down.
pub struct ImageCtx {
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) pool: Arc<dyn Pool>,
    pub(crate) meta: MetaClient,
    pub(crate) config: ClientConfig,

    pub(crate) name: String,
    pub(crate) id: String,
    pub(crate) format: ImageFormat,
    pub(crate) header_oid: String,
    pub(crate) read_only: bool,

    pub(crate) owner_lock: RwLock<OwnerState>,
    pub(crate) md_lock: RwLock<()>,
    pub(crate) cache_lock: Mutex<Option<Arc<dyn ObjectCache>>>,
    pub(crate) snap_lock: RwLock<SnapState>,
    pub(crate) parent_lock: RwLock<ParentState>,
    pub(crate) refresh_lock: Mutex<RefreshCounters>,

    pub(crate) io_queue: TaskQueue,
    pub(crate) op_queue: TaskQueue,
    pub(crate) async_requests: AsyncRequestTracker,
    pub(crate) watch_handle: Mutex<Option<WatchHandle>>,
}

impl std::fmt::Debug for ImageCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCtx")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ImageCtx {
    /// Open an image by name, optionally at a snapshot.
    pub fn open(
        cluster: &Arc<dyn Cluster>,
        pool_id: blockio_common::PoolId,
        name: &str,
        snap_name: Option<&str>,
        read_only: bool,
        config: ClientConfig,
    ) -> Result<Arc<ImageCtx>> {
        let pool = cluster.pool(pool_id)?;
        let meta = MetaClient::new(Arc::clone(&pool));

        let format = crate::admin::detect_format_on(&meta, name)?
            .ok_or_else(|| Error::not_found(name))?;
        let (id, header_oid) = match format {
            ImageFormat::Legacy => (String::new(), legacy_header_name(name)),
            ImageFormat::Modern => {
                let id = meta.get_id(&id_obj_name(name))?;
                let header_oid = header_name(&id);
                (id, header_oid)
            }
        };

        Self::open_inner(
            cluster,
            pool,
            name.to_string(),
            id,
            format,
            header_oid,
            snap_name,
            read_only,
            config,
        )
    }

    /// Open by image id; used for parent contexts where only the id is
    /// recorded. Always modern format.
    pub(crate) fn open_by_id(
        cluster: &Arc<dyn Cluster>,
        pool_id: blockio_common::PoolId,
        image_id: &str,
        read_only: bool,
        config: ClientConfig,
    ) -> Result<Arc<ImageCtx>> {
        let pool = cluster.pool(pool_id)?;
        let meta = MetaClient::new(Arc::clone(&pool));
        let name = meta.dir_get_name(image_id).unwrap_or_default();
        let header_oid = header_name(image_id);
        Self::open_inner(
            cluster,
            pool,
            name,
            image_id.to_string(),
            ImageFormat::Modern,
            header_oid,
            None,
            read_only,
            config,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn open_inner(
        cluster: &Arc<dyn Cluster>,
        pool: Arc<dyn Pool>,
        name: String,
        id: String,
        format: ImageFormat,
        header_oid: String,
        snap_name: Option<&str>,
        read_only: bool,
        config: ClientConfig,
    ) -> Result<Arc<ImageCtx>> {
        debug!(name, id, ?format, read_only, "opening image");
        let meta = MetaClient::new(Arc::clone(&pool));
        let ctx = Arc::new(ImageCtx {
            cluster: Arc::clone(cluster),
            pool,
            meta,
            config,
            name,
            id,
            format,
            header_oid,
            read_only,
            owner_lock: RwLock::new(OwnerState::new()),
            md_lock: RwLock::new(()),
            cache_lock: Mutex::new(None),
            snap_lock: RwLock::new(SnapState::new()),
            parent_lock: RwLock::new(ParentState::default()),
            refresh_lock: Mutex::new(RefreshCounters::default()),
            io_queue: TaskQueue::new("io"),
            op_queue: TaskQueue::new("op"),
            async_requests: AsyncRequestTracker::default(),
            watch_handle: Mutex::new(None),
        });

        if !ctx.read_only {
            if let Err(e) = ctx.register_watch() {
                warn!(error = %e, "failed to register header watch");
                let _ = ctx.close();
                return Err(e);
            }
        }

        let refresh_result = {
            let owner = ctx.owner_lock.read();
            refresh::refresh(&ctx, &owner)
        };
        if let Err(e) = refresh_result {
            let _ = ctx.close();
            return Err(e);
        }

        if let Err(e) = Self::snap_set_inner(&ctx, snap_name.filter(|s| !s.is_empty())) {
            let _ = ctx.close();
            return Err(e);
        }
        Ok(ctx)
    }

    /// Tear the context down: quiesce I/O, release the lock, close the
    /// parent chain and drop the watch.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        debug!(name = %self.name, "closing image");
        {
            let mut owner = self.owner_lock.write();
            if owner.is_lock_owner() {
                owner.unlock_prepared = true;
            }
        }

        self.cancel_async_requests();
        self.flush_async_operations();

        let mut result = self.flush_writes();
        if let Err(e) = &result {
            warn!(error = %e, "error flushing I/O during close");
        }

        self.op_queue.drain();

        let parent = self.parent_lock.write().parent.take();
        if let Some(parent) = parent {
            let close_r = parent.close();
            if result.is_ok() {
                result = close_r;
            }
        }

        if let Err(e) = exclusive_lock::release_lock(self) {
            warn!(error = %e, "error releasing exclusive lock during close");
            if result.is_ok() {
                result = Err(e);
            }
        }
        self.unregister_watch();

        self.io_queue.shutdown();
        self.op_queue.shutdown();
        result
    }

    // ── watch plumbing ────────────────────────────────────────────────────

    fn register_watch(self: &Arc<Self>) -> Result<()> {
        let callback = Arc::new(ImageWatcher::new(Arc::downgrade(self)));
        let handle = self.pool.watch(&self.header_oid, callback)?;
        *self.watch_handle.lock() = Some(handle);
        Ok(())
    }

    fn unregister_watch(&self) {
        if let Some(handle) = self.watch_handle.lock().take() {
            if let Err(e) = self.pool.unwatch(&self.header_oid, handle) {
                warn!(error = %e, "failed to unregister watch");
            }
        }
    }

    /// Called on every external notification and local metadata write
    pub(crate) fn bump_refresh_seq(&self) {
        let mut counters = self.refresh_lock.lock();
        counters.refresh_seq += 1;
    }

    // ── exclusive-lock support predicates ─────────────────────────────────

    /// Whether the cooperative lock governs this image right now.
    /// Takes snap_lock; do not call while holding it.
    #[must_use]
    pub(crate) fn lock_supported(&self) -> bool {
        let snap = self.snap_lock.read();
        self.lock_supported_at(&snap)
    }

    #[must_use]
    pub(crate) fn lock_supported_at(&self, snap: &SnapState) -> bool {
        !self.read_only
            && !self.format.is_legacy()
            && snap.features.contains(Features::EXCLUSIVE_LOCK)
            && snap.at_head()
    }

    // ── I/O plumbing shared across subsystems ─────────────────────────────

    /// Wait for every queued data-plane operation to retire
    pub fn flush_async_operations(&self) {
        self.io_queue.drain();
    }

    /// Drain queued I/O and push dirty state down to the store
    pub(crate) fn flush_writes(&self) -> Result<()> {
        self.flush_async_operations();
        let cache = self.cache_lock.lock().clone();
        match cache {
            Some(cache) => cache.flush(),
            None => self.pool.flush(),
        }
    }

    /// Signal all outstanding long-running requests for this image
    pub fn cancel_async_requests(&self) {
        self.async_requests.cancel_all();
    }

    /// Drop cached data without writing it back
    pub fn invalidate_cache(&self) -> Result<()> {
        self.flush_async_operations();
        let _owner = self.owner_lock.read();
        let _md = self.md_lock.write();
        let cache = self.cache_lock.lock().clone();
        match cache {
            Some(cache) => cache.invalidate(),
            None => Ok(()),
        }
    }

    /// Install (or remove) the optional write-back cache seam
    pub fn set_object_cache(&self, cache: Option<Arc<dyn ObjectCache>>) {
        *self.cache_lock.lock() = cache;
    }

    // ── snapshot selection ────────────────────────────────────────────────

    /// Switch between head and a named snapshot. Quiesces outstanding
    /// operations and releases the exclusive lock when moving onto a
    /// snapshot, since the view becomes read-only.
    pub fn snap_set(self: &Arc<Self>, snap_name: Option<&str>) -> Result<()> {
        // may be selected at a deleted snapshot; the caller is trying to
        // recover, so a failed refresh is not fatal here
        let _ = refresh::check(self, None);

        let selecting_snap = snap_name.is_some_and(|s| !s.is_empty());
        let mut unlocking = false;
        {
            let mut owner = self.owner_lock.write();
            if owner.is_lock_owner() && selecting_snap {
                // stop accepting remote requests before the hand-off
                owner.unlock_prepared = true;
                unlocking = true;
            }
        }

        self.cancel_async_requests();
        self.flush_async_operations();
        {
            // complete pending writes before the view turns read-only
            let _owner = self.owner_lock.read();
            let _md = self.md_lock.write();
            let cache = self.cache_lock.lock().clone();
            if let Some(cache) = cache {
                cache.flush()?;
            }
        }

        if let Err(e) = Self::snap_set_inner(self, snap_name.filter(|s| !s.is_empty())) {
            if unlocking {
                self.owner_lock.write().unlock_prepared = false;
            }
            return Err(e);
        }

        if unlocking {
            exclusive_lock::release_lock(self)?;
        }
        Ok(())
    }

    fn snap_set_inner(ctx: &Arc<ImageCtx>, snap_name: Option<&str>) -> Result<()> {
        let _owner = ctx.owner_lock.write();
        let _md = ctx.md_lock.read();
        let cache = ctx.cache_lock.lock();
        let mut snap = ctx.snap_lock.write();
        let mut parent = ctx.parent_lock.write();

        match snap_name {
            Some(name) => {
                let id = snap
                    .snap_id_by_name(name)
                    .ok_or_else(|| Error::not_found(format!("snapshot {name}")))?;
                snap.snap_id = id;
                snap.snap_name = name.to_string();
                snap.snap_exists = true;
            }
            None => {
                snap.snap_id = SNAP_HEAD;
                snap.snap_name.clear();
                snap.snap_exists = true;
            }
        }

        let sel = snap.snap_id;
        let num_objects = striper::num_objects(&snap.layout(), snap.size_at(sel)?);
        let sel_flags = if snap.at_head() {
            snap.flags
        } else {
            snap.snap_info
                .get(&sel)
                .map(|info| info.flags)
                .unwrap_or_default()
        };
        let map_on = snap.features.contains(Features::OBJECT_MAP)
            && !sel_flags.contains(ImageFlags::OBJECT_MAP_INVALID);
        snap.object_map
            .refresh(&ctx.pool, &ctx.id, sel, num_objects, map_on)?;

        refresh::refresh_parent(ctx, &cache, &mut snap, &mut parent)
    }

    /// Select a snapshot by id; used while wiring up parent contexts where
    /// only the id is known.
    pub(crate) fn snap_set_by_id(self: &Arc<Self>, snap_id: SnapId) -> Result<()> {
        let name = {
            let snap = self.snap_lock.read();
            snap.snap_info
                .get(&snap_id)
                .map(|info| info.name.clone())
                .ok_or_else(|| Error::not_found(format!("snapshot {snap_id}")))?
        };
        Self::snap_set_inner(self, Some(&name))
    }

    // ── accessors ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Size in bytes of the currently selected view
    pub fn size(self: &Arc<Self>) -> Result<u64> {
        refresh::check(self, None)?;
        let snap = self.snap_lock.read();
        snap.size_at(snap.snap_id)
    }

    pub fn features(self: &Arc<Self>) -> Result<Features> {
        refresh::check(self, None)?;
        Ok(self.snap_lock.read().features)
    }

    /// Flags of the currently selected view
    pub fn flags(self: &Arc<Self>) -> Result<ImageFlags> {
        refresh::check(self, None)?;
        let snap = self.snap_lock.read();
        if snap.at_head() {
            Ok(snap.flags)
        } else {
            snap.snap_info
                .get(&snap.snap_id)
                .map(|info| info.flags)
                .ok_or_else(|| Error::not_found(format!("snapshot {}", snap.snap_name)))
        }
    }

    pub fn order(self: &Arc<Self>) -> Result<u8> {
        refresh::check(self, None)?;
        Ok(self.snap_lock.read().order)
    }

    /// Parent overlap of the current view
    pub fn overlap(self: &Arc<Self>) -> Result<u64> {
        refresh::check(self, None)?;
        let snap = self.snap_lock.read();
        let parent = self.parent_lock.read();
        Ok(parent_info_at(&snap, &parent, snap.snap_id)
            .map(|p| p.overlap)
            .unwrap_or(0))
    }

    /// Parent identity of the current view: (pool name, image name,
    /// snapshot name)
    pub fn parent_info(self: &Arc<Self>) -> Result<(String, String, String)> {
        refresh::check(self, None)?;
        let snap = self.snap_lock.read();
        let parent = self.parent_lock.read();
        let info = parent_info_at(&snap, &parent, snap.snap_id)
            .ok_or_else(|| Error::not_found("image has no parent"))?;

        let pool_name = self.cluster.pool_reverse_lookup(info.spec.pool_id)?;
        let parent_ctx = parent
            .parent
            .as_ref()
            .ok_or_else(|| Error::not_found("image has no parent"))?;
        let snap_name = {
            let psnap = parent_ctx.snap_lock.read();
            psnap
                .snap_info
                .get(&info.spec.snap_id)
                .map(|i| i.name.clone())
                .ok_or_else(|| Error::not_found("parent snapshot"))?
        };
        let parent_meta = MetaClient::new(self.cluster.pool(info.spec.pool_id)?);
        let parent_name = parent_meta.dir_get_name(&info.spec.image_id)?;
        Ok((pool_name, parent_name, snap_name))
    }

    pub fn is_exclusive_lock_owner(&self) -> bool {
        self.owner_lock.read().is_lock_owner()
    }

    pub fn info(self: &Arc<Self>) -> Result<ImageInfo> {
        refresh::check(self, None)?;
        let snap = self.snap_lock.read();
        let size = snap.size_at(snap.snap_id)?;
        let layout = snap.layout();
        Ok(ImageInfo {
            name: self.name.clone(),
            id: self.id.clone(),
            format: self.format,
            size,
            order: snap.order,
            object_size: layout.object_size,
            num_objects: striper::num_objects(&layout, size),
            object_prefix: snap.object_prefix.clone(),
            features: snap.features,
        })
    }

    pub fn snap_list(self: &Arc<Self>) -> Result<Vec<SnapDescription>> {
        refresh::check(self, None)?;
        let snap = self.snap_lock.read();
        Ok(snap
            .snap_info
            .iter()
            .map(|(&id, info)| SnapDescription {
                id,
                name: info.name.clone(),
                size: info.size,
            })
            .collect())
    }

    pub fn snap_exists(self: &Arc<Self>, snap_name: &str) -> Result<bool> {
        refresh::check(self, None)?;
        Ok(self.snap_lock.read().snap_id_by_name(snap_name).is_some())
    }

    /// PROTECTED and UNPROTECTING both report as protected: neither state
    /// allows removal.
    pub fn snap_is_protected(self: &Arc<Self>, snap_name: &str) -> Result<bool> {
        refresh::check(self, None)?;
        let snap = self.snap_lock.read();
        let id = snap
            .snap_id_by_name(snap_name)
            .ok_or_else(|| Error::not_found(snap_name))?;
        let info = snap
            .snap_info
            .get(&id)
            .ok_or_else(|| Error::not_found(snap_name))?;
        Ok(info.protection.prevents_removal())
    }

    /// Object name for `object_no` under the current naming scheme
    pub(crate) fn object_name(&self, snap: &SnapState, object_no: u64) -> String {
        match self.format {
            ImageFormat::Legacy => format!("{}.{:012x}", snap.object_prefix, object_no),
            ImageFormat::Modern => format!("{}.{:016x}", snap.object_prefix, object_no),
        }
    }

    pub(crate) fn data_prefix_for(image_id: &str) -> String {
        format!("{DATA_PREFIX}{image_id}")
    }
}

/// Summary returned by [`ImageCtx::info`]
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub name: String,
    pub id: String,
    pub format: ImageFormat,
    pub size: u64,
    pub order: u8,
    pub object_size: u64,
    pub num_objects: u64,
    pub object_prefix: String,
    pub features: Features,
}

/// One entry of [`ImageCtx::snap_list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapDescription {
    pub id: SnapId,
    pub name: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snap_state_lookup() {
        let mut snap = SnapState::new();
        snap.size = 100;
        snap.add_snap(
            3,
            SnapInfo {
                name: "s".to_string(),
                size: 50,
                parent: None,
                protection: blockio_common::ProtectionStatus::Unprotected,
                flags: ImageFlags::empty(),
            },
        );

        assert_eq!(snap.snap_id_by_name("s"), Some(3));
        assert_eq!(snap.size_at(SNAP_HEAD).unwrap(), 100);
        assert_eq!(snap.size_at(3).unwrap(), 50);
        assert!(snap.size_at(9).unwrap_err().is_not_found());

        snap.rm_snap("s", 3);
        assert_eq!(snap.snap_id_by_name("s"), None);
    }

    #[test]
    fn test_parent_info_selection() {
        let mut snap = SnapState::new();
        let head_parent = ParentInfo {
            spec: blockio_common::ParentSpec::new(1, "p", 2),
            overlap: 512,
        };
        let snap_parent = ParentInfo {
            spec: blockio_common::ParentSpec::new(1, "q", 9),
            overlap: 256,
        };
        snap.add_snap(
            5,
            SnapInfo {
                name: "s".to_string(),
                size: 50,
                parent: Some(snap_parent.clone()),
                protection: blockio_common::ProtectionStatus::Unprotected,
                flags: ImageFlags::empty(),
            },
        );
        let parent = ParentState {
            parent_md: Some(head_parent.clone()),
            parent: None,
        };

        assert_eq!(parent_info_at(&snap, &parent, SNAP_HEAD), Some(head_parent));
        assert_eq!(parent_info_at(&snap, &parent, 5), Some(snap_parent));
        assert_eq!(parent_info_at(&snap, &parent, 7), None);
    }
}
