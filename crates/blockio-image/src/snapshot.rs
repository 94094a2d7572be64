//! Snapshot lifecycle: create, remove, protect, unprotect, rollback, and
//! the parent/children bookkeeping that keeps the cross-pool children set
//! consistent with every live parent edge.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, warn};

use blockio_common::{
    Error, Features, ImageFlags, ParentSpec, ProtectionStatus, Result, SnapId,
};

use crate::async_op::{invoke_async_request, LocalRequest, Throttle};
use crate::exclusive_lock;
use crate::image::{ImageCtx, OwnerState, SnapInfo, SnapState};
use crate::maintenance::{self, NoProgress, ProgressSink};
use crate::metadata::{MetaClient, SnapshotRecord};
use crate::refresh;
use crate::striper;
use crate::watcher::{self, NotifyMessage};

/// Does any *other* snapshot still reference `spec` as its parent?
fn scan_for_parents(snap: &SnapState, spec: &ParentSpec, skip_snap: SnapId) -> bool {
    snap.snap_info.iter().any(|(&id, info)| {
        id != skip_snap && info.parent.as_ref().map(|p| &p.spec) == Some(spec)
    })
}

impl ImageCtx {
    // ── create ────────────────────────────────────────────────────────────

    pub fn snap_create(self: &Arc<Self>, snap_name: &str) -> Result<()> {
        debug!(name = %self.name, snap_name, "snap_create");
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        refresh::check(self, None)?;
        {
            let snap = self.snap_lock.read();
            if snap.snap_id_by_name(snap_name).is_some() {
                return Err(Error::AlreadyExists(snap_name.to_string()));
            }
        }

        let local_name = snap_name.to_string();
        let local: LocalRequest = Arc::new(move |ctx, owner, _cancel| {
            snap_create_local(ctx, owner, &local_name)
        });
        let remote_name = snap_name.to_string();
        let result = invoke_async_request(self, "snap_create", true, local, &|| {
            watcher::remote_request(
                self,
                NotifyMessage::SnapCreate {
                    name: remote_name.clone(),
                },
            )
        });
        match result {
            // a concurrent creation of the same name still counts
            Ok(()) | Err(Error::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        watcher::notify_header_update(self);
        Ok(())
    }

    // ── remove ────────────────────────────────────────────────────────────

    pub fn snap_remove(self: &Arc<Self>, snap_name: &str) -> Result<()> {
        debug!(name = %self.name, snap_name, "snap_remove");
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        refresh::check(self, None)?;

        let fast_diff_enabled = {
            let snap = self.snap_lock.read();
            if snap.snap_id_by_name(snap_name).is_none() {
                return Err(Error::not_found(snap_name));
            }
            snap.features.contains(Features::FAST_DIFF)
        };

        if fast_diff_enabled {
            // object-map updates must be linearized under the lock owner
            let local_name = snap_name.to_string();
            let local: LocalRequest = Arc::new(move |ctx, owner, _cancel| {
                snap_remove_local(ctx, owner, &local_name)
            });
            let remote_name = snap_name.to_string();
            let result = invoke_async_request(self, "snap_remove", true, local, &|| {
                watcher::remote_request(
                    self,
                    NotifyMessage::SnapRemove {
                        name: remote_name.clone(),
                    },
                )
            });
            match result {
                Ok(()) | Err(Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        } else {
            let owner = self.owner_lock.read();
            snap_remove_local(self, &owner, snap_name)?;
        }

        watcher::notify_header_update(self);
        Ok(())
    }

    // ── protect / unprotect ───────────────────────────────────────────────

    pub fn snap_protect(self: &Arc<Self>, snap_name: &str) -> Result<()> {
        debug!(name = %self.name, snap_name, "snap_protect");
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        refresh::check(self, None)?;

        {
            let _md = self.md_lock.read();
            let snap = self.snap_lock.read();
            if !snap.features.contains(Features::LAYERING) {
                return Err(Error::Unsupported("image must support layering".into()));
            }
            let snap_id = snap
                .snap_id_by_name(snap_name)
                .ok_or_else(|| Error::not_found(snap_name))?;
            let info = snap
                .snap_info
                .get(&snap_id)
                .ok_or_else(|| Error::not_found(snap_name))?;
            if info.protection.prevents_removal() {
                return Err(Error::Busy(format!("snapshot {snap_name} is protected")));
            }
            self.meta
                .set_protection_status(&self.header_oid, snap_id, ProtectionStatus::Protected)?;
        }
        watcher::notify_header_update(self);
        Ok(())
    }

    /// UNPROTECTED ← UNPROTECTING transition, allowed only when no child
    /// in any reachable pool references the snapshot. Cache-tier pools are
    /// skipped; on any child found (or scan error) the snapshot reverts
    /// to PROTECTED.
    pub fn snap_unprotect(self: &Arc<Self>, snap_name: &str) -> Result<()> {
        debug!(name = %self.name, snap_name, "snap_unprotect");
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        refresh::check(self, None)?;

        let snap_id = {
            let _md = self.md_lock.read();
            let snap = self.snap_lock.read();
            if !snap.features.contains(Features::LAYERING) {
                return Err(Error::Unsupported("image must support layering".into()));
            }
            let snap_id = snap
                .snap_id_by_name(snap_name)
                .ok_or_else(|| Error::not_found(snap_name))?;
            let info = snap
                .snap_info
                .get(&snap_id)
                .ok_or_else(|| Error::not_found(snap_name))?;
            if info.protection == ProtectionStatus::Unprotected {
                return Err(Error::invalid("snapshot is already unprotected"));
            }
            self.meta.set_protection_status(
                &self.header_oid,
                snap_id,
                ProtectionStatus::Unprotecting,
            )?;
            snap_id
        };
        watcher::notify_header_update(self);

        match self.scan_children(snap_id) {
            Ok(()) => {}
            Err(e) => {
                let reprotect = self.meta.set_protection_status(
                    &self.header_oid,
                    snap_id,
                    ProtectionStatus::Protected,
                );
                if let Err(pe) = reprotect {
                    warn!(error = %pe, "failed to re-protect snapshot");
                }
                watcher::notify_header_update(self);
                return Err(e);
            }
        }

        self.meta
            .set_protection_status(&self.header_oid, snap_id, ProtectionStatus::Unprotected)?;
        watcher::notify_header_update(self);
        Ok(())
    }

    /// Enumerate every base-tier pool and fail with Busy on the first one
    /// listing a child of `snap_id`.
    fn scan_children(self: &Arc<Self>, snap_id: SnapId) -> Result<()> {
        let spec = ParentSpec::new(self.pool.id(), self.id.clone(), snap_id);

        // protect against pools being renamed or deleted underneath
        self.cluster.wait_for_latest_map()?;
        for (pool_id, pool_name) in self.cluster.pool_list()? {
            let base_tier = match self.cluster.pool_base_tier(pool_id) {
                Ok(base) => base,
                Err(e) if e.is_not_found() => {
                    debug!(pool = %pool_name, "pool no longer exists");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if base_tier != pool_id {
                // pool is a cache; skip it
                continue;
            }
            let pool = match self.cluster.pool(pool_id) {
                Ok(pool) => pool,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let children = MetaClient::new(pool).get_children(&spec)?;
            if !children.is_empty() {
                warn!(
                    pool = %pool_name,
                    children = children.len(),
                    "cannot unprotect: children found"
                );
                return Err(Error::Busy(format!(
                    "{} child image(s) in pool {pool_name}",
                    children.len()
                )));
            }
        }
        Ok(())
    }

    // ── rollback ──────────────────────────────────────────────────────────

    /// Roll the head back to a snapshot: resize to its recorded size, roll
    /// every object back, then roll back the object map. The snapshot
    /// itself is left intact.
    pub fn snap_rollback(
        self: &Arc<Self>,
        snap_name: &str,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        debug!(name = %self.name, snap_name, "snap_rollback");
        refresh::check(self, None)?;

        let (snap_id, new_size) = {
            let snap = self.snap_lock.read();
            if !snap.snap_exists {
                return Err(Error::not_found("selected snapshot was removed"));
            }
            if !snap.at_head() || self.read_only {
                return Err(Error::ReadOnly);
            }
            let snap_id = snap
                .snap_id_by_name(snap_name)
                .ok_or_else(|| Error::not_found(snap_name))?;
            (snap_id, snap.size_at(snap_id)?)
        };

        exclusive_lock::prepare_image_update(self)?;
        let owner = self.owner_lock.read();
        if self.lock_supported() && !owner.is_lock_owner() {
            return Err(Error::ReadOnly);
        }

        {
            // in-flight writes may have produced snapshots of their own;
            // everything dirty must be flushed and the cache dropped
            // before objects start rolling back
            let _md = self.md_lock.write();
            self.flush_async_operations();
            let cache = self.cache_lock.lock().clone();
            if let Some(cache) = cache {
                cache.flush()?;
                cache.invalidate()?;
            }
            self.pool.flush()?;
        }

        debug!("resizing to snapshot size {new_size}");
        let no_cancel = AtomicBool::new(false);
        maintenance::resize_local(self, &owner, &no_cancel, new_size, &NoProgress)?;

        rollback_objects(self, snap_id, progress.as_ref())?;

        {
            let mut snap = self.snap_lock.write();
            snap.object_map.rollback(&self.pool, &self.id, snap_id)?;
        }

        watcher::notify_header_update(self);
        Ok(())
    }
}

fn rollback_objects(
    ctx: &Arc<ImageCtx>,
    snap_id: SnapId,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let (num_objects, object_size, oids) = {
        let snap = ctx.snap_lock.read();
        let layout = snap.layout();
        let n = striper::num_objects(&layout, snap.size);
        let oids: Vec<String> = (0..n).map(|i| ctx.object_name(&snap, i)).collect();
        (n, layout.object_size, oids)
    };

    let throttle = Throttle::new(ctx.config.concurrent_management_ops);
    std::thread::scope(|scope| {
        for (i, oid) in oids.iter().enumerate() {
            throttle.start_op();
            let throttle = Arc::clone(&throttle);
            let pool = Arc::clone(&ctx.pool);
            scope.spawn(move || {
                let result = pool.snap_rollback_object(oid, snap_id);
                throttle.end_op(result);
            });
            progress.update(i as u64 * object_size, num_objects * object_size);
        }
    });
    throttle.wait_for_all()
}

// ── local execution bodies (run under the lock owner) ─────────────────────

/// Local phase of snapshot create: flush under md_lock write so every
/// prior write lands in the old snap context, then register the snapshot.
pub(crate) fn snap_create_local(
    ctx: &Arc<ImageCtx>,
    owner: &OwnerState,
    snap_name: &str,
) -> Result<()> {
    refresh::check(ctx, Some(owner))?;

    let _md = ctx.md_lock.write();
    ctx.flush_writes()?;

    loop {
        match add_snap(ctx, owner, snap_name) {
            // lost the header-lock assertion race; take a fresh view
            Err(Error::Stale) => continue,
            other => return other,
        }
    }
}

fn add_snap(ctx: &Arc<ImageCtx>, owner: &OwnerState, snap_name: &str) -> Result<()> {
    let snap_id = ctx.pool.snap_create()?;

    let (size, parent, lock_supported) = {
        let snap = ctx.snap_lock.read();
        let parent = ctx.parent_lock.read();
        (
            snap.size,
            parent.parent_md.clone(),
            ctx.lock_supported_at(&snap),
        )
    };
    let lock_owner = owner.is_lock_owner();
    debug_assert!(!lock_supported || lock_owner);

    let register = if ctx.format.is_legacy() {
        ctx.meta.legacy_snapshot_add(&ctx.name, snap_id, snap_name)
    } else {
        let record = SnapshotRecord {
            id: snap_id,
            name: snap_name.to_string(),
            size,
            parent,
            protection: ProtectionStatus::Unprotected,
            flags: ImageFlags::empty(),
        };
        let held_cookie = (lock_supported && lock_owner).then_some(owner.cookie.as_str());
        ctx.meta.snapshot_add(&ctx.header_oid, &record, held_cookie)
    };
    if let Err(e) = register {
        warn!(error = %e, "adding snapshot to header failed");
        let _ = ctx.pool.snap_remove(snap_id);
        return Err(e);
    }

    let mut snap = ctx.snap_lock.write();
    if !ctx.format.is_legacy() {
        snap.object_map.snapshot_add(&ctx.pool, &ctx.id, snap_id)?;
    }
    let (size, parent_md) = (snap.size, ctx.parent_lock.read().parent_md.clone());
    snap.add_snap(
        snap_id,
        SnapInfo {
            name: snap_name.to_string(),
            size,
            parent: parent_md,
            protection: ProtectionStatus::Unprotected,
            flags: ImageFlags::empty(),
        },
    );
    if lock_owner {
        // adopt the new snap context immediately; non-owners pick it up
        // on their next refresh
        let mut snaps = vec![snap_id];
        snaps.extend(snap.snapc.snaps.iter().copied());
        snap.snapc.seq = snap_id;
        snap.snapc.snaps = snaps;
    }
    Ok(())
}

/// Local phase of snapshot remove: object-map cleanup, children-set
/// deregistration if this snapshot held the last reference to its parent,
/// header removal, and finally the store-level snapshot id release.
pub(crate) fn snap_remove_local(
    ctx: &Arc<ImageCtx>,
    owner: &OwnerState,
    snap_name: &str,
) -> Result<()> {
    {
        let snap = ctx.snap_lock.read();
        if snap.features.contains(Features::FAST_DIFF) {
            debug_assert!(!ctx.lock_supported_at(&snap) || owner.is_lock_owner());
        }
    }
    refresh::check(ctx, Some(owner))?;

    let _md = ctx.md_lock.read();
    let removed_snap_id;
    {
        let mut snap = ctx.snap_lock.write();
        let snap_id = snap
            .snap_id_by_name(snap_name)
            .ok_or_else(|| Error::not_found(snap_name))?;
        let info = snap
            .snap_info
            .get(&snap_id)
            .ok_or_else(|| Error::not_found(snap_name))?;
        if info.protection.prevents_removal() {
            return Err(Error::Busy(format!("snapshot {snap_name} is protected")));
        }
        let our_parent = info.parent.clone();

        snap.object_map.snapshot_remove(&ctx.pool, &ctx.id, snap_id)?;

        if let Some(our_parent) = our_parent {
            let parent = ctx.parent_lock.read();
            let head_spec = parent.parent_md.as_ref().map(|p| &p.spec);
            if head_spec != Some(&our_parent.spec)
                && !scan_for_parents(&snap, &our_parent.spec, snap_id)
            {
                // last reference to this parent edge: deregister the child
                // from the children set in its own pool
                let children_meta = MetaClient::new(Arc::clone(&ctx.pool));
                match children_meta.remove_child(&our_parent.spec, &ctx.id) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        warn!("child already deregistered from parent");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if ctx.format.is_legacy() {
            ctx.meta.legacy_snapshot_remove(&ctx.name, snap_name)?;
        } else {
            ctx.meta.snapshot_remove(&ctx.header_oid, snap_id)?;
        }
        snap.rm_snap(snap_name, snap_id);
        removed_snap_id = snap_id;
    }

    ctx.pool.snap_remove(removed_snap_id)?;
    Ok(())
}
