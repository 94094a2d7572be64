//! Long-running structural operations: resize, trim, flatten and object
//! map rebuild. All of them run through the invoke-async-request envelope,
//! report progress through a caller-supplied sink, and support restart:
//! an interrupted run rebuilds its size/overlap snapshot from scratch.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, warn};

use blockio_common::{Error, Features, ImageFlags, Result, SnapContext, SnapId, SNAP_HEAD};

use crate::async_op::{interrupted, invoke_async_request, LocalRequest, Throttle};
use crate::image::{ImageCtx, OwnerState};
use crate::metadata::MetaClient;
use crate::object_map::{OBJECT_EXISTS, OBJECT_NONEXISTENT};
use crate::refresh;
use crate::striper::{self, Layout};
use crate::watcher::{self, NotifyMessage};
use crate::{io, object_map_name};

/// Progress reporting for long-running operations. Object-count based for
/// trim/flatten/rollback/rebuild, byte based for copy.
pub trait ProgressSink: Send + Sync {
    fn update(&self, offset: u64, total: u64);
}

/// Sink for callers that do not care
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _offset: u64, _total: u64) {}
}

impl ImageCtx {
    // ── resize ────────────────────────────────────────────────────────────

    /// Grow or shrink the image. Shrinking trims objects past the new tail
    /// before the size is persisted; growing persists the size first and
    /// the new region reads as zero until written.
    pub fn resize(self: &Arc<Self>, size: u64, progress: Arc<dyn ProgressSink>) -> Result<()> {
        debug!(name = %self.name, size, "resize");
        refresh::check(self, None)?;

        let local_progress = Arc::clone(&progress);
        let local: LocalRequest = Arc::new(move |ctx, owner, cancel| {
            resize_local(ctx, owner, cancel, size, local_progress.as_ref())
        });
        let result = invoke_async_request(self, "resize", false, local, &|| {
            watcher::remote_request(self, NotifyMessage::Resize { size })
        });

        watcher::notify_header_update(self);
        result
    }

    // ── flatten ───────────────────────────────────────────────────────────

    /// Copy every parent-backed object into this image and sever the
    /// parent edge. Idempotent: a second flatten reports that the image
    /// has no parent.
    pub fn flatten(self: &Arc<Self>, progress: Arc<dyn ProgressSink>) -> Result<()> {
        debug!(name = %self.name, "flatten");
        refresh::check(self, None)?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        {
            let parent = self.parent_lock.read();
            if parent.parent_md.is_none() {
                return Err(Error::invalid("image has no parent"));
            }
        }

        let local_progress = Arc::clone(&progress);
        let local: LocalRequest = Arc::new(move |ctx, owner, cancel| {
            flatten_local(ctx, owner, cancel, local_progress.as_ref())
        });
        let result = invoke_async_request(self, "flatten", false, local, &|| {
            watcher::remote_request(self, NotifyMessage::Flatten)
        });
        // a racing flatten finishing first still leaves the image flat
        if let Err(e) = result {
            if !matches!(e, Error::Invalid(_)) {
                return Err(e);
            }
        }

        watcher::notify_header_update(self);
        Ok(())
    }

    // ── object map rebuild ────────────────────────────────────────────────

    /// Walk every object of the head and each snapshot, write fresh map
    /// objects, and clear the invalid flags.
    pub fn rebuild_object_map(
        self: &Arc<Self>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        debug!(name = %self.name, "rebuild object map");
        refresh::check(self, None)?;

        let local_progress = Arc::clone(&progress);
        let local: LocalRequest = Arc::new(move |ctx, owner, cancel| {
            rebuild_object_map_local(ctx, owner, cancel, local_progress.as_ref())
        });
        let result = invoke_async_request(self, "rebuild object map", true, local, &|| {
            watcher::remote_request(self, NotifyMessage::RebuildObjectMap)
        });
        if result.is_err() {
            watcher::notify_header_update(self);
        }
        result
    }
}

// ── local execution bodies ────────────────────────────────────────────────

pub(crate) fn resize_local(
    ctx: &Arc<ImageCtx>,
    owner: &OwnerState,
    cancel: &AtomicBool,
    size: u64,
    progress: &dyn ProgressSink,
) -> Result<()> {
    refresh::check(ctx, Some(owner))?;

    let old_size = {
        let snap = ctx.snap_lock.read();
        if !snap.at_head() || ctx.read_only {
            return Err(Error::ReadOnly);
        }
        snap.size
    };

    if size == old_size {
        // no data-object traffic for a no-op resize
        progress.update(size, size);
        return Ok(());
    }

    if size < old_size {
        debug!(old_size, size, "trimming image");
        trim_objects(ctx, cancel, old_size, size, progress)?;
    }

    if ctx.format.is_legacy() {
        ctx.meta.set_legacy_size(&ctx.name, size)?;
    } else {
        ctx.meta.set_size(&ctx.header_oid, size)?;
        shrink_parent_overlap(ctx, size)?;
    }

    {
        let mut snap = ctx.snap_lock.write();
        snap.size = size;
        let num_objects = striper::num_objects(&snap.layout(), size);
        snap.object_map.resize(num_objects);
        snap.object_map.save(&ctx.pool, &ctx.id, SNAP_HEAD)?;
    }
    progress.update(size, size);
    Ok(())
}

/// The parent overlap can never exceed the child size: shrinking past it
/// permanently gives up the out-of-range parent data.
fn shrink_parent_overlap(ctx: &Arc<ImageCtx>, size: u64) -> Result<()> {
    let clamped = {
        let parent = ctx.parent_lock.read();
        match parent.parent_md.as_ref() {
            Some(info) if info.overlap > size => Some(blockio_common::ParentInfo {
                spec: info.spec.clone(),
                overlap: size,
            }),
            _ => None,
        }
    };
    if let Some(info) = clamped {
        ctx.meta.set_parent(&ctx.header_oid, &info)?;
        ctx.parent_lock.write().parent_md = Some(info);
    }
    Ok(())
}

/// Remove every object past the new tail and clean the boundary object.
/// Concurrency is bounded by `concurrent_management_ops`; NOT_FOUND on an
/// individual object is expected (sparse image) and swallowed.
pub(crate) fn trim_objects(
    ctx: &Arc<ImageCtx>,
    cancel: &AtomicBool,
    old_size: u64,
    new_size: u64,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let (layout, snapc, delete_start, num_old, oids) = {
        let snap = ctx.snap_lock.read();
        let layout = snap.layout();
        let delete_start = striper::num_objects(&layout, new_size);
        let num_old = striper::num_objects(&layout, old_size);
        let oids: Vec<String> = (delete_start..num_old)
            .map(|i| ctx.object_name(&snap, i))
            .collect();
        (layout, snap.snapc.clone(), delete_start, num_old, oids)
    };

    let total = num_old.saturating_sub(delete_start).max(1) * layout.object_size;
    let throttle = Throttle::new(ctx.config.concurrent_management_ops);
    let mut scope_result = Ok(());
    std::thread::scope(|scope| {
        for (i, oid) in oids.iter().enumerate() {
            if let Err(e) = interrupted(cancel) {
                scope_result = Err(e);
                break;
            }
            throttle.start_op();
            if throttle.pending_error() {
                throttle.end_op(Ok(()));
                break;
            }
            let worker_throttle = Arc::clone(&throttle);
            let pool = Arc::clone(&ctx.pool);
            let snapc = snapc.clone();
            scope.spawn(move || {
                let result = match pool.remove(oid, &snapc) {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(e),
                };
                worker_throttle.end_op(result);
            });
            progress.update(i as u64 * layout.object_size, total);
        }
    });
    throttle.wait_for_all()?;
    scope_result?;

    clean_boundary(ctx, &layout, &snapc, old_size, new_size, delete_start)?;

    {
        let mut snap = ctx.snap_lock.write();
        for object_no in delete_start..num_old {
            snap.object_map.set(object_no, OBJECT_NONEXISTENT);
        }
    }
    progress.update(total, total);
    Ok(())
}

/// The partial boundary object: truncate its tail in the canonical layout,
/// zero the affected stripe-unit fragments when striping interleaves them.
fn clean_boundary(
    ctx: &Arc<ImageCtx>,
    layout: &Layout,
    snapc: &SnapContext,
    old_size: u64,
    new_size: u64,
    delete_start: u64,
) -> Result<()> {
    let boundary_end = old_size.min(new_size.div_ceil(layout.period()) * layout.period());
    if new_size >= boundary_end {
        return Ok(());
    }
    let fragments = striper::file_to_extents(layout, new_size, boundary_end - new_size);
    for frag in fragments {
        if frag.object_no >= delete_start {
            continue; // object already removed outright
        }
        let oid = {
            let snap = ctx.snap_lock.read();
            ctx.object_name(&snap, frag.object_no)
        };
        let result = if layout.stripe_count == 1 {
            ctx.pool.truncate(&oid, frag.offset, snapc)
        } else {
            ctx.pool.zero(&oid, frag.offset, frag.length, snapc)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub(crate) fn flatten_local(
    ctx: &Arc<ImageCtx>,
    owner: &OwnerState,
    cancel: &AtomicBool,
    progress: &dyn ProgressSink,
) -> Result<()> {
    refresh::check(ctx, Some(owner))?;

    let (snapc, overlap_objects, oids) = {
        let snap = ctx.snap_lock.read();
        let parent = ctx.parent_lock.read();
        if ctx.read_only || !snap.at_head() {
            return Err(Error::ReadOnly);
        }
        let Some(info) = parent.parent_md.as_ref() else {
            return Err(Error::invalid("image has no parent"));
        };
        let overlap = info.overlap.min(snap.size);
        let layout = snap.layout();
        let overlap_objects = striper::num_objects(&layout, overlap);
        let oids: Vec<String> = (0..overlap_objects)
            .map(|i| ctx.object_name(&snap, i))
            .collect();
        (snap.snapc.clone(), overlap_objects, oids)
    };

    for (object_no, oid) in oids.iter().enumerate() {
        interrupted(cancel)?;
        io::copyup_object(ctx, object_no as u64, oid, &snapc)?;
        progress.update(object_no as u64, overlap_objects);
    }

    // all data is local now: clear the parent edge and deregister from the
    // children set
    let spec = {
        let parent = ctx.parent_lock.read();
        match parent.parent_md.as_ref() {
            Some(info) => info.spec.clone(),
            None => return Err(Error::invalid("image has no parent")),
        }
    };
    ctx.meta.remove_parent(&ctx.header_oid)?;
    // the children set is kept in the child's own pool
    let children_meta = MetaClient::new(Arc::clone(&ctx.pool));
    match children_meta.remove_child(&spec, &ctx.id) {
        Ok(()) => {}
        Err(e) if e.is_not_found() => warn!("child already deregistered"),
        Err(e) => return Err(e),
    }

    {
        let cache = ctx.cache_lock.lock();
        let mut snap = ctx.snap_lock.write();
        let mut parent = ctx.parent_lock.write();
        parent.parent_md = None;
        refresh::refresh_parent(ctx, &cache, &mut snap, &mut parent)?;
    }
    progress.update(overlap_objects, overlap_objects);
    Ok(())
}

pub(crate) fn rebuild_object_map_local(
    ctx: &Arc<ImageCtx>,
    owner: &OwnerState,
    cancel: &AtomicBool,
    progress: &dyn ProgressSink,
) -> Result<()> {
    if ctx.read_only {
        return Err(Error::ReadOnly);
    }
    refresh::check(ctx, Some(owner))?;

    let (views, layout) = {
        let snap = ctx.snap_lock.read();
        if !snap.features.contains(Features::OBJECT_MAP) {
            return Err(Error::invalid("object map is not enabled"));
        }
        let mut views: Vec<(SnapId, u64)> = vec![(SNAP_HEAD, snap.size)];
        for (&id, info) in &snap.snap_info {
            views.push((id, info.size));
        }
        (views, snap.layout())
    };

    let total_objects: u64 = views
        .iter()
        .map(|&(_, size)| striper::num_objects(&layout, size))
        .sum();
    let mut done = 0u64;

    for &(view, size) in &views {
        let num_objects = striper::num_objects(&layout, size);
        let mut states = vec![OBJECT_NONEXISTENT; num_objects as usize];
        for object_no in 0..num_objects {
            interrupted(cancel)?;
            let oid = {
                let snap = ctx.snap_lock.read();
                ctx.object_name(&snap, object_no)
            };
            if ctx.pool.exists(&oid, view)? {
                states[object_no as usize] = OBJECT_EXISTS;
            }
            done += 1;
            progress.update(done, total_objects);
        }
        ctx.pool.write_full(
            &object_map_name(&ctx.id, view),
            &states,
            &SnapContext::default(),
        )?;
    }

    // the maps are trustworthy again
    let fast_diff = {
        let snap = ctx.snap_lock.read();
        snap.features.contains(Features::FAST_DIFF)
    };
    let mut mask = ImageFlags::OBJECT_MAP_INVALID;
    if fast_diff {
        mask |= ImageFlags::FAST_DIFF_INVALID;
    }
    for &(view, _) in &views {
        ctx.meta
            .set_flags(&ctx.header_oid, view, ImageFlags::empty(), mask)?;
    }

    {
        let mut snap = ctx.snap_lock.write();
        snap.flags -= mask;
        for info in snap.snap_info.values_mut() {
            info.flags -= mask;
        }
        let sel = snap.snap_id;
        let size = snap.size_at(sel)?;
        let num_objects = striper::num_objects(&snap.layout(), size);
        snap.object_map
            .refresh(&ctx.pool, &ctx.id, sel, num_objects, true)?;
    }
    progress.update(total_objects, total_objects.max(1));
    Ok(())
}
