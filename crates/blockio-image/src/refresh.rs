//! Reconciles an image context with persisted metadata.
//!
//! Every external notification bumps `refresh_seq`; operations that read
//! mutable metadata call [`check`] first and only pay for a full
//! [`refresh`] when the counters disagree. The sequence value is sampled
//! *before* reading persisted state, so a notification racing the refresh
//! forces another pass.

use std::sync::Arc;

use tracing::{debug, warn};

use blockio_common::{
    Error, Features, ImageFlags, LockMode, ProtectionStatus, Result, SnapContext,
};
use blockio_store::ObjectCache;

use crate::image::{self, ImageCtx, OwnerState, ParentState, SnapInfo, SnapState};
use crate::striper;
use crate::LOCK_NAME;

/// Ensure the context has observed `last_refresh == refresh_seq`. Pass the
/// held owner-lock state when the caller already read-holds it.
pub(crate) fn check(ctx: &Arc<ImageCtx>, owner: Option<&OwnerState>) -> Result<()> {
    let needs_refresh = {
        let counters = ctx.refresh_lock.lock();
        counters.last_refresh != counters.refresh_seq
    };
    if !needs_refresh {
        return Ok(());
    }
    match owner {
        Some(owner) => refresh(ctx, owner),
        None => {
            let guard = ctx.owner_lock.read();
            refresh(ctx, &guard)
        }
    }
}

/// Full reconciliation pass; caller read-holds owner_lock.
pub(crate) fn refresh(ctx: &Arc<ImageCtx>, _owner: &OwnerState) -> Result<()> {
    let _md = ctx.md_lock.write();
    let refresh_seq = ctx.refresh_lock.lock().refresh_seq;
    debug!(name = %ctx.name, refresh_seq, "refreshing image metadata");

    let mut new_snap_appeared = false;
    {
        let cache = ctx.cache_lock.lock();
        let mut snap = ctx.snap_lock.write();
        let new_snapc: SnapContext;
        {
            let mut parent = ctx.parent_lock.write();
            snap.lockers.clear();

            if ctx.format.is_legacy() {
                new_snapc = refresh_legacy(ctx, &mut snap, &mut new_snap_appeared)?;
                parent.parent_md = None;
            } else {
                new_snapc = refresh_modern(ctx, &mut snap, &mut parent, &mut new_snap_appeared)?;
            }

            refresh_parent(ctx, &cache, &mut snap, &mut parent)?;
        }

        if !new_snapc.is_valid() {
            return Err(Error::corrupt("image snap context is invalid"));
        }
        snap.snapc = new_snapc;

        if !snap.at_head() && snap.snap_id_by_name(&snap.snap_name) != Some(snap.snap_id) {
            warn!(
                snap = %snap.snap_name,
                "selected snapshot no longer exists"
            );
            snap.snap_exists = false;
        }

        let sel = snap.snap_id;
        let size = if snap.snap_exists {
            snap.size_at(sel)?
        } else {
            0
        };
        let num_objects = striper::num_objects(&snap.layout(), size);
        // an invalidated map must not short-circuit I/O until it is rebuilt
        let sel_flags = if snap.at_head() {
            snap.flags
        } else {
            snap.snap_info
                .get(&sel)
                .map(|info| info.flags)
                .unwrap_or_default()
        };
        let map_on = snap.features.contains(Features::OBJECT_MAP)
            && snap.snap_exists
            && !sel_flags.contains(ImageFlags::OBJECT_MAP_INVALID);
        snap.object_map
            .refresh(&ctx.pool, &ctx.id, sel, num_objects, map_on)?;
    }

    if new_snap_appeared {
        // outstanding writes must be attributed to the previous snap context
        ctx.flush_writes()?;
    }

    ctx.refresh_lock.lock().last_refresh = refresh_seq;
    Ok(())
}

fn refresh_legacy(
    ctx: &Arc<ImageCtx>,
    snap: &mut SnapState,
    new_snap_appeared: &mut bool,
) -> Result<SnapContext> {
    let header = ctx.meta.read_legacy_header(&ctx.name)?;

    let lock_info = ctx.pool.lock_info(&ctx.header_oid, LOCK_NAME)?;
    snap.lockers = lock_info.lockers;
    snap.exclusive_locked = matches!(lock_info.mode, Some(LockMode::Exclusive));
    snap.lock_tag = lock_info.tag;

    snap.order = header.order;
    snap.size = header.image_size;
    snap.object_prefix = header.block_name.clone();
    snap.stripe_unit = 0;
    snap.stripe_count = 0;
    // no feature bits, no flags, no parent in the legacy layout
    snap.features = Features::empty();
    snap.flags = ImageFlags::empty();

    for s in &header.snaps {
        if !snap.snap_info.contains_key(&s.id) {
            *new_snap_appeared = true;
        }
    }
    snap.snap_info.clear();
    snap.snap_ids.clear();
    for s in &header.snaps {
        snap.add_snap(
            s.id,
            SnapInfo {
                name: s.name.clone(),
                size: s.image_size,
                parent: None,
                protection: ProtectionStatus::Unprotected,
                flags: ImageFlags::empty(),
            },
        );
    }
    Ok(header.snap_context())
}

fn refresh_modern(
    ctx: &Arc<ImageCtx>,
    snap: &mut SnapState,
    parent: &mut ParentState,
    new_snap_appeared: &mut bool,
) -> Result<SnapContext> {
    let (mm, head_flags, snap_flags, records) = loop {
        let mm = ctx.meta.get_mutable_metadata(&ctx.header_oid)?;

        let unsupported = mm.raw_features & !Features::all().bits();
        if unsupported != 0 {
            warn!(unsupported, "image uses unsupported features");
            return Err(Error::IncompatibleFeatures(unsupported));
        }

        let (head_flags, snap_flags) = match ctx.meta.get_flags(&ctx.header_oid, &mm.snapc.snaps)
        {
            Ok(flags) => flags,
            Err(Error::Unsupported(_)) => {
                // store predates per-image flags; assume the worst
                let mut flags = ImageFlags::OBJECT_MAP_INVALID;
                if mm.features.contains(Features::FAST_DIFF) {
                    flags |= ImageFlags::FAST_DIFF_INVALID;
                }
                (flags, vec![flags; mm.snapc.snaps.len()])
            }
            Err(e) if e.is_not_found() => {
                debug!("snapshot vanished while reading flags; restarting");
                continue;
            }
            Err(e) => return Err(e),
        };

        match ctx.meta.snapshot_list(&ctx.header_oid, &mm.snapc.snaps) {
            Ok(records) => break (mm, head_flags, snap_flags, records),
            Err(e) if e.is_not_found() => {
                debug!("snapshot vanished while listing; restarting");
                continue;
            }
            Err(e) => return Err(e),
        }
    };

    snap.order = ctx.meta.get_order(&ctx.header_oid)?;
    snap.object_prefix = ctx.meta.get_object_prefix(&ctx.header_oid)?;
    let (stripe_unit, stripe_count) = ctx.meta.get_stripe_params(&ctx.header_oid)?;
    snap.stripe_unit = stripe_unit;
    snap.stripe_count = stripe_count;

    snap.size = mm.size;
    snap.features = mm.features;
    snap.flags = head_flags;
    snap.lockers = mm.lockers;
    snap.exclusive_locked = mm.exclusive_locked;
    snap.lock_tag = mm.lock_tag;

    for &id in &mm.snapc.snaps {
        if !snap.snap_info.contains_key(&id) {
            debug!(snap_id = id, "new snapshot appeared");
            *new_snap_appeared = true;
        }
    }
    snap.snap_info.clear();
    snap.snap_ids.clear();
    for (record, flags) in records.iter().zip(snap_flags) {
        snap.add_snap(
            record.id,
            SnapInfo {
                name: record.name.clone(),
                size: record.size,
                parent: record.parent.clone(),
                protection: record.protection,
                flags,
            },
        );
    }
    parent.parent_md = mm.parent.clone();
    Ok(mm.snapc)
}

/// Reconcile the open parent context with the current parent edge: close a
/// stale one, open a missing one (read-only, selected at the referenced
/// snapshot, recursively refreshed).
pub(crate) fn refresh_parent(
    ctx: &Arc<ImageCtx>,
    _cache: &Option<Arc<dyn ObjectCache>>,
    snap: &mut SnapState,
    parent: &mut ParentState,
) -> Result<()> {
    let effective = image::parent_info_at(snap, parent, snap.snap_id);

    if let Some(open) = parent.parent.clone() {
        let stale = match &effective {
            None => true,
            Some(info) => {
                info.overlap == 0
                    || open.pool.id() != info.spec.pool_id
                    || open.id != info.spec.image_id
                    || open.snap_lock.read().snap_id != info.spec.snap_id
            }
        };
        if stale {
            debug!("parent edge changed; closing parent context");
            parent.parent = None;
            if let Err(e) = open.close() {
                warn!(error = %e, "error closing stale parent");
            }
        }
    }

    if let Some(info) = effective {
        if info.spec.pool_id >= 0 && info.overlap > 0 && parent.parent.is_none() {
            let parent_ctx = ImageCtx::open_by_id(
                &ctx.cluster,
                info.spec.pool_id,
                &info.spec.image_id,
                true,
                ctx.config.clone(),
            )?;
            if let Err(e) = parent_ctx.snap_set_by_id(info.spec.snap_id) {
                warn!(error = %e, "parent snapshot does not exist");
                let _ = parent_ctx.close();
                return Err(e);
            }
            parent.parent = Some(parent_ctx);
        }
    }
    Ok(())
}
