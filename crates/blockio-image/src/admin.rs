//! Administrative operations: image create/remove/rename/clone/copy,
//! listings, format detection, feature toggling, user metadata and the
//! user-facing advisory locks.
//!
//! Multi-step creation paths register compensation actions as they go and
//! run them in reverse order when a later step fails, so a failed create
//! or clone leaves no debris behind.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, info, warn};

use blockio_common::{
    ClientConfig, Error, Features, ImageFlags, ImageFormat, LockMode, Locker, ParentInfo,
    ParentSpec, PoolId, Result, SnapContext, SNAP_HEAD,
};
use blockio_store::Cluster;

use crate::async_op::Throttle;
use crate::exclusive_lock;
use crate::image::ImageCtx;
use crate::legacy::LegacyHeader;
use crate::maintenance::{self, ProgressSink};
use crate::metadata::MetaClient;
use crate::object_map::ObjectMapCache;
use crate::refresh;
use crate::striper::{self, Layout};
use crate::watcher;
use crate::{
    header_name, id_obj_name, legacy_header_name, object_map_name, LOCK_NAME,
};

/// Compensation actions registered in reverse order of the steps they undo;
/// disarmed on success, executed newest-first on failure.
struct Compensations {
    actions: Vec<Box<dyn FnOnce()>>,
    armed: bool,
}

impl Compensations {
    fn new() -> Self {
        Self {
            actions: Vec::new(),
            armed: true,
        }
    }

    fn push(&mut self, action: impl FnOnce() + 'static) {
        self.actions.push(Box::new(action));
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Compensations {
    fn drop(&mut self) {
        if self.armed {
            for action in self.actions.drain(..).rev() {
                action();
            }
        }
    }
}

// ── format detection ──────────────────────────────────────────────────────

/// Probe which format an image was created with; `None` if it does not
/// exist in either.
pub fn detect_format(
    cluster: &Arc<dyn Cluster>,
    pool_id: PoolId,
    name: &str,
) -> Result<Option<ImageFormat>> {
    let meta = MetaClient::new(cluster.pool(pool_id)?);
    detect_format_on(&meta, name)
}

pub(crate) fn detect_format_on(meta: &MetaClient, name: &str) -> Result<Option<ImageFormat>> {
    match meta.pool().stat(&legacy_header_name(name)) {
        Ok(_) => Ok(Some(ImageFormat::Legacy)),
        Err(e) if e.is_not_found() => match meta.pool().stat(&id_obj_name(name)) {
            Ok(_) => Ok(Some(ImageFormat::Modern)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    }
}

// ── create ────────────────────────────────────────────────────────────────

/// Options for [`create`]; unset fields fall back to the client config.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub format: Option<ImageFormat>,
    /// 0 selects the configured default
    pub order: u8,
    pub features: Option<Features>,
    pub stripe_unit: u64,
    pub stripe_count: u64,
}

/// Create a new image.
pub fn create(
    cluster: &Arc<dyn Cluster>,
    pool_id: PoolId,
    name: &str,
    size: u64,
    opts: &CreateOptions,
    config: &ClientConfig,
) -> Result<()> {
    let pool = cluster.pool(pool_id)?;
    let meta = MetaClient::new(Arc::clone(&pool));

    let format = opts.format.unwrap_or(if config.default_format == 1 {
        ImageFormat::Legacy
    } else {
        ImageFormat::Modern
    });
    let features = match format {
        ImageFormat::Legacy => Features::empty(),
        ImageFormat::Modern => opts.features.unwrap_or(config.default_features),
    };
    debug!(
        name, size, ?format, ?features,
        stripe_unit = opts.stripe_unit,
        stripe_count = opts.stripe_count,
        "creating image"
    );

    // refuse to shadow an image in either format
    if detect_format_on(&meta, name)?.is_some() {
        return Err(Error::AlreadyExists(name.to_string()));
    }

    let mut order = opts.order;
    if order == 0 {
        order = config.default_order;
    }
    ClientConfig::check_order(order).map_err(Error::Invalid)?;

    let mut stripe_unit = opts.stripe_unit;
    let mut stripe_count = opts.stripe_count;
    if format == ImageFormat::Modern
        && features.contains(Features::STRIPING_V2)
        && stripe_unit == 0
        && stripe_count == 0
    {
        stripe_unit = config.default_stripe_unit;
        stripe_count = config.default_stripe_count;
    }
    // normalize the canonical no-striping case
    if stripe_unit == (1u64 << order) && stripe_count == 1 {
        stripe_unit = 0;
        stripe_count = 0;
    }
    if (stripe_unit != 0 || stripe_count != 0)
        && !features.contains(Features::STRIPING_V2)
    {
        return Err(Error::invalid(
            "non-default striping requires the striping feature and the modern format",
        ));
    }
    if (stripe_unit != 0) != (stripe_count != 0) {
        return Err(Error::invalid(
            "stripe unit and stripe count must be set together",
        ));
    }

    let bid = cluster.instance_id();
    match format {
        ImageFormat::Legacy => {
            if stripe_unit != 0 && stripe_unit != (1u64 << order) {
                return Err(Error::invalid("legacy images cannot stripe"));
            }
            if stripe_count != 0 && stripe_count != 1 {
                return Err(Error::invalid("legacy images cannot stripe"));
            }
            create_legacy(&meta, name, bid, size, order)
        }
        ImageFormat::Modern => create_modern(
            &meta, name, bid, size, order, features, stripe_unit, stripe_count,
        ),
    }
}

fn create_legacy(meta: &MetaClient, name: &str, bid: u64, size: u64, order: u8) -> Result<()> {
    debug!("adding image to legacy directory");
    meta.legacy_dir_add(name)?;

    let extra: u32 = rand::random();
    let block_name = format!("blk.{bid:x}.{extra:x}");
    let header = LegacyHeader::new(block_name, size, order);
    if let Err(e) = meta.write_legacy_header(name, &header) {
        warn!(error = %e, "error writing legacy image header");
        if let Err(cleanup) = meta.legacy_dir_remove(name) {
            warn!(error = %cleanup, "could not remove directory entry after failed create");
        }
        return Err(e);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn create_modern(
    meta: &MetaClient,
    name: &str,
    bid: u64,
    size: u64,
    order: u8,
    features: Features,
    stripe_unit: u64,
    stripe_count: u64,
) -> Result<()> {
    let mut comp = Compensations::new();

    let id_oid = id_obj_name(name);
    meta.pool().create_exclusive(&id_oid)?;
    {
        let meta = MetaClient::new(Arc::clone(meta.pool()));
        let id_oid = id_oid.clone();
        comp.push(move || {
            if let Err(e) = meta.remove_ignore_missing(&id_oid) {
                warn!(error = %e, "could not clean up id object after failed create");
            }
        });
    }

    let extra: u32 = rand::random();
    let id = format!("{bid:x}{extra:x}");
    meta.set_id(&id_oid, &id)?;

    debug!("adding image to directory");
    meta.dir_add_image(name, &id)?;
    {
        let meta = MetaClient::new(Arc::clone(meta.pool()));
        let (name, id) = (name.to_string(), id.clone());
        comp.push(move || {
            if let Err(e) = meta.dir_remove_image(&name, &id) {
                warn!(error = %e, "could not clean up directory entry after failed create");
            }
        });
    }

    let header_oid = header_name(&id);
    let object_prefix = ImageCtx::data_prefix_for(&id);
    meta.create_image(&header_oid, size, order, features, &object_prefix)?;
    {
        let meta = MetaClient::new(Arc::clone(meta.pool()));
        let header_oid = header_oid.clone();
        comp.push(move || {
            if let Err(e) = meta.remove_ignore_missing(&header_oid) {
                warn!(error = %e, "could not clean up header after failed create");
            }
        });
    }

    if (stripe_unit != 0 || stripe_count != 0)
        && (stripe_count != 1 || stripe_unit != (1u64 << order))
    {
        meta.set_stripe_params(&header_oid, stripe_unit, stripe_count)?;
    }

    features
        .validate()
        .map_err(|msg| Error::invalid(msg.to_string()))?;

    if features.contains(Features::OBJECT_MAP) {
        let layout = Layout::new(order, stripe_unit, stripe_count);
        let num_objects = striper::num_objects(&layout, size);
        ObjectMapCache::initialize(meta.pool(), &id, num_objects)?;
    }

    comp.disarm();
    info!(name, id, "image created");
    Ok(())
}

// ── remove ────────────────────────────────────────────────────────────────

/// Remove an image. Fails while another client holds the lock, the image
/// has snapshots, or other watchers are attached.
pub fn remove(
    cluster: &Arc<dyn Cluster>,
    pool_id: PoolId,
    name: &str,
    progress: Arc<dyn ProgressSink>,
    config: &ClientConfig,
) -> Result<()> {
    debug!(name, "removing image");
    let pool = cluster.pool(pool_id)?;
    let meta = MetaClient::new(Arc::clone(&pool));

    let mut id = String::new();
    let mut old_format = false;
    let mut unknown_format = true;

    match ImageCtx::open(cluster, pool_id, name, None, false, config.clone()) {
        Err(e) => {
            debug!(error = %e, "error opening image for removal");
        }
        Ok(ctx) => {
            let header_oid = ctx.header_oid.clone();
            old_format = ctx.format.is_legacy();
            unknown_format = false;
            id = ctx.id.clone();

            if ctx.lock_supported() {
                let acquired = exclusive_lock::prepare_image_update(&ctx)
                    .map(|()| ctx.is_exclusive_lock_owner())
                    .unwrap_or(false);
                if !acquired {
                    warn!("cannot obtain exclusive lock - not removing");
                    let _ = ctx.close();
                    return Err(Error::Busy("image is locked by another client".into()));
                }
            }

            {
                let snap = ctx.snap_lock.read();
                if !snap.snap_info.is_empty() {
                    warn!("image has snapshots - not removing");
                    drop(snap);
                    let _ = ctx.close();
                    return Err(Error::Busy("image has snapshots".into()));
                }
            }

            let watchers = match pool.list_watchers(&header_oid) {
                Ok(watchers) => watchers,
                Err(e) => {
                    let _ = ctx.close();
                    return Err(e);
                }
            };
            if watchers.len() > 1 {
                warn!("image has watchers - not removing");
                let _ = ctx.close();
                return Err(Error::Busy("image is open by another client".into()));
            }

            // delete the data objects; stragglers are a warning, not a
            // failure, as long as the metadata comes off cleanly
            {
                let _owner = ctx.owner_lock.read();
                let size = ctx.snap_lock.read().size;
                let no_cancel = AtomicBool::new(false);
                if let Err(e) =
                    maintenance::trim_objects(&ctx, &no_cancel, size, 0, progress.as_ref())
                {
                    warn!(error = %e, "failed to remove some data objects");
                }
            }

            let parent_info = ctx.parent_lock.read().parent_md.clone();
            if let Some(ParentInfo { spec, .. }) = parent_info {
                // children entries live in the child's own pool
                let children_meta = MetaClient::new(Arc::clone(&pool));
                match children_meta.remove_child(&spec, &id) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(error = %e, "error removing child from children list");
                        let _ = ctx.close();
                        return Err(e);
                    }
                }
            }

            let _ = ctx.close();

            debug!("removing header");
            match pool.remove(&header_oid, &SnapContext::default()) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
    }

    if old_format || unknown_format {
        debug!("removing image from legacy directory");
        // the legacy directory entry is cleared before the id-object
        // removal below gets a chance to fail; this ordering is load-bearing
        // for half-removed images
        let r = meta.legacy_dir_remove(name);
        old_format = r.is_ok();
        if let Err(e) = r {
            if !unknown_format {
                return Err(e);
            }
        }
    }

    if !old_format {
        if let Err(e) = meta.remove_ignore_missing(&object_map_name(&id, SNAP_HEAD)) {
            warn!(error = %e, "error removing image object map");
        }

        debug!("removing id object");
        match pool.remove(&id_obj_name(name), &SnapContext::default()) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        match meta.dir_get_id(name) {
            Ok(dir_id) => id = dir_id,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        debug!("removing image from directory");
        meta.dir_remove_image(name, &id)?;
    }

    info!(name, "image removed");
    Ok(())
}

// ── rename ────────────────────────────────────────────────────────────────

/// Rename an image. The source's id/header object is copied to the new
/// name, the directory is updated, then the source object removed.
pub fn rename(
    cluster: &Arc<dyn Cluster>,
    pool_id: PoolId,
    src: &str,
    dst: &str,
) -> Result<()> {
    debug!(src, dst, "renaming image");
    let pool = cluster.pool(pool_id)?;
    let meta = MetaClient::new(Arc::clone(&pool));

    let format = detect_format_on(&meta, src)?.ok_or_else(|| Error::not_found(src))?;
    if detect_format_on(&meta, dst)?.is_some() {
        return Err(Error::AlreadyExists(dst.to_string()));
    }

    let (src_oid, dst_oid) = match format {
        ImageFormat::Legacy => (legacy_header_name(src), legacy_header_name(dst)),
        ImageFormat::Modern => (id_obj_name(src), id_obj_name(dst)),
    };
    let id = match format {
        ImageFormat::Legacy => String::new(),
        ImageFormat::Modern => meta.get_id(&src_oid)?,
    };

    // copy object data plus omap entries to the destination name
    let src_size = pool.stat(&src_oid)?;
    let data = pool.read(&src_oid, 0, src_size.max(1), SNAP_HEAD)?;
    let omap_values = pool.omap_list(&src_oid, "", 0)?;

    pool.create_exclusive(&dst_oid)?;
    pool.write_full(&dst_oid, &data, &SnapContext::default())?;
    if !omap_values.is_empty() {
        pool.omap_set(&dst_oid, &omap_values)?;
    }

    match format {
        ImageFormat::Legacy => {
            if let Err(e) = meta.legacy_dir_add(dst) {
                let _ = pool.remove(&dst_oid, &SnapContext::default());
                warn!(error = %e, "could not add new name to directory");
                return Err(e);
            }
            if let Err(e) = meta.legacy_dir_remove(src) {
                warn!(error = %e, "could not remove old entry from directory");
            }
        }
        ImageFormat::Modern => {
            meta.dir_rename_image(src, dst, &id)?;
        }
    }

    match pool.remove(&src_oid, &SnapContext::default()) {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(error = %e, "could not remove old source object"),
    }

    if format.is_legacy() {
        // watchers of the legacy header learn about the new name; modern
        // watchers historically get nothing here
        watcher::notify_header_update_oid(&pool, &legacy_header_name(src));
    }
    Ok(())
}

// ── clone ─────────────────────────────────────────────────────────────────

/// Create a copy-on-write child of a protected parent snapshot, possibly
/// in another pool.
#[allow(clippy::too_many_arguments)]
pub fn clone(
    cluster: &Arc<dyn Cluster>,
    parent_pool_id: PoolId,
    parent_name: &str,
    parent_snap_name: &str,
    child_pool_id: PoolId,
    child_name: &str,
    opts: &CreateOptions,
    config: &ClientConfig,
) -> Result<()> {
    debug!(
        parent_name,
        parent_snap_name, child_name, "cloning parent snapshot"
    );
    let features = opts.features.unwrap_or(config.default_features);

    let child_pool = cluster.pool(child_pool_id)?;
    let child_meta = MetaClient::new(Arc::clone(&child_pool));
    if detect_format_on(&child_meta, child_name)?.is_some() {
        return Err(Error::AlreadyExists(child_name.to_string()));
    }
    if parent_snap_name.is_empty() {
        return Err(Error::invalid("image to be cloned must be a snapshot"));
    }

    // make sure the parent snapshot exists
    let parent_ctx = ImageCtx::open(
        cluster,
        parent_pool_id,
        parent_name,
        Some(parent_snap_name),
        true,
        config.clone(),
    )?;
    let mut comp = Compensations::new();
    {
        let parent_ctx = Arc::clone(&parent_ctx);
        comp.push(move || {
            let _ = parent_ctx.close();
        });
    }

    if parent_ctx.format.is_legacy() {
        return Err(Error::invalid("parent image must be in new format"));
    }

    let (parent_features, size, snap_protected, parent_snap_id) = {
        let snap = parent_ctx.snap_lock.read();
        let snap_id = snap.snap_id;
        let protected = snap
            .snap_info
            .get(&snap_id)
            .map(|info| info.protection.prevents_removal())
            .unwrap_or(false);
        (snap.features, snap.size_at(snap_id)?, protected, snap_id)
    };
    let spec = ParentSpec::new(parent_pool_id, parent_ctx.id.clone(), parent_snap_id);

    if !parent_features.contains(Features::LAYERING) {
        return Err(Error::Unsupported("parent image must support layering".into()));
    }
    if !snap_protected {
        return Err(Error::invalid("parent snapshot must be protected"));
    }

    let order = if opts.order == 0 {
        parent_ctx.snap_lock.read().order
    } else {
        opts.order
    };
    let create_opts = CreateOptions {
        format: Some(ImageFormat::Modern),
        order,
        features: Some(features),
        stripe_unit: opts.stripe_unit,
        stripe_count: opts.stripe_count,
    };
    create(cluster, child_pool_id, child_name, size, &create_opts, config)?;
    {
        let cluster = Arc::clone(cluster);
        let (child_name, config) = (child_name.to_string(), config.clone());
        comp.push(move || {
            if let Err(e) = remove(
                &cluster,
                child_pool_id,
                &child_name,
                Arc::new(maintenance::NoProgress),
                &config,
            ) {
                warn!(error = %e, "error removing failed clone");
            }
        });
    }

    let child_ctx = ImageCtx::open(cluster, child_pool_id, child_name, None, false, config.clone())?;
    let child_id = child_ctx.id.clone();
    let child_header = child_ctx.header_oid.clone();
    {
        let child_ctx = Arc::clone(&child_ctx);
        comp.push(move || {
            let _ = child_ctx.close();
        });
    }

    child_meta.set_parent(
        &child_header,
        &ParentInfo {
            spec: spec.clone(),
            overlap: size,
        },
    )?;

    // the children set lives in the child's pool, keyed by parent spec,
    // which is why unprotect has to sweep every pool
    child_meta.add_child(&spec, &child_id)?;
    {
        let child_meta = MetaClient::new(Arc::clone(&child_pool));
        let (spec, child_id) = (spec.clone(), child_id.clone());
        comp.push(move || {
            if let Err(e) = child_meta.remove_child(&spec, &child_id) {
                warn!(error = %e, "error removing failed clone from children list");
            }
        });
    }

    // propagate user metadata before the clone becomes visible
    let pairs = parent_ctx.meta.metadata_list(&parent_ctx.header_oid)?;
    for (key, value) in &pairs {
        child_meta.metadata_set(&child_header, key, value)?;
    }

    // race detection: the parent may have been unprotected while we were
    // wiring the child up
    {
        let owner = parent_ctx.owner_lock.read();
        refresh::refresh(&parent_ctx, &owner)?;
    }
    let still_protected = {
        let snap = parent_ctx.snap_lock.read();
        snap.snap_info
            .get(&parent_snap_id)
            .map(|info| info.protection == blockio_common::ProtectionStatus::Protected)
            .unwrap_or(false)
    };
    if !still_protected {
        warn!("parent snapshot lost protection during clone");
        return Err(Error::invalid("parent snapshot must be protected"));
    }

    comp.disarm();
    let mut result = child_ctx.close();
    let parent_close = parent_ctx.close();
    if result.is_ok() {
        result = parent_close;
    }
    info!(child_name, "clone created");
    result
}

// ── copy ──────────────────────────────────────────────────────────────────

/// Deep copy of an open image (at its current selection) into a new image.
/// All-zero chunks are skipped so sparseness survives the copy.
pub fn copy(
    src: &Arc<ImageCtx>,
    cluster: &Arc<dyn Cluster>,
    dest_pool_id: PoolId,
    dest_name: &str,
    progress: Arc<dyn ProgressSink>,
    config: &ClientConfig,
) -> Result<()> {
    let (src_size, order, features, stripe_unit, stripe_count) = {
        let snap = src.snap_lock.read();
        (
            snap.size_at(snap.snap_id)?,
            snap.order,
            snap.features,
            snap.stripe_unit,
            snap.stripe_count,
        )
    };
    debug!(src = %src.name, dest_name, src_size, "copying image");

    let opts = CreateOptions {
        format: Some(src.format),
        order,
        features: (!src.format.is_legacy()).then_some(features),
        stripe_unit,
        stripe_count,
    };
    create(cluster, dest_pool_id, dest_name, src_size, &opts, config)?;

    let dest = ImageCtx::open(cluster, dest_pool_id, dest_name, None, false, config.clone())?;

    let result = copy_data(src, &dest, src_size, progress.as_ref());
    let close_result = dest.close();
    result.and(close_result)
}

fn copy_data(
    src: &Arc<ImageCtx>,
    dest: &Arc<ImageCtx>,
    src_size: u64,
    progress: &dyn ProgressSink,
) -> Result<()> {
    if !src.format.is_legacy() && !dest.format.is_legacy() {
        let pairs = src.meta.metadata_list(&src.header_oid)?;
        for (key, value) in &pairs {
            dest.meta.metadata_set(&dest.header_oid, key, value)?;
        }
    }

    let period = {
        let snap = src.snap_lock.read();
        snap.layout().period()
    };

    let throttle = Throttle::new(src.config.concurrent_management_ops);
    std::thread::scope(|scope| {
        let mut offset = 0u64;
        while offset < src_size {
            if throttle.pending_error() {
                break;
            }
            let len = period.min(src_size - offset);
            throttle.start_op();
            let worker_throttle = Arc::clone(&throttle);
            let src = Arc::clone(src);
            let dest = Arc::clone(dest);
            scope.spawn(move || {
                let result = (|| {
                    let data = src.read(offset, len)?;
                    if data.iter().any(|&b| b != 0) {
                        dest.write(offset, &data)?;
                    }
                    Ok(())
                })();
                worker_throttle.end_op(result);
            });
            progress.update(offset, src_size);
            offset += len;
        }
    });
    throttle.wait_for_all()?;
    progress.update(src_size, src_size);
    Ok(())
}

// ── listings ──────────────────────────────────────────────────────────────

/// All image names in a pool, legacy directory entries included
pub fn list(cluster: &Arc<dyn Cluster>, pool_id: PoolId) -> Result<Vec<String>> {
    let meta = MetaClient::new(cluster.pool(pool_id)?);
    let mut names = meta.legacy_dir_list()?;
    names.extend(meta.dir_list()?);
    Ok(names)
}

/// (pool name, image name) of every child of the currently selected
/// snapshot, across all base-tier pools.
pub fn list_children(ctx: &Arc<ImageCtx>) -> Result<Vec<(String, String)>> {
    refresh::check(ctx, None)?;

    if !ctx.features()?.contains(Features::LAYERING) {
        // non-layered images have no children
        return Ok(Vec::new());
    }

    let spec = {
        let snap = ctx.snap_lock.read();
        ParentSpec::new(ctx.pool.id(), ctx.id.clone(), snap.snap_id)
    };

    let mut names = Vec::new();
    for (pool_id, pool_name) in ctx.cluster.pool_list()? {
        let base_tier = match ctx.cluster.pool_base_tier(pool_id) {
            Ok(base) => base,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        if base_tier != pool_id {
            continue; // cache tier
        }
        let pool = match ctx.cluster.pool(pool_id) {
            Ok(pool) => pool,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        let pool_meta = MetaClient::new(pool);
        for child_id in pool_meta.get_children(&spec)? {
            let child_name = pool_meta.dir_get_name(&child_id)?;
            names.push((pool_name.clone(), child_name));
        }
    }
    Ok(names)
}

// ── per-image admin methods ───────────────────────────────────────────────

impl ImageCtx {
    /// Toggle mutable features, enforcing the implication chain
    /// FAST_DIFF ⇒ OBJECT_MAP ⇒ EXCLUSIVE_LOCK on both edges.
    pub fn update_features(self: &Arc<Self>, features: Features, enabled: bool) -> Result<()> {
        refresh::check(self, None)?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if self.format.is_legacy() {
            return Err(Error::invalid("legacy-format images do not support features"));
        }
        if !Features::MUTABLE.contains(features) {
            return Err(Error::invalid("cannot update immutable features"));
        }
        if features.is_empty() {
            return Err(Error::invalid("update requires at least one feature"));
        }

        let snap_ids: Vec<blockio_common::SnapId>;
        let new_features;
        let mut features_mask = features;
        let mut disable_flags = ImageFlags::empty();
        {
            let snap = self.snap_lock.read();
            new_features = if enabled {
                snap.features | features
            } else {
                snap.features - features
            };
            if snap.features == new_features {
                return Ok(());
            }
            snap_ids = snap.snap_info.keys().copied().collect();
        }

        if enabled {
            let mut enable_flags = ImageFlags::empty();
            if features.contains(Features::OBJECT_MAP) {
                if !new_features.contains(Features::EXCLUSIVE_LOCK) {
                    return Err(Error::invalid(
                        "cannot enable object map without exclusive lock",
                    ));
                }
                enable_flags |= ImageFlags::OBJECT_MAP_INVALID;
                features_mask |= Features::EXCLUSIVE_LOCK;
            }
            if features.contains(Features::FAST_DIFF) {
                if !new_features.contains(Features::OBJECT_MAP) {
                    return Err(Error::invalid("cannot enable fast diff without object map"));
                }
                enable_flags |= ImageFlags::FAST_DIFF_INVALID;
                features_mask |= Features::OBJECT_MAP | Features::EXCLUSIVE_LOCK;
            }
            if !enable_flags.is_empty() {
                self.update_all_flags(&snap_ids, enable_flags, enable_flags)?;
            }
        } else {
            if features.contains(Features::EXCLUSIVE_LOCK)
                && new_features.contains(Features::OBJECT_MAP)
            {
                return Err(Error::invalid(
                    "cannot disable exclusive lock while the object map is enabled",
                ));
            }
            if features.contains(Features::OBJECT_MAP) {
                if new_features.contains(Features::FAST_DIFF) {
                    return Err(Error::invalid(
                        "cannot disable object map while fast diff is enabled",
                    ));
                }
                disable_flags = ImageFlags::OBJECT_MAP_INVALID;
                self.remove_object_maps(&snap_ids)?;
            }
            if features.contains(Features::FAST_DIFF) {
                disable_flags = ImageFlags::FAST_DIFF_INVALID;
            }
        }

        debug!(
            features = new_features.bits(),
            mask = features_mask.bits(),
            "updating features"
        );
        self.meta
            .set_features(&self.header_oid, new_features.bits(), features_mask.bits())?;

        if !disable_flags.is_empty() {
            self.update_all_flags(&snap_ids, ImageFlags::empty(), disable_flags)?;
        }

        watcher::notify_header_update(self);
        Ok(())
    }

    fn update_all_flags(
        &self,
        snap_ids: &[blockio_common::SnapId],
        flags: ImageFlags,
        mask: ImageFlags,
    ) -> Result<()> {
        self.meta
            .set_flags(&self.header_oid, SNAP_HEAD, flags, mask)?;
        for &snap_id in snap_ids {
            self.meta.set_flags(&self.header_oid, snap_id, flags, mask)?;
        }
        Ok(())
    }

    fn remove_object_maps(&self, snap_ids: &[blockio_common::SnapId]) -> Result<()> {
        for &snap_id in snap_ids {
            self.meta
                .remove_ignore_missing(&object_map_name(&self.id, snap_id))?;
        }
        self.meta
            .remove_ignore_missing(&object_map_name(&self.id, SNAP_HEAD))
    }

    // ── user metadata ─────────────────────────────────────────────────────

    pub fn metadata_get(self: &Arc<Self>, key: &str) -> Result<Option<String>> {
        refresh::check(self, None)?;
        self.meta.metadata_get(&self.header_oid, key)
    }

    pub fn metadata_set(self: &Arc<Self>, key: &str, value: &str) -> Result<()> {
        refresh::check(self, None)?;
        self.meta.metadata_set(&self.header_oid, key, value)
    }

    pub fn metadata_remove(self: &Arc<Self>, key: &str) -> Result<()> {
        refresh::check(self, None)?;
        self.meta.metadata_remove(&self.header_oid, key)
    }

    pub fn metadata_list(self: &Arc<Self>) -> Result<std::collections::BTreeMap<String, String>> {
        refresh::check(self, None)?;
        self.meta.metadata_list(&self.header_oid)
    }

    // ── user-facing advisory locks ────────────────────────────────────────

    /// Current lockers of the header object: (lockers, exclusive, tag)
    pub fn list_lockers(self: &Arc<Self>) -> Result<(Vec<Locker>, bool, String)> {
        refresh::check(self, None)?;
        let _md = self.md_lock.read();
        let snap = self.snap_lock.read();
        Ok((
            snap.lockers.clone(),
            snap.exclusive_locked,
            snap.lock_tag.clone(),
        ))
    }

    pub fn lock_image(self: &Arc<Self>, mode: LockMode, cookie: &str, tag: &str) -> Result<()> {
        refresh::check(self, None)?;
        let _md = self.md_lock.read();
        self.pool
            .lock(&self.header_oid, LOCK_NAME, mode, cookie, tag)?;
        watcher::notify_header_update(self);
        Ok(())
    }

    pub fn unlock_image(self: &Arc<Self>, cookie: &str) -> Result<()> {
        refresh::check(self, None)?;
        let _md = self.md_lock.read();
        self.pool.unlock(&self.header_oid, LOCK_NAME, cookie)?;
        watcher::notify_header_update(self);
        Ok(())
    }

    pub fn break_lock_image(self: &Arc<Self>, client: &str, cookie: &str) -> Result<()> {
        refresh::check(self, None)?;
        self.pool
            .break_lock(&self.header_oid, LOCK_NAME, client, cookie)?;
        watcher::notify_header_update(self);
        Ok(())
    }

    /// Children of the currently selected snapshot
    pub fn list_children(self: &Arc<Self>) -> Result<Vec<(String, String)>> {
        list_children(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockio_store::mem::{MemBackend, MemCluster};

    fn cluster_with_pool() -> (Arc<dyn Cluster>, PoolId) {
        let backend = MemBackend::new();
        let pool_id = backend.create_pool("blockpool");
        let cluster: Arc<dyn Cluster> = MemCluster::connect(&backend);
        (cluster, pool_id)
    }

    #[test]
    fn test_create_rejects_bad_order() {
        let (cluster, pool_id) = cluster_with_pool();
        let opts = CreateOptions {
            order: 9,
            ..Default::default()
        };
        let err = create(
            &cluster,
            pool_id,
            "img",
            1 << 20,
            &opts,
            &ClientConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn test_create_rejects_striping_without_feature() {
        let (cluster, pool_id) = cluster_with_pool();
        let opts = CreateOptions {
            features: Some(Features::empty()),
            stripe_unit: 4096,
            stripe_count: 2,
            ..Default::default()
        };
        let err = create(
            &cluster,
            pool_id,
            "img",
            1 << 20,
            &opts,
            &ClientConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn test_create_detect_and_duplicate() {
        let (cluster, pool_id) = cluster_with_pool();
        let config = ClientConfig::default();
        create(&cluster, pool_id, "img", 1 << 22, &CreateOptions::default(), &config).unwrap();

        assert_eq!(
            detect_format(&cluster, pool_id, "img").unwrap(),
            Some(ImageFormat::Modern)
        );
        assert!(detect_format(&cluster, pool_id, "other").unwrap().is_none());

        let err = create(
            &cluster,
            pool_id,
            "img",
            1 << 22,
            &CreateOptions::default(),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_failed_create_leaves_no_debris() {
        let (cluster, pool_id) = cluster_with_pool();
        let config = ClientConfig::default();
        // object map requires exclusive lock: fails after the header is
        // written, compensations must clean everything up
        let opts = CreateOptions {
            features: Some(Features::OBJECT_MAP),
            ..Default::default()
        };
        let err = create(&cluster, pool_id, "img", 1 << 22, &opts, &config).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));

        assert!(detect_format(&cluster, pool_id, "img").unwrap().is_none());
        assert!(list(&cluster, pool_id).unwrap().is_empty());
    }

    #[test]
    fn test_create_legacy_and_list() {
        let (cluster, pool_id) = cluster_with_pool();
        let config = ClientConfig::default();
        let opts = CreateOptions {
            format: Some(ImageFormat::Legacy),
            ..Default::default()
        };
        create(&cluster, pool_id, "oldimg", 1 << 22, &opts, &config).unwrap();

        assert_eq!(
            detect_format(&cluster, pool_id, "oldimg").unwrap(),
            Some(ImageFormat::Legacy)
        );
        assert_eq!(list(&cluster, pool_id).unwrap(), vec!["oldimg"]);
    }

    #[test]
    fn test_rename_roundtrip() {
        let (cluster, pool_id) = cluster_with_pool();
        let config = ClientConfig::default();
        create(&cluster, pool_id, "a", 1 << 22, &CreateOptions::default(), &config).unwrap();

        rename(&cluster, pool_id, "a", "b").unwrap();
        assert!(detect_format(&cluster, pool_id, "a").unwrap().is_none());
        assert_eq!(
            detect_format(&cluster, pool_id, "b").unwrap(),
            Some(ImageFormat::Modern)
        );

        // renaming back restores the original state
        rename(&cluster, pool_id, "b", "a").unwrap();
        assert_eq!(list(&cluster, pool_id).unwrap(), vec!["a"]);

        let err = rename(&cluster, pool_id, "missing", "c").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rename_to_existing_name_fails() {
        let (cluster, pool_id) = cluster_with_pool();
        let config = ClientConfig::default();
        create(&cluster, pool_id, "a", 1 << 22, &CreateOptions::default(), &config).unwrap();
        create(&cluster, pool_id, "b", 1 << 22, &CreateOptions::default(), &config).unwrap();
        assert!(matches!(
            rename(&cluster, pool_id, "a", "b"),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_remove_missing_image() {
        let (cluster, pool_id) = cluster_with_pool();
        // removing a never-created image fails when the directory has no
        // trace of it
        let err = remove(
            &cluster,
            pool_id,
            "ghost",
            Arc::new(maintenance::NoProgress),
            &ClientConfig::default(),
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }
}
