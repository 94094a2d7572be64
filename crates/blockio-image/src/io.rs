//! I/O front-end: clipping, extent mapping, request-lock gating and
//! submission to the object store or the optional cache.
//!
//! Blocking entry points submit onto the per-image FIFO queue and park on a
//! one-shot completion; `aio_*` variants hand the completion back. The only
//! suspension point on the write path is lock acquisition when the
//! cooperative exclusive lock is held elsewhere.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use blockio_common::{Error, Result, SnapContext, SnapId, SNAP_HEAD};

use crate::async_op::OpCompletion;
use crate::exclusive_lock;
use crate::image::{parent_info_at, ImageCtx, SnapState};
use crate::object_map::{OBJECT_EXISTS, OBJECT_NONEXISTENT};
use crate::refresh;
use crate::striper::{self, ObjectExtent};

/// Validate an extent against the selected view and clip it to the image
/// size. Zero-length requests are always valid.
pub(crate) fn clip_io(snap: &SnapState, off: u64, len: u64) -> Result<u64> {
    if !snap.snap_exists {
        return Err(Error::not_found("selected snapshot was removed"));
    }
    if len == 0 {
        return Ok(0);
    }
    let image_size = snap.size_at(snap.snap_id)?;
    if off >= image_size {
        return Err(Error::invalid(format!(
            "offset {off} beyond image size {image_size}"
        )));
    }
    Ok(len.min(image_size - off))
}

/// One planned object operation, resolved under snap_lock so the layout
/// cannot shift underneath the queued work.
struct PlannedExtent {
    extent: ObjectExtent,
    oid: String,
    map_state: Option<u8>,
}

fn plan_extents(ctx: &ImageCtx, snap: &SnapState, off: u64, len: u64) -> Vec<PlannedExtent> {
    striper::file_to_extents(&snap.layout(), off, len)
        .into_iter()
        .map(|extent| PlannedExtent {
            oid: ctx.object_name(snap, extent.object_no),
            map_state: snap.object_map.get(extent.object_no),
            extent,
        })
        .collect()
}

impl ImageCtx {
    // ── read ──────────────────────────────────────────────────────────────

    pub fn read(self: &Arc<Self>, off: u64, len: u64) -> Result<Bytes> {
        self.aio_read(off, len).wait_for_data()
    }

    pub fn aio_read(self: &Arc<Self>, off: u64, len: u64) -> Arc<OpCompletion> {
        let completion = OpCompletion::new();
        if let Err(e) = refresh::check(self, None) {
            completion.complete(Err(e));
            return completion;
        }
        let ctx = Arc::clone(self);
        let done = Arc::clone(&completion);
        self.io_queue.submit(move || match read_impl(&ctx, off, len) {
            Ok(data) => done.complete_with_data(data),
            Err(e) => done.complete(Err(e)),
        });
        completion
    }

    // ── write ─────────────────────────────────────────────────────────────

    /// Write `data` at `off`; returns the clipped byte count.
    pub fn write(self: &Arc<Self>, off: u64, data: &[u8]) -> Result<u64> {
        let (completion, clipped) =
            submit_modify(self, off, data.len() as u64, WriteKind::Write(Bytes::copy_from_slice(data)))?;
        completion.wait()?;
        Ok(clipped)
    }

    pub fn aio_write(self: &Arc<Self>, off: u64, data: Bytes) -> Arc<OpCompletion> {
        match submit_modify(self, off, data.len() as u64, WriteKind::Write(data)) {
            Ok((completion, _)) => completion,
            Err(e) => {
                let completion = OpCompletion::new();
                completion.complete(Err(e));
                completion
            }
        }
    }

    // ── discard ───────────────────────────────────────────────────────────

    /// Deallocate `len` bytes at `off`; returns the clipped byte count.
    pub fn discard(self: &Arc<Self>, off: u64, len: u64) -> Result<u64> {
        let (completion, clipped) = submit_modify(self, off, len, WriteKind::Discard)?;
        completion.wait()?;
        Ok(clipped)
    }

    pub fn aio_discard(self: &Arc<Self>, off: u64, len: u64) -> Arc<OpCompletion> {
        match submit_modify(self, off, len, WriteKind::Discard) {
            Ok((completion, _)) => completion,
            Err(e) => {
                let completion = OpCompletion::new();
                completion.complete(Err(e));
                completion
            }
        }
    }

    // ── flush ─────────────────────────────────────────────────────────────

    /// Drain locally queued operations, then flush the cache or the store.
    pub fn flush(self: &Arc<Self>) -> Result<()> {
        refresh::check(self, None)?;
        let _owner = self.owner_lock.read_recursive();
        self.flush_writes()
    }

    /// Ordered flush: completes only after every previously submitted
    /// write has completed.
    pub fn aio_flush(self: &Arc<Self>) -> Arc<OpCompletion> {
        let completion = OpCompletion::new();
        if let Err(e) = refresh::check(self, None) {
            completion.complete(Err(e));
            return completion;
        }
        let ctx = Arc::clone(self);
        let done = Arc::clone(&completion);
        // FIFO queue ordering is the guarantee: this job runs after every
        // write submitted before it
        self.io_queue.submit(move || {
            let cache = ctx.cache_lock.lock().clone();
            let result = match cache {
                Some(cache) => cache.flush(),
                None => ctx.pool.flush(),
            };
            done.complete(result);
        });
        completion
    }
}

// ── read internals ────────────────────────────────────────────────────────

fn read_impl(ctx: &Arc<ImageCtx>, off: u64, len: u64) -> Result<Bytes> {
    // recursive read keeps queued jobs immune to writer-priority inversion
    // while an op holds the owner lock and waits for this queue
    let _owner = ctx.owner_lock.read_recursive();

    let (snap_sel, clip_len, planned) = {
        let snap = ctx.snap_lock.read();
        let clip_len = clip_io(&snap, off, len)?;
        let planned = plan_extents(ctx, &snap, off, clip_len);
        (snap.snap_id, clip_len, planned)
    };

    let mut buf = vec![0u8; clip_len as usize];
    for plan in &planned {
        read_extent(ctx, plan, snap_sel, off, &mut buf)?;
    }
    Ok(Bytes::from(buf))
}

fn read_extent(
    ctx: &Arc<ImageCtx>,
    plan: &PlannedExtent,
    snap_sel: SnapId,
    base_off: u64,
    buf: &mut [u8],
) -> Result<()> {
    let ext = &plan.extent;
    let buf_off = (ext.image_offset - base_off) as usize;

    // cache first, when one is wired in
    if snap_sel == SNAP_HEAD {
        let cache = ctx.cache_lock.lock().clone();
        if let Some(cache) = cache {
            if let Some(data) = cache.read(&plan.oid, ext.offset, ext.length) {
                let n = data.len().min(ext.length as usize);
                buf[buf_off..buf_off + n].copy_from_slice(&data[..n]);
                return Ok(());
            }
        }
    }

    // a trusted object map lets us skip the store round-trip
    if plan.map_state == Some(OBJECT_NONEXISTENT) {
        return read_from_parent(ctx, ext, buf_off, buf);
    }

    match ctx.pool.read(&plan.oid, ext.offset, ext.length, snap_sel) {
        Ok(data) => {
            // short reads leave the tail zero-filled (sparse object)
            let n = data.len().min(ext.length as usize);
            buf[buf_off..buf_off + n].copy_from_slice(&data[..n]);
            Ok(())
        }
        Err(e) if e.is_not_found() => read_from_parent(ctx, ext, buf_off, buf),
        Err(e) => Err(e),
    }
}

/// Unallocated extent of a cloned image: recurse into the parent within
/// the overlap, zero-fill beyond it.
fn read_from_parent(
    ctx: &Arc<ImageCtx>,
    ext: &ObjectExtent,
    buf_off: usize,
    buf: &mut [u8],
) -> Result<()> {
    let (parent_ctx, overlap) = {
        let snap = ctx.snap_lock.read();
        let parent = ctx.parent_lock.read();
        let Some(info) = parent_info_at(&snap, &parent, snap.snap_id) else {
            return Ok(());
        };
        let Some(parent_ctx) = parent.parent.clone() else {
            return Ok(());
        };
        (parent_ctx, info.overlap)
    };

    if ext.image_offset >= overlap {
        return Ok(());
    }
    let read_len = ext.length.min(overlap - ext.image_offset);
    let data = parent_ctx.read(ext.image_offset, read_len)?;
    let n = data.len().min(read_len as usize);
    buf[buf_off..buf_off + n].copy_from_slice(&data[..n]);
    Ok(())
}

// ── write/discard internals ───────────────────────────────────────────────

enum WriteKind {
    Write(Bytes),
    Discard,
}

/// Plan and queue a mutating data op. Re-plans after every lock
/// suspension, since the image may have changed while waiting.
fn submit_modify(
    ctx: &Arc<ImageCtx>,
    off: u64,
    len: u64,
    kind: WriteKind,
) -> Result<(Arc<OpCompletion>, u64)> {
    refresh::check(ctx, None)?;
    loop {
        {
            let owner = ctx.owner_lock.read();
            let _md = ctx.md_lock.read();
            let snap = ctx.snap_lock.read();

            if ctx.read_only || !snap.at_head() {
                return Err(Error::ReadOnly);
            }
            let clip_len = clip_io(&snap, off, len)?;

            let gated = ctx.lock_supported_at(&snap) && !owner.is_lock_owner();
            if !gated {
                let planned = plan_extents(ctx, &snap, off, clip_len);
                let snapc = snap.snapc.clone();
                let object_size = snap.layout().object_size;
                drop(snap);

                let completion = OpCompletion::new();
                let job_ctx = Arc::clone(ctx);
                let done = Arc::clone(&completion);
                let data = match kind {
                    WriteKind::Write(data) => Some(data.slice(..clip_len as usize)),
                    WriteKind::Discard => None,
                };
                ctx.io_queue.submit(move || {
                    let result = match &data {
                        Some(data) => write_job(&job_ctx, &planned, data, off, &snapc),
                        None => discard_job(&job_ctx, &planned, object_size, &snapc),
                    };
                    done.complete(result);
                });
                return Ok((completion, clip_len));
            }
        }
        // sole suspension point on the data path: wait for ownership
        debug!(name = %ctx.name, "write suspended pending exclusive lock");
        exclusive_lock::acquire_for_write(ctx)?;
    }
}

fn write_job(
    ctx: &Arc<ImageCtx>,
    planned: &[PlannedExtent],
    data: &Bytes,
    base_off: u64,
    snapc: &SnapContext,
) -> Result<()> {
    let _owner = ctx.owner_lock.read_recursive();
    let cache = ctx.cache_lock.lock().clone();

    for plan in planned {
        let ext = &plan.extent;
        let buf_off = (ext.image_offset - base_off) as usize;
        let chunk = &data[buf_off..buf_off + ext.length as usize];

        maybe_copyup(ctx, plan, snapc)?;

        match &cache {
            Some(cache) => cache.write(&plan.oid, ext.offset, chunk, snapc)?,
            None => ctx.pool.write(&plan.oid, ext.offset, chunk, snapc)?,
        }

        let mut snap = ctx.snap_lock.write();
        snap.object_map.set(ext.object_no, OBJECT_EXISTS);
    }
    Ok(())
}

fn discard_job(
    ctx: &Arc<ImageCtx>,
    planned: &[PlannedExtent],
    object_size: u64,
    snapc: &SnapContext,
) -> Result<()> {
    let _owner = ctx.owner_lock.read_recursive();
    let cache = ctx.cache_lock.lock().clone();

    for plan in planned {
        let ext = &plan.extent;
        if let Some(cache) = &cache {
            cache.discard(&plan.oid, ext.offset, ext.length, snapc)?;
        }

        let whole_object = ext.offset == 0 && ext.length == object_size;
        let parent_backed = object_has_parent_data(ctx, ext.object_no);

        if whole_object && !parent_backed {
            match ctx.pool.remove(&plan.oid, snapc) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            let mut snap = ctx.snap_lock.write();
            snap.object_map.set(ext.object_no, OBJECT_NONEXISTENT);
        } else if whole_object {
            // truncating instead of removing keeps parent data masked
            ctx.pool.truncate(&plan.oid, 0, snapc)?;
        } else if ext.offset + ext.length == object_size {
            maybe_copyup(ctx, plan, snapc)?;
            ctx.pool.truncate(&plan.oid, ext.offset, snapc)?;
        } else if ctx.config.skip_partial_discard {
            debug!(oid = %plan.oid, "skipping partial discard");
        } else {
            maybe_copyup(ctx, plan, snapc)?;
            ctx.pool.zero(&plan.oid, ext.offset, ext.length, snapc)?;
        }
    }
    Ok(())
}

fn object_has_parent_data(ctx: &Arc<ImageCtx>, object_no: u64) -> bool {
    let snap = ctx.snap_lock.read();
    let parent = ctx.parent_lock.read();
    let Some(info) = parent_info_at(&snap, &parent, SNAP_HEAD) else {
        return false;
    };
    striper::object_image_extents(&snap.layout(), object_no)
        .iter()
        .any(|ext| ext.image_offset < info.overlap)
}

/// Copy-on-write from the parent: a partial write to an object this image
/// does not have yet must first materialize the parent's data for that
/// object, or the rest of the object would silently read as zeroes.
fn maybe_copyup(ctx: &Arc<ImageCtx>, plan: &PlannedExtent, snapc: &SnapContext) -> Result<()> {
    if plan.map_state == Some(OBJECT_EXISTS) {
        return Ok(());
    }
    copyup_object(ctx, plan.extent.object_no, &plan.oid, snapc)
}

/// Materialize one object from the parent if this image does not have it.
/// All-zero parent data is skipped; the object stays unallocated and
/// reads keep falling through. Also drives flatten, one object at a time.
pub(crate) fn copyup_object(
    ctx: &Arc<ImageCtx>,
    object_no: u64,
    oid: &str,
    snapc: &SnapContext,
) -> Result<()> {
    let (parent_ctx, overlap, extents) = {
        let snap = ctx.snap_lock.read();
        let parent = ctx.parent_lock.read();
        let Some(info) = parent_info_at(&snap, &parent, SNAP_HEAD) else {
            return Ok(());
        };
        let Some(parent_ctx) = parent.parent.clone() else {
            return Ok(());
        };
        (
            parent_ctx,
            info.overlap,
            striper::object_image_extents(&snap.layout(), object_no),
        )
    };

    if ctx.pool.exists(oid, SNAP_HEAD)? {
        return Ok(());
    }

    let object_len = extents.iter().map(|e| e.offset + e.length).max().unwrap_or(0);
    let mut object_data = vec![0u8; object_len as usize];
    let mut nonzero = false;
    for ext in &extents {
        if ext.image_offset >= overlap {
            continue;
        }
        let read_len = ext.length.min(overlap - ext.image_offset);
        let data = parent_ctx.read(ext.image_offset, read_len)?;
        if data.iter().any(|&b| b != 0) {
            nonzero = true;
        }
        let dst = ext.offset as usize;
        object_data[dst..dst + data.len()].copy_from_slice(&data);
    }

    if nonzero {
        debug!(oid, "copy-up from parent");
        ctx.pool.write_full(oid, &object_data, snapc)?;
        let mut snap = ctx.snap_lock.write();
        snap.object_map.set(object_no, OBJECT_EXISTS);
    }
    Ok(())
}
