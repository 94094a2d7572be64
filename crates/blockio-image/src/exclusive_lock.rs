//! Cooperative exclusive-lock protocol.
//!
//! The lock is an advisory exclusive lock on the header object tagged as
//! internally managed. At most one client owns it; non-owners either
//! acquire it before mutating or delegate the mutation to the owner over
//! the watch channel. Per-client states: UNLOCKED → (try) → LOCKED →
//! RELEASING → UNLOCKED, with request-lock notifications nudging the
//! current holder.

use std::sync::Arc;

use tracing::{debug, warn};

use blockio_common::{Error, LockMode, Result};

use crate::image::{ImageCtx, LockState, OwnerState};
use crate::watcher;
use crate::{INTERNAL_LOCK_TAG, LOCK_NAME};

/// Attempt to take the advisory lock. Caller write-holds owner_lock.
/// Returns Ok with the state unchanged when a cooperative peer holds it;
/// fails with Busy when a user-placed advisory lock is in the way.
pub(crate) fn try_lock(ctx: &Arc<ImageCtx>, owner: &mut OwnerState) -> Result<()> {
    if owner.is_lock_owner() {
        return Ok(());
    }
    match ctx.pool.lock(
        &ctx.header_oid,
        LOCK_NAME,
        LockMode::Exclusive,
        &owner.cookie,
        INTERNAL_LOCK_TAG,
    ) {
        Ok(()) => {
            debug!(name = %ctx.name, "acquired exclusive lock");
            owner.state = LockState::Locked;
            watcher::notify_acquired_lock(ctx);
            Ok(())
        }
        Err(Error::AlreadyExists(_)) => {
            // the store still records our cookie from a previous attempt
            owner.state = LockState::Locked;
            Ok(())
        }
        Err(Error::Busy(_)) => {
            let info = ctx.pool.lock_info(&ctx.header_oid, LOCK_NAME)?;
            if !info.lockers.is_empty() && info.tag != INTERNAL_LOCK_TAG {
                return Err(Error::Busy("image is locked by another user".into()));
            }
            // a cooperative peer owns it; stay unlocked and negotiate
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Try to become the lock owner before a metadata update. The only place
/// that downgrade-upgrades owner_lock: the caller must hold NO image locks.
/// On acquisition, I/O that queued while unowned is flushed.
pub(crate) fn prepare_image_update(ctx: &Arc<ImageCtx>) -> Result<()> {
    let acquired = {
        let mut owner = ctx.owner_lock.write();
        if owner.is_lock_owner() {
            return Ok(());
        }
        if !ctx.lock_supported() {
            return Ok(());
        }
        try_lock(ctx, &mut owner)?;
        owner.is_lock_owner()
    };
    if acquired {
        // finish any I/O that was waiting on ownership
        ctx.flush_async_operations();
    }
    Ok(())
}

/// Release the lock: flush every in-flight write tagged with the current
/// snap context, then drop the advisory lock and tell the peers.
pub(crate) fn release_lock(ctx: &Arc<ImageCtx>) -> Result<()> {
    {
        let mut owner = ctx.owner_lock.write();
        if owner.state != LockState::Locked {
            return Ok(());
        }
        owner.state = LockState::Releasing;
    }

    if let Err(e) = ctx.flush_writes() {
        warn!(error = %e, "flush failed; keeping exclusive lock");
        ctx.owner_lock.write().state = LockState::Locked;
        return Err(e);
    }

    {
        let mut owner = ctx.owner_lock.write();
        if let Err(e) = ctx.pool.unlock(&ctx.header_oid, LOCK_NAME, &owner.cookie) {
            if !e.is_not_found() {
                owner.state = LockState::Locked;
                return Err(e);
            }
        }
        owner.state = LockState::Unlocked;
        owner.unlock_prepared = false;
    }
    debug!(name = %ctx.name, "released exclusive lock");
    watcher::notify_released_lock(ctx);
    Ok(())
}

/// Gate for writes and discards from a non-owner: request the lock from
/// the holder and retry with backoff until acquired. This is the only
/// suspension point on the data path.
pub(crate) fn acquire_for_write(ctx: &Arc<ImageCtx>) -> Result<()> {
    for _ in 0..ctx.config.request_lock_retries.max(1) {
        prepare_image_update(ctx)?;
        if ctx.owner_lock.read().is_lock_owner() {
            return Ok(());
        }

        match watcher::notify_request_lock(ctx) {
            // holder released; retry acquisition immediately
            Ok(()) => continue,
            Err(Error::Busy(_)) => {
                debug!(name = %ctx.name, "lock owner busy; backing off");
                std::thread::sleep(ctx.config.request_lock_backoff);
            }
            // nobody answered: the lock may simply be free now
            Err(Error::Timeout) => continue,
            Err(e) => return Err(e),
        }
    }
    warn!(name = %ctx.name, "timed out waiting for exclusive lock hand-off");
    Err(Error::Timeout)
}
