//! Header-object watch channel: notification payloads, the per-image watch
//! callback, and the remote-request senders used by the async-op envelope.
//!
//! Watch callbacks arrive on arbitrary store threads; they are translated
//! into refresh-seq bumps, lock hand-off and remote op execution here.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use blockio_common::{Error, Result};
use blockio_store::{Pool, WatchCallback};

use crate::exclusive_lock;
use crate::image::{ImageCtx, OwnerState};
use crate::maintenance::{self, NoProgress};
use crate::snapshot;

/// Messages exchanged on the header object's watch channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum NotifyMessage {
    HeaderUpdate,
    AcquiredLock { client: String },
    ReleasedLock { client: String },
    RequestLock { client: String },
    Resize { size: u64 },
    SnapCreate { name: String },
    SnapRemove { name: String },
    Flatten,
    RebuildObjectMap,
}

/// Serializable mirror of the error kinds a remote op can produce
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum WireError {
    ReadOnly,
    NotFound(String),
    AlreadyExists(String),
    Invalid(String),
    Unsupported(String),
    Busy(String),
    Timeout,
    Restart,
    Corrupt(String),
    Other(String),
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        match e {
            Error::ReadOnly => WireError::ReadOnly,
            Error::NotFound(s) => WireError::NotFound(s.clone()),
            Error::AlreadyExists(s) => WireError::AlreadyExists(s.clone()),
            Error::Invalid(s) => WireError::Invalid(s.clone()),
            Error::Unsupported(s) => WireError::Unsupported(s.clone()),
            Error::Busy(s) => WireError::Busy(s.clone()),
            Error::Timeout => WireError::Timeout,
            Error::Restart | Error::Stale => WireError::Restart,
            Error::Corrupt(s) => WireError::Corrupt(s.clone()),
            other => WireError::Other(other.to_string()),
        }
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        match e {
            WireError::ReadOnly => Error::ReadOnly,
            WireError::NotFound(s) => Error::NotFound(s),
            WireError::AlreadyExists(s) => Error::AlreadyExists(s),
            WireError::Invalid(s) => Error::Invalid(s),
            WireError::Unsupported(s) => Error::Unsupported(s),
            WireError::Busy(s) => Error::Busy(s),
            WireError::Timeout => Error::Timeout,
            WireError::Restart => Error::Restart,
            WireError::Corrupt(s) => Error::Corrupt(s),
            WireError::Other(s) => Error::Store(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum WireResult {
    Ok,
    Err(WireError),
}

impl WireResult {
    fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => WireResult::Ok,
            Err(e) => WireResult::Err(e.into()),
        }
    }

    fn into_result(self) -> Result<()> {
        match self {
            WireResult::Ok => Ok(()),
            WireResult::Err(e) => Err(e.into()),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("notification payloads always serialize")
}

fn encode_ack(result: &Result<()>) -> Option<Bytes> {
    Some(Bytes::from(encode(&WireResult::from_result(result))))
}

// ── outbound ──────────────────────────────────────────────────────────────

/// Bump the local refresh counter and tell every peer the header changed.
/// Best-effort: delivery failures only get logged.
pub(crate) fn notify_header_update(ctx: &Arc<ImageCtx>) {
    ctx.bump_refresh_seq();
    notify_header_update_oid(&ctx.pool, &ctx.header_oid);
}

/// Header-update notification without an open context (pool-level admin)
pub(crate) fn notify_header_update_oid(pool: &Arc<dyn Pool>, oid: &str) {
    let payload = encode(&NotifyMessage::HeaderUpdate);
    if let Err(e) = pool.notify(oid, &payload, Duration::from_secs(1)) {
        debug!(oid, error = %e, "header-update notification not delivered");
    }
}

pub(crate) fn notify_acquired_lock(ctx: &Arc<ImageCtx>) {
    let payload = encode(&NotifyMessage::AcquiredLock {
        client: ctx.cluster.client_id(),
    });
    let _ = ctx.pool.notify(&ctx.header_oid, &payload, Duration::from_secs(1));
}

pub(crate) fn notify_released_lock(ctx: &Arc<ImageCtx>) {
    let payload = encode(&NotifyMessage::ReleasedLock {
        client: ctx.cluster.client_id(),
    });
    let _ = ctx.pool.notify(&ctx.header_oid, &payload, Duration::from_secs(1));
}

/// Ask the current owner to release the lock. `Ok` means it released;
/// `Busy` means it deferred; `Timeout` means nobody owned up.
pub(crate) fn notify_request_lock(ctx: &Arc<ImageCtx>) -> Result<()> {
    let msg = NotifyMessage::RequestLock {
        client: ctx.cluster.client_id(),
    };
    send_and_collect(ctx, &msg)
}

/// Delegate a mutating op to the current lock owner
pub(crate) fn remote_request(ctx: &Arc<ImageCtx>, msg: NotifyMessage) -> Result<()> {
    debug!(name = %ctx.name, ?msg, "delegating request to lock owner");
    send_and_collect(ctx, &msg)
}

fn send_and_collect(ctx: &Arc<ImageCtx>, msg: &NotifyMessage) -> Result<()> {
    let payload = encode(msg);
    let acks = ctx
        .pool
        .notify(&ctx.header_oid, &payload, ctx.config.notify_timeout)?;
    let own_client = ctx.cluster.client_id();
    for ack in acks {
        if ack.client == own_client {
            continue;
        }
        if let Some(raw) = ack.payload {
            let result: WireResult = serde_json::from_slice(&raw)
                .map_err(|e| Error::corrupt(format!("bad notify ack: {e}")))?;
            return result.into_result();
        }
    }
    // nobody claimed ownership of the request
    Err(Error::Timeout)
}

// ── inbound ───────────────────────────────────────────────────────────────

/// Watch callback registered on the header object of every writable open
/// image.
pub(crate) struct ImageWatcher {
    ctx: Weak<ImageCtx>,
}

impl ImageWatcher {
    pub fn new(ctx: Weak<ImageCtx>) -> Self {
        Self { ctx }
    }
}

impl WatchCallback for ImageWatcher {
    fn notify(&self, payload: &[u8]) -> Option<Bytes> {
        let Some(ctx) = self.ctx.upgrade() else {
            return None;
        };
        let msg: NotifyMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "ignoring malformed notification");
                return None;
            }
        };
        handle_notify(&ctx, msg)
    }
}

fn handle_notify(ctx: &Arc<ImageCtx>, msg: NotifyMessage) -> Option<Bytes> {
    match msg {
        NotifyMessage::HeaderUpdate => {
            ctx.bump_refresh_seq();
            None
        }
        NotifyMessage::AcquiredLock { client } | NotifyMessage::ReleasedLock { client } => {
            debug!(client, "peer lock transition");
            ctx.bump_refresh_seq();
            None
        }
        NotifyMessage::RequestLock { client } => {
            if client == ctx.cluster.client_id() {
                return None;
            }
            {
                // recursive read: callbacks fire on arbitrary threads and
                // must not queue behind a waiting writer
                let owner = ctx.owner_lock.read_recursive();
                if !owner.is_lock_owner() {
                    return None;
                }
                if owner.unlock_prepared {
                    return encode_ack(&Err(Error::Busy("lock hand-off in progress".into())));
                }
            }
            if ctx.async_requests.is_busy() || ctx.op_queue.is_busy() {
                // active mutating requests; peer retries with backoff
                return encode_ack(&Err(Error::Busy("image has active requests".into())));
            }
            debug!(client, "releasing exclusive lock on request");
            encode_ack(&exclusive_lock::release_lock(ctx))
        }
        NotifyMessage::Resize { size } => execute_if_owner(ctx, move |ctx, owner, cancel| {
            maintenance::resize_local(ctx, owner, cancel, size, &NoProgress)
        }),
        NotifyMessage::SnapCreate { name } => execute_if_owner(ctx, move |ctx, owner, _cancel| {
            snapshot::snap_create_local(ctx, owner, &name)
        }),
        NotifyMessage::SnapRemove { name } => execute_if_owner(ctx, move |ctx, owner, _cancel| {
            snapshot::snap_remove_local(ctx, owner, &name)
        }),
        NotifyMessage::Flatten => execute_if_owner(ctx, |ctx, owner, cancel| {
            maintenance::flatten_local(ctx, owner, cancel, &NoProgress)
        }),
        NotifyMessage::RebuildObjectMap => execute_if_owner(ctx, |ctx, owner, cancel| {
            maintenance::rebuild_object_map_local(ctx, owner, cancel, &NoProgress)
        }),
    }
}

/// Run a delegated op when (and only when) this client owns the lock; the
/// acknowledgement carries the result back to the requester.
fn execute_if_owner(
    ctx: &Arc<ImageCtx>,
    op: impl FnOnce(&Arc<ImageCtx>, &OwnerState, &AtomicBool) -> Result<()>,
) -> Option<Bytes> {
    {
        let owner = ctx.owner_lock.read_recursive();
        if !owner.is_lock_owner() || owner.unlock_prepared {
            return None;
        }
    }
    let (request_id, cancel) = ctx.async_requests.register();
    let result = {
        let owner = ctx.owner_lock.read_recursive();
        if owner.is_lock_owner() {
            op(ctx, &owner, &cancel)
        } else {
            Err(Error::Restart)
        }
    };
    ctx.async_requests.unregister(request_id);
    encode_ack(&result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_roundtrip() {
        let cases = [
            Error::ReadOnly,
            Error::not_found("img"),
            Error::Busy("held".into()),
            Error::Timeout,
            Error::Restart,
        ];
        for original in cases {
            let wire = WireError::from(&original);
            let back: Error = wire.into();
            assert_eq!(
                std::mem::discriminant(&original),
                std::mem::discriminant(&back)
            );
        }
    }

    #[test]
    fn test_stale_travels_as_restart() {
        let back: Error = WireError::from(&Error::Stale).into();
        assert!(back.is_restart());
    }

    #[test]
    fn test_notify_message_roundtrip() {
        let msg = NotifyMessage::Resize { size: 1 << 30 };
        let raw = encode(&msg);
        let decoded: NotifyMessage = serde_json::from_slice(&raw).unwrap();
        assert!(matches!(decoded, NotifyMessage::Resize { size } if size == 1 << 30));
    }
}
