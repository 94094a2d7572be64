//! Typed client for the persisted metadata objects (header, directory,
//! children set, id objects).
//!
//! Modern-format metadata lives in the header object's omap as one JSON
//! record per key; the directory object maps names to ids in both
//! directions; the per-pool children set is updated with compare-and-swap
//! so clone creation races resolve at the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use blockio_common::{
    Error, Features, ImageFlags, Locker, ParentInfo, ParentSpec, ProtectionStatus, Result,
    SnapContext, SnapId, SNAP_HEAD,
};
use blockio_store::{LockInfo, Pool};

use crate::legacy::LegacyHeader;
use crate::{legacy_header_name, CHILDREN_OID, DIRECTORY_OID, LOCK_NAME};

const KEY_SIZE: &str = "size";
const KEY_ORDER: &str = "order";
const KEY_OBJECT_PREFIX: &str = "object_prefix";
const KEY_FEATURES: &str = "features";
const KEY_FLAGS: &str = "flags";
const KEY_SNAP_SEQ: &str = "snap_seq";
const KEY_PARENT: &str = "parent";
const KEY_STRIPE_UNIT: &str = "stripe_unit";
const KEY_STRIPE_COUNT: &str = "stripe_count";
const SNAPSHOT_PREFIX: &str = "snapshot.";
const USER_PREFIX: &str = "user.";

fn snapshot_key(snap_id: SnapId) -> String {
    format!("{SNAPSHOT_PREFIX}{snap_id:016x}")
}

fn user_key(key: &str) -> String {
    format!("{USER_PREFIX}{key}")
}

fn dir_name_key(name: &str) -> String {
    format!("name.{name}")
}

fn dir_id_key(id: &str) -> String {
    format!("id.{id}")
}

/// Snapshot record as persisted on the header object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: SnapId,
    pub name: String,
    pub size: u64,
    pub parent: Option<ParentInfo>,
    pub protection: ProtectionStatus,
    pub flags: ImageFlags,
}

/// Everything a refresh reads in its first pass
#[derive(Debug, Clone)]
pub struct MutableMetadata {
    pub size: u64,
    pub features: Features,
    /// Raw feature bits as persisted, including ones this build may not know
    pub raw_features: u64,
    pub lockers: Vec<Locker>,
    pub exclusive_locked: bool,
    pub lock_tag: String,
    pub snapc: SnapContext,
    pub parent: Option<ParentInfo>,
}

/// Typed metadata operations over one pool
pub struct MetaClient {
    pool: Arc<dyn Pool>,
}

impl MetaClient {
    pub fn new(pool: Arc<dyn Pool>) -> Self {
        Self { pool }
    }

    fn get_json<T: DeserializeOwned>(&self, oid: &str, key: &str) -> Result<Option<T>> {
        match self.pool.omap_get(oid, key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).map_err(|e| {
                Error::corrupt(format!("{oid}/{key}: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    fn require_json<T: DeserializeOwned>(&self, oid: &str, key: &str) -> Result<T> {
        self.get_json(oid, key)?
            .ok_or_else(|| Error::corrupt(format!("{oid}: missing {key}")))
    }

    fn set_json<T: Serialize>(&self, oid: &str, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value).map_err(|e| Error::corrupt(e.to_string()))?;
        self.pool
            .omap_set(oid, &[(key.to_string(), Bytes::from(raw))])
    }

    // ── header: creation and scalar metadata ──────────────────────────────

    /// Initialize a modern-format header object
    pub fn create_image(
        &self,
        header_oid: &str,
        size: u64,
        order: u8,
        features: Features,
        object_prefix: &str,
    ) -> Result<()> {
        self.pool.create_exclusive(header_oid)?;
        self.set_json(header_oid, KEY_SIZE, &size)?;
        self.set_json(header_oid, KEY_ORDER, &order)?;
        self.set_json(header_oid, KEY_OBJECT_PREFIX, &object_prefix)?;
        self.set_json(header_oid, KEY_FEATURES, &features.bits())?;
        self.set_json(header_oid, KEY_FLAGS, &ImageFlags::empty())?;
        self.set_json(header_oid, KEY_SNAP_SEQ, &0u64)?;
        Ok(())
    }

    /// First refresh pass: scalars, lockers, snap context, head parent
    pub fn get_mutable_metadata(&self, header_oid: &str) -> Result<MutableMetadata> {
        let size: u64 = self.require_json(header_oid, KEY_SIZE)?;
        let raw_features: u64 = self.require_json(header_oid, KEY_FEATURES)?;
        let features = Features::from_bits_truncate(raw_features);
        let parent: Option<ParentInfo> = self.get_json(header_oid, KEY_PARENT)?;

        let seq: SnapId = self.require_json(header_oid, KEY_SNAP_SEQ)?;
        let mut snaps: Vec<SnapId> = self
            .snapshot_ids(header_oid)?
            .into_iter()
            .collect();
        snaps.sort_unstable_by(|a, b| b.cmp(a));
        let snapc = SnapContext { seq, snaps };

        let LockInfo { mode, tag, lockers } = self.pool.lock_info(header_oid, LOCK_NAME)?;
        Ok(MutableMetadata {
            size,
            features,
            raw_features,
            lockers,
            exclusive_locked: matches!(mode, Some(blockio_common::LockMode::Exclusive)),
            lock_tag: tag,
            snapc,
            parent,
        })
    }

    pub fn get_order(&self, header_oid: &str) -> Result<u8> {
        self.require_json(header_oid, KEY_ORDER)
    }

    pub fn get_object_prefix(&self, header_oid: &str) -> Result<String> {
        self.require_json(header_oid, KEY_OBJECT_PREFIX)
    }

    pub fn set_size(&self, header_oid: &str, size: u64) -> Result<()> {
        self.set_json(header_oid, KEY_SIZE, &size)
    }

    pub fn set_features(&self, header_oid: &str, features: u64, mask: u64) -> Result<()> {
        let current: u64 = self.require_json(header_oid, KEY_FEATURES)?;
        let updated = (current & !mask) | (features & mask);
        self.set_json(header_oid, KEY_FEATURES, &updated)
    }

    /// Overwrite raw feature bits; only used to fabricate incompatible
    /// headers in tests and repair tooling.
    pub fn set_raw_features(&self, header_oid: &str, bits: u64) -> Result<()> {
        self.set_json(header_oid, KEY_FEATURES, &bits)
    }

    pub fn get_stripe_params(&self, header_oid: &str) -> Result<(u64, u64)> {
        let unit: u64 = self.get_json(header_oid, KEY_STRIPE_UNIT)?.unwrap_or(0);
        let count: u64 = self.get_json(header_oid, KEY_STRIPE_COUNT)?.unwrap_or(0);
        Ok((unit, count))
    }

    pub fn set_stripe_params(&self, header_oid: &str, unit: u64, count: u64) -> Result<()> {
        self.set_json(header_oid, KEY_STRIPE_UNIT, &unit)?;
        self.set_json(header_oid, KEY_STRIPE_COUNT, &count)
    }

    // ── flags ─────────────────────────────────────────────────────────────

    /// Masked flag update on the head or one snapshot
    pub fn set_flags(
        &self,
        header_oid: &str,
        snap_id: SnapId,
        flags: ImageFlags,
        mask: ImageFlags,
    ) -> Result<()> {
        if snap_id == SNAP_HEAD {
            let current: ImageFlags = self
                .get_json(header_oid, KEY_FLAGS)?
                .unwrap_or_else(ImageFlags::empty);
            let updated = (current - mask) | (flags & mask);
            self.set_json(header_oid, KEY_FLAGS, &updated)
        } else {
            let mut rec = self.get_snapshot(header_oid, snap_id)?;
            rec.flags = (rec.flags - mask) | (flags & mask);
            self.set_json(header_oid, &snapshot_key(snap_id), &rec)
        }
    }

    /// Head flags plus per-snapshot flags in snap-context order
    pub fn get_flags(
        &self,
        header_oid: &str,
        snap_ids: &[SnapId],
    ) -> Result<(ImageFlags, Vec<ImageFlags>)> {
        let head: ImageFlags = self
            .get_json(header_oid, KEY_FLAGS)?
            .unwrap_or_else(ImageFlags::empty);
        let mut per_snap = Vec::with_capacity(snap_ids.len());
        for &snap_id in snap_ids {
            per_snap.push(self.get_snapshot(header_oid, snap_id)?.flags);
        }
        Ok((head, per_snap))
    }

    // ── snapshots ─────────────────────────────────────────────────────────

    fn snapshot_ids(&self, header_oid: &str) -> Result<Vec<SnapId>> {
        let entries = self.pool.omap_list(header_oid, SNAPSHOT_PREFIX, 0)?;
        let mut ids = Vec::new();
        for (key, _) in entries {
            let Some(hex) = key.strip_prefix(SNAPSHOT_PREFIX) else {
                break; // omap is sorted; past the prefix range
            };
            let id = SnapId::from_str_radix(hex, 16)
                .map_err(|_| Error::corrupt(format!("bad snapshot key {key}")))?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn get_snapshot(&self, header_oid: &str, snap_id: SnapId) -> Result<SnapshotRecord> {
        self.get_json(header_oid, &snapshot_key(snap_id))?
            .ok_or_else(|| Error::not_found(format!("snapshot {snap_id}")))
    }

    /// Full records in snap-context order; `NotFound` when a record vanished
    /// mid-read (the caller restarts its refresh pass).
    pub fn snapshot_list(
        &self,
        header_oid: &str,
        snap_ids: &[SnapId],
    ) -> Result<Vec<SnapshotRecord>> {
        snap_ids
            .iter()
            .map(|&id| self.get_snapshot(header_oid, id))
            .collect()
    }

    /// Register a snapshot on the header. When `held_cookie` is set the
    /// update is refused with `Stale` unless this client still holds the
    /// cooperative lock — that keeps object-map bookkeeping linearized.
    pub fn snapshot_add(
        &self,
        header_oid: &str,
        record: &SnapshotRecord,
        held_cookie: Option<&str>,
    ) -> Result<()> {
        if let Some(cookie) = held_cookie {
            self.pool.assert_locked(header_oid, LOCK_NAME, cookie)?;
        }
        for id in self.snapshot_ids(header_oid)? {
            if self.get_snapshot(header_oid, id)?.name == record.name {
                return Err(Error::AlreadyExists(record.name.clone()));
            }
        }
        self.set_json(header_oid, &snapshot_key(record.id), record)?;
        self.set_json(header_oid, KEY_SNAP_SEQ, &record.id)
    }

    pub fn snapshot_remove(&self, header_oid: &str, snap_id: SnapId) -> Result<()> {
        self.pool.omap_remove(header_oid, &snapshot_key(snap_id))
    }

    pub fn get_protection_status(
        &self,
        header_oid: &str,
        snap_id: SnapId,
    ) -> Result<ProtectionStatus> {
        Ok(self.get_snapshot(header_oid, snap_id)?.protection)
    }

    pub fn set_protection_status(
        &self,
        header_oid: &str,
        snap_id: SnapId,
        status: ProtectionStatus,
    ) -> Result<()> {
        let mut rec = self.get_snapshot(header_oid, snap_id)?;
        rec.protection = status;
        self.set_json(header_oid, &snapshot_key(snap_id), &rec)
    }

    // ── parent edge ───────────────────────────────────────────────────────

    pub fn set_parent(&self, header_oid: &str, parent: &ParentInfo) -> Result<()> {
        self.set_json(header_oid, KEY_PARENT, parent)
    }

    pub fn remove_parent(&self, header_oid: &str) -> Result<()> {
        self.pool.omap_remove(header_oid, KEY_PARENT)
    }

    // ── children set (per pool, CAS-updated) ──────────────────────────────

    pub fn get_children(&self, spec: &ParentSpec) -> Result<Vec<String>> {
        match self.pool.omap_get(CHILDREN_OID, &spec.children_key()) {
            Ok(Some(raw)) => {
                serde_json::from_slice(&raw).map_err(|e| Error::corrupt(e.to_string()))
            }
            Ok(None) => Ok(Vec::new()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub fn add_child(&self, spec: &ParentSpec, child_id: &str) -> Result<()> {
        let key = spec.children_key();
        loop {
            let current = match self.pool.omap_get(CHILDREN_OID, &key) {
                Ok(v) => v,
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            let mut ids: Vec<String> = match &current {
                Some(raw) => {
                    serde_json::from_slice(raw).map_err(|e| Error::corrupt(e.to_string()))?
                }
                None => Vec::new(),
            };
            if ids.iter().any(|id| id == child_id) {
                return Ok(());
            }
            ids.push(child_id.to_string());
            ids.sort_unstable();
            let updated = serde_json::to_vec(&ids).map_err(|e| Error::corrupt(e.to_string()))?;
            match self.pool.omap_compare_and_swap(
                CHILDREN_OID,
                &key,
                current.as_deref(),
                Some(&updated),
            ) {
                Ok(()) => return Ok(()),
                Err(Error::Stale) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn remove_child(&self, spec: &ParentSpec, child_id: &str) -> Result<()> {
        let key = spec.children_key();
        loop {
            let current = match self.pool.omap_get(CHILDREN_OID, &key) {
                Ok(Some(v)) => v,
                Ok(None) => return Err(Error::not_found(format!("children of {key}"))),
                Err(e) => return Err(e),
            };
            let mut ids: Vec<String> =
                serde_json::from_slice(&current).map_err(|e| Error::corrupt(e.to_string()))?;
            let before = ids.len();
            ids.retain(|id| id != child_id);
            if ids.len() == before {
                return Err(Error::not_found(format!("child {child_id}")));
            }
            let updated = if ids.is_empty() {
                None
            } else {
                Some(serde_json::to_vec(&ids).map_err(|e| Error::corrupt(e.to_string()))?)
            };
            match self.pool.omap_compare_and_swap(
                CHILDREN_OID,
                &key,
                Some(&current),
                updated.as_deref(),
            ) {
                Ok(()) => return Ok(()),
                Err(Error::Stale) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    // ── directory ─────────────────────────────────────────────────────────

    pub fn dir_get_id(&self, name: &str) -> Result<String> {
        match self.pool.omap_get(DIRECTORY_OID, &dir_name_key(name)) {
            Ok(Some(raw)) => Ok(String::from_utf8_lossy(&raw).into_owned()),
            Ok(None) => Err(Error::not_found(name)),
            Err(e) if e.is_not_found() => Err(Error::not_found(name)),
            Err(e) => Err(e),
        }
    }

    pub fn dir_get_name(&self, id: &str) -> Result<String> {
        match self.pool.omap_get(DIRECTORY_OID, &dir_id_key(id)) {
            Ok(Some(raw)) => Ok(String::from_utf8_lossy(&raw).into_owned()),
            Ok(None) => Err(Error::not_found(id)),
            Err(e) if e.is_not_found() => Err(Error::not_found(id)),
            Err(e) => Err(e),
        }
    }

    pub fn dir_add_image(&self, name: &str, id: &str) -> Result<()> {
        if self.dir_get_id(name).is_ok() {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        self.pool.omap_set(
            DIRECTORY_OID,
            &[
                (dir_name_key(name), Bytes::copy_from_slice(id.as_bytes())),
                (dir_id_key(id), Bytes::copy_from_slice(name.as_bytes())),
            ],
        )
    }

    pub fn dir_remove_image(&self, name: &str, id: &str) -> Result<()> {
        self.dir_get_id(name)?;
        self.pool.omap_remove(DIRECTORY_OID, &dir_name_key(name))?;
        self.pool.omap_remove(DIRECTORY_OID, &dir_id_key(id))
    }

    pub fn dir_rename_image(&self, src: &str, dst: &str, id: &str) -> Result<()> {
        let current = self.dir_get_id(src)?;
        if current != id {
            return Err(Error::Stale);
        }
        if self.dir_get_id(dst).is_ok() {
            return Err(Error::AlreadyExists(dst.to_string()));
        }
        self.pool.omap_remove(DIRECTORY_OID, &dir_name_key(src))?;
        self.pool.omap_set(
            DIRECTORY_OID,
            &[
                (dir_name_key(dst), Bytes::copy_from_slice(id.as_bytes())),
                (dir_id_key(id), Bytes::copy_from_slice(dst.as_bytes())),
            ],
        )
    }

    /// All modern-format image names
    pub fn dir_list(&self) -> Result<Vec<String>> {
        let entries = match self.pool.omap_list(DIRECTORY_OID, "name.", 0) {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(entries
            .into_iter()
            .map_while(|(key, _)| key.strip_prefix("name.").map(str::to_string))
            .collect())
    }

    /// Legacy image names registered in the directory tmap
    pub fn legacy_dir_list(&self) -> Result<Vec<String>> {
        self.pool.tmap_list(DIRECTORY_OID)
    }

    pub fn legacy_dir_add(&self, name: &str) -> Result<()> {
        self.pool.tmap_set(DIRECTORY_OID, name)
    }

    pub fn legacy_dir_remove(&self, name: &str) -> Result<()> {
        self.pool.tmap_remove(DIRECTORY_OID, name)
    }

    // ── id objects ────────────────────────────────────────────────────────

    pub fn set_id(&self, id_oid: &str, id: &str) -> Result<()> {
        self.pool
            .write_full(id_oid, id.as_bytes(), &SnapContext::default())
    }

    pub fn get_id(&self, id_oid: &str) -> Result<String> {
        let raw = self.pool.read(id_oid, 0, 4096, SNAP_HEAD)?;
        if raw.is_empty() {
            return Err(Error::corrupt(format!("{id_oid}: empty id object")));
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    // ── user metadata ─────────────────────────────────────────────────────

    pub fn metadata_get(&self, header_oid: &str, key: &str) -> Result<Option<String>> {
        self.get_json(header_oid, &user_key(key))
    }

    pub fn metadata_set(&self, header_oid: &str, key: &str, value: &str) -> Result<()> {
        self.set_json(header_oid, &user_key(key), &value)
    }

    pub fn metadata_remove(&self, header_oid: &str, key: &str) -> Result<()> {
        self.pool.omap_remove(header_oid, &user_key(key))
    }

    pub fn metadata_list(&self, header_oid: &str) -> Result<BTreeMap<String, String>> {
        let entries = self.pool.omap_list(header_oid, USER_PREFIX, 0)?;
        let mut pairs = BTreeMap::new();
        for (key, raw) in entries {
            let Some(user) = key.strip_prefix(USER_PREFIX) else {
                break;
            };
            let value: String =
                serde_json::from_slice(&raw).map_err(|e| Error::corrupt(e.to_string()))?;
            pairs.insert(user.to_string(), value);
        }
        Ok(pairs)
    }

    // ── legacy header blob ────────────────────────────────────────────────

    pub fn read_legacy_header(&self, image_name: &str) -> Result<LegacyHeader> {
        let oid = legacy_header_name(image_name);
        let mut blob = Vec::new();
        let mut off = 0u64;
        loop {
            let chunk = self.pool.read(&oid, off, 4096, SNAP_HEAD)?;
            if chunk.is_empty() {
                break;
            }
            off += chunk.len() as u64;
            let full = chunk.len() == 4096;
            blob.extend_from_slice(&chunk);
            if !full {
                break;
            }
        }
        LegacyHeader::decode(&blob)
    }

    pub fn write_legacy_header(&self, image_name: &str, header: &LegacyHeader) -> Result<()> {
        let oid = legacy_header_name(image_name);
        self.pool
            .write_full(&oid, &header.encode(), &SnapContext::default())
    }

    pub fn legacy_snapshot_add(
        &self,
        image_name: &str,
        snap_id: SnapId,
        snap_name: &str,
    ) -> Result<()> {
        let mut header = self.read_legacy_header(image_name)?;
        if header.snaps.iter().any(|s| s.name == snap_name) {
            return Err(Error::AlreadyExists(snap_name.to_string()));
        }
        header.snaps.push(crate::legacy::LegacySnap {
            id: snap_id,
            image_size: header.image_size,
            name: snap_name.to_string(),
        });
        header.snap_seq = snap_id;
        self.write_legacy_header(image_name, &header)
    }

    pub fn legacy_snapshot_remove(&self, image_name: &str, snap_name: &str) -> Result<()> {
        let mut header = self.read_legacy_header(image_name)?;
        let before = header.snaps.len();
        header.snaps.retain(|s| s.name != snap_name);
        if header.snaps.len() == before {
            return Err(Error::not_found(snap_name));
        }
        self.write_legacy_header(image_name, &header)
    }

    pub fn set_legacy_size(&self, image_name: &str, size: u64) -> Result<()> {
        let mut header = self.read_legacy_header(image_name)?;
        header.image_size = size;
        self.write_legacy_header(image_name, &header)
    }

    /// Remove of a sub-object on a cleanup path: absent objects only warn
    pub fn remove_ignore_missing(&self, oid: &str) -> Result<()> {
        match self.pool.remove(oid, &SnapContext::default()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(oid, error = %e, "failed to remove object");
                Err(e)
            }
        }
    }

    pub fn pool(&self) -> &Arc<dyn Pool> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockio_store::mem::{MemBackend, MemCluster};
    use blockio_store::Cluster;

    fn client() -> MetaClient {
        let backend = MemBackend::new();
        let id = backend.create_pool("meta");
        MetaClient::new(MemCluster::connect(&backend).pool(id).unwrap())
    }

    fn record(id: SnapId, name: &str) -> SnapshotRecord {
        SnapshotRecord {
            id,
            name: name.to_string(),
            size: 1 << 22,
            parent: None,
            protection: ProtectionStatus::Unprotected,
            flags: ImageFlags::empty(),
        }
    }

    #[test]
    fn test_create_and_read_header() {
        let meta = client();
        meta.create_image("hdr", 1 << 26, 22, Features::LAYERING, "blockio_data.abc")
            .unwrap();

        let mm = meta.get_mutable_metadata("hdr").unwrap();
        assert_eq!(mm.size, 1 << 26);
        assert_eq!(mm.features, Features::LAYERING);
        assert!(mm.snapc.snaps.is_empty());
        assert_eq!(mm.snapc.seq, 0);
        assert!(mm.parent.is_none());
        assert_eq!(meta.get_order("hdr").unwrap(), 22);
    }

    #[test]
    fn test_create_header_twice_fails() {
        let meta = client();
        meta.create_image("hdr", 4096, 12, Features::empty(), "p").unwrap();
        assert!(matches!(
            meta.create_image("hdr", 4096, 12, Features::empty(), "p"),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_snapshot_add_list_remove() {
        let meta = client();
        meta.create_image("hdr", 1 << 22, 22, Features::empty(), "p")
            .unwrap();

        meta.snapshot_add("hdr", &record(1, "a"), None).unwrap();
        meta.snapshot_add("hdr", &record(3, "b"), None).unwrap();

        let mm = meta.get_mutable_metadata("hdr").unwrap();
        assert_eq!(mm.snapc.seq, 3);
        assert_eq!(mm.snapc.snaps, vec![3, 1]);
        assert!(mm.snapc.is_valid());

        // duplicate name
        assert!(matches!(
            meta.snapshot_add("hdr", &record(5, "a"), None),
            Err(Error::AlreadyExists(_))
        ));

        let records = meta.snapshot_list("hdr", &mm.snapc.snaps).unwrap();
        assert_eq!(records[0].name, "b");
        assert_eq!(records[1].name, "a");

        meta.snapshot_remove("hdr", 1).unwrap();
        let mm = meta.get_mutable_metadata("hdr").unwrap();
        assert_eq!(mm.snapc.snaps, vec![3]);
        // list against the stale id set reports the race
        assert!(meta.snapshot_list("hdr", &[3, 1]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_protection_status_transitions() {
        let meta = client();
        meta.create_image("hdr", 1 << 22, 22, Features::LAYERING, "p")
            .unwrap();
        meta.snapshot_add("hdr", &record(1, "s"), None).unwrap();

        assert_eq!(
            meta.get_protection_status("hdr", 1).unwrap(),
            ProtectionStatus::Unprotected
        );
        meta.set_protection_status("hdr", 1, ProtectionStatus::Protected)
            .unwrap();
        assert_eq!(
            meta.get_protection_status("hdr", 1).unwrap(),
            ProtectionStatus::Protected
        );
    }

    #[test]
    fn test_children_set_roundtrip() {
        let meta = client();
        let spec = ParentSpec::new(1, "parent", 4);

        assert!(meta.get_children(&spec).unwrap().is_empty());
        meta.add_child(&spec, "child1").unwrap();
        meta.add_child(&spec, "child2").unwrap();
        meta.add_child(&spec, "child1").unwrap(); // idempotent
        assert_eq!(meta.get_children(&spec).unwrap(), vec!["child1", "child2"]);

        meta.remove_child(&spec, "child1").unwrap();
        assert_eq!(meta.get_children(&spec).unwrap(), vec!["child2"]);
        meta.remove_child(&spec, "child2").unwrap();
        assert!(meta.get_children(&spec).unwrap().is_empty());
        assert!(meta.remove_child(&spec, "child2").unwrap_err().is_not_found());
    }

    #[test]
    fn test_directory_rename() {
        let meta = client();
        meta.dir_add_image("a", "id1").unwrap();
        assert_eq!(meta.dir_get_id("a").unwrap(), "id1");
        assert_eq!(meta.dir_get_name("id1").unwrap(), "a");

        meta.dir_rename_image("a", "b", "id1").unwrap();
        assert!(meta.dir_get_id("a").is_err());
        assert_eq!(meta.dir_get_id("b").unwrap(), "id1");
        assert_eq!(meta.dir_get_name("id1").unwrap(), "b");
    }

    #[test]
    fn test_user_metadata() {
        let meta = client();
        meta.create_image("hdr", 4096, 12, Features::empty(), "p").unwrap();
        meta.metadata_set("hdr", "owner", "ops").unwrap();
        meta.metadata_set("hdr", "tier", "gold").unwrap();

        assert_eq!(meta.metadata_get("hdr", "owner").unwrap().unwrap(), "ops");
        let all = meta.metadata_list("hdr").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["tier"], "gold");

        meta.metadata_remove("hdr", "tier").unwrap();
        assert!(meta.metadata_get("hdr", "tier").unwrap().is_none());
    }

    #[test]
    fn test_legacy_snapshot_ops() {
        let meta = client();
        let header = LegacyHeader::new("blk.1".to_string(), 1 << 22, 22);
        meta.write_legacy_header("img", &header).unwrap();

        meta.legacy_snapshot_add("img", 1, "s1").unwrap();
        assert!(matches!(
            meta.legacy_snapshot_add("img", 2, "s1"),
            Err(Error::AlreadyExists(_))
        ));

        let header = meta.read_legacy_header("img").unwrap();
        assert_eq!(header.snap_seq, 1);
        assert_eq!(header.snaps.len(), 1);

        meta.legacy_snapshot_remove("img", "s1").unwrap();
        assert!(meta.read_legacy_header("img").unwrap().snaps.is_empty());
    }
}
