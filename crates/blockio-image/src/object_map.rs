//! In-memory bitmap of per-object existence states, persisted as one map
//! object per snapshot (head uses its own object).
//!
//! The map is an optimization: I/O paths consult it to skip reads of
//! unallocated objects and maintenance ops to skip deletes. When it cannot
//! be trusted the OBJECT_MAP_INVALID flag is set and everything falls back
//! to asking the store.

use std::sync::Arc;

use blockio_common::{Result, SnapContext, SnapId, SNAP_HEAD};
use blockio_store::Pool;

use crate::object_map_name;

/// Object states tracked per object, one byte each
pub const OBJECT_NONEXISTENT: u8 = 0;
pub const OBJECT_EXISTS: u8 = 1;
pub const OBJECT_PENDING: u8 = 2;

/// Existence map for the currently selected view of one image
#[derive(Debug, Default)]
pub struct ObjectMapCache {
    enabled: bool,
    states: Vec<u8>,
}

impl ObjectMapCache {
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.states.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// State of one object; `None` when the map is disabled or out of range
    #[must_use]
    pub fn get(&self, object_no: u64) -> Option<u8> {
        if !self.enabled {
            return None;
        }
        self.states.get(object_no as usize).copied()
    }

    pub fn set(&mut self, object_no: u64, state: u8) {
        if !self.enabled {
            return;
        }
        if let Some(slot) = self.states.get_mut(object_no as usize) {
            *slot = state;
        }
    }

    /// Grow or shrink to `num_objects`, new slots nonexistent
    pub fn resize(&mut self, num_objects: u64) {
        if self.enabled {
            self.states.resize(num_objects as usize, OBJECT_NONEXISTENT);
        }
    }

    /// Load the map for `snap_id` from the store. A missing map object is
    /// treated as all-nonexistent, which is what a freshly created image
    /// persists anyway.
    pub fn refresh(
        &mut self,
        pool: &Arc<dyn Pool>,
        image_id: &str,
        snap_id: SnapId,
        num_objects: u64,
        feature_on: bool,
    ) -> Result<()> {
        self.enabled = feature_on;
        self.states.clear();
        if !feature_on {
            return Ok(());
        }
        let oid = object_map_name(image_id, snap_id);
        match pool.read(&oid, 0, num_objects.max(1), SNAP_HEAD) {
            Ok(raw) => {
                self.states = raw.to_vec();
                self.states.resize(num_objects as usize, OBJECT_NONEXISTENT);
            }
            Err(e) if e.is_not_found() => {
                self.states = vec![OBJECT_NONEXISTENT; num_objects as usize];
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Persist the current states to the map object of `snap_id`
    pub fn save(&self, pool: &Arc<dyn Pool>, image_id: &str, snap_id: SnapId) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let oid = object_map_name(image_id, snap_id);
        pool.write_full(&oid, &self.states, &SnapContext::default())
    }

    /// Snapshot bookkeeping: persist the head map under the new snapshot's
    /// name so the snapshot view has its own existence record.
    pub fn snapshot_add(
        &self,
        pool: &Arc<dyn Pool>,
        image_id: &str,
        snap_id: SnapId,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.save(pool, image_id, snap_id)
    }

    /// Remove the map object of a deleted snapshot; absence is fine.
    pub fn snapshot_remove(
        &self,
        pool: &Arc<dyn Pool>,
        image_id: &str,
        snap_id: SnapId,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let oid = object_map_name(image_id, snap_id);
        match pool.remove(&oid, &SnapContext::default()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Roll the head map back to the state recorded for `snap_id`
    pub fn rollback(
        &mut self,
        pool: &Arc<dyn Pool>,
        image_id: &str,
        snap_id: SnapId,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let num_objects = self.states.len() as u64;
        self.refresh(pool, image_id, snap_id, num_objects, true)?;
        self.save(pool, image_id, SNAP_HEAD)
    }

    /// Write an all-nonexistent map object sized for a new image
    pub fn initialize(
        pool: &Arc<dyn Pool>,
        image_id: &str,
        num_objects: u64,
    ) -> Result<()> {
        let states = vec![OBJECT_NONEXISTENT; num_objects as usize];
        let oid = object_map_name(image_id, SNAP_HEAD);
        pool.write_full(&oid, &states, &SnapContext::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockio_store::mem::{MemBackend, MemCluster};
    use blockio_store::Cluster;

    fn pool() -> Arc<dyn Pool> {
        let backend = MemBackend::new();
        let id = backend.create_pool("test");
        MemCluster::connect(&backend).pool(id).unwrap()
    }

    #[test]
    fn test_disabled_map_is_inert() {
        let mut map = ObjectMapCache::disabled();
        assert!(!map.enabled());
        map.set(0, OBJECT_EXISTS);
        assert_eq!(map.get(0), None);
    }

    #[test]
    fn test_fresh_map_all_nonexistent() {
        let p = pool();
        let mut map = ObjectMapCache::disabled();
        map.refresh(&p, "img", SNAP_HEAD, 1024, true).unwrap();
        assert_eq!(map.len(), 1024);
        assert!((0..1024).all(|i| map.get(i) == Some(OBJECT_NONEXISTENT)));
    }

    #[test]
    fn test_save_and_reload() {
        let p = pool();
        let mut map = ObjectMapCache::disabled();
        map.refresh(&p, "img", SNAP_HEAD, 8, true).unwrap();
        map.set(3, OBJECT_EXISTS);
        map.save(&p, "img", SNAP_HEAD).unwrap();

        let mut reloaded = ObjectMapCache::disabled();
        reloaded.refresh(&p, "img", SNAP_HEAD, 8, true).unwrap();
        assert_eq!(reloaded.get(3), Some(OBJECT_EXISTS));
        assert_eq!(reloaded.get(2), Some(OBJECT_NONEXISTENT));
    }

    #[test]
    fn test_rollback_restores_snapshot_states() {
        let p = pool();
        let mut map = ObjectMapCache::disabled();
        map.refresh(&p, "img", SNAP_HEAD, 4, true).unwrap();
        map.set(0, OBJECT_EXISTS);
        map.snapshot_add(&p, "img", 7).unwrap();

        map.set(1, OBJECT_EXISTS);
        map.save(&p, "img", SNAP_HEAD).unwrap();

        map.rollback(&p, "img", 7).unwrap();
        assert_eq!(map.get(0), Some(OBJECT_EXISTS));
        assert_eq!(map.get(1), Some(OBJECT_NONEXISTENT));
    }

    #[test]
    fn test_resize_extends_with_nonexistent() {
        let p = pool();
        let mut map = ObjectMapCache::disabled();
        map.refresh(&p, "img", SNAP_HEAD, 2, true).unwrap();
        map.set(1, OBJECT_EXISTS);
        map.resize(4);
        assert_eq!(map.len(), 4);
        assert_eq!(map.get(1), Some(OBJECT_EXISTS));
        assert_eq!(map.get(3), Some(OBJECT_NONEXISTENT));
        map.resize(1);
        assert_eq!(map.len(), 1);
    }
}
