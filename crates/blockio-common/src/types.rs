//! Core domain types shared by the store and image layers.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Pool identifier assigned by the object store
pub type PoolId = i64;

/// Snapshot identifier, monotonically allocated per pool by the object store
pub type SnapId = u64;

/// Sentinel snapshot id meaning "the writable head of the image"
pub const SNAP_HEAD: SnapId = u64::MAX;

/// Pool id meaning "no pool" (e.g. an absent parent edge)
pub const POOL_NONE: PoolId = -1;

bitflags! {
    /// Image feature bits persisted on the header object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Features: u64 {
        const LAYERING       = 1 << 0;
        const STRIPING_V2    = 1 << 1;
        const EXCLUSIVE_LOCK = 1 << 2;
        const OBJECT_MAP     = 1 << 3;
        const FAST_DIFF      = 1 << 4;
    }
}

impl Features {
    /// Features a reader must understand to open the image at all
    pub const INCOMPATIBLE: Features = Features::LAYERING.union(Features::STRIPING_V2);

    /// Features that may be toggled after image creation
    pub const MUTABLE: Features = Features::EXCLUSIVE_LOCK
        .union(Features::OBJECT_MAP)
        .union(Features::FAST_DIFF);

    /// Check the inter-feature implications enforced on create and enable:
    /// FAST_DIFF requires OBJECT_MAP, OBJECT_MAP requires EXCLUSIVE_LOCK.
    pub fn validate(self) -> Result<(), &'static str> {
        if self.contains(Features::FAST_DIFF) && !self.contains(Features::OBJECT_MAP) {
            return Err("fast-diff requires the object map");
        }
        if self.contains(Features::OBJECT_MAP) && !self.contains(Features::EXCLUSIVE_LOCK) {
            return Err("object map requires the exclusive lock");
        }
        Ok(())
    }
}

bitflags! {
    /// Per-image / per-snapshot state flags persisted on the header object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ImageFlags: u64 {
        const OBJECT_MAP_INVALID = 1 << 0;
        const FAST_DIFF_INVALID  = 1 << 1;
    }
}

impl Default for ImageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// On-disk image format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFormat {
    /// Fixed-layout header blob named after the image; no features, no
    /// flags, no parent support.
    Legacy,
    /// Id-indirected header object with omap metadata.
    Modern,
}

impl ImageFormat {
    #[must_use]
    pub fn is_legacy(self) -> bool {
        matches!(self, ImageFormat::Legacy)
    }
}

/// Identity of a parent snapshot: (pool, image id, snap id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentSpec {
    pub pool_id: PoolId,
    pub image_id: String,
    pub snap_id: SnapId,
}

impl ParentSpec {
    pub fn new(pool_id: PoolId, image_id: impl Into<String>, snap_id: SnapId) -> Self {
        Self {
            pool_id,
            image_id: image_id.into(),
            snap_id,
        }
    }

    /// Key used in the per-pool children set
    #[must_use]
    pub fn children_key(&self) -> String {
        format!("{}/{}/{}", self.pool_id, self.image_id, self.snap_id)
    }
}

/// Parent edge stored on a child image: identity plus the byte overlap
/// still readable through the parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInfo {
    pub spec: ParentSpec,
    pub overlap: u64,
}

/// Snapshot protection state controlling clone-parent eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionStatus {
    Unprotected,
    Unprotecting,
    Protected,
}

impl ProtectionStatus {
    /// PROTECTED and UNPROTECTING both block snapshot removal.
    #[must_use]
    pub fn prevents_removal(self) -> bool {
        !matches!(self, ProtectionStatus::Unprotected)
    }
}

/// The ordered set of snapshot ids that tags every write, newest first.
/// The object store uses it for object-level copy-on-write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapContext {
    /// Highest snapshot id ever issued for this image
    pub seq: SnapId,
    /// Live snapshot ids in descending order
    pub snaps: Vec<SnapId>,
}

impl SnapContext {
    /// A context is well-formed when ids are strictly descending and none
    /// exceeds the sequence number.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let mut prev = self.seq;
        for (i, &snap) in self.snaps.iter().enumerate() {
            if snap > self.seq || (i > 0 && snap >= prev) {
                return false;
            }
            prev = snap;
        }
        true
    }
}

/// Advisory lock mode on an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One holder of an advisory lock on the header object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locker {
    /// Stable client identity assigned by the store
    pub client: String,
    /// Caller-chosen token distinguishing acquisitions
    pub cookie: String,
    /// Network address of the holder
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_implications() {
        assert!(Features::empty().validate().is_ok());
        assert!(Features::LAYERING.validate().is_ok());
        assert!(
            (Features::EXCLUSIVE_LOCK | Features::OBJECT_MAP | Features::FAST_DIFF)
                .validate()
                .is_ok()
        );
        assert!(Features::OBJECT_MAP.validate().is_err());
        assert!((Features::FAST_DIFF | Features::OBJECT_MAP).validate().is_err());
        assert!(
            (Features::FAST_DIFF | Features::EXCLUSIVE_LOCK)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_snap_context_validity() {
        let snapc = SnapContext {
            seq: 5,
            snaps: vec![5, 3, 1],
        };
        assert!(snapc.is_valid());

        let unordered = SnapContext {
            seq: 5,
            snaps: vec![3, 5],
        };
        assert!(!unordered.is_valid());

        let overflow = SnapContext {
            seq: 2,
            snaps: vec![4],
        };
        assert!(!overflow.is_valid());

        assert!(SnapContext::default().is_valid());
    }

    #[test]
    fn test_children_key_roundtrip_identity() {
        let a = ParentSpec::new(1, "abc", 4);
        let b = ParentSpec::new(1, "abc", 4);
        assert_eq!(a.children_key(), b.children_key());
        assert_ne!(a.children_key(), ParentSpec::new(1, "abc", 5).children_key());
    }
}
