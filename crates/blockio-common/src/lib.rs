//! blockio-common
//!
//! Shared error, domain types and configuration for the blockio client
//! crates. Nothing in here talks to the object store.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ClientConfig, MAX_ORDER, MIN_ORDER};
pub use error::{Error, Result};
pub use types::{
    Features, ImageFlags, ImageFormat, LockMode, Locker, ParentInfo, ParentSpec, PoolId,
    ProtectionStatus, SnapContext, SnapId, POOL_NONE, SNAP_HEAD,
};
