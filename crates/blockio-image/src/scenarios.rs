//! Cross-module scenarios driven over the in-memory store: image
//! lifecycle, clone chains, lock hand-off between clients, rollback and
//! failure injection.

use std::sync::Arc;

use blockio_common::{ClientConfig, Error, Features, ImageFormat};
use blockio_store::mem::{MemBackend, MemCluster};
use blockio_store::Cluster;

use crate::admin;
use crate::image::ImageCtx;
use crate::maintenance::NoProgress;
use crate::object_map::OBJECT_NONEXISTENT;
use crate::{admin::CreateOptions, header_name, id_obj_name};

fn test_config() -> ClientConfig {
    ClientConfig {
        request_lock_backoff: std::time::Duration::from_millis(10),
        ..ClientConfig::default()
    }
}

fn setup() -> (Arc<MemBackend>, Arc<dyn Cluster>, blockio_common::PoolId) {
    let backend = MemBackend::new();
    let pool_id = backend.create_pool("blockpool");
    let cluster: Arc<dyn Cluster> = MemCluster::connect(&backend);
    (backend, cluster, pool_id)
}

fn create_image(
    cluster: &Arc<dyn Cluster>,
    pool_id: blockio_common::PoolId,
    name: &str,
    size: u64,
    order: u8,
    features: Features,
) {
    let opts = CreateOptions {
        format: Some(ImageFormat::Modern),
        order,
        features: Some(features),
        ..Default::default()
    };
    admin::create(cluster, pool_id, name, size, &opts, &test_config()).unwrap();
}

#[test]
fn test_create_open_read_zero() {
    let (_backend, cluster, pool_id) = setup();
    create_image(
        &cluster,
        pool_id,
        "img",
        4 << 30,
        22,
        Features::LAYERING
            | Features::EXCLUSIVE_LOCK
            | Features::OBJECT_MAP
            | Features::FAST_DIFF,
    );

    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();
    let data = img.read(0, 4096).unwrap();
    assert_eq!(data.len(), 4096);
    assert!(data.iter().all(|&b| b == 0));

    {
        let snap = img.snap_lock.read();
        assert_eq!(snap.object_map.len(), 1024);
        assert!((0..1024).all(|i| snap.object_map.get(i) == Some(OBJECT_NONEXISTENT)));
    }

    let info = img.info().unwrap();
    assert_eq!(info.size, 4 << 30);
    assert_eq!(info.num_objects, 1024);
    assert_eq!(info.order, 22);
    img.close().unwrap();
}

#[test]
fn test_read_write_boundaries() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 64 * 1024, 12, Features::empty());
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();
    let size = img.size().unwrap();

    // zero-length read at the end is valid
    assert_eq!(img.read(size, 0).unwrap().len(), 0);
    // read starting past the end is not
    assert!(matches!(img.read(size, 1), Err(Error::Invalid(_))));
    // reads spanning the end are clipped to the in-range prefix
    img.write(size - 512, &[7u8; 512]).unwrap();
    let tail = img.read(size - 512, 4096).unwrap();
    assert_eq!(tail.len(), 512);
    assert!(tail.iter().all(|&b| b == 7));
    // writes are clipped the same way
    assert_eq!(img.write(size - 256, &[1u8; 1024]).unwrap(), 256);

    img.close().unwrap();
}

#[test]
fn test_write_at_snapshot_selection_fails() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 64 * 1024, 12, Features::empty());
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();
    img.snap_create("s").unwrap();
    img.snap_set(Some("s")).unwrap();

    assert!(matches!(img.write(0, b"x"), Err(Error::ReadOnly)));
    assert!(matches!(img.discard(0, 4096), Err(Error::ReadOnly)));
    // reads still work
    assert_eq!(img.read(0, 16).unwrap().len(), 16);

    img.snap_set(None).unwrap();
    img.write(0, b"x").unwrap();
    img.close().unwrap();
}

#[test]
fn test_snap_create_remove_roundtrip() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 64 * 1024, 12, Features::empty());
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();

    assert!(img.snap_list().unwrap().is_empty());
    img.snap_create("s").unwrap();
    assert!(matches!(img.snap_create("s"), Err(Error::AlreadyExists(_))));
    assert!(img.snap_exists("s").unwrap());

    img.snap_remove("s").unwrap();
    assert!(img.snap_list().unwrap().is_empty());
    assert!(img.snap_remove("s").unwrap_err().is_not_found());
    img.close().unwrap();
}

#[test]
fn test_clone_chain_and_unprotect_busy() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "parent", 1 << 30, 22, Features::LAYERING);

    let parent = ImageCtx::open(&cluster, pool_id, "parent", None, false, test_config()).unwrap();
    parent.snap_create("s").unwrap();

    // children can only hang off protected snapshots
    let opts = CreateOptions {
        features: Some(Features::LAYERING),
        ..Default::default()
    };
    let err = admin::clone(
        &cluster, pool_id, "parent", "s", pool_id, "child", &opts, &test_config(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));

    parent.snap_protect("s").unwrap();
    assert!(parent.snap_is_protected("s").unwrap());
    admin::clone(
        &cluster, pool_id, "parent", "s", pool_id, "child", &opts, &test_config(),
    )
    .unwrap();

    let child = ImageCtx::open(&cluster, pool_id, "child", None, false, test_config()).unwrap();
    assert_eq!(child.size().unwrap(), 1 << 30);
    assert_eq!(child.overlap().unwrap(), 1 << 30);
    let (_, pname, psnap) = child.parent_info().unwrap();
    assert_eq!(pname, "parent");
    assert_eq!(psnap, "s");

    child.write(0, b"hello").unwrap();
    assert_eq!(&child.read(0, 5).unwrap()[..], b"hello");

    // the parent view stays untouched
    let parent_at_s =
        ImageCtx::open(&cluster, pool_id, "parent", Some("s"), true, test_config()).unwrap();
    assert_eq!(&parent_at_s.read(0, 5).unwrap()[..], &[0u8; 5]);
    parent_at_s.close().unwrap();

    // children set lists the clone
    let children = parent.snap_set(Some("s")).and_then(|()| parent.list_children()).unwrap();
    assert_eq!(children, vec![("blockpool".to_string(), "child".to_string())]);
    parent.snap_set(None).unwrap();

    // unprotect refuses while a child exists
    assert!(matches!(parent.snap_unprotect("s"), Err(Error::Busy(_))));
    assert!(parent.snap_is_protected("s").unwrap());

    // protected snapshots cannot be removed either
    assert!(matches!(parent.snap_remove("s"), Err(Error::Busy(_))));

    child.close().unwrap();
    parent.close().unwrap();
}

#[test]
fn test_flatten_severs_parent_edge() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "parent", 16 << 20, 22, Features::LAYERING);

    let parent = ImageCtx::open(&cluster, pool_id, "parent", None, false, test_config()).unwrap();
    parent.write(0, b"inherited").unwrap();
    parent.snap_create("s").unwrap();
    parent.snap_protect("s").unwrap();

    let opts = CreateOptions {
        features: Some(Features::LAYERING),
        ..Default::default()
    };
    admin::clone(
        &cluster, pool_id, "parent", "s", pool_id, "child", &opts, &test_config(),
    )
    .unwrap();

    let child = ImageCtx::open(&cluster, pool_id, "child", None, false, test_config()).unwrap();
    assert_eq!(&child.read(0, 9).unwrap()[..], b"inherited");

    child.flatten(Arc::new(NoProgress)).unwrap();

    // parent data was copied, the edge is gone and the children set empty
    assert_eq!(&child.read(0, 9).unwrap()[..], b"inherited");
    assert!(child.parent_info().unwrap_err().is_not_found());
    assert_eq!(child.overlap().unwrap(), 0);

    // flatten is idempotent
    let err = child.flatten(Arc::new(NoProgress)).unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));

    // and unprotect now goes through
    parent.snap_unprotect("s").unwrap();
    assert!(!parent.snap_is_protected("s").unwrap());
    parent.snap_remove("s").unwrap();

    child.close().unwrap();
    parent.close().unwrap();
}

#[test]
fn test_unprotect_race_aborts_clone() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "parent", 16 << 20, 22, Features::LAYERING);
    let parent = ImageCtx::open(&cluster, pool_id, "parent", None, false, test_config()).unwrap();
    parent.snap_create("s").unwrap();
    parent.snap_protect("s").unwrap();

    // push the snapshot into UNPROTECTING underneath the clone; both
    // protection probes treat it as protected, but the post-registration
    // re-check demands fully PROTECTED and unwinds
    let snap_id = {
        let snap = parent.snap_lock.read();
        snap.snap_id_by_name("s").unwrap()
    };
    parent
        .meta
        .set_protection_status(
            &parent.header_oid,
            snap_id,
            blockio_common::ProtectionStatus::Unprotecting,
        )
        .unwrap();

    let opts = CreateOptions {
        features: Some(Features::LAYERING),
        ..Default::default()
    };
    let err = admin::clone(
        &cluster, pool_id, "parent", "s", pool_id, "child", &opts, &test_config(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));

    // the aborted clone left nothing behind
    assert!(admin::detect_format(&cluster, pool_id, "child").unwrap().is_none());
    let spec = blockio_common::ParentSpec::new(pool_id, parent.id.clone(), snap_id);
    assert!(parent.meta.get_children(&spec).unwrap().is_empty());

    parent.close().unwrap();
}

#[test]
fn test_snap_rollback_restores_content() {
    let (_backend, cluster, pool_id) = setup();
    create_image(
        &cluster,
        pool_id,
        "img",
        64 * 1024,
        12,
        Features::EXCLUSIVE_LOCK,
    );
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();

    img.write(0, &[b'A'; 8192]).unwrap();
    img.snap_create("t").unwrap();
    img.write(0, &[b'B'; 8192]).unwrap();
    assert_eq!(&img.read(0, 8192).unwrap()[..], &[b'B'; 8192][..]);

    img.snap_rollback("t", Arc::new(NoProgress)).unwrap();
    assert_eq!(&img.read(0, 8192).unwrap()[..], &[b'A'; 8192][..]);

    // the snapshot itself is left intact
    assert!(img.snap_exists("t").unwrap());
    img.close().unwrap();
}

#[test]
fn test_lock_handoff_between_clients() {
    let (backend, cluster_x, pool_id) = setup();
    create_image(
        &cluster_x,
        pool_id,
        "img",
        1 << 20,
        12,
        Features::EXCLUSIVE_LOCK,
    );

    let x = ImageCtx::open(&cluster_x, pool_id, "img", None, false, test_config()).unwrap();
    x.write(0, b"from-x").unwrap();
    assert!(x.is_exclusive_lock_owner());

    let cluster_y: Arc<dyn Cluster> = MemCluster::connect(&backend);
    let y = ImageCtx::open(&cluster_y, pool_id, "img", None, false, test_config()).unwrap();
    assert!(!y.is_exclusive_lock_owner());

    // y's write suspends, requests the lock, x flushes and releases,
    // y acquires and completes
    y.write(16, b"from-y").unwrap();
    assert!(y.is_exclusive_lock_owner());
    assert!(!x.is_exclusive_lock_owner());

    y.flush().unwrap();
    let check = ImageCtx::open(&cluster_x, pool_id, "img", None, true, test_config()).unwrap();
    assert_eq!(&check.read(0, 6).unwrap()[..], b"from-x");
    assert_eq!(&check.read(16, 6).unwrap()[..], b"from-y");
    check.close().unwrap();

    // ownership can travel back
    x.write(32, b"back").unwrap();
    assert!(x.is_exclusive_lock_owner());
    assert!(!y.is_exclusive_lock_owner());

    y.close().unwrap();
    x.close().unwrap();
}

#[test]
fn test_remote_resize_via_lock_owner() {
    let (backend, cluster_x, pool_id) = setup();
    create_image(
        &cluster_x,
        pool_id,
        "img",
        1 << 20,
        12,
        Features::EXCLUSIVE_LOCK,
    );

    let x = ImageCtx::open(&cluster_x, pool_id, "img", None, false, test_config()).unwrap();
    x.write(0, b"data").unwrap(); // x becomes the owner

    let cluster_y: Arc<dyn Cluster> = MemCluster::connect(&backend);
    let y = ImageCtx::open(&cluster_y, pool_id, "img", None, false, test_config()).unwrap();

    // y is not the owner: the resize is delegated to x over the watch
    // channel and still lands
    y.resize(2 << 20, Arc::new(NoProgress)).unwrap();
    assert!(!y.is_exclusive_lock_owner());
    assert_eq!(y.size().unwrap(), 2 << 20);
    assert_eq!(x.size().unwrap(), 2 << 20);

    y.close().unwrap();
    x.close().unwrap();
}

#[test]
fn test_open_fails_on_unknown_incompatible_feature() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 1 << 20, 12, Features::empty());

    // persist a feature bit this build does not know
    let meta = crate::metadata::MetaClient::new(cluster.pool(pool_id).unwrap());
    let id = meta.get_id(&id_obj_name("img")).unwrap();
    meta.set_raw_features(&header_name(&id), Features::empty().bits() | (1 << 10))
        .unwrap();

    let err = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap_err();
    assert!(matches!(err, Error::IncompatibleFeatures(bits) if bits == 1 << 10));
}

#[test]
fn test_resize_grow_shrink() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 64 * 1024, 12, Features::empty());
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();

    img.write(60 * 1024, &[9u8; 4096]).unwrap();

    // shrink drops the tail objects
    img.resize(32 * 1024, Arc::new(NoProgress)).unwrap();
    assert_eq!(img.size().unwrap(), 32 * 1024);
    assert!(matches!(img.read(60 * 1024, 1), Err(Error::Invalid(_))));

    // grow again: the old tail reads as zero
    img.resize(64 * 1024, Arc::new(NoProgress)).unwrap();
    assert_eq!(img.size().unwrap(), 64 * 1024);
    let tail = img.read(60 * 1024, 4096).unwrap();
    assert!(tail.iter().all(|&b| b == 0));

    // resizing to the current size is a no-op
    img.resize(64 * 1024, Arc::new(NoProgress)).unwrap();
    img.close().unwrap();
}

#[test]
fn test_discard_variants() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 64 * 1024, 12, Features::empty());
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();

    img.write(0, &vec![0xAB; 3 * 4096]).unwrap();

    // whole object
    assert_eq!(img.discard(0, 4096).unwrap(), 4096);
    assert!(img.read(0, 4096).unwrap().iter().all(|&b| b == 0));

    // suffix of an object
    assert_eq!(img.discard(4096 + 2048, 2048).unwrap(), 2048);
    assert!(img.read(4096 + 2048, 2048).unwrap().iter().all(|&b| b == 0));
    assert!(img.read(4096, 2048).unwrap().iter().all(|&b| b == 0xAB));

    // middle of an object
    assert_eq!(img.discard(2 * 4096 + 1024, 1024).unwrap(), 1024);
    assert!(img.read(2 * 4096 + 1024, 1024).unwrap().iter().all(|&b| b == 0));
    assert!(img.read(2 * 4096, 1024).unwrap().iter().all(|&b| b == 0xAB));

    img.close().unwrap();
}

#[test]
fn test_skip_partial_discard_config() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 64 * 1024, 12, Features::empty());
    let config = ClientConfig {
        skip_partial_discard: true,
        ..test_config()
    };
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, config).unwrap();

    img.write(0, &[0xCD; 4096]).unwrap();
    img.discard(1024, 1024).unwrap();
    // the zero-fill case was suppressed
    assert!(img.read(1024, 1024).unwrap().iter().all(|&b| b == 0xCD));
    img.close().unwrap();
}

#[test]
fn test_aio_flush_orders_after_writes() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 1 << 20, 12, Features::empty());
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();

    let writes: Vec<_> = (0..32)
        .map(|i| img.aio_write(i * 4096, bytes::Bytes::from(vec![i as u8 + 1; 4096])))
        .collect();
    let flush = img.aio_flush();
    flush.wait().unwrap();
    for completion in &writes {
        assert!(completion.is_complete());
    }
    img.close().unwrap();
}

#[test]
fn test_remove_image_with_snapshots_refused() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 64 * 1024, 12, Features::empty());
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();
    img.snap_create("keep").unwrap();
    img.close().unwrap();

    let err = admin::remove(
        &cluster,
        pool_id,
        "img",
        Arc::new(NoProgress),
        &test_config(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Busy(_)));

    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();
    img.snap_remove("keep").unwrap();
    img.close().unwrap();
    admin::remove(
        &cluster,
        pool_id,
        "img",
        Arc::new(NoProgress),
        &test_config(),
    )
    .unwrap();

    // every trace of the image is gone
    assert!(admin::detect_format(&cluster, pool_id, "img").unwrap().is_none());
    assert!(admin::list(&cluster, pool_id).unwrap().is_empty());
}

#[test]
fn test_update_features_implications() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 64 * 1024, 12, Features::empty());
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();

    // object map without exclusive lock is rejected
    assert!(matches!(
        img.update_features(Features::OBJECT_MAP, true),
        Err(Error::Invalid(_))
    ));

    img.update_features(Features::EXCLUSIVE_LOCK, true).unwrap();
    img.update_features(Features::OBJECT_MAP, true).unwrap();
    img.update_features(Features::FAST_DIFF, true).unwrap();
    let features = img.features().unwrap();
    assert!(features.contains(
        Features::EXCLUSIVE_LOCK | Features::OBJECT_MAP | Features::FAST_DIFF
    ));
    // enabling marks the maps stale until a rebuild
    assert!(img
        .flags()
        .unwrap()
        .contains(blockio_common::ImageFlags::OBJECT_MAP_INVALID));

    // cannot pull the rug out from under dependents
    assert!(matches!(
        img.update_features(Features::EXCLUSIVE_LOCK, false),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(
        img.update_features(Features::OBJECT_MAP, false),
        Err(Error::Invalid(_))
    ));

    img.update_features(Features::FAST_DIFF, false).unwrap();
    img.update_features(Features::OBJECT_MAP, false).unwrap();
    img.update_features(Features::EXCLUSIVE_LOCK, false).unwrap();
    assert_eq!(img.features().unwrap(), Features::empty());

    img.close().unwrap();
}

#[test]
fn test_rebuild_object_map_clears_invalid_flag() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 64 * 1024, 12, Features::EXCLUSIVE_LOCK);
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();

    img.write(2 * 4096, &[1u8; 4096]).unwrap();
    img.update_features(Features::OBJECT_MAP, true).unwrap();
    assert!(img
        .flags()
        .unwrap()
        .contains(blockio_common::ImageFlags::OBJECT_MAP_INVALID));

    img.rebuild_object_map(Arc::new(NoProgress)).unwrap();
    assert!(!img
        .flags()
        .unwrap()
        .contains(blockio_common::ImageFlags::OBJECT_MAP_INVALID));
    {
        let snap = img.snap_lock.read();
        assert_eq!(snap.object_map.get(2), Some(crate::object_map::OBJECT_EXISTS));
        assert_eq!(snap.object_map.get(0), Some(OBJECT_NONEXISTENT));
    }
    img.close().unwrap();
}

#[test]
fn test_legacy_image_lifecycle() {
    let (_backend, cluster, pool_id) = setup();
    let opts = CreateOptions {
        format: Some(ImageFormat::Legacy),
        order: 12,
        ..Default::default()
    };
    admin::create(&cluster, pool_id, "old", 64 * 1024, &opts, &test_config()).unwrap();

    let img = ImageCtx::open(&cluster, pool_id, "old", None, false, test_config()).unwrap();
    assert_eq!(img.format(), ImageFormat::Legacy);
    assert_eq!(img.features().unwrap(), Features::empty());

    img.write(0, b"legacy data").unwrap();
    assert_eq!(&img.read(0, 11).unwrap()[..], b"legacy data");

    img.snap_create("s").unwrap();
    img.write(0, b"LEGACY DATA").unwrap();
    img.snap_set(Some("s")).unwrap();
    assert_eq!(&img.read(0, 11).unwrap()[..], b"legacy data");
    img.snap_set(None).unwrap();
    img.snap_remove("s").unwrap();

    // features are rejected outright
    assert!(matches!(
        img.update_features(Features::EXCLUSIVE_LOCK, true),
        Err(Error::Invalid(_))
    ));
    img.close().unwrap();

    admin::remove(
        &cluster,
        pool_id,
        "old",
        Arc::new(NoProgress),
        &test_config(),
    )
    .unwrap();
    assert!(admin::list(&cluster, pool_id).unwrap().is_empty());
}

#[test]
fn test_copy_image() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "src", 64 * 1024, 12, Features::empty());
    let src = ImageCtx::open(&cluster, pool_id, "src", None, false, test_config()).unwrap();
    src.write(8192, b"payload").unwrap();
    src.metadata_set("team", "storage").unwrap();

    admin::copy(
        &src,
        &cluster,
        pool_id,
        "dst",
        Arc::new(NoProgress),
        &test_config(),
    )
    .unwrap();

    let dst = ImageCtx::open(&cluster, pool_id, "dst", None, false, test_config()).unwrap();
    assert_eq!(dst.size().unwrap(), 64 * 1024);
    assert_eq!(&dst.read(8192, 7).unwrap()[..], b"payload");
    assert_eq!(dst.metadata_get("team").unwrap().unwrap(), "storage");

    dst.close().unwrap();
    src.close().unwrap();
}

#[test]
fn test_refresh_counters_invariant() {
    let (_backend, cluster, pool_id) = setup();
    create_image(&cluster, pool_id, "img", 64 * 1024, 12, Features::empty());
    let img = ImageCtx::open(&cluster, pool_id, "img", None, false, test_config()).unwrap();

    let check = |img: &Arc<ImageCtx>| {
        let counters = img.refresh_lock.lock();
        assert!(counters.last_refresh <= counters.refresh_seq);
    };
    check(&img);
    img.snap_create("a").unwrap();
    check(&img);
    img.write(0, b"x").unwrap();
    check(&img);
    img.snap_remove("a").unwrap();
    check(&img);
    // a mutating op observes a fresh view at entry
    img.resize(32 * 1024, Arc::new(NoProgress)).unwrap();
    {
        let counters = img.refresh_lock.lock();
        assert_eq!(counters.last_refresh, counters.refresh_seq);
    }
    img.close().unwrap();
}

#[test]
fn test_user_advisory_locks() {
    let (backend, cluster_a, pool_id) = setup();
    create_image(&cluster_a, pool_id, "img", 64 * 1024, 12, Features::empty());
    let a = ImageCtx::open(&cluster_a, pool_id, "img", None, false, test_config()).unwrap();

    a.lock_image(blockio_common::LockMode::Exclusive, "cookie-a", "")
        .unwrap();
    let (lockers, exclusive, _) = a.list_lockers().unwrap();
    assert_eq!(lockers.len(), 1);
    assert!(exclusive);

    let cluster_b: Arc<dyn Cluster> = MemCluster::connect(&backend);
    let b = ImageCtx::open(&cluster_b, pool_id, "img", None, false, test_config()).unwrap();
    assert!(matches!(
        b.lock_image(blockio_common::LockMode::Exclusive, "cookie-b", ""),
        Err(Error::Busy(_))
    ));

    // break the stale lock from the other client
    let holder = lockers[0].clone();
    b.break_lock_image(&holder.client, &holder.cookie).unwrap();
    b.lock_image(blockio_common::LockMode::Exclusive, "cookie-b", "")
        .unwrap();
    b.unlock_image("cookie-b").unwrap();

    b.close().unwrap();
    a.close().unwrap();
}
