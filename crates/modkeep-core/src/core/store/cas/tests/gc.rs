use super::*;

#[test]
fn unreferenced_objects_are_reclaimed() -> Result<()> {
    let (_temp, store) = new_store()?;
    let blob = store.put(b"orphaned payload")?;
    let outcome = store.collect_garbage(true)?;
    let stats = outcome.stats().expect("pass ran");
    assert_eq!(stats.scanned, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.bytes_freed, blob.size);
    assert!(!blob.path.exists());
    Ok(())
}

#[test]
fn grace_window_protects_fresh_objects() -> Result<()> {
    let (_temp, store) = new_store_with_policy(Duration::ZERO, Duration::from_secs(3600))?;
    let fresh = store.put(b"just ingested")?;
    let stale = store.put(b"ingested long ago")?;
    store.set_created_at(&stale.oid, 0)?;

    let outcome = store.collect_garbage(true)?;
    let stats = outcome.stats().expect("pass ran");
    assert_eq!(stats.deleted, 1, "only the stale object is eligible");
    assert!(fresh.path.exists(), "fresh ingest survives the grace window");
    assert!(!stale.path.exists());
    Ok(())
}

#[test]
fn cooldown_throttles_back_to_back_passes() -> Result<()> {
    let (_temp, store) = new_store_with_policy(Duration::from_secs(3600), Duration::ZERO)?;
    store.put(b"first pass fodder")?;

    let first = store.collect_garbage(false)?;
    assert!(matches!(first, GcOutcome::Completed(_)));

    store.put(b"second pass fodder")?;
    let second = store.collect_garbage(false)?;
    assert_eq!(second, GcOutcome::Throttled);

    let forced = store.collect_garbage(true)?;
    let stats = match forced {
        GcOutcome::Completed(stats) => stats,
        other => panic!("force must bypass the cooldown, got {other:?}"),
    };
    assert_eq!(stats.deleted, 1);
    Ok(())
}

#[test]
fn orphaned_files_on_disk_are_swept() -> Result<()> {
    let (_temp, store) = new_store()?;
    let kept = store.put(b"indexed and referenced")?;
    let manifest = manifest_with_oids("1.1.moddb.map.foo", &[&kept.oid]);
    store.track_manifest(&manifest)?;

    // An object file with no index row, as an interrupted ingest leaves behind.
    let orphan_dir = store.root().join("objects").join("zz");
    fs::create_dir_all(&orphan_dir)?;
    let orphan = orphan_dir.join("zz0123");
    fs::write(&orphan, b"leftover")?;

    let outcome = store.collect_garbage(true)?;
    let stats = outcome.stats().expect("pass ran");
    assert_eq!(stats.deleted, 1);
    assert!(!orphan.exists(), "orphan should be swept");
    assert!(kept.path.exists(), "referenced object must survive");
    Ok(())
}

#[test]
fn sweep_reclaims_every_dead_object_in_one_pass() -> Result<()> {
    let (_temp, store) = new_store()?;
    let blob_a = store.put(b"payload a")?;
    let blob_b = store.put(b"payload b")?;

    let outcome = store.collect_garbage(true)?;
    let stats = outcome.stats().expect("pass ran");
    assert_eq!(stats.scanned, 2);
    assert_eq!(stats.deleted, 2);
    assert!(stats.errors.is_empty());
    assert!(!blob_a.path.exists());
    assert!(!blob_b.path.exists());
    Ok(())
}
