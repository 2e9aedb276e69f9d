use super::*;

#[test]
fn put_and_read_round_trip() -> Result<()> {
    let (_temp, store) = new_store()?;
    let stored = store.put(b"pak contents")?;
    assert!(stored.path.exists());
    assert_eq!(stored.size, 12);
    assert_eq!(store.read(&stored.oid)?, b"pak contents");
    Ok(())
}

#[test]
fn put_is_idempotent() -> Result<()> {
    let (_temp, store) = new_store()?;
    let first = store.put(b"same bytes")?;
    let second = store.put(b"same bytes")?;
    assert_eq!(first.oid, second.oid);
    assert_eq!(store.list()?.len(), 1);
    Ok(())
}

#[test]
fn read_detects_corruption() -> Result<()> {
    let (_temp, store) = new_store()?;
    let stored = store.put(b"original")?;
    fs::write(&stored.path, b"tampered")?;
    let err = store.read(&stored.oid).unwrap_err();
    let store_err = err.downcast_ref::<StoreError>().expect("store error");
    assert!(matches!(store_err, StoreError::DigestMismatch { .. }));
    Ok(())
}

#[test]
fn missing_object_is_a_typed_error() -> Result<()> {
    let (_temp, store) = new_store()?;
    let err = store.read("deadbeef").unwrap_err();
    let store_err = err.downcast_ref::<StoreError>().expect("store error");
    assert_eq!(
        *store_err,
        StoreError::MissingObject {
            oid: "deadbeef".to_string()
        }
    );
    assert_eq!(store_err.code(), codes::MISSING_OR_CORRUPT);
    Ok(())
}

#[test]
fn object_info_repairs_missing_index_rows() -> Result<()> {
    let (_temp, store) = new_store()?;
    let stored = store.put(b"indexed")?;
    let conn = store.connection()?;
    conn.execute("DELETE FROM objects", [])?;
    drop(conn);
    let info = store.object_info(&stored.oid)?.expect("repaired from disk");
    assert_eq!(info.size, stored.size);
    Ok(())
}

#[test]
fn total_bytes_sums_indexed_objects() -> Result<()> {
    let (_temp, store) = new_store()?;
    store.put(b"1234")?;
    store.put(b"12345678")?;
    assert_eq!(store.total_bytes()?, 12);
    Ok(())
}
