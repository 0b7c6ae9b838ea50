//! Create/write/reopen round trips over file-backed containers

use ifds_rs::{
    AppVersion, FileStorage, Ifds, IfdsError, MapKey, MapValue, MemoryStorage, Result,
};
use std::collections::BTreeMap;

fn file_engine(dir: &tempfile::TempDir, name: &str) -> Result<Ifds> {
    let storage = FileStorage::create(dir.path().join(name))?;
    Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))
}

fn reopen(dir: &tempfile::TempDir, name: &str) -> Result<Ifds> {
    let storage = FileStorage::open(dir.path().join(name))?;
    Ifds::open(Box::new(storage), None)
}

#[test]
fn key_value_map_round_trip() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let mut store = file_engine(&dir, "kv.ifds")?;

    let obj = store.create_key_value_map(Some("foo"))?;
    let mut map = BTreeMap::new();
    map.insert(MapKey::str("a"), MapValue::blob("1"));
    map.insert(MapKey::str("bb"), MapValue::blob("22"));
    store.set_key_value_map(obj, &map)?;
    store.write_object(obj)?;
    store.flush_all()?;
    store.close()?;

    let mut store = reopen(&dir, "kv.ifds")?;
    assert!(store.is_valid());

    let obj = store.get_object_by_name("foo")?;
    assert!(store.is_object_valid(obj)?);
    let read = store.get_key_value_map(obj)?;
    assert_eq!(read.len(), 2);
    assert_eq!(read.get(&MapKey::str("a")), Some(&MapValue::blob("1")));
    assert_eq!(read.get(&MapKey::str("bb")), Some(&MapValue::blob("22")));
    Ok(())
}

#[test]
fn raw_object_preserves_type_and_data() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let mut store = file_engine(&dir, "raw.ifds")?;

    let obj = store.create_raw_data(ifds_rs::structure::ENCODER_RAW, Some("blob"))?;
    let payload = b"some raw payload bytes".to_vec();
    store.write_data(obj, &payload)?;
    store.write_object(obj)?;
    let id = store.object_id(obj)?;
    let type_byte = store.object_type(obj)?;
    let encoder = store.object_encoder(obj)?;
    store.flush_all()?;
    store.close()?;

    let mut store = reopen(&dir, "raw.ifds")?;
    let obj = store.get_object_by_id(id, true)?;
    assert_eq!(store.object_type(obj)?, type_byte);
    assert_eq!(store.object_encoder(obj)?, encoder);
    assert_eq!(store.object_data_size(obj)?, payload.len() as u64);

    store.seek(obj, 0)?;
    let read = store.read_data(obj, None, None)?;
    assert_eq!(read.data.unwrap(), payload);
    assert!(read.end);
    Ok(())
}

#[test]
fn id_reuse_after_delete() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let mut store = file_engine(&dir, "reuse.ifds")?;

    let mut ids = Vec::new();
    for i in 0..3 {
        let obj = store.create_raw_data(ifds_rs::structure::ENCODER_RAW, None)?;
        store.write_data(obj, format!("object {i}").as_bytes())?;
        store.write_object(obj)?;
        ids.push(store.object_id(obj)?);
        store.release(obj)?;
    }
    assert_eq!(ids, vec![1, 2, 3]);
    store.flush_all()?;

    // Deleting the lowest assigned ID makes it the next one handed out.
    let lowest = store.get_object_by_id(1, true)?;
    store.delete_object(lowest)?;

    let obj = store.create_raw_data(ifds_rs::structure::ENCODER_RAW, None)?;
    assert_eq!(store.object_id(obj)?, 1);
    Ok(())
}

#[test]
fn name_map_bindings_persist() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let mut store = file_engine(&dir, "names.ifds")?;

    let a = store.create_raw_data(ifds_rs::structure::ENCODER_RAW, Some("alpha"))?;
    store.write_data(a, b"a")?;
    store.write_object(a)?;
    let b = store.create_raw_data(ifds_rs::structure::ENCODER_RAW, Some("beta"))?;
    store.write_data(b, b"b")?;
    store.write_object(b)?;
    store.unset_name_map_id("beta");
    store.flush_all()?;
    store.close()?;

    let mut store = reopen(&dir, "names.ifds")?;
    assert!(store.name_map_id("alpha").is_some());
    assert!(store.name_map_id("beta").is_none());
    assert!(matches!(
        store.get_object_by_name("beta"),
        Err(IfdsError::NameNotFound(_))
    ));
    Ok(())
}

#[test]
fn duplicate_name_rejected() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let mut store = file_engine(&dir, "dup.ifds")?;

    store.create_raw_data(ifds_rs::structure::ENCODER_RAW, Some("same"))?;
    assert!(matches!(
        store.create_raw_data(ifds_rs::structure::ENCODER_RAW, Some("same")),
        Err(IfdsError::NameExists(_))
    ));
    Ok(())
}

#[test]
fn null_data_round_trip() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let mut store = file_engine(&dir, "null.ifds")?;

    let obj = store.create_raw_data(ifds_rs::structure::ENCODER_RAW, Some("nothing"))?;
    store.write_data(obj, b"soon gone")?;
    store.set_data_null(obj)?;
    store.write_object(obj)?;
    assert!(store.is_object_data_null(obj)?);
    store.flush_all()?;
    store.close()?;

    let mut store = reopen(&dir, "null.ifds")?;
    let obj = store.get_object_by_name("nothing")?;
    assert!(store.is_object_data_null(obj)?);
    let read = store.read_data(obj, None, None)?;
    assert!(read.data.is_none());
    assert!(read.end);
    Ok(())
}

#[test]
fn custom_magic_and_version_round_trip() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = FileStorage::create(dir.path().join("magic.ifds"))?;
    let mut store = Ifds::create_with(
        Box::new(storage),
        AppVersion::new(3, 1, 42),
        Some("MYFMT"),
        ifds_rs::DEFAULT_FEATURES,
        0x55,
    )?;
    store.flush_all()?;
    store.close()?;

    // Magic is sniffed when not supplied.
    let storage = FileStorage::open(dir.path().join("magic.ifds"))?;
    let store = Ifds::open(Box::new(storage), None)?;
    let hdr = store.header().unwrap();
    assert_eq!(hdr.magic, "MYFMT");
    assert_eq!(hdr.app_ver, AppVersion::new(3, 1, 42));
    assert_eq!(hdr.fmt_features, 0x55);
    drop(store);

    let storage = FileStorage::open(dir.path().join("magic.ifds"))?;
    assert!(matches!(
        Ifds::open(Box::new(storage), Some("OTHER")),
        Err(IfdsError::InvalidSignature(_))
    ));
    Ok(())
}

#[test]
fn create_on_populated_storage_fails() {
    let storage = MemoryStorage::from_vec(vec![1, 2, 3]);
    assert!(matches!(
        Ifds::create(Box::new(storage), AppVersion::default()),
        Err(IfdsError::AlreadyExists)
    ));
}

#[test]
fn memory_container_round_trip() -> Result<()> {
    let mut store = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0))?;
    let obj = store.create_key_value_map(Some("cfg"))?;
    let mut map = BTreeMap::new();
    map.insert(MapKey::Int(7), MapValue::blob("seven"));
    store.set_key_value_map(obj, &map)?;
    store.write_object(obj)?;
    store.flush_all()?;

    let bytes = store.take_stream_data().unwrap();
    drop(store);

    let mut store = Ifds::open(Box::new(MemoryStorage::from_vec(bytes)), None)?;
    let obj = store.get_object_by_name("cfg")?;
    let read = store.get_key_value_map(obj)?;
    assert_eq!(read.get(&MapKey::Int(7)), Some(&MapValue::blob("seven")));
    Ok(())
}
