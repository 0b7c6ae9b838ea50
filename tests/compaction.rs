//! Container compaction: optimize into a fresh container preserving IDs

use ifds_rs::structure::ENCODER_RAW;
use ifds_rs::{optimize, AppVersion, Ifds, ListAttach, MapKey, MapValue, MemoryStorage, Result};
use std::collections::BTreeMap;

#[test]
fn optimize_preserves_objects_and_ids() -> Result<()> {
    let mut src = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(2, 0, 0))?;

    // A named key-value map.
    let kv = src.create_key_value_map(Some("settings"))?;
    let mut map = BTreeMap::new();
    map.insert(MapKey::str("mode"), MapValue::blob("fast"));
    map.insert(MapKey::Int(10), MapValue::blob("ten"));
    src.set_key_value_map(kv, &map)?;
    src.write_object(kv)?;
    let kv_id = src.object_id(kv)?;

    // A chunked payload.
    let big = src.create_raw_data(ENCODER_RAW, Some("big"))?;
    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    src.write_data(big, &payload)?;
    src.write_object(big)?;
    let big_id = src.object_id(big)?;

    // Something to delete, leaving dead space behind.
    let doomed = src.create_raw_data(ENCODER_RAW, Some("doomed"))?;
    src.write_data(doomed, &vec![7u8; 20_000])?;
    src.write_object(doomed)?;
    src.delete_object(doomed)?;
    src.unset_name_map_id("doomed");

    src.flush_all()?;

    let mut dest = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(2, 0, 0))?;
    optimize(&mut src, &mut dest)?;

    // IDs and names carry over exactly.
    let kv2 = dest.get_object_by_name("settings")?;
    assert_eq!(dest.object_id(kv2)?, kv_id);
    assert_eq!(dest.get_key_value_map(kv2)?, map);

    let big2 = dest.get_object_by_id(big_id, false)?;
    assert_eq!(dest.object_data_size(big2)?, payload.len() as u64);
    dest.seek(big2, 0)?;
    let mut read = Vec::new();
    loop {
        let r = dest.read_data(big2, Some(65_536), None)?;
        read.extend_from_slice(&r.data.unwrap());
        if r.end {
            break;
        }
    }
    assert_eq!(read, payload);

    assert!(dest.name_map_id("doomed").is_none());
    Ok(())
}

#[test]
fn optimized_copy_reopens_cleanly() -> Result<()> {
    let mut src = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 1, 1))?;

    let obj = src.create_raw_data(ENCODER_RAW, Some("keep"))?;
    src.write_data(obj, b"kept bytes")?;
    src.write_object(obj)?;
    src.flush_all()?;

    let mut dest = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 1, 1))?;
    optimize(&mut src, &mut dest)?;

    let bytes = dest.take_stream_data().unwrap();
    drop(dest);

    let mut reopened = Ifds::open(Box::new(MemoryStorage::from_vec(bytes)), None)?;
    assert!(reopened.is_valid());
    let obj = reopened.get_object_by_name("keep")?;
    reopened.seek(obj, 0)?;
    let r = reopened.read_data(obj, None, None)?;
    assert_eq!(r.data.unwrap(), b"kept bytes");
    Ok(())
}

#[test]
fn optimize_copies_linked_lists_in_node_order() -> Result<()> {
    let mut src = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0))?;

    let list = src.create_linked_list(Some("chain"), false)?;
    let mut node_ids = Vec::new();
    for i in 0..6u32 {
        let node = src.create_linked_list_node(ENCODER_RAW, None)?;
        src.write_data(node, format!("payload {i}").as_bytes())?;
        src.attach_linked_list_node(list, node, ListAttach::Last)?;
        node_ids.push(src.object_id(node)?);
        src.release(node)?;
    }
    src.flush_all()?;

    let mut dest = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0))?;
    optimize(&mut src, &mut dest)?;

    let list2 = dest.get_object_by_name("chain")?;
    assert_eq!(dest.num_linked_list_nodes(list2)?, 6);

    let mut iter = dest.create_linked_list_iterator(list2)?;
    let mut seen = Vec::new();
    while dest.next_linked_list_node(&mut iter)? {
        let node = iter.node().unwrap();
        seen.push(dest.object_id(node)?);

        dest.seek(node, 0)?;
        let r = dest.read_data(node, None, None)?;
        let text = String::from_utf8(r.data.unwrap()).unwrap();
        assert!(text.starts_with("payload "));
    }
    assert_eq!(seen, node_ids);
    Ok(())
}

#[test]
fn optimize_rejects_non_empty_destination() -> Result<()> {
    let mut src = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0))?;
    src.flush_all()?;

    let mut dest = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0))?;
    let obj = dest.create_raw_data(ENCODER_RAW, Some("junk"))?;
    dest.write_data(obj, b"pre-existing")?;
    dest.write_object(obj)?;
    dest.flush_all()?;

    assert!(optimize(&mut src, &mut dest).is_err());
    Ok(())
}
