//! Fixed array and linked list composite types

use ifds_rs::structure::ENCODER_RAW;
use ifds_rs::{
    AppVersion, FileStorage, Ifds, IfdsError, ListAttach, MemoryStorage, ObjHandle, Result,
};

fn mem_engine() -> Result<Ifds> {
    Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0))
}

#[test]
fn fixed_array_append_and_index() -> Result<()> {
    let mut store = mem_engine()?;
    let arr = store.create_fixed_array(8, Some("numbers"))?;

    let n = 500u64;
    for i in 0..n {
        store.append_fixed_array_entry(arr, &i.to_be_bytes(), None)?;
    }
    assert_eq!(store.num_fixed_array_entries(arr)?, n as u32);
    assert_eq!(store.fixed_array_entry_size(arr)?, 8);

    for i in 0..n {
        let entry = store.get_fixed_array_entry(arr, i as u32, None)?;
        assert_eq!(entry.data, i.to_be_bytes());
    }
    Ok(())
}

#[test]
fn fixed_array_set_overwrites_entry() -> Result<()> {
    let mut store = mem_engine()?;
    let arr = store.create_fixed_array(4, None)?;

    for i in 0..10u32 {
        store.append_fixed_array_entry(arr, &i.to_be_bytes(), None)?;
    }
    store.set_fixed_array_entry(arr, 3, &999u32.to_be_bytes())?;

    assert_eq!(
        store.get_fixed_array_entry(arr, 3, None)?.data,
        999u32.to_be_bytes()
    );
    assert_eq!(
        store.get_fixed_array_entry(arr, 4, None)?.data,
        4u32.to_be_bytes()
    );
    assert_eq!(store.num_fixed_array_entries(arr)?, 10);
    Ok(())
}

#[test]
fn fixed_array_entry_size_enforced() -> Result<()> {
    let mut store = mem_engine()?;
    let arr = store.create_fixed_array(4, None)?;
    assert!(store
        .append_fixed_array_entry(arr, b"too long entry", None)
        .is_err());
    Ok(())
}

#[test]
fn fixed_array_round_trip_on_disk() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = FileStorage::create(dir.path().join("arr.ifds"))?;
    let mut store = Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))?;

    let arr = store.create_fixed_array(16, Some("records"))?;
    for i in 0..1000u64 {
        let mut entry = [0u8; 16];
        entry[..8].copy_from_slice(&i.to_be_bytes());
        entry[8..].copy_from_slice(&(i * 3).to_be_bytes());
        store.append_fixed_array_entry(arr, &entry, None)?;
    }
    store.write_object(arr)?;
    store.flush_all()?;
    store.close()?;

    let storage = FileStorage::open(dir.path().join("arr.ifds"))?;
    let mut store = Ifds::open(Box::new(storage), None)?;
    let arr = store.get_object_by_name("records")?;
    assert_eq!(store.num_fixed_array_entries(arr)?, 1000);

    let entry = store.get_fixed_array_entry(arr, 567, None)?;
    assert_eq!(&entry.data[..8], &567u64.to_be_bytes());
    assert_eq!(&entry.data[8..], &(567u64 * 3).to_be_bytes());
    Ok(())
}

fn collect_forward(store: &mut Ifds, list: ObjHandle) -> Result<Vec<i64>> {
    let mut iter = store.create_linked_list_iterator(list)?;
    let mut ids = Vec::new();
    while store.next_linked_list_node(&mut iter)? {
        ids.push(store.object_id(iter.node().unwrap())?);
    }
    Ok(ids)
}

fn collect_backward(store: &mut Ifds, list: ObjHandle) -> Result<Vec<i64>> {
    let mut iter = store.create_linked_list_iterator(list)?;
    let mut ids = Vec::new();
    while store.prev_linked_list_node(&mut iter)? {
        ids.push(store.object_id(iter.node().unwrap())?);
    }
    Ok(ids)
}

#[test]
fn linked_list_attach_detach_restores_state() -> Result<()> {
    let mut store = mem_engine()?;
    let list = store.create_linked_list(Some("list"), false)?;

    let a = store.create_linked_list_node(ENCODER_RAW, None)?;
    let b = store.create_linked_list_node(ENCODER_RAW, None)?;
    store.attach_linked_list_node(list, a, ListAttach::Last)?;
    assert_eq!(store.num_linked_list_nodes(list)?, 1);

    store.attach_linked_list_node(list, b, ListAttach::Last)?;
    assert_eq!(store.num_linked_list_nodes(list)?, 2);
    let forward = collect_forward(&mut store, list)?;

    store.detach_linked_list_node(list, b)?;
    assert_eq!(store.num_linked_list_nodes(list)?, 1);
    assert_eq!(collect_forward(&mut store, list)?, forward[..1]);

    store.detach_linked_list_node(list, a)?;
    assert_eq!(store.num_linked_list_nodes(list)?, 0);
    assert!(collect_forward(&mut store, list)?.is_empty());
    Ok(())
}

#[test]
fn linked_list_bidirectional_iteration() -> Result<()> {
    let mut store = mem_engine()?;
    let list = store.create_linked_list(None, false)?;

    let n = 20;
    for _ in 0..n {
        let node = store.create_linked_list_node(ENCODER_RAW, None)?;
        store.attach_linked_list_node(list, node, ListAttach::Last)?;
        store.release(node)?;
    }
    assert_eq!(store.num_linked_list_nodes(list)?, n);

    let forward = collect_forward(&mut store, list)?;
    assert_eq!(forward.len(), n as usize);

    let mut backward = collect_backward(&mut store, list)?;
    backward.reverse();
    assert_eq!(forward, backward);
    Ok(())
}

#[test]
fn attach_first_and_after() -> Result<()> {
    let mut store = mem_engine()?;
    let list = store.create_linked_list(None, false)?;

    let a = store.create_linked_list_node(ENCODER_RAW, None)?;
    let b = store.create_linked_list_node(ENCODER_RAW, None)?;
    let c = store.create_linked_list_node(ENCODER_RAW, None)?;
    let a_id = store.object_id(a)? as u32;

    store.attach_linked_list_node(list, a, ListAttach::Last)?;
    store.attach_linked_list_node(list, b, ListAttach::First)?;
    store.attach_linked_list_node(list, c, ListAttach::After(a_id))?;

    let order = collect_forward(&mut store, list)?;
    assert_eq!(
        order,
        vec![
            store.object_id(b)?,
            store.object_id(a)?,
            store.object_id(c)?,
        ]
    );
    Ok(())
}

#[test]
fn streamed_list_normalizes_to_same_order() -> Result<()> {
    let mut store = mem_engine()?;

    // Regular list as the reference ordering.
    let plain = store.create_linked_list(None, false)?;
    let mut expected = Vec::new();
    for _ in 0..10 {
        let node = store.create_linked_list_node(ENCODER_RAW, None)?;
        store.attach_linked_list_node(plain, node, ListAttach::Last)?;
        expected.push(store.object_id(node)?);
        store.release(node)?;
    }
    let expected_fwd: Vec<i64> = collect_forward(&mut store, plain)?;
    assert_eq!(expected_fwd, expected);

    // Streamed list: append-only, then normalize via the iterator.
    let streamed = store.create_linked_list(None, true)?;
    let mut streamed_ids = Vec::new();
    for _ in 0..10 {
        let node = store.create_linked_list_node(ENCODER_RAW, None)?;
        store.attach_linked_list_node(streamed, node, ListAttach::Last)?;
        streamed_ids.push(store.object_id(node)?);
        store.release(node)?;
    }

    let fwd = collect_forward(&mut store, streamed)?;
    assert_eq!(fwd, streamed_ids);
    let mut bwd = collect_backward(&mut store, streamed)?;
    bwd.reverse();
    assert_eq!(bwd, streamed_ids);
    assert_eq!(store.num_linked_list_nodes(streamed)?, 10);
    Ok(())
}

#[test]
fn attached_node_cannot_be_deleted() -> Result<()> {
    let mut store = mem_engine()?;
    let list = store.create_linked_list(None, false)?;
    let node = store.create_linked_list_node(ENCODER_RAW, None)?;
    store.attach_linked_list_node(list, node, ListAttach::Last)?;

    assert!(matches!(
        store.delete_object(node),
        Err(IfdsError::NotDetached)
    ));

    store.detach_linked_list_node(list, node)?;
    store.delete_object(node)?;
    Ok(())
}

#[test]
fn delete_linked_list_removes_all_nodes() -> Result<()> {
    let mut store = mem_engine()?;
    let list = store.create_linked_list(Some("doomed"), false)?;

    let mut node_ids = Vec::new();
    for _ in 0..5 {
        let node = store.create_linked_list_node(ENCODER_RAW, None)?;
        store.attach_linked_list_node(list, node, ListAttach::Last)?;
        node_ids.push(store.object_id(node)?);
        store.release(node)?;
    }

    store.delete_linked_list(list)?;
    for id in node_ids {
        assert!(store.get_object_by_id(id, false).is_err());
    }
    Ok(())
}

#[test]
fn list_survives_reopen() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = FileStorage::create(dir.path().join("list.ifds"))?;
    let mut store = Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))?;

    let list = store.create_linked_list(Some("persisted"), false)?;
    let mut expected = Vec::new();
    for i in 0..8u32 {
        let node = store.create_linked_list_node(ENCODER_RAW, None)?;
        store.write_data(node, format!("node {i}").as_bytes())?;
        store.attach_linked_list_node(list, node, ListAttach::Last)?;
        expected.push(store.object_id(node)?);
        store.release(node)?;
    }
    store.flush_all()?;
    store.close()?;

    let storage = FileStorage::open(dir.path().join("list.ifds"))?;
    let mut store = Ifds::open(Box::new(storage), None)?;
    let list = store.get_object_by_name("persisted")?;
    assert_eq!(store.num_linked_list_nodes(list)?, 8);
    assert_eq!(collect_forward(&mut store, list)?, expected);

    // Node payloads ride along.
    let mut iter = store.create_linked_list_iterator(list)?;
    assert!(store.next_linked_list_node(&mut iter)?);
    let node = iter.node().unwrap();
    store.seek(node, 0)?;
    let read = store.read_data(node, None, None)?;
    assert_eq!(read.data.unwrap(), b"node 0");
    Ok(())
}
