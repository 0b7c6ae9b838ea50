//! Soft corruption handling: CRC mismatches flag structures invalid
//! without aborting reads

use ifds_rs::structure::ENCODER_RAW;
use ifds_rs::{AppVersion, FileStorage, Ifds, Result};
use std::fs;
use std::path::Path;

fn flip_byte(path: &Path, offset: u64) {
    let mut bytes = fs::read(path).unwrap();
    bytes[offset as usize] ^= 0xFF;
    fs::write(path, bytes).unwrap();
}

#[test]
fn corrupt_object_header_flags_invalid_but_loads() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("hdr.ifds");

    let (obj_pos, id) = {
        let storage = FileStorage::create(&path)?;
        let mut store = Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))?;
        let obj = store.create_raw_data(ENCODER_RAW, Some("victim"))?;
        store.write_data(obj, b"internal payload")?;
        store.write_object(obj)?;
        let loc = store.object_location(obj)?;
        let id = store.object_id(obj)?;
        store.flush_all()?;
        store.close()?;
        (loc.0, id)
    };

    // Flip a payload byte inside the frame (not its CRC field).
    flip_byte(&path, obj_pos + 5);

    let storage = FileStorage::open(&path)?;
    let mut store = Ifds::open(Box::new(storage), None)?;
    let obj = store.get_object_by_id(id, true)?;

    // The object still loads and reads; only validity is lost.
    assert!(!store.is_object_valid(obj)?);
    store.seek(obj, 0)?;
    let read = store.read_data(obj, None, None)?;
    assert!(read.data.is_some());
    Ok(())
}

#[test]
fn corrupt_data_chunk_taints_reads_only() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("chunk.ifds");

    let (obj_pos, obj_size, id) = {
        let storage = FileStorage::create(&path)?;
        let mut store = Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))?;
        let obj = store.create_raw_data(ENCODER_RAW, Some("chunked"))?;
        store.write_data(obj, &vec![0xA5u8; 80_000])?;
        store.write_object(obj)?;
        let loc = store.object_location(obj)?;
        let id = store.object_id(obj)?;
        store.flush_all()?;
        store.close()?;
        (loc.0, loc.1, id)
    };

    // The first DATA chunk sits after the header and its locations table;
    // flip a byte well inside its payload.
    flip_byte(&path, obj_pos + obj_size + 18 + 100);

    let storage = FileStorage::open(&path)?;
    let mut store = Ifds::open(Box::new(storage), None)?;
    let obj = store.get_object_by_id(id, true)?;

    store.seek(obj, 0)?;
    let read = store.read_data(obj, Some(1000), None)?;
    assert!(!read.valid);
    assert_eq!(read.data.unwrap().len(), 1000);

    // The object header itself was untouched.
    assert!(store.is_object_valid(obj)?);
    Ok(())
}

#[test]
fn corrupt_file_header_opens_invalid() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("fhdr.ifds");

    {
        let storage = FileStorage::create(&path)?;
        let mut store = Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))?;
        let obj = store.create_raw_data(ENCODER_RAW, Some("data"))?;
        store.write_data(obj, b"bytes")?;
        store.write_object(obj)?;
        store.flush_all()?;
        store.close()?;
    }

    // Flip a build-number byte inside the header: it invalidates the CRC
    // without changing how anything else parses.
    flip_byte(&path, 1 + 4 + 5 + 2 + 2 + 2);

    let storage = FileStorage::open(&path)?;
    let store = Ifds::open(Box::new(storage), None)?;
    assert!(!store.is_valid());
    Ok(())
}

#[test]
fn every_header_byte_flip_is_detected() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("sweep.ifds");

    let (obj_pos, obj_size, id) = {
        let storage = FileStorage::create(&path)?;
        let mut store = Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))?;
        let obj = store.create_raw_data(ENCODER_RAW, Some("swept"))?;
        store.write_data(obj, b"payload under test")?;
        store.write_object(obj)?;
        let loc = store.object_location(obj)?;
        let id = store.object_id(obj)?;
        store.flush_all()?;
        store.close()?;
        (loc.0, loc.1, id)
    };

    let pristine = fs::read(&path).unwrap();

    // Flipping any single byte of the object frame, CRC field excluded,
    // must flag the object invalid on the next load.
    for offset in obj_pos + 4..obj_pos + obj_size - 4 {
        let mut bytes = pristine.clone();
        bytes[offset as usize] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        let storage = FileStorage::open(&path)?;
        let mut store = Ifds::open(Box::new(storage), None)?;
        let obj = store.get_object_by_id(id, true)?;
        assert!(
            !store.is_object_valid(obj)?,
            "flip at offset {offset} went undetected"
        );
    }

    fs::write(&path, &pristine).unwrap();
    Ok(())
}
