//! Seek/read/write/truncate behavior across the three data-methods

use ifds_rs::structure::{
    ENCODER_DATA_CHUNKS, ENCODER_INTERNAL_DATA, ENCODER_RAW, INTERNAL_DATA_MAX,
};
use ifds_rs::{AppVersion, FileStorage, Ifds, MemoryStorage, Result};
use rand::{Rng, SeedableRng};

fn mem_engine() -> Result<Ifds> {
    Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0))
}

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn small_payload_stays_internal() -> Result<()> {
    let mut store = mem_engine()?;
    let obj = store.create_raw_data(ENCODER_RAW, None)?;
    store.write_data(obj, &payload(3000, 1))?;
    assert_eq!(store.object_data_method(obj)?, ENCODER_INTERNAL_DATA);
    Ok(())
}

#[test]
fn large_payload_promotes_to_chunked() -> Result<()> {
    let mut store = mem_engine()?;
    let obj = store.create_raw_data(ENCODER_RAW, None)?;
    store.write_data(obj, &payload(INTERNAL_DATA_MAX as usize + 1, 2))?;
    assert_eq!(store.object_data_method(obj)?, ENCODER_DATA_CHUNKS);
    Ok(())
}

#[test]
fn chunked_seek_and_read_window() -> Result<()> {
    let mut store = mem_engine()?;
    let obj = store.create_raw_data(ENCODER_RAW, Some("big"))?;
    let data = payload(200_000, 3);
    store.write_data(obj, &data)?;
    store.write_object(obj)?;

    store.seek(obj, 100_000)?;
    let mut read = Vec::new();
    while read.len() < 50_000 {
        let r = store.read_data(obj, Some(50_000 - read.len()), None)?;
        let piece = r.data.unwrap();
        assert!(!piece.is_empty());
        read.extend_from_slice(&piece);
    }
    assert_eq!(&read[..], &data[100_000..150_000]);
    Ok(())
}

#[test]
fn chunked_window_survives_reopen() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = FileStorage::create(dir.path().join("big.ifds"))?;
    let mut store = Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))?;

    let obj = store.create_raw_data(ENCODER_RAW, Some("big"))?;
    let data = payload(200_000, 4);
    store.write_data(obj, &data)?;
    store.write_object(obj)?;
    store.flush_all()?;
    store.close()?;

    let storage = FileStorage::open(dir.path().join("big.ifds"))?;
    let mut store = Ifds::open(Box::new(storage), None)?;
    let obj = store.get_object_by_name("big")?;
    assert_eq!(store.object_data_size(obj)?, 200_000);
    assert!(store.is_object_valid(obj)?);

    store.seek(obj, 100_000)?;
    let mut read = Vec::new();
    while read.len() < 50_000 {
        let r = store.read_data(obj, Some(50_000 - read.len()), None)?;
        read.extend_from_slice(&r.data.unwrap());
    }
    assert_eq!(&read[..], &data[100_000..150_000]);
    Ok(())
}

#[test]
fn overwrite_in_the_middle() -> Result<()> {
    let mut store = mem_engine()?;
    let obj = store.create_raw_data(ENCODER_RAW, None)?;
    let mut data = payload(150_000, 5);
    store.write_data(obj, &data)?;
    store.write_object(obj)?;

    let patch = payload(1000, 6);
    store.seek(obj, 70_000)?;
    store.write_data(obj, &patch)?;
    store.write_object(obj)?;
    data[70_000..71_000].copy_from_slice(&patch);

    store.seek(obj, 0)?;
    let mut read = Vec::new();
    loop {
        let r = store.read_data(obj, Some(65_536), None)?;
        read.extend_from_slice(&r.data.unwrap());
        if r.end {
            break;
        }
    }
    assert_eq!(read, data);
    Ok(())
}

#[test]
fn truncate_releases_and_demotes() -> Result<()> {
    let mut store = mem_engine()?;
    let obj = store.create_raw_data(ENCODER_RAW, None)?;
    let data = payload(100_000, 7);
    store.write_data(obj, &data)?;
    store.write_object(obj)?;
    assert_eq!(store.object_data_method(obj)?, ENCODER_DATA_CHUNKS);

    // Shrinking below the inline threshold demotes back to internal data.
    store.truncate(obj, 2000)?;
    assert_eq!(store.object_data_size(obj)?, 2000);
    assert_eq!(store.object_data_method(obj)?, ENCODER_INTERNAL_DATA);
    store.write_object(obj)?;

    store.seek(obj, 0)?;
    let read = store.read_data(obj, None, None)?;
    assert_eq!(read.data.unwrap(), &data[..2000]);

    store.truncate(obj, 0)?;
    assert_eq!(store.object_data_size(obj)?, 0);
    Ok(())
}

#[test]
fn truncate_mid_chunked_keeps_prefix() -> Result<()> {
    let mut store = mem_engine()?;
    let obj = store.create_raw_data(ENCODER_RAW, None)?;
    let data = payload(200_000, 8);
    store.write_data(obj, &data)?;
    store.write_object(obj)?;

    store.truncate(obj, 80_000)?;
    assert_eq!(store.object_data_size(obj)?, 80_000);
    assert_eq!(store.object_data_method(obj)?, ENCODER_DATA_CHUNKS);
    store.write_object(obj)?;

    store.seek(obj, 0)?;
    let mut read = Vec::new();
    loop {
        let r = store.read_data(obj, Some(65_536), None)?;
        read.extend_from_slice(&r.data.unwrap());
        if r.end {
            break;
        }
    }
    assert_eq!(&read[..], &data[..80_000]);
    Ok(())
}

#[test]
fn grow_after_flush_appends() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = FileStorage::create(dir.path().join("grow.ifds"))?;
    let mut store = Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))?;

    let obj = store.create_raw_data(ENCODER_RAW, Some("grow"))?;
    let first = payload(70_000, 9);
    store.write_data(obj, &first)?;
    store.write_object(obj)?;
    store.flush_all()?;

    let second = payload(70_000, 10);
    store.seek(obj, store.object_data_size(obj)?)?;
    store.write_data(obj, &second)?;
    store.write_object(obj)?;
    store.flush_all()?;
    store.close()?;

    let storage = FileStorage::open(dir.path().join("grow.ifds"))?;
    let mut store = Ifds::open(Box::new(storage), None)?;
    let obj = store.get_object_by_name("grow")?;
    assert_eq!(store.object_data_size(obj)?, 140_000);

    store.seek(obj, 0)?;
    let mut read = Vec::new();
    loop {
        let r = store.read_data(obj, Some(65_536), None)?;
        read.extend_from_slice(&r.data.unwrap());
        if r.end {
            break;
        }
    }
    assert_eq!(&read[..70_000], &first[..]);
    assert_eq!(&read[70_000..], &second[..]);
    Ok(())
}
