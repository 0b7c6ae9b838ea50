//! Interleaved multi-channel streaming and the incremental stream reader

use ifds_rs::structure::ENCODER_RAW;
use ifds_rs::{
    AppVersion, FileStorage, Ifds, IfdsError, MemoryStorage, Result, StreamReader,
    StreamStructure,
};

#[test]
fn interleaved_channels_read_back_in_file_order() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = FileStorage::create(dir.path().join("stream.ifds"))?;
    let mut store = Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))?;

    let obj = store.create_raw_data(ENCODER_RAW, Some("channels"))?;
    store.write_stream_data(obj, 5, b"channel five bytes", false)?;
    store.write_stream_data(obj, 7, b"channel seven bytes", false)?;
    store.write_stream_data(obj, 0, &[], true)?;
    store.write_object(obj)?;
    store.flush_all()?;
    store.close()?;

    let storage = FileStorage::open(dir.path().join("stream.ifds"))?;
    let mut store = Ifds::open(Box::new(storage), None)?;
    let obj = store.get_object_by_name("channels")?;
    assert!(store.is_interleaved_object(obj)?);

    let r = store.read_data(obj, None, None)?;
    assert_eq!(r.channel, Some(5));
    assert_eq!(r.data.unwrap(), b"channel five bytes");
    assert!(!r.end);

    let r = store.read_data(obj, None, None)?;
    assert_eq!(r.channel, Some(7));
    assert_eq!(r.data.unwrap(), b"channel seven bytes");

    let r = store.read_data(obj, None, None)?;
    assert_eq!(r.channel, Some(0));
    assert!(r.end);
    assert!(r.data.unwrap().is_empty());
    Ok(())
}

#[test]
fn channel_filter_skips_other_channels() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = FileStorage::create(dir.path().join("filter.ifds"))?;
    let mut store = Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))?;

    let obj = store.create_raw_data(ENCODER_RAW, Some("filtered"))?;
    store.write_stream_data(obj, 1, b"one", false)?;
    store.write_stream_data(obj, 2, b"two", false)?;
    store.write_stream_data(obj, 1, b"more one", false)?;
    store.write_stream_data(obj, 0, &[], true)?;
    store.write_object(obj)?;
    store.flush_all()?;
    store.close()?;

    let storage = FileStorage::open(dir.path().join("filter.ifds"))?;
    let mut store = Ifds::open(Box::new(storage), None)?;
    let obj = store.get_object_by_name("filtered")?;

    let mut collected = Vec::new();
    loop {
        let r = store.read_data(obj, None, Some(1))?;
        if let Some(d) = &r.data {
            collected.extend_from_slice(d);
        }
        if r.end && matches!(r.channel, Some(0) | None) {
            break;
        }
    }
    assert_eq!(collected, b"onemore one");
    Ok(())
}

#[test]
fn second_write_while_stream_in_flight_conflicts() -> Result<()> {
    let mut store = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0))?;

    let a = store.create_raw_data(ENCODER_RAW, Some("a"))?;
    store.write_stream_data(a, 3, b"unfinished stream", false)?;
    store.write_object(a)?; // registers the in-flight stream

    let b = store.create_raw_data(ENCODER_RAW, Some("b"))?;
    store.write_data(b, b"plain")?;
    assert!(matches!(
        store.write_object(b),
        Err(IfdsError::WriteConflict)
    ));

    // Finalizing the stream unblocks other writes.
    store.write_stream_data(a, 0, &[], true)?;
    store.process_inflight()?;
    store.write_object(b)?;
    Ok(())
}

#[test]
fn stream_truncate_resets_to_internal() -> Result<()> {
    let mut store = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0))?;

    let obj = store.create_raw_data(ENCODER_RAW, Some("resettable"))?;
    store.write_stream_data(obj, 4, b"stream payload", false)?;
    store.write_stream_data(obj, 0, &[], true)?;
    store.write_object(obj)?;
    store.flush_all()?;

    // Only reset-to-zero is allowed for streams.
    assert!(store.truncate(obj, 5).is_err());
    store.truncate(obj, 0)?;
    assert_eq!(store.object_data_size(obj)?, 0);
    assert!(!store.is_interleaved_object(obj)?);

    store.write_data(obj, b"now seekable")?;
    store.write_object(obj)?;
    store.seek(obj, 0)?;
    let r = store.read_data(obj, None, None)?;
    assert_eq!(r.data.unwrap(), b"now seekable");
    Ok(())
}

fn build_container_bytes() -> Result<Vec<u8>> {
    let mut store = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0))?;
    let obj = store.create_raw_data(ENCODER_RAW, Some("streamed-object"))?;
    store.write_data(obj, b"payload for the stream reader")?;
    store.write_object(obj)?;
    store.flush_all()?;
    Ok(store.take_stream_data().unwrap())
}

#[test]
fn stream_reader_parses_incrementally() -> Result<()> {
    let bytes = build_container_bytes()?;

    let mut reader = StreamReader::new(None);

    // Nothing to parse before the header has arrived.
    assert!(matches!(
        reader.read_next(),
        Err(IfdsError::InsufficientData { .. })
    ));

    // Feed the container a few bytes at a time, collecting structures.
    let mut objects = 0usize;
    let mut fed = 0usize;
    while fed < bytes.len() {
        let next = (fed + 7).min(bytes.len());
        reader.append(&bytes[fed..next]).ok();
        fed = next;

        loop {
            match reader.read_next() {
                Ok(StreamStructure::Object { valid, .. }) => {
                    assert!(valid);
                    objects += 1;
                }
                Ok(_) => {}
                Err(IfdsError::InsufficientData { .. }) => break,
                Err(e) => return Err(e),
            }
        }
    }

    // The user object plus the root map structures all came through.
    assert!(objects >= 3, "expected several objects, saw {objects}");
    assert_eq!(reader.stream_pos(), bytes.len() as u64);
    Ok(())
}

#[test]
fn drained_buffer_falls_back_to_stream_trailer() -> Result<()> {
    let mut store = Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0))?;

    let obj = store.create_raw_data(ENCODER_RAW, Some("tail"))?;
    store.write_data(obj, b"stream-finalized container")?;
    store.write_object(obj)?;

    // Draining mid-session makes the header unwritable, forcing the
    // trailing stream record on flush.
    let mut bytes = store.take_stream_data().unwrap();
    store.flush_all()?;
    bytes.extend_from_slice(&store.take_stream_data().unwrap());
    drop(store);

    let mut store = Ifds::open(Box::new(MemoryStorage::from_vec(bytes)), None)?;
    let obj = store.get_object_by_name("tail")?;
    store.seek(obj, 0)?;
    let r = store.read_data(obj, None, None)?;
    assert_eq!(r.data.unwrap(), b"stream-finalized container");
    Ok(())
}
