//! Property tests: allocator bookkeeping and map codec round trips

use ifds_rs::structure::ENCODER_RAW;
use ifds_rs::{AppVersion, Ifds, MapKey, MapValue, MemoryStorage};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Random create/write/delete interleavings never corrupt live objects:
    /// every survivor reads back exactly, in-session and after reopen.
    #[test]
    fn allocator_keeps_live_objects_intact(
        ops in prop::collection::vec((0u8..3, 16usize..20_000), 4..24)
    ) {
        let mut store =
            Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0)).unwrap();
        let mut live: Vec<(i64, Vec<u8>)> = Vec::new();

        for (i, (op, size)) in ops.iter().enumerate() {
            match op {
                // Create an object with a recognizable payload.
                0 | 1 => {
                    let obj = store.create_raw_data(ENCODER_RAW, None).unwrap();
                    let fill = (i % 251) as u8;
                    let data = vec![fill; *size];
                    store.write_data(obj, &data).unwrap();
                    store.write_object(obj).unwrap();
                    live.push((store.object_id(obj).unwrap(), data));
                    store.release(obj).unwrap();
                }
                // Delete the oldest survivor, freeing its bytes.
                _ => {
                    if !live.is_empty() {
                        let (id, _) = live.remove(0);
                        let obj = store.get_object_by_id(id, false).unwrap();
                        store.delete_object(obj).unwrap();
                    }
                }
            }
        }

        // Freed space is reclaimed, not handed out twice: every live object
        // still holds its own bytes.
        for (id, data) in &live {
            let obj = store.get_object_by_id(*id, false).unwrap();
            store.seek(obj, 0).unwrap();
            let mut read = Vec::new();
            loop {
                let r = store.read_data(obj, Some(65_536), None).unwrap();
                read.extend_from_slice(&r.data.unwrap());
                if r.end {
                    break;
                }
            }
            prop_assert_eq!(&read, data);
            store.release(obj).unwrap();
        }

        store.flush_all().unwrap();
        let bytes = store.take_stream_data().unwrap();
        drop(store);

        let mut store = Ifds::open(Box::new(MemoryStorage::from_vec(bytes)), None).unwrap();
        for (id, data) in &live {
            let obj = store.get_object_by_id(*id, false).unwrap();
            store.seek(obj, 0).unwrap();
            let mut read = Vec::new();
            loop {
                let r = store.read_data(obj, Some(65_536), None).unwrap();
                read.extend_from_slice(&r.data.unwrap());
                if r.end {
                    break;
                }
            }
            prop_assert_eq!(&read, data);
        }
    }

    /// Delete-then-recreate reuses freed space instead of growing the file
    /// without bound.
    #[test]
    fn freed_bytes_are_reused(rounds in 2usize..8) {
        let mut store =
            Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0)).unwrap();

        // Baseline: one object and its bookkeeping flushed out.
        let obj = store.create_raw_data(ENCODER_RAW, None).unwrap();
        store.write_data(obj, &vec![1u8; 2048]).unwrap();
        store.write_object(obj).unwrap();
        let id = store.object_id(obj).unwrap();
        store.flush_all().unwrap();

        let mut id = id;
        for _ in 0..rounds {
            let obj = store.get_object_by_id(id, false).unwrap();
            store.delete_object(obj).unwrap();

            let obj = store.create_raw_data(ENCODER_RAW, None).unwrap();
            store.write_data(obj, &vec![2u8; 2048]).unwrap();
            store.write_object(obj).unwrap();
            id = store.object_id(obj).unwrap();
            store.release(obj).unwrap();
            store.flush_all().unwrap();
        }

        // The file may grow a little from map churn but must not grow by a
        // full object per round once space is being recycled.
        let final_len = store.take_stream_data().unwrap().len();
        prop_assert!(
            final_len < 4096 + rounds * 2600,
            "file grew unbounded: {final_len} bytes after {rounds} rounds"
        );
    }

    /// Key-value maps survive an encode/decode round trip for arbitrary
    /// keys and values.
    #[test]
    fn key_value_map_round_trips(
        entries in prop::collection::btree_map(
            prop_oneof![
                any::<i64>().prop_map(MapKey::Int),
                prop::collection::vec(any::<u8>(), 0..64).prop_map(MapKey::Str),
            ],
            prop::collection::vec(any::<u8>(), 0..2048).prop_map(MapValue::Blob),
            0..32,
        )
    ) {
        let mut store =
            Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0)).unwrap();
        let obj = store.create_key_value_map(None).unwrap();

        store.set_key_value_map(obj, &entries).unwrap();
        store.write_object(obj).unwrap();

        let read = store.get_key_value_map(obj).unwrap();
        prop_assert_eq!(read, entries);
    }

    /// Key-ID maps round trip IDs exactly.
    #[test]
    fn key_id_map_round_trips(
        entries in prop::collection::btree_map(
            prop::collection::vec(any::<u8>(), 1..40).prop_map(MapKey::Str),
            (1u32..u32::MAX).prop_map(MapValue::Id),
            0..64,
        )
    ) {
        let mut store =
            Ifds::create(Box::new(MemoryStorage::new()), AppVersion::new(1, 0, 0)).unwrap();
        let obj = store.create_key_id_map(None).unwrap();

        store.set_key_value_map(obj, &entries).unwrap();
        store.write_object(obj).unwrap();

        let read = store.get_key_value_map(obj).unwrap();
        prop_assert_eq!(read, entries);
    }
}
