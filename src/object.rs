//! Object model
//!
//! Every object the engine knows about lives in exactly one
//! [`ObjectRecord`] inside the [`Arena`]. Callers hold lightweight
//! [`ObjHandle`]s (slot index + generation); an open-handle counter per slot
//! gates cache eviction, nothing more. There is no shared mutable aliasing:
//! engine operations move the record out of its slot, work on it, and put it
//! back.
//!
//! Per-base-type payload interpretation goes through the [`TypeCodec`]
//! trait. Fixed arrays and linked lists have real codecs; every other base
//! type falls back to a pass-through that preserves the raw info bytes.

use crate::error::{IfdsError, Result};
use crate::structure::{
    self, LocEntry, ENCODER_MASK_DATA, ENCODER_MASK_DATA_NUM, ENCODER_NONE, ENCODER_NO_DATA,
    TYPE_BASE_MASK, TYPE_FIXED_ARRAY, TYPE_LEAF, TYPE_LINKED_LIST, TYPE_RAW_DATA, TYPE_STREAMED,
};
use std::collections::BTreeMap;

/// Object identity: positive IDs are persistent and indexed, negative IDs
/// are transient and never written to the ID map
pub type ObjectId = i64;

/// Baseline RAM estimate for a cached object record
pub const RECORD_BASE_RAM: u64 = 400;

/// Per-chunk RAM overhead on top of the payload bytes
pub const CHUNK_BASE_RAM: u64 = 50;

/// Type-specific header payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeInfo {
    None,
    FixedArray { entry_size: u32, entries: u32 },
    LinkedList { nodes: u32, first: u32, last: u32 },
    ListNode { prev: u32, next: u32 },
    Raw(Vec<u8>),
}

/// One in-memory DATA chunk of an object
#[derive(Debug, Clone)]
pub struct Chunk {
    pub dirty: bool,
    pub valid: bool,
    pub term: bool,
    pub channel: Option<u16>,
    pub file_pos: u64,
    pub file_size: u64,
    pub data_pos: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    /// Fresh terminal chunk at a logical position
    pub fn new_term(data_pos: u64) -> Self {
        Chunk {
            dirty: true,
            valid: true,
            term: true,
            channel: None,
            file_pos: 0,
            file_size: 0,
            data_pos,
            data: Vec::new(),
        }
    }
}

/// Physical index over an object's payload
#[derive(Debug, Clone, Default)]
pub enum DataTable {
    /// Nothing loaded/needed yet
    #[default]
    None,
    /// Chunked-seekable: the DATA-locations table
    Seekable(Vec<LocEntry>),
    /// Chunked-streaming read cursor: next chunk position and its pre-read
    /// frame head
    StreamCursor { pos: u64, buf: Vec<u8> },
}

impl DataTable {
    pub fn is_none(&self) -> bool {
        matches!(self, DataTable::None)
    }
}

/// In-memory state of one object
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub id: ObjectId,
    /// Raw type byte including LEAF/STREAMED flags
    pub type_byte: u8,
    /// Raw encoder byte: encoder number | data-method bits
    pub enc: u8,
    pub info: TypeInfo,
    /// CRC outcome of the last load; soft corruption indicator
    pub valid: bool,
    /// Header needs rewriting
    pub header_dirty: bool,
    /// Payload chunks need rewriting
    pub data_dirty: bool,
    /// Excluded from the automatic flush sweep (root maps manage themselves)
    pub manual: bool,
    pub est_ram: u64,
    pub obj_pos: u64,
    pub obj_size: u64,
    /// Reserved byte size of the DATA-locations table
    pub table_size: u64,
    pub table: DataTable,
    /// Current locations-table entry for the data cursor
    pub table_idx: usize,
    pub data_pos: u64,
    pub data_size: u64,
    /// Current chunk index for the data cursor
    pub chunk_num: u64,
    pub chunks: BTreeMap<u64, Chunk>,
}

impl ObjectRecord {
    /// Default record for a newly created object
    pub fn new(id: ObjectId, type_byte: u8, encoder_num: u8, info: TypeInfo) -> Self {
        let enc = if encoder_num != ENCODER_NONE {
            encoder_num | structure::ENCODER_INTERNAL_DATA
        } else {
            ENCODER_NONE | ENCODER_NO_DATA
        };
        let mut chunks = BTreeMap::new();
        if encoder_num != ENCODER_NONE {
            chunks.insert(0, Chunk::new_term(0));
        }
        ObjectRecord {
            id,
            type_byte,
            enc,
            info,
            valid: true,
            header_dirty: true,
            data_dirty: true,
            manual: false,
            est_ram: RECORD_BASE_RAM,
            obj_pos: 0,
            obj_size: 0,
            table_size: 0,
            table: DataTable::None,
            table_idx: 0,
            data_pos: 0,
            data_size: 0,
            chunk_num: 0,
            chunks,
        }
    }

    pub fn base_type(&self) -> u8 {
        self.type_byte & TYPE_BASE_MASK
    }

    pub fn is_leaf(&self) -> bool {
        self.type_byte & TYPE_LEAF != 0
    }

    pub fn is_streamed(&self) -> bool {
        self.type_byte & TYPE_STREAMED != 0
    }

    pub fn encoder(&self) -> u8 {
        self.enc & ENCODER_MASK_DATA_NUM
    }

    pub fn data_method(&self) -> u8 {
        self.enc & ENCODER_MASK_DATA
    }

    pub fn is_data_null(&self) -> bool {
        self.enc == ENCODER_NONE | ENCODER_NO_DATA
    }

    pub fn is_modified(&self) -> bool {
        self.header_dirty || self.data_dirty
    }

    pub fn is_interleaved(&self) -> bool {
        self.data_method() == structure::ENCODER_DATA_CHUNKS_STREAM
    }

    pub fn type_name(&self) -> &'static str {
        match self.type_byte & !TYPE_STREAMED {
            TYPE_RAW_DATA => "raw",
            TYPE_FIXED_ARRAY => "array",
            TYPE_LINKED_LIST => "list",
            t if t == TYPE_LINKED_LIST | TYPE_LEAF => "list_node",
            _ => "unknown",
        }
    }
}

/// Cache handle: slot index plus generation
///
/// Handles survive record relocation on disk but go stale when the record is
/// evicted or deleted; stale handles fail with [`IfdsError::StaleHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjHandle {
    index: u32,
    gen: u32,
}

struct Slot {
    gen: u32,
    opens: u32,
    occupied: bool,
    rec: Option<ObjectRecord>,
}

/// Slot-map arena holding every cached object record
#[derive(Default)]
pub struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning its handle with one open reference
    pub fn insert(&mut self, rec: ObjectRecord) -> ObjHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.occupied = true;
            slot.opens = 0;
            slot.rec = Some(rec);
            ObjHandle {
                index,
                gen: slot.gen,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                gen: 1,
                opens: 0,
                occupied: true,
                rec: Some(rec),
            });
            ObjHandle { index, gen: 1 }
        }
    }

    fn slot(&self, h: ObjHandle) -> Result<&Slot> {
        let slot = self
            .slots
            .get(h.index as usize)
            .ok_or(IfdsError::StaleHandle)?;
        if !slot.occupied || slot.gen != h.gen {
            return Err(IfdsError::StaleHandle);
        }
        Ok(slot)
    }

    fn slot_mut(&mut self, h: ObjHandle) -> Result<&mut Slot> {
        let slot = self
            .slots
            .get_mut(h.index as usize)
            .ok_or(IfdsError::StaleHandle)?;
        if !slot.occupied || slot.gen != h.gen {
            return Err(IfdsError::StaleHandle);
        }
        Ok(slot)
    }

    pub fn get(&self, h: ObjHandle) -> Result<&ObjectRecord> {
        self.slot(h)?
            .rec
            .as_ref()
            .ok_or(IfdsError::InvalidOperation("object record is in use".into()))
    }

    pub fn get_mut(&mut self, h: ObjHandle) -> Result<&mut ObjectRecord> {
        self.slot_mut(h)?
            .rec
            .as_mut()
            .ok_or(IfdsError::InvalidOperation("object record is in use".into()))
    }

    /// Move the record out of its slot for exclusive use
    ///
    /// The slot stays reserved; [`Arena::put`] returns the record. A slot
    /// whose record is out is skipped by cache sweeps.
    pub fn take(&mut self, h: ObjHandle) -> Result<ObjectRecord> {
        self.slot_mut(h)?
            .rec
            .take()
            .ok_or(IfdsError::InvalidOperation("object record is in use".into()))
    }

    pub fn put(&mut self, h: ObjHandle, rec: ObjectRecord) {
        if let Ok(slot) = self.slot_mut(h) {
            slot.rec = Some(rec);
        }
    }

    /// Whether the record is currently moved out by [`Arena::take`]
    pub fn is_taken(&self, h: ObjHandle) -> bool {
        matches!(self.slot(h), Ok(slot) if slot.rec.is_none())
    }

    /// Remove the record and invalidate all handles to it
    pub fn remove(&mut self, h: ObjHandle) -> Result<ObjectRecord> {
        let slot = self.slot_mut(h)?;
        let rec = slot
            .rec
            .take()
            .ok_or(IfdsError::InvalidOperation("object record is in use".into()))?;
        slot.occupied = false;
        slot.opens = 0;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(h.index);
        Ok(rec)
    }

    pub fn open(&mut self, h: ObjHandle) -> Result<()> {
        self.slot_mut(h)?.opens += 1;
        Ok(())
    }

    pub fn release(&mut self, h: ObjHandle) -> Result<()> {
        let slot = self.slot_mut(h)?;
        slot.opens = slot.opens.saturating_sub(1);
        Ok(())
    }

    pub fn opens(&self, h: ObjHandle) -> u32 {
        self.slot(h).map(|s| s.opens).unwrap_or(0)
    }

    /// Handles of all occupied slots (including ones with records in use)
    pub fn handles(&self) -> Vec<ObjHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.occupied)
            .map(|(i, s)| ObjHandle {
                index: i as u32,
                gen: s.gen,
            })
            .collect()
    }
}

/// Per-base-type header payload codec
///
/// `decode` consumes a prefix of the payload (the internal-data region has
/// already been stripped by the loader) and returns the consumed length.
pub trait TypeCodec {
    fn encode(&self, rec: &ObjectRecord) -> Vec<u8>;
    fn decode(&self, rec: &mut ObjectRecord, payload: &[u8]) -> Result<usize>;
    fn can_delete(&self, _rec: &ObjectRecord) -> bool {
        true
    }
}

/// Fixed array: `entry_size(u32)` + `entry_count(u32)`
pub struct FixedArrayCodec;

impl TypeCodec for FixedArrayCodec {
    fn encode(&self, rec: &ObjectRecord) -> Vec<u8> {
        let (entry_size, entries) = match rec.info {
            TypeInfo::FixedArray {
                entry_size,
                entries,
            } => (entry_size, entries),
            _ => (0, 0),
        };
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&entry_size.to_be_bytes());
        out.extend_from_slice(&entries.to_be_bytes());
        out
    }

    fn decode(&self, rec: &mut ObjectRecord, payload: &[u8]) -> Result<usize> {
        if payload.len() < 8 {
            return Err(IfdsError::Corrupted(
                "fixed array info requires 8 bytes".into(),
            ));
        }
        rec.info = TypeInfo::FixedArray {
            entry_size: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
            entries: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
        };
        Ok(8)
    }
}

/// Linked list: head is `count/first/last`, leaf node is `prev/next`
pub struct LinkedListCodec;

impl TypeCodec for LinkedListCodec {
    fn encode(&self, rec: &ObjectRecord) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        match rec.info {
            TypeInfo::ListNode { prev, next } => {
                out.extend_from_slice(&prev.to_be_bytes());
                out.extend_from_slice(&next.to_be_bytes());
            }
            TypeInfo::LinkedList { nodes, first, last } => {
                out.extend_from_slice(&nodes.to_be_bytes());
                out.extend_from_slice(&first.to_be_bytes());
                out.extend_from_slice(&last.to_be_bytes());
            }
            _ => {
                if rec.is_leaf() {
                    out.resize(8, 0);
                } else {
                    out.resize(12, 0);
                }
            }
        }
        out
    }

    fn decode(&self, rec: &mut ObjectRecord, payload: &[u8]) -> Result<usize> {
        if rec.is_leaf() {
            if payload.len() < 8 {
                return Err(IfdsError::Corrupted(
                    "list node info requires 8 bytes".into(),
                ));
            }
            rec.info = TypeInfo::ListNode {
                prev: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                next: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
            };
            Ok(8)
        } else {
            if payload.len() < 12 {
                return Err(IfdsError::Corrupted(
                    "linked list info requires 12 bytes".into(),
                ));
            }
            rec.info = TypeInfo::LinkedList {
                nodes: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                first: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                last: u32::from_be_bytes(payload[8..12].try_into().unwrap()),
            };
            Ok(12)
        }
    }

    fn can_delete(&self, rec: &ObjectRecord) -> bool {
        match rec.info {
            TypeInfo::ListNode { prev, next } => prev == 0 && next == 0,
            TypeInfo::LinkedList { first, last, .. } => first == 0 && last == 0,
            _ => true,
        }
    }
}

/// Pass-through codec for unknown/extension base types
pub struct PassThroughCodec;

impl TypeCodec for PassThroughCodec {
    fn encode(&self, rec: &ObjectRecord) -> Vec<u8> {
        match &rec.info {
            TypeInfo::Raw(bytes) => bytes.clone(),
            _ => Vec::new(),
        }
    }

    fn decode(&self, rec: &mut ObjectRecord, payload: &[u8]) -> Result<usize> {
        rec.info = TypeInfo::Raw(payload.to_vec());
        Ok(payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::ENCODER_RAW;

    fn raw_record(id: ObjectId) -> ObjectRecord {
        ObjectRecord::new(id, TYPE_RAW_DATA, ENCODER_RAW, TypeInfo::None)
    }

    #[test]
    fn arena_insert_take_put() {
        let mut arena = Arena::new();
        let h = arena.insert(raw_record(1));
        assert_eq!(arena.get(h).unwrap().id, 1);

        let rec = arena.take(h).unwrap();
        assert!(arena.is_taken(h));
        assert!(arena.take(h).is_err());
        arena.put(h, rec);
        assert!(!arena.is_taken(h));
    }

    #[test]
    fn arena_stale_handle_after_remove() {
        let mut arena = Arena::new();
        let h = arena.insert(raw_record(5));
        arena.remove(h).unwrap();
        assert!(matches!(arena.get(h), Err(IfdsError::StaleHandle)));

        // Slot reuse must not resurrect the old handle.
        let h2 = arena.insert(raw_record(6));
        assert!(matches!(arena.get(h), Err(IfdsError::StaleHandle)));
        assert_eq!(arena.get(h2).unwrap().id, 6);
    }

    #[test]
    fn arena_open_counts() {
        let mut arena = Arena::new();
        let h = arena.insert(raw_record(1));
        assert_eq!(arena.opens(h), 0);
        arena.open(h).unwrap();
        arena.open(h).unwrap();
        assert_eq!(arena.opens(h), 2);
        arena.release(h).unwrap();
        assert_eq!(arena.opens(h), 1);
    }

    #[test]
    fn fixed_array_codec_round_trip() {
        let codec = FixedArrayCodec;
        let mut rec = ObjectRecord::new(1, TYPE_FIXED_ARRAY, ENCODER_RAW, TypeInfo::None);
        rec.info = TypeInfo::FixedArray {
            entry_size: 12,
            entries: 99,
        };
        let bytes = codec.encode(&rec);
        assert_eq!(bytes.len(), 8);

        let mut rec2 = ObjectRecord::new(2, TYPE_FIXED_ARRAY, ENCODER_RAW, TypeInfo::None);
        assert_eq!(codec.decode(&mut rec2, &bytes).unwrap(), 8);
        assert_eq!(rec2.info, rec.info);
    }

    #[test]
    fn linked_list_codec_delete_verifier() {
        let codec = LinkedListCodec;
        let mut node = ObjectRecord::new(
            3,
            TYPE_LINKED_LIST | TYPE_LEAF,
            ENCODER_RAW,
            TypeInfo::ListNode { prev: 0, next: 0 },
        );
        assert!(codec.can_delete(&node));
        node.info = TypeInfo::ListNode { prev: 2, next: 0 };
        assert!(!codec.can_delete(&node));

        let head = ObjectRecord::new(
            4,
            TYPE_LINKED_LIST,
            ENCODER_NONE,
            TypeInfo::LinkedList {
                nodes: 0,
                first: 0,
                last: 0,
            },
        );
        assert!(codec.can_delete(&head));
    }
}
