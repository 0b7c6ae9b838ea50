//! Container engine
//!
//! [`Ifds`] owns everything: the storage port, the decoded file header, the
//! object cache (arena), the name map, and the root ID/free-space maps. No
//! process-wide state exists; independent engines over independent storage
//! are always safe.
//!
//! The engine is single-threaded and synchronous. At most one interleaved
//! streaming write may be open engine-wide; while it is in flight, all other
//! object writes fail with a write conflict until the stream finalizes.

use crate::error::{IfdsError, Result};
use crate::freespace::FreeMapState;
use crate::header::{AppVersion, FileHeader, DEFAULT_FEATURES, FEATURE_NODE_IDS};
use crate::idmap::IdMapState;
use crate::object::{
    Arena, Chunk, DataTable, FixedArrayCodec, LinkedListCodec, ObjHandle, ObjectId, ObjectRecord,
    PassThroughCodec, TypeCodec, TypeInfo, CHUNK_BASE_RAM,
};
use crate::storage::Storage;
use crate::structure::{
    self, parse_structure, LocEntry, Parsed, RawStructure, ENCODER_DATA_CHUNKS,
    ENCODER_DATA_CHUNKS_STREAM, ENCODER_INTERNAL_DATA, ENCODER_KEY_ID_MAP, ENCODER_KEY_VALUE_MAP,
    ENCODER_NONE, ENCODER_RAW, TYPE_DATA_CHUNKS, TYPE_FIXED_ARRAY, TYPE_LEAF, TYPE_LINKED_LIST,
    TYPE_RAW_DATA,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, trace, warn};

/// Default ceiling for estimated resident object memory (bytes)
pub const DEFAULT_MAX_RAM: u64 = 10_000_000;

/// Decoded name map: string name to object ID
pub(crate) struct NameMapState {
    pub handle: ObjHandle,
    pub entries: BTreeMap<Vec<u8>, u32>,
    pub dirty: bool,
}

/// A structure materialized by [`Ifds::read_next_structure`]
#[derive(Debug)]
pub(crate) enum LoadedStructure {
    Gap {
        len: usize,
    },
    DataChunk {
        term: bool,
        streamed: bool,
        channel: Option<u16>,
        data: Vec<u8>,
        valid: bool,
    },
    Locations {
        table: Vec<LocEntry>,
        entry_count: usize,
        valid: bool,
    },
    Object {
        handle: ObjHandle,
        valid: bool,
    },
}

#[derive(Debug)]
pub(crate) struct ReadOutcome {
    pub structure: LoadedStructure,
    /// Size hint for the next sequential read
    pub next_size: usize,
    /// Raw frame bytes when requested
    pub raw: Option<Vec<u8>>,
}

/// The container engine
pub struct Ifds {
    pub(crate) storage: Box<dyn Storage>,
    pub(crate) open: bool,
    pub(crate) magic: Option<String>,
    pub(crate) header: Option<FileHeader>,
    pub(crate) arena: Arena,
    pub(crate) by_id: HashMap<ObjectId, ObjHandle>,
    pub(crate) by_pos: HashMap<u64, ObjectId>,
    pub(crate) next_id: u64,
    pub(crate) next_neg_id: i64,
    pub(crate) name_map: Option<NameMapState>,
    pub(crate) id_map: Option<IdMapState>,
    pub(crate) free_map: Option<FreeMapState>,
    /// The single in-flight interleaved stream, if any
    pub(crate) inflight: Option<ObjHandle>,
    pub(crate) est_ram: u64,
    pub(crate) max_ram: u64,
    codecs: HashMap<u8, Box<dyn TypeCodec>>,
}

impl Ifds {
    pub(crate) fn new_empty(storage: Box<dyn Storage>, magic: Option<String>) -> Self {
        let mut codecs: HashMap<u8, Box<dyn TypeCodec>> = HashMap::new();
        codecs.insert(TYPE_FIXED_ARRAY, Box::new(FixedArrayCodec));
        codecs.insert(TYPE_LINKED_LIST, Box::new(LinkedListCodec));
        Ifds {
            storage,
            open: false,
            magic,
            header: None,
            arena: Arena::new(),
            by_id: HashMap::new(),
            by_pos: HashMap::new(),
            next_id: 1,
            next_neg_id: -1,
            name_map: None,
            id_map: None,
            free_map: None,
            inflight: None,
            est_ram: 0,
            max_ram: DEFAULT_MAX_RAM,
            codecs,
        }
    }

    /// Create a new container on empty storage with default features
    pub fn create(storage: Box<dyn Storage>, app_ver: AppVersion) -> Result<Self> {
        Self::create_with(storage, app_ver, None, DEFAULT_FEATURES, 0)
    }

    /// Create a new container with an explicit magic string and feature sets
    pub fn create_with(
        storage: Box<dyn Storage>,
        app_ver: AppVersion,
        magic: Option<&str>,
        ifds_features: u32,
        fmt_features: u32,
    ) -> Result<Self> {
        if storage.max_pos() > 0 {
            return Err(IfdsError::AlreadyExists);
        }

        let magic_str = magic.unwrap_or(crate::header::DEFAULT_MAGIC).to_string();
        info!(magic = %magic_str, "Creating container");

        let mut engine = Self::new_empty(storage, Some(magic_str.clone()));
        engine.open = true;
        engine.header = Some(FileHeader::new_for_create(
            &magic_str,
            app_ver,
            ifds_features,
            fmt_features,
        ));

        // Named object table; created before the ID map exists, so it gets a
        // transient ID like every other root structure.
        let h = engine.create_object(
            TYPE_RAW_DATA,
            ENCODER_KEY_ID_MAP,
            None,
            TypeInfo::None,
            true,
        )?;
        engine.arena.get_mut(h)?.manual = true;
        engine.name_map = Some(NameMapState {
            handle: h,
            entries: BTreeMap::new(),
            dirty: false,
        });

        engine.create_id_root()?;
        engine.write_header()?;

        Ok(engine)
    }

    /// Open an existing container
    ///
    /// Pass `magic: None` to sniff the magic string from the header.
    pub fn open(storage: Box<dyn Storage>, magic: Option<&str>) -> Result<Self> {
        if storage.max_pos() == 0 {
            return Err(IfdsError::InvalidOperation(
                "no file data; use the stream reader for streaming content".into(),
            ));
        }

        let mut engine = Self::new_empty(storage, magic.map(|m| m.to_string()));
        engine.open = true;
        engine.load_file_header()?;
        info!(magic = %engine.header.as_ref().unwrap().magic, "Opened container");

        // A container finalized purely as a stream has zeroed root pointers;
        // its last record carries the map positions instead.
        let (name_pos, id_pos) = {
            let hdr = engine.header.as_ref().unwrap();
            (hdr.name_map_pos, hdr.id_map_pos)
        };
        if name_pos == 0 || id_pos == 0 {
            let max = engine.max_pos();
            if max < 24 {
                return Err(IfdsError::Corrupted(
                    "missing trailing stream record".into(),
                ));
            }
            let mut filepos = max - 24;
            let mut buf = Vec::new();
            let outcome = engine
                .read_next_structure(&mut filepos, &mut buf, 24, false)
                .map_err(fatal_eof)?;
            match outcome.structure {
                LoadedStructure::DataChunk {
                    streamed: false,
                    term: true,
                    data,
                    ..
                } if data.len() == 16 => {
                    let hdr = engine.header.as_mut().unwrap();
                    hdr.name_map_pos = u64::from_be_bytes(data[0..8].try_into().unwrap());
                    hdr.id_map_pos = u64::from_be_bytes(data[8..16].try_into().unwrap());
                }
                _ => {
                    return Err(IfdsError::Corrupted(
                        "last file chunk does not contain streaming header information".into(),
                    ))
                }
            }
        }

        // Load the name map eagerly.
        let name_pos = engine.header.as_ref().unwrap().name_map_pos;
        let h = engine.get_object_by_position(name_pos, 4092)?;
        if engine.arena.get(h)?.encoder() != ENCODER_KEY_ID_MAP {
            return Err(IfdsError::InvalidObject(
                "name map is not a key to object ID map".into(),
            ));
        }
        let map = engine.get_key_id_map_raw(h)?;
        engine.arena.get_mut(h)?.manual = true;
        engine.name_map = Some(NameMapState {
            handle: h,
            entries: map,
            dirty: false,
        });

        if !engine.load_id_root(false)? {
            return Err(IfdsError::Corrupted(
                "failed to load object ID table chunks map".into(),
            ));
        }

        engine.next_id = engine.find_next_available_id(0)?;

        Ok(engine)
    }

    /// Whether the header and both root maps passed CRC validation
    pub fn is_valid(&self) -> bool {
        let hdr_ok = self.header.as_ref().map(|h| h.valid).unwrap_or(false);
        let name_ok = self
            .name_map
            .as_ref()
            .and_then(|nm| self.arena.get(nm.handle).ok())
            .map(|r| r.valid)
            .unwrap_or(false);
        let id_ok = self
            .id_map
            .as_ref()
            .and_then(|im| self.arena.get(im.root).ok())
            .map(|r| r.valid)
            .unwrap_or(false);
        hdr_ok && name_ok && id_ok
    }

    /// Flush everything and release the storage port
    pub fn close(mut self) -> Result<()> {
        self.flush_all()?;
        self.storage.sync(true)?;
        self.open = false;
        Ok(())
    }

    pub fn max_ram(&self) -> u64 {
        self.max_ram
    }

    pub fn set_max_ram(&mut self, max_ram: u64) {
        self.max_ram = max_ram;
    }

    pub fn estimated_ram(&self) -> u64 {
        self.est_ram
    }

    pub fn header(&self) -> Option<&FileHeader> {
        self.header.as_ref()
    }

    /// Update the application format version, marking the header dirty
    pub fn set_app_format_version(&mut self, ver: AppVersion) {
        if let Some(hdr) = self.header.as_mut() {
            hdr.app_ver = ver;
            hdr.dirty = true;
        }
    }

    pub fn app_format_features(&self) -> u32 {
        self.header.as_ref().map(|h| h.fmt_features).unwrap_or(0)
    }

    pub fn set_app_format_features(&mut self, features: u32) {
        if let Some(hdr) = self.header.as_mut() {
            if hdr.fmt_features != features {
                hdr.fmt_features = features;
                hdr.dirty = true;
            }
        }
    }

    /// Register a codec for an extension base type (4..=0x3E)
    pub fn set_type_codec(&mut self, base_type: u8, codec: Box<dyn TypeCodec>) {
        self.codecs.insert(base_type, codec);
    }

    pub(crate) fn encode_info(&self, rec: &ObjectRecord) -> Vec<u8> {
        match self.codecs.get(&rec.base_type()) {
            Some(codec) => codec.encode(rec),
            None => PassThroughCodec.encode(rec),
        }
    }

    pub(crate) fn decode_info(&self, rec: &mut ObjectRecord, payload: &[u8]) -> Result<usize> {
        match self.codecs.get(&rec.base_type()) {
            Some(codec) => codec.decode(rec, payload),
            None => PassThroughCodec.decode(rec, payload),
        }
    }

    pub(crate) fn can_delete_info(&self, rec: &ObjectRecord) -> bool {
        match self.codecs.get(&rec.base_type()) {
            Some(codec) => codec.can_delete(rec),
            None => true,
        }
    }

    // ---- storage port helpers -------------------------------------------

    pub(crate) fn max_pos(&self) -> u64 {
        if self.open {
            self.storage.max_pos()
        } else {
            0
        }
    }

    /// Read up to `len` bytes at `pos`; `None` means nothing was available
    pub(crate) fn read_at(&mut self, pos: u64, len: usize) -> Result<Option<Vec<u8>>> {
        if !self.open {
            return Ok(None);
        }
        self.storage.seek(pos)?;
        let mut buf = vec![0u8; len];
        let n = self.storage.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    pub(crate) fn write_at(&mut self, data: &[u8], pos: u64) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        self.storage.seek(pos)?;
        self.storage.write(data)
    }

    // ---- header ---------------------------------------------------------

    pub(crate) fn load_file_header(&mut self) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        if self.header.is_some() {
            return Ok(());
        }

        if self.magic.is_none() {
            let data = self.read_at(0, 128)?.unwrap_or_default();
            self.magic = Some(FileHeader::sniff_magic(&data)?);
        }
        let magic = self.magic.clone().unwrap();
        let size = FileHeader::encoded_size(&magic) as usize;
        let data = self.read_at(0, size)?.unwrap_or_default();
        let header = FileHeader::decode(&data, &magic)?;
        if !header.valid {
            warn!("File header failed CRC validation");
        }
        self.header = Some(header);
        Ok(())
    }

    /// Rewrite the file header in place if it is dirty
    pub fn write_header(&mut self) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        if let Some(hdr) = self.header.as_ref() {
            if hdr.dirty {
                let data = hdr.encode();
                self.write_at(&data, 0)?;
                let hdr = self.header.as_mut().unwrap();
                hdr.size = data.len() as u64;
                hdr.dirty = false;
            }
        }
        Ok(())
    }

    // ---- structure reading ----------------------------------------------

    /// Read and materialize the next structure at `filepos`
    ///
    /// `buf` carries unconsumed bytes across calls; `filepos` advances past
    /// the consumed structure. Object headers are loaded into the cache and
    /// their DATA table (locations table or stream cursor) initialized.
    pub(crate) fn read_next_structure(
        &mut self,
        filepos: &mut u64,
        buf: &mut Vec<u8>,
        size: usize,
        raw: bool,
    ) -> Result<ReadOutcome> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        if let Some(hdr) = self.header.as_ref() {
            if *filepos < hdr.size {
                return Err(IfdsError::InvalidOperation(
                    "file position is located inside the file header".into(),
                ));
            }
        }

        let size = size.max(8);
        while buf.len() < size {
            match self.read_at(*filepos + buf.len() as u64, size - buf.len())? {
                Some(data) => buf.extend_from_slice(&data),
                None => break,
            }
        }

        let parsed = match parse_structure(buf, 0) {
            Ok(p) => p,
            Err(IfdsError::InsufficientData { mut needed }) => {
                // Read exactly the missing bytes, then probe ahead so the
                // next sequential read is properly sized.
                while needed > 0 {
                    match self.read_at(*filepos + buf.len() as u64, needed)? {
                        Some(data) => {
                            needed -= data.len().min(needed);
                            buf.extend_from_slice(&data);
                        }
                        None => {
                            return Err(IfdsError::InsufficientData {
                                needed,
                            })
                        }
                    }
                }
                if let Some(data) = self.read_at(*filepos + buf.len() as u64, 4)? {
                    buf.extend_from_slice(&data);
                }
                parse_structure(buf, 0)?
            }
            Err(e) => return Err(e),
        };

        let Parsed {
            structure,
            consumed,
        } = parsed;
        let raw_bytes = raw.then(|| buf[..consumed].to_vec());

        let loaded = match structure {
            RawStructure::Gap { len, .. } => LoadedStructure::Gap { len },
            RawStructure::DataChunk {
                term,
                streamed,
                channel,
                data,
                valid,
            } => LoadedStructure::DataChunk {
                term,
                streamed,
                channel,
                data,
                valid,
            },
            RawStructure::Locations {
                table,
                entry_count,
                valid,
            } => LoadedStructure::Locations {
                table,
                entry_count,
                valid,
            },
            RawStructure::ObjectHeader {
                type_byte,
                enc,
                payload,
                valid,
            } => {
                let handle =
                    self.materialize_object(type_byte, enc, &payload, valid, *filepos, consumed)?;
                let valid = self.arena.get(handle)?.valid;
                LoadedStructure::Object { handle, valid }
            }
        };

        buf.drain(..consumed);
        *filepos += consumed as u64;
        let next_size = structure::next_frame_size_hint(buf);

        if let LoadedStructure::Object { handle, .. } = &loaded {
            self.load_object_data_table(*handle, buf, next_size)?;
        }

        Ok(ReadOutcome {
            structure: loaded,
            next_size,
            raw: raw_bytes,
        })
    }

    /// Build (or find) the cache record for a parsed object header
    fn materialize_object(
        &mut self,
        type_byte: u8,
        enc: u8,
        payload: &[u8],
        mut valid: bool,
        filepos: u64,
        frame_len: usize,
    ) -> Result<ObjHandle> {
        let node_ids = self
            .header
            .as_ref()
            .map(|h| h.has_feature(FEATURE_NODE_IDS))
            .unwrap_or(false);

        let id = if node_ids && payload.len() >= 4 {
            u32::from_be_bytes(payload[0..4].try_into().unwrap()) as i64
        } else {
            0
        };

        // An already-cached object wins over a reparse of its header bytes.
        if id > 0 {
            if let Some(&h) = self.by_id.get(&id) {
                let rec = self.arena.get_mut(h)?;
                rec.obj_pos = filepos;
                self.by_pos.insert(filepos, id);
                return Ok(h);
            }
        }

        self.reduce_cache()?;

        let assigned_id = if id > 0 {
            id
        } else {
            let t = self.next_neg_id;
            self.next_neg_id -= 1;
            t
        };

        let mut rec = ObjectRecord::new(assigned_id, type_byte, structure::encoder_num(enc), TypeInfo::None);
        rec.enc = enc;
        rec.header_dirty = false;
        rec.data_dirty = false;
        rec.obj_pos = filepos;
        rec.obj_size = frame_len as u64;
        rec.chunks.clear();

        let extra = if node_ids { 4 } else { 0 };
        let region = &payload[extra.min(payload.len())..];

        // Internal data lives at the tail of the header payload: the bytes
        // immediately before a trailing u16 length.
        let (info_region, internal_data) =
            if rec.data_method() == ENCODER_INTERNAL_DATA {
                if region.len() < 2 {
                    return Err(IfdsError::Corrupted("insufficient structure size".into()));
                }
                let mut datasize =
                    u16::from_be_bytes(region[region.len() - 2..].try_into().unwrap()) as usize;
                if datasize > region.len() - 2 {
                    datasize = region.len() - 2;
                    valid = false;
                }
                let split = region.len() - 2 - datasize;
                (&region[..split], Some(region[split..region.len() - 2].to_vec()))
            } else {
                (region, None)
            };

        rec.valid = valid;
        self.decode_info(&mut rec, info_region)?;

        if let Some(data) = internal_data {
            let mut chunk = Chunk::new_term(0);
            chunk.dirty = false;
            chunk.valid = valid;
            rec.data_size = data.len() as u64;
            rec.est_ram += data.len() as u64 + CHUNK_BASE_RAM;
            chunk.data = data;
            rec.chunks.insert(0, chunk);
        }

        self.est_ram += rec.est_ram;
        let h = self.arena.insert(rec);
        self.by_id.insert(assigned_id, h);
        self.by_pos.insert(filepos, assigned_id);
        Ok(h)
    }

    /// Load the DATA index that follows the object header on disk
    fn load_object_data_table(
        &mut self,
        h: ObjHandle,
        buf: &mut Vec<u8>,
        size: usize,
    ) -> Result<()> {
        let (method, table_none, mut filepos) = {
            let rec = self.arena.get(h)?;
            (
                rec.data_method(),
                rec.table.is_none(),
                rec.obj_pos + rec.obj_size,
            )
        };
        if !table_none {
            return Ok(());
        }

        if method == ENCODER_DATA_CHUNKS {
            let outcome = self
                .read_next_structure(&mut filepos, buf, size, false)
                .map_err(fatal_eof)?;
            match outcome.structure {
                LoadedStructure::Locations {
                    table,
                    entry_count,
                    valid,
                } => {
                    let rec = self.arena.get_mut(h)?;
                    if !valid {
                        rec.valid = false;
                    }
                    let last = table.last().copied();
                    rec.table_size = (entry_count as u64 - 1) * 10 + 18;
                    if let Some(last) = last {
                        rec.data_size = last.data_pos + last.data_size;
                    }
                    rec.table = DataTable::Seekable(table);
                }
                _ => {
                    return Err(IfdsError::ReadFailed(
                        "DATA locations table expected to follow object".into(),
                    ))
                }
            }
        } else if method == ENCODER_DATA_CHUNKS_STREAM {
            let mut head: Vec<u8> = buf.iter().take(4).copied().collect();
            while head.len() < 4 {
                match self.read_at(filepos + head.len() as u64, 4 - head.len())? {
                    Some(data) => head.extend_from_slice(&data),
                    None => {
                        return Err(IfdsError::ReadFailed(
                            "unable to retrieve interleaved DATA chunk header".into(),
                        ))
                    }
                }
            }
            if head[0] != (TYPE_DATA_CHUNKS | structure::TYPE_STREAMED)
                || (head[1] != structure::DC_DATA && head[1] != structure::DC_DATA_TERM)
            {
                return Err(IfdsError::ReadFailed(
                    "interleaved DATA chunk expected to follow streaming object".into(),
                ));
            }
            let rec = self.arena.get_mut(h)?;
            rec.table = DataTable::StreamCursor {
                pos: filepos,
                buf: head,
            };
        }
        Ok(())
    }

    // ---- object lifecycle ------------------------------------------------

    /// Create a new object record in the cache
    ///
    /// `with_id: false` (or a missing ID map) assigns a descending transient
    /// negative ID that is never indexed.
    pub fn create_object(
        &mut self,
        type_byte: u8,
        encoder_num: u8,
        name: Option<&str>,
        info: TypeInfo,
        with_id: bool,
    ) -> Result<ObjHandle> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }

        self.reduce_cache()?;

        let id: ObjectId = if self.id_map.is_none() || !with_id {
            let t = self.next_neg_id;
            self.next_neg_id -= 1;
            t
        } else {
            if let Some(name) = name {
                if self.name_map_id(name).is_some() {
                    return Err(IfdsError::NameExists(name.to_string()));
                }
            }
            let id = self.next_id;
            if id >= 4_294_967_296 {
                return Err(IfdsError::IdLimitReached);
            }
            self.mark_id_assigned(id as u32)?;
            self.next_id = self.find_next_available_id(self.next_id as i64)?;
            if let Some(name) = name {
                self.set_name_map_id(name, id as u32);
            }
            id as i64
        };

        trace!(id, type_byte, encoder_num, "Creating object");

        let rec = ObjectRecord::new(id, type_byte, encoder_num, info);
        self.est_ram += rec.est_ram;
        let h = self.arena.insert(rec);
        self.by_id.insert(id, h);
        self.arena.open(h)?;
        Ok(h)
    }

    /// Create a raw data object
    pub fn create_raw_data(&mut self, encoder_num: u8, name: Option<&str>) -> Result<ObjHandle> {
        self.create_object(TYPE_RAW_DATA, encoder_num, name, TypeInfo::None, true)
    }

    /// Create a key to object-ID map
    pub fn create_key_id_map(&mut self, name: Option<&str>) -> Result<ObjHandle> {
        self.create_object(TYPE_RAW_DATA, ENCODER_KEY_ID_MAP, name, TypeInfo::None, true)
    }

    /// Create a key-value map
    pub fn create_key_value_map(&mut self, name: Option<&str>) -> Result<ObjHandle> {
        self.create_object(
            TYPE_RAW_DATA,
            ENCODER_KEY_VALUE_MAP,
            name,
            TypeInfo::None,
            true,
        )
    }

    /// Create a fixed-stride array object
    pub fn create_fixed_array(&mut self, entry_size: u32, name: Option<&str>) -> Result<ObjHandle> {
        self.create_fixed_array_internal(entry_size, name, true)
    }

    pub(crate) fn create_fixed_array_internal(
        &mut self,
        entry_size: u32,
        name: Option<&str>,
        with_id: bool,
    ) -> Result<ObjHandle> {
        self.create_object(
            TYPE_FIXED_ARRAY,
            ENCODER_RAW,
            name,
            TypeInfo::FixedArray {
                entry_size,
                entries: 0,
            },
            with_id,
        )
    }

    /// Create a linked list head; `streaming` records only previous
    /// pointers until normalized
    pub fn create_linked_list(&mut self, name: Option<&str>, streaming: bool) -> Result<ObjHandle> {
        let type_byte = if streaming {
            TYPE_LINKED_LIST | structure::TYPE_STREAMED
        } else {
            TYPE_LINKED_LIST
        };
        self.create_object(
            type_byte,
            ENCODER_NONE,
            name,
            TypeInfo::LinkedList {
                nodes: 0,
                first: 0,
                last: 0,
            },
            true,
        )
    }

    /// Create a linked list node
    pub fn create_linked_list_node(
        &mut self,
        encoder_num: u8,
        name: Option<&str>,
    ) -> Result<ObjHandle> {
        self.create_object(
            TYPE_LINKED_LIST | TYPE_LEAF,
            encoder_num,
            name,
            TypeInfo::ListNode { prev: 0, next: 0 },
            true,
        )
    }

    /// Resolve an object by its header file position, loading it on miss
    pub fn get_object_by_position(&mut self, filepos: u64, size_hint: usize) -> Result<ObjHandle> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        if !self.by_pos.contains_key(&filepos) {
            let mut pos = filepos;
            let mut buf = Vec::new();
            let outcome = self
                .read_next_structure(&mut pos, &mut buf, size_hint + 4, false)
                .map_err(fatal_eof)?;
            match outcome.structure {
                LoadedStructure::Object { .. } => {}
                _ => {
                    return Err(IfdsError::InvalidObject(
                        "the data at the specified location is not an object".into(),
                    ))
                }
            }
        }
        let id = *self
            .by_pos
            .get(&filepos)
            .ok_or_else(|| IfdsError::InvalidObject("object position not cached".into()))?;
        let h = *self
            .by_id
            .get(&id)
            .ok_or(IfdsError::ObjectNotFound(id))?;
        self.arena.open(h)?;
        Ok(h)
    }

    /// Resolve an object by name via the name map
    pub fn get_object_by_name(&mut self, name: &str) -> Result<ObjHandle> {
        let id = self
            .name_map_id(name)
            .ok_or_else(|| IfdsError::NameNotFound(name.to_string()))?;
        self.get_object_by_id(id as i64, true)
    }

    /// Write the object header (and any owed data structures) to storage
    ///
    /// No-op for unmodified objects. Growth relocates the object: the old
    /// bytes are freed and a new slot reserved. For a streaming object this
    /// registers it as the engine's single in-flight stream.
    pub fn write_object(&mut self, h: ObjHandle) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        self.process_inflight()?;
        if self.inflight.is_some() {
            return Err(IfdsError::WriteConflict);
        }

        let no_refs = self.arena.opens(h) < 1;
        let mut rec = self.arena.take(h)?;
        let result = self.write_object_inner(&mut rec, no_refs);
        let method = rec.data_method();
        self.arena.put(h, rec);
        result?;

        if method == ENCODER_DATA_CHUNKS_STREAM {
            self.inflight = Some(h);
            self.process_inflight()?;
        }
        Ok(())
    }

    pub(crate) fn write_object_inner(&mut self, rec: &mut ObjectRecord, no_refs: bool) -> Result<()> {
        let method = rec.data_method();
        let mut num_chunks = 0u64;
        let mut min_chunk_size = 0u64;

        if method == ENCODER_DATA_CHUNKS {
            let mut y: u64 = 18;

            if matches!(rec.table, DataTable::Seekable(_)) {
                let force = self
                    .header
                    .as_ref()
                    .map(|hdr| rec.obj_pos < hdr.size)
                    .unwrap_or(true);
                self.flush_object_chunks(rec, force, no_refs)?;
            }

            // Newly full chunks that still need table space.
            for chunk in rec.chunks.values() {
                let len = chunk.data.len() as u64;
                if chunk.file_size < len + 8 {
                    if len >= structure::CHUNK_PAYLOAD as u64 {
                        num_chunks += 1;
                    } else {
                        min_chunk_size = len + 8;
                    }
                }
            }
            let new_entries = num_chunks / 65535 + 1;

            if matches!(rec.table, DataTable::Seekable(_)) {
                if num_chunks > 0 {
                    self.merge_down_chunks(rec, new_entries)?;
                }
                let table_len = match &rec.table {
                    DataTable::Seekable(t) => t.len() as u64,
                    _ => 0,
                };
                y += table_len.saturating_sub(1) * 10;
            }
            if num_chunks > 0 {
                y += new_entries * 10;
            }

            // The object and its locations table relocate together.
            if rec.table_size < y {
                self.clear_object_storage(rec)?;
                rec.table_size = y;
                rec.header_dirty = true;
            }
        } else if method == ENCODER_INTERNAL_DATA && rec.data_dirty {
            rec.header_dirty = true;
        }

        if rec.header_dirty {
            let node_ids = self
                .header
                .as_ref()
                .map(|h| h.has_feature(FEATURE_NODE_IDS))
                .unwrap_or(false);

            let info_bytes = self.encode_info(rec);

            let mut y = info_bytes.len() as u64;
            if node_ids {
                y += 4;
            }
            if method == ENCODER_INTERNAL_DATA {
                y += rec.data_size + 2;
            }
            if y + 8 < rec.obj_size {
                y = rec.obj_size - 8;
            }
            if y > structure::MAX_OBJECT_PAYLOAD as u64 {
                return Err(IfdsError::ObjectTooLarge);
            }

            let mut data = Vec::with_capacity(y as usize + 8);
            data.push(rec.type_byte);
            data.push(rec.enc);
            data.extend_from_slice(&(y as u16).to_be_bytes());
            if node_ids {
                let id = if rec.id > 0 { rec.id as u32 } else { 0 };
                data.extend_from_slice(&id.to_be_bytes());
            }
            data.extend_from_slice(&info_bytes);

            if method == ENCODER_INTERNAL_DATA {
                let pad = (y + 4)
                    .saturating_sub(data.len() as u64 + rec.data_size + 2);
                data.resize(data.len() + pad as usize, 0);
                if let Some(chunk) = rec.chunks.get(&0) {
                    data.extend_from_slice(&chunk.data);
                }
                data.extend_from_slice(&(rec.data_size as u16).to_be_bytes());
            } else {
                let pad = (y + 4).saturating_sub(data.len() as u64);
                data.resize(data.len() + pad as usize, 0);
            }

            let crc = crc32fast::hash(&data);
            data.extend_from_slice(&crc.to_be_bytes());
            let total = data.len() as u64;

            // Relocate when the encoded header outgrew its slot.
            if rec.obj_size < total {
                if rec.obj_pos > 0 {
                    self.clear_object_storage(rec)?;
                }
                if method == ENCODER_DATA_CHUNKS_STREAM {
                    if self.can_write_inner(rec) {
                        rec.obj_pos = self.max_pos();
                    } else {
                        // Relocating a finalized stream: header plus every
                        // chunk move together.
                        let need = total + rec.data_size + rec.chunk_num * 10;
                        rec.obj_pos = self.reserve_bytes(need, None)?;
                        let mut pos = rec.obj_pos + total;
                        for chunk in rec.chunks.values_mut() {
                            let size = chunk.data.len() as u64 + 10;
                            chunk.file_pos = pos;
                            chunk.file_size = size;
                            pos += size;
                        }
                    }
                } else {
                    rec.obj_pos = self.reserve_bytes(total + rec.table_size, None)?;
                }
                self.by_pos.insert(rec.obj_pos, rec.id);
                rec.obj_size = total;
                trace!(id = rec.id, pos = rec.obj_pos, size = rec.obj_size, "Relocated object");
                if rec.id > 0 {
                    self.update_id_map_entry(rec.id as u32, rec.obj_pos, rec.obj_size)?;
                }
            }

            self.write_at(&data, rec.obj_pos)?;

            if method == ENCODER_DATA_CHUNKS {
                if num_chunks + min_chunk_size > 0 {
                    self.place_new_chunks(rec, num_chunks, min_chunk_size)?;
                }
                self.write_locations_table(rec)?;
                self.flush_object_chunks(rec, true, no_refs)?;
                let pos = rec.data_pos;
                self.seek_inner(rec, pos)?;
            }

            rec.header_dirty = false;
            if method == ENCODER_INTERNAL_DATA {
                rec.data_dirty = false;
            }
        }

        Ok(())
    }

    /// Delete an object: free its bytes and clear its ID-map slot
    ///
    /// A type-specific delete verifier may veto (attached linked-list nodes
    /// must be detached first).
    pub fn delete_object(&mut self, h: ObjHandle) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }

        {
            let rec = self.arena.get(h)?;
            if !self.can_delete_info(rec) {
                return Err(IfdsError::NotDetached);
            }
        }

        let mut rec = self.arena.take(h)?;
        let result = (|| -> Result<()> {
            self.truncate_inner(&mut rec, 0)?;
            self.clear_object_storage(&mut rec)
        })();
        let id = rec.id;
        self.arena.put(h, rec);
        result?;

        debug!(id, "Deleting object");

        if id > 0 {
            self.clear_id_map_entry(id as u32)?;
            if self.next_id > id as u64 {
                self.next_id = id as u64;
            }
        }

        let rec = self.arena.remove(h)?;
        self.est_ram = self.est_ram.saturating_sub(rec.est_ram);
        self.by_id.remove(&rec.id);
        if rec.obj_pos > 0 {
            self.by_pos.remove(&rec.obj_pos);
        }
        Ok(())
    }

    // ---- cache management -----------------------------------------------

    /// Increment the open-handle count of a cache slot
    pub fn retain(&mut self, h: ObjHandle) -> Result<()> {
        self.arena.open(h)
    }

    /// Decrement the open-handle count; at zero the slot may be evicted
    pub fn release(&mut self, h: ObjHandle) -> Result<()> {
        self.arena.release(h)
    }

    /// Evict written-out objects once estimated RAM exceeds the ceiling
    ///
    /// Zero-reference objects are written and dropped first; then the data
    /// chunks of the largest seekable objects are flushed; as a last resort
    /// the largest interleaved stream is registered for write, which is the
    /// only way to make progress once a stream occupies the cache.
    pub fn reduce_cache(&mut self) -> Result<()> {
        if self.est_ram < self.max_ram {
            return Ok(());
        }

        self.process_inflight()?;
        if self.inflight.is_some() {
            return Ok(());
        }

        debug!(est_ram = self.est_ram, max_ram = self.max_ram, "Reducing object cache");

        let mut largest: Vec<(ObjHandle, u64)> = Vec::new();
        let mut largest_min: Option<u64> = None;
        let mut interleaved: Option<(ObjHandle, u64)> = None;

        for h in self.arena.handles() {
            if self.arena.is_taken(h) {
                continue;
            }
            let (opens, method, manual, est, can_write) = {
                let rec = match self.arena.get(h) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                (
                    self.arena.opens(h),
                    rec.data_method(),
                    rec.manual,
                    rec.est_ram,
                    self.can_write_inner(rec),
                )
            };

            if opens < 1 && !(method == ENCODER_DATA_CHUNKS_STREAM && can_write) {
                let mut rec = self.arena.take(h)?;
                let result = self
                    .write_object_inner(&mut rec, true)
                    .and_then(|_| self.flush_object_chunks(&mut rec, false, true));
                self.arena.put(h, rec);
                result?;

                let rec = self.arena.remove(h)?;
                self.est_ram = self.est_ram.saturating_sub(rec.est_ram);
                self.by_id.remove(&rec.id);
                if rec.obj_pos > 0 {
                    self.by_pos.remove(&rec.obj_pos);
                }
            } else if method == ENCODER_DATA_CHUNKS
                && largest_min.map(|m| est >= m).unwrap_or(true)
            {
                largest.push((h, est));
                if largest.len() >= 50 {
                    largest.sort_by_key(|&(_, s)| s);
                    largest.drain(..largest.len() - 25);
                    largest_min = largest.first().map(|&(_, s)| s);
                }
            } else if method == ENCODER_DATA_CHUNKS_STREAM
                && !manual
                && interleaved.map(|(_, s)| est >= s).unwrap_or(true)
            {
                interleaved = Some((h, est));
            }
        }

        let threshold = (self.max_ram as f64 * 0.80) as u64;
        if self.est_ram > threshold {
            for (h, _) in largest {
                if self.arena.is_taken(h) {
                    continue;
                }
                let mut rec = self.arena.take(h)?;
                let opens = self.arena.opens(h);
                let result = self.flush_object_chunks(&mut rec, false, opens < 1);
                self.arena.put(h, rec);
                result?;
                if self.est_ram < threshold {
                    break;
                }
            }
        }

        // Nothing else can be written out until this stream finalizes.
        if let Some((h, _)) = interleaved {
            if self.est_ram > threshold && !self.arena.is_taken(h) {
                let opens = self.arena.opens(h);
                let mut rec = self.arena.take(h)?;
                let result = self.write_object_inner(&mut rec, opens < 1);
                let method = rec.data_method();
                self.arena.put(h, rec);
                result?;
                if method == ENCODER_DATA_CHUNKS_STREAM {
                    self.inflight = Some(h);
                    self.process_inflight()?;
                }
            }
        }

        Ok(())
    }

    // ---- name map --------------------------------------------------------

    /// Look up an object ID in the name map
    pub fn name_map_id(&self, name: &str) -> Option<u32> {
        self.name_map
            .as_ref()
            .and_then(|nm| nm.entries.get(name.as_bytes()).copied())
    }

    /// Bind a name to an object ID
    pub fn set_name_map_id(&mut self, name: &str, id: u32) {
        if let Some(nm) = self.name_map.as_mut() {
            nm.entries.insert(name.as_bytes().to_vec(), id);
            nm.dirty = true;
        }
    }

    /// Remove a name binding
    pub fn unset_name_map_id(&mut self, name: &str) {
        if let Some(nm) = self.name_map.as_mut() {
            if nm.entries.remove(name.as_bytes()).is_some() {
                nm.dirty = true;
            }
        }
    }

    /// All current name bindings
    pub fn name_map_entries(&self) -> Vec<(String, u32)> {
        self.name_map
            .as_ref()
            .map(|nm| {
                nm.entries
                    .iter()
                    .map(|(k, &v)| (String::from_utf8_lossy(k).into_owned(), v))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serialize and write the name map if modified
    pub fn write_name_map(&mut self) -> Result<()> {
        let Some(nm) = self.name_map.as_ref() else {
            return Ok(());
        };
        let handle = nm.handle;
        let dirty = nm.dirty || self.arena.get(handle)?.is_modified();
        if !dirty {
            return Ok(());
        }
        let entries = self.name_map.as_ref().unwrap().entries.clone();

        self.set_key_id_map_raw(handle, &entries)?;
        self.write_object(handle)?;

        let obj_pos = self.arena.get(handle)?.obj_pos;
        if let Some(hdr) = self.header.as_mut() {
            if hdr.name_map_pos != obj_pos {
                hdr.name_map_pos = obj_pos;
                hdr.dirty = true;
            }
        }
        if let Some(nm) = self.name_map.as_mut() {
            nm.dirty = false;
        }
        Ok(())
    }

    // ---- flush ----------------------------------------------------------

    /// Flush every dirty structure to storage
    ///
    /// Order: finalize streams, name map, non-manual objects, ID map, free
    /// map, then the file header. When the header cannot be rewritten (pure
    /// stream output) a trailing record carrying the root positions is
    /// appended instead.
    pub fn flush_all(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }

        // Close out an interleaved stream still being written.
        if let Some(h) = self.inflight {
            let can_write = self
                .arena
                .get(h)
                .map(|r| self.can_write_inner(r))
                .unwrap_or(false);
            if can_write {
                self.write_stream_data(h, 0, &[], true)?;
            }
            self.process_inflight()?;
        }

        // Finalize all remaining streaming objects.
        for h in self.arena.handles() {
            if self.arena.is_taken(h) {
                continue;
            }
            let needs_final = {
                let rec = match self.arena.get(h) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                rec.data_method() == ENCODER_DATA_CHUNKS_STREAM && self.can_write_inner(rec)
            };
            if needs_final {
                self.write_stream_data(h, 0, &[], true)?;
            }
        }

        self.write_name_map()?;

        // Write all non-manual objects, structure ahead of data.
        for h in self.arena.handles() {
            if self.arena.is_taken(h) {
                continue;
            }
            let manual = match self.arena.get(h) {
                Ok(r) => r.manual,
                Err(_) => continue,
            };
            if !manual {
                self.write_object(h)?;
                let mut rec = self.arena.take(h)?;
                let result = self.flush_object_chunks(&mut rec, true, true);
                self.arena.put(h, rec);
                result?;
            }
        }

        self.write_id_map()?;
        self.write_free_space_map()?;

        // Write the header, or a terminating record holding the streaming
        // header portion when in-place rewrite is impossible.
        let header_dirty = self.header.as_ref().map(|h| h.dirty).unwrap_or(false);
        if header_dirty && self.write_header().is_err() {
            let (name_pos, id_pos) = {
                let hdr = self.header.as_ref().unwrap();
                (hdr.name_map_pos, hdr.id_map_pos)
            };
            let trailer = structure::encode_stream_trailer(name_pos, id_pos);
            let end = self.max_pos();
            self.write_at(&trailer, end)
                .map_err(|_| IfdsError::WriteFailed("unable to write stream header".into()))?;
        }

        self.storage.sync(false)?;
        Ok(())
    }

    /// Detach buffered bytes from a buffer-mode storage port
    pub fn take_stream_data(&mut self) -> Option<Vec<u8>> {
        self.storage.take_buffer()
    }

    // ---- object accessors -----------------------------------------------

    pub fn object_id(&self, h: ObjHandle) -> Result<ObjectId> {
        Ok(self.arena.get(h)?.id)
    }

    pub fn object_type(&self, h: ObjHandle) -> Result<u8> {
        Ok(self.arena.get(h)?.type_byte)
    }

    pub fn object_base_type(&self, h: ObjHandle) -> Result<u8> {
        Ok(self.arena.get(h)?.base_type())
    }

    pub fn object_type_name(&self, h: ObjHandle) -> Result<&'static str> {
        Ok(self.arena.get(h)?.type_name())
    }

    pub fn object_encoder(&self, h: ObjHandle) -> Result<u8> {
        Ok(self.arena.get(h)?.encoder())
    }

    pub fn object_data_method(&self, h: ObjHandle) -> Result<u8> {
        Ok(self.arena.get(h)?.data_method())
    }

    pub fn object_data_pos(&self, h: ObjHandle) -> Result<u64> {
        Ok(self.arena.get(h)?.data_pos)
    }

    pub fn object_data_size(&self, h: ObjHandle) -> Result<u64> {
        Ok(self.arena.get(h)?.data_size)
    }

    /// File position and encoded size of the object header (0,0 if unwritten)
    pub fn object_location(&self, h: ObjHandle) -> Result<(u64, u64)> {
        let rec = self.arena.get(h)?;
        Ok((rec.obj_pos, rec.obj_size))
    }

    pub fn is_object_valid(&self, h: ObjHandle) -> Result<bool> {
        Ok(self.arena.get(h)?.valid)
    }

    pub fn is_object_modified(&self, h: ObjHandle) -> Result<bool> {
        Ok(self.arena.get(h)?.is_modified())
    }

    pub fn is_object_data_null(&self, h: ObjHandle) -> Result<bool> {
        Ok(self.arena.get(h)?.is_data_null())
    }

    pub fn is_interleaved_object(&self, h: ObjHandle) -> Result<bool> {
        Ok(self.arena.get(h)?.is_interleaved())
    }

    pub fn is_manual_write_object(&self, h: ObjHandle) -> Result<bool> {
        Ok(self.arena.get(h)?.manual)
    }

    /// Exclude/include the object in the automatic flush sweep
    pub fn set_manual_write_object(&mut self, h: ObjHandle, enable: bool) -> Result<()> {
        self.arena.get_mut(h)?.manual = enable;
        Ok(())
    }
}

impl Drop for Ifds {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.flush_all() {
                warn!("Flush on drop failed: {e}");
            }
        }
    }
}

/// Map the recoverable insufficient-data signal to a hard read failure for
/// callers that cannot retry
pub(crate) fn fatal_eof(e: IfdsError) -> IfdsError {
    match e {
        IfdsError::InsufficientData { .. } => {
            IfdsError::ReadFailed("unexpected end of container data".into())
        }
        other => other,
    }
}
