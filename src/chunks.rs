//! Data chunk I/O
//!
//! Logical payload access for the three data-methods:
//!
//! - **internal**: payload inline in the object header, promoted to chunked
//!   storage once it exceeds 3072 bytes;
//! - **chunked-seekable**: 65528-byte payload chunks indexed by a
//!   DATA-locations table, with merge-down compaction bounding table growth;
//! - **chunked-streaming**: append-only interleaved multi-channel chunks;
//!   channel 0's terminal chunk closes the stream.
//!
//! All functions here operate on an [`ObjectRecord`] moved out of the cache
//! slot, so the engine remains free for nested allocator and ID-map work.

use crate::engine::{fatal_eof, Ifds, LoadedStructure};
use crate::error::{IfdsError, Result};
use crate::object::{Chunk, DataTable, ObjHandle, ObjectRecord, CHUNK_BASE_RAM};
use crate::structure::{
    self, LocEntry, CHUNK_FRAME, CHUNK_PAYLOAD, DC_DATA, DC_DATA_TERM, ENCODER_DATA_CHUNKS,
    ENCODER_DATA_CHUNKS_STREAM, ENCODER_INTERNAL_DATA, ENCODER_MASK_DATA_NUM, ENCODER_NONE,
    ENCODER_NO_DATA, INTERNAL_DATA_MAX, STREAM_CHUNK_PAYLOAD, TYPE_DATA_CHUNKS, TYPE_STREAMED,
};
use tracing::{debug, trace};

/// Result of one [`Ifds::read_data`] call
#[derive(Debug, Clone)]
pub struct DataRead {
    /// `None` only for objects whose encoding stores NULL
    pub data: Option<Vec<u8>>,
    /// Channel of the chunk read (interleaved objects only)
    pub channel: Option<u16>,
    /// Whether the read reached a terminal chunk / end of data
    pub end: bool,
    /// False when any chunk touched failed its CRC
    pub valid: bool,
}

const MAX_RUN: u64 = 65535 * CHUNK_FRAME;

impl Ifds {
    // ---- seeking --------------------------------------------------------

    /// Position the object's logical data cursor
    pub fn seek(&mut self, h: ObjHandle, pos: u64) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        let mut rec = self.arena.take(h)?;
        let result = self.seek_inner(&mut rec, pos);
        self.arena.put(h, rec);
        result
    }

    pub(crate) fn seek_inner(&mut self, rec: &mut ObjectRecord, mut pos: u64) -> Result<()> {
        if rec.data_method() == ENCODER_DATA_CHUNKS_STREAM {
            // Seeking makes little sense mid-write; deny it outright.
            if self.can_write_inner(rec) {
                return Err(IfdsError::InvalidOperation(
                    "streaming object data has not been fully written".into(),
                ));
            }

            // Backward movement requires a rescan from the start.
            if rec.data_pos > pos {
                let hdr_size = self.header.as_ref().map(|h| h.size).unwrap_or(0);
                if rec.obj_pos == 0 || rec.obj_pos < hdr_size {
                    return Err(IfdsError::InvalidOperation(
                        "invalid object position; has the object been written?".into(),
                    ));
                }
                let filepos = rec.obj_pos + rec.obj_size;
                let head = self
                    .read_at(filepos, 4)?
                    .filter(|d| d.len() == 4)
                    .ok_or_else(|| {
                        IfdsError::ReadFailed("unable to read chunk header data".into())
                    })?;
                rec.table = DataTable::StreamCursor { pos: filepos, buf: head };
                rec.data_pos = 0;
                rec.chunk_num = 0;
                self.clear_loaded_chunks(rec);
            }

            while rec.data_pos < pos {
                let read = self.read_data_inner(rec, Some((pos - rec.data_pos) as usize), None)?;
                if read.end && read.channel == Some(0) {
                    break;
                }
            }
        } else {
            if pos > rec.data_size {
                pos = rec.data_size;
            }
            match &rec.table {
                DataTable::Seekable(table) => {
                    let mut x = 0;
                    while x + 1 < table.len()
                        && pos >= table[x].data_pos + table[x].data_size
                    {
                        x += 1;
                    }
                    rec.table_idx = x;
                }
                _ => rec.table_idx = 0,
            }
            rec.chunk_num = pos / CHUNK_PAYLOAD as u64;
            rec.data_pos = pos;
        }
        Ok(())
    }

    // ---- reading --------------------------------------------------------

    /// Read up to `size` logical bytes at the cursor
    ///
    /// `size: None` reads to the end of the data (or chunk, for interleaved
    /// objects). `channel` filters interleaved reads to one channel,
    /// skipping chunks of other channels.
    pub fn read_data(
        &mut self,
        h: ObjHandle,
        size: Option<usize>,
        channel: Option<u16>,
    ) -> Result<DataRead> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        let mut rec = self.arena.take(h)?;
        let result = self.read_data_inner(&mut rec, size, channel);
        self.arena.put(h, rec);
        let out = result?;
        self.reduce_cache()?;
        Ok(out)
    }

    pub(crate) fn read_data_inner(
        &mut self,
        rec: &mut ObjectRecord,
        size: Option<usize>,
        channel: Option<u16>,
    ) -> Result<DataRead> {
        if rec.enc == ENCODER_NONE | ENCODER_NO_DATA {
            return Ok(DataRead {
                data: None,
                channel: None,
                end: true,
                valid: true,
            });
        }

        if rec.data_method() == ENCODER_DATA_CHUNKS_STREAM {
            loop {
                // A consumed channel-0 terminator ends the stream.
                if rec.chunk_num > 0 {
                    if let Some(prev) = rec.chunks.get(&(rec.chunk_num - 1)) {
                        if prev.term && prev.channel == Some(0) {
                            return Ok(DataRead {
                                data: Some(Vec::new()),
                                channel: Some(0),
                                end: true,
                                valid: true,
                            });
                        }
                    }
                }

                if !rec.chunks.contains_key(&rec.chunk_num) {
                    self.load_next_stream_chunk(rec)?;
                }

                let data_pos = rec.data_pos;
                let chunk = rec.chunks.get_mut(&rec.chunk_num).unwrap();
                let mut x2 = (data_pos - chunk.data_pos) as usize;
                let y2 = chunk.data.len();
                let chunk_channel = chunk.channel;

                let mut out: Option<DataRead> = None;
                if channel.is_none() || chunk_channel == channel {
                    let want = size.unwrap_or(y2 - x2.min(y2));
                    let n = (y2 - x2.min(y2)).min(want);
                    let data = chunk.data[x2..x2 + n].to_vec();
                    x2 += n;
                    rec.data_pos += n as u64;
                    out = Some(DataRead {
                        data: Some(data),
                        channel: chunk_channel,
                        end: chunk.term,
                        valid: chunk.valid,
                    });
                } else {
                    rec.data_pos += (y2 - x2) as u64;
                    x2 = y2;
                }

                if x2 >= y2 {
                    let retain = chunk_channel == Some(0) && chunk.term;
                    if !retain {
                        let freed = rec.chunks.remove(&rec.chunk_num).map(|c| c.data.len()).unwrap_or(0)
                            as u64
                            + CHUNK_BASE_RAM;
                        rec.est_ram = rec.est_ram.saturating_sub(freed);
                        self.est_ram = self.est_ram.saturating_sub(freed);
                    }
                    rec.chunk_num += 1;
                }

                if let Some(out) = out {
                    return Ok(out);
                }
            }
        }

        // Seekable data.
        let mut out = DataRead {
            data: Some(Vec::new()),
            channel: None,
            end: false,
            valid: true,
        };
        let mut x = 0usize;
        while rec.data_pos < rec.data_size && size.map(|s| x < s).unwrap_or(true) {
            if !rec.chunks.contains_key(&rec.chunk_num) && !self.load_current_chunk(rec)? {
                return Err(IfdsError::Corrupted(
                    "unable to load the current object data chunk for reading".into(),
                ));
            }
            let chunk = rec.chunks.get(&rec.chunk_num).unwrap();
            if !chunk.valid {
                out.valid = false;
            }

            let mut x2 = (rec.data_pos - chunk.data_pos) as usize;
            let y2 = chunk.data.len();
            let mut diff = y2.saturating_sub(x2);
            if let Some(s) = size {
                diff = diff.min(s - x);
            }
            if diff == 0 && x2 < CHUNK_PAYLOAD {
                return Err(IfdsError::Corrupted(
                    "object data chunk shorter than logical size".into(),
                ));
            }
            out.data
                .as_mut()
                .unwrap()
                .extend_from_slice(&chunk.data[x2..x2 + diff]);
            x += diff;
            x2 += diff;
            rec.data_pos += diff as u64;

            if x2 >= CHUNK_PAYLOAD {
                rec.chunk_num += 1;
                if let DataTable::Seekable(table) = &rec.table {
                    if let Some(tinfo) = table.get(rec.table_idx) {
                        if rec.data_pos - tinfo.data_pos >= tinfo.data_size {
                            rec.table_idx += 1;
                        }
                    }
                }
            }
        }
        if rec.data_pos >= rec.data_size {
            out.end = true;
        }
        Ok(out)
    }

    /// Load the next interleaved chunk through the stream cursor
    fn load_next_stream_chunk(&mut self, rec: &mut ObjectRecord) -> Result<()> {
        let (filepos, head) = match &rec.table {
            DataTable::StreamCursor { pos, buf } => (*pos, buf.clone()),
            _ => {
                return Err(IfdsError::Corrupted(
                    "no chunk header data; possible data corruption detected".into(),
                ))
            }
        };

        let size = u16::from_be_bytes([head[2], head[3]]) as usize;
        if size > STREAM_CHUNK_PAYLOAD {
            return Err(IfdsError::Corrupted("invalid chunk size".into()));
        }

        let tail = self
            .read_at(filepos + 4, size + 10)?
            .filter(|d| d.len() >= size + 6)
            .ok_or_else(|| IfdsError::ReadFailed("unable to read chunk data".into()))?;

        let mut frame = head;
        frame.extend_from_slice(&tail[..size + 6]);
        if !self.extract_chunk(rec, rec.chunk_num, filepos, size as u64 + 10, rec.data_pos, &frame) {
            return Err(IfdsError::Corrupted("unable to extract chunk data".into()));
        }
        if rec.data_size < rec.data_pos + size as u64 {
            rec.data_size = rec.data_pos + size as u64;
        }

        // Pre-read the next frame head so the cursor stays one step ahead.
        let rest = &tail[size + 6..];
        if rest.len() < 4
            || rest[0] != TYPE_DATA_CHUNKS | TYPE_STREAMED
            || (rest[1] != DC_DATA && rest[1] != DC_DATA_TERM)
        {
            rec.table = DataTable::None;
        } else {
            rec.table = DataTable::StreamCursor {
                pos: filepos + size as u64 + 10,
                buf: rest[..4].to_vec(),
            };
        }
        Ok(())
    }

    /// Locate and load the chunk under the cursor via the locations table
    fn load_current_chunk(&mut self, rec: &mut ObjectRecord) -> Result<bool> {
        let (filepos, size) = match &rec.table {
            DataTable::Seekable(table) => {
                let Some(tinfo) = table.get(rec.table_idx) else {
                    return Ok(false);
                };
                let filepos = tinfo.file_pos
                    + ((rec.data_pos - tinfo.data_pos) / CHUNK_PAYLOAD as u64) * CHUNK_FRAME;
                let size = if rec.table_idx < table.len() - 1 {
                    CHUNK_FRAME
                } else {
                    tinfo.file_size
                };
                (filepos, size)
            }
            _ => return Ok(false),
        };
        if size < 8 {
            return Ok(false);
        }
        let data = match self.read_at(filepos, size as usize)? {
            Some(d) if d.len() as u64 == size => d,
            _ => return Ok(false),
        };
        let data_pos = rec.data_pos - rec.data_pos % CHUNK_PAYLOAD as u64;
        Ok(self.extract_chunk(rec, rec.chunk_num, filepos, size, data_pos, &data))
    }

    /// Validate a raw chunk frame and install it in the record
    fn extract_chunk(
        &mut self,
        rec: &mut ObjectRecord,
        chunk_num: u64,
        file_pos: u64,
        file_size: u64,
        data_pos: u64,
        data: &[u8],
    ) -> bool {
        if file_size > CHUNK_FRAME || data.len() < 8 {
            return false;
        }
        let chunk = if rec.data_method() == ENCODER_DATA_CHUNKS_STREAM {
            if data[0] != TYPE_DATA_CHUNKS | TYPE_STREAMED
                || (data[1] != DC_DATA && data[1] != DC_DATA_TERM)
                || u16::from_be_bytes([data[2], data[3]]) as u64 != file_size - 10
            {
                return false;
            }
            Chunk {
                dirty: false,
                valid: crc32fast::hash(&data[..data.len() - 4]).to_be_bytes()
                    == data[data.len() - 4..],
                term: data[1] == DC_DATA_TERM,
                channel: Some(u16::from_be_bytes([data[4], data[5]])),
                file_pos,
                file_size,
                data_pos,
                data: data[6..data.len() - 4].to_vec(),
            }
        } else {
            if data[0] != TYPE_DATA_CHUNKS
                || (data[1] != DC_DATA && data[1] != DC_DATA_TERM)
                || u16::from_be_bytes([data[2], data[3]]) as u64 != file_size - 8
            {
                return false;
            }
            Chunk {
                dirty: false,
                valid: crc32fast::hash(&data[..data.len() - 4]).to_be_bytes()
                    == data[data.len() - 4..],
                term: data[1] == DC_DATA_TERM,
                channel: None,
                file_pos,
                file_size,
                data_pos,
                data: data[4..data.len() - 4].to_vec(),
            }
        };

        let cost = chunk.data.len() as u64 + CHUNK_BASE_RAM;
        rec.chunks.insert(chunk_num, chunk);
        rec.est_ram += cost;
        self.est_ram += cost;
        true
    }

    pub(crate) fn clear_loaded_chunks(&mut self, rec: &mut ObjectRecord) {
        let mut freed = 0u64;
        for chunk in rec.chunks.values() {
            freed += chunk.data.len() as u64 + CHUNK_BASE_RAM;
        }
        rec.chunks.clear();
        rec.est_ram = rec.est_ram.saturating_sub(freed);
        self.est_ram = self.est_ram.saturating_sub(freed);
    }

    // ---- writing --------------------------------------------------------

    /// Write seekable data at the cursor, growing the object as needed
    pub fn write_data(&mut self, h: ObjHandle, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        self.reduce_cache()?;
        let mut rec = self.arena.take(h)?;
        let result = self.write_data_inner(&mut rec, data);
        self.arena.put(h, rec);
        result
    }

    pub(crate) fn write_data_inner(&mut self, rec: &mut ObjectRecord, data: &[u8]) -> Result<()> {
        if rec.data_method() == ENCODER_DATA_CHUNKS_STREAM {
            return Err(IfdsError::InvalidEncoding(
                "interleaved data requires a channel".into(),
            ));
        }
        if rec.enc == ENCODER_NONE | ENCODER_NO_DATA {
            return Err(IfdsError::InvalidEncoding(
                "object encoding set to NULL data".into(),
            ));
        }

        let mut x = 0usize;
        let y = data.len();
        while x < y {
            if !rec.chunks.contains_key(&rec.chunk_num) && !self.load_current_chunk(rec)? {
                return Err(IfdsError::Corrupted(
                    "unable to load the current object data chunk for writing".into(),
                ));
            }

            let data_pos = rec.data_pos;
            let chunk = rec.chunks.get_mut(&rec.chunk_num).unwrap();
            let mut x2 = (data_pos - chunk.data_pos) as usize;
            let y2 = chunk.data.len();

            // Overwrite resident bytes, then append up to the chunk payload
            // capacity.
            if x2 < y2 {
                let n = (y2 - x2).min(y - x);
                chunk.data[x2..x2 + n].copy_from_slice(&data[x..x + n]);
                x += n;
                x2 += n;
                rec.data_pos += n as u64;
            }
            if y2 < CHUNK_PAYLOAD && x < y {
                let n = (CHUNK_PAYLOAD - chunk.data.len()).min(y - x);
                chunk.data.extend_from_slice(&data[x..x + n]);
                let grow = n as u64;
                rec.est_ram += grow;
                self.est_ram += grow;
                x += n;
                x2 += n;
                rec.data_pos += n as u64;
            }

            chunk.dirty = true;
            rec.data_dirty = true;

            if rec.data_pos > rec.data_size {
                rec.data_size = rec.data_pos;

                // Inline payloads past the threshold promote to chunks.
                if rec.data_method() == ENCODER_INTERNAL_DATA && rec.data_size > INTERNAL_DATA_MAX {
                    self.clear_object_storage(rec)?;
                    rec.enc = (rec.enc & ENCODER_MASK_DATA_NUM) | ENCODER_DATA_CHUNKS;
                    rec.header_dirty = true;
                    trace!(id = rec.id, "Promoted internal data to chunked storage");
                }
            }

            if x2 >= CHUNK_PAYLOAD {
                rec.chunk_num += 1;
                if let DataTable::Seekable(table) = &rec.table {
                    if let Some(tinfo) = table.get(rec.table_idx) {
                        if rec.data_pos - tinfo.data_pos >= tinfo.data_size {
                            rec.table_idx += 1;
                        }
                    }
                }
                let data_pos = rec.data_pos;
                let chunk = rec.chunks.get_mut(&(rec.chunk_num - 1)).unwrap();
                if chunk.term {
                    chunk.term = false;
                    rec.chunks.insert(rec.chunk_num, Chunk::new_term(data_pos));
                    rec.est_ram += CHUNK_BASE_RAM;
                    self.est_ram += CHUNK_BASE_RAM;
                }
            }
        }
        Ok(())
    }

    /// Append interleaved data on a channel; `final_chunk` closes the write
    ///
    /// The first streaming write switches the object to the streaming
    /// data-method, which is only allowed before any data has been output.
    pub fn write_stream_data(
        &mut self,
        h: ObjHandle,
        channel: u16,
        data: &[u8],
        final_chunk: bool,
    ) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        self.reduce_cache()?;
        let mut rec = self.arena.take(h)?;
        let result = self.write_stream_data_inner(&mut rec, channel, data, final_chunk);
        self.arena.put(h, rec);
        result
    }

    pub(crate) fn write_stream_data_inner(
        &mut self,
        rec: &mut ObjectRecord,
        channel: u16,
        data: &[u8],
        final_chunk: bool,
    ) -> Result<()> {
        if rec.enc == ENCODER_NONE | ENCODER_NO_DATA {
            return Err(IfdsError::InvalidEncoding(
                "object encoding set to NULL data".into(),
            ));
        }

        if rec.data_method() != ENCODER_DATA_CHUNKS_STREAM {
            if rec.data_size > 0 {
                return Err(IfdsError::InvalidEncoding(
                    "object has already been written to".into(),
                ));
            }
            self.clear_object_storage(rec)?;
            rec.enc = (rec.enc & ENCODER_MASK_DATA_NUM) | ENCODER_DATA_CHUNKS_STREAM;
            rec.table = DataTable::None;
            rec.table_size = 0;
            self.clear_loaded_chunks(rec);
        }

        if rec.data_pos < rec.data_size || !rec.table.is_none() {
            return Err(IfdsError::InvalidOperation(
                "object position is not at the end of the data".into(),
            ));
        }
        if rec.chunk_num > 0 {
            if let Some(prev) = rec.chunks.get(&(rec.chunk_num - 1)) {
                if prev.term && prev.channel == Some(0) {
                    return Err(IfdsError::InvalidOperation(
                        "data stream already terminated".into(),
                    ));
                }
            }
        }

        let mut pieces: Vec<&[u8]> = data.chunks(STREAM_CHUNK_PAYLOAD).collect();
        if pieces.is_empty() && final_chunk {
            pieces.push(&[]);
        }
        let total = pieces.len();
        let mut cost = 0u64;
        for (i, piece) in pieces.into_iter().enumerate() {
            rec.chunks.insert(
                rec.chunk_num,
                Chunk {
                    dirty: true,
                    valid: true,
                    term: final_chunk && i + 1 == total,
                    channel: Some(channel),
                    file_pos: 0,
                    file_size: 0,
                    data_pos: rec.data_pos,
                    data: piece.to_vec(),
                },
            );
            rec.data_pos += piece.len() as u64;
            cost += piece.len() as u64 + CHUNK_BASE_RAM;
            rec.chunk_num += 1;
        }
        rec.data_size = rec.data_pos;
        rec.data_dirty = true;
        rec.est_ram += cost;
        self.est_ram += cost;
        Ok(())
    }

    /// Store NULL: drop all data and switch the object to the no-data
    /// encoding
    pub fn set_data_null(&mut self, h: ObjHandle) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        let mut rec = self.arena.take(h)?;
        let result = (|| -> Result<()> {
            self.truncate_inner(&mut rec, 0)?;
            self.clear_object_storage(&mut rec)?;
            rec.enc = ENCODER_NONE | ENCODER_NO_DATA;
            self.clear_loaded_chunks(&mut rec);
            Ok(())
        })();
        self.arena.put(h, rec);
        result
    }

    /// Change the semantic encoder of an object's payload
    pub fn set_object_encoder(&mut self, h: ObjHandle, encoder_num: u8) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        if encoder_num == ENCODER_NONE {
            return self.set_data_null(h);
        }
        if encoder_num >= TYPE_DATA_CHUNKS {
            return Err(IfdsError::InvalidEncoding("encoder number out of range".into()));
        }
        let rec = self.arena.get_mut(h)?;
        rec.enc = (rec.enc & structure::ENCODER_MASK_DATA) | encoder_num;
        rec.header_dirty = true;
        if rec.data_method() == ENCODER_NO_DATA {
            rec.chunks.clear();
            rec.chunks.insert(0, Chunk::new_term(0));
            rec.est_ram += CHUNK_BASE_RAM;
            self.est_ram += CHUNK_BASE_RAM;
            rec.enc = (rec.enc & ENCODER_MASK_DATA_NUM) | ENCODER_INTERNAL_DATA;
            rec.data_dirty = true;
        }
        Ok(())
    }

    // ---- truncation -----------------------------------------------------

    /// Shrink the logical data to `new_size` bytes, releasing storage
    ///
    /// Streaming objects only support resetting to zero, after draining to
    /// the channel-0 terminator.
    pub fn truncate(&mut self, h: ObjHandle, new_size: u64) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        let mut rec = self.arena.take(h)?;
        let result = self.truncate_inner(&mut rec, new_size);
        self.arena.put(h, rec);
        result
    }

    pub(crate) fn truncate_inner(&mut self, rec: &mut ObjectRecord, new_size: u64) -> Result<()> {
        if rec.data_size <= new_size {
            return Ok(());
        }
        let method = rec.data_method();

        if method == ENCODER_DATA_CHUNKS_STREAM {
            if new_size > 0 {
                return Err(IfdsError::InvalidOperation(
                    "new size must be zero when truncating streams".into(),
                ));
            }

            if rec.obj_pos > 0 {
                // Finalize an active write before measuring the stream.
                if self.can_write_inner(rec) {
                    self.write_stream_data_inner(rec, 0, &[], true)?;
                    self.flush_object_chunks(rec, true, true)?;
                }

                // Walk every interleaved chunk to find the stream's end.
                let mut filepos = rec.obj_pos + rec.obj_size;
                let mut buf = Vec::new();
                let mut next_size = CHUNK_FRAME as usize;
                loop {
                    let outcome = self
                        .read_next_structure(&mut filepos, &mut buf, next_size, false)
                        .map_err(fatal_eof)?;
                    match outcome.structure {
                        LoadedStructure::DataChunk {
                            streamed: true,
                            term,
                            channel,
                            ..
                        } => {
                            if term && channel == Some(0) {
                                break;
                            }
                        }
                        _ => {
                            return Err(IfdsError::Corrupted(
                                "unable to find the end of the interleaved DATA chunks".into(),
                            ))
                        }
                    }
                    next_size = outcome.next_size;
                }

                self.free_bytes(rec.obj_pos, filepos - rec.obj_pos)?;
                self.by_pos.remove(&rec.obj_pos);
                rec.obj_pos = 0;
                rec.obj_size = 0;
                rec.header_dirty = true;
            }

            self.clear_loaded_chunks(rec);
            rec.table = DataTable::None;
            rec.data_pos = 0;
            rec.data_size = 0;
            rec.chunk_num = 0;
            rec.enc = (rec.enc & ENCODER_MASK_DATA_NUM) | ENCODER_INTERNAL_DATA;
            rec.chunks.insert(0, Chunk::new_term(0));
            rec.est_ram += CHUNK_BASE_RAM;
            self.est_ram += CHUNK_BASE_RAM;
            return Ok(());
        }

        if method == ENCODER_DATA_CHUNKS {
            // Make sure the chunk containing the cut is resident.
            if new_size > 0 {
                let pos = rec.data_pos;
                self.seek_inner(rec, new_size)?;
                if !rec.chunks.contains_key(&rec.chunk_num) && !self.load_current_chunk(rec)? {
                    return Err(IfdsError::Corrupted(
                        "unable to load the object data chunk".into(),
                    ));
                }
                self.seek_inner(rec, pos)?;
            }

            // Drop chunks past the cut; truncate the one containing it.
            let chunk_nums: Vec<u64> = rec.chunks.keys().copied().collect();
            for num in chunk_nums {
                let chunk = rec.chunks.get(&num).unwrap();
                if chunk.data_pos > new_size {
                    let freed = chunk.data.len() as u64 + CHUNK_BASE_RAM;
                    rec.chunks.remove(&num);
                    rec.est_ram = rec.est_ram.saturating_sub(freed);
                    self.est_ram = self.est_ram.saturating_sub(freed);
                } else if chunk.data_pos == new_size
                    || chunk.data_pos + chunk.data.len() as u64 > new_size
                {
                    let (file_pos, file_size) = (chunk.file_pos, chunk.file_size);
                    if file_pos > 0 {
                        self.free_bytes(file_pos, file_size)?;
                    }
                    let chunk = rec.chunks.get_mut(&num).unwrap();
                    chunk.file_pos = 0;
                    chunk.file_size = 0;
                    chunk.term = true;
                    chunk.data.truncate((new_size - chunk.data_pos) as usize);
                    chunk.dirty = true;
                    rec.data_dirty = true;
                }
            }

            self.clear_object_storage(rec)?;

            // Cut the locations table back.
            let mut table = match std::mem::replace(&mut rec.table, DataTable::None) {
                DataTable::Seekable(t) => Some(t),
                other => {
                    rec.table = other;
                    None
                }
            };
            if let Some(table) = table.as_mut() {
                let y = table.len();
                let mut x = 0;
                while x < y && table[x].data_pos + table[x].data_size <= new_size {
                    x += 1;
                }

                if x < y.saturating_sub(1) {
                    let tinfo = &mut table[x];
                    let keep_blocks = (new_size - tinfo.data_pos) / CHUNK_PAYLOAD as u64;
                    if keep_blocks > 0 {
                        let free_pos = tinfo.file_pos + keep_blocks * CHUNK_FRAME;
                        let free_size = tinfo.file_size - keep_blocks * CHUNK_FRAME;
                        tinfo.file_size = keep_blocks * CHUNK_FRAME;
                        tinfo.data_size = keep_blocks * CHUNK_PAYLOAD as u64;
                        self.free_bytes(free_pos, free_size)?;
                        x += 1;
                    }
                }

                for tinfo in table.iter().skip(x) {
                    if tinfo.file_pos > 0 {
                        self.free_bytes(tinfo.file_pos, tinfo.file_size)?;
                    }
                }
                table.truncate(x);
                let tail_pos = table
                    .last()
                    .map(|t| t.data_pos + t.data_size)
                    .unwrap_or(0);
                table.push(LocEntry {
                    file_pos: 0,
                    file_size: 0,
                    data_pos: tail_pos,
                    data_size: 0,
                });
            }
            if let Some(t) = table {
                rec.table = DataTable::Seekable(t);
            }

            rec.data_size = new_size;

            // Demote to inline storage when small enough again.
            if rec.data_size <= INTERNAL_DATA_MAX {
                rec.table = DataTable::None;
                rec.table_idx = 0;
                rec.enc = (rec.enc & ENCODER_MASK_DATA_NUM) | ENCODER_INTERNAL_DATA;
                rec.header_dirty = true;
                if !rec.chunks.contains_key(&0) {
                    rec.chunks.insert(0, Chunk::new_term(0));
                    rec.est_ram += CHUNK_BASE_RAM;
                    self.est_ram += CHUNK_BASE_RAM;
                }
                trace!(id = rec.id, "Demoted chunked data to internal storage");
            }

            let pos = rec.data_pos;
            return self.seek_inner(rec, pos);
        }

        // Internal data.
        if rec.data_size > INTERNAL_DATA_MAX || new_size < 1 {
            self.clear_object_storage(rec)?;
        }
        if let Some(chunk) = rec.chunks.get_mut(&0) {
            chunk.file_pos = 0;
            chunk.file_size = 0;
            chunk.data.truncate(new_size as usize);
            chunk.dirty = true;
        }
        rec.data_size = new_size;
        rec.data_dirty = true;
        if rec.data_pos > rec.data_size {
            rec.data_pos = rec.data_size;
        }
        Ok(())
    }

    /// Free the object's header bytes (and reserved table space)
    pub(crate) fn clear_object_storage(&mut self, rec: &mut ObjectRecord) -> Result<()> {
        if rec.data_method() == ENCODER_DATA_CHUNKS_STREAM
            && (rec.data_size > 0 || self.can_write_inner(rec))
        {
            return Err(IfdsError::InvalidOperation(
                "streaming data must be truncated first".into(),
            ));
        }
        if rec.obj_size > 0 {
            self.free_bytes(rec.obj_pos, rec.obj_size + rec.table_size)?;
            self.by_pos.remove(&rec.obj_pos);
            rec.obj_pos = 0;
            rec.obj_size = 0;
            rec.table_size = 0;
            rec.header_dirty = true;
        }
        Ok(())
    }

    // ---- chunk flushing --------------------------------------------------

    /// Whether more interleaved data may still be written to the object
    pub fn can_write_data(&self, h: ObjHandle) -> Result<bool> {
        Ok(self.can_write_inner(self.arena.get(h)?))
    }

    pub(crate) fn can_write_inner(&self, rec: &ObjectRecord) -> bool {
        if rec.enc == ENCODER_NONE | ENCODER_NO_DATA {
            return false;
        }
        if rec.data_method() == ENCODER_DATA_CHUNKS_STREAM {
            if rec.data_pos < rec.data_size || !rec.table.is_none() {
                return false;
            }
            if rec.chunk_num > 0 {
                if let Some(prev) = rec.chunks.get(&(rec.chunk_num - 1)) {
                    if prev.term && prev.channel == Some(0) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Flush the in-flight interleaved stream and release it once finalized
    pub fn process_inflight(&mut self) -> Result<()> {
        if let Some(h) = self.inflight {
            if self.arena.is_taken(h) {
                return Ok(());
            }
            let mut rec = match self.arena.take(h) {
                Ok(rec) => rec,
                Err(IfdsError::StaleHandle) => {
                    self.inflight = None;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let result = self.flush_object_chunks(&mut rec, false, false);
            let done = !self.can_write_inner(&rec);
            self.arena.put(h, rec);
            result?;
            if done {
                self.inflight = None;
            }
        }
        Ok(())
    }

    /// Write dirty chunks to storage and release clean ones from memory
    ///
    /// `flush_all` forces partial trailing chunks out; `no_refs` marks the
    /// object as having no open handles (same effect).
    pub(crate) fn flush_object_chunks(
        &mut self,
        rec: &mut ObjectRecord,
        flush_all: bool,
        no_refs: bool,
    ) -> Result<()> {
        let method = rec.data_method();

        if method == ENCODER_DATA_CHUNKS {
            let mut has_dirty = false;
            let chunk_nums: Vec<u64> = rec.chunks.keys().copied().collect();

            for num in chunk_nums {
                let (mut file_pos, file_size, data_pos, len) = {
                    let chunk = rec.chunks.get_mut(&num).unwrap();
                    if chunk.data.len() > CHUNK_PAYLOAD {
                        chunk.data.truncate(CHUNK_PAYLOAD);
                    }
                    (
                        chunk.file_pos,
                        chunk.file_size,
                        chunk.data_pos,
                        chunk.data.len() as u64,
                    )
                };

                // Newly grown chunks need (re)placement.
                if file_size < len + 8 {
                    if file_size > 0 {
                        self.free_bytes(file_pos, file_size)?;
                    }

                    if len >= CHUNK_PAYLOAD as u64 {
                        let placed = self.append_full_chunk(rec, data_pos)?;
                        file_pos = placed;
                        let chunk = rec.chunks.get_mut(&num).unwrap();
                        chunk.file_pos = placed;
                        chunk.file_size = CHUNK_FRAME;
                    } else if flush_all || no_refs {
                        let placed = self.place_partial_chunk(rec, data_pos, len)?;
                        file_pos = placed;
                        let chunk = rec.chunks.get_mut(&num).unwrap();
                        chunk.file_pos = placed;
                        chunk.file_size = len + 8;
                    }
                }

                let chunk = rec.chunks.get(&num).unwrap();
                if chunk.dirty
                    && (chunk.file_size >= CHUNK_FRAME
                        || (chunk.file_size > 0 && (flush_all || no_refs)))
                {
                    let frame = structure::encode_chunk(chunk.term, &chunk.data);
                    self.write_at(&frame, file_pos)?;
                    rec.chunks.get_mut(&num).unwrap().dirty = false;
                }

                let chunk = rec.chunks.get(&num).unwrap();
                if chunk.dirty {
                    has_dirty = true;
                } else if rec.data_pos < chunk.data_pos
                    || rec.data_pos > chunk.data_pos + chunk.data.len() as u64
                {
                    let freed = chunk.data.len() as u64 + CHUNK_BASE_RAM;
                    rec.chunks.remove(&num);
                    rec.est_ram = rec.est_ram.saturating_sub(freed);
                    self.est_ram = self.est_ram.saturating_sub(freed);
                }
            }

            if !has_dirty {
                rec.data_dirty = false;
            }
        } else if method == ENCODER_DATA_CHUNKS_STREAM && rec.obj_pos > 0 {
            let chunk_nums: Vec<u64> = rec.chunks.keys().copied().collect();
            for num in chunk_nums {
                let (dirty, file_size, len) = {
                    let c = rec.chunks.get(&num).unwrap();
                    (c.dirty, c.file_size, c.data.len() as u64)
                };
                if dirty && (file_size == 0 || file_size == len + 10) {
                    let end = self.max_pos();
                    let chunk = rec.chunks.get_mut(&num).unwrap();
                    let frame = structure::encode_stream_chunk(
                        chunk.term,
                        chunk.channel.unwrap_or(0),
                        &chunk.data,
                    );
                    if chunk.file_pos < 1 {
                        chunk.file_pos = end;
                    }
                    chunk.file_size = frame.len() as u64;
                    let pos = chunk.file_pos;
                    self.write_at(&frame, pos)?;
                    rec.chunks.get_mut(&num).unwrap().dirty = false;
                }

                let chunk = rec.chunks.get(&num).unwrap();
                if rec.data_pos < chunk.data_pos
                    || rec.data_pos > chunk.data_pos + chunk.data.len() as u64
                {
                    let freed = chunk.data.len() as u64 + CHUNK_BASE_RAM;
                    rec.chunks.remove(&num);
                    rec.est_ram = rec.est_ram.saturating_sub(freed);
                    self.est_ram = self.est_ram.saturating_sub(freed);
                }
            }
            rec.data_dirty = false;
        }

        Ok(())
    }

    /// Reserve space for a newly filled 64KB chunk, extending the last
    /// locations-table run when the bytes land adjacent to it
    fn append_full_chunk(&mut self, rec: &mut ObjectRecord, chunk_data_pos: u64) -> Result<u64> {
        let mut table = match std::mem::replace(&mut rec.table, DataTable::None) {
            DataTable::Seekable(t) => t,
            other => {
                rec.table = other;
                Vec::new()
            }
        };

        let pos;
        if table.len() > 1 {
            let tnum = table.len() - 2;
            let pref = table[tnum].file_pos + table[tnum].file_size;
            pos = self.reserve_bytes(CHUNK_FRAME, Some(pref))?;
            if table[tnum].file_pos + table[tnum].file_size != pos
                || table[tnum].file_size >= MAX_RUN
            {
                if table.len() > structure::MAX_TABLE_ENTRIES - 1 {
                    rec.table = DataTable::Seekable(std::mem::take(&mut table));
                    self.merge_down_chunks(rec, 1)?;
                    table = match std::mem::replace(&mut rec.table, DataTable::None) {
                        DataTable::Seekable(t) => t,
                        other => {
                            rec.table = other;
                            Vec::new()
                        }
                    };
                }
                let tail = table.pop().unwrap();
                table.push(LocEntry {
                    file_pos: pos,
                    file_size: 0,
                    data_pos: chunk_data_pos,
                    data_size: 0,
                });
                table.push(tail);
                rec.header_dirty = true;
            }
        } else {
            pos = self.reserve_bytes(CHUNK_FRAME, None)?;
            let tail = table.pop().unwrap_or(LocEntry {
                file_pos: 0,
                file_size: 0,
                data_pos: 0,
                data_size: 0,
            });
            table.push(LocEntry {
                file_pos: pos,
                file_size: 0,
                data_pos: chunk_data_pos,
                data_size: 0,
            });
            table.push(tail);
            rec.header_dirty = true;
        }

        let tnum = table.len() - 2;
        table[tnum].file_size += CHUNK_FRAME;
        table[tnum].data_size += CHUNK_PAYLOAD as u64;
        rec.table = DataTable::Seekable(table);
        Ok(pos)
    }

    /// Reserve space for the trailing partial chunk and record it as the
    /// table's final entry
    fn place_partial_chunk(
        &mut self,
        rec: &mut ObjectRecord,
        chunk_data_pos: u64,
        len: u64,
    ) -> Result<u64> {
        let mut table = match std::mem::replace(&mut rec.table, DataTable::None) {
            DataTable::Seekable(t) => t,
            other => {
                rec.table = other;
                Vec::new()
            }
        };

        let pos = if table.is_empty() {
            table.push(LocEntry {
                file_pos: 0,
                file_size: 0,
                data_pos: 0,
                data_size: 0,
            });
            self.reserve_bytes(len + 8, None)?
        } else if table.len() > 1 {
            let tnum = table.len() - 2;
            let pref = table[tnum].file_pos + table[tnum].file_size;
            self.reserve_bytes(len + 8, Some(pref))?
        } else {
            let pref = table[0].file_pos;
            self.reserve_bytes(len + 8, Some(pref))?
        };

        let last = table.len() - 1;
        table[last] = LocEntry {
            file_pos: pos,
            file_size: len + 8,
            data_pos: chunk_data_pos,
            data_size: len,
        };
        rec.table = DataTable::Seekable(table);
        Ok(pos)
    }

    /// Place chunks that still need a home after a header rewrite
    pub(crate) fn place_new_chunks(
        &mut self,
        rec: &mut ObjectRecord,
        num_chunks: u64,
        min_chunk_size: u64,
    ) -> Result<()> {
        let remap_pos = rec.obj_pos + rec.obj_size;
        let pref = remap_pos + rec.table_size;
        let mut pos = self.reserve_bytes(CHUNK_FRAME * num_chunks + min_chunk_size, Some(pref))?;
        if pos == remap_pos {
            pos = remap_pos + rec.table_size;
        }

        let mut table = match std::mem::replace(&mut rec.table, DataTable::None) {
            DataTable::Seekable(t) => t,
            _ => Vec::new(),
        };

        let chunk_nums: Vec<u64> = rec.chunks.keys().copied().collect();
        for num in chunk_nums {
            let chunk = rec.chunks.get_mut(&num).unwrap();
            if chunk.data.len() > CHUNK_PAYLOAD {
                chunk.data.truncate(CHUNK_PAYLOAD);
            }
            let len = chunk.data.len() as u64;
            let (file_pos, file_size, data_pos) = (chunk.file_pos, chunk.file_size, chunk.data_pos);

            if file_size < len + 8 {
                if file_size > 0 {
                    self.free_bytes(file_pos, file_size)?;
                }

                if len >= CHUNK_PAYLOAD as u64 {
                    if table.len() <= 1 {
                        table = vec![
                            LocEntry {
                                file_pos: pos,
                                file_size: 0,
                                data_pos: 0,
                                data_size: 0,
                            },
                            LocEntry {
                                file_pos: 0,
                                file_size: 0,
                                data_pos: 0,
                                data_size: 0,
                            },
                        ];
                    }
                    let mut tnum = table.len() - 2;
                    if table[tnum].file_pos + table[tnum].file_size != pos
                        || table[tnum].file_size >= MAX_RUN
                    {
                        let tail = table.pop().unwrap();
                        table.push(LocEntry {
                            file_pos: pos,
                            file_size: 0,
                            data_pos,
                            data_size: 0,
                        });
                        table.push(tail);
                        tnum = table.len() - 2;
                    }
                    table[tnum].file_size += CHUNK_FRAME;
                    table[tnum].data_size += CHUNK_PAYLOAD as u64;

                    let chunk = rec.chunks.get_mut(&num).unwrap();
                    chunk.file_pos = pos;
                    chunk.file_size = CHUNK_FRAME;
                    pos += CHUNK_FRAME;
                } else {
                    if !table.is_empty() {
                        table.pop();
                    }
                    table.push(LocEntry {
                        file_pos: pos,
                        file_size: len + 8,
                        data_pos,
                        data_size: len,
                    });

                    let chunk = rec.chunks.get_mut(&num).unwrap();
                    chunk.file_pos = pos;
                    chunk.file_size = len + 8;
                    pos += len + 8;
                }
            }
        }

        rec.table = DataTable::Seekable(table);
        Ok(())
    }

    // ---- locations table -------------------------------------------------

    /// Serialize and write the DATA-locations table after the object header
    pub(crate) fn write_locations_table(&mut self, rec: &mut ObjectRecord) -> Result<()> {
        let table: &[LocEntry] = match &rec.table {
            DataTable::Seekable(t) => t,
            _ => &[],
        };
        let y = table.len();
        if y > structure::MAX_TABLE_ENTRIES {
            return Err(IfdsError::WriteFailed(
                "too many DATA locations table entries".into(),
            ));
        }

        let mut data = Vec::with_capacity(rec.table_size as usize);
        data.push(TYPE_DATA_CHUNKS);
        data.push(structure::DC_DATA_LOCATIONS);
        let count = ((rec.table_size - 18) / 10) as u16;
        data.extend_from_slice(&count.to_be_bytes());

        for tinfo in table.iter().take(y.saturating_sub(1)) {
            data.extend_from_slice(&((tinfo.file_size / CHUNK_FRAME) as u16).to_be_bytes());
            data.extend_from_slice(&tinfo.file_pos.to_be_bytes());
        }

        // Pad unused reserved entries.
        if (data.len() as u64) + 14 < rec.table_size {
            data.resize((rec.table_size - 14) as usize, 0);
        }

        match table.last() {
            None => data.extend_from_slice(&[0u8; 10]),
            Some(tinfo) => {
                data.extend_from_slice(&(tinfo.file_size as u16).to_be_bytes());
                data.extend_from_slice(&tinfo.file_pos.to_be_bytes());
            }
        }

        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_be_bytes());

        if data.len() as u64 != rec.table_size {
            return Err(IfdsError::WriteFailed(
                "DATA locations table size mismatch".into(),
            ));
        }
        let pos = rec.obj_pos + rec.obj_size;
        self.write_at(&data, pos)
    }

    // ---- merge-down ------------------------------------------------------

    /// Relocate chunk runs to bound the locations table at 65536 entries
    ///
    /// Only objects past ~4.2GB of fragmented growth ever trigger this.
    pub(crate) fn merge_down_chunks(
        &mut self,
        rec: &mut ObjectRecord,
        new_entries: u64,
    ) -> Result<()> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        if rec.data_method() != ENCODER_DATA_CHUNKS {
            return Err(IfdsError::InvalidEncoding(
                "object is not using a DATA locations table".into(),
            ));
        }
        let mut table = match std::mem::replace(&mut rec.table, DataTable::None) {
            DataTable::Seekable(t) => t,
            other => {
                rec.table = other;
                return Ok(());
            }
        };

        if table.len() as u64 + new_entries > structure::MAX_TABLE_ENTRIES as u64 {
            debug!(id = rec.id, entries = table.len(), "Merging down DATA chunk runs");
            let mut tnum = 0usize;
            let mut y = table.len() - 1;
            if y >= 65535 {
                y = 65534;
            }
            let mut numleft = y as i64 + new_entries as i64 - 52268;

            while tnum < y && numleft > 0 {
                if table[tnum].file_size < MAX_RUN {
                    let pos0 = self.reserve_bytes(MAX_RUN, None)?;
                    self.move_chunk_bytes(
                        rec,
                        table[tnum].file_pos,
                        table[tnum].file_size,
                        pos0,
                    )?;
                    table[tnum].file_pos = pos0;

                    let mut pos = pos0 + table[tnum].file_size;
                    let mut space_left = MAX_RUN - table[tnum].file_size;

                    while tnum + 1 < y && numleft > 0 && space_left > 0 {
                        if space_left >= table[tnum + 1].file_size {
                            let next = table[tnum + 1];
                            self.move_chunk_bytes(rec, next.file_pos, next.file_size, pos)?;
                            table[tnum].file_size += next.file_size;
                            table[tnum].data_size += next.data_size;
                            pos += next.file_size;
                            space_left -= next.file_size;
                            table.remove(tnum + 1);
                            if rec.table_idx > tnum {
                                rec.table_idx -= 1;
                            }
                            y -= 1;
                            numleft -= 1;
                        } else {
                            let moved = space_left;
                            let next_pos = table[tnum + 1].file_pos;
                            self.move_chunk_bytes(rec, next_pos, moved, pos)?;
                            let data_diff = (moved / CHUNK_FRAME) * CHUNK_PAYLOAD as u64;
                            table[tnum].file_size += moved;
                            table[tnum].data_size += data_diff;
                            table[tnum + 1].file_pos += moved;
                            table[tnum + 1].file_size -= moved;
                            table[tnum + 1].data_pos += data_diff;
                            table[tnum + 1].data_size -= data_diff;
                            space_left = 0;
                        }
                    }

                    if space_left > 0 {
                        self.free_bytes(pos, space_left)?;
                    }
                }

                rec.header_dirty = true;
                tnum += 1;
            }

            if table.len() as u64 + new_entries > structure::MAX_TABLE_ENTRIES as u64 {
                rec.table = DataTable::Seekable(table);
                return Err(IfdsError::Corrupted(
                    "unable to fulfill merge down request".into(),
                ));
            }
        }

        rec.table = DataTable::Seekable(table);
        Ok(())
    }

    /// Move a run of chunk bytes, zeroing the vacated source region
    fn move_chunk_bytes(
        &mut self,
        rec: &mut ObjectRecord,
        src_pos: u64,
        src_size: u64,
        dest_pos: u64,
    ) -> Result<()> {
        let (orig_src, orig_size, orig_dest) = (src_pos, src_size, dest_pos);
        let mut src = src_pos;
        let mut left = src_size;
        let mut dest = dest_pos;

        while left > 0 {
            let n = left.min(CHUNK_FRAME) as usize;
            let data = self
                .read_at(src, n)?
                .ok_or_else(|| IfdsError::ReadFailed("unable to read data chunks during relocation".into()))?;
            self.write_at(&data, dest)?;
            let zeros = vec![0u8; data.len()];
            self.write_at(&zeros, src)?;
            let y = data.len() as u64;
            src += y;
            left -= y;
            dest += y;
        }

        for chunk in rec.chunks.values_mut() {
            if chunk.file_pos >= orig_src && chunk.file_pos + chunk.file_size <= orig_src + orig_size
            {
                chunk.file_pos = chunk.file_pos - orig_src + orig_dest;
            }
        }
        Ok(())
    }
}
