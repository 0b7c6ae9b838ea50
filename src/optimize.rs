//! Container compaction
//!
//! Copies every live object from a source container into a freshly created
//! destination, dropping deleted gaps and fragmentation. Object IDs are
//! preserved exactly; the ID map is rebuilt up front so page layout is
//! dense. Objects are copied grouped by last-access day, most recent first,
//! so hot data clusters near the front of the new file. Linked lists are
//! copied head-then-nodes in chain order regardless of each node's own
//! last-access day.

use crate::engine::{fatal_eof, Ifds, LoadedStructure};
use crate::error::{IfdsError, Result};
use crate::idmap::{IdEntry, IdPage, IDS_PER_PAGE};
use crate::object::{DataTable, ObjHandle, ObjectRecord};
use crate::structure::{
    LocEntry, CHUNK_FRAME, CHUNK_PAYLOAD, ENCODER_DATA_CHUNKS, ENCODER_DATA_CHUNKS_STREAM,
    TYPE_LINKED_LIST,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

const MAX_RUN: u64 = 65535 * CHUNK_FRAME;

/// Copy all live objects from `src` into the freshly created `dest`
///
/// `dest` must be a just-created container (nothing but its header and root
/// structures written). On success `dest` is flushed and holds an optimized
/// copy of `src`.
pub fn optimize(src: &mut Ifds, dest: &mut Ifds) -> Result<()> {
    src.write_id_map()?;

    let src_hdr_size = src
        .header
        .as_ref()
        .ok_or(IfdsError::NotOpen)?
        .size;
    {
        let dest_hdr = dest.header.as_ref().ok_or(IfdsError::NotOpen)?;
        if dest.max_pos() != dest_hdr.size {
            return Err(IfdsError::InvalidOperation(
                "destination container is not empty".into(),
            ));
        }
    }

    info!("Optimizing container");

    // Carry the name map over verbatim.
    {
        let entries = src
            .name_map
            .as_ref()
            .map(|nm| nm.entries.clone())
            .unwrap_or_default();
        if let Some(nm) = dest.name_map.as_mut() {
            nm.entries = entries;
            nm.dirty = true;
        }
        dest.write_name_map()?;
    }

    // Rebuild the ID map densely, collecting per-day ID ranges.
    let mut used_dates: BTreeMap<u16, (u64, u64)> = BTreeMap::new();
    let page_count = src.id_map.as_ref().map(|im| im.pages.len()).unwrap_or(0);

    for pagenum in 0..page_count {
        src.load_id_page(pagenum)?;
        dest.load_id_page(pagenum)?;

        let entries: Vec<IdEntry> = {
            let im = src.id_map.as_ref().unwrap();
            match &im.pages[pagenum] {
                IdPage::Loaded(page) => page.entries.clone(),
                IdPage::Unloaded { .. } => Vec::new(),
            }
        };

        let dest_im = dest.id_map.as_mut().unwrap();
        let IdPage::Loaded(dest_page) = &mut dest_im.pages[pagenum] else {
            return Err(IfdsError::Corrupted("destination ID page not loaded".into()));
        };

        for (pageid, entry) in entries.iter().enumerate() {
            let id2 = pagenum as u64 * IDS_PER_PAGE + pageid as u64;
            if entry.pos >= src_hdr_size && entry.pos > 0 {
                dest_page.entries.push(IdEntry {
                    pos: 0,
                    size: 1,
                    last: 0,
                });
                dest_page.assigned += 1;
                used_dates
                    .entry(entry.last)
                    .and_modify(|r| r.1 = id2)
                    .or_insert((id2, id2));
            } else {
                dest_page.entries.push(IdEntry::default());
            }
        }
        dest_page.dirty = true;
        dest_im.dirty = true;
    }

    dest.write_id_map()?;

    // Copy objects, most recently accessed first.
    let dates: Vec<(u16, (u64, u64))> = used_dates.into_iter().rev().collect();
    for (date, (min_id2, max_id2)) in dates {
        for id2 in min_id2..=max_id2 {
            let pagenum = (id2 / IDS_PER_PAGE) as usize;
            let pageid = (id2 % IDS_PER_PAGE) as usize;
            src.load_id_page(pagenum)?;

            let entry = {
                let im = src.id_map.as_ref().unwrap();
                match &im.pages[pagenum] {
                    IdPage::Loaded(page) => page.entries.get(pageid).copied(),
                    _ => None,
                }
            };
            let Some(entry) = entry else { continue };
            if entry.pos < src_hdr_size || entry.pos == 0 || entry.last != date {
                continue;
            }

            let id = id2 as i64 + 1;
            let h = src.get_object_by_id(id, false)?;

            let base = src.arena.get(h)?.base_type();
            let result = if base == TYPE_LINKED_LIST {
                copy_linked_list(src, dest, h)
            } else {
                copy_object(src, dest, h).map(|_| ())
            };
            src.release(h)?;
            result?;
        }
    }

    dest.flush_all()
}

/// Copy a linked list head plus all of its nodes in chain order
fn copy_linked_list(src: &mut Ifds, dest: &mut Ifds, head: ObjHandle) -> Result<()> {
    // Leaf nodes are copied with their list; skip them at the top level.
    if src.arena.get(head)?.is_leaf() {
        return Ok(());
    }

    // Normalization may rewrite nodes, so it happens before the copy.
    let mut iter = src.create_linked_list_iterator(head)?;
    copy_object(src, dest, head)?;

    while src.next_linked_list_node(&mut iter)? {
        if let Some(node) = iter.node() {
            copy_object(src, dest, node)?;
        }
    }
    Ok(())
}

/// Copy one object (header, type info, data) into the destination
fn copy_object(src: &mut Ifds, dest: &mut Ifds, h: ObjHandle) -> Result<ObjHandle> {
    src.write_object(h)?;
    src.seek(h, 0)?;

    let src_rec = src.arena.get(h)?.clone();
    debug!(id = src_rec.id, kind = src_rec.type_name(), "Copying object");

    let mut rec = ObjectRecord {
        header_dirty: true,
        data_dirty: true,
        obj_pos: 0,
        obj_size: 0,
        table: DataTable::None,
        table_idx: 0,
        ..src_rec.clone()
    };
    if rec.id < 0 {
        rec.id = dest.next_neg_id;
        dest.next_neg_id -= 1;
    }

    let method = rec.data_method();
    let src_data_size = src_rec.data_size;

    if method == ENCODER_DATA_CHUNKS_STREAM {
        rec.data_size = 0;
        rec.data_pos = 0;
        rec.chunk_num = 0;
        rec.chunks.clear();
    } else if method == ENCODER_DATA_CHUNKS {
        // Pre-size the locations table for the data about to be copied.
        rec.table_size = 18;
        if src_data_size >= CHUNK_PAYLOAD as u64 {
            rec.table_size += (src_data_size / (65535 * CHUNK_PAYLOAD as u64) + 1) * 10;
        }
        rec.data_size = 0;
        rec.data_pos = 0;
        rec.chunk_num = 0;
        rec.chunks.clear();
    }

    dest.est_ram += rec.est_ram;
    let id = rec.id;
    let dh = dest.arena.insert(rec);
    dest.by_id.insert(id, dh);
    dest.arena.open(dh)?;

    dest.write_object(dh)?;

    if method == ENCODER_DATA_CHUNKS_STREAM {
        copy_stream_data(src, dest, &src_rec)?;

        // The raw frames were written directly; drop the placeholder record
        // so later readers load it from the destination bytes.
        dest.inflight = None;
        let rec = dest.arena.remove(dh)?;
        dest.est_ram = dest.est_ram.saturating_sub(rec.est_ram);
        dest.by_id.remove(&rec.id);
        if rec.obj_pos > 0 {
            dest.by_pos.remove(&rec.obj_pos);
        }
        return Ok(dh);
    }

    if method == ENCODER_DATA_CHUNKS {
        copy_chunked_data(src, dest, &src_rec, dh)?;

        let mut rec = dest.arena.take(dh)?;
        rec.data_size = src_data_size;
        let result = (|| -> Result<()> {
            dest.write_locations_table(&mut rec)?;
            dest.seek_inner(&mut rec, 0)
        })();
        dest.arena.put(dh, rec);
        result?;
    }

    dest.release(dh)?;
    Ok(dh)
}

/// Copy interleaved frames verbatim up to the channel-0 terminator
fn copy_stream_data(src: &mut Ifds, dest: &mut Ifds, src_rec: &ObjectRecord) -> Result<()> {
    let mut filepos = src_rec.obj_pos + src_rec.obj_size;
    let mut buf = Vec::new();
    let mut next_size = CHUNK_FRAME as usize;

    loop {
        let outcome = src
            .read_next_structure(&mut filepos, &mut buf, next_size, true)
            .map_err(fatal_eof)?;
        let raw = outcome.raw.unwrap_or_default();
        match outcome.structure {
            LoadedStructure::DataChunk {
                streamed: true,
                term,
                channel,
                ..
            } => {
                let end = dest.max_pos();
                dest.write_at(&raw, end)?;
                if term && channel == Some(0) {
                    return Ok(());
                }
            }
            _ => {
                return Err(IfdsError::Corrupted(
                    "unexpected structure inside interleaved DATA chunks".into(),
                ))
            }
        }
        next_size = outcome.next_size;
    }
}

/// Copy seekable chunk runs, rebuilding the destination locations table
fn copy_chunked_data(
    src: &mut Ifds,
    dest: &mut Ifds,
    src_rec: &ObjectRecord,
    dh: ObjHandle,
) -> Result<()> {
    let src_table = match &src_rec.table {
        DataTable::Seekable(t) => t.clone(),
        _ => Vec::new(),
    };
    if src_table.is_empty() {
        return Ok(());
    }

    let mut dest_table: Vec<LocEntry> = Vec::new();
    let mut data_pos = 0u64;

    // Full 64KB frames from every run except the final partial chunk.
    for tinfo in src_table.iter().take(src_table.len() - 1) {
        let mut pos = tinfo.file_pos;
        let mut left = tinfo.file_size;
        while left > 0 {
            let frame = src
                .read_at(pos, CHUNK_FRAME as usize)?
                .filter(|d| d.len() == CHUNK_FRAME as usize)
                .ok_or_else(|| {
                    IfdsError::ReadFailed("unable to copy object data".into())
                })?;

            let dest_pos = dest.max_pos();
            let extend = dest_table
                .last()
                .map(|t| t.file_pos + t.file_size == dest_pos && t.file_size < MAX_RUN)
                .unwrap_or(false);
            if extend {
                let last = dest_table.last_mut().unwrap();
                last.file_size += CHUNK_FRAME;
                last.data_size += CHUNK_PAYLOAD as u64;
            } else {
                dest_table.push(LocEntry {
                    file_pos: dest_pos,
                    file_size: CHUNK_FRAME,
                    data_pos,
                    data_size: CHUNK_PAYLOAD as u64,
                });
            }
            dest.write_at(&frame, dest_pos)?;

            data_pos += CHUNK_PAYLOAD as u64;
            pos += CHUNK_FRAME;
            left -= CHUNK_FRAME.min(left);
        }
    }

    // Final partial chunk, reframed verbatim.
    let last = src_table.last().unwrap();
    let mut final_entry = LocEntry {
        file_pos: 0,
        file_size: 0,
        data_pos,
        data_size: 0,
    };
    if last.file_pos > 0 && last.file_size >= 8 {
        let mut filepos = last.file_pos;
        let mut buf = Vec::new();
        let outcome = src
            .read_next_structure(&mut filepos, &mut buf, last.file_size as usize, true)
            .map_err(fatal_eof)?;
        let raw = outcome.raw.unwrap_or_default();
        match outcome.structure {
            LoadedStructure::DataChunk {
                streamed: false, ..
            } if raw.len() < CHUNK_FRAME as usize => {
                let dest_pos = dest.max_pos();
                dest.write_at(&raw, dest_pos)?;
                final_entry.file_pos = dest_pos;
                final_entry.file_size = raw.len() as u64;
                final_entry.data_size = raw.len() as u64 - 8;
            }
            _ => {
                return Err(IfdsError::Corrupted(
                    "last DATA chunk of copied object is invalid".into(),
                ))
            }
        }
    }
    dest_table.push(final_entry);

    dest.arena.get_mut(dh)?.table = DataTable::Seekable(dest_table);
    Ok(())
}
