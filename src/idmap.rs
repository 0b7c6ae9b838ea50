//! Object-ID map
//!
//! Maps a positive object ID to its current header position and size (plus
//! an optional last-access day). Uses the same two-level paging as the free
//! map: a root fixed array of `(page position u64, unassigned count u16)`
//! entries, one per 65536-ID page, and per-page fixed arrays whose entry
//! stride adapts to the largest position stored (2/4/8 bytes) plus the
//! feature-gated size and last-access columns.
//!
//! The root structures are themselves fixed-array objects and are loaded
//! through a bootstrap path that never consults the ID map; any ID found on
//! them is stripped to prevent load cycles.

use crate::chunks::DataRead;
use crate::engine::Ifds;
use crate::error::{IfdsError, Result};
use crate::object::{ObjHandle, TypeInfo};
use crate::header::{FEATURE_OBJECT_ID_LAST_ACCESS, FEATURE_OBJECT_ID_STRUCT_SIZE};
use crate::structure::TYPE_FIXED_ARRAY;
use tracing::{debug, trace};

/// IDs per page
pub const IDS_PER_PAGE: u64 = 65536;

/// One ID slot: current position, structure size, last-access day
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IdEntry {
    pub pos: u64,
    pub size: u32,
    pub last: u16,
}

pub(crate) struct IdPageLoaded {
    pub handle: ObjHandle,
    pub entries: Vec<IdEntry>,
    pub assigned: u32,
    pub dirty: bool,
}

pub(crate) enum IdPage {
    Unloaded { file_pos: u64, unassigned: u16 },
    Loaded(IdPageLoaded),
}

pub(crate) struct IdMapState {
    pub root: ObjHandle,
    pub pages: Vec<IdPage>,
    pub dirty: bool,
}

fn page_of(id: u32) -> (usize, usize) {
    let id2 = id as u64 - 1;
    ((id2 / IDS_PER_PAGE) as usize, (id2 % IDS_PER_PAGE) as usize)
}

impl Ifds {
    fn id_features(&self) -> (bool, bool) {
        match self.header.as_ref() {
            Some(hdr) => (
                hdr.has_feature(FEATURE_OBJECT_ID_STRUCT_SIZE),
                hdr.has_feature(FEATURE_OBJECT_ID_LAST_ACCESS),
            ),
            None => (false, false),
        }
    }

    // ---- bootstrap -------------------------------------------------------

    pub(crate) fn create_id_root(&mut self) -> Result<bool> {
        if self.id_map.is_none() {
            // Fixed array: 8-byte page position + 2-byte unassigned count.
            let h = self.create_fixed_array_internal(10, None, false)?;
            self.arena.get_mut(h)?.manual = true;
            self.id_map = Some(IdMapState {
                root: h,
                pages: Vec::new(),
                dirty: false,
            });
        }
        Ok(true)
    }

    /// Load the root ID map through the bootstrap path
    pub(crate) fn load_id_root(&mut self, create: bool) -> Result<bool> {
        if self.id_map.is_some() {
            return Ok(true);
        }

        let (id_pos, hdr_size) = match self.header.as_ref() {
            Some(hdr) => (hdr.id_map_pos, hdr.size),
            None => return if create { self.create_id_root() } else { Ok(false) },
        };
        if id_pos < hdr_size {
            return if create { self.create_id_root() } else { Ok(false) };
        }

        let loaded = (|| -> Result<(ObjHandle, Vec<IdPage>)> {
            let h = self.get_object_by_position(id_pos, 4092)?;
            {
                let rec = self.arena.get(h)?;
                if rec.type_byte != TYPE_FIXED_ARRAY
                    || !matches!(rec.info, TypeInfo::FixedArray { entry_size: 10, .. })
                {
                    return Err(IfdsError::InvalidObject("ID map root mismatch".into()));
                }
            }
            let mut rec = self.arena.take(h)?;
            let result = (|| -> Result<DataRead> {
                self.seek_inner(&mut rec, 0)?;
                self.read_data_inner(&mut rec, Some(10 * 65536), None)
            })();
            self.arena.put(h, rec);
            let data = result?.data.unwrap_or_default();

            let mut pages = Vec::new();
            let y = data.len().min(10 * 65536);
            let mut x = 0;
            while x + 9 < y {
                pages.push(IdPage::Unloaded {
                    file_pos: u64::from_be_bytes(data[x..x + 8].try_into().unwrap()),
                    unassigned: u16::from_be_bytes([data[x + 8], data[x + 9]]),
                });
                x += 10;
            }
            Ok((h, pages))
        })();

        match loaded {
            Ok((h, pages)) => {
                self.arena.get_mut(h)?.manual = true;
                self.id_map = Some(IdMapState {
                    root: h,
                    pages,
                    dirty: false,
                });
                self.strip_root_object_id(h)?;
                self.reset_root_streaming(h)?;
                Ok(true)
            }
            Err(_) => {
                if let Some(hdr) = self.header.as_mut() {
                    hdr.id_map_pos = 0;
                }
                if create {
                    self.create_id_root()
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Drop any positive ID carried by a root structure, assigning a
    /// transient one instead
    pub(crate) fn strip_root_object_id(&mut self, h: ObjHandle) -> Result<()> {
        let (id, obj_pos) = {
            let rec = self.arena.get(h)?;
            (rec.id, rec.obj_pos)
        };
        if id <= 0 {
            return Ok(());
        }

        let (pagenum, pageid) = page_of(id as u32);
        let page_exists = self
            .id_map
            .as_ref()
            .map(|im| pagenum < im.pages.len())
            .unwrap_or(false);
        if page_exists {
            self.load_id_page(pagenum)?;
            let im = self.id_map.as_mut().unwrap();
            if let IdPage::Loaded(page) = &mut im.pages[pagenum] {
                // Positions must match to prevent ID-table shenanigans.
                if page
                    .entries
                    .get(pageid)
                    .map(|e| e.pos == obj_pos)
                    .unwrap_or(false)
                {
                    page.entries[pageid] = IdEntry::default();
                    page.assigned = page.assigned.saturating_sub(1);
                    page.dirty = true;
                    im.dirty = true;
                }
            }
        }

        self.by_id.remove(&id);
        let new_id = self.next_neg_id;
        self.next_neg_id -= 1;
        let rec = self.arena.get_mut(h)?;
        rec.id = new_id;
        rec.header_dirty = true;
        self.by_id.insert(new_id, h);
        if obj_pos > 0 {
            self.by_pos.insert(obj_pos, new_id);
        }
        Ok(())
    }

    // ---- pages -----------------------------------------------------------

    fn create_id_page(&mut self, pagenum: usize) -> Result<()> {
        // Placeholder stride; rewritten to the real entry width on flush.
        let h = self.create_fixed_array_internal(12, None, false)?;
        self.arena.get_mut(h)?.manual = true;
        let im = self.id_map.as_mut().unwrap();
        while im.pages.len() <= pagenum {
            im.pages.push(IdPage::Unloaded {
                file_pos: 0,
                unassigned: 0,
            });
        }
        im.pages[pagenum] = IdPage::Loaded(IdPageLoaded {
            handle: h,
            entries: Vec::new(),
            assigned: 0,
            dirty: false,
        });
        im.dirty = true;
        Ok(())
    }

    pub(crate) fn load_id_page(&mut self, pagenum: usize) -> Result<()> {
        let im = self
            .id_map
            .as_ref()
            .ok_or_else(|| IfdsError::Corrupted("ID map not loaded".into()))?;
        if pagenum >= im.pages.len() {
            return self.create_id_page(pagenum);
        }
        let file_pos = match &im.pages[pagenum] {
            IdPage::Loaded(_) => return Ok(()),
            IdPage::Unloaded { file_pos, .. } => *file_pos,
        };

        let (has_size, has_last) = self.id_features();
        let base = if has_size { 2 } else { 0 } + if has_last { 2 } else { 0 };

        let loaded = (|| -> Result<(ObjHandle, Vec<IdEntry>, u32)> {
            let h = self.get_object_by_position(file_pos, 4092)?;
            let stride = {
                let rec = self.arena.get(h)?;
                match rec.info {
                    TypeInfo::FixedArray { entry_size, .. } if rec.type_byte == TYPE_FIXED_ARRAY => {
                        entry_size as usize
                    }
                    _ => return Err(IfdsError::InvalidObject("ID table page mismatch".into())),
                }
            };
            let pos_width = match stride.checked_sub(base) {
                Some(2) => 2,
                Some(4) => 4,
                Some(8) => 8,
                _ => return Err(IfdsError::InvalidObject("ID table entry width mismatch".into())),
            };
            let entry_size = pos_width + base;

            let mut rec = self.arena.take(h)?;
            let result = (|| -> Result<DataRead> {
                self.seek_inner(&mut rec, 0)?;
                self.read_data_inner(&mut rec, Some(entry_size * 65536), None)
            })();
            self.arena.put(h, rec);
            let data = result?.data.unwrap_or_default();

            let mut entries = Vec::new();
            let mut assigned = 0u32;
            let y = data.len().min(entry_size * 65536);
            let mut x = 0;
            while x + entry_size <= y {
                let pos = match pos_width {
                    2 => u16::from_be_bytes(data[x..x + 2].try_into().unwrap()) as u64,
                    4 => u32::from_be_bytes(data[x..x + 4].try_into().unwrap()) as u64,
                    _ => u64::from_be_bytes(data[x..x + 8].try_into().unwrap()),
                };
                let mut off = x + pos_width;
                let size = if has_size {
                    let s = u16::from_be_bytes(data[off..off + 2].try_into().unwrap()) as u32;
                    off += 2;
                    s
                } else {
                    8
                };
                let last = if has_last {
                    u16::from_be_bytes(data[off..off + 2].try_into().unwrap())
                } else {
                    0
                };
                if pos > 0 || size > 0 {
                    assigned += 1;
                }
                entries.push(IdEntry { pos, size, last });
                x += entry_size;
            }
            Ok((h, entries, assigned))
        })();

        match loaded {
            Ok((h, entries, assigned)) => {
                self.arena.get_mut(h)?.manual = true;
                let im = self.id_map.as_mut().unwrap();
                im.pages[pagenum] = IdPage::Loaded(IdPageLoaded {
                    handle: h,
                    entries,
                    assigned,
                    dirty: false,
                });
                self.strip_root_object_id(h)?;
                self.reset_root_streaming(h)?;
                Ok(())
            }
            Err(_) => self.create_id_page(pagenum),
        }
    }

    // ---- allocation ------------------------------------------------------

    /// First unassigned ID strictly greater than `after`
    ///
    /// Fully assigned pages are skipped via their unassigned counters
    /// without loading them.
    pub(crate) fn find_next_available_id(&mut self, after: i64) -> Result<u64> {
        let mut id = after.max(0) as u64 + 1;
        if self.id_map.is_none() {
            return Ok(id);
        }

        let mut pagenum = ((id - 1) / IDS_PER_PAGE) as usize;
        let mut pageid = ((id - 1) % IDS_PER_PAGE) as usize;

        loop {
            let page_state = {
                let im = self.id_map.as_ref().unwrap();
                if pagenum >= im.pages.len() {
                    break;
                }
                match &im.pages[pagenum] {
                    IdPage::Unloaded { unassigned, .. } => Some(*unassigned),
                    IdPage::Loaded(_) => None,
                }
            };
            if let Some(unassigned) = page_state {
                if unassigned > 0 {
                    self.load_id_page(pagenum)?;
                }
            }

            let im = self.id_map.as_ref().unwrap();
            match &im.pages[pagenum] {
                IdPage::Loaded(page) if page.assigned < IDS_PER_PAGE as u32 => {
                    let y = page.entries.len();
                    while pageid < y && page.entries[pageid].pos > 0 {
                        id += 1;
                        pageid += 1;
                    }
                    break;
                }
                _ => {
                    pagenum += 1;
                    id += (IDS_PER_PAGE as usize - pageid) as u64;
                    pageid = 0;
                }
            }
        }
        Ok(id)
    }

    /// Record a freshly allocated ID in its page
    pub(crate) fn mark_id_assigned(&mut self, id: u32) -> Result<()> {
        let (pagenum, pageid) = page_of(id);
        self.load_id_page(pagenum)?;

        let date_diff = self.header.as_ref().map(|h| h.date_diff).unwrap_or(0);
        let (handle, grew) = {
            let im = self.id_map.as_mut().unwrap();
            let IdPage::Loaded(page) = &mut im.pages[pagenum] else {
                return Err(IfdsError::Corrupted("ID page not loaded".into()));
            };
            let grew = pageid >= page.entries.len();
            if grew {
                page.entries.resize(pageid, IdEntry::default());
                page.entries.push(IdEntry {
                    pos: 0,
                    size: 1,
                    last: date_diff,
                });
            }
            page.assigned += 1;
            page.dirty = true;
            im.dirty = true;
            (page.handle, grew)
        };

        // A growing internal-data page will relocate on its next write;
        // free its bytes up front.
        if grew {
            let is_internal = self.arena.get(handle)?.data_method()
                == crate::structure::ENCODER_INTERNAL_DATA;
            if is_internal {
                let mut rec = self.arena.take(handle)?;
                let result = self.clear_object_storage(&mut rec);
                self.arena.put(handle, rec);
                result?;
            }
        }
        Ok(())
    }

    /// Refresh an ID's position/size after its object relocated
    pub(crate) fn update_id_map_entry(&mut self, id: u32, pos: u64, size: u64) -> Result<()> {
        let (pagenum, pageid) = page_of(id);
        let page_exists = self
            .id_map
            .as_ref()
            .map(|im| pagenum < im.pages.len())
            .unwrap_or(false);
        if !page_exists {
            return Ok(());
        }
        self.load_id_page(pagenum)?;

        let date_diff = self.header.as_ref().map(|h| h.date_diff).unwrap_or(0);
        let im = self.id_map.as_mut().unwrap();
        if let IdPage::Loaded(page) = &mut im.pages[pagenum] {
            if let Some(entry) = page.entries.get_mut(pageid) {
                entry.pos = pos;
                entry.size = size as u32;
                entry.last = date_diff;
                page.dirty = true;
                im.dirty = true;
            }
        }
        Ok(())
    }

    /// Free an ID slot so allocation reuses it before growing
    pub(crate) fn clear_id_map_entry(&mut self, id: u32) -> Result<()> {
        let (pagenum, pageid) = page_of(id);
        let page_exists = self
            .id_map
            .as_ref()
            .map(|im| pagenum < im.pages.len())
            .unwrap_or(false);
        if !page_exists {
            return Ok(());
        }
        self.load_id_page(pagenum)?;

        let im = self.id_map.as_mut().unwrap();
        if let IdPage::Loaded(page) = &mut im.pages[pagenum] {
            if let Some(entry) = page.entries.get_mut(pageid) {
                if entry.pos > 0 || entry.size > 0 {
                    entry.pos = 0;
                    entry.size = 0;
                    page.dirty = true;
                    page.assigned = page.assigned.saturating_sub(1);
                    im.dirty = true;
                }
            }
        }
        Ok(())
    }

    // ---- lookup ----------------------------------------------------------

    /// Resolve an object by ID, loading it through its ID-map entry
    ///
    /// Updates the last-access day (at most once per calendar day) when the
    /// feature is enabled and `update_last_access` is set.
    pub fn get_object_by_id(&mut self, id: i64, update_last_access: bool) -> Result<ObjHandle> {
        if !self.open {
            return Err(IfdsError::NotOpen);
        }
        if id < 1 {
            return Err(IfdsError::InvalidOperation(
                "invalid object ID specified".into(),
            ));
        }

        if let Some(&h) = self.by_id.get(&id) {
            self.arena.open(h)?;
            return Ok(h);
        }

        let (pagenum, pageid) = page_of(id as u32);
        let page_exists = self
            .id_map
            .as_ref()
            .map(|im| pagenum < im.pages.len())
            .unwrap_or(false);
        if !page_exists {
            return Err(IfdsError::ObjectNotFound(id));
        }
        self.load_id_page(pagenum)?;

        let (filepos, size) = {
            let im = self.id_map.as_ref().unwrap();
            let IdPage::Loaded(page) = &im.pages[pagenum] else {
                return Err(IfdsError::ObjectNotFound(id));
            };
            let entry = page.entries.get(pageid).ok_or(IfdsError::ObjectNotFound(id))?;
            (entry.pos, entry.size)
        };
        let hdr_size = self.header.as_ref().map(|h| h.size).unwrap_or(0);
        if filepos == 0 || filepos < hdr_size {
            return Err(IfdsError::ObjectNotFound(id));
        }

        let h = self.get_object_by_position(filepos, size.max(8) as usize)?;

        // Re-key the record from its transient load ID to the real one.
        let old_id = self.arena.get(h)?.id;
        if old_id != id {
            self.by_id.remove(&old_id);
            if old_id == self.next_neg_id + 1 {
                self.next_neg_id += 1;
            }
            let rec = self.arena.get_mut(h)?;
            rec.id = id;
            let obj_pos = rec.obj_pos;
            self.by_id.insert(id, h);
            self.by_pos.insert(obj_pos, id);
        }

        let (_, has_last) = self.id_features();
        if has_last && update_last_access {
            let date_diff = self.header.as_ref().map(|h| h.date_diff).unwrap_or(0);
            let im = self.id_map.as_mut().unwrap();
            if let IdPage::Loaded(page) = &mut im.pages[pagenum] {
                if let Some(entry) = page.entries.get_mut(pageid) {
                    if entry.last < date_diff {
                        entry.last = date_diff;
                        page.dirty = true;
                        im.dirty = true;
                    }
                }
            }
        }

        trace!(id, filepos, "Loaded object by ID");
        Ok(h)
    }

    // ---- persistence -----------------------------------------------------

    /// Serialize and write the ID map (root and all loaded pages)
    pub fn write_id_map(&mut self) -> Result<()> {
        if self.id_map.is_none() {
            return Ok(());
        }

        // Shrink: drop trailing never-assigned slots, then empty tail pages.
        loop {
            let (handle, empty) = {
                let im = self.id_map.as_mut().unwrap();
                let Some(last) = im.pages.last_mut() else {
                    break;
                };
                let IdPage::Loaded(page) = last else {
                    break;
                };
                while page.entries.last().map(|e| e.size == 0).unwrap_or(false) {
                    page.entries.pop();
                    page.dirty = true;
                }
                (page.handle, page.entries.is_empty())
            };
            if !empty {
                break;
            }
            debug!("Dropping empty trailing ID map page");
            self.delete_object(handle)?;
            self.id_map.as_mut().unwrap().pages.pop();
        }

        // First write: the root node goes out before any page entries.
        {
            let (root, page_count) = {
                let im = self.id_map.as_ref().unwrap();
                (im.root, im.pages.len())
            };
            if self.arena.get(root)?.data_size == 0 {
                let mut rec = self.arena.take(root)?;
                let result = (|| -> Result<()> {
                    self.write_data_inner(&mut rec, &vec![0u8; page_count * 10])?;
                    if let TypeInfo::FixedArray { entries, .. } = &mut rec.info {
                        *entries = page_count as u32;
                    }
                    self.write_object_inner(&mut rec, false)?;
                    rec.header_dirty = true;
                    Ok(())
                })();
                self.arena.put(root, rec);
                result?;
            }
        }

        let (has_size, has_last) = self.id_features();

        // Write and unload every loaded page.
        let page_count = self.id_map.as_ref().unwrap().pages.len();
        for idx in 0..page_count {
            let loaded = {
                let im = self.id_map.as_ref().unwrap();
                match &im.pages[idx] {
                    IdPage::Loaded(page) => Some((page.handle, page.dirty)),
                    IdPage::Unloaded { .. } => None,
                }
            };
            let Some((handle, page_dirty)) = loaded else {
                continue;
            };

            if page_dirty {
                let (entries, pos_width) = {
                    let im = self.id_map.as_ref().unwrap();
                    let IdPage::Loaded(page) = &im.pages[idx] else {
                        unreachable!()
                    };
                    let max_pos = page.entries.iter().map(|e| e.pos).max().unwrap_or(0);
                    let pos_width: usize = if max_pos <= 0xFFFF {
                        2
                    } else if max_pos <= 0xFFFF_FFFF {
                        4
                    } else {
                        8
                    };
                    (page.entries.clone(), pos_width)
                };

                let base = if has_size { 2 } else { 0 } + if has_last { 2 } else { 0 };
                let mut data = Vec::with_capacity(entries.len() * (pos_width + base));
                for e in &entries {
                    match pos_width {
                        2 => data.extend_from_slice(&(e.pos as u16).to_be_bytes()),
                        4 => data.extend_from_slice(&(e.pos as u32).to_be_bytes()),
                        _ => data.extend_from_slice(&e.pos.to_be_bytes()),
                    }
                    if has_size {
                        data.extend_from_slice(&(e.size as u16).to_be_bytes());
                    }
                    if has_last {
                        data.extend_from_slice(&e.last.to_be_bytes());
                    }
                }

                let mut rec = self.arena.take(handle)?;
                let result = (|| -> Result<()> {
                    if let TypeInfo::FixedArray { entry_size, .. } = &mut rec.info {
                        *entry_size = (pos_width + base) as u32;
                    }
                    self.seek_inner(&mut rec, 0)?;
                    self.write_data_inner(&mut rec, &data)?;
                    if rec.data_pos < rec.data_size {
                        let pos = rec.data_pos;
                        self.truncate_inner(&mut rec, pos)?;
                    }
                    Ok(())
                })();
                self.arena.put(handle, rec);
                result?;
            }

            if self.arena.get(handle)?.is_modified() {
                let entry_count = {
                    let im = self.id_map.as_ref().unwrap();
                    match &im.pages[idx] {
                        IdPage::Loaded(page) => page.entries.len() as u32,
                        _ => 0,
                    }
                };
                let mut rec = self.arena.take(handle)?;
                if let TypeInfo::FixedArray { entries, .. } = &mut rec.info {
                    *entries = entry_count;
                }
                let result = self.write_object_inner(&mut rec, false);
                self.arena.put(handle, rec);
                result?;
            }

            let obj_pos = self.arena.get(handle)?.obj_pos;
            let assigned = {
                let im = self.id_map.as_ref().unwrap();
                match &im.pages[idx] {
                    IdPage::Loaded(page) => page.assigned,
                    _ => 0,
                }
            };
            let unassigned = if assigned == 0 {
                65535
            } else {
                (IDS_PER_PAGE as u32 - assigned).min(u16::MAX as u32) as u16
            };
            self.arena.release(handle)?;
            let im = self.id_map.as_mut().unwrap();
            im.pages[idx] = IdPage::Unloaded {
                file_pos: obj_pos,
                unassigned,
            };
        }

        // Root ID map object.
        let (root, map_dirty) = {
            let im = self.id_map.as_ref().unwrap();
            (im.root, im.dirty)
        };
        let root_modified = self.arena.get(root)?.is_modified();
        if map_dirty || root_modified {
            let mut data = Vec::new();
            {
                let im = self.id_map.as_ref().unwrap();
                for page in &im.pages {
                    let (file_pos, unassigned) = match page {
                        IdPage::Unloaded {
                            file_pos,
                            unassigned,
                        } => (*file_pos, *unassigned),
                        // A page re-loaded mid-flush by a nested allocator
                        // load keeps its current position.
                        IdPage::Loaded(page) => (
                            self.arena.get(page.handle).map(|r| r.obj_pos).unwrap_or(0),
                            if page.assigned == 0 {
                                65535
                            } else {
                                (IDS_PER_PAGE as u32 - page.assigned).min(u16::MAX as u32) as u16
                            },
                        ),
                    };
                    data.extend_from_slice(&file_pos.to_be_bytes());
                    data.extend_from_slice(&unassigned.to_be_bytes());
                }
            }

            let mut rec = self.arena.take(root)?;
            let result = (|| -> Result<()> {
                self.seek_inner(&mut rec, 0)?;
                self.write_data_inner(&mut rec, &data)?;
                if rec.data_pos < rec.data_size {
                    let pos = rec.data_pos;
                    self.truncate_inner(&mut rec, pos)?;
                }
                if let TypeInfo::FixedArray { entries, .. } = &mut rec.info {
                    *entries = (data.len() / 10) as u32;
                }
                self.write_object_inner(&mut rec, false)
            })();
            let obj_pos = rec.obj_pos;
            self.arena.put(root, rec);
            result?;

            if let Some(hdr) = self.header.as_mut() {
                if hdr.id_map_pos != obj_pos {
                    hdr.id_map_pos = obj_pos;
                    hdr.dirty = true;
                }
            }
            self.id_map.as_mut().unwrap().dirty = false;
        }

        Ok(())
    }
}
