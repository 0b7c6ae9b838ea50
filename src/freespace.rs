//! Free-space allocator
//!
//! Reclaimable byte ranges are tracked in a two-level paged map: the address
//! space splits into 4GiB super-blocks of up to 65536 64KiB blocks. The root
//! free map is a fixed array of `(page position u64, largest free u32)`
//! entries, one per super-block; each page is a fixed array of
//! `(max free run u16, min free offset u16)` entries, one per block.
//!
//! Block detail (the exact offset→length run list) is reconstructed lazily
//! by scanning the block's raw bytes for zero runs between structure frames.
//! A block consulted more than 10,000 times collapses back to its coarse
//! summary to bound memory. Unreadable allocator metadata degrades to
//! "block fully occupied" rather than aborting; when no placement is found
//! the engine appends at the end of the file.

use crate::chunks::DataRead;
use crate::engine::Ifds;
use crate::error::{IfdsError, Result};
use crate::object::{ObjHandle, TypeInfo};
use crate::structure::{base_type, TYPE_DATA_CHUNKS, TYPE_FIXED_ARRAY, TYPE_STREAMED};
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Bytes per super-block
pub const SUPER_BLOCK: u64 = 4_294_967_296;
/// Bytes per block
pub const BLOCK: u64 = 65536;
/// Detail consultations before a page collapses its run maps
const EXTRACT_LIMIT: u32 = 10_000;

/// Exact free runs within one block
#[derive(Debug, Clone)]
pub(crate) enum BlockDetail {
    /// Never loaded this session
    Unloaded,
    /// Previously loaded and collapsed; exactly one run at `min_off`
    Single,
    /// Offset to run length
    Runs(BTreeMap<u32, u32>),
}

/// Coarse per-block summary plus optional detail
#[derive(Debug, Clone)]
pub(crate) struct BlockEntry {
    /// Longest free run in the block (0..=65536)
    pub max_run: u32,
    /// Lowest free offset (65536 when full)
    pub min_off: u32,
    pub detail: BlockDetail,
}

impl BlockEntry {
    fn full() -> Self {
        BlockEntry {
            max_run: 0,
            min_off: BLOCK as u32,
            detail: BlockDetail::Unloaded,
        }
    }
}

pub(crate) struct FreePageLoaded {
    pub handle: ObjHandle,
    pub blocks: Vec<BlockEntry>,
    pub extracted: u32,
    pub dirty: bool,
}

pub(crate) enum FreePage {
    Unloaded { file_pos: u64, largest: u32 },
    Loaded(FreePageLoaded),
}

pub(crate) struct FreeMapState {
    pub root: ObjHandle,
    pub pages: Vec<FreePage>,
    pub dirty: bool,
}

/// Scan a block's raw bytes for free (zero) runs between structure frames
///
/// Returns `None` when a frame cannot be skipped, which callers treat as a
/// fully occupied block.
fn scan_block_runs(data: &[u8], start: u32) -> Option<(BTreeMap<u32, u32>, u32)> {
    let y = data.len();
    let mut x = start as usize;
    if x < y && data[x] != 0 {
        return None;
    }

    let mut runs = BTreeMap::new();
    let mut max = 0u32;

    while x < y {
        let mut x2 = x;
        while x2 < y && base_type(data[x2]) == 0 {
            x2 += 1;
        }
        let run = (x2 - x) as u32;
        if run > max {
            max = run;
        }
        runs.insert(x as u32, run);
        x = x2;

        while x < y {
            let t = data[x];
            if base_type(t) == 0 {
                break;
            }
            if x + 8 >= y {
                x = y;
            } else {
                let size2 = u16::from_be_bytes([data[x + 2], data[x + 3]]) as usize;
                if t == TYPE_DATA_CHUNKS {
                    match data[x + 1] {
                        2 => x += size2 * 10 + 18,
                        0 | 1 => x += size2 + 8,
                        _ => return None,
                    }
                } else if t == TYPE_DATA_CHUNKS | TYPE_STREAMED {
                    match data[x + 1] {
                        0 | 1 => x += size2 + 10,
                        _ => return None,
                    }
                } else {
                    x += size2 + 8;
                }
            }
        }
    }

    Some((runs, max))
}

impl Ifds {
    // ---- root/page management -------------------------------------------

    fn create_free_root(&mut self) -> Result<bool> {
        if self.free_map.is_none() {
            // Fixed array: 8-byte page position + 4-byte largest free run.
            let h = self.create_fixed_array_internal(12, None, false)?;
            self.arena.get_mut(h)?.manual = true;
            self.free_map = Some(FreeMapState {
                root: h,
                pages: Vec::new(),
                dirty: false,
            });
        }
        Ok(true)
    }

    pub(crate) fn load_free_root(&mut self, create: bool) -> Result<bool> {
        if self.free_map.is_some() {
            return Ok(true);
        }

        let (free_pos, hdr_size) = match self.header.as_ref() {
            Some(hdr) => (hdr.free_map_pos, hdr.size),
            None => return if create { self.create_free_root() } else { Ok(false) },
        };
        if free_pos < hdr_size {
            return if create { self.create_free_root() } else { Ok(false) };
        }

        let loaded = (|| -> Result<(ObjHandle, Vec<FreePage>)> {
            let h = self.get_object_by_position(free_pos, 4092)?;
            {
                let rec = self.arena.get(h)?;
                if rec.type_byte != TYPE_FIXED_ARRAY
                    || !matches!(rec.info, TypeInfo::FixedArray { entry_size: 12, .. })
                {
                    return Err(IfdsError::InvalidObject("free map root mismatch".into()));
                }
            }
            let want = ((self.max_pos() / SUPER_BLOCK) + 1) as usize * 12;
            let mut rec = self.arena.take(h)?;
            let result = (|| -> Result<DataRead> {
                self.seek_inner(&mut rec, 0)?;
                self.read_data_inner(&mut rec, Some(want), None)
            })();
            self.arena.put(h, rec);
            let read = result?;
            let data = read.data.unwrap_or_default();

            let mut pages = Vec::new();
            let y = data.len().min(want);
            let mut x = 0;
            while x + 11 < y {
                let pos = u64::from_be_bytes(data[x..x + 8].try_into().unwrap());
                let largest = u32::from_be_bytes(data[x + 8..x + 12].try_into().unwrap());
                pages.push(FreePage::Unloaded {
                    file_pos: pos,
                    largest,
                });
                x += 12;
            }
            Ok((h, pages))
        })();

        match loaded {
            Ok((h, pages)) => {
                self.arena.get_mut(h)?.manual = true;
                self.free_map = Some(FreeMapState {
                    root: h,
                    pages,
                    dirty: false,
                });
                self.strip_root_object_id(h)?;
                self.reset_root_streaming(h)?;
                Ok(true)
            }
            Err(_) => {
                // Unusable root: forget it and rebuild from scratch.
                warn!("Free map root unreadable; treating free map as absent");
                if let Some(hdr) = self.header.as_mut() {
                    hdr.free_map_pos = 0;
                }
                if create {
                    self.create_free_root()
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn create_free_page(&mut self, chunknum: usize) -> Result<()> {
        // Fixed array: 2-byte largest free run + 2-byte first free offset.
        let h = self.create_fixed_array_internal(4, None, false)?;
        self.arena.get_mut(h)?.manual = true;
        let fm = self.free_map.as_mut().unwrap();
        while fm.pages.len() <= chunknum {
            fm.pages.push(FreePage::Unloaded {
                file_pos: 0,
                largest: 0,
            });
        }
        fm.pages[chunknum] = FreePage::Loaded(FreePageLoaded {
            handle: h,
            blocks: Vec::new(),
            extracted: 0,
            dirty: false,
        });
        fm.dirty = true;
        Ok(())
    }

    pub(crate) fn load_free_page(&mut self, chunknum: usize) -> Result<()> {
        let fm = self.free_map.as_ref().unwrap();
        if chunknum >= fm.pages.len() {
            return self.create_free_page(chunknum);
        }
        let file_pos = match &fm.pages[chunknum] {
            FreePage::Loaded(_) => return Ok(()),
            FreePage::Unloaded { file_pos, .. } => *file_pos,
        };

        let loaded = (|| -> Result<(ObjHandle, Vec<BlockEntry>)> {
            let h = self.get_object_by_position(file_pos, 4092)?;
            {
                let rec = self.arena.get(h)?;
                if rec.type_byte != TYPE_FIXED_ARRAY
                    || !matches!(rec.info, TypeInfo::FixedArray { entry_size: 4, .. })
                {
                    return Err(IfdsError::InvalidObject("free space table mismatch".into()));
                }
            }
            let mut rec = self.arena.take(h)?;
            let result = (|| -> Result<DataRead> {
                self.seek_inner(&mut rec, 0)?;
                self.read_data_inner(&mut rec, Some(4 * 65536), None)
            })();
            self.arena.put(h, rec);
            let data = result?.data.unwrap_or_default();

            let mut blocks = Vec::new();
            let y = data.len().min(4 * 65536);
            let mut x = 0;
            while x + 3 < y {
                let mut size = u16::from_be_bytes([data[x], data[x + 1]]) as u32;
                let mut pos = u16::from_be_bytes([data[x + 2], data[x + 3]]) as u32;
                if pos == 0xFFFF {
                    if size == 0 {
                        pos = BLOCK as u32;
                    } else if size == 0xFFFF {
                        size = BLOCK as u32;
                        pos = 0;
                    }
                }
                if size + pos > BLOCK as u32 {
                    size = BLOCK as u32 - pos;
                }
                blocks.push(BlockEntry {
                    max_run: size,
                    min_off: pos,
                    detail: BlockDetail::Unloaded,
                });
                x += 4;
            }
            Ok((h, blocks))
        })();

        match loaded {
            Ok((h, blocks)) => {
                self.arena.get_mut(h)?.manual = true;
                let fm = self.free_map.as_mut().unwrap();
                fm.pages[chunknum] = FreePage::Loaded(FreePageLoaded {
                    handle: h,
                    blocks,
                    extracted: 0,
                    dirty: false,
                });
                self.strip_root_object_id(h)?;
                self.reset_root_streaming(h)?;
                Ok(())
            }
            Err(_) => self.create_free_page(chunknum),
        }
    }

    /// Root structures are never streamed; reset one that claims to be
    pub(crate) fn reset_root_streaming(&mut self, h: ObjHandle) -> Result<()> {
        let streaming = self.arena.get(h)?.data_method() == crate::structure::ENCODER_DATA_CHUNKS_STREAM;
        if streaming {
            self.truncate(h, 0)?;
        }
        Ok(())
    }

    // ---- block detail ----------------------------------------------------

    /// Ensure the run map of one block is loaded; `false` = treat as full
    fn ensure_block_detail(
        &mut self,
        chunknum: usize,
        blockpos: usize,
        blocknum: u64,
    ) -> Result<bool> {
        let (max_run, min_off, state) = {
            let fm = self.free_map.as_ref().unwrap();
            let FreePage::Loaded(page) = &fm.pages[chunknum] else {
                return Ok(false);
            };
            let entry = &page.blocks[blockpos];
            let state = match &entry.detail {
                BlockDetail::Runs(_) => 0u8,
                BlockDetail::Single => 1,
                BlockDetail::Unloaded => 2,
            };
            (entry.max_run, entry.min_off, state)
        };
        if state == 0 {
            return Ok(true);
        }

        let result: Option<(BTreeMap<u32, u32>, u32)> = if max_run == 0 {
            Some((BTreeMap::new(), 0))
        } else if state == 1 {
            let mut runs = BTreeMap::new();
            runs.insert(min_off, max_run);
            Some((runs, max_run))
        } else {
            match self.read_at(blocknum * BLOCK, BLOCK as usize)? {
                Some(data) => scan_block_runs(&data, min_off),
                None => None,
            }
        };

        let fm = self.free_map.as_mut().unwrap();
        let FreePage::Loaded(page) = &mut fm.pages[chunknum] else {
            return Ok(false);
        };
        let entry = &mut page.blocks[blockpos];
        match result {
            Some((runs, max)) => {
                let min = runs.keys().next().copied().unwrap_or(BLOCK as u32);
                if entry.max_run != max {
                    entry.max_run = max;
                    page.dirty = true;
                    fm.dirty = true;
                }
                if state == 2 {
                    entry.min_off = min;
                }
                entry.detail = BlockDetail::Runs(runs);
                page.extracted += 1;
                Ok(true)
            }
            None => {
                // Unreadable block: degrade to fully occupied.
                warn!(blocknum, "Free space block scan failed; treating block as full");
                entry.max_run = 0;
                entry.min_off = BLOCK as u32;
                entry.detail = BlockDetail::Runs(BTreeMap::new());
                page.extracted += 1;
                page.dirty = true;
                fm.dirty = true;
                Ok(false)
            }
        }
    }

    /// Collapse run maps once a page has been consulted too often
    fn maybe_collapse_page(&mut self, chunknum: usize) {
        let fm = self.free_map.as_mut().unwrap();
        let FreePage::Loaded(page) = &mut fm.pages[chunknum] else {
            return;
        };
        if page.extracted < EXTRACT_LIMIT {
            return;
        }
        for entry in page.blocks.iter_mut() {
            if let BlockDetail::Runs(runs) = &entry.detail {
                entry.detail = if runs.len() == 1 {
                    BlockDetail::Single
                } else {
                    BlockDetail::Unloaded
                };
                page.extracted = page.extracted.saturating_sub(1);
            }
        }
    }

    // ---- reservation -----------------------------------------------------

    /// Reserve `numbytes` contiguous bytes, preferring `pref` when given
    ///
    /// Returns the reserved position; end-of-file when no tracked run fits
    /// (appending is always legal).
    pub(crate) fn reserve_bytes(&mut self, numbytes: u64, pref: Option<u64>) -> Result<u64> {
        let max = self.max_pos();
        if self.header.is_none()
            || numbytes < 1
            || pref.map(|p| p >= max).unwrap_or(false)
            || !self.load_free_root(false)?
        {
            return Ok(max);
        }

        if let Some(p) = pref {
            if p > 0 && self.attempt_reservation(p, numbytes)? {
                trace!(pos = p, numbytes, "Reserved bytes at preferred position");
                return Ok(p);
            }
        }

        let mut pos = self.header.as_ref().unwrap().size;
        let mut last = None;
        loop {
            pos = self.find_next_free(pos, numbytes)?;
            if pos >= self.max_pos() {
                return Ok(self.max_pos());
            }
            if self.attempt_reservation(pos, numbytes)? {
                trace!(pos, numbytes, "Reserved bytes");
                return Ok(pos);
            }
            // The attempt refreshed block details; a repeat candidate means
            // the map cannot satisfy the request.
            if last == Some(pos) {
                return Ok(self.max_pos());
            }
            last = Some(pos);
        }
    }

    /// Two-phase exact reservation: verify the whole span, then commit
    ///
    /// The split avoids partial allocation on fragmented blocks.
    fn attempt_reservation(&mut self, pos: u64, numbytes: u64) -> Result<bool> {
        for commit in [false, true] {
            let mut pos = pos;
            let mut left = numbytes;
            while left > 0 {
                let chunknum = (pos / SUPER_BLOCK) as usize;
                self.load_free_page(chunknum)?;

                let blocknum = pos / BLOCK;
                let blockpos = ((pos % SUPER_BLOCK) / BLOCK) as usize;
                {
                    let fm = self.free_map.as_ref().unwrap();
                    let FreePage::Loaded(page) = &fm.pages[chunknum] else {
                        return Ok(false);
                    };
                    if page.blocks.len() <= blockpos {
                        return Ok(false);
                    }
                }

                let pos2 = (pos % BLOCK) as u32;
                let n2 = (BLOCK - pos2 as u64).min(left) as u32;

                if !self.ensure_block_detail(chunknum, blockpos, blocknum)? {
                    return Ok(false);
                }

                let fm = self.free_map.as_mut().unwrap();
                let FreePage::Loaded(page) = &mut fm.pages[chunknum] else {
                    return Ok(false);
                };
                let entry = &mut page.blocks[blockpos];
                let BlockDetail::Runs(runs) = &mut entry.detail else {
                    return Ok(false);
                };

                if !commit {
                    let covered = match runs.get(&pos2) {
                        Some(&len) => len >= n2,
                        None => runs
                            .range(..pos2)
                            .any(|(&p3, &s2)| p3 + s2 >= pos2 + n2),
                    };
                    if !covered {
                        return Ok(false);
                    }
                } else {
                    let pos4 = pos2 + n2;
                    let covering = runs
                        .range(..=pos2)
                        .filter(|(&p3, &s2)| p3 + s2 >= pos4)
                        .map(|(&p3, &s2)| (p3, s2))
                        .next();
                    let Some((p3, s2)) = covering else {
                        return Ok(false);
                    };
                    if p3 < pos2 {
                        runs.insert(p3, pos2 - p3);
                    } else {
                        runs.remove(&p3);
                    }
                    if p3 + s2 > pos4 {
                        runs.insert(pos4, p3 + s2 - pos4);
                    }

                    entry.max_run = runs.values().copied().max().unwrap_or(0);
                    entry.min_off = runs.keys().next().copied().unwrap_or(BLOCK as u32);
                    page.dirty = true;
                    fm.dirty = true;
                }

                pos += n2 as u64;
                left -= n2 as u64;
                self.maybe_collapse_page(chunknum);
            }
        }
        Ok(true)
    }

    /// First-fit scan for a run of `numbytes`, spanning blocks when needed
    fn find_next_free(&mut self, start: u64, numbytes: u64) -> Result<u64> {
        let mut pos = start;
        let mut chunknum = (pos / SUPER_BLOCK) as usize;

        loop {
            let y = self.free_map.as_ref().unwrap().pages.len();
            if chunknum >= y {
                return Ok(self.max_pos());
            }

            // Skip super-blocks whose summary cannot possibly fit.
            let needs_load = {
                let fm = self.free_map.as_ref().unwrap();
                match &fm.pages[chunknum] {
                    FreePage::Unloaded { largest, .. } => {
                        if chunknum + 1 < y && (*largest as u64) < numbytes {
                            None
                        } else {
                            Some(true)
                        }
                    }
                    FreePage::Loaded(_) => Some(false),
                }
            };
            match needs_load {
                None => {
                    chunknum += 1;
                    pos = chunknum as u64 * SUPER_BLOCK;
                    continue;
                }
                Some(true) => {
                    if self.load_free_page(chunknum).is_err() {
                        return Ok(self.max_pos());
                    }
                }
                Some(false) => {}
            }

            let base_pos = chunknum as u64 * SUPER_BLOCK;
            let y2 = {
                let fm = self.free_map.as_ref().unwrap();
                match &fm.pages[chunknum] {
                    FreePage::Loaded(page) => page.blocks.len(),
                    _ => 0,
                }
            };
            let mut blockpos = ((pos % SUPER_BLOCK) / BLOCK) as usize;

            while blockpos < y2 {
                let (min_pos, mut numbytes2, direct_hit) = {
                    let fm = self.free_map.as_ref().unwrap();
                    let FreePage::Loaded(page) = &fm.pages[chunknum] else {
                        break;
                    };
                    let entry = &page.blocks[blockpos];
                    match &entry.detail {
                        BlockDetail::Runs(runs) => {
                            let mut min_pos = 0u32;
                            let mut best = 0u32;
                            let mut hit = None;
                            for (&p3, &s2) in runs {
                                if s2 as u64 >= numbytes {
                                    hit = Some(base_pos + blockpos as u64 * BLOCK + p3 as u64);
                                    break;
                                }
                                if min_pos < p3 {
                                    min_pos = p3;
                                    best = s2;
                                }
                            }
                            (min_pos, best as u64, hit)
                        }
                        _ if entry.max_run as u64 >= numbytes => {
                            (entry.min_off, entry.max_run as u64, None)
                        }
                        _ => (entry.min_off, entry.max_run as u64, None),
                    }
                };
                if let Some(hit) = direct_hit {
                    return Ok(hit);
                }

                let pos2 = (pos % BLOCK) as u32;
                let pos_diff = if pos2 > min_pos {
                    0
                } else {
                    (min_pos - pos2) as u64
                };

                // Attempt to span free space across adjacent blocks.
                if numbytes2 < numbytes && numbytes2 > 0 && min_pos as u64 + numbytes2 >= BLOCK {
                    let fm = self.free_map.as_ref().unwrap();
                    let FreePage::Loaded(page) = &fm.pages[chunknum] else {
                        break;
                    };
                    let mut blockpos2 = blockpos + 1;
                    while blockpos2 < y2
                        && numbytes2 < numbytes
                        && page.blocks[blockpos2].min_off == 0
                    {
                        let entry2 = &page.blocks[blockpos2];
                        numbytes2 += match &entry2.detail {
                            BlockDetail::Runs(runs) => {
                                runs.get(&0).copied().unwrap_or(0) as u64
                            }
                            _ => entry2.max_run as u64,
                        };
                        if entry2.max_run < BLOCK as u32 {
                            break;
                        }
                        blockpos2 += 1;
                    }
                    blockpos = blockpos2 - 1;
                }

                if numbytes2 >= numbytes || pos + pos_diff + numbytes2 >= self.max_pos() {
                    return Ok(pos + pos_diff);
                }

                blockpos += 1;
                pos = base_pos + blockpos as u64 * BLOCK;
            }

            chunknum += 1;
            pos = chunknum as u64 * SUPER_BLOCK;
        }
    }

    // ---- freeing ---------------------------------------------------------

    /// Return a byte range to the free map, zero-filling it on disk
    pub(crate) fn free_bytes(&mut self, pos: u64, numbytes: u64) -> Result<()> {
        let max = self.max_pos();
        if pos > max {
            return Ok(());
        }
        let mut left = numbytes.min(max - pos);
        if left < 1 {
            return Ok(());
        }
        if let Some(hdr) = self.header.as_ref() {
            if pos < hdr.size {
                return Err(IfdsError::InvalidOperation(
                    "unable to free bytes contained in the file header".into(),
                ));
            }
        }
        if !self.load_free_root(true)? {
            return Err(IfdsError::Corrupted(
                "unable to load/create the free space chunks map".into(),
            ));
        }

        let mut pos = pos;
        while left > 0 {
            let chunknum = (pos / SUPER_BLOCK) as usize;
            self.load_free_page(chunknum)?;

            let blocknum = pos / BLOCK;
            let blockpos = ((pos % SUPER_BLOCK) / BLOCK) as usize;
            {
                let fm = self.free_map.as_mut().unwrap();
                let FreePage::Loaded(page) = &mut fm.pages[chunknum] else {
                    return Err(IfdsError::Corrupted("free space page not loaded".into()));
                };
                while page.blocks.len() <= blockpos {
                    page.blocks.push(BlockEntry::full());
                }
            }

            let pos2 = (pos % BLOCK) as u32;
            let n2 = (BLOCK - pos2 as u64).min(left) as u32;

            self.write_at(&vec![0u8; n2 as usize], pos)?;

            let detail_ok = self.ensure_block_detail(chunknum, blockpos, blocknum)?;

            let fm = self.free_map.as_mut().unwrap();
            let FreePage::Loaded(page) = &mut fm.pages[chunknum] else {
                unreachable!()
            };
            let entry = &mut page.blocks[blockpos];

            if !detail_ok || !matches!(entry.detail, BlockDetail::Runs(_)) {
                // Could not reconstruct the block; restart its tracking with
                // this run only.
                let mut runs = BTreeMap::new();
                runs.insert(pos2, n2);
                entry.max_run = n2;
                entry.min_off = pos2;
                entry.detail = BlockDetail::Runs(runs);
            } else if let BlockDetail::Runs(runs) = &mut entry.detail {
                // Merge with adjacent runs.
                let mut start = pos2;
                let mut size = n2;
                if let Some(after) = runs.remove(&(pos2 + n2)) {
                    size += after;
                }
                let before = runs
                    .iter()
                    .find(|(&p3, &s2)| p3 + s2 == pos2)
                    .map(|(&p3, _)| p3);
                if let Some(p3) = before {
                    let s2 = runs.remove(&p3).unwrap();
                    start = p3;
                    size += s2;
                }
                runs.insert(start, size);
                if entry.max_run < size {
                    entry.max_run = size;
                }
                if entry.min_off > start {
                    entry.min_off = start;
                }
            }

            page.dirty = true;
            fm.dirty = true;

            pos += n2 as u64;
            left -= n2 as u64;
            self.maybe_collapse_page(chunknum);
        }
        Ok(())
    }

    /// Sum of tracked free bytes (coarse maxima for unloaded pages)
    pub fn estimated_free_space(&mut self) -> u64 {
        if !matches!(self.load_free_root(false), Ok(true)) {
            return 0;
        }
        let fm = self.free_map.as_ref().unwrap();
        fm.pages
            .iter()
            .map(|p| match p {
                FreePage::Unloaded { largest, .. } => *largest as u64,
                FreePage::Loaded(page) => {
                    page.blocks.iter().map(|b| b.max_run as u64).sum()
                }
            })
            .sum()
    }

    // ---- persistence -----------------------------------------------------

    /// Serialize and write the free-space map (root and all loaded pages)
    pub fn write_free_space_map(&mut self) -> Result<()> {
        if self.free_map.is_none() {
            return Ok(());
        }

        // Root placeholder first so the root can relocate before its pages.
        {
            let (root, want) = {
                let fm = self.free_map.as_ref().unwrap();
                (fm.root, fm.pages.len() as u64 * 12)
            };
            let data_size = self.arena.get(root)?.data_size;
            if data_size < want {
                let mut rec = self.arena.take(root)?;
                let result = (|| -> Result<()> {
                    self.seek_inner(&mut rec, data_size)?;
                    self.write_data_inner(&mut rec, &vec![0u8; (want - data_size) as usize])?;
                    if let TypeInfo::FixedArray { entries, .. } = &mut rec.info {
                        *entries = (rec.data_size / 12) as u32;
                    }
                    self.write_object_inner(&mut rec, false)?;
                    rec.header_dirty = true;
                    Ok(())
                })();
                self.arena.put(root, rec);
                result?;
            }
        }

        // Unload every loaded page; serialization may allocate and re-load
        // pages, so sweep until a pass finds nothing loaded.
        loop {
            let loaded: Vec<usize> = {
                let fm = self.free_map.as_ref().unwrap();
                fm.pages
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| matches!(p, FreePage::Loaded(_)))
                    .map(|(i, _)| i)
                    .collect()
            };
            if loaded.is_empty() {
                break;
            }

            for idx in loaded {
                let (handle, page_dirty, blocks_snapshot) = {
                    let fm = self.free_map.as_ref().unwrap();
                    match &fm.pages[idx] {
                        FreePage::Loaded(page) => (
                            page.handle,
                            page.dirty,
                            page.blocks
                                .iter()
                                .map(|b| (b.max_run, b.min_off))
                                .collect::<Vec<_>>(),
                        ),
                        FreePage::Unloaded { .. } => continue,
                    }
                };

                if page_dirty {
                    let mut data = Vec::with_capacity(blocks_snapshot.len() * 4);
                    for &(max_run, min_off) in &blocks_snapshot {
                        if max_run as u64 == BLOCK {
                            data.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
                        } else if max_run == 0 {
                            data.extend_from_slice(&[0x00, 0x00, 0xFF, 0xFF]);
                        } else {
                            data.extend_from_slice(&(max_run as u16).to_be_bytes());
                            data.extend_from_slice(&(min_off as u16).to_be_bytes());
                        }
                    }

                    let mut rec = self.arena.take(handle)?;
                    let result = (|| -> Result<()> {
                        // Placeholder growth first so relocation happens
                        // before the final content write.
                        let y = data.len() as u64;
                        if rec.data_size < y {
                            let grow = (y - rec.data_size) as usize;
                            let end = rec.data_size;
                            self.seek_inner(&mut rec, end)?;
                            self.write_data_inner(&mut rec, &vec![0xFFu8; grow])?;
                            self.write_object_inner(&mut rec, false)?;
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

                {
                    let modified = self.arena.get(handle)?.is_modified();
                    if modified {
                        let mut rec = self.arena.take(handle)?;
                        if let TypeInfo::FixedArray { entries, .. } = &mut rec.info {
                            *entries = blocks_snapshot.len() as u32;
                        }
                        let result = self.write_object_inner(&mut rec, false);
                        self.arena.put(handle, rec);
                        result?;
                    }
                }

                // Largest run spanning block boundaries, a coarse estimate
                // for the unloaded summary.
                let mut best = 0u64;
                let mut curr = 0u64;
                for &(max_run, min_off) in &blocks_snapshot {
                    if min_off == 0 {
                        curr += max_run as u64;
                        if best < curr {
                            best = curr;
                        }
                        curr = 0;
                    } else if min_off as u64 + max_run as u64 == BLOCK {
                        curr = max_run as u64;
                    } else {
                        if best < max_run as u64 {
                            best = max_run as u64;
                        }
                        curr = 0;
                    }
                }

                let obj_pos = self.arena.get(handle)?.obj_pos;
                self.arena.release(handle)?;
                let fm = self.free_map.as_mut().unwrap();
                fm.pages[idx] = FreePage::Unloaded {
                    file_pos: obj_pos,
                    largest: best.min(u32::MAX as u64) as u32,
                };
            }
        }

        // Root free map object.
        let (root, dirty) = {
            let fm = self.free_map.as_ref().unwrap();
            (fm.root, fm.dirty)
        };
        let root_modified = self.arena.get(root)?.is_modified();
        if dirty || root_modified {
            let mut data = Vec::new();
            {
                let fm = self.free_map.as_ref().unwrap();
                for page in &fm.pages {
                    let (file_pos, largest) = match page {
                        FreePage::Unloaded { file_pos, largest } => (*file_pos, *largest),
                        // A page re-loaded mid-flush by a nested allocation
                        // keeps its current position.
                        FreePage::Loaded(page) => (
                            self.arena.get(page.handle).map(|r| r.obj_pos).unwrap_or(0),
                            page.blocks.iter().map(|b| b.max_run).max().unwrap_or(0),
                        ),
                    };
                    data.extend_from_slice(&file_pos.to_be_bytes());
                    data.extend_from_slice(&largest.to_be_bytes());
                }
            }

            // Cleared before the write: allocations made while writing the
            // root re-dirty the map for the next flush.
            self.free_map.as_mut().unwrap().dirty = false;

            let mut rec = self.arena.take(root)?;
            let result = (|| -> Result<()> {
                self.seek_inner(&mut rec, 0)?;
                self.write_data_inner(&mut rec, &data)?;
                if rec.data_pos < rec.data_size {
                    let pos = rec.data_pos;
                    self.truncate_inner(&mut rec, pos)?;
                }
                if let TypeInfo::FixedArray { entries, .. } = &mut rec.info {
                    *entries = (data.len() / 12) as u32;
                }
                self.write_object_inner(&mut rec, false)
            })();
            let obj_pos = rec.obj_pos;
            self.arena.put(root, rec);
            result?;

            if let Some(hdr) = self.header.as_mut() {
                if hdr.free_map_pos != obj_pos {
                    hdr.free_map_pos = obj_pos;
                    hdr.dirty = true;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::encode_chunk;

    #[test]
    fn scan_finds_runs_between_structures() {
        let mut block = vec![0u8; 100];
        block.extend_from_slice(&encode_chunk(true, &[7u8; 20]));
        block.extend_from_slice(&[0u8; 50]);
        let (runs, max) = scan_block_runs(&block, 0).unwrap();
        assert_eq!(runs.get(&0), Some(&100));
        assert_eq!(runs.get(&(100 + 28)), Some(&50));
        assert_eq!(max, 100);
    }

    #[test]
    fn scan_rejects_nonzero_start() {
        let block = vec![1u8; 64];
        assert!(scan_block_runs(&block, 0).is_none());
    }
}
