//! Fixed array operations
//!
//! Homogeneous fixed-stride records over an object's data: append/get/set
//! translate to seek + read/write at `index * stride`. The entry count lives
//! in the object header and is kept in sync on every mutation.

use crate::engine::Ifds;
use crate::error::{IfdsError, Result};
use crate::object::{ObjHandle, TypeInfo};
use crate::structure::{ENCODER_DATA_CHUNKS_STREAM, TYPE_FIXED_ARRAY};

/// One fixed array entry read
#[derive(Debug, Clone)]
pub struct ArrayEntry {
    pub data: Vec<u8>,
    pub end: bool,
    pub channel: Option<u16>,
    pub valid: bool,
}

impl Ifds {
    fn check_fixed_array(&self, h: ObjHandle) -> Result<u32> {
        let rec = self.arena.get(h)?;
        if rec.base_type() != TYPE_FIXED_ARRAY {
            return Err(IfdsError::InvalidObject(
                "object is not a fixed array".into(),
            ));
        }
        match rec.info {
            TypeInfo::FixedArray { entry_size, .. } => Ok(entry_size),
            _ => Ok(0),
        }
    }

    pub fn num_fixed_array_entries(&self, h: ObjHandle) -> Result<u32> {
        Ok(match self.arena.get(h)?.info {
            TypeInfo::FixedArray { entries, .. } => entries,
            _ => 0,
        })
    }

    pub fn fixed_array_entry_size(&self, h: ObjHandle) -> Result<u32> {
        Ok(match self.arena.get(h)?.info {
            TypeInfo::FixedArray { entry_size, .. } => entry_size,
            _ => 0,
        })
    }

    /// Read the entry at the cursor, gathering across chunk boundaries
    pub fn next_fixed_array_entry(
        &mut self,
        h: ObjHandle,
        channel: Option<u16>,
    ) -> Result<ArrayEntry> {
        let entry_size = self.check_fixed_array(h)? as usize;

        let mut valid = true;
        let mut data = Vec::with_capacity(entry_size);
        let mut left = entry_size;
        loop {
            let read = self.read_data(h, Some(left), channel)?;
            if !read.valid {
                valid = false;
            }
            if let Some(piece) = &read.data {
                left -= piece.len().min(left);
                data.extend_from_slice(piece);
            }
            let done = read.end && !matches!(read.channel, Some(c) if c > 0);
            if left == 0 || done {
                return Ok(ArrayEntry {
                    data,
                    end: read.end,
                    channel: read.channel,
                    valid,
                });
            }
        }
    }

    /// Read entry `num`
    pub fn get_fixed_array_entry(
        &mut self,
        h: ObjHandle,
        num: u32,
        channel: Option<u16>,
    ) -> Result<ArrayEntry> {
        let entry_size = self.check_fixed_array(h)? as u64;
        self.seek(h, num as u64 * entry_size)?;
        self.next_fixed_array_entry(h, channel)
    }

    /// Overwrite entry `num`; the data must be exactly one stride long
    pub fn set_fixed_array_entry(&mut self, h: ObjHandle, num: u32, data: &[u8]) -> Result<()> {
        let entry_size = self.check_fixed_array(h)?;
        if data.len() != entry_size as usize {
            return Err(IfdsError::InvalidOperation(
                "supplied data is not the entry size".into(),
            ));
        }
        self.seek(h, num as u64 * entry_size as u64)?;
        self.write_data(h, data)?;
        self.refresh_entry_count(h)
    }

    /// Append one entry at the end of the array
    pub fn append_fixed_array_entry(
        &mut self,
        h: ObjHandle,
        data: &[u8],
        channel: Option<u16>,
    ) -> Result<()> {
        let entry_size = self.check_fixed_array(h)?;
        if data.len() != entry_size as usize {
            return Err(IfdsError::InvalidOperation(
                "supplied data is not the entry size".into(),
            ));
        }

        let (method, data_pos, data_size) = {
            let rec = self.arena.get(h)?;
            (rec.data_method(), rec.data_pos, rec.data_size)
        };
        if method != ENCODER_DATA_CHUNKS_STREAM && data_pos < data_size {
            self.seek(h, data_size)?;
        }

        match channel {
            Some(ch) => self.write_stream_data(h, ch, data, false)?,
            None => self.write_data(h, data)?,
        }
        self.refresh_entry_count(h)
    }

    fn refresh_entry_count(&mut self, h: ObjHandle) -> Result<()> {
        let rec = self.arena.get_mut(h)?;
        if let TypeInfo::FixedArray {
            entry_size,
            entries,
        } = &mut rec.info
        {
            if *entry_size > 0 {
                *entries = (rec.data_size / *entry_size as u64) as u32;
            }
        }
        rec.header_dirty = true;
        Ok(())
    }
}
