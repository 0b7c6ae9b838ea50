//! Key-value and key-ID map codec
//!
//! A map is a flat encoded sequence of `(key, value)` pairs streamed through
//! the object's data. Keys are short integers (inline when 0..=0x7FFF,
//! otherwise width-prefixed signed big-endian) or length-prefixed strings
//! (high bit set on the length). Values are 4-byte object IDs (key-ID maps)
//! or length-prefixed blobs with a 15- or 31-bit length (key-value maps).
//!
//! Updates fully replace the sequence; there is no in-place edit.

use crate::engine::Ifds;
use crate::error::{IfdsError, Result};
use crate::object::ObjHandle;
use crate::structure::{ENCODER_KEY_ID_MAP, ENCODER_KEY_VALUE_MAP};
use std::collections::BTreeMap;

/// Default ceiling on a single decoded value (10MiB)
pub const DEFAULT_MAX_VALUE_SIZE: usize = 10_485_760;

/// A map key: short integer or byte string
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapKey {
    Int(i64),
    Str(Vec<u8>),
}

impl MapKey {
    pub fn str(s: &str) -> Self {
        MapKey::Str(s.as_bytes().to_vec())
    }
}

/// A map value: object ID, integer (stored as 8 bytes), or raw blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapValue {
    Id(u32),
    Int(i64),
    Blob(Vec<u8>),
}

impl MapValue {
    pub fn blob(s: &str) -> Self {
        MapValue::Blob(s.as_bytes().to_vec())
    }
}

/// One entry from the incremental reader
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub key: MapKey,
    /// `None` when the value exceeded the size ceiling and was skipped
    pub value: Option<MapValue>,
}

/// Append one encoded entry; `false` when the pair cannot be represented
pub(crate) fn encode_map_entry(
    out: &mut Vec<u8>,
    key: &MapKey,
    value: &MapValue,
    use_vals: bool,
    max_value_size: usize,
) -> bool {
    if let MapValue::Blob(b) = value {
        if b.len() > max_value_size {
            return false;
        }
    }

    match key {
        MapKey::Str(s) => {
            let len = s.len().min(0x7FFF);
            out.extend_from_slice(&((len as u16) | 0x8000).to_be_bytes());
            out.extend_from_slice(&s[..len]);
        }
        MapKey::Int(k) => {
            let k = *k;
            // 1/2/4/8 collide with the width markers and must be
            // width-prefixed like any other small integer.
            if k == 1 || k == 2 || k == 4 || k == 8 {
                out.extend_from_slice(&[0x00, 0x01, k as u8]);
            } else if (0..=0x7FFF).contains(&k) {
                out.extend_from_slice(&(k as u16).to_be_bytes());
            } else if (-128..=127).contains(&k) {
                out.extend_from_slice(&[0x00, 0x01]);
                out.push(k as i8 as u8);
            } else if (-32768..=32767).contains(&k) {
                out.extend_from_slice(&[0x00, 0x02]);
                out.extend_from_slice(&(k as i16).to_be_bytes());
            } else if (i32::MIN as i64..=i32::MAX as i64).contains(&k) {
                out.extend_from_slice(&[0x00, 0x04]);
                out.extend_from_slice(&(k as i32).to_be_bytes());
            } else {
                out.extend_from_slice(&[0x00, 0x08]);
                out.extend_from_slice(&k.to_be_bytes());
            }
        }
    }

    if use_vals {
        let bytes;
        let val: &[u8] = match value {
            MapValue::Int(v) => {
                bytes = v.to_be_bytes();
                &bytes
            }
            MapValue::Blob(b) => b,
            MapValue::Id(id) => {
                bytes = (*id as u64).to_be_bytes();
                &bytes
            }
        };
        if val.len() > 0x7FFF {
            out.extend_from_slice(&((val.len() as u32) | 0x8000_0000).to_be_bytes());
        } else {
            out.extend_from_slice(&(val.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(val);
    } else {
        let id = match value {
            MapValue::Id(id) => *id,
            MapValue::Int(v) => *v as u32,
            MapValue::Blob(_) => return false,
        };
        out.extend_from_slice(&id.to_be_bytes());
    }
    true
}

fn decode_int_key(bytes: &[u8]) -> i64 {
    match bytes.len() {
        1 => bytes[0] as i8 as i64,
        2 => i16::from_be_bytes(bytes.try_into().unwrap()) as i64,
        4 => i32::from_be_bytes(bytes.try_into().unwrap()) as i64,
        _ => i64::from_be_bytes(bytes.try_into().unwrap()),
    }
}

impl Ifds {
    fn map_encoder(&self, h: ObjHandle) -> Result<bool> {
        let enc = self.arena.get(h)?.encoder();
        match enc {
            ENCODER_KEY_VALUE_MAP => Ok(true),
            ENCODER_KEY_ID_MAP => Ok(false),
            _ => Err(IfdsError::InvalidObject(
                "object encoding is not a key-ID or key-value map".into(),
            )),
        }
    }

    /// Read the whole map; values above `max_value_size` are skipped
    ///
    /// Returns the decoded map and the number of skipped values.
    pub fn get_key_value_map_ext(
        &mut self,
        h: ObjHandle,
        max_value_size: usize,
        channel: Option<u16>,
    ) -> Result<(BTreeMap<MapKey, MapValue>, usize)> {
        let use_vals = self.map_encoder(h)?;
        self.seek(h, 0)?;

        let mut map = BTreeMap::new();
        let mut skipped = 0usize;
        let mut skip_bytes = 0usize;
        let mut data: Vec<u8> = Vec::new();
        let mut key: Option<MapKey> = None;

        loop {
            let want = if skip_bytes > 0 && skip_bytes < 65536 {
                skip_bytes
            } else {
                65536
            };
            let read = self.read_data(h, Some(want), channel)?;
            let chunk = read.data.unwrap_or_default();
            let done = read.end && !matches!(read.channel, Some(c) if c > 0);

            if skip_bytes > 0 {
                skip_bytes -= chunk.len().min(skip_bytes);
                if done {
                    break;
                }
                continue;
            }

            data.extend_from_slice(&chunk);

            let y = data.len();
            let mut x = 0usize;
            while x < y {
                match &key {
                    None => {
                        if x + 2 > y {
                            break;
                        }
                        let size = u16::from_be_bytes([data[x], data[x + 1]]) as usize;
                        if size & 0x8000 != 0 {
                            let len = size & 0x7FFF;
                            if x + 2 + len > y {
                                break;
                            }
                            key = Some(MapKey::Str(data[x + 2..x + 2 + len].to_vec()));
                            x += len;
                        } else if size == 1 || size == 2 || size == 4 || size == 8 {
                            if x + 2 + size > y {
                                break;
                            }
                            key = Some(MapKey::Int(decode_int_key(&data[x + 2..x + 2 + size])));
                            x += size;
                        } else {
                            key = Some(MapKey::Int(size as i64));
                        }
                        x += 2;
                    }
                    Some(_) => {
                        if use_vals {
                            if x + 2 > y {
                                break;
                            }
                            let size16 = u16::from_be_bytes([data[x], data[x + 1]]) as usize;
                            let (head, size) = if size16 & 0x8000 != 0 {
                                if x + 4 > y {
                                    break;
                                }
                                let lo =
                                    u16::from_be_bytes([data[x + 2], data[x + 3]]) as usize;
                                (4usize, ((size16 & 0x7FFF) << 16) | lo)
                            } else {
                                (2usize, size16)
                            };

                            if size > max_value_size {
                                skip_bytes = size - size.min(y - x - head);
                                skipped += 1;
                                x = (x + head + size).min(y);
                                if skip_bytes > 0 {
                                    key = None;
                                    break;
                                }
                            } else {
                                if x + head + size > y {
                                    break;
                                }
                                map.insert(
                                    key.take().unwrap(),
                                    MapValue::Blob(data[x + head..x + head + size].to_vec()),
                                );
                                x += head + size;
                            }
                            key = None;
                        } else {
                            if x + 4 > y {
                                break;
                            }
                            let id = u32::from_be_bytes(data[x..x + 4].try_into().unwrap());
                            map.insert(key.take().unwrap(), MapValue::Id(id));
                            x += 4;
                        }
                    }
                }
            }
            data.drain(..x.min(data.len()));

            if done {
                break;
            }
        }

        Ok((map, skipped))
    }

    /// Read the whole map with default limits
    pub fn get_key_value_map(&mut self, h: ObjHandle) -> Result<BTreeMap<MapKey, MapValue>> {
        Ok(self.get_key_value_map_ext(h, DEFAULT_MAX_VALUE_SIZE, None)?.0)
    }

    /// Replace the map contents with `map`
    pub fn set_key_value_map(
        &mut self,
        h: ObjHandle,
        map: &BTreeMap<MapKey, MapValue>,
    ) -> Result<()> {
        self.set_key_value_map_ext(h, map, DEFAULT_MAX_VALUE_SIZE)
    }

    pub fn set_key_value_map_ext(
        &mut self,
        h: ObjHandle,
        map: &BTreeMap<MapKey, MapValue>,
        max_value_size: usize,
    ) -> Result<()> {
        let use_vals = self.map_encoder(h)?;

        // Streaming objects reset to internal data first.
        if self.arena.get(h)?.data_method() == crate::structure::ENCODER_DATA_CHUNKS_STREAM {
            self.truncate(h, 0)?;
        } else {
            self.seek(h, 0)?;
        }

        let mut data = Vec::new();
        for (key, value) in map {
            if encode_map_entry(&mut data, key, value, use_vals, max_value_size)
                && data.len() >= 65536
            {
                self.write_data(h, &data)?;
                data.clear();
            }
        }
        if !data.is_empty() {
            self.write_data(h, &data)?;
        }

        let (pos, size) = {
            let rec = self.arena.get(h)?;
            (rec.data_pos, rec.data_size)
        };
        if pos < size {
            self.truncate(h, pos)?;
        }
        Ok(())
    }

    /// Read exactly `n` logical bytes, or less at end of data
    fn read_logical(&mut self, h: ObjHandle, n: usize, channel: Option<u16>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let read = self.read_data(h, Some(n - out.len()), channel)?;
            let chunk = read.data.unwrap_or_default();
            let got = chunk.len();
            out.extend_from_slice(&chunk);
            if read.end && !matches!(read.channel, Some(c) if c > 0) && got == 0 {
                break;
            }
            if got == 0 && !read.end {
                break;
            }
        }
        Ok(out)
    }

    /// Read the next `(key, value)` pair at the cursor
    ///
    /// Returns `None` when the data ends before a complete entry.
    pub fn next_key_value_entry(
        &mut self,
        h: ObjHandle,
        max_value_size: usize,
        channel: Option<u16>,
    ) -> Result<Option<MapEntry>> {
        let use_vals = self.map_encoder(h)?;

        let head = self.read_logical(h, 2, channel)?;
        if head.len() < 2 {
            return Ok(None);
        }
        let size = u16::from_be_bytes([head[0], head[1]]) as usize;

        let key = if size & 0x8000 != 0 {
            let len = size & 0x7FFF;
            let bytes = self.read_logical(h, len, channel)?;
            if bytes.len() < len {
                return Ok(None);
            }
            MapKey::Str(bytes)
        } else if size == 1 || size == 2 || size == 4 || size == 8 {
            let bytes = self.read_logical(h, size, channel)?;
            if bytes.len() < size {
                return Ok(None);
            }
            MapKey::Int(decode_int_key(&bytes))
        } else {
            MapKey::Int(size as i64)
        };

        if !use_vals {
            let bytes = self.read_logical(h, 4, channel)?;
            if bytes.len() < 4 {
                return Ok(None);
            }
            let id = u32::from_be_bytes(bytes.try_into().unwrap());
            return Ok(Some(MapEntry {
                key,
                value: Some(MapValue::Id(id)),
            }));
        }

        let head = self.read_logical(h, 2, channel)?;
        if head.len() < 2 {
            return Ok(None);
        }
        let size16 = u16::from_be_bytes([head[0], head[1]]) as usize;
        let size = if size16 & 0x8000 != 0 {
            let lo = self.read_logical(h, 2, channel)?;
            if lo.len() < 2 {
                return Ok(None);
            }
            ((size16 & 0x7FFF) << 16) | u16::from_be_bytes([lo[0], lo[1]]) as usize
        } else {
            size16
        };

        if size > max_value_size {
            // Skip the oversized value in bounded pieces.
            let mut left = size;
            while left > 0 {
                let got = self.read_logical(h, left.min(65536), channel)?;
                if got.is_empty() {
                    break;
                }
                left -= got.len();
            }
            return Ok(Some(MapEntry { key, value: None }));
        }

        let bytes = self.read_logical(h, size, channel)?;
        if bytes.len() < size {
            return Ok(None);
        }
        Ok(Some(MapEntry {
            key,
            value: Some(MapValue::Blob(bytes)),
        }))
    }

    // ---- engine-internal raw name map helpers ---------------------------

    pub(crate) fn get_key_id_map_raw(&mut self, h: ObjHandle) -> Result<BTreeMap<Vec<u8>, u32>> {
        let (map, _) = self.get_key_value_map_ext(h, DEFAULT_MAX_VALUE_SIZE, None)?;
        let mut out = BTreeMap::new();
        for (k, v) in map {
            if let (MapKey::Str(key), MapValue::Id(id)) = (k, v) {
                out.insert(key, id);
            }
        }
        Ok(out)
    }

    pub(crate) fn set_key_id_map_raw(
        &mut self,
        h: ObjHandle,
        entries: &BTreeMap<Vec<u8>, u32>,
    ) -> Result<()> {
        let map: BTreeMap<MapKey, MapValue> = entries
            .iter()
            .map(|(k, &v)| (MapKey::Str(k.clone()), MapValue::Id(v)))
            .collect();
        self.set_key_value_map(h, &map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_key_encoding() {
        let mut out = Vec::new();
        assert!(encode_map_entry(
            &mut out,
            &MapKey::str("abc"),
            &MapValue::blob("xy"),
            true,
            DEFAULT_MAX_VALUE_SIZE,
        ));
        assert_eq!(out, vec![0x80, 0x03, b'a', b'b', b'c', 0x00, 0x02, b'x', b'y']);
    }

    #[test]
    fn int_key_width_markers_are_escaped() {
        for k in [1i64, 2, 4, 8] {
            let mut out = Vec::new();
            assert!(encode_map_entry(
                &mut out,
                &MapKey::Int(k),
                &MapValue::Id(5),
                false,
                DEFAULT_MAX_VALUE_SIZE,
            ));
            assert_eq!(&out[..3], &[0x00, 0x01, k as u8]);
        }
    }

    #[test]
    fn small_int_key_is_inline() {
        let mut out = Vec::new();
        assert!(encode_map_entry(
            &mut out,
            &MapKey::Int(300),
            &MapValue::Id(9),
            false,
            DEFAULT_MAX_VALUE_SIZE,
        ));
        assert_eq!(&out[..2], &300u16.to_be_bytes());
        assert_eq!(&out[2..], &9u32.to_be_bytes());
    }

    #[test]
    fn negative_key_widths() {
        let mut out = Vec::new();
        encode_map_entry(&mut out, &MapKey::Int(-5), &MapValue::Id(1), false, usize::MAX);
        assert_eq!(&out[..3], &[0x00, 0x01, 0xFB]);

        out.clear();
        encode_map_entry(&mut out, &MapKey::Int(-40000), &MapValue::Id(1), false, usize::MAX);
        assert_eq!(&out[..2], &[0x00, 0x04]);

        out.clear();
        encode_map_entry(
            &mut out,
            &MapKey::Int(1i64 << 40),
            &MapValue::Id(1),
            false,
            usize::MAX,
        );
        assert_eq!(&out[..2], &[0x00, 0x08]);
    }

    #[test]
    fn long_value_gets_wide_length() {
        let mut out = Vec::new();
        let val = vec![7u8; 40000];
        encode_map_entry(
            &mut out,
            &MapKey::Int(0),
            &MapValue::Blob(val.clone()),
            true,
            usize::MAX,
        );
        assert_eq!(&out[..2], &0u16.to_be_bytes());
        let len = u32::from_be_bytes(out[2..6].try_into().unwrap());
        assert_eq!(len & 0x8000_0000, 0x8000_0000);
        assert_eq!((len & 0x7FFF_FFFF) as usize, val.len());
        assert_eq!(&out[6..], &val[..]);
    }
}
