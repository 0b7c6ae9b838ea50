//! File header encode/decode
//!
//! The header is written once at offset 0 and rewritten in place whenever a
//! root map relocates. Layout:
//!
//! ```text
//! 0x80|len  magic  \r\n\x00\x1A\n  ifds_major(u8) ifds_minor(u8)
//! fmt_major(u16) fmt_minor(u16) fmt_build(u16)
//! ifds_features(u32) fmt_features(u32) base_date(i64 days)
//! name_map_pos(u64) id_map_pos(u64) free_map_pos(u64) crc32(u32)
//! ```
//!
//! All integers are big-endian. The CRC-32 covers every preceding byte; a
//! mismatch marks the header invalid without refusing the open.

use crate::error::{IfdsError, Result};

/// Default magic string for containers without an application override
pub const DEFAULT_MAGIC: &str = "IFDS";

/// Sentinel bytes terminating the magic string
pub const MAGIC_SENTINEL: &[u8; 5] = b"\r\n\x00\x1A\n";

/// Container format version implemented by this crate
pub const IFDS_MAJOR_VER: u8 = 1;
pub const IFDS_MINOR_VER: u8 = 0;

/// Object headers carry a 4-byte object ID after the size field
pub const FEATURE_NODE_IDS: u32 = 0x0001;

/// Object-ID map entries carry a 2-byte structure size
pub const FEATURE_OBJECT_ID_STRUCT_SIZE: u32 = 0x0002;

/// Object-ID map entries carry a 2-byte last-access day
pub const FEATURE_OBJECT_ID_LAST_ACCESS: u32 = 0x0004;

/// Default feature set for newly created containers
pub const DEFAULT_FEATURES: u32 = FEATURE_OBJECT_ID_STRUCT_SIZE;

/// Application format version recorded in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
}

impl AppVersion {
    pub fn new(major: u16, minor: u16, build: u16) -> Self {
        AppVersion {
            major,
            minor,
            build,
        }
    }
}

/// Decoded file header
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub dirty: bool,
    pub valid: bool,
    pub magic: String,
    pub ifds_major: u8,
    pub ifds_minor: u8,
    pub app_ver: AppVersion,
    pub ifds_features: u32,
    pub fmt_features: u32,
    /// Days since the Unix epoch at creation time
    pub base_date: i64,
    /// Days elapsed since `base_date` (0 if the clock ran backwards)
    pub date_diff: u16,
    pub name_map_pos: u64,
    pub id_map_pos: u64,
    pub free_map_pos: u64,
    /// Encoded size in bytes
    pub size: u64,
}

/// Current day number (days since the Unix epoch)
pub fn today() -> i64 {
    chrono::Utc::now().timestamp().div_euclid(86400)
}

fn day_diff(base_date: i64) -> u16 {
    let diff = today() - base_date;
    diff.clamp(0, u16::MAX as i64) as u16
}

impl FileHeader {
    /// Encoded size for a given magic string
    pub fn encoded_size(magic: &str) -> u64 {
        1 + magic.len() as u64 + 5 + 52
    }

    /// Build the header for a freshly created container
    pub fn new_for_create(
        magic: &str,
        app_ver: AppVersion,
        ifds_features: u32,
        fmt_features: u32,
    ) -> Self {
        FileHeader {
            dirty: true,
            valid: true,
            magic: magic.to_string(),
            ifds_major: IFDS_MAJOR_VER,
            ifds_minor: IFDS_MINOR_VER,
            app_ver,
            ifds_features,
            fmt_features,
            base_date: today(),
            date_diff: 0,
            name_map_pos: 0,
            id_map_pos: 0,
            free_map_pos: 0,
            size: Self::encoded_size(magic),
        }
    }

    /// Serialize the header, including its CRC-32
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.size as usize);
        data.push(0x80 | (self.magic.len() as u8 + 5));
        data.extend_from_slice(self.magic.as_bytes());
        data.extend_from_slice(MAGIC_SENTINEL);
        data.push(self.ifds_major);
        data.push(self.ifds_minor);
        data.extend_from_slice(&self.app_ver.major.to_be_bytes());
        data.extend_from_slice(&self.app_ver.minor.to_be_bytes());
        data.extend_from_slice(&self.app_ver.build.to_be_bytes());
        data.extend_from_slice(&self.ifds_features.to_be_bytes());
        data.extend_from_slice(&self.fmt_features.to_be_bytes());
        data.extend_from_slice(&(self.base_date as u64).to_be_bytes());
        data.extend_from_slice(&self.name_map_pos.to_be_bytes());
        data.extend_from_slice(&self.id_map_pos.to_be_bytes());
        data.extend_from_slice(&self.free_map_pos.to_be_bytes());
        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_be_bytes());
        data
    }

    /// Extract the magic string from header bytes when it is not known ahead
    /// of time
    ///
    /// Returns `InsufficientData` when `data` is too short to decide.
    pub fn sniff_magic(data: &[u8]) -> Result<String> {
        if data.len() < 6 {
            return Err(IfdsError::InsufficientData {
                needed: 6 - data.len(),
            });
        }
        let first = data[0];
        if first & 0x80 == 0 {
            return Err(IfdsError::InvalidSignature(
                "first byte is truncated".into(),
            ));
        }
        let len = (first & 0x7F) as usize;
        if len < 5 {
            return Err(IfdsError::InvalidSignature(
                "magic string length too short".into(),
            ));
        }
        if data.len() < 1 + len {
            return Err(IfdsError::InsufficientData {
                needed: 1 + len - data.len(),
            });
        }
        if &data[1 + len - 5..1 + len] != MAGIC_SENTINEL {
            return Err(IfdsError::InvalidSignature(
                "magic sentinel bytes missing".into(),
            ));
        }
        let magic = &data[1..1 + len - 5];
        String::from_utf8(magic.to_vec())
            .map_err(|_| IfdsError::InvalidSignature("magic string is not UTF-8".into()))
    }

    /// Decode a header for a known magic string
    ///
    /// CRC failure is soft: the header decodes with `valid = false`.
    pub fn decode(data: &[u8], magic: &str) -> Result<Self> {
        let y = magic.len() + 5;
        let size = 1 + y + 52;
        if data.len() < size {
            return Err(IfdsError::InsufficientData {
                needed: size - data.len(),
            });
        }
        let first = data[0];
        if first & 0x80 == 0 {
            return Err(IfdsError::InvalidSignature(
                "first byte is truncated".into(),
            ));
        }
        if (first & 0x7F) as usize != y {
            return Err(IfdsError::InvalidSignature(
                "magic string length mismatch".into(),
            ));
        }
        if &data[1..1 + magic.len()] != magic.as_bytes()
            || &data[1 + magic.len()..1 + y] != MAGIC_SENTINEL
        {
            return Err(IfdsError::InvalidSignature("magic string mismatch".into()));
        }

        let ifds_major = data[1 + y];
        let ifds_minor = data[1 + y + 1];
        if ifds_major != IFDS_MAJOR_VER {
            return Err(IfdsError::UnsupportedVersion(ifds_major));
        }

        let u16_at = |off: usize| u16::from_be_bytes([data[off], data[off + 1]]);
        let u32_at = |off: usize| {
            u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        };
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[off..off + 8]);
            u64::from_be_bytes(b)
        };

        let crc_ok =
            crc32fast::hash(&data[..size - 4]).to_be_bytes() == data[size - 4..size];
        let base_date = u64_at(1 + y + 16) as i64;

        Ok(FileHeader {
            dirty: false,
            valid: crc_ok,
            magic: magic.to_string(),
            ifds_major,
            ifds_minor,
            app_ver: AppVersion {
                major: u16_at(1 + y + 2),
                minor: u16_at(1 + y + 4),
                build: u16_at(1 + y + 6),
            },
            ifds_features: u32_at(1 + y + 8),
            fmt_features: u32_at(1 + y + 12),
            base_date,
            date_diff: day_diff(base_date),
            name_map_pos: u64_at(1 + y + 24),
            id_map_pos: u64_at(1 + y + 32),
            free_map_pos: u64_at(1 + y + 40),
            size: size as u64,
        })
    }

    pub fn has_feature(&self, flag: u32) -> bool {
        self.ifds_features & flag != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut hdr =
            FileHeader::new_for_create(DEFAULT_MAGIC, AppVersion::new(2, 1, 77), DEFAULT_FEATURES, 9);
        hdr.name_map_pos = 1000;
        hdr.id_map_pos = 2000;
        hdr.free_map_pos = 3000;

        let bytes = hdr.encode();
        assert_eq!(bytes.len() as u64, hdr.size);

        let decoded = FileHeader::decode(&bytes, DEFAULT_MAGIC).unwrap();
        assert!(decoded.valid);
        assert_eq!(decoded.app_ver, AppVersion::new(2, 1, 77));
        assert_eq!(decoded.ifds_features, DEFAULT_FEATURES);
        assert_eq!(decoded.fmt_features, 9);
        assert_eq!(decoded.name_map_pos, 1000);
        assert_eq!(decoded.id_map_pos, 2000);
        assert_eq!(decoded.free_map_pos, 3000);
        assert_eq!(decoded.base_date, hdr.base_date);
    }

    #[test]
    fn header_crc_soft_failure() {
        let hdr = FileHeader::new_for_create(DEFAULT_MAGIC, AppVersion::default(), 0, 0);
        let mut bytes = hdr.encode();
        let idx = bytes.len() - 10;
        bytes[idx] ^= 0xFF;

        let decoded = FileHeader::decode(&bytes, DEFAULT_MAGIC).unwrap();
        assert!(!decoded.valid);
    }

    #[test]
    fn sniff_magic_detects_custom_string() {
        let hdr = FileHeader::new_for_create("MYAPP", AppVersion::default(), 0, 0);
        let bytes = hdr.encode();
        assert_eq!(FileHeader::sniff_magic(&bytes).unwrap(), "MYAPP");
    }

    #[test]
    fn sniff_magic_reports_needed_bytes() {
        let hdr = FileHeader::new_for_create(DEFAULT_MAGIC, AppVersion::default(), 0, 0);
        let bytes = hdr.encode();
        match FileHeader::sniff_magic(&bytes[..3]) {
            Err(IfdsError::InsufficientData { needed }) => assert_eq!(needed, 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn wrong_magic_rejected() {
        let hdr = FileHeader::new_for_create(DEFAULT_MAGIC, AppVersion::default(), 0, 0);
        let bytes = hdr.encode();
        assert!(matches!(
            FileHeader::decode(&bytes, "OTHER"),
            Err(IfdsError::InvalidSignature(_))
        ));
    }
}
