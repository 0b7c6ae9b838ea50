//! # IFDS - Incredibly Flexible Data Storage
//!
//! `ifds-rs` implements the IFDS binary container format: a general-purpose
//! object store inside a single file or byte stream.
//!
//! - **Typed objects** addressable by name or ID, with raw data, fixed
//!   array, and linked list base types plus key-value/key-ID map encoders
//! - **Three storage strategies** per object: inline payloads, seekable
//!   64KB chunks with a locations table, and append-only interleaved
//!   multi-channel streaming
//! - **Self-bootstrapping metadata**: the object-ID map and free-space map
//!   are themselves objects inside the container
//! - **Soft corruption handling**: every structure carries a CRC-32;
//!   mismatches mark the structure invalid without refusing the read
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ifds_rs::{AppVersion, FileStorage, Ifds, MapKey, MapValue, Result};
//! use std::collections::BTreeMap;
//!
//! # fn main() -> Result<()> {
//! // Create a container backed by a file.
//! let storage = FileStorage::create("data.ifds")?;
//! let mut store = Ifds::create(Box::new(storage), AppVersion::new(1, 0, 0))?;
//!
//! // Create a named key-value map object and write it.
//! let obj = store.create_key_value_map(Some("settings"))?;
//! let mut map = BTreeMap::new();
//! map.insert(MapKey::str("greeting"), MapValue::blob("hello"));
//! store.set_key_value_map(obj, &map)?;
//! store.write_object(obj)?;
//! store.flush_all()?;
//!
//! // Reopen and read it back by name.
//! let storage = FileStorage::open("data.ifds")?;
//! let mut store = Ifds::open(Box::new(storage), None)?;
//! let obj = store.get_object_by_name("settings")?;
//! let map = store.get_key_value_map(obj)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage backends
//!
//! The engine drives a [`Storage`] port and never touches files directly.
//! [`FileStorage`] wraps a regular file; [`MemoryStorage`] keeps everything
//! in a buffer, which also powers the incremental [`StreamReader`] for
//! containers arriving over a byte stream.

pub mod array;
pub mod engine;
pub mod error;
pub mod header;
pub mod list;
pub mod maps;
pub mod object;
pub mod optimize;
pub mod storage;
pub mod stream;
pub mod structure;

mod chunks;
mod freespace;
mod idmap;

pub use crate::array::ArrayEntry;
pub use crate::chunks::DataRead;
pub use crate::engine::Ifds;
pub use crate::error::{IfdsError, Result};
pub use crate::header::{
    AppVersion, FileHeader, DEFAULT_FEATURES, DEFAULT_MAGIC, FEATURE_NODE_IDS,
    FEATURE_OBJECT_ID_LAST_ACCESS, FEATURE_OBJECT_ID_STRUCT_SIZE,
};
pub use crate::list::{ListAttach, ListIter};
pub use crate::maps::{MapEntry, MapKey, MapValue};
pub use crate::object::{ObjHandle, ObjectId, TypeCodec, TypeInfo};
pub use crate::optimize::optimize;
pub use crate::storage::{FileStorage, MemoryStorage, Storage};
pub use crate::stream::{StreamReader, StreamStructure};
