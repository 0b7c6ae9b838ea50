//! Incremental stream reader
//!
//! Parses a container from a byte stream that is not yet fully buffered:
//! initialize, append bytes as they arrive, and read structures one at a
//! time. The same structure codec drives the parse; when a structure is
//! incomplete the reader surfaces the codec's "need N more bytes" signal so
//! the caller knows how much to append before retrying.
//!
//! Processed prefixes are discarded from the buffer roughly every MiB to
//! bound memory.

use crate::engine::{Ifds, LoadedStructure};
use crate::error::Result;
use crate::object::ObjHandle;
use crate::storage::{MemoryStorage, Storage};

/// How much processed data may accumulate before the buffer is drained
const DRAIN_THRESHOLD: u64 = 1_048_576;

/// A structure surfaced by the stream reader
#[derive(Debug)]
pub enum StreamStructure {
    /// Run of deleted bytes
    Gap { len: usize },
    /// DATA chunk (seekable or interleaved)
    DataChunk {
        term: bool,
        streamed: bool,
        channel: Option<u16>,
        data: Vec<u8>,
        valid: bool,
    },
    /// DATA-locations table
    Locations { entry_count: usize },
    /// An object header, loaded into the reader's cache
    Object { handle: ObjHandle, valid: bool },
}

/// Incremental reader over a streamed container
pub struct StreamReader {
    engine: Ifds,
    pos: u64,
    buf: Vec<u8>,
    next_size: usize,
}

impl StreamReader {
    /// Create a reader; the magic string is sniffed when `None`
    pub fn new(magic: Option<&str>) -> Self {
        let mut engine = Ifds::new_empty(
            Box::new(MemoryStorage::new()),
            magic.map(|m| m.to_string()),
        );
        engine.open = true;
        StreamReader {
            engine,
            pos: 0,
            buf: Vec::new(),
            next_size: 8,
        }
    }

    /// Append newly received bytes
    ///
    /// The file header is decoded as soon as enough bytes exist; until then
    /// this returns `InsufficientData` and more appends are expected.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let end = self.engine.max_pos();
        self.engine.write_at(data, end)?;

        if self.engine.header.is_none() {
            self.engine.load_file_header()?;
            self.pos = self.engine.header.as_ref().unwrap().size;
        }
        Ok(())
    }

    /// Current parse position within the stream
    pub fn stream_pos(&self) -> u64 {
        self.pos
    }

    /// Read the next structure
    ///
    /// Returns `InsufficientData { needed }` when the stream does not yet
    /// hold a complete structure; append at least `needed` more bytes and
    /// retry.
    pub fn read_next(&mut self) -> Result<StreamStructure> {
        if self.engine.header.is_none() {
            return Err(crate::error::IfdsError::InsufficientData { needed: 6 });
        }
        let size = self.next_size;
        let outcome = self
            .engine
            .read_next_structure(&mut self.pos, &mut self.buf, size, false)
            .map_err(|e| match e {
                // EOF mid-structure means the stream simply has not arrived
                // yet; the caller appends more and retries.
                crate::error::IfdsError::ReadFailed(_) => {
                    crate::error::IfdsError::InsufficientData {
                        needed: size.max(8),
                    }
                }
                other => other,
            })?;
        self.next_size = outcome.next_size;

        // Bound memory by dropping the processed prefix.
        if self.pos - self.engine.storage.base_pos() > DRAIN_THRESHOLD {
            let keep = self.pos - self.buf.len() as u64;
            self.engine.storage.discard_before(keep);
        }

        Ok(match outcome.structure {
            LoadedStructure::Gap { len } => StreamStructure::Gap { len },
            LoadedStructure::DataChunk {
                term,
                streamed,
                channel,
                data,
                valid,
            } => StreamStructure::DataChunk {
                term,
                streamed,
                channel,
                data,
                valid,
            },
            LoadedStructure::Locations { entry_count, .. } => {
                StreamStructure::Locations { entry_count }
            }
            LoadedStructure::Object { handle, valid } => {
                StreamStructure::Object { handle, valid }
            }
        })
    }

    /// Inspect loaded objects through the underlying engine
    pub fn engine(&self) -> &Ifds {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Ifds {
        &mut self.engine
    }
}
