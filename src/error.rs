//! Error types for container operations

use thiserror::Error;

/// Container operation result type
pub type Result<T> = std::result::Result<T, IfdsError>;

/// Container operation errors
///
/// `InsufficientData` is the only recoverable variant: it reports how many
/// more bytes the caller must supply before the same parse can succeed,
/// which drives the incremental stream-reader mode. CRC mismatches are not
/// errors at all; they mark the affected structure invalid and the read
/// continues.
#[derive(Error, Debug)]
pub enum IfdsError {
    /// Operation attempted before the container was opened/initialized
    #[error("Container is not open")]
    NotOpen,

    /// Create was called on storage that already holds data
    #[error("Storage already contains data")]
    AlreadyExists,

    /// The file signature (magic string or sentinel bytes) did not match
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// The container major version is not supported
    #[error("Unsupported container major version {0}")]
    UnsupportedVersion(u8),

    /// More bytes are required to parse the next structure (recoverable)
    #[error("Insufficient data, {needed} more byte(s) required")]
    InsufficientData { needed: usize },

    /// A non-DATA structure exceeded the 32767-byte payload limit
    #[error("Structure too large")]
    StructureTooLarge,

    /// A DATA chunk exceeded its payload limit
    #[error("DATA chunk too large")]
    DataChunkTooLarge,

    /// An object header grew past the encodable size
    #[error("Object too large")]
    ObjectTooLarge,

    /// The supplied object is the wrong type/shape for the operation
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// The object's encoder/data-method does not permit the operation
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Caller misuse not covered by a more specific variant
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The handle refers to an evicted or deleted cache slot
    #[error("Stale object handle")]
    StaleHandle,

    /// An object with this name already exists in the name map
    #[error("Name already exists: {0}")]
    NameExists(String),

    /// No object with this name exists in the name map
    #[error("Name not found: {0}")]
    NameNotFound(String),

    /// No object with this ID exists
    #[error("Object does not exist: {0}")]
    ObjectNotFound(i64),

    /// All 2^32-1 object IDs are assigned
    #[error("Object ID limit reached")]
    IdLimitReached,

    /// A write was attempted while an interleaved stream is in flight
    #[error("Streaming object data is being written")]
    WriteConflict,

    /// A delete verifier vetoed the deletion (e.g. attached list node)
    #[error("Object has not been detached")]
    NotDetached,

    /// Linked-list neighbor pointers disagree; traversal aborted
    #[error("Loop detected at linked list node {0}")]
    LoopDetected(u32),

    /// On-disk state that cannot be interpreted
    #[error("Data corruption: {0}")]
    Corrupted(String),

    /// The storage port returned less data than the structure requires
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// The storage port rejected a write
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// I/O error from the storage port
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
