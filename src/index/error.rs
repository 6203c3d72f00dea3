use thiserror::Error;

use crate::file::FileError;
use crate::record::RecordError;

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors that can occur during index operations
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Invalid scan operator: low must be GT/GTE, high must be LT/LTE")]
    BadOperator,

    #[error("Invalid scan range: low value exceeds high value")]
    BadScanRange,

    #[error("Scan not initialized")]
    ScanNotInitialized,

    #[error("Scan completed")]
    ScanCompleted,

    #[error("Unsupported attribute type: only integer keys are indexed")]
    UnsupportedAttrType,

    #[error("Key at byte offset {offset} lies outside the {record_len}-byte record")]
    KeyOutOfRecord { offset: usize, record_len: usize },

    #[error("Invalid magic number in index meta page")]
    InvalidMagic,

    #[error("Invalid node marker: {0}")]
    InvalidNodeMarker(i32),

    #[error("Corrupted index meta page: {0}")]
    CorruptedMeta(String),
}
