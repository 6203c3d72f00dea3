use thiserror::Error;

use crate::file::{FileError, PageId};

use super::SlotId;

/// Result type for record operations
pub type RecordResult<T> = Result<T, RecordError>;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("End of file reached")]
    EndOfFile,

    #[error("Invalid relation header: {0}")]
    InvalidHeader(String),

    #[error("Record size mismatch: relation stores {expected} bytes, got {actual}")]
    RecordSizeMismatch { expected: usize, actual: usize },

    #[error("Record size {0} does not fit in a page")]
    RecordTooLarge(usize),

    #[error("Slot {slot_id} out of bounds on page {page_id}")]
    SlotOutOfBounds { page_id: PageId, slot_id: SlotId },

    #[error("Slot {slot_id} on page {page_id} is empty")]
    SlotEmpty { page_id: PageId, slot_id: SlotId },

    #[error("Scan is not positioned on a record")]
    ScanNotPositioned,
}
