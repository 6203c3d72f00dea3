pub mod file;
pub mod index;
pub mod record;

pub use file::{BufferManager, FileHandle, PagedFileManager, BUFFER_POOL_SIZE, PAGE_SIZE};
