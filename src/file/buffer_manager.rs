use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;

use super::error::{FileError, FileResult};
use super::file_manager::{FileHandle, PagedFileManager};
use super::{BUFFER_POOL_SIZE, PAGE_SIZE, PageId};

/// A key identifying a page in the buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BufferKey {
    file: FileHandle,
    page_id: PageId,
}

/// Frame in the buffer pool
struct BufferEntry {
    data: Vec<u8>,
    /// Whether this frame must be written back before it is dropped
    dirty: bool,
    /// Number of outstanding pins; a pinned frame is never evicted
    pin_count: u32,
}

/// Buffer pool with LRU eviction and explicit page pinning.
///
/// Every `read_page`/`alloc_page` takes a pin that the caller must release
/// with `unpin_page`, passing `dirty = true` iff the frame was modified while
/// pinned. While a frame is pinned its bytes stay resident and can be
/// revisited through `page`/`page_mut` without taking another pin.
pub struct BufferManager {
    file_manager: PagedFileManager,
    /// Combined frame store and recency tracker; one hash lookup per access
    buffer_pool: LruCache<BufferKey, BufferEntry>,
    max_pool_size: usize,
    /// Reusable buffer for loading pages (avoids allocation on every load)
    load_buffer: Vec<u8>,
    /// Next page id to hand out per file, seeded from the on-disk page count
    next_page_id: HashMap<FileHandle, PageId>,
}

impl BufferManager {
    pub fn new(file_manager: PagedFileManager) -> Self {
        Self::with_capacity(file_manager, BUFFER_POOL_SIZE)
    }

    pub fn with_capacity(file_manager: PagedFileManager, capacity: usize) -> Self {
        Self {
            file_manager,
            buffer_pool: LruCache::new(NonZeroUsize::new(capacity).unwrap()),
            max_pool_size: capacity,
            load_buffer: vec![0u8; PAGE_SIZE],
            next_page_id: HashMap::new(),
        }
    }

    pub fn file_manager(&self) -> &PagedFileManager {
        &self.file_manager
    }

    pub fn file_manager_mut(&mut self) -> &mut PagedFileManager {
        &mut self.file_manager
    }

    /// Allocate the next page of `file`, pinned and zero-filled.
    ///
    /// Page ids are dense starting at 0; the counter is seeded from the
    /// on-disk page count the first time a file allocates.
    pub fn alloc_page(&mut self, file: FileHandle) -> FileResult<(PageId, &mut [u8])> {
        let page_id = match self.next_page_id.get(&file) {
            Some(&next) => next,
            None => self.file_manager.page_count(file)?,
        };

        self.make_room()?;

        let mut data = std::mem::take(&mut self.load_buffer);
        if data.len() == PAGE_SIZE {
            data.fill(0);
        } else {
            data = vec![0u8; PAGE_SIZE];
        }

        let key = BufferKey { file, page_id };
        self.buffer_pool.put(
            key,
            BufferEntry {
                data,
                dirty: false,
                pin_count: 1,
            },
        );
        self.next_page_id.insert(file, page_id + 1);

        Ok((page_id, &mut self.buffer_pool.get_mut(&key).unwrap().data))
    }

    /// Pin a page, loading it from disk if necessary
    pub fn read_page(&mut self, file: FileHandle, page_id: PageId) -> FileResult<&[u8]> {
        let key = BufferKey { file, page_id };

        if self.buffer_pool.peek(&key).is_none() {
            self.load_page(file, page_id)?;
        }

        let entry = self.buffer_pool.get_mut(&key).unwrap();
        entry.pin_count += 1;
        Ok(&entry.data)
    }

    /// Revisit a pinned page without taking another pin
    pub fn page(&self, file: FileHandle, page_id: PageId) -> FileResult<&[u8]> {
        let key = BufferKey { file, page_id };
        match self.buffer_pool.peek(&key) {
            Some(entry) if entry.pin_count > 0 => Ok(&entry.data),
            _ => Err(FileError::PageNotPinned(page_id)),
        }
    }

    /// Mutable access to a pinned page; the caller records the modification
    /// by unpinning dirty
    pub fn page_mut(&mut self, file: FileHandle, page_id: PageId) -> FileResult<&mut [u8]> {
        let key = BufferKey { file, page_id };
        match self.buffer_pool.peek_mut(&key) {
            Some(entry) if entry.pin_count > 0 => Ok(&mut entry.data),
            _ => Err(FileError::PageNotPinned(page_id)),
        }
    }

    /// Release one pin; `dirty` marks the frame for write-back
    pub fn unpin_page(&mut self, file: FileHandle, page_id: PageId, dirty: bool) -> FileResult<()> {
        let key = BufferKey { file, page_id };

        match self.buffer_pool.peek_mut(&key) {
            Some(entry) if entry.pin_count > 0 => {
                entry.pin_count -= 1;
                entry.dirty |= dirty;
                Ok(())
            }
            _ => Err(FileError::PageNotPinned(page_id)),
        }
    }

    /// Write back and drop every frame of `file`, then sync it.
    ///
    /// Fails with `PagePinned` if any frame of the file still holds a pin.
    pub fn flush_file(&mut self, file: FileHandle) -> FileResult<()> {
        let mut keys = Vec::new();
        for (key, entry) in self.buffer_pool.iter() {
            if key.file == file {
                if entry.pin_count > 0 {
                    return Err(FileError::PagePinned(key.page_id));
                }
                keys.push(*key);
            }
        }

        for key in keys {
            if let Some(entry) = self.buffer_pool.pop(&key) {
                if entry.dirty {
                    self.file_manager.write_page(key.file, key.page_id, &entry.data)?;
                }
                // Recycle the evicted buffer for future page loads
                self.load_buffer = entry.data;
            }
        }

        self.file_manager.sync_file(file)?;
        Ok(())
    }

    /// Write back all dirty frames regardless of pins; frames stay resident
    pub fn flush_all(&mut self) -> FileResult<()> {
        let mut dirty_pages = Vec::new();
        for (key, entry) in self.buffer_pool.iter() {
            if entry.dirty {
                dirty_pages.push(*key);
            }
        }

        for key in dirty_pages {
            // peek_mut so flushing does not disturb recency order
            if let Some(entry) = self.buffer_pool.peek_mut(&key)
                && entry.dirty
            {
                self.file_manager
                    .write_page(key.file, key.page_id, &entry.data)?;
                entry.dirty = false;
            }
        }

        self.file_manager.sync_all()?;
        Ok(())
    }

    /// Load a page from disk into an unpinned frame
    fn load_page(&mut self, file: FileHandle, page_id: PageId) -> FileResult<()> {
        self.make_room()?;

        if self.load_buffer.len() != PAGE_SIZE {
            self.load_buffer = vec![0u8; PAGE_SIZE];
        }

        self.file_manager
            .read_page(file, page_id, &mut self.load_buffer)?;

        let data = std::mem::take(&mut self.load_buffer);
        self.buffer_pool.put(
            BufferKey { file, page_id },
            BufferEntry {
                data,
                dirty: false,
                pin_count: 0,
            },
        );

        Ok(())
    }

    fn make_room(&mut self) -> FileResult<()> {
        while self.buffer_pool.len() >= self.max_pool_size {
            self.evict_lru_unpinned()?;
        }
        Ok(())
    }

    /// Evict the least-recently-used unpinned frame
    fn evict_lru_unpinned(&mut self) -> FileResult<()> {
        let victim = self
            .buffer_pool
            .iter()
            .rev()
            .find(|(_, entry)| entry.pin_count == 0)
            .map(|(key, _)| *key)
            .ok_or(FileError::BufferPoolFull)?;

        if let Some(entry) = self.buffer_pool.pop(&victim) {
            if entry.dirty {
                self.file_manager
                    .write_page(victim.file, victim.page_id, &entry.data)?;
            }
            self.load_buffer = entry.data;
        }

        Ok(())
    }

    /// Outstanding pins on a frame (0 if not resident)
    pub fn pin_count(&self, file: FileHandle, page_id: PageId) -> u32 {
        let key = BufferKey { file, page_id };
        self.buffer_pool
            .peek(&key)
            .map(|entry| entry.pin_count)
            .unwrap_or(0)
    }

    pub fn buffer_pool_size(&self) -> usize {
        self.buffer_pool.len()
    }

    pub fn is_page_cached(&self, file: FileHandle, page_id: PageId) -> bool {
        let key = BufferKey { file, page_id };
        self.buffer_pool.contains(&key)
    }

    pub fn dirty_page_count(&self) -> usize {
        self.buffer_pool.iter().filter(|(_, e)| e.dirty).count()
    }

    /// Total pins held across the pool
    pub fn pinned_page_count(&self) -> usize {
        self.buffer_pool
            .iter()
            .filter(|(_, e)| e.pin_count > 0)
            .count()
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        let _ = self.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_env() -> (TempDir, BufferManager, FileHandle) {
        let temp_dir = TempDir::new().unwrap();
        let test_file = temp_dir.path().join("test.db");

        let mut file_manager = PagedFileManager::new();
        let handle = file_manager.create_file(&test_file).unwrap();

        (temp_dir, BufferManager::new(file_manager), handle)
    }

    #[test]
    fn test_alloc_page_ids_are_dense() {
        let (_temp_dir, mut bm, handle) = setup_test_env();

        let (p0, _) = bm.alloc_page(handle).unwrap();
        let (p1, _) = bm.alloc_page(handle).unwrap();
        let (p2, _) = bm.alloc_page(handle).unwrap();
        assert_eq!((p0, p1, p2), (0, 1, 2));

        for pid in [p0, p1, p2] {
            assert_eq!(bm.pin_count(handle, pid), 1);
            bm.unpin_page(handle, pid, true).unwrap();
        }
    }

    #[test]
    fn test_alloc_counter_seeded_from_disk() {
        let temp_dir = TempDir::new().unwrap();
        let test_file = temp_dir.path().join("test.db");

        let mut file_manager = PagedFileManager::new();
        let handle = file_manager.create_file(&test_file).unwrap();
        let buffer = vec![0u8; PAGE_SIZE];
        file_manager.write_page(handle, 4, &buffer).unwrap();

        let mut bm = BufferManager::new(file_manager);
        let (pid, _) = bm.alloc_page(handle).unwrap();
        assert_eq!(pid, 5);
        bm.unpin_page(handle, pid, false).unwrap();
    }

    #[test]
    fn test_read_page_pins() {
        let (_temp_dir, mut bm, handle) = setup_test_env();

        let (pid, page) = bm.alloc_page(handle).unwrap();
        page[0] = 42;
        bm.unpin_page(handle, pid, true).unwrap();
        assert_eq!(bm.pin_count(handle, pid), 0);

        let page = bm.read_page(handle, pid).unwrap();
        assert_eq!(page[0], 42);
        assert_eq!(bm.pin_count(handle, pid), 1);

        // A second read takes a second pin
        bm.read_page(handle, pid).unwrap();
        assert_eq!(bm.pin_count(handle, pid), 2);

        bm.unpin_page(handle, pid, false).unwrap();
        bm.unpin_page(handle, pid, false).unwrap();
        assert!(matches!(
            bm.unpin_page(handle, pid, false),
            Err(FileError::PageNotPinned(_))
        ));
    }

    #[test]
    fn test_page_access_requires_pin() {
        let (_temp_dir, mut bm, handle) = setup_test_env();

        let (pid, _) = bm.alloc_page(handle).unwrap();
        assert!(bm.page(handle, pid).is_ok());

        bm.unpin_page(handle, pid, false).unwrap();
        assert!(matches!(
            bm.page(handle, pid),
            Err(FileError::PageNotPinned(_))
        ));
        assert!(matches!(
            bm.page_mut(handle, pid),
            Err(FileError::PageNotPinned(_))
        ));
    }

    #[test]
    fn test_dirty_unpin_survives_eviction() {
        let temp_dir = TempDir::new().unwrap();
        let mut file_manager = PagedFileManager::new();
        let handle = file_manager.create_file(temp_dir.path().join("t.db")).unwrap();
        let mut bm = BufferManager::with_capacity(file_manager, 2);

        let (pid, page) = bm.alloc_page(handle).unwrap();
        page[0] = 77;
        bm.unpin_page(handle, pid, true).unwrap();

        // Force the dirty frame out of the pool
        for _ in 0..2 {
            let (p, _) = bm.alloc_page(handle).unwrap();
            bm.unpin_page(handle, p, false).unwrap();
        }
        assert!(!bm.is_page_cached(handle, pid));

        let page = bm.read_page(handle, pid).unwrap();
        assert_eq!(page[0], 77);
        bm.unpin_page(handle, pid, false).unwrap();
    }

    #[test]
    fn test_eviction_skips_pinned_frames() {
        let temp_dir = TempDir::new().unwrap();
        let mut file_manager = PagedFileManager::new();
        let handle = file_manager.create_file(temp_dir.path().join("t.db")).unwrap();
        let mut bm = BufferManager::with_capacity(file_manager, 2);

        let (p0, _) = bm.alloc_page(handle).unwrap(); // stays pinned
        let (p1, _) = bm.alloc_page(handle).unwrap();
        bm.unpin_page(handle, p1, false).unwrap();

        // Needs a frame: must evict p1, not the pinned p0
        let (p2, _) = bm.alloc_page(handle).unwrap();
        assert!(bm.is_page_cached(handle, p0));
        assert!(!bm.is_page_cached(handle, p1));

        // Both remaining frames pinned: the pool is saturated
        assert!(matches!(bm.read_page(handle, p1), Err(FileError::BufferPoolFull)));

        bm.unpin_page(handle, p0, false).unwrap();
        bm.unpin_page(handle, p2, false).unwrap();
    }

    #[test]
    fn test_flush_file_refuses_pinned() {
        let (_temp_dir, mut bm, handle) = setup_test_env();

        let (pid, _) = bm.alloc_page(handle).unwrap();
        assert!(matches!(
            bm.flush_file(handle),
            Err(FileError::PagePinned(_))
        ));

        bm.unpin_page(handle, pid, true).unwrap();
        bm.flush_file(handle).unwrap();
        assert_eq!(bm.buffer_pool_size(), 0);
    }

    #[test]
    fn test_flush_file_persists() {
        let temp_dir = TempDir::new().unwrap();
        let test_file = temp_dir.path().join("test.db");

        let mut file_manager = PagedFileManager::new();
        let handle = file_manager.create_file(&test_file).unwrap();
        let mut bm = BufferManager::new(file_manager);

        let (pid, page) = bm.alloc_page(handle).unwrap();
        page[100] = 55;
        bm.unpin_page(handle, pid, true).unwrap();
        bm.flush_file(handle).unwrap();

        // Reload through a fresh manager
        let mut file_manager = PagedFileManager::new();
        let handle = file_manager.open_file(&test_file).unwrap();
        let mut bm = BufferManager::new(file_manager);
        let page = bm.read_page(handle, pid).unwrap();
        assert_eq!(page[100], 55);
        bm.unpin_page(handle, pid, false).unwrap();
    }

    #[test]
    fn test_multiple_files() {
        let temp_dir = TempDir::new().unwrap();
        let mut file_manager = PagedFileManager::new();
        let handle1 = file_manager.create_file(temp_dir.path().join("a.db")).unwrap();
        let handle2 = file_manager.create_file(temp_dir.path().join("b.db")).unwrap();
        let mut bm = BufferManager::new(file_manager);

        let (p1, page1) = bm.alloc_page(handle1).unwrap();
        page1[0] = 11;
        let (p2, page2) = bm.alloc_page(handle2).unwrap();
        page2[0] = 22;
        bm.unpin_page(handle1, p1, true).unwrap();
        bm.unpin_page(handle2, p2, true).unwrap();

        assert_eq!(bm.read_page(handle1, p1).unwrap()[0], 11);
        assert_eq!(bm.read_page(handle2, p2).unwrap()[0], 22);
        bm.unpin_page(handle1, p1, false).unwrap();
        bm.unpin_page(handle2, p2, false).unwrap();
    }
}
