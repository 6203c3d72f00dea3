use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::file::{BufferManager, FileHandle, PageId};

use super::error::{RecordError, RecordResult};
use super::heap_page::HeapPage;
use super::{RecordId, SlotId};

/// Magic number for relation files: "HEAP" in ASCII
const RELATION_MAGIC: u32 = 0x48454150;

/// Page 0 of a relation file holds the header; data pages start here
const FIRST_DATA_PAGE: PageId = 1;

/// A heap file of fixed-format records.
///
/// Page 0 carries the relation header (magic + record size); data pages are
/// chained through their next-page links starting at page 1. Records are raw
/// byte strings of the relation's fixed record size.
pub struct RelationFile {
    file_handle: FileHandle,
    record_size: usize,
    /// Insertion hint so sequential loads skip already-full pages
    last_insert_page: PageId,
}

impl RelationFile {
    /// Create a fresh relation file with one empty data page
    pub fn create<P: AsRef<Path>>(
        buffer_mgr: &mut BufferManager,
        path: P,
        record_size: usize,
    ) -> RecordResult<Self> {
        if HeapPage::max_slot_count(record_size) == 0 {
            return Err(RecordError::RecordTooLarge(record_size));
        }

        let file_handle = buffer_mgr.file_manager_mut().create_file(path)?;

        let (header_page_id, header) = buffer_mgr.alloc_page(file_handle)?;
        header[0..4].copy_from_slice(&RELATION_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&(record_size as u32).to_le_bytes());
        buffer_mgr.unpin_page(file_handle, header_page_id, true)?;

        let (data_page_id, frame) = buffer_mgr.alloc_page(file_handle)?;
        HeapPage::init(data_page_id, frame, record_size)?;
        buffer_mgr.unpin_page(file_handle, data_page_id, true)?;

        Ok(Self {
            file_handle,
            record_size,
            last_insert_page: FIRST_DATA_PAGE,
        })
    }

    /// Open an existing relation file, recovering the record size from its
    /// header page
    pub fn open<P: AsRef<Path>>(buffer_mgr: &mut BufferManager, path: P) -> RecordResult<Self> {
        let file_handle = buffer_mgr.file_manager_mut().open_file(path)?;

        let header = buffer_mgr.read_page(file_handle, 0)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let record_size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        buffer_mgr.unpin_page(file_handle, 0, false)?;

        if magic != RELATION_MAGIC {
            return Err(RecordError::InvalidHeader(
                "bad magic number in relation header".to_string(),
            ));
        }
        if HeapPage::max_slot_count(record_size) == 0 {
            return Err(RecordError::InvalidHeader(format!(
                "unusable record size {} in relation header",
                record_size
            )));
        }

        Ok(Self {
            file_handle,
            record_size,
            last_insert_page: FIRST_DATA_PAGE,
        })
    }

    pub fn file_handle(&self) -> FileHandle {
        self.file_handle
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Insert a record, appending a data page to the chain when every page
    /// from the insertion hint onward is full
    pub fn insert_record(
        &mut self,
        buffer_mgr: &mut BufferManager,
        record: &[u8],
    ) -> RecordResult<RecordId> {
        if record.len() != self.record_size {
            return Err(RecordError::RecordSizeMismatch {
                expected: self.record_size,
                actual: record.len(),
            });
        }

        let mut page_id = self.last_insert_page;
        loop {
            buffer_mgr.read_page(self.file_handle, page_id)?;
            let frame = buffer_mgr.page_mut(self.file_handle, page_id)?;
            let mut page = HeapPage::open(page_id, frame)?;

            if let Some(slot_id) = page.find_free_slot() {
                page.put_record(slot_id, record)?;
                buffer_mgr.unpin_page(self.file_handle, page_id, true)?;
                self.last_insert_page = page_id;
                return Ok(RecordId::new(page_id, slot_id));
            }

            let next_page = page.next_page();
            if next_page != 0 {
                buffer_mgr.unpin_page(self.file_handle, page_id, false)?;
                page_id = next_page;
                continue;
            }

            // Chain exhausted: append a fresh data page and link it in
            let (new_page_id, new_frame) = buffer_mgr.alloc_page(self.file_handle)?;
            HeapPage::init(new_page_id, new_frame, self.record_size)?;
            buffer_mgr.unpin_page(self.file_handle, new_page_id, true)?;

            let frame = buffer_mgr.page_mut(self.file_handle, page_id)?;
            HeapPage::open(page_id, frame)?.set_next_page(new_page_id);
            buffer_mgr.unpin_page(self.file_handle, page_id, true)?;

            page_id = new_page_id;
        }
    }

    /// Materialize every record of the relation in storage order
    pub fn scan(&self, buffer_mgr: &mut BufferManager) -> RecordResult<Vec<(RecordId, Vec<u8>)>> {
        let mut results = Vec::new();
        let mut page_id = FIRST_DATA_PAGE;

        loop {
            buffer_mgr.read_page(self.file_handle, page_id)?;
            let frame = buffer_mgr.page_mut(self.file_handle, page_id)?;
            let page = HeapPage::open(page_id, frame)?;

            for slot_id in 0..page.slot_count() {
                if page.is_slot_used(slot_id) {
                    results.push((RecordId::new(page_id, slot_id), page.record(slot_id)?.to_vec()));
                }
            }

            let next_page = page.next_page();
            buffer_mgr.unpin_page(self.file_handle, page_id, false)?;
            if next_page == 0 {
                break;
            }
            page_id = next_page;
        }

        Ok(results)
    }
}

/// Streaming cursor over a relation's records.
///
/// `scan_next` advances to the next occupied slot and signals exhaustion
/// with `RecordError::EndOfFile`; `get_record` fetches the bytes of the
/// record the cursor is positioned on. No page stays pinned between calls.
pub struct FileScan {
    buffer_manager: Arc<Mutex<BufferManager>>,
    file: FileHandle,
    current_page_id: PageId,
    next_slot: SlotId,
    current_rid: Option<RecordId>,
}

impl FileScan {
    pub fn new(relation: &RelationFile, buffer_manager: Arc<Mutex<BufferManager>>) -> Self {
        Self {
            buffer_manager,
            file: relation.file_handle(),
            current_page_id: FIRST_DATA_PAGE,
            next_slot: 0,
            current_rid: None,
        }
    }

    /// Advance to the next record; `EndOfFile` once the relation is exhausted
    pub fn scan_next(&mut self) -> RecordResult<RecordId> {
        let mut buffer_mgr = self.buffer_manager.lock().unwrap();

        loop {
            buffer_mgr.read_page(self.file, self.current_page_id)?;
            let frame = buffer_mgr.page_mut(self.file, self.current_page_id)?;
            let page = HeapPage::open(self.current_page_id, frame)?;

            let slot_count = page.slot_count();
            let mut found = None;
            for slot_id in self.next_slot..slot_count {
                if page.is_slot_used(slot_id) {
                    found = Some(slot_id);
                    break;
                }
            }

            if let Some(slot_id) = found {
                let rid = RecordId::new(self.current_page_id, slot_id);
                self.next_slot = slot_id + 1;
                self.current_rid = Some(rid);
                buffer_mgr.unpin_page(self.file, self.current_page_id, false)?;
                return Ok(rid);
            }

            let next_page = page.next_page();
            buffer_mgr.unpin_page(self.file, self.current_page_id, false)?;

            if next_page == 0 {
                self.current_rid = None;
                return Err(RecordError::EndOfFile);
            }
            self.current_page_id = next_page;
            self.next_slot = 0;
        }
    }

    /// Bytes of the record the cursor is positioned on
    pub fn get_record(&self) -> RecordResult<Vec<u8>> {
        let rid = self.current_rid.ok_or(RecordError::ScanNotPositioned)?;

        let mut buffer_mgr = self.buffer_manager.lock().unwrap();
        buffer_mgr.read_page(self.file, rid.page_id)?;
        let frame = buffer_mgr.page_mut(self.file, rid.page_id)?;
        let record = HeapPage::open(rid.page_id, frame)?.record(rid.slot_id)?.to_vec();
        buffer_mgr.unpin_page(self.file, rid.page_id, false)?;

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::PagedFileManager;
    use tempfile::TempDir;

    fn setup(record_size: usize) -> (TempDir, Arc<Mutex<BufferManager>>, RelationFile) {
        let temp_dir = TempDir::new().unwrap();
        let file_manager = PagedFileManager::new();
        let buffer_manager = Arc::new(Mutex::new(BufferManager::new(file_manager)));

        let relation = {
            let mut bm = buffer_manager.lock().unwrap();
            RelationFile::create(&mut bm, temp_dir.path().join("rel.tbl"), record_size).unwrap()
        };

        (temp_dir, buffer_manager, relation)
    }

    fn make_record(record_size: usize, key: i32) -> Vec<u8> {
        let mut record = vec![0u8; record_size];
        record[0..4].copy_from_slice(&key.to_le_bytes());
        record
    }

    #[test]
    fn test_insert_and_scan() {
        let record_size = 16;
        let (_temp_dir, buffer_manager, mut relation) = setup(record_size);

        let mut rids = Vec::new();
        {
            let mut bm = buffer_manager.lock().unwrap();
            for key in 0..10 {
                rids.push(relation.insert_record(&mut bm, &make_record(record_size, key)).unwrap());
            }
        }

        // Records never land on the header page
        assert!(rids.iter().all(|rid| rid.page_id >= 1));
        assert!(rids.iter().all(|rid| !rid.is_empty()));

        let mut bm = buffer_manager.lock().unwrap();
        let rows = relation.scan(&mut bm).unwrap();
        assert_eq!(rows.len(), 10);
        for (i, (rid, bytes)) in rows.iter().enumerate() {
            assert_eq!(*rid, rids[i]);
            assert_eq!(bytes[0..4], (i as i32).to_le_bytes());
        }
    }

    #[test]
    fn test_insert_spills_to_new_pages() {
        // Large records force a short page chain
        let record_size = 2048;
        let (_temp_dir, buffer_manager, mut relation) = setup(record_size);

        let mut bm = buffer_manager.lock().unwrap();
        let per_page = HeapPage::max_slot_count(record_size);
        let total = per_page * 3 + 1;
        for key in 0..total {
            relation.insert_record(&mut bm, &make_record(record_size, key as i32)).unwrap();
        }

        let rows = relation.scan(&mut bm).unwrap();
        assert_eq!(rows.len(), total);
        let max_page = rows.iter().map(|(rid, _)| rid.page_id).max().unwrap();
        assert!(max_page >= 4);

        // Every pin was released along the way
        assert_eq!(bm.pinned_page_count(), 0);
    }

    #[test]
    fn test_record_size_enforced() {
        let (_temp_dir, buffer_manager, mut relation) = setup(16);

        let mut bm = buffer_manager.lock().unwrap();
        let result = relation.insert_record(&mut bm, &[0u8; 8]);
        assert!(matches!(result, Err(RecordError::RecordSizeMismatch { .. })));
    }

    #[test]
    fn test_open_recovers_record_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rel.tbl");

        {
            let file_manager = PagedFileManager::new();
            let mut bm = BufferManager::new(file_manager);
            let mut relation = RelationFile::create(&mut bm, &path, 24).unwrap();
            relation.insert_record(&mut bm, &make_record(24, 7)).unwrap();
            bm.flush_file(relation.file_handle()).unwrap();
        }

        let file_manager = PagedFileManager::new();
        let mut bm = BufferManager::new(file_manager);
        let relation = RelationFile::open(&mut bm, &path).unwrap();
        assert_eq!(relation.record_size(), 24);

        let rows = relation.scan(&mut bm).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1[0..4], 7i32.to_le_bytes());
    }

    #[test]
    fn test_file_scan_streams_all_records() {
        let record_size = 16;
        let (_temp_dir, buffer_manager, mut relation) = setup(record_size);

        {
            let mut bm = buffer_manager.lock().unwrap();
            for key in 0..25 {
                relation.insert_record(&mut bm, &make_record(record_size, key)).unwrap();
            }
        }

        let mut scan = FileScan::new(&relation, Arc::clone(&buffer_manager));
        let mut seen = Vec::new();
        loop {
            match scan.scan_next() {
                Ok(_rid) => {
                    let record = scan.get_record().unwrap();
                    seen.push(i32::from_le_bytes([record[0], record[1], record[2], record[3]]));
                }
                Err(RecordError::EndOfFile) => break,
                Err(e) => panic!("unexpected scan error: {}", e),
            }
        }

        assert_eq!(seen, (0..25).collect::<Vec<_>>());
        assert_eq!(buffer_manager.lock().unwrap().pinned_page_count(), 0);
    }

    #[test]
    fn test_file_scan_empty_relation() {
        let (_temp_dir, buffer_manager, relation) = setup(16);

        let mut scan = FileScan::new(&relation, Arc::clone(&buffer_manager));
        assert!(matches!(scan.scan_next(), Err(RecordError::EndOfFile)));
        assert!(matches!(scan.get_record(), Err(RecordError::ScanNotPositioned)));
    }
}
