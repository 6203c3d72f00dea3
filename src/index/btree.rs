//! The B+Tree index: lifecycle, recursive insert, and the range-scan
//! state machine

use std::sync::{Arc, Mutex};

use crate::file::{BufferManager, FileHandle, PageId};
use crate::record::{FileScan, RecordError, RecordId, RelationFile};

use super::error::{IndexError, IndexResult};
use super::node::{self, LEAF_CAPACITY, LeafNode, NON_LEAF_CAPACITY, NonLeafNode};
use super::{AttrType, Operator, index_name};

/// Magic number for index files: "BIDX" in ASCII
const META_MAGIC: u32 = 0x42494458;
const META_VERSION: u32 = 1;

/// Meta page of every index file
const META_PAGE: PageId = 0;

/// Stored length of the relation name in the meta record
const RELATION_NAME_LEN: usize = 20;

/// Persisted index header, kept on the meta page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    /// Name of the indexed relation, truncated to 20 bytes
    pub relation_name: String,
    pub attr_byte_offset: usize,
    pub attr_type: AttrType,
    pub root_page_no: PageId,
}

impl IndexMeta {
    /// Overwrite the meta page with this record
    fn write_to(&self, page: &mut [u8]) {
        page.fill(0);
        page[0..4].copy_from_slice(&META_MAGIC.to_le_bytes());
        page[4..8].copy_from_slice(&META_VERSION.to_le_bytes());

        let name = self.relation_name.as_bytes();
        let name_len = name.len().min(RELATION_NAME_LEN);
        page[8..8 + name_len].copy_from_slice(&name[..name_len]);

        page[28..32].copy_from_slice(&(self.attr_byte_offset as u32).to_le_bytes());
        page[32..36].copy_from_slice(&self.attr_type.as_u32().to_le_bytes());
        page[36..40].copy_from_slice(&(self.root_page_no as u32).to_le_bytes());
    }

    /// Parse the meta record back out of the meta page
    pub fn from_page(page: &[u8]) -> IndexResult<Self> {
        let magic = u32::from_le_bytes([page[0], page[1], page[2], page[3]]);
        if magic != META_MAGIC {
            return Err(IndexError::InvalidMagic);
        }

        let version = u32::from_le_bytes([page[4], page[5], page[6], page[7]]);
        if version != META_VERSION {
            return Err(IndexError::CorruptedMeta(format!(
                "unsupported version {}",
                version
            )));
        }

        let name_field = &page[8..8 + RELATION_NAME_LEN];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(RELATION_NAME_LEN);
        let relation_name = String::from_utf8(name_field[..name_len].to_vec())
            .map_err(|_| IndexError::CorruptedMeta("relation name is not UTF-8".to_string()))?;

        let attr_byte_offset =
            u32::from_le_bytes([page[28], page[29], page[30], page[31]]) as usize;
        let attr_type_raw = u32::from_le_bytes([page[32], page[33], page[34], page[35]]);
        let attr_type = AttrType::from_u32(attr_type_raw).ok_or_else(|| {
            IndexError::CorruptedMeta(format!("unknown attribute type {}", attr_type_raw))
        })?;
        let root_page_no = u32::from_le_bytes([page[36], page[37], page[38], page[39]]) as PageId;

        Ok(Self {
            relation_name,
            attr_byte_offset,
            attr_type,
            root_page_no,
        })
    }
}

/// Disk-backed B+Tree index over an i32 attribute of a relation.
///
/// While a scan is executing, the pin on the current leaf is held inside the
/// buffer manager between `scan_next` calls; `end_scan` (or drop) releases
/// it. At most one leaf pin is held by a scan at any time.
pub struct BTreeIndex {
    buffer_manager: Arc<Mutex<BufferManager>>,
    file: FileHandle,
    meta: IndexMeta,
    closed: bool,

    // Scan state
    scan_executing: bool,
    low_val: i32,
    high_val: i32,
    low_op: Operator,
    high_op: Operator,
    current_page_num: PageId,
    next_entry: usize,
}

impl BTreeIndex {
    /// Build an index over `relation_name` keyed on the i32 attribute at
    /// `attr_byte_offset` of each record.
    ///
    /// The index file (named `relation,offset`) is always created fresh; an
    /// existing file surfaces `FileAlreadyExists`. The meta page lands on
    /// page 0 and the root, initially an empty leaf, on page 1; the relation
    /// is then scanned and every record inserted. Returns the index and its
    /// file name.
    pub fn open_or_create(
        buffer_manager: Arc<Mutex<BufferManager>>,
        relation_name: &str,
        attr_byte_offset: usize,
        attr_type: AttrType,
    ) -> IndexResult<(Self, String)> {
        if attr_type != AttrType::Integer {
            return Err(IndexError::UnsupportedAttrType);
        }

        let index_file_name = index_name(relation_name, attr_byte_offset);
        let mut meta = IndexMeta {
            relation_name: truncate_name(relation_name),
            attr_byte_offset,
            attr_type,
            root_page_no: 0,
        };

        let file = {
            let mut bm = buffer_manager.lock().unwrap();
            let file = bm.file_manager_mut().create_file(&index_file_name)?;

            let (meta_page_no, _) = bm.alloc_page(file)?;

            let (root_page_no, frame) = bm.alloc_page(file)?;
            LeafNode::new().write_to(frame);
            bm.unpin_page(file, root_page_no, true)?;
            meta.root_page_no = root_page_no;

            let frame = bm.page_mut(file, meta_page_no)?;
            meta.write_to(frame);
            bm.unpin_page(file, meta_page_no, true)?;

            file
        };

        let mut index = Self {
            buffer_manager,
            file,
            meta,
            closed: false,
            scan_executing: false,
            low_val: 0,
            high_val: 0,
            low_op: Operator::GTE,
            high_op: Operator::LTE,
            current_page_num: 0,
            next_entry: 0,
        };

        index.bulk_build(relation_name)?;

        Ok((index, index_file_name))
    }

    /// Scan the base relation and insert every record
    fn bulk_build(&mut self, relation_name: &str) -> IndexResult<()> {
        let relation = {
            let mut bm = self.buffer_manager.lock().unwrap();
            RelationFile::open(&mut bm, relation_name)?
        };

        let mut scan = FileScan::new(&relation, Arc::clone(&self.buffer_manager));
        let mut entry_count = 0usize;

        loop {
            match scan.scan_next() {
                Ok(rid) => {
                    let record = scan.get_record()?;
                    let key = extract_key(&record, self.meta.attr_byte_offset)?;
                    self.insert_entry(key, rid)?;
                    entry_count += 1;
                }
                Err(RecordError::EndOfFile) => break,
                Err(e) => return Err(e.into()),
            }
        }

        eprintln!(
            "✓ Built index on {},{} with {} entries",
            relation_name, self.meta.attr_byte_offset, entry_count
        );
        Ok(())
    }

    /// Insert one `(key, rid)` entry.
    ///
    /// Descends to the target leaf; a split bubbles back up as a promoted
    /// key plus the new right sibling, and a split of the root grows the
    /// tree by one level.
    pub fn insert_entry(&mut self, key: i32, rid: RecordId) -> IndexResult<()> {
        let mut bm = self.buffer_manager.lock().unwrap();

        let Some((mid_val, new_page_no)) =
            self.insert_helper(&mut bm, self.meta.root_page_no, key, rid)?
        else {
            return Ok(());
        };

        // Root split: a fresh non-leaf takes over as root
        let (new_root_page_no, frame) = bm.alloc_page(self.file)?;
        let mut new_root = NonLeafNode::new();
        new_root.key_array[0] = mid_val;
        new_root.page_no_array[0] = self.meta.root_page_no;
        new_root.page_no_array[1] = new_page_no;
        new_root.write_to(frame);
        bm.unpin_page(self.file, new_root_page_no, true)?;

        self.meta.root_page_no = new_root_page_no;
        self.write_meta(&mut bm)?;
        Ok(())
    }

    /// Pin `page_no`, run one descent step, and release the pin on every
    /// outcome with the dirty flag the step reports
    fn insert_helper(
        &self,
        bm: &mut BufferManager,
        page_no: PageId,
        key: i32,
        rid: RecordId,
    ) -> IndexResult<Option<(i32, PageId)>> {
        bm.read_page(self.file, page_no)?;

        match self.insert_step(bm, page_no, key, rid) {
            Ok((dirty, split)) => {
                bm.unpin_page(self.file, page_no, dirty)?;
                Ok(split)
            }
            Err(e) => {
                let _ = bm.unpin_page(self.file, page_no, false);
                Err(e)
            }
        }
    }

    /// One step of the recursive descent. The caller holds the pin on
    /// `page_no`; the returned flag records whether its image was modified.
    fn insert_step(
        &self,
        bm: &mut BufferManager,
        page_no: PageId,
        key: i32,
        rid: RecordId,
    ) -> IndexResult<(bool, Option<(i32, PageId)>)> {
        let page = bm.page(self.file, page_no)?;
        if node::is_leaf_page(page) {
            return self.insert_into_leaf_page(bm, page_no, key, rid);
        }

        let mut node = NonLeafNode::from_page(page)?;
        let child_page_no = node.page_no_array[node.find_child_index(key)];

        let Some((child_mid, new_child_page_no)) =
            self.insert_helper(bm, child_page_no, key, rid)?
        else {
            return Ok((false, None));
        };

        // The child split: route its promoted key into this node
        let insertion_index = node.find_child_index(child_mid);

        if !node.is_full() {
            node.insert_at(insertion_index, child_mid, new_child_page_no);
            node.write_to(bm.page_mut(self.file, page_no)?);
            return Ok((true, None));
        }

        // Full: split so the side receiving the new router has room. When
        // the router would lead the right sibling it is promoted itself
        // instead of being stored (move-key-up), and the split child becomes
        // the sibling's leftmost child.
        let middle_index = (NON_LEAF_CAPACITY - 1) / 2;
        let insert_to_left = insertion_index < middle_index;
        let move_key_up = insertion_index == middle_index;
        let split_index = if insert_to_left {
            middle_index + 1
        } else {
            middle_index
        };

        let promoted_key = if move_key_up {
            child_mid
        } else {
            node.key_array[split_index]
        };

        let mut new_node = node.split(split_index, move_key_up);

        if move_key_up {
            new_node.page_no_array[0] = new_child_page_no;
        } else if insert_to_left {
            node.insert_at(insertion_index, child_mid, new_child_page_no);
        } else {
            new_node.insert_at(
                insertion_index - middle_index - 1,
                child_mid,
                new_child_page_no,
            );
        }

        node.write_to(bm.page_mut(self.file, page_no)?);

        let (new_page_no, frame) = bm.alloc_page(self.file)?;
        new_node.write_to(frame);
        bm.unpin_page(self.file, new_page_no, true)?;

        Ok((true, Some((promoted_key, new_page_no))))
    }

    /// Leaf-level insert; splits the leaf and splices the sibling chain
    /// when it is full
    fn insert_into_leaf_page(
        &self,
        bm: &mut BufferManager,
        page_no: PageId,
        key: i32,
        rid: RecordId,
    ) -> IndexResult<(bool, Option<(i32, PageId)>)> {
        let mut node = LeafNode::from_page(bm.page(self.file, page_no)?)?;
        let index = node.find_insertion_index(key);

        if !node.is_full() {
            node.insert_at(index, key, rid);
            node.write_to(bm.page_mut(self.file, page_no)?);
            return Ok((true, None));
        }

        let middle_index = LEAF_CAPACITY / 2;
        let insert_to_left = index < middle_index;
        let split_index = if insert_to_left {
            middle_index + 1
        } else {
            middle_index
        };

        let mut new_node = node.split(split_index);
        if insert_to_left {
            node.insert_at(index, key, rid);
        } else {
            new_node.insert_at(index - middle_index, key, rid);
        }

        let (new_page_no, frame) = bm.alloc_page(self.file)?;
        new_node.right_sib_page_no = node.right_sib_page_no;
        node.right_sib_page_no = new_page_no;
        new_node.write_to(frame);
        bm.unpin_page(self.file, new_page_no, true)?;

        node.write_to(bm.page_mut(self.file, page_no)?);

        // The first key of the new right leaf routes the parent
        Ok((true, Some((new_node.key_array[0], new_page_no))))
    }

    /// Begin a range scan over `(low_val, low_op) .. (high_val, high_op)`.
    ///
    /// `low_op` must be `GT`/`GTE` and `high_op` must be `LT`/`LTE`. The
    /// descent pins exactly one page at a time and leaves the first
    /// qualifying leaf pinned for `scan_next`.
    pub fn start_scan(
        &mut self,
        low_val: i32,
        low_op: Operator,
        high_val: i32,
        high_op: Operator,
    ) -> IndexResult<()> {
        if !matches!(low_op, Operator::GT | Operator::GTE)
            || !matches!(high_op, Operator::LT | Operator::LTE)
        {
            return Err(IndexError::BadOperator);
        }
        if low_val > high_val {
            return Err(IndexError::BadScanRange);
        }

        let mut bm = self.buffer_manager.lock().unwrap();

        // A scan left running still pins its leaf; release it first
        if self.scan_executing {
            bm.unpin_page(self.file, self.current_page_num, false)?;
            self.scan_executing = false;
        }

        self.low_val = low_val;
        self.high_val = high_val;
        self.low_op = low_op;
        self.high_op = high_op;

        // Descend to the leaf that would hold low_val, releasing each
        // non-leaf before moving further down
        let mut page_no = self.meta.root_page_no;
        loop {
            let page = bm.read_page(self.file, page_no)?;
            if node::is_leaf_page(page) {
                break;
            }
            let node = NonLeafNode::from_page(page)?;
            bm.unpin_page(self.file, page_no, false)?;
            page_no = node.page_no_array[node.find_child_index(low_val)];
        }
        self.current_page_num = page_no;
        self.scan_executing = true;

        // Position on the first admissible entry, walking the sibling chain
        // past leaves whose keys all fall below the bound
        let inclusive = self.low_op == Operator::GTE;
        loop {
            let leaf = LeafNode::from_page(bm.page(self.file, self.current_page_num)?)?;
            if let Some(entry) = leaf.find_scan_index(self.low_val, inclusive) {
                self.next_entry = entry;
                break;
            }
            if leaf.right_sib_page_no == 0 {
                // No admissible entry anywhere: park past the end so the
                // first scan_next reports completion
                self.next_entry = leaf.len();
                break;
            }
            bm.unpin_page(self.file, self.current_page_num, false)?;
            self.current_page_num = leaf.right_sib_page_no;
            bm.read_page(self.file, self.current_page_num)?;
        }

        Ok(())
    }

    /// Record id of the next entry in the range.
    ///
    /// `ScanCompleted` once the range is exhausted; the scan stays active
    /// (and its leaf pinned) until `end_scan`.
    pub fn scan_next(&mut self) -> IndexResult<RecordId> {
        if !self.scan_executing {
            return Err(IndexError::ScanNotInitialized);
        }

        let mut bm = self.buffer_manager.lock().unwrap();

        if self.next_entry >= LEAF_CAPACITY {
            return Err(IndexError::ScanCompleted);
        }

        let node = LeafNode::from_page(bm.page(self.file, self.current_page_num)?)?;

        let rid = node.rid_array[self.next_entry];
        if rid.is_empty() {
            return Err(IndexError::ScanCompleted);
        }
        let key = node.key_array[self.next_entry];
        if key > self.high_val || (key == self.high_val && self.high_op == Operator::LT) {
            return Err(IndexError::ScanCompleted);
        }

        // Advance, handing the pin over to the right sibling once this
        // leaf is exhausted
        self.next_entry += 1;
        if (self.next_entry >= LEAF_CAPACITY || node.rid_array[self.next_entry].is_empty())
            && node.right_sib_page_no != 0
        {
            bm.unpin_page(self.file, self.current_page_num, false)?;
            self.current_page_num = node.right_sib_page_no;
            bm.read_page(self.file, self.current_page_num)?;
            self.next_entry = 0;
        }

        Ok(rid)
    }

    /// Terminate the scan and release the pinned leaf
    pub fn end_scan(&mut self) -> IndexResult<()> {
        if !self.scan_executing {
            return Err(IndexError::ScanNotInitialized);
        }

        let mut bm = self.buffer_manager.lock().unwrap();
        bm.unpin_page(self.file, self.current_page_num, false)?;
        self.scan_executing = false;
        Ok(())
    }

    /// Flush the index file and release its handle
    pub fn close(mut self) -> IndexResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> IndexResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut bm = self.buffer_manager.lock().unwrap();
        if self.scan_executing {
            let _ = bm.unpin_page(self.file, self.current_page_num, false);
            self.scan_executing = false;
        }
        self.write_meta(&mut bm)?;
        bm.flush_file(self.file)?;
        bm.file_manager_mut().close_file(self.file)?;
        Ok(())
    }

    fn write_meta(&self, bm: &mut BufferManager) -> IndexResult<()> {
        bm.read_page(self.file, META_PAGE)?;
        let frame = bm.page_mut(self.file, META_PAGE)?;
        self.meta.write_to(frame);
        bm.unpin_page(self.file, META_PAGE, true)?;
        Ok(())
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn root_page_no(&self) -> PageId {
        self.meta.root_page_no
    }

    pub fn file_handle(&self) -> FileHandle {
        self.file
    }

    pub fn scan_executing(&self) -> bool {
        self.scan_executing
    }
}

impl Drop for BTreeIndex {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Read the key attribute out of a raw record
fn extract_key(record: &[u8], attr_byte_offset: usize) -> IndexResult<i32> {
    let bytes = record
        .get(attr_byte_offset..attr_byte_offset + 4)
        .ok_or(IndexError::KeyOutOfRecord {
            offset: attr_byte_offset,
            record_len: record.len(),
        })?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Truncate a relation name to the stored field width, keeping whole
/// characters
fn truncate_name(relation_name: &str) -> String {
    let mut end = relation_name.len().min(RELATION_NAME_LEN);
    while !relation_name.is_char_boundary(end) {
        end -= 1;
    }
    relation_name[..end].to_string()
}
