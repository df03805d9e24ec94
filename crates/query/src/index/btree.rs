//! Persistent B+ tree over the buffer pool.
//!
//! Every node is one index page. Leaves hold `(key, record pointer)` entries
//! and chain together in ascending key order; internal nodes hold separator
//! keys plus child ids, with the leftmost child carried in the page header.
//! The tree stores no parent pointers: descents record an ancestor stack of
//! `(page_id, child_index)` and rebalancing walks it back up.

use log::warn;
use storage::{
    BufferPoolManager, Page, PageId, PageType, RecordPtr, StorageError, INVALID_PAGE_ID,
    PAGE_HEADER_SIZE, PAGE_SIZE,
};

use crate::error::{QueryError, QueryResult};

const LEAF_ENTRY_SIZE: usize = 18; // key i64, page id i64, slot u16
const INTERNAL_ENTRY_SIZE: usize = 16; // key i64, child page id i64
const NODE_BODY_OFFSET: usize = PAGE_HEADER_SIZE;

// Tree metadata, stored in the body of a dedicated header page so that a
// rebuild can swap the root atomically.
const HEADER_ROOT_OFFSET: usize = PAGE_HEADER_SIZE;
const HEADER_ENTRY_COUNT_OFFSET: usize = PAGE_HEADER_SIZE + 8;
const HEADER_MAX_KEYS_OFFSET: usize = PAGE_HEADER_SIZE + 16;
const HEADER_UNIQUE_OFFSET: usize = PAGE_HEADER_SIZE + 20;

/// Largest key count a node may settle at. One slot of raw page capacity is
/// held back so a node can go transiently over-full before it splits.
pub fn default_max_keys() -> usize {
    (PAGE_SIZE - PAGE_HEADER_SIZE) / LEAF_ENTRY_SIZE - 1
}

#[derive(Debug, Clone)]
pub(crate) struct LeafNode {
    pub(crate) prev_leaf: PageId,
    pub(crate) next_leaf: PageId,
    pub(crate) entries: Vec<(i64, RecordPtr)>,
}

impl LeafNode {
    pub(crate) fn empty() -> Self {
        Self {
            prev_leaf: INVALID_PAGE_ID,
            next_leaf: INVALID_PAGE_ID,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct InternalNode {
    pub(crate) keys: Vec<i64>,
    pub(crate) children: Vec<PageId>,
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    fn key_count(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Internal(internal) => internal.keys.len(),
        }
    }
}

/// Ordered index from integer keys to record pointers.
#[derive(Clone)]
pub struct BPlusTree {
    pool: BufferPoolManager,
    header_page_id: PageId,
    max_keys: usize,
    unique: bool,
}

impl BPlusTree {
    /// Creates an empty tree with the default node capacity.
    pub fn create(pool: BufferPoolManager, unique: bool) -> QueryResult<Self> {
        Self::create_with_order(pool, unique, default_max_keys())
    }

    /// Creates an empty tree with an explicit node capacity. Small orders
    /// keep split and merge behaviour testable.
    pub fn create_with_order(
        pool: BufferPoolManager,
        unique: bool,
        max_keys: usize,
    ) -> QueryResult<Self> {
        if max_keys < 2 || max_keys > default_max_keys() {
            return Err(QueryError::corrupted(format!(
                "unsupported node capacity {max_keys}"
            )));
        }
        let header_page_id = allocate_node(&pool)?;
        let root_page_id = allocate_node(&pool)?;

        {
            let mut guard = fetch(&pool, header_page_id)?;
            guard.convert_to_index_page(false);
            write_i64(&mut guard, HEADER_ROOT_OFFSET, root_page_id);
            write_u64(&mut guard, HEADER_ENTRY_COUNT_OFFSET, 0);
            write_u32(&mut guard, HEADER_MAX_KEYS_OFFSET, max_keys as u32);
            write_u8(&mut guard, HEADER_UNIQUE_OFFSET, unique as u8);
            guard.update_checksum();
        }
        pool.unpin_page(header_page_id, true)?;

        let tree = Self {
            pool,
            header_page_id,
            max_keys,
            unique,
        };
        tree.write_leaf(root_page_id, &LeafNode::empty())?;
        Ok(tree)
    }

    /// Reopens a tree from its header page.
    pub fn open(pool: BufferPoolManager, header_page_id: PageId) -> QueryResult<Self> {
        let (max_keys, unique) = {
            let guard = fetch(&pool, header_page_id)?;
            if guard.page_type() != PageType::Index {
                return Err(QueryError::corrupted(format!(
                    "page {header_page_id} is not an index header"
                )));
            }
            (
                read_u32(&guard, HEADER_MAX_KEYS_OFFSET) as usize,
                read_u8(&guard, HEADER_UNIQUE_OFFSET) != 0,
            )
        };
        pool.unpin_page(header_page_id, false)?;
        if max_keys < 2 {
            return Err(QueryError::corrupted("index header missing node capacity"));
        }
        Ok(Self {
            pool,
            header_page_id,
            max_keys,
            unique,
        })
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    pub fn min_keys(&self) -> usize {
        self.max_keys / 2
    }

    pub fn unique(&self) -> bool {
        self.unique
    }

    /// Number of stored entries.
    pub fn len(&self) -> QueryResult<u64> {
        let count = {
            let guard = fetch(&self.pool, self.header_page_id)?;
            read_u64(&guard, HEADER_ENTRY_COUNT_OFFSET)
        };
        self.pool.unpin_page(self.header_page_id, false)?;
        Ok(count)
    }

    pub fn is_empty(&self) -> QueryResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Inserts an entry. Unique trees replace the pointer of an existing
    /// key; non-unique trees keep one entry per insertion. A transient
    /// buffer shortage is retried once after pins have been released.
    pub fn insert(&self, key: i64, ptr: RecordPtr) -> QueryResult<()> {
        match self.insert_inner(key, ptr) {
            Err(QueryError::Storage(StorageError::BufferExhausted)) => {
                warn!("insert of key {key} hit an exhausted buffer pool, retrying once");
                self.insert_inner(key, ptr)
            }
            other => other,
        }
    }

    /// Removes one entry for `key`. Returns false when the key is absent.
    pub fn remove(&self, key: i64) -> QueryResult<bool> {
        match self.remove_inner(key) {
            Err(QueryError::Storage(StorageError::BufferExhausted)) => {
                warn!("remove of key {key} hit an exhausted buffer pool, retrying once");
                self.remove_inner(key)
            }
            other => other,
        }
    }

    /// Point lookup; the invalid pointer marks an absent key. Starts at the
    /// leftmost candidate leaf and follows the chain, so duplicates that
    /// straddle a node boundary are still found.
    pub fn find(&self, key: i64) -> QueryResult<RecordPtr> {
        let mut leaf_id = self.find_leaf_lower(key)?;
        while leaf_id != INVALID_PAGE_ID {
            let Node::Leaf(leaf) = self.read_node(leaf_id)? else {
                return Err(QueryError::corrupted("descent ended on a non-leaf page"));
            };
            for (stored, ptr) in &leaf.entries {
                if *stored == key {
                    return Ok(*ptr);
                }
                if *stored > key {
                    return Ok(RecordPtr::INVALID);
                }
            }
            leaf_id = self.validated_next_leaf(leaf_id, leaf.next_leaf)?;
        }
        Ok(RecordPtr::INVALID)
    }

    pub fn contains(&self, key: i64) -> QueryResult<bool> {
        Ok(self.find(key)?.is_valid())
    }

    /// Every pointer stored under `key` (meaningful for non-unique trees).
    pub fn find_all(&self, key: i64) -> QueryResult<Vec<RecordPtr>> {
        Ok(self
            .range(key, key)?
            .into_iter()
            .map(|(_, ptr)| ptr)
            .collect())
    }

    /// All entries with keys in `[lo, hi]`, ascending, via the leaf chain.
    pub fn range(&self, lo: i64, hi: i64) -> QueryResult<Vec<(i64, RecordPtr)>> {
        let mut results = Vec::new();
        if lo > hi {
            return Ok(results);
        }
        let mut leaf_id = self.find_leaf_lower(lo)?;
        while leaf_id != INVALID_PAGE_ID {
            let Node::Leaf(leaf) = self.read_node(leaf_id)? else {
                return Err(QueryError::corrupted("leaf chain reached a non-leaf page"));
            };
            for (key, ptr) in &leaf.entries {
                if *key > hi {
                    return Ok(results);
                }
                if *key >= lo {
                    results.push((*key, *ptr));
                }
            }
            leaf_id = self.validated_next_leaf(leaf_id, leaf.next_leaf)?;
        }
        Ok(results)
    }

    /// Smallest stored key.
    pub fn min(&self) -> QueryResult<Option<i64>> {
        let leaf_id = self.leftmost_leaf()?;
        let Node::Leaf(leaf) = self.read_node(leaf_id)? else {
            return Err(QueryError::corrupted("leftmost descent missed a leaf"));
        };
        Ok(leaf.entries.first().map(|(key, _)| *key))
    }

    /// Largest stored key.
    pub fn max(&self) -> QueryResult<Option<i64>> {
        let mut current = self.root_page_id()?;
        loop {
            match self.read_node(current)? {
                Node::Leaf(leaf) => return Ok(leaf.entries.last().map(|(key, _)| *key)),
                Node::Internal(internal) => {
                    current = *internal
                        .children
                        .last()
                        .ok_or_else(|| QueryError::corrupted("internal node without children"))?;
                }
            }
        }
    }

    /// First key that is `>= key`.
    pub fn lower_bound(&self, key: i64) -> QueryResult<Option<i64>> {
        self.first_key_matching(key, |candidate| candidate >= key)
    }

    /// First key that is `> key`.
    pub fn upper_bound(&self, key: i64) -> QueryResult<Option<i64>> {
        self.first_key_matching(key, |candidate| candidate > key)
    }

    /// All entries in ascending key order.
    pub fn entries(&self) -> QueryResult<Vec<(i64, RecordPtr)>> {
        let mut results = Vec::new();
        let mut leaf_id = self.leftmost_leaf()?;
        while leaf_id != INVALID_PAGE_ID {
            let Node::Leaf(leaf) = self.read_node(leaf_id)? else {
                return Err(QueryError::corrupted("leaf chain reached a non-leaf page"));
            };
            results.extend(leaf.entries.iter().copied());
            leaf_id = self.validated_next_leaf(leaf_id, leaf.next_leaf)?;
        }
        Ok(results)
    }

    /// Levels from root to leaf, inclusive.
    pub fn height(&self) -> QueryResult<usize> {
        let mut height = 1;
        let mut current = self.root_page_id()?;
        loop {
            match self.read_node(current)? {
                Node::Leaf(_) => return Ok(height),
                Node::Internal(internal) => {
                    current = internal.children[0];
                    height += 1;
                }
            }
        }
    }

    /// Number of node pages (header excluded).
    pub fn page_count(&self) -> QueryResult<usize> {
        let mut count = 0;
        let mut pending = vec![self.root_page_id()?];
        while let Some(page_id) = pending.pop() {
            count += 1;
            if let Node::Internal(internal) = self.read_node(page_id)? {
                pending.extend(internal.children.iter().copied());
            }
        }
        Ok(count)
    }

    /// Fill factor of every leaf, in chain order.
    pub fn leaf_fill_factors(&self) -> QueryResult<Vec<f64>> {
        let mut fills = Vec::new();
        let mut leaf_id = self.leftmost_leaf()?;
        while leaf_id != INVALID_PAGE_ID {
            let Node::Leaf(leaf) = self.read_node(leaf_id)? else {
                break;
            };
            fills.push(leaf.entries.len() as f64 / self.max_keys as f64);
            leaf_id = self.validated_next_leaf(leaf_id, leaf.next_leaf)?;
        }
        Ok(fills)
    }

    /// Average leaf fill factor in `[0, 1]`.
    pub fn average_leaf_fill(&self) -> QueryResult<f64> {
        let fills = self.leaf_fill_factors()?;
        if fills.is_empty() {
            return Ok(0.0);
        }
        Ok(fills.iter().sum::<f64>() / fills.len() as f64)
    }

    /// Replaces the whole tree with a bulk-loaded copy of `entries`, then
    /// frees the old nodes. Entries need not be sorted.
    pub fn bulk_replace(
        &self,
        mut entries: Vec<(i64, RecordPtr)>,
        fill_factor: f64,
    ) -> QueryResult<()> {
        entries.sort_by_key(|(key, _)| *key);
        let count = entries.len() as u64;
        let old_root = self.root_page_id()?;
        let loader = super::bulk::BulkLoader::with_fill_factor(
            self.pool.clone(),
            self.max_keys,
            fill_factor,
        );
        let new_root = loader.build_from_sorted(entries)?;
        self.set_root(new_root)?;
        self.set_entry_count(count)?;
        self.free_subtree(old_root)?;
        Ok(())
    }

    /// Walks every node checking the structural rules: key-count bounds on
    /// non-root nodes, child counts, separator ordering, and a leaf chain
    /// that yields all keys in ascending order.
    pub fn check_integrity(&self) -> QueryResult<()> {
        let root_id = self.root_page_id()?;
        let mut pending: Vec<(PageId, bool)> = vec![(root_id, true)];
        while let Some((page_id, is_root)) = pending.pop() {
            let node = self.read_node(page_id)?;
            let count = node.key_count();
            if !is_root && (count < self.min_keys() || count > self.max_keys) {
                return Err(QueryError::corrupted(format!(
                    "node {page_id} holds {count} keys outside [{}, {}]",
                    self.min_keys(),
                    self.max_keys
                )));
            }
            if let Node::Internal(internal) = &node {
                if internal.children.len() != internal.keys.len() + 1 {
                    return Err(QueryError::corrupted(format!(
                        "internal node {page_id} child count mismatch"
                    )));
                }
                if internal.keys.windows(2).any(|pair| pair[0] > pair[1]) {
                    return Err(QueryError::corrupted(format!(
                        "internal node {page_id} keys out of order"
                    )));
                }
                pending.extend(internal.children.iter().map(|child| (*child, false)));
            }
        }

        let mut total = 0u64;
        let mut previous: Option<i64> = None;
        let mut leaf_id = self.leftmost_leaf()?;
        while leaf_id != INVALID_PAGE_ID {
            let Node::Leaf(leaf) = self.read_node(leaf_id)? else {
                return Err(QueryError::corrupted("leaf chain reached a non-leaf page"));
            };
            for (key, _) in &leaf.entries {
                if let Some(last) = previous {
                    if (self.unique && *key <= last) || (!self.unique && *key < last) {
                        return Err(QueryError::corrupted(format!(
                            "leaf chain out of order at key {key}"
                        )));
                    }
                }
                previous = Some(*key);
                total += 1;
            }
            leaf_id = self.validated_next_leaf(leaf_id, leaf.next_leaf)?;
        }
        let expected = self.len()?;
        if total != expected {
            return Err(QueryError::corrupted(format!(
                "leaf chain covers {total} keys, header records {expected}"
            )));
        }
        Ok(())
    }

    // --- descent and node IO ---

    fn root_page_id(&self) -> QueryResult<PageId> {
        let root = {
            let guard = fetch(&self.pool, self.header_page_id)?;
            read_i64(&guard, HEADER_ROOT_OFFSET)
        };
        self.pool.unpin_page(self.header_page_id, false)?;
        Ok(root)
    }

    fn set_root(&self, root_page_id: PageId) -> QueryResult<()> {
        {
            let mut guard = fetch(&self.pool, self.header_page_id)?;
            write_i64(&mut guard, HEADER_ROOT_OFFSET, root_page_id);
            guard.update_checksum();
        }
        self.pool.unpin_page(self.header_page_id, true)?;
        Ok(())
    }

    fn set_entry_count(&self, count: u64) -> QueryResult<()> {
        {
            let mut guard = fetch(&self.pool, self.header_page_id)?;
            write_u64(&mut guard, HEADER_ENTRY_COUNT_OFFSET, count);
            guard.update_checksum();
        }
        self.pool.unpin_page(self.header_page_id, true)?;
        Ok(())
    }

    fn bump_entry_count(&self, delta: i64) -> QueryResult<()> {
        let current = self.len()?;
        self.set_entry_count(current.saturating_add_signed(delta))
    }

    pub(crate) fn read_node(&self, page_id: PageId) -> QueryResult<Node> {
        read_node(&self.pool, page_id)
    }

    fn write_leaf(&self, page_id: PageId, leaf: &LeafNode) -> QueryResult<()> {
        write_leaf(&self.pool, page_id, leaf)
    }

    fn write_internal(&self, page_id: PageId, internal: &InternalNode) -> QueryResult<()> {
        write_internal(&self.pool, page_id, internal)
    }

    /// Descent for insertions: equal separators route right, so new
    /// duplicates land after their peers.
    fn find_leaf(&self, key: i64) -> QueryResult<PageId> {
        let mut current = self.root_page_id()?;
        loop {
            match self.read_node(current)? {
                Node::Leaf(_) => return Ok(current),
                Node::Internal(internal) => {
                    current = internal.children[child_index(&internal.keys, key)];
                }
            }
        }
    }

    /// Descent for scans: equal separators route left, reaching the first
    /// leaf that can contain the key.
    fn find_leaf_lower(&self, key: i64) -> QueryResult<PageId> {
        let mut current = self.root_page_id()?;
        loop {
            match self.read_node(current)? {
                Node::Leaf(_) => return Ok(current),
                Node::Internal(internal) => {
                    let idx = internal.keys.partition_point(|stored| *stored < key);
                    current = internal.children[idx];
                }
            }
        }
    }

    fn leftmost_leaf(&self) -> QueryResult<PageId> {
        let mut current = self.root_page_id()?;
        loop {
            match self.read_node(current)? {
                Node::Leaf(_) => return Ok(current),
                Node::Internal(internal) => current = internal.children[0],
            }
        }
    }

    fn first_key_matching(
        &self,
        start: i64,
        accept: impl Fn(i64) -> bool,
    ) -> QueryResult<Option<i64>> {
        let mut leaf_id = self.find_leaf_lower(start)?;
        while leaf_id != INVALID_PAGE_ID {
            let Node::Leaf(leaf) = self.read_node(leaf_id)? else {
                return Err(QueryError::corrupted("leaf chain reached a non-leaf page"));
            };
            if let Some((key, _)) = leaf.entries.iter().find(|(key, _)| accept(*key)) {
                return Ok(Some(*key));
            }
            leaf_id = self.validated_next_leaf(leaf_id, leaf.next_leaf)?;
        }
        Ok(None)
    }

    /// Follows a leaf-chain link, healing it when it points at a freed or
    /// non-leaf page: the link is reset to −1 and the scan ends.
    fn validated_next_leaf(&self, current_id: PageId, next_id: PageId) -> QueryResult<PageId> {
        if next_id == INVALID_PAGE_ID {
            return Ok(INVALID_PAGE_ID);
        }
        let verdict = match self.pool.fetch_page(next_id) {
            Ok(guard) => {
                let healthy = guard.page_type() == PageType::Index && guard.is_leaf();
                drop(guard);
                self.pool.unpin_page(next_id, false)?;
                healthy
            }
            Err(StorageError::Corrupted(_)) | Err(StorageError::PageOutOfBounds(_)) => false,
            Err(err) => return Err(err.into()),
        };
        if verdict {
            return Ok(next_id);
        }
        warn!("leaf {current_id} linked to invalid page {next_id}; resetting the chain link");
        {
            let mut guard = fetch(&self.pool, current_id)?;
            guard.set_next_leaf(INVALID_PAGE_ID);
            guard.update_checksum();
        }
        self.pool.unpin_page(current_id, true)?;
        Ok(INVALID_PAGE_ID)
    }

    // --- insertion ---

    fn insert_inner(&self, key: i64, ptr: RecordPtr) -> QueryResult<()> {
        if self.unique && self.replace_if_present(key, ptr)? {
            return Ok(());
        }

        let mut path: Vec<(PageId, usize)> = Vec::new();
        let mut current = self.root_page_id()?;
        path.push((current, 0));
        loop {
            match self.read_node(current)? {
                Node::Internal(internal) => {
                    let idx = child_index(&internal.keys, key);
                    current = internal.children[idx];
                    path.push((current, idx));
                }
                Node::Leaf(mut leaf) => {
                    let at = leaf.entries.partition_point(|(stored, _)| *stored <= key);
                    leaf.entries.insert(at, (key, ptr));
                    self.write_leaf(current, &leaf)?;
                    self.bump_entry_count(1)?;
                    break;
                }
            }
        }
        self.split_upward(&path)
    }

    /// Splits transiently over-full nodes bottom-up along the ancestor
    /// stack. An over-full root hands itself off as the sole child of a
    /// fresh internal root before splitting.
    fn split_upward(&self, path: &[(PageId, usize)]) -> QueryResult<()> {
        let mut depth = path.len() - 1;
        loop {
            let (node_id, idx) = path[depth];
            let node = self.read_node(node_id)?;
            if node.key_count() <= self.max_keys {
                return Ok(());
            }
            let (separator, right_id) = self.split_child(node_id, node)?;
            if depth == 0 {
                let new_root_id = allocate_node(&self.pool)?;
                self.write_internal(
                    new_root_id,
                    &InternalNode {
                        keys: vec![separator],
                        children: vec![node_id, right_id],
                    },
                )?;
                self.set_root(new_root_id)?;
                return Ok(());
            }
            let parent_id = path[depth - 1].0;
            let Node::Internal(mut parent) = self.read_node(parent_id)? else {
                return Err(QueryError::corrupted("ancestor stack missed an internal node"));
            };
            parent.keys.insert(idx, separator);
            parent.children.insert(idx + 1, right_id);
            self.write_internal(parent_id, &parent)?;
            depth -= 1;
        }
    }

    fn replace_if_present(&self, key: i64, ptr: RecordPtr) -> QueryResult<bool> {
        let leaf_id = self.find_leaf(key)?;
        let Node::Leaf(mut leaf) = self.read_node(leaf_id)? else {
            return Err(QueryError::corrupted("descent ended on a non-leaf page"));
        };
        if let Some(position) = leaf.entries.iter().position(|(stored, _)| *stored == key) {
            leaf.entries[position] = (key, ptr);
            self.write_leaf(leaf_id, &leaf)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Splits a full node, returning the separator key for the parent and
    /// the new right sibling's page id. Leaf splits keep the promoted key in
    /// the sibling; internal splits promote the middle key exclusively.
    fn split_child(&self, page_id: PageId, node: Node) -> QueryResult<(i64, PageId)> {
        let right_id = allocate_node(&self.pool)?;
        match node {
            Node::Leaf(mut leaf) => {
                let mid = leaf.entries.len() / 2;
                let right_entries = leaf.entries.split_off(mid);
                let separator = right_entries[0].0;
                let right = LeafNode {
                    prev_leaf: page_id,
                    next_leaf: leaf.next_leaf,
                    entries: right_entries,
                };
                if right.next_leaf != INVALID_PAGE_ID {
                    self.set_prev_leaf(right.next_leaf, right_id)?;
                }
                leaf.next_leaf = right_id;
                self.write_leaf(page_id, &leaf)?;
                self.write_leaf(right_id, &right)?;
                Ok((separator, right_id))
            }
            Node::Internal(mut internal) => {
                let mid = internal.keys.len() / 2;
                let separator = internal.keys[mid];
                let right = InternalNode {
                    keys: internal.keys.split_off(mid + 1),
                    children: internal.children.split_off(mid + 1),
                };
                internal.keys.truncate(mid);
                self.write_internal(page_id, &internal)?;
                self.write_internal(right_id, &right)?;
                Ok((separator, right_id))
            }
        }
    }

    fn set_prev_leaf(&self, page_id: PageId, prev: PageId) -> QueryResult<()> {
        {
            let mut guard = fetch(&self.pool, page_id)?;
            guard.set_prev_leaf(prev);
            guard.update_checksum();
        }
        self.pool.unpin_page(page_id, true)?;
        Ok(())
    }

    // --- deletion ---

    fn remove_inner(&self, key: i64) -> QueryResult<bool> {
        let mut path: Vec<(PageId, usize)> = Vec::new();
        let mut current = self.root_page_id()?;
        path.push((current, 0));
        loop {
            match self.read_node(current)? {
                Node::Internal(internal) => {
                    let idx = child_index(&internal.keys, key);
                    current = internal.children[idx];
                    path.push((current, idx));
                }
                Node::Leaf(mut leaf) => {
                    let Some(position) =
                        leaf.entries.iter().position(|(stored, _)| *stored == key)
                    else {
                        // Duplicates can drift left of an equal separator;
                        // sweep the chain for them before giving up.
                        if !self.unique {
                            return self.remove_via_chain(key);
                        }
                        return Ok(false);
                    };
                    leaf.entries.remove(position);
                    self.write_leaf(current, &leaf)?;
                    self.bump_entry_count(-1)?;
                    break;
                }
            }
        }
        self.rebalance(&path)?;
        Ok(true)
    }

    /// Removes one entry found by scanning the leaf chain rather than by
    /// descent. The touched leaf may be left under-filled; the next rebuild
    /// repacks it.
    fn remove_via_chain(&self, key: i64) -> QueryResult<bool> {
        let mut leaf_id = self.find_leaf_lower(key)?;
        while leaf_id != INVALID_PAGE_ID {
            let Node::Leaf(mut leaf) = self.read_node(leaf_id)? else {
                return Err(QueryError::corrupted("leaf chain reached a non-leaf page"));
            };
            if let Some(position) = leaf.entries.iter().position(|(stored, _)| *stored == key) {
                leaf.entries.remove(position);
                if leaf.entries.len() < self.min_keys() {
                    warn!("leaf {leaf_id} under-filled after duplicate removal");
                }
                self.write_leaf(leaf_id, &leaf)?;
                self.bump_entry_count(-1)?;
                return Ok(true);
            }
            if leaf.entries.last().is_some_and(|(stored, _)| *stored > key) {
                return Ok(false);
            }
            leaf_id = self.validated_next_leaf(leaf_id, leaf.next_leaf)?;
        }
        Ok(false)
    }

    /// Restores the key-count bounds walking the ancestor stack upward:
    /// borrow from a richer sibling (left first), otherwise merge (into the
    /// left sibling when one exists). A root that empties collapses into its
    /// sole child, shrinking the tree by one level.
    fn rebalance(&self, path: &[(PageId, usize)]) -> QueryResult<()> {
        let mut depth = path.len() - 1;
        while depth > 0 {
            let (node_id, idx) = path[depth];
            let node = self.read_node(node_id)?;
            if node.key_count() >= self.min_keys() {
                return Ok(());
            }
            let parent_id = path[depth - 1].0;
            let Node::Internal(mut parent) = self.read_node(parent_id)? else {
                return Err(QueryError::corrupted("ancestor stack missed an internal node"));
            };

            if idx > 0 {
                let left_id = parent.children[idx - 1];
                let left = self.read_node(left_id)?;
                if left.key_count() > self.min_keys() {
                    self.borrow_from_left(&mut parent, idx, left_id, left, node_id, node)?;
                    self.write_internal(parent_id, &parent)?;
                    return Ok(());
                }
            }
            if idx + 1 < parent.children.len() {
                let right_id = parent.children[idx + 1];
                let right = self.read_node(right_id)?;
                if right.key_count() > self.min_keys() {
                    self.borrow_from_right(&mut parent, idx, node_id, node, right_id, right)?;
                    self.write_internal(parent_id, &parent)?;
                    return Ok(());
                }
            }

            if idx > 0 {
                let left_id = parent.children[idx - 1];
                let left = self.read_node(left_id)?;
                self.merge_siblings(&mut parent, idx - 1, left_id, left, node_id, node)?;
            } else {
                let right_id = parent.children[idx + 1];
                let right = self.read_node(right_id)?;
                self.merge_siblings(&mut parent, idx, node_id, node, right_id, right)?;
            }
            self.write_internal(parent_id, &parent)?;
            depth -= 1;
        }

        let root_id = path[0].0;
        if let Node::Internal(root) = self.read_node(root_id)? {
            if root.keys.is_empty() {
                self.set_root(root.children[0])?;
                self.pool.free_page(root_id)?;
            }
        }
        Ok(())
    }

    fn borrow_from_left(
        &self,
        parent: &mut InternalNode,
        idx: usize,
        left_id: PageId,
        left: Node,
        node_id: PageId,
        node: Node,
    ) -> QueryResult<()> {
        match (left, node) {
            (Node::Leaf(mut left), Node::Leaf(mut node)) => {
                let moved = left
                    .entries
                    .pop()
                    .ok_or_else(|| QueryError::corrupted("borrowing from an empty leaf"))?;
                node.entries.insert(0, moved);
                parent.keys[idx - 1] = node.entries[0].0;
                self.write_leaf(left_id, &left)?;
                self.write_leaf(node_id, &node)?;
            }
            (Node::Internal(mut left), Node::Internal(mut node)) => {
                // The parent separator rotates down; the left sibling's last
                // key rotates up.
                node.keys.insert(0, parent.keys[idx - 1]);
                parent.keys[idx - 1] = left
                    .keys
                    .pop()
                    .ok_or_else(|| QueryError::corrupted("borrowing from an empty node"))?;
                let child = left
                    .children
                    .pop()
                    .ok_or_else(|| QueryError::corrupted("borrowing from a childless node"))?;
                node.children.insert(0, child);
                self.write_internal(left_id, &left)?;
                self.write_internal(node_id, &node)?;
            }
            _ => return Err(QueryError::corrupted("sibling level mismatch")),
        }
        Ok(())
    }

    fn borrow_from_right(
        &self,
        parent: &mut InternalNode,
        idx: usize,
        node_id: PageId,
        node: Node,
        right_id: PageId,
        right: Node,
    ) -> QueryResult<()> {
        match (node, right) {
            (Node::Leaf(mut node), Node::Leaf(mut right)) => {
                let moved = right.entries.remove(0);
                node.entries.push(moved);
                parent.keys[idx] = right.entries[0].0;
                self.write_leaf(node_id, &node)?;
                self.write_leaf(right_id, &right)?;
            }
            (Node::Internal(mut node), Node::Internal(mut right)) => {
                node.keys.push(parent.keys[idx]);
                parent.keys[idx] = right.keys.remove(0);
                node.children.push(right.children.remove(0));
                self.write_internal(node_id, &node)?;
                self.write_internal(right_id, &right)?;
            }
            _ => return Err(QueryError::corrupted("sibling level mismatch")),
        }
        Ok(())
    }

    /// Merges `right` into `left` and drops the separator at `sep_idx`. The
    /// right page is unlinked from the leaf chain and returned to the free
    /// list.
    fn merge_siblings(
        &self,
        parent: &mut InternalNode,
        sep_idx: usize,
        left_id: PageId,
        left: Node,
        right_id: PageId,
        right: Node,
    ) -> QueryResult<()> {
        match (left, right) {
            (Node::Leaf(mut left), Node::Leaf(right)) => {
                left.entries.extend(right.entries);
                left.next_leaf = right.next_leaf;
                if right.next_leaf != INVALID_PAGE_ID {
                    self.set_prev_leaf(right.next_leaf, left_id)?;
                }
                self.write_leaf(left_id, &left)?;
            }
            (Node::Internal(mut left), Node::Internal(right)) => {
                // The separator demotes into the merged node.
                left.keys.push(parent.keys[sep_idx]);
                left.keys.extend(right.keys);
                left.children.extend(right.children);
                self.write_internal(left_id, &left)?;
            }
            _ => return Err(QueryError::corrupted("sibling level mismatch")),
        }
        parent.keys.remove(sep_idx);
        parent.children.remove(sep_idx + 1);
        self.pool.free_page(right_id)?;
        Ok(())
    }

    fn free_subtree(&self, root_id: PageId) -> QueryResult<()> {
        let mut pending = vec![root_id];
        while let Some(page_id) = pending.pop() {
            if let Node::Internal(internal) = self.read_node(page_id)? {
                pending.extend(internal.children.iter().copied());
            }
            self.pool.free_page(page_id)?;
        }
        Ok(())
    }
}

/// Index of the child to descend into; equal keys route right because leaf
/// splits keep the promoted key in the right sibling.
fn child_index(keys: &[i64], key: i64) -> usize {
    keys.partition_point(|stored| *stored <= key)
}

pub(crate) fn allocate_node(pool: &BufferPoolManager) -> QueryResult<PageId> {
    let page_id = pool.new_page()?;
    pool.unpin_page(page_id, true)?;
    Ok(page_id)
}

fn fetch<'a>(pool: &'a BufferPoolManager, page_id: PageId) -> QueryResult<storage::PageGuard<'a>> {
    Ok(pool.fetch_page(page_id)?)
}

pub(crate) fn read_node(pool: &BufferPoolManager, page_id: PageId) -> QueryResult<Node> {
    let node = {
        let guard = fetch(pool, page_id)?;
        parse_node(&guard, page_id)
    };
    pool.unpin_page(page_id, false)?;
    node
}

fn parse_node(page: &Page, page_id: PageId) -> QueryResult<Node> {
    if page.page_type() != PageType::Index {
        return Err(QueryError::corrupted(format!(
            "page {page_id} is not an index page"
        )));
    }
    let count = page.record_count() as usize;
    if page.is_leaf() {
        let mut entries = Vec::with_capacity(count);
        for index in 0..count {
            let at = NODE_BODY_OFFSET + index * LEAF_ENTRY_SIZE;
            entries.push((
                read_i64(page, at),
                RecordPtr::new(read_i64(page, at + 8), read_u16(page, at + 16)),
            ));
        }
        Ok(Node::Leaf(LeafNode {
            prev_leaf: page.prev_leaf(),
            next_leaf: page.next_leaf(),
            entries,
        }))
    } else {
        let leftmost = page.next_page();
        if leftmost == INVALID_PAGE_ID {
            return Err(QueryError::corrupted(format!(
                "internal node {page_id} missing leftmost child"
            )));
        }
        let mut keys = Vec::with_capacity(count);
        let mut children = Vec::with_capacity(count + 1);
        children.push(leftmost);
        for index in 0..count {
            let at = NODE_BODY_OFFSET + index * INTERNAL_ENTRY_SIZE;
            keys.push(read_i64(page, at));
            children.push(read_i64(page, at + 8));
        }
        Ok(Node::Internal(InternalNode { keys, children }))
    }
}

pub(crate) fn write_leaf(
    pool: &BufferPoolManager,
    page_id: PageId,
    leaf: &LeafNode,
) -> QueryResult<()> {
    {
        let mut guard = fetch(pool, page_id)?;
        guard.convert_to_index_page(true);
        guard.set_prev_leaf(leaf.prev_leaf);
        guard.set_next_leaf(leaf.next_leaf);
        guard.set_record_count(leaf.entries.len() as u16);
        for (index, (key, ptr)) in leaf.entries.iter().enumerate() {
            let at = NODE_BODY_OFFSET + index * LEAF_ENTRY_SIZE;
            write_i64(&mut guard, at, *key);
            write_i64(&mut guard, at + 8, ptr.page_id);
            write_u16(&mut guard, at + 16, ptr.slot);
        }
        guard.update_checksum();
    }
    pool.unpin_page(page_id, true)?;
    Ok(())
}

pub(crate) fn write_internal(
    pool: &BufferPoolManager,
    page_id: PageId,
    internal: &InternalNode,
) -> QueryResult<()> {
    if internal.children.len() != internal.keys.len() + 1 {
        return Err(QueryError::corrupted(format!(
            "internal node {page_id} child count mismatch"
        )));
    }
    {
        let mut guard = fetch(pool, page_id)?;
        guard.convert_to_index_page(false);
        guard.set_next_page(internal.children[0]);
        guard.set_record_count(internal.keys.len() as u16);
        for (index, key) in internal.keys.iter().enumerate() {
            let at = NODE_BODY_OFFSET + index * INTERNAL_ENTRY_SIZE;
            write_i64(&mut guard, at, *key);
            write_i64(&mut guard, at + 8, internal.children[index + 1]);
        }
        guard.update_checksum();
    }
    pool.unpin_page(page_id, true)?;
    Ok(())
}

fn read_u16(page: &Page, offset: usize) -> u16 {
    let bytes = page.read_bytes(offset, 2).unwrap_or(&[0, 0]);
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn write_u16(page: &mut Page, offset: usize, value: u16) {
    page.write_bytes(offset, &value.to_le_bytes());
}

fn read_u8(page: &Page, offset: usize) -> u8 {
    page.read_bytes(offset, 1).map(|bytes| bytes[0]).unwrap_or(0)
}

fn write_u8(page: &mut Page, offset: usize, value: u8) {
    page.write_bytes(offset, &[value]);
}

fn read_u32(page: &Page, offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    if let Some(slice) = page.read_bytes(offset, 4) {
        bytes.copy_from_slice(slice);
    }
    u32::from_le_bytes(bytes)
}

fn write_u32(page: &mut Page, offset: usize, value: u32) {
    page.write_bytes(offset, &value.to_le_bytes());
}

fn read_u64(page: &Page, offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    if let Some(slice) = page.read_bytes(offset, 8) {
        bytes.copy_from_slice(slice);
    }
    u64::from_le_bytes(bytes)
}

fn write_u64(page: &mut Page, offset: usize, value: u64) {
    page.write_bytes(offset, &value.to_le_bytes());
}

fn read_i64(page: &Page, offset: usize) -> i64 {
    read_u64(page, offset) as i64
}

fn write_i64(page: &mut Page, offset: usize, value: i64) {
    write_u64(page, offset, value as u64);
}
