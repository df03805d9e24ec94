//! Bottom-up B+ tree construction from sorted entries.
//!
//! Leaves are packed to `max_keys · fill_factor` entries and chained; each
//! upper level groups up to `max_keys + 1` children per parent, the i-th
//! separator being the smallest key in child i+1's subtree. The level that
//! ends up with a single node is the root.

use storage::{BufferPoolManager, PageId, RecordPtr, INVALID_PAGE_ID};

use super::btree::{allocate_node, write_internal, write_leaf, InternalNode, LeafNode};
use crate::error::QueryResult;

pub const DEFAULT_FILL_FACTOR: f64 = 0.85;

/// Builds a fresh tree from accumulated entries.
pub struct BulkLoader {
    pool: BufferPoolManager,
    max_keys: usize,
    fill_factor: f64,
    entries: Vec<(i64, RecordPtr)>,
}

impl BulkLoader {
    pub fn new(pool: BufferPoolManager, max_keys: usize) -> Self {
        Self::with_fill_factor(pool, max_keys, DEFAULT_FILL_FACTOR)
    }

    pub fn with_fill_factor(pool: BufferPoolManager, max_keys: usize, fill_factor: f64) -> Self {
        let fill_factor = if fill_factor > 0.0 && fill_factor <= 1.0 {
            fill_factor
        } else {
            DEFAULT_FILL_FACTOR
        };
        Self {
            pool,
            max_keys,
            fill_factor,
            entries: Vec::new(),
        }
    }

    pub fn fill_factor(&self) -> f64 {
        self.fill_factor
    }

    pub fn add_entry(&mut self, key: i64, ptr: RecordPtr) {
        self.entries.push((key, ptr));
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Sorts the accumulated entries and builds the tree, returning the root
    /// page id.
    pub fn build(mut self) -> QueryResult<PageId> {
        self.entries.sort_by_key(|(key, _)| *key);
        let entries = std::mem::take(&mut self.entries);
        self.build_from_sorted(entries)
    }

    /// Builds from an already-sorted sequence.
    pub(crate) fn build_from_sorted(&self, entries: Vec<(i64, RecordPtr)>) -> QueryResult<PageId> {
        if entries.is_empty() {
            let root = allocate_node(&self.pool)?;
            write_leaf(&self.pool, root, &LeafNode::empty())?;
            return Ok(root);
        }

        let per_leaf = ((self.max_keys as f64 * self.fill_factor).ceil() as usize)
            .clamp(1, self.max_keys);
        let chunks: Vec<&[(i64, RecordPtr)]> = entries.chunks(per_leaf).collect();
        let mut ids = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            ids.push(allocate_node(&self.pool)?);
        }

        // Level 0: packed leaves linked into the chain.
        let mut level: Vec<(PageId, i64)> = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let leaf = LeafNode {
                prev_leaf: if index > 0 {
                    ids[index - 1]
                } else {
                    INVALID_PAGE_ID
                },
                next_leaf: if index + 1 < ids.len() {
                    ids[index + 1]
                } else {
                    INVALID_PAGE_ID
                },
                entries: chunk.to_vec(),
            };
            write_leaf(&self.pool, ids[index], &leaf)?;
            level.push((ids[index], chunk[0].0));
        }

        // Upper levels until a single node remains. A parent of C children
        // carries C − 1 keys, so a non-root parent needs at least
        // min_keys + 1 children. Taking a full group when the remainder
        // falls short of that would emit an under-filled trailing parent;
        // the last two groups split evenly instead, and a full fanout is
        // wide enough that both halves always reach the floor.
        let fanout = self.max_keys + 1;
        let min_children = self.max_keys / 2 + 1;
        while level.len() > 1 {
            let mut next_level = Vec::new();
            let mut rest: &[(PageId, i64)] = &level;
            while !rest.is_empty() {
                let take = if rest.len() <= fanout {
                    rest.len()
                } else if rest.len() < fanout + min_children {
                    rest.len() - rest.len() / 2
                } else {
                    fanout
                };
                let (group, remainder) = rest.split_at(take);
                let parent_id = allocate_node(&self.pool)?;
                let keys = group.iter().skip(1).map(|(_, min_key)| *min_key).collect();
                let children = group.iter().map(|(page_id, _)| *page_id).collect();
                write_internal(&self.pool, parent_id, &InternalNode { keys, children })?;
                next_level.push((parent_id, group[0].1));
                rest = remainder;
            }
            level = next_level;
        }
        Ok(level[0].0)
    }
}
