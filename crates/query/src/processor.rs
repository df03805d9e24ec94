//! Index-aware query path: point, range, insert, delete and update
//! operations over the primary B+ tree, with an optional hash index for
//! exact-match lookups, per-operation latency tracking and index health
//! accounting that drives rebuilds.

use std::time::Instant;

use log::{info, warn};
use storage::{BufferPoolManager, PageId, PageType, Record, RecordPtr, INVALID_PAGE_ID};
use wal::{LogOperation, TransactionManager, TxnId};

use crate::error::{QueryError, QueryResult};
use crate::index::{BPlusTree, HashIndex};
use crate::selector::{IndexSelector, IndexType};

pub const REBUILD_FRAGMENTATION_THRESHOLD: f64 = 0.3;
pub const REBUILD_DELETE_RATIO_THRESHOLD: f64 = 0.4;
const REBUILD_FILL_FACTOR: f64 = 0.85;

/// Comparison operator of a `field op value` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "=" => Some(CompareOp::Eq),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Le),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Ge),
            _ => None,
        }
    }
}

/// Cumulative latency statistics, microseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryStats {
    pub total_queries: u64,
    pub total_access_time_us: f64,
    pub avg_access_time_us: f64,
}

/// Counters backing the rebuild decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexHealth {
    pub total_operations: u64,
    pub delete_operations: u64,
    pub fragmentation_ratio: f64,
}

impl IndexHealth {
    pub fn delete_ratio(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.delete_operations as f64 / self.total_operations as f64
    }
}

/// Executes queries against the primary tree (and hash index, when one is
/// attached) and stores record payloads on data pages.
pub struct QueryProcessor {
    pool: BufferPoolManager,
    tree: BPlusTree,
    name: String,
    hash: Option<(String, HashIndex)>,
    selector: IndexSelector,
    stats: QueryStats,
    health: IndexHealth,
    data_pages: Vec<PageId>,
    active_data_page: PageId,
}

impl QueryProcessor {
    pub fn new(pool: BufferPoolManager, tree: BPlusTree, name: impl Into<String>) -> Self {
        Self {
            pool,
            tree,
            name: name.into(),
            hash: None,
            selector: IndexSelector::new(),
            stats: QueryStats::default(),
            health: IndexHealth::default(),
            data_pages: Vec::new(),
            active_data_page: INVALID_PAGE_ID,
        }
    }

    /// Registers a hash index over the primary key's string form; exact
    /// matches are routed to it from then on.
    pub fn attach_hash_index(&mut self, name: impl Into<String>, index: HashIndex) {
        self.hash = Some((name.into(), index));
    }

    pub fn index_name(&self) -> &str {
        &self.name
    }

    pub fn hash_index_name(&self) -> Option<&str> {
        self.hash.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn hash_index(&self) -> Option<&HashIndex> {
        self.hash.as_ref().map(|(_, index)| index)
    }

    pub fn tree(&self) -> &BPlusTree {
        &self.tree
    }

    pub fn stats(&self) -> QueryStats {
        self.stats
    }

    pub fn health(&self) -> IndexHealth {
        self.health
    }

    pub fn data_pages(&self) -> &[PageId] {
        &self.data_pages
    }

    /// Stores the record and indexes it under `key`. Inserting an existing
    /// key replaces the stored record, keeping both indexes aligned.
    pub fn insert(&mut self, key: &str, record: Record) -> QueryResult<bool> {
        let started = Instant::now();
        let parsed = parse_key(key)?;
        let existing = self.tree.find(parsed)?;
        let ptr = self.store_record(&record)?;
        self.tree.insert(parsed, ptr)?;
        if let Some((_, hash)) = &mut self.hash {
            if existing.is_valid() {
                hash.remove(key, existing)?;
            }
            hash.insert(key, ptr)?;
        }
        if existing.is_valid() {
            self.remove_stored_record(existing)?;
        }
        self.note_operation(false);
        self.observe_latency(started);
        Ok(true)
    }

    /// Removes the key from every index and frees the record's slot.
    /// Returns false for an absent key.
    pub fn delete(&mut self, key: &str) -> QueryResult<bool> {
        let started = Instant::now();
        let parsed = parse_key(key)?;
        let ptr = self.tree.find(parsed)?;
        if !ptr.is_valid() {
            self.observe_latency(started);
            return Ok(false);
        }
        self.tree.remove(parsed)?;
        self.remove_stored_record(ptr)?;
        if let Some((_, hash)) = &mut self.hash {
            hash.remove(key, ptr)?;
        }
        self.note_operation(true);
        self.observe_latency(started);
        Ok(true)
    }

    /// Evaluates a `field op value` condition. Equality is a point lookup
    /// (through the hash index when the selector picks it); `>`/`>=` scan
    /// up to the maximum key and `<`/`<=` down from the minimum.
    pub fn select(&mut self, condition: &str) -> QueryResult<Vec<Record>> {
        let started = Instant::now();
        let (op, value_text, key) = parse_condition(condition)?;
        let pointers = match op {
            CompareOp::Eq => {
                let characteristics = self.selector.analyze_condition(condition);
                let choice = self
                    .selector
                    .select_best_index(&characteristics, self.hash.is_some());
                if let (IndexType::Hash, Some((_, hash))) = (choice, self.hash.as_ref()) {
                    hash.find(&value_text)?
                } else {
                    let ptr = self.tree.find(key)?;
                    if ptr.is_valid() {
                        vec![ptr]
                    } else {
                        Vec::new()
                    }
                }
            }
            CompareOp::Gt | CompareOp::Ge => match self.tree.max()? {
                Some(max_key) => collect_pointers(self.tree.range(key, max_key)?),
                None => Vec::new(),
            },
            CompareOp::Lt | CompareOp::Le => match self.tree.min()? {
                Some(min_key) => collect_pointers(self.tree.range(min_key, key)?),
                None => Vec::new(),
            },
        };
        let mut results = Vec::with_capacity(pointers.len());
        for ptr in pointers {
            results.push(self.fetch_record(ptr)?);
        }
        self.observe_latency(started);
        Ok(results)
    }

    /// Replaces the record stored under `key`. The key stays in place; the
    /// tree entry is re-pointed at the new record location.
    pub fn update(&mut self, key: &str, new_record: Record) -> QueryResult<bool> {
        let started = Instant::now();
        let parsed = parse_key(key)?;
        let old_ptr = self.tree.find(parsed)?;
        if !old_ptr.is_valid() {
            self.observe_latency(started);
            return Ok(false);
        }
        let new_ptr = self.store_record(&new_record)?;
        self.tree.remove(parsed)?;
        self.tree.insert(parsed, new_ptr)?;
        self.remove_stored_record(old_ptr)?;
        if let Some((_, hash)) = &mut self.hash {
            hash.remove(key, old_ptr)?;
            hash.insert(key, new_ptr)?;
        }
        self.note_operation(false);
        self.observe_latency(started);
        Ok(true)
    }

    /// Ascending records for all keys in `[lo, hi]`.
    pub fn range_select(&mut self, lo: i64, hi: i64) -> QueryResult<Vec<Record>> {
        let started = Instant::now();
        let entries = self.tree.range(lo, hi)?;
        let mut results = Vec::with_capacity(entries.len());
        for (_, ptr) in entries {
            results.push(self.fetch_record(ptr)?);
        }
        self.observe_latency(started);
        Ok(results)
    }

    // --- WAL-logged mutations ---

    /// Insert that journals the operation inside `txn` before touching the
    /// indexes. The payload records the target slot so replay is idempotent.
    /// An existing key is journaled as a delete of the old record first.
    pub fn insert_logged(
        &mut self,
        txns: &TransactionManager,
        txn: TxnId,
        key: &str,
        record: Record,
    ) -> QueryResult<bool> {
        let started = Instant::now();
        let parsed = parse_key(key)?;
        let existing = self.tree.find(parsed)?;
        if existing.is_valid() {
            let old_record = self.fetch_record(existing)?;
            let old_value = format_value(existing, &old_record);
            let lsn =
                txns.log_operation(txn, existing.page_id, LogOperation::Delete, &old_value, "")?;
            self.stamp_page_lsn(existing.page_id, lsn)?;
            self.remove_stored_record(existing)?;
            if let Some((_, hash)) = &mut self.hash {
                hash.remove(key, existing)?;
            }
        }
        let ptr = self.store_record(&record)?;
        let value = format_value(ptr, &record);
        let lsn = txns.log_operation(txn, ptr.page_id, LogOperation::Insert, "", &value)?;
        self.stamp_page_lsn(ptr.page_id, lsn)?;
        self.tree.insert(parsed, ptr)?;
        if let Some((_, hash)) = &mut self.hash {
            hash.insert(key, ptr)?;
        }
        self.note_operation(false);
        self.observe_latency(started);
        Ok(true)
    }

    /// Delete journaled inside `txn`; the old value is kept for undo.
    pub fn delete_logged(
        &mut self,
        txns: &TransactionManager,
        txn: TxnId,
        key: &str,
    ) -> QueryResult<bool> {
        let started = Instant::now();
        let parsed = parse_key(key)?;
        let ptr = self.tree.find(parsed)?;
        if !ptr.is_valid() {
            self.observe_latency(started);
            return Ok(false);
        }
        let old_record = self.fetch_record(ptr)?;
        let value = format_value(ptr, &old_record);
        let lsn = txns.log_operation(txn, ptr.page_id, LogOperation::Delete, &value, "")?;
        self.stamp_page_lsn(ptr.page_id, lsn)?;
        self.tree.remove(parsed)?;
        self.remove_stored_record(ptr)?;
        if let Some((_, hash)) = &mut self.hash {
            hash.remove(key, ptr)?;
        }
        self.note_operation(true);
        self.observe_latency(started);
        Ok(true)
    }

    /// Update journaled inside `txn`. When the new payload fits the old
    /// slot the record is rewritten in place under a single UPDATE record;
    /// otherwise the change degrades to a logged delete plus insert.
    pub fn update_logged(
        &mut self,
        txns: &TransactionManager,
        txn: TxnId,
        key: &str,
        new_record: Record,
    ) -> QueryResult<bool> {
        let started = Instant::now();
        let parsed = parse_key(key)?;
        let ptr = self.tree.find(parsed)?;
        if !ptr.is_valid() {
            self.observe_latency(started);
            return Ok(false);
        }
        let old_record = self.fetch_record(ptr)?;
        let rewrote = {
            let mut guard = self.pool.fetch_page(ptr.page_id)?;
            match guard.update_record(ptr.slot, &new_record) {
                Ok(()) => true,
                Err(storage::StorageError::PageOutOfSpace) => false,
                Err(err) => {
                    drop(guard);
                    self.pool.unpin_page(ptr.page_id, false)?;
                    return Err(err.into());
                }
            }
        };
        self.pool.unpin_page(ptr.page_id, rewrote)?;

        if rewrote {
            let old_value = format_value(ptr, &old_record);
            let new_value = format_value(ptr, &new_record);
            let lsn = txns.log_operation(
                txn,
                ptr.page_id,
                LogOperation::Update,
                &old_value,
                &new_value,
            )?;
            self.stamp_page_lsn(ptr.page_id, lsn)?;
            self.note_operation(false);
            self.observe_latency(started);
            return Ok(true);
        }

        self.delete_logged(txns, txn, key)?;
        self.insert_logged(txns, txn, key, new_record)?;
        self.observe_latency(started);
        Ok(true)
    }

    // --- health and rebuild ---

    /// Refreshes the fragmentation component of the health block from the
    /// data pages this processor has filled.
    pub fn refresh_health(&mut self) -> QueryResult<IndexHealth> {
        if !self.data_pages.is_empty() {
            let mut total = 0.0;
            for page_id in self.data_pages.clone() {
                let ratio = {
                    let guard = self.pool.fetch_page(page_id)?;
                    guard.fragmentation_ratio()
                };
                self.pool.unpin_page(page_id, false)?;
                total += ratio;
            }
            self.health.fragmentation_ratio = total / self.data_pages.len() as f64;
        }
        Ok(self.health)
    }

    /// True when fragmentation or the delete ratio crossed its threshold.
    pub fn needs_rebuild(&self) -> bool {
        self.health.fragmentation_ratio > REBUILD_FRAGMENTATION_THRESHOLD
            || self.health.delete_ratio() > REBUILD_DELETE_RATIO_THRESHOLD
    }

    /// Rebuilds the primary tree by bulk-loading its entries at the target
    /// fill factor, then resets the health counters.
    pub fn rebuild_index(&mut self) -> QueryResult<()> {
        let entries = self.tree.entries()?;
        info!(
            "rebuilding index {} with {} entries",
            self.name,
            entries.len()
        );
        self.tree.bulk_replace(entries, REBUILD_FILL_FACTOR)?;
        self.health = IndexHealth::default();
        Ok(())
    }

    /// Maintenance entry point used by the coordinator: rebuild the tree or
    /// resize the named hash index. Unknown names are reported, not fatal.
    pub fn maintain_index(&mut self, name: &str) -> QueryResult<bool> {
        if name == self.name {
            self.rebuild_index()?;
            return Ok(true);
        }
        if let Some((hash_name, hash)) = &mut self.hash {
            if name == hash_name {
                let target = (hash.entry_count() * 2).max(crate::index::INITIAL_BUCKET_COUNT);
                hash.resize(target)?;
                return Ok(true);
            }
        }
        warn!("maintenance requested for unknown index {name}");
        Ok(false)
    }

    // --- record storage ---

    /// Reads the record a pointer refers to.
    pub fn fetch_record(&self, ptr: RecordPtr) -> QueryResult<Record> {
        let record = {
            let guard = self.pool.fetch_page(ptr.page_id)?;
            guard.get_record(ptr.slot)
        };
        self.pool.unpin_page(ptr.page_id, false)?;
        Ok(record?)
    }

    /// Places a record on the active data page, allocating a fresh page
    /// when it is full.
    fn store_record(&mut self, record: &Record) -> QueryResult<RecordPtr> {
        if self.active_data_page != INVALID_PAGE_ID {
            let slot = {
                let mut guard = self.pool.fetch_page(self.active_data_page)?;
                guard.add_record(record)
            };
            self.pool
                .unpin_page(self.active_data_page, slot.is_some())?;
            if let Some(slot) = slot {
                return Ok(RecordPtr::new(self.active_data_page, slot));
            }
        }

        let page_id = self.pool.new_page()?;
        let slot = {
            let mut guard = self.pool.fetch_page(page_id)?;
            guard.init(page_id, PageType::Data);
            guard.add_record(record)
        };
        self.pool.unpin_page(page_id, true)?;
        self.pool.unpin_page(page_id, true)?;
        let slot = slot.ok_or(QueryError::Storage(
            storage::StorageError::PageOutOfSpace,
        ))?;
        self.data_pages.push(page_id);
        self.active_data_page = page_id;
        Ok(RecordPtr::new(page_id, slot))
    }

    fn remove_stored_record(&self, ptr: RecordPtr) -> QueryResult<()> {
        let removed = {
            let mut guard = self.pool.fetch_page(ptr.page_id)?;
            guard.remove_record(ptr.slot)
        };
        self.pool.unpin_page(ptr.page_id, removed)?;
        Ok(())
    }

    fn stamp_page_lsn(&self, page_id: PageId, lsn: wal::Lsn) -> QueryResult<()> {
        {
            let mut guard = self.pool.fetch_page(page_id)?;
            if lsn > guard.lsn() {
                guard.set_lsn(lsn);
                guard.update_checksum();
            }
        }
        self.pool.unpin_page(page_id, true)?;
        Ok(())
    }

    fn note_operation(&mut self, is_delete: bool) {
        self.health.total_operations += 1;
        if is_delete {
            self.health.delete_operations += 1;
        }
    }

    fn observe_latency(&mut self, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64() * 1_000_000.0;
        self.stats.total_queries += 1;
        self.stats.total_access_time_us += elapsed;
        self.stats.avg_access_time_us =
            self.stats.total_access_time_us / self.stats.total_queries as f64;
    }
}

/// Journal payload for one record operation: the slot identity followed by
/// the record id and its wire form.
pub(crate) fn format_value(ptr: RecordPtr, record: &Record) -> String {
    format!(
        "{},{},{},{}",
        ptr.page_id,
        ptr.slot,
        record.id,
        record.serialize()
    )
}

/// Inverse of `format_value`.
pub(crate) fn parse_value(value: &str) -> Option<(RecordPtr, Record)> {
    let mut parts = value.splitn(4, ',');
    let page_id = parts.next()?.parse::<PageId>().ok()?;
    let slot = parts.next()?.parse::<u16>().ok()?;
    let id = parts.next()?.parse::<i64>().ok()?;
    let payload = parts.next()?;
    Some((
        RecordPtr::new(page_id, slot),
        Record::deserialize(id, payload),
    ))
}

fn parse_key(key: &str) -> QueryResult<i64> {
    key.trim()
        .parse::<i64>()
        .map_err(|_| QueryError::parse(0, format!("invalid key {key:?}")))
}

/// Parses `field op value`, reporting the character offset of the failing
/// token.
fn parse_condition(condition: &str) -> QueryResult<(CompareOp, String, i64)> {
    let mut tokens: Vec<(usize, &str)> = Vec::new();
    let mut start: Option<usize> = None;
    for (index, c) in condition.char_indices() {
        if c.is_whitespace() {
            if let Some(from) = start.take() {
                tokens.push((from, &condition[from..index]));
            }
        } else if start.is_none() {
            start = Some(index);
        }
    }
    if let Some(from) = start {
        tokens.push((from, &condition[from..]));
    }

    if tokens.len() != 3 {
        return Err(QueryError::parse(
            condition.len(),
            "expected `field op value`",
        ));
    }
    let (op_offset, op_token) = tokens[1];
    let (value_offset, value_token) = tokens[2];
    let op = CompareOp::parse(op_token)
        .ok_or_else(|| QueryError::parse(op_offset, format!("unknown operator {op_token:?}")))?;
    let key = value_token
        .parse::<i64>()
        .map_err(|_| QueryError::parse(value_offset, format!("invalid value {value_token:?}")))?;
    Ok((op, value_token.to_string(), key))
}

fn collect_pointers(entries: Vec<(i64, RecordPtr)>) -> Vec<RecordPtr> {
    entries.into_iter().map(|(_, ptr)| ptr).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_parser_reports_offsets() {
        assert!(parse_condition("id = 10").is_ok());
        let (op, text, key) = parse_condition("id >= 42").unwrap();
        assert_eq!(op, CompareOp::Ge);
        assert_eq!(text, "42");
        assert_eq!(key, 42);

        match parse_condition("id ~ 10") {
            Err(QueryError::Parse { offset, .. }) => assert_eq!(offset, 3),
            other => panic!("expected parse error, got {other:?}"),
        }
        match parse_condition("id = ten") {
            Err(QueryError::Parse { offset, .. }) => assert_eq!(offset, 5),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(parse_condition("id =").is_err());
    }

    #[test]
    fn value_round_trip() {
        // Commas in attributes must survive the slot-prefix framing; the
        // record delimiter itself is reserved and never part of an
        // attribute.
        let record = Record::new(7, vec!["ab".into(), "c,d".into()]);
        let ptr = RecordPtr::new(11, 3);
        let wire = format_value(ptr, &record);
        let (parsed_ptr, parsed_record) = parse_value(&wire).unwrap();
        assert_eq!(parsed_ptr, ptr);
        assert_eq!(parsed_record, record);
    }
}
