//! Extensible hash index from string keys to record pointers.
//!
//! Each bucket owns a home page; entries are ordinary records in that page,
//! spilling into overflow pages chained through `next_page`. All bucket
//! pages are overflow-typed, which keeps them distinguishable from record
//! data pages when indexes are reconstructed. The bucket array doubles when
//! the load factor passes 0.75 and halves below 0.25 (never under the
//! initial 16), rehashing every entry and freeing the old pages.

use log::warn;
use serde::{Deserialize, Serialize};
use storage::{
    BufferPoolManager, PageId, PageType, Record, RecordPtr, INVALID_PAGE_ID, PAGE_BODY_SIZE,
};

use crate::error::{QueryError, QueryResult};

pub const INITIAL_BUCKET_COUNT: usize = 16;
const LOAD_FACTOR_GROW: f64 = 0.75;
const LOAD_FACTOR_SHRINK: f64 = 0.25;

// Directory entry plus slack the page needs beyond the entry payload.
const ENTRY_OVERHEAD: usize = 16;

/// One bucket of the directory: its home page and entry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashBucket {
    pub page_id: PageId,
    pub entry_count: usize,
    pub overflow_count: usize,
}

/// Unordered secondary index. Unsuitable for range or prefix queries, which
/// the query layer routes to the B+ tree instead.
pub struct HashIndex {
    pool: BufferPoolManager,
    buckets: Vec<HashBucket>,
    entry_count: usize,
}

impl HashIndex {
    pub fn new(pool: BufferPoolManager) -> QueryResult<Self> {
        Self::with_bucket_count(pool, INITIAL_BUCKET_COUNT)
    }

    pub fn with_bucket_count(pool: BufferPoolManager, bucket_count: usize) -> QueryResult<Self> {
        let mut buckets = Vec::with_capacity(bucket_count.max(1));
        for _ in 0..bucket_count.max(1) {
            let page_id = allocate_page(&pool, PageType::Overflow)?;
            buckets.push(HashBucket {
                page_id,
                entry_count: 0,
                overflow_count: 0,
            });
        }
        Ok(Self {
            pool,
            buckets,
            entry_count: 0,
        })
    }

    /// Restores an index from a persisted bucket directory.
    pub fn from_directory(
        pool: BufferPoolManager,
        buckets: Vec<HashBucket>,
        entry_count: usize,
    ) -> Self {
        Self {
            pool,
            buckets,
            entry_count,
        }
    }

    pub fn directory(&self) -> &[HashBucket] {
        &self.buckets
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn load_factor(&self) -> f64 {
        self.entry_count as f64 / self.buckets.len() as f64
    }

    /// Inserts an entry. Oversized keys whose entry cannot fit in one page
    /// are rejected rather than truncated.
    pub fn insert(&mut self, key: &str, ptr: RecordPtr) -> QueryResult<()> {
        let record = entry_record(key, ptr);
        if record.serialize().len() + ENTRY_OVERHEAD > PAGE_BODY_SIZE {
            return Err(QueryError::KeyTooLarge);
        }
        let bucket_index = self.bucket_index(hash_key(key));
        self.insert_entry(bucket_index, &record)?;
        self.buckets[bucket_index].entry_count += 1;
        self.entry_count += 1;
        if self.load_factor() > LOAD_FACTOR_GROW {
            let target = self.buckets.len() * 2;
            self.resize(target)?;
        }
        Ok(())
    }

    /// Every pointer stored under `key`. The stored hash is compared first
    /// so non-matching records are skipped without a key comparison.
    pub fn find(&self, key: &str) -> QueryResult<Vec<RecordPtr>> {
        let hash = hash_key(key);
        let bucket = &self.buckets[self.bucket_index(hash)];
        let mut results = Vec::new();
        for page_id in self.chain_pages(bucket.page_id)? {
            let records = {
                let guard = self.pool.fetch_page(page_id)?;
                guard.live_records()
            };
            self.pool.unpin_page(page_id, false)?;
            for (_slot, record) in records {
                match parse_entry(&record) {
                    Some((stored_key, stored_ptr, stored_hash)) => {
                        if stored_hash == hash && stored_key == key {
                            results.push(stored_ptr);
                        }
                    }
                    None => warn!("skipping unparsable hash entry in page {page_id}"),
                }
            }
        }
        Ok(results)
    }

    /// Deletes the first entry matching hash, key and the exact pointer.
    pub fn remove(&mut self, key: &str, ptr: RecordPtr) -> QueryResult<bool> {
        let hash = hash_key(key);
        let bucket_index = self.bucket_index(hash);
        let pages = self.chain_pages(self.buckets[bucket_index].page_id)?;
        for page_id in pages {
            let removed = {
                let mut guard = self.pool.fetch_page(page_id)?;
                let found = guard.live_records().into_iter().find(|(_, record)| {
                    parse_entry(record).is_some_and(|(stored_key, stored_ptr, stored_hash)| {
                        stored_hash == hash && stored_key == key && stored_ptr == ptr
                    })
                });
                match found {
                    Some((slot, _)) => guard.remove_record(slot),
                    None => false,
                }
            };
            self.pool.unpin_page(page_id, removed)?;
            if removed {
                self.buckets[bucket_index].entry_count =
                    self.buckets[bucket_index].entry_count.saturating_sub(1);
                self.entry_count = self.entry_count.saturating_sub(1);
                if self.should_shrink() {
                    let target = self.buckets.len() / 2;
                    self.resize(target)?;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Rebuilds the directory at `new_bucket_count`, rehashing every entry
    /// and freeing every old home and overflow page.
    pub fn resize(&mut self, new_bucket_count: usize) -> QueryResult<()> {
        let new_bucket_count = new_bucket_count.max(1);
        let mut old_pages = Vec::new();
        let mut entries = Vec::new();
        for bucket in &self.buckets {
            for page_id in self.chain_pages(bucket.page_id)? {
                let records = {
                    let guard = self.pool.fetch_page(page_id)?;
                    guard.live_records()
                };
                self.pool.unpin_page(page_id, false)?;
                for (_slot, record) in records {
                    match parse_entry(&record) {
                        Some((key, ptr, _)) => entries.push((key, ptr)),
                        None => warn!("dropping unparsable hash entry during resize"),
                    }
                }
                old_pages.push(page_id);
            }
        }

        let mut buckets = Vec::with_capacity(new_bucket_count);
        for _ in 0..new_bucket_count {
            let page_id = allocate_page(&self.pool, PageType::Overflow)?;
            buckets.push(HashBucket {
                page_id,
                entry_count: 0,
                overflow_count: 0,
            });
        }
        self.buckets = buckets;
        self.entry_count = 0;

        for (key, ptr) in entries {
            let record = entry_record(&key, ptr);
            let bucket_index = self.bucket_index(hash_key(&key));
            self.insert_entry(bucket_index, &record)?;
            self.buckets[bucket_index].entry_count += 1;
            self.entry_count += 1;
        }

        for page_id in old_pages {
            self.pool.free_page(page_id)?;
        }
        Ok(())
    }

    fn should_shrink(&self) -> bool {
        self.buckets.len() > INITIAL_BUCKET_COUNT && self.load_factor() < LOAD_FACTOR_SHRINK
    }

    fn bucket_index(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    /// Places a record in the bucket's home page or the first overflow page
    /// with room, allocating and linking a new overflow page when the whole
    /// chain is full.
    fn insert_entry(&mut self, bucket_index: usize, record: &Record) -> QueryResult<()> {
        let mut current = self.buckets[bucket_index].page_id;
        loop {
            let (placed, next) = {
                let mut guard = self.pool.fetch_page(current)?;
                let placed = guard.add_record(record).is_some();
                (placed, guard.next_page())
            };
            self.pool.unpin_page(current, placed)?;
            if placed {
                return Ok(());
            }
            if next == INVALID_PAGE_ID {
                break;
            }
            current = next;
        }

        let overflow_id = allocate_page(&self.pool, PageType::Overflow)?;
        {
            let mut guard = self.pool.fetch_page(current)?;
            guard.set_next_page(overflow_id);
            guard.update_checksum();
        }
        self.pool.unpin_page(current, true)?;
        self.buckets[bucket_index].overflow_count += 1;

        let placed = {
            let mut guard = self.pool.fetch_page(overflow_id)?;
            guard.add_record(record).is_some()
        };
        self.pool.unpin_page(overflow_id, placed)?;
        if !placed {
            return Err(QueryError::KeyTooLarge);
        }
        Ok(())
    }

    fn chain_pages(&self, start: PageId) -> QueryResult<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut current = start;
        while current != INVALID_PAGE_ID {
            pages.push(current);
            let next = {
                let guard = self.pool.fetch_page(current)?;
                guard.next_page()
            };
            self.pool.unpin_page(current, false)?;
            current = next;
        }
        Ok(pages)
    }
}

/// djb2 over the key bytes.
fn hash_key(key: &str) -> u64 {
    let mut hash: u64 = 5381;
    for byte in key.bytes() {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(byte as u64);
    }
    hash
}

/// Wire form: the key attributes first, then page id, slot and hash. The
/// tail fields parse from the end so keys containing the delimiter survive
/// the round trip.
fn entry_record(key: &str, ptr: RecordPtr) -> Record {
    let hash = hash_key(key);
    Record::new(
        -1,
        vec![
            key.to_string(),
            ptr.page_id.to_string(),
            ptr.slot.to_string(),
            hash.to_string(),
        ],
    )
}

fn parse_entry(record: &Record) -> Option<(String, RecordPtr, u64)> {
    let n = record.attrs.len();
    if n < 4 {
        return None;
    }
    let hash = record.attrs[n - 1].parse::<u64>().ok()?;
    let slot = record.attrs[n - 2].parse::<u16>().ok()?;
    let page_id = record.attrs[n - 3].parse::<PageId>().ok()?;
    let key = record.attrs[..n - 3].join("|");
    Some((key, RecordPtr::new(page_id, slot), hash))
}

fn allocate_page(pool: &BufferPoolManager, page_type: PageType) -> QueryResult<PageId> {
    let page_id = pool.new_page()?;
    {
        let mut guard = pool.fetch_page(page_id)?;
        guard.init(page_id, page_type);
    }
    pool.unpin_page(page_id, true)?;
    pool.unpin_page(page_id, true)?;
    Ok(page_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::FileManager;
    use tempfile::TempDir;

    fn temp_pool(frames: usize) -> (TempDir, BufferPoolManager) {
        let dir = TempDir::new().unwrap();
        let file_manager = FileManager::create(dir.path().join("hash.db")).unwrap();
        (dir, BufferPoolManager::new(file_manager, frames))
    }

    fn ptr(page_id: PageId, slot: u16) -> RecordPtr {
        RecordPtr::new(page_id, slot)
    }

    #[test]
    fn djb2_matches_reference_values() {
        // h = ((h << 5) + h) + c, seeded with 5381.
        assert_eq!(hash_key(""), 5381);
        assert_eq!(hash_key("a"), 5381u64 * 33 + 97);
        assert_eq!(hash_key("ab"), (5381u64 * 33 + 97) * 33 + 98);
    }

    #[test]
    fn insert_find_remove_round_trip() {
        let (_dir, pool) = temp_pool(32);
        let mut index = HashIndex::new(pool).unwrap();
        index.insert("alpha", ptr(3, 0)).unwrap();
        index.insert("beta", ptr(3, 1)).unwrap();
        assert_eq!(index.find("alpha").unwrap(), vec![ptr(3, 0)]);
        assert_eq!(index.find("missing").unwrap(), Vec::<RecordPtr>::new());

        // Removal requires the exact pointer.
        assert!(!index.remove("alpha", ptr(3, 9)).unwrap());
        assert!(index.remove("alpha", ptr(3, 0)).unwrap());
        assert!(index.find("alpha").unwrap().is_empty());
        assert_eq!(index.entry_count(), 1);
    }

    #[test]
    fn keys_containing_the_delimiter_survive() {
        let (_dir, pool) = temp_pool(32);
        let mut index = HashIndex::new(pool).unwrap();
        index.insert("odd|key|name", ptr(5, 2)).unwrap();
        assert_eq!(index.find("odd|key|name").unwrap(), vec![ptr(5, 2)]);
        assert!(index.find("odd").unwrap().is_empty());
    }

    #[test]
    fn oversized_key_is_rejected() {
        let (_dir, pool) = temp_pool(32);
        let mut index = HashIndex::new(pool).unwrap();
        let huge = "k".repeat(PAGE_BODY_SIZE);
        assert!(matches!(
            index.insert(&huge, ptr(1, 0)),
            Err(QueryError::KeyTooLarge)
        ));
    }

    #[test]
    fn overflow_chain_is_searchable() {
        let (_dir, pool) = temp_pool(64);
        let mut index = HashIndex::with_bucket_count(pool, 1).unwrap();
        // Push entries straight into the single bucket, bypassing the
        // resize trigger, until overflow pages must appear.
        for value in 0..400u16 {
            let record = entry_record(&format!("key-{value:04}"), ptr(1, value));
            index.insert_entry(0, &record).unwrap();
            index.buckets[0].entry_count += 1;
            index.entry_count += 1;
        }
        assert!(index.buckets[0].overflow_count > 0);
        for value in (0..400u16).step_by(37) {
            assert_eq!(
                index.find(&format!("key-{value:04}")).unwrap(),
                vec![ptr(1, value)]
            );
        }
    }

    #[test]
    fn grow_resize_preserves_entries() {
        let (_dir, pool) = temp_pool(64);
        let mut index = HashIndex::new(pool).unwrap();
        for value in 0..13 {
            index.insert(&format!("user-{value}"), ptr(2, value)).unwrap();
        }
        // 13 / 16 > 0.75 doubled the directory.
        assert_eq!(index.bucket_count(), 32);
        for value in 0..13 {
            assert_eq!(
                index.find(&format!("user-{value}")).unwrap(),
                vec![ptr(2, value)]
            );
        }
    }

    #[test]
    fn shrink_stops_at_initial_bucket_count() {
        let (_dir, pool) = temp_pool(64);
        let mut index = HashIndex::new(pool).unwrap();
        for value in 0..13 {
            index.insert(&format!("user-{value}"), ptr(2, value)).unwrap();
        }
        assert_eq!(index.bucket_count(), 32);
        for value in 0..13 {
            assert!(index.remove(&format!("user-{value}"), ptr(2, value)).unwrap());
        }
        assert_eq!(index.bucket_count(), 16);
        assert_eq!(index.entry_count(), 0);
    }
}
