//! Wires the storage, WAL, recovery, query and maintenance layers into one
//! embeddable engine. A JSON manifest beside the database file remembers
//! the primary tree's header page and the hash index's bucket directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use query::{
    BPlusTree, HashBucket, HashIndex, IndexHealth, MaintenanceCoordinator, QueryProcessor,
    QueryStats, RecoveryManager,
};
use storage::{BufferPoolManager, FileManager, PageId, Record};
use wal::{LogManager, TransactionManager, TxnId};

const DEFAULT_POOL_SIZE: usize = 64;
const PRIMARY_INDEX: &str = "primary_btree";
const HASH_INDEX: &str = "primary_hash";

#[derive(Serialize, Deserialize)]
struct Manifest {
    primary_index: PageId,
    hash_directory: Vec<HashBucket>,
    hash_entry_count: usize,
}

/// Point-in-time counters for the `stats` command.
pub struct EngineStats {
    pub query_stats: QueryStats,
    pub index_health: IndexHealth,
    pub key_count: u64,
    pub tree_height: usize,
    pub hash_buckets: usize,
    pub hash_entries: usize,
    pub hash_load_factor: f64,
}

pub struct Engine {
    pool: BufferPoolManager,
    log_manager: Arc<LogManager>,
    txn_manager: TransactionManager,
    recovery: RecoveryManager,
    processor: QueryProcessor,
    coordinator: MaintenanceCoordinator,
    manifest_path: PathBuf,
}

impl Engine {
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_pool(db_path, DEFAULT_POOL_SIZE)
    }

    pub fn open_with_pool(db_path: &Path, pool_size: usize) -> Result<Self> {
        let file_manager = FileManager::open_or_create(db_path).context("open database file")?;
        let wal_path = db_path.with_extension("wal");
        let log_manager = Arc::new(LogManager::open(&wal_path).context("open wal file")?);
        let pool = BufferPoolManager::new_with_log(
            file_manager,
            pool_size,
            Some(Arc::clone(&log_manager)),
        );

        let recovery = RecoveryManager::new(&wal_path);
        let report = recovery.recover(&pool).context("crash recovery")?;
        let txn_manager = TransactionManager::new(Arc::clone(&log_manager));
        txn_manager.set_next_txn_id(report.max_txn_id + 1);

        let manifest_path = db_path.with_extension("manifest");
        let total_pages = pool.with_file_manager(|file| file.total_pages());
        // Recovery restores record pages from the log, but index pages are
        // not journaled: whenever replay changed anything, the persisted
        // index state is stale and both indexes are reconstructed from the
        // surviving data pages.
        let replay_changed_pages = report.redone > 0 || report.undone > 0;
        let (tree, hash) = if !manifest_path.exists() && total_pages == 0 {
            let tree = BPlusTree::create(pool.clone(), true)?;
            let hash = HashIndex::new(pool.clone())?;
            pool.with_file_manager(|file| file.set_table_count(1))
                .context("record table count")?;
            (tree, hash)
        } else if !manifest_path.exists() || replay_changed_pages {
            rebuild_indexes(&pool)?
        } else {
            match load_indexes(&pool, &manifest_path) {
                Ok(indexes) => indexes,
                Err(err) => {
                    log::warn!(
                        "persisted index state unreadable ({err:#}); rebuilding from data pages"
                    );
                    rebuild_indexes(&pool)?
                }
            }
        };

        let mut processor = QueryProcessor::new(pool.clone(), tree, PRIMARY_INDEX);
        processor.attach_hash_index(HASH_INDEX, hash);

        let mut engine = Self {
            pool,
            log_manager,
            txn_manager,
            recovery,
            processor,
            coordinator: MaintenanceCoordinator::new(),
            manifest_path,
        };
        engine.write_manifest()?;
        Ok(engine)
    }

    /// Inserts a record under `key`, journaled and committed.
    pub fn insert(&mut self, key: &str, attrs: Vec<String>) -> Result<bool> {
        let id = key.trim().parse::<i64>().unwrap_or_default();
        let record = Record::new(id, attrs);
        let txn = self.txn_manager.begin_transaction()?;
        match self
            .processor
            .insert_logged(&self.txn_manager, txn, key, record)
        {
            Ok(inserted) => {
                self.txn_manager.commit(txn)?;
                Ok(inserted)
            }
            Err(err) => {
                self.rollback(txn)?;
                Err(err.into())
            }
        }
    }

    /// Deletes the record stored under `key`.
    pub fn delete(&mut self, key: &str) -> Result<bool> {
        let txn = self.txn_manager.begin_transaction()?;
        match self.processor.delete_logged(&self.txn_manager, txn, key) {
            Ok(deleted) => {
                self.txn_manager.commit(txn)?;
                Ok(deleted)
            }
            Err(err) => {
                self.rollback(txn)?;
                Err(err.into())
            }
        }
    }

    /// Replaces the record stored under `key`.
    pub fn update(&mut self, key: &str, attrs: Vec<String>) -> Result<bool> {
        let id = key.trim().parse::<i64>().unwrap_or_default();
        let record = Record::new(id, attrs);
        let txn = self.txn_manager.begin_transaction()?;
        match self
            .processor
            .update_logged(&self.txn_manager, txn, key, record)
        {
            Ok(updated) => {
                self.txn_manager.commit(txn)?;
                Ok(updated)
            }
            Err(err) => {
                self.rollback(txn)?;
                Err(err.into())
            }
        }
    }

    /// Evaluates a `field op value` condition.
    pub fn select(&mut self, condition: &str) -> Result<Vec<Record>> {
        Ok(self.processor.select(condition)?)
    }

    /// All records with keys in `[lo, hi]`.
    pub fn range(&mut self, lo: i64, hi: i64) -> Result<Vec<Record>> {
        Ok(self.processor.range_select(lo, hi)?)
    }

    pub fn stats(&mut self) -> Result<EngineStats> {
        let index_health = self.processor.refresh_health()?;
        let key_count = self.processor.tree().len()?;
        let tree_height = self.processor.tree().height()?;
        let (hash_buckets, hash_entries, hash_load_factor) = match self.processor.hash_index() {
            Some(hash) => (hash.bucket_count(), hash.entry_count(), hash.load_factor()),
            None => (0, 0, 0.0),
        };
        Ok(EngineStats {
            query_stats: self.processor.stats(),
            index_health,
            key_count,
            tree_height,
            hash_buckets,
            hash_entries,
            hash_load_factor,
        })
    }

    /// Samples index health, schedules whatever crossed a threshold and
    /// drains the maintenance queue. Returns the maintained index names.
    pub fn maintain(&mut self) -> Result<Vec<String>> {
        let health = self.processor.refresh_health()?;
        let stats = self.processor.stats();
        let avg_access_ms = stats.avg_access_time_us / 1_000.0;
        self.coordinator.observe(
            PRIMARY_INDEX,
            health.fragmentation_ratio,
            health.delete_operations,
            avg_access_ms,
        );
        if let Some(hash) = self.processor.hash_index() {
            // A hash index fragments through its overflow chains.
            let overflow_ratio = if hash.bucket_count() == 0 {
                0.0
            } else {
                hash.directory()
                    .iter()
                    .map(|bucket| bucket.overflow_count as f64)
                    .sum::<f64>()
                    / hash.bucket_count() as f64
            };
            self.coordinator.observe(
                HASH_INDEX,
                overflow_ratio.min(1.0),
                health.delete_operations,
                avg_access_ms,
            );
        }
        self.coordinator.schedule(PRIMARY_INDEX);
        self.coordinator.schedule(HASH_INDEX);
        let performed = self.coordinator.perform_scheduled(&mut self.processor)?;
        if !performed.is_empty() {
            self.write_manifest()?;
        }
        Ok(performed)
    }

    /// Flushes every dirty page, fsyncs the log and rewrites the manifest.
    /// With no transaction in flight every effect is now durable in the
    /// pages themselves, so the log is truncated.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.pool.flush_all_pages().context("flush pages")?;
        self.log_manager.sync().context("sync wal")?;
        if self.txn_manager.active_transactions().is_empty() {
            self.log_manager.truncate().context("truncate wal")?;
        }
        self.write_manifest()
    }

    fn rollback(&mut self, txn: TxnId) -> Result<()> {
        let first_lsn = self.txn_manager.abort(txn)?;
        self.recovery
            .rollback_transaction(&self.pool, txn, first_lsn)?;
        Ok(())
    }

    fn write_manifest(&mut self) -> Result<()> {
        let manifest = Manifest {
            primary_index: self.processor.tree().header_page_id(),
            hash_directory: self
                .processor
                .hash_index()
                .map(|hash| hash.directory().to_vec())
                .unwrap_or_default(),
            hash_entry_count: self
                .processor
                .hash_index()
                .map(|hash| hash.entry_count())
                .unwrap_or_default(),
        };
        let raw = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
        fs::write(&self.manifest_path, raw).context("write manifest")?;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.checkpoint() {
            log::warn!("checkpoint on shutdown failed: {err:#}");
        }
    }
}

fn load_indexes(pool: &BufferPoolManager, manifest_path: &Path) -> Result<(BPlusTree, HashIndex)> {
    let raw = fs::read_to_string(manifest_path).context("read manifest")?;
    let manifest: Manifest = serde_json::from_str(&raw).context("parse manifest")?;
    let tree = BPlusTree::open(pool.clone(), manifest.primary_index)?;
    tree.len().context("validate tree header")?;
    let hash = HashIndex::from_directory(
        pool.clone(),
        manifest.hash_directory,
        manifest.hash_entry_count,
    );
    Ok((tree, hash))
}

/// Reconstructs both indexes by scanning every surviving data page. Records
/// live only on data-typed pages (index nodes and hash buckets carry their
/// own types), so the scan is unambiguous. Leftover index pages from the
/// previous incarnation are returned to the free list first.
fn rebuild_indexes(pool: &BufferPoolManager) -> Result<(BPlusTree, HashIndex)> {
    let total_pages = pool.with_file_manager(|file| file.total_pages()) as PageId;
    let mut recovered: Vec<(storage::RecordPtr, i64)> = Vec::new();
    let mut reclaim = Vec::new();
    for page_id in 0..total_pages {
        let page_type = match pool.fetch_page(page_id) {
            Ok(guard) => {
                let page_type = guard.page_type();
                if page_type == storage::PageType::Data {
                    for (slot, record) in guard.live_records() {
                        recovered.push((storage::RecordPtr::new(page_id, slot), record.id));
                    }
                }
                drop(guard);
                pool.unpin_page(page_id, false)?;
                page_type
            }
            Err(storage::StorageError::Corrupted(_)) => {
                log::warn!("skipping corrupted page {page_id} while rebuilding indexes");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        if matches!(
            page_type,
            storage::PageType::Index | storage::PageType::Overflow
        ) {
            reclaim.push(page_id);
        }
    }
    for page_id in reclaim {
        pool.free_page(page_id)?;
    }

    let tree = BPlusTree::create(pool.clone(), true)?;
    let mut hash = HashIndex::new(pool.clone())?;
    for (ptr, key) in &recovered {
        tree.insert(*key, *ptr)?;
        hash.insert(&key.to_string(), *ptr)?;
    }
    log::info!("rebuilt indexes over {} surviving records", recovered.len());
    Ok((tree, hash))
}
