//! Key distribution statistics over a B+ tree: totals, shape, and an
//! equi-width histogram feeding the selector's cost estimates.

use std::collections::HashMap;

use crate::error::QueryResult;
use crate::index::BPlusTree;

const HISTOGRAM_BUCKETS: usize = 100;

/// Per-key statistics derived from the histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyStats {
    pub frequency: u64,
    pub selectivity: f64,
    pub distinct_values: u64,
    pub avg_range: f64,
}

#[derive(Debug, Clone, Copy)]
struct HistogramBucket {
    min_key: i64,
    max_key: i64,
    count: u64,
}

/// Snapshot statistics; refresh with `update` after heavy churn.
#[derive(Debug, Default)]
pub struct IndexStatistics {
    total_keys: u64,
    unique_keys: u64,
    height: usize,
    page_count: usize,
    average_fill_factor: f64,
    histogram: Vec<HistogramBucket>,
    key_stats_cache: HashMap<i64, KeyStats>,
}

impl IndexStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes every statistic from the current tree contents.
    pub fn update(&mut self, tree: &BPlusTree) -> QueryResult<()> {
        self.histogram.clear();
        self.key_stats_cache.clear();
        self.total_keys = 0;
        self.unique_keys = 0;

        self.height = tree.height()?;
        self.page_count = tree.page_count()?;
        self.average_fill_factor = tree.average_leaf_fill()?;

        let entries = tree.entries()?;
        self.total_keys = entries.len() as u64;
        let mut previous: Option<i64> = None;
        for (key, _) in &entries {
            if previous != Some(*key) {
                self.unique_keys += 1;
            }
            previous = Some(*key);
        }

        let (Some(min_key), Some(max_key)) = (tree.min()?, tree.max()?) else {
            return Ok(());
        };
        self.build_histogram(min_key, max_key);
        for (key, _) in &entries {
            if let Some(bucket_index) = self.bucket_for(*key) {
                self.histogram[bucket_index].count += 1;
            }
        }
        Ok(())
    }

    pub fn total_keys(&self) -> u64 {
        self.total_keys
    }

    pub fn unique_keys(&self) -> u64 {
        self.unique_keys
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn average_fill_factor(&self) -> f64 {
        self.average_fill_factor
    }

    pub fn histogram_bucket_count(&self) -> usize {
        self.histogram.len()
    }

    /// Frequency and selectivity of one key, cached per snapshot.
    pub fn key_stats(&mut self, key: i64) -> KeyStats {
        if let Some(cached) = self.key_stats_cache.get(&key) {
            return *cached;
        }
        let stats = match self.bucket_for(key) {
            Some(index) => {
                let bucket = self.histogram[index];
                let width = (bucket.max_key - bucket.min_key + 1).max(1) as u64;
                let distinct = width.min(bucket.count.max(1));
                KeyStats {
                    frequency: bucket.count,
                    selectivity: if self.total_keys == 0 {
                        0.0
                    } else {
                        bucket.count as f64 / self.total_keys as f64
                    },
                    distinct_values: distinct,
                    avg_range: width as f64 / distinct as f64,
                }
            }
            None => KeyStats {
                frequency: 0,
                selectivity: 0.0,
                distinct_values: 0,
                avg_range: 0.0,
            },
        };
        self.key_stats_cache.insert(key, stats);
        stats
    }

    /// Estimated fraction of the index a range scan touches, scaled to
    /// page accesses.
    pub fn estimate_query_cost(&self, start_key: i64, end_key: i64) -> f64 {
        if self.histogram.is_empty() || self.total_keys == 0 || start_key > end_key {
            return 0.0;
        }
        let covered: u64 = self
            .histogram
            .iter()
            .filter(|bucket| bucket.max_key >= start_key && bucket.min_key <= end_key)
            .map(|bucket| bucket.count)
            .sum();
        let fraction = covered as f64 / self.total_keys as f64;
        self.height as f64 + fraction * self.page_count as f64
    }

    fn build_histogram(&mut self, min_key: i64, max_key: i64) {
        let span = (max_key - min_key + 1).max(1) as f64;
        let width = span / HISTOGRAM_BUCKETS as f64;
        self.histogram = (0..HISTOGRAM_BUCKETS)
            .map(|index| {
                let lo = min_key + (index as f64 * width) as i64;
                let hi = (min_key + ((index + 1) as f64 * width) as i64 - 1).min(max_key);
                HistogramBucket {
                    min_key: lo,
                    max_key: hi.max(lo),
                    count: 0,
                }
            })
            .collect();
    }

    fn bucket_for(&self, key: i64) -> Option<usize> {
        self.histogram
            .iter()
            .position(|bucket| key >= bucket.min_key && key <= bucket.max_key)
    }
}
