//! Maintenance coordinator: scores index health, priority-queues rebuild
//! tasks and drains them against the query processor.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::SystemTime;

use log::info;

use crate::error::QueryResult;
use crate::processor::QueryProcessor;

const FRAGMENTATION_TRIGGER: f64 = 0.3;
const DELETE_OPS_TRIGGER: u64 = 1_000;
const ACCESS_TIME_TRIGGER_MS: f64 = 100.0;

const DELETE_OPS_NORMALIZER: f64 = 10_000.0;
const ACCESS_TIME_NORMALIZER_MS: f64 = 200.0;

/// Health snapshot the coordinator keeps per named index.
#[derive(Debug, Clone)]
pub struct IndexHealthReport {
    pub fragmentation: f64,
    pub delete_operations: u64,
    pub avg_access_time_ms: f64,
    pub last_maintenance: Option<SystemTime>,
    pub needs_maintenance: bool,
}

impl IndexHealthReport {
    fn assess(&mut self) {
        self.needs_maintenance = self.fragmentation > FRAGMENTATION_TRIGGER
            || self.delete_operations > DELETE_OPS_TRIGGER
            || self.avg_access_time_ms > ACCESS_TIME_TRIGGER_MS;
    }
}

/// Weighted priority: fragmentation dominates, delete volume and access
/// latency each contribute a capped share.
pub fn maintenance_priority(health: &IndexHealthReport) -> f64 {
    0.4 * health.fragmentation
        + 0.3 * (health.delete_operations as f64 / DELETE_OPS_NORMALIZER).min(1.0)
        + 0.3 * (health.avg_access_time_ms / ACCESS_TIME_NORMALIZER_MS).min(1.0)
}

#[derive(Debug, Clone)]
struct MaintenanceTask {
    index_name: String,
    priority: f64,
    scheduled_at: SystemTime,
}

impl PartialEq for MaintenanceTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for MaintenanceTask {}

impl PartialOrd for MaintenanceTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MaintenanceTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.total_cmp(&other.priority)
    }
}

/// Schedules and performs index rebuilds.
#[derive(Default)]
pub struct MaintenanceCoordinator {
    queue: BinaryHeap<MaintenanceTask>,
    health: HashMap<String, IndexHealthReport>,
}

impl MaintenanceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a fresh health sample for an index.
    pub fn observe(
        &mut self,
        index_name: &str,
        fragmentation: f64,
        delete_operations: u64,
        avg_access_time_ms: f64,
    ) {
        let entry = self
            .health
            .entry(index_name.to_string())
            .or_insert(IndexHealthReport {
                fragmentation: 0.0,
                delete_operations: 0,
                avg_access_time_ms: 0.0,
                last_maintenance: None,
                needs_maintenance: false,
            });
        entry.fragmentation = fragmentation;
        entry.delete_operations = delete_operations;
        entry.avg_access_time_ms = avg_access_time_ms;
        entry.assess();
    }

    pub fn check_index_health(&self, index_name: &str) -> Option<&IndexHealthReport> {
        self.health.get(index_name)
    }

    pub fn is_maintenance_needed(&self, index_name: &str) -> bool {
        self.health
            .get(index_name)
            .map(|health| health.needs_maintenance)
            .unwrap_or(false)
    }

    /// Enqueues a rebuild task when the recorded health warrants one.
    pub fn schedule(&mut self, index_name: &str) {
        let Some(health) = self.health.get(index_name) else {
            return;
        };
        if !health.needs_maintenance {
            return;
        }
        let task = MaintenanceTask {
            index_name: index_name.to_string(),
            priority: maintenance_priority(health),
            scheduled_at: SystemTime::now(),
        };
        self.queue.push(task);
    }

    /// Drops any pending tasks for an index.
    pub fn cancel(&mut self, index_name: &str) {
        let remaining: Vec<MaintenanceTask> = self
            .queue
            .drain()
            .filter(|task| task.index_name != index_name)
            .collect();
        self.queue = remaining.into_iter().collect();
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Drains the queue highest-priority first. Each task is re-checked
    /// against the current health before the rebuild runs, so stale tasks
    /// fall through.
    pub fn perform_scheduled(
        &mut self,
        processor: &mut QueryProcessor,
    ) -> QueryResult<Vec<String>> {
        let mut performed = Vec::new();
        while let Some(task) = self.queue.pop() {
            if !self.is_maintenance_needed(&task.index_name) {
                continue;
            }
            if processor.maintain_index(&task.index_name)? {
                let queued_for = task
                    .scheduled_at
                    .elapsed()
                    .map(|elapsed| elapsed.as_millis())
                    .unwrap_or(0);
                info!(
                    "maintenance performed for index {} (priority {:.3}, queued {queued_for} ms)",
                    task.index_name, task.priority
                );
                if let Some(health) = self.health.get_mut(&task.index_name) {
                    health.fragmentation = 0.0;
                    health.delete_operations = 0;
                    health.last_maintenance = Some(SystemTime::now());
                    health.assess();
                }
                performed.push(task.index_name);
            }
        }
        Ok(performed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(fragmentation: f64, deletes: u64, access_ms: f64) -> IndexHealthReport {
        let mut report = IndexHealthReport {
            fragmentation,
            delete_operations: deletes,
            avg_access_time_ms: access_ms,
            last_maintenance: None,
            needs_maintenance: false,
        };
        report.assess();
        report
    }

    #[test]
    fn priority_weights_components() {
        let quiet = sample(0.0, 0, 0.0);
        assert_eq!(maintenance_priority(&quiet), 0.0);

        let fragmented = sample(1.0, 0, 0.0);
        assert!((maintenance_priority(&fragmented) - 0.4).abs() < 1e-9);

        // Both normalised components cap at one.
        let busy = sample(0.0, 1_000_000, 10_000.0);
        assert!((maintenance_priority(&busy) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn schedule_requires_unhealthy_index() {
        let mut coordinator = MaintenanceCoordinator::new();
        coordinator.observe("clean", 0.05, 10, 1.0);
        coordinator.schedule("clean");
        assert_eq!(coordinator.pending_count(), 0);

        coordinator.observe("dirty", 0.5, 10, 1.0);
        coordinator.schedule("dirty");
        assert_eq!(coordinator.pending_count(), 1);
        assert!(coordinator.is_maintenance_needed("dirty"));
        assert!(!coordinator.is_maintenance_needed("clean"));
    }

    #[test]
    fn cancel_filters_pending_tasks() {
        let mut coordinator = MaintenanceCoordinator::new();
        coordinator.observe("a", 0.9, 0, 0.0);
        coordinator.observe("b", 0.5, 0, 0.0);
        coordinator.schedule("a");
        coordinator.schedule("b");
        assert_eq!(coordinator.pending_count(), 2);
        coordinator.cancel("a");
        assert_eq!(coordinator.pending_count(), 1);
    }

    #[test]
    fn triggers_match_thresholds() {
        assert!(!sample(0.3, 0, 0.0).needs_maintenance);
        assert!(sample(0.31, 0, 0.0).needs_maintenance);
        assert!(sample(0.0, 1_001, 0.0).needs_maintenance);
        assert!(sample(0.0, 0, 100.5).needs_maintenance);
    }
}
