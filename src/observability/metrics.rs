//! Thread-safe metrics collection system
//!
//! Atomic counters for the task lifecycle and adapter traffic, plus a
//! bounded window of execution times for percentile reporting.

use crate::task::{TaskState, TaskStatus};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const EXECUTION_TIME_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    // Task lifecycle
    tasks_created: AtomicU64,
    tasks_started: AtomicU64,
    tasks_ready: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_aborted: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_destroyed: AtomicU64,
    abort_requests: AtomicU64,
    active_tasks: AtomicU64,
    max_active_tasks: AtomicU64,

    // Adapter traffic
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,

    execution_times: Mutex<Vec<u64>>, // in milliseconds
    started_at: DateTime<Utc>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_created: AtomicU64::new(0),
            tasks_started: AtomicU64::new(0),
            tasks_ready: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_aborted: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_destroyed: AtomicU64::new(0),
            abort_requests: AtomicU64::new(0),
            active_tasks: AtomicU64::new(0),
            max_active_tasks: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            execution_times: Mutex::new(Vec::new()),
            started_at: Utc::now(),
        }
    }

    pub fn task_created(&self) {
        self.tasks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
        let active = self.active_tasks.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_active_tasks.fetch_max(active, Ordering::Relaxed);
    }

    pub fn task_ready(&self) {
        self.tasks_ready.fetch_add(1, Ordering::Relaxed);
    }

    /// A task reached DONE from `previous`. Tasks aborted before they
    /// started never counted as active.
    pub fn task_finished(&self, previous: TaskState, status: &TaskStatus) {
        let counter = match status {
            TaskStatus::Completed => &self.tasks_completed,
            TaskStatus::Aborted => &self.tasks_aborted,
            TaskStatus::Failed { .. } => &self.tasks_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if matches!(previous, TaskState::Started | TaskState::Ready) {
            let _ = self
                .active_tasks
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    pub fn task_execution_time(&self, duration: Duration) {
        let mut times = self.execution_times.lock();
        times.push(duration.as_millis() as u64);
        if times.len() > EXECUTION_TIME_WINDOW {
            times.remove(0);
        }
    }

    pub fn task_abort_requested(&self) {
        self.abort_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_destroyed(&self) {
        self.tasks_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.tasks_created,
            &self.tasks_started,
            &self.tasks_ready,
            &self.tasks_completed,
            &self.tasks_aborted,
            &self.tasks_failed,
            &self.tasks_destroyed,
            &self.abort_requests,
            &self.active_tasks,
            &self.max_active_tasks,
            &self.bytes_read,
            &self.bytes_written,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.execution_times.lock().clear();
    }

    fn execution_time_statistics(&self) -> (f64, f64, f64, f64) {
        let mut sorted = self.execution_times.lock().clone();
        if sorted.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let (avg, p50, p95, p99) = self.execution_time_statistics();
        let now = Utc::now();

        MetricsSnapshot {
            tasks: TaskMetrics {
                created: self.tasks_created.load(Ordering::Relaxed),
                started: self.tasks_started.load(Ordering::Relaxed),
                ready: self.tasks_ready.load(Ordering::Relaxed),
                completed: self.tasks_completed.load(Ordering::Relaxed),
                aborted: self.tasks_aborted.load(Ordering::Relaxed),
                failed: self.tasks_failed.load(Ordering::Relaxed),
                destroyed: self.tasks_destroyed.load(Ordering::Relaxed),
                abort_requests: self.abort_requests.load(Ordering::Relaxed),
                active: self.active_tasks.load(Ordering::Relaxed),
                max_active: self.max_active_tasks.load(Ordering::Relaxed),
                avg_execution_time_ms: avg,
                execution_time_p50_ms: p50,
                execution_time_p95_ms: p95,
                execution_time_p99_ms: p99,
            },
            io: IoMetrics {
                bytes_read: self.bytes_read.load(Ordering::Relaxed),
                bytes_written: self.bytes_written.load(Ordering::Relaxed),
            },
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub tasks: TaskMetrics,
    pub io: IoMetrics,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TaskMetrics {
    pub created: u64,
    pub started: u64,
    pub ready: u64,
    pub completed: u64,
    pub aborted: u64,
    pub failed: u64,
    pub destroyed: u64,
    pub abort_requests: u64,
    pub active: u64,
    pub max_active: u64,
    pub avg_execution_time_ms: f64,
    pub execution_time_p50_ms: f64,
    pub execution_time_p95_ms: f64,
    pub execution_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct IoMetrics {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lifecycle_counters() {
        let collector = MetricsCollector::new();

        collector.task_created();
        collector.task_started();
        collector.task_ready();
        collector.task_finished(TaskState::Ready, &TaskStatus::Completed);
        collector.task_destroyed();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.tasks.created, 1);
        assert_eq!(snapshot.tasks.started, 1);
        assert_eq!(snapshot.tasks.ready, 1);
        assert_eq!(snapshot.tasks.completed, 1);
        assert_eq!(snapshot.tasks.destroyed, 1);
        assert_eq!(snapshot.tasks.active, 0);
        assert_eq!(snapshot.tasks.max_active, 1);
    }

    #[test]
    fn test_status_counters() {
        let collector = MetricsCollector::new();
        collector.task_finished(TaskState::Idle, &TaskStatus::Aborted);
        collector.task_finished(TaskState::Started, &TaskStatus::Failed {
            reason: "boom".to_string(),
        });

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.tasks.aborted, 1);
        assert_eq!(snapshot.tasks.failed, 1);
        // Finishing a task that never started must not underflow
        assert_eq!(snapshot.tasks.active, 0);
    }

    #[test]
    fn test_unstarted_abort_leaves_running_task_active() {
        let collector = MetricsCollector::new();
        collector.task_created();
        collector.task_started();

        // Second task aborted before it ever ran
        collector.task_created();
        collector.task_finished(TaskState::Idle, &TaskStatus::Aborted);

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.tasks.active, 1);
        assert_eq!(snapshot.tasks.max_active, 1);

        collector.task_finished(TaskState::Started, &TaskStatus::Completed);
        assert_eq!(collector.get_metrics().tasks.active, 0);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.task_created();
                        collector.bytes_written(3);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.tasks.created, 1000);
        assert_eq!(snapshot.io.bytes_written, 3000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.55).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_execution_time_window_is_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.task_execution_time(Duration::from_millis(i));
        }
        assert_eq!(collector.execution_times.lock().len(), EXECUTION_TIME_WINDOW);
        assert!(collector.get_metrics().tasks.avg_execution_time_ms >= 500.0);
    }

    #[test]
    fn test_reset_and_serialize() {
        let collector = MetricsCollector::new();
        collector.task_created();
        collector.bytes_read(10);
        collector.reset();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.tasks.created, 0);
        assert_eq!(snapshot.io.bytes_read, 0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["timestamp"].is_string());
        assert_eq!(json["tasks"]["completed"], 0);
    }
}
