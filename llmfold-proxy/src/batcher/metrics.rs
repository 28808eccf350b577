//! Metrics for the batch scheduler.

use std::sync::atomic::{AtomicU64, Ordering};

use llmfold_core::ResponseSource;

/// Metrics for monitoring scheduler behaviour
#[derive(Debug, Default)]
pub struct BatcherMetrics {
    /// Requests accepted at admission
    pub requests_received: AtomicU64,

    /// Requests rejected at admission
    pub requests_rejected: AtomicU64,

    /// Requests whose prompt was cut to fit the budget
    pub requests_truncated: AtomicU64,

    /// Requests answered, by source
    pub answered_cache: AtomicU64,
    pub answered_single: AtomicU64,
    pub answered_batch: AtomicU64,
    pub answered_fallback: AtomicU64,

    /// Requests whose final downstream call failed
    pub requests_failed: AtomicU64,

    /// Jobs handed to dispatch
    pub jobs_dispatched: AtomicU64,

    /// Items across dispatched jobs (for batch size averaging)
    pub total_job_items: AtomicU64,

    /// Largest job dispatched so far
    pub max_job_size: AtomicU64,

    /// Batch items the combined response did not answer
    pub parse_failures: AtomicU64,

    /// Individual calls issued for unresolved batch items
    pub fallback_calls: AtomicU64,

    /// Failed downstream calls, timeouts included
    pub downstream_errors: AtomicU64,

    /// Downstream calls that exceeded their deadline
    pub downstream_timeouts: AtomicU64,
}

impl BatcherMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_truncated(&self) {
        self.requests_truncated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request answered through `source`
    pub fn record_answered(&self, source: ResponseSource) {
        let counter = match source {
            ResponseSource::Cache => &self.answered_cache,
            ResponseSource::Single => &self.answered_single,
            ResponseSource::Batch => &self.answered_batch,
            ResponseSource::Fallback => &self.answered_fallback,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job being dispatched
    pub fn record_job(&self, items: usize) {
        let items = items as u64;
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
        self.total_job_items.fetch_add(items, Ordering::Relaxed);

        let mut current_max = self.max_job_size.load(Ordering::Relaxed);
        while items > current_max {
            match self.max_job_size.compare_exchange_weak(
                current_max,
                items,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }

    pub fn record_parse_failures(&self, count: usize) {
        self.parse_failures.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_fallback_call(&self) {
        self.fallback_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downstream_error(&self, timeout: bool) {
        self.downstream_errors.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.downstream_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Calculate average job size
    pub fn avg_job_size(&self) -> f64 {
        let jobs = self.jobs_dispatched.load(Ordering::Relaxed);
        if jobs == 0 {
            return 0.0;
        }
        self.total_job_items.load(Ordering::Relaxed) as f64 / jobs as f64
    }

    /// Downstream calls saved by merging, relative to one call per request
    pub fn calls_saved(&self) -> u64 {
        let items = self.total_job_items.load(Ordering::Relaxed);
        let jobs = self.jobs_dispatched.load(Ordering::Relaxed);
        let fallbacks = self.fallback_calls.load(Ordering::Relaxed);
        items.saturating_sub(jobs + fallbacks)
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            requests_truncated: self.requests_truncated.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            answered: AnsweredBySource {
                cache: self.answered_cache.load(Ordering::Relaxed),
                single: self.answered_single.load(Ordering::Relaxed),
                batch: self.answered_batch.load(Ordering::Relaxed),
                fallback: self.answered_fallback.load(Ordering::Relaxed),
            },
            jobs_dispatched: self.jobs_dispatched.load(Ordering::Relaxed),
            max_job_size: self.max_job_size.load(Ordering::Relaxed),
            avg_job_size: self.avg_job_size(),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            fallback_calls: self.fallback_calls.load(Ordering::Relaxed),
            downstream_errors: self.downstream_errors.load(Ordering::Relaxed),
            downstream_timeouts: self.downstream_timeouts.load(Ordering::Relaxed),
            calls_saved: self.calls_saved(),
        }
    }
}

/// Answered requests per response source
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AnsweredBySource {
    pub cache: u64,
    pub single: u64,
    pub batch: u64,
    pub fallback: u64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_received: u64,
    pub requests_rejected: u64,
    pub requests_truncated: u64,
    pub requests_failed: u64,
    pub answered: AnsweredBySource,
    pub jobs_dispatched: u64,
    pub max_job_size: u64,
    pub avg_job_size: f64,
    pub parse_failures: u64,
    pub fallback_calls: u64,
    pub downstream_errors: u64,
    pub downstream_timeouts: u64,
    pub calls_saved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_size_tracking() {
        let metrics = BatcherMetrics::new();

        metrics.record_job(4);
        metrics.record_job(6);
        metrics.record_job(2);

        assert_eq!(metrics.avg_job_size(), 4.0);
        assert_eq!(metrics.max_job_size.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn test_answered_by_source() {
        let metrics = BatcherMetrics::new();

        metrics.record_answered(ResponseSource::Batch);
        metrics.record_answered(ResponseSource::Batch);
        metrics.record_answered(ResponseSource::Cache);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.answered.batch, 2);
        assert_eq!(snapshot.answered.cache, 1);
        assert_eq!(snapshot.answered.fallback, 0);
    }

    #[test]
    fn test_calls_saved() {
        let metrics = BatcherMetrics::new();

        // One job of 5 items with one fallback: 2 calls instead of 5
        metrics.record_job(5);
        metrics.record_fallback_call();

        assert_eq!(metrics.calls_saved(), 3);
    }

    #[test]
    fn test_timeouts_are_downstream_errors() {
        let metrics = BatcherMetrics::new();

        metrics.record_downstream_error(true);
        metrics.record_downstream_error(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.downstream_errors, 2);
        assert_eq!(snapshot.downstream_timeouts, 1);
    }
}
