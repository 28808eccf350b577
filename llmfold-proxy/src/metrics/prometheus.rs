//! Prometheus metrics for the llmfold proxy
//!
//! Exposes metrics in Prometheus format for monitoring and observability.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry for llmfold metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Request Metrics ==============

    /// Total requests counter with model and status labels
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total number of requests")
            .namespace("llmfold"),
        &["model", "status"]
    ).expect("metric can be created");

    /// Answered requests by the path that produced the answer
    pub static ref RESPONSES_BY_SOURCE_TOTAL: CounterVec = CounterVec::new(
        Opts::new("responses_by_source_total", "Answered requests by source (cache, single, batch, fallback)")
            .namespace("llmfold"),
        &["source"]
    ).expect("metric can be created");

    /// Request duration histogram with model label
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "request_duration_seconds",
            "Request duration in seconds"
        )
        .namespace("llmfold")
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["model"]
    ).expect("metric can be created");

    /// Active requests gauge (waiting for their answer)
    pub static ref ACTIVE_REQUESTS: Gauge = Gauge::with_opts(
        Opts::new("active_requests", "Number of requests currently waiting for an answer")
            .namespace("llmfold")
    ).expect("metric can be created");

    // ============== Cache Metrics ==============

    /// Cache hits counter
    pub static ref CACHE_HITS_TOTAL: Counter = Counter::with_opts(
        Opts::new("cache_hits_total", "Total cache hits")
            .namespace("llmfold")
    ).expect("metric can be created");

    /// Cache misses counter
    pub static ref CACHE_MISSES_TOTAL: Counter = Counter::with_opts(
        Opts::new("cache_misses_total", "Total cache misses")
            .namespace("llmfold")
    ).expect("metric can be created");

    /// Cache evictions counter
    pub static ref CACHE_EVICTIONS_TOTAL: Counter = Counter::with_opts(
        Opts::new("cache_evictions_total", "Total cache evictions")
            .namespace("llmfold")
    ).expect("metric can be created");

    /// Cache size gauge (number of entries)
    pub static ref CACHE_SIZE: Gauge = Gauge::with_opts(
        Opts::new("cache_size", "Current cache size (entries)")
            .namespace("llmfold")
    ).expect("metric can be created");

    // ============== Batch Metrics ==============

    /// Items per dispatched job
    pub static ref BATCH_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "batch_size",
            "Number of requests per dispatched batch"
        )
        .namespace("llmfold")
        .buckets(vec![1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 16.0, 32.0])
    ).expect("metric can be created");

    /// Time between a batch opening and its dispatch
    pub static ref BATCH_WAIT_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "batch_wait_seconds",
            "Time a batch stayed open before dispatch"
        )
        .namespace("llmfold")
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0])
    ).expect("metric can be created");

    /// Items the combined response could not answer
    pub static ref PARSE_FAILURES_TOTAL: Counter = Counter::with_opts(
        Opts::new("parse_failures_total", "Batch items without a well-formed answer block")
            .namespace("llmfold")
    ).expect("metric can be created");

    /// Individual calls issued after a merged call
    pub static ref FALLBACK_CALLS_TOTAL: Counter = Counter::with_opts(
        Opts::new("fallback_calls_total", "Individual calls issued for unresolved batch items")
            .namespace("llmfold")
    ).expect("metric can be created");

    /// Requests whose prompt had to be compressed or cut
    pub static ref TRUNCATIONS_TOTAL: Counter = Counter::with_opts(
        Opts::new("truncations_total", "Requests truncated to fit the context budget")
            .namespace("llmfold")
    ).expect("metric can be created");

    // ============== Downstream Metrics ==============

    /// Downstream calls by kind (single, batch, fallback)
    pub static ref DOWNSTREAM_CALLS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("downstream_calls_total", "Downstream calls issued")
            .namespace("llmfold"),
        &["kind"]
    ).expect("metric can be created");

    /// Downstream failures by error kind (transport, provider, timeout)
    pub static ref DOWNSTREAM_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("downstream_errors_total", "Failed downstream calls")
            .namespace("llmfold"),
        &["error"]
    ).expect("metric can be created");

    /// Downstream health status (1 = healthy, 0 = unhealthy)
    pub static ref BACKEND_HEALTHY: Gauge = Gauge::with_opts(
        Opts::new("backend_healthy", "Backend health status (1=healthy, 0=unhealthy)")
            .namespace("llmfold")
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    // Request metrics
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESPONSES_BY_SOURCE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_REQUESTS.clone()))?;

    // Cache metrics
    REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_EVICTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_SIZE.clone()))?;

    // Batch metrics
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(BATCH_WAIT_SECONDS.clone()))?;
    REGISTRY.register(Box::new(PARSE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FALLBACK_CALLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TRUNCATIONS_TOTAL.clone()))?;

    // Downstream metrics
    REGISTRY.register(Box::new(DOWNSTREAM_CALLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DOWNSTREAM_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BACKEND_HEALTHY.clone()))?;

    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Helper struct for tracking request duration.
/// Records the request as failed if dropped without an explicit outcome.
pub struct RequestTimer {
    model: String,
    start: std::time::Instant,
}

impl RequestTimer {
    /// Start a new request timer for the given model.
    pub fn new(model: &str) -> Self {
        ACTIVE_REQUESTS.inc();
        Self { model: model.to_string(), start: std::time::Instant::now() }
    }

    /// Record a successful request and the path that answered it.
    pub fn record_success(self, source: &str) {
        self.finish("success");
        RESPONSES_BY_SOURCE_TOTAL.with_label_values(&[source]).inc();
        std::mem::forget(self);
    }

    /// Record a failed request.
    pub fn record_failure(self) {
        self.finish("error");
        std::mem::forget(self);
    }

    fn finish(&self, status: &str) {
        REQUEST_DURATION_SECONDS
            .with_label_values(&[&self.model])
            .observe(self.start.elapsed().as_secs_f64());
        REQUESTS_TOTAL.with_label_values(&[&self.model, status]).inc();
        ACTIVE_REQUESTS.dec();
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        // Dropped without an explicit outcome (e.g. client went away)
        self.finish("error");
    }
}

/// Record a cache hit.
pub fn record_cache_hit() {
    CACHE_HITS_TOTAL.inc();
}

/// Record a cache miss.
pub fn record_cache_miss() {
    CACHE_MISSES_TOTAL.inc();
}

/// Record a cache eviction.
pub fn record_cache_eviction() {
    CACHE_EVICTIONS_TOTAL.inc();
}

/// Update cache size gauge.
pub fn set_cache_size(size: u64) {
    CACHE_SIZE.set(size as f64);
}

/// Record a dispatched batch.
pub fn record_batch(size: usize, waited_secs: f64) {
    BATCH_SIZE.observe(size as f64);
    BATCH_WAIT_SECONDS.observe(waited_secs);
}

/// Record a downstream call of the given kind.
pub fn record_downstream_call(kind: &str) {
    DOWNSTREAM_CALLS_TOTAL.with_label_values(&[kind]).inc();
    if kind == "fallback" {
        FALLBACK_CALLS_TOTAL.inc();
    }
}

/// Record a failed downstream call.
pub fn record_downstream_error(error_kind: &str) {
    DOWNSTREAM_ERRORS_TOTAL.with_label_values(&[error_kind]).inc();
}

/// Record batch items that could not be parsed.
pub fn record_parse_failures(count: usize) {
    PARSE_FAILURES_TOTAL.inc_by(count as f64);
}

/// Record a truncated request.
pub fn record_truncation() {
    TRUNCATIONS_TOTAL.inc();
}

/// Set backend health status.
pub fn set_backend_healthy(healthy: bool) {
    BACKEND_HEALTHY.set(if healthy { 1.0 } else { 0.0 });
}
