use histogram::Histogram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const ORDER_TYPE: Ordering = Ordering::Relaxed;

#[derive(Debug)]
pub struct MetricsError {
    cause: &'static str,
}

impl From<&'static str> for MetricsError {
    fn from(err: &'static str) -> MetricsError {
        MetricsError { cause: err }
    }
}

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "metrics error: {}", self.cause)
    }
}

/// Per-session driver metrics. No global state; every session owns its own.
#[derive(Default, Debug)]
pub struct Metrics {
    errors_num: AtomicU64,
    queries_num: AtomicU64,
    errors_iter_num: AtomicU64,
    queries_iter_num: AtomicU64,
    retries_num: AtomicU64,
    speculative_executions_num: AtomicU64,
    histogram: Arc<Mutex<Histogram>>,
}

impl Metrics {
    pub fn new() -> Self {
        Default::default()
    }

    /// Increments counter for errors that occurred in nonpaged queries.
    pub(crate) fn inc_failed_nonpaged_queries(&self) {
        self.errors_num.fetch_add(1, ORDER_TYPE);
    }

    /// Increments counter for nonpaged queries.
    pub(crate) fn inc_total_nonpaged_queries(&self) {
        self.queries_num.fetch_add(1, ORDER_TYPE);
    }

    /// Increments counter for errors that occurred in paged queries.
    pub(crate) fn inc_failed_paged_queries(&self) {
        self.errors_iter_num.fetch_add(1, ORDER_TYPE);
    }

    /// Increments counter for page queries in paged queries.
    /// If a query iterator fetches 4 pages, this gets incremented 4 times.
    pub(crate) fn inc_total_paged_queries(&self) {
        self.queries_iter_num.fetch_add(1, ORDER_TYPE);
    }

    /// Increments counter measuring how many times a retry policy has decided
    /// to retry a query.
    pub(crate) fn inc_retries_num(&self) {
        self.retries_num.fetch_add(1, ORDER_TYPE);
    }

    /// Increments counter for speculative executions fired by the driver.
    pub(crate) fn inc_speculative_executions(&self) {
        self.speculative_executions_num.fetch_add(1, ORDER_TYPE);
    }

    /// Saves to histogram the latency of completing a single query.
    /// For paged queries, it logs the latency of every page.
    ///
    /// # Arguments
    ///
    /// * `latency` - time in milliseconds that should be logged
    pub(crate) fn log_query_latency(&self, latency: u64) -> Result<(), MetricsError> {
        let mut histogram_unlocked = self.histogram.lock().unwrap();
        histogram_unlocked.increment(latency)?;
        Ok(())
    }

    /// Returns the average latency in milliseconds.
    pub fn get_latency_avg_ms(&self) -> Result<u64, MetricsError> {
        let histogram_unlocked = self.histogram.lock().unwrap();
        let res = histogram_unlocked.mean()?;
        Ok(res)
    }

    /// Returns the given percentile of latencies in milliseconds.
    ///
    /// # Arguments
    ///
    /// * `percentile` - float value (0.0 - 100.0)
    pub fn get_latency_percentile_ms(&self, percentile: f64) -> Result<u64, MetricsError> {
        let histogram_unlocked = self.histogram.lock().unwrap();
        let res = histogram_unlocked.percentile(percentile)?;
        Ok(res)
    }

    /// Returns the number of errors during nonpaged queries.
    pub fn get_errors_num(&self) -> u64 {
        self.errors_num.load(ORDER_TYPE)
    }

    /// Returns the number of nonpaged queries.
    pub fn get_queries_num(&self) -> u64 {
        self.queries_num.load(ORDER_TYPE)
    }

    /// Returns the number of errors during paged queries.
    pub fn get_errors_iter_num(&self) -> u64 {
        self.errors_iter_num.load(ORDER_TYPE)
    }

    /// Returns the number of page requests made by paged queries.
    pub fn get_queries_iter_num(&self) -> u64 {
        self.queries_iter_num.load(ORDER_TYPE)
    }

    /// Returns the number of times a retry policy has decided to retry.
    pub fn get_retries_num(&self) -> u64 {
        self.retries_num.load(ORDER_TYPE)
    }

    /// Returns the number of speculative executions fired.
    pub fn get_speculative_executions_num(&self) -> u64 {
        self.speculative_executions_num.load(ORDER_TYPE)
    }
}

#[cfg(test)]
mod tests {
    use super::Metrics;

    #[test]
    fn counters_count() {
        let metrics = Metrics::new();
        metrics.inc_total_nonpaged_queries();
        metrics.inc_total_nonpaged_queries();
        metrics.inc_failed_nonpaged_queries();
        metrics.inc_retries_num();
        metrics.inc_speculative_executions();

        assert_eq!(metrics.get_queries_num(), 2);
        assert_eq!(metrics.get_errors_num(), 1);
        assert_eq!(metrics.get_retries_num(), 1);
        assert_eq!(metrics.get_speculative_executions_num(), 1);
    }

    #[test]
    fn latency_histogram() {
        let metrics = Metrics::new();
        for latency in [10, 20, 30] {
            metrics.log_query_latency(latency).unwrap();
        }
        let avg = metrics.get_latency_avg_ms().unwrap();
        assert!((10..=30).contains(&avg));
    }
}
