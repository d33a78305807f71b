//! Metrics Collection for the MCP Tunnel relay
//!
//! Atomic counters, a latency ring buffer, and a Prometheus-compatible
//! `/metrics` rendering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use mcptunnel_shared::Rejection;

/// Relay-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Requests that reached the outbound call (success or transport failure)
    executed: AtomicU64,
    /// Requests received off the bus
    received: AtomicU64,
    /// Admission rejections
    rejected_too_large: AtomicU64,
    rejected_host: AtomicU64,
    rejected_rate: AtomicU64,
    rejected_malformed: AtomicU64,
    /// Outbound transport failures (502)
    upstream_failures: AtomicU64,
    /// Status code counts of executed requests
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    /// Body bytes sent to / received from destinations
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    latencies: Mutex<LatencyHistogram>,
}

/// Ring buffer of recent latencies for percentile calculation
struct LatencyHistogram {
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum = self.sum.saturating_add(latency_us);
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                executed: AtomicU64::new(0),
                received: AtomicU64::new(0),
                rejected_too_large: AtomicU64::new(0),
                rejected_host: AtomicU64::new(0),
                rejected_rate: AtomicU64::new(0),
                rejected_malformed: AtomicU64::new(0),
                upstream_failures: AtomicU64::new(0),
                status_2xx: AtomicU64::new(0),
                status_3xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10000)),
            }),
        }
    }

    /// A request message was read off the bus
    pub fn record_received(&self) {
        self.inner.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an executed request
    pub async fn record_request(&self, status: u16, latency_us: u64, bytes_out: u64, bytes_in: u64) {
        self.inner.executed.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        self.inner.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);

        match status / 100 {
            2 => { self.inner.status_2xx.fetch_add(1, Ordering::Relaxed); }
            3 => { self.inner.status_3xx.fetch_add(1, Ordering::Relaxed); }
            4 => { self.inner.status_4xx.fetch_add(1, Ordering::Relaxed); }
            5 => { self.inner.status_5xx.fetch_add(1, Ordering::Relaxed); }
            _ => {}
        }

        self.inner.latencies.lock().await.record(latency_us);
    }

    pub fn record_rejection(&self, rejection: Rejection) {
        self.rejection_counter(rejection).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.inner.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejections(&self, rejection: Rejection) -> u64 {
        self.rejection_counter(rejection).load(Ordering::Relaxed)
    }

    fn rejection_counter(&self, rejection: Rejection) -> &AtomicU64 {
        match rejection {
            Rejection::TooLarge => &self.inner.rejected_too_large,
            Rejection::HostNotAllowed => &self.inner.rejected_host,
            Rejection::RateLimited => &self.inner.rejected_rate,
            Rejection::Malformed => &self.inner.rejected_malformed,
        }
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self) -> String {
        let lat = self.inner.latencies.lock().await;
        let p50 = lat.percentile(50.0);
        let p95 = lat.percentile(95.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        format!(
r#"# HELP mcptunnel_requests_received_total Request messages read off the bus
# TYPE mcptunnel_requests_received_total counter
mcptunnel_requests_received_total {}

# HELP mcptunnel_requests_executed_total Requests that reached the outbound call
# TYPE mcptunnel_requests_executed_total counter
mcptunnel_requests_executed_total {}

# HELP mcptunnel_requests_rejected_total Requests refused by admission control
# TYPE mcptunnel_requests_rejected_total counter
mcptunnel_requests_rejected_total{{reason="too_large"}} {}
mcptunnel_requests_rejected_total{{reason="host_not_allowed"}} {}
mcptunnel_requests_rejected_total{{reason="rate_limited"}} {}
mcptunnel_requests_rejected_total{{reason="malformed"}} {}

# HELP mcptunnel_upstream_failures_total Outbound calls that failed at the transport level
# TYPE mcptunnel_upstream_failures_total counter
mcptunnel_upstream_failures_total {}

# HELP mcptunnel_requests_by_status Executed requests by HTTP status class
# TYPE mcptunnel_requests_by_status counter
mcptunnel_requests_by_status{{status="2xx"}} {}
mcptunnel_requests_by_status{{status="3xx"}} {}
mcptunnel_requests_by_status{{status="4xx"}} {}
mcptunnel_requests_by_status{{status="5xx"}} {}

# HELP mcptunnel_bytes_total Body bytes exchanged with destinations
# TYPE mcptunnel_bytes_total counter
mcptunnel_bytes_total{{direction="out"}} {}
mcptunnel_bytes_total{{direction="in"}} {}

# HELP mcptunnel_latency_us Outbound call latency in microseconds
# TYPE mcptunnel_latency_us summary
mcptunnel_latency_us{{quantile="0.5"}} {}
mcptunnel_latency_us{{quantile="0.95"}} {}
mcptunnel_latency_us{{quantile="0.99"}} {}
mcptunnel_latency_us_avg {}
"#,
            self.inner.received.load(Ordering::Relaxed),
            self.inner.executed.load(Ordering::Relaxed),
            self.rejections(Rejection::TooLarge),
            self.rejections(Rejection::HostNotAllowed),
            self.rejections(Rejection::RateLimited),
            self.rejections(Rejection::Malformed),
            self.inner.upstream_failures.load(Ordering::Relaxed),
            self.inner.status_2xx.load(Ordering::Relaxed),
            self.inner.status_3xx.load(Ordering::Relaxed),
            self.inner.status_4xx.load(Ordering::Relaxed),
            self.inner.status_5xx.load(Ordering::Relaxed),
            self.inner.bytes_out.load(Ordering::Relaxed),
            self.inner.bytes_in.load(Ordering::Relaxed),
            p50, p95, p99, avg,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.record_received();
        metrics.record_request(200, 1_000, 10, 20).await;
        metrics.record_request(404, 3_000, 0, 5).await;
        metrics.record_rejection(Rejection::RateLimited);

        let text = metrics.to_prometheus().await;
        assert!(text.contains("mcptunnel_requests_received_total 1"));
        assert!(text.contains("mcptunnel_requests_executed_total 2"));
        assert!(text.contains(r#"mcptunnel_requests_by_status{status="2xx"} 1"#));
        assert!(text.contains(r#"mcptunnel_requests_by_status{status="4xx"} 1"#));
        assert!(text.contains(r#"mcptunnel_requests_rejected_total{reason="rate_limited"} 1"#));
        assert!(text.contains(r#"mcptunnel_bytes_total{direction="in"} 25"#));
        assert!(text.contains("mcptunnel_latency_us_avg 2000"));
    }

    #[test]
    fn test_percentiles() {
        let mut h = LatencyHistogram::new(4);
        assert_eq!(h.percentile(50.0), 0);
        for v in [10, 20, 30, 40, 50] {
            h.record(v);
        }
        // Oldest value overwritten by the ring buffer.
        assert_eq!(h.percentile(0.0), 20);
        assert_eq!(h.percentile(99.0), 50);
        assert_eq!(h.average(), 30);
    }
}
