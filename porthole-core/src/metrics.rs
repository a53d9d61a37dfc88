//! Session metrics
//!
//! Lock-free counters fed by the session and the relay pumps, consumed only
//! by the display. Nothing in the data path reads them back.

use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Metrics {
    started: Instant,

    total_connections: AtomicU64,
    active_streams: AtomicU64,
    total_streams: AtomicU64,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    http_requests: AtomicU64,
    http_latency_total_ns: AtomicU64,
    http_latency_min_ns: AtomicU64,
    http_latency_max_ns: AtomicU64,
    http_status_counts: DashMap<u16, u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_streams: AtomicU64::new(0),
            total_streams: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            http_requests: AtomicU64::new(0),
            http_latency_total_ns: AtomicU64::new(0),
            http_latency_min_ns: AtomicU64::new(u64::MAX),
            http_latency_max_ns: AtomicU64::new(0),
            http_status_counts: DashMap::new(),
        }
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_opened(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        self.total_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        // Saturating: a close without a matching open must not wrap.
        let _ = self
            .active_streams
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_http(&self, status: u16, latency: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        let ns = latency.as_nanos() as u64;
        self.http_requests.fetch_add(1, Ordering::Relaxed);
        self.http_latency_total_ns.fetch_add(ns, Ordering::Relaxed);
        self.http_latency_min_ns.fetch_min(ns, Ordering::Relaxed);
        self.http_latency_max_ns.fetch_max(ns, Ordering::Relaxed);
        *self.http_status_counts.entry(status).or_insert(0) += 1;
    }

    #[must_use]
    pub fn active_streams(&self) -> u64 {
        self.active_streams.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_streams(&self) -> u64 {
        self.total_streams.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bandwidth(&self) -> (u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn http_stats(&self) -> Option<(u64, Duration, Duration, Duration)> {
        let total = self.http_requests.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        let avg = self.http_latency_total_ns.load(Ordering::Relaxed) / total;
        let min = self.http_latency_min_ns.load(Ordering::Relaxed);
        let max = self.http_latency_max_ns.load(Ordering::Relaxed);
        Some((
            total,
            Duration::from_nanos(avg),
            Duration::from_nanos(min),
            Duration::from_nanos(max),
        ))
    }

    /// Multi-line end-of-session report.
    #[must_use]
    pub fn summary(&self) -> String {
        let (sent, recv) = self.bandwidth();
        let mut out = String::new();

        out.push_str("\nMetrics Summary\n");
        out.push_str("─────────────────────────────────────────────\n");
        let _ = writeln!(out, "Active Streams     {}", self.active_streams());
        let _ = writeln!(out, "Total Streams      {}", self.total_streams());
        let _ = writeln!(
            out,
            "Total Connections  {}\n",
            self.total_connections.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "Data Sent          {}", format_bytes(sent));
        let _ = writeln!(out, "Data Received      {}", format_bytes(recv));
        let _ = writeln!(out, "Total Transfer     {}\n", format_bytes(sent + recv));

        if let Some((total, avg, min, max)) = self.http_stats() {
            let _ = writeln!(out, "HTTP Requests      {total}");
            let _ = writeln!(out, "Avg Latency        {}ms", avg.as_millis());
            let _ = writeln!(out, "Min Latency        {}ms", min.as_millis());
            let _ = writeln!(out, "Max Latency        {}ms\n", max.as_millis());

            if !self.http_status_counts.is_empty() {
                out.push_str("Status Codes\n");
                let mut codes: Vec<(u16, u64)> = self
                    .http_status_counts
                    .iter()
                    .map(|r| (*r.key(), *r.value()))
                    .collect();
                codes.sort_unstable();
                for (code, count) in codes {
                    let _ = writeln!(out, "  {code}: {count} requests");
                }
                out.push('\n');
            }
        }

        let _ = writeln!(out, "Uptime             {}", format_uptime(self.uptime()));
        out
    }

    /// Compact status line for periodic logging.
    #[must_use]
    pub fn one_liner(&self) -> String {
        let (sent, recv) = self.bandwidth();
        let base = format!(
            "Streams: {}/{} | Data: ↑{} ↓{}",
            self.active_streams(),
            self.total_streams(),
            format_bytes(sent),
            format_bytes(recv),
        );

        match self.http_stats() {
            Some((total, avg, _, _)) => {
                format!("{base} | HTTP: {total} req, {}ms avg", avg.as_millis())
            }
            None => base,
        }
    }
}

/// Human-readable byte count (binary units).
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    #[allow(clippy::cast_precision_loss)]
    let value = bytes as f64 / div as f64;
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{value:.1} {suffix}B")
}

/// Human-readable uptime.
#[must_use]
pub fn format_uptime(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total / 60) % 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn format_uptime_units() {
        assert_eq!(format_uptime(Duration::from_secs(42)), "42s");
        assert_eq!(format_uptime(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_uptime(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn stream_counters() {
        let m = Metrics::new();
        m.stream_opened();
        m.stream_opened();
        assert_eq!(m.active_streams(), 2);
        assert_eq!(m.total_streams(), 2);

        m.stream_closed();
        assert_eq!(m.active_streams(), 1);
        assert_eq!(m.total_streams(), 2);

        // Unmatched closes saturate at zero.
        m.stream_closed();
        m.stream_closed();
        assert_eq!(m.active_streams(), 0);
    }

    #[test]
    fn http_stats_aggregate() {
        let m = Metrics::new();
        m.record_http(200, Duration::from_millis(10));
        m.record_http(200, Duration::from_millis(30));
        m.record_http(404, Duration::from_millis(20));

        let (total, avg, min, max) = m.http_stats().unwrap();
        assert_eq!(total, 3);
        assert_eq!(avg, Duration::from_millis(20));
        assert_eq!(min, Duration::from_millis(10));
        assert_eq!(max, Duration::from_millis(30));

        let summary = m.summary();
        assert!(summary.contains("HTTP Requests      3"));
        assert!(summary.contains("200: 2 requests"));
        assert!(summary.contains("404: 1 requests"));
    }

    #[test]
    fn one_liner_without_http() {
        let m = Metrics::new();
        m.add_bytes_sent(2048);
        let line = m.one_liner();
        assert!(line.contains("↑2.0 KB"));
        assert!(!line.contains("HTTP"));
    }
}
