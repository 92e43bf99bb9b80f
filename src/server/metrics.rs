//! Operational counters.
//!
//! All counters are process-lifetime monotonic except `active`, which
//! tracks currently live client connections and saturates at zero.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Proxy counter set.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    /// Admitted client connections
    total_conns: AtomicU64,
    /// Currently live client connections
    active: AtomicU64,
    /// CONNECTs the filter allowed
    tcp_allowed: AtomicU64,
    /// CONNECTs the filter refused
    tcp_blocked: AtomicU64,
    /// FWD_UDP frames seen
    udp_relayed: AtomicU64,
    /// Per-connection faults (protocol errors, dial failures, admission rejects)
    errors: AtomicU64,
}

impl ProxyMetrics {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an admitted connection: total and active both rise.
    pub fn connection_admitted(&self) {
        self.total_conns.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a connection that ended. Saturates at zero.
    pub fn connection_closed(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Currently live connections.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Count an allowed CONNECT.
    pub fn incr_tcp_allowed(&self) {
        self.tcp_allowed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a refused CONNECT.
    pub fn incr_tcp_blocked(&self) {
        self.tcp_blocked.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a FWD_UDP frame.
    pub fn incr_udp_relayed(&self) {
        self.udp_relayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a per-connection fault.
    pub fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time view of the monotonic counters.
    pub fn stats(&self) -> StatsView {
        StatsView {
            total_conns: self.total_conns.load(Ordering::Relaxed),
            tcp_allowed: self.tcp_allowed.load(Ordering::Relaxed),
            tcp_blocked: self.tcp_blocked.load(Ordering::Relaxed),
            udp_relayed: self.udp_relayed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the monotonic counters, in the dashboard's field naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    /// Admitted connections.
    pub total_conns: u64,
    /// Allowed CONNECTs.
    pub tcp_allowed: u64,
    /// Refused CONNECTs.
    pub tcp_blocked: u64,
    /// FWD_UDP frames seen.
    pub udp_relayed: u64,
    /// Per-connection faults.
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_and_close() {
        let metrics = ProxyMetrics::new();

        metrics.connection_admitted();
        metrics.connection_admitted();
        assert_eq!(metrics.active(), 2);
        assert_eq!(metrics.stats().total_conns, 2);

        metrics.connection_closed();
        assert_eq!(metrics.active(), 1);
        assert_eq!(metrics.stats().total_conns, 2);
    }

    #[test]
    fn test_active_saturates_at_zero() {
        let metrics = ProxyMetrics::new();
        metrics.connection_closed();
        metrics.connection_closed();
        assert_eq!(metrics.active(), 0);
    }

    #[test]
    fn test_category_counters() {
        let metrics = ProxyMetrics::new();
        metrics.incr_tcp_allowed();
        metrics.incr_tcp_blocked();
        metrics.incr_udp_relayed();
        metrics.incr_udp_relayed();
        metrics.incr_errors();

        let stats = metrics.stats();
        assert_eq!(stats.tcp_allowed, 1);
        assert_eq!(stats.tcp_blocked, 1);
        assert_eq!(stats.udp_relayed, 2);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_stats_serializes_camel_case() {
        let stats = ProxyMetrics::new().stats();
        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("totalConns").is_some());
        assert!(json.get("tcpAllowed").is_some());
        assert!(json.get("tcpBlocked").is_some());
        assert!(json.get("udpRelayed").is_some());
        assert!(json.get("errors").is_some());
    }
}
