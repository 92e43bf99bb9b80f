//! Relay trackers, the event log, and the telemetry artifact.
//!
//! Everything the out-of-process dashboard sees funnels through
//! [`TrafficLog`]: per-relay byte accounting, the bounded event ring, the
//! snapshot history, and the atomically-replaced JSON artifact. The proxy
//! is the artifact's single writer; readers poll the file and rely on the
//! temp-file + rename discipline to never observe a torn write.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;

use crate::server::metrics::{ProxyMetrics, StatsView};

/// Relay close reason: clean EOF.
pub const END_COMPLETE: &str = "complete";
/// Relay close reason: read failure.
pub const END_READ_ERROR: &str = "error";
/// Relay close reason: forward-write failure.
pub const END_RELAY_ERROR: &str = "relay-error";
/// Relay close reason: hard wall-clock cap.
pub const END_TIMEOUT: &str = "timeout";
/// Relay close reason: download budget exceeded.
pub const END_STREAM_BLOCKED: &str = "stream-blocked";
/// Relay close reason: target dial failed.
pub const END_TARGET_FAILED: &str = "target-failed";
/// Relay close reason: supervisor shutdown.
pub const END_SHUTDOWN: &str = "shutdown";

/// Event categories, serialized in the dashboard's naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// CONNECT admitted by the filter.
    Allowed,
    /// CONNECT or UDP frame refused by the filter.
    Blocked,
    /// Relay closed mid-stream by a download budget.
    StreamBlocked,
    /// Per-connection fault.
    Error,
    /// Relay ended.
    Completed,
}

/// One entry in the event log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEvent {
    /// Monotonic event id.
    pub id: u64,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Event category.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Destination host (or peer address for connection-level faults).
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// Sniffed server name, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    /// Free-form context (close reason, error text, block rule).
    pub detail: String,
    /// Download bytes at emission, for termination events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_down: Option<u64>,
}

/// Live view of one relay, as serialized into snapshots.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    /// Connection id.
    pub id: u64,
    /// Destination host.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// Sniffed server name, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    /// Relay start time.
    pub start_time: DateTime<Utc>,
    /// Client → target bytes.
    pub bytes_up: u64,
    /// Target → client bytes.
    pub bytes_down: u64,
    /// False once the relay closed (it lingers for a grace window).
    pub is_active: bool,
}

/// Aggregate for one domain across closed relays.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSnapshot {
    /// SNI when it was sniffed, otherwise the CONNECT host.
    pub domain: String,
    /// Closed relays attributed to the domain.
    pub count: u64,
    /// Total bytes (both directions) those relays carried.
    pub total_bytes: u64,
}

/// One tick of the telemetry history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSnapshot {
    /// Tick time.
    pub timestamp: DateTime<Utc>,
    /// Relays in the active set, newest id first.
    pub connections: Vec<ConnectionSnapshot>,
    /// Counter values at the tick.
    pub stats: StatsView,
    /// Top 10 domains by total bytes.
    pub top_domains: Vec<DomainSnapshot>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryArtifact<'a> {
    snapshots: &'a VecDeque<TrafficSnapshot>,
    events: &'a VecDeque<TrafficEvent>,
}

/// Per-relay accounting. Owned by the [`TrafficLog`] active set; both pumps
/// hold shared references and mutate counters through atomics, one per
/// direction.
#[derive(Debug)]
pub struct RelayTracker {
    id: u64,
    host: String,
    port: u16,
    start_time: DateTime<Utc>,
    sni: Mutex<Option<String>>,
    sni_extracted: AtomicBool,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl RelayTracker {
    fn new(id: u64, host: String, port: u16) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            id,
            host,
            port,
            start_time: Utc::now(),
            sni: Mutex::new(None),
            sni_extracted: AtomicBool::new(false),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_tx,
        }
    }

    /// Connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Destination host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Add upload bytes, returning the new cumulative total.
    pub fn add_up(&self, n: u64) -> u64 {
        self.bytes_up.fetch_add(n, Ordering::Relaxed) + n
    }

    /// Add download bytes, returning the new cumulative total.
    pub fn add_down(&self, n: u64) -> u64 {
        self.bytes_down.fetch_add(n, Ordering::Relaxed) + n
    }

    /// Cumulative upload bytes.
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Cumulative download bytes.
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    /// One-shot SNI latch. True exactly once, on the first upload chunk;
    /// the chunk is parsed then whether or not parsing succeeds.
    pub fn try_latch_sni(&self) -> bool {
        !self.sni_extracted.swap(true, Ordering::SeqCst)
    }

    /// Record the sniffed server name.
    pub fn set_sni(&self, name: String) {
        *self.sni.lock() = Some(name);
    }

    /// Sniffed server name, when known.
    pub fn sni(&self) -> Option<String> {
        self.sni.lock().clone()
    }

    /// Whether the relay has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flip the closed latch; true only for the caller that closed it.
    fn latch_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Subscribe to the close signal both pumps and the timeout select on.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    fn signal_close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// Snapshot view of this relay.
    pub fn view(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            host: self.host.clone(),
            port: self.port,
            sni: self.sni(),
            start_time: self.start_time,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            is_active: !self.is_closed(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct DomainStats {
    count: u64,
    total_bytes: u64,
}

#[derive(Debug)]
struct EventLog {
    next_id: u64,
    ring: VecDeque<TrafficEvent>,
}

/// Telemetry hub: active relays, event log, snapshot history, artifact.
#[derive(Debug)]
pub struct TrafficLog {
    metrics: Arc<ProxyMetrics>,
    relays: Arc<RwLock<HashMap<u64, Arc<RelayTracker>>>>,
    events: Mutex<EventLog>,
    snapshots: Mutex<VecDeque<TrafficSnapshot>>,
    domains: Mutex<HashMap<String, DomainStats>>,
    artifact_path: PathBuf,
    event_cap: usize,
    snapshot_cap: usize,
    grace: Duration,
}

impl TrafficLog {
    /// Create a telemetry hub writing to `artifact_path`.
    pub fn new(
        metrics: Arc<ProxyMetrics>,
        artifact_path: PathBuf,
        event_cap: usize,
        snapshot_cap: usize,
        grace: Duration,
    ) -> Self {
        Self {
            metrics,
            relays: Arc::new(RwLock::new(HashMap::new())),
            events: Mutex::new(EventLog {
                next_id: 1,
                ring: VecDeque::new(),
            }),
            snapshots: Mutex::new(VecDeque::new()),
            domains: Mutex::new(HashMap::new()),
            artifact_path,
            event_cap,
            snapshot_cap,
            grace,
        }
    }

    /// Path of the emitted artifact.
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Append an event. Ids are allocated under the log lock, so emission
    /// order and id order agree.
    pub fn record_event(
        &self,
        kind: EventKind,
        host: impl Into<String>,
        port: u16,
        sni: Option<String>,
        detail: impl Into<String>,
        bytes_down: Option<u64>,
    ) {
        let mut log = self.events.lock();
        let id = log.next_id;
        log.next_id += 1;
        log.ring.push_back(TrafficEvent {
            id,
            timestamp: Utc::now(),
            kind,
            host: host.into(),
            port,
            sni,
            detail: detail.into(),
            bytes_down,
        });
        while log.ring.len() > self.event_cap {
            log.ring.pop_front();
        }
    }

    /// Register a relay in the active set.
    pub fn register_relay(&self, id: u64, host: String, port: u16) -> Arc<RelayTracker> {
        let tracker = Arc::new(RelayTracker::new(id, host, port));
        self.relays.write().insert(id, Arc::clone(&tracker));
        tracker
    }

    /// Close a relay. Idempotent: the first caller wins, every later call
    /// is a no-op. Signals both pumps, emits the termination event (unless
    /// the reason already did), folds the relay into the domain aggregate,
    /// and schedules removal from the active set after the grace window.
    pub fn relay_end(&self, tracker: &Arc<RelayTracker>, reason: &str) {
        if !tracker.latch_closed() {
            return;
        }
        tracker.signal_close();

        let bytes_up = tracker.bytes_up();
        let bytes_down = tracker.bytes_down();
        let sni = tracker.sni();

        if !matches!(reason, END_STREAM_BLOCKED | END_TARGET_FAILED) {
            self.record_event(
                EventKind::Completed,
                tracker.host(),
                tracker.port(),
                sni.clone(),
                reason,
                Some(bytes_down),
            );
        }

        {
            let mut domains = self.domains.lock();
            let entry = domains
                .entry(sni.unwrap_or_else(|| tracker.host().to_string()))
                .or_default();
            entry.count += 1;
            entry.total_bytes += bytes_up + bytes_down;
        }

        tracing::debug!(
            "relay {} to {}:{} ended ({reason}), up {bytes_up} down {bytes_down}",
            tracker.id(),
            tracker.host(),
            tracker.port()
        );

        let relays = Arc::clone(&self.relays);
        let id = tracker.id();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            relays.write().remove(&id);
        });
    }

    /// Number of relays in the active set (closed-but-in-grace included).
    pub fn relay_count(&self) -> usize {
        self.relays.read().len()
    }

    /// Clone of the current event log, oldest first.
    pub fn events(&self) -> Vec<TrafficEvent> {
        self.events.lock().ring.iter().cloned().collect()
    }

    fn top_domains(&self, n: usize) -> Vec<DomainSnapshot> {
        let mut all: Vec<DomainSnapshot> = self
            .domains
            .lock()
            .iter()
            .map(|(domain, stats)| DomainSnapshot {
                domain: domain.clone(),
                count: stats.count,
                total_bytes: stats.total_bytes,
            })
            .collect();
        all.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes));
        all.truncate(n);
        all
    }

    /// Build one history tick from the current state.
    pub fn build_snapshot(&self) -> TrafficSnapshot {
        let mut connections: Vec<ConnectionSnapshot> =
            self.relays.read().values().map(|t| t.view()).collect();
        connections.sort_by(|a, b| b.id.cmp(&a.id));

        TrafficSnapshot {
            timestamp: Utc::now(),
            connections,
            stats: self.metrics.stats(),
            top_domains: self.top_domains(10),
        }
    }

    /// Append a tick to the history and rewrite the artifact.
    pub async fn emit_snapshot(&self) {
        let snapshot = self.build_snapshot();
        let encoded = {
            let mut snapshots = self.snapshots.lock();
            snapshots.push_back(snapshot);
            while snapshots.len() > self.snapshot_cap {
                snapshots.pop_front();
            }
            let events = self.events.lock();
            serde_json::to_vec(&TelemetryArtifact {
                snapshots: &snapshots,
                events: &events.ring,
            })
        };

        match encoded {
            Ok(bytes) => {
                if let Err(e) = self.write_artifact(&bytes).await {
                    tracing::warn!("telemetry write failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("telemetry encode failed: {}", e),
        }
    }

    /// Drop all history and re-create the artifact empty. Called on
    /// supervisor start; dashboards must tolerate shrinking histories.
    pub async fn reset(&self) {
        self.relays.write().clear();
        self.snapshots.lock().clear();
        self.domains.lock().clear();
        {
            let mut log = self.events.lock();
            log.ring.clear();
        }
        let empty = serde_json::to_vec(&TelemetryArtifact {
            snapshots: &VecDeque::new(),
            events: &VecDeque::new(),
        })
        .unwrap_or_else(|_| b"{\"snapshots\":[],\"events\":[]}".to_vec());
        if let Err(e) = self.write_artifact(&empty).await {
            tracing::warn!("telemetry reset failed: {}", e);
        }
    }

    /// Write to a sibling temp file, then rename over the artifact so
    /// readers never see a partial generation.
    async fn write_artifact(&self, bytes: &[u8]) -> std::io::Result<()> {
        let tmp = self.artifact_path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.artifact_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log(grace: Duration) -> Arc<TrafficLog> {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "netfence-telemetry-test-{}-{}.json",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        Arc::new(TrafficLog::new(
            Arc::new(ProxyMetrics::new()),
            path,
            500,
            300,
            grace,
        ))
    }

    #[test]
    fn test_event_ids_monotonic_and_capped() {
        let log = TrafficLog::new(
            Arc::new(ProxyMetrics::new()),
            std::env::temp_dir().join("netfence-ring-test.json"),
            5,
            300,
            Duration::ZERO,
        );

        for i in 0..8u16 {
            log.record_event(EventKind::Allowed, "host.test", 1000 + i, None, "ok", None);
        }

        let events = log.events();
        assert_eq!(events.len(), 5);
        // Oldest dropped; ids stay sequential and gap-free for what remains.
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_relay_end_is_idempotent() {
        let log = test_log(Duration::from_millis(10));
        let tracker = log.register_relay(1, "example.com".into(), 443);
        tracker.add_up(10);
        tracker.add_down(20);

        log.relay_end(&tracker, END_COMPLETE);
        log.relay_end(&tracker, END_READ_ERROR);
        log.relay_end(&tracker, END_TIMEOUT);

        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Completed);
        assert_eq!(events[0].detail, END_COMPLETE);
        assert_eq!(events[0].bytes_down, Some(20));
        assert!(tracker.is_closed());
    }

    #[tokio::test]
    async fn test_stream_block_reason_suppresses_completed() {
        let log = test_log(Duration::from_millis(10));
        let tracker = log.register_relay(2, "streamy.test".into(), 443);
        tracker.add_down(2048);

        log.relay_end(&tracker, END_STREAM_BLOCKED);

        assert!(log.events().is_empty());
        // The domain aggregate is still fed.
        let snapshot = log.build_snapshot();
        assert_eq!(snapshot.top_domains.len(), 1);
        assert_eq!(snapshot.top_domains[0].domain, "streamy.test");
        assert_eq!(snapshot.top_domains[0].total_bytes, 2048);
    }

    #[tokio::test]
    async fn test_domain_aggregate_prefers_sni() {
        let log = test_log(Duration::from_millis(10));
        let tracker = log.register_relay(3, "104.16.1.1".into(), 443);
        assert!(tracker.try_latch_sni());
        tracker.set_sni("cdn.example".into());
        tracker.add_down(100);

        log.relay_end(&tracker, END_COMPLETE);

        let snapshot = log.build_snapshot();
        assert_eq!(snapshot.top_domains[0].domain, "cdn.example");
        assert_eq!(snapshot.top_domains[0].count, 1);
    }

    #[tokio::test]
    async fn test_grace_window_removal() {
        let log = test_log(Duration::from_millis(20));
        let tracker = log.register_relay(4, "example.com".into(), 80);

        log.relay_end(&tracker, END_COMPLETE);
        // Still visible, flagged inactive.
        let snapshot = log.build_snapshot();
        assert_eq!(snapshot.connections.len(), 1);
        assert!(!snapshot.connections[0].is_active);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(log.relay_count(), 0);
    }

    #[test]
    fn test_snapshot_sorted_newest_first() {
        let log = test_log(Duration::from_secs(5));
        log.register_relay(1, "a.test".into(), 80);
        log.register_relay(3, "c.test".into(), 80);
        log.register_relay(2, "b.test".into(), 80);

        let ids: Vec<u64> = log
            .build_snapshot()
            .connections
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_sni_latch_fires_once() {
        let log = test_log(Duration::from_secs(5));
        let tracker = log.register_relay(9, "x.test".into(), 443);
        assert!(tracker.try_latch_sni());
        assert!(!tracker.try_latch_sni());
        assert!(!tracker.try_latch_sni());
    }

    #[tokio::test]
    async fn test_artifact_roundtrip_and_field_names() {
        let log = test_log(Duration::from_secs(5));
        let tracker = log.register_relay(7, "api.example".into(), 443);
        tracker.add_up(11);
        tracker.add_down(22);
        log.record_event(EventKind::Allowed, "api.example", 443, None, "Connection allowed", None);

        log.emit_snapshot().await;

        let raw = tokio::fs::read(log.artifact_path()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();

        let snapshot = &value["snapshots"][0];
        assert!(snapshot["timestamp"].is_string());
        assert!(snapshot["topDomains"].is_array());
        let conn = &snapshot["connections"][0];
        assert_eq!(conn["id"], 7);
        assert_eq!(conn["bytesUp"], 11);
        assert_eq!(conn["bytesDown"], 22);
        assert_eq!(conn["isActive"], true);
        assert!(conn["startTime"].is_string());
        assert!(conn.get("sni").is_none());

        let event = &value["events"][0];
        assert_eq!(event["type"], "allowed");
        assert_eq!(event["host"], "api.example");
        assert_eq!(event["detail"], "Connection allowed");

        let stats = &snapshot["stats"];
        assert!(stats.get("totalConns").is_some());
    }

    #[tokio::test]
    async fn test_reset_clears_history() {
        let log = test_log(Duration::from_secs(5));
        log.record_event(EventKind::Error, "peer", 1, None, "boom", None);
        log.emit_snapshot().await;

        log.reset().await;

        assert!(log.events().is_empty());
        let raw = tokio::fs::read(log.artifact_path()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["snapshots"].as_array().unwrap().len(), 0);
        assert_eq!(value["events"].as_array().unwrap().len(), 0);
    }
}
