//! Proxy configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Runtime configuration for [`crate::FilterProxy`].
///
/// Defaults are the production values; tests shrink caps and timeouts
/// through the public fields.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Admission cap on concurrently live client connections.
    pub max_connections: usize,
    /// Per-direction relay read buffer size.
    pub relay_buffer_size: usize,
    /// Hard wall-clock cap on a TCP relay.
    pub tcp_relay_timeout: Duration,
    /// Wait for the single reply to a forwarded UDP datagram.
    pub udp_relay_timeout: Duration,
    /// Largest accepted FWD_UDP frame payload.
    pub max_udp_frame: usize,
    /// Telemetry snapshot period.
    pub snapshot_interval: Duration,
    /// Operational stats log period.
    pub stats_interval: Duration,
    /// How long a closed relay stays visible in snapshots.
    pub close_grace: Duration,
    /// Event log ring capacity.
    pub event_log_cap: usize,
    /// Snapshot history ring capacity.
    pub snapshot_history_cap: usize,
    /// Where the telemetry artifact is written.
    pub telemetry_path: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_connections: crate::MAX_CONNECTIONS,
            relay_buffer_size: crate::RELAY_BUFFER_SIZE,
            tcp_relay_timeout: crate::TCP_RELAY_TIMEOUT,
            udp_relay_timeout: crate::UDP_RELAY_TIMEOUT,
            max_udp_frame: crate::MAX_UDP_FRAME,
            snapshot_interval: crate::SNAPSHOT_INTERVAL,
            stats_interval: crate::STATS_INTERVAL,
            close_grace: crate::CLOSE_GRACE,
            event_log_cap: crate::EVENT_LOG_CAP,
            snapshot_history_cap: crate::SNAPSHOT_HISTORY_CAP,
            telemetry_path: std::env::temp_dir().join("netfence-telemetry.json"),
        }
    }
}

impl ProxyConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::config("max_connections must be at least 1"));
        }
        if self.relay_buffer_size == 0 {
            return Err(Error::config("relay_buffer_size must be at least 1"));
        }
        if self.max_udp_frame == 0 || self.max_udp_frame > u16::MAX as usize {
            return Err(Error::config("max_udp_frame must fit a u16 length prefix"));
        }
        if self.snapshot_interval.is_zero() {
            return Err(Error::config("snapshot_interval must be nonzero"));
        }
        if self.telemetry_path.as_os_str().is_empty() {
            return Err(Error::config("telemetry_path cannot be empty"));
        }
        Ok(())
    }
}

/// On-disk configuration, used by the standalone binary only. Every field
/// is optional; omitted fields keep their defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    /// Admission cap.
    pub max_connections: Option<usize>,
    /// TCP relay cap, seconds.
    pub tcp_relay_timeout_secs: Option<u64>,
    /// UDP reply timeout, seconds.
    pub udp_relay_timeout_secs: Option<u64>,
    /// Telemetry artifact path.
    pub telemetry_path: Option<PathBuf>,
    /// Initial policy, applied to the store before the proxy starts.
    pub policy: Option<PolicySection>,
}

/// `[policy]` table of the config file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PolicySection {
    /// Filter gate.
    pub enabled: Option<bool>,
    /// Domain → threshold map (`-1` no limit, `0` block, `n` byte budget).
    #[serde(default)]
    pub thresholds: HashMap<String, i64>,
}

impl ProxyConfigFile {
    /// Convert to a runtime configuration.
    pub fn to_config(&self) -> Result<ProxyConfig> {
        let mut config = ProxyConfig::default();
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(secs) = self.tcp_relay_timeout_secs {
            config.tcp_relay_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.udp_relay_timeout_secs {
            config.udp_relay_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = &self.telemetry_path {
            config.telemetry_path = path.clone();
        }
        config.validate()?;
        Ok(config)
    }
}
