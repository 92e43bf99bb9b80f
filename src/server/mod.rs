//! Proxy supervisor.
//!
//! Owns the loopback listener, admission control, connection ids, and the
//! background telemetry tasks. Per-connection work runs in spawned tasks;
//! all shared state lives behind the metrics/log handles those tasks clone.

pub mod config;
pub mod metrics;
pub mod telemetry;

pub use config::{PolicySection, ProxyConfig, ProxyConfigFile};
pub use metrics::{ProxyMetrics, StatsView};
pub use telemetry::{
    ConnectionSnapshot, DomainSnapshot, EventKind, TrafficEvent, TrafficLog, TrafficSnapshot,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::filter::{FilterDecision, PolicyStore};
use crate::proxy::socks5::{self, Socks5Command};
use crate::proxy::{relay, udp};

struct Running {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// The filtering SOCKS5 proxy.
///
/// `start` binds an ephemeral loopback port and reports it once through the
/// readiness callback; `stop` cancels the listener and timers and lets
/// outstanding relays drain through their normal close path.
pub struct FilterProxy {
    config: ProxyConfig,
    policy: Arc<PolicyStore>,
    metrics: Arc<ProxyMetrics>,
    log: Arc<TrafficLog>,
    next_conn_id: Arc<AtomicU64>,
    state: Mutex<Option<Running>>,
}

impl FilterProxy {
    /// Create a proxy over a shared policy store.
    pub fn new(config: ProxyConfig, policy: Arc<PolicyStore>) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(ProxyMetrics::new());
        let log = Arc::new(TrafficLog::new(
            Arc::clone(&metrics),
            config.telemetry_path.clone(),
            config.event_log_cap,
            config.snapshot_history_cap,
            config.close_grace,
        ));
        Ok(Self {
            config,
            policy,
            metrics,
            log,
            next_conn_id: Arc::new(AtomicU64::new(1)),
            state: Mutex::new(None),
        })
    }

    /// The shared policy store.
    pub fn policy(&self) -> Arc<PolicyStore> {
        Arc::clone(&self.policy)
    }

    /// Counter handle.
    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Telemetry handle.
    pub fn traffic_log(&self) -> Arc<TrafficLog> {
        Arc::clone(&self.log)
    }

    /// Bound port while running.
    pub fn local_port(&self) -> Option<u16> {
        self.state.lock().as_ref().map(|r| r.port)
    }

    /// Bind `127.0.0.1:0`, report the port through `on_ready` exactly once,
    /// and spawn the accept loop plus the telemetry timers.
    pub async fn start<F>(&self, on_ready: F) -> Result<()>
    where
        F: FnOnce(u16),
    {
        if self.state.lock().is_some() {
            return Err(Error::AlreadyRunning);
        }

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();

        // Fresh artifact each run; dashboards tolerate shrinking history.
        self.log.reset().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(accept_loop(
                listener,
                self.config.clone(),
                Arc::clone(&self.policy),
                Arc::clone(&self.metrics),
                Arc::clone(&self.log),
                Arc::clone(&self.next_conn_id),
                shutdown_rx.clone(),
            )),
            tokio::spawn(snapshot_loop(
                Arc::clone(&self.log),
                self.config.snapshot_interval,
                shutdown_rx.clone(),
            )),
            tokio::spawn(stats_loop(
                Arc::clone(&self.metrics),
                self.config.stats_interval,
                shutdown_rx,
            )),
        ];

        {
            let mut state = self.state.lock();
            if state.is_some() {
                // Lost a start/start race; tear down what was just spawned.
                let _ = shutdown_tx.send(true);
                return Err(Error::AlreadyRunning);
            }
            *state = Some(Running {
                port,
                shutdown_tx,
                tasks,
            });
        }

        tracing::info!("filter proxy listening on 127.0.0.1:{port}");
        on_ready(port);
        Ok(())
    }

    /// Stop the listener and timers. Idempotent; outstanding relays observe
    /// the shutdown signal and close themselves.
    pub async fn stop(&self) {
        let running = { self.state.lock().take() };
        let Some(running) = running else {
            return;
        };

        tracing::info!("stopping filter proxy on port {}", running.port);
        let _ = running.shutdown_tx.send(true);
        for task in running.tasks {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: ProxyConfig,
    policy: Arc<PolicyStore>,
    metrics: Arc<ProxyMetrics>,
    log: Arc<TrafficLog>,
    next_conn_id: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                    continue;
                }
            },
        };

        let conn_id = next_conn_id.fetch_add(1, Ordering::SeqCst);

        if metrics.active() >= config.max_connections as u64 {
            metrics.incr_errors();
            log.record_event(
                EventKind::Error,
                peer.ip().to_string(),
                peer.port(),
                None,
                "Connection limit reached",
                None,
            );
            tracing::warn!("connection {conn_id} from {peer} rejected: limit reached");
            continue;
        }
        metrics.connection_admitted();
        tracing::debug!("connection {conn_id} accepted from {peer}");

        let config = config.clone();
        let policy = Arc::clone(&policy);
        let metrics = Arc::clone(&metrics);
        let log = Arc::clone(&log);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut cancel = shutdown.clone();
            let outcome = tokio::select! {
                res = handle_connection(
                    stream,
                    conn_id,
                    &config,
                    Arc::clone(&policy),
                    Arc::clone(&metrics),
                    Arc::clone(&log),
                    shutdown,
                ) => res,
                // A connection still in its handshake is simply dropped on
                // shutdown; live relays log their own close.
                _ = cancel.changed() => Ok(()),
            };

            if let Err(e) = outcome {
                metrics.incr_errors();
                log.record_event(
                    EventKind::Error,
                    peer.ip().to_string(),
                    peer.port(),
                    None,
                    e.to_string(),
                    None,
                );
                tracing::debug!("connection {conn_id} failed: {e}");
            }
            metrics.connection_closed();
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    conn_id: u64,
    config: &ProxyConfig,
    policy: Arc<PolicyStore>,
    metrics: Arc<ProxyMetrics>,
    log: Arc<TrafficLog>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let leftover = socks5::read_greeting(&mut stream).await?;
    let (cmd, target) = socks5::read_request(&mut stream, leftover).await?;

    match cmd {
        Socks5Command::Connect => match policy.should_allow(&target.host, target.port) {
            FilterDecision::Block => {
                metrics.incr_tcp_blocked();
                log.record_event(
                    EventKind::Blocked,
                    target.host.clone(),
                    target.port,
                    None,
                    "Blocked by policy",
                    None,
                );
                tracing::debug!("connection {conn_id} to {target} blocked by policy");
                socks5::write_reply(&mut stream, socks5::REP_REFUSED).await?;
                Ok(())
            }
            FilterDecision::Allow => {
                metrics.incr_tcp_allowed();
                log.record_event(
                    EventKind::Allowed,
                    target.host.clone(),
                    target.port,
                    None,
                    "Connection allowed",
                    None,
                );
                relay::run_tcp_relay(
                    stream,
                    target,
                    conn_id,
                    policy,
                    metrics,
                    log,
                    config.relay_buffer_size,
                    config.tcp_relay_timeout,
                    shutdown,
                )
                .await
            }
        },
        Socks5Command::FwdUdp => {
            socks5::write_reply(&mut stream, socks5::REP_SUCCESS).await?;
            udp::run_udp_forwarder(
                &mut stream,
                policy,
                metrics,
                log,
                config.max_udp_frame,
                config.udp_relay_timeout,
                shutdown,
            )
            .await
        }
    }
}

async fn snapshot_loop(
    log: Arc<TrafficLog>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => log.emit_snapshot().await,
        }
    }
}

async fn stats_loop(
    metrics: Arc<ProxyMetrics>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let stats = metrics.stats();
                if stats.total_conns > 0 {
                    tracing::info!(
                        "conns: {} total, {} active | tcp: {} allowed, {} blocked | udp frames: {} | errors: {}",
                        stats.total_conns,
                        metrics.active(),
                        stats.tcp_allowed,
                        stats.tcp_blocked,
                        stats.udp_relayed,
                        stats.errors,
                    );
                }
            }
        }
    }
}
