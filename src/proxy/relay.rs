//! TCP relay engine.
//!
//! One relay is two unidirectional pumps sharing a tracker: upload
//! (client → target, where the SNI is sniffed from the first chunk) and
//! download (target → client, where the per-domain byte budget is
//! enforced). Either pump closing the relay stops the other through the
//! tracker's close signal; a hard wall-clock timer caps the whole relay.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::error::Result;
use crate::filter::PolicyStore;
use crate::proxy::sni::extract_sni;
use crate::proxy::socks5::{self, TargetAddr, REP_REFUSED, REP_SUCCESS};
use crate::server::metrics::ProxyMetrics;
use crate::server::telemetry::{
    EventKind, RelayTracker, TrafficLog, END_COMPLETE, END_READ_ERROR, END_RELAY_ERROR,
    END_SHUTDOWN, END_STREAM_BLOCKED, END_TARGET_FAILED, END_TIMEOUT,
};

/// Run an allowed CONNECT to completion: dial, reply, pump both directions.
///
/// The supervisor has already recorded the `Allowed` event and counted the
/// connection; everything from the dial on is accounted here.
#[allow(clippy::too_many_arguments)]
pub async fn run_tcp_relay(
    mut client: TcpStream,
    target: TargetAddr,
    conn_id: u64,
    policy: Arc<PolicyStore>,
    metrics: Arc<ProxyMetrics>,
    log: Arc<TrafficLog>,
    buffer_size: usize,
    relay_cap: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let tracker = log.register_relay(conn_id, target.host.clone(), target.port);
    arm_relay_cap(&tracker, &log, relay_cap);

    let target_stream = match dial(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            metrics.incr_errors();
            log.record_event(
                EventKind::Error,
                target.host.clone(),
                target.port,
                None,
                format!("connect failed: {e}"),
                None,
            );
            log.relay_end(&tracker, END_TARGET_FAILED);
            let _ = socks5::write_reply(&mut client, REP_REFUSED).await;
            return Ok(());
        }
    };
    target_stream.set_nodelay(true).ok();

    socks5::write_reply(&mut client, REP_SUCCESS).await?;

    let (client_read, client_write) = client.into_split();
    let (target_read, target_write) = target_stream.into_split();

    let up = tokio::spawn(upload_pump(
        client_read,
        target_write,
        Arc::clone(&tracker),
        Arc::clone(&log),
        buffer_size,
        shutdown.clone(),
    ));
    let down = tokio::spawn(download_pump(
        target_read,
        client_write,
        Arc::clone(&tracker),
        Arc::clone(&log),
        policy,
        buffer_size,
        shutdown,
    ));

    let _ = tokio::join!(up, down);
    Ok(())
}

/// The 120 s cap is armed once at relay start and never refreshed; a relay
/// that stays busy the whole time is still cut at the wall.
fn arm_relay_cap(tracker: &Arc<RelayTracker>, log: &Arc<TrafficLog>, cap: Duration) {
    let tracker = Arc::clone(tracker);
    let log = Arc::clone(log);
    let mut close_rx = tracker.close_signal();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(cap) => log.relay_end(&tracker, END_TIMEOUT),
            _ = close_rx.changed() => {}
        }
    });
}

async fn dial(addr: &TargetAddr) -> std::io::Result<TcpStream> {
    // Literal addresses skip the resolver; IPv6 text would otherwise be
    // ambiguous in a "host:port" string.
    match addr.host.parse::<IpAddr>() {
        Ok(ip) => TcpStream::connect((ip, addr.port)).await,
        Err(_) => TcpStream::connect((addr.host.as_str(), addr.port)).await,
    }
}

/// Client → target. Sniffs the SNI from the first chunk (latched whether or
/// not parsing succeeds), then forwards.
async fn upload_pump(
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    tracker: Arc<RelayTracker>,
    log: Arc<TrafficLog>,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut close_rx = tracker.close_signal();
    let mut buf = vec![0u8; buffer_size];

    while !tracker.is_closed() {
        tokio::select! {
            res = rd.read(&mut buf) => match res {
                Ok(0) => {
                    log.relay_end(&tracker, END_COMPLETE);
                    break;
                }
                Ok(n) => {
                    tracker.add_up(n as u64);
                    if tracker.try_latch_sni() {
                        if let Some(name) = extract_sni(&buf[..n]) {
                            tracing::debug!("relay {} sniffed SNI {name}", tracker.id());
                            tracker.set_sni(name);
                        }
                    }
                    if wr.write_all(&buf[..n]).await.is_err() {
                        log.relay_end(&tracker, END_RELAY_ERROR);
                        break;
                    }
                }
                Err(_) => {
                    log.relay_end(&tracker, END_READ_ERROR);
                    break;
                }
            },
            _ = close_rx.changed() => break,
            _ = shutdown.changed() => {
                log.relay_end(&tracker, END_SHUTDOWN);
                break;
            }
        }
    }

    let _ = wr.shutdown().await;
}

/// Target → client. Accumulates download bytes and enforces the per-domain
/// budget: strictly greater than the threshold, checked after adding the
/// chunk, and the crossing chunk is never forwarded.
async fn download_pump(
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    tracker: Arc<RelayTracker>,
    log: Arc<TrafficLog>,
    policy: Arc<PolicyStore>,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut close_rx = tracker.close_signal();
    let mut buf = vec![0u8; buffer_size];

    while !tracker.is_closed() {
        tokio::select! {
            res = rd.read(&mut buf) => match res {
                Ok(0) => {
                    log.relay_end(&tracker, END_COMPLETE);
                    break;
                }
                Ok(n) => {
                    let total = tracker.add_down(n as u64);
                    if let Some(name) = tracker.sni() {
                        if let Some(limit) = policy.stream_block_threshold(&name) {
                            if total > limit {
                                log.record_event(
                                    EventKind::StreamBlocked,
                                    tracker.host(),
                                    tracker.port(),
                                    Some(name),
                                    format!("download threshold exceeded: {total} > {limit} bytes"),
                                    Some(total),
                                );
                                log.relay_end(&tracker, END_STREAM_BLOCKED);
                                break;
                            }
                        }
                    }
                    if wr.write_all(&buf[..n]).await.is_err() {
                        log.relay_end(&tracker, END_RELAY_ERROR);
                        break;
                    }
                }
                Err(_) => {
                    log.relay_end(&tracker, END_READ_ERROR);
                    break;
                }
            },
            _ = close_rx.changed() => break,
            _ = shutdown.changed() => {
                log.relay_end(&tracker, END_SHUTDOWN);
                break;
            }
        }
    }

    let _ = wr.shutdown().await;
}
