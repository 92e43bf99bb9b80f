//! FWD_UDP framer.
//!
//! After a `0x05` request is accepted, the client connection becomes a
//! stream of `[u16 BE N][N bytes]` frames. Each payload is one reserved
//! byte, a SOCKS5 address, and a raw datagram. The datagram goes out on a
//! one-shot UDP socket; at most one reply is awaited and framed back with
//! the original header prefix copied verbatim.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::filter::{FilterDecision, PolicyStore};
use crate::proxy::socks5::{parse_addr, AddrParse, TargetAddr};
use crate::server::metrics::ProxyMetrics;
use crate::server::telemetry::{EventKind, TrafficLog};

/// Loop on the client connection relaying FWD_UDP frames until EOF,
/// shutdown, or a malformed frame.
pub async fn run_udp_forwarder<S>(
    client: &mut S,
    policy: Arc<PolicyStore>,
    metrics: Arc<ProxyMetrics>,
    log: Arc<TrafficLog>,
    max_frame: usize,
    reply_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut len_buf = [0u8; 2];

    loop {
        tokio::select! {
            res = client.read_exact(&mut len_buf) => match res {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            },
            _ = shutdown.changed() => return Ok(()),
        }

        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > max_frame {
            return Err(Error::FrameLength(frame_len));
        }

        let mut payload = vec![0u8; frame_len];
        client.read_exact(&mut payload).await?;

        // Reserved byte at offset 0, address at offset 1, datagram after.
        let (addr, header_end) = match parse_addr(&payload, 1) {
            AddrParse::Parsed { addr, header_end } => (addr, header_end),
            _ => return Err(Error::BadAddress),
        };

        metrics.incr_udp_relayed();

        if policy.should_allow(&addr.host, addr.port) == FilterDecision::Block {
            log.record_event(
                EventKind::Blocked,
                addr.host.clone(),
                addr.port,
                None,
                "UDP frame blocked by policy",
                None,
            );
            continue;
        }

        if let Some(reply) = relay_datagram(&addr, &payload[header_end..], reply_timeout).await {
            let framed_len = header_end + reply.len();
            if framed_len > u16::MAX as usize {
                tracing::debug!("UDP reply for {addr} too large to frame, dropping");
                continue;
            }
            let mut frame = Vec::with_capacity(2 + framed_len);
            frame.extend_from_slice(&(framed_len as u16).to_be_bytes());
            frame.extend_from_slice(&payload[..header_end]);
            frame.extend_from_slice(&reply);
            client.write_all(&frame).await?;
        }
    }
}

/// Send one datagram from a fresh socket and wait for a single reply.
/// Returns `None` on any socket error or when the reply timeout elapses;
/// the socket is closed either way.
async fn relay_datagram(
    addr: &TargetAddr,
    datagram: &[u8],
    reply_timeout: Duration,
) -> Option<Vec<u8>> {
    let socket = match addr.host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => UdpSocket::bind(("::", 0)).await.ok()?,
        _ => UdpSocket::bind(("0.0.0.0", 0)).await.ok()?,
    };
    match addr.host.parse::<IpAddr>() {
        Ok(ip) => socket.connect((ip, addr.port)).await.ok()?,
        Err(_) => socket.connect((addr.host.as_str(), addr.port)).await.ok()?,
    }
    socket.send(datagram).await.ok()?;

    let mut buf = vec![0u8; 65535];
    match tokio::time::timeout(reply_timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Some(buf)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps() -> (Arc<PolicyStore>, Arc<ProxyMetrics>, Arc<TrafficLog>) {
        let metrics = Arc::new(ProxyMetrics::new());
        let log = Arc::new(TrafficLog::new(
            Arc::clone(&metrics),
            std::env::temp_dir().join(format!("netfence-udp-test-{}.json", std::process::id())),
            500,
            300,
            Duration::ZERO,
        ));
        (Arc::new(PolicyStore::new()), metrics, log)
    }

    fn frame_for(addr: &TargetAddr, datagram: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x00]; // reserved
        payload.extend_from_slice(&addr.encode());
        payload.extend_from_slice(datagram);
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    #[tokio::test]
    async fn test_round_trip_against_echo() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (n, peer) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], peer).await.unwrap();
        });

        let (policy, metrics, log) = deps();
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (mut client, mut server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            run_udp_forwarder(
                &mut server,
                policy,
                metrics.clone(),
                log,
                9000,
                Duration::from_secs(5),
                shutdown,
            )
            .await
            .unwrap();
            metrics
        });

        let addr = TargetAddr {
            host: echo_addr.ip().to_string(),
            port: echo_addr.port(),
        };
        let query = b"\x12\x34query";
        client.write_all(&frame_for(&addr, query)).await.unwrap();

        let mut len_buf = [0u8; 2];
        client.read_exact(&mut len_buf).await.unwrap();
        let n = u16::from_be_bytes(len_buf) as usize;
        let mut reply = vec![0u8; n];
        client.read_exact(&mut reply).await.unwrap();

        // Header prefix (reserved byte + address) copied verbatim, then the
        // echoed datagram.
        let prefix_len = 1 + addr.encode().len();
        assert_eq!(reply[0], 0x00);
        assert_eq!(&reply[prefix_len..], &query[..]);

        drop(client); // EOF ends the loop cleanly
        let metrics = handle.await.unwrap();
        assert_eq!(metrics.stats().udp_relayed, 1);
    }

    #[tokio::test]
    async fn test_zero_length_frame_aborts() {
        let (policy, metrics, log) = deps();
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (mut client, mut server) = tokio::io::duplex(256);

        client.write_all(&[0x00, 0x00]).await.unwrap();

        let err = run_udp_forwarder(
            &mut server,
            policy,
            metrics,
            log,
            9000,
            Duration::from_secs(1),
            shutdown,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::FrameLength(0)));
    }

    #[tokio::test]
    async fn test_oversize_frame_aborts() {
        let (policy, metrics, log) = deps();
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (mut client, mut server) = tokio::io::duplex(256);

        client
            .write_all(&(9001u16).to_be_bytes())
            .await
            .unwrap();

        let err = run_udp_forwarder(
            &mut server,
            policy,
            metrics,
            log,
            9000,
            Duration::from_secs(1),
            shutdown,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::FrameLength(9001)));
    }

    #[tokio::test]
    async fn test_blocked_destination_is_dropped() {
        let (policy, metrics, log) = deps();
        let (_shutdown_tx, shutdown) = watch::channel(false);
        policy.set_threshold("127.0.0.1", 0);

        let (mut client, mut server) = tokio::io::duplex(4096);
        let log2 = Arc::clone(&log);
        let metrics2 = Arc::clone(&metrics);
        let handle = tokio::spawn(async move {
            run_udp_forwarder(
                &mut server,
                policy,
                metrics2,
                log2,
                9000,
                Duration::from_millis(100),
                shutdown,
            )
            .await
        });

        let addr = TargetAddr { host: "127.0.0.1".into(), port: 53 };
        client.write_all(&frame_for(&addr, b"q")).await.unwrap();
        drop(client);

        handle.await.unwrap().unwrap();
        assert_eq!(metrics.stats().udp_relayed, 1);
        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Blocked);
    }
}
