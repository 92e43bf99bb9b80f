//! # netfence
//!
//! An on-device filtering SOCKS5 proxy. Sits between a packet tunnel
//! (tun2socks) and the real network on the loopback interface:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Packet Tunnel                         │
//! │                  (tun2socks client)                       │
//! └───────────────────────────┬──────────────────────────────┘
//!                             │ SOCKS5 over 127.0.0.1
//! ┌───────────────────────────▼──────────────────────────────┐
//! │                       netfence                            │
//! │  ┌───────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │  SOCKS5   │  │ Policy filter │  │  Relay engine    │   │
//! │  │  codec    │  │ (allow/block) │  │  (TCP + FWD_UDP) │   │
//! │  └───────────┘  └──────────────┘  └──────────────────┘   │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  Telemetry: trackers, event log, 1 Hz JSON snapshot │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └───────────────────────────┬──────────────────────────────┘
//!                             │ TCP / UDP
//!                        real network
//! ```
//!
//! Supported wire surface: RFC 1928 no-auth CONNECT plus the
//! hev-socks5-tunnel FWD_UDP extension (command `0x05`) carrying UDP
//! datagrams as length-prefixed frames over the control connection.
//!
//! The filter consults a shared [`PolicyStore`]: a domain that maps to `0`
//! is refused at CONNECT time; a positive threshold closes the relay once
//! cumulative download bytes exceed it (the domain is recognised by
//! sniffing the TLS SNI from the first upload chunk); `-1` means no limit.
//! Every second the supervisor serialises active relays, counters, and top
//! domains to a JSON artifact an out-of-process dashboard polls.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

use std::time::Duration;

pub mod error;
pub mod filter;
pub mod proxy;
pub mod server;

pub use error::{Error, Result};
pub use filter::{FilterDecision, PolicyStore};
pub use server::{FilterProxy, ProxyConfig};

/// Per-direction relay read buffer size (bytes).
pub const RELAY_BUFFER_SIZE: usize = 65536;

/// Maximum concurrently live client connections.
pub const MAX_CONNECTIONS: usize = 500;

/// Hard wall-clock cap on a TCP relay, armed at relay start.
pub const TCP_RELAY_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a forwarded UDP datagram may wait for its single reply.
pub const UDP_RELAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest accepted FWD_UDP frame payload (bytes).
pub const MAX_UDP_FRAME: usize = 9000;

/// Telemetry snapshot emission period.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Operational stats log period.
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// How long a closed relay stays visible in snapshots.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Event log ring capacity (oldest dropped).
pub const EVENT_LOG_CAP: usize = 500;

/// Snapshot history ring capacity (5 min at 1 Hz).
pub const SNAPSHOT_HISTORY_CAP: usize = 300;
