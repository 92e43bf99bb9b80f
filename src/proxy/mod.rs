//! SOCKS5 wire handling and relay engines.

pub mod relay;
pub mod sni;
pub mod socks5;
pub mod udp;

pub use socks5::{Socks5Command, TargetAddr};
