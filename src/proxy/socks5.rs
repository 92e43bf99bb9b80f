//! SOCKS5 wire codec.
//!
//! Covers the no-auth subset of RFC 1928 this proxy speaks: method
//! negotiation, the CONNECT request, the canonical 10-byte reply, plus the
//! FWD_UDP extension command. The address parser takes an explicit ATYP
//! offset so the same code serves requests (`atyp` at offset 3) and FWD_UDP
//! frame payloads (`atyp` at offset 1, after the reserved byte).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// SOCKS protocol version.
pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication required" method byte.
pub const METHOD_NO_AUTH: u8 = 0x00;

/// Reply: succeeded.
pub const REP_SUCCESS: u8 = 0x00;
/// Reply: connection refused (policy block or target failure).
pub const REP_REFUSED: u8 = 0x05;
/// Reply: command not supported.
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
/// Reply: address type not supported.
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// ATYP: IPv4.
pub const ATYP_IPV4: u8 = 0x01;
/// ATYP: domain name.
pub const ATYP_DOMAIN: u8 = 0x03;
/// ATYP: IPv6.
pub const ATYP_IPV6: u8 = 0x04;

/// Largest possible request: 4-byte header + 1 length byte + 255-byte
/// domain + 2-byte port. A request that exceeds this without parsing is
/// malformed.
pub const REQUEST_HEADER_MAX: usize = 262;

/// Request commands the proxy implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Command {
    /// Standard TCP CONNECT (0x01).
    Connect,
    /// hev-socks5-tunnel UDP-over-TCP extension (0x05).
    FwdUdp,
}

impl Socks5Command {
    /// Decode a request command byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Connect),
            0x05 => Some(Self::FwdUdp),
            _ => None,
        }
    }
}

/// A destination as the peer sent it: domain as-is, IPv4 dotted quad, IPv6
/// colon-hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    /// Textual host.
    pub host: String,
    /// Destination port.
    pub port: u16,
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl TargetAddr {
    /// Encode back to SOCKS5 address form: `ATYP + address + port`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Ok(v4) = self.host.parse::<std::net::Ipv4Addr>() {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.octets());
        } else if let Ok(v6) = self.host.parse::<std::net::Ipv6Addr>() {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.octets());
        } else {
            let name = self.host.as_bytes();
            debug_assert!(!name.is_empty() && name.len() <= 255);
            buf.push(ATYP_DOMAIN);
            buf.push(name.len() as u8);
            buf.extend_from_slice(name);
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf
    }
}

/// Outcome of [`parse_addr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrParse {
    /// Address parsed; `header_end` is the offset of the first byte after
    /// the port (FWD_UDP callers use it to locate the datagram).
    Parsed {
        /// The parsed destination.
        addr: TargetAddr,
        /// Offset just past the 2-byte port.
        header_end: usize,
    },
    /// The buffer ends before the address is complete; streaming callers
    /// may read more, frame-shaped callers must treat this as invalid.
    Incomplete,
    /// Unknown ATYP, empty domain, non-UTF-8 domain, or port 0.
    Invalid,
}

/// Parse a SOCKS5 address with the ATYP byte at `atyp_offset`.
///
/// Pure function of the buffer and offset; shared between request parsing
/// (`atyp_offset = 3`) and FWD_UDP frame parsing (`atyp_offset = 1`).
pub fn parse_addr(buf: &[u8], atyp_offset: usize) -> AddrParse {
    let Some(&atyp) = buf.get(atyp_offset) else {
        return AddrParse::Incomplete;
    };
    let cursor = atyp_offset + 1;

    let (host, addr_len) = match atyp {
        ATYP_IPV4 => {
            if buf.len() < cursor + 4 {
                return AddrParse::Incomplete;
            }
            let host = format!(
                "{}.{}.{}.{}",
                buf[cursor],
                buf[cursor + 1],
                buf[cursor + 2],
                buf[cursor + 3]
            );
            (host, 4)
        }
        ATYP_DOMAIN => {
            if buf.len() < cursor + 1 {
                return AddrParse::Incomplete;
            }
            let name_len = buf[cursor] as usize;
            if name_len == 0 {
                return AddrParse::Invalid;
            }
            if buf.len() < cursor + 1 + name_len {
                return AddrParse::Incomplete;
            }
            match std::str::from_utf8(&buf[cursor + 1..cursor + 1 + name_len]) {
                Ok(name) => (name.to_string(), 1 + name_len),
                Err(_) => return AddrParse::Invalid,
            }
        }
        ATYP_IPV6 => {
            if buf.len() < cursor + 16 {
                return AddrParse::Incomplete;
            }
            let mut groups = [0u16; 8];
            for (i, group) in groups.iter_mut().enumerate() {
                *group = u16::from_be_bytes([buf[cursor + i * 2], buf[cursor + i * 2 + 1]]);
            }
            let host = format!(
                "{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}",
                groups[0], groups[1], groups[2], groups[3], groups[4], groups[5], groups[6],
                groups[7]
            );
            (host, 16)
        }
        _ => return AddrParse::Invalid,
    };

    let port_at = cursor + addr_len;
    if buf.len() < port_at + 2 {
        return AddrParse::Incomplete;
    }
    let port = u16::from_be_bytes([buf[port_at], buf[port_at + 1]]);
    if port == 0 {
        return AddrParse::Invalid;
    }

    AddrParse::Parsed {
        addr: TargetAddr { host, port },
        header_end: port_at + 2,
    }
}

/// Encode the canonical 10-byte reply with bound address `0.0.0.0:0`.
pub fn encode_reply(rep: u8) -> [u8; 10] {
    [SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Write a SOCKS5 reply.
pub async fn write_reply<S>(stream: &mut S, rep: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(rep)).await?;
    Ok(())
}

/// Consume the method-negotiation greeting and answer "no auth".
///
/// Returns any excess bytes from the same read: when the peer pipelines,
/// those are the start of the request and must not be lost.
pub async fn read_greeting<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 512];
    let mut have = 0usize;

    while have < 2 {
        let n = stream.read(&mut buf[have..]).await?;
        if n == 0 {
            return Err(Error::protocol("connection closed during greeting"));
        }
        have += n;
    }

    if buf[0] != SOCKS_VERSION {
        return Err(Error::protocol(format!(
            "unexpected version byte 0x{:02x}",
            buf[0]
        )));
    }
    let nmethods = buf[1] as usize;
    if nmethods == 0 {
        return Err(Error::protocol("greeting offers no auth methods"));
    }

    let methods_end = 2 + nmethods;
    while have < methods_end {
        let n = stream.read(&mut buf[have..]).await?;
        if n == 0 {
            return Err(Error::protocol("connection closed during greeting"));
        }
        have += n;
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    Ok(buf[methods_end..have].to_vec())
}

/// Read and parse the request that follows the greeting.
///
/// `leftover` carries bytes the greeting read pulled past the method list.
/// Failure replies (`0x07` unsupported command, `0x08` bad address) are
/// written here before the error is returned; the caller only closes.
pub async fn read_request<S>(stream: &mut S, leftover: Vec<u8>) -> Result<(Socks5Command, TargetAddr)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = leftover;
    let mut chunk = [0u8; 512];

    while buf.len() < 4 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::protocol("connection closed during request"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    if buf[0] != SOCKS_VERSION {
        return Err(Error::protocol(format!(
            "unexpected request version 0x{:02x}",
            buf[0]
        )));
    }
    if buf[2] != 0x00 {
        return Err(Error::protocol("nonzero reserved byte in request"));
    }
    let Some(cmd) = Socks5Command::from_byte(buf[1]) else {
        write_reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(Error::UnsupportedCommand(buf[1]));
    };

    loop {
        match parse_addr(&buf, 3) {
            AddrParse::Parsed { addr, .. } => return Ok((cmd, addr)),
            AddrParse::Invalid => {
                write_reply(stream, REP_ADDR_NOT_SUPPORTED).await?;
                return Err(Error::BadAddress);
            }
            AddrParse::Incomplete => {
                if buf.len() > REQUEST_HEADER_MAX {
                    write_reply(stream, REP_ADDR_NOT_SUPPORTED).await?;
                    return Err(Error::BadAddress);
                }
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(Error::protocol("connection closed during request"));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}
