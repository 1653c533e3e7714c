//! PROXY protocol preamble encoding
//!
//! Builds the header that announces a (simulated) originating connection to
//! the upstream before any relayed byte. Version 2 is the binary format;
//! version 1 is the single human-readable line. A version 2 parser is
//! included so emitted headers can be checked against the wire format.

use crate::constants::{
    PROXY_V1_MAX_LENGTH, PROXY_V2_FIXED_LENGTH, PROXY_V2_IPV4_ADDRESSES_LENGTH,
    PROXY_V2_IPV6_ADDRESSES_LENGTH, PROXY_V2_SIGNATURE,
};
use crate::filter::{ConnectionSetupHook, SetupFuture};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Errors that can occur while encoding, writing or parsing a PROXY header.
#[derive(Error, Debug)]
pub enum HeaderError {
    /// Writing the header to the upstream failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Source and destination are not both IPv4 or both IPv6.
    #[error("Source and destination address families differ")]
    AddressFamilyMismatch,
    /// Only versions 1 and 2 exist.
    #[error("Unsupported PROXY protocol version: {0}")]
    UnsupportedVersion(u8),
    /// The requested transport cannot be expressed in this version.
    #[error("Unsupported transport for PROXY protocol v{version}: {transport}")]
    UnsupportedTransport {
        version: u8,
        transport: TransportProtocol,
    },
    /// Malformed bytes handed to the parser.
    #[error("Parse error: {0}")]
    Parse(String),
}

/// PROXY protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Text format
    One,
    /// Binary format
    Two,
}

impl TryFrom<u8> for Version {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Version::One),
            2 => Ok(Version::Two),
            _ => Err(HeaderError::UnsupportedVersion(value)),
        }
    }
}

impl From<Version> for u8 {
    fn from(version: Version) -> Self {
        match version {
            Version::One => 1,
            Version::Two => 2,
        }
    }
}

/// Low nibble of the version 2 version/command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Connection established by the proxy itself (health checks); addresses are omitted
    Local = 0x0,
    /// Relayed connection on behalf of the described client
    Proxy = 0x1,
}

/// Transport carried inside the described connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportProtocol {
    Stream = 0x1,
    Datagram = 0x2,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Stream => f.write_str("TCP"),
            TransportProtocol::Datagram => f.write_str("UDP"),
        }
    }
}

// Address family, high nibble of the family/protocol byte
const AF_UNSPEC: u8 = 0x0;
const AF_INET: u8 = 0x1;
const AF_INET6: u8 = 0x2;

/// Describes the connection announced to the upstream
///
/// Built once from configuration; the addresses are whatever the operator
/// configured and have nothing to do with the real client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: Version,
    pub command: Command,
    pub transport: TransportProtocol,
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl ProxyHeader {
    /// Version 2 `PROXY` header for a TCP connection from `source` to `destination`.
    pub fn tcp(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            version: Version::Two,
            command: Command::Proxy,
            transport: TransportProtocol::Stream,
            source,
            destination,
        }
    }

    /// Check that the header can be encoded in its version.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.command == Command::Proxy && self.source.is_ipv4() != self.destination.is_ipv4() {
            return Err(HeaderError::AddressFamilyMismatch);
        }
        if self.version == Version::One && self.transport != TransportProtocol::Stream {
            return Err(HeaderError::UnsupportedTransport {
                version: self.version.into(),
                transport: self.transport,
            });
        }
        Ok(())
    }

    /// Encode the preamble.
    pub fn encode(&self) -> Result<Vec<u8>, HeaderError> {
        self.validate()?;
        match self.version {
            Version::One => Ok(self.encode_v1()),
            Version::Two => self.encode_v2(),
        }
    }

    fn encode_v1(&self) -> Vec<u8> {
        let line = match self.command {
            Command::Local => "PROXY UNKNOWN\r\n".to_string(),
            Command::Proxy => {
                let family = if self.source.is_ipv4() { "TCP4" } else { "TCP6" };
                format!(
                    "PROXY {} {} {} {} {}\r\n",
                    family,
                    self.source.ip(),
                    self.destination.ip(),
                    self.source.port(),
                    self.destination.port()
                )
            }
        };
        debug_assert!(line.len() <= PROXY_V1_MAX_LENGTH);
        line.into_bytes()
    }

    fn encode_v2(&self) -> Result<Vec<u8>, HeaderError> {
        let (family, addresses_len) = match (self.command, self.source.ip()) {
            (Command::Local, _) => (AF_UNSPEC, 0),
            (Command::Proxy, IpAddr::V4(_)) => (AF_INET, PROXY_V2_IPV4_ADDRESSES_LENGTH),
            (Command::Proxy, IpAddr::V6(_)) => (AF_INET6, PROXY_V2_IPV6_ADDRESSES_LENGTH),
        };
        let family_protocol = if family == AF_UNSPEC {
            0x00
        } else {
            (family << 4) | self.transport as u8
        };

        let mut bytes = Vec::with_capacity(PROXY_V2_FIXED_LENGTH + addresses_len);
        bytes.extend_from_slice(&PROXY_V2_SIGNATURE);
        bytes.write_u8((u8::from(Version::Two) << 4) | self.command as u8)?;
        bytes.write_u8(family_protocol)?;
        bytes.write_u16::<BigEndian>(addresses_len as u16)?;

        if self.command == Command::Proxy {
            match (self.source.ip(), self.destination.ip()) {
                (IpAddr::V4(src), IpAddr::V4(dst)) => {
                    bytes.extend_from_slice(&src.octets());
                    bytes.extend_from_slice(&dst.octets());
                }
                (IpAddr::V6(src), IpAddr::V6(dst)) => {
                    bytes.extend_from_slice(&src.octets());
                    bytes.extend_from_slice(&dst.octets());
                }
                _ => return Err(HeaderError::AddressFamilyMismatch),
            }
            bytes.write_u16::<BigEndian>(self.source.port())?;
            bytes.write_u16::<BigEndian>(self.destination.port())?;
        }

        Ok(bytes)
    }

    /// Parse a version 2 preamble from the start of `data`.
    ///
    /// Returns the header and the number of bytes it occupied, TLVs included.
    /// `LOCAL` headers come back with unspecified IPv4 addresses.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), HeaderError> {
        if data.len() < PROXY_V2_FIXED_LENGTH {
            return Err(HeaderError::Parse(format!(
                "Header too short: {} bytes",
                data.len()
            )));
        }
        if data[..PROXY_V2_SIGNATURE.len()] != PROXY_V2_SIGNATURE {
            return Err(HeaderError::Parse("Missing PROXY v2 signature".to_string()));
        }

        let mut cursor = Cursor::new(&data[PROXY_V2_SIGNATURE.len()..]);
        let version_command = cursor.read_u8()?;
        let family_protocol = cursor.read_u8()?;
        let length = cursor.read_u16::<BigEndian>()? as usize;

        if version_command >> 4 != u8::from(Version::Two) {
            return Err(HeaderError::UnsupportedVersion(version_command >> 4));
        }
        let command = match version_command & 0x0F {
            0x0 => Command::Local,
            0x1 => Command::Proxy,
            other => return Err(HeaderError::Parse(format!("Unknown command: 0x{:x}", other))),
        };

        let total = PROXY_V2_FIXED_LENGTH + length;
        if data.len() < total {
            return Err(HeaderError::Parse(format!(
                "Truncated header: need {} bytes, have {}",
                total,
                data.len()
            )));
        }

        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let transport = match (family_protocol >> 4, family_protocol & 0x0F) {
            // UNSPEC family with UNSPEC transport, as sent with LOCAL
            (AF_UNSPEC, 0x0) => TransportProtocol::Stream,
            (_, 0x1) => TransportProtocol::Stream,
            (_, 0x2) => TransportProtocol::Datagram,
            (_, other) => {
                return Err(HeaderError::Parse(format!(
                    "Unknown transport protocol: 0x{:x}",
                    other
                )))
            }
        };

        let (source, destination) = match (command, family_protocol >> 4) {
            (Command::Local, _) | (_, AF_UNSPEC) => (unspecified, unspecified),
            (Command::Proxy, AF_INET) => {
                if length < PROXY_V2_IPV4_ADDRESSES_LENGTH {
                    return Err(HeaderError::Parse("IPv4 address block too short".to_string()));
                }
                let mut src = [0u8; 4];
                let mut dst = [0u8; 4];
                cursor.read_exact(&mut src)?;
                cursor.read_exact(&mut dst)?;
                let src_port = cursor.read_u16::<BigEndian>()?;
                let dst_port = cursor.read_u16::<BigEndian>()?;
                (
                    SocketAddr::new(Ipv4Addr::from(src).into(), src_port),
                    SocketAddr::new(Ipv4Addr::from(dst).into(), dst_port),
                )
            }
            (Command::Proxy, AF_INET6) => {
                if length < PROXY_V2_IPV6_ADDRESSES_LENGTH {
                    return Err(HeaderError::Parse("IPv6 address block too short".to_string()));
                }
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                cursor.read_exact(&mut src)?;
                cursor.read_exact(&mut dst)?;
                let src_port = cursor.read_u16::<BigEndian>()?;
                let dst_port = cursor.read_u16::<BigEndian>()?;
                (
                    SocketAddr::new(Ipv6Addr::from(src).into(), src_port),
                    SocketAddr::new(Ipv6Addr::from(dst).into(), dst_port),
                )
            }
            (_, family) => {
                return Err(HeaderError::Parse(format!(
                    "Unsupported address family: 0x{:x}",
                    family
                )))
            }
        };

        Ok((
            Self {
                version: Version::Two,
                command,
                transport,
                source,
                destination,
            },
            total,
        ))
    }
}

/// Encode `header` and write it to `dst`.
///
/// On failure `dst` is shut down before the error is returned, so the caller
/// never relays payload over a connection that is missing its preamble.
pub async fn write_header<W>(header: &ProxyHeader, dst: &mut W) -> Result<(), HeaderError>
where
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let result = async {
        let bytes = header.encode()?;
        dst.write_all(&bytes).await?;
        dst.flush().await?;
        Ok::<usize, HeaderError>(bytes.len())
    }
    .await;

    match result {
        Ok(len) => {
            debug!("Wrote {} byte PROXY header ({} -> {})", len, header.source, header.destination);
            Ok(())
        }
        Err(e) => {
            warn!("Failed to write PROXY header: {}", e);
            let _ = dst.shutdown().await;
            Err(e)
        }
    }
}

/// Setup hook that prefixes every upstream connection with a PROXY header
#[derive(Debug, Clone)]
pub struct ProxyHeaderHook {
    header: ProxyHeader,
}

impl ProxyHeaderHook {
    pub fn new(header: ProxyHeader) -> Self {
        Self { header }
    }
}

impl ConnectionSetupHook for ProxyHeaderHook {
    fn setup<'a>(&'a self, upstream: &'a mut TcpStream) -> SetupFuture<'a> {
        Box::pin(async move {
            write_header(&self.header, upstream).await.map_err(|e| match e {
                HeaderError::Io(io) => io,
                other => io::Error::new(io::ErrorKind::InvalidInput, other),
            })
        })
    }
}
