//! Global constants for the relay and the PROXY protocol preamble

// ============================================================================
// BUFFER SIZES
// ============================================================================

/// Size of the read buffer each copy loop reuses (64KB)
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// DEFAULT ENDPOINTS
// ============================================================================

/// Default listen address (all interfaces, port 4444)
pub const DEFAULT_LISTEN_ADDR: &str = ":4444";

/// Default upstream target (local port 80)
pub const DEFAULT_TARGET_ADDR: &str = ":80";

/// Host substituted for a bare `:port` listen address
pub const WILDCARD_LISTEN_HOST: &str = "0.0.0.0";

/// Host substituted for a bare `:port` dial address
pub const LOOPBACK_DIAL_HOST: &str = "127.0.0.1";

// ============================================================================
// PROXY PROTOCOL
// ============================================================================

/// Signature that opens every version 2 preamble
pub const PROXY_V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";

/// Signature, version/command, family/protocol and length
pub const PROXY_V2_FIXED_LENGTH: usize = 16;

/// Address block size for IPv4 (two addresses, two ports)
pub const PROXY_V2_IPV4_ADDRESSES_LENGTH: usize = 12;

/// Address block size for IPv6 (two addresses, two ports)
pub const PROXY_V2_IPV6_ADDRESSES_LENGTH: usize = 36;

/// Longest possible version 1 line, CRLF included
pub const PROXY_V1_MAX_LENGTH: usize = 107;
