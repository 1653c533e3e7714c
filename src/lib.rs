//! Transparent TCP relay
//!
//! Accepts client connections, dials one fixed upstream per client and copies
//! bytes both ways. Upstream connections can be prefixed with a PROXY protocol
//! header, and either direction can be rewritten in flight by a filter.

pub mod config;
pub mod constants;
pub mod filter;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod transport;

pub use filter::{ByteFilter, ConnectionSetupHook, FilterFactory};
pub use protocol::{ProxyHeader, ProxyHeaderHook};
pub use server::{RelayConfig, RelayError, Server};
