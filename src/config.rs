//! Configuration management for the relay
//!
//! Settings come from three layers, highest precedence first: command line
//! flags / environment variables ([`ConfigOverrides`]), an optional YAML file
//! ([`Config::load`]), and built-in defaults.

use crate::constants::{
    DEFAULT_LISTEN_ADDR, DEFAULT_TARGET_ADDR, LOOPBACK_DIAL_HOST, WILDCARD_LISTEN_HOST,
};
use crate::protocol::{Command, ProxyHeader, ProxyHeaderHook, TransportProtocol, Version};
use crate::server::RelayConfig;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use tokio::fs;
use tracing::warn;

/// Transport announced in the PROXY header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HeaderTransport {
    Tcp,
    Udp,
}

impl From<HeaderTransport> for TransportProtocol {
    fn from(transport: HeaderTransport) -> Self {
        match transport {
            HeaderTransport::Tcp => TransportProtocol::Stream,
            HeaderTransport::Udp => TransportProtocol::Datagram,
        }
    }
}

/// PROXY header injection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHeaderConfig {
    /// Whether to prefix upstream connections with a PROXY header
    #[serde(default = "default_proxy_header_enabled")]
    pub enabled: bool,
    /// PROXY protocol version (1 or 2)
    #[serde(default = "default_proxy_version")]
    pub version: u8,
    /// Announced transport
    #[serde(default = "default_header_transport")]
    pub transport: HeaderTransport,
    /// Announced source address
    #[serde(default = "default_header_addr")]
    pub source_addr: IpAddr,
    /// Announced source port
    #[serde(default)]
    pub source_port: u16,
    /// Announced destination address
    #[serde(default = "default_header_addr")]
    pub destination_addr: IpAddr,
    /// Announced destination port
    #[serde(default)]
    pub destination_port: u16,
}

impl Default for ProxyHeaderConfig {
    fn default() -> Self {
        Self {
            enabled: default_proxy_header_enabled(),
            version: default_proxy_version(),
            transport: default_header_transport(),
            source_addr: default_header_addr(),
            source_port: 0,
            destination_addr: default_header_addr(),
            destination_port: 0,
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to accept clients on; `:port` means every interface
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Upstream every client is relayed to; `:port` means loopback
    #[serde(default = "default_target_addr")]
    pub target_addr: String,
    /// PROXY header injection
    #[serde(default)]
    pub proxy_header: ProxyHeaderConfig,
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Whether to log to file
    #[serde(default)]
    pub log_to_file: bool,
    /// Path to log file (used when log_to_file is true)
    #[serde(default)]
    pub log_file_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            target_addr: default_target_addr(),
            proxy_header: ProxyHeaderConfig::default(),
            log_level: default_log_level(),
            log_to_file: false,
            log_file_path: None,
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_target_addr() -> String {
    DEFAULT_TARGET_ADDR.to_string()
}

fn default_proxy_header_enabled() -> bool {
    true
}

fn default_proxy_version() -> u8 {
    2
}

fn default_header_transport() -> HeaderTransport {
    HeaderTransport::Tcp
}

fn default_header_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_log_level() -> String {
    "INFO".to_string()
}

/// Command line / environment settings that override the file
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    /// Address to listen on (host:port or :port)
    #[arg(long, env = "LISTENER_HOST")]
    pub listen: Option<String>,

    /// Upstream target address (host:port or :port)
    #[arg(long, env = "DEST_HOST")]
    pub target: Option<String>,

    /// Source address announced in the PROXY header
    #[arg(long, env = "SOURCE_ADDR")]
    pub source_addr: Option<IpAddr>,

    /// Source port announced in the PROXY header
    #[arg(long, env = "SOURCE_PORT")]
    pub source_port: Option<u16>,

    /// Destination address announced in the PROXY header
    #[arg(long, env = "DEST_ADDR")]
    pub dest_addr: Option<IpAddr>,

    /// Destination port announced in the PROXY header
    #[arg(long, env = "DEST_PORT")]
    pub dest_port: Option<u16>,

    /// Enable or disable PROXY header injection (true/false)
    #[arg(long, env = "PROXY_HEADER")]
    pub proxy_header: Option<bool>,

    /// PROXY protocol version (1 or 2)
    #[arg(long, env = "PROXY_VERSION")]
    pub proxy_version: Option<u8>,

    /// Transport announced in the PROXY header
    #[arg(long, value_enum)]
    pub proxy_transport: Option<HeaderTransport>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Also write logs to a daily rolling file
    #[arg(long)]
    pub log_to_file: bool,

    /// Log file path (used with --log-to-file)
    #[arg(long)]
    pub log_file: Option<String>,
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                let config: Config = serde_yaml::from_str(&contents)
                    .map_err(|e| anyhow!("Failed to parse YAML configuration: {}", e))?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Configuration file not found at '{}', using default configuration",
                    path.as_ref().display()
                );
                Ok(Config::default())
            }
            Err(e) => Err(anyhow!(
                "Failed to read configuration file '{}': {}",
                path.as_ref().display(),
                e
            )),
        }
    }

    /// Apply command line / environment overrides and re-validate.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) -> anyhow::Result<()> {
        if let Some(listen) = overrides.listen {
            self.listen_addr = listen;
        }
        if let Some(target) = overrides.target {
            self.target_addr = target;
        }

        let header = &mut self.proxy_header;
        if let Some(enabled) = overrides.proxy_header {
            header.enabled = enabled;
        }
        if let Some(version) = overrides.proxy_version {
            header.version = version;
        }
        if let Some(transport) = overrides.proxy_transport {
            header.transport = transport;
        }
        if let Some(addr) = overrides.source_addr {
            header.source_addr = addr;
        }
        if let Some(port) = overrides.source_port {
            header.source_port = port;
        }
        if let Some(addr) = overrides.dest_addr {
            header.destination_addr = addr;
        }
        if let Some(port) = overrides.dest_port {
            header.destination_port = port;
        }

        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        if overrides.log_to_file {
            self.log_to_file = true;
        }
        if overrides.log_file.is_some() {
            self.log_file_path = overrides.log_file;
        }

        self.validate()
    }

    /// Validate configuration fields
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.log_level.to_uppercase().as_str()) {
            return Err(anyhow!("Invalid log level: {}", self.log_level));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if path.trim().is_empty() {
                    return Err(anyhow!("Log file path cannot be empty when log_to_file is true"));
                }
            }
        }

        if self.listen_addr.trim().is_empty() {
            return Err(anyhow!("Listen address cannot be empty"));
        }
        if self.target_addr.trim().is_empty() {
            return Err(anyhow!("Target address cannot be empty"));
        }

        if self.proxy_header.enabled {
            self.header()?.validate()?;
        }

        Ok(())
    }

    /// Listen address with a bare `:port` expanded to every interface.
    pub fn listen_addr(&self) -> String {
        expand_bare_port(&self.listen_addr, WILDCARD_LISTEN_HOST)
    }

    /// Target address with a bare `:port` expanded to loopback.
    pub fn target_addr(&self) -> String {
        expand_bare_port(&self.target_addr, LOOPBACK_DIAL_HOST)
    }

    /// The PROXY header to inject, if enabled.
    pub fn proxy_header(&self) -> anyhow::Result<Option<ProxyHeader>> {
        if !self.proxy_header.enabled {
            return Ok(None);
        }
        Ok(Some(self.header()?))
    }

    /// Build the immutable engine configuration.
    pub fn relay_config(&self) -> anyhow::Result<RelayConfig> {
        let relay = RelayConfig::new(self.listen_addr(), self.target_addr());
        Ok(match self.proxy_header()? {
            Some(header) => relay.with_setup_hook(ProxyHeaderHook::new(header)),
            None => relay,
        })
    }

    fn header(&self) -> anyhow::Result<ProxyHeader> {
        let settings = &self.proxy_header;
        Ok(ProxyHeader {
            version: Version::try_from(settings.version)?,
            command: Command::Proxy,
            transport: settings.transport.into(),
            source: SocketAddr::new(settings.source_addr, settings.source_port),
            destination: SocketAddr::new(settings.destination_addr, settings.destination_port),
        })
    }
}

fn expand_bare_port(addr: &str, host: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("{}:{}", host, port),
        None => addr.to_string(),
    }
}
