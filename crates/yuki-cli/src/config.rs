//! Configuration file for the `yuki` binary.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use yuki_core::TunnelConfig;
use yuki_tun::InterfaceConfig;

/// Yuki configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,
    /// Virtual interface settings
    #[serde(default)]
    pub interface: InterfaceSettings,
    /// Tunnel timers and limits
    #[serde(default)]
    pub tunnel: TunnelSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TLS listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// PEM certificate chain
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,
    /// PEM private key
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// Client registry
    #[serde(default = "default_clients_file")]
    pub clients_file: PathBuf,
    /// Seconds between reconciling the running server with the registry file
    #[serde(default = "default_registry_sync")]
    pub registry_sync_secs: u64,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address, `host:port`
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Name expected in the server certificate
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Client id
    #[serde(default)]
    pub client_id: String,
    /// Client secret
    #[serde(default)]
    pub client_secret: String,
    /// PEM bundle of trusted roots for the server certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    /// Accept any server certificate
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Tunnel address of this client
    #[serde(default = "default_client_address")]
    pub address: Ipv4Addr,
    /// Server's tunnel address, used as the gateway for split default routes
    #[serde(default = "default_client_gateway")]
    pub gateway: Ipv4Addr,
    /// Reconnect after the tunnel drops
    #[serde(default = "default_true")]
    pub reconnect: bool,
    /// Seconds to wait before reconnecting
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

/// Virtual interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSettings {
    /// Interface name
    #[serde(default = "default_interface_name")]
    pub name: String,
    /// Server tunnel address
    #[serde(default = "default_server_address")]
    pub address: Ipv4Addr,
    /// Tunnel netmask
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,
    /// MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

/// Tunnel timers and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Seconds between client pings
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Seconds of silence before a session is dropped
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    /// Seconds allowed for the handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Interface poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bandwidth allowance for clients without their own (0 = unlimited)
    #[serde(default)]
    pub default_max_bandwidth: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `tracing` filter directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_cert_file() -> PathBuf {
    PathBuf::from("/etc/yuki/server.crt")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("/etc/yuki/server.key")
}

fn default_clients_file() -> PathBuf {
    PathBuf::from("/etc/yuki/clients.json")
}

fn default_registry_sync() -> u64 {
    30
}

fn default_server_addr() -> String {
    "127.0.0.1:443".to_string()
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_client_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 2)
}

fn default_client_gateway() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 1)
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_interface_name() -> String {
    if cfg!(windows) {
        "Yuki Tunnel".to_string()
    } else {
        "tun0".to_string()
    }
}

fn default_server_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 1)
}

fn default_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

fn default_mtu() -> u16 {
    yuki_tun::DEFAULT_MTU
}

fn default_keepalive_interval() -> u64 {
    15
}

fn default_keepalive_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            clients_file: default_clients_file(),
            registry_sync_secs: default_registry_sync(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            server_name: default_server_name(),
            client_id: String::new(),
            client_secret: String::new(),
            ca_file: None,
            insecure_skip_verify: false,
            address: default_client_address(),
            gateway: default_client_gateway(),
            reconnect: true,
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            address: default_server_address(),
            netmask: default_netmask(),
            mtu: default_mtu(),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            default_max_bandwidth: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("yuki/config.toml")
    }

    /// Load `path` if it exists, otherwise use defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Engine configuration derived from the `[tunnel]` section.
    #[must_use]
    pub fn tunnel_config(&self) -> TunnelConfig {
        let t = &self.tunnel;
        TunnelConfig::default()
            .with_keepalive_interval(Duration::from_secs(t.keepalive_interval_secs))
            .with_keepalive_timeout(Duration::from_secs(t.keepalive_timeout_secs))
            .with_handshake_timeout(Duration::from_secs(t.handshake_timeout_secs))
            .with_poll_interval(Duration::from_millis(t.poll_interval_ms))
            .with_default_max_bandwidth(t.default_max_bandwidth)
    }

    /// Interface for the server side.
    #[must_use]
    pub fn server_interface(&self) -> InterfaceConfig {
        InterfaceConfig {
            name: self.interface.name.clone(),
            address: self.interface.address,
            netmask: self.interface.netmask,
            gateway: None,
            mtu: self.interface.mtu,
        }
    }

    /// Interface for the client side, routed through the server.
    #[must_use]
    pub fn client_interface(&self) -> InterfaceConfig {
        InterfaceConfig {
            name: self.interface.name.clone(),
            address: self.client.address,
            netmask: self.interface.netmask,
            gateway: Some(self.client.gateway),
            mtu: self.interface.mtu,
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        self.tunnel_config().validate()?;

        if self.interface.name.is_empty() {
            anyhow::bail!("Interface name must not be empty");
        }
        if self.server.registry_sync_secs == 0 {
            anyhow::bail!("server.registry_sync_secs must be greater than zero");
        }
        if self.interface.mtu < 576 {
            anyhow::bail!("MTU {} is below the IPv4 minimum of 576", self.interface.mtu);
        }

        validate_host_port(&self.client.server_addr, "Server address")?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Check the settings `yuki connect` needs.
    ///
    /// # Errors
    ///
    /// Returns an error naming the missing setting.
    pub fn validate_client(&self) -> anyhow::Result<()> {
        if self.client.client_id.is_empty() || self.client.client_secret.is_empty() {
            anyhow::bail!("client.client_id and client.client_secret must be set");
        }
        if self.client.ca_file.is_none() && !self.client.insecure_skip_verify {
            anyhow::bail!("client.ca_file must be set unless client.insecure_skip_verify = true");
        }
        Ok(())
    }
}

fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!("{name} '{addr}' missing port (expected format: host:port)");
    };

    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("{name} '{addr}' has invalid port: {port}"))?;
    if port == 0 {
        anyhow::bail!("{name} '{addr}' has invalid port: 0");
    }
    if host.is_empty() {
        anyhow::bail!("{name} '{addr}' has empty hostname");
    }
    Ok(())
}
