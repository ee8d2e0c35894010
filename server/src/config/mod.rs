//! Server configuration

use anyhow::{Context, Result};
use protocol::{
    crypto, DEFAULT_DIAL_INITIAL_DELAY, DEFAULT_DIAL_INTERVAL, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PORT,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// On-disk configuration file layout
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub network: NetworkSection,
}

/// `[network]` table as written by the operator
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_true")]
    pub encryption: bool,
    #[serde(default = "default_server_id")]
    pub server_id: String,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default = "default_dial_initial_delay_ms")]
    pub dial_initial_delay_ms: u64,
    #[serde(default = "default_dial_interval_ms")]
    pub dial_interval_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            enabled: false,
            key: None,
            port: default_port(),
            bind_address: default_bind_address(),
            encryption: true,
            server_id: default_server_id(),
            allowed_ips: Vec::new(),
            dial_initial_delay_ms: default_dial_initial_delay_ms(),
            dial_interval_ms: default_dial_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            servers: Vec::new(),
        }
    }
}

/// `[[network.servers]]` entry, `address` is `host:port`
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub address: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_server_id() -> String {
    "server".to_string()
}

fn default_dial_initial_delay_ms() -> u64 {
    DEFAULT_DIAL_INITIAL_DELAY.as_millis() as u64
}

fn default_dial_interval_ms() -> u64 {
    DEFAULT_DIAL_INTERVAL.as_millis() as u64
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64
}

/// A statically configured peer to dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServer {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl RemoteServer {
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Resolved network configuration, immutable once built
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub enabled: bool,
    pub key: String,
    pub port: u16,
    pub bind_address: String,
    pub encryption: bool,
    pub server_id: String,
    /// Advisory only: unknown addresses are logged, not refused
    pub allowed_ips: HashSet<IpAddr>,
    pub servers: Vec<RemoteServer>,
    pub dial_initial_delay: Duration,
    pub dial_interval: Duration,
    /// Unauthenticated connections are closed after this long
    pub handshake_timeout: Duration,
}

impl NetworkConfig {
    /// Enabled, encrypted config with no peers; mostly for embedding hosts and tests
    pub fn new(server_id: impl Into<String>, key: impl Into<String>, port: u16) -> Self {
        Self {
            enabled: true,
            key: key.into(),
            port,
            bind_address: default_bind_address(),
            encryption: true,
            server_id: server_id.into(),
            allowed_ips: HashSet::new(),
            servers: Vec::new(),
            dial_initial_delay: DEFAULT_DIAL_INITIAL_DELAY,
            dial_interval: DEFAULT_DIAL_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_peer(mut self, id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        self.servers.push(RemoteServer {
            id: id.into(),
            host: host.into(),
            port,
        });
        self
    }

    pub fn with_dial_schedule(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.dial_initial_delay = initial_delay;
        self.dial_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_encryption(mut self, encryption: bool) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    /// Resolve the `[network]` table; bad peer and IP entries are skipped
    pub fn from_section(section: &NetworkSection) -> Result<Self> {
        let server_id = section.server_id.trim().to_string();
        if server_id.is_empty() {
            anyhow::bail!("network.server_id must not be empty");
        }

        let key = section
            .key
            .clone()
            .filter(|k| !k.is_empty())
            .context("network.key is missing")?;

        let mut servers: Vec<RemoteServer> = Vec::with_capacity(section.servers.len());
        for entry in &section.servers {
            // Handshakes announce trimmed ids, so configured ids must match
            let id = entry.id.trim();
            if id.is_empty() {
                warn!("Skipping network server with empty id (address {})", entry.address);
                continue;
            }
            if id == server_id {
                warn!("Skipping network server {}: it has this server's own id", id);
                continue;
            }
            if servers.iter().any(|s| s.id == id) {
                warn!("Skipping duplicate network server {}", id);
                continue;
            }
            match parse_address(&entry.address) {
                Ok((host, port)) => servers.push(RemoteServer {
                    id: id.to_string(),
                    host,
                    port,
                }),
                Err(e) => warn!("Skipping network server {}: {}", id, e),
            }
        }

        let mut allowed_ips = HashSet::new();
        for raw in &section.allowed_ips {
            match raw.trim().parse::<IpAddr>() {
                Ok(ip) => {
                    allowed_ips.insert(ip);
                }
                Err(_) => warn!("Ignoring invalid network.allowed_ips entry: {}", raw),
            }
        }

        Ok(Self {
            enabled: section.enabled,
            key,
            port: section.port,
            bind_address: section.bind_address.clone(),
            encryption: section.encryption,
            server_id,
            allowed_ips,
            servers,
            dial_initial_delay: Duration::from_millis(section.dial_initial_delay_ms),
            dial_interval: Duration::from_millis(section.dial_interval_ms.max(1)),
            handshake_timeout: Duration::from_millis(section.handshake_timeout_ms.max(1)),
        })
    }
}

/// Split `host:port` (IPv6 hosts in brackets)
pub fn parse_address(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .trim()
        .rsplit_once(':')
        .with_context(|| format!("address '{}' is not in host:port form", address))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        anyhow::bail!("address '{}' has an empty host", address);
    }

    let port: u16 = port
        .parse()
        .with_context(|| format!("address '{}' has an invalid port", address))?;
    if port == 0 {
        anyhow::bail!("address '{}' has port 0", address);
    }

    Ok((host.to_string(), port))
}

/// Fully loaded configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub network: NetworkConfig,
}

impl Config {
    /// Load the config file, generating and persisting `network.key` if absent
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut file: ConfigFile = toml::from_str(&content)
            .context("Failed to parse config file")?;

        if file.network.key.as_deref().is_none_or(str::is_empty) {
            let key = crypto::generate_secret();
            persist_key(path, &content, &key)?;
            info!("Generated a new network key and saved it to {:?}", path);
            file.network.key = Some(key);
        }

        Ok(Self {
            network: NetworkConfig::from_section(&file.network)?,
        })
    }
}

/// Write `network.key` into the file, keeping every other table and key
///
/// Comments are not preserved by the rewrite.
fn persist_key(path: &Path, content: &str, key: &str) -> Result<()> {
    let mut table: toml::Table = content.parse().context("Failed to parse config file")?;
    let network = table
        .entry("network")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()))
        .as_table_mut()
        .context("network must be a table")?;
    network.insert("key".to_string(), toml::Value::String(key.to_string()));

    let rendered = toml::to_string_pretty(&table).context("Failed to render config file")?;
    std::fs::write(path, rendered)
        .with_context(|| format!("Failed to write generated network key to {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
[network]
enabled = true
key = "s3cret"
port = 25101
encryption = true
server_id = "A"
allowed_ips = ["127.0.0.1", "not-an-ip"]

[[network.servers]]
id = "B"
address = "127.0.0.1:25102"

[[network.servers]]
id = "C"
address = "no-port"

[[network.servers]]
id = "D"
address = "[::1]:25104"
"#,
        );

        let config = Config::load(file.path()).unwrap();
        let network = config.network;
        assert!(network.enabled);
        assert_eq!(network.key, "s3cret");
        assert_eq!(network.port, 25101);
        assert_eq!(network.server_id, "A");
        assert_eq!(network.allowed_ips.len(), 1);
        assert_eq!(
            network.servers,
            vec![
                RemoteServer { id: "B".into(), host: "127.0.0.1".into(), port: 25102 },
                RemoteServer { id: "D".into(), host: "::1".into(), port: 25104 },
            ]
        );
        assert_eq!(network.servers[1].address(), "[::1]:25104");
        assert_eq!(network.dial_interval, DEFAULT_DIAL_INTERVAL);
    }

    #[test]
    fn test_missing_key_is_generated_and_persisted() {
        let file = write_config(
            r#"
[network]
enabled = true
server_id = "lobby"
max_peers = 8

[discord]
token = "abc"
"#,
        );

        let first = Config::load(file.path()).unwrap();
        assert_eq!(first.network.key.len(), 36);

        let rewritten: toml::Table = std::fs::read_to_string(file.path()).unwrap().parse().unwrap();
        let network = rewritten["network"].as_table().unwrap();
        assert_eq!(network["key"].as_str(), Some(first.network.key.as_str()));
        assert_eq!(network["max_peers"].as_integer(), Some(8));
        assert_eq!(network["server_id"].as_str(), Some("lobby"));
        assert!(!network.contains_key("port"), "defaults must not be written out");
        assert_eq!(rewritten["discord"]["token"].as_str(), Some("abc"));

        let second = Config::load(file.path()).unwrap();
        assert_eq!(second.network.key, first.network.key);
    }

    #[test]
    fn test_defaults() {
        let file = write_config("[network]\nkey = \"k\"\n");
        let network = Config::load(file.path()).unwrap().network;
        assert!(!network.enabled);
        assert!(network.encryption);
        assert_eq!(network.port, DEFAULT_PORT);
        assert_eq!(network.dial_initial_delay, DEFAULT_DIAL_INITIAL_DELAY);
        assert_eq!(network.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert!(network.servers.is_empty());
    }

    #[test]
    fn test_key_generated_without_network_table() {
        let file = write_config("[discord]\ntoken = \"abc\"\n");
        let config = Config::load(file.path()).unwrap();

        let rewritten: toml::Table = std::fs::read_to_string(file.path()).unwrap().parse().unwrap();
        assert_eq!(rewritten["network"]["key"].as_str(), Some(config.network.key.as_str()));
        assert_eq!(rewritten["discord"]["token"].as_str(), Some("abc"));
    }

    #[test]
    fn test_handshake_timeout_from_file() {
        let file = write_config("[network]\nkey = \"k\"\nhandshake_timeout_ms = 750\n");
        let network = Config::load(file.path()).unwrap().network;
        assert_eq!(network.handshake_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_peer_ids_are_trimmed() {
        let section = NetworkSection {
            key: Some("k".into()),
            server_id: "A".into(),
            servers: vec![
                ServerEntry { id: " B ".into(), address: "127.0.0.1:2".into() },
                ServerEntry { id: "B".into(), address: "127.0.0.1:3".into() },
                ServerEntry { id: " A".into(), address: "127.0.0.1:4".into() },
            ],
            ..NetworkSection::default()
        };
        let network = NetworkConfig::from_section(&section).unwrap();
        assert_eq!(
            network.servers,
            vec![RemoteServer { id: "B".into(), host: "127.0.0.1".into(), port: 2 }]
        );
    }

    #[test]
    fn test_own_and_duplicate_peers_skipped() {
        let section = NetworkSection {
            key: Some("k".into()),
            server_id: "A".into(),
            servers: vec![
                ServerEntry { id: "A".into(), address: "127.0.0.1:1".into() },
                ServerEntry { id: "B".into(), address: "127.0.0.1:2".into() },
                ServerEntry { id: "B".into(), address: "127.0.0.1:3".into() },
            ],
            ..NetworkSection::default()
        };
        let network = NetworkConfig::from_section(&section).unwrap();
        assert_eq!(network.servers.len(), 1);
        assert_eq!(network.servers[0].port, 2);
    }

    #[test]
    fn test_empty_server_id_rejected() {
        let section = NetworkSection {
            key: Some("k".into()),
            server_id: "  ".into(),
            ..NetworkSection::default()
        };
        assert!(NetworkConfig::from_section(&section).is_err());
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("mc.example.org:25565").unwrap(), ("mc.example.org".into(), 25565));
        assert!(parse_address("host:").is_err());
        assert!(parse_address(":25565").is_err());
        assert!(parse_address("host:70000").is_err());
        assert!(parse_address("host:0").is_err());
    }
}
