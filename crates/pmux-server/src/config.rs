//! Server configuration: TOML file + CLI overrides.

use pmux_core::{PmuxError, PmuxResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub panes: PanesSection,
    #[serde(default)]
    pub peers: PeersSection,
    /// Environment for every spawned command, layered over the defaults.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
        }
    }
}

/// `[panes]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PanesSection {
    /// Replay history per pane, in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Output chunks a pane may queue before its reader blocks.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long one subscriber may take to accept a chunk before it is dropped.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for PanesSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            queue_capacity: default_queue_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

/// `[peers]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PeersSection {
    /// How long a server-initiated request waits for the client's ack.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Default for PeersSection {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7777
}
fn default_buffer_size() -> usize {
    100_000
}
fn default_queue_capacity() -> usize {
    4096
}
fn default_send_timeout_ms() -> u64 {
    5000
}
fn default_ack_timeout_ms() -> u64 {
    3000
}
fn default_env() -> HashMap<String, String> {
    HashMap::from([
        ("TERM".to_string(), "xterm".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
    ])
}

/// Settings every pane is created with.
#[derive(Debug, Clone)]
pub struct PaneSettings {
    pub buffer_size: usize,
    pub queue_capacity: usize,
    pub send_timeout: Duration,
    pub env: HashMap<String, String>,
}

impl Default for PaneSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            queue_capacity: default_queue_capacity(),
            send_timeout: Duration::from_millis(default_send_timeout_ms()),
            env: default_env(),
        }
    }
}

/// Settings every peer is created with.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub ack_timeout: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(default_ack_timeout_ms()),
        }
    }
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: IpAddr,
    pub port: u16,
    pub panes: PaneSettings,
    pub peers: PeerSettings,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_listen: Option<&str>,
        cli_port: Option<u16>,
        cli_buffer_size: Option<usize>,
    ) -> PmuxResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli_listen, cli_port, cli_buffer_size)
    }

    /// Apply CLI overrides to a parsed file. The file's `[env]` entries are
    /// added to the default environment, replacing same-named defaults.
    fn resolve(
        file_config: ConfigFile,
        cli_listen: Option<&str>,
        cli_port: Option<u16>,
        cli_buffer_size: Option<usize>,
    ) -> PmuxResult<Self> {
        let listen_str = cli_listen
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.listen);
        let listen = listen_str
            .parse::<IpAddr>()
            .map_err(|e| PmuxError::Config(format!("bad listen address {listen_str:?}: {e}")))?;
        let port = cli_port.unwrap_or(file_config.server.port);
        let buffer_size = cli_buffer_size.unwrap_or(file_config.panes.buffer_size);
        if file_config.panes.queue_capacity == 0 {
            return Err(PmuxError::Config("panes.queue_capacity must be positive".into()));
        }
        if file_config.panes.send_timeout_ms == 0 {
            return Err(PmuxError::Config("panes.send_timeout_ms must be positive".into()));
        }
        let mut env = default_env();
        env.extend(file_config.env);

        Ok(Self {
            listen,
            port,
            panes: PaneSettings {
                buffer_size,
                queue_capacity: file_config.panes.queue_capacity,
                send_timeout: Duration::from_millis(file_config.panes.send_timeout_ms),
                env,
            },
            peers: PeerSettings {
                ack_timeout: Duration::from_millis(file_config.peers.ack_timeout_ms),
            },
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }
}

fn parse(content: &str) -> PmuxResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| PmuxError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.server.port, 7777);
        assert_eq!(cfg.server.listen, "0.0.0.0");
        assert_eq!(cfg.panes.buffer_size, 100_000);
        assert_eq!(cfg.panes.queue_capacity, 4096);
        assert_eq!(cfg.panes.send_timeout_ms, 5000);
        assert!(cfg.env.is_empty());

        let resolved = ServerConfig::resolve(cfg, None, None, None).unwrap();
        assert_eq!(resolved.panes.env.get("TERM").map(String::as_str), Some("xterm"));
        assert_eq!(resolved.panes.send_timeout, Duration::from_secs(5));
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = parse(
            r#"
            [server]
            port = 9000
            [panes]
            buffer_size = 512
            [env]
            LANG = "C.UTF-8"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.panes.buffer_size, 512);
        assert_eq!(cfg.panes.queue_capacity, 4096);
        assert_eq!(cfg.env.len(), 1);
    }

    #[test]
    fn env_table_is_merged_over_defaults() {
        let cfg = parse(
            r#"
            [env]
            LANG = "C.UTF-8"
            TERM = "xterm-256color"
            "#,
        )
        .unwrap();
        let env = ServerConfig::resolve(cfg, None, None, None).unwrap().panes.env;
        assert_eq!(env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert_eq!(env.get("TERM").map(String::as_str), Some("xterm-256color"));
        assert_eq!(env.get("COLORTERM").map(String::as_str), Some("truecolor"));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn zero_send_timeout_is_rejected() {
        let cfg = parse("[panes]\nsend_timeout_ms = 0").unwrap();
        assert!(matches!(
            ServerConfig::resolve(cfg, None, None, None),
            Err(PmuxError::Config(_))
        ));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        assert!(matches!(parse("[server"), Err(PmuxError::Config(_))));
    }

    #[test]
    fn missing_file_and_cli_overrides() {
        let missing = std::env::temp_dir().join("pmux-no-such-config.toml");
        let cfg = ServerConfig::load(Some(&missing), Some("127.0.0.1"), Some(1234), Some(64)).unwrap();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:1234".parse().unwrap());
        assert_eq!(cfg.panes.buffer_size, 64);
        assert!(cfg.panes.env.contains_key("TERM"));
        assert_eq!(cfg.peers.ack_timeout, Duration::from_secs(3));
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        assert!(ServerConfig::load(None, Some("not-an-ip"), None, None).is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/.pmux/config.toml"), home.join(".pmux/config.toml"));
        }
        assert_eq!(expand_tilde_str("/etc/pmux.toml"), PathBuf::from("/etc/pmux.toml"));
    }
}
