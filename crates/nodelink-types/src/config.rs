//! Configuration structures. Every field has a default so a partial (or
//! missing) `config.toml` still yields a usable node.

use crate::endpoint::Version;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0, 0);

/// Root configuration of a NodeLink node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fixed endpoint UUID. A random one is generated when unset.
    pub node_id: Option<Uuid>,
    /// Machine name used for transport selection. Falls back to the
    /// `HOSTNAME`/`COMPUTERNAME` environment variables, then `localhost`.
    pub machine_name: Option<String>,
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Communication subjects this node accepts.
    pub subjects: Vec<String>,
    /// Protocol version announced during the handshake.
    pub protocol_version: Version,
    /// Pre-shared key for authenticating Connect messages. Disabled when unset.
    pub shared_secret: Option<String>,
    /// Where incoming data transfers are written.
    pub download_dir: Option<PathBuf>,
    pub protocol: ProtocolConfig,
    pub tcp: TcpConfig,
    pub ipc: IpcConfig,
    /// Statically known peers fed to manual discovery.
    pub peers: Vec<StaticPeer>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            machine_name: None,
            log_level: "info".to_string(),
            subjects: vec!["default".to_string()],
            protocol_version: PROTOCOL_VERSION,
            shared_secret: None,
            download_dir: None,
            protocol: ProtocolConfig::default(),
            tcp: TcpConfig::default(),
            ipc: IpcConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Resolve the machine name for this node.
    pub fn resolved_machine_name(&self) -> String {
        self.machine_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| std::env::var("COMPUTERNAME").ok())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Directory for incoming data transfers.
    pub fn resolved_download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("nodelink").join("downloads"))
    }
}

/// Timing and retry knobs of the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Consecutive failed keep-alives tolerated before an endpoint is evicted.
    pub max_missed_keep_alive_signals: u32,
    /// Period of the keep-alive timer.
    pub keep_alive_interval_ms: u64,
    /// Longest quiet period before an endpoint is probed again.
    pub max_time_between_connection_confirmations_ms: u64,
    /// Default time to wait for a response.
    pub wait_for_response_timeout_ms: u64,
    /// Delivery retries after the first attempt.
    pub max_send_retries: u32,
    /// Largest inbound data transfer accepted, in bytes.
    pub max_inbound_data_bytes: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_missed_keep_alive_signals: 3,
            keep_alive_interval_ms: 1_000,
            max_time_between_connection_confirmations_ms: 60_000,
            wait_for_response_timeout_ms: 15_000,
            max_send_retries: 3,
            max_inbound_data_bytes: 1 << 30,
        }
    }
}

impl ProtocolConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms.max(1))
    }

    pub fn confirmation_interval(&self) -> Duration {
        Duration::from_millis(self.max_time_between_connection_confirmations_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_for_response_timeout_ms)
    }
}

/// Network transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub enabled: bool,
    /// Listener for messages. Port 0 picks a free port.
    pub listen_addr: String,
    /// Listener for bulk data.
    pub data_listen_addr: String,
    /// Host put into advertised addresses when listening on a wildcard IP.
    pub advertise_host: Option<String>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:0".to_string(),
            data_listen_addr: "0.0.0.0:0".to_string(),
            advertise_host: None,
        }
    }
}

/// Local inter-process transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub enabled: bool,
    /// Directory holding the socket files. Defaults to a temp subdirectory.
    pub socket_dir: Option<PathBuf>,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(unix),
            socket_dir: None,
        }
    }
}

impl IpcConfig {
    pub fn resolved_socket_dir(&self) -> PathBuf {
        self.socket_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("nodelink").join("ipc"))
    }
}

/// A peer known ahead of time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPeer {
    pub id: Uuid,
    pub machine: String,
    pub message_address: String,
    pub data_address: String,
}
