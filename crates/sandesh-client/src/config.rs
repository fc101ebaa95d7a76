//! Client configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sandesh_transport::tcp::TcpOptions;

use crate::error::{ClientError, Result};
use crate::message::SandeshLevel;
use crate::queue::{DEFAULT_MAX_QUEUE_LEN, MAX_WORK_LOAD};
use crate::session::DEFAULT_WATERMARKS;

/// Paths to the TLS material for collector connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFiles {
    /// Client private key.
    pub keyfile: PathBuf,
    /// Client certificate chain.
    pub certfile: PathBuf,
    /// CA certificate used to verify the collector.
    pub ca_cert: PathBuf,
}

/// Generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandeshConfig {
    /// Generator host identity.
    pub source_id: String,
    /// Generator module name; must be non-empty for messages to be sent.
    pub module: String,
    /// Generator instance id.
    pub instance_id: String,
    /// Generator node type.
    pub node_type: String,
    /// Candidate collector endpoints, `host:port`.
    pub collectors: Vec<String>,
    /// Optional UDP stats daemon mirroring UVE traffic.
    pub stats_collector: Option<String>,
    /// TLS material; plain TCP when absent.
    pub tls: Option<TlsFiles>,
    /// Idle-hold before a reconnect attempt, milliseconds. Zero fires the
    /// expiry immediately.
    pub idle_hold_ms: u64,
    /// Bound on a whole connection attempt, milliseconds.
    pub connect_timeout_ms: u64,
    /// Socket-level TCP connect timeout, milliseconds.
    pub tcp_connect_timeout_ms: u64,
    /// Bound on queued send items.
    pub send_queue_limit: usize,
    /// Items the drain worker processes per scheduling slice.
    pub drain_batch: usize,
    /// System-message rate limit, messages per second per type. Zero
    /// disables system-message sending entirely.
    pub system_rate_limit: u32,
    /// TCP keepalive idle time, milliseconds.
    pub keepalive_idle_ms: u64,
    /// TCP keepalive probe interval, milliseconds.
    pub keepalive_interval_ms: u64,
    /// TCP keepalive probe count.
    pub keepalive_probes: u32,
    /// DSCP value for collector traffic (0 disables marking).
    pub dscp: u8,
    /// Send-queue watermark table: (byte threshold, level, is_high).
    pub watermarks: Vec<(usize, SandeshLevel, bool)>,
}

impl Default for SandeshConfig {
    fn default() -> Self {
        Self {
            source_id: String::new(),
            module: String::new(),
            instance_id: "0".into(),
            node_type: String::new(),
            collectors: Vec::new(),
            stats_collector: None,
            tls: None,
            idle_hold_ms: 4_000,
            connect_timeout_ms: 30_000,
            tcp_connect_timeout_ms: 5_000,
            send_queue_limit: DEFAULT_MAX_QUEUE_LEN,
            drain_batch: MAX_WORK_LOAD,
            system_rate_limit: 100,
            keepalive_idle_ms: 15_000,
            keepalive_interval_ms: 3_000,
            keepalive_probes: 5,
            dscp: 0,
            watermarks: DEFAULT_WATERMARKS.to_vec(),
        }
    }
}

impl SandeshConfig {
    /// Loads a configuration from a TOML or JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: SandeshConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: SandeshConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Rejects configurations the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        for collector in &self.collectors {
            if !collector.contains(':') {
                return Err(ClientError::InvalidConfig(format!(
                    "collector endpoint [{}] is not host:port",
                    collector
                )));
            }
        }
        if self.send_queue_limit == 0 {
            return Err(ClientError::InvalidConfig(
                "send_queue_limit must be non-zero".into(),
            ));
        }
        if self.drain_batch == 0 {
            return Err(ClientError::InvalidConfig(
                "drain_batch must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Socket options derived from this configuration.
    pub fn tcp_options(&self) -> TcpOptions {
        TcpOptions {
            connect_timeout: Duration::from_millis(self.tcp_connect_timeout_ms),
            keepalive_idle: Duration::from_millis(self.keepalive_idle_ms),
            keepalive_interval: Duration::from_millis(self.keepalive_interval_ms),
            keepalive_probes: self.keepalive_probes,
            dscp: self.dscp,
        }
    }

    /// Idle-hold duration before a reconnect attempt.
    pub fn idle_hold(&self) -> Duration {
        Duration::from_millis(self.idle_hold_ms)
    }

    /// Bound on a whole connection attempt.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = SandeshConfig::default();
        assert_eq!(config.idle_hold_ms, 4_000);
        assert_eq!(config.connect_timeout_ms, 30_000);
        assert_eq!(config.send_queue_limit, 1024);
        assert_eq!(config.drain_batch, 16);
        assert_eq!(config.system_rate_limit, 100);
        assert!(config.collectors.is_empty());
        assert!(config.tls.is_none());
        assert_eq!(config.watermarks.len(), DEFAULT_WATERMARKS.len());
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let config = SandeshConfig {
            collectors: vec!["not-an-endpoint".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(SandeshConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(
            file,
            "{}",
            serde_json::json!({
                "source_id": "host-1",
                "module": "vrouter-agent",
                "collectors": ["10.0.0.1:8086", "10.0.0.2:8086"],
                "idle_hold_ms": 1000
            })
        )
        .unwrap();

        let config = SandeshConfig::from_file(file.path()).unwrap();
        assert_eq!(config.source_id, "host-1");
        assert_eq!(config.collectors.len(), 2);
        assert_eq!(config.idle_hold_ms, 1000);
        // Unspecified fields keep their defaults.
        assert_eq!(config.connect_timeout_ms, 30_000);
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = SandeshConfig {
            source_id: "host-2".into(),
            module: "control-node".into(),
            collectors: vec!["192.168.1.1:8086".into()],
            dscp: 46,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let decoded: SandeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.source_id, "host-2");
        assert_eq!(decoded.dscp, 46);
        assert_eq!(decoded.collectors, config.collectors);
    }
}
