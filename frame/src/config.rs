//! Build-time constants the spec marks "default", loaded from TOML.
//!
//! Grounded on the same `serdeconv`/`serde` pattern `server/lib/flux`'s
//! logging config uses, generalized to every tunable spec §3-§5 names.
//! Command-line parsing stays out of scope (spec §1's Non-goals):
//! `Config` is built with `Config::default()` or loaded from a file an
//! embedder points at.

use serde_derive::{Deserialize, Serialize};

/// Identity/mutex-pool shape (spec §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub service_bits: u32,
    pub mut_rows_bits: u32,
    pub mut_cols_bits: u32,
    pub objs_per_mut_bits: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig {
            service_bits: crate::identity::SERVICE_BITS,
            mut_rows_bits: 8,
            mut_cols_bits: 8,
            objs_per_mut_bits: 6,
        }
    }
}

/// Scheduler admission policy (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub capacity_per_selector: usize,
    pub max_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            capacity_per_selector: 1024,
            max_workers: 16,
        }
    }
}

/// IPC buffer, window, retry, and keep-alive tuning (spec §5, §6, §10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Maximum encoded buffer size in bytes, spec §5's datagram cap.
    pub max_buffer_size: usize,
    /// Number of in-flight unacked buffers a session keeps outstanding.
    pub send_window: usize,
    pub recv_window: usize,
    /// Retry caps, spec §10 item 3: data buffers vs. connect buffers.
    pub data_retransmit_count: u32,
    pub connect_retransmit_count: u32,
    /// Windowing mask for the retransmit timer queue, spec §10 item 3.
    pub refresh_index: u32,
    pub keep_alive_interval_ms: u64,
    pub session_idle_timeout_ms: u64,
    /// Talker pool caps, spec §4.9.
    pub max_talkers: usize,
    pub sessions_per_talker: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        IpcConfig {
            max_buffer_size: 4096,
            send_window: 8,
            recv_window: 8,
            data_retransmit_count: 8,
            connect_retransmit_count: 16,
            refresh_index: 127,
            keep_alive_interval_ms: 10_000,
            session_idle_timeout_ms: 60_000,
            max_talkers: 4,
            sessions_per_talker: 4096,
        }
    }
}

/// `sloggers`-compatible logging configuration, serialized back out to the
/// TOML snippet `sloggers::LoggerConfig` parses (spec §0.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `"terminal"` or `"file"`.
    pub sink: String,
    /// `"trace"`, `"debug"`, `"info"`, `"warning"`, `"error"`, `"critical"`.
    pub level: String,
    /// `"stdout"` or `"stderr"`, only meaningful for the terminal sink.
    pub destination: String,
    /// File path, only meaningful for the file sink.
    pub path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            sink: "terminal".to_string(),
            level: "debug".to_string(),
            destination: "stderr".to_string(),
            path: None,
        }
    }
}

impl LoggingConfig {
    pub fn to_toml(&self) -> String {
        match self.sink.as_str() {
            "file" => format!(
                "type = \"file\"\nlevel = \"{}\"\npath = \"{}\"\n",
                self.level,
                self.path.as_deref().unwrap_or("frame.log")
            ),
            _ => format!(
                "type = \"terminal\"\nlevel = \"{}\"\ndestination = \"{}\"\n",
                self.level, self.destination
            ),
        }
    }
}

/// Top-level configuration for a process embedding this crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub scheduler: SchedulerConfig,
    pub ipc: IpcConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and merge a TOML file over [`Config::default`]'s values.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Config, serdeconv::Error> {
        serdeconv::from_toml_file(path.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_spec_constants() {
        let config = Config::default();
        assert_eq!(config.identity.service_bits, 8);
        assert_eq!(config.ipc.data_retransmit_count, 8);
        assert_eq!(config.ipc.connect_retransmit_count, 16);
        assert_eq!(config.ipc.refresh_index, 127);
    }

    #[test]
    fn logging_config_renders_valid_toml_shape() {
        let config = LoggingConfig::default();
        let toml = config.to_toml();
        assert!(toml.contains("type = \"terminal\""));
        assert!(toml.contains("level = \"debug\""));
    }
}
