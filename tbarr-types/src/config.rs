//! Configuration schema (§6). Parsing the file this deserializes from is
//! an excluded external collaborator ("configuration file parsing") -- the
//! core only defines and consumes the shape below.

use serde::{Deserialize, Serialize};

fn default_block_size() -> usize {
    65536
}

fn default_buffer_size_mb() -> usize {
    64
}

fn default_write_retries() -> u32 {
    3
}

fn default_operator_change_timeout_minutes() -> u32 {
    30
}

fn default_checkpoint_interval_seconds() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub name: String,
    pub device_path: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output_path: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output_path: None,
        }
    }
}

/// Recognized configuration options (§6 table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeBackArrConfig {
    pub default_device: Option<String>,
    #[serde(default)]
    pub drives: Vec<DriveConfig>,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_buffer_size_mb")]
    pub buffer_size_mb: usize,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default)]
    pub verify_after_write: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_operator_change_timeout_minutes")]
    pub operator_change_timeout_minutes: u32,
    #[serde(default = "default_checkpoint_interval_seconds")]
    pub checkpoint_interval_seconds: u32,
}

impl Default for TapeBackArrConfig {
    fn default() -> Self {
        Self {
            default_device: None,
            drives: Vec::new(),
            block_size: default_block_size(),
            buffer_size_mb: default_buffer_size_mb(),
            write_retries: default_write_retries(),
            verify_after_write: false,
            logging: LoggingConfig::default(),
            operator_change_timeout_minutes: default_operator_change_timeout_minutes(),
            checkpoint_interval_seconds: default_checkpoint_interval_seconds(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = TapeBackArrConfig::default();
        assert_eq!(cfg.block_size, 65536);
        assert_eq!(cfg.operator_change_timeout_minutes, 30);
        assert_eq!(cfg.checkpoint_interval_seconds, 10);
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let json = r#"{"default_device": "/dev/nst0", "drives": []}"#;
        let cfg: TapeBackArrConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.default_device.as_deref(), Some("/dev/nst0"));
        assert_eq!(cfg.write_retries, 3);
    }
}
