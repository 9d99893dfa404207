use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

use crate::ast::PlanLimits;
use crate::eval::security::SecurityOptions;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid known-type pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("Invalid config value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Session id sent by the client. A fresh UUID is used when empty.
    #[serde(default)]
    pub client_id: String,

    #[serde(default = "default_handshake_timeout", with = "duration_ms")]
    pub handshake_timeout: Duration,

    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,

    #[serde(default = "default_true")]
    pub enable_duplex: bool,

    /// Relay server-side query faults to the client. They are always
    /// recorded locally.
    #[serde(default = "default_true")]
    pub send_errors_to_client: bool,

    /// Limit for one duplex request; zero waits indefinitely.
    #[serde(default = "default_response_timeout", with = "duration_ms")]
    pub response_timeout: Duration,

    /// Deepest nesting accepted in an inbound plan.
    #[serde(default = "default_max_plan_depth")]
    pub max_plan_depth: usize,

    #[serde(default = "default_max_plan_nodes")]
    pub max_plan_nodes: usize,

    #[serde(default)]
    pub security: SecurityOptions,

    #[serde(default)]
    pub known_types: KnownTypesConfig,
}

/// Extra types and members treated as known on both sides, on top of the
/// built-in set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KnownTypesConfig {
    #[serde(default)]
    pub names: Vec<String>,
    /// Regular expressions matched against whole type names.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// `Type.Member` keys allowed even when the type is not known.
    #[serde(default)]
    pub members: Vec<String>,
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    let config = serde_json::from_str(s)?;
    Ok(config)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_frame_length() -> usize {
    16 * 1024 * 1024
}
fn default_true() -> bool {
    true
}
fn default_response_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_max_plan_depth() -> usize {
    256
}
fn default_max_plan_nodes() -> usize {
    100_000
}

/// Serializes a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            handshake_timeout: default_handshake_timeout(),
            max_frame_length: default_max_frame_length(),
            enable_duplex: default_true(),
            send_errors_to_client: default_true(),
            response_timeout: default_response_timeout(),
            max_plan_depth: default_max_plan_depth(),
            max_plan_nodes: default_max_plan_nodes(),
            security: SecurityOptions::default(),
            known_types: KnownTypesConfig::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let config: Self = from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.client_id.len() > crate::protocol::handshake::MAX_SESSION_ID_LENGTH {
            return Err(ConfigError::InvalidValue {
                field: "client_id".to_string(),
                message: format!("longer than {} bytes", crate::protocol::handshake::MAX_SESSION_ID_LENGTH),
            });
        }
        if self.max_frame_length < 16 {
            return Err(ConfigError::InvalidValue {
                field: "max_frame_length".to_string(),
                message: "must be at least 16 bytes".to_string(),
            });
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "handshake_timeout".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.max_plan_depth == 0 || self.max_plan_nodes == 0 {
            return Err(ConfigError::InvalidValue {
                field: if self.max_plan_depth == 0 { "max_plan_depth" } else { "max_plan_nodes" }
                    .to_string(),
                message: "must be positive".to_string(),
            });
        }
        for pattern in &self.known_types.patterns {
            regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn plan_limits(&self) -> PlanLimits {
        PlanLimits::new(self.max_plan_depth, self.max_plan_nodes)
    }

    /// Duplex request limit, `None` when unlimited.
    pub fn response_timeout(&self) -> Option<Duration> {
        (!self.response_timeout.is_zero()).then_some(self.response_timeout)
    }
}

impl TryFrom<&str> for ProtocolConfig {
    type Error = ConfigError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let config: Self = from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = ProtocolConfig::try_from("{}").unwrap();
        assert_eq!(config, ProtocolConfig::default());
        assert_eq!(config.response_timeout(), Some(Duration::from_secs(60)));
        assert!(config.security.allow_loop);
    }

    #[test]
    fn test_partial_config() {
        let config = ProtocolConfig::try_from(
            r#"{
                "client_id": "reporting",
                "handshake_timeout": 250,
                "response_timeout": 0,
                "send_errors_to_client": false,
                "security": { "allow_loop": false },
                "known_types": { "names": ["Money"], "patterns": ["^Report\\w*$"] }
            }"#,
        )
        .unwrap();
        assert_eq!(config.client_id, "reporting");
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
        assert_eq!(config.response_timeout(), None);
        assert!(!config.send_errors_to_client);
        assert!(!config.security.allow_loop);
        assert!(config.security.allow_block);
        assert_eq!(config.known_types.names, vec!["Money".to_string()]);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let result = ProtocolConfig::try_from(r#"{ "known_types": { "patterns": ["(unclosed"] } }"#);
        assert!(matches!(result, Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn test_plan_limits() {
        let config = ProtocolConfig::try_from(r#"{ "max_plan_depth": 12 }"#).unwrap();
        assert_eq!(config.plan_limits(), PlanLimits::new(12, 100_000));

        let result = ProtocolConfig::try_from(r#"{ "max_plan_nodes": 0 }"#);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field, .. }) if field == "max_plan_nodes"
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "max_frame_length": 4096 }}"#).unwrap();
        let config = ProtocolConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_frame_length, 4096);
        assert!(config.enable_duplex);
    }
}
