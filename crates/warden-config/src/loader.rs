use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;
use warden_domain::validate::parse_pubkey_line;

use crate::error::ConfigError;
use crate::raw::RawConfig;

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_RECOVERY_TOKEN_DURATION_SECS: i64 = 86_400;
const DEFAULT_HISTORY_DURATION_SECS: i64 = 30 * 24 * 3600;

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    pub bind: SocketAddr,
    /// Absent means the in-memory store (ephemeral, test / demo runs).
    pub store_path: Option<PathBuf>,
    pub instance_uuid: Uuid,
    pub poll_interval: Duration,
    pub recovery_token_duration_secs: i64,
    pub history_duration_secs: i64,
    /// Absent means the local stub executor.
    pub node_agent_url: Option<String>,
    pub admin_keys: Vec<String>,
    /// Bucket-name prefix for scratch instances sharing a database.
    pub test_bucket_prefix: Option<String>,
    pub log_level: String,
}

impl Default for WardenConfig {
    fn default() -> Self {
        resolve(RawConfig::default()).expect("defaults are valid")
    }
}

/// Load the config file at `path` and resolve defaults.
pub fn load(path: &Path) -> Result<WardenConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawConfig = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;
    debug!("loaded config from {}", path.display());
    resolve(raw)
}

fn resolve(raw: RawConfig) -> Result<WardenConfig, ConfigError> {
    let bind: SocketAddr = raw
        .bind
        .as_deref()
        .unwrap_or(DEFAULT_BIND)
        .parse()
        .map_err(|_| ConfigError::Invalid {
            field: "bind".into(),
            message: format!("'{}' is not host:port", raw.bind.as_deref().unwrap_or("")),
        })?;

    let instance_uuid = match raw.instance_uuid.as_deref() {
        Some(s) => Uuid::parse_str(s).map_err(|_| ConfigError::Invalid {
            field: "instance_uuid".into(),
            message: format!("'{}' is not a UUID", s),
        })?,
        None => Uuid::new_v4(),
    };

    for (i, line) in raw.admin_keys.iter().enumerate() {
        parse_pubkey_line(line).map_err(|e| ConfigError::Invalid {
            field: format!("admin_keys[{}]", i),
            message: e.to_string(),
        })?;
    }

    for (field, value) in [
        ("recovery_token_duration_secs", raw.recovery_token_duration_secs),
        ("history_duration_secs", raw.history_duration_secs),
    ] {
        if let Some(v) = value {
            if v <= 0 {
                return Err(ConfigError::Invalid {
                    field: field.into(),
                    message: "must be positive".into(),
                });
            }
        }
    }

    Ok(WardenConfig {
        bind,
        store_path: raw.store_path.map(PathBuf::from),
        instance_uuid,
        poll_interval: Duration::from_secs(
            raw.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS).max(1),
        ),
        recovery_token_duration_secs: raw
            .recovery_token_duration_secs
            .unwrap_or(DEFAULT_RECOVERY_TOKEN_DURATION_SECS),
        history_duration_secs: raw
            .history_duration_secs
            .unwrap_or(DEFAULT_HISTORY_DURATION_SECS),
        node_agent_url: raw.node_agent_url,
        admin_keys: raw.admin_keys,
        test_bucket_prefix: raw.test_bucket_prefix,
        log_level: raw.log_level.unwrap_or_else(|| "info".to_string()),
    })
}
